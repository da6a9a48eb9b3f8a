use thiserror::Error;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("failed to connect to hypervisor at `{uri}`: {source}")]
    Connect {
        uri: String,
        #[source]
        source: virt::error::Error,
    },

    #[error("hypervisor operation `{operation}` failed: {source}")]
    Api {
        operation: String,
        #[source]
        source: virt::error::Error,
    },

    #[error("domain `{0}` not found")]
    DomainNotFound(String),

    #[error("network `{0}` not found")]
    NetworkNotFound(String),

    #[error("domain `{domain}` did not shut down within {seconds}s")]
    ShutdownTimeout { domain: String, seconds: u64 },

    #[error("invalid domain XML: {0}")]
    InvalidXml(String),
}

impl HypervisorError {
    pub fn api(operation: impl Into<String>, source: virt::error::Error) -> Self {
        Self::Api {
            operation: operation.into(),
            source,
        }
    }
}
