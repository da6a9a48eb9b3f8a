//! Declarative layer-3 forwarding policy.
//!
//! Rules arrive as single strings (`src=office dst=servers dport=80,443`),
//! are parsed and validated, then compiled into stateful FORWARD rules.
//! Compilation resolves symbolic network names through the policy's
//! `ip_mappings`; a name that is neither a mapping nor a literal CIDR is a
//! validation error naming the offending token. A policy with compile
//! errors is never applied.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    All,
}

impl Protocol {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "icmp" => Some(Protocol::Icmp),
            "all" => Some(Protocol::All),
            _ => None,
        }
    }

    pub fn carries_ports(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Icmp => write!(f, "icmp"),
            Protocol::All => write!(f, "all"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Accept,
    Drop,
    Reject,
    Log,
}

impl Display for RuleAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RuleAction::Accept => write!(f, "ACCEPT"),
            RuleAction::Drop => write!(f, "DROP"),
            RuleAction::Reject => write!(f, "REJECT"),
            RuleAction::Log => write!(f, "LOG"),
        }
    }
}

/// Single port or inclusive range, both bounds in 1..=65535.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub start: u16,
    pub end: u16,
}

impl PortSpec {
    pub fn parse(spec: &str) -> Result<Self, String> {
        fn one(token: &str) -> Result<u16, String> {
            let value: u32 = token
                .parse()
                .map_err(|_| format!("`{token}` is not a port number"))?;
            if (1..=65535).contains(&value) {
                Ok(value as u16)
            } else {
                Err(format!("port `{token}` is outside 1-65535"))
            }
        }

        match spec.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (one(start)?, one(end)?);
                if start > end {
                    return Err(format!("port range `{spec}` has start > end"));
                }
                Ok(PortSpec { start, end })
            }
            None => {
                let port = one(spec)?;
                Ok(PortSpec {
                    start: port,
                    end: port,
                })
            }
        }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl Display for PortSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum PolicyError {
    #[error("rule {index}: {message}")]
    Rule { index: usize, message: String },

    #[error("network name `{0}` is neither a CIDR nor defined in ip_mappings")]
    UnresolvableNetwork(String),

    #[error("invalid CIDR `{cidr}` for network `{name}`")]
    InvalidMapping { name: String, cidr: String },
}

/// Parsed form of one `rule:` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRule {
    pub source_networks: Vec<String>,
    pub destination_networks: Vec<String>,
    pub dest_ports: Vec<PortSpec>,
    pub source_ports: Vec<PortSpec>,
    pub protocol: Protocol,
    pub action: RuleAction,
    pub stateful: bool,
}

impl NetworkRule {
    /// Parses whitespace-separated `key=value` tokens. `src` and `dst` are
    /// required; `proto` defaults to tcp.
    pub fn parse(rule: &str) -> Result<Self, String> {
        let mut source_networks = Vec::new();
        let mut destination_networks = Vec::new();
        let mut dest_ports = Vec::new();
        let mut source_ports = Vec::new();
        let mut protocol = Protocol::Tcp;

        for token in rule.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| format!("token `{token}` is not key=value"))?;
            match key {
                "src" => source_networks = value.split(',').map(str::to_string).collect(),
                "dst" => destination_networks = value.split(',').map(str::to_string).collect(),
                "dport" => {
                    for spec in value.split(',') {
                        dest_ports.push(PortSpec::parse(spec).map_err(|e| format!("dport: {e}"))?);
                    }
                }
                "sport" => {
                    for spec in value.split(',') {
                        source_ports
                            .push(PortSpec::parse(spec).map_err(|e| format!("sport: {e}"))?);
                    }
                }
                "proto" => {
                    protocol = Protocol::parse(value)
                        .ok_or_else(|| format!("unknown protocol `{value}`"))?;
                }
                other => return Err(format!("unknown key `{other}`")),
            }
        }

        if source_networks.is_empty() {
            return Err("missing required `src=`".to_string());
        }
        if destination_networks.is_empty() {
            return Err("missing required `dst=`".to_string());
        }

        Ok(NetworkRule {
            source_networks,
            destination_networks,
            dest_ports,
            source_ports,
            protocol,
            action: RuleAction::Accept,
            stateful: true,
        })
    }
}

/// One compiled stateful forwarding rule. Opaque to policy consumers; the
/// firewall manager reads the fields, everything else uses the rendered
/// string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub states: String,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub protocol: Option<Protocol>,
    pub dport: Option<PortSpec>,
    pub sports: Vec<PortSpec>,
    pub action: RuleAction,
}

impl CompiledRule {
    const NEW_STATES: &'static str = "new,established,related";
    const REPLY_STATES: &'static str = "established,related";

    fn reply(src: Option<String>, dst: Option<String>) -> Self {
        CompiledRule {
            states: Self::REPLY_STATES.to_string(),
            src,
            dst,
            protocol: None,
            dport: None,
            sports: Vec::new(),
            action: RuleAction::Accept,
        }
    }
}

impl Display for CompiledRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "FORWARD: state={}", self.states)?;
        if let Some(src) = &self.src {
            write!(f, " src={src}")?;
        }
        if let Some(dst) = &self.dst {
            write!(f, " dst={dst}")?;
        }
        if let Some(protocol) = &self.protocol {
            write!(f, " proto={protocol}")?;
        }
        if let Some(dport) = &self.dport {
            write!(f, " dport={dport}")?;
        }
        if !self.sports.is_empty() {
            let sports: Vec<String> = self.sports.iter().map(PortSpec::to_string).collect();
            write!(f, " sport={}", sports.join(","))?;
        }
        write!(f, " action={}", self.action)
    }
}

/// Per-range policy container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub policy_id: String,
    pub range_id: String,
    pub rules: Vec<NetworkRule>,
    pub ip_mappings: HashMap<String, String>,
    pub compiled_rules: Vec<CompiledRule>,
    pub applied: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl NetworkPolicy {
    pub fn new(range_id: impl Into<String>) -> Self {
        let range_id = range_id.into();
        let now = time::now();
        Self {
            policy_id: format!("layer3-{range_id}"),
            range_id,
            rules: Vec::new(),
            ip_mappings: HashMap::new(),
            compiled_rules: Vec::new(),
            applied: false,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn add_ip_mapping(
        &mut self,
        name: impl Into<String>,
        cidr: impl Into<String>,
    ) -> Result<(), PolicyError> {
        let (name, cidr) = (name.into(), cidr.into());
        if cidr.parse::<Ipv4Net>().is_err() {
            return Err(PolicyError::InvalidMapping { name, cidr });
        }
        self.ip_mappings.insert(name, cidr);
        self.modified_at = time::now();
        Ok(())
    }

    /// Parses all `rule:` strings, collecting every error with its rule
    /// index instead of stopping at the first.
    pub fn parse_forwarding_rules(&mut self, rules: &[String]) -> Result<(), Vec<PolicyError>> {
        let mut errors = Vec::new();
        for (index, rule) in rules.iter().enumerate() {
            match NetworkRule::parse(rule) {
                Ok(parsed) => self.rules.push(parsed),
                Err(message) => errors.push(PolicyError::Rule { index, message }),
            }
        }
        if errors.is_empty() {
            self.modified_at = time::now();
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn resolve(&self, token: &str) -> Result<String, PolicyError> {
        if token.parse::<Ipv4Net>().is_ok() {
            return Ok(token.to_string());
        }
        self.ip_mappings
            .get(token)
            .cloned()
            .ok_or_else(|| PolicyError::UnresolvableNetwork(token.to_string()))
    }

    /// Compiles the parsed rules. For each (src × dst) pair one rule per
    /// declared dport (or one without), a reply rule per distinct reversed
    /// pair, and one trailing stateful-reply catch-all.
    pub fn compile(&mut self) -> Result<(), Vec<PolicyError>> {
        let mut errors = Vec::new();
        let mut compiled = Vec::new();
        let mut reply_pairs: Vec<(String, String)> = Vec::new();

        for (index, rule) in self.rules.iter().enumerate() {
            for src_name in &rule.source_networks {
                for dst_name in &rule.destination_networks {
                    let src = match self.resolve(src_name) {
                        Ok(cidr) => cidr,
                        Err(err) => {
                            errors.push(PolicyError::Rule {
                                index,
                                message: err.to_string(),
                            });
                            continue;
                        }
                    };
                    let dst = match self.resolve(dst_name) {
                        Ok(cidr) => cidr,
                        Err(err) => {
                            errors.push(PolicyError::Rule {
                                index,
                                message: err.to_string(),
                            });
                            continue;
                        }
                    };

                    let dports: Vec<Option<PortSpec>> = if rule.dest_ports.is_empty() {
                        vec![None]
                    } else {
                        rule.dest_ports.iter().copied().map(Some).collect()
                    };
                    for dport in dports {
                        compiled.push(CompiledRule {
                            states: CompiledRule::NEW_STATES.to_string(),
                            src: Some(src.clone()),
                            dst: Some(dst.clone()),
                            protocol: (rule.protocol != Protocol::All).then_some(rule.protocol),
                            dport: dport.filter(|_| rule.protocol.carries_ports()),
                            sports: if rule.protocol.carries_ports() {
                                rule.source_ports.clone()
                            } else {
                                Vec::new()
                            },
                            action: rule.action,
                        });
                    }

                    let reply_pair = (dst.clone(), src.clone());
                    if !reply_pairs.contains(&reply_pair) {
                        reply_pairs.push(reply_pair);
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        // Reply traffic per pair, then the catch-all the legacy layout ends
        // with.
        for (src, dst) in reply_pairs {
            compiled.push(CompiledRule::reply(Some(src), Some(dst)));
        }
        if !compiled.is_empty() {
            compiled.push(CompiledRule::reply(None, None));
        }

        self.compiled_rules = compiled;
        self.modified_at = time::now();
        Ok(())
    }

    pub fn rendered_rules(&self) -> Vec<String> {
        self.compiled_rules
            .iter()
            .map(CompiledRule::to_string)
            .collect()
    }
}
