pub mod description;
pub mod settings;

pub use description::{DescriptionError, GuestConfig, HostConfig, RangeDescription};
pub use settings::{Settings, SettingsError};
