//! KDL configuration for BeeCI.
//!
//! Configuration is read once at startup from a KDL file, overridden from the
//! environment, and handed to each component's constructor.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    CredentialsConfig, GitHubAppConfig, ListenerConfig, SystemConfig, SystemConfigBuilder,
    WorkerConfig, parse_duration,
};
