pub mod config;
pub mod link;
pub mod reporter;
pub mod topics;
pub mod types;

pub use config::{
    BaselinePolicy, BrokerCredentials, ConfigError, DeviceConfig, NetworkConfig, ReporterConfig,
    RuntimeConfig,
};
pub use link::{LinkFlag, LinkSlot};
pub use reporter::{Broker, ReporterState, RestartAuthority, SensorSource, SmokeReporter};
pub use topics::*;
pub use types::{ReporterStatePayload, SkipReason, TickOutcome};
