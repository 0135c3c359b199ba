//! Session configuration for the corral daemon fixture harness.
//!
//! The crate owns the values a test session needs before any daemon is
//! launched: where the event and log channels listen, how the host process
//! renders its own diagnostics, and the timing budgets applied to spawn,
//! readiness polling, and termination. Values start from [`defaults`] and are
//! overlaid from `CORRAL_*` environment variables by [`SessionConfig::from_env`].

pub mod defaults;
mod endpoint;
mod logging;
mod session;

pub use endpoint::{Endpoint, EndpointParseError, EndpointPreparationError};
pub use logging::{LogFormat, LogFormatParseError, LogLevel, LogLevelParseError};
pub use session::{ConfigError, SessionConfig, env_keys};
