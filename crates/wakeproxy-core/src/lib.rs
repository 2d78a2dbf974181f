//! Shared types for the wakeproxy sidecar: listener/destination
//! configuration, the pid-file contract, and the error enum every other
//! crate in the workspace converts its failures into.

pub mod config;
pub mod error;
pub mod pidfile;

pub use config::{parse_port_map, Config, PortMap, Timeouts};
pub use error::{ConfigError, ConfigProblem, WakeproxyError};
pub use pidfile::{PidFile, PidFileContents};
