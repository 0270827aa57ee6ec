//! Corral Fleet
//!
//! Manages a fleet of external runner worker containers on one host.
//!
//! Architecture:
//! - Runtime: trait over the container runtime plus a CLI driven implementation
//! - Image: chooses the runner image from the local inventory and the registry
//! - Controller: starts, inspects and stops the workers of one base name
//! - Fleet: the workers a controller run is tracking
//! - Logs: one reader per worker routing its output to console or files
//! - Shutdown: LIFO signal hooks that kill the fleet on interrupt

pub mod config;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod image;
pub mod logs;
pub mod runtime;
pub mod shutdown;

pub use config::{HostEnv, OciOptions, RetryPolicy, RunnerConfig};
pub use controller::{Command, FleetController, RunOutcome, StatusReport, StopReport};
pub use error::{FleetError, Result};
pub use image::{ImageResolver, RegistryCheck};
pub use runtime::{CliRuntime, ContainerRuntime};
pub use shutdown::ShutdownHooks;
