//! Provisioning and lifecycle control for locally managed service runtimes.

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod envfile;
pub mod error;
pub mod health;
pub mod jobs;
pub mod lock;
pub mod orchestrator;
pub mod process;
pub mod provision;
pub mod registry;
pub mod sync;

pub use command::{CommandRunner, StepOutcome, StepRecord, SystemRunner};
pub use config::{DirtyPolicy, Settings};
pub use error::{ErrorDetails, StewardError};
pub use orchestrator::{InstallOptions, Orchestrator, PrepareOptions};
pub use registry::{ServiceDescriptor, ServiceRegistry};
