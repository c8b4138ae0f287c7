//! guardrun: policy-gated, sandboxed execution of untrusted commands and
//! code, with fault classification and auditable recovery.
//!
//! A [`SafetyOrchestrator`] runs a command through the [`SecurityGate`] and
//! the [`SandboxRuntime`], classifies any failure into structured faults,
//! tries candidate repairs (taking backups before anything touches a file)
//! and retries once. Every invocation yields a [`SafetyReport`].

// Spawn-time rlimits need `pre_exec`; that one call site opts in locally.
#![deny(unsafe_code)]
// Public API types have docs; internal types are documented where useful.
#![allow(missing_docs)]

pub mod classifier;
pub mod config;
pub mod error;
pub mod gate;
pub mod model;
pub mod orchestrator;
pub mod recovery;
pub mod sandbox;
pub mod util;
pub mod validate;

pub use crate::model::*;

pub use crate::classifier::{ClassifyOptions, ErrorClassifier, Ledger};
pub use crate::config::{load_config_file, ConfigBuilder, GuardConfig};
pub use crate::error::{ErrorCode, ErrorInfo, GuardError, GuardResult};
pub use crate::gate::SecurityGate;
pub use crate::orchestrator::SafetyOrchestrator;
pub use crate::recovery::{BackupStore, RecoveryExecutor, RecoveryPlanner};
pub use crate::sandbox::{CodeRunner, Interpreter, SandboxRuntime};
pub use crate::validate::{FileValidator, StructuralValidator};
