//! Core domain models for pipelines
//!
//! This module defines the declarative pipeline model (triggers, matrix,
//! step templates), the concrete job instances expanded from it, and the
//! run results produced when they execute.

pub mod config;
pub mod context;
pub mod job;
pub mod matrix;
pub mod pipeline;
pub mod state;
pub mod step;
pub mod trigger;

pub use context::{Secret, SecretStore, EnvSecretStore, StaticSecretStore, TemplateContext};
pub use job::{JobInstance, RuntimeSpec, ServiceSpec, ReportSpec};
pub use matrix::{MatrixCombination, MatrixSpec};
pub use pipeline::*;
pub use state::*;
pub use step::{Step, StepAction, EnvBinding};
pub use trigger::{EventKind, RepositoryEvent, Triggers, GlobPattern, PatternError};
