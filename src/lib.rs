#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod addon;
mod collect;
mod config;
mod core;
mod error;
mod executor;
mod fingerprint;
#[cfg(feature = "logging")]
pub mod logging;
mod manager;
mod plan;
mod registry;
mod report;
mod resolve;
mod store;
mod task;
mod utils;

pub use crate::addon::{Addon, AddonDef, AddonFactory, AddonSettings, Tasks};
pub use crate::collect::{Collection, PhasedTask, TaskCollector};
pub use crate::config::Config;
pub use crate::core::{CancelToken, Hook, Phase, RunContext, Stage};
pub use crate::error::*;
pub use crate::executor::Executor;
pub use crate::fingerprint::{Fingerprint, Signature, SignatureMode, Staleness};
pub use crate::manager::{Manager, ManagerBuilder};
pub use crate::plan::{Plan, PlanEntry};
pub use crate::registry::{AddonRegistry, Excluded};
pub use crate::report::{RunReport, RunStatus, TaskError, TaskExecution, TaskState};
pub use crate::resolve::{Link, TaskGraph, resolve};
pub use crate::store::{FileStore, FingerprintStore, MemoryStore, TaskRecord};
pub use crate::task::{Action, ActionContext, ResourceId, TaskDescriptor};
