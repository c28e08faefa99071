//! StripeKV coordinator
//!
//! Control plane of the cluster: tracks server liveness through
//! heartbeats, holds the global key/chunk directory, arbitrates degraded
//! locks so exactly one gateway drives each chunk reconstruction, and
//! farms out full-slot reconstruction when a server fails.

pub mod config;
pub mod directory;
pub mod lock;
pub mod worker;

pub use config::CoordinatorConfig;
pub use directory::KeyDirectory;
pub use lock::DegradedLockService;
pub use worker::{
    plan_reconstruction, CoordinatorContext, CoordinatorWorker, ReconstructionBatch, Registry,
    COORDINATOR_INSTANCE,
};
