//! StripeKV gateway
//!
//! Stateless request router between applications and the storage tier.
//! Resolves keys through the stripe map, fans writes out to the k+m
//! servers of the stripe list, correlates every response through the
//! pending table, and escalates operations on failed slots to the
//! coordinator's degraded-lock service.

pub mod config;
pub mod conn;
pub mod context;
pub mod pending;
pub mod server;
pub mod worker;

pub use config::GatewayConfig;
pub use conn::ConnRegistry;
pub use context::ServiceContext;
pub use pending::{DegradedOpcode, Pending, Pid};
pub use server::GatewayServer;
pub use worker::{GatewayEvent, GatewayWorker};
