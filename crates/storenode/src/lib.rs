//! StripeKV storage server
//!
//! Stores chunked key-value records for the stripe lists it serves,
//! mirrors writes for the lists where it holds a parity slot, and
//! reconstructs missing chunks on demand when a degraded operation or a
//! coordinator rebuild batch asks for them.

pub mod chunk_buffer;
pub mod config;
pub mod degraded;
pub mod kv_map;
pub mod pending;
pub mod worker;

pub use chunk_buffer::ChunkBufferStore;
pub use config::StoreNodeConfig;
pub use degraded::DegradedChunkDirectory;
pub use kv_map::Map;
pub use pending::ServerPending;
pub use worker::{StoreNodeContext, StoreNodeWorker};
