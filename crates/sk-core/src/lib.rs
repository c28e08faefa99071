//! Shared data model for StripeKV
//!
//! Provides the types every role depends on:
//! - Request/instance identifiers and per-worker id generation
//! - Key-value record model and the in-chunk record layout
//! - Fixed-capacity chunks and the reusing chunk pool
//! - The stripe map (key |-> stripe list |-> server slots)
//! - The pending-request correlation multimap
//! - Server liveness tracking

pub mod chunk;
pub mod health;
pub mod ids;
pub mod key_value;
pub mod metadata;
pub mod pending;
pub mod stripe_map;

pub use chunk::{Chunk, ChunkPool};
pub use health::HealthMap;
pub use ids::{ConnHandle, IdGenerator, InstanceId, RequestId, ServerId, TimestampGenerator};
pub use key_value::{Key, KeyValue, KeyValueUpdate, RECORD_HEADER_SIZE};
pub use metadata::Metadata;
pub use pending::{PendingIdentifier, PendingMap, PendingPayload};
pub use stripe_map::{crc16, StripeLocation, StripeMap};
