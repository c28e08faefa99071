//! Shared per-process service state
//!
//! One `ServiceContext` is built at startup and shared by every worker
//! and connection task. All cross-request state lives here; workers
//! themselves are stateless apart from their id.

use std::sync::Arc;

use crate::config::GatewayConfig;
use crate::conn::ConnRegistry;
use crate::pending::Pending;
use proto::{MessageId, Transport};
use sk_core::{HealthMap, IdGenerator, InstanceId, StripeMap, TimestampGenerator};

pub struct ServiceContext {
    pub config: GatewayConfig,
    pub instance_id: InstanceId,
    pub stripe_map: StripeMap,
    pub health: HealthMap,
    pub pending: Pending,
    pub conns: ConnRegistry,
    pub id_gen: IdGenerator,
    pub timestamps: TimestampGenerator,
    pub transport: Arc<dyn Transport>,
}

impl ServiceContext {
    pub fn new(config: GatewayConfig, transport: Arc<dyn Transport>) -> Self {
        let stripe_map = StripeMap::new(
            &config.cluster.server_ids(),
            config.stripe.list_count as usize,
            config.stripe.data_chunks as usize,
            config.stripe.parity_chunks as usize,
        );
        let instance_id = config.gateway.instance_id;
        let workers = config.gateway.workers;
        Self {
            config,
            instance_id,
            stripe_map,
            health: HealthMap::new(),
            pending: Pending::new(),
            conns: ConnRegistry::new(),
            id_gen: IdGenerator::new(workers),
            timestamps: TimestampGenerator::default(),
            transport,
        }
    }

    pub fn next_id(&self, worker_id: usize) -> MessageId {
        MessageId::new(self.instance_id, self.id_gen.next(worker_id))
    }

    /// First healthy slot of a list usable as a reconstruction target,
    /// scanning parity slots before data slots and skipping `avoid`.
    /// None when every other slot is down.
    pub fn redirect_slot(&self, list_id: u32, avoid: u32) -> Option<u32> {
        let servers = self.stripe_map.servers_of(list_id)?;
        let k = self.stripe_map.k();
        let order = (k..servers.len()).chain(0..k);
        for chunk_id in order {
            if chunk_id as u32 == avoid {
                continue;
            }
            if !self.health.is_down(servers[chunk_id]) {
                return Some(chunk_id as u32);
            }
        }
        None
    }
}
