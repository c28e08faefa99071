//! Coordinator event loop
//!
//! Single logical worker over one inbound queue: peer registration,
//! heartbeat ingestion, the degraded-lock service, and failure handling.
//! A failed server triggers two things: gateways are told to stop
//! routing to it, and its sealed stripes are spread over the surviving
//! servers of each affected list as reconstruction batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::CoordinatorConfig;
use crate::directory::KeyDirectory;
use crate::lock::DegradedLockService;
use proto::{Message, MessageId, Payload, PeerAddr, ReconstructionMapping, Transport};
use sk_core::{HealthMap, IdGenerator, InstanceId, Key, Metadata, ServerId, StripeMap};

/// Coordinator's own instance id in message headers.
pub const COORDINATOR_INSTANCE: InstanceId = 0;

/// Registered peers and their last-heard-from times.
#[derive(Default)]
pub struct Registry {
    servers: Mutex<HashMap<ServerId, Instant>>,
    gateways: Mutex<Vec<InstanceId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_server(&self, server: ServerId) {
        self.servers.lock().insert(server, Instant::now());
    }

    pub fn register_gateway(&self, gateway: InstanceId) {
        let mut gateways = self.gateways.lock();
        if !gateways.contains(&gateway) {
            gateways.push(gateway);
        }
    }

    pub fn touch(&self, server: ServerId) {
        if let Some(seen) = self.servers.lock().get_mut(&server) {
            *seen = Instant::now();
        }
    }

    pub fn gateways(&self) -> Vec<InstanceId> {
        self.gateways.lock().clone()
    }

    pub fn servers(&self) -> Vec<ServerId> {
        self.servers.lock().keys().copied().collect()
    }

    /// Servers whose last heartbeat is older than the failure timeout.
    pub fn stale_servers(&self, timeout: std::time::Duration) -> Vec<ServerId> {
        let now = Instant::now();
        self.servers
            .lock()
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) >= timeout)
            .map(|(id, _)| *id)
            .collect()
    }
}

pub struct CoordinatorContext {
    pub config: CoordinatorConfig,
    pub stripe_map: StripeMap,
    pub health: HealthMap,
    pub directory: KeyDirectory,
    pub locks: DegradedLockService,
    pub registry: Registry,
    pub id_gen: IdGenerator,
    pub transport: Arc<dyn Transport>,
}

impl CoordinatorContext {
    pub fn new(config: CoordinatorConfig, transport: Arc<dyn Transport>) -> Self {
        let stripe_map = StripeMap::new(
            &config.cluster.server_ids(),
            config.stripe.list_count as usize,
            config.stripe.data_chunks as usize,
            config.stripe.parity_chunks as usize,
        );
        Self {
            config,
            stripe_map,
            health: HealthMap::new(),
            directory: KeyDirectory::new(),
            locks: DegradedLockService::new(),
            registry: Registry::new(),
            id_gen: IdGenerator::new(1),
            transport,
        }
    }
}

/// One reconstruction batch handed to a surviving server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionBatch {
    pub assignee: ServerId,
    pub list_id: u32,
    pub chunk_id: u32,
    pub stripe_ids: Vec<u32>,
}

/// Plan reconstruction of every slot the failed server held: for each
/// affected list, its sealed stripes are distributed round-robin over the
/// healthy servers of that list. Lists with fewer than k healthy servers
/// are reported as lost and skipped.
pub fn plan_reconstruction(
    stripe_map: &StripeMap,
    health: &HealthMap,
    directory: &KeyDirectory,
    failed: ServerId,
) -> Vec<ReconstructionBatch> {
    let mut batches = Vec::new();
    for (list_id, chunk_id) in stripe_map.reverse_lookup(failed) {
        let stripes = directory.sealed_stripes_of_list(list_id);
        if stripes.is_empty() {
            continue;
        }
        let survivors: Vec<ServerId> = stripe_map
            .servers_of(list_id)
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(|&s| s != failed && !health.is_down(s))
            .collect();
        if survivors.len() < stripe_map.k() {
            error!(
                list_id,
                chunk_id,
                survivors = survivors.len(),
                required = stripe_map.k(),
                "stripe list unrecoverable, skipping reconstruction"
            );
            continue;
        }
        let mut per_survivor: HashMap<ServerId, Vec<u32>> = HashMap::new();
        for (i, stripe_id) in stripes.iter().enumerate() {
            let assignee = survivors[i % survivors.len()];
            per_survivor.entry(assignee).or_default().push(*stripe_id);
        }
        let mut assigned: Vec<_> = per_survivor.into_iter().collect();
        assigned.sort_unstable_by_key(|(s, _)| *s);
        for (assignee, stripe_ids) in assigned {
            batches.push(ReconstructionBatch {
                assignee,
                list_id,
                chunk_id,
                stripe_ids,
            });
        }
    }
    batches
}

pub struct CoordinatorWorker {
    ctx: Arc<CoordinatorContext>,
    /// Outstanding reconstruction batches, keyed by (assignee, list, chunk)
    outstanding: Mutex<HashMap<(ServerId, u32, u32), Vec<u32>>>,
}

impl CoordinatorWorker {
    pub fn new(ctx: Arc<CoordinatorContext>) -> Self {
        Self {
            ctx,
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<Message>) {
        let mut sweep = tokio::time::interval(self.ctx.config.service.sweep_interval());
        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => self.handle(msg).await,
                        None => {
                            info!("inbound queue closed, coordinator stopping");
                            return;
                        }
                    }
                }
                _ = sweep.tick() => self.sweep_liveness().await,
            }
        }
    }

    pub async fn handle(&self, msg: Message) {
        let from = msg.from;
        let id = msg.id;
        match msg.payload {
            Payload::RegisterRequest { peer } => self.handle_register(from, id, peer).await,
            Payload::Heartbeat {
                sealed,
                keys,
                is_last,
            } => self.handle_heartbeat(from, sealed, keys, is_last),
            Payload::DegradedLockRequest { key, mapping } => {
                self.handle_degraded_lock(from, id, key, mapping).await
            }
            Payload::RemapLockRequest { key, remapped } => {
                self.handle_remap_lock(from, id, key, remapped).await
            }
            Payload::ReleaseDegradedLockRequest { chunks } => {
                self.handle_release(from, id, chunks).await
            }
            Payload::ReconstructionResponse {
                list_id,
                chunk_id,
                num_stripes,
                success,
            } => self.handle_reconstruction_response(from, list_id, chunk_id, num_stripes, success),
            other => warn!(%from, "unexpected message at coordinator: {:?}", other),
        }
    }

    async fn handle_register(&self, from: PeerAddr, id: MessageId, peer: PeerAddr) {
        match peer {
            PeerAddr::Server(server) => {
                self.ctx.registry.register_server(server);
                // A re-registering failed server is back in service. Any
                // lock still parked on its chunks belongs to the outage
                // and would block degraded reads forever if it leaked.
                if self.ctx.health.mark_up(server) {
                    let stale = self.ctx.locks.release_server(server, &self.ctx.stripe_map);
                    if stale > 0 {
                        warn!(server, stale, "dropped stale degraded locks on recovery");
                    }
                    info!(server, "server recovered");
                    self.notify_state(server, true).await;
                }
            }
            PeerAddr::Gateway(gateway) => self.ctx.registry.register_gateway(gateway),
            other => {
                warn!(%other, "unexpected registration");
                self.reply(from, id, Payload::RegisterResponse { success: false })
                    .await;
                return;
            }
        }
        info!(%peer, "peer registered");
        self.reply(from, id, Payload::RegisterResponse { success: true })
            .await;
    }

    fn handle_heartbeat(
        &self,
        from: PeerAddr,
        sealed: Vec<Metadata>,
        keys: Vec<(Key, Metadata, u8)>,
        is_last: bool,
    ) {
        let PeerAddr::Server(server) = from else {
            warn!(%from, "heartbeat from non-server peer");
            return;
        };
        self.ctx.registry.touch(server);
        debug!(
            server,
            sealed = sealed.len(),
            keys = keys.len(),
            is_last,
            "heartbeat"
        );
        self.ctx.directory.apply_heartbeat(server, sealed, keys);
    }

    async fn handle_degraded_lock(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        mapping: ReconstructionMapping,
    ) {
        let result = self
            .ctx
            .locks
            .lock(&key, mapping, id, &self.ctx.directory);
        self.reply(from, id, Payload::DegradedLockResponse { key, result })
            .await;
    }

    async fn handle_remap_lock(&self, from: PeerAddr, id: MessageId, key: Key, remapped: (u32, u32)) {
        let authoritative = self.ctx.locks.remap_lock(key.clone(), remapped);
        self.reply(
            from,
            id,
            Payload::RemapLockResponse {
                key,
                remapped: authoritative,
                success: true,
            },
        )
        .await;
    }

    async fn handle_release(&self, from: PeerAddr, id: MessageId, chunks: Vec<Metadata>) {
        let count = self.ctx.locks.release(&chunks);
        self.reply(from, id, Payload::ReleaseDegradedLockResponse { count })
            .await;
    }

    fn handle_reconstruction_response(
        &self,
        from: PeerAddr,
        list_id: u32,
        chunk_id: u32,
        num_stripes: u32,
        success: bool,
    ) {
        let PeerAddr::Server(server) = from else {
            warn!(%from, "reconstruction response from non-server peer");
            return;
        };
        let stripes = self
            .outstanding
            .lock()
            .remove(&(server, list_id, chunk_id));
        let Some(stripes) = stripes else {
            warn!(server, list_id, chunk_id, "unmatched reconstruction response");
            return;
        };
        if !success {
            error!(server, list_id, chunk_id, "reconstruction batch failed");
            return;
        }
        info!(server, list_id, chunk_id, num_stripes, "reconstruction batch done");
        let chunks: Vec<Metadata> = stripes
            .into_iter()
            .map(|stripe_id| Metadata::new(list_id, stripe_id, chunk_id))
            .collect();
        self.ctx.locks.release(&chunks);
    }

    async fn sweep_liveness(&self) {
        let timeout = self.ctx.config.service.failure_timeout();
        for server in self.ctx.registry.stale_servers(timeout) {
            if self.ctx.health.mark_down(server) {
                self.declare_server_down(server).await;
            }
        }
    }

    /// Failure handling: fan the notification to the gateways and the
    /// surviving servers, then hand reconstruction batches to the
    /// survivors.
    pub async fn declare_server_down(&self, server: ServerId) {
        warn!(server, "server declared failed");
        self.ctx.health.mark_down(server);
        self.notify_state(server, false).await;

        let batches = plan_reconstruction(
            &self.ctx.stripe_map,
            &self.ctx.health,
            &self.ctx.directory,
            server,
        );
        for batch in batches {
            self.outstanding.lock().insert(
                (batch.assignee, batch.list_id, batch.chunk_id),
                batch.stripe_ids.clone(),
            );
            let id = MessageId::new(COORDINATOR_INSTANCE, self.ctx.id_gen.next(0));
            let msg = Message::request(
                PeerAddr::Coordinator,
                id,
                Payload::ReconstructionRequest {
                    list_id: batch.list_id,
                    chunk_id: batch.chunk_id,
                    stripe_ids: batch.stripe_ids,
                },
            );
            if let Err(e) = self
                .ctx
                .transport
                .send(PeerAddr::Server(batch.assignee), msg)
                .await
            {
                error!(assignee = batch.assignee, "reconstruction dispatch failed: {}", e);
            }
        }
    }

    /// Tell every gateway and every other server about a health change.
    /// Servers use it to stop fanning parity deltas at a dead peer and to
    /// clear degraded caches once the peer comes back.
    async fn notify_state(&self, server: ServerId, up: bool) {
        for gateway in self.ctx.registry.gateways() {
            let id = MessageId::new(COORDINATOR_INSTANCE, self.ctx.id_gen.next(0));
            let msg = Message::request(
                PeerAddr::Coordinator,
                id,
                Payload::ServerStateNotify { server, up },
            );
            if let Err(e) = self.ctx.transport.send(PeerAddr::Gateway(gateway), msg).await {
                warn!(gateway, "state notify failed: {}", e);
            }
        }
        for peer in self.ctx.registry.servers() {
            if peer == server {
                continue;
            }
            let id = MessageId::new(COORDINATOR_INSTANCE, self.ctx.id_gen.next(0));
            let msg = Message::request(
                PeerAddr::Coordinator,
                id,
                Payload::ServerStateNotify { server, up },
            );
            if let Err(e) = self.ctx.transport.send(PeerAddr::Server(peer), msg).await {
                warn!(peer, "state notify failed: {}", e);
            }
        }
    }

    async fn reply(&self, to: PeerAddr, id: MessageId, payload: Payload) {
        let msg = Message::request(PeerAddr::Coordinator, id, payload);
        if let Err(e) = self.ctx.transport.send(to, msg).await {
            warn!(%to, "reply failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::config::{ClusterConfig, ServerPeer};
    use proto::{DegradedLockResult, InMemoryHub, HEARTBEAT_OP_SET};

    fn test_config() -> CoordinatorConfig {
        let mut config = CoordinatorConfig::default();
        config.cluster = ClusterConfig {
            coordinator_addr: String::new(),
            gateways: Vec::new(),
            servers: (0..4)
                .map(|id| ServerPeer {
                    id,
                    addr: String::new(),
                })
                .collect(),
        };
        config.stripe.list_count = 4;
        config.stripe.data_chunks = 3;
        config.stripe.parity_chunks = 1;
        config
    }

    fn worker_with_hub() -> (CoordinatorWorker, proto::InMemoryHub) {
        let hub = InMemoryHub::new();
        let ctx = Arc::new(CoordinatorContext::new(
            test_config(),
            Arc::new(hub.clone()),
        ));
        (CoordinatorWorker::new(ctx), hub)
    }

    #[tokio::test]
    async fn test_register_and_lock_round_trip() {
        let (worker, hub) = worker_with_hub();
        let mut gw_rx = hub.register(PeerAddr::Gateway(1));

        worker
            .handle(Message::request(
                PeerAddr::Gateway(1),
                MessageId::new(1, 1),
                Payload::RegisterRequest {
                    peer: PeerAddr::Gateway(1),
                },
            ))
            .await;
        let reply = gw_rx.recv().await.unwrap();
        assert!(matches!(
            reply.payload,
            Payload::RegisterResponse { success: true }
        ));

        // Feed the directory, then lock through the message path.
        let key = Key::from("foo");
        let metadata = Metadata::new(1, 3, 0);
        worker
            .handle(Message::request(
                PeerAddr::Server(0),
                MessageId::new(0, 1),
                Payload::Heartbeat {
                    sealed: vec![metadata],
                    keys: vec![(key.clone(), metadata, HEARTBEAT_OP_SET)],
                    is_last: true,
                },
            ))
            .await;

        worker
            .handle(Message::request(
                PeerAddr::Gateway(1),
                MessageId::new(1, 2),
                Payload::DegradedLockRequest {
                    key: key.clone(),
                    mapping: ReconstructionMapping {
                        original: vec![(1, 0)],
                        reconstructed: vec![(1, 3)],
                    },
                },
            ))
            .await;
        let reply = gw_rx.recv().await.unwrap();
        assert_eq!(reply.id, MessageId::new(1, 2));
        match reply.payload {
            Payload::DegradedLockResponse { result, .. } => {
                assert!(matches!(result, DegradedLockResult::IsLocked { stripe_id: 3, sealed: true, .. }));
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failure_notifies_gateways_and_assigns_batches() {
        let (worker, hub) = worker_with_hub();
        let mut gw_rx = hub.register(PeerAddr::Gateway(7));
        let mut server_rx: Vec<_> = (0..4)
            .map(|id| hub.register(PeerAddr::Server(id)))
            .collect();

        worker.ctx.registry.register_gateway(7);
        for id in 0..4 {
            worker.ctx.registry.register_server(id);
        }
        // Server 1 holds sealed stripes in every list it serves.
        for list_id in 0..4 {
            worker.ctx.directory.apply_heartbeat(
                1,
                vec![Metadata::new(list_id, 0, 0), Metadata::new(list_id, 1, 0)],
                vec![],
            );
        }

        worker.declare_server_down(1).await;

        let notify = gw_rx.recv().await.unwrap();
        assert!(matches!(
            notify.payload,
            Payload::ServerStateNotify { server: 1, up: false }
        ));

        // The failed server gets nothing; survivors get the batches.
        assert!(server_rx[1].try_recv().is_err());
        let mut assigned = 0;
        for (id, rx) in server_rx.iter_mut().enumerate() {
            if id == 1 {
                continue;
            }
            while let Ok(msg) = rx.try_recv() {
                match msg.payload {
                    Payload::ServerStateNotify { server: 1, up: false } => {}
                    Payload::ReconstructionRequest { stripe_ids, .. } => {
                        assert!(!stripe_ids.is_empty());
                        assigned += stripe_ids.len();
                    }
                    other => panic!("unexpected message: {:?}", other),
                }
            }
        }
        // Two stripes per affected slot of server 1 were farmed out.
        let slots = worker.ctx.stripe_map.reverse_lookup(1).len();
        assert_eq!(assigned, slots * 2);
    }

    #[tokio::test]
    async fn test_rebuild_report_releases_stripe_locks() {
        let (worker, hub) = worker_with_hub();
        let _gw_rx = hub.register(PeerAddr::Gateway(7));
        let mut server_rx: Vec<_> = (0..4)
            .map(|id| hub.register(PeerAddr::Server(id)))
            .collect();
        worker.ctx.registry.register_gateway(7);
        for id in 0..4 {
            worker.ctx.registry.register_server(id);
        }

        // Server 1 owns the key's sealed chunk; a degraded lock is parked
        // on it while the failure is in progress.
        let key = Key::from("foo");
        let metadata = Metadata::new(0, 0, 1);
        assert_eq!(worker.ctx.stripe_map.resolve_chunk(0, 1), Some(1));
        worker.ctx.directory.apply_heartbeat(
            1,
            vec![metadata],
            vec![(key.clone(), metadata, HEARTBEAT_OP_SET)],
        );
        worker.ctx.locks.lock(
            &key,
            ReconstructionMapping::default(),
            MessageId::new(7, 1),
            &worker.ctx.directory,
        );
        assert_eq!(worker.ctx.locks.lock_count(), 1);

        worker.declare_server_down(1).await;

        // One survivor got the batch for the sealed stripe.
        let mut batch = None;
        for (id, rx) in server_rx.iter_mut().enumerate() {
            while let Ok(msg) = rx.try_recv() {
                if let Payload::ReconstructionRequest {
                    list_id,
                    chunk_id,
                    stripe_ids,
                } = msg.payload
                {
                    batch = Some((id as ServerId, list_id, chunk_id, stripe_ids));
                }
            }
        }
        let (assignee, list_id, chunk_id, stripe_ids) = batch.unwrap();
        assert_eq!((list_id, chunk_id), (0, 1));
        assert_eq!(stripe_ids, vec![0]);

        worker
            .handle(Message::request(
                PeerAddr::Server(assignee),
                MessageId::new(assignee as InstanceId, 1),
                Payload::ReconstructionResponse {
                    list_id,
                    chunk_id,
                    num_stripes: stripe_ids.len() as u32,
                    success: true,
                },
            ))
            .await;
        assert_eq!(worker.ctx.locks.lock_count(), 0);
    }

    #[test]
    fn test_plan_skips_unrecoverable_lists() {
        let config = test_config();
        let stripe_map = StripeMap::new(&config.cluster.server_ids(), 4, 3, 1);
        let health = HealthMap::new();
        let directory = KeyDirectory::new();
        directory.apply_heartbeat(0, vec![Metadata::new(0, 0, 0)], vec![]);

        // Two more failures leave fewer than k survivors everywhere.
        health.mark_down(2);
        health.mark_down(3);
        let batches = plan_reconstruction(&stripe_map, &health, &directory, 1);
        assert!(batches.is_empty());
    }
}
