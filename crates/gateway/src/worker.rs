//! Gateway request router
//!
//! Each worker consumes application and peer events against the shared
//! [`ServiceContext`]. The flow for every operation is the same two-level
//! bookkeeping: one application-level pending entry per client request,
//! one server-level entry per downstream branch. Responses erase their
//! branch entry first; the branch observing an empty bucket completes the
//! application entry and emits exactly one client reply.
//!
//! When the data slot of a key is down, the operation escalates to the
//! coordinator's degraded-lock service instead of the server, and the
//! buffered operation is replayed against the lock outcome.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::context::ServiceContext;
use crate::pending::{
    AcknowledgementInfo, DegradedLockData, DegradedOpcode, PendingUpdate, Pid, RemappingRecord,
    RequestStartTime,
};
use proto::{
    DegradedLockResult, Message, MessageId, Payload, PeerAddr, ReconstructionMapping,
};
use sk_core::{ConnHandle, Key, KeyValue, KeyValueUpdate, ServerId, StripeLocation};

pub enum GatewayEvent {
    App { conn: ConnHandle, msg: Message },
    Peer(Message),
}

pub struct GatewayWorker {
    ctx: Arc<ServiceContext>,
    worker_id: usize,
}

impl GatewayWorker {
    pub fn new(ctx: Arc<ServiceContext>, worker_id: usize) -> Self {
        Self { ctx, worker_id }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    pub async fn run(self, mut events: mpsc::Receiver<GatewayEvent>) {
        let ttl = self.ctx.config.gateway.pending_timeout();
        let mut sweep =
            tokio::time::interval(ttl.unwrap_or_else(|| Duration::from_secs(3600)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(GatewayEvent::App { conn, msg }) => self.handle_app(conn, msg).await,
                    Some(GatewayEvent::Peer(msg)) => self.handle_peer(msg).await,
                    None => {
                        info!(worker = self.worker_id, "event queue closed, worker stopping");
                        return;
                    }
                },
                _ = sweep.tick(), if ttl.is_some() => {
                    self.sweep_expired(ttl.unwrap()).await;
                }
            }
        }
    }

    // --- application requests ---

    pub async fn handle_app(&self, conn: ConnHandle, msg: Message) {
        let app_id = msg.id;
        match msg.payload {
            Payload::GetRequest { key } => self.app_get(conn, app_id, key).await,
            Payload::SetRequest { key, value, .. } => self.app_set(conn, app_id, key, value).await,
            Payload::UpdateRequest {
                key, offset, data, ..
            } => self.app_update(conn, app_id, key, offset, data).await,
            Payload::DeleteRequest { key, .. } => self.app_delete(conn, app_id, key).await,
            other => warn!(%conn, "unexpected application message: {:?}", other),
        }
    }

    async fn app_get(&self, conn: ConnHandle, app_id: MessageId, key: Key) {
        let loc = self.ctx.stripe_map.resolve(key.as_bytes());
        let owner = PeerAddr::App(conn);
        self.ctx
            .pending
            .applications
            .get
            .insert(root_pid(app_id, owner), key.clone());

        let Some(target) = self.ctx.stripe_map.resolve_chunk(loc.list_id, loc.chunk_id) else {
            self.fail_get(app_id, &key).await;
            return;
        };
        if self.ctx.health.is_down(target) {
            self.escalate_degraded(DegradedOpcode::Get, key, None, app_id, loc)
                .await;
            return;
        }

        let id = self.ctx.next_id(self.worker_id);
        self.ctx.pending.servers.get.insert(
            branch_pid(id, app_id, PeerAddr::Server(target)),
            key.clone(),
        );
        self.ctx.pending.stats.get.insert(
            Pid::root(id.instance_id, id.request_id, Some(PeerAddr::Server(target))),
            RequestStartTime::now(PeerAddr::Server(target)),
        );
        if !self
            .send_to(PeerAddr::Server(target), id, app_id, Payload::GetRequest { key: key.clone() })
            .await
        {
            self.ctx
                .pending
                .servers
                .get
                .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()));
            self.fail_get(app_id, &key).await;
        }
    }

    async fn app_set(&self, conn: ConnHandle, app_id: MessageId, key: Key, value: Bytes) {
        let loc = self.ctx.stripe_map.resolve(key.as_bytes());
        let owner = PeerAddr::App(conn);
        let kv = KeyValue::new(key.clone(), value.clone());
        self.ctx
            .pending
            .applications
            .set
            .insert(root_pid(app_id, owner), kv.clone());

        let Some(target) = self.ctx.stripe_map.resolve_chunk(loc.list_id, loc.chunk_id) else {
            self.fail_set(app_id, &key).await;
            return;
        };
        if self.ctx.health.is_down(target) {
            // Data slot down: the coordinator registers a relocation and
            // the SET is steered to the replacement slot.
            let Some(redirect) = self.ctx.redirect_slot(loc.list_id, loc.chunk_id) else {
                self.fail_set(app_id, &key).await;
                return;
            };
            let id = self.ctx.next_id(self.worker_id);
            self.ctx.pending.servers.remapped_set.insert(
                branch_pid(id, app_id, PeerAddr::Coordinator),
                RemappingRecord {
                    key: key.clone(),
                    value,
                    remapped: (loc.list_id, redirect),
                },
            );
            if !self
                .send_to(
                    PeerAddr::Coordinator,
                    id,
                    app_id,
                    Payload::RemapLockRequest {
                        key: key.clone(),
                        remapped: (loc.list_id, redirect),
                    },
                )
                .await
            {
                self.ctx.pending.servers.remapped_set.erase(
                    id.instance_id,
                    id.request_id,
                    None,
                    Some(key.as_bytes()),
                );
                self.fail_set(app_id, &key).await;
            }
            return;
        }

        // Normal path: one branch per reachable server of the list.
        let servers: Vec<ServerId> = self
            .ctx
            .stripe_map
            .servers_of(loc.list_id)
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let id = self.ctx.next_id(self.worker_id);
        let targets: Vec<ServerId> = servers
            .into_iter()
            .filter(|&s| !self.ctx.health.is_down(s))
            .collect();
        if targets.is_empty() {
            self.fail_set(app_id, &key).await;
            return;
        }
        for &server in &targets {
            self.ctx.pending.servers.set.insert(
                branch_pid(id, app_id, PeerAddr::Server(server)),
                kv.clone(),
            );
        }
        self.ctx.pending.stats.set.insert(
            Pid::root(id.instance_id, id.request_id, None),
            RequestStartTime::now(PeerAddr::Gateway(self.ctx.instance_id)),
        );
        for &server in &targets {
            let sent = self
                .send_to(
                    PeerAddr::Server(server),
                    id,
                    app_id,
                    Payload::SetRequest {
                        key: key.clone(),
                        value: value.clone(),
                        loc,
                    },
                )
                .await;
            if !sent {
                // Same path as a failed branch response.
                self.set_branch_done(id, PeerAddr::Server(server), &key, false)
                    .await;
            }
        }
    }

    async fn app_update(
        &self,
        conn: ConnHandle,
        app_id: MessageId,
        key: Key,
        offset: u32,
        data: Bytes,
    ) {
        let loc = self.ctx.stripe_map.resolve(key.as_bytes());
        let owner = PeerAddr::App(conn);
        let update = KeyValueUpdate::new(key.clone(), offset, data.clone());
        self.ctx
            .pending
            .applications
            .update
            .insert(root_pid(app_id, owner), PendingUpdate::new(update.clone()));

        let Some(target) = self.ctx.stripe_map.resolve_chunk(loc.list_id, loc.chunk_id) else {
            self.fail_update(app_id, &update).await;
            return;
        };
        if self.ctx.health.is_down(target) {
            self.escalate_degraded(DegradedOpcode::Update, key, Some(update), app_id, loc)
                .await;
            return;
        }

        let id = self.ctx.next_id(self.worker_id);
        self.ctx.pending.servers.update.insert(
            branch_pid(id, app_id, PeerAddr::Server(target)),
            PendingUpdate::new(update.clone()),
        );
        if !self
            .send_to(
                PeerAddr::Server(target),
                id,
                app_id,
                Payload::UpdateRequest {
                    key: key.clone(),
                    offset,
                    data,
                    loc,
                },
            )
            .await
        {
            self.ctx
                .pending
                .servers
                .update
                .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()));
            self.fail_update(app_id, &update).await;
        }
    }

    async fn app_delete(&self, conn: ConnHandle, app_id: MessageId, key: Key) {
        let loc = self.ctx.stripe_map.resolve(key.as_bytes());
        let owner = PeerAddr::App(conn);
        self.ctx
            .pending
            .applications
            .del
            .insert(root_pid(app_id, owner), key.clone());

        let Some(target) = self.ctx.stripe_map.resolve_chunk(loc.list_id, loc.chunk_id) else {
            self.fail_delete(app_id, &key).await;
            return;
        };
        if self.ctx.health.is_down(target) {
            self.escalate_degraded(DegradedOpcode::Delete, key, None, app_id, loc)
                .await;
            return;
        }

        let id = self.ctx.next_id(self.worker_id);
        self.ctx
            .pending
            .servers
            .del
            .insert(branch_pid(id, app_id, PeerAddr::Server(target)), key.clone());
        if !self
            .send_to(
                PeerAddr::Server(target),
                id,
                app_id,
                Payload::DeleteRequest { key: key.clone(), loc },
            )
            .await
        {
            self.ctx
                .pending
                .servers
                .del
                .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()));
            self.fail_delete(app_id, &key).await;
        }
    }

    /// Buffer the operation and ask the coordinator for a degraded lock.
    async fn escalate_degraded(
        &self,
        opcode: DegradedOpcode,
        key: Key,
        update: Option<KeyValueUpdate>,
        app_id: MessageId,
        loc: StripeLocation,
    ) {
        let Some(redirect) = self.ctx.redirect_slot(loc.list_id, loc.chunk_id) else {
            warn!(%key, "no healthy redirect slot, failing operation");
            self.fail_opcode(opcode, app_id, &key, update.as_ref()).await;
            return;
        };
        let mapping = ReconstructionMapping {
            original: vec![(loc.list_id, loc.chunk_id)],
            reconstructed: vec![(loc.list_id, redirect)],
        };
        let id = self.ctx.next_id(self.worker_id);
        self.ctx.pending.servers.degraded_lock.insert(
            branch_pid(id, app_id, PeerAddr::Coordinator),
            DegradedLockData {
                opcode,
                key: key.clone(),
                mapping: mapping.clone(),
                update: update.clone(),
            },
        );
        debug!(%key, ?opcode, "escalating to degraded lock");
        if !self
            .send_to(
                PeerAddr::Coordinator,
                id,
                app_id,
                Payload::DegradedLockRequest {
                    key: key.clone(),
                    mapping,
                },
            )
            .await
        {
            self.ctx.pending.servers.degraded_lock.erase(
                id.instance_id,
                id.request_id,
                None,
                Some(key.as_bytes()),
            );
            self.fail_opcode(opcode, app_id, &key, update.as_ref()).await;
        }
    }

    // --- peer responses ---

    pub async fn handle_peer(&self, msg: Message) {
        let from = msg.from;
        let id = msg.id;
        match msg.payload {
            Payload::GetResponse { key, value } => {
                self.handle_get_response(from, id, key, value).await
            }
            Payload::SetResponse { key, success } => {
                self.set_branch_done(id, from, &key, success).await
            }
            Payload::UpdateResponse { key, success, .. } => {
                self.handle_update_response(from, id, key, success).await
            }
            Payload::DeleteResponse { key, success } => {
                self.handle_delete_response(from, id, key, success).await
            }
            Payload::DegradedLockResponse { key, result } => {
                self.handle_degraded_lock_response(id, key, result).await
            }
            Payload::RemapLockResponse { key, remapped, success } => {
                self.handle_remap_lock_response(id, key, remapped, success)
                    .await
            }
            Payload::ServerStateNotify { server, up } => self.handle_server_state(server, up),
            Payload::RegisterResponse { success } => {
                if success {
                    info!("registered with coordinator");
                } else {
                    error!("coordinator rejected registration");
                }
            }
            other => warn!(%from, "unexpected peer message: {:?}", other),
        }
    }

    async fn handle_get_response(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        value: Option<Bytes>,
    ) {
        let erased = self.ctx.pending.servers.get.erase(
            id.instance_id,
            id.request_id,
            Some(from),
            Some(key.as_bytes()),
        );
        let Some((pid, _)) = erased else {
            debug!(%key, "late or duplicate get response dropped");
            return;
        };
        if let Some((_, start)) =
            self.ctx
                .pending
                .stats
                .get
                .erase(id.instance_id, id.request_id, None, None)
        {
            debug!(%key, elapsed_us = start.at.elapsed().as_micros() as u64, "get served");
        }
        let (parent_instance, parent_request) = pid.parent();
        let app = self.ctx.pending.applications.get.erase(
            parent_instance,
            parent_request,
            None,
            Some(key.as_bytes()),
        );
        if let Some((app_pid, _)) = app {
            self.reply_app(
                app_pid.owner,
                MessageId::new(parent_instance, parent_request),
                Payload::GetResponse { key, value },
            )
            .await;
        }
    }

    /// Complete one SET branch. The branch observing the empty bucket
    /// synthesizes the application response; a failed branch fails the
    /// application entry immediately and later branches find it gone.
    async fn set_branch_done(&self, id: MessageId, from: PeerAddr, key: &Key, success: bool) {
        let erased = self.ctx.pending.servers.set.erase_and_count(
            id.instance_id,
            id.request_id,
            Some(from),
            Some(key.as_bytes()),
        );
        let Some((pid, _, remaining)) = erased else {
            // Not a fan-out branch; maybe a remapped SET branch.
            self.remapped_set_branch_done(id, from, key, success).await;
            return;
        };
        let (parent_instance, parent_request) = pid.parent();
        if remaining == 0 {
            if let Some((_, start)) =
                self.ctx
                    .pending
                    .stats
                    .set
                    .erase(id.instance_id, id.request_id, None, None)
            {
                debug!(%key, elapsed_us = start.at.elapsed().as_micros() as u64, "set fan-out done");
            }
        }
        if !success {
            if let Some((app_pid, _)) = self.ctx.pending.applications.set.erase(
                parent_instance,
                parent_request,
                None,
                Some(key.as_bytes()),
            ) {
                self.reply_app(
                    app_pid.owner,
                    MessageId::new(parent_instance, parent_request),
                    Payload::SetResponse {
                        key: key.clone(),
                        success: false,
                    },
                )
                .await;
            }
            return;
        }
        if remaining == 0 {
            if let Some((app_pid, _)) = self.ctx.pending.applications.set.erase(
                parent_instance,
                parent_request,
                None,
                Some(key.as_bytes()),
            ) {
                self.reply_app(
                    app_pid.owner,
                    MessageId::new(parent_instance, parent_request),
                    Payload::SetResponse {
                        key: key.clone(),
                        success: true,
                    },
                )
                .await;
            }
        }
    }

    /// A SetResponse for a relocated SET (single branch at the redirect
    /// slot's servers).
    async fn remapped_set_branch_done(&self, id: MessageId, from: PeerAddr, key: &Key, success: bool) {
        let erased = self.ctx.pending.servers.remapped_set.erase_and_count(
            id.instance_id,
            id.request_id,
            Some(from),
            Some(key.as_bytes()),
        );
        let Some((pid, _, remaining)) = erased else {
            debug!(%key, "late or duplicate set response dropped");
            return;
        };
        let (parent_instance, parent_request) = pid.parent();
        if !success || remaining == 0 {
            if let Some((app_pid, _)) = self.ctx.pending.applications.set.erase(
                parent_instance,
                parent_request,
                None,
                Some(key.as_bytes()),
            ) {
                self.reply_app(
                    app_pid.owner,
                    MessageId::new(parent_instance, parent_request),
                    Payload::SetResponse {
                        key: key.clone(),
                        success,
                    },
                )
                .await;
            }
        }
    }

    async fn handle_update_response(&self, from: PeerAddr, id: MessageId, key: Key, success: bool) {
        let erased = self.ctx.pending.servers.update.erase(
            id.instance_id,
            id.request_id,
            Some(from),
            Some(key.as_bytes()),
        );
        let Some((pid, _)) = erased else {
            debug!(%key, "late or duplicate update response dropped");
            return;
        };
        let (parent_instance, parent_request) = pid.parent();
        // Single branch per update: the data server answered for the
        // whole parity fan-out, so the application entry completes here.
        let app = self.ctx.pending.applications.update.erase(
            parent_instance,
            parent_request,
            None,
            Some(key.as_bytes()),
        );
        let Some((app_pid, payload)) = app else {
            return;
        };
        self.reply_app(
            app_pid.owner,
            MessageId::new(parent_instance, parent_request),
            Payload::UpdateResponse {
                key,
                offset: payload.update.offset,
                length: payload.update.length,
                success,
            },
        )
        .await;
    }

    async fn handle_delete_response(&self, from: PeerAddr, id: MessageId, key: Key, success: bool) {
        let erased = self.ctx.pending.servers.del.erase(
            id.instance_id,
            id.request_id,
            Some(from),
            Some(key.as_bytes()),
        );
        let Some((pid, _)) = erased else {
            debug!(%key, "late or duplicate delete response dropped");
            return;
        };
        let (parent_instance, parent_request) = pid.parent();
        if let Some((app_pid, _)) = self.ctx.pending.applications.del.erase(
            parent_instance,
            parent_request,
            None,
            Some(key.as_bytes()),
        ) {
            self.reply_app(
                app_pid.owner,
                MessageId::new(parent_instance, parent_request),
                Payload::DeleteResponse { key, success },
            )
            .await;
        }
    }

    async fn handle_degraded_lock_response(
        &self,
        id: MessageId,
        key: Key,
        result: DegradedLockResult,
    ) {
        let erased = self.ctx.pending.servers.degraded_lock.erase(
            id.instance_id,
            id.request_id,
            Some(PeerAddr::Coordinator),
            Some(key.as_bytes()),
        );
        let Some((pid, data)) = erased else {
            debug!(%key, "late or duplicate lock response dropped");
            return;
        };
        let app_id = MessageId::new(pid.parent_instance_id, pid.parent_request_id);
        match result {
            DegradedLockResult::IsLocked {
                stripe_id,
                mapping,
                sealed,
            }
            | DegradedLockResult::WasLocked {
                stripe_id,
                mapping,
                sealed,
            } => {
                self.dispatch_degraded(data, app_id, stripe_id, mapping, sealed)
                    .await
            }
            DegradedLockResult::Remapped { remapped } => {
                self.dispatch_remapped(data, app_id, remapped).await
            }
            DegradedLockResult::NotExist => {
                match data.opcode {
                    DegradedOpcode::Get => {
                        // Confirmed absent: a notFound, not a failure.
                        if let Some((app_pid, _)) = self.ctx.pending.applications.get.erase(
                            app_id.instance_id,
                            app_id.request_id,
                            None,
                            Some(key.as_bytes()),
                        ) {
                            self.reply_app(
                                app_pid.owner,
                                app_id,
                                Payload::GetResponse { key, value: None },
                            )
                            .await;
                        }
                    }
                    DegradedOpcode::Update => {
                        self.fail_update_by_key(app_id, &key).await;
                    }
                    DegradedOpcode::Delete => {
                        self.fail_delete(app_id, &key).await;
                    }
                }
            }
        }
    }

    /// Lock granted (fresh or inherited): forward the buffered operation
    /// to the redirect server, which owns the reconstruction.
    async fn dispatch_degraded(
        &self,
        data: DegradedLockData,
        app_id: MessageId,
        stripe_id: u32,
        mapping: ReconstructionMapping,
        sealed: bool,
    ) {
        let key = data.key.clone();
        let loc = self.ctx.stripe_map.resolve(key.as_bytes());
        let redirect = mapping
            .redirect(loc.list_id, loc.chunk_id)
            .and_then(|(list, chunk)| self.ctx.stripe_map.resolve_chunk(list, chunk));
        let Some(server) = redirect else {
            warn!(%key, "lock mapping does not cover the key's slot");
            self.fail_opcode(data.opcode, app_id, &key, data.update.as_ref())
                .await;
            return;
        };
        let id = self.ctx.next_id(self.worker_id);
        let target = PeerAddr::Server(server);
        let payload = match data.opcode {
            DegradedOpcode::Get => {
                self.ctx
                    .pending
                    .servers
                    .get
                    .insert(branch_pid(id, app_id, target), key.clone());
                Payload::DegradedGetRequest {
                    key: key.clone(),
                    stripe_id,
                    mapping,
                    sealed,
                }
            }
            DegradedOpcode::Update => {
                let update = data.update.clone().unwrap_or_else(|| {
                    KeyValueUpdate::new(key.clone(), 0, Bytes::new())
                });
                self.ctx.pending.servers.update.insert(
                    branch_pid(id, app_id, target),
                    PendingUpdate::new(update.clone()),
                );
                Payload::DegradedUpdateRequest {
                    key: key.clone(),
                    offset: update.offset,
                    data: update.data,
                    stripe_id,
                    mapping,
                    sealed,
                }
            }
            DegradedOpcode::Delete => {
                self.ctx
                    .pending
                    .servers
                    .del
                    .insert(branch_pid(id, app_id, target), key.clone());
                Payload::DegradedDeleteRequest {
                    key: key.clone(),
                    stripe_id,
                    mapping,
                    sealed,
                }
            }
        };
        if !self.send_to(target, id, app_id, payload).await {
            self.erase_branch(data.opcode, id, &key);
            self.fail_opcode(data.opcode, app_id, &key, data.update.as_ref())
                .await;
        }
    }

    /// The key was relocated by an earlier SET during the outage; retry as
    /// a normal operation at the relocated slot.
    async fn dispatch_remapped(
        &self,
        data: DegradedLockData,
        app_id: MessageId,
        remapped: (u32, u32),
    ) {
        let key = data.key.clone();
        let Some(server) = self.ctx.stripe_map.resolve_chunk(remapped.0, remapped.1) else {
            self.fail_opcode(data.opcode, app_id, &key, data.update.as_ref())
                .await;
            return;
        };
        if self.ctx.health.is_down(server) {
            self.fail_opcode(data.opcode, app_id, &key, data.update.as_ref())
                .await;
            return;
        }
        let loc = StripeLocation {
            list_id: remapped.0,
            chunk_id: remapped.1,
        };
        let id = self.ctx.next_id(self.worker_id);
        let target = PeerAddr::Server(server);
        let payload = match data.opcode {
            DegradedOpcode::Get => {
                self.ctx
                    .pending
                    .servers
                    .get
                    .insert(branch_pid(id, app_id, target), key.clone());
                Payload::GetRequest { key: key.clone() }
            }
            DegradedOpcode::Update => {
                let update = data.update.clone().unwrap_or_else(|| {
                    KeyValueUpdate::new(key.clone(), 0, Bytes::new())
                });
                self.ctx.pending.servers.update.insert(
                    branch_pid(id, app_id, target),
                    PendingUpdate::new(update.clone()),
                );
                Payload::UpdateRequest {
                    key: key.clone(),
                    offset: update.offset,
                    data: update.data,
                    loc,
                }
            }
            DegradedOpcode::Delete => {
                self.ctx
                    .pending
                    .servers
                    .del
                    .insert(branch_pid(id, app_id, target), key.clone());
                Payload::DeleteRequest { key: key.clone(), loc }
            }
        };
        if !self.send_to(target, id, app_id, payload).await {
            self.erase_branch(data.opcode, id, &key);
            self.fail_opcode(data.opcode, app_id, &key, data.update.as_ref())
                .await;
        }
    }

    async fn handle_remap_lock_response(
        &self,
        id: MessageId,
        key: Key,
        remapped: (u32, u32),
        success: bool,
    ) {
        let erased = self.ctx.pending.servers.remapped_set.erase(
            id.instance_id,
            id.request_id,
            Some(PeerAddr::Coordinator),
            Some(key.as_bytes()),
        );
        let Some((pid, record)) = erased else {
            debug!(%key, "late or duplicate remap lock response dropped");
            return;
        };
        let app_id = MessageId::new(pid.parent_instance_id, pid.parent_request_id);
        if !success {
            self.fail_set(app_id, &key).await;
            return;
        }
        // The coordinator's slot is authoritative (an earlier SET for the
        // same key may have won).
        let Some(redirect_server) = self.ctx.stripe_map.resolve_chunk(remapped.0, remapped.1)
        else {
            self.fail_set(app_id, &key).await;
            return;
        };
        let loc = StripeLocation {
            list_id: remapped.0,
            chunk_id: remapped.1,
        };
        // Write to the replacement slot plus the healthy parity slots of
        // the list, so the record keeps its redundancy during the outage.
        let mut targets = vec![redirect_server];
        if let Some(parity) = self.ctx.stripe_map.parity_servers(remapped.0) {
            for &server in parity {
                if server != redirect_server && !self.ctx.health.is_down(server) {
                    targets.push(server);
                }
            }
        }
        let targets: Vec<ServerId> = targets
            .into_iter()
            .filter(|&s| !self.ctx.health.is_down(s))
            .collect();
        if targets.is_empty() {
            self.fail_set(app_id, &key).await;
            return;
        }
        let send_id = self.ctx.next_id(self.worker_id);
        for &server in &targets {
            self.ctx.pending.servers.remapped_set.insert(
                branch_pid(send_id, app_id, PeerAddr::Server(server)),
                record.clone(),
            );
        }
        for &server in &targets {
            let sent = self
                .send_to(
                    PeerAddr::Server(server),
                    send_id,
                    app_id,
                    Payload::SetRequest {
                        key: key.clone(),
                        value: record.value.clone(),
                        loc,
                    },
                )
                .await;
            if !sent {
                self.remapped_set_branch_done(send_id, PeerAddr::Server(server), &key, false)
                    .await;
            }
        }
    }

    fn handle_server_state(&self, server: ServerId, up: bool) {
        if up {
            self.ctx.health.mark_up(server);
            let window = self.ctx.pending.acks.lock().remove(&server);
            if let Some(mut window) = window {
                window.to_timestamp = self.ctx.timestamps.current();
                info!(
                    server,
                    from = window.from_timestamp,
                    to = window.to_timestamp,
                    "server recovered, outage window closed"
                );
            } else {
                info!(server, "server recovered");
            }
        } else if self.ctx.health.mark_down(server) {
            warn!(server, "server marked down");
            self.ctx.pending.acks.lock().insert(
                server,
                AcknowledgementInfo {
                    from_timestamp: self.ctx.timestamps.current(),
                    to_timestamp: 0,
                },
            );
        }
    }

    // --- expiry ---

    /// Expired application entries answer the client negatively; expired
    /// branch entries are dropped. Expiry uses the same erase path as
    /// responses, so a late response after expiry finds nothing to fire.
    pub async fn sweep_expired(&self, ttl: Duration) {
        let pending = &self.ctx.pending;
        let dropped = pending.servers.get.expire(ttl).len()
            + pending.servers.set.expire(ttl).len()
            + pending.servers.remapped_set.expire(ttl).len()
            + pending.servers.update.expire(ttl).len()
            + pending.servers.del.expire(ttl).len()
            + pending.servers.degraded_lock.expire(ttl).len()
            + pending.stats.get.expire(ttl).len()
            + pending.stats.set.expire(ttl).len();
        if dropped > 0 {
            warn!(dropped, "expired server-level pending entries");
        }

        for (pid, key) in pending.applications.get.expire(ttl) {
            warn!(%key, "get timed out");
            self.reply_app(
                pid.owner,
                MessageId::new(pid.instance_id, pid.request_id),
                Payload::GetResponse { key, value: None },
            )
            .await;
        }
        for (pid, kv) in pending.applications.set.expire(ttl) {
            warn!(key = %kv.key, "set timed out");
            self.reply_app(
                pid.owner,
                MessageId::new(pid.instance_id, pid.request_id),
                Payload::SetResponse {
                    key: kv.key,
                    success: false,
                },
            )
            .await;
        }
        for (pid, payload) in pending.applications.update.expire(ttl) {
            warn!(key = %payload.update.key, "update timed out");
            self.reply_app(
                pid.owner,
                MessageId::new(pid.instance_id, pid.request_id),
                Payload::UpdateResponse {
                    key: payload.update.key,
                    offset: payload.update.offset,
                    length: payload.update.length,
                    success: false,
                },
            )
            .await;
        }
        for (pid, key) in pending.applications.del.expire(ttl) {
            warn!(%key, "delete timed out");
            self.reply_app(
                pid.owner,
                MessageId::new(pid.instance_id, pid.request_id),
                Payload::DeleteResponse { key, success: false },
            )
            .await;
        }
    }

    // --- helpers ---

    fn erase_branch(&self, opcode: DegradedOpcode, id: MessageId, key: &Key) {
        match opcode {
            DegradedOpcode::Get => {
                self.ctx
                    .pending
                    .servers
                    .get
                    .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()));
            }
            DegradedOpcode::Update => {
                self.ctx
                    .pending
                    .servers
                    .update
                    .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()));
            }
            DegradedOpcode::Delete => {
                self.ctx
                    .pending
                    .servers
                    .del
                    .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()));
            }
        }
    }

    async fn fail_opcode(
        &self,
        opcode: DegradedOpcode,
        app_id: MessageId,
        key: &Key,
        update: Option<&KeyValueUpdate>,
    ) {
        match opcode {
            DegradedOpcode::Get => self.fail_get(app_id, key).await,
            DegradedOpcode::Update => {
                if let Some(update) = update {
                    self.fail_update(app_id, update).await;
                } else {
                    self.fail_update_by_key(app_id, key).await;
                }
            }
            DegradedOpcode::Delete => self.fail_delete(app_id, key).await,
        }
    }

    async fn fail_get(&self, app_id: MessageId, key: &Key) {
        if let Some((app_pid, _)) = self.ctx.pending.applications.get.erase(
            app_id.instance_id,
            app_id.request_id,
            None,
            Some(key.as_bytes()),
        ) {
            self.reply_app(
                app_pid.owner,
                app_id,
                Payload::GetResponse {
                    key: key.clone(),
                    value: None,
                },
            )
            .await;
        }
    }

    async fn fail_set(&self, app_id: MessageId, key: &Key) {
        if let Some((app_pid, _)) = self.ctx.pending.applications.set.erase(
            app_id.instance_id,
            app_id.request_id,
            None,
            Some(key.as_bytes()),
        ) {
            self.reply_app(
                app_pid.owner,
                app_id,
                Payload::SetResponse {
                    key: key.clone(),
                    success: false,
                },
            )
            .await;
        }
    }

    async fn fail_update(&self, app_id: MessageId, update: &KeyValueUpdate) {
        if let Some((app_pid, payload)) = self.ctx.pending.applications.update.erase(
            app_id.instance_id,
            app_id.request_id,
            None,
            Some(update.key.as_bytes()),
        ) {
            self.reply_app(
                app_pid.owner,
                app_id,
                Payload::UpdateResponse {
                    key: payload.update.key,
                    offset: payload.update.offset,
                    length: payload.update.length,
                    success: false,
                },
            )
            .await;
        }
    }

    async fn fail_update_by_key(&self, app_id: MessageId, key: &Key) {
        if let Some((app_pid, payload)) = self.ctx.pending.applications.update.erase(
            app_id.instance_id,
            app_id.request_id,
            None,
            Some(key.as_bytes()),
        ) {
            self.reply_app(
                app_pid.owner,
                app_id,
                Payload::UpdateResponse {
                    key: payload.update.key,
                    offset: payload.update.offset,
                    length: payload.update.length,
                    success: false,
                },
            )
            .await;
        }
    }

    async fn fail_delete(&self, app_id: MessageId, key: &Key) {
        if let Some((app_pid, _)) = self.ctx.pending.applications.del.erase(
            app_id.instance_id,
            app_id.request_id,
            None,
            Some(key.as_bytes()),
        ) {
            self.reply_app(
                app_pid.owner,
                app_id,
                Payload::DeleteResponse {
                    key: key.clone(),
                    success: false,
                },
            )
            .await;
        }
    }

    async fn reply_app(&self, owner: Option<PeerAddr>, app_id: MessageId, payload: Payload) {
        match owner {
            Some(PeerAddr::App(handle)) => {
                let msg =
                    Message::request(PeerAddr::Gateway(self.ctx.instance_id), app_id, payload);
                self.ctx.conns.send(handle, msg).await;
            }
            other => warn!(?other, "application entry without a connection owner"),
        }
    }

    async fn send_to(
        &self,
        target: PeerAddr,
        id: MessageId,
        parent: MessageId,
        payload: Payload,
    ) -> bool {
        let msg = Message::request(PeerAddr::Gateway(self.ctx.instance_id), id, payload)
            .with_parent(parent)
            .with_timestamp(self.ctx.timestamps.next());
        match self.ctx.transport.send(target, msg).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%target, "send failed: {}", e);
                false
            }
        }
    }
}

fn root_pid(app_id: MessageId, owner: PeerAddr) -> Pid {
    Pid::root(app_id.instance_id, app_id.request_id, Some(owner))
}

fn branch_pid(id: MessageId, parent: MessageId, owner: PeerAddr) -> Pid {
    Pid::new(
        id.instance_id,
        parent.instance_id,
        id.request_id,
        parent.request_id,
        Some(owner),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use proto::config::{ClusterConfig, ServerPeer};
    use proto::InMemoryHub;
    use sk_core::RequestId;

    struct Harness {
        worker: GatewayWorker,
        hub: InMemoryHub,
        server_rx: Vec<mpsc::Receiver<Message>>,
        coord_rx: mpsc::Receiver<Message>,
        app_conn: ConnHandle,
        app_rx: mpsc::Receiver<Message>,
    }

    fn harness() -> Harness {
        let mut config = GatewayConfig::default();
        config.gateway.instance_id = 1;
        config.gateway.workers = 1;
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

        let hub = InMemoryHub::new();
        let server_rx = (0..4).map(|id| hub.register(PeerAddr::Server(id))).collect();
        let coord_rx = hub.register(PeerAddr::Coordinator);
        let ctx = Arc::new(ServiceContext::new(config, Arc::new(hub.clone())));

        let (app_tx, app_rx) = mpsc::channel(16);
        let app_conn = ctx.conns.register(app_tx);
        Harness {
            worker: GatewayWorker::new(ctx, 0),
            hub,
            server_rx,
            coord_rx,
            app_conn,
            app_rx,
        }
    }

    fn app_msg(request_id: RequestId, payload: Payload) -> Message {
        Message::request(
            PeerAddr::App(ConnHandle::new(0, 1)),
            MessageId::new(100, request_id),
            payload,
        )
    }

    fn response(from: PeerAddr, req: &Message, payload: Payload) -> Message {
        Message::request(from, req.id, payload).with_parent(req.parent_id)
    }

    fn data_server_of(ctx: &ServiceContext, key: &Key) -> (StripeLocation, ServerId) {
        let loc = ctx.stripe_map.resolve(key.as_bytes());
        (loc, ctx.stripe_map.resolve_chunk(loc.list_id, loc.chunk_id).unwrap())
    }

    #[tokio::test]
    async fn test_get_round_trip() {
        let mut h = harness();
        let key = Key::from("foo");
        let (_, target) = data_server_of(h.worker.context(), &key);

        h.worker
            .handle_app(h.app_conn, app_msg(1, Payload::GetRequest { key: key.clone() }))
            .await;

        let req = h.server_rx[target as usize].recv().await.unwrap();
        assert!(matches!(req.payload, Payload::GetRequest { .. }));
        assert_eq!(req.parent_id, MessageId::new(100, 1));

        h.worker
            .handle_peer(response(
                PeerAddr::Server(target),
                &req,
                Payload::GetResponse {
                    key: key.clone(),
                    value: Some(Bytes::from_static(b"bar")),
                },
            ))
            .await;

        let reply = h.app_rx.recv().await.unwrap();
        assert_eq!(reply.id, MessageId::new(100, 1));
        match reply.payload {
            Payload::GetResponse { value, .. } => {
                assert_eq!(value, Some(Bytes::from_static(b"bar")))
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(h.worker.context().pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_set_fans_out_and_last_ack_replies() {
        let mut h = harness();
        let key = Key::from("foo");
        let (loc, _) = data_server_of(h.worker.context(), &key);
        let servers: Vec<ServerId> = h
            .worker
            .context()
            .stripe_map
            .servers_of(loc.list_id)
            .unwrap()
            .to_vec();

        h.worker
            .handle_app(
                h.app_conn,
                app_msg(
                    2,
                    Payload::SetRequest {
                        key: key.clone(),
                        value: Bytes::from_static(b"bar"),
                        loc: StripeLocation { list_id: 0, chunk_id: 0 },
                    },
                ),
            )
            .await;

        // All k+m servers of the list got one branch.
        let mut requests = Vec::new();
        for &server in &servers {
            let req = h.server_rx[server as usize].recv().await.unwrap();
            assert!(matches!(req.payload, Payload::SetRequest { .. }));
            requests.push((server, req));
        }

        // All but the last ack produce no reply.
        for (server, req) in &requests[..requests.len() - 1] {
            h.worker
                .handle_peer(response(
                    PeerAddr::Server(*server),
                    req,
                    Payload::SetResponse {
                        key: key.clone(),
                        success: true,
                    },
                ))
                .await;
            assert!(h.app_rx.try_recv().is_err());
        }
        let (server, req) = &requests[requests.len() - 1];
        h.worker
            .handle_peer(response(
                PeerAddr::Server(*server),
                req,
                Payload::SetResponse {
                    key: key.clone(),
                    success: true,
                },
            ))
            .await;

        let reply = h.app_rx.recv().await.unwrap();
        assert!(matches!(
            reply.payload,
            Payload::SetResponse { success: true, .. }
        ));
        assert_eq!(h.worker.context().pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_set_failed_branch_fails_once() {
        let mut h = harness();
        let key = Key::from("foo");
        let (loc, _) = data_server_of(h.worker.context(), &key);
        let servers: Vec<ServerId> = h
            .worker
            .context()
            .stripe_map
            .servers_of(loc.list_id)
            .unwrap()
            .to_vec();

        h.worker
            .handle_app(
                h.app_conn,
                app_msg(
                    3,
                    Payload::SetRequest {
                        key: key.clone(),
                        value: Bytes::from_static(b"bar"),
                        loc: StripeLocation { list_id: 0, chunk_id: 0 },
                    },
                ),
            )
            .await;

        let mut requests = Vec::new();
        for &server in &servers {
            requests.push((server, h.server_rx[server as usize].recv().await.unwrap()));
        }

        // First branch fails; the client hears failure exactly once, even
        // after the remaining successes arrive.
        for (i, (server, req)) in requests.iter().enumerate() {
            h.worker
                .handle_peer(response(
                    PeerAddr::Server(*server),
                    req,
                    Payload::SetResponse {
                        key: key.clone(),
                        success: i != 0,
                    },
                ))
                .await;
        }
        let reply = h.app_rx.recv().await.unwrap();
        assert!(matches!(
            reply.payload,
            Payload::SetResponse { success: false, .. }
        ));
        assert!(h.app_rx.try_recv().is_err());
        assert_eq!(h.worker.context().pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_update_single_branch_completes_app_entry() {
        let mut h = harness();
        let key = Key::from("foo");
        let (loc, target) = data_server_of(h.worker.context(), &key);

        h.worker
            .handle_app(
                h.app_conn,
                app_msg(
                    3,
                    Payload::UpdateRequest {
                        key: key.clone(),
                        offset: 2,
                        data: Bytes::from_static(b"XY"),
                        loc,
                    },
                ),
            )
            .await;

        // One branch only: the data server fans the parity deltas itself.
        let req = h.server_rx[target as usize].recv().await.unwrap();
        assert!(matches!(req.payload, Payload::UpdateRequest { .. }));
        for (i, rx) in h.server_rx.iter_mut().enumerate() {
            if i != target as usize {
                assert!(rx.try_recv().is_err());
            }
        }

        h.worker
            .handle_peer(response(
                PeerAddr::Server(target),
                &req,
                Payload::UpdateResponse {
                    key: key.clone(),
                    offset: 2,
                    length: 2,
                    success: true,
                },
            ))
            .await;

        let reply = h.app_rx.recv().await.unwrap();
        assert_eq!(reply.id, MessageId::new(100, 3));
        match reply.payload {
            Payload::UpdateResponse {
                offset,
                length,
                success,
                ..
            } => {
                assert_eq!((offset, length), (2, 2));
                assert!(success);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(h.worker.context().pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_down_data_slot_escalates_to_degraded_lock() {
        let mut h = harness();
        let key = Key::from("foo");
        let (loc, target) = data_server_of(h.worker.context(), &key);
        h.worker.context().health.mark_down(target);

        h.worker
            .handle_app(h.app_conn, app_msg(4, Payload::GetRequest { key: key.clone() }))
            .await;

        let lock_req = h.coord_rx.recv().await.unwrap();
        let mapping = match &lock_req.payload {
            Payload::DegradedLockRequest { mapping, .. } => mapping.clone(),
            other => panic!("unexpected message: {:?}", other),
        };
        assert_eq!(mapping.original, vec![(loc.list_id, loc.chunk_id)]);
        let (redirect_list, redirect_chunk) = mapping.reconstructed[0];
        let redirect_server = h
            .worker
            .context()
            .stripe_map
            .resolve_chunk(redirect_list, redirect_chunk)
            .unwrap();
        assert_ne!(redirect_server, target);

        h.worker
            .handle_peer(response(
                PeerAddr::Coordinator,
                &lock_req,
                Payload::DegradedLockResponse {
                    key: key.clone(),
                    result: DegradedLockResult::IsLocked {
                        stripe_id: 0,
                        mapping: mapping.clone(),
                        sealed: true,
                    },
                },
            ))
            .await;

        let degraded = h.server_rx[redirect_server as usize].recv().await.unwrap();
        assert!(matches!(degraded.payload, Payload::DegradedGetRequest { .. }));

        h.worker
            .handle_peer(response(
                PeerAddr::Server(redirect_server),
                &degraded,
                Payload::GetResponse {
                    key: key.clone(),
                    value: Some(Bytes::from_static(b"bar")),
                },
            ))
            .await;

        let reply = h.app_rx.recv().await.unwrap();
        assert_eq!(reply.id, MessageId::new(100, 4));
        assert!(matches!(
            reply.payload,
            Payload::GetResponse { value: Some(_), .. }
        ));
        assert_eq!(h.worker.context().pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_degraded_lock_not_exist_is_not_found() {
        let mut h = harness();
        let key = Key::from("foo");
        let (_, target) = data_server_of(h.worker.context(), &key);
        h.worker.context().health.mark_down(target);

        h.worker
            .handle_app(h.app_conn, app_msg(5, Payload::GetRequest { key: key.clone() }))
            .await;
        let lock_req = h.coord_rx.recv().await.unwrap();
        h.worker
            .handle_peer(response(
                PeerAddr::Coordinator,
                &lock_req,
                Payload::DegradedLockResponse {
                    key: key.clone(),
                    result: DegradedLockResult::NotExist,
                },
            ))
            .await;

        let reply = h.app_rx.recv().await.unwrap();
        assert!(matches!(
            reply.payload,
            Payload::GetResponse { value: None, .. }
        ));
        assert_eq!(h.worker.context().pending.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_expired_request_answers_client_once() {
        let mut h = harness();
        let key = Key::from("foo");
        h.worker
            .handle_app(h.app_conn, app_msg(6, Payload::GetRequest { key: key.clone() }))
            .await;
        // Server never answers; the sweep fails the request.
        h.worker.sweep_expired(Duration::from_millis(0)).await;

        let reply = h.app_rx.recv().await.unwrap();
        assert!(matches!(
            reply.payload,
            Payload::GetResponse { value: None, .. }
        ));
        assert_eq!(h.worker.context().pending.in_flight(), 0);

        // A late server response after expiry must not fire again.
        let (_, target) = data_server_of(h.worker.context(), &key);
        let req = h.server_rx[target as usize].recv().await.unwrap();
        h.worker
            .handle_peer(response(
                PeerAddr::Server(target),
                &req,
                Payload::GetResponse {
                    key: key.clone(),
                    value: Some(Bytes::from_static(b"late")),
                },
            ))
            .await;
        assert!(h.app_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_state_notify_tracks_outage_window() {
        let h = harness();
        h.worker
            .handle_peer(Message::request(
                PeerAddr::Coordinator,
                MessageId::new(0, 1),
                Payload::ServerStateNotify { server: 2, up: false },
            ))
            .await;
        assert!(h.worker.context().health.is_down(2));
        assert!(h.worker.context().pending.acks.lock().contains_key(&2));

        h.worker
            .handle_peer(Message::request(
                PeerAddr::Coordinator,
                MessageId::new(0, 2),
                Payload::ServerStateNotify { server: 2, up: true },
            ))
            .await;
        assert!(!h.worker.context().health.is_down(2));
        assert!(h.worker.context().pending.acks.lock().is_empty());
        drop(h.hub);
    }
}
