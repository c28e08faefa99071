//! Storage server event loop
//!
//! One server plays three roles per stripe list, decided by the stripe
//! map: data slot owner (stores and indexes records), parity slot owner
//! (mirrors every write of the list and materializes parity shards), or
//! plain acknowledger. Degraded operations arrive at a redirect slot,
//! which gathers shards from the stripe's survivors, reconciles seal
//! states, decodes the missing chunk, and serves every queued waiter
//! from the reconstructed copy.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chunk_buffer::ChunkBufferStore;
use crate::config::StoreNodeConfig;
use crate::degraded::{DegradedChunkDirectory, DegradedOp, InsertOutcome, Waiter};
use crate::kv_map::{KeyMetadata, Map, SealedChunk};
use crate::pending::{
    BatchProgress, DeferredDelete, DeferredUpdate, JobKind, Pid, ReconstructionJob, ServerPending,
    ShardData,
};
use coding::{force_seal, new_engine, CodingEngine, CodingError, SealState};
use proto::{Message, MessageId, Payload, PeerAddr, Transport};
use sk_core::{
    ChunkPool, HealthMap, IdGenerator, InstanceId, Key, KeyValueUpdate, Metadata, ServerId,
    StripeMap, RECORD_HEADER_SIZE,
};

pub struct StoreNodeContext {
    pub config: StoreNodeConfig,
    pub server_id: ServerId,
    pub stripe_map: StripeMap,
    pub health: HealthMap,
    pub engine: Arc<dyn CodingEngine>,
    pub map: Map,
    pub buffers: ChunkBufferStore,
    pub degraded: DegradedChunkDirectory,
    pub pending: ServerPending,
    pub id_gen: IdGenerator,
    pub pool: Arc<ChunkPool>,
    pub transport: Arc<dyn Transport>,
}

impl StoreNodeContext {
    pub fn new(
        config: StoreNodeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CodingError> {
        let stripe_map = StripeMap::new(
            &config.cluster.server_ids(),
            config.stripe.list_count as usize,
            config.stripe.data_chunks as usize,
            config.stripe.parity_chunks as usize,
        );
        let engine = new_engine(
            config.stripe.scheme,
            config.stripe.data_chunks as usize,
            config.stripe.parity_chunks as usize,
        )?;
        let pool = Arc::new(ChunkPool::new(
            config.stripe.chunk_size as usize,
            config.server.chunk_pool_size,
        ));
        let server_id = config.server.server_id;
        Ok(Self {
            config,
            server_id,
            stripe_map,
            health: HealthMap::new(),
            engine,
            map: Map::new(),
            buffers: ChunkBufferStore::new(pool.clone()),
            degraded: DegradedChunkDirectory::new(),
            pending: ServerPending::new(),
            id_gen: IdGenerator::new(1),
            pool,
            transport,
        })
    }

    fn next_id(&self) -> MessageId {
        MessageId::new(self.server_id as InstanceId, self.id_gen.next(0))
    }

    fn addr(&self) -> PeerAddr {
        PeerAddr::Server(self.server_id)
    }
}

/// XOR `delta` into `buf` at `pos`. This is the single primitive behind
/// parity maintenance: a value delta against a record copy, a record
/// XOR-ed out of an aggregate, and a record zeroed in place are all the
/// same operation.
fn xor_at(buf: &mut [u8], pos: usize, delta: &[u8]) -> bool {
    let end = pos + delta.len();
    if end > buf.len() {
        return false;
    }
    for (b, d) in buf[pos..end].iter_mut().zip(delta) {
        *b ^= d;
    }
    true
}

pub struct StoreNodeWorker {
    ctx: Arc<StoreNodeContext>,
}

impl StoreNodeWorker {
    pub fn new(ctx: Arc<StoreNodeContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<StoreNodeContext> {
        &self.ctx
    }

    pub async fn run(self, mut inbound: mpsc::Receiver<Message>) {
        let mut heartbeat = tokio::time::interval(self.ctx.config.server.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => {
                        info!("inbound queue closed, server stopping");
                        return;
                    }
                },
                _ = heartbeat.tick() => self.send_heartbeat().await,
            }
        }
    }

    pub async fn handle(&self, msg: Message) {
        let from = msg.from;
        let id = msg.id;
        match msg.payload {
            Payload::GetRequest { key } => self.handle_get(from, id, key).await,
            Payload::SetRequest { key, value, loc } => {
                self.handle_set(from, id, key, value, loc.list_id, loc.chunk_id)
                    .await
            }
            Payload::UpdateRequest {
                key, offset, data, ..
            } => self.handle_update(from, id, key, offset, data).await,
            Payload::DeleteRequest { key, .. } => self.handle_delete(from, id, key).await,
            Payload::ParityUpdateRequest {
                key,
                metadata,
                chunk_offset,
                value_offset,
                xor_delta,
            } => {
                self.handle_parity_update(from, id, key, metadata, chunk_offset, value_offset, xor_delta)
                    .await
            }
            Payload::ParityDeleteRequest {
                key,
                metadata,
                chunk_offset,
                record,
            } => {
                self.handle_parity_delete(from, id, key, metadata, chunk_offset, record)
                    .await
            }
            Payload::ParityUpdateResponse { key, success } => {
                self.handle_parity_update_ack(from, id, key, success).await
            }
            Payload::ParityDeleteResponse { key, success } => {
                self.handle_parity_delete_ack(from, id, key, success).await
            }
            Payload::SealChunkRequest {
                metadata,
                count,
                size,
                data,
            } => self.handle_seal_chunk(from, id, metadata, count, size, data).await,
            Payload::SealChunkResponse { metadata, success } => {
                debug!(%metadata, success, "seal acknowledged");
            }
            Payload::GetChunkRequest { metadata } => {
                self.handle_get_chunk(from, id, metadata).await
            }
            Payload::GetChunkResponse {
                metadata,
                seal,
                count,
                size,
                data,
            } => {
                self.handle_get_chunk_response(id, metadata, seal, count, size, data)
                    .await
            }
            Payload::DegradedGetRequest {
                key, stripe_id, sealed, ..
            } => {
                self.handle_degraded(from, id, key, stripe_id, sealed, DegradedOp::Get)
                    .await
            }
            Payload::DegradedUpdateRequest {
                key,
                offset,
                data,
                stripe_id,
                sealed,
                ..
            } => {
                self.handle_degraded(
                    from,
                    id,
                    key,
                    stripe_id,
                    sealed,
                    DegradedOp::Update { offset, data },
                )
                .await
            }
            Payload::DegradedDeleteRequest {
                key, stripe_id, sealed, ..
            } => {
                self.handle_degraded(from, id, key, stripe_id, sealed, DegradedOp::Delete)
                    .await
            }
            Payload::ReconstructionRequest {
                list_id,
                chunk_id,
                stripe_ids,
            } => {
                self.handle_reconstruction_request(id, list_id, chunk_id, stripe_ids)
                    .await
            }
            Payload::RegisterResponse { success } => {
                if success {
                    info!("registered with coordinator");
                } else {
                    error!("coordinator rejected registration");
                }
            }
            Payload::ReleaseDegradedLockResponse { count } => {
                debug!(count, "degraded locks released");
            }
            Payload::ServerStateNotify { server, up } => self.handle_server_state(server, up),
            other => warn!(%from, "unexpected message at server: {:?}", other),
        }
    }

    // --- normal data path ---

    async fn handle_get(&self, from: PeerAddr, id: MessageId, key: Key) {
        let value = self.read_value(&key);
        self.reply(from, id, Payload::GetResponse { key, value }).await;
    }

    fn read_value(&self, key: &Key) -> Option<Bytes> {
        let location = self.ctx.map.lookup(key)?;
        if let Some(sealed) = self.ctx.map.find_sealed(&location.metadata) {
            return sealed.chunk.get_key_value(location.offset).map(|kv| kv.value);
        }
        self.ctx
            .buffers
            .with_active(&location.metadata, |chunk| chunk.get_key_value(location.offset))
            .flatten()
            .map(|kv| kv.value)
    }

    /// Role dispatch for a SET: the slot owner stores and indexes, a
    /// parity slot of the list mirrors the record, everyone else only
    /// acknowledges so the gateway's fan-out completes.
    async fn handle_set(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        value: Bytes,
        list_id: u32,
        chunk_id: u32,
    ) {
        let owner = self.ctx.stripe_map.resolve_chunk(list_id, chunk_id);
        let is_parity = self
            .ctx
            .stripe_map
            .parity_servers(list_id)
            .map(|p| p.contains(&self.ctx.server_id))
            .unwrap_or(false);
        let kv = sk_core::KeyValue::new(key.clone(), value);

        let success = if owner == Some(self.ctx.server_id) {
            match self.ctx.buffers.append(list_id, chunk_id, &kv) {
                Some(outcome) => {
                    self.ctx.map.insert_key(
                        key.clone(),
                        KeyMetadata {
                            metadata: outcome.location,
                            offset: outcome.offset,
                        },
                    );
                    if let Some((metadata, chunk)) = outcome.sealed {
                        self.seal_owned_chunk(metadata, chunk).await;
                    }
                    true
                }
                None => {
                    warn!(%key, "record exceeds chunk capacity");
                    false
                }
            }
        } else if is_parity {
            match self.ctx.buffers.append(list_id, chunk_id, &kv) {
                Some(outcome) => {
                    if let Some((metadata, chunk)) = outcome.sealed {
                        // Mirror overflowed before the authoritative seal
                        // arrived; park it until the owner ships one.
                        self.ctx.map.insert_sealed(
                            metadata,
                            SealedChunk {
                                seal: SealState::SealPending,
                                chunk,
                            },
                            false,
                        );
                    }
                    true
                }
                None => false,
            }
        } else {
            // Not this server's record; the ack keeps the fan-out counter
            // honest.
            true
        };
        self.reply(from, id, Payload::SetResponse { key, success })
            .await;
    }

    /// A chunk this server owns filled up: cache it, announce it, and
    /// ship the authoritative bytes to every parity slot of the list.
    async fn seal_owned_chunk(&self, metadata: Metadata, chunk: sk_core::Chunk) {
        info!(%metadata, count = chunk.count(), size = chunk.size(), "chunk sealed");
        let payload = Payload::SealChunkRequest {
            metadata,
            count: chunk.count(),
            size: chunk.size(),
            data: Bytes::copy_from_slice(chunk.as_bytes()),
        };
        self.ctx.map.insert_sealed(
            metadata,
            SealedChunk {
                seal: SealState::Sealed,
                chunk,
            },
            true,
        );
        for &server in self
            .ctx
            .stripe_map
            .parity_servers(metadata.list_id)
            .unwrap_or(&[])
        {
            if self.ctx.health.is_down(server) {
                continue;
            }
            let id = self.ctx.next_id();
            let msg = Message::request(self.ctx.addr(), id, payload.clone());
            if let Err(e) = self.ctx.transport.send(PeerAddr::Server(server), msg).await {
                warn!(server, %metadata, "seal dispatch failed: {}", e);
            }
        }
    }

    async fn handle_update(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        offset: u32,
        data: Bytes,
    ) {
        let Some(location) = self.ctx.map.lookup(&key) else {
            self.reply(
                from,
                id,
                Payload::UpdateResponse {
                    key,
                    offset,
                    length: data.len() as u32,
                    success: false,
                },
            )
            .await;
            return;
        };
        let update = KeyValueUpdate::new(key.clone(), offset, data);
        let applied = self.apply_update_locally(&location, &update);
        let Some(delta) = applied else {
            self.reply(
                from,
                id,
                Payload::UpdateResponse {
                    key,
                    offset,
                    length: update.length,
                    success: false,
                },
            )
            .await;
            return;
        };
        self.fan_parity_update(from, id, key, location.metadata, location.offset, update, delta)
            .await;
    }

    /// Overwrite the value range in place and return the XOR delta
    /// (old ^ new) the parity slots need.
    fn apply_update_locally(
        &self,
        location: &KeyMetadata,
        update: &KeyValueUpdate,
    ) -> Option<Bytes> {
        let apply = |chunk: &mut sk_core::Chunk| -> Option<Bytes> {
            let kv = chunk.get_key_value(location.offset)?;
            let end = update.offset as usize + update.length as usize;
            if end > kv.value.len() {
                return None;
            }
            let pos = location.offset as usize
                + RECORD_HEADER_SIZE
                + kv.key.size()
                + update.offset as usize;
            let mut delta: Vec<u8> = chunk.as_bytes()[pos..pos + update.length as usize].to_vec();
            for (d, n) in delta.iter_mut().zip(update.data.iter()) {
                *d ^= n;
            }
            if !chunk.update_value(location.offset, kv.key.size(), update.offset, &update.data) {
                return None;
            }
            Some(Bytes::from(delta))
        };
        if self.ctx.map.find_sealed(&location.metadata).is_some() {
            self.ctx
                .map
                .with_sealed_mut(&location.metadata, |sealed| apply(&mut sealed.chunk))
                .flatten()
        } else {
            self.ctx
                .buffers
                .with_active(&location.metadata, apply)
                .flatten()
        }
    }

    /// Fan the XOR delta to the healthy parity slots and defer the
    /// gateway reply until the last ack.
    #[allow(clippy::too_many_arguments)]
    async fn fan_parity_update(
        &self,
        from: PeerAddr,
        request_id: MessageId,
        key: Key,
        metadata: Metadata,
        chunk_offset: u32,
        update: KeyValueUpdate,
        delta: Bytes,
    ) {
        let targets = self.healthy_parity_servers(metadata.list_id);
        if targets.is_empty() {
            self.reply(
                from,
                request_id,
                Payload::UpdateResponse {
                    key,
                    offset: update.offset,
                    length: update.length,
                    success: true,
                },
            )
            .await;
            return;
        }
        let id = self.ctx.next_id();
        for &server in &targets {
            self.ctx.pending.parity_update.insert(
                branch_pid(id, request_id, PeerAddr::Server(server)),
                DeferredUpdate {
                    key: key.clone(),
                    offset: update.offset,
                    length: update.length,
                },
            );
        }
        for &server in &targets {
            let msg = Message::request(
                self.ctx.addr(),
                id,
                Payload::ParityUpdateRequest {
                    key: key.clone(),
                    metadata,
                    chunk_offset,
                    value_offset: update.offset,
                    xor_delta: delta.clone(),
                },
            )
            .with_parent(request_id);
            if self
                .ctx
                .transport
                .send(PeerAddr::Server(server), msg)
                .await
                .is_err()
            {
                self.handle_parity_update_ack(PeerAddr::Server(server), id, key.clone(), false)
                    .await;
            }
        }
    }

    async fn handle_delete(&self, from: PeerAddr, id: MessageId, key: Key) {
        let Some(location) = self.ctx.map.remove_key(&key) else {
            self.reply(from, id, Payload::DeleteResponse { key, success: false })
                .await;
            return;
        };
        let Some(record) = self.zero_record(&location) else {
            self.reply(from, id, Payload::DeleteResponse { key, success: false })
                .await;
            return;
        };
        self.fan_parity_delete(from, id, key, location.metadata, location.offset, record)
            .await;
    }

    /// XOR the record with itself (zeroing it in place) and return the
    /// original bytes so the parity slots can XOR them out too.
    fn zero_record(&self, location: &KeyMetadata) -> Option<Bytes> {
        let zero = |chunk: &mut sk_core::Chunk| -> Option<Bytes> {
            let kv = chunk.get_key_value(location.offset)?;
            let len = kv.serialized_size();
            let pos = location.offset as usize;
            let record = Bytes::copy_from_slice(&chunk.as_bytes()[pos..pos + len]);
            let delta = record.clone();
            xor_at(chunk.as_bytes_mut(), pos, &delta);
            Some(record)
        };
        if self.ctx.map.find_sealed(&location.metadata).is_some() {
            self.ctx
                .map
                .with_sealed_mut(&location.metadata, |sealed| zero(&mut sealed.chunk))
                .flatten()
        } else {
            self.ctx
                .buffers
                .with_active(&location.metadata, zero)
                .flatten()
        }
    }

    async fn fan_parity_delete(
        &self,
        from: PeerAddr,
        request_id: MessageId,
        key: Key,
        metadata: Metadata,
        chunk_offset: u32,
        record: Bytes,
    ) {
        let targets = self.healthy_parity_servers(metadata.list_id);
        if targets.is_empty() {
            self.reply(from, request_id, Payload::DeleteResponse { key, success: true })
                .await;
            return;
        }
        let id = self.ctx.next_id();
        for &server in &targets {
            self.ctx.pending.parity_delete.insert(
                branch_pid(id, request_id, PeerAddr::Server(server)),
                DeferredDelete { key: key.clone() },
            );
        }
        for &server in &targets {
            let msg = Message::request(
                self.ctx.addr(),
                id,
                Payload::ParityDeleteRequest {
                    key: key.clone(),
                    metadata,
                    chunk_offset,
                    record: record.clone(),
                },
            )
            .with_parent(request_id);
            if self
                .ctx
                .transport
                .send(PeerAddr::Server(server), msg)
                .await
                .is_err()
            {
                self.handle_parity_delete_ack(PeerAddr::Server(server), id, key.clone(), false)
                    .await;
            }
        }
    }

    // --- parity maintenance ---

    /// Apply an XOR delta at a record's value position. Works unchanged on
    /// an unsealed mirror, a parked mirror copy, and a materialized parity
    /// aggregate, since all three hold the record bytes at the same place.
    async fn handle_parity_update(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        metadata: Metadata,
        chunk_offset: u32,
        value_offset: u32,
        xor_delta: Bytes,
    ) {
        let pos = chunk_offset as usize + RECORD_HEADER_SIZE + key.size() + value_offset as usize;
        let success = self.xor_all_copies(&metadata, pos, &xor_delta);
        if !success {
            warn!(%key, %metadata, "parity update found no target copy");
        }
        self.reply(from, id, Payload::ParityUpdateResponse { key, success })
            .await;
    }

    async fn handle_parity_delete(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        metadata: Metadata,
        chunk_offset: u32,
        record: Bytes,
    ) {
        let success = self.xor_all_copies(&metadata, chunk_offset as usize, &record);
        if !success {
            warn!(%key, %metadata, "parity delete found no target copy");
        }
        self.reply(from, id, Payload::ParityDeleteResponse { key, success })
            .await;
    }

    /// XOR a delta into every local copy derived from the named chunk:
    /// the mirror (active or parked) and, if already materialized, the
    /// parity aggregates of the stripe.
    fn xor_all_copies(&self, metadata: &Metadata, pos: usize, delta: &[u8]) -> bool {
        let mut touched = false;
        if let Some(applied) = self
            .ctx
            .buffers
            .with_active(metadata, |chunk| xor_at(chunk.as_bytes_mut(), pos, delta))
        {
            touched |= applied;
        }
        if let Some(applied) = self
            .ctx
            .map
            .with_sealed_mut(metadata, |sealed| xor_at(sealed.chunk.as_bytes_mut(), pos, delta))
        {
            touched |= applied;
        }
        let k = self.ctx.engine.k() as u32;
        for parity_slot in k..k + self.ctx.engine.m() as u32 {
            let parity_meta = Metadata::new(metadata.list_id, metadata.stripe_id, parity_slot);
            if self.ctx.stripe_map.resolve_chunk(metadata.list_id, parity_slot)
                != Some(self.ctx.server_id)
            {
                continue;
            }
            if let Some(applied) = self
                .ctx
                .map
                .with_sealed_mut(&parity_meta, |sealed| {
                    xor_at(sealed.chunk.as_bytes_mut(), pos, delta)
                })
            {
                touched |= applied;
            }
        }
        touched
    }

    async fn handle_parity_update_ack(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        success: bool,
    ) {
        let erased = self.ctx.pending.parity_update.erase_and_count(
            id.instance_id,
            id.request_id,
            Some(from),
            Some(key.as_bytes()),
        );
        let Some((pid, deferred, remaining)) = erased else {
            debug!(%key, "late or duplicate parity update ack dropped");
            return;
        };
        if !success {
            // Drain the siblings so a later ack cannot reply again.
            while self
                .ctx
                .pending
                .parity_update
                .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()))
                .is_some()
            {}
            self.reply_deferred(
                &pid,
                Payload::UpdateResponse {
                    key,
                    offset: deferred.offset,
                    length: deferred.length,
                    success: false,
                },
            )
            .await;
            return;
        }
        if remaining == 0 {
            self.reply_deferred(
                &pid,
                Payload::UpdateResponse {
                    key,
                    offset: deferred.offset,
                    length: deferred.length,
                    success: true,
                },
            )
            .await;
        }
    }

    async fn handle_parity_delete_ack(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        success: bool,
    ) {
        let erased = self.ctx.pending.parity_delete.erase_and_count(
            id.instance_id,
            id.request_id,
            Some(from),
            Some(key.as_bytes()),
        );
        let Some((pid, _, remaining)) = erased else {
            debug!(%key, "late or duplicate parity delete ack dropped");
            return;
        };
        if !success {
            while self
                .ctx
                .pending
                .parity_delete
                .erase(id.instance_id, id.request_id, None, Some(key.as_bytes()))
                .is_some()
            {}
            self.reply_deferred(&pid, Payload::DeleteResponse { key, success: false })
                .await;
            return;
        }
        if remaining == 0 {
            self.reply_deferred(&pid, Payload::DeleteResponse { key, success: true })
                .await;
        }
    }

    /// Authoritative seal from the slot owner: the mirror copy is replaced
    /// outright, and once all k slots of the stripe are sealed the parity
    /// shard is computed and cached.
    async fn handle_seal_chunk(
        &self,
        from: PeerAddr,
        id: MessageId,
        metadata: Metadata,
        count: u32,
        size: u32,
        data: Bytes,
    ) {
        // Discard the live mirror if it is still on this stripe.
        if self.ctx.buffers.current_stripe(metadata.list_id, metadata.chunk_id)
            == metadata.stripe_id
        {
            self.ctx.buffers.seal_now(metadata.list_id, metadata.chunk_id);
        }
        self.ctx.map.insert_sealed(
            metadata,
            SealedChunk {
                seal: SealState::Sealed,
                chunk: sk_core::Chunk::from_bytes(data.to_vec(), count, size),
            },
            false,
        );
        self.materialize_parity(metadata.list_id, metadata.stripe_id);
        self.reply(
            from,
            id,
            Payload::SealChunkResponse {
                metadata,
                success: true,
            },
        )
        .await;
    }

    /// Compute and cache this server's parity shards for a stripe once
    /// every data slot is sealed.
    fn materialize_parity(&self, list_id: u32, stripe_id: u32) {
        let k = self.ctx.engine.k() as u32;
        let mut data = Vec::with_capacity(k as usize);
        for slot in 0..k {
            let m = Metadata::new(list_id, stripe_id, slot);
            match self.ctx.map.find_sealed(&m) {
                Some(sealed) if sealed.seal.is_sealed() => {
                    data.push(sealed.chunk.as_bytes().to_vec())
                }
                _ => return,
            }
        }
        let parity_servers = self.ctx.stripe_map.parity_servers(list_id).unwrap_or(&[]);
        for (i, &server) in parity_servers.iter().enumerate() {
            if server != self.ctx.server_id {
                continue;
            }
            match self.ctx.engine.encode(&data, i) {
                Ok(shard) => {
                    let parity_meta = Metadata::new(list_id, stripe_id, k + i as u32);
                    debug!(%parity_meta, "parity shard materialized");
                    self.ctx.map.insert_sealed(
                        parity_meta,
                        SealedChunk {
                            seal: SealState::Sealed,
                            chunk: sk_core::Chunk::from_bytes(shard, 0, 0),
                        },
                        false,
                    );
                }
                Err(e) => error!(list_id, stripe_id, "parity encode failed: {}", e),
            }
        }
    }

    // --- shard service ---

    async fn handle_get_chunk(&self, from: PeerAddr, id: MessageId, metadata: Metadata) {
        let payload = match self.local_shard(&metadata) {
            Some(shard) => Payload::GetChunkResponse {
                metadata,
                seal: shard.seal,
                count: shard.count,
                size: shard.size,
                data: shard.data,
            },
            None => Payload::GetChunkResponse {
                metadata,
                seal: SealState::Unsealed,
                count: 0,
                size: 0,
                data: None,
            },
        };
        self.reply(from, id, payload).await;
    }

    /// This server's view of a chunk: the sealed cache, the live buffer,
    /// or (for an owned parity slot) a shard computed on demand from the
    /// mirror copies. None means the chunk is logically all zeroes.
    fn local_shard(&self, metadata: &Metadata) -> Option<ShardData> {
        if let Some(sealed) = self.ctx.map.find_sealed(metadata) {
            return Some(ShardData {
                seal: sealed.seal,
                count: sealed.chunk.count(),
                size: sealed.chunk.size(),
                data: Some(Bytes::copy_from_slice(sealed.chunk.as_bytes())),
            });
        }
        let k = self.ctx.engine.k() as u32;
        if metadata.chunk_id >= k
            && self
                .ctx
                .stripe_map
                .resolve_chunk(metadata.list_id, metadata.chunk_id)
                == Some(self.ctx.server_id)
        {
            let capacity = self.ctx.pool.chunk_capacity();
            let data: Vec<Vec<u8>> = (0..k)
                .map(|slot| {
                    let m = Metadata::new(metadata.list_id, metadata.stripe_id, slot);
                    self.ctx
                        .map
                        .find_sealed(&m)
                        .map(|s| s.chunk.as_bytes().to_vec())
                        .or_else(|| self.ctx.buffers.snapshot(&m).map(|c| c.as_bytes().to_vec()))
                        .unwrap_or_else(|| vec![0u8; capacity])
                })
                .collect();
            let index = (metadata.chunk_id - k) as usize;
            return match self.ctx.engine.encode(&data, index) {
                Ok(shard) => Some(ShardData {
                    seal: SealState::Unsealed,
                    count: 0,
                    size: 0,
                    data: Some(Bytes::from(shard)),
                }),
                Err(e) => {
                    error!(%metadata, "on-demand parity encode failed: {}", e);
                    None
                }
            };
        }
        self.ctx.buffers.snapshot(metadata).map(|chunk| ShardData {
            seal: SealState::Unsealed,
            count: chunk.count(),
            size: chunk.size(),
            data: Some(Bytes::copy_from_slice(chunk.as_bytes())),
        })
    }

    // --- degraded operations ---

    async fn handle_degraded(
        &self,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        stripe_id: u32,
        sealed: bool,
        op: DegradedOp,
    ) {
        let loc = self.ctx.stripe_map.resolve(key.as_bytes());
        let target = Metadata::new(loc.list_id, stripe_id, loc.chunk_id);
        debug!(%key, %target, sealed, "degraded operation");

        if matches!(op, DegradedOp::Get) {
            if let Some(value) = self.ctx.degraded.find_value(&key) {
                self.reply(
                    from,
                    id,
                    Payload::GetResponse {
                        key,
                        value: Some(value),
                    },
                )
                .await;
                return;
            }
        }

        let waiter = Waiter {
            from,
            id,
            key: key.clone(),
            op,
        };
        if self.ctx.degraded.find_chunk(&target).is_some() {
            self.serve_waiters(target, vec![waiter]).await;
            return;
        }
        match self.ctx.degraded.insert_degraded_key(key.clone(), waiter) {
            InsertOutcome::Trigger => {
                self.start_job(target, JobKind::DegradedKey { key }).await;
            }
            InsertOutcome::Queued => {
                debug!(%target, "queued behind in-flight reconstruction");
            }
        }
    }

    /// Fan GetChunk requests across the stripe's slots. The target slot
    /// itself is never asked (its owner is the one that failed); this
    /// server answers its own slots locally.
    async fn start_job(&self, target: Metadata, kind: JobKind) {
        let total = self.ctx.engine.k() + self.ctx.engine.m();
        let id = self.ctx.next_id();
        self.ctx.pending.jobs.insert(
            id.instance_id,
            id.request_id,
            ReconstructionJob {
                target,
                kind,
                shards: vec![None; total],
                recorded: vec![false; total],
                awaiting: total,
            },
        );
        for slot in 0..total as u32 {
            let shard_meta = Metadata::new(target.list_id, target.stripe_id, slot);
            if slot == target.chunk_id {
                self.record_shard(id, slot, None).await;
                continue;
            }
            let owner = self.ctx.stripe_map.resolve_chunk(target.list_id, slot);
            if owner == Some(self.ctx.server_id) {
                // Missing local shard means an all-zero chunk, which still
                // counts as a survivor.
                let shard = self.local_shard(&shard_meta).unwrap_or(ShardData {
                    seal: SealState::Unsealed,
                    count: 0,
                    size: 0,
                    data: None,
                });
                self.record_shard(id, slot, Some(shard)).await;
                continue;
            }
            let Some(owner) = owner else {
                self.record_shard(id, slot, None).await;
                continue;
            };
            if self.ctx.health.is_down(owner) {
                self.record_shard(id, slot, None).await;
                continue;
            }
            let msg = Message::request(
                self.ctx.addr(),
                id,
                Payload::GetChunkRequest {
                    metadata: shard_meta,
                },
            );
            if self
                .ctx
                .transport
                .send(PeerAddr::Server(owner), msg)
                .await
                .is_err()
            {
                self.record_shard(id, slot, None).await;
            }
        }
    }

    async fn handle_get_chunk_response(
        &self,
        id: MessageId,
        metadata: Metadata,
        seal: SealState,
        count: u32,
        size: u32,
        data: Option<Bytes>,
    ) {
        self.record_shard(
            id,
            metadata.chunk_id,
            Some(ShardData {
                seal,
                count,
                size,
                data,
            }),
        )
        .await;
    }

    async fn record_shard(&self, id: MessageId, slot: u32, shard: Option<ShardData>) {
        if let Some(job) = self
            .ctx
            .pending
            .jobs
            .record(id.instance_id, id.request_id, slot, shard)
        {
            self.finish_job(job).await;
        }
    }

    /// All slots reported: reconcile seal states, decode the missing
    /// chunk, and route the result by job kind.
    async fn finish_job(&self, job: ReconstructionJob) {
        let target = job.target;
        let rebuilt = self.reconstruct(&job);
        match job.kind {
            JobKind::DegradedKey { key } => {
                let waiters = self.ctx.degraded.delete_degraded_key(&key);
                match rebuilt {
                    Some((seal, chunk)) => {
                        self.ctx.degraded.insert_chunk(target, seal, chunk);
                        self.serve_waiters(target, waiters).await;
                        self.release_lock(target).await;
                    }
                    None => {
                        error!(%key, %target, "reconstruction failed, failing degraded waiters");
                        for waiter in waiters {
                            self.fail_waiter(waiter).await;
                        }
                    }
                }
            }
            JobKind::SlotRebuild { parent } => {
                let success = match rebuilt {
                    Some((_, chunk)) => {
                        self.ctx.map.insert_sealed(
                            target,
                            SealedChunk {
                                seal: SealState::Sealed,
                                chunk,
                            },
                            false,
                        );
                        true
                    }
                    None => {
                        error!(%target, "slot rebuild failed");
                        false
                    }
                };
                if let Some(batch) = self.ctx.pending.batches.complete_stripe(
                    target.list_id,
                    target.chunk_id,
                    success,
                ) {
                    self.finish_batch(parent, batch).await;
                }
            }
        }
    }

    /// Force the survivors into an agreed seal view, then decode. Fails
    /// when fewer than k shards are present; no partial decode is ever
    /// attempted.
    fn reconstruct(&self, job: &ReconstructionJob) -> Option<(SealState, sk_core::Chunk)> {
        let k = self.ctx.engine.k();
        let capacity = self.ctx.pool.chunk_capacity();
        let mut slots = Vec::new();
        let mut copies: Vec<(SealState, Vec<u8>)> = Vec::new();
        for (i, shard) in job.shards.iter().enumerate() {
            let Some(shard) = shard else { continue };
            let bytes = shard
                .data
                .as_ref()
                .map(|b| b.to_vec())
                .unwrap_or_else(|| vec![0u8; capacity]);
            slots.push(i);
            copies.push((shard.seal, bytes));
        }
        if slots.len() < k {
            error!(
                target = %job.target,
                present = slots.len(),
                required = k,
                "insufficient surviving shards"
            );
            return None;
        }
        let merged = force_seal(&mut copies);

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; job.shards.len()];
        for (slot, (_, bytes)) in slots.iter().zip(copies) {
            shards[*slot] = Some(bytes);
        }
        if let Err(e) = self.ctx.engine.decode(&mut shards) {
            error!(target = %job.target, "decode failed: {}", e);
            return None;
        }
        let bytes = shards[job.target.chunk_id as usize].take()?;
        Some((merged, rebuild_chunk(bytes)))
    }

    async fn serve_waiters(&self, target: Metadata, waiters: Vec<Waiter>) {
        for waiter in waiters {
            match waiter.op {
                DegradedOp::Get => {
                    let value = self.ctx.degraded.find_chunk(&target).and_then(|(_, chunk)| {
                        chunk
                            .records()
                            .into_iter()
                            .find(|(_, kv)| kv.key == waiter.key)
                            .map(|(_, kv)| kv.value)
                    });
                    if let Some(value) = &value {
                        self.ctx
                            .degraded
                            .insert_value(waiter.key.clone(), target, value.clone());
                    }
                    self.reply(
                        waiter.from,
                        waiter.id,
                        Payload::GetResponse {
                            key: waiter.key,
                            value,
                        },
                    )
                    .await;
                }
                DegradedOp::Update { offset, data } => {
                    self.degraded_update(target, waiter.from, waiter.id, waiter.key, offset, data)
                        .await;
                }
                DegradedOp::Delete => {
                    self.degraded_delete(target, waiter.from, waiter.id, waiter.key)
                        .await;
                }
            }
        }
    }

    /// Update against the reconstructed copy, with the same parity delta
    /// fan-out as the normal path.
    async fn degraded_update(
        &self,
        target: Metadata,
        from: PeerAddr,
        id: MessageId,
        key: Key,
        offset: u32,
        data: Bytes,
    ) {
        self.ctx.degraded.delete_value(&key);
        let update = KeyValueUpdate::new(key.clone(), offset, data);
        let record = self.ctx.degraded.find_chunk(&target).and_then(|(_, chunk)| {
            chunk
                .records()
                .into_iter()
                .find(|(_, kv)| kv.key == key)
        });
        let Some((record_offset, kv)) = record else {
            self.reply(
                from,
                id,
                Payload::UpdateResponse {
                    key,
                    offset,
                    length: update.length,
                    success: false,
                },
            )
            .await;
            return;
        };
        let end = update.offset as usize + update.length as usize;
        if end > kv.value.len() {
            self.reply(
                from,
                id,
                Payload::UpdateResponse {
                    key,
                    offset,
                    length: update.length,
                    success: false,
                },
            )
            .await;
            return;
        }
        let pos = record_offset as usize + RECORD_HEADER_SIZE + kv.key.size() + update.offset as usize;
        let delta = self.ctx.degraded.with_chunk_mut(&target, |chunk| {
            let mut delta: Vec<u8> = chunk.as_bytes()[pos..pos + update.length as usize].to_vec();
            for (d, n) in delta.iter_mut().zip(update.data.iter()) {
                *d ^= n;
            }
            chunk.update_value(record_offset, kv.key.size(), update.offset, &update.data);
            Bytes::from(delta)
        });
        let Some(delta) = delta else {
            self.reply(
                from,
                id,
                Payload::UpdateResponse {
                    key,
                    offset,
                    length: update.length,
                    success: false,
                },
            )
            .await;
            return;
        };
        self.fan_parity_update(from, id, key, target, record_offset, update, delta)
            .await;
    }

    async fn degraded_delete(&self, target: Metadata, from: PeerAddr, id: MessageId, key: Key) {
        self.ctx.degraded.delete_value(&key);
        let record = self.ctx.degraded.find_chunk(&target).and_then(|(_, chunk)| {
            chunk
                .records()
                .into_iter()
                .find(|(_, kv)| kv.key == key)
        });
        let Some((record_offset, kv)) = record else {
            self.reply(from, id, Payload::DeleteResponse { key, success: false })
                .await;
            return;
        };
        let len = kv.serialized_size();
        let record_bytes = self.ctx.degraded.with_chunk_mut(&target, |chunk| {
            let pos = record_offset as usize;
            let record = Bytes::copy_from_slice(&chunk.as_bytes()[pos..pos + len]);
            let delta = record.clone();
            xor_at(chunk.as_bytes_mut(), pos, &delta);
            record
        });
        let Some(record_bytes) = record_bytes else {
            self.reply(from, id, Payload::DeleteResponse { key, success: false })
                .await;
            return;
        };
        self.fan_parity_delete(from, id, key, target, record_offset, record_bytes)
            .await;
    }

    async fn fail_waiter(&self, waiter: Waiter) {
        let payload = match waiter.op {
            DegradedOp::Get => Payload::GetResponse {
                key: waiter.key,
                value: None,
            },
            DegradedOp::Update { offset, data } => Payload::UpdateResponse {
                key: waiter.key,
                offset,
                length: data.len() as u32,
                success: false,
            },
            DegradedOp::Delete => Payload::DeleteResponse {
                key: waiter.key,
                success: false,
            },
        };
        self.reply(waiter.from, waiter.id, payload).await;
    }

    /// Coordinator-announced peer health. A down peer drops out of the
    /// parity fan-out; a recovered peer's slots are evicted from the
    /// degraded caches so reads go back to the owner.
    fn handle_server_state(&self, server: ServerId, up: bool) {
        if !up {
            if self.ctx.health.mark_down(server) {
                warn!(server, "peer server down");
            }
            return;
        }
        if !self.ctx.health.mark_up(server) {
            return;
        }
        info!(server, "peer server recovered");
        let stale: Vec<Metadata> = self
            .ctx
            .degraded
            .cached_chunks()
            .into_iter()
            .filter(|m| self.ctx.stripe_map.resolve_chunk(m.list_id, m.chunk_id) == Some(server))
            .collect();
        let evicted = self.ctx.degraded.evict_chunks(&stale);
        if !evicted.is_empty() {
            debug!(server, count = evicted.len(), "evicted reconstructed chunks");
        }
    }

    async fn release_lock(&self, target: Metadata) {
        let id = self.ctx.next_id();
        let msg = Message::request(
            self.ctx.addr(),
            id,
            Payload::ReleaseDegradedLockRequest {
                chunks: vec![target],
            },
        );
        if let Err(e) = self.ctx.transport.send(PeerAddr::Coordinator, msg).await {
            warn!(%target, "lock release failed: {}", e);
        }
    }

    // --- coordinator-driven rebuild ---

    async fn handle_reconstruction_request(
        &self,
        id: MessageId,
        list_id: u32,
        chunk_id: u32,
        stripe_ids: Vec<u32>,
    ) {
        info!(list_id, chunk_id, stripes = stripe_ids.len(), "rebuild batch assigned");
        let total = stripe_ids.len() as u32;
        self.ctx.pending.batches.insert(BatchProgress {
            parent: id,
            list_id,
            chunk_id,
            remaining: total,
            failed: false,
            total,
        });
        for stripe_id in stripe_ids {
            let target = Metadata::new(list_id, stripe_id, chunk_id);
            if self.ctx.map.find_sealed(&target).is_some() {
                if let Some(batch) =
                    self.ctx.pending.batches.complete_stripe(list_id, chunk_id, true)
                {
                    self.finish_batch(id, batch).await;
                }
                continue;
            }
            self.start_job(target, JobKind::SlotRebuild { parent: id }).await;
        }
    }

    async fn finish_batch(&self, parent: MessageId, batch: BatchProgress) {
        let payload = Payload::ReconstructionResponse {
            list_id: batch.list_id,
            chunk_id: batch.chunk_id,
            num_stripes: batch.total,
            success: !batch.failed,
        };
        let msg = Message::request(self.ctx.addr(), parent, payload);
        if let Err(e) = self.ctx.transport.send(PeerAddr::Coordinator, msg).await {
            error!(
                list_id = batch.list_id,
                chunk_id = batch.chunk_id,
                "rebuild report failed: {}",
                e
            );
        }
    }

    // --- control plane ---

    pub async fn register(&self) {
        let id = self.ctx.next_id();
        let msg = Message::request(
            self.ctx.addr(),
            id,
            Payload::RegisterRequest {
                peer: self.ctx.addr(),
            },
        );
        if let Err(e) = self.ctx.transport.send(PeerAddr::Coordinator, msg).await {
            error!("registration failed: {}", e);
        }
    }

    pub async fn send_heartbeat(&self) {
        let (sealed, keys) = self.ctx.map.drain_journal();
        let id = self.ctx.next_id();
        let msg = Message::request(
            self.ctx.addr(),
            id,
            Payload::Heartbeat {
                sealed,
                keys,
                is_last: true,
            },
        );
        if let Err(e) = self.ctx.transport.send(PeerAddr::Coordinator, msg).await {
            warn!("heartbeat failed: {}", e);
        }
    }

    // --- helpers ---

    fn healthy_parity_servers(&self, list_id: u32) -> Vec<ServerId> {
        self.ctx
            .stripe_map
            .parity_servers(list_id)
            .unwrap_or(&[])
            .iter()
            .copied()
            .filter(|&s| s != self.ctx.server_id && !self.ctx.health.is_down(s))
            .collect()
    }

    async fn reply(&self, to: PeerAddr, id: MessageId, payload: Payload) {
        let msg = Message::request(self.ctx.addr(), id, payload);
        if let Err(e) = self.ctx.transport.send(to, msg).await {
            warn!(%to, "reply failed: {}", e);
        }
    }

    /// Reply for a deferred entry: the parent ids name the gateway request
    /// the answer belongs to.
    async fn reply_deferred(&self, pid: &Pid, payload: Payload) {
        let to = PeerAddr::Gateway(pid.parent_instance_id);
        let id = MessageId::new(pid.parent_instance_id, pid.parent_request_id);
        self.reply(to, id, payload).await;
    }
}

/// Rebuild chunk accounting from decoded bytes by walking the records.
fn rebuild_chunk(bytes: Vec<u8>) -> sk_core::Chunk {
    let mut count = 0u32;
    let mut size = 0usize;
    while let Some((_, len)) = sk_core::KeyValue::parse_at(&bytes, size) {
        count += 1;
        size += len;
    }
    sk_core::Chunk::from_bytes(bytes, count, size as u32)
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
