//! End-to-end cluster tests over the in-memory hub: one coordinator,
//! four storage servers and a gateway worker wired the way the binaries
//! wire them, with a channel standing in for the application socket.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::timeout;

use coding::Scheme;
use coordinator::{CoordinatorConfig, CoordinatorContext, CoordinatorWorker};
use gateway::{GatewayConfig, GatewayEvent, GatewayWorker, ServiceContext};
use proto::config::{ClusterConfig, ServerPeer, StripeConfig};
use proto::{InMemoryHub, Message, MessageId, Payload, PeerAddr, Transport};
use sk_core::{ConnHandle, Key, ServerId, StripeLocation};
use storenode::worker::{StoreNodeContext, StoreNodeWorker};
use storenode::StoreNodeConfig;

const SERVER_COUNT: u16 = 4;
const GATEWAY_INSTANCE: u16 = 1;
const APP_INSTANCE: u16 = 100;

fn cluster_section() -> ClusterConfig {
    ClusterConfig {
        coordinator_addr: String::new(),
        gateways: Vec::new(),
        servers: (0..SERVER_COUNT)
            .map(|id| ServerPeer {
                id,
                addr: String::new(),
            })
            .collect(),
    }
}

fn apply_stripe(stripe: &mut StripeConfig) {
    stripe.list_count = 4;
    stripe.data_chunks = 3;
    stripe.parity_chunks = 1;
    stripe.scheme = Scheme::Raid5;
    stripe.chunk_size = 256;
}

struct Cluster {
    hub: InMemoryHub,
    coord: Arc<CoordinatorContext>,
    gw: Arc<ServiceContext>,
    gw_tx: mpsc::Sender<GatewayEvent>,
    nodes: Vec<Arc<StoreNodeContext>>,
    app_conn: ConnHandle,
    app_rx: mpsc::Receiver<Message>,
    next_request: u32,
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

impl Cluster {
    async fn start() -> Self {
        let hub = InMemoryHub::new();

        let coord_rx = hub.register(PeerAddr::Coordinator);
        let mut coord_config = CoordinatorConfig::default();
        coord_config.cluster = cluster_section();
        apply_stripe(&mut coord_config.stripe);
        let coord = Arc::new(CoordinatorContext::new(
            coord_config,
            Arc::new(hub.clone()),
        ));
        tokio::spawn(CoordinatorWorker::new(coord.clone()).run(coord_rx));

        let mut nodes = Vec::new();
        for id in 0..SERVER_COUNT {
            let rx = hub.register(PeerAddr::Server(id));
            let mut config = StoreNodeConfig::default();
            config.server.server_id = id;
            config.server.heartbeat_interval_ms = 50;
            config.cluster = cluster_section();
            apply_stripe(&mut config.stripe);
            let ctx =
                Arc::new(StoreNodeContext::new(config, Arc::new(hub.clone())).unwrap());
            let worker = StoreNodeWorker::new(ctx.clone());
            worker.register().await;
            tokio::spawn(worker.run(rx));
            nodes.push(ctx);
        }

        let mut gw_config = GatewayConfig::default();
        gw_config.gateway.instance_id = GATEWAY_INSTANCE;
        gw_config.gateway.workers = 1;
        gw_config.cluster = cluster_section();
        apply_stripe(&mut gw_config.stripe);
        let gw = Arc::new(ServiceContext::new(gw_config, Arc::new(hub.clone())));
        let (gw_tx, gw_events) = mpsc::channel(256);
        tokio::spawn(GatewayWorker::new(gw.clone(), 0).run(gw_events));

        // Peer pump, as the gateway front end runs it.
        let mut gw_peer_rx = hub.register(PeerAddr::Gateway(GATEWAY_INSTANCE));
        let pump_tx = gw_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = gw_peer_rx.recv().await {
                if pump_tx.send(GatewayEvent::Peer(msg)).await.is_err() {
                    return;
                }
            }
        });
        hub.send(
            PeerAddr::Coordinator,
            Message::request(
                PeerAddr::Gateway(GATEWAY_INSTANCE),
                MessageId::new(GATEWAY_INSTANCE, 0),
                Payload::RegisterRequest {
                    peer: PeerAddr::Gateway(GATEWAY_INSTANCE),
                },
            ),
        )
        .await
        .unwrap();

        let (app_tx, app_rx) = mpsc::channel(64);
        let app_conn = gw.conns.register(app_tx);

        let cluster = Self {
            hub,
            coord,
            gw,
            gw_tx,
            nodes,
            app_conn,
            app_rx,
            next_request: 1,
        };
        // Failure notifications need the registered gateway on record.
        let coord = cluster.coord.clone();
        wait_for("gateway registration", move || {
            !coord.registry.gateways().is_empty()
        })
        .await;
        cluster
    }

    async fn app_call(&mut self, payload: Payload) -> Payload {
        let request_id = self.next_request;
        self.next_request += 1;
        let msg = Message::request(
            PeerAddr::App(ConnHandle::new(0, 0)),
            MessageId::new(APP_INSTANCE, request_id),
            payload,
        );
        self.gw_tx
            .send(GatewayEvent::App {
                conn: self.app_conn,
                msg,
            })
            .await
            .unwrap();
        let reply = timeout(Duration::from_secs(5), self.app_rx.recv())
            .await
            .expect("gateway reply timed out")
            .expect("application channel closed");
        assert_eq!(reply.id, MessageId::new(APP_INSTANCE, request_id));
        reply.payload
    }

    async fn set(&mut self, key: &Key, value: &[u8]) -> bool {
        let payload = self
            .app_call(Payload::SetRequest {
                key: key.clone(),
                value: Bytes::copy_from_slice(value),
                loc: StripeLocation {
                    list_id: 0,
                    chunk_id: 0,
                },
            })
            .await;
        match payload {
            Payload::SetResponse { success, .. } => success,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn get(&mut self, key: &Key) -> Option<Bytes> {
        let payload = self.app_call(Payload::GetRequest { key: key.clone() }).await;
        match payload {
            Payload::GetResponse { value, .. } => value,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn update(&mut self, key: &Key, offset: u32, data: &[u8]) -> bool {
        let payload = self
            .app_call(Payload::UpdateRequest {
                key: key.clone(),
                offset,
                data: Bytes::copy_from_slice(data),
                loc: StripeLocation {
                    list_id: 0,
                    chunk_id: 0,
                },
            })
            .await;
        match payload {
            Payload::UpdateResponse { success, .. } => success,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn delete(&mut self, key: &Key) -> bool {
        let payload = self
            .app_call(Payload::DeleteRequest {
                key: key.clone(),
                loc: StripeLocation {
                    list_id: 0,
                    chunk_id: 0,
                },
            })
            .await;
        match payload {
            Payload::DeleteResponse { success, .. } => success,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    fn locate(&self, key: &Key) -> (StripeLocation, ServerId) {
        let loc = self.gw.stripe_map.resolve(key.as_bytes());
        let owner = self
            .gw
            .stripe_map
            .resolve_chunk(loc.list_id, loc.chunk_id)
            .unwrap();
        (loc, owner)
    }

    /// Take a server away: its hub route disappears and the coordinator
    /// declares it failed, which notifies the gateway.
    async fn fail_server(&self, server: ServerId) {
        self.hub.disconnect(PeerAddr::Server(server));
        CoordinatorWorker::new(self.coord.clone())
            .declare_server_down(server)
            .await;
        let gw = self.gw.clone();
        wait_for("gateway to mark the server down", move || {
            gw.health.is_down(server)
        })
        .await;
    }

    /// Heartbeats carry the key journal; the degraded-lock service can
    /// only answer for keys the coordinator has heard about.
    async fn wait_for_directory(&self, key: &Key) {
        let coord = self.coord.clone();
        let key = key.clone();
        wait_for("key to reach the coordinator directory", move || {
            coord.directory.lookup(&key).is_some()
        })
        .await;
    }
}

#[tokio::test]
async fn test_set_get_update_delete_round_trip() {
    let mut cluster = Cluster::start().await;
    let key = Key::from("alpha");

    assert!(cluster.set(&key, b"bar").await);
    assert_eq!(cluster.get(&key).await, Some(Bytes::from_static(b"bar")));

    assert!(cluster.update(&key, 1, b"oo").await);
    assert_eq!(cluster.get(&key).await, Some(Bytes::from_static(b"boo")));

    assert!(cluster.delete(&key).await);
    assert_eq!(cluster.get(&key).await, None);
    assert_eq!(cluster.gw.pending.in_flight(), 0);
}

#[tokio::test]
async fn test_many_keys_round_trip() {
    let mut cluster = Cluster::start().await;
    let mut rng = StdRng::seed_from_u64(7);
    let mut pairs = Vec::new();
    for _ in 0..32 {
        let key: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let value: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        pairs.push((Key::from(key.as_str()), Bytes::from(value)));
    }

    for (key, value) in &pairs {
        assert!(cluster.set(key, value).await, "set failed for {}", key);
    }
    for (key, value) in &pairs {
        assert_eq!(cluster.get(key).await.as_ref(), Some(value), "mismatch for {}", key);
    }
}

#[tokio::test]
async fn test_degraded_get_survives_data_slot_failure() {
    let mut cluster = Cluster::start().await;
    let key = Key::from("resilient");
    let (_, owner) = cluster.locate(&key);

    assert!(cluster.set(&key, b"still-here").await);
    cluster.wait_for_directory(&key).await;
    cluster.fail_server(owner).await;

    // The survivors hold two zero data shards and the parity mirror;
    // decoding them yields the record back.
    assert_eq!(
        cluster.get(&key).await,
        Some(Bytes::from_static(b"still-here"))
    );

    // The redirect server hands the lock back once the waiters are served.
    let coord = cluster.coord.clone();
    wait_for("degraded lock release", move || coord.locks.lock_count() == 0).await;
    assert_eq!(cluster.gw.pending.in_flight(), 0);
}

#[tokio::test]
async fn test_set_during_outage_remaps_and_reads_back() {
    let mut cluster = Cluster::start().await;
    let key = Key::from("mobile");
    let (loc, owner) = cluster.locate(&key);

    assert!(cluster.set(&key, b"v1").await);
    cluster.wait_for_directory(&key).await;
    cluster.fail_server(owner).await;

    // The SET relocates through the coordinator's remap lock.
    assert!(cluster.set(&key, b"v2").await);
    let remapped = cluster.coord.locks.remapped_slot(&key).unwrap();
    assert_eq!(remapped.0, loc.list_id);
    assert_ne!(remapped.1, loc.chunk_id);

    // A GET during the same outage follows the relocation instead of
    // reconstructing.
    assert_eq!(cluster.get(&key).await, Some(Bytes::from_static(b"v2")));
    assert_eq!(cluster.gw.pending.in_flight(), 0);
}

#[tokio::test]
async fn test_get_fails_below_k_survivors() {
    let mut cluster = Cluster::start().await;
    let key = Key::from("doomed");
    let (loc, owner) = cluster.locate(&key);

    assert!(cluster.set(&key, b"gone").await);
    cluster.wait_for_directory(&key).await;
    cluster.fail_server(owner).await;

    // Fail a second data slot of the same list; k-1 survivors cannot
    // decode.
    let servers = cluster.gw.stripe_map.servers_of(loc.list_id).unwrap().to_vec();
    let k = cluster.gw.stripe_map.k();
    let second = (0..k as u32)
        .filter(|&slot| slot != loc.chunk_id)
        .map(|slot| servers[slot as usize])
        .next()
        .unwrap();
    cluster.fail_server(second).await;

    assert_eq!(cluster.get(&key).await, None);

    // Nothing was reconstructed at the redirect server.
    let parity = cluster.gw.stripe_map.parity_servers(loc.list_id).unwrap()[0];
    assert_eq!(cluster.nodes[parity as usize].degraded.cached_chunk_count(), 0);
}
