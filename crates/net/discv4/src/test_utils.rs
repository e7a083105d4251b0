//! Mock discovery support

use crate::{
    node::is_lan,
    proto::{Endpoint, Message, Packet},
    Discv4, Discv4Config, Discv4Service, IngressEvent, NodeRecord, PeerId,
};
use alloy_primitives::B256;
use bytes::Bytes;
use rand::{thread_rng, Rng, RngCore};
use secp256k1::SecretKey;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{sync::mpsc, task::JoinSet};
use tracing_subscriber::EnvFilter;

/// Installs a `RUST_LOG` driven subscriber, can be called multiple times.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Generates a random node id, which is not necessarily a valid public key.
pub fn rng_id(rng: &mut impl RngCore) -> PeerId {
    let mut id = [0u8; 64];
    rng.fill_bytes(&mut id);
    PeerId::from(id)
}

/// Generates a random v4 or v6 endpoint.
pub fn rng_endpoint(rng: &mut impl Rng) -> Endpoint {
    let address = if rng.gen() {
        let mut ip = [0u8; 4];
        rng.fill_bytes(&mut ip);
        IpAddr::V4(ip.into())
    } else {
        let mut ip = [0u8; 16];
        rng.fill_bytes(&mut ip);
        IpAddr::V6(ip.into())
    };
    Endpoint { address, tcp_port: rng.gen(), udp_port: rng.gen() }
}

/// Generates a record with a valid id, a public IPv4 address and an unprivileged port.
pub fn rng_record(rng: &mut impl Rng) -> NodeRecord {
    rng_node(rng).1
}

/// Generates a record together with its secret key.
pub fn rng_node(rng: &mut impl Rng) -> (SecretKey, NodeRecord) {
    let secret_key = SecretKey::new(rng);
    let address = loop {
        let ip = Ipv4Addr::new(rng.gen_range(1..=223), rng.gen(), rng.gen(), rng.gen());
        if !is_lan(ip.into()) {
            break ip
        }
    };
    let port = rng.gen_range(1025..=u16::MAX);
    (secret_key, NodeRecord::from_secret_key((address, port).into(), &secret_key))
}

/// An expiration timestamp in the future.
pub fn future_expiration() -> u64 {
    (SystemTime::now() + Duration::from_secs(20))
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// The configuration used by the in-memory services: short timeouts and no lookups.
pub fn test_config() -> Discv4Config {
    Discv4Config::builder()
        .request_timeout(Duration::from_millis(200))
        .ping_back_delay(Duration::from_millis(10))
        .enable_lookup(false)
        .build()
}

/// Creates a new service bound to a random local UDP port.
pub async fn create_discv4() -> (Discv4, Discv4Service) {
    create_discv4_with_config(test_config()).await
}

/// Creates a new service with the given config, bound to a random local UDP port.
pub async fn create_discv4_with_config(config: Discv4Config) -> (Discv4, Discv4Service) {
    let secret_key = SecretKey::new(&mut thread_rng());
    let socket: SocketAddr = (Ipv4Addr::LOCALHOST, 0).into();
    let local_record = NodeRecord::from_secret_key(socket, &secret_key);
    Discv4::bind(socket, local_record, secret_key, config).await.unwrap()
}

/// Creates a new service that reads from and writes to a [`TestPipe`] instead of a socket.
pub fn create_discv4_with_pipe() -> (Discv4, Discv4Service, TestPipe) {
    create_discv4_with_config_and_pipe(test_config())
}

/// Same as [`create_discv4_with_pipe`] with a custom config.
pub fn create_discv4_with_config_and_pipe(config: Discv4Config) -> (Discv4, Discv4Service, TestPipe) {
    let secret_key = SecretKey::new(&mut thread_rng());
    let local_address: SocketAddr = (Ipv4Addr::LOCALHOST, 30303).into();
    let local_node = NodeRecord::from_secret_key(local_address, &secret_key);

    let (ingress_tx, ingress_rx) = mpsc::channel(config.udp_ingress_message_buffer);
    let (egress_tx, egress_rx) = mpsc::channel(config.udp_egress_message_buffer);
    let service = Discv4Service::with_channels(
        local_address,
        local_node,
        secret_key,
        config,
        ingress_rx,
        egress_tx,
        JoinSet::new(),
    )
    .unwrap();
    let discv4 = service.handle();

    (discv4, service, TestPipe { local_node, ingress: ingress_tx, egress: egress_rx })
}

/// The network side of a service created with [`create_discv4_with_pipe`].
#[derive(Debug)]
pub struct TestPipe {
    local_node: NodeRecord,
    ingress: mpsc::Sender<IngressEvent>,
    egress: mpsc::Receiver<(Bytes, SocketAddr)>,
}

impl TestPipe {
    /// The record of the service under test.
    pub fn local_node(&self) -> NodeRecord {
        self.local_node
    }

    /// The endpoint of the service under test.
    pub fn local_endpoint(&self) -> Endpoint {
        Endpoint::from_record(&self.local_node)
    }

    /// Delivers the signed message to the service as if it was received from `from`.
    ///
    /// Returns the packet hash.
    pub async fn send(&self, from: SocketAddr, secret_key: &SecretKey, msg: Message) -> B256 {
        let (datagram, hash) = msg.encode(secret_key);
        self.send_raw(from, datagram).await;
        hash
    }

    /// Delivers raw bytes to the service.
    pub async fn send_raw(&self, from: SocketAddr, datagram: Bytes) {
        let _ = self.ingress.send(IngressEvent::Datagram(from, datagram)).await;
    }

    /// Waits for the next packet the service sends.
    pub async fn recv(&mut self) -> Option<(Packet, SocketAddr)> {
        let (datagram, to) = self.egress.recv().await?;
        Message::decode(&datagram).ok().map(|packet| (packet, to))
    }

    /// Returns the next packet the service sent, if any.
    pub fn try_recv(&mut self) -> Option<(Packet, SocketAddr)> {
        let (datagram, to) = self.egress.try_recv().ok()?;
        Message::decode(&datagram).ok().map(|packet| (packet, to))
    }
}
