#![warn(missing_docs)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! discv4 implementation: <https://github.com/ethereum/devp2p/blob/master/discv4.md>
//!
//! The [`Discv4Service`] owns the UDP transport, the routing table and every pending request. It
//! is driven as a single task, all other tasks talk to it through the cloneable [`Discv4`] handle.
//!
//! ## Feature Flags
//!
//! - `serde` (default): Enable serde support
//! - `test-utils`: Export utilities for testing

use crate::{
    node::kad_key,
    registry::{ReplyOutcome, ReplyRegistry},
    table::Table,
};
use alloy_primitives::B256;
use alloy_rlp::Encodable;
use bytes::{Bytes, BytesMut};
use enr::Enr;
use futures::{future::BoxFuture, ready, stream::FuturesUnordered, FutureExt, Stream, StreamExt};
use secp256k1::SecretKey;
use std::{
    collections::{HashSet, VecDeque},
    fmt, io,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
    time::{Instant, Interval, MissedTickBehavior, Sleep},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace, warn};

mod config;
mod error;
mod node;
mod proto;
mod registry;
mod table;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{Discv4Config, Discv4ConfigBuilder};
pub use discv5::kbucket::MAX_NODES_PER_BUCKET;
pub use error::{DecodePacketError, Discv4Error};
pub use node::{id2pk, pk2id, NodeRecord, NodeRecordParseError, PeerId};
pub use proto::{
    EnrRequest, EnrResponse, Endpoint, FindNode, Message, MessageId, Neighbours, Packet, Ping,
    Pong, MAX_NEIGHBOURS_PER_PACKET, MAX_PACKET_SIZE, MIN_PACKET_SIZE,
};
pub use registry::{
    EnrResponseSender, NodeResponseSender, PendingRequest, PingReason, PingResponseSender,
    ReplyMatch, ReplyMatcher,
};

/// The default port for discv4 via UDP
pub const DEFAULT_DISCOVERY_PORT: u16 = 30303;

/// The maximum number of concurrent `FindNode` requests of a lookup.
pub const ALPHA: usize = 3;

type EgressSender = mpsc::Sender<(Bytes, SocketAddr)>;
type EgressReceiver = mpsc::Receiver<(Bytes, SocketAddr)>;

pub(crate) type IngressSender = mpsc::Sender<IngressEvent>;
pub(crate) type IngressReceiver = mpsc::Receiver<IngressEvent>;

/// The handle that can be used to interact with the [`Discv4Service`].
#[derive(Debug, Clone)]
pub struct Discv4 {
    /// The address of the udp socket
    local_addr: SocketAddr,
    /// The local node
    local_node: NodeRecord,
    /// channel to send commands over to the service
    to_service: mpsc::UnboundedSender<Discv4Command>,
    /// Flips to `true` once the initial table refresh is done.
    initial_refresh: watch::Receiver<bool>,
}

// === impl Discv4 ===

impl Discv4 {
    /// Binds a new UdpSocket and creates the service
    ///
    /// ```
    /// # use std::io;
    /// use rand::thread_rng;
    /// use reth_discv4::{Discv4, Discv4Config, NodeRecord};
    /// use secp256k1::SECP256K1;
    /// use std::{net::SocketAddr, str::FromStr};
    /// # async fn t() -> io::Result<()> {
    /// // generate a (random) keypair
    /// let mut rng = thread_rng();
    /// let (secret_key, _) = SECP256K1.generate_keypair(&mut rng);
    ///
    /// let socket = SocketAddr::from_str("0.0.0.0:0").unwrap();
    /// let local_enr = NodeRecord::from_secret_key(socket, &secret_key);
    /// let config = Discv4Config::default();
    ///
    /// let (discv4, mut service) = Discv4::bind(socket, local_enr, secret_key, config).await?;
    ///
    /// // get an update stream
    /// let updates = service.update_stream();
    ///
    /// let _handle = service.spawn();
    ///
    /// // lookup the local node in the DHT
    /// let _discovered = discv4.lookup_self().await.unwrap();
    ///
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bind(
        local_address: SocketAddr,
        mut local_node_record: NodeRecord,
        secret_key: SecretKey,
        config: Discv4Config,
    ) -> io::Result<(Self, Discv4Service)> {
        let socket = UdpSocket::bind(local_address).await?;
        let local_addr = socket.local_addr()?;
        local_node_record.udp_port = local_addr.port();
        trace!(target: "discv4", ?local_addr, "opened UDP socket");

        let service = Discv4Service::new(socket, local_addr, local_node_record, secret_key, config)?;
        let discv4 = service.handle();
        Ok((discv4, service))
    }

    /// Returns the address of the UDP socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the [`NodeRecord`] of the local node.
    pub fn node_record(&self) -> NodeRecord {
        self.local_node
    }

    /// Sends a `Ping` to the node and waits for the matching `Pong`.
    pub async fn ping(&self, node: NodeRecord) -> Result<Pong, Discv4Error> {
        let (tx, rx) = oneshot::channel();
        self.send_to_service(Discv4Command::Ping { node, tx });
        rx.await?
    }

    /// Asks the node at `addr` for the nodes closest to `target` it knows.
    ///
    /// Resolves with all nodes received before the request timed out. Fails with
    /// [`Discv4Error::Timeout`] only if not a single node was received.
    pub async fn find_node(
        &self,
        id: PeerId,
        addr: SocketAddr,
        target: PeerId,
    ) -> Result<Vec<NodeRecord>, Discv4Error> {
        self.send_find_node(NodeRecord::new(addr, id), target, false).await
    }

    /// Like [`Self::find_node`], but makes sure the remote knows our endpoint first.
    async fn send_find_node(
        &self,
        node: NodeRecord,
        target: PeerId,
        ensure_bond: bool,
    ) -> Result<Vec<NodeRecord>, Discv4Error> {
        let (tx, rx) = oneshot::channel();
        self.send_to_service(Discv4Command::FindNode { node, target, ensure_bond, tx });
        rx.await?
    }

    /// Requests the ENR of the node, see <https://eips.ethereum.org/EIPS/eip-868>
    pub async fn request_enr(&self, node: NodeRecord) -> Result<Enr<SecretKey>, Discv4Error> {
        let (tx, rx) = oneshot::channel();
        self.send_to_service(Discv4Command::EnrRequest { node, tx });
        rx.await?
    }

    /// Starts a `FindNode` recursive lookup that locates the closest nodes to the local node.
    pub async fn lookup_self(&self) -> Result<Vec<NodeRecord>, Discv4Error> {
        self.lookup(self.local_node.id).await
    }

    /// Performs a kademlia lookup for the closest nodes to the given target.
    ///
    /// Starts with the closest nodes of the local table and queries up to [`ALPHA`] nodes at a
    /// time, until every node among the [`MAX_NODES_PER_BUCKET`] closest nodes seen so far was
    /// asked.
    pub async fn lookup(&self, target: PeerId) -> Result<Vec<NodeRecord>, Discv4Error> {
        let target_key = kad_key(target);
        let mut closest = self.closest(target).await?;

        let mut asked = HashSet::from([self.local_node.id]);
        let mut seen = closest.iter().map(|node| node.id).collect::<HashSet<_>>();
        seen.insert(self.local_node.id);

        let mut queries = FuturesUnordered::new();
        loop {
            while queries.len() < ALPHA {
                let Some(node) = closest.iter().find(|node| !asked.contains(&node.id)).copied()
                else {
                    break
                };
                asked.insert(node.id);
                let this = self.clone();
                queries.push(async move { (node, this.send_find_node(node, target, true).await) });
            }

            let Some((node, res)) = queries.next().await else { break };
            match res {
                Ok(nodes) => {
                    closest.extend(nodes.into_iter().filter(|node| seen.insert(node.id)));
                    closest.sort_by_cached_key(|node| target_key.distance(&kad_key(node.id)));
                    closest.truncate(MAX_NODES_PER_BUCKET);
                }
                Err(Discv4Error::Closed) => return Err(Discv4Error::Closed),
                Err(err) => {
                    trace!(target: "discv4", ?node, %err, "lookup query failed");
                }
            }
        }

        trace!(target: "discv4", ?target, num = closest.len(), "lookup finished");
        Ok(closest)
    }

    /// Returns the closest nodes to the target from the local table.
    async fn closest(&self, target: PeerId) -> Result<Vec<NodeRecord>, Discv4Error> {
        let (tx, rx) = oneshot::channel();
        self.send_to_service(Discv4Command::Closest { target, tx });
        Ok(rx.await?)
    }

    /// Adds the node to the table and pings it.
    pub fn add_node(&self, node: NodeRecord) {
        self.send_to_service(Discv4Command::AddNode(node));
    }

    /// Sets the pair in the EIP-868 [`Enr`] of the node.
    ///
    /// If the key already exists, this will update it.
    ///
    /// CAUTION: The value **must** be rlp encoded
    pub fn set_eip868_rlp_pair(&self, key: Vec<u8>, rlp: Bytes) {
        self.send_to_service(Discv4Command::SetEip868RlpPair { key, rlp });
    }

    /// Sets the pair in the EIP-868 [`Enr`] of the node.
    ///
    /// If the key already exists, this will update it.
    pub fn set_eip868_rlp(&self, key: Vec<u8>, value: impl Encodable) {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        self.set_eip868_rlp_pair(key, buf.freeze())
    }

    /// Resolves once the initial table refresh completed.
    pub async fn initial_refresh_done(&self) -> Result<(), Discv4Error> {
        let mut rx = self.initial_refresh.clone();
        if rx.wait_for(|done| *done).await.is_err() {
            return Err(Discv4Error::Closed)
        }
        Ok(())
    }

    /// Terminates the spawned [`Discv4Service`].
    ///
    /// All pending requests resolve with [`Discv4Error::Closed`].
    pub fn terminate(&self) {
        self.send_to_service(Discv4Command::Terminate);
    }

    fn send_to_service(&self, cmd: Discv4Command) {
        let _ = self.to_service.send(cmd).map_err(|err| {
            debug!(target: "discv4", %err, "service is gone, dropping command")
        });
    }
}

/// Manages discv4 peer discovery over UDP.
#[must_use = "Stream does nothing unless polled"]
pub struct Discv4Service {
    /// Local address of the UDP socket.
    local_address: SocketAddr,
    /// The local ENR for EIP-868 <https://eips.ethereum.org/EIPS/eip-868>
    local_eip_868_enr: Enr<SecretKey>,
    /// Local ENR of the server.
    local_node_record: NodeRecord,
    /// The secret key used to sign payloads
    secret_key: SecretKey,
    /// The routing table.
    table: Table,
    /// Requests waiting for a reply.
    registry: ReplyRegistry,
    /// The spawned UDP tasks.
    ///
    /// Note: If dropped, the spawned tasks are aborted.
    _tasks: JoinSet<()>,
    /// Receiver for incoming messages
    ingress: IngressReceiver,
    /// Sender for sending outgoing messages
    egress: EgressSender,
    /// Sender for commands, handed out to [`Discv4`] handles.
    commands_tx: mpsc::UnboundedSender<Discv4Command>,
    /// Receiver for commands from [`Discv4`] handles.
    commands_rx: mpsc::UnboundedReceiver<Discv4Command>,
    /// Nodes that pinged us first and are pinged back once the delay elapsed.
    ping_backs: VecDeque<(Instant, NodeRecord)>,
    /// `FindNode` requests that wait until the remote had time to ping us back.
    delayed_find_nodes: VecDeque<DelayedFindNode>,
    /// Fires at the earliest request deadline or scheduled send.
    timer: Pin<Box<Sleep>>,
    /// Triggers the revalidation of the least recently validated table entry.
    revalidate_interval: Interval,
    /// Triggers a self lookup.
    lookup_interval: Interval,
    /// The running self lookup.
    lookup: Option<BoxFuture<'static, ()>>,
    /// Flipped once the first self lookup finished.
    initial_refresh: watch::Sender<bool>,
    /// Listeners for table updates.
    update_listeners: Vec<mpsc::Sender<TableUpdate>>,
    /// Buffered events produced ready to return
    queued_events: VecDeque<Discv4Event>,
    /// The configuration
    config: Discv4Config,
    /// Whether the service was terminated.
    terminated: bool,
}

impl Discv4Service {
    /// Create a new instance for a bound [`UdpSocket`].
    pub(crate) fn new(
        socket: UdpSocket,
        local_address: SocketAddr,
        local_node_record: NodeRecord,
        secret_key: SecretKey,
        config: Discv4Config,
    ) -> io::Result<Self> {
        let socket = Arc::new(socket);
        let (ingress_tx, ingress_rx) = mpsc::channel(config.udp_ingress_message_buffer);
        let (egress_tx, egress_rx) = mpsc::channel(config.udp_egress_message_buffer);
        let mut tasks = JoinSet::<()>::new();

        let udp = Arc::clone(&socket);
        tasks.spawn(async move { receive_loop(udp, ingress_tx).await });

        let udp = Arc::clone(&socket);
        tasks.spawn(async move { send_loop(udp, egress_rx).await });

        Self::with_channels(
            local_address,
            local_node_record,
            secret_key,
            config,
            ingress_rx,
            egress_tx,
            tasks,
        )
    }

    /// Create a new instance that receives datagrams from `ingress` and writes datagrams to
    /// `egress`.
    pub(crate) fn with_channels(
        local_address: SocketAddr,
        local_node_record: NodeRecord,
        secret_key: SecretKey,
        config: Discv4Config,
        ingress: IngressReceiver,
        egress: EgressSender,
        tasks: JoinSet<()>,
    ) -> io::Result<Self> {
        let local_eip_868_enr = {
            let mut builder = Enr::<SecretKey>::builder();
            builder.ip(local_node_record.address);
            if local_node_record.address.is_ipv4() {
                builder.udp4(local_node_record.udp_port);
                builder.tcp4(local_node_record.tcp_port);
            } else {
                builder.udp6(local_node_record.udp_port);
                builder.tcp6(local_node_record.tcp_port);
            }

            for (key, val) in &config.additional_eip868_rlp_pairs {
                builder.add_value_rlp(key, val.clone());
            }

            builder.build(&secret_key).map_err(|err| io::Error::other(err.to_string()))?
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (initial_refresh, _) = watch::channel(false);

        let mut revalidate_interval = tokio::time::interval_at(
            Instant::now() + config.table_revalidate_interval,
            config.table_revalidate_interval,
        );
        revalidate_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        let mut lookup_interval = tokio::time::interval(config.lookup_interval);
        lookup_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Ok(Self {
            local_address,
            local_eip_868_enr,
            table: Table::new(local_node_record.id, config.bond_expiration),
            local_node_record,
            secret_key,
            registry: Default::default(),
            _tasks: tasks,
            ingress,
            egress,
            commands_tx,
            commands_rx,
            ping_backs: Default::default(),
            delayed_find_nodes: Default::default(),
            timer: Box::pin(tokio::time::sleep_until(Instant::now())),
            revalidate_interval,
            lookup_interval,
            lookup: None,
            initial_refresh,
            update_listeners: Vec::new(),
            queued_events: Default::default(),
            config,
            terminated: false,
        })
    }

    /// Returns a new handle to this service.
    pub fn handle(&self) -> Discv4 {
        Discv4 {
            local_addr: self.local_address,
            local_node: self.local_node_record,
            to_service: self.commands_tx.clone(),
            initial_refresh: self.initial_refresh.subscribe(),
        }
    }

    /// Returns the address of the UDP socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_address
    }

    /// Returns the [`NodeRecord`] of the local node.
    pub fn local_node_record(&self) -> NodeRecord {
        self.local_node_record
    }

    /// Returns the local EIP-868 [`Enr`].
    pub fn local_enr(&self) -> &Enr<SecretKey> {
        &self.local_eip_868_enr
    }

    /// Number of nodes in the routing table.
    pub fn num_nodes(&self) -> usize {
        self.table.len()
    }

    /// Number of requests waiting for a reply.
    pub fn num_pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Returns a stream of updates of the routing table.
    pub fn update_stream(&mut self) -> ReceiverStream<TableUpdate> {
        let (tx, rx) = mpsc::channel(512);
        self.update_listeners.push(tx);
        ReceiverStream::new(rx)
    }

    /// Spawns this service onto a new task
    ///
    /// Note: requires a running runtime
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::task::spawn(async move {
            self.bootstrap();

            while let Some(event) = self.next().await {
                trace!(target: "discv4", ?event, "processed");
            }
            trace!(target: "discv4", "service terminated");
        })
    }

    /// Inserts the configured boot nodes into the table and pings them.
    ///
    /// Without boot nodes, or with lookups disabled, there is nothing to refresh and the initial
    /// refresh completes right away.
    pub fn bootstrap(&mut self) {
        if self.config.bootstrap_nodes.is_empty() || !self.config.enable_lookup {
            self.initial_refresh.send_replace(true);
        }

        let boot_nodes = self.config.bootstrap_nodes.clone();
        for node in boot_nodes {
            debug!(target: "discv4", ?node, "adding boot node");
            self.add_node(node);
        }
    }

    /// Adds the node to the table without an endpoint proof and pings it.
    fn add_node(&mut self, node: NodeRecord) {
        if node.id == self.local_node_record.id {
            return
        }
        if self.table.add_seen_node(node) {
            self.notify(TableUpdate::Added(node));
        }
        if !self.registry.is_pending(MessageId::Pong, node.id) {
            self.send_ping(node, PingReason::InitialInsert);
        }
    }

    /// Updates the local ENR, this bumps its sequence number.
    pub fn set_eip868_rlp_pair(&mut self, key: Vec<u8>, rlp: Bytes) {
        if let Err(err) = self.local_eip_868_enr.insert_raw_rlp(key, rlp, &self.secret_key) {
            warn!(target: "discv4", %err, "failed to update local enr");
        }
    }

    /// The sequence number to advertise in `Ping` and `Pong`, if EIP-868 is enabled.
    fn enr_seq(&self) -> Option<u64> {
        self.config.enable_eip868.then(|| self.local_eip_868_enr.seq())
    }

    /// The expiration timestamp for outgoing packets.
    fn send_expiration(&self) -> u64 {
        unix_timestamp() + self.config.packet_expiration.as_secs()
    }

    /// The deadline for a request sent now.
    fn reply_deadline(&self) -> Instant {
        Instant::now() + self.config.request_timeout
    }

    /// Encodes the message and queues it for sending.
    ///
    /// Returns the hash of the packet.
    fn send_packet(&self, msg: Message, to: SocketAddr) -> B256 {
        let (payload, hash) = msg.encode(&self.secret_key);
        trace!(target: "discv4", r#type=?msg.msg_type(), ?to, ?hash, "sending packet");
        if let Err(err) = self.egress.try_send((payload, to)) {
            debug!(target: "discv4", %err, ?to, "dropped outgoing packet");
        }
        hash
    }

    /// Sends a `Ping` and registers the matcher for its `Pong`.
    fn send_ping(&mut self, node: NodeRecord, reason: PingReason) {
        let ping = Ping {
            from: Endpoint::from_record(&self.local_node_record),
            to: Endpoint::from_record(&node),
            expire: self.send_expiration(),
            enr_sq: self.enr_seq(),
        };
        trace!(target: "discv4", ?node, ?reason, "sending ping");
        let echo_hash = self.send_packet(Message::Ping(ping), node.udp_addr());
        let request = PendingRequest::Ping { echo_hash, node, reason };
        self.add_reply_matcher(ReplyMatcher::new(&node, self.reply_deadline(), request));
    }

    /// Sends a `FindNode` and registers the matcher for the `Neighbours` replies.
    fn send_find_node(&mut self, node: NodeRecord, target: PeerId, tx: NodeResponseSender) {
        let msg = Message::FindNode(FindNode { id: target, expire: self.send_expiration() });
        trace!(target: "discv4", ?node, ?target, "sending find node");
        self.send_packet(msg, node.udp_addr());
        let request = PendingRequest::FindNode { nodes: Vec::new(), received: 0, tx };
        self.add_reply_matcher(ReplyMatcher::new(&node, self.reply_deadline(), request));
    }

    /// Sends an `EnrRequest` and registers the matcher for its `EnrResponse`.
    fn send_enr_request(&mut self, node: NodeRecord, tx: EnrResponseSender) {
        let msg = Message::EnrRequest(EnrRequest { expire: self.send_expiration() });
        let echo_hash = self.send_packet(msg, node.udp_addr());
        let request = PendingRequest::EnrRequest { echo_hash, node, tx };
        self.add_reply_matcher(ReplyMatcher::new(&node, self.reply_deadline(), request));
    }

    /// Registers a matcher for an expected reply.
    ///
    /// After termination the matcher immediately resolves with [`Discv4Error::Closed`].
    pub fn add_reply_matcher(&mut self, matcher: ReplyMatcher) {
        if self.terminated {
            matcher.fail(Discv4Error::Closed);
            return
        }
        self.registry.insert(matcher);
    }

    /// Hands a reply packet to the pending requests.
    ///
    /// Returns true if a pending request accepted the reply, completing the request if it was the
    /// final reply.
    pub fn on_reply(&mut self, id: PeerId, ip: IpAddr, port: u16, msg: &Message) -> bool {
        let now = Instant::now();
        match self.registry.on_reply(id, ip, port, msg, now + self.config.request_timeout) {
            ReplyOutcome::Unmatched => false,
            ReplyOutcome::Pending => true,
            ReplyOutcome::Completed(matcher) => {
                self.on_request_completed(matcher, msg, now);
                true
            }
        }
    }

    /// Delivers the result of a request that received its final reply.
    fn on_request_completed(&mut self, matcher: ReplyMatcher, msg: &Message, now: Instant) {
        match matcher.request {
            PendingRequest::Ping { node, reason, .. } => {
                self.table.update_last_pong_received(node.id, node.address, now);
                match reason {
                    PingReason::Requested(tx) => {
                        if let Message::Pong(pong) = msg {
                            let _ = tx.send(Ok(pong.clone()));
                        }
                    }
                    PingReason::PingBack => self.add_verified_node(node, now),
                    PingReason::InitialInsert | PingReason::Revalidate => {
                        self.table.record_liveness(&node.id, now)
                    }
                    PingReason::Bond { target, tx } => self.delay_find_node(node, target, tx, now),
                }
            }
            PendingRequest::FindNode { nodes, tx, .. } => {
                let _ = tx.send(Ok(nodes));
            }
            PendingRequest::EnrRequest { tx, .. } => {
                if let Message::EnrResponse(resp) = msg {
                    let _ = tx.send(Ok(resp.enr.clone()));
                }
            }
        }
    }

    /// Resolves a request whose deadline elapsed.
    fn on_request_timeout(&mut self, matcher: ReplyMatcher, now: Instant) {
        trace!(target: "discv4", from=?matcher.from, kind=?matcher.kind(), "request timed out");
        match matcher.request {
            PendingRequest::Ping { node, reason: PingReason::Revalidate, .. } => {
                debug!(target: "discv4", ?node, "removing unresponsive node");
                if self.table.remove(&node.id) {
                    self.notify(TableUpdate::Removed(node.id));
                }
            }
            // the remote may still know us from an earlier contact
            PendingRequest::Ping { node, reason: PingReason::Bond { target, tx }, .. } => {
                self.delay_find_node(node, target, tx, now)
            }
            request => request.fail(Discv4Error::Timeout),
        }
    }

    /// Sends the `FindNode` once the remote had time to ping us back.
    fn delay_find_node(
        &mut self,
        node: NodeRecord,
        target: PeerId,
        tx: NodeResponseSender,
        now: Instant,
    ) {
        let at = now + self.config.request_timeout;
        self.delayed_find_nodes.push_back(DelayedFindNode { at, node, target, tx });
    }

    fn add_verified_node(&mut self, node: NodeRecord, now: Instant) {
        if self.table.add_verified_node(node, now) {
            debug!(target: "discv4", ?node, "added verified node");
            self.notify(TableUpdate::Added(node));
        }
    }

    /// Decodes and validates a datagram and dispatches it to its handler.
    ///
    /// Errors are local to the datagram, no reply is sent for rejected packets.
    pub fn handle_datagram(
        &mut self,
        remote_addr: SocketAddr,
        datagram: &[u8],
    ) -> Result<(), Discv4Error> {
        let Packet { msg, node_id, hash } = Message::decode(datagram)?;

        if node_id == self.local_node_record.id {
            trace!(target: "discv4", ?remote_addr, "ignoring packet from self");
            return Ok(())
        }

        if let Some(expire) = msg.expire() {
            if expire < unix_timestamp() {
                trace!(target: "discv4", ?remote_addr, r#type=?msg.msg_type(), "packet expired");
                return Err(Discv4Error::Expired)
            }
        }

        trace!(target: "discv4", r#type=?msg.msg_type(), ?remote_addr, "received packet");

        let (ip, port) = (remote_addr.ip(), remote_addr.port());
        let event = match &msg {
            Message::Ping(ping) => {
                self.on_ping(ping, remote_addr, node_id, hash);
                Discv4Event::Ping
            }
            Message::Pong(_) => {
                if !self.on_reply(node_id, ip, port, &msg) {
                    return Err(Discv4Error::UnsolicitedReply)
                }
                Discv4Event::Pong
            }
            Message::FindNode(find_node) => {
                self.on_find_node(find_node, remote_addr, node_id)?;
                Discv4Event::FindNode
            }
            Message::Neighbours(neighbours) => {
                if !self.on_reply(node_id, ip, port, &msg) {
                    return Err(Discv4Error::UnsolicitedReply)
                }
                self.on_neighbours(neighbours, ip);
                Discv4Event::Neighbours
            }
            Message::EnrRequest(_) => {
                self.on_enr_request(remote_addr, node_id, hash)?;
                Discv4Event::EnrRequest
            }
            Message::EnrResponse(_) => {
                if !self.on_reply(node_id, ip, port, &msg) {
                    return Err(Discv4Error::UnsolicitedReply)
                }
                Discv4Event::EnrResponse
            }
        };

        self.queued_events.push_back(event);
        Ok(())
    }

    /// Answers the ping and pings back nodes that didn't prove their endpoint yet.
    fn on_ping(&mut self, ping: &Ping, remote_addr: SocketAddr, remote_id: PeerId, hash: B256) {
        let now = Instant::now();

        // mirror the observed endpoint
        let to = Endpoint {
            address: remote_addr.ip(),
            udp_port: remote_addr.port(),
            tcp_port: ping.from.tcp_port,
        };
        let pong = Pong { to, echo: hash, expire: self.send_expiration(), enr_sq: self.enr_seq() };
        self.send_packet(Message::Pong(pong), remote_addr);

        let record = NodeRecord {
            address: remote_addr.ip(),
            tcp_port: ping.from.tcp_port,
            udp_port: remote_addr.port(),
            id: remote_id,
        };

        let has_endpoint_proof = self.table.has_recent_pong(remote_id, record.address, now);
        self.table.update_last_ping_received(remote_id, record.address, now);

        if has_endpoint_proof {
            self.add_verified_node(record, now);
        } else if !self.registry.is_pending(MessageId::Pong, remote_id) &&
            !self.ping_backs.iter().any(|(_, node)| node.id == remote_id)
        {
            self.ping_backs.push_back((now + self.config.ping_back_delay, record));
        }
    }

    /// Answers a `FindNode` of a bonded node.
    fn on_find_node(
        &mut self,
        msg: &FindNode,
        remote_addr: SocketAddr,
        node_id: PeerId,
    ) -> Result<(), Discv4Error> {
        if !self.table.has_bond(node_id, remote_addr.ip(), Instant::now()) {
            trace!(target: "discv4", ?remote_addr, "find node from unknown node");
            return Err(Discv4Error::UnknownNode)
        }
        self.respond_closest(msg.id, remote_addr);
        Ok(())
    }

    /// Sends the live nodes closest to the target, ordered by distance and split across as many
    /// `Neighbours` packets as needed.
    fn respond_closest(&mut self, target: PeerId, to: SocketAddr) {
        let closest = self.table.find_closest(target, MAX_NODES_PER_BUCKET, true);
        let expire = self.send_expiration();

        if closest.is_empty() {
            self.send_packet(Message::Neighbours(Neighbours { nodes: Vec::new(), expire }), to);
            return
        }

        for nodes in closest.chunks(MAX_NEIGHBOURS_PER_PACKET) {
            let msg = Message::Neighbours(Neighbours { nodes: nodes.to_vec(), expire });
            self.send_packet(msg, to);
        }
    }

    /// Adds the usable nodes of an accepted `Neighbours` packet to the table.
    fn on_neighbours(&mut self, msg: &Neighbours, relay: IpAddr) {
        let mut added = Vec::new();
        for node in msg.nodes.iter().filter(|node| node::is_valid_neighbour(relay, node)) {
            if node.id != self.local_node_record.id && self.table.add_seen_node(*node) {
                added.push(TableUpdate::Added(*node));
            }
        }
        match added.len() {
            0 => {}
            1 => self.notify(added.remove(0)),
            _ => self.notify(TableUpdate::Batch(added)),
        }
    }

    /// Answers an `EnrRequest` of a bonded node.
    fn on_enr_request(
        &mut self,
        remote_addr: SocketAddr,
        node_id: PeerId,
        request_hash: B256,
    ) -> Result<(), Discv4Error> {
        if !self.table.has_bond(node_id, remote_addr.ip(), Instant::now()) {
            trace!(target: "discv4", ?remote_addr, "enr request from unknown node");
            return Err(Discv4Error::UnknownNode)
        }
        if !self.config.enable_eip868 {
            return Ok(())
        }
        let enr = self.local_eip_868_enr.clone();
        self.send_packet(Message::EnrResponse(EnrResponse { request_hash, enr }), remote_addr);
        Ok(())
    }

    /// Pings the least recently validated node and drops stale bonds.
    fn revalidate(&mut self) {
        let now = Instant::now();
        self.table.prune_bonds(now);
        if let Some(node) = self.table.least_recently_validated() {
            if !self.registry.is_pending(MessageId::Pong, node.id) {
                self.send_ping(node, PingReason::Revalidate);
            }
        }
    }

    /// Starts a self lookup unless one is running.
    fn start_self_lookup(&mut self) {
        if self.lookup.is_some() {
            return
        }
        let handle = self.handle();
        self.lookup = Some(Box::pin(async move {
            match handle.lookup_self().await {
                Ok(nodes) => trace!(target: "discv4", num = nodes.len(), "self lookup done"),
                Err(err) => debug!(target: "discv4", %err, "self lookup failed"),
            }
        }));
    }

    fn on_command(&mut self, cmd: Discv4Command) {
        match cmd {
            Discv4Command::Ping { node, tx } => self.send_ping(node, PingReason::Requested(tx)),
            Discv4Command::FindNode { node, target, ensure_bond, tx } => {
                if ensure_bond && !self.table.has_recent_ping(node.id, node.address, Instant::now())
                {
                    self.send_ping(node, PingReason::Bond { target, tx });
                } else {
                    self.send_find_node(node, target, tx);
                }
            }
            Discv4Command::EnrRequest { node, tx } => self.send_enr_request(node, tx),
            Discv4Command::Closest { target, tx } => {
                let _ = tx.send(self.table.find_closest(target, MAX_NODES_PER_BUCKET, false));
            }
            Discv4Command::AddNode(node) => self.add_node(node),
            Discv4Command::SetEip868RlpPair { key, rlp } => self.set_eip868_rlp_pair(key, rlp),
            Discv4Command::Terminate => self.terminate(),
        }
    }

    /// Stops the service, all pending requests resolve with [`Discv4Error::Closed`].
    fn terminate(&mut self) {
        if self.terminated {
            return
        }
        debug!(target: "discv4", pending = self.registry.len(), "terminating");
        self.terminated = true;

        for matcher in self.registry.drain() {
            matcher.fail(Discv4Error::Closed);
        }
        for delayed in self.delayed_find_nodes.drain(..) {
            let _ = delayed.tx.send(Err(Discv4Error::Closed));
        }
        self.ping_backs.clear();
        self.lookup = None;

        // dropping queued commands resolves their requests with `Closed`
        self.commands_rx.close();
        while self.commands_rx.try_recv().is_ok() {}
    }

    /// Sends the update to all listeners, closed listeners are removed.
    fn notify(&mut self, update: TableUpdate) {
        self.update_listeners.retain_mut(|listener| match listener.try_send(update.clone()) {
            Ok(()) => true,
            Err(err) => match err {
                mpsc::error::TrySendError::Full(_) => true,
                mpsc::error::TrySendError::Closed(_) => false,
            },
        });
    }

    /// The earliest point in time something is due.
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.registry.next_deadline(),
            self.ping_backs.front().map(|(at, _)| *at),
            self.delayed_find_nodes.front().map(|delayed| delayed.at),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Handles everything that is due at `now`.
    fn on_timer(&mut self, now: Instant) {
        for matcher in self.registry.remove_expired(now) {
            self.on_request_timeout(matcher, now);
        }

        while self.ping_backs.front().map(|(at, _)| *at <= now).unwrap_or_default() {
            let Some((_, node)) = self.ping_backs.pop_front() else { break };
            if !self.table.has_recent_pong(node.id, node.address, now) &&
                !self.registry.is_pending(MessageId::Pong, node.id)
            {
                self.send_ping(node, PingReason::PingBack);
            }
        }

        while self.delayed_find_nodes.front().map(|delayed| delayed.at <= now).unwrap_or_default() {
            let Some(DelayedFindNode { node, target, tx, .. }) =
                self.delayed_find_nodes.pop_front()
            else {
                break
            };
            self.send_find_node(node, target, tx);
        }
    }

    /// Drives the timer until nothing is due.
    fn poll_timer(&mut self, cx: &mut Context<'_>) {
        while let Some(deadline) = self.next_deadline() {
            if self.timer.deadline() != deadline {
                self.timer.as_mut().reset(deadline);
            }
            if self.timer.poll_unpin(cx).is_pending() {
                return
            }
            self.on_timer(Instant::now().max(deadline));
        }
    }

    /// Polls the socket and advances the state.
    ///
    /// To prevent traffic amplification attacks, implementations must verify that the sender of a
    /// query participates in the discovery protocol. The sender of a packet is considered verified
    /// if it has sent a valid Pong response with matching ping hash within the last 12 hours.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Discv4Event> {
        loop {
            // drain buffered events first
            if let Some(event) = self.queued_events.pop_front() {
                return Poll::Ready(event)
            }

            if self.terminated {
                return Poll::Ready(Discv4Event::Terminated)
            }

            // process all incoming commands
            while let Poll::Ready(Some(cmd)) = self.commands_rx.poll_recv(cx) {
                self.on_command(cmd);
                if self.terminated {
                    break
                }
            }
            if self.terminated {
                continue
            }

            // process all incoming datagrams
            while let Poll::Ready(Some(event)) = self.ingress.poll_recv(cx) {
                match event {
                    IngressEvent::RecvError(err) => {
                        debug!(target: "discv4", %err, "failed to read datagram");
                    }
                    IngressEvent::Datagram(remote_addr, datagram) => {
                        if let Err(err) = self.handle_datagram(remote_addr, &datagram) {
                            trace!(target: "discv4", %err, ?remote_addr, "rejected datagram");
                        }
                    }
                }
            }

            while self.revalidate_interval.poll_tick(cx).is_ready() {
                self.revalidate();
            }

            if self.config.enable_lookup {
                while self.lookup_interval.poll_tick(cx).is_ready() {
                    self.start_self_lookup();
                }
            }

            if let Some(mut lookup) = self.lookup.take() {
                if lookup.poll_unpin(cx).is_pending() {
                    self.lookup = Some(lookup);
                } else {
                    self.initial_refresh.send_replace(true);
                }
            }

            // expire requests and send scheduled packets
            self.poll_timer(cx);

            if self.queued_events.is_empty() {
                return Poll::Pending
            }
        }
    }
}

/// Endless future impl
impl Stream for Discv4Service {
    type Item = Discv4Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(self.get_mut().poll(cx)) {
            Discv4Event::Terminated => Poll::Ready(None),
            event => Poll::Ready(Some(event)),
        }
    }
}

impl fmt::Debug for Discv4Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discv4Service")
            .field("local_address", &self.local_address)
            .field("local_node_record", &self.local_node_record)
            .field("table", &self.table)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

/// A `FindNode` that is sent once `at` elapsed.
#[derive(Debug)]
struct DelayedFindNode {
    at: Instant,
    node: NodeRecord,
    target: PeerId,
    tx: NodeResponseSender,
}

/// Commands sent from the [`Discv4`] handle to the [`Discv4Service`]
#[derive(Debug)]
enum Discv4Command {
    Ping { node: NodeRecord, tx: PingResponseSender },
    FindNode { node: NodeRecord, target: PeerId, ensure_bond: bool, tx: NodeResponseSender },
    EnrRequest { node: NodeRecord, tx: EnrResponseSender },
    Closest { target: PeerId, tx: oneshot::Sender<Vec<NodeRecord>> },
    AddNode(NodeRecord),
    SetEip868RlpPair { key: Vec<u8>, rlp: Bytes },
    Terminate,
}

/// Event type receiver produces
#[derive(Debug)]
pub(crate) enum IngressEvent {
    /// Encountered an error when reading a datagram message.
    RecvError(io::Error),
    /// Received a datagram.
    Datagram(SocketAddr, Bytes),
}

/// Continuously reads new messages from the channel and writes them to the socket
async fn send_loop(udp: Arc<UdpSocket>, rx: EgressReceiver) {
    let mut stream = ReceiverStream::new(rx);
    while let Some((payload, to)) = stream.next().await {
        match udp.send_to(&payload, to).await {
            Ok(size) => {
                trace!(target: "discv4", ?to, ?size,"sent payload");
            }
            Err(err) => {
                debug!(target: "discv4", ?to, %err,"failed to send datagram.");
            }
        }
    }
}

/// Continuously awaits new incoming messages and sends them back through the channel.
async fn receive_loop(udp: Arc<UdpSocket>, tx: IngressSender) {
    let mut buf = [0; MAX_PACKET_SIZE];
    loop {
        let res = udp.recv_from(&mut buf).await;
        let event = match res {
            Err(err) => {
                warn!(target: "discv4", %err, "failed to read datagram");
                IngressEvent::RecvError(err)
            }
            Ok((read, remote_addr)) => {
                IngressEvent::Datagram(remote_addr, Bytes::copy_from_slice(&buf[..read]))
            }
        };
        if tx.send(event).await.is_err() {
            // service dropped
            return
        }
    }
}

/// Current unix time in seconds.
fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The event type the [`Discv4Service`] stream produces, one per accepted packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Discv4Event {
    /// A `Ping` message was handled.
    Ping,
    /// A `Pong` message was handled.
    Pong,
    /// A `FindNode` message was handled.
    FindNode,
    /// A `Neighbours` message was handled.
    Neighbours,
    /// An `EnrRequest` message was handled.
    EnrRequest,
    /// An `EnrResponse` message was handled.
    EnrResponse,
    /// The service was terminated.
    Terminated,
}

/// Represents a change to the routing table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TableUpdate {
    /// A new node was inserted to the table.
    Added(NodeRecord),
    /// Node that was removed from the table
    Removed(PeerId),
    /// A series of updates
    Batch(Vec<TableUpdate>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        create_discv4, create_discv4_with_config, create_discv4_with_pipe, future_expiration,
        init_tracing, rng_id, rng_node, test_config,
    };
    use assert_matches::assert_matches;
    use rand::{thread_rng, Rng};
    use std::{collections::HashMap, time::Duration};

    fn ping_from(remote: &NodeRecord, to: Endpoint) -> Message {
        Message::Ping(Ping {
            from: Endpoint::from_record(remote),
            to,
            expire: future_expiration(),
            enr_sq: None,
        })
    }

    fn pong_from(remote: &NodeRecord, echo: B256) -> Message {
        Message::Pong(Pong {
            to: Endpoint::from_record(remote),
            echo,
            expire: future_expiration(),
            enr_sq: None,
        })
    }

    fn neighbours(nodes: Vec<NodeRecord>) -> Message {
        Message::Neighbours(Neighbours { nodes, expire: future_expiration() })
    }

    #[tokio::test]
    async fn test_reject_expired_packet() {
        init_tracing();
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let (sk, remote) = rng_node(&mut thread_rng());

        let ping = Ping {
            from: Endpoint::from_record(&remote),
            to: pipe.local_endpoint(),
            expire: unix_timestamp() - 1,
            enr_sq: None,
        };
        let (datagram, _) = Message::Ping(ping).encode(&sk);
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::Expired)
        );
        assert!(pipe.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_reject_garbage() {
        let (_discv4, mut service, _pipe) = create_discv4_with_pipe();
        let (_, remote) = rng_node(&mut thread_rng());

        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &[0u8; 20]),
            Err(Discv4Error::Decode(DecodePacketError::PacketTooShort))
        );
        let garbage = [0xde; 160];
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &garbage),
            Err(Discv4Error::Decode(DecodePacketError::HashMismatch))
        );
    }

    #[tokio::test]
    async fn test_unsolicited_pong() {
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let (sk, remote) = rng_node(&mut rng);

        let (datagram, _) = pong_from(&remote, B256::from(rng.gen::<[u8; 32]>())).encode(&sk);
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::UnsolicitedReply)
        );
        let (datagram, _) = neighbours(vec![]).encode(&sk);
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::UnsolicitedReply)
        );
        assert!(pipe.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_ignore_own_packets() {
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let local = pipe.local_node();

        let (datagram, _) = ping_from(&local, pipe.local_endpoint()).encode(&service.secret_key);
        assert_matches!(service.handle_datagram(local.udp_addr(), &datagram), Ok(()));
        assert!(pipe.try_recv().is_none());
        assert!(service.queued_events.is_empty());
    }

    #[tokio::test]
    async fn test_find_node_requires_bond() {
        init_tracing();
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let (sk, remote) = rng_node(&mut rng);

        let target = rng_id(&mut rng);
        let find_node = Message::FindNode(FindNode { id: target, expire: future_expiration() });
        let (datagram, _) = find_node.encode(&sk);
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::UnknownNode)
        );
        assert!(pipe.try_recv().is_none());

        // a ping is answered right away and bonds the endpoint
        let (ping, ping_hash) = ping_from(&remote, pipe.local_endpoint()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &ping).unwrap();
        let (packet, to) = pipe.try_recv().unwrap();
        assert_eq!(to, remote.udp_addr());
        assert_eq!(packet.node_id, pipe.local_node().id);
        assert_matches!(packet.msg, Message::Pong(pong) => {
            assert_eq!(pong.echo, ping_hash);
            assert_eq!(pong.to, Endpoint::from_record(&remote));
        });

        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();
        let (packet, _) = pipe.try_recv().unwrap();
        assert_matches!(packet.msg, Message::Neighbours(msg) => assert!(msg.nodes.is_empty()));
        assert_eq!(service.next().await, Some(Discv4Event::Ping));
        assert_eq!(service.next().await, Some(Discv4Event::FindNode));
    }

    #[tokio::test]
    async fn test_pong_must_match_ping() {
        let (_discv4, mut service, _pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let (sk, remote) = rng_node(&mut rng);
        let echo_hash = B256::from(rng.gen::<[u8; 32]>());

        let (tx, mut rx) = oneshot::channel();
        let request =
            PendingRequest::Ping { echo_hash, node: remote, reason: PingReason::Requested(tx) };
        service.add_reply_matcher(ReplyMatcher::new(
            &remote,
            Instant::now() + Duration::from_secs(5),
            request,
        ));

        // wrong token
        let (datagram, _) = pong_from(&remote, B256::ZERO).encode(&sk);
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::UnsolicitedReply)
        );

        // wrong source address
        let (datagram, _) = pong_from(&remote, echo_hash).encode(&sk);
        let other: SocketAddr = ([10, 0, 0, 9], remote.udp_port).into();
        assert_matches!(
            service.handle_datagram(other, &datagram),
            Err(Discv4Error::UnsolicitedReply)
        );
        assert!(rx.try_recv().is_err());

        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();
        assert_matches!(rx.try_recv(), Ok(Ok(pong)) => assert_eq!(pong.echo, echo_hash));
        assert_eq!(service.num_pending_requests(), 0);
        assert!(service.table.has_recent_pong(remote.id, remote.address, Instant::now()));

        // the request is done
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::UnsolicitedReply)
        );
    }

    #[tokio::test]
    async fn test_ping_timeout() {
        let (discv4, service, mut pipe) = create_discv4_with_pipe();
        let _handle = service.spawn();
        let (_, remote) = rng_node(&mut thread_rng());

        let ping = tokio::spawn({
            let discv4 = discv4.clone();
            async move { discv4.ping(remote).await }
        });
        let (packet, to) = pipe.recv().await.unwrap();
        assert_eq!(to, remote.udp_addr());
        assert_matches!(packet.msg, Message::Ping(_));
        assert_matches!(ping.await.unwrap(), Err(Discv4Error::Timeout));
    }

    #[tokio::test]
    async fn test_concurrent_pings() {
        init_tracing();
        let (discv4, service, mut pipe) = create_discv4_with_pipe();
        let _handle = service.spawn();
        let mut rng = thread_rng();

        let nodes = (0..200).map(|_| rng_node(&mut rng)).collect::<Vec<_>>();
        // only every other node answers
        let responders = nodes
            .iter()
            .step_by(2)
            .map(|(sk, node)| (node.udp_addr(), (*sk, *node)))
            .collect::<HashMap<_, _>>();

        let num_responders = responders.len();
        tokio::spawn(async move {
            while let Some((packet, to)) = pipe.recv().await {
                let Some((sk, node)) = responders.get(&to) else { continue };
                if let Message::Ping(_) = packet.msg {
                    pipe.send(to, sk, pong_from(node, packet.hash)).await;
                }
            }
        });

        let results = futures::future::join_all(
            nodes.iter().map(|(_, node)| discv4.ping(*node)).collect::<Vec<_>>(),
        )
        .await;

        let answered = results.iter().filter(|res| res.is_ok()).count();
        let timed_out =
            results.iter().filter(|res| matches!(res, Err(Discv4Error::Timeout))).count();
        assert_eq!(answered, num_responders);
        assert_eq!(timed_out, nodes.len() - num_responders);
    }

    #[tokio::test]
    async fn test_find_node_timeout() {
        let (discv4, service, _pipe) = create_discv4_with_pipe();
        let _handle = service.spawn();
        let mut rng = thread_rng();
        let (_, remote) = rng_node(&mut rng);

        let res = discv4.find_node(remote.id, remote.udp_addr(), rng_id(&mut rng)).await;
        assert_matches!(res, Err(Discv4Error::Timeout));
    }

    #[tokio::test]
    async fn test_respond_closest_in_chunks() {
        init_tracing();
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let now = Instant::now();

        for i in 0..300 {
            let (_, node) = rng_node(&mut rng);
            if i % 3 == 0 {
                service.table.add_seen_node(node);
            } else {
                service.table.add_verified_node(node, now);
            }
        }

        let (sk, remote) = rng_node(&mut rng);
        service.table.update_last_ping_received(remote.id, remote.address, now);

        let target = rng_id(&mut rng);
        let expected = service.table.find_closest(target, MAX_NODES_PER_BUCKET, true);
        assert!(expected.len() > MAX_NEIGHBOURS_PER_PACKET);

        let find_node = Message::FindNode(FindNode { id: target, expire: future_expiration() });
        let (datagram, _) = find_node.encode(&sk);
        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();

        let mut received = Vec::new();
        let mut packets = 0;
        while let Some((packet, to)) = pipe.try_recv() {
            assert_eq!(to, remote.udp_addr());
            assert_matches!(packet.msg, Message::Neighbours(msg) => {
                assert!(msg.nodes.len() <= MAX_NEIGHBOURS_PER_PACKET);
                received.extend(msg.nodes);
            });
            packets += 1;
        }
        assert_eq!(packets, expected.len().div_ceil(MAX_NEIGHBOURS_PER_PACKET));
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_find_node_collects_multiple_replies() {
        let (_discv4, mut service, _pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let (sk, _) = rng_node(&mut rng);
        let remote = NodeRecord::from_secret_key(([10, 0, 1, 99], 30303).into(), &sk);

        let (tx, mut rx) = oneshot::channel();
        let request = PendingRequest::FindNode { nodes: Vec::new(), received: 0, tx };
        service.add_reply_matcher(ReplyMatcher::new(
            &remote,
            Instant::now() + Duration::from_secs(5),
            request,
        ));

        let mut first = (0..MAX_NEIGHBOURS_PER_PACKET)
            .map(|_| rng_node(&mut rng).1)
            .collect::<Vec<_>>();
        // privileged port
        first[0].udp_port = 1000;
        let second = (0..MAX_NODES_PER_BUCKET - MAX_NEIGHBOURS_PER_PACKET)
            .map(|_| rng_node(&mut rng).1)
            .collect::<Vec<_>>();

        let (datagram, _) = neighbours(first.clone()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(service.num_pending_requests(), 1);

        let (datagram, _) = neighbours(second.clone()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();

        let expected = first.into_iter().skip(1).chain(second).collect::<Vec<_>>();
        assert_matches!(rx.try_recv(), Ok(Ok(nodes)) => assert_eq!(nodes, expected));
        assert_eq!(service.num_pending_requests(), 0);
        assert!(expected.iter().all(|node| service.table.contains(&node.id)));
    }

    #[tokio::test]
    async fn test_find_node_partial_result_on_timeout() {
        let (_discv4, mut service, _pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let (sk, remote) = rng_node(&mut rng);

        let (tx, mut rx) = oneshot::channel();
        let request = PendingRequest::FindNode { nodes: Vec::new(), received: 0, tx };
        service.add_reply_matcher(ReplyMatcher::new(&remote, service.reply_deadline(), request));

        let nodes = (0..3).map(|_| rng_node(&mut rng).1).collect::<Vec<_>>();
        let (datagram, _) = neighbours(nodes.clone()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();
        assert!(rx.try_recv().is_err());

        service.on_timer(Instant::now() + Duration::from_secs(1));
        assert_matches!(rx.try_recv(), Ok(Ok(res)) => assert_eq!(res, nodes));
    }

    #[tokio::test]
    async fn test_empty_neighbours_do_not_keep_find_node_alive() {
        let (_discv4, mut service, _pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let (sk, remote) = rng_node(&mut rng);

        let start = Instant::now();
        let (tx, mut rx) = oneshot::channel();
        let request = PendingRequest::FindNode { nodes: Vec::new(), received: 0, tx };
        service.add_reply_matcher(ReplyMatcher::new(&remote, service.reply_deadline(), request));

        let (empty, _) = neighbours(vec![]).encode(&sk);
        for i in 1..=10 {
            let _ = service.handle_datagram(remote.udp_addr(), &empty);
            service.on_timer(start + Duration::from_millis(150 * i));
        }
        assert_matches!(rx.try_recv(), Ok(Err(Discv4Error::Timeout)));
        assert_eq!(service.num_pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_reject_enr_response_of_other_node() {
        let (_discv4, mut service, _pipe) = create_discv4_with_pipe();
        let mut rng = thread_rng();
        let (sk, remote) = rng_node(&mut rng);

        let echo_hash = B256::from(rng.gen::<[u8; 32]>());
        let (tx, mut rx) = oneshot::channel();
        let request = PendingRequest::EnrRequest { echo_hash, node: remote, tx };
        service.add_reply_matcher(ReplyMatcher::new(&remote, service.reply_deadline(), request));

        let foreign = Enr::builder().build(&SecretKey::new(&mut rng)).unwrap();
        let resp = Message::EnrResponse(EnrResponse { request_hash: echo_hash, enr: foreign });
        let (datagram, _) = resp.encode(&sk);
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::UnsolicitedReply)
        );
        assert!(rx.try_recv().is_err());

        let own = Enr::builder().build(&sk).unwrap();
        let resp = Message::EnrResponse(EnrResponse { request_hash: echo_hash, enr: own });
        let (datagram, _) = resp.encode(&sk);
        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();
        assert_matches!(rx.try_recv(), Ok(Ok(enr)) => {
            assert_eq!(pk2id(&enr.public_key()), remote.id);
        });
    }

    #[tokio::test]
    async fn test_ping_back_inserts_node() {
        init_tracing();
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let mut updates = service.update_stream();
        let (sk, remote) = rng_node(&mut thread_rng());

        let (ping, _) = ping_from(&remote, pipe.local_endpoint()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &ping).unwrap();
        assert_matches!(pipe.try_recv(), Some((Packet { msg: Message::Pong(_), .. }, _)));
        // not inserted before the endpoint proof
        assert!(!service.table.contains(&remote.id));

        service.on_timer(Instant::now() + Duration::from_secs(1));
        let (packet, to) = pipe.try_recv().unwrap();
        assert_eq!(to, remote.udp_addr());
        assert_matches!(packet.msg, Message::Ping(ref ping) => {
            assert_eq!(ping.to, Endpoint::from_record(&remote));
            assert_eq!(ping.from, pipe.local_endpoint());
        });

        let (pong, _) = pong_from(&remote, packet.hash).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &pong).unwrap();

        assert_eq!(updates.next().await, Some(TableUpdate::Added(remote)));
        assert_eq!(service.table.liveness_checks(&remote.id), Some(1));

        // a second ping of a bonded node is answered without pinging back
        let (ping, _) = ping_from(&remote, pipe.local_endpoint()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &ping).unwrap();
        assert_matches!(pipe.try_recv(), Some((Packet { msg: Message::Pong(_), .. }, _)));
        service.on_timer(Instant::now() + Duration::from_secs(1));
        assert!(pipe.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_revalidate_removes_unresponsive_node() {
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let mut updates = service.update_stream();
        let (_, node) = rng_node(&mut thread_rng());
        service.table.add_seen_node(node);

        service.revalidate();
        assert_matches!(pipe.try_recv(), Some((Packet { msg: Message::Ping(_), .. }, to)) => {
            assert_eq!(to, node.udp_addr());
        });
        // no second ping while one is pending
        service.revalidate();
        assert!(pipe.try_recv().is_none());

        service.on_timer(Instant::now() + Duration::from_secs(1));
        assert!(!service.table.contains(&node.id));
        assert_eq!(updates.next().await, Some(TableUpdate::Removed(node.id)));
    }

    #[tokio::test]
    async fn test_enr_request() {
        let (_discv4, mut service, mut pipe) = create_discv4_with_pipe();
        let (sk, remote) = rng_node(&mut thread_rng());

        let enr_request = Message::EnrRequest(EnrRequest { expire: future_expiration() });
        let (datagram, request_hash) = enr_request.encode(&sk);
        assert_matches!(
            service.handle_datagram(remote.udp_addr(), &datagram),
            Err(Discv4Error::UnknownNode)
        );

        let (ping, _) = ping_from(&remote, pipe.local_endpoint()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &ping).unwrap();
        let seq = service.local_enr().seq();
        assert_matches!(pipe.try_recv(), Some((Packet { msg: Message::Pong(pong), .. }, _)) => {
            assert_eq!(pong.enr_sq, Some(seq));
        });

        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();
        assert_matches!(
            pipe.try_recv(),
            Some((Packet { msg: Message::EnrResponse(resp), .. }, _)) => {
                assert_eq!(resp.request_hash, request_hash);
                assert_eq!(resp.enr.seq(), seq);
                assert_eq!(resp.to_node_record(), Some(pipe.local_node()));
            }
        );

        let mut rlp = BytesMut::new();
        1u64.encode(&mut rlp);
        service.set_eip868_rlp_pair(b"eth".to_vec(), rlp.freeze());
        assert_eq!(service.local_enr().seq(), seq + 1);
    }

    #[tokio::test]
    async fn test_enr_request_disabled() {
        let config = Discv4Config { enable_eip868: false, ..test_config() };
        let (_discv4, mut service, mut pipe) =
            crate::test_utils::create_discv4_with_config_and_pipe(config);
        let (sk, remote) = rng_node(&mut thread_rng());

        let (ping, _) = ping_from(&remote, pipe.local_endpoint()).encode(&sk);
        service.handle_datagram(remote.udp_addr(), &ping).unwrap();
        assert_matches!(pipe.try_recv(), Some((Packet { msg: Message::Pong(pong), .. }, _)) => {
            assert_eq!(pong.enr_sq, None);
        });

        let enr_request = Message::EnrRequest(EnrRequest { expire: future_expiration() });
        let (datagram, _) = enr_request.encode(&sk);
        service.handle_datagram(remote.udp_addr(), &datagram).unwrap();
        assert!(pipe.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_terminate_closes_requests() {
        let (discv4, service, mut pipe) = create_discv4_with_pipe();
        let handle = service.spawn();
        let mut rng = thread_rng();
        let (_, remote) = rng_node(&mut rng);

        let ping = tokio::spawn({
            let discv4 = discv4.clone();
            async move { discv4.ping(remote).await }
        });
        assert_matches!(pipe.recv().await, Some((Packet { msg: Message::Ping(_), .. }, _)));

        discv4.terminate();
        assert_matches!(ping.await.unwrap(), Err(Discv4Error::Closed));
        handle.await.unwrap();

        let res = discv4.find_node(remote.id, remote.udp_addr(), rng_id(&mut rng)).await;
        assert_matches!(res, Err(Discv4Error::Closed));
        assert_matches!(discv4.lookup_self().await, Err(Discv4Error::Closed));
    }

    #[tokio::test]
    async fn test_add_reply_matcher_after_terminate() {
        let (_discv4, mut service, _pipe) = create_discv4_with_pipe();
        let (_, remote) = rng_node(&mut thread_rng());
        service.terminate();

        let (tx, mut rx) = oneshot::channel();
        let request = PendingRequest::FindNode { nodes: Vec::new(), received: 0, tx };
        service.add_reply_matcher(ReplyMatcher::new(&remote, service.reply_deadline(), request));
        assert_matches!(rx.try_recv(), Ok(Err(Discv4Error::Closed)));
        assert_eq!(service.next().await, None);
    }

    #[tokio::test]
    async fn test_initial_refresh_without_boot_nodes() {
        let (discv4, service) = create_discv4().await;
        let _handle = service.spawn();
        tokio::time::timeout(Duration::from_secs(1), discv4.initial_refresh_done())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_udp_ping_and_enr() {
        init_tracing();
        let (discv4_a, service_a) = create_discv4().await;
        let (discv4_b, service_b) = create_discv4().await;
        let _a = service_a.spawn();
        let _b = service_b.spawn();

        let pong = discv4_a.ping(discv4_b.node_record()).await.unwrap();
        assert_eq!(pong.to.udp_port, discv4_a.local_addr().port());

        // b pinged back in the meantime
        tokio::time::sleep(Duration::from_millis(100)).await;
        let enr = discv4_a.request_enr(discv4_b.node_record()).await.unwrap();
        assert_eq!(crate::pk2id(&enr.public_key()), discv4_b.node_record().id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_udp_lookup() {
        init_tracing();
        let config = test_config();
        let (discv4_a, service_a) = create_discv4_with_config(config.clone()).await;
        let (discv4_b, service_b) = create_discv4_with_config(config.clone()).await;
        let (discv4_c, service_c) = create_discv4_with_config(config).await;
        let _a = service_a.spawn();
        let _b = service_b.spawn();
        let _c = service_c.spawn();

        discv4_b.add_node(discv4_c.node_record());
        discv4_a.add_node(discv4_b.node_record());
        // wait for the liveness checks
        tokio::time::sleep(Duration::from_millis(500)).await;

        let found = tokio::time::timeout(Duration::from_secs(5), discv4_a.lookup_self())
            .await
            .unwrap()
            .unwrap();
        let ids = found.iter().map(|node| node.id).collect::<HashSet<_>>();
        assert!(ids.contains(&discv4_b.node_record().id));
        assert!(ids.contains(&discv4_c.node_record().id));
        assert!(!ids.contains(&discv4_a.node_record().id));
    }

    #[tokio::test]
    async fn test_bootstrap_refresh() {
        init_tracing();
        let (discv4_b, service_b) = create_discv4().await;
        let _b = service_b.spawn();

        let config = Discv4Config::builder()
            .request_timeout(Duration::from_millis(200))
            .add_boot_node(discv4_b.node_record())
            .lookup_interval(Duration::from_secs(60))
            .build();
        let (discv4_a, mut service_a) = create_discv4_with_config(config).await;
        let mut updates = service_a.update_stream();
        let _a = service_a.spawn();

        assert_eq!(updates.next().await, Some(TableUpdate::Added(discv4_b.node_record())));
        tokio::time::timeout(Duration::from_secs(5), discv4_a.initial_refresh_done())
            .await
            .unwrap()
            .unwrap();
    }
}
