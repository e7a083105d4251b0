//! A set of configuration parameters to tune the discovery protocol.

use crate::node::NodeRecord;
use alloy_rlp::Encodable;
use bytes::{Bytes, BytesMut};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

/// Configuration parameters that define the performance of the discovery network.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Discv4Config {
    /// Size of the channel buffer for outgoing messages.
    pub udp_egress_message_buffer: usize,
    /// Size of the channel buffer for incoming messages.
    pub udp_ingress_message_buffer: usize,
    /// The request timeout for each UDP request. Default: 500 milliseconds.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub request_timeout: Duration,
    /// The delay before a ping is sent back to a node that pinged us for the first time. Default:
    /// 50 milliseconds.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub ping_back_delay: Duration,
    /// The interval at which the least recently validated table entry is re-pinged. Default: 10
    /// seconds.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub table_revalidate_interval: Duration,
    /// How long a received ping or pong proves the endpoint of a node. Default: 24 hours.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub bond_expiration: Duration,
    /// The lifetime written into outgoing packets. Default: 20 seconds.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub packet_expiration: Duration,
    /// Whether to advertise and serve the local ENR, see <https://eips.ethereum.org/EIPS/eip-868>
    pub enable_eip868: bool,
    /// Additional pairs to include in the local ENR.
    pub additional_eip868_rlp_pairs: HashMap<Vec<u8>, Bytes>,
    /// Nodes to boot from.
    pub bootstrap_nodes: HashSet<NodeRecord>,
    /// Whether to randomly discover new peers.
    ///
    /// If true, the node will automatically look for new peers by sending `FindNode` requests
    /// every [`Self::lookup_interval`].
    pub enable_lookup: bool,
    /// The interval at which self lookups run. Default: 20 seconds.
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde"))]
    pub lookup_interval: Duration,
}

impl Discv4Config {
    /// Returns a new default builder instance
    pub fn builder() -> Discv4ConfigBuilder {
        Default::default()
    }

    /// Add another key value pair to include in the ENR
    pub fn add_eip868_pair(&mut self, key: impl AsRef<[u8]>, value: impl Encodable) -> &mut Self {
        let mut buf = BytesMut::new();
        value.encode(&mut buf);
        self.add_eip868_rlp_pair(key, buf.freeze())
    }

    /// Add another key value pair to include in the ENR
    pub fn add_eip868_rlp_pair(&mut self, key: impl AsRef<[u8]>, rlp: Bytes) -> &mut Self {
        self.additional_eip868_rlp_pairs.insert(key.as_ref().to_vec(), rlp);
        self
    }
}

impl Default for Discv4Config {
    fn default() -> Self {
        Self {
            udp_egress_message_buffer: 1024,
            udp_ingress_message_buffer: 1024,
            request_timeout: Duration::from_millis(500),
            ping_back_delay: Duration::from_millis(50),
            table_revalidate_interval: Duration::from_secs(10),
            bond_expiration: Duration::from_secs(60 * 60 * 24),
            packet_expiration: Duration::from_secs(20),
            enable_eip868: true,
            additional_eip868_rlp_pairs: Default::default(),
            bootstrap_nodes: Default::default(),
            enable_lookup: true,
            lookup_interval: Duration::from_secs(20),
        }
    }
}

/// Builder type for [`Discv4Config`]
#[derive(Debug, Default)]
#[must_use]
pub struct Discv4ConfigBuilder {
    config: Discv4Config,
}

impl Discv4ConfigBuilder {
    /// Sets the channel size for incoming messages
    pub fn udp_ingress_message_buffer(&mut self, udp_ingress_message_buffer: usize) -> &mut Self {
        self.config.udp_ingress_message_buffer = udp_ingress_message_buffer;
        self
    }

    /// Sets the channel size for outgoing messages
    pub fn udp_egress_message_buffer(&mut self, udp_egress_message_buffer: usize) -> &mut Self {
        self.config.udp_egress_message_buffer = udp_egress_message_buffer;
        self
    }

    /// The request timeout for each UDP request.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.request_timeout = timeout;
        self
    }

    /// The delay before pinging back a node that pinged us first.
    pub fn ping_back_delay(&mut self, delay: Duration) -> &mut Self {
        self.config.ping_back_delay = delay;
        self
    }

    /// The interval at which table entries are re-pinged.
    pub fn table_revalidate_interval(&mut self, interval: Duration) -> &mut Self {
        self.config.table_revalidate_interval = interval;
        self
    }

    /// How long a received ping or pong counts as proof of the remote endpoint.
    pub fn bond_expiration(&mut self, duration: Duration) -> &mut Self {
        self.config.bond_expiration = duration;
        self
    }

    /// The lifetime of outgoing packets.
    pub fn packet_expiration(&mut self, duration: Duration) -> &mut Self {
        self.config.packet_expiration = duration;
        self
    }

    /// Whether to enable EIP-868
    pub fn enable_eip868(&mut self, enable_eip868: bool) -> &mut Self {
        self.config.enable_eip868 = enable_eip868;
        self
    }

    /// Add another key value pair to include in the ENR
    pub fn add_eip868_pair(&mut self, key: impl AsRef<[u8]>, value: impl Encodable) -> &mut Self {
        self.config.add_eip868_pair(key, value);
        self
    }

    /// Add another key value pair to include in the ENR
    pub fn add_eip868_rlp_pair(&mut self, key: impl AsRef<[u8]>, rlp: Bytes) -> &mut Self {
        self.config.add_eip868_rlp_pair(key, rlp);
        self
    }

    /// Adds a boot node
    pub fn add_boot_node(&mut self, node: NodeRecord) -> &mut Self {
        self.config.bootstrap_nodes.insert(node);
        self
    }

    /// Adds multiple boot nodes
    pub fn add_boot_nodes(&mut self, nodes: impl IntoIterator<Item = NodeRecord>) -> &mut Self {
        self.config.bootstrap_nodes.extend(nodes);
        self
    }

    /// Whether to discover random nodes in the network.
    pub fn enable_lookup(&mut self, enable_lookup: bool) -> &mut Self {
        self.config.enable_lookup = enable_lookup;
        self
    }

    /// Sets the lookup interval duration.
    pub fn lookup_interval(&mut self, lookup_interval: Duration) -> &mut Self {
        self.config.lookup_interval = lookup_interval;
        self
    }

    /// Returns the configured [`Discv4Config`]
    pub fn build(&self) -> Discv4Config {
        self.config.clone()
    }
}
