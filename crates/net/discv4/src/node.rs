//! Node identities, enode records and the kademlia keys derived from them.

use alloy_primitives::{hex, keccak256, B512};
use generic_array::GenericArray;
use secp256k1::{constants::UNCOMPRESSED_PUBLIC_KEY_SIZE, PublicKey, SecretKey, SECP256K1};
use std::{
    fmt,
    fmt::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::ParseIntError,
    str::FromStr,
};
use url::{Host, Url};

/// Identifier for nodes: the uncompressed secp256k1 public key without its tag byte.
pub type PeerId = B512;

/// This tag should be set to indicate to libsecp256k1 that the following bytes denote an
/// uncompressed pubkey.
const SECP256K1_TAG_PUBKEY_UNCOMPRESSED: u8 = 4;

/// Converts a [`PublicKey`] to a [`PeerId`] by stripping the uncompressed tag.
#[inline]
pub fn pk2id(pk: &PublicKey) -> PeerId {
    PeerId::from_slice(&pk.serialize_uncompressed()[1..])
}

/// Converts a [`PeerId`] back to a [`PublicKey`].
///
/// Fails if the id is not a point on the curve.
#[inline]
pub fn id2pk(id: PeerId) -> Result<PublicKey, secp256k1::Error> {
    let mut s = [0u8; UNCOMPRESSED_PUBLIC_KEY_SIZE];
    s[0] = SECP256K1_TAG_PUBKEY_UNCOMPRESSED;
    s[1..].copy_from_slice(id.as_slice());
    PublicKey::from_slice(&s)
}

/// Represents an ENR in discovery.
///
/// Note: this is only an excerpt of the [`NodeRecord`] data structure.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde_with::SerializeDisplay, serde_with::DeserializeFromStr))]
pub struct NodeRecord {
    /// The Address of a node.
    pub address: IpAddr,
    /// TCP port of the port that accepts connections.
    pub tcp_port: u16,
    /// UDP discovery port.
    pub udp_port: u16,
    /// Public key of the discovery service
    pub id: PeerId,
}

impl NodeRecord {
    /// Derive the [`NodeRecord`] from the secret key and addr
    pub fn from_secret_key(addr: SocketAddr, sk: &SecretKey) -> Self {
        let pk = PublicKey::from_secret_key(SECP256K1, sk);
        let id = pk2id(&pk);
        Self::new(addr, id)
    }

    /// Creates a new record from a socket addr and peer id, using the same port for TCP and UDP.
    pub fn new(addr: SocketAddr, id: PeerId) -> Self {
        Self { address: addr.ip(), tcp_port: addr.port(), udp_port: addr.port(), id }
    }

    /// Converts the `address` into an [`Ipv4Addr`] if the `address` is a mapped
    /// [`Ipv6Addr`](std::net::Ipv6Addr).
    pub fn into_ipv4_mapped(mut self) -> Self {
        if let IpAddr::V6(v6) = self.address {
            if let Some(v4) = v6.to_ipv4_mapped() {
                self.address = v4.into();
            }
        }
        self
    }

    /// The TCP socket address of this node
    #[must_use]
    pub const fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }

    /// The UDP socket address of this node
    #[must_use]
    pub const fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("enode://")?;
        f.write_str(&hex::encode(self.id.as_slice()))?;
        f.write_char('@')?;
        match self.address {
            IpAddr::V4(ip) => write!(f, "{ip}")?,
            // encapsulate with brackets
            IpAddr::V6(ip) => write!(f, "[{ip}]")?,
        }
        write!(f, ":{}", self.tcp_port)?;
        if self.tcp_port != self.udp_port {
            write!(f, "?discport={}", self.udp_port)?;
        }

        Ok(())
    }
}

/// Possible error types when parsing a [`NodeRecord`]
#[derive(Debug, thiserror::Error)]
pub enum NodeRecordParseError {
    /// Invalid url
    #[error("failed to parse url: {0}")]
    InvalidUrl(String),
    /// Invalid id
    #[error("failed to parse id")]
    InvalidId(String),
    /// Invalid discport
    #[error("failed to discport query: {0}")]
    Discport(ParseIntError),
}

impl FromStr for NodeRecord {
    type Err = NodeRecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| NodeRecordParseError::InvalidUrl(e.to_string()))?;

        let address = match url.host() {
            Some(Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(Host::Ipv6(ip)) => IpAddr::V6(ip),
            Some(Host::Domain(ip)) => IpAddr::V4(
                Ipv4Addr::from_str(ip)
                    .map_err(|e| NodeRecordParseError::InvalidUrl(e.to_string()))?,
            ),
            _ => return Err(NodeRecordParseError::InvalidUrl(format!("invalid host: {url:?}"))),
        };
        let port = url
            .port()
            .ok_or_else(|| NodeRecordParseError::InvalidUrl("no port specified".to_string()))?;

        let udp_port = if let Some(discovery_port) = url
            .query_pairs()
            .find_map(|(maybe_disc, port)| (maybe_disc.as_ref() == "discport").then_some(port))
        {
            discovery_port.parse::<u16>().map_err(NodeRecordParseError::Discport)?
        } else {
            port
        };

        let id = url
            .username()
            .parse::<PeerId>()
            .map_err(|e| NodeRecordParseError::InvalidId(e.to_string()))?;

        Ok(Self { address, id, tcp_port: port, udp_port })
    }
}

/// Returns true if the address is a loopback or belongs to a private network.
pub(crate) fn is_lan(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.octets()[0] == 0
        }
        IpAddr::V6(ip) => {
            let first = ip.segments()[0];
            // fc00::/7 and fe80::/10
            ip.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Whether a node received in a `Neighbours` packet from `relay` can be used.
///
/// Rejects nodes on privileged ports, without an address, with an id that is not a public key,
/// and loopback or LAN addresses relayed by a node that is not on the loopback or LAN itself.
pub(crate) fn is_valid_neighbour(relay: IpAddr, node: &NodeRecord) -> bool {
    if node.udp_port <= 1024 || node.address.is_unspecified() {
        return false
    }
    if node.address.is_loopback() && !relay.is_loopback() {
        return false
    }
    if is_lan(node.address) && !is_lan(relay) {
        return false
    }
    id2pk(node.id).is_ok()
}

/// The key type for the table.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct NodeKey(pub(crate) PeerId);

impl From<PeerId> for NodeKey {
    fn from(value: PeerId) -> Self {
        NodeKey(value)
    }
}

impl From<NodeKey> for discv5::Key<NodeKey> {
    fn from(value: NodeKey) -> Self {
        let hash = keccak256(value.0.as_slice());
        let hash = *GenericArray::from_slice(hash.as_slice());
        discv5::Key::new_raw(value, hash)
    }
}

/// Converts a `PeerId` into the required `Key` type for the table
#[inline]
pub(crate) fn kad_key(node: PeerId) -> discv5::Key<NodeKey> {
    discv5::kbucket::Key::from(NodeKey::from(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::thread_rng;

    #[test]
    fn test_pk_id_roundtrip() {
        let sk = SecretKey::new(&mut thread_rng());
        let pk = PublicKey::from_secret_key(SECP256K1, &sk);
        let id = pk2id(&pk);
        assert_eq!(id2pk(id).unwrap(), pk);
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        assert!(id2pk(PeerId::ZERO).is_err());
    }

    #[test]
    fn test_url_parse() {
        let url = "enode://6f8a80d14311c39f35f516fa664deaaaa13e85b2f7493f37f6144d86991ec012937307647bd3b9a82abe2974e1407241d54947bbb39763a4cac9f77166ad92a0@10.3.58.6:30303?discport=30301";
        let node: NodeRecord = url.parse().unwrap();
        assert_eq!(node.address, IpAddr::V4([10, 3, 58, 6].into()));
        assert_eq!(node.tcp_port, 30303);
        assert_eq!(node.udp_port, 30301);
        assert_eq!(node.to_string(), url);
    }

    #[test]
    fn test_node_display_same_ports() {
        let sk = SecretKey::new(&mut thread_rng());
        let node = NodeRecord::from_secret_key("127.0.0.1:30303".parse().unwrap(), &sk);
        let s = node.to_string();
        assert!(!s.contains("discport"));
        assert_eq!(s.parse::<NodeRecord>().unwrap(), node);
    }

    #[test]
    fn test_node_display_ipv6() {
        let sk = SecretKey::new(&mut thread_rng());
        let mut node = NodeRecord::from_secret_key("[::1]:30303".parse().unwrap(), &sk);
        node.udp_port = 30304;
        assert_eq!(node.to_string().parse::<NodeRecord>().unwrap(), node);
    }

    #[test]
    fn test_kad_key_is_keccak_of_id() {
        let sk = SecretKey::new(&mut thread_rng());
        let node = NodeRecord::from_secret_key("127.0.0.1:30303".parse().unwrap(), &sk);
        let key = kad_key(node.id);
        assert_eq!(key.preimage().0, node.id);
        assert_eq!(key.hash().as_slice(), keccak256(node.id.as_slice()).as_slice());
    }

    #[test]
    fn test_neighbour_validation() {
        let sk = SecretKey::new(&mut thread_rng());
        let public: IpAddr = [8, 8, 8, 8].into();
        let lan: IpAddr = [10, 0, 1, 99].into();
        let loopback: IpAddr = [127, 0, 0, 1].into();

        let node = NodeRecord::from_secret_key("30.0.0.1:30303".parse().unwrap(), &sk);
        assert!(is_valid_neighbour(public, &node));

        let mut low_port = node;
        low_port.udp_port = 1000;
        assert!(!is_valid_neighbour(public, &low_port));

        let mut unspecified = node;
        unspecified.address = Ipv4Addr::UNSPECIFIED.into();
        assert!(!is_valid_neighbour(public, &unspecified));

        let mut private = node;
        private.address = [10, 0, 0, 3].into();
        assert!(!is_valid_neighbour(public, &private));
        assert!(is_valid_neighbour(lan, &private));

        let mut local = node;
        local.address = loopback;
        assert!(!is_valid_neighbour(lan, &local));
        assert!(is_valid_neighbour(loopback, &local));

        let mut invalid_id = node;
        invalid_id.id = PeerId::ZERO;
        assert!(!is_valid_neighbour(public, &invalid_id));
    }
}
