//! Discovery v4 protocol implementation: message types, RLP payloads and packet framing.
//!
//! A packet on the wire is `hash || signature || packet-type || packet-data` where
//! `hash = keccak256(signature || packet-type || packet-data)` and the signature is a recoverable
//! secp256k1 signature over `keccak256(packet-type || packet-data)`.

use crate::{
    error::DecodePacketError,
    node::{pk2id, NodeRecord, PeerId},
};
use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Decodable, Encodable, Error as RlpError, Header, RlpEncodable};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use enr::Enr;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    SecretKey, SECP256K1,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The max size of a discovery packet.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Length of the packet-header: Hash + Signature + Packet Type
pub const MIN_PACKET_SIZE: usize = 32 + 65 + 1;

/// Maximum number of nodes sent in a single `Neighbours` packet so it stays within
/// [`MAX_PACKET_SIZE`].
pub const MAX_NEIGHBOURS_PER_PACKET: usize = 12;

/// Offset of the packet-type byte.
const TYPE_OFFSET: usize = 32 + 65;

/// Id for message variants.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MessageId {
    /// Ping, `0x01`
    Ping = 1,
    /// Pong, `0x02`
    Pong = 2,
    /// FindNode, `0x03`
    FindNode = 3,
    /// Neighbours, `0x04`
    Neighbours = 4,
    /// ENRRequest, `0x05`
    EnrRequest = 5,
    /// ENRResponse, `0x06`
    EnrResponse = 6,
}

impl MessageId {
    /// Converts the byte that represents the message id to the enum.
    fn from_u8(msg: u8) -> Result<Self, u8> {
        let msg = match msg {
            1 => MessageId::Ping,
            2 => MessageId::Pong,
            3 => MessageId::FindNode,
            4 => MessageId::Neighbours,
            5 => MessageId::EnrRequest,
            6 => MessageId::EnrResponse,
            _ => return Err(msg),
        };
        Ok(msg)
    }
}

/// All messages of the discv4 protocol.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    /// A liveness check that also proves the sender's endpoint.
    Ping(Ping),
    /// The answer to a [`Ping`].
    Pong(Pong),
    /// Asks for the nodes closest to a target.
    FindNode(FindNode),
    /// The answer to a [`FindNode`], possibly split across several packets.
    Neighbours(Neighbours),
    /// Asks for the sender's ENR.
    EnrRequest(EnrRequest),
    /// The answer to an [`EnrRequest`].
    EnrResponse(EnrResponse),
}

// === impl Message ===

impl Message {
    /// Returns the id for this type
    pub fn msg_type(&self) -> MessageId {
        match self {
            Message::Ping(_) => MessageId::Ping,
            Message::Pong(_) => MessageId::Pong,
            Message::FindNode(_) => MessageId::FindNode,
            Message::Neighbours(_) => MessageId::Neighbours,
            Message::EnrRequest(_) => MessageId::EnrRequest,
            Message::EnrResponse(_) => MessageId::EnrResponse,
        }
    }

    /// Returns the expiration timestamp of the message, if it carries one.
    pub fn expire(&self) -> Option<u64> {
        match self {
            Message::Ping(msg) => Some(msg.expire),
            Message::Pong(msg) => Some(msg.expire),
            Message::FindNode(msg) => Some(msg.expire),
            Message::Neighbours(msg) => Some(msg.expire),
            Message::EnrRequest(msg) => Some(msg.expire),
            Message::EnrResponse(_) => None,
        }
    }

    /// Encodes the UDP datagram, See <https://github.com/ethereum/devp2p/blob/master/discv4.md#wire-protocol>
    ///
    /// The datagram is `header || payload`
    /// where header is `hash || signature || packet-type`
    ///
    /// Returns the datagram and the packet hash.
    pub fn encode(&self, secret_key: &SecretKey) -> (Bytes, B256) {
        // allocate max packet size
        let mut datagram = BytesMut::with_capacity(MAX_PACKET_SIZE);

        // since signature has fixed len, we can split and fill the datagram buffer at fixed
        // positions, this way we can encode the message directly in the datagram buffer
        let mut sig_bytes = datagram.split_off(32);
        let mut payload =
            sig_bytes.split_off(secp256k1::constants::COMPACT_SIGNATURE_SIZE + 1);

        payload.put_u8(self.msg_type() as u8);

        match self {
            Message::Ping(message) => message.encode(&mut payload),
            Message::Pong(message) => message.encode(&mut payload),
            Message::FindNode(message) => message.encode(&mut payload),
            Message::Neighbours(message) => message.encode(&mut payload),
            Message::EnrRequest(message) => message.encode(&mut payload),
            Message::EnrResponse(message) => message.encode(&mut payload),
        }

        let signature: RecoverableSignature = SECP256K1.sign_ecdsa_recoverable(
            &secp256k1::Message::from_digest(keccak256(&payload).0),
            secret_key,
        );

        let (rec, sig) = signature.serialize_compact();
        sig_bytes.extend_from_slice(&sig);
        sig_bytes.put_u8(rec.to_i32() as u8);
        sig_bytes.unsplit(payload);

        let hash = keccak256(&sig_bytes);
        datagram.extend_from_slice(hash.as_slice());

        datagram.unsplit(sig_bytes);
        (datagram.freeze(), hash)
    }

    /// Decodes the [`Message`] from the given buffer.
    ///
    /// Returns the decoded message, the id of the signer and the packet hash.
    pub fn decode(packet: &[u8]) -> Result<Packet, DecodePacketError> {
        if packet.len() < MIN_PACKET_SIZE {
            return Err(DecodePacketError::PacketTooShort)
        }

        // parses the wire-protocol, every packet starts with a header:
        // packet-header = hash || signature || packet-type
        // hash = keccak256(signature || packet-type || packet-data)
        // signature = sign(packet-type || packet-data)

        let header_hash = keccak256(&packet[32..]);
        let data_hash = B256::from_slice(&packet[..32]);
        if data_hash != header_hash {
            return Err(DecodePacketError::HashMismatch)
        }

        let signature = &packet[32..96];
        let recovery_id = RecoveryId::from_i32(packet[96] as i32)?;
        let recoverable_sig = RecoverableSignature::from_compact(signature, recovery_id)?;

        // recover the public key
        let msg = secp256k1::Message::from_digest(keccak256(&packet[TYPE_OFFSET..]).0);
        let pk = SECP256K1.recover_ecdsa(&msg, &recoverable_sig)?;
        let node_id = pk2id(&pk);

        let msg_type = packet[TYPE_OFFSET];
        let payload = &mut &packet[TYPE_OFFSET + 1..];

        let msg = match MessageId::from_u8(msg_type).map_err(DecodePacketError::UnknownMessage)? {
            MessageId::Ping => Message::Ping(Ping::decode(payload)?),
            MessageId::Pong => Message::Pong(Pong::decode(payload)?),
            MessageId::FindNode => Message::FindNode(FindNode::decode(payload)?),
            MessageId::Neighbours => Message::Neighbours(Neighbours::decode(payload)?),
            MessageId::EnrRequest => Message::EnrRequest(EnrRequest::decode(payload)?),
            MessageId::EnrResponse => Message::EnrResponse(EnrResponse::decode(payload)?),
        };

        Ok(Packet { msg, node_id, hash: header_hash })
    }
}

/// Decoded packet
#[derive(Debug)]
pub struct Packet {
    /// The decoded message.
    pub msg: Message,
    /// Id of the signer.
    pub node_id: PeerId,
    /// The packet hash, used as reply token.
    pub hash: B256,
}

/// Consumes the list header and returns the list's payload.
///
/// Callers decode the fields they know from the returned payload and ignore whatever is left, this
/// is the forward compatibility required by EIP-8.
fn decode_list_payload<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], RlpError> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(RlpError::UnexpectedString)
    }
    if buf.len() < header.payload_length {
        return Err(RlpError::InputTooShort)
    }
    let (payload, rest) = buf.split_at(header.payload_length);
    *buf = rest;
    Ok(payload)
}

/// Decodes a trailing optional integer, an element that isn't a valid integer is skipped.
fn decode_optional_u64(payload: &mut &[u8]) -> Option<u64> {
    if payload.is_empty() {
        return None
    }
    u64::decode(payload).ok()
}

/// Represents the `from`, `to` fields in the packets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// The IP address of the node.
    pub address: IpAddr,
    /// The UDP port used for discovery.
    pub udp_port: u16,
    /// The TCP port used for the RLPx protocol.
    pub tcp_port: u16,
}

impl Endpoint {
    /// Returns the endpoint of the given record.
    pub fn from_record(record: &NodeRecord) -> Self {
        Self { address: record.address, udp_port: record.udp_port, tcp_port: record.tcp_port }
    }
}

impl From<NodeRecord> for Endpoint {
    fn from(NodeRecord { address, tcp_port, udp_port, .. }: NodeRecord) -> Self {
        Self { address, tcp_port, udp_port }
    }
}

impl Encodable for Endpoint {
    fn encode(&self, out: &mut dyn BufMut) {
        let octets = Octets::from(self.address);
        let header = Header {
            list: true,
            payload_length: octets.length() + self.udp_port.length() + self.tcp_port.length(),
        };
        header.encode(out);
        octets.encode(out);
        self.udp_port.encode(out);
        self.tcp_port.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = Octets::from(self.address).length() +
            self.udp_port.length() +
            self.tcp_port.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Endpoint {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        let octets = Octets::decode(payload)?;
        let udp_port = u16::decode(payload)?;
        let tcp_port = u16::decode(payload)?;
        Ok(Self { address: octets.into(), udp_port, tcp_port })
    }
}

/// IpAddr octets
#[derive(Debug, Clone, Copy)]
pub(crate) enum Octets {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl From<IpAddr> for Octets {
    fn from(value: IpAddr) -> Self {
        match value {
            IpAddr::V4(addr) => Octets::V4(addr.octets()),
            IpAddr::V6(addr) => Octets::V6(addr.octets()),
        }
    }
}

impl From<Octets> for IpAddr {
    fn from(value: Octets) -> Self {
        match value {
            Octets::V4(o) => IpAddr::from(o),
            Octets::V6(o) => {
                let ipv6 = Ipv6Addr::from(o);
                // If the ipv6 is ipv4 mapped, simply return the ipv4.
                if let Some(ipv4) = ipv6.to_ipv4_mapped() {
                    IpAddr::V4(ipv4)
                } else {
                    IpAddr::V6(ipv6)
                }
            }
        }
    }
}

impl Encodable for Octets {
    fn encode(&self, out: &mut dyn BufMut) {
        let octets = match self {
            Octets::V4(ref o) => &o[..],
            Octets::V6(ref o) => &o[..],
        };
        octets.encode(out)
    }

    fn length(&self) -> usize {
        match self {
            Octets::V4(_) => 1 + 4,
            Octets::V6(_) => 1 + 16,
        }
    }
}

impl Decodable for Octets {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let h = Header::decode(buf)?;
        if h.list {
            return Err(RlpError::UnexpectedList)
        }
        if buf.len() < h.payload_length {
            return Err(RlpError::InputTooShort)
        }
        let o = match h.payload_length {
            // an empty address is sent by nodes that don't know their own address
            0 => Octets::V4(Ipv4Addr::UNSPECIFIED.octets()),
            4 => {
                let mut to = [0_u8; 4];
                to.copy_from_slice(&buf[..4]);
                Octets::V4(to)
            }
            16 => {
                let mut to = [0u8; 16];
                to.copy_from_slice(&buf[..16]);
                Octets::V6(to)
            }
            _ => return Err(RlpError::UnexpectedLength),
        };
        buf.advance(h.payload_length);
        Ok(o)
    }
}

// === NodeRecord rlp: [ip, udp-port, tcp-port, node-id] ===

impl Encodable for NodeRecord {
    fn encode(&self, out: &mut dyn BufMut) {
        let octets = Octets::from(self.address);
        let payload_length = octets.length() +
            self.udp_port.length() +
            self.tcp_port.length() +
            self.id.length();
        Header { list: true, payload_length }.encode(out);
        octets.encode(out);
        self.udp_port.encode(out);
        self.tcp_port.encode(out);
        self.id.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = Octets::from(self.address).length() +
            self.udp_port.length() +
            self.tcp_port.length() +
            self.id.length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for NodeRecord {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        let octets = Octets::decode(payload)?;
        let udp_port = u16::decode(payload)?;
        let tcp_port = u16::decode(payload)?;
        let id = PeerId::decode(payload)?;
        Ok(Self { address: octets.into(), udp_port, tcp_port, id })
    }
}

/// A [Ping packet](https://github.com/ethereum/devp2p/blob/master/discv4.md#ping-packet-0x01).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Ping {
    /// The sender's endpoint.
    pub from: Endpoint,
    /// The recipient's endpoint.
    pub to: Endpoint,
    /// Unix timestamp after which the packet is dropped.
    pub expire: u64,
    /// Optional enr_seq for <https://eips.ethereum.org/EIPS/eip-868>
    pub enr_sq: Option<u64>,
}

impl Ping {
    fn payload_length(&self) -> usize {
        4u32.length() +
            self.from.length() +
            self.to.length() +
            self.expire.length() +
            self.enr_sq.map(|seq| seq.length()).unwrap_or_default()
    }
}

impl Encodable for Ping {
    fn encode(&self, out: &mut dyn BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        // version 4
        4u32.encode(out);
        self.from.encode(out);
        self.to.encode(out);
        self.expire.encode(out);
        if let Some(enr_seq) = self.enr_sq {
            enr_seq.encode(out);
        }
    }
}

impl Decodable for Ping {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        // any version is accepted
        let _version = u32::decode(payload)?;
        let from = Endpoint::decode(payload)?;
        let to = Endpoint::decode(payload)?;
        let expire = u64::decode(payload)?;
        let enr_sq = decode_optional_u64(payload);
        Ok(Self { from, to, expire, enr_sq })
    }
}

/// A [Pong packet](https://github.com/ethereum/devp2p/blob/master/discv4.md#pong-packet-0x02).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pong {
    /// The endpoint the ping was received from.
    pub to: Endpoint,
    /// Hash of the ping packet this pong answers.
    pub echo: B256,
    /// Unix timestamp after which the packet is dropped.
    pub expire: u64,
    /// Optional enr_seq for <https://eips.ethereum.org/EIPS/eip-868>
    pub enr_sq: Option<u64>,
}

impl Pong {
    fn payload_length(&self) -> usize {
        self.to.length() +
            self.echo.length() +
            self.expire.length() +
            self.enr_sq.map(|seq| seq.length()).unwrap_or_default()
    }
}

impl Encodable for Pong {
    fn encode(&self, out: &mut dyn BufMut) {
        Header { list: true, payload_length: self.payload_length() }.encode(out);
        self.to.encode(out);
        self.echo.encode(out);
        self.expire.encode(out);
        if let Some(enr_seq) = self.enr_sq {
            enr_seq.encode(out);
        }
    }
}

impl Decodable for Pong {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        let to = Endpoint::decode(payload)?;
        let echo = B256::decode(payload)?;
        let expire = u64::decode(payload)?;
        let enr_sq = decode_optional_u64(payload);
        Ok(Self { to, echo, expire, enr_sq })
    }
}

/// A [FindNode packet](https://github.com/ethereum/devp2p/blob/master/discv4.md#findnode-packet-0x03).
#[derive(Clone, Copy, Debug, Eq, PartialEq, RlpEncodable)]
pub struct FindNode {
    /// The target id.
    pub id: PeerId,
    /// Unix timestamp after which the packet is dropped.
    pub expire: u64,
}

impl Decodable for FindNode {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        let id = PeerId::decode(payload)?;
        let expire = u64::decode(payload)?;
        Ok(Self { id, expire })
    }
}

/// A [Neighbours packet](https://github.com/ethereum/devp2p/blob/master/discv4.md#neighbors-packet-0x04).
#[derive(Clone, Debug, Eq, PartialEq, RlpEncodable)]
pub struct Neighbours {
    /// Nodes ordered by distance to the requested target.
    pub nodes: Vec<NodeRecord>,
    /// Unix timestamp after which the packet is dropped.
    pub expire: u64,
}

impl Decodable for Neighbours {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        let list = &mut decode_list_payload(payload)?;
        let mut nodes = Vec::new();
        while !list.is_empty() {
            nodes.push(NodeRecord::decode(list)?);
        }
        let expire = u64::decode(payload)?;
        Ok(Self { nodes, expire })
    }
}

/// A [ENRRequest packet](https://github.com/ethereum/devp2p/blob/master/discv4.md#enrrequest-packet-0x05).
#[derive(Clone, Copy, Debug, Eq, PartialEq, RlpEncodable)]
pub struct EnrRequest {
    /// Unix timestamp after which the packet is dropped.
    pub expire: u64,
}

impl Decodable for EnrRequest {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        let expire = u64::decode(payload)?;
        Ok(Self { expire })
    }
}

/// A [ENRResponse packet](https://github.com/ethereum/devp2p/blob/master/discv4.md#enrresponse-packet-0x06).
#[derive(Clone, Debug, Eq, PartialEq, RlpEncodable)]
pub struct EnrResponse {
    /// Hash of the `EnrRequest` packet this response answers.
    pub request_hash: B256,
    /// The sender's signed record.
    pub enr: Enr<SecretKey>,
}

impl EnrResponse {
    /// Converts the advertised record into a [`NodeRecord`], if it contains an IPv4 address and
    /// a UDP port.
    pub fn to_node_record(&self) -> Option<NodeRecord> {
        let address = IpAddr::V4(self.enr.ip4()?);
        let udp_port = self.enr.udp4()?;
        let tcp_port = self.enr.tcp4().unwrap_or(udp_port);
        let id = pk2id(&self.enr.public_key());
        Some(NodeRecord { address, tcp_port, udp_port, id })
    }
}

impl Decodable for EnrResponse {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let payload = &mut decode_list_payload(buf)?;
        let request_hash = B256::decode(payload)?;
        let enr = Enr::<SecretKey>::decode(payload)?;
        Ok(Self { request_hash, enr })
    }
}
