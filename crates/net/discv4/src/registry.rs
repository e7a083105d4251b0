//! Bookkeeping of requests that are waiting for a reply.
//!
//! Every outgoing request registers a [`ReplyMatcher`]. Inbound replies are matched against the
//! registered matchers in registration order, a matcher is removed once it either matched a final
//! reply, expired or got flushed on shutdown. All of this happens on the service task, so a matcher
//! can never be matched and expired at the same time.

use crate::{
    error::Discv4Error,
    node::{is_valid_neighbour, pk2id, NodeRecord, PeerId},
    proto::{Message, MessageId, Pong},
};
use alloy_primitives::B256;
use discv5::kbucket::MAX_NODES_PER_BUCKET;
use enr::Enr;
use secp256k1::SecretKey;
use std::net::IpAddr;
use tokio::{sync::oneshot, time::Instant};

/// The channel a requested ping resolves on.
pub type PingResponseSender = oneshot::Sender<Result<Pong, Discv4Error>>;
/// The channel a `FindNode` query resolves on.
pub type NodeResponseSender = oneshot::Sender<Result<Vec<NodeRecord>, Discv4Error>>;
/// The channel an ENR request resolves on.
pub type EnrResponseSender = oneshot::Sender<Result<Enr<SecretKey>, Discv4Error>>;

/// How often a partial reply may push back the deadline of a request.
///
/// Caps the lifetime of a request at `(1 + MAX_DEADLINE_REFRESHES) * request_timeout`.
pub const MAX_DEADLINE_REFRESHES: usize = 2;

/// How a single reply relates to a pending request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReplyMatch {
    /// The reply doesn't belong to the request.
    NoMatch,
    /// The reply belongs to the request, but more replies are expected.
    Partial,
    /// The reply completes the request.
    Final,
}

/// Why a ping was sent, this decides what happens once it's answered or times out.
#[derive(Debug)]
pub enum PingReason {
    /// Requested through the [`Discv4`](crate::Discv4) handle.
    Requested(PingResponseSender),
    /// The node pinged us first and has no endpoint proof yet.
    PingBack,
    /// The node was added to the table without prior contact.
    InitialInsert,
    /// Periodic liveness check of a table entry.
    Revalidate,
    /// A `FindNode` query that waits for the remote to know our endpoint.
    Bond {
        /// The target of the delayed query.
        target: PeerId,
        /// Resolves the query.
        tx: NodeResponseSender,
    },
}

/// The state of a pending request.
#[derive(Debug)]
pub enum PendingRequest {
    /// Waits for a `Pong` that echoes the ping's hash.
    Ping {
        /// Hash of the sent `Ping`.
        echo_hash: B256,
        /// The pinged node.
        node: NodeRecord,
        /// What to do with the outcome.
        reason: PingReason,
    },
    /// Collects the nodes of one or more `Neighbours` packets.
    FindNode {
        /// The usable nodes received so far.
        nodes: Vec<NodeRecord>,
        /// The number of nodes received so far, including dropped ones.
        received: usize,
        /// Resolves the query.
        tx: NodeResponseSender,
    },
    /// Waits for an `EnrResponse` that echoes the request's hash.
    EnrRequest {
        /// Hash of the sent `EnrRequest`.
        echo_hash: B256,
        /// The queried node.
        node: NodeRecord,
        /// Resolves the request.
        tx: EnrResponseSender,
    },
}

impl PendingRequest {
    /// The kind of packet this request is waiting for.
    fn expected_reply(&self) -> MessageId {
        match self {
            PendingRequest::Ping { .. } => MessageId::Pong,
            PendingRequest::FindNode { .. } => MessageId::Neighbours,
            PendingRequest::EnrRequest { .. } => MessageId::EnrResponse,
        }
    }

    /// Decides whether the message answers this request, accumulating partial results.
    fn on_reply(&mut self, relay_ip: IpAddr, msg: &Message) -> ReplyMatch {
        match (self, msg) {
            (PendingRequest::Ping { echo_hash, .. }, Message::Pong(pong)) => {
                if pong.echo == *echo_hash {
                    ReplyMatch::Final
                } else {
                    ReplyMatch::NoMatch
                }
            }
            (PendingRequest::FindNode { nodes, received, .. }, Message::Neighbours(msg)) => {
                *received += msg.nodes.len();
                nodes.extend(msg.nodes.iter().filter(|node| is_valid_neighbour(relay_ip, node)));
                if *received >= MAX_NODES_PER_BUCKET {
                    ReplyMatch::Final
                } else {
                    ReplyMatch::Partial
                }
            }
            (PendingRequest::EnrRequest { echo_hash, node, .. }, Message::EnrResponse(resp)) => {
                // the record must belong to the node we asked
                if resp.request_hash == *echo_hash && pk2id(&resp.enr.public_key()) == node.id {
                    ReplyMatch::Final
                } else {
                    ReplyMatch::NoMatch
                }
            }
            _ => ReplyMatch::NoMatch,
        }
    }

    /// Resolves the request with the given error.
    ///
    /// A `FindNode` query that already collected nodes resolves with those nodes on timeout.
    pub(crate) fn fail(self, err: Discv4Error) {
        match self {
            PendingRequest::Ping { reason: PingReason::Requested(tx), .. } => {
                let _ = tx.send(Err(err));
            }
            PendingRequest::Ping { reason: PingReason::Bond { tx, .. }, .. } => {
                let _ = tx.send(Err(err));
            }
            PendingRequest::Ping { .. } => {}
            PendingRequest::FindNode { nodes, tx, .. } => {
                if !nodes.is_empty() && err.is_timeout() {
                    let _ = tx.send(Ok(nodes));
                } else {
                    let _ = tx.send(Err(err));
                }
            }
            PendingRequest::EnrRequest { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

/// An outstanding expectation of a reply packet.
#[derive(Debug)]
pub struct ReplyMatcher {
    /// The node that must send the reply.
    pub from: PeerId,
    /// The IP the reply must originate from.
    pub ip: IpAddr,
    /// The UDP port the reply must originate from.
    pub port: u16,
    /// When the request times out.
    pub deadline: Instant,
    /// The request waiting for the reply.
    pub request: PendingRequest,
    /// How often a partial reply pushed back the deadline.
    refreshes: usize,
}

impl ReplyMatcher {
    /// Creates a matcher that expects the reply from the given node's UDP endpoint.
    pub fn new(node: &NodeRecord, deadline: Instant, request: PendingRequest) -> Self {
        Self {
            from: node.id,
            ip: node.address,
            port: node.udp_port,
            deadline,
            request,
            refreshes: 0,
        }
    }

    /// The kind of packet this matcher is waiting for.
    pub fn kind(&self) -> MessageId {
        self.request.expected_reply()
    }

    /// Resolves the request with the given error.
    pub(crate) fn fail(self, err: Discv4Error) {
        self.request.fail(err)
    }
}

/// The result of handing a reply to the registry.
#[derive(Debug)]
pub(crate) enum ReplyOutcome {
    /// No pending matcher accepted the reply.
    Unmatched,
    /// A matcher accepted the reply and waits for more.
    Pending,
    /// A matcher accepted the final reply and was removed.
    Completed(ReplyMatcher),
}

fn is_empty_reply(msg: &Message) -> bool {
    matches!(msg, Message::Neighbours(neighbours) if neighbours.nodes.is_empty())
}

/// All pending [`ReplyMatcher`]s, in registration order.
#[derive(Debug, Default)]
pub(crate) struct ReplyRegistry {
    matchers: Vec<ReplyMatcher>,
}

impl ReplyRegistry {
    /// Registers a new matcher.
    pub(crate) fn insert(&mut self, matcher: ReplyMatcher) {
        self.matchers.push(matcher);
    }

    /// Number of pending matchers.
    pub(crate) fn len(&self) -> usize {
        self.matchers.len()
    }

    /// Whether a reply of the given kind is expected from the node.
    pub(crate) fn is_pending(&self, kind: MessageId, from: PeerId) -> bool {
        self.matchers.iter().any(|m| m.from == from && m.kind() == kind)
    }

    /// Hands the reply to the first matcher that expects it from this sender and accepts it.
    ///
    /// A partial match that carried nodes moves the matcher's deadline to `refreshed_deadline`, at
    /// most [`MAX_DEADLINE_REFRESHES`] times. Empty replies are accepted but never extend it.
    pub(crate) fn on_reply(
        &mut self,
        from: PeerId,
        ip: IpAddr,
        port: u16,
        msg: &Message,
        refreshed_deadline: Instant,
    ) -> ReplyOutcome {
        let kind = msg.msg_type();
        for idx in 0..self.matchers.len() {
            let matcher = &mut self.matchers[idx];
            if matcher.kind() != kind ||
                matcher.from != from ||
                matcher.ip != ip ||
                matcher.port != port
            {
                continue
            }
            match matcher.request.on_reply(ip, msg) {
                ReplyMatch::NoMatch => continue,
                ReplyMatch::Partial => {
                    if !is_empty_reply(msg) && matcher.refreshes < MAX_DEADLINE_REFRESHES {
                        matcher.refreshes += 1;
                        matcher.deadline = matcher.deadline.max(refreshed_deadline);
                    }
                    return ReplyOutcome::Pending
                }
                ReplyMatch::Final => return ReplyOutcome::Completed(self.matchers.remove(idx)),
            }
        }
        ReplyOutcome::Unmatched
    }

    /// The earliest deadline of all pending matchers.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.matchers.iter().map(|m| m.deadline).min()
    }

    /// Removes and returns all matchers whose deadline is at or before `now`.
    pub(crate) fn remove_expired(&mut self, now: Instant) -> Vec<ReplyMatcher> {
        let mut expired = Vec::new();
        let mut idx = 0;
        while idx < self.matchers.len() {
            if self.matchers[idx].deadline <= now {
                expired.push(self.matchers.remove(idx));
            } else {
                idx += 1;
            }
        }
        expired
    }

    /// Removes all matchers.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = ReplyMatcher> + '_ {
        self.matchers.drain(..)
    }
}
