//! Correlation of distributed requests with their peer responses.
//!
//! Every in-flight request lives in a table keyed by [`RequestId`] together
//! with a kind-specific [`Accumulator`]. Peer responses are merged as they
//! arrive. A request is finalized exactly once: either when the expected
//! number of peers has answered (fast path) or when its deadline fires. The
//! table removal is the single point of truth, so whichever trigger removes
//! the entry first resolves the caller and the other becomes a no-op.
//! Responses for ids no longer in the table are dropped.

use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use roomcast_core::{NodeId, RequestId, Response, Room, SocketDetails, SocketId};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::errors::{AdapterError, Result};

// =============================================================================
// Request kinds and accumulators
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Sockets,
    AllRooms,
    FetchSockets,
    ServerSideEmit,
    BroadcastAck,
    RemoteOp,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sockets => "sockets",
            Self::AllRooms => "all_rooms",
            Self::FetchSockets => "fetch_sockets",
            Self::ServerSideEmit => "server_side_emit",
            Self::BroadcastAck => "broadcast_ack",
            Self::RemoteOp => "remote_op",
        }
    }
}

/// One node's answer to a server-side emit with ack.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerReply {
    pub node_id: NodeId,
    pub result: std::result::Result<Value, String>,
}

/// Partial result of a distributed request.
#[derive(Clone, Debug, PartialEq)]
pub enum Accumulator {
    Sockets(HashSet<SocketId>),
    Rooms(HashSet<Room>),
    FetchSockets {
        seen: HashSet<SocketId>,
        sockets: Vec<SocketDetails>,
    },
    Replies(Vec<PeerReply>),
    Acks {
        expected_clients: usize,
        acks: Vec<Value>,
    },
    RemoteOp {
        applied: bool,
    },
}

/// How a merged response affects the request's progress.
#[derive(Debug, PartialEq, Eq)]
enum Merge {
    /// Counts as one peer having answered.
    Counted,
    /// Accepted data that does not count as a peer answer (individual acks).
    Uncounted,
    Rejected,
}

impl Accumulator {
    pub fn fetch_sockets(local: Vec<SocketDetails>) -> Self {
        let mut seen = HashSet::new();
        let mut sockets = Vec::new();
        push_unique(&mut seen, &mut sockets, local);
        Self::FetchSockets { seen, sockets }
    }

    pub fn acks(local_clients: usize) -> Self {
        Self::Acks {
            expected_clients: local_clients,
            acks: Vec::new(),
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Self::Sockets(_) => RequestKind::Sockets,
            Self::Rooms(_) => RequestKind::AllRooms,
            Self::FetchSockets { .. } => RequestKind::FetchSockets,
            Self::Replies(_) => RequestKind::ServerSideEmit,
            Self::Acks { .. } => RequestKind::BroadcastAck,
            Self::RemoteOp { .. } => RequestKind::RemoteOp,
        }
    }

    fn merge(&mut self, from: &NodeId, response: Response) -> Merge {
        match (self, response) {
            (Self::Sockets(acc), Response::Sockets { sockets }) => {
                acc.extend(sockets);
                Merge::Counted
            }
            (Self::Rooms(acc), Response::AllRooms { rooms }) => {
                acc.extend(rooms);
                Merge::Counted
            }
            (
                Self::FetchSockets { seen, sockets },
                Response::FetchSockets { sockets: incoming },
            ) => {
                push_unique(seen, sockets, incoming);
                Merge::Counted
            }
            (Self::Replies(acc), Response::ServerSideEmit { reply, error }) => {
                let result = match error {
                    Some(error) => Err(error),
                    None => Ok(reply.unwrap_or(Value::Null)),
                };
                acc.push(PeerReply {
                    node_id: from.clone(),
                    result,
                });
                Merge::Counted
            }
            (
                Self::Acks {
                    expected_clients, ..
                },
                Response::BroadcastClientCount { client_count },
            ) => {
                *expected_clients += client_count;
                Merge::Counted
            }
            (Self::Acks { acks, .. }, Response::BroadcastAck { ack }) => {
                acks.push(ack);
                Merge::Uncounted
            }
            (Self::RemoteOp { applied }, Response::RemoteOp { applied: remote }) => {
                *applied |= remote;
                Merge::Counted
            }
            _ => Merge::Rejected,
        }
    }

    fn is_complete(&self, expected: Option<usize>, received: usize) -> bool {
        let all_answered = expected.is_some_and(|n| received >= n);
        match self {
            // Only the owning node can apply it; no need to hear from the rest.
            Self::RemoteOp { applied: true } => true,
            Self::Acks {
                expected_clients,
                acks,
            } => all_answered && acks.len() >= *expected_clients,
            _ => all_answered,
        }
    }
}

// First occurrence of a socket id wins.
fn push_unique(
    seen: &mut HashSet<SocketId>,
    sockets: &mut Vec<SocketDetails>,
    incoming: Vec<SocketDetails>,
) {
    for details in incoming {
        if seen.insert(details.id.clone()) {
            sockets.push(details);
        }
    }
}

/// Conversion of a finalized accumulator into the caller's result type.
pub trait FromAccumulator: Sized {
    fn from_accumulator(acc: Accumulator) -> Self;
}

impl FromAccumulator for HashSet<SocketId> {
    fn from_accumulator(acc: Accumulator) -> Self {
        match acc {
            Accumulator::Sockets(sockets) => sockets,
            _ => Self::new(),
        }
    }
}

impl FromAccumulator for HashSet<Room> {
    fn from_accumulator(acc: Accumulator) -> Self {
        match acc {
            Accumulator::Rooms(rooms) => rooms,
            _ => Self::new(),
        }
    }
}

impl FromAccumulator for Vec<SocketDetails> {
    fn from_accumulator(acc: Accumulator) -> Self {
        match acc {
            Accumulator::FetchSockets { sockets, .. } => sockets,
            _ => Self::new(),
        }
    }
}

impl FromAccumulator for Vec<PeerReply> {
    fn from_accumulator(acc: Accumulator) -> Self {
        match acc {
            Accumulator::Replies(replies) => replies,
            _ => Self::new(),
        }
    }
}

impl FromAccumulator for Vec<Value> {
    fn from_accumulator(acc: Accumulator) -> Self {
        match acc {
            Accumulator::Acks { acks, .. } => acks,
            _ => Self::new(),
        }
    }
}

impl FromAccumulator for () {
    fn from_accumulator(_: Accumulator) -> Self {}
}

// =============================================================================
// PendingResponse
// =============================================================================

/// Resolves with the finalized result of a distributed request.
///
/// Never fails because peers are missing; it only errors if the adapter
/// shuts down in a way that drops the request.
#[must_use = "a pending response does nothing unless awaited"]
pub struct PendingResponse<T> {
    rx: oneshot::Receiver<Accumulator>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PendingResponse<T> {
    /// A handle that is already resolved, for requests answered locally.
    pub fn ready(acc: Accumulator) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(acc);
        Self {
            rx,
            _marker: PhantomData,
        }
    }
}

impl<T: FromAccumulator> Future for PendingResponse<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(acc)) => Poll::Ready(Ok(T::from_accumulator(acc))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(AdapterError::Shutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// RequestCoordinator
// =============================================================================

struct PendingRequest {
    expected: Option<usize>,
    received: usize,
    responders: HashSet<NodeId>,
    acc: Accumulator,
    done: oneshot::Sender<Accumulator>,
    timer: Option<AbortHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FinalizeReason {
    Quorum,
    Timeout,
    Shutdown,
}

struct CoordinatorInner {
    timeout: Duration,
    pending: DashMap<RequestId, PendingRequest>,
}

impl CoordinatorInner {
    fn finalize(&self, request_id: &RequestId, reason: FinalizeReason) -> bool {
        let Some((_, entry)) = self.pending.remove(request_id) else {
            return false;
        };
        if reason != FinalizeReason::Timeout {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
        }
        debug!(
            request_id = %request_id,
            kind = entry.acc.kind().as_str(),
            received = entry.received,
            expected = ?entry.expected,
            reason = ?reason,
            "request finalized"
        );
        let _ = entry.done.send(entry.acc);
        true
    }
}

/// Tracks in-flight distributed requests. Cloning shares the same table.
#[derive(Clone)]
pub struct RequestCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RequestCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                timeout,
                pending: DashMap::new(),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Number of requests still waiting for responses.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.inner.pending.contains_key(request_id)
    }

    /// Start tracking a request and schedule its deadline.
    ///
    /// `acc` is pre-seeded with this node's own contribution; `expected` is
    /// the number of peer responses that completes the request early.
    pub fn register<T: FromAccumulator>(
        &self,
        request_id: RequestId,
        acc: Accumulator,
        expected: Option<usize>,
    ) -> PendingResponse<T> {
        let (done, rx) = oneshot::channel();
        let kind = acc.kind();
        let complete = acc.is_complete(expected, 0);
        let _ = self.inner.pending.insert(
            request_id.clone(),
            PendingRequest {
                expected,
                received: 0,
                responders: HashSet::new(),
                acc,
                done,
                timer: None,
            },
        );
        trace!(
            request_id = %request_id,
            kind = kind.as_str(),
            expected = ?expected,
            "request registered"
        );

        if complete {
            let _ = self.inner.finalize(&request_id, FinalizeReason::Quorum);
        } else {
            let inner = Arc::clone(&self.inner);
            let timer_id = request_id.clone();
            let deadline = tokio::time::Instant::now() + inner.timeout;
            let timer = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                if inner.finalize(&timer_id, FinalizeReason::Timeout) {
                    debug!(
                        request_id = %timer_id,
                        "request timed out, resolving with partial results"
                    );
                }
            });
            if let Some(mut entry) = self.inner.pending.get_mut(&request_id) {
                entry.timer = Some(timer.abort_handle());
            }
        }

        PendingResponse {
            rx,
            _marker: PhantomData,
        }
    }

    /// Merge a peer response. Returns `false` if it was dropped (unknown or
    /// finalized request, duplicate responder, or mismatched kind).
    pub fn on_response(&self, from: &NodeId, request_id: &RequestId, response: Response) -> bool {
        let complete = {
            let Some(mut entry) = self.inner.pending.get_mut(request_id) else {
                trace!(request_id = %request_id, "response for unknown request, dropping");
                return false;
            };
            let counted = !matches!(response, Response::BroadcastAck { .. });
            if counted && entry.responders.contains(from) {
                debug!(request_id = %request_id, node_id = %from, "duplicate response, dropping");
                return false;
            }
            let response_type = response.type_name();
            match entry.acc.merge(from, response) {
                Merge::Counted => {
                    let _ = entry.responders.insert(from.clone());
                    entry.received += 1;
                }
                Merge::Uncounted => {}
                Merge::Rejected => {
                    warn!(
                        request_id = %request_id,
                        kind = entry.acc.kind().as_str(),
                        response_type,
                        "response does not match request kind, dropping"
                    );
                    return false;
                }
            }
            entry.acc.is_complete(entry.expected, entry.received)
        };

        if complete {
            let _ = self.inner.finalize(request_id, FinalizeReason::Quorum);
        }
        true
    }

    /// Add an ack collected from one of this node's own clients.
    pub fn on_local_ack(&self, request_id: &RequestId, ack: Value) -> bool {
        let complete = {
            let Some(mut entry) = self.inner.pending.get_mut(request_id) else {
                return false;
            };
            match &mut entry.acc {
                Accumulator::Acks { acks, .. } => acks.push(ack),
                _ => return false,
            }
            entry.acc.is_complete(entry.expected, entry.received)
        };
        if complete {
            let _ = self.inner.finalize(request_id, FinalizeReason::Quorum);
        }
        true
    }

    /// Resolve a request now with whatever it has accumulated. No-op if it
    /// was already finalized.
    pub fn finalize(&self, request_id: &RequestId) -> bool {
        self.inner.finalize(request_id, FinalizeReason::Quorum)
    }

    /// Resolve every pending request with its partial result and cancel all
    /// timers.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<RequestId> = self.inner.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter()
            .filter(|id| self.inner.finalize(id, FinalizeReason::Shutdown))
            .count()
    }
}
