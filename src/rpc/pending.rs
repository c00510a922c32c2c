//! Outstanding requests and the future handed back to callers

use crate::error::RpcError;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;

pub(crate) type Reply = oneshot::Sender<Result<Value, RpcError>>;

/// One request awaiting its response
pub(crate) struct PendingRequest {
    pub method: String,
    pub sent_at: Instant,
    pub reply: Reply,
}

/// Pending requests keyed by correlation id
#[derive(Default)]
pub(crate) struct PendingRequests {
    requests: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn insert(&mut self, id: String, request: PendingRequest) {
        self.requests.insert(id, request);
    }

    pub fn take(&mut self, id: &str) -> Option<PendingRequest> {
        self.requests.remove(id)
    }

    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.requests.drain().map(|(_, request)| request).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.requests.contains_key(id)
    }
}

/// Correlation ids of incoming requests already handled
///
/// Only the most recent `capacity` ids are kept; the oldest is forgotten
/// first.
pub(crate) struct SeenRequests {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenRequests {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; false if it is already in the window
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.order.clear();
    }
}

impl Default for SeenRequests {
    fn default() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }
}

enum ResponseState {
    Ready(Option<RpcError>),
    Waiting {
        id: String,
        method: String,
        rx: oneshot::Receiver<Result<Value, RpcError>>,
        pending: Weak<Mutex<PendingRequests>>,
    },
    Done,
}

/// Response to one [`send`](super::RpcService::send)
///
/// Dropping the future before it completes forgets the request, so a
/// late response for it is ignored.
pub struct ResponseFuture {
    state: ResponseState,
}

impl ResponseFuture {
    pub(crate) fn ready(error: RpcError) -> Self {
        Self {
            state: ResponseState::Ready(Some(error)),
        }
    }

    pub(crate) fn waiting(
        id: String,
        method: String,
        rx: oneshot::Receiver<Result<Value, RpcError>>,
        pending: Weak<Mutex<PendingRequests>>,
    ) -> Self {
        Self {
            state: ResponseState::Waiting {
                id,
                method,
                rx,
                pending,
            },
        }
    }

    /// Correlation id of the request, if it was sent
    pub fn correlation_id(&self) -> Option<&str> {
        match &self.state {
            ResponseState::Waiting { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let output = match &mut this.state {
            ResponseState::Ready(error) => match error.take() {
                Some(error) => Err(error),
                None => return Poll::Pending,
            },
            ResponseState::Waiting { rx, method, .. } => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => result,
                Poll::Ready(Err(_)) => Err(RpcError::Cancelled {
                    method: method.clone(),
                }),
                Poll::Pending => return Poll::Pending,
            },
            ResponseState::Done => return Poll::Pending,
        };

        this.state = ResponseState::Done;
        Poll::Ready(output)
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if let ResponseState::Waiting { id, pending, .. } = &self.state {
            if let Some(pending) = pending.upgrade() {
                pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take(id);
            }
        }
    }
}
