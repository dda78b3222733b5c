//! Request correlation across the HTTP → RPC hop.
//!
//! The gateway files a snapshot of every inbound HTTP request under a fresh
//! [`RequestKey`] and sends the key along as call metadata. A handler on the
//! far side of the pipe resolves the key back to the original request.
//!
//! # Invariants
//! - A key is present iff its HTTP request is still being handled
//! - No two in-flight requests share a key
//! - Entries are removed on every exit path ([`CorrelationGuard`])

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use axum::http::{HeaderMap, Method, Request, Uri, Version};
use uuid::Uuid;

use crate::context::Context;
use crate::observability::metrics;
use crate::rpc::metadata;

/// Metadata key carrying the correlation key.
pub const CORRELATION_HEADER: &str = "x-rpc-pipe-gateway-request-id";

/// Identifies one in-flight HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey(Uuid);

impl RequestKey {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Snapshot of an inbound HTTP request head, taken before the gateway
/// rewrites its headers.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub received_at: Instant,
}

impl InboundRequest {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
            received_at: Instant::now(),
        }
    }
}

/// In-flight requests by key.
#[derive(Debug, Default)]
pub struct CorrelationStore {
    entries: RwLock<HashMap<RequestKey, Arc<InboundRequest>>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// File `request` under a fresh key.
    pub fn begin(&self, request: InboundRequest) -> RequestKey {
        let request = Arc::new(request);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut key = RequestKey::random();
        while entries.contains_key(&key) {
            key = RequestKey::random();
        }
        entries.insert(key, request);
        metrics::record_inflight_started();
        tracing::trace!(request_key = %key, "Correlation entry added");
        key
    }

    pub fn lookup(&self, key: &RequestKey) -> Option<Arc<InboundRequest>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Remove the entry for `key`. Removing an absent key is a no-op.
    pub fn end(&self, key: &RequestKey) {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if removed.is_some() {
            metrics::record_inflight_finished();
            tracing::trace!(request_key = %key, "Correlation entry removed");
        }
    }

    /// [`begin`](Self::begin) with a guard that ends the entry on drop.
    pub fn track(self: &Arc<Self>, request: InboundRequest) -> CorrelationGuard {
        let key = self.begin(request);
        CorrelationGuard {
            store: Arc::clone(self),
            key,
        }
    }

    /// The original request of the call `ctx` belongs to.
    ///
    /// `None` when the context carries no key, the key does not parse, or the
    /// request is no longer in flight.
    pub fn resolve(&self, ctx: &Context) -> Option<Arc<InboundRequest>> {
        let key = metadata::incoming(ctx)?
            .get(CORRELATION_HEADER)?
            .to_str()
            .ok()?
            .parse()
            .ok()?;
        self.lookup(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ends its correlation entry when dropped.
#[derive(Debug)]
#[must_use = "the correlation entry ends when the guard is dropped"]
pub struct CorrelationGuard {
    store: Arc<CorrelationStore>,
    key: RequestKey,
}

impl CorrelationGuard {
    pub fn key(&self) -> RequestKey {
        self.key
    }
}

impl Drop for CorrelationGuard {
    fn drop(&mut self) {
        self.store.end(&self.key);
    }
}

/// Lets handlers find the HTTP request that triggered their call.
///
/// The gateway server places one in every call context it serves.
#[derive(Debug, Clone)]
pub struct RequestResolver {
    store: Arc<CorrelationStore>,
}

impl RequestResolver {
    pub fn new(store: Arc<CorrelationStore>) -> Self {
        Self { store }
    }

    pub fn request(&self, ctx: &Context) -> Option<Arc<InboundRequest>> {
        self.store.resolve(ctx)
    }
}

/// Resolve the original request through the resolver in `ctx`, if any.
pub fn original_request(ctx: &Context) -> Option<Arc<InboundRequest>> {
    ctx.value::<RequestResolver>()?.request(ctx)
}
