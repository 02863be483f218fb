//! Tracking of in-flight requests on the upstream connection.
//!
//! Every request forwarded to the broker gets an entry keyed by its
//! correlation id, so the response can be routed: external entries flow back
//! through the response filter chain to the client, internal entries
//! (filter-originated requests) complete a promise held by the filter that
//! issued them and never reach the client.

use std::collections::HashMap;

use kafka_protocol::messages::ResponseKind;
use tokio::sync::oneshot;

use crate::error::{ProxyError, Result};

/// Where a response should be delivered.
#[derive(Debug)]
pub enum ResponseTarget {
    /// Client-originated: forward through the response filters to the client.
    External,
    /// Filter-originated: complete the issuing filter's promise.
    Internal {
        recipient: usize,
        promise: oneshot::Sender<ResponseKind>,
    },
}

#[derive(Debug)]
pub struct Correlation {
    pub api_key: i16,
    pub api_version: i16,
    pub target: ResponseTarget,
}

/// In-flight request map for one upstream channel. Exclusively owned and
/// mutated by the connection coordinator; at most one live entry per id.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    inflight: HashMap<i32, Correlation>,
    // Internal ids grow upward from i32::MIN; clients count up from zero,
    // so the spaces collide only after two billion filter-originated
    // requests on one connection.
    next_internal_id: i32,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self {
            inflight: HashMap::new(),
            next_internal_id: i32::MIN,
        }
    }

    /// Record a client-originated request about to be forwarded upstream.
    pub fn insert_external(&mut self, correlation_id: i32, api_key: i16, api_version: i16) -> Result<()> {
        self.insert(
            correlation_id,
            Correlation {
                api_key,
                api_version,
                target: ResponseTarget::External,
            },
        )
    }

    /// Allocate an id for a filter-originated request and register its
    /// promise. Returns the id and the receiving half of the promise.
    pub fn insert_internal(
        &mut self,
        recipient: usize,
        api_key: i16,
        api_version: i16,
    ) -> (i32, oneshot::Receiver<ResponseKind>) {
        let (tx, rx) = oneshot::channel();
        let mut id = self.next_internal_id;
        while self.inflight.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_internal_id = id.wrapping_add(1);
        self.inflight.insert(
            id,
            Correlation {
                api_key,
                api_version,
                target: ResponseTarget::Internal {
                    recipient,
                    promise: tx,
                },
            },
        );
        (id, rx)
    }

    fn insert(&mut self, correlation_id: i32, entry: Correlation) -> Result<()> {
        if self.inflight.insert(correlation_id, entry).is_some() {
            return Err(ProxyError::ProtocolViolation(format!(
                "correlation id {correlation_id} already in flight"
            )));
        }
        Ok(())
    }

    /// Remove and return the entry for a response that just arrived.
    pub fn take(&mut self, correlation_id: i32) -> Option<Correlation> {
        self.inflight.remove(&correlation_id)
    }

    /// Drop every entry. Internal promises resolve with a closed-channel
    /// error on the receiving side.
    pub fn fail_all(&mut self) {
        self.inflight.clear();
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}
