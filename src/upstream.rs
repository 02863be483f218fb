//! The broker-side half of a proxied connection.
//!
//! Mirrors the downstream handler for writes, and owns the correlation map:
//! every response read from the broker is routed through [`Backend::route_response`]
//! before any filter sees it, so internal responses (filter-originated
//! requests) can be diverted to their recipient's promise.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::codec::RawResponse;
use crate::correlation::{CorrelationMap, ResponseTarget};
use crate::downstream::EnqueueOutcome;
use crate::error::{ProxyError, Result};
use crate::frame::{decode_response_payload, OpaqueResponseFrame, RequestFrame, ResponseFrame};

/// Where a broker response went.
#[derive(Debug)]
pub(crate) enum RouteOutcome {
    /// External response: continue through the response filter chain.
    ToClient(ResponseFrame),
    /// Internal response: its promise was completed; nothing reaches the
    /// client.
    Internal { recipient: usize },
}

pub(crate) struct Backend {
    tx: mpsc::Sender<RequestFrame>,
    staged: VecDeque<RequestFrame>,
    pub(crate) correlation: CorrelationMap,
}

impl Backend {
    pub(crate) fn new(tx: mpsc::Sender<RequestFrame>) -> Self {
        Self {
            tx,
            staged: VecDeque::new(),
            correlation: CorrelationMap::new(),
        }
    }

    /// Offer a request frame to the broker write queue.
    pub(crate) fn enqueue(&mut self, frame: RequestFrame) -> EnqueueOutcome {
        if !self.staged.is_empty() {
            self.staged.push_back(frame);
            return EnqueueOutcome::StillBlocked;
        }
        match self.tx.try_send(frame) {
            Ok(()) => EnqueueOutcome::Written,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                self.staged.push_back(frame);
                EnqueueOutcome::NowBlocked
            }
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    pub(crate) fn is_blocked(&self) -> bool {
        !self.staged.is_empty()
    }

    /// Wait for queue capacity and drain staged frames. Resolves `true`
    /// once the backlog is empty (the writable edge).
    pub(crate) async fn unblock(&mut self) -> Result<bool> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|e| ProxyError::Server(Box::new(e)))?;
        if let Some(frame) = self.staged.pop_front() {
            permit.send(frame);
        }
        while let Some(frame) = self.staged.pop_front() {
            match self.tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    self.staged.push_front(frame);
                    return Ok(false);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(ProxyError::Server("server writer gone".into()));
                }
            }
        }
        Ok(true)
    }

    /// Look up a raw response in the correlation map and route it.
    pub(crate) fn route_response(&mut self, response: RawResponse) -> Result<RouteOutcome> {
        let Some(entry) = self.correlation.take(response.correlation_id) else {
            return Err(ProxyError::UnknownCorrelation(response.correlation_id));
        };
        match entry.target {
            ResponseTarget::External => Ok(RouteOutcome::ToClient(ResponseFrame::Opaque(
                OpaqueResponseFrame {
                    api_key: entry.api_key,
                    api_version: entry.api_version,
                    correlation_id: response.correlation_id,
                    raw: response.raw,
                },
            ))),
            ResponseTarget::Internal { recipient, promise } => {
                let (_header, body) =
                    decode_response_payload(entry.api_key, entry.api_version, response.raw)?;
                // The recipient may already have dropped its future.
                let _ = promise.send(body);
                Ok(RouteOutcome::Internal { recipient })
            }
        }
    }

    /// Flush the staged backlog, fail outstanding internal promises, and
    /// release the write queue so the writer task can shut the socket.
    pub(crate) async fn close(mut self) {
        self.correlation.fail_all();
        while let Some(frame) = self.staged.pop_front() {
            if self.tx.send(frame).await.is_err() {
                return;
            }
        }
    }
}
