//! The client-side half of a proxied connection.
//!
//! Owns the write queue towards the client, the pre-forwarding frame buffer,
//! and the local `ApiVersions` answer used in the SASL-offload handshake.
//! Reads are driven by the connection driver; this type only tracks what
//! must be written back and what is parked until an upstream exists.

use std::collections::VecDeque;

use kafka_protocol::messages::api_versions_response::ApiVersion;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsResponse, FindCoordinatorResponse, InitProducerIdResponse, ResponseHeader,
    ResponseKind, SaslAuthenticateResponse, SaslHandshakeResponse,
};
use kafka_protocol::error::ResponseError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::frame::{DecodedRequestFrame, DecodedResponseFrame, RequestFrame, ResponseFrame};

/// API versions this proxy itself implements, advertised when answering
/// `ApiVersions` locally. Kept to the APIs a client needs before
/// authentication completes plus the common data-plane ones.
const SUPPORTED_APIS: &[(ApiKey, i16, i16)] = &[
    (ApiKey::ProduceKey, 0, 9),
    (ApiKey::FetchKey, 0, 13),
    (ApiKey::ListOffsetsKey, 0, 7),
    (ApiKey::MetadataKey, 0, 12),
    (ApiKey::OffsetCommitKey, 0, 8),
    (ApiKey::OffsetFetchKey, 0, 8),
    (ApiKey::FindCoordinatorKey, 0, 4),
    (ApiKey::JoinGroupKey, 0, 9),
    (ApiKey::HeartbeatKey, 0, 4),
    (ApiKey::LeaveGroupKey, 0, 5),
    (ApiKey::SyncGroupKey, 0, 5),
    (ApiKey::DescribeGroupsKey, 0, 5),
    (ApiKey::ListGroupsKey, 0, 4),
    (ApiKey::SaslHandshakeKey, 0, 1),
    (ApiKey::ApiVersionsKey, 0, 3),
    (ApiKey::CreateTopicsKey, 0, 7),
    (ApiKey::DeleteTopicsKey, 0, 6),
    (ApiKey::InitProducerIdKey, 0, 4),
    (ApiKey::SaslAuthenticateKey, 0, 2),
];

const API_VERSIONS_MAX: i16 = 3;

/// Result of offering a frame to the write queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum EnqueueOutcome {
    /// Accepted; the channel stayed writable.
    Written,
    /// The queue is full: this is an unwritable edge, the frame is staged.
    NowBlocked,
    /// Already blocked; the frame joined the staged backlog.
    StillBlocked,
    /// The writer is gone (socket error); the connection must close.
    Closed,
}

pub(crate) struct Frontend {
    tx: mpsc::Sender<ResponseFrame>,
    staged: VecDeque<ResponseFrame>,
    buffer: VecDeque<RequestFrame>,
    buffered_bytes: usize,
    max_buffered_bytes: usize,
    /// Prelude of the most recent client request, for error synthesis.
    last_request: Option<(i16, i16, i32)>,
    /// Correlation id of a buffered request that was answered locally and
    /// must not be replayed upstream.
    locally_answered: Option<i32>,
}

impl Frontend {
    pub(crate) fn new(tx: mpsc::Sender<ResponseFrame>, max_buffered_bytes: usize) -> Self {
        Self {
            tx,
            staged: VecDeque::new(),
            buffer: VecDeque::new(),
            buffered_bytes: 0,
            max_buffered_bytes,
            last_request: None,
            locally_answered: None,
        }
    }

    pub(crate) fn note_request(&mut self, frame: &RequestFrame) {
        self.last_request = Some((
            frame.api_key(),
            frame.api_version(),
            frame.correlation_id(),
        ));
    }

    /// Park a frame until the connection reaches `Forwarding`. The buffer is
    /// byte-bounded; overrunning it is fatal.
    pub(crate) fn buffer_msg(&mut self, frame: RequestFrame) -> Result<()> {
        self.buffered_bytes += frame.buffered_size();
        if self.buffered_bytes > self.max_buffered_bytes {
            return Err(ProxyError::BufferOverflow {
                buffered: self.buffered_bytes,
                limit: self.max_buffered_bytes,
            });
        }
        self.buffer.push_back(frame);
        Ok(())
    }

    /// Hand back everything buffered, in arrival order, dropping any frame
    /// that was already answered locally.
    pub(crate) fn drain_buffer(&mut self) -> Vec<RequestFrame> {
        self.buffered_bytes = 0;
        let answered = self.locally_answered.take();
        self.buffer
            .drain(..)
            .filter(|f| Some(f.correlation_id()) != answered)
            .collect()
    }

    /// Synthesize the local `ApiVersions` response for the SASL-offload
    /// handshake: the client must learn which versions the proxy itself
    /// implements before the upstream is known.
    pub(crate) fn respond_api_versions(
        &mut self,
        request: &DecodedRequestFrame,
    ) -> EnqueueOutcome {
        let (api_version, error_code) = if (0..=API_VERSIONS_MAX).contains(&request.api_version) {
            (request.api_version, 0)
        } else {
            // Per protocol, an unsupported ApiVersions version gets a v0
            // response flagged UNSUPPORTED_VERSION, still listing our APIs.
            (0, ResponseError::UnsupportedVersion.code())
        };
        let body = ApiVersionsResponse::default()
            .with_error_code(error_code)
            .with_api_keys(supported_api_versions())
            .with_throttle_time_ms(0);
        self.locally_answered = Some(request.correlation_id);
        let frame = ResponseFrame::Decoded(DecodedResponseFrame {
            api_key: ApiKey::ApiVersionsKey as i16,
            api_version,
            correlation_id: request.correlation_id,
            header: ResponseHeader::default().with_correlation_id(request.correlation_id),
            body: ResponseKind::ApiVersions(body),
        });
        self.enqueue(frame)
    }

    /// Offer a response frame to the client write queue.
    pub(crate) fn enqueue(&mut self, frame: ResponseFrame) -> EnqueueOutcome {
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

    /// Wait for queue capacity and move staged frames over. Resolves `true`
    /// once the backlog is fully drained (the writable edge).
    pub(crate) async fn unblock(&mut self) -> Result<bool> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|e| ProxyError::Client(Box::new(e)))?;
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
                    return Err(ProxyError::Client("client writer gone".into()));
                }
            }
        }
        Ok(true)
    }

    /// Flush the backlog and, when the error permits one, a synthesized
    /// Kafka error response for the most recent request, then release the
    /// write queue so the writer task can flush and shut the socket.
    pub(crate) async fn close(mut self, cause: Option<&ProxyError>) {
        while let Some(frame) = self.staged.pop_front() {
            if self.tx.send(frame).await.is_err() {
                return;
            }
        }
        let Some(cause) = cause else {
            return;
        };
        let Some(code) = cause.kafka_error() else {
            return;
        };
        // A response can only be correlated if at least one request header
        // was successfully read.
        let Some((api_key, api_version, correlation_id)) = self.last_request else {
            debug!("closing without a client response: no request header seen yet");
            return;
        };
        match error_response(api_key, api_version, correlation_id, code) {
            Some(frame) => {
                if self.tx.send(frame).await.is_err() {
                    warn!("client writer gone before error response could be sent");
                }
            }
            None => {
                debug!(api_key, "no error response shape for this api; closing bare");
            }
        }
    }
}

pub(crate) fn supported_api_versions() -> Vec<ApiVersion> {
    SUPPORTED_APIS
        .iter()
        .map(|&(api_key, min, max)| {
            ApiVersion::default()
                .with_api_key(api_key as i16)
                .with_min_version(min)
                .with_max_version(max)
        })
        .collect()
}

/// Build a typed error response for the api kinds that carry a top-level
/// error code. Other apis get a bare TCP close instead.
fn error_response(
    api_key: i16,
    api_version: i16,
    correlation_id: i32,
    code: ResponseError,
) -> Option<ResponseFrame> {
    let key = ApiKey::try_from(api_key).ok()?;
    let body = match key {
        ApiKey::ApiVersionsKey => ResponseKind::ApiVersions(
            ApiVersionsResponse::default().with_error_code(code.code()),
        ),
        ApiKey::SaslHandshakeKey => ResponseKind::SaslHandshake(
            SaslHandshakeResponse::default().with_error_code(code.code()),
        ),
        ApiKey::SaslAuthenticateKey => ResponseKind::SaslAuthenticate(
            SaslAuthenticateResponse::default().with_error_code(code.code()),
        ),
        ApiKey::FindCoordinatorKey => ResponseKind::FindCoordinator(
            FindCoordinatorResponse::default().with_error_code(code.code()),
        ),
        ApiKey::InitProducerIdKey => ResponseKind::InitProducerId(
            InitProducerIdResponse::default().with_error_code(code.code()),
        ),
        _ => return None,
    };
    Some(ResponseFrame::Decoded(DecodedResponseFrame {
        api_key,
        api_version,
        correlation_id,
        header: ResponseHeader::default().with_correlation_id(correlation_id),
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::frame::OpaqueRequestFrame;
    use kafka_protocol::messages::{ApiVersionsRequest, RequestHeader};
    use kafka_protocol::messages::RequestKind;

    fn opaque_frame(correlation_id: i32, len: usize) -> RequestFrame {
        RequestFrame::Opaque(OpaqueRequestFrame {
            api_key: ApiKey::MetadataKey as i16,
            api_version: 12,
            correlation_id,
            raw: Bytes::from(vec![0u8; len.max(8)]),
        })
    }

    fn api_versions_frame(correlation_id: i32, api_version: i16) -> DecodedRequestFrame {
        DecodedRequestFrame {
            api_key: ApiKey::ApiVersionsKey as i16,
            api_version,
            correlation_id,
            header: RequestHeader::default().with_correlation_id(correlation_id),
            body: RequestKind::ApiVersions(ApiVersionsRequest::default()),
        }
    }

    #[tokio::test]
    async fn buffer_overflow_is_fatal() {
        let (tx, _rx) = mpsc::channel(4);
        let mut fe = Frontend::new(tx, 64);
        fe.buffer_msg(opaque_frame(0, 40)).unwrap();
        let err = fe.buffer_msg(opaque_frame(1, 40)).unwrap_err();
        assert!(matches!(err, ProxyError::BufferOverflow { .. }));
    }

    #[tokio::test]
    async fn drain_preserves_arrival_order() {
        let (tx, _rx) = mpsc::channel(4);
        let mut fe = Frontend::new(tx, 1024);
        fe.buffer_msg(opaque_frame(1, 8)).unwrap();
        fe.buffer_msg(opaque_frame(2, 8)).unwrap();
        fe.buffer_msg(opaque_frame(3, 8)).unwrap();
        let drained: Vec<i32> = fe
            .drain_buffer()
            .iter()
            .map(|f| f.correlation_id())
            .collect();
        assert_eq!(drained, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn locally_answered_api_versions_is_not_replayed() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut fe = Frontend::new(tx, 1024);
        let req = api_versions_frame(5, 3);
        fe.buffer_msg(RequestFrame::Decoded(req.clone())).unwrap();
        assert_eq!(fe.respond_api_versions(&req), EnqueueOutcome::Written);
        fe.buffer_msg(opaque_frame(6, 8)).unwrap();

        let drained: Vec<i32> = fe
            .drain_buffer()
            .iter()
            .map(|f| f.correlation_id())
            .collect();
        assert_eq!(drained, vec![6]);

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.correlation_id(), 5);
        let decoded = resp.into_decoded().unwrap();
        let ResponseKind::ApiVersions(body) = decoded.body else {
            panic!("expected ApiVersions response");
        };
        assert_eq!(body.error_code, 0);
        assert!(!body.api_keys.is_empty());
    }

    #[tokio::test]
    async fn unsupported_api_versions_version_downgrades_to_v0() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut fe = Frontend::new(tx, 1024);
        let req = api_versions_frame(1, 99);
        fe.respond_api_versions(&req);
        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.api_version(), 0);
        let decoded = resp.into_decoded().unwrap();
        let ResponseKind::ApiVersions(body) = decoded.body else {
            panic!("expected ApiVersions response");
        };
        assert_eq!(body.error_code, ResponseError::UnsupportedVersion.code());
    }

    #[tokio::test]
    async fn enqueue_reports_unwritable_edge_once() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut fe = Frontend::new(tx, 1024);
        let frame = || {
            ResponseFrame::Decoded(DecodedResponseFrame {
                api_key: ApiKey::ApiVersionsKey as i16,
                api_version: 0,
                correlation_id: 0,
                header: ResponseHeader::default(),
                body: ResponseKind::ApiVersions(ApiVersionsResponse::default()),
            })
        };
        assert_eq!(fe.enqueue(frame()), EnqueueOutcome::Written);
        assert_eq!(fe.enqueue(frame()), EnqueueOutcome::NowBlocked);
        assert_eq!(fe.enqueue(frame()), EnqueueOutcome::StillBlocked);
        assert!(fe.is_blocked());

        // Each consumed frame frees one slot; the backlog drains across
        // unblock() calls and reports the writable edge on the last one.
        rx.recv().await.unwrap();
        assert!(!fe.unblock().await.unwrap());
        rx.recv().await.unwrap();
        assert!(fe.unblock().await.unwrap());
        assert!(!fe.is_blocked());
    }

    #[test]
    fn error_response_shapes() {
        let frame = error_response(
            ApiKey::ApiVersionsKey as i16,
            3,
            9,
            ResponseError::InvalidRequest,
        )
        .unwrap();
        assert_eq!(frame.correlation_id(), 9);
        // Produce has no top-level error code: bare close.
        assert!(error_response(ApiKey::ProduceKey as i16, 9, 1, ResponseError::InvalidRequest)
            .is_none());
    }
}
