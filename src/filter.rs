//! The filter contract: observe, mutate, drop, short-circuit or reject
//! individual Kafka frames as they pass through the proxy.
//!
//! Filters are installed per connection via [`FilterFactory`] (the net-filter
//! decides which factories apply). For a chain `[F1, F2]`, `F1` sees requests
//! before `F2` and responses after `F2`: ordering is symmetric around the
//! broker.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use kafka_protocol::messages::{
    ApiKey, RequestHeader, RequestKind, ResponseHeader, ResponseKind,
};
use tokio::sync::oneshot;

use crate::correlation::CorrelationMap;
use crate::error::BoxError;
use crate::frame::{DecodedRequestFrame, DecodedResponseFrame, RequestFrame};
use crate::net_filter::VirtualCluster;

/// Outcome of a request filter invocation.
#[derive(Debug)]
pub enum RequestFilterResult {
    /// Continue down the chain with the (possibly replaced) header and body.
    Forward {
        header: RequestHeader,
        body: RequestKind,
        close_connection: bool,
    },
    /// Discard the frame. No response is ever generated for it.
    Drop,
    /// Answer the client directly; the broker never sees the request.
    ShortCircuit {
        header: Option<ResponseHeader>,
        body: ResponseKind,
        close_connection: bool,
    },
    /// Terminate the connection immediately.
    Disconnect,
}

impl RequestFilterResult {
    pub fn forward(header: RequestHeader, body: RequestKind) -> ForwardRequestBuilder {
        ForwardRequestBuilder {
            header,
            body,
            close_connection: false,
        }
    }

    /// Build a short-circuit result. Only response payloads are accepted
    /// here; the type system enforces what the original checked at runtime.
    pub fn short_circuit(body: ResponseKind) -> ShortCircuitBuilder {
        ShortCircuitBuilder {
            header: None,
            body,
            close_connection: false,
        }
    }

    pub fn drop_frame() -> Self {
        RequestFilterResult::Drop
    }

    pub fn disconnect() -> Self {
        RequestFilterResult::Disconnect
    }
}

#[derive(Debug)]
pub struct ForwardRequestBuilder {
    header: RequestHeader,
    body: RequestKind,
    close_connection: bool,
}

impl ForwardRequestBuilder {
    /// Close the connection after the frame has been forwarded.
    pub fn with_close_connection(mut self, close: bool) -> Self {
        self.close_connection = close;
        self
    }

    pub fn build(self) -> RequestFilterResult {
        RequestFilterResult::Forward {
            header: self.header,
            body: self.body,
            close_connection: self.close_connection,
        }
    }
}

#[derive(Debug)]
pub struct ShortCircuitBuilder {
    header: Option<ResponseHeader>,
    body: ResponseKind,
    close_connection: bool,
}

impl ShortCircuitBuilder {
    /// Supply an explicit response header; by default one is synthesized
    /// from the request's correlation id.
    pub fn with_header(mut self, header: ResponseHeader) -> Self {
        self.header = Some(header);
        self
    }

    /// Close the connection after the short-circuit response is delivered.
    pub fn with_close_connection(mut self, close: bool) -> Self {
        self.close_connection = close;
        self
    }

    pub fn build(self) -> RequestFilterResult {
        RequestFilterResult::ShortCircuit {
            header: self.header,
            body: self.body,
            close_connection: self.close_connection,
        }
    }
}

/// Outcome of a response filter invocation.
#[derive(Debug)]
pub enum ResponseFilterResult {
    Forward {
        header: ResponseHeader,
        body: ResponseKind,
        close_connection: bool,
    },
    Drop,
    Disconnect,
}

impl ResponseFilterResult {
    pub fn forward(header: ResponseHeader, body: ResponseKind) -> ForwardResponseBuilder {
        ForwardResponseBuilder {
            header,
            body,
            close_connection: false,
        }
    }

    pub fn drop_frame() -> Self {
        ResponseFilterResult::Drop
    }

    pub fn disconnect() -> Self {
        ResponseFilterResult::Disconnect
    }
}

#[derive(Debug)]
pub struct ForwardResponseBuilder {
    header: ResponseHeader,
    body: ResponseKind,
    close_connection: bool,
}

impl ForwardResponseBuilder {
    pub fn with_close_connection(mut self, close: bool) -> Self {
        self.close_connection = close;
        self
    }

    pub fn build(self) -> ResponseFilterResult {
        ResponseFilterResult::Forward {
            header: self.header,
            body: self.body,
            close_connection: self.close_connection,
        }
    }
}

/// Error resolving an internal response future: the connection closed before
/// the broker answered.
#[derive(Debug, thiserror::Error)]
#[error("connection closed before internal response arrived")]
pub struct ConnectionClosed;

/// Future for the response to a filter-originated request.
///
/// The engine completes it when the broker's response arrives; it fails with
/// [`ConnectionClosed`] if the connection shuts down first. Do not await it
/// inside the same `on_request`/`on_response` invocation that originated it:
/// the response cannot arrive until control returns to the engine. Store it
/// and consume it on a later invocation (or poll with [`try_take`]).
///
/// [`try_take`]: InternalResponseFuture::try_take
#[derive(Debug)]
pub struct InternalResponseFuture {
    rx: oneshot::Receiver<ResponseKind>,
}

impl InternalResponseFuture {
    /// The response body, if it has already arrived.
    pub fn try_take(&mut self) -> Option<ResponseKind> {
        self.rx.try_recv().ok()
    }
}

impl Future for InternalResponseFuture {
    type Output = Result<ResponseKind, ConnectionClosed>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| ConnectionClosed))
    }
}

/// Per-invocation context handed to a filter.
pub struct FilterContext<'a> {
    pub(crate) virtual_cluster: &'a VirtualCluster,
    pub(crate) correlation: &'a mut CorrelationMap,
    pub(crate) outbound: &'a mut Vec<RequestFrame>,
    pub(crate) filter_index: usize,
}

impl FilterContext<'_> {
    /// Metadata about the virtual cluster this connection belongs to.
    pub fn virtual_cluster(&self) -> &VirtualCluster {
        self.virtual_cluster
    }

    /// Send the filter's own request to the broker. The response resolves
    /// the returned future and is never forwarded to the client.
    pub fn originate_request(
        &mut self,
        api_key: ApiKey,
        api_version: i16,
        body: RequestKind,
    ) -> InternalResponseFuture {
        let (correlation_id, rx) =
            self.correlation
                .insert_internal(self.filter_index, api_key as i16, api_version);
        let header = RequestHeader::default()
            .with_request_api_key(api_key as i16)
            .with_request_api_version(api_version)
            .with_correlation_id(correlation_id);
        self.outbound
            .push(RequestFrame::Decoded(DecodedRequestFrame {
                api_key: api_key as i16,
                api_version,
                correlation_id,
                header,
                body,
            }));
        InternalResponseFuture { rx }
    }
}

/// A Kafka frame filter. One instance serves one connection.
///
/// The `should_deserialize_*` predicates gate body decoding: frames nobody
/// wants decoded are forwarded as raw bytes. Hooks must not block the
/// thread; long-running work belongs behind [`FilterContext::originate_request`]
/// or a spawned task.
#[async_trait::async_trait]
pub trait Filter: Send {
    /// Name used in logs and error metrics.
    fn name(&self) -> &'static str {
        "filter"
    }

    fn should_deserialize_request(&self, api_key: i16, api_version: i16) -> bool {
        let _ = (api_key, api_version);
        false
    }

    fn should_deserialize_response(&self, api_key: i16, api_version: i16) -> bool {
        let _ = (api_key, api_version);
        false
    }

    async fn on_request(
        &mut self,
        frame: DecodedRequestFrame,
        ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult, BoxError> {
        let _ = ctx;
        Ok(RequestFilterResult::forward(frame.header, frame.body).build())
    }

    async fn on_response(
        &mut self,
        frame: DecodedResponseFrame,
        ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult, BoxError> {
        let _ = ctx;
        Ok(ResponseFilterResult::forward(frame.header, frame.body).build())
    }

    /// Lifecycle hook: the connection reached `Closed`.
    fn on_closed(&mut self) {}
}

/// Creates one [`Filter`] instance per connection.
pub trait FilterFactory: Send + Sync {
    fn create(&self, info: &ConnectionInfo) -> Box<dyn Filter>;
}

/// What a factory knows about the connection it is instantiating for.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub cluster: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::FetchResponse;

    fn fetch_response() -> ResponseKind {
        ResponseKind::Fetch(FetchResponse::default())
    }

    #[test]
    fn forward_carries_payload() {
        let header = RequestHeader::default().with_correlation_id(3);
        let body = RequestKind::Fetch(Default::default());
        let result = RequestFilterResult::forward(header, body).build();
        match result {
            RequestFilterResult::Forward {
                header,
                close_connection,
                ..
            } => {
                assert_eq!(header.correlation_id, 3);
                assert!(!close_connection);
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn forward_with_close_connection() {
        let result = RequestFilterResult::forward(
            RequestHeader::default(),
            RequestKind::Fetch(Default::default()),
        )
        .with_close_connection(true)
        .build();
        assert!(matches!(
            result,
            RequestFilterResult::Forward {
                close_connection: true,
                ..
            }
        ));
    }

    #[test]
    fn short_circuit_without_header() {
        let result = RequestFilterResult::short_circuit(fetch_response()).build();
        match result {
            RequestFilterResult::ShortCircuit {
                header,
                close_connection,
                ..
            } => {
                assert!(header.is_none());
                assert!(!close_connection);
            }
            other => panic!("expected short circuit, got {other:?}"),
        }
    }

    #[test]
    fn short_circuit_with_header_and_close() {
        let result = RequestFilterResult::short_circuit(fetch_response())
            .with_header(ResponseHeader::default().with_correlation_id(5))
            .with_close_connection(true)
            .build();
        match result {
            RequestFilterResult::ShortCircuit {
                header,
                close_connection,
                ..
            } => {
                assert_eq!(header.unwrap().correlation_id, 5);
                assert!(close_connection);
            }
            other => panic!("expected short circuit, got {other:?}"),
        }
    }

    #[test]
    fn drop_has_no_payload() {
        assert!(matches!(
            RequestFilterResult::drop_frame(),
            RequestFilterResult::Drop
        ));
    }
}
