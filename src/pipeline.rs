//! Filter chain dispatch.
//!
//! Requests visit filters first-to-last, responses last-to-first, so a given
//! filter's view is symmetric around the broker. Bodies are decoded at most
//! once, and only when some filter's `should_deserialize_*` predicate asks
//! for the frame; everything else passes through as raw bytes.
//!
//! The chain runs inside the connection's own task: a filter that awaits
//! suspends only its connection, never the runtime. (The original used one
//! pipeline stage per filter for the same reason, trading latency for not
//! monopolizing the event loop.)

use kafka_protocol::messages::ResponseHeader;
use tracing::warn;

use crate::correlation::CorrelationMap;
use crate::error::{ProxyError, Result};
use crate::filter::{Filter, FilterContext, RequestFilterResult, ResponseFilterResult};
use crate::frame::{DecodedRequestFrame, DecodedResponseFrame, RequestFrame, ResponseFrame};
use crate::metrics;
use crate::net_filter::VirtualCluster;

/// Outcome of running a request through the chain.
#[derive(Debug, Default)]
pub(crate) struct RequestDispatch {
    /// Frames for the broker, in send order: internal requests originated by
    /// filters, then (unless dropped or short-circuited) the request itself.
    pub to_server: Vec<RequestFrame>,
    /// A short-circuit response for the client.
    pub to_client: Option<ResponseFrame>,
    /// Close the connection after the queued frames are delivered.
    pub close_after: bool,
    /// Terminate immediately.
    pub disconnect: bool,
}

/// Outcome of running a response through the chain.
#[derive(Debug, Default)]
pub(crate) struct ResponseDispatch {
    pub to_client: Option<ResponseFrame>,
    pub to_server: Vec<RequestFrame>,
    pub close_after: bool,
    pub disconnect: bool,
}

pub(crate) struct FilterPipeline {
    filters: Vec<Box<dyn Filter>>,
    closed_notified: bool,
}

impl FilterPipeline {
    pub(crate) fn empty() -> Self {
        Self {
            filters: Vec::new(),
            closed_notified: false,
        }
    }

    pub(crate) fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self {
            filters,
            closed_notified: false,
        }
    }

    /// Run a client request through the request filters and register its
    /// correlation entry if it survives to be forwarded.
    pub(crate) async fn dispatch_request(
        &mut self,
        frame: RequestFrame,
        virtual_cluster: &VirtualCluster,
        correlation: &mut CorrelationMap,
    ) -> Result<RequestDispatch> {
        let mut dispatch = RequestDispatch::default();
        let mut current = frame;

        for index in 0..self.filters.len() {
            let filter = &mut self.filters[index];
            if !filter.should_deserialize_request(current.api_key(), current.api_version()) {
                continue;
            }
            let decoded = current.into_decoded()?;
            let (api_key, api_version, correlation_id) = (
                decoded.api_key,
                decoded.api_version,
                decoded.correlation_id,
            );
            let mut outbound = Vec::new();
            let mut ctx = FilterContext {
                virtual_cluster,
                correlation,
                outbound: &mut outbound,
                filter_index: index,
            };
            let name = filter.name();
            let result = filter
                .on_request(decoded, &mut ctx)
                .await
                .map_err(|source| {
                    metrics::filter_error(name);
                    ProxyError::Filter { name, source }
                })?;
            dispatch.to_server.append(&mut outbound);
            match result {
                RequestFilterResult::Forward {
                    header,
                    body,
                    close_connection,
                } => {
                    dispatch.close_after |= close_connection;
                    current = RequestFrame::Decoded(DecodedRequestFrame {
                        api_key,
                        api_version,
                        correlation_id: header.correlation_id,
                        header,
                        body,
                    });
                }
                RequestFilterResult::Drop => {
                    return Ok(dispatch);
                }
                RequestFilterResult::ShortCircuit {
                    header,
                    body,
                    close_connection,
                } => {
                    metrics::short_circuit();
                    let header = header
                        .unwrap_or_else(|| ResponseHeader::default().with_correlation_id(correlation_id));
                    dispatch.to_client = Some(ResponseFrame::Decoded(DecodedResponseFrame {
                        api_key,
                        api_version,
                        correlation_id: header.correlation_id,
                        header,
                        body,
                    }));
                    dispatch.close_after |= close_connection;
                    return Ok(dispatch);
                }
                RequestFilterResult::Disconnect => {
                    dispatch.disconnect = true;
                    return Ok(dispatch);
                }
            }
        }

        correlation.insert_external(
            current.correlation_id(),
            current.api_key(),
            current.api_version(),
        )?;
        dispatch.to_server.push(current);
        Ok(dispatch)
    }

    /// Run a broker response through the response filters, last-to-first.
    pub(crate) async fn dispatch_response(
        &mut self,
        frame: ResponseFrame,
        virtual_cluster: &VirtualCluster,
        correlation: &mut CorrelationMap,
    ) -> Result<ResponseDispatch> {
        let mut dispatch = ResponseDispatch::default();
        let mut current = frame;

        for index in (0..self.filters.len()).rev() {
            let filter = &mut self.filters[index];
            if !filter.should_deserialize_response(current.api_key(), current.api_version()) {
                continue;
            }
            let decoded = current.into_decoded()?;
            let (api_key, api_version) = (decoded.api_key, decoded.api_version);
            let mut outbound = Vec::new();
            let mut ctx = FilterContext {
                virtual_cluster,
                correlation,
                outbound: &mut outbound,
                filter_index: index,
            };
            let name = filter.name();
            let result = filter
                .on_response(decoded, &mut ctx)
                .await
                .map_err(|source| {
                    metrics::filter_error(name);
                    ProxyError::Filter { name, source }
                })?;
            dispatch.to_server.append(&mut outbound);
            match result {
                ResponseFilterResult::Forward {
                    header,
                    body,
                    close_connection,
                } => {
                    dispatch.close_after |= close_connection;
                    current = ResponseFrame::Decoded(DecodedResponseFrame {
                        api_key,
                        api_version,
                        correlation_id: header.correlation_id,
                        header,
                        body,
                    });
                }
                ResponseFilterResult::Drop => {
                    return Ok(dispatch);
                }
                ResponseFilterResult::Disconnect => {
                    dispatch.disconnect = true;
                    return Ok(dispatch);
                }
            }
        }

        dispatch.to_client = Some(current);
        Ok(dispatch)
    }

    /// Lifecycle notification: the connection reached `Closed`.
    pub(crate) fn notify_closed(&mut self) {
        if self.closed_notified {
            warn!("filter close notification repeated");
            return;
        }
        self.closed_notified = true;
        for filter in &mut self.filters {
            filter.on_closed();
        }
    }
}
