use kafka_protocol::messages::ApiKey;
use tracing::debug;

use crate::error::BoxError;
use crate::filter::{
    ConnectionInfo, Filter, FilterContext, FilterFactory, RequestFilterResult,
    ResponseFilterResult,
};
use crate::frame::{DecodedRequestFrame, DecodedResponseFrame};

pub struct FrameLoggerFactory;

impl FilterFactory for FrameLoggerFactory {
    fn create(&self, info: &ConnectionInfo) -> Box<dyn Filter> {
        Box::new(FrameLogger {
            peer: info.peer.to_string(),
            requests: 0,
            responses: 0,
        })
    }
}

/// Logs every frame passing through the connection at debug level.
///
/// Deserializes everything, so it costs the decode of each frame; intended
/// for debugging, enabled with the `log_frames` option.
pub struct FrameLogger {
    peer: String,
    requests: u64,
    responses: u64,
}

impl FrameLogger {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            requests: 0,
            responses: 0,
        }
    }
}

fn api_name(api_key: i16) -> String {
    match ApiKey::try_from(api_key) {
        Ok(key) => format!("{key:?}"),
        Err(_) => format!("Unknown({api_key})"),
    }
}

#[async_trait::async_trait]
impl Filter for FrameLogger {
    fn name(&self) -> &'static str {
        "frame-logger"
    }

    fn should_deserialize_request(&self, _: i16, _: i16) -> bool {
        true
    }

    fn should_deserialize_response(&self, _: i16, _: i16) -> bool {
        true
    }

    async fn on_request(
        &mut self,
        frame: DecodedRequestFrame,
        _ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult, BoxError> {
        self.requests += 1;
        debug!(
            peer = %self.peer,
            api = %api_name(frame.api_key),
            version = frame.api_version,
            correlation_id = frame.correlation_id,
            total = self.requests,
            "request"
        );
        Ok(RequestFilterResult::forward(frame.header, frame.body).build())
    }

    async fn on_response(
        &mut self,
        frame: DecodedResponseFrame,
        _ctx: &mut FilterContext<'_>,
    ) -> Result<ResponseFilterResult, BoxError> {
        self.responses += 1;
        debug!(
            peer = %self.peer,
            api = %api_name(frame.api_key),
            version = frame.api_version,
            correlation_id = frame.correlation_id,
            total = self.responses,
            "response"
        );
        Ok(ResponseFilterResult::forward(frame.header, frame.body).build())
    }
}
