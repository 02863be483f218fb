use kafka_protocol::messages::create_topics_response::CreatableTopicResult;
use kafka_protocol::messages::{ApiKey, CreateTopicsResponse, RequestKind, ResponseKind};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::error::ResponseError;
use tracing::info;

use crate::error::BoxError;
use crate::filter::{
    ConnectionInfo, Filter, FilterContext, FilterFactory, RequestFilterResult,
};
use crate::frame::DecodedRequestFrame;

pub struct RejectCreateTopicsFactory {
    pub message: Option<String>,
}

impl FilterFactory for RejectCreateTopicsFactory {
    fn create(&self, _info: &ConnectionInfo) -> Box<dyn Filter> {
        Box::new(RejectCreateTopics {
            message: self
                .message
                .clone()
                .unwrap_or_else(|| "topic creation is not allowed through this proxy".into()),
        })
    }
}

/// Short-circuits every `CreateTopics` request with an
/// `INVALID_TOPIC_EXCEPTION` response. The broker never sees the request.
pub struct RejectCreateTopics {
    message: String,
}

impl RejectCreateTopics {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait::async_trait]
impl Filter for RejectCreateTopics {
    fn name(&self) -> &'static str {
        "reject-create-topics"
    }

    fn should_deserialize_request(&self, api_key: i16, _: i16) -> bool {
        api_key == ApiKey::CreateTopicsKey as i16
    }

    async fn on_request(
        &mut self,
        frame: DecodedRequestFrame,
        _ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult, BoxError> {
        let RequestKind::CreateTopics(request) = &frame.body else {
            return Ok(RequestFilterResult::forward(frame.header, frame.body).build());
        };
        let topics: Vec<CreatableTopicResult> = request
            .topics
            .iter()
            .map(|topic| {
                CreatableTopicResult::default()
                    .with_name(topic.name.clone())
                    .with_error_code(ResponseError::InvalidTopicException.code())
                    .with_error_message(Some(StrBytes::from_string(self.message.clone())))
            })
            .collect();
        info!(
            topics = topics.len(),
            correlation_id = frame.correlation_id,
            "rejecting topic creation"
        );
        let response = CreateTopicsResponse::default().with_topics(topics);
        Ok(RequestFilterResult::short_circuit(ResponseKind::CreateTopics(response)).build())
    }
}
