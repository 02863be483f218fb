mod common;

use kafka_protocol::messages::create_topics_request::CreatableTopic;
use kafka_protocol::messages::{
    ApiKey, ApiVersionsRequest, CreateTopicsRequest, MetadataRequest, RequestKind, ResponseKind,
    TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::error::ResponseError;
use knoxy::filter::{ConnectionInfo, Filter, FilterContext, FilterFactory, RequestFilterResult};
use knoxy::filters::RejectCreateTopicsFactory;
use knoxy::frame::DecodedRequestFrame;
use knoxy::{BoxError, HostPort, Proxy};

use common::{decode_response, start_proxy, MockBroker, TestClient};

fn metadata_body() -> RequestKind {
    RequestKind::Metadata(MetadataRequest::default())
}

fn create_topics_body(name: &str) -> RequestKind {
    RequestKind::CreateTopics(CreateTopicsRequest::default().with_topics(vec![
        CreatableTopic::default().with_name(TopicName(StrBytes::from_string(name.into()))),
    ]))
}

/// A request filter rejects `CreateTopics` with an error response; the
/// client sees the error, the broker never sees the request, and the
/// connection keeps forwarding.
#[tokio::test]
async fn create_topics_is_rejected_without_reaching_the_broker() {
    let broker = MockBroker::start().await;
    let proxy = Proxy::builder()
        .target(HostPort::new("127.0.0.1", broker.addr.port()))
        .filter(RejectCreateTopicsFactory { message: None })
        .build()
        .unwrap();
    let proxy_addr = start_proxy(proxy).await;

    let mut client = TestClient::connect(proxy_addr).await;
    client
        .send_request(
            ApiKey::ApiVersionsKey,
            3,
            1,
            &RequestKind::ApiVersions(ApiVersionsRequest::default()),
        )
        .await;
    let (cid, _) = client.read_response().await;
    assert_eq!(cid, 1);

    client
        .send_request(ApiKey::CreateTopicsKey, 7, 2, &create_topics_body("t"))
        .await;
    let (cid, payload) = client.read_response().await;
    assert_eq!(cid, 2);
    let (_, body) = decode_response(ApiKey::CreateTopicsKey, 7, payload);
    let ResponseKind::CreateTopics(response) = body else {
        panic!("expected CreateTopics response");
    };
    assert_eq!(
        response.topics[0].error_code,
        ResponseError::InvalidTopicException.code()
    );

    // The connection is still in forwarding: a later request round-trips.
    client
        .send_request(ApiKey::MetadataKey, 12, 3, &metadata_body())
        .await;
    let (cid, _) = client.read_response().await;
    assert_eq!(cid, 3);

    broker.wait_for_requests(2).await;
    assert!(broker
        .seen_requests()
        .iter()
        .all(|r| r.api_key != ApiKey::CreateTopicsKey as i16));
}

struct DropMetadataFactory;

impl FilterFactory for DropMetadataFactory {
    fn create(&self, _info: &ConnectionInfo) -> Box<dyn Filter> {
        Box::new(DropMetadata)
    }
}

struct DropMetadata;

#[async_trait::async_trait]
impl Filter for DropMetadata {
    fn should_deserialize_request(&self, api_key: i16, _: i16) -> bool {
        api_key == ApiKey::MetadataKey as i16
    }

    async fn on_request(
        &mut self,
        _frame: DecodedRequestFrame,
        _ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult, BoxError> {
        Ok(RequestFilterResult::drop_frame())
    }
}

/// A dropped request produces no response at all, and nothing upstream.
#[tokio::test]
async fn dropped_requests_vanish_silently() {
    let broker = MockBroker::start().await;
    let proxy = Proxy::builder()
        .target(HostPort::new("127.0.0.1", broker.addr.port()))
        .filter(DropMetadataFactory)
        .build()
        .unwrap();
    let proxy_addr = start_proxy(proxy).await;

    let mut client = TestClient::connect(proxy_addr).await;
    client
        .send_request(ApiKey::MetadataKey, 12, 1, &metadata_body())
        .await;
    // The Fetch passes through; its response arriving proves the Metadata
    // was dropped rather than still in flight.
    client
        .send_request(
            ApiKey::FetchKey,
            13,
            2,
            &RequestKind::Fetch(Default::default()),
        )
        .await;
    let (cid, _) = client.read_response().await;
    assert_eq!(cid, 2);

    broker.wait_for_requests(1).await;
    let seen = broker.seen_requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].api_key, ApiKey::FetchKey as i16);
}

struct DisconnectOnMetadataFactory;

impl FilterFactory for DisconnectOnMetadataFactory {
    fn create(&self, _info: &ConnectionInfo) -> Box<dyn Filter> {
        Box::new(DisconnectOnMetadata)
    }
}

struct DisconnectOnMetadata;

#[async_trait::async_trait]
impl Filter for DisconnectOnMetadata {
    fn should_deserialize_request(&self, api_key: i16, _: i16) -> bool {
        api_key == ApiKey::MetadataKey as i16
    }

    async fn on_request(
        &mut self,
        _frame: DecodedRequestFrame,
        _ctx: &mut FilterContext<'_>,
    ) -> Result<RequestFilterResult, BoxError> {
        Ok(RequestFilterResult::disconnect())
    }
}

#[tokio::test]
async fn disconnect_terminates_the_connection() {
    let broker = MockBroker::start().await;
    let proxy = Proxy::builder()
        .target(HostPort::new("127.0.0.1", broker.addr.port()))
        .filter(DisconnectOnMetadataFactory)
        .build()
        .unwrap();
    let proxy_addr = start_proxy(proxy).await;

    let mut client = TestClient::connect(proxy_addr).await;
    client
        .send_request(ApiKey::MetadataKey, 12, 1, &metadata_body())
        .await;
    client.expect_closed().await;
}

/// `with_close_connection` on a short-circuit delivers the response first,
/// then closes.
#[tokio::test]
async fn short_circuit_with_close_delivers_response_before_closing() {
    struct Factory;

    impl FilterFactory for Factory {
        fn create(&self, _info: &ConnectionInfo) -> Box<dyn Filter> {
            Box::new(ShortCircuitAndClose)
        }
    }

    struct ShortCircuitAndClose;

    #[async_trait::async_trait]
    impl Filter for ShortCircuitAndClose {
        fn should_deserialize_request(&self, api_key: i16, _: i16) -> bool {
            api_key == ApiKey::CreateTopicsKey as i16
        }

        async fn on_request(
            &mut self,
            _frame: DecodedRequestFrame,
            _ctx: &mut FilterContext<'_>,
        ) -> Result<RequestFilterResult, BoxError> {
            Ok(RequestFilterResult::short_circuit(ResponseKind::CreateTopics(
                Default::default(),
            ))
            .with_close_connection(true)
            .build())
        }
    }

    let broker = MockBroker::start().await;
    let proxy = Proxy::builder()
        .target(HostPort::new("127.0.0.1", broker.addr.port()))
        .filter(Factory)
        .build()
        .unwrap();
    let proxy_addr = start_proxy(proxy).await;

    let mut client = TestClient::connect(proxy_addr).await;
    client
        .send_request(ApiKey::CreateTopicsKey, 7, 9, &create_topics_body("t"))
        .await;
    let (cid, _) = client.read_response().await;
    assert_eq!(cid, 9);
    client.expect_closed().await;
}
