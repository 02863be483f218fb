mod common;

use kafka_protocol::messages::{ApiKey, ApiVersionsRequest, MetadataRequest, RequestKind};
use knoxy::{HostPort, Proxy};

use common::{encode_request, start_proxy, MockBroker, TestClient};

/// A stalled broker backs pressure up through the proxy without losing
/// frames: once the broker resumes reading, everything the client pipelined
/// arrives intact and in order.
#[tokio::test]
async fn stalled_broker_loses_no_frames() {
    // The broker answers the first request, then reads nothing for a while.
    let broker = MockBroker::start_slow(500).await;
    let proxy = Proxy::builder()
        .target(HostPort::new("127.0.0.1", broker.addr.port()))
        .build()
        .unwrap();
    let proxy_addr = start_proxy(proxy).await;

    let mut client = TestClient::connect(proxy_addr).await;
    client
        .send_request(
            ApiKey::ApiVersionsKey,
            3,
            0,
            &RequestKind::ApiVersions(ApiVersionsRequest::default()),
        )
        .await;
    let (cid, _) = client.read_response().await;
    assert_eq!(cid, 0);

    // Flood while the broker is stalled. The volume exceeds the proxy's
    // write queue and the socket buffers, so the engine must suspend client
    // reads rather than drop or reorder frames.
    const FLOOD: i32 = 512;
    let mut bytes = Vec::new();
    for cid in 1..=FLOOD {
        let mut body = MetadataRequest::default();
        // Pad the request to make each frame a few KiB.
        body.topics = Some(
            (0..64)
                .map(|i| {
                    kafka_protocol::messages::metadata_request::MetadataRequestTopic::default()
                        .with_name(Some(kafka_protocol::messages::TopicName(
                            kafka_protocol::protocol::StrBytes::from_string(format!(
                                "some-rather-long-topic-name-{i:04}"
                            )),
                        )))
                })
                .collect(),
        );
        bytes.extend_from_slice(&encode_request(
            ApiKey::MetadataKey,
            12,
            cid,
            &RequestKind::Metadata(body),
        ));
    }
    client.send_raw(&bytes).await;

    // Every flooded frame eventually reaches the broker, in order.
    broker.wait_for_requests(1 + FLOOD as usize).await;
    let cids: Vec<i32> = broker
        .seen_requests()
        .iter()
        .skip(1)
        .map(|r| r.correlation_id)
        .collect();
    let expected: Vec<i32> = (1..=FLOOD).collect();
    assert_eq!(cids, expected);

    // And every response comes back, correlated.
    for expected in 1..=FLOOD {
        let (cid, _) = client.read_response().await;
        assert_eq!(cid, expected);
    }
}
