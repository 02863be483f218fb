#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::{
    ApiKey, ApiVersionsResponse, CreateTopicsResponse, FetchResponse, MetadataResponse,
    ProduceResponse, RequestHeader, RequestKind, ResponseHeader, ResponseKind,
};
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::{Decodable, Encodable};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A request frame as the mock broker saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    /// Frame bytes without the length prefix, exactly as received.
    pub raw: Vec<u8>,
}

/// Spawn a proxy's accept loop on a random port and return the address.
pub async fn start_proxy(proxy: knoxy::Proxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        proxy.listen_on(listener).await.ok();
    });
    addr
}

/// Encode a request frame (length prefix included).
pub fn encode_request(api_key: ApiKey, version: i16, correlation_id: i32, body: &RequestKind) -> Vec<u8> {
    let header = RequestHeader::default()
        .with_request_api_key(api_key as i16)
        .with_request_api_version(version)
        .with_correlation_id(correlation_id);
    let mut payload = BytesMut::new();
    header
        .encode(&mut payload, api_key.request_header_version(version))
        .unwrap();
    body.encode(&mut payload, version).unwrap();
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.put_i32(payload.len() as i32);
    framed.extend_from_slice(&payload);
    framed
}

/// Encode a response frame (length prefix included).
pub fn encode_response(
    api_key: ApiKey,
    version: i16,
    correlation_id: i32,
    body: &ResponseKind,
) -> Vec<u8> {
    let mut payload = BytesMut::new();
    ResponseHeader::default()
        .with_correlation_id(correlation_id)
        .encode(&mut payload, api_key.response_header_version(version))
        .unwrap();
    body.encode(&mut payload, version).unwrap();
    let mut framed = Vec::with_capacity(payload.len() + 4);
    framed.put_i32(payload.len() as i32);
    framed.extend_from_slice(&payload);
    framed
}

/// Decode a response payload (no length prefix) for a known api key/version.
pub fn decode_response(api_key: ApiKey, version: i16, payload: Bytes) -> (ResponseHeader, ResponseKind) {
    let mut buf = payload;
    let header = ResponseHeader::decode(&mut buf, api_key.response_header_version(version)).unwrap();
    let body = ResponseKind::decode(api_key, &mut buf, version).unwrap();
    (header, body)
}

/// Raw Kafka client speaking length-prefixed frames over TCP.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send_request(
        &mut self,
        api_key: ApiKey,
        version: i16,
        correlation_id: i32,
        body: &RequestKind,
    ) {
        let framed = encode_request(api_key, version, correlation_id, body);
        self.send_raw(&framed).await;
    }

    /// Read one response frame; returns the correlation id and the payload
    /// (without the length prefix).
    pub async fn read_response(&mut self) -> (i32, Bytes) {
        let len = self.stream.read_i32().await.unwrap();
        assert!(len > 4, "response frame too short: {len}");
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).await.unwrap();
        let payload = Bytes::from(payload);
        let correlation_id = payload.clone().peek_bytes(0..4).get_i32();
        (correlation_id, payload)
    }

    /// Assert the proxy closed the connection (EOF or reset).
    pub async fn expect_closed(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match self.stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                // Late frames (e.g. a synthesized error response already in
                // flight) are allowed before the close.
                Ok(_) => {}
            }
        }
    }
}

fn peek_prelude(raw: &[u8]) -> (i16, i16, i32) {
    let api_key = i16::from_be_bytes([raw[0], raw[1]]);
    let api_version = i16::from_be_bytes([raw[2], raw[3]]);
    let correlation_id = i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    (api_key, api_version, correlation_id)
}

fn default_response_for(request: &SeenRequest) -> Option<Vec<u8>> {
    let api_key = ApiKey::try_from(request.api_key).ok()?;
    let body = match api_key {
        ApiKey::ApiVersionsKey => ResponseKind::ApiVersions(ApiVersionsResponse::default()),
        ApiKey::MetadataKey => ResponseKind::Metadata(MetadataResponse::default()),
        ApiKey::FetchKey => ResponseKind::Fetch(FetchResponse::default()),
        ApiKey::ProduceKey => ResponseKind::Produce(ProduceResponse::default()),
        ApiKey::CreateTopicsKey => ResponseKind::CreateTopics(CreateTopicsResponse::default()),
        _ => return None,
    };
    Some(encode_response(
        api_key,
        request.api_version,
        request.correlation_id,
        &body,
    ))
}

/// In-process stand-in for a Kafka broker.
///
/// Accepts one connection, records every request frame it reads, and answers
/// with default-shaped responses (echoing the correlation id). The recorded
/// frames let tests assert exactly what reached the broker.
pub struct MockBroker {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<SeenRequest>>>,
    accepted: Arc<Mutex<usize>>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    /// A broker that reads nothing for `initial_delay_ms` after the first
    /// request, used to fill the proxy's upstream write path.
    pub async fn start_slow(initial_delay_ms: u64) -> Self {
        Self::start_inner(Some(initial_delay_ms)).await
    }

    async fn start_inner(stall_ms: Option<u64>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: Arc<Mutex<Vec<SeenRequest>>> = Arc::default();
        let accepted: Arc<Mutex<usize>> = Arc::default();

        let requests_task = requests.clone();
        let accepted_task = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                *accepted_task.lock().unwrap() += 1;
                let requests = requests_task.clone();
                let stall = stall_ms;
                tokio::spawn(async move {
                    let mut first = true;
                    loop {
                        let Ok(len) = stream.read_i32().await else {
                            break;
                        };
                        let mut raw = vec![0u8; len as usize];
                        if stream.read_exact(&mut raw).await.is_err() {
                            break;
                        }
                        let (api_key, api_version, correlation_id) = peek_prelude(&raw);
                        let seen = SeenRequest {
                            api_key,
                            api_version,
                            correlation_id,
                            raw,
                        };
                        if let Some(response) = default_response_for(&seen) {
                            if stream.write_all(&response).await.is_err() {
                                break;
                            }
                        }
                        requests.lock().unwrap().push(seen);
                        if first {
                            first = false;
                            if let Some(ms) = stall {
                                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            accepted,
        }
    }

    pub fn seen_requests(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connections_accepted(&self) -> usize {
        *self.accepted.lock().unwrap()
    }

    /// Wait until the broker has seen at least `n` requests.
    pub async fn wait_for_requests(&self, n: usize) {
        for _ in 0..200 {
            if self.requests.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!(
            "broker saw only {} of {n} expected requests",
            self.requests.lock().unwrap().len()
        );
    }
}

/// A broker the test drives by hand: requests arrive on a channel, and the
/// test decides what bytes to send back and when.
pub struct ManualBroker {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<SeenRequest>,
    pub responses: mpsc::UnboundedSender<Vec<u8>>,
}

impl ManualBroker {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (mut rd, mut wr) = stream.into_split();
            tokio::spawn(async move {
                while let Some(bytes) = resp_rx.recv().await {
                    if wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            });
            loop {
                let Ok(len) = rd.read_i32().await else {
                    break;
                };
                let mut raw = vec![0u8; len as usize];
                if rd.read_exact(&mut raw).await.is_err() {
                    break;
                }
                let (api_key, api_version, correlation_id) = peek_prelude(&raw);
                if req_tx
                    .send(SeenRequest {
                        api_key,
                        api_version,
                        correlation_id,
                        raw,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });

        Self {
            addr,
            requests: req_rx,
            responses: resp_tx,
        }
    }
}

/// PROXY protocol v2 header bytes for a TCP4 connection.
pub fn proxy_v2_header(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&[
        0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
    ]);
    buf.extend_from_slice(&[0x21, 0x11]);
    buf.extend_from_slice(&12u16.to_be_bytes());
    buf.extend_from_slice(&src);
    buf.extend_from_slice(&dst);
    buf.extend_from_slice(&src_port.to_be_bytes());
    buf.extend_from_slice(&dst_port.to_be_bytes());
    buf
}
