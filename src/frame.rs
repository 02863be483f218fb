use bytes::{Buf, Bytes};
use kafka_protocol::messages::{ApiKey, RequestHeader, RequestKind, ResponseHeader, ResponseKind};
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::Decodable;

use crate::error::{ProxyError, Result};

/// A client-originated Kafka request frame.
///
/// Frames come off the wire `Opaque`: the fixed header prelude (api key,
/// api version, correlation id) is peeked cheaply, but the header and body
/// stay raw bytes. A frame is promoted to `Decoded` only when a filter asks
/// for it, so pass-through traffic is forwarded verbatim.
#[derive(Debug, Clone)]
pub enum RequestFrame {
    Decoded(DecodedRequestFrame),
    Opaque(OpaqueRequestFrame),
}

#[derive(Debug, Clone)]
pub struct DecodedRequestFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub header: RequestHeader,
    pub body: RequestKind,
}

/// An undecoded request: the raw frame bytes (header + body, without the
/// length prefix) plus the peeked prelude fields.
#[derive(Debug, Clone)]
pub struct OpaqueRequestFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub raw: Bytes,
}

impl RequestFrame {
    pub fn api_key(&self) -> i16 {
        match self {
            RequestFrame::Decoded(f) => f.api_key,
            RequestFrame::Opaque(f) => f.api_key,
        }
    }

    pub fn api_version(&self) -> i16 {
        match self {
            RequestFrame::Decoded(f) => f.api_version,
            RequestFrame::Opaque(f) => f.api_version,
        }
    }

    pub fn correlation_id(&self) -> i32 {
        match self {
            RequestFrame::Decoded(f) => f.correlation_id,
            RequestFrame::Opaque(f) => f.correlation_id,
        }
    }

    pub fn is_api_versions(&self) -> bool {
        self.api_key() == ApiKey::ApiVersionsKey as i16
    }

    /// Wire size of this frame including the 4-byte length prefix, used for
    /// buffer accounting. Decoded frames report an estimate of zero extra
    /// overhead over their eventual encoding; only opaque frames are ever
    /// buffered, so the exact figure is what matters there.
    pub fn buffered_size(&self) -> usize {
        match self {
            RequestFrame::Opaque(f) => f.raw.len() + 4,
            RequestFrame::Decoded(_) => 4,
        }
    }

    /// Promote an opaque frame to a decoded one. Decoded frames pass through
    /// unchanged.
    pub fn into_decoded(self) -> Result<DecodedRequestFrame> {
        match self {
            RequestFrame::Decoded(f) => Ok(f),
            RequestFrame::Opaque(f) => f.decode(),
        }
    }
}

impl OpaqueRequestFrame {
    /// Peek the fixed request prelude from raw frame bytes without consuming
    /// them. Fails on frames shorter than the 8-byte prelude.
    pub fn peek(raw: Bytes) -> Result<Self> {
        if raw.len() < 8 {
            return Err(ProxyError::ProtocolViolation(format!(
                "request frame of {} bytes is shorter than the request prelude",
                raw.len()
            )));
        }
        let mut prelude = raw.clone();
        let api_key = prelude.peek_bytes(0..2).get_i16();
        let api_version = prelude.peek_bytes(2..4).get_i16();
        let correlation_id = prelude.peek_bytes(4..8).get_i32();
        Ok(Self {
            api_key,
            api_version,
            correlation_id,
            raw,
        })
    }

    pub fn decode(self) -> Result<DecodedRequestFrame> {
        let api_key = ApiKey::try_from(self.api_key).map_err(|_| {
            ProxyError::ProtocolViolation(format!("unknown api key {}", self.api_key))
        })?;
        let mut buf = self.raw.clone();
        let header_version = api_key.request_header_version(self.api_version);
        let header =
            RequestHeader::decode(&mut buf, header_version).map_err(anyhow::Error::from)?;
        let body =
            RequestKind::decode(api_key, &mut buf, self.api_version).map_err(anyhow::Error::from)?;
        Ok(DecodedRequestFrame {
            api_key: self.api_key,
            api_version: self.api_version,
            correlation_id: self.correlation_id,
            header,
            body,
        })
    }
}

/// A broker-originated Kafka response frame headed for the client.
///
/// Internal responses (answers to filter-originated requests) never become a
/// `ResponseFrame`; they are routed to their recipient's promise by the
/// upstream handler before one is built.
#[derive(Debug, Clone)]
pub enum ResponseFrame {
    Decoded(DecodedResponseFrame),
    Opaque(OpaqueResponseFrame),
}

#[derive(Debug, Clone)]
pub struct DecodedResponseFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub header: ResponseHeader,
    pub body: ResponseKind,
}

#[derive(Debug, Clone)]
pub struct OpaqueResponseFrame {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub raw: Bytes,
}

impl ResponseFrame {
    pub fn api_key(&self) -> i16 {
        match self {
            ResponseFrame::Decoded(f) => f.api_key,
            ResponseFrame::Opaque(f) => f.api_key,
        }
    }

    pub fn api_version(&self) -> i16 {
        match self {
            ResponseFrame::Decoded(f) => f.api_version,
            ResponseFrame::Opaque(f) => f.api_version,
        }
    }

    pub fn correlation_id(&self) -> i32 {
        match self {
            ResponseFrame::Decoded(f) => f.correlation_id,
            ResponseFrame::Opaque(f) => f.correlation_id,
        }
    }

    pub fn into_decoded(self) -> Result<DecodedResponseFrame> {
        match self {
            ResponseFrame::Decoded(f) => Ok(f),
            ResponseFrame::Opaque(f) => f.decode(),
        }
    }
}

impl OpaqueResponseFrame {
    pub fn decode(self) -> Result<DecodedResponseFrame> {
        let (header, body) = decode_response_payload(self.api_key, self.api_version, self.raw)?;
        Ok(DecodedResponseFrame {
            api_key: self.api_key,
            api_version: self.api_version,
            correlation_id: self.correlation_id,
            header,
            body,
        })
    }
}

/// Decode a raw response payload (header + body) for a known api key and
/// version. The version comes from the correlation map, never the wire:
/// responses do not carry it.
pub(crate) fn decode_response_payload(
    api_key: i16,
    api_version: i16,
    raw: Bytes,
) -> Result<(ResponseHeader, ResponseKind)> {
    let key = ApiKey::try_from(api_key)
        .map_err(|_| ProxyError::ProtocolViolation(format!("unknown api key {api_key}")))?;
    let mut buf = raw;
    let header_version = key.response_header_version(api_version);
    let header =
        ResponseHeader::decode(&mut buf, header_version).map_err(anyhow::Error::from)?;
    let body = ResponseKind::decode(key, &mut buf, api_version).map_err(anyhow::Error::from)?;
    Ok((header, body))
}

/// Decoded HA-Proxy protocol preamble: the load balancer's view of the
/// original client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaProxyPreamble {
    pub version: HaProxyVersion,
    pub source_address: String,
    pub source_port: u16,
    pub destination_address: String,
    pub destination_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaProxyVersion {
    V1,
    V2,
}
