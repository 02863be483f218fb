//! Length-prefixed KRPC framing for both sides of the proxy.
//!
//! The downstream codec understands an optional PROXY preamble at stream
//! start followed by Kafka request frames; it writes response frames. The
//! upstream codec mirrors it: writes request frames, reads response frames.
//!
//! Frames are decoded shallowly here: the fixed request prelude is peeked so
//! the engine can classify the frame, but header/body decoding is deferred
//! until a filter actually wants the frame (see `pipeline`). Responses are
//! not even version-resolved at this layer; the correlation map owns that
//! knowledge, so the upstream decoder only surfaces the correlation id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::ApiKey;
use kafka_protocol::protocol::buf::ByteBuf;
use kafka_protocol::protocol::Encodable;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProxyError, Result};
use crate::frame::{HaProxyPreamble, OpaqueRequestFrame, RequestFrame, ResponseFrame};
use crate::haproxy::{self, Probe};

/// Anything the client side of the wire can produce.
#[derive(Debug)]
pub enum ClientMessage {
    Preamble(HaProxyPreamble),
    Request(RequestFrame),
}

/// Decodes client bytes, encodes responses back to the client.
pub struct DownstreamCodec {
    max_frame_bytes: usize,
    at_stream_start: bool,
}

impl DownstreamCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            at_stream_start: true,
        }
    }
}

fn decode_length_prefixed(
    src: &mut BytesMut,
    max_frame_bytes: usize,
) -> Result<Option<Bytes>> {
    if src.len() < 4 {
        return Ok(None);
    }
    let declared = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    if declared < 0 {
        return Err(ProxyError::ProtocolViolation(format!(
            "negative frame length {declared}"
        )));
    }
    let len = declared as usize;
    if len > max_frame_bytes {
        return Err(ProxyError::OversizedFrame {
            received: len,
            max: max_frame_bytes,
        });
    }
    if src.len() < 4 + len {
        // Reserve for the rest of the frame so follow-up reads don't thrash.
        src.reserve(4 + len - src.len());
        return Ok(None);
    }
    src.advance(4);
    Ok(Some(src.split_to(len).freeze()))
}

impl Decoder for DownstreamCodec {
    type Item = ClientMessage;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientMessage>> {
        if self.at_stream_start {
            match haproxy::probe(src)? {
                Probe::Incomplete => return Ok(None),
                Probe::NotPresent => self.at_stream_start = false,
                Probe::Preamble(preamble) => {
                    self.at_stream_start = false;
                    return Ok(Some(ClientMessage::Preamble(preamble)));
                }
            }
        }
        let Some(raw) = decode_length_prefixed(src, self.max_frame_bytes)? else {
            return Ok(None);
        };
        let frame = OpaqueRequestFrame::peek(raw)?;
        Ok(Some(ClientMessage::Request(RequestFrame::Opaque(frame))))
    }
}

impl Encoder<ResponseFrame> for DownstreamCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: ResponseFrame, dst: &mut BytesMut) -> Result<()> {
        encode_response(frame, dst)
    }
}

pub(crate) fn encode_response(frame: ResponseFrame, dst: &mut BytesMut) -> Result<()> {
    match frame {
        ResponseFrame::Opaque(f) => {
            dst.reserve(4 + f.raw.len());
            dst.put_i32(f.raw.len() as i32);
            dst.extend_from_slice(&f.raw);
        }
        ResponseFrame::Decoded(f) => {
            let key = ApiKey::try_from(f.api_key).map_err(|_| {
                ProxyError::ProtocolViolation(format!("unknown api key {}", f.api_key))
            })?;
            let start = dst.len();
            dst.put_i32(0);
            f.header
                .encode(dst, key.response_header_version(f.api_version))
                .map_err(anyhow::Error::from)?;
            f.body
                .encode(dst, f.api_version)
                .map_err(anyhow::Error::from)?;
            let len = (dst.len() - start - 4) as i32;
            dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
        }
    }
    Ok(())
}

/// A response frame as read off the broker socket: correlation id peeked,
/// everything else raw until the correlation map tells us what it is.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub correlation_id: i32,
    pub raw: Bytes,
}

/// Encodes requests to the broker, decodes its responses.
pub struct UpstreamCodec {
    max_frame_bytes: usize,
}

impl UpstreamCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Decoder for UpstreamCodec {
    type Item = RawResponse;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawResponse>> {
        let Some(raw) = decode_length_prefixed(src, self.max_frame_bytes)? else {
            return Ok(None);
        };
        if raw.len() < 4 {
            return Err(ProxyError::ProtocolViolation(format!(
                "response frame of {} bytes is shorter than a response header",
                raw.len()
            )));
        }
        let correlation_id = raw.clone().peek_bytes(0..4).get_i32();
        Ok(Some(RawResponse {
            correlation_id,
            raw,
        }))
    }
}

impl Encoder<RequestFrame> for UpstreamCodec {
    type Error = ProxyError;

    fn encode(&mut self, frame: RequestFrame, dst: &mut BytesMut) -> Result<()> {
        match frame {
            RequestFrame::Opaque(f) => {
                dst.reserve(4 + f.raw.len());
                dst.put_i32(f.raw.len() as i32);
                dst.extend_from_slice(&f.raw);
            }
            RequestFrame::Decoded(f) => {
                let key = ApiKey::try_from(f.api_key).map_err(|_| {
                    ProxyError::ProtocolViolation(format!("unknown api key {}", f.api_key))
                })?;
                let start = dst.len();
                dst.put_i32(0);
                f.header
                    .encode(dst, key.request_header_version(f.api_version))
                    .map_err(anyhow::Error::from)?;
                f.body
                    .encode(dst, f.api_version)
                    .map_err(anyhow::Error::from)?;
                let len = (dst.len() - start - 4) as i32;
                dst[start..start + 4].copy_from_slice(&len.to_be_bytes());
            }
        }
        Ok(())
    }
}
