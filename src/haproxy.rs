//! HA-Proxy protocol preamble parsing.
//!
//! A load balancer in front of the proxy may prepend a PROXY protocol v1
//! (text) or v2 (binary) header carrying the original client address. The
//! preamble appears at most once, as the very first bytes of the stream,
//! before any Kafka framing.

use bytes::{Buf, BytesMut};

use crate::error::{ProxyError, Result};
use crate::frame::{HaProxyPreamble, HaProxyVersion};

/// v2 signature: `\r\n\r\n\0\r\nQUIT\n`.
const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

const V1_PREFIX: &[u8] = b"PROXY ";

/// The protocol caps a v1 line at 107 bytes including CRLF.
const V1_MAX_LINE: usize = 107;

/// Result of probing the start of a stream for a PROXY preamble.
pub(crate) enum Probe {
    /// Not a PROXY preamble; the stream starts with Kafka framing.
    NotPresent,
    /// Could be a preamble but more bytes are needed to tell.
    Incomplete,
    /// A complete preamble was consumed from the buffer.
    Preamble(HaProxyPreamble),
}

/// Probe `buf` for a PROXY preamble, consuming it if complete.
pub(crate) fn probe(buf: &mut BytesMut) -> Result<Probe> {
    if buf.is_empty() {
        return Ok(Probe::Incomplete);
    }
    if buf[0] == V2_SIGNATURE[0] {
        return probe_v2(buf);
    }
    if buf[0] == V1_PREFIX[0] {
        return probe_v1(buf);
    }
    Ok(Probe::NotPresent)
}

fn probe_v2(buf: &mut BytesMut) -> Result<Probe> {
    let have = buf.len().min(V2_SIGNATURE.len());
    if buf[..have] != V2_SIGNATURE[..have] {
        return Ok(Probe::NotPresent);
    }
    // 16-byte fixed header: signature, version/command, family, length.
    if buf.len() < 16 {
        return Ok(Probe::Incomplete);
    }
    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 2 {
        return Err(ProxyError::ProtocolViolation(format!(
            "unsupported PROXY v2 version nibble {:#x}",
            ver_cmd >> 4
        )));
    }
    let family = buf[13];
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if buf.len() < 16 + addr_len {
        return Ok(Probe::Incomplete);
    }
    let mut header = buf.split_to(16 + addr_len);
    header.advance(16);

    // LOCAL command: addresses are unspecified, treat as absent endpoints.
    if ver_cmd & 0x0f == 0 {
        return Ok(Probe::Preamble(HaProxyPreamble {
            version: HaProxyVersion::V2,
            source_address: String::new(),
            source_port: 0,
            destination_address: String::new(),
            destination_port: 0,
        }));
    }

    let preamble = match family >> 4 {
        // AF_INET, stream or dgram
        1 => {
            if header.len() < 12 {
                return Err(ProxyError::ProtocolViolation(
                    "PROXY v2 INET address block truncated".into(),
                ));
            }
            let src = std::net::Ipv4Addr::new(header[0], header[1], header[2], header[3]);
            let dst = std::net::Ipv4Addr::new(header[4], header[5], header[6], header[7]);
            let src_port = u16::from_be_bytes([header[8], header[9]]);
            let dst_port = u16::from_be_bytes([header[10], header[11]]);
            HaProxyPreamble {
                version: HaProxyVersion::V2,
                source_address: src.to_string(),
                source_port: src_port,
                destination_address: dst.to_string(),
                destination_port: dst_port,
            }
        }
        // AF_INET6
        2 => {
            if header.len() < 36 {
                return Err(ProxyError::ProtocolViolation(
                    "PROXY v2 INET6 address block truncated".into(),
                ));
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&header[..16]);
            dst.copy_from_slice(&header[16..32]);
            let src_port = u16::from_be_bytes([header[32], header[33]]);
            let dst_port = u16::from_be_bytes([header[34], header[35]]);
            HaProxyPreamble {
                version: HaProxyVersion::V2,
                source_address: std::net::Ipv6Addr::from(src).to_string(),
                source_port: src_port,
                destination_address: std::net::Ipv6Addr::from(dst).to_string(),
                destination_port: dst_port,
            }
        }
        other => {
            return Err(ProxyError::ProtocolViolation(format!(
                "unsupported PROXY v2 address family {other:#x}"
            )));
        }
    };
    Ok(Probe::Preamble(preamble))
}

fn probe_v1(buf: &mut BytesMut) -> Result<Probe> {
    let have = buf.len().min(V1_PREFIX.len());
    if buf[..have] != V1_PREFIX[..have] {
        return Ok(Probe::NotPresent);
    }
    let Some(end) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > V1_MAX_LINE {
            return Err(ProxyError::ProtocolViolation(
                "PROXY v1 line exceeds 107 bytes".into(),
            ));
        }
        return Ok(Probe::Incomplete);
    };
    let line = buf.split_to(end + 1);
    let text = std::str::from_utf8(&line[..end])
        .map_err(|_| ProxyError::ProtocolViolation("PROXY v1 line is not ASCII".into()))?
        .trim_end_matches('\r');

    // PROXY TCP4 <src> <dst> <srcport> <dstport>, or PROXY UNKNOWN.
    let mut parts = text.split(' ');
    let _proxy = parts.next();
    match parts.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => {
            return Ok(Probe::Preamble(HaProxyPreamble {
                version: HaProxyVersion::V1,
                source_address: String::new(),
                source_port: 0,
                destination_address: String::new(),
                destination_port: 0,
            }));
        }
        other => {
            return Err(ProxyError::ProtocolViolation(format!(
                "unsupported PROXY v1 protocol {other:?}"
            )));
        }
    }
    let (src, dst, src_port, dst_port) = match (
        parts.next(),
        parts.next(),
        parts.next().and_then(|p| p.parse::<u16>().ok()),
        parts.next().and_then(|p| p.parse::<u16>().ok()),
    ) {
        (Some(src), Some(dst), Some(sp), Some(dp)) => (src, dst, sp, dp),
        _ => {
            return Err(ProxyError::ProtocolViolation(
                "malformed PROXY v1 address fields".into(),
            ));
        }
    };
    Ok(Probe::Preamble(HaProxyPreamble {
        version: HaProxyVersion::V1,
        source_address: src.to_string(),
        source_port: src_port,
        destination_address: dst.to_string(),
        destination_port: dst_port,
    }))
}
