//! Cluster Wire Protocol
//!
//! Opcode-prefixed frames, all integers big-endian:
//!
//! ```text
//! 0x00 NOP
//! 0x01 NEW  sticky_id:u64 | client_len:u8 (4|16) | client
//!           | backend_len:u8 (4|16, or 0x42 = none) | backend | port:u16
//! ```
//!
//! Uses Sans-IO pattern: `encode_frame`/`decode_frame` work on byte buffers,
//! `read_frame` only adds socket reads around the same parser.

use crate::domain::entities::StickyMessage;
use bytes::{Buf, BufMut, BytesMut};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const OP_NOP: u8 = 0x00;
pub const OP_NEW: u8 = 0x01;

/// Backend length byte meaning "no backend assigned".
pub const NO_BACKEND: u8 = 0x42;

/// Largest NEW payload: 8 + 1 + 16 + 1 + 16 + 2.
pub const MAX_PAYLOAD_LEN: usize = 44;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("invalid address length {0}")]
    InvalidAddressLength(u8),

    #[error("connection closed mid-frame")]
    Truncated,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Nop,
    New(StickyMessage),
}

fn put_ip(dst: &mut BytesMut, ip: &IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            dst.put_u8(4);
            dst.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            dst.put_u8(16);
            dst.put_slice(&v6.octets());
        }
    }
}

/// Append the encoding of `frame` to `dst`.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Nop => dst.put_u8(OP_NOP),
        Frame::New(msg) => {
            dst.reserve(1 + MAX_PAYLOAD_LEN);
            dst.put_u8(OP_NEW);
            dst.put_u64(msg.sticky_id);
            put_ip(dst, &msg.client);
            match &msg.backend {
                Some(backend) => {
                    put_ip(dst, &backend.ip());
                    dst.put_u16(backend.port());
                }
                None => dst.put_u8(NO_BACKEND),
            }
        }
    }
}

fn check_addr_len(len: u8) -> Result<usize, ProtocolError> {
    match len {
        4 | 16 => Ok(len as usize),
        other => Err(ProtocolError::InvalidAddressLength(other)),
    }
}

fn ip_from_bytes(raw: &[u8]) -> IpAddr {
    if raw.len() == 4 {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(raw);
        IpAddr::V4(Ipv4Addr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(raw);
        IpAddr::V6(Ipv6Addr::from(octets))
    }
}

/// Decode one frame from the front of `src`.
///
/// Returns `Ok(None)` and consumes nothing while the frame is incomplete.
/// An invalid length byte is reported as soon as it is visible.
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(&opcode) = src.first() else {
        return Ok(None);
    };
    match opcode {
        OP_NOP => {
            src.advance(1);
            Ok(Some(Frame::Nop))
        }
        OP_NEW => decode_new(src),
        other => Err(ProtocolError::UnknownOpcode(other)),
    }
}

fn decode_new(src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    // opcode + sticky id
    let mut need = 1 + 8 + 1;
    if src.len() < need {
        return Ok(None);
    }
    let client_len = check_addr_len(src[need - 1])?;
    need += client_len + 1;
    if src.len() < need {
        return Ok(None);
    }
    let backend_marker = src[need - 1];
    let backend_len = if backend_marker == NO_BACKEND {
        None
    } else {
        let len = check_addr_len(backend_marker)?;
        need += len + 2;
        Some(len)
    };
    if src.len() < need {
        return Ok(None);
    }

    let mut frame = src.split_to(need);
    frame.advance(1);
    let sticky_id = frame.get_u64();
    frame.advance(1);
    let client = ip_from_bytes(&frame[..client_len]);
    frame.advance(client_len + 1);
    let backend = backend_len.map(|len| {
        let ip = ip_from_bytes(&frame[..len]);
        frame.advance(len);
        SocketAddr::new(ip, frame.get_u16())
    });

    Ok(Some(Frame::New(StickyMessage::new(sticky_id, client, backend))))
}

/// Read the next frame, buffering partial input in `buf`.
///
/// Returns `Ok(None)` on a clean end of stream between frames. Dropping the
/// returned future loses no data: bytes read so far stay in `buf`.
pub async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decode_frame(buf)? {
            return Ok(Some(frame));
        }
        if reader.read_buf(buf).await? == 0 {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(ProtocolError::Truncated)
            };
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn encode(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf);
        buf
    }

    fn new_frame(client: &str, backend: Option<&str>) -> Frame {
        Frame::New(StickyMessage::new(
            0x0102_0304_0506_0708,
            client.parse().unwrap(),
            backend.map(|b| b.parse().unwrap()),
        ))
    }

    // ===== Encoding Tests =====

    #[test]
    fn test_encode_nop() {
        assert_eq!(&encode(&Frame::Nop)[..], &[OP_NOP]);
    }

    #[test]
    fn test_encode_new_v4_v6_layout() {
        let buf = encode(&new_frame("10.0.0.1", Some("[2001:db8::7]:8443")));
        assert_eq!(buf.len(), 1 + 8 + 1 + 4 + 1 + 16 + 2);
        assert_eq!(buf[0], OP_NEW);
        assert_eq!(&buf[1..9], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(buf[9], 4);
        assert_eq!(&buf[10..14], &[10, 0, 0, 1]);
        assert_eq!(buf[14], 16);
        assert_eq!(&buf[31..33], &8443u16.to_be_bytes());
    }

    #[test]
    fn test_encode_disassociation_sentinel() {
        let buf = encode(&new_frame("10.0.0.1", None));
        assert_eq!(buf.len(), 1 + 8 + 1 + 4 + 1);
        assert_eq!(buf[14], NO_BACKEND);
    }

    #[test]
    fn test_largest_frame() {
        let buf = encode(&new_frame("::1", Some("[::2]:1")));
        assert_eq!(buf.len(), 1 + MAX_PAYLOAD_LEN);
    }

    // ===== Decoding Tests =====

    #[test]
    fn test_decode_v4_client_v6_backend() {
        let frame = new_frame("192.168.1.9", Some("[fe80::1]:65535"));
        let mut buf = encode(&frame);
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(frame));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_no_backend() {
        let frame = new_frame("2001:db8::1", None);
        let mut buf = encode(&frame);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        match decoded {
            Frame::New(msg) => assert!(msg.is_disassociation()),
            Frame::Nop => panic!("expected NEW"),
        }
    }

    #[test]
    fn test_decode_incomplete_consumes_nothing() {
        let full = encode(&new_frame("10.0.0.1", Some("10.0.0.2:80")));
        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert_eq!(decode_frame(&mut partial).unwrap(), None);
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::Nop, &mut buf);
        encode_frame(&new_frame("10.0.0.1", None), &mut buf);
        encode_frame(&Frame::Nop, &mut buf);

        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::Nop));
        assert!(matches!(decode_frame(&mut buf).unwrap(), Some(Frame::New(_))));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(Frame::Nop));
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_unknown_opcode() {
        let mut buf = BytesMut::from(&[0x07u8][..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ProtocolError::UnknownOpcode(0x07))
        ));
    }

    #[test]
    fn test_decode_bad_client_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_NEW);
        buf.put_u64(1);
        buf.put_u8(5);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ProtocolError::InvalidAddressLength(5))
        ));
    }

    #[test]
    fn test_decode_bad_backend_length() {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_NEW);
        buf.put_u64(1);
        buf.put_u8(4);
        buf.put_slice(&[1, 2, 3, 4]);
        buf.put_u8(8);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ProtocolError::InvalidAddressLength(8))
        ));
    }

    // ===== Stream Tests =====

    #[tokio::test]
    async fn test_read_frame_across_chunks() {
        let frame = new_frame("10.1.1.1", Some("10.2.2.2:8080"));
        let bytes = encode(&frame);
        let (mut tx, mut rx) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in bytes.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut buf = BytesMut::new();
        assert_eq!(read_frame(&mut rx, &mut buf).await.unwrap(), Some(frame));
        writer.await.unwrap();
        assert_eq!(read_frame(&mut rx, &mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let bytes = encode(&new_frame("10.1.1.1", None));
        let (mut tx, mut rx) = tokio::io::duplex(64);
        {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&bytes[..6]).await.unwrap();
        }
        drop(tx);

        let mut buf = BytesMut::new();
        assert!(matches!(
            read_frame(&mut rx, &mut buf).await,
            Err(ProtocolError::Truncated)
        ));
    }
}
