//! Length-prefixed framing shared by the blocking client and the async server.
//!
//! ```text
//! ┌──────────────────┬────────────────────┬───────────────────┐
//! │ Length (4 bytes) │ Sequence (8 bytes) │ Payload           │
//! │ Big-endian u32   │ Big-endian u64     │ codec output      │
//! └──────────────────┴────────────────────┴───────────────────┘
//! ```
//!
//! The length covers the sequence and the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;

pub const LENGTH_LEN: usize = 4;
pub const SEQUENCE_LEN: usize = 8;
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub fn encode_frame(sequence: u64, payload: &[u8]) -> Result<BytesMut, TransportError> {
    let len = SEQUENCE_LEN + payload.len();
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_LEN + len);
    buf.put_u32(len as u32);
    buf.put_u64(sequence);
    buf.put_slice(payload);
    Ok(buf)
}

/// Split one complete frame off the front of `buf`, if there is one
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<(u64, Bytes)>, TransportError> {
    if buf.len() < LENGTH_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len < SEQUENCE_LEN {
        return Err(TransportError::InvalidFrame(format!(
            "length {len} is shorter than the sequence field"
        )));
    }
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    if buf.len() < LENGTH_LEN + len {
        buf.reserve(LENGTH_LEN + len - buf.len());
        return Ok(None);
    }

    buf.advance(LENGTH_LEN);
    let sequence = buf.get_u64();
    let payload = buf.split_to(len - SEQUENCE_LEN).freeze();
    Ok(Some((sequence, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frames_wait_for_more_bytes() {
        let frame = encode_frame(7, b"hello").unwrap();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..6]);
        assert!(decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[6..]);
        let (sequence, payload) = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(sequence, 7);
        assert_eq!(&payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = encode_frame(1, b"a").unwrap();
        buf.extend_from_slice(&encode_frame(2, b"bc").unwrap());

        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().0, 1);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().0, 2);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_invalid_lengths() {
        let mut short = BytesMut::from(&[0u8, 0, 0, 3, 1, 2, 3][..]);
        assert!(matches!(
            decode_frame(&mut short),
            Err(TransportError::InvalidFrame(_))
        ));

        let mut huge = BytesMut::new();
        huge.put_u32(u32::MAX);
        assert!(matches!(
            decode_frame(&mut huge),
            Err(TransportError::FrameTooLarge(_))
        ));
    }
}
