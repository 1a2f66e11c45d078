//! Framing. Control messages: 4-byte BE length + bincode payload.
//! File frames: 4-byte BE length + UTF-8 JSON `FileMeta`, followed by the raw payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::FileMeta;

pub const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Upper bound on a file frame's JSON header.
pub const MAX_META_LEN: u32 = 64 * 1024;

/// Encode a message into a single frame: 4 bytes BE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg: T =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((msg, LEN_SIZE + len))
}

/// Validate a control frame length prefix.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

/// Encode a file frame header: length prefix + JSON metadata. The payload is written separately.
pub fn encode_meta(meta: &FileMeta) -> Result<Vec<u8>, MetaError> {
    validate_name(&meta.name)?;
    let json = serde_json::to_vec(meta)?;
    let len = u32::try_from(json.len()).map_err(|_| MetaError::TooLarge(u32::MAX))?;
    if len > MAX_META_LEN {
        return Err(MetaError::TooLarge(len));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + json.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&json);
    Ok(out)
}

/// Validate a metadata length prefix.
pub fn meta_len(prefix: [u8; LEN_SIZE]) -> Result<usize, MetaError> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_META_LEN {
        return Err(MetaError::TooLarge(len));
    }
    Ok(len as usize)
}

/// Parse the JSON metadata block (without its length prefix).
pub fn decode_meta(bytes: &[u8]) -> Result<FileMeta, MetaError> {
    let meta: FileMeta = serde_json::from_slice(bytes)?;
    validate_name(&meta.name)?;
    let Some(end) = meta.offset.checked_add(meta.size) else {
        return Err(MetaError::Overflow {
            offset: meta.offset,
            size: meta.size,
        });
    };
    if let Some(total) = meta.total {
        if end > total {
            return Err(MetaError::BadRange {
                offset: meta.offset,
                size: meta.size,
                total,
            });
        }
    }
    Ok(meta)
}

/// A file name must be a single path component.
pub fn validate_name(name: &str) -> Result<(), MetaError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if bad {
        return Err(MetaError::BadName(name.to_string()));
    }
    Ok(())
}

/// Error in a file frame header.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata length {0} exceeds limit")]
    TooLarge(u32),
    #[error("unsafe file name {0:?}")]
    BadName(String),
    #[error("payload range {offset}+{size} exceeds total {total}")]
    BadRange { offset: u64, size: u64, total: u64 },
    #[error("payload range {offset}+{size} overflows")]
    Overflow { offset: u64, size: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocol::{DeviceClass, Message, PROTOCOL_VERSION, SERVICE_TYPE};

    fn sample_announce() -> Message {
        let kp = Keypair::generate();
        Message::Announce {
            protocol_version: PROTOCOL_VERSION,
            service: SERVICE_TYPE.to_string(),
            device_id: kp.device_id(),
            public_key: kp.public_key().clone(),
            display_name: "DeskA".to_string(),
            device_class: DeviceClass::Desktop,
            fingerprint: kp.public_key().fingerprint(),
            listen_port: 45679,
            host: None,
        }
    }

    #[test]
    fn roundtrip_announce() {
        let msg = sample_announce();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n): (Message, usize) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let frame = encode_frame(&Message::Heartbeat {
            device_id: Keypair::generate().device_id(),
        })
        .unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - LEN_SIZE);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_announce()).unwrap();
        assert!(matches!(
            decode_frame::<Message>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<Message>(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let bytes = (MAX_FRAME_LEN + 1).to_be_bytes();
        assert!(matches!(
            decode_frame::<Message>(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn multiple_messages() {
        let a = sample_announce();
        let b = Message::Heartbeat {
            device_id: Keypair::generate().device_id(),
        };
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1): (Message, usize) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2): (Message, usize) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Message::Announce { .. }));
        assert!(matches!(m2, Message::Heartbeat { .. }));
    }

    #[test]
    fn meta_header_bytes() {
        let header = encode_meta(&FileMeta::new("a.txt", 5)).unwrap();
        let json = br#"{"name":"a.txt","size":5}"#;
        assert_eq!(&header[..4], &(json.len() as u32).to_be_bytes());
        assert_eq!(&header[4..], json);
        let len = meta_len([header[0], header[1], header[2], header[3]]).unwrap();
        assert_eq!(decode_meta(&header[4..4 + len]).unwrap(), FileMeta::new("a.txt", 5));
    }

    #[test]
    fn meta_rejects_path_names() {
        for name in ["", ".", "..", "../etc/passwd", "dir/file", "c:\\x"] {
            assert!(encode_meta(&FileMeta::new(name, 1)).is_err(), "{name}");
        }
        assert!(matches!(
            decode_meta(br#"{"name":"../x","size":1}"#),
            Err(MetaError::BadName(_))
        ));
    }

    #[test]
    fn meta_rejects_range_past_total() {
        let err = decode_meta(br#"{"name":"x","size":10,"offset":5,"total":12}"#).unwrap_err();
        assert!(matches!(err, MetaError::BadRange { .. }));
    }

    #[test]
    fn meta_rejects_overflowing_range() {
        let err = decode_meta(br#"{"name":"x","size":2,"offset":18446744073709551615}"#).unwrap_err();
        assert!(matches!(err, MetaError::Overflow { .. }));
        let err = decode_meta(
            br#"{"name":"x","size":18446744073709551615,"offset":1,"total":18446744073709551615}"#,
        )
        .unwrap_err();
        assert!(matches!(err, MetaError::Overflow { .. }));
        let tail = decode_meta(br#"{"name":"x","size":2,"offset":18446744073709551613}"#).unwrap();
        assert_eq!(tail.total(), u64::MAX);
    }

    #[test]
    fn meta_missing_size_is_error() {
        assert!(matches!(
            decode_meta(br#"{"name":"x"}"#),
            Err(MetaError::Json(_))
        ));
    }

    #[test]
    fn meta_len_limit() {
        assert!(meta_len((MAX_META_LEN + 1).to_be_bytes()).is_err());
        assert_eq!(meta_len(16u32.to_be_bytes()).unwrap(), 16);
    }
}
