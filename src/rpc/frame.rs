//! Wire frames
//!
//! Every frame is a 4-byte big-endian length followed by a JSON object
//! tagged by `type`:
//!
//! ```text
//! +----------------+------------------------------------------+
//! | length (u32 BE)| {"type": "call", "id": 7, "body": {...}} |
//! +----------------+------------------------------------------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use super::message::InterfaceTag;
use crate::config::constants::MAX_FRAME_SIZE;
use crate::error::RemoteError;

/// One unit on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// First frame a peer sends
    Login {
        username: String,
        password: String,
        interface: InterfaceTag,
        #[serde(rename = "avatarId")]
        avatar_id: String,
    },
    /// Login accepted
    Welcome {
        #[serde(rename = "avatarId")]
        avatar_id: String,
    },
    /// Login refused; the connection closes after this frame
    Denied { error: RemoteError },
    /// Request expecting an answer or failure with the same id
    Call { id: u64, body: Value },
    /// Request without a reply
    Notify { body: Value },
    /// Successful reply
    Answer { id: u64, result: Value },
    /// Failed reply
    Failure { id: u64, error: RemoteError },
}

/// Frame codec errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed JSON codec for [`Frame`]
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(len);
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(&frame)?;
        if payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_encode_layout() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Frame::Notify {
                    body: json!({"method": "ping"}),
                },
                &mut buf,
            )
            .unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(len, buf.len() - 4);
        let payload: Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(payload["type"], json!("notify"));
        assert_eq!(payload["body"]["method"], json!("ping"));
    }

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        let frame = Frame::Failure {
            id: 3,
            error: RemoteError::new(ErrorKind::UnknownComponent, "/f/x"),
        };
        codec.encode(frame.clone(), &mut encoded).unwrap();

        let mut src = BytesMut::from(&encoded[..6]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.extend_from_slice(&encoded[6..]);
        assert_eq!(codec.decode(&mut src).unwrap(), Some(frame));
        assert!(src.is_empty());
    }

    #[test]
    fn test_login_wire_format() {
        let json = json!({
            "type": "login",
            "username": "user",
            "password": "test",
            "interface": "worker-medium",
            "avatarId": "w1"
        });
        let frame: Frame = serde_json::from_value(json).unwrap();
        assert_eq!(
            frame,
            Frame::Login {
                username: "user".into(),
                password: "test".into(),
                interface: InterfaceTag::Worker,
                avatar_id: "w1".into(),
            }
        );
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_frame_size(16);
        let mut src = BytesMut::new();
        src.put_u32(17);
        src.put_slice(&[b' '; 17]);

        assert!(matches!(
            codec.decode(&mut src),
            Err(FrameError::TooLarge { len: 17, max: 16 })
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let mut codec = FrameCodec::new();
        let mut src = BytesMut::new();
        src.put_u32(7);
        src.put_slice(b"{broken");

        assert!(matches!(
            codec.decode(&mut src),
            Err(FrameError::Malformed(_))
        ));
    }
}
