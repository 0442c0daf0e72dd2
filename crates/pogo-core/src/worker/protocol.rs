//! Worker wire protocol
//!
//! JSON messages over a 4-byte big-endian length prefix. Every task-related
//! message carries the dispatcher-assigned request id; the secret
//! side-channel (`fetch_secret`/`secret`) rides the same TLS session.

use crate::JobId;
use serde::{Deserialize, Serialize};

/// Monotonically increasing request id, scoped to a dispatcher
pub type ReqId = u64;

/// Protocol version advertised in `hello`
pub const PROTOCOL_VERSION: &str = "1";

/// Maximum frame size accepted on the wire
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Worker-to-dispatcher greeting, first message on a session
    Hello {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<u32>,
        version: String,
    },

    /// Dispatcher-to-worker task assignment
    Dispatch {
        req_id: ReqId,
        jobid: JobId,
        hostname: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_as: Option<String>,
        timeout: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password_ref: Option<String>,
    },

    /// Worker-to-dispatcher: task accepted
    Ack { req_id: ReqId },

    /// Worker-to-dispatcher progress report
    Update {
        req_id: ReqId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_url: Option<String>,
    },

    /// Worker-to-dispatcher final task result
    Result {
        req_id: ReqId,
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },

    /// Dispatcher-to-worker: stop a task, best effort
    Cancel { req_id: ReqId },

    /// Liveness probe, either direction
    Ping { seq: u64 },

    /// Liveness reply
    Pong { seq: u64 },

    /// Worker-to-dispatcher: redeem a password reference, once
    FetchSecret { req_id: ReqId },

    /// Dispatcher-to-worker: the secret, or nothing if already redeemed
    Secret {
        req_id: ReqId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
}

impl Message {
    /// Request id carried by the message, if any
    pub fn req_id(&self) -> Option<ReqId> {
        match self {
            Message::Dispatch { req_id, .. }
            | Message::Ack { req_id }
            | Message::Update { req_id, .. }
            | Message::Result { req_id, .. }
            | Message::Cancel { req_id }
            | Message::FetchSecret { req_id }
            | Message::Secret { req_id, .. } => Some(*req_id),
            Message::Hello { .. } | Message::Ping { .. } | Message::Pong { .. } => None,
        }
    }
}

mod bytes_codec {
    use super::{Message, MAX_FRAME_BYTES};
    use tokio_util::bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

    /// Length-prefixed JSON frames
    pub struct MessageCodec {
        inner: LengthDelimitedCodec,
    }

    impl MessageCodec {
        pub fn new() -> Self {
            Self {
                inner: LengthDelimitedCodec::builder()
                    .max_frame_length(MAX_FRAME_BYTES)
                    .new_codec(),
            }
        }
    }

    impl Default for MessageCodec {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Decoder for MessageCodec {
        type Item = Message;
        type Error = std::io::Error;

        fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, std::io::Error> {
            let frame = match self.inner.decode(src)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            let message = serde_json::from_slice(&frame)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(Some(message))
        }
    }

    impl Encoder<Message> for MessageCodec {
        type Error = std::io::Error;

        fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), std::io::Error> {
            let payload = serde_json::to_vec(&item)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            self.inner.encode(Bytes::from(payload), dst)
        }
    }
}

pub use bytes_codec::MessageCodec as Codec;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    #[test]
    fn test_message_tags() {
        let hello = Message::Hello {
            id: "w1".into(),
            capacity: Some(4),
            version: PROTOCOL_VERSION.into(),
        };
        let json = serde_json::to_string(&hello).unwrap();
        assert!(json.contains(r#""type":"hello""#));

        let result: Message =
            serde_json::from_str(r#"{"type":"result","req_id":7,"exit_code":0}"#).unwrap();
        assert_eq!(
            result,
            Message::Result {
                req_id: 7,
                exit_code: 0,
                message: None,
                duration_ms: None,
            }
        );
    }

    #[test]
    fn test_dispatch_carries_reference_not_password() {
        let dispatch = Message::Dispatch {
            req_id: 1,
            jobid: crate::JobId::from_seq(1),
            hostname: "web1".into(),
            command: "uptime".into(),
            run_as: None,
            timeout: 30,
            password_ref: Some("ref-abc".into()),
        };
        let json = serde_json::to_string(&dispatch).unwrap();
        assert!(json.contains("password_ref"));
        assert!(!json.contains(r#""password""#));
    }

    #[test]
    fn test_codec_roundtrip_and_partial_frames() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::new();

        codec.encode(Message::Ping { seq: 3 }, &mut buf).unwrap();
        let frame: Vec<u8> = buf.to_vec();

        // One byte short: no message yet
        let mut partial = BytesMut::from(&frame[..frame.len() - 1]);
        let mut decoder = Codec::new();
        assert_eq!(decoder.decode(&mut partial).unwrap(), None);

        // The final byte completes the frame
        partial.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(
            decoder.decode(&mut partial).unwrap(),
            Some(Message::Ping { seq: 3 })
        );
        assert_eq!(decoder.decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn test_garbage_frame_is_invalid_data() {
        let mut inner = tokio_util::codec::LengthDelimitedCodec::new();
        let mut buf = BytesMut::new();
        inner
            .encode(tokio_util::bytes::Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        let mut decoder = Codec::new();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
