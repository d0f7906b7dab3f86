//! Multi-segment message framing.
//!
//! Each frame is length-delimited and carries:
//!
//! ```text
//! [u32 segment count] ([u32 length][bytes])*
//! ```
//!
//! Segment 0 is the JSON-encoded [`Header`]. The remaining segments are opaque
//! payloads, split out as zero-copy [`Bytes`] views so the header can be
//! decoded without touching task data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::message::{Header, Message};
use crate::error::GridError;

/// Largest frame accepted from the network.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug)]
pub struct MessageCodec {
    frames: LengthDelimitedCodec,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

/// Split a frame into its segments without decoding any of them.
pub fn split_segments(mut frame: Bytes) -> Result<Vec<Bytes>, GridError> {
    if frame.remaining() < 4 {
        return Err(GridError::Protocol("frame too short for segment count".into()));
    }
    let count = frame.get_u32() as usize;
    let mut segments = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        if frame.remaining() < 4 {
            return Err(GridError::Protocol(format!("segment {} has no length", i)));
        }
        let len = frame.get_u32() as usize;
        if frame.remaining() < len {
            return Err(GridError::Protocol(format!(
                "segment {} truncated: {} of {} bytes",
                i,
                frame.remaining(),
                len
            )));
        }
        segments.push(frame.split_to(len));
    }
    if frame.has_remaining() {
        return Err(GridError::Protocol(format!(
            "{} trailing bytes after last segment",
            frame.remaining()
        )));
    }
    Ok(segments)
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = GridError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, GridError> {
        let Some(frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        let mut segments = split_segments(frame.freeze())?;
        if segments.is_empty() {
            return Err(GridError::Protocol("message without header".into()));
        }
        let header: Header = serde_json::from_slice(&segments.remove(0))?;
        Ok(Some(Message { header, segments }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = GridError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), GridError> {
        let header = serde_json::to_vec(&msg.header)?;
        let body_len = 4
            + 4
            + header.len()
            + msg.segments.iter().map(|s| 4 + s.len()).sum::<usize>();
        let mut body = BytesMut::with_capacity(body_len);
        body.put_u32((msg.segments.len() + 1) as u32);
        body.put_u32(header.len() as u32);
        body.put_slice(&header);
        for segment in &msg.segments {
            body.put_u32(segment.len() as u32);
            body.put_slice(segment);
        }
        self.frames.encode(body.freeze(), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::ResultHeader;
    use uuid::Uuid;

    #[test]
    fn header_and_segments_survive_framing() {
        let mut codec = MessageCodec::new();
        let msg = Message::with_segments(
            Header::Result(ResultHeader::new(Uuid::new_v4(), 3)),
            vec![Bytes::from_static(b"data"), Bytes::new(), Bytes::from_static(b"task")],
        );
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = MessageCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Message::new(Header::Notification {
                    accepting_new_jobs: false,
                }),
                &mut full,
            )
            .unwrap();
        let mut partial = full.split_to(full.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn truncated_segment_is_a_protocol_error() {
        let mut body = BytesMut::new();
        body.put_u32(1);
        body.put_u32(10);
        body.put_slice(b"abc");
        assert!(matches!(
            split_segments(body.freeze()),
            Err(GridError::Protocol(_))
        ));
    }

    #[test]
    fn invalid_header_is_a_serialization_error() {
        let mut body = BytesMut::new();
        body.put_u32(1);
        body.put_u32(3);
        body.put_slice(b"{x}");
        let mut framed = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(body.freeze(), &mut framed)
            .unwrap();
        assert!(matches!(
            MessageCodec::new().decode(&mut framed),
            Err(GridError::Serialization(_))
        ));
    }
}
