//! Wire framing over an in-memory duplex stream.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Framed;
use uuid::Uuid;

use gridlite::error::GridError;
use gridlite::policy::SystemInfo;
use gridlite::transport::codec::MAX_FRAME_LENGTH;
use gridlite::transport::message::{DispatchHeader, HandshakeInfo, ResultHeader};
use gridlite::transport::{Header, Message, MessageCodec};

#[tokio::test]
async fn messages_cross_a_stream_in_order() {
    let (a, b) = tokio::io::duplex(1024);
    let mut left = Framed::new(a, MessageCodec::new());
    let mut right = Framed::new(b, MessageCodec::new());

    let job_uuid = Uuid::new_v4();
    let dispatch = Message::with_segments(
        Header::Dispatch(DispatchHeader {
            job_uuid,
            bundle_id: 1,
            job_name: "render".to_string(),
            positions: vec![0, 1],
            metadata: Default::default(),
            uuid_path: vec!["driver-1".to_string()],
        }),
        // larger than the duplex buffer, so the frame arrives in pieces
        vec![Bytes::from(vec![7u8; 4096]), Bytes::from_static(b"echo a"), Bytes::from_static(b"echo b")],
    );
    let handshake = Message::new(Header::Handshake(HandshakeInfo {
        node_uuid: "node-1".to_string(),
        system_info: SystemInfo::new().with("cpu.cores", 8),
        accepting_new_jobs: true,
        ..Default::default()
    }));

    let sent = vec![dispatch.clone(), handshake.clone()];
    let writer = tokio::spawn(async move {
        for message in sent {
            left.send(message).await.unwrap();
        }
        left
    });

    assert_eq!(right.next().await.unwrap().unwrap(), dispatch);
    assert_eq!(right.next().await.unwrap().unwrap(), handshake);
    let left = writer.await.unwrap();
    drop(left);
    assert!(right.next().await.is_none());
}

#[tokio::test]
async fn result_segments_keep_their_boundaries() {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let mut left = Framed::new(a, MessageCodec::new());
    let mut right = Framed::new(b, MessageCodec::new());

    let mut header = ResultHeader::new(Uuid::new_v4(), 9);
    header.node_elapsed_ms = Some(12);
    let results = vec![Bytes::new(), Bytes::from_static(b"{\"exit_code\":0}"), Bytes::new()];
    left.send(Message::with_segments(Header::Result(header.clone()), results.clone()))
        .await
        .unwrap();

    let received = right.next().await.unwrap().unwrap();
    assert_eq!(received.header, Header::Result(header));
    assert_eq!(received.segments, results);
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let (mut a, b) = tokio::io::duplex(64);
    let mut right = Framed::new(b, MessageCodec::new());

    a.write_all(&((MAX_FRAME_LENGTH as u32) + 1).to_be_bytes()).await.unwrap();
    let err = right.next().await.unwrap().unwrap_err();
    assert!(matches!(err, GridError::Io(_)), "unexpected error: {}", err);
}

#[tokio::test]
async fn frame_without_segments_is_rejected() {
    let (mut a, b) = tokio::io::duplex(64);
    let mut right = Framed::new(b, MessageCodec::new());

    let mut frame = BytesMut::new();
    frame.put_u32(4);
    frame.put_u32(0);
    a.write_all(&frame).await.unwrap();
    let err = right.next().await.unwrap().unwrap_err();
    assert!(matches!(err, GridError::Protocol(_)), "unexpected error: {}", err);
}
