use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::sleep;

use resplex::codec::FrameCodec;
use resplex::transport::TransportReader;
use resplex::{Command, Error, Frame, Transport};

/// The far end of an in-memory pipe. Whatever it sends is read back through a `TransportReader`,
/// and dropping it is a clean end of stream.
struct Peer(DuplexStream);

impl Peer {
    async fn send(&mut self, bytes: &[u8]) {
        self.0.write_all(bytes).await.unwrap();
    }
}

fn pipe_with(codec: FrameCodec) -> (Peer, TransportReader) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (reader, _writer) = Transport::new(near, "pipe".to_string(), codec).split();
    (Peer(far), reader)
}

fn pipe() -> (Peer, TransportReader) {
    pipe_with(FrameCodec::default())
}

#[tokio::test]
async fn test_read_simple_string() {
    let (mut peer, mut reader) = pipe();

    peer.send(b"+OK\r\n").await;

    let actual = reader.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::simple("OK")));
}

#[tokio::test]
async fn test_read_bulk_string_with_crlf_inside() {
    let (mut peer, mut reader) = pipe();

    peer.send(b"$7\r\nhel\r\nlo\r\n").await;

    let actual = reader.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::bulk("hel\r\nlo")));
}

#[tokio::test]
async fn test_read_nil_replies() {
    let (mut peer, mut reader) = pipe();

    peer.send(b"$-1\r\n*-1\r\n").await;

    assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::Bulk(None)));
    assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::Array(None)));
}

#[tokio::test]
async fn test_read_multiple_frames_sequentially() {
    let (mut peer, mut reader) = pipe();

    peer.send(b"+OK\r\n").await;
    peer.send(b"$5\r\nhello\r\n").await;
    peer.send(b"*2\r\n$3\r\nfoo\r\n:42\r\n").await;
    peer.send(b"-ERR unknown command\r\n").await;
    peer.send(b":1000\r\n").await;

    // Simple string.
    let actual = reader.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::simple("OK")));

    // Bulk string.
    let actual = reader.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::bulk("hello")));

    // Array.
    let actual = reader.read_frame().await.unwrap();
    assert_eq!(
        actual,
        Some(Frame::Array(Some(vec![
            Frame::Bulk(Some(Bytes::from("foo"))),
            Frame::Integer(42),
        ])))
    );

    // Simple error.
    let actual = reader.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::error("ERR unknown command")));

    // Integer.
    let actual = reader.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Integer(1000)));
}

#[tokio::test]
async fn test_read_incomplete_frame() {
    let (mut peer, mut reader) = pipe();

    // "*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n" split to simulate partial reads.
    let part1 = b"*3\r\n$3\r\nSE";
    let part2 = b"T\r\n$5\r\nmyke";
    let part3 = b"y\r\n$7\r\nmyvalue\r\n";

    tokio::spawn(async move {
        for part in [&part1[..], &part2[..], &part3[..]] {
            peer.send(part).await;
            sleep(Duration::from_millis(100)).await;
        }
    });

    let actual = reader.read_frame().await.unwrap();
    let expected = Some(Frame::Array(Some(vec![
        Frame::bulk("SET"),
        Frame::bulk("mykey"),
        Frame::bulk("myvalue"),
    ])));
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn test_read_clean_eof() {
    let (mut peer, mut reader) = pipe();

    peer.send(b":1\r\n").await;
    drop(peer);

    assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::Integer(1)));
    assert_eq!(reader.read_frame().await.unwrap(), None);
}

#[tokio::test]
async fn test_read_eof_inside_frame() {
    let (mut peer, mut reader) = pipe();

    peer.send(b"$10\r\nhel").await;
    drop(peer);

    let err = reader.read_frame().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_read_invalid_type_byte() {
    let (mut peer, mut reader) = pipe();

    peer.send(b"?oops\r\n").await;

    let err = reader.read_frame().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got {:?}", err);
    assert!(err.is_connection_fatal());
}

#[tokio::test]
async fn test_read_frame_over_limit() {
    let (mut peer, mut reader) = pipe_with(FrameCodec::new(16));

    peer.send(b"$64\r\n0123456789012345678901234567890").await;

    let err = reader.read_frame().await.unwrap_err();
    assert!(matches!(err, Error::FrameTooLarge(16)), "got {:?}", err);
}

#[tokio::test]
async fn test_write_command_and_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = listener.local_addr().unwrap();
    let (received_tx, received_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received_tx.send(received).unwrap();
    });

    let stream = TcpStream::connect(local_addr).await.unwrap();
    let (_reader, mut writer) =
        Transport::new(stream, local_addr.to_string(), FrameCodec::default()).split();

    writer
        .write_command(Command::new("SET").arg("key").arg("value"))
        .await
        .unwrap();
    writer.close().await.unwrap();
    // Closing twice is fine.
    writer.close().await.unwrap();
    assert!(writer.is_closed());

    let err = writer.write_command(Command::new("PING")).await.unwrap_err();
    assert!(matches!(err, Error::NotConnected));

    let received = received_rx.await.unwrap();
    assert_eq!(
        received,
        b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n".to_vec()
    );
}
