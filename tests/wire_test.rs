//! Wire-level behavior over raw sockets: split frame delivery, pipelined
//! requests answered in order, unknown opcodes, and framing violations.

mod common;

use bytes::{Buf, BufMut, BytesMut};
use common::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Build a framed request by hand
fn frame(api_key: i16, correlation_id: i32, body: &[u8]) -> Vec<u8> {
    let client_id = b"wire-test";
    let mut payload = BytesMut::new();
    payload.put_i16(api_key);
    payload.put_i16(0);
    payload.put_i32(correlation_id);
    payload.put_i16(client_id.len() as i16);
    payload.put_slice(client_id);
    payload.put_slice(body);

    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as i32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

async fn read_response(stream: &mut TcpStream) -> (i32, BytesMut) {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length).await.unwrap();
    let length = i32::from_be_bytes(length) as usize;
    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await.unwrap();
    let mut payload = BytesMut::from(&payload[..]);
    let correlation_id = payload.get_i32();
    (correlation_id, payload)
}

/// `topics` request body is empty; its response is an array of strings
fn topics_body() -> Vec<u8> {
    Vec::new()
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let node = spawn_solo(512 * 1024 * 1024, 4096);
    let mut client = node.client().await;
    client.ensure_topic("split").await.unwrap();
    drop(client);

    let mut stream = TcpStream::connect(node.addr).await.unwrap();
    let request = frame(1000, 7, &topics_body());

    // Dribble the frame in three pieces; the server buffers partial bytes
    for chunk in request.chunks(5) {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (correlation_id, mut body) = read_response(&mut stream).await;
    assert_eq!(correlation_id, 7);
    let count = body.get_i32();
    assert_eq!(count, 1);
    let len = body.get_i16() as usize;
    assert_eq!(&body[..len], b"split");
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let node = spawn_solo(512 * 1024 * 1024, 4096);

    let mut stream = TcpStream::connect(node.addr).await.unwrap();

    // ensure + topics + topics in a single write
    let mut ensure_body = BytesMut::new();
    ensure_body.put_i16(4);
    ensure_body.put_slice(b"pipe");

    let mut batch = Vec::new();
    batch.extend_from_slice(&frame(1002, 1, &ensure_body));
    batch.extend_from_slice(&frame(1000, 2, &topics_body()));
    batch.extend_from_slice(&frame(1000, 3, &topics_body()));
    stream.write_all(&batch).await.unwrap();

    // Replies come back strictly FIFO
    let (first, mut body) = read_response(&mut stream).await;
    assert_eq!(first, 1);
    assert_eq!(body.get_i16(), 0);

    let (second, _) = read_response(&mut stream).await;
    assert_eq!(second, 2);
    let (third, mut body) = read_response(&mut stream).await;
    assert_eq!(third, 3);
    let count = body.get_i32();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_unknown_opcode_answers_with_error_code() {
    let node = spawn_solo(512 * 1024 * 1024, 4096);

    let mut stream = TcpStream::connect(node.addr).await.unwrap();
    stream.write_all(&frame(999, 5, &[])).await.unwrap();

    let (correlation_id, mut body) = read_response(&mut stream).await;
    assert_eq!(correlation_id, 5);
    assert_eq!(body.get_i16(), -1);

    // The connection survives; a valid request still works
    stream.write_all(&frame(1000, 6, &topics_body())).await.unwrap();
    let (correlation_id, _) = read_response(&mut stream).await;
    assert_eq!(correlation_id, 6);
}

#[tokio::test]
async fn test_negative_frame_length_closes_connection() {
    let node = spawn_solo(512 * 1024 * 1024, 4096);

    let mut stream = TcpStream::connect(node.addr).await.unwrap();
    stream.write_all(&(-5i32).to_be_bytes()).await.unwrap();

    // The server drops the connection without a reply
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("server should close the connection")
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_fetch_response_bytes_match_inline_parse() {
    // The scatter/gather path (headers inline, record sets via file ranges)
    // must produce bytes a plain decoder can parse
    let node = spawn_solo(512 * 1024 * 1024, 4096);
    let mut client = node.client().await;
    client.ensure_topic("t").await.unwrap();
    client
        .produce(
            "t",
            0,
            vec![bytes::Bytes::from_static(b"a"), bytes::Bytes::from_static(b"b")],
        )
        .await
        .unwrap();
    drop(client);

    let mut stream = TcpStream::connect(node.addr).await.unwrap();
    let mut body = BytesMut::new();
    body.put_i32(-1); // replica_id
    body.put_i32(0); // max_wait
    body.put_i32(0); // min_bytes
    body.put_i32(1); // one topic
    body.put_i16(1);
    body.put_slice(b"t");
    body.put_i32(1); // one partition
    body.put_i32(0); // partition id
    body.put_i64(0); // offset
    body.put_i32(1 << 20); // max_bytes
    stream.write_all(&frame(1, 11, &body)).await.unwrap();

    let (correlation_id, mut payload) = read_response(&mut stream).await;
    assert_eq!(correlation_id, 11);

    assert_eq!(payload.get_i32(), 1); // topic count
    let len = payload.get_i16() as usize;
    assert_eq!(&payload[..len], b"t");
    payload.advance(len);
    assert_eq!(payload.get_i32(), 1); // partition count
    assert_eq!(payload.get_i32(), 0); // partition id
    assert_eq!(payload.get_i16(), 0); // error
    assert_eq!(payload.get_i64(), 1); // high-water mark
    let set_size = payload.get_i32() as usize;
    assert_eq!(payload.len(), set_size);

    // First record frame: offset 0, length 2 (attribute byte + "a")
    assert_eq!(payload.get_i64(), 0);
    assert_eq!(payload.get_i32(), 2);
    assert_eq!(payload.get_u8(), 0);
    assert_eq!(payload.get_u8(), b'a');
}
