// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Loopback exercises of the protocol client against a real `tokio::net`
//! socket rather than a mock transport (§8 scenarios 6 and 7).

use std::time::Duration;

use infrasonar_probe::protocol::{
    Package, ProtocolClient, ProtocolError,
    package::{REQ_ANNOUNCE, RESPONSE_BIT},
};
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

async fn read_one_frame(stream: &mut TcpStream) -> Package {
    let mut header = [0u8; Package::HEADER_SIZE];
    stream.read_exact(&mut header).await.expect("read header");
    let (total, partial) = Package::parse_header(&header).expect("parse header");

    let mut body = vec![0u8; total - Package::HEADER_SIZE];
    stream.read_exact(&mut body).await.expect("read body");

    let mut full = header.to_vec();
    full.extend_from_slice(&body);
    partial.extract_body(&full).map(|data| partial.into_package(data)).expect("decode body")
}

async fn write_response(stream: &mut TcpStream, pid: u16, tp: u8, data: serde_json::Value) {
    let mut pkg = Package::make(tp | RESPONSE_BIT, 0, data);
    pkg.pid = pid;
    let bytes = pkg.to_bytes().expect("encode");
    stream.write_all(&bytes).await.expect("write response");
}

#[tokio::test]
async fn requests_resolve_even_when_responses_arrive_out_of_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(read_one_frame(&mut stream).await);
        }

        // Respond in reverse order of arrival.
        for pkg in received.into_iter().rev() {
            write_response(&mut stream, pkg.pid, pkg.tp, json!({ "echo": pkg.data })).await;
        }

        // Keep the connection open until the client is done with it.
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let (push_tx, _push_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let client = ProtocolClient::connect("127.0.0.1", addr.port(), cancel, push_tx)
        .await
        .expect("connect");

    let mut handles = Vec::new();
    for i in 0..3 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let pkg = Package::make(REQ_ANNOUNCE, 0, json!({ "seq": i }));
            client.request(pkg, Some(Duration::from_secs(5))).await
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let result = handle.await.expect("join").expect("request should resolve");
        assert_eq!(result, json!({ "echo": { "seq": i } }));
    }

    server.await.expect("server task");
}

#[tokio::test]
async fn pending_requests_fail_with_disconnected_when_transport_drops() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        // Read the requests but never answer, then drop the connection.
        for _ in 0..2 {
            read_one_frame(&mut stream).await;
        }
        drop(stream);
    });

    let (push_tx, _push_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let client = ProtocolClient::connect("127.0.0.1", addr.port(), cancel, push_tx)
        .await
        .expect("connect");

    let mut handles = Vec::new();
    for i in 0..2 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let pkg = Package::make(REQ_ANNOUNCE, 0, json!({ "seq": i }));
            client.request(pkg, Some(Duration::from_secs(30))).await
        }));
    }

    for handle in handles {
        let result = handle.await.expect("join");
        assert!(matches!(result, Err(ProtocolError::Disconnected)));
    }

    server.await.expect("server task");
}

#[tokio::test]
async fn request_times_out_when_no_response_arrives() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        read_one_frame(&mut stream).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let (push_tx, _push_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let client = ProtocolClient::connect("127.0.0.1", addr.port(), cancel, push_tx)
        .await
        .expect("connect");

    let pkg = Package::make(REQ_ANNOUNCE, 0, json!({}));
    let result = client.request(pkg, Some(Duration::from_millis(100))).await;
    assert!(matches!(result, Err(ProtocolError::Timeout)));

    server.abort();
}
