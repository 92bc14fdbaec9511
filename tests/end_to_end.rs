// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end coverage driving the capture pipeline the way `arkond`'s
//! worker loop does: decode a frame, run it through `Ingress`, hand TCP
//! payloads to the classifier/reassembly adapter, and round-trip the
//! resulting session through a fake indexer.

use std::{net::IpAddr, sync::Arc};

use arkon_capture::{
    classify::Classifier,
    drophash::DropHashGroup,
    fields::FieldValue,
    frame::{self, DecodedFrame},
    indexer::create_server,
    ingress::{FiveTuple, Ingress, IngressOutcome, Timeouts},
    orchestration,
    reassembly::ReassemblyAdapter,
    schema::SchemaRef,
    session::{Direction, Protocol, SessionId},
};
use tokio::net::TcpListener;

const ETHERNET_HEADER_LEN: usize = 14;

fn eth_ipv4_tcp(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_LEN];
    frame[12] = 0x08;
    frame[13] = 0x00;

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    let total_len = (20 + 20 + payload.len()) as u16;
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[9] = 6;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);

    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[12] = 5 << 4;

    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&tcp);
    frame.extend_from_slice(payload);
    frame
}

fn eth_ipv4_udp(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_LEN];
    frame[12] = 0x08;
    frame[13] = 0x00;

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    let total_len = (20 + 8 + payload.len()) as u16;
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[9] = 17;
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);

    let mut udp = vec![0u8; 8];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    let udp_len = (8 + payload.len()) as u16;
    udp[4..6].copy_from_slice(&udp_len.to_be_bytes());

    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&udp);
    frame.extend_from_slice(payload);
    frame
}

fn build_dns_query(name: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 12];
    buf[5] = 1;
    for label in name.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    buf.extend_from_slice(&[0, 1, 0, 1]);
    buf
}

/// Spins up a fake bulk indexer that accepts any number of `_bulk` POSTs
/// on the same persistent connection and always replies 200, the way a
/// real indexer would for a well-formed record.
async fn fake_indexer() -> Arc<arkon_capture::indexer::Server> {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            if !request.contains("\r\n\r\n") {
                continue;
            }
            let response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
            if socket.write_all(response).await.is_err() {
                return;
            }
        }
    });

    create_server(&[addr.ip().to_string()], addr.port(), 2, 100).expect("server")
}

#[tokio::test]
async fn http_get_session_extracts_fields_and_final_saves() {
    let schema = Arc::new(SchemaRef::build());
    let classifier = Classifier::with_schema(schema.clone());
    let drophash = DropHashGroup::init(4, None).expect("drophash");
    let indexer = fake_indexer().await;

    let mut ingress = Ingress::new(Timeouts::default(), 10_000, 0);
    let mut reassembly = ReassemblyAdapter::new();

    let request = eth_ipv4_tcp([10, 0, 0, 1], 5000, [10, 0, 0, 2], 80, b"GET /x HTTP/1.1\r\nHost: ex.com\r\n\r\n");
    let response = eth_ipv4_tcp([10, 0, 0, 2], 80, [10, 0, 0, 1], 5000, b"HTTP/1.1 200 OK\r\n\r\n");

    let id = SessionId::new(6, IpAddr::from([10, 0, 0, 1]), 5000, IpAddr::from([10, 0, 0, 2]), 80);

    for (raw, now) in [(&request, 0u32), (&response, 1u32)] {
        let DecodedFrame::Ip { tuple, payload } = frame::decode(raw) else {
            panic!("expected ip frame")
        };
        let (outcome, evicted) = ingress.process(&tuple, payload, now, &drophash, &classifier, 1, 0, raw.len() as u64);
        assert_eq!(outcome, IngressOutcome::Processed);
        assert!(evicted.is_empty());

        let session = ingress.table.find_mut(&id).expect("session exists");
        let dir = if (tuple.src_addr, tuple.src_port) == session.which_src {
            Direction::Src
        } else {
            Direction::Dst
        };
        reassembly.on_data(session, &classifier, dir, payload);
    }

    let session = ingress.table.find(&id).expect("session exists");
    assert_eq!(session.byte_count, (request.len() + response.len()) as u64);
    match session.fields.get(schema.ids.http_uri) {
        Some(FieldValue::StrHash(v)) => assert_eq!(v, &["//ex.com/x".to_string()]),
        other => panic!("unexpected http.uri: {other:?}"),
    }
    match session.fields.get(schema.ids.http_statuscode) {
        Some(FieldValue::StrArray(v)) => assert_eq!(v, &["200".to_string()]),
        other => panic!("unexpected http.statuscode: {other:?}"),
    }

    let owned = ingress.table.remove(&id).expect("remove");
    orchestration::final_save(owned, &schema.registry, &indexer, &mut reassembly, 2)
        .await
        .expect("final save");
    assert_eq!(reassembly.attached_session_count(), 0);
}

#[tokio::test]
async fn dns_query_populates_host_and_tags() {
    let schema = Arc::new(SchemaRef::build());
    let classifier = Classifier::with_schema(schema.clone());
    let drophash = DropHashGroup::init(4, None).expect("drophash");

    let mut ingress = Ingress::new(Timeouts::default(), 10_000, 0);
    let frame_bytes = eth_ipv4_udp([10, 0, 0, 1], 33333, [8, 8, 8, 8], 53, &build_dns_query("www.example.com"));

    let DecodedFrame::Ip { tuple, payload } = frame::decode(&frame_bytes) else {
        panic!("expected ip frame")
    };
    let (outcome, _evicted) = ingress.process(&tuple, payload, 0, &drophash, &classifier, 1, 0, frame_bytes.len() as u64);
    assert_eq!(outcome, IngressOutcome::Processed);

    let id = SessionId::new(17, IpAddr::from([10, 0, 0, 1]), 33333, IpAddr::from([8, 8, 8, 8]), 53);
    let session = ingress.table.find(&id).expect("session exists");
    match session.fields.get(schema.ids.host) {
        Some(FieldValue::StrHash(v)) => assert_eq!(v, &["www.example.com".to_string()]),
        other => panic!("unexpected host: {other:?}"),
    }
    match session.fields.get(schema.ids.tags) {
        Some(FieldValue::StrHash(v)) => assert!(v.contains(&"protocol:dns".to_string())),
        other => panic!("unexpected tags: {other:?}"),
    }
}

#[tokio::test]
async fn drop_hash_suppresses_matching_traffic_before_session_creation() {
    let schema = Arc::new(SchemaRef::build());
    let classifier = Classifier::with_schema(schema);
    let drophash = DropHashGroup::init(4, None).expect("drophash");
    drophash.add(5000, &[10, 0, 0, 1], 0, 3600);

    let mut ingress = Ingress::new(Timeouts::default(), 10_000, 0);
    let frame_bytes = eth_ipv4_tcp([10, 0, 0, 1], 5000, [10, 0, 0, 2], 80, b"GET / HTTP/1.1\r\n\r\n");
    let DecodedFrame::Ip { tuple, payload } = frame::decode(&frame_bytes) else {
        panic!("expected ip frame")
    };
    let (outcome, evicted) = ingress.process(&tuple, payload, 0, &drophash, &classifier, 1, 0, frame_bytes.len() as u64);
    assert_eq!(outcome, IngressOutcome::Dropped);
    assert!(evicted.is_empty());
    assert!(ingress.table.is_empty());
}

#[tokio::test]
async fn idle_tcp_session_is_evicted_and_can_be_final_saved() {
    let schema = Arc::new(SchemaRef::build());
    let classifier = Classifier::with_schema(schema.clone());
    let drophash = DropHashGroup::init(4, None).expect("drophash");
    let indexer = fake_indexer().await;
    let mut reassembly = ReassemblyAdapter::new();

    let timeouts = Timeouts {
        icmp_secs: None,
        udp_secs: 60,
        tcp_secs: 30,
        tcp_save_secs: 480,
    };
    let mut ingress = Ingress::new(timeouts, 10_000, 0);

    let frame_bytes = eth_ipv4_tcp([10, 0, 0, 1], 5000, [10, 0, 0, 2], 80, b"GET / HTTP/1.1\r\n\r\n");
    let DecodedFrame::Ip { tuple, payload } = frame::decode(&frame_bytes) else {
        panic!("expected ip frame")
    };
    let (outcome, _evicted) = ingress.process(&tuple, payload, 0, &drophash, &classifier, 1, 0, frame_bytes.len() as u64);
    assert_eq!(outcome, IngressOutcome::Processed);

    // A second, unrelated packet at t=40 drives the timeout sweep past the
    // first session's 30-second tcp timeout.
    let other = eth_ipv4_tcp([10, 0, 0, 3], 6000, [10, 0, 0, 4], 80, b"x");
    let DecodedFrame::Ip { tuple: other_tuple, payload: other_payload } = frame::decode(&other) else {
        panic!("expected ip frame")
    };
    let (_outcome, evicted) = ingress.process(&other_tuple, other_payload, 40, &drophash, &classifier, 1, 10, other.len() as u64);

    assert_eq!(evicted.len(), 1);
    for mut session in evicted {
        assert!(!orchestration::defer_final_save_for_outstanding_tags(&mut session));
        reassembly.save(&mut session, true);
        orchestration::final_save(session, &schema.registry, &indexer, &mut reassembly, 40)
            .await
            .expect("final save of evicted session");
    }
}
