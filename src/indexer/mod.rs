// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bulk indexer client (C10, §4.9): a pool of persistent HTTP/1.1
//! connections to configurable endpoints, modeled directly on the
//! teacher's `ClientConnection` — a `DashMap<request_id, mpsc::Sender<..>>`
//! dispatch table plus a read loop that demultiplexes replies back to the
//! request that sent them, just keyed by a monotonically increasing
//! request id instead of an iSCSI ITT.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, Mutex},
};
use tracing::{debug, warn};

use crate::error::IndexerError;

/// Request bodies are bucketed small/large the way the original allocator
/// splits its free lists; here the bucket only decides which counter a
/// request is attributed to for queue-depth accounting, since Rust's
/// allocator makes the original's pointer-arithmetic reuse unnecessary.
const SMALL_BUFFER_BUCKET_BYTES: usize = 8 * 1024;

const FAILED_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct IndexerReply {
    pub status: u16,
    pub body: Vec<u8>,
}

struct PendingRequest {
    reply_tx: mpsc::Sender<IndexerReply>,
}

/// One persistent connection to an indexer host, handling one request at a
/// time on the wire (no HTTP/1.1 pipelining) but dispatched through a
/// tag-keyed map so the read loop's demux logic is uniform regardless of
/// how many requests are ever in flight on the connection.
struct IndexerConnection {
    writer: Mutex<OwnedWriteHalf>,
    pending: DashMap<u64, PendingRequest>,
    order: Mutex<VecDeque<u64>>,
}

impl IndexerConnection {
    async fn connect(host: &str, port: u16) -> Result<Arc<Self>, IndexerError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(IndexerError::Connect)?;
        stream.set_nodelay(true).ok();
        let (r, w) = stream.into_split();
        let conn = Arc::new(IndexerConnection {
            writer: Mutex::new(w),
            pending: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        });
        let reader_conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = reader_conn.read_loop(r).await {
                debug!("indexer connection read loop exited: {e}");
            }
        });
        Ok(conn)
    }

    async fn send(
        &self,
        request_id: u64,
        method: &str,
        path: &str,
        host_header: &str,
        body: &[u8],
    ) -> Result<mpsc::Receiver<IndexerReply>, IndexerError> {
        let (tx, rx) = mpsc::channel(1);
        self.pending.insert(request_id, PendingRequest { reply_tx: tx });
        self.order.lock().await.push_back(request_id);

        let mut request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {host_header}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);

        let mut w = self.writer.lock().await;
        w.write_all(&request)
            .await
            .map_err(IndexerError::Connect)?;
        drop(w);

        Ok(rx)
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) -> Result<()> {
        let mut buf = Vec::with_capacity(8192);
        loop {
            let (status, body) = read_one_response(&mut reader, &mut buf).await?;

            let request_id = self
                .order
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| anyhow!("response received with no outstanding request"))?;

            if let Some((_, pending)) = self.pending.remove(&request_id) {
                let _ = pending.reply_tx.send(IndexerReply { status, body }).await;
            } else {
                warn!(request_id, "indexer reply for unknown/already-completed request");
            }
        }
    }
}

/// Read exactly one HTTP/1.1 response (headers + `Content-Length` body)
/// from `reader`, reusing `scratch` across calls the way the writer's mmap
/// buffer is reused across packets. Chunked transfer-encoding is not
/// supported since the indexer's own replies are always `Content-Length`
/// framed.
async fn read_one_response(reader: &mut OwnedReadHalf, scratch: &mut Vec<u8>) -> Result<(u16, Vec<u8>)> {
    loop {
        if let Some(header_end) = find_header_end(scratch) {
            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut resp = httparse::Response::new(&mut headers);
            let parsed = resp
                .parse(&scratch[..header_end])
                .map_err(|e| anyhow!("indexer response parse error: {e}"))?;
            if parsed.is_partial() {
                // fall through to read more bytes
            } else {
                let status = resp.code.unwrap_or(0);
                let content_length = resp
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);

                let body_start = header_end;
                while scratch.len() < body_start + content_length {
                    read_more(reader, scratch).await?;
                }
                let body = scratch[body_start..body_start + content_length].to_vec();
                scratch.drain(..body_start + content_length);
                return Ok((status, body));
            }
        }
        read_more(reader, scratch).await?;
    }
}

async fn read_more(reader: &mut OwnedReadHalf, scratch: &mut Vec<u8>) -> Result<()> {
    let mut chunk = [0u8; 4096];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
        bail!("connection closed before a complete response was read");
    }
    scratch.extend_from_slice(&chunk[..n]);
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// One configured indexer endpoint and its connection pool.
pub struct Server {
    host: String,
    port: u16,
    max_conns: usize,
    max_outstanding: usize,
    conns: Mutex<Vec<Arc<IndexerConnection>>>,
    next_request_id: AtomicU64,
    queued: AtomicUsize,
    last_failed_connect: Mutex<Option<Instant>>,
}

impl Server {
    async fn acquire_connection(&self) -> Result<Arc<IndexerConnection>, IndexerError> {
        {
            let last_failed = self.last_failed_connect.lock().await;
            if let Some(t) = *last_failed {
                if t.elapsed() < FAILED_CONNECT_BACKOFF {
                    return Err(IndexerError::Connect(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "backing off after a recent failed connect",
                    )));
                }
            }
        }

        let mut conns = self.conns.lock().await;
        if let Some(conn) = conns.first().cloned() {
            if conns.len() >= self.max_conns {
                return Ok(conn);
            }
        }

        match IndexerConnection::connect(&self.host, self.port).await {
            Ok(conn) => {
                conns.push(conn.clone());
                Ok(conn)
            }
            Err(e) => {
                *self.last_failed_connect.lock().await = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// `queue_length` — sum of queued and in-flight requests (§4.9), used
    /// by the `can_quit` predicate in orchestration.
    pub fn queue_length(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    fn bucket_for(body_len: usize) -> &'static str {
        if body_len <= SMALL_BUFFER_BUCKET_BYTES {
            "small"
        } else {
            "large"
        }
    }

    /// Blocks the calling task until a complete HTTP response is parsed.
    pub async fn send_sync(&self, method: &str, path: &str, body: &[u8]) -> Result<(u16, Vec<u8>), IndexerError> {
        debug!(bucket = Self::bucket_for(body.len()), path, "indexer send_sync");
        self.queued.fetch_add(1, Ordering::Relaxed);
        let result = self.send_inner(method, path, body).await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        result.map(|r| (r.status, r.body))
    }

    /// Enqueues a request; `callback` fires once the reply (or a transport
    /// failure) is available. If the server has no available connection
    /// and the queue already holds `max_outstanding` requests, the request
    /// is dropped with a log line — unless `must_not_drop` is set, in
    /// which case the caller blocks instead (§4.9: "must not be dropped
    /// and blocks forward progress").
    pub async fn send_async<F>(&self, method: &str, path: &str, body: &[u8], must_not_drop: bool, callback: F)
    where
        F: FnOnce(Result<(u16, Vec<u8>), IndexerError>) + Send + 'static,
    {
        if !must_not_drop && self.queued.load(Ordering::Relaxed) >= self.max_outstanding {
            warn!(path, "indexer request dropped: queue saturated");
            callback(Err(IndexerError::QueueSaturated(self.host.clone())));
            return;
        }

        self.queued.fetch_add(1, Ordering::Relaxed);
        let result = self.send_inner(method, path, body).await;
        self.queued.fetch_sub(1, Ordering::Relaxed);
        callback(result.map(|r| (r.status, r.body)));
    }

    async fn send_inner(&self, method: &str, path: &str, body: &[u8]) -> Result<IndexerReply, IndexerError> {
        let conn = self.acquire_connection().await?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let mut rx = conn
            .send(request_id, method, path, &self.host, body)
            .await?;
        rx.recv().await.ok_or(IndexerError::PrematureClose)
    }
}

/// `create_server(hosts, default_port, max_conns, max_outstanding)`: picks
/// the first configured host (round-robin across hosts is a config-level
/// concern the caller implements by creating one `Server` per host), per
/// §4.9.
pub fn create_server(hosts: &[String], default_port: u16, max_conns: usize, max_outstanding: usize) -> Result<Arc<Server>> {
    let host = hosts
        .first()
        .ok_or_else(|| anyhow!("at least one indexer host is required"))?
        .clone();
    Ok(Arc::new(Server {
        host,
        port: default_port,
        max_conns,
        max_outstanding,
        conns: Mutex::new(Vec::new()),
        next_request_id: AtomicU64::new(1),
        queued: AtomicUsize::new(0),
        last_failed_connect: Mutex::new(None),
    }))
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt as _, AsyncWriteExt as _},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn send_sync_round_trips_against_a_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.expect("read");
            assert!(n > 0);
            let body = b"{\"ok\":true}";
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write headers");
            socket.write_all(body).await.expect("write body");
        });

        let server = create_server(&[addr.ip().to_string()], addr.port(), 4, 100).expect("server");
        let (status, body) = server.send_sync("POST", "/_bulk", b"{}").await.expect("send_sync");
        assert_eq!(status, 200);
        assert_eq!(body, b"{\"ok\":true}");
    }
}
