// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::IpAddr, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use arkon_capture::{
    capture::{writer::SimpleWriter, CaptureSource, PcapFileSource},
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    classify::Classifier,
    drophash::DropHashGroup,
    frame::{self, DecodedFrame},
    indexer::{create_server, Server},
    ingress::{FiveTuple, Ingress, IngressOutcome, Timeouts},
    orchestration,
    reassembly::ReassemblyAdapter,
    schema::SchemaRef,
    session::{Direction, Protocol, Session, SessionId, ShardRouter},
};
use tokio::{fs::File, io::BufReader, sync::mpsc};
use tracing::{info, warn};

/// One decoded frame, routed to its owning shard and carrying everything
/// that shard's worker needs: the raw bytes for the capture writer plus
/// the already-decoded 5-tuple (or ISIS marker) for ingress.
enum WorkItem {
    Ip {
        tuple: FiveTuple,
        ts_sec: u32,
        ts_usec: u32,
        raw: Vec<u8>,
        l4_start: usize,
    },
    Isis {
        ts_sec: u32,
        ts_usec: u32,
        raw: Vec<u8>,
        l2_start: usize,
    },
}

/// A single packet thread's exclusive state (§5): its session-table
/// shard, capture file, attached-parser side-table, and a shared view of
/// the process-wide drop-hash/classifier/indexer.
struct Worker {
    id: usize,
    ingress: Ingress,
    writer: SimpleWriter,
    reassembly: ReassemblyAdapter,
    isis_session: Session,
    classifier: Arc<Classifier>,
    schema: Arc<SchemaRef>,
    drophash: Arc<DropHashGroup>,
    indexer: Arc<Server>,
    cfg: Arc<Config>,
    next_file_id: u32,
}

impl Worker {
    fn new(
        id: usize,
        cfg: Arc<Config>,
        classifier: Arc<Classifier>,
        schema: Arc<SchemaRef>,
        drophash: Arc<DropHashGroup>,
        indexer: Arc<Server>,
    ) -> Result<Self> {
        let timeouts = Timeouts {
            icmp_secs: cfg.session.icmp_timeout,
            udp_secs: cfg.session.udp_timeout,
            tcp_secs: cfg.session.tcp_timeout,
            tcp_save_secs: cfg.session.tcp_save_timeout,
        };
        let ingress = Ingress::new(timeouts, cfg.session.max_packets, cfg.runtime.log_every_x_packets);
        let writer = open_writer(&cfg, id, 0)?;
        let isis_session = Session::new(
            SessionId::isis_aggregate(),
            Protocol::Other(0x83),
            IpAddr::from([0, 0, 0, 0]),
            0,
            IpAddr::from([0, 0, 0, 0]),
            0,
            0,
        );

        Ok(Worker {
            id,
            ingress,
            writer,
            reassembly: ReassemblyAdapter::new(),
            isis_session,
            classifier,
            schema,
            drophash,
            indexer,
            cfg,
            next_file_id: 1,
        })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkItem>) -> Result<()> {
        while let Some(item) = rx.recv().await {
            if let Err(e) = self.handle(item).await {
                warn!(worker = self.id, error = %e, "dropping packet after handling error");
            }
        }
        self.shutdown().await
    }

    async fn handle(&mut self, item: WorkItem) -> Result<()> {
        match item {
            WorkItem::Ip {
                tuple,
                ts_sec,
                ts_usec,
                raw,
                l4_start,
            } => self.handle_ip(tuple, ts_sec, ts_usec, &raw, l4_start).await,
            WorkItem::Isis {
                ts_sec,
                raw,
                l2_start,
                ..
            } => {
                self.classifier.classify_isis(&mut self.isis_session, &raw[l2_start..]);
                self.isis_session.last_packet = ts_sec;
                self.isis_session.packet_count += 1;
                Ok(())
            }
        }
    }

    async fn handle_ip(&mut self, tuple: FiveTuple, ts_sec: u32, ts_usec: u32, raw: &[u8], l4_start: usize) -> Result<()> {
        let (file_id, file_offset) = self
            .writer
            .append(ts_sec, ts_usec, raw.len() as u32, raw.len() as u32, raw)
            .context("capture writer append failed")?;

        let payload = &raw[l4_start..];
        let (outcome, evicted) = self.ingress.process(
            &tuple,
            payload,
            ts_sec,
            &self.drophash,
            &self.classifier,
            file_id,
            file_offset,
            raw.len() as u64,
        );

        if outcome == IngressOutcome::Processed {
            let id = SessionId::new(tuple.ip_protocol, tuple.src_addr, tuple.src_port, tuple.dst_addr, tuple.dst_port);

            if tuple.ip_protocol == Protocol::Tcp.ip_protocol_number() {
                if let Some(session) = self.ingress.table.find_mut(&id) {
                    let dir = if (tuple.src_addr, tuple.src_port) == session.which_src {
                        Direction::Src
                    } else {
                        Direction::Dst
                    };
                    self.reassembly.on_data(session, &self.classifier, dir, payload);
                }
            }

            // §4.4 step 7 / §3's `filePosArray.len ≤ maxPackets` invariant
            // apply to every session regardless of protocol, not just TCP.
            if let Some(session) = self.ingress.table.find_mut(&id) {
                if session.needs_mid_save(self.ingress.max_packets) {
                    self.reassembly.save(session, false);
                    // `find_mut` borrow ends at scope exit; re-borrow is not
                    // needed since `mid_save` only needs a `&mut Session`.
                    orchestration::mid_save(session, &self.schema.registry, &self.indexer, ts_sec)
                        .await
                        .context("mid-save failed")?;
                }
            }
        }

        for mut session in evicted {
            if orchestration::defer_final_save_for_outstanding_tags(&mut session) {
                continue;
            }
            self.reassembly.save(&mut session, true);
            orchestration::final_save(session, &self.schema.registry, &self.indexer, &mut self.reassembly, ts_sec)
                .await
                .context("final-save failed")?;
        }

        if self
            .writer
            .should_rotate(self.cfg.writer.max_file_size_bytes(), self.cfg.writer.max_file_time())
        {
            self.rotate_writer()?;
        }

        Ok(())
    }

    fn rotate_writer(&mut self) -> Result<()> {
        let old = std::mem::replace(&mut self.writer, open_writer(&self.cfg, self.id, self.next_file_id)?);
        old.close().context("closing rotated capture file")?;
        self.next_file_id += 1;
        Ok(())
    }

    async fn shutdown(mut self) -> Result<()> {
        let ids: Vec<SessionId> = self.ingress.table.forall().map(|s| s.id).collect();
        for id in ids {
            let Some(mut session) = self.ingress.table.remove(&id) else {
                continue;
            };
            if orchestration::defer_final_save_for_outstanding_tags(&mut session) {
                continue;
            }
            self.reassembly.save(&mut session, true);
            let now = session.last_packet;
            orchestration::final_save(session, &self.schema.registry, &self.indexer, &mut self.reassembly, now)
                .await
                .context("final-save during shutdown failed")?;
        }

        if self.isis_session.packet_count > 0 {
            let now = self.isis_session.last_packet;
            let isis_session = std::mem::replace(
                &mut self.isis_session,
                Session::new(SessionId::isis_aggregate(), Protocol::Other(0x83), IpAddr::from([0, 0, 0, 0]), 0, IpAddr::from([0, 0, 0, 0]), 0, now),
            );
            orchestration::final_save(isis_session, &self.schema.registry, &self.indexer, &mut self.reassembly, now)
                .await
                .context("final-save of isis aggregate failed")?;
        }

        self.writer.close().context("closing capture file at shutdown")?;
        info!(worker = self.id, "shut down cleanly");
        Ok(())
    }
}

fn open_writer(cfg: &Config, worker_id: usize, file_id: u32) -> Result<SimpleWriter> {
    let path = PathBuf::from(&cfg.writer.output_dir).join(format!("arkond-{worker_id}-{file_id:08}.pcap"));
    SimpleWriter::create(&path, file_id, cfg.writer.linktype, cfg.writer.snaplen, cfg.writer.pcap_write_size, cfg.writer.max_packet_len)
        .with_context(|| format!("opening capture file {path:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let pcap_path = args.next().unwrap_or_else(|| "capture.pcap".to_string());
    let config_rel = args.next().unwrap_or_else(|| "config/arkond.yaml".to_string());
    let logger_rel = args.next().unwrap_or_else(|| "config/logger.yaml".to_string());

    let _logger_guard = init_logger(&logger_rel).context("failed to initialize logger")?;

    let cfg = resolve_config_path(&config_rel)
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;
    std::fs::create_dir_all(&cfg.writer.output_dir).context("creating capture output directory")?;
    let cfg = Arc::new(cfg);

    let schema = Arc::new(SchemaRef::build());
    let classifier = Arc::new(Classifier::with_schema(schema.clone()));

    let drophash_file = cfg.drop_hash.file.as_ref().map(PathBuf::from);
    let drophash = Arc::new(DropHashGroup::init(4, drophash_file).context("initializing drop-hash")?);

    let indexer = create_server(&cfg.indexer.hosts, cfg.indexer.port, cfg.indexer.max_conns, cfg.indexer.max_es_requests)
        .context("initializing indexer client")?;

    let router = ShardRouter::new(cfg.runtime.packet_threads);
    let mut senders = Vec::with_capacity(cfg.runtime.packet_threads);
    let mut handles = Vec::with_capacity(cfg.runtime.packet_threads);
    for id in 0..cfg.runtime.packet_threads {
        let worker = Worker::new(id, cfg.clone(), classifier.clone(), schema.clone(), drophash.clone(), indexer.clone())?;
        let (tx, rx) = mpsc::channel::<WorkItem>(4096);
        senders.push(tx);
        handles.push(tokio::spawn(worker.run(rx)));
    }

    let file = File::open(&pcap_path).await.with_context(|| format!("opening pcap file {pcap_path}"))?;
    let mut source = PcapFileSource::open(BufReader::new(file)).await.context("reading pcap header")?;
    source.start().await.context("starting capture source")?;

    let mut total = 0u64;
    while let Some(raw_frame) = source.next_frame().await.context("reading capture frame")? {
        total += 1;
        match frame::decode(&raw_frame.bytes) {
            DecodedFrame::Ip { tuple, payload } => {
                let l4_start = raw_frame.bytes.len() - payload.len();
                let id = SessionId::new(tuple.ip_protocol, tuple.src_addr, tuple.src_port, tuple.dst_addr, tuple.dst_port);
                let shard = router.shard_for(&id);
                let item = WorkItem::Ip {
                    tuple,
                    ts_sec: raw_frame.ts_sec,
                    ts_usec: raw_frame.ts_usec,
                    raw: raw_frame.bytes,
                    l4_start,
                };
                if senders[shard].send(item).await.is_err() {
                    warn!(shard, "worker channel closed early");
                }
            }
            DecodedFrame::Isis { payload } => {
                let l2_start = raw_frame.bytes.len() - payload.len();
                let shard = router.shard_for(&SessionId::isis_aggregate());
                let item = WorkItem::Isis {
                    ts_sec: raw_frame.ts_sec,
                    ts_usec: raw_frame.ts_usec,
                    raw: raw_frame.bytes,
                    l2_start,
                };
                if senders[shard].send(item).await.is_err() {
                    warn!(shard, "worker channel closed early");
                }
            }
            DecodedFrame::Unhandled => {}
        }
    }
    source.stop().await.context("stopping capture source")?;
    info!(total_frames = total, "capture source exhausted");

    drop(senders);
    for handle in handles {
        handle.await.context("worker task panicked")??;
    }

    if drophash.changed() > 0 {
        drophash.save().context("saving drop-hash file")?;
    }

    Ok(())
}
