// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::cfg::enums::WriterMode;

/// Process-scoped configuration (§4.4, §4.8, §4.9, §6 AMBIENT). Every knob
/// §6 leaves out of the wire-protocol schema but in scope as a runtime
/// value lives here, loaded the way the teacher's `Config::load_from_file`
/// loads iSCSI negotiation defaults.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Packet-thread count and session-table sharding (§5).
    pub runtime: RuntimeConfig,
    /// Per-protocol idle timeouts and mid-save thresholds (§4.4, §3).
    pub session: SessionConfig,
    /// Capture-file writer sizing and rotation policy (§4.8).
    pub writer: WriterConfig,
    /// Drop-hash on-disk save file (§4.2).
    pub drop_hash: DropHashConfig,
    /// Bulk indexer endpoints and queue limits (§4.9).
    pub indexer: IndexerConfig,
    /// Optional bootstrap path to a locally-provided rules file, used when
    /// agent mode's `POST /config` round trip is skipped (§6).
    #[serde(default, rename = "rulesFile")]
    pub rules_file: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RuntimeConfig {
    #[serde(rename = "packetThreads")]
    /// Number of packet-processing threads, each owning an exclusive
    /// session-table shard (§5).
    pub packet_threads: usize,

    #[serde(rename = "logEveryXPackets")]
    /// Cadence, in packets, of the ingress status log line (§4.4).
    pub log_every_x_packets: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct SessionConfig {
    #[serde(rename = "icmpTimeout")]
    /// Idle timeout for ICMP sessions, in seconds. `None` (absent in YAML
    /// as `~`) means ICMP sessions are never tracked past the packet that
    /// created them.
    pub icmp_timeout: Option<u32>,

    #[serde(rename = "udpTimeout")]
    /// Idle timeout for UDP sessions, in seconds.
    pub udp_timeout: u32,

    #[serde(rename = "tcpTimeout")]
    /// Idle timeout for TCP sessions without FIN/RST, in seconds.
    pub tcp_timeout: u32,

    #[serde(rename = "tcpSaveTimeout")]
    /// Mid-save interval for long-lived TCP sessions, in seconds.
    pub tcp_save_timeout: u32,

    #[serde(rename = "maxPackets")]
    /// `filePosArray.len` threshold that forces a mid-save (§3).
    pub max_packets: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct WriterConfig {
    #[serde(rename = "mode")]
    /// Writer strategy; only `Simple` is fully implemented end to end.
    pub mode: WriterMode,

    #[serde(rename = "outputDir")]
    /// Directory capture files are written into.
    pub output_dir: String,

    #[serde(rename = "pcapWriteSize")]
    /// Bytes written per blocking flush (§4.8).
    pub pcap_write_size: usize,

    #[serde(rename = "maxPacketLen")]
    /// Largest single packet the scratch buffer must be able to absorb
    /// between flushes without overflowing.
    pub max_packet_len: usize,

    #[serde(rename = "maxFileSizeG")]
    /// Rotate once the open file reaches this many gigabytes. `0` means
    /// "rotate on the very next packet", used by the test-mode rotation
    /// scenario (§8 testable property 6).
    pub max_file_size_g: f64,

    #[serde(rename = "maxFileTimeM")]
    /// Rotate once the open file has been open this many minutes,
    /// regardless of size.
    pub max_file_time_m: u64,

    #[serde(rename = "snaplen")]
    /// pcap file-header snaplen.
    pub snaplen: u32,

    #[serde(rename = "linktype")]
    /// pcap file-header link type (1 = Ethernet).
    pub linktype: u32,
}

impl WriterConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        (self.max_file_size_g * 1_073_741_824.0) as u64
    }

    pub fn max_file_time(&self) -> Duration {
        Duration::from_secs(self.max_file_time_m * 60)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DropHashConfig {
    #[serde(rename = "file", skip_serializing_if = "Option::is_none")]
    /// Path to the on-disk drop-hash save file; `None` disables
    /// persistence across restarts.
    pub file: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IndexerConfig {
    #[serde(rename = "hosts")]
    /// Indexer host list; `create_server` currently picks the first entry
    /// and round-robin across hosts is a future extension.
    pub hosts: Vec<String>,

    #[serde(rename = "port")]
    pub port: u16,

    #[serde(rename = "maxConns")]
    /// Upper bound on persistent connections per configured host.
    pub max_conns: usize,

    #[serde(rename = "maxESRequests")]
    /// `maxOutstanding` — requests queued past this are dropped unless
    /// they carry a must-not-drop callback (§4.9).
    pub max_es_requests: usize,

    #[serde(rename = "MOLOCH_ES_BUFFER_SIZE_S")]
    /// Small/large request-body bucket threshold, in bytes.
    pub small_buffer_bucket_bytes: usize,
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.runtime.packet_threads >= 1, "packetThreads must be >= 1");

        ensure!(self.session.max_packets >= 1, "maxPackets must be >= 1");
        ensure!(self.session.udp_timeout >= 1, "udpTimeout must be >= 1");
        ensure!(self.session.tcp_timeout >= 1, "tcpTimeout must be >= 1");
        ensure!(self.session.tcp_save_timeout >= 1, "tcpSaveTimeout must be >= 1");

        ensure!(self.writer.pcap_write_size >= 1, "pcapWriteSize must be >= 1");
        ensure!(
            self.writer.max_packet_len >= 64,
            "maxPacketLen must be large enough to hold a minimal packet"
        );

        ensure!(
            !self.indexer.hosts.is_empty(),
            "at least one indexer host is required"
        );
        ensure!(self.indexer.max_conns >= 1, "maxConns must be >= 1");

        Ok(())
    }
}

/// One parsed rule from the `/config` rules-file schema (§6). `ports` and
/// `cidrs` arrive from the indexer as stringified JSON arrays; this is the
/// normalized in-memory form after decoding those strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub action: crate::cfg::enums::RuleAction,
    pub ports: Vec<u16>,
    pub cidrs: Vec<String>,
    /// `-1` in the wire schema means unlimited; normalized to `None` here.
    pub max_packets: Option<u32>,
}

/// Wire shape of one rules-array entry, matching the stringified-array
/// encoding §6 specifies before `Rule::parse` normalizes it.
#[derive(Deserialize, Debug, Clone)]
struct RawRule {
    name: String,
    action: crate::cfg::enums::RuleAction,
    #[serde(default)]
    ports: Option<String>,
    #[serde(default)]
    cidrs: Option<String>,
    #[serde(default, rename = "maxPackets")]
    max_packets: Option<i64>,
}

impl Rule {
    fn from_raw(raw: RawRule) -> Result<Self> {
        let ports: Vec<u16> = match raw.ports {
            Some(s) => {
                let parsed: Vec<u16> = serde_json::from_str(&s).context("invalid `ports` field")?;
                ensure!(parsed.len() <= 12, "rule `{}` has more than 12 ports", raw.name);
                parsed
            }
            None => Vec::new(),
        };
        let cidrs: Vec<String> = match raw.cidrs {
            Some(s) => serde_json::from_str(&s).context("invalid `cidrs` field")?,
            None => Vec::new(),
        };
        let max_packets = match raw.max_packets {
            Some(-1) | None => None,
            Some(n) => Some(n as u32),
        };
        Ok(Rule {
            name: raw.name,
            action: raw.action,
            ports,
            cidrs,
            max_packets,
        })
    }

    /// IPv4 vs IPv6 classification per §6: presence of a literal `.`
    /// distinguishes the families, since the original never ships a
    /// dedicated tag.
    pub fn cidr_is_ipv4(cidr: &str) -> bool {
        cidr.contains('.')
    }
}

/// Parses the `rules` array out of a `/config` response body (or a local
/// rules-file bootstrap), per §6.
pub fn parse_rules(rules_json: &[serde_json::Value]) -> Result<Vec<Rule>> {
    rules_json
        .iter()
        .map(|v| {
            let raw: RawRule = serde_json::from_value(v.clone()).context("invalid rule entry")?;
            Rule::from_raw(raw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            runtime: RuntimeConfig {
                packet_threads: 4,
                log_every_x_packets: 50_000,
            },
            session: SessionConfig {
                icmp_timeout: None,
                udp_timeout: 60,
                tcp_timeout: 480,
                tcp_save_timeout: 480,
                max_packets: 10_000,
            },
            writer: WriterConfig {
                mode: WriterMode::Simple,
                output_dir: "/tmp/capture".into(),
                pcap_write_size: 262_144,
                max_packet_len: 65_536,
                max_file_size_g: 12.0,
                max_file_time_m: 180,
                snaplen: 65_535,
                linktype: 1,
            },
            drop_hash: DropHashConfig { file: None },
            indexer: IndexerConfig {
                hosts: vec!["127.0.0.1".into()],
                port: 8005,
                max_conns: 4,
                max_es_requests: 1_000,
                small_buffer_bucket_bytes: 8 * 1024,
            },
            rules_file: None,
        }
    }

    #[test]
    fn validate_accepts_a_well_formed_config() {
        let mut cfg = sample_config();
        assert!(cfg.validate_and_normalize().is_ok());
    }

    #[test]
    fn validate_rejects_zero_packet_threads() {
        let mut cfg = sample_config();
        cfg.runtime.packet_threads = 0;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn validate_rejects_empty_indexer_hosts() {
        let mut cfg = sample_config();
        cfg.indexer.hosts.clear();
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn max_file_size_bytes_converts_gigabytes() {
        let cfg = sample_config();
        assert_eq!(cfg.writer.max_file_size_bytes(), 12 * 1_073_741_824);
    }

    #[test]
    fn parse_rules_decodes_stringified_arrays_and_unlimited_max_packets() {
        let json = serde_json::json!([
            {
                "name": "http-telemetry",
                "action": "telemetry",
                "ports": "[80,8080]",
                "cidrs": "[\"10.0.0.0/8\"]",
                "maxPackets": -1,
            }
        ]);
        let rules = parse_rules(json.as_array().expect("array")).expect("parse");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].ports, vec![80, 8080]);
        assert_eq!(rules[0].max_packets, None);
        assert!(Rule::cidr_is_ipv4(&rules[0].cidrs[0]));
    }

    #[test]
    fn parse_rules_rejects_more_than_twelve_ports() {
        let ports: Vec<u16> = (0..13).collect();
        let json = serde_json::json!([
            {
                "name": "too-many-ports",
                "action": "packets",
                "ports": serde_json::to_string(&ports).expect("serialize"),
            }
        ]);
        assert!(parse_rules(json.as_array().expect("array")).is_err());
    }
}
