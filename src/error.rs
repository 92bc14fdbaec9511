// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Error taxonomy for the capture engine.
//!
//! Recoverable errors are absorbed at the component boundary where they
//! arose (logged, counted) and never propagate past the packet/record they
//! concern. Only configuration/bootstrap failures are allowed to bubble out
//! of `main` as a hard exit.

use thiserror::Error;

/// Malformed wire data: truncated headers, bad TLVs, digest mismatches.
/// Always non-fatal — the caller discards the offending packet/record and
/// continues the session.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("buffer too small: have {have}, need {need}")]
    Truncated { have: usize, need: usize },

    #[error("invalid field: {0}")]
    InvalidField(String),

    #[error("unsupported opcode/type: {0}")]
    Unsupported(String),

    #[error("digest mismatch")]
    DigestMismatch,
}

/// Failures loading or validating the process-scoped configuration.
/// These are always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Transient failures talking to the bulk indexer.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("connect failed: {0}")]
    Connect(std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("request queue saturated for server {0}")]
    QueueSaturated(String),

    #[error("connection closed before a complete response was read")]
    PrematureClose,
}

/// Everything the capture-source reader can fail with.
#[derive(Debug, Error)]
pub enum CaptureSourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt pcap file header")]
    BadFileHeader,

    #[error("unsupported link type {0}")]
    UnsupportedLinkType(u32),
}
