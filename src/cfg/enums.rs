// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::writer::DiskWriterMode;

/// Rule action from the `/config` rules-file schema (§6): what to do with
/// traffic a rule matches.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Telemetry,
    Packets,
    Both,
    None,
}
impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleAction::Telemetry => "telemetry",
            RuleAction::Packets => "packets",
            RuleAction::Both => "both",
            RuleAction::None => "none",
        })
    }
}

/// Capture-writer strategy (§4.8). `Simple` is the only strategy this
/// crate implements end to end; the legacy `Disk*` variants are modeled
/// only far enough to exercise the size-class/buffer-pool contract.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WriterMode {
    Simple,
    Normal,
    Direct,
    Thread,
    ThreadDirect,
}

impl WriterMode {
    pub fn to_disk_mode(self) -> Option<DiskWriterMode> {
        match self {
            WriterMode::Simple => None,
            WriterMode::Normal => Some(DiskWriterMode::Normal),
            WriterMode::Direct => Some(DiskWriterMode::Direct),
            WriterMode::Thread => Some(DiskWriterMode::Thread),
            WriterMode::ThreadDirect => Some(DiskWriterMode::ThreadDirect),
        }
    }
}
impl fmt::Display for WriterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriterMode::Simple => "simple",
            WriterMode::Normal => "normal",
            WriterMode::Direct => "direct",
            WriterMode::Thread => "thread",
            WriterMode::ThreadDirect => "thread-direct",
        })
    }
}
