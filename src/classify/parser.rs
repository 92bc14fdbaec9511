// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Parser lifecycle contract (§4.6 "Parser lifecycle"): `parse`, `save`,
//! `free`, `classify`. The framework guarantees `parse` is only invoked
//! from the session's owning thread and in strict per-direction byte
//! order, and that `free` runs exactly once after outstanding async work
//! on the session drains — both guarantees are structural here (no
//! `Send`-across-threads path exists for an attached parser) rather than
//! runtime-checked.

use crate::session::{Direction, Session};

/// What a parser wants to happen to its registration after handling a
/// chunk of bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserAction {
    Continue,
    Unregister,
}

/// A per-session stateful consumer of ordered bytes that emits fields.
pub trait Parser: Send {
    fn name(&self) -> &'static str;

    /// Consume `bytes` received on `dir` since the last call.
    fn parse(&mut self, session: &mut Session, dir: Direction, bytes: &[u8]) -> ParserAction;

    /// Called before mid-save (`final_save = false`) or final-save
    /// (`final_save = true`).
    fn save(&mut self, _session: &mut Session, _final_save: bool) {}

    /// Called exactly once when the parser is detached, either via
    /// `ParserAction::Unregister` or session teardown.
    fn free(&mut self, _session: &mut Session) {}
}
