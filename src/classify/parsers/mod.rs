// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bundled concrete parsers named in §4.6: HTTP/1, HTTP/2, SMTP, the TLS
//! certificate sweep, DNS and ISIS.

pub mod dns;
pub mod http1;
pub mod http2;
pub mod isis;
pub mod smtp;
pub mod tls;

pub(crate) mod codec;
