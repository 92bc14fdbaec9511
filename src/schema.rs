// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Declarative field-id registry (§4.7): every field a parser can emit is
//! registered once at startup and referenced by its assigned `FieldId`
//! afterwards, instead of by name, on the hot path.

use std::sync::Arc;

use crate::fields::{FieldDef, FieldFlags, FieldId, FieldRegistry};

/// The field-ids the bundled parsers populate. Built once at process
/// start and shared read-only afterwards.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub host: FieldId,
    pub tags: FieldId,
    pub http_method: FieldId,
    pub http_statuscode: FieldId,
    pub http_uri: FieldId,
    pub http_host: FieldId,
    pub http_user_agent: FieldId,
    pub http_md5: FieldId,
    pub http_cookie: FieldId,
    pub http_authorization: FieldId,
    pub http_xff: FieldId,
    pub certs: FieldId,
    pub smtp_host: FieldId,
    pub smtp_user: FieldId,
    pub isis_type: FieldId,
}

impl Schema {
    pub fn build(registry: &mut FieldRegistry) -> Schema {
        let str_hash = |name: &'static str, cap: usize| FieldDef {
            name,
            flags: FieldFlags::CNT | FieldFlags::FORCE_UTF8,
            cap,
        };
        let str_array = |name: &'static str, cap: usize| FieldDef {
            name,
            flags: FieldFlags::empty(),
            cap,
        };

        Schema {
            host: registry.register(str_hash("host", 100)),
            tags: registry.register(str_hash("tags", 64)),
            http_method: registry.register(str_array("http.method", 16)),
            http_statuscode: registry.register(str_array("http.statuscode", 16)),
            http_uri: registry.register(str_hash("http.uri", 200)),
            http_host: registry.register(str_hash("http.host", 100)),
            http_user_agent: registry.register(str_hash("http.user-agent", 100)),
            http_md5: registry.register(str_hash("http.md5", 200)),
            http_cookie: registry.register(str_hash("http.cookie-key", 100)),
            http_authorization: registry.register(str_hash("http.user", 100)),
            http_xff: registry.register(str_hash("http.xff", 100)),
            certs: registry.register(FieldDef {
                name: "certs",
                flags: FieldFlags::empty(),
                cap: 100,
            }),
            smtp_host: registry.register(str_hash("smtp.host", 100)),
            smtp_user: registry.register(str_hash("smtp.user", 100)),
            isis_type: registry.register(str_array("isis.type", 64)),
        }
    }

}

/// A registry/schema pair shared read-only across parser instances, so
/// each attached parser can look up a field's cap/flags without owning
/// its own copy of the registry.
#[derive(Debug, Clone)]
pub struct SchemaRef {
    pub registry: Arc<FieldRegistry>,
    pub ids: Schema,
}

impl SchemaRef {
    pub fn build() -> SchemaRef {
        let mut registry = FieldRegistry::new();
        let ids = Schema::build(&mut registry);
        SchemaRef {
            registry: Arc::new(registry),
            ids,
        }
    }

    pub fn def(&self, id: FieldId) -> &FieldDef {
        self.registry
            .get(id)
            .expect("schema field-id registered at startup")
    }
}
