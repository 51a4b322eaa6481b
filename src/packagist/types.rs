//! Wire and stored record types for the Composer metadata graph.
//!
//! Every map is a `BTreeMap` and passthrough fields flatten into ordered
//! maps, so `serde_json` marshalling is canonical: equal values always
//! produce byte-identical JSON. The hashing invariants (stored sha256 ==
//! sha256 of the marshalled payload) depend on this.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// `{"sha256": "..."}` reference used by the root and provider indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRef {
    #[serde(default)]
    pub sha256: String,
}

/// The upstream repository root (`packages.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagesRoot {
    #[serde(rename = "providers-url", default)]
    pub providers_url: String,
    #[serde(rename = "provider-includes", default)]
    pub provider_includes: BTreeMap<String, HashRef>,
    #[serde(default)]
    pub notify: String,
    #[serde(rename = "notify-batch", default)]
    pub notify_batch: String,
    #[serde(default)]
    pub search: String,
    /// Fields the mirror does not inspect, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A provider index: package name -> upstream hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderList {
    #[serde(default)]
    pub providers: BTreeMap<String, HashRef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A per-package document: package name -> version -> version metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageDoc {
    #[serde(default)]
    pub packages: BTreeMap<String, BTreeMap<String, VersionDoc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One released version inside a [`PackageDoc`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dist: Option<ArchiveRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ArchiveRef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A `dist` or `source` reference: only the URL is rewritten, everything
/// else passes through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveRef {
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The mirror's per-package bookkeeping record, stored under the bare
/// package name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageInfo {
    #[serde(default)]
    pub package: String,
    /// Service code of the mirror that owns this record.
    #[serde(default)]
    pub server: String,
    /// Upstream-declared sha256 of the package's provider entry at last sync.
    #[serde(default)]
    pub hash_source: String,
    /// sha256 of the locally rewritten package document.
    #[serde(default)]
    pub hash_target: String,
}

impl PackageInfo {
    pub fn new(package: &str, server: &str) -> Self {
        Self {
            package: package.to_string(),
            server: server.to_string(),
            ..Self::default()
        }
    }

    /// Upstream path component for this package's document:
    /// `<package>$<hash_source>.json`.
    pub fn source_key(&self) -> String {
        format!("{}${}.json", self.package, self.hash_source)
    }

    /// Store key for the rewritten document blob:
    /// `p/<package>$<hash_target>.json`.
    pub fn target_key(&self) -> String {
        format!("p/{}${}.json", self.package, self.hash_target)
    }
}

/// Strip a `$<hash>` suffix from a package reference
/// (`vendor/pkg$abc` -> `vendor/pkg`).
pub fn strip_hash_suffix(name: &str) -> &str {
    match name.find('$') {
        Some(i) => &name[..i],
        None => name,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
