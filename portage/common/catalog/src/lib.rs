// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mirrors upstream package catalogs and resolves per-package checksums and
//! dependency metadata (C1, the Catalog Archiver).

mod mirror;

pub use mirror::{archive_catalogs, load_cached};

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// A package dependency as advertised by a catalog entry.
///
/// Catalogs may record a dependency either as a bare name or as a tuple whose
/// first element is the name (the rest describing e.g. a version
/// constraint we don't interpret). [`Dep::name`] normalizes both forms, and
/// additionally rewrites `"racket"` to `"base"` per the synthetic remap every
/// catalog entry is subject to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dep {
    Name(String),
    Tuple(Vec<serde_json::Value>),
}

impl Dep {
    pub fn name(&self) -> &str {
        let raw = match self {
            Dep::Name(name) => name.as_str(),
            Dep::Tuple(items) => items
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        };
        remap_name(raw)
    }
}

/// Rewrites `"racket"` to `"base"`; every other name passes through
/// unchanged.
fn remap_name(name: &str) -> &str {
    if name == "racket" {
        "base"
    } else {
        name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageDetails {
    pub checksum: String,
    pub source: String,
    pub dependencies: Vec<Dep>,
}

impl PackageDetails {
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dependencies.iter().map(Dep::name)
    }
}

/// The union of one implicit snapshot catalog and zero or more extra
/// catalogs, as produced by the Catalog Archiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageCatalog {
    pub details: BTreeMap<String, PackageDetails>,
    /// Names present in the snapshot catalog (used to enforce V4: the built
    /// catalog never shadows a snapshot package).
    pub snapshot_pkgs: BTreeSet<String>,
    /// Names present anywhere in the union.
    pub all_pkgs: BTreeSet<String>,
}

impl PackageCatalog {
    pub fn get(&self, name: &str) -> Option<&PackageDetails> {
        self.details.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dep_name_normalizes_tuple() {
        let dep = Dep::Tuple(vec![serde_json::json!("foo"), serde_json::json!("2.0")]);
        assert_eq!(dep.name(), "foo");
    }

    #[test]
    fn dep_name_remaps_racket_to_base() {
        assert_eq!(Dep::Name("racket".to_string()).name(), "base");
        let dep = Dep::Tuple(vec![serde_json::json!("racket")]);
        assert_eq!(dep.name(), "base");
    }

    #[test]
    fn dep_name_passes_through_other_names() {
        assert_eq!(Dep::Name("drracket".to_string()).name(), "drracket");
    }
}
