// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{Dep, PackageCatalog, PackageDetails};

/// Relative path of the catalog document under a catalog site's base URL.
const CATALOG_DOCUMENT_PATH: &str = "catalog/packages.json";

/// Name of the cache file written under the mirror directory so that a run
/// with `skip_archive` can reuse the last archive verbatim.
const CACHE_FILE_NAME: &str = "packages_details.json";

#[derive(Deserialize)]
struct RawEntry {
    checksum: String,
    source: String,
    #[serde(default)]
    dependencies: Vec<Dep>,
}

/// Fetches and parses the catalog document served at `base_url`. Individual
/// entries that fail to parse are logged and dropped rather than failing the
/// whole fetch.
fn fetch_catalog_entries(base_url: &url::Url) -> Result<BTreeMap<String, RawEntry>> {
    let doc_url = base_url
        .join(CATALOG_DOCUMENT_PATH)
        .with_context(|| format!("invalid catalog URL {base_url}"))?;

    let body = ureq::get(doc_url.as_str())
        .call()
        .with_context(|| format!("failed to fetch catalog from {doc_url}"))?
        .into_string()
        .with_context(|| format!("failed to read catalog response from {doc_url}"))?;

    let raw_values: BTreeMap<String, serde_json::Value> = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse catalog document from {doc_url}"))?;

    let mut entries = BTreeMap::new();
    for (name, value) in raw_values {
        match serde_json::from_value::<RawEntry>(value) {
            Ok(entry) => {
                entries.insert(name, entry);
            }
            Err(err) => {
                tracing::warn!("skipping package {name:?} from {doc_url}: {err:#}");
            }
        }
    }
    Ok(entries)
}

fn merge_entries(catalog: &mut PackageCatalog, raw: BTreeMap<String, RawEntry>, is_snapshot: bool) {
    for (name, entry) in raw {
        catalog.all_pkgs.insert(name.clone());
        if is_snapshot {
            catalog.snapshot_pkgs.insert(name.clone());
        }
        catalog.details.insert(
            name,
            PackageDetails {
                checksum: entry.checksum,
                source: entry.source,
                dependencies: entry.dependencies,
            },
        );
    }
}

/// Mirrors the implicit snapshot catalog and every configured extra catalog,
/// unions their entries, and writes a cache of the result under
/// `mirror_dir` so a later `skip_archive` run can load it back verbatim via
/// [`load_cached`].
///
/// A catalog that can't be reached at all is logged and skipped, matching
/// the per-package fault tolerance the upstream spec calls for at the finer
/// granularity of a single package.
pub fn archive_catalogs(
    snapshot_url: &url::Url,
    extra_catalogs: &[url::Url],
    mirror_dir: &Path,
) -> Result<PackageCatalog> {
    fs::create_dir_all(mirror_dir)
        .with_context(|| format!("failed to create mirror directory {mirror_dir:?}"))?;

    let mut catalog = PackageCatalog::default();

    let snapshot_entries = fetch_catalog_entries(snapshot_url)
        .with_context(|| format!("failed to archive snapshot catalog at {snapshot_url}"))?;
    merge_entries(&mut catalog, snapshot_entries, true);

    for extra_url in extra_catalogs {
        match fetch_catalog_entries(extra_url) {
            Ok(entries) => merge_entries(&mut catalog, entries, false),
            Err(err) => tracing::warn!("failed to archive catalog {extra_url}: {err:#}"),
        }
    }

    let cache_path = mirror_dir.join(CACHE_FILE_NAME);
    let serialized =
        serde_json::to_vec_pretty(&catalog).context("failed to serialize archived catalog")?;
    fileutil::atomic_write(&cache_path, &serialized)
        .with_context(|| format!("failed to write catalog cache to {cache_path:?}"))?;

    Ok(catalog)
}

/// Loads the catalog cache written by the last [`archive_catalogs`] call,
/// for use when archiving is skipped between runs.
pub fn load_cached(mirror_dir: &Path) -> Result<PackageCatalog> {
    let cache_path = mirror_dir.join(CACHE_FILE_NAME);
    let body = fs::read_to_string(&cache_path)
        .with_context(|| format!("no cached catalog at {cache_path:?}; run without --skip-archive first"))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse cached catalog at {cache_path:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_snapshot_and_extra_entries() {
        let mut catalog = PackageCatalog::default();

        let mut snapshot = BTreeMap::new();
        snapshot.insert(
            "base".to_string(),
            RawEntry {
                checksum: "h1".to_string(),
                source: "http://example/base".to_string(),
                dependencies: vec![],
            },
        );
        merge_entries(&mut catalog, snapshot, true);

        let mut extra = BTreeMap::new();
        extra.insert(
            "drracket".to_string(),
            RawEntry {
                checksum: "h2".to_string(),
                source: "http://example/drracket".to_string(),
                dependencies: vec![Dep::Name("racket".to_string())],
            },
        );
        merge_entries(&mut catalog, extra, false);

        assert_eq!(catalog.all_pkgs.len(), 2);
        assert!(catalog.snapshot_pkgs.contains("base"));
        assert!(!catalog.snapshot_pkgs.contains("drracket"));
        assert_eq!(
            catalog.details["drracket"].dependency_names().collect::<Vec<_>>(),
            vec!["base"]
        );
    }

    #[test]
    fn archive_and_load_cache_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut catalog = PackageCatalog::default();
        let mut entries = BTreeMap::new();
        entries.insert(
            "base".to_string(),
            RawEntry {
                checksum: "h1".to_string(),
                source: "http://example/base".to_string(),
                dependencies: vec![],
            },
        );
        merge_entries(&mut catalog, entries, true);

        let cache_path = dir.path().join(CACHE_FILE_NAME);
        let serialized = serde_json::to_vec_pretty(&catalog)?;
        fileutil::atomic_write(&cache_path, &serialized)?;

        let loaded = load_cached(dir.path())?;
        assert_eq!(loaded.all_pkgs, catalog.all_pkgs);
        assert_eq!(loaded.details["base"].checksum, "h1");

        Ok(())
    }
}
