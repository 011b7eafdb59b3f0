// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use catalog::PackageDetails;

const PKGS_ALL_FILE: &str = "pkgs-all";
const PKGS_FILE: &str = "pkgs";
const PKG_DIR: &str = "pkg";

/// Maintains the accreting built-catalog files under a served directory.
/// Entries for packages in `snapshot_pkgs` are never written (V4).
pub struct CatalogStore {
    server_dir: PathBuf,
    snapshot_pkgs: BTreeSet<String>,
    published: BTreeMap<String, PackageDetails>,
}

impl CatalogStore {
    pub fn open(server_dir: &Path, snapshot_pkgs: BTreeSet<String>) -> Result<Self> {
        fs::create_dir_all(server_dir.join(PKG_DIR))
            .with_context(|| format!("failed to create {:?}", server_dir.join(PKG_DIR)))?;

        let pkgs_all_path = server_dir.join(PKGS_ALL_FILE);
        let published = if pkgs_all_path.is_file() {
            let body = fs::read_to_string(&pkgs_all_path)
                .with_context(|| format!("failed to read {pkgs_all_path:?}"))?;
            serde_json::from_str(&body)
                .with_context(|| format!("failed to parse {pkgs_all_path:?}"))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            server_dir: server_dir.to_path_buf(),
            snapshot_pkgs,
            published,
        })
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.published.contains_key(name)
    }

    /// Publishes a successful build group, rewriting each entry's `source`
    /// and `checksum` to the zip's relative path and content hash. Entries
    /// for snapshot packages are dropped silently (V4).
    pub fn publish_group<I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, PackageDetails)>,
    {
        let mut changed = false;
        for (name, details) in entries {
            if self.snapshot_pkgs.contains(&name) {
                continue;
            }
            let pkg_path = self.server_dir.join(PKG_DIR).join(&name);
            let body = serde_json::to_vec_pretty(&details)
                .with_context(|| format!("failed to serialize details for {name}"))?;
            fileutil::atomic_write(&pkg_path, &body)
                .with_context(|| format!("failed to write {pkg_path:?}"))?;
            self.published.insert(name, details);
            changed = true;
        }
        if changed {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let all_path = self.server_dir.join(PKGS_ALL_FILE);
        let all_body = serde_json::to_vec_pretty(&self.published)
            .context("failed to serialize published catalog")?;
        fileutil::atomic_write(&all_path, &all_body)
            .with_context(|| format!("failed to write {all_path:?}"))?;

        let names_path = self.server_dir.join(PKGS_FILE);
        let names: Vec<&String> = self.published.keys().collect();
        let names_body =
            serde_json::to_vec_pretty(&names).context("failed to serialize published names")?;
        fileutil::atomic_write(&names_path, &names_body)
            .with_context(|| format!("failed to write {names_path:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::Dep;

    fn details(checksum: &str, source: &str) -> PackageDetails {
        PackageDetails {
            checksum: checksum.to_string(),
            source: source.to_string(),
            dependencies: vec![Dep::Name("base".to_string())],
        }
    }

    #[test]
    fn publish_writes_per_package_and_aggregate_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut store = CatalogStore::open(dir.path(), BTreeSet::new())?;

        store.publish_group([("A".to_string(), details("zh1", "pkgs/A.zip"))])?;

        assert!(dir.path().join(PKG_DIR).join("A").is_file());
        let all: BTreeMap<String, PackageDetails> =
            serde_json::from_str(&fs::read_to_string(dir.path().join(PKGS_ALL_FILE))?)?;
        assert_eq!(all["A"].checksum, "zh1");

        let names: Vec<String> =
            serde_json::from_str(&fs::read_to_string(dir.path().join(PKGS_FILE))?)?;
        assert_eq!(names, vec!["A".to_string()]);
        Ok(())
    }

    #[test]
    fn snapshot_packages_are_never_published() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut snapshot = BTreeSet::new();
        snapshot.insert("A".to_string());
        let mut store = CatalogStore::open(dir.path(), snapshot)?;

        store.publish_group([("A".to_string(), details("zh1", "pkgs/A.zip"))])?;

        assert!(!store.is_published("A"));
        assert!(!dir.path().join(PKG_DIR).join("A").is_file());
        Ok(())
    }

    #[test]
    fn reopening_loads_previously_published_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let mut store = CatalogStore::open(dir.path(), BTreeSet::new())?;
            store.publish_group([("A".to_string(), details("zh1", "pkgs/A.zip"))])?;
        }

        let store = CatalogStore::open(dir.path(), BTreeSet::new())?;
        assert!(store.is_published("A"));
        Ok(())
    }
}
