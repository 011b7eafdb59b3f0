// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! On-disk layout of checksums, built archives, success/failure markers and
//! the failed-build dumpster (C3, the Artifact Store).
//!
//! Every mutating operation here is file-backed and atomic (write to a
//! sibling temp file, then rename) so that a crash mid-write can never leave
//! a `pkgs/P.zip` whose `orig-CHECKSUM` disagrees with the source checksum.

use std::{
    collections::BTreeSet,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

const PKGS_DIR: &str = "pkgs";
const SUCCESS_DIR: &str = "success";
const FAIL_DIR: &str = "fail";
const DOCS_DIR: &str = "docs";
const DUMPSTER_DIR: &str = "dumpster";

/// Handle onto the artifact store rooted at `work_dir`. Cheap to construct;
/// holds no open file descriptors.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(work_dir: &Path) -> Result<Self> {
        let store = Self {
            root: work_dir.to_path_buf(),
        };
        for dir in [
            store.pkgs_dir(),
            store.success_dir(),
            store.fail_dir(),
            store.docs_dir(),
            store.dumpster_dir().join(PKGS_DIR),
            store.dumpster_dir().join(DOCS_DIR),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("failed to create {dir:?}"))?;
        }
        Ok(store)
    }

    fn pkgs_dir(&self) -> PathBuf {
        self.root.join(PKGS_DIR)
    }

    fn success_dir(&self) -> PathBuf {
        self.root.join(SUCCESS_DIR)
    }

    fn fail_dir(&self) -> PathBuf {
        self.root.join(FAIL_DIR)
    }

    fn docs_dir(&self) -> PathBuf {
        self.root.join(DOCS_DIR)
    }

    fn dumpster_dir(&self) -> PathBuf {
        self.root.join(DUMPSTER_DIR)
    }

    pub fn orig_checksum_path(&self, name: &str) -> PathBuf {
        self.pkgs_dir().join(format!("{name}.orig-CHECKSUM"))
    }

    pub fn zip_path(&self, name: &str) -> PathBuf {
        self.pkgs_dir().join(format!("{name}.zip"))
    }

    pub fn zip_checksum_path(&self, name: &str) -> PathBuf {
        self.pkgs_dir().join(format!("{name}.zip.CHECKSUM"))
    }

    pub fn success_path(&self, name: &str) -> PathBuf {
        self.success_dir().join(name)
    }

    pub fn fail_path(&self, name: &str) -> PathBuf {
        self.fail_dir().join(name)
    }

    pub fn docs_path(&self, name: &str) -> PathBuf {
        self.docs_dir().join(format!("{name}-docs.json"))
    }

    pub fn orig_checksum(&self, name: &str) -> Result<Option<String>> {
        read_optional(&self.orig_checksum_path(name))
    }

    pub fn set_orig_checksum(&self, name: &str, checksum: &str) -> Result<()> {
        fileutil::atomic_write(&self.orig_checksum_path(name), checksum.as_bytes())
    }

    pub fn has_zip(&self, name: &str) -> bool {
        self.zip_path(name).is_file() && self.zip_checksum_path(name).is_file()
    }

    pub fn is_success(&self, name: &str) -> bool {
        self.success_path(name).is_file()
    }

    pub fn is_fail(&self, name: &str) -> bool {
        self.fail_path(name).is_file()
    }

    pub fn fail_transcript(&self, name: &str) -> Result<Option<String>> {
        read_optional(&self.fail_path(name))
    }

    /// Writes the built archive and its content checksum atomically, in that
    /// order, and returns the hex-encoded checksum.
    pub fn write_zip(&self, name: &str, zip_bytes: &[u8]) -> Result<String> {
        let checksum = hash_bytes(zip_bytes);
        fileutil::atomic_write(&self.zip_path(name), zip_bytes)
            .with_context(|| format!("failed to write zip for {name}"))?;
        fileutil::atomic_write(&self.zip_checksum_path(name), checksum.as_bytes())
            .with_context(|| format!("failed to write zip checksum for {name}"))?;
        Ok(checksum)
    }

    pub fn write_docs(&self, name: &str, manifest: &[u8]) -> Result<()> {
        fileutil::atomic_write(&self.docs_path(name), manifest)
            .with_context(|| format!("failed to write docs for {name}"))
    }

    pub fn read_docs(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.docs_path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context("failed to read docs"),
        }
    }

    /// Lists every package name that has a doc manifest on record, whether
    /// captured from the baseline install or a successful build.
    pub fn documented_packages(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let dir = self.docs_dir();
        for entry in fs::read_dir(&dir).with_context(|| format!("failed to read {dir:?}"))? {
            let entry = entry.with_context(|| format!("failed to read entry in {dir:?}"))?;
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|s| s.strip_suffix("-docs.json"))
            else {
                continue;
            };
            names.push(stem.to_string());
        }
        names.sort();
        Ok(names)
    }

    /// Records a successful build: writes `success/P`, removes any stale
    /// `fail/P`, and updates `orig-CHECKSUM(P)`.
    pub fn mark_success(&self, name: &str, checksum: &str, message: &str) -> Result<()> {
        fileutil::atomic_write(&self.success_path(name), message.as_bytes())
            .with_context(|| format!("failed to write success marker for {name}"))?;
        remove_if_present(&self.fail_path(name))?;
        self.set_orig_checksum(name, checksum)
    }

    /// Records a failed build: writes the transcript to `fail/P` and updates
    /// `orig-CHECKSUM(P)` (a failed build still "accounts for" the checksum
    /// it was attempted against, per V1).
    pub fn mark_fail(&self, name: &str, checksum: &str, transcript: &str) -> Result<()> {
        fileutil::atomic_write(&self.fail_path(name), transcript.as_bytes())
            .with_context(|| format!("failed to write failure transcript for {name}"))?;
        remove_if_present(&self.success_path(name))?;
        self.set_orig_checksum(name, checksum)
    }

    /// Best-effort salvage of partial outputs from a failed group build.
    /// Failures here are ignored per the spec's salvage I/O policy; they are
    /// only logged at debug level.
    pub fn salvage_to_dumpster(&self, name: &str, zip_bytes: Option<&[u8]>, docs: Option<&[u8]>) {
        if let Some(zip_bytes) = zip_bytes {
            let dest = self.dumpster_dir().join(PKGS_DIR).join(format!("{name}.zip"));
            if let Err(err) = fileutil::atomic_write(&dest, zip_bytes) {
                tracing::debug!("failed to salvage zip for {name}: {err:#}");
            }
        }
        if let Some(docs) = docs {
            let dest = self
                .dumpster_dir()
                .join(DOCS_DIR)
                .join(format!("{name}-docs.json"));
            if let Err(err) = fileutil::atomic_write(&dest, docs) {
                tracing::debug!("failed to salvage docs for {name}: {err:#}");
            }
        }
    }

    /// Removes stale zip/CHECKSUM/orig-CHECKSUM files for every package about
    /// to be rebuilt, so a crash mid-attempt can't leave a zip whose
    /// `orig-CHECKSUM` silently disagrees with the current source checksum.
    pub fn invalidate(&self, names: &BTreeSet<String>) -> Result<()> {
        for name in names {
            remove_if_present(&self.zip_path(name))?;
            remove_if_present(&self.zip_checksum_path(name))?;
            remove_if_present(&self.orig_checksum_path(name))?;
        }
        Ok(())
    }
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hashes a zip file already on disk without loading it fully into memory.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("failed to open {path:?}"))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {path:?}")),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {path:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_success_clears_prior_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;

        store.mark_fail("A", "h1", "boom")?;
        assert!(store.is_fail("A"));

        store.mark_success("A", "h1", "ok")?;
        assert!(store.is_success("A"));
        assert!(!store.is_fail("A"));
        assert_eq!(store.orig_checksum("A")?, Some("h1".to_string()));
        Ok(())
    }

    #[test]
    fn write_zip_round_trips_checksum() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;

        let checksum = store.write_zip("A", b"zip contents")?;
        assert!(store.has_zip("A"));
        assert_eq!(hash_file(&store.zip_path("A"))?, checksum);
        assert_eq!(
            fs::read_to_string(store.zip_checksum_path("A"))?,
            checksum
        );
        Ok(())
    }

    #[test]
    fn documented_packages_lists_every_doc_manifest() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;

        store.write_docs("zeta", b"{}")?;
        store.write_docs("alpha", b"{}")?;

        assert_eq!(
            store.documented_packages()?,
            vec!["alpha".to_string(), "zeta".to_string()]
        );
        Ok(())
    }

    #[test]
    fn invalidate_removes_stale_artifacts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;

        store.write_zip("A", b"old contents")?;
        store.set_orig_checksum("A", "h1")?;

        let mut names = BTreeSet::new();
        names.insert("A".to_string());
        store.invalidate(&names)?;

        assert!(!store.has_zip("A"));
        assert_eq!(store.orig_checksum("A")?, None);
        Ok(())
    }

    #[test]
    fn salvage_ignores_write_failures() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;
        // Salvage should never panic or return an error, even in the happy path.
        store.salvage_to_dumpster("A", Some(b"partial zip"), Some(b"partial docs"));
        assert!(store
            .dumpster_dir()
            .join(PKGS_DIR)
            .join("A.zip")
            .is_file());
        Ok(())
    }
}
