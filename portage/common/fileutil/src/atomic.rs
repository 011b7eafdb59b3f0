// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Atomically replaces the contents of `path` with `contents`.
///
/// Writes to a sibling temporary file in the same directory and renames it
/// into place, so that concurrent readers (e.g. the catalog HTTP server)
/// never observe a partially-written file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().with_context(|| format!("{path:?} has no parent directory"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create a temporary file next to {path:?}"))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {path:?}"))?;
    Ok(())
}

/// Like [`atomic_write`], but takes an already-open [`File`] producer so
/// callers that stream large content (e.g. a zip archive) don't have to
/// buffer it in memory first.
pub fn atomic_replace_with<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = path.parent().with_context(|| format!("{path:?} has no parent directory"))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create a temporary file next to {path:?}"))?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {path:?}"))?;
    Ok(())
}
