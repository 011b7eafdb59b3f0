// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Result;
use std::fs::{set_permissions, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Like [`std::fs::remove_dir_all`], but recovers from permission bits that
/// would otherwise make entries inaccessible (e.g. a directory with no
/// execute bit, or a file with no write bit on its parent).
///
/// Artifact-store cleanup and salvage paths may need to remove trees staged
/// by a VM-side install, whose permissions are not under our control.
pub fn remove_dir_all_with_chmod(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(_) => {
            force_writable(dir)?;
            std::fs::remove_dir_all(dir)?;
            Ok(())
        }
    }
}

fn force_writable(path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(path)?;
    if metadata.file_type().is_symlink() {
        return Ok(());
    }
    let mode = metadata.permissions().mode() | 0o700;
    set_permissions(path, Permissions::from_mode(mode))?;
    if metadata.is_dir() {
        for entry in std::fs::read_dir(path)? {
            force_writable(&entry?.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir, set_permissions, File};

    #[test]
    fn removes_unwritable_tree() -> Result<()> {
        let root = tempfile::tempdir()?;
        let bad = root.path().join("bad");
        create_dir(&bad)?;
        File::create(bad.join("file"))?;
        set_permissions(&bad, Permissions::from_mode(0o000))?;

        remove_dir_all_with_chmod(root.path())?;
        assert!(!root.path().try_exists()?);
        Ok(())
    }
}
