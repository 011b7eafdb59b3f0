// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Turns a package's installed tree, pulled from the VM as a tarball, into
//! the zip archive format the artifact store keeps.

use std::{
    fs::File,
    io::{self, Cursor},
    path::Path,
    process::Command,
    time::Duration,
};

use anyhow::{Context, Result};
use vmadapter::VmAdapter;
use walkdir::WalkDir;
use zip::{write::FileOptions, ZipWriter};

/// Pulls `name`'s installed tree from the VM as a tarball, extracts it
/// locally, and re-packages it as a zip. Returns `None` if the remote tar
/// step itself fails (the caller treats that as "nothing to package", not a
/// build failure — the install outcome already determined success/failure).
pub fn package_from_vm(
    vm: &VmAdapter,
    name: &str,
    vm_dir: &Path,
    scratch_dir: &Path,
    timeout: Duration,
) -> Result<Option<Vec<u8>>> {
    let remote_tar = vm_dir.join(format!("{name}.tar"));
    let tar_cmd = vec![
        "tar".to_string(),
        "-cf".to_string(),
        remote_tar.to_string_lossy().into_owned(),
        "-C".to_string(),
        format!("/var/lib/raco/pkgs/{name}"),
        ".".to_string(),
    ];
    let outcome = vm.remote_exec(&tar_cmd, timeout, None)?;
    if !outcome.is_ok() {
        return Ok(None);
    }

    let local_tar = scratch_dir.join(format!("{name}.tar"));
    vm.file_pull(&remote_tar, &local_tar, true)?;
    if !local_tar.is_file() {
        return Ok(None);
    }

    let extract_dir = scratch_dir.join(format!("{name}-extracted"));
    std::fs::create_dir_all(&extract_dir)
        .with_context(|| format!("failed to create {extract_dir:?}"))?;
    processes::run_and_check(
        Command::new("tar")
            .arg("-xf")
            .arg(&local_tar)
            .arg("-C")
            .arg(&extract_dir),
    )
    .with_context(|| format!("failed to extract {local_tar:?}"))?;

    Ok(Some(zip_directory(&extract_dir)?))
}

fn zip_directory(dir: &Path) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    {
        let mut writer = ZipWriter::new(Cursor::new(&mut buf));
        let options =
            FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.with_context(|| format!("failed to walk {dir:?}"))?;
            let rel = entry
                .path()
                .strip_prefix(dir)
                .with_context(|| format!("{:?} is not under {dir:?}", entry.path()))?;
            if rel.as_os_str().is_empty() {
                continue;
            }
            let name = rel.to_string_lossy();

            if entry.file_type().is_dir() {
                writer
                    .add_directory(name, options)
                    .with_context(|| format!("failed to add directory {name} to zip"))?;
            } else if entry.file_type().is_file() {
                writer
                    .start_file(name.clone(), options)
                    .with_context(|| format!("failed to add file {name} to zip"))?;
                let mut file = File::open(entry.path())
                    .with_context(|| format!("failed to open {:?}", entry.path()))?;
                io::copy(&mut file, &mut writer)
                    .with_context(|| format!("failed to write {name} into zip"))?;
            }
        }
        writer.finish().context("failed to finalize zip archive")?;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_directory_preserves_file_contents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("doc"))?;
        std::fs::write(dir.path().join("doc/readme.txt"), b"hello")?;

        let bytes = zip_directory(dir.path())?;
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        let mut entry = archive.by_name("doc/readme.txt")?;
        let mut contents = String::new();
        io::Read::read_to_string(&mut entry, &mut contents)?;
        assert_eq!(contents, "hello");
        Ok(())
    }
}
