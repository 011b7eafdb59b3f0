// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Doc Assembler (C8): after all builds complete, installs the union of
//! every package with non-empty documentation in one VM session and tars
//! the resulting combined documentation tree.

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::{ensure, Context, Result};
use artifactstore::ArtifactStore;
use vmadapter::{VmAdapter, VmSession};

/// A doc manifest is a name→list map: each key is a package name, and its
/// value is the (possibly empty) list of doc entries produced for it. A
/// manifest file may cover just one package (the baseline capture) or every
/// member of a group (the sandbox's own per-group extraction).
type DocManifest = BTreeMap<String, Vec<String>>;

/// Selects every package in the artifact store whose doc manifest declares
/// non-empty docs for itself (its own key in the name→list map is present
/// and non-empty), whether captured from the baseline install or a build
/// this run.
pub fn packages_with_docs(store: &ArtifactStore) -> Result<Vec<String>> {
    let mut result = Vec::new();
    for name in store.documented_packages()? {
        let Some(bytes) = store.read_docs(&name)? else {
            continue;
        };
        let manifest: DocManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse doc manifest for {name}"))?;
        if manifest.get(&name).map(|docs| !docs.is_empty()).unwrap_or(false) {
            result.push(name);
        }
    }
    Ok(result)
}

/// Installs the union of documented packages in one VM session and pulls
/// back a combined documentation tarball to `dest_tar`.
pub fn assemble(
    vm: &VmAdapter,
    packages: &[String],
    vm_dir: &Path,
    dest_tar: &Path,
    timeout: Duration,
) -> Result<()> {
    if packages.is_empty() {
        return Ok(());
    }

    let _session = VmSession::acquire(vm, "installed", false)?;

    let mut install_cmd = vec!["raco".to_string(), "pkg".to_string(), "install".to_string()];
    install_cmd.extend(packages.iter().cloned());
    let outcome = vm.remote_exec(&install_cmd, timeout, None)?;
    ensure!(
        outcome.is_ok(),
        "doc assembly install failed:\n{}",
        outcome.transcript()
    );

    let remote_tar = vm_dir.join("docs.tar");
    let tar_cmd = vec![
        "tar".to_string(),
        "-cf".to_string(),
        remote_tar.to_string_lossy().into_owned(),
        "-C".to_string(),
        "/usr/share/doc".to_string(),
        ".".to_string(),
    ];
    let outcome = vm.remote_exec(&tar_cmd, timeout, None)?;
    ensure!(
        outcome.is_ok(),
        "doc archive creation failed:\n{}",
        outcome.transcript()
    );

    vm.file_pull(&remote_tar, dest_tar, false)
}
