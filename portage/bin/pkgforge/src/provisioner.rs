// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Installer Provisioner (C2): establishes the `installed` snapshot and the
//! baseline package set every subsequent build attempt starts from.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::Read,
    path::Path,
    time::Duration,
};

use anyhow::{ensure, Context, Result};
use artifactstore::ArtifactStore;
use serde::{Deserialize, Serialize};
use vmadapter::VmAdapter;

const INSTALLED_SNAPSHOT: &str = "installed";
const BASELINE_CACHE_FILE: &str = "baseline.json";
const INSTALLER_TABLE_PATH: &str = "installers/table.rktd";

#[derive(Debug, Serialize, Deserialize)]
struct BaselineCache {
    packages: BTreeSet<String>,
}

/// Result of provisioning: the baseline package set `I` every plan excludes.
pub struct ProvisionResult {
    pub baseline: BTreeSet<String>,
}

/// Runs the full provisioning sequence: restore the clean snapshot, fetch
/// and run the installer, query the resulting package set, and snapshot the
/// result as `installed`.
pub fn provision(
    adapter: &VmAdapter,
    store: &ArtifactStore,
    snapshot_url: &url::Url,
    installer_platform_name: &str,
    vm_init_snapshot: &str,
    vm_dir: &Path,
    work_dir: &Path,
    timeout: Duration,
) -> Result<ProvisionResult> {
    adapter.snapshot_restore(vm_init_snapshot)?;
    let _session = vmadapter::VmSession::acquire(adapter, vm_init_snapshot, false)?;

    let installer_name = fetch_installer_name(snapshot_url, installer_platform_name)?;
    let local_installer = work_dir.join(&installer_name);
    download_installer(snapshot_url, &installer_name, &local_installer)?;

    let remote_installer = vm_dir.join(&installer_name);
    adapter.file_push(&local_installer, &remote_installer)?;

    let outcome = adapter.remote_exec(
        &[
            "sh".to_string(),
            remote_installer.to_string_lossy().into_owned(),
        ],
        timeout,
        None,
    )?;
    ensure!(
        outcome.is_ok(),
        "installer failed:\n{}",
        outcome.transcript()
    );

    let baseline = query_installed_packages(adapter, timeout)?;
    capture_baseline_docs(adapter, &baseline, store, timeout)?;

    adapter.snapshot_delete(INSTALLED_SNAPSHOT)?;
    adapter.snapshot_take(INSTALLED_SNAPSHOT)?;

    write_baseline_cache(work_dir, &baseline)?;

    Ok(ProvisionResult { baseline })
}

/// Loads the baseline cached by a previous [`provision`] call, for
/// `--skip-install` runs. The caller is responsible for having verified that
/// the `installed` snapshot still exists.
pub fn load_cached_baseline(work_dir: &Path) -> Result<ProvisionResult> {
    let path = work_dir.join(BASELINE_CACHE_FILE);
    let body = std::fs::read_to_string(&path)
        .with_context(|| format!("no cached baseline at {path:?}; run without --skip-install first"))?;
    let cache: BaselineCache =
        serde_json::from_str(&body).with_context(|| format!("failed to parse {path:?}"))?;
    Ok(ProvisionResult {
        baseline: cache.packages,
    })
}

pub fn installed_snapshot_ready(adapter: &VmAdapter, work_dir: &Path) -> Result<bool> {
    Ok(adapter.snapshot_exists(INSTALLED_SNAPSHOT)? && work_dir.join(BASELINE_CACHE_FILE).is_file())
}

fn write_baseline_cache(work_dir: &Path, baseline: &BTreeSet<String>) -> Result<()> {
    let cache = BaselineCache {
        packages: baseline.clone(),
    };
    let body = serde_json::to_vec_pretty(&cache).context("failed to serialize baseline cache")?;
    fileutil::atomic_write(&work_dir.join(BASELINE_CACHE_FILE), &body)
}

fn fetch_installer_name(snapshot_url: &url::Url, platform_name: &str) -> Result<String> {
    let table_url = snapshot_url
        .join(INSTALLER_TABLE_PATH)
        .with_context(|| format!("invalid snapshot URL {snapshot_url}"))?;
    let body = ureq::get(table_url.as_str())
        .call()
        .with_context(|| format!("failed to fetch installer table from {table_url}"))?
        .into_string()
        .with_context(|| format!("failed to read installer table from {table_url}"))?;

    let table: BTreeMap<String, String> = serde_json::from_str(&body)
        .with_context(|| format!("failed to parse installer table from {table_url}"))?;
    table
        .get(platform_name)
        .cloned()
        .with_context(|| format!("platform {platform_name:?} not found in installer table"))
}

fn download_installer(snapshot_url: &url::Url, name: &str, dest: &Path) -> Result<()> {
    let installer_url = snapshot_url
        .join(&format!("installers/{name}"))
        .with_context(|| format!("invalid snapshot URL {snapshot_url}"))?;
    let mut reader = ureq::get(installer_url.as_str())
        .call()
        .with_context(|| format!("failed to fetch installer from {installer_url}"))?
        .into_reader();
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read installer body from {installer_url}"))?;
    fileutil::atomic_write(dest, &bytes)
}

/// Captures a doc manifest for every baseline package, since these packages
/// never pass through the Build Engine's own per-group doc extraction.
///
/// `raco pkg doc-manifest --installed` returns a single name→list map
/// covering every installed package; each baseline package gets its own
/// `docs/P-docs.json` file holding just its own entry from that map, so
/// later readers (`docs::packages_with_docs`) only ever need to look up a
/// package's own key to decide whether it has non-empty docs.
fn capture_baseline_docs(
    adapter: &VmAdapter,
    baseline: &BTreeSet<String>,
    store: &ArtifactStore,
    timeout: Duration,
) -> Result<()> {
    if baseline.is_empty() {
        return Ok(());
    }
    let outcome = adapter.remote_exec(
        &[
            "raco".to_string(),
            "pkg".to_string(),
            "doc-manifest".to_string(),
            "--installed".to_string(),
        ],
        timeout,
        None,
    )?;
    if !outcome.is_ok() {
        tracing::warn!("failed to capture baseline doc manifest: {}", outcome.transcript());
        return Ok(());
    }

    let manifest: BTreeMap<String, Vec<String>> = serde_json::from_str(outcome.transcript())
        .context("failed to parse baseline doc manifest")?;
    for name in baseline {
        let Some(docs) = manifest.get(name) else {
            continue;
        };
        let mut own_entry = BTreeMap::new();
        own_entry.insert(name.clone(), docs.clone());
        let body = serde_json::to_vec(&own_entry)
            .with_context(|| format!("failed to serialize doc manifest for {name}"))?;
        store.write_docs(name, &body)?;
    }
    Ok(())
}

fn query_installed_packages(adapter: &VmAdapter, timeout: Duration) -> Result<BTreeSet<String>> {
    let outcome = adapter.remote_exec(
        &[
            "raco".to_string(),
            "pkg".to_string(),
            "show".to_string(),
            "--installed".to_string(),
        ],
        timeout,
        None,
    )?;
    ensure!(
        outcome.is_ok(),
        "failed to query installed packages:\n{}",
        outcome.transcript()
    );
    Ok(parse_package_list(outcome.transcript()))
}

fn parse_package_list(transcript: &str) -> BTreeSet<String> {
    transcript
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
