// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use clap::Parser;
use url::Url;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root of all host-side state: the artifact store, the catalog mirror
    /// and the served built-catalog directory all live under here.
    #[arg(long)]
    pub work_dir: PathBuf,

    /// Base URL serving `installers/table.rktd` and the snapshot catalog.
    #[arg(long)]
    pub snapshot_url: Url,

    /// Key into `installers/table.rktd` selecting which installer to fetch.
    #[arg(long)]
    pub installer_platform_name: String,

    /// Extra catalog URLs to union into the snapshot catalog.
    #[arg(long, value_delimiter = ',')]
    pub pkg_catalogs: Vec<Url>,

    #[command(flatten)]
    pub vm: VmArgs,

    /// Name of the pristine snapshot restored before provisioning.
    #[arg(long, default_value = "clean")]
    pub vm_init_snapshot: String,

    /// Skip re-provisioning the VM when the `installed` snapshot and cached
    /// baseline listing are already current.
    #[arg(long)]
    pub skip_install: bool,

    /// Reuse the last archived catalog instead of re-fetching it.
    #[arg(long)]
    pub skip_archive: bool,

    /// Skip the build phase entirely (e.g. to only refresh the catalog).
    #[arg(long)]
    pub skip_build: bool,

    /// Skip the documentation assembly phase.
    #[arg(long)]
    pub skip_docs: bool,

    /// Per-command timeout, in seconds.
    #[arg(long, default_value_t = 600)]
    pub timeout: u64,

    /// Upper bound on the number of packages attempted together in one VM
    /// session before the batch is bisected.
    #[arg(long, default_value_t = 8)]
    pub max_build_together: usize,

    /// Loopback port the built-catalog HTTP server binds to.
    #[arg(long, default_value_t = 8080)]
    pub server_port: u16,

    /// Compute and print the build plan without touching the VM or the
    /// artifact store.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(clap::Args, Debug)]
pub struct VmArgs {
    /// Human-readable VM identity, used only in logs and transcripts.
    #[arg(long)]
    pub vm_name: String,

    /// Transport target: the VM's SSH host. `127.0.0.1` with no `--vm-user`
    /// short-circuits to local execution.
    #[arg(long)]
    pub vm_host: String,

    #[arg(long)]
    pub vm_user: Option<String>,

    #[arg(long, default_value_t = 22)]
    pub vm_ssh_port: u16,

    /// Remote working directory used to stage the installer and scratch
    /// files inside the VM.
    #[arg(long, default_value = "/tmp/pkgforge")]
    pub vm_dir: PathBuf,
}
