// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Orchestrates a single isolated-build run: archive the catalog, provision
//! the VM, plan what needs building, build it, assemble docs, and publish.

mod cli;
mod docs;
mod engine;
mod packaging;
mod provisioner;
mod summary;

use std::{process::ExitCode, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use cliutil::{cli_main, expanded_args_os};
use planner::{build_plan, compute_derived_sets, explain};
use publisher::{CatalogServer, CatalogStore};
use vmadapter::{VmAdapter, VmConfig};

use cli::Cli;
use engine::{BuildEngine, EngineConfig, EngineSummary};

fn do_main() -> Result<()> {
    let cli = Cli::try_parse_from(expanded_args_os()?)?;

    let mirror_dir = cli.work_dir.join("mirror");
    let store_dir = cli.work_dir.join("store");
    let server_dir = cli.work_dir.join("catalog");
    let scratch_dir = cli.work_dir.join("scratch");
    std::fs::create_dir_all(&scratch_dir)
        .with_context(|| format!("failed to create {scratch_dir:?}"))?;

    let timeout = Duration::from_secs(cli.timeout);

    let catalog = if cli.skip_archive {
        catalog::load_cached(&mirror_dir)?
    } else {
        catalog::archive_catalogs(&cli.snapshot_url, &cli.pkg_catalogs, &mirror_dir)?
    };

    let vm = VmAdapter::new(VmConfig {
        host: cli.vm.vm_host.clone(),
        user: cli.vm.vm_user.clone(),
        ssh_port: cli.vm.vm_ssh_port,
        catalog_port: cli.server_port,
        snapshot_dir: cli.work_dir.join("snapshots"),
    });

    let store = artifactstore::ArtifactStore::new(&store_dir)?;

    let provision_result = if cli.skip_install
        && provisioner::installed_snapshot_ready(&vm, &cli.work_dir)?
    {
        tracing::info!("reusing cached installed snapshot for VM {}", cli.vm.vm_name);
        provisioner::load_cached_baseline(&cli.work_dir)?
    } else {
        provisioner::provision(
            &vm,
            &store,
            &cli.snapshot_url,
            &cli.installer_platform_name,
            &cli.vm_init_snapshot,
            &cli.vm.vm_dir,
            &cli.work_dir,
            timeout,
        )?
    };
    let baseline = provision_result.baseline;

    let mut catalog_store = CatalogStore::open(&server_dir, catalog.snapshot_pkgs.clone())?;
    let _server = CatalogServer::start(server_dir, cli.server_port)?;

    let derived = compute_derived_sets(&catalog, &baseline, &store)?;

    if cli.dry_run {
        for name in &catalog.all_pkgs {
            println!("{name}: {:?}", explain(&catalog, &derived, name));
        }
        return Ok(());
    }

    let plan = build_plan(&catalog, &derived.need_pkgs);

    let summary = if cli.skip_build {
        EngineSummary::default()
    } else {
        let config = EngineConfig {
            max_build_together: cli.max_build_together,
            timeout,
            vm_dir: cli.vm.vm_dir.clone(),
            scratch_dir: scratch_dir.clone(),
        };
        let mut engine = BuildEngine::new(&vm, &store, &mut catalog_store, &catalog, &baseline, &config);
        engine.run_plan(&plan)?
    };

    let docs_built = if cli.skip_docs {
        false
    } else {
        let documented = docs::packages_with_docs(&store)?;
        docs::assemble(
            &vm,
            &documented,
            &cli.vm.vm_dir,
            &cli.work_dir.join("docs.tar"),
            timeout,
        )?;
        !documented.is_empty()
    };

    print!("{}", summary::format_summary(&summary, docs_built));
    Ok(())
}

fn main() -> ExitCode {
    cli_main(do_main, Default::default())
}
