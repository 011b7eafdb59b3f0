// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Build Engine (C6): attempts plan elements against the VM in batches,
//! bisecting a batch that fails together and recording per-package outcomes.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use anyhow::{Context, Result};
use artifactstore::ArtifactStore;
use catalog::{PackageCatalog, PackageDetails};
use planner::PlanElement;
use publisher::CatalogStore;
use vmadapter::{CommandOutcome, VmAdapter, VmSession};

pub struct EngineConfig {
    pub max_build_together: usize,
    pub timeout: Duration,
    /// Remote working directory inside the VM.
    pub vm_dir: std::path::PathBuf,
    /// Host-local scratch directory for staging files pulled from the VM.
    pub scratch_dir: std::path::PathBuf,
}

#[derive(Debug, Default)]
pub struct EngineSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

pub struct BuildEngine<'a> {
    vm: &'a VmAdapter,
    store: &'a ArtifactStore,
    catalog_store: &'a mut CatalogStore,
    catalog: &'a PackageCatalog,
    baseline: &'a BTreeSet<String>,
    config: &'a EngineConfig,
}

impl<'a> BuildEngine<'a> {
    pub fn new(
        vm: &'a VmAdapter,
        store: &'a ArtifactStore,
        catalog_store: &'a mut CatalogStore,
        catalog: &'a PackageCatalog,
        baseline: &'a BTreeSet<String>,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            vm,
            store,
            catalog_store,
            catalog,
            baseline,
            config,
        }
    }

    pub fn run_plan(&mut self, plan: &[PlanElement]) -> Result<EngineSummary> {
        let mut summary = EngineSummary::default();
        for batch in batch_by_size(plan, self.config.max_build_together) {
            self.attempt_batch(&batch, &mut summary)?;
        }
        Ok(summary)
    }

    fn attempt_batch(&mut self, batch: &[PlanElement], summary: &mut EngineSummary) -> Result<()> {
        if batch.len() > 1 {
            let total: usize = batch.iter().map(|e| e.members().len()).sum();
            if total > self.config.max_build_together {
                let (first, second) = split_batch(batch);
                self.attempt_batch(&first, summary)?;
                self.attempt_batch(&second, summary)?;
                return Ok(());
            }
        }

        let members: Vec<String> = batch
            .iter()
            .flat_map(|e| e.members().iter().cloned())
            .collect();

        self.store.invalidate(&members.iter().cloned().collect())?;

        let outcome = self.attempt_once(&members)?;

        match outcome {
            AttemptOutcome::Success {
                transcript,
                artifacts,
            } => {
                // Packaging failure after a successful install still sinks
                // that member: it never achieved the "zip on disk" part of a
                // full success, so it's recorded as failed and salvaged
                // rather than published with no archive to publish.
                let (packaged, unpackaged): (Vec<String>, Vec<String>) = members
                    .iter()
                    .cloned()
                    .partition(|name| artifacts.get(name).map_or(false, |a| a.zip.is_some()));

                if !unpackaged.is_empty() {
                    let failure_transcript = format!(
                        "{transcript}\npackaging failed to produce an archive for: {}",
                        unpackaged.join(", ")
                    );
                    self.record_failure(&unpackaged, &failure_transcript, &artifacts)?;
                    summary.failed.extend(unpackaged);
                }

                for name in &packaged {
                    let details = self
                        .catalog
                        .get(name)
                        .with_context(|| format!("{name} missing from catalog"))?;
                    let checksum = details.checksum.clone();
                    let artifact = artifacts.get(name).expect("partitioned on zip presence");
                    self.store
                        .write_zip(name, artifact.zip.as_ref().expect("partitioned on zip presence"))?;
                    if let Some(docs_bytes) = &artifact.docs {
                        self.store.write_docs(name, docs_bytes)?;
                    }
                    self.store.mark_success(name, &checksum, &transcript)?;
                }
                if !packaged.is_empty() {
                    self.publish_group(&packaged)?;
                }
                summary.succeeded.extend(packaged);
            }
            AttemptOutcome::Failure {
                transcript,
                artifacts,
            } => {
                if batch.len() == 1 {
                    self.record_failure(&members, &transcript, &artifacts)?;
                    summary.failed.extend(members);
                } else {
                    let (first, second) = split_batch(batch);
                    self.attempt_batch(&first, summary)?;
                    self.attempt_batch(&second, summary)?;
                }
            }
        }
        Ok(())
    }

    /// Writes a best-effort salvage of a finally-failed single-item group:
    /// whatever zip/docs the attempt managed to produce go to the dumpster
    /// rather than the published store, alongside the failure marker.
    fn record_failure(
        &self,
        members: &[String],
        transcript: &str,
        artifacts: &BTreeMap<String, MemberArtifacts>,
    ) -> Result<()> {
        for name in members {
            let details = self
                .catalog
                .get(name)
                .with_context(|| format!("{name} missing from catalog"))?;
            self.store.mark_fail(name, &details.checksum, transcript)?;
            let artifact = artifacts.get(name);
            let zip = artifact.and_then(|a| a.zip.as_deref());
            let docs = artifact.and_then(|a| a.docs.as_deref());
            self.store.salvage_to_dumpster(name, zip, docs);
        }
        Ok(())
    }

    fn publish_group(&mut self, members: &[String]) -> Result<()> {
        let mut entries = Vec::new();
        for name in members {
            let zip_checksum = artifactstore::hash_file(&self.store.zip_path(name))
                .with_context(|| format!("failed to hash zip for {name}"))?;
            entries.push((
                name.clone(),
                PackageDetails {
                    checksum: zip_checksum,
                    source: format!("pkgs/{name}.zip"),
                    dependencies: self
                        .catalog
                        .get(name)
                        .map(|d| d.dependencies.clone())
                        .unwrap_or_default(),
                },
            ));
        }
        self.catalog_store.publish_group(entries)
    }

    /// Runs one full group-attempt protocol: restore+start the VM (scoped),
    /// install the group, and attempt doc/archive extraction regardless of
    /// whether the install itself succeeded, so a failed attempt still has
    /// something to salvage. Only the install outcome and the leakage check
    /// decide overall pass/fail.
    fn attempt_once(&self, members: &[String]) -> Result<AttemptOutcome> {
        let _session = VmSession::acquire(self.vm, "installed", false)?;

        let install_cmd = build_install_command(members, members.len() > 1);
        let capture_dest = self.store.fail_path(&members[0]);
        let install_outcome =
            self.vm
                .remote_exec(&install_cmd, self.config.timeout, Some(&capture_dest))?;

        let artifacts = self.collect_artifacts(members);

        if !install_outcome.is_ok() {
            return Ok(AttemptOutcome::Failure {
                transcript: install_outcome.transcript().to_string(),
                artifacts,
            });
        }

        if let Some(leak) = self.check_leakage(members)? {
            return Ok(AttemptOutcome::Failure {
                transcript: format!(
                    "{}\nuse of package not previously built: {leak}",
                    install_outcome.transcript()
                ),
                artifacts,
            });
        }

        Ok(AttemptOutcome::Success {
            transcript: install_outcome.transcript().to_string(),
            artifacts,
        })
    }

    /// Best-effort packaging and doc extraction for every member, independent
    /// of whether the install that just ran actually succeeded.
    fn collect_artifacts(&self, members: &[String]) -> BTreeMap<String, MemberArtifacts> {
        let mut result = BTreeMap::new();
        for name in members {
            let zip = crate::packaging::package_from_vm(
                self.vm,
                name,
                &self.config.vm_dir,
                &self.config.scratch_dir,
                self.config.timeout,
            )
            .unwrap_or_else(|err| {
                tracing::warn!("failed to package {name}: {err:#}");
                None
            });
            let docs = self.pull_docs(name).unwrap_or_else(|err| {
                tracing::warn!("failed to pull docs for {name}: {err:#}");
                None
            });
            result.insert(name.clone(), MemberArtifacts { zip, docs });
        }
        result
    }

    fn pull_docs(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let remote_manifest = self.config.vm_dir.join(format!("{name}-docs.json"));
        let local_manifest = self.config.scratch_dir.join(format!("{name}-docs.json"));
        if self
            .vm
            .file_pull(&remote_manifest, &local_manifest, true)
            .is_ok()
            && local_manifest.is_file()
        {
            Ok(Some(std::fs::read(&local_manifest)?))
        } else {
            Ok(None)
        }
    }

    fn check_leakage(&self, members: &[String]) -> Result<Option<String>> {
        let outcome = self.vm.remote_exec(
            &[
                "raco".to_string(),
                "pkg".to_string(),
                "show".to_string(),
                "--installed".to_string(),
            ],
            self.config.timeout,
            None,
        )?;
        if !outcome.is_ok() {
            return Ok(Some("failed to query installed packages".to_string()));
        }
        let installed: BTreeSet<String> = outcome
            .transcript()
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok(leakage_violation(
            &installed,
            &members.iter().cloned().collect(),
            self.baseline,
            self.catalog_store,
        ))
    }
}

struct MemberArtifacts {
    zip: Option<Vec<u8>>,
    docs: Option<Vec<u8>>,
}

enum AttemptOutcome {
    Success {
        transcript: String,
        artifacts: BTreeMap<String, MemberArtifacts>,
    },
    Failure {
        transcript: String,
        artifacts: BTreeMap<String, MemberArtifacts>,
    },
}

fn build_install_command(members: &[String], permissive: bool) -> Vec<String> {
    let mut cmd = vec!["raco".to_string(), "pkg".to_string(), "install".to_string()];
    if permissive {
        cmd.push("--ignore-errors".to_string());
    } else {
        cmd.push("--fail-fast".to_string());
    }
    cmd.extend(members.iter().cloned());
    cmd
}

/// Returns an explanation if any newly-installed package isn't accounted for
/// by the attempted batch, the baseline, or the already-published catalog.
fn leakage_violation(
    installed_after: &BTreeSet<String>,
    batch_members: &BTreeSet<String>,
    baseline: &BTreeSet<String>,
    published: &CatalogStore,
) -> Option<String> {
    installed_after
        .iter()
        .find(|name| {
            !batch_members.contains(name.as_str())
                && !baseline.contains(name.as_str())
                && !published.is_published(name)
        })
        .cloned()
}

/// Greedily packs consecutive plan elements into batches no larger than
/// `max_build_together` packages, without ever splitting a single plan
/// element (an SCC can't be attempted partially).
fn batch_by_size(plan: &[PlanElement], max_build_together: usize) -> Vec<Vec<PlanElement>> {
    let mut batches = Vec::new();
    let mut current: Vec<PlanElement> = Vec::new();
    let mut current_size = 0usize;

    for element in plan {
        let size = element.members().len();
        if !current.is_empty() && current_size + size > max_build_together {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        if size > max_build_together {
            tracing::warn!(
                "plan element {:?} has {size} members, exceeding max_build_together={max_build_together}; attempting it whole since it is atomic",
                element.members()
            );
        }
        current_size += size;
        current.push(element.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn split_batch(batch: &[PlanElement]) -> (Vec<PlanElement>, Vec<PlanElement>) {
    let mid = (batch.len() / 2).max(1);
    (batch[..mid].to_vec(), batch[mid..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn single(name: &str) -> PlanElement {
        PlanElement::Single(name.to_string())
    }

    fn group(names: &[&str]) -> PlanElement {
        PlanElement::Group(names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn batches_pack_up_to_the_limit() {
        let plan = vec![single("A"), single("B"), single("C")];
        let batches = batch_by_size(&plan, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn oversized_atomic_group_is_its_own_batch() {
        let plan = vec![single("A"), group(&["B", "C", "D"])];
        let batches = batch_by_size(&plan, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1][0].members().len(), 3);
    }

    #[test]
    fn split_batch_never_splits_inside_an_element() {
        let batch = vec![single("A"), group(&["B", "C"]), single("D")];
        let (first, second) = split_batch(&batch);
        assert_eq!(first.len() + second.len(), batch.len());
        for element in first.iter().chain(second.iter()) {
            assert!(!element.members().is_empty());
        }
    }

    #[test]
    fn leakage_violation_flags_unaccounted_package() {
        let dir = tempfile::tempdir().unwrap();
        let published = CatalogStore::open(dir.path(), BTreeSet::new()).unwrap();
        let installed = BTreeSet::from(["A".to_string(), "sneaky".to_string()]);
        let batch = BTreeSet::from(["A".to_string()]);
        let baseline = BTreeSet::new();

        let violation = leakage_violation(&installed, &batch, &baseline, &published);
        assert_eq!(violation, Some("sneaky".to_string()));
    }

    #[test]
    fn leakage_violation_allows_baseline_and_published_packages() {
        let dir = tempfile::tempdir().unwrap();
        let mut published = CatalogStore::open(dir.path(), BTreeSet::new()).unwrap();
        published
            .publish_group([(
                "already-built".to_string(),
                PackageDetails {
                    checksum: "h".to_string(),
                    source: "pkgs/already-built.zip".to_string(),
                    dependencies: vec![],
                },
            )])
            .unwrap();

        let installed = BTreeSet::from([
            "A".to_string(),
            "base".to_string(),
            "already-built".to_string(),
        ]);
        let batch = BTreeSet::from(["A".to_string()]);
        let baseline = BTreeSet::from(["base".to_string()]);

        assert_eq!(
            leakage_violation(&installed, &batch, &baseline, &published),
            None
        );
    }
}
