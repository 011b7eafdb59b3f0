// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Determines which packages need a build, condenses cyclic dependencies
//! into groups via union-find, and emits a topologically ordered plan (C4,
//! the Invalidation Planner).

mod union_find;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::Result;
use artifactstore::ArtifactStore;
use catalog::PackageCatalog;

use union_find::UnionFind;

/// The three derived sets from which `need_pkgs` follows, kept around so
/// [`explain`] can attribute a package's status without recomputing them.
#[derive(Debug, Default)]
pub struct DerivedSets {
    pub failed_pkgs: BTreeSet<String>,
    pub changed_pkgs: BTreeSet<String>,
    pub update_pkgs: BTreeSet<String>,
    pub need_pkgs: BTreeSet<String>,
}

/// Computes `failed_pkgs`, `changed_pkgs`, `update_pkgs` and `need_pkgs` for
/// the given catalog, baseline installed set and artifact store state.
pub fn compute_derived_sets(
    catalog: &PackageCatalog,
    baseline: &BTreeSet<String>,
    store: &ArtifactStore,
) -> Result<DerivedSets> {
    let mut failed_pkgs = BTreeSet::new();
    let mut changed_pkgs = BTreeSet::new();

    for name in &catalog.all_pkgs {
        let details = match catalog.get(name) {
            Some(d) => d,
            None => continue,
        };
        let orig = store.orig_checksum(name)?;
        let checksum_matches = orig.as_deref() == Some(details.checksum.as_str());
        let is_failed = store.is_fail(name);

        if !baseline.contains(name) && checksum_matches && is_failed {
            failed_pkgs.insert(name.clone());
        }

        let is_current = checksum_matches
            && (baseline.contains(name) || is_failed || store.has_zip(name));
        if !is_current {
            changed_pkgs.insert(name.clone());
        }
    }

    // Reverse-dependency map: for each package, who depends on it.
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (name, details) in &catalog.details {
        for dep in details.dependency_names() {
            dependents.entry(dep).or_default().push(name.as_str());
        }
    }

    let mut update_pkgs: BTreeSet<String> = changed_pkgs.clone();
    let mut worklist: Vec<String> = changed_pkgs.iter().cloned().collect();
    while let Some(name) = worklist.pop() {
        if let Some(deps) = dependents.get(name.as_str()) {
            for dependent in deps {
                if baseline.contains(*dependent) {
                    continue;
                }
                if update_pkgs.insert(dependent.to_string()) {
                    worklist.push(dependent.to_string());
                }
            }
        }
    }

    let need_pkgs: BTreeSet<String> = update_pkgs
        .iter()
        .filter(|name| !baseline.contains(*name) && !failed_pkgs.contains(*name))
        .cloned()
        .collect();

    Ok(DerivedSets {
        failed_pkgs,
        changed_pkgs,
        update_pkgs,
        need_pkgs,
    })
}

/// One element of a build plan: either a single package, or a non-empty set
/// of mutually dependent packages (an SCC) that must be attempted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanElement {
    Single(String),
    Group(Vec<String>),
}

impl PlanElement {
    pub fn members(&self) -> &[String] {
        match self {
            PlanElement::Single(name) => std::slice::from_ref(name),
            PlanElement::Group(names) => names,
        }
    }
}

struct Ordering<'a> {
    details: &'a BTreeMap<String, catalog::PackageDetails>,
    need: &'a BTreeSet<String>,
    uf: UnionFind,
    stack: Vec<String>,
    on_stack: HashSet<String>,
    visited: HashSet<String>,
    order: Vec<String>,
}

impl<'a> Ordering<'a> {
    fn visit(&mut self, name: &str) {
        if self.visited.contains(name) {
            return;
        }
        self.stack.push(name.to_string());
        self.on_stack.insert(name.to_string());

        if let Some(details) = self.details.get(name) {
            for dep in details.dependency_names() {
                if !self.need.contains(dep) {
                    continue;
                }
                if self.on_stack.contains(dep) {
                    // Back edge to an ancestor: everything from the cycle
                    // root (`dep`) down to the current package belongs to
                    // the same strongly connected set.
                    let pos = self.stack.iter().position(|n| n == dep).unwrap();
                    for member in &self.stack[pos..] {
                        self.uf.union(member, dep);
                    }
                } else {
                    self.visit(dep);
                }
            }
        }

        self.stack.pop();
        self.on_stack.remove(name);
        self.visited.insert(name.to_string());
        self.order.push(name.to_string());
    }
}

/// Orders `need_pkgs` into a plan, collapsing mutual dependencies into
/// groups. Every dependency of a plan element was either already built, is
/// in the baseline set, is a known up-to-date failure, or appears earlier in
/// the returned list (or shares its group).
pub fn build_plan(catalog: &PackageCatalog, need_pkgs: &BTreeSet<String>) -> Vec<PlanElement> {
    let mut ordering = Ordering {
        details: &catalog.details,
        need: need_pkgs,
        uf: UnionFind::default(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        visited: HashSet::new(),
        order: Vec::new(),
    };

    // BTreeSet iterates in lexicographic order already.
    for name in need_pkgs {
        ordering.visit(name);
    }

    let position: HashMap<&str, usize> = ordering
        .order
        .iter()
        .enumerate()
        .map(|(i, n)| (n.as_str(), i))
        .collect();

    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for name in need_pkgs {
        let root = ordering.uf.find(name);
        groups.entry(root).or_default().push(name.clone());
    }

    let mut group_list: Vec<(usize, Vec<String>)> = groups
        .into_values()
        .map(|mut members| {
            members.sort();
            let max_pos = members
                .iter()
                .map(|m| position[m.as_str()])
                .max()
                .expect("group is non-empty");
            (max_pos, members)
        })
        .collect();
    group_list.sort_by_key(|(pos, _)| *pos);

    group_list
        .into_iter()
        .map(|(_, members)| {
            if members.len() == 1 {
                PlanElement::Single(members.into_iter().next().unwrap())
            } else {
                PlanElement::Group(members)
            }
        })
        .collect()
}

/// Why a package is, or is not, in `need_pkgs`. A pure, read-only projection
/// over already-computed [`DerivedSets`] — used by `--dry-run` and by tests,
/// never by the planner itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Explanation {
    NotInCatalog,
    Current,
    FailedUpToDate,
    ChangedBecauseChecksum,
    ChangedBecauseDependency(String),
}

pub fn explain(catalog: &PackageCatalog, derived: &DerivedSets, name: &str) -> Explanation {
    if !catalog.all_pkgs.contains(name) {
        return Explanation::NotInCatalog;
    }
    if derived.failed_pkgs.contains(name) {
        return Explanation::FailedUpToDate;
    }
    if !derived.changed_pkgs.contains(name) {
        return Explanation::Current;
    }
    if let Some(details) = catalog.get(name) {
        for dep in details.dependency_names() {
            if derived.update_pkgs.contains(dep) {
                return Explanation::ChangedBecauseDependency(dep.to_string());
            }
        }
    }
    Explanation::ChangedBecauseChecksum
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::{Dep, PackageDetails};
    use std::collections::BTreeMap;

    fn details(checksum: &str, deps: &[&str]) -> PackageDetails {
        PackageDetails {
            checksum: checksum.to_string(),
            source: "http://example/src".to_string(),
            dependencies: deps.iter().map(|d| Dep::Name(d.to_string())).collect(),
        }
    }

    fn catalog_of(entries: &[(&str, &str, &[&str])]) -> PackageCatalog {
        let mut details_map = BTreeMap::new();
        let mut all_pkgs = BTreeSet::new();
        for (name, checksum, deps) in entries {
            details_map.insert(name.to_string(), details(checksum, deps));
            all_pkgs.insert(name.to_string());
        }
        PackageCatalog {
            details: details_map,
            snapshot_pkgs: BTreeSet::new(),
            all_pkgs,
        }
    }

    #[test]
    fn scenario_1_linear_dependency() -> Result<()> {
        let catalog = catalog_of(&[("A", "h1", &[]), ("B", "h2", &["A"])]);
        let store = ArtifactStore::new(tempfile::tempdir()?.path())?;
        let baseline = BTreeSet::new();

        let derived = compute_derived_sets(&catalog, &baseline, &store)?;
        assert_eq!(
            derived.need_pkgs,
            BTreeSet::from(["A".to_string(), "B".to_string()])
        );

        let plan = build_plan(&catalog, &derived.need_pkgs);
        assert_eq!(
            plan,
            vec![
                PlanElement::Single("A".to_string()),
                PlanElement::Single("B".to_string()),
            ]
        );
        Ok(())
    }

    #[test]
    fn scenario_2_checksum_change_invalidates_transitively() -> Result<()> {
        let catalog = catalog_of(&[("A", "h1p", &[]), ("B", "h2", &["A"])]);
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;

        // Simulate a prior successful build of both at the old checksum h1.
        store.write_zip("A", b"zip-a")?;
        store.mark_success("A", "h1", "ok")?;
        store.write_zip("B", b"zip-b")?;
        store.mark_success("B", "h2", "ok")?;

        let baseline = BTreeSet::new();
        let derived = compute_derived_sets(&catalog, &baseline, &store)?;

        // A's checksum changed (h1 -> h1p), so both A and its dependent B
        // are invalidated.
        assert!(derived.need_pkgs.contains("A"));
        assert!(derived.need_pkgs.contains("B"));
        Ok(())
    }

    #[test]
    fn scenario_3_mutual_dependency_forms_group() -> Result<()> {
        let catalog = catalog_of(&[("A", "h1", &["B"]), ("B", "h2", &["A"])]);
        let store = ArtifactStore::new(tempfile::tempdir()?.path())?;
        let baseline = BTreeSet::new();

        let derived = compute_derived_sets(&catalog, &baseline, &store)?;
        let plan = build_plan(&catalog, &derived.need_pkgs);

        assert_eq!(plan.len(), 1);
        match &plan[0] {
            PlanElement::Group(members) => {
                assert_eq!(members, &vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("expected a group, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn baseline_packages_are_never_rebuilt() -> Result<()> {
        let catalog = catalog_of(&[("A", "h1", &[]), ("B", "h2", &["A"])]);
        let store = ArtifactStore::new(tempfile::tempdir()?.path())?;
        let mut baseline = BTreeSet::new();
        baseline.insert("A".to_string());
        store.set_orig_checksum("A", "h1")?;

        let derived = compute_derived_sets(&catalog, &baseline, &store)?;
        assert!(!derived.need_pkgs.contains("A"));
        assert!(derived.need_pkgs.contains("B"));
        Ok(())
    }

    #[test]
    fn failed_up_to_date_package_occupies_no_build_slot() -> Result<()> {
        let catalog = catalog_of(&[("A", "h1", &[])]);
        let store = ArtifactStore::new(tempfile::tempdir()?.path())?;
        store.mark_fail("A", "h1", "boom")?;
        let baseline = BTreeSet::new();

        let derived = compute_derived_sets(&catalog, &baseline, &store)?;
        assert!(derived.failed_pkgs.contains("A"));
        assert!(!derived.need_pkgs.contains("A"));
        assert_eq!(explain(&catalog, &derived, "A"), Explanation::FailedUpToDate);
        Ok(())
    }

    #[test]
    fn explain_reports_dependency_cause() -> Result<()> {
        let catalog = catalog_of(&[("A", "h1p", &[]), ("B", "h2", &["A"])]);
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(dir.path())?;
        store.write_zip("A", b"zip-a")?;
        store.mark_success("A", "h1", "ok")?;
        store.write_zip("B", b"zip-b")?;
        store.mark_success("B", "h2", "ok")?;

        let baseline = BTreeSet::new();
        let derived = compute_derived_sets(&catalog, &baseline, &store)?;
        assert_eq!(explain(&catalog, &derived, "A"), Explanation::ChangedBecauseChecksum);
        assert_eq!(
            explain(&catalog, &derived, "B"),
            Explanation::ChangedBecauseDependency("A".to_string())
        );
        Ok(())
    }

    #[test]
    fn self_dependency_does_not_force_a_group() -> Result<()> {
        let catalog = catalog_of(&[("A", "h1", &["A"])]);
        let store = ArtifactStore::new(tempfile::tempdir()?.path())?;
        let baseline = BTreeSet::new();

        let derived = compute_derived_sets(&catalog, &baseline, &store)?;
        let plan = build_plan(&catalog, &derived.need_pkgs);
        assert_eq!(plan, vec![PlanElement::Single("A".to_string())]);
        Ok(())
    }

    #[test]
    fn empty_need_pkgs_produces_empty_plan() -> Result<()> {
        let catalog = catalog_of(&[]);
        let need_pkgs = BTreeSet::new();
        assert!(build_plan(&catalog, &need_pkgs).is_empty());
        Ok(())
    }
}
