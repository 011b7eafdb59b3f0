// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::HashMap;

/// A disjoint-set over package names, used to collapse cycles discovered
/// while ordering the build plan into single strongly-connected groups.
#[derive(Default)]
pub(crate) struct UnionFind {
    parent: HashMap<String, String>,
}

impl UnionFind {
    pub(crate) fn find(&mut self, x: &str) -> String {
        let parent = match self.parent.get(x) {
            Some(p) if p != x => p.clone(),
            _ => return x.to_string(),
        };
        let root = self.find(&parent);
        self.parent.insert(x.to_string(), root.clone());
        root
    }

    pub(crate) fn union(&mut self, a: &str, b: &str) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent.insert(ra, rb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrelated_elements_have_distinct_roots() {
        let mut uf = UnionFind::default();
        assert_ne!(uf.find("a"), uf.find("b"));
    }

    #[test]
    fn union_merges_roots() {
        let mut uf = UnionFind::default();
        uf.union("a", "b");
        assert_eq!(uf.find("a"), uf.find("b"));
    }

    #[test]
    fn union_is_transitive() {
        let mut uf = UnionFind::default();
        uf.union("a", "b");
        uf.union("b", "c");
        assert_eq!(uf.find("a"), uf.find("c"));
    }
}
