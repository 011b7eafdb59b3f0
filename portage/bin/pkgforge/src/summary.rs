// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A human-readable run summary, printed at the end of every non-dry-run
//! invocation.

use crate::engine::EngineSummary;

pub fn format_summary(summary: &EngineSummary, docs_built: bool) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "pkgforge run summary: {} built, {} failed\n",
        summary.succeeded.len(),
        summary.failed.len()
    ));
    if !summary.succeeded.is_empty() {
        out.push_str(&format!("  built: {}\n", summary.succeeded.join(", ")));
    }
    if !summary.failed.is_empty() {
        out.push_str(&format!("  failed: {}\n", summary.failed.join(", ")));
    }
    out.push_str(&format!(
        "  docs: {}\n",
        if docs_built { "assembled" } else { "skipped" }
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_built_and_failed_packages() {
        let summary = EngineSummary {
            succeeded: vec!["A".to_string()],
            failed: vec!["B".to_string()],
        };
        let text = format_summary(&summary, true);
        assert!(text.contains("1 built, 1 failed"));
        assert!(text.contains("built: A"));
        assert!(text.contains("failed: B"));
        assert!(text.contains("docs: assembled"));
    }
}
