// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::Result;

use crate::VmAdapter;

/// Guarantees the VM is stopped when a group attempt ends, on every exit
/// path including an early return or a propagated error.
pub struct VmSession<'a> {
    adapter: &'a VmAdapter,
    save_state: bool,
}

impl<'a> VmSession<'a> {
    /// Restores `snapshot`, starts the VM, and returns a guard that stops it
    /// on drop. `save_state` controls whether the stop preserves VM state;
    /// the build engine always passes `false` since no state is carried
    /// between build attempts.
    pub fn acquire(adapter: &'a VmAdapter, snapshot: &str, save_state: bool) -> Result<Self> {
        adapter.snapshot_restore(snapshot)?;
        adapter.vm_start()?;
        Ok(Self {
            adapter,
            save_state,
        })
    }

    pub fn adapter(&self) -> &VmAdapter {
        self.adapter
    }
}

impl Drop for VmSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.adapter.vm_stop(self.save_state) {
            tracing::warn!("failed to stop VM during session teardown: {err:#}");
        }
    }
}
