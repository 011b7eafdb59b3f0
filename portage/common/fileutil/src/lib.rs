// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod atomic;
mod remove;
mod tempdir;

pub use atomic::*;
pub use remove::*;
pub use tempdir::*;
