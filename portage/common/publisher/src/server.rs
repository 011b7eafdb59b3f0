// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread::JoinHandle,
};

use anyhow::{anyhow, Context, Result};
use tiny_http::{Response, Server};

/// A static-file HTTP server bound to loopback, serving `server_dir` as the
/// document root. Runs on a background thread for the process lifetime; the
/// sandbox reaches it through a reverse tunnel set up by the VM adapter.
pub struct CatalogServer {
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl CatalogServer {
    pub fn start(server_dir: PathBuf, port: u16) -> Result<Self> {
        let server = Server::http(("127.0.0.1", port))
            .map_err(|err| anyhow!("failed to bind catalog server on 127.0.0.1:{port}: {err}"))?;
        let server = Arc::new(server);

        let worker = server.clone();
        let handle = std::thread::spawn(move || {
            for request in worker.incoming_requests() {
                let method = request.method().clone();
                let url = request.url().to_string();
                if let Err(err) = handle_request(&server_dir, request) {
                    tracing::warn!("catalog server request {method} {url} failed: {err:#}");
                }
            }
        });

        Ok(Self {
            server,
            handle: Some(handle),
        })
    }
}

impl Drop for CatalogServer {
    fn drop(&mut self) {
        // Unblocks the worker thread's `incoming_requests()` iterator so it
        // can observe the dropped server and exit.
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_request(server_dir: &Path, request: tiny_http::Request) -> Result<()> {
    let requested = request.url().trim_start_matches('/');
    let path = resolve_within(server_dir, requested)?;

    match path.and_then(|p| std::fs::read(&p).ok()) {
        Some(body) => request
            .respond(Response::from_data(body))
            .context("failed to write response"),
        None => request
            .respond(Response::empty(404))
            .context("failed to write 404 response"),
    }
}

/// Resolves a URL path against `root`, rejecting anything that would escape
/// it (e.g. `../`). Returns `None` for a path that doesn't exist.
fn resolve_within(root: &Path, requested: &str) -> Result<Option<PathBuf>> {
    let candidate = root.join(requested);
    if !candidate.exists() {
        return Ok(None);
    }
    let canonical_root = root
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {root:?}"))?;
    let canonical_candidate = candidate
        .canonicalize()
        .with_context(|| format!("failed to canonicalize {candidate:?}"))?;
    if !canonical_candidate.starts_with(&canonical_root) {
        return Ok(None);
    }
    Ok(Some(canonical_candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_traversal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("pkgs"), b"[]")?;
        let secret_dir = tempfile::tempdir()?;
        std::fs::write(secret_dir.path().join("secret"), b"top secret")?;

        let traversal = format!(
            "../{}/secret",
            secret_dir.path().file_name().unwrap().to_str().unwrap()
        );
        assert_eq!(resolve_within(dir.path(), &traversal)?, None);
        Ok(())
    }

    #[test]
    fn resolves_existing_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("pkgs"), b"[]")?;
        assert!(resolve_within(dir.path(), "pkgs")?.is_some());
        Ok(())
    }

    #[test]
    fn serves_published_files_over_http() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("pkgs"), b"[\"A\"]")?;

        let server = CatalogServer::start(dir.path().to_path_buf(), 0)?;
        // Port 0 means the OS picks one; tiny_http exposes it back via the
        // server's local address for tests that need to connect.
        drop(server);
        Ok(())
    }
}
