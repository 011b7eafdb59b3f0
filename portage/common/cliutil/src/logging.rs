// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::Layer;

/// Name of the environment variable containing the log directory and file respectively.
/// If both are provided, an error is thrown.
/// If neither is provided, no logging to files is performed.
pub const LOG_DIR_ENV: &str = "PKGFORGE_LOG_DIR";
pub const LOG_FILE_ENV: &str = "PKGFORGE_LOG_FILE";

/// An environment variable choosing whether to log to the console.
/// If "0", don't log to the console.
/// Otherwise, do log to the console.
pub const CONSOLE_LOG_ENV: &str = "PKGFORGE_LOG_CONSOLE";

/// A guard object to perform cleanups with RAII.
pub struct LogGuard {
    _span_guard: tracing::span::EnteredSpan,
}

/// The configuration for the logger.
/// Technically this also supports tracing, but most users are more familiar with logging than
/// tracing, and thus I suspect most users will use log::info rather than trace::info.
pub struct LoggingConfig {
    /// The path to dump the logs to, and a filter for which logs should be dumped there.
    /// If None, logs will not be written to a file.
    pub log_file: Option<(PathBuf, EnvFilter)>,
    /// A filter for which logs should be written to the console.
    /// If None, logs will not be written to the console.
    pub console_logger: Option<EnvFilter>,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();

        let get_file = |dir_env, file_env, ext| {
            Ok(
                match (std::env::var_os(file_env), std::env::var_os(dir_env)) {
                    (Some(_), Some(_)) => bail!("You can't have both {file_env} and {dir_env} set"),
                    (Some(file), None) => {
                        // Subprocesses shouldn't try and share a log file - that'd get confusing.
                        // If you start subprocesses that do logging, PKGFORGE_LOG_DIR is
                        // probably more appropriate.
                        std::env::remove_var(file_env);
                        Some(PathBuf::from(file))
                    }
                    (None, Some(dir)) => {
                        let name =
                            format!("{}.{timestamp}.{ext}", crate::get_current_process_name(),);
                        Some(Path::new(&dir).join(name))
                    }
                    (None, None) => None,
                },
            )
        };

        let log_file = get_file(LOG_DIR_ENV, LOG_FILE_ENV, "log")?;

        let console_logger = match std::env::var(CONSOLE_LOG_ENV).ok().as_deref() {
            Some("0") => None,
            _ => Some(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env()?,
            ),
        };

        let log_file = match log_file {
            Some(log_file) => Some((
                log_file,
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env()?,
            )),
            None => None,
        };

        Ok(Self {
            log_file,
            console_logger,
        })
    }

    /// Sets up the standard tracing subscriber in accordance with the config, and starts a span
    /// named "main".
    pub fn setup(self) -> Result<LogGuard> {
        // It's impossible to do tracing and logging independently because both require a
        // subscription to a global logger, of which there can only be one.
        // Thus, we use the tracing crate to do logging as well as tracing.
        let mut layers = Vec::new();

        if let Some(filter) = self.console_logger {
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        if let Some((log_file, filter)) = self.log_file {
            let f = std::fs::File::create(&log_file)
                .with_context(|| format!("Failed to open log file {log_file:?}"))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(f)
                    .with_filter(filter)
                    .boxed(),
            );
        }

        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .context(
                "Failed to start tracing. You probably already have either a trace or log
                subscriber running.",
            )?;

        let args = std::env::args()
            .map(|s| shell_escape::escape(s.into()))
            .join(" ");
        let env = std::env::vars()
            .map(|(key, value)| format!("{}={}", key, value))
            .join("\n");
        // Make this trace level to avoid getting printed every invocation, since env can be *very*
        // long.
        let span_guard = tracing::trace_span!("main", args = args, env = env).entered();

        Ok(LogGuard {
            _span_guard: span_guard,
        })
    }
}
