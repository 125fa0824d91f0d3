//! Launcher for the external process that serves the summary file.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::PresentationConfig;
use crate::sink::SinkTarget;

/// Owns the presentation child process, if one was started.
#[derive(Debug)]
pub struct Presentation {
    cfg: PresentationConfig,
    child: Option<Child>,
}

impl Presentation {
    pub fn new(cfg: PresentationConfig) -> Self {
        Self { cfg, child: None }
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Full argument vector: the configured command followed by
    /// `-f <summary file> -p <port>`.
    pub fn argv(&self, summary_file: &Path) -> Vec<OsString> {
        let mut argv: Vec<OsString> = self.cfg.command.iter().map(OsString::from).collect();
        argv.push("-f".into());
        argv.push(summary_file.as_os_str().to_owned());
        argv.push("-p".into());
        argv.push(self.cfg.port.to_string().into());
        argv
    }

    /// Starts the process unless it is disabled or already running. It can
    /// only read a file, so a stream target is skipped with a warning.
    /// Returns whether a process was started.
    pub fn launch(&mut self, target: &SinkTarget) -> Result<bool> {
        if !self.cfg.enabled || self.child.is_some() {
            return Ok(false);
        }

        let Some(path) = target.path() else {
            warn!(
                output = %target,
                "presentation needs a file output, not launching"
            );
            return Ok(false);
        };

        let argv = self.argv(path);
        let Some((program, args)) = argv.split_first() else {
            bail!("presentation.command is empty");
        };

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning presentation process {program:?}"))?;

        info!(
            pid = child.id().unwrap_or_default(),
            port = self.cfg.port,
            file = %path.display(),
            "presentation process started"
        );
        self.child = Some(child);

        Ok(true)
    }

    /// Kills the process and waits for it to exit.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            warn!(%status, "presentation process had already exited");
            return Ok(());
        }

        child
            .kill()
            .await
            .context("killing presentation process")?;
        info!("presentation process stopped");

        Ok(())
    }
}
