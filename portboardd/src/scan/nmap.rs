use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio::process::Command;
use shared::types::Observation;
use crate::config::ScanConfig;
use super::{parser, ScanError, ScanMode, Scanner};

/// Runs the nmap binary and parses its normal text output.
pub struct NmapScanner {
    program: PathBuf,
    fast_args: Vec<String>,
    full_args: Vec<String>,
    timeout: Duration,
}

impl NmapScanner {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            program: config.nmap_path.clone(),
            fast_args: config.fast_args.clone(),
            full_args: config.full_args.clone(),
            timeout: config.timeout(),
        }
    }

    fn args(&self, mode: ScanMode) -> &[String] {
        match mode {
            ScanMode::Fast => &self.fast_args,
            ScanMode::Full => &self.full_args,
        }
    }

    async fn run(&self, target: &str, mode: ScanMode) -> Result<String, ScanError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args(mode))
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // the child dies with the future on timeout or cancellation
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ScanError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ScanError::Timeout(self.timeout))?
            .map_err(|source| ScanError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(ScanError::Exit {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(scan_target = target, %mode, "Scanner stderr: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Scanner for NmapScanner {
    async fn scan(&self, target: &str, mode: ScanMode) -> Result<Vec<Observation>, ScanError> {
        tracing::info!("Starting {} scan of {}", mode, target);
        let started = Instant::now();

        let raw = self.run(target, mode).await?;
        let hosts = parser::parse_report(&raw);

        tracing::info!(
            "Finished {} scan of {}: {} hosts in {:?}",
            mode,
            target,
            hosts.len(),
            started.elapsed()
        );
        Ok(hosts)
    }
}
