//! Control of the HAProxy process
//!
//! HAProxy runs in master-worker mode: a reload is `SIGUSR2` to the master,
//! which re-reads the configuration without dropping connections. A restart
//! stops the master and starts a fresh one; it is only used when listening
//! sockets or process-level settings change.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Paths;
use crate::error::{Error, Result};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_POLL_ATTEMPTS: u32 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Reload,
    Restart,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAction::Start => write!(f, "start"),
            ServiceAction::Reload => write!(f, "reload"),
            ServiceAction::Restart => write!(f, "restart"),
        }
    }
}

#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn control(&self, action: ServiceAction) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct HaproxyProcess {
    program: PathBuf,
    cfg_file: PathBuf,
    pid_file: PathBuf,
    test: bool,
}

impl HaproxyProcess {
    pub fn new(paths: &Paths, test: bool) -> Self {
        Self {
            program: paths.program.clone(),
            cfg_file: paths.cfg_file.clone(),
            pid_file: paths.pid_file.clone(),
            test,
        }
    }

    /// First line of `haproxy -v`
    pub async fn version(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .arg("-v")
            .output()
            .await
            .map_err(|e| Error::ServiceControlError(format!("haproxy -v: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }

    async fn start(&self) -> Result<()> {
        let status = Command::new(&self.program)
            .arg("-W")
            .arg("-D")
            .arg("-f")
            .arg(&self.cfg_file)
            .arg("-p")
            .arg(&self.pid_file)
            .status()
            .await
            .map_err(|e| Error::ServiceControlError(format!("failed to run haproxy: {}", e)))?;
        if !status.success() {
            return Err(Error::ServiceControlError(format!(
                "haproxy exited with {}",
                status
            )));
        }
        Ok(())
    }

    async fn master_pid(&self) -> Result<i32> {
        let content = tokio::fs::read_to_string(&self.pid_file).await.map_err(|e| {
            Error::ServiceControlError(format!(
                "cannot read pid file {}: {}",
                self.pid_file.display(),
                e
            ))
        })?;
        content
            .lines()
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| {
                Error::ServiceControlError(format!(
                    "invalid pid file {}",
                    self.pid_file.display()
                ))
            })
    }

    async fn signal(&self, pid: i32, signal: &str) -> Result<bool> {
        let status = Command::new("kill")
            .arg(format!("-{}", signal))
            .arg(pid.to_string())
            .status()
            .await
            .map_err(|e| Error::ServiceControlError(format!("kill -{}: {}", signal, e)))?;
        Ok(status.success())
    }

    async fn stop(&self) -> Result<()> {
        let pid = self.master_pid().await?;
        if !self.signal(pid, "TERM").await? {
            return Err(Error::ServiceControlError(format!(
                "cannot stop haproxy master {}",
                pid
            )));
        }
        for _ in 0..STOP_POLL_ATTEMPTS {
            if !self.signal(pid, "0").await? {
                return Ok(());
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        Err(Error::ServiceControlError(format!(
            "haproxy master {} did not stop",
            pid
        )))
    }
}

#[async_trait]
impl ServiceControl for HaproxyProcess {
    async fn control(&self, action: ServiceAction) -> Result<()> {
        if self.test {
            info!("Test mode: skipping HAProxy {}", action);
            return Ok(());
        }
        debug!("HAProxy {}", action);
        match action {
            ServiceAction::Start => self.start().await,
            ServiceAction::Reload => {
                let pid = self.master_pid().await?;
                if self.signal(pid, "USR2").await? {
                    Ok(())
                } else {
                    Err(Error::ServiceControlError(format!(
                        "cannot reload haproxy master {}",
                        pid
                    )))
                }
            }
            ServiceAction::Restart => {
                self.stop().await?;
                self.start().await
            }
        }
    }
}
