/**
 * supervisor.rs
 *
 * Launches, tracks and terminates the privileged helper daemon.
 *
 * This is the only component allowed to spawn or kill the helper's OS
 * process. `start` returns once the process is spawned, not once its RPC
 * listener is ready; callers connect with retry/backoff.
 */

use log::{info, warn};
use std::env;
use std::path::PathBuf;
use tokio::process::{Child, Command};

#[cfg(windows)]
const HELPER_EXECUTABLE: &str = "peerbridge-net.exe";
#[cfg(not(windows))]
const HELPER_EXECUTABLE: &str = "peerbridge-net";

/// Helper process could not be created
#[derive(Debug)]
pub enum SpawnError {
    MissingExecutable(PathBuf),
    /// The OS refused to create the process (including a denied elevation prompt)
    Os(std::io::Error),
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::MissingExecutable(path) => {
                write!(f, "Helper executable not found: {}", path.display())
            }
            SpawnError::Os(e) => write!(f, "Failed to spawn helper: {}", e),
        }
    }
}

impl std::error::Error for SpawnError {}

/// How the helper is launched.
///
/// The helper needs raw socket access, which requires OS privilege the lobby
/// client itself does not have. Production launches go through the platform
/// elevation prompt; development runs the binary directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Direct,
    Elevated,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executable: PathBuf,
    pub launch_mode: LaunchMode,
}

impl SupervisorConfig {
    /// Resolve the helper path for the current layout.
    ///
    /// Development: next to the running executable. Packaged: under the
    /// application resources directory (PEERBRIDGE_RESOURCES). An explicit
    /// PEERBRIDGE_HELPER_PATH overrides both.
    pub fn from_env() -> Self {
        let executable = if let Ok(path) = env::var("PEERBRIDGE_HELPER_PATH") {
            PathBuf::from(path)
        } else if let Ok(resources) = env::var("PEERBRIDGE_RESOURCES") {
            PathBuf::from(resources).join("bin").join(HELPER_EXECUTABLE)
        } else {
            let exe_dir = env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(|d| d.to_path_buf()))
                .unwrap_or_else(|| PathBuf::from("."));
            exe_dir.join(HELPER_EXECUTABLE)
        };

        let launch_mode = if env::var("PEERBRIDGE_ELEVATE").map(|v| v == "1").unwrap_or(false) {
            LaunchMode::Elevated
        } else {
            LaunchMode::Direct
        };

        Self {
            executable,
            launch_mode,
        }
    }
}

/// Exclusive owner of the helper process handle
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    child: Option<Child>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    /// Spawn the helper. Returns once the OS confirms the spawn, which on an
    /// elevated launch is before the user has even answered the prompt.
    pub async fn start(&mut self) -> Result<(), SpawnError> {
        if self.is_running() {
            info!("helper already running, skipping spawn");
            return Ok(());
        }

        if !self.config.executable.exists() {
            return Err(SpawnError::MissingExecutable(self.config.executable.clone()));
        }

        let mut command = match self.config.launch_mode {
            LaunchMode::Direct => Command::new(&self.config.executable),
            LaunchMode::Elevated => {
                if cfg!(windows) {
                    let mut cmd = Command::new("powershell.exe");
                    cmd.args([
                        "-NoProfile",
                        "-Command",
                        &format!(
                            "Start-Process -FilePath '{}' -Verb RunAs -WindowStyle Hidden",
                            self.config.executable.display()
                        ),
                    ]);
                    cmd
                } else {
                    let mut cmd = Command::new("pkexec");
                    cmd.arg(&self.config.executable);
                    cmd
                }
            }
        };

        // Termination stays our responsibility even if the handle is dropped
        command.kill_on_drop(true);

        let child = command.spawn().map_err(SpawnError::Os)?;
        info!(
            "helper spawned ({:?} mode) from {}",
            self.config.launch_mode,
            self.config.executable.display()
        );
        self.child = Some(child);
        Ok(())
    }

    /// Whether the tracked process is still alive
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Whether a process handle is tracked at all (alive or not)
    pub fn is_tracking(&self) -> bool {
        self.child.is_some()
    }

    /// Kill the tracked process. Callers are expected to have requested a
    /// graceful stop over RPC first and waited out the grace period; this is
    /// the backstop. Tolerates being called with nothing running.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("helper already exited with {}", status);
                }
                _ => {
                    if let Err(e) = child.start_kill() {
                        warn!("failed to kill helper: {}", e);
                    }
                    let _ = child.wait().await;
                    info!("helper process terminated");
                }
            }
        }
    }
}
