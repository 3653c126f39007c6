use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

use crate::error::{ResidueError, Result};

const POLL: Duration = Duration::from_millis(50);

/// Stops processes that keep a resource busy.
pub trait ProcessStopper: Send + Sync {
    /// Stop every process holding `path` open and wait (bounded by `timeout`)
    /// for them to exit. Returns how many were signalled.
    fn stop_holders(&self, path: &Path, force: bool, timeout: Duration) -> Result<usize>;
}

/// Finds holders by executable path or working directory below the target.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessStopper;

impl SystemProcessStopper {
    fn holders(system: &System, path: &Path) -> Vec<Pid> {
        let own = std::process::id();
        system
            .processes()
            .iter()
            .filter(|(pid, _)| pid.as_u32() != own)
            .filter(|(_, process)| {
                process.exe().is_some_and(|exe| exe.starts_with(path))
                    || process.cwd().is_some_and(|cwd| cwd.starts_with(path))
            })
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl ProcessStopper for SystemProcessStopper {
    fn stop_holders(&self, path: &Path, force: bool, timeout: Duration) -> Result<usize> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let pids = Self::holders(&system, path);
        if pids.is_empty() {
            return Ok(0);
        }

        for pid in &pids {
            if let Some(process) = system.process(*pid) {
                let sent = if force {
                    process.kill()
                } else {
                    process
                        .kill_with(Signal::Term)
                        .unwrap_or_else(|| process.kill())
                };
                tracing::info!(
                    pid = pid.as_u32(),
                    name = %process.name().to_string_lossy(),
                    force,
                    sent,
                    "stopping process holding {}",
                    path.display()
                );
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            system.refresh_processes(ProcessesToUpdate::Some(&pids), true);
            if pids.iter().all(|pid| system.process(*pid).is_none()) {
                return Ok(pids.len());
            }
            if Instant::now() >= deadline {
                return Err(ResidueError::Timeout {
                    what: format!("stopping holders of {}", path.display()),
                    limit: timeout,
                });
            }
            thread::sleep(POLL);
        }
    }
}
