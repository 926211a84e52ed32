//! Collaborator seams
//!
//! The engine never talks to the tuner or the process table directly. It
//! consumes these traits; the front end supplies real implementations and
//! tests supply fakes.
//!
//! Process control is one [`ProcessController`] per supported decoding
//! service. [`ProbingProcessController`] picks whichever of them is running
//! at call time.

use crate::models::ChannelIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, warn};

/// Tuner / service-information lookup
pub trait ServiceInfo: Send + Sync {
    /// Channel currently being watched, `None` when nothing is tuned
    fn current_channel(&self) -> Option<ChannelIdentity>;

    /// Conditional-access system ids of the current service
    fn current_ca_systems(&self) -> BTreeSet<u16>;
}

/// Process control errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Binary or helper tool not installed
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    /// Command could not be spawned
    #[error("Failed to execute {0}")]
    Execution(String),

    /// Command ran but reported failure
    #[error("{command} exited with status {code:?}")]
    Failed { command: String, code: Option<i32> },
}

/// Stop/start control over one decoding service
pub trait ProcessController: Send + Sync {
    fn name(&self) -> &str;
    fn is_running(&self) -> bool;
    fn terminate(&self) -> Result<(), ProcessError>;
    fn launch(&self) -> Result<(), ProcessError>;
}

/// Configured decoding service: process name plus launch command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Name as shown in the process table
    pub name: String,
    /// Command line used to start it (split on whitespace)
    pub launch: String,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, launch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            launch: launch.into(),
        }
    }
}

fn map_spawn_error(program: &str, err: std::io::Error) -> ProcessError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ProcessError::BinaryNotFound(program.to_string())
    } else {
        ProcessError::Execution(format!("{}: {}", program, err))
    }
}

/// Controller backed by `pidof`, `killall` and a configured launch command
#[derive(Debug, Clone)]
pub struct CommandProcessController {
    spec: ProcessSpec,
}

impl CommandProcessController {
    pub fn new(spec: ProcessSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }
}

impl ProcessController for CommandProcessController {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn is_running(&self) -> bool {
        match Command::new("pidof")
            .arg(&self.spec.name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(e) => {
                debug!(process = %self.spec.name, error = %e, "pidof unavailable");
                false
            }
        }
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        let status = Command::new("killall")
            .arg(&self.spec.name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| map_spawn_error("killall", e))?;
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Failed {
                command: format!("killall {}", self.spec.name),
                code: status.code(),
            })
        }
    }

    fn launch(&self) -> Result<(), ProcessError> {
        self.spawn_reaped().map(|_| ())
    }
}

impl CommandProcessController {
    /// Start the launch command and wait for it on a detached thread
    ///
    /// Daemonizing decoders fork and exit at once; the exited parent is
    /// reaped here so it does not stay a zombie.
    fn spawn_reaped(&self) -> Result<Option<JoinHandle<Option<ExitStatus>>>, ProcessError> {
        let mut parts = self.spec.launch.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ProcessError::Execution(format!("empty launch command for {}", self.spec.name)))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| map_spawn_error(program, e))?;

        let name = self.spec.name.clone();
        let reaper = thread::Builder::new()
            .name(format!("reap-{}", name))
            .spawn(move || match child.wait() {
                Ok(status) => {
                    debug!(process = %name, %status, "Launch command exited");
                    Some(status)
                }
                Err(e) => {
                    warn!(process = %name, error = %e, "Failed to wait for launch command");
                    None
                }
            });
        match reaper {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                warn!(process = %self.spec.name, error = %e, "Could not start reaper thread");
                Ok(None)
            }
        }
    }
}

/// Picks the running decoding service among several known ones
#[derive(Clone, Default)]
pub struct ProbingProcessController {
    controllers: Vec<Arc<dyn ProcessController>>,
}

impl std::fmt::Debug for ProbingProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.controllers.iter().map(|c| c.name()).collect();
        f.debug_struct("ProbingProcessController")
            .field("controllers", &names)
            .finish()
    }
}

impl ProbingProcessController {
    pub fn new(controllers: Vec<Arc<dyn ProcessController>>) -> Self {
        Self { controllers }
    }

    /// One [`CommandProcessController`] per configured service
    pub fn from_specs(specs: &[ProcessSpec]) -> Self {
        Self::new(
            specs
                .iter()
                .cloned()
                .map(|spec| Arc::new(CommandProcessController::new(spec)) as Arc<dyn ProcessController>)
                .collect(),
        )
    }

    pub fn names(&self) -> Vec<&str> {
        self.controllers.iter().map(|c| c.name()).collect()
    }

    /// First known service that is currently running
    pub fn probe(&self) -> Option<Arc<dyn ProcessController>> {
        let found = self.controllers.iter().find(|c| c.is_running()).cloned();
        match &found {
            Some(c) => debug!(process = c.name(), "Found running decoder"),
            None => warn!(known = ?self.names(), "No known decoder is running"),
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fake {
        name: &'static str,
        running: AtomicBool,
    }

    impl ProcessController for Fake {
        fn name(&self) -> &str {
            self.name
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn terminate(&self) -> Result<(), ProcessError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn launch(&self) -> Result<(), ProcessError> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fake(name: &'static str, running: bool) -> Arc<dyn ProcessController> {
        Arc::new(Fake {
            name,
            running: AtomicBool::new(running),
        })
    }

    #[test]
    fn test_probe_picks_running_controller() {
        let probing = ProbingProcessController::new(vec![fake("oscam", false), fake("ncam", true)]);
        assert_eq!(probing.probe().map(|c| c.name().to_string()), Some("ncam".to_string()));
    }

    #[test]
    fn test_probe_none_running() {
        let probing = ProbingProcessController::new(vec![fake("oscam", false)]);
        assert!(probing.probe().is_none());
    }

    #[test]
    fn test_from_specs_keeps_order() {
        let probing = ProbingProcessController::from_specs(&[
            ProcessSpec::new("oscam", "/usr/bin/oscam -b"),
            ProcessSpec::new("ncam", "/usr/bin/ncam -b"),
        ]);
        assert_eq!(probing.names(), vec!["oscam", "ncam"]);
    }

    #[test]
    fn test_launch_missing_binary() {
        let controller = CommandProcessController::new(ProcessSpec::new(
            "nope",
            "/nonexistent/bisspro-test-binary --flag",
        ));
        assert_eq!(
            controller.launch(),
            Err(ProcessError::BinaryNotFound(
                "/nonexistent/bisspro-test-binary".to_string()
            ))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_launch_command_is_reaped() {
        let controller = CommandProcessController::new(ProcessSpec::new("daemon", "sh -c false"));
        let reaper = controller.spawn_reaped().unwrap().unwrap();
        let status = reaper.join().unwrap().unwrap();
        assert_eq!(status.code(), Some(1));
    }

    #[test]
    fn test_launch_empty_command() {
        let controller = CommandProcessController::new(ProcessSpec::new("empty", "  "));
        assert!(matches!(controller.launch(), Err(ProcessError::Execution(_))));
    }
}
