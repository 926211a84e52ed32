//! Restart coordinator
//!
//! Decides whether a store change needs the decoding service bounced, and
//! performs the restart: terminate the running decoder, wait the grace
//! interval, launch it again, check it came back.
//!
//! A restart failure is reported in the outcome. The write that triggered
//! it has already happened and stays.

use crate::collaborators::{ProbingProcessController, ProcessSpec, ServiceInfo};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

/// CA system id of BISS
pub const BISS_CA_SYSTEM_ID: u16 = 0x2600;

/// When to restart after a store change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// After every change
    Always,
    /// Bulk changes always; single-key changes only when the tuned service
    /// uses one of the configured key systems
    #[default]
    Conditional,
    /// Never restart
    Never,
}

/// Restart settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    pub mode: RestartMode,
    /// Pause between terminate and launch
    pub grace_ms: u64,
    /// CA systems served by this store
    pub key_system_ids: Vec<u16>,
    /// Known decoding services, probed in order
    pub processes: Vec<ProcessSpec>,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            mode: RestartMode::Conditional,
            grace_ms: 2_000,
            key_system_ids: vec![BISS_CA_SYSTEM_ID],
            processes: vec![
                ProcessSpec::new("oscam", "/usr/bin/oscam -b"),
                ProcessSpec::new("ncam", "/usr/bin/ncam -b"),
            ],
        }
    }
}

/// What kind of change happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTrigger {
    /// One record added, updated or removed
    Single,
    /// Feed update or bulk import; any channel may be affected
    Bulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    Restarting,
}

/// Result of [`RestartCoordinator::after_mutation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Policy decided no restart was needed
    NotRequired,
    /// No known decoder is running
    NoProcess,
    Restarted { process: String },
    Failed { process: String, reason: String },
}

impl RestartOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, RestartOutcome::Failed { .. })
    }

    /// `Err(RestartFailed)` for a failed restart, the outcome otherwise
    pub fn into_result(self) -> crate::error::Result<Self> {
        match self {
            RestartOutcome::Failed { process, reason } => {
                Err(Error::RestartFailed(format!("{}: {}", process, reason)))
            }
            other => Ok(other),
        }
    }
}

/// Restart policy state machine
#[derive(Debug)]
pub struct RestartCoordinator {
    mode: RestartMode,
    grace: Duration,
    key_system_ids: BTreeSet<u16>,
    processes: ProbingProcessController,
    state: RestartState,
}

impl RestartCoordinator {
    pub fn new(config: &RestartConfig, processes: ProbingProcessController) -> Self {
        Self {
            mode: config.mode,
            grace: Duration::from_millis(config.grace_ms),
            key_system_ids: config.key_system_ids.iter().copied().collect(),
            processes,
            state: RestartState::Idle,
        }
    }

    /// Coordinator controlling the configured command-line services
    pub fn from_config(config: &RestartConfig) -> Self {
        Self::new(config, ProbingProcessController::from_specs(&config.processes))
    }

    pub fn state(&self) -> RestartState {
        self.state
    }

    pub fn mode(&self) -> RestartMode {
        self.mode
    }

    /// Whether a change of this kind needs a restart right now
    pub fn should_restart(&self, trigger: RestartTrigger, service: &dyn ServiceInfo) -> bool {
        match (self.mode, trigger) {
            (RestartMode::Never, _) => false,
            (RestartMode::Always, _) => true,
            (RestartMode::Conditional, RestartTrigger::Bulk) => true,
            (RestartMode::Conditional, RestartTrigger::Single) => !service
                .current_ca_systems()
                .is_disjoint(&self.key_system_ids),
        }
    }

    /// Apply the restart policy after a successful store write
    ///
    /// Blocks for the grace interval; run it off the async executor.
    pub fn after_mutation(
        &mut self,
        trigger: RestartTrigger,
        service: &dyn ServiceInfo,
    ) -> RestartOutcome {
        if !self.should_restart(trigger, service) {
            return RestartOutcome::NotRequired;
        }

        self.state = RestartState::Restarting;
        let outcome = self.restart();
        self.state = RestartState::Idle;

        match &outcome {
            RestartOutcome::Restarted { process } => info!(%process, "Decoder restarted"),
            RestartOutcome::Failed { process, reason } => {
                warn!(%process, %reason, "Decoder restart failed")
            }
            _ => {}
        }
        outcome
    }

    fn restart(&self) -> RestartOutcome {
        let Some(controller) = self.processes.probe() else {
            return RestartOutcome::NoProcess;
        };
        let process = controller.name().to_string();

        if let Err(e) = controller.terminate() {
            return RestartOutcome::Failed {
                process,
                reason: e.to_string(),
            };
        }
        if !self.grace.is_zero() {
            std::thread::sleep(self.grace);
        }
        if let Err(e) = controller.launch() {
            return RestartOutcome::Failed {
                process,
                reason: e.to_string(),
            };
        }
        if !controller.is_running() {
            return RestartOutcome::Failed {
                process,
                reason: "process not running after launch".to_string(),
            };
        }

        RestartOutcome::Restarted { process }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ProcessController, ProcessError};
    use crate::models::ChannelIdentity;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Tuner(BTreeSet<u16>);

    impl ServiceInfo for Tuner {
        fn current_channel(&self) -> Option<ChannelIdentity> {
            None
        }
        fn current_ca_systems(&self) -> BTreeSet<u16> {
            self.0.clone()
        }
    }

    struct Decoder {
        running: AtomicBool,
        comes_back: bool,
        launches: AtomicUsize,
    }

    impl ProcessController for Decoder {
        fn name(&self) -> &str {
            "oscam"
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn terminate(&self) -> Result<(), ProcessError> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn launch(&self) -> Result<(), ProcessError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.running.store(self.comes_back, Ordering::SeqCst);
            Ok(())
        }
    }

    fn coordinator(mode: RestartMode, comes_back: bool) -> (RestartCoordinator, Arc<Decoder>) {
        let decoder = Arc::new(Decoder {
            running: AtomicBool::new(true),
            comes_back,
            launches: AtomicUsize::new(0),
        });
        let config = RestartConfig {
            mode,
            grace_ms: 0,
            ..Default::default()
        };
        let processes =
            ProbingProcessController::new(vec![decoder.clone() as Arc<dyn ProcessController>]);
        (RestartCoordinator::new(&config, processes), decoder)
    }

    fn biss_tuner() -> Tuner {
        Tuner([0x0500, BISS_CA_SYSTEM_ID].into_iter().collect())
    }

    fn other_tuner() -> Tuner {
        Tuner([0x0500].into_iter().collect())
    }

    #[test]
    fn test_conditional_skips_unrelated_service() {
        let (mut coordinator, decoder) = coordinator(RestartMode::Conditional, true);
        let outcome = coordinator.after_mutation(RestartTrigger::Single, &other_tuner());
        assert_eq!(outcome, RestartOutcome::NotRequired);
        assert_eq!(decoder.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_conditional_restarts_for_key_system() {
        let (mut coordinator, decoder) = coordinator(RestartMode::Conditional, true);
        let outcome = coordinator.after_mutation(RestartTrigger::Single, &biss_tuner());
        assert_eq!(
            outcome,
            RestartOutcome::Restarted {
                process: "oscam".to_string()
            }
        );
        assert_eq!(decoder.launches.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), RestartState::Idle);
    }

    #[test]
    fn test_bulk_restarts_unconditionally() {
        let (mut coordinator, _) = coordinator(RestartMode::Conditional, true);
        let outcome = coordinator.after_mutation(RestartTrigger::Bulk, &other_tuner());
        assert!(matches!(outcome, RestartOutcome::Restarted { .. }));
    }

    #[test]
    fn test_never_mode() {
        let (mut coordinator, _) = coordinator(RestartMode::Never, true);
        let outcome = coordinator.after_mutation(RestartTrigger::Bulk, &biss_tuner());
        assert_eq!(outcome, RestartOutcome::NotRequired);
    }

    #[test]
    fn test_failed_relaunch_is_reported() {
        let (mut coordinator, _) = coordinator(RestartMode::Always, false);
        let outcome = coordinator.after_mutation(RestartTrigger::Single, &other_tuner());
        assert!(outcome.is_failure());
        assert!(matches!(outcome.into_result(), Err(Error::RestartFailed(_))));
    }

    #[test]
    fn test_no_running_decoder() {
        let (mut coordinator, decoder) = coordinator(RestartMode::Always, true);
        decoder.running.store(false, Ordering::SeqCst);
        let outcome = coordinator.after_mutation(RestartTrigger::Single, &other_tuner());
        assert_eq!(outcome, RestartOutcome::NoProcess);
    }
}
