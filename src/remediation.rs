//! Three-tier process remediation.
//!
//! Interventions escalate in force:
//!
//! 1. **Renice** to the least-favored scheduling priority.
//! 2. **Graceful stop**: `SIGTERM`, then wait for the process to exit.
//! 3. **Force kill**: `SIGKILL`.
//!
//! Each tier returns a [`TierResult`]. Process races and privilege problems
//! (`ESRCH`, `EPERM`) are encoded as [`TierFailure`]s in that result and
//! never cross the component boundary as errors.
//!
//! All process access goes through [`ProcessControl`], so the escalation
//! policy can be exercised without touching real processes.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RemediationConfig;
use crate::models::ExecutionMode;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Renice,
    GracefulStop,
    ForceKill,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Renice => write!(f, "renice"),
            Tier::GracefulStop => write!(f, "graceful_stop"),
            Tier::ForceKill => write!(f, "force_kill"),
        }
    }
}

/// Low-level failure from a [`ProcessControl`] call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("no such process")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("{0}")]
    Other(String),
}

/// Why a tier did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TierFailure {
    #[error("process not found")]
    ProcessNotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("already at niceness {current}")]
    AlreadyDeprioritized { current: i32 },
    #[error("still running after {waited_ms}ms")]
    StillRunning { waited_ms: u64 },
    #[error("{0}")]
    Other(String),
}

impl From<ProcessError> for TierFailure {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::NotFound => TierFailure::ProcessNotFound,
            ProcessError::PermissionDenied => TierFailure::PermissionDenied,
            ProcessError::Other(msg) => TierFailure::Other(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Terminate => write!(f, "SIGTERM"),
            StopSignal::Kill => write!(f, "SIGKILL"),
        }
    }
}

/// Access to running processes.
pub trait ProcessControl: Send + Sync {
    fn name(&self, pid: u32) -> Result<String, ProcessError>;
    fn niceness(&self, pid: u32) -> Result<i32, ProcessError>;
    fn set_niceness(&self, pid: u32, value: i32) -> Result<(), ProcessError>;
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), ProcessError>;
    /// False once the process has exited, including while it is a zombie.
    fn is_running(&self, pid: u32) -> bool;
}

/// [`ProcessControl`] over the host's real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessControl;

impl UnixProcessControl {
    fn to_pid(pid: u32) -> Result<nix::unistd::Pid, ProcessError> {
        // 0 and negative values address process groups.
        match i32::try_from(pid) {
            Ok(raw) if raw > 0 => Ok(nix::unistd::Pid::from_raw(raw)),
            _ => Err(ProcessError::NotFound),
        }
    }

    /// Process state letter from `/proc/<pid>/stat`, if procfs is mounted.
    fn proc_state(pid: u32) -> Option<Option<char>> {
        if !std::path::Path::new("/proc/self/stat").exists() {
            return None;
        }
        let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(s) => s,
            Err(_) => return Some(None),
        };
        // The command name is parenthesized and may itself contain ')'.
        let state = stat
            .rfind(')')
            .and_then(|i| stat[i + 1..].trim_start().chars().next());
        Some(state)
    }
}

fn map_errno(errno: nix::errno::Errno) -> ProcessError {
    use nix::errno::Errno;
    match errno {
        Errno::ESRCH => ProcessError::NotFound,
        Errno::EPERM | Errno::EACCES => ProcessError::PermissionDenied,
        other => ProcessError::Other(other.desc().to_string()),
    }
}

impl ProcessControl for UnixProcessControl {
    fn name(&self, pid: u32) -> Result<String, ProcessError> {
        Self::to_pid(pid)?;
        match std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
            Ok(comm) => Ok(comm.trim().to_string()),
            Err(_) if self.is_running(pid) => Ok(format!("pid {}", pid)),
            Err(_) => Err(ProcessError::NotFound),
        }
    }

    fn niceness(&self, pid: u32) -> Result<i32, ProcessError> {
        Self::to_pid(pid)?;
        // getpriority can legitimately return -1, so errno is the only
        // reliable failure signal.
        nix::errno::Errno::clear();
        // SAFETY: getpriority has no memory-safety preconditions.
        let value = unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) };
        if value == -1 {
            let errno = nix::errno::Errno::last();
            if errno != nix::errno::Errno::UnknownErrno {
                return Err(map_errno(errno));
            }
        }
        Ok(value)
    }

    fn set_niceness(&self, pid: u32, value: i32) -> Result<(), ProcessError> {
        Self::to_pid(pid)?;
        // SAFETY: setpriority has no memory-safety preconditions.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, value) };
        if rc == -1 {
            return Err(map_errno(nix::errno::Errno::last()));
        }
        Ok(())
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), ProcessError> {
        use nix::sys::signal::{kill, Signal};
        let target = Self::to_pid(pid)?;
        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        kill(target, sig).map_err(map_errno)
    }

    fn is_running(&self, pid: u32) -> bool {
        let Ok(target) = Self::to_pid(pid) else {
            return false;
        };
        match Self::proc_state(pid) {
            Some(Some(state)) => !matches!(state, 'Z' | 'X' | 'x'),
            Some(None) => false,
            None => match nix::sys::signal::kill(target, None::<nix::sys::signal::Signal>) {
                Ok(()) => true,
                Err(nix::errno::Errno::EPERM) => true,
                Err(_) => false,
            },
        }
    }
}

/// Outcome of one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierResult {
    pub tier: Tier,
    pub pid: u32,
    pub success: bool,
    pub message: String,
    pub failure: Option<TierFailure>,
    pub dry_run: bool,
    /// Set when a side effect was actually performed.
    pub executed_at: Option<DateTime<Utc>>,
    pub old_niceness: Option<i32>,
    pub new_niceness: Option<i32>,
}

impl TierResult {
    fn success(tier: Tier, pid: u32, mode: ExecutionMode, message: String) -> Self {
        Self {
            tier,
            pid,
            success: true,
            message,
            failure: None,
            dry_run: mode.is_dry_run(),
            executed_at: match mode {
                ExecutionMode::Live => Some(Utc::now()),
                ExecutionMode::DryRun => None,
            },
            old_niceness: None,
            new_niceness: None,
        }
    }

    /// A kill target that had already exited. No signal was sent.
    fn already_gone(pid: u32, mode: ExecutionMode) -> Self {
        let mut result = Self::success(
            Tier::ForceKill,
            pid,
            mode,
            format!("process {} already gone", pid),
        );
        result.executed_at = None;
        result
    }

    fn failure(tier: Tier, pid: u32, mode: ExecutionMode, failure: TierFailure) -> Self {
        Self {
            tier,
            pid,
            success: false,
            message: format!("{} PID {}: {}", tier, pid, failure),
            failure: Some(failure),
            dry_run: mode.is_dry_run(),
            executed_at: None,
            old_niceness: None,
            new_niceness: None,
        }
    }
}

/// Ordered tier results for one `smart_remediate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationAttempt {
    pub pid: u32,
    pub mode: ExecutionMode,
    pub tiers: Vec<TierResult>,
}

impl RemediationAttempt {
    pub fn tier(&self, tier: Tier) -> Option<&TierResult> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    /// The most forceful tier that succeeded.
    pub fn resolved_by(&self) -> Option<Tier> {
        self.tiers.iter().rev().find(|t| t.success).map(|t| t.tier)
    }

    /// One line per tier, for logs and incident notes.
    pub fn summary(&self) -> String {
        self.tiers
            .iter()
            .map(|t| format!("{}: {}", t.tier, t.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone)]
pub struct EscalationSettings {
    pub target_niceness: i32,
    pub graceful_wait: Duration,
    pub auto_escalate: bool,
    pub poll_interval: Duration,
    pub kill_wait: Duration,
}

impl From<&RemediationConfig> for EscalationSettings {
    fn from(config: &RemediationConfig) -> Self {
        Self {
            target_niceness: config.target_niceness,
            graceful_wait: Duration::from_secs(config.graceful_wait_secs),
            auto_escalate: config.auto_escalate,
            poll_interval: POLL_INTERVAL,
            kill_wait: KILL_WAIT,
        }
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self::from(&RemediationConfig::default())
    }
}

pub struct Escalator {
    control: Arc<dyn ProcessControl>,
    settings: EscalationSettings,
}

impl Escalator {
    pub fn new(control: Arc<dyn ProcessControl>, settings: EscalationSettings) -> Self {
        Self { control, settings }
    }

    /// An escalator over real processes.
    pub fn unix(config: &RemediationConfig) -> Self {
        Self::new(Arc::new(UnixProcessControl), EscalationSettings::from(config))
    }

    pub fn settings(&self) -> &EscalationSettings {
        &self.settings
    }

    /// Tier 1. A process already at or beyond the target niceness is left
    /// alone and reported as [`TierFailure::AlreadyDeprioritized`].
    pub fn renice(&self, pid: u32, mode: ExecutionMode) -> TierResult {
        let target = self.settings.target_niceness;
        let current = match self.control.niceness(pid) {
            Ok(n) => n,
            Err(e) => return TierResult::failure(Tier::Renice, pid, mode, e.into()),
        };
        if current >= target {
            return TierResult::failure(
                Tier::Renice,
                pid,
                mode,
                TierFailure::AlreadyDeprioritized { current },
            );
        }

        let message = match mode {
            ExecutionMode::DryRun => {
                format!("DRY RUN: would renice PID {} from {} to {}", pid, current, target)
            }
            ExecutionMode::Live => {
                if let Err(e) = self.control.set_niceness(pid, target) {
                    return TierResult::failure(Tier::Renice, pid, mode, e.into());
                }
                format!("reniced PID {}: {} -> {}", pid, current, target)
            }
        };
        let mut result = TierResult::success(Tier::Renice, pid, mode, message);
        result.old_niceness = Some(current);
        result.new_niceness = Some(target);
        result
    }

    /// Tier 2. Succeeds iff the process exits within the graceful window.
    pub async fn graceful_stop(&self, pid: u32, mode: ExecutionMode) -> TierResult {
        let name = match self.control.name(pid) {
            Ok(n) => n,
            Err(e) => return TierResult::failure(Tier::GracefulStop, pid, mode, e.into()),
        };
        if mode.is_dry_run() {
            return TierResult::success(
                Tier::GracefulStop,
                pid,
                mode,
                format!("DRY RUN: would send SIGTERM to PID {} ({})", pid, name),
            );
        }

        if let Err(e) = self.control.signal(pid, StopSignal::Terminate) {
            return TierResult::failure(Tier::GracefulStop, pid, mode, e.into());
        }
        if self.wait_for_exit(pid, self.settings.graceful_wait).await {
            TierResult::success(
                Tier::GracefulStop,
                pid,
                mode,
                format!("process {} ({}) stopped gracefully", pid, name),
            )
        } else {
            let mut result = TierResult::failure(
                Tier::GracefulStop,
                pid,
                mode,
                TierFailure::StillRunning {
                    waited_ms: self.settings.graceful_wait.as_millis() as u64,
                },
            );
            // The signal was delivered even though the process survived it.
            result.executed_at = Some(Utc::now());
            result
        }
    }

    /// Tier 3. A process that is already gone counts as success.
    pub async fn force_kill(&self, pid: u32, mode: ExecutionMode) -> TierResult {
        if !self.control.is_running(pid) {
            return TierResult::already_gone(pid, mode);
        }
        let name = self
            .control
            .name(pid)
            .unwrap_or_else(|_| format!("pid {}", pid));
        if mode.is_dry_run() {
            return TierResult::success(
                Tier::ForceKill,
                pid,
                mode,
                format!("DRY RUN: would send SIGKILL to PID {} ({})", pid, name),
            );
        }

        match self.control.signal(pid, StopSignal::Kill) {
            Ok(()) => {}
            Err(ProcessError::NotFound) => return TierResult::already_gone(pid, mode),
            Err(e) => return TierResult::failure(Tier::ForceKill, pid, mode, e.into()),
        }
        if self.wait_for_exit(pid, self.settings.kill_wait).await {
            TierResult::success(
                Tier::ForceKill,
                pid,
                mode,
                format!("force killed PID {} ({})", pid, name),
            )
        } else {
            TierResult::failure(
                Tier::ForceKill,
                pid,
                mode,
                TierFailure::StillRunning {
                    waited_ms: self.settings.kill_wait.as_millis() as u64,
                },
            )
        }
    }

    /// Run the escalation policy against `pid`.
    ///
    /// Dry runs preview all three tiers. Live runs renice and stop there
    /// unless `auto_escalate` is set, in which case a renice that failed for
    /// any reason other than a vanished process escalates to a graceful
    /// stop, and a graceful stop the process survived escalates to a kill.
    pub async fn smart_remediate(&self, pid: u32, mode: ExecutionMode) -> RemediationAttempt {
        let mut tiers = Vec::with_capacity(3);

        let renice = self.renice(pid, mode);
        log_tier(&renice);
        let renice_ok = renice.success;
        let vanished = renice.failure == Some(TierFailure::ProcessNotFound);
        tiers.push(renice);

        let escalate = match mode {
            ExecutionMode::DryRun => true,
            ExecutionMode::Live => self.settings.auto_escalate && !renice_ok && !vanished,
        };
        if escalate {
            let graceful = self.graceful_stop(pid, mode).await;
            log_tier(&graceful);
            let survived = matches!(graceful.failure, Some(TierFailure::StillRunning { .. }));
            tiers.push(graceful);

            if mode.is_dry_run() || survived {
                let kill = self.force_kill(pid, mode).await;
                log_tier(&kill);
                tiers.push(kill);
            }
        }

        RemediationAttempt { pid, mode, tiers }
    }

    async fn wait_for_exit(&self, pid: u32, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        loop {
            if !self.control.is_running(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

fn log_tier(result: &TierResult) {
    if result.success {
        tracing::info!(pid = result.pid, tier = %result.tier, "{}", result.message);
    } else {
        tracing::warn!(pid = result.pid, tier = %result.tier, "{}", result.message);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct FakeProcess {
        pub name: String,
        pub niceness: i32,
        pub running: bool,
        pub ignores_term: bool,
        pub protected: bool,
    }

    impl FakeProcess {
        pub fn new(name: &str, niceness: i32) -> Self {
            Self {
                name: name.to_string(),
                niceness,
                running: true,
                ignores_term: false,
                protected: false,
            }
        }
    }

    /// In-memory process table recording every mutation.
    #[derive(Default)]
    pub struct FakeProcessControl {
        pub procs: Mutex<HashMap<u32, FakeProcess>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeProcessControl {
        pub fn with(pid: u32, proc: FakeProcess) -> Arc<Self> {
            let fake = Self::default();
            fake.procs.lock().unwrap().insert(pid, proc);
            Arc::new(fake)
        }

        pub fn get(&self, pid: u32) -> Option<FakeProcess> {
            self.procs.lock().unwrap().get(&pid).cloned()
        }

        pub fn mutations(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn live(&self, pid: u32) -> Result<FakeProcess, ProcessError> {
            match self.get(pid) {
                Some(p) if p.running => Ok(p),
                _ => Err(ProcessError::NotFound),
            }
        }
    }

    impl ProcessControl for FakeProcessControl {
        fn name(&self, pid: u32) -> Result<String, ProcessError> {
            self.live(pid).map(|p| p.name)
        }

        fn niceness(&self, pid: u32) -> Result<i32, ProcessError> {
            self.live(pid).map(|p| p.niceness)
        }

        fn set_niceness(&self, pid: u32, value: i32) -> Result<(), ProcessError> {
            if self.live(pid)?.protected {
                return Err(ProcessError::PermissionDenied);
            }
            self.calls.lock().unwrap().push(format!("nice {} {}", pid, value));
            if let Some(p) = self.procs.lock().unwrap().get_mut(&pid) {
                p.niceness = value;
            }
            Ok(())
        }

        fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), ProcessError> {
            if self.live(pid)?.protected {
                return Err(ProcessError::PermissionDenied);
            }
            self.calls.lock().unwrap().push(format!("{} {}", signal, pid));
            if let Some(p) = self.procs.lock().unwrap().get_mut(&pid) {
                if signal == StopSignal::Kill || !p.ignores_term {
                    p.running = false;
                }
            }
            Ok(())
        }

        fn is_running(&self, pid: u32) -> bool {
            self.live(pid).is_ok()
        }
    }

    pub fn fast_settings(auto_escalate: bool) -> EscalationSettings {
        EscalationSettings {
            target_niceness: 19,
            graceful_wait: Duration::from_millis(200),
            auto_escalate,
            poll_interval: Duration::from_millis(10),
            kill_wait: Duration::from_millis(100),
        }
    }
}
