//! The monitoring daemon.
//!
//! [`Scheduler`] owns two independent timers and drives a [`CheckCycle`]:
//!
//! ```text
//! Stopped ──run()──▶ Running ──shutdown requested──▶ Stopping ──▶ Stopped
//!                       │
//!                       └── error escapes a tick ──▶ Stopped (run() returns Err)
//! ```
//!
//! Each tick runs the health check if its interval has elapsed, then the
//! resource check if its interval has elapsed, then sleeps one poll period.
//! Both timers start as "never ran", so the first tick runs both checks.
//! Shutdown is cooperative: the handle is only consulted between ticks.
//!
//! [`Monitor`] is the production [`CheckCycle`]. The health check asks the
//! planner for a system health check and runs the chosen probes. The
//! resource check finds processes over the CPU/memory thresholds,
//! remediates the worst few, fires matching runbooks and records what it
//! found in incident memory.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::alerts::{AlertSink, AlertSystem, Metric};
use crate::config::{AlertsConfig, Config, DaemonConfig};
use crate::embedding;
use crate::incidents::{IncidentEntry, IncidentRecorder, ResultsSummary};
use crate::logs::LogRotation;
use crate::memory::IncidentStore;
use crate::models::ExecutionMode;
use crate::observe::{Observer, SystemObserver};
use crate::planner::{LlmPlanner, Plan, Planner};
use crate::remediation::Escalator;
use crate::runbook::RunbookEngine;
use crate::tools::ToolExecutor;

pub const HEALTH_CHECK_QUERY: &str = "Perform comprehensive system health check";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Running,
    Stopping,
}

/// Shared stop flag. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Which checks are due at a given instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub health: bool,
    pub resource: bool,
}

#[derive(Debug, Clone)]
pub struct DaemonState {
    pub phase: Phase,
    pub last_health_check: Option<Instant>,
    pub last_resource_check: Option<Instant>,
    pub health_interval: Duration,
    pub resource_interval: Duration,
}

impl DaemonState {
    pub fn new(health_interval: Duration, resource_interval: Duration) -> Self {
        Self {
            phase: Phase::Stopped,
            last_health_check: None,
            last_resource_check: None,
            health_interval,
            resource_interval,
        }
    }

    pub fn due(&self, now: Instant) -> Due {
        Due {
            health: elapsed(self.last_health_check, self.health_interval, now),
            resource: elapsed(self.last_resource_check, self.resource_interval, now),
        }
    }
}

fn elapsed(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= interval,
    }
}

/// The work the scheduler drives.
#[async_trait]
pub trait CheckCycle: Send {
    async fn health_check(&mut self) -> Result<()>;
    async fn resource_check(&mut self) -> Result<()>;
}

pub struct Scheduler<C> {
    cycle: C,
    state: DaemonState,
    poll_period: Duration,
    shutdown: ShutdownHandle,
}

impl<C: CheckCycle> Scheduler<C> {
    pub fn new(cycle: C, config: &DaemonConfig, shutdown: ShutdownHandle) -> Self {
        Self::with_intervals(
            cycle,
            config.poll_period(),
            config.health_interval(),
            config.resource_interval(),
            shutdown,
        )
    }

    pub fn with_intervals(
        cycle: C,
        poll_period: Duration,
        health_interval: Duration,
        resource_interval: Duration,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            cycle,
            state: DaemonState::new(health_interval, resource_interval),
            poll_period,
            shutdown,
        }
    }

    pub fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn cycle(&self) -> &C {
        &self.cycle
    }

    /// Run whichever checks are due at `now` and reset their timers.
    pub async fn tick(&mut self, now: Instant) -> Result<Due> {
        let due = self.state.due(now);
        if due.health {
            self.cycle.health_check().await.context("health check failed")?;
            self.state.last_health_check = Some(now);
        }
        if due.resource {
            self.cycle
                .resource_check()
                .await
                .context("resource check failed")?;
            self.state.last_resource_check = Some(now);
        }
        Ok(due)
    }

    /// Loop until shutdown is requested or a tick fails.
    pub async fn run(&mut self) -> Result<()> {
        self.state.phase = Phase::Running;
        self.state.last_health_check = None;
        self.state.last_resource_check = None;
        tracing::info!(
            "daemon started: health checks every {}s, resource checks every {}s, polling every {}s",
            self.state.health_interval.as_secs(),
            self.state.resource_interval.as_secs(),
            self.poll_period.as_secs()
        );

        while !self.shutdown.is_requested() {
            if let Err(e) = self.tick(Instant::now()).await {
                tracing::error!("fatal error, daemon stopping: {:#}", e);
                self.state.phase = Phase::Stopped;
                return Err(e);
            }
            tokio::time::sleep(self.poll_period).await;
        }

        self.state.phase = Phase::Stopping;
        tracing::info!("shutdown requested, stopping");
        self.state.phase = Phase::Stopped;
        tracing::info!("daemon stopped");
        Ok(())
    }
}

/// Request shutdown on SIGTERM or SIGINT.
pub fn spawn_signal_listener(shutdown: ShutdownHandle) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        tracing::info!("received shutdown signal, stopping after the current tick");
        shutdown.request();
    });
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub mode: ExecutionMode,
    pub cpu_threshold: f32,
    pub memory_threshold: f32,
    pub max_remediations: usize,
    pub similar_k: usize,
    pub alert_thresholds: AlertsConfig,
    pub logs_dir: PathBuf,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.execution_mode(),
            cpu_threshold: config.daemon.cpu_threshold,
            memory_threshold: config.daemon.memory_threshold,
            max_remediations: config.daemon.max_remediations_per_cycle,
            similar_k: config.memory.default_k,
            alert_thresholds: config.alerts.clone(),
            logs_dir: config.logs.dir.clone(),
        }
    }
}

/// Production check cycle.
pub struct Monitor {
    settings: MonitorSettings,
    planner: Box<dyn Planner>,
    tools: ToolExecutor,
    observer: Box<dyn Observer>,
    escalator: Escalator,
    runbooks: RunbookEngine,
    alerts: Arc<dyn AlertSink>,
    store: IncidentStore,
    recorder: IncidentRecorder,
    rotation: LogRotation,
}

impl Monitor {
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn embedding::Embedder> =
            Arc::from(embedding::create_embedder(&config.embedding)?);
        let store = IncidentStore::open(&config.memory.dir, embedder);

        let (runbooks, err) =
            RunbookEngine::load(&config.runbooks.path, config.runbooks.stop_on_failure);
        if let Some(e) = err {
            tracing::warn!("continuing without runbooks: {}", e);
        }

        Ok(Self {
            settings: MonitorSettings::from_config(config),
            planner: Box::new(LlmPlanner::new(
                config.llm.clone(),
                config.tools.allowed_tools.clone(),
            )),
            tools: ToolExecutor::from_config(config),
            observer: Box::new(SystemObserver::new()),
            escalator: Escalator::unix(&config.remediation),
            runbooks,
            alerts: Arc::new(AlertSystem::new(
                config.alerts.clone(),
                config.logs.alerts_path(),
            )),
            store,
            recorder: IncidentRecorder::new(config.logs.incidents_path()),
            rotation: LogRotation::from_config(&config.logs)?,
        })
    }

    pub fn store(&self) -> &IncidentStore {
        &self.store
    }

    async fn remember(&mut self, entry: IncidentEntry) {
        self.recorder.record(&mut self.store, &entry).await;
    }

    async fn log_similar_incidents(&self, description: &str) {
        match self.store.search(description, self.settings.similar_k).await {
            Ok(hits) if hits.is_empty() => {}
            Ok(hits) => {
                for hit in hits {
                    tracing::info!(
                        "  similar past incident #{} ({:.2}): {}",
                        hit.id,
                        hit.similarity,
                        hit.text
                    );
                }
            }
            Err(e) => tracing::warn!("incident lookup failed: {}", e),
        }
    }
}

#[async_trait]
impl CheckCycle for Monitor {
    async fn health_check(&mut self) -> Result<()> {
        tracing::info!("running full health check");
        if let Some(e) = self.runbooks.reload() {
            tracing::warn!("runbook reload failed, continuing without runbooks: {}", e);
        }

        let (plan, outcome, notes) = match self.planner.plan(HEALTH_CHECK_QUERY).await {
            Ok(plan) => (plan, "success", "Autonomous health check".to_string()),
            Err(failure) => {
                tracing::warn!("planning failed: {}", failure);
                let plan = Plan {
                    goal: "Planning error".to_string(),
                    tools: Vec::new(),
                    reasoning: failure.to_string(),
                };
                (plan, "error", format!("Autonomous health check: {}", failure))
            }
        };
        let run = self.tools.execute_plan(&plan).await;
        tracing::info!(
            "health check complete: {} tools executed, {} succeeded",
            run.tools_executed(),
            run.success_count()
        );

        let entry = IncidentEntry::new(HEALTH_CHECK_QUERY, &plan, (&run).into(), outcome, &notes);
        self.remember(entry).await;

        match self.rotation.rotate_all(&self.settings.logs_dir) {
            Ok(report) if !report.rotated.is_empty() || !report.removed.is_empty() => {
                tracing::info!(
                    "log rotation: {} rotated, {} removed",
                    report.rotated.len(),
                    report.removed.len()
                )
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("log rotation failed: {:#}", e),
        }
        Ok(())
    }

    async fn resource_check(&mut self) -> Result<()> {
        tracing::info!("checking resource usage");
        let mode = self.settings.mode;
        let ctx = self.observer.observe().await.context("observation failed")?;

        let thresholds = &self.settings.alert_thresholds;
        for disk in &ctx.disk_usage {
            if thresholds.should_alert(Metric::Disk, disk.usage_percent) {
                self.alerts.high_disk(&disk.filesystem, disk.usage_percent).await;
            }
        }
        if let Some(mem) = ctx.memory_usage {
            if thresholds.should_alert(Metric::Memory, mem) {
                self.alerts.high_memory(mem).await;
            }
        }

        let hogs = self
            .observer
            .resource_hogs(self.settings.cpu_threshold, self.settings.memory_threshold)
            .await
            .context("process scan failed")?;

        let mut actions = 0usize;
        let mut succeeded = 0usize;
        let mut remediation_notes = Vec::new();
        if hogs.is_empty() {
            tracing::info!("resource usage normal");
        } else {
            tracing::warn!("found {} resource-intensive processes", hogs.len());
        }
        for hog in hogs.iter().take(self.settings.max_remediations) {
            let reason = hog.reason();
            tracing::warn!("  PID {}: {} - {}", hog.pid, hog.name, reason);
            self.alerts.resource_hog(hog.pid, &hog.name, &reason).await;
            self.log_similar_incidents(&format!("High resource usage by {}: {}", hog.name, reason))
                .await;

            let attempt = self.escalator.smart_remediate(hog.pid, mode).await;
            actions += 1;
            if attempt.resolved_by().is_some() {
                succeeded += 1;
            }
            remediation_notes.push(format!("{} (PID {}): {}", hog.name, hog.pid, attempt.summary()));
        }

        let mut fired = Vec::new();
        for runbook in self.runbooks.find_matching(&ctx) {
            let result = self
                .runbooks
                .execute(runbook, &ctx, mode, self.alerts.as_ref())
                .await;
            actions += 1;
            if result.succeeded() {
                succeeded += 1;
            }
            fired.push(result.runbook_name);
        }

        if hogs.is_empty() && fired.is_empty() {
            return Ok(());
        }

        let query = if hogs.is_empty() {
            format!("Runbooks triggered: {}", fired.join(", "))
        } else {
            format!("High resource usage detected: {} processes", hogs.len())
        };
        let plan = Plan {
            goal: "Resource monitoring".to_string(),
            tools: vec!["process_list".to_string()],
            reasoning: "Autonomous check".to_string(),
        };
        let summary = ResultsSummary {
            tools_executed: actions,
            success_count: succeeded,
            goal: plan.goal.clone(),
        };
        let mut notes = format!("Found {} resource hogs", hogs.len());
        if !remediation_notes.is_empty() {
            notes.push_str("; ");
            notes.push_str(&remediation_notes.join("; "));
        }
        if !fired.is_empty() {
            notes.push_str("; runbooks: ");
            notes.push_str(&fired.join(", "));
        }
        let entry = IncidentEntry::new(&query, &plan, summary, "warning", &notes);
        self.remember(entry).await;
        Ok(())
    }
}

/// Build the production monitor and run it until SIGTERM/SIGINT.
pub async fn run_daemon(config: &Config) -> Result<()> {
    let monitor = Monitor::from_config(config)?;
    tracing::info!(
        "mode: {}, incident memory: {} records ({})",
        config.execution_mode(),
        monitor.store().count(),
        monitor.store().model_name()
    );

    let shutdown = ShutdownHandle::new();
    spawn_signal_listener(shutdown.clone())?;
    Scheduler::new(monitor, &config.daemon, shutdown).run().await
}
