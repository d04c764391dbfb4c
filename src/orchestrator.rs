//! The update loop: inspect, plan, apply, report, repeat.
//!
//! Cycles never overlap. A trigger that arrives while a cycle runs is queued
//! and starts at most one follow-up cycle. On shutdown the actions already
//! started run to a terminal state; actions not yet started are reported as
//! skipped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

use crate::config::Config;
use crate::executor::{ExecutorSettings, UpdateExecutor};
use crate::inspector::RuntimeInspector;
use crate::notify::Notifier;
use crate::planner::UpdatePlanner;
use crate::registry::{DigestResolver, RetryPolicy};
use crate::runtime::{bounded, ContainerRuntime};
use crate::types::{CycleReport, Scope, UpdateOutcome};

/// Why a cycle started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Schedule,
    /// Operator command, with where it came from.
    Command(String),
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Schedule => f.write_str("scheduled"),
            Trigger::Command(source) => write!(f, "command from {}", source),
        }
    }
}

#[derive(Debug, Clone)]
struct LoopOptions {
    interval: Duration,
    max_concurrency: usize,
    dry_run: bool,
    run_once: bool,
    cleanup: bool,
    host_name: String,
    engine_timeout: Duration,
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    scope: Scope,
    inspector: RuntimeInspector,
    resolver: DigestResolver,
    executor: UpdateExecutor,
    notifier: Notifier,
    options: LoopOptions,
    cycles: u64,
}

impl Orchestrator {
    pub fn from_config(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        notifier: Notifier,
    ) -> Self {
        let settings = ExecutorSettings::from(&config.timeouts);
        let policy = RetryPolicy {
            attempts: config.registry.attempts,
            base_delay: Duration::from_millis(config.registry.backoff_ms),
            ..RetryPolicy::default()
        };
        Self {
            inspector: RuntimeInspector::new(Arc::clone(&runtime), settings.engine_timeout),
            resolver: DigestResolver::new(
                Arc::clone(&runtime),
                policy,
                Duration::from_secs(config.timeouts.resolve_secs),
            ),
            executor: UpdateExecutor::new(Arc::clone(&runtime), settings),
            runtime,
            scope: config.scope.clone(),
            notifier,
            options: LoopOptions {
                interval: config.interval(),
                max_concurrency: config.max_concurrency.max(1),
                dry_run: config.dry_run,
                run_once: config.run_once,
                cleanup: config.cleanup,
                host_name: config.host_name.clone(),
                engine_timeout: settings.engine_timeout,
            },
            cycles: 0,
        }
    }

    /// Runs cycles until shutdown, or once in run-once mode.
    pub async fn run(
        mut self,
        mut triggers: mpsc::Receiver<Trigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            "Update loop started for {} (interval {:?}, dry run: {})",
            self.scope, self.options.interval, self.options.dry_run
        );
        let mut ticker = interval(self.options.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(trigger) = triggers.recv() => trigger,
                _ = ticker.tick() => Trigger::Schedule,
            };
            if *shutdown.borrow() {
                break;
            }

            info!("Starting cycle {} ({})", self.cycles + 1, trigger);
            let report = self.run_cycle(&shutdown).await;
            self.notifier.publish(&report).await;

            if self.options.run_once {
                info!("Run-once mode: exiting after single cycle.");
                break;
            }
            ticker.reset();
        }
        info!("Update loop stopped");
    }

    /// One full cycle. Never fails: a cycle-fatal error is recorded in the
    /// report and the next cycle retries from scratch.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        self.cycles += 1;
        let mut report =
            CycleReport::new(self.cycles, &self.options.host_name, self.options.dry_run);

        let inventory = match self.inspector.list_managed(&self.scope).await {
            Ok(inventory) => inventory,
            Err(e) => {
                error!("Cycle {} aborted: {}", self.cycles, e);
                report.fatal = Some(e.to_string());
                report.finish();
                return report;
            }
        };
        report.skipped.extend(inventory.skipped);

        let plan = UpdatePlanner::new(&self.scope, &self.resolver)
            .plan(inventory.containers)
            .await;
        report.up_to_date = plan.up_to_date;
        report.skipped.extend(plan.skipped);

        if plan.actions.is_empty() {
            info!(
                "Cycle {}: nothing to update ({} up to date)",
                self.cycles,
                report.up_to_date.len()
            );
        }

        if self.options.dry_run {
            for action in plan.actions {
                info!("[DRY-RUN] would update {}", action);
                report.outcomes.push(UpdateOutcome::skipped(action, "dry run"));
            }
        } else {
            let executor = &self.executor;
            let notifier = &self.notifier;
            let host = self.options.host_name.as_str();
            report.outcomes = stream::iter(plan.actions)
                .map(|action| async move {
                    let stopping = *shutdown.borrow();
                    if stopping {
                        return UpdateOutcome::skipped(action, "shutdown requested before start");
                    }
                    let outcome = executor.apply(action).await;
                    // A container is down; operators hear now, not after the cycle.
                    if outcome.is_escalation() {
                        notifier.escalate(host, &outcome).await;
                    }
                    outcome
                })
                .buffered(self.options.max_concurrency)
                .collect()
                .await;
        }

        if self.options.cleanup && report.counts().updated > 0 {
            let pruned = bounded(self.options.engine_timeout, self.runtime.prune_dangling_images());
            match pruned.await {
                Ok(bytes) => {
                    info!("Image cleanup reclaimed {:.2} MB", bytes as f64 / 1_048_576.0);
                    report.reclaimed_bytes = Some(bytes);
                }
                Err(e) => warn!("Image cleanup failed: {}", e),
            }
        }

        report.finish();
        report
    }
}
