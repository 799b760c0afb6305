//! Rudder reconciliation loop.
//!
//! Each tick polls the desired state, decodes every entry, dry-runs then applies
//! the present set in list order, dispatches removals for the missing set, and
//! reports an aggregated status snapshot. Per-manifest failures are recorded in
//! the [`TickReport`] and never abort the tick.

#![forbid(unsafe_code)]

mod config;
mod report;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use rudder_apply::Applier;
use rudder_control::{Poller, Reporter};
use rudder_core::{aggregate, ObjectRef, RudderError, RudderResult};
use rudder_kubehub::Observer;
use rudder_manifest::Deployable;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use config::{AgentConfig, PollFailurePolicy};
pub use report::{ManifestFailure, ManifestSet, Phase, RemovalOutcome, TickReport};

pub struct Agent {
    config: AgentConfig,
    poller: Arc<dyn Poller>,
    applier: Arc<dyn Applier>,
    observer: Arc<dyn Observer>,
    reporter: Arc<dyn Reporter>,
    phase_tx: watch::Sender<Phase>,
    removal_tx: mpsc::UnboundedSender<RemovalOutcome>,
    removal_rx: mpsc::UnboundedReceiver<RemovalOutcome>,
    inflight: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        poller: Arc<dyn Poller>,
        applier: Arc<dyn Applier>,
        observer: Arc<dyn Observer>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        Self { config, poller, applier, observer, reporter, phase_tx, removal_tx, removal_rx, inflight: Vec::new() }
    }

    pub fn phase(&self) -> Phase { *self.phase_tx.borrow() }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> { self.phase_tx.subscribe() }

    fn set_phase(&self, phase: Phase) {
        debug!(?phase, "phase");
        self.phase_tx.send_replace(phase);
    }

    /// Run ticks until `cancel` fires. With [`PollFailurePolicy::Exit`] the first
    /// poll error ends the loop and is returned.
    pub async fn run(&mut self, cancel: CancellationToken) -> RudderResult<()> {
        info!(app_id = %self.config.app_id, interval = ?self.config.poll_interval, policy = ?self.config.poll_failure, "reconcile loop started");
        let mut poll_failures: u32 = 0;
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            let delay = match self.tick().await {
                Ok(report) => {
                    poll_failures = 0;
                    info!(
                        applied = report.applied,
                        failed = report.failures.len(),
                        removals = report.removals_dispatched,
                        resources = report.status.resource_states.len(),
                        reported = report.report_error.is_none(),
                        "tick complete"
                    );
                    self.config.poll_interval
                }
                Err(e) => match self.config.poll_failure {
                    PollFailurePolicy::Exit => {
                        error!(error = %e, "failed to get desired state; stopping");
                        break Err(e);
                    }
                    PollFailurePolicy::Retry => {
                        poll_failures = poll_failures.saturating_add(1);
                        let delay = self.config.backoff(poll_failures);
                        warn!(error = %e, attempt = poll_failures, retry_in = ?delay, "failed to get desired state");
                        delay
                    }
                },
            };
            self.set_phase(Phase::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested; leaving sleep");
                    break Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };
        self.settle_removals().await;
        self.set_phase(Phase::Idle);
        info!("reconcile loop stopped");
        result
    }

    /// One reconciliation pass. Only a poll failure is returned as an error.
    pub async fn tick(&mut self) -> RudderResult<TickReport> {
        let t0 = Instant::now();
        counter!("ticks_total", 1u64);
        let removals_completed = self.reap_removals();

        self.set_phase(Phase::Polling);
        let desired = match self.poller.poll().await {
            Ok(d) => d,
            Err(e) => {
                counter!("poll_err", 1u64, "kind" => e.label());
                return Err(e);
            }
        };

        self.set_phase(Phase::Decoding);
        let mut failures = Vec::new();
        let mut filtered_objects = 0usize;
        let present = decode_set(&desired.present, ManifestSet::Present, &mut failures, &mut filtered_objects);
        let missing = decode_set(&desired.missing, ManifestSet::Missing, &mut failures, &mut filtered_objects);

        self.set_phase(Phase::Reconciling);
        let mut applied = 0usize;
        let mut skipped_empty = 0usize;
        let mut targets: Vec<ObjectRef> = Vec::new();
        for (index, deployable) in present {
            if deployable.is_empty() {
                skipped_empty += 1;
                continue;
            }
            targets.extend(deployable.object_refs());
            match self.ensure_present(&deployable).await {
                Ok(()) => applied += 1,
                Err(error) => {
                    counter!("manifest_err", 1u64, "kind" => error.label());
                    warn!(index, error = %error, "present manifest not applied");
                    failures.push(ManifestFailure { set: ManifestSet::Present, index, error });
                }
            }
        }
        let mut removals_dispatched = 0usize;
        for (index, deployable) in missing {
            if deployable.is_empty() {
                skipped_empty += 1;
                continue;
            }
            match deployable.to_yaml() {
                Ok(bytes) => {
                    self.dispatch_removal(index, bytes);
                    removals_dispatched += 1;
                }
                Err(e) => failures.push(ManifestFailure { set: ManifestSet::Missing, index, error: e.into() }),
            }
        }

        self.set_phase(Phase::Reporting);
        let observations = self.observer.observe(&targets).await;
        let status = aggregate(&self.config.app_id, observations, chrono::Utc::now());
        let report_error = match self.reporter.report(&status).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "failed to report app status");
                Some(e)
            }
        };

        histogram!("tick_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(TickReport {
            failures,
            applied,
            skipped_empty,
            filtered_objects,
            removals_dispatched,
            removals_completed,
            status,
            report_error,
        })
    }

    /// Dry-run gate then apply. No mutation happens unless validation passed.
    async fn ensure_present(&self, deployable: &Deployable) -> RudderResult<()> {
        let bytes = deployable.to_yaml().map_err(RudderError::from)?;
        debug!(objects = deployable.objects.len(), "dry run applying manifest");
        self.applier.validate_apply(&bytes).await?;
        debug!(objects = deployable.objects.len(), "applying manifest");
        self.applier.apply(&bytes).await
    }

    /// Fire-and-forget removal; the outcome arrives on the removal channel.
    fn dispatch_removal(&mut self, index: usize, bytes: Vec<u8>) {
        let applier = Arc::clone(&self.applier);
        let tx = self.removal_tx.clone();
        let handle = tokio::spawn(async move {
            let result = applier.remove(&bytes).await;
            let _ = tx.send(RemovalOutcome { index, result });
        });
        self.inflight.push(handle);
    }

    /// Collect removals that finished since the last call.
    fn reap_removals(&mut self) -> Vec<RemovalOutcome> {
        self.inflight.retain(|h| !h.is_finished());
        let mut done = Vec::new();
        while let Ok(outcome) = self.removal_rx.try_recv() {
            log_removal(&outcome);
            done.push(outcome);
        }
        done
    }

    /// Wait (bounded by the shutdown grace) for in-flight removals, then collect
    /// every outcome. Stragglers are aborted.
    pub async fn settle_removals(&mut self) -> Vec<RemovalOutcome> {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        for mut handle in self.inflight.drain(..) {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!("removal still running at shutdown; aborting");
                handle.abort();
            }
        }
        self.reap_removals()
    }
}

fn decode_set(
    entries: &[rudder_core::EncodedManifest],
    set: ManifestSet,
    failures: &mut Vec<ManifestFailure>,
    filtered_objects: &mut usize,
) -> Vec<(usize, Deployable)> {
    let mut out = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        match rudder_manifest::prepare(entry) {
            Ok(d) => {
                *filtered_objects += d.filtered;
                out.push((index, d));
            }
            Err(e) => {
                counter!("manifest_err", 1u64, "kind" => "decode");
                warn!(?set, index, error = %e, "error decoding manifest");
                failures.push(ManifestFailure { set, index, error: e.into() });
            }
        }
    }
    out
}

fn log_removal(outcome: &RemovalOutcome) {
    match &outcome.result {
        Ok(()) => debug!(index = outcome.index, "removal finished"),
        Err(e) => {
            counter!("manifest_err", 1u64, "kind" => e.label());
            warn!(index = outcome.index, error = %e, "removal failed");
        }
    }
}
