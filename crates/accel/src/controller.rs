//! Convergence controller: gates on the cluster lifecycle, fans out the
//! apply workers, aggregates their events, and coordinates shutdown.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use kube::Client;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use zap_core::{
    end_condition_extension, Shutdown, StatusEvent, WorkerState, RETRY_TIME,
};
use zap_kubehub::ClusterStatusProbe;

use crate::approver::approve_install_plans;
use crate::manifests::fetch_manifests;

/// Consecutive probe failures tolerated by the stop-condition ticker.
const MAX_PROBE_RETRIES: u32 = 20;

/// Exit status of one controller run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every apply worker reported success before shutdown.
    Converged,
    /// Shutdown arrived first: stop condition, probe failures, or signal.
    Aborted,
}

/// Poll until the start condition holds: the cluster is progressing and
/// the operator catalog is usable. A cluster that has already finished
/// progressing is the stop condition and yields an error; a `Progressing`
/// condition that is absent is neither signal and keeps the gate waiting.
pub async fn wait_for_start_condition(probe: &ClusterStatusProbe) -> Result<()> {
    let mut probe_retries = 0u32;
    loop {
        let outcome = async {
            let progressing = probe.is_progressing().await?;
            let available = probe.is_operator_available().await?;
            Ok::<_, anyhow::Error>((progressing, available))
        }
        .await;
        match outcome {
            Ok((progressing, available)) => {
                probe_retries = 0;
                if progressing == Some(false) {
                    return Err(anyhow!("cluster version is no longer progressing"));
                }
                if progressing == Some(true) && available == Some(true) {
                    return Ok(());
                }
            }
            Err(e) => {
                probe_retries += 1;
                warn!(error = %e, retries = probe_retries, "start condition probe failed");
                if probe_retries >= MAX_PROBE_RETRIES {
                    return Err(anyhow!("can't read cluster status after {probe_retries} retries"));
                }
            }
        }
        info!("start condition is not reached, wait another {}s", RETRY_TIME.as_secs());
        tokio::time::sleep(RETRY_TIME).await;
    }
}

/// Controller-local view of worker progress, keyed by the worker identity
/// string. Owned by the event loop; workers only ever touch the channel.
#[derive(Debug)]
pub struct Aggregate {
    status: HashMap<String, WorkerState>,
    outstanding: usize,
    succeeded: usize,
    total: usize,
}

impl Aggregate {
    pub fn new(total: usize) -> Self {
        Self { status: HashMap::new(), outstanding: 0, succeeded: 0, total }
    }

    /// Fold one event into the map. Fatal events are handled by the
    /// caller before this point.
    pub fn record(&mut self, ev: &StatusEvent) {
        let key = ev.ident.key();
        match ev.state {
            WorkerState::Starting => {
                self.status.insert(key, WorkerState::Starting);
                self.outstanding += 1;
            }
            WorkerState::Success => {
                self.status.insert(key, WorkerState::Success);
                self.outstanding = self.outstanding.saturating_sub(1);
                self.succeeded += 1;
            }
            WorkerState::Fail => {
                self.status.insert(key, WorkerState::Fail);
            }
            WorkerState::Fatal => {}
        }
    }

    /// Global success: every spawned worker has come back with success.
    pub fn all_done(&self) -> bool {
        self.succeeded == self.total && self.outstanding == 0
    }

    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = self
            .status
            .iter()
            .map(|(k, s)| format!("{k}: {s:?}"))
            .collect();
        parts.sort();
        parts.join(", ")
    }
}

async fn delay_exit() {
    if let Some(extension) = end_condition_extension() {
        info!("delaying exit by {:?}", extension);
        tokio::time::sleep(extension).await;
    }
}

pub struct Controller {
    client: Client,
    probe: ClusterStatusProbe,
}

impl Controller {
    pub fn new(client: Client) -> Self {
        let probe = ClusterStatusProbe::new(client.clone());
        Self { client, probe }
    }

    /// Drive one agent run to completion. Returns `Converged` only when
    /// every apply worker reported success before shutdown. `shutdown` is
    /// shared with the caller so an external signal funnels into the same
    /// path as the stop condition.
    pub async fn run(&self, shutdown: Shutdown) -> Result<Outcome> {
        let mut fetch_signal = shutdown.signal();
        let manifests = fetch_manifests(self.client.clone(), &mut fetch_signal).await?;
        let total = manifests.len();

        let (events_tx, mut events_rx) = mpsc::channel::<StatusEvent>(16);
        let mut workers: JoinSet<()> = JoinSet::new();
        for obj in manifests {
            workers.spawn(zap_apply::apply_manifest(
                self.client.clone(),
                obj,
                events_tx.clone(),
                shutdown.signal(),
            ));
        }
        workers.spawn(approve_install_plans(self.client.clone(), shutdown.signal()));
        drop(events_tx);

        let mut aggregate = Aggregate::new(total);
        let mut all_done = false;
        let mut probe_retries = 0u32;
        let mut events_closed = false;

        if aggregate.all_done() {
            info!("manifest bundle is empty, nothing to apply");
            all_done = true;
            delay_exit().await;
            shutdown.trigger();
        }

        let mut ticker = interval_at(Instant::now() + RETRY_TIME, RETRY_TIME);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stop_signal = shutdown.signal();

        loop {
            tokio::select! {
                maybe = events_rx.recv(), if !events_closed => {
                    let Some(ev) = maybe else {
                        events_closed = true;
                        continue;
                    };
                    info!(state = ?ev.state, ident = %ev.ident, error = ?ev.error, "worker event");
                    if ev.state == WorkerState::Fatal {
                        return Err(ev.error.unwrap_or_else(|| anyhow!("fatal worker error")));
                    }
                    aggregate.record(&ev);
                    if !all_done && aggregate.all_done() {
                        all_done = true;
                        delay_exit().await;
                        info!("all manifests applied, shutting down");
                        shutdown.trigger();
                    }
                }
                _ = ticker.tick(), if !all_done && !shutdown.is_triggered() => {
                    match self.probe.is_progressing().await {
                        Err(e) => {
                            probe_retries += 1;
                            warn!(error = %e, retries = probe_retries, "clusterversion probe failed, will retry");
                            if probe_retries >= MAX_PROBE_RETRIES {
                                error!("can't read clusterversion status, shutting down after {} retries", probe_retries);
                                shutdown.trigger();
                            }
                        }
                        Ok(progressing) => {
                            probe_retries = 0;
                            if progressing == Some(false) {
                                delay_exit().await;
                                info!("stop condition - cancelling all jobs and exiting");
                                shutdown.trigger();
                            }
                        }
                    }
                }
                _ = stop_signal.triggered() => {
                    // Stop accepting events so cancelled workers never
                    // block on a full channel while we drain them.
                    events_rx.close();
                    while workers.join_next().await.is_some() {}
                    info!(all_done, status = %aggregate.summary(), "workers drained");
                    return Ok(if all_done { Outcome::Converged } else { Outcome::Aborted });
                }
            }
        }
    }
}
