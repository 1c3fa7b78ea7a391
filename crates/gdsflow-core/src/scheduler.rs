//! Bounded-concurrency executor for a task graph.
//!
//! One coordinating loop owns the graph. Ready actions are dispatched to
//! spawned workers up to the concurrency cap; every worker reports its
//! terminal outcome on a single mpsc completion channel, and only the
//! coordinating loop mutates graph state in response. Workers never touch
//! the graph, so there is no shared-state race to guard against.
//!
//! Dispatch order among simultaneously-ready actions is FIFO over readiness
//! discovery and deliberately not part of the contract.
//!
//! Abort (ctrl-c or a fatal fault upstream) flips a watch flag: running
//! processes are killed through their own abort receivers, unstarted actions
//! are cancelled, and the executor drains in-flight completions before
//! returning a partial result.

use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::action::{ActionId, ActionState, DepResult, FailureKind, Outcome, Payload};
use crate::aggregate::{self, CampaignResult};
use crate::error::{FlowError, Result};
use crate::graph::TaskGraph;
use crate::process;

pub const DEFAULT_CONCURRENCY: usize = 2;

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    concurrency: usize,
}

/// A worker's report back to the coordinating loop. The aggregator worker
/// additionally carries the campaign result it built.
struct Completion {
    id: ActionId,
    outcome: Outcome,
    campaign: Option<CampaignResult>,
}

impl Executor {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Drive `graph` until every action is terminal. Returns the campaign
    /// result produced by the aggregator, if one ran.
    ///
    /// Per-action failures are contained: they cancel dependents and never
    /// surface here. Only scheduler invariant violations return an error.
    pub async fn run(
        &self,
        graph: &mut TaskGraph,
        abort: watch::Receiver<bool>,
    ) -> Result<Option<CampaignResult>> {
        let (tx, mut rx) = mpsc::channel::<Completion>(graph.len().max(1));
        let mut ready: VecDeque<ActionId> = graph.seed_ready().into();
        let mut running = 0usize;
        let mut aborted = false;
        let mut campaign: Option<CampaignResult> = None;
        let mut abort_wake = abort.clone();

        loop {
            if !aborted && *abort.borrow() {
                aborted = true;
                ready.clear();
                let cancelled = graph.cancel_unstarted(Utc::now());
                warn!(count = cancelled.len(), "abort: cancelled unstarted actions");
            }

            while !aborted && running < self.concurrency {
                let Some(id) = ready.pop_front() else { break };
                graph.mark_running(&id, Utc::now())?;
                running += 1;
                self.spawn_worker(graph, &id, tx.clone(), abort.clone())?;
            }

            if running == 0 {
                if graph.is_fully_terminal() {
                    break;
                }
                if ready.is_empty() {
                    return Err(FlowError::SchedulerFault(
                        "no action running or ready but graph is not terminal".to_string(),
                    ));
                }
                // Ready work exists but was not dispatched: only possible
                // mid-abort, and abort cancels it on the next pass.
                continue;
            }

            let completion = tokio::select! {
                maybe = rx.recv() => maybe.ok_or_else(|| {
                    FlowError::SchedulerFault("completion channel closed".to_string())
                })?,
                _ = wait_abort(&mut abort_wake), if !aborted => continue,
            };

            if running == 0 {
                return Err(FlowError::SchedulerFault(format!(
                    "worker slot released twice (action '{}')",
                    completion.id
                )));
            }
            running -= 1;

            let state = terminal_state_for(&completion.outcome);
            match state {
                ActionState::Success => info!(action = %completion.id, "completed"),
                ActionState::Cancelled => warn!(action = %completion.id, "cancelled"),
                _ => warn!(action = %completion.id, "failed"),
            }
            let transitions =
                graph.complete(&completion.id, state, Some(completion.outcome), Utc::now())?;
            for cancelled in &transitions.newly_cancelled {
                warn!(action = %cancelled, cause = %completion.id, "cancelled by failed dependency");
            }
            if !aborted {
                ready.extend(transitions.newly_ready);
            }
            if completion.campaign.is_some() {
                campaign = completion.campaign;
            }
        }

        Ok(campaign)
    }

    fn spawn_worker(
        &self,
        graph: &TaskGraph,
        id: &ActionId,
        tx: mpsc::Sender<Completion>,
        abort: watch::Receiver<bool>,
    ) -> Result<()> {
        let action = graph
            .get(id)
            .ok_or_else(|| FlowError::UnknownAction(id.to_string()))?;
        let payload = action.payload.clone();
        let deps = dep_snapshot(graph, id);
        let id = id.clone();
        info!(action = %id, kind = action.kind.as_str(), "dispatching");

        tokio::spawn(async move {
            let (outcome, campaign) = execute_payload(&id, &payload, &deps, abort).await;
            // The coordinating loop outlives all workers; a send failure
            // means it already returned with a fault.
            let _ = tx.send(Completion { id, outcome, campaign }).await;
        });
        Ok(())
    }
}

/// The pure mapping from payload variant to execution procedure.
async fn execute_payload(
    id: &ActionId,
    payload: &Payload,
    deps: &HashMap<ActionId, DepResult>,
    abort: watch::Receiver<bool>,
) -> (Outcome, Option<CampaignResult>) {
    match payload {
        Payload::Process(spec) => (process::run(id, spec, abort).await, None),
        Payload::Aggregate(spec) => {
            let (outcome, result) = aggregate::run(spec, deps);
            (outcome, Some(result))
        }
    }
}

/// Terminal snapshot of an action's dependencies, captured at dispatch time.
/// All of them are terminal by the readiness rule, so this is stable.
fn dep_snapshot(graph: &TaskGraph, id: &ActionId) -> HashMap<ActionId, DepResult> {
    graph
        .deps_of(id)
        .iter()
        .filter_map(|dep| {
            graph.get(dep).map(|a| {
                (
                    dep.clone(),
                    DepResult {
                        state: a.state,
                        outcome: a.outcome.clone(),
                    },
                )
            })
        })
        .collect()
}

fn terminal_state_for(outcome: &Outcome) -> ActionState {
    match outcome {
        Outcome::Success { .. } => ActionState::Success,
        Outcome::Failure {
            kind: FailureKind::Aborted,
            ..
        } => ActionState::Cancelled,
        Outcome::Failure { .. } => ActionState::Failed,
    }
}

async fn wait_abort(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
