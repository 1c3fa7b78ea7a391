//! Task graph: an immutable-after-construction DAG of actions.
//!
//! Built once per campaign through [`GraphBuilder`], which rejects duplicate
//! ids, edges to unknown actions, and cycles. After construction the graph is
//! mutated only through the scheduler's serialized completion path:
//! [`TaskGraph::mark_running`] and [`TaskGraph::complete`].
//!
//! Edges run producer → consumer: a consumer may not start before every
//! producer reached `Success`. The one exception is a partial-tolerant
//! consumer (the aggregator), which becomes ready once every producer is
//! *terminal* — a failed branch still unblocks the report.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::action::{Action, ActionId, ActionState, Outcome};
use crate::error::{FlowError, Result};

// ---------------------------------------------------------------------------
// GraphBuilder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct GraphBuilder {
    actions: Vec<Action>,
    /// consumer → producers
    deps: HashMap<ActionId, Vec<ActionId>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action together with the producers it depends on.
    pub fn add(&mut self, action: Action, deps: Vec<ActionId>) -> &mut Self {
        self.deps.insert(action.id.clone(), deps);
        self.actions.push(action);
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<TaskGraph> {
        let mut actions: HashMap<ActionId, Action> = HashMap::new();
        let mut order: Vec<ActionId> = Vec::with_capacity(self.actions.len());
        for action in self.actions {
            if actions.contains_key(&action.id) {
                return Err(FlowError::DuplicateAction(action.id.to_string()));
            }
            order.push(action.id.clone());
            actions.insert(action.id.clone(), action);
        }

        // Every edge endpoint must name an action in this graph.
        for (consumer, producers) in &self.deps {
            for producer in producers {
                if !actions.contains_key(producer) {
                    return Err(FlowError::UnknownAction(producer.to_string()));
                }
                if producer == consumer {
                    return Err(FlowError::CycleDetected(consumer.to_string()));
                }
            }
        }

        let mut dependents: HashMap<ActionId, Vec<ActionId>> = HashMap::new();
        for (consumer, producers) in &self.deps {
            for producer in producers {
                dependents
                    .entry(producer.clone())
                    .or_default()
                    .push(consumer.clone());
            }
        }

        let graph = TaskGraph {
            actions,
            deps: self.deps,
            dependents,
            order,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// State changes triggered by one terminal transition, fed back to dispatch.
#[derive(Debug, Default)]
pub struct Transitions {
    pub newly_ready: Vec<ActionId>,
    pub newly_cancelled: Vec<ActionId>,
}

// ---------------------------------------------------------------------------
// TaskGraph
// ---------------------------------------------------------------------------

pub struct TaskGraph {
    actions: HashMap<ActionId, Action>,
    /// consumer → producers
    deps: HashMap<ActionId, Vec<ActionId>>,
    /// producer → consumers
    dependents: HashMap<ActionId, Vec<ActionId>>,
    /// Insertion order, for deterministic iteration and reporting.
    order: Vec<ActionId>,
}

impl TaskGraph {
    /// Kahn's algorithm over the dependency relation. Any node left with a
    /// nonzero in-degree sits on a cycle.
    fn check_acyclic(&self) -> Result<()> {
        let mut in_degree: HashMap<&ActionId, usize> = self
            .order
            .iter()
            .map(|id| (id, self.deps.get(id).map_or(0, |d| d.len())))
            .collect();

        let mut queue: VecDeque<&ActionId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(consumers) = self.dependents.get(id) {
                for consumer in consumers {
                    let d = in_degree
                        .get_mut(consumer)
                        .ok_or_else(|| FlowError::UnknownAction(consumer.to_string()))?;
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(consumer);
                    }
                }
            }
        }

        if visited != self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|id| in_degree.get(*id).is_some_and(|d| *d > 0))
                .map(|id| id.to_string())
                .unwrap_or_default();
            return Err(FlowError::CycleDetected(stuck));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &ActionId) -> Option<&Action> {
        self.actions.get(id)
    }

    pub fn deps_of(&self, id: &ActionId) -> &[ActionId] {
        self.deps.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Actions in insertion order.
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.order.iter().filter_map(|id| self.actions.get(id))
    }

    pub fn is_fully_terminal(&self) -> bool {
        self.actions.values().all(|a| a.state.is_terminal())
    }

    /// True when every terminal action succeeded (campaign exit code 0).
    pub fn is_clean(&self) -> bool {
        self.actions
            .values()
            .all(|a| a.state == ActionState::Success)
    }

    pub fn count_in_state(&self, state: ActionState) -> usize {
        self.actions.values().filter(|a| a.state == state).count()
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    fn deps_satisfied(&self, id: &ActionId) -> bool {
        let tolerant = self
            .actions
            .get(id)
            .is_some_and(|a| a.tolerates_failed_deps);
        self.deps_of(id).iter().all(|dep| {
            let Some(producer) = self.actions.get(dep) else {
                return false;
            };
            if tolerant {
                producer.state.is_terminal()
            } else {
                producer.state == ActionState::Success
            }
        })
    }

    fn try_promote(&mut self, id: &ActionId) -> bool {
        let pending = self
            .actions
            .get(id)
            .is_some_and(|a| a.state == ActionState::Pending);
        if pending && self.deps_satisfied(id) {
            if let Some(a) = self.actions.get_mut(id) {
                a.state = ActionState::Ready;
            }
            return true;
        }
        false
    }

    /// Promote every action whose dependencies are already satisfied.
    /// Called once before dispatch starts; roots become ready here.
    pub fn seed_ready(&mut self) -> Vec<ActionId> {
        let ids: Vec<ActionId> = self.order.clone();
        ids.into_iter()
            .filter(|id| self.try_promote(id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Scheduler-driven transitions
    // -----------------------------------------------------------------------

    pub fn mark_running(&mut self, id: &ActionId, now: DateTime<Utc>) -> Result<()> {
        let action = self
            .actions
            .get_mut(id)
            .ok_or_else(|| FlowError::UnknownAction(id.to_string()))?;
        if action.state != ActionState::Ready {
            return Err(FlowError::SchedulerFault(format!(
                "dispatched action '{id}' in state {}",
                action.state.as_str()
            )));
        }
        action.state = ActionState::Running;
        action.started_at = Some(now);
        Ok(())
    }

    /// Record a terminal transition and recompute downstream state.
    ///
    /// `state` must be `Success`, `Failed` or `Cancelled`. On success,
    /// consumers whose dependencies are now satisfied become ready. On
    /// failure or cancellation, pending consumers are cancelled transitively,
    /// stopping at partial-tolerant consumers, which may instead become
    /// ready once their last producer is terminal.
    pub fn complete(
        &mut self,
        id: &ActionId,
        state: ActionState,
        outcome: Option<Outcome>,
        now: DateTime<Utc>,
    ) -> Result<Transitions> {
        if !state.is_terminal() {
            return Err(FlowError::SchedulerFault(format!(
                "non-terminal completion state {} for '{id}'",
                state.as_str()
            )));
        }
        let action = self
            .actions
            .get_mut(id)
            .ok_or_else(|| FlowError::UnknownAction(id.to_string()))?;
        if action.state.is_terminal() {
            return Err(FlowError::SchedulerFault(format!(
                "action '{id}' completed twice"
            )));
        }
        action.state = state;
        action.outcome = outcome;
        action.finished_at = Some(now);

        let mut transitions = Transitions::default();
        if state == ActionState::Success {
            for consumer in self.dependents_of(id) {
                if self.try_promote(&consumer) {
                    transitions.newly_ready.push(consumer);
                }
            }
            return Ok(transitions);
        }

        // Failure or cancellation: cancel forward, sparing tolerant nodes.
        let mut queue: VecDeque<ActionId> = VecDeque::from([id.clone()]);
        let mut seen: HashSet<ActionId> = HashSet::new();
        let mut tolerant_candidates: Vec<ActionId> = Vec::new();
        while let Some(current) = queue.pop_front() {
            for consumer in self.dependents_of(&current) {
                if !seen.insert(consumer.clone()) {
                    continue;
                }
                let Some(a) = self.actions.get_mut(&consumer) else {
                    continue;
                };
                if a.tolerates_failed_deps {
                    tolerant_candidates.push(consumer);
                    continue;
                }
                if a.state == ActionState::Pending || a.state == ActionState::Ready {
                    a.state = ActionState::Cancelled;
                    a.finished_at = Some(now);
                    transitions.newly_cancelled.push(consumer.clone());
                    queue.push_back(consumer);
                }
            }
        }

        // A cancelled branch may have been the last thing a tolerant
        // consumer was waiting on.
        for candidate in tolerant_candidates {
            if self.try_promote(&candidate) {
                transitions.newly_ready.push(candidate);
            }
        }

        Ok(transitions)
    }

    /// Cancel everything that has not started. Used on campaign abort.
    pub fn cancel_unstarted(&mut self, now: DateTime<Utc>) -> Vec<ActionId> {
        let mut cancelled = Vec::new();
        for id in self.order.clone() {
            if let Some(a) = self.actions.get_mut(&id) {
                if a.state == ActionState::Pending || a.state == ActionState::Ready {
                    a.state = ActionState::Cancelled;
                    a.finished_at = Some(now);
                    cancelled.push(id);
                }
            }
        }
        cancelled
    }

    fn dependents_of(&self, id: &ActionId) -> Vec<ActionId> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
