//! Action data model: the unit of scheduled work.
//!
//! An `Action` is a typed node in the task graph. Its payload says *what* to
//! do (spawn one external process, or aggregate upstream results); its state
//! machine says *where it is* in the run:
//!
//! `Pending → Ready → Running → Success | Failed | Cancelled`
//!
//! A `Pending` action moves directly to `Cancelled` when any transitive
//! dependency ends `Failed` or `Cancelled`. There is no retry: a failed
//! action stays failed for the remainder of the run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::aggregate::CaseBinding;

// ---------------------------------------------------------------------------
// ActionId
// ---------------------------------------------------------------------------

/// Unique name of an action within one task graph (e.g. `flow_fdiv_sky130hd_c2p50`).
/// Also used to name the action's log files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// ActionKind
// ---------------------------------------------------------------------------

/// What stage of the pipeline an action implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Operator generation (FloPoCo-style generator → VHDL).
    Synthesize,
    /// VHDL → Verilog translation.
    Translate,
    /// Physical flow invocation (`make DESIGN_CONFIG=...`).
    RunFlow,
    /// Terminal collection of per-case outcomes into a campaign report.
    Aggregate,
    /// External plot command over the emitted metrics file.
    Plot,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Synthesize => "synthesize",
            ActionKind::Translate => "translate",
            ActionKind::RunFlow => "run_flow",
            ActionKind::Aggregate => "aggregate",
            ActionKind::Plot => "plot",
        }
    }
}

// ---------------------------------------------------------------------------
// ActionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::Success | ActionState::Failed | ActionState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionState::Pending => "pending",
            ActionState::Ready => "ready",
            ActionState::Running => "running",
            ActionState::Success => "success",
            ActionState::Failed => "failed",
            ActionState::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome / FailureKind
// ---------------------------------------------------------------------------

/// Why an action's execution failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureKind {
    /// The external tool exited non-zero.
    ProcessError { exit_code: Option<i32> },
    /// The tool exited 0 but a declared output artifact is absent.
    MissingArtifact { path: PathBuf },
    /// The process exceeded its configured timeout and was killed.
    Timeout,
    /// The process was killed because the campaign was aborted.
    Aborted,
    /// Execution-procedure error that is not a tool failure (I/O etc.).
    Internal,
}

/// Terminal result of one action's execution procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        /// Output artifacts this action produced (declared paths, verified).
        artifacts: Vec<PathBuf>,
        /// Optional numeric metrics attached by the action.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metrics: BTreeMap<String, f64>,
    },
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl Outcome {
    pub fn success(artifacts: Vec<PathBuf>) -> Self {
        Outcome::Success {
            artifacts,
            metrics: BTreeMap::new(),
        }
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// A file materialised into place just before the process spawns
/// (rendered `config.mk` / `constraint.sdc` for a flow case).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Everything needed to invoke one external process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Working directory; created if absent.
    pub cwd: PathBuf,
    /// Environment overlay applied on top of the inherited environment.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Files written before spawn.
    #[serde(default)]
    pub stage_files: Vec<StageFile>,
    /// Declared outputs; all must exist for exit 0 to count as success.
    #[serde(default)]
    pub expected_artifacts: Vec<PathBuf>,
    /// Directory receiving `<action_id>.stdout.log` / `<action_id>.stderr.log`.
    pub log_dir: PathBuf,
    #[serde(default, with = "opt_duration_secs")]
    pub timeout: Option<Duration>,
}

/// Tagged payload: the execution procedure is a pure function of the variant.
#[derive(Debug, Clone)]
pub enum Payload {
    Process(ProcessSpec),
    Aggregate(AggregateSpec),
}

/// Payload of the terminal aggregation action.
#[derive(Debug, Clone)]
pub struct AggregateSpec {
    pub campaign: String,
    pub flow_root: PathBuf,
    pub output_dir: PathBuf,
    /// One binding per (design, pdk, clock) case, pointing at the flow
    /// action whose outcome and logs the aggregator reads.
    pub cases: Vec<CaseBinding>,
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Action {
    pub id: ActionId,
    pub kind: ActionKind,
    pub payload: Payload,
    pub state: ActionState,
    pub outcome: Option<Outcome>,
    /// Aggregators run on a partial campaign: they become ready once all
    /// dependencies are *terminal*, success or not, and forward
    /// cancellation stops at them.
    pub tolerates_failed_deps: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Action {
    pub fn new(id: impl Into<ActionId>, kind: ActionKind, payload: Payload) -> Self {
        let tolerant = matches!(kind, ActionKind::Aggregate | ActionKind::Plot);
        Self {
            id: id.into(),
            kind,
            payload,
            state: ActionState::Pending,
            outcome: None,
            tolerates_failed_deps: tolerant,
            started_at: None,
            finished_at: None,
        }
    }
}

impl From<String> for ActionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// DepResult — what a consumer sees of its producers
// ---------------------------------------------------------------------------

/// Terminal snapshot of one dependency, handed to a consumer's execution
/// procedure through the context.
#[derive(Debug, Clone)]
pub struct DepResult {
    pub state: ActionState,
    pub outcome: Option<Outcome>,
}

// ---------------------------------------------------------------------------
// Serde helpers for Option<Duration> (seconds: u64)
// ---------------------------------------------------------------------------

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(dur) => s.serialize_some(&dur.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let opt: Option<u64> = Option::deserialize(d)?;
        Ok(opt.map(Duration::from_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
