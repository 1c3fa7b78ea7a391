//! Campaign aggregation: the terminal action that turns per-case outcomes
//! into a report.
//!
//! The aggregator depends on every flow action in its group and becomes
//! ready once all of them are *terminal* — failed and cancelled branches
//! still produce a (degraded) report rather than aborting aggregation. Its
//! output is a [`CampaignResult`]: a deterministic mapping from case key to
//! status, metrics and diagnostic, plus a JSONL file for the external
//! plotting collaborator.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::action::{ActionId, ActionState, AggregateSpec, DepResult, FailureKind, Outcome};
use crate::io::atomic_write;
use crate::metrics::extract_case_metrics;

// ---------------------------------------------------------------------------
// CaseBinding
// ---------------------------------------------------------------------------

/// Links one (design, pdk, clock) case to the flow action that ran it and to
/// the log directory its metrics live in. Carried in the aggregator payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseBinding {
    pub design: String,
    pub pdk: String,
    pub clock_ns: f64,
    pub run_tag: String,
    pub flow_action: ActionId,
    pub case_log_dir: PathBuf,
}

impl CaseBinding {
    /// Stable case key: `<design>/<pdk>/<run_tag>`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.design, self.pdk, self.run_tag)
    }
}

// ---------------------------------------------------------------------------
// CaseStatus / CaseReport / CampaignResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Success,
    Failed,
    Cancelled,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Success => "success",
            CaseStatus::Failed => "failed",
            CaseStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub design: String,
    pub pdk: String,
    pub clock_ns: f64,
    pub run_tag: String,
    pub status: CaseStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The consolidated campaign outcome. Keyed by case key in a `BTreeMap` so
/// that aggregating the same terminal graph twice yields an identical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignResult {
    pub campaign: String,
    pub cases: BTreeMap<String, CaseReport>,
}

impl CampaignResult {
    /// Build the result mapping from the aggregator's dependency snapshot.
    ///
    /// A dependency that is missing from the snapshot (scheduler never
    /// reached it) is reported as cancelled.
    pub fn build(spec: &AggregateSpec, deps: &HashMap<ActionId, DepResult>) -> Self {
        let mut cases = BTreeMap::new();
        for binding in &spec.cases {
            let report = match deps.get(&binding.flow_action) {
                Some(dep) => case_report(binding, dep),
                None => CaseReport {
                    design: binding.design.clone(),
                    pdk: binding.pdk.clone(),
                    clock_ns: binding.clock_ns,
                    run_tag: binding.run_tag.clone(),
                    status: CaseStatus::Cancelled,
                    metrics: BTreeMap::new(),
                    error: Some("no result recorded for flow action".to_string()),
                },
            };
            cases.insert(binding.key(), report);
        }
        Self {
            campaign: spec.campaign.clone(),
            cases,
        }
    }

    pub fn count(&self, status: CaseStatus) -> usize {
        self.cases.values().filter(|c| c.status == status).count()
    }

    /// One JSON object per case, in key order.
    pub fn to_jsonl(&self) -> crate::error::Result<String> {
        let mut out = String::new();
        for report in self.cases.values() {
            out.push_str(&serde_json::to_string(report)?);
            out.push('\n');
        }
        Ok(out)
    }
}

fn case_report(binding: &CaseBinding, dep: &DepResult) -> CaseReport {
    let (status, error) = match (&dep.state, &dep.outcome) {
        (ActionState::Success, _) => (CaseStatus::Success, None),
        (ActionState::Failed, Some(Outcome::Failure { kind, message })) => {
            (CaseStatus::Failed, Some(describe_failure(kind, message)))
        }
        (ActionState::Failed, _) => (CaseStatus::Failed, Some("failed".to_string())),
        _ => (CaseStatus::Cancelled, None),
    };
    // Metrics are read even for failed cases: a flow that died in routing
    // still has synthesis numbers worth reporting.
    let metrics = extract_case_metrics(&binding.case_log_dir);
    CaseReport {
        design: binding.design.clone(),
        pdk: binding.pdk.clone(),
        clock_ns: binding.clock_ns,
        run_tag: binding.run_tag.clone(),
        status,
        metrics,
        error,
    }
}

fn describe_failure(kind: &FailureKind, message: &str) -> String {
    match kind {
        FailureKind::ProcessError { exit_code: Some(c) } => format!("exit code {c}: {message}"),
        FailureKind::ProcessError { exit_code: None } => format!("process error: {message}"),
        FailureKind::MissingArtifact { path } => {
            format!("missing artifact {}: {message}", path.display())
        }
        FailureKind::Timeout => format!("timeout: {message}"),
        FailureKind::Aborted => format!("aborted: {message}"),
        FailureKind::Internal => format!("internal: {message}"),
    }
}

// ---------------------------------------------------------------------------
// Execution procedure of the Aggregate action
// ---------------------------------------------------------------------------

/// Build the campaign result and write `metrics.jsonl` under the output
/// directory. Always succeeds unless the report itself cannot be written;
/// failed upstream cases degrade the report, they do not fail it.
pub fn run(spec: &AggregateSpec, deps: &HashMap<ActionId, DepResult>) -> (Outcome, CampaignResult) {
    let result = CampaignResult::build(spec, deps);
    info!(
        campaign = %spec.campaign,
        ok = result.count(CaseStatus::Success),
        failed = result.count(CaseStatus::Failed),
        cancelled = result.count(CaseStatus::Cancelled),
        "aggregating campaign"
    );

    let metrics_path = metrics_jsonl_path(&spec.output_dir);
    let outcome = match result
        .to_jsonl()
        .and_then(|text| atomic_write(&metrics_path, text.as_bytes()))
    {
        Ok(()) => {
            let mut metrics = BTreeMap::new();
            metrics.insert("cases_total".to_string(), result.cases.len() as f64);
            metrics.insert(
                "cases_ok".to_string(),
                result.count(CaseStatus::Success) as f64,
            );
            Outcome::Success {
                artifacts: vec![metrics_path],
                metrics,
            }
        }
        Err(e) => Outcome::failure(
            FailureKind::Internal,
            format!("failed to write campaign report: {e}"),
        ),
    };
    (outcome, result)
}

pub fn metrics_jsonl_path(output_dir: &Path) -> PathBuf {
    output_dir.join("metrics.jsonl")
}

/// Timestamped line for the campaign summary log the CLI prints.
pub fn summary_line(result: &CampaignResult) -> String {
    format!(
        "{} campaign '{}': {} ok, {} failed, {} cancelled",
        Utc::now().format("%Y-%m-%d %H:%M:%S"),
        result.campaign,
        result.count(CaseStatus::Success),
        result.count(CaseStatus::Failed),
        result.count(CaseStatus::Cancelled),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
