use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use gdsflow_core::action::{Action, ActionState, Outcome};
use gdsflow_core::aggregate::{self, CaseStatus};
use gdsflow_core::campaign::{self, CampaignConfig};
use gdsflow_core::scheduler::Executor;
use gdsflow_core::toolchain::Toolchain;
use std::path::Path;
use tokio::sync::watch;
use tracing::{info, warn};

/// Execute a campaign to completion. Returns the process exit code: 0 when
/// every action succeeded, 1 when the campaign is degraded (failed or
/// cancelled cases in the report).
pub async fn run(
    campaign_file: &Path,
    concurrency: Option<usize>,
    generator_bin: Option<&Path>,
    translator_bin: Option<&Path>,
    json: bool,
) -> anyhow::Result<i32> {
    let config = CampaignConfig::load(campaign_file)
        .with_context(|| format!("failed to load campaign '{}'", campaign_file.display()))?;

    // Command-line tool paths take precedence over the campaign file.
    let tools = Toolchain::resolve(
        generator_bin.or(config.tools.generator.as_deref()),
        translator_bin.or(config.tools.translator.as_deref()),
        false,
    )?;

    let mut graph = campaign::plan(&config, &tools).context("failed to plan campaign")?;
    let concurrency = concurrency.unwrap_or(config.concurrency);
    info!(
        campaign = %config.campaign,
        actions = graph.len(),
        concurrency,
        "starting campaign"
    );

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling campaign");
            let _ = abort_tx.send(true);
        }
    });

    let result = Executor::new(concurrency)
        .run(&mut graph, abort_rx)
        .await
        .context("campaign execution failed")?;

    let clean = graph.is_clean();

    if json {
        #[derive(serde::Serialize)]
        struct ActionReport<'a> {
            id: &'a str,
            kind: &'a str,
            state: &'a str,
            duration_secs: Option<f64>,
            #[serde(skip_serializing_if = "Option::is_none")]
            error: Option<&'a str>,
        }

        #[derive(serde::Serialize)]
        struct RunOutput<'a> {
            campaign: &'a str,
            clean: bool,
            actions: Vec<ActionReport<'a>>,
            #[serde(skip_serializing_if = "Option::is_none")]
            result: Option<&'a aggregate::CampaignResult>,
        }

        let actions: Vec<ActionReport> = graph
            .actions()
            .map(|a| ActionReport {
                id: a.id.as_str(),
                kind: a.kind.as_str(),
                state: a.state.as_str(),
                duration_secs: duration_secs(a),
                error: failure_message(a),
            })
            .collect();

        print_json(&RunOutput {
            campaign: &config.campaign,
            clean,
            actions,
            result: result.as_ref(),
        })?;
        return Ok(if clean { 0 } else { 1 });
    }

    let rows: Vec<Vec<String>> = graph
        .actions()
        .map(|a| {
            vec![
                a.id.to_string(),
                a.state.as_str().to_string(),
                duration_secs(a)
                    .map(|d| format!("{d:.1}s"))
                    .unwrap_or_else(|| "-".to_string()),
                failure_message(a)
                    .map(|m| truncate(m.lines().next().unwrap_or(m), 60))
                    .unwrap_or_default(),
            ]
        })
        .collect();
    print_table(&["ACTION", "STATE", "TIME", "NOTE"], rows);

    if let Some(result) = &result {
        println!("\n{}", aggregate::summary_line(result));
        println!(
            "Report: {}",
            aggregate::metrics_jsonl_path(&config.output_root()).display()
        );
        for (key, case) in &result.cases {
            if case.status != CaseStatus::Success {
                println!(
                    "  {} {}: {}",
                    case.status.as_str(),
                    key,
                    case.error.as_deref().unwrap_or("no diagnostic")
                );
            }
        }
    }

    Ok(if clean { 0 } else { 1 })
}

fn duration_secs(action: &Action) -> Option<f64> {
    let start = action.started_at?;
    let end = action.finished_at?;
    Some((end - start).num_milliseconds() as f64 / 1000.0)
}

fn failure_message(action: &Action) -> Option<&str> {
    match (&action.state, &action.outcome) {
        (ActionState::Failed, Some(Outcome::Failure { message, .. })) => Some(message.as_str()),
        _ => None,
    }
}
