use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use gdsflow_core::action::{Action, Payload};
use gdsflow_core::campaign::{self, CampaignConfig};
use gdsflow_core::toolchain::Toolchain;
use std::path::Path;

/// Validate the campaign and print the expanded action graph. Nothing is
/// staged or executed; tools that cannot be resolved are shown as-is.
pub fn run(campaign_file: &Path, json: bool) -> anyhow::Result<i32> {
    let config = CampaignConfig::load(campaign_file)
        .with_context(|| format!("failed to load campaign '{}'", campaign_file.display()))?;
    let tools = Toolchain::resolve(
        config.tools.generator.as_deref(),
        config.tools.translator.as_deref(),
        true,
    )?;
    let graph = campaign::plan(&config, &tools).context("failed to plan campaign")?;

    if json {
        #[derive(serde::Serialize)]
        struct PlannedAction<'a> {
            id: &'a str,
            kind: &'a str,
            command: String,
            deps: Vec<&'a str>,
        }

        #[derive(serde::Serialize)]
        struct PlanOutput<'a> {
            campaign: &'a str,
            concurrency: usize,
            generator: String,
            translator: String,
            actions: Vec<PlannedAction<'a>>,
        }

        let actions: Vec<PlannedAction> = graph
            .actions()
            .map(|a| PlannedAction {
                id: a.id.as_str(),
                kind: a.kind.as_str(),
                command: command_preview(a),
                deps: graph.deps_of(&a.id).iter().map(|d| d.as_str()).collect(),
            })
            .collect();

        return print_json(&PlanOutput {
            campaign: &config.campaign,
            concurrency: config.concurrency,
            generator: tools.generator.path.display().to_string(),
            translator: tools.translator.path.display().to_string(),
            actions,
        })
        .map(|_| 0);
    }

    println!("Campaign: {}", config.campaign);
    println!("Concurrency: {}", config.concurrency);
    println!(
        "Generator: {} ({})",
        tools.generator.path.display(),
        tools.generator.version_tag
    );
    println!(
        "Translator: {} ({})",
        tools.translator.path.display(),
        tools.translator.version_tag
    );
    println!();

    let rows: Vec<Vec<String>> = graph
        .actions()
        .map(|a| {
            let deps: Vec<&str> = graph.deps_of(&a.id).iter().map(|d| d.as_str()).collect();
            vec![
                a.id.to_string(),
                a.kind.as_str().to_string(),
                truncate(&command_preview(a), 70),
                truncate(&deps.join(","), 50),
            ]
        })
        .collect();
    print_table(&["ACTION", "KIND", "COMMAND", "AFTER"], rows);
    println!("\n{} actions planned", graph.len());

    Ok(0)
}

fn command_preview(action: &Action) -> String {
    match &action.payload {
        Payload::Process(spec) => {
            let mut parts = vec![spec.program.display().to_string()];
            parts.extend(spec.args.iter().cloned());
            parts.join(" ")
        }
        Payload::Aggregate(spec) => format!("(aggregate {} cases)", spec.cases.len()),
    }
}
