//! Campaign configuration and graph planning.
//!
//! A campaign file declares a design list and the sweep axes (PDKs, clock
//! periods); the planner expands that matrix into a task graph with a fixed
//! pipeline shape per design:
//!
//! ```text
//! synth_<design> → translate_<design> → flow_<design>_<pdk>_<tag> ─┐
//!                                       (one per pdk × clock)      ├→ report → plot
//!                                                                 ─┘
//! ```
//!
//! The report action depends on every flow action and runs even when
//! branches fail; the optional plot action hands the metrics file to an
//! external command.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use crate::action::{
    Action, ActionId, ActionKind, AggregateSpec, Payload, ProcessSpec, StageFile,
};
use crate::aggregate::{self, CaseBinding};
use crate::error::{FlowError, Result};
use crate::graph::{GraphBuilder, TaskGraph};
use crate::paths;
use crate::template::{render_config_mk, render_sdc, FlowCaseConfig};
use crate::toolchain::Toolchain;

// ---------------------------------------------------------------------------
// Configuration types
// ---------------------------------------------------------------------------

/// One parameter of a generator operator. Booleans render as bare flags
/// (`plainVHDL` rather than `plainVHDL=true`); everything else as `key=value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{b}"),
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(x) => write!(f, "{x}"),
            ParamValue::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesignSpec {
    pub name: String,
    /// Generator operator name (e.g. `FPDiv`).
    pub operator: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
    /// Extra generator arguments appended verbatim.
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPaths {
    #[serde(default)]
    pub generator: Option<PathBuf>,
    #[serde(default)]
    pub translator: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotConfig {
    /// Command invoked with the metrics JSONL path appended as last argument.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    /// Campaign namespace under the flow's `designs/` tree.
    pub campaign: String,
    pub flow_root: PathBuf,
    /// Where reports and action logs land; default `outputs/<campaign>`.
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    #[serde(default = "default_pdks")]
    pub pdks: Vec<String>,
    #[serde(default = "default_clocks")]
    pub clocks_ns: Vec<f64>,
    #[serde(default = "default_density")]
    pub density: f64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Per-flow-action timeout; generation and translation are quick enough
    /// to run unbounded.
    #[serde(default)]
    pub flow_timeout_secs: Option<u64>,
    pub designs: Vec<DesignSpec>,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default)]
    pub plot: Option<PlotConfig>,
}

fn default_pdks() -> Vec<String> {
    vec!["sky130hd".to_string(), "asap7".to_string()]
}

fn default_clocks() -> Vec<f64> {
    vec![5.0, 2.5, 1.0]
}

fn default_density() -> f64 {
    0.5
}

fn default_concurrency() -> usize {
    crate::scheduler::DEFAULT_CONCURRENCY
}

impl CampaignConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let cfg: CampaignConfig = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn output_root(&self) -> PathBuf {
        self.output_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("outputs").join(&self.campaign))
    }

    pub fn validate(&self) -> Result<()> {
        validate_name("campaign", &self.campaign)?;
        if self.designs.is_empty() {
            return Err(FlowError::InvalidCampaign(
                "no designs declared".to_string(),
            ));
        }
        if self.pdks.is_empty() {
            return Err(FlowError::InvalidCampaign("no pdks declared".to_string()));
        }
        if self.clocks_ns.is_empty() {
            return Err(FlowError::InvalidCampaign(
                "no clock periods declared".to_string(),
            ));
        }
        if self.clocks_ns.iter().any(|c| *c <= 0.0) {
            return Err(FlowError::InvalidCampaign(
                "clock periods must be positive".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for design in &self.designs {
            validate_name("design", &design.name)?;
            if !seen.insert(design.name.as_str()) {
                return Err(FlowError::InvalidCampaign(format!(
                    "duplicate design name '{}'",
                    design.name
                )));
            }
            if design.operator.is_empty() {
                return Err(FlowError::InvalidCampaign(format!(
                    "design '{}' has no operator",
                    design.name
                )));
            }
        }
        for pdk in &self.pdks {
            validate_name("pdk", pdk)?;
        }
        if let Some(plot) = &self.plot {
            if plot.command.is_empty() {
                return Err(FlowError::InvalidCampaign(
                    "plot.command is empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// Names end up in paths, env values and action ids; keep them shell-safe.
static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap())
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(FlowError::InvalidCampaign(format!(
            "invalid {what} name '{name}': use alphanumerics, '_', '.', '-'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Generator command synthesis
// ---------------------------------------------------------------------------

/// Arguments for one generator invocation:
/// `<operator> k=v ... <extra args> name=<design> outputFile=<vhdl>`.
/// An explicit `name=`/`outputFile=` among the extra args wins.
pub fn generator_args(design: &DesignSpec, vhdl_out: &Path) -> Vec<String> {
    let mut args = vec![design.operator.clone()];
    for (key, value) in &design.params {
        match value {
            ParamValue::Bool(true) => args.push(key.clone()),
            ParamValue::Bool(false) => {}
            other => args.push(format!("{key}={other}")),
        }
    }
    args.extend(design.args.iter().cloned());
    if !args.iter().any(|a| a.starts_with("name=")) {
        args.push(format!("name={}", design.name));
    }
    if !args.iter().any(|a| a.starts_with("outputFile=")) {
        args.push(format!("outputFile={}", vhdl_out.display()));
    }
    args
}

// ---------------------------------------------------------------------------
// Planner
// ---------------------------------------------------------------------------

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

/// Expand the campaign matrix into a validated task graph.
///
/// Relative `flow_root`/`output_root` are resolved against the current
/// directory first: the planned actions run with differing cwds, and path
/// arguments handed to the tools must mean the same file everywhere.
pub fn plan(config: &CampaignConfig, tools: &Toolchain) -> Result<TaskGraph> {
    config.validate()?;
    let flow_root = absolutize(&config.flow_root)?;
    let output_root = absolutize(&config.output_root())?;
    let log_dir = output_root.join("logs");
    let flow_timeout = config.flow_timeout_secs.map(Duration::from_secs);

    let mut builder = GraphBuilder::new();
    let mut cases: Vec<CaseBinding> = Vec::new();
    let mut flow_ids: Vec<ActionId> = Vec::new();

    for design in &config.designs {
        let src_dir = paths::design_src_dir(&flow_root, &config.campaign, &design.name);
        let vhdl_out = src_dir.join(format!("{}.vhdl", design.name));
        let verilog_out = src_dir.join(format!("{}.v", design.name));

        let synth_id = ActionId::new(format!("synth_{}", design.name));
        builder.add(
            Action::new(
                synth_id.clone(),
                ActionKind::Synthesize,
                Payload::Process(ProcessSpec {
                    program: tools.generator.path.clone(),
                    args: generator_args(design, &vhdl_out),
                    cwd: src_dir.clone(),
                    env: vec![],
                    stage_files: vec![],
                    expected_artifacts: vec![vhdl_out.clone()],
                    log_dir: log_dir.clone(),
                    timeout: None,
                }),
            ),
            vec![],
        );

        let translate_id = ActionId::new(format!("translate_{}", design.name));
        builder.add(
            Action::new(
                translate_id.clone(),
                ActionKind::Translate,
                Payload::Process(ProcessSpec {
                    program: tools.translator.path.clone(),
                    args: vec![
                        "--input_file".to_string(),
                        vhdl_out.display().to_string(),
                        "--output_dir".to_string(),
                        src_dir.display().to_string(),
                    ],
                    cwd: src_dir.clone(),
                    env: vec![],
                    stage_files: vec![],
                    expected_artifacts: vec![verilog_out],
                    log_dir: log_dir.clone(),
                    timeout: None,
                }),
            ),
            vec![synth_id],
        );

        for pdk in &config.pdks {
            let config_dir =
                paths::case_config_dir(&flow_root, pdk, &config.campaign, &design.name);
            let verilog_glob =
                format!("./designs/src/{}/{}/*.v", config.campaign, design.name);
            let sdc_rel = format!(
                "./designs/{pdk}/{}/{}/constraint.sdc",
                config.campaign, design.name
            );
            let config_mk = render_config_mk(&FlowCaseConfig {
                design_name: &design.name,
                platform: pdk,
                verilog_glob: &verilog_glob,
                sdc_path: &sdc_rel,
                density: config.density,
            });

            for clock_ns in &config.clocks_ns {
                let tag = paths::run_tag(*clock_ns);
                let flow_id =
                    ActionId::new(format!("flow_{}_{pdk}_{tag}", design.name));
                let case_log_dir = paths::case_log_dir(
                    &flow_root,
                    pdk,
                    &config.campaign,
                    &design.name,
                    &tag,
                );

                builder.add(
                    Action::new(
                        flow_id.clone(),
                        ActionKind::RunFlow,
                        Payload::Process(ProcessSpec {
                            program: tools.make.path.clone(),
                            args: vec![
                                "-C".to_string(),
                                flow_root.display().to_string(),
                                format!(
                                    "DESIGN_CONFIG={}",
                                    paths::design_config_rel(
                                        pdk,
                                        &config.campaign,
                                        &design.name
                                    )
                                ),
                            ],
                            cwd: flow_root.clone(),
                            env: vec![("RUN_TAG".to_string(), tag.clone())],
                            stage_files: vec![
                                StageFile {
                                    path: config_dir.join("config.mk"),
                                    contents: config_mk.clone(),
                                },
                                StageFile {
                                    path: config_dir.join("constraint.sdc"),
                                    contents: render_sdc(*clock_ns),
                                },
                            ],
                            expected_artifacts: vec![crate::metrics::final_report_path(
                                &case_log_dir,
                            )],
                            log_dir: log_dir.clone(),
                            timeout: flow_timeout,
                        }),
                    ),
                    vec![translate_id.clone()],
                );

                cases.push(CaseBinding {
                    design: design.name.clone(),
                    pdk: pdk.clone(),
                    clock_ns: *clock_ns,
                    run_tag: tag,
                    flow_action: flow_id.clone(),
                    case_log_dir,
                });
                flow_ids.push(flow_id);
            }
        }
    }

    let report_id = ActionId::new("report");
    builder.add(
        Action::new(
            report_id.clone(),
            ActionKind::Aggregate,
            Payload::Aggregate(AggregateSpec {
                campaign: config.campaign.clone(),
                flow_root: flow_root.clone(),
                output_dir: output_root.clone(),
                cases,
            }),
        ),
        flow_ids,
    );

    if let Some(plot) = &config.plot {
        let metrics_path = aggregate::metrics_jsonl_path(&output_root);
        let mut args: Vec<String> = plot.command[1..].to_vec();
        args.push(metrics_path.display().to_string());
        builder.add(
            Action::new(
                ActionId::new("plot"),
                ActionKind::Plot,
                Payload::Process(ProcessSpec {
                    program: PathBuf::from(&plot.command[0]),
                    args,
                    cwd: output_root,
                    env: vec![],
                    stage_files: vec![],
                    expected_artifacts: vec![],
                    log_dir,
                    timeout: None,
                }),
            ),
            vec![report_id],
        );
    }

    builder.build()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionState;
    use crate::toolchain::Tool;

    fn test_tools() -> Toolchain {
        let tool = |name: &str| Tool {
            path: PathBuf::from(format!("/opt/{name}")),
            version_tag: "config".to_string(),
        };
        Toolchain {
            generator: tool("flopoco"),
            translator: tool("vh2v"),
            make: tool("make"),
        }
    }

    fn minimal_yaml() -> &'static str {
        r#"
campaign: divisions
flow_root: /flow
designs:
  - name: fdiv
    operator: FPDiv
    params:
      wE: 8
      wF: 23
"#
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.pdks, vec!["sky130hd", "asap7"]);
        assert_eq!(cfg.clocks_ns, vec![5.0, 2.5, 1.0]);
        assert_eq!(cfg.density, 0.5);
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.output_root(), PathBuf::from("outputs/divisions"));
    }

    #[test]
    fn generator_args_render_params_and_defaults() {
        let design = DesignSpec {
            name: "fdiv".to_string(),
            operator: "FPDiv".to_string(),
            params: BTreeMap::from([
                ("wE".to_string(), ParamValue::Int(8)),
                ("wF".to_string(), ParamValue::Int(23)),
                ("plainVHDL".to_string(), ParamValue::Bool(true)),
                ("pipeline".to_string(), ParamValue::Bool(false)),
            ]),
            args: vec!["frequency=300".to_string()],
        };
        let args = generator_args(&design, Path::new("/src/fdiv.vhdl"));
        assert_eq!(args[0], "FPDiv");
        assert!(args.contains(&"wE=8".to_string()));
        assert!(args.contains(&"wF=23".to_string()));
        assert!(args.contains(&"plainVHDL".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("pipeline")));
        assert!(args.contains(&"frequency=300".to_string()));
        assert!(args.contains(&"name=fdiv".to_string()));
        assert!(args.contains(&"outputFile=/src/fdiv.vhdl".to_string()));
    }

    #[test]
    fn explicit_name_arg_wins() {
        let design = DesignSpec {
            name: "fdiv".to_string(),
            operator: "FPDiv".to_string(),
            params: BTreeMap::new(),
            args: vec!["name=custom".to_string()],
        };
        let args = generator_args(&design, Path::new("/src/fdiv.vhdl"));
        assert!(args.contains(&"name=custom".to_string()));
        assert!(!args.contains(&"name=fdiv".to_string()));
    }

    #[test]
    fn plan_expands_matrix_into_pipeline_shape() {
        let mut cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.pdks = vec!["sky130hd".to_string(), "asap7".to_string()];
        cfg.clocks_ns = vec![5.0, 2.5];
        let graph = plan(&cfg, &test_tools()).unwrap();

        // 1 design: synth + translate + 4 flows + report = 7
        assert_eq!(graph.len(), 7);
        assert_eq!(
            graph.deps_of(&"translate_fdiv".into()),
            &[ActionId::from("synth_fdiv")]
        );
        assert_eq!(
            graph.deps_of(&"flow_fdiv_sky130hd_c2p50".into()),
            &[ActionId::from("translate_fdiv")]
        );
        assert_eq!(graph.deps_of(&"report".into()).len(), 4);
        assert!(graph
            .actions()
            .all(|a| a.state == ActionState::Pending));
    }

    #[test]
    fn flow_action_stages_config_and_sdc() {
        let cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        let graph = plan(&cfg, &test_tools()).unwrap();
        let flow = graph.get(&"flow_fdiv_sky130hd_c5p00".into()).unwrap();
        let Payload::Process(spec) = &flow.payload else {
            panic!("flow action must be a process");
        };
        assert_eq!(spec.stage_files.len(), 2);
        assert!(spec.stage_files[0].contents.contains("PLATFORM        = sky130hd"));
        assert!(spec.stage_files[1].contents.contains("set clk_period    5"));
        assert_eq!(spec.env, vec![("RUN_TAG".to_string(), "c5p00".to_string())]);
        assert!(spec.args.iter().any(|a| a
            == "DESIGN_CONFIG=./designs/sky130hd/divisions/fdiv/config.mk"));
        assert_eq!(
            spec.expected_artifacts,
            vec![PathBuf::from(
                "/flow/logs/sky130hd/divisions/fdiv/c5p00/6_report.json"
            )]
        );
    }

    #[test]
    fn relative_roots_resolve_against_current_dir() {
        // A tool resolves a relative outputFile against its own cwd, not
        // ours, so every path handed out by the planner must be absolute.
        let mut cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.flow_root = PathBuf::from("flow");
        cfg.output_root = Some(PathBuf::from("out"));
        let graph = plan(&cfg, &test_tools()).unwrap();
        let cwd = std::env::current_dir().unwrap();

        let synth = graph.get(&"synth_fdiv".into()).unwrap();
        let Payload::Process(spec) = &synth.payload else {
            panic!("synth action must be a process");
        };
        assert_eq!(spec.cwd, cwd.join("flow/designs/src/divisions/fdiv"));
        assert_eq!(
            spec.expected_artifacts,
            vec![cwd.join("flow/designs/src/divisions/fdiv/fdiv.vhdl")]
        );
        let out_arg = spec
            .args
            .iter()
            .find(|a| a.starts_with("outputFile="))
            .unwrap();
        assert!(Path::new(&out_arg["outputFile=".len()..]).is_absolute());

        let flow = graph.get(&"flow_fdiv_sky130hd_c5p00".into()).unwrap();
        let Payload::Process(spec) = &flow.payload else {
            panic!("flow action must be a process");
        };
        assert_eq!(spec.cwd, cwd.join("flow"));
        assert!(spec.log_dir.is_absolute());

        let report = graph.get(&"report".into()).unwrap();
        let Payload::Aggregate(agg) = &report.payload else {
            panic!("report action must be an aggregate");
        };
        assert_eq!(agg.output_dir, cwd.join("out"));
        assert!(agg.cases[0].case_log_dir.is_absolute());
    }

    #[test]
    fn plot_action_appended_when_configured() {
        let mut cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.plot = Some(PlotConfig {
            command: vec!["python3".to_string(), "plot.py".to_string()],
        });
        let graph = plan(&cfg, &test_tools()).unwrap();
        let plot = graph.get(&"plot".into()).unwrap();
        assert_eq!(graph.deps_of(&"plot".into()), &[ActionId::from("report")]);
        let Payload::Process(spec) = &plot.payload else {
            panic!("plot action must be a process");
        };
        assert_eq!(spec.program, PathBuf::from("python3"));
        assert_eq!(spec.args[0], "plot.py");
        assert!(spec.args[1].ends_with("metrics.jsonl"));
    }

    #[test]
    fn duplicate_design_names_rejected() {
        let mut cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.designs.push(cfg.designs[0].clone());
        assert!(matches!(
            cfg.validate(),
            Err(FlowError::InvalidCampaign(_))
        ));
    }

    #[test]
    fn empty_designs_rejected() {
        let mut cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.designs.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hostile_names_rejected() {
        let mut cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.designs[0].name = "../escape".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn nonpositive_clock_rejected() {
        let mut cfg: CampaignConfig = serde_yaml::from_str(minimal_yaml()).unwrap();
        cfg.clocks_ns = vec![0.0];
        assert!(cfg.validate().is_err());
    }
}
