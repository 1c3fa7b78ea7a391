//! Per-case configuration rendering for the physical flow.
//!
//! Each (design, pdk, clock) case gets a `config.mk` and a `constraint.sdc`
//! rendered from built-in templates by plain placeholder substitution. The
//! flow only reads these files, so no escaping is needed.

pub const DEFAULT_CLOCK_NAME: &str = "core_clock";
pub const DEFAULT_CLOCK_PORT: &str = "clk";
pub const DEFAULT_CLOCK_IO_PCT: f64 = 0.2;

const CONFIG_MK_TEMPLATE: &str = "\
export DESIGN_NICKNAME = {{design_name}}
export DESIGN_NAME     = {{design_name}}
export PLATFORM        = {{platform}}

export VERILOG_FILES = {{verilog_glob}}
export SDC_FILE      = {{sdc_path}}

export CORE_UTILIZATION = {{core_utilization}}
export PLACE_DENSITY    = {{place_density}}
";

const SDC_TEMPLATE: &str = "\
set clk_name      {{clock_name}}
set clk_port_name {{clock_port}}
set clk_period    {{clock_period}}
set clk_io_pct    {{clock_io_pct}}

set clk_port [get_ports $clk_port_name]
create_clock -name $clk_name -period $clk_period $clk_port

set non_clock_inputs [lsearch -inline -all -not -exact [all_inputs] $clk_port]
set_input_delay  [expr $clk_period * $clk_io_pct] -clock $clk_name $non_clock_inputs
set_output_delay [expr $clk_period * $clk_io_pct] -clock $clk_name [all_outputs]
";

// ---------------------------------------------------------------------------
// Density normalisation
// ---------------------------------------------------------------------------

/// Accepts either a fraction (0.5) or a percentage (50) and returns
/// `(core_utilization_percent, place_density_fraction)`.
pub fn normalize_density(density: f64) -> (f64, f64) {
    if density > 1.0 {
        (density, density / 100.0)
    } else {
        (density * 100.0, density)
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub struct FlowCaseConfig<'a> {
    pub design_name: &'a str,
    pub platform: &'a str,
    pub verilog_glob: &'a str,
    pub sdc_path: &'a str,
    pub density: f64,
}

pub fn render_config_mk(cfg: &FlowCaseConfig<'_>) -> String {
    let (util, place) = normalize_density(cfg.density);
    render(
        CONFIG_MK_TEMPLATE,
        &[
            ("design_name", cfg.design_name.to_string()),
            ("platform", cfg.platform.to_string()),
            ("verilog_glob", cfg.verilog_glob.to_string()),
            ("sdc_path", cfg.sdc_path.to_string()),
            ("core_utilization", format!("{}", util.round() as i64)),
            ("place_density", format!("{:.3}", place)),
        ],
    )
}

pub fn render_sdc(clock_period_ns: f64) -> String {
    render(
        SDC_TEMPLATE,
        &[
            ("clock_name", DEFAULT_CLOCK_NAME.to_string()),
            ("clock_port", DEFAULT_CLOCK_PORT.to_string()),
            ("clock_period", format!("{clock_period_ns}")),
            ("clock_io_pct", format!("{DEFAULT_CLOCK_IO_PCT}")),
        ],
    )
}

fn render(template: &str, vars: &[(&str, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn density_fraction_and_percent_agree() {
        assert_eq!(normalize_density(0.5), (50.0, 0.5));
        assert_eq!(normalize_density(50.0), (50.0, 0.5));
    }

    #[test]
    fn config_mk_renders_all_placeholders() {
        let text = render_config_mk(&FlowCaseConfig {
            design_name: "fdiv",
            platform: "sky130hd",
            verilog_glob: "./designs/src/divisions/fdiv/*.v",
            sdc_path: "./designs/sky130hd/divisions/fdiv/constraint.sdc",
            density: 0.5,
        });
        assert!(text.contains("export DESIGN_NAME     = fdiv"));
        assert!(text.contains("export PLATFORM        = sky130hd"));
        assert!(text.contains("export CORE_UTILIZATION = 50"));
        assert!(text.contains("export PLACE_DENSITY    = 0.500"));
        assert!(!text.contains("{{"), "unreplaced placeholder in: {text}");
    }

    #[test]
    fn sdc_renders_clock_period() {
        let text = render_sdc(2.5);
        assert!(text.contains("set clk_period    2.5"));
        assert!(text.contains("create_clock -name $clk_name"));
        assert!(text.contains("set clk_port_name clk"));
        assert!(!text.contains("{{"));
    }
}
