//! Path layout of the external flow tree and of campaign outputs.
//!
//! The flow tree follows the OpenROAD-flow-scripts convention:
//! sources under `designs/src/<campaign>/<design>/`, per-case configs under
//! `designs/<pdk>/<campaign>/<design>/`, stage reports and logs under
//! `logs/<pdk>/<campaign>/<design>/<run_tag>/`.

use std::path::{Path, PathBuf};

use crate::action::ActionId;

// ---------------------------------------------------------------------------
// Flow tree
// ---------------------------------------------------------------------------

/// `<flow_root>/designs/src/<campaign>/<design>` — generated HDL sources.
pub fn design_src_dir(flow_root: &Path, campaign: &str, design: &str) -> PathBuf {
    flow_root
        .join("designs")
        .join("src")
        .join(campaign)
        .join(design)
}

/// `<flow_root>/designs/<pdk>/<campaign>/<design>` — per-case config files.
pub fn case_config_dir(flow_root: &Path, pdk: &str, campaign: &str, design: &str) -> PathBuf {
    flow_root
        .join("designs")
        .join(pdk)
        .join(campaign)
        .join(design)
}

/// `DESIGN_CONFIG` value passed to make, relative to the flow root.
pub fn design_config_rel(pdk: &str, campaign: &str, design: &str) -> String {
    format!("./designs/{pdk}/{campaign}/{design}/config.mk")
}

/// `<flow_root>/logs/<pdk>/<campaign>/<design>/<run_tag>` — stage reports.
pub fn case_log_dir(
    flow_root: &Path,
    pdk: &str,
    campaign: &str,
    design: &str,
    run_tag: &str,
) -> PathBuf {
    flow_root
        .join("logs")
        .join(pdk)
        .join(campaign)
        .join(design)
        .join(run_tag)
}

// ---------------------------------------------------------------------------
// Run tags and action log files
// ---------------------------------------------------------------------------

/// Run tag for a clock period: `2.5` → `c2p50`. Used both as the flow's
/// `RUN_TAG` and in action ids, so it must stay filesystem-safe.
pub fn run_tag(clock_ns: f64) -> String {
    format!("c{clock_ns:.2}").replace('.', "p")
}

/// Captured stdout of one action: `<log_dir>/<action_id>.stdout.log`.
pub fn action_stdout_log(log_dir: &Path, id: &ActionId) -> PathBuf {
    log_dir.join(format!("{id}.stdout.log"))
}

/// Captured stderr of one action: `<log_dir>/<action_id>.stderr.log`.
pub fn action_stderr_log(log_dir: &Path, id: &ActionId) -> PathBuf {
    log_dir.join(format!("{id}.stderr.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_tag_format() {
        assert_eq!(run_tag(5.0), "c5p00");
        assert_eq!(run_tag(2.5), "c2p50");
        assert_eq!(run_tag(1.25), "c1p25");
    }

    #[test]
    fn flow_tree_paths() {
        let root = Path::new("/flow");
        assert_eq!(
            design_src_dir(root, "divisions", "fdiv"),
            PathBuf::from("/flow/designs/src/divisions/fdiv")
        );
        assert_eq!(
            case_config_dir(root, "sky130hd", "divisions", "fdiv"),
            PathBuf::from("/flow/designs/sky130hd/divisions/fdiv")
        );
        assert_eq!(
            design_config_rel("asap7", "divisions", "fdiv"),
            "./designs/asap7/divisions/fdiv/config.mk"
        );
        assert_eq!(
            case_log_dir(root, "sky130hd", "divisions", "fdiv", "c2p50"),
            PathBuf::from("/flow/logs/sky130hd/divisions/fdiv/c2p50")
        );
    }

    #[test]
    fn action_log_names_derive_from_id() {
        let id = ActionId::from("flow_fdiv_sky130hd_c2p50");
        assert_eq!(
            action_stdout_log(Path::new("/logs"), &id),
            PathBuf::from("/logs/flow_fdiv_sky130hd_c2p50.stdout.log")
        );
    }
}
