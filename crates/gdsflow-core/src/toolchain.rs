//! Resolution of the external binaries the campaign drives.
//!
//! Lookup order for each tool: explicit path from the campaign file, then
//! the tool's environment variables, then a PATH search. `~` is expanded in
//! explicit and environment paths. In dry-run planning a missing tool
//! resolves to its bare name so the planned commands can still be printed.

use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};

pub const GENERATOR_ENV_VARS: [&str; 2] = ["GDSFLOW_GENERATOR_BIN", "FLOPOCO_BIN"];
pub const TRANSLATOR_ENV_VARS: [&str; 2] = ["GDSFLOW_TRANSLATOR_BIN", "VH2V_BIN"];

/// A resolved tool: where it lives and where the path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub path: PathBuf,
    /// Provenance tag: `config`, `env:<VAR>`, `path`, or `unresolved`.
    pub version_tag: String,
}

/// The full set of binaries one campaign needs.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Operator generator (FloPoCo or compatible).
    pub generator: Tool,
    /// VHDL → Verilog translator.
    pub translator: Tool,
    /// Flow driver (`make` against the flow root).
    pub make: Tool,
}

impl Toolchain {
    pub fn resolve(
        generator_bin: Option<&Path>,
        translator_bin: Option<&Path>,
        allow_missing: bool,
    ) -> Result<Self> {
        Ok(Self {
            generator: resolve_tool(
                "generator",
                generator_bin,
                &GENERATOR_ENV_VARS,
                "flopoco",
                allow_missing,
            )?,
            translator: resolve_tool(
                "translator",
                translator_bin,
                &TRANSLATOR_ENV_VARS,
                "vh2v",
                allow_missing,
            )?,
            make: resolve_tool("make", None, &[], "make", allow_missing)?,
        })
    }
}

pub fn resolve_tool(
    tool: &str,
    explicit: Option<&Path>,
    env_vars: &[&str],
    fallback: &str,
    allow_missing: bool,
) -> Result<Tool> {
    if let Some(p) = explicit {
        let expanded = expand_home(p);
        if expanded.exists() {
            return Ok(Tool {
                path: expanded,
                version_tag: "config".to_string(),
            });
        }
        if !allow_missing {
            return Err(FlowError::ToolNotFound {
                tool: tool.to_string(),
                hint: format!("configured path '{}' does not exist", p.display()),
            });
        }
    }

    for var in env_vars {
        if let Ok(value) = std::env::var(var) {
            if value.is_empty() {
                continue;
            }
            let expanded = expand_home(Path::new(&value));
            if expanded.exists() {
                return Ok(Tool {
                    path: expanded,
                    version_tag: format!("env:{var}"),
                });
            }
        }
    }

    if let Ok(found) = which::which(fallback) {
        return Ok(Tool {
            path: found,
            version_tag: "path".to_string(),
        });
    }

    if allow_missing {
        return Ok(Tool {
            path: PathBuf::from(fallback),
            version_tag: "unresolved".to_string(),
        });
    }

    Err(FlowError::ToolNotFound {
        tool: tool.to_string(),
        hint: format!(
            "set {} or put '{fallback}' on PATH",
            if env_vars.is_empty() {
                "an explicit path".to_string()
            } else {
                env_vars.join(" or ")
            }
        ),
    })
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
