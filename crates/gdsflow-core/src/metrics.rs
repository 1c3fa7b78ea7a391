//! Metrics extraction from one flow case's stage reports.
//!
//! The physical flow drops flat JSON report files per stage under the case
//! log directory. Different flow and PDK versions emit the same quantity
//! under different key names, so each metric has a fallback chain tried in
//! priority order. When a report key is absent entirely, the final and route
//! logs are scraped with regexes as a last resort.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Stage report files consulted, in merge priority order: the final report
/// wins, earlier stages only fill keys the final report lacks.
const STAGE_REPORTS: [&str; 4] = [
    "6_report.json",
    "5_2_route.json",
    "4_1_cts.json",
    "3_4_place_resized.json",
];

const KEY_MAP: [(&str, &[&str]); 6] = [
    (
        "gds_area",
        &[
            "finish__design__die__area",
            "cts__design__die__area",
            "design__die__area",
        ],
    ),
    (
        "synth_area",
        &["finish__design__instance__area", "design__instance__area"],
    ),
    (
        "wirelength",
        &[
            "detailedroute__route__wirelength",
            "route__wirelength",
            "globalroute__route__wirelength__estimated",
        ],
    ),
    ("wns", &["finish__timing__setup__wns", "timing__setup__wns"]),
    ("tns", &["finish__timing__setup__tns", "timing__setup__tns"]),
    (
        "synth_cell_count",
        &[
            "synth__design__instance__count__stdcell",
            "design__instance__count__stdcell",
        ],
    ),
];

const BUFFER_KEYS: [&str; 3] = [
    "finish__design__instance__count__class:timing_repair_buffer",
    "cts__design__instance__count__setup_buffer",
    "cts__design__instance__count__hold_buffer",
];

/// Extract the metrics for one case from its log directory. Missing
/// quantities are simply absent from the returned map.
pub fn extract_case_metrics(case_log_dir: &Path) -> BTreeMap<String, f64> {
    let mut data: BTreeMap<String, f64> = BTreeMap::new();
    for report in STAGE_REPORTS {
        for (key, value) in load_flat_json(&case_log_dir.join(report)) {
            data.entry(key).or_insert(value);
        }
    }

    let mut metrics = BTreeMap::new();
    for (metric, keys) in KEY_MAP {
        if let Some(v) = keys.iter().find_map(|k| data.get(*k)) {
            metrics.insert(metric.to_string(), *v);
        }
    }

    let buf_total: f64 = BUFFER_KEYS.iter().filter_map(|k| data.get(*k)).sum();
    if buf_total > 0.0 {
        metrics.insert("buffer_count".to_string(), buf_total);
    }

    if !metrics.contains_key("gds_area") || !metrics.contains_key("wirelength") {
        scrape_log(&case_log_dir.join("6_report.log"), &mut metrics);
        scrape_log(&case_log_dir.join("5_2_route.log"), &mut metrics);
    }
    metrics
}

/// Artifact the flow action is expected to leave behind; its presence is how
/// the process runner distinguishes a flow that ran to completion from one
/// that died after exit-code laundering inside make.
pub fn final_report_path(case_log_dir: &Path) -> PathBuf {
    case_log_dir.join("6_report.json")
}

fn load_flat_json(path: &Path) -> BTreeMap<String, f64> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| to_f64(&v).map(|f| (k, f)))
        .collect()
}

fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn scrape_log(path: &Path, metrics: &mut BTreeMap<String, f64>) {
    let Ok(text) = std::fs::read_to_string(path) else {
        return;
    };
    let scrapes: [(&str, &Regex); 3] = [
        ("wirelength", wirelength_re()),
        ("gds_area", area_re()),
        ("buffer_count", buffer_re()),
    ];
    for (metric, re) in scrapes {
        if metrics.contains_key(metric) {
            continue;
        }
        if let Some(v) = re
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            metrics.insert(metric.to_string(), v);
        }
    }
}

static WIRELENGTH_RE: OnceLock<Regex> = OnceLock::new();
static AREA_RE: OnceLock<Regex> = OnceLock::new();
static BUFFER_RE: OnceLock<Regex> = OnceLock::new();

fn wirelength_re() -> &'static Regex {
    WIRELENGTH_RE.get_or_init(|| Regex::new(r"Total wire length\s*=\s*([0-9.]+)").unwrap())
}

fn area_re() -> &'static Regex {
    AREA_RE.get_or_init(|| Regex::new(r"Design area\s*([0-9.]+)").unwrap())
}

fn buffer_re() -> &'static Regex {
    BUFFER_RE.get_or_init(|| Regex::new(r"Timing Repair Buffer\s+([0-9]+)").unwrap())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }

    #[test]
    fn reads_final_report_keys() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "6_report.json",
            r#"{"finish__design__die__area": 1234.5,
                "finish__timing__setup__wns": -0.12,
                "finish__timing__setup__tns": -1.5,
                "detailedroute__route__wirelength": 9000}"#,
        );
        let m = extract_case_metrics(dir.path());
        assert_eq!(m["gds_area"], 1234.5);
        assert_eq!(m["wns"], -0.12);
        assert_eq!(m["tns"], -1.5);
        assert_eq!(m["wirelength"], 9000.0);
    }

    #[test]
    fn final_report_wins_over_earlier_stages() {
        let dir = TempDir::new().unwrap();
        write(&dir, "6_report.json", r#"{"finish__design__die__area": 100}"#);
        write(&dir, "4_1_cts.json", r#"{"finish__design__die__area": 999}"#);
        let m = extract_case_metrics(dir.path());
        assert_eq!(m["gds_area"], 100.0);
    }

    #[test]
    fn fallback_keys_fill_missing_metrics() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "4_1_cts.json",
            r#"{"cts__design__die__area": 55.5,
                "globalroute__route__wirelength__estimated": 777}"#,
        );
        let m = extract_case_metrics(dir.path());
        assert_eq!(m["gds_area"], 55.5);
        assert_eq!(m["wirelength"], 777.0);
    }

    #[test]
    fn buffer_counts_are_summed() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "6_report.json",
            r#"{"cts__design__instance__count__setup_buffer": 3,
                "cts__design__instance__count__hold_buffer": 4}"#,
        );
        let m = extract_case_metrics(dir.path());
        assert_eq!(m["buffer_count"], 7.0);
    }

    #[test]
    fn log_scrape_fills_gaps() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "6_report.log",
            "some noise\nDesign area 321.5 u^2\nTotal wire length = 4567.8 um\n",
        );
        let m = extract_case_metrics(dir.path());
        assert_eq!(m["gds_area"], 321.5);
        assert_eq!(m["wirelength"], 4567.8);
    }

    #[test]
    fn report_keys_suppress_log_scrape() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "6_report.json",
            r#"{"finish__design__die__area": 1, "detailedroute__route__wirelength": 2}"#,
        );
        write(&dir, "6_report.log", "Design area 999\nTotal wire length = 999\n");
        let m = extract_case_metrics(dir.path());
        assert_eq!(m["gds_area"], 1.0);
        assert_eq!(m["wirelength"], 2.0);
    }

    #[test]
    fn empty_dir_yields_no_metrics() {
        let dir = TempDir::new().unwrap();
        assert!(extract_case_metrics(dir.path()).is_empty());
    }

    #[test]
    fn numeric_strings_parse() {
        let dir = TempDir::new().unwrap();
        write(&dir, "6_report.json", r#"{"finish__design__die__area": "42.5"}"#);
        let m = extract_case_metrics(dir.path());
        assert_eq!(m["gds_area"], 42.5);
    }
}
