//! CSV and JSON export of session artifacts.

use std::path::Path;

use anyhow::{Context, Result};

use sieve_core::funnel::FunnelReport;
use sieve_core::refiner::RefinerReport;

use crate::audit::SessionAudit;

// ─── CSV export ─────────────────────────────────────────────────────

/// Export the refiner's ranked list as CSV.
///
/// Columns: rank, instrument, in_head, score, amplitude_score,
/// volatility_score, volume_score, flow_score, amplitude_ratio,
/// volatility_ratio, volume_ratio, net_flow, flow_to_market_cap, tick_count,
/// synthetic
pub fn export_ranking_csv(report: &RefinerReport) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record([
        "rank",
        "instrument",
        "in_head",
        "score",
        "amplitude_score",
        "volatility_score",
        "volume_score",
        "flow_score",
        "amplitude_ratio",
        "volatility_ratio",
        "volume_ratio",
        "net_flow",
        "flow_to_market_cap",
        "tick_count",
        "synthetic",
    ])?;

    for s in &report.ranked {
        let m = &s.metrics;
        wtr.write_record(&[
            s.rank.to_string(),
            s.instrument.to_string(),
            (s.rank <= report.head_size).to_string(),
            format!("{:.6}", s.score),
            format!("{:.6}", s.sub_scores.amplitude),
            format!("{:.6}", s.sub_scores.volatility),
            format!("{:.6}", s.sub_scores.volume),
            format!("{:.6}", s.sub_scores.flow),
            format!("{:.6}", m.amplitude_ratio),
            format!("{:.6}", m.volatility_ratio),
            format!("{:.6}", m.volume_ratio),
            format!("{:.4}", m.net_flow),
            m.flow_to_market_cap
                .map(|v| format!("{v:.8}"))
                .unwrap_or_default(),
            m.tick_count.to_string(),
            m.synthetic.to_string(),
        ])?;
    }

    let bytes = wtr.into_inner().context("failed to flush ranking CSV")?;
    String::from_utf8(bytes).context("ranking CSV is not valid UTF-8")
}

/// Write the ranking CSV to `path`, creating parent directories.
pub fn write_ranking_csv(report: &RefinerReport, path: &Path) -> Result<()> {
    let csv = export_ranking_csv(report)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, csv).with_context(|| format!("failed to write {}", path.display()))
}

/// Export every exclusion of a funnel run as CSV.
///
/// Columns: stage, instrument, reason, detail
pub fn export_exclusions_csv(report: &FunnelReport) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["stage", "instrument", "reason", "detail"])?;
    for stage in &report.stages {
        for ex in &stage.excluded {
            let detail = serde_json::to_string(&ex.reason)
                .context("failed to serialize exclusion reason")?;
            wtr.write_record(&[
                stage.stage.to_string(),
                ex.instrument.to_string(),
                ex.reason.code().to_string(),
                detail,
            ])?;
        }
    }
    let bytes = wtr.into_inner().context("failed to flush exclusions CSV")?;
    String::from_utf8(bytes).context("exclusions CSV is not valid UTF-8")
}

// ─── JSON export ────────────────────────────────────────────────────

/// Serialize a session audit to pretty JSON.
pub fn export_audit_json(audit: &SessionAudit) -> Result<String> {
    serde_json::to_string_pretty(audit).context("failed to serialize session audit to JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use sieve_core::domain::InstrumentId;
    use sieve_core::refiner::{rank, RefinerWeights, SubScoreCeilings, TickMetrics};

    fn metrics(id: &str, amplitude: f64) -> TickMetrics {
        TickMetrics {
            instrument: InstrumentId::from(id),
            reference_close: 10.0,
            open: 10.0,
            high: 10.0 + amplitude * 10.0,
            low: 10.0,
            last: 10.0 + amplitude * 5.0,
            tick_count: 120,
            cumulative_volume: 50_000,
            cumulative_notional: 50.0,
            amplitude_ratio: amplitude,
            volatility_ratio: 1.5,
            volume_ratio: 2.0,
            flow_buckets: vec![],
            net_flow: 3.5,
            flow_to_market_cap: None,
            synthetic: false,
        }
    }

    fn report() -> RefinerReport {
        let ranked = rank(
            vec![metrics("000002", 0.02), metrics("000001", 0.06)],
            &RefinerWeights::default(),
            &SubScoreCeilings::default(),
        );
        RefinerReport {
            ranked,
            head_size: 1,
            failed: vec![],
            tracked: None,
            synthetic_count: 0,
            elapsed_ms: 3,
        }
    }

    #[test]
    fn ranking_csv_has_header_and_rows_in_rank_order() {
        let csv = export_ranking_csv(&report()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("rank,instrument,in_head,score"));
        assert!(lines[1].starts_with("1,000001,true,"));
        assert!(lines[2].starts_with("2,000002,false,"));
        assert!(lines[1].ends_with(",120,false"));
    }

    #[test]
    fn ranking_csv_written_to_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("ranking.csv");
        write_ranking_csv(&report(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, export_ranking_csv(&report()).unwrap());
    }

    #[test]
    fn empty_ranking_is_header_only() {
        let empty = RefinerReport {
            ranked: vec![],
            ..report()
        };
        assert_eq!(export_ranking_csv(&empty).unwrap().lines().count(), 1);
    }

    #[test]
    fn audit_json_names_the_session() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        let audit = SessionAudit::new(sieve_core::domain::SessionId::derive(date, 1), date);
        let json = export_audit_json(&audit).unwrap();
        assert!(json.contains("\"trading_date\": \"2024-03-15\""));
    }
}
