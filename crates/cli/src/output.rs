//! Human and JSON renderings of job reports, search hits and store statistics.

use semantic_core::knowledge::{ScoredRecord, StoreStats};
use semantic_core::models::ClassificationRecord;
use semantic_core::orchestrator::{FileOutcome, JobReport};
use serde_json::{json, Value};
use std::fmt::Write;
use std::io;

pub fn report_json(report: &JobReport) -> Value {
    json!({
        "status": if report.failed == 0 { "ok" } else { "partial" },
        "provider": report.provider,
        "total": report.total(),
        "succeeded": report.succeeded,
        "failed": report.failed,
        "skipped": report.skipped,
        "cancelled": report.cancelled,
        "pruned": report.pruned,
        "files": report.files,
    })
}

pub fn render_report(report: &JobReport) -> String {
    let mut out = format!(
        "index ({}): {} files, succeeded {}, failed {}, skipped {}, cancelled {}, pruned {}\n",
        report.provider,
        report.total(),
        report.succeeded,
        report.failed,
        report.skipped,
        report.cancelled,
        report.pruned
    );
    for file in &report.files {
        if let FileOutcome::FailedTerminal { kind, message } = &file.outcome {
            let _ = writeln!(
                out,
                "  failed {} after {} attempt(s) [{:?}]: {}",
                file.path, file.attempts, kind, message
            );
        }
    }
    out
}

pub fn hits_json(query: &str, hits: &[ScoredRecord]) -> Value {
    json!({ "query": query, "hits": hits })
}

pub fn render_hits(hits: &[ScoredRecord]) -> String {
    if hits.is_empty() {
        return "no matching knowledge\n".to_string();
    }
    let mut out = String::new();
    for (i, hit) in hits.iter().enumerate() {
        let r = &hit.record;
        let _ = writeln!(
            out,
            "{}. [{:.3}] {} ({}, {}, {})",
            i + 1,
            hit.score,
            r.path,
            r.project,
            r.file_kind,
            r.provider
        );
        let _ = writeln!(out, "   {}", r.purpose);
        for rule in &r.rules {
            let _ = writeln!(out, "   - {rule}");
        }
    }
    out
}

pub fn render_stats(stats: &StoreStats) -> String {
    let mut out = format!(
        "records: {}\naverage confidence: {:.2}\n",
        stats.total, stats.average_confidence
    );
    for (label, counts) in [
        ("by provider", &stats.by_provider),
        ("by kind", &stats.by_kind),
        ("by project", &stats.by_project),
    ] {
        if counts.is_empty() {
            continue;
        }
        let _ = writeln!(out, "{label}:");
        for (name, n) in counts {
            let _ = writeln!(out, "  {name}: {n}");
        }
    }
    out
}

/// One JSON object per line, in store order.
pub fn write_records<W: io::Write>(records: &[ClassificationRecord], mut out: W) -> anyhow::Result<()> {
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use semantic_core::models::FileKind;
    use semantic_core::orchestrator::{FailureKind, FileReport};

    fn record() -> ClassificationRecord {
        ClassificationRecord {
            fingerprint: "h1".into(),
            provider: "P1".into(),
            path: "Loyalty/LoyaltyRule.cs".into(),
            project: "Loyalty".into(),
            file_kind: FileKind::Code,
            purpose: "Award points on qualifying orders".into(),
            rules: vec!["order amount > $10 → +100 points".into()],
            workflows: vec![],
            integration_points: vec!["OrderService".into()],
            confidence: 0.9,
            timestamp: Utc::now(),
        }
    }

    fn report() -> JobReport {
        JobReport {
            provider: "P1".into(),
            succeeded: 1,
            failed: 1,
            files: vec![
                FileReport {
                    path: "Loyalty/LoyaltyRule.cs".into(),
                    fingerprint: "h1".into(),
                    attempts: 1,
                    outcome: FileOutcome::Succeeded(record()),
                },
                FileReport {
                    path: "Loyalty/Broken.cs".into(),
                    fingerprint: "h2".into(),
                    attempts: 3,
                    outcome: FileOutcome::FailedTerminal {
                        kind: FailureKind::Timeout,
                        message: "provider call timed out".into(),
                    },
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn report_lists_failures() {
        let text = render_report(&report());
        assert!(text.starts_with("index (P1): 2 files, succeeded 1, failed 1"));
        assert!(text.contains("failed Loyalty/Broken.cs after 3 attempt(s) [Timeout]"));
        assert!(!text.contains("failed Loyalty/LoyaltyRule.cs"));
    }

    #[test]
    fn report_json_tags_outcomes() {
        let v = report_json(&report());
        assert_eq!(v["status"], "partial");
        assert_eq!(v["files"][0]["outcome"]["outcome"], "succeeded");
        assert_eq!(v["files"][1]["outcome"]["kind"], "timeout");
    }

    #[test]
    fn hits_render_rules_under_purpose() {
        let hits = vec![ScoredRecord { record: record(), score: 0.8123 }];
        let text = render_hits(&hits);
        assert!(text.starts_with("1. [0.812] Loyalty/LoyaltyRule.cs (Loyalty, code, P1)"));
        assert!(text.contains("   - order amount > $10 → +100 points"));
        assert_eq!(render_hits(&[]), "no matching knowledge\n");
        assert_eq!(hits_json("points", &hits)["hits"][0]["record"]["project"], "Loyalty");
    }

    #[test]
    fn stats_skip_empty_groups() {
        let stats = StoreStats::from_records(&[record()]);
        let text = render_stats(&stats);
        assert!(text.contains("records: 1"));
        assert!(text.contains("by provider:\n  P1: 1"));
        assert!(render_stats(&StoreStats::default()).starts_with("records: 0"));
        assert!(!render_stats(&StoreStats::default()).contains("by provider"));
    }

    #[test]
    fn export_writes_one_record_per_line() {
        let first = record();
        let mut second = record();
        second.fingerprint = "h2".into();
        second.path = "Loyalty/appsettings.json".into();
        second.file_kind = FileKind::Configuration;

        let mut buf = Vec::new();
        write_records(&[first.clone(), second], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: ClassificationRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, first);
        let v: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(v["file_kind"], "configuration");
        assert_eq!(v["rules"][0], "order amount > $10 → +100 points");
    }
}
