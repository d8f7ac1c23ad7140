use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::aggregate::{CountryAggregate, FailedLookup};
use crate::errors::AppResult;
use crate::pipeline::RunReport;
use crate::place::FailureReason;

pub fn write_countries(path: &Path, countries: &[CountryAggregate]) -> AppResult<()> {
    write_json(path, countries)?;
    info!(path = %path.display(), countries = countries.len(), "wrote country summary");
    Ok(())
}

/// Always written, even when empty, so stale failures from an earlier run
/// do not linger.
pub fn write_failed_lookups(path: &Path, failed: &[FailedLookup]) -> AppResult<()> {
    write_json(path, failed)?;
    info!(path = %path.display(), failed = failed.len(), "wrote failed lookups");
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut payload = serde_json::to_string_pretty(value)?;
    payload.push('\n');
    fs::write(path, payload)?;
    Ok(())
}

/// Human-readable end-of-run report. Countries are listed alphabetically
/// here; the JSON export keeps first-seen order.
pub fn render_summary(report: &RunReport) -> String {
    let unique_states: usize = report.countries.iter().map(|c| c.states.len()).sum();
    let mut lines = vec![
        format!("Total unique countries: {}", report.countries.len()),
        format!("Total unique states: {unique_states}"),
    ];

    let mut countries: Vec<&CountryAggregate> = report.countries.iter().collect();
    countries.sort_by(|a, b| a.country.cmp(&b.country));
    for country in countries {
        let mut line = format!("  {}: {}", country.country, country.count);
        if !country.states.is_empty() {
            let mut names: Vec<&str> = country.states.iter().map(|s| s.name.as_str()).collect();
            names.sort_unstable();
            line.push_str(&format!(" ({})", names.join(", ")));
        }
        lines.push(line);
    }

    let stats = &report.stats;
    lines.push(format!(
        "Records: {} ({} resolved, {} failed, {} skipped)",
        stats.records, stats.resolved, stats.failed, stats.skipped
    ));
    lines.push(format!(
        "Cache hits: {}, API calls: {}",
        stats.cache_hits, stats.api_calls
    ));

    let mut by_reason: BTreeMap<FailureReason, usize> = BTreeMap::new();
    for failure in &report.failed {
        *by_reason.entry(failure.reason).or_default() += 1;
    }
    let mut failed = format!("Failed lookups: {}", report.failed.len());
    if !by_reason.is_empty() {
        let breakdown = by_reason
            .iter()
            .map(|(reason, count)| format!("{reason}: {count}"))
            .collect::<Vec<_>>()
            .join(", ");
        failed.push_str(&format!(" ({breakdown})"));
    }
    lines.push(failed);

    if report.interrupted {
        lines.push(
            "Interrupted: results cover only the records processed before the interrupt.".into(),
        );
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::aggregate::Location;
    use crate::cache::MigrationReport;
    use crate::pipeline::{RunPaths, RunStats};
    use crate::place::StateRef;

    use super::*;

    fn report(interrupted: bool) -> RunReport {
        RunReport {
            countries: vec![
                CountryAggregate {
                    country: "Germany".into(),
                    count: 1,
                    states: Vec::new(),
                    locations: vec![Location::new(48.1351, 11.582)],
                },
                CountryAggregate {
                    country: "Australia".into(),
                    count: 2,
                    states: vec![StateRef::new("Queensland", Some("QLD".into())).unwrap()],
                    locations: Vec::new(),
                },
            ],
            failed: vec![
                FailedLookup {
                    title: "Hoan Kiem".into(),
                    url: "https://maps.google.com/?ftid=0x1:0x2".into(),
                    reason: FailureReason::AmbiguousIdentifier,
                },
                FailedLookup {
                    title: "Atlantis".into(),
                    url: String::new(),
                    reason: FailureReason::NoMatch,
                },
            ],
            stats: RunStats {
                records: 5,
                resolved: 3,
                failed: 2,
                skipped: 0,
                cache_hits: 1,
                api_calls: 3,
                short_circuits: 1,
            },
            interrupted,
            paths: RunPaths {
                shared_cache: PathBuf::from("cache/shared.json"),
                place_cache: PathBuf::from("cache/Saved_place_names.json"),
                legacy_cache: PathBuf::from("cache/Saved.json"),
                countries: PathBuf::from("build/Saved_countries.json"),
                failed_lookups: PathBuf::from("build/Saved_failed_lookups.json"),
            },
            migrations: MigrationReport::default(),
        }
    }

    #[test]
    fn writes_countries_with_fixed_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("Saved_countries.json");
        write_countries(&path, &report(false).countries).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written[0]["country"], "Germany");
        assert_eq!(written[0]["locations"][0]["lat"], "48.135100");
        assert_eq!(written[1]["states"][0]["code"], "QLD");
        assert!(written[0]["states"].as_array().unwrap().is_empty());
    }

    #[test]
    fn overwrites_failed_lookups_even_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Saved_failed_lookups.json");
        write_failed_lookups(&path, &report(false).failed).unwrap();
        assert!(fs::read_to_string(&path)
            .unwrap()
            .contains("\"reason\": \"ambiguous-identifier\""));

        write_failed_lookups(&path, &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), "[]");
    }

    #[test]
    fn renders_summary_sorted_with_breakdown() {
        let summary = render_summary(&report(false));
        assert!(summary.contains("Total unique countries: 2"));
        assert!(summary.contains("Total unique states: 1"));
        let australia = summary.find("Australia: 2 (Queensland)").unwrap();
        let germany = summary.find("Germany: 1").unwrap();
        assert!(australia < germany);
        assert!(summary.contains("Cache hits: 1, API calls: 3"));
        assert!(summary.contains("Failed lookups: 2 (no-match: 1, ambiguous-identifier: 1)"));
        assert!(!summary.contains("Interrupted"));
        assert_eq!(
            summary.lines().collect::<Vec<_>>(),
            vec![
                "Total unique countries: 2",
                "Total unique states: 1",
                "  Australia: 2 (Queensland)",
                "  Germany: 1",
                "Records: 5 (3 resolved, 2 failed, 0 skipped)",
                "Cache hits: 1, API calls: 3",
                "Failed lookups: 2 (no-match: 1, ambiguous-identifier: 1)",
            ]
        );

        assert!(render_summary(&report(true)).contains("Interrupted"));
    }
}
