//! Run artifacts: step-record tables (CSV/Parquet), metric tables, and the
//! on-disk bundle for one grid point.
//!
//! The step table has one row per observation:
//! `timestamp, portfolio_value, failures, <entity>.<field>...` with entity
//! columns sorted by name. Floats are written in shortest round-trip form,
//! so reading a table back restores the exact equity curve.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use polars::prelude::{Column, DataFrame, ParquetWriter};

use defilab_core::metrics::StrategyMetrics;
use defilab_core::strategy::StepRecord;

use crate::result::RunRecord;

pub const BACKTEST_CSV: &str = "strategy_backtest_data.csv";
pub const TRAJECTORIES_CSV: &str = "trajectories_metrics.csv";
pub const WINDOWS_CSV: &str = "windows_metrics.csv";

const FIXED_COLUMNS: [&str; 3] = ["timestamp", "portfolio_value", "failures"];

// ─── Step table ─────────────────────────────────────────────────────

/// One parsed row of a step table.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRow {
    pub timestamp: DateTime<Utc>,
    pub portfolio_value: f64,
    pub failures: usize,
    pub fields: BTreeMap<String, f64>,
}

/// Flattens a record into `entity.field → value`, balances included.
fn record_fields(record: &StepRecord) -> BTreeMap<String, f64> {
    let mut fields = BTreeMap::new();
    for (entity, state) in &record.internal_states {
        for (field, value) in state.fields() {
            fields.insert(format!("{entity}.{field}"), value);
        }
    }
    for (entity, balance) in &record.balances {
        fields.insert(format!("{entity}.balance"), *balance);
    }
    fields
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn steps_csv(records: &[StepRecord]) -> Result<String> {
    let rows: Vec<BTreeMap<String, f64>> = records.iter().map(record_fields).collect();
    let columns: BTreeSet<&String> = rows.iter().flat_map(|r| r.keys()).collect();

    let mut wtr = csv::Writer::from_writer(vec![]);
    let header: Vec<&str> = FIXED_COLUMNS
        .iter()
        .copied()
        .chain(columns.iter().map(|c| c.as_str()))
        .collect();
    wtr.write_record(&header)?;

    for (record, fields) in records.iter().zip(&rows) {
        let mut row = vec![
            format_timestamp(&record.timestamp),
            record.portfolio_value.to_string(),
            record.failures.len().to_string(),
        ];
        row.extend(
            columns
                .iter()
                .map(|c| fields.get(*c).map(f64::to_string).unwrap_or_default()),
        );
        wtr.write_record(&row)?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

pub fn read_steps_csv(content: &str) -> Result<Vec<StepRow>> {
    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    let headers = rdr.headers()?.clone();
    if headers.len() < FIXED_COLUMNS.len()
        || FIXED_COLUMNS.iter().zip(headers.iter()).any(|(a, b)| *a != b)
    {
        bail!("step table must start with {FIXED_COLUMNS:?}");
    }

    let mut rows = Vec::new();
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let timestamp = DateTime::parse_from_rfc3339(&record[0])
            .with_context(|| format!("row {line}: bad timestamp '{}'", &record[0]))?
            .with_timezone(&Utc);
        let portfolio_value: f64 = record[1]
            .parse()
            .with_context(|| format!("row {line}: bad portfolio_value"))?;
        let failures: usize = record[2]
            .parse()
            .with_context(|| format!("row {line}: bad failures"))?;

        let mut fields = BTreeMap::new();
        for (name, raw) in headers.iter().zip(record.iter()).skip(FIXED_COLUMNS.len()) {
            if raw.is_empty() {
                continue;
            }
            let value: f64 = raw
                .parse()
                .with_context(|| format!("row {line}: bad value for {name}"))?;
            fields.insert(name.to_string(), value);
        }

        rows.push(StepRow {
            timestamp,
            portfolio_value,
            failures,
            fields,
        });
    }
    Ok(rows)
}

/// Recomputes run metrics from a step table.
pub fn metrics_from_rows(rows: &[StepRow]) -> StrategyMetrics {
    let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
    let values: Vec<f64> = rows.iter().map(|r| r.portfolio_value).collect();
    StrategyMetrics::compute(&timestamps, &values)
}

pub fn write_steps_parquet(path: &Path, records: &[StepRecord]) -> Result<()> {
    let rows: Vec<BTreeMap<String, f64>> = records.iter().map(record_fields).collect();
    let names: BTreeSet<String> = rows.iter().flat_map(|r| r.keys().cloned()).collect();

    let timestamps: Vec<String> = records
        .iter()
        .map(|r| format_timestamp(&r.timestamp))
        .collect();
    let values: Vec<f64> = records.iter().map(|r| r.portfolio_value).collect();
    let failures: Vec<u32> = records.iter().map(|r| r.failures.len() as u32).collect();

    let mut columns = vec![
        Column::new("timestamp".into(), timestamps),
        Column::new("portfolio_value".into(), values),
        Column::new("failures".into(), failures),
    ];
    for name in &names {
        let column: Vec<Option<f64>> = rows.iter().map(|r| r.get(name).copied()).collect();
        columns.push(Column::new(name.as_str().into(), column));
    }

    let mut df = DataFrame::new(columns).context("Failed to build step dataframe")?;
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create step parquet {}", path.display()))?;
    ParquetWriter::new(&mut file)
        .finish(&mut df)
        .context("Failed to write step parquet")?;
    Ok(())
}

// ─── Metric tables ──────────────────────────────────────────────────

/// One row per trajectory or window.
pub fn metrics_csv(samples: &[StrategyMetrics]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    for sample in samples {
        wtr.serialize(sample)?;
    }
    if samples.is_empty() {
        wtr.write_record(["accumulated_return", "apy", "sharpe", "max_drawdown"])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

pub fn read_metrics_csv(content: &str) -> Result<Vec<StrategyMetrics>> {
    let mut rdr = csv::Reader::from_reader(content.as_bytes());
    rdr.deserialize()
        .collect::<std::result::Result<Vec<StrategyMetrics>, _>>()
        .context("malformed metrics table")
}

// ─── Bundle ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub run_json: PathBuf,
    pub steps_csv: Option<PathBuf>,
    pub steps_parquet: Option<PathBuf>,
    pub trajectories_csv: Option<PathBuf>,
    pub windows_csv: Option<PathBuf>,
}

/// Writes everything known about one grid point under `output_dir/<run_id>/`.
pub fn save_run(output_dir: &Path, record: &RunRecord) -> Result<ArtifactPaths> {
    let run_dir = output_dir.join(&record.run_id);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;

    let run_json = run_dir.join("run.json");
    let json = serde_json::to_string_pretty(record).context("failed to serialize run")?;
    std::fs::write(&run_json, json)?;

    let mut paths = ArtifactPaths {
        run_json,
        steps_csv: None,
        steps_parquet: None,
        trajectories_csv: None,
        windows_csv: None,
    };

    if let Some(backtest) = &record.backtest {
        let csv_path = run_dir.join(BACKTEST_CSV);
        std::fs::write(&csv_path, steps_csv(&backtest.records)?)?;
        let parquet_path = run_dir.join("strategy_backtest_data.parquet");
        write_steps_parquet(&parquet_path, &backtest.records)?;
        paths.steps_csv = Some(csv_path);
        paths.steps_parquet = Some(parquet_path);
    }
    if let Some(dist) = &record.trajectories {
        let path = run_dir.join(TRAJECTORIES_CSV);
        std::fs::write(&path, metrics_csv(&dist.samples)?)?;
        paths.trajectories_csv = Some(path);
    }
    if let Some(dist) = &record.windows {
        let path = run_dir.join(WINDOWS_CSV);
        std::fs::write(&path, metrics_csv(&dist.samples)?)?;
        paths.windows_csv = Some(path);
    }
    Ok(paths)
}

pub fn load_run(run_dir: &Path) -> Result<RunRecord> {
    let path = run_dir.join("run.json");
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("malformed {}", path.display()))
}
