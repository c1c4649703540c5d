#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use fc_columnar::Field;
use fc_frame::Table;
use fc_histogram::{
    HistogramOptions, HistogramResult, build_histogram, choose_bucket_size, join_histograms,
};
use fc_reduce::{ReducerOptions, reduce_table_with_not_found};
use fc_types::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }

    #[must_use]
    pub fn packet_fixture_root(&self) -> PathBuf {
        self.fixture_root.join("packets")
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SuiteOptions {
    pub packet_filter: Option<String>,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("fixture format error: {0}")]
    FixtureFormat(String),
}

// ---------------------------------------------------------------------------
// Fixture model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixtureOperation {
    Histogram,
    JoinHistograms,
    Reduce,
    BucketSize,
}

impl FixtureOperation {
    #[must_use]
    pub fn operation_name(self) -> &'static str {
        match self {
            Self::Histogram => "histogram",
            Self::JoinHistograms => "join_histograms",
            Self::Reduce => "reduce",
            Self::BucketSize => "bucket_size",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureExpectedField {
    pub name: String,
    pub values: Vec<Scalar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureExpectedHistogram {
    pub x_min: Vec<Scalar>,
    pub x_max: Vec<Scalar>,
    pub counts: Vec<FixtureExpectedField>,
}

/// One reduced row: the stat id and the per-column values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureExpectedRow {
    pub stat: String,
    pub values: Vec<Scalar>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketFixture {
    pub packet_id: String,
    pub case_id: String,
    pub operation: FixtureOperation,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub histograms: Vec<Table>,
    #[serde(default)]
    pub values: Vec<f64>,
    #[serde(default)]
    pub histogram_options: Option<HistogramOptions>,
    #[serde(default)]
    pub reducer_options: Option<ReducerOptions>,
    #[serde(default)]
    pub expected_histogram: Option<FixtureExpectedHistogram>,
    /// The operation yields nothing (`None`).
    #[serde(default)]
    pub expected_absent: bool,
    #[serde(default)]
    pub expected_rows: Option<Vec<FixtureExpectedRow>>,
    #[serde(default)]
    pub expected_not_found: Option<Vec<String>>,
    #[serde(default)]
    pub expected_bucket_size: Option<f64>,
    #[serde(default)]
    pub expected_error_contains: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub packet_id: String,
    pub case_id: String,
    pub operation: FixtureOperation,
    pub status: CaseStatus,
    pub mismatch: Option<String>,
    #[serde(default)]
    pub elapsed_us: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketParityReport {
    pub suite: String,
    pub packet_id: Option<String>,
    pub fixture_count: usize,
    pub passed: usize,
    pub failed: usize,
    pub results: Vec<CaseResult>,
}

impl PacketParityReport {
    #[must_use]
    pub fn is_green(&self) -> bool {
        self.failed == 0 && self.fixture_count > 0
    }
}

// ---------------------------------------------------------------------------
// Suite runners
// ---------------------------------------------------------------------------

pub fn run_packet_suite(config: &HarnessConfig) -> Result<PacketParityReport, HarnessError> {
    run_packet_suite_with_options(config, &SuiteOptions::default())
}

#[instrument(skip(config, options), fields(filter = ?options.packet_filter))]
pub fn run_packet_suite_with_options(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<PacketParityReport, HarnessError> {
    let fixtures = load_fixtures(config, options.packet_filter.as_deref())?;
    Ok(build_report(
        "fc_packets".to_owned(),
        options.packet_filter.clone(),
        &fixtures,
    ))
}

/// One report per packet id, in packet order.
pub fn run_packets_grouped(
    config: &HarnessConfig,
    options: &SuiteOptions,
) -> Result<Vec<PacketParityReport>, HarnessError> {
    let fixtures = load_fixtures(config, options.packet_filter.as_deref())?;
    let mut grouped = BTreeMap::<String, Vec<PacketFixture>>::new();
    for fixture in fixtures {
        grouped
            .entry(fixture.packet_id.clone())
            .or_default()
            .push(fixture);
    }

    Ok(grouped
        .into_iter()
        .map(|(packet_id, packet_fixtures)| {
            build_report(
                format!("fc_packets:{packet_id}"),
                Some(packet_id),
                &packet_fixtures,
            )
        })
        .collect())
}

fn build_report(
    suite: String,
    packet_id: Option<String>,
    fixtures: &[PacketFixture],
) -> PacketParityReport {
    let results: Vec<CaseResult> = fixtures.iter().map(run_fixture).collect();
    let failed = results
        .iter()
        .filter(|result| matches!(result.status, CaseStatus::Fail))
        .count();
    let passed = results.len().saturating_sub(failed);
    info!(suite = %suite, fixtures = results.len(), passed, failed, "packet report built");

    PacketParityReport {
        suite,
        packet_id,
        fixture_count: results.len(),
        passed,
        failed,
        results,
    }
}

pub fn load_fixtures(
    config: &HarnessConfig,
    packet_filter: Option<&str>,
) -> Result<Vec<PacketFixture>, HarnessError> {
    let fixture_files = list_fixture_files(&config.packet_fixture_root())?;
    let mut fixtures = Vec::with_capacity(fixture_files.len());

    for fixture_path in fixture_files {
        let fixture = load_fixture(&fixture_path)?;
        if packet_filter.is_none_or(|packet| fixture.packet_id == packet) {
            fixtures.push(fixture);
        }
    }
    fixtures.sort_by(|a, b| a.case_id.cmp(&b.case_id));
    Ok(fixtures)
}

fn load_fixture(path: &Path) -> Result<PacketFixture, HarnessError> {
    let body = fs::read_to_string(path)?;
    let fixture: PacketFixture = serde_json::from_str(&body)?;
    validate_fixture(&fixture).map_err(|reason| {
        HarnessError::FixtureFormat(format!("{}: {reason}", path.display()))
    })?;
    Ok(fixture)
}

/// Reject fixtures that carry nothing to check for their operation.
fn validate_fixture(fixture: &PacketFixture) -> Result<(), String> {
    let has_expectation = match fixture.operation {
        FixtureOperation::Histogram | FixtureOperation::JoinHistograms => {
            fixture.expected_histogram.is_some() || fixture.expected_absent
        }
        FixtureOperation::Reduce => {
            fixture.expected_rows.is_some() || fixture.expected_error_contains.is_some()
        }
        FixtureOperation::BucketSize => {
            fixture.expected_bucket_size.is_some() || fixture.expected_absent
        }
    };
    if has_expectation {
        Ok(())
    } else {
        Err(format!(
            "case {} has no expectation for {}",
            fixture.case_id,
            fixture.operation.operation_name()
        ))
    }
}

fn list_fixture_files(root: &Path) -> Result<Vec<PathBuf>, HarnessError> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

// ---------------------------------------------------------------------------
// Case execution
// ---------------------------------------------------------------------------

#[must_use]
pub fn run_fixture(fixture: &PacketFixture) -> CaseResult {
    let started = Instant::now();
    let mismatch = run_fixture_operation(fixture).err();
    let elapsed_us = (started.elapsed().as_micros() as u64).max(1);
    debug!(
        case_id = %fixture.case_id,
        operation = fixture.operation.operation_name(),
        passed = mismatch.is_none(),
        elapsed_us,
        "fixture case finished"
    );

    CaseResult {
        packet_id: fixture.packet_id.clone(),
        case_id: fixture.case_id.clone(),
        operation: fixture.operation,
        status: if mismatch.is_none() {
            CaseStatus::Pass
        } else {
            CaseStatus::Fail
        },
        mismatch,
        elapsed_us,
    }
}

fn run_fixture_operation(fixture: &PacketFixture) -> Result<(), String> {
    match fixture.operation {
        FixtureOperation::Histogram => {
            let options = fixture.histogram_options.clone().unwrap_or_default();
            let actual = build_histogram(&fixture.tables, &options);
            compare_histogram_outcome(actual.as_ref(), fixture)
        }
        FixtureOperation::JoinHistograms => {
            let inputs = fixture
                .histograms
                .iter()
                .enumerate()
                .map(|(idx, table)| {
                    HistogramResult::from_table(table)
                        .ok_or_else(|| format!("histogram input {idx} lacks xMin/xMax fields"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let actual = join_histograms(&inputs);
            compare_histogram_outcome(actual.as_ref(), fixture)
        }
        FixtureOperation::Reduce => {
            let table = fixture
                .tables
                .first()
                .ok_or("reduce fixture needs one input table")?;
            let options = fixture.reducer_options.clone().unwrap_or_default();
            let mut not_found = Vec::new();
            let outcome = reduce_table_with_not_found(table, &options, Some(&mut not_found));

            match (outcome, &fixture.expected_error_contains) {
                (Err(err), Some(needle)) => {
                    let message = err.to_string();
                    if message.contains(needle.as_str()) {
                        Ok(())
                    } else {
                        Err(format!(
                            "error mismatch: actual={message:?}, expected to contain {needle:?}"
                        ))
                    }
                }
                (Err(err), None) => Err(format!("unexpected reduce error: {err}")),
                (Ok(_), Some(needle)) => {
                    Err(format!("expected error containing {needle:?}, reduce succeeded"))
                }
                (Ok(rows), None) => {
                    if let Some(expected) = &fixture.expected_not_found
                        && &not_found != expected
                    {
                        return Err(format!(
                            "not-found mismatch: actual={not_found:?}, expected={expected:?}"
                        ));
                    }
                    let expected = fixture
                        .expected_rows
                        .as_deref()
                        .ok_or("reduce fixture needs expected_rows")?;
                    compare_rows_expected(&rows, expected)
                }
            }
        }
        FixtureOperation::BucketSize => {
            let options = fixture.histogram_options.clone().unwrap_or_default();
            let actual =
                choose_bucket_size(&fixture.values, options.bucket_count, options.bucket_size);
            match (actual, fixture.expected_bucket_size) {
                (None, None) if fixture.expected_absent => Ok(()),
                (Some(actual), Some(expected)) if actual == expected => Ok(()),
                (actual, expected) => Err(format!(
                    "bucket size mismatch: actual={actual:?}, expected={expected:?}"
                )),
            }
        }
    }
}

fn compare_histogram_outcome(
    actual: Option<&HistogramResult>,
    fixture: &PacketFixture,
) -> Result<(), String> {
    match (actual, &fixture.expected_histogram) {
        (None, _) if fixture.expected_absent => Ok(()),
        (Some(_), _) if fixture.expected_absent => {
            Err("expected no histogram, one was produced".to_owned())
        }
        (Some(actual), Some(expected)) => compare_histogram_expected(actual, expected),
        (None, _) => Err("expected a histogram, none was produced".to_owned()),
        (Some(_), None) => Err("fixture has no expected histogram".to_owned()),
    }
}

fn compare_histogram_expected(
    actual: &HistogramResult,
    expected: &FixtureExpectedHistogram,
) -> Result<(), String> {
    compare_values(actual.x_min().values(), &expected.x_min, "xMin")?;
    compare_values(actual.x_max().values(), &expected.x_max, "xMax")?;

    let actual_names: Vec<&str> = actual.counts().iter().map(Field::name).collect();
    let expected_names: Vec<&str> = expected.counts.iter().map(|f| f.name.as_str()).collect();
    if actual_names != expected_names {
        return Err(format!(
            "count field mismatch: actual={actual_names:?}, expected={expected_names:?}"
        ));
    }
    for (field, expected) in actual.counts().iter().zip(&expected.counts) {
        compare_values(field.values(), &expected.values, &expected.name)?;
    }
    Ok(())
}

fn compare_rows_expected(actual: &[Table], expected: &[FixtureExpectedRow]) -> Result<(), String> {
    if actual.len() != expected.len() {
        return Err(format!(
            "row count mismatch: actual={}, expected={}",
            actual.len(),
            expected.len()
        ));
    }
    for (table, row) in actual.iter().zip(expected) {
        if table.name() != Some(row.stat.as_str()) {
            return Err(format!(
                "stat mismatch: actual={:?}, expected={:?}",
                table.name(),
                row.stat
            ));
        }
        let cells: Vec<Scalar> = table
            .fields()
            .iter()
            .map(|f| f.value(0).cloned().unwrap_or(Scalar::NULL))
            .collect();
        compare_values(&cells, &row.values, &row.stat)?;
    }
    Ok(())
}

fn compare_values(actual: &[Scalar], expected: &[Scalar], name: &str) -> Result<(), String> {
    if actual.len() != expected.len() {
        return Err(format!(
            "{name} length mismatch: actual={}, expected={}",
            actual.len(),
            expected.len()
        ));
    }
    for (idx, (left, right)) in actual.iter().zip(expected).enumerate() {
        if !left.semantic_eq(right) {
            return Err(format!(
                "{name} mismatch at idx={idx}: actual={left:?}, expected={right:?}"
            ));
        }
    }
    Ok(())
}
