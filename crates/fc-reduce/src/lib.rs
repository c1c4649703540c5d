#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use fc_columnar::Field;
use fc_frame::{FrameError, Table};
use fc_types::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReduceError {
    #[error("Invalid column selection: {index}")]
    InvalidColumnSelection { index: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// How reducers treat missing cells (nulls and NaN).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NullValueMode {
    /// Missing cells pass through: numeric stats skip them, counts and
    /// change tracking still see them.
    #[default]
    Default,
    /// Missing cells are skipped entirely.
    Ignore,
    /// Missing cells count as zero.
    AsZero,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReducerOptions {
    /// Columns to reduce; all columns when unset.
    #[serde(default)]
    pub column_indexes: Option<Vec<usize>>,
    #[serde(default)]
    pub null_value_mode: NullValueMode,
    #[serde(default)]
    pub stats: Vec<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReducerId {
    LastNotNull,
    Last,
    FirstNotNull,
    First,
    Min,
    Max,
    Mean,
    Sum,
    Count,
    Range,
    Delta,
    Step,
    Diff,
    Logmin,
    AllIsZero,
    AllIsNull,
    ChangeCount,
    DistinctCount,
    Diffperc,
}

impl ReducerId {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LastNotNull => "lastNotNull",
            Self::Last => "last",
            Self::FirstNotNull => "firstNotNull",
            Self::First => "first",
            Self::Min => "min",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Range => "range",
            Self::Delta => "delta",
            Self::Step => "step",
            Self::Diff => "diff",
            Self::Logmin => "logmin",
            Self::AllIsZero => "allIsZero",
            Self::AllIsNull => "allIsNull",
            Self::ChangeCount => "changeCount",
            Self::DistinctCount => "distinctCount",
            Self::Diffperc => "diffperc",
        }
    }
}

/// Result a reducer reports for a table without rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyResult {
    Null,
    Zero,
    True,
    False,
}

impl EmptyResult {
    #[must_use]
    pub fn to_scalar(self) -> Scalar {
        match self {
            Self::Null => Scalar::NULL,
            Self::Zero => Scalar::Int64(0),
            Self::True => Scalar::Bool(true),
            Self::False => Scalar::Bool(false),
        }
    }
}

/// Single-stat scan over one field.
pub type DedicatedFn = fn(&Field, NullValueMode) -> Scalar;

#[derive(Debug, Clone, Copy)]
pub struct ReducerSpec {
    pub id: ReducerId,
    pub aliases: &'static [&'static str],
    pub label: &'static str,
    pub description: &'static str,
    pub empty_input_result: EmptyResult,
    /// Computed by the shared standard pass.
    pub standard: bool,
    pub dedicated: Option<DedicatedFn>,
}

impl ReducerSpec {
    fn matches(&self, name: &str) -> bool {
        self.id.as_str() == name || self.aliases.contains(&name)
    }
}

pub static REDUCERS: &[ReducerSpec] = &[
    ReducerSpec {
        id: ReducerId::LastNotNull,
        aliases: &[],
        label: "Last *",
        description: "Last non-null value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: Some(last_not_null_value),
    },
    ReducerSpec {
        id: ReducerId::Last,
        aliases: &[],
        label: "Last",
        description: "Last value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: Some(last_value),
    },
    ReducerSpec {
        id: ReducerId::FirstNotNull,
        aliases: &[],
        label: "First *",
        description: "First non-null value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: Some(first_not_null_value),
    },
    ReducerSpec {
        id: ReducerId::First,
        aliases: &[],
        label: "First",
        description: "First value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: Some(first_value),
    },
    ReducerSpec {
        id: ReducerId::Min,
        aliases: &[],
        label: "Min",
        description: "Minimum value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Max,
        aliases: &[],
        label: "Max",
        description: "Maximum value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Mean,
        aliases: &["avg"],
        label: "Mean",
        description: "Average value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Sum,
        aliases: &["total"],
        label: "Total",
        description: "The sum of all values",
        empty_input_result: EmptyResult::Zero,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Count,
        aliases: &[],
        label: "Count",
        description: "Number of values in response",
        empty_input_result: EmptyResult::Zero,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Range,
        aliases: &[],
        label: "Range",
        description: "Difference between minimum and maximum values",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Delta,
        aliases: &[],
        label: "Delta",
        description: "Cumulative change in value",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Step,
        aliases: &[],
        label: "Step",
        description: "Minimum interval between values",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Diff,
        aliases: &[],
        label: "Difference",
        description: "Difference between first and last values",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::Logmin,
        aliases: &[],
        label: "Min (above zero)",
        description: "Smallest value greater than zero",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::AllIsZero,
        aliases: &[],
        label: "All Zeros",
        description: "All values are zero",
        empty_input_result: EmptyResult::False,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::AllIsNull,
        aliases: &[],
        label: "All Nulls",
        description: "All values are null",
        empty_input_result: EmptyResult::True,
        standard: true,
        dedicated: None,
    },
    ReducerSpec {
        id: ReducerId::ChangeCount,
        aliases: &[],
        label: "Change Count",
        description: "Number of times the value changes",
        empty_input_result: EmptyResult::Null,
        standard: false,
        dedicated: Some(change_count),
    },
    ReducerSpec {
        id: ReducerId::DistinctCount,
        aliases: &[],
        label: "Distinct Count",
        description: "Number of distinct values",
        empty_input_result: EmptyResult::Null,
        standard: false,
        dedicated: Some(distinct_count),
    },
    ReducerSpec {
        id: ReducerId::Diffperc,
        aliases: &[],
        label: "Difference percent",
        description: "Percentage difference between first and last values",
        empty_input_result: EmptyResult::Null,
        standard: true,
        dedicated: None,
    },
];

/// Find a reducer by id or alias.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static ReducerSpec> {
    REDUCERS.iter().find(|spec| spec.matches(name))
}

/// Resolve names in order. Unknown names are skipped and, when `not_found` is
/// given, appended to it.
pub fn resolve<S: AsRef<str>>(
    names: &[S],
    mut not_found: Option<&mut Vec<String>>,
) -> Vec<&'static ReducerSpec> {
    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        match lookup(name) {
            Some(spec) => out.push(spec),
            None => {
                warn!(reducer = name, "unknown reducer name");
                if let Some(list) = not_found.as_deref_mut() {
                    list.push(name.to_owned());
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Samples
// ---------------------------------------------------------------------------

static ZERO: Scalar = Scalar::Int64(0);

/// One row of a field after null handling.
#[derive(Debug, Clone, Copy)]
struct Sample<'a> {
    /// `None` for a missing cell that passed through.
    value: Option<&'a Scalar>,
    number: Option<f64>,
    is_final_row: bool,
}

fn samples(field: &Field, mode: NullValueMode) -> impl Iterator<Item = Sample<'_>> {
    let last_row = field.len().saturating_sub(1);
    field
        .values()
        .iter()
        .enumerate()
        .filter_map(move |(row, value)| {
            let is_final_row = row == last_row;
            if !value.is_missing() {
                return Some(Sample {
                    value: Some(value),
                    number: value.as_number(),
                    is_final_row,
                });
            }
            match mode {
                NullValueMode::Ignore => None,
                NullValueMode::AsZero => Some(Sample {
                    value: Some(&ZERO),
                    number: Some(0.0),
                    is_final_row,
                }),
                NullValueMode::Default => Some(Sample {
                    value: None,
                    number: None,
                    is_final_row,
                }),
            }
        })
}

fn number_or_null(value: Option<f64>) -> Scalar {
    value.map_or(Scalar::NULL, Scalar::Float64)
}

fn cell_or_null(value: Option<&Scalar>) -> Scalar {
    value.cloned().unwrap_or(Scalar::NULL)
}

// ---------------------------------------------------------------------------
// Standard pass
// ---------------------------------------------------------------------------

/// Reduced statistics for one field, keyed by reducer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldCalcs {
    values: HashMap<ReducerId, Scalar>,
}

impl FieldCalcs {
    #[must_use]
    pub fn get(&self, id: ReducerId) -> Option<&Scalar> {
        self.values.get(&id)
    }

    fn set(&mut self, id: ReducerId, value: Scalar) {
        self.values.insert(id, value);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A piece of the standard pass. Units start from `Default`, see every
/// sample once and write their results at the end.
trait FoldUnit<'a>: Default {
    fn step(&mut self, sample: Sample<'a>);
    fn finish(self, calcs: &mut FieldCalcs);
}

struct Totals {
    sum: f64,
    count: i64,
    numeric_count: usize,
    all_null: bool,
    all_zero: bool,
}

impl Default for Totals {
    fn default() -> Self {
        Self {
            sum: 0.0,
            count: 0,
            numeric_count: 0,
            all_null: true,
            all_zero: true,
        }
    }
}

impl<'a> FoldUnit<'a> for Totals {
    fn step(&mut self, sample: Sample<'a>) {
        if sample.value.is_none() {
            return;
        }
        self.count += 1;
        self.all_null = false;
        if sample.number != Some(0.0) {
            self.all_zero = false;
        }
        if let Some(v) = sample.number {
            self.sum += v;
            self.numeric_count += 1;
        }
    }

    fn finish(self, calcs: &mut FieldCalcs) {
        calcs.set(ReducerId::Sum, Scalar::Float64(self.sum));
        calcs.set(ReducerId::Count, Scalar::Int64(self.count));
        let mean = (self.numeric_count > 0).then(|| self.sum / self.numeric_count as f64);
        calcs.set(ReducerId::Mean, number_or_null(mean));
        calcs.set(ReducerId::AllIsNull, Scalar::Bool(self.all_null));
        calcs.set(
            ReducerId::AllIsZero,
            Scalar::Bool(self.all_zero && !self.all_null),
        );
    }
}

#[derive(Default)]
struct Extremes {
    min: Option<f64>,
    max: Option<f64>,
    logmin: Option<f64>,
}

impl<'a> FoldUnit<'a> for Extremes {
    fn step(&mut self, sample: Sample<'a>) {
        let Some(v) = sample.number else {
            return;
        };
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
        if v > 0.0 {
            self.logmin = Some(self.logmin.map_or(v, |m| m.min(v)));
        }
    }

    fn finish(self, calcs: &mut FieldCalcs) {
        calcs.set(ReducerId::Min, number_or_null(self.min));
        calcs.set(ReducerId::Max, number_or_null(self.max));
        calcs.set(ReducerId::Logmin, number_or_null(self.logmin));
        let range = self.min.zip(self.max).map(|(min, max)| max - min);
        calcs.set(ReducerId::Range, number_or_null(range));
    }
}

/// First and most recent present cells. A trailing missing cell never
/// replaces `last`.
#[derive(Default)]
struct Ends<'a> {
    first: Option<&'a Scalar>,
    last: Option<&'a Scalar>,
}

impl<'a> FoldUnit<'a> for Ends<'a> {
    fn step(&mut self, sample: Sample<'a>) {
        if let Some(value) = sample.value {
            self.first.get_or_insert(value);
            self.last = Some(value);
        }
    }

    fn finish(self, calcs: &mut FieldCalcs) {
        let first = self.first.and_then(Scalar::as_number);
        let last = self.last.and_then(Scalar::as_number);
        let diff = first.zip(last).map(|(first, last)| last - first);
        let diffperc = first
            .zip(diff)
            .filter(|(first, _)| *first != 0.0)
            .map(|(first, diff)| diff / first);

        calcs.set(ReducerId::First, cell_or_null(self.first));
        calcs.set(ReducerId::FirstNotNull, cell_or_null(self.first));
        calcs.set(ReducerId::Last, cell_or_null(self.last));
        calcs.set(ReducerId::LastNotNull, cell_or_null(self.last));
        calcs.set(ReducerId::Diff, number_or_null(diff));
        calcs.set(ReducerId::Diffperc, number_or_null(diffperc));
    }
}

/// Counter-style motion between consecutive numeric samples.
struct Motion {
    previous: Option<f64>,
    step: f64,
    delta: f64,
    increasing: bool,
}

impl Default for Motion {
    fn default() -> Self {
        Self {
            previous: None,
            step: 0.0,
            delta: 0.0,
            increasing: true,
        }
    }
}

impl<'a> FoldUnit<'a> for Motion {
    fn step(&mut self, sample: Sample<'a>) {
        let Some(current) = sample.number else {
            return;
        };
        if let Some(previous) = self.previous {
            let change = current - previous;
            if change < self.step {
                self.step = change;
            }
            if current < previous {
                // Counter reset.
                self.increasing = false;
                if sample.is_final_row {
                    self.delta += current;
                }
            } else {
                self.delta += if self.increasing { change } else { current };
                self.increasing = true;
            }
        }
        self.previous = Some(current);
    }

    fn finish(self, calcs: &mut FieldCalcs) {
        calcs.set(ReducerId::Step, Scalar::Float64(self.step));
        calcs.set(ReducerId::Delta, Scalar::Float64(self.delta));
    }
}

/// Every standard statistic in one scan over `field`.
#[must_use]
pub fn standard_calcs(field: &Field, mode: NullValueMode) -> FieldCalcs {
    let mut totals = Totals::default();
    let mut extremes = Extremes::default();
    let mut ends = Ends::default();
    let mut motion = Motion::default();

    for sample in samples(field, mode) {
        totals.step(sample);
        extremes.step(sample);
        ends.step(sample);
        motion.step(sample);
    }

    let mut calcs = FieldCalcs::default();
    totals.finish(&mut calcs);
    extremes.finish(&mut calcs);
    ends.finish(&mut calcs);
    motion.finish(&mut calcs);
    calcs
}

// ---------------------------------------------------------------------------
// Dedicated scans
// ---------------------------------------------------------------------------

fn first_value(field: &Field, mode: NullValueMode) -> Scalar {
    cell_or_null(samples(field, mode).find_map(|s| s.value))
}

fn first_not_null_value(field: &Field, mode: NullValueMode) -> Scalar {
    first_value(field, mode)
}

fn last_value(field: &Field, mode: NullValueMode) -> Scalar {
    cell_or_null(samples(field, mode).filter_map(|s| s.value).last())
}

fn last_not_null_value(field: &Field, mode: NullValueMode) -> Scalar {
    last_value(field, mode)
}

fn same_cell(left: Option<&Scalar>, right: Option<&Scalar>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(l), Some(r)) => l.semantic_eq(r),
        _ => false,
    }
}

fn change_count(field: &Field, mode: NullValueMode) -> Scalar {
    let mut changes = 0_i64;
    let mut previous: Option<Option<&Scalar>> = None;
    for sample in samples(field, mode) {
        if let Some(prev) = previous
            && !same_cell(prev, sample.value)
        {
            changes += 1;
        }
        previous = Some(sample.value);
    }
    Scalar::Int64(changes)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DistinctKey<'a> {
    Missing,
    Bool(bool),
    NumberBits(u64),
    Utf8(&'a str),
}

impl<'a> DistinctKey<'a> {
    fn from_sample(sample: Sample<'a>) -> Self {
        if let Some(n) = sample.number {
            // -0.0 and 0.0 are one value.
            return Self::NumberBits(if n == 0.0 { 0.0_f64.to_bits() } else { n.to_bits() });
        }
        match sample.value {
            None => Self::Missing,
            Some(Scalar::Bool(v)) => Self::Bool(*v),
            Some(Scalar::Utf8(v)) => Self::Utf8(v.as_str()),
            Some(_) => Self::Missing,
        }
    }
}

fn distinct_count(field: &Field, mode: NullValueMode) -> Scalar {
    let distinct: HashSet<DistinctKey<'_>> =
        samples(field, mode).map(DistinctKey::from_sample).collect();
    Scalar::Int64(distinct.len() as i64)
}

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

/// Compute `reducers` over one field.
///
/// A single reducer with a dedicated scan runs only that scan. Otherwise the
/// standard pass runs once (when any standard reducer is requested) and the
/// remaining reducers run their dedicated scans after it.
#[must_use]
pub fn reduce_field(field: &Field, reducers: &[&ReducerSpec], mode: NullValueMode) -> FieldCalcs {
    let mut calcs = FieldCalcs::default();
    if field.is_empty() {
        for spec in reducers {
            calcs.set(spec.id, spec.empty_input_result.to_scalar());
        }
        return calcs;
    }

    if let [only] = reducers
        && let Some(scan) = only.dedicated
    {
        calcs.set(only.id, scan(field, mode));
        return calcs;
    }

    if reducers.iter().any(|spec| spec.standard) {
        calcs = standard_calcs(field, mode);
    }
    for spec in reducers.iter().filter(|spec| !spec.standard) {
        if let Some(scan) = spec.dedicated {
            calcs.set(spec.id, scan(field, mode));
        }
    }
    calcs
}

/// Reduce the selected columns of `table` to one single-row table per
/// resolved stat, in request order. Unknown stat names are skipped.
pub fn reduce_table(table: &Table, options: &ReducerOptions) -> Result<Vec<Table>, ReduceError> {
    reduce_table_with_not_found(table, options, None)
}

#[instrument(
    skip(table, options, not_found),
    fields(rows = table.len(), columns = table.width(), stats = options.stats.len())
)]
pub fn reduce_table_with_not_found(
    table: &Table,
    options: &ReducerOptions,
    not_found: Option<&mut Vec<String>>,
) -> Result<Vec<Table>, ReduceError> {
    let selected = select_columns(table, options.column_indexes.as_deref())?;
    let reducers = resolve(&options.stats, not_found);

    let fast_path = matches!(reducers.as_slice(), [only] if only.dedicated.is_some());
    debug!(
        selected = selected.len(),
        resolved = reducers.len(),
        empty = table.is_empty(),
        fast_path,
        "reducing table"
    );

    let per_column: Vec<FieldCalcs> = selected
        .iter()
        .map(|field| reduce_field(field, &reducers, options.null_value_mode))
        .collect();

    reducers
        .iter()
        .map(|spec| -> Result<Table, ReduceError> {
            let fields = selected
                .iter()
                .zip(&per_column)
                .map(|(field, calcs)| {
                    let value = calcs
                        .get(spec.id)
                        .cloned()
                        .unwrap_or_else(|| spec.empty_input_result.to_scalar());
                    field.with_single_value(value)
                })
                .collect();
            Ok(Table::new(fields)?.with_name(Some(spec.id.as_str().to_owned())))
        })
        .collect()
}

fn select_columns<'a>(
    table: &'a Table,
    indexes: Option<&[usize]>,
) -> Result<Vec<&'a Field>, ReduceError> {
    match indexes {
        None => Ok(table.fields().iter().collect()),
        Some(indexes) => indexes
            .iter()
            .map(|&index| {
                table
                    .field(index)
                    .ok_or(ReduceError::InvalidColumnSelection { index })
            })
            .collect(),
    }
}
