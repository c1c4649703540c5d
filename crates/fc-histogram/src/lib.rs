#![forbid(unsafe_code)]

use std::collections::HashMap;

use fc_columnar::{DisplayRegistry, Field, FieldConfig};
use fc_frame::{FrameError, FrameTag, Table};
use fc_join::{AxisKey, KeyedSeries, outer_join};
use fc_types::{Scalar, deserialize_lenient_f64, fractional_digits, round_decimals};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

pub const DEFAULT_BUCKET_COUNT: usize = 30;
pub const BUCKET_MIN_FIELD: &str = "xMin";
pub const BUCKET_MAX_FIELD: &str = "xMax";
pub const COMBINED_COUNT_FIELD: &str = "count";

/// Bucket keys are rounded to this many decimals to absorb float noise.
const BUCKET_KEY_DECIMALS: u32 = 9;

/// Ascending catalog of "nice" bucket widths: {1, 2, 2.5, 4, 5} per decade.
pub const NICE_BUCKET_SIZES: [f64; 95] = [
    1.0e-9, 2.0e-9, 2.5e-9, 4.0e-9, 5.0e-9,
    1.0e-8, 2.0e-8, 2.5e-8, 4.0e-8, 5.0e-8,
    1.0e-7, 2.0e-7, 2.5e-7, 4.0e-7, 5.0e-7,
    1.0e-6, 2.0e-6, 2.5e-6, 4.0e-6, 5.0e-6,
    1.0e-5, 2.0e-5, 2.5e-5, 4.0e-5, 5.0e-5,
    1.0e-4, 2.0e-4, 2.5e-4, 4.0e-4, 5.0e-4,
    1.0e-3, 2.0e-3, 2.5e-3, 4.0e-3, 5.0e-3,
    1.0e-2, 2.0e-2, 2.5e-2, 4.0e-2, 5.0e-2,
    1.0e-1, 2.0e-1, 2.5e-1, 4.0e-1, 5.0e-1,
    1.0e0, 2.0e0, 2.5e0, 4.0e0, 5.0e0,
    1.0e1, 2.0e1, 2.5e1, 4.0e1, 5.0e1,
    1.0e2, 2.0e2, 2.5e2, 4.0e2, 5.0e2,
    1.0e3, 2.0e3, 2.5e3, 4.0e3, 5.0e3,
    1.0e4, 2.0e4, 2.5e4, 4.0e4, 5.0e4,
    1.0e5, 2.0e5, 2.5e5, 4.0e5, 5.0e5,
    1.0e6, 2.0e6, 2.5e6, 4.0e6, 5.0e6,
    1.0e7, 2.0e7, 2.5e7, 4.0e7, 5.0e7,
    1.0e8, 2.0e8, 2.5e8, 4.0e8, 5.0e8,
    1.0e9, 2.0e9, 2.5e9, 4.0e9, 5.0e9,
];

fn default_bucket_count() -> usize {
    DEFAULT_BUCKET_COUNT
}

/// Histogram transformer options.
///
/// `bucketSize` and `bucketOffset` accept numbers or numeric strings; anything
/// unparseable is treated as unset, so sizing falls back to auto-detection and
/// the offset to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramOptions {
    #[serde(default = "default_bucket_count")]
    pub bucket_count: usize,
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub bucket_size: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_lenient_f64")]
    pub bucket_offset: Option<f64>,
    #[serde(default)]
    pub combine: bool,
}

impl Default for HistogramOptions {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            bucket_size: None,
            bucket_offset: None,
            combine: false,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HistogramError {
    #[error("histogram field {name:?} has {actual} rows, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ---------------------------------------------------------------------------
// Bucket sizing
// ---------------------------------------------------------------------------

/// Pick a bucket width for `values`.
///
/// A positive finite `explicit_size` always wins. Otherwise the first catalog
/// width that covers both `range / target_bucket_count` and the smallest
/// non-zero gap between sorted values is chosen. A lone value (or a set of
/// identical values) has no gap, so the gap is taken as 1. Returns `None` for
/// an empty input.
#[must_use]
pub fn choose_bucket_size(
    values: &[f64],
    target_bucket_count: usize,
    explicit_size: Option<f64>,
) -> Option<f64> {
    if let Some(size) = explicit_size.filter(|s| s.is_finite() && *s > 0.0) {
        return Some(size);
    }

    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let smallest_delta = sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|delta| *delta != 0.0)
        .fold(f64::INFINITY, f64::min);
    let smallest_delta = if smallest_delta.is_finite() {
        smallest_delta
    } else {
        1.0
    };

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let target_size = (max - min) / target_bucket_count.max(1) as f64;

    let size = NICE_BUCKET_SIZES
        .iter()
        .copied()
        .find(|size| *size >= target_size && *size >= smallest_delta)
        .unwrap_or_else(|| target_size.max(smallest_delta));
    Some(size)
}

// ---------------------------------------------------------------------------
// Bucketing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketCount {
    pub value: f64,
    pub count: u64,
}

/// Lower bound of the bucket holding `value`.
#[must_use]
pub fn bucket_of(value: f64, bucket_size: f64, offset: f64) -> f64 {
    let floored = ((value - offset) / bucket_size).floor() * bucket_size;
    round_decimals(floored + offset, BUCKET_KEY_DECIMALS)
}

/// Count values per bucket, ascending by bucket. Missing values never count;
/// buckets listed in `drop_buckets` are removed from the result.
#[must_use]
pub fn bucketize(
    values: &[Option<f64>],
    bucket_size: f64,
    offset: f64,
    drop_buckets: &[f64],
) -> Vec<BucketCount> {
    let mut counts = HashMap::<AxisKey, u64>::new();
    for value in values.iter().flatten() {
        let Some(key) = AxisKey::new(bucket_of(*value, bucket_size, offset)) else {
            continue;
        };
        *counts.entry(key).or_insert(0) += 1;
    }

    let dropped: Vec<AxisKey> = drop_buckets.iter().copied().filter_map(AxisKey::new).collect();
    let mut out: Vec<(AxisKey, u64)> = counts
        .into_iter()
        .filter(|(key, _)| !dropped.contains(key))
        .collect();
    out.sort_by_key(|(key, _)| *key);

    out.into_iter()
        .map(|(key, count)| BucketCount {
            value: key.get(),
            count,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Histogram assembly
// ---------------------------------------------------------------------------

/// Bucket bounds plus one count field per contributing series (or one
/// combined count field). All fields share one length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramResult {
    x_min: Field,
    x_max: Field,
    counts: Vec<Field>,
}

impl<'de> Deserialize<'de> for HistogramResult {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            x_min: Field,
            x_max: Field,
            #[serde(default)]
            counts: Vec<Field>,
        }
        let raw = Raw::deserialize(deserializer)?;
        Self::new(raw.x_min, raw.x_max, raw.counts).map_err(serde::de::Error::custom)
    }
}

impl HistogramResult {
    pub fn new(x_min: Field, x_max: Field, counts: Vec<Field>) -> Result<Self, HistogramError> {
        let expected = x_min.len();
        for field in std::iter::once(&x_max).chain(&counts) {
            if field.len() != expected {
                return Err(HistogramError::LengthMismatch {
                    name: field.name().to_owned(),
                    expected,
                    actual: field.len(),
                });
            }
        }
        Ok(Self {
            x_min,
            x_max,
            counts,
        })
    }

    #[must_use]
    pub fn x_min(&self) -> &Field {
        &self.x_min
    }

    #[must_use]
    pub fn x_max(&self) -> &Field {
        &self.x_max
    }

    #[must_use]
    pub fn counts(&self) -> &[Field] {
        &self.counts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.x_min.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x_min.is_empty()
    }

    /// Table tagged as a histogram: `[xMin, xMax, counts...]`.
    pub fn to_table(&self) -> Result<Table, HistogramError> {
        let mut fields = Vec::with_capacity(self.counts.len() + 2);
        fields.push(self.x_min.clone());
        fields.push(self.x_max.clone());
        fields.extend(self.counts.iter().cloned());
        Ok(Table::new(fields)?.with_meta(Some(FrameTag::Histogram)))
    }

    /// Recover a histogram from a table with `xMin`/`xMax` number fields.
    /// Every other number field is a count field.
    #[must_use]
    pub fn from_table(table: &Table) -> Option<Self> {
        let x_min = table.field_by_name(BUCKET_MIN_FIELD).filter(|f| f.is_number())?;
        let x_max = table.field_by_name(BUCKET_MAX_FIELD).filter(|f| f.is_number())?;
        let counts = table
            .number_fields()
            .filter(|f| f.name() != BUCKET_MIN_FIELD && f.name() != BUCKET_MAX_FIELD)
            .cloned()
            .collect();
        Self::new(x_min.clone(), x_max.clone(), counts).ok()
    }
}

/// A number field after null preprocessing, ready for bucketing.
struct SeriesInput<'a> {
    source: &'a Field,
    values: Vec<f64>,
}

/// Nulls become the field's numeric no-value sentinel when it has one and are
/// dropped otherwise.
fn preprocess_field(field: &Field) -> Vec<f64> {
    let substitute = field.config().numeric_no_value();
    field
        .values()
        .iter()
        .filter_map(|value| value.as_number().or(substitute))
        .collect()
}

#[must_use]
pub fn build_histogram(tables: &[Table], options: &HistogramOptions) -> Option<HistogramResult> {
    build_histogram_with_registry(tables, options, &DisplayRegistry::builtin())
}

/// Build one histogram across every number field of every table.
///
/// Returns `None` when the tables hold no number field at all.
#[instrument(skip(tables, options, registry), fields(tables = tables.len(), combine = options.combine))]
pub fn build_histogram_with_registry(
    tables: &[Table],
    options: &HistogramOptions,
    registry: &DisplayRegistry,
) -> Option<HistogramResult> {
    let inputs: Vec<SeriesInput<'_>> = tables
        .iter()
        .flat_map(Table::number_fields)
        .map(|source| SeriesInput {
            source,
            values: preprocess_field(source),
        })
        .collect();

    if inputs.is_empty() {
        debug!("no number fields; histogram skipped");
        return None;
    }

    let pooled: Vec<f64> = inputs.iter().flat_map(|s| s.values.iter().copied()).collect();
    // No values at all means no rows; the width is then never observable.
    let bucket_size =
        choose_bucket_size(&pooled, options.bucket_count, options.bucket_size).unwrap_or(1.0);
    let bucket_offset = options.bucket_offset.unwrap_or(0.0);
    debug!(
        bucket_size,
        bucket_offset,
        explicit = options.bucket_size.is_some(),
        values = pooled.len(),
        "bucket size chosen"
    );

    let per_series: Vec<KeyedSeries<u64>> = inputs
        .iter()
        .map(|input| {
            let values: Vec<Option<f64>> = input.values.iter().copied().map(Some).collect();
            KeyedSeries::from_pairs(
                bucketize(&values, bucket_size, bucket_offset, &[])
                    .into_iter()
                    .map(|b| (b.value, b.count)),
            )
        })
        .collect();

    let joined = outer_join(&per_series);
    let filled: Vec<Vec<i64>> = joined
        .aligned
        .iter()
        .map(|column| {
            column
                .iter()
                .map(|count| count.map_or(0, |c| c as i64))
                .collect()
        })
        .collect();

    let bound_config = FieldConfig {
        unit: inputs
            .iter()
            .find_map(|s| s.source.config().unit.clone()),
        no_value: None,
        decimals: Some(fractional_digits(bucket_size)),
    };
    let bound_display = registry.resolve_for(&bound_config).map(str::to_owned);

    let x_min = Field::numbers(BUCKET_MIN_FIELD, joined.axis.iter().copied().map(Some))
        .with_config(bound_config.clone())
        .with_display(bound_display.clone());
    let x_max = Field::numbers(
        BUCKET_MAX_FIELD,
        joined.axis.iter().map(|lo| Some(lo + bucket_size)),
    )
    .with_config(bound_config)
    .with_display(bound_display);

    let counts = if options.combine {
        let mut combined = vec![0_i64; joined.axis.len()];
        for column in &filled {
            for (total, count) in combined.iter_mut().zip(column) {
                *total += count;
            }
        }
        vec![Field::integers(COMBINED_COUNT_FIELD, combined)]
    } else {
        inputs
            .iter()
            .zip(filled)
            .map(|(input, column)| {
                Field::integers(input.source.name(), column)
                    .with_config(input.source.config().clone())
                    .with_display(input.source.display().map(str::to_owned))
            })
            .collect()
    };

    Some(HistogramResult {
        x_min,
        x_max,
        counts,
    })
}

/// Frame-in/frame-out form of [`build_histogram`].
pub fn build_histogram_table(
    tables: &[Table],
    options: &HistogramOptions,
) -> Result<Option<Table>, HistogramError> {
    build_histogram(tables, options)
        .map(|hist| hist.to_table())
        .transpose()
}

/// Align several histograms on their `xMax` bounds.
///
/// `xMin` comes from the first histogram that has a row at each bound; every
/// count field keeps its name and absent rows count as zero.
#[instrument(skip(histograms), fields(histograms = histograms.len()))]
pub fn join_histograms(histograms: &[HistogramResult]) -> Option<HistogramResult> {
    let (first, rest) = histograms.split_first()?;
    if rest.is_empty() {
        return Some(first.clone());
    }

    // Join row positions, then gather every histogram's cells through them.
    let keyed: Vec<KeyedSeries<usize>> = histograms
        .iter()
        .map(|hist| {
            KeyedSeries::from_pairs(
                hist.x_max
                    .values()
                    .iter()
                    .enumerate()
                    .filter_map(|(row, bound)| bound.as_number().map(|b| (b, row))),
            )
        })
        .collect();
    let joined = outer_join(&keyed);

    let x_min_values = (0..joined.axis.len()).map(|pos| {
        histograms
            .iter()
            .zip(&joined.aligned)
            .find_map(|(hist, rows)| {
                rows[pos].and_then(|row| hist.x_min.value(row).and_then(Scalar::as_number))
            })
    });
    let x_min = Field::numbers(BUCKET_MIN_FIELD, x_min_values)
        .with_config(first.x_min.config().clone())
        .with_display(first.x_min.display().map(str::to_owned));
    let x_max = Field::numbers(BUCKET_MAX_FIELD, joined.axis.iter().copied().map(Some))
        .with_config(first.x_max.config().clone())
        .with_display(first.x_max.display().map(str::to_owned));

    let mut counts = Vec::new();
    for (hist, rows) in histograms.iter().zip(&joined.aligned) {
        for count in &hist.counts {
            let values = rows.iter().map(|row| {
                row.and_then(|r| count.value(r).and_then(Scalar::as_number))
                    .map_or(0, |c| c as i64)
            });
            counts.push(
                Field::integers(count.name(), values)
                    .with_config(count.config().clone())
                    .with_display(count.display().map(str::to_owned)),
            );
        }
    }

    debug!(axis_len = joined.axis.len(), counts = counts.len(), "histograms joined");
    Some(HistogramResult {
        x_min,
        x_max,
        counts,
    })
}
