#![forbid(unsafe_code)]

//! End-to-end scenarios across the histogram and reducer pipelines.
//!
//! Each scenario starts from serialized input tables, runs the public entry
//! points and checks the resulting tables the way a consumer would see them.

use fc_columnar::{Field, FieldConfig};
use fc_conformance::{HarnessConfig, run_packet_suite};
use fc_frame::{FrameTag, Table};
use fc_histogram::{
    BUCKET_MAX_FIELD, BUCKET_MIN_FIELD, HistogramOptions, HistogramResult, build_histogram,
    build_histogram_table, join_histograms,
};
use fc_join::{AlignExecutionOptions, KeyedSeries, outer_join, outer_join_with_options};
use fc_reduce::{NullValueMode, ReducerOptions, reduce_table};
use fc_types::{FieldType, Scalar};

fn numbers(field: &Field) -> Vec<f64> {
    field
        .values()
        .iter()
        .map(|v| v.as_number().expect("numeric cell"))
        .collect()
}

fn first_cells(table: &Table) -> Vec<Scalar> {
    table
        .fields()
        .iter()
        .map(|f| f.values()[0].clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario A: unit buckets over 1..=5
// ---------------------------------------------------------------------------

#[test]
fn e2e_scenario_a_unit_buckets() {
    let input = Table::new(vec![Field::numbers(
        "value",
        [1.0, 2.0, 3.0, 4.0, 5.0].map(Some),
    )])
    .expect("input");
    let options = HistogramOptions {
        bucket_size: Some(1.0),
        ..HistogramOptions::default()
    };

    let table = build_histogram_table(&[input], &options)
        .expect("table")
        .expect("histogram");
    assert_eq!(table.meta(), Some(FrameTag::Histogram));
    assert_eq!(table.width(), 3);

    let x_min = table.field_by_name(BUCKET_MIN_FIELD).expect("xMin");
    let x_max = table.field_by_name(BUCKET_MAX_FIELD).expect("xMax");
    assert_eq!(numbers(x_min), vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    assert_eq!(numbers(x_max), vec![2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(numbers(table.field(2).expect("counts")), vec![1.0; 5]);
}

// ---------------------------------------------------------------------------
// Scenario B: first/last/mean over two columns
// ---------------------------------------------------------------------------

#[test]
fn e2e_scenario_b_first_last_mean() {
    let table = Table::from_rows(
        &[("a", FieldType::Number), ("b", FieldType::Number)],
        &[
            vec![Scalar::Int64(10), Scalar::Int64(20)],
            vec![Scalar::Int64(20), Scalar::Int64(30)],
        ],
    )
    .expect("table");

    let rows = reduce_table(
        &table,
        &ReducerOptions {
            column_indexes: Some(vec![0, 1]),
            null_value_mode: NullValueMode::Default,
            stats: vec!["first".into(), "last".into(), "mean".into()],
        },
    )
    .expect("reduce");

    let expect = |idx: usize, left: f64, right: f64| {
        let cells = first_cells(&rows[idx]);
        assert!(cells[0].semantic_eq(&Scalar::Float64(left)), "{cells:?}");
        assert!(cells[1].semantic_eq(&Scalar::Float64(right)), "{cells:?}");
    };
    expect(0, 10.0, 20.0);
    expect(1, 20.0, 30.0);
    expect(2, 15.0, 25.0);
}

// ---------------------------------------------------------------------------
// Scenario C: joining disjoint histograms
// ---------------------------------------------------------------------------

#[test]
fn e2e_scenario_c_join_disjoint_histograms() {
    let options = HistogramOptions {
        bucket_size: Some(1.0),
        ..HistogramOptions::default()
    };
    let low = build_histogram(
        &[Table::new(vec![Field::numbers("low", [Some(1.0), Some(2.2)])]).expect("low")],
        &options,
    )
    .expect("low histogram");
    let high = build_histogram(
        &[Table::new(vec![Field::numbers("high", [Some(7.5)])]).expect("high")],
        &options,
    )
    .expect("high histogram");

    let joined = join_histograms(&[low, high]).expect("joined");
    assert_eq!(numbers(joined.x_min()), vec![1.0, 2.0, 7.0]);
    assert_eq!(numbers(joined.x_max()), vec![2.0, 3.0, 8.0]);
    assert_eq!(numbers(&joined.counts()[0]), vec![1.0, 1.0, 0.0]);
    assert_eq!(numbers(&joined.counts()[1]), vec![0.0, 0.0, 1.0]);
}

// ---------------------------------------------------------------------------
// Scenario D: delta over a counter with one reset
// ---------------------------------------------------------------------------

#[test]
fn e2e_scenario_d_delta_with_counter_reset() {
    let table = Table::new(vec![
        Field::new(
            "requests",
            FieldType::Number,
            [0, 1, 2, 0, 1].into_iter().map(Scalar::Int64).collect(),
        )
        .expect("field"),
    ])
    .expect("table");
    let rows = reduce_table(
        &table,
        &ReducerOptions {
            stats: vec!["delta".into()],
            ..ReducerOptions::default()
        },
    )
    .expect("reduce");
    assert_eq!(first_cells(&rows[0]), vec![Scalar::Float64(3.0)]);
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

#[test]
fn e2e_histogram_round_trips_through_json() {
    let input: Table = serde_json::from_str(
        r#"{"fields":[
            {"name":"latency","type":"number","config":{"unit":"ms"},
             "values":[{"kind":"float64","value":0.1},{"kind":"null","value":"null"},
                       {"kind":"float64","value":0.35}]},
            {"name":"host","type":"string",
             "values":[{"kind":"utf8","value":"a"},{"kind":"utf8","value":"b"},
                       {"kind":"utf8","value":"c"}]}
        ]}"#,
    )
    .expect("input json");

    let options: HistogramOptions =
        serde_json::from_str(r#"{"bucketSize":"0.1"}"#).expect("options json");
    let table = build_histogram_table(&[input], &options)
        .expect("table")
        .expect("histogram");

    let encoded = serde_json::to_string(&table).expect("encode");
    let decoded: Table = serde_json::from_str(&encoded).expect("decode");
    assert!(decoded.semantic_eq(&table));

    let hist = HistogramResult::from_table(&decoded).expect("histogram table");
    assert_eq!(hist.counts().len(), 1);
    assert_eq!(hist.counts()[0].name(), "latency");
    assert_eq!(hist.x_min().config().unit.as_deref(), Some("ms"));
    assert_eq!(hist.x_min().config().decimals, Some(1));
    assert_eq!(numbers(hist.x_min()), vec![0.1, 0.3]);
}

#[test]
fn e2e_reduce_histogram_counts() {
    let input = Table::new(vec![
        Field::numbers("cpu", [Some(0.5), Some(1.5), Some(1.7), None]).with_config(FieldConfig {
            no_value: Some("0".into()),
            ..FieldConfig::default()
        }),
    ])
    .expect("input");
    let options = HistogramOptions {
        bucket_size: Some(1.0),
        ..HistogramOptions::default()
    };
    let hist_table = build_histogram_table(&[input], &options)
        .expect("table")
        .expect("histogram");

    let rows = reduce_table(
        &hist_table,
        &ReducerOptions {
            column_indexes: Some(vec![2]),
            stats: vec!["total".into(), "max".into()],
            ..ReducerOptions::default()
        },
    )
    .expect("reduce counts");
    // Four inputs: the null counts as zero through the no-value sentinel.
    assert_eq!(first_cells(&rows[0]), vec![Scalar::Float64(4.0)]);
    assert_eq!(first_cells(&rows[1]), vec![Scalar::Float64(2.0)]);
}

#[test]
fn e2e_arena_and_heap_alignment_agree() {
    let series = vec![
        KeyedSeries::from_pairs([(3.0, "c"), (1.0, "a")]),
        KeyedSeries::from_pairs([(2.0, "b"), (3.0, "z")]),
    ];
    let arena = outer_join(&series);
    let heap = outer_join_with_options(
        &series,
        AlignExecutionOptions {
            use_arena: false,
            ..AlignExecutionOptions::default()
        },
    );
    assert_eq!(arena, heap);
    assert_eq!(arena.axis, vec![1.0, 2.0, 3.0]);
    assert_eq!(arena.aligned[0], vec![Some("a"), None, Some("c")]);
    assert_eq!(arena.aligned[1], vec![None, Some("b"), Some("z")]);
}

#[test]
fn e2e_packet_fixtures_are_green() {
    let report = run_packet_suite(&HarnessConfig::default_paths()).expect("suite");
    assert!(report.fixture_count >= 20);
    assert!(report.is_green(), "{:?}", report.results);
}
