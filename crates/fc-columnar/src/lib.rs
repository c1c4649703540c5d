#![forbid(unsafe_code)]

use fc_types::{FieldType, Scalar, TypeError, check_field_value, parse_lenient_f64, round_decimals};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Display and null-substitution settings carried alongside a field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Text shown (and, for histograms, substituted) where a value is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decimals: Option<u32>,
}

impl FieldConfig {
    /// The no-value sentinel, when it parses as a number.
    #[must_use]
    pub fn numeric_no_value(&self) -> Option<f64> {
        self.no_value.as_deref().and_then(parse_lenient_f64)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FieldError {
    #[error("field {name:?}: {source}")]
    Type {
        name: String,
        #[source]
        source: TypeError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    name: String,
    #[serde(rename = "type")]
    field_type: FieldType,
    values: Vec<Scalar>,
    #[serde(default)]
    config: FieldConfig,
    /// Id of a formatter in a [`DisplayRegistry`]; resolved by the consumer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    display: Option<String>,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        field_type: FieldType,
        values: Vec<Scalar>,
    ) -> Result<Self, FieldError> {
        let name = name.into();
        for value in &values {
            check_field_value(field_type, value).map_err(|source| FieldError::Type {
                name: name.clone(),
                source,
            })?;
        }
        Ok(Self {
            name,
            field_type,
            values,
            config: FieldConfig::default(),
            display: None,
        })
    }

    /// Number field from plain optional floats; `None` becomes null.
    #[must_use]
    pub fn numbers(name: impl Into<String>, values: impl IntoIterator<Item = Option<f64>>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Number,
            values: values.into_iter().map(Scalar::from).collect(),
            config: FieldConfig::default(),
            display: None,
        }
    }

    #[must_use]
    pub fn integers(name: impl Into<String>, values: impl IntoIterator<Item = i64>) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Number,
            values: values.into_iter().map(Scalar::Int64).collect(),
            config: FieldConfig::default(),
            display: None,
        }
    }

    /// One-cell field with this field's name, config and display. The field
    /// type is kept when `value` fits it and follows the value otherwise.
    #[must_use]
    pub fn with_single_value(&self, value: Scalar) -> Self {
        let field_type = if check_field_value(self.field_type, &value).is_ok() {
            self.field_type
        } else {
            value.natural_type().unwrap_or(FieldType::Other)
        };
        Self {
            name: self.name.clone(),
            field_type,
            values: vec![value],
            config: self.config.clone(),
            display: self.display.clone(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: FieldConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_display(mut self, display: Option<String>) -> Self {
        self.display = display;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    #[must_use]
    pub fn is_number(&self) -> bool {
        self.field_type == FieldType::Number
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn config(&self) -> &FieldConfig {
        &self.config
    }

    #[must_use]
    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.field_type == other.field_type
            && self.values.len() == other.values.len()
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(left, right)| left.semantic_eq(right))
    }
}

// ---------------------------------------------------------------------------
// Display processors
// ---------------------------------------------------------------------------

pub type FormatFn = fn(f64, Option<u32>) -> String;

#[derive(Debug, Clone, Copy)]
pub struct DisplayProcessor {
    pub id: &'static str,
    /// Unit ids this processor renders.
    pub units: &'static [&'static str],
    pub format: FormatFn,
}

fn format_fixed(value: f64, decimals: Option<u32>) -> String {
    match decimals {
        Some(d) => format!("{:.*}", d as usize, round_decimals(value, d)),
        None => value.to_string(),
    }
}

fn format_percent(value: f64, decimals: Option<u32>) -> String {
    format!("{}%", format_fixed(value, decimals))
}

fn format_percent_unit(value: f64, decimals: Option<u32>) -> String {
    format!("{}%", format_fixed(value * 100.0, decimals))
}

fn format_bytes(value: f64, decimals: Option<u32>) -> String {
    const STEPS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut scaled = value;
    let mut step = 0;
    while scaled.abs() >= 1024.0 && step < STEPS.len() - 1 {
        scaled /= 1024.0;
        step += 1;
    }
    format!("{} {}", format_fixed(scaled, decimals.or(Some(1))), STEPS[step])
}

fn format_seconds(value: f64, decimals: Option<u32>) -> String {
    format!("{} s", format_fixed(value, decimals))
}

fn format_millis(value: f64, decimals: Option<u32>) -> String {
    format!("{} ms", format_fixed(value, decimals))
}

const BUILTIN_PROCESSORS: &[DisplayProcessor] = &[
    DisplayProcessor {
        id: "none",
        units: &["none", "short"],
        format: format_fixed,
    },
    DisplayProcessor {
        id: "percent",
        units: &["percent"],
        format: format_percent,
    },
    DisplayProcessor {
        id: "percentunit",
        units: &["percentunit"],
        format: format_percent_unit,
    },
    DisplayProcessor {
        id: "bytes",
        units: &["bytes", "decbytes"],
        format: format_bytes,
    },
    DisplayProcessor {
        id: "s",
        units: &["s", "seconds"],
        format: format_seconds,
    },
    DisplayProcessor {
        id: "ms",
        units: &["ms", "milliseconds"],
        format: format_millis,
    },
];

/// Formatting capabilities referenced by id from [`Field::display`].
#[derive(Debug, Clone)]
pub struct DisplayRegistry {
    processors: Vec<DisplayProcessor>,
}

impl Default for DisplayRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DisplayRegistry {
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            processors: BUILTIN_PROCESSORS.to_vec(),
        }
    }

    pub fn register(&mut self, processor: DisplayProcessor) {
        self.processors.retain(|p| p.id != processor.id);
        self.processors.push(processor);
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DisplayProcessor> {
        self.processors.iter().find(|p| p.id == id)
    }

    /// Pick the processor id for a field config; unitless fields get `none`.
    #[must_use]
    pub fn resolve_for(&self, config: &FieldConfig) -> Option<&'static str> {
        let unit = config.unit.as_deref().unwrap_or("none");
        self.processors
            .iter()
            .find(|p| p.units.contains(&unit))
            .map(|p| p.id)
    }

    /// Format one cell of `field` through its display tag.
    #[must_use]
    pub fn format(&self, field: &Field, idx: usize) -> Option<String> {
        let value = field.value(idx)?;
        let Some(number) = value.as_number() else {
            return field.config().no_value.clone();
        };
        let processor = field.display().and_then(|id| self.get(id))?;
        Some((processor.format)(number, field.config().decimals))
    }
}

#[cfg(test)]
mod tests {
    use fc_types::{FieldType, Scalar};

    use super::{DisplayProcessor, DisplayRegistry, Field, FieldConfig};

    #[test]
    fn field_rejects_values_of_the_wrong_type() {
        let err = Field::new(
            "cpu",
            FieldType::Number,
            vec![Scalar::Float64(1.0), Scalar::Utf8("high".into())],
        )
        .expect_err("string in number field");
        assert!(err.to_string().starts_with("field \"cpu\""));
    }

    #[test]
    fn numbers_constructor_maps_none_to_null() {
        let field = Field::numbers("x", [Some(1.0), None]);
        assert_eq!(field.values(), &[Scalar::Float64(1.0), Scalar::NULL]);
        assert!(field.is_number());
    }

    #[test]
    fn single_value_keeps_type_only_when_it_fits() {
        let host = Field::new("host", FieldType::String, vec!["a".into()]).expect("field");
        let first = host.with_single_value(Scalar::Utf8("a".into()));
        assert_eq!(first.field_type(), FieldType::String);
        let count = host.with_single_value(Scalar::Int64(1));
        assert_eq!(count.field_type(), FieldType::Number);
        assert_eq!(count.name(), "host");
        assert_eq!(host.with_single_value(Scalar::NULL).field_type(), FieldType::String);
    }

    #[test]
    fn numeric_no_value_requires_a_number() {
        let numeric = FieldConfig {
            no_value: Some("-1".into()),
            ..FieldConfig::default()
        };
        let text = FieldConfig {
            no_value: Some("N/A".into()),
            ..FieldConfig::default()
        };
        assert_eq!(numeric.numeric_no_value(), Some(-1.0));
        assert_eq!(text.numeric_no_value(), None);
    }

    #[test]
    fn config_serializes_camel_case() {
        let config: FieldConfig =
            serde_json::from_str(r#"{"unit":"ms","noValue":"0","decimals":2}"#).expect("config");
        assert_eq!(config.unit.as_deref(), Some("ms"));
        assert_eq!(config.no_value.as_deref(), Some("0"));
        assert_eq!(config.decimals, Some(2));
    }

    #[test]
    fn registry_resolves_by_unit_and_formats() {
        let registry = DisplayRegistry::builtin();
        let config = FieldConfig {
            unit: Some("percent".into()),
            decimals: Some(1),
            ..FieldConfig::default()
        };
        assert_eq!(registry.resolve_for(&config), Some("percent"));
        assert_eq!(registry.resolve_for(&FieldConfig::default()), Some("none"));

        let field = Field::numbers("load", [Some(12.34), None])
            .with_config(config)
            .with_display(Some("percent".into()));
        assert_eq!(registry.format(&field, 0).as_deref(), Some("12.3%"));
        assert_eq!(registry.format(&field, 1), None);
    }

    #[test]
    fn bytes_processor_scales_units() {
        let registry = DisplayRegistry::builtin();
        let field = Field::numbers("mem", [Some(2048.0)]).with_display(Some("bytes".into()));
        assert_eq!(registry.format(&field, 0).as_deref(), Some("2.0 KiB"));
    }

    #[test]
    fn registered_processor_replaces_builtin_with_same_id() {
        fn celsius(value: f64, _: Option<u32>) -> String {
            format!("{value}°C")
        }
        let mut registry = DisplayRegistry::builtin();
        registry.register(DisplayProcessor {
            id: "none",
            units: &["celsius"],
            format: celsius,
        });
        let config = FieldConfig {
            unit: Some("celsius".into()),
            ..FieldConfig::default()
        };
        assert_eq!(registry.resolve_for(&config), Some("none"));
        assert_eq!(registry.resolve_for(&FieldConfig::default()), None);

        let field = Field::numbers("temp", [Some(21.5)]).with_display(Some("none".into()));
        assert_eq!(registry.format(&field, 0).as_deref(), Some("21.5°C"));
    }
}
