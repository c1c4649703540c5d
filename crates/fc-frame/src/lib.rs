#![forbid(unsafe_code)]

use fc_columnar::{Field, FieldError};
use fc_types::{FieldType, Scalar};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("field {name:?} has length {actual}, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("row {row} has {actual} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Field(#[from] FieldError),
}

/// What a table represents, when a producer has said so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameTag {
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    fields: Vec<Field>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<FrameTag>,
}

impl<'de> Deserialize<'de> for Table {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            name: Option<String>,
            fields: Vec<Field>,
            #[serde(default)]
            meta: Option<FrameTag>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let table = Self::new(raw.fields).map_err(serde::de::Error::custom)?;
        Ok(table.with_name(raw.name).with_meta(raw.meta))
    }
}

impl Table {
    pub fn new(fields: Vec<Field>) -> Result<Self, FrameError> {
        if let Some(first) = fields.first() {
            let expected = first.len();
            for field in &fields[1..] {
                if field.len() != expected {
                    return Err(FrameError::LengthMismatch {
                        name: field.name().to_owned(),
                        expected,
                        actual: field.len(),
                    });
                }
            }
        }
        Ok(Self {
            name: None,
            fields,
            meta: None,
        })
    }

    /// Build a table from row-major cells; every column's type is taken from
    /// `columns`.
    pub fn from_rows(columns: &[(&str, FieldType)], rows: &[Vec<Scalar>]) -> Result<Self, FrameError> {
        let mut values: Vec<Vec<Scalar>> = vec![Vec::with_capacity(rows.len()); columns.len()];
        for (row_idx, row) in rows.iter().enumerate() {
            if row.len() != columns.len() {
                return Err(FrameError::RaggedRow {
                    row: row_idx,
                    expected: columns.len(),
                    actual: row.len(),
                });
            }
            for (col, cell) in values.iter_mut().zip(row) {
                col.push(cell.clone());
            }
        }
        let fields = columns
            .iter()
            .zip(values)
            .map(|((name, field_type), vals)| Field::new(*name, *field_type, vals))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(fields)
    }

    #[must_use]
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, meta: Option<FrameTag>) -> Self {
        self.meta = meta;
        self
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn meta(&self) -> Option<FrameTag> {
        self.meta
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, idx: usize) -> Option<&Field> {
        self.fields.get(idx)
    }

    #[must_use]
    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn number_fields(&self) -> impl Iterator<Item = &Field> + '_ {
        self.fields.iter().filter(|f| f.is_number())
    }

    /// Row count; a table without fields has no rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.first().map_or(0, Field::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.meta == other.meta
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(left, right)| left.semantic_eq(right))
    }
}
