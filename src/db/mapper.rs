//! Typed row mapping.
//!
//! A [`RowMapper`] pairs a [`RowSchema`] (one declared field per column, in
//! select-list order) with a builder function. Mapping is positional: column
//! names are never looked up, so duplicate names from joins are harmless.
//! Mapping performs no I/O and the same row always maps to the same record.

use crate::error::{DbError, DbResult};
use crate::models::{ResultRow, SqlValue};
use chrono::NaiveDateTime;
use std::fmt;
use uuid::Uuid;

/// Declared type of a mapped field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
    Uuid,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Text => "text",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Uuid => "uuid",
        };
        f.write_str(name)
    }
}

impl ColumnType {
    /// Whether a runtime value fits this declared type.
    ///
    /// SQLite has no boolean storage class, so `Boolean` also accepts the
    /// integers 0 and 1. No other coercion is applied.
    fn accepts(&self, value: &SqlValue) -> bool {
        matches!(
            (self, value),
            (Self::Integer, SqlValue::Int(_))
                | (Self::Float, SqlValue::Float(_))
                | (Self::Text, SqlValue::Text(_))
                | (Self::Boolean, SqlValue::Bool(_))
                | (Self::Boolean, SqlValue::Int(0 | 1))
                | (Self::Timestamp, SqlValue::Timestamp(_))
                | (Self::Uuid, SqlValue::Uuid(_))
        )
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

/// Ordered field declarations for one query shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSchema {
    fields: Vec<FieldSpec>,
}

impl RowSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a non-nullable field.
    pub fn field(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            nullable: false,
        });
        self
    }

    /// Append a field that may be NULL.
    pub fn nullable(mut self, name: impl Into<String>, ty: ColumnType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            nullable: true,
        });
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check column count, nullability and value types against the row.
    pub fn validate(&self, row: &ResultRow) -> DbResult<()> {
        if row.len() != self.fields.len() {
            return Err(DbError::mapping(
                "*",
                format!(
                    "expected {} column(s), row has {}",
                    self.fields.len(),
                    row.len()
                ),
            ));
        }

        for (idx, (field, value)) in self.fields.iter().zip(row.values()).enumerate() {
            if value.is_null() {
                if !field.nullable {
                    return Err(DbError::mapping(
                        column_label(idx, field),
                        "NULL in a non-nullable field",
                    ));
                }
                continue;
            }
            if !field.ty.accepts(value) {
                return Err(DbError::mapping(
                    column_label(idx, field),
                    format!("expected {}, got {}", field.ty, value.type_name()),
                ));
            }
        }
        Ok(())
    }
}

fn column_label(idx: usize, field: &FieldSpec) -> String {
    format!("#{} ({})", idx, field.name)
}

/// Positional, typed access to a validated row.
///
/// Each accessor consumes the next field; the accessor must match the
/// field's declared type.
pub struct FieldReader<'r> {
    row: &'r ResultRow,
    schema: &'r RowSchema,
    pos: usize,
}

impl<'r> FieldReader<'r> {
    fn next(&mut self, expected: ColumnType) -> DbResult<(&'r SqlValue, &'r FieldSpec)> {
        let idx = self.pos;
        let field = self.schema.fields.get(idx).ok_or_else(|| {
            DbError::mapping(
                format!("#{}", idx),
                "read past the last declared field",
            )
        })?;
        if field.ty != expected {
            return Err(DbError::mapping(
                column_label(idx, field),
                format!("field declared as {} but read as {}", field.ty, expected),
            ));
        }
        let value = self
            .row
            .get(idx)
            .ok_or_else(|| DbError::mapping(column_label(idx, field), "missing column"))?;
        self.pos += 1;
        Ok((value, field))
    }

    fn required<T>(
        &mut self,
        expected: ColumnType,
        extract: impl FnOnce(&'r SqlValue) -> Option<T>,
    ) -> DbResult<T> {
        let idx = self.pos;
        let (value, field) = self.next(expected)?;
        extract(value).ok_or_else(|| {
            DbError::mapping(
                column_label(idx, field),
                format!("expected {}, got {}", expected, value.type_name()),
            )
        })
    }

    fn optional<T>(
        &mut self,
        expected: ColumnType,
        extract: impl FnOnce(&'r SqlValue) -> Option<T>,
    ) -> DbResult<Option<T>> {
        let idx = self.pos;
        let (value, field) = self.next(expected)?;
        if value.is_null() {
            return Ok(None);
        }
        extract(value).map(Some).ok_or_else(|| {
            DbError::mapping(
                column_label(idx, field),
                format!("expected {}, got {}", expected, value.type_name()),
            )
        })
    }

    pub fn int(&mut self) -> DbResult<i64> {
        self.required(ColumnType::Integer, as_int)
    }

    pub fn opt_int(&mut self) -> DbResult<Option<i64>> {
        self.optional(ColumnType::Integer, as_int)
    }

    pub fn float(&mut self) -> DbResult<f64> {
        self.required(ColumnType::Float, as_float)
    }

    pub fn opt_float(&mut self) -> DbResult<Option<f64>> {
        self.optional(ColumnType::Float, as_float)
    }

    pub fn text(&mut self) -> DbResult<String> {
        self.required(ColumnType::Text, as_text)
    }

    pub fn opt_text(&mut self) -> DbResult<Option<String>> {
        self.optional(ColumnType::Text, as_text)
    }

    pub fn bool(&mut self) -> DbResult<bool> {
        self.required(ColumnType::Boolean, as_bool)
    }

    pub fn opt_bool(&mut self) -> DbResult<Option<bool>> {
        self.optional(ColumnType::Boolean, as_bool)
    }

    pub fn timestamp(&mut self) -> DbResult<NaiveDateTime> {
        self.required(ColumnType::Timestamp, as_timestamp)
    }

    pub fn opt_timestamp(&mut self) -> DbResult<Option<NaiveDateTime>> {
        self.optional(ColumnType::Timestamp, as_timestamp)
    }

    pub fn uuid(&mut self) -> DbResult<Uuid> {
        self.required(ColumnType::Uuid, as_uuid)
    }

    pub fn opt_uuid(&mut self) -> DbResult<Option<Uuid>> {
        self.optional(ColumnType::Uuid, as_uuid)
    }
}

fn as_int(value: &SqlValue) -> Option<i64> {
    match value {
        SqlValue::Int(v) => Some(*v),
        _ => None,
    }
}

fn as_float(value: &SqlValue) -> Option<f64> {
    match value {
        SqlValue::Float(v) => Some(*v),
        _ => None,
    }
}

fn as_text(value: &SqlValue) -> Option<String> {
    match value {
        SqlValue::Text(v) => Some(v.clone()),
        _ => None,
    }
}

fn as_bool(value: &SqlValue) -> Option<bool> {
    match value {
        SqlValue::Bool(v) => Some(*v),
        SqlValue::Int(0) => Some(false),
        SqlValue::Int(1) => Some(true),
        _ => None,
    }
}

fn as_timestamp(value: &SqlValue) -> Option<NaiveDateTime> {
    match value {
        SqlValue::Timestamp(v) => Some(*v),
        _ => None,
    }
}

fn as_uuid(value: &SqlValue) -> Option<Uuid> {
    match value {
        SqlValue::Uuid(v) => Some(*v),
        _ => None,
    }
}

/// Builds a record from a validated row.
pub type BuildFn<T> = fn(&mut FieldReader<'_>) -> DbResult<T>;

/// A schema plus a builder: everything needed to turn rows into `T`.
pub struct RowMapper<T> {
    schema: RowSchema,
    build: BuildFn<T>,
}

impl<T> RowMapper<T> {
    pub fn new(schema: RowSchema, build: BuildFn<T>) -> Self {
        Self { schema, build }
    }

    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    pub fn map(&self, row: &ResultRow) -> DbResult<T> {
        map_row(row, &self.schema, self.build)
    }

    pub fn map_all<'a>(&self, rows: impl IntoIterator<Item = &'a ResultRow>) -> DbResult<Vec<T>> {
        rows.into_iter().map(|row| self.map(row)).collect()
    }
}

impl<T> Clone for RowMapper<T> {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            build: self.build,
        }
    }
}

impl<T> fmt::Debug for RowMapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowMapper")
            .field("schema", &self.schema)
            .finish()
    }
}

/// Validate `row` against `schema`, then build a record from it.
pub fn map_row<T>(row: &ResultRow, schema: &RowSchema, build: BuildFn<T>) -> DbResult<T> {
    schema.validate(row)?;
    let mut reader = FieldReader {
        row,
        schema,
        pos: 0,
    };
    build(&mut reader)
}
