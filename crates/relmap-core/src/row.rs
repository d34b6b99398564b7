//! Fetched rows.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::sync::Arc;

/// One row of a result set.
///
/// Column names are shared by every row of the same statement. Joined
/// statements repeat names (`id` per table), so the loaders address rows
/// by position; name lookup returns the first match.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

fn type_error(expected: &'static str, actual: impl Into<String>, column: Option<&str>) -> Error {
    Error::Type(TypeError {
        expected,
        actual: actual.into(),
        column: column.map(str::to_string),
        rust_type: None,
    })
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self::shared(columns.into(), values)
    }

    /// Row reusing the column names of a sibling row.
    pub fn shared(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Row with generated names `c0`, `c1`, ...
    pub fn positional(values: Vec<Value>) -> Self {
        let columns = (0..values.len()).map(|i| format!("c{i}")).collect();
        Self::new(columns, values)
    }

    pub fn columns(&self) -> &Arc<[String]> {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    /// The `len` values starting at `offset`.
    #[allow(clippy::result_large_err)]
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[Value]> {
        self.values.get(offset..offset + len).ok_or_else(|| {
            type_error(
                "column range",
                format!(
                    "columns {}..{} of a {}-column row",
                    offset,
                    offset + len,
                    self.len()
                ),
                None,
            )
        })
    }

    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        match self.get(index) {
            Some(value) => T::from_value(value),
            None => Err(type_error(
                std::any::type_name::<T>(),
                format!("no column {} in a {}-column row", index, self.len()),
                None,
            )),
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let Some(value) = self.get_by_name(name) else {
            return Err(type_error(
                std::any::type_name::<T>(),
                "missing column",
                Some(name),
            ));
        };
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            other => other,
        })
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Conversion out of a [`Value`].
pub trait FromValue: Sized {
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    type_error(expected, value.type_name(), None)
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_i64().ok_or_else(|| mismatch("i64", value))
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        let wide = i64::from_value(value).map_err(|_| mismatch("i32", value))?;
        i32::try_from(wide).map_err(|_| type_error("i32", format!("{wide} is out of range"), None))
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| mismatch("String", value))
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => Err(mismatch("Vec<u8>", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(None);
        }
        T::from_value(value).map(Some)
    }
}
