//! Logical commands and their parameter accessors.
//!
//! A [`Command`] is what the gateway receives: an operation name plus a JSON object of
//! parameters. Drivers never index into the raw map themselves; they go through
//! [`ParamReader`], which performs the type and range checks and produces the
//! client-facing validation messages.

use crate::error::{NimError, NimResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::RangeInclusive;

/// A logical operation addressed to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Operation name, e.g. `set_threshold`.
    #[serde(alias = "command")]
    pub op: String,
    /// Operation parameters.
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Command {
    /// Command without parameters.
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            params: Map::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Typed, validating view of the parameters.
    pub fn params(&self) -> ParamReader<'_> {
        ParamReader {
            params: &self.params,
        }
    }
}

/// Which members of a channel or group bank an operation applies to.
///
/// Replaces the numeric "apply to all" sentinels of the front panel protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// One member, by its device index.
    Single(u8),
    /// Every member of the bank.
    All,
}

impl Target {
    /// Member indices covered by this target.
    pub fn members(self, bank: RangeInclusive<u8>) -> Vec<u8> {
        match self {
            Target::Single(index) => vec![index],
            Target::All => bank.collect(),
        }
    }
}

/// Validating accessor over a command's parameter map.
#[derive(Debug, Clone, Copy)]
pub struct ParamReader<'a> {
    params: &'a Map<String, Value>,
}

impl<'a> ParamReader<'a> {
    /// Raw parameter value, treating JSON `null` as absent.
    pub fn raw(&self, name: &str) -> Option<&'a Value> {
        self.params.get(name).filter(|v| !v.is_null())
    }

    /// Whether the parameter is missing or null.
    pub fn is_absent(&self, name: &str) -> bool {
        self.raw(name).is_none()
    }

    fn required(&self, name: &str) -> NimResult<&'a Value> {
        self.raw(name)
            .ok_or_else(|| NimError::Validation(format!("missing parameter '{name}'")))
    }

    /// Required integer inside `min..=max`.
    pub fn int(&self, name: &str, min: i64, max: i64) -> NimResult<i64> {
        let value = as_integer(self.required(name)?)
            .ok_or_else(|| NimError::Validation(format!("{name} must be an integer")))?;
        if value < min || value > max {
            return Err(NimError::out_of_range(name, min, max));
        }
        Ok(value)
    }

    /// Required number inside `min..=max`.
    pub fn float(&self, name: &str, min: f64, max: f64) -> NimResult<f64> {
        let value = as_float(self.required(name)?)
            .ok_or_else(|| NimError::Validation(format!("{name} must be a number")))?;
        if !(min..=max).contains(&value) {
            return Err(NimError::Validation(format!(
                "{name} out of range {min}-{max}"
            )));
        }
        Ok(value)
    }

    /// Required flag. Accepts booleans, `0`/`1` and `on`/`off`/`true`/`false`.
    pub fn flag(&self, name: &str) -> NimResult<bool> {
        let parsed = match self.required(name)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Some(true),
                "0" | "off" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        };
        parsed.ok_or_else(|| NimError::Validation(format!("{name} must be a boolean")))
    }

    /// Required string, or a number rendered as text.
    pub fn text(&self, name: &str) -> NimResult<String> {
        match self.required(name)? {
            Value::String(s) => Ok(s.trim().to_string()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(NimError::Validation(format!("{name} must be a string"))),
        }
    }

    /// Channel or group target.
    ///
    /// `"all"`/`"a"` and the legacy sentinel (when the bank has one) select
    /// [`Target::All`]; any other value must be an index inside `bank`.
    pub fn target(
        &self,
        name: &str,
        bank: RangeInclusive<u8>,
        all_sentinel: Option<u8>,
    ) -> NimResult<Target> {
        let raw = self.required(name)?;
        if let Value::String(s) = raw {
            if matches!(s.trim().to_ascii_lowercase().as_str(), "all" | "a") {
                return Ok(Target::All);
            }
        }
        let index = as_integer(raw)
            .ok_or_else(|| NimError::Validation(format!("{name} must be an integer or \"all\"")))?;
        if all_sentinel.is_some_and(|s| i64::from(s) == index) {
            return Ok(Target::All);
        }
        match u8::try_from(index) {
            Ok(i) if bank.contains(&i) => Ok(Target::Single(i)),
            _ => Err(NimError::out_of_range(
                name,
                i64::from(*bank.start()),
                i64::from(*bank.end()),
            )),
        }
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
