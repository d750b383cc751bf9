//! Cached parameter values.
//!
//! Every successful command and the initial read-all pass produce [`ParamUpdate`]s.
//! The session applies them to its [`ParamCache`] and forwards them to observers as
//! `initial_values` events. A newly attaching observer is resynchronized from the cache
//! alone, without touching the hardware.
//!
//! An update serializes flat, the way the control panel consumes it:
//!
//! ```json
//! {"type": "threshold", "channel": 5, "value": 200}
//! {"type": "threshold_common", "value": 200}
//! {"type": "multiplicity", "hi": 4, "lo": 1}
//! ```

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;

/// Bank member a parameter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Member {
    /// Per-channel parameter (MSCF-16 1–16, MHV-4 0–3).
    Channel(u8),
    /// Per-group parameter (MSCF-16 groups 1–4).
    Group(u8),
}

/// Identity of one cached parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    /// Parameter type as seen by clients, e.g. `gain_common`.
    pub kind: &'static str,
    /// Channel or group, for banked parameters.
    pub member: Option<Member>,
}

impl ParamKey {
    /// Module-wide parameter.
    pub const fn global(kind: &'static str) -> Self {
        Self { kind, member: None }
    }

    /// Per-channel parameter.
    pub const fn channel(kind: &'static str, channel: u8) -> Self {
        Self {
            kind,
            member: Some(Member::Channel(channel)),
        }
    }

    /// Per-group parameter.
    pub const fn group(kind: &'static str, group: u8) -> Self {
        Self {
            kind,
            member: Some(Member::Group(group)),
        }
    }
}

/// Last known value of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Integer setting.
    Int(i64),
    /// Physical quantity in gateway units (V, µA, °C).
    Float(f64),
    /// Mode flag.
    Bool(bool),
    /// Text such as a firmware version or polarity letter.
    Text(String),
    /// Multiplicity window.
    Borders {
        /// Upper border (9 = infinite).
        hi: i64,
        /// Lower border.
        lo: i64,
    },
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

/// A parameter key together with its new value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamUpdate {
    /// Which parameter.
    pub key: ParamKey,
    /// Its value.
    pub value: ParamValue,
}

impl ParamUpdate {
    /// Pair a key with a value.
    pub fn new(key: ParamKey, value: impl Into<ParamValue>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl Serialize for ParamUpdate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.key.kind)?;
        match self.key.member {
            Some(Member::Channel(c)) => map.serialize_entry("channel", &c)?,
            Some(Member::Group(g)) => map.serialize_entry("group", &g)?,
            None => {}
        }
        match &self.value {
            ParamValue::Borders { hi, lo } => {
                map.serialize_entry("hi", hi)?;
                map.serialize_entry("lo", lo)?;
            }
            other => map.serialize_entry("value", other)?,
        }
        map.end()
    }
}

/// Last-known parameter values of one session.
#[derive(Debug, Clone, Default)]
pub struct ParamCache {
    values: BTreeMap<ParamKey, ParamValue>,
}

impl ParamCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply updates in order; later updates to the same key win.
    pub fn apply(&mut self, updates: &[ParamUpdate]) {
        for update in updates {
            self.values.insert(update.key, update.value.clone());
        }
    }

    /// Cached value for `key`.
    pub fn get(&self, key: &ParamKey) -> Option<&ParamValue> {
        self.values.get(key)
    }

    /// Every cached value as an update, ordered by key.
    pub fn snapshot(&self) -> Vec<ParamUpdate> {
        self.values
            .iter()
            .map(|(key, value)| ParamUpdate {
                key: *key,
                value: value.clone(),
            })
            .collect()
    }

    /// Number of cached parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when nothing has been cached.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
