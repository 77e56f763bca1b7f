//! # Configuration Values
//!
//! `ConfigValue` is the closed set of shapes a source may produce:
//! string, number, bool, list or map. `Value` is the immutable record stored
//! in the merged key space: the raw value plus the source that contributed it
//! and an optional group reference.
//!
//! Casting never fails loudly. Every conversion returns `Option` and the typed
//! getters turn `None` into the caller's default.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Number;

/// A configuration value as produced by a source decoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    String(String),
    Number(Number),
    Bool(bool),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::List(_) | Self::Map(_))
    }

    /// Render the value as a plain string. Structured values are rendered as
    /// JSON.
    pub fn to_string_lossy(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::List(_) | Self::Map(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64().or_else(|| {
                n.as_u64()
                    .and_then(|u| i64::try_from(u).ok())
                    .or_else(|| n.as_f64().and_then(integral_f64))
            }),
            Self::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral_f64))
            }
            Self::Bool(b) => Some(i64::from(*b)),
            Self::List(_) | Self::Map(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n.as_u64(),
            _ => self.as_i64().and_then(|i| u64::try_from(i).ok()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            Self::String(s) => s.trim().parse::<f64>().ok(),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::List(_) | Self::Map(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::String(s) => parse_bool(s.trim()),
            Self::Number(n) => n.as_f64().map(|f| f != 0.0),
            Self::List(_) | Self::Map(_) => None,
        }
    }

    /// Integers are milliseconds; strings may be humanized (`"1m30s"`).
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Number(n) => n.as_u64().map(Duration::from_millis),
            Self::String(s) => parse_duration(s.trim()),
            Self::Bool(_) | Self::List(_) | Self::Map(_) => None,
        }
    }

    /// Interpret the value as a list. Strings are split on `delimiter`, other
    /// scalars become a single element list.
    pub fn as_list(&self, delimiter: &str) -> Option<Vec<ConfigValue>> {
        match self {
            Self::List(items) => Some(items.clone()),
            Self::String(s) if s.trim().is_empty() => Some(Vec::new()),
            Self::String(s) if !delimiter.is_empty() => Some(
                s.split(delimiter)
                    .map(|part| Self::String(part.trim().to_string()))
                    .collect(),
            ),
            Self::Map(_) => None,
            scalar => Some(vec![scalar.clone()]),
        }
    }
}

fn integral_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "on" => Some(true),
        "false" | "f" | "0" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a humanized duration such as `"250ms"`, `"1.5s"` or `"1h2m3s"`.
/// A bare integer is read as milliseconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    if input.is_empty() {
        return None;
    }
    if let Ok(ms) = input.parse::<u64>() {
        return Some(Duration::from_millis(ms));
    }

    let mut total_nanos = 0f64;
    let mut rest = input;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let amount: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60_000_000_000.0,
            "h" => 3_600_000_000_000.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_nanos += amount * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos < 0.0 {
        return None;
    }
    Some(Duration::from_nanos(total_nanos.round() as u64))
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<u64> for ConfigValue {
    fn from(value: u64) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<u16> for ConfigValue {
    fn from(value: u16) -> Self {
        Self::Number(Number::from(value))
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or_else(|| Self::String(value.to_string()), Self::Number)
    }
}

impl<T: Into<ConfigValue>> From<Vec<T>> for ConfigValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, ConfigValue>> for ConfigValue {
    fn from(map: BTreeMap<String, ConfigValue>) -> Self {
        Self::Map(map)
    }
}

impl<'de> Deserialize<'de> for ConfigValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ConfigValueVisitor)
    }
}

struct ConfigValueVisitor;

impl<'de> Visitor<'de> for ConfigValueVisitor {
    type Value = ConfigValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string, number, bool, list or map")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Number(Number::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Number(Number::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<ConfigValue, E> {
        Ok(ConfigValue::from(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ConfigValue, E> {
        Ok(ConfigValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<ConfigValue, E> {
        Ok(ConfigValue::String(v))
    }

    // Nulls never reach the key space; a bare null decodes to an empty map.
    fn visit_unit<E: de::Error>(self) -> Result<ConfigValue, E> {
        Ok(ConfigValue::Map(BTreeMap::new()))
    }

    fn visit_none<E: de::Error>(self) -> Result<ConfigValue, E> {
        self.visit_unit()
    }

    fn visit_some<D>(self, deserializer: D) -> Result<ConfigValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(self)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<ConfigValue, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element::<Option<ConfigValue>>()? {
            if let Some(item) = item {
                items.push(item);
            }
        }
        Ok(ConfigValue::List(items))
    }

    fn visit_map<A>(self, mut map: A) -> Result<ConfigValue, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut entries = BTreeMap::new();
        while let Some((key, value)) = map.next_entry::<MapKey, Option<ConfigValue>>()? {
            if let Some(value) = value {
                entries.insert(key.0, value);
            }
        }
        Ok(ConfigValue::Map(entries))
    }
}

/// Map key accepting any scalar, since YAML allows numeric and boolean keys.
struct MapKey(String);

impl<'de> Deserialize<'de> for MapKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = MapKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar map key")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<MapKey, E> {
                Ok(MapKey(v.to_string()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<MapKey, E> {
                Ok(MapKey(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<MapKey, E> {
                Ok(MapKey(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<MapKey, E> {
                Ok(MapKey(v.to_string()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<MapKey, E> {
                Ok(MapKey(v.to_string()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<MapKey, E> {
                Ok(MapKey(v.to_string()))
            }
        }

        deserializer.deserialize_any(KeyVisitor)
    }
}

/// Conversion used by the typed getters.
pub trait FromConfigValue: Sized {
    fn from_config_value(value: &ConfigValue, delimiter: &str) -> Option<Self>;
}

impl FromConfigValue for ConfigValue {
    fn from_config_value(value: &ConfigValue, _delimiter: &str) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromConfigValue for String {
    fn from_config_value(value: &ConfigValue, _delimiter: &str) -> Option<Self> {
        Some(value.to_string_lossy())
    }
}

impl FromConfigValue for bool {
    fn from_config_value(value: &ConfigValue, _delimiter: &str) -> Option<Self> {
        value.as_bool()
    }
}

impl FromConfigValue for f64 {
    fn from_config_value(value: &ConfigValue, _delimiter: &str) -> Option<Self> {
        value.as_f64()
    }
}

impl FromConfigValue for Duration {
    fn from_config_value(value: &ConfigValue, _delimiter: &str) -> Option<Self> {
        value.as_duration()
    }
}

macro_rules! impl_from_config_int {
    ($($ty:ty),*) => {
        $(
            impl FromConfigValue for $ty {
                fn from_config_value(value: &ConfigValue, _delimiter: &str) -> Option<Self> {
                    value.as_i64().and_then(|i| <$ty>::try_from(i).ok())
                }
            }
        )*
    };
}

impl_from_config_int!(i64, i32, u32, u16, usize);

impl FromConfigValue for u64 {
    fn from_config_value(value: &ConfigValue, _delimiter: &str) -> Option<Self> {
        value.as_u64()
    }
}

impl<T: FromConfigValue> FromConfigValue for Vec<T> {
    fn from_config_value(value: &ConfigValue, delimiter: &str) -> Option<Self> {
        value
            .as_list(delimiter)?
            .iter()
            .map(|item| T::from_config_value(item, delimiter))
            .collect()
    }
}

/// Identity of the source that contributed a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceInfo {
    name: String,
    priority: i32,
}

impl SourceInfo {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl fmt::Display for SourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(priority={})", self.name, self.priority)
    }
}

/// A value contributed to the key space. Never mutated after construction;
/// a change is always a new `Value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    raw: ConfigValue,
    source: SourceInfo,
    reference: Option<String>,
}

impl Value {
    pub fn new(raw: impl Into<ConfigValue>, source: SourceInfo) -> Self {
        Self {
            raw: raw.into(),
            source,
            reference: None,
        }
    }

    /// Tag the value with a group reference, such as the file it came from.
    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn raw(&self) -> &ConfigValue {
        &self.raw
    }

    pub fn into_raw(self) -> ConfigValue {
        self.raw
    }

    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    pub fn priority(&self) -> i32 {
        self.source.priority
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    /// True when both values come from the same source and group.
    pub fn same_origin(&self, source_name: &str, reference: Option<&str>) -> bool {
        self.source.name == source_name && self.reference.as_deref() == reference
    }
}
