//! Field transformation between the in-memory and the wire/storage shape.
//!
//! A [`FieldMap`] renames keys level by level. In its JSON form a key `k`
//! maps to a new name (or `null` to drop it), and structural suffixes on `k`
//! describe what lies below:
//!
//! - `k_obj`: the value is an object transformed by the child map
//! - `k_dict`: the value is a dictionary; each entry is transformed
//! - `k_arr`: the value is an array; each element is transformed
//! - `k_val`: the value (or each array element) is substituted through a
//!   lookup table
//!
//! A level consisting of exactly `{"_dict": {...}}` is dictionary-shaped:
//! every key is kept and every value is transformed by the child map.
//!
//! Maps describe the save direction. [`invert_field_map`] builds the load
//! direction once per map and caches it.

use crate::{error::Result, modified::DATE_MODIFIED_KEY, Error};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

const DICT_KEY: &str = "_dict";

/// What to do with keys a map does not mention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnmappedKeys {
    /// Keep the key unchanged
    #[default]
    PassThrough,
    Drop,
}

/// Scalar substitution table for `_val` fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    entries: Vec<(Value, Value)>,
}

impl ValueMap {
    fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidFieldMap("value map must be an object".into()));
        };
        let entries = map
            .iter()
            .map(|(from, to)| (Value::String(from.clone()), to.clone()))
            .collect();
        Ok(Self { entries })
    }

    fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|(from, to)| (scalar_key(from), to.clone()))
            .collect();
        Value::Object(map)
    }

    fn inverse(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(from, to)| (to.clone(), from.clone()))
                .collect(),
        }
    }

    /// Substitute `value`; values missing from the table pass through.
    fn lookup(&self, value: &Value) -> Value {
        self.entries
            .iter()
            .find(|(from, _)| scalar_eq(from, value))
            .map(|(_, to)| to.clone())
            .unwrap_or_else(|| value.clone())
    }
}

fn scalar_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Table keys are strings in JSON, so `"1"` also matches the number `1`.
fn scalar_eq(key: &Value, value: &Value) -> bool {
    key == value || (key.is_string() != value.is_string() && scalar_key(key) == scalar_key(value))
}

/// Structure below a renamed field.
#[derive(Debug, Clone, PartialEq)]
pub enum Nested {
    Object(Arc<FieldMap>),
    Dict(Arc<FieldMap>),
    Array(Arc<FieldMap>),
    Values(ValueMap),
}

impl Nested {
    const SUFFIXES: [&'static str; 4] = ["_obj", "_dict", "_arr", "_val"];

    fn suffix(&self) -> &'static str {
        match self {
            Nested::Object(_) => "_obj",
            Nested::Dict(_) => "_dict",
            Nested::Array(_) => "_arr",
            Nested::Values(_) => "_val",
        }
    }

    fn parse(suffix: &str, value: &Value) -> Result<Self> {
        Ok(match suffix {
            "_obj" => Nested::Object(Arc::new(FieldMap::from_json(value)?)),
            "_dict" => Nested::Dict(Arc::new(FieldMap::from_json(value)?)),
            "_arr" => Nested::Array(Arc::new(FieldMap::from_json(value)?)),
            _ => Nested::Values(ValueMap::from_json(value)?),
        })
    }

    fn inverse(&self) -> Self {
        match self {
            Nested::Object(map) => Nested::Object(invert_field_map(map)),
            Nested::Dict(map) => Nested::Dict(invert_field_map(map)),
            Nested::Array(map) => Nested::Array(invert_field_map(map)),
            Nested::Values(values) => Nested::Values(values.inverse()),
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Nested::Object(map) | Nested::Dict(map) | Nested::Array(map) => map.to_json(),
            Nested::Values(values) => values.to_json(),
        }
    }
}

/// How one key is transformed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    /// New key, `None` to drop the field
    pub target: Option<String>,
    pub nested: Option<Nested>,
}

/// Key renaming rules for one level of a value.
#[derive(Debug, Default)]
pub struct FieldMap {
    fields: IndexMap<String, FieldRule>,
    dict: Option<Arc<FieldMap>>,
    inverted: OnceLock<Arc<FieldMap>>,
}

impl PartialEq for FieldMap {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields && self.dict == other.dict
    }
}

impl Clone for FieldMap {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            dict: self.dict.clone(),
            inverted: OnceLock::new(),
        }
    }
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `from` to `to` at this level.
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.rule_mut(from.into()).target = Some(to.into());
        self
    }

    /// Drop `key` at this level.
    pub fn drop_key(mut self, key: impl Into<String>) -> Self {
        self.rule_mut(key.into()).target = None;
        self
    }

    /// Describe the structure below an already renamed `key`.
    pub fn nest(mut self, key: impl Into<String>, nested: Nested) -> Self {
        self.rule_mut(key.into()).nested = Some(nested);
        self
    }

    /// A dictionary-shaped level whose values follow `child`.
    pub fn dict(child: FieldMap) -> Self {
        Self {
            dict: Some(Arc::new(child)),
            ..Self::default()
        }
    }

    fn rule_mut(&mut self, key: String) -> &mut FieldRule {
        self.fields.entry(key.clone()).or_insert(FieldRule {
            target: Some(key),
            nested: None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&FieldRule> {
        self.fields.get(key)
    }

    pub fn is_dict(&self) -> bool {
        self.dict.is_some()
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(object) = value else {
            return Err(Error::InvalidFieldMap("field map must be an object".into()));
        };
        if object.len() == 1 {
            if let Some(child) = object.get(DICT_KEY) {
                return Ok(Self::dict(Self::from_json(child)?));
            }
        }

        let mut map = Self::new();
        let mut nested = Vec::new();
        for (key, target) in object {
            match target {
                Value::String(to) => {
                    map.rule_mut(key.clone()).target = Some(to.clone());
                }
                Value::Null => {
                    map.rule_mut(key.clone()).target = None;
                }
                Value::Object(_) => {
                    let Some((base, suffix)) = split_suffix(key) else {
                        return Err(Error::InvalidFieldMap(format!(
                            "`{key}` maps to an object but has no structural suffix"
                        )));
                    };
                    nested.push((base.to_string(), Nested::parse(suffix, target)?));
                }
                other => {
                    return Err(Error::InvalidFieldMap(format!(
                        "`{key}` must map to a string, null or object, got {other}"
                    )))
                }
            }
        }
        for (base, rule) in nested {
            let Some(field) = map.fields.get_mut(&base) else {
                return Err(Error::InvalidFieldMap(format!(
                    "`{base}{}` has no matching `{base}` entry",
                    rule.suffix()
                )));
            };
            if field.nested.is_some() {
                return Err(Error::InvalidFieldMap(format!(
                    "`{base}` has more than one structural suffix"
                )));
            }
            field.nested = Some(rule);
        }
        map.validate();
        Ok(map)
    }

    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        if let Some(dict) = &self.dict {
            out.insert(DICT_KEY.to_string(), dict.to_json());
        }
        for (key, rule) in &self.fields {
            let target = rule.target.clone().map_or(Value::Null, Value::String);
            out.insert(key.clone(), target);
            if let Some(nested) = &rule.nested {
                out.insert(format!("{key}{}", nested.suffix()), nested.to_json());
            }
        }
        Value::Object(out)
    }

    /// Targets claimed by more than one key at this level.
    pub fn duplicate_targets(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for target in self.fields.values().filter_map(|rule| rule.target.as_ref()) {
            if !seen.insert(target) && !duplicates.contains(target) {
                duplicates.push(target.clone());
            }
        }
        duplicates
    }

    /// Log duplicate targets at this level in debug builds.
    fn validate(&self) {
        if !cfg!(debug_assertions) {
            return;
        }
        let duplicates = self.duplicate_targets();
        if !duplicates.is_empty() {
            tracing::warn!(
                ?duplicates,
                "FieldTransformMismatch: duplicate target keys in field map"
            );
        }
    }

    fn build_inverse(&self) -> FieldMap {
        // Covers maps built without `from_json`.
        self.validate();
        let mut inverse = FieldMap {
            dict: self.dict.as_ref().map(|child| invert_field_map(child)),
            ..FieldMap::default()
        };
        for (key, rule) in &self.fields {
            let Some(target) = &rule.target else {
                continue;
            };
            inverse.fields.insert(
                target.clone(),
                FieldRule {
                    target: Some(key.clone()),
                    nested: rule.nested.as_ref().map(Nested::inverse),
                },
            );
        }
        inverse
    }
}

impl TryFrom<Value> for FieldMap {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        FieldMap::from_json(&value)
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FieldMap::from_json(&value).map_err(serde::de::Error::custom)
    }
}

impl Serialize for FieldMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

fn split_suffix(key: &str) -> Option<(&str, &'static str)> {
    Nested::SUFFIXES
        .iter()
        .find_map(|suffix| key.strip_suffix(suffix).map(|base| (base, *suffix)))
        .filter(|(base, _)| !base.is_empty())
}

/// The load-direction map for `map`, computed once per map instance.
pub fn invert_field_map(map: &FieldMap) -> Arc<FieldMap> {
    Arc::clone(map.inverted.get_or_init(|| Arc::new(map.build_inverse())))
}

/// Rename the keys of `value` according to `map`.
pub fn transform_object_fields(value: &Value, map: &FieldMap, unmapped: UnmappedKeys) -> Value {
    let Value::Object(object) = value else {
        return value.clone();
    };
    let mut out = Map::new();
    for (key, child) in object {
        if let Some(dict) = &map.dict {
            out.insert(key.clone(), transform_object_fields(child, dict, unmapped));
            continue;
        }
        if key == DATE_MODIFIED_KEY {
            out.insert(key.clone(), child.clone());
            continue;
        }
        match map.fields.get(key) {
            Some(FieldRule {
                target: Some(target),
                nested,
            }) => {
                let child = match nested {
                    Some(nested) => apply_nested(child, nested, unmapped),
                    None => child.clone(),
                };
                out.insert(target.clone(), child);
            }
            Some(FieldRule { target: None, .. }) => {}
            None => {
                if cfg!(debug_assertions) {
                    tracing::warn!(key = %key, "FieldTransformMismatch: key missing from field map");
                }
                if unmapped == UnmappedKeys::PassThrough {
                    out.insert(key.clone(), child.clone());
                }
            }
        }
    }
    Value::Object(out)
}

fn apply_nested(value: &Value, nested: &Nested, unmapped: UnmappedKeys) -> Value {
    match (nested, value) {
        (_, Value::Null) => Value::Null,
        (Nested::Values(values), Value::Array(items)) => {
            Value::Array(items.iter().map(|item| values.lookup(item)).collect())
        }
        (Nested::Values(values), scalar) => values.lookup(scalar),
        (Nested::Array(child), Value::Array(items)) => Value::Array(
            items
                .iter()
                .map(|item| transform_object_fields(item, child, unmapped))
                .collect(),
        ),
        (Nested::Object(child), Value::Object(_)) => {
            transform_object_fields(value, child, unmapped)
        }
        (Nested::Dict(child), Value::Object(entries)) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), transform_object_fields(v, child, unmapped)))
                .collect(),
        ),
        (_, other) => other.clone(),
    }
}

/// Where a path walk currently stands.
enum Level<'a> {
    /// Keys are renamed by this map
    Map(&'a FieldMap),
    /// The next key is an element index or dictionary key, then this map
    Each(&'a FieldMap),
    /// The next key is an element whose value is substituted
    EachValue(&'a ValueMap),
    /// Below an unmapped key; nothing is renamed
    Opaque,
}

/// How the value at the end of a walked path is transformed.
enum Shape<'a> {
    Fields(&'a FieldMap),
    Nested(&'a Nested),
    Lookup(&'a ValueMap),
    Raw,
}

/// Transform a change's path and value together.
///
/// Returns `None` when the path runs through a dropped field, or an unmapped
/// key under [`UnmappedKeys::Drop`].
pub fn transform_at(
    path: &[String],
    value: &Value,
    map: &FieldMap,
    unmapped: UnmappedKeys,
) -> Option<(Vec<String>, Value)> {
    let mut out = Vec::with_capacity(path.len());
    let mut level = Level::Map(map);
    let mut shape = Shape::Fields(map);
    for key in path {
        let (segment, next, next_shape) = match level {
            Level::Map(current) => step(current, key, unmapped)?,
            Level::Each(child) => (key.clone(), Level::Map(child), Shape::Fields(child)),
            Level::EachValue(values) => (key.clone(), Level::Opaque, Shape::Lookup(values)),
            Level::Opaque => (key.clone(), Level::Opaque, Shape::Raw),
        };
        out.push(segment);
        level = next;
        shape = next_shape;
    }
    let value = match shape {
        Shape::Fields(map) => transform_object_fields(value, map, unmapped),
        Shape::Nested(nested) => apply_nested(value, nested, unmapped),
        Shape::Lookup(values) if !value.is_null() => values.lookup(value),
        Shape::Lookup(_) | Shape::Raw => value.clone(),
    };
    Some((out, value))
}

fn step<'a>(
    map: &'a FieldMap,
    key: &str,
    unmapped: UnmappedKeys,
) -> Option<(String, Level<'a>, Shape<'a>)> {
    if let Some(dict) = &map.dict {
        return Some((key.to_string(), Level::Map(dict), Shape::Fields(dict)));
    }
    if key == DATE_MODIFIED_KEY {
        return Some((key.to_string(), Level::Opaque, Shape::Raw));
    }
    match map.fields.get(key) {
        Some(FieldRule {
            target: Some(target),
            nested,
        }) => {
            let (level, shape) = match nested {
                Some(n @ Nested::Object(child)) => (Level::Map(child), Shape::Nested(n)),
                Some(n @ (Nested::Dict(child) | Nested::Array(child))) => {
                    (Level::Each(child), Shape::Nested(n))
                }
                Some(n @ Nested::Values(values)) => (Level::EachValue(values), Shape::Nested(n)),
                None => (Level::Opaque, Shape::Raw),
            };
            Some((target.clone(), level, shape))
        }
        Some(FieldRule { target: None, .. }) => None,
        None => match unmapped {
            UnmappedKeys::PassThrough => Some((key.to_string(), Level::Opaque, Shape::Raw)),
            UnmappedKeys::Drop => None,
        },
    }
}

/// Transform only a path.
pub fn transform_path(path: &[String], map: &FieldMap) -> Option<Vec<String>> {
    transform_at(path, &Value::Null, map, UnmappedKeys::PassThrough).map(|(path, _)| path)
}
