//! Resource properties and schema validation.
//!
//! Property values are a small JSON-like tree. Handlers describe what they
//! accept with a [`SchemaMap`] and the generic [`validate`] pass applies
//! defaults, rejects unknown names, and enforces kinds and constraints
//! before any backend is touched. Validated maps are treated as immutable;
//! an update supplies a whole new map rather than mutating the stored one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LifecycleError;

/// A single declared property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Number(f64),
    Bool(bool),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

/// Named property values for one resource.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

impl PropertyValue {
    pub fn kind(&self) -> PropertyKind {
        match self {
            PropertyValue::String(_) => PropertyKind::String,
            PropertyValue::Number(_) => PropertyKind::Number,
            PropertyValue::Bool(_) => PropertyKind::Bool,
            PropertyValue::List(_) => PropertyKind::List,
            PropertyValue::Map(_) => PropertyKind::Map,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            PropertyValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            PropertyValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Convert from JSON. A top-level `null` has no property
    /// representation and yields `None`; `null` members of arrays and
    /// objects are dropped.
    pub fn from_json(value: &Value) -> Option<PropertyValue> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(PropertyValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(PropertyValue::Number),
            Value::String(s) => Some(PropertyValue::String(s.clone())),
            Value::Array(items) => Some(PropertyValue::List(
                items.iter().filter_map(PropertyValue::from_json).collect(),
            )),
            Value::Object(map) => Some(PropertyValue::Map(
                map.iter()
                    .filter_map(|(k, v)| PropertyValue::from_json(v).map(|v| (k.clone(), v)))
                    .collect(),
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::String(s) => Value::String(s.clone()),
            PropertyValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::List(items) => {
                Value::Array(items.iter().map(PropertyValue::to_json).collect())
            }
            PropertyValue::Map(m) => Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        PropertyValue::Number(n)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Number(n as f64)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

/// The kind of value a property accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    String,
    Number,
    Bool,
    List,
    Map,
}

impl PropertyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::Number => "number",
            PropertyKind::Bool => "bool",
            PropertyKind::List => "list",
            PropertyKind::Map => "map",
        }
    }
}

impl std::fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value constraint attached to a property schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// Value must equal one of the listed values.
    AllowedValues(Vec<PropertyValue>),
    /// Numeric value must fall within the inclusive bounds.
    Range { min: Option<f64>, max: Option<f64> },
    /// String or list length must fall within the inclusive bounds.
    Length {
        min: Option<usize>,
        max: Option<usize>,
    },
}

/// Declared shape of one property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    pub kind: PropertyKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<PropertyValue>,
    #[serde(default)]
    pub update_allowed: bool,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// Schema for all properties of one resource kind.
pub type SchemaMap = BTreeMap<String, PropertySchema>;

impl PropertySchema {
    pub fn new(kind: PropertyKind) -> Self {
        Self {
            kind,
            required: false,
            default: None,
            update_allowed: false,
            constraints: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn update_allowed(mut self) -> Self {
        self.update_allowed = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<PropertyValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Validate declared properties against a schema.
///
/// Returns the effective property map: the input with schema defaults
/// filled in for absent names. The input is not mutated.
pub fn validate(properties: &PropertyMap, schema: &SchemaMap) -> Result<PropertyMap, LifecycleError> {
    for name in properties.keys() {
        if !schema.contains_key(name) {
            return Err(LifecycleError::SchemaViolation(format!(
                "unknown property {:?}",
                name
            )));
        }
    }

    let mut effective = properties.clone();
    for (name, prop) in schema {
        if !effective.contains_key(name) {
            if let Some(default) = &prop.default {
                effective.insert(name.clone(), default.clone());
            } else if prop.required {
                return Err(LifecycleError::SchemaViolation(format!(
                    "required property {:?} is missing",
                    name
                )));
            }
        }
        if let Some(value) = effective.get(name) {
            if value.kind() != prop.kind {
                return Err(LifecycleError::SchemaViolation(format!(
                    "property {:?} expects {}, got {}",
                    name,
                    prop.kind,
                    value.kind()
                )));
            }
            for constraint in &prop.constraints {
                check_constraint(name, value, constraint)?;
            }
        }
    }
    Ok(effective)
}

/// Reject updates to properties whose schema does not allow them.
///
/// Both maps are expected to already be validated effective maps.
pub fn validate_update(
    stored: &PropertyMap,
    desired: &PropertyMap,
    schema: &SchemaMap,
) -> Result<(), LifecycleError> {
    for (name, prop) in schema {
        if !prop.update_allowed && stored.get(name) != desired.get(name) {
            return Err(LifecycleError::SchemaViolation(format!(
                "property {:?} is not updatable",
                name
            )));
        }
    }
    Ok(())
}

fn check_constraint(
    name: &str,
    value: &PropertyValue,
    constraint: &Constraint,
) -> Result<(), LifecycleError> {
    match constraint {
        Constraint::AllowedValues(allowed) => {
            if !allowed.contains(value) {
                return Err(LifecycleError::SchemaViolation(format!(
                    "property {:?} value is not one of the allowed values",
                    name
                )));
            }
        }
        Constraint::Range { min, max } => {
            let n = value.as_f64().ok_or_else(|| {
                LifecycleError::SchemaViolation(format!(
                    "range constraint on non-numeric property {:?}",
                    name
                ))
            })?;
            if min.map(|m| n < m).unwrap_or(false) || max.map(|m| n > m).unwrap_or(false) {
                return Err(LifecycleError::SchemaViolation(format!(
                    "property {:?} value {} is out of range",
                    name, n
                )));
            }
        }
        Constraint::Length { min, max } => {
            let len = match value {
                PropertyValue::String(s) => s.len(),
                PropertyValue::List(items) => items.len(),
                _ => {
                    return Err(LifecycleError::SchemaViolation(format!(
                        "length constraint on property {:?} without a length",
                        name
                    )));
                }
            };
            if min.map(|m| len < m).unwrap_or(false) || max.map(|m| len > m).unwrap_or(false) {
                return Err(LifecycleError::SchemaViolation(format!(
                    "property {:?} length {} is out of bounds",
                    name, len
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> SchemaMap {
        let mut s = SchemaMap::new();
        s.insert(
            "name".to_string(),
            PropertySchema::new(PropertyKind::String).required(),
        );
        s.insert(
            "root".to_string(),
            PropertySchema::new(PropertyKind::String).default_value("backends"),
        );
        s.insert(
            "replicas".to_string(),
            PropertySchema::new(PropertyKind::Number).constraint(Constraint::Range {
                min: Some(1.0),
                max: Some(10.0),
            }),
        );
        s.insert(
            "image".to_string(),
            PropertySchema::new(PropertyKind::String)
                .update_allowed()
                .constraint(Constraint::AllowedValues(vec![
                    "alpine".into(),
                    "debian".into(),
                ])),
        );
        s
    }

    fn props(pairs: &[(&str, PropertyValue)]) -> PropertyMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn defaults_are_applied() {
        let effective = validate(&props(&[("name", "a".into())]), &schema()).unwrap();
        assert_eq!(effective["root"], "backends".into());
        assert_eq!(effective["name"], "a".into());
        assert!(!effective.contains_key("replicas"));
    }

    #[test]
    fn unknown_property_is_rejected() {
        let err = validate(
            &props(&[("name", "a".into()), ("bogus", "x".into())]),
            &schema(),
        )
        .unwrap_err();
        assert!(matches!(err, LifecycleError::SchemaViolation(_)));
    }

    #[test]
    fn missing_required_property_is_rejected() {
        let err = validate(&props(&[]), &schema()).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let err = validate(&props(&[("name", 3.0.into())]), &schema()).unwrap_err();
        assert!(err.to_string().contains("expects string"));
    }

    #[test]
    fn range_constraint_is_enforced() {
        let ok = props(&[("name", "a".into()), ("replicas", 3.0.into())]);
        assert!(validate(&ok, &schema()).is_ok());

        let bad = props(&[("name", "a".into()), ("replicas", 11.0.into())]);
        assert!(validate(&bad, &schema()).is_err());
    }

    #[test]
    fn allowed_values_constraint_is_enforced() {
        let ok = props(&[("name", "a".into()), ("image", "alpine".into())]);
        assert!(validate(&ok, &schema()).is_ok());

        let bad = props(&[("name", "a".into()), ("image", "gentoo".into())]);
        assert!(validate(&bad, &schema()).is_err());
    }

    #[test]
    fn update_of_frozen_property_is_rejected() {
        let stored = validate(
            &props(&[("name", "a".into()), ("image", "alpine".into())]),
            &schema(),
        )
        .unwrap();
        let mut desired = stored.clone();
        desired.insert("image".to_string(), "debian".into());
        assert!(validate_update(&stored, &desired, &schema()).is_ok());

        let mut renamed = stored.clone();
        renamed.insert("name".to_string(), "b".into());
        let err = validate_update(&stored, &renamed, &schema()).unwrap_err();
        assert!(err.to_string().contains("not updatable"));
    }

    #[test]
    fn json_round_trip() {
        let value = PropertyValue::Map(
            [
                ("enabled".to_string(), PropertyValue::Bool(true)),
                ("count".to_string(), PropertyValue::Number(2.0)),
                (
                    "tags".to_string(),
                    PropertyValue::List(vec!["a".into(), "b".into()]),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let json = value.to_json();
        assert_eq!(PropertyValue::from_json(&json), Some(value));
    }

    #[test]
    fn null_members_are_dropped() {
        let json = serde_json::json!({ "keep": "x", "drop": null });
        let value = PropertyValue::from_json(&json).unwrap();
        let map = value.as_map().unwrap();
        assert!(map.contains_key("keep"));
        assert!(!map.contains_key("drop"));
        assert_eq!(PropertyValue::from_json(&Value::Null), None);
    }

    #[test]
    fn serde_representation_is_untagged() {
        let map: PropertyMap = serde_json::from_str(r#"{"a": 1, "b": "x", "c": [true]}"#).unwrap();
        assert_eq!(map["a"], PropertyValue::Number(1.0));
        assert_eq!(map["b"], PropertyValue::String("x".to_string()));
        assert_eq!(map["c"], PropertyValue::List(vec![PropertyValue::Bool(true)]));
        let text = serde_json::to_string(&map).unwrap();
        let back: PropertyMap = serde_json::from_str(&text).unwrap();
        assert_eq!(back, map);
    }
}
