//! Matrix expansion - turns declared axes into concrete attribute bindings

use crate::core::config::MatrixConfig;
use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;
use std::fmt;

/// One concrete attribute binding, in axis declaration order
///
/// Keys added by include entries follow the axis keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatrixCombination {
    values: Vec<(String, String)>,
}

impl MatrixCombination {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Insert a key or replace its value in place
    pub fn set(&mut self, key: &str, value: &str) {
        match self.values.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.values.push((key.to_string(), value.to_string())),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether every key/value of `partial` is present here
    pub fn contains_all(&self, partial: &MatrixCombination) -> bool {
        partial.iter().all(|(k, v)| self.get(k) == Some(v))
    }

    /// Comma-separated values, used in job names
    pub fn label(&self) -> String {
        self.values
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl From<Vec<(&str, &str)>> for MatrixCombination {
    fn from(pairs: Vec<(&str, &str)>) -> Self {
        let mut combination = MatrixCombination::default();
        for (k, v) in pairs {
            combination.set(k, v);
        }
        combination
    }
}

impl Serialize for MatrixCombination {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in &self.values {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MatrixCombination {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CombinationVisitor;

        impl<'de> Visitor<'de> for CombinationVisitor {
            type Value = MatrixCombination;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of matrix attributes")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut combination = MatrixCombination::default();
                while let Some((k, v)) = access.next_entry::<String, String>()? {
                    combination.set(&k, &v);
                }
                Ok(combination)
            }
        }

        deserializer.deserialize_map(CombinationVisitor)
    }
}

/// Normalize a scalar YAML value to its string form
pub fn scalar_to_string(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => anyhow::bail!("Expected a scalar value, found {:?}", other),
    }
}

fn mapping_to_combination(mapping: &Mapping) -> Result<MatrixCombination> {
    let mut combination = MatrixCombination::default();
    for (key, value) in mapping {
        let key = key
            .as_str()
            .with_context(|| format!("Matrix keys must be strings, found {:?}", key))?;
        let value = scalar_to_string(value).with_context(|| format!("Matrix key '{}'", key))?;
        combination.set(key, &value);
    }
    Ok(combination)
}

/// Declarative matrix: axes plus include/exclude entries
#[derive(Debug, Clone, Default)]
pub struct MatrixSpec {
    axes: Vec<(String, Vec<String>)>,
    include: Vec<MatrixCombination>,
    exclude: Vec<MatrixCombination>,
}

impl MatrixSpec {
    pub fn from_config(config: &MatrixConfig) -> Result<Self> {
        let mut axes = Vec::new();
        for (key, values) in &config.axes {
            let name = key
                .as_str()
                .with_context(|| format!("Matrix axis names must be strings, found {:?}", key))?
                .to_string();
            let values = match values {
                Value::Sequence(seq) => seq
                    .iter()
                    .map(scalar_to_string)
                    .collect::<Result<Vec<_>>>()
                    .with_context(|| format!("Matrix axis '{}'", name))?,
                _ => anyhow::bail!("Matrix axis '{}' must be a list of values", name),
            };
            axes.push((name, values));
        }

        let include = config
            .include
            .iter()
            .map(mapping_to_combination)
            .collect::<Result<Vec<_>>>()
            .context("Invalid matrix include entry")?;
        if include.iter().any(|entry| entry.is_empty()) {
            anyhow::bail!("Matrix include entries must not be empty");
        }

        let exclude = config
            .exclude
            .iter()
            .map(mapping_to_combination)
            .collect::<Result<Vec<_>>>()
            .context("Invalid matrix exclude entry")?;
        for entry in &exclude {
            for (key, _) in entry.iter() {
                if !axes.iter().any(|(name, _)| name == key) {
                    anyhow::bail!("Matrix exclude entry references unknown axis '{}'", key);
                }
            }
        }

        Ok(Self { axes, include, exclude })
    }

    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Number of combinations before excludes and includes
    pub fn base_size(&self) -> usize {
        self.axes.iter().map(|(_, values)| values.len()).product()
    }

    /// Expand into the ordered list of combinations
    ///
    /// The last axis varies fastest. An axis with no values yields no
    /// combinations at all.
    pub fn expand(&self) -> Vec<MatrixCombination> {
        if self.axes.is_empty() {
            if self.include.is_empty() {
                return vec![MatrixCombination::default()];
            }
            return self.include.clone();
        }

        let mut combinations = vec![MatrixCombination::default()];
        for (axis, values) in &self.axes {
            let mut next = Vec::with_capacity(combinations.len() * values.len());
            for combination in &combinations {
                for value in values {
                    let mut extended = combination.clone();
                    extended.set(axis, value);
                    next.push(extended);
                }
            }
            combinations = next;
        }

        if combinations.is_empty() {
            return combinations;
        }

        combinations.retain(|c| !self.exclude.iter().any(|ex| c.contains_all(ex)));

        let axis_names: HashSet<&str> = self.axis_names().into_iter().collect();
        let mut extra = Vec::new();

        for entry in &self.include {
            let mut applied = false;
            for combination in combinations.iter_mut() {
                // Only axis keys decide applicability; axis values are never overwritten
                let compatible = entry
                    .iter()
                    .filter(|(k, _)| axis_names.contains(k))
                    .all(|(k, v)| combination.get(k) == Some(v));
                if compatible {
                    for (k, v) in entry.iter().filter(|(k, _)| !axis_names.contains(k)) {
                        combination.set(k, v);
                    }
                    applied = true;
                }
            }
            if !applied {
                extra.push(entry.clone());
            }
        }

        combinations.extend(extra);
        combinations
    }
}
