//! Aggregation rules: definitions, fingerprinting, and directory loading.
//!
//! Rules are loaded once at startup from a directory of YAML files, one rule
//! per file, and cached in memory. No hot reload; changing a rule definition
//! changes its fingerprint, which marks previously materialized rows stale.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::aggregate::{BucketSize, Operator};
use crate::error::RuleError;

/// One aggregation rule: which events it applies to, how they reduce, and
/// which payload field feeds the reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRule {
    /// Unique rule name; the query dimension.
    pub name: String,
    /// Event type this rule applies to.
    pub source_event: String,
    pub operator: Operator,
    /// Payload field to extract; empty for count.
    pub field: String,
    /// Aggregation window. Fixed to one minute.
    pub window: BucketSize,
    /// Hex SHA-256 of the canonical rule definition.
    pub fingerprint: String,
}

impl AggregationRule {
    pub fn new(name: &str, source_event: &str, operator: Operator, field: &str) -> Self {
        let mut rule = Self {
            name: name.to_string(),
            source_event: source_event.to_string(),
            operator,
            field: field.to_string(),
            window: BucketSize::MINUTE,
            fingerprint: String::new(),
        };
        rule.fingerprint = rule.compute_fingerprint();
        rule
    }

    /// Content hash over every semantic field. Renaming a file or reflowing
    /// its YAML does not change the fingerprint; changing the definition does.
    fn compute_fingerprint(&self) -> String {
        let canonical = format!(
            "{}|{}|{}|{}|{}",
            self.name,
            self.source_event,
            self.operator,
            self.field,
            self.window.label()
        );
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }
}

/// On-disk YAML shape. `window_size` is optional and locked to "1m".
#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    name: String,
    #[serde(default)]
    source_event: String,
    #[serde(default)]
    window_size: Option<String>,
    #[serde(default)]
    operator: String,
    #[serde(default)]
    field: String,
}

/// The compiled, immutable set of rules the engine applies.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<String, AggregationRule>,
}

impl RuleSet {
    /// Loads all `*.yaml` / `*.yml` files under `dir`. A missing directory
    /// is valid and yields zero rules. Files are visited in name order so
    /// duplicate-name errors are deterministic.
    pub fn load(dir: &Path) -> Result<Self, RuleError> {
        let mut set = Self::default();

        if !dir.exists() {
            return Ok(set);
        }
        if !dir.is_dir() {
            return Err(RuleError::NotADirectory {
                path: dir.to_path_buf(),
            });
        }

        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(|source| RuleError::Io {
                path: dir.to_path_buf(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|ext| ext.to_str()),
                    Some("yaml" | "yml")
                ) && path.is_file()
            })
            .collect();
        paths.sort();

        for path in paths {
            let contents = fs::read_to_string(&path).map_err(|source| RuleError::Io {
                path: path.clone(),
                source,
            })?;

            // Empty and comment-only files parse as YAML null; skip them.
            let raw: Option<RawRule> =
                serde_yml::from_str(&contents).map_err(|source| RuleError::Parse {
                    path: path.clone(),
                    source,
                })?;
            let Some(raw) = raw else {
                continue;
            };
            if raw.name.is_empty() {
                continue;
            }

            set.insert(Self::compile(raw)?)?;
        }

        info!(rules = set.len(), dir = %dir.display(), "loaded aggregation rules");
        Ok(set)
    }

    /// Builds a set from already-constructed rules. Duplicate names are
    /// rejected the same way the loader rejects them.
    pub fn from_rules(rules: Vec<AggregationRule>) -> Result<Self, RuleError> {
        let mut set = Self::default();
        for rule in rules {
            set.insert(rule)?;
        }
        Ok(set)
    }

    fn compile(raw: RawRule) -> Result<AggregationRule, RuleError> {
        if raw.source_event.is_empty() {
            return Err(RuleError::MissingSourceEvent { name: raw.name });
        }

        let operator: Operator = raw.operator.parse().map_err(|_| RuleError::UnknownOperator {
            name: raw.name.clone(),
            operator: raw.operator.clone(),
        })?;

        if let Some(window_size) = &raw.window_size {
            if window_size != "1m" {
                return Err(RuleError::UnsupportedWindow { name: raw.name });
            }
        }

        Ok(AggregationRule::new(
            &raw.name,
            &raw.source_event,
            operator,
            &raw.field,
        ))
    }

    fn insert(&mut self, rule: AggregationRule) -> Result<(), RuleError> {
        if self.rules.contains_key(&rule.name) {
            return Err(RuleError::DuplicateName { name: rule.name });
        }
        self.rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AggregationRule> {
        self.rules.get(name)
    }

    pub fn rules(&self) -> impl Iterator<Item = &AggregationRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Index from event type to the rules that consume it. The sweeper's
    /// hot path is a single map lookup per event.
    pub fn by_source_event(&self) -> HashMap<String, Vec<AggregationRule>> {
        let mut index: HashMap<String, Vec<AggregationRule>> = HashMap::new();
        for rule in self.rules.values() {
            index
                .entry(rule.source_event.clone())
                .or_default()
                .push(rule.clone());
        }
        index
    }
}
