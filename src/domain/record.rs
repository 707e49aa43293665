//! Input records, record schemas and data rules
//!
//! A [`Record`] is one line pulled from the data source together with the
//! [`RecordSchema`] that knows how to split and validate it. Records that
//! fail the schema pattern or any [`DataRules`] entry never reach a worker.

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::variables::Variable;

/// Schema / rule construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordSchemaError {
    #[error("Invalid validity pattern for schema '{schema}': {message}")]
    InvalidPattern { schema: String, message: String },

    #[error("Invalid regex in data rule on slice '{slice}': {message}")]
    InvalidRule { slice: String, message: String },

    #[error("Schema '{0}' has an empty separator")]
    EmptySeparator(String),
}

/// Serialized form of a [`RecordSchema`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchemaDef {
    pub name: String,
    pub separator: String,
    pub slices: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Named, reusable description of a record line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RecordSchemaDef", into = "RecordSchemaDef")]
pub struct RecordSchema {
    name: String,
    separator: String,
    slices: Vec<String>,
    pattern: Option<Regex>,
}

impl RecordSchema {
    pub fn new(
        name: impl Into<String>,
        separator: impl Into<String>,
        slices: Vec<String>,
        pattern: Option<&str>,
    ) -> Result<Self, RecordSchemaError> {
        let name = name.into();
        let separator = separator.into();
        if separator.is_empty() {
            return Err(RecordSchemaError::EmptySeparator(name));
        }
        let pattern = pattern
            .filter(|p| !p.is_empty())
            .map(Regex::new)
            .transpose()
            .map_err(|e| RecordSchemaError::InvalidPattern {
                schema: name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            name,
            separator,
            slices,
            pattern,
        })
    }

    /// `USER:PASS` credentials with a non-empty user and password
    #[must_use]
    pub fn credentials() -> Self {
        Self {
            name: "Credentials".to_string(),
            separator: ":".to_string(),
            slices: vec!["USER".to_string(), "PASS".to_string()],
            pattern: Regex::new(r"^[^:]+:.+$").ok(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn separator(&self) -> &str {
        &self.separator
    }

    #[must_use]
    pub fn slices(&self) -> &[String] {
        &self.slices
    }

    #[must_use]
    pub fn is_valid(&self, line: &str) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(line))
    }

    /// Splits a line into `(slice name, value)` pairs. The last slice keeps
    /// the remainder of the line, separators included.
    #[must_use]
    pub fn split<'a>(&'a self, line: &'a str) -> Vec<(&'a str, &'a str)> {
        if self.slices.is_empty() {
            return Vec::new();
        }
        self.slices
            .iter()
            .map(String::as_str)
            .zip(line.splitn(self.slices.len(), self.separator.as_str()))
            .collect()
    }
}

impl TryFrom<RecordSchemaDef> for RecordSchema {
    type Error = RecordSchemaError;

    fn try_from(def: RecordSchemaDef) -> Result<Self, Self::Error> {
        Self::new(def.name, def.separator, def.slices, def.pattern.as_deref())
    }
}

impl From<RecordSchema> for RecordSchemaDef {
    fn from(schema: RecordSchema) -> Self {
        Self {
            name: schema.name,
            separator: schema.separator,
            slices: schema.slices,
            pattern: schema.pattern.map(|p| p.as_str().to_string()),
        }
    }
}

/// One input line to be checked
#[derive(Debug, Clone)]
pub struct Record {
    text: String,
    schema: Arc<RecordSchema>,
    retry_count: u32,
}

impl Record {
    #[must_use]
    pub fn new(text: impl Into<String>, schema: Arc<RecordSchema>) -> Self {
        Self {
            text: text.into(),
            schema,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.schema.is_valid(&self.text)
    }

    #[must_use]
    pub fn slice(&self, name: &str) -> Option<&str> {
        self.schema
            .split(&self.text)
            .into_iter()
            .find(|(slice, _)| *slice == name)
            .map(|(_, value)| value)
    }

    /// Slice values as scalar variables, in schema order
    #[must_use]
    pub fn slice_variables(&self) -> Vec<Variable> {
        self.schema
            .split(&self.text)
            .into_iter()
            .map(|(name, value)| Variable::scalar(name, value))
            .collect()
    }

    #[must_use]
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Only the ban-retry loop bumps this
    pub const fn increment_retries(&mut self) {
        self.retry_count += 1;
    }
}

/// Character class or literal a rule looks for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Needle {
    Text(String),
    Lowercase,
    Uppercase,
    Digit,
    Symbol,
}

impl Needle {
    fn found_in(&self, value: &str) -> bool {
        match self {
            Self::Text(text) => value.contains(text.as_str()),
            Self::Lowercase => value.chars().any(char::is_lowercase),
            Self::Uppercase => value.chars().any(char::is_uppercase),
            Self::Digit => value.chars().any(|c| c.is_ascii_digit()),
            Self::Symbol => value
                .chars()
                .any(|c| !c.is_alphanumeric() && !c.is_whitespace()),
        }
    }
}

/// Serialized data rule, evaluated against a named slice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRuleDef {
    pub slice: String,
    #[serde(flatten)]
    pub kind: DataRuleKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "value", rename_all = "snake_case")]
pub enum DataRuleKind {
    MinLength(usize),
    MaxLength(usize),
    MustContain(Needle),
    MustNotContain(Needle),
    MustMatch(String),
}

#[derive(Debug, Clone)]
enum CompiledRule {
    MinLength(usize),
    MaxLength(usize),
    MustContain(Needle),
    MustNotContain(Needle),
    MustMatch(Regex),
}

/// Data rules compiled once per run
#[derive(Debug, Clone, Default)]
pub struct DataRules {
    rules: Vec<(String, CompiledRule)>,
}

impl DataRules {
    pub fn compile(defs: &[DataRuleDef]) -> Result<Self, RecordSchemaError> {
        let rules = defs
            .iter()
            .map(|def| {
                let rule = match &def.kind {
                    DataRuleKind::MinLength(n) => CompiledRule::MinLength(*n),
                    DataRuleKind::MaxLength(n) => CompiledRule::MaxLength(*n),
                    DataRuleKind::MustContain(needle) => CompiledRule::MustContain(needle.clone()),
                    DataRuleKind::MustNotContain(needle) => {
                        CompiledRule::MustNotContain(needle.clone())
                    }
                    DataRuleKind::MustMatch(pattern) => CompiledRule::MustMatch(
                        Regex::new(pattern).map_err(|e| RecordSchemaError::InvalidRule {
                            slice: def.slice.clone(),
                            message: e.to_string(),
                        })?,
                    ),
                };
                Ok((def.slice.clone(), rule))
            })
            .collect::<Result<Vec<_>, RecordSchemaError>>()?;
        Ok(Self { rules })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// A rule on a slice the record does not have fails the record
    #[must_use]
    pub fn accepts(&self, record: &Record) -> bool {
        self.rules.iter().all(|(slice, rule)| {
            let Some(value) = record.slice(slice) else {
                return false;
            };
            match rule {
                CompiledRule::MinLength(n) => value.chars().count() >= *n,
                CompiledRule::MaxLength(n) => value.chars().count() <= *n,
                CompiledRule::MustContain(needle) => needle.found_in(value),
                CompiledRule::MustNotContain(needle) => !needle.found_in(value),
                CompiledRule::MustMatch(regex) => regex.is_match(value),
            }
        })
    }
}
