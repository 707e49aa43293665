//! Variable model
//!
//! Typed, named values carried through a check. Every variable holds one of
//! three shapes (scalar, ordered list, string-keyed map). A [`VariableScope`]
//! is the ordered store the template engine resolves names against: one
//! local scope per execution context plus one global scope shared by all
//! workers of a run.

use std::fmt;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Global scope shared by reference across every worker of a run
pub type SharedScope = Arc<RwLock<VariableScope>>;

/// Shape of a variable's value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    Scalar,
    List,
    Map,
}

/// Variable payload - exactly one of three shapes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VariableValue {
    Scalar(String),
    List(Vec<String>),
    Map(IndexMap<String, String>),
}

impl VariableValue {
    #[must_use]
    pub const fn kind(&self) -> VariableKind {
        match self {
            Self::Scalar(_) => VariableKind::Scalar,
            Self::List(_) => VariableKind::List,
            Self::Map(_) => VariableKind::Map,
        }
    }
}

impl fmt::Display for VariableValue {
    /// Scalar as-is, list as `[a, b]`, map as `{(k, v), (k2, v2)}`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(value) => f.write_str(value),
            Self::List(items) => write!(f, "[{}]", items.join(", ")),
            Self::Map(entries) => {
                let pairs: Vec<String> = entries
                    .iter()
                    .map(|(key, value)| format!("({key}, {value})"))
                    .collect();
                write!(f, "{{{}}}", pairs.join(", "))
            }
        }
    }
}

/// A named value stored in a [`VariableScope`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: VariableValue,
    /// Reported together with the final result of a check
    #[serde(default)]
    pub is_capture: bool,
    /// Internal/system variable, not shown to the user and not removable
    #[serde(default)]
    pub hidden: bool,
}

impl Variable {
    #[must_use]
    pub fn new(name: impl Into<String>, value: VariableValue) -> Self {
        Self {
            name: name.into(),
            value,
            is_capture: false,
            hidden: false,
        }
    }

    #[must_use]
    pub fn scalar(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, VariableValue::Scalar(value.into()))
    }

    #[must_use]
    pub fn list<I, S>(name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            VariableValue::List(items.into_iter().map(Into::into).collect()),
        )
    }

    #[must_use]
    pub fn map<I, K, V>(name: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::new(
            name,
            VariableValue::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.into(), value.into()))
                    .collect(),
            ),
        )
    }

    /// Marks the variable for final-result reporting
    #[must_use]
    pub const fn captured(mut self) -> Self {
        self.is_capture = true;
        self
    }

    #[must_use]
    pub const fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    #[must_use]
    pub const fn kind(&self) -> VariableKind {
        self.value.kind()
    }

    /// List element by index; negative indices count from the end.
    /// `None` when the variable is not a list or the index is out of range.
    #[must_use]
    pub fn list_item(&self, index: i64) -> Option<&str> {
        let VariableValue::List(items) = &self.value else {
            return None;
        };
        let len = i64::try_from(items.len()).ok()?;
        let index = if index < 0 { len + index } else { index };
        if !(0..len).contains(&index) {
            return None;
        }
        items.get(usize::try_from(index).ok()?).map(String::as_str)
    }

    /// Map lookup by key
    #[must_use]
    pub fn map_value(&self, key: &str) -> Option<&str> {
        match &self.value {
            VariableValue::Map(entries) => entries.get(key).map(String::as_str),
            _ => None,
        }
    }

    /// Reverse map lookup: first key whose value equals `value`
    #[must_use]
    pub fn map_key(&self, value: &str) -> Option<&str> {
        match &self.value {
            VariableValue::Map(entries) => entries
                .iter()
                .find(|(_, candidate)| candidate.as_str() == value)
                .map(|(key, _)| key.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

/// Ordered variable store with unique visible names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableScope {
    variables: Vec<Variable>,
}

impl VariableScope {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            variables: Vec::new(),
        }
    }

    /// Wraps a fresh scope for sharing between workers
    #[must_use]
    pub fn shared() -> SharedScope {
        Arc::new(RwLock::new(Self::new()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    /// Variables that are not hidden
    pub fn visible(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter().filter(|variable| !variable.hidden)
    }

    /// First variable with the given name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|variable| variable.name == name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn get_scalar(&self, name: &str) -> Option<&str> {
        match &self.get(name)?.value {
            VariableValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_list(&self, name: &str) -> Option<&[String]> {
        match &self.get(name)?.value {
            VariableValue::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_map(&self, name: &str) -> Option<&IndexMap<String, String>> {
        match &self.get(name)?.value {
            VariableValue::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Adds a variable, replacing any visible variable with the same name.
    /// Hidden variables are never replaced through this path.
    pub fn set(&mut self, variable: Variable) {
        self.remove(&variable.name);
        self.variables.push(variable);
    }

    /// Adds or replaces a hidden variable
    pub fn set_hidden(&mut self, variable: Variable) {
        let name = variable.name.clone();
        self.variables.retain(|existing| existing.name != name);
        self.variables.push(variable.hidden());
    }

    /// Removes visible variables with this name; returns how many went away
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.variables.len();
        self.variables
            .retain(|variable| variable.hidden || variable.name != name);
        before - self.variables.len()
    }

    /// Captured, visible variables rendered for reporting
    #[must_use]
    pub fn captures(&self) -> Vec<(String, String)> {
        self.visible()
            .filter(|variable| variable.is_capture)
            .map(|variable| (variable.name.clone(), variable.to_string()))
            .collect()
    }
}

impl FromIterator<Variable> for VariableScope {
    fn from_iter<T: IntoIterator<Item = Variable>>(iter: T) -> Self {
        let mut scope = Self::new();
        for variable in iter {
            scope.set(variable);
        }
        scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_replaces_visible_variable_with_same_name() {
        let mut scope = VariableScope::new();
        scope.set(Variable::scalar("TOKEN", "a"));
        scope.set(Variable::scalar("TOKEN", "b"));

        assert_eq!(scope.len(), 1);
        assert_eq!(scope.get_scalar("TOKEN"), Some("b"));
    }

    #[test]
    fn remove_never_touches_hidden_variables() {
        let mut scope = VariableScope::new();
        scope.set_hidden(Variable::scalar("SOURCE", "<html>"));
        scope.set(Variable::scalar("USER", "bob"));

        assert_eq!(scope.remove("SOURCE"), 0);
        assert_eq!(scope.remove("USER"), 1);
        assert_eq!(scope.get_scalar("SOURCE"), Some("<html>"));
    }

    #[test]
    fn set_hidden_replaces_previous_hidden_value() {
        let mut scope = VariableScope::new();
        scope.set_hidden(Variable::scalar("RESPONSECODE", "200"));
        scope.set_hidden(Variable::scalar("RESPONSECODE", "403"));

        assert_eq!(scope.len(), 1);
        assert_eq!(scope.get_scalar("RESPONSECODE"), Some("403"));
        assert!(scope.get("RESPONSECODE").is_some_and(|v| v.hidden));
    }

    #[test]
    fn list_item_supports_negative_indices() {
        let list = Variable::list("L", ["a", "b", "c"]);
        assert_eq!(list.list_item(0), Some("a"));
        assert_eq!(list.list_item(-1), Some("c"));
        assert_eq!(list.list_item(-3), Some("a"));
        assert_eq!(list.list_item(3), None);
        assert_eq!(list.list_item(-4), None);
    }

    #[test]
    fn map_lookups_by_key_and_value() {
        let map = Variable::map("M", [("k1", "v1"), ("k2", "v2")]);
        assert_eq!(map.map_value("k2"), Some("v2"));
        assert_eq!(map.map_key("v1"), Some("k1"));
        assert_eq!(map.map_value("missing"), None);
    }

    #[test]
    fn display_renders_each_shape() {
        assert_eq!(Variable::scalar("S", "x").to_string(), "x");
        assert_eq!(Variable::list("L", ["a", "b"]).to_string(), "[a, b]");
        assert_eq!(
            Variable::map("M", [("k", "v"), ("k2", "v2")]).to_string(),
            "{(k, v), (k2, v2)}"
        );
    }

    #[test]
    fn captures_skip_hidden_and_uncaptured() {
        let mut scope = VariableScope::new();
        scope.set(Variable::scalar("BALANCE", "10").captured());
        scope.set(Variable::scalar("TMP", "x"));
        scope.set_hidden(Variable::scalar("SOURCE", "body").captured());

        assert_eq!(
            scope.captures(),
            vec![("BALANCE".to_string(), "10".to_string())]
        );
    }
}
