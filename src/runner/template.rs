//! # Template Engine
//!
//! Resolves `<NAME>`, `<NAME[i]>`, `<NAME(key)>` and `<NAME{value}>`
//! references against a local scope, then a global scope. A handful of
//! reserved names (`INPUT`, `STATUS`, `BOTNUM`, `RETRIES`, `PROXY`) are
//! bound directly by the execution context.
//!
//! [`resolve_expanding`] additionally fans a template out over a list or map
//! using the wildcard markers `[*]`, `(*)` and `{*}`.
//!
//! Unknown names are left untouched: angle brackets show up in HTML and
//! JSON bodies all the time and must not be treated as errors.

use std::borrow::Cow;
use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::variables::{Variable, VariableScope, VariableValue};

/// Upper bound on substitution passes; a value that contains its own
/// token would otherwise grow forever
const MAX_PASSES: usize = 8;

/// Literal used for list positions past the end of a shorter zipped list
const MISSING_ITEM: &str = "NULL";

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^<>]*)>").expect("token regex is valid"));
static LIST_WILDCARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^<>\[]*)\[\*\]>").expect("list wildcard regex is valid"));
static MAP_VALUES_WILDCARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^<>\(]*)\(\*\)>").expect("map wildcard regex is valid"));
static MAP_KEYS_WILDCARD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^<>\{]*)\{\*\}>").expect("map wildcard regex is valid"));

/// Name lookup for one resolution: local scope first, then global
#[derive(Debug, Clone)]
pub struct Bindings<'a> {
    local: &'a VariableScope,
    global: Option<&'a VariableScope>,
    reserved: Vec<(&'static str, Cow<'a, str>)>,
}

impl<'a> Bindings<'a> {
    #[must_use]
    pub const fn new(local: &'a VariableScope) -> Self {
        Self {
            local,
            global: None,
            reserved: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_global(mut self, global: &'a VariableScope) -> Self {
        self.global = Some(global);
        self
    }

    /// Binds a reserved name that resolves without a variable lookup
    #[must_use]
    pub fn with_reserved(mut self, name: &'static str, value: impl Into<Cow<'a, str>>) -> Self {
        self.reserved.push((name, value.into()));
        self
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&'a Variable> {
        self.local
            .get(name)
            .or_else(|| self.global.and_then(|global| global.get(name)))
    }

    fn find_list(&self, name: &str) -> Option<&'a [String]> {
        match &self.find(name)?.value {
            VariableValue::List(items) => Some(items),
            _ => None,
        }
    }

    fn find_map(&self, name: &str) -> Option<&'a Variable> {
        self.find(name)
            .filter(|variable| matches!(variable.value, VariableValue::Map(_)))
    }
}

/// Resolves every known reference in `template`
#[must_use]
pub fn resolve(template: &str, bindings: &Bindings<'_>) -> String {
    if !template.contains('<') || !template.contains('>') {
        return template.to_string();
    }

    let mut output = template.to_string();
    for _ in 0..MAX_PASSES {
        let previous = output.clone();

        for (name, value) in &bindings.reserved {
            output = output.replace(&format!("<{name}>"), value);
        }

        let mut seen = HashSet::new();
        let tokens: Vec<(String, String)> = TOKEN
            .captures_iter(&output)
            .filter(|caps| seen.insert(caps[0].to_string()))
            .map(|caps| (caps[0].to_string(), caps[1].to_string()))
            .collect();

        for (full, inner) in tokens {
            let name_end = inner.find(['[', '(', '{']).unwrap_or(inner.len());
            let (name, args) = inner.split_at(name_end);
            let Some(variable) = bindings.find(name) else {
                continue;
            };
            if let Some(replacement) = substitute(variable, args) {
                output = output.replace(&full, &replacement);
            }
        }

        if output == previous {
            break;
        }
    }
    output
}

/// Resolves `template` into one string per element of the wildcard
/// collection it references. Without a wildcard (or when the collection
/// does not exist) the result is the single plain resolution.
#[must_use]
pub fn resolve_expanding(template: &str, bindings: &Bindings<'_>) -> Vec<String> {
    expand_wildcards(template, bindings)
        .iter()
        .map(|expanded| resolve(expanded, bindings))
        .collect()
}

fn expand_wildcards(template: &str, bindings: &Bindings<'_>) -> Vec<String> {
    let lists: Vec<(String, &[String])> = LIST_WILDCARD
        .captures_iter(template)
        .filter_map(|caps| {
            let name = caps[1].to_string();
            bindings.find_list(&name).map(|items| (name, items))
        })
        .collect();

    if !lists.is_empty() {
        let longest = lists.iter().map(|(_, items)| items.len()).max().unwrap_or(0);
        return (0..longest)
            .map(|index| {
                lists.iter().fold(template.to_string(), |acc, (name, items)| {
                    let item = items.get(index).map_or(MISSING_ITEM, String::as_str);
                    acc.replace(&format!("<{name}[*]>"), item)
                })
            })
            .collect();
    }

    if let Some(caps) = MAP_VALUES_WILDCARD.captures(template) {
        if let Some(VariableValue::Map(entries)) = bindings.find_map(&caps[1]).map(|v| &v.value) {
            return entries
                .values()
                .map(|value| template.replace(&caps[0], value))
                .collect();
        }
        return vec![template.to_string()];
    }

    if let Some(caps) = MAP_KEYS_WILDCARD.captures(template) {
        if let Some(VariableValue::Map(entries)) = bindings.find_map(&caps[1]).map(|v| &v.value) {
            return entries
                .keys()
                .map(|key| template.replace(&caps[0], key))
                .collect();
        }
        return vec![template.to_string()];
    }

    vec![template.to_string()]
}

/// Replacement text for one token, `None` to leave the token as is
fn substitute(variable: &Variable, args: &str) -> Option<String> {
    match &variable.value {
        VariableValue::Scalar(value) => Some(value.clone()),
        VariableValue::List(_) => {
            if args.is_empty() {
                return Some(variable.to_string());
            }
            let index = bracket_argument(args, '[', ']')?.trim().parse::<i64>().ok()?;
            variable.list_item(index).map(str::to_string)
        }
        VariableValue::Map(_) => {
            if let Some(key) = bracket_argument(args, '(', ')') {
                variable.map_value(key).map(str::to_string)
            } else if let Some(value) = bracket_argument(args, '{', '}') {
                variable.map_key(value).map(str::to_string)
            } else {
                Some(variable.to_string())
            }
        }
    }
}

/// Text between the first `open` and the following `close`
fn bracket_argument(args: &str, open: char, close: char) -> Option<&str> {
    let start = args.find(open)? + open.len_utf8();
    let end = args[start..].find(close)? + start;
    Some(&args[start..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scope() -> VariableScope {
        [
            Variable::scalar("USER", "alice"),
            Variable::list("L", ["a", "b", "c"]),
            Variable::map("M", [("k1", "v1"), ("k2", "v2")]),
            Variable::scalar("IDX", "1"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn resolves_scalars_and_leaves_plain_text_alone() {
        let local = scope();
        let bindings = Bindings::new(&local);
        assert_eq!(resolve("user=<USER>", &bindings), "user=alice");
        assert_eq!(resolve("no tokens here", &bindings), "no tokens here");
    }

    #[test]
    fn unknown_names_stay_literal() {
        let local = VariableScope::new();
        let bindings = Bindings::new(&local);
        assert_eq!(resolve("<X>", &bindings), "<X>");
        assert_eq!(resolve("<br><X>", &bindings), "<br><X>");
    }

    #[test]
    fn list_indexing_including_negative_and_out_of_range() {
        let local = scope();
        let bindings = Bindings::new(&local);
        assert_eq!(resolve("<L[0]>", &bindings), "a");
        assert_eq!(resolve("<L[-1]>", &bindings), "c");
        assert_eq!(resolve("<L[7]>-<USER>", &bindings), "<L[7]>-alice");
        assert_eq!(resolve("<L>", &bindings), "[a, b, c]");
    }

    #[test]
    fn map_lookup_by_key_and_by_value() {
        let local = scope();
        let bindings = Bindings::new(&local);
        assert_eq!(resolve("<M(k2)>", &bindings), "v2");
        assert_eq!(resolve("<M{v1}>", &bindings), "k1");
        assert_eq!(resolve("<M(nope)>", &bindings), "<M(nope)>");
        assert_eq!(resolve("<M>", &bindings), "{(k1, v1), (k2, v2)}");
    }

    #[test]
    fn one_level_of_nesting_is_resolved() {
        let local = scope();
        let bindings = Bindings::new(&local);
        assert_eq!(resolve("<L[<IDX>]>", &bindings), "b");
    }

    #[test]
    fn local_scope_shadows_global_scope() {
        let local: VariableScope = [Variable::scalar("A", "local")].into_iter().collect();
        let global: VariableScope = [
            Variable::scalar("A", "global"),
            Variable::scalar("B", "global-b"),
        ]
        .into_iter()
        .collect();
        let bindings = Bindings::new(&local).with_global(&global);
        assert_eq!(resolve("<A>|<B>", &bindings), "local|global-b");
    }

    #[test]
    fn reserved_names_resolve_without_variables() {
        let local = VariableScope::new();
        let bindings = Bindings::new(&local)
            .with_reserved("INPUT", "u:p")
            .with_reserved("BOTNUM", "3");
        assert_eq!(resolve("<INPUT>@<BOTNUM>", &bindings), "u:p@3");
    }

    #[test]
    fn self_referencing_value_terminates() {
        let local: VariableScope = [Variable::scalar("X", "<X><X>")].into_iter().collect();
        let bindings = Bindings::new(&local);
        let out = resolve("<X>", &bindings);
        assert!(out.starts_with("<X>"));
    }

    #[test]
    fn list_wildcard_fans_out_in_order() {
        let local = scope();
        let bindings = Bindings::new(&local);
        assert_eq!(
            resolve_expanding("item=<L[*]>;<USER>", &bindings),
            vec!["item=a;alice", "item=b;alice", "item=c;alice"]
        );
    }

    #[test]
    fn zipped_lists_pad_with_null() {
        let local: VariableScope = [
            Variable::list("A", ["1", "2", "3"]),
            Variable::list("B", ["x"]),
        ]
        .into_iter()
        .collect();
        let bindings = Bindings::new(&local);
        assert_eq!(
            resolve_expanding("<A[*]><B[*]>", &bindings),
            vec!["1x", "2NULL", "3NULL"]
        );
    }

    #[test]
    fn map_wildcards_expand_values_and_keys() {
        let local = scope();
        let bindings = Bindings::new(&local);
        assert_eq!(resolve_expanding("<M(*)>", &bindings), vec!["v1", "v2"]);
        assert_eq!(resolve_expanding("<M{*}>", &bindings), vec!["k1", "k2"]);
    }

    #[test]
    fn missing_collection_degrades_to_plain_resolution() {
        let local = scope();
        let bindings = Bindings::new(&local);
        assert_eq!(
            resolve_expanding("<NOPE[*]>-<USER>", &bindings),
            vec!["<NOPE[*]>-alice"]
        );
        assert_eq!(resolve_expanding("<NOPE(*)>", &bindings), vec!["<NOPE(*)>"]);
    }

    #[test]
    fn empty_list_expands_to_nothing() {
        let local: VariableScope = [Variable::list("E", Vec::<String>::new())]
            .into_iter()
            .collect();
        let bindings = Bindings::new(&local);
        assert!(resolve_expanding("<E[*]>", &bindings).is_empty());
    }

    proptest! {
        #[test]
        fn resolve_never_panics_and_keeps_unknown_text(s in "[a-zA-Z0-9<>\\[\\]\\(\\)\\{\\} ]{0,40}") {
            let local = VariableScope::new();
            let bindings = Bindings::new(&local);
            prop_assert_eq!(resolve(&s, &bindings), s);
        }
    }
}
