//! PARSE step: extracts values from a resolved input into a variable

use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::variables::Variable;
use crate::runner::context::ExecutionContext;
use crate::runner::error::StepError;
use crate::runner::events::LogLevel;
use crate::runner::script::ScriptStep;
use crate::steps::step_text;

pub const KIND: &str = "PARSE";

static MISSING: Value = Value::Null;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ParseMode {
    /// Text between `left` and `right`; an empty delimiter means the start
    /// or end of the input
    Lr { left: String, right: String },
    /// Attribute of the selected elements; `text`, `innerHTML` and
    /// `outerHTML` are recognized as pseudo attributes
    Css { selector: String, attribute: String },
    /// Dotted path, `[n]` or numeric segments index arrays
    Json { path: String },
    /// `output` may reference groups as `[0]`, `[1]`, ...
    Regex { pattern: String, output: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseStep {
    pub label: String,
    pub disabled: bool,
    pub input: String,
    pub variable: String,
    pub mode: ParseMode,
    /// Every match into a List instead of the first into a Scalar
    pub recursive: bool,
    pub is_capture: bool,
    pub global: bool,
    pub prefix: String,
    pub suffix: String,
    /// Store an empty value when nothing matched
    pub create_empty: bool,
}

impl Default for ParseStep {
    fn default() -> Self {
        Self {
            label: KIND.to_string(),
            disabled: false,
            input: "<SOURCE>".to_string(),
            variable: "PARSED".to_string(),
            mode: ParseMode::Lr {
                left: String::new(),
                right: String::new(),
            },
            recursive: false,
            is_capture: false,
            global: false,
            prefix: String::new(),
            suffix: String::new(),
            create_empty: true,
        }
    }
}

impl ParseStep {
    #[must_use]
    pub fn new(variable: impl Into<String>, mode: ParseMode) -> Self {
        Self {
            variable: variable.into(),
            mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }

    #[must_use]
    pub const fn captured(mut self) -> Self {
        self.is_capture = true;
        self
    }

    fn extract(&self, ctx: &ExecutionContext, input: &str) -> Result<Vec<String>, StepError> {
        match &self.mode {
            ParseMode::Lr { left, right } => Ok(parse_lr(
                input,
                &ctx.resolve(left),
                &ctx.resolve(right),
                self.recursive,
            )),
            ParseMode::Css { selector, attribute } => {
                parse_css(input, &ctx.resolve(selector), attribute, self.recursive)
            }
            ParseMode::Json { path } => parse_json(input, &ctx.resolve(path), self.recursive),
            ParseMode::Regex { pattern, output } => {
                parse_regex(input, &ctx.resolve(pattern), output, self.recursive)
            }
        }
    }
}

pub fn parse_lr(input: &str, left: &str, right: &str, recursive: bool) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = input;
    loop {
        let Some(start) = rest.find(left).map(|index| index + left.len()) else {
            break;
        };
        let after = &rest[start..];
        let end = if right.is_empty() {
            after.len()
        } else {
            match after.find(right) {
                Some(end) => end,
                None => break,
            }
        };
        found.push(after[..end].to_string());

        let consumed = start + end + right.len();
        if !recursive || consumed == 0 || consumed >= rest.len() {
            break;
        }
        rest = &rest[consumed..];
    }
    found
}

pub fn parse_css(
    input: &str,
    selector: &str,
    attribute: &str,
    recursive: bool,
) -> Result<Vec<String>, StepError> {
    let selector = Selector::parse(selector)
        .map_err(|e| StepError::Parse(format!("invalid selector '{selector}': {e:?}")))?;
    let document = Html::parse_document(input);

    let values = document.select(&selector).filter_map(|element| match attribute {
        "" | "text" => Some(element.text().collect::<String>()),
        "innerHTML" => Some(element.inner_html()),
        "outerHTML" => Some(element.html()),
        name => element.value().attr(name).map(str::to_string),
    });
    Ok(if recursive {
        values.collect()
    } else {
        values.take(1).collect()
    })
}

pub fn parse_json(input: &str, path: &str, recursive: bool) -> Result<Vec<String>, StepError> {
    let root: Value =
        serde_json::from_str(input).map_err(|e| StepError::Parse(format!("invalid JSON: {e}")))?;

    let mut current = &root;
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        let (name, indexes) = match segment.find('[') {
            Some(open) => (&segment[..open], &segment[open..]),
            None => (segment, ""),
        };
        if !name.is_empty() {
            current = match (current, name.parse::<usize>()) {
                (Value::Array(items), Ok(index)) => items.get(index),
                _ => current.get(name),
            }
            .unwrap_or(&MISSING);
        }
        for index in indexes
            .split(['[', ']'])
            .filter(|part| !part.is_empty())
            .filter_map(|part| part.parse::<usize>().ok())
        {
            current = current.get(index).unwrap_or(&MISSING);
        }
    }

    Ok(match current {
        Value::Null => Vec::new(),
        Value::Array(items) if recursive => items.iter().map(json_text).collect(),
        other => vec![json_text(other)],
    })
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn parse_regex(
    input: &str,
    pattern: &str,
    output: &str,
    recursive: bool,
) -> Result<Vec<String>, StepError> {
    let regex =
        Regex::new(pattern).map_err(|e| StepError::Parse(format!("invalid regex '{pattern}': {e}")))?;

    let render = |captures: regex::Captures<'_>| {
        if output.is_empty() {
            return captures[0].to_string();
        }
        (0..captures.len())
            .rev()
            .fold(output.to_string(), |acc, group| {
                let value = captures.get(group).map_or("", |m| m.as_str());
                acc.replace(&format!("[{group}]"), value)
            })
    };

    Ok(if recursive {
        regex.captures_iter(input).map(render).collect()
    } else {
        regex.captures(input).map(render).into_iter().collect()
    })
}

#[async_trait]
impl ScriptStep for ParseStep {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn disabled(&self) -> bool {
        self.disabled
    }

    async fn process(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        if self.variable.is_empty() {
            return Err(StepError::InvalidArgument("no output variable".to_string()));
        }
        let input = ctx.resolve(&self.input);
        let prefix = ctx.resolve(&self.prefix);
        let suffix = ctx.resolve(&self.suffix);

        let values: Vec<String> = self
            .extract(ctx, &input)?
            .into_iter()
            .map(|value| format!("{prefix}{value}{suffix}"))
            .collect();

        if values.is_empty() && !self.create_empty {
            ctx.log(LogLevel::Warn, format!("Nothing parsed into {}", self.variable));
            return Ok(());
        }

        let variable = if self.recursive {
            ctx.log(
                LogLevel::Info,
                format!("Parsed {} values into {}", values.len(), self.variable),
            );
            Variable::list(&self.variable, values)
        } else {
            let value = values.into_iter().next().unwrap_or_default();
            ctx.log(LogLevel::Info, format!("Parsed {} = {}", self.variable, value));
            Variable::scalar(&self.variable, value)
        };
        let variable = if self.is_capture {
            variable.captured()
        } else {
            variable
        };
        ctx.store(variable, self.global);
        Ok(())
    }

    fn to_text(&self) -> String {
        step_text(KIND, self)
    }
}
