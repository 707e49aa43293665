//! KEYCHECK step: sets the bot status from key chains
//!
//! Chains are evaluated in order and the first one that matches decides
//! the status. A chain matches when any (OR) or all (AND) of its keys
//! hold.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::status::BotStatus;
use crate::runner::context::ExecutionContext;
use crate::runner::error::StepError;
use crate::runner::events::LogLevel;
use crate::runner::script::ScriptStep;
use crate::steps::step_text;

pub const KIND: &str = "KEYCHECK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyKind {
    Success,
    Failure,
    Ban,
    Retry,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainMode {
    #[default]
    Or,
    And,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Comparer {
    Contains,
    DoesNotContain,
    EqualTo,
    NotEqualTo,
    GreaterThan,
    LessThan,
    MatchesRegex,
    DoesNotMatchRegex,
}

impl Comparer {
    /// Negated comparers must hold for every expanded left value
    const fn is_negative(self) -> bool {
        matches!(
            self,
            Self::DoesNotContain | Self::NotEqualTo | Self::DoesNotMatchRegex
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    #[serde(default = "default_left")]
    pub left: String,
    pub comparer: Comparer,
    pub right: String,
}

fn default_left() -> String {
    "<SOURCE>".to_string()
}

impl Key {
    #[must_use]
    pub fn new(left: impl Into<String>, comparer: Comparer, right: impl Into<String>) -> Self {
        Self {
            left: left.into(),
            comparer,
            right: right.into(),
        }
    }

    /// `comparer` against the page source
    #[must_use]
    pub fn source(comparer: Comparer, right: impl Into<String>) -> Self {
        Self::new(default_left(), comparer, right)
    }

    fn check(&self, ctx: &ExecutionContext) -> Result<bool, StepError> {
        let right = ctx.resolve(&self.right);
        let regex = match self.comparer {
            Comparer::MatchesRegex | Comparer::DoesNotMatchRegex => Some(
                Regex::new(&right)
                    .map_err(|e| StepError::InvalidArgument(format!("bad key regex: {e}")))?,
            ),
            _ => None,
        };

        let lefts = ctx.resolve_expanding(&self.left);
        let holds = |left: &String| compare(self.comparer, left, &right, regex.as_ref());
        Ok(if self.comparer.is_negative() {
            lefts.iter().all(holds)
        } else {
            lefts.iter().any(holds)
        })
    }
}

fn compare(comparer: Comparer, left: &str, right: &str, regex: Option<&Regex>) -> bool {
    let numbers = || Some((left.trim().parse::<f64>().ok()?, right.trim().parse::<f64>().ok()?));
    match comparer {
        Comparer::Contains => left.contains(right),
        Comparer::DoesNotContain => !left.contains(right),
        Comparer::EqualTo => left == right,
        Comparer::NotEqualTo => left != right,
        Comparer::GreaterThan => numbers().is_some_and(|(l, r)| l > r),
        Comparer::LessThan => numbers().is_some_and(|(l, r)| l < r),
        Comparer::MatchesRegex => regex.is_some_and(|re| re.is_match(left)),
        Comparer::DoesNotMatchRegex => regex.is_some_and(|re| !re.is_match(left)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChain {
    pub kind: KeyKind,
    /// Status label for `Custom` chains
    #[serde(default)]
    pub custom_label: String,
    #[serde(default)]
    pub mode: ChainMode,
    #[serde(default)]
    pub keys: Vec<Key>,
}

impl KeyChain {
    #[must_use]
    pub const fn new(kind: KeyKind, keys: Vec<Key>) -> Self {
        Self {
            kind,
            custom_label: String::new(),
            mode: ChainMode::Or,
            keys,
        }
    }

    #[must_use]
    pub fn custom(label: impl Into<String>, keys: Vec<Key>) -> Self {
        Self {
            custom_label: label.into(),
            ..Self::new(KeyKind::Custom, keys)
        }
    }

    #[must_use]
    pub const fn all(mut self) -> Self {
        self.mode = ChainMode::And;
        self
    }

    /// An empty chain never matches
    fn matches(&self, ctx: &ExecutionContext) -> Result<bool, StepError> {
        if self.keys.is_empty() {
            return Ok(false);
        }
        match self.mode {
            ChainMode::Or => {
                for key in &self.keys {
                    if key.check(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ChainMode::And => {
                for key in &self.keys {
                    if !key.check(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
        }
    }

    fn apply(&self, ctx: &mut ExecutionContext) {
        match self.kind {
            KeyKind::Success => ctx.status = BotStatus::Success,
            KeyKind::Failure => ctx.status = BotStatus::Fail,
            KeyKind::Ban => ctx.status = BotStatus::Ban,
            KeyKind::Retry => ctx.status = BotStatus::Retry,
            KeyKind::Custom => {
                let label = if self.custom_label.is_empty() {
                    BotStatus::Custom.as_str().to_string()
                } else {
                    self.custom_label.clone()
                };
                ctx.set_custom_status(label);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeycheckStep {
    pub label: String,
    pub disabled: bool,
    pub chains: Vec<KeyChain>,
    pub ban_on_4xx: bool,
    pub ban_if_no_match: bool,
}

impl Default for KeycheckStep {
    fn default() -> Self {
        Self {
            label: KIND.to_string(),
            disabled: false,
            chains: Vec::new(),
            ban_on_4xx: false,
            ban_if_no_match: false,
        }
    }
}

impl KeycheckStep {
    #[must_use]
    pub fn new(chains: Vec<KeyChain>) -> Self {
        Self {
            chains,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ScriptStep for KeycheckStep {
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
        let code = ctx.response_code();
        if self.ban_on_4xx && (400..500).contains(&code) {
            ctx.status = BotStatus::Ban;
            ctx.log(LogLevel::Warn, format!("Response code {code}, banning"));
            return Ok(());
        }

        for (index, chain) in self.chains.iter().enumerate() {
            if chain.matches(ctx)? {
                chain.apply(ctx);
                ctx.log(
                    LogLevel::Info,
                    format!("Key chain {} matched, status {}", index, ctx.status_label()),
                );
                return Ok(());
            }
        }

        if self.ban_if_no_match {
            ctx.status = BotStatus::Ban;
            ctx.log(LogLevel::Warn, "No key chain matched, banning");
        }
        Ok(())
    }

    fn to_text(&self) -> String {
        step_text(KIND, self)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::domain::variables::Variable;
    use crate::runner::context::hidden;
    use crate::runner::context::testing::context;

    fn with_source(source: &str, code: &str) -> ExecutionContext {
        let mut ctx = context("a:b");
        ctx.variables.set_hidden(Variable::scalar(hidden::SOURCE, source));
        ctx.variables
            .set_hidden(Variable::scalar(hidden::RESPONSE_CODE, code));
        ctx
    }

    #[rstest]
    #[case(Comparer::Contains, "hello world", "world", true)]
    #[case(Comparer::DoesNotContain, "hello world", "world", false)]
    #[case(Comparer::EqualTo, "42", "42", true)]
    #[case(Comparer::NotEqualTo, "42", "42", false)]
    #[case(Comparer::GreaterThan, "10", "9.5", true)]
    #[case(Comparer::LessThan, "ten", "9", false)]
    #[case(Comparer::MatchesRegex, "id=123", r"id=\d+", true)]
    #[case(Comparer::DoesNotMatchRegex, "id=abc", r"id=\d+", true)]
    fn comparers(#[case] comparer: Comparer, #[case] left: &str, #[case] right: &str, #[case] expected: bool) {
        let regex = Regex::new(right).ok();
        assert_eq!(compare(comparer, left, right, regex.as_ref()), expected);
    }

    #[tokio::test]
    async fn first_matching_chain_wins() {
        let step = KeycheckStep::new(vec![
            KeyChain::new(KeyKind::Failure, vec![Key::source(Comparer::Contains, "invalid")]),
            KeyChain::new(KeyKind::Success, vec![Key::source(Comparer::Contains, "welcome")]),
            KeyChain::custom("2FA", vec![Key::source(Comparer::Contains, "welcome")]),
        ]);
        let mut ctx = with_source("welcome back", "200");

        step.process(&mut ctx).await.unwrap();

        assert_eq!(ctx.status, BotStatus::Success);
    }

    #[tokio::test]
    async fn and_chains_need_every_key() {
        let step = KeycheckStep::new(vec![
            KeyChain::custom(
                "2FA",
                vec![
                    Key::source(Comparer::Contains, "welcome"),
                    Key::new("<RESPONSECODE>", Comparer::EqualTo, "302"),
                ],
            )
            .all(),
        ]);

        let mut ctx = with_source("welcome", "200");
        step.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.status, BotStatus::None);

        let mut ctx = with_source("welcome", "302");
        step.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.status_label(), "2FA");
    }

    #[tokio::test]
    async fn ban_on_4xx_and_ban_if_no_match() {
        let step = KeycheckStep {
            ban_on_4xx: true,
            ..KeycheckStep::new(vec![KeyChain::new(
                KeyKind::Success,
                vec![Key::source(Comparer::Contains, "ok")],
            )])
        };
        let mut ctx = with_source("ok", "403");
        step.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.status, BotStatus::Ban);

        let step = KeycheckStep {
            ban_if_no_match: true,
            ..KeycheckStep::default()
        };
        let mut ctx = with_source("anything", "200");
        step.process(&mut ctx).await.unwrap();
        assert_eq!(ctx.status, BotStatus::Ban);
    }

    #[tokio::test]
    async fn invalid_regex_is_a_step_error() {
        let step = KeycheckStep::new(vec![KeyChain::new(
            KeyKind::Success,
            vec![Key::source(Comparer::MatchesRegex, "(")],
        )]);
        let mut ctx = with_source("x", "200");
        assert!(matches!(
            step.process(&mut ctx).await,
            Err(StepError::InvalidArgument(_))
        ));
    }
}
