//! FUNCTION step: string functions applied to a resolved input
//!
//! The input is resolved with wildcard expansion; each expanded value goes
//! through the function and more than one result is stored as a List.

use std::borrow::Cow;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::variables::Variable;
use crate::runner::context::ExecutionContext;
use crate::runner::error::StepError;
use crate::runner::events::LogLevel;
use crate::runner::script::ScriptStep;
use crate::steps::step_text;

pub const KIND: &str = "FUNCTION";

const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";
const HEX: &str = "0123456789abcdef";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FunctionOp {
    /// Input as is
    Constant,
    Uppercase,
    Lowercase,
    Length,
    Replace {
        what: String,
        with: String,
        #[serde(default)]
        use_regex: bool,
    },
    UrlEncode,
    UrlDecode,
    RandomNum { min: i64, max: i64 },
    /// Input is a mask: `?l` lower, `?u` upper, `?d` digit, `?s` symbol,
    /// `?h` hex, `?a` any of those
    RandomString,
    /// blake3, hex encoded
    Hash,
    UnixTime,
    Substring { index: usize, length: usize },
    CountOccurrences { what: String },
    /// Splits the input into a List
    Split { separator: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionStep {
    pub label: String,
    pub disabled: bool,
    pub input: String,
    pub variable: String,
    pub op: FunctionOp,
    pub is_capture: bool,
    pub global: bool,
}

impl Default for FunctionStep {
    fn default() -> Self {
        Self {
            label: KIND.to_string(),
            disabled: false,
            input: String::new(),
            variable: "OUTPUT".to_string(),
            op: FunctionOp::Constant,
            is_capture: false,
            global: false,
        }
    }
}

impl FunctionStep {
    #[must_use]
    pub fn new(variable: impl Into<String>, input: impl Into<String>, op: FunctionOp) -> Self {
        Self {
            variable: variable.into(),
            input: input.into(),
            op,
            ..Self::default()
        }
    }
}

/// Applies `op` to one input value
pub fn apply(op: &FunctionOp, input: &str, rng: &mut fastrand::Rng) -> Result<Vec<String>, StepError> {
    let single = |value: String| -> Result<Vec<String>, StepError> { Ok(vec![value]) };
    match op {
        FunctionOp::Constant => single(input.to_string()),
        FunctionOp::Uppercase => single(input.to_uppercase()),
        FunctionOp::Lowercase => single(input.to_lowercase()),
        FunctionOp::Length => single(input.chars().count().to_string()),
        FunctionOp::Replace {
            what,
            with,
            use_regex,
        } => {
            if *use_regex {
                let regex = Regex::new(what)
                    .map_err(|e| StepError::InvalidArgument(format!("bad regex '{what}': {e}")))?;
                single(regex.replace_all(input, with.as_str()).into_owned())
            } else {
                single(input.replace(what.as_str(), with))
            }
        }
        FunctionOp::UrlEncode => single(url::form_urlencoded::byte_serialize(input.as_bytes()).collect()),
        FunctionOp::UrlDecode => single(url_decode(input)?),
        FunctionOp::RandomNum { min, max } => {
            let (low, high) = if min <= max { (*min, *max) } else { (*max, *min) };
            single(rng.i64(low..=high).to_string())
        }
        FunctionOp::RandomString => single(random_string(input, rng)),
        FunctionOp::Hash => single(blake3::hash(input.as_bytes()).to_hex().to_string()),
        FunctionOp::UnixTime => single(chrono::Utc::now().timestamp().to_string()),
        FunctionOp::Substring { index, length } => {
            let total = input.chars().count();
            if *index >= total {
                return Err(StepError::InvalidArgument(format!(
                    "substring index {index} outside input of length {total}"
                )));
            }
            single(input.chars().skip(*index).take(*length).collect())
        }
        FunctionOp::CountOccurrences { what } => {
            if what.is_empty() {
                return Err(StepError::InvalidArgument("nothing to count".to_string()));
            }
            single(input.matches(what.as_str()).count().to_string())
        }
        FunctionOp::Split { separator } => {
            if separator.is_empty() {
                return Err(StepError::InvalidArgument("empty separator".to_string()));
            }
            Ok(input.split(separator.as_str()).map(str::to_string).collect())
        }
    }
}

/// Form decoding: `+` is a space, malformed escapes are kept verbatim
fn url_decode(input: &str) -> Result<String, StepError> {
    urlencoding::decode(&input.replace('+', " "))
        .map(Cow::into_owned)
        .map_err(|e| StepError::InvalidArgument(format!("decoded text is not UTF-8: {e}")))
}

fn random_string(mask: &str, rng: &mut fastrand::Rng) -> String {
    let any = [LOWERCASE, UPPERCASE, DIGITS, SYMBOLS].concat();
    let mut output = String::with_capacity(mask.len());
    let mut chars = mask.chars().peekable();
    while let Some(c) = chars.next() {
        let charset = match (c, chars.peek()) {
            ('?', Some('l')) => LOWERCASE,
            ('?', Some('u')) => UPPERCASE,
            ('?', Some('d')) => DIGITS,
            ('?', Some('s')) => SYMBOLS,
            ('?', Some('h')) => HEX,
            ('?', Some('a')) => any.as_str(),
            _ => {
                output.push(c);
                continue;
            }
        };
        chars.next();
        // Every charset is ASCII
        output.push(char::from(charset.as_bytes()[rng.usize(..charset.len())]));
    }
    output
}

#[async_trait]
impl ScriptStep for FunctionStep {
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

        let inputs = ctx.resolve_expanding(&self.input);
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in &inputs {
            outputs.extend(apply(&self.op, input, &mut ctx.rng)?);
        }

        let splits = matches!(self.op, FunctionOp::Split { .. });
        let variable = if splits || outputs.len() != 1 {
            Variable::list(&self.variable, outputs)
        } else {
            Variable::scalar(&self.variable, outputs.remove(0))
        };
        ctx.log(LogLevel::Info, format!("{} = {}", self.variable, variable));

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

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::runner::context::testing::context;

    fn run(op: FunctionOp, input: &str) -> Vec<String> {
        apply(&op, input, &mut fastrand::Rng::with_seed(7)).unwrap()
    }

    #[rstest]
    #[case(FunctionOp::Uppercase, "abc", "ABC")]
    #[case(FunctionOp::Lowercase, "AbC", "abc")]
    #[case(FunctionOp::Length, "héllo", "5")]
    #[case(FunctionOp::UrlEncode, "a b&c", "a+b%26c")]
    #[case(FunctionOp::UrlDecode, "a+b%26c%zz", "a b&c%zz")]
    #[case(FunctionOp::UrlDecode, "%+1", "% 1")]
    #[case(FunctionOp::UrlDecode, "1%2B1%3D2", "1+1=2")]
    #[case(FunctionOp::UrlDecode, "caf%C3%A9%", "café%")]
    #[case(FunctionOp::Substring { index: 1, length: 3 }, "abcdef", "bcd")]
    #[case(FunctionOp::CountOccurrences { what: "ab".into() }, "abcabab", "3")]
    #[case(FunctionOp::Replace { what: r"\d".into(), with: "#".into(), use_regex: true }, "a1b2", "a#b#")]
    #[case(FunctionOp::Replace { what: "x".into(), with: "y".into(), use_regex: false }, "xox", "yoy")]
    fn single_value_functions(#[case] op: FunctionOp, #[case] input: &str, #[case] expected: &str) {
        assert_eq!(run(op, input), vec![expected.to_string()]);
    }

    #[test]
    fn hash_is_blake3_hex() {
        let hashed = run(FunctionOp::Hash, "abc");
        assert_eq!(hashed[0], blake3::hash(b"abc").to_hex().to_string());
        assert_eq!(hashed[0].len(), 64);
    }

    #[test]
    fn random_values_respect_their_bounds() {
        let mut rng = fastrand::Rng::with_seed(1);
        for _ in 0..100 {
            let value: i64 = apply(&FunctionOp::RandomNum { min: 5, max: 1 }, "", &mut rng).unwrap()[0]
                .parse()
                .unwrap();
            assert!((1..=5).contains(&value));
        }

        let generated = apply(&FunctionOp::RandomString, "id-?d?d?u?h?a", &mut rng).unwrap();
        let chars: Vec<char> = generated[0].chars().collect();
        assert_eq!(chars.len(), 8);
        assert_eq!(&generated[0][..3], "id-");
        assert!(chars[3].is_ascii_digit() && chars[4].is_ascii_digit());
        assert!(chars[5].is_ascii_uppercase());
        assert!(chars[6].is_ascii_hexdigit());
    }

    #[test]
    fn substring_out_of_range_is_an_error() {
        let result = apply(
            &FunctionOp::Substring { index: 10, length: 1 },
            "abc",
            &mut fastrand::Rng::new(),
        );
        assert!(matches!(result, Err(StepError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn split_stores_a_list_and_expansion_maps_each_value() {
        let mut ctx = context("a:b");
        FunctionStep::new("PARTS", "x,y,z", FunctionOp::Split { separator: ",".into() })
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.variables.get_list("PARTS").map(<[String]>::len), Some(3));

        FunctionStep::new("UPPER", "<PARTS[*]>", FunctionOp::Uppercase)
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(
            ctx.variables.get_list("UPPER"),
            Some(&["X".to_string(), "Y".to_string(), "Z".to_string()][..])
        );

        FunctionStep::new("NAME", "<USER>", FunctionOp::Uppercase)
            .process(&mut ctx)
            .await
            .unwrap();
        assert_eq!(ctx.variables.get_scalar("NAME"), Some("A"));
    }
}
