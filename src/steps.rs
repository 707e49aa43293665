//! Built-in script steps
//!
//! Each step is a plain serde struct. Its textual form is the step token
//! followed by the JSON of its fields, e.g.
//!
//! ```text
//! REQUEST {"method":"POST","url":"https://example.com/login","body":"u=<USER>&p=<PASS>"}
//! KEYCHECK {"chains":[{"kind":"SUCCESS","keys":[{"comparer":"CONTAINS","right":"Welcome"}]}]}
//! ```
//!
//! [`loader`] maps tokens back to step constructors.

pub mod captcha;
pub mod delay;
pub mod function;
pub mod keycheck;
pub mod loader;
pub mod parse;
pub mod request;

use serde::Serialize;

pub use captcha::CaptchaStep;
pub use delay::DelayStep;
pub use function::{FunctionOp, FunctionStep};
pub use keycheck::{ChainMode, Comparer, Key, KeyChain, KeyKind, KeycheckStep};
pub use loader::{ScriptLoadError, load_script, load_script_file, script_to_text, step_from_text};
pub use parse::{ParseMode, ParseStep};
pub use request::RequestStep;

/// `KIND {json}`; falls back to the bare token if the fields cannot be
/// serialized
pub(crate) fn step_text<T: Serialize>(kind: &str, step: &T) -> String {
    match serde_json::to_string(step) {
        Ok(json) => format!("{kind} {json}"),
        Err(e) => {
            tracing::warn!("⚠️ Failed to serialize {} step: {}", kind, e);
            kind.to_string()
        }
    }
}
