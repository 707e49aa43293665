//! Domain module - records, variables, proxies and outcomes
//!
//! Plain data types shared by the runner, the built-in steps and the
//! infrastructure layer. Nothing in here performs I/O.

pub mod hit;
pub mod proxy;
pub mod record;
pub mod status;
pub mod variables;

pub use hit::{Bucket, Hit};
pub use proxy::{ProxyEndpoint, ProxyParseError, ProxyProtocol, ProxyStatus};
pub use record::{
    DataRuleDef, DataRuleKind, DataRules, Needle, Record, RecordSchema, RecordSchemaDef,
    RecordSchemaError,
};
pub use status::BotStatus;
pub use variables::{SharedScope, Variable, VariableKind, VariableScope, VariableValue};
