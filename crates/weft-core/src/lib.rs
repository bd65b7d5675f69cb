pub mod config;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod expression;
pub mod policy;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{ErrorKind, Result, WeftError};
pub use event::{EngineEvent, EventBus};
pub use expression::{CompiledExpression, Expression, ExpressionCache, SimpleExpression};
pub use types::*;
