//! A small expression language for step assertions, test-wide success
//! criteria and extraction paths.
//!
//! Expressions are parsed once when the plan is built and evaluated per
//! response against a [`Scope`]. Evaluation records every identifier and
//! value-producing call it resolved in a `received` map so a failed
//! assertion can be reported with the actual values it saw.
//!
//! ```text
//! status_code == 200 && response_time < 500
//! in(headers.Content-Type, ["application/json", "text/json"])
//! equals(json_path("employees.0.name"), "Kate")
//! p90(iteration_duration) < 200
//! ```

mod ast;
mod eval;
mod functions;
mod lexer;
mod parser;

pub use ast::{InfixOp, Node, PrefixOp, Program};
pub use eval::{Evaluator, Scope};
pub(crate) use functions::nearest_rank;

use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("argument error: {0}")]
    Argument(String),
    #[error("operator error: {0}")]
    Operator(String),
}

/// Parse an expression into a reusable program.
pub fn compile(src: &str) -> Result<Arc<Program>, ExprError> {
    parser::Parser::new(src).parse_program(src).map(Arc::new)
}

/// Result of checking a boolean expression.
#[derive(Debug, Clone)]
pub struct Check {
    pub passed: bool,
    pub received: BTreeMap<String, Value>,
    pub error: Option<ExprError>,
}

/// Evaluate `program` and require a boolean result.
pub fn check(program: &Program, scope: &dyn Scope) -> Check {
    let mut evaluator = Evaluator::new(scope);
    let result = evaluator.eval(&program.root);
    let received = evaluator.into_received();
    match result {
        Ok(Value::Bool(passed)) => Check {
            passed,
            received,
            error: None,
        },
        Ok(other) => Check {
            passed: false,
            received,
            error: Some(ExprError::Argument(format!(
                "expression must evaluate to a bool, got {}",
                other.type_name()
            ))),
        },
        Err(err) => Check {
            passed: false,
            received,
            error: Some(err),
        },
    }
}

/// Evaluate `program` and return whatever value it produces.
pub fn resolve(program: &Program, scope: &dyn Scope) -> Result<Value, ExprError> {
    Evaluator::new(scope).eval(&program.root)
}
