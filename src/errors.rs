use miette::Diagnostic;
use thiserror::Error;

use crate::api::Reason;

/// Errors produced while evaluating a condition expression.
///
/// Every variant is fail-closed: the engine maps any of these to a
/// non-allow decision with `ERROR_IN_EVALUATION`, never to a silent
/// grant or deny.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum EvalError {
    #[error("Invalid condition expression: {0}")]
    #[diagnostic(
        code(fulcrum::condition::parse),
        help("Supported operators: && || ! == != > >= < <= + - * / % =~ !~ in, plus function calls and parentheses")
    )]
    Parse(String),

    #[error("Invalid attribute type: {0}")]
    #[diagnostic(code(fulcrum::condition::attribute_type))]
    InvalidAttributeType(String),

    #[error("Invalid attribute value: {0}")]
    #[diagnostic(code(fulcrum::condition::attribute_value))]
    InvalidAttributeValue(String),

    #[error("Invalid datetime value: {0}")]
    #[diagnostic(
        code(fulcrum::condition::datetime_value),
        help("Datetime strings must use RFC3339, RubyDate, UnixDate, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD` layouts")
    )]
    InvalidDatetimeValue(String),

    #[error("Invalid parameter value: {0}")]
    #[diagnostic(code(fulcrum::condition::parameter_value))]
    InvalidParameterValue(String),

    #[error("Unknown attribute `{0}`")]
    #[diagnostic(code(fulcrum::condition::unknown_attribute))]
    UnknownAttribute(String),

    #[error("Unknown function `{0}`")]
    #[diagnostic(
        code(fulcrum::condition::unknown_function),
        help("Function names resolve against the built-ins (Sqrt, Sum, Avg, Min, Max, IsSubSet) and the functions registered in the store")
    )]
    UnknownFunction(String),

    #[error("Function `{name}` failed: {detail}")]
    #[diagnostic(code(fulcrum::function::call))]
    Function { name: String, detail: String },

    #[error("Condition must evaluate to a boolean, got {0}")]
    #[diagnostic(code(fulcrum::condition::not_boolean))]
    NotBoolean(String),

    #[error("Evaluation deadline exceeded")]
    #[diagnostic(code(fulcrum::deadline))]
    DeadlineExceeded,
}

/// Top-level error type of the decision point.
#[derive(Debug, Error, Diagnostic)]
pub enum PdpError {
    #[error("Service `{0}` is not found")]
    #[diagnostic(
        code(fulcrum::service_not_found),
        help("The request names a service the policy store does not contain; decisions fail closed")
    )]
    ServiceNotFound(String),

    #[error("Policy store error: {0}")]
    #[diagnostic(
        code(fulcrum::store),
        help("Store failures never grant access; the request fails closed")
    )]
    Store(String),

    #[error("Token assertion failed: {0}")]
    #[diagnostic(code(fulcrum::assertion))]
    Assertion(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Evaluation(#[from] EvalError),

    #[error("Config error: {0}")]
    #[diagnostic(code(fulcrum::config))]
    Config(#[from] config::ConfigError),

    #[error("Discover error: {0}")]
    #[diagnostic(code(fulcrum::discover))]
    Discover(String),

    #[error("Internal error: {0}")]
    #[diagnostic(code(fulcrum::internal))]
    Internal(String),
}

impl PdpError {
    /// The reason code a transport layer should report for this error.
    /// Every error path is an evaluation failure from the caller's point
    /// of view; the decision fails closed.
    pub fn reason(&self) -> Reason {
        Reason::ErrorInEvaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_error_messages_are_stable() {
        let e = EvalError::InvalidAttributeType("`&&` requires boolean operands".into());
        assert_eq!(
            e.to_string(),
            "Invalid attribute type: `&&` requires boolean operands"
        );

        let e = EvalError::InvalidDatetimeValue("not-a-date".into());
        assert!(e.to_string().starts_with("Invalid datetime value"));
    }

    #[test]
    fn test_every_error_maps_to_error_in_evaluation() {
        let errors: Vec<PdpError> = vec![
            PdpError::ServiceNotFound("crm".into()),
            PdpError::Store("backend down".into()),
            PdpError::Assertion("bad token".into()),
            PdpError::Evaluation(EvalError::DeadlineExceeded),
            PdpError::Discover("unsupported".into()),
        ];
        for e in errors {
            assert_eq!(e.reason(), Reason::ErrorInEvaluation);
        }
    }
}
