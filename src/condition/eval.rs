//! Evaluate a parsed expression against an attribute environment.

use std::cmp::Ordering;
use std::collections::HashMap;

use regex::Regex;

use crate::condition::builtins;
use crate::condition::parser::{BinOp, Expr, UnaryOp};
use crate::condition::value::{check_homogeneous, Value};
use crate::errors::EvalError;

/// Resolves non-built-in function calls, typically against the functions
/// registered in the policy store.
pub trait FunctionResolver: Send + Sync {
    fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError>;
}

/// A resolver that knows no functions. Useful for stores without custom
/// functions and for tests.
pub struct NoFunctions;

impl FunctionResolver for NoFunctions {
    fn call(&self, name: &str, _args: &[Value]) -> Result<Value, EvalError> {
        Err(EvalError::UnknownFunction(name.to_string()))
    }
}

/// The evaluation environment: request attributes (built-ins already
/// merged in) and the function resolver.
pub struct Env<'a> {
    pub attributes: &'a HashMap<String, Value>,
    pub functions: &'a dyn FunctionResolver,
}

impl<'a> Env<'a> {
    pub fn new(attributes: &'a HashMap<String, Value>, functions: &'a dyn FunctionResolver) -> Self {
        Self {
            attributes,
            functions,
        }
    }
}

/// Evaluate a condition to its boolean result. A non-boolean outcome is
/// an evaluation error, never a silent false.
pub fn evaluate_bool(expr: &Expr, env: &Env<'_>) -> Result<bool, EvalError> {
    match evaluate(expr, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::NotBoolean(other.type_name().to_string())),
    }
}

pub fn evaluate(expr: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Attr(name) => env
            .attributes
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownAttribute(name.clone())),
        Expr::Unary { op, expr } => {
            let v = evaluate(expr, env)?;
            match op {
                UnaryOp::Not => match v {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(EvalError::InvalidAttributeType(format!(
                        "`!` requires a boolean operand, got {}",
                        other.type_name()
                    ))),
                },
                UnaryOp::Neg => match v {
                    Value::Number(n) => Ok(Value::Number(-n)),
                    other => Err(EvalError::InvalidAttributeType(format!(
                        "unary `-` requires a numeric operand, got {}",
                        other.type_name()
                    ))),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, env),
        Expr::In { needle, haystack } => eval_in(needle, haystack, env),
        Expr::List(items) => {
            let values: Result<Vec<Value>, EvalError> =
                items.iter().map(|e| evaluate(e, env)).collect();
            let values = values?;
            check_homogeneous(&values)?;
            Ok(Value::Array(values))
        }
        Expr::Call { name, args } => {
            let values: Result<Vec<Value>, EvalError> =
                args.iter().map(|e| evaluate(e, env)).collect();
            let values = values?;
            match builtins::call(name, &values) {
                Some(result) => result,
                None => env.functions.call(name, &values),
            }
        }
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    // Logical operators short-circuit on the left operand.
    if matches!(op, BinOp::And | BinOp::Or) {
        let l = expect_bool(op, evaluate(left, env)?)?;
        return match (op, l) {
            (BinOp::And, false) => Ok(Value::Bool(false)),
            (BinOp::Or, true) => Ok(Value::Bool(true)),
            _ => Ok(Value::Bool(expect_bool(op, evaluate(right, env)?)?)),
        };
    }

    let l = evaluate(left, env)?;
    let r = evaluate(right, env)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(l == r)),
        BinOp::Ne => Ok(Value::Bool(l != r)),
        BinOp::Gt => Ok(Value::Bool(l.compare(&r)? == Ordering::Greater)),
        BinOp::Ge => Ok(Value::Bool(l.compare(&r)? != Ordering::Less)),
        BinOp::Lt => Ok(Value::Bool(l.compare(&r)? == Ordering::Less)),
        BinOp::Le => Ok(Value::Bool(l.compare(&r)? != Ordering::Greater)),
        BinOp::Add => match (&l, &r) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Err(EvalError::InvalidAttributeType(format!(
                "`+` requires two numbers or two strings, got {} and {}",
                l.type_name(),
                r.type_name()
            ))),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            let (a, b) = match (l.as_number(), r.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(EvalError::InvalidAttributeType(format!(
                        "arithmetic requires numeric operands, got {} and {}",
                        l.type_name(),
                        r.type_name()
                    )));
                }
            };
            let n = match op {
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                // Truncated modulo: the result takes the sign of the
                // dividend, e.g. -25 % 3 == -1.
                BinOp::Rem => a % b,
                _ => unreachable!(),
            };
            Ok(Value::Number(n))
        }
        BinOp::Match => Ok(Value::Bool(regex_match(&l, &r)?)),
        BinOp::NotMatch => Ok(Value::Bool(!regex_match(&l, &r)?)),
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn expect_bool(op: BinOp, v: Value) -> Result<bool, EvalError> {
    v.as_bool().ok_or_else(|| {
        let sym = if op == BinOp::And { "&&" } else { "||" };
        EvalError::InvalidAttributeType(format!(
            "`{sym}` requires boolean operands, got {}",
            v.type_name()
        ))
    })
}

/// Unanchored regex match: the pattern may match anywhere in the subject
/// unless it anchors itself.
fn regex_match(subject: &Value, pattern: &Value) -> Result<bool, EvalError> {
    let (Some(subject), Some(pattern)) = (subject.as_str(), pattern.as_str()) else {
        return Err(EvalError::InvalidAttributeType(
            "`=~` requires string operands".into(),
        ));
    };
    let re = Regex::new(pattern)
        .map_err(|e| EvalError::InvalidParameterValue(format!("bad pattern `{pattern}`: {e}")))?;
    Ok(re.is_match(subject))
}

fn eval_in(needle: &Expr, haystack: &Expr, env: &Env<'_>) -> Result<Value, EvalError> {
    let needle = evaluate(needle, env)?;
    let haystack = evaluate(haystack, env)?;

    // An array on the left is a non-match, not an error. Documented
    // per-case behavior carried over from the source system.
    if matches!(needle, Value::Array(_)) {
        return Ok(Value::Bool(false));
    }

    let Some(items) = haystack.as_array() else {
        return Err(EvalError::InvalidAttributeType(format!(
            "`in` requires an array on the right side, got {}",
            haystack.type_name()
        )));
    };
    if let Some(first) = items.first() {
        if first.type_name() != needle.type_name() {
            return Err(EvalError::InvalidAttributeType(format!(
                "`in` compares {} with an array of {}",
                needle.type_name(),
                first.type_name()
            )));
        }
    }
    Ok(Value::Bool(items.contains(&needle)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parser::parse;

    fn eval_with(cond: &str, attrs: &[(&str, Value)]) -> Result<bool, EvalError> {
        let attributes: HashMap<String, Value> = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let env = Env::new(&attributes, &NoFunctions);
        evaluate_bool(&parse(cond).unwrap(), &env)
    }

    #[test]
    fn test_arithmetic_scenario() {
        // (s1+5-s2*2)/3%4 == s3 with s1=20, s2=2: (20+5-4)/3 = 7, 7%4 = 3
        let attrs = [
            ("s1", Value::Number(20.0)),
            ("s2", Value::Number(2.0)),
            ("s3", Value::Number(3.0)),
        ];
        assert!(eval_with("(s1+5-s2*2)/3%4 == s3", &attrs).unwrap());

        let attrs = [
            ("s1", Value::Number(20.0)),
            ("s2", Value::Number(2.0)),
            ("s3", Value::Number(2.0)),
        ];
        assert!(!eval_with("(s1+5-s2*2)/3%4 == s3", &attrs).unwrap());
    }

    #[test]
    fn test_truncated_modulo() {
        assert!(eval_with("-25 % 3 == -1", &[]).unwrap());
        assert!(eval_with("25 % 3 == 1", &[]).unwrap());
    }

    #[test]
    fn test_boolean_scenario() {
        let cases = [
            (false, true, false, false),
            (true, true, false, false),
            (false, false, true, true),
        ];
        for (s1, s2, s3, want) in cases {
            let attrs = [
                ("s1", Value::Bool(s1)),
                ("s2", Value::Bool(s2)),
                ("s3", Value::Bool(s3)),
            ];
            assert_eq!(
                eval_with("s1 && !s2 || s3 == true", &attrs).unwrap(),
                want,
                "s1={s1} s2={s2} s3={s3}"
            );
        }
    }

    #[test]
    fn test_membership_scenario() {
        let attrs = [("x", Value::Number(3.5))];
        assert!(!eval_with("x in (1, 2.0, -2.1, 3.567)", &attrs).unwrap());

        let attrs = [("x", Value::Number(3.567))];
        assert!(eval_with("x in (1, 2.0, -2.1, 3.567)", &attrs).unwrap());
    }

    #[test]
    fn test_membership_against_attribute_array() {
        let groups = Value::Array(vec![Value::from("manager"), Value::from("tester")]);
        let attrs = [("request_groups", groups)];
        assert!(eval_with("'manager' in request_groups", &attrs).unwrap());
        assert!(!eval_with("'intern' in request_groups", &attrs).unwrap());
    }

    #[test]
    fn test_membership_array_on_left_is_false() {
        let attrs = [("xs", Value::Array(vec![Value::Number(1.0)]))];
        assert!(!eval_with("xs in (1, 2)", &attrs).unwrap());
    }

    #[test]
    fn test_membership_type_mismatch_is_error() {
        let attrs = [("x", Value::from("SZ"))];
        let err = eval_with("x in (1, 2)", &attrs).unwrap_err();
        assert!(matches!(err, EvalError::InvalidAttributeType(_)));
    }

    #[test]
    fn test_membership_scalar_rhs_is_error() {
        let attrs = [("x", Value::Number(1.0)), ("y", Value::Number(1.0))];
        let err = eval_with("x in y", &attrs).unwrap_err();
        assert!(matches!(err, EvalError::InvalidAttributeType(_)));
    }

    #[test]
    fn test_is_sub_set_scenario() {
        let s1 = Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]);
        let s2 = Value::Array(vec![
            Value::Number(1.0),
            Value::Number(5.0),
            Value::Number(2.0),
            Value::Number(3.0),
        ]);
        assert!(eval_with("IsSubSet(s1, s2)", &[("s1", s1), ("s2", s2)]).unwrap());

        let s1 = Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]);
        let s2 = Value::Array(vec![
            Value::Number(1.0),
            Value::Number(5.0),
            Value::Number(-2.0),
            Value::Number(3.0),
        ]);
        assert!(!eval_with("IsSubSet(s1, s2)", &[("s1", s1), ("s2", s2)]).unwrap());
    }

    #[test]
    fn test_string_concat_and_compare() {
        let attrs = [("a", Value::from("a")), ("b", Value::from("b"))];
        assert!(eval_with("a + b == 'ab'", &attrs).unwrap());

        let attrs = [("a", Value::from("abcd"))];
        assert!(eval_with("a > 'abc'", &attrs).unwrap());
    }

    #[test]
    fn test_regex_match_unanchored() {
        let attrs = [("a", Value::from("aget_1"))];
        assert!(eval_with("a =~ 'get.*'", &attrs).unwrap());

        let attrs = [("a", Value::from("got_1"))];
        assert!(eval_with("!(a =~ '^get.*')", &attrs).unwrap());

        let attrs = [("a", Value::from("adelete"))];
        assert!(eval_with("a !~ '^delete.*'", &attrs).unwrap());

        let attrs = [("a", Value::from("user@example.com"))];
        assert!(eval_with("a =~ '.+@example.com'", &attrs).unwrap());
    }

    #[test]
    fn test_non_boolean_condition_is_error() {
        let attrs = [("a", Value::Number(1.0))];
        let err = eval_with("a", &attrs).unwrap_err();
        assert!(matches!(err, EvalError::NotBoolean(_)));
    }

    #[test]
    fn test_unknown_attribute_is_error() {
        let err = eval_with("missing == 1", &[]).unwrap_err();
        assert!(matches!(err, EvalError::UnknownAttribute(_)));
    }

    #[test]
    fn test_unknown_function_is_error() {
        let err = eval_with("Frobnicate(1) == 1", &[]).unwrap_err();
        assert!(matches!(err, EvalError::UnknownFunction(_)));
    }

    #[test]
    fn test_logical_operand_type_error() {
        let attrs = [("a", Value::Number(1.0)), ("b", Value::Bool(true))];
        let err = eval_with("a && b", &attrs).unwrap_err();
        assert!(matches!(err, EvalError::InvalidAttributeType(_)));
    }

    #[test]
    fn test_equality_across_types_is_false() {
        let attrs = [("a", Value::Bool(true))];
        assert!(!eval_with("a == 'true'", &attrs).unwrap());
        assert!(eval_with("a != 'true'", &attrs).unwrap());
    }

    #[test]
    fn test_datetime_comparison() {
        let attrs = [("a", Value::Number(1_600_000_000.0))];
        assert!(eval_with("a < '2026-11-02'", &attrs).unwrap());
        assert!(eval_with("a > '2017-09-04 12:00:00'", &attrs).unwrap());
    }

    #[test]
    fn test_short_circuit() {
        // The right side would error (unknown attribute), but the left
        // side decides the outcome first.
        let attrs = [("a", Value::Bool(false))];
        assert!(!eval_with("a && missing", &attrs).unwrap());
        let attrs = [("a", Value::Bool(true))];
        assert!(eval_with("a || missing", &attrs).unwrap());
    }
}
