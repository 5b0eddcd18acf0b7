//! Built-in condition functions.

use crate::condition::value::{check_homogeneous, Value};
use crate::errors::EvalError;

/// Dispatch a built-in by name. Returns `None` when the name is not a
/// built-in, so the caller can fall through to registered functions.
pub fn call(name: &str, args: &[Value]) -> Option<Result<Value, EvalError>> {
    match name {
        "Sqrt" => Some(sqrt(args)),
        "Sum" => Some(sum(args).map(Value::Number)),
        "Avg" => Some(avg(args)),
        "Min" => Some(min(args)),
        "Max" => Some(max(args)),
        "IsSubSet" => Some(is_sub_set(args)),
        _ => None,
    }
}

fn numbers(args: &[Value], usage: &str) -> Result<Vec<f64>, EvalError> {
    args.iter()
        .map(|v| {
            v.as_number()
                .ok_or_else(|| EvalError::InvalidParameterValue(usage.to_string()))
        })
        .collect()
}

fn sqrt(args: &[Value]) -> Result<Value, EvalError> {
    const USAGE: &str = "Usage: Sqrt(x)";
    if args.len() != 1 {
        return Err(EvalError::InvalidParameterValue(USAGE.into()));
    }
    let x = numbers(args, USAGE)?[0];
    Ok(Value::Number(x.sqrt()))
}

fn sum(args: &[Value]) -> Result<f64, EvalError> {
    const USAGE: &str = "Usage: Sum(x1, x2, ...), xi must be numeric";
    Ok(numbers(args, USAGE)?.iter().sum())
}

fn avg(args: &[Value]) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Ok(Value::Number(0.0));
    }
    Ok(Value::Number(sum(args)? / args.len() as f64))
}

fn min(args: &[Value]) -> Result<Value, EvalError> {
    const USAGE: &str = "Usage: Min(x1, x2, ...), xi must be numeric";
    if args.is_empty() {
        return Err(EvalError::InvalidParameterValue(USAGE.into()));
    }
    let ns = numbers(args, USAGE)?;
    Ok(Value::Number(ns.iter().copied().fold(f64::INFINITY, f64::min)))
}

fn max(args: &[Value]) -> Result<Value, EvalError> {
    const USAGE: &str = "Usage: Max(x1, x2, ...), xi must be numeric";
    if args.is_empty() {
        return Err(EvalError::InvalidParameterValue(USAGE.into()));
    }
    let ns = numbers(args, USAGE)?;
    Ok(Value::Number(
        ns.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    ))
}

/// `IsSubSet(S1, S2)` is true iff every element of S1 occurs in S2. Both
/// arguments must be homogeneous arrays of the same element type. An
/// empty S1 is not a subset of anything.
fn is_sub_set(args: &[Value]) -> Result<Value, EvalError> {
    const USAGE: &str = "Usage: IsSubSet(S1, S2) - both arguments must be arrays";
    let [a, b] = args else {
        return Err(EvalError::InvalidParameterValue(USAGE.into()));
    };
    let (Some(a), Some(b)) = (a.as_array(), b.as_array()) else {
        return Err(EvalError::InvalidParameterValue(USAGE.into()));
    };
    check_homogeneous(a)?;
    check_homogeneous(b)?;
    if let (Some(ea), Some(eb)) = (a.first(), b.first()) {
        if ea.type_name() != eb.type_name() {
            return Err(EvalError::InvalidAttributeType(format!(
                "IsSubSet compares {} elements with {} elements",
                ea.type_name(),
                eb.type_name()
            )));
        }
    }
    if a.is_empty() || b.is_empty() || a.len() > b.len() {
        return Ok(Value::Bool(false));
    }
    let subset = a.iter().all(|x| b.contains(x));
    Ok(Value::Bool(subset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nums(ns: &[f64]) -> Value {
        Value::Array(ns.iter().map(|n| Value::Number(*n)).collect())
    }

    #[test]
    fn test_sqrt() {
        assert_eq!(
            call("Sqrt", &[Value::Number(4.0)]).unwrap().unwrap(),
            Value::Number(2.0)
        );
        assert!(call("Sqrt", &[Value::from("x")]).unwrap().is_err());
        assert!(call("Sqrt", &[]).unwrap().is_err());
    }

    #[test]
    fn test_sum_avg_min_max() {
        let args = [Value::Number(1.0), Value::Number(2.0), Value::Number(6.0)];
        assert_eq!(call("Sum", &args).unwrap().unwrap(), Value::Number(9.0));
        assert_eq!(call("Avg", &args).unwrap().unwrap(), Value::Number(3.0));
        assert_eq!(call("Min", &args).unwrap().unwrap(), Value::Number(1.0));
        assert_eq!(call("Max", &args).unwrap().unwrap(), Value::Number(6.0));
        assert_eq!(call("Sum", &[]).unwrap().unwrap(), Value::Number(0.0));
        assert_eq!(call("Avg", &[]).unwrap().unwrap(), Value::Number(0.0));
        assert!(call("Min", &[]).unwrap().is_err());
    }

    #[test]
    fn test_is_sub_set() {
        let a = nums(&[1.0, 2.0]);
        let b = nums(&[1.0, 5.0, 2.0, 3.0]);
        assert_eq!(
            call("IsSubSet", &[a, b]).unwrap().unwrap(),
            Value::Bool(true)
        );

        let a = nums(&[1.0, 2.0]);
        let b = nums(&[1.0, 5.0, -2.0, 3.0]);
        assert_eq!(
            call("IsSubSet", &[a, b]).unwrap().unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_is_sub_set_empty_is_not_subset() {
        let a = Value::Array(vec![]);
        let b = nums(&[1.0]);
        assert_eq!(
            call("IsSubSet", &[a, b]).unwrap().unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_is_sub_set_type_errors() {
        assert!(call("IsSubSet", &[Value::Number(1.0), nums(&[1.0])])
            .unwrap()
            .is_err());
        let strings = Value::Array(vec![Value::from("a")]);
        assert!(call("IsSubSet", &[nums(&[1.0]), strings]).unwrap().is_err());
    }

    #[test]
    fn test_unknown_name_falls_through() {
        assert!(call("NotABuiltin", &[]).is_none());
    }
}
