use std::collections::BTreeMap;

use thiserror::Error;

use super::{BinaryOp, Expr, UnaryOp};
use crate::value::Value;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct EvalError(pub String);

/// Values visible to one chain step: `{self}`, same-tick local fields, and
/// pre-fetched cross-resource latest values keyed as `"Ingester.Field"`.
pub struct EvalCtx<'a> {
    pub current: &'a Value,
    pub locals: &'a BTreeMap<String, Value>,
    pub cross: &'a BTreeMap<String, Value>,
}

const BUILTINS: &[&str] = &[
    "round", "mean", "median", "sum", "std", "min", "max", "abs", "strip", "lower", "upper",
    "int", "float", "str", "bool",
];

/// `round` carries an optional decimal suffix (`round2`, `round6`, ...).
pub fn builtin_exists(name: &str) -> bool {
    if BUILTINS.contains(&name) {
        return true;
    }
    name.strip_prefix("round")
        .is_some_and(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
}

/// Call names appearing in an expression that no builtin covers; rejected
/// at startup validation.
pub fn unknown_calls(expr: &Expr) -> Vec<String> {
    let mut out = Vec::new();
    walk_calls(expr, &mut out);
    out
}

fn walk_calls(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Call { name, args } => {
            if !builtin_exists(name) {
                out.push(name.clone());
            }
            for arg in args {
                walk_calls(arg, out);
            }
        }
        Expr::Unary { expr, .. } => walk_calls(expr, out),
        Expr::Binary { lhs, rhs, .. } => {
            walk_calls(lhs, out);
            walk_calls(rhs, out);
        }
        Expr::Index { expr, index } => {
            walk_calls(expr, out);
            walk_calls(index, out);
        }
        _ => {}
    }
}

pub fn eval(expr: &Expr, ctx: &EvalCtx<'_>) -> Result<Value, EvalError> {
    match expr {
        Expr::Num(n) => Ok(number(*n)),
        Expr::Str(s) => Ok(Value::Str(s.clone())),
        Expr::SelfRef => Ok(ctx.current.clone()),
        Expr::FieldRef(name) => ctx
            .locals
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError(format!("field {{{name}}} has no value"))),
        Expr::CrossRef { ingester, field } => {
            let key = format!("{ingester}.{field}");
            ctx.cross
                .get(&key)
                .cloned()
                .ok_or_else(|| EvalError(format!("cross reference {{{key}}} unresolved")))
        }
        Expr::Unary { op, expr } => {
            let v = eval(expr, ctx)?;
            match op {
                UnaryOp::Neg => numeric(&v)
                    .map(|n| Value::Float(-n))
                    .ok_or_else(|| EvalError(format!("cannot negate {v}"))),
                UnaryOp::Not => v
                    .as_bool()
                    .map(|b| Value::Bool(!b))
                    .ok_or_else(|| EvalError(format!("cannot apply ! to {v}"))),
            }
        }
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, ctx)?;
            let r = eval(rhs, ctx)?;
            binary(*op, &l, &r)
        }
        Expr::Index { expr, index } => {
            let target = eval(expr, ctx)?;
            let idx = eval(index, ctx)?;
            let i = numeric(&idx).ok_or_else(|| EvalError(format!("bad index {idx}")))? as usize;
            match target {
                Value::List(items) => items
                    .get(i)
                    .cloned()
                    .ok_or_else(|| EvalError(format!("index {i} out of bounds"))),
                other => Err(EvalError(format!("cannot index into {other}"))),
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, ctx)?);
            }
            call(name, &values)
        }
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Int(n as i64)
    } else {
        Value::Float(n)
    }
}

fn numeric(v: &Value) -> Option<f64> {
    v.as_f64()
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    use BinaryOp::*;

    match op {
        And => {
            let (a, b) = (truthy(l)?, truthy(r)?);
            return Ok(Value::Bool(a && b));
        }
        Or => {
            let (a, b) = (truthy(l)?, truthy(r)?);
            return Ok(Value::Bool(a || b));
        }
        Eq => return Ok(Value::Bool(loose_eq(l, r))),
        Ne => return Ok(Value::Bool(!loose_eq(l, r))),
        _ => {}
    }

    // string concatenation mirrors the original's + on strings
    if op == Add {
        if let (Value::Str(a), Value::Str(b)) = (l, r) {
            return Ok(Value::Str(format!("{a}{b}")));
        }
    }

    let a = numeric(l).ok_or_else(|| EvalError(format!("non-numeric operand {l}")))?;
    let b = numeric(r).ok_or_else(|| EvalError(format!("non-numeric operand {r}")))?;

    let out = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => {
            if b == 0.0 {
                return Err(EvalError("division by zero".to_string()));
            }
            a / b
        }
        Rem => {
            if b == 0.0 {
                return Err(EvalError("modulo by zero".to_string()));
            }
            a % b
        }
        Lt => return Ok(Value::Bool(a < b)),
        Le => return Ok(Value::Bool(a <= b)),
        Gt => return Ok(Value::Bool(a > b)),
        Ge => return Ok(Value::Bool(a >= b)),
        Eq | Ne | And | Or => unreachable!(),
    };

    // integer inputs stay integral where the result allows it
    let integral = matches!((l, r), (Value::Int(_) | Value::UInt(_), Value::Int(_) | Value::UInt(_)));
    if integral && op != Div && out.fract() == 0.0 {
        Ok(number(out))
    } else {
        Ok(Value::Float(out))
    }
}

fn truthy(v: &Value) -> Result<bool, EvalError> {
    v.as_bool()
        .ok_or_else(|| EvalError(format!("non-boolean operand {v}")))
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    match (numeric(l), numeric(r)) {
        (Some(a), Some(b)) => a == b,
        _ => l.to_string() == r.to_string(),
    }
}

fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    if let Some(decimals) = name.strip_prefix("round") {
        let n: u32 = if decimals.is_empty() {
            0
        } else {
            decimals
                .parse()
                .map_err(|_| EvalError(format!("unknown builtin '{name}'")))?
        };
        let v = single_numeric(name, args)?;
        let factor = 10f64.powi(n as i32);
        return Ok(Value::Float((v * factor).round() / factor));
    }

    match name {
        "abs" => Ok(Value::Float(single_numeric(name, args)?.abs())),
        "int" => {
            let v = single_numeric(name, args)?;
            Ok(Value::Int(v.trunc() as i64))
        }
        "float" => Ok(Value::Float(single_numeric(name, args)?)),
        "str" => Ok(Value::Str(single(name, args)?.to_string())),
        "bool" => single(name, args)?
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| EvalError(format!("{name}: cannot interpret as bool"))),
        "strip" => Ok(Value::Str(single(name, args)?.to_string().trim().to_string())),
        "lower" => Ok(Value::Str(single(name, args)?.to_string().to_lowercase())),
        "upper" => Ok(Value::Str(single(name, args)?.to_string().to_uppercase())),
        "mean" | "median" | "sum" | "std" | "min" | "max" => {
            let series = series_args(name, args)?;
            if series.is_empty() {
                return Err(EvalError(format!("{name}: empty series")));
            }
            Ok(Value::Float(aggregate(name, series)))
        }
        other => Err(EvalError(format!("unknown builtin '{other}'"))),
    }
}

fn single<'a>(name: &str, args: &'a [Value]) -> Result<&'a Value, EvalError> {
    match args {
        [v] => Ok(v),
        _ => Err(EvalError(format!(
            "{name} expects exactly one argument, got {}",
            args.len()
        ))),
    }
}

fn single_numeric(name: &str, args: &[Value]) -> Result<f64, EvalError> {
    let v = single(name, args)?;
    numeric(v).ok_or_else(|| EvalError(format!("{name}: non-numeric argument {v}")))
}

/// Aggregates accept either one list argument or several scalar arguments.
fn series_args(name: &str, args: &[Value]) -> Result<Vec<f64>, EvalError> {
    let items: Vec<&Value> = match args {
        [Value::List(items)] => items.iter().collect(),
        _ => args.iter().collect(),
    };
    items
        .into_iter()
        .map(|v| numeric(v).ok_or_else(|| EvalError(format!("{name}: non-numeric element {v}"))))
        .collect()
}

fn aggregate(name: &str, mut series: Vec<f64>) -> f64 {
    let n = series.len() as f64;
    match name {
        "mean" => series.iter().sum::<f64>() / n,
        "sum" => series.iter().sum(),
        "min" => series.iter().copied().fold(f64::INFINITY, f64::min),
        "max" => series.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        "median" => {
            series.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = series.len() / 2;
            if series.len() % 2 == 0 {
                (series[mid - 1] + series[mid]) / 2.0
            } else {
                series[mid]
            }
        }
        "std" => {
            let mean = series.iter().sum::<f64>() / n;
            (series.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Compiled;
    use pretty_assertions::assert_eq;

    fn ctx_with<'a>(
        current: &'a Value,
        locals: &'a BTreeMap<String, Value>,
        cross: &'a BTreeMap<String, Value>,
    ) -> EvalCtx<'a> {
        EvalCtx {
            current,
            locals,
            cross,
        }
    }

    fn eval_chain(steps: &[&str], initial: Value) -> Value {
        let locals = BTreeMap::new();
        let cross = BTreeMap::new();
        let mut current = initial;
        for step in steps {
            let compiled = Compiled::compile(step).unwrap();
            current = compiled
                .eval(&ctx_with(&current, &locals, &cross))
                .unwrap();
        }
        current
    }

    #[test]
    fn inverse_then_round_matches_expected() {
        // scenario from the USDT rate feed: 1/1.0012 rounded to 6 decimals
        let out = eval_chain(&["1/{self}", "round6"], Value::Float(1.0012));
        assert_eq!(out, Value::Float(0.998801));
    }

    #[test]
    fn cross_reference_multiplication() {
        let locals = BTreeMap::new();
        let cross = BTreeMap::from([("A.USDT".to_string(), Value::Float(0.998801))]);
        let current = Value::Str("40000.5".into());

        let compiled = Compiled::compile("float({self})*{A.USDT}").unwrap();
        let v = compiled.eval(&ctx_with(&current, &locals, &cross)).unwrap();
        let compiled = Compiled::compile("round2").unwrap();
        let v = compiled.eval(&ctx_with(&v, &locals, &cross)).unwrap();
        assert_eq!(v, Value::Float(39952.54));
    }

    #[test]
    fn local_field_reference() {
        let locals = BTreeMap::from([("base".to_string(), Value::Float(2.0))]);
        let cross = BTreeMap::new();
        let compiled = Compiled::compile("{base} * 10").unwrap();
        let v = compiled
            .eval(&ctx_with(&Value::Null, &locals, &cross))
            .unwrap();
        assert_eq!(v, Value::Float(20.0));
    }

    #[test]
    fn aggregates_over_lists() {
        let current = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(6)]);
        let locals = BTreeMap::new();
        let cross = BTreeMap::new();
        for (src, expected) in [
            ("mean", 3.0),
            ("median", 2.0),
            ("sum", 9.0),
            ("min", 1.0),
            ("max", 6.0),
        ] {
            let compiled = Compiled::compile(src).unwrap();
            assert_eq!(
                compiled.eval(&ctx_with(&current, &locals, &cross)).unwrap(),
                Value::Float(expected),
                "{src}"
            );
        }
    }

    #[test]
    fn indexing_picks_tuple_elements() {
        let current = Value::List(vec![Value::Int(10), Value::Int(20)]);
        let out = eval_chain(&["{self}[1]"], current);
        assert_eq!(out, Value::Int(20));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let compiled = Compiled::compile("1/{self}").unwrap();
        let locals = BTreeMap::new();
        let cross = BTreeMap::new();
        assert!(compiled
            .eval(&ctx_with(&Value::Int(0), &locals, &cross))
            .is_err());
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        let out = eval_chain(&["{self} + 1"], Value::Int(41));
        assert_eq!(out, Value::Int(42));
        let out = eval_chain(&["{self} / 2"], Value::Int(5));
        assert_eq!(out, Value::Float(2.5));
    }

    #[test]
    fn unknown_call_reported() {
        let compiled = Compiled::compile("frobnicate({self})").unwrap();
        assert_eq!(unknown_calls(&compiled.expr), vec!["frobnicate".to_string()]);
    }
}
