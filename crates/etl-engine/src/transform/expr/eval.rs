//! Column-at-a-time interpreter

use std::cmp::Ordering;

use super::parser::{BinaryOp, Expr, Function, UnaryOp};
use super::ExprError;
use crate::batch::{DataType, Value};

/// Read-only column namespace an expression is evaluated against
pub trait Scope {
    fn lookup(&self, name: &str) -> Option<&[Value]>;
}

/// Intermediate result: a constant or one value per row
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Scalar(Value),
    Column(Vec<Value>),
}

impl Operand {
    fn get(&self, row: usize) -> &Value {
        match self {
            Operand::Scalar(v) => v,
            Operand::Column(values) => &values[row],
        }
    }

    fn into_values(self, rows: usize) -> Vec<Value> {
        match self {
            Operand::Scalar(v) => vec![v; rows],
            Operand::Column(values) => values,
        }
    }
}

type ScalarResult = Result<Value, ExprError>;

pub fn evaluate(expr: &Expr, scope: &dyn Scope, rows: usize) -> Result<Vec<Value>, ExprError> {
    Ok(eval(expr, scope, rows)?.into_values(rows))
}

fn eval(expr: &Expr, scope: &dyn Scope, rows: usize) -> Result<Operand, ExprError> {
    match expr {
        Expr::Literal(v) => Ok(Operand::Scalar(v.clone())),
        Expr::Ident(name) => {
            let values = scope
                .lookup(name)
                .ok_or_else(|| ExprError::UnknownIdentifier { name: name.clone() })?;
            if values.len() != rows {
                return Err(ExprError::Type(format!(
                    "column '{}' has {} values, expected {}",
                    name,
                    values.len(),
                    rows
                )));
            }
            Ok(Operand::Column(values.to_vec()))
        },
        Expr::Unary { op, expr } => {
            let operand = eval(expr, scope, rows)?;
            map1(operand, rows, |v| unary(*op, v))
        },
        Expr::Binary { op, lhs, rhs } => {
            let l = eval(lhs, scope, rows)?;
            let r = eval(rhs, scope, rows)?;
            map2(&l, &r, rows, |a, b| binary(*op, a, b))
        },
        Expr::Call { func, args } => {
            let args = args
                .iter()
                .map(|a| eval(a, scope, rows))
                .collect::<Result<Vec<_>, _>>()?;
            call(*func, args, rows)
        },
    }
}

fn map1(operand: Operand, rows: usize, f: impl Fn(&Value) -> ScalarResult) -> Result<Operand, ExprError> {
    match operand {
        Operand::Scalar(v) => Ok(Operand::Scalar(f(&v)?)),
        Operand::Column(values) => {
            debug_assert_eq!(values.len(), rows);
            Ok(Operand::Column(values.iter().map(f).collect::<Result<_, _>>()?))
        },
    }
}

fn map2(
    a: &Operand,
    b: &Operand,
    rows: usize,
    f: impl Fn(&Value, &Value) -> ScalarResult,
) -> Result<Operand, ExprError> {
    if let (Operand::Scalar(x), Operand::Scalar(y)) = (a, b) {
        return Ok(Operand::Scalar(f(x, y)?));
    }
    (0..rows)
        .map(|row| f(a.get(row), b.get(row)))
        .collect::<Result<Vec<_>, _>>()
        .map(Operand::Column)
}

fn type_name(v: &Value) -> &'static str {
    v.data_type().map(|t| t.as_str()).unwrap_or("null")
}

fn unsupported(op: &str, a: &Value, b: &Value) -> ExprError {
    ExprError::Type(format!(
        "unsupported operand types for {}: {} and {}",
        op,
        type_name(a),
        type_name(b)
    ))
}

// ============================================================================
// Operators
// ============================================================================

fn unary(op: UnaryOp, v: &Value) -> ScalarResult {
    match (op, v) {
        (_, Value::Null) => Ok(Value::Null),
        (UnaryOp::Neg, Value::Integer(i)) => Ok(i
            .checked_neg()
            .map(Value::Integer)
            .unwrap_or(Value::Numeric(-(*i as f64)))),
        (UnaryOp::Neg, Value::Numeric(n)) => Ok(Value::Numeric(-n)),
        (UnaryOp::Not, Value::Boolean(b)) => Ok(Value::Boolean(!b)),
        (UnaryOp::Neg, other) => Err(ExprError::Type(format!(
            "bad operand type for unary -: {}",
            type_name(other)
        ))),
        (UnaryOp::Not, other) => Err(ExprError::Type(format!(
            "'not' expects a boolean, got {}",
            type_name(other)
        ))),
    }
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> ScalarResult {
    match op {
        BinaryOp::And | BinaryOp::Or => logical(op, a, b),
        BinaryOp::Eq | BinaryOp::NotEq => {
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let equal = match compare(a, b) {
                Ok(ord) => ord == Ordering::Equal,
                // Values of unrelated types are simply unequal
                Err(_) => false,
            };
            Ok(Value::Boolean(if op == BinaryOp::Eq { equal } else { !equal }))
        },
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let ord = compare(a, b).map_err(|_| unsupported(op.symbol(), a, b))?;
            let result = match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(Value::Boolean(result))
        },
        _ => arithmetic(op, a, b),
    }
}

/// Three-valued logic: a known operand can decide the result even when the
/// other is null.
fn logical(op: BinaryOp, a: &Value, b: &Value) -> ScalarResult {
    let as_bool = |v: &Value| match v {
        Value::Null => Ok(None),
        Value::Boolean(b) => Ok(Some(*b)),
        other => Err(ExprError::Type(format!(
            "'{}' expects booleans, got {}",
            op.symbol(),
            type_name(other)
        ))),
    };
    let (x, y) = (as_bool(a)?, as_bool(b)?);
    let result = match op {
        BinaryOp::And => match (x, y) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        _ => match (x, y) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
    };
    Ok(result.map(Value::Boolean).unwrap_or(Value::Null))
}

fn arithmetic(op: BinaryOp, a: &Value, b: &Value) -> ScalarResult {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }

    if let (BinaryOp::Add, Value::Text(x), Value::Text(y)) = (op, a, b) {
        return Ok(Value::Text(format!("{}{}", x, y)));
    }

    if let (Value::Integer(x), Value::Integer(y)) = (a, b) {
        let (x, y) = (*x, *y);
        let exact = match op {
            BinaryOp::Add => x.checked_add(y),
            BinaryOp::Sub => x.checked_sub(y),
            BinaryOp::Mul => x.checked_mul(y),
            BinaryOp::Mod => {
                if y == 0 {
                    return Ok(Value::Null);
                }
                x.checked_rem_euclid(y).map(|r| if r != 0 && y < 0 { r + y } else { r })
            },
            BinaryOp::Pow if y >= 0 => u32::try_from(y).ok().and_then(|e| x.checked_pow(e)),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::Integer(v));
        }
    }

    let (x, y) = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x, y),
        _ => return Err(unsupported(op.symbol(), a, b)),
    };

    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Ok(Value::Null);
            }
            x / y
        },
        BinaryOp::Mod => {
            if y == 0.0 {
                return Ok(Value::Null);
            }
            x - y * (x / y).floor()
        },
        BinaryOp::Pow => x.powf(y),
        _ => return Err(unsupported(op.symbol(), a, b)),
    };

    if result.is_finite() {
        Ok(Value::Numeric(result))
    } else {
        Ok(Value::Null)
    }
}

/// Ordering between two non-null values of comparable types
fn compare(a: &Value, b: &Value) -> Result<Ordering, ExprError> {
    let ord = match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Boolean(x), Value::Boolean(y)) => Some(x.cmp(y)),
        (Value::Timestamp(x), Value::Timestamp(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    ord.ok_or_else(|| unsupported("comparison", a, b))
}

// ============================================================================
// Functions
// ============================================================================

fn call(func: Function, mut args: Vec<Operand>, rows: usize) -> Result<Operand, ExprError> {
    match func {
        Function::Min | Function::Max => {
            let want = if func == Function::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            if args.len() == 1 {
                return match args.remove(0) {
                    Operand::Scalar(v) => Ok(Operand::Scalar(v)),
                    Operand::Column(values) => aggregate(&values, want).map(Operand::Scalar),
                };
            }
            let mut acc = args.remove(0);
            for next in &args {
                acc = map2(&acc, next, rows, |a, b| pick(a, b, want))?;
            }
            Ok(acc)
        },
        Function::Round => {
            let value = args.remove(0);
            match args.pop() {
                None => map1(value, rows, round0),
                Some(digits) => map2(&value, &digits, rows, round_n),
            }
        },
        Function::Abs => map1(args.remove(0), rows, abs),
        Function::Len => map1(args.remove(0), rows, len),
        Function::Str => map1(args.remove(0), rows, |v| {
            Ok(v.render().map(Value::Text).unwrap_or(Value::Null))
        }),
        Function::Int => map1(args.remove(0), rows, to_int),
        Function::Float => map1(args.remove(0), rows, |v| {
            v.coerce(DataType::Numeric)
                .map_err(|e| ExprError::Type(format!("float(): {}", e)))
        }),
    }
}

fn aggregate(values: &[Value], want: Ordering) -> ScalarResult {
    let mut best: Option<&Value> = None;
    for v in values.iter().filter(|v| !v.is_null()) {
        best = match best {
            None => Some(v),
            Some(current) => {
                if compare(v, current)? == want {
                    Some(v)
                } else {
                    Some(current)
                }
            },
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

fn pick(a: &Value, b: &Value, want: Ordering) -> ScalarResult {
    if a.is_null() || b.is_null() {
        return Ok(Value::Null);
    }
    Ok(if compare(b, a)? == want { b.clone() } else { a.clone() })
}

fn abs(v: &Value) -> ScalarResult {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Integer(i) => Ok(i
            .checked_abs()
            .map(Value::Integer)
            .unwrap_or(Value::Numeric((*i as f64).abs()))),
        Value::Numeric(n) => Ok(Value::Numeric(n.abs())),
        other => Err(ExprError::Type(format!(
            "abs() expects a number, got {}",
            type_name(other)
        ))),
    }
}

fn round0(v: &Value) -> ScalarResult {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Integer(i) => Ok(Value::Integer(*i)),
        Value::Numeric(n) if n.is_finite() => Ok(Value::Integer(n.round_ties_even() as i64)),
        Value::Numeric(_) => Ok(Value::Null),
        other => Err(ExprError::Type(format!(
            "round() expects a number, got {}",
            type_name(other)
        ))),
    }
}

fn round_n(v: &Value, digits: &Value) -> ScalarResult {
    let digits = match digits {
        Value::Null => return Ok(Value::Null),
        Value::Integer(d) => i32::try_from(*d)
            .map_err(|_| ExprError::Type(format!("round(): {} digits is out of range", d)))?,
        other => {
            return Err(ExprError::Type(format!(
                "round() digits must be an integer, got {}",
                type_name(other)
            )))
        },
    };
    match v {
        Value::Null => Ok(Value::Null),
        Value::Integer(i) if digits >= 0 => Ok(Value::Integer(*i)),
        _ => {
            let x = v.as_f64().ok_or_else(|| {
                ExprError::Type(format!("round() expects a number, got {}", type_name(v)))
            })?;
            let factor = 10f64.powi(digits);
            let rounded = (x * factor).round_ties_even() / factor;
            Ok(if rounded.is_finite() {
                Value::Numeric(rounded)
            } else {
                Value::Null
            })
        },
    }
}

fn len(v: &Value) -> ScalarResult {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Text(s) => Ok(Value::Integer(s.chars().count() as i64)),
        other => Err(ExprError::Type(format!(
            "len() expects text, got {}",
            type_name(other)
        ))),
    }
}

fn to_int(v: &Value) -> ScalarResult {
    match v {
        Value::Null => Ok(Value::Null),
        Value::Integer(i) => Ok(Value::Integer(*i)),
        Value::Boolean(b) => Ok(Value::Integer(i64::from(*b))),
        Value::Numeric(n) if n.is_finite() => Ok(Value::Integer(n.trunc() as i64)),
        Value::Text(s) => {
            let t = s.trim();
            t.parse::<i64>()
                .ok()
                .or_else(|| t.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
                .map(Value::Integer)
                .ok_or_else(|| ExprError::Type(format!("int(): invalid literal '{}'", s)))
        },
        other => Err(ExprError::Type(format!(
            "int() cannot convert {}",
            type_name(other)
        ))),
    }
}
