use std::collections::HashMap;

use super::parser::{BinaryOp, Expr, Function, UnaryOp};
use crate::utils::error::FormulaError;

/// Result of evaluating an expression. Booleans behave as 1/0 in arithmetic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Bool(true) => 1.0,
            Value::Bool(false) => 0.0,
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0,
            Value::Bool(b) => *b,
        }
    }
}

pub fn eval(expr: &Expr, bindings: &HashMap<String, f64>) -> Result<Value, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Ident(name) => bindings
            .get(name)
            .map(|v| Value::Number(*v))
            .ok_or_else(|| FormulaError::UnknownVariable(name.clone())),
        Expr::Unary { op, operand } => {
            let value = eval(operand, bindings)?;
            Ok(match op {
                UnaryOp::Neg => Value::Number(-value.as_f64()),
                UnaryOp::Pos => Value::Number(value.as_f64()),
                UnaryOp::Not => Value::Bool(!value.is_truthy()),
            })
        }
        Expr::Binary { op: BinaryOp::And, left, right } => {
            let lhs = eval(left, bindings)?;
            if !lhs.is_truthy() {
                return Ok(lhs);
            }
            eval(right, bindings)
        }
        Expr::Binary { op: BinaryOp::Or, left, right } => {
            let lhs = eval(left, bindings)?;
            if lhs.is_truthy() {
                return Ok(lhs);
            }
            eval(right, bindings)
        }
        Expr::Binary { op, left, right } => {
            let lhs = eval(left, bindings)?.as_f64();
            let rhs = eval(right, bindings)?.as_f64();
            binary(*op, lhs, rhs)
        }
        Expr::Conditional { condition, then, otherwise } => {
            if eval(condition, bindings)?.is_truthy() {
                eval(then, bindings)
            } else {
                eval(otherwise, bindings)
            }
        }
        Expr::Call { func, args } => {
            let values = args
                .iter()
                .map(|a| eval(a, bindings).map(|v| v.as_f64()))
                .collect::<Result<Vec<f64>, FormulaError>>()?;
            call(*func, &values).and_then(finite).map(Value::Number)
        }
    }
}

fn binary(op: BinaryOp, lhs: f64, rhs: f64) -> Result<Value, FormulaError> {
    let number = match op {
        BinaryOp::Add => lhs + rhs,
        BinaryOp::Sub => lhs - rhs,
        BinaryOp::Mul => lhs * rhs,
        BinaryOp::Div => {
            if rhs == 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            lhs / rhs
        }
        BinaryOp::Mod => {
            if rhs == 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            // result takes the sign of the divisor
            let r = lhs % rhs;
            if r != 0.0 && (r < 0.0) != (rhs < 0.0) {
                r + rhs
            } else {
                r
            }
        }
        BinaryOp::Lt => return Ok(Value::Bool(lhs < rhs)),
        BinaryOp::Le => return Ok(Value::Bool(lhs <= rhs)),
        BinaryOp::Gt => return Ok(Value::Bool(lhs > rhs)),
        BinaryOp::Ge => return Ok(Value::Bool(lhs >= rhs)),
        BinaryOp::Eq => return Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => return Ok(Value::Bool(lhs != rhs)),
        BinaryOp::And => return Ok(Value::Bool(lhs != 0.0 && rhs != 0.0)),
        BinaryOp::Or => return Ok(Value::Bool(lhs != 0.0 || rhs != 0.0)),
    };
    finite(number).map(Value::Number)
}

fn call(func: Function, args: &[f64]) -> Result<f64, FormulaError> {
    match func {
        Function::Abs => Ok(args[0].abs()),
        Function::Min => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        Function::Max => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        Function::Round => {
            let x = args[0];
            match args.get(1) {
                None => Ok(x.round_ties_even()),
                Some(digits) => {
                    if digits.fract() != 0.0 {
                        return Err(FormulaError::Type("round() digits must be an integer".to_string()));
                    }
                    let factor = 10f64.powi(*digits as i32);
                    Ok((x * factor).round_ties_even() / factor)
                }
            }
        }
        Function::Pow => {
            let (base, exp) = (args[0], args[1]);
            if base == 0.0 && exp < 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            let result = base.powf(exp);
            if result.is_nan() {
                return Err(FormulaError::Domain(format!("pow({}, {})", base, exp)));
            }
            Ok(result)
        }
        Function::Sqrt => {
            if args[0] < 0.0 {
                return Err(FormulaError::Domain(format!("sqrt of negative number {}", args[0])));
            }
            Ok(args[0].sqrt())
        }
        Function::Sin => Ok(args[0].sin()),
        Function::Cos => Ok(args[0].cos()),
        Function::Tan => Ok(args[0].tan()),
    }
}

pub(crate) fn finite(value: f64) -> Result<f64, FormulaError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FormulaError::Domain(format!("result is not finite ({})", value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parser::parse;

    fn run(src: &str, val: f64) -> Result<Value, FormulaError> {
        let mut bindings = HashMap::new();
        bindings.insert("val".to_string(), val);
        eval(&parse(src)?, &bindings)
    }

    #[test]
    fn test_python_modulo_sign() {
        assert_eq!(run("val % 3", -7.0).unwrap(), Value::Number(2.0));
        assert_eq!(run("val % -3", 7.0).unwrap(), Value::Number(-2.0));
        assert_eq!(run("val % 3", 7.0).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_boolean_operators_return_operands() {
        assert_eq!(run("val and 5", 0.0).unwrap(), Value::Number(0.0));
        assert_eq!(run("val or 5", 0.0).unwrap(), Value::Number(5.0));
        assert_eq!(run("not val", 0.0).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_skips_faults() {
        assert_eq!(run("val != 0 and 10 / val > 1", 0.0).unwrap(), Value::Bool(false));
        assert_eq!(run("1 if val == 0 else 10 / val", 0.0).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_numeric_faults() {
        assert_eq!(run("val / 0", 10.0), Err(FormulaError::DivisionByZero));
        assert_eq!(run("val % 0", 10.0), Err(FormulaError::DivisionByZero));
        assert!(matches!(run("sqrt(val)", -1.0), Err(FormulaError::Domain(_))));
        assert!(matches!(run("pow(val, 0.5)", -8.0), Err(FormulaError::Domain(_))));
        assert!(matches!(run("val * 1e308 * 10", 10.0), Err(FormulaError::Domain(_))));
        assert!(matches!(run("round(val, 0.5)", 1.0), Err(FormulaError::Type(_))));
    }

    #[test]
    fn test_round_ties_to_even() {
        assert_eq!(run("round(val)", 2.5).unwrap(), Value::Number(2.0));
        assert_eq!(run("round(val)", 3.5).unwrap(), Value::Number(4.0));
        assert_eq!(run("round(val, 2)", 3.14159).unwrap(), Value::Number(3.14));
    }

    #[test]
    fn test_unknown_variable() {
        assert_eq!(run("Temp1 > 5", 1.0), Err(FormulaError::UnknownVariable("Temp1".into())));
    }
}
