//! Sandboxed expression language for sensor formulas and rule conditions.
//!
//! The grammar only knows numbers, booleans, identifiers, arithmetic,
//! comparisons, `and`/`or`/`not`, the `a if cond else b` conditional and calls
//! to a fixed table of math functions. Anything else fails in the lexer or
//! parser, so nothing outside that set is ever evaluated.

pub mod eval;
pub mod lexer;
pub mod parser;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::utils::error::FormulaError;
pub use eval::Value;
pub use parser::Expr;

/// Names bound to the raw reading in sensor formulas.
pub const VALUE_ALIASES: [&str; 3] = ["val", "value", "x"];

/// A parsed, reusable expression.
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let expr = parser::parse(source)?;
        Ok(Self { source: source.to_string(), expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn identifiers(&self) -> BTreeSet<String> {
        self.expr.identifiers()
    }

    /// A numeric result is always finite, including a bare variable bound to
    /// `inf` or `NaN`.
    pub fn evaluate(&self, bindings: &HashMap<String, f64>) -> Result<Value, FormulaError> {
        match eval::eval(&self.expr, bindings)? {
            Value::Number(n) => eval::finite(n).map(Value::Number),
            other => Ok(other),
        }
    }

    /// Applies a sensor formula to a raw reading.
    pub fn apply(&self, raw: f64) -> Result<f64, FormulaError> {
        let bindings: HashMap<String, f64> =
            VALUE_ALIASES.iter().map(|name| (name.to_string(), raw)).collect();
        self.evaluate(&bindings).map(|v| v.as_f64())
    }

    /// Sensor formulas may only reference the raw reading.
    pub fn check_sensor_formula(&self) -> Result<(), FormulaError> {
        match self.identifiers().into_iter().find(|id| !VALUE_ALIASES.contains(&id.as_str())) {
            Some(unknown) => Err(FormulaError::UnknownVariable(unknown)),
            None => Ok(()),
        }
    }
}

pub fn validate(expression: &str) -> Result<(), FormulaError> {
    parser::parse(expression).map(|_| ())
}

pub fn evaluate(expression: &str, bindings: &HashMap<String, f64>) -> Result<Value, FormulaError> {
    Formula::parse(expression)?.evaluate(bindings)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaTestResult {
    pub valid: bool,
    pub result: Option<f64>,
    pub error: Option<String>,
}

/// Dry-runs a sensor formula against a sample raw value.
pub fn test_formula(expression: &str, test_value: f64) -> FormulaTestResult {
    let outcome = Formula::parse(expression).and_then(|f| {
        f.check_sensor_formula()?;
        f.apply(test_value)
    });
    match outcome {
        Ok(result) => FormulaTestResult { valid: true, result: Some(result), error: None },
        Err(e) => FormulaTestResult { valid: false, result: None, error: Some(e.to_string()) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(v: f64) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("val".to_string(), v);
        m
    }

    #[test]
    fn test_conditional_scenario() {
        assert_eq!(evaluate("val if val>50 else 0", &val(100.0)).unwrap().as_f64(), 100.0);
        assert_eq!(evaluate("val if val>50 else 0", &val(10.0)).unwrap().as_f64(), 0.0);
    }

    #[test]
    fn test_common_transforms() {
        let cases = [
            ("val", 42.0, 42.0),
            ("val * 2", 10.0, 20.0),
            ("val / 100", 2540.0, 25.4),
            ("val * 0.1 + 10", 100.0, 20.0),
            ("sqrt(val)", 16.0, 4.0),
            ("pow(val, 2)", 5.0, 25.0),
            ("sin(0)", 0.0, 0.0),
            ("max(val, 100)", 50.0, 100.0),
            ("min(val, 1, -3)", 50.0, -3.0),
            ("abs(val)", -3.5, 3.5),
            ("value * 2", 10.0, 20.0),
            ("x * 2", 10.0, 20.0),
            ("val/10", 245.0, 24.5),
        ];
        for (src, input, expected) in cases {
            let formula = Formula::parse(src).unwrap();
            assert_eq!(formula.apply(input).unwrap(), expected, "{}", src);
        }
    }

    #[test]
    fn test_validate_rejects_disallowed_constructs() {
        let malicious = [
            "import os",
            "os.system('ls')",
            "val.__class__",
            "exec('print(1)')",
            "__import__('os')",
            "val = 3",
            "lambda: 1",
            "[x for x in range(10)]",
            "open('/etc/passwd').read()",
            "getattr(val, 'real')",
            "val; val",
            "globals()",
        ];
        for src in malicious {
            assert!(validate(src).is_err(), "accepted {}", src);
        }
    }

    #[test]
    fn test_validate_accepts_rule_conditions() {
        assert!(validate("Temp1 > 50 and stat_Temp1_mean_5m < 40").is_ok());
        assert!(validate("not (Pressure >= 2.5 or Level < 10)").is_ok());
    }

    #[test]
    fn test_formula_dry_run() {
        let ok = test_formula("val * 2", 10.0);
        assert!(ok.valid);
        assert_eq!(ok.result, Some(20.0));
        assert_eq!(ok.error, None);

        let bad = test_formula("val / 0", 10.0);
        assert!(!bad.valid);
        assert_eq!(bad.result, None);
        assert!(bad.error.unwrap().to_lowercase().contains("zero"));

        let unbound = test_formula("Temp1 * 2", 10.0);
        assert!(!unbound.valid);
    }

    #[test]
    fn test_non_finite_input_is_a_domain_error() {
        for src in ["val", "val * 2", "abs(val)"] {
            let formula = Formula::parse(src).unwrap();
            assert!(matches!(formula.apply(f64::INFINITY), Err(FormulaError::Domain(_))), "{}", src);
            assert!(matches!(formula.apply(f64::NAN), Err(FormulaError::Domain(_))), "{}", src);
        }
        // comparisons still yield a boolean
        assert_eq!(Formula::parse("val > 1").unwrap().apply(f64::INFINITY).unwrap(), 1.0);
    }

    #[test]
    fn test_boolean_result_as_number() {
        let f = Formula::parse("val > 10").unwrap();
        assert_eq!(f.apply(11.0).unwrap(), 1.0);
        assert_eq!(f.apply(9.0).unwrap(), 0.0);
    }
}
