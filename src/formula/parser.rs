use std::collections::BTreeSet;

use super::lexer::{tokenize, Spanned, Token};
use crate::utils::error::FormulaError;

pub const MAX_FORMULA_LENGTH: usize = 1024;
pub const MAX_NESTING_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Ident(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        func: Function,
        args: Vec<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Round,
    Abs,
    Min,
    Max,
    Pow,
    Sqrt,
    Sin,
    Cos,
    Tan,
}

impl Function {
    pub fn lookup(name: &str) -> Option<Self> {
        match name {
            "round" => Some(Function::Round),
            "abs" => Some(Function::Abs),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "pow" => Some(Function::Pow),
            "sqrt" => Some(Function::Sqrt),
            "sin" => Some(Function::Sin),
            "cos" => Some(Function::Cos),
            "tan" => Some(Function::Tan),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Round => "round",
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
            Function::Pow => "pow",
            Function::Sqrt => "sqrt",
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
        }
    }

    fn check_arity(&self, got: usize) -> Result<(), FormulaError> {
        let (ok, expected) = match self {
            Function::Round => ((1..=2).contains(&got), "1 or 2"),
            Function::Min | Function::Max => (got >= 2, "at least 2"),
            Function::Pow => (got == 2, "2"),
            _ => (got == 1, "1"),
        };
        if ok {
            Ok(())
        } else {
            Err(FormulaError::Arity {
                name: self.name().to_string(),
                expected: expected.to_string(),
                got,
            })
        }
    }
}

impl Expr {
    /// Free variables referenced by the expression.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) | Expr::Bool(_) => {}
            Expr::Ident(name) => {
                out.insert(name.clone());
            }
            Expr::Unary { operand, .. } => operand.collect_identifiers(out),
            Expr::Binary { left, right, .. } => {
                left.collect_identifiers(out);
                right.collect_identifiers(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_identifiers(out)),
            Expr::Conditional { condition, then, otherwise } => {
                condition.collect_identifiers(out);
                then.collect_identifiers(out);
                otherwise.collect_identifiers(out);
            }
        }
    }
}

pub fn parse(source: &str) -> Result<Expr, FormulaError> {
    if source.trim().is_empty() {
        return Err(FormulaError::Empty);
    }
    if source.chars().count() > MAX_FORMULA_LENGTH {
        return Err(FormulaError::TooLong(MAX_FORMULA_LENGTH));
    }

    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let expr = parser.expression()?;
    if parser.peek() != &Token::Eof {
        return Err(parser.unexpected("end of expression"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), FormulaError> {
        if self.eat(&expected) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn unexpected(&self, wanted: &str) -> FormulaError {
        let found = match self.peek() {
            Token::Eof => "end of input".to_string(),
            other => format!("{:?}", other),
        };
        FormulaError::Syntax {
            position: self.position(),
            message: format!("expected {}, found {}", wanted, found),
        }
    }

    fn enter(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(FormulaError::TooDeep(MAX_NESTING_DEPTH));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // expr := or_expr [ 'if' or_expr 'else' expr ]
    fn expression(&mut self) -> Result<Expr, FormulaError> {
        self.enter()?;
        let value = self.or_expr()?;
        let result = if self.eat(&Token::If) {
            let condition = self.or_expr()?;
            self.expect(Token::Else, "'else'")?;
            let otherwise = self.expression()?;
            Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(value),
                otherwise: Box::new(otherwise),
            }
        } else {
            value
        };
        self.leave();
        Ok(result)
    }

    fn or_expr(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.and_expr()?;
        while self.eat(&Token::Or) {
            let right = self.and_expr()?;
            left = binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.not_expr()?;
        while self.eat(&Token::And) {
            let right = self.not_expr()?;
            left = binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, FormulaError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let operand = self.not_expr()?;
            self.leave();
            return Ok(Expr::Unary { op: UnaryOp::Not, operand: Box::new(operand) });
        }
        self.comparison()
    }

    /// `a < b < c` means `a < b and b < c`.
    fn comparison(&mut self) -> Result<Expr, FormulaError> {
        let first = self.additive()?;
        let mut links: Vec<(BinaryOp, Expr)> = Vec::new();
        while let Some(op) = comparison_op(self.peek()) {
            self.advance();
            links.push((op, self.additive()?));
        }

        let mut result: Option<Expr> = None;
        let mut left = first;
        for (op, right) in links {
            let link = binary(op, left, right.clone());
            result = Some(match result {
                Some(acc) => binary(BinaryOp::And, acc, link),
                None => link,
            });
            left = right;
        }
        Ok(result.unwrap_or(left))
    }

    fn additive(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        let op = match self.peek() {
            Token::Minus => UnaryOp::Neg,
            Token::Plus => UnaryOp::Pos,
            _ => return self.primary(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary()?;
        self.leave();
        Ok(Expr::Unary { op, operand: Box::new(operand) })
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        if !matches!(
            self.peek(),
            Token::Number(_) | Token::True | Token::False | Token::LParen | Token::Ident(_)
        ) {
            return Err(self.unexpected("a value"));
        }
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    return self.call(name);
                }
                if name == "pi" {
                    return Ok(Expr::Number(std::f64::consts::PI));
                }
                Ok(Expr::Ident(name))
            }
            _ => Err(self.unexpected("a value")),
        }
    }

    fn call(&mut self, name: String) -> Result<Expr, FormulaError> {
        let func = Function::lookup(&name).ok_or(FormulaError::UnknownFunction(name))?;
        self.enter()?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expression()?);
                if self.eat(&Token::Comma) {
                    continue;
                }
                self.expect(Token::RParen, "',' or ')'")?;
                break;
            }
        }
        self.leave();
        func.check_arity(args.len())?;
        Ok(Expr::Call { func, args })
    }
}

fn comparison_op(token: &Token) -> Option<BinaryOp> {
    match token {
        Token::Lt => Some(BinaryOp::Lt),
        Token::Le => Some(BinaryOp::Le),
        Token::Gt => Some(BinaryOp::Gt),
        Token::Ge => Some(BinaryOp::Ge),
        Token::EqEq => Some(BinaryOp::Eq),
        Token::NotEq => Some(BinaryOp::Ne),
        _ => None,
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary { op, left: Box::new(left), right: Box::new(right) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            binary(
                BinaryOp::Add,
                Expr::Number(1.0),
                binary(BinaryOp::Mul, Expr::Number(2.0), Expr::Number(3.0))
            )
        );
    }

    #[test]
    fn test_conditional_shape() {
        let expr = parse("val if val > 50 else 0").unwrap();
        match expr {
            Expr::Conditional { condition, then, otherwise } => {
                assert_eq!(*then, Expr::Ident("val".into()));
                assert_eq!(*otherwise, Expr::Number(0.0));
                assert!(matches!(*condition, Expr::Binary { op: BinaryOp::Gt, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_chained_comparison_desugars_to_and() {
        let expr = parse("0 < val < 10").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn test_identifiers() {
        let expr = parse("Temp1 > 50 and stat_Temp1_mean_5m < pi").unwrap();
        let ids: Vec<String> = expr.identifiers().into_iter().collect();
        assert_eq!(ids, vec!["Temp1".to_string(), "stat_Temp1_mean_5m".to_string()]);
    }

    #[test]
    fn test_unknown_function_rejected() {
        assert_eq!(parse("exp(val)"), Err(FormulaError::UnknownFunction("exp".into())));
        assert_eq!(parse("val(2)"), Err(FormulaError::UnknownFunction("val".into())));
    }

    #[test]
    fn test_arity_checked_at_parse_time() {
        assert!(matches!(parse("pow(val)"), Err(FormulaError::Arity { .. })));
        assert!(matches!(parse("sqrt(1, 2)"), Err(FormulaError::Arity { .. })));
        assert!(parse("round(val)").is_ok());
        assert!(parse("round(val, 2)").is_ok());
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(parse("val * * 2"), Err(FormulaError::Syntax { .. })));
        assert!(matches!(parse("(val + 1"), Err(FormulaError::Syntax { .. })));
        assert!(matches!(parse("val 2"), Err(FormulaError::Syntax { .. })));
        assert!(matches!(parse("val if val > 1"), Err(FormulaError::Syntax { .. })));
        assert_eq!(parse("   "), Err(FormulaError::Empty));
    }

    #[test]
    fn test_limits() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse(&deep), Err(FormulaError::TooDeep(MAX_NESTING_DEPTH)));

        let long = "1+".repeat(600) + "1";
        assert_eq!(parse(&long), Err(FormulaError::TooLong(MAX_FORMULA_LENGTH)));

        let negations = "-".repeat(200) + "1";
        assert_eq!(parse(&negations), Err(FormulaError::TooDeep(MAX_NESTING_DEPTH)));
    }
}
