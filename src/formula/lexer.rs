use crate::utils::error::FormulaError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Ident(String),
    True,
    False,
    And,
    Or,
    Not,
    If,
    Else,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    LParen,
    RParen,
    Comma,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Python keywords that have no meaning in a formula. Rejected up front so the
/// error names the construct instead of reporting a generic syntax error.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "import", "from", "lambda", "def", "class", "for", "while", "in", "is", "return", "yield",
    "global", "nonlocal", "del", "with", "as", "try", "except", "raise", "assert", "pass",
    "async", "await", "exec", "eval", "open", "None",
];

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) {
            i = scan_number(&chars, i);
            let text: String = chars[start..i].iter().collect();
            let value = text.parse::<f64>().map_err(|_| FormulaError::Syntax {
                position: start,
                message: format!("invalid number literal '{}'", text),
            })?;
            // `1.real`: the scan already swallowed the dot, so a name right after is attribute access
            if chars.get(i).map_or(false, |n| *n == '.' || n.is_alphabetic() || *n == '_') {
                if text.ends_with('.') || chars.get(i) == Some(&'.') {
                    return Err(FormulaError::Disallowed(format!("attribute access after '{}'", text)));
                }
                return Err(FormulaError::Syntax {
                    position: i,
                    message: format!("unexpected name after number '{}'", text),
                });
            }
            tokens.push(Spanned { token: Token::Number(value), position: start });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let token = keyword_or_ident(word)?;
            tokens.push(Spanned { token, position: start });
            continue;
        }

        let next = chars.get(i + 1).copied();
        let (token, width) = match (c, next) {
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('*', Some('*')) => {
                return Err(FormulaError::Syntax {
                    position: start,
                    message: "'**' is not supported, use pow()".to_string(),
                })
            }
            ('/', Some('/')) => {
                return Err(FormulaError::Syntax {
                    position: start,
                    message: "floor division is not supported".to_string(),
                })
            }
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => return Err(FormulaError::Disallowed("attribute access".to_string())),
            ('=', _) => return Err(FormulaError::Disallowed("assignment".to_string())),
            (';', _) => return Err(FormulaError::Disallowed("statement separator".to_string())),
            ('[', _) | (']', _) => return Err(FormulaError::Disallowed("subscript".to_string())),
            ('{', _) | ('}', _) => return Err(FormulaError::Disallowed("dict/set literal".to_string())),
            ('\'', _) | ('"', _) => return Err(FormulaError::Disallowed("string literal".to_string())),
            (':', _) => return Err(FormulaError::Disallowed("block or slice".to_string())),
            ('@', _) => return Err(FormulaError::Disallowed("decorator".to_string())),
            _ => {
                return Err(FormulaError::Syntax {
                    position: start,
                    message: format!("unexpected character '{}'", c),
                })
            }
        };
        tokens.push(Spanned { token, position: start });
        i += width;
    }

    tokens.push(Spanned { token: Token::Eof, position: chars.len() });
    Ok(tokens)
}

fn scan_number(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    if i < chars.len() && chars[i] == '.' {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            while j < chars.len() && chars[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

fn keyword_or_ident(word: String) -> Result<Token, FormulaError> {
    if word.starts_with("__") {
        return Err(FormulaError::Disallowed(format!("dunder name '{}'", word)));
    }
    if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
        return Err(FormulaError::Disallowed(format!("keyword '{}'", word)));
    }
    Ok(match word.as_str() {
        "True" => Token::True,
        "False" => Token::False,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "if" => Token::If,
        "else" => Token::Else,
        _ => Token::Ident(word),
    })
}
