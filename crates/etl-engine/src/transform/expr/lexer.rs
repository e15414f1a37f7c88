//! Tokenizer for calculated-column expressions

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Comma,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Int(i) => write!(f, "{}", i),
            Token::Float(x) => write!(f, "{}", x),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::Ident(s) => f.write_str(s),
            Token::True => f.write_str("true"),
            Token::False => f.write_str("false"),
            Token::Null => f.write_str("null"),
            Token::And => f.write_str("and"),
            Token::Or => f.write_str("or"),
            Token::Not => f.write_str("not"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::Percent => f.write_str("%"),
            Token::Power => f.write_str("**"),
            Token::Eq => f.write_str("=="),
            Token::NotEq => f.write_str("!="),
            Token::Lt => f.write_str("<"),
            Token::Le => f.write_str("<="),
            Token::Gt => f.write_str(">"),
            Token::Ge => f.write_str(">="),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
        }
    }
}

/// Token plus its byte offset in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let peek = chars.get(i + 1).map(|(_, c)| *c);
        let (token, consumed) = match c {
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '*' if peek == Some('*') => (Token::Power, 2),
            '*' => (Token::Star, 1),
            '/' => (Token::Slash, 1),
            '%' => (Token::Percent, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            ',' => (Token::Comma, 1),
            '=' if peek == Some('=') => (Token::Eq, 2),
            '!' if peek == Some('=') => (Token::NotEq, 2),
            '<' if peek == Some('=') => (Token::Le, 2),
            '<' if peek == Some('>') => (Token::NotEq, 2),
            '<' => (Token::Lt, 1),
            '>' if peek == Some('=') => (Token::Ge, 2),
            '>' => (Token::Gt, 1),
            '\'' | '"' => {
                let (s, len) = string_literal(&chars, i, c)?;
                (Token::Str(s), len)
            },
            '`' => {
                let (s, len) = string_literal(&chars, i, c)?;
                (Token::Ident(s), len)
            },
            c if c.is_ascii_digit() || (c == '.' && peek.is_some_and(|p| p.is_ascii_digit())) => {
                number(&chars, i)?
            },
            c if c.is_alphabetic() || c == '_' => {
                let len = chars[i..]
                    .iter()
                    .take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
                    .count();
                let word: String = chars[i..i + len].iter().map(|(_, c)| *c).collect();
                (keyword(word), len)
            },
            other => {
                return Err(ExprError::Syntax {
                    pos,
                    message: format!("unexpected character '{}'", other),
                })
            },
        };

        tokens.push(Spanned { token, pos });
        i += consumed;
    }

    Ok(tokens)
}

fn keyword(word: String) -> Token {
    match word.as_str() {
        "and" | "AND" => Token::And,
        "or" | "OR" => Token::Or,
        "not" | "NOT" => Token::Not,
        "true" | "True" | "TRUE" => Token::True,
        "false" | "False" | "FALSE" => Token::False,
        "null" | "None" | "NULL" => Token::Null,
        _ => Token::Ident(word),
    }
}

/// Quoted literal starting at `start`; doubling the quote escapes it.
fn string_literal(
    chars: &[(usize, char)],
    start: usize,
    quote: char,
) -> Result<(String, usize), ExprError> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            if chars.get(i + 1).map(|(_, c)| *c) == Some(quote) {
                out.push(quote);
                i += 2;
                continue;
            }
            return Ok((out, i + 1 - start));
        }
        out.push(c);
        i += 1;
    }
    Err(ExprError::Syntax {
        pos: chars[start].0,
        message: "unterminated quoted literal".to_string(),
    })
}

fn number(chars: &[(usize, char)], start: usize) -> Result<(Token, usize), ExprError> {
    let mut len = 0;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while let Some((_, c)) = chars.get(start + len) {
        match c {
            '0'..='9' | '_' => len += 1,
            '.' if !seen_dot && !seen_exp => {
                seen_dot = true;
                len += 1;
            },
            'e' | 'E' if !seen_exp => {
                seen_exp = true;
                len += 1;
                if let Some((_, '+' | '-')) = chars.get(start + len) {
                    len += 1;
                }
            },
            _ => break,
        }
    }

    let text: String = chars[start..start + len]
        .iter()
        .map(|(_, c)| *c)
        .filter(|c| *c != '_')
        .collect();
    let pos = chars[start].0;
    let bad = || ExprError::Syntax {
        pos,
        message: format!("invalid number '{}'", text),
    };

    if seen_dot || seen_exp {
        text.parse::<f64>().map(|f| (Token::Float(f), len)).map_err(|_| bad())
    } else {
        match text.parse::<i64>() {
            Ok(i) => Ok((Token::Int(i), len)),
            // Integer literals beyond i64 degrade to floats
            Err(_) => text.parse::<f64>().map(|f| (Token::Float(f), len)).map_err(|_| bad()),
        }
    }
}
