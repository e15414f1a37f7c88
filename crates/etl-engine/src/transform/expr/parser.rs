//! Pratt parser producing the expression AST

use super::lexer::{tokenize, Spanned, Token};
use super::ExprError;
use crate::batch::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// The only callable functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Abs,
    Min,
    Max,
    Round,
    Len,
    Str,
    Int,
    Float,
}

impl Function {
    pub const ALL: [Function; 8] = [
        Function::Abs,
        Function::Min,
        Function::Max,
        Function::Round,
        Function::Len,
        Function::Str,
        Function::Int,
        Function::Float,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
            Function::Round => "round",
            Function::Len => "len",
            Function::Str => "str",
            Function::Int => "int",
            Function::Float => "float",
        }
    }

    pub fn lookup(name: &str) -> Option<Function> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Accepted argument counts (min, max)
    fn arity(&self) -> (usize, usize) {
        match self {
            Function::Min | Function::Max => (1, usize::MAX),
            Function::Round => (1, 2),
            _ => (1, 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Function,
        args: Vec<Expr>,
    },
}

impl Expr {
    /// Identifiers referenced anywhere in the tree, in first-seen order
    pub fn identifiers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {},
            Expr::Ident(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            },
            Expr::Unary { expr, .. } => expr.collect_identifiers(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            },
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_identifiers(out)),
        }
    }
}

// Binding powers as (left, right); loosest first. Left-associative operators
// bind tighter on the right, `**` is right-associative.
const BP_NOT: u8 = 5;
const BP_NEG: u8 = 13;
const BP_CMP: u8 = 7;

fn infix(token: &Token) -> Option<(BinaryOp, u8, u8)> {
    let op = match token {
        Token::Or => (BinaryOp::Or, 1, 2),
        Token::And => (BinaryOp::And, 3, 4),
        Token::Eq => (BinaryOp::Eq, BP_CMP, 8),
        Token::NotEq => (BinaryOp::NotEq, BP_CMP, 8),
        Token::Lt => (BinaryOp::Lt, BP_CMP, 8),
        Token::Le => (BinaryOp::Le, BP_CMP, 8),
        Token::Gt => (BinaryOp::Gt, BP_CMP, 8),
        Token::Ge => (BinaryOp::Ge, BP_CMP, 8),
        Token::Plus => (BinaryOp::Add, 9, 10),
        Token::Minus => (BinaryOp::Sub, 9, 10),
        Token::Star => (BinaryOp::Mul, 11, 12),
        Token::Slash => (BinaryOp::Div, 11, 12),
        Token::Percent => (BinaryOp::Mod, 11, 12),
        Token::Power => (BinaryOp::Pow, 15, 14),
        _ => return None,
    };
    Some(op)
}

pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ExprError::Syntax {
            pos: 0,
            message: "empty expression".to_string(),
        });
    }
    let mut parser = Parser {
        tokens,
        idx: 0,
        end: src.len(),
    };
    let expr = parser.expr(0)?;
    match parser.peek() {
        None => Ok(expr),
        Some(t) => Err(ExprError::Syntax {
            pos: t.pos,
            message: format!("unexpected '{}'", t.token),
        }),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    idx: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.idx)
    }

    fn next(&mut self) -> Result<Spanned, ExprError> {
        let token = self.tokens.get(self.idx).cloned().ok_or(ExprError::Syntax {
            pos: self.end,
            message: "unexpected end of expression".to_string(),
        })?;
        self.idx += 1;
        Ok(token)
    }

    fn expect(&mut self, want: Token) -> Result<(), ExprError> {
        let got = self.next()?;
        if got.token == want {
            Ok(())
        } else {
            Err(ExprError::Syntax {
                pos: got.pos,
                message: format!("expected '{}', found '{}'", want, got.token),
            })
        }
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr, ExprError> {
        let mut lhs = self.prefix()?;

        while let Some((op, l_bp, r_bp)) = self.peek().and_then(|t| infix(&t.token)) {
            if l_bp < min_bp {
                break;
            }
            self.idx += 1;
            let rhs = self.expr(r_bp)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };

            if l_bp == BP_CMP {
                if let Some(t) = self.peek() {
                    if infix(&t.token).is_some_and(|(_, l, _)| l == BP_CMP) {
                        return Err(ExprError::Syntax {
                            pos: t.pos,
                            message: "comparisons cannot be chained; use 'and'".to_string(),
                        });
                    }
                }
            }
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, ExprError> {
        let Spanned { token, pos } = self.next()?;
        let expr = match token {
            Token::Int(i) => Expr::Literal(Value::Integer(i)),
            Token::Float(f) => Expr::Literal(Value::Numeric(f)),
            Token::Str(s) => Expr::Literal(Value::Text(s)),
            Token::True => Expr::Literal(Value::Boolean(true)),
            Token::False => Expr::Literal(Value::Boolean(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Minus => Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.expr(BP_NEG)?),
            },
            Token::Plus => self.expr(BP_NEG)?,
            Token::Not => Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.expr(BP_NOT)?),
            },
            Token::LParen => {
                let inner = self.expr(0)?;
                self.expect(Token::RParen)?;
                inner
            },
            Token::Ident(name) => {
                if matches!(self.peek().map(|t| &t.token), Some(Token::LParen)) {
                    self.call(&name, pos)?
                } else {
                    Expr::Ident(name)
                }
            },
            other => {
                return Err(ExprError::Syntax {
                    pos,
                    message: format!("unexpected '{}'", other),
                })
            },
        };
        Ok(expr)
    }

    fn call(&mut self, name: &str, pos: usize) -> Result<Expr, ExprError> {
        let func = Function::lookup(name).ok_or_else(|| ExprError::UnknownFunction {
            name: name.to_string(),
        })?;
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if !matches!(self.peek().map(|t| &t.token), Some(Token::RParen)) {
            loop {
                args.push(self.expr(0)?);
                if matches!(self.peek().map(|t| &t.token), Some(Token::Comma)) {
                    self.idx += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;

        let (min, max) = func.arity();
        if args.len() < min || args.len() > max {
            return Err(ExprError::Syntax {
                pos,
                message: format!(
                    "{}() takes {} argument(s), got {}",
                    func.name(),
                    if max == usize::MAX {
                        format!("at least {}", min)
                    } else if min == max {
                        min.to_string()
                    } else {
                        format!("{} to {}", min, max)
                    },
                    args.len()
                ),
            });
        }

        Ok(Expr::Call { func, args })
    }
}
