//! Recursive-descent parser.

use crate::error::ExpressionError;
use crate::expr::{CmpOp, Expression};
use crate::lexer::{tokenize, Spanned, Token};

pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    pub(crate) fn new(input: &str) -> Result<Self, ExpressionError> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
            end: input.len(),
        })
    }

    pub(crate) fn parse(mut self) -> Result<Expression, ExpressionError> {
        if self.tokens.is_empty() {
            return Err(ExpressionError::parse(0, "empty expression"));
        }
        let expr = self.or_expr()?;
        if let Some(extra) = self.tokens.get(self.pos) {
            return Err(ExpressionError::parse(
                extra.position,
                format!("unexpected {}", extra.token.describe()),
            ));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |s| s.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Expression, ExpressionError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.and_expr()?;
            lhs = Expression::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expression, ExpressionError> {
        let mut lhs = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.comparison()?;
            lhs = Expression::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expression, ExpressionError> {
        let lhs = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.operand()?;
        Ok(Expression::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn operand(&mut self) -> Result<Expression, ExpressionError> {
        let position = self.position();
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(ExpressionError::parse(position, "unclosed '('")),
                }
            }
            Some(Token::True) => Ok(Expression::Bool(true)),
            Some(Token::False) => Ok(Expression::Bool(false)),
            Some(Token::Ident(name)) => Ok(Expression::Variable(name)),
            Some(Token::Number(value, raw)) => Ok(self.number(value, raw)),
            Some(Token::Minus) => match self.advance() {
                Some(Token::Number(value, raw)) => Ok(self.number(-value, format!("-{raw}"))),
                _ => Err(ExpressionError::parse(position, "expected number after '-'")),
            },
            Some(other) => Err(ExpressionError::parse(
                position,
                format!("unexpected {}", other.describe()),
            )),
            None => Err(ExpressionError::parse(position, "unexpected end of expression")),
        }
    }

    fn number(&mut self, value: f64, raw: String) -> Expression {
        let suffix = match self.peek() {
            Some(Token::Suffix(s)) => {
                let s = s.clone();
                self.advance();
                Some(s)
            }
            _ => None,
        };
        Expression::Number { value, raw, suffix }
    }
}
