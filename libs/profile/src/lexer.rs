//! Tokenizer for profile expressions.

use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    /// Numeric literal with its source text.
    Number(f64, String),
    /// Unit written directly after a number (`%`, `Gib`).
    Suffix(String),
    True,
    False,
    LParen,
    RParen,
    Minus,
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{name}'"),
            Token::Number(_, raw) => format!("number '{raw}'"),
            Token::Suffix(s) => format!("suffix '{s}'"),
            Token::True => "'true'".to_string(),
            Token::False => "'false'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
            Token::Eq => "'=='".to_string(),
            Token::Ne => "'!='".to_string(),
            Token::Lt => "'<'".to_string(),
            Token::Le => "'<='".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::Ge => "'>='".to_string(),
        }
    }
}

/// A token and its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub position: usize,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.')
}

fn is_suffix_char(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '%'
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|(_, c)| *c);

    while let Some(&(position, c)) = chars.get(i) {
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let (token, len) = match (c, peek(i + 1)) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('-', _) => (Token::Minus, 1),
            (c, _) if c.is_ascii_digit() => {
                let start = i;
                let mut end = i;
                while peek(end).is_some_and(|c| c.is_ascii_digit() || c == '.') {
                    end += 1;
                }
                let raw: String = chars[start..end].iter().map(|(_, c)| *c).collect();
                let value: f64 = raw
                    .parse()
                    .map_err(|_| ExpressionError::parse(position, format!("invalid number '{raw}'")))?;
                tokens.push(Spanned {
                    token: Token::Number(value, raw),
                    position,
                });

                if peek(end).is_some_and(is_suffix_char) {
                    let suffix_start = end;
                    while peek(end).is_some_and(is_suffix_char) {
                        end += 1;
                    }
                    let suffix: String = chars[suffix_start..end].iter().map(|(_, c)| *c).collect();
                    tokens.push(Spanned {
                        token: Token::Suffix(suffix),
                        position: chars[suffix_start].0,
                    });
                }
                i = end;
                continue;
            }
            (c, _) if is_ident_start(c) => {
                let start = i;
                let mut end = i;
                while peek(end).is_some_and(is_ident_char) {
                    end += 1;
                }
                let word: String = chars[start..end].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                };
                tokens.push(Spanned { token, position });
                i = end;
                continue;
            }
            (c, _) => {
                return Err(ExpressionError::parse(
                    position,
                    format!("unexpected character '{c}'"),
                ))
            }
        };

        tokens.push(Spanned { token, position });
        i += len;
    }

    Ok(tokens)
}
