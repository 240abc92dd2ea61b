//! Tokenizer for criteria expressions.

use std::iter::Peekable;
use std::str::CharIndices;

use super::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    StringLiteral(String),
    NumberLiteral(f64),
    True,
    False,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Dot,
    Comma,
    LParen,
    RParen,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    Lexer {
        source,
        chars: source.char_indices().peekable(),
    }
    .run()
}

struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn run(mut self) -> Result<Vec<Token>, EvalError> {
        let mut tokens = Vec::new();
        while let Some(&(pos, c)) = self.chars.peek() {
            match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '(' => tokens.push(self.single(Token::LParen)),
                ')' => tokens.push(self.single(Token::RParen)),
                '.' => tokens.push(self.single(Token::Dot)),
                ',' => tokens.push(self.single(Token::Comma)),
                '!' => {
                    self.chars.next();
                    if self.eat('=') {
                        tokens.push(Token::NotEq);
                    } else {
                        tokens.push(Token::Bang);
                    }
                }
                '=' => {
                    self.chars.next();
                    if self.eat('=') {
                        tokens.push(Token::EqEq);
                    } else {
                        return Err(self.error(pos, "expected '==' (assignment is not supported)"));
                    }
                }
                '<' => {
                    self.chars.next();
                    tokens.push(if self.eat('=') { Token::Le } else { Token::Lt });
                }
                '>' => {
                    self.chars.next();
                    tokens.push(if self.eat('=') { Token::Ge } else { Token::Gt });
                }
                '&' => {
                    self.chars.next();
                    if self.eat('&') {
                        tokens.push(Token::AndAnd);
                    } else {
                        return Err(self.error(pos, "expected '&&'"));
                    }
                }
                '|' => {
                    self.chars.next();
                    if self.eat('|') {
                        tokens.push(Token::OrOr);
                    } else {
                        return Err(self.error(pos, "expected '||'"));
                    }
                }
                '"' | '\'' => tokens.push(self.string(pos, c)?),
                '-' => tokens.push(self.number(pos)?),
                c if c.is_ascii_digit() => tokens.push(self.number(pos)?),
                c if c.is_ascii_alphabetic() || c == '_' => tokens.push(self.ident(pos)),
                other => {
                    return Err(self.error(pos, format!("unexpected character '{}'", other)));
                }
            }
        }
        if tokens.is_empty() {
            return Err(EvalError::Parse("empty expression".to_string()));
        }
        Ok(tokens)
    }

    fn single(&mut self, token: Token) -> Token {
        self.chars.next();
        token
    }

    fn eat(&mut self, expected: char) -> bool {
        if matches!(self.chars.peek(), Some(&(_, c)) if c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn string(&mut self, start: usize, quote: char) -> Result<Token, EvalError> {
        self.chars.next(); // opening quote
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => return Ok(Token::StringLiteral(value)),
                Some((pos, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, c)) if c == quote => value.push(c),
                    Some((_, other)) => {
                        return Err(self.error(pos, format!("unknown escape '\\{}'", other)))
                    }
                    None => return Err(self.error(pos, "unterminated escape")),
                },
                Some((_, c)) => value.push(c),
                None => return Err(self.error(start, "unterminated string literal")),
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<Token, EvalError> {
        let mut end = start;
        if matches!(self.chars.peek(), Some(&(_, '-'))) {
            let (pos, _) = self.chars.next().expect("peeked");
            end = pos;
        }
        let mut seen_digit = false;
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                // A dot is part of the number only when a digit follows;
                // otherwise it is member access (e.g. `3.x` never occurs,
                // but `-` handling keeps this honest).
                if c == '.' {
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    if !matches!(lookahead.peek(), Some(&(_, d)) if d.is_ascii_digit()) {
                        break;
                    }
                } else {
                    seen_digit = true;
                }
                end = pos;
                self.chars.next();
            } else {
                break;
            }
        }
        if !seen_digit {
            return Err(self.error(start, "expected a number"));
        }
        let text = &self.source[start..=end];
        text.parse::<f64>()
            .map(Token::NumberLiteral)
            .map_err(|_| self.error(start, format!("invalid number '{}'", text)))
    }

    fn ident(&mut self, start: usize) -> Token {
        let mut end = start;
        while let Some(&(pos, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                end = pos;
                self.chars.next();
            } else {
                break;
            }
        }
        match &self.source[start..=end] {
            "true" => Token::True,
            "false" => Token::False,
            ident => Token::Ident(ident.to_string()),
        }
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> EvalError {
        EvalError::Parse(format!("at offset {}: {}", pos, message.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_expression() {
        let tokens = tokenize(r#"event.payload.after.role == "admin""#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("event".into()),
                Token::Dot,
                Token::Ident("payload".into()),
                Token::Dot,
                Token::Ident("after".into()),
                Token::Dot,
                Token::Ident("role".into()),
                Token::EqEq,
                Token::StringLiteral("admin".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_operators() {
        let tokens = tokenize("a && b || !c != d <= -1.5").unwrap();
        assert!(tokens.contains(&Token::AndAnd));
        assert!(tokens.contains(&Token::OrOr));
        assert!(tokens.contains(&Token::Bang));
        assert!(tokens.contains(&Token::NotEq));
        assert!(tokens.contains(&Token::Le));
        assert!(tokens.contains(&Token::NumberLiteral(-1.5)));
    }

    #[test]
    fn test_single_quoted_strings() {
        let tokens = tokenize("x == 'admin'").unwrap();
        assert_eq!(tokens[2], Token::StringLiteral("admin".into()));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = tokenize(r#"x == "a\"b\\c""#).unwrap();
        assert_eq!(tokens[2], Token::StringLiteral(r#"a"b\c"#.into()));
    }

    #[test]
    fn test_rejects_single_ampersand() {
        assert!(tokenize("a & b").is_err());
    }

    #[test]
    fn test_rejects_single_equals() {
        assert!(tokenize("a = b").is_err());
    }

    #[test]
    fn test_rejects_empty() {
        assert!(tokenize("   ").is_err());
    }
}
