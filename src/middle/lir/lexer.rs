use std::{collections::BTreeMap, str::Chars};

use itertools::{PeekNth, peek_nth};
use once_cell::sync::Lazy;

use super::parser::ParseError;

#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source str,
    position: usize,
    chars: PeekNth<Chars<'source>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Identifier, // store
    Value,      // %acc
    Label,      // .loop
    Integer,    // -12

    OpenParen,    // (
    CloseParen,   // )
    OpenBracket,  // [
    CloseBracket, // ]
    OpenBrace,    // {
    CloseBrace,   // }
    Comma,        // ,
    Colon,        // :
    Equals,       // =
    LeftArrow,    // <-
}

impl TokenKind {
    pub fn can_start_operand(self) -> bool {
        matches!(self, Self::Value | Self::Integer | Self::Identifier)
    }
}

/// Table of single char tokens (matched after longer sequences are checked for)
static SINGLE_TOKENS: Lazy<BTreeMap<char, TokenKind>> = Lazy::new(|| {
    BTreeMap::from([
        ('(', TokenKind::OpenParen),
        (')', TokenKind::CloseParen),
        ('[', TokenKind::OpenBracket),
        (']', TokenKind::CloseBracket),
        ('{', TokenKind::OpenBrace),
        ('}', TokenKind::CloseBrace),
        (',', TokenKind::Comma),
        (':', TokenKind::Colon),
        ('=', TokenKind::Equals),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            source,
            position: 0,
            chars: peek_nth(source.chars()),
        }
    }

    /// Lexes the whole input
    pub fn tokenize(source: &'source str) -> Result<Vec<Token>, ParseError> {
        let mut lexer = Self::new(source);
        let mut tokens = Vec::new();

        while let Some(token) = lexer.next_token()? {
            tokens.push(token);
        }

        Ok(tokens)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.position += c.len_utf8();
        Some(c)
    }

    fn error(&self, position: usize, message: impl Into<String>) -> ParseError {
        ParseError::at(self.source, position, message)
    }

    fn ignore_whitespace_and_comments(&mut self) {
        loop {
            match self.chars.peek().copied() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.chars.peek_nth(1) == Some(&'/') => {
                    while let Some(c) = self.advance() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn take_word(&mut self) {
        while let Some(c) = self.chars.peek().copied() {
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '.') {
                break;
            }
            self.advance();
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, ParseError> {
        self.ignore_whitespace_and_comments();

        let start = self.position;
        let Some(c) = self.chars.peek().copied() else {
            return Ok(None);
        };

        let kind = match c {
            '%' | '.' => {
                self.advance();
                let name_start = self.position;
                self.take_word();

                if self.position == name_start {
                    return Err(self.error(start, format!("expected a name after `{c}`")));
                }

                if c == '%' {
                    TokenKind::Value
                } else {
                    TokenKind::Label
                }
            }
            '<' if self.chars.peek_nth(1) == Some(&'-') => {
                self.advance();
                self.advance();
                TokenKind::LeftArrow
            }
            '-' | '0'..='9' => {
                self.advance();
                while self.chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }

                if c == '-' && self.position == start + 1 {
                    return Err(self.error(start, "expected digits after `-`"));
                }

                TokenKind::Integer
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                self.take_word();
                TokenKind::Identifier
            }
            c => {
                let Some(kind) = SINGLE_TOKENS.get(&c).copied() else {
                    return Err(self.error(start, format!("unexpected character `{c}`")));
                };
                self.advance();
                kind
            }
        };

        Ok(Some(Token {
            kind,
            span: Span::new(start, self.position),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::tokenize(source)
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn lexes_store_and_phi() {
        assert_eq!(
            kinds("store %x <- -4 // trailing comment\n%p: i64 = phi [.a: 1]"),
            vec![
                TokenKind::Identifier,
                TokenKind::Value,
                TokenKind::LeftArrow,
                TokenKind::Integer,
                TokenKind::Value,
                TokenKind::Colon,
                TokenKind::Identifier,
                TokenKind::Equals,
                TokenKind::Identifier,
                TokenKind::OpenBracket,
                TokenKind::Label,
                TokenKind::Colon,
                TokenKind::Integer,
                TokenKind::CloseBracket,
            ]
        );
    }

    #[test]
    fn rejects_stray_characters() {
        let error = Lexer::tokenize("ret\n  $").unwrap_err();
        assert_eq!((error.line, error.column), (2, 3));
    }
}
