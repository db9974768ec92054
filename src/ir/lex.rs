//! The text-IR lexer.

use derive_more::Display;

/// Token classes for the text IR grammar (see `ir::text`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TokenKind {
    #[display("ident")]
    Ident,
    #[display("int")]
    Int,
    #[display("%")]
    Percent,
    #[display(":")]
    Colon,
    #[display(",")]
    Comma,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display(".")]
    Dot,
    #[display("*")]
    Star,
    #[display("eof")]
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub text: &'src str,
    pub pos: usize,
}

pub struct LexError {
    pub pos: usize,
    pub ch: char,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unexpected character {:?} at byte {}", self.ch, self.pos)
    }
}

pub struct Lexer<'src> {
    input: &'src str,
    pos: usize,
}

impl<'src> Lexer<'src> {
    pub fn new(input: &'src str) -> Lexer<'src> {
        Lexer { input, pos: 0 }
    }

    fn skip_trivia(&mut self) {
        let bytes = self.input.as_bytes();
        loop {
            while self.pos < bytes.len() && (bytes[self.pos] as char).is_whitespace() {
                self.pos += 1;
            }
            if self.pos < bytes.len() && bytes[self.pos] == b';' {
                while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    /// Tokenize the whole input eagerly; text IR programs are small enough
    /// that a one-shot token vector is simpler to parse against than a
    /// pull-based stream.
    pub fn tokenize(mut self) -> Result<Vec<Token<'src>>, LexError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let start = self.pos;
            let bytes = self.input.as_bytes();
            if start >= bytes.len() {
                tokens.push(Token { kind: TokenKind::Eof, text: "", pos: start });
                return Ok(tokens);
            }
            let c = bytes[start] as char;
            let single = match c {
                '%' => Some(TokenKind::Percent),
                ':' => Some(TokenKind::Colon),
                ',' => Some(TokenKind::Comma),
                '{' => Some(TokenKind::LBrace),
                '}' => Some(TokenKind::RBrace),
                '[' => Some(TokenKind::LBracket),
                ']' => Some(TokenKind::RBracket),
                '(' => Some(TokenKind::LParen),
                ')' => Some(TokenKind::RParen),
                '+' => Some(TokenKind::Plus),
                '-' => Some(TokenKind::Minus),
                '.' => Some(TokenKind::Dot),
                '*' => Some(TokenKind::Star),
                _ => None,
            };
            if let Some(kind) = single {
                self.pos += 1;
                tokens.push(Token { kind, text: &self.input[start..self.pos], pos: start });
                continue;
            }
            if c.is_ascii_digit() {
                while self.pos < bytes.len() && (bytes[self.pos] as char).is_ascii_digit() {
                    self.pos += 1;
                }
                tokens.push(Token { kind: TokenKind::Int, text: &self.input[start..self.pos], pos: start });
                continue;
            }
            if c.is_alphabetic() || c == '_' {
                while self.pos < bytes.len() {
                    let c = bytes[self.pos] as char;
                    if c.is_alphanumeric() || c == '_' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Token { kind: TokenKind::Ident, text: &self.input[start..self.pos], pos: start });
                continue;
            }
            return Err(LexError { pos: start, ch: c });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_simple_insn() {
        let toks = Lexer::new("mov i64 %0,1").tokenize().unwrap();
        let kinds: Vec<_> = toks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Percent,
                TokenKind::Int,
                TokenKind::Comma,
                TokenKind::Int,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn skips_comments() {
        let toks = Lexer::new("; a comment\nframe").tokenize().unwrap();
        assert_eq!(toks[0].kind, TokenKind::Ident);
        assert_eq!(toks[0].text, "frame");
    }
}
