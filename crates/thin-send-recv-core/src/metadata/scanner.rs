//! Lexes the textual metadata dump into a token stream.
//!
//! Single-threaded, owned by the parser: there is no reason for this to be
//! `Send`/`Sync` or to buffer more than one lookahead token, since the parser
//! consumes tokens strictly left to right.

use super::error::MetadataError;
use super::token::Token;

/// Lazy scanner over the full dump text. Operates on bytes (the grammar is
/// pure ASCII punctuation plus quoted/bare words) and reports byte offsets on
/// error so diagnostics can point at the exact column.
pub struct Scanner<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { input: input.as_bytes(), pos: 0 }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    /// Scans and returns the next token, advancing past it. Returns
    /// `Token::Eof` exactly once input is exhausted; calling again after that
    /// keeps returning `Token::Eof`.
    pub fn next_token(&mut self) -> Result<Token, MetadataError> {
        self.skip_whitespace();
        let Some(b) = self.peek_byte() else {
            return Ok(Token::Eof);
        };
        match b {
            b'<' => {
                self.pos += 1;
                Ok(Token::Lt)
            }
            b'>' => {
                self.pos += 1;
                Ok(Token::Gt)
            }
            b'/' => {
                self.pos += 1;
                Ok(Token::Slash)
            }
            b'=' => {
                self.pos += 1;
                Ok(Token::Eq)
            }
            b'"' => self.scan_value(),
            b if b.is_ascii_alphabetic() || b == b'_' => Ok(self.scan_ident()),
            other => Err(MetadataError::UnexpectedByte { byte: other, offset: self.pos }),
        }
    }

    fn scan_value(&mut self) -> Result<Token, MetadataError> {
        debug_assert_eq!(self.peek_byte(), Some(b'"'));
        let start_offset = self.pos;
        self.pos += 1;
        let start = self.pos;
        while let Some(b) = self.peek_byte() {
            if b == b'"' {
                let raw = &self.input[start..self.pos];
                self.pos += 1;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| MetadataError::InvalidUtf8 { offset: start })?;
                return Ok(Token::Value(s.to_string()));
            }
            self.pos += 1;
        }
        Err(MetadataError::UnterminatedValue { offset: start_offset })
    }

    fn scan_ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(b) = self.peek_byte() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        // ASCII-only alphabetic/underscore bytes were matched above.
        let s = std::str::from_utf8(&self.input[start..self.pos]).unwrap();
        Token::Ident(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(input: &str) -> Vec<Token> {
        let mut scanner = Scanner::new(input);
        let mut out = Vec::new();
        loop {
            let tok = scanner.next_token().expect("scan should succeed");
            let done = tok == Token::Eof;
            out.push(tok);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_punctuation_and_idents() {
        let toks = tokens(r#"<superblock uuid="abc"/>"#);
        assert_eq!(
            toks,
            vec![
                Token::Lt,
                Token::Ident("superblock".to_string()),
                Token::Ident("uuid".to_string()),
                Token::Eq,
                Token::Value("abc".to_string()),
                Token::Slash,
                Token::Gt,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn scans_closing_tag() {
        let toks = tokens("</diff>");
        assert_eq!(
            toks,
            vec![Token::Lt, Token::Slash, Token::Ident("diff".to_string()), Token::Gt, Token::Eof]
        );
    }

    #[test]
    fn rejects_unterminated_value() {
        let mut scanner = Scanner::new(r#"uuid="abc"#);
        scanner.next_token().unwrap();
        scanner.next_token().unwrap();
        let err = scanner.next_token().unwrap_err();
        assert!(matches!(err, MetadataError::UnterminatedValue { .. }));
    }

    #[test]
    fn rejects_unknown_byte() {
        let mut scanner = Scanner::new("&");
        let err = scanner.next_token().unwrap_err();
        assert!(matches!(err, MetadataError::UnexpectedByte { byte: b'&', .. }));
    }

    #[test]
    fn repeated_eof_is_stable() {
        let mut scanner = Scanner::new("");
        assert_eq!(scanner.next_token().unwrap(), Token::Eof);
        assert_eq!(scanner.next_token().unwrap(), Token::Eof);
    }
}
