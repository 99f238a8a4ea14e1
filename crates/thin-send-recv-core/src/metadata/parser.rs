//! Validates structure of the textual metadata dump and extracts the block
//! size plus the sequence of extents it describes.
//!
//! Two grammars share one entry point: the two-snapshot diff grammar and the
//! full-volume dump grammar. Both are distinguished by what attribute follows
//! `transaction=..` in the `<superblock>` open tag (`data_block_size` for a
//! diff, `flags`/`version` for a dump).

use super::error::MetadataError;
use super::scanner::Scanner;
use super::token::Token;
use crate::types::{BlockSize, Extent, ExtentKind};

/// Result of a successful metadata parse: the pool's block size and the
/// extents the dump/diff describes, in the order encountered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMetadata {
    pub block_size: BlockSize,
    pub extents: Vec<Extent>,
}

pub struct Parser<'a> {
    scanner: Scanner<'a>,
    lookahead: Option<Token>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self { scanner: Scanner::new(input), lookahead: None }
    }

    /// Parses the whole document, dispatching to the diff or dump grammar.
    pub fn parse(input: &'a str) -> Result<ParsedMetadata, MetadataError> {
        let mut parser = Self::new(input);
        parser.parse_document()
    }

    fn peek(&mut self) -> Result<&Token, MetadataError> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.scanner.next_token()?);
        }
        Ok(self.lookahead.as_ref().unwrap())
    }

    fn bump(&mut self) -> Result<Token, MetadataError> {
        if let Some(tok) = self.lookahead.take() {
            return Ok(tok);
        }
        self.scanner.next_token()
    }

    fn expect_punct(&mut self, wanted: &Token) -> Result<(), MetadataError> {
        let tok = self.bump()?;
        if &tok == wanted {
            Ok(())
        } else {
            Err(MetadataError::UnexpectedToken { expected: wanted.label(), found: tok.label() })
        }
    }

    fn expect_ident(&mut self, name: &str) -> Result<(), MetadataError> {
        let tok = self.bump()?;
        match tok {
            Token::Ident(ref s) if s == name => Ok(()),
            other => Err(MetadataError::UnexpectedToken {
                expected: format!("identifier `{name}`"),
                found: other.label(),
            }),
        }
    }

    fn expect_value(&mut self) -> Result<String, MetadataError> {
        let tok = self.bump()?;
        match tok {
            Token::Value(v) => Ok(v),
            other => {
                Err(MetadataError::UnexpectedToken { expected: "quoted value".to_string(), found: other.label() })
            }
        }
    }

    /// Peeks the identifier that starts the next attribute or tag name,
    /// without consuming it. Returns `None` if the next token isn't an
    /// identifier (e.g. it's `>` or `/`).
    fn peek_ident_name(&mut self) -> Result<Option<String>, MetadataError> {
        match self.peek()? {
            Token::Ident(s) => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    /// Consumes `name=VALUE` and returns the parsed attribute value.
    fn attr(&mut self, name: &str) -> Result<String, MetadataError> {
        self.expect_ident(name)?;
        self.expect_punct(&Token::Eq)?;
        self.expect_value()
    }

    fn attr_u64(&mut self, name: &str) -> Result<u64, MetadataError> {
        let value = self.attr(name)?;
        value
            .parse::<u64>()
            .map_err(|_| MetadataError::InvalidInteger { attr: name.to_string(), value })
    }

    fn parse_document(&mut self) -> Result<ParsedMetadata, MetadataError> {
        self.expect_punct(&Token::Lt)?;
        self.expect_ident("superblock")?;
        let _uuid = self.attr("uuid")?;
        let _time = self.attr_u64("time")?;
        let _transaction = self.attr_u64("transaction")?;

        let result = match self.peek_ident_name()? {
            Some(name) if name == "data_block_size" => self.parse_diff_tail()?,
            Some(name) if name == "flags" || name == "version" => self.parse_dump_tail()?,
            other => {
                return Err(MetadataError::UnexpectedToken {
                    expected: "`data_block_size`, `flags`, or `version`".to_string(),
                    found: other.map(|n| format!("identifier `{n}`")).unwrap_or_else(|| "non-identifier".to_string()),
                });
            }
        };

        self.expect_punct(&Token::Lt)?;
        self.expect_punct(&Token::Slash)?;
        self.expect_ident("superblock")?;
        self.expect_punct(&Token::Gt)?;

        let eof = self.bump()?;
        if eof != Token::Eof {
            return Err(MetadataError::UnexpectedToken { expected: Token::Eof.label(), found: eof.label() });
        }

        Ok(result)
    }

    fn block_size_from_attr(&self, sectors: u64) -> Result<BlockSize, MetadataError> {
        BlockSize::new(sectors).ok_or(MetadataError::InvalidBlockSize(sectors))
    }

    /// `<diff left=.. right=..> (<same|different|left_only|right_only .../>)* </diff>`
    fn parse_diff_tail(&mut self) -> Result<ParsedMetadata, MetadataError> {
        let block_size = self.block_size_from_attr(self.attr_u64_unbound("data_block_size")?)?;
        let _nr_data_blocks = self.attr_u64("nr_data_blocks")?;
        self.expect_punct(&Token::Gt)?;

        self.expect_punct(&Token::Lt)?;
        self.expect_ident("diff")?;
        let _left = self.attr("left")?;
        let _right = self.attr("right")?;
        self.expect_punct(&Token::Gt)?;

        let mut extents = Vec::new();
        loop {
            self.expect_punct(&Token::Lt)?;
            if matches!(self.peek()?, Token::Slash) {
                self.bump()?;
                self.expect_ident("diff")?;
                self.expect_punct(&Token::Gt)?;
                break;
            }
            let element = match self.bump()? {
                Token::Ident(s) => s,
                other => {
                    return Err(MetadataError::UnexpectedToken {
                        expected: "`same`, `different`, `left_only`, `right_only`, or `/diff`".to_string(),
                        found: other.label(),
                    });
                }
            };
            let kind = match element.as_str() {
                "different" | "right_only" => Some(ExtentKind::DataPresent),
                "left_only" => Some(ExtentKind::DataAbsent),
                "same" => None,
                other => return Err(MetadataError::UnknownElement { element: other.to_string() }),
            };
            let begin = self.attr_u64("begin")?;
            let length = self.attr_u64("length")?;
            self.expect_punct(&Token::Slash)?;
            self.expect_punct(&Token::Gt)?;
            if let Some(kind) = kind {
                extents.push(Extent::new(begin, length, kind));
            }
        }

        Ok(ParsedMetadata { block_size, extents })
    }

    /// `<device dev_id=.. mapped_blocks=.. transaction=.. creation_time=.. snap_time=..>
    ///  (<single_mapping .../> | <range_mapping .../>)* </device>`
    fn parse_dump_tail(&mut self) -> Result<ParsedMetadata, MetadataError> {
        if self.peek_ident_name()?.as_deref() == Some("flags") {
            let _flags = self.attr("flags")?;
        }
        let _version = self.attr("version")?;
        let block_size = self.block_size_from_attr(self.attr_u64_unbound("data_block_size")?)?;
        let _nr_data_blocks = self.attr_u64("nr_data_blocks")?;
        self.expect_punct(&Token::Gt)?;

        self.expect_punct(&Token::Lt)?;
        self.expect_ident("device")?;
        let _dev_id = self.attr_u64("dev_id")?;
        let _mapped_blocks = self.attr_u64("mapped_blocks")?;
        let _transaction = self.attr_u64("transaction")?;
        let _creation_time = self.attr_u64("creation_time")?;
        let _snap_time = self.attr_u64("snap_time")?;
        self.expect_punct(&Token::Gt)?;

        let mut extents = Vec::new();
        loop {
            self.expect_punct(&Token::Lt)?;
            if matches!(self.peek()?, Token::Slash) {
                self.bump()?;
                self.expect_ident("device")?;
                self.expect_punct(&Token::Gt)?;
                break;
            }
            let element = match self.bump()? {
                Token::Ident(s) => s,
                other => {
                    return Err(MetadataError::UnexpectedToken {
                        expected: "`single_mapping`, `range_mapping`, or `/device`".to_string(),
                        found: other.label(),
                    });
                }
            };
            match element.as_str() {
                "single_mapping" => {
                    let origin_block = self.attr_u64("origin_block")?;
                    let _data_block = self.attr_u64("data_block")?;
                    let _time = self.attr_u64("time")?;
                    self.expect_punct(&Token::Slash)?;
                    self.expect_punct(&Token::Gt)?;
                    extents.push(Extent::new(origin_block, 1, ExtentKind::DataPresent));
                }
                "range_mapping" => {
                    let origin_begin = self.attr_u64("origin_begin")?;
                    let _data_begin = self.attr_u64("data_begin")?;
                    let length = self.attr_u64("length")?;
                    let _time = self.attr_u64("time")?;
                    self.expect_punct(&Token::Slash)?;
                    self.expect_punct(&Token::Gt)?;
                    extents.push(Extent::new(origin_begin, length, ExtentKind::DataPresent));
                }
                other => return Err(MetadataError::UnknownElement { element: other.to_string() }),
            }
        }

        Ok(ParsedMetadata { block_size, extents })
    }

    /// Like `attr_u64` but for an attribute whose name was only just
    /// confirmed via `peek_ident_name` (kept separate so callers that already
    /// know the name don't pay for a redundant peek).
    fn attr_u64_unbound(&mut self, name: &str) -> Result<u64, MetadataError> {
        self.attr_u64(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_empty_diff() {
        let input = r#"<superblock uuid="u" time="0" transaction="1" data_block_size="128" nr_data_blocks="100">
            <diff left="l" right="r">
            <same begin="0" length="10"/>
            </diff>
            </superblock>"#;
        let parsed = Parser::parse(input).unwrap();
        assert_eq!(parsed.block_size.sectors(), 128);
        assert!(parsed.extents.is_empty());
    }

    #[test]
    fn parses_mixed_diff() {
        let input = r#"<superblock uuid="u" time="0" transaction="1" data_block_size="64" nr_data_blocks="100">
            <diff left="l" right="r">
            <right_only begin="0" length="1"/>
            <left_only begin="1" length="2"/>
            </diff>
            </superblock>"#;
        let parsed = Parser::parse(input).unwrap();
        assert_eq!(parsed.extents.len(), 2);
        assert_eq!(parsed.extents[0], Extent::new(0, 1, ExtentKind::DataPresent));
        assert_eq!(parsed.extents[1], Extent::new(1, 2, ExtentKind::DataAbsent));
    }

    #[test]
    fn parses_dump_without_flags() {
        let input = r#"<superblock uuid="u" time="0" transaction="1" version="2" data_block_size="1" nr_data_blocks="100">
            <device dev_id="3" mapped_blocks="2" transaction="1" creation_time="0" snap_time="0">
            <range_mapping origin_begin="0" data_begin="0" length="2" time="0"/>
            </device>
            </superblock>"#;
        let parsed = Parser::parse(input).unwrap();
        assert_eq!(parsed.block_size.sectors(), 1);
        assert_eq!(parsed.extents, vec![Extent::new(0, 2, ExtentKind::DataPresent)]);
    }

    #[test]
    fn parses_dump_with_flags() {
        let input = r#"<superblock uuid="u" time="0" transaction="1" flags="0" version="2" data_block_size="1" nr_data_blocks="100">
            <device dev_id="3" mapped_blocks="1" transaction="1" creation_time="0" snap_time="0">
            <single_mapping origin_block="5" data_block="9" time="0"/>
            </device>
            </superblock>"#;
        let parsed = Parser::parse(input).unwrap();
        assert_eq!(parsed.extents, vec![Extent::new(5, 1, ExtentKind::DataPresent)]);
    }

    #[test]
    fn rejects_unexpected_token() {
        let input = r#"<superblock uuid="u" time="0" transaction="1" bogus="1">"#;
        let err = Parser::parse(input).unwrap_err();
        assert!(matches!(err, MetadataError::UnexpectedToken { .. }));
    }

    #[test]
    fn rejects_zero_block_size() {
        let input = r#"<superblock uuid="u" time="0" transaction="1" data_block_size="0" nr_data_blocks="0">
            <diff left="l" right="r"></diff></superblock>"#;
        let err = Parser::parse(input).unwrap_err();
        assert!(matches!(err, MetadataError::InvalidBlockSize(0)));
    }
}
