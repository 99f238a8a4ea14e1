//! Token kinds produced by the [`super::scanner::Scanner`].

/// A single lexical token from the textual metadata dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `/`
    Slash,
    /// `=`
    Eq,
    /// A quoted attribute value, payload already unescaped of surrounding quotes.
    Value(String),
    /// A bare identifier: an element or attribute name.
    Ident(String),
    /// End of input.
    Eof,
}

impl Token {
    /// Human-readable label for diagnostics, independent of any payload.
    pub fn label(&self) -> String {
        match self {
            Token::Lt => "'<'".to_string(),
            Token::Gt => "'>'".to_string(),
            Token::Slash => "'/'".to_string(),
            Token::Eq => "'='".to_string(),
            Token::Value(v) => format!("value \"{v}\""),
            Token::Ident(s) => format!("identifier `{s}`"),
            Token::Eof => "end of input".to_string(),
        }
    }
}
