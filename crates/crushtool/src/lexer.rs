//! Tokenizer for the CRUSH map DSL.
//!
//! The token set is deliberately small: numbers, bare identifiers, and
//! braces. Reserved words (`device`, `step`, `alg`, ...) are ordinary
//! identifiers here; the parser matches them by text, so names only clash
//! with keywords in positions where a keyword is actually expected.

use logos::{Logos, Span};

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token<'src> {
    /// Float literal (sign optional, decimal point required)
    #[regex(r"-?[0-9]+\.[0-9]+", |lex| lex.slice().parse().ok())]
    Float(f64),

    /// Integer literal (sign optional)
    #[regex(r"-?[0-9]+", |lex| lex.slice().parse().ok())]
    Int(i64),

    /// Bare identifier; also covers every reserved word
    #[regex(r"[A-Za-z_][A-Za-z0-9_-]*", |lex| lex.slice())]
    Ident(&'src str),

    #[token("{")]
    BraceOpen,
    #[token("}")]
    BraceClose,
}

/// A token with its byte span in the source
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<'src> {
    pub token: Token<'src>,
    pub span: Span,
}

/// Error during lexing: the offending span and its text
#[derive(Debug, Clone)]
pub struct LexError {
    pub span: Span,
    pub slice: String,
}

/// Tokenize source text into spanned tokens
pub fn lex(source: &str) -> Result<Vec<Spanned<'_>>, LexError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        match result {
            Ok(token) => tokens.push(Spanned {
                token,
                span: lexer.span(),
            }),
            Err(()) => {
                return Err(LexError {
                    span: lexer.span(),
                    slice: lexer.slice().to_string(),
                })
            }
        }
    }

    Ok(tokens)
}
