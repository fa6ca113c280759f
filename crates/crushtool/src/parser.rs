//! Recursive-descent parser for the CRUSH map DSL.
//!
//! The grammar is flat enough that every construct is decided by one
//! identifier of lookahead. Errors carry the position of the first token
//! the parser could not use; [`LineMap`] turns that byte offset back into a
//! 1-based line/column and the surrounding source line.

use crate::ast::{BucketDecl, Decl, DeviceDecl, ItemClause, OffloadSpec, Program, RuleDecl, StepDecl, StepKind, TypeDecl};
use crate::error::{CompileError, Result};
use crate::lexer::{lex, Spanned, Token};

/// Sorted table of line-start offsets for diagnostics
pub struct LineMap {
    line_starts: Vec<usize>,
}

impl LineMap {
    pub fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        LineMap { line_starts }
    }

    /// 1-based (line, column) of a byte offset
    pub fn location(&self, offset: usize) -> (usize, usize) {
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let column = offset - self.line_starts[line - 1] + 1;
        (line, column)
    }

    /// Text of a 1-based line, without its trailing newline
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        let start = self.line_starts[line - 1];
        let end = self
            .line_starts
            .get(line)
            .map(|&next| next - 1)
            .unwrap_or(source.len());
        &source[start..end]
    }
}

fn parse_error_at(source: &str, line_map: &LineMap, offset: usize) -> CompileError {
    let (line, column) = line_map.location(offset);
    let text = line_map.line_text(source, line);
    let fragment = text
        .get(column - 1..)
        .unwrap_or("")
        .trim_end()
        .to_string();
    CompileError::Parse { line, column, fragment }
}

/// Parse a whole source file
pub fn parse(source: &str) -> Result<Program> {
    let line_map = LineMap::new(source);
    let tokens =
        lex(source).map_err(|e| parse_error_at(source, &line_map, e.span.start))?;
    Parser {
        source,
        line_map,
        tokens,
        pos: 0,
    }
    .program()
}

struct Parser<'src> {
    source: &'src str,
    line_map: LineMap,
    tokens: Vec<Spanned<'src>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<Token<'src>> {
        self.tokens.get(self.pos).map(|t| t.token)
    }

    fn peek_ident(&self) -> Option<&'src str> {
        match self.peek() {
            Some(Token::Ident(s)) => Some(s),
            _ => None,
        }
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    /// Offset of the token the parser is stuck on (end of input if none)
    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.span.start)
            .unwrap_or(self.source.len())
    }

    /// End offset of the last consumed token
    fn prev_end(&self) -> usize {
        self.tokens
            .get(self.pos.wrapping_sub(1))
            .map(|t| t.span.end)
            .unwrap_or(0)
    }

    fn error(&self) -> CompileError {
        parse_error_at(self.source, &self.line_map, self.offset())
    }

    fn expect_int(&mut self) -> Result<i64> {
        match self.peek() {
            Some(Token::Int(v)) => {
                self.advance();
                Ok(v)
            }
            _ => Err(self.error()),
        }
    }

    /// A float position also accepts an integer literal
    fn expect_number(&mut self) -> Result<f64> {
        match self.peek() {
            Some(Token::Float(v)) => {
                self.advance();
                Ok(v)
            }
            Some(Token::Int(v)) => {
                self.advance();
                Ok(v as f64)
            }
            _ => Err(self.error()),
        }
    }

    fn expect_ident(&mut self) -> Result<&'src str> {
        match self.peek() {
            Some(Token::Ident(s)) => {
                self.advance();
                Ok(s)
            }
            _ => Err(self.error()),
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<()> {
        if self.peek_ident() == Some(keyword) {
            self.advance();
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn expect_token(&mut self, token: Token<'src>) -> Result<()> {
        if self.peek() == Some(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error())
        }
    }

    fn program(mut self) -> Result<Program> {
        let mut decls = Vec::new();
        while self.peek().is_some() {
            let decl = match self.peek_ident().ok_or_else(|| self.error())? {
                "device" => Decl::Device(self.device()?),
                "type" => Decl::BucketType(self.type_decl()?),
                "rule" => Decl::Rule(self.rule()?),
                _ => Decl::Bucket(self.bucket()?),
            };
            decls.push(decl);
        }
        Ok(Program { decls })
    }

    fn device(&mut self) -> Result<DeviceDecl> {
        let start = self.offset();
        self.expect_keyword("device")?;
        let id = self.expect_int()?;
        let name = self.expect_ident()?.to_string();
        let offload = match self.peek_ident() {
            Some("offload") => {
                self.advance();
                Some(OffloadSpec::Offload(self.expect_number()?))
            }
            Some("load") => {
                self.advance();
                Some(OffloadSpec::Load(self.expect_number()?))
            }
            Some("down") => {
                self.advance();
                Some(OffloadSpec::Down)
            }
            _ => None,
        };
        Ok(DeviceDecl {
            id,
            name,
            offload,
            span: start..self.prev_end(),
        })
    }

    fn type_decl(&mut self) -> Result<TypeDecl> {
        let start = self.offset();
        self.expect_keyword("type")?;
        let level = self.expect_int()?;
        let name = self.expect_ident()?.to_string();
        Ok(TypeDecl {
            level,
            name,
            span: start..self.prev_end(),
        })
    }

    fn bucket(&mut self) -> Result<BucketDecl> {
        let start = self.offset();
        let type_name = self.expect_ident()?.to_string();
        let name = self.expect_ident()?.to_string();
        self.expect_token(Token::BraceOpen)?;

        let mut id = None;
        let mut alg = None;
        let mut items = Vec::new();
        loop {
            match self.peek_ident() {
                Some("id") => {
                    self.advance();
                    id = Some(self.expect_int()?);
                }
                Some("alg") => {
                    self.advance();
                    alg = Some(self.expect_ident()?.to_string());
                }
                Some("item") => items.push(self.item()?),
                _ => break,
            }
        }
        self.expect_token(Token::BraceClose)?;

        Ok(BucketDecl {
            type_name,
            name,
            id,
            alg,
            items,
            span: start..self.prev_end(),
        })
    }

    fn item(&mut self) -> Result<ItemClause> {
        let start = self.offset();
        self.expect_keyword("item")?;
        let name = self.expect_ident()?.to_string();
        let mut weight = None;
        let mut pos = None;
        loop {
            match self.peek_ident() {
                Some("weight") => {
                    self.advance();
                    weight = Some(self.expect_number()?);
                }
                Some("pos") => {
                    self.advance();
                    pos = Some(self.expect_int()?);
                }
                _ => break,
            }
        }
        Ok(ItemClause {
            name,
            weight,
            pos,
            span: start..self.prev_end(),
        })
    }

    fn rule(&mut self) -> Result<RuleDecl> {
        let start = self.offset();
        self.expect_keyword("rule")?;
        let name = match self.peek() {
            Some(Token::Ident(s)) => {
                self.advance();
                Some(s.to_string())
            }
            _ => None,
        };
        self.expect_token(Token::BraceOpen)?;
        self.expect_keyword("pool")?;
        let pool = self.expect_int()?;
        self.expect_keyword("type")?;
        let rule_type = self.expect_ident()?.to_string();
        self.expect_keyword("min_size")?;
        let min_size = self.expect_int()?;
        self.expect_keyword("max_size")?;
        let max_size = self.expect_int()?;

        let mut steps = Vec::new();
        while self.peek_ident() == Some("step") {
            steps.push(self.step()?);
        }
        self.expect_token(Token::BraceClose)?;

        Ok(RuleDecl {
            name,
            pool,
            rule_type,
            min_size,
            max_size,
            steps,
            span: start..self.prev_end(),
        })
    }

    fn step(&mut self) -> Result<StepDecl> {
        let start = self.offset();
        self.expect_keyword("step")?;
        let kind = match self.peek_ident() {
            Some("take") => {
                self.advance();
                StepKind::Take {
                    item: self.expect_ident()?.to_string(),
                }
            }
            Some(choose @ ("choose" | "chooseleaf")) => {
                let leaf = choose == "chooseleaf";
                self.advance();
                let firstn = match self.peek_ident() {
                    Some("firstn") => true,
                    Some("indep") => false,
                    _ => return Err(self.error()),
                };
                self.advance();
                let n = self.expect_int()?;
                self.expect_keyword("type")?;
                let type_name = self.expect_ident()?.to_string();
                StepKind::Choose { leaf, firstn, n, type_name }
            }
            Some("emit") => {
                self.advance();
                StepKind::Emit
            }
            _ => return Err(self.error()),
        };
        Ok(StepDecl {
            kind,
            span: start..self.prev_end(),
        })
    }
}
