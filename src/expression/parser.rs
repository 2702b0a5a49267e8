//! Field-text parser.
//!
//! Precedence-climbing over the token stream, with identifier
//! resolution driven by the column catalog. Inputs the grammar's
//! error-catching rules would accept (unknown columns, mismatched
//! math, malformed IF arguments) still parse into a tree here — the
//! validator explains them with typed diagnostics. Only token-level
//! garbage fails to parse.

use std::collections::HashMap;

use super::ast::{
    BinOp, CmpOp, Expr, ExprNode, Spanned, is_aggregation_name, is_conversion_name,
    is_intelligent_offset, is_intelligent_unit,
};
use super::catalog::ColCollection;
use super::lexer::{Tok, Token, tokenize};
use crate::error::{Diagnostic, GrammarError};

/// A column resolution table owned by the compiled grammar.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCol {
    pub rule: String,
    pub name: String,
}

/// The per-catalog parser state cached process-wide under the grammar
/// hash.
#[derive(Debug)]
pub struct FieldParser {
    /// Lowercased field name → resolved column.
    fields: HashMap<String, ResolvedCol>,
}

impl FieldParser {
    pub fn new(cc: &ColCollection) -> FieldParser {
        let fields = cc
            .columns
            .iter()
            .map(|c| {
                (
                    c.field_name().to_lowercase(),
                    ResolvedCol {
                        rule: c.rule_name(),
                        name: c.field_name(),
                    },
                )
            })
            .collect();
        FieldParser { fields }
    }

    /// Parse a field text into a syntax tree.
    pub fn parse(&self, text: &str) -> Result<ExprNode, GrammarError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(GrammarError::message("Can't parse an empty field"));
        }
        let mut state = ParseState {
            text,
            tokens: &tokens,
            pos: 0,
            fields: &self.fields,
        };
        let expr = state.parse_or()?;
        if let Some(tok) = state.peek() {
            return Err(state.error_at(tok.start, "unexpected trailing input"));
        }
        Ok(expr)
    }
}

struct ParseState<'a> {
    text: &'a str,
    tokens: &'a [Token],
    pos: usize,
    fields: &'a HashMap<String, ResolvedCol>,
}

impl<'a> ParseState<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, ahead: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + ahead)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn error_at(&self, offset: usize, message: impl Into<String>) -> GrammarError {
        GrammarError::new(vec![Diagnostic::at(message, self.text, offset, 200)])
    }

    fn error_eof(&self, message: impl Into<String>) -> GrammarError {
        let offset = self.tokens.last().map(|t| t.end).unwrap_or(0);
        GrammarError::new(vec![Diagnostic::at(message, self.text, offset, 200)])
    }

    /// Does the next token match this keyword (case-insensitive)?
    fn peek_keyword(&self, word: &str) -> bool {
        self.peek_keyword_at(0, word)
    }

    fn peek_keyword_at(&self, ahead: usize, word: &str) -> bool {
        self.peek_at(ahead)
            .and_then(|t| t.ident_lower())
            .is_some_and(|w| w == word)
    }

    fn expect_keyword(&mut self, word: &str) -> Result<&'a Token, GrammarError> {
        if self.peek_keyword(word) {
            Ok(self.advance().unwrap())
        } else {
            match self.peek() {
                Some(tok) => Err(self.error_at(tok.start, format!("expected {}", word.to_uppercase()))),
                None => Err(self.error_eof(format!("expected {}", word.to_uppercase()))),
            }
        }
    }

    fn expect(&mut self, tok: &Tok, what: &str) -> Result<&'a Token, GrammarError> {
        match self.peek() {
            Some(t) if &t.tok == tok => Ok(self.advance().unwrap()),
            Some(t) => Err(self.error_at(t.start, format!("expected {what}"))),
            None => Err(self.error_eof(format!("expected {what}"))),
        }
    }

    // ---- precedence levels ----

    fn parse_or(&mut self) -> Result<ExprNode, GrammarError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.advance();
            let right = self.parse_and()?;
            let (start, end) = (left.start, right.end);
            left = Spanned::new(
                Expr::Or {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                start,
                end,
            );
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<ExprNode, GrammarError> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.advance();
            let right = self.parse_not()?;
            let (start, end) = (left.start, right.end);
            left = Spanned::new(
                Expr::And {
                    left: Box::new(left),
                    right: Box::new(right),
                },
                start,
                end,
            );
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<ExprNode, GrammarError> {
        if self.peek_keyword("not") && !self.peek_keyword_at(1, "in") {
            let start = self.advance().unwrap().start;
            let inner = self.parse_not()?;
            let end = inner.end;
            return Ok(Spanned::new(
                Expr::Not {
                    expr: Box::new(inner),
                },
                start,
                end,
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<ExprNode, GrammarError> {
        let left = self.parse_additive()?;

        if let Some(op) = self.peek_comparator() {
            self.advance();
            let right = self.parse_additive()?;
            let (start, end) = (left.start, right.end);
            return Ok(Spanned::new(
                Expr::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                start,
                end,
            ));
        }

        if self.peek_keyword("is") {
            return self.parse_is(left);
        }

        if self.peek_keyword("in") {
            self.advance();
            return self.parse_in(left, false);
        }
        if self.peek_keyword("not") && self.peek_keyword_at(1, "in") {
            self.advance();
            self.advance();
            return self.parse_in(left, true);
        }

        if self.peek_keyword("between") {
            self.advance();
            let low = self.parse_additive()?;
            self.expect_keyword("and")?;
            let high = self.parse_additive()?;
            let (start, end) = (left.start, high.end);
            return Ok(Spanned::new(
                Expr::Between {
                    expr: Box::new(left),
                    low: Box::new(low),
                    high: Box::new(high),
                },
                start,
                end,
            ));
        }

        if self.peek_keyword("like") || self.peek_keyword("ilike") {
            let case_insensitive = self.peek_keyword("ilike");
            self.advance();
            let pattern = self.parse_primary()?;
            let (start, end) = (left.start, pattern.end);
            return Ok(Spanned::new(
                Expr::Like {
                    expr: Box::new(left),
                    pattern: Box::new(pattern),
                    case_insensitive,
                },
                start,
                end,
            ));
        }

        Ok(left)
    }

    fn peek_comparator(&self) -> Option<CmpOp> {
        match self.peek().map(|t| &t.tok) {
            Some(Tok::Eq) => Some(CmpOp::Eq),
            Some(Tok::NotEq) => Some(CmpOp::Ne),
            Some(Tok::Lt) => Some(CmpOp::Lt),
            Some(Tok::Lte) => Some(CmpOp::Lte),
            Some(Tok::Gt) => Some(CmpOp::Gt),
            Some(Tok::Gte) => Some(CmpOp::Gte),
            _ => None,
        }
    }

    /// `IS NULL`, `IS NOT NULL`, or an intelligent date like
    /// `IS prior year`.
    fn parse_is(&mut self, left: ExprNode) -> Result<ExprNode, GrammarError> {
        let is_tok = self.advance().unwrap();
        let start = left.start;

        if self.peek_keyword("not") && self.peek_keyword_at(1, "null") {
            self.advance();
            let end = self.advance().unwrap().end;
            return Ok(Spanned::new(
                Expr::Compare {
                    op: CmpOp::IsNot,
                    left: Box::new(left),
                    right: Box::new(Spanned::new(Expr::Null, end, end)),
                },
                start,
                end,
            ));
        }
        if self.peek_keyword("null") {
            let end = self.advance().unwrap().end;
            return Ok(Spanned::new(
                Expr::Compare {
                    op: CmpOp::Is,
                    left: Box::new(left),
                    right: Box::new(Spanned::new(Expr::Null, end, end)),
                },
                start,
                end,
            ));
        }

        let offset = self
            .peek()
            .and_then(|t| t.ident_lower())
            .filter(|w| is_intelligent_offset(w));
        if let Some(offset) = offset {
            self.advance();
            let unit = self
                .peek()
                .and_then(|t| t.ident_lower())
                .filter(|w| is_intelligent_unit(w));
            if let Some(unit) = unit {
                let end = self.advance().unwrap().end;
                return Ok(Spanned::new(
                    Expr::IntelligentDate {
                        expr: Box::new(left),
                        offset,
                        unit,
                    },
                    start,
                    end,
                ));
            }
        }

        Err(self.error_at(
            is_tok.start,
            "IS must be followed by NULL, NOT NULL, or an intelligent date \
             like 'prior year'",
        ))
    }

    /// The parenthesized constant list of an IN expression. The grammar
    /// only admits string and number constants here.
    fn parse_in(&mut self, left: ExprNode, negated: bool) -> Result<ExprNode, GrammarError> {
        self.expect(&Tok::LParen, "'('")?;
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(Token { tok: Tok::RParen, .. }) => break,
                Some(Token {
                    tok: Tok::Number(n),
                    start,
                    end,
                }) => {
                    items.push(Spanned::new(Expr::Num(*n), *start, *end));
                    self.advance();
                }
                Some(Token {
                    tok: Tok::QuotedString(s),
                    start,
                    end,
                }) => {
                    items.push(Spanned::new(Expr::Str(s.clone()), *start, *end));
                    self.advance();
                }
                Some(tok) => {
                    return Err(
                        self.error_at(tok.start, "expected a string or number constant")
                    );
                }
                None => return Err(self.error_eof("expected ')'")),
            }
            if matches!(self.peek().map(|t| &t.tok), Some(Tok::Comma)) {
                self.advance();
            }
        }
        let end = self.expect(&Tok::RParen, "')'")?.end;
        let start = left.start;
        Ok(Spanned::new(
            Expr::In {
                expr: Box::new(left),
                negated,
                items,
            },
            start,
            end,
        ))
    }

    fn parse_additive(&mut self) -> Result<ExprNode, GrammarError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            let (start, end) = (left.start, right.end);
            left = Spanned::new(
                Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                start,
                end,
            );
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<ExprNode, GrammarError> {
        let mut left = self.parse_primary()?;
        loop {
            let op = match self.peek().map(|t| &t.tok) {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_primary()?;
            let (start, end) = (left.start, right.end);
            left = Spanned::new(
                Expr::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                start,
                end,
            );
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<ExprNode, GrammarError> {
        let tok = match self.peek() {
            Some(t) => t,
            None => return Err(self.error_eof("expected an expression")),
        };
        match &tok.tok {
            Tok::Number(n) => {
                let node = Spanned::new(Expr::Num(*n), tok.start, tok.end);
                self.advance();
                Ok(node)
            }
            Tok::QuotedString(s) => {
                let node = Spanned::new(Expr::Str(s.clone()), tok.start, tok.end);
                self.advance();
                Ok(node)
            }
            Tok::LParen => {
                let start = tok.start;
                self.advance();
                let inner = self.parse_or()?;
                let end = self.expect(&Tok::RParen, "')'")?.end;
                Ok(Spanned::new(Expr::Paren(Box::new(inner)), start, end))
            }
            Tok::BracketedName(name) => {
                let node = self.resolve_column(name, tok.start, tok.end);
                self.advance();
                Ok(node)
            }
            Tok::Ident(name) => {
                let lower = name.to_lowercase();
                match lower.as_str() {
                    "true" => {
                        let node = Spanned::new(Expr::Bool(true), tok.start, tok.end);
                        self.advance();
                        return Ok(node);
                    }
                    "false" => {
                        let node = Spanned::new(Expr::Bool(false), tok.start, tok.end);
                        self.advance();
                        return Ok(node);
                    }
                    "null" => {
                        let node = Spanned::new(Expr::Null, tok.start, tok.end);
                        self.advance();
                        return Ok(node);
                    }
                    _ => {}
                }

                let followed_by_paren =
                    matches!(self.peek_at(1).map(|t| &t.tok), Some(Tok::LParen));
                if followed_by_paren {
                    if lower == "if" {
                        return self.parse_if();
                    }
                    if is_aggregation_name(&lower) {
                        return self.parse_aggregation(&lower);
                    }
                    if is_conversion_name(&lower) {
                        return self.parse_conversion(&lower);
                    }
                    return Err(self.error_at(
                        tok.start,
                        format!("{name} is not a recognized function"),
                    ));
                }

                let node = self.resolve_column(name, tok.start, tok.end);
                self.advance();
                Ok(node)
            }
            _ => Err(self.error_at(tok.start, "expected an expression")),
        }
    }

    fn resolve_column(&self, name: &str, start: usize, end: usize) -> ExprNode {
        match self.fields.get(&name.to_lowercase()) {
            Some(resolved) => Spanned::new(
                Expr::Column {
                    rule: resolved.rule.clone(),
                    name: resolved.name.clone(),
                },
                start,
                end,
            ),
            None => Spanned::new(
                Expr::UnknownColumn {
                    name: name.to_string(),
                },
                start,
                end,
            ),
        }
    }

    fn parse_aggregation(&mut self, func: &str) -> Result<ExprNode, GrammarError> {
        let start = self.advance().unwrap().start;
        self.expect(&Tok::LParen, "'('")?;
        // count(*) is the only aggregation over star.
        let arg = if matches!(self.peek().map(|t| &t.tok), Some(Tok::Star)) {
            self.advance();
            None
        } else {
            Some(Box::new(self.parse_additive()?))
        };
        let end = self.expect(&Tok::RParen, "')'")?.end;
        // Canonicalize the avg alias.
        let func = if func == "average" { "avg" } else { func };
        Ok(Spanned::new(
            Expr::Aggregation {
                func: func.to_string(),
                arg,
            },
            start,
            end,
        ))
    }

    fn parse_conversion(&mut self, func: &str) -> Result<ExprNode, GrammarError> {
        let start = self.advance().unwrap().start;
        self.expect(&Tok::LParen, "'('")?;
        let mut args = Vec::new();
        if !matches!(self.peek().map(|t| &t.tok), Some(Tok::RParen)) {
            loop {
                args.push(self.parse_additive()?);
                if matches!(self.peek().map(|t| &t.tok), Some(Tok::Comma)) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        let end = self.expect(&Tok::RParen, "')'")?.end;
        Ok(Spanned::new(
            Expr::Conversion {
                func: func.to_string(),
                args,
            },
            start,
            end,
        ))
    }

    fn parse_if(&mut self) -> Result<ExprNode, GrammarError> {
        let start = self.advance().unwrap().start;
        self.expect(&Tok::LParen, "'('")?;
        let mut args = Vec::new();
        loop {
            if matches!(self.peek().map(|t| &t.tok), Some(Tok::RParen)) {
                break;
            }
            args.push(self.parse_or()?);
            if matches!(self.peek().map(|t| &t.tok), Some(Tok::Comma)) {
                self.advance();
            } else {
                break;
            }
        }
        let end = self.expect(&Tok::RParen, "')'")?.end;
        if args.is_empty() {
            return Err(self.error_at(start, "IF requires at least a condition and a value"));
        }
        Ok(Spanned::new(Expr::If { args }, start, end))
    }
}
