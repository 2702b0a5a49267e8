//! Field-text tokenizer.
//!
//! Produces a flat token stream with byte offsets so every later phase
//! can point diagnostics back into the source. Keywords are not
//! distinguished here; the parser matches identifiers case-insensitively.

use crate::error::{Diagnostic, GrammarError};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    /// Bare identifier, possibly namespaced (`constants.ttlpop`) and
    /// possibly with a leading `@` reference marker (stripped).
    Ident(String),
    /// `[name]` — brackets always denote a column reference.
    BracketedName(String),
    Number(f64),
    QuotedString(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// The identifier text, lowercased, if this is an identifier.
    pub fn ident_lower(&self) -> Option<String> {
        match &self.tok {
            Tok::Ident(s) => Some(s.to_lowercase()),
            _ => None,
        }
    }
}

pub fn tokenize(text: &str) -> Result<Vec<Token>, GrammarError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token { tok: Tok::LParen, start, end: i + 1 });
                i += 1;
            }
            ')' => {
                tokens.push(Token { tok: Tok::RParen, start, end: i + 1 });
                i += 1;
            }
            ',' => {
                tokens.push(Token { tok: Tok::Comma, start, end: i + 1 });
                i += 1;
            }
            '*' => {
                tokens.push(Token { tok: Tok::Star, start, end: i + 1 });
                i += 1;
            }
            '/' => {
                tokens.push(Token { tok: Tok::Slash, start, end: i + 1 });
                i += 1;
            }
            '=' => {
                tokens.push(Token { tok: Tok::Eq, start, end: i + 1 });
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { tok: Tok::NotEq, start, end: i + 2 });
                    i += 2;
                } else {
                    return Err(unexpected(text, i, "!"));
                }
            }
            '<' => match bytes.get(i + 1) {
                Some(b'=') => {
                    tokens.push(Token { tok: Tok::Lte, start, end: i + 2 });
                    i += 2;
                }
                Some(b'>') => {
                    tokens.push(Token { tok: Tok::NotEq, start, end: i + 2 });
                    i += 2;
                }
                _ => {
                    tokens.push(Token { tok: Tok::Lt, start, end: i + 1 });
                    i += 1;
                }
            },
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token { tok: Tok::Gte, start, end: i + 2 });
                    i += 2;
                } else {
                    tokens.push(Token { tok: Tok::Gt, start, end: i + 1 });
                    i += 1;
                }
            }
            '+' | '-' => {
                // A sign is part of a number literal when it cannot be a
                // binary operator: at expression start, after an
                // operator, a comma, or an opening paren.
                let is_sign_position = matches!(
                    tokens.last().map(|t| &t.tok),
                    None | Some(
                        Tok::Plus
                            | Tok::Minus
                            | Tok::Star
                            | Tok::Slash
                            | Tok::LParen
                            | Tok::Comma
                            | Tok::Eq
                            | Tok::NotEq
                            | Tok::Lt
                            | Tok::Lte
                            | Tok::Gt
                            | Tok::Gte
                    )
                );
                let next_is_digit = bytes
                    .get(i + 1)
                    .is_some_and(|b| b.is_ascii_digit() || *b == b'.');
                if is_sign_position && next_is_digit {
                    let (value, end) = lex_number(text, i + 1)?;
                    let value = if c == '-' { -value } else { value };
                    tokens.push(Token { tok: Tok::Number(value), start, end });
                    i = end;
                } else {
                    let tok = if c == '+' { Tok::Plus } else { Tok::Minus };
                    tokens.push(Token { tok, start, end: i + 1 });
                    i += 1;
                }
            }
            '"' => {
                let (value, end) = lex_string(text, i)?;
                tokens.push(Token { tok: Tok::QuotedString(value), start, end });
                i = end;
            }
            '[' => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j] != b']' {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(GrammarError::new(vec![Diagnostic::at(
                        "unterminated '[' in field",
                        text,
                        i,
                        200,
                    )]));
                }
                let name = text[i + 1..j].trim().to_string();
                tokens.push(Token {
                    tok: Tok::BracketedName(name),
                    start,
                    end: j + 1,
                });
                i = j + 1;
            }
            '@' => {
                // Reference marker: lex the following identifier and
                // keep the name without the marker.
                let (name, end) = lex_ident(text, i + 1);
                if name.is_empty() {
                    return Err(unexpected(text, i, "@"));
                }
                tokens.push(Token { tok: Tok::Ident(name), start, end });
                i = end;
            }
            _ if c.is_ascii_digit() || c == '.' => {
                let (value, end) = lex_number(text, i)?;
                tokens.push(Token { tok: Tok::Number(value), start, end });
                i = end;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let (name, end) = lex_ident(text, i);
                tokens.push(Token { tok: Tok::Ident(name), start, end });
                i = end;
            }
            _ => return Err(unexpected(text, i, &c.to_string())),
        }
    }

    Ok(tokens)
}

fn unexpected(text: &str, offset: usize, what: &str) -> GrammarError {
    GrammarError::new(vec![Diagnostic::at(
        format!("unexpected '{what}' in field"),
        text,
        offset,
        200,
    )])
}

/// Lex an identifier, allowing one namespace dot: `constants.ttlpop`.
fn lex_ident(text: &str, start: usize) -> (String, usize) {
    let bytes = text.as_bytes();
    let mut i = start;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
        i += 1;
    }
    // Namespace dot must be followed by another identifier character.
    if i < bytes.len()
        && bytes[i] == b'.'
        && bytes
            .get(i + 1)
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
    {
        i += 1;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
    }
    (text[start..i].to_string(), i)
}

fn lex_number(text: &str, start: usize) -> Result<(f64, usize), GrammarError> {
    let bytes = text.as_bytes();
    let mut i = start;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    text[start..i]
        .parse::<f64>()
        .map(|value| (value, i))
        .map_err(|_| unexpected(text, start, &text[start..i]))
}

fn lex_string(text: &str, start: usize) -> Result<(String, usize), GrammarError> {
    let bytes = text.as_bytes();
    let mut out = String::new();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((out, i + 1)),
            b'\\' if i + 1 < bytes.len() => {
                let escaped = bytes[i + 1] as char;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    other => out.push(other),
                }
                i += 2;
            }
            _ => {
                // Advance one full character, not one byte.
                let ch = text[i..].chars().next().unwrap();
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    Err(GrammarError::new(vec![Diagnostic::at(
        "unterminated string literal",
        text,
        start,
        200,
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(text: &str) -> Vec<Tok> {
        tokenize(text).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_basic_expression() {
        assert_eq!(
            toks("sum(score) / count(*)"),
            vec![
                Tok::Ident("sum".into()),
                Tok::LParen,
                Tok::Ident("score".into()),
                Tok::RParen,
                Tok::Slash,
                Tok::Ident("count".into()),
                Tok::LParen,
                Tok::Star,
                Tok::RParen,
            ]
        );
    }

    #[test]
    fn test_signed_numbers() {
        assert_eq!(toks("-5"), vec![Tok::Number(-5.0)]);
        assert_eq!(
            toks("a - 5"),
            vec![Tok::Ident("a".into()), Tok::Minus, Tok::Number(5.0)]
        );
        assert_eq!(
            toks("a * -5"),
            vec![Tok::Ident("a".into()), Tok::Star, Tok::Number(-5.0)]
        );
    }

    #[test]
    fn test_bracketed_and_namespaced_columns() {
        assert_eq!(
            toks("[total pop] + constants.ttlpop + @constants.ttlpop"),
            vec![
                Tok::BracketedName("total pop".into()),
                Tok::Plus,
                Tok::Ident("constants.ttlpop".into()),
                Tok::Plus,
                Tok::Ident("constants.ttlpop".into()),
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            toks(r#"state = "O\"Neil land""#),
            vec![
                Tok::Ident("state".into()),
                Tok::Eq,
                Tok::QuotedString("O\"Neil land".into()),
            ]
        );
    }

    #[test]
    fn test_comments_ignored() {
        assert_eq!(
            toks("age # the age column\n+ 1"),
            vec![Tok::Ident("age".into()), Tok::Plus, Tok::Number(1.0)]
        );
    }

    #[test]
    fn test_comparators() {
        assert_eq!(
            toks("a <> b <= c"),
            vec![
                Tok::Ident("a".into()),
                Tok::NotEq,
                Tok::Ident("b".into()),
                Tok::Lte,
                Tok::Ident("c".into()),
            ]
        );
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(tokenize("\"oops").is_err());
        assert!(tokenize("[oops").is_err());
    }

    #[test]
    fn test_offsets_track_source() {
        let tokens = tokenize("a + b").unwrap();
        assert_eq!(tokens[2].start, 4);
        assert_eq!(tokens[2].end, 5);
    }
}
