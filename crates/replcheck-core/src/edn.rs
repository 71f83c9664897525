//! Reader and printer for the EDN literals returned by the evaluation server.
//!
//! Covers the subset a test summary can contain: scalars, strings, keywords,
//! symbols, collections and tagged literals. Metadata and reader
//! conditionals are rejected.

use std::fmt;

use logos::Logos;
use thiserror::Error;

const MAX_NESTING_DEPTH: usize = 256;

/// Errors produced while reading an EDN literal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EdnError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unrecognized input '{text}' at byte {offset}")]
    InvalidToken { offset: usize, text: String },
    #[error("unexpected '{text}' at byte {offset}")]
    UnexpectedToken { offset: usize, text: String },
    #[error("invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("invalid escape in string literal '{0}'")]
    InvalidEscape(String),
    #[error("map literal has an odd number of forms")]
    OddMapForms,
    #[error("trailing input after literal at byte {0}")]
    TrailingInput(usize),
    #[error("nesting deeper than {MAX_NESTING_DEPTH} levels at byte {0}")]
    TooDeep(usize),
}

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n,]+")]
#[logos(skip r";[^\n]*")]
enum Token {
    #[token("(")]
    OpenList,
    #[token(")")]
    CloseList,
    #[token("[")]
    OpenVector,
    #[token("]")]
    CloseVector,
    #[token("{")]
    OpenMap,
    #[token("}")]
    CloseMap,
    #[token("#{")]
    OpenSet,
    #[token("#_")]
    Discard,
    #[token("'")]
    Quote,

    #[regex(r#""([^"\\]|\\.)*""#)]
    String,

    #[regex(r"\\(newline|space|tab|return|formfeed|backspace|u[0-9a-fA-F]{4}|[^\s])")]
    Char,

    #[regex(r"[+-]?[0-9]+N?")]
    Integer,

    #[regex(r"[+-]?[0-9]+(\.[0-9]*([eE][+-]?[0-9]+)?|[eE][+-]?[0-9]+)M?")]
    Float,

    #[regex(r"[+-]?[0-9]+/[0-9]+")]
    Ratio,

    #[regex(r#":[^\s,()\[\]{}"\\;^@`~]+"#)]
    Keyword,

    #[regex(r#"#[a-zA-Z][^\s,()\[\]{}"\\;^@`~]*"#)]
    Tag,

    #[regex(r#"[a-zA-Z*!_?<>=/.$%&|][^\s,()\[\]{}"\\;^@`~]*"#)]
    #[regex(r#"[+\-]([^\s,()\[\]{}"\\;^@`~0-9][^\s,()\[\]{}"\\;^@`~]*)?"#)]
    Symbol,
}

/// A decoded EDN value. Maps keep their source order.
#[derive(Debug, Clone, PartialEq)]
pub enum EdnValue {
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Char(char),
    Keyword(String),
    Symbol(String),
    List(Vec<EdnValue>),
    Vector(Vec<EdnValue>),
    Set(Vec<EdnValue>),
    Map(Vec<(EdnValue, EdnValue)>),
    Tagged(String, Box<EdnValue>),
}

impl EdnValue {
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Float(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    /// Looks up `:name` in a map value. Returns `None` for non-maps.
    pub fn get(&self, name: &str) -> Option<&EdnValue> {
        let Self::Map(entries) = self else {
            return None;
        };
        entries.iter().find_map(|(key, value)| match key {
            Self::Keyword(keyword) if keyword == name => Some(value),
            _ => None,
        })
    }

    /// Sequential contents of a list, vector or set.
    pub fn as_items(&self) -> Option<&[EdnValue]> {
        match self {
            Self::List(items) | Self::Vector(items) | Self::Set(items) => Some(items),
            _ => None,
        }
    }

    /// Renders strings bare and everything else in reader form.
    pub fn to_display_text(&self) -> String {
        match self {
            Self::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

fn write_items(f: &mut fmt::Formatter<'_>, items: &[EdnValue]) -> fmt::Result {
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn write_escaped_string(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    f.write_str("\"")?;
    for ch in text.chars() {
        match ch {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            '\r' => f.write_str("\\r")?,
            other => write!(f, "{other}")?,
        }
    }
    f.write_str("\"")
}

impl fmt::Display for EdnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("nil"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) if value.fract() == 0.0 && value.is_finite() => {
                write!(f, "{value:.1}")
            }
            Self::Float(value) => write!(f, "{value}"),
            Self::String(text) => write_escaped_string(f, text),
            Self::Char(ch) => match ch {
                '\n' => f.write_str("\\newline"),
                ' ' => f.write_str("\\space"),
                '\t' => f.write_str("\\tab"),
                other => write!(f, "\\{other}"),
            },
            Self::Keyword(name) => write!(f, ":{name}"),
            Self::Symbol(name) => f.write_str(name),
            Self::List(items) => {
                f.write_str("(")?;
                write_items(f, items)?;
                f.write_str(")")
            }
            Self::Vector(items) => {
                f.write_str("[")?;
                write_items(f, items)?;
                f.write_str("]")
            }
            Self::Set(items) => {
                f.write_str("#{")?;
                write_items(f, items)?;
                f.write_str("}")
            }
            Self::Map(entries) => {
                f.write_str("{")?;
                for (index, (key, value)) in entries.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key} {value}")?;
                }
                f.write_str("}")
            }
            Self::Tagged(tag, value) => write!(f, "#{tag} {value}"),
        }
    }
}

struct Parser<'src> {
    tokens: Vec<(Token, &'src str, usize)>,
    position: usize,
}

impl<'src> Parser<'src> {
    fn tokenize(input: &'src str) -> Result<Self, EdnError> {
        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(input).spanned() {
            let text = &input[span.clone()];
            match token {
                Ok(token) => tokens.push((token, text, span.start)),
                Err(()) => {
                    return Err(EdnError::InvalidToken {
                        offset: span.start,
                        text: text.to_string(),
                    })
                }
            }
        }
        Ok(Self {
            tokens,
            position: 0,
        })
    }

    fn next(&mut self) -> Option<(Token, &'src str, usize)> {
        let token = self.tokens.get(self.position).copied();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).map(|(token, _, _)| *token)
    }

    fn parse_value(&mut self, depth: usize) -> Result<EdnValue, EdnError> {
        let (token, text, offset) = self.next().ok_or(EdnError::UnexpectedEof)?;
        if depth > MAX_NESTING_DEPTH {
            return Err(EdnError::TooDeep(offset));
        }
        match token {
            Token::OpenList => Ok(EdnValue::List(self.parse_until(Token::CloseList, depth)?)),
            Token::OpenVector => Ok(EdnValue::Vector(
                self.parse_until(Token::CloseVector, depth)?,
            )),
            Token::OpenSet => Ok(EdnValue::Set(self.parse_until(Token::CloseMap, depth)?)),
            Token::OpenMap => {
                let forms = self.parse_until(Token::CloseMap, depth)?;
                if forms.len() % 2 != 0 {
                    return Err(EdnError::OddMapForms);
                }
                let mut entries = Vec::with_capacity(forms.len() / 2);
                let mut forms = forms.into_iter();
                while let (Some(key), Some(value)) = (forms.next(), forms.next()) {
                    entries.push((key, value));
                }
                Ok(EdnValue::Map(entries))
            }
            Token::Discard => {
                self.parse_value(depth + 1)?;
                self.parse_value(depth + 1)
            }
            Token::Quote => Ok(EdnValue::List(vec![
                EdnValue::Symbol("quote".to_string()),
                self.parse_value(depth + 1)?,
            ])),
            Token::String => Ok(EdnValue::String(unescape_string(text)?)),
            Token::Char => Ok(EdnValue::Char(parse_char(text)?)),
            Token::Integer => text
                .trim_end_matches('N')
                .parse::<i64>()
                .map(EdnValue::Integer)
                .map_err(|_| EdnError::InvalidNumber(text.to_string())),
            Token::Float => text
                .trim_end_matches('M')
                .parse::<f64>()
                .map(EdnValue::Float)
                .map_err(|_| EdnError::InvalidNumber(text.to_string())),
            Token::Ratio => parse_ratio(text),
            Token::Keyword => Ok(EdnValue::Keyword(text[1..].to_string())),
            Token::Tag => {
                let tagged = self.parse_value(depth + 1)?;
                Ok(EdnValue::Tagged(text[1..].to_string(), Box::new(tagged)))
            }
            Token::Symbol => Ok(match text {
                "nil" => EdnValue::Nil,
                "true" => EdnValue::Bool(true),
                "false" => EdnValue::Bool(false),
                symbol => EdnValue::Symbol(symbol.to_string()),
            }),
            Token::CloseList | Token::CloseVector | Token::CloseMap => {
                Err(EdnError::UnexpectedToken {
                    offset,
                    text: text.to_string(),
                })
            }
        }
    }

    fn parse_until(&mut self, close: Token, depth: usize) -> Result<Vec<EdnValue>, EdnError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => return Err(EdnError::UnexpectedEof),
                Some(token) if token == close => {
                    self.position += 1;
                    return Ok(items);
                }
                Some(Token::Discard) => {
                    self.position += 1;
                    self.parse_value(depth + 1)?;
                }
                Some(_) => items.push(self.parse_value(depth + 1)?),
            }
        }
    }
}

fn unescape_string(raw: &str) -> Result<String, EdnError> {
    let body = &raw[1..raw.len() - 1];
    let mut decoded = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            decoded.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => decoded.push('\n'),
            Some('t') => decoded.push('\t'),
            Some('r') => decoded.push('\r'),
            Some('b') => decoded.push('\u{8}'),
            Some('f') => decoded.push('\u{c}'),
            Some('"') => decoded.push('"'),
            Some('\\') => decoded.push('\\'),
            Some('u') => {
                let hex = chars.by_ref().take(4).collect::<String>();
                let code = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| EdnError::InvalidEscape(raw.to_string()))?;
                decoded.push(code);
            }
            _ => return Err(EdnError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(decoded)
}

fn parse_char(raw: &str) -> Result<char, EdnError> {
    let name = &raw[1..];
    match name {
        "newline" => Ok('\n'),
        "space" => Ok(' '),
        "tab" => Ok('\t'),
        "return" => Ok('\r'),
        "formfeed" => Ok('\u{c}'),
        "backspace" => Ok('\u{8}'),
        _ if name.len() == 5 && name.starts_with('u') => u32::from_str_radix(&name[1..], 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| EdnError::InvalidEscape(raw.to_string())),
        _ => name
            .chars()
            .next()
            .ok_or_else(|| EdnError::InvalidEscape(raw.to_string())),
    }
}

fn parse_ratio(raw: &str) -> Result<EdnValue, EdnError> {
    let invalid = || EdnError::InvalidNumber(raw.to_string());
    let (numerator, denominator) = raw.split_once('/').ok_or_else(invalid)?;
    let numerator = numerator.parse::<f64>().map_err(|_| invalid())?;
    let denominator = denominator.parse::<f64>().map_err(|_| invalid())?;
    if denominator == 0.0 {
        return Err(invalid());
    }
    Ok(EdnValue::Float(numerator / denominator))
}

/// Reads exactly one EDN form from `input`.
pub fn parse_edn(input: &str) -> Result<EdnValue, EdnError> {
    let mut parser = Parser::tokenize(input)?;
    let value = parser.parse_value(0)?;
    if let Some((_, _, offset)) = parser.next() {
        return Err(EdnError::TrailingInput(offset));
    }
    Ok(value)
}
