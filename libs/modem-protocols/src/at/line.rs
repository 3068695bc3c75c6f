//! Response line access and parameter parsing

use std::fmt;

/// One decoded AT line, terminators stripped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtLine(String);

impl AtLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// `+CGEV` for `+CGEV: NW DEACT`; `None` for lines without a `:`
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(prefix, _)| prefix)
    }

    /// Parameters after the first `:`, or of the whole line if there is none
    pub fn params(&self) -> AtParams<'_> {
        let rest = match self.0.split_once(':') {
            Some((_, rest)) => rest,
            None => self.0.as_str(),
        };
        AtParams::new(rest)
    }

    /// Parameters after `prefix`, if the line starts with it
    pub fn params_after(&self, prefix: &str) -> Option<AtParams<'_>> {
        self.0.strip_prefix(prefix).map(AtParams::new)
    }
}

impl fmt::Display for AtLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AtLine {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

/// One comma-separated response parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtValue {
    /// Decimal integer
    Int(i64),
    /// Quoted string with `\HH` escapes resolved
    Str(String),
    /// `(lo-hi)` range as returned by test commands
    Range(i64, i64),
    /// Parenthesized list such as `(1,3,5)` or `("IP","IPV6")`
    List(Vec<AtValue>),
    /// Omitted parameter
    Empty,
    /// Unquoted token that is not a number
    Token(String),
}

impl AtValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AtValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String content of quoted strings and bare tokens
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AtValue::Str(s) | AtValue::Token(s) => Some(s),
            _ => None,
        }
    }
}

/// Iterator over the parameters of a response line
#[derive(Debug, Clone)]
pub struct AtParams<'a> {
    rest: &'a str,
    done: bool,
}

impl<'a> AtParams<'a> {
    fn new(text: &'a str) -> Self {
        let rest = text.trim();
        Self {
            rest,
            done: rest.is_empty(),
        }
    }

    /// Next parameter as an integer; `None` if missing or not numeric
    pub fn next_int(&mut self) -> Option<i64> {
        self.next().and_then(|v| v.as_int())
    }

    /// Next parameter as text; `None` if missing, empty or not textual
    pub fn next_string(&mut self) -> Option<String> {
        match self.next()? {
            AtValue::Str(s) | AtValue::Token(s) => Some(s),
            _ => None,
        }
    }

    /// Skip `count` parameters
    pub fn skip_params(&mut self, count: usize) -> &mut Self {
        for _ in 0..count {
            if self.next().is_none() {
                break;
            }
        }
        self
    }
}

impl Iterator for AtParams<'_> {
    type Item = AtValue;

    fn next(&mut self) -> Option<AtValue> {
        if self.done {
            return None;
        }
        let end = token_end(self.rest);
        let token = self.rest[..end].trim();
        match self.rest[end..].strip_prefix(',') {
            Some(rest) => self.rest = rest,
            None => {
                self.rest = "";
                self.done = true;
            },
        }
        Some(parse_value(token))
    }
}

/// Byte index of the first top-level comma, or the end of the text
fn token_end(text: &str) -> usize {
    let mut quoted = false;
    let mut depth = 0usize;
    for (index, c) in text.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => return index,
            _ => {},
        }
    }
    text.len()
}

fn parse_value(token: &str) -> AtValue {
    if token.is_empty() {
        return AtValue::Empty;
    }
    if let Some(inner) = token.strip_prefix('"') {
        return AtValue::Str(unescape(inner.strip_suffix('"').unwrap_or(inner)));
    }
    if let Some(inner) = token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        if let Some((lo, hi)) = inner.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.trim().parse(), hi.trim().parse()) {
                return AtValue::Range(lo, hi);
            }
        }
        return AtValue::List(AtParams::new(inner).collect());
    }
    match token.parse::<i64>() {
        Ok(v) => AtValue::Int(v),
        Err(_) => AtValue::Token(token.to_string()),
    }
}

/// Resolve `\HH` hex escapes
fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let hex: String = chars.clone().take(2).collect();
        match u8::from_str_radix(&hex, 16) {
            Ok(byte) if hex.len() == 2 => {
                out.push(char::from(byte));
                chars.nth(1);
            },
            _ => out.push('\\'),
        }
    }
    out
}
