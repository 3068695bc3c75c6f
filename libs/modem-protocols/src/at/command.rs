//! AT command construction

use std::fmt::Write as _;

/// One AT command line plus the prefixes of its intermediate response lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtCommand {
    text: String,
    prefixes: Vec<String>,
}

impl AtCommand {
    /// Raw command text, without the trailing CR
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prefixes: Vec::new(),
        }
    }

    /// Accept lines starting with `prefix` as part of the response
    ///
    /// An empty prefix accepts every non-final line.
    pub fn expect(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Check whether `line` is an expected intermediate line
    pub fn accepts(&self, line: &str) -> bool {
        self.prefixes.iter().any(|p| line.starts_with(p.as_str()))
    }
}

/// Builder for extended-syntax commands (`AT+NAME=<p1>,<p2>`)
///
/// ```
/// use modem_protocols::at::CommandBuilder;
///
/// let cmd = CommandBuilder::set("+CGDCONT").int(3).string("IP").string("internet").build();
/// assert_eq!(cmd.text(), "AT+CGDCONT=3,\"IP\",\"internet\"");
/// ```
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    text: String,
    has_params: bool,
    prefixes: Vec<String>,
}

impl CommandBuilder {
    /// `AT<name>`
    pub fn execute(name: &str) -> Self {
        Self::with_text(format!("AT{}", name))
    }

    /// `AT<name>=<params>`
    pub fn set(name: &str) -> Self {
        Self::with_text(format!("AT{}=", name))
    }

    /// `AT<name>?`
    pub fn query(name: &str) -> Self {
        Self::with_text(format!("AT{}?", name)).expect(response_prefix(name))
    }

    /// `AT<name>=?`
    pub fn test(name: &str) -> Self {
        Self::with_text(format!("AT{}=?", name)).expect(response_prefix(name))
    }

    fn with_text(text: String) -> Self {
        Self {
            text,
            has_params: false,
            prefixes: Vec::new(),
        }
    }

    fn separator(&mut self) {
        if self.has_params {
            self.text.push(',');
        }
        self.has_params = true;
    }

    /// Append a numeric parameter
    pub fn int(mut self, value: i64) -> Self {
        self.separator();
        let _ = write!(self.text, "{}", value);
        self
    }

    /// Append a quoted string parameter
    ///
    /// Quotes and backslashes are written as `\22` and `\5C` escapes.
    pub fn string(mut self, value: &str) -> Self {
        self.separator();
        self.text.push('"');
        for c in value.chars() {
            match c {
                '"' => self.text.push_str("\\22"),
                '\\' => self.text.push_str("\\5C"),
                c => self.text.push(c),
            }
        }
        self.text.push('"');
        self
    }

    /// Append an omitted parameter (`AT+X=1,,3`)
    pub fn empty(mut self) -> Self {
        self.separator();
        self
    }

    /// Append an unquoted token as-is
    pub fn raw(mut self, token: &str) -> Self {
        self.separator();
        self.text.push_str(token);
        self
    }

    /// Expect intermediate lines starting with `prefix`
    pub fn expect(mut self, prefix: impl Into<String>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    /// Expect lines with the command's own `+NAME:` prefix
    pub fn expect_own(self) -> Self {
        let prefix = self
            .text
            .trim_start_matches("AT")
            .split(['=', '?'])
            .next()
            .map(response_prefix)
            .unwrap_or_default();
        self.expect(prefix)
    }

    pub fn build(self) -> AtCommand {
        AtCommand {
            text: self.text,
            prefixes: self.prefixes,
        }
    }
}

/// `+NAME` -> `+NAME:`
fn response_prefix(name: &str) -> String {
    format!("{}:", name)
}
