//! MAIL FROM / RCPT TO address parsing
//!
//! The grammar is the RFC 2821 path: `<[source-route:]local[@domain]>`
//! followed by optional space separated `KEY=VALUE` parameters. Parsing is
//! a single forward scan and never fails loudly; a malformed path produces
//! an [`Address`] with `is_valid() == false`.

use crate::lmtp::reply::Reply;
use std::collections::BTreeMap;
use std::fmt;

/// Parameters accepted on MAIL FROM
pub const MAIL_PARAMETERS: &[&str] = &["BODY", "SIZE"];

/// Parameters accepted on RCPT TO
pub const RCPT_PARAMETERS: &[&str] = &[];

/// A parsed sender or recipient
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    local_part: String,
    domain: String,
    normalized_local_part: String,
    valid: bool,
    parameters: BTreeMap<String, String>,
    delivery_status: Option<Reply>,
    on_local_server: bool,
    remote_server: Option<String>,
    skip_filters: bool,
    folder: Option<String>,
    flags: Option<String>,
    tags: Vec<String>,
}

impl Address {
    /// Parse a path argument, accepting only the `allowed` parameter keys
    pub fn parse(input: &str, allowed: &[&str], delimiter: Option<char>) -> Self {
        match Scanner::new(input).path(allowed) {
            Some((local_part, domain, parameters)) => {
                let normalized_local_part = normalize(&local_part, delimiter);
                Self {
                    local_part,
                    domain,
                    normalized_local_part,
                    valid: true,
                    parameters,
                    ..Default::default()
                }
            }
            None => Self::default(),
        }
    }

    /// Valid address built from an already split email address
    pub fn from_email(email: &str, delimiter: Option<char>) -> Self {
        let (local, domain) = match email.rsplit_once('@') {
            Some((l, d)) => (l.to_string(), d.to_string()),
            None => (email.to_string(), String::new()),
        };
        Self {
            normalized_local_part: normalize(&local, delimiter),
            local_part: local,
            domain,
            valid: !email.is_empty(),
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The null path `<>`
    pub fn is_null(&self) -> bool {
        self.valid && self.local_part.is_empty() && self.domain.is_empty()
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn normalized_local_part(&self) -> &str {
        &self.normalized_local_part
    }

    /// `normalized-local@domain`, used for every mailbox lookup
    pub fn email_address(&self) -> String {
        if self.domain.is_empty() {
            self.normalized_local_part.clone()
        } else {
            format!("{}@{}", self.normalized_local_part, self.domain)
        }
    }

    /// Parameter value by upper-case key
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters
            .get(&key.to_ascii_uppercase())
            .map(String::as_str)
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn delivery_status(&self) -> Option<Reply> {
        self.delivery_status
    }

    pub fn set_delivery_status(&mut self, reply: Reply) {
        self.delivery_status = Some(reply);
    }

    pub fn on_local_server(&self) -> bool {
        self.on_local_server
    }

    pub fn remote_server(&self) -> Option<&str> {
        self.remote_server.as_deref()
    }

    /// Route to this node
    pub fn set_local(&mut self) {
        self.on_local_server = true;
        self.remote_server = None;
    }

    /// Route to another node
    pub fn set_remote(&mut self, server: impl Into<String>) {
        self.on_local_server = false;
        self.remote_server = Some(server.into());
    }

    pub fn skip_filters(&self) -> bool {
        self.skip_filters
    }

    pub fn folder(&self) -> Option<&str> {
        self.folder.as_deref()
    }

    pub fn flags(&self) -> Option<&str> {
        self.flags.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Deposit without running filters, with explicit folder, flags and tags
    pub fn set_filter_override(
        &mut self,
        folder: Option<String>,
        flags: Option<String>,
        tags: Vec<String>,
    ) {
        self.skip_filters = true;
        self.folder = folder;
        self.flags = flags;
        self.tags = tags;
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            write!(f, "<{}>", self.local_part)
        } else {
            write!(f, "<{}@{}>", self.local_part, self.domain)
        }
    }
}

fn normalize(local: &str, delimiter: Option<char>) -> String {
    match delimiter.and_then(|d| local.find(d)) {
        Some(idx) if idx > 0 => local[..idx].to_string(),
        _ => local.to_string(),
    }
}

fn is_special(c: char) -> bool {
    c.is_control() || matches!(c, '<' | '>' | '(' | ')' | '[' | ']' | '\\' | ',' | ';' | ':' | '"' | ' ')
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

type Path = (String, String, BTreeMap<String, String>);

impl Scanner {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip(&mut self, expected: char) -> Option<()> {
        (self.next()? == expected).then_some(())
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn path(mut self, allowed: &[&str]) -> Option<Path> {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.skip('<')?;

        if self.peek() == Some('@') {
            self.source_route()?;
        }

        let local = if self.peek() == Some('"') {
            self.quoted_string()?
        } else {
            self.dot_string()?
        };

        let domain = if self.peek() == Some('@') {
            self.pos += 1;
            self.domain()?
        } else {
            String::new()
        };

        self.skip('>')?;
        let parameters = self.parameters(allowed)?;
        Some((local, domain, parameters))
    }

    /// `@host,@host:` prefix, validated and dropped
    fn source_route(&mut self) -> Option<()> {
        loop {
            self.skip('@')?;
            self.domain()?;
            match self.next()? {
                ',' => continue,
                ':' => return Some(()),
                _ => return None,
            }
        }
    }

    fn quoted_string(&mut self) -> Option<String> {
        self.skip('"')?;
        let mut out = String::new();
        loop {
            match self.next()? {
                '"' => return Some(out),
                '\\' => {
                    let escaped = self.next()?;
                    if escaped == '\r' || escaped == '\n' {
                        return None;
                    }
                    out.push(escaped);
                }
                c if c == '\r' || c == '\n' => return None,
                c => out.push(c),
            }
        }
    }

    fn dot_string(&mut self) -> Option<String> {
        let mut out = String::new();
        loop {
            match self.peek()? {
                '@' | '>' => return Some(out),
                c if is_special(c) => return None,
                c => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn domain(&mut self) -> Option<String> {
        let mut out = String::new();
        if self.peek() == Some('[') {
            self.pos += 1;
            out.push('[');
            loop {
                match self.next()? {
                    ']' => break,
                    c if c.is_ascii_digit() || c == '.' => out.push(c),
                    _ => return None,
                }
            }
            out.push(']');
            return (out.len() > 2).then_some(out);
        }

        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                out.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        (!out.is_empty()).then_some(out)
    }

    fn parameters(&mut self, allowed: &[&str]) -> Option<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        if self.at_end() {
            return Some(params);
        }
        self.skip(' ')?;

        while !self.at_end() {
            let mut key = String::new();
            while let Some(c) = self.peek() {
                if c.is_ascii_alphanumeric() || c == '-' {
                    key.push(c.to_ascii_uppercase());
                    self.pos += 1;
                } else {
                    break;
                }
            }
            if key.is_empty() || !allowed.iter().any(|a| a.eq_ignore_ascii_case(&key)) {
                return None;
            }
            self.skip('=')?;

            let mut value = String::new();
            while let Some(c) = self.peek() {
                if c == ' ' {
                    break;
                }
                if c.is_control() || c == '=' {
                    return None;
                }
                value.push(c);
                self.pos += 1;
            }
            if value.is_empty() {
                return None;
            }
            params.insert(key, value);

            if !self.at_end() {
                self.skip(' ')?;
            }
        }
        Some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rcpt(s: &str) -> Address {
        Address::parse(s, RCPT_PARAMETERS, Some('+'))
    }

    #[test]
    fn test_simple_address() {
        let addr = rcpt("<user@example.com>");
        assert!(addr.is_valid());
        assert_eq!(addr.local_part(), "user");
        assert_eq!(addr.domain(), "example.com");
        assert_eq!(addr.email_address(), "user@example.com");
        assert_eq!(addr.to_string(), "<user@example.com>");
    }

    #[test]
    fn test_round_trip() {
        for input in ["a@b", "first.last@mail-1.example.org", "x_y=z@[10.0.0.1]"] {
            let addr = Address::parse(&format!("<{}>", input), &[], None);
            assert!(addr.is_valid(), "{}", input);
            assert_eq!(format!("{}@{}", addr.local_part(), addr.domain()), input);
        }
    }

    #[test]
    fn test_leading_whitespace_and_null_sender() {
        let addr = Address::parse("  <>", MAIL_PARAMETERS, None);
        assert!(addr.is_valid());
        assert!(addr.is_null());
        assert_eq!(addr.email_address(), "");
    }

    #[test]
    fn test_source_route_dropped() {
        let addr = rcpt("<@relay1.example,@[192.168.1.1]:user@example.com>");
        assert!(addr.is_valid());
        assert_eq!(addr.email_address(), "user@example.com");

        assert!(!rcpt("<@relay1.example user@example.com>").is_valid());
        assert!(!rcpt("<@:user@example.com>").is_valid());
    }

    #[test]
    fn test_quoted_local_part() {
        let addr = rcpt(r#"<"john \"jr\" doe"@example.com>"#);
        assert!(addr.is_valid());
        assert_eq!(addr.local_part(), r#"john "jr" doe"#);

        assert!(!rcpt(r#"<"unterminated@example.com>"#).is_valid());
        assert!(!rcpt(r#"<"bad escape\"#).is_valid());
    }

    #[test]
    fn test_invalid_inputs() {
        for input in [
            "",
            "user@example.com",
            "<user@example.com",
            "<us(er@example.com>",
            "<user@exa_mple.com>",
            "<user@>",
            "<user@[10.0.a.1]>",
            "<us er@example.com>",
            "<user\u{7}@example.com>",
        ] {
            assert!(!rcpt(input).is_valid(), "{:?}", input);
        }
    }

    #[test]
    fn test_recipient_delimiter_normalization() {
        let addr = rcpt("<user+tag@example.com>");
        assert_eq!(addr.local_part(), "user+tag");
        assert_eq!(addr.email_address(), "user@example.com");

        let addr = rcpt("<+user@example.com>");
        assert_eq!(addr.email_address(), "+user@example.com");

        let addr = Address::parse("<user+tag@example.com>", &[], None);
        assert_eq!(addr.email_address(), "user+tag@example.com");
    }

    #[test]
    fn test_parameters() {
        let addr = Address::parse("<a@b.c> body=8BITMIME SIZE=1024", MAIL_PARAMETERS, None);
        assert!(addr.is_valid());
        assert_eq!(addr.parameter("BODY"), Some("8BITMIME"));
        assert_eq!(addr.parameter("size"), Some("1024"));

        assert!(!Address::parse("<a@b.c> AUTH=x", MAIL_PARAMETERS, None).is_valid());
        assert!(!Address::parse("<a@b.c>  BODY=7BIT", MAIL_PARAMETERS, None).is_valid());
        assert!(!Address::parse("<a@b.c>BODY=7BIT", MAIL_PARAMETERS, None).is_valid());
        assert!(!Address::parse("<a@b.c> BODY", MAIL_PARAMETERS, None).is_valid());
        assert!(!rcpt("<a@b.c> BODY=7BIT").is_valid());
    }

    #[test]
    fn test_routing_fields() {
        let mut addr = rcpt("<a@b.c>");
        assert!(!addr.on_local_server());
        addr.set_remote("mbs2");
        assert_eq!(addr.remote_server(), Some("mbs2"));
        addr.set_local();
        assert!(addr.on_local_server());
        assert_eq!(addr.remote_server(), None);
    }
}
