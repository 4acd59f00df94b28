//! Envelope address parsing.
//!
//! MAIL and RCPT carry a path such as `<user@example.com>`. The brackets are
//! mandatory and the enclosed text must be a single RFC 5322 `addr-spec`
//! (dot-atom or quoted local part, dot-atom or literal domain, comments and
//! folding whitespace allowed around the tokens).

use crate::types::Status;

/// Email address taken from an SMTP envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    addr: String,
    at: usize,
}

impl Address {
    /// Parses an angle-bracketed path parameter (`<local@domain>`).
    ///
    /// Returns the canonical address with the brackets removed, quoting
    /// resolved and comments discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Status::MALFORMED_ADDRESS`] if the brackets are missing or the
    /// enclosed text is not a single valid mailbox.
    pub fn parse_path(src: &str) -> Result<Self, Status> {
        let inner = src
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .ok_or(Status::MALFORMED_ADDRESS)?;
        Self::parse(inner)
    }

    /// Parses a bare `addr-spec` (`local@domain`).
    ///
    /// # Errors
    ///
    /// Returns [`Status::MALFORMED_ADDRESS`] if the text is not a single valid
    /// mailbox.
    pub fn parse(src: &str) -> Result<Self, Status> {
        let mut parser = Parser::new(src);
        let (local, domain) = parser.addr_spec().ok_or(Status::MALFORMED_ADDRESS)?;
        Ok(Self {
            at: local.len(),
            addr: format!("{local}@{domain}"),
        })
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.addr
    }

    /// Returns the part before the `@`.
    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.addr[..self.at]
    }

    /// Returns the part after the `@`.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.addr[self.at + 1..]
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.addr)
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.addr
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    const fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn addr_spec(&mut self) -> Option<(String, &'a str)> {
        self.skip_cfws()?;
        let local = if self.peek() == Some('"') {
            self.quoted_string()?
        } else {
            self.dot_atom()?.to_string()
        };
        if local.is_empty() {
            return None;
        }

        self.skip_cfws()?;
        if !self.eat('@') {
            return None;
        }
        self.skip_cfws()?;

        let domain = if self.peek() == Some('[') {
            self.domain_literal()?
        } else {
            self.dot_atom()?
        };
        self.skip_cfws()?;

        (self.pos == self.src.len()).then_some((local, domain))
    }

    fn dot_atom(&mut self) -> Option<&'a str> {
        let start = self.pos;
        while self.peek().is_some_and(|c| is_atext(c) || c == '.') {
            self.bump();
        }
        let src = self.src;
        let atom = &src[start..self.pos];
        let valid = !atom.is_empty()
            && !atom.starts_with('.')
            && !atom.ends_with('.')
            && !atom.contains("..");
        valid.then_some(atom)
    }

    fn quoted_string(&mut self) -> Option<String> {
        self.eat('"');
        let mut out = String::new();
        loop {
            match self.bump()? {
                '"' => return Some(out),
                '\\' => {
                    let c = self.bump()?;
                    if !(is_vchar(c) || is_wsp(c)) {
                        return None;
                    }
                    out.push(c);
                }
                c if is_vchar(c) || is_wsp(c) => out.push(c),
                _ => return None,
            }
        }
    }

    fn domain_literal(&mut self) -> Option<&'a str> {
        let start = self.pos;
        self.eat('[');
        loop {
            match self.bump()? {
                ']' => {
                    let src = self.src;
                    return Some(&src[start..self.pos]);
                }
                '[' | '\\' => return None,
                c if is_vchar(c) || is_wsp(c) => {}
                _ => return None,
            }
        }
    }

    /// Skips folding whitespace and (nested) comments. Fails on an
    /// unterminated comment.
    fn skip_cfws(&mut self) -> Option<()> {
        loop {
            match self.peek() {
                Some(c) if is_wsp(c) || c == '\r' || c == '\n' => {
                    self.bump();
                }
                Some('(') => self.comment()?,
                _ => return Some(()),
            }
        }
    }

    fn comment(&mut self) -> Option<()> {
        self.eat('(');
        let mut depth = 1usize;
        while depth > 0 {
            match self.bump()? {
                '(' => depth += 1,
                ')' => depth -= 1,
                '\\' => {
                    self.bump()?;
                }
                _ => {}
            }
        }
        Some(())
    }
}

const fn is_wsp(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Visible characters, including UTF-8 (RFC 6532).
const fn is_vchar(c: char) -> bool {
    ('!' <= c && c <= '~') || !c.is_ascii()
}

const fn is_atext(c: char) -> bool {
    match c {
        '(' | ')' | '<' | '>' | '[' | ']' | ':' | ';' | '@' | '\\' | ',' | '"' | '.' => false,
        _ => is_vchar(c),
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_path() {
        let addr = Address::parse_path("<foo@bar>").unwrap();
        assert_eq!(addr.as_str(), "foo@bar");
        assert_eq!(addr.local_part(), "foo");
        assert_eq!(addr.domain(), "bar");
    }

    #[test]
    fn test_missing_brackets() {
        assert_eq!(
            Address::parse_path("foo@bar").unwrap_err(),
            Status::MALFORMED_ADDRESS
        );
        assert!(Address::parse_path("<foo@bar").is_err());
        assert!(Address::parse_path("foo@bar>").is_err());
    }

    #[test]
    fn test_empty_path() {
        assert!(Address::parse_path("<>").is_err());
        assert!(Address::parse_path("").is_err());
    }

    #[test]
    fn test_dotted_local_part() {
        let addr = Address::parse_path("<first.last@mail.example.com>").unwrap();
        assert_eq!(addr.to_string(), "first.last@mail.example.com");
    }

    #[test]
    fn test_invalid_dots() {
        assert!(Address::parse_path("<.foo@bar>").is_err());
        assert!(Address::parse_path("<foo.@bar>").is_err());
        assert!(Address::parse_path("<fo..o@bar>").is_err());
        assert!(Address::parse_path("<foo@bar.>").is_err());
    }

    #[test]
    fn test_quoted_local_part() {
        let addr = Address::parse_path(r#"<"foo\"bar"@example.com>"#).unwrap();
        assert_eq!(addr.local_part(), "foo\"bar");
        assert_eq!(addr.domain(), "example.com");
    }

    #[test]
    fn test_unterminated_quote() {
        assert!(Address::parse_path(r#"<"foo@example.com>"#).is_err());
    }

    #[test]
    fn test_domain_literal() {
        let addr = Address::parse_path("<postmaster@[192.0.2.1]>").unwrap();
        assert_eq!(addr.domain(), "[192.0.2.1]");
    }

    #[test]
    fn test_comments_discarded() {
        let addr = Address::parse_path("<(sender)foo@bar(mx)>").unwrap();
        assert_eq!(addr.as_str(), "foo@bar");
        assert!(Address::parse_path("<(open foo@bar>").is_err());
    }

    #[test]
    fn test_missing_parts() {
        assert!(Address::parse_path("<@bar>").is_err());
        assert!(Address::parse_path("<foo@>").is_err());
        assert!(Address::parse_path("<foo>").is_err());
        assert!(Address::parse_path("<foo@bar@baz>").is_err());
    }

    #[test]
    fn test_specials_rejected() {
        assert!(Address::parse_path("<fo,o@bar>").is_err());
        assert!(Address::parse_path("<foo@b<a>r>").is_err());
        assert!(Address::parse_path("<<foo@bar>>").is_err());
    }

    #[test]
    fn test_utf8_address() {
        let addr = Address::parse_path("<用户@例子.广告>").unwrap();
        assert_eq!(addr.local_part(), "用户");
        assert_eq!(addr.domain(), "例子.广告");
    }

    #[test]
    fn test_bare_addr_spec() {
        assert_eq!(Address::parse("a@b").unwrap().as_str(), "a@b");
    }
}
