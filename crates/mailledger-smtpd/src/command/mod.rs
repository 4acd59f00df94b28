//! SMTP command parsing.

/// A command line received from the client.
///
/// Parsing is pure tokenization and never fails: a blank line yields an empty
/// verb, which the session rejects as not implemented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The original line, without its terminator.
    pub line: String,
    /// First field, upper-cased.
    pub verb: String,
    /// Whitespace-separated fields, verb included.
    pub fields: Vec<String>,
    /// The second field split on `:` (`FROM:<a@b>` gives `["FROM", "<a@b>"]`).
    pub params: Vec<String>,
}

impl Command {
    /// Parses a command line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        let verb = fields
            .first()
            .map(|verb| verb.to_ascii_uppercase())
            .unwrap_or_default();
        let params = fields
            .get(1)
            .map(|param| param.split(':').map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            line: line.to_string(),
            verb,
            fields,
            params,
        }
    }

    /// Returns the field at `index` (0 is the verb).
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Returns the value of a `KEY:value` parameter if the key matches.
    ///
    /// An empty value counts as missing.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        match self.params.as_slice() {
            [name, value, ..] if name.eq_ignore_ascii_case(key) && !value.is_empty() => {
                Some(value.as_str())
            }
            _ => None,
        }
    }
}

/// Verbs the session dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// AUTH - Authenticate
    Auth,
    /// DATA - Message content
    Data,
    /// EHLO - Extended greeting
    Ehlo,
    /// HELO - Simple greeting
    Helo,
    /// MAIL - Start mail transaction
    Mail,
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
    /// RCPT - Add recipient
    Rcpt,
    /// RSET - Reset transaction
    Rset,
    /// STARTTLS - Upgrade to TLS
    StartTls,
}

const VERBS: [(&str, Verb); 10] = [
    ("AUTH", Verb::Auth),
    ("DATA", Verb::Data),
    ("EHLO", Verb::Ehlo),
    ("HELO", Verb::Helo),
    ("MAIL", Verb::Mail),
    ("NOOP", Verb::Noop),
    ("QUIT", Verb::Quit),
    ("RCPT", Verb::Rcpt),
    ("RSET", Verb::Rset),
    ("STARTTLS", Verb::StartTls),
];

impl Verb {
    /// Looks up an upper-cased verb.
    #[must_use]
    pub fn lookup(verb: &str) -> Option<Self> {
        VERBS
            .iter()
            .find_map(|&(name, v)| (name == verb).then_some(v))
    }

    /// Returns the verb as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        VERBS
            .iter()
            .find_map(|&(name, v)| (v == self).then_some(name))
            .unwrap_or_default()
    }

    /// Returns true if the verb may be issued before HELO/EHLO.
    #[must_use]
    pub const fn allowed_before_greeting(self) -> bool {
        matches!(
            self,
            Self::Ehlo | Self::Helo | Self::Quit | Self::Noop | Self::StartTls | Self::Rset
        )
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
    use proptest::prelude::*;

    #[test]
    fn test_parse_mail_from() {
        let cmd = Command::parse("mail FROM:<a@b> SIZE=100");
        assert_eq!(cmd.verb, "MAIL");
        assert_eq!(cmd.fields, vec!["mail", "FROM:<a@b>", "SIZE=100"]);
        assert_eq!(cmd.params, vec!["FROM", "<a@b>"]);
        assert_eq!(cmd.param("from"), Some("<a@b>"));
        assert_eq!(cmd.param("TO"), None);
    }

    #[test]
    fn test_parse_empty_line() {
        let cmd = Command::parse("");
        assert_eq!(cmd.verb, "");
        assert!(cmd.fields.is_empty());
        assert!(cmd.params.is_empty());

        let cmd = Command::parse("   \t ");
        assert_eq!(cmd.verb, "");
    }

    #[test]
    fn test_parse_keeps_line() {
        let cmd = Command::parse("EHLO  client.example.com");
        assert_eq!(cmd.line, "EHLO  client.example.com");
        assert_eq!(cmd.field(1), Some("client.example.com"));
        assert_eq!(cmd.field(2), None);
    }

    #[test]
    fn test_param_empty_value() {
        let cmd = Command::parse("MAIL FROM:");
        assert_eq!(cmd.params, vec!["FROM", ""]);
        assert_eq!(cmd.param("FROM"), None);
    }

    #[test]
    fn test_param_without_colon() {
        let cmd = Command::parse("RCPT <a@b>");
        assert_eq!(cmd.params, vec!["<a@b>"]);
        assert_eq!(cmd.param("TO"), None);
    }

    #[test]
    fn test_verb_lookup() {
        assert_eq!(Verb::lookup("STARTTLS"), Some(Verb::StartTls));
        assert_eq!(Verb::lookup("RSET"), Some(Verb::Rset));
        assert_eq!(Verb::lookup("VRFY"), None);
        assert_eq!(Verb::lookup(""), None);
        assert_eq!(Verb::lookup("helo"), None);
    }

    #[test]
    fn test_verb_as_str() {
        for (name, verb) in VERBS {
            assert_eq!(verb.as_str(), name);
        }
    }

    #[test]
    fn test_allowed_before_greeting() {
        assert!(Verb::Ehlo.allowed_before_greeting());
        assert!(Verb::Quit.allowed_before_greeting());
        assert!(!Verb::Mail.allowed_before_greeting());
        assert!(!Verb::Auth.allowed_before_greeting());
    }

    proptest! {
        #[test]
        fn parse_is_total(line in "\\PC*") {
            let cmd = Command::parse(&line);
            prop_assert_eq!(cmd.line, line.clone());
            prop_assert_eq!(cmd.fields.len(), line.split_whitespace().count());
        }

        #[test]
        fn verb_is_uppercased_first_field(verb in "[a-zA-Z]{1,10}", arg in "[a-z:<>@.]{0,20}") {
            let cmd = Command::parse(&format!("{verb} {arg}"));
            prop_assert_eq!(cmd.verb, verb.to_ascii_uppercase());
            if !arg.is_empty() {
                prop_assert_eq!(cmd.params.join(":"), arg);
            }
        }
    }
}
