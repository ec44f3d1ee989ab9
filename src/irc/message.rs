//! IRC message grammar — RFC 2812 parse/serialize plus the command and
//! numeric vocabulary the bridge speaks.
//!
//! A message is `[:prefix SPACE] command [SPACE params] [SPACE :trailing]`,
//! CR-LF terminated on the wire. Parsing operates on the line without the
//! terminator; the codec owns framing.

use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional prefix (server name or `nick!user@host`).
    pub prefix: Option<String>,
    /// The command (e.g. `PRIVMSG`, `433`, `NICK`).
    pub command: String,
    /// Parameters — the last may have been a trailing param (with spaces).
    pub params: Vec<String>,
}

/// Errors that can occur during message parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
}

/// CTCP delimiter byte, as a char.
const CTCP_DELIM: char = '\u{1}';

impl Message {
    /// Build a prefix-less command message.
    pub fn cmd<S: Into<String>>(command: S, params: Vec<String>) -> Self {
        Message {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Parse a single IRC message from a line (without the trailing `\r\n`).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let input = input.trim_end_matches("\r\n");

        if input.is_empty() {
            return Err(ParseError::Empty);
        }

        let (prefix, rest) = if let Some(stripped) = input.strip_prefix(':') {
            // Prefix runs until the first space.
            match stripped.find(' ') {
                Some(idx) => (Some(stripped[..idx].to_owned()), &stripped[idx + 1..]),
                None => return Err(ParseError::MissingCommand),
            }
        } else {
            (None, input)
        };

        // Split into command and parameter portion.
        let (command, param_str) = match rest.find(' ') {
            Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
            None => (rest, None),
        };

        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();

        if let Some(mut remaining) = param_str {
            while !remaining.is_empty() {
                if let Some(trailing) = remaining.strip_prefix(':') {
                    // Trailing parameter: everything after the colon, spaces included.
                    params.push(trailing.to_owned());
                    break;
                }
                match remaining.find(' ') {
                    Some(idx) => {
                        params.push(remaining[..idx].to_owned());
                        remaining = &remaining[idx + 1..];
                    }
                    None => {
                        params.push(remaining.to_owned());
                        break;
                    }
                }
            }
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to the IRC wire format (without trailing `\r\n`).
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(ref prefix) = self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if !self.params.is_empty() {
            let last_idx = self.params.len() - 1;
            for (i, param) in self.params.iter().enumerate() {
                out.push(' ');
                if i == last_idx {
                    // Always `:`-prefix the last parameter. Valid per RFC 2812
                    // and sidesteps empty/space-containing edge cases.
                    out.push(':');
                }
                out.push_str(param);
            }
        }

        out
    }

    /// The nick portion of this message's prefix, if any.
    ///
    /// `wings!user@host` → `wings`; a bare server prefix is returned whole.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split('!').next().unwrap_or(p))
    }

    /// Whether this message is a CTCP ACTION (`/me`) privmsg; returns the
    /// action text when it is.
    pub fn ctcp_action_text(&self) -> Option<&str> {
        if self.command != "PRIVMSG" {
            return None;
        }
        let body = self.params.get(1)?;
        body.strip_prefix(CTCP_DELIM)?
            .strip_suffix(CTCP_DELIM)?
            .strip_prefix("ACTION ")
    }

    // -- Command builders for the vocabulary of the bridge -------------------

    pub fn nick(nick: &str) -> Self {
        Self::cmd("NICK", vec![nick.to_owned()])
    }

    pub fn user(username: &str, realname: &str) -> Self {
        Self::cmd(
            "USER",
            vec![
                username.to_owned(),
                "0".into(),
                "*".into(),
                realname.to_owned(),
            ],
        )
    }

    pub fn pass(password: &str) -> Self {
        Self::cmd("PASS", vec![password.to_owned()])
    }

    pub fn join(channel: &str, key: Option<&str>) -> Self {
        let mut params = vec![channel.to_owned()];
        if let Some(key) = key {
            params.push(key.to_owned());
        }
        Self::cmd("JOIN", params)
    }

    pub fn part(channel: &str, reason: &str) -> Self {
        Self::cmd("PART", vec![channel.to_owned(), reason.to_owned()])
    }

    pub fn kick(channel: &str, nick: &str, reason: &str) -> Self {
        Self::cmd(
            "KICK",
            vec![channel.to_owned(), nick.to_owned(), reason.to_owned()],
        )
    }

    pub fn topic(channel: &str, text: &str) -> Self {
        Self::cmd("TOPIC", vec![channel.to_owned(), text.to_owned()])
    }

    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::cmd("PRIVMSG", vec![target.to_owned(), text.to_owned()])
    }

    pub fn notice(target: &str, text: &str) -> Self {
        Self::cmd("NOTICE", vec![target.to_owned(), text.to_owned()])
    }

    /// CTCP ACTION wrapped in a PRIVMSG (`/me`).
    pub fn action(target: &str, text: &str) -> Self {
        Self::cmd(
            "PRIVMSG",
            vec![
                target.to_owned(),
                format!("{CTCP_DELIM}ACTION {text}{CTCP_DELIM}"),
            ],
        )
    }

    pub fn whois(nick: &str) -> Self {
        Self::cmd("WHOIS", vec![nick.to_owned()])
    }

    pub fn names(channel: &str) -> Self {
        Self::cmd("NAMES", vec![channel.to_owned()])
    }

    pub fn mode(target: &str, modes: &str) -> Self {
        Self::cmd("MODE", vec![target.to_owned(), modes.to_owned()])
    }

    pub fn pong(token: &str) -> Self {
        Self::cmd("PONG", vec![token.to_owned()])
    }

    pub fn quit(reason: &str) -> Self {
        Self::cmd("QUIT", vec![reason.to_owned()])
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Whether a target names a channel (`#`, `!`, `&` or `+` sigil).
/// Anything else is a direct-message target.
pub fn is_channel_name(target: &str) -> bool {
    matches!(target.chars().next(), Some('#' | '!' | '&' | '+'))
}

// -- Numeric replies ---------------------------------------------------------

pub const RPL_WELCOME: &str = "001";
pub const RPL_ISUPPORT: &str = "005";
pub const RPL_WHOISUSER: &str = "311";
pub const RPL_WHOISIDLE: &str = "317";
pub const RPL_ENDOFWHOIS: &str = "318";
pub const RPL_WHOISCHANNELS: &str = "319";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";

/// Map a numeric error reply to its symbolic name.
///
/// Only the numerics the bridge reacts to are mapped; everything else is
/// surfaced with the raw numeric.
pub fn error_name(numeric: &str) -> Option<&'static str> {
    Some(match numeric {
        "401" => "err_nosuchnick",
        "403" => "err_nosuchchannel",
        "405" => "err_toomanychannels",
        "430" => "err_eventnickchange",
        "431" => "err_nonicknamegiven",
        "432" => "err_erroneusnickname",
        "433" => "err_nicknameinuse",
        "435" => "err_banonchan",
        "436" => "err_nickcollision",
        "437" => "err_unavailresource",
        "438" => "err_nicktoofast",
        "442" => "err_notonchannel",
        "471" => "err_channelisfull",
        "473" => "err_inviteonlychan",
        "474" => "err_bannedfromchan",
        "475" => "err_badchannelkey",
        "477" => "err_needreggednick",
        "486" => "err_nononreg",
        _ => return None,
    })
}

/// Symbolic names of numerics that can fail a `NICK` change.
pub const NICK_ERRORS: &[&str] = &[
    "err_banonchan",
    "err_nickcollision",
    "err_nicknameinuse",
    "err_erroneusnickname",
    "err_nonicknamegiven",
    "err_eventnickchange",
    "err_nicktoofast",
    "err_unavailresource",
];

/// Symbolic names of numerics that can fail a `JOIN`.
pub const JOIN_ERRORS: &[&str] = &[
    "err_nosuchchannel",
    "err_toomanychannels",
    "err_channelisfull",
    "err_inviteonlychan",
    "err_bannedfromchan",
    "err_badchannelkey",
    "err_needreggednick",
];

/// Symbolic names of errors the user must always see (force-notice).
pub const CRITICAL_ERRORS: &[&str] = &["err_nononreg"];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_bare_command() {
        let msg = Message::parse("QUIT").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert_eq!(msg.params, Vec::<String>::new());
    }

    #[test]
    fn parse_join_with_key() {
        let msg = Message::parse("JOIN #observers hunter2").unwrap();
        assert_eq!(msg.command, "JOIN");
        assert_eq!(msg.params, vec!["#observers", "hunter2"]);
    }

    #[test]
    fn parse_privmsg_trailing() {
        let msg = Message::parse("PRIVMSG #estuary :hello from the other side").unwrap();
        assert_eq!(msg.params, vec!["#estuary", "hello from the other side"]);
    }

    #[test]
    fn parse_numeric_with_server_prefix() {
        let msg = Message::parse(":irc.example.net 433 alice m_alice :Nickname is already in use")
            .unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("irc.example.net"));
        assert_eq!(msg.command, "433");
        assert_eq!(
            msg.params,
            vec!["alice", "m_alice", "Nickname is already in use"]
        );
    }

    #[test]
    fn parse_strips_crlf() {
        let msg = Message::parse("PING :irc.example.net\r\n").unwrap();
        assert_eq!(msg.params, vec!["irc.example.net"]);
    }

    #[test]
    fn parse_trailing_starting_with_colon() {
        let msg = Message::parse("PRIVMSG #estuary ::wave:").unwrap();
        assert_eq!(msg.params, vec!["#estuary", ":wave:"]);
    }

    #[test]
    fn parse_empty_trailing() {
        let msg = Message::parse("TOPIC #estuary :").unwrap();
        assert_eq!(msg.params, vec!["#estuary", ""]);
    }

    #[test]
    fn parse_empty_input_is_error() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn parse_prefix_without_command_is_error() {
        assert_eq!(Message::parse(":lonely"), Err(ParseError::MissingCommand));
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn serialize_trailing_gets_colon() {
        let msg = Message::privmsg("#estuary", "two words");
        assert_eq!(msg.to_wire(), "PRIVMSG #estuary :two words");
    }

    #[test]
    fn serialize_roundtrips() {
        let input = ":wings!w@host PRIVMSG #estuary :Hello everyone!";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }

    #[test]
    fn serialize_join_with_key() {
        assert_eq!(
            Message::join("#observers", Some("hunter2")).to_wire(),
            "JOIN #observers :hunter2"
        );
        let reparsed = Message::parse("JOIN #observers :hunter2").unwrap();
        assert_eq!(reparsed.params, vec!["#observers", "hunter2"]);
    }

    // ── Helpers ──────────────────────────────────────────────────

    #[test]
    fn source_nick_from_full_prefix() {
        let msg = Message::parse(":wings!w@host NICK :seabird").unwrap();
        assert_eq!(msg.source_nick(), Some("wings"));
    }

    #[test]
    fn source_nick_from_server_prefix() {
        let msg = Message::parse(":irc.example.net PING :tok").unwrap();
        assert_eq!(msg.source_nick(), Some("irc.example.net"));
    }

    #[test]
    fn action_wraps_and_unwraps_ctcp() {
        let msg = Message::action("#estuary", "waves");
        assert_eq!(msg.ctcp_action_text(), Some("waves"));
        assert_eq!(msg.params[1], "\u{1}ACTION waves\u{1}");
    }

    #[test]
    fn plain_privmsg_is_not_an_action() {
        assert_eq!(Message::privmsg("#estuary", "hi").ctcp_action_text(), None);
    }

    #[test]
    fn channel_name_sigils() {
        assert!(is_channel_name("#estuary"));
        assert!(is_channel_name("&local"));
        assert!(is_channel_name("!ABCDEchan"));
        assert!(is_channel_name("+modeless"));
        assert!(!is_channel_name("wings"));
        assert!(!is_channel_name(""));
    }

    // ── Numerics ─────────────────────────────────────────────────

    #[test]
    fn error_name_maps_known_numerics() {
        assert_eq!(error_name("433"), Some("err_nicknameinuse"));
        assert_eq!(error_name("474"), Some("err_bannedfromchan"));
        assert_eq!(error_name("486"), Some("err_nononreg"));
    }

    #[test]
    fn error_name_unknown_numeric_is_none() {
        assert_eq!(error_name("999"), None);
        assert_eq!(error_name("001"), None);
    }

    #[test]
    fn every_nick_and_join_error_has_a_numeric() {
        for name in NICK_ERRORS.iter().chain(JOIN_ERRORS.iter()) {
            let mapped = (400..500)
                .map(|n| n.to_string())
                .any(|n| error_name(&n) == Some(name));
            assert!(mapped, "no numeric maps to {name}");
        }
    }
}
