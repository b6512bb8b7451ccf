//! RFC 1459-style IRC message codec.
//!
//! Lines are `[:prefix ]COMMAND params... [:trailing]` terminated by
//! CRLF (the connection layer strips/appends the terminator). There is
//! no encoding negotiation; the bridge treats everything as UTF-8.

use std::fmt;

use crate::{ProtocolError, Result};

/// Maximum line length per RFC 1459 (including CRLF, which the
/// connection layer accounts for separately).
pub const MAX_LINE: usize = 512;

/// Message prefix: `name[!user][@host]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Prefix {
    /// Server name or nick.
    pub name: String,
    /// User part, after `!`.
    pub user: String,
    /// Host part, after `@`.
    pub host: String,
}

impl Prefix {
    /// Prefix with only a server/nick name.
    #[must_use]
    pub fn server(name: &str) -> Prefix {
        Prefix { name: name.to_string(), user: String::new(), host: String::new() }
    }

    /// Full user prefix `nick!user@host`.
    #[must_use]
    pub fn user(nick: &str, user: &str, host: &str) -> Prefix {
        Prefix { name: nick.to_string(), user: user.to_string(), host: host.to_string() }
    }

    fn parse(s: &str) -> Prefix {
        let (name_user, host) = match s.split_once('@') {
            Some((a, b)) => (a, b),
            None => (s, ""),
        };
        let (name, user) = match name_user.split_once('!') {
            Some((a, b)) => (a, b),
            None => (name_user, ""),
        };
        Prefix { name: name.to_string(), user: user.to_string(), host: host.to_string() }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if !self.user.is_empty() {
            write!(f, "!{}", self.user)?;
        }
        if !self.host.is_empty() {
            write!(f, "@{}", self.host)?;
        }
        Ok(())
    }
}

/// A decoded IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Optional origin prefix.
    pub prefix: Option<Prefix>,
    /// Command name or three-digit numeric.
    pub command: String,
    /// Parameters; the last one may contain spaces (trailing).
    pub params: Vec<String>,
}

impl Message {
    /// Build a message with no prefix.
    #[must_use]
    pub fn new<S: Into<String>>(command: S, params: Vec<String>) -> Message {
        Message { prefix: None, command: command.into(), params }
    }

    /// Same, with a prefix.
    #[must_use]
    pub fn with_prefix<S: Into<String>>(prefix: Prefix, command: S, params: Vec<String>) -> Message {
        Message { prefix: Some(prefix), command: command.into(), params }
    }

    /// Decode one line (CRLF already stripped).
    pub fn decode(line: &str) -> Result<Message> {
        if line.len() > MAX_LINE {
            return Err(ProtocolError::LineTooLong { len: line.len(), max: MAX_LINE });
        }
        let mut rest = line.trim_start();
        if rest.is_empty() {
            return Err(ProtocolError::Malformed("empty irc line"));
        }
        let mut prefix = None;
        if let Some(tail) = rest.strip_prefix(':') {
            let Some((pfx, tail)) = tail.split_once(' ') else {
                return Err(ProtocolError::Malformed("irc prefix without command"));
            };
            prefix = Some(Prefix::parse(pfx));
            rest = tail.trim_start();
        }
        let (command, mut rest) = match rest.find(' ') {
            Some(i) => (&rest[..i], rest[i + 1..].trim_start()),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ProtocolError::Malformed("irc line without command"));
        }
        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.find(' ') {
                Some(i) => {
                    params.push(rest[..i].to_string());
                    rest = rest[i + 1..].trim_start();
                },
                None => {
                    params.push(rest.to_string());
                    break;
                },
            }
        }
        Ok(Message { prefix, command: command.to_string(), params })
    }

    /// Append the wire representation, including the trailing CRLF.
    pub fn encode(&self, out: &mut String) -> Result<()> {
        if let Some(p) = &self.prefix {
            out.push(':');
            out.push_str(&p.to_string());
            out.push(' ');
        }
        out.push_str(&self.command);
        for (i, param) in self.params.iter().enumerate() {
            if param.contains('\r') || param.contains('\n') {
                return Err(ProtocolError::ForbiddenByte(b'\n'));
            }
            out.push(' ');
            let last = i + 1 == self.params.len();
            if last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                out.push(':');
            } else if !last && (param.is_empty() || param.contains(' ')) {
                return Err(ProtocolError::Malformed("space in non-trailing irc parameter"));
            }
            out.push_str(param);
        }
        out.push_str("\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(m: &Message) {
        let mut line = String::new();
        m.encode(&mut line).expect("encode");
        assert!(line.ends_with("\r\n"));
        let parsed = Message::decode(&line[..line.len() - 2]).expect("decode");
        assert_eq!(&parsed, m);
    }

    #[test]
    fn nick_user_join() {
        let m = Message::decode("NICK carol").unwrap();
        assert_eq!(m.command, "NICK");
        assert_eq!(m.params, vec!["carol"]);

        let m = Message::decode("USER c 0 * :c real").unwrap();
        assert_eq!(m.command, "USER");
        assert_eq!(m.params, vec!["c", "0", "*", "c real"]);

        let m = Message::decode("JOIN #hub").unwrap();
        assert_eq!(m.params, vec!["#hub"]);
    }

    #[test]
    fn privmsg_with_prefix() {
        let m = Message::decode(":alice!alice@example.org PRIVMSG #hub :hi there").unwrap();
        let p = m.prefix.as_ref().unwrap();
        assert_eq!(p.name, "alice");
        assert_eq!(p.user, "alice");
        assert_eq!(p.host, "example.org");
        assert_eq!(m.params, vec!["#hub", "hi there"]);
        round_trip(&m);
    }

    #[test]
    fn numeric_round_trip() {
        round_trip(&Message::with_prefix(
            Prefix::server("hub.local"),
            "001",
            vec!["carol".to_string(), "Welcome to the hub".to_string()],
        ));
    }

    #[test]
    fn trailing_only_when_needed() {
        let m = Message::new("PONG", vec!["token".to_string()]);
        let mut line = String::new();
        m.encode(&mut line).unwrap();
        assert_eq!(line, "PONG token\r\n");
    }

    #[test]
    fn rejects_injection() {
        let m = Message::new("PRIVMSG", vec!["#hub".to_string(), "a\r\nQUIT".to_string()]);
        let mut line = String::new();
        assert!(m.encode(&mut line).is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(Message::decode("").is_err());
        assert!(Message::decode("   ").is_err());
    }
}
