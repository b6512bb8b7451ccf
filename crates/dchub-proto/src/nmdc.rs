//! NMDC line codec.
//!
//! NMDC is line-framed: every command starts with `$` and ends with `|`;
//! chat lines start with `<`. Payloads may not contain `\0` or a literal
//! `|`; text fields escape `$`, `|` and `&` as HTML entities. The codec
//! here works on already-transcoded UTF-8 lines *without* the trailing
//! `|`; legacy encodings and the `$ZOn` zlib switch are transport
//! concerns handled by the connection layer.
//!
//! Decoding is strict about structure but lenient about content:
//! commands the hub does not know come back as [`Message::Unknown`] so
//! the session layer can log and ignore them.

use std::fmt;

use crate::{ProtocolError, Result};

/// Maximum accepted line length, in bytes.
///
/// Bulk commands (`$NickList` on a large hub) are the reason this is as
/// large as it is.
pub const MAX_LINE: usize = 512 * 1024;

/// Escape text for embedding in an NMDC payload.
#[must_use]
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '$' => out.push_str("&#36;"),
            '|' => out.push_str("&#124;"),
            '\0' => out.push_str("&#0;"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`]. Unrecognized entities pass through verbatim.
#[must_use]
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        let mut replaced = false;
        for (ent, ch) in [("&amp;", '&'), ("&#36;", '$'), ("&#124;", '|'), ("&#0;", '\0')] {
            if let Some(tail) = rest.strip_prefix(ent) {
                out.push(ch);
                rest = tail;
                replaced = true;
                break;
            }
        }
        if !replaced {
            out.push('&');
            rest = &rest[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Client connection mode advertised in the MyINFO tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserMode {
    /// Active (direct TCP).
    Active,
    /// Passive (behind NAT, reverse connections only).
    Passive,
    /// SOCKS5 proxy.
    Socks,
}

impl UserMode {
    fn as_char(self) -> char {
        match self {
            UserMode::Active => 'A',
            UserMode::Passive => 'P',
            UserMode::Socks => '5',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(UserMode::Active),
            'P' => Some(UserMode::Passive),
            '5' => Some(UserMode::Socks),
            _ => None,
        }
    }
}

/// Parsed form of the `<App V:...,M:...,H:a/b/c,S:n>` MyINFO tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTag {
    /// Client software name and version.
    pub client: crate::Software,
    /// Connection mode, if advertised.
    pub mode: Option<UserMode>,
    /// Hub counts: (guest, registered, operator).
    pub hubs: (u32, u32, u32),
    /// Open upload slots.
    pub slots: u32,
}

impl ClientTag {
    /// Parse a raw tag body (without the surrounding `<` `>`).
    #[must_use]
    pub fn parse(raw: &str) -> ClientTag {
        let (name, fields) = match raw.find(' ') {
            Some(i) => (&raw[..i], &raw[i + 1..]),
            None => (raw, ""),
        };
        let mut tag = ClientTag {
            client: crate::Software { name: name.to_string(), version: String::new() },
            mode: None,
            hubs: (0, 0, 0),
            slots: 0,
        };
        for field in fields.split(',') {
            let Some((k, v)) = field.split_once(':') else { continue };
            match k {
                "V" => tag.client.version = v.to_string(),
                "M" => tag.mode = v.chars().next().and_then(UserMode::from_char),
                "S" => tag.slots = v.parse().unwrap_or(0),
                "H" => {
                    let mut it = v.splitn(3, '/');
                    let g = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                    let r = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                    let o = it.next().and_then(|s| s.parse().ok()).unwrap_or(0);
                    tag.hubs = (g, r, o);
                },
                _ => {},
            }
        }
        tag
    }
}

impl fmt::Display for ClientTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} V:{},M:{},H:{}/{}/{},S:{}",
            self.client.name,
            self.client.version,
            self.mode.unwrap_or(UserMode::Passive).as_char(),
            self.hubs.0,
            self.hubs.1,
            self.hubs.2,
            self.slots
        )
    }
}

/// The `$MyINFO` payload.
///
/// The client tag is kept raw so that relaying a peer's MyINFO to other
/// peers does not normalize text the hub never needed to understand;
/// [`MyInfo::client_tag`] parses it on demand.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MyInfo {
    /// Display name.
    pub nick: String,
    /// Free-form description, tag excluded.
    pub desc: String,
    /// Raw tag body (content between `<` and `>`), if present.
    pub tag: Option<String>,
    /// Connection speed string, e.g. `"100"` or `"DSL"`.
    pub conn: String,
    /// Status flag byte (`1` = normal, `2` = away, ...).
    pub flag: u8,
    /// E-mail address.
    pub email: String,
    /// Share size in bytes.
    pub share: u64,
}

impl MyInfo {
    /// Parse the raw tag into its typed form.
    #[must_use]
    pub fn client_tag(&self) -> Option<ClientTag> {
        self.tag.as_deref().map(ClientTag::parse)
    }
}

/// Address a search request originates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchAddr {
    /// Active search: results go directly to `host:port` over UDP.
    Active(String),
    /// Passive search: results are relayed by the hub to `nick`.
    Passive(String),
}

/// A decoded NMDC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `$Lock <lock> Pk=<pk>` — hub's legacy challenge.
    Lock {
        /// Lock string.
        lock: String,
        /// Pk (software) identifier.
        pk: String,
    },
    /// `$Key <key>` — client's answer to the lock. Not validated.
    Key {
        /// Raw key data.
        key: String,
    },
    /// `$ValidateNick <nick>`.
    ValidateNick {
        /// Requested nick.
        nick: String,
    },
    /// `$ValidateDenide <nick>` — nick rejected (sic, protocol spelling).
    ValidateDenide {
        /// Rejected nick.
        nick: String,
    },
    /// `$GetPass` — hub requests the password.
    GetPass,
    /// `$MyPass <pass>`.
    MyPass {
        /// Cleartext password.
        pass: String,
    },
    /// `$BadPass`.
    BadPass,
    /// `$Hello <nick>` — login confirmed.
    Hello {
        /// Accepted nick.
        nick: String,
    },
    /// `$Version <vers>`.
    Version {
        /// Client protocol version, e.g. `1,0091`.
        vers: String,
    },
    /// `$GetNickList`.
    GetNickList,
    /// `$MyINFO $ALL ...`.
    MyInfo(MyInfo),
    /// `$NickList a$$b$$`.
    NickList {
        /// Online nicks.
        nicks: Vec<String>,
    },
    /// `$OpList a$$b$$`.
    OpList {
        /// Operator nicks.
        nicks: Vec<String>,
    },
    /// `$HubName <name>`.
    HubName {
        /// Hub display name.
        name: String,
    },
    /// `$HubTopic <topic>`.
    HubTopic {
        /// Topic text.
        topic: String,
    },
    /// `$Supports <ext> <ext> ...`.
    Supports {
        /// Extension names.
        features: Vec<String>,
    },
    /// `<nick> text` — public chat.
    ChatMsg {
        /// Sender display name.
        nick: String,
        /// Message text.
        text: String,
        /// Action flag (`/me`).
        me: bool,
    },
    /// `$To: <to> From: <from> $<nick> text` — private message.
    PrivateTo {
        /// Recipient nick.
        to: String,
        /// Sender nick (routing field).
        from: String,
        /// Sender display name (inside the chat part).
        nick: String,
        /// Message text.
        text: String,
        /// Action flag.
        me: bool,
    },
    /// `$ConnectToMe <target> <host:port>[S]`.
    ConnectToMe {
        /// Peer asked to connect.
        target: String,
        /// Address to connect to.
        addr: String,
        /// TLS requested.
        secure: bool,
    },
    /// `$RevConnectToMe <from> <to>`.
    RevConnectToMe {
        /// Requesting (passive) peer.
        from: String,
        /// Peer asked to initiate.
        to: String,
    },
    /// `$Search <addr> <spec>`.
    Search {
        /// Originating address (active or passive).
        addr: SearchAddr,
        /// Raw search specification (`F?T?0?9?pattern` form). The hub
        /// relays it without interpretation.
        spec: String,
    },
    /// `$SR <nick> <result>` — search result, relayed to one peer.
    Sr {
        /// Nick of the peer that has the result.
        from: String,
        /// Raw result payload (fields separated by `\x05`).
        data: String,
        /// Target nick; present hub-bound, stripped client-bound.
        target: Option<String>,
    },
    /// `$ForceMove <addr>` — redirect, followed by a close.
    ForceMove {
        /// Address to move to.
        addr: String,
    },
    /// `$Quit <nick>` — peer left.
    Quit {
        /// Leaving nick.
        nick: String,
    },
    /// `$ZOn` — all following output is zlib-compressed.
    ZOn,
    /// Anything this codec does not recognize.
    Unknown {
        /// Command name, without `$`.
        cmd: String,
        /// Raw argument text.
        data: String,
    },
}

impl Message {
    /// Decode one line (trailing `|` already stripped).
    pub fn decode(line: &str) -> Result<Message> {
        if line.len() > MAX_LINE {
            return Err(ProtocolError::LineTooLong { len: line.len(), max: MAX_LINE });
        }
        if let Some(rest) = line.strip_prefix('<') {
            return decode_chat(rest);
        }
        let Some(rest) = line.strip_prefix('$') else {
            return Err(ProtocolError::Malformed("expected '$' command or '<' chat"));
        };
        let (cmd, args) = match rest.find(' ') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };
        match cmd {
            "Lock" => {
                let (lock, pk) = match args.find(" Pk=") {
                    Some(i) => (&args[..i], &args[i + 4..]),
                    None => (args, ""),
                };
                if lock.is_empty() {
                    return Err(ProtocolError::Malformed("empty lock"));
                }
                Ok(Message::Lock { lock: lock.to_string(), pk: pk.to_string() })
            },
            "Key" => Ok(Message::Key { key: args.to_string() }),
            "ValidateNick" => one_arg(args, "ValidateNick").map(|nick| Message::ValidateNick { nick }),
            "ValidateDenide" => Ok(Message::ValidateDenide { nick: args.to_string() }),
            "GetPass" => Ok(Message::GetPass),
            "MyPass" => Ok(Message::MyPass { pass: args.to_string() }),
            "BadPass" => Ok(Message::BadPass),
            "Hello" => one_arg(args, "Hello").map(|nick| Message::Hello { nick }),
            "Version" => Ok(Message::Version { vers: args.to_string() }),
            "GetNickList" => Ok(Message::GetNickList),
            "MyINFO" => decode_myinfo(args),
            "NickList" => Ok(Message::NickList { nicks: split_nicks(args) }),
            "OpList" => Ok(Message::OpList { nicks: split_nicks(args) }),
            "HubName" => Ok(Message::HubName { name: unescape(args) }),
            "HubTopic" => Ok(Message::HubTopic { topic: unescape(args) }),
            "Supports" => Ok(Message::Supports {
                features: args.split(' ').filter(|s| !s.is_empty()).map(String::from).collect(),
            }),
            "To:" => decode_private(args),
            "ConnectToMe" => decode_ctm(args),
            "RevConnectToMe" => {
                let (from, to) = args
                    .split_once(' ')
                    .ok_or(ProtocolError::Malformed("RevConnectToMe needs two nicks"))?;
                Ok(Message::RevConnectToMe { from: from.to_string(), to: to.to_string() })
            },
            "Search" => decode_search(args),
            "SR" => decode_sr(args),
            "ForceMove" => Ok(Message::ForceMove { addr: args.to_string() }),
            "Quit" => one_arg(args, "Quit").map(|nick| Message::Quit { nick }),
            "ZOn" => Ok(Message::ZOn),
            _ => Ok(Message::Unknown { cmd: cmd.to_string(), data: args.to_string() }),
        }
    }

    /// Append the full framed representation, including the trailing `|`.
    pub fn encode(&self, out: &mut String) -> Result<()> {
        match self {
            Message::Lock { lock, pk } => {
                check_payload(lock)?;
                out.push_str("$Lock ");
                out.push_str(lock);
                out.push_str(" Pk=");
                out.push_str(pk);
            },
            Message::Key { key } => {
                out.push_str("$Key ");
                out.push_str(key);
            },
            Message::ValidateNick { nick } => {
                out.push_str("$ValidateNick ");
                out.push_str(&escape(nick));
            },
            Message::ValidateDenide { nick } => {
                out.push_str("$ValidateDenide ");
                out.push_str(&escape(nick));
            },
            Message::GetPass => out.push_str("$GetPass"),
            Message::MyPass { pass } => {
                out.push_str("$MyPass ");
                out.push_str(&escape(pass));
            },
            Message::BadPass => out.push_str("$BadPass"),
            Message::Hello { nick } => {
                out.push_str("$Hello ");
                out.push_str(&escape(nick));
            },
            Message::Version { vers } => {
                out.push_str("$Version ");
                out.push_str(vers);
            },
            Message::GetNickList => out.push_str("$GetNickList"),
            Message::MyInfo(info) => encode_myinfo(info, out),
            Message::NickList { nicks } => {
                out.push_str("$NickList ");
                join_nicks(nicks, out);
            },
            Message::OpList { nicks } => {
                out.push_str("$OpList ");
                join_nicks(nicks, out);
            },
            Message::HubName { name } => {
                out.push_str("$HubName ");
                out.push_str(&escape(name));
            },
            Message::HubTopic { topic } => {
                out.push_str("$HubTopic ");
                out.push_str(&escape(topic));
            },
            Message::Supports { features } => {
                out.push_str("$Supports ");
                out.push_str(&features.join(" "));
            },
            Message::ChatMsg { nick, text, me } => {
                out.push('<');
                out.push_str(&escape(nick));
                out.push_str("> ");
                if *me {
                    out.push_str("/me ");
                }
                out.push_str(&escape(text));
            },
            Message::PrivateTo { to, from, nick, text, me } => {
                out.push_str("$To: ");
                out.push_str(&escape(to));
                out.push_str(" From: ");
                out.push_str(&escape(from));
                out.push_str(" $<");
                out.push_str(&escape(nick));
                out.push_str("> ");
                if *me {
                    out.push_str("/me ");
                }
                out.push_str(&escape(text));
            },
            Message::ConnectToMe { target, addr, secure } => {
                check_payload(addr)?;
                out.push_str("$ConnectToMe ");
                out.push_str(&escape(target));
                out.push(' ');
                out.push_str(addr);
                if *secure {
                    out.push('S');
                }
            },
            Message::RevConnectToMe { from, to } => {
                out.push_str("$RevConnectToMe ");
                out.push_str(&escape(from));
                out.push(' ');
                out.push_str(&escape(to));
            },
            Message::Search { addr, spec } => {
                check_payload(spec)?;
                out.push_str("$Search ");
                match addr {
                    SearchAddr::Active(a) => out.push_str(a),
                    SearchAddr::Passive(nick) => {
                        out.push_str("Hub:");
                        out.push_str(&escape(nick));
                    },
                }
                out.push(' ');
                out.push_str(spec);
            },
            Message::Sr { from, data, target } => {
                check_payload(data)?;
                out.push_str("$SR ");
                out.push_str(&escape(from));
                out.push(' ');
                out.push_str(data);
                if let Some(t) = target {
                    out.push('\x05');
                    out.push_str(&escape(t));
                }
            },
            Message::ForceMove { addr } => {
                check_payload(addr)?;
                out.push_str("$ForceMove ");
                out.push_str(addr);
            },
            Message::Quit { nick } => {
                out.push_str("$Quit ");
                out.push_str(&escape(nick));
            },
            Message::ZOn => out.push_str("$ZOn"),
            Message::Unknown { cmd, data } => {
                check_payload(cmd)?;
                check_payload(data)?;
                out.push('$');
                out.push_str(cmd);
                if !data.is_empty() {
                    out.push(' ');
                    out.push_str(data);
                }
            },
        }
        out.push('|');
        Ok(())
    }
}

/// Reject payloads the framing cannot carry.
fn check_payload(s: &str) -> Result<()> {
    if let Some(b) = s.bytes().find(|&b| b == 0 || b == b'|') {
        return Err(ProtocolError::ForbiddenByte(b));
    }
    Ok(())
}

fn one_arg(args: &str, _cmd: &'static str) -> Result<String> {
    if args.is_empty() || args.contains(' ') {
        return Err(ProtocolError::Malformed("expected exactly one argument"));
    }
    Ok(unescape(args))
}

fn split_nicks(args: &str) -> Vec<String> {
    args.split("$$").filter(|s| !s.is_empty()).map(unescape).collect()
}

fn join_nicks(nicks: &[String], out: &mut String) {
    for n in nicks {
        out.push_str(&escape(n));
        out.push_str("$$");
    }
}

fn decode_chat(rest: &str) -> Result<Message> {
    let Some((nick, text)) = rest.split_once("> ") else {
        return Err(ProtocolError::Malformed("chat line without '> ' separator"));
    };
    let text = unescape(text);
    let (text, me) = match text.strip_prefix("/me ") {
        Some(t) => (t.to_string(), true),
        None => (text, false),
    };
    Ok(Message::ChatMsg { nick: unescape(nick), text, me })
}

fn decode_private(args: &str) -> Result<Message> {
    // $To: <to> From: <from> $<nick> text
    let Some((to, rest)) = args.split_once(" From: ") else {
        return Err(ProtocolError::Malformed("To: without From:"));
    };
    let Some((from, chat)) = rest.split_once(" $") else {
        return Err(ProtocolError::Malformed("To: without chat part"));
    };
    let Some(chat) = chat.strip_prefix('<') else {
        return Err(ProtocolError::Malformed("To: chat part without '<nick>'"));
    };
    let Some((nick, text)) = chat.split_once("> ") else {
        return Err(ProtocolError::Malformed("To: chat part without '> '"));
    };
    let text = unescape(text);
    let (text, me) = match text.strip_prefix("/me ") {
        Some(t) => (t.to_string(), true),
        None => (text, false),
    };
    Ok(Message::PrivateTo {
        to: unescape(to),
        from: unescape(from),
        nick: unescape(nick),
        text,
        me,
    })
}

fn decode_myinfo(args: &str) -> Result<Message> {
    let Some(rest) = args.strip_prefix("$ALL ") else {
        return Err(ProtocolError::Malformed("MyINFO without $ALL"));
    };
    let Some((nick, rest)) = rest.split_once(' ') else {
        return Err(ProtocolError::Malformed("MyINFO without nick"));
    };
    // <desc><tag>$ $<conn><flag>$<email>$<share>$
    let mut fields = rest.split('$');
    let desc_tag = fields.next().unwrap_or("");
    let _legacy = fields.next(); // historically always " "
    let conn_flag = fields.next().unwrap_or("");
    let email = fields.next().unwrap_or("");
    let share = fields.next().unwrap_or("");

    let desc_tag = desc_tag.strip_suffix(' ').unwrap_or(desc_tag);
    let (desc, tag) = match (desc_tag.rfind('<'), desc_tag.ends_with('>')) {
        (Some(i), true) => (&desc_tag[..i], Some(desc_tag[i + 1..desc_tag.len() - 1].to_string())),
        _ => (desc_tag, None),
    };

    // The flag is the last byte of the connection field. Non-ASCII
    // trailers are left alone so we never split a UTF-8 sequence.
    let (conn, flag) = match conn_flag.as_bytes().last() {
        Some(&b) if b.is_ascii() => (&conn_flag[..conn_flag.len() - 1], b),
        _ => (conn_flag, b'\x01'),
    };

    let share: u64 = if share.is_empty() {
        0
    } else {
        share.parse().map_err(|_| ProtocolError::InvalidNumber("share"))?
    };

    Ok(Message::MyInfo(MyInfo {
        nick: unescape(nick),
        desc: unescape(desc),
        tag,
        conn: conn.to_string(),
        flag,
        email: unescape(email),
        share,
    }))
}

fn encode_myinfo(info: &MyInfo, out: &mut String) {
    out.push_str("$MyINFO $ALL ");
    out.push_str(&escape(&info.nick));
    out.push(' ');
    out.push_str(&escape(&info.desc));
    if let Some(tag) = &info.tag {
        out.push('<');
        out.push_str(tag);
        out.push('>');
    }
    out.push_str("$ $");
    out.push_str(&info.conn);
    out.push(info.flag as char);
    out.push('$');
    out.push_str(&escape(&info.email));
    out.push('$');
    out.push_str(&info.share.to_string());
    out.push('$');
}

fn decode_ctm(args: &str) -> Result<Message> {
    let Some((target, addr)) = args.split_once(' ') else {
        return Err(ProtocolError::Malformed("ConnectToMe needs nick and address"));
    };
    let (addr, secure) = match addr.strip_suffix('S') {
        Some(a) if a.contains(':') => (a, true),
        _ => (addr, false),
    };
    Ok(Message::ConnectToMe {
        target: unescape(target),
        addr: addr.to_string(),
        secure,
    })
}

fn decode_search(args: &str) -> Result<Message> {
    let Some((addr, spec)) = args.split_once(' ') else {
        return Err(ProtocolError::Malformed("Search needs address and spec"));
    };
    let addr = match addr.strip_prefix("Hub:") {
        Some(nick) => SearchAddr::Passive(unescape(nick)),
        None => SearchAddr::Active(addr.to_string()),
    };
    Ok(Message::Search { addr, spec: spec.to_string() })
}

fn decode_sr(args: &str) -> Result<Message> {
    let Some((from, data)) = args.split_once(' ') else {
        return Err(ProtocolError::Malformed("SR needs source nick"));
    };
    let (data, target) = match data.rfind('\x05') {
        // Hub-bound results carry the target nick after the last \x05.
        Some(i) if !data[i + 1..].contains(' ') && !data[i + 1..].is_empty() => {
            (&data[..i], Some(unescape(&data[i + 1..])))
        },
        _ => (data, None),
    };
    Ok(Message::Sr { from: unescape(from), data: data.to_string(), target })
}
