//! ADC packet codec.
//!
//! ADC commands are newline-terminated, space-separated tokens:
//! `<Type><Cmd> <fields...>\n` where Type is one of `B C D E F H I U`.
//! Fields escape space, newline and backslash as `\s`, `\n`, `\\`.
//!
//! Parsing is deliberately late. [`Packet::decode`] only separates the
//! routing header (type, command, SIDs, feature selectors) from the raw
//! body, so the hub can relay packets it never needs to understand.
//! Typed views ([`UserInfo`], [`Status`], [`ChatMsg`], ...) decode from
//! a [`Packet`] on demand.

use std::str::FromStr;

use data_encoding::BASE32_NOPAD;

use crate::{Cid, Features, ProtocolError, Result, Sid};

/// Maximum accepted line length, in bytes.
pub const MAX_LINE: usize = 1024 * 1024;

/// Escape a field value.
#[must_use]
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape`]. Unknown escape sequences are an error.
pub fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            _ => return Err(ProtocolError::InvalidEscape),
        }
    }
    Ok(out)
}

/// A feature selector in a Feature-broadcast header (`+SEGA`, `-NAT0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSel {
    /// `true` for `+` (must support), `false` for `-` (must not).
    pub require: bool,
    /// Four-character feature tag.
    pub tag: String,
}

/// Routing header of an ADC packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketKind {
    /// `B` — broadcast from a client to everyone.
    Broadcast {
        /// Originating session.
        from: Sid,
    },
    /// `C` — client-client; never routed by a hub, recognized only so
    /// the sniffer and tools can classify it.
    Client,
    /// `D` — direct: routed to one session, echoed to none.
    Direct {
        /// Originating session.
        from: Sid,
        /// Target session.
        to: Sid,
    },
    /// `E` — echo: routed to the target *and* back to the sender.
    Echo {
        /// Originating session.
        from: Sid,
        /// Target session.
        to: Sid,
    },
    /// `F` — feature broadcast: delivered to sessions matching the
    /// selectors.
    Feature {
        /// Originating session.
        from: Sid,
        /// Feature selectors.
        sel: Vec<FeatureSel>,
    },
    /// `H` — client to hub.
    Hub,
    /// `I` — hub to client.
    Info,
    /// `U` — UDP, identified by CID.
    Udp {
        /// Originating client.
        from: Cid,
    },
}

impl PacketKind {
    /// Originating SID, for kinds that carry one.
    #[must_use]
    pub fn source(&self) -> Option<Sid> {
        match self {
            PacketKind::Broadcast { from }
            | PacketKind::Direct { from, .. }
            | PacketKind::Echo { from, .. }
            | PacketKind::Feature { from, .. } => Some(*from),
            _ => None,
        }
    }

    /// Target SID for direct/echo packets.
    #[must_use]
    pub fn target(&self) -> Option<Sid> {
        match self {
            PacketKind::Direct { to, .. } | PacketKind::Echo { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// A structurally parsed ADC packet.
///
/// `body` keeps the raw, still-escaped field text so relaying is a pure
/// copy. Typed message views decode from it on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Routing header.
    pub kind: PacketKind,
    /// Three-letter command, e.g. `SUP`, `INF`, `MSG`.
    pub cmd: [u8; 3],
    /// Raw escaped body (fields joined by single spaces); may be empty.
    pub body: String,
}

impl Packet {
    /// Construct a packet from unescaped field values.
    #[must_use]
    pub fn from_fields(kind: PacketKind, cmd: [u8; 3], fields: &[&str]) -> Packet {
        let body = fields.iter().map(|f| escape(f)).collect::<Vec<_>>().join(" ");
        Packet { kind, cmd, body }
    }

    /// Command name as a string slice.
    #[must_use]
    pub fn cmd_str(&self) -> &str {
        std::str::from_utf8(&self.cmd).unwrap_or("???")
    }

    /// Iterate over raw (still escaped) body fields.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.body.split(' ').filter(|f| !f.is_empty())
    }

    /// Decode one line (trailing `\n` already stripped).
    pub fn decode(line: &str) -> Result<Packet> {
        if line.len() > MAX_LINE {
            return Err(ProtocolError::LineTooLong { len: line.len(), max: MAX_LINE });
        }
        let mut tokens = line.split(' ');
        let head = tokens.next().unwrap_or("");
        if head.len() != 4 || !head.is_ascii() {
            return Err(ProtocolError::Malformed("packet header must be 4 ascii chars"));
        }
        let kind_ch = head.as_bytes()[0] as char;
        let cmd: [u8; 3] = head.as_bytes()[1..4]
            .try_into()
            .map_err(|_| ProtocolError::Malformed("short command"))?;

        let kind = match kind_ch {
            'B' => PacketKind::Broadcast { from: take_sid(&mut tokens, "broadcast sid")? },
            'C' => PacketKind::Client,
            'D' => PacketKind::Direct {
                from: take_sid(&mut tokens, "direct source sid")?,
                to: take_sid(&mut tokens, "direct target sid")?,
            },
            'E' => PacketKind::Echo {
                from: take_sid(&mut tokens, "echo source sid")?,
                to: take_sid(&mut tokens, "echo target sid")?,
            },
            'F' => {
                let from = take_sid(&mut tokens, "feature broadcast sid")?;
                let mut sel = Vec::new();
                let rest: Vec<&str> = tokens.collect();
                let mut i = 0;
                while i < rest.len() {
                    let t = rest[i];
                    let (require, tag) = if let Some(tag) = t.strip_prefix('+') {
                        (true, tag)
                    } else if let Some(tag) = t.strip_prefix('-') {
                        (false, tag)
                    } else {
                        break;
                    };
                    if tag.len() != 4 {
                        break;
                    }
                    sel.push(FeatureSel { require, tag: tag.to_string() });
                    i += 1;
                }
                let body = rest[i..].join(" ");
                return Ok(Packet { kind: PacketKind::Feature { from, sel }, cmd, body });
            },
            'H' => PacketKind::Hub,
            'I' => PacketKind::Info,
            'U' => {
                let cid = tokens
                    .next()
                    .ok_or(ProtocolError::Malformed("udp packet without cid"))
                    .and_then(Cid::from_str)?;
                PacketKind::Udp { from: cid }
            },
            other => return Err(ProtocolError::UnknownKind(other)),
        };
        let body = tokens.collect::<Vec<_>>().join(" ");
        Ok(Packet { kind, cmd, body })
    }

    /// Append the wire representation, including the trailing `\n`.
    pub fn encode(&self, out: &mut String) -> Result<()> {
        if self.body.contains('\n') {
            return Err(ProtocolError::ForbiddenByte(b'\n'));
        }
        let kind_ch = match &self.kind {
            PacketKind::Broadcast { .. } => 'B',
            PacketKind::Client => 'C',
            PacketKind::Direct { .. } => 'D',
            PacketKind::Echo { .. } => 'E',
            PacketKind::Feature { .. } => 'F',
            PacketKind::Hub => 'H',
            PacketKind::Info => 'I',
            PacketKind::Udp { .. } => 'U',
        };
        out.push(kind_ch);
        out.push_str(self.cmd_str());
        match &self.kind {
            PacketKind::Broadcast { from } => {
                out.push(' ');
                out.push_str(&from.to_adc());
            },
            PacketKind::Direct { from, to } | PacketKind::Echo { from, to } => {
                out.push(' ');
                out.push_str(&from.to_adc());
                out.push(' ');
                out.push_str(&to.to_adc());
            },
            PacketKind::Feature { from, sel } => {
                out.push(' ');
                out.push_str(&from.to_adc());
                for s in sel {
                    out.push(' ');
                    out.push(if s.require { '+' } else { '-' });
                    out.push_str(&s.tag);
                }
            },
            PacketKind::Udp { from } => {
                out.push(' ');
                out.push_str(&from.to_base32());
            },
            PacketKind::Client | PacketKind::Hub | PacketKind::Info => {},
        }
        if !self.body.is_empty() {
            out.push(' ');
            out.push_str(&self.body);
        }
        out.push('\n');
        Ok(())
    }
}

/// `SUP` — feature negotiation. Fields are `AD<tag>` / `RM<tag>`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Supported {
    /// Features to add.
    pub add: Features,
    /// Features to remove.
    pub remove: Features,
}

/// Command constant for [`Supported`].
pub const CMD_SUP: [u8; 3] = *b"SUP";
/// Command constant for [`SidAssign`].
pub const CMD_SID: [u8; 3] = *b"SID";
/// Command constant for [`UserInfo`].
pub const CMD_INF: [u8; 3] = *b"INF";
/// Command constant for [`ChatMsg`].
pub const CMD_MSG: [u8; 3] = *b"MSG";
/// Command constant for [`Status`].
pub const CMD_STA: [u8; 3] = *b"STA";
/// Command constant for [`GetPassword`].
pub const CMD_GPA: [u8; 3] = *b"GPA";
/// Command constant for [`Password`].
pub const CMD_PAS: [u8; 3] = *b"PAS";
/// Command constant for [`Quit`].
pub const CMD_QUI: [u8; 3] = *b"QUI";
/// Command constant for search requests.
pub const CMD_SCH: [u8; 3] = *b"SCH";
/// Command constant for search results.
pub const CMD_RES: [u8; 3] = *b"RES";
/// Command constant for [`ConnectToMe`].
pub const CMD_CTM: [u8; 3] = *b"CTM";
/// Command constant for [`RevConnectToMe`].
pub const CMD_RCM: [u8; 3] = *b"RCM";

impl Supported {
    /// Decode from a `SUP` packet.
    pub fn decode(p: &Packet) -> Result<Supported> {
        let mut sup = Supported::default();
        for f in p.fields() {
            let f = unescape(f)?;
            if let Some(tag) = f.strip_prefix("AD") {
                sup.add.insert(tag.to_string());
            } else if let Some(tag) = f.strip_prefix("RM") {
                sup.remove.insert(tag.to_string());
            } else {
                return Err(ProtocolError::Malformed("SUP field without AD/RM prefix"));
            }
        }
        Ok(sup)
    }

    /// Encode into a packet of the given kind.
    #[must_use]
    pub fn to_packet(&self, kind: PacketKind) -> Packet {
        let mut fields: Vec<String> = Vec::new();
        for t in self.add.iter() {
            fields.push(format!("AD{t}"));
        }
        for t in self.remove.iter() {
            fields.push(format!("RM{t}"));
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        Packet::from_fields(kind, CMD_SUP, &refs)
    }
}

/// `SID` — hub assigns a session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidAssign {
    /// The assigned SID.
    pub sid: Sid,
}

impl SidAssign {
    /// Decode from a `SID` packet.
    pub fn decode(p: &Packet) -> Result<SidAssign> {
        let f = p.fields().next().ok_or(ProtocolError::Malformed("SID without argument"))?;
        Ok(SidAssign { sid: f.parse()? })
    }

    /// Encode as an `ISID` packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        Packet::from_fields(PacketKind::Info, CMD_SID, &[&self.sid.to_adc()])
    }
}

/// `INF` — user (or hub) information, a set of 2-letter named fields.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    /// `ID` — content identifier.
    pub id: Option<Cid>,
    /// `PD` — private identifier; only valid during IDENTIFY.
    pub pid: Option<Cid>,
    /// `NI` — nick.
    pub nick: Option<String>,
    /// `DE` — description.
    pub desc: Option<String>,
    /// `SS` — share size in bytes.
    pub share: Option<u64>,
    /// `SF` — number of shared files.
    pub share_files: Option<u32>,
    /// `SL` — open slots.
    pub slots: Option<u32>,
    /// `HN` — hubs connected as guest.
    pub hubs_normal: Option<u32>,
    /// `HR` — hubs connected as registered.
    pub hubs_reg: Option<u32>,
    /// `HO` — hubs connected as operator.
    pub hubs_op: Option<u32>,
    /// `SU` — supported features (comma separated on the wire).
    pub features: Features,
    /// `AP` — application name.
    pub app: Option<String>,
    /// `VE` — application version.
    pub version: Option<String>,
    /// `I4` — IPv4 address.
    pub ip4: Option<String>,
    /// `I6` — IPv6 address.
    pub ip6: Option<String>,
    /// `U4` — UDP port (IPv4) for active search results.
    pub udp4: Option<u16>,
    /// `EM` — e-mail.
    pub email: Option<String>,
    /// `CT` — client type bitmask (1 bot, 4 registered, 32 hub, ...).
    pub ctype: Option<u32>,
    /// Fields this codec has no dedicated slot for.
    pub extra: Vec<(String, String)>,
}

impl UserInfo {
    /// Decode from an `INF` packet.
    pub fn decode(p: &Packet) -> Result<UserInfo> {
        let mut u = UserInfo::default();
        for f in p.fields() {
            if f.len() < 2 || !f.is_char_boundary(2) {
                return Err(ProtocolError::Malformed("INF field shorter than its name"));
            }
            let (code, raw) = f.split_at(2);
            let val = unescape(raw)?;
            match code {
                "ID" => u.id = Some(val.parse()?),
                "PD" => u.pid = Some(val.parse()?),
                "NI" => u.nick = Some(val),
                "DE" => u.desc = Some(val),
                "SS" => u.share = Some(parse_num(&val, "SS")?),
                "SF" => u.share_files = Some(parse_num(&val, "SF")?),
                "SL" => u.slots = Some(parse_num(&val, "SL")?),
                "HN" => u.hubs_normal = Some(parse_num(&val, "HN")?),
                "HR" => u.hubs_reg = Some(parse_num(&val, "HR")?),
                "HO" => u.hubs_op = Some(parse_num(&val, "HO")?),
                "SU" => {
                    u.features =
                        Features::from_iter(val.split(',').filter(|s| !s.is_empty()));
                },
                "AP" => u.app = Some(val),
                "VE" => u.version = Some(val),
                "I4" => u.ip4 = Some(val),
                "I6" => u.ip6 = Some(val),
                "U4" => u.udp4 = Some(parse_num(&val, "U4")?),
                "EM" => u.email = Some(val),
                "CT" => u.ctype = Some(parse_num(&val, "CT")?),
                _ => u.extra.push((code.to_string(), val)),
            }
        }
        Ok(u)
    }

    /// Encode into an `INF` packet of the given kind.
    #[must_use]
    pub fn to_packet(&self, kind: PacketKind) -> Packet {
        let mut fields: Vec<String> = Vec::new();
        let mut push = |code: &str, val: &str| fields.push(format!("{code}{}", escape(val)));
        if let Some(v) = &self.id {
            push("ID", &v.to_base32());
        }
        if let Some(v) = &self.pid {
            push("PD", &v.to_base32());
        }
        if let Some(v) = &self.nick {
            push("NI", v);
        }
        if let Some(v) = &self.desc {
            push("DE", v);
        }
        if let Some(v) = self.share {
            push("SS", &v.to_string());
        }
        if let Some(v) = self.share_files {
            push("SF", &v.to_string());
        }
        if let Some(v) = self.slots {
            push("SL", &v.to_string());
        }
        if let Some(v) = self.hubs_normal {
            push("HN", &v.to_string());
        }
        if let Some(v) = self.hubs_reg {
            push("HR", &v.to_string());
        }
        if let Some(v) = self.hubs_op {
            push("HO", &v.to_string());
        }
        if !self.features.is_empty() {
            let su: Vec<&str> = self.features.iter().collect();
            push("SU", &su.join(","));
        }
        if let Some(v) = &self.app {
            push("AP", v);
        }
        if let Some(v) = &self.version {
            push("VE", v);
        }
        if let Some(v) = &self.ip4 {
            push("I4", v);
        }
        if let Some(v) = &self.ip6 {
            push("I6", v);
        }
        if let Some(v) = self.udp4 {
            push("U4", &v.to_string());
        }
        if let Some(v) = &self.email {
            push("EM", v);
        }
        if let Some(v) = self.ctype {
            push("CT", &v.to_string());
        }
        for (code, val) in &self.extra {
            push(code, val);
        }
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        Packet::from_fields(kind, CMD_INF, &refs)
    }
}

fn parse_num<T: FromStr>(v: &str, what: &'static str) -> Result<T> {
    v.parse().map_err(|_| ProtocolError::InvalidNumber(what))
}

fn take_sid<'a, I: Iterator<Item = &'a str>>(tokens: &mut I, what: &'static str) -> Result<Sid> {
    tokens
        .next()
        .ok_or(ProtocolError::Malformed(what))
        .and_then(|t| Sid::from_str(t).map_err(|_| ProtocolError::InvalidSid))
}

/// Status severity digit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational success.
    Success,
    /// Recoverable error; the session continues.
    Recoverable,
    /// Fatal error; the sender will close the connection.
    Fatal,
}

/// `STA` — status/error report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// Severity digit.
    pub sev: Severity,
    /// Two-digit error code (see the ADC specification; 23 bad
    /// password, 24 nick taken, 26 registered only, 27 PID mismatch,
    /// 30 banned, 41 unsupported feature, 44 invalid state).
    pub code: u8,
    /// Human-readable description.
    pub msg: String,
}

impl Status {
    /// Success status with a message.
    #[must_use]
    pub fn ok(msg: &str) -> Status {
        Status { sev: Severity::Success, code: 0, msg: msg.to_string() }
    }

    /// Fatal status with the given code.
    #[must_use]
    pub fn fatal(code: u8, msg: &str) -> Status {
        Status { sev: Severity::Fatal, code, msg: msg.to_string() }
    }

    /// Decode from a `STA` packet.
    pub fn decode(p: &Packet) -> Result<Status> {
        let mut fields = p.fields();
        let code = fields.next().ok_or(ProtocolError::Malformed("STA without code"))?;
        if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::Malformed("STA code must be three digits"));
        }
        let sev = match code.as_bytes()[0] {
            b'0' => Severity::Success,
            b'1' => Severity::Recoverable,
            b'2' => Severity::Fatal,
            _ => return Err(ProtocolError::Malformed("STA severity out of range")),
        };
        let num: u8 = code[1..].parse().map_err(|_| ProtocolError::InvalidNumber("STA"))?;
        let msg = fields.next().map(unescape).transpose()?.unwrap_or_default();
        Ok(Status { sev, code: num, msg })
    }

    /// Encode into a packet of the given kind.
    #[must_use]
    pub fn to_packet(&self, kind: PacketKind) -> Packet {
        let sev = match self.sev {
            Severity::Success => 0,
            Severity::Recoverable => 1,
            Severity::Fatal => 2,
        };
        let code = format!("{sev}{:02}", self.code);
        Packet::from_fields(kind, CMD_STA, &[&code, &self.msg])
    }
}

/// `GPA` — hub requests a password proof for the given nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetPassword {
    /// Random nonce bytes (base32 on the wire).
    pub nonce: Vec<u8>,
}

impl GetPassword {
    /// Decode from a `GPA` packet.
    pub fn decode(p: &Packet) -> Result<GetPassword> {
        let f = p.fields().next().ok_or(ProtocolError::Malformed("GPA without data"))?;
        let nonce =
            BASE32_NOPAD.decode(f.as_bytes()).map_err(|_| ProtocolError::Malformed("GPA data"))?;
        Ok(GetPassword { nonce })
    }

    /// Encode as an `IGPA` packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        Packet::from_fields(PacketKind::Info, CMD_GPA, &[&BASE32_NOPAD.encode(&self.nonce)])
    }
}

/// `PAS` — client's password proof: `Tiger(password || nonce)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Password {
    /// Proof digest bytes (base32 on the wire).
    pub proof: Vec<u8>,
}

impl Password {
    /// Decode from a `PAS` packet.
    pub fn decode(p: &Packet) -> Result<Password> {
        let f = p.fields().next().ok_or(ProtocolError::Malformed("PAS without data"))?;
        let proof =
            BASE32_NOPAD.decode(f.as_bytes()).map_err(|_| ProtocolError::Malformed("PAS data"))?;
        Ok(Password { proof })
    }

    /// Encode as an `HPAS` packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        Packet::from_fields(PacketKind::Hub, CMD_PAS, &[&BASE32_NOPAD.encode(&self.proof)])
    }
}

/// `MSG` — chat or private message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMsg {
    /// Message text.
    pub text: String,
    /// `ME1` — action flag.
    pub me: bool,
    /// `PM<sid>` — private-message group (the sender's own SID for
    /// plain PMs).
    pub pm: Option<Sid>,
}

impl ChatMsg {
    /// Decode from an `MSG` packet.
    pub fn decode(p: &Packet) -> Result<ChatMsg> {
        let mut fields = p.fields();
        let text = fields.next().map(unescape).transpose()?.unwrap_or_default();
        let mut msg = ChatMsg { text, me: false, pm: None };
        for f in fields {
            let f = unescape(f)?;
            if let Some(v) = f.strip_prefix("ME") {
                msg.me = v == "1";
            } else if let Some(v) = f.strip_prefix("PM") {
                msg.pm = Some(v.parse()?);
            }
        }
        Ok(msg)
    }

    /// Encode into a packet of the given kind.
    #[must_use]
    pub fn to_packet(&self, kind: PacketKind) -> Packet {
        let mut fields: Vec<String> = vec![escape(&self.text)];
        if self.me {
            fields.push("ME1".to_string());
        }
        if let Some(pm) = self.pm {
            fields.push(format!("PM{}", pm.to_adc()));
        }
        let body = fields.join(" ");
        Packet { kind, cmd: CMD_MSG, body }
    }
}

/// `QUI` — a session left (or is being told to leave).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quit {
    /// Session that left.
    pub sid: Sid,
    /// `MS` — message shown to the user.
    pub message: Option<String>,
    /// `RD` — address to redirect to.
    pub redirect: Option<String>,
    /// `DI1` — the user is asked to disconnect (kick).
    pub disconnect: bool,
}

impl Quit {
    /// Plain leave notification.
    #[must_use]
    pub fn new(sid: Sid) -> Quit {
        Quit { sid, message: None, redirect: None, disconnect: false }
    }

    /// Decode from a `QUI` packet.
    pub fn decode(p: &Packet) -> Result<Quit> {
        let mut fields = p.fields();
        let sid = fields.next().ok_or(ProtocolError::Malformed("QUI without sid"))?.parse()?;
        let mut q = Quit::new(sid);
        for f in fields {
            let f = unescape(f)?;
            if let Some(v) = f.strip_prefix("MS") {
                q.message = Some(v.to_string());
            } else if let Some(v) = f.strip_prefix("RD") {
                q.redirect = Some(v.to_string());
            } else if f == "DI1" {
                q.disconnect = true;
            }
        }
        Ok(q)
    }

    /// Encode as an `IQUI` packet.
    #[must_use]
    pub fn to_packet(&self) -> Packet {
        let mut fields: Vec<String> = vec![self.sid.to_adc()];
        if let Some(m) = &self.message {
            fields.push(format!("MS{}", escape(m)));
        }
        if let Some(r) = &self.redirect {
            fields.push(format!("RD{}", escape(r)));
        }
        if self.disconnect {
            fields.push("DI1".to_string());
        }
        let body = fields.join(" ");
        Packet { kind: PacketKind::Info, cmd: CMD_QUI, body }
    }
}

/// `CTM` — request the target to connect to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectToMe {
    /// Transfer protocol, `ADC/1.0` or `ADCS/0.10` for TLS.
    pub proto: String,
    /// TCP port the sender listens on.
    pub port: u16,
    /// Opaque token echoed back on the transfer connection.
    pub token: String,
}

impl ConnectToMe {
    /// Decode from a `CTM` packet.
    pub fn decode(p: &Packet) -> Result<ConnectToMe> {
        let mut fields = p.fields();
        let proto = fields
            .next()
            .map(unescape)
            .transpose()?
            .ok_or(ProtocolError::Malformed("CTM without protocol"))?;
        let port = fields.next().ok_or(ProtocolError::Malformed("CTM without port"))?;
        let port = parse_num(port, "CTM port")?;
        let token = fields.next().map(unescape).transpose()?.unwrap_or_default();
        Ok(ConnectToMe { proto, port, token })
    }

    /// Encode into a packet of the given kind.
    #[must_use]
    pub fn to_packet(&self, kind: PacketKind) -> Packet {
        Packet::from_fields(kind, CMD_CTM, &[&self.proto, &self.port.to_string(), &self.token])
    }
}

/// `RCM` — passive peer asks the target to connect back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevConnectToMe {
    /// Transfer protocol.
    pub proto: String,
    /// Opaque token.
    pub token: String,
}

impl RevConnectToMe {
    /// Decode from an `RCM` packet.
    pub fn decode(p: &Packet) -> Result<RevConnectToMe> {
        let mut fields = p.fields();
        let proto = fields
            .next()
            .map(unescape)
            .transpose()?
            .ok_or(ProtocolError::Malformed("RCM without protocol"))?;
        let token = fields.next().map(unescape).transpose()?.unwrap_or_default();
        Ok(RevConnectToMe { proto, token })
    }

    /// Encode into a packet of the given kind.
    #[must_use]
    pub fn to_packet(&self, kind: PacketKind) -> Packet {
        Packet::from_fields(kind, CMD_RCM, &[&self.proto, &self.token])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(p: &Packet) {
        let mut line = String::new();
        p.encode(&mut line).expect("encode");
        assert!(line.ends_with('\n'));
        let parsed = Packet::decode(&line[..line.len() - 1]).expect("decode");
        assert_eq!(&parsed, p);
    }

    #[test]
    fn escape_round_trip() {
        let s = "with space\nand\\slash";
        assert_eq!(unescape(&escape(s)).unwrap(), s);
    }

    #[test]
    fn unescape_rejects_dangling() {
        assert!(unescape("oops\\").is_err());
        assert!(unescape("bad\\q").is_err());
    }

    #[test]
    fn hub_packet_decode() {
        let p = Packet::decode("HSUP ADBASE ADTIGR").unwrap();
        assert_eq!(p.kind, PacketKind::Hub);
        assert_eq!(p.cmd_str(), "SUP");
        let sup = Supported::decode(&p).unwrap();
        assert!(sup.add.has("BASE"));
        assert!(sup.add.has("TIGR"));
        assert!(sup.remove.is_empty());
    }

    #[test]
    fn broadcast_round_trip() {
        let p = Packet::from_fields(
            PacketKind::Broadcast { from: Sid::new(0x1234) },
            CMD_MSG,
            &["hello world"],
        );
        round_trip(&p);
    }

    #[test]
    fn direct_routing_fields() {
        let from = Sid::new(10);
        let to = Sid::new(20);
        let p = Packet::from_fields(PacketKind::Direct { from, to }, CMD_MSG, &["psst"]);
        assert_eq!(p.kind.source(), Some(from));
        assert_eq!(p.kind.target(), Some(to));
        round_trip(&p);
    }

    #[test]
    fn feature_broadcast_selectors() {
        let from = Sid::new(3);
        let line = format!("FSCH {} +TCP4 -NAT0 ANiso", from.to_adc());
        let p = Packet::decode(&line).unwrap();
        let PacketKind::Feature { sel, .. } = &p.kind else { panic!("{p:?}") };
        assert_eq!(sel.len(), 2);
        assert!(sel[0].require);
        assert_eq!(sel[0].tag, "TCP4");
        assert!(!sel[1].require);
        assert_eq!(p.body, "ANiso");
        round_trip(&p);
    }

    #[test]
    fn inf_round_trip() {
        let mut u = UserInfo {
            nick: Some("alice".to_string()),
            desc: Some("hi there".to_string()),
            share: Some(1024),
            slots: Some(3),
            ..UserInfo::default()
        };
        u.features = Features::from_iter(["SEGA", "TCP4"]);
        let p = u.to_packet(PacketKind::Broadcast { from: Sid::new(1) });
        let back = UserInfo::decode(&p).unwrap();
        assert_eq!(back, u);
    }

    #[test]
    fn inf_rejects_truncated_field() {
        let p = Packet::decode("BINF AAAB N").unwrap();
        assert!(UserInfo::decode(&p).is_err());
    }

    #[test]
    fn status_round_trip() {
        let st = Status::fatal(41, "TIGR is required");
        let p = st.to_packet(PacketKind::Info);
        let mut line = String::new();
        p.encode(&mut line).unwrap();
        assert!(line.starts_with("ISTA 241 TIGR\\sis\\srequired"), "{line:?}");
        assert_eq!(Status::decode(&p).unwrap(), st);
    }

    #[test]
    fn chat_msg_flags() {
        let m = ChatMsg { text: "waves at you".to_string(), me: true, pm: Some(Sid::new(7)) };
        let p = m.to_packet(PacketKind::Direct { from: Sid::new(7), to: Sid::new(9) });
        assert_eq!(ChatMsg::decode(&p).unwrap(), m);
    }

    #[test]
    fn quit_with_redirect() {
        let q = Quit {
            sid: Sid::new(5),
            message: Some("moved".to_string()),
            redirect: Some("adcs://example.org:411".to_string()),
            disconnect: false,
        };
        let p = q.to_packet();
        assert_eq!(Quit::decode(&p).unwrap(), q);
    }

    #[test]
    fn password_proof_base32() {
        let gp = GetPassword { nonce: vec![1, 2, 3, 4, 5] };
        let p = gp.to_packet();
        assert_eq!(GetPassword::decode(&p).unwrap(), gp);
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(matches!(Packet::decode("XCMD foo"), Err(ProtocolError::UnknownKind('X'))));
    }
}
