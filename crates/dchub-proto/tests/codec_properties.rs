//! Property tests for the wire codecs: encode/decode round-trips over
//! generated inputs, and escape-function inverses.

use dchub_proto::{adc, irc, nmdc, Sid};
use proptest::prelude::*;

/// Text that can appear in NMDC escaped fields: anything without the
/// bytes the framing forbids outright.
fn nmdc_text() -> impl Strategy<Value = String> {
    "[ -~]{0,64}".prop_map(|s| s.replace('\x00', ""))
}

/// Nick-safe text: printable, no separators used by the framing.
fn nick() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_\\-\\[\\]]{1,24}"
}

proptest! {
    #[test]
    fn nmdc_escape_round_trip(s in nmdc_text()) {
        prop_assert_eq!(nmdc::unescape(&nmdc::escape(&s)), s);
    }

    #[test]
    fn nmdc_chat_round_trip(n in nick(), text in nmdc_text(), me in any::<bool>()) {
        // "/me " at the start of a non-action message would be
        // re-parsed as an action; that normalization is documented.
        prop_assume!(!text.starts_with("/me "));
        let m = nmdc::Message::ChatMsg { nick: n, text, me };
        let mut line = String::new();
        m.encode(&mut line).unwrap();
        prop_assert!(line.ends_with('|'));
        let parsed = nmdc::Message::decode(&line[..line.len() - 1]).unwrap();
        prop_assert_eq!(parsed, m);
    }

    #[test]
    fn nmdc_private_round_trip(
        to in nick(),
        from in nick(),
        text in nmdc_text(),
    ) {
        prop_assume!(!text.starts_with("/me "));
        let m = nmdc::Message::PrivateTo {
            to,
            from: from.clone(),
            nick: from,
            text,
            me: false,
        };
        let mut line = String::new();
        m.encode(&mut line).unwrap();
        let parsed = nmdc::Message::decode(&line[..line.len() - 1]).unwrap();
        prop_assert_eq!(parsed, m);
    }

    #[test]
    fn nmdc_myinfo_round_trip(
        n in nick(),
        desc in nmdc_text(),
        email in "[a-z0-9@.]{0,20}",
        share in any::<u64>(),
        slots in 0u32..100,
    ) {
        let tag = format!("UnitTest V:1.0,M:A,H:1/0/0,S:{slots}");
        let m = nmdc::Message::MyInfo(nmdc::MyInfo {
            nick: n,
            desc,
            tag: Some(tag),
            conn: "100".to_string(),
            flag: b'\x01',
            email,
            share,
        });
        let mut line = String::new();
        m.encode(&mut line).unwrap();
        let parsed = nmdc::Message::decode(&line[..line.len() - 1]).unwrap();
        prop_assert_eq!(parsed, m);
    }

    #[test]
    fn nmdc_decode_never_panics(line in "[ -~]{0,128}") {
        let _ = nmdc::Message::decode(&line);
    }

    #[test]
    fn adc_escape_round_trip(s in "[ -~\\n]{0,64}") {
        prop_assert_eq!(adc::unescape(&adc::escape(&s)).unwrap(), s);
    }

    #[test]
    fn adc_packet_round_trip(
        sid in 0u32..(1 << 20),
        text in "[ -~]{0,64}",
    ) {
        let p = adc::Packet::from_fields(
            adc::PacketKind::Broadcast { from: Sid::new(sid) },
            adc::CMD_MSG,
            &[&text],
        );
        let mut line = String::new();
        p.encode(&mut line).unwrap();
        prop_assert!(line.ends_with('\n'));
        let parsed = adc::Packet::decode(&line[..line.len() - 1]).unwrap();
        prop_assert_eq!(parsed, p);
    }

    #[test]
    fn adc_decode_never_panics(line in "[ -~]{0,128}") {
        let _ = adc::Packet::decode(&line);
    }

    #[test]
    fn sid_round_trip(v in 0u32..(1 << 20)) {
        let sid = Sid::new(v);
        prop_assert_eq!(sid.to_adc().parse::<Sid>().unwrap(), sid);
    }

    #[test]
    fn irc_round_trip(
        n in nick(),
        target in "[#A-Za-z0-9]{1,16}",
        text in "[ -~]{1,64}",
    ) {
        prop_assume!(!text.starts_with(':') || text.contains(' '));
        let m = irc::Message::with_prefix(
            irc::Prefix::user(&n, &n, "host.local"),
            "PRIVMSG",
            vec![target, text],
        );
        let mut line = String::new();
        m.encode(&mut line).unwrap();
        let parsed = irc::Message::decode(&line[..line.len() - 2]).unwrap();
        prop_assert_eq!(parsed, m);
    }

    #[test]
    fn irc_decode_never_panics(line in "[ -~]{0,200}") {
        let _ = irc::Message::decode(&line);
    }
}
