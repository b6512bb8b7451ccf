//! Chat command bus.
//!
//! Chat lines starting with `!` or `+` are parsed as `<cmd> <args...>`
//! and dispatched to a registered handler before any broadcast happens.
//! Handlers run synchronously on the sender's connection task and reply
//! through `hub_chat_msg`. Unknown commands get a hub reply instead of
//! leaking into chat.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::HubError;
use crate::hub::Hub;
use crate::peer::PeerRef;

/// Prefixes that mark a chat line as a command.
pub const PREFIXES: &[char] = &['!', '+'];

/// Handler signature. `args` is the raw remainder after the command
/// name, leading whitespace stripped.
pub type Handler = Box<dyn Fn(&Hub, &PeerRef, &str) -> Result<(), HubError> + Send + Sync>;

/// A registered chat command.
pub struct Command {
    /// Primary name, without prefix.
    pub name: &'static str,
    /// Alternate names.
    pub aliases: &'static [&'static str],
    /// One-line help text.
    pub summary: &'static str,
    /// Whether only operators may run it.
    pub op_only: bool,
    handler: Handler,
}

/// The command table. The set of commands is an external collaborator;
/// this is only the dispatch glue plus a few built-ins.
#[derive(Default)]
pub struct CommandRegistry {
    cmds: RwLock<HashMap<&'static str, Arc<Command>>>,
}

impl CommandRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> CommandRegistry {
        CommandRegistry::default()
    }

    /// Register a command under its name and aliases.
    pub fn register(
        &self,
        name: &'static str,
        aliases: &'static [&'static str],
        summary: &'static str,
        op_only: bool,
        handler: Handler,
    ) {
        let cmd = Arc::new(Command { name, aliases, summary, op_only, handler });
        let mut cmds = self.cmds.write().expect("command lock poisoned");
        cmds.insert(name, Arc::clone(&cmd));
        for alias in aliases {
            cmds.insert(alias, Arc::clone(&cmd));
        }
    }

    /// All registered commands, deduplicated, sorted by name.
    pub fn list(&self) -> Vec<Arc<Command>> {
        let cmds = self.cmds.read().expect("command lock poisoned");
        let mut out: Vec<Arc<Command>> = Vec::new();
        for c in cmds.values() {
            if !out.iter().any(|o| o.name == c.name) {
                out.push(Arc::clone(c));
            }
        }
        out.sort_by_key(|c| c.name);
        out
    }

    /// Try to treat `text` as a command line.
    ///
    /// Returns `true` when the line was consumed (it had a command
    /// prefix), whether or not the command existed.
    pub fn dispatch(&self, hub: &Hub, peer: &PeerRef, text: &str) -> bool {
        let Some(rest) = text.strip_prefix(PREFIXES) else {
            return false;
        };
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((n, a)) => (n, a.trim_start()),
            None => (rest, ""),
        };
        if name.is_empty() {
            return false;
        }
        let cmd = {
            let cmds = self.cmds.read().expect("command lock poisoned");
            cmds.get(name).cloned()
        };
        let Some(cmd) = cmd else {
            hub.send_hub_msg_to(peer, &format!("unknown command: {name}"));
            return true;
        };
        if cmd.op_only && !is_op(hub, peer) {
            hub.send_hub_msg_to(peer, &format!("{name}: operators only"));
            return true;
        }
        if let Err(e) = (cmd.handler)(hub, peer, args) {
            tracing::info!(cmd = cmd.name, from = %peer.name(), "command failed: {e}");
            hub.send_hub_msg_to(peer, &format!("{name}: {e}"));
        }
        true
    }
}

fn is_op(hub: &Hub, peer: &PeerRef) -> bool {
    hub.is_op(peer)
}

/// Register the built-in command set.
pub fn register_builtins(reg: &CommandRegistry) {
    reg.register("help", &["h"], "list available commands", false, Box::new(help));
    reg.register("users", &[], "online user count and share total", false, Box::new(users));
    reg.register("uptime", &[], "hub uptime", false, Box::new(uptime));
    reg.register("motd", &[], "show the message of the day", false, Box::new(motd));
    reg.register("me", &[], "action message: !me <text>", false, Box::new(me));
    reg.register("join", &[], "join a named room: !join <room>", false, Box::new(join));
    reg.register("leave", &[], "leave a named room: !leave <room>", false, Box::new(leave));
    reg.register("pm", &["msg"], "private message: !pm <nick> <text>", false, Box::new(pm));
    reg.register("kick", &[], "disconnect a user: !kick <nick>", true, Box::new(kick));
}

fn help(hub: &Hub, peer: &PeerRef, _args: &str) -> Result<(), HubError> {
    let mut lines = vec!["available commands:".to_string()];
    for cmd in hub.commands().list() {
        if cmd.op_only && !is_op(hub, peer) {
            continue;
        }
        lines.push(format!("  !{} - {}", cmd.name, cmd.summary));
    }
    hub.send_hub_msg_to(peer, &lines.join("\n"));
    Ok(())
}

fn users(hub: &Hub, peer: &PeerRef, _args: &str) -> Result<(), HubError> {
    let reply = format!(
        "{} users online, sharing {}",
        hub.roster().len(),
        crate::motd::human_size(hub.total_share()),
    );
    hub.send_hub_msg_to(peer, &reply);
    Ok(())
}

fn uptime(hub: &Hub, peer: &PeerRef, _args: &str) -> Result<(), HubError> {
    let reply = format!("up {}", crate::motd::human_duration(hub.uptime().as_secs()));
    hub.send_hub_msg_to(peer, &reply);
    Ok(())
}

fn motd(hub: &Hub, peer: &PeerRef, _args: &str) -> Result<(), HubError> {
    match hub.motd_for(peer) {
        Some(text) => hub.send_hub_msg_to(peer, &text),
        None => hub.send_hub_msg_to(peer, "no message of the day"),
    }
    Ok(())
}

fn me(hub: &Hub, peer: &PeerRef, args: &str) -> Result<(), HubError> {
    // Action messages skip command dispatch, so this cannot recurse.
    hub.handle_chat(peer, args.to_string(), true);
    Ok(())
}

fn join(hub: &Hub, peer: &PeerRef, args: &str) -> Result<(), HubError> {
    let name = args.trim();
    if name.is_empty() || name == "#" {
        return Err(HubError::Handshake("usage: !join <room>".to_string()));
    }
    let room = hub.room_or_create(name);
    room.join(peer)?;
    Ok(())
}

fn leave(hub: &Hub, peer: &PeerRef, args: &str) -> Result<(), HubError> {
    let name = args.trim();
    match hub.room(name) {
        Some(room) => {
            room.leave(peer);
            hub.drop_room_if_empty(name);
            Ok(())
        },
        None => Err(HubError::Handshake(format!("no such room: {name}"))),
    }
}

fn pm(hub: &Hub, peer: &PeerRef, args: &str) -> Result<(), HubError> {
    let Some((nick, text)) = args.split_once(char::is_whitespace) else {
        return Err(HubError::Handshake("usage: !pm <nick> <text>".to_string()));
    };
    hub.handle_private(peer, nick, text.trim_start().to_string(), false);
    Ok(())
}

fn kick(hub: &Hub, peer: &PeerRef, args: &str) -> Result<(), HubError> {
    let nick = args.trim();
    let Some(target) = hub.roster().by_name(nick) else {
        return Err(HubError::Handshake(format!("no such user: {nick}")));
    };
    hub.broadcast_hub_msg(&format!("{} was kicked by {}", target.name(), peer.name()));
    hub.disconnect_peer(&target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_parse() {
        // Only the prefix split logic; dispatch needs a hub and is
        // covered by integration tests.
        let line = "!pm bob hello there";
        let rest = line.strip_prefix(PREFIXES).unwrap();
        let (name, args) = rest.split_once(char::is_whitespace).unwrap();
        assert_eq!(name, "pm");
        assert_eq!(args, "bob hello there");
    }

    #[test]
    fn plus_prefix_also_matches() {
        assert!("+help".strip_prefix(PREFIXES).is_some());
        assert!("help".strip_prefix(PREFIXES).is_none());
    }
}
