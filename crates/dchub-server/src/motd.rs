//! Message-of-the-day rendering.
//!
//! The MOTD template supports `%[NAME]` substitutions for the joining
//! user and hub-wide stats. Share sizes are rendered human-readable.

use crate::hub::Hub;
use crate::peer::{Peer, PeerRef};

/// Render a byte count as a human-readable size.
#[must_use]
pub fn human_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Render a duration in seconds as `1d 2h 3m 4s`.
#[must_use]
pub fn human_duration(mut secs: u64) -> String {
    let days = secs / 86_400;
    secs %= 86_400;
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;
    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if hours > 0 || days > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if mins > 0 || hours > 0 || days > 0 {
        out.push_str(&format!("{mins}m "));
    }
    out.push_str(&format!("{secs}s"));
    out
}

/// Apply the `%[...]` substitutions for one joining peer.
#[must_use]
pub fn render(template: &str, hub: &Hub, peer: &PeerRef) -> String {
    let user = peer.user_info();
    let mut out = template.to_string();
    for (key, value) in [
        ("%[USER_NAME]", peer.name()),
        ("%[USER_ADDR]", peer.remote_addr().ip().to_string()),
        ("%[USER_SHARE]", human_size(user.share)),
        ("%[HUB_NAME]", hub.config().name()),
        ("%[HUB_USERS]", hub.roster().len().to_string()),
        ("%[HUB_SHARE]", human_size(hub.total_share())),
        ("%[HUB_UPTIME]", human_duration(hub.uptime().as_secs())),
    ] {
        out = out.replace(key, &value);
    }
    out
}

/// Default template written to `motd.txt` when none exists.
pub const DEFAULT_MOTD: &str = "
 .:: Welcome %[USER_NAME] to %[HUB_NAME]

 .:: Hub information ::.

 .:: Online users: %[HUB_USERS]
 .:: Total share: %[HUB_SHARE]
 .:: Uptime: %[HUB_UPTIME]

 .:: Your information ::.

 .:: IP address: %[USER_ADDR]
 .:: Share size: %[USER_SHARE]
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn durations() {
        assert_eq!(human_duration(5), "5s");
        assert_eq!(human_duration(65), "1m 5s");
        assert_eq!(human_duration(86_400 + 3600 + 60 + 1), "1d 1h 1m 1s");
    }
}
