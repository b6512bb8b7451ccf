//! Hub configuration: typed getters/setters for the built-in keys, a
//! generic map for everything else, and the `hub.yml` bootstrap.
//!
//! Built-in keys back onto dedicated fields so hot-path reads (the
//! global-chat flag is checked on every chat message) are a field load
//! under a short read lock. Unknown keys land in a copy-on-write map.
//! A fixed list of *ignored* keys may be set from the config file only;
//! live mutation of them is silently dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Hub display name.
pub const CONFIG_HUB_NAME: &str = "hub.name";
/// Hub description.
pub const CONFIG_HUB_DESC: &str = "hub.desc";
/// Hub topic.
pub const CONFIG_HUB_TOPIC: &str = "hub.topic";
/// Hub owner.
pub const CONFIG_HUB_OWNER: &str = "hub.owner";
/// Hub website.
pub const CONFIG_HUB_WEBSITE: &str = "hub.website";
/// Hub contact e-mail.
pub const CONFIG_HUB_EMAIL: &str = "hub.email";
/// Message of the day template.
pub const CONFIG_HUB_MOTD: &str = "hub.motd";
/// Registered-users-only flag.
pub const CONFIG_HUB_PRIVATE: &str = "hub.private";
/// Hub bot name.
pub const CONFIG_BOT_NAME: &str = "bot.name";
/// Hub bot description.
pub const CONFIG_BOT_DESC: &str = "bot.desc";
/// Whether global chat is relayed.
pub const CONFIG_CHAT_GLOBAL_ENABLED: &str = "chat.global.enabled";
/// Zlib level for NMDC downstream compression (0 disables).
pub const CONFIG_ZLIB_LEVEL: &str = "zlib.level";
/// Redirect plain NMDC clients to the TLS address.
pub const CONFIG_NMDC_REDIRECT_TLS: &str = "nmdc.redirect.tls";
/// Redirect NMDC clients to the ADC address.
pub const CONFIG_NMDC_REDIRECT_ADC: &str = "nmdc.redirect.adc";
/// Redirect plain ADC clients to the TLS address.
pub const CONFIG_ADC_REDIRECT_TLS: &str = "adc.redirect.tls";

/// Short aliases accepted anywhere a key is.
const ALIASES: &[(&str, &str)] = &[
    ("name", CONFIG_HUB_NAME),
    ("desc", CONFIG_HUB_DESC),
    ("topic", CONFIG_HUB_TOPIC),
    ("owner", CONFIG_HUB_OWNER),
    ("website", CONFIG_HUB_WEBSITE),
    ("email", CONFIG_HUB_EMAIL),
    ("botname", CONFIG_BOT_NAME),
    ("botdesc", CONFIG_BOT_DESC),
    ("motd", CONFIG_HUB_MOTD),
    ("private", CONFIG_HUB_PRIVATE),
];

/// Keys settable from the config file only, never by live mutation.
const IGNORED: &[&str] = &[
    "chat.encoding",
    "chat.log.join",
    "chat.log.max",
    "database.path",
    "database.type",
    "serve.host",
    "serve.port",
    "serve.tls.cert",
    "serve.tls.key",
    CONFIG_HUB_PRIVATE,
];

/// Resolve an alias to its canonical key.
#[must_use]
pub fn resolve_key(key: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map_or(key, |(_, full)| *full)
}

fn is_ignored(key: &str) -> bool {
    IGNORED.contains(&key)
}

/// A primitive configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer.
    Uint(u64),
    /// Float.
    Float(f64),
    /// String.
    Str(String),
}

impl Value {
    /// Coerce to a boolean the way a config file would.
    #[must_use]
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(v) => *v != 0,
            Value::Uint(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => s.parse().unwrap_or(false),
        }
    }

    /// Coerce to an integer.
    #[must_use]
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Bool(b) => i64::from(*b),
            Value::Int(v) => *v,
            Value::Uint(v) => *v as i64,
            Value::Float(v) => *v as i64,
            Value::Str(s) => s.parse().unwrap_or(0),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Uint(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(v) => f.write_str(v),
        }
    }
}

/// Typed fields backing the built-in keys.
#[derive(Debug, Clone)]
struct Typed {
    name: String,
    desc: String,
    topic: String,
    owner: String,
    website: String,
    email: String,
    motd: String,
    private: bool,
    bot_name: String,
    bot_desc: String,
    global_chat: bool,
    zlib_level: i64,
    redirect_nmdc_tls: bool,
    redirect_nmdc_adc: bool,
    redirect_adc_tls: bool,
}

impl Default for Typed {
    fn default() -> Self {
        Typed {
            name: "DCHub".to_string(),
            desc: "Hybrid hub".to_string(),
            topic: String::new(),
            owner: String::new(),
            website: String::new(),
            email: String::new(),
            motd: String::new(),
            private: false,
            bot_name: "hub".to_string(),
            bot_desc: String::new(),
            global_chat: true,
            zlib_level: 0,
            redirect_nmdc_tls: false,
            redirect_nmdc_adc: false,
            redirect_adc_tls: false,
        }
    }
}

/// Live hub configuration.
pub struct Config {
    typed: RwLock<Typed>,
    extra: RwLock<HashMap<String, Value>>,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// Configuration with built-in defaults.
    #[must_use]
    pub fn new() -> Config {
        Config { typed: RwLock::new(Typed::default()), extra: RwLock::new(HashMap::new()) }
    }

    fn typed(&self) -> std::sync::RwLockReadGuard<'_, Typed> {
        self.typed.read().expect("config lock poisoned")
    }

    fn typed_mut(&self) -> std::sync::RwLockWriteGuard<'_, Typed> {
        self.typed.write().expect("config lock poisoned")
    }

    /// Get a value by key or alias.
    pub fn get(&self, key: &str) -> Option<Value> {
        let key = resolve_key(key);
        let t = self.typed();
        let v = match key {
            CONFIG_HUB_NAME => Value::Str(t.name.clone()),
            CONFIG_HUB_DESC => Value::Str(t.desc.clone()),
            CONFIG_HUB_TOPIC => Value::Str(t.topic.clone()),
            CONFIG_HUB_OWNER => Value::Str(t.owner.clone()),
            CONFIG_HUB_WEBSITE => Value::Str(t.website.clone()),
            CONFIG_HUB_EMAIL => Value::Str(t.email.clone()),
            CONFIG_HUB_MOTD => Value::Str(t.motd.clone()),
            CONFIG_HUB_PRIVATE => Value::Bool(t.private),
            CONFIG_BOT_NAME => Value::Str(t.bot_name.clone()),
            CONFIG_BOT_DESC => Value::Str(t.bot_desc.clone()),
            CONFIG_CHAT_GLOBAL_ENABLED => Value::Bool(t.global_chat),
            CONFIG_ZLIB_LEVEL => Value::Int(t.zlib_level),
            CONFIG_NMDC_REDIRECT_TLS => Value::Bool(t.redirect_nmdc_tls),
            CONFIG_NMDC_REDIRECT_ADC => Value::Bool(t.redirect_nmdc_adc),
            CONFIG_ADC_REDIRECT_TLS => Value::Bool(t.redirect_adc_tls),
            _ => {
                drop(t);
                return self.extra.read().expect("config lock poisoned").get(key).cloned();
            },
        };
        Some(v)
    }

    /// Set a value by key or alias. Ignored keys are dropped unless
    /// `from_file` is set (the bootstrap path).
    pub fn set(&self, key: &str, value: Value, from_file: bool) {
        let key = resolve_key(key);
        if !from_file && is_ignored(key) {
            return;
        }
        let mut t = self.typed_mut();
        match key {
            CONFIG_HUB_NAME => t.name = value.to_string(),
            CONFIG_HUB_DESC => t.desc = value.to_string(),
            CONFIG_HUB_TOPIC => t.topic = value.to_string(),
            CONFIG_HUB_OWNER => t.owner = value.to_string(),
            CONFIG_HUB_WEBSITE => t.website = value.to_string(),
            CONFIG_HUB_EMAIL => t.email = value.to_string(),
            CONFIG_HUB_MOTD => t.motd = value.to_string(),
            CONFIG_HUB_PRIVATE => t.private = value.as_bool(),
            CONFIG_BOT_NAME => t.bot_name = value.to_string(),
            CONFIG_BOT_DESC => t.bot_desc = value.to_string(),
            CONFIG_CHAT_GLOBAL_ENABLED => t.global_chat = value.as_bool(),
            CONFIG_ZLIB_LEVEL => t.zlib_level = value.as_int(),
            CONFIG_NMDC_REDIRECT_TLS => t.redirect_nmdc_tls = value.as_bool(),
            CONFIG_NMDC_REDIRECT_ADC => t.redirect_nmdc_adc = value.as_bool(),
            CONFIG_ADC_REDIRECT_TLS => t.redirect_adc_tls = value.as_bool(),
            _ => {
                drop(t);
                self.extra
                    .write()
                    .expect("config lock poisoned")
                    .insert(key.to_string(), value);
            },
        }
    }

    /// All known keys, built-in first, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = [
            CONFIG_HUB_NAME,
            CONFIG_HUB_DESC,
            CONFIG_HUB_TOPIC,
            CONFIG_HUB_MOTD,
            CONFIG_HUB_OWNER,
            CONFIG_HUB_WEBSITE,
            CONFIG_HUB_EMAIL,
            CONFIG_BOT_NAME,
            CONFIG_BOT_DESC,
            CONFIG_HUB_PRIVATE,
            CONFIG_CHAT_GLOBAL_ENABLED,
            CONFIG_ZLIB_LEVEL,
            CONFIG_NMDC_REDIRECT_TLS,
            CONFIG_NMDC_REDIRECT_ADC,
            CONFIG_ADC_REDIRECT_TLS,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        for k in self.extra.read().expect("config lock poisoned").keys() {
            if !is_ignored(k) {
                keys.push(k.clone());
            }
        }
        keys.sort();
        keys
    }

    /// Copy-on-write snapshot of every key and value.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for key in self.keys() {
            if let Some(v) = self.get(&key) {
                out.insert(key, v);
            }
        }
        out
    }

    // Typed accessors for the hot paths.

    /// Hub display name.
    pub fn name(&self) -> String {
        self.typed().name.clone()
    }

    /// Hub description.
    pub fn desc(&self) -> String {
        self.typed().desc.clone()
    }

    /// Hub topic.
    pub fn topic(&self) -> String {
        self.typed().topic.clone()
    }

    /// MOTD template text.
    pub fn motd(&self) -> String {
        self.typed().motd.clone()
    }

    /// Registered-users-only flag.
    pub fn is_private(&self) -> bool {
        self.typed().private
    }

    /// Bot name used for hub messages.
    pub fn bot_name(&self) -> String {
        self.typed().bot_name.clone()
    }

    /// Whether global chat is relayed.
    pub fn global_chat_enabled(&self) -> bool {
        self.typed().global_chat
    }

    /// NMDC downstream compression level, 0 to disable.
    pub fn zlib_level(&self) -> u32 {
        self.typed().zlib_level.clamp(0, 9) as u32
    }

    /// `nmdc.redirect.tls`.
    pub fn redirect_nmdc_tls(&self) -> bool {
        self.typed().redirect_nmdc_tls
    }

    /// `nmdc.redirect.adc`.
    pub fn redirect_nmdc_adc(&self) -> bool {
        self.typed().redirect_nmdc_adc
    }

    /// `adc.redirect.tls`.
    pub fn redirect_adc_tls(&self) -> bool {
        self.typed().redirect_adc_tls
    }

    /// Merge a nested YAML mapping (the config file) into the live
    /// config, flattening nested maps into dotted keys.
    pub fn merge_file_map(&self, map: &serde_yaml::Mapping) {
        self.merge_path("", map);
    }

    fn merge_path(&self, path: &str, map: &serde_yaml::Mapping) {
        for (k, v) in map {
            let Some(k) = k.as_str() else { continue };
            let key = if path.is_empty() { k.to_string() } else { format!("{path}.{k}") };
            match v {
                serde_yaml::Value::Mapping(m) => self.merge_path(&key, m),
                serde_yaml::Value::Bool(b) => self.set(&key, Value::Bool(*b), true),
                serde_yaml::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        self.set(&key, Value::Int(i), true);
                    } else if let Some(u) = n.as_u64() {
                        self.set(&key, Value::Uint(u), true);
                    } else if let Some(f) = n.as_f64() {
                        self.set(&key, Value::Float(f), true);
                    }
                },
                serde_yaml::Value::String(s) => self.set(&key, Value::Str(s.clone()), true),
                _ => {},
            }
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config").field("name", &self.typed().name).finish()
    }
}

/// `hub.yml` contents.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    /// `hub:` section.
    pub hub: HubSection,
    /// `bot:` section.
    pub bot: BotSection,
    /// `serve:` section.
    pub serve: ServeSection,
    /// `chat:` section.
    pub chat: ChatSection,
}

/// `hub:` section of `hub.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSection {
    /// Display name.
    pub name: String,
    /// Description.
    pub desc: String,
    /// Owner.
    pub owner: String,
    /// Website.
    pub website: String,
    /// Contact e-mail.
    pub email: String,
    /// MOTD file name.
    pub motd: String,
    /// Registered users only.
    pub private: bool,
}

impl Default for HubSection {
    fn default() -> Self {
        HubSection {
            name: "DCHub".to_string(),
            desc: "Hybrid hub".to_string(),
            owner: String::new(),
            website: String::new(),
            email: String::new(),
            motd: "motd.txt".to_string(),
            private: false,
        }
    }
}

/// `bot:` section of `hub.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotSection {
    /// Bot nick.
    pub name: String,
    /// Bot description.
    pub desc: String,
}

impl Default for BotSection {
    fn default() -> Self {
        BotSection { name: "hub".to_string(), desc: String::new() }
    }
}

/// `serve:` section of `hub.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServeSection {
    /// Host to advertise.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Advertised TLS `host:port` when a TLS terminator runs in front
    /// of the hub.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_addr: Option<String>,
}

impl Default for ServeSection {
    fn default() -> Self {
        ServeSection { host: "127.0.0.1".to_string(), port: 1411, tls_addr: None }
    }
}

/// `chat:` section of `hub.yml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSection {
    /// Fallback text encoding for NMDC (e.g. `cp1251`).
    pub encoding: String,
    /// Chat log settings.
    pub log: ChatLogSection,
}

impl Default for ChatSection {
    fn default() -> Self {
        ChatSection { encoding: String::new(), log: ChatLogSection::default() }
    }
}

/// `chat.log:` subsection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatLogSection {
    /// Ring buffer capacity.
    pub max: usize,
    /// Messages replayed on join.
    pub join: usize,
}

impl Default for ChatLogSection {
    fn default() -> Self {
        ChatLogSection { max: 50, join: 10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve() {
        let conf = Config::new();
        conf.set("name", Value::Str("TestHub".to_string()), false);
        assert_eq!(conf.name(), "TestHub");
        assert_eq!(conf.get(CONFIG_HUB_NAME), Some(Value::Str("TestHub".to_string())));
        assert_eq!(conf.get("name"), Some(Value::Str("TestHub".to_string())));
    }

    #[test]
    fn ignored_keys_reject_live_mutation() {
        let conf = Config::new();
        conf.set(CONFIG_HUB_PRIVATE, Value::Bool(true), false);
        assert!(!conf.is_private(), "live mutation of an ignored key must be dropped");
        conf.set(CONFIG_HUB_PRIVATE, Value::Bool(true), true);
        assert!(conf.is_private(), "file bootstrap may set ignored keys");
    }

    #[test]
    fn unknown_keys_stored_generically() {
        let conf = Config::new();
        conf.set("plugin.greeting", Value::Str("hello".to_string()), false);
        assert_eq!(conf.get("plugin.greeting"), Some(Value::Str("hello".to_string())));
        assert!(conf.keys().contains(&"plugin.greeting".to_string()));
    }

    #[test]
    fn zlib_level_clamped() {
        let conf = Config::new();
        conf.set(CONFIG_ZLIB_LEVEL, Value::Int(42), false);
        assert_eq!(conf.zlib_level(), 9);
    }

    #[test]
    fn snapshot_is_isolated() {
        let conf = Config::new();
        conf.set("name", Value::Str("Before".to_string()), false);
        let snap = conf.snapshot();
        conf.set("name", Value::Str("After".to_string()), false);
        assert_eq!(snap.get(CONFIG_HUB_NAME), Some(&Value::Str("Before".to_string())));
        assert_eq!(conf.name(), "After");
    }

    #[test]
    fn yaml_merge_flattens_nested_maps() {
        let conf = Config::new();
        let yaml = "
hub:
  name: MergedHub
  private: true
chat:
  global:
    enabled: false
custom:
  depth: 3
";
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        conf.merge_file_map(value.as_mapping().unwrap());
        assert_eq!(conf.name(), "MergedHub");
        assert!(conf.is_private());
        assert!(!conf.global_chat_enabled());
        assert_eq!(conf.get("custom.depth"), Some(Value::Int(3)));
    }

    #[test]
    fn file_config_round_trip() {
        let fc = FileConfig::default();
        let yaml = serde_yaml::to_string(&fc).unwrap();
        let back: FileConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.hub.name, fc.hub.name);
        assert_eq!(back.chat.log.max, 50);
        assert_eq!(back.serve.port, 1411);
    }
}
