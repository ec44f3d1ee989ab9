//! Server descriptor and per-client configuration.
//!
//! The server descriptor is immutable and injected by the surrounding
//! bridge; the client config is filled in during connect (allocated IPv6
//! address, assigned ident username/realname). Loading these from files is
//! the caller's concern; the types are the contract.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

/// Membership-mirroring phases. When the home side drives IRC membership
/// for a phase, idle disconnection is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPhase {
    /// Bulk join performed when a bridged room first syncs.
    Initial,
    /// Joins/parts mirrored as home-side membership changes.
    Incremental,
}

/// Per-phase membership mirror policy.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MirrorPolicy {
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub incremental: bool,
}

/// Immutable descriptor of one IRC network the bridge connects to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Domain name of the IRC server.
    pub domain: String,

    /// Port to connect on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Default server password applied to clients without their own.
    #[serde(default)]
    pub password: Option<String>,

    /// Desired-nick template. `$DISPLAY`, `$USERID` and `$LOCALPART` are
    /// substituted from the home identity.
    #[serde(default = "default_nick_template")]
    pub nick_template: String,

    /// User modes set on connect for non-bot sessions (e.g. `+R`).
    #[serde(default)]
    pub user_modes: String,

    /// Seconds of inactivity before a non-bot session is disconnected.
    /// 0 disables idle disconnection.
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Outbound actions older than this many seconds are dropped at
    /// dispatch time. 0 disables expiry.
    #[serde(default)]
    pub message_expiry_secs: u64,

    /// When set, each client connects from a unique address inside this
    /// IPv6 prefix (e.g. `2001:db8:42::`).
    #[serde(default)]
    pub ipv6_prefix: Option<String>,

    /// Membership mirror policy per phase.
    #[serde(default)]
    pub mirror: MirrorPolicy,

    /// Channels the bridge must never track (case-insensitive).
    #[serde(default)]
    pub excluded_channels: Vec<String>,

    /// Whether home-side aliases may be created dynamically for channels.
    #[serde(default)]
    pub dynamic_aliases: bool,

    /// Room ids hardcoded to specific channels in the bridge config.
    #[serde(default)]
    pub hardcoded_rooms: Vec<String>,

    /// Regex matching home-side user ids this server bridges.
    #[serde(default)]
    pub user_pattern: String,

    /// Regex matching home-side aliases this server bridges.
    #[serde(default)]
    pub alias_pattern: String,
}

fn default_port() -> u16 {
    6667
}

fn default_nick_template() -> String {
    "M-$DISPLAY".into()
}

impl ServerConfig {
    /// A descriptor with defaults for everything but the domain.
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_owned(),
            port: default_port(),
            password: None,
            nick_template: default_nick_template(),
            user_modes: String::new(),
            idle_timeout_secs: 0,
            message_expiry_secs: 0,
            ipv6_prefix: None,
            mirror: MirrorPolicy::default(),
            excluded_channels: Vec::new(),
            dynamic_aliases: false,
            hardcoded_rooms: Vec::new(),
            user_pattern: String::new(),
            alias_pattern: String::new(),
        }
    }

    /// Expand the nick template for a home identity.
    ///
    /// `$LOCALPART` is the home user id with its sigil and domain stripped;
    /// `$DISPLAY` falls back to the localpart when no display name exists.
    pub fn desired_nick(&self, user_id: &str, display_name: Option<&str>) -> String {
        let localpart = user_id
            .trim_start_matches('@')
            .split(':')
            .next()
            .unwrap_or(user_id);
        let display = display_name.filter(|d| !d.is_empty()).unwrap_or(localpart);
        self.nick_template
            .replace("$USERID", user_id)
            .replace("$LOCALPART", localpart)
            .replace("$DISPLAY", display)
    }

    /// Whether a channel is excluded from bridging (case-insensitive).
    pub fn is_excluded_channel(&self, channel: &str) -> bool {
        self.excluded_channels
            .iter()
            .any(|c| c.eq_ignore_ascii_case(channel))
    }

    /// Whether home-side membership drives IRC membership for a phase.
    pub fn mirrors_joins(&self, phase: MirrorPhase) -> bool {
        match phase {
            MirrorPhase::Initial => self.mirror.initial,
            MirrorPhase::Incremental => self.mirror.incremental,
        }
    }
}

/// Mutable per-client configuration, completed during connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    /// The nick this client wants (pre-validation).
    pub desired_nick: String,
    /// Client-specific server password; the server default applies otherwise.
    #[serde(default)]
    pub password: Option<String>,
    /// Source address allocated from the server's IPv6 prefix.
    #[serde(default)]
    pub ipv6_address: Option<Ipv6Addr>,
    /// Ident username assigned by the identity generator.
    #[serde(default)]
    pub username: Option<String>,
    /// Realname assigned by the identity generator.
    #[serde(default)]
    pub realname: Option<String>,
}

impl ClientConfig {
    pub fn new(desired_nick: &str) -> Self {
        Self {
            desired_nick: desired_nick.to_owned(),
            ..Self::default()
        }
    }
}

/// Process-level tunables, set once at bridge startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedSettings {
    /// Cap on concurrent outbound sockets across all clients.
    #[serde(default = "default_max_outbound_sockets")]
    pub max_outbound_sockets: usize,
    /// Interface the ident responder binds to, e.g. `0.0.0.0:113`.
    /// None disables the responder.
    #[serde(default)]
    pub ident_bind: Option<String>,
}

fn default_max_outbound_sockets() -> usize {
    1000
}

impl Default for AdvancedSettings {
    fn default() -> Self {
        Self {
            max_outbound_sockets: default_max_outbound_sockets(),
            ident_bind: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_nick_substitutes_display() {
        let server = ServerConfig::new("irc.example.net");
        assert_eq!(
            server.desired_nick("@alice:home.example", Some("Alice")),
            "M-Alice"
        );
    }

    #[test]
    fn desired_nick_falls_back_to_localpart() {
        let server = ServerConfig::new("irc.example.net");
        assert_eq!(server.desired_nick("@alice:home.example", None), "M-alice");
        assert_eq!(
            server.desired_nick("@alice:home.example", Some("")),
            "M-alice"
        );
    }

    #[test]
    fn desired_nick_userid_and_localpart_tokens() {
        let mut server = ServerConfig::new("irc.example.net");
        server.nick_template = "$LOCALPART[x]".into();
        assert_eq!(server.desired_nick("@bob:home.example", None), "bob[x]");

        server.nick_template = "$USERID".into();
        assert_eq!(
            server.desired_nick("@bob:home.example", None),
            "@bob:home.example"
        );
    }

    #[test]
    fn excluded_channels_are_case_insensitive() {
        let mut server = ServerConfig::new("irc.example.net");
        server.excluded_channels = vec!["#Private".into()];
        assert!(server.is_excluded_channel("#private"));
        assert!(server.is_excluded_channel("#PRIVATE"));
        assert!(!server.is_excluded_channel("#public"));
    }

    #[test]
    fn mirror_policy_per_phase() {
        let mut server = ServerConfig::new("irc.example.net");
        assert!(!server.mirrors_joins(MirrorPhase::Initial));
        server.mirror.initial = true;
        assert!(server.mirrors_joins(MirrorPhase::Initial));
        assert!(!server.mirrors_joins(MirrorPhase::Incremental));
    }

    #[test]
    fn advanced_defaults() {
        let adv = AdvancedSettings::default();
        assert_eq!(adv.max_outbound_sockets, 1000);
        assert!(adv.ident_bind.is_none());
    }

    #[test]
    fn server_config_deserializes_with_defaults() {
        let server: ServerConfig = serde_json::from_str(r#"{"domain": "irc.example.net"}"#).unwrap();
        assert_eq!(server.port, 6667);
        assert_eq!(server.nick_template, "M-$DISPLAY");
        assert_eq!(server.idle_timeout_secs, 0);
        assert!(!server.mirror.initial);
    }
}
