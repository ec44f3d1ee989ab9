//! The bridged client — one virtualized IRC session standing in for one
//! home-side user.
//!
//! A session is created on demand by the surrounding bridge, connected once,
//! and replaced (never reconnected) after it dies. Public operations are
//! correlated with server replies by subscribing to the connection's event
//! stream before sending and racing the subscription against a bounded
//! timer; dropping the subscription is what removes the one-shot listener.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bridge::broker::{BridgeEvent, ClientRef, EventBroker};
use crate::bridge::config::{ClientConfig, MirrorPhase, ServerConfig};
use crate::bridge::conn::{ConnError, Connection, IrcEvent};
use crate::bridge::ident::IdentRegistry;
use crate::bridge::identity::{IdentityError, IdentityGenerator, Ipv6Allocator};
use crate::bridge::metrics;
use crate::bridge::nick::{validate_nick, NickError};
use crate::irc::message::{self, is_channel_name, Message};

/// Hard timeout for a pending nick change.
const NICK_TIMEOUT: Duration = Duration::from_secs(10);

/// Hard timeout for a NAMES request.
const NAMES_TIMEOUT: Duration = Duration::from_secs(5);

/// One round of the join timer.
const JOIN_ROUND: Duration = Duration::from_secs(15);

/// How many join rounds before giving up.
const JOIN_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Nick(#[from] NickError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Connect(#[from] ConnError),
    #[error("client already connected")]
    AlreadyConnected,
    #[error("client not connected")]
    NotConnected,
    #[error("channel '{0}' is excluded from bridging")]
    DoNotTrack(String),
    #[error("Failed to change nick: {0}")]
    NickChangeFailed(String),
    #[error("nick change timed out")]
    NickChangeTimeout,
    #[error("{0}")]
    JoinFailed(String),
    #[error("failed to join '{0}' after multiple tries")]
    JoinExhausted(String),
    #[error("names request for '{0}' timed out")]
    NamesTimeout(String),
    #[error("whois reply for '{0}' has no user")]
    WhoisNoUser(String),
    #[error("unknown action type")]
    UnknownAction,
    #[error("cacheDurationMs must be a positive integer")]
    BadCacheDuration,
}

/// Session lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fresh,
    Connecting,
    Registered,
    Failed,
    Dead,
}

/// What an outbound home-side action asks the session to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Message,
    Notice,
    Emote,
    Topic,
    /// Anything the home side invents later; always rejected at dispatch.
    #[serde(other)]
    Unknown,
}

/// An outbound action from the home side.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeAction {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub text: String,
    /// Origin timestamp (ms since epoch), drives message expiry.
    #[serde(default)]
    pub ts_ms: Option<u64>,
}

/// A resolved room descriptor: one (server, target) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcRoom {
    pub server: String,
    pub channel: String,
}

impl IrcRoom {
    pub fn new(server: &str, channel: &str) -> Self {
        Self {
            server: server.to_owned(),
            channel: channel.to_owned(),
        }
    }
}

/// A NAMES snapshot for one channel.
#[derive(Debug, Clone)]
pub struct NamesSnapshot {
    pub server: String,
    pub channel: String,
    /// Every nick present.
    pub nicks: Vec<String>,
    /// Nick → prefix string (e.g. `"@"`, `"~@"`, `""`).
    pub names: HashMap<String, String>,
}

/// A formatted WHOIS summary.
#[derive(Debug, Clone)]
pub struct WhoisSummary {
    pub server: String,
    pub nick: String,
    pub msg: String,
}

/// Operators of one channel, as captured by a transient join.
#[derive(Debug, Clone)]
pub struct OperatorsReport {
    pub server: String,
    pub channel: String,
    pub operator_nicks: Vec<String>,
}

/// Options for [`BridgedClient::get_operators`].
#[derive(Debug, Clone, Default)]
pub struct GetOperatorsOpts {
    /// Channel key for the transient join.
    pub key: Option<String>,
    /// When set, serve and store a cached snapshot valid this many ms.
    pub cache_duration_ms: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedOperators {
    report: OperatorsReport,
    expires_at: Instant,
}

/// Mutable session state behind one lock (single-writer discipline).
#[derive(Debug, Default)]
struct Session {
    nick: String,
    conn: Option<Arc<Connection>>,
    /// Set by `kill`: the raw-client handle is gone, no command may reach
    /// the wire through any stale reference. The instance itself stays so
    /// deadness remains observable.
    raw_cleared: bool,
    chan_list: HashSet<String>,
    last_action: Option<Instant>,
    idle_timer: Option<JoinHandle<()>>,
    inst_creation_failed: bool,
    explicit_disconnect: bool,
    disconnect_reason: Option<String>,
    op_cache: HashMap<String, CachedOperators>,
}

/// One per-user bridged IRC session.
pub struct BridgedClient {
    server: Arc<ServerConfig>,
    config: Mutex<ClientConfig>,
    home_user_id: Option<String>,
    display_name: Option<String>,
    is_bot: bool,
    instance_id: String,
    broker: EventBroker,
    ident: Arc<IdentRegistry>,
    identities: Arc<IdentityGenerator>,
    ipv6: Option<Arc<Ipv6Allocator>>,
    limiter: Option<Arc<Semaphore>>,
    state: Mutex<Session>,
    phase: watch::Sender<Phase>,
}

impl BridgedClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server: Arc<ServerConfig>,
        config: ClientConfig,
        home_user_id: Option<String>,
        display_name: Option<String>,
        is_bot: bool,
        broker: EventBroker,
        ident: Arc<IdentRegistry>,
        identities: Arc<IdentityGenerator>,
        ipv6: Option<Arc<Ipv6Allocator>>,
        limiter: Option<Arc<Semaphore>>,
    ) -> Arc<Self> {
        let instance_id = format!("{:04x}", rand::random::<u16>());
        let (phase, _) = watch::channel(Phase::Fresh);
        Arc::new(Self {
            server,
            config: Mutex::new(config),
            home_user_id,
            display_name,
            is_bot,
            instance_id,
            broker,
            ident,
            identities,
            ipv6,
            limiter,
            state: Mutex::new(Session::default()),
            phase,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_bot(&self) -> bool {
        self.is_bot
    }

    pub fn server_domain(&self) -> &str {
        &self.server.domain
    }

    /// The session's current effective nick.
    pub async fn nick(&self) -> String {
        self.state.lock().await.nick.clone()
    }

    /// Channels the session believes itself joined to.
    pub async fn channels(&self) -> Vec<String> {
        self.state.lock().await.chan_list.iter().cloned().collect()
    }

    /// Dead ⇔ the connect attempt failed, or the connection died.
    pub async fn is_dead(&self) -> bool {
        let s = self.state.lock().await;
        s.inst_creation_failed || s.conn.as_ref().is_some_and(|c| c.dead())
    }

    pub async fn last_disconnect_reason(&self) -> Option<String> {
        self.state.lock().await.disconnect_reason.clone()
    }

    /// How long ago the session last did something locally. None before the
    /// first activity.
    pub async fn idle_for(&self) -> Option<Duration> {
        self.state.lock().await.last_action.map(|t| t.elapsed())
    }

    /// True once local code initiated the disconnect, or the server reported
    /// a ban. Callers use this to decide against reconnecting.
    pub async fn explicitly_disconnected(&self) -> bool {
        self.state.lock().await.explicit_disconnect
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    async fn client_ref(&self) -> ClientRef {
        ClientRef {
            home_user_id: self.home_user_id.clone(),
            nick: self.state.lock().await.nick.clone(),
            instance_id: self.instance_id.clone(),
            server_domain: self.server.domain.clone(),
        }
    }

    async fn current_conn(&self) -> Option<Arc<Connection>> {
        self.state.lock().await.conn.clone()
    }

    /// A live (non-dead, non-killed) connection, or a lifecycle error.
    async fn live_conn(&self) -> Result<Arc<Connection>, ClientError> {
        let s = self.state.lock().await;
        if s.raw_cleared {
            return Err(ClientError::NotConnected);
        }
        match &s.conn {
            Some(conn) if !conn.dead() => Ok(Arc::clone(conn)),
            _ => Err(ClientError::NotConnected),
        }
    }

    // -- Connect -------------------------------------------------------------

    /// Acquire identities, open the connection, wire listeners, announce.
    ///
    /// On failure the session is marked failed and nothing stays attached.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        if *self.phase.borrow() != Phase::Fresh {
            return Err(ClientError::AlreadyConnected);
        }
        self.phase.send_replace(Phase::Connecting);

        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.lock().await.inst_creation_failed = true;
                self.phase.send_replace(Phase::Failed);
                metrics::record_connect_failure(&self.server.domain);
                warn!(
                    client = %self.instance_id,
                    domain = %self.server.domain,
                    "connect failed: {e}"
                );
                Err(e)
            }
        }
    }

    async fn connect_inner(self: &Arc<Self>) -> Result<(), ClientError> {
        // Identity generation strictly precedes the TCP connection.
        let fallback_owner;
        let owner = match self.home_user_id.as_deref() {
            Some(id) => id,
            None => {
                fallback_owner = format!("@{}", self.config.lock().await.desired_nick);
                &fallback_owner
            }
        };
        let (username, realname) = self
            .identities
            .assign(owner, self.display_name.as_deref())?;

        {
            let mut config = self.config.lock().await;
            if config.desired_nick.is_empty() {
                if let Some(user_id) = self.home_user_id.as_deref() {
                    config.desired_nick = self
                        .server
                        .desired_nick(user_id, self.display_name.as_deref());
                }
            }
            // The desired nick may be template output; coerce it into validity.
            config.desired_nick = validate_nick(&config.desired_nick, false, None)?;
            config.username = Some(username);
            config.realname = Some(realname);
            if let Some(alloc) = &self.ipv6 {
                config.ipv6_address = Some(alloc.allocate(owner)?);
            }
        }

        let permit = match &self.limiter {
            Some(limiter) => Some(
                Arc::clone(limiter)
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::NotConnected)?,
            ),
            None => None,
        };

        let config = self.config.lock().await.clone();
        let conn = Arc::new(
            Connection::open(&self.server, &config, Arc::clone(&self.ident), permit).await?,
        );

        let effective_nick = conn.current_nick();
        let events = conn.subscribe();
        {
            let mut s = self.state.lock().await;
            s.nick = effective_nick.clone();
            s.conn = Some(Arc::clone(&conn));
        }

        // Permanent listeners: own-nick tracking, error forwarding, incoming
        // messages, and the disconnect handler.
        tokio::spawn(permanent_listener(Arc::downgrade(self), events));

        let client_ref = self.client_ref().await;
        self.broker.publish(BridgeEvent::ClientConnected {
            client: client_ref.clone(),
        });
        self.broker.metadata(
            client_ref,
            format!("Connected to {} as {}", self.server.domain, effective_nick),
            false,
        );

        if !self.is_bot && !self.server.user_modes.is_empty() {
            let modes = if self.server.user_modes.starts_with(['+', '-']) {
                self.server.user_modes.clone()
            } else {
                format!("+{}", self.server.user_modes)
            };
            conn.send(Message::mode(&effective_nick, &modes))?;
        }

        self.phase.send_replace(Phase::Registered);
        info!(
            client = %self.instance_id,
            domain = %self.server.domain,
            nick = %effective_nick,
            "bridged client connected"
        );

        self.bump_activity().await;
        Ok(())
    }

    /// Block until the session is registered. Queued joins/sends pass
    /// through here; calls with no connect in flight fail immediately.
    async fn await_ready(&self) -> Result<(), ClientError> {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            match phase {
                Phase::Registered => return Ok(()),
                Phase::Fresh | Phase::Failed | Phase::Dead => {
                    return Err(ClientError::NotConnected)
                }
                Phase::Connecting => {
                    if rx.changed().await.is_err() {
                        return Err(ClientError::NotConnected);
                    }
                }
            }
        }
    }

    // -- Nick ----------------------------------------------------------------

    /// Change the session's nick, racing the server reply against errors and
    /// a hard timeout. Exactly one outcome fires; the subscription (the
    /// one-shot listener) is dropped on every path.
    pub async fn change_nick(&self, new_nick: &str, strict: bool) -> Result<String, ClientError> {
        let conn = self.live_conn().await?;
        let valid = validate_nick(new_nick, strict, conn.nicklen())?;

        let current = self.nick().await;
        if valid == current {
            return Ok(format!("Your nick is already '{current}'."));
        }

        let mut rx = conn.subscribe();
        conn.send(Message::nick(&valid))?;

        let outcome = timeout(NICK_TIMEOUT, async {
            loop {
                match rx.recv().await {
                    Ok(IrcEvent::NickChanged { old, new }) if old == current => {
                        return Ok(new);
                    }
                    Ok(IrcEvent::ErrorReply { code, .. })
                        if message::NICK_ERRORS.contains(&code.as_str()) =>
                    {
                        return Err(ClientError::NickChangeFailed(code));
                    }
                    Ok(IrcEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::NotConnected);
                    }
                    _ => {}
                }
            }
        })
        .await;

        match outcome {
            Ok(Ok(new)) => Ok(format!("Nick changed from '{current}' to '{new}'.")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::NickChangeTimeout),
        }
    }

    // -- Channels ------------------------------------------------------------

    /// Join a channel, retrying each silent 15-second round up to five
    /// times and self-healing when the join callback was dropped but the
    /// raw client is already in the channel.
    pub async fn join_channel(
        self: &Arc<Self>,
        channel: &str,
        key: Option<&str>,
    ) -> Result<IrcRoom, ClientError> {
        // A non-channel target is a DM: nothing to join.
        if !is_channel_name(channel) {
            return Ok(IrcRoom::new(&self.server.domain, channel));
        }
        if self.server.is_excluded_channel(channel) {
            return Err(ClientError::DoNotTrack(channel.to_owned()));
        }

        self.await_ready().await?;
        let conn = self.live_conn().await?;

        if conn.is_joined(channel) {
            return Ok(IrcRoom::new(&self.server.domain, channel));
        }

        // Track before issuing JOIN so retries and leave-while-joining see a
        // consistent membership view.
        self.state.lock().await.chan_list.insert(channel.to_owned());

        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut rx = conn.subscribe();
            conn.send(Message::join(channel, key))?;

            let round = timeout(JOIN_ROUND, async {
                loop {
                    match rx.recv().await {
                        Ok(IrcEvent::Joined { nick, channel: c })
                            if c == channel && nick == conn.current_nick() =>
                        {
                            return Ok(());
                        }
                        Ok(IrcEvent::ErrorReply { code, args })
                            if message::JOIN_ERRORS.contains(&code.as_str())
                                && args.iter().any(|a| a == channel) =>
                        {
                            return Err(ClientError::JoinFailed(code));
                        }
                        Ok(IrcEvent::Disconnected { .. })
                        | Err(broadcast::error::RecvError::Closed) => {
                            return Err(ClientError::NotConnected);
                        }
                        _ => {}
                    }
                }
            })
            .await;

            match round {
                Ok(Ok(())) => {
                    debug!(client = %self.instance_id, %channel, "joined");
                    return Ok(IrcRoom::new(&self.server.domain, channel));
                }
                Ok(Err(ClientError::JoinFailed(code))) => {
                    self.state.lock().await.chan_list.remove(channel);
                    self.announce_join_error(channel, &code).await;
                    return Err(ClientError::JoinFailed(code));
                }
                Ok(Err(other)) => {
                    self.state.lock().await.chan_list.remove(channel);
                    return Err(other);
                }
                Err(_elapsed) => {
                    if conn.is_joined(channel) {
                        // The join callback was dropped upstream; the raw
                        // client is in the channel regardless.
                        debug!(client = %self.instance_id, %channel, "join reply lost, channel present");
                        return Ok(IrcRoom::new(&self.server.domain, channel));
                    }
                    if attempts >= JOIN_ATTEMPTS {
                        self.state.lock().await.chan_list.remove(channel);
                        self.announce_join_error(channel, "join_timeout").await;
                        return Err(ClientError::JoinExhausted(channel.to_owned()));
                    }
                    metrics::record_join_retry(&self.server.domain);
                    warn!(
                        client = %self.instance_id,
                        %channel,
                        attempts,
                        "join round timed out, retrying"
                    );
                }
            }
        }
    }

    async fn announce_join_error(&self, channel: &str, code: &str) {
        let client_ref = self.client_ref().await;
        self.broker.publish(BridgeEvent::JoinError {
            client: client_ref.clone(),
            channel: channel.to_owned(),
            code: code.to_owned(),
        });
        self.broker.metadata(
            client_ref,
            format!("Failed to join {channel}: {code}"),
            true,
        );
    }

    /// Leave a channel. No-ops when disconnected, when the channel was never
    /// tracked, or for DM targets. The local membership view is updated
    /// before PART goes out so concurrent joins see the channel absent.
    pub async fn leave_channel(&self, channel: &str, reason: &str) -> Result<(), ClientError> {
        if !is_channel_name(channel) {
            return Ok(());
        }
        let Ok(conn) = self.live_conn().await else {
            return Ok(());
        };
        if !self.state.lock().await.chan_list.remove(channel) {
            return Ok(());
        }

        let mut rx = conn.subscribe();
        if conn.send(Message::part(channel, reason)).is_err() {
            return Ok(());
        }

        loop {
            match rx.recv().await {
                Ok(IrcEvent::Parted { nick, channel: c })
                    if c == channel && nick == conn.current_nick() =>
                {
                    return Ok(());
                }
                Ok(IrcEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => {
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Kick a nick from a channel. Fire-and-forget: IRC gives no reliable
    /// success reply, so this resolves as soon as the command is queued.
    pub async fn kick(&self, nick: &str, channel: &str, reason: &str) -> Result<(), ClientError> {
        if !is_channel_name(channel) {
            return Ok(());
        }
        let Ok(conn) = self.live_conn().await else {
            return Ok(());
        };
        if !conn.is_joined(channel) {
            return Ok(());
        }
        let _ = conn.send(Message::kick(channel, nick, reason));
        Ok(())
    }

    // -- Sending -------------------------------------------------------------

    /// Dispatch one home-side action, implicitly joining the target channel
    /// first. Actions older than the server's expiry window by the time the
    /// join completes are dropped with a log line only.
    pub async fn send_action(
        self: &Arc<Self>,
        room: &IrcRoom,
        action: &BridgeAction,
    ) -> Result<(), ClientError> {
        self.bump_activity().await;

        let deadline_ms = match (self.server.message_expiry_secs, action.ts_ms) {
            (0, _) | (_, None) => None,
            (expiry, Some(ts)) => Some(ts + expiry * 1000),
        };

        self.await_ready().await?;
        self.join_channel(&room.channel, None).await?;

        if let Some(deadline) = deadline_ms {
            if epoch_ms() > deadline {
                info!(
                    client = %self.instance_id,
                    channel = %room.channel,
                    "dropping expired action"
                );
                return Ok(());
            }
        }

        let conn = self.live_conn().await?;
        let (kind, msg) = match action.kind {
            ActionKind::Message => ("message", Message::privmsg(&room.channel, &action.text)),
            ActionKind::Notice => ("notice", Message::notice(&room.channel, &action.text)),
            ActionKind::Emote => ("emote", Message::action(&room.channel, &action.text)),
            ActionKind::Topic => ("topic", Message::topic(&room.channel, &action.text)),
            ActionKind::Unknown => return Err(ClientError::UnknownAction),
        };
        conn.send(msg)?;
        metrics::record_action(kind);
        Ok(())
    }

    // -- Queries -------------------------------------------------------------

    /// WHOIS a nick and format a human-readable summary.
    pub async fn whois(&self, nick: &str) -> Result<WhoisSummary, ClientError> {
        let conn = self.live_conn().await?;
        let mut rx = conn.subscribe();
        conn.send(Message::whois(nick))?;

        loop {
            match rx.recv().await {
                Ok(IrcEvent::Whois(info)) if info.nick == nick => {
                    let Some(user) = info.user else {
                        return Err(ClientError::WhoisNoUser(nick.to_owned()));
                    };
                    let mut lines = vec![format!(
                        "{nick} ({user}@{})",
                        info.host.as_deref().unwrap_or("unknown")
                    )];
                    if let Some(realname) = &info.realname {
                        lines.push(format!("Real name: {realname}"));
                    }
                    if !info.channels.is_empty() {
                        lines.push(format!("Channels: {}", info.channels.join(" ")));
                    }
                    if let Some(idle) = info.idle_secs {
                        lines.push(format!("Idle for {idle}s"));
                    }
                    return Ok(WhoisSummary {
                        server: self.server.domain.clone(),
                        nick: nick.to_owned(),
                        msg: lines.join("\n"),
                    });
                }
                Ok(IrcEvent::Disconnected { .. }) | Err(broadcast::error::RecvError::Closed) => {
                    return Err(ClientError::NotConnected);
                }
                _ => {}
            }
        }
    }

    /// NAMES for a channel, bounded by a 5-second timeout.
    pub async fn get_nicks(&self, channel: &str) -> Result<NamesSnapshot, ClientError> {
        let conn = self.live_conn().await?;
        let mut rx = conn.subscribe();
        conn.send(Message::names(channel))?;

        let names = timeout(NAMES_TIMEOUT, async {
            loop {
                match rx.recv().await {
                    Ok(IrcEvent::Names { channel: c, names }) if c == channel => {
                        return Ok(names);
                    }
                    Ok(IrcEvent::Disconnected { .. })
                    | Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::NotConnected);
                    }
                    _ => {}
                }
            }
        })
        .await
        .map_err(|_| ClientError::NamesTimeout(channel.to_owned()))??;

        Ok(NamesSnapshot {
            server: self.server.domain.clone(),
            channel: channel.to_owned(),
            nicks: names.keys().cloned().collect(),
            names,
        })
    }

    /// Channel operators, captured by a transient join/NAMES/leave cycle,
    /// optionally served from and stored into a time-bounded cache.
    pub async fn get_operators(
        self: &Arc<Self>,
        channel: &str,
        opts: &GetOperatorsOpts,
    ) -> Result<OperatorsReport, ClientError> {
        if let Some(ms) = opts.cache_duration_ms {
            if ms == 0 {
                return Err(ClientError::BadCacheDuration);
            }
            let mut s = self.state.lock().await;
            match s.op_cache.get(channel) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(entry.report.clone());
                }
                Some(_) => {
                    s.op_cache.remove(channel);
                }
                None => {}
            }
        }

        self.join_channel(channel, opts.key.as_deref()).await?;
        let snapshot = self.get_nicks(channel).await?;
        self.leave_channel(channel, "Temporary channel scan").await?;

        let conn = self.live_conn().await?;
        let isupport = conn.isupport();
        let mut operator_nicks: Vec<String> = snapshot
            .names
            .iter()
            .filter(|(_, prefix)| isupport.denotes_operator(prefix))
            .map(|(nick, _)| nick.clone())
            .collect();
        operator_nicks.sort();

        let report = OperatorsReport {
            server: self.server.domain.clone(),
            channel: channel.to_owned(),
            operator_nicks,
        };

        if let Some(ms) = opts.cache_duration_ms {
            self.state.lock().await.op_cache.insert(
                channel.to_owned(),
                CachedOperators {
                    report: report.clone(),
                    expires_at: Instant::now() + Duration::from_millis(ms),
                },
            );
        }

        Ok(report)
    }

    // -- Teardown ------------------------------------------------------------

    /// Explicitly disconnect. No-op when no live connection exists; awaits
    /// the connection's death otherwise.
    pub async fn disconnect(&self, reason: &str) -> Result<(), ClientError> {
        let conn = {
            let mut s = self.state.lock().await;
            s.explicit_disconnect = true;
            if let Some(timer) = s.idle_timer.take() {
                timer.abort();
            }
            s.conn.clone()
        };

        match conn {
            None => Ok(()),
            Some(conn) if conn.dead() => Ok(()),
            Some(conn) => {
                conn.disconnect(reason);
                self.await_death().await;
                Ok(())
            }
        }
    }

    /// Kill the session: clear the raw-client handle (so stale references
    /// can no longer send bytes), then disconnect.
    pub async fn kill(&self, reason: Option<&str>) -> Result<(), ClientError> {
        let conn = {
            let mut s = self.state.lock().await;
            s.explicit_disconnect = true;
            s.raw_cleared = true;
            if let Some(timer) = s.idle_timer.take() {
                timer.abort();
            }
            s.conn.clone()
        };

        match conn {
            None => {
                self.phase.send_replace(Phase::Dead);
                Ok(())
            }
            Some(conn) if conn.dead() => {
                self.phase.send_replace(Phase::Dead);
                Ok(())
            }
            Some(conn) => {
                conn.disconnect(reason.unwrap_or("Bridged client killed"));
                self.await_death().await;
                Ok(())
            }
        }
    }

    async fn await_death(&self) {
        let mut rx = self.phase.subscribe();
        loop {
            if matches!(*rx.borrow_and_update(), Phase::Dead | Phase::Failed) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // -- Idle liveness -------------------------------------------------------

    /// Record local activity and re-arm the idle timer. At most one timer is
    /// armed at any time.
    pub async fn bump_activity(self: &Arc<Self>) {
        let mut s = self.state.lock().await;
        s.last_action = Some(Instant::now());
        if let Some(timer) = s.idle_timer.take() {
            timer.abort();
        }
        let secs = self.server.idle_timeout_secs;
        if secs == 0 {
            return;
        }
        let weak = Arc::downgrade(self);
        s.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if let Some(client) = weak.upgrade() {
                client.idle_expired(secs).await;
            }
        }));
    }

    async fn idle_expired(&self, secs: u64) {
        // Mirrored membership is home-side state; reaping it would desync.
        if self.server.mirrors_joins(MirrorPhase::Initial) {
            return;
        }
        if self.is_bot {
            return;
        }
        info!(
            client = %self.instance_id,
            domain = %self.server.domain,
            "idle timeout reached"
        );
        metrics::record_idle_disconnect(&self.server.domain);
        let _ = self.disconnect(&format!("Idle timeout reached: {secs}s")).await;
    }

    // -- Disconnect handler --------------------------------------------------

    async fn handle_disconnect(&self, reason: &str) {
        {
            let mut s = self.state.lock().await;
            s.disconnect_reason = Some(reason.to_owned());
            if reason == "banned" {
                // Nobody should try to reconnect a banned session.
                s.explicit_disconnect = true;
            }
            if let Some(timer) = s.idle_timer.take() {
                timer.abort();
            }
        }
        self.phase.send_replace(Phase::Dead);

        let client_ref = self.client_ref().await;
        self.broker.publish(BridgeEvent::ClientDisconnected {
            client: client_ref.clone(),
            reason: reason.to_owned(),
        });
        self.broker.metadata(
            client_ref,
            format!("Disconnected from {} ({reason})", self.server.domain),
            false,
        );
    }
}

/// The session's permanent listener: tracks server-initiated renames of the
/// own nick, forwards error replies (critical ones force-noticed), relays
/// incoming messages, and runs the disconnect handler. Ends with the
/// connection.
async fn permanent_listener(
    weak: std::sync::Weak<BridgedClient>,
    mut rx: broadcast::Receiver<IrcEvent>,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "bridged client listener lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(client) = weak.upgrade() else { break };

        match event {
            IrcEvent::NickChanged { old, new } => {
                let renamed = {
                    let mut s = client.state.lock().await;
                    if s.nick == old {
                        s.nick = new.clone();
                        true
                    } else {
                        false
                    }
                };
                if renamed {
                    let client_ref = client.client_ref().await;
                    client
                        .broker
                        .publish(BridgeEvent::NickChange { client: client_ref, old, new });
                }
            }
            IrcEvent::ErrorReply { code, args } => {
                let force = message::CRITICAL_ERRORS.contains(&code.as_str());
                let detail = args.last().map(String::as_str).unwrap_or("");
                let client_ref = client.client_ref().await;
                client
                    .broker
                    .metadata(client_ref, format!("{code}: {detail}"), force);
            }
            IrcEvent::Incoming {
                from,
                target,
                kind,
                text,
            } => {
                let client_ref = client.client_ref().await;
                client.broker.publish(BridgeEvent::IncomingMessage {
                    client: client_ref,
                    from,
                    target,
                    kind,
                    text,
                });
            }
            IrcEvent::Disconnected { reason } => {
                client.handle_disconnect(&reason).await;
                break;
            }
            _ => {}
        }
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
