//! Connection instance — owns one TCP socket to an IRC server and the
//! line-level client on top of it.
//!
//! `Connection::open` dials (binding the allocated IPv6 source address when
//! present), registers the ident mapping the moment the socket exists, then
//! performs IRC registration (PASS/NICK/USER → 001). The spawned task answers
//! PING autonomously, maintains the raw client state (effective nick,
//! ISUPPORT, joined channels) and broadcasts typed [`IrcEvent`]s. The task
//! emits `Disconnected` exactly once, whatever ends the connection.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

use futures::SinkExt;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit};
use tokio::time::{timeout, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::bridge::broker::IncomingKind;
use crate::bridge::config::{ClientConfig, ServerConfig};
use crate::bridge::ident::IdentRegistry;
use crate::bridge::metrics;
use crate::irc::codec::IrcCodec;
use crate::irc::isupport::{collect_names, Isupport};
use crate::irc::message::{self, Message};

/// How long IRC registration may take before the connect attempt fails.
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How many `_`-suffixed retries a rejected registration nick gets.
const REGISTRATION_NICK_RETRIES: usize = 4;

/// Broadcast buffer: deep enough that a NAMES burst cannot lag the
/// permanent listener out of its window.
const EVENT_BUFFER: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not resolve {0}")]
    Unresolvable(String),
    #[error("registration timed out")]
    RegistrationTimeout,
    #[error("server rejected every registration nick ({0})")]
    NickRejected(String),
    #[error("server closed the connection during registration")]
    ClosedDuringRegistration,
    #[error("not connected")]
    NotConnected,
}

/// Aggregated WHOIS reply, emitted at end-of-whois.
#[derive(Debug, Clone, Default)]
pub struct WhoisInfo {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
    pub realname: Option<String>,
    pub channels: Vec<String>,
    pub idle_secs: Option<u64>,
}

/// Typed events the connection task broadcasts to subscribers.
#[derive(Debug, Clone)]
pub enum IrcEvent {
    /// Any nick change visible to this session. `old == our nick` means the
    /// session itself was renamed (locally requested or server-forced).
    NickChanged { old: String, new: String },
    /// Someone joined a channel; `nick` may be our own.
    Joined { nick: String, channel: String },
    /// Someone parted a channel.
    Parted { nick: String, channel: String },
    /// Someone was kicked from a channel.
    Kicked {
        channel: String,
        nick: String,
        by: String,
        reason: String,
    },
    /// A complete NAMES snapshot (nick → prefix string).
    Names {
        channel: String,
        names: HashMap<String, String>,
    },
    /// A complete WHOIS reply.
    Whois(WhoisInfo),
    /// An error reply; `code` is the symbolic name when known (`err_…`),
    /// the raw numeric otherwise. `args` are the reply parameters.
    ErrorReply { code: String, args: Vec<String> },
    /// An incoming PRIVMSG/NOTICE/ACTION.
    Incoming {
        from: String,
        target: String,
        kind: IncomingKind,
        text: String,
    },
    /// The connection ended. Emitted exactly once per connection.
    Disconnected { reason: String },
}

/// Mutable introspection state of the raw client.
#[derive(Debug, Default)]
struct RawState {
    nick: String,
    isupport: Isupport,
    chans: HashSet<String>,
    dead: bool,
}

/// Outbound instructions for the connection task.
enum Outbound {
    Line(Message),
    Quit { reason: String },
}

/// A live connection to an IRC server.
#[derive(Debug)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<IrcEvent>,
    state: Arc<RwLock<RawState>>,
    local_port: u16,
    domain: String,
}

impl Connection {
    /// Dial, map ident, and register. Resolves once the server accepted the
    /// registration (001) with the effective (possibly coerced) nick.
    pub async fn open(
        server: &ServerConfig,
        config: &ClientConfig,
        ident: Arc<IdentRegistry>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<Self, ConnError> {
        let username = config.username.clone().unwrap_or_else(|| "estuary".into());
        let realname = config.realname.clone().unwrap_or_else(|| username.clone());

        let stream = dial(server, config).await?;
        let local_port = stream.local_addr()?.port();

        // The socket exists: the ident responder must be able to answer for
        // this source port before the IRC server has any reason to ask.
        ident.set(local_port, &username);
        debug!(domain = %server.domain, local_port, "socket connected, ident mapped");

        let mut framed = Framed::new(stream, IrcCodec);

        // IRC registration.
        if let Some(password) = config.password.as_ref().or(server.password.as_ref()) {
            framed
                .send(Message::pass(password))
                .await
                .map_err(io_from_codec)?;
        }
        let mut attempt_nick = config.desired_nick.clone();
        framed
            .send(Message::nick(&attempt_nick))
            .await
            .map_err(io_from_codec)?;
        framed
            .send(Message::user(&username, &realname))
            .await
            .map_err(io_from_codec)?;

        let registered = timeout(
            REGISTRATION_TIMEOUT,
            await_welcome(&mut framed, &mut attempt_nick),
        )
        .await;
        let (effective_nick, isupport) = match registered {
            Ok(Ok(res)) => res,
            Ok(Err(e)) => {
                ident.remove(local_port);
                return Err(e);
            }
            Err(_) => {
                ident.remove(local_port);
                return Err(ConnError::RegistrationTimeout);
            }
        };

        info!(domain = %server.domain, nick = %effective_nick, "registered");
        metrics::record_connect(&server.domain);

        let state = Arc::new(RwLock::new(RawState {
            nick: effective_nick,
            isupport,
            chans: HashSet::new(),
            dead: false,
        }));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        tokio::spawn(run_loop(
            framed,
            cmd_rx,
            events.clone(),
            Arc::clone(&state),
            ident,
            local_port,
            server.domain.clone(),
            permit,
        ));

        Ok(Self {
            cmd_tx,
            events,
            state,
            local_port,
            domain: server.domain.clone(),
        })
    }

    /// Subscribe to this connection's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<IrcEvent> {
        self.events.subscribe()
    }

    /// Queue a line for sending. Fails when the connection is dead.
    pub fn send(&self, msg: Message) -> Result<(), ConnError> {
        self.cmd_tx
            .send(Outbound::Line(msg))
            .map_err(|_| ConnError::NotConnected)
    }

    /// Ask the task to QUIT and shut down. Idempotent: calls after the first
    /// (or after any other death) are no-ops.
    pub fn disconnect(&self, reason: &str) {
        let _ = self.cmd_tx.send(Outbound::Quit {
            reason: reason.to_owned(),
        });
    }

    pub fn dead(&self) -> bool {
        self.state.read().expect("conn state poisoned").dead
    }

    /// The session's effective nick as the server last confirmed it.
    pub fn current_nick(&self) -> String {
        self.state.read().expect("conn state poisoned").nick.clone()
    }

    /// Server-advertised NICKLEN, when known.
    pub fn nicklen(&self) -> Option<usize> {
        self.state
            .read()
            .expect("conn state poisoned")
            .isupport
            .nicklen
    }

    /// Snapshot of the ISUPPORT data (PREFIX table etc).
    pub fn isupport(&self) -> Isupport {
        self.state
            .read()
            .expect("conn state poisoned")
            .isupport
            .clone()
    }

    /// Whether the raw client is presently joined to `channel`.
    pub fn is_joined(&self, channel: &str) -> bool {
        self.state
            .read()
            .expect("conn state poisoned")
            .chans
            .contains(channel)
    }

    pub fn joined_channels(&self) -> Vec<String> {
        self.state
            .read()
            .expect("conn state poisoned")
            .chans
            .iter()
            .cloned()
            .collect()
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// Resolve and dial the server, binding the allocated IPv6 source address
/// when the client has one.
async fn dial(server: &ServerConfig, config: &ClientConfig) -> Result<TcpStream, ConnError> {
    let authority = format!("{}:{}", server.domain, server.port);

    match config.ipv6_address {
        Some(source) => {
            let target = lookup_host(&authority)
                .await?
                .find(|a| matches!(a, SocketAddr::V6(_)))
                .ok_or_else(|| ConnError::Unresolvable(authority.clone()))?;
            let socket = TcpSocket::new_v6()?;
            socket.bind(SocketAddr::new(IpAddr::V6(source), 0))?;
            Ok(socket.connect(target).await?)
        }
        None => Ok(TcpStream::connect(&authority).await?),
    }
}

/// Drive the stream until the server accepts registration.
///
/// Returns the effective nick from 001 plus any ISUPPORT data that arrived
/// before we handed the stream to the main loop. A rejected nick is retried
/// with a `_` suffix a bounded number of times.
async fn await_welcome(
    framed: &mut Framed<TcpStream, IrcCodec>,
    attempt_nick: &mut String,
) -> Result<(String, Isupport), ConnError> {
    let mut retries = 0;
    let mut isupport = Isupport::default();

    loop {
        let msg = match framed.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!("registration: protocol error: {e}");
                return Err(ConnError::ClosedDuringRegistration);
            }
            None => return Err(ConnError::ClosedDuringRegistration),
        };

        match msg.command.as_str() {
            message::RPL_WELCOME => {
                // The server may have coerced the nick; its word is final.
                let effective = msg
                    .params
                    .first()
                    .cloned()
                    .unwrap_or_else(|| attempt_nick.clone());
                return Ok((effective, isupport));
            }
            message::RPL_ISUPPORT => {
                if msg.params.len() > 2 {
                    isupport.absorb(&msg.params[1..msg.params.len() - 1]);
                }
            }
            "PING" => {
                let token = msg.params.first().cloned().unwrap_or_default();
                framed
                    .send(Message::pong(&token))
                    .await
                    .map_err(io_from_codec)?;
            }
            "432" | "433" | "436" | "437" => {
                if retries >= REGISTRATION_NICK_RETRIES {
                    let code = message::error_name(&msg.command)
                        .unwrap_or(&msg.command)
                        .to_owned();
                    return Err(ConnError::NickRejected(code));
                }
                retries += 1;
                attempt_nick.push('_');
                warn!(nick = %attempt_nick, "registration nick rejected, retrying");
                framed
                    .send(Message::nick(attempt_nick))
                    .await
                    .map_err(io_from_codec)?;
            }
            "ERROR" => {
                warn!(
                    "registration refused: {}",
                    msg.params.first().map(String::as_str).unwrap_or("")
                );
                return Err(ConnError::ClosedDuringRegistration);
            }
            _ => {}
        }
    }
}

fn io_from_codec(e: crate::irc::codec::CodecError) -> ConnError {
    match e {
        crate::irc::codec::CodecError::Io(io) => ConnError::Io(io),
        other => ConnError::Io(std::io::Error::other(other.to_string())),
    }
}

/// The connection task: select over the socket and the outbound queue.
#[allow(clippy::too_many_arguments)]
async fn run_loop(
    mut framed: Framed<TcpStream, IrcCodec>,
    mut cmd_rx: mpsc::UnboundedReceiver<Outbound>,
    events: broadcast::Sender<IrcEvent>,
    state: Arc<RwLock<RawState>>,
    ident: Arc<IdentRegistry>,
    local_port: u16,
    domain: String,
    permit: Option<OwnedSemaphorePermit>,
) {
    // Reply-coalescing accumulators.
    let mut pending_names: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut pending_whois: HashMap<String, WhoisInfo> = HashMap::new();

    let reason = loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!(%domain, "protocol error: {e}");
                        break format!("protocol error: {e}");
                    }
                    None => break "remote closed connection".to_owned(),
                };

                // ERROR terminates the session; distill the cause so the
                // disconnect handler can recognize bans.
                if msg.command == "ERROR" {
                    let text = msg.params.first().map(String::as_str).unwrap_or("");
                    if text.to_ascii_lowercase().contains("banned") {
                        break "banned".to_owned();
                    }
                    break format!("server error: {text}");
                }

                if let Some(pong) = handle_incoming(
                    &msg,
                    &events,
                    &state,
                    &mut pending_names,
                    &mut pending_whois,
                ) {
                    if framed.send(pong).await.is_err() {
                        break "write failed".to_owned();
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Outbound::Line(msg)) => {
                        if framed.send(msg).await.is_err() {
                            break "write failed".to_owned();
                        }
                    }
                    Some(Outbound::Quit { reason }) => {
                        let _ = framed.send(Message::quit(&reason)).await;
                        break reason;
                    }
                    // Connection handle dropped without an explicit quit.
                    None => break "connection handle dropped".to_owned(),
                }
            }
        }
    };

    state.write().expect("conn state poisoned").dead = true;
    ident.remove(local_port);
    metrics::record_disconnect(&domain);
    info!(%domain, %reason, "disconnected");
    let _ = events.send(IrcEvent::Disconnected { reason });
    drop(permit);
}

/// Dispatch one incoming message: update raw state, emit events.
/// Returns a PONG to send when the message was a PING.
fn handle_incoming(
    msg: &Message,
    events: &broadcast::Sender<IrcEvent>,
    state: &Arc<RwLock<RawState>>,
    pending_names: &mut HashMap<String, HashMap<String, String>>,
    pending_whois: &mut HashMap<String, WhoisInfo>,
) -> Option<Message> {
    let emit = |event: IrcEvent| {
        let _ = events.send(event);
    };

    match msg.command.as_str() {
        "PING" => {
            let token = msg.params.first().cloned().unwrap_or_default();
            return Some(Message::pong(&token));
        }

        "NICK" => {
            let (Some(old), Some(new)) = (msg.source_nick(), msg.params.first()) else {
                return None;
            };
            let old = old.to_owned();
            let new = new.clone();
            {
                let mut st = state.write().expect("conn state poisoned");
                if st.nick == old {
                    st.nick = new.clone();
                }
            }
            emit(IrcEvent::NickChanged { old, new });
        }

        "JOIN" => {
            let (Some(nick), Some(channel)) = (msg.source_nick(), msg.params.first()) else {
                return None;
            };
            let nick = nick.to_owned();
            let channel = channel.clone();
            {
                let mut st = state.write().expect("conn state poisoned");
                if st.nick == nick {
                    st.chans.insert(channel.clone());
                }
            }
            emit(IrcEvent::Joined { nick, channel });
        }

        "PART" => {
            let (Some(nick), Some(channel)) = (msg.source_nick(), msg.params.first()) else {
                return None;
            };
            let nick = nick.to_owned();
            let channel = channel.clone();
            {
                let mut st = state.write().expect("conn state poisoned");
                if st.nick == nick {
                    st.chans.remove(&channel);
                }
            }
            emit(IrcEvent::Parted { nick, channel });
        }

        "KICK" => {
            let (Some(by), Some(channel), Some(victim)) =
                (msg.source_nick(), msg.params.first(), msg.params.get(1))
            else {
                return None;
            };
            let by = by.to_owned();
            let channel = channel.clone();
            let victim = victim.clone();
            let reason = msg.params.get(2).cloned().unwrap_or_default();
            {
                let mut st = state.write().expect("conn state poisoned");
                if st.nick == victim {
                    st.chans.remove(&channel);
                }
            }
            emit(IrcEvent::Kicked {
                channel,
                nick: victim,
                by,
                reason,
            });
        }

        message::RPL_ISUPPORT => {
            if msg.params.len() > 2 {
                let tokens = &msg.params[1..msg.params.len() - 1];
                state
                    .write()
                    .expect("conn state poisoned")
                    .isupport
                    .absorb(tokens);
            }
        }

        // NAMES: 353 accumulates, 366 closes the snapshot.
        message::RPL_NAMREPLY => {
            if let (Some(channel), Some(payload)) = (msg.params.get(2), msg.params.get(3)) {
                let st = state.read().expect("conn state poisoned");
                let batch = collect_names(&st.isupport, payload);
                drop(st);
                pending_names
                    .entry(channel.clone())
                    .or_default()
                    .extend(batch);
            }
        }
        message::RPL_ENDOFNAMES => {
            if let Some(channel) = msg.params.get(1) {
                let names = pending_names.remove(channel).unwrap_or_default();
                emit(IrcEvent::Names {
                    channel: channel.clone(),
                    names,
                });
            }
        }

        // WHOIS: 311/319/317 accumulate, 318 closes the snapshot.
        message::RPL_WHOISUSER => {
            if let Some(nick) = msg.params.get(1) {
                let entry = pending_whois.entry(nick.clone()).or_insert_with(|| WhoisInfo {
                    nick: nick.clone(),
                    ..WhoisInfo::default()
                });
                entry.user = msg.params.get(2).cloned();
                entry.host = msg.params.get(3).cloned();
                entry.realname = msg.params.get(5).cloned();
            }
        }
        message::RPL_WHOISCHANNELS => {
            if let (Some(nick), Some(chanlist)) = (msg.params.get(1), msg.params.get(2)) {
                let entry = pending_whois.entry(nick.clone()).or_insert_with(|| WhoisInfo {
                    nick: nick.clone(),
                    ..WhoisInfo::default()
                });
                entry.channels = chanlist.split_whitespace().map(str::to_owned).collect();
            }
        }
        message::RPL_WHOISIDLE => {
            if let Some(nick) = msg.params.get(1) {
                let entry = pending_whois.entry(nick.clone()).or_insert_with(|| WhoisInfo {
                    nick: nick.clone(),
                    ..WhoisInfo::default()
                });
                entry.idle_secs = msg.params.get(2).and_then(|s| s.parse().ok());
            }
        }
        message::RPL_ENDOFWHOIS => {
            if let Some(nick) = msg.params.get(1) {
                let info = pending_whois.remove(nick).unwrap_or_else(|| WhoisInfo {
                    nick: nick.clone(),
                    ..WhoisInfo::default()
                });
                emit(IrcEvent::Whois(info));
            }
        }

        "PRIVMSG" | "NOTICE" => {
            let (Some(from), Some(target), Some(text)) =
                (msg.source_nick(), msg.params.first(), msg.params.get(1))
            else {
                return None;
            };
            let (kind, text) = if let Some(action) = msg.ctcp_action_text() {
                (IncomingKind::Emote, action.to_owned())
            } else if msg.command == "NOTICE" {
                (IncomingKind::Notice, text.clone())
            } else {
                (IncomingKind::Message, text.clone())
            };
            emit(IrcEvent::Incoming {
                from: from.to_owned(),
                target: target.clone(),
                kind,
                text,
            });
        }

        numeric
            if numeric.len() == 3
                && (numeric.starts_with('4') || numeric.starts_with('5')) =>
        {
            let code = message::error_name(numeric)
                .map(str::to_owned)
                .unwrap_or_else(|| numeric.to_owned());
            emit(IrcEvent::ErrorReply {
                code,
                args: msg.params.clone(),
            });
        }

        _ => {}
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    fn harness() -> (
        broadcast::Sender<IrcEvent>,
        broadcast::Receiver<IrcEvent>,
        Arc<RwLock<RawState>>,
    ) {
        let (tx, rx) = broadcast::channel(64);
        let state = Arc::new(RwLock::new(RawState {
            nick: "M-Alice".into(),
            ..RawState::default()
        }));
        (tx, rx, state)
    }

    fn feed(
        line: &str,
        tx: &broadcast::Sender<IrcEvent>,
        state: &Arc<RwLock<RawState>>,
        names: &mut HashMap<String, HashMap<String, String>>,
        whois: &mut HashMap<String, WhoisInfo>,
    ) -> Option<Message> {
        handle_incoming(&Message::parse(line).unwrap(), tx, state, names, whois)
    }

    #[test]
    fn ping_yields_pong() {
        let (tx, _rx, state) = harness();
        let pong = feed(
            "PING :irc.example.net",
            &tx,
            &state,
            &mut HashMap::new(),
            &mut HashMap::new(),
        )
        .unwrap();
        assert_eq!(pong.command, "PONG");
        assert_eq!(pong.params, vec!["irc.example.net"]);
    }

    #[test]
    fn own_nick_change_updates_state() {
        let (tx, mut rx, state) = harness();
        feed(
            ":M-Alice!u@h NICK :seabird",
            &tx,
            &state,
            &mut HashMap::new(),
            &mut HashMap::new(),
        );
        assert_eq!(state.read().unwrap().nick, "seabird");
        match rx.try_recv().unwrap() {
            IrcEvent::NickChanged { old, new } => {
                assert_eq!(old, "M-Alice");
                assert_eq!(new, "seabird");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn foreign_nick_change_leaves_state() {
        let (tx, _rx, state) = harness();
        feed(
            ":stranger!u@h NICK :wanderer",
            &tx,
            &state,
            &mut HashMap::new(),
            &mut HashMap::new(),
        );
        assert_eq!(state.read().unwrap().nick, "M-Alice");
    }

    #[test]
    fn own_join_and_part_track_channels() {
        let (tx, _rx, state) = harness();
        let mut names = HashMap::new();
        let mut whois = HashMap::new();
        feed(":M-Alice!u@h JOIN :#estuary", &tx, &state, &mut names, &mut whois);
        assert!(state.read().unwrap().chans.contains("#estuary"));
        feed(
            ":M-Alice!u@h PART #estuary :bye",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        assert!(!state.read().unwrap().chans.contains("#estuary"));
    }

    #[test]
    fn kick_of_self_untracks_channel() {
        let (tx, mut rx, state) = harness();
        let mut names = HashMap::new();
        let mut whois = HashMap::new();
        feed(":M-Alice!u@h JOIN :#estuary", &tx, &state, &mut names, &mut whois);
        let _ = rx.try_recv();
        feed(
            ":op!u@h KICK #estuary M-Alice :flood",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        assert!(!state.read().unwrap().chans.contains("#estuary"));
        match rx.try_recv().unwrap() {
            IrcEvent::Kicked { nick, by, reason, .. } => {
                assert_eq!(nick, "M-Alice");
                assert_eq!(by, "op");
                assert_eq!(reason, "flood");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn names_accumulate_until_end() {
        let (tx, mut rx, state) = harness();
        let mut names = HashMap::new();
        let mut whois = HashMap::new();
        state.write().unwrap().isupport.absorb(&["PREFIX=(qaohv)~&@%+".into()]);

        feed(
            ":srv 353 M-Alice = #estuary :~wings @gull",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        feed(
            ":srv 353 M-Alice = #estuary :heron",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        assert!(rx.try_recv().is_err(), "nothing until 366");

        feed(
            ":srv 366 M-Alice #estuary :End of /NAMES list",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        match rx.try_recv().unwrap() {
            IrcEvent::Names { channel, names } => {
                assert_eq!(channel, "#estuary");
                assert_eq!(names.len(), 3);
                assert_eq!(names["wings"], "~");
                assert_eq!(names["gull"], "@");
                assert_eq!(names["heron"], "");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(names.is_empty() || !names.contains_key("#estuary"));
    }

    #[test]
    fn whois_aggregates_until_end() {
        let (tx, mut rx, state) = harness();
        let mut names = HashMap::new();
        let mut whois = HashMap::new();

        feed(
            ":srv 311 M-Alice gull gulluser host.example * :A Gull",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        feed(
            ":srv 319 M-Alice gull :#estuary #harbor",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        feed(
            ":srv 317 M-Alice gull 42 1700000000 :seconds idle",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        assert!(rx.try_recv().is_err(), "nothing until 318");

        feed(
            ":srv 318 M-Alice gull :End of /WHOIS list",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        match rx.try_recv().unwrap() {
            IrcEvent::Whois(info) => {
                assert_eq!(info.nick, "gull");
                assert_eq!(info.user.as_deref(), Some("gulluser"));
                assert_eq!(info.host.as_deref(), Some("host.example"));
                assert_eq!(info.realname.as_deref(), Some("A Gull"));
                assert_eq!(info.channels, vec!["#estuary", "#harbor"]);
                assert_eq!(info.idle_secs, Some(42));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn whois_without_user_still_closes() {
        let (tx, mut rx, state) = harness();
        feed(
            ":srv 318 M-Alice ghost :End of /WHOIS list",
            &tx,
            &state,
            &mut HashMap::new(),
            &mut HashMap::new(),
        );
        match rx.try_recv().unwrap() {
            IrcEvent::Whois(info) => {
                assert_eq!(info.nick, "ghost");
                assert!(info.user.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn numeric_errors_are_symbolic_when_known() {
        let (tx, mut rx, state) = harness();
        feed(
            ":srv 474 M-Alice #estuary :Cannot join channel (+b)",
            &tx,
            &state,
            &mut HashMap::new(),
            &mut HashMap::new(),
        );
        match rx.try_recv().unwrap() {
            IrcEvent::ErrorReply { code, args } => {
                assert_eq!(code, "err_bannedfromchan");
                assert!(args.contains(&"#estuary".to_owned()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_numeric_errors_stay_raw() {
        let (tx, mut rx, state) = harness();
        feed(
            ":srv 499 M-Alice :mystery",
            &tx,
            &state,
            &mut HashMap::new(),
            &mut HashMap::new(),
        );
        match rx.try_recv().unwrap() {
            IrcEvent::ErrorReply { code, .. } => assert_eq!(code, "499"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn incoming_kinds_are_classified() {
        let (tx, mut rx, state) = harness();
        let mut names = HashMap::new();
        let mut whois = HashMap::new();

        feed(
            ":gull!u@h PRIVMSG #estuary :hello",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        feed(
            ":gull!u@h NOTICE M-Alice :psst",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );
        feed(
            ":gull!u@h PRIVMSG #estuary :\u{1}ACTION preens\u{1}",
            &tx,
            &state,
            &mut names,
            &mut whois,
        );

        let kinds: Vec<_> = (0..3)
            .map(|_| match rx.try_recv().unwrap() {
                IrcEvent::Incoming { kind, .. } => kind,
                other => panic!("unexpected: {other:?}"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![IncomingKind::Message, IncomingKind::Notice, IncomingKind::Emote]
        );
    }
}
