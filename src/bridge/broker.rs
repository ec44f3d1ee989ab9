//! Event broker — the fan-in of per-client IRC events to the rest of the
//! bridge.
//!
//! Clients hold a cloned sender; the single consumer (the surrounding
//! bridge) drains the receiver and federates events home. Metadata lines are
//! human-readable status text; the force-notice flag tells the consumer to
//! present the text to the end user regardless of verbosity settings.

use tokio::sync::mpsc;

/// What kind of payload an incoming IRC message carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncomingKind {
    Message,
    Notice,
    Emote,
}

/// Identifies the session an event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRef {
    /// Home-side user this session stands in for; None for the bot session.
    pub home_user_id: Option<String>,
    /// The session's effective nick at the time of the event.
    pub nick: String,
    /// Short random tag for log correlation.
    pub instance_id: String,
    /// Domain of the IRC server the session is connected to.
    pub server_domain: String,
}

/// Events clients publish to the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// The session registered with the IRC server.
    ClientConnected { client: ClientRef },
    /// The session's connection ended.
    ClientDisconnected { client: ClientRef, reason: String },
    /// The session's own nick changed (locally requested or server-forced).
    NickChange {
        client: ClientRef,
        old: String,
        new: String,
    },
    /// A channel join failed hard.
    JoinError {
        client: ClientRef,
        channel: String,
        code: String,
    },
    /// An IRC user sent something at this session or a joined channel.
    IncomingMessage {
        client: ClientRef,
        from: String,
        target: String,
        kind: IncomingKind,
        text: String,
    },
    /// Human-readable status text for the home side.
    Metadata {
        client: ClientRef,
        text: String,
        force_notice: bool,
    },
}

/// The sender half held (cloned) by every bridged client.
#[derive(Debug, Clone)]
pub struct EventBroker {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl EventBroker {
    /// Create the broker and the receiver the surrounding bridge drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. Errors (consumer gone) are ignored: a client must
    /// keep functioning while the bridge restarts its consumer.
    pub fn publish(&self, event: BridgeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn metadata(&self, client: ClientRef, text: impl Into<String>, force_notice: bool) {
        self.publish(BridgeEvent::Metadata {
            client,
            text: text.into(),
            force_notice,
        });
    }
}
