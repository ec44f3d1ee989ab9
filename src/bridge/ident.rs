//! Ident registry and the optional RFC 1413 responder.
//!
//! Every outbound IRC connection registers its local source port here the
//! moment the socket exists, so that an ident query arriving from the IRC
//! server can be answered with the right username. Entries are removed on
//! disconnect.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Process-wide mapping from local TCP source port to ident username.
///
/// Write-mostly: one insert per successful connection, one remove per close.
/// A `std::sync::Mutex` keeps lookups synchronous for the responder.
#[derive(Debug, Default)]
pub struct IdentRegistry {
    entries: Mutex<HashMap<u16, String>>,
}

impl IdentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the username bound to a local source port.
    pub fn set(&self, port: u16, username: &str) {
        self.entries
            .lock()
            .expect("ident registry poisoned")
            .insert(port, username.to_owned());
    }

    /// Look up the username for a local source port.
    pub fn get(&self, port: u16) -> Option<String> {
        self.entries
            .lock()
            .expect("ident registry poisoned")
            .get(&port)
            .cloned()
    }

    /// Drop the mapping for a closed connection.
    pub fn remove(&self, port: u16) {
        self.entries
            .lock()
            .expect("ident registry poisoned")
            .remove(&port);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("ident registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answer one ident query line (`"local-port , remote-port"`).
///
/// Returns the full RFC 1413 response line, without the terminator.
fn answer_query(registry: &IdentRegistry, line: &str) -> String {
    let mut ports = line.split(',').map(str::trim);
    let local = ports.next().and_then(|p| p.parse::<u16>().ok());
    let remote = ports.next().and_then(|p| p.parse::<u16>().ok());

    match (local, remote) {
        (Some(local), Some(remote)) => match registry.get(local) {
            Some(username) => {
                format!("{local}, {remote} : USERID : UNIX : {username}")
            }
            None => format!("{local}, {remote} : ERROR : NO-USER"),
        },
        _ => format!("{} : ERROR : INVALID-PORT", line.trim()),
    }
}

/// Run the ident responder on `bind_addr` (e.g. `0.0.0.0:113`).
///
/// One query per connection, as RFC 1413 clients behave in practice.
pub async fn run_responder(
    registry: std::sync::Arc<IdentRegistry>,
    bind_addr: &str,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    info!("ident responder listening on {bind_addr}");

    loop {
        let (socket, addr) = listener.accept().await?;
        let registry = std::sync::Arc::clone(&registry);
        tokio::spawn(async move {
            let (read_half, mut write_half) = socket.into_split();
            let mut lines = BufReader::new(read_half).lines();
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let reply = answer_query(&registry, &line);
                    if let Err(e) = write_half.write_all(format!("{reply}\r\n").as_bytes()).await {
                        warn!(%addr, "ident: write failed: {e}");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%addr, "ident: read failed: {e}"),
            }
        });
    }
}
