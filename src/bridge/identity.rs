//! Identity generation: ident usernames, realnames, and IPv6 source
//! addresses.
//!
//! Both generators are process-wide and deterministic per home identity:
//! asking twice for the same user yields the same answer, and two different
//! users never share a username or an address.

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Mutex;

use thiserror::Error;

/// Ident protocol usernames are conventionally short; sendmail-era daemons
/// truncate at 10.
const MAX_USERNAME_LEN: usize = 10;

/// GECOS realname cap.
const MAX_REALNAME_LEN: usize = 50;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no usable username could be derived from '{0}'")]
    UnusableUserId(String),
    #[error("IPv6 prefix '{0}' is not a valid address prefix")]
    BadPrefix(String),
    #[error("IPv6 prefix '{0}' is exhausted")]
    PrefixExhausted(String),
}

/// Produces the `(username, realname)` pair for a home identity.
///
/// Usernames are sanitized to the ident-safe alphabet, truncated, and made
/// unique with a numeric suffix on collision. The mapping is sticky for the
/// generator's lifetime; the surrounding bridge persists it across restarts.
#[derive(Debug, Default)]
pub struct IdentityGenerator {
    state: Mutex<IdentityState>,
}

#[derive(Debug, Default)]
struct IdentityState {
    /// home user id → assigned username.
    assigned: HashMap<String, String>,
    /// usernames already taken (value side of `assigned`).
    taken: HashMap<String, String>,
}

impl IdentityGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The `(username, realname)` pair for a home identity.
    pub fn assign(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> Result<(String, String), IdentityError> {
        let realname = sanitize_realname(display_name.unwrap_or(user_id));
        let mut state = self.state.lock().expect("identity state poisoned");

        if let Some(existing) = state.assigned.get(user_id) {
            return Ok((existing.clone(), realname));
        }

        let base = sanitize_username(user_id);
        if base.is_empty() {
            return Err(IdentityError::UnusableUserId(user_id.to_owned()));
        }

        let mut candidate = base.clone();
        let mut suffix: u32 = 0;
        while state.taken.contains_key(&candidate) {
            suffix += 1;
            let digits = suffix.to_string();
            // Make room for the suffix inside the length cap.
            let keep = MAX_USERNAME_LEN.saturating_sub(digits.len()).min(base.len());
            candidate = format!("{}{digits}", &base[..keep]);
        }

        state.assigned.insert(user_id.to_owned(), candidate.clone());
        state.taken.insert(candidate.clone(), user_id.to_owned());
        Ok((candidate, realname))
    }
}

/// Take the home id's localpart, lowercase it, restrict to `[a-z0-9._-]`,
/// force a letter start, truncate.
fn sanitize_username(user_id: &str) -> String {
    let localpart = user_id
        .trim_start_matches('@')
        .split(':')
        .next()
        .unwrap_or(user_id);
    let cleaned: String = localpart
        .chars()
        .flat_map(|c| c.to_lowercase())
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    if cleaned.is_empty() {
        return String::new();
    }
    let fronted = if cleaned.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        cleaned.to_owned()
    } else {
        format!("m{cleaned}")
    };
    fronted.chars().take(MAX_USERNAME_LEN).collect()
}

/// Strip control characters and truncate to the GECOS cap.
fn sanitize_realname(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .take(MAX_REALNAME_LEN)
        .collect()
}

/// Deterministic allocator of unique IPv6 source addresses within a prefix.
///
/// Addresses are `prefix + counter`; each home identity gets one stable
/// address for the allocator's lifetime.
#[derive(Debug)]
pub struct Ipv6Allocator {
    prefix: String,
    base: u128,
    state: Mutex<Ipv6State>,
}

#[derive(Debug, Default)]
struct Ipv6State {
    assigned: HashMap<String, Ipv6Addr>,
    counter: u128,
}

impl Ipv6Allocator {
    /// Build an allocator over a prefix written as a partial address,
    /// e.g. `2001:db8:42::`.
    pub fn new(prefix: &str) -> Result<Self, IdentityError> {
        let base_addr: Ipv6Addr = prefix
            .parse()
            .map_err(|_| IdentityError::BadPrefix(prefix.to_owned()))?;
        Ok(Self {
            prefix: prefix.to_owned(),
            base: u128::from(base_addr),
            state: Mutex::new(Ipv6State::default()),
        })
    }

    /// The stable source address for a home identity.
    pub fn allocate(&self, owner: &str) -> Result<Ipv6Addr, IdentityError> {
        let mut state = self.state.lock().expect("ipv6 state poisoned");
        if let Some(addr) = state.assigned.get(owner) {
            return Ok(*addr);
        }
        // Offset 0 is the prefix address itself; start at 1.
        state.counter = state
            .counter
            .checked_add(1)
            .ok_or_else(|| IdentityError::PrefixExhausted(self.prefix.clone()))?;
        let addr = Ipv6Addr::from(
            self.base
                .checked_add(state.counter)
                .ok_or_else(|| IdentityError::PrefixExhausted(self.prefix.clone()))?,
        );
        state.assigned.insert(owner.to_owned(), addr);
        Ok(addr)
    }

    /// How many addresses have been handed out.
    pub fn allocated_count(&self) -> usize {
        self.state.lock().expect("ipv6 state poisoned").assigned.len()
    }
}
