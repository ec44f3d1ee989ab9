//! RPL_ISUPPORT (005) tracking.
//!
//! The bridge consumes two advertised capabilities: `NICKLEN` (drives nick
//! truncation) and `PREFIX` (drives the operator predicate). Everything else
//! a server advertises is ignored.

use std::collections::HashMap;

/// Server-advertised capabilities accumulated from 005 replies.
#[derive(Debug, Clone, Default)]
pub struct Isupport {
    /// Maximum nick length, when the server advertises `NICKLEN=N`.
    pub nicklen: Option<usize>,
    /// Membership prefixes, most powerful first: `(mode, prefix)` pairs
    /// parsed from `PREFIX=(qaohv)~&@%+`. Empty until advertised; callers
    /// fall back to [`DEFAULT_PREFIXES`].
    pub prefixes: Vec<(char, char)>,
}

/// The RFC 1459 default membership prefixes, most powerful first.
pub const DEFAULT_PREFIXES: &[(char, char)] = &[('o', '@'), ('v', '+')];

impl Isupport {
    /// Absorb the tokens of one 005 reply (`params` minus the leading nick
    /// and the trailing "are supported by this server" text).
    pub fn absorb(&mut self, tokens: &[String]) {
        for token in tokens {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "NICKLEN" => self.nicklen = value.parse().ok(),
                "PREFIX" => {
                    if let Some(parsed) = parse_prefix_token(value) {
                        self.prefixes = parsed;
                    }
                }
                _ => {}
            }
        }
    }

    /// The prefix table, falling back to the RFC default when the server
    /// never advertised one.
    pub fn prefix_table(&self) -> &[(char, char)] {
        if self.prefixes.is_empty() {
            DEFAULT_PREFIXES
        } else {
            &self.prefixes
        }
    }

    /// Whether `prefix` denotes strictly more channel power than `than`.
    ///
    /// Position in the PREFIX table is authoritative: a lower index is more
    /// powerful. Unknown prefixes are never more powerful than anything.
    pub fn is_prefix_more_powerful_than(&self, prefix: char, than: char) -> bool {
        let table = self.prefix_table();
        let rank = |c: char| table.iter().position(|&(_, p)| p == c);
        match (rank(prefix), rank(than)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// Whether a prefix string (e.g. `"~@"` from a NAMES entry) denotes
    /// channel-operator power: `@` itself or anything stronger.
    pub fn denotes_operator(&self, prefix_str: &str) -> bool {
        prefix_str
            .chars()
            .any(|p| p == '@' || self.is_prefix_more_powerful_than(p, '@'))
    }

    /// Split a NAMES entry into its prefix string and bare nick, using the
    /// current prefix table (e.g. `"@~wings"` → `("@~", "wings")`).
    pub fn split_named_entry<'a>(&self, entry: &'a str) -> (&'a str, &'a str) {
        let table = self.prefix_table();
        let split_at = entry
            .char_indices()
            .find(|&(_, c)| !table.iter().any(|&(_, p)| p == c))
            .map(|(i, _)| i)
            .unwrap_or(entry.len());
        entry.split_at(split_at)
    }
}

/// Parse a `PREFIX` value like `(qaohv)~&@%+` into `(mode, prefix)` pairs.
fn parse_prefix_token(value: &str) -> Option<Vec<(char, char)>> {
    let rest = value.strip_prefix('(')?;
    let (modes, prefixes) = rest.split_once(')')?;
    if modes.chars().count() != prefixes.chars().count() {
        return None;
    }
    Some(modes.chars().zip(prefixes.chars()).collect())
}

/// Convenience: collect a NAMES payload (`"@wings +gull heron"`) into a
/// nick → prefix-string mapping.
pub fn collect_names(isupport: &Isupport, payload: &str) -> HashMap<String, String> {
    payload
        .split_whitespace()
        .map(|entry| {
            let (prefix, nick) = isupport.split_named_entry(entry);
            (nick.to_owned(), prefix.to_owned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreal_style() -> Isupport {
        let mut isup = Isupport::default();
        isup.absorb(&[
            "NICKLEN=30".into(),
            "PREFIX=(qaohv)~&@%+".into(),
            "CHANTYPES=#&".into(),
        ]);
        isup
    }

    #[test]
    fn absorbs_nicklen() {
        assert_eq!(unreal_style().nicklen, Some(30));
    }

    #[test]
    fn absorbs_prefix_table_in_order() {
        let isup = unreal_style();
        assert_eq!(
            isup.prefixes,
            vec![('q', '~'), ('a', '&'), ('o', '@'), ('h', '%'), ('v', '+')]
        );
    }

    #[test]
    fn malformed_prefix_is_ignored() {
        let mut isup = Isupport::default();
        isup.absorb(&["PREFIX=(qa)~&@".into()]);
        assert!(isup.prefixes.is_empty());
        assert_eq!(isup.prefix_table(), DEFAULT_PREFIXES);
    }

    #[test]
    fn owner_outranks_op() {
        let isup = unreal_style();
        assert!(isup.is_prefix_more_powerful_than('~', '@'));
        assert!(isup.is_prefix_more_powerful_than('&', '@'));
        assert!(!isup.is_prefix_more_powerful_than('%', '@'));
        assert!(!isup.is_prefix_more_powerful_than('+', '@'));
        assert!(!isup.is_prefix_more_powerful_than('@', '@'));
    }

    #[test]
    fn unknown_prefix_is_powerless() {
        let isup = unreal_style();
        assert!(!isup.is_prefix_more_powerful_than('*', '@'));
    }

    #[test]
    fn operator_predicate() {
        let isup = unreal_style();
        assert!(isup.denotes_operator("@"));
        assert!(isup.denotes_operator("~"));
        assert!(isup.denotes_operator("&+"));
        assert!(!isup.denotes_operator("%"));
        assert!(!isup.denotes_operator("+"));
        assert!(!isup.denotes_operator(""));
    }

    #[test]
    fn splits_named_entries() {
        let isup = unreal_style();
        assert_eq!(isup.split_named_entry("@~wings"), ("@~", "wings"));
        assert_eq!(isup.split_named_entry("heron"), ("", "heron"));
        assert_eq!(isup.split_named_entry("+gull"), ("+", "gull"));
    }

    #[test]
    fn collects_names_payload() {
        let isup = unreal_style();
        let names = collect_names(&isup, "~wings @gull heron +tern");
        assert_eq!(names["wings"], "~");
        assert_eq!(names["gull"], "@");
        assert_eq!(names["heron"], "");
        assert_eq!(names["tern"], "+");
    }

    #[test]
    fn default_table_without_isupport() {
        let isup = Isupport::default();
        assert!(isup.denotes_operator("@"));
        assert!(!isup.denotes_operator("~")); // unknown without PREFIX
        assert_eq!(isup.nicklen, None);
    }
}
