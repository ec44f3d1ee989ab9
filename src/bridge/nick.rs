//! Nick validation and coercion.
//!
//! IRC nicks are constrained by RFC 2812 §2.3.1 plus a server-advertised
//! `NICKLEN`. In lenient mode the desired nick is coerced into validity; in
//! strict mode any coercion is an error naming the rule violated.

use thiserror::Error;

/// Why a nick failed strict validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NickError {
    #[error("Nick '{0}' contains illegal characters.")]
    IllegalCharacters(String),
    #[error("Nick '{0}' must start with a letter.")]
    BadFirstCharacter(String),
    #[error("Nick '{nick}' is too long. (Max: {max})")]
    TooLong { nick: String, max: usize },
}

/// Characters RFC 2812 permits in a nick, beyond ASCII alphanumerics.
const SPECIALS: &[char] = &[']', '[', '^', '\\', '{', '}', '-', '`', '_', '|'];

fn is_nick_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || SPECIALS.contains(&c)
}

/// Validate a desired nick, coercing (lenient) or rejecting (strict).
///
/// Transformations, in order:
/// 1. strip characters outside the RFC 2812 nick alphabet;
/// 2. prepend `M` when the result does not begin with an ASCII letter
///    (generated guest identifiers can be all-digits);
/// 3. truncate to `nicklen` when the live session advertised one. Without a
///    live session no length check is applied: RFC 1459's 9-char default
///    is too small in practice and daemons coerce on their own.
pub fn validate_nick(nick: &str, strict: bool, nicklen: Option<usize>) -> Result<String, NickError> {
    let stripped: String = nick.chars().filter(|&c| is_nick_char(c)).collect();
    if strict && stripped != nick {
        return Err(NickError::IllegalCharacters(nick.to_owned()));
    }

    let fronted = if stripped.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        stripped
    } else {
        if strict {
            return Err(NickError::BadFirstCharacter(nick.to_owned()));
        }
        format!("M{stripped}")
    };

    match nicklen {
        Some(max) if fronted.len() > max => {
            if strict {
                Err(NickError::TooLong {
                    nick: nick.to_owned(),
                    max,
                })
            } else {
                Ok(fronted[..max].to_owned())
            }
        }
        _ => Ok(fronted),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_nick_passes_unchanged() {
        assert_eq!(validate_nick("wings", false, None).unwrap(), "wings");
        assert_eq!(validate_nick("wings", true, None).unwrap(), "wings");
    }

    #[test]
    fn rfc_specials_are_allowed() {
        let nick = "w[i]n`g^s{}|\\-_";
        assert_eq!(validate_nick(nick, true, None).unwrap(), nick);
    }

    #[test]
    fn lenient_coerces_digits_and_strips() {
        // Leading digit forces the M prefix; `!` is stripped.
        assert_eq!(validate_nick("123bob!", false, None).unwrap(), "M123bob");
    }

    #[test]
    fn strict_rejects_illegal_characters() {
        let err = validate_nick("123bob!", true, None).unwrap_err();
        assert!(err.to_string().contains("contains illegal characters"));
    }

    #[test]
    fn strict_rejects_leading_digit() {
        let err = validate_nick("123bob", true, None).unwrap_err();
        assert_eq!(err, NickError::BadFirstCharacter("123bob".into()));
    }

    #[test]
    fn nicklen_truncates_leniently() {
        assert_eq!(
            validate_nick("alexander", false, Some(9)).unwrap(),
            "alexander"
        );
        assert_eq!(
            validate_nick("alexandermax", false, Some(9)).unwrap(),
            "alexander"
        );
    }

    #[test]
    fn nicklen_rejects_strictly() {
        let err = validate_nick("alexandermax", true, Some(9)).unwrap_err();
        assert_eq!(err.to_string(), "Nick 'alexandermax' is too long. (Max: 9)");
    }

    #[test]
    fn no_length_check_without_nicklen() {
        let long = "a".repeat(64);
        assert_eq!(validate_nick(&long, true, None).unwrap(), long);
    }

    #[test]
    fn lenient_output_is_always_valid() {
        for input in ["", "!!!", "42", "émile", " spaced out ", "@alice:home"] {
            let out = validate_nick(input, false, Some(30)).unwrap();
            assert!(
                out.chars().next().is_some_and(|c| c.is_ascii_alphabetic()),
                "{input:?} → {out:?}"
            );
            assert!(out.chars().all(is_nick_char), "{input:?} → {out:?}");
            assert!(out.len() <= 30);
        }
    }

    #[test]
    fn strict_passes_iff_lenient_is_identity() {
        for input in ["wings", "123bob!", "ok_nick", "no spaces", "x"] {
            let lenient = validate_nick(input, false, None).unwrap();
            let strict = validate_nick(input, true, None);
            if lenient == input {
                assert_eq!(strict.unwrap(), input);
            } else {
                assert!(strict.is_err(), "{input:?} should fail strict");
            }
        }
    }
}
