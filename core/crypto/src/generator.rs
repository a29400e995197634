//! Random password generation.
//!
//! Characters are drawn uniformly from the selected pool with the OS RNG.

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use zeroize::Zeroizing;

use credvault_common::{Error, Result};

/// Default generated length.
pub const DEFAULT_PASSWORD_LENGTH: usize = 20;

/// Longest password the generator will produce.
pub const MAX_PASSWORD_LENGTH: usize = 1024;

const UPPER: &str = "ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWER: &str = "abcdefghijkmnopqrstuvwxyz";
const DIGITS: &str = "23456789";
const SYMBOLS: &str = "!@#$%^&*()-_=+[]{};:,.?/";

const AMBIGUOUS_UPPER: &str = "IO";
const AMBIGUOUS_LOWER: &str = "lo";
const AMBIGUOUS_DIGITS: &str = "01";
const AMBIGUOUS_SYMBOLS: &str = "|`'\"\\<>";

/// Which characters a generated password may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordPolicy {
    /// Number of characters.
    pub length: usize,
    /// `A-Z`.
    pub upper: bool,
    /// `a-z`.
    pub lower: bool,
    /// `0-9`.
    pub digits: bool,
    /// Punctuation.
    pub symbols: bool,
    /// Leave out look-alikes such as `0`/`O` and `1`/`l`.
    pub avoid_ambiguous: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: DEFAULT_PASSWORD_LENGTH,
            upper: true,
            lower: true,
            digits: true,
            symbols: true,
            avoid_ambiguous: true,
        }
    }
}

impl PasswordPolicy {
    /// Characters a password may be drawn from.
    ///
    /// With every class disabled the pool falls back to lower-case letters
    /// and digits.
    pub fn pool(&self) -> Vec<char> {
        let classes = [
            (self.upper, UPPER, AMBIGUOUS_UPPER),
            (self.lower, LOWER, AMBIGUOUS_LOWER),
            (self.digits, DIGITS, AMBIGUOUS_DIGITS),
            (self.symbols, SYMBOLS, AMBIGUOUS_SYMBOLS),
        ];

        let mut pool = String::new();
        for (enabled, base, ambiguous) in classes {
            if enabled {
                pool.push_str(base);
                if !self.avoid_ambiguous {
                    pool.push_str(ambiguous);
                }
            }
        }
        if pool.is_empty() {
            pool.push_str(LOWER);
            pool.push_str(DIGITS);
        }
        pool.chars().collect()
    }
}

/// Generate a password under `policy`.
///
/// # Errors
/// - `Error::InvalidInput` if the length is 0 or above [`MAX_PASSWORD_LENGTH`]
///
/// # Security
/// - Every character is sampled uniformly from the pool using `OsRng`
pub fn generate_password(policy: &PasswordPolicy) -> Result<Zeroizing<String>> {
    if policy.length == 0 || policy.length > MAX_PASSWORD_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Password length must be within 1..={}",
            MAX_PASSWORD_LENGTH
        )));
    }

    let pool = policy.pool();
    let mut password = Zeroizing::new(String::with_capacity(policy.length));
    for _ in 0..policy.length {
        let c = pool
            .choose(&mut OsRng)
            .ok_or_else(|| Error::Crypto("Empty password pool".to_string()))?;
        password.push(*c);
    }
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ambiguous() -> Vec<char> {
        [AMBIGUOUS_UPPER, AMBIGUOUS_LOWER, AMBIGUOUS_DIGITS, AMBIGUOUS_SYMBOLS]
            .concat()
            .chars()
            .collect()
    }

    #[test]
    fn test_default_policy() {
        let password = generate_password(&PasswordPolicy::default()).unwrap();
        assert_eq!(password.chars().count(), DEFAULT_PASSWORD_LENGTH);
        assert!(!password.chars().any(|c| ambiguous().contains(&c)));
    }

    #[test]
    fn test_length_bounds() {
        for length in [0, MAX_PASSWORD_LENGTH + 1] {
            let policy = PasswordPolicy {
                length,
                ..PasswordPolicy::default()
            };
            assert!(matches!(
                generate_password(&policy),
                Err(Error::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_empty_selection_falls_back() {
        let policy = PasswordPolicy {
            upper: false,
            lower: false,
            digits: false,
            symbols: false,
            ..PasswordPolicy::default()
        };
        let password = generate_password(&policy).unwrap();
        assert!(password
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_ambiguous_included_when_allowed() {
        let policy = PasswordPolicy {
            avoid_ambiguous: false,
            ..PasswordPolicy::default()
        };
        let pool = policy.pool();
        for c in ambiguous() {
            assert!(pool.contains(&c), "missing {:?}", c);
        }
    }

    #[test]
    fn test_outputs_differ() {
        let a = generate_password(&PasswordPolicy::default()).unwrap();
        let b = generate_password(&PasswordPolicy::default()).unwrap();
        assert_ne!(*a, *b);
    }

    proptest! {
        #[test]
        fn prop_respects_policy(
            length in 1usize..64,
            upper in any::<bool>(),
            lower in any::<bool>(),
            digits in any::<bool>(),
            symbols in any::<bool>(),
            avoid_ambiguous in any::<bool>(),
        ) {
            let policy = PasswordPolicy { length, upper, lower, digits, symbols, avoid_ambiguous };
            let password = generate_password(&policy).unwrap();
            let pool = policy.pool();

            prop_assert_eq!(password.chars().count(), length);
            for c in password.chars() {
                prop_assert!(pool.contains(&c));
                if !upper && (lower || digits || symbols) {
                    prop_assert!(!c.is_ascii_uppercase());
                }
                if !symbols {
                    prop_assert!(c.is_ascii_alphanumeric());
                }
                if avoid_ambiguous {
                    prop_assert!(!ambiguous().contains(&c));
                }
            }
        }
    }
}
