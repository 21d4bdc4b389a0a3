/// Minimum passphrase strength enforced at setup and rotation.
///
/// Entropy is estimated as `len * log2(alphabet)` where the alphabet is the
/// union of the character classes present. Crude, but it rejects short and
/// single-class passphrases without a dictionary.
use crate::error::{CoreError, Result};

pub const MIN_LENGTH: usize = 8;
pub const DEFAULT_MIN_BITS: f64 = 40.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassphrasePolicy {
    pub min_length: usize,
    pub min_bits: f64,
}

impl Default for PassphrasePolicy {
    fn default() -> Self {
        Self {
            min_length: MIN_LENGTH,
            min_bits: DEFAULT_MIN_BITS,
        }
    }
}

impl PassphrasePolicy {
    pub fn with_min_bits(min_bits: f64) -> Self {
        Self {
            min_bits,
            ..Self::default()
        }
    }

    pub fn check(&self, passphrase: &str) -> Result<()> {
        let len = passphrase.chars().count();
        if len < self.min_length {
            return Err(CoreError::WeakPassphrase(format!(
                "must be at least {} characters",
                self.min_length
            )));
        }
        let distinct = {
            let mut chars: Vec<char> = passphrase.chars().collect();
            chars.sort_unstable();
            chars.dedup();
            chars.len()
        };
        if distinct < 4 {
            return Err(CoreError::WeakPassphrase(
                "too few distinct characters".to_string(),
            ));
        }
        let bits = estimate_bits(passphrase);
        if bits < self.min_bits {
            return Err(CoreError::WeakPassphrase(format!(
                "estimated {bits:.0} bits, need {:.0}",
                self.min_bits
            )));
        }
        Ok(())
    }
}

pub fn estimate_bits(passphrase: &str) -> f64 {
    let mut alphabet = 0u32;
    if passphrase.chars().any(|c| c.is_ascii_lowercase()) {
        alphabet += 26;
    }
    if passphrase.chars().any(|c| c.is_ascii_uppercase()) {
        alphabet += 26;
    }
    if passphrase.chars().any(|c| c.is_ascii_digit()) {
        alphabet += 10;
    }
    if passphrase.chars().any(|c| c.is_ascii_punctuation() || c == ' ') {
        alphabet += 33;
    }
    if passphrase.chars().any(|c| !c.is_ascii()) {
        alphabet += 100;
    }
    if alphabet == 0 {
        return 0.0;
    }
    passphrase.chars().count() as f64 * f64::from(alphabet).log2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_reasonable_passphrases() {
        let policy = PassphrasePolicy::default();
        assert!(policy.check("correct-horse").is_ok());
        assert!(policy.check("Tr0ub4dor&3").is_ok());
    }

    #[test]
    fn test_rejects_short() {
        assert!(matches!(
            PassphrasePolicy::default().check("abc"),
            Err(CoreError::WeakPassphrase(_))
        ));
    }

    #[test]
    fn test_rejects_repetitive() {
        assert!(PassphrasePolicy::default().check("aaaaaaaaaaaa").is_err());
        assert!(PassphrasePolicy::default().check("abababababab").is_err());
    }

    #[test]
    fn test_rejects_low_entropy() {
        // 8 digits: 8 * log2(10) ~ 26.6 bits
        assert!(PassphrasePolicy::default().check("12345678").is_err());
    }

    #[test]
    fn test_configurable_threshold() {
        assert!(PassphrasePolicy::with_min_bits(100.0)
            .check("correct-horse")
            .is_err());
    }
}
