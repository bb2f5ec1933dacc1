//! Defensive input validation at HTTP/store boundaries.

use crate::errors::SchedulerError;
use crate::model::{
    KASPA_MAINNET_PREFIX, KASPA_TESTNET_PREFIX, MAX_IDENTITY_LEN, MIN_CYCLE_INTERVAL_MS,
};

pub fn validate_identity(s: &str) -> Result<(), SchedulerError> {
    if s.is_empty() || s.len() > MAX_IDENTITY_LEN {
        return Err(SchedulerError::AgentIdRequired);
    }
    Ok(())
}

pub fn validate_wallet_address(addr: &str) -> Result<(), SchedulerError> {
    if addr.starts_with(KASPA_MAINNET_PREFIX) || addr.starts_with(KASPA_TESTNET_PREFIX) {
        Ok(())
    } else {
        Err(SchedulerError::WalletAddressRequired)
    }
}

pub fn validate_cycle_interval_ms(ms: u64) -> Result<(), SchedulerError> {
    if ms < MIN_CYCLE_INTERVAL_MS {
        return Err(SchedulerError::Invalid(format!(
            "cycle_interval_ms must be >= {}",
            MIN_CYCLE_INTERVAL_MS
        )));
    }
    Ok(())
}

pub fn validate_callback_url(url: &Option<String>) -> Result<(), SchedulerError> {
    match url {
        None => Ok(()),
        Some(u) if u.starts_with("http://") || u.starts_with("https://") => Ok(()),
        Some(_) => Err(SchedulerError::InvalidCallback),
    }
}

/// `[a-f0-9]{64}`, lower-case — execution-receipt `txid`.
pub fn validate_txid(txid: &str) -> bool {
    txid.len() == 64 && txid.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_mainnet_and_testnet_prefixes() {
        assert!(validate_wallet_address("kaspa:qpzry9x8").is_ok());
        assert!(validate_wallet_address("kaspatest:qpzry9x8").is_ok());
    }

    #[test]
    fn rejects_bad_prefix() {
        assert!(validate_wallet_address("bitcoin:qpzry9x8").is_err());
    }

    #[test]
    fn rejects_zero_cycle_interval() {
        assert!(validate_cycle_interval_ms(0).is_err());
        assert!(validate_cycle_interval_ms(999).is_err());
        assert!(validate_cycle_interval_ms(1000).is_ok());
    }

    #[test]
    fn txid_must_be_lowercase_hex_64() {
        assert!(validate_txid(&"a".repeat(64)));
        assert!(!validate_txid(&"A".repeat(64)));
        assert!(!validate_txid(&"a".repeat(63)));
        assert!(!validate_txid("not-hex-at-all-not-hex-at-all-not-hex-at-all-not-hex-at-all1234"));
    }
}
