//! # datavault
//!
//! A personal data vault: an encrypted document store gated by multi-factor
//! authentication, a request/approval workflow, a conditional permission
//! engine, and signed, expiring data packages delivered through one-time
//! access tokens.
//!
//! ## Components
//!
//! - [`store`]: per-document AES-256-GCM at rest, keyed from a master key
//!   derived from the owner passphrase.
//! - [`auth`]: time-bound sessions issued from one or more factors.
//! - [`permissions`]: static grants with time, usage, recipient and purpose
//!   conditions.
//! - [`workflow`]: the `pending -> approved | rejected | expired` state
//!   machine for third-party data requests.
//! - [`package`]: filtered, watermarked, encrypted and signed transfer units.
//! - [`transport`]: one-time access tokens and URLs for a package.
//! - [`vault`]: the facade that wires them together for callers.
//!
//! Raw key bytes never leave the crate; `crypto` and `keys` are the only
//! modules that touch `ring`.

pub mod audit;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod keys;
pub mod package;
pub(crate) mod persist;
pub mod permissions;
pub mod store;
pub mod transport;
pub mod vault;
pub mod workflow;

use chrono::{DateTime, Duration, Utc};

pub use config::VaultConfig;
pub use error::{ErrorKind, VaultError, VaultResult};
pub use vault::Vault;

/// Current time truncated to whole milliseconds, the resolution every
/// persisted timestamp uses.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// `now + ttl`, rejecting lifetimes that are not positive or that leave the
/// representable time range.
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration, what: &str) -> VaultResult<DateTime<Utc>> {
    if ttl <= Duration::zero() {
        return Err(VaultError::validation(format!("{what} lifetime must be positive")));
    }
    now.checked_add_signed(ttl)
        .ok_or_else(|| VaultError::validation(format!("{what} lifetime is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_rejects_unrepresentable_lifetimes() {
        let now = now_millis();
        assert_eq!(expiry(now, Duration::hours(1), "token").unwrap(), now + Duration::hours(1));
        assert!(matches!(
            expiry(now, Duration::MAX, "token"),
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            expiry(now, Duration::zero(), "token"),
            Err(VaultError::Validation(_))
        ));
    }
}
