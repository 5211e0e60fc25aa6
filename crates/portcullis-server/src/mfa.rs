//! TOTP code verification for the interactive mode.

use totp_lite::{Sha1, totp_custom};

const PERIOD: u64 = 30;
const DIGITS: u32 = 6;

/// Validate a one-time code against a base32-encoded shared secret.
///
/// Accepts one period of clock skew in either direction, matching the
/// validator the provisioning tooling enrolls secrets for.
pub fn verify_totp(secret_b32: &str, code: &str, now_unix: u64) -> bool {
    let Some(secret) =
        base32::decode(base32::Alphabet::Rfc4648 { padding: false }, secret_b32.trim())
    else {
        return false;
    };
    let code = code.trim();
    if code.len() != DIGITS as usize {
        return false;
    }
    for skew in [-1i64, 0, 1] {
        let t = now_unix.saturating_add_signed(skew * PERIOD as i64);
        if totp_custom::<Sha1>(PERIOD, DIGITS, &secret, t) == code {
            return true;
        }
    }
    false
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "JBSWY3DPEHPK3PXP";

    fn code_at(t: u64) -> String {
        let secret = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, SECRET).unwrap();
        totp_custom::<Sha1>(PERIOD, DIGITS, &secret, t)
    }

    #[test]
    fn accepts_current_code() {
        let now = 1_700_000_000;
        assert!(verify_totp(SECRET, &code_at(now), now));
    }

    #[test]
    fn accepts_one_period_of_skew() {
        let now = 1_700_000_000;
        assert!(verify_totp(SECRET, &code_at(now - PERIOD), now));
        assert!(verify_totp(SECRET, &code_at(now + PERIOD), now));
    }

    #[test]
    fn rejects_stale_code() {
        let now = 1_700_000_000;
        // Codes repeat eventually; three periods out is distinct for this
        // secret and timestamp.
        let stale = code_at(now - 3 * PERIOD);
        if stale != code_at(now) && stale != code_at(now - PERIOD) && stale != code_at(now + PERIOD)
        {
            assert!(!verify_totp(SECRET, &stale, now));
        }
    }

    #[test]
    fn rejects_malformed_input() {
        let now = 1_700_000_000;
        assert!(!verify_totp(SECRET, "12345", now));
        assert!(!verify_totp(SECRET, "1234567", now));
        assert!(!verify_totp("not!base32!", "123456", now));
    }

    #[test]
    fn tolerates_surrounding_whitespace() {
        let now = 1_700_000_000;
        let code = code_at(now);
        assert!(verify_totp(SECRET, &format!(" {code}\r\n"), now));
    }
}
