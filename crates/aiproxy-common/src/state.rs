use crate::ProxyError;

pub const MAX_STATE_LEN: usize = 128;

/// Validate an OAuth state token before it touches the session store or the
/// filesystem (states become part of callback file names).
pub fn validate_state(state: &str) -> Result<(), ProxyError> {
    if state.is_empty() {
        return Err(ProxyError::invalid("state must not be empty"));
    }
    if state.len() > MAX_STATE_LEN {
        return Err(ProxyError::invalid("state exceeds 128 characters"));
    }
    if state.contains("..") {
        return Err(ProxyError::invalid("state must not contain '..'"));
    }
    if !state
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
    {
        return Err(ProxyError::invalid(
            "state contains characters outside [A-Za-z0-9._-]",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{MAX_STATE_LEN, validate_state};

    #[test]
    fn accepts_urlsafe_tokens() {
        for ok in ["abc", "a.b-c_d", "A1", &"x".repeat(MAX_STATE_LEN)] {
            assert!(validate_state(ok).is_ok(), "state {ok:?}");
        }
    }

    #[test]
    fn rejects_traversal_and_separators() {
        for bad in [
            "",
            "a/b",
            "a\\b",
            "..",
            "a..b",
            "state with space",
            "emoji\u{1f600}",
            &"x".repeat(MAX_STATE_LEN + 1),
        ] {
            assert!(validate_state(bad).is_err(), "state {bad:?}");
        }
    }
}
