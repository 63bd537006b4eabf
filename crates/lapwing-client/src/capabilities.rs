//! Remote connection capabilities
//!
//! A small record derived from the peer's Open frame. Senders that need
//! the anonymous relay consult it; before the remote Open arrives it is
//! simply unknown and such senders wait.

use lapwing_types::definitions::ANONYMOUS_RELAY;
use lapwing_types::Open;

/// What the remote peer advertised in its Open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub anonymous_relay: bool,
}

impl Capabilities {
    pub fn from_remote_open(open: &Open) -> Self {
        Self {
            anonymous_relay: open
                .offered_capabilities
                .iter()
                .any(|capability| capability.as_str() == ANONYMOUS_RELAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapwing_types::Symbol;

    #[test]
    fn test_anonymous_relay_detected() {
        let open = Open {
            offered_capabilities: vec![Symbol::from("SOMETHING"), Symbol::from(ANONYMOUS_RELAY)],
            ..Open::default()
        };
        assert!(Capabilities::from_remote_open(&open).anonymous_relay);
    }

    #[test]
    fn test_missing_relay_capability() {
        let open = Open::default();
        assert!(!Capabilities::from_remote_open(&open).anonymous_relay);
    }
}
