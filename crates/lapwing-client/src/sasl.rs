//! SASL negotiation support
//!
//! The driver runs the SASL exchange before issuing Open. Mechanism
//! selection intersects the peer's offer with the configured allow-list,
//! preferring ANONYMOUS when no credentials are configured. Only the
//! initial responses for ANONYMOUS and PLAIN are built in; anything richer
//! plugs in through [`SaslMechanism`].

use bytes::{BufMut, Bytes, BytesMut};

use lapwing_types::Symbol;

use crate::error::{ClientError, Result};
use crate::options::ConnectionOptions;

pub const MECH_ANONYMOUS: &str = "ANONYMOUS";
pub const MECH_PLAIN: &str = "PLAIN";

// ----------------------------------------------------------------------------
// Credentials
// ----------------------------------------------------------------------------

/// Credentials handed to the selected mechanism.
#[derive(Debug, Clone, Default)]
pub struct SaslCredentials {
    pub vhost: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SaslCredentials {
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            vhost: options.vhost.clone(),
            username: options.user.clone(),
            password: options.password.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Mechanisms
// ----------------------------------------------------------------------------

/// A SASL mechanism the client can respond with.
pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    /// Initial response carried on the Init frame.
    fn initial_response(&self, credentials: &SaslCredentials) -> Option<Bytes>;
}

struct Anonymous;

impl SaslMechanism for Anonymous {
    fn name(&self) -> &str {
        MECH_ANONYMOUS
    }

    fn initial_response(&self, _credentials: &SaslCredentials) -> Option<Bytes> {
        None
    }
}

struct Plain;

impl SaslMechanism for Plain {
    fn name(&self) -> &str {
        MECH_PLAIN
    }

    fn initial_response(&self, credentials: &SaslCredentials) -> Option<Bytes> {
        let username = credentials.username.as_deref().unwrap_or_default();
        let password = credentials.password.as_deref().unwrap_or_default();
        let mut response = BytesMut::with_capacity(2 + username.len() + password.len());
        response.put_u8(0);
        response.put_slice(username.as_bytes());
        response.put_u8(0);
        response.put_slice(password.as_bytes());
        Some(response.freeze())
    }
}

// ----------------------------------------------------------------------------
// Selector
// ----------------------------------------------------------------------------

/// Chooses a mechanism from the peer's offer.
#[derive(Debug, Clone)]
pub struct SaslMechanismSelector {
    allowed: Vec<String>,
    has_credentials: bool,
}

impl SaslMechanismSelector {
    pub fn from_options(options: &ConnectionOptions) -> Self {
        Self {
            allowed: options.sasl.allowed_mechanisms.clone(),
            has_credentials: options.user.is_some(),
        }
    }

    fn is_allowed(&self, name: &str) -> bool {
        self.allowed.is_empty() || self.allowed.iter().any(|allowed| allowed == name)
    }

    /// Pick a mechanism from the peer's offered list.
    ///
    /// ANONYMOUS is chosen when allowed and no username is configured;
    /// with credentials present the first allowed offered mechanism that
    /// is not ANONYMOUS wins.
    pub fn select(&self, offered: &[Symbol]) -> Result<Box<dyn SaslMechanism>> {
        let offered_names: Vec<&str> = offered.iter().map(Symbol::as_str).collect();

        if !self.has_credentials
            && offered_names.contains(&MECH_ANONYMOUS)
            && self.is_allowed(MECH_ANONYMOUS)
        {
            return Ok(Box::new(Anonymous));
        }

        for name in &offered_names {
            if !self.is_allowed(name) {
                continue;
            }
            match *name {
                MECH_PLAIN if self.has_credentials => return Ok(Box::new(Plain)),
                MECH_ANONYMOUS if !self.has_credentials => return Ok(Box::new(Anonymous)),
                _ => continue,
            }
        }

        Err(ClientError::io(format!(
            "no usable SASL mechanism in peer offer [{}]",
            offered_names.join(", ")
        )))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn offered(names: &[&str]) -> Vec<Symbol> {
        names.iter().map(|name| Symbol::from(*name)).collect()
    }

    #[test]
    fn test_anonymous_selected_without_credentials() {
        let options = ConnectionOptions::default();
        let selector = SaslMechanismSelector::from_options(&options);
        let mechanism = selector
            .select(&offered(&[MECH_PLAIN, MECH_ANONYMOUS]))
            .unwrap();
        assert_eq!(mechanism.name(), MECH_ANONYMOUS);
        assert!(mechanism
            .initial_response(&SaslCredentials::default())
            .is_none());
    }

    #[test]
    fn test_plain_selected_with_credentials() {
        let options = ConnectionOptions {
            user: Some("guest".to_string()),
            password: Some("secret".to_string()),
            ..ConnectionOptions::default()
        };
        let selector = SaslMechanismSelector::from_options(&options);
        let mechanism = selector
            .select(&offered(&[MECH_ANONYMOUS, MECH_PLAIN]))
            .unwrap();
        assert_eq!(mechanism.name(), MECH_PLAIN);

        let response = mechanism
            .initial_response(&SaslCredentials::from_options(&options))
            .unwrap();
        assert_eq!(&response[..], b"\0guest\0secret");
    }

    #[test]
    fn test_allow_list_filters_offer() {
        let options = ConnectionOptions {
            user: Some("guest".to_string()),
            sasl: crate::options::SaslOptions {
                enabled: true,
                allowed_mechanisms: vec!["EXTERNAL".to_string()],
            },
            ..ConnectionOptions::default()
        };
        let selector = SaslMechanismSelector::from_options(&options);
        assert!(selector.select(&offered(&[MECH_PLAIN])).is_err());
    }
}
