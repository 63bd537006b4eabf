//! Error types for the lapwing client
//!
//! One discriminated taxonomy covers every failure the client surfaces.
//! Remotely-closed kinds carry the peer's error condition so callers and
//! tests can assert on it; the rendered message always includes the peer's
//! description when one was given.

use thiserror::Error;

use lapwing_types::ErrorCondition;

// ----------------------------------------------------------------------------
// Client Error Taxonomy
// ----------------------------------------------------------------------------

/// Every error kind the client can raise.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Operation on an already-closed resource.
    #[error("{message}")]
    Closed { message: String },

    /// The operation is not legal in the resource's current state.
    #[error("illegal state: {message}")]
    IllegalState { message: String },

    /// A scheduled deadline fired before the remote responded.
    #[error("operation timed out: {message}")]
    OperationTimedOut { message: String },

    /// A send blocked waiting for credit past its deadline.
    #[error("send timed out: {message}")]
    SendTimedOut { message: String },

    /// The peer closed the connection, or the transport dropped.
    #[error("connection remotely closed: {message}")]
    ConnectionRemotelyClosed {
        condition: Option<ErrorCondition>,
        message: String,
    },

    /// The peer ended the session.
    #[error("session remotely closed: {message}")]
    SessionRemotelyClosed {
        condition: Option<ErrorCondition>,
        message: String,
    },

    /// The peer detached the link with an error.
    #[error("link remotely closed: {message}")]
    LinkRemotelyClosed {
        condition: Option<ErrorCondition>,
        message: String,
    },

    /// A parent resource closed while this operation was in flight.
    #[error("resource remotely closed: {message}")]
    ResourceRemotelyClosed {
        condition: Option<ErrorCondition>,
        message: String,
    },

    /// A send's disposition came back Modified.
    #[error("delivery modified by peer (failed={delivery_failed}, undeliverable-here={undeliverable_here})")]
    DeliveryModified {
        delivery_failed: bool,
        undeliverable_here: bool,
    },

    /// The coordinator refused the Declare.
    #[error("transaction declaration failed: {message}")]
    TransactionDeclarationFailed {
        condition: Option<ErrorCondition>,
        message: String,
    },

    /// Commit or rollback without a live transaction.
    #[error("no transaction is active on this session")]
    TransactionNotActive,

    /// The coordinator rejected the discharge.
    #[error("transaction rolled back: {message}")]
    TransactionRolledBack {
        condition: Option<ErrorCondition>,
        message: String,
    },

    /// The peer does not support the requested operation.
    #[error("unsupported operation: {message}")]
    UnsupportedOperation { message: String },

    /// Transport or codec failure that fits no more specific kind.
    #[error("io error: {message}")]
    Io { message: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

// ----------------------------------------------------------------------------
// Constructors
// ----------------------------------------------------------------------------

fn describe(what: &str, condition: &Option<ErrorCondition>) -> String {
    match condition {
        Some(condition) => format!("{what}: {condition}"),
        None => what.to_string(),
    }
}

impl ClientError {
    pub fn closed<M: Into<String>>(message: M) -> Self {
        ClientError::Closed {
            message: message.into(),
        }
    }

    pub fn illegal_state<M: Into<String>>(message: M) -> Self {
        ClientError::IllegalState {
            message: message.into(),
        }
    }

    pub fn operation_timed_out<M: Into<String>>(message: M) -> Self {
        ClientError::OperationTimedOut {
            message: message.into(),
        }
    }

    pub fn send_timed_out<M: Into<String>>(message: M) -> Self {
        ClientError::SendTimedOut {
            message: message.into(),
        }
    }

    pub fn connection_remotely_closed(condition: Option<ErrorCondition>) -> Self {
        let message = describe("the connection was closed by the remote peer", &condition);
        ClientError::ConnectionRemotelyClosed { condition, message }
    }

    pub fn session_remotely_closed(condition: Option<ErrorCondition>) -> Self {
        let message = describe("the session was ended by the remote peer", &condition);
        ClientError::SessionRemotelyClosed { condition, message }
    }

    pub fn link_remotely_closed(condition: Option<ErrorCondition>) -> Self {
        let message = describe("the link was detached by the remote peer", &condition);
        ClientError::LinkRemotelyClosed { condition, message }
    }

    pub fn resource_remotely_closed(condition: Option<ErrorCondition>) -> Self {
        let message = describe("a parent resource was remotely closed", &condition);
        ClientError::ResourceRemotelyClosed { condition, message }
    }

    pub fn transaction_declaration_failed(condition: Option<ErrorCondition>) -> Self {
        let message = describe("the coordinator refused the declare", &condition);
        ClientError::TransactionDeclarationFailed { condition, message }
    }

    pub fn transaction_rolled_back(condition: Option<ErrorCondition>) -> Self {
        let message = describe("the discharge was rejected", &condition);
        ClientError::TransactionRolledBack { condition, message }
    }

    pub fn unsupported_operation<M: Into<String>>(message: M) -> Self {
        ClientError::UnsupportedOperation {
            message: message.into(),
        }
    }

    pub fn io<M: Into<String>>(message: M) -> Self {
        ClientError::Io {
            message: message.into(),
        }
    }

    /// The peer's error condition, for kinds that carry one.
    pub fn remote_condition(&self) -> Option<&ErrorCondition> {
        match self {
            ClientError::ConnectionRemotelyClosed { condition, .. }
            | ClientError::SessionRemotelyClosed { condition, .. }
            | ClientError::LinkRemotelyClosed { condition, .. }
            | ClientError::ResourceRemotelyClosed { condition, .. }
            | ClientError::TransactionDeclarationFailed { condition, .. }
            | ClientError::TransactionRolledBack { condition, .. } => condition.as_ref(),
            _ => None,
        }
    }

    /// Whether this kind poisons the whole connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectionRemotelyClosed { .. } | ClientError::Io { .. }
        )
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use lapwing_types::definitions::conditions;

    #[test]
    fn test_remote_condition_surfaces_description() {
        let error = ClientError::transaction_declaration_failed(Some(ErrorCondition::new(
            conditions::NOT_IMPLEMENTED,
            "coordinator refused",
        )));
        assert!(error.to_string().contains("coordinator refused"));
        assert_eq!(
            error.remote_condition().unwrap().condition.as_str(),
            conditions::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ClientError::connection_remotely_closed(None).is_fatal());
        assert!(ClientError::io("stream reset").is_fatal());
        assert!(!ClientError::send_timed_out("no credit").is_fatal());
        assert!(!ClientError::TransactionNotActive.is_fatal());
    }

    #[test]
    fn test_plain_kinds_have_no_condition() {
        assert!(ClientError::closed("the connection is closed")
            .remote_condition()
            .is_none());
    }
}
