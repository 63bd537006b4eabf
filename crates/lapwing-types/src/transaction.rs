//! Transactional extension types
//!
//! Declare and Discharge ride the coordinator link as message bodies; the
//! coordinator answers a Declare with a Declared outcome carrying the txn-id.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability advertised by coordinators that support local transactions.
pub const TXN_LOCAL_TRANSACTIONS: &str = "amqp:local-transactions";

// ----------------------------------------------------------------------------
// Transaction Identifier
// ----------------------------------------------------------------------------

/// Opaque transaction identifier assigned by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub Bytes);

impl TxnId {
    pub fn from_slice(bytes: &[u8]) -> Self {
        TxnId(Bytes::copy_from_slice(bytes))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:")?;
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Coordinator Requests
// ----------------------------------------------------------------------------

/// Request that the coordinator allocate a new transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Declare {
    /// Global transaction handle, unused by this client.
    pub global_id: Option<Bytes>,
}

/// Request that the coordinator complete a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discharge {
    pub txn_id: TxnId,
    /// `true` rolls the transaction back, `false` commits it.
    pub fail: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_id_display() {
        let txn_id = TxnId::from_slice(&[0, 1, 2, 3]);
        assert_eq!(format!("{txn_id}"), "txn:00010203");
    }

    #[test]
    fn test_discharge_roundtrip() {
        let discharge = Discharge {
            txn_id: TxnId::from_slice(&[9, 8]),
            fail: true,
        };
        let encoded = bincode::serialize(&discharge).unwrap();
        let decoded: Discharge = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, discharge);
    }
}
