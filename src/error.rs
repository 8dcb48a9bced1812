//! Error types for consensus validation, storage and networking

use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Script execution failed: {0}")]
    ScriptExecution(String),

    #[error("UTXO not found: {0}")]
    UtxoNotFound(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    #[error("Economic validation failed: {0}")]
    EconomicValidation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Consensus rule violation: {0}")]
    ConsensusRuleViolation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// How the chain classifies a block that failed to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockErrorKind {
    /// Consensus failure; the delivering peer gets banned and the node is marked dead.
    Fatal,
    /// Already known, nothing to do.
    Duplicate,
    /// Parent unknown (or similar transient state); may succeed later.
    MaybeLater,
    /// Local storage failure; the block itself is not at fault.
    Storage,
}

/// Block acceptance failure with a coded reason.
///
/// Reasons follow the `description - RPC_Result:code` convention so the RPC
/// layer can report the short code only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockError {
    pub kind: BlockErrorKind,
    pub reason: String,
}

impl BlockError {
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            kind: BlockErrorKind::Fatal,
            reason: reason.into(),
        }
    }

    pub fn duplicate(reason: impl Into<String>) -> Self {
        Self {
            kind: BlockErrorKind::Duplicate,
            reason: reason.into(),
        }
    }

    pub fn maybe_later(reason: impl Into<String>) -> Self {
        Self {
            kind: BlockErrorKind::MaybeLater,
            reason: reason.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self {
            kind: BlockErrorKind::Storage,
            reason: reason.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == BlockErrorKind::Fatal
    }

    /// Tail of the reason after `RPC_Result:`, or the whole reason when absent.
    pub fn rpc_result(&self) -> &str {
        match self.reason.find("RPC_Result:") {
            Some(idx) => &self.reason[idx + "RPC_Result:".len()..],
            None => &self.reason,
        }
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for BlockError {}

impl From<ConsensusError> for BlockError {
    fn from(err: ConsensusError) -> Self {
        BlockError::fatal(err.to_string())
    }
}

/// What the peer layer should do about a misbehaving connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPenalty {
    Disconnect,
    Misbehave(u32),
    Ban,
}

/// Connection level failures.
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("bad magic")]
    BadMagic,

    #[error("bad checksum for {0}")]
    BadChecksum(String),

    #[error("message {command} too big ({size} bytes)")]
    Oversize { command: String, size: usize },

    #[error("malformed {command}: {reason}")]
    Malformed { command: String, reason: String },

    #[error("send buffer overflow")]
    SendBufferOverflow,

    #[error("timeout: {0}")]
    Timeout(&'static str),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("banned: {0}")]
    Banned(String),

    #[error("disconnected")]
    Disconnected,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerError {
    pub fn penalty(&self) -> PeerPenalty {
        match self {
            PeerError::BadChecksum(_) | PeerError::Oversize { .. } | PeerError::Malformed { .. } => {
                PeerPenalty::Ban
            }
            PeerError::Banned(_) => PeerPenalty::Ban,
            _ => PeerPenalty::Disconnect,
        }
    }
}

impl From<ConsensusError> for PeerError {
    fn from(err: ConsensusError) -> Self {
        PeerError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_result_tail() {
        let err = BlockError::fatal("CheckBlock() : merkle mismatch - RPC_Result:bad-txnmrklroot");
        assert_eq!(err.rpc_result(), "bad-txnmrklroot");
        assert!(err.is_fatal());

        let err = BlockError::maybe_later("parent not found");
        assert_eq!(err.rpc_result(), "parent not found");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_peer_penalty() {
        assert_eq!(PeerError::BadMagic.penalty(), PeerPenalty::Disconnect);
        assert_eq!(PeerError::BadChecksum("tx".into()).penalty(), PeerPenalty::Ban);
        assert_eq!(
            PeerError::Oversize { command: "inv".into(), size: 1 << 30 }.penalty(),
            PeerPenalty::Ban
        );
    }
}
