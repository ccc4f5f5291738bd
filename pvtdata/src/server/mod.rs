pub mod anti_entropy;
pub mod committer;
pub mod dissemination;
pub mod endorsement;
pub mod endorser;
pub mod membership;
pub mod registry;
pub mod storage;
pub mod withp2p;

use thiserror::Error;

/// Text every caller sees for private data it cannot read, whether the node
/// is not a member or simply has not received the payload yet.
pub const UNAVAILABLE_MSG: &str = "private data matching public hash version is not available";

#[derive(Error, Debug)]
pub enum PvtDataError {
    #[error("private data matching public hash version is not available")]
    Unavailable,
    #[error("payload for {collection}/{key} does not match its public commitment")]
    IntegrityMismatch { collection: String, key: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("chaincode error: {0}")]
    Chaincode(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("openssl error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

pub type PvtResult<T> = Result<T, PvtDataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_text_is_fixed() {
        assert_eq!(PvtDataError::Unavailable.to_string(), UNAVAILABLE_MSG);
    }
}
