//! One error enum per layer, each wrapping the layer below with `#[from]`
//! rather than flattening everything into a single god-enum.

use thiserror::Error;

use crate::codec::DecodePacketError;

/// What a probe observed instead of the outcome it was scripted to expect.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MatcherError {
    #[error("no matching reply arrived before the deadline")]
    Timeout,
    #[error("reply arrived for an address with no pending request")]
    UnsolicitedReply,
    #[error("scheduled deadline is implausibly far in the future, clock may have jumped")]
    ClockWarp,
    #[error("matcher loop has shut down")]
    Closed,
    #[error("a reply arrived but did not match the pending request's expectation")]
    PacketMismatch,
    #[error("reply carried an entry indistinguishable from an injected, unrequested one")]
    CorruptDht,
    #[error("reply arrived after its own expiration")]
    Expired,
    #[error("recovered sender id did not match the expected node id")]
    UnknownNode,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] DecodePacketError),
    #[error(transparent)]
    Matcher(#[from] MatcherError),
    #[error("node reference could not be parsed: {0}")]
    Node(#[from] crate::types::NodeError),
    #[error("configuration error: {0}")]
    Config(String),
}
