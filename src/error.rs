//! The crate's single error taxonomy, covering both stream transport
//! failures and packet-level encode/decode failures.

use std::fmt;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure taxonomy described by the framework: transport errors
/// propagate from the underlying [`crate::stream::Stream`], the rest are
/// raised by packet combinators.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Failed to establish or acquire the underlying stream.
    #[error("failed to open stream")]
    StreamOpen(#[source] Option<Box<dyn std::error::Error + Send + Sync>>),

    /// A read failed, including a short read during an `exactly`-sized
    /// `recv`, or a missing terminator for `recv_until`/`recv_line`.
    #[error("stream read error: {0}")]
    StreamRead(String),

    /// A write failed.
    #[error("stream write error: {0}")]
    StreamWrite(String),

    /// The user-supplied value is incompatible with the packet: wrong
    /// type, out of range, a length mismatch, or conflicts with a value
    /// deduced from context.
    #[error("packet encode error: {0}")]
    PacketEncode(String),

    /// The bytes read are incompatible with the packet: unknown
    /// discriminant, failed checksum, text-decoding failure, or
    /// unexpected trailing bytes when `completely` decoding was requested.
    #[error("packet decode error: {0}")]
    PacketDecode(String),

    /// A value's dynamic type does not match what the packet expected.
    /// A sub-case of [`Error::PacketEncode`].
    #[error("packet value has the wrong type: expected {expected}, got {got}")]
    PacketObjType {
        /// Name of the type the packet expected.
        expected: &'static str,
        /// Name of the type actually supplied.
        got: &'static str,
    },

    /// A [`crate::packet::Validator`]/[`crate::dependent::Check`] predicate
    /// failed.
    #[error("packet validation failed: {0}")]
    PacketInvalid(String),

    /// `size(ctx)` could not be determined without consulting the stream.
    #[error("packet size cannot be determined: {0}")]
    NotSizeable(String),
}

impl Error {
    pub(crate) fn decode(msg: impl fmt::Display) -> Self {
        Error::PacketDecode(msg.to_string())
    }

    pub(crate) fn encode(msg: impl fmt::Display) -> Self {
        Error::PacketEncode(msg.to_string())
    }

    pub(crate) fn invalid(msg: impl fmt::Display) -> Self {
        Error::PacketInvalid(msg.to_string())
    }

    pub(crate) fn not_sizeable(msg: impl fmt::Display) -> Self {
        Error::NotSizeable(msg.to_string())
    }
}
