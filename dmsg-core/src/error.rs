//! DMSG error taxonomy (spec §7), carried in `Ioq::error` and surfaced to
//! callers as synthetic `LNK_ERROR` messages rather than a bare `Result`
//! failure -- the protocol's own error path *is* a message.

/// One entry per condition spec §7's table names, in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DmsgError {
    #[error("peer closed the connection or read returned 0")]
    Eof,
    #[error("hard socket read/write error")]
    Sock,
    #[error("bad magic number, stream is not a dmsg header")]
    Sync,
    #[error("extended header size or aux length out of bounds")]
    Field,
    #[error("header CRC mismatch")]
    Xcrc,
    #[error("aux data CRC mismatch")]
    Acrc,
    #[error("salt sequence byte mismatch")]
    Msgseq,
    #[error("transaction state not found, duplicate create, or reused msgid")]
    Trans,
    #[error("benign ABORT+DELETE race against an already-closed transaction")]
    Ealready,
}

impl DmsgError {
    /// Whether this condition should be treated as terminal for the ioq
    /// (everything except `Ealready`, which callers discard and resume
    /// from, per spec §7).
    pub fn is_fatal(self) -> bool {
        !matches!(self, DmsgError::Ealready)
    }

    /// Numeric code carried in a synthesized `LNK_ERROR`'s `error` field
    /// (spec §6 header layout, §7 propagation).
    pub fn code(self) -> u32 {
        match self {
            DmsgError::Eof => 1,
            DmsgError::Sock => 2,
            DmsgError::Sync => 3,
            DmsgError::Field => 4,
            DmsgError::Xcrc => 5,
            DmsgError::Acrc => 6,
            DmsgError::Msgseq => 7,
            DmsgError::Trans => 8,
            DmsgError::Ealready => 9,
        }
    }
}
