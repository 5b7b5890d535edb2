//! # Error Taxonomy
//!
//! The crate-wide result carrier is `eyre::Result`, same as everywhere else
//! in the codebase. Errors a caller must be able to *distinguish* carry a
//! [`NodeError`] as their root cause, so the filesystem layer can decide
//! whether a failure is fatal (mount-time corruption) or recoverable
//! (runtime log-and-continue, retry after making space):
//!
//! - [`NodeError::Corrupt`]: an on-disk invariant does not hold: bad magic,
//!   checksum mismatch, keys out of order mid-node. Never silently repaired.
//! - [`NodeError::NoSpace`]: a create/paste did not fit. The node is left
//!   untouched; callers are expected to have estimated first.
//! - [`NodeError::UnknownItemType`]: an item header names a type id the
//!   registry does not know; corruption-class.
//!
//! Logical misuse (coordinates pointing at nothing, cut ranges the engine
//! documents as unsupported) is a caller bug, not bad data, and is reported
//! through plain `bail!`/`ensure!` without a typed kind.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node corrupt: {0}")]
    Corrupt(&'static str),

    #[error("not enough free space in node: need {need}, have {have}")]
    NoSpace { need: usize, have: usize },

    #[error("unknown item type id {0:#06x}")]
    UnknownItemType(u16),
}

/// True when `err` bottoms out in a [`NodeError::Corrupt`] or
/// [`NodeError::UnknownItemType`]; used by callers that treat corruption
/// differently from everything else.
pub fn is_corruption(err: &eyre::Report) -> bool {
    matches!(
        err.downcast_ref::<NodeError>(),
        Some(NodeError::Corrupt(_)) | Some(NodeError::UnknownItemType(_))
    )
}
