//! # Engine Configuration Constants
//!
//! Interdependent constants are co-located here so that a change to one is
//! made in sight of the values that depend on it.
//!
//! ```text
//! DATA_BLOCK_SIZE (4096 bytes)
//!       │
//!       └─> extent item unit keys advance in multiples of this; the engine
//!           itself never reads or writes data blocks, it only does the key
//!           arithmetic for block runs.
//!
//! DEFAULT_NODE_SIZE (4096 bytes)
//!       │
//!       ├─> must fit in a u16 offset (header stores free_space_start as u16)
//!       │
//!       └─> tests use much smaller nodes (256..1024) to force edge cases;
//!           every layout routine works off buf.len(), not this constant.
//!
//! SEQ_SEARCH_BREAK (16 items)
//!       │
//!       └─> lookup switches from binary search to a sequential scan once the
//!           candidate range is below this. Sequential scan over the item
//!           header table is a tight, cache-friendly loop; binary search over
//!           a small range mostly produces cache misses.
//! ```

/// Size of one data block referenced by extent items. Key offsets of file
/// bodies are byte offsets, so consecutive extent units are `width * this`
/// apart in key space.
pub const DATA_BLOCK_SIZE: u64 = 4096;

/// Default formatted-node size. Nodes of any size up to [`MAX_NODE_SIZE`]
/// are supported; this is what callers use when they have no opinion.
pub const DEFAULT_NODE_SIZE: usize = 4096;

/// Node offsets are stored as u16 in headers, which caps the node size.
pub const MAX_NODE_SIZE: usize = u16::MAX as usize;

/// Smallest node the engine accepts: enough for the checksummed header, one
/// item header and a few bytes of body.
pub const MIN_NODE_SIZE: usize = 128;

/// Below this many candidate items, `lookup` scans sequentially instead of
/// bisecting.
pub const SEQ_SEARCH_BREAK: usize = 16;

const _: () = assert!(SEQ_SEARCH_BREAK > 2);
const _: () = assert!(DEFAULT_NODE_SIZE <= MAX_NODE_SIZE);
const _: () = assert!(MIN_NODE_SIZE <= DEFAULT_NODE_SIZE);
