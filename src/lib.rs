//! # TarnFS Formatted-Node Storage Engine
//!
//! The storage engine for one formatted tree node: a fixed-size block
//! holding heterogeneous records ("items") behind a polymorphic plugin
//! interface, with the cut/kill and shift algorithms that keep a B-tree
//! of such nodes compact under insertion and deletion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Caller (tree / balancing layer)        │
//! │  applies CarryQueue side effects, owns locks  │
//! ├──────────────────────────────────────────────┤
//! │  Shift/Balance Engine   │   Cut/Kill Engine   │
//! │  (node::shift)          │   (node::cut)       │
//! ├──────────────────────────────────────────────┤
//! │        Node Layout Manager (node::layout)     │
//! │   lookup · create · resize · check · parse    │
//! ├──────────────────────────────────────────────┤
//! │        Item Plugin Registry (item::*)         │
//! │  stat-data · dir entries · node pointer ·     │
//! │  extent · tail · blob                         │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Node layout
//!
//! ```text
//! [ header | item bodies → ... free space ... ← item header table ]
//! ```
//!
//! Item bodies grow up from the node header; fixed-width item headers
//! (key, body offset, type id) grow down from the block end. Two layouts
//! exist: plain, and checksummed (same header plus a CRC32 over the
//! block).
//!
//! ## What this crate is not
//!
//! No I/O, no journaling, no page cache, no space allocation: the engine
//! works on already-resident buffers and reports its side effects (mark
//! dirty, update a delimiting key, remove an emptied node) through
//! [`tree::CarryQueue`] and the node dirty flag for the surrounding
//! layers to act on.
//!
//! ## Quick tour
//!
//! ```ignore
//! use tarnfs::{Coord, ItemRegistry, ItemType, Key, KeyType, Node, NodeFormat, NodeId};
//!
//! let reg = ItemRegistry::standard();
//! let mut node = Node::init(NodeId(7), 4096, NodeFormat::Plain, 0, 0)?;
//!
//! let key = Key::build(2, KeyType::StatData, 41, 0);
//! let body = tarnfs::item::stat_data::StatData::new(0o644, 1, 0);
//! node.create_item(&reg, &Coord::first_unit(&node), key, ItemType::StatData,
//!                  zerocopy::IntoBytes::as_bytes(&body), None)?;
//!
//! let found = node.lookup(&reg, &key, tarnfs::LookupBias::Exact)?;
//! assert!(found.found);
//! ```

pub mod config;
pub mod coord;
pub mod error;
pub mod item;
pub mod key;
pub mod node;
pub mod tree;

pub use coord::{Between, Coord};
pub use error::{is_corruption, NodeError};
pub use item::{
    BlockSink, ItemPlugin, ItemRegistry, ItemType, KillContext, LookupBias, NullSink,
    NullTracker, ShiftDir, ShiftTracker,
};
pub use key::{Key, KeyType};
pub use node::{
    shift, CheckFlags, CutOutcome, CutRange, Node, NodeFormat, NodeLookup, ShiftOutcome,
    ShiftParams, ShiftReport, Side,
};
pub use tree::{CarryOp, CarryQueue, DkStore, NodeId};
