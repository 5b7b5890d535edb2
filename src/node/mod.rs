//! # Formatted Node Layout
//!
//! A node is one fixed-size block laid out as:
//!
//! ```text
//! [ node header | item 0 body, item 1 body, ... | free space | ih N-1, ..., ih 1, ih 0 ]
//! ```
//!
//! Item bodies grow upward from the end of the node header; the item
//! header table grows downward from the end of the block, one fixed-width
//! entry per item. Between them sits the single free-space gap:
//!
//! ```text
//! free_space_start + free_space == block_size - nr_items * ITEM_HEADER_SIZE
//! ```
//!
//! Header entry `i` lives at `block_size - (i + 1) * ITEM_HEADER_SIZE`, so
//! ascending item position means descending table address. Each entry
//! carries the item's first key, its body offset, and its 2-byte item type
//! id. An item's length is implicit: the next item's offset (or
//! `free_space_start` for the last item) minus its own.
//!
//! ## Node header
//!
//! ```text
//! Offset  Size  Field             Notes
//! ------  ----  ----------------  --------------------------------------
//! 0       2     format_id         40 = plain, 41 = checksummed
//! 2       2     nr_items
//! 4       2     free_space        bytes in the gap
//! 6       2     free_space_start  offset of the gap
//! 8       4     magic
//! 12      4     mkfs_id           volume stamp, set at init
//! 16      8     flush_id          advanced by the (external) flush layer
//! 24      2     flags
//! 26      1     level             0 = leaf, 1 = twig, above = internal
//! 27      1     padding
//! 28      4     checksum          checksummed format only
//! ```
//!
//! The checksum covers the whole block except the checksum word itself and
//! is recomputed by [`Node::seal`] before the block goes back to disk.
//!
//! ## Concurrency
//!
//! A `Node` owns its buffer; `&mut Node` is the write lock and `&Node` the
//! read lock, enforced by the borrow checker rather than a runtime
//! primitive. The tree-wide delimiting-key lock lives in
//! [`crate::tree::DkStore`]. Nothing here blocks: the engine only ever
//! touches already-resident buffers.

mod cut;
mod layout;
mod shift;

pub use cut::{CutOutcome, CutRange};
pub use layout::{CheckFlags, NodeLookup};
pub use shift::{shift, ShiftOutcome, ShiftParams, ShiftReport, Side};

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use tracing::warn;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MAX_NODE_SIZE, MIN_NODE_SIZE};
use crate::coord::Coord;
use crate::error::NodeError;
use crate::item::{ItemPlugin, ItemRegistry, ItemView, ItemViewMut};
use crate::key::{Key, KEY_SIZE};
use crate::tree::NodeId;

pub const LEAF_LEVEL: u8 = 0;
pub const TWIG_LEVEL: u8 = 1;

/// Item placement rules by tree level, shared by the item plugins'
/// `allowed_on_level` implementations.
pub fn leaf_only(level: u8) -> bool {
    level == LEAF_LEVEL
}

pub fn twig_only(level: u8) -> bool {
    level == TWIG_LEVEL
}

pub fn internal_levels(level: u8) -> bool {
    level > LEAF_LEVEL
}

pub const NODE_HEADER_SIZE: usize = 28;
pub const CSUM_OFFSET: usize = NODE_HEADER_SIZE;
pub const ITEM_HEADER_SIZE: usize = KEY_SIZE + 4;

const MAGIC_PLAIN: u32 = u32::from_le_bytes(*b"TnF0");
const MAGIC_CSUM: u32 = u32::from_le_bytes(*b"TnF1");

const CSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// The two node layouts. They differ only in the header: the checksummed
/// format appends a 32-bit CRC to the plain header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFormat {
    Plain,
    Checksummed,
}

impl NodeFormat {
    pub fn header_size(self) -> usize {
        match self {
            NodeFormat::Plain => NODE_HEADER_SIZE,
            NodeFormat::Checksummed => NODE_HEADER_SIZE + 4,
        }
    }

    pub fn magic(self) -> u32 {
        match self {
            NodeFormat::Plain => MAGIC_PLAIN,
            NodeFormat::Checksummed => MAGIC_CSUM,
        }
    }

    pub fn format_id(self) -> u16 {
        match self {
            NodeFormat::Plain => 40,
            NodeFormat::Checksummed => 41,
        }
    }

    pub fn from_format_id(id: u16) -> Option<NodeFormat> {
        match id {
            40 => Some(NodeFormat::Plain),
            41 => Some(NodeFormat::Checksummed),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NodeHeader {
    format_id: U16,
    nr_items: U16,
    free_space: U16,
    free_space_start: U16,
    magic: U32,
    mkfs_id: U32,
    flush_id: U64,
    flags: U16,
    level: u8,
    pad: u8,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// One entry of the item header table at the end of the block.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ItemHeader {
    key: Key,
    offset: U16,
    type_id: U16,
}

const _: () = assert!(std::mem::size_of::<ItemHeader>() == ITEM_HEADER_SIZE);

impl ItemHeader {
    pub fn key(&self) -> Key {
        self.key
    }

    pub fn offset(&self) -> usize {
        self.offset.get() as usize
    }

    pub fn type_id(&self) -> u16 {
        self.type_id.get()
    }
}

/// One formatted node: an owned block buffer plus its identity.
pub struct Node {
    id: NodeId,
    format: NodeFormat,
    buf: Box<[u8]>,
    dirty: bool,
}

impl Node {
    /// Format a fresh node in a zeroed block.
    pub fn init(
        id: NodeId,
        block_size: usize,
        format: NodeFormat,
        level: u8,
        mkfs_id: u32,
    ) -> Result<Node> {
        ensure!(
            (MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&block_size),
            "unsupported block size {}",
            block_size
        );

        let mut node = Node {
            id,
            format,
            buf: vec![0u8; block_size].into_boxed_slice(),
            dirty: true,
        };
        let header_size = format.header_size();
        let header = node.header_mut();
        header.format_id = U16::new(format.format_id());
        header.magic = U32::new(format.magic());
        header.mkfs_id = U32::new(mkfs_id);
        header.level = level;
        header.free_space = U16::new((block_size - header_size) as u16);
        header.free_space_start = U16::new(header_size as u16);
        Ok(node)
    }

    /// Adopt a block read from disk, validating magic, format id and, for
    /// the checksummed layout, the block CRC. Level is checked against
    /// what the tree expects for this block, when known.
    pub fn parse(
        id: NodeId,
        buf: Vec<u8>,
        format: NodeFormat,
        expected_level: Option<u8>,
    ) -> Result<Node> {
        ensure!(
            (MIN_NODE_SIZE..=MAX_NODE_SIZE).contains(&buf.len()),
            "unsupported block size {}",
            buf.len()
        );

        let node = Node {
            id,
            format,
            buf: buf.into_boxed_slice(),
            dirty: false,
        };
        let header = node.header();

        if header.magic.get() != format.magic() {
            warn!(
                node = id.0,
                want = format.magic(),
                got = header.magic.get(),
                "wrong magic in tree node"
            );
            return Err(NodeError::Corrupt("wrong node magic").into());
        }
        if header.format_id.get() != format.format_id() {
            warn!(node = id.0, got = header.format_id.get(), "wrong node format id");
            return Err(NodeError::Corrupt("wrong node format id").into());
        }
        if let Some(level) = expected_level {
            if header.level != level {
                warn!(
                    node = id.0,
                    want = level,
                    got = header.level,
                    "wrong level found in node"
                );
                return Err(NodeError::Corrupt("wrong node level").into());
            }
        }
        if format == NodeFormat::Checksummed {
            let want = node.compute_checksum();
            let got = node.stored_checksum();
            if want != got {
                warn!(node = id.0, want, got, "node checksum mismatch");
                return Err(NodeError::Corrupt("node checksum mismatch").into());
            }
        }
        Ok(node)
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::ref_from_bytes(&self.buf[..NODE_HEADER_SIZE]).unwrap()
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        self.dirty = true;
        NodeHeader::mut_from_bytes(&mut self.buf[..NODE_HEADER_SIZE]).unwrap()
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn format(&self) -> NodeFormat {
        self.format
    }

    pub fn block_size(&self) -> usize {
        self.buf.len()
    }

    pub fn header_size(&self) -> usize {
        self.format.header_size()
    }

    pub fn level(&self) -> u8 {
        self.header().level
    }

    pub fn nr_items(&self) -> u16 {
        self.header().nr_items.get()
    }

    pub fn is_empty(&self) -> bool {
        self.nr_items() == 0
    }

    pub fn free_space(&self) -> usize {
        self.header().free_space.get() as usize
    }

    pub fn free_space_start(&self) -> usize {
        self.header().free_space_start.get() as usize
    }

    pub fn flush_id(&self) -> u64 {
        self.header().flush_id.get()
    }

    pub fn set_flush_id(&mut self, id: u64) {
        self.header_mut().flush_id = U64::new(id);
    }

    /// Whether the node was mutated since the last [`Node::mark_clean`].
    /// The transaction layer uses this to schedule write-back; the engine
    /// only ever raises the flag.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn set_nr_items(&mut self, count: u16) {
        self.header_mut().nr_items = U16::new(count);
    }

    pub(crate) fn set_free_space(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.block_size());
        self.header_mut().free_space = U16::new(bytes as u16);
    }

    pub(crate) fn set_free_space_start(&mut self, offset: usize) {
        debug_assert!(offset <= self.block_size());
        self.header_mut().free_space_start = U16::new(offset as u16);
    }

    fn ih_byte_range(&self, pos: u16) -> std::ops::Range<usize> {
        let end = self.block_size() - pos as usize * ITEM_HEADER_SIZE;
        end - ITEM_HEADER_SIZE..end
    }

    /// Item header table entry for position `pos`.
    pub fn ih(&self, pos: u16) -> &ItemHeader {
        debug_assert!(pos < self.nr_items(), "item position out of bounds");
        ItemHeader::ref_from_bytes(&self.buf[self.ih_byte_range(pos)]).unwrap()
    }

    pub(crate) fn ih_mut(&mut self, pos: u16) -> &mut ItemHeader {
        debug_assert!(pos < self.nr_items(), "item position out of bounds");
        self.dirty = true;
        let range = self.ih_byte_range(pos);
        ItemHeader::mut_from_bytes(&mut self.buf[range]).unwrap()
    }

    pub fn item_key(&self, pos: u16) -> Key {
        self.ih(pos).key()
    }

    pub fn item_offset(&self, pos: u16) -> usize {
        self.ih(pos).offset()
    }

    pub fn item_type_id(&self, pos: u16) -> u16 {
        self.ih(pos).type_id()
    }

    /// Rewrite an item's on-disk type id in place.
    pub fn set_item_type(&mut self, pos: u16, type_id: u16) {
        self.ih_mut(pos).type_id = U16::new(type_id);
    }

    /// Item length: distance to the next body, or to the free-space gap
    /// for the last item.
    pub fn item_length(&self, pos: u16) -> usize {
        let next = if pos == self.nr_items() - 1 {
            self.free_space_start()
        } else {
            self.item_offset(pos + 1)
        };
        debug_assert!(next >= self.item_offset(pos), "item offsets out of order");
        next - self.item_offset(pos)
    }

    pub fn item_body(&self, pos: u16) -> &[u8] {
        let offset = self.item_offset(pos);
        &self.buf[offset..offset + self.item_length(pos)]
    }

    pub fn item_body_mut(&mut self, pos: u16) -> &mut [u8] {
        self.dirty = true;
        let offset = self.item_offset(pos);
        let len = self.item_length(pos);
        &mut self.buf[offset..offset + len]
    }

    pub fn item_view(&self, pos: u16) -> ItemView<'_> {
        ItemView {
            key: self.item_key(pos),
            body: self.item_body(pos),
        }
    }

    pub fn item_view_mut(&mut self, pos: u16) -> ItemViewMut<'_> {
        let key = self.item_key(pos);
        ItemViewMut {
            key,
            body: self.item_body_mut(pos),
        }
    }

    pub fn plugin(
        &self,
        reg: &ItemRegistry,
        pos: u16,
    ) -> Result<&'static dyn ItemPlugin> {
        reg.get(self.item_type_id(pos))
    }

    pub fn num_units(&self, reg: &ItemRegistry, pos: u16) -> Result<usize> {
        Ok(self.plugin(reg, pos)?.nr_units(self.item_view(pos)))
    }

    /// Position of the last unit of item `pos`.
    pub fn last_unit_pos(&self, reg: &ItemRegistry, pos: u16) -> Result<u16> {
        Ok(self.num_units(reg, pos)?.saturating_sub(1) as u16)
    }

    pub fn unit_key(&self, reg: &ItemRegistry, coord: &Coord) -> Result<Key> {
        let plugin = self.plugin(reg, coord.item_pos)?;
        Ok(plugin.unit_key(self.item_view(coord.item_pos), coord.unit_pos as usize))
    }

    /// Coordinate of the last unit in the node.
    pub fn last_unit_coord(&self, reg: &ItemRegistry) -> Result<Coord> {
        if self.is_empty() {
            return Ok(Coord::first_unit(self));
        }
        let pos = self.nr_items() - 1;
        Ok(Coord::at(pos, self.last_unit_pos(reg, pos)?))
    }

    /// Per-item overhead of creating one more item in this node.
    pub fn item_overhead(&self) -> usize {
        ITEM_HEADER_SIZE
    }

    /// Usable payload space for one more item, after its header entry.
    pub fn estimate(&self) -> usize {
        self.free_space().saturating_sub(ITEM_HEADER_SIZE)
    }

    /// Largest item body this node could ever hold.
    pub fn max_item_size(&self) -> usize {
        self.block_size() - self.header_size() - ITEM_HEADER_SIZE
    }

    fn stored_checksum(&self) -> u32 {
        u32::from_le_bytes(self.buf[CSUM_OFFSET..CSUM_OFFSET + 4].try_into().unwrap())
    }

    fn compute_checksum(&self) -> u32 {
        let mut digest = CSUM.digest();
        digest.update(&self.buf[..CSUM_OFFSET]);
        digest.update(&self.buf[CSUM_OFFSET + 4..]);
        digest.finalize()
    }

    /// Refresh the block checksum; a no-op for the plain format. Call
    /// before handing the block back to the write-out layer.
    pub fn seal(&mut self) {
        if self.format == NodeFormat::Checksummed {
            let sum = self.compute_checksum();
            self.buf[CSUM_OFFSET..CSUM_OFFSET + 4].copy_from_slice(&sum.to_le_bytes());
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Box<[u8]> {
        self.buf
    }

    pub(crate) fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.buf
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("level", &self.level())
            .field("nr_items", &self.nr_items())
            .field("free_space", &self.free_space())
            .field("free_space_start", &self.free_space_start())
            .finish()
    }
}
