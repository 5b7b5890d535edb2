//! # Item Plugins
//!
//! A node stores heterogeneous records (stat-data, directory entries,
//! tree pointers, extents, inline file bytes) and interprets none of them.
//! Everything type-specific goes through the [`ItemPlugin`] trait, resolved
//! from the 2-byte type id in the item's header via an [`ItemRegistry`].
//! The layout, cut/kill and shift engines only ever see the capability set
//! below, so adding a record type means one new plugin implementation and
//! zero engine changes.
//!
//! ## Units
//!
//! An item has one or more *units*, the smallest pieces addressable by key:
//! a directory item's units are its entries, an extent's units are block
//! runs, a tail's units are single bytes. Atomic items (stat-data, blobs)
//! have exactly one unit and refuse partial operations.
//!
//! ## The cut placement contract
//!
//! `cut_units`/`kill_units` remove an inclusive unit range `[from, to]` and
//! report how many body bytes that freed. The caller compacts the node
//! afterwards, so the plugin must leave the freed bytes where the engine
//! expects them:
//!
//! ```text
//! from > 0   (tail or mid cut)   survivors keep the body's start,
//!                                freed space ends up at the body's end
//! from == 0  (head cut)          survivors move to the body's end,
//!                                freed space ends up at the body's start,
//!                                and `new_first_key` must be reported
//! ```
//!
//! ## Registry
//!
//! The registry is built once at startup and passed by shared reference;
//! no process-wide statics. Plugins themselves are stateless unit structs
//! with `'static` lifetime.

pub mod blob;
pub mod dir_entry;
pub mod extent;
pub mod node_pointer;
pub mod stat_data;
pub mod tail;

use eyre::{bail, Result};

use crate::coord::Between;
use crate::error::NodeError;
use crate::key::Key;
use crate::tree::NodeId;

/// On-disk item type identifiers. The numeric values are part of the node
/// format and must never be renumbered.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    StatData = 1,
    SimpleDirEntry = 2,
    CompoundDirEntry = 3,
    NodePointer = 4,
    Extent = 5,
    Tail = 6,
    Blob = 7,
}

impl ItemType {
    pub fn from_u16(id: u16) -> Option<ItemType> {
        match id {
            1 => Some(ItemType::StatData),
            2 => Some(ItemType::SimpleDirEntry),
            3 => Some(ItemType::CompoundDirEntry),
            4 => Some(ItemType::NodePointer),
            5 => Some(ItemType::Extent),
            6 => Some(ItemType::Tail),
            7 => Some(ItemType::Blob),
            _ => None,
        }
    }
}

/// Read-only view of one item: its header key and body bytes.
#[derive(Clone, Copy)]
pub struct ItemView<'a> {
    pub key: Key,
    pub body: &'a [u8],
}

/// Mutable view of one item.
pub struct ItemViewMut<'a> {
    pub key: Key,
    pub body: &'a mut [u8],
}

impl<'a> ItemViewMut<'a> {
    pub fn as_view(&self) -> ItemView<'_> {
        ItemView {
            key: self.key,
            body: &*self.body,
        }
    }
}

/// Search bias for lookups: `Exact` wants the key itself, `Floor` accepts
/// the greatest position not above the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupBias {
    Exact,
    Floor,
}

/// Direction of a shift between siblings: `Left` moves leading content of
/// the source into the node before it, `Right` moves trailing content into
/// the node after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftDir {
    Left,
    Right,
}

/// Outcome of a unit-level lookup inside one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitLookup {
    pub found: bool,
    pub unit_pos: u16,
    pub between: Between,
}

/// How much of an item fits into a given amount of free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShiftFit {
    pub units: usize,
    pub bytes: usize,
}

/// Side results of a unit-level cut/kill.
#[derive(Debug, Default)]
pub struct CutUnitsOut {
    /// Key of the smallest unit actually destroyed.
    pub smallest_removed: Option<Key>,
    /// New key of the item, when its first unit was removed.
    pub new_first_key: Option<Key>,
}

/// Narrow contract to the space layer: kill hooks release the block runs
/// their item referenced. The engine performs no I/O and no allocation
/// decisions itself.
pub trait BlockSink {
    fn release(&mut self, start: u64, width: u64);
}

/// Sink that drops every release on the floor; for cut paths of callers
/// that track space elsewhere.
pub struct NullSink;

impl BlockSink for NullSink {
    fn release(&mut self, _start: u64, _width: u64) {}
}

/// Carried through every kill so item destructors can reach the space
/// layer.
pub struct KillContext<'a> {
    pub blocks: &'a mut dyn BlockSink,
}

/// External back-reference table told when units change their owning node,
/// e.g. pages backing an extent. Shift hooks feed it.
pub trait ShiftTracker {
    fn units_moved(&mut self, item_key: &Key, from: usize, count: usize, new_home: NodeId);
}

/// Tracker for callers without external back-references.
pub struct NullTracker;

impl ShiftTracker for NullTracker {
    fn units_moved(&mut self, _item_key: &Key, _from: usize, _count: usize, _new_home: NodeId) {}
}

/// The capability set every item type implements. Methods with defaults are
/// optional capabilities; the default is the documented identity/no-op.
pub trait ItemPlugin: Sync {
    fn item_type(&self) -> ItemType;

    fn name(&self) -> &'static str;

    /// Whether items of this type may live on a node of the given level.
    fn allowed_on_level(&self, level: u8) -> bool;

    fn nr_units(&self, item: ItemView<'_>) -> usize;

    /// Key of unit `unit`; `unit` must be below [`ItemPlugin::nr_units`].
    fn unit_key(&self, item: ItemView<'_>, unit: usize) -> Key;

    /// Largest key this item could ever hold. `None` means the item key is
    /// the only key (single-unit record types).
    fn max_key_inside(&self, item: ItemView<'_>) -> Option<Key> {
        let _ = item;
        None
    }

    /// Largest key actually present in the item right now. Types whose
    /// last unit spans a key range (extents) override this with the key
    /// of the last covered position.
    fn max_real_key(&self, item: ItemView<'_>) -> Key {
        self.unit_key(item, self.nr_units(item).saturating_sub(1))
    }

    /// Whether `key` addresses something this item could contain.
    fn can_contain_key(&self, item: ItemView<'_>, key: &Key) -> bool {
        item.key.same_object(key)
    }

    /// Whether `right` can be coalesced onto the end of `left`. Both items
    /// must be of this plugin's type.
    fn mergeable(&self, left: ItemView<'_>, right: ItemView<'_>) -> bool {
        let _ = (left, right);
        false
    }

    /// Refine a node-level lookup to a unit position. The default is
    /// single-unit semantics: any greater key sits after the only unit.
    fn lookup(&self, item: ItemView<'_>, key: &Key, bias: LookupBias) -> UnitLookup {
        let _ = item;
        let _ = key;
        UnitLookup {
            found: bias == LookupBias::Floor,
            unit_pos: 0,
            between: Between::AfterUnit,
        }
    }

    /// Prepare a freshly allocated, empty body (used when a shift creates
    /// a partial copy of this item in the target node).
    fn init(&self, body: &mut [u8]) {
        let _ = body;
    }

    /// Splice `payload` (encoded units) into an existing item at unit index
    /// `insert_at`. The body has already been grown by `payload.len()`;
    /// `old_len` is its length before growth, so the gap sits at
    /// `body[old_len..]`.
    fn paste(
        &self,
        item: ItemViewMut<'_>,
        insert_at: usize,
        payload: &[u8],
        old_len: usize,
    ) -> Result<()> {
        let _ = (item, insert_at, payload, old_len);
        bail!("{} items are atomic and cannot be pasted into", self.name());
    }

    /// Remove units `[from, to]` (inclusive) under the cut placement
    /// contract described in the module docs. Returns freed body bytes.
    fn cut_units(
        &self,
        item: ItemViewMut<'_>,
        from: usize,
        to: usize,
        out: &mut CutUnitsOut,
    ) -> Result<usize>;

    /// Like [`ItemPlugin::cut_units`], but the removed units are being
    /// destroyed for good, so the type's destructor runs (e.g. extents
    /// release their block runs). Types without external state kill the
    /// way they cut.
    fn kill_units(
        &self,
        item: ItemViewMut<'_>,
        from: usize,
        to: usize,
        kill: &mut KillContext<'_>,
        out: &mut CutUnitsOut,
    ) -> Result<usize> {
        let _ = kill;
        self.cut_units(item, from, to, out)
    }

    /// How many of `want` boundary units of `source` fit into `free_space`
    /// body bytes. `dir == Left` counts leading units, `dir == Right`
    /// trailing ones. `into_existing` says whether the units would merge
    /// into an existing item of this type or seed a fresh one; types
    /// with per-item body overhead charge it in the fresh case.
    fn can_shift(
        &self,
        free_space: usize,
        source: ItemView<'_>,
        dir: ShiftDir,
        want: usize,
        into_existing: bool,
    ) -> ShiftFit;

    /// Copy units `[from, from + count)` of `source` into `target`, whose
    /// body already contains a `free_space`-byte gap: at the end for
    /// `Left`, at the start for `Right`. The plugin fixes up any internal
    /// bookkeeping (unit counts, offsets) itself.
    fn copy_units(
        &self,
        target: ItemViewMut<'_>,
        source: ItemView<'_>,
        from: usize,
        count: usize,
        dir: ShiftDir,
        free_space: usize,
    ) -> Result<()>;

    /// Called once after an item was created in a node.
    fn create_hook(&self, item: ItemView<'_>) {
        let _ = item;
    }

    /// Destructor for whole-item removal on the kill path.
    fn kill_hook(
        &self,
        item: ItemView<'_>,
        from: usize,
        count: usize,
        kill: &mut KillContext<'_>,
    ) {
        let _ = (item, from, count, kill);
    }

    /// Called after units of this item were physically relocated to
    /// another node, before coordinates are fixed up.
    fn shift_hook(
        &self,
        item: ItemView<'_>,
        from: usize,
        count: usize,
        new_home: NodeId,
        refs: &mut dyn ShiftTracker,
    ) {
        let _ = (item, from, count, new_home, refs);
    }
}

pub const MAX_ITEM_TYPES: usize = 16;

/// Read-only table from on-disk item type id to plugin. Built once,
/// passed by shared reference to every engine entry point.
pub struct ItemRegistry {
    slots: [Option<&'static dyn ItemPlugin>; MAX_ITEM_TYPES],
}

impl ItemRegistry {
    pub fn empty() -> ItemRegistry {
        ItemRegistry {
            slots: [None; MAX_ITEM_TYPES],
        }
    }

    /// Registry with every built-in item type.
    pub fn standard() -> ItemRegistry {
        let mut reg = ItemRegistry::empty();
        reg.register(&stat_data::StatDataItem);
        reg.register(&dir_entry::SimpleDirEntryItem);
        reg.register(&dir_entry::CompoundDirEntryItem);
        reg.register(&node_pointer::NodePointerItem);
        reg.register(&extent::ExtentItem);
        reg.register(&tail::TailItem);
        reg.register(&blob::BlobItem);
        reg
    }

    pub fn register(&mut self, plugin: &'static dyn ItemPlugin) {
        let id = plugin.item_type() as u16 as usize;
        assert!(id < MAX_ITEM_TYPES, "item type id out of range");
        assert!(
            self.slots[id].is_none(),
            "duplicate registration for item type {id}"
        );
        self.slots[id] = Some(plugin);
    }

    /// Resolve an on-disk type id. Unknown ids are corruption-class
    /// failures: the node named a plugin this build does not know.
    pub fn get(&self, id: u16) -> Result<&'static dyn ItemPlugin> {
        self.slots
            .get(id as usize)
            .copied()
            .flatten()
            .ok_or_else(|| NodeError::UnknownItemType(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_resolves_all_builtin_ids() {
        let reg = ItemRegistry::standard();
        for id in [1u16, 2, 3, 4, 5, 6, 7] {
            let plugin = reg.get(id).unwrap();
            assert_eq!(plugin.item_type() as u16, id);
        }
    }

    #[test]
    fn unknown_id_is_a_typed_error() {
        let reg = ItemRegistry::standard();
        let err = reg.get(9).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<NodeError>(),
            Some(NodeError::UnknownItemType(9))
        ));
        assert!(crate::error::is_corruption(&err));
    }

    #[test]
    fn item_type_ids_are_stable() {
        assert_eq!(ItemType::StatData as u16, 1);
        assert_eq!(ItemType::Blob as u16, 7);
        assert_eq!(ItemType::from_u16(5), Some(ItemType::Extent));
        assert_eq!(ItemType::from_u16(0), None);
    }
}
