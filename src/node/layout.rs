//! Layout maintenance for one node: item lookup, item creation, in-place
//! key and size changes, and the structural consistency check.
//!
//! All bookkeeping here is byte-range arithmetic over the node buffer.
//! Body moves are single `copy_within` calls over the affected span; the
//! item header table is moved the same way, one block copy per operation,
//! never entry by entry.

use eyre::{bail, ensure, Result};
use tracing::warn;
use zerocopy::little_endian::U16;
use zerocopy::IntoBytes;

use crate::config::SEQ_SEARCH_BREAK;
use crate::coord::{Between, Coord};
use crate::error::NodeError;
use crate::item::{ItemRegistry, ItemType, ItemView, LookupBias};
use crate::key::Key;
use crate::node::{ItemHeader, Node, ITEM_HEADER_SIZE};
use crate::tree::{CarryQueue, DkStore};

/// Result of a node-level lookup: where the key would live, and whether it
/// was actually found there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLookup {
    pub coord: Coord,
    pub found: bool,
}

/// What [`Node::check`] verifies beyond the core layout invariants.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckFlags {
    /// Also verify the node's keys against the tree's delimiting-key
    /// records for it.
    pub dkeys: bool,
}

impl Node {
    /// Locate the item that would contain `key`.
    ///
    /// Binary search while the candidate range is large, then a sequential
    /// scan: the header table is contiguous and small ranges are faster to
    /// walk than to bisect. Duplicate keys resolve to the leftmost match.
    ///
    /// A key below the smallest key anywhere but position 0 means the
    /// node's keys are not sorted: corruption, not a miss.
    pub fn lookup(
        &self,
        reg: &ItemRegistry,
        key: &Key,
        bias: LookupBias,
    ) -> Result<NodeLookup> {
        let items = self.nr_items() as usize;
        if items == 0 {
            return Ok(NodeLookup {
                coord: Coord::first_unit(self),
                found: false,
            });
        }

        let mut left = 0usize;
        let mut right = items - 1;
        let mut found = false;

        while right - left >= SEQ_SEARCH_BREAK {
            let median = (left + right) / 2;
            match key.cmp(&self.item_key(median as u16)) {
                std::cmp::Ordering::Less => right = median,
                std::cmp::Ordering::Greater => left = median,
                std::cmp::Ordering::Equal => {
                    let mut pos = median;
                    while pos > 0 && self.item_key(pos as u16 - 1) == *key {
                        pos -= 1;
                    }
                    left = pos;
                    found = true;
                    break;
                }
            }
        }

        if !found {
            // Sequential scan in descending item order: headers sit at the
            // right end of the block from right to left, so this walks
            // memory forward.
            let mut pos = right as isize;
            while pos >= 0 {
                match self.item_key(pos as u16).cmp(key) {
                    std::cmp::Ordering::Greater => pos -= 1,
                    std::cmp::Ordering::Equal => {
                        let mut p = pos as usize;
                        while p > 0 && self.item_key(p as u16 - 1) == *key {
                            p -= 1;
                        }
                        pos = p as isize;
                        found = true;
                        break;
                    }
                    std::cmp::Ordering::Less => break,
                }
            }
            left = pos.max(0) as usize;
        }

        let mut coord = Coord::at(left as u16, 0);

        let boundary_key = self.item_key(left as u16);
        if boundary_key > *key {
            if left != 0 {
                warn!(node = self.id().0, pos = left, "key below a mid-node key");
                return Err(NodeError::Corrupt("node keys are not sorted").into());
            }
            coord.between = Between::BeforeUnit;
            return Ok(NodeLookup { coord, found: false });
        }

        let plugin = self.plugin(reg, left as u16)?;
        if found {
            return Ok(NodeLookup { coord, found: true });
        }

        let view = self.item_view(left as u16);
        if let Some(max_key) = plugin.max_key_inside(view) {
            if *key > max_key {
                // outside of the item; the next item (if any) starts above
                coord.unit_pos = 0;
                coord.between = Between::AfterItem;
                return Ok(NodeLookup { coord, found: false });
            }
        }

        let unit = plugin.lookup(view, key, bias);
        coord.unit_pos = unit.unit_pos;
        coord.between = unit.between;
        Ok(NodeLookup {
            coord,
            found: unit.found,
        })
    }

    /// Insert a new item at `target`, which must point between items.
    ///
    /// On success the returned coordinate addresses the new item's first
    /// unit. With less than `body.len()` plus one header entry of free
    /// space, fails with [`NodeError::NoSpace`] and the node untouched.
    pub fn create_item(
        &mut self,
        reg: &ItemRegistry,
        target: &Coord,
        key: Key,
        type_id: ItemType,
        body: &[u8],
        carry: Option<&mut CarryQueue>,
    ) -> Result<Coord> {
        ensure!(
            target.is_between_items(),
            "create_item target must point between items"
        );

        let need = body.len() + ITEM_HEADER_SIZE;
        let have = self.free_space();
        if have < need {
            return Err(NodeError::NoSpace { need, have }.into());
        }

        let nr = self.nr_items();
        let pos = target.insert_item_pos().min(nr);
        let fss = self.free_space_start();
        let bs = self.block_size();

        let offset = if pos < nr {
            // open a body gap at the insertion point
            let offset = self.item_offset(pos);
            self.buf_mut().copy_within(offset..fss, offset + body.len());
            for i in pos..nr {
                let ih = self.ih_mut(i);
                ih.offset = U16::new((ih.offset.get() as usize + body.len()) as u16);
            }
            // slide header entries for pos.. one slot toward the block start
            let table = bs - nr as usize * ITEM_HEADER_SIZE..bs - pos as usize * ITEM_HEADER_SIZE;
            self.buf_mut()
                .copy_within(table, bs - (nr as usize + 1) * ITEM_HEADER_SIZE);
            offset
        } else {
            fss
        };

        let ih = ItemHeader {
            key,
            offset: U16::new(offset as u16),
            type_id: U16::new(type_id as u16),
        };
        self.write_ih(pos, &ih);
        self.buf_mut()[offset..offset + body.len()].copy_from_slice(body);

        self.set_free_space(have - need);
        self.set_free_space_start(fss + body.len());
        self.set_nr_items(nr + 1);

        if pos == 0 {
            if let Some(carry) = carry {
                carry.post_key_update(self.id());
            }
        }

        let plugin = reg.get(type_id as u16)?;
        plugin.create_hook(self.item_view(pos));

        Ok(Coord::at(pos, 0))
    }

    /// Overwrite an item's header key in place.
    pub fn update_item_key(
        &mut self,
        coord: &Coord,
        key: Key,
        carry: Option<&mut CarryQueue>,
    ) {
        self.ih_mut(coord.item_pos).key = key;
        if coord.item_pos == 0 {
            if let Some(carry) = carry {
                carry.post_key_update(self.id());
            }
        }
    }

    /// Grow an item by `grow` bytes, shifting every later body rightward
    /// and opening the gap at the item's end. Used by plugins that resize
    /// their own payload without the generic create/cut path.
    pub fn change_item_size(&mut self, coord: &Coord, grow: usize) -> Result<()> {
        ensure!(
            coord.is_existing_item(self),
            "change_item_size on a non-existent item"
        );
        let have = self.free_space();
        if have < grow {
            return Err(NodeError::NoSpace { need: grow, have }.into());
        }

        let pos = coord.item_pos;
        let end = self.item_offset(pos) + self.item_length(pos);
        let fss = self.free_space_start();

        self.buf_mut().copy_within(end..fss, end + grow);
        for i in pos + 1..self.nr_items() {
            let ih = self.ih_mut(i);
            ih.offset = U16::new((ih.offset.get() as usize + grow) as u16);
        }
        self.set_free_space(have - grow);
        self.set_free_space_start(fss + grow);
        Ok(())
    }

    /// Shrink an item by `delta` bytes already vacated at its end. Item
    /// count and keys are unchanged, so no carry is needed.
    pub fn shrink_item(&mut self, coord: &Coord, delta: usize) -> Result<()> {
        ensure!(
            coord.is_existing_item(self),
            "shrink_item on a non-existent item"
        );
        let pos = coord.item_pos;
        ensure!(
            delta <= self.item_length(pos),
            "shrink larger than the item"
        );

        let end = self.item_offset(pos) + self.item_length(pos);
        let fss = self.free_space_start();

        self.buf_mut().copy_within(end..fss, end - delta);
        for i in pos + 1..self.nr_items() {
            let ih = self.ih_mut(i);
            ih.offset = U16::new((ih.offset.get() as usize - delta) as u16);
        }
        self.set_free_space(self.free_space() + delta);
        self.set_free_space_start(fss - delta);
        Ok(())
    }

    /// Splice encoded units into an existing item at `coord`. The item is
    /// grown first; if the plugin then rejects the payload the growth is
    /// rolled back and the node is unchanged.
    pub fn paste(
        &mut self,
        reg: &ItemRegistry,
        coord: &Coord,
        payload: &[u8],
        carry: Option<&mut CarryQueue>,
    ) -> Result<()> {
        ensure!(
            coord.is_existing_item(self),
            "paste target must be an existing item"
        );
        let pos = coord.item_pos;
        let plugin = self.plugin(reg, pos)?;
        let units = self.num_units(reg, pos)?;

        let insert_at = match coord.between {
            Between::AtUnit | Between::BeforeUnit => coord.unit_pos as usize,
            Between::AfterUnit => coord.unit_pos as usize + 1,
            _ => bail!("paste coordinate must address a unit position"),
        };
        ensure!(insert_at <= units, "paste position beyond the item's units");

        let old_len = self.item_length(pos);
        self.change_item_size(coord, payload.len())?;

        if let Err(err) = plugin.paste(self.item_view_mut(pos), insert_at, payload, old_len) {
            // release the just-opened gap so the node stays consistent
            self.shrink_item(coord, payload.len())?;
            return Err(err);
        }

        if insert_at == 0 {
            let first = plugin.unit_key(self.item_view(pos), 0);
            self.update_item_key(&Coord::at(pos, 0), first, carry);
        }
        Ok(())
    }

    /// Whether the item at `right_pos` could be merged onto the one at
    /// `left_pos`.
    pub fn items_mergeable(
        &self,
        reg: &ItemRegistry,
        left_pos: u16,
        right_pos: u16,
    ) -> Result<bool> {
        Ok(views_mergeable(
            reg,
            self.item_type_id(left_pos),
            self.item_view(left_pos),
            self.item_type_id(right_pos),
            self.item_view(right_pos),
        )?)
    }

    /// Validate every structural invariant of the node, returning the
    /// first violated one as a diagnostic. Callers decide whether that is
    /// fatal (mount-time) or a logged warning (runtime).
    pub fn check(
        &self,
        reg: &ItemRegistry,
        flags: CheckFlags,
        dk: Option<&DkStore>,
    ) -> std::result::Result<(), &'static str> {
        let nr = self.nr_items();
        let bs = self.block_size();
        let header_size = self.header_size();

        if self.free_space_start() + self.free_space() + nr as usize * ITEM_HEADER_SIZE != bs {
            return Err("free space accounting broken");
        }

        let dkeys = if flags.dkeys {
            dk.and_then(|store| store.get(self.id()))
        } else {
            None
        };

        let mut prev = match dkeys {
            Some(dk) => dk.left,
            None => Key::minimal(),
        };
        let mut old_offset = 0usize;

        for i in 0..nr {
            let offset = self.item_offset(i);
            if offset >= bs - nr as usize * ITEM_HEADER_SIZE || offset < header_size {
                return Err("item offset out of bounds");
            }
            if offset <= old_offset {
                return Err("item offsets out of order");
            }
            if i == 0 && offset != header_size {
                return Err("wrong offset of first item");
            }
            old_offset = offset;

            let key = self.item_key(i);
            if prev > key {
                return Err("item keys out of order");
            }

            let plugin = match reg.get(self.item_type_id(i)) {
                Ok(plugin) => plugin,
                Err(_) => return Err("unknown item type id"),
            };
            let view = self.item_view(i);

            if plugin.unit_key(view, 0) != key {
                return Err("item key differs from key of first unit");
            }
            if !plugin.allowed_on_level(self.level()) {
                return Err("item type not allowed on this level");
            }

            prev = key;
            for unit in 1..plugin.nr_units(view) {
                let unit_key = plugin.unit_key(view, unit);
                if prev > unit_key {
                    return Err("unit keys out of order");
                }
                prev = unit_key;
            }

            if i > 0 {
                match self.items_mergeable(reg, i - 1, i) {
                    Ok(true) => return Err("mergeable items left uncoalesced"),
                    Ok(false) => {}
                    Err(_) => return Err("unknown item type id"),
                }
            }
        }

        if let Some(dk) = dkeys {
            if dk.left > dk.right {
                return Err("left delimiting key above right delimiting key");
            }
            if nr > 0 && prev > dk.right {
                return Err("last key above right delimiting key");
            }
        }
        Ok(())
    }

    pub(crate) fn read_ih(&self, pos: u16) -> ItemHeader {
        *self.ih(pos)
    }

    pub(crate) fn write_ih(&mut self, pos: u16, ih: &ItemHeader) {
        let range = self.ih_byte_range(pos);
        self.buf_mut()[range].copy_from_slice(ih.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::stat_data::StatData;
    use crate::item::{dir_entry, ItemType};
    use crate::key::KeyType;
    use crate::node::{NodeFormat, LEAF_LEVEL, NODE_HEADER_SIZE};
    use crate::tree::{CarryOp, NodeId};
    use zerocopy::IntoBytes;

    fn leaf(block_size: usize) -> Node {
        Node::init(NodeId(1), block_size, NodeFormat::Plain, LEAF_LEVEL, 0).unwrap()
    }

    fn sd_key(oid: u64) -> Key {
        Key::build(1, KeyType::StatData, oid, 0)
    }

    fn insert_sd(node: &mut Node, reg: &ItemRegistry, oid: u64) -> Coord {
        let key = sd_key(oid);
        let found = node.lookup(reg, &key, LookupBias::Exact).unwrap();
        assert!(!found.found, "duplicate stat-data insert");
        let body = StatData::new(0o644, 1, oid);
        node.create_item(reg, &found.coord, key, ItemType::StatData, body.as_bytes(), None)
            .unwrap()
    }

    fn tail_key(oid: u64, offset: u64) -> Key {
        Key::build(1, KeyType::FileBody, oid, offset)
    }

    #[test]
    fn create_then_lookup_roundtrip() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);

        // out-of-order inserts land sorted
        for oid in [20, 10, 30] {
            insert_sd(&mut node, &reg, oid);
        }
        assert_eq!(node.nr_items(), 3);
        assert_eq!(node.item_key(0), sd_key(10));
        assert_eq!(node.item_key(1), sd_key(20));
        assert_eq!(node.item_key(2), sd_key(30));
        assert_eq!(node.item_offset(0), NODE_HEADER_SIZE);

        for (pos, oid) in [(0u16, 10u64), (1, 20), (2, 30)] {
            let found = node.lookup(&reg, &sd_key(oid), LookupBias::Exact).unwrap();
            assert!(found.found);
            assert_eq!(found.coord.item_pos, pos);
        }

        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn lookup_misses_report_position() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);
        insert_sd(&mut node, &reg, 10);
        insert_sd(&mut node, &reg, 30);

        let below = node.lookup(&reg, &sd_key(5), LookupBias::Exact).unwrap();
        assert!(!below.found);
        assert_eq!(below.coord.item_pos, 0);
        assert_eq!(below.coord.between, Between::BeforeUnit);

        let between = node.lookup(&reg, &sd_key(20), LookupBias::Exact).unwrap();
        assert!(!between.found);
        assert_eq!(between.coord.item_pos, 0);
        assert_eq!(between.coord.between, Between::AfterItem);
    }

    #[test]
    fn unsorted_keys_fail_check() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);
        insert_sd(&mut node, &reg, 10);
        insert_sd(&mut node, &reg, 30);

        // sabotage: swap the two keys so the node is unsorted
        node.update_item_key(&Coord::at(0, 0), sd_key(30), None);
        node.update_item_key(&Coord::at(1, 0), sd_key(10), None);

        assert_eq!(
            node.check(&reg, CheckFlags::default(), None),
            Err("item keys out of order")
        );
    }

    #[test]
    fn create_without_space_leaves_node_untouched() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(256);
        insert_sd(&mut node, &reg, 1);
        insert_sd(&mut node, &reg, 2);
        insert_sd(&mut node, &reg, 3);

        let image = node.as_bytes().to_vec();
        let err = node
            .create_item(
                &reg,
                &Coord::after_last(&node),
                sd_key(4),
                ItemType::StatData,
                StatData::new(0o644, 1, 4).as_bytes(),
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<NodeError>(),
            Some(NodeError::NoSpace { need: 64, have: _ })
        ));
        assert_eq!(node.as_bytes(), image.as_slice(), "no partial write");
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn duplicate_keys_resolve_to_leftmost() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);

        let hash = dir_entry::hash_name(b"collide");
        let key = Key::build(1, KeyType::FileName, 7, hash);
        let first = dir_entry::encode_simple_entry(100, b"collide");
        let second = dir_entry::encode_simple_entry(101, b"collide~1");

        node.create_item(
            &reg,
            &Coord::first_unit(&node),
            key,
            ItemType::SimpleDirEntry,
            &first,
            None,
        )
        .unwrap();
        let after = Coord {
            item_pos: 0,
            unit_pos: 0,
            between: Between::AfterItem,
        };
        node.create_item(&reg, &after, key, ItemType::SimpleDirEntry, &second, None)
            .unwrap();

        let found = node.lookup(&reg, &key, LookupBias::Exact).unwrap();
        assert!(found.found);
        assert_eq!(found.coord.item_pos, 0, "leftmost duplicate wins");
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn first_item_creation_posts_key_update() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);
        let mut carry = CarryQueue::new();

        insert_sd(&mut node, &reg, 20);
        let below = node.lookup(&reg, &sd_key(10), LookupBias::Exact).unwrap();
        node.create_item(
            &reg,
            &below.coord,
            sd_key(10),
            ItemType::StatData,
            StatData::new(0o644, 1, 10).as_bytes(),
            Some(&mut carry),
        )
        .unwrap();

        assert_eq!(carry.ops(), &[CarryOp::UpdateDelimitingKey(NodeId(1))]);
    }

    #[test]
    fn grow_and_shrink_keep_later_items_intact() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);
        let key_a = tail_key(5, 0);
        let key_b = tail_key(6, 0);
        node.create_item(&reg, &Coord::first_unit(&node), key_a, ItemType::Tail, b"aaaa", None)
            .unwrap();
        let after = Coord {
            item_pos: 0,
            unit_pos: 0,
            between: Between::AfterItem,
        };
        node.create_item(&reg, &after, key_b, ItemType::Tail, b"bbbb", None)
            .unwrap();

        let coord = Coord::at(0, 0);
        node.change_item_size(&coord, 4).unwrap();
        assert_eq!(node.item_length(0), 8);
        assert_eq!(node.item_body(1), b"bbbb");

        node.shrink_item(&coord, 4).unwrap();
        assert_eq!(node.item_length(0), 4);
        assert_eq!(node.item_body(0), b"aaaa");
        assert_eq!(node.item_body(1), b"bbbb");
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn paste_appends_tail_bytes() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);
        node.create_item(
            &reg,
            &Coord::first_unit(&node),
            tail_key(5, 0),
            ItemType::Tail,
            b"hello",
            None,
        )
        .unwrap();

        let at = Coord {
            item_pos: 0,
            unit_pos: 4,
            between: Between::AfterUnit,
        };
        node.paste(&reg, &at, b" world", None).unwrap();
        assert_eq!(node.item_body(0), b"hello world");
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn check_rejects_uncoalesced_neighbors() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);
        node.create_item(
            &reg,
            &Coord::first_unit(&node),
            tail_key(5, 0),
            ItemType::Tail,
            b"ab",
            None,
        )
        .unwrap();
        let after = Coord {
            item_pos: 0,
            unit_pos: 0,
            between: Between::AfterItem,
        };
        // byte-adjacent same-object tail: should have been one item
        node.create_item(&reg, &after, tail_key(5, 2), ItemType::Tail, b"cd", None)
            .unwrap();

        assert_eq!(
            node.check(&reg, CheckFlags::default(), None),
            Err("mergeable items left uncoalesced")
        );
    }

    #[test]
    fn check_rejects_unknown_item_type() {
        let reg = ItemRegistry::standard();
        let mut node = leaf(512);
        insert_sd(&mut node, &reg, 1);
        node.set_item_type(0, 0x0009);
        assert_eq!(
            node.check(&reg, CheckFlags::default(), None),
            Err("unknown item type id")
        );
    }

    #[test]
    fn check_verifies_delimiting_keys() {
        let reg = ItemRegistry::standard();
        let node_id = NodeId(1);
        let mut node = leaf(512);
        insert_sd(&mut node, &reg, 10);
        insert_sd(&mut node, &reg, 20);

        let dk = crate::tree::DkStore::new();
        dk.set(node_id, sd_key(10), sd_key(100));
        let flags = CheckFlags { dkeys: true };
        node.check(&reg, flags, Some(&dk)).unwrap();

        dk.set(node_id, sd_key(10), sd_key(15));
        assert_eq!(
            node.check(&reg, flags, Some(&dk)),
            Err("last key above right delimiting key")
        );
    }
}

/// Mergeability across two items that may live in different nodes.
pub(crate) fn views_mergeable(
    reg: &ItemRegistry,
    left_type: u16,
    left: ItemView<'_>,
    right_type: u16,
    right: ItemView<'_>,
) -> Result<bool> {
    if left_type != right_type {
        return Ok(false);
    }
    Ok(reg.get(left_type)?.mergeable(left, right))
}

