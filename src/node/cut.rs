//! Cut/kill engine: remove a contiguous range of units from one node and
//! reclaim the space.
//!
//! Both entry points share one classification + compaction pipeline and
//! differ only in which unit-level primitive the item plugins run: `cut`
//! is for data already preserved elsewhere (no destructors), `kill`
//! additionally runs each affected item's destruction hook.
//!
//! A range `[from, to]` (inclusive at both ends) is either a cut from the
//! middle of a single item, delegated wholesale to that item's plugin,
//! or decomposes left to right into at most three sub-cases:
//!
//! ```text
//! tail cut of the first item     from does not start at its first unit
//! whole removal of interior items
//! head cut of the last item      to does not end at its last unit
//! ```
//!
//! A range needing a tail cut *and* a head cut with no whole items in
//! between would free two disjoint spans; the engine does not support it
//! and rejects it as caller misuse.
//!
//! After the plugins have shrunk their bodies, a single `compact` pass
//! slides the surviving bytes over the freed span, rewrites the moved
//! items' offsets, drops the removed header entries and fixes the
//! free-space counters.

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::U16;

use crate::coord::Coord;
use crate::item::{CutUnitsOut, ItemRegistry, KillContext};
use crate::key::Key;
use crate::node::{Node, ITEM_HEADER_SIZE};
use crate::tree::CarryQueue;

/// The range to remove. `from`/`to` address the first and last unit to
/// go. When the range is also known by key (only meaningful while all
/// keys in it are unique), `from_key`/`to_key` drive the classification
/// instead of the unit positions.
#[derive(Debug, Clone, Copy)]
pub struct CutRange {
    pub from: Coord,
    pub to: Coord,
    pub from_key: Option<Key>,
    pub to_key: Option<Key>,
}

impl CutRange {
    pub fn by_coords(from: Coord, to: Coord) -> CutRange {
        CutRange {
            from,
            to,
            from_key: None,
            to_key: None,
        }
    }

    pub fn by_keys(from: Coord, to: Coord, from_key: Key, to_key: Key) -> CutRange {
        CutRange {
            from,
            to,
            from_key: Some(from_key),
            to_key: Some(to_key),
        }
    }
}

/// What a cut/kill did to the node.
#[derive(Debug, Clone, Copy, Default)]
pub struct CutOutcome {
    /// Items removed in their entirety; 0 is valid for a pure mid-item
    /// or boundary-trim cut.
    pub removed: usize,
    /// Key of the first unit actually destroyed.
    pub smallest_removed: Option<Key>,
}

/// Which unit-level primitive the plugins run.
enum CutKind<'a, 'b> {
    Cut,
    Kill(&'a mut KillContext<'b>),
}

/// Classification of the requested range.
enum Shape {
    /// Units vanish from the middle of one item; no item is removed.
    MidItem,
    /// The general tail/whole/head decomposition.
    Modes(CutInfo),
}

/// The cut-mode descriptor: computed per operation, never stored.
#[derive(Debug, Default)]
struct CutInfo {
    /// Item losing its tail, if any.
    tail_removed: Option<u16>,
    /// Leftmost item removed completely, if any.
    first_removed: Option<u16>,
    /// Number of items removed completely.
    removed_count: u16,
    /// Item losing its head, if any.
    head_removed: Option<u16>,

    /// Byte span freed in the body region, filled in while applying.
    freed_start: usize,
    freed_end: usize,
    /// First item whose body must slide left during compaction.
    first_moved: u16,
    /// Where the head-cut item's surviving bytes land; the one case where
    /// a moved item's offset is not just shifted by the freed amount.
    head_removed_location: Option<usize>,
}

impl Node {
    /// Remove `range` without running destructors. Returns the number of
    /// whole items removed.
    pub fn cut(
        &mut self,
        reg: &ItemRegistry,
        range: &CutRange,
        carry: Option<&mut CarryQueue>,
    ) -> Result<CutOutcome> {
        self.cut_or_kill(reg, range, CutKind::Cut, carry)
    }

    /// Remove `range` for good: every affected item's destruction hook
    /// runs before its bytes go away.
    pub fn kill(
        &mut self,
        reg: &ItemRegistry,
        range: &CutRange,
        kill: &mut KillContext<'_>,
        carry: Option<&mut CarryQueue>,
    ) -> Result<CutOutcome> {
        self.cut_or_kill(reg, range, CutKind::Kill(kill), carry)
    }

    fn cut_or_kill(
        &mut self,
        reg: &ItemRegistry,
        range: &CutRange,
        mut kind: CutKind<'_, '_>,
        carry: Option<&mut CarryQueue>,
    ) -> Result<CutOutcome> {
        if self.is_empty() {
            // re-cutting an emptied node is a no-op, not an error
            return Ok(CutOutcome::default());
        }
        ensure!(
            range.from.item_pos < self.nr_items() && range.to.item_pos < self.nr_items(),
            "cut coordinate outside the node"
        );
        ensure!(
            (range.from.item_pos, range.from.unit_pos) <= (range.to.item_pos, range.to.unit_pos),
            "cut range is inverted"
        );
        ensure!(
            range.from.unit_pos <= self.last_unit_pos(reg, range.from.item_pos)?
                && range.to.unit_pos <= self.last_unit_pos(reg, range.to.item_pos)?,
            "cut coordinate beyond the item's units"
        );

        let mut out = CutUnitsOut::default();
        let mut first_key_changed = false;

        let cinfo = match self.classify(reg, range)? {
            Shape::MidItem => {
                let pos = range.from.item_pos;
                let freed = self.run_units(
                    reg,
                    pos,
                    range.from.unit_pos as usize,
                    range.to.unit_pos as usize,
                    &mut kind,
                    &mut out,
                )?;
                let end = self.item_offset(pos) + self.item_length(pos);
                CutInfo {
                    freed_start: end - freed,
                    freed_end: end,
                    first_moved: pos + 1,
                    ..CutInfo::default()
                }
            }
            Shape::Modes(cinfo) => {
                self.apply_modes(reg, range, cinfo, &mut kind, &mut out, &mut first_key_changed)?
            }
        };

        let removed = cinfo.removed_count as usize;
        self.compact(&cinfo);

        if let Some(carry) = carry {
            if self.is_empty() {
                carry.post_removal(self.id());
            } else if first_key_changed {
                carry.post_key_update(self.id());
            }
        }

        Ok(CutOutcome {
            removed,
            smallest_removed: out.smallest_removed,
        })
    }

    /// Run the plugin's unit-level cut or kill over `[from, to]` of item
    /// `pos` and return the freed byte count.
    fn run_units(
        &mut self,
        reg: &ItemRegistry,
        pos: u16,
        from: usize,
        to: usize,
        kind: &mut CutKind<'_, '_>,
        out: &mut CutUnitsOut,
    ) -> Result<usize> {
        let plugin = self.plugin(reg, pos)?;
        let view = self.item_view_mut(pos);
        match kind {
            CutKind::Cut => plugin.cut_units(view, from, to, out),
            CutKind::Kill(kill) => plugin.kill_units(view, from, to, &mut **kill, out),
        }
    }

    fn classify(&self, reg: &ItemRegistry, range: &CutRange) -> Result<Shape> {
        match (range.from_key, range.to_key) {
            (Some(from_key), Some(to_key)) => self.classify_by_keys(reg, range, from_key, to_key),
            (None, None) => self.classify_by_coords(reg, range),
            _ => bail!("cut range must carry both keys or neither"),
        }
    }

    /// Classification by unit positions; handles ranges over items with
    /// duplicate keys (directory entries under hash collision).
    fn classify_by_coords(&self, reg: &ItemRegistry, range: &CutRange) -> Result<Shape> {
        let from = &range.from;
        let to = &range.to;

        let mut cinfo = CutInfo::default();
        if from.item_pos == to.item_pos {
            let last = self.last_unit_pos(reg, to.item_pos)?;
            if from.unit_pos > 0 && to.unit_pos < last {
                return Ok(Shape::MidItem);
            }
            if from.unit_pos > 0 {
                cinfo.tail_removed = Some(from.item_pos);
            } else if to.unit_pos < last {
                cinfo.head_removed = Some(from.item_pos);
            } else {
                cinfo.first_removed = Some(from.item_pos);
                cinfo.removed_count = 1;
            }
        } else {
            let mut first = from.item_pos + 1;
            let mut count = to.item_pos - from.item_pos - 1;

            if from.unit_pos > 0 {
                cinfo.tail_removed = Some(from.item_pos);
            } else {
                first -= 1;
                count += 1;
            }
            if to.unit_pos < self.last_unit_pos(reg, to.item_pos)? {
                cinfo.head_removed = Some(to.item_pos);
            } else {
                count += 1;
            }
            if count > 0 {
                cinfo.first_removed = Some(first);
                cinfo.removed_count = count;
            }
        }
        Ok(Shape::Modes(cinfo))
    }

    /// Classification by key range; only valid while every key in the
    /// range is unique.
    fn classify_by_keys(
        &self,
        reg: &ItemRegistry,
        range: &CutRange,
        from_key: Key,
        to_key: Key,
    ) -> Result<Shape> {
        let from = &range.from;
        let to = &range.to;

        let min_from_key = self.item_key(from.item_pos);
        let max_to_key = self
            .plugin(reg, to.item_pos)?
            .max_real_key(self.item_view(to.item_pos));

        let mut cinfo = CutInfo::default();
        if from.item_pos == to.item_pos {
            if min_from_key < from_key && to_key < max_to_key {
                return Ok(Shape::MidItem);
            }
            if from_key > min_from_key {
                cinfo.tail_removed = Some(from.item_pos);
            } else if to_key < max_to_key {
                cinfo.head_removed = Some(from.item_pos);
            } else {
                cinfo.first_removed = Some(from.item_pos);
                cinfo.removed_count = 1;
            }
        } else {
            let mut first = from.item_pos + 1;
            let mut count = to.item_pos - from.item_pos - 1;

            if from_key > min_from_key {
                cinfo.tail_removed = Some(from.item_pos);
            } else {
                first -= 1;
                count += 1;
            }
            if to_key < max_to_key {
                cinfo.head_removed = Some(to.item_pos);
            } else {
                count += 1;
            }
            if count > 0 {
                cinfo.first_removed = Some(first);
                cinfo.removed_count = count;
            }
        }
        Ok(Shape::Modes(cinfo))
    }

    /// Apply the tail/whole/head sub-cases left to right, filling in the
    /// freed byte span for compaction.
    fn apply_modes(
        &mut self,
        reg: &ItemRegistry,
        range: &CutRange,
        mut cinfo: CutInfo,
        kind: &mut CutKind<'_, '_>,
        out: &mut CutUnitsOut,
        first_key_changed: &mut bool,
    ) -> Result<CutInfo> {
        match (cinfo.tail_removed, cinfo.first_removed, cinfo.head_removed) {
            (Some(pos), None, None) => {
                // one item loses its tail
                let last = self.last_unit_pos(reg, pos)?;
                let freed = self.run_units(
                    reg,
                    pos,
                    range.from.unit_pos as usize,
                    last as usize,
                    kind,
                    out,
                )?;
                let end = self.item_offset(pos) + self.item_length(pos);
                cinfo.freed_start = end - freed;
                cinfo.freed_end = end;
                cinfo.first_moved = pos + 1;
            }

            (None, Some(first), None) => {
                // one or more items go away completely
                let count = cinfo.removed_count;
                self.run_kill_hooks(reg, first, count, kind)?;

                out.smallest_removed = Some(self.item_key(first));
                cinfo.freed_start = self.item_offset(first);
                let last = first + count - 1;
                cinfo.freed_end = self.item_offset(last) + self.item_length(last);
                cinfo.first_moved = last + 1;
                if first == 0 {
                    *first_key_changed = true;
                }
            }

            (None, None, Some(pos)) => {
                // one item loses its head; its key changes
                let freed =
                    self.run_units(reg, pos, 0, range.to.unit_pos as usize, kind, out)?;
                cinfo.freed_start = self.item_offset(pos);
                cinfo.freed_end = cinfo.freed_start + freed;
                cinfo.first_moved = pos + 1;

                let new_first = out
                    .new_first_key
                    .ok_or_else(|| eyre::eyre!("head cut reported no new first key"))?;
                self.update_item_key(&Coord::at(pos, 0), new_first, None);
                if pos == 0 {
                    *first_key_changed = true;
                }
            }

            (Some(tail_pos), Some(first), None) => {
                // tail cut plus whole removal of everything after it
                debug_assert_eq!(first, tail_pos + 1);
                let last_unit = self.last_unit_pos(reg, tail_pos)?;
                let freed = self.run_units(
                    reg,
                    tail_pos,
                    range.from.unit_pos as usize,
                    last_unit as usize,
                    kind,
                    out,
                )?;
                cinfo.freed_start =
                    self.item_offset(tail_pos) + self.item_length(tail_pos) - freed;

                let count = cinfo.removed_count;
                self.run_kill_hooks(reg, first, count, kind)?;

                let last = tail_pos + count;
                cinfo.freed_end = self.item_offset(last) + self.item_length(last);
                cinfo.first_moved = last + 1;
            }

            (None, Some(first), Some(head_pos)) => {
                // whole removal followed by a head cut of the last item;
                // the head item's survivors land at the start of the
                // freed span, unlike every other moved item
                debug_assert_eq!(head_pos, first + cinfo.removed_count);
                let count = cinfo.removed_count;
                self.run_kill_hooks(reg, first, count, kind)?;

                let freed =
                    self.run_units(reg, head_pos, 0, range.to.unit_pos as usize, kind, out)?;
                // the smallest destroyed key belongs to the first whole
                // item, not to the head cut the plugin just reported
                out.smallest_removed = Some(self.item_key(first));
                cinfo.freed_start = self.item_offset(first);
                cinfo.freed_end = self.item_offset(head_pos) + freed;
                cinfo.first_moved = head_pos;
                cinfo.head_removed_location = Some(cinfo.freed_start);

                let new_first = out
                    .new_first_key
                    .ok_or_else(|| eyre::eyre!("head cut reported no new first key"))?;
                self.update_item_key(&Coord::at(head_pos, 0), new_first, None);
                if first == 0 {
                    *first_key_changed = true;
                }
            }

            (Some(_), None, Some(_)) | (Some(_), Some(_), Some(_)) => {
                // would free two disjoint spans; not supported
                bail!("cut range needs both a tail and a head cut with no whole items between");
            }

            (None, None, None) => bail!("cut range classified to nothing"),
        }
        Ok(cinfo)
    }

    /// Destruction hooks for items about to be removed completely, in
    /// ascending order. Cut runs none.
    fn run_kill_hooks(
        &mut self,
        reg: &ItemRegistry,
        first: u16,
        count: u16,
        kind: &mut CutKind<'_, '_>,
    ) -> Result<()> {
        if let CutKind::Kill(kill) = kind {
            for pos in first..first + count {
                let plugin = self.plugin(reg, pos)?;
                let view = self.item_view(pos);
                let units = plugin.nr_units(view);
                plugin.kill_hook(view, 0, units, &mut **kill);
            }
        }
        Ok(())
    }

    /// Close the freed gap: slide surviving bytes left, rewrite moved
    /// items' offsets, drop removed header entries, fix the counters.
    fn compact(&mut self, cinfo: &CutInfo) {
        debug_assert!(cinfo.freed_end >= cinfo.freed_start);

        let nr = self.nr_items();
        let bs = self.block_size();
        let fss = self.free_space_start();

        self.buf_mut()
            .copy_within(cinfo.freed_end..fss, cinfo.freed_start);

        let mut pos = cinfo.first_moved;
        if let Some(location) = cinfo.head_removed_location {
            debug_assert_eq!(Some(pos), cinfo.head_removed);
            let ih = self.ih_mut(pos);
            ih.offset = U16::new(location as u16);
            pos += 1;
        }

        let mut freed = cinfo.freed_end - cinfo.freed_start;
        for p in pos..nr {
            let ih = self.ih_mut(p);
            ih.offset = U16::new((ih.offset.get() as usize - freed) as u16);
        }

        self.set_free_space_start(fss - freed);

        if let Some(first) = cinfo.first_removed {
            let count = cinfo.removed_count as usize;
            let table = bs - nr as usize * ITEM_HEADER_SIZE
                ..bs - (first as usize + count) * ITEM_HEADER_SIZE;
            let dest = bs - (nr as usize - count) * ITEM_HEADER_SIZE;
            self.buf_mut().copy_within(table, dest);
            freed += count * ITEM_HEADER_SIZE;
            self.set_nr_items(nr - count as u16);
        }

        self.set_free_space(self.free_space() + freed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::extent::{encode_runs, EXTENT_UNIT_SIZE};
    use crate::item::stat_data::StatData;
    use crate::item::{BlockSink, ItemType};
    use crate::key::KeyType;
    use crate::node::{CheckFlags, NodeFormat, LEAF_LEVEL, TWIG_LEVEL};
    use crate::tree::{CarryOp, NodeId};
    use zerocopy::IntoBytes;

    fn reg() -> ItemRegistry {
        ItemRegistry::standard()
    }

    fn leaf() -> Node {
        Node::init(NodeId(1), 512, NodeFormat::Plain, LEAF_LEVEL, 0).unwrap()
    }

    fn sd_key(oid: u64) -> Key {
        Key::build(1, KeyType::StatData, oid, 0)
    }

    fn tail_key(oid: u64, offset: u64) -> Key {
        Key::build(1, KeyType::FileBody, oid, offset)
    }

    fn append_item(node: &mut Node, reg: &ItemRegistry, key: Key, typ: ItemType, body: &[u8]) {
        node.create_item(reg, &Coord::after_last(node), key, typ, body, None)
            .unwrap();
    }

    fn sd_node(oids: &[u64]) -> Node {
        let reg = reg();
        let mut node = leaf();
        for &oid in oids {
            let body = StatData::new(0o644, 1, oid);
            append_item(&mut node, &reg, sd_key(oid), ItemType::StatData, body.as_bytes());
        }
        node
    }

    struct Recorder(Vec<(u64, u64)>);

    impl BlockSink for Recorder {
        fn release(&mut self, start: u64, width: u64) {
            self.0.push((start, width));
        }
    }

    #[test]
    fn key_range_cut_removes_the_covered_item() {
        let reg = reg();
        let mut node = sd_node(&[10, 20, 30]);
        let mut carry = CarryQueue::new();

        let range = CutRange::by_keys(
            Coord::at(1, 0),
            Coord::at(1, 0),
            sd_key(15),
            sd_key(25),
        );
        let outcome = node.cut(&reg, &range, Some(&mut carry)).unwrap();

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.smallest_removed, Some(sd_key(20)));
        assert_eq!(node.nr_items(), 2);
        assert_eq!(node.item_key(0), sd_key(10));
        assert_eq!(node.item_key(1), sd_key(30));
        assert!(carry.is_empty(), "first key unchanged, node not empty");
        node.check(&reg, CheckFlags::default(), None).unwrap();

        let miss = node
            .lookup(&reg, &sd_key(20), crate::item::LookupBias::Exact)
            .unwrap();
        assert!(!miss.found);
    }

    #[test]
    fn mid_item_cut_removes_no_items() {
        let reg = reg();
        let mut node = leaf();
        append_item(&mut node, &reg, tail_key(1, 0), ItemType::Tail, b"abcdef");
        let free_before = node.free_space();

        let range = CutRange::by_coords(Coord::at(0, 2), Coord::at(0, 3));
        let outcome = node.cut(&reg, &range, None).unwrap();

        assert_eq!(outcome.removed, 0);
        assert_eq!(outcome.smallest_removed, Some(tail_key(1, 2)));
        assert_eq!(node.item_body(0), b"abef");
        assert_eq!(node.free_space(), free_before + 2);
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn tail_cut_plus_whole_removal() {
        let reg = reg();
        let mut node = leaf();
        append_item(&mut node, &reg, tail_key(1, 0), ItemType::Tail, b"aaaa");
        append_item(&mut node, &reg, tail_key(2, 0), ItemType::Tail, b"bbbb");
        append_item(&mut node, &reg, tail_key(3, 0), ItemType::Tail, b"cccc");

        let range = CutRange::by_coords(Coord::at(0, 2), Coord::at(1, 3));
        let outcome = node.cut(&reg, &range, None).unwrap();

        assert_eq!(outcome.removed, 1, "only the middle item went entirely");
        assert_eq!(
            outcome.smallest_removed,
            Some(tail_key(1, 2)),
            "smallest destroyed key is the first cut unit of the tail item"
        );
        assert_eq!(node.nr_items(), 2);
        assert_eq!(node.item_body(0), b"aa");
        assert_eq!(node.item_body(1), b"cccc");
        assert_eq!(node.item_key(1), tail_key(3, 0));
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn whole_removal_plus_head_cut_updates_first_key() {
        let reg = reg();
        let mut node = leaf();
        append_item(&mut node, &reg, tail_key(1, 0), ItemType::Tail, b"aaaa");
        append_item(&mut node, &reg, tail_key(2, 0), ItemType::Tail, b"bbbb");
        let mut carry = CarryQueue::new();

        let range = CutRange::by_coords(Coord::at(0, 0), Coord::at(1, 1));
        let outcome = node.cut(&reg, &range, Some(&mut carry)).unwrap();

        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.smallest_removed, Some(tail_key(1, 0)));
        assert_eq!(node.nr_items(), 1);
        assert_eq!(node.item_key(0), tail_key(2, 2));
        assert_eq!(node.item_body(0), b"bb");
        assert_eq!(carry.ops(), &[CarryOp::UpdateDelimitingKey(NodeId(1))]);
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn head_cut_of_first_item_posts_key_update() {
        let reg = reg();
        let mut node = leaf();
        append_item(&mut node, &reg, tail_key(1, 0), ItemType::Tail, b"abcd");
        append_item(&mut node, &reg, tail_key(2, 0), ItemType::Tail, b"efgh");
        let mut carry = CarryQueue::new();

        let range = CutRange::by_coords(Coord::at(0, 0), Coord::at(0, 1));
        let outcome = node.cut(&reg, &range, Some(&mut carry)).unwrap();

        assert_eq!(outcome.removed, 0);
        assert_eq!(node.item_key(0), tail_key(1, 2));
        assert_eq!(node.item_body(0), b"cd");
        assert_eq!(node.item_body(1), b"efgh");
        assert_eq!(carry.ops(), &[CarryOp::UpdateDelimitingKey(NodeId(1))]);
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn tail_and_head_with_no_whole_items_is_rejected() {
        let reg = reg();
        let mut node = leaf();
        append_item(&mut node, &reg, tail_key(1, 0), ItemType::Tail, b"aaaa");
        append_item(&mut node, &reg, tail_key(2, 0), ItemType::Tail, b"bbbb");
        let image = node.as_bytes().to_vec();

        let range = CutRange::by_coords(Coord::at(0, 2), Coord::at(1, 1));
        assert!(node.cut(&reg, &range, None).is_err());
        assert_eq!(node.as_bytes(), image.as_slice(), "rejected before mutating");
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn emptying_a_node_posts_removal_and_recut_is_a_noop() {
        let reg = reg();
        let mut node = sd_node(&[10, 20, 30]);
        let mut carry = CarryQueue::new();

        let range = CutRange::by_coords(Coord::at(0, 0), Coord::at(2, 0));
        let outcome = node.cut(&reg, &range, Some(&mut carry)).unwrap();
        assert_eq!(outcome.removed, 3);
        assert!(node.is_empty());
        assert_eq!(carry.ops(), &[CarryOp::RemoveNode(NodeId(1))]);
        node.check(&reg, CheckFlags::default(), None).unwrap();

        let again = node.cut(&reg, &range, Some(&mut carry)).unwrap();
        assert_eq!(again.removed, 0);
        assert!(again.smallest_removed.is_none());
    }

    #[test]
    fn kill_runs_extent_destructors() {
        let reg = reg();
        let mut node = Node::init(NodeId(2), 512, NodeFormat::Plain, TWIG_LEVEL, 0).unwrap();
        let a_key = Key::build(1, KeyType::FileBody, 10, 0);
        let b_key = Key::build(1, KeyType::FileBody, 11, 0);
        append_item(
            &mut node,
            &reg,
            a_key,
            ItemType::Extent,
            &encode_runs(&[(100, 2), (200, 3)]),
        );
        append_item(&mut node, &reg, b_key, ItemType::Extent, &encode_runs(&[(500, 1)]));

        let mut sink = Recorder(Vec::new());
        let mut kctx = KillContext { blocks: &mut sink };

        // whole removal of the second item runs its kill hook
        let range = CutRange::by_coords(Coord::at(1, 0), Coord::at(1, 0));
        let outcome = node.kill(&reg, &range, &mut kctx, None).unwrap();
        assert_eq!(outcome.removed, 1);

        // unit-level kill of one run of the first item
        let range = CutRange::by_coords(Coord::at(0, 1), Coord::at(0, 1));
        let outcome = node.kill(&reg, &range, &mut kctx, None).unwrap();
        assert_eq!(outcome.removed, 0);

        assert_eq!(sink.0, vec![(500, 1), (200, 3)]);
        assert_eq!(node.nr_items(), 1);
        assert_eq!(node.item_length(0), EXTENT_UNIT_SIZE);
        node.check(&reg, CheckFlags::default(), None).unwrap();
    }
}
