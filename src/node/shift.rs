//! Shift/balance engine: move items, whole or in part, between two
//! adjacent siblings.
//!
//! A shift runs in three phases over one precomputed plan:
//!
//! ```text
//! estimate       what fits: units merged into the target's boundary item,
//!                whole items, plus at most one partial item. Partial
//!                satisfaction of the boundary-nearest item always beats
//!                taking further whole items.
//! copy           physically write the planned bytes into the target;
//!                header counters are adjusted once per shift, not per item
//! delete-copied  remove the copied span from the source, reusing the cut
//!                engine's compaction (the span is known exactly, so no
//!                classification by key is involved)
//! ```
//!
//! After the bytes have moved, each relocated item's shift hook runs, the
//! caller's insert coordinate is adjusted, and a [`ShiftReport`] is
//! returned so that any other outstanding coordinate into either node can
//! be remapped as a pure index computation.
//!
//! The return of 0 bytes means "nothing could be moved" and is how callers
//! recognize a stalled rebalance.
//!
//! Lock order: a two-node shift takes both nodes exclusively; callers
//! acquire them left sibling first, which the `&mut` pair here merely
//! witnesses.

use eyre::Result;
use zerocopy::little_endian::U16;

use crate::coord::{Between, Coord};
use crate::item::{ItemRegistry, ShiftDir, ShiftTracker};
use crate::node::cut::CutRange;
use crate::node::layout::views_mergeable;
use crate::node::{Node, ITEM_HEADER_SIZE};
use crate::tree::CarryQueue;

/// Which of the two nodes a coordinate refers to after a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

#[derive(Debug, Clone, Copy)]
pub struct ShiftParams {
    pub dir: ShiftDir,
    /// Remove the source's pointer from its parent if the shift empties it.
    pub delete_emptied_source: bool,
    /// Whether the insert coordinate itself is part of what moves.
    pub including_insert_coord: bool,
}

/// What a shift did, for the caller.
#[derive(Debug)]
pub struct ShiftOutcome {
    /// Total body bytes relocated; 0 means nothing could be moved.
    pub bytes: usize,
    /// Node the adjusted insert coordinate now points into.
    pub insert_side: Side,
    /// Remapping data for any other coordinate into either node.
    pub report: Option<ShiftReport>,
}

/// The shift plan and enough of its outcome to remap coordinates.
#[derive(Debug, Clone, Copy)]
pub struct ShiftReport {
    dir: ShiftDir,
    everything: bool,
    merging_units: usize,
    entire: u16,
    part_units: usize,
    /// Last unit really shifted, in the source's pre-shift numbering.
    real_stop: Coord,
    /// Pre-shift coordinate of the unit that became the source's first
    /// (left shift); the subtrahend for coordinates that stayed behind.
    future_first: Coord,
    source_emptied: bool,
}

#[derive(Debug, Default)]
struct Plan {
    everything: bool,
    real_stop: Coord,
    merging_units: usize,
    merging_bytes: usize,
    entire: usize,
    entire_bytes: usize,
    part_units: usize,
    part_bytes: usize,
    shift_bytes: usize,
}

/// Move as much as allowed from `source` into its sibling `target`, up to
/// and possibly including the caller's `insert` coordinate. `insert` is
/// remapped in place; the returned outcome says which node it now refers
/// to and how many body bytes moved.
pub fn shift(
    reg: &ItemRegistry,
    source: &mut Node,
    target: &mut Node,
    insert: &mut Coord,
    params: ShiftParams,
    carry: Option<&mut CarryQueue>,
    refs: &mut dyn ShiftTracker,
) -> Result<ShiftOutcome> {
    let dir = params.dir;

    // resolve the wish-stop to the boundary-most concrete unit to move
    let wish_stop = match dir {
        ShiftDir::Left => set_to_left(source, reg, insert)?,
        ShiftDir::Right => set_to_right(source, reg, insert)?,
    };

    let Some(wish_stop) = wish_stop else {
        // nothing at all to move
        if params.including_insert_coord {
            *insert = match dir {
                ShiftDir::Left => Coord::after_last(target),
                ShiftDir::Right => Coord::before_first(target),
            };
        }
        if params.delete_emptied_source && source.is_empty() {
            if let Some(carry) = carry {
                carry.post_removal(source.id());
            }
        }
        let side = if params.including_insert_coord {
            Side::Target
        } else {
            Side::Source
        };
        return Ok(ShiftOutcome {
            bytes: 0,
            insert_side: side,
            report: None,
        });
    };

    let target_was_empty = target.is_empty();

    #[cfg(debug_assertions)]
    let audit = {
        let (left, right) = oriented(source, target, dir);
        audit_prepare(reg, left, right)?
    };

    let plan = estimate(reg, source, target, &wish_stop, dir)?;
    if plan.shift_bytes == 0 {
        return Ok(ShiftOutcome {
            bytes: 0,
            insert_side: Side::Source,
            report: None,
        });
    }

    match dir {
        ShiftDir::Left => copy_left(reg, source, target, &plan)?,
        ShiftDir::Right => copy_right(reg, source, target, &plan)?,
    }

    let future_first = next_unit(source, reg, &plan.real_stop)?;
    let removed = delete_copied(reg, source, &plan, dir)?;

    call_shift_hooks(reg, target, &plan, dir, refs)?;

    #[cfg(debug_assertions)]
    {
        let (left, right) = oriented(source, target, dir);
        audit_verify(&audit, reg, left, right)?;
    }

    let insert_side = adjust_insert(
        source,
        target,
        &plan,
        dir,
        removed,
        params.including_insert_coord,
        insert,
    );

    if let Some(carry) = carry {
        let (left_id, right_id) = match dir {
            ShiftDir::Left => (target.id(), source.id()),
            ShiftDir::Right => (source.id(), target.id()),
        };
        if target_was_empty {
            carry.post_key_update(left_id);
        }
        carry.post_key_update(right_id);
        if source.is_empty() && params.delete_emptied_source {
            carry.post_removal(source.id());
        }
    }

    let report = ShiftReport {
        dir,
        everything: plan.everything,
        merging_units: plan.merging_units,
        entire: plan.entire as u16,
        part_units: plan.part_units,
        real_stop: plan.real_stop,
        future_first,
        source_emptied: source.is_empty(),
    };

    Ok(ShiftOutcome {
        bytes: plan.shift_bytes,
        insert_side,
        report: Some(report),
    })
}

/// Resolve a possibly-between coordinate to the rightmost unit at or to
/// the left of it; `None` when nothing is at or left of it.
fn set_to_left(node: &Node, reg: &ItemRegistry, coord: &Coord) -> Result<Option<Coord>> {
    let resolved = match coord.between {
        Between::AtUnit | Between::AfterUnit => Some(Coord::at(coord.item_pos, coord.unit_pos)),
        Between::BeforeUnit => {
            if coord.unit_pos > 0 {
                Some(Coord::at(coord.item_pos, coord.unit_pos - 1))
            } else if coord.item_pos > 0 {
                let prev = coord.item_pos - 1;
                Some(Coord::at(prev, node.last_unit_pos(reg, prev)?))
            } else {
                None
            }
        }
        Between::AfterItem => Some(Coord::at(
            coord.item_pos,
            node.last_unit_pos(reg, coord.item_pos)?,
        )),
        Between::BeforeItem => {
            if coord.item_pos > 0 {
                let prev = coord.item_pos - 1;
                Some(Coord::at(prev, node.last_unit_pos(reg, prev)?))
            } else {
                None
            }
        }
        Between::EmptyNode | Between::Invalid => None,
    };
    Ok(resolved)
}

/// Mirror of [`set_to_left`]: the leftmost unit at or to the right.
fn set_to_right(node: &Node, reg: &ItemRegistry, coord: &Coord) -> Result<Option<Coord>> {
    let nr = node.nr_items();
    let resolved = match coord.between {
        Between::AtUnit | Between::BeforeUnit => Some(Coord::at(coord.item_pos, coord.unit_pos)),
        Between::AfterUnit => {
            if coord.unit_pos < node.last_unit_pos(reg, coord.item_pos)? {
                Some(Coord::at(coord.item_pos, coord.unit_pos + 1))
            } else if coord.item_pos + 1 < nr {
                Some(Coord::at(coord.item_pos + 1, 0))
            } else {
                None
            }
        }
        Between::BeforeItem => Some(Coord::at(coord.item_pos, 0)),
        Between::AfterItem => {
            if coord.item_pos + 1 < nr {
                Some(Coord::at(coord.item_pos + 1, 0))
            } else {
                None
            }
        }
        Between::EmptyNode | Between::Invalid => None,
    };
    Ok(resolved)
}

/// Unit after `coord` in pre-mutation numbering; may point one past the
/// node's content, which is fine for the subtraction it feeds.
fn next_unit(node: &Node, reg: &ItemRegistry, coord: &Coord) -> Result<Coord> {
    if coord.item_pos < node.nr_items()
        && coord.unit_pos < node.last_unit_pos(reg, coord.item_pos)?
    {
        Ok(Coord::at(coord.item_pos, coord.unit_pos + 1))
    } else {
        Ok(Coord::at(coord.item_pos + 1, 0))
    }
}

/// How many units of the item under `source` the caller wants moved, given
/// the stop coordinate.
fn wanted_units(
    node: &Node,
    reg: &ItemRegistry,
    source: &Coord,
    stop: &Coord,
    dir: ShiftDir,
) -> Result<usize> {
    let nr_units = node.num_units(reg, source.item_pos)?;
    if source.item_pos != stop.item_pos {
        return Ok(nr_units);
    }
    Ok(match dir {
        ShiftDir::Left => stop.unit_pos as usize + 1,
        ShiftDir::Right => source.unit_pos as usize - stop.unit_pos as usize + 1,
    })
}

fn estimate(
    reg: &ItemRegistry,
    source: &Node,
    target: &Node,
    wish_stop: &Coord,
    dir: ShiftDir,
) -> Result<Plan> {
    let mut plan = Plan::default();

    let mut cursor = match dir {
        ShiftDir::Left => Coord::at(0, 0),
        ShiftDir::Right => source.last_unit_coord(reg)?,
    };
    plan.real_stop = cursor;

    let mut free = target.free_space();

    if !target.is_empty() {
        let boundary = match dir {
            ShiftDir::Left => target.nr_items() - 1,
            ShiftDir::Right => 0,
        };
        let mergeable = match dir {
            ShiftDir::Left => views_mergeable(
                reg,
                target.item_type_id(boundary),
                target.item_view(boundary),
                source.item_type_id(cursor.item_pos),
                source.item_view(cursor.item_pos),
            )?,
            ShiftDir::Right => views_mergeable(
                reg,
                source.item_type_id(cursor.item_pos),
                source.item_view(cursor.item_pos),
                target.item_type_id(boundary),
                target.item_view(boundary),
            )?,
        };

        if mergeable {
            let want = wanted_units(source, reg, &cursor, wish_stop, dir)?;
            let plugin = source.plugin(reg, cursor.item_pos)?;
            let fit = plugin.can_shift(free, source.item_view(cursor.item_pos), dir, want, true);
            plan.merging_units = fit.units;
            plan.merging_bytes = fit.bytes;
            plan.shift_bytes += fit.bytes;

            if fit.units > 0 {
                plan.real_stop = match dir {
                    ShiftDir::Left => Coord::at(cursor.item_pos, fit.units as u16 - 1),
                    ShiftDir::Right => {
                        Coord::at(cursor.item_pos, cursor.unit_pos + 1 - fit.units as u16)
                    }
                };
            }
            if fit.units != want {
                // the nearest item could not move in full; stop here
                return Ok(plan);
            }
            free -= fit.bytes;
            if !advance(source, reg, &mut cursor, dir)? {
                plan.everything = true;
                return Ok(plan);
            }
        }
    }

    // item index nothing of which we want shifted
    let stop_item: isize = match dir {
        ShiftDir::Left => wish_stop.item_pos as isize + 1,
        ShiftDir::Right => wish_stop.item_pos as isize - 1,
    };

    while cursor.item_pos as isize != stop_item {
        let want = wanted_units(source, reg, &cursor, wish_stop, dir)?;
        let nr_units = source.num_units(reg, cursor.item_pos)?;

        if want == nr_units {
            let size = source.item_length(cursor.item_pos) + ITEM_HEADER_SIZE;
            if size <= free {
                free -= size;
                plan.shift_bytes += size - ITEM_HEADER_SIZE;
                plan.entire_bytes += size - ITEM_HEADER_SIZE;
                plan.entire += 1;
                plan.real_stop = match dir {
                    ShiftDir::Left => Coord::at(cursor.item_pos, nr_units as u16 - 1),
                    ShiftDir::Right => Coord::at(cursor.item_pos, 0),
                };
                if !advance(source, reg, &mut cursor, dir)? {
                    break;
                }
                continue;
            }
        }

        // the item does not fit whole; try one partial copy, which costs
        // a fresh header in the target
        if free >= ITEM_HEADER_SIZE {
            free -= ITEM_HEADER_SIZE;
            let plugin = source.plugin(reg, cursor.item_pos)?;
            let fit =
                plugin.can_shift(free, source.item_view(cursor.item_pos), dir, want, false);
            plan.part_units = fit.units;
            plan.part_bytes = fit.bytes;
        } else {
            plan.part_units = 0;
            plan.part_bytes = 0;
        }
        plan.shift_bytes += plan.part_bytes;

        if plan.part_units > 0 {
            plan.real_stop = match dir {
                ShiftDir::Left => Coord::at(cursor.item_pos, plan.part_units as u16 - 1),
                ShiftDir::Right => {
                    Coord::at(cursor.item_pos, (nr_units - plan.part_units) as u16)
                }
            };
        }
        if want != plan.part_units {
            return Ok(plan);
        }
        break;
    }

    plan.everything = true;
    Ok(plan)
}

/// Step the estimate cursor one item toward the stop. Returns false when
/// the cursor fell off the node.
fn advance(node: &Node, reg: &ItemRegistry, cursor: &mut Coord, dir: ShiftDir) -> Result<bool> {
    match dir {
        ShiftDir::Left => {
            if cursor.item_pos + 1 >= node.nr_items() {
                return Ok(false);
            }
            cursor.item_pos += 1;
            cursor.unit_pos = 0;
        }
        ShiftDir::Right => {
            if cursor.item_pos == 0 {
                return Ok(false);
            }
            cursor.item_pos -= 1;
            cursor.unit_pos = node.last_unit_pos(reg, cursor.item_pos)?;
        }
    }
    Ok(true)
}

fn copy_left(
    reg: &ItemRegistry,
    source: &Node,
    target: &mut Node,
    plan: &Plan,
) -> Result<()> {
    let old_items = target.nr_items();
    let new_items = plan.entire + usize::from(plan.part_units > 0);
    let orig_fss = target.free_space_start();
    let orig_free = target.free_space();
    debug_assert_eq!(
        plan.shift_bytes,
        plan.merging_bytes + plan.entire_bytes + plan.part_bytes
    );

    let mut fss = orig_fss;
    let mut src_pos: u16 = 0;

    if plan.merging_units > 0 {
        // expand the target's last item so the plugin sees the gap
        target.set_free_space_start(fss + plan.merging_bytes);
        target.set_free_space(orig_free - plan.merging_bytes);

        let t_pos = old_items - 1;
        let plugin = source.plugin(reg, src_pos)?;
        plugin.copy_units(
            target.item_view_mut(t_pos),
            source.item_view(src_pos),
            0,
            plan.merging_units,
            ShiftDir::Left,
            plan.merging_bytes,
        )?;
        fss += plan.merging_bytes;
        src_pos += 1;
    }

    if plan.entire > 0 {
        let base = source.item_offset(src_pos);
        for k in 0..plan.entire as u16 {
            let mut ih = source.read_ih(src_pos + k);
            ih.offset = U16::new((ih.offset.get() as usize - base + fss) as u16);
            target.write_ih(old_items + k, &ih);
        }
        let dst = fss;
        target.buf_mut()[dst..dst + plan.entire_bytes]
            .copy_from_slice(&source.buf()[base..base + plan.entire_bytes]);
        src_pos += plan.entire as u16;
    }

    let final_fss = orig_fss + plan.shift_bytes;
    target.set_free_space_start(final_fss);
    target.set_free_space(orig_free - plan.shift_bytes - ITEM_HEADER_SIZE * new_items);
    target.set_nr_items(old_items + new_items as u16);

    if plan.part_units > 0 {
        // leading units of the next source item become a fresh last item
        let t_pos = target.nr_items() - 1;
        let mut ih = source.read_ih(src_pos);
        ih.offset = U16::new((final_fss - plan.part_bytes) as u16);
        target.write_ih(t_pos, &ih);

        let plugin = source.plugin(reg, src_pos)?;
        plugin.init(target.item_body_mut(t_pos));
        plugin.copy_units(
            target.item_view_mut(t_pos),
            source.item_view(src_pos),
            0,
            plan.part_units,
            ShiftDir::Left,
            plan.part_bytes,
        )?;
    }
    Ok(())
}

fn copy_right(
    reg: &ItemRegistry,
    source: &Node,
    target: &mut Node,
    plan: &Plan,
) -> Result<()> {
    let old_items = target.nr_items();
    let new_items = plan.entire + usize::from(plan.part_units > 0);
    let hs = target.header_size();
    let bs = target.block_size();
    let fss = target.free_space_start();
    let free = target.free_space();

    // open the body gap at the front
    target.buf_mut().copy_within(hs..fss, hs + plan.shift_bytes);

    // existing items move right; the first one also absorbs the merged
    // units at its (new) front, so its offset grows by less
    if old_items > 0 {
        let ih = target.ih_mut(0);
        ih.offset = U16::new(
            (ih.offset.get() as usize + plan.shift_bytes - plan.merging_bytes) as u16,
        );
        for i in 1..old_items {
            let ih = target.ih_mut(i);
            ih.offset = U16::new((ih.offset.get() as usize + plan.shift_bytes) as u16);
        }
    }

    // slide the header table to make the first `new_items` slots free
    let table = bs - old_items as usize * ITEM_HEADER_SIZE..bs;
    target
        .buf_mut()
        .copy_within(table, bs - (old_items as usize + new_items) * ITEM_HEADER_SIZE);

    target.set_free_space_start(fss + plan.shift_bytes);
    target.set_free_space(free - plan.shift_bytes - ITEM_HEADER_SIZE * new_items);
    target.set_nr_items(old_items + new_items as u16);

    let mut src_pos = source.nr_items() - 1;

    if plan.merging_units > 0 {
        let t_pos = new_items as u16;
        let plugin = source.plugin(reg, src_pos)?;
        let src_units = source.num_units(reg, src_pos)?;
        let first_moved = src_units - plan.merging_units;
        // the target item now starts at the first unit it absorbed
        let key = plugin.unit_key(source.item_view(src_pos), first_moved);
        plugin.copy_units(
            target.item_view_mut(t_pos),
            source.item_view(src_pos),
            first_moved,
            plan.merging_units,
            ShiftDir::Right,
            plan.merging_bytes,
        )?;
        target.update_item_key(&Coord::at(t_pos, 0), key, None);
        src_pos = src_pos.saturating_sub(1);
    }

    if plan.entire > 0 {
        let first_src = src_pos + 1 - plan.entire as u16;
        let base = source.item_offset(first_src);
        let t_first = u16::from(plan.part_units > 0);
        for k in 0..plan.entire as u16 {
            let mut ih = source.read_ih(first_src + k);
            ih.offset = U16::new((ih.offset.get() as usize - base + hs + plan.part_bytes) as u16);
            target.write_ih(t_first + k, &ih);
        }
        let dst = hs + plan.part_bytes;
        target.buf_mut()[dst..dst + plan.entire_bytes]
            .copy_from_slice(&source.buf()[base..base + plan.entire_bytes]);
        src_pos = first_src.saturating_sub(1);
    }

    if plan.part_units > 0 {
        // trailing units of the boundary-most unconsumed source item
        let p_src = src_pos;
        let mut ih = source.read_ih(p_src);
        ih.offset = U16::new(hs as u16);
        target.write_ih(0, &ih);

        let plugin = source.plugin(reg, p_src)?;
        let src_units = source.num_units(reg, p_src)?;
        let first_moved = src_units - plan.part_units;
        let key = plugin.unit_key(source.item_view(p_src), first_moved);
        plugin.init(target.item_body_mut(0));
        plugin.copy_units(
            target.item_view_mut(0),
            source.item_view(p_src),
            first_moved,
            plan.part_units,
            ShiftDir::Right,
            plan.part_bytes,
        )?;
        target.update_item_key(&Coord::at(0, 0), key, None);
    }
    Ok(())
}

/// Remove from the source exactly what was copied. The span is known from
/// the plan, so this reuses only the cut engine's application/compaction.
fn delete_copied(
    reg: &ItemRegistry,
    source: &mut Node,
    plan: &Plan,
    dir: ShiftDir,
) -> Result<usize> {
    let (from, to) = match dir {
        ShiftDir::Left => (Coord::first_unit(source), plan.real_stop),
        ShiftDir::Right => (plan.real_stop, source.last_unit_coord(reg)?),
    };
    let outcome = source.cut(reg, &CutRange::by_coords(from, to), None)?;
    Ok(outcome.removed)
}

/// Run the shift hook of every item that received units, boundary items
/// included, so external back-references learn their new owner.
fn call_shift_hooks(
    reg: &ItemRegistry,
    target: &Node,
    plan: &Plan,
    dir: ShiftDir,
    refs: &mut dyn ShiftTracker,
) -> Result<()> {
    let touched =
        plan.entire + usize::from(plan.merging_units > 0) + usize::from(plan.part_units > 0);
    if touched == 0 {
        return Ok(());
    }

    let new_home = target.id();
    for i in 0..touched {
        // moved items sit at the target's end for a left shift and at its
        // start for a right shift; the merged boundary item is farthest in
        let pos = match dir {
            ShiftDir::Left => target.nr_items() - 1 - i as u16,
            ShiftDir::Right => i as u16,
        };
        let plugin = target.plugin(reg, pos)?;
        let view = target.item_view(pos);
        let nr_units = plugin.nr_units(view);

        let (from, count) = if i == 0 && plan.part_units > 0 {
            (0, plan.part_units)
        } else if i == touched - 1 && plan.merging_units > 0 {
            match dir {
                ShiftDir::Left => (nr_units - plan.merging_units, plan.merging_units),
                ShiftDir::Right => (0, plan.merging_units),
            }
        } else {
            (0, nr_units)
        };

        plugin.shift_hook(view, from, count, new_home, refs);
    }
    Ok(())
}

/// Adjust the caller's insert coordinate for what actually moved.
fn adjust_insert(
    source: &Node,
    target: &Node,
    plan: &Plan,
    dir: ShiftDir,
    removed: usize,
    including: bool,
    insert: &mut Coord,
) -> Side {
    if source.is_empty() {
        debug_assert!(plan.everything);
        return if including {
            *insert = match dir {
                ShiftDir::Right => Coord::before_first(target),
                ShiftDir::Left => Coord::after_last(target),
            };
            Side::Target
        } else {
            *insert = Coord::first_unit(source);
            Side::Source
        };
    }

    if dir == ShiftDir::Right {
        if plan.everything {
            if including {
                *insert = Coord::before_first(target);
                return Side::Target;
            }
            *insert = Coord::after_last(source);
        }
        return Side::Source;
    }

    // left shift
    if plan.everything {
        if including {
            *insert = Coord::after_last(target);
            return Side::Target;
        }
        *insert = Coord::before_first(source);
        return Side::Source;
    }

    if removed == 0 {
        // only the boundary item gave up units
        debug_assert!(plan.merging_units == 0 || plan.part_units == 0);
        let moved = if plan.merging_units > 0 {
            plan.merging_units
        } else {
            plan.part_units
        };
        if plan.real_stop.item_pos == insert.item_pos
            && matches!(insert.between, Between::AfterUnit | Between::BeforeUnit)
        {
            insert.unit_pos -= moved as u16;
        }
        return Side::Source;
    }

    match insert.between {
        Between::AfterUnit | Between::BeforeUnit => {
            if plan.real_stop.item_pos == insert.item_pos {
                insert.unit_pos -= plan.part_units as u16;
            }
            insert.item_pos -= removed as u16;
        }
        Between::AfterItem | Between::BeforeItem => {
            insert.item_pos -= removed as u16;
        }
        _ => debug_assert!(false, "unexpected insert coordinate after shift"),
    }
    Side::Source
}

impl ShiftReport {
    /// Remap a coordinate that was valid in either node before the shift
    /// to its position afterwards: a pure index computation, resolved
    /// against the post-shift nodes.
    pub fn remap(
        &self,
        reg: &ItemRegistry,
        _source: &Node,
        target: &Node,
        side: Side,
        old: Coord,
    ) -> Result<(Side, Coord)> {
        let mut new = old;

        if side == Side::Target {
            if self.dir == ShiftDir::Left {
                // coordinates in the left sibling do not move
                return Ok((Side::Target, old));
            }
            new.item_pos = old.item_pos + self.entire + u16::from(self.part_units > 0);
            if old.item_pos == 0 && self.merging_units > 0 {
                new.unit_pos += self.merging_units as u16;
            }
            return Ok((Side::Target, new));
        }

        match self.dir {
            ShiftDir::Left => {
                if unit_moved_left(&self.real_stop, &old) {
                    new.item_pos = target.nr_items()
                        - self.entire
                        - u16::from(self.part_units > 0)
                        + old.item_pos;
                    new.unit_pos = old.unit_pos;
                    if self.merging_units > 0 {
                        new.item_pos -= 1;
                        if old.item_pos == 0 {
                            let units = target.num_units(reg, new.item_pos)? as u16;
                            new.unit_pos =
                                units - (self.merging_units as u16 - old.unit_pos);
                        }
                    }
                    Ok((Side::Target, new))
                } else {
                    new.item_pos = old.item_pos - self.future_first.item_pos;
                    if new.item_pos == 0 {
                        new.unit_pos = old.unit_pos - self.future_first.unit_pos;
                    }
                    Ok((Side::Source, new))
                }
            }
            ShiftDir::Right => {
                if unit_moved_right(&self.real_stop, &old) {
                    new.item_pos = old.item_pos - self.real_stop.item_pos;
                    if new.item_pos == 0 {
                        new.unit_pos = old.unit_pos - self.real_stop.unit_pos;
                    }
                    Ok((Side::Target, new))
                } else {
                    Ok((Side::Source, old))
                }
            }
        }
    }

    pub fn source_emptied(&self) -> bool {
        self.source_emptied
    }

    pub fn everything_moved(&self) -> bool {
        self.everything
    }
}

/// Did `old` (in pre-shift source numbering) end up in the left neighbor?
fn unit_moved_left(real_stop: &Coord, old: &Coord) -> bool {
    if real_stop.item_pos < old.item_pos {
        return false;
    }
    if real_stop.item_pos == old.item_pos && real_stop.unit_pos < old.unit_pos {
        return false;
    }
    true
}

fn unit_moved_right(real_stop: &Coord, old: &Coord) -> bool {
    if real_stop.item_pos > old.item_pos {
        return false;
    }
    if real_stop.item_pos == old.item_pos && real_stop.unit_pos > old.unit_pos {
        return false;
    }
    true
}

#[cfg(debug_assertions)]
fn oriented<'a>(source: &'a Node, target: &'a Node, dir: ShiftDir) -> (&'a Node, &'a Node) {
    match dir {
        ShiftDir::Left => (target, source),
        ShiftDir::Right => (source, target),
    }
}

/// Conservation audit: the multiset of (key, type, unit count) across both
/// siblings, with the boundary pair folded when mergeable, must be the
/// same before and after a shift. Debug builds verify every shift with it.
#[cfg(debug_assertions)]
fn audit_prepare(
    reg: &ItemRegistry,
    left: &Node,
    right: &Node,
) -> Result<Vec<(crate::key::Key, u16, usize)>> {
    let mergeable = if left.is_empty() || right.is_empty() {
        false
    } else {
        views_mergeable(
            reg,
            left.item_type_id(left.nr_items() - 1),
            left.item_view(left.nr_items() - 1),
            right.item_type_id(0),
            right.item_view(0),
        )?
    };

    let mut entries = Vec::with_capacity(left.nr_items() as usize + right.nr_items() as usize);
    for pos in 0..left.nr_items() {
        entries.push((
            left.item_key(pos),
            left.item_type_id(pos),
            left.num_units(reg, pos)?,
        ));
    }
    for pos in 0..right.nr_items() {
        let units = right.num_units(reg, pos)?;
        if pos == 0 && mergeable {
            let last = entries
                .last_mut()
                .ok_or_else(|| eyre::eyre!("mergeable boundary with empty left audit"))?;
            last.2 += units;
        } else {
            entries.push((right.item_key(pos), right.item_type_id(pos), units));
        }
    }
    Ok(entries)
}

#[cfg(debug_assertions)]
fn audit_verify(
    before: &[(crate::key::Key, u16, usize)],
    reg: &ItemRegistry,
    left: &Node,
    right: &Node,
) -> Result<()> {
    let after = audit_prepare(reg, left, right)?;
    eyre::ensure!(
        before == after.as_slice(),
        "shift conservation audit failed: {:?} != {:?}",
        before,
        after
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::extent::{encode_runs, ExtentUnit, EXTENT_UNIT_SIZE};
    use crate::item::stat_data::StatData;
    use crate::item::{ItemRegistry, ItemType, NullTracker};
    use crate::key::{Key, KeyType};
    use crate::node::{CheckFlags, NodeFormat, LEAF_LEVEL, TWIG_LEVEL};
    use crate::tree::{CarryOp, CarryQueue, NodeId};
    use zerocopy::{FromBytes, IntoBytes};

    fn reg() -> ItemRegistry {
        ItemRegistry::standard()
    }

    fn leaf(id: u64) -> Node {
        Node::init(NodeId(id), 512, NodeFormat::Plain, LEAF_LEVEL, 0).unwrap()
    }

    fn twig(id: u64) -> Node {
        Node::init(NodeId(id), 512, NodeFormat::Plain, TWIG_LEVEL, 0).unwrap()
    }

    fn tail_key(oid: u64, offset: u64) -> Key {
        Key::build(1, KeyType::FileBody, oid, offset)
    }

    fn sd_key(oid: u64) -> Key {
        Key::build(1, KeyType::StatData, oid, 0)
    }

    fn append(node: &mut Node, reg: &ItemRegistry, key: Key, typ: ItemType, body: &[u8]) {
        node.create_item(reg, &Coord::after_last(node), key, typ, body, None)
            .unwrap();
    }

    fn shift_left_all(
        reg: &ItemRegistry,
        source: &mut Node,
        target: &mut Node,
        carry: &mut CarryQueue,
    ) -> ShiftOutcome {
        let mut insert = Coord::after_last(source);
        shift(
            reg,
            source,
            target,
            &mut insert,
            ShiftParams {
                dir: ShiftDir::Left,
                delete_emptied_source: true,
                including_insert_coord: false,
            },
            Some(carry),
            &mut NullTracker,
        )
        .unwrap()
    }

    #[test]
    fn left_shift_merges_adjacent_tails() {
        let reg = reg();
        let mut target = leaf(1);
        let mut source = leaf(2);
        append(&mut target, &reg, tail_key(9, 0), ItemType::Tail, b"abc");
        append(&mut source, &reg, tail_key(9, 3), ItemType::Tail, b"defgh");
        let mut carry = CarryQueue::new();

        let outcome = shift_left_all(&reg, &mut source, &mut target, &mut carry);

        assert_eq!(outcome.bytes, 5);
        assert_eq!(target.nr_items(), 1, "merged into one item");
        assert_eq!(target.item_body(0), b"abcdefgh");
        assert_eq!(target.item_key(0), tail_key(9, 0));
        assert!(source.is_empty());
        assert_eq!(
            carry.ops(),
            &[
                CarryOp::UpdateDelimitingKey(NodeId(2)),
                CarryOp::RemoveNode(NodeId(2)),
            ]
        );
        target.check(&reg, CheckFlags::default(), None).unwrap();
        source.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn left_shift_into_empty_sibling_copies_whole_items() {
        let reg = reg();
        let mut target = twig(1);
        let mut source = twig(2);
        let a = Key::build(1, KeyType::FileBody, 10, 0);
        let b = Key::build(1, KeyType::FileBody, 11, 0);
        append(&mut source, &reg, a, ItemType::Extent, &encode_runs(&[(100, 2)]));
        append(&mut source, &reg, b, ItemType::Extent, &encode_runs(&[(300, 1)]));
        let mut carry = CarryQueue::new();

        let outcome = shift_left_all(&reg, &mut source, &mut target, &mut carry);

        assert_eq!(outcome.bytes, 2 * EXTENT_UNIT_SIZE);
        assert_eq!(target.nr_items(), 2);
        assert_eq!(
            target.item_key(0),
            a,
            "sibling's first key is the shifted node's old first key"
        );
        assert_eq!(target.item_key(1), b);
        assert!(source.is_empty());
        assert_eq!(
            carry.ops(),
            &[
                CarryOp::UpdateDelimitingKey(NodeId(1)),
                CarryOp::UpdateDelimitingKey(NodeId(2)),
                CarryOp::RemoveNode(NodeId(2)),
            ]
        );
        target.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn extent_merge_adds_unit_counts_and_fires_shift_hooks() {
        struct Moves(Vec<(usize, usize, NodeId)>);
        impl ShiftTracker for Moves {
            fn units_moved(&mut self, _key: &Key, from: usize, count: usize, home: NodeId) {
                self.0.push((from, count, home));
            }
        }

        let reg = reg();
        let mut target = twig(1);
        let mut source = twig(2);
        let key = Key::build(1, KeyType::FileBody, 10, 0);
        append(&mut target, &reg, key, ItemType::Extent, &encode_runs(&[(100, 2)]));
        append(
            &mut source,
            &reg,
            key.with_offset(2 * crate::config::DATA_BLOCK_SIZE),
            ItemType::Extent,
            &encode_runs(&[(300, 1), (400, 2)]),
        );

        let mut moves = Moves(Vec::new());
        let mut insert = Coord::after_last(&source);
        let outcome = shift(
            &reg,
            &mut source,
            &mut target,
            &mut insert,
            ShiftParams {
                dir: ShiftDir::Left,
                delete_emptied_source: true,
                including_insert_coord: false,
            },
            None,
            &mut moves,
        )
        .unwrap();

        assert_eq!(outcome.bytes, 2 * EXTENT_UNIT_SIZE);
        assert_eq!(target.nr_items(), 1, "one combined item, not two");
        assert_eq!(target.item_length(0), 3 * EXTENT_UNIT_SIZE);
        let body = target.item_body(0);
        let last = ExtentUnit::read_from_bytes(&body[2 * EXTENT_UNIT_SIZE..]).unwrap();
        assert_eq!(last.as_bytes(), ExtentUnit::new(400, 2).as_bytes());
        assert_eq!(moves.0, vec![(1, 2, NodeId(1))]);
        assert!(source.is_empty());
        target.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn partial_left_shift_stops_at_the_insert_coordinate() {
        let reg = reg();
        let mut target = leaf(1);
        let mut source = leaf(2);
        append(&mut source, &reg, tail_key(9, 0), ItemType::Tail, b"abcdefgh");
        let mut carry = CarryQueue::new();

        let mut insert = Coord::at(0, 2);
        let outcome = shift(
            &reg,
            &mut source,
            &mut target,
            &mut insert,
            ShiftParams {
                dir: ShiftDir::Left,
                delete_emptied_source: true,
                including_insert_coord: true,
            },
            Some(&mut carry),
            &mut NullTracker,
        )
        .unwrap();

        assert_eq!(outcome.bytes, 3);
        assert_eq!(target.item_body(0), b"abc");
        assert_eq!(target.item_key(0), tail_key(9, 0));
        assert_eq!(source.item_body(0), b"defgh");
        assert_eq!(source.item_key(0), tail_key(9, 3));
        assert_eq!(outcome.insert_side, Side::Target);
        assert_eq!(insert.between, Between::AfterItem);

        // remap a unit that moved and one that stayed
        let report = outcome.report.unwrap();
        let (side, coord) = report
            .remap(&reg, &source, &target, Side::Source, Coord::at(0, 1))
            .unwrap();
        assert_eq!((side, coord.item_pos, coord.unit_pos), (Side::Target, 0, 1));
        let (side, coord) = report
            .remap(&reg, &source, &target, Side::Source, Coord::at(0, 5))
            .unwrap();
        assert_eq!((side, coord.item_pos, coord.unit_pos), (Side::Source, 0, 2));

        target.check(&reg, CheckFlags::default(), None).unwrap();
        source.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn right_shift_moves_trailing_items_to_the_front() {
        let reg = reg();
        let mut source = leaf(1);
        let mut target = leaf(2);
        for oid in [10, 20] {
            let body = StatData::new(0o644, 1, oid);
            append(&mut source, &reg, sd_key(oid), ItemType::StatData, body.as_bytes());
        }
        let body = StatData::new(0o644, 1, 30);
        append(&mut target, &reg, sd_key(30), ItemType::StatData, body.as_bytes());
        let mut carry = CarryQueue::new();

        let mut insert = Coord::before_first(&source);
        let outcome = shift(
            &reg,
            &mut source,
            &mut target,
            &mut insert,
            ShiftParams {
                dir: ShiftDir::Right,
                delete_emptied_source: true,
                including_insert_coord: false,
            },
            Some(&mut carry),
            &mut NullTracker,
        )
        .unwrap();

        assert_eq!(outcome.bytes, 72);
        assert!(source.is_empty());
        assert_eq!(target.nr_items(), 3);
        assert_eq!(target.item_key(0), sd_key(10));
        assert_eq!(target.item_key(1), sd_key(20));
        assert_eq!(target.item_key(2), sd_key(30));
        assert_eq!(
            carry.ops(),
            &[
                CarryOp::UpdateDelimitingKey(NodeId(2)),
                CarryOp::RemoveNode(NodeId(1)),
            ]
        );
        target.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn right_shift_merges_tail_into_target_head() {
        let reg = reg();
        let mut source = leaf(1);
        let mut target = leaf(2);
        append(&mut source, &reg, tail_key(9, 0), ItemType::Tail, b"abcde");
        append(&mut target, &reg, tail_key(9, 5), ItemType::Tail, b"fgh");

        let mut insert = Coord::at(0, 3);
        let outcome = shift(
            &reg,
            &mut source,
            &mut target,
            &mut insert,
            ShiftParams {
                dir: ShiftDir::Right,
                delete_emptied_source: false,
                including_insert_coord: false,
            },
            None,
            &mut NullTracker,
        )
        .unwrap();

        // units 3..4 ("de") move; "abc" stays behind
        assert_eq!(outcome.bytes, 2);
        assert_eq!(source.item_body(0), b"abc");
        assert_eq!(target.nr_items(), 1);
        assert_eq!(target.item_body(0), b"defgh");
        assert_eq!(target.item_key(0), tail_key(9, 3));
        target.check(&reg, CheckFlags::default(), None).unwrap();
        source.check(&reg, CheckFlags::default(), None).unwrap();
    }

    #[test]
    fn stalled_shift_reports_zero_bytes() {
        let reg = reg();
        let mut target = leaf(1);
        let mut source = leaf(2);
        // fill the target until not even a fresh header fits usefully
        for oid in 0..7 {
            let body = StatData::new(0o644, 1, oid);
            append(&mut target, &reg, sd_key(oid), ItemType::StatData, body.as_bytes());
        }
        let body = StatData::new(0o644, 1, 100);
        append(&mut source, &reg, sd_key(100), ItemType::StatData, body.as_bytes());
        let before = source.as_bytes().to_vec();

        let mut carry = CarryQueue::new();
        let outcome = shift_left_all(&reg, &mut source, &mut target, &mut carry);

        assert_eq!(outcome.bytes, 0, "caller falls back to parent-level rebalance");
        assert_eq!(source.as_bytes(), before.as_slice());
        assert!(carry.is_empty());
    }
}
