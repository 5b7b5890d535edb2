//! Tail items: raw file bytes stored inline in the leaf. The unit is a
//! single byte, so unit arithmetic is byte arithmetic and the unit key is
//! the item key plus the byte's position.

use eyre::{ensure, Result};

use crate::coord::Between;
use crate::key::Key;
use crate::node::leaf_only;

use super::{
    CutUnitsOut, ItemPlugin, ItemType, ItemView, ItemViewMut, LookupBias, ShiftDir,
    ShiftFit, UnitLookup,
};

pub struct TailItem;

impl ItemPlugin for TailItem {
    fn item_type(&self) -> ItemType {
        ItemType::Tail
    }

    fn name(&self) -> &'static str {
        "tail"
    }

    fn allowed_on_level(&self, level: u8) -> bool {
        leaf_only(level)
    }

    fn nr_units(&self, item: ItemView<'_>) -> usize {
        item.body.len()
    }

    fn unit_key(&self, item: ItemView<'_>, unit: usize) -> Key {
        item.key.with_offset(item.key.offset() + unit as u64)
    }

    fn max_key_inside(&self, item: ItemView<'_>) -> Option<Key> {
        Some(item.key.with_offset(u64::MAX))
    }

    fn mergeable(&self, left: ItemView<'_>, right: ItemView<'_>) -> bool {
        left.key.same_object(&right.key)
            && left.key.offset() + left.body.len() as u64 == right.key.offset()
    }

    fn lookup(&self, item: ItemView<'_>, key: &Key, bias: LookupBias) -> UnitLookup {
        let len = item.body.len() as u64;
        let rel = key.offset().wrapping_sub(item.key.offset());
        if item.key.same_object(key) && rel < len {
            return UnitLookup {
                found: true,
                unit_pos: rel as u16,
                between: Between::AtUnit,
            };
        }
        UnitLookup {
            found: bias == LookupBias::Floor,
            unit_pos: (len - 1) as u16,
            between: Between::AfterUnit,
        }
    }

    fn paste(
        &self,
        item: ItemViewMut<'_>,
        insert_at: usize,
        payload: &[u8],
        old_len: usize,
    ) -> Result<()> {
        ensure!(insert_at <= old_len, "tail paste beyond item end");
        item.body
            .copy_within(insert_at..old_len, insert_at + payload.len());
        item.body[insert_at..insert_at + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    fn cut_units(
        &self,
        item: ItemViewMut<'_>,
        from: usize,
        to: usize,
        out: &mut CutUnitsOut,
    ) -> Result<usize> {
        let len = item.body.len();
        ensure!(from <= to && to < len, "tail cut range out of bounds");
        let freed = to - from + 1;

        out.smallest_removed = Some(self.unit_key(item.as_view(), from));
        if from == 0 {
            // head cut: the survivors already occupy the body's end
            out.new_first_key = Some(self.unit_key(item.as_view(), to + 1));
        } else {
            // tail or mid cut: pull the survivors forward
            item.body.copy_within(to + 1..len, from);
        }
        Ok(freed)
    }

    fn can_shift(
        &self,
        free_space: usize,
        source: ItemView<'_>,
        _dir: ShiftDir,
        want: usize,
        _into_existing: bool,
    ) -> ShiftFit {
        let units = want.min(free_space).min(source.body.len());
        ShiftFit {
            units,
            bytes: units,
        }
    }

    fn copy_units(
        &self,
        target: ItemViewMut<'_>,
        source: ItemView<'_>,
        from: usize,
        count: usize,
        dir: ShiftDir,
        free_space: usize,
    ) -> Result<()> {
        ensure!(from + count <= source.body.len(), "tail copy out of bounds");
        ensure!(count == free_space, "tail copy gap mismatch");
        let src = &source.body[from..from + count];
        match dir {
            ShiftDir::Left => {
                let old_len = target.body.len() - free_space;
                target.body[old_len..].copy_from_slice(src);
            }
            ShiftDir::Right => {
                target.body[..count].copy_from_slice(src);
            }
        }
        Ok(())
    }
}
