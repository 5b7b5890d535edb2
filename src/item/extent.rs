//! Extent items: runs of data blocks mapped to a contiguous byte range of
//! a file body, stored on the twig level. One unit is one `(start, width)`
//! block run, 16 bytes on disk; unit keys advance by `width` data blocks.
//!
//! Extents are the one built-in type with real destructors and external
//! back-references: killing units releases their block runs through the
//! caller's [`super::BlockSink`], and relocating units reports the move to
//! the caller's [`super::ShiftTracker`] so page ownership can follow.

use eyre::{ensure, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::DATA_BLOCK_SIZE;
use crate::coord::Between;
use crate::key::Key;
use crate::node::twig_only;
use crate::tree::NodeId;

use super::{
    CutUnitsOut, ItemPlugin, ItemType, ItemView, ItemViewMut, KillContext, LookupBias,
    ShiftDir, ShiftFit, ShiftTracker, UnitLookup,
};

pub const EXTENT_UNIT_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ExtentUnit {
    start: U64,
    width: U64,
}

const _: () = assert!(std::mem::size_of::<ExtentUnit>() == EXTENT_UNIT_SIZE);

impl ExtentUnit {
    pub fn new(start: u64, width: u64) -> ExtentUnit {
        ExtentUnit {
            start: U64::new(start),
            width: U64::new(width),
        }
    }

    pub fn start(&self) -> u64 {
        self.start.get()
    }

    pub fn width(&self) -> u64 {
        self.width.get()
    }
}

/// Encode block runs into an extent item body.
pub fn encode_runs(runs: &[(u64, u64)]) -> Vec<u8> {
    let mut body = Vec::with_capacity(runs.len() * EXTENT_UNIT_SIZE);
    for &(start, width) in runs {
        body.extend_from_slice(ExtentUnit::new(start, width).as_bytes());
    }
    body
}

fn unit_at(body: &[u8], unit: usize) -> ExtentUnit {
    let at = unit * EXTENT_UNIT_SIZE;
    ExtentUnit::read_from_bytes(&body[at..at + EXTENT_UNIT_SIZE]).unwrap()
}

/// Total data bytes mapped by units `[0, unit)`.
fn bytes_before(body: &[u8], unit: usize) -> u64 {
    let mut blocks = 0u64;
    for i in 0..unit {
        blocks += unit_at(body, i).width();
    }
    blocks * DATA_BLOCK_SIZE
}

pub struct ExtentItem;

impl ExtentItem {
    fn units(body: &[u8]) -> usize {
        debug_assert_eq!(body.len() % EXTENT_UNIT_SIZE, 0);
        body.len() / EXTENT_UNIT_SIZE
    }
}

impl ItemPlugin for ExtentItem {
    fn item_type(&self) -> ItemType {
        ItemType::Extent
    }

    fn name(&self) -> &'static str {
        "extent"
    }

    fn allowed_on_level(&self, level: u8) -> bool {
        twig_only(level)
    }

    fn nr_units(&self, item: ItemView<'_>) -> usize {
        Self::units(item.body)
    }

    fn unit_key(&self, item: ItemView<'_>, unit: usize) -> Key {
        item.key
            .with_offset(item.key.offset() + bytes_before(item.body, unit))
    }

    fn max_key_inside(&self, item: ItemView<'_>) -> Option<Key> {
        Some(item.key.with_offset(u64::MAX))
    }

    fn max_real_key(&self, item: ItemView<'_>) -> Key {
        let total = bytes_before(item.body, Self::units(item.body));
        item.key.with_offset(item.key.offset() + total - 1)
    }

    fn mergeable(&self, left: ItemView<'_>, right: ItemView<'_>) -> bool {
        let total = bytes_before(left.body, Self::units(left.body));
        left.key.same_object(&right.key)
            && left.key.offset() + total == right.key.offset()
    }

    fn lookup(&self, item: ItemView<'_>, key: &Key, bias: LookupBias) -> UnitLookup {
        let units = Self::units(item.body);
        if item.key.same_object(key) && key.offset() >= item.key.offset() {
            let mut covered = item.key.offset();
            for unit in 0..units {
                covered += unit_at(item.body, unit).width() * DATA_BLOCK_SIZE;
                if key.offset() < covered {
                    return UnitLookup {
                        found: true,
                        unit_pos: unit as u16,
                        between: Between::AtUnit,
                    };
                }
            }
        }
        UnitLookup {
            found: bias == LookupBias::Floor,
            unit_pos: units.saturating_sub(1) as u16,
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
        ensure!(
            payload.len() % EXTENT_UNIT_SIZE == 0,
            "extent paste payload is not whole runs"
        );
        let at = insert_at * EXTENT_UNIT_SIZE;
        ensure!(at <= old_len, "extent paste beyond item end");
        item.body.copy_within(at..old_len, at + payload.len());
        item.body[at..at + payload.len()].copy_from_slice(payload);
        Ok(())
    }

    fn cut_units(
        &self,
        item: ItemViewMut<'_>,
        from: usize,
        to: usize,
        out: &mut CutUnitsOut,
    ) -> Result<usize> {
        let units = Self::units(item.body);
        ensure!(from <= to && to < units, "extent cut range out of bounds");

        out.smallest_removed = Some(self.unit_key(item.as_view(), from));
        if from == 0 {
            out.new_first_key = Some(self.unit_key(item.as_view(), to + 1));
        }

        let len = item.body.len();
        let freed = (to - from + 1) * EXTENT_UNIT_SIZE;
        if from == 0 {
            // head cut: survivors slide to the body's end (they are
            // already there; the freed space is the leading bytes)
        } else {
            item.body.copy_within((to + 1) * EXTENT_UNIT_SIZE..len, from * EXTENT_UNIT_SIZE);
        }
        Ok(freed)
    }

    fn kill_units(
        &self,
        item: ItemViewMut<'_>,
        from: usize,
        to: usize,
        kill: &mut KillContext<'_>,
        out: &mut CutUnitsOut,
    ) -> Result<usize> {
        for unit in from..=to {
            let run = unit_at(item.body, unit);
            kill.blocks.release(run.start(), run.width());
        }
        self.cut_units(item, from, to, out)
    }

    fn can_shift(
        &self,
        free_space: usize,
        source: ItemView<'_>,
        _dir: ShiftDir,
        want: usize,
        _into_existing: bool,
    ) -> ShiftFit {
        let units = want
            .min(free_space / EXTENT_UNIT_SIZE)
            .min(Self::units(source.body));
        ShiftFit {
            units,
            bytes: units * EXTENT_UNIT_SIZE,
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
        let bytes = count * EXTENT_UNIT_SIZE;
        ensure!(bytes == free_space, "extent copy gap mismatch");
        ensure!(
            (from + count) * EXTENT_UNIT_SIZE <= source.body.len(),
            "extent copy out of bounds"
        );
        let src = &source.body[from * EXTENT_UNIT_SIZE..(from + count) * EXTENT_UNIT_SIZE];
        match dir {
            ShiftDir::Left => {
                let old_len = target.body.len() - free_space;
                target.body[old_len..].copy_from_slice(src);
            }
            ShiftDir::Right => {
                target.body[..bytes].copy_from_slice(src);
            }
        }
        Ok(())
    }

    fn kill_hook(
        &self,
        item: ItemView<'_>,
        from: usize,
        count: usize,
        kill: &mut KillContext<'_>,
    ) {
        for unit in from..from + count {
            let run = unit_at(item.body, unit);
            kill.blocks.release(run.start(), run.width());
        }
    }

    fn shift_hook(
        &self,
        item: ItemView<'_>,
        from: usize,
        count: usize,
        new_home: NodeId,
        refs: &mut dyn ShiftTracker,
    ) {
        refs.units_moved(&item.key, from, count, new_home);
    }
}
