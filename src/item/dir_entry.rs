//! Directory entry items.
//!
//! Two forms exist. A *simple* entry item holds exactly one name and is
//! atomic. A *compound* item packs many entries of one directory, ordered
//! by name hash, and supports unit-level cut, paste and shift:
//!
//! ```text
//! compound body:  count(u16) | entry 0 | entry 1 | ...
//! entry:          hash(u64) | objectid(u64) | name_len(u16) | name bytes
//! ```
//!
//! The item key's offset word carries the hash of the first entry; unit
//! keys substitute each entry's own hash. Hash collisions are legal:
//! equal unit keys simply sit next to each other, and lookups resolve to
//! the leftmost.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::IntoBytes;

use crate::coord::Between;
use crate::key::Key;
use crate::node::leaf_only;

use super::{
    CutUnitsOut, ItemPlugin, ItemType, ItemView, ItemViewMut, LookupBias, ShiftDir,
    ShiftFit, UnitLookup,
};

/// Fixed part of one compound entry: hash + objectid + name length.
pub const ENTRY_HEADER_SIZE: usize = 18;
const COUNT_SIZE: usize = 2;

/// 64-bit FNV-1a over the name; the on-disk ordering hash for entries.
pub fn hash_name(name: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in name {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Encode one compound entry (the unit-level payload for paste/copy).
pub fn encode_entry(hash: u64, objectid: u64, name: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ENTRY_HEADER_SIZE + name.len());
    bytes.extend_from_slice(U64::new(hash).as_bytes());
    bytes.extend_from_slice(U64::new(objectid).as_bytes());
    bytes.extend_from_slice(U16::new(name.len() as u16).as_bytes());
    bytes.extend_from_slice(name);
    bytes
}

/// Encode a whole compound item body. Entries must already be sorted by
/// hash.
pub fn encode_entries(entries: &[(u64, u64, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(U16::new(entries.len() as u16).as_bytes());
    for &(hash, objectid, name) in entries {
        body.extend_from_slice(&encode_entry(hash, objectid, name));
    }
    body
}

fn entry_count(body: &[u8]) -> usize {
    u16::from_le_bytes([body[0], body[1]]) as usize
}

fn set_entry_count(body: &mut [u8], count: usize) {
    body[0..2].copy_from_slice(&(count as u16).to_le_bytes());
}

fn entry_name_len(body: &[u8], at: usize) -> usize {
    u16::from_le_bytes([body[at + 16], body[at + 17]]) as usize
}

/// Byte offset of entry `idx` within the body (offset of the end of the
/// entry table for `idx == count`).
fn entry_offset(body: &[u8], idx: usize) -> usize {
    let mut at = COUNT_SIZE;
    for _ in 0..idx {
        at += ENTRY_HEADER_SIZE + entry_name_len(body, at);
    }
    at
}

fn entry_hash(body: &[u8], idx: usize) -> u64 {
    let at = entry_offset(body, idx);
    u64::from_le_bytes(body[at..at + 8].try_into().unwrap())
}

/// Decoded view of one entry.
pub fn entry(body: &[u8], idx: usize) -> (u64, u64, &[u8]) {
    let at = entry_offset(body, idx);
    let hash = u64::from_le_bytes(body[at..at + 8].try_into().unwrap());
    let objectid = u64::from_le_bytes(body[at + 8..at + 16].try_into().unwrap());
    let name_len = entry_name_len(body, at);
    let name = &body[at + ENTRY_HEADER_SIZE..at + ENTRY_HEADER_SIZE + name_len];
    (hash, objectid, name)
}

/// Simple directory entry: one name per item, atomic.
pub struct SimpleDirEntryItem;

/// Body of a simple entry: `objectid(u64) | name bytes`.
pub fn encode_simple_entry(objectid: u64, name: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(8 + name.len());
    bytes.extend_from_slice(U64::new(objectid).as_bytes());
    bytes.extend_from_slice(name);
    bytes
}

pub fn decode_simple_entry(body: &[u8]) -> (u64, &[u8]) {
    let objectid = u64::from_le_bytes(body[..8].try_into().unwrap());
    (objectid, &body[8..])
}

impl ItemPlugin for SimpleDirEntryItem {
    fn item_type(&self) -> ItemType {
        ItemType::SimpleDirEntry
    }

    fn name(&self) -> &'static str {
        "simple-dir-entry"
    }

    fn allowed_on_level(&self, level: u8) -> bool {
        leaf_only(level)
    }

    fn nr_units(&self, _item: ItemView<'_>) -> usize {
        1
    }

    fn unit_key(&self, item: ItemView<'_>, _unit: usize) -> Key {
        item.key
    }

    fn max_key_inside(&self, item: ItemView<'_>) -> Option<Key> {
        Some(item.key)
    }

    fn cut_units(
        &self,
        _item: ItemViewMut<'_>,
        _from: usize,
        _to: usize,
        _out: &mut CutUnitsOut,
    ) -> Result<usize> {
        eyre::bail!("simple directory entries have no cuttable units");
    }

    fn can_shift(
        &self,
        _free_space: usize,
        _source: ItemView<'_>,
        _dir: ShiftDir,
        _want: usize,
        _into_existing: bool,
    ) -> ShiftFit {
        ShiftFit::default()
    }

    fn copy_units(
        &self,
        _target: ItemViewMut<'_>,
        _source: ItemView<'_>,
        _from: usize,
        _count: usize,
        _dir: ShiftDir,
        _free_space: usize,
    ) -> Result<()> {
        eyre::bail!("simple directory entries cannot be copied by units");
    }
}

/// Compound directory entry item: many hash-ordered entries per item.
pub struct CompoundDirEntryItem;

impl ItemPlugin for CompoundDirEntryItem {
    fn item_type(&self) -> ItemType {
        ItemType::CompoundDirEntry
    }

    fn name(&self) -> &'static str {
        "compound-dir-entry"
    }

    fn allowed_on_level(&self, level: u8) -> bool {
        leaf_only(level)
    }

    fn nr_units(&self, item: ItemView<'_>) -> usize {
        entry_count(item.body)
    }

    fn unit_key(&self, item: ItemView<'_>, unit: usize) -> Key {
        item.key.with_offset(entry_hash(item.body, unit))
    }

    fn max_key_inside(&self, item: ItemView<'_>) -> Option<Key> {
        Some(item.key.with_offset(u64::MAX))
    }

    /// Entries of one directory always coalesce.
    fn mergeable(&self, left: ItemView<'_>, right: ItemView<'_>) -> bool {
        left.key.same_object(&right.key)
    }

    fn lookup(&self, item: ItemView<'_>, key: &Key, bias: LookupBias) -> UnitLookup {
        let count = entry_count(item.body);
        let target = key.offset();
        for unit in 0..count {
            let hash = entry_hash(item.body, unit);
            if hash == target {
                // leftmost among colliding hashes
                return UnitLookup {
                    found: true,
                    unit_pos: unit as u16,
                    between: Between::AtUnit,
                };
            }
            if hash > target {
                return UnitLookup {
                    found: false,
                    unit_pos: unit as u16,
                    between: Between::BeforeUnit,
                };
            }
        }
        UnitLookup {
            found: bias == LookupBias::Floor,
            unit_pos: count.saturating_sub(1) as u16,
            between: Between::AfterUnit,
        }
    }

    fn init(&self, body: &mut [u8]) {
        if body.len() >= COUNT_SIZE {
            set_entry_count(body, 0);
        }
    }

    fn paste(
        &self,
        item: ItemViewMut<'_>,
        insert_at: usize,
        payload: &[u8],
        old_len: usize,
    ) -> Result<()> {
        ensure!(payload.len() >= ENTRY_HEADER_SIZE, "truncated entry payload");
        let name_len = u16::from_le_bytes(payload[16..18].try_into().unwrap()) as usize;
        ensure!(
            payload.len() == ENTRY_HEADER_SIZE + name_len,
            "entry payload length does not match its name length"
        );

        let count = entry_count(item.body);
        ensure!(insert_at <= count, "paste position beyond entry count");
        let at = entry_offset(item.body, insert_at);

        item.body.copy_within(at..old_len, at + payload.len());
        item.body[at..at + payload.len()].copy_from_slice(payload);
        set_entry_count(item.body, count + 1);
        Ok(())
    }

    fn cut_units(
        &self,
        item: ItemViewMut<'_>,
        from: usize,
        to: usize,
        out: &mut CutUnitsOut,
    ) -> Result<usize> {
        let count = entry_count(item.body);
        ensure!(from <= to && to < count, "entry cut range out of bounds");
        let removed = to - from + 1;
        let len = item.body.len();

        out.smallest_removed = Some(self.unit_key(item.as_view(), from));

        let survivors_from = entry_offset(item.body, to + 1);
        if from == 0 {
            // head cut: survivors stay put at the body's end; the new
            // count lands just before them and the freed space is the
            // leading bytes
            out.new_first_key = Some(self.unit_key(item.as_view(), to + 1));
            let freed = survivors_from - COUNT_SIZE;
            let count_at = freed;
            item.body[count_at..count_at + COUNT_SIZE]
                .copy_from_slice(&((count - removed) as u16).to_le_bytes());
            Ok(freed)
        } else {
            let gap_from = entry_offset(item.body, from);
            let freed = survivors_from - gap_from;
            item.body.copy_within(survivors_from..len, gap_from);
            set_entry_count(item.body, count - removed);
            Ok(freed)
        }
    }

    fn can_shift(
        &self,
        free_space: usize,
        source: ItemView<'_>,
        dir: ShiftDir,
        want: usize,
        into_existing: bool,
    ) -> ShiftFit {
        let count = entry_count(source.body);
        let want = want.min(count);
        let overhead = if into_existing { 0 } else { COUNT_SIZE };
        let Some(mut budget) = free_space.checked_sub(overhead) else {
            return ShiftFit::default();
        };

        let mut units = 0;
        let mut bytes = 0;
        while units < want {
            let idx = match dir {
                ShiftDir::Left => units,
                ShiftDir::Right => count - 1 - units,
            };
            let at = entry_offset(source.body, idx);
            let size = ENTRY_HEADER_SIZE + entry_name_len(source.body, at);
            if size > budget {
                break;
            }
            budget -= size;
            bytes += size;
            units += 1;
        }
        if units == 0 {
            return ShiftFit::default();
        }
        ShiftFit {
            units,
            bytes: bytes + overhead,
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
        let src_from = entry_offset(source.body, from);
        let src_to = entry_offset(source.body, from + count);
        let entry_bytes = src_to - src_from;
        let src = &source.body[src_from..src_to];

        let old_len = target.body.len() - free_space;
        if old_len == 0 {
            // fresh item seeded from these units
            ensure!(
                free_space == entry_bytes + COUNT_SIZE,
                "entry copy gap mismatch for a fresh item"
            );
            set_entry_count(target.body, count);
            target.body[COUNT_SIZE..COUNT_SIZE + entry_bytes].copy_from_slice(src);
            return Ok(());
        }

        ensure!(free_space == entry_bytes, "entry copy gap mismatch");
        match dir {
            ShiftDir::Left => {
                let old_count = entry_count(target.body);
                target.body[old_len..old_len + entry_bytes].copy_from_slice(src);
                set_entry_count(target.body, old_count + count);
            }
            ShiftDir::Right => {
                // gap sits before the old body; the old count field is
                // about to be overwritten, so read it first
                let old_count =
                    u16::from_le_bytes(target.body[free_space..free_space + 2].try_into().unwrap())
                        as usize;
                target.body[COUNT_SIZE..COUNT_SIZE + entry_bytes].copy_from_slice(src);
                set_entry_count(target.body, old_count + count);
            }
        }
        Ok(())
    }
}
