//! Stat-data items: one fixed-width record of file metadata per object.
//!
//! Stat-data is atomic: exactly one unit, no partial cut, no partial
//! shift. It either stays where it is or moves/dies whole.

use eyre::{bail, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::key::Key;
use crate::node::leaf_only;

use super::{
    CutUnitsOut, ItemPlugin, ItemType, ItemView, ItemViewMut, ShiftDir, ShiftFit,
};

pub const STAT_DATA_SIZE: usize = 36;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct StatData {
    mode: U16,
    flags: U16,
    nlink: U32,
    size: U64,
    blocks: U64,
    atime: U32,
    mtime: U32,
    ctime: U32,
}

const _: () = assert!(std::mem::size_of::<StatData>() == STAT_DATA_SIZE);

impl StatData {
    pub fn new(mode: u16, nlink: u32, size: u64) -> StatData {
        StatData {
            mode: U16::new(mode),
            flags: U16::new(0),
            nlink: U32::new(nlink),
            size: U64::new(size),
            blocks: U64::new(0),
            atime: U32::new(0),
            mtime: U32::new(0),
            ctime: U32::new(0),
        }
    }

    pub fn from_body(body: &[u8]) -> Result<&StatData> {
        StatData::ref_from_bytes(body)
            .map_err(|e| eyre::eyre!("malformed stat-data body: {:?}", e))
    }

    pub fn mode(&self) -> u16 {
        self.mode.get()
    }

    pub fn nlink(&self) -> u32 {
        self.nlink.get()
    }

    pub fn size(&self) -> u64 {
        self.size.get()
    }
}

pub struct StatDataItem;

impl ItemPlugin for StatDataItem {
    fn item_type(&self) -> ItemType {
        ItemType::StatData
    }

    fn name(&self) -> &'static str {
        "stat-data"
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
        bail!("stat-data has no cuttable units");
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
        bail!("stat-data cannot be copied by units");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyType;
    use zerocopy::IntoBytes;

    #[test]
    fn stat_data_is_36_bytes() {
        assert_eq!(std::mem::size_of::<StatData>(), STAT_DATA_SIZE);
    }

    #[test]
    fn roundtrip_through_body_bytes() {
        let sd = StatData::new(0o644, 2, 8192);
        let body = sd.as_bytes();
        let parsed = StatData::from_body(body).unwrap();
        assert_eq!(parsed.mode(), 0o644);
        assert_eq!(parsed.nlink(), 2);
        assert_eq!(parsed.size(), 8192);
    }

    #[test]
    fn single_unit_semantics() {
        let sd = StatData::new(0o600, 1, 0);
        let key = Key::build(2, KeyType::StatData, 41, 0);
        let view = ItemView {
            key,
            body: sd.as_bytes(),
        };
        assert_eq!(StatDataItem.nr_units(view), 1);
        assert_eq!(StatDataItem.unit_key(view, 0), key);
        assert_eq!(StatDataItem.max_key_inside(view), Some(key));
    }
}
