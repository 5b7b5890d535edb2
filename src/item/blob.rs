//! Opaque fixed-blob items: a payload the tree stores but never
//! interprets, with no unit structure at all.

use eyre::{bail, Result};

use crate::key::Key;
use crate::node::leaf_only;

use super::{
    CutUnitsOut, ItemPlugin, ItemType, ItemView, ItemViewMut, ShiftDir, ShiftFit,
};

pub struct BlobItem;

impl ItemPlugin for BlobItem {
    fn item_type(&self) -> ItemType {
        ItemType::Blob
    }

    fn name(&self) -> &'static str {
        "blob"
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
        bail!("blobs have no cuttable units");
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
        bail!("blobs cannot be copied by units");
    }
}
