//! Internal tree-pointer items: one child block number per item, living
//! only on internal levels. The item's key is the left delimiting key of
//! the child it points to.

use eyre::{bail, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::key::Key;
use crate::node::internal_levels;
use crate::tree::NodeId;

use super::{
    CutUnitsOut, ItemPlugin, ItemType, ItemView, ItemViewMut, ShiftDir, ShiftFit,
};

pub const NODE_POINTER_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodePointer {
    child: U64,
}

const _: () = assert!(std::mem::size_of::<NodePointer>() == NODE_POINTER_SIZE);

impl NodePointer {
    pub fn new(child: NodeId) -> NodePointer {
        NodePointer {
            child: U64::new(child.0),
        }
    }

    pub fn from_body(body: &[u8]) -> Result<&NodePointer> {
        NodePointer::ref_from_bytes(body)
            .map_err(|e| eyre::eyre!("malformed node pointer body: {:?}", e))
    }

    pub fn child(&self) -> NodeId {
        NodeId(self.child.get())
    }
}

pub struct NodePointerItem;

impl ItemPlugin for NodePointerItem {
    fn item_type(&self) -> ItemType {
        ItemType::NodePointer
    }

    fn name(&self) -> &'static str {
        "node-pointer"
    }

    fn allowed_on_level(&self, level: u8) -> bool {
        internal_levels(level)
    }

    fn nr_units(&self, _item: ItemView<'_>) -> usize {
        1
    }

    fn unit_key(&self, item: ItemView<'_>, _unit: usize) -> Key {
        item.key
    }

    fn cut_units(
        &self,
        _item: ItemViewMut<'_>,
        _from: usize,
        _to: usize,
        _out: &mut CutUnitsOut,
    ) -> Result<usize> {
        bail!("node pointers have no cuttable units");
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
        bail!("node pointers cannot be copied by units");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn child_roundtrip() {
        let ptr = NodePointer::new(NodeId(0xdead_beef));
        let parsed = NodePointer::from_body(ptr.as_bytes()).unwrap();
        assert_eq!(parsed.child(), NodeId(0xdead_beef));
    }

    #[test]
    fn only_on_internal_levels() {
        assert!(!NodePointerItem.allowed_on_level(0));
        assert!(NodePointerItem.allowed_on_level(1));
        assert!(NodePointerItem.allowed_on_level(4));
    }
}
