//! B-tree header nodes for the Catalog, Extents Overflow, and Attributes
//! system files.
//!
//! A freshly formatted tree holds zero leaf records but must still be
//! traversable: node 0 carries the node descriptor, the 106-byte header
//! record, a 128-byte user-data record, and a map record whose bits track
//! node allocation, with the record-offset table at the node's tail.

use crate::codec::{Buf, BufMut};
use crate::error::{Result, VolumeError};

pub const NODE_DESCRIPTOR_SIZE: usize = 14;
pub const HEADER_RECORD_SIZE: usize = 106;
pub const USER_DATA_RECORD_SIZE: usize = 128;

/// Node kinds stored in the descriptor's `kind` byte.
pub const NODE_KIND_LEAF: i8 = -1;
pub const NODE_KIND_INDEX: i8 = 0;
pub const NODE_KIND_HEADER: i8 = 1;
pub const NODE_KIND_MAP: i8 = 2;

// Header-record attribute masks.
pub const BT_BIG_KEYS: u32 = 0x0000_0002;
pub const BT_VARIABLE_INDEX_KEYS: u32 = 0x0000_0004;

/// Key-comparison byte for the HFS+ catalog (case-insensitive folding).
const KEY_COMPARE_CASE_FOLDING: u8 = 0xCF;

/// Which system tree a header node belongs to. Node size and maximum key
/// length are format- and file-specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKind {
    HfsCatalog,
    HfsExtents,
    PlusCatalog,
    PlusExtents,
    PlusAttributes,
}

impl TreeKind {
    pub fn node_size(&self) -> u16 {
        match self {
            TreeKind::HfsCatalog | TreeKind::HfsExtents => 512,
            TreeKind::PlusCatalog | TreeKind::PlusExtents | TreeKind::PlusAttributes => 4096,
        }
    }

    pub fn max_key_length(&self) -> u16 {
        match self {
            TreeKind::HfsCatalog => 37,
            TreeKind::HfsExtents => 7,
            TreeKind::PlusCatalog => 516,
            TreeKind::PlusExtents => 10,
            TreeKind::PlusAttributes => 266,
        }
    }

    fn attributes(&self) -> u32 {
        match self {
            TreeKind::HfsCatalog | TreeKind::HfsExtents => 0,
            TreeKind::PlusCatalog | TreeKind::PlusAttributes => {
                BT_BIG_KEYS | BT_VARIABLE_INDEX_KEYS
            }
            TreeKind::PlusExtents => BT_BIG_KEYS,
        }
    }

    fn key_compare_type(&self) -> u8 {
        match self {
            TreeKind::PlusCatalog => KEY_COMPARE_CASE_FOLDING,
            _ => 0,
        }
    }
}

/// Parsed B-tree header record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeHeader {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub clump_size: u32,
    pub attributes: u32,
}

/// Build the header node for an empty tree spanning `total_nodes` nodes.
///
/// The returned buffer is exactly one node long; the remaining nodes of the
/// tree file are left zeroed on disk, which the map record records as free.
pub fn build_header_node(kind: TreeKind, total_nodes: u32, clump_size: u32) -> Result<Vec<u8>> {
    let node_size = kind.node_size() as usize;
    if total_nodes == 0 {
        return Err(VolumeError::InvalidVolume(
            "a B-tree needs at least its header node".into(),
        ));
    }
    let map_record_len = node_size - NODE_DESCRIPTOR_SIZE - HEADER_RECORD_SIZE
        - USER_DATA_RECORD_SIZE
        - 8; // four u16 record offsets at the tail
    if total_nodes as usize > map_record_len * 8 {
        return Err(VolumeError::InvalidVolume(format!(
            "{total_nodes} nodes exceed the {}-bit header map record",
            map_record_len * 8
        )));
    }

    let mut node = vec![0u8; node_size];
    let mut buf = BufMut::new(&mut node);

    // Node descriptor: no siblings, header kind, three records.
    buf.put_u32(0, 0)?;
    buf.put_u32(4, 0)?;
    buf.put_u8(8, NODE_KIND_HEADER as u8)?;
    buf.put_u8(9, 0)?;
    buf.put_u16(10, 3)?;
    buf.put_u16(12, 0)?;

    // Header record: an empty tree has depth 0 and no root or leaves.
    let h = NODE_DESCRIPTOR_SIZE;
    buf.put_u16(h, 0)?; // treeDepth
    buf.put_u32(h + 2, 0)?; // rootNode
    buf.put_u32(h + 6, 0)?; // leafRecords
    buf.put_u32(h + 10, 0)?; // firstLeafNode
    buf.put_u32(h + 14, 0)?; // lastLeafNode
    buf.put_u16(h + 18, kind.node_size())?;
    buf.put_u16(h + 20, kind.max_key_length())?;
    buf.put_u32(h + 22, total_nodes)?;
    buf.put_u32(h + 26, total_nodes - 1)?; // freeNodes: all but the header
    buf.put_u16(h + 30, 0)?; // reserved
    buf.put_u32(h + 32, clump_size)?;
    buf.put_u8(h + 36, 0)?; // btreeType: control file
    buf.put_u8(h + 37, kind.key_compare_type())?;
    buf.put_u32(h + 38, kind.attributes())?;
    // 64 reserved bytes follow, already zero.

    // User-data record (128 bytes) stays zero.

    // Map record: only the header node itself is allocated.
    let map_start = h + HEADER_RECORD_SIZE + USER_DATA_RECORD_SIZE;
    buf.put_u8(map_start, 0x80)?;

    // Record offsets, stored from the node's end backward.
    buf.put_u16(node_size - 2, NODE_DESCRIPTOR_SIZE as u16)?;
    buf.put_u16(node_size - 4, (h + HEADER_RECORD_SIZE) as u16)?;
    buf.put_u16(node_size - 6, map_start as u16)?;
    buf.put_u16(node_size - 8, (map_start + map_record_len) as u16)?;

    Ok(node)
}

/// Parse and sanity-check the header node of a tree file.
pub fn parse_header_node(data: &[u8]) -> Result<BTreeHeader> {
    let buf = Buf::new(data);
    let kind = buf.get_u8(8)? as i8;
    if kind != NODE_KIND_HEADER {
        return Err(VolumeError::InvalidVolume(format!(
            "tree node 0 has kind {kind}, expected header"
        )));
    }
    let num_records = buf.get_u16(10)?;
    if num_records != 3 {
        return Err(VolumeError::InvalidVolume(format!(
            "header node holds {num_records} records, expected 3"
        )));
    }

    let h = NODE_DESCRIPTOR_SIZE;
    let node_size = buf.get_u16(h + 18)?;
    if node_size < 512 || !node_size.is_power_of_two() {
        return Err(VolumeError::InvalidVolume(format!(
            "B-tree node size {node_size} invalid"
        )));
    }
    let total_nodes = buf.get_u32(h + 22)?;
    let free_nodes = buf.get_u32(h + 26)?;
    if free_nodes >= total_nodes {
        return Err(VolumeError::InvalidVolume(format!(
            "B-tree reports {free_nodes} free of {total_nodes} total nodes"
        )));
    }

    Ok(BTreeHeader {
        tree_depth: buf.get_u16(h)?,
        root_node: buf.get_u32(h + 2)?,
        leaf_records: buf.get_u32(h + 6)?,
        first_leaf_node: buf.get_u32(h + 10)?,
        last_leaf_node: buf.get_u32(h + 14)?,
        node_size,
        max_key_length: buf.get_u16(h + 20)?,
        total_nodes,
        free_nodes,
        clump_size: buf.get_u32(h + 32)?,
        attributes: buf.get_u32(h + 38)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse_round_trip() {
        for kind in [
            TreeKind::HfsCatalog,
            TreeKind::HfsExtents,
            TreeKind::PlusCatalog,
            TreeKind::PlusExtents,
            TreeKind::PlusAttributes,
        ] {
            let node = build_header_node(kind, 8, 32768).unwrap();
            assert_eq!(node.len(), kind.node_size() as usize);

            let header = parse_header_node(&node).unwrap();
            assert_eq!(header.node_size, kind.node_size());
            assert_eq!(header.max_key_length, kind.max_key_length());
            assert_eq!(header.total_nodes, 8);
            assert_eq!(header.free_nodes, 7);
            assert_eq!(header.leaf_records, 0);
            assert_eq!(header.root_node, 0);
            assert_eq!(header.tree_depth, 0);
        }
    }

    #[test]
    fn test_map_record_marks_header_node_only() {
        let node = build_header_node(TreeKind::PlusCatalog, 8, 32768).unwrap();
        let map_start = NODE_DESCRIPTOR_SIZE + HEADER_RECORD_SIZE + USER_DATA_RECORD_SIZE;
        assert_eq!(node[map_start], 0x80);
        assert!(node[map_start + 1..4096 - 8].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_record_offsets_at_tail() {
        let node = build_header_node(TreeKind::HfsCatalog, 4, 2048).unwrap();
        let off = |i: usize| u16::from_be_bytes([node[512 - 2 * i - 2], node[512 - 2 * i - 1]]);
        assert_eq!(off(0), 14);
        assert_eq!(off(1), 120);
        assert_eq!(off(2), 248);
        assert_eq!(off(3), 504); // free-space offset
    }

    #[test]
    fn test_zero_nodes_rejected() {
        assert!(build_header_node(TreeKind::PlusExtents, 0, 4096).is_err());
    }

    #[test]
    fn test_non_header_node_rejected() {
        let mut node = build_header_node(TreeKind::PlusCatalog, 8, 32768).unwrap();
        node[8] = NODE_KIND_LEAF as u8;
        assert!(parse_header_node(&node).is_err());
    }
}
