use core::{ops::Range, str};

use crate::{
    fdt::{FdtError, FdtHeader, FdtNodeType},
    node::{DeviceTree, Node, NodeType},
    prop::{Property, decode_u32},
};
use alloc::{string::String, vec, vec::Vec};
use utils::{
    endian::{be32_at, be64_at},
    num::AlignableTo,
};

const BEGIN_NODE: u32 = FdtNodeType::FDT_BEGIN_NODE.bits();
const END_NODE: u32 = FdtNodeType::FDT_END_NODE.bits();
const PROP: u32 = FdtNodeType::FDT_PROP.bits();
const NOP: u32 = FdtNodeType::FDT_NOP.bits();
const END: u32 = FdtNodeType::FDT_END.bits();

/// Read-only view over a flattened device tree blob.
///
/// Nodes are addressed by their offset inside the structure block; the root node is at offset 0.
/// The blob is validated once in [Fdt::new], after which the navigation helpers return [None]
/// for offsets that do not point at a node instead of failing.
#[derive(Debug, Clone, Copy)]
pub struct Fdt<'a> {
    blob: &'a [u8],
    header: FdtHeader,
}

/// Basic Reader Functions
impl<'a> Fdt<'a> {
    /// The structure block.
    #[inline(always)]
    fn structs(&self) -> &'a [u8] {
        let st = self.header.off_dt_struct as usize;
        &self.blob[st..st + self.header.size_dt_struct as usize]
    }

    /// The strings block.
    #[inline(always)]
    fn strings(&self) -> &'a [u8] {
        let st = self.header.off_dt_strings as usize;
        &self.blob[st..st + self.header.size_dt_strings as usize]
    }

    /// Read a 32-bit big-endian word of the structure block.
    #[inline(always)]
    fn word(&self, offset: usize) -> Option<u32> {
        be32_at(self.structs(), offset)
    }

    /// Read a NUL-terminated string starting at `offset` of `block`.
    fn cstr_at(block: &'a [u8], offset: usize) -> Option<&'a str> {
        let tail = block.get(offset..)?;
        let len = tail.iter().position(|b| *b == 0)?;
        str::from_utf8(&tail[..len]).ok()
    }

    /// Decode the token at `offset` and return it with the offset of the token that follows.
    fn next_tag(&self, offset: usize) -> Result<(u32, usize), FdtError> {
        let tag = self.word(offset).ok_or(FdtError::Truncated)?;
        let mut next = offset + 4;
        match tag {
            BEGIN_NODE => {
                let name = Self::cstr_at(self.structs(), next)
                    .ok_or(FdtError::BadString { cursor: next })?;
                next = (next + name.len() + 1).align_up(4);
            }
            PROP => {
                let len = self.word(next).ok_or(FdtError::Truncated)? as usize;
                next = (next + 8 + len).align_up(4);
            }
            END_NODE | NOP | END => {}
            _ => {
                return Err(FdtError::InvalidNodeType {
                    node_type: tag as usize,
                    cursor: offset,
                });
            }
        }
        if next > self.structs().len() {
            return Err(FdtError::Truncated);
        }
        Ok((tag, next))
    }

    /// Verify `offset` points at a node and return the offset just past its name.
    fn check_node(&self, offset: usize) -> Option<usize> {
        if !offset.is_aligned(4) {
            return None;
        }
        match self.next_tag(offset) {
            Ok((BEGIN_NODE, next)) => Some(next),
            _ => None,
        }
    }
}

impl<'a> Fdt<'a> {
    /// Expected FDT magic number (0xd00dfeed).
    pub const FDT_MAGIC: u32 = 0xd00dfeed;
    /// The FDT version this parser targets.
    pub const FDT_VERSION: u32 = 17;
    /// The last compatible FDT version accepted by this parser.
    pub const LAST_COMP_VERSION: u32 = 16;

    /// Wrap and validate a blob.
    pub fn new(blob: &'a [u8]) -> Result<Fdt<'a>, FdtError> {
        let header = FdtHeader::parse(blob)?;
        let fdt = Fdt { blob, header };
        if let Err(err) = fdt.validate() {
            log::warn!("Rejecting device tree blob: {}", err);
            return Err(err);
        }
        Ok(fdt)
    }

    /// Wrap a blob that already passed [Fdt::new], checking only the header and block bounds.
    pub fn new_unchecked(blob: &'a [u8]) -> Result<Fdt<'a>, FdtError> {
        let header = FdtHeader::parse(blob)?;
        let fdt = Fdt { blob, header };
        fdt.check_header()?;
        Ok(fdt)
    }

    pub fn header(&self) -> &FdtHeader {
        &self.header
    }

    /// The bytes of the blob, trimmed to `totalsize`.
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.blob[..self.header.totalsize as usize]
    }

    /// Validate the FDT header (magic number and compatible version range),
    /// the block bounds and the nesting of the structure block.
    pub fn validate(&self) -> Result<(), FdtError> {
        self.check_header()?;
        self.check_structure()
    }

    fn check_header(&self) -> Result<(), FdtError> {
        let header = &self.header;

        // 1. Check the magic number
        if header.magic != Self::FDT_MAGIC {
            return Err(FdtError::InvalidMagic {
                magic: header.magic as usize,
            });
        }

        // 2. Check the fdt version. We use version 17, and the last compatible version is 16
        if header.version < Self::LAST_COMP_VERSION
            || header.last_comp_version > Self::FDT_VERSION
        {
            return Err(FdtError::IncompatibleVersion {
                version: header.version as usize,
            });
        }

        // 3. Every block must lie inside the blob
        let total = header.totalsize as usize;
        let struct_end = header.off_dt_struct as usize + header.size_dt_struct as usize;
        let strings_end = header.off_dt_strings as usize + header.size_dt_strings as usize;
        if total > self.blob.len()
            || total < FdtHeader::SIZE
            || struct_end > total
            || strings_end > total
            || header.off_mem_rsvmap as usize + 16 > total
        {
            return Err(FdtError::Truncated);
        }

        // 4. No reservation may wrap around the address space
        let mut off = header.off_mem_rsvmap as usize;
        while let (Some(addr), Some(size)) = (be64_at(self.blob, off), be64_at(self.blob, off + 8)) {
            if addr == 0 && size == 0 {
                break;
            }
            if addr.checked_add(size).is_none() {
                return Err(FdtError::BadReservation { cursor: off });
            }
            off += 16;
        }
        Ok(())
    }

    fn check_structure(&self) -> Result<(), FdtError> {
        // 5. Walk the structure block once: it must start with the root and nest properly
        let mut depth = 0usize;
        let mut offset = 0;
        loop {
            let (tag, next) = self.next_tag(offset)?;
            if offset == 0 && tag != BEGIN_NODE {
                return Err(FdtError::BadStructure { cursor: offset });
            }
            match tag {
                BEGIN_NODE => depth += 1,
                END_NODE => {
                    if depth == 0 {
                        return Err(FdtError::BadStructure { cursor: offset });
                    }
                    depth -= 1;
                }
                PROP => {
                    if depth == 0 {
                        return Err(FdtError::BadStructure { cursor: offset });
                    }
                    let nameoff = self.word(offset + 8).ok_or(FdtError::Truncated)? as usize;
                    Self::cstr_at(self.strings(), nameoff)
                        .ok_or(FdtError::BadString { cursor: offset })?;
                }
                END => break,
                _ => {}
            }
            offset = next;
        }
        if depth != 0 {
            return Err(FdtError::BadStructure { cursor: offset });
        }
        Ok(())
    }

    /// Offset of the root node.
    pub const fn root(&self) -> usize {
        0
    }

    /// Step to the next node in document order, tracking the nesting `depth`.
    ///
    /// The node at `offset` counts as depth 0 on entry; entering a child increments `depth`,
    /// leaving a node decrements it. Returns [None] at the end of the tree, or when leaving
    /// the node `depth` was relative to.
    pub fn next_node(&self, offset: usize, depth: &mut i32) -> Option<usize> {
        let mut next = self.check_node(offset)?;
        loop {
            let cur = next;
            let (tag, after) = self.next_tag(cur).ok()?;
            next = after;
            match tag {
                BEGIN_NODE => {
                    *depth += 1;
                    return Some(cur);
                }
                END_NODE => {
                    *depth -= 1;
                    if *depth < 0 {
                        return None;
                    }
                }
                END => return None,
                _ => {}
            }
        }
    }

    pub fn first_subnode(&self, offset: usize) -> Option<usize> {
        let mut depth = 0;
        let child = self.next_node(offset, &mut depth)?;
        if depth == 1 { Some(child) } else { None }
    }

    pub fn next_subnode(&self, offset: usize) -> Option<usize> {
        let mut depth = 1;
        let mut offset = offset;
        loop {
            offset = self.next_node(offset, &mut depth)?;
            if depth < 1 {
                return None;
            }
            if depth == 1 {
                return Some(offset);
            }
        }
    }

    /// Child nodes of `offset`, in document order.
    pub fn subnodes(&self, offset: usize) -> SubnodeIter<'a> {
        SubnodeIter {
            fdt: *self,
            next: self.first_subnode(offset),
        }
    }

    /// Full name of the node at `offset`, including any unit address. The root is named "".
    pub fn get_name(&self, offset: usize) -> Option<&'a str> {
        self.check_node(offset)?;
        Self::cstr_at(self.structs(), offset + 4)
    }

    /// Properties of the node at `offset`, in blob order.
    pub fn properties(&self, offset: usize) -> PropIter<'a> {
        PropIter {
            fdt: *self,
            cursor: self.check_node(offset),
        }
    }

    /// Payload of the property `name` of node `offset`.
    pub fn getprop(&self, offset: usize, name: &str) -> Option<&'a [u8]> {
        self.properties(offset)
            .find(|(prop_name, _)| *prop_name == name)
            .map(|(_, data)| data)
    }

    /// Find a direct child by full name, or by base name when `name` carries no unit address.
    pub fn subnode_offset(&self, parent: usize, name: &str) -> Option<usize> {
        self.subnodes(parent).find(|child| {
            self.get_name(*child)
                .is_some_and(|child_name| name_matches(child_name, name))
        })
    }

    /// Resolve an absolute path such as `/soc/serial@1000`.
    pub fn path_offset(&self, path: &str) -> Option<usize> {
        if !path.starts_with('/') {
            return None;
        }
        let mut node = self.root();
        for section in path.split('/') {
            if section.is_empty() {
                continue;
            }
            node = self.subnode_offset(node, section)?;
        }
        Some(node)
    }

    /// Every node of the tree in document order, with its depth below the root.
    pub fn nodes(&self) -> NodeIter<'a> {
        NodeIter {
            fdt: *self,
            next: Some(self.root()),
            depth: 0,
        }
    }

    pub fn parent_offset(&self, offset: usize) -> Option<usize> {
        self.check_node(offset)?;
        let mut stack: Vec<usize> = Vec::new();
        for (node, depth) in self.nodes() {
            stack.truncate(depth);
            if node == offset {
                return stack.last().copied();
            }
            stack.push(node);
        }
        None
    }

    pub fn get_phandle(&self, offset: usize) -> Option<u32> {
        self.getprop(offset, "phandle")
            .or_else(|| self.getprop(offset, "linux,phandle"))
            .and_then(|data| decode_u32(data).ok())
    }

    pub fn node_offset_by_phandle(&self, phandle: u32) -> Option<usize> {
        if phandle == 0 || phandle == u32::MAX {
            return None;
        }
        self.nodes()
            .map(|(node, _)| node)
            .find(|node| self.get_phandle(*node) == Some(phandle))
    }

    pub fn get_path(&self, offset: usize) -> Option<String> {
        let mut chain = vec![offset];
        let mut cur = offset;
        while let Some(parent) = self.parent_offset(cur) {
            chain.push(parent);
            cur = parent;
        }
        if cur != self.root() {
            return None;
        }
        if chain.len() == 1 {
            return Some(String::from("/"));
        }
        let mut path = String::new();
        for node in chain.iter().rev().skip(1) {
            path.push('/');
            path.push_str(self.get_name(*node)?);
        }
        Some(path)
    }

    /// Get the memory reservation map.
    ///
    /// **The reserved memory blocks are not promised to be non-overlapping**
    pub fn mem_rsv_map(&self) -> Vec<Range<u64>> {
        let mut res = Vec::new();
        let mut off = self.header.off_mem_rsvmap as usize;
        while let (Some(addr), Some(size)) = (be64_at(self.blob, off), be64_at(self.blob, off + 8)) {
            if addr == 0 && size == 0 {
                break;
            }
            res.push(addr..addr.saturating_add(size));
            off += 16;
        }
        res
    }

    fn unflatten_node(
        &self,
        offset: usize,
        parent_id: usize,
        nodes: &mut Vec<Node>,
    ) -> Result<usize, FdtError> {
        let full_name = self
            .get_name(offset)
            .ok_or(FdtError::BadStructure { cursor: offset })?;
        let id = nodes.len();
        let props = self
            .properties(offset)
            .map(|(name, data)| Property::new(name, data))
            .collect();
        nodes.push(Node::new(id, parent_id, full_name, props));
        let mut child = self.first_subnode(offset);
        while let Some(child_off) = child {
            let child_id = self.unflatten_node(child_off, id, nodes)?;
            nodes[id].children.push(child_id);
            child = self.next_subnode(child_off);
        }
        Ok(id)
    }

    /// Copy the whole blob into a linked [DeviceTree].
    ///
    /// Node indices follow document order, so the root is node 0.
    /// All strings and byte-array data are **copied**, and the blob can be discarded afterwards.
    pub fn unflatten(&self) -> Result<DeviceTree, FdtError> {
        let mut nodes = Vec::new();
        let root_id = self.unflatten_node(self.root(), 0, &mut nodes)?;
        let mut tree = DeviceTree::from_nodes(root_id, nodes, self.mem_rsv_map());
        for path in ["/aliases", "/chosen", "/reserved-memory"] {
            if let Some(node) = tree.get_node_mut(path) {
                node.node_type = NodeType::Description;
            }
        }
        tree.get_nodes_mut("/memory", |node| {
            node.node_type = NodeType::Description;
        });
        Ok(tree)
    }
}

/// Whether the node name `full` is addressed by `wanted`.
///
/// A name without a unit address matches any unit address of the same base name.
pub fn name_matches(full: &str, wanted: &str) -> bool {
    if full == wanted {
        return true;
    }
    !wanted.contains('@') && full.split('@').next() == Some(wanted)
}

pub struct SubnodeIter<'a> {
    fdt: Fdt<'a>,
    next: Option<usize>,
}

impl Iterator for SubnodeIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let cur = self.next?;
        self.next = self.fdt.next_subnode(cur);
        Some(cur)
    }
}

/// Depth-first walk over every node, yielding `(offset, depth)`.
pub struct NodeIter<'a> {
    fdt: Fdt<'a>,
    next: Option<usize>,
    depth: i32,
}

impl Iterator for NodeIter<'_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        let cur = self.next?;
        let depth = self.depth;
        self.next = self.fdt.next_node(cur, &mut self.depth);
        Some((cur, depth as usize))
    }
}

pub struct PropIter<'a> {
    fdt: Fdt<'a>,
    cursor: Option<usize>,
}

impl<'a> Iterator for PropIter<'a> {
    type Item = (&'a str, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let cur = self.cursor?;
            let (tag, next) = self.fdt.next_tag(cur).ok()?;
            match tag {
                NOP => self.cursor = Some(next),
                PROP => {
                    self.cursor = Some(next);
                    let len = self.fdt.word(cur + 4)? as usize;
                    let nameoff = self.fdt.word(cur + 8)? as usize;
                    let name = Fdt::cstr_at(self.fdt.strings(), nameoff)?;
                    let data = self.fdt.structs().get(cur + 12..cur + 12 + len)?;
                    return Some((name, data));
                }
                _ => {
                    self.cursor = None;
                    return None;
                }
            }
        }
    }
}
