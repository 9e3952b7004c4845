//! Representation-agnostic device-tree node references.
//!
//! A [NodeRef] names one node of one tree, either by structure-block offset in a flat blob or
//! by index in a linked [DeviceTree]. The tree id lives in bits 28..31 of the value so several
//! trees can be addressed through the same type; any negative value is "no node".
//!
//! [OfTrees] owns every registered tree, all in the same representation. [OfNode] pairs a
//! reference with the trees it points into and provides the property accessors. Both
//! representations decode payloads through [dt::prop], so a property reads back the same
//! whichever one is active.

use ::config::OFNODE_MULTI_TREE_MAX;
use alloc::{boxed::Box, string::String, vec, vec::Vec};
use core::fmt;
use dt::{
    fdt::{Fdt, reader::name_matches},
    node::DeviceTree,
    prop::{self, PropertyError},
};

use crate::error::DmError;

/// Number of low bits holding the offset or index.
pub const OFTREE_OFFSET_BITS: u32 = 28;
const OFTREE_OFFSET_MASK: i32 = (1 << OFTREE_OFFSET_BITS) - 1;
/// Trees addressable with the bits left above the offset (the sign bit marks null).
pub const OFTREE_MAX_TREES: usize = 8;

/// Properties that mark a node as needed before relocation.
const PRE_RELOC_PROPS: &[&str] = &[
    "bootph-all",
    "bootph-pre-ram",
    "u-boot,dm-pre-reloc",
    "u-boot,dm-pre-proper",
    "u-boot,dm-spl",
    "u-boot,dm-tpl",
];

#[derive(Clone, Copy)]
pub enum NodeRef {
    /// Offset into the structure block of a flat blob.
    Flat(i32),
    /// Index into the node container of a linked tree.
    Live(i32),
}

impl NodeRef {
    pub const fn null() -> NodeRef {
        NodeRef::Flat(-1)
    }

    fn encode(tree: u32, pos: usize) -> Option<i32> {
        if tree as usize >= OFTREE_MAX_TREES || pos > OFTREE_OFFSET_MASK as usize {
            return None;
        }
        Some(((tree << OFTREE_OFFSET_BITS) | pos as u32) as i32)
    }

    /// Reference to the node at `offset` of flat tree `tree`; null when out of range.
    pub fn from_offset(tree: u32, offset: usize) -> NodeRef {
        NodeRef::encode(tree, offset).map_or(NodeRef::null(), NodeRef::Flat)
    }

    /// Reference to node `index` of live tree `tree`; null when out of range.
    pub fn from_index(tree: u32, index: usize) -> NodeRef {
        NodeRef::encode(tree, index).map_or(NodeRef::null(), NodeRef::Live)
    }

    fn raw(self) -> i32 {
        match self {
            NodeRef::Flat(raw) | NodeRef::Live(raw) => raw,
        }
    }

    pub fn is_null(self) -> bool {
        self.raw() < 0
    }

    pub fn is_live(self) -> bool {
        matches!(self, NodeRef::Live(_))
    }

    pub fn tree_id(self) -> Option<u32> {
        (!self.is_null()).then(|| (self.raw() >> OFTREE_OFFSET_BITS) as u32)
    }

    /// Offset (flat) or index (live) inside the tree.
    pub fn position(self) -> Option<usize> {
        (!self.is_null()).then(|| (self.raw() & OFTREE_OFFSET_MASK) as usize)
    }

    /// Another node of the same tree and representation.
    fn sibling_ref(self, pos: usize) -> NodeRef {
        let tree = self.tree_id().unwrap_or(0);
        match self {
            NodeRef::Flat(_) => NodeRef::from_offset(tree, pos),
            NodeRef::Live(_) => NodeRef::from_index(tree, pos),
        }
    }
}

impl Default for NodeRef {
    fn default() -> Self {
        NodeRef::null()
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        if self.is_null() || other.is_null() {
            return self.is_null() && other.is_null();
        }
        match (self, other) {
            (NodeRef::Flat(a), NodeRef::Flat(b)) | (NodeRef::Live(a), NodeRef::Live(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for NodeRef {}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tree_id(), self.position()) {
            (Some(tree), Some(pos)) if self.is_live() => write!(f, "Live({}:{})", tree, pos),
            (Some(tree), Some(pos)) => write!(f, "Flat({}:{:#x})", tree, pos),
            _ => f.write_str("NodeRef(null)"),
        }
    }
}

/// Decoding of a property payload into a Rust value.
pub trait FromProp<'a>: Sized {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError>;
}

impl<'a> FromProp<'a> for u32 {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError> {
        prop::decode_u32(data)
    }
}

impl<'a> FromProp<'a> for i32 {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError> {
        prop::decode_u32(data).map(|v| v as i32)
    }
}

impl<'a> FromProp<'a> for u64 {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError> {
        prop::decode_u64(data)
    }
}

impl<'a> FromProp<'a> for &'a str {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError> {
        prop::decode_str(data)
    }
}

impl<'a> FromProp<'a> for &'a [u8] {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError> {
        Ok(data)
    }
}

impl<'a> FromProp<'a> for Vec<&'a str> {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError> {
        prop::decode_strlist(data)
    }
}

impl<'a> FromProp<'a> for Vec<u32> {
    fn from_prop(data: &'a [u8]) -> Result<Self, PropertyError> {
        prop::decode_u32_array(data)
    }
}

/// The registered device trees. Tree 0 is the control tree.
#[derive(Debug, Clone)]
pub enum OfTrees {
    Flat(Vec<Box<[u8]>>),
    Live(Vec<DeviceTree>),
}

impl Default for OfTrees {
    fn default() -> Self {
        OfTrees::Flat(Vec::new())
    }
}

#[derive(Clone, Copy)]
enum Backend<'a> {
    Flat(Fdt<'a>, usize),
    Live(&'a DeviceTree, usize),
}

impl OfTrees {
    /// Trees holding `blob` as the control tree.
    pub fn from_blob(blob: &[u8]) -> Result<OfTrees, DmError> {
        let mut trees = OfTrees::default();
        trees.add_flat(blob)?;
        Ok(trees)
    }

    pub fn from_live(tree: DeviceTree) -> OfTrees {
        OfTrees::Live(vec![tree])
    }

    pub fn is_live(&self) -> bool {
        matches!(self, OfTrees::Live(_))
    }

    pub fn tree_count(&self) -> usize {
        match self {
            OfTrees::Flat(blobs) => blobs.len(),
            OfTrees::Live(trees) => trees.len(),
        }
    }

    fn limit() -> usize {
        OFNODE_MULTI_TREE_MAX.clamp(1, OFTREE_MAX_TREES)
    }

    /// Register another blob and return its tree id.
    ///
    /// When the live representation is active the blob is unflattened first.
    pub fn add_flat(&mut self, blob: &[u8]) -> Result<u32, DmError> {
        let fdt = Fdt::new(blob)?;
        let id = self.tree_count();
        if id >= Self::limit() {
            log::warn!("Too many registered device trees (max {}).", Self::limit());
            return Err(DmError::TooManyTrees);
        }
        match self {
            OfTrees::Flat(blobs) => blobs.push(Box::from(fdt.as_bytes())),
            OfTrees::Live(trees) => trees.push(fdt.unflatten()?),
        }
        Ok(id as u32)
    }

    /// Register a linked tree and return its tree id.
    ///
    /// A set that already holds flat blobs cannot take live trees.
    pub fn add_live(&mut self, tree: DeviceTree) -> Result<u32, DmError> {
        let id = self.tree_count();
        if id >= Self::limit() {
            return Err(DmError::TooManyTrees);
        }
        match self {
            OfTrees::Live(trees) => trees.push(tree),
            OfTrees::Flat(blobs) if !blobs.is_empty() => return Err(DmError::NotSupported),
            OfTrees::Flat(_) => *self = OfTrees::Live(vec![tree]),
        }
        Ok(id as u32)
    }

    /// The same trees in the live representation.
    pub fn unflatten(&self) -> Result<OfTrees, DmError> {
        match self {
            OfTrees::Flat(blobs) => {
                let mut trees = Vec::with_capacity(blobs.len());
                for blob in blobs {
                    trees.push(Fdt::new_unchecked(blob)?.unflatten()?);
                }
                Ok(OfTrees::Live(trees))
            }
            OfTrees::Live(_) => Ok(self.clone()),
        }
    }

    fn fdt(&self, tree: usize) -> Option<Fdt<'_>> {
        match self {
            OfTrees::Flat(blobs) => Fdt::new_unchecked(blobs.get(tree)?).ok(),
            OfTrees::Live(_) => None,
        }
    }

    fn resolve(&self, node: NodeRef) -> Option<Backend<'_>> {
        let tree = node.tree_id()? as usize;
        let pos = node.position()?;
        match (self, node) {
            (OfTrees::Flat(_), NodeRef::Flat(_)) => {
                let fdt = self.fdt(tree)?;
                fdt.get_name(pos)?;
                Some(Backend::Flat(fdt, pos))
            }
            (OfTrees::Live(trees), NodeRef::Live(_)) => {
                let t = trees.get(tree)?;
                (pos < t.container.len()).then_some(Backend::Live(t, pos))
            }
            _ => None,
        }
    }

    /// View of `node` in these trees.
    pub fn node(&self, node: NodeRef) -> OfNode<'_> {
        OfNode { trees: self, node }
    }

    fn wrap(&self, tree: u32, pos: Option<usize>) -> OfNode<'_> {
        let node = match (self, pos) {
            (_, None) => NodeRef::null(),
            (OfTrees::Flat(_), Some(pos)) => NodeRef::from_offset(tree, pos),
            (OfTrees::Live(_), Some(pos)) => NodeRef::from_index(tree, pos),
        };
        self.node(node)
    }

    pub fn root(&self) -> OfNode<'_> {
        self.tree_root(0)
    }

    pub fn tree_root(&self, tree: u32) -> OfNode<'_> {
        let pos = match self {
            OfTrees::Flat(_) => self.fdt(tree as usize).map(|fdt| fdt.root()),
            OfTrees::Live(trees) => trees.get(tree as usize).map(|t| t.root_id),
        };
        self.wrap(tree, pos)
    }

    /// Look up a node of the control tree by absolute path, or by a path starting with an alias.
    pub fn path(&self, path: &str) -> OfNode<'_> {
        if path.starts_with('/') {
            return self.path_in(0, path);
        }
        let (alias, rest) = path.split_once('/').unwrap_or((path, ""));
        let Ok(target) = self.aliases_node().read_string(alias) else {
            return self.node(NodeRef::null());
        };
        let mut node = self.path_in(0, target);
        for section in rest.split('/').filter(|s| !s.is_empty()) {
            node = node.find_subnode(section);
        }
        node
    }

    pub fn path_in(&self, tree: u32, path: &str) -> OfNode<'_> {
        let pos = match self {
            OfTrees::Flat(_) => self.fdt(tree as usize).and_then(|fdt| fdt.path_offset(path)),
            OfTrees::Live(trees) => trees
                .get(tree as usize)
                .and_then(|t| t.find_node_id(path)),
        };
        self.wrap(tree, pos)
    }

    pub fn get_by_phandle(&self, phandle: u32) -> OfNode<'_> {
        self.get_by_phandle_in(0, phandle)
    }

    pub fn get_by_phandle_in(&self, tree: u32, phandle: u32) -> OfNode<'_> {
        let pos = match self {
            OfTrees::Flat(_) => self
                .fdt(tree as usize)
                .and_then(|fdt| fdt.node_offset_by_phandle(phandle)),
            OfTrees::Live(trees) => trees
                .get(tree as usize)
                .and_then(|t| t.phandle_map.get(&phandle).copied()),
        };
        self.wrap(tree, pos)
    }

    /// Every node of `tree` in document order.
    pub fn all_nodes(&self, tree: u32) -> Vec<NodeRef> {
        match self {
            OfTrees::Flat(_) => self
                .fdt(tree as usize)
                .map(|fdt| {
                    fdt.nodes()
                        .map(|(off, _)| NodeRef::from_offset(tree, off))
                        .collect()
                })
                .unwrap_or_default(),
            OfTrees::Live(trees) => {
                let Some(t) = trees.get(tree as usize) else {
                    return Vec::new();
                };
                let mut res = Vec::with_capacity(t.container.len());
                let mut stack = vec![t.root_id];
                while let Some(id) = stack.pop() {
                    res.push(NodeRef::from_index(tree, id));
                    stack.extend(t.container[id].children.iter().rev());
                }
                res
            }
        }
    }

    /// The next node after `from`, in document order, for which `pred` holds.
    ///
    /// A null `from` starts at the beginning of the control tree.
    fn next_matching(&self, from: NodeRef, pred: impl Fn(&OfNode<'_>) -> bool) -> OfNode<'_> {
        let tree = from.tree_id().unwrap_or(0);
        let nodes = self.all_nodes(tree);
        let start = if from.is_null() {
            0
        } else {
            match nodes.iter().position(|n| *n == from) {
                Some(idx) => idx + 1,
                None => return self.node(NodeRef::null()),
            }
        };
        let found = nodes[start..].iter().copied().find(|n| pred(&self.node(*n)));
        self.node(found.unwrap_or_default())
    }

    /// The next node after `from` compatible with `compat`.
    pub fn by_compatible(&self, from: NodeRef, compat: &str) -> OfNode<'_> {
        self.next_matching(from, |node| node.device_is_compatible(compat))
    }

    /// The next node after `from` whose property `name` holds exactly `value`.
    pub fn by_prop_value(&self, from: NodeRef, name: &str, value: &[u8]) -> OfNode<'_> {
        self.next_matching(from, |node| node.prop(name).is_ok_and(|data| data == value))
    }

    pub fn aliases_node(&self) -> OfNode<'_> {
        self.path_in(0, "/aliases")
    }

    /// `/aliases` entries named `<stem><N>`, with `N` and the aliased path.
    fn aliases_with_stem<'s>(&'s self, stem: &'s str) -> impl Iterator<Item = (u32, &'s str)> + 's {
        self.aliases_node()
            .properties()
            .into_iter()
            .filter_map(move |(name, data)| {
                let id = name.strip_prefix(stem)?;
                if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some((id.parse().ok()?, prop::decode_str(data).ok()?))
            })
    }

    /// Sequence number `node` is given by an alias such as `serial1`.
    pub fn alias_seq(&self, stem: &str, node: NodeRef) -> Option<u32> {
        let tree = node.tree_id()?;
        self.aliases_with_stem(stem)
            .find(|(_, path)| self.path_in(tree, path).node_ref() == node)
            .map(|(id, _)| id)
    }

    /// Highest `N` among the `<stem><N>` aliases.
    pub fn alias_highest_id(&self, stem: &str) -> Option<u32> {
        self.aliases_with_stem(stem).map(|(id, _)| id).max()
    }

    pub fn chosen(&self) -> OfNode<'_> {
        self.path_in(0, "/chosen")
    }

    pub fn read_chosen_string(&self, name: &str) -> Result<&str, PropertyError> {
        self.chosen().read_string(name)
    }

    /// The node whose path is stored in the `/chosen` property `name`.
    pub fn chosen_node(&self, name: &str) -> OfNode<'_> {
        match self.read_chosen_string(name) {
            Ok(path) => self.path(path),
            Err(_) => self.node(NodeRef::null()),
        }
    }

    /// The `/config` node of the control tree.
    pub fn config_node(&self) -> OfNode<'_> {
        self.path_in(0, "/config")
    }

    pub fn conf_read_bool(&self, name: &str) -> bool {
        self.config_node().read_bool(name)
    }

    pub fn conf_read_int(&self, name: &str, default: u32) -> u32 {
        self.config_node().read_u32_default(name, default)
    }

    pub fn conf_read_str(&self, name: &str) -> Option<&str> {
        self.config_node().read_string(name).ok()
    }

    fn live_mut(&mut self, node: NodeRef) -> Result<(&mut DeviceTree, usize), PropertyError> {
        let tree = node.tree_id().ok_or(PropertyError::NotFound)? as usize;
        let pos = node.position().ok_or(PropertyError::NotFound)?;
        match (self, node) {
            (OfTrees::Flat(_), _) => Err(PropertyError::ReadOnly),
            (OfTrees::Live(trees), NodeRef::Live(_)) => {
                let t = trees.get_mut(tree).ok_or(PropertyError::NotFound)?;
                if pos >= t.container.len() {
                    return Err(PropertyError::NotFound);
                }
                Ok((t, pos))
            }
            _ => Err(PropertyError::NotFound),
        }
    }

    pub fn write_prop(&mut self, node: NodeRef, name: &str, data: &[u8]) -> Result<(), PropertyError> {
        let (tree, pos) = self.live_mut(node)?;
        tree.set_property(pos, name, data)
    }

    pub fn write_u32(&mut self, node: NodeRef, name: &str, value: u32) -> Result<(), PropertyError> {
        self.write_prop(node, name, &value.to_be_bytes())
    }

    pub fn write_string(&mut self, node: NodeRef, name: &str, value: &str) -> Result<(), PropertyError> {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.write_prop(node, name, &data)
    }

    pub fn set_enabled(&mut self, node: NodeRef, enabled: bool) -> Result<(), PropertyError> {
        self.write_string(node, "status", if enabled { "okay" } else { "disabled" })
    }

    /// Copy every property of `src` onto `dst`, replacing ones of the same name.
    ///
    /// `src` may live in any tree; `dst` must be writable.
    pub fn copy_props(&mut self, src: NodeRef, dst: NodeRef) -> Result<(), PropertyError> {
        let src = self.node(src);
        if !src.is_valid() {
            return Err(PropertyError::NotFound);
        }
        let props: Vec<(String, Vec<u8>)> = src
            .properties()
            .into_iter()
            .map(|(name, data)| (String::from(name), data.to_vec()))
            .collect();
        for (name, data) in &props {
            self.write_prop(dst, name, data)?;
        }
        Ok(())
    }

    /// Add a child node (or return the existing one of that name).
    pub fn add_subnode(&mut self, parent: NodeRef, name: &str) -> Result<NodeRef, PropertyError> {
        let tree_id = parent.tree_id().ok_or(PropertyError::NotFound)?;
        let (tree, pos) = self.live_mut(parent)?;
        let id = tree.add_subnode(pos, name).ok_or(PropertyError::NotFound)?;
        Ok(NodeRef::from_index(tree_id, id))
    }
}

/// A phandle reference with its argument cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhandleArgs {
    pub node: NodeRef,
    pub args: Vec<u32>,
}

/// A node viewed through the trees that hold it.
#[derive(Clone, Copy)]
pub struct OfNode<'a> {
    trees: &'a OfTrees,
    node: NodeRef,
}

impl<'a> OfNode<'a> {
    pub fn node_ref(&self) -> NodeRef {
        self.node
    }

    pub fn is_valid(&self) -> bool {
        self.backend().is_some()
    }

    fn backend(&self) -> Option<Backend<'a>> {
        self.trees.resolve(self.node)
    }

    fn at(&self, pos: Option<usize>) -> OfNode<'a> {
        let node = pos.map_or(NodeRef::null(), |pos| self.node.sibling_ref(pos));
        self.trees.node(node)
    }

    /// Full node name including the unit address; the root is "".
    pub fn name(&self) -> Option<&'a str> {
        match self.backend()? {
            Backend::Flat(fdt, off) => fdt.get_name(off),
            Backend::Live(t, idx) => Some(&*t.container[idx].full_name),
        }
    }

    /// Compare the node name without its unit address.
    pub fn name_eq(&self, name: &str) -> bool {
        self.name()
            .is_some_and(|full| full.split('@').next() == Some(name))
    }

    pub fn path(&self) -> Option<String> {
        match self.backend()? {
            Backend::Flat(fdt, off) => fdt.get_path(off),
            Backend::Live(t, idx) => Some(String::from(&*t.get_full_path(&t.container[idx]))),
        }
    }

    pub fn parent(&self) -> OfNode<'a> {
        let pos = match self.backend() {
            Some(Backend::Flat(fdt, off)) => fdt.parent_offset(off),
            Some(Backend::Live(t, idx)) => {
                let node = &t.container[idx];
                (!t.is_root(node)).then_some(node.parent_id)
            }
            None => None,
        };
        self.at(pos)
    }

    pub fn first_subnode(&self) -> OfNode<'a> {
        let pos = match self.backend() {
            Some(Backend::Flat(fdt, off)) => fdt.first_subnode(off),
            Some(Backend::Live(t, idx)) => t.container[idx].children.first().copied(),
            None => None,
        };
        self.at(pos)
    }

    pub fn next_subnode(&self) -> OfNode<'a> {
        let pos = match self.backend() {
            Some(Backend::Flat(fdt, off)) => fdt.next_subnode(off),
            Some(Backend::Live(t, idx)) => {
                let node = &t.container[idx];
                if t.is_root(node) {
                    None
                } else {
                    let siblings = &t.container[node.parent_id].children;
                    siblings
                        .iter()
                        .position(|id| *id == idx)
                        .and_then(|i| siblings.get(i + 1).copied())
                }
            }
            None => None,
        };
        self.at(pos)
    }

    pub fn subnodes(&self) -> Subnodes<'a> {
        Subnodes {
            next: self.first_subnode(),
        }
    }

    pub fn child_count(&self) -> usize {
        self.subnodes().count()
    }

    /// Direct child named `name`; a name without unit address matches any unit address.
    pub fn find_subnode(&self, name: &str) -> OfNode<'a> {
        let pos = match self.backend() {
            Some(Backend::Flat(fdt, off)) => fdt.subnode_offset(off, name),
            Some(Backend::Live(t, idx)) => t.container[idx]
                .children
                .iter()
                .copied()
                .find(|child| name_matches(&t.container[*child].full_name, name)),
            None => None,
        };
        self.at(pos)
    }

    /// Raw payload of property `name`.
    pub fn prop(&self, name: &str) -> Result<&'a [u8], PropertyError> {
        let data = match self.backend().ok_or(PropertyError::NotFound)? {
            Backend::Flat(fdt, off) => fdt.getprop(off, name),
            Backend::Live(t, idx) => t
                .get_property(&t.container[idx], name)
                .map(|p| &*p.data),
        };
        data.ok_or(PropertyError::NotFound)
    }

    /// Payload length of property `name` in bytes.
    pub fn read_size(&self, name: &str) -> Result<usize, PropertyError> {
        self.prop(name).map(<[u8]>::len)
    }

    /// All properties in stored order.
    pub fn properties(&self) -> Vec<(&'a str, &'a [u8])> {
        match self.backend() {
            Some(Backend::Flat(fdt, off)) => fdt.properties(off).collect(),
            Some(Backend::Live(t, idx)) => t.container[idx]
                .props
                .iter()
                .map(|p| (&*p.name, &*p.data))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn read<T: FromProp<'a>>(&self, name: &str) -> Result<T, PropertyError> {
        T::from_prop(self.prop(name)?)
    }

    /// First byte of property `name`.
    pub fn read_u8(&self, name: &str) -> Result<u8, PropertyError> {
        self.prop(name)?.first().copied().ok_or(PropertyError::TypeMismatch)
    }

    pub fn read_u8_default(&self, name: &str, default: u8) -> u8 {
        self.read_u8(name).unwrap_or(default)
    }

    /// First big-endian 16-bit value of property `name`.
    pub fn read_u16(&self, name: &str) -> Result<u16, PropertyError> {
        match self.prop(name)? {
            [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
            _ => Err(PropertyError::TypeMismatch),
        }
    }

    pub fn read_u16_default(&self, name: &str, default: u16) -> u16 {
        self.read_u16(name).unwrap_or(default)
    }

    pub fn read_u32(&self, name: &str) -> Result<u32, PropertyError> {
        self.read(name)
    }

    pub fn read_u32_default(&self, name: &str, default: u32) -> u32 {
        self.read_u32(name).unwrap_or(default)
    }

    pub fn read_s32_default(&self, name: &str, default: i32) -> i32 {
        self.read::<i32>(name).unwrap_or(default)
    }

    pub fn read_u64(&self, name: &str) -> Result<u64, PropertyError> {
        self.read(name)
    }

    pub fn read_u64_default(&self, name: &str, default: u64) -> u64 {
        self.read_u64(name).unwrap_or(default)
    }

    /// Whether the property exists; boolean properties carry no payload.
    pub fn read_bool(&self, name: &str) -> bool {
        self.prop(name).is_ok()
    }

    pub fn read_string(&self, name: &str) -> Result<&'a str, PropertyError> {
        self.read(name)
    }

    pub fn read_string_list(&self, name: &str) -> Result<Vec<&'a str>, PropertyError> {
        self.read(name)
    }

    pub fn read_string_count(&self, name: &str) -> Result<usize, PropertyError> {
        self.read_string_list(name).map(|list| list.len())
    }

    pub fn read_string_index(&self, name: &str, index: usize) -> Result<&'a str, PropertyError> {
        self.read_string_list(name)?
            .get(index)
            .copied()
            .ok_or(PropertyError::NotFound)
    }

    /// Position of `value` in the string list `name`.
    pub fn stringlist_search(&self, name: &str, value: &str) -> Result<usize, PropertyError> {
        self.read_string_list(name)?
            .iter()
            .position(|s| *s == value)
            .ok_or(PropertyError::NotFound)
    }

    pub fn read_u32_array(&self, name: &str) -> Result<Vec<u32>, PropertyError> {
        self.read(name)
    }

    pub fn read_u32_index(&self, name: &str, index: usize) -> Result<u32, PropertyError> {
        prop::decode_u32_index(self.prop(name)?, index)
    }

    /// Follow the phandle stored in property `name`.
    pub fn read_phandle(&self, name: &str) -> Result<OfNode<'a>, PropertyError> {
        let phandle = self.read_u32(name)?;
        let tree = self.node.tree_id().ok_or(PropertyError::NotFound)?;
        let target = self.trees.get_by_phandle_in(tree, phandle);
        if target.is_valid() {
            Ok(target)
        } else {
            Err(PropertyError::DanglingHandle)
        }
    }

    /// Walk a `<phandle arg...>` list, calling `visit` with each entry's target and arguments
    /// until it returns `true`. Returns the number of entries visited.
    fn walk_phandle_list(
        &self,
        list_name: &str,
        cells_name: Option<&str>,
        cell_count: usize,
        mut visit: impl FnMut(usize, NodeRef, &[u32]) -> bool,
    ) -> Result<usize, PropertyError> {
        let cells = self.read_u32_array(list_name)?;
        let tree = self.node.tree_id().ok_or(PropertyError::NotFound)?;
        let mut cursor = 0;
        let mut entry = 0;
        while cursor < cells.len() {
            let phandle = cells[cursor];
            cursor += 1;
            let (target, count) = if phandle == 0 {
                (NodeRef::null(), 0)
            } else {
                let target = self.trees.get_by_phandle_in(tree, phandle);
                if !target.is_valid() {
                    return Err(PropertyError::DanglingHandle);
                }
                let count = match cells_name {
                    Some(cells_name) => target.read_u32(cells_name)? as usize,
                    None => cell_count,
                };
                (target.node_ref(), count)
            };
            let args = cells
                .get(cursor..cursor + count)
                .ok_or(PropertyError::TypeMismatch)?;
            if visit(entry, target, args) {
                return Ok(entry + 1);
            }
            cursor += count;
            entry += 1;
        }
        Ok(entry)
    }

    /// Entry `index` of a list such as `clocks = <&clk 3>, <&clk 4>`.
    ///
    /// The argument count comes from `cells_name` in the target node, or is `cell_count`.
    pub fn parse_phandle_with_args(
        &self,
        list_name: &str,
        cells_name: Option<&str>,
        cell_count: usize,
        index: usize,
    ) -> Result<PhandleArgs, PropertyError> {
        let mut found = None;
        self.walk_phandle_list(list_name, cells_name, cell_count, |entry, node, args| {
            if entry == index {
                found = Some(PhandleArgs {
                    node,
                    args: args.to_vec(),
                });
                true
            } else {
                false
            }
        })?;
        match found {
            Some(args) if !args.node.is_null() => Ok(args),
            _ => Err(PropertyError::NotFound),
        }
    }

    pub fn count_phandle_with_args(
        &self,
        list_name: &str,
        cells_name: Option<&str>,
        cell_count: usize,
    ) -> Result<usize, PropertyError> {
        self.walk_phandle_list(list_name, cells_name, cell_count, |_, _, _| false)
    }

    /// A node is enabled unless its `status` says otherwise.
    pub fn is_enabled(&self) -> bool {
        match self.read_string("status") {
            Ok(status) => status == "okay" || status == "ok",
            Err(_) => self.is_valid(),
        }
    }

    /// Whether the node is tagged for use before relocation.
    pub fn pre_reloc(&self) -> bool {
        PRE_RELOC_PROPS.iter().any(|name| self.read_bool(name))
    }

    pub fn device_is_compatible(&self, compat: &str) -> bool {
        self.read_string_list("compatible")
            .is_ok_and(|list| list.contains(&compat))
    }

    /// `#address-cells` of this node itself (2 when absent).
    pub fn read_simple_addr_cells(&self) -> usize {
        self.read_u32_default("#address-cells", 2) as usize
    }

    /// `#size-cells` of this node itself (1 when absent).
    pub fn read_simple_size_cells(&self) -> usize {
        self.read_u32_default("#size-cells", 1) as usize
    }

    /// Address cells used by this node's `reg`, i.e. the parent's `#address-cells`.
    pub fn read_addr_cells(&self) -> usize {
        self.parent().read_simple_addr_cells()
    }

    /// Size cells used by this node's `reg`, i.e. the parent's `#size-cells`.
    pub fn read_size_cells(&self) -> usize {
        self.parent().read_simple_size_cells()
    }

    /// Entry `index` of `reg`, decoded with the parent's cell sizes.
    pub fn get_addr_size_index(&self, index: usize) -> Result<(u64, u64), PropertyError> {
        let na = self.read_addr_cells();
        let ns = self.read_size_cells();
        let reg = self.prop("reg")?;
        let start = index * (na + ns);
        let addr = prop::decode_cells(reg, start, na)?;
        let size = prop::decode_cells(reg, start + na, ns)?;
        Ok((addr, size))
    }

    pub fn get_addr_index(&self, index: usize) -> Result<u64, PropertyError> {
        self.get_addr_size_index(index).map(|(addr, _)| addr)
    }

    pub fn get_addr(&self) -> Result<u64, PropertyError> {
        self.get_addr_index(0)
    }

    pub fn get_size(&self) -> Result<u64, PropertyError> {
        self.get_addr_size_index(0).map(|(_, size)| size)
    }

    /// Entry `index` of `reg` as an inclusive address range.
    pub fn read_resource(&self, index: usize) -> Result<Resource, PropertyError> {
        let (start, size) = self.get_addr_size_index(index)?;
        if size == 0 {
            return Err(PropertyError::TypeMismatch);
        }
        let end = start.checked_add(size - 1).ok_or(PropertyError::TypeMismatch)?;
        Ok(Resource { start, end })
    }

    /// The `reg` entry labelled `name` in `reg-names`.
    pub fn read_resource_byname(&self, name: &str) -> Result<Resource, PropertyError> {
        let index = self.stringlist_search("reg-names", name)?;
        self.read_resource(index)
    }
}

/// An inclusive address range taken from `reg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    pub start: u64,
    pub end: u64,
}

impl Resource {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl PartialEq for OfNode<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

impl fmt::Debug for OfNode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.path() {
            Some(path) => write!(f, "OfNode({:?} {})", self.node, path),
            None => write!(f, "OfNode({:?})", self.node),
        }
    }
}

pub struct Subnodes<'a> {
    next: OfNode<'a>,
}

impl<'a> Iterator for Subnodes<'a> {
    type Item = OfNode<'a>;

    fn next(&mut self) -> Option<OfNode<'a>> {
        if !self.next.is_valid() {
            return None;
        }
        let cur = self.next;
        self.next = cur.next_subnode();
        Some(cur)
    }
}
