use crate::{
    fdt::reader::name_matches,
    prop::{Property, PropertyError, decode_cells, decode_u32},
};
use alloc::{boxed::Box, collections::btree_map::BTreeMap, string::String, vec, vec::Vec};
use core::ops::Range;

/// Linked ("live") device tree.
///
/// Nodes live in `container` and refer to each other by index. The root's `parent_id` is its own id.
#[derive(Debug, Clone)]
pub struct DeviceTree {
    pub root_id: usize,
    pub container: Vec<Node>,
    pub mem_rsv_map: Vec<Range<u64>>,
    pub phandle_map: BTreeMap<u32, usize>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: usize,
    pub parent_id: usize,
    pub full_name: Box<str>,
    pub node_name: Box<str>,
    pub unit_addr: Box<str>,
    pub children: Vec<usize>,
    pub props: Vec<Property>,
    pub node_type: NodeType,
}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum NodeType {
    Device,
    /// Nodes that describe the board rather than a device (`/chosen`, `/aliases`, memory).
    Description,
}

impl Node {
    pub fn new(node_id: usize, parent_id: usize, full_name: &str, props: Vec<Property>) -> Node {
        let (node_name, unit_addr) = full_name.split_once('@').unwrap_or((full_name, ""));
        Node {
            node_id,
            parent_id,
            full_name: Box::from(full_name),
            node_name: Box::from(node_name),
            unit_addr: Box::from(unit_addr),
            children: Vec::new(),
            props,
            node_type: NodeType::Device,
        }
    }

    pub fn phandle(&self) -> Option<u32> {
        self.props
            .iter()
            .find(|p| p.name.as_ref() == "phandle" || p.name.as_ref() == "linux,phandle")
            .and_then(|p| decode_u32(&p.data).ok())
    }
}

impl Default for DeviceTree {
    fn default() -> Self {
        DeviceTree::new()
    }
}

impl DeviceTree {
    /// A tree holding only an empty root node.
    pub fn new() -> DeviceTree {
        DeviceTree {
            root_id: 0,
            container: vec![Node::new(0, 0, "", Vec::new())],
            mem_rsv_map: Vec::new(),
            phandle_map: BTreeMap::new(),
        }
    }

    pub fn from_nodes(root_id: usize, container: Vec<Node>, mem_rsv_map: Vec<Range<u64>>) -> DeviceTree {
        let phandle_map = container
            .iter()
            .filter_map(|node| node.phandle().map(|ph| (ph, node.node_id)))
            .collect();
        DeviceTree {
            root_id,
            container,
            mem_rsv_map,
            phandle_map,
        }
    }

    pub fn root(&self) -> &Node {
        &self.container[self.root_id]
    }
    pub fn is_root(&self, node: &Node) -> bool {
        node.node_id == self.root_id
    }
    fn full_path(&self, node: &Node) -> String {
        if self.is_root(node) {
            String::new()
        } else {
            self.full_path(self.get_parent(node)) + "/" + node.full_name.as_ref()
        }
    }
    /// Absolute path of `node`; the root is `/`.
    pub fn get_full_path(&self, node: &Node) -> Box<str> {
        let path = self.full_path(node);
        if path.is_empty() {
            Box::from("/")
        } else {
            path.into_boxed_str()
        }
    }
    pub fn get_parent(&self, node: &Node) -> &Node {
        &self.container[node.parent_id]
    }
    pub fn get_children<'b>(&'b self, node: &Node) -> impl Iterator<Item = &'b Node> {
        node.children.iter().map(|x| &self.container[*x])
    }
    pub fn get_property<'b>(&self, node: &'b Node, name: impl AsRef<str>) -> Option<&'b Property> {
        let name = name.as_ref();
        node.props.iter().find(|prop| prop.name.as_ref() == name)
    }
    /// Index of the node at `path`, matching base names when a section has no unit address.
    pub fn find_node_id(&self, path: impl AsRef<str>) -> Option<usize> {
        let mut node = self.root_id;
        for section in path.as_ref().split('/') {
            if section.trim().is_empty() {
                continue;
            }
            node = *self.container[node]
                .children
                .iter()
                .find(|child| name_matches(&self.container[**child].full_name, section))?;
        }
        Some(node)
    }
    pub fn get_node(&self, path: impl AsRef<str>) -> Option<&Node> {
        self.find_node_id(path).map(|id| &self.container[id])
    }
    pub fn get_node_mut(&mut self, path: impl AsRef<str>) -> Option<&mut Node> {
        let id = self.find_node_id(path)?;
        self.container.get_mut(id)
    }
    /// Nodes matching `path`, where a `*` section matches any child.
    pub fn get_nodes(&self, path: impl AsRef<str>) -> Vec<&Node> {
        let path: Vec<&str> = path.as_ref().split('/').collect();
        self.get_sub_nodes(self.root(), &path, 0)
    }
    pub fn get_nodes_mut<F: Fn(&mut Node)>(&mut self, path: impl AsRef<str>, f: F) {
        let ids: Vec<usize> = self.get_nodes(path).iter().map(|x| x.node_id).collect();
        for id in ids {
            f(&mut self.container[id]);
        }
    }
    fn get_sub_nodes<'b>(&'b self, node: &'b Node, path: &[&str], mut cursor: usize) -> Vec<&'b Node> {
        while cursor < path.len() && path[cursor].trim().is_empty() {
            cursor += 1;
        }
        if cursor >= path.len() {
            return vec![node];
        }
        let sec = path[cursor];
        self.get_children(node)
            .flat_map(|child| {
                if sec == "*" || child.full_name.as_ref() == sec || child.node_name.as_ref() == sec {
                    self.get_sub_nodes(child, path, cursor + 1)
                } else {
                    vec![]
                }
            })
            .collect()
    }
    pub fn node_by_phandle(&self, phandle: u32) -> Option<&Node> {
        self.phandle_map.get(&phandle).map(|id| &self.container[*id])
    }
    /// Decode `reg` using the parent's `#address-cells`/`#size-cells` (2 and 1 when absent).
    pub fn get_reg_value(&self, node: &Node) -> Result<Vec<Range<u64>>, PropertyError> {
        let mut size_cel = 1;
        let mut addr_cel = 2;
        if !self.is_root(node) {
            let parent = self.get_parent(node);
            if let Some(prop) = self.get_property(parent, "#address-cells") {
                addr_cel = prop.value_as_u32()? as usize;
            }
            if let Some(prop) = self.get_property(parent, "#size-cells") {
                size_cel = prop.value_as_u32()? as usize;
            }
        }
        let reg = self
            .get_property(node, "reg")
            .ok_or(PropertyError::NotFound)?;
        let width = size_cel + addr_cel;
        if width == 0 {
            return Err(PropertyError::TypeMismatch);
        }
        let count = reg.data.len() / 4 / width;
        let mut res = vec![];
        for i in 0..count {
            let index = width * i;
            let addr = decode_cells(&reg.data, index, addr_cel)?;
            let sz = decode_cells(&reg.data, index + addr_cel, size_cel)?;
            res.push(addr..addr + sz);
        }
        Ok(res)
    }

    /// Append a child named `name` to `parent`, returning its index.
    ///
    /// An existing child with the same full name is returned instead.
    pub fn add_subnode(&mut self, parent: usize, name: &str) -> Option<usize> {
        let existing = self
            .container
            .get(parent)?
            .children
            .iter()
            .find(|child| self.container[**child].full_name.as_ref() == name)
            .copied();
        if let Some(id) = existing {
            return Some(id);
        }
        let id = self.container.len();
        self.container.push(Node::new(id, parent, name, Vec::new()));
        self.container[parent].children.push(id);
        Some(id)
    }

    /// Create or replace a property of node `node`.
    pub fn set_property(&mut self, node: usize, name: &str, data: &[u8]) -> Result<(), PropertyError> {
        let target = self.container.get_mut(node).ok_or(PropertyError::NotFound)?;
        match target.props.iter_mut().find(|p| p.name.as_ref() == name) {
            Some(prop) => prop.data = Box::from(data),
            None => target.props.push(Property::new(name, data)),
        }
        if name == "phandle" || name == "linux,phandle" {
            self.phandle_map.retain(|_, id| *id != node);
            if let Ok(ph) = decode_u32(data) {
                self.phandle_map.insert(ph, node);
            }
        }
        Ok(())
    }

    pub fn remove_property(&mut self, node: usize, name: &str) -> Result<(), PropertyError> {
        let target = self.container.get_mut(node).ok_or(PropertyError::NotFound)?;
        let before = target.props.len();
        target.props.retain(|p| p.name.as_ref() != name);
        if target.props.len() == before {
            return Err(PropertyError::NotFound);
        }
        if name == "phandle" || name == "linux,phandle" {
            self.phandle_map.retain(|_, id| *id != node);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[test]
    fn builds_and_finds_nodes() {
        let mut tree = DeviceTree::new();
        let soc = tree.add_subnode(0, "soc").unwrap();
        let uart = tree.add_subnode(soc, "serial@1000").unwrap();
        tree.add_subnode(soc, "serial@2000").unwrap();
        assert_eq!(tree.add_subnode(soc, "serial@1000"), Some(uart));
        assert_eq!(tree.find_node_id("/soc/serial@1000"), Some(uart));
        assert_eq!(tree.find_node_id("/soc/serial"), Some(uart));
        assert_eq!(tree.get_nodes("/soc/serial").len(), 2);
        assert_eq!(tree.get_nodes("/*/serial@2000").len(), 1);
        assert_eq!(tree.get_full_path(&tree.container[uart]).as_ref(), "/soc/serial@1000");
        assert_eq!(tree.container[uart].unit_addr.as_ref(), "1000");
    }

    #[test]
    fn tracks_phandles() {
        let mut tree = DeviceTree::new();
        let clk = tree.add_subnode(0, "clk").unwrap();
        tree.set_property(clk, "phandle", &cells(&[7])).unwrap();
        assert_eq!(tree.node_by_phandle(7).map(|n| n.node_id), Some(clk));
        tree.set_property(clk, "phandle", &cells(&[8])).unwrap();
        assert!(tree.node_by_phandle(7).is_none());
        tree.remove_property(clk, "phandle").unwrap();
        assert!(tree.node_by_phandle(8).is_none());
        assert_eq!(tree.remove_property(clk, "phandle"), Err(PropertyError::NotFound));
    }

    #[test]
    fn decodes_reg_with_parent_cells() {
        let mut tree = DeviceTree::new();
        let soc = tree.add_subnode(0, "soc").unwrap();
        tree.set_property(soc, "#address-cells", &cells(&[1])).unwrap();
        tree.set_property(soc, "#size-cells", &cells(&[1])).unwrap();
        let dev = tree.add_subnode(soc, "dev@1000").unwrap();
        tree.set_property(dev, "reg", &cells(&[0x1000, 0x100, 0x3000, 0x10])).unwrap();
        let reg = tree.get_reg_value(&tree.container[dev]).unwrap();
        assert_eq!(reg, [0x1000..0x1100, 0x3000..0x3010]);
    }
}
