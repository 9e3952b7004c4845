//! Scanner: creates bound devices from device-tree nodes and platform-data tables.
//!
//! Nodes are bound in document order, so a node's parent device always exists before the node
//! itself. Nodes without a matching driver are skipped; a tree is shared between builds that
//! enable different drivers.
use alloc::{string::String, vec::Vec};
use core::sync::atomic::Ordering;

use crate::{
    device::DeviceHandle,
    driver::DriverFlags,
    error::DmError,
    ofnode::NodeRef,
    root::Dm,
    uclass::UclassId,
};

/// Passes over the platform-data table before giving up on missing parents.
const MAX_BIND_PASSES: usize = 10;

impl Dm {
    /// Bind the driver matching `node` under `parent`.
    ///
    /// Returns [None] when the node was skipped because only pre-relocation devices are wanted.
    pub fn bind_fdt_node(
        &self,
        parent: &DeviceHandle,
        node: NodeRef,
        pre_reloc_only: bool,
    ) -> Result<Option<DeviceHandle>, DmError> {
        let found = {
            let trees = self.trees();
            let of = trees.node(node);
            let name = of.name().ok_or(DmError::NotFound)?;
            let compats = of.read_string_list("compatible").unwrap_or_default();
            self.drivers
                .find_by_compatible(compats.iter().copied())
                .map(|(drv, id)| (drv, id, String::from(name), of.pre_reloc()))
        };
        let Some((drv, id, name, node_pre_reloc)) = found else {
            debug_ex!("No match for node '{:?}'.", node);
            return Err(DmError::NoMatchingDriver);
        };
        if pre_reloc_only && !node_pre_reloc && !drv.flags.contains(DriverFlags::PRE_RELOC) {
            debug_ex!("Skipping '{}' before relocation.", name);
            return Ok(None);
        }
        debug_ex!("Match '{}' with driver '{}' ({}).", name, drv.name, id.compatible);
        self.bind_common(Some(parent), drv, &name, id.data, node, &[])
            .map(Some)
    }

    /// Bind the enabled subnodes of `node` under `parent`; returns how many were bound.
    ///
    /// A failing node does not stop the scan; the first failure is returned at the end.
    pub fn scan_fdt_node(
        &self,
        parent: &DeviceHandle,
        node: NodeRef,
        pre_reloc_only: bool,
    ) -> Result<usize, DmError> {
        let subnodes: Vec<(NodeRef, bool)> = self
            .trees()
            .node(node)
            .subnodes()
            .map(|sub| (sub.node_ref(), sub.is_enabled()))
            .collect();
        let mut count = 0;
        let mut first_err = None;
        for (sub, enabled) in subnodes {
            if !enabled {
                debug_ex!("Node {:?} is disabled.", sub);
                continue;
            }
            match self.bind_fdt_node(parent, sub, pre_reloc_only) {
                Ok(Some(_)) => count += 1,
                Ok(None) | Err(DmError::NoMatchingDriver) => {}
                Err(DmError::AlreadyBound) => match self.rescan_bus(sub, pre_reloc_only) {
                    Ok(found) => count += found,
                    Err(err) => {
                        first_err.get_or_insert(err);
                    }
                },
                Err(err) => {
                    log::warn!("Cannot bind node {:?}: {}", sub, err);
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(count), Err)
    }

    /// Pick up children of an already-bound bus that an earlier scan skipped.
    fn rescan_bus(&self, node: NodeRef, pre_reloc_only: bool) -> Result<usize, DmError> {
        match self.device_find_global_by_ofnode(node) {
            Some(bus) if bus.uclass_id() == UclassId::SimpleBus => {
                self.scan_fdt_node(&bus, node, pre_reloc_only)
            }
            _ => Ok(0),
        }
    }

    /// Bind the top-level nodes of the control tree under the root device.
    pub fn scan_fdt(&self, pre_reloc_only: bool) -> Result<usize, DmError> {
        let root = self.root().ok_or(DmError::NotFound)?;
        let node = self.trees().root().node_ref();
        self.scan_fdt_node(&root, node, pre_reloc_only)
    }

    /// Bind the children of the container nodes listed in the configuration under the root.
    pub fn scan_extended(&self, pre_reloc_only: bool) -> Result<usize, DmError> {
        let root = self.root().ok_or(DmError::NotFound)?;
        let mut count = 0;
        for path in self.config.scan_paths {
            let node = self.trees().path(path).node_ref();
            if node.is_null() {
                continue;
            }
            count += self.scan_fdt_node(&root, node, pre_reloc_only)?;
        }
        Ok(count)
    }

    /// Bind the subnodes of `dev`'s node under `dev`, with the pre-relocation setting of the
    /// scan in progress.
    pub fn scan_fdt_dev(&self, dev: &DeviceHandle) -> Result<usize, DmError> {
        if dev.node().is_null() {
            return Ok(0);
        }
        self.scan_fdt_node(dev, dev.node(), self.pre_reloc_scan.load(Ordering::Acquire))
    }

    fn plat_bindable(&self, idx: usize, pre_reloc_only: bool) -> bool {
        self.drivers
            .lookup_name(self.plat[idx].name)
            .is_some_and(|drv| !pre_reloc_only || drv.flags.contains(DriverFlags::PRE_RELOC))
    }

    fn plat_device(&self, idx: usize) -> Option<DeviceHandle> {
        self.plat_devices
            .read()
            .get(idx)?
            .as_ref()?
            .get_handle()
    }

    /// Bind the platform-data entries, parents before children; returns how many were bound.
    ///
    /// Entries whose parent is not bound yet are retried on the next pass.
    pub fn scan_plat(&self, pre_reloc_only: bool) -> Result<usize, DmError> {
        if self.plat.is_empty() {
            return Ok(0);
        }
        let root = self.root().ok_or(DmError::NotFound)?;
        let mut count = 0;
        let mut first_err = None;
        for pass in 0..MAX_BIND_PASSES {
            let mut waiting = false;
            for (idx, info) in self.plat.iter().enumerate() {
                if self.plat_device(idx).is_some() || !self.plat_bindable(idx, pre_reloc_only) {
                    continue;
                }
                let parent = match info.parent_idx {
                    None => root.clone(),
                    Some(parent_idx) if !self.plat_bindable(parent_idx, pre_reloc_only) => continue,
                    Some(parent_idx) => match self.plat_device(parent_idx) {
                        Some(parent) => parent,
                        None => {
                            waiting = true;
                            continue;
                        }
                    },
                };
                let Some(drv) = self.drivers.lookup_name(info.name) else {
                    continue;
                };
                match self.bind_common(Some(&parent), drv, info.name, 0, NodeRef::null(), info.plat) {
                    Ok(dev) => {
                        self.plat_devices.write()[idx] = Some(dev.create_ref());
                        count += 1;
                    }
                    Err(err) => {
                        log::warn!("Cannot bind platform device '{}': {}", info.name, err);
                        first_err.get_or_insert(err);
                    }
                }
            }
            if !waiting {
                break;
            }
            if pass + 1 == MAX_BIND_PASSES {
                log::warn!("Platform devices left without a parent after {} passes.", MAX_BIND_PASSES);
                first_err.get_or_insert(DmError::NotFound);
            }
        }
        for info in self.plat {
            if self.drivers.lookup_name(info.name).is_none() {
                log::warn!("Cannot find driver '{}' for platform device.", info.name);
                first_err.get_or_insert(DmError::NotFound);
            }
        }
        first_err.map_or(Ok(count), Err)
    }

    /// The device bound from platform-data entry `idx`, if any.
    pub fn plat_device_at(&self, idx: usize) -> Option<DeviceHandle> {
        self.plat_device(idx)
    }
}
