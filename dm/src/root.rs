//! The driver-model context and its start-up / tear-down sequence.
//!
//! A [Dm] owns everything the driver model knows at runtime: the registered drivers and uclass
//! drivers, the device trees, the uclasses, the device graph (through its root device), the
//! event bus and the data pool. Start-of-day is [Dm::init] followed by [Dm::scan] (or both via
//! [Dm::init_and_scan]); [Dm::uninit] undoes it.
use alloc::{sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{RwLock, RwLockReadGuard};

use crate::{
    config::DmConfig,
    device::{DataSlot, DeviceHandle, DeviceRef, RemoveFlags},
    driver::{DmTables, Driver, DriverFlags, DriverInfo, DriverRegistry, UdeviceId},
    error::DmError,
    event::{EventBus, EventType},
    handle::Handle,
    ofnode::OfTrees,
    pool::DataPool,
    uclass::{Uclass, UclassDriver, UclassId},
};

/// Driver of the root device.
pub static ROOT_DRIVER: Driver = Driver {
    name: "root_driver",
    id: UclassId::Root,
    ..Driver::DEFAULT
};

crate::uclass_driver!(root { id: UclassId::Root });

crate::declare_driver!(simple_bus {
    id: UclassId::SimpleBus,
    of_match: &[UdeviceId::new("simple-bus"), UdeviceId::new("simple-mfd")],
    flags: DriverFlags::PRE_RELOC,
});

crate::uclass_driver!(simple_bus {
    id: UclassId::SimpleBus,
    post_bind: Some(simple_bus_post_bind),
    per_device_plat_auto: size_of::<SimpleBusPlat>(),
});

/// Window of a simple bus taken from its `ranges`: child addresses from `base` map to
/// parent addresses from `target`.
pub type SimpleBusPlat = [u32; 3];

fn simple_bus_post_bind(dm: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    let ranges = dm.trees().node(dev.node()).read_u32_array("ranges");
    if let Ok(&[base, target, size]) = ranges.as_deref() {
        dev.write_data::<SimpleBusPlat>(DataSlot::UclassPlat, [base, target, size])?;
    }
    dm.scan_fdt_dev(dev).map(|_| ())
}

pub struct Dm {
    pub(crate) config: DmConfig,
    pub(crate) drivers: DriverRegistry,
    pub(crate) uclass_drivers: Vec<&'static UclassDriver>,
    pub(crate) plat: &'static [DriverInfo],
    /// Device bound for each entry of `plat`.
    pub(crate) plat_devices: RwLock<Vec<Option<DeviceRef>>>,
    pub(crate) uclasses: RwLock<Vec<Handle<Uclass>>>,
    root: RwLock<Option<DeviceHandle>>,
    trees: RwLock<OfTrees>,
    pub(crate) events: EventBus,
    pub(crate) pool: Arc<DataPool>,
    relocated: AtomicBool,
    /// Whether the scan in progress only binds pre-relocation devices.
    pub(crate) pre_reloc_scan: AtomicBool,
}

impl Dm {
    pub fn new(tables: &DmTables, trees: OfTrees, config: DmConfig) -> Result<Dm, DmError> {
        if trees.tree_count() > config.multi_tree_max {
            log::error!(
                "{} device trees given, at most {} supported.",
                trees.tree_count(),
                config.multi_tree_max
            );
            return Err(DmError::TooManyTrees);
        }
        let mut uclass_drivers: Vec<&'static UclassDriver> = vec![&ROOT_UCLASS, &SIMPLE_BUS_UCLASS];
        for drv in tables.uclass_drivers {
            if uclass_drivers.iter().any(|other| other.id == drv.id) {
                log::warn!("Uclass {:?} registered twice, keeping the first.", drv.id);
                continue;
            }
            uclass_drivers.push(drv);
        }
        Ok(Dm {
            drivers: DriverRegistry::new(tables.drivers),
            uclass_drivers,
            plat: tables.plat,
            plat_devices: RwLock::new(vec![None; tables.plat.len()]),
            uclasses: RwLock::new(Vec::new()),
            root: RwLock::new(None),
            trees: RwLock::new(trees),
            events: EventBus::new(tables.spies, config.event_dynamic),
            pool: DataPool::new(config.pool_size),
            relocated: AtomicBool::new(false),
            pre_reloc_scan: AtomicBool::new(false),
            config,
        })
    }

    /// Bind and probe the root device on the root of the control tree.
    pub fn init(&self) -> Result<(), DmError> {
        if self.root.read().is_some() {
            log::warn!("Driver model already initialised.");
            return Err(DmError::AlreadyBound);
        }
        let node = self.trees().root().node_ref();
        let root = self.bind_common(None, &ROOT_DRIVER, ROOT_DRIVER.name, 0, node, &[])?;
        *self.root.write() = Some(root.clone());
        if let Err(err) = self.device_probe(&root) {
            log::error!("Cannot probe root device: {}", err);
            if let Err(unbind_err) = self.device_unbind(&root) {
                log::warn!("Cannot unbind root device: {}", unbind_err);
            }
            *self.root.write() = None;
            return Err(err);
        }
        log::debug!("Driver model initialised.");
        Ok(())
    }

    /// Bind every device described by platform data and by the device trees; returns how many
    /// were bound.
    pub fn scan(&self, pre_reloc_only: bool) -> Result<usize, DmError> {
        self.pre_reloc_scan.store(pre_reloc_only, Ordering::Release);
        let mut count = self.scan_plat(pre_reloc_only)?;
        if self.trees().root().is_valid() {
            count += self.scan_fdt(pre_reloc_only)?;
            if self.config.extended_scan {
                count += self.scan_extended(pre_reloc_only)?;
            }
        }
        debug_ex!("Scan bound {} devices.", count);
        Ok(count)
    }

    /// [Dm::init] and [Dm::scan], then tell subscribers the driver model is up.
    pub fn init_and_scan(&self, pre_reloc_only: bool) -> Result<usize, DmError> {
        self.init()?;
        let count = self.scan(pre_reloc_only)?;
        let ty = if self.is_relocated() {
            EventType::DmPostInitR
        } else {
            EventType::DmPostInitF
        };
        self.events.notify_null(ty)?;
        Ok(count)
    }

    fn teardown(&self) -> Result<(), DmError> {
        let Some(root) = self.root() else {
            return Ok(());
        };
        for flags in [RemoveFlags::NON_VITAL, RemoveFlags::NORMAL] {
            match self.device_remove(&root, flags) {
                Ok(()) | Err(DmError::Rejected) => {}
                Err(err) => log::warn!("Removal with {:?} failed: {}", flags, err),
            }
        }
        self.device_unbind(&root)?;
        *self.root.write() = None;

        let ids: Vec<UclassId> = self.uclass_ids().into_iter().rev().collect();
        for id in ids {
            if let Err(err) = self.uclass_destroy(id) {
                log::warn!("Cannot destroy uclass {:?}: {}", id, err);
            }
        }
        self.plat_devices.write().iter_mut().for_each(|dev| *dev = None);
        Ok(())
    }

    /// Remove and unbind every device (vital ones last), destroy the uclasses and drop the
    /// dynamic event subscriptions.
    pub fn uninit(&self) -> Result<(), DmError> {
        self.teardown()?;
        self.events.unregister_all();
        log::debug!("Driver model shut down.");
        Ok(())
    }

    /// Remove the devices selected by `flags`, e.g. those that must not outlive the hand-off
    /// to the OS. Subtrees that are not selected stay as they are.
    pub fn remove_devices_with_flags(&self, flags: RemoveFlags) -> Result<(), DmError> {
        let root = self.root().ok_or(DmError::NotFound)?;
        let mut first_err = None;
        for child in root.children() {
            match self.device_remove(&child, flags) {
                Ok(()) | Err(DmError::Rejected) => {}
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Start over after relocation: tear the graph down, switch to the live representation if
    /// `live` is set, then run the full [Dm::init_and_scan]. Dynamic event subscriptions are
    /// kept. Returns how many devices the new scan bound.
    pub fn relocate(&self, live: bool) -> Result<usize, DmError> {
        self.teardown()?;
        if live {
            let unflattened = self.trees().unflatten()?;
            *self.trees.write() = unflattened;
        }
        self.relocated.store(true, Ordering::Release);
        self.init_and_scan(false)
    }

    pub fn root(&self) -> Option<DeviceHandle> {
        self.root.read().clone()
    }

    /// Read access to the device trees.
    ///
    /// Drop the guard before calling anything that may run driver hooks.
    pub fn trees(&self) -> RwLockReadGuard<'_, OfTrees> {
        self.trees.read()
    }

    pub fn update_trees<R>(&self, f: impl FnOnce(&mut OfTrees) -> R) -> R {
        f(&mut *self.trees.write())
    }

    /// Register another flat tree and return its id.
    pub fn add_tree(&self, blob: &[u8]) -> Result<u32, DmError> {
        if self.trees().tree_count() >= self.config.multi_tree_max {
            return Err(DmError::TooManyTrees);
        }
        self.update_trees(|trees| trees.add_flat(blob))
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn pool(&self) -> &Arc<DataPool> {
        &self.pool
    }

    pub fn config(&self) -> &DmConfig {
        &self.config
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn uclass_drivers(&self) -> &[&'static UclassDriver] {
        &self.uclass_drivers
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated.load(Ordering::Acquire)
    }

    /// Translate a child address of simple bus `dev` into a parent address.
    pub fn simple_bus_translate(&self, dev: &DeviceHandle, addr: u64) -> u64 {
        match dev.read_data::<SimpleBusPlat>(DataSlot::UclassPlat) {
            Ok([base, target, size]) if size != 0 => {
                let (base, target) = (base as u64, target as u64);
                if (base..base + size as u64).contains(&addr) {
                    addr - base + target
                } else {
                    addr
                }
            }
            _ => addr,
        }
    }
}
