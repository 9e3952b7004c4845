//! Driver registry: driver descriptors and the compatible-string index built from them.
//!
//! Responsibilities:
//! - Provide the [Driver] descriptor. Descriptors are `static` items, usually declared with
//!   [declare_driver], and are never mutated.
//! - Collect the descriptors of a build in [DmTables], an explicit registration table.
//! - Index the descriptors by compatible string in [DriverRegistry] so the scanner can pick the
//!   driver for a node.
//!
//! The built-in root and simple-bus drivers are always registered first.
use alloc::{collections::btree_map::BTreeMap, vec::Vec};
use bitflags::bitflags;
use core::{any::Any, fmt};

use crate::{
    device::DeviceHandle,
    error::DmError,
    event::EventSpy,
    root::{Dm, ROOT_DRIVER, SIMPLE_BUS_DRIVER},
    uclass::{UclassDriver, UclassId},
};

/// Lifecycle callback of a driver or uclass driver.
pub type DevHook = fn(&Dm, &DeviceHandle) -> Result<(), DmError>;

/// One entry of a driver's match table.
#[derive(Debug, Clone, Copy)]
pub struct UdeviceId {
    pub compatible: &'static str,
    /// Driver-specific value handed to the device as its `driver_data`.
    pub data: usize,
}

impl UdeviceId {
    pub const fn new(compatible: &'static str) -> UdeviceId {
        UdeviceId {
            compatible,
            data: 0,
        }
    }

    pub const fn with_data(compatible: &'static str, data: usize) -> UdeviceId {
        UdeviceId { compatible, data }
    }
}

bitflags! {
    pub struct DriverFlags: u32 {
        /// Usable before relocation.
        const PRE_RELOC  = 1 << 0;
        /// Holds DMA that must stop before the OS starts.
        const ACTIVE_DMA = 1 << 1;
        /// Needs to be removed before the OS starts.
        const OS_PREPARE = 1 << 2;
        /// Keep until everything else is gone.
        const VITAL      = 1 << 3;
    }
}

/// Build-time driver descriptor.
///
/// Use [Driver::DEFAULT] with struct update syntax to leave unused hooks empty.
pub struct Driver {
    pub name: &'static str,
    pub id: UclassId,
    pub of_match: &'static [UdeviceId],
    pub bind: Option<DevHook>,
    pub probe: Option<DevHook>,
    pub remove: Option<DevHook>,
    pub unbind: Option<DevHook>,
    /// Decode platform data from the device's node; runs at bind time.
    pub of_to_plat: Option<DevHook>,
    pub child_post_bind: Option<DevHook>,
    pub child_pre_probe: Option<DevHook>,
    pub child_post_remove: Option<DevHook>,
    /// Size of the private data allocated at probe.
    pub priv_auto: usize,
    /// Size of the platform data allocated at bind.
    pub plat_auto: usize,
    /// Size of the private data each child gets at probe.
    pub per_child_auto: usize,
    /// Size of the platform data each child gets at bind.
    pub per_child_plat_auto: usize,
    pub flags: DriverFlags,
    /// Operations table of the uclass this driver implements.
    pub ops: Option<&'static (dyn Any + Send + Sync)>,
}

impl Driver {
    pub const DEFAULT: Driver = Driver {
        name: "",
        id: UclassId::Invalid,
        of_match: &[],
        bind: None,
        probe: None,
        remove: None,
        unbind: None,
        of_to_plat: None,
        child_post_bind: None,
        child_pre_probe: None,
        child_post_remove: None,
        priv_auto: 0,
        plat_auto: 0,
        per_child_auto: 0,
        per_child_plat_auto: 0,
        flags: DriverFlags::empty(),
        ops: None,
    };

    /// The match-table entry for `compat`, if any.
    pub fn match_compatible(&self, compat: &str) -> Option<&'static UdeviceId> {
        self.of_match.iter().find(|id| id.compatible == compat)
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Declare a `static` [Driver] named after the driver, e.g. `declare_driver!(acme_uart { ... })`
/// defines `ACME_UART_DRIVER` with `name: "acme_uart"`. Omitted fields take their defaults.
#[macro_export]
macro_rules! declare_driver {
    ($name:ident { $($field:ident : $value:expr),* $(,)? }) => {
        $crate::paste::paste! {
            pub static [<$name:upper _DRIVER>]: $crate::driver::Driver = $crate::driver::Driver {
                name: stringify!($name),
                $($field: $value,)*
                ..$crate::driver::Driver::DEFAULT
            };
        }
    };
}

/// A device described by platform data instead of a tree node.
#[derive(Debug, Clone, Copy)]
pub struct DriverInfo {
    /// Name of the driver to bind; also used as the device name.
    pub name: &'static str,
    /// Initial platform data, copied into the device's platform data.
    pub plat: &'static [u8],
    /// Index of the parent entry in the same table, or the root when [None].
    pub parent_idx: Option<usize>,
}

impl DriverInfo {
    pub const fn new(name: &'static str) -> DriverInfo {
        DriverInfo {
            name,
            plat: &[],
            parent_idx: None,
        }
    }
}

/// Everything a build registers with the driver model.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmTables {
    pub drivers: &'static [&'static Driver],
    pub uclass_drivers: &'static [&'static UclassDriver],
    pub spies: &'static [&'static EventSpy],
    pub plat: &'static [DriverInfo],
}

/// Drivers of the build, indexed by name and compatible string.
pub struct DriverRegistry {
    drivers: Vec<&'static Driver>,
    /// Compatible string to indices into `drivers`, in table order.
    comp_map: BTreeMap<&'static str, Vec<usize>>,
}

impl DriverRegistry {
    pub fn new(drivers: &[&'static Driver]) -> DriverRegistry {
        let mut registry = DriverRegistry {
            drivers: Vec::with_capacity(drivers.len() + 2),
            comp_map: BTreeMap::new(),
        };
        for driver in [&ROOT_DRIVER, &SIMPLE_BUS_DRIVER].into_iter().chain(drivers.iter().copied()) {
            registry.register(driver);
        }
        registry
    }

    fn register(&mut self, driver: &'static Driver) {
        if self.lookup_name(driver.name).is_some() {
            log::warn!("Driver '{}' registered twice, keeping the first.", driver.name);
            return;
        }
        debug_ex!("\tRegistered driver '{}'.", driver.name);
        let idx = self.drivers.len();
        self.drivers.push(driver);
        for id in driver.of_match {
            self.comp_map.entry(id.compatible).or_default().push(idx);
        }
    }

    pub fn lookup_name(&self, name: &str) -> Option<&'static Driver> {
        self.drivers.iter().copied().find(|drv| drv.name == name)
    }

    /// First driver (in table order) matching the earliest possible entry of `compats`.
    pub fn find_by_compatible<'c>(
        &self,
        compats: impl IntoIterator<Item = &'c str>,
    ) -> Option<(&'static Driver, &'static UdeviceId)> {
        compats.into_iter().find_map(|compat| {
            let idx = *self.comp_map.get(compat)?.first()?;
            let driver = self.drivers[idx];
            Some((driver, driver.match_compatible(compat)?))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Driver> + '_ {
        self.drivers.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
