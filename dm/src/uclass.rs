//! Uclass registry: capability classes and the devices that belong to them.
//!
//! A [Uclass] is created the first time anything references its id and lives until
//! [Dm::uclass_destroy] or [Dm::uninit]. It lists its member devices in bind order through weak
//! references; the device graph owns the devices.
//!
//! Lookups come in two flavours: `find` variants never probe, `get` variants probe the device
//! they return.
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use num_enum::FromPrimitive;
use spin::{Mutex, RwLock};

use crate::{
    device::{DeviceHandle, DeviceRef, RemoveFlags},
    driver::DevHook,
    error::DmError,
    handle::Handle,
    ofnode::NodeRef,
    pool::PoolBuf,
    root::Dm,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u32)]
pub enum UclassId {
    Root = 0,
    SimpleBus = 1,
    Test = 2,
    TestFdt = 3,
    TestBus = 4,
    Serial = 5,
    Gpio = 6,
    Clk = 7,
    Mmc = 8,
    Timer = 9,
    Misc = 10,
    PowerDomain = 11,
    Regulator = 12,
    Firmware = 13,
    #[default]
    Invalid = u32::MAX,
}

impl UclassId {
    pub fn name(self) -> &'static str {
        match self {
            UclassId::Root => "root",
            UclassId::SimpleBus => "simple_bus",
            UclassId::Test => "test",
            UclassId::TestFdt => "testfdt",
            UclassId::TestBus => "testbus",
            UclassId::Serial => "serial",
            UclassId::Gpio => "gpio",
            UclassId::Clk => "clk",
            UclassId::Mmc => "mmc",
            UclassId::Timer => "timer",
            UclassId::Misc => "misc",
            UclassId::PowerDomain => "power_domain",
            UclassId::Regulator => "regulator",
            UclassId::Firmware => "firmware",
            UclassId::Invalid => "invalid",
        }
    }
}

bitflags! {
    pub struct UclassFlags: u32 {
        /// `/aliases` entries named after the uclass fix sequence numbers.
        const SEQ_ALIAS   = 1 << 0;
        /// Devices only get a sequence number from an alias.
        const NO_AUTO_SEQ = 1 << 1;
    }
}

/// Class-wide callback run on the uclass itself.
pub type UclassHook = fn(&Dm, &Handle<Uclass>) -> Result<(), DmError>;

/// Build-time uclass descriptor.
pub struct UclassDriver {
    /// Also the stem of the aliases that number this class, e.g. `serial` for `serial1`.
    pub name: &'static str,
    pub id: UclassId,
    pub init: Option<UclassHook>,
    pub destroy: Option<UclassHook>,
    pub post_bind: Option<DevHook>,
    pub pre_unbind: Option<DevHook>,
    pub pre_probe: Option<DevHook>,
    pub post_probe: Option<DevHook>,
    pub pre_remove: Option<DevHook>,
    /// Size of the uclass private data, allocated when the uclass is created.
    pub priv_auto: usize,
    /// Size of the uclass private data of each device, allocated at probe.
    pub per_device_auto: usize,
    /// Size of the uclass platform data of each device, allocated at bind.
    pub per_device_plat_auto: usize,
    pub flags: UclassFlags,
}

impl UclassDriver {
    pub const DEFAULT: UclassDriver = UclassDriver {
        name: "",
        id: UclassId::Invalid,
        init: None,
        destroy: None,
        post_bind: None,
        pre_unbind: None,
        pre_probe: None,
        post_probe: None,
        pre_remove: None,
        priv_auto: 0,
        per_device_auto: 0,
        per_device_plat_auto: 0,
        flags: UclassFlags::empty(),
    };
}

impl fmt::Debug for UclassDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UclassDriver")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// Declare a `static` [UclassDriver], e.g. `uclass_driver!(serial { id: UclassId::Serial })`
/// defines `SERIAL_UCLASS` named `"serial"`.
#[macro_export]
macro_rules! uclass_driver {
    ($name:ident { $($field:ident : $value:expr),* $(,)? }) => {
        $crate::paste::paste! {
            pub static [<$name:upper _UCLASS>]: $crate::uclass::UclassDriver = $crate::uclass::UclassDriver {
                name: stringify!($name),
                $($field: $value,)*
                ..$crate::uclass::UclassDriver::DEFAULT
            };
        }
    };
}

/// Runtime instance of a uclass.
pub struct Uclass {
    drv: &'static UclassDriver,
    pub(crate) devices: RwLock<Vec<DeviceRef>>,
    pub(crate) priv_data: Mutex<Option<PoolBuf>>,
}

impl Uclass {
    pub(crate) fn new(drv: &'static UclassDriver) -> Uclass {
        Uclass {
            drv,
            devices: RwLock::new(Vec::new()),
            priv_data: Mutex::new(None),
        }
    }

    pub fn driver(&self) -> &'static UclassDriver {
        self.drv
    }

    pub fn id(&self) -> UclassId {
        self.drv.id
    }

    pub fn name(&self) -> &'static str {
        self.drv.name
    }

    /// Member devices in bind order.
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.devices
            .read()
            .iter()
            .filter_map(|dev| dev.get_handle())
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Run `f` on the uclass private data. Returns [DmError::NotFound] if the uclass declares none.
    pub fn with_priv<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, DmError> {
        let mut slot = self.priv_data.lock();
        let buf = slot.as_mut().ok_or(DmError::NotFound)?;
        Ok(f(buf.as_mut_slice()))
    }
}

impl fmt::Debug for Uclass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uclass")
            .field("name", &self.drv.name)
            .field("devices", &self.device_count())
            .finish()
    }
}

impl Dm {
    /// The uclass for `id`, created (and its `init` hook run) on first reference.
    pub fn uclass_get(&self, id: UclassId) -> Result<Handle<Uclass>, DmError> {
        if let Some(uc) = self.uclass_find(id) {
            return Ok(uc);
        }
        let Some(drv) = self.uclass_drivers.iter().copied().find(|drv| drv.id == id) else {
            log::warn!("Cannot find uclass for id {:?}.", id);
            return Err(DmError::NotFound);
        };
        let uc = Handle::from(Uclass::new(drv));
        if drv.priv_auto > 0 {
            *uc.priv_data.lock() = Some(self.pool.alloc(drv.priv_auto)?);
        }
        self.uclasses.write().push(uc.clone());
        if let Some(init) = drv.init {
            if let Err(err) = init(self, &uc) {
                log::warn!("Uclass '{}' init failed: {}", drv.name, err);
                self.uclasses.write().retain(|other| *other != uc);
                uc.priv_data.lock().take();
                return Err(err);
            }
        }
        debug_ex!("Created uclass '{}'.", drv.name);
        Ok(uc)
    }

    /// The uclass for `id` if it exists already.
    pub fn uclass_find(&self, id: UclassId) -> Option<Handle<Uclass>> {
        self.uclasses.read().iter().find(|uc| uc.id() == id).cloned()
    }

    /// Id of the registered uclass driver called `name`.
    pub fn uclass_get_by_name(&self, name: &str) -> Option<UclassId> {
        self.uclass_drivers
            .iter()
            .find(|drv| drv.name == name)
            .map(|drv| drv.id)
    }

    /// Remove and unbind every member, run `destroy` and forget the uclass.
    pub fn uclass_destroy(&self, id: UclassId) -> Result<(), DmError> {
        let Some(uc) = self.uclass_find(id) else {
            return Ok(());
        };
        for dev in uc.devices() {
            self.device_remove(&dev, RemoveFlags::NORMAL)?;
            self.device_unbind(&dev)?;
        }
        if let Some(destroy) = uc.drv.destroy {
            destroy(self, &uc)?;
        }
        uc.priv_data.lock().take();
        self.uclasses.write().retain(|other| *other != uc);
        Ok(())
    }

    /// Ids of the uclasses created so far, in creation order.
    pub fn uclass_ids(&self) -> Vec<UclassId> {
        self.uclasses.read().iter().map(|uc| uc.id()).collect()
    }

    /// Sequence number for a device about to join `uc`.
    ///
    /// An alias for the node wins unless another member already holds that number; otherwise
    /// the next number above every alias and every existing member is used.
    pub(crate) fn assign_seq(&self, uc: &Uclass, node: NodeRef) -> Option<u32> {
        let by_alias = self.config.seq_alias && uc.drv.flags.contains(UclassFlags::SEQ_ALIAS);
        let taken: Vec<u32> = uc.devices().iter().filter_map(|dev| dev.seq()).collect();
        let trees = self.trees();
        if by_alias && !node.is_null() {
            if let Some(seq) = trees.alias_seq(uc.drv.name, node) {
                if !taken.contains(&seq) {
                    return Some(seq);
                }
                log::warn!("Alias {}{} is already taken.", uc.drv.name, seq);
            }
        }
        if uc.drv.flags.contains(UclassFlags::NO_AUTO_SEQ) {
            return None;
        }
        let highest_alias = by_alias.then(|| trees.alias_highest_id(uc.drv.name)).flatten();
        match taken.into_iter().chain(highest_alias).max() {
            None => Some(0),
            Some(max) => {
                let next = max.checked_add(1);
                if next.is_none() {
                    log::warn!("No sequence number left in uclass {}.", uc.drv.name);
                }
                next
            }
        }
    }

    pub fn uclass_devices(&self, id: UclassId) -> Vec<DeviceHandle> {
        self.uclass_find(id).map(|uc| uc.devices()).unwrap_or_default()
    }

    pub fn uclass_id_count(&self, id: UclassId) -> usize {
        self.uclass_find(id).map_or(0, |uc| uc.device_count())
    }

    fn uclass_find_by(
        &self,
        id: UclassId,
        pred: impl Fn(&DeviceHandle) -> bool,
    ) -> Result<DeviceHandle, DmError> {
        let uc = self.uclass_get(id)?;
        uc.devices().into_iter().find(pred).ok_or(DmError::NotFound)
    }

    /// The `index`-th member of the uclass, without probing it.
    pub fn uclass_find_device(&self, id: UclassId, index: usize) -> Result<DeviceHandle, DmError> {
        let uc = self.uclass_get(id)?;
        uc.devices().into_iter().nth(index).ok_or(DmError::NotFound)
    }

    pub fn uclass_find_device_by_seq(&self, id: UclassId, seq: u32) -> Result<DeviceHandle, DmError> {
        self.uclass_find_by(id, |dev| dev.seq() == Some(seq))
    }

    pub fn uclass_find_device_by_name(&self, id: UclassId, name: &str) -> Result<DeviceHandle, DmError> {
        self.uclass_find_by(id, |dev| dev.name() == name)
    }

    pub fn uclass_find_device_by_ofnode(&self, id: UclassId, node: NodeRef) -> Result<DeviceHandle, DmError> {
        if node.is_null() {
            return Err(DmError::NotFound);
        }
        self.uclass_find_by(id, |dev| dev.node() == node)
    }

    pub fn uclass_find_first_device(&self, id: UclassId) -> Option<DeviceHandle> {
        self.uclass_find_device(id, 0).ok()
    }

    /// The member bound after `dev` in its uclass.
    pub fn uclass_find_next_device(&self, dev: &DeviceHandle) -> Option<DeviceHandle> {
        let devices = dev.uclass().devices();
        let pos = devices.iter().position(|other| other == dev)?;
        devices.into_iter().nth(pos + 1)
    }

    fn probed(&self, dev: Result<DeviceHandle, DmError>) -> Result<DeviceHandle, DmError> {
        let dev = dev?;
        self.device_probe(&dev)?;
        Ok(dev)
    }

    /// The `index`-th member of the uclass, probed.
    pub fn uclass_get_device(&self, id: UclassId, index: usize) -> Result<DeviceHandle, DmError> {
        self.probed(self.uclass_find_device(id, index))
    }

    pub fn uclass_get_device_by_seq(&self, id: UclassId, seq: u32) -> Result<DeviceHandle, DmError> {
        self.probed(self.uclass_find_device_by_seq(id, seq))
    }

    pub fn uclass_get_device_by_name(&self, id: UclassId, name: &str) -> Result<DeviceHandle, DmError> {
        self.probed(self.uclass_find_device_by_name(id, name))
    }

    pub fn uclass_get_device_by_ofnode(&self, id: UclassId, node: NodeRef) -> Result<DeviceHandle, DmError> {
        self.probed(self.uclass_find_device_by_ofnode(id, node))
    }

    /// The member of `id` bound to the node that `dev`'s property `name` points at, probed.
    pub fn uclass_get_device_by_phandle(
        &self,
        id: UclassId,
        dev: &DeviceHandle,
        name: &str,
    ) -> Result<DeviceHandle, DmError> {
        let target = self.trees().node(dev.node()).read_phandle(name)?.node_ref();
        self.uclass_get_device_by_ofnode(id, target)
    }

    fn first_probed_from(&self, devices: impl IntoIterator<Item = DeviceHandle>) -> Option<DeviceHandle> {
        devices.into_iter().find(|dev| match self.device_probe(dev) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Skipping '{}': probe failed: {}", dev.name(), err);
                false
            }
        })
    }

    /// First member of the uclass that probes successfully.
    pub fn uclass_first_device(&self, id: UclassId) -> Option<DeviceHandle> {
        self.first_probed_from(self.uclass_devices(id))
    }

    /// Next member after `dev` that probes successfully.
    pub fn uclass_next_device(&self, dev: &DeviceHandle) -> Option<DeviceHandle> {
        let devices = dev.uclass().devices();
        let pos = devices.iter().position(|other| other == dev)?;
        self.first_probed_from(devices.into_iter().skip(pos + 1))
    }

    /// Any device bound to `node`, searching the whole graph depth-first.
    pub fn device_find_global_by_ofnode(&self, node: NodeRef) -> Option<DeviceHandle> {
        if node.is_null() {
            return None;
        }
        let mut stack = Vec::from_iter(self.root());
        while let Some(dev) = stack.pop() {
            if dev.node() == node {
                return Some(dev);
            }
            stack.extend(dev.children().into_iter().rev());
        }
        None
    }

    /// The device bound to the node at `path` (absolute or alias-relative), probed.
    pub fn get_device_by_path(&self, path: &str) -> Result<DeviceHandle, DmError> {
        let node = self.trees().path(path).node_ref();
        let dev = self.device_find_global_by_ofnode(node).ok_or(DmError::NotFound)?;
        self.device_probe(&dev)?;
        Ok(dev)
    }
}
