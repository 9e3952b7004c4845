//! Device graph: bound device instances and their bind/probe/remove/unbind lifecycle.
//!
//! Every device is owned by its parent's child list (the root by the [Dm] context). Parent and
//! uclass links are weak, so dropping a subtree from its parent releases it.
//!
//! No lock of the graph is held while a driver hook or an event subscriber runs; hooks may call
//! back into the [Dm] freely, including probing other devices.
use alloc::{boxed::Box, string::String, vec::Vec};
use bitflags::bitflags;
use core::{
    fmt, ptr,
    sync::atomic::{AtomicBool, Ordering},
};
use spin::{Mutex, RwLock};

use crate::{
    driver::{DevHook, Driver, DriverFlags},
    error::{DmError, HookStage},
    event::{EventData, EventType},
    handle::{Handle, HandleRef},
    ofnode::NodeRef,
    pool::PoolBuf,
    root::Dm,
    uclass::{Uclass, UclassId},
};

pub type DeviceHandle = Handle<Udevice>;
pub type DeviceRef = HandleRef<Udevice>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Detached from the graph; the handle outlived the device.
    Unbound,
    Bound,
    Probed,
    /// Removed but still bound; can be probed again.
    Removed,
}

/// Per-device data areas, each sized by a driver, uclass or parent declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSlot {
    /// Driver private data, allocated at probe.
    Priv,
    /// Uclass private data, allocated at probe.
    UclassPriv,
    /// Private data requested by the parent driver, allocated at probe.
    ParentPriv,
    /// Driver platform data, allocated at bind.
    Plat,
    /// Uclass platform data, allocated at bind.
    UclassPlat,
    /// Platform data requested by the parent driver, allocated at bind.
    ParentPlat,
}

const SLOT_COUNT: usize = 6;
const PROBE_SLOTS: [DataSlot; 3] = [DataSlot::Priv, DataSlot::UclassPriv, DataSlot::ParentPriv];

/// Types that can be copied in and out of device data byte for byte.
///
/// # Safety
///
/// Every bit pattern of the right size must be a valid value, and the type must not hold
/// references.
pub unsafe trait PlainData: Copy + 'static {}

macro_rules! plain_data {
    ($($ty:ty),*) => {
        $(unsafe impl PlainData for $ty {})*
    };
}

plain_data!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

unsafe impl<T: PlainData, const N: usize> PlainData for [T; N] {}

bitflags! {
    pub struct RemoveFlags: u32 {
        /// Remove every device.
        const NORMAL     = 1 << 0;
        /// Remove devices whose driver holds active DMA.
        const ACTIVE_DMA = 1 << 1;
        /// Remove devices whose driver must go before the OS starts.
        const OS_PREPARE = 1 << 2;
        /// Remove everything except vital devices.
        const NON_VITAL  = 1 << 3;
    }
}

impl RemoveFlags {
    /// Whether removal with these flags applies to a device of a driver flagged `drv_flags`.
    pub fn selects(self, drv_flags: DriverFlags) -> bool {
        if self.contains(RemoveFlags::NON_VITAL) && drv_flags.contains(DriverFlags::VITAL) {
            return false;
        }
        if self.intersects(RemoveFlags::NORMAL | RemoveFlags::NON_VITAL) {
            return true;
        }
        (self.contains(RemoveFlags::ACTIVE_DMA) && drv_flags.contains(DriverFlags::ACTIVE_DMA))
            || (self.contains(RemoveFlags::OS_PREPARE) && drv_flags.contains(DriverFlags::OS_PREPARE))
    }
}

/// A device instance.
pub struct Udevice {
    driver: &'static Driver,
    uclass: Handle<Uclass>,
    name: Box<str>,
    parent: Option<DeviceRef>,
    children: RwLock<Vec<DeviceHandle>>,
    node: NodeRef,
    seq: Option<u32>,
    driver_data: usize,
    state: Mutex<DeviceState>,
    activating: AtomicBool,
    data: Mutex<[Option<PoolBuf>; SLOT_COUNT]>,
}

impl Udevice {
    pub fn driver(&self) -> &'static Driver {
        self.driver
    }

    pub fn uclass(&self) -> &Handle<Uclass> {
        &self.uclass
    }

    pub fn uclass_id(&self) -> UclassId {
        self.uclass.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent device; [None] for the root.
    pub fn parent(&self) -> Option<DeviceHandle> {
        self.parent.as_ref().and_then(|parent| parent.get_handle())
    }

    pub fn node(&self) -> NodeRef {
        self.node
    }

    pub fn seq(&self) -> Option<u32> {
        self.seq
    }

    /// Match data of the compatible string the device was bound through.
    pub fn driver_data(&self) -> usize {
        self.driver_data
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock()
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock() = state;
    }

    pub fn is_probed(&self) -> bool {
        self.state() == DeviceState::Probed
    }

    /// Children in bind order.
    pub fn children(&self) -> Vec<DeviceHandle> {
        self.children.read().clone()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    pub fn find_child_by_name(&self, name: &str) -> Option<DeviceHandle> {
        self.children
            .read()
            .iter()
            .find(|child| child.name() == name)
            .cloned()
    }

    /// The driver's operations table as `T`.
    pub fn ops<T: 'static>(&self) -> Option<&'static T> {
        self.driver.ops?.downcast_ref::<T>()
    }

    pub fn has_data(&self, slot: DataSlot) -> bool {
        self.data.lock()[slot as usize].is_some()
    }

    /// Run `f` on the raw bytes of `slot`.
    ///
    /// The slot stays locked while `f` runs, so `f` must not call back into the device.
    pub fn with_data<R>(&self, slot: DataSlot, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, DmError> {
        let mut data = self.data.lock();
        let buf = data[slot as usize].as_mut().ok_or(DmError::NotFound)?;
        Ok(f(buf.as_mut_slice()))
    }

    pub fn read_data<T: PlainData>(&self, slot: DataSlot) -> Result<T, DmError> {
        self.with_data(slot, |bytes| {
            if bytes.len() < size_of::<T>() {
                return Err(DmError::NotSupported);
            }
            // SAFETY: the buffer holds at least `size_of::<T>()` bytes and any pattern is a valid T.
            Ok(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
        })?
    }

    pub fn write_data<T: PlainData>(&self, slot: DataSlot, value: T) -> Result<(), DmError> {
        self.with_data(slot, |bytes| {
            if bytes.len() < size_of::<T>() {
                return Err(DmError::NotSupported);
            }
            // SAFETY: the buffer holds at least `size_of::<T>()` writable bytes.
            unsafe { ptr::write_unaligned(bytes.as_mut_ptr() as *mut T, value) };
            Ok(())
        })?
    }

    fn release_slots(&self, slots: &[DataSlot]) {
        let mut data = self.data.lock();
        for slot in slots {
            data[*slot as usize] = None;
        }
    }

    fn release_all(&self) {
        self.data.lock().iter_mut().for_each(|slot| *slot = None);
    }
}

impl fmt::Debug for Udevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Udevice")
            .field("name", &self.name)
            .field("driver", &self.driver.name)
            .field("seq", &self.seq)
            .field("state", &self.state())
            .finish()
    }
}

impl Dm {
    fn run_hook(&self, hook: Option<DevHook>, dev: &DeviceHandle, stage: HookStage) -> Result<(), DmError> {
        let Some(hook) = hook else {
            return Ok(());
        };
        hook(self, dev).map_err(|err| {
            log::warn!("{}: {} failed: {}", dev.name(), stage.name(), err);
            DmError::HookFailed(stage)
        })
    }

    fn alloc_slot(&self, dev: &Udevice, slot: DataSlot, size: usize, init: &[u8]) -> Result<(), DmError> {
        let size = size.max(init.len());
        if size == 0 {
            return Ok(());
        }
        let mut buf = self.pool.alloc(size)?;
        buf.as_mut_slice()[..init.len()].copy_from_slice(init);
        dev.data.lock()[slot as usize] = Some(buf);
        Ok(())
    }

    /// Create a device for `drv` under `parent`, using the driver name as device name.
    pub fn bind(&self, parent: &DeviceHandle, drv: &'static Driver, node: NodeRef) -> Result<DeviceHandle, DmError> {
        self.bind_common(Some(parent), drv, drv.name, 0, node, &[])
    }

    pub fn bind_with_driver_data(
        &self,
        parent: &DeviceHandle,
        drv: &'static Driver,
        name: &str,
        driver_data: usize,
        node: NodeRef,
    ) -> Result<DeviceHandle, DmError> {
        self.bind_common(Some(parent), drv, name, driver_data, node, &[])
    }

    /// Bind the driver called `drv_name`, without a node.
    pub fn bind_by_name(&self, parent: &DeviceHandle, drv_name: &str, name: &str) -> Result<DeviceHandle, DmError> {
        let drv = self.drivers.lookup_name(drv_name).ok_or_else(|| {
            log::warn!("Cannot find driver '{}'.", drv_name);
            DmError::NotFound
        })?;
        self.bind_common(Some(parent), drv, name, 0, NodeRef::null(), &[])
    }

    pub(crate) fn bind_common(
        &self,
        parent: Option<&DeviceHandle>,
        drv: &'static Driver,
        name: &str,
        driver_data: usize,
        node: NodeRef,
        plat: &[u8],
    ) -> Result<DeviceHandle, DmError> {
        let uc = self.uclass_get(drv.id)?;
        if !node.is_null()
            && uc
                .devices()
                .iter()
                .any(|dev| dev.node() == node && ptr::eq(dev.driver(), drv))
        {
            return Err(DmError::AlreadyBound);
        }
        let dev = DeviceHandle::from(Udevice {
            driver: drv,
            uclass: uc.clone(),
            name: Box::from(name),
            parent: parent.map(|parent| parent.create_ref()),
            children: RwLock::new(Vec::new()),
            node,
            seq: self.assign_seq(&uc, node),
            driver_data,
            state: Mutex::new(DeviceState::Unbound),
            activating: AtomicBool::new(false),
            data: Mutex::new(Default::default()),
        });

        let allocated = self
            .alloc_slot(&dev, DataSlot::Plat, drv.plat_auto, plat)
            .and_then(|_| self.alloc_slot(&dev, DataSlot::UclassPlat, uc.driver().per_device_plat_auto, &[]))
            .and_then(|_| match parent {
                Some(parent) => self.alloc_slot(&dev, DataSlot::ParentPlat, parent.driver().per_child_plat_auto, &[]),
                None => Ok(()),
            });
        if let Err(err) = allocated {
            dev.release_all();
            return Err(err);
        }

        if let Some(parent) = parent {
            parent.children.write().push(dev.clone());
        }
        uc.devices.write().push(dev.create_ref());
        dev.set_state(DeviceState::Bound);
        debug_ex!("Bound '{}' to driver '{}' (seq {:?}).", dev.name(), drv.name, dev.seq());

        let mut bound = false;
        if let Err(err) = self.bind_hooks(&dev, parent, &mut bound) {
            if bound {
                if let Some(unbind) = drv.unbind {
                    if let Err(unbind_err) = unbind(self, &dev) {
                        log::warn!("{}: unbind after failed bind: {}", dev.name(), unbind_err);
                    }
                }
            }
            for child in dev.children() {
                if let Err(child_err) = self.device_unbind(&child) {
                    log::warn!("{}: cannot unbind child '{}': {}", dev.name(), child.name(), child_err);
                }
            }
            self.unlink(&dev);
            dev.release_all();
            dev.set_state(DeviceState::Unbound);
            return Err(err);
        }
        Ok(dev)
    }

    fn bind_hooks(&self, dev: &DeviceHandle, parent: Option<&DeviceHandle>, bound: &mut bool) -> Result<(), DmError> {
        let drv = dev.driver();
        if !dev.node().is_null() {
            self.run_hook(drv.of_to_plat, dev, HookStage::OfToPlat)?;
        }
        self.run_hook(drv.bind, dev, HookStage::Bind)?;
        *bound = true;
        if let Some(parent) = parent {
            self.run_hook(parent.driver().child_post_bind, dev, HookStage::ChildPostBind)?;
        }
        self.run_hook(dev.uclass().driver().post_bind, dev, HookStage::PostBind)
    }

    fn unlink(&self, dev: &DeviceHandle) {
        dev.uclass().devices.write().retain(|other| !dev.is(other));
        if let Some(parent) = dev.parent() {
            parent.children.write().retain(|child| child != dev);
        }
    }

    /// Probe `dev`, and before it every ancestor.
    ///
    /// Probing a probed device, or one whose probe is already under way further up the call
    /// stack, succeeds without running anything.
    pub fn device_probe(&self, dev: &DeviceHandle) -> Result<(), DmError> {
        match dev.state() {
            DeviceState::Probed => return Ok(()),
            DeviceState::Unbound => return Err(DmError::NotFound),
            DeviceState::Bound | DeviceState::Removed => {}
        }
        if dev.activating.load(Ordering::Acquire) {
            return Ok(());
        }

        self.notify_dev(EventType::DmPreProbe, dev, 0)?;

        let parent = dev.parent();
        if let Some(parent) = &parent {
            self.device_probe(parent)?;
            if !parent.is_probed() && !parent.activating.load(Ordering::Acquire) {
                return Err(DmError::ParentNotProbed);
            }
            // The parent's probe may have probed us already.
            if dev.is_probed() {
                return Ok(());
            }
        }

        dev.activating.store(true, Ordering::Release);
        let res = self.probe_hooks(dev, parent.as_ref());
        dev.activating.store(false, Ordering::Release);
        if let Err(err) = res {
            // Children probed from inside the failed hook cannot outlive it.
            for child in dev.children().iter().filter(|child| child.is_probed()) {
                if let Err(child_err) = self.device_remove(child, RemoveFlags::NORMAL) {
                    log::warn!("{}: cannot remove child '{}': {}", dev.name(), child.name(), child_err);
                }
            }
            dev.release_slots(&PROBE_SLOTS);
            dev.set_state(DeviceState::Bound);
            return Err(err);
        }
        dev.set_state(DeviceState::Probed);
        debug_ex!("Probed '{}'.", dev.name());

        self.notify_dev(EventType::DmPostProbe, dev, 0)
    }

    fn probe_hooks(&self, dev: &DeviceHandle, parent: Option<&DeviceHandle>) -> Result<(), DmError> {
        let drv = dev.driver();
        let uc_drv = dev.uclass().driver();
        self.alloc_slot(dev, DataSlot::Priv, drv.priv_auto, &[])?;
        self.alloc_slot(dev, DataSlot::UclassPriv, uc_drv.per_device_auto, &[])?;
        if let Some(parent) = parent {
            self.alloc_slot(dev, DataSlot::ParentPriv, parent.driver().per_child_auto, &[])?;
        }

        self.run_hook(uc_drv.pre_probe, dev, HookStage::PreProbe)?;
        if let Some(parent) = parent {
            self.run_hook(parent.driver().child_pre_probe, dev, HookStage::ChildPreProbe)?;
        }
        self.run_hook(drv.probe, dev, HookStage::Probe)?;
        if let Err(err) = self.run_hook(uc_drv.post_probe, dev, HookStage::PostProbe) {
            if let Some(remove) = drv.remove {
                if let Err(remove_err) = remove(self, dev) {
                    log::warn!("{}: remove after failed post_probe: {}", dev.name(), remove_err);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Remove `dev` and its subtree, children first.
    ///
    /// A device not selected by `flags` is left alone together with its whole subtree and the
    /// call returns [DmError::Rejected]; a rejected child makes its parent rejected too. Failing
    /// remove hooks are logged and removal carries on.
    pub fn device_remove(&self, dev: &DeviceHandle, flags: RemoveFlags) -> Result<(), DmError> {
        if !dev.is_probed() {
            return Ok(());
        }
        let drv = dev.driver();
        if !flags.selects(drv.flags) {
            debug_ex!("Not removing '{}' with flags {:?}.", dev.name(), flags);
            return Err(DmError::Rejected);
        }

        self.notify_dev(EventType::DmPreRemove, dev, 0)?;

        let mut rejected = false;
        for child in dev.children() {
            match self.device_remove(&child, flags) {
                Ok(()) => {}
                Err(DmError::Rejected) => rejected = true,
                Err(err) => return Err(err),
            }
        }
        if rejected {
            log::warn!("Keeping '{}': a child was not removed.", dev.name());
            return Err(DmError::Rejected);
        }

        if let Some(pre_remove) = dev.uclass().driver().pre_remove {
            if let Err(err) = pre_remove(self, dev) {
                log::warn!("{}: uclass pre_remove failed: {}", dev.name(), err);
            }
        }
        let result = match drv.remove {
            Some(remove) => remove(self, dev),
            None => Ok(()),
        };
        if let Err(err) = result {
            log::warn!("{}: remove failed: {}", dev.name(), err);
        }
        if let Some(parent) = dev.parent() {
            if let Some(child_post_remove) = parent.driver().child_post_remove {
                if let Err(err) = child_post_remove(self, dev) {
                    log::warn!("{}: child_post_remove failed: {}", dev.name(), err);
                }
            }
        }

        dev.release_slots(&PROBE_SLOTS);
        dev.set_state(DeviceState::Removed);
        debug_ex!("Removed '{}'.", dev.name());

        let code = result.err().map_or(0, |err| err.errno());
        self.notify_dev(EventType::DmPostRemove, dev, code)
    }

    /// Detach `dev` and its subtree from the graph and release their data.
    ///
    /// A probed device must be removed first.
    pub fn device_unbind(&self, dev: &DeviceHandle) -> Result<(), DmError> {
        match dev.state() {
            DeviceState::Probed => return Err(DmError::Active),
            DeviceState::Unbound => return Err(DmError::NotFound),
            DeviceState::Bound | DeviceState::Removed => {}
        }
        self.run_hook(dev.driver().unbind, dev, HookStage::Unbind)?;

        let mut first_err = None;
        for child in dev.children() {
            if let Err(err) = self.device_unbind(&child) {
                log::warn!("{}: cannot unbind child '{}': {}", dev.name(), child.name(), err);
                first_err.get_or_insert(err);
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        self.run_hook(dev.uclass().driver().pre_unbind, dev, HookStage::Unbind)?;

        self.unlink(dev);
        dev.release_all();
        dev.set_state(DeviceState::Unbound);
        debug_ex!("Unbound '{}'.", dev.name());
        Ok(())
    }

    /// The `index`-th child of `dev`, probed.
    pub fn get_child(&self, dev: &DeviceHandle, index: usize) -> Result<DeviceHandle, DmError> {
        let child = dev.children().into_iter().nth(index).ok_or(DmError::NotFound)?;
        self.device_probe(&child)?;
        Ok(child)
    }

    /// The parent of `dev`, probed.
    pub fn get_parent(&self, dev: &DeviceHandle) -> Result<DeviceHandle, DmError> {
        let parent = dev.parent().ok_or(DmError::NotFound)?;
        self.device_probe(&parent)?;
        Ok(parent)
    }

    fn notify_dev(&self, ty: EventType, dev: &DeviceHandle, result: i32) -> Result<(), DmError> {
        self.events.notify(
            ty,
            EventData::Dm {
                dev: dev.clone(),
                result,
            },
        )
    }

    /// Path of `dev` in the device graph, e.g. `/soc/serial@100`; the root device is `/`.
    pub fn device_path(&self, dev: &DeviceHandle) -> String {
        let mut names = Vec::new();
        let mut cur = dev.clone();
        while let Some(parent) = cur.parent() {
            names.push(String::from(cur.name()));
            cur = parent;
        }
        let mut path = String::new();
        for name in names.iter().rev() {
            path.push('/');
            path.push_str(name);
        }
        if path.is_empty() {
            path.push('/');
        }
        path
    }
}
