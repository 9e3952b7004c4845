//! Event/spy bus.
//!
//! Subscribers ("spies") are called synchronously by [EventBus::notify]: first the static ones
//! from [DmTables](crate::DmTables), in table order, then the dynamic ones in registration
//! order. The first subscriber that fails stops delivery and its error is returned to the
//! publisher.
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use spin::RwLock;

use crate::{device::DeviceHandle, error::DmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum EventType {
    Test = 0,
    /// Driver model is ready before relocation.
    DmPostInitF,
    /// Driver model is ready after relocation.
    DmPostInitR,
    DmPreProbe,
    DmPostProbe,
    DmPreRemove,
    DmPostRemove,
    MiscInitF,
    LastStageInit,
    /// The tree handed to the OS is being fixed up.
    FtFixup,
    MainLoop,
}

impl EventType {
    pub fn name(self) -> &'static str {
        match self {
            EventType::Test => "test",
            EventType::DmPostInitF => "dm_post_init_f",
            EventType::DmPostInitR => "dm_post_init_r",
            EventType::DmPreProbe => "dm_pre_probe",
            EventType::DmPostProbe => "dm_post_probe",
            EventType::DmPreRemove => "dm_pre_remove",
            EventType::DmPostRemove => "dm_post_remove",
            EventType::MiscInitF => "misc_init_f",
            EventType::LastStageInit => "last_stage_init",
            EventType::FtFixup => "ft_fixup",
            EventType::MainLoop => "main_loop",
        }
    }
}

/// Payload of an event; the variant is fixed by the event type.
#[derive(Debug, Clone)]
pub enum EventData {
    None,
    Test { signal: i32 },
    /// Device lifecycle events. `result` is the status of the transition (0 on success).
    Dm { dev: DeviceHandle, result: i32 },
    FtFixup { tree_id: u32 },
}

#[derive(Debug, Clone)]
pub struct Event {
    pub ty: EventType,
    pub data: EventData,
}

#[derive(Clone, Copy)]
pub enum SpyFn {
    Full(fn(&Event) -> Result<(), DmError>),
    /// Spy that does not look at the event.
    Simple(fn() -> Result<(), DmError>),
}

impl SpyFn {
    fn call(self, event: &Event) -> Result<(), DmError> {
        match self {
            SpyFn::Full(f) => f(event),
            SpyFn::Simple(f) => f(),
        }
    }
}

impl fmt::Debug for SpyFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpyFn::Full(_) => f.write_str("SpyFn::Full"),
            SpyFn::Simple(_) => f.write_str("SpyFn::Simple"),
        }
    }
}

/// Build-time subscription.
#[derive(Debug)]
pub struct EventSpy {
    pub id: &'static str,
    pub ty: EventType,
    pub func: SpyFn,
}

/// Declare a `static` [EventSpy] calling `func` for `ty`; the static is named
/// `<FUNC>_SPY`. Use the `simple` form for functions without arguments.
#[macro_export]
macro_rules! event_spy {
    ($ty:expr, $func:ident) => {
        $crate::paste::paste! {
            pub static [<$func:upper _SPY>]: $crate::event::EventSpy = $crate::event::EventSpy {
                id: stringify!($func),
                ty: $ty,
                func: $crate::event::SpyFn::Full($func),
            };
        }
    };
    (simple $ty:expr, $func:ident) => {
        $crate::paste::paste! {
            pub static [<$func:upper _SPY>]: $crate::event::EventSpy = $crate::event::EventSpy {
                id: stringify!($func),
                ty: $ty,
                func: $crate::event::SpyFn::Simple($func),
            };
        }
    };
}

type DynSpyFn = dyn Fn(&Event) -> Result<(), DmError> + Send + Sync;

/// Identifies a dynamic subscription for [EventBus::unregister].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpyHandle(usize);

struct DynSpy {
    handle: SpyHandle,
    id: String,
    ty: EventType,
    func: Box<DynSpyFn>,
}

pub struct EventBus {
    spies: &'static [&'static EventSpy],
    dynamic: RwLock<Vec<Arc<DynSpy>>>,
    dynamic_enabled: bool,
    next_handle: AtomicUsize,
}

impl EventBus {
    pub fn new(spies: &'static [&'static EventSpy], dynamic_enabled: bool) -> EventBus {
        EventBus {
            spies,
            dynamic: RwLock::new(Vec::new()),
            dynamic_enabled,
            next_handle: AtomicUsize::new(0),
        }
    }

    /// Subscribe `func` to `ty` at runtime; the closure carries whatever context it needs.
    pub fn register(
        &self,
        id: &str,
        ty: EventType,
        func: impl Fn(&Event) -> Result<(), DmError> + Send + Sync + 'static,
    ) -> Result<SpyHandle, DmError> {
        if !self.dynamic_enabled {
            log::warn!("Dynamic events are disabled, cannot register spy '{}'.", id);
            return Err(DmError::NotSupported);
        }
        let handle = SpyHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.dynamic.write().push(Arc::new(DynSpy {
            handle,
            id: String::from(id),
            ty,
            func: Box::new(func),
        }));
        debug_ex!("Registered spy '{}' for event '{}'.", id, ty.name());
        Ok(handle)
    }

    pub fn unregister(&self, handle: SpyHandle) -> Result<(), DmError> {
        let mut dynamic = self.dynamic.write();
        let pos = dynamic
            .iter()
            .position(|spy| spy.handle == handle)
            .ok_or(DmError::NotFound)?;
        dynamic.remove(pos);
        Ok(())
    }

    pub fn unregister_all(&self) {
        self.dynamic.write().clear();
    }

    pub fn dynamic_count(&self) -> usize {
        self.dynamic.read().len()
    }

    /// Deliver an event to every subscriber of `ty`.
    pub fn notify(&self, ty: EventType, data: EventData) -> Result<(), DmError> {
        let event = Event { ty, data };
        for spy in self.spies.iter().filter(|spy| spy.ty == ty) {
            debug_ex!("Sending event '{}' to spy '{}'.", ty.name(), spy.id);
            spy.func.call(&event).inspect_err(|err| {
                log::warn!("Spy '{}' failed on event '{}': {}", spy.id, ty.name(), err);
            })?;
        }
        // Subscribers may register or unregister while being called.
        let dynamic: Vec<Arc<DynSpy>> = self
            .dynamic
            .read()
            .iter()
            .filter(|spy| spy.ty == ty)
            .cloned()
            .collect();
        for spy in dynamic {
            debug_ex!("Sending event '{}' to spy '{}'.", ty.name(), spy.id);
            (spy.func)(&event).inspect_err(|err| {
                log::warn!("Spy '{}' failed on event '{}': {}", spy.id, ty.name(), err);
            })?;
        }
        Ok(())
    }

    pub fn notify_null(&self, ty: EventType) -> Result<(), DmError> {
        self.notify(ty, EventData::None)
    }

    /// Deliver an event given by its raw type number.
    ///
    /// An unknown number is a programming error: it asserts in debug builds and is dropped
    /// otherwise.
    pub fn notify_raw(&self, ty: u32, data: EventData) -> Result<(), DmError> {
        match EventType::try_from(ty) {
            Ok(ty) => self.notify(ty, data),
            Err(_) => {
                debug_assert!(false, "unknown event type {}", ty);
                log::warn!("Dropping event of unknown type {}.", ty);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("static", &self.spies.len())
            .field("dynamic", &self.dynamic_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicI32;

    static STATIC_CALLS: AtomicI32 = AtomicI32::new(0);

    fn count_test(event: &Event) -> Result<(), DmError> {
        if let EventData::Test { signal } = event.data {
            STATIC_CALLS.fetch_add(signal, Ordering::SeqCst);
        }
        Ok(())
    }

    event_spy!(EventType::Test, count_test);

    #[test]
    fn static_before_dynamic() {
        static SPIES: [&EventSpy; 1] = [&COUNT_TEST_SPY];
        let bus = EventBus::new(&SPIES, true);
        let seen = Arc::new(AtomicI32::new(0));
        let seen2 = seen.clone();
        bus.register("check", EventType::Test, move |_| {
            seen2.store(STATIC_CALLS.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        bus.notify(EventType::Test, EventData::Test { signal: 3 }).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        bus.notify(EventType::MainLoop, EventData::Test { signal: 3 }).unwrap();
        assert_eq!(STATIC_CALLS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn unregister_by_handle() {
        let bus = EventBus::new(&[], true);
        let first = bus.register("a", EventType::Test, |_| Err(DmError::Driver(-1))).unwrap();
        bus.register("b", EventType::Test, |_| Ok(())).unwrap();
        assert_eq!(bus.notify_null(EventType::Test), Err(DmError::Driver(-1)));
        bus.unregister(first).unwrap();
        assert_eq!(bus.unregister(first), Err(DmError::NotFound));
        assert_eq!(bus.notify_null(EventType::Test), Ok(()));
        assert_eq!(bus.dynamic_count(), 1);
        bus.unregister_all();
        assert_eq!(bus.dynamic_count(), 0);
    }

    #[test]
    fn raw_types_map_to_known_events() {
        let bus = EventBus::new(&[], true);
        let hits = Arc::new(AtomicI32::new(0));
        let counter = hits.clone();
        bus.register("raw", EventType::FtFixup, move |event| {
            assert!(matches!(event.data, EventData::FtFixup { tree_id: 1 }));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        bus.notify_raw(u32::from(EventType::FtFixup), EventData::FtFixup { tree_id: 1 })
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "unknown event type"))]
    fn unknown_raw_type_is_a_bug() {
        let bus = EventBus::new(&[], true);
        assert_eq!(bus.notify_raw(1000, EventData::None), Ok(()));
    }
}
