//! Driver model: binds drivers to devices described by a device tree or by platform data,
//! probes them on demand and tears them down in order.
//!
//! Everything hangs off one [Dm] context. Drivers and uclass drivers are plain `static`
//! descriptors collected into [DmTables]; the [Dm::scan] family walks the control tree and
//! creates bound devices; lookups such as [Dm::uclass_get_device] probe on demand; lifecycle
//! transitions are published on the [event::EventBus].
#![no_std]
extern crate alloc;

#[doc(hidden)]
pub use paste;

#[macro_use]
pub mod logging;

pub mod config;
pub mod device;
pub mod driver;
pub mod dump;
pub mod error;
pub mod event;
pub mod global;
pub mod handle;
pub mod lists;
pub mod ofnode;
pub mod pool;
pub mod root;
pub mod uclass;

pub use crate::config::DmConfig;
pub use device::{DataSlot, DeviceHandle, DeviceRef, DeviceState, PlainData, RemoveFlags, Udevice};
pub use driver::{DmTables, Driver, DriverFlags, DriverInfo, UdeviceId};
pub use error::{DmError, HookStage};
pub use event::{Event, EventBus, EventData, EventSpy, EventType, SpyFn, SpyHandle};
pub use ofnode::{NodeRef, OfNode, OfTrees, Resource};
pub use root::Dm;
pub use uclass::{Uclass, UclassDriver, UclassFlags, UclassId};
