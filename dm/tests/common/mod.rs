//! Test uclasses, drivers and trees shared by the scenario tests.
#![allow(dead_code)]

use std::{
    cell::RefCell,
    fmt,
    string::String,
    sync::atomic::{AtomicBool, Ordering},
    vec::Vec,
};

use dm::{
    DataSlot, DeviceHandle, Dm, DmConfig, DmError, DmTables, Driver, DriverFlags, DriverInfo, OfTrees, UclassFlags,
    UclassId, UdeviceId, declare_driver, logging::LogSink, uclass_driver,
};
use dt::fdt::FdtWriter;

thread_local! {
    static TRACE: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    static LOG: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Record a hook call as `"<hook> <device>"`.
pub fn record(hook: &str, dev: &DeviceHandle) {
    TRACE.with(|trace| trace.borrow_mut().push(format!("{} {}", hook, dev.name())));
}

pub fn take_trace() -> Vec<String> {
    TRACE.with(|trace| trace.take())
}

/// Trace entries of one hook, in call order, as device names.
pub fn calls(trace: &[String], hook: &str) -> Vec<String> {
    trace
        .iter()
        .filter_map(|entry| entry.strip_prefix(hook)?.strip_prefix(' '))
        .map(String::from)
        .collect()
}

struct CaptureSink;

impl LogSink for CaptureSink {
    fn write_line(&self, args: fmt::Arguments) {
        LOG.with(|log| log.borrow_mut().push(format!("{}", args)));
    }
}

static SINK: CaptureSink = CaptureSink;

pub fn init_logging() {
    dm::logging::init(&SINK, log::LevelFilter::Debug);
}

pub fn take_log() -> Vec<String> {
    LOG.with(|log| log.take())
}

fn trace_bind(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("bind", dev);
    Ok(())
}

fn trace_probe(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("probe", dev);
    Ok(())
}

fn trace_remove(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("remove", dev);
    Ok(())
}

fn trace_unbind(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("unbind", dev);
    Ok(())
}

fn trace_child_pre_probe(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("child_pre_probe", dev);
    Ok(())
}

fn trace_child_post_remove(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("child_post_remove", dev);
    Ok(())
}

fn trace_uclass_pre_probe(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("uc_pre_probe", dev);
    Ok(())
}

fn trace_uclass_post_probe(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("uc_post_probe", dev);
    Ok(())
}

fn bus_post_bind(dm: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    dm.scan_fdt_dev(dev).map(|_| ())
}

/// Copy the `ping-add` property into the platform data.
fn test_of_to_plat(dm: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    let add = dm.trees().node(dev.node()).read_u32_default("ping-add", 0);
    dev.write_data(DataSlot::Plat, add)
}

fn fail_of_to_plat(_: &Dm, _: &DeviceHandle) -> Result<(), DmError> {
    Err(DmError::Driver(-22))
}

fn fail_probe(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("probe", dev);
    Err(DmError::Driver(-5))
}

/// Probe the first child, then fail.
fn greedy_probe(dm: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("probe", dev);
    if let Some(child) = dev.children().first() {
        dm.device_probe(child)?;
    }
    Err(DmError::Driver(-5))
}

/// Makes `moody` devices fail their probe.
pub static MOODY_FAILS: AtomicBool = AtomicBool::new(false);

fn moody_probe(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("probe", dev);
    match MOODY_FAILS.load(Ordering::SeqCst) {
        true => Err(DmError::Driver(-11)),
        false => Ok(()),
    }
}

fn fail_post_probe(_: &Dm, _: &DeviceHandle) -> Result<(), DmError> {
    Err(DmError::Driver(-19))
}

fn fail_remove(_: &Dm, dev: &DeviceHandle) -> Result<(), DmError> {
    record("remove", dev);
    Err(DmError::Driver(-5))
}

uclass_driver!(test {
    id: UclassId::Test,
    pre_probe: Some(trace_uclass_pre_probe),
    post_probe: Some(trace_uclass_post_probe),
    per_device_auto: 8,
});

uclass_driver!(testbus {
    id: UclassId::TestBus,
    post_bind: Some(bus_post_bind),
});

uclass_driver!(serial {
    id: UclassId::Serial,
    flags: UclassFlags::SEQ_ALIAS,
});

uclass_driver!(misc {
    id: UclassId::Misc,
    post_probe: Some(fail_post_probe),
});

/// Operations of the test uclass.
pub struct TestOps {
    pub ping: fn(u32) -> u32,
}

static TEST_OPS: TestOps = TestOps { ping: |x| x + 1 };

declare_driver!(test_drv {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,u-boot-test"), UdeviceId::with_data("denx,u-boot-test2", 2)],
    bind: Some(trace_bind),
    probe: Some(trace_probe),
    remove: Some(trace_remove),
    unbind: Some(trace_unbind),
    of_to_plat: Some(test_of_to_plat),
    priv_auto: 16,
    plat_auto: 8,
    flags: DriverFlags::PRE_RELOC,
    ops: Some(&TEST_OPS),
});

declare_driver!(test_bus {
    id: UclassId::TestBus,
    of_match: &[UdeviceId::new("denx,u-boot-test-bus")],
    bind: Some(trace_bind),
    probe: Some(trace_probe),
    remove: Some(trace_remove),
    unbind: Some(trace_unbind),
    child_pre_probe: Some(trace_child_pre_probe),
    child_post_remove: Some(trace_child_post_remove),
    per_child_auto: 4,
    per_child_plat_auto: 4,
    flags: DriverFlags::PRE_RELOC,
});

declare_driver!(greedy_bus {
    id: UclassId::TestBus,
    of_match: &[UdeviceId::new("denx,greedy-bus")],
    probe: Some(greedy_probe),
    priv_auto: 16,
});

declare_driver!(moody {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,moody")],
    probe: Some(moody_probe),
    remove: Some(trace_remove),
    priv_auto: 8,
});

declare_driver!(test_late {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,u-boot-late")],
    probe: Some(trace_probe),
});

declare_driver!(fail_plat {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,fail-plat")],
    bind: Some(trace_bind),
    of_to_plat: Some(fail_of_to_plat),
    plat_auto: 32,
});

declare_driver!(flaky {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,flaky")],
    probe: Some(fail_probe),
    priv_auto: 64,
});

declare_driver!(bad_misc {
    id: UclassId::Misc,
    of_match: &[UdeviceId::new("denx,bad-misc")],
    probe: Some(trace_probe),
    remove: Some(trace_remove),
    priv_auto: 8,
});

declare_driver!(stubborn {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,fail-remove")],
    probe: Some(trace_probe),
    remove: Some(fail_remove),
    priv_auto: 8,
});

declare_driver!(dma_dev {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,dma")],
    probe: Some(trace_probe),
    remove: Some(trace_remove),
    flags: DriverFlags::ACTIVE_DMA,
});

declare_driver!(vital_dev {
    id: UclassId::Test,
    of_match: &[UdeviceId::new("denx,vital")],
    probe: Some(trace_probe),
    remove: Some(trace_remove),
    flags: DriverFlags::VITAL,
});

declare_driver!(test_serial {
    id: UclassId::Serial,
    of_match: &[UdeviceId::new("ns16550")],
    flags: DriverFlags::PRE_RELOC,
});

pub static DRIVERS: [&Driver; 12] = [
    &TEST_DRV_DRIVER,
    &TEST_BUS_DRIVER,
    &GREEDY_BUS_DRIVER,
    &MOODY_DRIVER,
    &TEST_LATE_DRIVER,
    &FAIL_PLAT_DRIVER,
    &FLAKY_DRIVER,
    &BAD_MISC_DRIVER,
    &STUBBORN_DRIVER,
    &DMA_DEV_DRIVER,
    &VITAL_DEV_DRIVER,
    &TEST_SERIAL_DRIVER,
];

pub static UCLASSES: [&dm::UclassDriver; 4] = [&TEST_UCLASS, &TESTBUS_UCLASS, &SERIAL_UCLASS, &MISC_UCLASS];

pub fn tables() -> DmTables {
    DmTables {
        drivers: &DRIVERS,
        uclass_drivers: &UCLASSES,
        spies: &[],
        plat: &[],
    }
}

pub fn tables_with_plat(plat: &'static [DriverInfo]) -> DmTables {
    DmTables { plat, ..tables() }
}

pub fn config() -> DmConfig {
    DmConfig {
        pool_size: 64 * 1024,
        event_dynamic: true,
        seq_alias: true,
        extended_scan: false,
        ..DmConfig::default()
    }
}

/// A blob whose root carries one-cell addresses and sizes; `body` adds the rest.
pub fn blob(body: impl FnOnce(&mut FdtWriter)) -> Vec<u8> {
    let mut w = FdtWriter::new();
    w.begin_node("");
    w.property_string("compatible", "denx,sandbox");
    w.property_u32("#address-cells", 1);
    w.property_u32("#size-cells", 1);
    body(&mut w);
    w.end_node();
    w.finish().unwrap()
}

pub fn node(w: &mut FdtWriter, name: &str, compatible: &str, body: impl FnOnce(&mut FdtWriter)) {
    w.begin_node(name);
    w.property_string("compatible", compatible);
    body(w);
    w.end_node();
}

/// Bus `a-test` with children `b-test` and `c-test`, then a few unrelated nodes.
pub fn abc_blob() -> Vec<u8> {
    blob(|w| {
        node(w, "a-test", "denx,u-boot-test-bus", |w| {
            node(w, "b-test", "denx,u-boot-test", |w| {
                w.property_u32("phandle", 5);
                w.property_u32("ping-add", 3);
            });
            node(w, "c-test", "denx,u-boot-test2", |w| {
                w.property_u32("test-link", 5);
            });
        });
        node(w, "unknown", "vendor,no-driver", |_| {});
        node(w, "off-test", "denx,u-boot-test", |w| w.property_string("status", "disabled"));
    })
}

pub fn flat_dm(blob: &[u8]) -> Dm {
    dm_with(tables(), blob, config())
}

pub fn dm_with(tables: DmTables, blob: &[u8], config: DmConfig) -> Dm {
    take_trace();
    Dm::new(&tables, OfTrees::from_blob(blob).unwrap(), config).unwrap()
}

/// Initialised and scanned context over `blob`.
pub fn scanned(blob: &[u8]) -> Dm {
    let dm = flat_dm(blob);
    dm.init_and_scan(false).unwrap();
    dm
}

pub fn names(devs: &[DeviceHandle]) -> Vec<&str> {
    devs.iter().map(|dev| dev.name()).collect()
}
