mod common;

use std::sync::{
    Arc,
    atomic::{AtomicI32, Ordering},
};

use common::*;
use dm::{
    DataSlot, DeviceState, DmError, EventData, EventType, HookStage, NodeRef, RemoveFlags, UclassId,
};

#[test]
fn scan_binds_in_document_order() {
    let dm = scanned(&abc_blob());
    let root = dm.root().unwrap();
    assert!(root.is_probed());
    assert_eq!(names(&root.children()), ["a-test"]);

    let a = root.find_child_by_name("a-test").unwrap();
    assert_eq!(names(&a.children()), ["b-test", "c-test"]);
    for child in a.children() {
        assert_eq!(child.parent(), Some(a.clone()));
        assert_eq!(child.state(), DeviceState::Bound);
    }
    assert_eq!(calls(&take_trace(), "bind"), ["a-test", "b-test", "c-test"]);

    // Unmatched and disabled nodes are skipped.
    assert!(dm.device_find_global_by_ofnode(dm.trees().path("/unknown").node_ref()).is_none());
    assert!(dm.device_find_global_by_ofnode(dm.trees().path("/off-test").node_ref()).is_none());
    assert_eq!(names(&dm.uclass_devices(UclassId::Test)), ["b-test", "c-test"]);
}

#[test]
fn probe_walks_up_the_parents_only() {
    let dm = scanned(&abc_blob());
    take_trace();
    let a = dm.root().unwrap().find_child_by_name("a-test").unwrap();
    let c = a.find_child_by_name("c-test").unwrap();

    dm.device_probe(&c).unwrap();
    let trace = take_trace();
    assert_eq!(calls(&trace, "probe"), ["a-test", "c-test"]);
    assert_eq!(
        trace,
        [
            "probe a-test",
            "uc_pre_probe c-test",
            "child_pre_probe c-test",
            "probe c-test",
            "uc_post_probe c-test"
        ]
    );
    assert!(a.is_probed());
    assert_eq!(a.find_child_by_name("b-test").unwrap().state(), DeviceState::Bound);
    assert!(c.has_data(DataSlot::Priv));
    assert!(c.has_data(DataSlot::UclassPriv));
    assert!(c.has_data(DataSlot::ParentPriv));
    assert_eq!(c.driver_data(), 2);
}

#[test]
fn probe_is_idempotent() {
    let dm = scanned(&abc_blob());
    let b = dm.uclass_find_device_by_name(UclassId::Test, "b-test").unwrap();
    take_trace();
    dm.device_probe(&b).unwrap();
    dm.device_probe(&b).unwrap();
    assert_eq!(calls(&take_trace(), "probe"), ["a-test", "b-test"]);
}

#[test]
fn every_probed_device_has_a_probed_parent() {
    let dm = scanned(&abc_blob());
    for id in [UclassId::Test, UclassId::TestBus] {
        for idx in 0..dm.uclass_id_count(id) {
            dm.uclass_get_device(id, idx).unwrap();
        }
    }
    let mut stack = vec![dm.root().unwrap()];
    while let Some(dev) = stack.pop() {
        if let Some(parent) = dev.parent() {
            assert!(!dev.is_probed() || parent.is_probed());
        }
        stack.extend(dev.children());
    }
}

#[test]
fn remove_takes_children_first() {
    let dm = scanned(&abc_blob());
    let a = dm.root().unwrap().find_child_by_name("a-test").unwrap();
    for idx in 0..2 {
        dm.get_child(&a, idx).unwrap();
    }
    take_trace();

    assert_eq!(dm.device_unbind(&a), Err(DmError::Active));
    dm.device_remove(&a, RemoveFlags::NORMAL).unwrap();
    let trace = take_trace();
    assert_eq!(calls(&trace, "remove"), ["b-test", "c-test", "a-test"]);
    assert_eq!(calls(&trace, "child_post_remove"), ["b-test", "c-test"]);
    for dev in a.children() {
        assert_eq!(dev.state(), DeviceState::Removed);
        assert!(!dev.has_data(DataSlot::Priv));
        assert!(dev.has_data(DataSlot::Plat));
    }
    assert_eq!(a.state(), DeviceState::Removed);

    dm.device_unbind(&a).unwrap();
    assert_eq!(calls(&take_trace(), "unbind"), ["a-test", "b-test", "c-test"]);
    assert_eq!(dm.uclass_id_count(UclassId::Test), 0);
    assert!(dm.root().unwrap().children().is_empty());
    assert_eq!(a.state(), DeviceState::Unbound);
}

#[test]
fn removed_devices_probe_again() {
    let dm = scanned(&abc_blob());
    let b = dm.uclass_get_device_by_name(UclassId::Test, "b-test").unwrap();
    dm.device_remove(&b, RemoveFlags::NORMAL).unwrap();
    take_trace();
    dm.device_probe(&b).unwrap();
    assert_eq!(calls(&take_trace(), "probe"), ["b-test"]);
    assert!(b.is_probed());
}

#[test]
fn failed_probe_removes_children_it_probed() {
    let blob = blob(|w| {
        node(w, "greedy", "denx,greedy-bus", |w| {
            node(w, "kid", "denx,u-boot-test", |_| {});
        });
    });
    let dm = scanned(&blob);
    let bus = dm.uclass_find_device(UclassId::TestBus, 0).unwrap();
    let kid = bus.children()[0].clone();
    let free = dm.pool().free_bytes();
    take_trace();

    assert_eq!(dm.device_probe(&bus), Err(DmError::HookFailed(HookStage::Probe)));
    let trace = take_trace();
    assert_eq!(calls(&trace, "probe"), ["greedy", "kid"]);
    assert_eq!(calls(&trace, "remove"), ["kid"]);
    assert_eq!(bus.state(), DeviceState::Bound);
    assert_eq!(kid.state(), DeviceState::Removed);
    assert!(!kid.has_data(DataSlot::Priv));
    assert_eq!(dm.pool().free_bytes(), free);
    dm.uninit().unwrap();
}

#[test]
fn failed_reprobe_returns_to_bound() {
    let blob = blob(|w| node(w, "moody", "denx,moody", |_| {}));
    let dm = scanned(&blob);
    let dev = dm.uclass_get_device_by_name(UclassId::Test, "moody").unwrap();
    dm.device_remove(&dev, RemoveFlags::NORMAL).unwrap();
    assert_eq!(dev.state(), DeviceState::Removed);

    MOODY_FAILS.store(true, Ordering::SeqCst);
    let res = dm.device_probe(&dev);
    MOODY_FAILS.store(false, Ordering::SeqCst);
    assert_eq!(res, Err(DmError::HookFailed(HookStage::Probe)));
    assert_eq!(dev.state(), DeviceState::Bound);
    assert!(!dev.has_data(DataSlot::Priv));
    dm.device_probe(&dev).unwrap();
    assert!(dev.is_probed());
}

#[test]
fn sequence_numbers_follow_aliases() {
    let blob = blob(|w| {
        w.begin_node("aliases");
        w.property_string("serial1", "/serial@1000");
        w.end_node();
        node(w, "serial@1000", "ns16550", |_| {});
        node(w, "serial@2000", "ns16550", |_| {});
        node(w, "serial@3000", "ns16550", |_| {});
    });
    let dm = scanned(&blob);
    let seqs: Vec<_> = dm
        .uclass_devices(UclassId::Serial)
        .iter()
        .map(|dev| (dev.name().to_string(), dev.seq()))
        .collect();
    assert_eq!(
        seqs,
        [
            ("serial@1000".to_string(), Some(1)),
            ("serial@2000".to_string(), Some(2)),
            ("serial@3000".to_string(), Some(3)),
        ]
    );
    assert_eq!(dm.uclass_get_device_by_seq(UclassId::Serial, 2).unwrap().name(), "serial@2000");
    assert_eq!(dm.get_device_by_path("serial1").unwrap().name(), "serial@1000");
}

#[test]
fn sequence_numbers_stop_at_the_top_alias() {
    let blob = blob(|w| {
        w.begin_node("aliases");
        w.property_string("serial4294967295", "/serial@1000");
        w.end_node();
        node(w, "serial@1000", "ns16550", |_| {});
        node(w, "serial@2000", "ns16550", |_| {});
    });
    let dm = scanned(&blob);
    let seqs: Vec<_> = dm.uclass_devices(UclassId::Serial).iter().map(|dev| dev.seq()).collect();
    assert_eq!(seqs, [Some(u32::MAX), None]);
    assert_eq!(
        dm.uclass_get_device_by_seq(UclassId::Serial, u32::MAX).unwrap().name(),
        "serial@1000"
    );
}

#[test]
fn sequence_numbers_without_aliases_count_up() {
    let dm = scanned(&abc_blob());
    let seqs: Vec<_> = dm.uclass_devices(UclassId::Test).iter().map(|dev| dev.seq()).collect();
    assert_eq!(seqs, [Some(0), Some(1)]);

    let root = dm.root().unwrap();
    let extra = dm.bind(&root, &TEST_DRV_DRIVER, NodeRef::null()).unwrap();
    assert_eq!(extra.seq(), Some(2));
    assert_eq!(extra.name(), "test_drv");
}

#[test]
fn of_to_plat_reads_the_node() {
    let dm = scanned(&abc_blob());
    let b = dm.uclass_find_device_by_name(UclassId::Test, "b-test").unwrap();
    assert_eq!(b.read_data::<u32>(DataSlot::Plat), Ok(3));
    assert_eq!(b.read_data::<[u8; 16]>(DataSlot::Plat), Err(DmError::NotSupported));
    assert_eq!(b.read_data::<u32>(DataSlot::Priv), Err(DmError::NotFound));
    assert_eq!(b.ops::<TestOps>().map(|ops| (ops.ping)(41)), Some(42));
    assert!(b.ops::<u32>().is_none());
}

#[test]
fn failed_of_to_plat_leaves_nothing_behind() {
    let blob = blob(|w| node(w, "bad-plat", "denx,fail-plat", |_| {}));
    let dm = flat_dm(&blob);
    dm.init().unwrap();
    dm.uclass_get(UclassId::Test).unwrap();
    let free = dm.pool().free_bytes();
    let root = dm.root().unwrap();
    let node = dm.trees().path("/bad-plat").node_ref();

    assert_eq!(
        dm.bind_fdt_node(&root, node, false).unwrap_err(),
        DmError::HookFailed(HookStage::OfToPlat)
    );
    assert_eq!(dm.pool().free_bytes(), free);
    assert!(root.children().is_empty());
    assert_eq!(dm.uclass_id_count(UclassId::Test), 0);
    assert!(calls(&take_trace(), "bind").is_empty());

    // The scanner reports it but keeps going.
    assert_eq!(dm.scan(false), Err(DmError::HookFailed(HookStage::OfToPlat)));
}

#[test]
fn failed_post_probe_calls_remove_and_stays_bound() {
    let blob = blob(|w| node(w, "misc", "denx,bad-misc", |_| {}));
    let dm = scanned(&blob);
    let dev = dm.uclass_find_device(UclassId::Misc, 0).unwrap();
    let free = dm.pool().free_bytes();
    take_trace();

    assert_eq!(dm.device_probe(&dev), Err(DmError::HookFailed(HookStage::PostProbe)));
    assert_eq!(take_trace(), ["probe misc", "remove misc"]);
    assert_eq!(dev.state(), DeviceState::Bound);
    assert!(!dev.has_data(DataSlot::Priv));
    assert_eq!(dm.pool().free_bytes(), free);
}

#[test]
fn failed_remove_hook_is_logged_and_removal_completes() {
    init_logging();
    let blob = blob(|w| node(w, "stubborn", "denx,fail-remove", |_| {}));
    let dm = scanned(&blob);
    let dev = dm.uclass_get_device(UclassId::Test, 0).unwrap();
    let seen = Arc::new(AtomicI32::new(1));
    let result = seen.clone();
    dm.events()
        .register("remove-result", EventType::DmPostRemove, move |event| {
            if let EventData::Dm { result: code, .. } = event.data {
                result.store(code, Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();
    take_log();

    dm.device_remove(&dev, RemoveFlags::NORMAL).unwrap();
    assert_eq!(dev.state(), DeviceState::Removed);
    assert!(!dev.has_data(DataSlot::Priv));
    assert_eq!(seen.load(Ordering::SeqCst), -5);
    assert!(take_log().iter().any(|line| line.contains("stubborn: remove failed")));
}

#[test]
fn first_device_skips_failing_probes() {
    let blob = blob(|w| {
        node(w, "flaky", "denx,flaky", |_| {});
        node(w, "steady", "denx,u-boot-test", |_| {});
        node(w, "flaky2", "denx,flaky", |_| {});
    });
    let dm = scanned(&blob);
    let first = dm.uclass_first_device(UclassId::Test).unwrap();
    assert_eq!(first.name(), "steady");
    assert!(dm.uclass_next_device(&first).is_none());
    assert_eq!(
        dm.uclass_get_device(UclassId::Test, 0).unwrap_err(),
        DmError::HookFailed(HookStage::Probe)
    );
    let flaky = dm.uclass_find_first_device(UclassId::Test).unwrap();
    assert_eq!(flaky.state(), DeviceState::Bound);
    assert!(!flaky.has_data(DataSlot::Priv));
    assert_eq!(dm.uclass_find_next_device(&flaky).unwrap().name(), "steady");
}

#[test]
fn lookups_by_node_and_phandle() {
    let dm = scanned(&abc_blob());
    let b_node = dm.trees().path("/a-test/b-test").node_ref();
    let b = dm.uclass_find_device_by_ofnode(UclassId::Test, b_node).unwrap();
    assert!(!b.is_probed());
    let c = dm.uclass_find_device_by_name(UclassId::Test, "c-test").unwrap();
    let linked = dm.uclass_get_device_by_phandle(UclassId::Test, &c, "test-link").unwrap();
    assert_eq!(linked, b);
    assert!(b.is_probed());
    assert_eq!(dm.get_parent(&c).unwrap().name(), "a-test");
    assert_eq!(
        dm.uclass_find_device_by_ofnode(UclassId::Test, NodeRef::null()).unwrap_err(),
        DmError::NotFound
    );
    assert_eq!(dm.get_device_by_path("/a-test/c-test").unwrap(), c);
    assert!(dm.get_device_by_path("/missing").is_err());
}

#[test]
fn bind_by_name_and_duplicates() {
    let dm = scanned(&abc_blob());
    let root = dm.root().unwrap();
    let dev = dm.bind_by_name(&root, "test_drv", "manual").unwrap();
    assert_eq!(dev.node(), NodeRef::null());
    assert_eq!(dm.bind_by_name(&root, "no_such_driver", "x").unwrap_err(), DmError::NotFound);

    let a = root.find_child_by_name("a-test").unwrap();
    let b_node = dm.trees().path("/a-test/b-test").node_ref();
    assert_eq!(dm.bind_fdt_node(&a, b_node, false).unwrap_err(), DmError::AlreadyBound);
    assert_eq!(dm.scan(false), Ok(0));
}

#[test]
fn data_returns_to_the_pool_over_repeated_cycles() {
    let dm = scanned(&abc_blob());
    let root = dm.root().unwrap();
    let a = root.find_child_by_name("a-test").unwrap();
    dm.uclass_get(UclassId::Test).unwrap();
    let free = dm.pool().free_bytes();
    for _ in 0..5 {
        let dev = dm.bind(&a, &TEST_DRV_DRIVER, NodeRef::null()).unwrap();
        dm.device_probe(&dev).unwrap();
        dev.write_data(DataSlot::Priv, 0x55aa_u32).unwrap();
        assert!(dm.pool().free_bytes() < free);
        dm.device_remove(&dev, RemoveFlags::NORMAL).unwrap();
        dm.device_unbind(&dev).unwrap();
        assert_eq!(dm.pool().free_bytes(), free);
    }
}

#[test]
fn uninit_releases_everything() {
    let dm = flat_dm(&abc_blob());
    let free = dm.pool().free_bytes();
    dm.init_and_scan(false).unwrap();
    dm.uclass_get_device(UclassId::Test, 1).unwrap();
    dm.uninit().unwrap();
    assert!(dm.root().is_none());
    assert!(dm.uclass_ids().is_empty());
    assert_eq!(dm.pool().free_bytes(), free);

    dm.init_and_scan(false).unwrap();
    assert_eq!(dm.uclass_id_count(UclassId::Test), 2);
    assert_eq!(dm.init(), Err(DmError::AlreadyBound));
}
