mod common;

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicI32, AtomicUsize, Ordering},
};

use common::*;
use dm::{
    DataSlot, DeviceState, DmConfig, DmError, DmTables, Event, EventBus, EventData, EventSpy, EventType, RemoveFlags,
    UclassId, event_spy,
};

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    (count.clone(), count)
}

#[test]
fn first_failing_subscriber_stops_delivery() {
    let bus = EventBus::new(&[], true);
    let first = bus
        .register("first", EventType::Test, |_| Err(DmError::Driver(-1)))
        .unwrap();
    let (seen, count) = counter();
    bus.register("second", EventType::Test, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    assert_eq!(bus.dynamic_count(), 2);

    assert_eq!(
        bus.notify(EventType::Test, EventData::Test { signal: 1 }),
        Err(DmError::Driver(-1))
    );
    assert_eq!(count.load(Ordering::SeqCst), 0);

    bus.unregister(first).unwrap();
    assert_eq!(bus.unregister(first), Err(DmError::NotFound));
    bus.notify(EventType::Test, EventData::Test { signal: 2 }).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    // Other event types do not reach the subscriber.
    bus.notify_null(EventType::MainLoop).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn subscribers_may_subscribe_while_notified() {
    let bus = Arc::new(EventBus::new(&[], true));
    let weak = Arc::downgrade(&bus);
    bus.register("spawner", EventType::Test, move |_| {
        if let Some(bus) = weak.upgrade() {
            bus.register("spawned", EventType::Test, |_| Ok(()))?;
        }
        Ok(())
    })
    .unwrap();
    bus.notify_null(EventType::Test).unwrap();
    assert_eq!(bus.dynamic_count(), 2);
    bus.unregister_all();
    assert_eq!(bus.dynamic_count(), 0);
}

#[test]
fn dynamic_subscriptions_can_be_disabled() {
    let config = DmConfig {
        event_dynamic: false,
        ..config()
    };
    let dm = dm_with(tables(), &abc_blob(), config);
    assert_eq!(
        dm.events().register("late", EventType::Test, |_| Ok(())).unwrap_err(),
        DmError::NotSupported
    );
    dm.init_and_scan(false).unwrap();
    assert_eq!(dm.events().dynamic_count(), 0);
}

#[test]
fn pre_probe_subscriber_can_veto() {
    let dm = scanned(&abc_blob());
    let veto = dm
        .events()
        .register("veto", EventType::DmPreProbe, |event| match &event.data {
            EventData::Dm { dev, .. } if dev.name() == "b-test" => Err(DmError::Driver(-13)),
            _ => Ok(()),
        })
        .unwrap();
    let b = dm.uclass_find_device_by_name(UclassId::Test, "b-test").unwrap();
    take_trace();

    assert_eq!(dm.device_probe(&b), Err(DmError::Driver(-13)));
    assert_eq!(b.state(), DeviceState::Bound);
    assert!(!b.has_data(DataSlot::Priv));
    assert!(!b.parent().unwrap().is_probed());
    assert!(take_trace().is_empty());

    dm.events().unregister(veto).unwrap();
    dm.device_probe(&b).unwrap();
    assert!(b.is_probed());
}

#[test]
fn lifecycle_events_follow_the_graph() {
    let dm = scanned(&abc_blob());
    let log = Arc::new(Mutex::new(Vec::new()));
    for ty in [
        EventType::DmPreProbe,
        EventType::DmPostProbe,
        EventType::DmPreRemove,
        EventType::DmPostRemove,
    ] {
        let log = log.clone();
        dm.events()
            .register("recorder", ty, move |event| {
                if let EventData::Dm { dev, result } = &event.data {
                    log.lock()
                        .unwrap()
                        .push(format!("{} {} {}", event.ty.name(), dev.name(), result));
                }
                Ok(())
            })
            .unwrap();
    }

    let c = dm.uclass_get_device_by_name(UclassId::Test, "c-test").unwrap();
    let a = c.parent().unwrap();
    dm.device_remove(&a, RemoveFlags::NORMAL).unwrap();
    assert_eq!(
        *log.lock().unwrap(),
        [
            "dm_pre_probe c-test 0",
            "dm_pre_probe a-test 0",
            "dm_post_probe a-test 0",
            "dm_post_probe c-test 0",
            "dm_pre_remove a-test 0",
            "dm_pre_remove c-test 0",
            "dm_post_remove c-test 0",
            "dm_post_remove a-test 0",
        ]
    );
}

static TEST_SIGNAL: AtomicI32 = AtomicI32::new(0);
static INIT_COUNT: AtomicUsize = AtomicUsize::new(0);

fn on_test(event: &Event) -> Result<(), DmError> {
    if let EventData::Test { signal } = event.data {
        TEST_SIGNAL.store(signal, Ordering::SeqCst);
    }
    Ok(())
}

fn on_init() -> Result<(), DmError> {
    INIT_COUNT.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

event_spy!(EventType::Test, on_test);
event_spy!(simple EventType::DmPostInitF, on_init);

static SPIES: [&EventSpy; 2] = [&ON_TEST_SPY, &ON_INIT_SPY];

#[test]
fn static_spies_run_before_dynamic_ones() {
    let tables = DmTables {
        spies: &SPIES,
        ..tables()
    };
    let dm = dm_with(tables, &abc_blob(), config());
    dm.events()
        .register("after", EventType::Test, |_| {
            assert_eq!(TEST_SIGNAL.load(Ordering::SeqCst), 7);
            Ok(())
        })
        .unwrap();

    dm.init_and_scan(false).unwrap();
    assert_eq!(INIT_COUNT.load(Ordering::SeqCst), 1);
    dm.events().notify_raw(0, EventData::Test { signal: 7 }).unwrap();
    assert_eq!(TEST_SIGNAL.load(Ordering::SeqCst), 7);
    assert_eq!(ON_TEST_SPY.id, "on_test");
}

#[test]
fn relocation_announces_the_second_phase() {
    let dm = flat_dm(&abc_blob());
    let (seen, count) = counter();
    dm.events()
        .register("post-init-r", EventType::DmPostInitR, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    dm.init_and_scan(true).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
    dm.relocate(false).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(dm.events().dynamic_count(), 1);
    dm.uninit().unwrap();
    assert_eq!(dm.events().dynamic_count(), 0);
}
