mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use marionette::config::Settings;
use marionette::{Controller, LaunchOptions, ScriptOptions, Target};

use common::{init_tracing, FakeDevice, ScriptPlan};

fn attach(device: Arc<FakeDevice>) -> Controller {
    Controller::launch(device, Target::Pid(100), LaunchOptions::default()).unwrap()
}

#[test]
fn sync_run_returns_messages_and_unloads() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    device.plan(
        "probe-alpha",
        ScriptPlan {
            on_load: vec![json!({"value": 41}), json!({"value": 42})],
            ..Default::default()
        },
    );
    let log = Arc::clone(&device.log);
    let mut controller = attach(Arc::clone(&device));

    let result = controller
        .run_script("send('probe-alpha');", ScriptOptions::default())
        .unwrap();

    assert_eq!(result.messages, vec![json!({"value": 41}), json!({"value": 42})]);
    assert!(log
        .lock()
        .unwrap()
        .unloaded_sources
        .iter()
        .any(|s| s.contains("probe-alpha")));
    assert!(controller.loaded_scripts().is_empty());
    controller.quit().unwrap();
}

#[test]
fn dispose_flushes_trailing_messages() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    device.plan(
        "probe-flush",
        ScriptPlan {
            on_load: vec![json!("early")],
            dispose_flush: vec![json!("late")],
            ..Default::default()
        },
    );
    let mut controller = attach(Arc::clone(&device));

    let result = controller
        .run_script("send('probe-flush');", ScriptOptions::default())
        .unwrap();
    assert_eq!(result.messages, vec![json!("early"), json!("late")]);
    controller.quit().unwrap();
}

#[test]
fn async_run_returns_as_soon_as_marker_arrives() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    device.plan(
        "slow-op",
        ScriptPlan {
            on_load: vec![json!({"progress": 1})],
            delayed: vec![(Duration::from_millis(50), json!("op-complete"))],
            ..Default::default()
        },
    );
    let mut controller = attach(Arc::clone(&device));

    let start = Instant::now();
    let result = controller
        .run_script_async("start('slow-op');", "op-complete")
        .unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_secs(5),
        "returned in {:?}, must not wait out the full timeout",
        elapsed
    );
    assert_eq!(result.messages, vec![json!({"progress": 1})]);
    // The marker payload itself is not part of the result, and the script
    // was unloaded, not left resident.
    assert!(controller.loaded_scripts().is_empty());
    controller.quit().unwrap();
}

#[test]
fn compile_error_is_absorbed_into_an_empty_result() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    device.plan(
        "broken-script",
        ScriptPlan {
            compile_error: true,
            ..Default::default()
        },
    );
    let mut controller = attach(Arc::clone(&device));

    let result = controller
        .run_script("broken-script(;", ScriptOptions::default())
        .unwrap();
    assert!(result.messages.is_empty());
    controller.quit().unwrap();
}

#[test]
fn load_error_is_absorbed_and_script_unloaded() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    device.plan(
        "crashy",
        ScriptPlan {
            load_error: true,
            ..Default::default()
        },
    );
    let log = Arc::clone(&device.log);
    let mut controller = attach(Arc::clone(&device));

    let result = controller
        .run_script("crashy();", ScriptOptions::default())
        .unwrap();
    assert!(result.messages.is_empty());
    assert!(log
        .lock()
        .unwrap()
        .unloaded_sources
        .iter()
        .any(|s| s.contains("crashy")));
    controller.quit().unwrap();
}

#[test]
fn post_dispose_drain_is_bounded_by_the_sync_timeout() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    // A script that keeps chattering long after dispose: one message every
    // 10ms for two seconds.
    device.plan(
        "chatty",
        ScriptPlan {
            dispose_flush: vec![json!("flushed")],
            delayed: (1..=200)
                .map(|i| (Duration::from_millis(10 * i), json!(i)))
                .collect(),
            ..Default::default()
        },
    );
    let settings = Settings {
        script_sync_timeout_ms: 100,
        ..Default::default()
    };
    let mut controller = Controller::launch(
        Arc::<FakeDevice>::clone(&device),
        Target::Pid(100),
        LaunchOptions {
            settings: Some(settings),
            ..Default::default()
        },
    )
    .unwrap();

    let start = Instant::now();
    let result = controller
        .run_script("chatty();", ScriptOptions::default())
        .unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(1500),
        "run blocked for {:?}, drain must stop at the sync timeout",
        elapsed
    );
    assert!(result.messages.contains(&json!("flushed")));
    assert!(result.messages.len() < 200);
    controller.quit().unwrap();
}

#[test]
fn delayed_script_stays_resident_until_teardown() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    let log = Arc::clone(&device.log);
    let mut controller = attach(Arc::clone(&device));

    let start = Instant::now();
    controller
        .run_script(
            "send('resident-probe');",
            ScriptOptions {
                timeout: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        )
        .unwrap();

    // Returns at once; the delayed source is wrapped and left loaded.
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(controller.loaded_scripts().len(), 1);
    assert!(log
        .lock()
        .unwrap()
        .loaded_sources
        .iter()
        .any(|s| s.contains("setTimeout") && s.contains("resident-probe")));
    assert!(!log
        .lock()
        .unwrap()
        .unloaded_sources
        .iter()
        .any(|s| s.contains("resident-probe")));

    controller.quit().unwrap();
    assert!(log
        .lock()
        .unwrap()
        .unloaded_sources
        .iter()
        .any(|s| s.contains("resident-probe")));
}

#[test]
fn newest_resident_script_unloads_first() {
    init_tracing();
    let device = Arc::new(FakeDevice::new());
    let log = Arc::clone(&device.log);
    let mut controller = attach(Arc::clone(&device));

    let resident = ScriptOptions {
        timeout: Some(Duration::from_millis(10)),
        ..Default::default()
    };
    controller
        .run_script("send('first-resident');", resident.clone())
        .unwrap();
    controller
        .run_script("send('second-resident');", resident)
        .unwrap();

    controller.quit().unwrap();

    let log = log.lock().unwrap();
    let pos = |needle: &str| {
        log.unloaded_sources
            .iter()
            .position(|s| s.contains(needle))
            .unwrap()
    };
    assert!(pos("second-resident") < pos("first-resident"));
}
