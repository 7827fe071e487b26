//! Setup, reload, per-file isolation, transpiler fallback, timers and the
//! admin command, driven through the public `ScriptHost` API.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::{Fixture, Lines};
use hyscript::host::CommandInvocation;
use hyscript::runtime::manager::LoadFailure;
use hyscript::{HostValue, LifecycleEvent, RecordingHost, ReloadTrigger};

const SETUP_COUNTER: &str = r"
server.on('setup', () => { globalThis.state.setups = (globalThis.state.setups || 0) + 1; });
";

#[test]
fn test_setup_loads_scripts_and_runs_hook() {
    let fx = Fixture::new(&[("main.js", SETUP_COUNTER)]);
    let report = fx.host.setup().unwrap();

    assert_eq!(report.trigger, ReloadTrigger::Setup);
    assert_eq!(report.loaded, ["000_state.js", "main.js"]);
    assert!(report.is_clean(), "{:?}", report.messages());
    assert_eq!(fx.host.generation(), Some(report.generation));
    assert_eq!(fx.counter("setups"), 1);
}

#[test]
fn test_reload_replaces_generation_and_state() {
    let fx = Fixture::new(&[("main.js", SETUP_COUNTER)]);
    let first = fx.host.setup().unwrap().generation;
    let second = fx.host.reload().unwrap();

    assert!(second.generation > first);
    assert_eq!(second.trigger, ReloadTrigger::Manual);
    // A fresh context starts from an empty state; setup ran once in it.
    assert_eq!(fx.counter("setups"), 1);
}

#[test]
fn test_broken_file_is_isolated() {
    let fx = Fixture::new(&[
        ("a.js", "server.on('setup', () => {\n  let = ;\n});"),
        ("b.js", "globalThis.state.b = 1;"),
    ]);
    let report = fx.host.setup().unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].file(), "a.js");
    assert!(matches!(report.failures[0], LoadFailure::Evaluate(_)));
    assert!(report.loaded.contains(&"b.js".to_string()));
    assert_eq!(fx.counter("b"), 1);
}

#[test]
fn test_runtime_error_reports_position() {
    let fx = Fixture::new(&[("boom.js", "\n\nnull.property;")]);
    let report = fx.host.setup().unwrap();

    let LoadFailure::Evaluate(failure) = &report.failures[0] else {
        panic!("expected an evaluation failure, got {:?}", report.failures);
    };
    assert_eq!(failure.origin.as_deref(), Some("boom.js"));
    assert!(failure.message.contains("null"), "{failure}");
}

#[test]
fn test_load_failure_renders_file_and_line() {
    let fx = Fixture::new(&[("thrower.js", "const ok = 1;\n\nthrow new Error('bad input');")]);
    let report = fx.host.setup().unwrap();

    let LoadFailure::Evaluate(failure) = &report.failures[0] else {
        panic!("expected an evaluation failure, got {:?}", report.failures);
    };
    assert_eq!(failure.position.map(|p| p.line), Some(3));
    let rendered = failure.to_string();
    assert!(rendered.starts_with("[thrower.js:3"), "{rendered}");
    assert!(rendered.contains("] bad input"), "{rendered}");
}

#[test]
fn test_typescript_skipped_without_transpiler() {
    let fx = Fixture::new(&[
        ("typed.ts", "const n: number = 1; globalThis.state.ts = n;"),
        ("plain.js", SETUP_COUNTER),
    ]);
    let report = fx.host.setup().unwrap();

    assert_eq!(report.skipped, ["typed.ts"]);
    assert!(report.failures.is_empty());
    assert!(report.loaded.contains(&"plain.js".to_string()));
    assert_eq!(fx.counter("ts"), 0);
    assert_eq!(fx.counter("setups"), 1);
    assert!(report
        .messages()
        .iter()
        .any(|(level, line)| *level == log::Level::Warn && line.contains("typed.ts")));
}

#[test]
fn test_backup_files_ignored() {
    let fx = Fixture::new(&[("~old.js", "throw new Error('never loaded');")]);
    let report = fx.host.setup().unwrap();
    assert_eq!(report.loaded, ["000_state.js"]);
    assert!(report.failures.is_empty());
}

#[test]
fn test_setup_hook_failure_is_reported() {
    let fx = Fixture::new(&[("main.js", "server.on('setup', () => { throw new Error('nope'); });")]);
    let report = fx.host.setup().unwrap();
    assert!(report.failures.is_empty());
    assert!(report.setup_failure.is_some());
    assert!(!report.is_clean());
}

#[test]
fn test_timers_fire_on_pump_and_clear_on_reload() {
    let fx = Fixture::new(&[(
        "timers.js",
        r"
        setTimeout(() => { globalThis.state.once = (globalThis.state.once || 0) + 1; }, 0);
        const id = setInterval(() => { globalThis.state.every = (globalThis.state.every || 0) + 1; }, 0);
        const cancelled = setTimeout(() => { globalThis.state.cancelled = 1; }, 0);
        clearTimeout(cancelled);
        ",
    )]);
    fx.host.setup().unwrap();

    let stats = fx.host.pump();
    assert_eq!(stats.timers, 2);
    thread::sleep(Duration::from_millis(5));
    fx.host.pump();
    assert_eq!(fx.counter("once"), 1);
    assert_eq!(fx.counter("every"), 2);
    assert_eq!(fx.counter("cancelled"), 0);

    fx.remove("timers.js");
    fx.host.reload().unwrap();
    assert_eq!(fx.host.pump().timers, 0);
}

#[test]
fn test_oversized_timer_delay_is_clamped() {
    let fx = Fixture::new(&[(
        "far.js",
        r"
        setTimeout(() => { globalThis.state.far = 1; }, 1e300);
        setInterval(() => { globalThis.state.farEvery = 1; }, Number.MAX_VALUE);
        globalThis.state.scheduled = 1;
        ",
    )]);
    let report = fx.host.setup().unwrap();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(fx.counter("scheduled"), 1);
    assert_eq!(fx.host.pump().timers, 0);
    assert_eq!(fx.counter("far"), 0);
}

#[test]
fn test_async_listeners_complete_through_pump() {
    let fx = Fixture::new(&[(
        "async.js",
        r"
        server.on('tick', async () => { await null; globalThis.state.awaited = 1; });
        server.on('setup', () => { server.call('tick', {}); });
        ",
    )]);
    fx.host.setup().unwrap();
    fx.host.pump();
    assert_eq!(fx.counter("awaited"), 1);
}

#[test]
fn test_lifecycle_events_reach_listeners() {
    let fx = Fixture::new(&[(
        "events.js",
        r"
        server.on('playerConnect', (e) => { globalThis.state.world = e.world; });
        server.on('playerChat', (e) => { if (e.content === '!quiet') e.isCancelled = true; });
        ",
    )]);
    fx.host.setup().unwrap();

    let connect = LifecycleEvent::player_connect(HostValue::handle("playerRef", 1), HostValue::handle("world", 9));
    assert!(!fx.host.fire(connect));
    assert_eq!(fx.state().get("world"), Some(&HostValue::handle("world", 9)));

    let loud = LifecycleEvent::player_chat(HostValue::handle("playerRef", 1), "hello", HostValue::Null, Vec::new());
    let quiet = LifecycleEvent::player_chat(HostValue::handle("playerRef", 1), "!quiet", HostValue::Null, Vec::new());
    assert!(!fx.host.fire(loud));
    assert!(fx.host.fire(quiet));
}

#[test]
fn test_cancellation_survives_a_later_throw() {
    let fx = Fixture::new(&[(
        "chat.js",
        r"
        server.on('playerChat', (e) => { e.isCancelled = true; }, EventPriority.LOWEST);
        server.on('playerChat', () => { throw new Error('listener broke'); });
        ",
    )]);
    fx.host.setup().unwrap();

    assert!(fx.host.dispatch_cancelable("playerChat", BTreeMap::new()));
    let chat = LifecycleEvent::player_chat(HostValue::handle("playerRef", 1), "hi", HostValue::Null, Vec::new());
    assert!(fx.host.fire(chat));
}

#[test]
fn test_dispatch_does_not_grow_record_table() {
    let fx = Fixture::new(&[(
        "chat.js",
        "server.on('playerChat', (e) => { e.isCancelled = e.content === 'no'; });",
    )]);
    fx.host.setup().unwrap();
    let before = fx.host.bridge().record_count();

    for i in 0..50 {
        let content = if i % 2 == 0 { "no" } else { "yes" };
        let fields = BTreeMap::from([("content".to_string(), HostValue::from(content))]);
        assert_eq!(fx.host.dispatch_cancelable("playerChat", fields), i % 2 == 0);
    }
    assert_eq!(fx.host.bridge().record_count(), before);
}

#[test]
fn test_shutdown_detaches_everything() {
    let fx = Fixture::new(&[(
        "filters.js",
        "server.addAdapterInbound(() => true); server.addSystem('ticking', { tick() {} });",
    )]);
    fx.host.setup().unwrap();
    assert_eq!(fx.host.bridge().packet_filter_count(), 1);

    fx.host.shutdown();
    assert_eq!(fx.host.generation(), None);
    assert_eq!(fx.host.bridge().packet_filter_count(), 0);
    assert!(fx.recorder.packet_filters(hyscript::proxy::packet::PacketDirection::Inbound).is_empty());
    assert_eq!(fx.recorder.tick_all(0.05), 0);
    assert!(fx.host.reload().is_err());
}

#[test]
fn test_admin_command_reloads_and_echoes() {
    let fx = Fixture::new(&[]);
    let before = fx.host.setup().unwrap().generation;

    let admin = fx.recorder.command("hs").expect("admin command registered");
    assert_eq!(admin.spec().permission.as_deref(), Some("hyscript.self"));

    let lines = Arc::new(Lines::default());
    admin.execute(
        &["reloadscripts".to_string()],
        CommandInvocation {
            feedback: Some(Arc::clone(&lines) as Arc<dyn hyscript::Feedback>),
            ..CommandInvocation::default()
        },
    );
    assert!(fx.host.generation() > Some(before));
    let echoed = lines.take();
    assert!(echoed.iter().any(|(_, line)| line.contains("Loaded")), "{echoed:?}");

    // Setup again must not register the command twice.
    fx.host.setup().unwrap();
    assert_eq!(fx.recorder.registration_count("command:hyscript"), 1);
}

#[test]
fn test_reloadconfig_reads_config_file() {
    let fx = Fixture::new(&[]);
    fx.host.setup().unwrap();
    std::fs::write(
        fx.dir.path().join("config.json"),
        r#"{"isHotReloadEnabled": false, "enableTypescript": false}"#,
    )
    .unwrap();

    let lines = Arc::new(Lines::default());
    fx.recorder.command("hyscript").unwrap().execute(
        &["reloadconfig".to_string()],
        CommandInvocation {
            feedback: Some(Arc::clone(&lines) as Arc<dyn hyscript::Feedback>),
            ..CommandInvocation::default()
        },
    );
    let config = hyscript::config::snapshot(&fx.host.config());
    assert!(!config.enable_typescript);
    assert!(lines.take().iter().any(|(_, line)| line.contains("Configuration reloaded")));
}

#[test]
fn test_hot_reload_picks_up_changes() {
    let fx = Fixture::with(RecordingHost::default(), true, &[("main.js", "globalThis.state.v = 1;")]);
    let first = fx.host.setup().unwrap().generation;
    assert!(fx.host.is_watching());

    // Let the OS watch settle before writing.
    thread::sleep(Duration::from_millis(100));
    fx.write("main.js", "globalThis.state.v = 2;");

    let deadline = Instant::now() + Duration::from_secs(10);
    while fx.host.generation() == Some(first) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
    }
    assert!(fx.host.generation() > Some(first), "watcher never reloaded");
    // Wait for the reload to finish loading files before probing.
    let deadline = Instant::now() + Duration::from_secs(10);
    while fx.counter("v") != 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
    }
    assert_eq!(fx.counter("v"), 2);

    fx.host.stop_watcher();
    assert!(!fx.host.is_watching());
}
