#![cfg(unix)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use mediabridge_session::{Engine, EngineConfig};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(10);

/// An engine that never reads its stdin, so the control pipe backs up.
fn stalled_engine_script(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "mediabridge-session-{name}-{}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let script = dir.join("stall.sh");
    std::fs::write(&script, "exec sleep 30\n").unwrap();
    script
}

#[tokio::test]
async fn call_deadline_holds_while_engine_stops_reading() {
    let script = stalled_engine_script("call-deadline");
    let engine = Engine::spawn(
        EngineConfig::new("sh", &script).with_shutdown_grace(Duration::from_millis(100)),
    )
    .expect("engine should spawn");

    let blob = "x".repeat(1024 * 1024);
    let started = Instant::now();
    let err = tokio::time::timeout(
        WAIT,
        engine.multiplexer().call(
            "dump",
            None,
            json!({ "blob": blob }),
            Some(Duration::from_millis(1)),
        ),
    )
    .await
    .expect("call should give up at its own deadline")
    .unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(2));

    tokio::time::timeout(WAIT, engine.close())
        .await
        .expect("close should not hang on a backed-up pipe");
}

#[tokio::test]
async fn close_terminates_an_engine_that_stopped_reading() {
    let script = stalled_engine_script("close");
    let engine = Engine::spawn(
        EngineConfig::new("sh", &script).with_shutdown_grace(Duration::from_millis(100)),
    )
    .expect("engine should spawn");
    let lifecycle = engine.lifecycle().expect("spawned engine has a lifecycle");

    // Fill the pipe so the close request itself cannot be written.
    let blob = "x".repeat(1024 * 1024);
    let filler = tokio::spawn({
        let mux = engine.multiplexer().clone();
        async move {
            mux.call("dump", None, json!({ "blob": blob }), Some(Duration::from_secs(60)))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!filler.is_finished());

    tokio::time::timeout(WAIT, engine.close())
        .await
        .expect("close should reach process shutdown");

    assert!(engine.is_closed());
    assert!(lifecycle.borrow().state.is_terminal());
    let filled = tokio::time::timeout(WAIT, filler)
        .await
        .expect("stalled call should settle once the engine is closed")
        .unwrap();
    assert!(filled.is_err());
}
