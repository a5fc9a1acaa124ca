//! The broker starting the real daemon binary on first use.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use termhost_broker::{BrokerEvent, BrokerOptions, DaemonCommand, DisposeOptions, MemoryStore, TerminalSessionBroker};
use termhost_daemon::protocol::EnsureSessionParams;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_broker_starts_daemon_on_first_ensure() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("auto.sock");
    assert!(!socket.exists());

    let mut options = BrokerOptions::new(&socket);
    options.connect_timeout = WAIT;
    options.daemon_command = Some(DaemonCommand::new(env!("CARGO_BIN_EXE_termhost-daemon")).args([
        "--config".to_string(),
        dir.path().join("missing.toml").display().to_string(),
        "serve".to_string(),
        "--socket".to_string(),
        socket.display().to_string(),
        "--fake-pty".to_string(),
        "--idle-timeout-ms".to_string(),
        "2000".to_string(),
    ]));
    let broker = TerminalSessionBroker::new(options, Arc::new(MemoryStore::new()));
    let mut events = broker.subscribe();
    let tab = broker.open_connection();

    let session = broker
        .ensure_session(EnsureSessionParams::new("/w/repo", "main"), tab)
        .await
        .unwrap();
    assert!(!session.existing);
    assert!(socket.exists());
    assert!(broker.is_connected().await);

    broker.write(&session.session_id, "hello\n").await.unwrap();
    let event = tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if matches!(event, BrokerEvent::Data { .. }) {
                return event;
            }
        }
    })
    .await
    .expect("no output from the started daemon");
    assert!(matches!(event, BrokerEvent::Data { data, .. } if data == "hello\n"));

    // A second ensure reuses the running daemon instead of starting another.
    let again = broker
        .ensure_session(EnsureSessionParams::new("/w/repo", "main"), tab)
        .await
        .unwrap();
    assert!(again.existing);
    assert_eq!(again.session_id, session.session_id);

    broker.dispose(&session.session_id, DisposeOptions::default()).await.unwrap();
    broker.disconnect(tab).await.unwrap();
    drop(broker);

    // Idle with no sessions or clients, the daemon exits and removes its socket.
    tokio::time::timeout(WAIT, async {
        while socket.exists() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("started daemon never went idle");
}
