//! Integration tests over a real WebSocket.
//!
//! These tests start a real server and connect real clients, verifying the
//! full cycle pipeline.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use trellis_core::widgets::{CheckBox, CheckBoxState, Label, LabelState};
use trellis_core::{
    BoxError, ComponentKey, Connector, ConnectorRegistry, Listener, ValueChangeEvent,
};
use trellis_sync::{
    ClientConfig, ConnectionState, ServerConfig, ServerSession, SyncClient, SyncEvent, SyncServer,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn status_key() -> ComponentKey {
    ComponentKey::from("status")
}

fn agree_key() -> ComponentKey {
    ComponentKey::from("agree")
}

/// A status label that follows an "agree" check box.
fn build_ui(session: &mut ServerSession) -> Result<(), BoxError> {
    session.bind(status_key(), Label::label("unchecked"))?;

    let check_box = CheckBox::check_box("Agree");
    let tasks = session.tasks();
    check_box.add_value_change_listener(Listener::new(move |e: &ValueChangeEvent<bool>| {
        let text = if e.new_value { "checked" } else { "unchecked" };
        tasks.defer(move |session| {
            session
                .component_mut::<Label>(&status_key())
                .ok_or("status label missing")?
                .set_text(text);
            Ok(())
        });
        Ok(())
    }))?;
    session.bind(agree_key(), check_box)?;
    Ok(())
}

/// Start a server on a free port, return it with the port.
async fn start_test_server() -> (Arc<SyncServer>, u16) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_sessions: 16,
        push_interval_ms: 10,
        retain_sessions: true,
    };
    let server = Arc::new(SyncServer::new(config, build_ui));
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, port)
}

async fn connect_client(port: u16) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let config = ClientConfig::new(format!("ws://127.0.0.1:{port}"));
    let mut client = SyncClient::new(config, ConnectorRegistry::with_builtins());
    let events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    (client, events)
}

async fn next_event(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Wait for applied cycles until the status label reads `text`.
async fn wait_for_label(client: &SyncClient, events: &mut mpsc::Receiver<SyncEvent>, text: &str) {
    loop {
        let current = client
            .with_session(|s| {
                s.connector::<Connector<LabelState>>(&status_key())
                    .map(|c| c.state().text.clone())
            })
            .await;
        if current.as_deref() == Some(text) {
            return;
        }
        match next_event(events).await {
            SyncEvent::CycleApplied(_) => {}
            other => panic!("Expected CycleApplied, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, port) = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects_and_receives_full_state() {
    let (server, port) = start_test_server().await;
    let (client, mut events) = connect_client(port).await;

    let session_id = match next_event(&mut events).await {
        SyncEvent::Connected { session_id, resumed } => {
            assert!(!resumed);
            session_id
        }
        other => panic!("Expected Connected event, got {other:?}"),
    };
    match next_event(&mut events).await {
        SyncEvent::CycleApplied(report) => {
            assert!(report.resync);
            assert_eq!(report.created, vec![status_key(), agree_key()]);
        }
        other => panic!("Expected CycleApplied, got {other:?}"),
    }

    assert_eq!(client.connection_state().await, ConnectionState::Connected);
    assert_eq!(client.session_id().await, Some(session_id));
    assert_eq!(server.manager().session_ids().await, vec![session_id]);
    let text = client
        .with_session(|s| {
            s.connector::<Connector<LabelState>>(&status_key())
                .map(|c| c.state().text.clone())
        })
        .await;
    assert_eq!(text.as_deref(), Some("unchecked"));
}

#[tokio::test]
async fn test_click_updates_label_through_server() {
    let (server, port) = start_test_server().await;
    let (client, mut events) = connect_client(port).await;
    let _ = next_event(&mut events).await; // Connected
    let _ = next_event(&mut events).await; // Initial state

    let clicked = client
        .with_session(|s| {
            s.connector_mut::<Connector<CheckBoxState>>(&agree_key())
                .map(|c| c.click(true))
        })
        .await;
    assert_eq!(clicked, Some(true));
    assert_eq!(client.flush().await, Ok(1));

    wait_for_label(&client, &mut events, "checked").await;

    let session_id = client.session_id().await.unwrap();
    let checked = server
        .manager()
        .access(&session_id, |s| *s.component::<CheckBox>(&agree_key()).unwrap().value())
        .await
        .unwrap();
    assert!(checked);
}

#[tokio::test]
async fn test_server_side_change_is_pushed() {
    let (server, port) = start_test_server().await;
    let (client, mut events) = connect_client(port).await;
    let session_id = match next_event(&mut events).await {
        SyncEvent::Connected { session_id, .. } => session_id,
        other => panic!("Expected Connected event, got {other:?}"),
    };
    let _ = next_event(&mut events).await; // Initial state

    server
        .manager()
        .access(&session_id, |s| {
            s.component_mut::<Label>(&status_key()).unwrap().set_text("from server");
        })
        .await
        .unwrap();

    wait_for_label(&client, &mut events, "from server").await;
}

#[tokio::test]
async fn test_reconnect_resumes_session() {
    let (server, port) = start_test_server().await;
    let (mut client, mut events) = connect_client(port).await;
    let first_id = match next_event(&mut events).await {
        SyncEvent::Connected { session_id, .. } => session_id,
        other => panic!("Expected Connected event, got {other:?}"),
    };
    let _ = next_event(&mut events).await; // Initial state

    client.disconnect();
    loop {
        if let SyncEvent::Disconnected = next_event(&mut events).await {
            break;
        }
    }
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

    client.connect().await.unwrap();
    match next_event(&mut events).await {
        SyncEvent::Connected { session_id, resumed } => {
            assert_eq!(session_id, first_id);
            assert!(resumed);
        }
        other => panic!("Expected Connected event, got {other:?}"),
    }
    assert_eq!(server.manager().session_count().await, 1);
}

#[tokio::test]
async fn test_ping_and_stats() {
    let (server, port) = start_test_server().await;
    let (client, mut events) = connect_client(port).await;
    let _ = next_event(&mut events).await; // Connected
    let _ = next_event(&mut events).await; // Initial state

    assert!(client.ping().await.is_ok());
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 1);
    assert!(stats.total_messages >= 2);
    assert!(stats.cycles >= 1);
    assert_eq!(stats.protocol_faults, 0);
}
