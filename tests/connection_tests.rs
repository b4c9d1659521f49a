//! End-to-end tests against a scripted mock Miniserver.
//!
//! The mock serves the reachability probe over HTTP and speaks the binary
//! framing protocol over a real WebSocket, so these tests exercise the full
//! open/authenticate/command/state-update/close path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockMiniserver, MockOptions};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use loxone_client::{
    AuthenticationMethod, ConnectionConfig, ConnectionState, Credentials, LoxoneError,
    MiniserverConnection, SubscriberTable, Uuid,
};

fn switch_uuid() -> Uuid {
    "0f86a2fe-0378-3634-ffff403fb0c34b9e".parse().unwrap()
}

fn active_state_uuid() -> Uuid {
    "0f86a2fe-0378-3635-ffff403fb0c34b9e".parse().unwrap()
}

fn config_for(mock: &MockMiniserver) -> ConnectionConfig {
    let mut config = ConnectionConfig::new(mock.address.clone());
    config.keep_alive = Duration::ZERO;
    config
}

async fn open_connection(mock: &MockMiniserver) -> MiniserverConnection {
    let connection = MiniserverConnection::new(config_for(mock));
    connection
        .set_credentials(Credentials::new("app", "secret"))
        .unwrap();
    connection.open(CancellationToken::new()).await.unwrap();
    connection
}

#[tokio::test]
async fn token_handshake_runs_for_modern_firmware() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = open_connection(&mock).await;

    assert_eq!(connection.state(), ConnectionState::Open);
    let info = connection.miniserver_info();
    assert_eq!(info.serial_number.as_deref(), Some("50:4F:94:AA:BB:CC"));
    assert_eq!(info.firmware_version.unwrap().to_string(), "12.0.2.24");

    let log = mock.command_log();
    assert!(log[0].starts_with("jdev/sys/getkey2/app"), "got {log:?}");
    assert!(log[1].starts_with("jdev/sys/getjwt/"), "got {log:?}");
    assert!(connection.auth_token().is_some());

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Disposed);
}

#[tokio::test]
async fn password_handshake_runs_for_legacy_firmware() {
    let mock = MockMiniserver::start("8.3.4.2").await;
    let connection = open_connection(&mock).await;

    let log = mock.command_log();
    assert_eq!(log[0], "jdev/sys/getkey");
    assert!(log[1].starts_with("authenticate/"), "got {log:?}");
    assert!(connection.auth_token().is_none());

    connection.close().await;
}

#[tokio::test]
async fn explicit_method_overrides_firmware_selection() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let mut config = config_for(&mock);
    config.auth_method = AuthenticationMethod::Password;

    let connection = MiniserverConnection::new(config);
    connection
        .set_credentials(Credentials::new("app", "secret"))
        .unwrap();
    connection.open(CancellationToken::new()).await.unwrap();

    let log = mock.command_log();
    assert_eq!(log[0], "jdev/sys/getkey");
    connection.close().await;
}

#[tokio::test]
async fn command_round_trip() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = open_connection(&mock).await;

    let response = connection.command(switch_uuid(), "on").await.unwrap();
    assert_eq!(response.code, 200);
    assert_eq!(response.value_as_str(), Some("1"));

    let expected = format!("jdev/sps/io/{}/on", switch_uuid());
    assert!(mock.command_log().contains(&expected));

    connection.close().await;
}

#[tokio::test]
async fn value_states_reach_the_registered_subscriber() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = open_connection(&mock).await;

    let mut builder = SubscriberTable::builder();
    let mut states = builder.subscribe_values([active_state_uuid()]);
    connection.router().install(builder.build());

    connection.enable_status_updates().await.unwrap();
    assert!(mock
        .command_log()
        .contains(&"jdev/sps/enablebinstatusupdate".to_string()));

    mock.push_value_state(active_state_uuid(), 1.0);
    let state = tokio::time::timeout(Duration::from_secs(2), states.recv())
        .await
        .expect("state update")
        .unwrap();
    assert_eq!(state.control, active_state_uuid());
    assert_eq!(state.value, 1.0);

    // Two-stage length announcement decodes the same way.
    mock.push_value_state_estimated(active_state_uuid(), 2.0);
    let state = tokio::time::timeout(Duration::from_secs(2), states.recv())
        .await
        .expect("state update")
        .unwrap();
    assert_eq!(state.value, 2.0);

    connection.close().await;
}

#[tokio::test]
async fn structure_file_download_and_version() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = open_connection(&mock).await;

    let structure = connection.download_structure_file().await.unwrap();
    assert_eq!(structure.controls().len(), 1);
    assert!(structure.controls().contains_key(&switch_uuid()));

    let last_modified = connection.structure_file_last_modified().await.unwrap();
    assert_eq!(last_modified.to_string(), "2023-11-04 17:31:00");

    connection.close().await;
}

#[tokio::test]
async fn rejected_credentials_roll_back_to_constructed() {
    let mut options = MockOptions::version("12.0.2.24");
    options.reject_auth = true;
    let mock = MockMiniserver::start_with(options).await;

    let connection = MiniserverConnection::new(config_for(&mock));
    connection
        .set_credentials(Credentials::new("app", "wrong"))
        .unwrap();

    let err = connection.open(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, LoxoneError::Authentication(_)), "got {err}");
    assert_eq!(connection.state(), ConnectionState::Constructed);
}

#[tokio::test]
async fn second_open_on_an_open_connection_fails() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = open_connection(&mock).await;

    let err = connection.open(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, LoxoneError::InvalidState(_)));
    assert_eq!(connection.state(), ConnectionState::Open);

    connection.close().await;
}

#[tokio::test]
async fn second_command_fails_fast_while_one_is_pending() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = Arc::new(open_connection(&mock).await);

    let background = Arc::clone(&connection);
    let uuid = switch_uuid();
    let first = tokio::spawn(async move { background.command(uuid, "noreply").await });

    // Wait until the first command is on the wire.
    tokio::time::timeout(Duration::from_secs(2), async {
        while !mock
            .command_log()
            .iter()
            .any(|command| command.ends_with("/noreply"))
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let err = connection.command(uuid, "on").await.unwrap_err();
    assert!(matches!(err, LoxoneError::CommandPending));

    // The rejected command never reached the socket.
    let io_commands = mock
        .command_log()
        .iter()
        .filter(|command| command.starts_with("jdev/sps/io/"))
        .count();
    assert_eq!(io_commands, 1);

    connection.close().await;
    let outcome = first.await.unwrap();
    assert!(outcome.is_err(), "pending command fails on teardown");
}

#[tokio::test]
async fn concurrent_close_results_in_one_teardown() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = Arc::new(open_connection(&mock).await);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let connection = Arc::clone(&connection);
        tasks.push(tokio::spawn(async move { connection.close().await }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(connection.state(), ConnectionState::Disposed);
    assert!(matches!(
        connection.command(switch_uuid(), "on").await,
        Err(LoxoneError::Disposed)
    ));
}

#[tokio::test]
async fn keep_alive_messages_flow_without_disturbing_commands() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let mut config = config_for(&mock);
    config.keep_alive = Duration::from_millis(50);

    let connection = MiniserverConnection::new(config);
    connection
        .set_credentials(Credentials::new("app", "secret"))
        .unwrap();
    connection.open(CancellationToken::new()).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while !mock.command_log().contains(&"keepalive".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("keep-alive sent");

    // The keep-alive response frame is consumed by the unsolicited handler;
    // command correlation is unaffected.
    let response = connection.command(switch_uuid(), "on").await.unwrap();
    assert_eq!(response.code, 200);

    connection.close().await;
}

#[tokio::test]
async fn external_cancellation_cascades_into_the_connection() {
    let mock = MockMiniserver::start("12.0.2.24").await;
    let connection = Arc::new(MiniserverConnection::new(config_for(&mock)));
    connection
        .set_credentials(Credentials::new("app", "secret"))
        .unwrap();

    let external = CancellationToken::new();
    connection.open(external.clone()).await.unwrap();

    let background = Arc::clone(&connection);
    let uuid = switch_uuid();
    let pending = tokio::spawn(async move { background.command(uuid, "noreply").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Cancelling the external token unwinds the receive loop, which every
    // in-flight operation observes as cancellation.
    external.cancel();
    let outcome = pending.await.unwrap();
    assert!(matches!(outcome, Err(LoxoneError::Cancelled)), "got {outcome:?}");

    connection.close().await;
    assert_eq!(connection.state(), ConnectionState::Disposed);
}
