//! End-to-end tests over whole in-process control planes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleetstate_core::config::FleetstateConfig;
use fleetstate_core::encryption::Cryptor;
use fleetstate_core::envelope::{EnvelopeFormat, Serializer};
use fleetstate_core::lock::{InMemoryLockService, LockService};
use fleetstate_core::store::{SchemaState, SqliteStore};
use fleetstate_daemon::readiness;
use fleetstate_daemon::runtime::{ControlPlane, RuntimeError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

const READY_TIMEOUT: Duration = Duration::from_secs(10);

fn config(db_path: &Path, encryption: &str) -> FleetstateConfig {
    let toml = format!(
        r#"
        [encryption]
        {encryption}

        [lock]
        ttl_secs = 2
        retry_interval_ms = 25

        [migration]
        batch_size = 2

        [store]
        db_path = "{db}"
        "#,
        db = db_path.display(),
    );
    FleetstateConfig::from_toml(&toml).unwrap()
}

fn serializer_for(config: &FleetstateConfig) -> Serializer {
    Serializer::new(Cryptor::new(Arc::new(config.build_key_manager().unwrap())))
}

async fn wait_ready(plane: &ControlPlane) {
    let mut ready = plane.readiness.clone();
    timeout(READY_TIMEOUT, ready.wait_for(|r| *r))
        .await
        .expect("control plane did not become ready in time")
        .unwrap();
}

#[tokio::test]
async fn fresh_store_migrates_to_current_and_becomes_ready() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let config = config(
        &db_path,
        r#"active_key_label = "a"
        active_key_passphrase = "secret""#,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = Arc::new(InMemoryLockService::new());
    let mut plane =
        ControlPlane::start(&config, "node-1".to_string(), service, shutdown_rx).unwrap();

    assert!(!*plane.readiness.borrow());
    wait_ready(&plane).await;

    let state = SqliteStore::open(&db_path)
        .unwrap()
        .schema_state()
        .unwrap()
        .unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.migration_name, "re_encode_envelopes");
    assert_eq!(state.key_label, "a");
    assert_eq!(state.target_format, EnvelopeFormat::Encrypted);

    shutdown_tx.send(true).unwrap();
    plane.wait().await.unwrap();
    assert!(!*plane.readiness.borrow());
    plane.stop().await;
}

#[tokio::test]
async fn standby_plane_stays_unready_until_the_leader_departs() {
    let dir = tempfile::tempdir().unwrap();
    let service = Arc::new(InMemoryLockService::new());
    let encryption = r#"active_key_label = "a"
        active_key_passphrase = "secret""#;

    let leader_config = config(&dir.path().join("leader.db"), encryption);
    let (leader_shutdown, leader_shutdown_rx) = watch::channel(false);
    let mut leader = ControlPlane::start(
        &leader_config,
        "node-1".to_string(),
        Arc::clone(&service),
        leader_shutdown_rx,
    )
    .unwrap();
    wait_ready(&leader).await;

    let standby_config = config(&dir.path().join("standby.db"), encryption);
    let (_standby_shutdown, standby_shutdown_rx) = watch::channel(false);
    let standby = ControlPlane::start(
        &standby_config,
        "node-2".to_string(),
        Arc::clone(&service),
        standby_shutdown_rx,
    )
    .unwrap();

    // While the leader holds the lock the standby must neither run
    // migrations nor report ready.
    let mut standby_ready = standby.readiness.clone();
    let blocked = timeout(Duration::from_millis(500), standby_ready.wait_for(|r| *r)).await;
    assert!(blocked.is_err(), "standby became ready while lock was held");
    assert_eq!(
        SqliteStore::open(dir.path().join("standby.db"))
            .unwrap()
            .schema_state()
            .unwrap(),
        None
    );

    leader_shutdown.send(true).unwrap();
    leader.wait().await.unwrap();
    leader.stop().await;

    // The released lock lets the standby win its own election and catch up.
    wait_ready(&standby).await;
    assert_eq!(
        SqliteStore::open(dir.path().join("standby.db"))
            .unwrap()
            .schema_state()
            .unwrap()
            .unwrap()
            .version,
        2
    );
}

#[tokio::test]
async fn restart_with_rotated_key_re_encodes_existing_rows() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state.db");
    let old_config = config(
        &db_path,
        r#"active_key_label = "a"
        active_key_passphrase = "old-secret""#,
    );

    // A store as a crashed previous deployment left it: schema at v1, rows
    // mixed between plaintext and the old key.
    let payloads: Vec<Vec<u8>> = (0u8..5).map(|i| vec![i; 16]).collect();
    {
        let store = SqliteStore::open(&db_path).unwrap();
        store
            .execute_batch(
                "CREATE TABLE records (id INTEGER PRIMARY KEY AUTOINCREMENT, payload BLOB NOT NULL);",
            )
            .unwrap();
        let old = serializer_for(&old_config);
        for (i, payload) in payloads.iter().enumerate() {
            let format = if i % 2 == 0 {
                EnvelopeFormat::Raw
            } else {
                EnvelopeFormat::Encrypted
            };
            store
                .insert_record(&old.encode(payload, format).unwrap())
                .unwrap();
        }
        store
            .set_schema_state(&SchemaState {
                version: 1,
                migration_name: "init_schema".to_string(),
                target_format: EnvelopeFormat::Raw,
                key_label: "a".to_string(),
            })
            .unwrap();
    }

    let new_config = config(
        &db_path,
        r#"active_key_label = "b"
        active_key_passphrase = "new-secret"
        legacy_keys = [
            { label = "a", passphrase = "old-secret" },
        ]"#,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = Arc::new(InMemoryLockService::new());
    let mut plane =
        ControlPlane::start(&new_config, "node-1".to_string(), service, shutdown_rx).unwrap();
    wait_ready(&plane).await;
    shutdown_tx.send(true).unwrap();
    plane.wait().await.unwrap();
    plane.stop().await;

    let store = SqliteStore::open(&db_path).unwrap();
    let state = store.schema_state().unwrap().unwrap();
    assert_eq!(state.version, 2);
    assert_eq!(state.key_label, "b");

    // Every row is now encrypted under the rotated key and still decodes to
    // its original payload.
    let new = serializer_for(&new_config);
    let rows = store.read_record_batch(0, 100).unwrap();
    assert_eq!(rows.len(), payloads.len());
    for (row, payload) in rows.iter().zip(&payloads) {
        let info = new.inspect(&row.payload).unwrap();
        assert_eq!(info.format, EnvelopeFormat::Encrypted);
        assert_eq!(info.key_label.as_deref(), Some("b"));
        assert_eq!(new.decode(&row.payload).unwrap(), *payload);
    }
}

#[tokio::test]
async fn wait_reports_leadership_loss_as_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(
        &dir.path().join("state.db"),
        r#"active_key_label = "a"
        active_key_passphrase = "secret""#,
    );

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let service = Arc::new(InMemoryLockService::new());
    let mut plane = ControlPlane::start(
        &config,
        "node-1".to_string(),
        Arc::clone(&service),
        shutdown_rx,
    )
    .unwrap();
    wait_ready(&plane).await;

    // Steal the lock out from under the leader; the next renewal reports
    // loss and the plane surfaces it as a fatal error.
    service.release("fleetstate", "node-1").await.unwrap();
    assert!(service
        .acquire("fleetstate", "intruder", Duration::from_secs(60))
        .await
        .unwrap());

    let err = timeout(READY_TIMEOUT, plane.wait())
        .await
        .expect("leadership loss was not reported")
        .unwrap_err();
    assert!(matches!(err, RuntimeError::LeadershipLost { epoch: 1 }));
    assert!(!*plane.readiness.borrow());
}

async fn http_get_ready(addr: std::net::SocketAddr) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ready HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn ready_endpoint_tracks_the_readiness_signal() {
    let (ready_tx, ready_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(readiness::serve(listener, ready_rx, shutdown_rx));

    let response = http_get_ready(addr).await;
    assert!(response.starts_with("HTTP/1.1 503"));
    assert!(response.ends_with("not ready\n"));

    ready_tx.send(true).unwrap();
    let response = http_get_ready(addr).await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok\n"));

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap()
        .unwrap();
}
