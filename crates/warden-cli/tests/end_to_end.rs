//! Statements executed against an in-process daemon.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use warden::policy::{MemoryStore, PolicyManager, StaticLoader};
use warden::rmi::{ErrorKind, Listener, Server};
use warden::service::{PolicyClient, PolicyService};
use warden_cli::{CliError, Column, execute, query};

struct Daemon {
    path: PathBuf,
    _shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn daemon() -> Daemon {
    let manager = Arc::new(PolicyManager::new(Arc::new(MemoryStore::new())));
    let installed = manager
        .install(&StaticLoader::new().with(warden_policy_bluetooth::provider))
        .unwrap();
    assert_eq!(installed, 1);
    manager.load().await.unwrap();

    let mut server = Server::new();
    PolicyService::bind(&mut server, manager);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warden.sock");
    let listener = Listener::create(&path).unwrap();
    let (shutdown, rx) = watch::channel(false);
    tokio::spawn(server.run(listener, rx));
    Daemon {
        path,
        _shutdown: shutdown,
        _dir: dir,
    }
}

async fn run(client: &PolicyClient, statement: &str, admin: Option<&str>) -> Vec<String> {
    let statement = query::parse(statement).unwrap();
    let columns = warden_cli::columns(&statement).to_vec();
    execute(client, &statement, admin)
        .await
        .unwrap()
        .iter()
        .map(|row| row.format(&columns))
        .collect()
}

#[tokio::test]
async fn select_update_select() {
    let daemon = daemon().await;
    let client = PolicyClient::connect(&daemon.path).await.unwrap();

    assert_eq!(
        run(&client, "SELECT * FROM policy", None).await,
        vec!["bluetooth|1"]
    );

    client.enroll("alice").await.unwrap();
    client.enroll("bob").await.unwrap();
    let updated = run(
        &client,
        "UPDATE policy SET value = 5 WHERE name = 'bluetooth';",
        Some("alice"),
    )
    .await;
    assert!(updated.is_empty());
    run(
        &client,
        "UPDATE policy SET value = '10' WHERE name = 'bluetooth'",
        Some("bob"),
    )
    .await;

    assert_eq!(
        run(&client, "select value from policy where name = 'bluetooth'", None).await,
        vec!["10"]
    );

    client.disenroll("bob").await.unwrap();
    assert_eq!(
        run(&client, "SELECT name, value FROM policy", None).await,
        vec!["bluetooth|5"]
    );
}

#[tokio::test]
async fn update_errors() {
    let daemon = daemon().await;
    let client = PolicyClient::connect(&daemon.path).await.unwrap();
    let update = query::parse("UPDATE policy SET value = 3 WHERE name = 'bluetooth'").unwrap();

    let err = execute(&client, &update, None).await.unwrap_err();
    assert!(matches!(err, CliError::MissingAdmin));
    assert_eq!(err.exit_code(), 2);

    let err = execute(&client, &update, Some("mallory")).await.unwrap_err();
    match &err {
        CliError::Rmi(rmi) => assert_eq!(rmi.remote_kind(), Some(ErrorKind::Permission)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), 1);

    client.enroll("alice").await.unwrap();
    let negative = query::parse("UPDATE policy SET value = -1 WHERE name = 'bluetooth'").unwrap();
    let err = execute(&client, &negative, Some("alice")).await.unwrap_err();
    match &err {
        CliError::Rmi(rmi) => assert_eq!(rmi.remote_kind(), Some(ErrorKind::Policy)),
        other => panic!("unexpected error: {other}"),
    }

    let unknown = query::parse("SELECT * FROM policy WHERE name = 'wifi'").unwrap();
    let err = execute(&client, &unknown, None).await.unwrap_err();
    match &err {
        CliError::Rmi(rmi) => assert_eq!(rmi.remote_kind(), Some(ErrorKind::NotFound)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn json_rows() {
    let daemon = daemon().await;
    let client = PolicyClient::connect(&daemon.path).await.unwrap();
    let statement = query::parse("SELECT * FROM policy").unwrap();
    let rows = execute(&client, &statement, None).await.unwrap();
    insta::assert_snapshot!(
        rows[0].to_json(&Column::ALL).to_string(),
        @r#"{"name":"bluetooth","value":1}"#
    );
}
