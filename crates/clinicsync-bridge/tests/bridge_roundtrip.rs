use std::sync::Arc;
use std::time::Duration;

use clinicsync_bridge::config::BridgeConfig;
use clinicsync_bridge::{app_router, bootstrap_schema, AppState};
use clinicsync_core::models::{Row, SqlValue, Statement, SyncSchema};
use clinicsync_core::remote::protocol::WriteRequest;
use clinicsync_core::remote::{BridgeClient, LibSqlRemote, RemoteExecutor};
use pretty_assertions::assert_eq;

struct Running {
    base_url: String,
    token: String,
}

async fn start() -> Running {
    let store = Arc::new(LibSqlRemote::open_in_memory().await.unwrap());
    bootstrap_schema(&store).await.unwrap();

    let config = Arc::new(
        BridgeConfig::from_lookup(|key| match key {
            "BRIDGE_DATABASE_URL" => Some(":memory:".to_string()),
            "BRIDGE_CHANGES_LIMIT" => Some("50".to_string()),
            _ => None,
        })
        .unwrap(),
    );
    let state = AppState::new(config, store, &SyncSchema::clinic());
    state.tokens().ensure_schema().await.unwrap();
    let issued = state.tokens().issue(Some("tests".to_string()), None).await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let router = app_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    Running {
        base_url: format!("http://{address}"),
        token: issued.token,
    }
}

fn client(running: &Running, token: Option<&str>) -> BridgeClient {
    BridgeClient::new(
        &running.base_url,
        token.map(str::to_string),
        Duration::from_secs(5),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn health_is_public_and_queries_need_a_token() {
    let running = start().await;

    client(&running, None).health().await.unwrap();

    let anonymous = client(&running, None)
        .execute(&Statement::new("SELECT * FROM branches"))
        .await
        .unwrap_err();
    assert!(!anonymous.is_transient());
    assert!(anonymous.to_string().contains("401"));

    let forged = client(&running, Some("csb_forged"))
        .execute(&Statement::new("SELECT * FROM branches"))
        .await
        .unwrap_err();
    assert!(forged.to_string().contains("401"));
}

#[tokio::test(flavor = "multi_thread")]
async fn statements_round_trip_through_the_bridge() {
    let running = start().await;
    let client = client(&running, Some(&running.token));

    let inserted = client
        .execute(
            &Statement::new("INSERT INTO registrations (patient_name, updated_at) VALUES (?, NOW())")
                .bind("Asha"),
        )
        .await
        .unwrap();
    assert_eq!(inserted.mutation().unwrap().last_insert_id, Some(1));

    let rows = client
        .execute(&Statement::new("SELECT registration_id, patient_name FROM registrations"))
        .await
        .unwrap();
    assert_eq!(
        rows.rows(),
        &[Row::new().with("registration_id", 1).with("patient_name", "Asha")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unsafe_statements_are_rejected_as_validation_errors() {
    let running = start().await;
    let client = client(&running, Some(&running.token));

    for sql in [
        "SELECT * FROM bridge_tokens",
        "DROP TABLE registrations",
        "SET NAMES utf8mb4",
    ] {
        let error = client.execute(&Statement::new(sql)).await.unwrap_err();
        assert!(error.is_validation(), "{sql}: {error:?}");
    }

    let error = client
        .write(&WriteRequest::insert(
            "registrations",
            Row::new().with("patient_name)--", "x"),
        ))
        .await
        .unwrap_err();
    assert!(error.is_validation());

    // Rejected by the store itself: permanent, not retried.
    let error = client
        .execute(&Statement::new("SELECT no_such_column FROM registrations"))
        .await
        .unwrap_err();
    assert!(!error.is_transient() && !error.is_validation(), "{error:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_batches_and_change_feed() {
    let running = start().await;
    let client = client(&running, Some(&running.token));

    let written = client
        .write(&WriteRequest::insert(
            "branches",
            Row::new()
                .with("name", "Main")
                .with("updated_at", "2024-05-01 09:00:00"),
        ))
        .await
        .unwrap();
    assert_eq!(written.last_insert_id, Some(1));

    let results = client
        .batch(vec![
            WriteRequest::update(
                "branches",
                Row::new().with("updated_at", "2024-05-02 09:00:00"),
                "branch_id",
                1,
            ),
            WriteRequest::insert(
                "payments",
                Row::new()
                    .with("registration_id", 7)
                    .with("amount", 120.0)
                    .with("created_at", "2024-05-02 10:00:00"),
            ),
        ])
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].rows_affected, 1);

    // One bad write rolls back the whole batch.
    let failed = client
        .batch(vec![
            WriteRequest::insert("branches", Row::new().with("name", "East")),
            WriteRequest::insert("ghosts", Row::new().with("name", "x")),
        ])
        .await;
    assert!(failed.is_err());

    let feed = client.changes_since(Some("2024-05-01 12:00:00"), None).await.unwrap();
    assert_eq!(feed.keys().collect::<Vec<_>>(), vec!["branches", "payments"]);
    assert_eq!(
        feed["branches"][0].get("updated_at"),
        Some(&SqlValue::from("2024-05-02 09:00:00"))
    );

    let branches = client
        .execute(&Statement::new("SELECT COUNT(*) AS n FROM branches"))
        .await
        .unwrap();
    assert_eq!(branches.rows()[0].get("n"), Some(&SqlValue::Integer(1)));
}

#[tokio::test(flavor = "multi_thread")]
async fn change_feed_pages_never_split_equal_markers() {
    let running = start().await;
    let client = client(&running, Some(&running.token));

    for (name, updated_at) in [
        ("Main", "2024-05-01 09:00:00"),
        ("East", "2024-05-01 10:00:00"),
        ("West", "2024-05-01 10:00:00"),
    ] {
        client
            .write(&WriteRequest::insert(
                "branches",
                Row::new().with("name", name).with("updated_at", updated_at),
            ))
            .await
            .unwrap();
    }

    let feed = client.changes_since(None, Some(2)).await.unwrap();
    let names: Vec<Option<&SqlValue>> =
        feed["branches"].iter().map(|row| row.get("name")).collect();
    assert_eq!(
        names,
        vec![
            Some(&SqlValue::from("Main")),
            Some(&SqlValue::from("East")),
            Some(&SqlValue::from("West")),
        ]
    );

    let next = client
        .changes_since(Some("2024-05-01 10:00:00"), Some(2))
        .await
        .unwrap();
    assert!(!next.contains_key("branches"));
}
