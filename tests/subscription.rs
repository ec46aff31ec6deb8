#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use graphql_client_sdk::error::Error;
use graphql_client_sdk::subscription::{ClientStatus, SubscriptionClient, SubscriptionStatus};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{MockGraphqlServer, ServerBehavior, wait_until};

fn spawn_run(
    client: &SubscriptionClient,
) -> tokio::task::JoinHandle<graphql_client_sdk::Result<()>> {
    let client = client.clone();
    tokio::spawn(async move { client.run().await })
}

#[tokio::test]
async fn lifecycle_events() {
    let mut server = MockGraphqlServer::start(ServerBehavior {
        ack: true,
        complete_on_stop: true,
        ..ServerBehavior::default()
    })
    .await;

    let was_connected = Arc::new(AtomicBool::new(false));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let completed_queries = Arc::new(Mutex::new(Vec::<String>::new()));

    let client = {
        let was_connected = Arc::clone(&was_connected);
        let disconnects = Arc::clone(&disconnects);
        let completed_queries = Arc::clone(&completed_queries);
        SubscriptionClient::new(server.url())
            .with_retry_timeout(Duration::from_secs(5))
            .on_connected(move || {
                was_connected.store(true, Ordering::SeqCst);
            })
            .on_disconnected(move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            })
            .on_subscription_complete(move |sub| {
                completed_queries
                    .lock()
                    .unwrap()
                    .push(sub.payload().query.clone());
            })
    };

    let alpha_events = Arc::new(AtomicUsize::new(0));
    let beta_events = Arc::new(AtomicUsize::new(0));

    let alpha_id = {
        let alpha_events = Arc::clone(&alpha_events);
        client
            .exec("subscription { alpha }", None, None, move |event| {
                let data = event?;
                let value: Value = serde_json::from_slice(&data)?;
                assert_eq!(value["alpha"], 1);
                alpha_events.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap()
    };
    let beta_id = {
        let beta_events = Arc::clone(&beta_events);
        client
            .exec("subscription { beta }", None, None, move |event| {
                let data = event?;
                let value: Value = serde_json::from_slice(&data)?;
                assert_eq!(value["beta"], 2);
                beta_events.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap()
    };

    let runner = spawn_run(&client);

    server.expect_message("connection_init").await;
    let first = server.expect_message("start").await;
    let second = server.expect_message("start").await;

    let query_of = |frame: &Value| frame["payload"]["query"].as_str().unwrap().to_owned();
    let (alpha_wire_id, beta_wire_id) = if query_of(&first).contains("alpha") {
        (first["id"].clone(), second["id"].clone())
    } else {
        (second["id"].clone(), first["id"].clone())
    };

    server.send_data(alpha_wire_id.as_str().unwrap(), &json!({"alpha": 1}));
    server.send_data(beta_wire_id.as_str().unwrap(), &json!({"beta": 2}));

    assert!(
        wait_until(
            || {
                alpha_events.load(Ordering::SeqCst) == 1 && beta_events.load(Ordering::SeqCst) == 1
            },
            Duration::from_secs(5)
        )
        .await,
        "both handlers should observe their data frame"
    );

    client.unsubscribe(&alpha_id).await.unwrap();
    server.expect_message("stop").await;
    client.unsubscribe(&beta_id).await.unwrap();
    server.expect_message("stop").await;

    // exit_when_no_subscription defaults to true: once the server completed
    // both subscriptions the run loop winds down by itself.
    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("run should return after the last completion")
        .unwrap();
    assert!(result.is_ok());

    let completed = completed_queries.lock().unwrap().clone();
    assert_eq!(completed.len(), 2);
    assert!(completed.iter().any(|query| query.contains("alpha")));
    assert!(completed.iter().any(|query| query.contains("beta")));

    assert!(was_connected.load(Ordering::SeqCst));
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_on_configured_close_status() {
    let server = MockGraphqlServer::start(ServerBehavior {
        ack: true,
        close_on_connect: Some(4400),
        ..ServerBehavior::default()
    })
    .await;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let error_callbacks = Arc::new(AtomicUsize::new(0));

    let client = {
        let disconnects = Arc::clone(&disconnects);
        let error_callbacks = Arc::clone(&error_callbacks);
        SubscriptionClient::new(server.url())
            .with_retry_status_codes(["4400"])
            .unwrap()
            .with_retry_delay(Duration::from_millis(50))
            .on_disconnected(move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                error_callbacks.fetch_add(1, Ordering::SeqCst);
                None
            })
    };

    client
        .exec("subscription { tick }", None, None, |_| Ok(()))
        .await
        .unwrap();

    let runner = spawn_run(&client);

    assert!(
        wait_until(
            || disconnects.load(Ordering::SeqCst) >= 5,
            Duration::from_secs(10)
        )
        .await,
        "the client should reconnect through repeated 4400 closes"
    );

    // Retry-listed closes bypass the user error callback entirely.
    assert_eq!(error_callbacks.load(Ordering::SeqCst), 0);
    assert!(server.connection_count() >= 5);

    client.close().await.unwrap();
    let result = timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn graceful_cancellation() {
    let server = MockGraphqlServer::start(ServerBehavior::acking()).await;

    let connected = Arc::new(AtomicBool::new(false));
    let disconnected = Arc::new(AtomicBool::new(false));

    let client = {
        let connected = Arc::clone(&connected);
        let disconnected = Arc::clone(&disconnected);
        SubscriptionClient::new(server.url())
            .on_connected(move || {
                connected.store(true, Ordering::SeqCst);
            })
            .on_disconnected(move || {
                disconnected.store(true, Ordering::SeqCst);
            })
    };

    client
        .exec("subscription { tick }", None, None, |_| Ok(()))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move { client.run_with_token(token).await })
    };

    assert!(wait_until(|| connected.load(Ordering::SeqCst), Duration::from_secs(5)).await);

    token.cancel();

    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("run should return shortly after cancellation")
        .unwrap();
    assert!(result.is_ok());
    assert!(disconnected.load(Ordering::SeqCst));
    assert_eq!(client.status(), ClientStatus::Closing);
}

#[tokio::test]
async fn rerun_preserves_registry_with_fresh_session_ids() {
    let server = MockGraphqlServer::start(ServerBehavior::acking()).await;

    let client = SubscriptionClient::new(server.url());

    let first_key = client
        .exec("subscription { alpha }", None, None, |_| Ok(()))
        .await
        .unwrap();
    let second_key = client
        .exec("subscription { beta }", None, None, |_| Ok(()))
        .await
        .unwrap();

    let all_running = {
        let client = client.clone();
        move || {
            let subs = client.subscriptions();
            subs.len() == 2
                && subs
                    .values()
                    .all(|sub| sub.status() == SubscriptionStatus::Running)
        }
    };

    let token = CancellationToken::new();
    let runner = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move { client.run_with_token(token).await })
    };

    assert!(wait_until(all_running.clone(), Duration::from_secs(5)).await);
    let before: std::collections::HashMap<String, String> = client
        .subscriptions()
        .into_iter()
        .map(|(key, sub)| (key, sub.id().to_owned()))
        .collect();

    token.cancel();
    let result = timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert!(result.is_ok());

    // Stopping the run loop keeps registrations durable; a new run resumes
    // them under fresh per-session ids.
    let runner = spawn_run(&client);
    assert!(wait_until(all_running, Duration::from_secs(5)).await);

    let after: std::collections::HashMap<String, String> = client
        .subscriptions()
        .into_iter()
        .map(|(key, sub)| (key, sub.id().to_owned()))
        .collect();

    assert_eq!(after.len(), 2);
    for key in [&first_key, &second_key] {
        assert!(after.contains_key(key.as_str()));
        assert_ne!(before[key.as_str()], after[key.as_str()]);
    }

    client.close().await.unwrap();
    let result = timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn initialisation_timeout_synthesizes_4408() {
    // A server that never acknowledges the init handshake.
    let server = MockGraphqlServer::start(ServerBehavior::default()).await;

    let observed_status = Arc::new(Mutex::new(None::<i32>));

    let client = {
        let observed_status = Arc::clone(&observed_status);
        SubscriptionClient::new(server.url())
            .with_connection_initialisation_timeout(Duration::from_millis(400))
            .on_error(move |error| {
                let code = error.as_close_status().map(|status| status.code);
                *observed_status.lock().unwrap() = code;
                Some(Error::close_status(4408, "init timeout"))
            })
    };

    client
        .exec("subscription { tick }", None, None, |_| Ok(()))
        .await
        .unwrap();

    let started = Instant::now();
    let result = timeout(Duration::from_secs(5), client.run())
        .await
        .expect("run should fail fast on init timeout");
    let elapsed = started.elapsed();

    assert!(result.is_err());
    assert_eq!(*observed_status.lock().unwrap(), Some(4408));
    assert!(
        elapsed >= Duration::from_millis(400) && elapsed < Duration::from_secs(3),
        "timeout should fire near the configured deadline, took {elapsed:?}"
    );
}

#[tokio::test]
async fn handler_stop_sentinel_shuts_the_client_down() {
    let mut server = MockGraphqlServer::start(ServerBehavior::acking()).await;

    let client = SubscriptionClient::new(server.url()).with_sync_mode(true);

    client
        .exec("subscription { tick }", None, None, |event| {
            let _ = event?;
            Err(Error::subscription_stopped())
        })
        .await
        .unwrap();

    let runner = spawn_run(&client);

    let start = server.expect_message("start").await;
    server.send_data(start["id"].as_str().unwrap(), &json!({"tick": 1}));

    let result = timeout(Duration::from_secs(5), runner)
        .await
        .expect("the stop sentinel should end the run loop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn websocket_keep_alive_pings_the_server() {
    let server = MockGraphqlServer::start(ServerBehavior::acking()).await;

    let client = SubscriptionClient::new(server.url())
        .with_websocket_keep_alive(Duration::from_millis(100));

    client
        .exec("subscription { tick }", None, None, |_| Ok(()))
        .await
        .unwrap();

    let runner = spawn_run(&client);

    assert!(
        wait_until(|| server.ping_count() >= 2, Duration::from_secs(5)).await,
        "keep-alive should ping on the configured interval"
    );

    client.close().await.unwrap();
    let result = timeout(Duration::from_secs(5), runner).await.unwrap().unwrap();
    assert!(result.is_ok());
}
