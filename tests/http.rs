#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::time::{Duration, Instant};

use graphql_client_sdk::error::Kind;
use graphql_client_sdk::http::{Client, RetryPolicy};
use graphql_client_sdk::ops::{OperationOption, OperationShape};
use httpmock::prelude::*;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize, PartialEq)]
struct UserData {
    user: User,
}

#[derive(Debug, Deserialize, PartialEq)]
struct User {
    name: String,
}

#[tokio::test]
async fn query_decodes_data() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/graphql")
                .body_contains(r#""operationName":"Viewer""#)
                .body_contains("query Viewer { user { name } }");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({"data": {"user": {"name": "gopher"}}}));
        })
        .await;

    let client = Client::new(&server.url("/graphql")).unwrap();
    let shape = OperationShape::builder().selection("user { name }").build();

    let data: UserData = client
        .query(
            &shape,
            None,
            &[OperationOption::OperationName("Viewer".to_owned())],
        )
        .await
        .unwrap();

    assert_eq!(data.user.name, "gopher");
    mock.assert_async().await;
}

#[tokio::test]
async fn graphql_errors_surface_as_structured_list() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/graphql");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": null,
                    "errors": [{
                        "message": "Field 'user' is missing required arguments: login",
                        "locations": [{"line": 7, "column": 3}],
                    }],
                }));
        })
        .await;

    let client = Client::new(&server.url("/graphql")).unwrap();
    let err = client
        .exec::<UserData>("query { user { name } }", None, None)
        .await
        .expect_err("execution errors should fail the call");

    assert_eq!(err.kind(), Kind::GraphQL);
    let errors = err.graphql_errors().expect("graphql error list");
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("missing required arguments"));
    assert_eq!(errors[0].locations[0].line, 7);
}

#[tokio::test]
async fn execute_preserves_partial_data() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/graphql");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {"node1": {"id": "n1"}, "node2": null},
                    "errors": [{"message": "node2 does not exist", "path": ["node2"]}],
                }));
        })
        .await;

    let client = Client::new(&server.url("/graphql")).unwrap();
    let response = client
        .execute(&graphql_client_sdk::types::GraphqlRequest::new(
            "query { node1 { id } node2 { id } }",
            None,
            None,
        ))
        .await
        .unwrap();

    assert!(response.has_errors());
    let data: serde_json::Value =
        serde_json::from_slice(&response.data_bytes().expect("partial data")).unwrap();
    assert_eq!(data["node1"]["id"], "n1");
    assert!(data["node2"].is_null());
}

#[tokio::test]
async fn extensions_are_returned_alongside_data() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/graphql");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "data": {"user": {"name": "gopher"}},
                    "extensions": {"id": 1, "domain": "users"},
                }));
        })
        .await;

    let client = Client::new(&server.url("/graphql")).unwrap();
    let (data, extensions) = client
        .exec_raw_with_extensions("query { user { name } }", None, None)
        .await
        .unwrap();

    let data: serde_json::Value = serde_json::from_slice(&data).unwrap();
    assert_eq!(data["user"]["name"], "gopher");

    let extensions: serde_json::Value =
        serde_json::from_slice(&extensions.expect("extensions payload")).unwrap();
    assert_eq!(extensions["id"], 1);
    assert_eq!(extensions["domain"], "users");
}

#[tokio::test]
async fn retries_until_the_budget_is_exhausted() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/graphql");
            then.status(503).body("overloaded");
        })
        .await;

    let policy = RetryPolicy::builder()
        .max_retries(2)
        .initial_backoff(Duration::from_millis(20))
        .max_backoff(Duration::from_millis(50))
        .build();
    let client = Client::new(&server.url("/graphql")).unwrap().with_retry(policy);

    let err = client
        .exec::<UserData>("query { user { name } }", None, None)
        .await
        .expect_err("a persistent 503 must fail");

    assert_eq!(err.kind(), Kind::Status);
    // Initial attempt plus two retries.
    mock.assert_hits_async(3).await;
}

#[tokio::test]
async fn retry_after_header_is_honored() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/graphql");
            then.status(429).header("Retry-After", "1").body("slow down");
        })
        .await;

    let policy = RetryPolicy::builder()
        .max_retries(1)
        .initial_backoff(Duration::from_millis(1))
        .max_backoff(Duration::from_millis(2))
        .build();
    let client = Client::new(&server.url("/graphql")).unwrap().with_retry(policy);

    let started = Instant::now();
    let err = client
        .exec::<UserData>("query { user { name } }", None, None)
        .await
        .expect_err("the mock always responds 429");

    assert_eq!(err.kind(), Kind::Status);
    mock.assert_hits_async(2).await;
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "the server-provided delay should beat the configured backoff"
    );
}

#[tokio::test]
async fn non_retryable_status_fails_immediately() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/graphql");
            then.status(400).body("bad request");
        })
        .await;

    let client = Client::new(&server.url("/graphql")).unwrap().with_retry(RetryPolicy::default());

    let err = client
        .exec::<UserData>("query { user { name } }", None, None)
        .await
        .expect_err("a 400 is not retryable");

    assert_eq!(err.kind(), Kind::Status);
    let status = err
        .downcast_ref::<graphql_client_sdk::error::Status>()
        .expect("status error payload");
    assert_eq!(status.status_code.as_u16(), 400);
    assert!(status.message.contains("bad request"));
    mock.assert_hits_async(1).await;
}
