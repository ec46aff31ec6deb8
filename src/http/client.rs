//! HTTP client for GraphQL queries and mutations.
//!
//! Requests are JSON POSTs of `{query, variables, operationName?}`;
//! responses decode the `{data, errors, extensions}` envelope. Server-side
//! GraphQL errors surface as a structured error list, with partial data
//! still reachable through [`Client::execute`].

use std::sync::Arc;

use backoff::backoff::Backoff;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use url::Url;

use super::retry::{RetryPolicy, retry_after};
use crate::Result;
use crate::error::{Error, GraphqlErrors};
use crate::ops::{OperationOption, OperationShape, construct_mutation, construct_query};
use crate::types::{GraphqlRequest, GraphqlResponse};

type RequestModifier = Arc<dyn Fn(RequestBuilder) -> RequestBuilder + Send + Sync>;

/// HTTP client for GraphQL queries and mutations.
///
/// # Example
///
/// ```no_run
/// use graphql_client_sdk::http::Client;
/// use graphql_client_sdk::ops::OperationShape;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Hero {
///     hero: Name,
/// }
///
/// #[derive(Deserialize)]
/// struct Name {
///     name: String,
/// }
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = Client::new("https://example.com/graphql")?;
/// let shape = OperationShape::builder().selection("hero { name }").build();
/// let hero: Hero = client.query(&shape, None, &[]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    endpoint: Url,
    client: ReqwestClient,
    retry: Option<RetryPolicy>,
    request_modifier: Option<RequestModifier>,
}

impl Client {
    /// Creates a client for the given GraphQL endpoint URL.
    pub fn new(endpoint: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("Accept", HeaderValue::from_static("application/json"));
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        let client = ReqwestClient::builder().default_headers(headers).build()?;

        Ok(Self {
            endpoint: Url::parse(endpoint)?,
            client,
            retry: None,
            request_modifier: None,
        })
    }

    /// Replace the underlying HTTP client, e.g. to configure proxies or
    /// TLS settings.
    #[must_use]
    pub fn with_http_client(mut self, client: ReqwestClient) -> Self {
        self.client = client;
        self
    }

    /// Retry failed requests according to `policy`.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Modify every outgoing request, e.g. to attach authentication
    /// headers.
    #[must_use]
    pub fn with_request_modifier<F>(mut self, modifier: F) -> Self
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send + Sync + 'static,
    {
        self.request_modifier = Some(Arc::new(modifier));
        self
    }

    /// The endpoint requests are sent to.
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Run a query built from a shape descriptor and decode its `data`.
    pub async fn query<T: DeserializeOwned>(
        &self,
        shape: &OperationShape,
        variables: Option<Map<String, Value>>,
        options: &[OperationOption],
    ) -> Result<T> {
        let (query, operation_name) = construct_query(shape, variables.as_ref(), options)?;
        self.exec(query, variables, operation_name).await
    }

    /// Run a mutation built from a shape descriptor and decode its `data`.
    pub async fn mutate<T: DeserializeOwned>(
        &self,
        shape: &OperationShape,
        variables: Option<Map<String, Value>>,
        options: &[OperationOption],
    ) -> Result<T> {
        let (query, operation_name) = construct_mutation(shape, variables.as_ref(), options)?;
        self.exec(query, variables, operation_name).await
    }

    /// Run a raw GraphQL document and decode its `data` into `T`.
    /// Execution errors reported by the server fail the call.
    pub async fn exec<T: DeserializeOwned>(
        &self,
        query: impl Into<String>,
        variables: Option<Map<String, Value>>,
        operation_name: Option<String>,
    ) -> Result<T> {
        let data = self.exec_raw(query, variables, operation_name).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Run a raw GraphQL document and return the raw `data` bytes.
    pub async fn exec_raw(
        &self,
        query: impl Into<String>,
        variables: Option<Map<String, Value>>,
        operation_name: Option<String>,
    ) -> Result<Vec<u8>> {
        let (data, _extensions) = self
            .exec_raw_with_extensions(query, variables, operation_name)
            .await?;
        Ok(data)
    }

    /// Run a raw GraphQL document and return the raw `data` bytes together
    /// with the response's `extensions` payload, when the server sent one.
    pub async fn exec_raw_with_extensions(
        &self,
        query: impl Into<String>,
        variables: Option<Map<String, Value>>,
        operation_name: Option<String>,
    ) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let request = GraphqlRequest::new(query, variables, operation_name);
        let response = self.execute(&request).await?;

        if let Some(errors) = response.errors
            && !errors.is_empty()
        {
            return Err(GraphqlErrors(errors).into());
        }

        let data = response
            .data
            .ok_or_else(|| Error::validation("response contains no data"))?;
        let extensions = response
            .extensions
            .map(|raw| raw.get().as_bytes().to_vec());

        Ok((data.get().as_bytes().to_vec(), extensions))
    }

    /// Execute a request and return the full response envelope, including
    /// partial data alongside any execution errors.
    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self, request), fields(path, status_code))
    )]
    pub async fn execute(&self, request: &GraphqlRequest) -> Result<GraphqlResponse> {
        let path = self.endpoint.path().to_owned();

        #[cfg(feature = "tracing")]
        tracing::Span::current().record("path", path.as_str());

        let mut backoff = self.retry.as_ref().map(backoff::ExponentialBackoff::from);
        let mut attempt: u32 = 0;

        loop {
            let builder = self.client.post(self.endpoint.clone()).json(request);
            let builder = match &self.request_modifier {
                Some(modifier) => modifier(builder),
                None => builder,
            };

            let server_delay = match builder.send().await {
                Ok(response) => {
                    let status_code = response.status();

                    #[cfg(feature = "tracing")]
                    tracing::Span::current().record("status_code", status_code.as_u16());

                    if status_code.is_success() {
                        let body = response.bytes().await?;
                        return Ok(serde_json::from_slice(&body)?);
                    }

                    let retryable = self
                        .retry
                        .as_ref()
                        .is_some_and(|policy| policy.is_retryable(status_code.as_u16()));
                    if !retryable || attempt >= self.max_retries() {
                        let message = response.text().await.unwrap_or_default();

                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            status = %status_code,
                            path = %path,
                            message = %message,
                            "GraphQL request failed"
                        );

                        return Err(Error::status(status_code, Method::POST, path, message));
                    }

                    // The server's Retry-After beats the computed delay.
                    retry_after(response.headers())
                }
                Err(e) => {
                    if self.retry.is_none() || attempt >= self.max_retries() {
                        return Err(e.into());
                    }
                    None
                }
            };

            let delay = server_delay
                .or_else(|| backoff.as_mut().and_then(Backoff::next_backoff))
                .unwrap_or_default();
            attempt += 1;

            #[cfg(feature = "tracing")]
            tracing::debug!(attempt, delay = ?delay, "retrying GraphQL request");

            tokio::time::sleep(delay).await;
        }
    }

    fn max_retries(&self) -> u32 {
        self.retry.as_ref().map_or(0, |policy| policy.max_retries)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint.as_str())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
