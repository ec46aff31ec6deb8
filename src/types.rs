//! Wire types shared by the HTTP and websocket transports.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::GraphqlError;

/// The request payload both transports send: a GraphQL document plus its
/// variable bindings and optional operation name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(rename = "operationName", skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl GraphqlRequest {
    #[must_use]
    pub fn new(
        query: impl Into<String>,
        variables: Option<Map<String, Value>>,
        operation_name: Option<String>,
    ) -> Self {
        Self {
            query: query.into(),
            variables,
            operation_name,
        }
    }
}

/// The response envelope of a GraphQL execution result.
///
/// `data` and `extensions` stay unparsed so callers decide how to decode
/// them; `errors` is decoded eagerly because every surface of this crate
/// inspects it.
#[derive(Debug, Default, Deserialize)]
pub struct GraphqlResponse {
    pub data: Option<Box<RawValue>>,
    #[serde(default)]
    pub errors: Option<Vec<GraphqlError>>,
    pub extensions: Option<Box<RawValue>>,
}

impl GraphqlResponse {
    /// Whether the server reported any execution errors.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|errs| !errs.is_empty())
    }

    /// The raw bytes of `data`, if present.
    #[must_use]
    pub fn data_bytes(&self) -> Option<Vec<u8>> {
        self.data.as_ref().map(|raw| raw.get().as_bytes().to_vec())
    }
}
