//! Construction of GraphQL documents from shape descriptors.
//!
//! The transports only consume the resulting strings; anything able to
//! produce a document works in their place. [`OperationShape`] is the
//! built-in descriptor: a selection set plus the variable definitions the
//! operation declares.

use std::fmt;

use bon::Builder;
use serde_json::{Map, Value};

use crate::Result;
use crate::error::Error;

/// The three GraphQL operation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Query,
    Mutation,
    Subscription,
}

impl OperationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

/// Describes the result shape of an operation: the selection set and the
/// variables it declares.
///
/// # Example
///
/// ```
/// use graphql_client_sdk::ops::OperationShape;
///
/// let shape = OperationShape::builder()
///     .selection("messageAdded(roomId: $roomId) { id text }")
///     .variables(vec![("roomId".to_owned(), "ID!".to_owned())])
///     .build();
/// ```
#[derive(Builder, Debug, Clone)]
pub struct OperationShape {
    /// The selection set, without the surrounding operation braces.
    #[builder(into)]
    pub selection: String,
    /// Variable definitions as `(name, GraphQL type)` pairs, e.g.
    /// `("roomId", "ID!")`.
    #[builder(default)]
    pub variables: Vec<(String, String)>,
}

/// A named option applied to an operation, as a tagged variant with a type
/// discriminator ([`kind`](Self::kind)) and a stringification of the
/// document fragment it contributes.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOption {
    /// Names the operation in the document and the request payload.
    OperationName(String),
    /// A directive rendered after the operation header, e.g. `@live`.
    OperationDirective(String),
}

impl OperationOption {
    /// The discriminator of this option type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OperationName(_) => "operation_name",
            Self::OperationDirective(_) => "operation_directive",
        }
    }
}

impl fmt::Display for OperationOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperationName(name) => f.write_str(name),
            Self::OperationDirective(directive) => f.write_str(directive),
        }
    }
}

/// Produce a subscription document and its operation name from a shape.
pub fn construct_subscription(
    shape: &OperationShape,
    variables: Option<&Map<String, Value>>,
    options: &[OperationOption],
) -> Result<(String, Option<String>)> {
    construct_operation(OperationType::Subscription, shape, variables, options)
}

/// Produce a query document and its operation name from a shape.
pub fn construct_query(
    shape: &OperationShape,
    variables: Option<&Map<String, Value>>,
    options: &[OperationOption],
) -> Result<(String, Option<String>)> {
    construct_operation(OperationType::Query, shape, variables, options)
}

/// Produce a mutation document and its operation name from a shape.
pub fn construct_mutation(
    shape: &OperationShape,
    variables: Option<&Map<String, Value>>,
    options: &[OperationOption],
) -> Result<(String, Option<String>)> {
    construct_operation(OperationType::Mutation, shape, variables, options)
}

fn construct_operation(
    operation_type: OperationType,
    shape: &OperationShape,
    variables: Option<&Map<String, Value>>,
    options: &[OperationOption],
) -> Result<(String, Option<String>)> {
    let selection = shape.selection.trim();
    if selection.is_empty() {
        return Err(Error::validation("operation selection must not be empty"));
    }

    // Every supplied variable binding needs a declaration in the shape,
    // otherwise the server rejects the document.
    if let Some(values) = variables {
        for name in values.keys() {
            if !shape.variables.iter().any(|(declared, _)| declared == name) {
                return Err(Error::validation(format!(
                    "variable {name} is bound but not declared by the operation shape"
                )));
            }
        }
    }

    let mut operation_name = None;
    let mut directives = String::new();
    for option in options {
        match option {
            OperationOption::OperationName(name) => operation_name = Some(name.clone()),
            OperationOption::OperationDirective(directive) => {
                directives.push(' ');
                directives.push_str(directive);
            }
        }
    }

    let mut document = String::from(operation_type.as_str());
    if let Some(name) = &operation_name {
        document.push(' ');
        document.push_str(name);
    }
    if !shape.variables.is_empty() {
        let declarations: Vec<String> = shape
            .variables
            .iter()
            .map(|(name, gql_type)| format!("${name}: {gql_type}"))
            .collect();
        document.push_str(&format!("({})", declarations.join(", ")));
    }
    document.push_str(&directives);
    document.push_str(&format!(" {{ {selection} }}"));

    Ok((document, operation_name))
}
