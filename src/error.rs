// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

use crate::{node::NodeOffset, records::ObjectKind, FdtError};

/// Errors produced while building a topology table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// An optional lookup failed
    #[error("node {node}: `{property}` not found")]
    NotFound { node: NodeOffset, property: &'static str },
    /// A property exists but fails a size or type check
    #[error("node {node}: `{property}` is malformed")]
    Malformed { node: NodeOffset, property: &'static str },
    /// The property that makes a node what it is could not be read
    #[error("node {node}: mandatory `{property}` is missing or malformed")]
    MissingIdentity { node: NodeOffset, property: &'static str },
    /// An output array or generator ran out of room
    #[error("out of resources while allocating {what}")]
    ResourceExhausted { what: &'static str },
    /// A recognized hardware configuration that cannot be expressed
    #[error("unsupported configuration: {0}")]
    Unsupported(&'static str),
    /// A kind is declared ahead of a kind it depends on
    #[error("{kind:?} is declared before its dependency {dependency:?}")]
    DeclarationOrder { kind: ObjectKind, dependency: ObjectKind },
    /// A handler broke a rule of the pipeline
    #[error("internal error: {0}")]
    Internal(&'static str),
    /// The object repository refused a batch of records
    #[error("repository rejected {kind:?} records: {reason}")]
    Repository { kind: ObjectKind, reason: &'static str },
    #[error(transparent)]
    Fdt(#[from] FdtError),
}

impl Error {
    /// Errors that only disqualify the node being ingested
    pub fn is_node_local(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::Malformed { .. })
    }

    /// Promotes a node-local error on an identity property to a fatal one
    pub fn into_identity(self) -> Self {
        match self {
            Error::NotFound { node, property } | Error::Malformed { node, property } => {
                Error::MissingIdentity { node, property }
            }
            other => other,
        }
    }
}
