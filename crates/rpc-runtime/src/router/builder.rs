//! Router tree builder

use super::core::Router;
use crate::{ErrorConfig, Procedure, logging::log_router_built};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use thiserror::Error;
use tracing::trace;

/// Keys that may not appear at the top level of a router.
///
/// `then` would make a router look like a future to clients that check for it.
pub const RESERVED_KEYS: &[&str] = &["then"];

/// Why a router tree could not be flattened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterBuildError {
    /// A top-level key is reserved
    #[error("Reserved word used in router key: `{key}`")]
    ReservedName {
        /// The offending key
        key: String,
    },
    /// Two leaves resolve to the same dotted path
    #[error("Duplicate key: `{path}`")]
    DuplicatePath {
        /// The colliding path
        path: String,
    },
    /// A key is empty or contains a batch separator
    #[error("Invalid router key `{key}` under `{parent}`: {reason}")]
    InvalidKey {
        /// The offending key
        key: String,
        /// Dotted path of the enclosing router (empty at the top level)
        parent: String,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// A node of the router tree: a leaf procedure or a nested router.
#[derive(Clone, Debug)]
pub enum RouterNode {
    /// A callable leaf
    Procedure(Procedure),
    /// A named collection of further nodes
    Router(RouterBuilder),
}

impl From<Procedure> for RouterNode {
    fn from(procedure: Procedure) -> Self {
        Self::Procedure(procedure)
    }
}

impl From<RouterBuilder> for RouterNode {
    fn from(router: RouterBuilder) -> Self {
        Self::Router(router)
    }
}

/// Builder for a [`Router`].
///
/// Entries keep their insertion order, so when two entries collide the error
/// names the path of the second one.
#[derive(Clone, Debug, Default)]
pub struct RouterBuilder {
    entries: Vec<(String, RouterNode)>,
    error_config: Option<ErrorConfig>,
}

impl RouterBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a procedure under `key`.
    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn procedure(mut self, key: impl Into<String>, procedure: Procedure) -> Self {
        self.entries
            .push((key.into(), RouterNode::Procedure(procedure)));
        self
    }

    /// Nest `router` under `key`; its paths become `key.<path>`.
    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn router(mut self, key: impl Into<String>, router: RouterBuilder) -> Self {
        self.entries.push((key.into(), RouterNode::Router(router)));
        self
    }

    /// Register any node under `key`.
    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn node(mut self, key: impl Into<String>, node: impl Into<RouterNode>) -> Self {
        self.entries.push((key.into(), node.into()));
        self
    }

    /// Flatten `other` into this level, as if its entries had been added here.
    ///
    /// Collisions between the two are reported by [`build`](Self::build).
    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn merge(mut self, other: RouterBuilder) -> Self {
        self.entries.extend(other.entries);
        if self.error_config.is_none() {
            self.error_config = other.error_config;
        }
        self
    }

    /// Error shaping used by every transport serving this router.
    #[must_use = "This method returns a new RouterBuilder and does not modify self"]
    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = Some(config);
        self
    }

    /// Number of direct entries at this level.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was registered at this level.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten the tree into an immutable [`Router`].
    pub fn build(self) -> Result<Router, RouterBuildError> {
        let mut procedures = HashMap::new();
        flatten(self.entries, "", &mut procedures)?;
        log_router_built(procedures.len());
        Ok(Router::from_parts(
            procedures,
            self.error_config.unwrap_or_default(),
        ))
    }
}

fn flatten(
    entries: Vec<(String, RouterNode)>,
    prefix: &str,
    procedures: &mut HashMap<String, Procedure>,
) -> Result<(), RouterBuildError> {
    for (key, node) in entries {
        check_key(&key, prefix)?;
        let path = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match node {
            RouterNode::Procedure(procedure) => match procedures.entry(path) {
                Entry::Occupied(occupied) => {
                    return Err(RouterBuildError::DuplicatePath {
                        path: occupied.key().clone(),
                    });
                }
                Entry::Vacant(vacant) => {
                    trace!(path = %vacant.key(), kind = %procedure.kind(), "Registered procedure");
                    vacant.insert(procedure);
                }
            },
            RouterNode::Router(sub) => flatten(sub.entries, &path, procedures)?,
        }
    }
    Ok(())
}

fn check_key(key: &str, parent: &str) -> Result<(), RouterBuildError> {
    let invalid = |reason| RouterBuildError::InvalidKey {
        key: key.to_string(),
        parent: parent.to_string(),
        reason,
    };
    if parent.is_empty() && RESERVED_KEYS.contains(&key) {
        return Err(RouterBuildError::ReservedName {
            key: key.to_string(),
        });
    }
    if key.is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.contains(',') {
        return Err(invalid("`,` separates batched paths"));
    }
    Ok(())
}
