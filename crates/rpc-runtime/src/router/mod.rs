//! Router registry
//!
//! A [`RouterBuilder`] collects procedures and nested sub-routers. [`RouterBuilder::build`]
//! walks the tree depth-first, joins keys with `.`, and produces an immutable
//! [`Router`] that maps every dotted path to exactly one [`Procedure`](crate::Procedure).
//!
//! ```rust,ignore
//! let router = Router::builder()
//!     .procedure("health", health)
//!     .router("users", Router::builder()
//!         .procedure("get", get_user)
//!         .procedure("create", create_user))
//!     .build()?;
//!
//! assert!(router.lookup("users.get").is_some());
//! ```
//!
//! Building fails if two leaves land on the same path or if a top-level key is a
//! reserved word. A built router is cheap to clone and safe to share between tasks.

mod builder;
mod core;

pub use builder::{RESERVED_KEYS, RouterBuildError, RouterBuilder, RouterNode};
pub use core::{Caller, Router};
