//! Context types for dependency injection
//!
//! A [`Context`] is an immutable, type-keyed map. Each value is stored under its own
//! type, so a context can hold one `Db`, one `Session`, one `RequestInfo` and so on.
//! Middleware never mutates a context in place; it hands `next` a partial context
//! which is shallow-merged onto the running one, later keys winning.

use crate::{RpcError, RpcResult, http::HttpRequest};
use futures::future::BoxFuture;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

/// Per-request (HTTP) or per-connection (socket) data available to every
/// middleware and resolver.
///
/// Cloning is cheap: the map and every value sit behind an `Arc`.
///
/// # Example
/// ```rust,ignore
/// #[derive(Clone)]
/// struct Session { user_id: String }
///
/// let ctx = Context::new().with(Session { user_id: "u1".into() });
/// assert_eq!(ctx.get::<Session>().unwrap().user_id, "u1");
/// ```
#[derive(Clone, Default)]
pub struct Context {
    entries: Arc<HashMap<TypeId, Entry>>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new context with `value` added (replacing any value of the same type).
    #[must_use = "Context is immutable; this returns the extended copy"]
    pub fn with<T: Send + Sync + 'static>(mut self, value: T) -> Self {
        Arc::make_mut(&mut self.entries).insert(
            TypeId::of::<T>(),
            Entry {
                value: Arc::new(value),
                type_name: std::any::type_name::<T>(),
            },
        );
        self
    }

    /// Borrow the value of type `T`, if present.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.value.downcast_ref::<T>())
    }

    /// Borrow the value of type `T`, failing with `INTERNAL_SERVER_ERROR` when absent.
    pub fn require<T: Send + Sync + 'static>(&self) -> RpcResult<&T> {
        self.get::<T>().ok_or_else(|| {
            RpcError::internal(format!(
                "Context value `{}` is missing",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Whether a value of type `T` is present.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Shallow-merge `overrides` onto this context. Keys in `overrides` win.
    #[must_use = "Context is immutable; this returns the merged copy"]
    pub fn merge(&self, overrides: &Context) -> Context {
        if overrides.entries.is_empty() || Arc::ptr_eq(&self.entries, &overrides.entries) {
            return self.clone();
        }
        if self.entries.is_empty() {
            return overrides.clone();
        }
        let mut entries = (*self.entries).clone();
        entries.extend(
            overrides
                .entries
                .iter()
                .map(|(key, entry)| (*key, entry.clone())),
        );
        Context {
            entries: Arc::new(entries),
        }
    }

    /// Number of values held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the context holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.entries.values().map(|e| e.type_name).collect();
        names.sort_unstable();
        f.debug_struct("Context").field("values", &names).finish()
    }
}

/// Caller-supplied factory that builds the [`Context`] for a request or connection.
pub type ContextFactory =
    Arc<dyn Fn(&HttpRequest) -> BoxFuture<'static, RpcResult<Context>> + Send + Sync>;

/// Box an async closure as a [`ContextFactory`].
///
/// # Example
/// ```rust,ignore
/// let factory = create_context(|req: &HttpRequest| {
///     let token = req.header("authorization").map(str::to_owned);
///     async move { Ok(Context::new().with(Auth { token })) }
/// });
/// ```
pub fn create_context<F, Fut>(f: F) -> ContextFactory
where
    F: Fn(&HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Context>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// Factory that always yields an empty context.
pub fn empty_context() -> ContextFactory {
    create_context(|_| async { Ok(Context::new()) })
}
