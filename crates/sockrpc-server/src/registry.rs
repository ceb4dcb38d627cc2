use futures_util::future::{BoxFuture, FutureExt};
use sockrpc_common::protocol::{RpcArgs, RpcValue};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Future returned by a registered handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<RpcValue>>;

/// A registered `(service, method)` implementation.
pub type Handler = Arc<dyn Fn(RpcArgs) -> HandlerFuture + Send + Sync>;

/// Table of callable handlers, keyed by service then method.
///
/// Cloning is cheap and every clone sees the same table, so a registry can be
/// handed to a server and still be extended afterwards. Lookups take a read
/// lock only for as long as it takes to clone the handler out.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    services: Arc<RwLock<HashMap<String, HashMap<String, Handler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` as `service.method`, replacing any previous
    /// registration under the same name.
    ///
    /// # Example
    ///
    /// ```
    /// use sockrpc_server::HandlerRegistry;
    /// use serde_json::json;
    ///
    /// let registry = HandlerRegistry::new();
    /// registry.register("math", "double", |args| async move {
    ///     let n = args.as_i64().ok_or_else(|| anyhow::anyhow!("expected an integer"))?;
    ///     Ok(json!(n * 2))
    /// });
    /// assert!(registry.lookup("math", "double").is_some());
    /// ```
    pub fn register<F, Fut>(&self, service: &str, method: &str, handler: F)
    where
        F: Fn(RpcArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<RpcValue>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |args| handler(args).boxed());
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = services
            .entry(service.to_string())
            .or_default()
            .insert(method.to_string(), handler)
            .is_some();

        tracing::debug!(service, method, replaced, "Registered handler");
    }

    /// Removes `service.method`, returning whether it was registered.
    pub fn unregister(&self, service: &str, method: &str) -> bool {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let Some(methods) = services.get_mut(service) else {
            return false;
        };
        let removed = methods.remove(method).is_some();
        if methods.is_empty() {
            services.remove(service);
        }
        removed
    }

    pub fn lookup(&self, service: &str, method: &str) -> Option<Handler> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        services.get(service)?.get(method).cloned()
    }

    /// All registered `(service, method)` pairs, sorted.
    pub fn methods(&self) -> Vec<(String, String)> {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        let mut methods: Vec<_> = services
            .iter()
            .flat_map(|(service, methods)| {
                methods
                    .keys()
                    .map(move |method| (service.clone(), method.clone()))
            })
            .collect();
        methods.sort();
        methods
    }

    pub fn len(&self) -> usize {
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        services.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}
