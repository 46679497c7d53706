//! In-memory method registry implementing [`Bridge`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::bridge::{Bridge, EventSchema, MethodHandler};
use crate::errors::RpcError;

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    schema: Option<Arc<dyn EventSchema>>,
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a method name, replacing any previous one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        tracing::trace!(method, "registering handler");
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Attach an event schema.
    pub fn set_event_schema(&mut self, schema: Arc<dyn EventSchema>) {
        self.schema = Some(schema);
    }

    /// List all registered method names (sorted).
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Bridge for MethodRegistry {
    fn methods(&self) -> Vec<(String, Arc<dyn MethodHandler>)> {
        let mut methods: Vec<_> = self
            .handlers
            .iter()
            .map(|(name, handler)| (name.clone(), Arc::clone(handler)))
            .collect();
        methods.sort_by(|a, b| a.0.cmp(&b.0));
        methods
    }

    fn dispatch(&self, method: &str) -> Result<Arc<dyn MethodHandler>, RpcError> {
        self.handlers
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound {
                method: method.to_owned(),
            })
    }

    fn event_schema(&self) -> Option<Arc<dyn EventSchema>> {
        self.schema.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{CallContext, MockEventSchema};
    use crate::types::Params;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct EchoHandler;

    #[async_trait]
    impl MethodHandler for EchoHandler {
        async fn handle(&self, params: Option<Params>, _ctx: &CallContext) -> Result<Value, RpcError> {
            Ok(params.map_or(Value::Null, Params::into_value))
        }
    }

    struct FailHandler;

    #[async_trait]
    impl MethodHandler for FailHandler {
        async fn handle(&self, _params: Option<Params>, _ctx: &CallContext) -> Result<Value, RpcError> {
            Err(RpcError::internal("boom"))
        }
    }

    #[tokio::test]
    async fn register_and_dispatch() {
        let mut reg = MethodRegistry::new();
        reg.register("echo", EchoHandler);

        let handler = reg.dispatch("echo").unwrap();
        let out = handler
            .handle(Some(Params::Positional(vec![json!("hello")])), &CallContext::detached())
            .await
            .unwrap();
        assert_eq!(out, json!(["hello"]));
    }

    #[tokio::test]
    async fn failing_handler_returns_error() {
        let mut reg = MethodRegistry::new();
        reg.register("fail", FailHandler);
        let err = reg
            .dispatch("fail")
            .unwrap()
            .handle(None, &CallContext::detached())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn unknown_method_not_found() {
        let reg = MethodRegistry::new();
        let err = reg.dispatch("nope").err();
        assert_matches!(err, Some(RpcError::MethodNotFound { method }) if method == "nope");
    }

    #[test]
    fn methods_are_sorted() {
        let mut reg = MethodRegistry::new();
        reg.register("zeta", EchoHandler);
        reg.register("alpha", EchoHandler);
        let names: Vec<_> = reg.methods().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(reg.method_names(), names);
        assert!(reg.has_method("alpha"));
        assert!(!reg.has_method("beta"));
    }

    #[test]
    fn event_schema_is_exposed() {
        let mut reg = MethodRegistry::new();
        assert!(reg.event_schema().is_none());
        reg.set_event_schema(Arc::new(MockEventSchema::new()));
        assert!(reg.event_schema().is_some());
    }
}
