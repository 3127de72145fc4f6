use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Application-supplied implementation of a tool's effect.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<Value>;
}

pub type SharedToolHandler = Arc<dyn ToolHandler>;

pub struct FnToolHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> ToolHandler for FnToolHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(handler: F) -> SharedToolHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnToolHandler { handler })
}

/// Capability table keyed by tool name.
#[derive(Clone, Default)]
pub struct ToolSet {
    handlers: HashMap<String, SharedToolHandler>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an existing binding was replaced.
    pub fn register(&mut self, name: impl Into<String>, handler: SharedToolHandler) -> bool {
        self.handlers.insert(name.into(), handler).is_some()
    }

    pub fn get(&self, name: &str) -> Option<SharedToolHandler> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SharedToolHandler)> {
        self.handlers.iter()
    }
}
