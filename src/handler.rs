use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::ack::AcknowledgmentToken;
use crate::record::Record;

/// Type alias for listener handler functions.
///
/// A handler receives the record and its acknowledgment token. `Ok(Some(value))`
/// asks the dispatcher to forward `value` to the unit's forward topic.
pub type Handler =
    Arc<dyn Fn(Record, AcknowledgmentToken) -> BoxFuture<'static, Result<Option<String>>> + Send + Sync>;

/// Handler return values the dispatcher understands
pub trait IntoReply {
    fn into_reply(self) -> Option<String>;
}

impl IntoReply for () {
    fn into_reply(self) -> Option<String> {
        None
    }
}

impl IntoReply for String {
    fn into_reply(self) -> Option<String> {
        Some(self)
    }
}

impl IntoReply for Option<String> {
    fn into_reply(self) -> Option<String> {
        self
    }
}

/// Wrap an async function into a [`Handler`]
pub fn handler_fn<F, Fut, R>(f: F) -> Handler
where
    F: Fn(Record, AcknowledgmentToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: IntoReply,
{
    Arc::new(move |record, token| {
        let fut = f(record, token);
        async move { fut.await.map(IntoReply::into_reply) }.boxed()
    })
}

/// Named handlers that listener configuration entries refer to
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: HashMap<String, Handler>,
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn insert(&mut self, name: &str, handler: Handler) {
        debug!("📥 Registering handler '{}'", name);
        self.handlers.insert(name.to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Handler> {
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

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Stock handlers covering the common listener shapes
pub struct MessageHandlers;

impl MessageHandlers {
    /// Log the record and commit it
    pub fn acknowledging(label: &str) -> Handler {
        let label = label.to_string();
        handler_fn(move |record: Record, token: AcknowledgmentToken| {
            let label = label.clone();
            async move {
                let start_time = Instant::now();
                info!("📨 [{}] {}", label, record);
                token.commit()?;
                debug!(
                    "✅ [{}] Record committed in {}ms",
                    label,
                    start_time.elapsed().as_millis()
                );
                anyhow::Ok(())
            }
        })
    }

    /// Log the record without committing it
    pub fn logging_only(label: &str) -> Handler {
        let label = label.to_string();
        handler_fn(move |record: Record, _token: AcknowledgmentToken| {
            let label = label.clone();
            async move {
                info!("📨 [{}] {}", label, record);
                Ok(())
            }
        })
    }

    /// Commit the record and reply with `prefix` followed by its value
    pub fn replying(label: &str, prefix: &str) -> Handler {
        let label = label.to_string();
        let prefix = prefix.to_string();
        handler_fn(move |record: Record, token: AcknowledgmentToken| {
            let label = label.clone();
            let prefix = prefix.clone();
            async move {
                info!("📨 [{}] {}", label, record);
                token.commit()?;
                anyhow::Ok(format!("{}{}", prefix, record.value()))
            }
        })
    }
}
