use std::fmt;

use crate::config::{Config, ListenerConfig};
use crate::handler::Handler;

/// Activation state of a listener unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    /// Subscribed with the partition assignment kept, but not fetching
    Paused,
    Stopping,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Stopped => "Stopped",
            ListenerState::Starting => "Starting",
            ListenerState::Running => "Running",
            ListenerState::Paused => "Paused",
            ListenerState::Stopping => "Stopping",
        };
        f.write_str(name)
    }
}

/// One (topics, group, handler) binding with a control identity
#[derive(Clone)]
pub struct ListenerUnit {
    identity: String,
    topics: Vec<String>,
    group_id: String,
    handler: Handler,
    forward_to: Option<String>,
    auto_start: bool,
}

impl ListenerUnit {
    pub fn new(identity: &str, topics: Vec<String>, group_id: &str, handler: Handler) -> Self {
        Self {
            identity: identity.to_string(),
            topics,
            group_id: group_id.to_string(),
            handler,
            forward_to: None,
            auto_start: true,
        }
    }

    /// Build the unit declared by the `index`-th listener entry
    pub fn from_config(config: &Config, index: usize, listener: &ListenerConfig, handler: Handler) -> Self {
        Self {
            identity: config.identity_for(index, listener),
            topics: listener.topics.clone(),
            group_id: config.group_for(listener),
            handler,
            forward_to: listener.forward_to.clone(),
            auto_start: listener.auto_start,
        }
    }

    /// Topic that string replies of the handler are produced to
    pub fn with_forward_to(mut self, topic: &str) -> Self {
        self.forward_to = Some(topic.to_string());
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn forward_to(&self) -> Option<&str> {
        self.forward_to.as_deref()
    }

    pub fn auto_start(&self) -> bool {
        self.auto_start
    }
}

impl fmt::Debug for ListenerUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerUnit")
            .field("identity", &self.identity)
            .field("topics", &self.topics)
            .field("group_id", &self.group_id)
            .field("forward_to", &self.forward_to)
            .field("auto_start", &self.auto_start)
            .finish()
    }
}
