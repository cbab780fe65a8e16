// Public API
pub mod ack;
pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod handle;
pub mod handler;
pub mod http;
pub mod listener;
pub mod memory_broker;
pub mod producer;
pub mod record;
pub mod registry;
pub mod runner;
pub mod scheduler;
pub mod utils;

// Internal modules
mod container;

pub use ack::AcknowledgmentToken;
pub use config::Config;
pub use handle::ConnectorHandle;
pub use handler::{handler_fn, Handler, MessageHandlers};
pub use listener::{ListenerState, ListenerUnit};
pub use memory_broker::MemoryBroker;
pub use producer::ProducerFacade;
pub use record::{Record, SendResult};
pub use registry::ListenerRegistry;
pub use runner::{ConnectorRunner, JobContext, Runner};

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
