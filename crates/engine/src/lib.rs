//! Engine layer - event ingress, event sources, and the engine facade.

#![warn(missing_docs)]

pub mod config;
pub mod ingress;
pub mod source;
pub mod engine;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, EngineConfig, IngressConfig};
pub use ingress::{
    CompletionTicket, DeadLetter, DeadLetterQueue, DeadLetterSink, EventIngress, IngressError,
    LogDeadLetter, TicketOutcome,
};
pub use source::{ChannelEventSource, EventSource};
pub use engine::{PhaseEngine, PhaseEngineBuilder};
