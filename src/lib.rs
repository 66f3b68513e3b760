//! Lead Agent: an asynchronous sales-conversation pipeline.

pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod logging;
pub mod notify;
pub mod pipeline;
pub mod safety;
pub mod store;
pub mod worker;
