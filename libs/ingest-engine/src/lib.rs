pub mod bootstrap;
pub mod compactor;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod ingress;
pub mod loader;
pub mod metrics;
pub mod objects;
pub mod queue;
pub mod retention;
pub mod router;
pub mod store;
pub mod stream;
pub mod task;
pub mod validate;
