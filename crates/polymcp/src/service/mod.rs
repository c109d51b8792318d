//! The protocol engine: JSON-RPC dispatch, lifecycle sequencing, middleware
//! wiring, and the per-invocation handler [`Context`].

mod context;
pub(crate) mod engine;

pub use context::Context;
