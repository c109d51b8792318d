#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
pub mod middleware;
/// Wire-level data types of the protocol.
pub mod model;
pub mod registry;
pub mod server;
pub mod service;
pub mod session;
pub mod stream;
pub mod transport;

pub use config::ServerConfig;
pub use error::{ErrorCode, ErrorData};
pub use registry::{Registry, RegistryBuilder};
pub use server::{McpServer, McpServerBuilder, RunningServer};
pub use service::Context;
pub use session::{SessionId, SessionState};

// re-export
pub use serde;
pub use serde_json;
