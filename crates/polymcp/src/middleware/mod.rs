//! Pre-dispatch interceptors.
//!
//! Middleware runs in registration order on the way in and unwinds in reverse
//! on the way out: a middleware that wraps `next.run(..)` observes the
//! outbound response. A middleware may short-circuit with an [`ErrorData`]
//! (the transport maps auth and rate-limit codes to HTTP 401/429) or attach
//! data to the session's user context for handlers to read.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::ErrorData;
use crate::model::JsonRpcMessage;
use crate::session::{SessionHandle, SessionId};

pub mod auth;
pub mod rate_limit;

pub use auth::BearerAuth;
pub use rate_limit::RateLimit;

/// Mutable per-message context handed through the chain.
pub struct MiddlewareContext {
    session: Arc<SessionHandle>,
    headers: http::HeaderMap,
}

impl MiddlewareContext {
    pub(crate) fn new(session: Arc<SessionHandle>, headers: http::HeaderMap) -> Self {
        Self { session, headers }
    }

    pub fn session(&self) -> &Arc<SessionHandle> {
        &self.session
    }

    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    /// Transport-level headers of the HTTP request carrying this message.
    pub fn headers(&self) -> &http::HeaderMap {
        &self.headers
    }

    /// Attach a value to the session's user context; handlers read it via
    /// their context.
    pub async fn insert_user_context(&self, key: impl Into<String>, value: Value) {
        self.session
            .update_record(|record| {
                record.user_context.insert(key.into(), value);
            })
            .await;
    }

    pub async fn user_context(&self, key: &str) -> Option<Value> {
        self.session
            .record()
            .await
            .user_context
            .get(key)
            .cloned()
    }
}

/// The dispatch outcome flowing back through the chain: a response frame for
/// requests, nothing for notifications and client responses.
pub type ChainResult = Result<Option<JsonRpcMessage>, ErrorData>;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(
        &self,
        message: JsonRpcMessage,
        ctx: &mut MiddlewareContext,
        next: Next<'_>,
    ) -> ChainResult;
}

pub(crate) type Endpoint<'a> =
    Box<dyn FnOnce(JsonRpcMessage) -> BoxFuture<'static, ChainResult> + Send + 'a>;

/// The remainder of the chain, ending at the protocol engine's dispatch.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: Endpoint<'a>,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], endpoint: Endpoint<'a>) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(mut self, message: JsonRpcMessage, ctx: &mut MiddlewareContext) -> ChainResult {
        if let Some((head, rest)) = self.chain.split_first() {
            self.chain = rest;
            head.handle(message, ctx, self).await
        } else {
            (self.endpoint)(message).await
        }
    }
}
