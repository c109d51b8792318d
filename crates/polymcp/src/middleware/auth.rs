//! Bearer-token authentication middleware.
//!
//! Extracts `Authorization: Bearer <token>`, verifies it through a pluggable
//! validator, and injects the authenticated principal into the session's
//! user context under `"principal"`. Failures short-circuit with
//! `AuthRejected`, which the transport maps to HTTP 401.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{ChainResult, Middleware, MiddlewareContext, Next};
use crate::error::{ErrorData, codes};
use crate::model::JsonRpcMessage;

/// Verifies a bearer token and returns the principal to attach, or a
/// human-readable rejection reason.
pub type TokenValidator = Arc<dyn Fn(&str) -> Result<Value, String> + Send + Sync>;

pub struct BearerAuth {
    validator: TokenValidator,
}

impl BearerAuth {
    pub fn new<F>(validator: F) -> Self
    where
        F: Fn(&str) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            validator: Arc::new(validator),
        }
    }

    /// Accept exactly one static token; the principal is the given name.
    /// Useful for tests and single-tenant deployments.
    pub fn static_token(token: impl Into<String>, principal: impl Into<String>) -> Self {
        let token = token.into();
        let principal = Value::String(principal.into());
        Self::new(move |candidate| {
            if candidate == token {
                Ok(principal.clone())
            } else {
                Err("invalid token".to_string())
            }
        })
    }

    fn rejected(reason: impl Into<String>) -> ErrorData {
        ErrorData::new(codes::AUTH_REJECTED, reason.into(), None)
    }
}

#[async_trait]
impl Middleware for BearerAuth {
    async fn handle(
        &self,
        message: JsonRpcMessage,
        ctx: &mut MiddlewareContext,
        next: Next<'_>,
    ) -> ChainResult {
        let token = ctx
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| Self::rejected("missing bearer token"))?;
        let principal = (self.validator)(token).map_err(Self::rejected)?;
        debug!(session_id = %ctx.session_id(), "authenticated");
        ctx.insert_user_context("principal", principal).await;
        next.run(message, ctx).await
    }
}
