//! Per-session rate limiting.
//!
//! A token-bucket limiter keyed by session id; rejections short-circuit with
//! `RateLimited`, which the transport maps to HTTP 429.

use std::num::NonZeroU32;

use async_trait::async_trait;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};

use super::{ChainResult, Middleware, MiddlewareContext, Next};
use crate::error::{ErrorData, codes};
use crate::model::JsonRpcMessage;

pub struct RateLimit {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl RateLimit {
    pub fn per_second(rate: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::keyed(Quota::per_second(rate)),
        }
    }

    pub fn per_minute(rate: NonZeroU32) -> Self {
        Self {
            limiter: RateLimiter::keyed(Quota::per_minute(rate)),
        }
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn handle(
        &self,
        message: JsonRpcMessage,
        ctx: &mut MiddlewareContext,
        next: Next<'_>,
    ) -> ChainResult {
        let key = ctx.session_id().to_string();
        if self.limiter.check_key(&key).is_err() {
            return Err(ErrorData::new(
                codes::RATE_LIMITED,
                "rate limit exceeded",
                None,
            ));
        }
        next.run(message, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::Endpoint;
    use crate::session::{SessionHandle, session_id};

    fn passthrough() -> Endpoint<'static> {
        Box::new(|_message| Box::pin(async move { Ok(None) }))
    }

    #[tokio::test]
    async fn rejects_once_quota_spent() {
        let limit = RateLimit::per_minute(NonZeroU32::new(2).unwrap());
        let mut ctx =
            MiddlewareContext::new(SessionHandle::new(session_id()), http::HeaderMap::new());
        for _ in 0..2 {
            let message = JsonRpcMessage::notification("notifications/test", None);
            limit
                .handle(message, &mut ctx, Next::new(&[], passthrough()))
                .await
                .unwrap();
        }
        let message = JsonRpcMessage::notification("notifications/test", None);
        let err = limit
            .handle(message, &mut ctx, Next::new(&[], passthrough()))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::RATE_LIMITED);
    }

    #[tokio::test]
    async fn sessions_are_limited_independently() {
        let limit = RateLimit::per_minute(NonZeroU32::new(1).unwrap());
        let mut first =
            MiddlewareContext::new(SessionHandle::new(session_id()), http::HeaderMap::new());
        let mut second =
            MiddlewareContext::new(SessionHandle::new(session_id()), http::HeaderMap::new());
        let message = JsonRpcMessage::notification("notifications/test", None);
        limit
            .handle(message.clone(), &mut first, Next::new(&[], passthrough()))
            .await
            .unwrap();
        // The first session's quota is spent, the second's is untouched.
        limit
            .handle(message.clone(), &mut first, Next::new(&[], passthrough()))
            .await
            .unwrap_err();
        limit
            .handle(message, &mut second, Next::new(&[], passthrough()))
            .await
            .unwrap();
    }
}
