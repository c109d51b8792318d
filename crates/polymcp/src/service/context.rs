//! Per-invocation handler context.
//!
//! A [`Context`] is constructed by the engine for each handler call and
//! closed when the handler returns; helper calls on a closed context fail
//! deterministically. Helpers that talk back to the client (`sample`,
//! `elicit`, `list_roots`) are capability-gated and never emit wire traffic
//! when the client lacks the feature.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::ServerCore;
use crate::error::ErrorData;
use crate::model::{
    ClientCapabilities, CreateElicitationRequestParam, CreateElicitationResult,
    CreateMessageRequestParam, CreateMessageResult, JsonRpcMessage, ListRootsResult, LoggingLevel,
    LoggingMessageNotificationParam, ProgressNotificationParam, ProgressToken, RequestId, method,
};
use crate::session::{SessionHandle, SessionId, SessionRecord};

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    core: Option<Arc<ServerCore>>,
    session: Option<Arc<SessionHandle>>,
    request_id: Option<RequestId>,
    progress: Option<ProgressToken>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Context {
    pub(crate) fn for_request(
        core: Arc<ServerCore>,
        session: Arc<SessionHandle>,
        request_id: RequestId,
        progress: Option<ProgressToken>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                core: Some(core),
                session: Some(session),
                request_id: Some(request_id),
                progress,
                cancel,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A context wired to nothing; every helper fails. Unit-test fixture.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                core: None,
                session: None,
                request_id: None,
                progress: None,
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Invalidate the context; all clones expire together.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(&Arc<ServerCore>, &Arc<SessionHandle>), ErrorData> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ErrorData::context_closed());
        }
        match (&self.inner.core, &self.inner.session) {
            (Some(core), Some(session)) => Ok((core, session)),
            _ => Err(ErrorData::context_closed()),
        }
    }

    /// Id of the inbound request this context serves.
    pub fn request_id(&self) -> Option<&RequestId> {
        self.inner.request_id.as_ref()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session.as_ref().map(|s| s.id().clone())
    }

    /// Read-only snapshot of the owning session's attributes.
    pub async fn session(&self) -> Result<SessionRecord, ErrorData> {
        let (_, session) = self.ensure_open()?;
        Ok(session.record().await)
    }

    /// A value middleware attached to the session's user context.
    pub async fn user_context(&self, key: &str) -> Result<Option<Value>, ErrorData> {
        Ok(self.session().await?.user_context.get(key).cloned())
    }

    /// Observable cancellation signal for cooperative handlers.
    pub fn cancelled(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    async fn client_capabilities(&self) -> Result<ClientCapabilities, ErrorData> {
        Ok(self.session().await?.client_capabilities.unwrap_or_default())
    }

    /// Ask the client to run an LLM call on the server's behalf.
    pub async fn sample(
        &self,
        params: CreateMessageRequestParam,
    ) -> Result<CreateMessageResult, ErrorData> {
        if !self.client_capabilities().await?.supports_sampling() {
            return Err(ErrorData::capability_unavailable("sampling"));
        }
        let params = serde_json::to_value(params)
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        let result = self
            .round_trip(method::SAMPLING_CREATE_MESSAGE, params)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ErrorData::invalid_params(format!("invalid sampling result: {e}"), None))
    }

    /// Ask the client to collect user input.
    pub async fn elicit(
        &self,
        params: CreateElicitationRequestParam,
    ) -> Result<CreateElicitationResult, ErrorData> {
        if !self.client_capabilities().await?.supports_elicitation() {
            return Err(ErrorData::capability_unavailable("elicitation"));
        }
        let params = serde_json::to_value(params)
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        let result = self.round_trip(method::ELICITATION_CREATE, params).await?;
        serde_json::from_value(result).map_err(|e| {
            ErrorData::invalid_params(format!("invalid elicitation result: {e}"), None)
        })
    }

    pub async fn list_roots(&self) -> Result<ListRootsResult, ErrorData> {
        if !self.client_capabilities().await?.supports_roots() {
            return Err(ErrorData::capability_unavailable("roots"));
        }
        let result = self
            .round_trip(method::ROOTS_LIST, Value::Object(Default::default()))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ErrorData::invalid_params(format!("invalid roots result: {e}"), None))
    }

    /// Publish a progress notification keyed by the request's progress token.
    /// A request without a token makes this a no-op.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
    ) -> Result<(), ErrorData> {
        let (core, session) = self.ensure_open()?;
        let Some(token) = self.inner.progress.clone() else {
            return Ok(());
        };
        let params = ProgressNotificationParam {
            progress_token: token,
            progress,
            total,
            message: None,
        };
        let params = serde_json::to_value(params)
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        core.publish_to_session(
            session.id(),
            JsonRpcMessage::notification(method::NOTIFICATION_PROGRESS, Some(params)),
        )
        .await?;
        Ok(())
    }

    /// Publish a log notification, gated on the session's minimum level.
    pub async fn log(
        &self,
        level: LoggingLevel,
        data: Value,
        logger: Option<String>,
    ) -> Result<(), ErrorData> {
        let (core, session) = self.ensure_open()?;
        let minimum = session.record().await.log_level;
        if minimum.is_some_and(|minimum| level < minimum) {
            return Ok(());
        }
        let params = LoggingMessageNotificationParam {
            level,
            logger,
            data,
        };
        let params = serde_json::to_value(params)
            .map_err(|e| ErrorData::internal_error(e.to_string(), None))?;
        core.publish_to_session(
            session.id(),
            JsonRpcMessage::notification(method::NOTIFICATION_MESSAGE, Some(params)),
        )
        .await?;
        Ok(())
    }

    /// One server→client round-trip: allocate an outbound id, park a
    /// completion handle, publish the request on the session's stream and
    /// await the response, the per-call timeout, or cancellation. Exactly one
    /// of those removes the pending entry.
    async fn round_trip(&self, method: &str, params: Value) -> Result<Value, ErrorData> {
        let (core, session) = self.ensure_open()?;
        let id = session.next_outbound_id();
        let rx = session.register_pending(id.clone());
        let request = JsonRpcMessage::request(id.clone(), method, Some(params));
        if let Err(e) = core.publish_to_session(session.id(), request).await {
            session.remove_pending(&id);
            return Err(e);
        }
        debug!(session_id = %session.id(), %id, method, "awaiting client response");
        let timeout = core.config.outbound_request_timeout;
        tokio::select! {
            outcome = rx => match outcome {
                Ok(outcome) => outcome,
                Err(_) => Err(ErrorData::internal_error(
                    "pending request dropped before resolution",
                    None,
                )),
            },
            _ = tokio::time::sleep(timeout) => {
                session.remove_pending(&id);
                Err(ErrorData::request_timeout(format!(
                    "client did not answer {method} within {}s",
                    timeout.as_secs()
                )))
            }
            _ = self.inner.cancel.cancelled() => {
                session.remove_pending(&id);
                Err(ErrorData::request_cancelled(None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_context_fails_deterministically() {
        let context = Context::detached();
        let err = context.session().await.unwrap_err();
        assert_eq!(err.code, crate::error::codes::CONTEXT_CLOSED);
    }

    #[tokio::test]
    async fn closed_context_fails_deterministically() {
        let context = Context::detached();
        context.close();
        let err = context
            .log(LoggingLevel::Info, Value::Null, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::error::codes::CONTEXT_CLOSED);
    }
}
