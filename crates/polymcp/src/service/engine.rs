//! Central dispatcher for inbound messages.
//!
//! For each message: resolve the session (done by the transport), run the
//! middleware chain, then dispatch on method. Requests produce exactly one
//! response or error frame; notifications are fire-and-forget; client
//! responses and errors resolve the session's pending-outbound arena.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Context;
use crate::config::ServerConfig;
use crate::error::{ErrorData, codes};
use crate::middleware::{ChainResult, Endpoint, Middleware, MiddlewareContext, Next};
use crate::model::{
    CallToolRequestParam, CancelledNotificationParam, GetPromptRequestParam, InitializeRequestParam,
    InitializeResult, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, ReadResourceRequestParam,
    SetLevelRequestParam, method, progress_token,
};
use crate::registry::Registry;
use crate::session::{
    SessionBroker, SessionHandle, SessionId, SessionState, SessionStore,
};
use crate::stream::StreamManager;

pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) registry: ArcSwap<Registry>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) broker: Arc<SessionBroker>,
    pub(crate) streams: Arc<dyn StreamManager>,
    pub(crate) ct: CancellationToken,
}

/// Outcome of handling an `initialize` POST without a session header.
pub(crate) enum InitializeOutcome {
    /// The handshake succeeded; the transport attaches the session header.
    Started {
        session_id: SessionId,
        response: JsonRpcMessage,
    },
    /// The handshake failed; the session was torn down and no header is set.
    Failed { response: JsonRpcMessage },
}

impl ServerCore {
    /// Assemble the core and start the idle eviction sweep. Must be called
    /// within a tokio runtime.
    pub(crate) fn new(
        config: ServerConfig,
        registry: Registry,
        middleware: Vec<Arc<dyn Middleware>>,
        store: Arc<dyn SessionStore>,
        streams: Arc<dyn StreamManager>,
    ) -> Arc<Self> {
        let broker = Arc::new(SessionBroker::new(
            store,
            streams.clone(),
            config.idle_timeout,
        ));
        let ct = CancellationToken::new();
        broker
            .clone()
            .spawn_evictor(config.eviction_interval, ct.child_token());
        Arc::new(Self {
            config,
            registry: ArcSwap::from_pointee(registry),
            middleware,
            broker,
            streams,
            ct,
        })
    }

    /// Stop background work (eviction sweep, serving loops).
    pub(crate) fn shutdown(&self) {
        self.ct.cancel();
    }

    /// Run one inbound message through the middleware chain and dispatch.
    pub(crate) async fn handle_message(
        self: Arc<Self>,
        session: Arc<SessionHandle>,
        message: JsonRpcMessage,
        headers: http::HeaderMap,
    ) -> ChainResult {
        session.touch();
        let mut ctx = MiddlewareContext::new(session.clone(), headers);
        let core = self.clone();
        let endpoint: Endpoint =
            Box::new(move |message| Box::pin(async move { core.dispatch(session, message).await }));
        Next::new(&self.middleware, endpoint)
            .run(message, &mut ctx)
            .await
    }

    /// Create a session and run the `initialize` handshake through it.
    pub(crate) async fn initialize_session(
        self: Arc<Self>,
        message: JsonRpcMessage,
        headers: http::HeaderMap,
    ) -> Result<InitializeOutcome, ErrorData> {
        let session = self.broker.create_session().await?;
        let session_id = session.id().clone();
        match self.clone().handle_message(session, message, headers).await {
            Ok(Some(response)) => {
                if matches!(response, JsonRpcMessage::Error(_)) {
                    self.broker
                        .terminate(
                            &session_id,
                            ErrorData::invalid_request("initialize failed", None),
                        )
                        .await;
                    Ok(InitializeOutcome::Failed { response })
                } else {
                    Ok(InitializeOutcome::Started {
                        session_id,
                        response,
                    })
                }
            }
            Ok(None) => {
                self.broker
                    .terminate(
                        &session_id,
                        ErrorData::internal_error("initialize produced no response", None),
                    )
                    .await;
                Err(ErrorData::internal_error(
                    "initialize produced no response",
                    None,
                ))
            }
            Err(e) => {
                self.broker.terminate(&session_id, e.clone()).await;
                Err(e)
            }
        }
    }

    async fn dispatch(self: Arc<Self>, session: Arc<SessionHandle>, message: JsonRpcMessage) -> ChainResult {
        match message {
            JsonRpcMessage::Request(request) => {
                let id = request.id.clone();
                let request_method = request.method.clone();
                let frame = match self.clone().run_request(&session, request).await {
                    Ok(result) => JsonRpcMessage::response(id, result),
                    Err(e) => {
                        debug!(method = %request_method, code = e.code.0, "request failed");
                        JsonRpcMessage::error(id, e)
                    }
                };
                Ok(Some(frame))
            }
            JsonRpcMessage::Notification(notification) => {
                self.run_notification(&session, notification).await;
                Ok(None)
            }
            JsonRpcMessage::Response(response) => {
                let _intake = session.dispatch_lock.lock().await;
                if !session.resolve_pending(&response.id, Ok(response.result)) {
                    debug!(id = %response.id, "response without pending request");
                }
                Ok(None)
            }
            JsonRpcMessage::Error(frame) => {
                let _intake = session.dispatch_lock.lock().await;
                if !session.resolve_pending(&frame.id, Err(frame.error)) {
                    debug!(id = %frame.id, "error without pending request");
                }
                Ok(None)
            }
        }
    }

    /// Dispatch one request. Intake is serialized per session; handler
    /// execution happens after the intake lock is released so a handler
    /// suspended on a server→client round-trip does not block the client's
    /// answer.
    async fn run_request(
        self: Arc<Self>,
        session: &Arc<SessionHandle>,
        request: JsonRpcRequest,
    ) -> Result<Value, ErrorData> {
        let intake = session.dispatch_lock.lock().await;
        let state = session.state().await;
        match (state, request.method.as_str()) {
            (SessionState::Terminated, _) => {
                Err(ErrorData::invalid_request("session terminated", None))
            }
            (SessionState::Uninitialized, method::INITIALIZE) => {
                self.run_initialize(session, &request).await
            }
            (SessionState::Uninitialized, _) => Err(ErrorData::server_not_initialized()),
            (_, method::PING) => Ok(json!({})),
            (SessionState::Initializing, _) => Err(ErrorData::server_not_initialized()),
            (SessionState::Ready, method::INITIALIZE) => Err(ErrorData::invalid_request(
                "session already initialized",
                None,
            )),
            (SessionState::Ready, method::SHUTDOWN) => {
                self.broker
                    .terminate(
                        session.id(),
                        ErrorData::new(codes::REQUEST_CANCELLED, "session shut down", None),
                    )
                    .await;
                Ok(json!({}))
            }
            (SessionState::Ready, method::LOGGING_SET_LEVEL) => {
                let params: SetLevelRequestParam = parse_params(request.params.as_ref())?;
                session
                    .update_record(|record| record.log_level = Some(params.level))
                    .await;
                if let Err(e) = self.broker.persist(session).await {
                    warn!(session_id = %session.id(), error = %e, "failed to persist log level");
                }
                Ok(json!({}))
            }
            (SessionState::Ready, method::TOOLS_LIST) => {
                to_result(self.registry.load().list_tools())
            }
            (SessionState::Ready, method::RESOURCES_LIST) => {
                to_result(self.registry.load().list_resources())
            }
            (SessionState::Ready, method::PROMPTS_LIST) => {
                to_result(self.registry.load().list_prompts())
            }
            (SessionState::Ready, method::TOOLS_CALL) => {
                let params: CallToolRequestParam = parse_params(request.params.as_ref())?;
                let token = progress_token(request.params.as_ref());
                let cancel = session.register_inflight(request.id.clone());
                let context = Context::for_request(
                    self.clone(),
                    session.clone(),
                    request.id.clone(),
                    token,
                    cancel.clone(),
                );
                let registry = self.registry.load_full();
                drop(intake);
                let outcome = AssertUnwindSafe(registry.call_tool(
                    &params.name,
                    params.arguments,
                    context.clone(),
                ))
                .catch_unwind()
                .await;
                context.close();
                session.finish_inflight(&request.id);
                self.handler_outcome(outcome, &cancel, method::TOOLS_CALL)
            }
            (SessionState::Ready, method::RESOURCES_READ) => {
                let params: ReadResourceRequestParam = parse_params(request.params.as_ref())?;
                let cancel = session.register_inflight(request.id.clone());
                let context = Context::for_request(
                    self.clone(),
                    session.clone(),
                    request.id.clone(),
                    None,
                    cancel.clone(),
                );
                let registry = self.registry.load_full();
                drop(intake);
                let outcome =
                    AssertUnwindSafe(registry.read_resource(&params.uri, context.clone()))
                        .catch_unwind()
                        .await;
                context.close();
                session.finish_inflight(&request.id);
                self.handler_outcome(outcome, &cancel, method::RESOURCES_READ)
            }
            (SessionState::Ready, method::PROMPTS_GET) => {
                let params: GetPromptRequestParam = parse_params(request.params.as_ref())?;
                let cancel = session.register_inflight(request.id.clone());
                let context = Context::for_request(
                    self.clone(),
                    session.clone(),
                    request.id.clone(),
                    None,
                    cancel.clone(),
                );
                let registry = self.registry.load_full();
                drop(intake);
                let outcome = AssertUnwindSafe(registry.get_prompt(
                    &params.name,
                    params.arguments,
                    context.clone(),
                ))
                .catch_unwind()
                .await;
                context.close();
                session.finish_inflight(&request.id);
                self.handler_outcome(outcome, &cancel, method::PROMPTS_GET)
            }
            (SessionState::Ready, other) => Err(ErrorData::method_not_found(other)),
        }
    }

    async fn run_initialize(
        &self,
        session: &Arc<SessionHandle>,
        request: &JsonRpcRequest,
    ) -> Result<Value, ErrorData> {
        let params: InitializeRequestParam = parse_params(request.params.as_ref())?;
        let Some(version) = self.config.negotiate_version(&params.protocol_version) else {
            return Err(ErrorData::invalid_params(
                format!(
                    "unsupported protocol version: {}",
                    params.protocol_version
                ),
                Some(json!({ "supported": self.config.protocol_versions })),
            ));
        };
        let version = version.to_string();
        let capabilities = self.registry.load().server_capabilities();
        session
            .update_record(|record| {
                record.state = SessionState::Initializing;
                record.protocol_version = Some(version.clone());
                record.client_info = Some(params.client_info.clone());
                record.client_capabilities = Some(params.capabilities.clone());
                record.server_capabilities = Some(capabilities.clone());
            })
            .await;
        self.broker.persist(session).await?;
        info!(
            session_id = %session.id(),
            client = %params.client_info.name,
            protocol_version = %version,
            "session initializing"
        );
        to_result(InitializeResult {
            protocol_version: version,
            capabilities,
            server_info: self.config.server_info.clone(),
            instructions: self.config.instructions.clone(),
        })
    }

    async fn run_notification(
        &self,
        session: &Arc<SessionHandle>,
        notification: JsonRpcNotification,
    ) {
        let _intake = session.dispatch_lock.lock().await;
        match notification.method.as_str() {
            // Both spellings are accepted; the bare name predates the
            // notifications/ namespace.
            method::INITIALIZED | "initialized" => {
                if session.state().await == SessionState::Initializing {
                    session
                        .update_record(|record| record.state = SessionState::Ready)
                        .await;
                    if let Err(e) = self.broker.persist(session).await {
                        warn!(session_id = %session.id(), error = %e, "failed to persist ready state");
                    }
                    info!(session_id = %session.id(), "session ready");
                } else {
                    debug!(session_id = %session.id(), "unexpected initialized notification");
                }
            }
            method::NOTIFICATION_CANCELLED => {
                match parse_params::<CancelledNotificationParam>(notification.params.as_ref()) {
                    Ok(params) => {
                        if session.cancel_inflight(&params.request_id) {
                            debug!(session_id = %session.id(), id = %params.request_id, "cancellation raised");
                        } else {
                            debug!(session_id = %session.id(), id = %params.request_id, "cancellation for unknown request");
                        }
                    }
                    Err(e) => debug!(error = %e, "malformed cancellation notification"),
                }
            }
            other => {
                debug!(method = other, "ignoring notification");
            }
        }
    }

    fn handler_outcome<R: Serialize>(
        &self,
        outcome: Result<Result<R, ErrorData>, Box<dyn std::any::Any + Send>>,
        cancel: &CancellationToken,
        request_method: &str,
    ) -> Result<Value, ErrorData> {
        if cancel.is_cancelled() {
            return Err(ErrorData::request_cancelled(None));
        }
        match outcome {
            Ok(Ok(result)) => to_result(result),
            Ok(Err(e)) => Err(e),
            Err(_panic) => {
                let correlation_id = uuid::Uuid::new_v4().to_string();
                error!(%correlation_id, method = request_method, "handler panicked");
                Err(ErrorData::internal_error(
                    "internal server error",
                    Some(json!({ "correlationId": correlation_id })),
                ))
            }
        }
    }

    /// Publish on a session's outbound stream, enforcing the overflow
    /// policy: when the buffer dropped an unseen entry, emit a
    /// `streamOverflow` error and terminate the session.
    pub(crate) async fn publish_to_session(
        &self,
        session_id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<u64, ErrorData> {
        let receipt = self
            .streams
            .publish(session_id, message)
            .await
            .map_err(|e| ErrorData::internal_error(format!("stream publish failed: {e}"), None))?;
        if receipt.overflowed {
            warn!(session_id = %session_id, "stream overflow, terminating session");
            let overflow = JsonRpcMessage::notification(
                method::NOTIFICATION_MESSAGE,
                Some(json!({
                    "level": "error",
                    "data": {
                        "error": "streamOverflow",
                        "message": "outbound stream buffer overflowed; re-initialize",
                    },
                })),
            );
            let _ = self.streams.publish(session_id, overflow).await;
            self.broker
                .terminate(
                    session_id,
                    ErrorData::new(codes::STREAM_OVERFLOW, "stream overflow", None),
                )
                .await;
        }
        Ok(receipt.cursor)
    }

    /// Out-of-band notification to a session, regardless of which node holds
    /// its stream connection.
    pub(crate) async fn send_notification(
        &self,
        session_id: &SessionId,
        notification_method: &str,
        params: Option<Value>,
    ) -> Result<u64, ErrorData> {
        self.publish_to_session(
            session_id,
            JsonRpcMessage::notification(notification_method, params),
        )
        .await
    }

    /// Swap the published registry and notify ready sessions that the lists
    /// changed. The capabilities a session saw at initialize never shrink.
    pub(crate) async fn replace_registry(&self, registry: Registry) {
        self.registry.store(Arc::new(registry));
        for session in self.broker.active_sessions().await {
            if session.state().await != SessionState::Ready {
                continue;
            }
            for notification_method in [
                method::NOTIFICATION_TOOLS_LIST_CHANGED,
                method::NOTIFICATION_RESOURCES_LIST_CHANGED,
                method::NOTIFICATION_PROMPTS_LIST_CHANGED,
            ] {
                if let Err(e) = self
                    .send_notification(session.id(), notification_method, None)
                    .await
                {
                    warn!(session_id = %session.id(), error = %e, "failed to notify list change");
                    break;
                }
            }
        }
    }
}

pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<&Value>,
) -> Result<T, ErrorData> {
    let value = params.cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| ErrorData::invalid_params(e.to_string(), None))
}

fn to_result<T: Serialize>(value: T) -> Result<Value, ErrorData> {
    serde_json::to_value(value)
        .map_err(|e| ErrorData::internal_error(format!("failed to encode result: {e}"), None))
}
