//! The registry of tools, resources and prompts the server exposes.
//!
//! Routes are registered through [`RegistryBuilder`] and immutable once
//! published; the server swaps whole registries and notifies sessions via
//! `*/list_changed`. Tool arguments are validated against the declared input
//! schema before the handler runs.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::ErrorData;
use crate::model::{
    CallToolResult, GetPromptResult, JsonObject, ListPromptsResult, ListResourcesResult,
    ListToolsResult, Prompt, PromptsCapability, ReadResourceResult, Resource, ResourcesCapability,
    ServerCapabilities, Tool, ToolsCapability,
};
use crate::service::Context;

type DynToolHandler =
    dyn Fn(Context, JsonObject) -> BoxFuture<'static, Result<CallToolResult, ErrorData>>
        + Send
        + Sync;
type DynResourceHandler =
    dyn Fn(Context, String) -> BoxFuture<'static, Result<ReadResourceResult, ErrorData>>
        + Send
        + Sync;
type DynPromptHandler =
    dyn Fn(Context, Option<JsonObject>) -> BoxFuture<'static, Result<GetPromptResult, ErrorData>>
        + Send
        + Sync;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid input schema for {kind} {name}: {reason}")]
    InvalidSchema {
        kind: &'static str,
        name: String,
        reason: String,
    },
    #[error("duplicate {kind} name: {name}")]
    Duplicate { kind: &'static str, name: String },
}

pub struct ToolRoute {
    pub tool: Tool,
    validator: Arc<jsonschema::Validator>,
    call: Arc<DynToolHandler>,
}

pub struct ResourceRoute {
    pub resource: Resource,
    read: Arc<DynResourceHandler>,
}

pub struct PromptRoute {
    pub prompt: Prompt,
    get: Arc<DynPromptHandler>,
}

/// Immutable snapshot of everything the server exposes.
#[derive(Default)]
pub struct Registry {
    tools: HashMap<Cow<'static, str>, ToolRoute>,
    resources: HashMap<String, ResourceRoute>,
    prompts: HashMap<String, PromptRoute>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Capabilities advertised to clients, derived from what is registered.
    pub fn server_capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            experimental: None,
            logging: Some(JsonObject::new()),
            tools: (!self.tools.is_empty()).then(|| ToolsCapability {
                list_changed: Some(true),
            }),
            resources: (!self.resources.is_empty()).then(|| ResourcesCapability {
                subscribe: None,
                list_changed: Some(true),
            }),
            prompts: (!self.prompts.is_empty()).then(|| PromptsCapability {
                list_changed: Some(true),
            }),
        }
    }

    pub fn list_tools(&self) -> ListToolsResult {
        let mut tools: Vec<Tool> = self.tools.values().map(|route| route.tool.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        ListToolsResult {
            tools,
            next_cursor: None,
        }
    }

    pub fn list_resources(&self) -> ListResourcesResult {
        let mut resources: Vec<Resource> = self
            .resources
            .values()
            .map(|route| route.resource.clone())
            .collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        ListResourcesResult {
            resources,
            next_cursor: None,
        }
    }

    pub fn list_prompts(&self) -> ListPromptsResult {
        let mut prompts: Vec<Prompt> = self
            .prompts
            .values()
            .map(|route| route.prompt.clone())
            .collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        ListPromptsResult {
            prompts,
            next_cursor: None,
        }
    }

    /// Validate arguments against the tool's schema and run its handler.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        context: Context,
    ) -> Result<CallToolResult, ErrorData> {
        let route = self
            .tools
            .get(name)
            .ok_or_else(|| ErrorData::invalid_params(format!("tool not found: {name}"), None))?;
        let arguments = arguments.unwrap_or_default();
        let instance = Value::Object(arguments);
        if let Err(violation) = route.validator.validate(&instance) {
            return Err(ErrorData::invalid_params(
                violation.to_string(),
                Some(serde_json::json!({ "path": violation.instance_path.to_string() })),
            ));
        }
        let Value::Object(arguments) = instance else {
            unreachable!("instance was constructed from an object")
        };
        (route.call)(context, arguments).await
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        context: Context,
    ) -> Result<ReadResourceResult, ErrorData> {
        let route = self
            .resources
            .get(uri)
            .ok_or_else(|| ErrorData::invalid_params(format!("resource not found: {uri}"), None))?;
        (route.read)(context, uri.to_string()).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        context: Context,
    ) -> Result<GetPromptResult, ErrorData> {
        let route = self
            .prompts
            .get(name)
            .ok_or_else(|| ErrorData::invalid_params(format!("prompt not found: {name}"), None))?;
        (route.get)(context, arguments).await
    }
}

/// Accumulates routes; `build` compiles schemas and freezes the registry.
#[derive(Default)]
pub struct RegistryBuilder {
    tools: Vec<(Tool, Arc<DynToolHandler>)>,
    resources: Vec<(Resource, Arc<DynResourceHandler>)>,
    prompts: Vec<(Prompt, Arc<DynPromptHandler>)>,
}

impl RegistryBuilder {
    pub fn tool<F, Fut>(mut self, tool: Tool, handler: F) -> Self
    where
        F: Fn(Context, JsonObject) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, ErrorData>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.tools.push((
            tool,
            Arc::new(move |context, arguments| Box::pin(handler(context, arguments))),
        ));
        self
    }

    pub fn resource<F, Fut>(mut self, resource: Resource, read: F) -> Self
    where
        F: Fn(Context, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ReadResourceResult, ErrorData>> + Send + 'static,
    {
        let read = Arc::new(read);
        self.resources.push((
            resource,
            Arc::new(move |context, uri| Box::pin(read(context, uri))),
        ));
        self
    }

    pub fn prompt<F, Fut>(mut self, prompt: Prompt, get: F) -> Self
    where
        F: Fn(Context, Option<JsonObject>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<GetPromptResult, ErrorData>> + Send + 'static,
    {
        let get = Arc::new(get);
        self.prompts.push((
            prompt,
            Arc::new(move |context, arguments| Box::pin(get(context, arguments))),
        ));
        self
    }

    pub fn build(self) -> Result<Registry, RegistryError> {
        let mut registry = Registry::default();
        for (tool, call) in self.tools {
            let name = tool.name.clone();
            if registry.tools.contains_key(&name) {
                return Err(RegistryError::Duplicate {
                    kind: "tool",
                    name: name.into_owned(),
                });
            }
            let schema = Value::Object((*tool.input_schema).clone());
            let validator =
                jsonschema::validator_for(&schema).map_err(|e| RegistryError::InvalidSchema {
                    kind: "tool",
                    name: name.clone().into_owned(),
                    reason: e.to_string(),
                })?;
            registry.tools.insert(
                name,
                ToolRoute {
                    tool,
                    validator: Arc::new(validator),
                    call,
                },
            );
        }
        for (resource, read) in self.resources {
            if registry.resources.contains_key(&resource.uri) {
                return Err(RegistryError::Duplicate {
                    kind: "resource",
                    name: resource.uri,
                });
            }
            registry
                .resources
                .insert(resource.uri.clone(), ResourceRoute { resource, read });
        }
        for (prompt, get) in self.prompts {
            if registry.prompts.contains_key(&prompt.name) {
                return Err(RegistryError::Duplicate {
                    kind: "prompt",
                    name: prompt.name,
                });
            }
            registry
                .prompts
                .insert(prompt.name.clone(), PromptRoute { prompt, get });
        }
        Ok(registry)
    }
}
