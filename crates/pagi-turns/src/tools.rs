//! Tool definitions and the dispatcher that runs model-requested calls.
//!
//! Tools are registered once at session setup with an explicit parameter schema.
//! Arguments are checked against that schema before the handler runs; every
//! failure (unknown tool, bad arguments, handler error) becomes a failed tool
//! result so the model can answer conversationally instead of ending the turn.

use crate::context::SharedContext;
use crate::error::{BoxError, TurnError, TurnResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// JSON type a parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// Name, description and parameter schema of a tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParamSpec>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Builder-style parameter declaration.
    pub fn param(
        mut self,
        name: impl Into<String>,
        kind: ParamType,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.parameters.insert(
            name.into(),
            ParamSpec {
                kind,
                description: description.into(),
                required,
            },
        );
        self
    }

    /// JSON-schema object for the `parameters` field of a function declaration.
    pub fn json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .parameters
            .iter()
            .map(|(name, spec)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "type": spec.kind,
                        "description": spec.description,
                    }),
                )
            })
            .collect();
        let required: Vec<&str> = self
            .parameters
            .iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name.as_str())
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `arguments` against the declared parameters.
    pub fn validate_arguments(&self, arguments: &Value) -> TurnResult<()> {
        let invalid = |reason: String| TurnError::InvalidArguments {
            tool: self.name.clone(),
            reason,
        };

        let empty = Map::new();
        let args = match arguments {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(invalid(format!("expected an object, got {}", other))),
        };

        for (name, spec) in &self.parameters {
            match args.get(name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(invalid(format!("missing required parameter '{}'", name)))
                }
                Some(value) if !value.is_null() && !spec.kind.matches(value) => {
                    return Err(invalid(format!(
                        "parameter '{}' must be {:?}, got {}",
                        name, spec.kind, value
                    )))
                }
                _ => {}
            }
        }
        if let Some(unknown) = args.keys().find(|k| !self.parameters.contains_key(*k)) {
            return Err(invalid(format!("unexpected parameter '{}'", unknown)));
        }
        Ok(())
    }
}

/// A call requested by the model. Consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Correlation id tying the call to its result.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolInvocation {
    /// New invocation with a generated correlation id.
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self::with_id(format!("call_{}", uuid::Uuid::new_v4().simple()), name, arguments)
    }

    pub fn with_id(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Capability behind a tool. Long-running handlers should watch `cancel`.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, cancel: CancellationToken) -> Result<String, BoxError>;
}

/// Adapter turning an async closure into a [`ToolHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure `Fn(Value) -> Future<Output = Result<String, BoxError>>`.
pub fn tool_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait::async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
{
    async fn call(&self, arguments: Value, _cancel: CancellationToken) -> Result<String, BoxError> {
        (self.0)(arguments).await
    }
}

/// How a context-aware dispatch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The pair was appended. `is_error` marks a failure result reported to the model.
    Completed { result: String, is_error: bool },
    /// The response was cancelled first; nothing was appended.
    Cancelled,
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// Registry of tools that can be dispatched by name.
#[derive(Default)]
pub struct ToolDispatcher {
    tools: Vec<RegisteredTool>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> TurnResult<()> {
        if self.get(&definition.name).is_some() {
            return Err(TurnError::DuplicateToolName(definition.name));
        }
        if definition.name.trim().is_empty() {
            return Err(TurnError::InvalidArguments {
                tool: definition.name,
                reason: "tool name must not be empty".to_string(),
            });
        }
        debug!("Registered tool '{}'", definition.name);
        self.tools.push(RegisteredTool { definition, handler });
        Ok(())
    }

    /// Definitions advertised to the generator.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition.clone()).collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.definition.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve, validate and run one invocation.
    pub async fn dispatch(&self, invocation: &ToolInvocation) -> TurnResult<String> {
        self.dispatch_with_cancel(invocation, CancellationToken::new()).await
    }

    /// Like [`ToolDispatcher::dispatch`], passing `cancel` on to the handler.
    pub async fn dispatch_with_cancel(
        &self,
        invocation: &ToolInvocation,
        cancel: CancellationToken,
    ) -> TurnResult<String> {
        let tool = self
            .get(&invocation.name)
            .ok_or_else(|| TurnError::UnknownTool(invocation.name.clone()))?;
        tool.definition.validate_arguments(&invocation.arguments)?;

        tool.handler
            .call(invocation.arguments.clone(), cancel)
            .await
            .map_err(|e| TurnError::HandlerFailure {
                tool: invocation.name.clone(),
                cause: e.to_string(),
            })
    }

    /// Run `invocation` inside the context's paired protocol.
    ///
    /// The call is begun before the handler runs. If `cancel` fires first the handler
    /// is dropped and the call abandoned; otherwise the call/result pair is appended,
    /// with tool errors rendered as a failure result for the model.
    pub async fn dispatch_into(
        &self,
        invocation: &ToolInvocation,
        context: &SharedContext,
        cancel: &CancellationToken,
    ) -> TurnResult<ToolOutcome> {
        context.write().await.begin_tool_call(invocation)?;
        info!("🔧 Tool call: {} ({})", invocation.name, invocation.id);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.dispatch_with_cancel(invocation, cancel.child_token()) => Some(r),
        };

        let mut ctx = context.write().await;
        // Checked under the write lock: the canceller flips the token while holding it.
        let result = match result {
            Some(r) if !cancel.is_cancelled() => r,
            _ => {
                ctx.abandon_tool_call(invocation);
                debug!("Tool call {} abandoned (response cancelled)", invocation.id);
                return Ok(ToolOutcome::Cancelled);
            }
        };

        let (text, is_error) = match result {
            Ok(text) => (text, false),
            Err(e) if e.is_tool_error() => {
                warn!("Tool call {} failed: {}", invocation.id, e);
                (failure_result(&e), true)
            }
            Err(e) => {
                ctx.abandon_tool_call(invocation);
                return Err(e);
            }
        };
        ctx.complete_tool_call(invocation, text.clone(), is_error)?;
        Ok(ToolOutcome::Completed {
            result: text,
            is_error,
        })
    }

    fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.definition.name == name)
    }
}

/// Tool-result payload describing a failure, readable by the model.
pub fn failure_result(error: &TurnError) -> String {
    let kind = match error {
        TurnError::UnknownTool(_) => "unknown_tool",
        TurnError::InvalidArguments { .. } => "invalid_arguments",
        TurnError::HandlerFailure { .. } => "handler_failure",
        _ => "error",
    };
    serde_json::json!({
        "error": kind,
        "message": error.to_string(),
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ConversationContext, Role};
    use serde_json::json;
    use std::time::Duration;

    fn search_property() -> ToolDefinition {
        ToolDefinition::new("search_property", "Cerca immobili per zona")
            .param("zona", ParamType::String, "Quartiere", true)
            .param("max_price", ParamType::Integer, "Prezzo massimo", false)
    }

    fn dispatcher() -> ToolDispatcher {
        let mut d = ToolDispatcher::new();
        d.register(
            search_property(),
            tool_fn(|args: Value| async move {
                Ok(format!("2 appartamenti in {}", args["zona"].as_str().unwrap_or("?")))
            }),
        )
        .unwrap();
        d
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut d = dispatcher();
        let err = d
            .register(search_property(), tool_fn(|_| async { Ok(String::new()) }))
            .unwrap_err();
        assert_eq!(err, TurnError::DuplicateToolName("search_property".into()));
    }

    #[test]
    fn schema_lists_required_params() {
        let schema = search_property().json_schema();
        assert_eq!(schema["required"], json!(["zona"]));
        assert_eq!(schema["properties"]["max_price"]["type"], json!("integer"));
    }

    #[tokio::test]
    async fn dispatch_checks_schema() {
        let d = dispatcher();
        let ok = ToolInvocation::new("search_property", json!({"zona": "Centro"}));
        assert_eq!(d.dispatch(&ok).await.unwrap(), "2 appartamenti in Centro");

        let missing = ToolInvocation::new("search_property", json!({}));
        assert!(matches!(
            d.dispatch(&missing).await,
            Err(TurnError::InvalidArguments { .. })
        ));

        let wrong_type = ToolInvocation::new("search_property", json!({"zona": "Centro", "max_price": "tanto"}));
        assert!(matches!(
            d.dispatch(&wrong_type).await,
            Err(TurnError::InvalidArguments { .. })
        ));

        let unknown = ToolInvocation::new("book_visit", json!({}));
        assert_eq!(
            d.dispatch(&unknown).await,
            Err(TurnError::UnknownTool("book_visit".into()))
        );
    }

    #[tokio::test]
    async fn handler_error_becomes_handler_failure() {
        let mut d = ToolDispatcher::new();
        d.register(
            ToolDefinition::new("flaky", "always fails"),
            tool_fn(|_| async { Err::<String, BoxError>("backend down".into()) }),
        )
        .unwrap();
        let err = d.dispatch(&ToolInvocation::new("flaky", Value::Null)).await.unwrap_err();
        assert_eq!(
            err,
            TurnError::HandlerFailure {
                tool: "flaky".into(),
                cause: "backend down".into()
            }
        );
    }

    #[tokio::test]
    async fn dispatch_into_appends_pair_or_failure() {
        let d = dispatcher();
        let ctx = ConversationContext::with_system_prompt("sys").unwrap().into_shared();
        let cancel = CancellationToken::new();

        let inv = ToolInvocation::new("search_property", json!({"zona": "Centro"}));
        let outcome = d.dispatch_into(&inv, &ctx, &cancel).await.unwrap();
        assert!(matches!(outcome, ToolOutcome::Completed { is_error: false, .. }));

        let unknown = ToolInvocation::new("book_visit", json!({}));
        let outcome = d.dispatch_into(&unknown, &ctx, &cancel).await.unwrap();
        match outcome {
            ToolOutcome::Completed { result, is_error } => {
                assert!(is_error);
                assert!(result.contains("unknown_tool"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let guard = ctx.read().await;
        let roles: Vec<Role> = guard.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::Agent, Role::Tool, Role::Agent, Role::Tool]);
        assert!(guard.validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_dispatch_leaves_context_untouched() {
        let mut d = ToolDispatcher::new();
        d.register(
            ToolDefinition::new("slow", "takes a while"),
            tool_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("late".to_string())
            }),
        )
        .unwrap();
        let ctx = ConversationContext::with_system_prompt("sys").unwrap().into_shared();
        let before = ctx.read().await.snapshot();
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let inv = ToolInvocation::new("slow", Value::Null);
        let outcome = d.dispatch_into(&inv, &ctx, &cancel).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome, ToolOutcome::Cancelled);
        let guard = ctx.read().await;
        assert_eq!(guard.snapshot(), before);
        assert_eq!(guard.pending_tool_calls(), 0);
    }
}
