//! Conversation context: the ordered, append-only log of one session's dialogue.
//!
//! Exactly one system message, always first. Entries are never reordered or removed.
//! Tool calls are two-phase: `begin_tool_call` parks the invocation as pending and
//! `complete_tool_call` writes the call and its result as an adjacent pair, so a call
//! abandoned through cancellation never shows up in the log.

use crate::error::{TurnError, TurnResult};
use crate::tools::ToolInvocation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Agent,
    Tool,
}

/// Tool-call metadata carried by the call entry (agent role) and the result entry (tool role).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallMeta {
    /// Correlation id shared by the call and its result.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    /// Set on the result entry when the tool failed (unknown tool, bad arguments, handler error).
    #[serde(default)]
    pub is_error: bool,
}

/// One entry in the conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallMeta>,
}

impl ConversationMessage {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_call: None,
        }
    }

    /// True for the agent entry that requested a tool.
    pub fn is_tool_call(&self) -> bool {
        self.role == Role::Agent && self.tool_call.is_some()
    }
}

/// Immutable copy of the log, handed to the shutdown collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub messages: Vec<ConversationMessage>,
}

impl ContextSnapshot {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Last entry with the given role.
    pub fn last_of(&self, role: Role) -> Option<&ConversationMessage> {
        self.messages.iter().rev().find(|m| m.role == role)
    }

    pub fn to_json(&self) -> TurnResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TurnError::ContextInvariantViolation(format!("snapshot export failed: {}", e)))
    }
}

/// The dialogue log for one session.
#[derive(Debug, Default)]
pub struct ConversationContext {
    messages: Vec<ConversationMessage>,
    pending_tool_calls: Vec<ToolInvocation>,
}

/// Context shared between the turn controller, the active response and the tool dispatcher.
pub type SharedContext = Arc<RwLock<ConversationContext>>;

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context seeded with the session's system prompt.
    pub fn with_system_prompt(prompt: impl Into<String>) -> TurnResult<Self> {
        let mut ctx = Self::new();
        ctx.append_system(prompt)?;
        Ok(ctx)
    }

    pub fn into_shared(self) -> SharedContext {
        Arc::new(RwLock::new(self))
    }

    /// Session init only: the system message must be the first and only one.
    pub fn append_system(&mut self, text: impl Into<String>) -> TurnResult<()> {
        if !self.messages.is_empty() {
            return Err(TurnError::ContextInvariantViolation(
                "system message must be the first entry".to_string(),
            ));
        }
        self.messages.push(ConversationMessage::new(Role::System, text));
        Ok(())
    }

    pub fn append_user(&mut self, text: impl Into<String>) -> TurnResult<()> {
        self.append(ConversationMessage::new(Role::User, text))
    }

    pub fn append_agent(&mut self, text: impl Into<String>) -> TurnResult<()> {
        self.append(ConversationMessage::new(Role::Agent, text))
    }

    /// Register an outstanding call. Nothing is written to the log until it completes.
    ///
    /// Ids only need to be unique among outstanding calls; servers may reuse them
    /// across responses.
    pub fn begin_tool_call(&mut self, invocation: &ToolInvocation) -> TurnResult<()> {
        self.ensure_initialized()?;
        if self.pending_tool_calls.iter().any(|p| p.id == invocation.id) {
            return Err(TurnError::ContextInvariantViolation(format!(
                "tool call '{}' begun twice",
                invocation.id
            )));
        }
        self.pending_tool_calls.push(invocation.clone());
        Ok(())
    }

    /// Write the call entry followed immediately by its result entry.
    pub fn complete_tool_call(
        &mut self,
        invocation: &ToolInvocation,
        result: impl Into<String>,
        is_error: bool,
    ) -> TurnResult<()> {
        let pending = self.take_pending(&invocation.id).ok_or_else(|| {
            TurnError::ContextInvariantViolation(format!(
                "tool result for '{}' without a matching call",
                invocation.id
            ))
        })?;

        let call_meta = ToolCallMeta {
            id: pending.id.clone(),
            name: pending.name.clone(),
            arguments: pending.arguments.clone(),
            is_error: false,
        };
        let mut call = ConversationMessage::new(Role::Agent, String::new());
        call.tool_call = Some(call_meta.clone());

        let mut outcome = ConversationMessage::new(Role::Tool, result);
        outcome.tool_call = Some(ToolCallMeta { is_error, ..call_meta });

        self.messages.push(call);
        self.messages.push(outcome);
        Ok(())
    }

    /// Drop a pending call whose result is stale. Returns false if it was not pending.
    pub fn abandon_tool_call(&mut self, invocation: &ToolInvocation) -> bool {
        self.take_pending(&invocation.id).is_some()
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot {
            messages: self.messages.clone(),
        }
    }

    /// Check the log invariants. An unpaired tool call is reported, never repaired.
    pub fn validate(&self) -> TurnResult<()> {
        if let Some(pending) = self.pending_tool_calls.first() {
            return Err(TurnError::ContextInvariantViolation(format!(
                "tool call '{}' ({}) has no result",
                pending.id, pending.name
            )));
        }
        match self.messages.first() {
            Some(first) if first.role == Role::System => {}
            Some(_) => {
                return Err(TurnError::ContextInvariantViolation(
                    "first entry is not the system message".to_string(),
                ))
            }
            None => {
                return Err(TurnError::ContextInvariantViolation(
                    "context has no system message".to_string(),
                ))
            }
        }
        if self.messages.iter().filter(|m| m.role == Role::System).count() != 1 {
            return Err(TurnError::ContextInvariantViolation(
                "more than one system message".to_string(),
            ));
        }
        for (i, msg) in self.messages.iter().enumerate() {
            if msg.role != Role::Tool {
                continue;
            }
            let paired = i
                .checked_sub(1)
                .and_then(|j| self.messages.get(j))
                .filter(|prev| prev.is_tool_call())
                .and_then(|prev| prev.tool_call.as_ref())
                .zip(msg.tool_call.as_ref())
                .map(|(call, result)| call.id == result.id)
                .unwrap_or(false);
            if !paired {
                return Err(TurnError::ContextInvariantViolation(format!(
                    "tool result at position {} is not preceded by its call",
                    i
                )));
            }
        }
        Ok(())
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn pending_tool_calls(&self) -> usize {
        self.pending_tool_calls.len()
    }

    fn append(&mut self, message: ConversationMessage) -> TurnResult<()> {
        self.ensure_initialized()?;
        if let Some(pending) = self.pending_tool_calls.first() {
            return Err(TurnError::ContextInvariantViolation(format!(
                "cannot append {:?} message while tool call '{}' is outstanding",
                message.role, pending.id
            )));
        }
        self.messages.push(message);
        Ok(())
    }

    fn ensure_initialized(&self) -> TurnResult<()> {
        if self.messages.is_empty() {
            return Err(TurnError::ContextInvariantViolation(
                "system message must be appended first".to_string(),
            ));
        }
        Ok(())
    }

    fn take_pending(&mut self, id: &str) -> Option<ToolInvocation> {
        let pos = self.pending_tool_calls.iter().position(|p| p.id == id)?;
        Some(self.pending_tool_calls.remove(pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ConversationContext {
        ConversationContext::with_system_prompt("Sei un assistente vocale.").unwrap()
    }

    #[test]
    fn system_message_must_come_first() {
        let mut empty = ConversationContext::new();
        assert!(empty.append_user("ciao").is_err());

        let mut c = ctx();
        assert!(c.append_system("again").is_err());
        c.append_user("ciao").unwrap();
        c.append_agent("Ciao! Come posso aiutarti?").unwrap();
        assert_eq!(c.len(), 3);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn tool_pair_is_written_adjacently() {
        let mut c = ctx();
        c.append_user("cerca casa in centro").unwrap();
        let inv = ToolInvocation::new("search_property", json!({"zona": "Centro"}));
        c.begin_tool_call(&inv).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(c.pending_tool_calls(), 1);

        c.complete_tool_call(&inv, "3 risultati", false).unwrap();
        let msgs = c.messages();
        assert!(msgs[2].is_tool_call());
        assert_eq!(msgs[3].role, Role::Tool);
        assert_eq!(msgs[3].tool_call.as_ref().unwrap().id, inv.id);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn appends_blocked_while_call_outstanding() {
        let mut c = ctx();
        let inv = ToolInvocation::new("search_property", json!({}));
        c.begin_tool_call(&inv).unwrap();
        assert!(c.append_agent("partial").is_err());
    }

    #[test]
    fn unpaired_call_is_reported() {
        let mut c = ctx();
        let inv = ToolInvocation::new("search_property", json!({}));
        c.begin_tool_call(&inv).unwrap();
        let err = c.validate().unwrap_err();
        assert!(matches!(err, TurnError::ContextInvariantViolation(_)));
    }

    #[test]
    fn abandoned_call_leaves_no_trace() {
        let mut c = ctx();
        let before = c.snapshot();
        let inv = ToolInvocation::new("search_property", json!({}));
        c.begin_tool_call(&inv).unwrap();
        assert!(c.abandon_tool_call(&inv));
        assert!(!c.abandon_tool_call(&inv));
        assert_eq!(c.snapshot(), before);
        assert!(c.complete_tool_call(&inv, "late", false).is_err());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn call_id_reused_by_a_later_response() {
        let mut c = ctx();
        c.append_user("cerca in centro").unwrap();
        let first = ToolInvocation::with_id("call_0", "search_property", json!({"zona": "Centro"}));
        c.begin_tool_call(&first).unwrap();
        assert!(c.begin_tool_call(&first).is_err());
        c.complete_tool_call(&first, "3 risultati", false).unwrap();
        c.append_agent("Ho trovato tre appartamenti.").unwrap();

        c.append_user("e a Navigli?").unwrap();
        let second = ToolInvocation::with_id("call_0", "search_property", json!({"zona": "Navigli"}));
        c.begin_tool_call(&second).unwrap();
        c.complete_tool_call(&second, "1 risultato", false).unwrap();
        assert_eq!(c.len(), 8);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn snapshot_serializes_roles_lowercase() {
        let mut c = ctx();
        c.append_user("ciao").unwrap();
        let json = c.snapshot().to_json().unwrap();
        assert!(json.contains("\"role\": \"system\""));
        assert!(json.contains("\"role\": \"user\""));
    }
}
