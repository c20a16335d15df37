//! RPC method handlers organized by domain.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use confab_core::agent::{Agent, ContextScope};
use confab_core::conversation::{ConversationMode, ConversationStatus, ParticipantKind};
use confab_core::ids::{AgentId, ClientId, ConversationId, MessageId, OrganizationId, ParticipantId, UserId};
use confab_engine::{AgentDirectory, EngineError, NewCustomAgent, SettingsUpdate};
use confab_store::Database;

use crate::hub::SyncHub;
use crate::orchestrator::{ConversationOrchestrator, InvocationTarget, SendMessage};
use crate::rpc::{self, RpcResponse};

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub orchestrator: Arc<dyn ConversationOrchestrator>,
    pub directory: Arc<AgentDirectory>,
    pub hub: Arc<SyncHub>,
    pub db: Database,
    pub generator: String,
}

enum HandlerError {
    InvalidParams(String),
    Engine(EngineError),
    Internal(String),
}

impl From<EngineError> for HandlerError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self::InvalidParams(msg)
    }
}

type HandlerResult = Result<Value, HandlerError>;

fn to_json<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| HandlerError::Internal(e.to_string()))
}

/// Rewrite top-level camelCase keys to snake_case. An explicit snake_case
/// key wins over its camelCase twin.
pub fn normalize_params(params: &Value) -> Value {
    let Some(obj) = params.as_object() else {
        return params.clone();
    };
    let mut result = serde_json::Map::with_capacity(obj.len());
    for (key, value) in obj {
        let snake = to_snake_case(key);
        if snake != *key && obj.contains_key(&snake) {
            continue;
        }
        let _ = result.insert(snake, value.clone());
    }
    Value::Object(result)
}

fn to_snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Dispatch an RPC method. `client_id` is the calling WebSocket client, if
/// any; hub methods require one.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    method: &str,
    params: &Value,
    id: Option<Value>,
) -> RpcResponse {
    let params = normalize_params(params);

    let result = match method {
        // Conversation
        "conversation.create" => conversation_create(state, &params),
        "conversation.get" => conversation_get(state, &params).await,
        "conversation.list" => conversation_list(state, &params),
        "conversation.messages" => conversation_messages(state, &params).await,
        "conversation.send" => conversation_send(state, &params).await,
        "conversation.invoke" => conversation_invoke(state, &params).await,
        "conversation.updateSettings" => conversation_update_settings(state, &params).await,
        "conversation.archive" => conversation_archive(state, &params).await,

        // Participants
        "participant.add" => participant_add(state, &params).await,
        "participant.remove" => participant_remove(state, &params).await,

        // Hub
        "hub.subscribe" => hub_subscribe(state, client_id, &params).await,
        "hub.unsubscribe" => hub_unsubscribe(state, client_id, &params),
        "hub.markRead" => hub_mark_read(state, client_id, &params),

        // Agent directory
        "agent.list" => agent_list(state, &params),
        "agent.seed" => agent_seed(state, &params),
        "agent.createCustom" => agent_create_custom(state, &params),
        "agent.updatePrompt" => agent_update_prompt(state, &params),
        "agent.setInstructions" => agent_set_instructions(state, &params),
        "agent.setActive" => agent_set_active(state, &params),
        "agent.delete" => agent_delete(state, &params),

        // System
        "system.ping" | "health" => Ok(health(state)),

        _ => return RpcResponse::method_not_found(id, method),
    };

    match result {
        Ok(value) => RpcResponse::success(id, value),
        Err(HandlerError::InvalidParams(msg)) => RpcResponse::invalid_params(id, msg),
        Err(HandlerError::Engine(e)) => RpcResponse::engine_error(id, &e),
        Err(HandlerError::Internal(msg)) => RpcResponse::internal_error(id, msg),
    }
}

fn conversation_id(params: &Value) -> Result<ConversationId, HandlerError> {
    Ok(ConversationId::from_raw(rpc::require_str(params, "conversation_id")?))
}

fn organization_id(params: &Value) -> Result<OrganizationId, HandlerError> {
    Ok(OrganizationId::from_raw(rpc::require_str(params, "organization_id")?))
}

fn agent_id(params: &Value) -> Result<AgentId, HandlerError> {
    Ok(AgentId::from_raw(rpc::require_str(params, "agent_id")?))
}

fn require_client(client_id: Option<&ClientId>) -> Result<&ClientId, HandlerError> {
    client_id.ok_or_else(|| HandlerError::InvalidParams("hub methods need a WebSocket client".into()))
}

// ── Conversation handlers ──

fn conversation_create(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let organization_id = organization_id(params)?;
    let owner = UserId::from_raw(rpc::require_str(params, "owner_id")?);
    let title = rpc::optional_str(params, "title").unwrap_or("Untitled").to_string();
    let mode = rpc::optional_parsed::<ConversationMode>(params, "mode")?.unwrap_or_default();

    let conversation = state
        .orchestrator
        .create_conversation(organization_id, owner, title, mode)?;
    let mut result = to_json(&conversation)?;
    if let Some(caution) = mode.caution() {
        result["mode_caution"] = json!(caution);
    }
    Ok(result)
}

async fn conversation_get(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let conversation = state.orchestrator.conversation(&conversation_id(params)?).await?;
    to_json(&conversation)
}

fn conversation_list(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let conversations = state.orchestrator.list_conversations(&organization_id(params)?)?;
    Ok(json!({ "conversations": to_json(&conversations)? }))
}

async fn conversation_messages(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let limit = rpc::optional_u64(params, "limit").map(|n| n as usize);
    let messages = state
        .orchestrator
        .messages(&conversation_id(params)?, limit)
        .await?;
    Ok(json!({ "messages": to_json(&messages)? }))
}

async fn conversation_send(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let send = SendMessage {
        conversation_id: conversation_id(params)?,
        user_id: UserId::from_raw(rpc::require_str(params, "user_id")?),
        content: rpc::require_str(params, "content")?.to_string(),
    };
    if rpc::optional_bool(params, "respond").unwrap_or(true) {
        let outcome = state.orchestrator.send_and_respond(send).await?;
        Ok(json!({
            "message": to_json(&outcome.message)?,
            "replies": to_json(&outcome.replies)?,
        }))
    } else {
        let message = state.orchestrator.send_message(send).await?;
        Ok(json!({ "message": to_json(&message)?, "replies": [] }))
    }
}

/// `agents` is `"all"`, `"mentioned-only"`, `"routed"`, or an array of ids.
fn invocation_target(params: &Value) -> Result<InvocationTarget, HandlerError> {
    match params.get("agents") {
        None => Ok(InvocationTarget::Routed),
        Some(Value::String(s)) => match s.as_str() {
            "all" => Ok(InvocationTarget::All),
            "mentioned-only" => Ok(InvocationTarget::MentionedOnly),
            "routed" => Ok(InvocationTarget::Routed),
            other => Err(HandlerError::InvalidParams(format!("unknown agents selector: {other}"))),
        },
        Some(Value::Array(ids)) => ids
            .iter()
            .map(|v| {
                v.as_str()
                    .map(AgentId::from_raw)
                    .ok_or_else(|| HandlerError::InvalidParams("agent ids must be strings".into()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(InvocationTarget::Agents),
        Some(_) => Err(HandlerError::InvalidParams(
            "agents must be a selector string or an array of ids".into(),
        )),
    }
}

async fn conversation_invoke(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let id = conversation_id(params)?;
    let target = invocation_target(params)?;
    let replies = state.orchestrator.invoke_agents(&id, target).await?;
    Ok(json!({ "replies": to_json(&replies)? }))
}

async fn conversation_update_settings(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let update = SettingsUpdate {
        mode: rpc::optional_parsed::<ConversationMode>(params, "mode")?,
        status: rpc::optional_parsed::<ConversationStatus>(params, "status")?,
    };
    let conversation = state
        .orchestrator
        .update_settings(&conversation_id(params)?, update)
        .await?;
    let mut result = to_json(&conversation)?;
    if let Some(caution) = conversation.mode.caution() {
        result["mode_caution"] = json!(caution);
    }
    Ok(result)
}

async fn conversation_archive(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let conversation = state.orchestrator.archive(&conversation_id(params)?).await?;
    to_json(&conversation)
}

// ── Participant handlers ──

async fn participant_add(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let kind = match (
        rpc::optional_str(params, "agent_id"),
        rpc::optional_str(params, "user_id"),
    ) {
        (Some(agent), None) => ParticipantKind::Agent {
            agent_id: AgentId::from_raw(agent),
        },
        (None, Some(user)) => ParticipantKind::Human {
            user_id: UserId::from_raw(user),
        },
        _ => {
            return Err(HandlerError::InvalidParams(
                "exactly one of agentId or userId is required".into(),
            ))
        }
    };
    let participant = state
        .orchestrator
        .add_participant(&conversation_id(params)?, kind)
        .await?;
    to_json(&participant)
}

async fn participant_remove(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let participant_id = ParticipantId::from_raw(rpc::require_str(params, "participant_id")?);
    let conversation = state
        .orchestrator
        .remove_participant(&conversation_id(params)?, &participant_id)
        .await?;
    to_json(&conversation)
}

// ── Hub handlers ──

async fn hub_subscribe(
    state: &Arc<HandlerState>,
    client_id: Option<&ClientId>,
    params: &Value,
) -> HandlerResult {
    let client_id = require_client(client_id)?;
    let id = conversation_id(params)?;
    // unknown conversations fail here rather than subscribing silently
    let _ = state.orchestrator.conversation(&id).await?;
    state.hub.subscribe(&id, client_id);
    Ok(json!({
        "subscribed": true,
        "unread": state.hub.unread(&id, client_id),
        "seq": state.hub.seq(&id),
    }))
}

fn hub_unsubscribe(state: &Arc<HandlerState>, client_id: Option<&ClientId>, params: &Value) -> HandlerResult {
    let client_id = require_client(client_id)?;
    let removed = state.hub.unsubscribe(&conversation_id(params)?, client_id);
    Ok(json!({ "unsubscribed": removed }))
}

fn hub_mark_read(state: &Arc<HandlerState>, client_id: Option<&ClientId>, params: &Value) -> HandlerResult {
    let client_id = require_client(client_id)?;
    let up_to = MessageId::from_raw(rpc::require_str(params, "message_id")?);
    let unread = state.hub.mark_read(&conversation_id(params)?, client_id, &up_to);
    Ok(json!({ "unread": unread }))
}

// ── Agent directory handlers ──

fn agent_list(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let agents = state.directory.list(&organization_id(params)?)?;
    let agents: Vec<&Agent> = agents.iter().map(|a| &**a).collect();
    Ok(json!({ "agents": to_json(&agents)? }))
}

fn agent_seed(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let agents = state.directory.seed_builtins(&organization_id(params)?)?;
    let agents: Vec<&Agent> = agents.iter().map(|a| &**a).collect();
    Ok(json!({ "agents": to_json(&agents)? }))
}

fn context_scopes(params: &Value) -> Result<Vec<ContextScope>, HandlerError> {
    let Some(raw) = params.get("context_scopes") else {
        return Ok(Vec::new());
    };
    let items = raw
        .as_array()
        .ok_or_else(|| HandlerError::InvalidParams("contextScopes must be an array".into()))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| "context scopes must be strings".to_string())
                .and_then(|s| s.parse::<ContextScope>())
                .map_err(HandlerError::InvalidParams)
        })
        .collect()
}

fn agent_create_custom(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let spec = NewCustomAgent {
        name: rpc::require_str(params, "name")?.to_string(),
        prompt: rpc::require_str(params, "prompt")?.to_string(),
        context_scopes: context_scopes(params)?,
        can_call_built_in_agents: rpc::optional_bool(params, "can_call_built_in_agents").unwrap_or(false),
    };
    let agent = state.directory.create_custom(&organization_id(params)?, spec)?;
    to_json(agent.as_ref())
}

fn agent_update_prompt(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let prompt = rpc::require_str(params, "prompt")?.to_string();
    let agent = state.directory.update_custom_prompt(&agent_id(params)?, prompt)?;
    to_json(agent.as_ref())
}

fn agent_set_instructions(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let instructions = rpc::require_str(params, "instructions")?.to_string();
    let agent = state
        .directory
        .set_custom_instructions(&agent_id(params)?, instructions)?;
    to_json(agent.as_ref())
}

fn agent_set_active(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    let active = rpc::optional_bool(params, "active")
        .ok_or_else(|| HandlerError::InvalidParams("missing required parameter: active".into()))?;
    let agent = state.directory.set_active(&agent_id(params)?, active)?;
    to_json(agent.as_ref())
}

fn agent_delete(state: &Arc<HandlerState>, params: &Value) -> HandlerResult {
    state.directory.delete(&agent_id(params)?)?;
    Ok(json!({ "deleted": true }))
}

// ── System ──

fn health(state: &Arc<HandlerState>) -> Value {
    let db_ok = state
        .db
        .with_conn(|conn| {
            conn.execute_batch("SELECT 1")?;
            Ok(true)
        })
        .unwrap_or(false);

    json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "components": {
            "database": if db_ok { "ok" } else { "error" },
            "generator": state.generator,
        },
    })
}
