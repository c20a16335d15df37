//! Mode-driven selection of the agents that answer a message.

use confab_core::conversation::ConversationMode;
use confab_core::ids::AgentId;

/// Agents to invoke for one triggering message.
///
/// `participants` are the present agent participants in join order and
/// `is_active` says which of them may answer. The result is always a
/// subsequence of the active participants, so mentions of agents outside
/// the conversation are dropped.
pub fn route(
    mode: ConversationMode,
    mentioned: &[AgentId],
    participants: &[AgentId],
    is_active: impl Fn(&AgentId) -> bool,
    last_responder: Option<&AgentId>,
) -> Vec<AgentId> {
    let active: Vec<AgentId> = participants.iter().filter(|id| is_active(id)).cloned().collect();
    let addressed: Vec<AgentId> = active
        .iter()
        .filter(|id| mentioned.contains(id))
        .cloned()
        .collect();

    match mode {
        ConversationMode::OnDemand => addressed,
        ConversationMode::Moderated if addressed.is_empty() => active,
        ConversationMode::Moderated => addressed,
        ConversationMode::RoundRobin if addressed.is_empty() => {
            next_in_turn(participants, &is_active, last_responder).into_iter().collect()
        }
        ConversationMode::RoundRobin => addressed,
        ConversationMode::Free => active,
    }
}

/// The first active participant after `last_responder` in join order,
/// wrapping. The search starts at the first participant when the last
/// responder is unknown or no longer a participant.
pub fn next_in_turn(
    participants: &[AgentId],
    is_active: impl Fn(&AgentId) -> bool,
    last_responder: Option<&AgentId>,
) -> Option<AgentId> {
    let start = last_responder
        .and_then(|last| participants.iter().position(|id| id == last))
        .map_or(0, |idx| idx + 1);
    (0..participants.len())
        .map(|offset| &participants[(start + offset) % participants.len()])
        .find(|id| is_active(id))
        .cloned()
}
