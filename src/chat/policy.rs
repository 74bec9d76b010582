/// Context selection policies.
///
/// A policy is a pure function from the accumulated history to the subset
/// of messages that gets rendered into the prompt. The system prompt is
/// never dropped; selection is deterministic. Policies trim what is SENT;
/// the cache-level sliding window is a separate mechanism and the two are
/// never combined into one step.
use serde::{Deserialize, Serialize};

use crate::chat::message::{ChatMessage, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "arg", rename_all = "snake_case")]
pub enum ContextPolicy {
    /// Send everything.
    KeepAll,
    /// System prompt plus the most recent n turns. A turn starts at a
    /// user message and runs through the replies that follow it.
    KeepLastNTurns(usize),
    /// System prompt plus as many of the newest messages as fit the token
    /// budget, selected greedily from newest to oldest.
    SlidingWindow(usize),
}

impl Default for ContextPolicy {
    fn default() -> Self {
        ContextPolicy::KeepAll
    }
}

impl ContextPolicy {
    /// Select the messages to send, in chronological order.
    ///
    /// `count_tokens` measures one message the way the tokenizer will.
    pub fn select<'a>(
        &self,
        messages: &'a [ChatMessage],
        count_tokens: &dyn Fn(&ChatMessage) -> usize,
    ) -> Vec<&'a ChatMessage> {
        match self {
            ContextPolicy::KeepAll => messages.iter().collect(),
            ContextPolicy::KeepLastNTurns(n) => {
                let mut kept_rev: Vec<&ChatMessage> = Vec::new();
                let mut turns = 0usize;
                for msg in messages.iter().rev() {
                    if msg.role == Role::System {
                        continue;
                    }
                    if turns >= *n {
                        break;
                    }
                    kept_rev.push(msg);
                    if msg.role == Role::User {
                        // a user message closes a turn (walking backwards)
                        turns += 1;
                    }
                }
                let mut out: Vec<&ChatMessage> = messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .collect();
                out.extend(kept_rev.into_iter().rev());
                out
            }
            ContextPolicy::SlidingWindow(max_tokens) => {
                let mut budget = *max_tokens;
                let system: Vec<&ChatMessage> = messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .collect();
                for &msg in &system {
                    budget = budget.saturating_sub(count_tokens(msg));
                }

                let mut kept_rev: Vec<&ChatMessage> = Vec::new();
                for msg in messages.iter().rev() {
                    if msg.role == Role::System {
                        continue;
                    }
                    let cost = count_tokens(msg);
                    if cost > budget {
                        break;
                    }
                    budget -= cost;
                    kept_rev.push(msg);
                }

                let mut out = system;
                out.extend(kept_rev.into_iter().rev());
                out
            }
        }
    }
}
