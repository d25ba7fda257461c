//! Prompt rendering.
//!
//! Building a rich prompt from memory files is an outside concern; the
//! [`PromptBuilder`] trait is where that plugs in. [`DefaultPromptBuilder`]
//! renders the record as a plain block.

use senseloop_core::event::{InboundEvent, Payload, SenseEvent, SensePriority};
use senseloop_session::Handoff;
use serde_json::Value;

/// What a prompt is built from.
#[derive(Debug, Clone)]
pub enum PromptInput {
    Message(InboundEvent),
    Sense(SenseEvent),
}

impl PromptInput {
    /// Conversation the input belongs to. Sense events without a thread hint
    /// get one thread per sense name.
    pub fn thread_id(&self) -> String {
        match self {
            Self::Message(event) => event.thread_id.clone(),
            Self::Sense(event) => match event.thread_hint() {
                Some(thread) => thread.to_string(),
                None => format!("sense:{}", event.sense),
            },
        }
    }

    /// The user-facing text, used to classify the request.
    pub fn text(&self) -> String {
        match self {
            Self::Message(event) => event.payload.describe(),
            Self::Sense(event) => ["text", "message", "body"]
                .iter()
                .find_map(|key| event.data.get(*key).and_then(Value::as_str))
                .map(str::to_owned)
                .unwrap_or_else(|| Value::Object(event.data.clone()).to_string()),
        }
    }

    /// True when there is nothing to answer.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Message(event) => match &event.payload {
                Payload::Text { text } => text.trim().is_empty(),
                _ => false,
            },
            Self::Sense(_) => false,
        }
    }
}

pub trait PromptBuilder: Send + Sync {
    fn build(&self, input: &PromptInput, handoff: Option<&Handoff>) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPromptBuilder;

impl PromptBuilder for DefaultPromptBuilder {
    fn build(&self, input: &PromptInput, handoff: Option<&Handoff>) -> String {
        let mut prompt = String::new();
        if let Some(handoff) = handoff {
            prompt.push_str(&handoff.render());
            prompt.push_str("\n---\n\n");
        }

        match input {
            PromptInput::Message(event) => {
                prompt.push_str(&format!(
                    "New message in thread {} from {} at {}:\n{}",
                    event.thread_id,
                    event.sender_id,
                    event.timestamp.to_rfc3339(),
                    event.payload.describe()
                ));
            }
            PromptInput::Sense(event) => {
                prompt.push_str(&format!(
                    "Sense event `{}` ({} priority) at {}:\n{}",
                    event.sense,
                    priority_label(event.priority),
                    event.timestamp.to_rfc3339(),
                    pretty(&event.data)
                ));
                if let Some(context) = &event.context {
                    prompt.push_str("\n\nContext:\n");
                    prompt.push_str(&pretty(context));
                }
            }
        }
        prompt
    }
}

fn priority_label(priority: SensePriority) -> &'static str {
    match priority {
        SensePriority::Immediate => "immediate",
        SensePriority::Normal => "normal",
        SensePriority::Background => "background",
    }
}

fn pretty(map: &serde_json::Map<String, Value>) -> String {
    serde_json::to_string_pretty(map).unwrap_or_else(|_| Value::Object(map.clone()).to_string())
}
