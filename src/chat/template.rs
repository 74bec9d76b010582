/// Prompt rendering.
///
/// The selected messages become one prompt string via the model's role
/// template. ChatML-style tags are the default; `plain` is a bare
/// `Role: content` transcript for base models.
use crate::chat::message::{ChatMessage, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateStyle {
    #[default]
    ChatMl,
    Plain,
}

impl TemplateStyle {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("plain") => TemplateStyle::Plain,
            _ => TemplateStyle::ChatMl,
        }
    }

    fn role_name(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    /// Render messages plus the assistant cue the model completes after.
    pub fn render(&self, messages: &[&ChatMessage]) -> String {
        let mut out = String::new();
        match self {
            TemplateStyle::ChatMl => {
                for msg in messages {
                    out.push_str("<|");
                    out.push_str(Self::role_name(msg.role));
                    out.push_str("|>\n");
                    out.push_str(&msg.content);
                    out.push_str("\n<|end|>\n");
                }
                out.push_str("<|assistant|>\n");
            }
            TemplateStyle::Plain => {
                for msg in messages {
                    let role = match msg.role {
                        Role::System => "System",
                        Role::User => "User",
                        Role::Assistant => "Assistant",
                        Role::Tool => "Tool",
                    };
                    out.push_str(role);
                    out.push_str(": ");
                    out.push_str(&msg.content);
                    out.push_str("\n\n");
                }
                out.push_str("Assistant: ");
            }
        }
        out
    }
}
