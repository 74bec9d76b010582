/// Chat session building blocks: messages, context policies, role
/// templates, stop-sequence matching, response-format validation, and
/// session persistence. The stateful session itself lives in [`crate::engine`].
mod message;
mod persist;
mod policy;
mod schema;
mod stop;
mod template;

pub use message::{ChatMessage, ChatRequest, ChatResponse, RequestOverrides, ResponseFormat, Role, Usage};
pub use persist::{load_session_file, save_session_file, PersistedSession, SESSION_SCHEMA_VERSION};
pub use policy::ContextPolicy;
pub use schema::validate_json_schema;
pub use stop::StopMatcher;
pub use template::TemplateStyle;
