pub mod advisory_locks;
pub mod continuation_tokens;
pub mod conversation_members;
pub mod conversations;
pub mod identities;
pub mod messages;
pub mod settings;
