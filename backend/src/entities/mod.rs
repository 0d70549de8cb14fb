pub mod conversation;
pub mod kv;
pub mod message;
pub mod settings;

use chrono::{DateTime, SubsecRound, Utc};

pub use conversation::Conversation;
pub use message::{Message, Role};
pub use settings::AppSettings;

/// Current time at the millisecond precision records are stored with, so an
/// in-memory record compares equal to its persisted copy.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
