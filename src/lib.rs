pub mod chat;
pub mod constants;
pub mod conversation;
pub mod error;
pub mod history;
pub mod llm_interaction;
pub mod profile;
pub mod prompt;
pub mod session;
pub mod web_server;

pub use conversation::{ConversationLog, Message, Role};
pub use error::{CoachError, CoachResult};
pub use llm_interaction::{CompletionClient, CompletionSettings, FragmentStream, OpenAiClient};
pub use profile::{FitnessLevel, FitnessProfile, Goal, Injury, Preference, ProfileUpdate};
pub use session::{ClientEvent, Session, SessionEvent, TurnOutcome, TurnState};
