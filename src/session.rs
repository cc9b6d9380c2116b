//! Per-connection coaching session.
//!
//! A `Session` owns one user's profile and conversation log. Client events are
//! handled one at a time; a chat turn runs to completion (or failure) before
//! the next event is looked at, so the state needs no locking.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, instrument, warn};

use crate::conversation::ConversationLog;
use crate::error::{CoachError, CoachResult};
use crate::history;
use crate::llm_interaction::CompletionClient;
use crate::profile::{FitnessProfile, ProfileUpdate};
use crate::prompt::compose_system_message;

/// Events a client sends over its session socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    UpdateProfile { update: ProfileUpdate },
    Chat { content: String },
    Reset,
}

/// Everything the renderer needs to draw the session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Profile { profile: FitnessProfile },
    UserMessage { content: String },
    TurnStart,
    Fragment { text: String },
    TurnEnd { content: String },
    Error { error: String },
    Notice { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    UserSubmitted,
    PromptComposed,
    Streaming,
    Completed,
    HistoryRecorded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { response: String, recorded: bool },
    /// The renderer went away mid-turn; the partial response was dropped.
    Abandoned,
}

#[derive(Debug, Default)]
pub struct Session {
    profile: FitnessProfile,
    log: ConversationLog,
    state: TurnState,
}

impl Default for TurnState {
    fn default() -> Self {
        TurnState::Idle
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: FitnessProfile) -> Self {
        Self {
            profile,
            ..Self::default()
        }
    }

    pub fn profile(&self) -> &FitnessProfile {
        &self.profile
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn apply_update(&mut self, update: ProfileUpdate) {
        debug!(?update, "Applying profile update");
        self.profile.apply(update);
    }

    /// Starts over with a fresh profile and an empty log.
    pub fn reset(&mut self) {
        info!(turns = self.log.turns(), "Resetting session");
        *self = Self::new();
    }

    fn transition(&mut self, next: TurnState) {
        debug!(from = ?self.state, to = ?next, "Turn state");
        self.state = next;
    }

    /// Dispatches one client event. Turn failures are reported to the renderer,
    /// not returned: the session stays usable afterwards.
    pub async fn handle(
        &mut self,
        event: ClientEvent,
        client: &dyn CompletionClient,
        events: &UnboundedSender<SessionEvent>,
    ) {
        match event {
            ClientEvent::UpdateProfile { update } => {
                self.apply_update(update);
                let _ = events.send(SessionEvent::Profile {
                    profile: self.profile.clone(),
                });
            }
            ClientEvent::Chat { content } => {
                if content.trim().is_empty() {
                    return;
                }
                if let Err(e) = self.run_turn(client, &content, events).await {
                    if e.is_remote() {
                        error!("Chat turn failed: {}", e);
                    } else {
                        warn!("Chat turn rejected: {}", e);
                    }
                    let _ = events.send(SessionEvent::Error {
                        error: e.to_string(),
                    });
                }
            }
            ClientEvent::Reset => {
                self.reset();
                let _ = events.send(SessionEvent::Profile {
                    profile: self.profile.clone(),
                });
            }
        }
    }

    /// Runs one chat turn, forwarding fragments to `events` as they arrive.
    ///
    /// The user message and the assistant reply are committed to the log
    /// together once the stream is exhausted. On failure, or if `events` is
    /// closed mid-stream, nothing is committed.
    #[instrument(skip(self, client, events, user_text), fields(turn = self.log.turns() + 1))]
    pub async fn run_turn(
        &mut self,
        client: &dyn CompletionClient,
        user_text: &str,
        events: &UnboundedSender<SessionEvent>,
    ) -> CoachResult<TurnOutcome> {
        self.transition(TurnState::UserSubmitted);
        if events
            .send(SessionEvent::UserMessage {
                content: user_text.to_string(),
            })
            .is_err()
        {
            self.transition(TurnState::Idle);
            return Ok(TurnOutcome::Abandoned);
        }

        let system = compose_system_message(&self.profile);
        let messages = self.log.request_messages(system, user_text);
        self.transition(TurnState::PromptComposed);

        let mut fragments = match client.stream_completion(&messages).await {
            Ok(fragments) => fragments,
            Err(e) => {
                self.transition(TurnState::Idle);
                return Err(e);
            }
        };
        let _ = events.send(SessionEvent::TurnStart);
        self.transition(TurnState::Streaming);

        let mut response = String::new();
        while let Some(fragment) = fragments.next().await {
            let fragment = match fragment {
                Ok(fragment) => fragment,
                Err(e) => {
                    warn!(partial_len = response.len(), "Discarding partial response");
                    self.transition(TurnState::Idle);
                    return Err(e);
                }
            };
            response.push_str(&fragment);
            if events.send(SessionEvent::Fragment { text: fragment }).is_err() {
                info!("Renderer closed mid-stream, abandoning turn");
                self.transition(TurnState::Idle);
                return Ok(TurnOutcome::Abandoned);
            }
        }

        self.log.commit_turn(user_text, response.clone());
        self.transition(TurnState::Completed);
        let _ = events.send(SessionEvent::TurnEnd {
            content: response.clone(),
        });

        let recorded = match history::track_turn(user_text, &response) {
            Some(record) => {
                self.profile.record_workout(record);
                self.transition(TurnState::HistoryRecorded);
                info!(
                    records = self.profile.workout_history.len(),
                    "Recorded workout history"
                );
                true
            }
            None => false,
        };

        self.transition(TurnState::Idle);
        Ok(TurnOutcome::Completed { response, recorded })
    }
}

/// Decodes a raw client frame.
///
/// A well-formed `update_profile` carrying an unknown field or option label is
/// an `InvalidSelection`; anything that is not a recognizable event (bad JSON,
/// missing or unknown `type`, wrong shape) is a `MalformedEvent`.
pub fn parse_client_event(frame: &str) -> CoachResult<ClientEvent> {
    let mut value: serde_json::Value =
        serde_json::from_str(frame).map_err(|e| CoachError::MalformedEvent(e.to_string()))?;
    let kind = value.get("type").and_then(|t| t.as_str()).map(str::to_owned);

    match kind.as_deref() {
        Some("update_profile") => {
            let update = value
                .get_mut("update")
                .map(serde_json::Value::take)
                .ok_or_else(|| CoachError::MalformedEvent("missing field `update`".into()))?;
            let update: ProfileUpdate = serde_json::from_value(update)
                .map_err(|e| CoachError::InvalidSelection(e.to_string()))?;
            Ok(ClientEvent::UpdateProfile { update })
        }
        Some("chat") | Some("reset") => serde_json::from_value(value)
            .map_err(|e| CoachError::MalformedEvent(e.to_string())),
        Some(other) => Err(CoachError::MalformedEvent(format!("unknown event type `{other}`"))),
        None => Err(CoachError::MalformedEvent("missing event `type`".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Message, Role};
    use crate::llm_interaction::FragmentStream;
    use crate::profile::{FitnessLevel, Goal};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Replays a fixed reply, optionally failing after `fail_after` fragments.
    struct ScriptedClient {
        fragments: Vec<&'static str>,
        fail_after: Option<usize>,
        requests: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(fragments: Vec<&'static str>) -> Self {
            Self {
                fragments,
                fail_after: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing_after(fragments: Vec<&'static str>, count: usize) -> Self {
            Self {
                fail_after: Some(count),
                ..Self::new(fragments)
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn stream_completion(&self, messages: &[Message]) -> CoachResult<FragmentStream> {
            self.requests.lock().unwrap().push(messages.to_vec());
            let mut items: Vec<CoachResult<String>> = self
                .fragments
                .iter()
                .take(self.fail_after.unwrap_or(usize::MAX))
                .map(|f| Ok(f.to_string()))
                .collect();
            if self.fail_after.is_some() {
                items.push(Err(CoachError::Stream("connection reset".into())));
            }
            Ok(Box::pin(stream::iter(items)))
        }
    }

    struct RateLimitedClient;

    #[async_trait]
    impl CompletionClient for RateLimitedClient {
        async fn stream_completion(&self, _messages: &[Message]) -> CoachResult<FragmentStream> {
            Err(CoachError::Api {
                status: 429,
                message: "Rate limit reached".into(),
            })
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_turns_append_pairs_in_order() {
        let client = ScriptedClient::new(vec!["Keep ", "going!"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new();

        for question in ["first", "second", "third"] {
            session.run_turn(&client, question, &tx).await.unwrap();
        }

        let log: Vec<_> = session.log().messages().cloned().collect();
        assert_eq!(log.len(), 6);
        for (i, pair) in log.chunks(2).enumerate() {
            assert_eq!(pair[0], Message::user(["first", "second", "third"][i]));
            assert_eq!(pair[1], Message::assistant("Keep going!"));
        }
        assert_eq!(session.state(), TurnState::Idle);

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[2].len(), 1 + 4 + 1);
        assert_eq!(requests[2][0].role, Role::System);
        assert_eq!(requests[2].last().unwrap(), &Message::user("third"));
    }

    #[tokio::test]
    async fn test_fragments_forwarded_then_turn_end() {
        let client = ScriptedClient::new(vec!["Try ", "lunges", "."]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new();

        session.run_turn(&client, "leg day?", &tx).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::UserMessage { content: "leg day?".into() },
                SessionEvent::TurnStart,
                SessionEvent::Fragment { text: "Try ".into() },
                SessionEvent::Fragment { text: "lunges".into() },
                SessionEvent::Fragment { text: ".".into() },
                SessionEvent::TurnEnd { content: "Try lunges.".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_workout_query_recorded() {
        let client = ScriptedClient::new(vec!["3x10 squats"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new();

        let outcome = session
            .run_turn(&client, "Can you give me a workout plan?", &tx)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Completed { response: "3x10 squats".into(), recorded: true }
        );

        session.run_turn(&client, "What's the weather?", &tx).await.unwrap();

        let history = &session.profile().workout_history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query, "Can you give me a workout plan?");
        assert_eq!(history[0].response, "3x10 squats");
    }

    #[tokio::test]
    async fn test_mid_stream_failure_commits_nothing() {
        let client = ScriptedClient::failing_after(vec!["Half ", "an answer"], 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new();

        session
            .handle(ClientEvent::Chat { content: "exercise ideas".into() }, &client, &tx)
            .await;

        assert!(session.log().is_empty());
        assert!(session.profile().workout_history.is_empty());
        assert_eq!(session.state(), TurnState::Idle);
        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Error { error }) if error.contains("connection reset")
        ));
        assert!(!events.iter().any(|e| matches!(e, SessionEvent::TurnEnd { .. })));

        // the session keeps working after a failed turn
        let client = ScriptedClient::new(vec!["ok"]);
        session.run_turn(&client, "retry", &tx).await.unwrap();
        assert_eq!(session.log().len(), 2);
    }

    #[tokio::test]
    async fn test_request_failure_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new();

        session
            .handle(ClientEvent::Chat { content: "hi".into() }, &RateLimitedClient, &tx)
            .await;

        assert!(session.log().is_empty());
        assert_eq!(
            drain(&mut rx).last(),
            Some(&SessionEvent::Error {
                error: "completion service returned 429: Rate limit reached".into()
            })
        );
    }

    #[tokio::test]
    async fn test_closed_renderer_abandons_turn() {
        let client = ScriptedClient::new(vec!["never shown"]);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut session = Session::new();

        let outcome = session.run_turn(&client, "workout?", &tx).await.unwrap();

        assert_eq!(outcome, TurnOutcome::Abandoned);
        assert!(session.log().is_empty());
        assert!(session.profile().workout_history.is_empty());
    }

    #[tokio::test]
    async fn test_profile_update_steers_next_prompt() {
        let client = ScriptedClient::new(vec!["ok"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new();

        session
            .handle(
                ClientEvent::UpdateProfile {
                    update: ProfileUpdate::FitnessLevel(FitnessLevel::Advanced),
                },
                &client,
                &tx,
            )
            .await;
        session
            .handle(
                ClientEvent::UpdateProfile {
                    update: ProfileUpdate::Goals(vec![Goal::Endurance]),
                },
                &client,
                &tx,
            )
            .await;

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Profile { profile }) if profile.goals == vec![Goal::Endurance]
        ));

        session.run_turn(&client, "marathon prep", &tx).await.unwrap();
        let requests = client.requests.lock().unwrap();
        assert!(requests[0][0].content.contains("Fitness Level: Advanced"));
        assert!(requests[0][0].content.contains("Goals: Endurance"));
    }

    #[tokio::test]
    async fn test_blank_chat_is_ignored() {
        let client = ScriptedClient::new(vec!["ok"]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = Session::new();

        session.handle(ClientEvent::Chat { content: "   ".into() }, &client, &tx).await;

        assert!(drain(&mut rx).is_empty());
        assert!(client.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_session() {
        let client = ScriptedClient::new(vec!["ok"]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = Session::new();
        session.apply_update(ProfileUpdate::Goals(vec![Goal::Strength]));
        session.run_turn(&client, "workout", &tx).await.unwrap();

        session.handle(ClientEvent::Reset, &client, &tx).await;

        assert!(session.log().is_empty());
        assert_eq!(session.profile(), &FitnessProfile::new());
    }

    #[test]
    fn test_parse_client_event() {
        assert_eq!(
            parse_client_event(r#"{"type":"chat","content":"hello"}"#).unwrap(),
            ClientEvent::Chat { content: "hello".into() }
        );
        assert_eq!(
            parse_client_event(
                r#"{"type":"update_profile","update":{"field":"injuries","value":["Back Pain"]}}"#
            )
            .unwrap(),
            ClientEvent::UpdateProfile {
                update: ProfileUpdate::Injuries(vec![crate::profile::Injury::BackPain])
            }
        );
        assert_eq!(parse_client_event(r#"{"type":"reset"}"#).unwrap(), ClientEvent::Reset);
        assert!(matches!(
            parse_client_event(r#"{"type":"update_profile","update":{"field":"goals","value":["Pilates"]}}"#),
            Err(CoachError::InvalidSelection(_))
        ));
        assert!(matches!(
            parse_client_event(r#"{"type":"update_profile","update":{"field":"age","value":30}}"#),
            Err(CoachError::InvalidSelection(_))
        ));
    }

    #[test]
    fn test_unrecognized_frames_are_malformed() {
        for frame in [
            "not json",
            "[1, 2]",
            r#"{"content":"hello"}"#,
            r#"{"type":"dance"}"#,
            r#"{"type":42}"#,
            r#"{"type":"chat"}"#,
            r#"{"type":"update_profile"}"#,
        ] {
            assert!(
                matches!(parse_client_event(frame), Err(CoachError::MalformedEvent(_))),
                "{frame} should be malformed"
            );
        }

        let err = parse_client_event(r#"{"type":"dance"}"#).unwrap_err();
        assert_eq!(err.to_string(), "malformed client event: unknown event type `dance`");
    }

    #[test]
    fn test_session_event_wire_format() {
        let json = serde_json::to_value(SessionEvent::Fragment { text: "Hi".into() }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "fragment", "text": "Hi"}));
        let json = serde_json::to_value(SessionEvent::TurnStart).unwrap();
        assert_eq!(json, serde_json::json!({"type": "turn_start"}));
    }
}
