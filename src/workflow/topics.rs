//! Conversation topic segmentation.
//!
//! Every message belongs to exactly one topic. Only user messages can open a
//! new topic: either they say so explicitly ("new topic", "back to", ...) or
//! they arrive after a long silence. Assistant and system messages always join
//! the active topic.

use chrono::{DateTime, Utc};

use super::db::DbHandle;
use super::models::{ConversationMessage, ConversationTopic, MessageRole};
use crate::config::TopicsSection;
use crate::errors::{WorkflowError, WorkflowResult};

/// Phrases that mark an explicit change of subject (matched lowercase, as substrings).
pub const TOPIC_SWITCH_PHRASES: [&str; 10] = [
    "but we weren't discussing",
    "but we werent discussing",
    "we were talking about",
    "not about that",
    "different topic",
    "let's discuss",
    "lets discuss",
    "switching topics",
    "new topic",
    "back to",
];

pub const UNTITLED_TOPIC: &str = "Untitled Topic";

/// Whether `content`, sent at `at`, starts a new topic given the last message
/// of the active topic. Gaps strictly longer than `gap` switch.
pub fn should_switch(
    content: &str,
    at: DateTime<Utc>,
    last_message_at: Option<DateTime<Utc>>,
    gap: chrono::Duration,
) -> bool {
    let lowered = content.to_lowercase();
    if TOPIC_SWITCH_PHRASES.iter().any(|p| lowered.contains(p)) {
        return true;
    }
    last_message_at.is_some_and(|last| at - last > gap)
}

pub fn default_topic_title(at: DateTime<Utc>) -> String {
    format!("Topic {}", at.format("%Y-%m-%d %H:%M"))
}

/// First five words of `content`, with "..." when the cut may have dropped words.
pub fn title_from_content(content: &str) -> String {
    let words: Vec<&str> = content.split_whitespace().take(5).collect();
    if words.is_empty() {
        return UNTITLED_TOPIC.to_string();
    }
    let mut title = words.join(" ");
    if words.len() == 5 {
        title.push_str("...");
    }
    title
}

/// Where a recorded message landed.
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub message: ConversationMessage,
    /// A new topic was opened for this message
    pub started_topic: bool,
}

impl RecordedMessage {
    pub fn topic_id(&self) -> i64 {
        // topic_id is always set by `record_message_at`
        self.message.topic_id.unwrap_or_default()
    }
}

#[derive(Clone)]
pub struct TopicSegmenter {
    db: DbHandle,
    gap: chrono::Duration,
    history_limit: usize,
}

impl TopicSegmenter {
    pub fn new(db: DbHandle, config: &TopicsSection) -> Self {
        Self {
            db,
            gap: chrono::Duration::seconds(config.gap_secs),
            history_limit: config.history_limit,
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    pub async fn active_topic(&self, project_id: i64) -> WorkflowResult<Option<ConversationTopic>> {
        Ok(self.db.call(move |db| db.active_topic(project_id)).await?)
    }

    /// End the active topic (if any) and open a new one.
    pub async fn start_new_topic(
        &self,
        project_id: i64,
        title: Option<String>,
        summary: Option<String>,
    ) -> WorkflowResult<ConversationTopic> {
        let now = Utc::now();
        let topic = self
            .db
            .call(move |db| {
                let title = title.unwrap_or_else(|| default_topic_title(now));
                db.start_new_topic(project_id, &title, summary.as_deref(), now)
            })
            .await?;
        tracing::info!(project_id, topic_id = topic.id, title = %topic.title, "Topic started");
        Ok(topic)
    }

    pub async fn record_message(
        &self,
        project_id: i64,
        role: MessageRole,
        content: String,
    ) -> WorkflowResult<RecordedMessage> {
        self.record_message_at(project_id, role, content, Utc::now())
            .await
    }

    /// Attach a message to the right topic, opening a new one when needed.
    /// The decide-and-insert sequence runs under the database lock, so two
    /// concurrent messages cannot both open a topic.
    pub async fn record_message_at(
        &self,
        project_id: i64,
        role: MessageRole,
        content: String,
        at: DateTime<Utc>,
    ) -> WorkflowResult<RecordedMessage> {
        let gap = self.gap;
        let recorded = self
            .db
            .call(move |db| {
                if db.get_project(project_id)?.is_none() {
                    return Ok(None);
                }

                let active = db.active_topic(project_id)?;
                let switch = match (&active, role) {
                    (None, _) => true,
                    (Some(topic), MessageRole::User) => {
                        let last = db.last_message_in_topic(topic.id)?;
                        should_switch(&content, at, last.map(|m| m.timestamp), gap)
                    }
                    (Some(_), _) => false,
                };

                let (topic_id, started_topic) = match active {
                    Some(topic) if !switch => (topic.id, false),
                    _ => {
                        let topic =
                            db.start_new_topic(project_id, &default_topic_title(at), None, at)?;
                        (topic.id, true)
                    }
                };

                let message = db.insert_message(project_id, topic_id, role, &content, at)?;
                Ok(Some(RecordedMessage {
                    message,
                    started_topic,
                }))
            })
            .await?
            .ok_or(WorkflowError::NotFound {
                entity: "Project",
                id: project_id,
            })?;

        if recorded.started_topic {
            tracing::info!(project_id, topic_id = recorded.topic_id(), "Topic started");
        }
        tracing::debug!(
            project_id,
            topic_id = recorded.topic_id(),
            role = %role,
            "Message recorded"
        );
        Ok(recorded)
    }

    /// The latest `limit` messages, oldest first. With `active_only`, only
    /// messages of the current active topic are returned.
    pub async fn history(
        &self,
        project_id: i64,
        active_only: bool,
        limit: usize,
    ) -> WorkflowResult<Vec<ConversationMessage>> {
        Ok(self
            .db
            .call(move |db| {
                if !active_only {
                    return db.recent_messages_in_project(project_id, limit);
                }
                match db.active_topic(project_id)? {
                    Some(topic) => db.recent_messages_in_topic(topic.id, limit),
                    None => Ok(Vec::new()),
                }
            })
            .await?)
    }

    /// Title from the first user message among the topic's first three messages.
    pub async fn generate_topic_title(&self, topic_id: i64) -> WorkflowResult<String> {
        let first = self
            .db
            .call(move |db| db.first_messages_in_topic(topic_id, 3))
            .await?;
        Ok(first
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| title_from_content(&m.content))
            .unwrap_or_else(|| UNTITLED_TOPIC.to_string()))
    }

    /// Replace a topic's title with a generated one.
    pub async fn retitle_topic(&self, topic_id: i64) -> WorkflowResult<ConversationTopic> {
        let title = self.generate_topic_title(topic_id).await?;
        Ok(self
            .db
            .call(move |db| db.update_topic_title(topic_id, &title))
            .await?)
    }

    /// Topics of a project, newest first.
    pub async fn list_topics(&self, project_id: i64) -> WorkflowResult<Vec<ConversationTopic>> {
        Ok(self.db.call(move |db| db.list_topics(project_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::db::WorkflowDb;
    use chrono::{Duration, TimeZone};

    fn gap() -> Duration {
        Duration::seconds(3600)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn setup() -> (TopicSegmenter, i64) {
        let db = DbHandle::new(WorkflowDb::new_in_memory().unwrap());
        let project_id = db
            .lock_sync()
            .unwrap()
            .create_project("chatty", None, None)
            .unwrap()
            .id;
        (TopicSegmenter::new(db, &TopicsSection::default()), project_id)
    }

    #[test]
    fn every_phrase_switches_in_any_case() {
        for phrase in TOPIC_SWITCH_PHRASES {
            let msg = format!("Ok, {} the API", phrase.to_uppercase());
            assert!(
                should_switch(&msg, t0(), Some(t0()), gap()),
                "phrase should switch: {}",
                phrase
            );
        }
    }

    #[test]
    fn gap_boundary_is_exclusive() {
        let last = t0();
        let plain = "what about the schema";
        assert!(!should_switch(plain, last + Duration::seconds(3600), Some(last), gap()));
        assert!(should_switch(plain, last + Duration::seconds(3601), Some(last), gap()));
        assert!(!should_switch(plain, last + Duration::seconds(10), Some(last), gap()));
    }

    #[test]
    fn no_previous_message_and_no_phrase_does_not_switch() {
        assert!(!should_switch("hello", t0(), None, gap()));
    }

    #[test]
    fn naive_timestamps_compare_as_utc() {
        use crate::workflow::models::parse_timestamp;
        let last = parse_timestamp("2026-03-01 09:00:00").unwrap();
        let at = parse_timestamp("2026-03-01T10:00:01+00:00").unwrap();
        assert!(should_switch("plain", at, Some(last), gap()));
    }

    #[test]
    fn title_from_content_truncates_at_five_words() {
        assert_eq!(
            title_from_content("Build a todo app with auth please"),
            "Build a todo app with..."
        );
        assert_eq!(title_from_content("Build a todo app now"), "Build a todo app now...");
        assert_eq!(title_from_content("Short one"), "Short one");
        assert_eq!(title_from_content("   "), UNTITLED_TOPIC);
    }

    #[test]
    fn default_title_uses_minutes() {
        assert_eq!(default_topic_title(t0()), "Topic 2026-03-01 09:00");
    }

    #[tokio::test]
    async fn first_message_opens_topic() {
        let (topics, project_id) = setup();
        let recorded = topics
            .record_message_at(project_id, MessageRole::User, "hi".into(), t0())
            .await
            .unwrap();
        assert!(recorded.started_topic);
        let active = topics.active_topic(project_id).await.unwrap().unwrap();
        assert_eq!(active.id, recorded.topic_id());
        assert_eq!(active.title, "Topic 2026-03-01 09:00");
    }

    #[tokio::test]
    async fn assistant_message_never_switches() {
        let (topics, project_id) = setup();
        let first = topics
            .record_message_at(project_id, MessageRole::User, "hi".into(), t0())
            .await
            .unwrap();
        let reply = topics
            .record_message_at(
                project_id,
                MessageRole::Assistant,
                "Let's discuss a new topic".into(),
                t0() + Duration::hours(5),
            )
            .await
            .unwrap();
        assert!(!reply.started_topic);
        assert_eq!(reply.topic_id(), first.topic_id());
    }

    #[tokio::test]
    async fn history_never_leaks_ended_topic() {
        let (topics, project_id) = setup();
        for (i, text) in ["first idea", "more on it"].iter().enumerate() {
            topics
                .record_message_at(
                    project_id,
                    MessageRole::User,
                    text.to_string(),
                    t0() + Duration::minutes(i as i64),
                )
                .await
                .unwrap();
        }
        let switched = topics
            .record_message_at(
                project_id,
                MessageRole::User,
                "New topic: billing".into(),
                t0() + Duration::minutes(5),
            )
            .await
            .unwrap();
        assert!(switched.started_topic);

        let history = topics.history(project_id, true, 50).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history.iter().all(|m| m.topic_id == Some(switched.topic_id())));

        let all = topics.history(project_id, false, 50).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].content, "first idea");
    }

    #[tokio::test]
    async fn long_silence_opens_topic() {
        let (topics, project_id) = setup();
        let first = topics
            .record_message_at(project_id, MessageRole::User, "morning".into(), t0())
            .await
            .unwrap();
        let same = topics
            .record_message_at(
                project_id,
                MessageRole::User,
                "still here".into(),
                t0() + Duration::seconds(3600),
            )
            .await
            .unwrap();
        assert_eq!(same.topic_id(), first.topic_id());

        let later = topics
            .record_message_at(
                project_id,
                MessageRole::User,
                "after lunch".into(),
                t0() + Duration::seconds(7201),
            )
            .await
            .unwrap();
        assert_ne!(later.topic_id(), first.topic_id());

        let listed = topics.list_topics(project_id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, later.topic_id());
        assert!(!listed[1].is_active);
    }

    #[tokio::test]
    async fn history_is_bounded_to_latest() {
        let (topics, project_id) = setup();
        for i in 0..5 {
            topics
                .record_message_at(
                    project_id,
                    MessageRole::User,
                    format!("m{}", i),
                    t0() + Duration::seconds(i),
                )
                .await
                .unwrap();
        }
        let history = topics.history(project_id, true, 2).await.unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn generated_title_uses_first_user_message() {
        let (topics, project_id) = setup();
        let recorded = topics
            .record_message_at(
                project_id,
                MessageRole::System,
                "session started".into(),
                t0(),
            )
            .await
            .unwrap();
        topics
            .record_message_at(
                project_id,
                MessageRole::User,
                "Add dark mode to the settings page".into(),
                t0() + Duration::seconds(1),
            )
            .await
            .unwrap();

        let topic = topics.retitle_topic(recorded.topic_id()).await.unwrap();
        assert_eq!(topic.title, "Add dark mode to the...");
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let (topics, _) = setup();
        let err = topics
            .record_message(999, MessageRole::User, "hi".into())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::NotFound { entity: "Project", id: 999 }));
    }
}
