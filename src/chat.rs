use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[cfg(test)]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Append-only message history. Messages are never edited after `push`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message and returns its index.
    pub fn push(&mut self, message: ChatMessage) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn get(&self, index: usize) -> Option<&ChatMessage> {
        self.messages.get(index)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn prompt_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == Role::User).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChatMessage, Conversation, Role};

    #[test]
    fn push_keeps_insertion_order() {
        let mut conv = Conversation::new();
        assert_eq!(conv.push(ChatMessage::user("hi")), 0);
        assert_eq!(conv.push(ChatMessage::assistant("hello")), 1);
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].role, Role::User);
        assert_eq!(conv.get(1).map(|m| m.content.as_str()), Some("hello"));
        assert_eq!(conv.prompt_count(), 1);
    }

    #[test]
    fn transcript_serialises_roles_in_lowercase() {
        let mut conv = Conversation::new();
        conv.push(ChatMessage::user("why?"));
        let json = conv.to_json().expect("serialise");
        assert!(json.contains("\"role\": \"user\""));
        let parsed: Vec<ChatMessage> = serde_json::from_str(&json).expect("parse back");
        assert_eq!(parsed, conv.messages());
    }
}
