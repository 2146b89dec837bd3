use chrono::{DateTime, Local};

/// A received message as the presentation layer shows it. Never sent anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMessage {
    pub id: String,
    pub content: String,
    pub received_at: DateTime<Local>,
}

impl DisplayMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: nanoid::nanoid!(),
            content: content.into(),
            received_at: Local::now(),
        }
    }

    pub fn time_label(&self) -> String {
        self.received_at.format("%H:%M:%S").to_string()
    }
}

/// Received messages in arrival order. Append-only.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<DisplayMessage>,
}

impl Transcript {
    pub fn append(&mut self, content: impl Into<String>) -> &DisplayMessage {
        self.messages.push(DisplayMessage::new(content));
        let last = self.messages.len() - 1;
        &self.messages[last]
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
