use std::fmt;

/// A partition of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: u32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// A delivered record. Immutable once handed to a listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    topic: String,
    key: Option<String>,
    value: String,
    partition: u32,
    offset: u64,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        key: Option<String>,
        value: impl Into<String>,
        partition: u32,
        offset: u64,
    ) -> Self {
        Self {
            topic: topic.into(),
            key,
            value: value.into(),
            partition,
            offset,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record(topic = {}, partition = {}, offset = {}, key = {}, value = {})",
            self.topic,
            self.partition,
            self.offset,
            self.key.as_deref().unwrap_or("null"),
            self.value
        )
    }
}

/// Where the broker stored a produced record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}
