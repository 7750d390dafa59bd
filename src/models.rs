use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use time::OffsetDateTime;

/// Category string used for mode switches to smart mode.
pub const SMART_CATEGORY: &str = "smart";
/// Storage collection holding mode-switch activity.
pub const MODE_SWITCH_COLLECTION: &str = "ModeSwitch";

/// A recognised lane. Only obtainable through [`LaneSet::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Lane(String);

impl Lane {
    pub fn name(&self) -> &str {
        &self.0
    }

    /// Collection the lane's activity is stored in: the name with every
    /// non-alphanumeric character removed ("Lane A" -> "LaneA").
    pub fn collection(&self) -> String {
        self.0.chars().filter(|c| c.is_alphanumeric()).collect()
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaneSetError {
    #[error("lane set is empty")]
    Empty,
    #[error("lane name must not be blank")]
    Blank,
    #[error("lane '{0}' is reserved or collides with the mode-switch collection")]
    Reserved(String),
}

/// The finite set of lanes an operator may select manually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneSet {
    lanes: Vec<Lane>,
}

impl LaneSet {
    pub fn new<I, S>(names: I) -> Result<Self, LaneSetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut lanes: Vec<Lane> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                return Err(LaneSetError::Blank);
            }
            let lane = Lane(name.to_string());
            let collection = lane.collection();
            if name == SMART_CATEGORY
                || collection.is_empty()
                || collection == MODE_SWITCH_COLLECTION
            {
                return Err(LaneSetError::Reserved(name.to_string()));
            }
            if !lanes.contains(&lane) {
                lanes.push(lane);
            }
        }

        if lanes.is_empty() {
            return Err(LaneSetError::Empty);
        }
        Ok(Self { lanes })
    }

    /// Parses a comma separated list such as `"Lane A,Lane B"`.
    pub fn parse(list: &str) -> Result<Self, LaneSetError> {
        Self::new(list.split(',').filter(|part| !part.trim().is_empty()))
    }

    pub fn resolve(&self, name: &str) -> Option<Lane> {
        self.lanes.iter().find(|lane| lane.0 == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Lane> {
        self.lanes.iter()
    }
}

impl Default for LaneSet {
    fn default() -> Self {
        Self {
            lanes: vec![Lane("Lane A".to_string()), Lane("Lane B".to_string())],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Manual,
    Smart,
    /// Absent, non-string or unknown `command` value, kept for logging.
    Unrecognized(Option<String>),
}

/// Decoded inbound control payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub command: ControlCommand,
    /// `None` when absent or not a string.
    pub lane: Option<String>,
}

impl ControlMessage {
    /// Builds a message from a decoded JSON object. Extraneous fields are ignored.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        let command = match object.get("command") {
            Some(Value::String(s)) if s == "manual" => ControlCommand::Manual,
            Some(Value::String(s)) if s == "smart" => ControlCommand::Smart,
            Some(Value::String(s)) => ControlCommand::Unrecognized(Some(s.clone())),
            Some(other) => ControlCommand::Unrecognized(Some(other.to_string())),
            None => ControlCommand::Unrecognized(None),
        };
        let lane = object
            .get("lane")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self { command, lane }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Manual,
    Smart,
}

/// Outbound command for the actuator, published on the command topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum CommandMessage {
    Manual { lane: Lane },
    Smart,
}

impl CommandMessage {
    pub fn mode(&self) -> Mode {
        match self {
            CommandMessage::Manual { .. } => Mode::Manual,
            CommandMessage::Smart => Mode::Smart,
        }
    }

    pub fn lane(&self) -> Option<&Lane> {
        match self {
            CommandMessage::Manual { lane } => Some(lane),
            CommandMessage::Smart => None,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// What an accepted control message is audited under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Lane(Lane),
    ModeSwitch,
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Lane(lane) => lane.name(),
            Category::ModeSwitch => SMART_CATEGORY,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityRecord {
    pub category: String,
    pub timestamp: OffsetDateTime,
}

impl ActivityRecord {
    /// Stamps the record with the current wall-clock time.
    pub fn now(category: &Category) -> Self {
        Self {
            category: category.as_str().to_string(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredActivity {
    pub id: i64,
    pub category: String,
    pub timestamp: String,
}
