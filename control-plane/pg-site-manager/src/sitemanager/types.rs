use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating mode of a database site.
///
/// Unknown values survive deserialization as [`Mode::Unsupported`] so the
/// controller can reject them with a descriptive error instead of a parse
/// failure.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    Active,
    Standby,
    Disabled,
    Unsupported(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Mode::Active => "active",
            Mode::Standby => "standby",
            Mode::Disabled => "disabled",
            Mode::Unsupported(raw) => raw,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Mode::Unsupported(_))
    }
}

impl From<String> for Mode {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "active" => Mode::Active,
            "standby" => Mode::Standby,
            "disabled" => Mode::Disabled,
            _ => Mode::Unsupported(raw),
        }
    }
}

impl From<&str> for Mode {
    fn from(raw: &str) -> Self {
        Mode::from(raw.to_string())
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Unsupported(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionStatus {
    Running,
    Done,
    Failed,
}

impl fmt::Display for TransitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransitionStatus::Running => "running",
            TransitionStatus::Done => "done",
            TransitionStatus::Failed => "failed",
        })
    }
}

/// Persisted record of the last requested transition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteManagerStatus {
    #[serde(
        default,
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub mode: Option<Mode>,
    #[serde(
        default,
        deserialize_with = "blank_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub status: Option<TransitionStatus>,
    #[serde(rename = "no-wait", alias = "noWait", default)]
    pub no_wait: bool,
}

// Records written by older operators carry "" for unset fields.
fn blank_as_none<'de, D, T>(de: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::de::DeserializeOwned,
{
    match Option::<serde_json::Value>::deserialize(de)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) if s.is_empty() => Ok(None),
        Some(v) => serde_json::from_value(v)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

impl SiteManagerStatus {
    pub fn new(mode: Mode, status: TransitionStatus) -> Self {
        SiteManagerStatus {
            mode: Some(mode),
            status: Some(status),
            no_wait: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == Some(TransitionStatus::Running)
    }

    pub fn is_done_in(&self, mode: &Mode) -> bool {
        self.mode.as_ref() == Some(mode)
            && self.status == Some(TransitionStatus::Done)
    }
}

/// Body of `POST /sitemanager` and `POST /pre-configure`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeChangeRequest {
    pub mode: Mode,
    #[serde(rename = "no-wait", alias = "noWait", default)]
    pub no_wait: bool,
}

impl ModeChangeRequest {
    pub fn new(mode: Mode) -> Self {
        ModeChangeRequest {
            mode,
            no_wait: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
}
