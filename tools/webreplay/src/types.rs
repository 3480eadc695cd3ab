use crate::errors::ReplayError;
use serde::{Deserialize, Serialize};

/// Identifier the core assigns to a page-side channel (one per frame).
pub type PortId = String;

/// Browser tab identifier as reported by the host.
pub type TabId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplayState {
    #[default]
    Stopped,
    Replaying,
    Ack,
}

impl ReplayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Replaying => "replaying",
            Self::Ack => "ack",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Stopped,
    Recording,
    Replaying,
}

impl RecordState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Recording => "recording",
            Self::Replaying => "replaying",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckType {
    Success,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingStrategy {
    Mimic,
    Speed,
    Slower,
    Slowest,
    Fixed1,
    Random0To3,
    Perturb0To3,
    Perturb,
}

impl TimingStrategy {
    pub fn parse(value: &str) -> Result<Self, ReplayError> {
        match value {
            "mimic" => Ok(Self::Mimic),
            "speed" => Ok(Self::Speed),
            "slower" => Ok(Self::Slower),
            "slowest" => Ok(Self::Slowest),
            "fixed_1" => Ok(Self::Fixed1),
            "random_0_3" => Ok(Self::Random0To3),
            "perturb_0_3" => Ok(Self::Perturb0To3),
            "perturb" => Ok(Self::Perturb),
            other => Err(ReplayError::UnknownTimingStrategy(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mimic => "mimic",
            Self::Speed => "speed",
            Self::Slower => "slower",
            Self::Slowest => "slowest",
            Self::Fixed1 => "fixed_1",
            Self::Random0To3 => "random_0_3",
            Self::Perturb0To3 => "perturb_0_3",
            Self::Perturb => "perturb",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokenChannelStrategy {
    Retry,
}

impl BrokenChannelStrategy {
    pub fn parse(value: &str) -> Result<Self, ReplayError> {
        match value {
            "retry" => Ok(Self::Retry),
            other => Err(ReplayError::UnknownBrokenChannelStrategy(other.to_string())),
        }
    }
}

/// What to do when the page reports it executed only part of a dispatched group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialAckStrategy {
    Abort,
    ResendRemainder,
}

impl PartialAckStrategy {
    pub fn parse(value: &str) -> Result<Self, ReplayError> {
        match value {
            "abort" => Ok(Self::Abort),
            "resend_remainder" => Ok(Self::ResendRemainder),
            other => Err(ReplayError::UnknownPartialAckStrategy(other.to_string())),
        }
    }
}
