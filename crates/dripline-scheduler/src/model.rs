//! Sequence definitions, steps, instances, and tasks — the core data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Unknown enum tag read from storage or a plan file.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseTagError {
    pub kind: &'static str,
    pub value: String,
}

/// What starts a sequence for a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    NoResponse,
    MeetingSelected,
    Manual,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::NoResponse => "no_response",
            TriggerType::MeetingSelected => "meeting_selected",
            TriggerType::Manual => "manual",
        }
    }
}

impl FromStr for TriggerType {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_response" => Ok(TriggerType::NoResponse),
            "meeting_selected" => Ok(TriggerType::MeetingSelected),
            "manual" => Ok(TriggerType::Manual),
            other => Err(ParseTagError {
                kind: "trigger type",
                value: other.to_string(),
            }),
        }
    }
}

/// Delivery channel of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
    Linkedin,
    Voice,
}

impl Channel {
    /// Tie-break inside a wave (lower fires first).
    pub fn priority(&self) -> u8 {
        match self {
            Channel::Email => 0,
            Channel::Sms => 1,
            Channel::Linkedin => 2,
            Channel::Voice => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
            Channel::Linkedin => "linkedin",
            Channel::Voice => "voice",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            "linkedin" => Ok(Channel::Linkedin),
            "voice" => Ok(Channel::Voice),
            other => Err(ParseTagError {
                kind: "channel",
                value: other.to_string(),
            }),
        }
    }
}

/// Eligibility condition of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    #[default]
    Always,
    PhoneProvided,
    LinkedinConnected,
    NoResponse,
    EmailOpened,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Always => "always",
            Condition::PhoneProvided => "phone_provided",
            Condition::LinkedinConnected => "linkedin_connected",
            Condition::NoResponse => "no_response",
            Condition::EmailOpened => "email_opened",
        }
    }
}

impl FromStr for Condition {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Condition::Always),
            "phone_provided" => Ok(Condition::PhoneProvided),
            "linkedin_connected" => Ok(Condition::LinkedinConnected),
            "no_response" => Ok(Condition::NoResponse),
            "email_opened" => Ok(Condition::EmailOpened),
            other => Err(ParseTagError {
                kind: "condition",
                value: other.to_string(),
            }),
        }
    }
}

/// A named, ordered template of follow-up steps for one workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceDefinition {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub trigger: TriggerType,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SequenceDefinition {
    pub fn new(workspace_id: &str, name: &str, trigger: TriggerType) -> Self {
        let now = Utc::now();
        Self {
            id: new_id("seq"),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            trigger,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One committed step of a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub sequence_id: String,
    /// Dense 1-based position inside the definition.
    pub order: u32,
    /// `1` means immediate, `2` means +1 day. `0` is read as `1`.
    pub day_offset: u32,
    pub minute_offset: u32,
    pub channel: Channel,
    pub message: String,
    pub subject: Option<String>,
    pub condition: Condition,
    pub condition_value: Option<String>,
    pub requires_approval: bool,
    /// Order of a same-wave step fired in place of this one when it is ineligible.
    pub fallback_step: Option<u32>,
}

impl Step {
    /// Content identity used to match steps across redefinitions.
    pub fn key(&self) -> StepKey {
        StepKey {
            channel: self.channel,
            day_offset: self.day_offset,
            minute_offset: self.minute_offset,
        }
    }
}

/// `(channel, day_offset, minute_offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepKey {
    pub channel: Channel,
    pub day_offset: u32,
    pub minute_offset: u32,
}

/// An uncommitted step, as written by an operator or a migration plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDraft {
    pub channel: Channel,
    #[serde(default = "default_day_offset")]
    pub day_offset: u32,
    #[serde(default)]
    pub minute_offset: u32,
    pub message: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub condition_value: Option<String>,
    #[serde(default)]
    pub requires_approval: bool,
    /// Channel of the same-wave fallback step.
    #[serde(default)]
    pub fallback_channel: Option<Channel>,
}

fn default_day_offset() -> u32 { 1 }

impl StepDraft {
    pub fn new(channel: Channel, day_offset: u32, minute_offset: u32, message: &str) -> Self {
        Self {
            channel,
            day_offset,
            minute_offset,
            message: message.to_string(),
            subject: None,
            condition: Condition::Always,
            condition_value: None,
            requires_approval: false,
            fallback_channel: None,
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn with_fallback(mut self, channel: Channel) -> Self {
        self.fallback_channel = Some(channel);
        self
    }
}

/// Instance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Cancelled)
    }

    /// Active or paused: the instance still owns a schedule.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InstanceStatus::Active),
            "paused" => Ok(InstanceStatus::Paused),
            "completed" => Ok(InstanceStatus::Completed),
            "cancelled" => Ok(InstanceStatus::Cancelled),
            other => Err(ParseTagError {
                kind: "instance status",
                value: other.to_string(),
            }),
        }
    }
}

/// Live execution state of one sequence against one lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub workspace_id: String,
    pub lead_id: String,
    pub sequence_id: String,
    pub status: InstanceStatus,
    /// Last step order already handled. `0` = nothing fired yet.
    pub current_step: u32,
    pub started_at: DateTime<Utc>,
    pub last_step_at: Option<DateTime<Utc>>,
    /// `None` = nothing further is scheduled.
    pub next_step_due: Option<DateTime<Utc>>,
    pub paused_reason: Option<String>,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for manual approval.
    Pending,
    /// Ready for the dispatcher.
    Queued,
    /// Claimed by a dispatcher run.
    Sending,
    Sent,
    Failed,
    Dismissed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Sending => "sending",
            TaskStatus::Sent => "sent",
            TaskStatus::Failed => "failed",
            TaskStatus::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ParseTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "sending" => Ok(TaskStatus::Sending),
            "sent" => Ok(TaskStatus::Sent),
            "failed" => Ok(TaskStatus::Failed),
            "dismissed" => Ok(TaskStatus::Dismissed),
            other => Err(ParseTagError {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

/// A materialized unit of work derived from one instance firing one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: String,
    /// `None` once detached from its instance.
    pub instance_id: Option<String>,
    pub step_order: Option<u32>,
    pub lead_id: String,
    pub workspace_id: String,
    pub channel: Channel,
    pub status: TaskStatus,
    pub message: String,
    pub subject: Option<String>,
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// What the CRM knows about a lead right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadCapabilities {
    pub has_phone: bool,
    pub has_linkedin_connection: bool,
    pub has_replied: bool,
    pub has_opened_email: bool,
}

/// Capabilities plus the template fields (first_name, company, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadSnapshot {
    pub lead_id: String,
    pub workspace_id: String,
    pub capabilities: LeadCapabilities,
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

/// Prefixed random id, e.g. `inst-3f2a…`.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}
