//! Session configuration
//!
//! A `SessionConfig` is built once when a call view mounts, from the caller's
//! identity and (for interviews) the prepared question list. It decides which
//! transport target is started and whether a transcript is submitted for
//! feedback when the call ends.

use crate::transport::CallRequest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The current user as reported by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub id: String,
}

/// Deployment identifiers for the call engine.
///
/// Passed explicitly into call construction so the state machine never reads
/// process configuration on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportTargets {
    /// Workflow run for setup ("generate") sessions.
    pub workflow_id: String,
    /// Interviewer profile run for scripted interviews.
    pub interviewer_id: String,
    /// Public base URL of the deployment, forwarded to the workflow.
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SessionConfig {
    /// A setup call that gathers interview preferences. Nothing is submitted afterwards.
    Generate {
        user_name: String,
        user_id: Option<String>,
    },
    /// A scripted interview whose transcript is sent for feedback.
    Interview {
        interview_id: String,
        user_id: String,
        /// Interviewer profile the call engine runs.
        interviewer: String,
        questions: Vec<String>,
    },
}

impl SessionConfig {
    /// Builds a setup session. An absent identity yields an anonymous session.
    pub fn generate(identity: Option<&Identity>) -> Self {
        Self::Generate {
            user_name: identity.map(|i| i.name.clone()).unwrap_or_default(),
            user_id: identity.map(|i| i.id.clone()),
        }
    }

    pub fn interview(
        interview_id: impl Into<String>,
        user_id: impl Into<String>,
        interviewer: impl Into<String>,
        questions: Vec<String>,
    ) -> Self {
        Self::Interview {
            interview_id: interview_id.into(),
            user_id: user_id.into(),
            interviewer: interviewer.into(),
            questions,
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "generate",
            Self::Interview { .. } => "interview",
        }
    }

    /// Resolves the transport target and variable bindings for this session.
    pub fn call_request(&self, targets: &TransportTargets) -> CallRequest {
        match self {
            Self::Generate { user_name, user_id } => {
                let mut variable_values = BTreeMap::new();
                variable_values.insert("username".to_string(), user_name.clone());
                if let Some(id) = user_id {
                    variable_values.insert("userid".to_string(), id.clone());
                }
                variable_values.insert("baseUrl".to_string(), targets.base_url.clone());
                CallRequest {
                    target: targets.workflow_id.clone(),
                    variable_values,
                }
            }
            Self::Interview {
                interviewer,
                questions,
                ..
            } => {
                let mut variable_values = BTreeMap::new();
                variable_values.insert("questions".to_string(), format_questions(questions));
                CallRequest {
                    target: interviewer.clone(),
                    variable_values,
                }
            }
        }
    }
}

/// Renders the question list as the interviewer prompt: one `-`-prefixed line
/// per question, in order. An empty list renders as an empty prompt.
pub fn format_questions(questions: &[String]) -> String {
    questions
        .iter()
        .map(|question| format!("-{question}"))
        .collect::<Vec<_>>()
        .join("\n")
}
