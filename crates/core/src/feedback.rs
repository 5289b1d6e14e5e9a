//! Feedback Dispatcher
//!
//! Runs once per finished session. Setup calls simply return the user to the
//! landing page; interview calls submit the transcript to the feedback
//! service and route to the generated feedback when it succeeds.

use crate::{machine::CompletedSession, session_config::SessionConfig, transcript::TranscriptEntry};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, info};

/// Where the call view should go once the session is over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    Landing,
    Feedback { id: String },
}

impl Navigation {
    pub fn path(&self) -> String {
        match self {
            Navigation::Landing => "/".to_string(),
            Navigation::Feedback { id } => format!("/interview/{id}/feedback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackRequest {
    pub interview_id: String,
    pub user_id: String,
    pub transcript: Vec<TranscriptEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackResponse {
    pub success: bool,
    #[serde(default)]
    pub feedback_id: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("feedback request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("feedback service responded with status {0}")]
    Status(reqwest::StatusCode),
}

/// The external service that turns a transcript into interview feedback.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FeedbackService: Send + Sync {
    async fn create_feedback(
        &self,
        request: FeedbackRequest,
    ) -> Result<FeedbackResponse, FeedbackError>;
}

/// A `FeedbackService` reached over HTTP with a JSON body.
pub struct HttpFeedbackService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFeedbackService {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl FeedbackService for HttpFeedbackService {
    async fn create_feedback(
        &self,
        request: FeedbackRequest,
    ) -> Result<FeedbackResponse, FeedbackError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedbackError::Status(status));
        }
        Ok(response.json::<FeedbackResponse>().await?)
    }
}

#[derive(Clone)]
pub struct FeedbackDispatcher {
    service: Arc<dyn FeedbackService>,
}

impl FeedbackDispatcher {
    pub fn new(service: Arc<dyn FeedbackService>) -> Self {
        Self { service }
    }

    /// Resolves a finished session to a navigation target.
    ///
    /// Submission failures of any kind, including a panicking service, are
    /// logged and resolve to `Navigation::Landing`; they never reach the caller.
    pub async fn dispatch(&self, session: CompletedSession) -> Navigation {
        let (interview_id, user_id) = match session.config {
            SessionConfig::Generate { .. } => {
                info!("Setup call finished. Returning to landing.");
                return Navigation::Landing;
            }
            SessionConfig::Interview {
                interview_id,
                user_id,
                ..
            } => (interview_id, user_id),
        };

        let request = FeedbackRequest {
            interview_id: interview_id.clone(),
            user_id,
            transcript: session.transcript,
        };
        info!(%interview_id, entries = request.transcript.len(), "Submitting transcript for feedback");

        let service = self.service.clone();
        let outcome = AssertUnwindSafe(async move { service.create_feedback(request).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(FeedbackResponse {
                success: true,
                feedback_id: Some(id),
            })) if !id.is_empty() => {
                info!(%interview_id, feedback_id = %id, "Feedback created");
                Navigation::Feedback { id }
            }
            Ok(Ok(response)) => {
                error!(%interview_id, success = response.success, "Error saving feedback: service returned no feedback id");
                Navigation::Landing
            }
            Ok(Err(e)) => {
                error!(%interview_id, error = %e, "Error saving feedback");
                Navigation::Landing
            }
            Err(_) => {
                error!(%interview_id, "Feedback submission panicked");
                Navigation::Landing
            }
        }
    }
}
