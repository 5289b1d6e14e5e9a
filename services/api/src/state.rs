//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every call session needs.

use crate::config::Config;
use interview_core::{feedback::FeedbackService, session_config::TransportTargets};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub feedback: Arc<dyn FeedbackService>,
    pub targets: TransportTargets,
    pub config: Arc<Config>,
}
