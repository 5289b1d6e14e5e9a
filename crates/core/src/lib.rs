pub mod feedback;
pub mod machine;
pub mod runtime;
pub mod session_config;
pub mod transcript;
pub mod transport;

use machine::CompletedSession;
use transport::CallRequest;

/// Represents commands that the session machine issues to its runtime.
///
/// This enum decouples the machine's decisions from the runtime's execution
/// of side effects (talking to the call engine, submitting feedback, or
/// notifying the user).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ask the call engine to start the given target.
    StartCall(CallRequest),
    /// Ask the call engine to hang up. Issued at most once per session.
    StopCall,
    /// A start was requested while a call is already in progress.
    StartRejected,
    /// The call engine reported a non-fatal error.
    ReportError(String),
    /// The session finished; hand its transcript to the feedback dispatcher.
    Dispatch(CompletedSession),
}
