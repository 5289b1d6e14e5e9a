//! Session Runtime
//!
//! Drives a [`SessionMachine`] on a single tokio task. User intents and
//! transport events are processed one at a time, so a transcript append and
//! a status change triggered by the same event are never interleaved with
//! another event. Transport calls and the feedback submission run as futures
//! polled by that same task: a stop can be handled while a start is still
//! connecting, and dropping the [`SessionHandle`] cancels everything that is
//! still in flight, including the event subscription.
//!
//! Handling an input never waits on the view: updates go out on an unbounded
//! channel, so intents keep draining however slowly the view reads.

use crate::{
    Command,
    feedback::{FeedbackDispatcher, Navigation},
    machine::{CallStatus, Input, Intent, SessionMachine, SpeakerActivity},
    session_config::{SessionConfig, TransportTargets},
    transcript::TranscriptEntry,
    transport::{CallTransport, TransportError, TransportEvent},
};
use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{Instrument, debug, info, warn};

const INTENT_CHANNEL_CAPACITY: usize = 8;

/// Changes the presentation layer should render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Status(CallStatus),
    /// A newly finalized utterance; the view shows the latest one.
    Transcript(TranscriptEntry),
    Speaking(SpeakerActivity),
    /// A user-facing notice that does not change the session.
    Notice(String),
    Navigate(Navigation),
}

#[derive(Debug, thiserror::Error)]
#[error("session runtime has shut down")]
pub struct SessionClosed;

/// Owning handle to a running session. Dropping it tears the session down.
pub struct SessionHandle {
    intents: mpsc::Sender<Intent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn request_start(&self) -> Result<(), SessionClosed> {
        self.intents
            .send(Intent::Start)
            .await
            .map_err(|_| SessionClosed)
    }

    pub async fn request_stop(&self) -> Result<(), SessionClosed> {
        self.intents
            .send(Intent::Stop)
            .await
            .map_err(|_| SessionClosed)
    }

}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum CallOp {
    Start,
    Stop,
}

struct CallOutcome {
    op: CallOp,
    result: Result<(), TransportError>,
}

pub struct SessionRuntime {
    machine: SessionMachine,
    transport: Arc<dyn CallTransport>,
    dispatcher: FeedbackDispatcher,
    intents: mpsc::Receiver<Intent>,
    /// Subscription for the current call. Replaced on every start so events
    /// from an earlier call never reach a restarted session.
    events: mpsc::Receiver<TransportEvent>,
    events_open: bool,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    calls: FuturesUnordered<BoxFuture<'static, CallOutcome>>,
    dispatches: FuturesUnordered<BoxFuture<'static, Navigation>>,
}

impl SessionRuntime {
    /// Subscribes to the transport and spawns the session task.
    ///
    /// Returns the handle used to relay intents and the stream of view updates.
    pub fn spawn(
        config: SessionConfig,
        targets: TransportTargets,
        transport: Arc<dyn CallTransport>,
        dispatcher: FeedbackDispatcher,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (intent_tx, intent_rx) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let span = tracing::info_span!("call_session", mode = config.mode());

        let runtime = SessionRuntime {
            machine: SessionMachine::new(config, targets),
            events: transport.subscribe(),
            events_open: true,
            transport,
            dispatcher,
            intents: intent_rx,
            updates: update_tx,
            calls: FuturesUnordered::new(),
            dispatches: FuturesUnordered::new(),
        };
        let task = tokio::spawn(runtime.run().instrument(span));

        (
            SessionHandle {
                intents: intent_tx,
                task,
            },
            update_rx,
        )
    }

    async fn run(mut self) {
        info!("Session runtime started");
        loop {
            tokio::select! {
                intent = self.intents.recv() => match intent {
                    Some(intent) => self.apply(Input::Intent(intent)),
                    None => {
                        debug!("Session handle dropped");
                        break;
                    }
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.apply(Input::Transport(event)),
                    None => {
                        debug!("Transport event stream closed");
                        self.events_open = false;
                    }
                },
                Some(outcome) = self.calls.next(), if !self.calls.is_empty() => {
                    self.on_call_outcome(outcome);
                },
                Some(navigation) = self.dispatches.next(), if !self.dispatches.is_empty() => {
                    info!(path = %navigation.path(), "Session dispatched");
                    self.emit(SessionUpdate::Navigate(navigation));
                },
            }

            if self.updates.is_closed() {
                debug!("View detached; ending session");
                break;
            }
        }
        info!("Session runtime stopped");
    }

    fn apply(&mut self, input: Input) {
        let status = self.machine.status();
        let entries = self.machine.transcript().len();
        let speakers = self.machine.speakers();

        let commands = self.machine.handle(input);

        // A start swaps the subscription before the view hears about the new call.
        for command in commands {
            self.execute(command);
        }

        if self.machine.status() != status {
            self.emit(SessionUpdate::Status(self.machine.status()));
        }
        if self.machine.transcript().len() > entries {
            if let Some(entry) = self.machine.transcript().latest().cloned() {
                self.emit(SessionUpdate::Transcript(entry));
            }
        }
        if self.machine.speakers() != speakers {
            self.emit(SessionUpdate::Speaking(self.machine.speakers()));
        }
    }

    fn execute(&mut self, command: Command) {
        match command {
            Command::StartCall(request) => {
                self.events = self.transport.subscribe();
                self.events_open = true;
                let transport = self.transport.clone();
                self.calls.push(Box::pin(async move {
                    CallOutcome {
                        op: CallOp::Start,
                        result: transport.start(&request).await,
                    }
                }));
            }
            Command::StopCall => {
                let transport = self.transport.clone();
                self.calls.push(Box::pin(async move {
                    CallOutcome {
                        op: CallOp::Stop,
                        result: transport.stop().await,
                    }
                }));
            }
            Command::StartRejected => {
                self.emit(SessionUpdate::Notice(
                    "A call is already in progress.".to_string(),
                ));
            }
            Command::ReportError(message) => {
                warn!(error = %message, "Call transport reported an error");
                self.emit(SessionUpdate::Notice(format!("Call error: {message}")));
            }
            Command::Dispatch(completed) => {
                let dispatcher = self.dispatcher.clone();
                self.dispatches
                    .push(Box::pin(async move { dispatcher.dispatch(completed).await }));
            }
        }
    }

    fn on_call_outcome(&mut self, outcome: CallOutcome) {
        let op = match outcome.op {
            CallOp::Start => "start",
            CallOp::Stop => "stop",
        };
        match outcome.result {
            Ok(()) => debug!(op, "Transport call completed"),
            Err(e) => {
                warn!(op, error = %e, "Transport call failed");
                self.emit(SessionUpdate::Notice(format!("Could not {op} the call: {e}")));
            }
        }
    }

    fn emit(&self, update: SessionUpdate) {
        if self.updates.send(update).is_err() {
            debug!("Dropping update for a detached view");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        feedback::{FeedbackError, FeedbackRequest, FeedbackResponse, FeedbackService},
        transcript::Role,
        transport::CallRequest,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTransport {
        sender: Mutex<Option<mpsc::Sender<TransportEvent>>>,
        starts: Mutex<Vec<CallRequest>>,
        stops: AtomicUsize,
        refuse_starts: AtomicBool,
    }

    impl FakeTransport {
        /// The sender behind the most recent subscription.
        fn sender(&self) -> mpsc::Sender<TransportEvent> {
            self.sender.lock().unwrap().clone().expect("not subscribed")
        }

        async fn emit(&self, event: TransportEvent) {
            self.sender().send(event).await.expect("subscriber gone");
        }

        fn subscriber_closed(&self) -> bool {
            self.sender
                .lock()
                .unwrap()
                .as_ref()
                .is_none_or(|s| s.is_closed())
        }
    }

    #[async_trait]
    impl CallTransport for FakeTransport {
        async fn start(&self, request: &CallRequest) -> Result<(), TransportError> {
            self.starts.lock().unwrap().push(request.clone());
            if self.refuse_starts.load(Ordering::SeqCst) {
                return Err(TransportError::Connect("engine unreachable".to_string()));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), TransportError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&self) -> mpsc::Receiver<TransportEvent> {
            let (tx, rx) = mpsc::channel(16);
            *self.sender.lock().unwrap() = Some(tx);
            rx
        }
    }

    /// Records submissions and answers with a fixed response, optionally after a delay.
    struct RecordingFeedback {
        calls: AtomicUsize,
        delay: Duration,
        response: FeedbackResponse,
    }

    impl RecordingFeedback {
        fn new(response: FeedbackResponse) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                response,
            }
        }
    }

    #[async_trait]
    impl FeedbackService for RecordingFeedback {
        async fn create_feedback(
            &self,
            _request: FeedbackRequest,
        ) -> Result<FeedbackResponse, FeedbackError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.response.clone())
        }
    }

    fn targets() -> TransportTargets {
        TransportTargets {
            workflow_id: "wf-setup".to_string(),
            interviewer_id: "interviewer".to_string(),
            base_url: String::new(),
        }
    }

    fn spawn(
        config: SessionConfig,
        transport: &Arc<FakeTransport>,
        feedback: &Arc<RecordingFeedback>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionUpdate>) {
        SessionRuntime::spawn(
            config,
            targets(),
            transport.clone(),
            FeedbackDispatcher::new(feedback.clone()),
        )
    }

    async fn wait_for(
        updates: &mut mpsc::UnboundedReceiver<SessionUpdate>,
        predicate: impl Fn(&SessionUpdate) -> bool,
    ) -> Vec<SessionUpdate> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(update) = updates.recv().await {
                let done = predicate(&update);
                seen.push(update);
                if done {
                    return;
                }
            }
            panic!("update stream closed early: {:?}", seen);
        })
        .await
        .expect("timed out waiting for session update");
        seen
    }

    async fn eventually(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition never held");
    }

    fn is_status(status: CallStatus) -> impl Fn(&SessionUpdate) -> bool {
        move |u| *u == SessionUpdate::Status(status)
    }

    fn is_navigation(u: &SessionUpdate) -> bool {
        matches!(u, SessionUpdate::Navigate(_))
    }

    #[tokio::test]
    async fn test_generate_session_navigates_home() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse::default()));
        let (handle, mut updates) = spawn(SessionConfig::generate(None), &transport, &feedback);

        handle.request_start().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Connecting)).await;

        transport.emit(TransportEvent::CallStart).await;
        transport
            .emit(TransportEvent::final_transcript(Role::User, "Frontend role please."))
            .await;
        transport
            .emit(TransportEvent::final_transcript(Role::Assistant, "Noted."))
            .await;
        transport.emit(TransportEvent::CallEnd).await;

        let seen = wait_for(&mut updates, is_navigation).await;

        let transcripts = seen
            .iter()
            .filter(|u| matches!(u, SessionUpdate::Transcript(_)))
            .count();
        assert_eq!(transcripts, 2);
        assert!(seen.contains(&SessionUpdate::Status(CallStatus::Active)));
        assert!(seen.contains(&SessionUpdate::Status(CallStatus::Finished)));
        assert_eq!(seen.last(), Some(&SessionUpdate::Navigate(Navigation::Landing)));
        assert_eq!(feedback.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.stops.load(Ordering::SeqCst), 0);
        assert_eq!(transport.starts.lock().unwrap()[0].target, "wf-setup");
    }

    #[tokio::test]
    async fn test_interview_session_routes_to_feedback() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse {
            success: true,
            feedback_id: Some("abc123".to_string()),
        }));
        let config = SessionConfig::interview(
            "iv-1",
            "user-1",
            "interviewer",
            vec!["What is a closure?".to_string()],
        );
        let (handle, mut updates) = spawn(config, &transport, &feedback);

        handle.request_start().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Connecting)).await;
        transport.emit(TransportEvent::CallStart).await;
        transport
            .emit(TransportEvent::final_transcript(Role::User, "It captures scope."))
            .await;
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::Transcript(_))).await;
        handle.request_stop().await.unwrap();

        let seen = wait_for(&mut updates, is_navigation).await;
        assert_eq!(
            seen.last(),
            Some(&SessionUpdate::Navigate(Navigation::Feedback {
                id: "abc123".to_string()
            }))
        );
        assert_eq!(feedback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.starts.lock().unwrap()[0].variable_values["questions"],
            "-What is a closure?"
        );
    }

    #[tokio::test]
    async fn test_repeated_stop_and_end_dispatch_once() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse::default()));
        let config = SessionConfig::interview("iv-2", "user-1", "interviewer", vec![]);
        let (handle, mut updates) = spawn(config, &transport, &feedback);

        handle.request_start().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Connecting)).await;

        handle.request_stop().await.unwrap();
        handle.request_stop().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Finished)).await;
        transport.emit(TransportEvent::CallEnd).await;
        transport.emit(TransportEvent::CallEnd).await;

        let seen = wait_for(&mut updates, is_navigation).await;
        assert_eq!(seen.last(), Some(&SessionUpdate::Navigate(Navigation::Landing)));

        let extra = tokio::time::timeout(Duration::from_millis(100), updates.recv()).await;
        assert!(extra.is_err(), "unexpected update after dispatch: {:?}", extra);
        assert_eq!(transport.stops.load(Ordering::SeqCst), 1);
        assert_eq!(feedback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_while_connecting_emits_notice() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse::default()));
        let (handle, mut updates) = spawn(SessionConfig::generate(None), &transport, &feedback);

        handle.request_start().await.unwrap();
        handle.request_start().await.unwrap();

        let seen = wait_for(&mut updates, |u| matches!(u, SessionUpdate::Notice(_))).await;
        assert_eq!(seen.first(), Some(&SessionUpdate::Status(CallStatus::Connecting)));
        tokio::task::yield_now().await;
        assert_eq!(transport.starts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_keeps_session_active() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse::default()));
        let (handle, mut updates) = spawn(SessionConfig::generate(None), &transport, &feedback);

        handle.request_start().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Connecting)).await;
        transport.emit(TransportEvent::CallStart).await;
        wait_for(&mut updates, is_status(CallStatus::Active)).await;

        transport
            .emit(TransportEvent::Error {
                message: "network hiccup".to_string(),
            })
            .await;
        let seen = wait_for(&mut updates, |u| matches!(u, SessionUpdate::Notice(_))).await;
        assert_eq!(
            seen,
            vec![SessionUpdate::Notice("Call error: network hiccup".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dropping_handle_releases_subscription() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse::default()));
        let (handle, _updates) = spawn(SessionConfig::generate(None), &transport, &feedback);
        assert!(!transport.subscriber_closed());

        drop(handle);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !transport.subscriber_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("subscription was not released");
    }

    #[tokio::test]
    async fn test_teardown_cancels_inflight_dispatch() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback {
            calls: AtomicUsize::new(0),
            delay: Duration::from_secs(30),
            response: FeedbackResponse {
                success: true,
                feedback_id: Some("late".to_string()),
            },
        });
        let config = SessionConfig::interview("iv-3", "user-1", "interviewer", vec![]);
        let (handle, mut updates) = spawn(config, &transport, &feedback);

        handle.request_start().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Connecting)).await;
        transport.emit(TransportEvent::CallEnd).await;
        wait_for(&mut updates, is_status(CallStatus::Finished)).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while feedback.calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dispatch never started");

        drop(handle);

        let remaining = tokio::time::timeout(Duration::from_secs(2), async {
            let mut remaining = Vec::new();
            while let Some(update) = updates.recv().await {
                remaining.push(update);
            }
            remaining
        })
        .await
        .expect("update stream was not closed on teardown");
        assert!(!remaining.iter().any(is_navigation));
    }

    #[tokio::test]
    async fn test_failed_start_reports_notice_and_keeps_connecting() {
        let transport = Arc::new(FakeTransport::default());
        transport.refuse_starts.store(true, Ordering::SeqCst);
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse::default()));
        let (handle, mut updates) = spawn(SessionConfig::generate(None), &transport, &feedback);

        handle.request_start().await.unwrap();
        let seen = wait_for(&mut updates, |u| matches!(u, SessionUpdate::Notice(_))).await;
        assert_eq!(
            seen,
            vec![
                SessionUpdate::Status(CallStatus::Connecting),
                SessionUpdate::Notice(
                    "Could not start the call: failed to connect to call engine: engine unreachable"
                        .to_string()
                ),
            ]
        );

        let extra = tokio::time::timeout(Duration::from_millis(100), updates.recv()).await;
        assert!(extra.is_err(), "status changed after a failed start: {:?}", extra);

        // The user can still end the attempt.
        handle.request_stop().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Finished)).await;
        eventually(|| transport.stops.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_intents_drain_while_view_reads_nothing() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse::default()));
        let (handle, mut updates) = spawn(SessionConfig::generate(None), &transport, &feedback);

        tokio::time::timeout(Duration::from_secs(5), async {
            for _ in 0..2000 {
                handle.request_start().await.unwrap();
            }
            handle.request_stop().await.unwrap();
        })
        .await
        .expect("intents stopped draining while updates were unread");

        let seen = wait_for(&mut updates, is_navigation).await;
        let notices = seen
            .iter()
            .filter(|u| matches!(u, SessionUpdate::Notice(_)))
            .count();
        assert_eq!(notices, 1999);
        assert!(seen.contains(&SessionUpdate::Status(CallStatus::Finished)));
        assert_eq!(transport.starts.lock().unwrap().len(), 1);
        eventually(|| transport.stops.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_restart_ignores_events_from_previous_call() {
        let transport = Arc::new(FakeTransport::default());
        let feedback = Arc::new(RecordingFeedback::new(FeedbackResponse {
            success: true,
            feedback_id: Some("first".to_string()),
        }));
        let config = SessionConfig::interview("iv-4", "user-1", "interviewer", vec![]);
        let (handle, mut updates) = spawn(config, &transport, &feedback);

        handle.request_start().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Connecting)).await;
        let first_call = transport.sender();
        transport.emit(TransportEvent::CallStart).await;
        transport
            .emit(TransportEvent::final_transcript(Role::User, "First answer."))
            .await;
        wait_for(&mut updates, |u| matches!(u, SessionUpdate::Transcript(_))).await;
        handle.request_stop().await.unwrap();
        wait_for(&mut updates, is_navigation).await;

        handle.request_start().await.unwrap();
        wait_for(&mut updates, is_status(CallStatus::Connecting)).await;
        assert!(first_call.is_closed());
        // A late call-end from the first call goes nowhere.
        assert!(first_call.send(TransportEvent::CallEnd).await.is_err());

        transport.emit(TransportEvent::CallStart).await;
        let seen = wait_for(&mut updates, is_status(CallStatus::Active)).await;
        assert_eq!(seen, vec![SessionUpdate::Status(CallStatus::Active)]);

        let extra = tokio::time::timeout(Duration::from_millis(100), updates.recv()).await;
        assert!(extra.is_err(), "unexpected update after restart: {:?}", extra);
        assert_eq!(feedback.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stops.load(Ordering::SeqCst), 1);
        assert_eq!(transport.starts.lock().unwrap().len(), 2);
    }
}
