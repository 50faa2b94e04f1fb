//! Turn identity and cancellation.
//!
//! A [`SessionController`] belongs to one [`Requester`]. It owns the
//! conversation's session id and a generation counter: starting a turn or
//! cancelling one bumps the counter and cancels the previous turn's
//! [`CancellationToken`]. Stream readers tag everything they forward with the
//! generation they were started for, and the controller drops anything whose
//! tag is not current. A stream that is still delivering frames after a stop
//! or a restart can therefore never touch the timeline.
//!
//! Reading happens in a spawned task ([`spawn_turn_stream`]) that only
//! forwards [`TaggedFrame`]s over a channel. The timeline and the state
//! machines stay on the caller's task; [`run_turn`] wires the two together.
//!
//! # Example
//!
//! ```
//! use toolgate::session::{Requester, SessionController};
//!
//! let mut controller = SessionController::new(Requester::chat(), false);
//! let first = controller.begin_turn("hello");
//! let second = controller.begin_turn("again");
//! assert!(first.token.is_cancelled());
//! assert!(second.generation > first.generation);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::{ChatRequest, ChatTransport, FrameRead, FrameStream};
use crate::error::ConsoleError;
use crate::turn::{TimelineMutation, TurnMachine, TurnOutcome};
use crate::types::{Timeline, TurnEvent};

/// Capacity of the reader-to-controller channel.
const FRAME_CHANNEL_CAPACITY: usize = 64;

/// An independent caller context with its own generation counter and
/// pending-approval slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requester {
    label: String,
}

impl Requester {
    /// The chat surface.
    #[must_use]
    pub fn chat() -> Self {
        Self {
            label: "chat".to_string(),
        }
    }

    /// A standalone action form.
    #[must_use]
    pub fn form(name: &str) -> Self {
        let label = if name.is_empty() {
            "form".to_string()
        } else {
            format!("form:{name}")
        };
        Self { label }
    }

    /// Label sent as the approval actor.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Display for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// What a stream reader forwards.
#[derive(Debug)]
pub enum StreamMessage {
    /// A typed event.
    Event(TurnEvent),
    /// The connection closed.
    Closed,
    /// The connection failed.
    Failed(ConsoleError),
}

/// A reader message tagged with its turn generation.
#[derive(Debug)]
pub struct TaggedFrame {
    /// Generation of the turn the reader was started for.
    pub generation: u64,
    /// The forwarded message.
    pub message: StreamMessage,
}

/// Everything needed to run one turn.
#[derive(Debug, Clone)]
pub struct TurnTicket {
    /// Generation of this turn.
    pub generation: u64,
    /// Cancelled when the turn is stopped or superseded.
    pub token: CancellationToken,
    /// Body for the chat stream request.
    pub request: ChatRequest,
}

/// Owns turn identity for one requester.
#[derive(Debug)]
pub struct SessionController {
    requester: Requester,
    session_id: String,
    auto_approve: bool,
    generation: u64,
    active: Option<CancellationToken>,
}

impl SessionController {
    /// Creates a controller with no session bound yet.
    #[must_use]
    pub fn new(requester: Requester, auto_approve: bool) -> Self {
        Self {
            requester,
            session_id: String::new(),
            auto_approve,
            generation: 0,
            active: None,
        }
    }

    /// Returns the requester.
    #[must_use]
    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    /// Returns the bound session id (empty before the first turn).
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Returns the current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` while a turn is running.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Starts a new turn, superseding any running one.
    pub fn begin_turn(&mut self, message: &str) -> TurnTicket {
        if let Some(previous) = self.active.take() {
            debug!(requester = %self.requester, generation = self.generation, "superseding running turn");
            previous.cancel();
        }

        self.generation += 1;
        let token = CancellationToken::new();
        self.active = Some(token.clone());
        debug!(requester = %self.requester, generation = self.generation, "turn started");

        TurnTicket {
            generation: self.generation,
            token,
            request: ChatRequest {
                session_id: self.session_id.clone(),
                message: message.to_string(),
                auto_approve: self.auto_approve,
            },
        }
    }

    /// Stops the running turn.
    ///
    /// Returns `false` if there was nothing to stop. Calling it again is a
    /// no-op.
    pub fn cancel(&mut self) -> bool {
        let Some(token) = self.active.take() else {
            return false;
        };
        token.cancel();
        self.generation += 1;
        info!(requester = %self.requester, generation = self.generation, "turn cancelled");
        true
    }

    /// Marks the turn of `generation` finished and stops its reader.
    ///
    /// Ignored for a stale generation.
    pub fn finish_turn(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if let Some(token) = self.active.take() {
            token.cancel();
        }
    }

    /// Binds the session id the server reported. Empty ids are ignored.
    pub fn bind_session(&mut self, session_id: &str) {
        if !session_id.is_empty() && session_id != self.session_id {
            debug!(requester = %self.requester, session = session_id, "session bound");
            self.session_id = session_id.to_string();
        }
    }

    /// Accepts a reader message if it belongs to the current generation.
    pub fn accept(&self, frame: TaggedFrame) -> Option<StreamMessage> {
        if frame.generation != self.generation {
            debug!(
                requester = %self.requester,
                stale = frame.generation,
                current = self.generation,
                "dropping frame from superseded turn"
            );
            return None;
        }
        Some(frame.message)
    }

    /// Forgets the session so the next turn starts a new conversation.
    pub fn reset_session(&mut self) {
        self.cancel();
        self.session_id.clear();
    }
}

/// Shared slot holding the token of the turn that is currently running.
///
/// A single long-lived signal listener holds one clone; the turn loop arms
/// it for the duration of each turn.
#[derive(Debug, Clone, Default)]
pub struct TurnInterrupt {
    armed: Arc<Mutex<Option<CancellationToken>>>,
}

impl TurnInterrupt {
    /// Makes `token` the one cancelled by the next [`TurnInterrupt::interrupt`].
    pub fn arm(&self, token: CancellationToken) {
        *self.slot() = Some(token);
    }

    /// Clears the armed token, if any.
    pub fn disarm(&self) {
        self.slot().take();
    }

    /// Cancels and clears the armed token.
    ///
    /// Returns `false` when no turn was armed.
    pub fn interrupt(&self) -> bool {
        match self.slot().take() {
            Some(token) => {
                debug!("turn interrupted");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawns a task that reads `stream` and forwards generation-tagged messages.
///
/// The task stops after the stream closes or fails, when its token is
/// cancelled, or when the receiver is gone. A cancelled stream forwards
/// nothing more.
pub fn spawn_turn_stream(
    mut stream: FrameStream,
    generation: u64,
    tx: mpsc::Sender<TaggedFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = match stream.next_frame().await {
                FrameRead::Frame(frame) => match TurnEvent::from_frame(&frame) {
                    Some(event) => StreamMessage::Event(event),
                    None => {
                        debug!(event = %frame.event, "dropping unrecognized frame");
                        continue;
                    }
                },
                FrameRead::Closed => StreamMessage::Closed,
                FrameRead::Cancelled => break,
                FrameRead::Failed(err) => StreamMessage::Failed(err),
            };
            let last = !matches!(message, StreamMessage::Event(_));
            if tx.send(TaggedFrame { generation, message }).await.is_err() || last {
                break;
            }
        }
        debug!(generation, discarded = stream.discarded(), "stream reader finished");
    })
}

/// Runs one chat turn to completion.
///
/// Opens the stream, feeds its events through a [`TurnMachine`] into
/// `timeline`, and reports every mutation to `on_mutation`. Cancelling `stop`
/// cancels the turn. Transport failures end the turn as
/// [`TurnOutcome::Failed`].
pub async fn run_turn<C, F>(
    controller: &mut SessionController,
    transport: &C,
    timeline: &mut Timeline,
    message: &str,
    stop: &CancellationToken,
    mut on_mutation: F,
) -> TurnOutcome
where
    C: ChatTransport,
    F: FnMut(&Timeline, &TimelineMutation),
{
    let ticket = controller.begin_turn(message);
    let mut machine = TurnMachine::new(controller.session_id());
    let mut emit = |timeline: &Timeline, mutations: Vec<TimelineMutation>| {
        for mutation in &mutations {
            on_mutation(timeline, mutation);
        }
    };

    let mutations = machine.open(timeline, message);
    emit(&*timeline, mutations);

    let opened = tokio::select! {
        biased;
        () = stop.cancelled() => None,
        opened = transport.open_stream(&ticket.request, ticket.token.clone()) => Some(opened),
    };
    let stream = match opened {
        Some(Ok(stream)) => stream,
        Some(Err(err)) => {
            let mutations = machine.fail(timeline, &err.to_string());
            emit(&*timeline, mutations);
            return finish(controller, &ticket, &machine);
        }
        None => {
            controller.cancel();
            let mutations = machine.cancel(timeline);
            emit(&*timeline, mutations);
            return finish(controller, &ticket, &machine);
        }
    };

    let (tx, mut rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let reader = spawn_turn_stream(stream, ticket.generation, tx);

    while !machine.state().is_terminal() {
        let received = tokio::select! {
            biased;
            () = stop.cancelled() => {
                controller.cancel();
                let mutations = machine.cancel(timeline);
                emit(&*timeline, mutations);
                break;
            }
            received = rx.recv() => received,
        };

        let Some(frame) = received else {
            let mutations = machine.stream_closed(timeline);
            emit(&*timeline, mutations);
            break;
        };
        let Some(message) = controller.accept(frame) else {
            continue;
        };
        let mutations = match message {
            StreamMessage::Event(event) => machine.apply(timeline, event),
            StreamMessage::Failed(err) => machine.fail(timeline, &err.to_string()),
            StreamMessage::Closed => machine.stream_closed(timeline),
        };
        emit(&*timeline, mutations);
    }

    let outcome = finish(controller, &ticket, &machine);
    drop(rx);
    if let Err(err) = reader.await {
        debug!(error = %err, "stream reader task ended abnormally");
    }
    outcome
}

fn finish(controller: &mut SessionController, ticket: &TurnTicket, machine: &TurnMachine) -> TurnOutcome {
    controller.bind_session(machine.session_id());
    controller.finish_turn(ticket.generation);
    let outcome = machine.outcome().cloned().unwrap_or(TurnOutcome::Cancelled);
    info!(generation = ticket.generation, outcome = %outcome, "turn finished");
    outcome
}
