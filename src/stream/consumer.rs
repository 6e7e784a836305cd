use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::api::ApiClient;
use crate::errors::ChatError;
use crate::models::{ChatTurn, Delivery};
use crate::stream::sse::{classify_line, LineDecoder, StreamEvent};

const EVENT_BUFFER: usize = 64;

/// What the presentation layer receives for one turn: any number of
/// `Progress` events, then exactly one terminal event (unless aborted).
#[derive(Debug)]
pub enum TurnEvent {
    /// `text` is everything received so far, `delta` the part that just arrived.
    Progress { delta: String, text: String },
    Completed { turn: ChatTurn, delivery: Delivery },
    /// The turn still holds the original prompt and attachments for a retry.
    Failed { turn: ChatTurn, error: ChatError },
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TurnEvent::Progress { .. })
    }
}

/// Drives one chat turn at a time against the streaming endpoint, with a
/// one-shot fallback to the non-streaming endpoint.
#[derive(Clone)]
pub struct StreamConsumer {
    api: ApiClient,
    active: Arc<AtomicBool>,
}

impl StreamConsumer {
    pub fn new(api: ApiClient) -> Self {
        Self { api, active: Arc::new(AtomicBool::new(false)) }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// True while a turn started by this consumer has not finished.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Starts a turn on its own task. Must be called inside a tokio runtime.
    pub fn send(
        &self,
        prompt: impl Into<String>,
        attachment_ids: Vec<String>,
        session_id: Option<String>,
    ) -> Result<TurnHandle, ChatError> {
        let turn = ChatTurn::new(prompt, attachment_ids, session_id, self.api.config().model.clone())?;
        self.start(turn)
    }

    /// Sends the same prompt, attachments and session as an earlier turn.
    pub fn resend(&self, previous: &ChatTurn) -> Result<TurnHandle, ChatError> {
        let turn = ChatTurn::new(
            previous.prompt_text(),
            previous.attachment_ids().to_vec(),
            previous.session_id().map(str::to_string),
            previous.model(),
        )?;
        self.start(turn)
    }

    fn start(&self, turn: ChatTurn) -> Result<TurnHandle, ChatError> {
        let guard = ActiveTurn::acquire(&self.active)?;
        let (tx, rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        debug!(
            "Starting turn (session {:?}, {} attachments)",
            turn.session_id(),
            turn.attachment_ids().len()
        );
        let task = tokio::spawn(run_turn(self.api.clone(), turn, tx, cancel.clone(), guard));

        Ok(TurnHandle { events: rx, cancel, task: Some(task) })
    }
}

/// Marks the consumer busy for as long as the turn task holds it.
struct ActiveTurn(Arc<AtomicBool>);

impl ActiveTurn {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self, ChatError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatError::TurnInProgress)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for ActiveTurn {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Caller's end of a running turn. Yields [`TurnEvent`]s in order.
///
/// Dropping the handle aborts the turn.
pub struct TurnHandle {
    events: mpsc::Receiver<TurnEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TurnHandle {
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Stops reading. No event is delivered after this returns.
    pub fn abort(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A token that aborts this turn from elsewhere (e.g. a Ctrl-C handler).
    pub fn canceller(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Skips progress events and returns the terminal one, or `None` if aborted.
    pub async fn finish(mut self) -> Option<TurnEvent> {
        while let Some(event) = self.next_event().await {
            if event.is_terminal() {
                return Some(event);
            }
        }
        None
    }

    /// Waits until the turn task has exited and released its connection.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Turn task failed: {e}");
            }
        }
    }
}

impl Stream for TurnHandle {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TurnEvent>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }
}

impl Drop for TurnHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_turn(
    api: ApiClient,
    mut turn: ChatTurn,
    tx: mpsc::Sender<TurnEvent>,
    cancel: CancellationToken,
    guard: ActiveTurn,
) {
    let event = match drive_turn(&api, &mut turn, &tx, &cancel).await {
        Ok(None) => {
            debug!("Turn aborted by caller");
            return;
        }
        Ok(Some(delivery)) => {
            info!(
                "Turn completed via {delivery:?}: message {:?}, {} chars",
                turn.final_message_id(),
                turn.accumulated_text().len()
            );
            TurnEvent::Completed { turn, delivery }
        }
        Err(error) => {
            error!("Turn failed: {error}");
            if let Err(e) = turn.fail() {
                error!("Could not mark turn failed: {e}");
            }
            TurnEvent::Failed { turn, error }
        }
    };

    // Free the slot first so a caller reacting to the terminal event can send again.
    drop(guard);
    emit(&tx, &cancel, event).await;
}

/// Runs the streaming path and, when it cannot be used, the fallback.
/// `Ok(None)` means the caller aborted.
async fn drive_turn(
    api: &ApiClient,
    turn: &mut ChatTurn,
    tx: &mpsc::Sender<TurnEvent>,
    cancel: &CancellationToken,
) -> Result<Option<Delivery>, ChatError> {
    let request = turn.request();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        opened = api.open_stream(&request) => opened,
    };

    match opened {
        Ok(body) => {
            turn.begin_streaming()?;
            let idle_timeout = api.config().stream_idle_timeout;
            match drain_body(body, turn, tx, cancel, idle_timeout).await? {
                BodyOutcome::Done { message_id, session_id } => {
                    turn.complete(message_id, session_id)?;
                    return Ok(Some(Delivery::Streamed));
                }
                BodyOutcome::Cancelled => return Ok(None),
                BodyOutcome::Dropped(error) => {
                    if !api.config().fallback_on_stream_drop {
                        return Err(error);
                    }
                    warn!("Stream dropped mid-flight ({error}), retrying without streaming");
                }
            }
        }
        Err(error) if error.is_stream_open_failure() => {
            warn!("Streaming unavailable ({error}), falling back to a single request");
        }
        Err(error) => return Err(error),
    }

    turn.begin_fallback()?;
    let reply = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(None),
        reply = api.send_fallback(&request) => reply?,
    };
    turn.complete_from_fallback(reply)?;
    Ok(Some(Delivery::Fallback))
}

#[derive(Debug)]
pub(crate) enum BodyOutcome {
    Done {
        message_id: Option<String>,
        session_id: Option<String>,
    },
    Dropped(ChatError),
    Cancelled,
}

/// Reads the response body until `done`, a drop, or cancellation.
///
/// Lines are interpreted strictly in arrival order. Each content delta is
/// appended to the turn and forwarded as a `Progress` event.
pub(crate) async fn drain_body<S, B, E>(
    mut body: S,
    turn: &mut ChatTurn,
    tx: &mpsc::Sender<TurnEvent>,
    cancel: &CancellationToken,
    idle_timeout: Duration,
) -> Result<BodyOutcome, ChatError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut decoder = LineDecoder::new();
    let mut discarded = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(BodyOutcome::Cancelled),
            next = tokio::time::timeout(idle_timeout, body.next()) => next,
        };

        let (lines, ended) = match next {
            Err(_) => {
                return Ok(BodyOutcome::Dropped(ChatError::interrupted(format!(
                    "no data received for {idle_timeout:?}"
                ))));
            }
            Ok(Some(Err(e))) => {
                return Ok(BodyOutcome::Dropped(ChatError::interrupted(e.to_string())));
            }
            Ok(Some(Ok(fragment))) => (decoder.push(fragment.as_ref()), false),
            Ok(None) => (decoder.finish().into_iter().collect::<Vec<_>>(), true),
        };

        for line in &lines {
            for event in classify_line(line) {
                match event {
                    StreamEvent::ContentDelta(delta) => {
                        turn.append_delta(&delta)?;
                        let progress = TurnEvent::Progress {
                            delta,
                            text: turn.accumulated_text().to_string(),
                        };
                        if !emit(tx, cancel, progress).await {
                            return Ok(BodyOutcome::Cancelled);
                        }
                    }
                    StreamEvent::Done { message_id, session_id } => {
                        debug!("Stream done after discarding {discarded} unrecognized lines");
                        return Ok(BodyOutcome::Done { message_id, session_id });
                    }
                    StreamEvent::ServerError(message) => {
                        return Ok(BodyOutcome::Dropped(ChatError::interrupted(format!(
                            "server error: {message}"
                        ))));
                    }
                    StreamEvent::Malformed => {
                        discarded += 1;
                        trace!("Discarding line: {}", ChatError::MalformedStreamFragment { line: line.clone() });
                    }
                }
            }
        }

        if ended {
            return Ok(BodyOutcome::Dropped(ChatError::interrupted(
                "stream ended before completion",
            )));
        }
    }
}

/// Delivers an event unless the turn was aborted. `false` means stop.
async fn emit(tx: &mpsc::Sender<TurnEvent>, cancel: &CancellationToken, event: TurnEvent) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tx.send(event).await.is_ok()
}
