//! The wizard controller: single writer of the [`Job`] aggregate.
//!
//! The controller runs as an actor task. Callers send [`WizardEvent`]s; the
//! actor applies them, starts rasterize/compose work on separate tasks, and
//! publishes whole [`Job`] snapshots on a `watch` channel. Readers never see
//! a partially updated job.
//!
//! ```text
//!  emit/dispatch ──▶ ┌───────────┐ ──▶ watch<Job>        (snapshots)
//!                    │   actor   │ ──▶ mpsc<Notification> (one-shot messages)
//!  completions  ──▶  └───────────┘
//!        ▲                 │ spawn
//!        └── rasterize / compose tasks
//! ```
//!
//! In-flight work is never cancelled. Every rasterize and compose carries a
//! monotonic token; when it completes with a token that is no longer current
//! (a newer source was selected, or the source was cleared) its result is
//! dropped.

use crate::config::MarginConfig;
use crate::error::MarginError;
use crate::job::{Activity, Edge, Job, OutputHandle, RasterPage, SourceHandle};
use crate::pipeline::compose::MarginComposer;
use crate::pipeline::render::PageRasterizer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Discrete user intents.
#[derive(Debug, Clone)]
pub enum WizardEvent {
    /// Select a source PDF and rasterise it.
    SetSource(SourceHandle),
    /// Set one margin, in canvas units.
    SetMargin(Edge, u32),
    SetOutputName(String),
    /// Forget the source and its pages. Margins and output name are kept.
    ClearSource,
    ClearOutputName,
    /// Compose the current pages with the current margins and name.
    StartCompose,
}

/// Transient messages for the user, delivered once each.
///
/// A notification is queued before the snapshot that ends the step it
/// belongs to is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The selected source could not be opened or rasterised.
    SourceUnreadable(String),
    /// Compose failed; the job is in the `Failed` phase.
    ComposeFailed(String),
    /// `StartCompose` was issued without an output name.
    OutputNameMissing,
    ComposeSucceeded(OutputHandle),
}

struct Command {
    event: WizardEvent,
    ack: Option<oneshot::Sender<()>>,
}

enum Completion {
    Rasterized {
        token: u64,
        source: SourceHandle,
        result: Result<Vec<RasterPage>, MarginError>,
    },
    Composed {
        token: u64,
        result: Result<OutputHandle, MarginError>,
    },
}

/// Handle to a running wizard actor.
///
/// Cloning yields another handle to the same actor. The actor stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct WizardController {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<Job>,
}

impl WizardController {
    /// Start the actor on the current tokio runtime.
    ///
    /// Returns the controller and the receiving end of the notification
    /// channel.
    pub fn spawn(
        rasterizer: Arc<PageRasterizer>,
        composer: Arc<MarginComposer>,
        config: &MarginConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(Job::default());
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            rasterizer,
            composer,
            min_busy: Duration::from_millis(config.min_busy_ms),
            job: Job::default(),
            state_tx,
            notify_tx,
            done_tx,
            pending_source: None,
            source_token: 0,
            compose_token: 0,
            next_token: 1,
        };
        tokio::spawn(actor.run(commands_rx, done_rx));

        (
            Self {
                commands: commands_tx,
                state: state_rx,
            },
            notify_rx,
        )
    }

    /// Start the actor with a pdfium-backed rasterizer.
    pub fn with_pdfium(config: &MarginConfig) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        Self::spawn(
            Arc::new(PageRasterizer::with_pdfium(config)),
            Arc::new(MarginComposer::new(config)),
            config,
        )
    }

    /// Queue an event without waiting for it to be applied.
    pub fn emit(&self, event: WizardEvent) -> Result<(), MarginError> {
        self.commands
            .send(Command { event, ack: None })
            .map_err(|_| MarginError::ControllerClosed)
    }

    /// Send an event and wait until the actor has applied it.
    ///
    /// Any resulting snapshot (e.g. the busy flag for `SetSource`) is
    /// published before this returns. The asynchronous work the event starts
    /// is not awaited; use [`Self::wait_until_idle`] for that.
    pub async fn dispatch(&self, event: WizardEvent) -> Result<(), MarginError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command {
                event,
                ack: Some(ack_tx),
            })
            .map_err(|_| MarginError::ControllerClosed)?;
        ack_rx.await.map_err(|_| MarginError::ControllerClosed)
    }

    /// The latest published snapshot.
    pub fn state(&self) -> Job {
        self.state.borrow().clone()
    }

    /// A receiver that observes every future snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Job> {
        self.state.clone()
    }

    /// Wait until no rasterize or compose is in flight and return that snapshot.
    pub async fn wait_until_idle(&self) -> Result<Job, MarginError> {
        let mut rx = self.state.clone();
        let job = rx
            .wait_for(|job| !job.is_busy())
            .await
            .map_err(|_| MarginError::ControllerClosed)?;
        Ok(job.clone())
    }
}

// ── Actor ────────────────────────────────────────────────────────────────

struct Actor {
    rasterizer: Arc<PageRasterizer>,
    composer: Arc<MarginComposer>,
    min_busy: Duration,
    job: Job,
    state_tx: watch::Sender<Job>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    done_tx: mpsc::UnboundedSender<Completion>,
    /// Source whose rasterisation is in flight.
    pending_source: Option<SourceHandle>,
    source_token: u64,
    compose_token: u64,
    next_token: u64,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut done: mpsc::UnboundedReceiver<Completion>,
    ) {
        debug!("Wizard controller started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command.event);
                    if let Some(ack) = command.ack {
                        let _ = ack.send(());
                    }
                }
                Some(completion) = done.recv() => self.complete(completion),
            }
        }
        self.rasterizer.close();
        debug!("Wizard controller stopped");
    }

    fn token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.job.clone());
    }

    fn notify(&self, notification: Notification) {
        if self.notify_tx.send(notification).is_err() {
            debug!("Notification dropped: receiver gone");
        }
    }

    fn handle(&mut self, event: WizardEvent) {
        debug!("Event: {:?}", event);
        match event {
            WizardEvent::SetSource(source) => self.set_source(source),
            WizardEvent::SetMargin(edge, value) => {
                if self.job.margins.get(edge) == Some(value) {
                    return;
                }
                self.job.margins = self.job.margins.with(edge, value);
                self.publish();
            }
            WizardEvent::SetOutputName(name) => {
                if self.job.output_name.as_deref() == Some(name.as_str()) {
                    return;
                }
                self.job.output_name = Some(name);
                self.publish();
            }
            WizardEvent::ClearOutputName => {
                if self.job.output_name.take().is_some() {
                    self.publish();
                }
            }
            WizardEvent::ClearSource => self.clear_source(),
            WizardEvent::StartCompose => self.start_compose(),
        }
    }

    fn set_source(&mut self, source: SourceHandle) {
        let latest = self.pending_source.as_ref().or(self.job.source.as_ref());
        if latest == Some(&source) {
            debug!("Source {} already selected", source);
            return;
        }

        let token = self.token();
        self.source_token = token;
        // A compose of the old pages is no longer wanted.
        self.compose_token = 0;
        self.pending_source = Some(source.clone());
        self.job.activity = Activity::Rasterizing;
        self.job.is_error = false;
        self.job.result = None;
        self.publish();
        info!("Selected source {} (request {})", source, token);

        let work = self.rasterizer.begin_rasterize(source.clone());
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = work.await;
            let _ = done.send(Completion::Rasterized {
                token,
                source,
                result,
            });
        });
    }

    fn clear_source(&mut self) {
        let idle_and_empty = self.job.source.is_none()
            && self.pending_source.is_none()
            && self.job.pages.is_empty()
            && !self.job.is_busy()
            && self.job.result.is_none()
            && !self.job.is_error;
        if idle_and_empty {
            return;
        }

        self.source_token = 0;
        self.compose_token = 0;
        self.pending_source = None;
        self.rasterizer.close();
        self.job = Job {
            margins: self.job.margins,
            output_name: self.job.output_name.take(),
            ..Job::default()
        };
        self.publish();
        info!("Source cleared");
    }

    fn start_compose(&mut self) {
        if self.job.is_busy() {
            warn!("StartCompose ignored: job is busy ({:?})", self.job.activity);
            return;
        }
        let Some(name) = self
            .job
            .output_name
            .clone()
            .filter(|n| !n.trim().is_empty())
        else {
            warn!("StartCompose ignored: no output name");
            self.notify(Notification::OutputNameMissing);
            return;
        };

        let token = self.token();
        self.compose_token = token;
        self.job.activity = Activity::Composing;
        self.job.is_error = false;
        self.job.result = None;
        self.publish();

        let pages = Arc::clone(&self.job.pages);
        let insets = self.job.margins.resolved();
        let composer = Arc::clone(&self.composer);
        let min_busy = self.min_busy;
        let done = self.done_tx.clone();
        info!(
            "Composing {} pages as {:?} (request {})",
            pages.len(),
            name,
            token
        );
        tokio::spawn(async move {
            let (result, _) = tokio::join!(
                composer.compose(pages, insets, &name),
                tokio::time::sleep(min_busy)
            );
            let _ = done.send(Completion::Composed { token, result });
        });
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Rasterized {
                token,
                source,
                result,
            } => {
                if token != self.source_token {
                    debug!("Discarding stale rasterisation of {} (request {})", source, token);
                    return;
                }
                self.pending_source = None;
                match result {
                    Ok(pages) => {
                        let display_name = source.display_name();
                        info!("Source {} ready: {} pages", source, pages.len());
                        self.job = Job {
                            output_name: display_name
                                .clone()
                                .or_else(|| self.job.output_name.take()),
                            source: Some(source),
                            source_display_name: display_name,
                            pages: Arc::new(pages),
                            margins: self.job.margins,
                            activity: Activity::Idle,
                            is_error: false,
                            result: None,
                        };
                    }
                    Err(e) => {
                        warn!("Could not open {}: {}", source, e);
                        self.job.activity = Activity::Idle;
                        self.notify(Notification::SourceUnreadable(e.to_string()));
                    }
                }
                self.publish();
            }
            Completion::Composed { token, result } => {
                if token != self.compose_token {
                    debug!("Discarding stale compose result (request {})", token);
                    return;
                }
                self.compose_token = 0;
                self.job.activity = Activity::Idle;
                match result {
                    Ok(handle) => {
                        info!("Compose finished: {}", handle.uri);
                        self.job.is_error = false;
                        self.job.result = Some(handle.clone());
                        self.notify(Notification::ComposeSucceeded(handle));
                        self.publish();
                    }
                    Err(e) => {
                        warn!("Compose failed: {}", e);
                        self.job.is_error = true;
                        self.job.result = None;
                        self.notify(Notification::ComposeFailed(e.to_string()));
                        self.publish();
                    }
                }
            }
        }
    }
}
