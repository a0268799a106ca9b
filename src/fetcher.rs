//! The poll loop
//!
//! A [`Fetcher`] owns the configuration, the loop state and the
//! shutdown token. Each tick opens a fresh [`MailSession`], processes
//! the unseen messages chosen by the [`SelectionPolicy`], saves their
//! attachments and logs out. Tick failures are logged; they never end
//! the loop.
//!
//! [`SelectionPolicy`]: crate::SelectionPolicy

use crate::config::Config;
use crate::error::{Error, Result};
use crate::parser::ParsedMessage;
use crate::session::{MailSession, RawMessage};
use crate::writer::{AttachmentWriter, Saved};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Logout bound once a stop has interrupted a tick.
const STOP_CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotRunning,
    Running,
    Stopping,
}

impl LoopState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::NotRunning => 0,
            Self::Running => 1,
            Self::Stopping => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::NotRunning,
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    /// Unseen messages found in the inbox.
    pub unseen: usize,
    /// Messages fetched and parsed, by sequence number.
    pub processed: Vec<u32>,
    pub saved: Vec<PathBuf>,
    /// Attachments without a usable filename.
    pub skipped: usize,
    /// Messages or attachments that failed and were passed over.
    pub failures: usize,
}

impl TickReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            unseen: 0,
            processed: Vec::new(),
            saved: Vec::new(),
            skipped: 0,
            failures: 0,
        }
    }
}

/// Periodically fetches attachments of new mail.
///
/// Share it through an [`Arc`]: [`Fetcher::start`] spawns the loop on
/// the current tokio runtime and [`Fetcher::stop`] can be called from
/// anywhere. Only one tick runs at a time, whether it comes from the
/// loop or from [`Fetcher::run_once`].
pub struct Fetcher {
    config: Config,
    writer: AttachmentWriter,
    state: AtomicU8,
    /// Token of the current run; replaced every time a run begins.
    shutdown: Mutex<CancellationToken>,
}

impl Fetcher {
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let writer = AttachmentWriter::new(config.attachment_dir.clone());
        Ok(Self {
            config,
            writer,
            state: AtomicU8::new(LoopState::NotRunning.to_u8()),
            shutdown: Mutex::new(CancellationToken::new()),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Run a single poll tick and return what it did.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyRunning`] if the loop or another tick is
    ///   running.
    /// - The error that ended the tick early: authentication,
    ///   connection, TLS or a rejected SELECT/SEARCH.
    /// - [`Error::Cancelled`] if [`Fetcher::stop`] interrupted it.
    pub async fn run_once(&self) -> Result<TickReport> {
        let shutdown = self.begin()?;
        let result = self.tick(&shutdown).await;
        self.finish();
        result
    }

    /// Spawn the poll loop on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if it is already running.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let shutdown = self.begin()?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.run_loop(shutdown).await }))
    }

    /// Run the poll loop on the current task until [`Fetcher::stop`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] if it is already running.
    pub async fn run(&self) -> Result<()> {
        let shutdown = self.begin()?;
        self.run_loop(shutdown).await;
        Ok(())
    }

    /// Ask the loop to stop.
    ///
    /// Interrupts the inter-tick sleep and any in-flight network I/O.
    /// Returns `true` if this call initiated the stop, `false` if the
    /// loop was not running or already stopping.
    pub fn stop(&self) -> bool {
        let shutdown = self.lock_shutdown();
        let stopped = self
            .state
            .compare_exchange(
                LoopState::Running.to_u8(),
                LoopState::Stopping.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if stopped {
            info!("Stop requested");
            shutdown.cancel();
        }
        stopped
    }

    fn begin(&self) -> Result<CancellationToken> {
        let mut shutdown = self.lock_shutdown();
        self.state
            .compare_exchange(
                LoopState::NotRunning.to_u8(),
                LoopState::Running.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::AlreadyRunning)?;
        *shutdown = CancellationToken::new();
        Ok(shutdown.clone())
    }

    fn finish(&self) {
        let _shutdown = self.lock_shutdown();
        self.state.store(LoopState::NotRunning.to_u8(), Ordering::Release);
    }

    fn lock_shutdown(&self) -> MutexGuard<'_, CancellationToken> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_loop(&self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.poll_interval.as_secs(),
            policy = %self.config.selection,
            dir = %self.writer.dir().display(),
            "Poll loop started"
        );

        loop {
            match self.tick(&shutdown).await {
                Ok(report) => log_report(&report),
                Err(Error::Cancelled) => break,
                Err(e) => error!(kind = e.kind(), error = %e, "Poll tick failed"),
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.finish();
        info!("Poll loop stopped");
    }

    /// open -> select -> search -> fetch/parse/save -> close.
    ///
    /// The session is logged out on every path. After a stop request
    /// arrives mid-tick the logout is bounded by `STOP_CLOSE_TIMEOUT`.
    async fn tick(&self, shutdown: &CancellationToken) -> Result<TickReport> {
        let mut report = TickReport::new();

        let mut session = tokio::select! {
            () = shutdown.cancelled() => return Err(Error::Cancelled),
            session = MailSession::open(&self.config) => session?,
        };

        let outcome = tokio::select! {
            () = shutdown.cancelled() => Err(Error::Cancelled),
            outcome = self.process(&mut session, &mut report) => outcome,
        };

        if matches!(outcome, Err(Error::Cancelled)) {
            session.close_within(STOP_CLOSE_TIMEOUT).await;
        } else {
            session.close().await;
        }
        outcome.map(|()| report)
    }

    async fn process(&self, session: &mut MailSession, report: &mut TickReport) -> Result<()> {
        session.select_inbox().await?;
        let unseen = session.search_unseen().await?;
        report.unseen = unseen.len();

        if unseen.is_empty() {
            debug!("No unseen messages");
            return Ok(());
        }

        let selected = self.config.selection.select(&unseen);
        if selected.len() < unseen.len() {
            debug!(
                left_unseen = unseen.len() - selected.len(),
                policy = %self.config.selection,
                "Processing newest unseen message only"
            );
        }

        for &id in selected {
            match session.fetch_raw(id).await {
                Ok(raw) => self.process_message(&raw, report).await,
                Err(e) => {
                    report.failures += 1;
                    warn!(id, kind = e.kind(), error = %e, "Could not fetch message");
                }
            }
        }
        Ok(())
    }

    async fn process_message(&self, raw: &RawMessage, report: &mut TickReport) {
        let id = raw.id;
        let parsed = match ParsedMessage::parse(raw.as_bytes()) {
            Ok(parsed) => parsed,
            Err(e) => {
                report.failures += 1;
                warn!(id, error = %e, "Could not parse message");
                return;
            }
        };

        let sender = parsed.sender();
        if sender.lossy {
            warn!(id, sender = %sender.text, "Sender decoded with replacement characters");
        }
        info!(id, sender = %sender.text, "Processing message");
        report.processed.push(id);

        for item in parsed.attachments() {
            let attachment = match item {
                Ok(attachment) => attachment,
                Err(e) => {
                    report.failures += 1;
                    warn!(id, error = %e, "Skipping undecodable part");
                    continue;
                }
            };

            if attachment.lossy_filename {
                warn!(
                    id,
                    filename = attachment.filename.as_deref().unwrap_or_default(),
                    "Filename decoded with replacement characters"
                );
            }

            match self.writer.save(&attachment).await {
                Ok(Saved::Written(path)) => {
                    info!(
                        id,
                        path = %path.display(),
                        size = attachment.content.len(),
                        content_type = %attachment.content_type,
                        "Saved attachment"
                    );
                    report.saved.push(path);
                }
                Ok(Saved::Skipped(reason)) => {
                    report.skipped += 1;
                    warn!(id, ?reason, "Skipped attachment");
                }
                Err(e) => {
                    report.failures += 1;
                    error!(
                        id,
                        filename = attachment.filename.as_deref().unwrap_or_default(),
                        error = %e,
                        "Could not save attachment"
                    );
                }
            }
        }
    }
}

fn log_report(report: &TickReport) {
    if report.unseen == 0 {
        debug!("Poll tick finished, nothing new");
    } else {
        info!(
            unseen = report.unseen,
            processed = report.processed.len(),
            saved = report.saved.len(),
            skipped = report.skipped,
            failures = report.failures,
            "Poll tick finished"
        );
    }
}
