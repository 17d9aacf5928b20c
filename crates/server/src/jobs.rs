//! Background work queue with retries, plus the periodic scheduler that feeds it.

use std::time::Duration;

use axum::http::StatusCode;
use catalog::CatalogError;
use common::MediaKind;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::feeds::FeedError;
use crate::state::AppState;
use crate::{podcasts, radio, scan};

const QUEUE_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Job {
    ScanUser { user_id: String, kind: MediaKind },
    FetchEpisodes { user_id: String, subscription_id: String },
    FetchMetadata { user_id: String, subscription_id: String },
    FetchUnfetchedMetadata,
    RefreshAllFeeds,
    ImportGpodder { user_id: String },
    ImportRadio { user_id: String },
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::ScanUser { user_id, kind } => write!(f, "scan {} for {}", kind, user_id),
            Job::FetchEpisodes {
                user_id,
                subscription_id,
            } => write!(f, "fetch episodes of {} for {}", subscription_id, user_id),
            Job::FetchMetadata {
                user_id,
                subscription_id,
            } => write!(f, "fetch metadata of {} for {}", subscription_id, user_id),
            Job::FetchUnfetchedMetadata => f.write_str("fetch missing subscription metadata"),
            Job::RefreshAllFeeds => f.write_str("refresh all feeds"),
            Job::ImportGpodder { user_id } => write!(f, "gpodder import for {}", user_id),
            Job::ImportRadio { user_id } => write!(f, "radio import for {}", user_id),
        }
    }
}

#[derive(Debug)]
pub enum JobError {
    Catalog(CatalogError),
    Feed(FeedError),
    NotFound(String),
    MissingAccount(String),
    Join(String),
}

impl JobError {
    /// Failures that would fail the same way on every attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            JobError::NotFound(_)
                | JobError::MissingAccount(_)
                | JobError::Catalog(CatalogError::NotFound(_))
                | JobError::Catalog(CatalogError::RootMissing(_))
                | JobError::Feed(FeedError::InvalidUrl(_))
                | JobError::Feed(FeedError::Parse(_))
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            JobError::NotFound(_)
            | JobError::Catalog(CatalogError::NotFound(_))
            | JobError::Catalog(CatalogError::RootMissing(_)) => StatusCode::NOT_FOUND,
            JobError::MissingAccount(_)
            | JobError::Feed(FeedError::InvalidUrl(_))
            | JobError::Feed(FeedError::Parse(_)) => StatusCode::BAD_REQUEST,
            JobError::Feed(_) => StatusCode::BAD_GATEWAY,
            JobError::Catalog(_) | JobError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Catalog(err) => write!(f, "{}", err),
            JobError::Feed(err) => write!(f, "{}", err),
            JobError::NotFound(what) => write!(f, "not found: {}", what),
            JobError::MissingAccount(user) => write!(f, "no gpodder account for {}", user),
            JobError::Join(message) => write!(f, "task failed: {}", message),
        }
    }
}

impl std::error::Error for JobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Catalog(err) => Some(err),
            JobError::Feed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CatalogError> for JobError {
    fn from(err: CatalogError) -> Self {
        JobError::Catalog(err)
    }
}

impl From<FeedError> for JobError {
    fn from(err: FeedError) -> Self {
        JobError::Feed(err)
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(err: tokio::task::JoinError) -> Self {
        JobError::Join(err.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_attempts: config.job_max_attempts.max(1),
            base_delay: Duration::from_secs(config.job_retry_base_secs),
        }
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based),
    /// or `None` once attempts are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        Some(self.base_delay.saturating_mul(factor))
    }
}

#[derive(Debug)]
struct Envelope {
    job: Job,
    attempt: u32,
}

#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<Envelope>,
}

pub struct JobReceiver {
    receiver: mpsc::Receiver<Envelope>,
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        (Self { sender }, JobReceiver { receiver })
    }

    /// Enqueues without waiting. Returns false when the queue is full or the
    /// worker has stopped.
    pub fn submit(&self, job: Job) -> bool {
        info!("Queueing job: {}", job);
        match self.sender.try_send(Envelope { job, attempt: 1 }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                warn!("Job queue full; dropping {}", envelope.job);
                false
            }
            Err(mpsc::error::TrySendError::Closed(envelope)) => {
                warn!("Job queue closed; dropping {}", envelope.job);
                false
            }
        }
    }

    async fn requeue(&self, envelope: Envelope) {
        if let Err(err) = self.sender.send(envelope).await {
            error!("Job queue closed; dropping retry of {}", err.0.job);
        }
    }
}

pub fn start_worker(state: AppState, receiver: JobReceiver) {
    tokio::spawn(process_jobs(state, receiver));
}

async fn process_jobs(state: AppState, mut receiver: JobReceiver) {
    info!("Job worker started");
    while let Some(envelope) = receiver.receiver.recv().await {
        tokio::spawn(run_with_retry(state.clone(), envelope));
    }
    info!("Job worker stopped (channel closed)");
}

async fn run_with_retry(state: AppState, envelope: Envelope) {
    info!("Running job: {} (attempt {})", envelope.job, envelope.attempt);
    let err = match run_job(&state, &envelope.job).await {
        Ok(()) => {
            info!("Job finished: {}", envelope.job);
            return;
        }
        Err(err) => err,
    };
    if err.is_permanent() {
        error!("Job failed permanently: {}: {}", envelope.job, err);
        return;
    }
    let policy = RetryPolicy::from_config(&state.config.read());
    match policy.delay_for(envelope.attempt) {
        Some(delay) => {
            warn!(
                "Job failed: {}: {}; retrying in {}s",
                envelope.job,
                err,
                delay.as_secs()
            );
            sleep(delay).await;
            state
                .jobs
                .requeue(Envelope {
                    job: envelope.job,
                    attempt: envelope.attempt + 1,
                })
                .await;
        }
        None => error!(
            "Job failed after {} attempts, giving up: {}: {}",
            envelope.attempt, envelope.job, err
        ),
    }
}

pub async fn run_job(state: &AppState, job: &Job) -> Result<(), JobError> {
    match job {
        Job::ScanUser { user_id, kind } => {
            scan::scan_user(state, user_id, *kind).await?;
        }
        Job::FetchEpisodes {
            user_id,
            subscription_id,
        } => {
            podcasts::refresh_subscription(state, user_id, subscription_id).await?;
        }
        Job::FetchMetadata {
            user_id,
            subscription_id,
        } => {
            podcasts::fetch_metadata(state, user_id, subscription_id).await?;
        }
        Job::FetchUnfetchedMetadata => {
            podcasts::fetch_unfetched_metadata(state).await?;
        }
        Job::RefreshAllFeeds => {
            podcasts::refresh_all(state).await?;
        }
        Job::ImportGpodder { user_id } => {
            podcasts::import_gpodder(state, user_id, true).await?;
        }
        Job::ImportRadio { user_id } => {
            radio::import_stations(state, user_id, 0).await?;
        }
    }
    Ok(())
}

/// Periodic scans of every configured user and the feed refresh. An interval
/// of zero disables that schedule.
pub fn start_scheduler(state: AppState) {
    let (scan_every, feeds_every) = {
        let config = state.config.read();
        (config.scan_interval_secs, config.feed_refresh_interval_secs)
    };

    if scan_every > 0 {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(scan_every));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let users: Vec<String> = state
                    .config
                    .read()
                    .users
                    .iter()
                    .map(|user| user.id.clone())
                    .collect();
                for user_id in users {
                    for kind in [MediaKind::Music, MediaKind::Video] {
                        state.jobs.submit(Job::ScanUser {
                            user_id: user_id.clone(),
                            kind,
                        });
                    }
                }
            }
        });
    } else {
        info!("Periodic scans disabled");
    }

    if feeds_every > 0 {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(feeds_every));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                state.jobs.submit(Job::FetchUnfetchedMetadata);
                state.jobs.submit(Job::RefreshAllFeeds);
            }
        });
    } else {
        info!("Periodic feed refresh disabled");
    }
}
