// 🔄 Synchronization Engine - pull, diff, commit
//
// One pass = one direction for one account:
//   1. snapshot the live edge keys ("previous")
//   2. page through the remote listing until the cursor runs out ("current")
//   3. added = current − previous, removed = previous − current
//   4. fetch missing profiles (outside the store lock, failures are non-fatal)
//   5. apply edges, churn and profiles in ONE write transaction
//
// A page failure aborts the pass before step 5, so the stored state is
// always either the previous pass or this one, never a mix.

use crate::client::{FetchError, FollowApi, Page, PROFILE_BATCH};
use crate::config::Config;
use crate::db::{PassRecord, PassStatus, Store, Txn};
use crate::model::{ChurnEvent, Direction, FollowEdge, PeerEntry, Profile, RateLimit};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub min_remaining: u32,
    pub max_pacing_wait: Duration,
    pub profile_refresh: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            min_remaining: 5,
            max_pacing_wait: Duration::from_secs(60),
            profile_refresh: None,
        }
    }
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        SyncOptions {
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
            min_remaining: config.min_remaining,
            max_pacing_wait: config.max_pacing_wait,
            profile_refresh: config.profile_refresh,
        }
    }
}

// ============================================================================
// ERRORS & REPORT
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{direction} pass failed on page {page}: {source}")]
    Fetch {
        direction: Direction,
        page: u32,
        #[source]
        source: FetchError,
    },

    #[error("a {direction} pass for account {account_id} is already running")]
    PassInProgress {
        account_id: String,
        direction: Direction,
    },

    #[error("store belongs to account {owner}, refusing a pass for {requested}")]
    ForeignAccount { requested: String, owner: String },

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// When a rate limit caused the abort, the earliest time to retry
    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncError::Fetch {
                source: FetchError::RateLimited { reset_epoch },
                ..
            } => RateLimit {
                reset_epoch: *reset_epoch,
                ..RateLimit::default()
            }
            .reset_at(),
            _ => None,
        }
    }
}

/// Outcome of a completed pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: String,
    pub account_id: String,
    pub direction: Direction,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages: u32,

    /// Distinct peers in the fresh pull
    pub current: usize,

    pub added: Vec<String>,
    pub removed: Vec<String>,

    /// Added peers whose churn record was cleared
    pub rejoined: Vec<String>,

    pub profiles_fetched: usize,
    pub profile_failures: usize,
}

impl PassReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// ============================================================================
// PASS LOCKS
// ============================================================================

/// At most one in-flight pass per (account, direction).
#[derive(Debug, Default)]
pub struct PassLocks {
    held: Mutex<HashSet<(String, Direction)>>,
}

impl PassLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the key, or `None` if another pass already holds it
    pub fn try_acquire(&self, account_id: &str, direction: Direction) -> Option<PassGuard<'_>> {
        let key = (account_id.to_string(), direction);
        let mut held = self.held.lock();
        if !held.insert(key.clone()) {
            return None;
        }

        Some(PassGuard { locks: self, key })
    }

    pub fn is_held(&self, account_id: &str, direction: Direction) -> bool {
        self.held
            .lock()
            .contains(&(account_id.to_string(), direction))
    }
}

pub struct PassGuard<'a> {
    locks: &'a PassLocks,
    key: (String, Direction),
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.key);
    }
}

// ============================================================================
// DIFF
// ============================================================================

/// Set difference between the stored edges and a fresh pull
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl Diff {
    pub fn compute(previous: &HashSet<String>, current: &HashMap<String, PeerEntry>) -> Self {
        Diff {
            added: current
                .keys()
                .filter(|id| !previous.contains(*id))
                .cloned()
                .collect(),
            removed: previous
                .iter()
                .filter(|id| !current.contains_key(*id))
                .cloned()
                .collect(),
        }
    }
}

/// How long to pause before the next page, if at all.
/// Only pauses when the quota is nearly spent and its reset time is known.
pub fn pacing_delay(
    rate_limit: &RateLimit,
    min_remaining: u32,
    max_wait: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let remaining = rate_limit.remaining?;
    if remaining > min_remaining {
        return None;
    }

    let wait = (rate_limit.reset_at()? - now).to_std().ok()?;
    if wait.is_zero() {
        return None;
    }

    Some(wait.min(max_wait))
}

/// Exponential backoff for the given retry attempt, never above `cap`
pub fn retry_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(cap, |delay| delay.min(cap))
}

// ============================================================================
// ENGINE
// ============================================================================

struct Pull {
    current: HashMap<String, PeerEntry>,
    pages: u32,
}

struct Hydration {
    profiles: Vec<Profile>,
    failures: usize,
}

pub struct SyncEngine<A> {
    api: A,
    store: Arc<Store>,
    locks: Arc<PassLocks>,
    options: SyncOptions,
}

impl<A: FollowApi> SyncEngine<A> {
    pub fn new(api: A, store: Arc<Store>, options: SyncOptions) -> Self {
        SyncEngine {
            api,
            store,
            locks: Arc::new(PassLocks::new()),
            options,
        }
    }

    /// Share a lock registry with other engines writing the same store
    pub fn with_locks(mut self, locks: Arc<PassLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn locks(&self) -> &Arc<PassLocks> {
        &self.locks
    }

    /// Run one pass and record it in the audit log, whatever the outcome
    pub fn run_pass(&self, account_id: &str, direction: Direction) -> Result<PassReport, SyncError> {
        if account_id.is_empty() {
            return Err(SyncError::Fetch {
                direction,
                page: 0,
                source: FetchError::EmptyAccountId,
            });
        }

        // Edge and churn tables are keyed by peer only, so one store serves one account
        let owner = self
            .store
            .write(|txn| txn.tracked_account().bind(account_id, Utc::now()))?;
        if let Some(owner) = owner {
            return Err(SyncError::ForeignAccount {
                requested: account_id.to_string(),
                owner,
            });
        }

        let _guard = self
            .locks
            .try_acquire(account_id, direction)
            .ok_or_else(|| SyncError::PassInProgress {
                account_id: account_id.to_string(),
                direction,
            })?;

        let pass_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(%pass_id, account_id, %direction, "pass started");

        let result = self.execute(&pass_id, account_id, direction, started_at);

        let record = match &result {
            Ok(report) => {
                info!(
                    %pass_id,
                    %direction,
                    pages = report.pages,
                    current = report.current,
                    added = report.added.len(),
                    removed = report.removed.len(),
                    rejoined = report.rejoined.len(),
                    "pass completed"
                );
                PassRecord {
                    pass_id: pass_id.clone(),
                    account_id: account_id.to_string(),
                    direction,
                    started_at,
                    finished_at: report.finished_at,
                    status: PassStatus::Completed,
                    pages: report.pages,
                    added: report.added.len() as u32,
                    removed: report.removed.len() as u32,
                    error: None,
                }
            }
            Err(e) => {
                error!(%pass_id, %direction, error = %e, "pass aborted, stored state unchanged");
                let pages = match e {
                    SyncError::Fetch { page, .. } => *page,
                    _ => 0,
                };
                PassRecord {
                    pass_id: pass_id.clone(),
                    account_id: account_id.to_string(),
                    direction,
                    started_at,
                    finished_at: Utc::now(),
                    status: PassStatus::Aborted,
                    pages,
                    added: 0,
                    removed: 0,
                    error: Some(e.to_string()),
                }
            }
        };

        if let Err(e) = self.store.write(|txn| txn.passes().insert(&record)) {
            warn!(%pass_id, error = %e, "failed to record pass in audit log");
        }

        result
    }

    /// Both directions, concurrently. They touch disjoint tables.
    pub fn run_all(&self, account_id: &str) -> Vec<(Direction, Result<PassReport, SyncError>)> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = Direction::ALL
                .into_iter()
                .map(|direction| {
                    (
                        direction,
                        scope.spawn(move || self.run_pass(account_id, direction)),
                    )
                })
                .collect();

            handles
                .into_iter()
                .map(|(direction, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(SyncError::Store(anyhow::anyhow!("{direction} pass panicked")))
                    });
                    (direction, result)
                })
                .collect()
        })
    }

    fn execute(
        &self,
        pass_id: &str,
        account_id: &str,
        direction: Direction,
        started_at: DateTime<Utc>,
    ) -> Result<PassReport, SyncError> {
        // 1. Begin
        let previous = self.store.read(|txn| txn.edges(direction).keys())?;

        // 2. Page loop
        let pull = self.pull_all(account_id, direction)?;

        // 3. Diff
        let diff = Diff::compute(&previous, &pull.current);
        debug!(
            pass_id,
            %direction,
            previous = previous.len(),
            current = pull.current.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "diff computed"
        );

        // 4. Profile hydration
        let candidates = self.store.read(|txn| {
            self.hydration_candidates(txn, &pull.current, Utc::now())
        })?;
        let hydration = self.hydrate(&candidates);

        // 5. Commit
        let now = Utc::now();
        let rejoined = self
            .store
            .write(|txn| apply_pass(txn, direction, &diff, &pull.current, &hydration.profiles, now))?;

        Ok(PassReport {
            pass_id: pass_id.to_string(),
            account_id: account_id.to_string(),
            direction,
            started_at,
            finished_at: Utc::now(),
            pages: pull.pages,
            current: pull.current.len(),
            added: diff.added.into_iter().collect(),
            removed: diff.removed.into_iter().collect(),
            rejoined,
            profiles_fetched: hydration.profiles.len(),
            profile_failures: hydration.failures,
        })
    }

    fn pull_all(&self, account_id: &str, direction: Direction) -> Result<Pull, SyncError> {
        let mut current = HashMap::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor = String::new();
        let mut pages = 0u32;

        loop {
            pages += 1;
            let page = self.fetch_page_with_retry(account_id, direction, &cursor, pages)?;
            debug!(
                account_id,
                %direction,
                page = pages,
                entries = page.entries.len(),
                remaining = ?page.rate_limit.remaining,
                "page fetched"
            );

            // Same peer twice across pages: the later entry wins
            for entry in page.entries {
                current.insert(entry.peer_id.clone(), entry);
            }

            if page.next_cursor.is_empty() {
                break;
            }
            if !seen_cursors.insert(page.next_cursor.clone()) {
                return Err(SyncError::Fetch {
                    direction,
                    page: pages,
                    source: FetchError::MalformedResponse(format!(
                        "cursor {} repeated",
                        page.next_cursor
                    )),
                });
            }

            self.pace(&page.rate_limit);
            cursor = page.next_cursor;
        }

        Ok(Pull { current, pages })
    }

    fn fetch_page_with_retry(
        &self,
        account_id: &str,
        direction: Direction,
        cursor: &str,
        page: u32,
    ) -> Result<Page, SyncError> {
        let mut attempt = 0u32;
        loop {
            match self.api.fetch_page(account_id, direction, cursor) {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.options.max_retries => {
                    let delay = retry_delay(
                        self.options.retry_backoff,
                        attempt,
                        self.options.max_pacing_wait,
                    );
                    attempt += 1;
                    warn!(
                        %direction,
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "page fetch failed, retrying"
                    );
                    std::thread::sleep(delay);
                }
                Err(source) => {
                    return Err(SyncError::Fetch {
                        direction,
                        page,
                        source,
                    })
                }
            }
        }
    }

    fn pace(&self, rate_limit: &RateLimit) {
        if let Some(wait) = pacing_delay(
            rate_limit,
            self.options.min_remaining,
            self.options.max_pacing_wait,
            Utc::now(),
        ) {
            info!(
                remaining = ?rate_limit.remaining,
                wait_secs = wait.as_secs(),
                "quota nearly spent, pausing"
            );
            std::thread::sleep(wait);
        }
    }

    /// Current peers with no cached profile, plus stale ones when refresh is on
    fn hydration_candidates(
        &self,
        txn: &Txn<'_>,
        current: &HashMap<String, PeerEntry>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let fetched = txn.profiles().fetched_at_all()?;
        let stale_before = self
            .options
            .profile_refresh
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now - d);

        let mut ids: Vec<String> = current
            .keys()
            .filter(|id| match fetched.get(*id) {
                None => true,
                Some(at) => stale_before.is_some_and(|cutoff| *at < cutoff),
            })
            .cloned()
            .collect();
        ids.sort();

        Ok(ids)
    }

    fn hydrate(&self, ids: &[String]) -> Hydration {
        let mut profiles = Vec::new();
        let mut failures = 0;

        for (i, chunk) in ids.chunks(PROFILE_BATCH).enumerate() {
            match self.api.fetch_profiles(chunk) {
                Ok(fetched) => {
                    let found: HashSet<&str> = fetched.value.iter().map(|p| p.id.as_str()).collect();
                    let missing = chunk.iter().filter(|id| !found.contains(id.as_str())).count();
                    if missing > 0 {
                        debug!(missing, "profiles not found, left for a later pass");
                    }
                    failures += missing;
                    profiles.extend(
                        fetched
                            .value
                            .into_iter()
                            .filter(|p| chunk.contains(&p.id)),
                    );
                }
                Err(e) => {
                    warn!(ids = chunk.len(), error = %e, "profile lookup failed, edges kept without profiles");
                    if matches!(e, FetchError::RateLimited { .. }) {
                        failures += ids.len() - i * PROFILE_BATCH;
                        break;
                    }
                    failures += chunk.len();
                }
            }
        }

        Hydration { profiles, failures }
    }
}

/// Apply a computed diff. Runs inside the pass's single write transaction.
/// Returns the ids whose churn record was cleared by a rejoin.
fn apply_pass(
    txn: &Txn<'_>,
    direction: Direction,
    diff: &Diff,
    current: &HashMap<String, PeerEntry>,
    profiles: &[Profile],
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let edges = txn.edges(direction);
    let churn = txn.churn(direction);
    let mut rejoined = Vec::new();

    for id in &diff.added {
        let prior = churn.get(id)?;
        if prior.is_some() {
            churn.delete(id)?;
            rejoined.push(id.clone());
        }

        edges.put(&FollowEdge {
            peer_id: id.clone(),
            observed_at: now,
            followed_at: current.get(id).and_then(|e| e.followed_at),
            rejoined_after: prior.map(|c| c.changed_at),
        })?;
    }

    for id in &diff.removed {
        edges.delete(id)?;
        churn.put(&ChurnEvent {
            peer_id: id.clone(),
            changed_at: now,
        })?;
    }

    // Retained edges must not carry a churn record either
    for id in churn.keys()? {
        if !current.contains_key(&id) || diff.added.contains(&id) {
            continue;
        }
        if let (Some(event), Some(mut edge)) = (churn.get(&id)?, edges.get(&id)?) {
            edge.rejoined_after = Some(event.changed_at);
            edges.put(&edge)?;
        }
        churn.delete(&id)?;
    }

    for profile in profiles {
        txn.profiles().put(profile, now)?;
    }

    Ok(rejoined)
}
