// 🌐 Remote Follow Client - Helix API over HTTPS
//
// Fetches one page of followers / following at a time plus profile lookups.
// Every call surfaces the Ratelimit-* quota so the sync engine can pace itself.
// Network failures come back as typed errors; nothing here aborts the process.

use crate::config::Config;
use crate::model::{Direction, PeerEntry, Profile, RateLimit};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

/// Remote page-size ceiling
pub const PAGE_SIZE: usize = 100;

/// Maximum number of ids per user lookup
pub const PROFILE_BATCH: usize = 100;

pub const DEFAULT_API_BASE: &str = "https://api.twitch.tv/helix";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("account id must not be empty")]
    EmptyAccountId,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized (HTTP 401), check client id / token")]
    Unauthorized,

    #[error("forbidden (HTTP 403), check client id / token scopes")]
    Forbidden,

    #[error("rate limited until epoch {reset_epoch:?}")]
    RateLimited { reset_epoch: Option<i64> },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Map a non-200 status class onto the taxonomy
    pub fn from_status(status: u16, rate_limit: &RateLimit, what: &str) -> Self {
        match status {
            401 => FetchError::Unauthorized,
            403 => FetchError::Forbidden,
            404 => FetchError::NotFound(what.to_string()),
            429 => FetchError::RateLimited {
                reset_epoch: rate_limit.reset_epoch,
            },
            500..=599 => FetchError::Transient(format!("HTTP {status} for {what}")),
            other => FetchError::UnexpectedStatus(other),
        }
    }

    /// Worth retrying within the same pass
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// One page of relationship entries
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub entries: Vec<PeerEntry>,

    /// Empty once the listing is exhausted
    pub next_cursor: String,

    pub rate_limit: RateLimit,
}

/// A value together with the quota reported alongside it
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub rate_limit: RateLimit,
}

// ============================================================================
// API CONTRACT
// ============================================================================

/// Everything the sync engine needs from the remote platform.
pub trait FollowApi: Send + Sync {
    /// One page of `direction` for `account_id`; an empty cursor means the first page
    fn fetch_page(
        &self,
        account_id: &str,
        direction: Direction,
        cursor: &str,
    ) -> Result<Page, FetchError>;

    /// Profiles for up to [`PROFILE_BATCH`] ids. Unknown ids are simply absent.
    fn fetch_profiles(&self, ids: &[String]) -> Result<Fetched<Vec<Profile>>, FetchError>;

    fn resolve_account_id(&self, login: &str) -> Result<Fetched<String>, FetchError>;

    fn fetch_followers_page(&self, account_id: &str, cursor: &str) -> Result<Page, FetchError> {
        self.fetch_page(account_id, Direction::Followers, cursor)
    }

    fn fetch_following_page(&self, account_id: &str, cursor: &str) -> Result<Page, FetchError> {
        self.fetch_page(account_id, Direction::Following, cursor)
    }

    fn fetch_profile(&self, account_id: &str) -> Result<Fetched<Profile>, FetchError> {
        if account_id.is_empty() {
            return Err(FetchError::EmptyAccountId);
        }

        let fetched = self.fetch_profiles(&[account_id.to_string()])?;
        let profile = fetched
            .value
            .into_iter()
            .find(|p| p.id == account_id)
            .ok_or_else(|| FetchError::NotFound(format!("user id {account_id}")))?;

        Ok(Fetched {
            value: profile,
            rate_limit: fetched.rate_limit,
        })
    }
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

#[derive(Debug, Deserialize)]
struct FollowsResponse {
    #[serde(default)]
    data: Vec<FollowRecord>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct FollowRecord {
    from_id: String,
    to_id: String,
    #[serde(default)]
    followed_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsersResponse {
    #[serde(default)]
    data: Vec<Profile>,
}

fn parse_remote_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Decode a follows listing into peer entries and the next cursor.
/// The peer is `from_id` for followers and `to_id` for following.
pub fn parse_follows_page(
    body: &str,
    direction: Direction,
) -> Result<(Vec<PeerEntry>, String), FetchError> {
    let parsed: FollowsResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("follows listing: {e}")))?;

    let entries = parsed
        .data
        .into_iter()
        .map(|record| {
            let peer_id = match direction {
                Direction::Followers => record.from_id,
                Direction::Following => record.to_id,
            };
            PeerEntry {
                peer_id,
                followed_at: record.followed_at.as_deref().and_then(parse_remote_time),
            }
        })
        .collect();

    Ok((entries, parsed.pagination.cursor.unwrap_or_default()))
}

pub fn parse_users(body: &str) -> Result<Vec<Profile>, FetchError> {
    let parsed: UsersResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::MalformedResponse(format!("users listing: {e}")))?;
    Ok(parsed.data)
}

// ============================================================================
// HTTP CLIENT
// ============================================================================

pub struct TwitchClient {
    agent: ureq::Agent,
    base_url: String,
    client_id: String,
    oauth: Option<String>,
}

impl TwitchClient {
    pub fn new(base_url: &str, client_id: &str, oauth: Option<&str>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();

        TwitchClient {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            oauth: oauth.filter(|t| !t.is_empty()).map(str::to_string),
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let client_id = config.require_client_id()?;
        Ok(TwitchClient::new(
            &config.api_base,
            client_id,
            config.oauth.as_deref(),
            config.request_timeout,
        ))
    }

    /// GET `{base}/{path}` and return the body with the quota headers.
    fn get(&self, path: &str, query: &[(&str, &str)], what: &str) -> Result<(String, RateLimit), FetchError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut req = self.agent.get(&url).set("Client-ID", &self.client_id);
        if let Some(token) = &self.oauth {
            req = req.set("Authorization", &format!("Bearer {token}"));
        }
        for (key, value) in query {
            req = req.query(key, value);
        }

        match req.call() {
            Ok(resp) => {
                let rate_limit = rate_limit_of(&resp);
                let body = resp
                    .into_string()
                    .map_err(|e| FetchError::Transient(format!("reading {what}: {e}")))?;
                Ok((body, rate_limit))
            }
            Err(ureq::Error::Status(status, resp)) => {
                let rate_limit = rate_limit_of(&resp);
                Err(FetchError::from_status(status, &rate_limit, what))
            }
            Err(ureq::Error::Transport(err)) => {
                Err(FetchError::Transient(format!("{what}: {err}")))
            }
        }
    }
}

fn rate_limit_of(resp: &ureq::Response) -> RateLimit {
    RateLimit::parse(
        resp.header("Ratelimit-Limit"),
        resp.header("Ratelimit-Remaining"),
        resp.header("Ratelimit-Reset"),
    )
}

impl FollowApi for TwitchClient {
    fn fetch_page(
        &self,
        account_id: &str,
        direction: Direction,
        cursor: &str,
    ) -> Result<Page, FetchError> {
        if account_id.is_empty() {
            return Err(FetchError::EmptyAccountId);
        }

        let side = match direction {
            Direction::Followers => "to_id",
            Direction::Following => "from_id",
        };
        let first = PAGE_SIZE.to_string();
        let mut query = vec![(side, account_id), ("first", first.as_str())];
        if !cursor.is_empty() {
            query.push(("after", cursor));
        }

        let what = format!("{direction} of {account_id}");
        let (body, rate_limit) = self.get("users/follows", &query, &what)?;
        let (entries, next_cursor) = parse_follows_page(&body, direction)?;

        Ok(Page {
            entries,
            next_cursor,
            rate_limit,
        })
    }

    fn fetch_profiles(&self, ids: &[String]) -> Result<Fetched<Vec<Profile>>, FetchError> {
        if ids.is_empty() {
            return Ok(Fetched {
                value: Vec::new(),
                rate_limit: RateLimit::default(),
            });
        }
        if ids.iter().any(|id| id.is_empty()) {
            return Err(FetchError::EmptyAccountId);
        }

        let query: Vec<(&str, &str)> = ids
            .iter()
            .take(PROFILE_BATCH)
            .map(|id| ("id", id.as_str()))
            .collect();
        let (body, rate_limit) = self.get("users", &query, "user lookup")?;

        Ok(Fetched {
            value: parse_users(&body)?,
            rate_limit,
        })
    }

    fn resolve_account_id(&self, login: &str) -> Result<Fetched<String>, FetchError> {
        if login.is_empty() {
            return Err(FetchError::EmptyAccountId);
        }

        let what = format!("login {login}");
        let (body, rate_limit) = self.get("users", &[("login", login)], &what)?;
        let id = parse_users(&body)?
            .into_iter()
            .next()
            .map(|p| p.id)
            .ok_or(FetchError::NotFound(what))?;

        Ok(Fetched {
            value: id,
            rate_limit,
        })
    }
}
