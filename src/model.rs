// 👥 Follow Model - Profiles, edges and churn events
//
// Every record is keyed by the peer's platform-assigned numeric ID, kept in
// its canonical string form. Edges and churn events reference profiles by ID
// only; a profile may outlive every edge that pointed at it.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// DIRECTION
// ============================================================================

/// Which side of the relationship a pass tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Accounts that follow the tracked account
    Followers,

    /// Accounts the tracked account follows
    Following,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Followers, Direction::Following];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Followers => "followers",
            Direction::Following => "following",
        }
    }

    /// Table holding the live edges for this direction
    pub fn edge_table(&self) -> &'static str {
        match self {
            Direction::Followers => "followers",
            Direction::Following => "following",
        }
    }

    /// Table holding the churn history for this direction
    pub fn churn_table(&self) -> &'static str {
        match self {
            Direction::Followers => "unfollowers",
            Direction::Following => "unfollowing",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "followers" => Ok(Direction::Followers),
            "following" => Ok(Direction::Following),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

// ============================================================================
// PROFILE
// ============================================================================

/// Sentinel used when a stored profile cannot be decoded
pub const UNKNOWN: &str = "Unknown";

/// Last-known profile metadata for an account.
///
/// Field names follow the remote API's user object so the record can be
/// stored exactly as fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub login: String,
    pub display_name: String,
    pub profile_image_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("malformed profile record: {0}")]
    MalformedProfile(#[from] serde_json::Error),
}

impl Profile {
    pub fn new(id: &str, login: &str, display_name: &str, profile_image_url: &str) -> Self {
        Profile {
            id: id.to_string(),
            login: login.to_string(),
            display_name: display_name.to_string(),
            profile_image_url: profile_image_url.to_string(),
        }
    }

    /// Profile for a peer that was never fetched: all fields empty
    pub fn missing(id: &str) -> Self {
        Profile::new(id, "", "", "")
    }

    /// Profile for a peer whose stored record could not be decoded
    pub fn unknown(id: &str) -> Self {
        Profile::new(id, UNKNOWN, UNKNOWN, UNKNOWN)
    }

    /// Decode a stored profile record
    pub fn from_json(raw: &str) -> Result<Profile, ProfileError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn to_json(&self) -> Result<String, ProfileError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Profile row as persisted, with the time it was last fetched.
/// The payload stays raw until decoded so a bad record never blocks a read.
#[derive(Debug, Clone)]
pub struct CachedProfile {
    pub id: String,
    pub data: String,
    pub fetched_at: DateTime<Utc>,
}

impl CachedProfile {
    pub fn decode(&self) -> Result<Profile, ProfileError> {
        Profile::from_json(&self.data)
    }

    /// Decoded profile, or the "Unknown" sentinel when the record is malformed
    pub fn profile_or_unknown(&self) -> Profile {
        self.decode().unwrap_or_else(|_| Profile::unknown(&self.id))
    }
}

// ============================================================================
// EDGES & CHURN
// ============================================================================

/// One relationship entry as returned by a page fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub peer_id: String,

    /// When the remote platform says the follow happened
    pub followed_at: Option<DateTime<Utc>>,
}

impl PeerEntry {
    pub fn new(peer_id: &str) -> Self {
        PeerEntry {
            peer_id: peer_id.to_string(),
            followed_at: None,
        }
    }
}

/// A live edge: the peer is currently followed / following.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowEdge {
    pub peer_id: String,

    /// Pass time at which the edge was first observed
    pub observed_at: DateTime<Utc>,

    /// Remote follow time, when the API reported one
    pub followed_at: Option<DateTime<Utc>>,

    /// Time of the churn event this edge replaced (peer came back)
    pub rejoined_after: Option<DateTime<Utc>>,
}

impl FollowEdge {
    /// Timestamp used when ordering edges: remote follow time if known
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.followed_at.unwrap_or(self.observed_at)
    }
}

/// A recorded loss of a previously observed edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChurnEvent {
    pub peer_id: String,
    pub changed_at: DateTime<Utc>,
}

// ============================================================================
// RATE LIMIT
// ============================================================================

/// Quota triple reported by the remote API on every response.
/// Any field the response did not carry (or carried unparsable) is `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimit {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_epoch: Option<i64>,
}

impl RateLimit {
    pub fn parse(limit: Option<&str>, remaining: Option<&str>, reset: Option<&str>) -> Self {
        RateLimit {
            limit: limit.and_then(|v| v.trim().parse().ok()),
            remaining: remaining.and_then(|v| v.trim().parse().ok()),
            reset_epoch: reset.and_then(|v| v.trim().parse().ok()),
        }
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.reset_epoch
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_tables_are_disjoint() {
        assert_eq!(Direction::Followers.edge_table(), "followers");
        assert_eq!(Direction::Followers.churn_table(), "unfollowers");
        assert_eq!(Direction::Following.edge_table(), "following");
        assert_eq!(Direction::Following.churn_table(), "unfollowing");
        assert_eq!("Following".parse::<Direction>().unwrap(), Direction::Following);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_profile_decode_rejects_missing_fields() {
        let ok = Profile::from_json(
            r#"{"id":"1","login":"a","display_name":"A","profile_image_url":"u"}"#,
        )
        .unwrap();
        assert_eq!(ok.display_name, "A");

        let err = Profile::from_json(r#"{"id":"1","login":"a"}"#).unwrap_err();
        assert!(matches!(err, ProfileError::MalformedProfile(_)));
    }

    #[test]
    fn test_cached_profile_falls_back_to_unknown() {
        let cached = CachedProfile {
            id: "42".to_string(),
            data: "not json".to_string(),
            fetched_at: Utc::now(),
        };

        let profile = cached.profile_or_unknown();
        assert_eq!(profile.id, "42");
        assert_eq!(profile.login, UNKNOWN);
        assert_eq!(profile.profile_image_url, UNKNOWN);
    }

    #[test]
    fn test_rate_limit_parse_tolerates_missing_headers() {
        let rl = RateLimit::parse(Some("800"), Some("799"), Some("1700000000"));
        assert_eq!(rl.limit, Some(800));
        assert_eq!(rl.remaining, Some(799));
        assert_eq!(rl.reset_at().unwrap().timestamp(), 1_700_000_000);

        let empty = RateLimit::parse(None, Some("abc"), None);
        assert_eq!(empty, RateLimit { limit: None, remaining: None, reset_epoch: None });
        assert!(empty.reset_at().is_none());
    }
}
