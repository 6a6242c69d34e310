// 🔎 Read Layer - joined, sorted listings over the store
//
// Every listing is (edges | churn) ⋈ users, read in a single read
// transaction. Store order carries no meaning, so anything with a timestamp
// is sorted newest first here (ties broken by id).

use crate::db::{Store, Txn};
use crate::model::{Direction, FollowEdge, Profile};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// One row of any listing, shaped for JSON consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowRecord {
    pub id: String,
    pub login: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "profileImageURL")]
    pub profile_image_url: String,
    #[serde(rename = "followedAt", skip_serializing_if = "Option::is_none")]
    pub followed_at: Option<DateTime<Utc>>,
    #[serde(rename = "unfollowedAt", skip_serializing_if = "Option::is_none")]
    pub unfollowed_at: Option<DateTime<Utc>>,
}

/// Available listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Followers,
    Following,
    Unfollowers,
    Unfollowing,
    Refollowers,
    Refollowing,
    NotFollowingBack,
}

impl View {
    pub fn load(&self, store: &Store) -> Result<Vec<FollowRecord>> {
        match self {
            View::Followers => edges(store, Direction::Followers),
            View::Following => edges(store, Direction::Following),
            View::Unfollowers => churn(store, Direction::Followers),
            View::Unfollowing => churn(store, Direction::Following),
            View::Refollowers => rejoined(store, Direction::Followers),
            View::Refollowing => rejoined(store, Direction::Following),
            View::NotFollowingBack => not_following_back(store),
        }
    }
}

// ============================================================================
// PROFILE JOIN
// ============================================================================

/// Missing profile → empty fields; malformed profile → "Unknown" fields
fn lookup_profile(txn: &Txn<'_>, id: &str) -> Result<Profile> {
    let profile = match txn.profiles().get(id)? {
        Some(cached) => cached.profile_or_unknown(),
        None => Profile::missing(id),
    };
    Ok(profile)
}

fn record(
    profile: Profile,
    id: &str,
    followed_at: Option<DateTime<Utc>>,
    unfollowed_at: Option<DateTime<Utc>>,
) -> FollowRecord {
    FollowRecord {
        // Key is authoritative even if a stored profile disagrees
        id: id.to_string(),
        login: profile.login,
        display_name: profile.display_name,
        profile_image_url: profile.profile_image_url,
        followed_at,
        unfollowed_at,
    }
}

fn edge_record(txn: &Txn<'_>, edge: &FollowEdge) -> Result<FollowRecord> {
    Ok(record(
        lookup_profile(txn, &edge.peer_id)?,
        &edge.peer_id,
        Some(edge.effective_time()),
        edge.rejoined_after,
    ))
}

fn sort_by_followed(records: &mut [FollowRecord]) {
    records.sort_by(|a, b| b.followed_at.cmp(&a.followed_at).then_with(|| a.id.cmp(&b.id)));
}

fn sort_by_unfollowed(records: &mut [FollowRecord]) {
    records.sort_by(|a, b| b.unfollowed_at.cmp(&a.unfollowed_at).then_with(|| a.id.cmp(&b.id)));
}

// ============================================================================
// LISTINGS
// ============================================================================

/// Current followers / following, newest follow first
pub fn edges(store: &Store, direction: Direction) -> Result<Vec<FollowRecord>> {
    let mut records = store.read(|txn| {
        let mut out = Vec::new();
        txn.edges(direction).for_each(|edge| {
            out.push(edge_record(txn, &edge)?);
            Ok(())
        })?;
        Ok(out)
    })?;

    sort_by_followed(&mut records);
    Ok(records)
}

/// Churn history (unfollowers / unfollowing), most recent churn first
pub fn churn(store: &Store, direction: Direction) -> Result<Vec<FollowRecord>> {
    let mut records = store.read(|txn| {
        let mut out = Vec::new();
        txn.churn(direction).for_each(|event| {
            let profile = lookup_profile(txn, &event.peer_id)?;
            out.push(record(profile, &event.peer_id, None, Some(event.changed_at)));
            Ok(())
        })?;
        Ok(out)
    })?;

    sort_by_unfollowed(&mut records);
    Ok(records)
}

/// Peers that churned and later came back, most recent return first
pub fn rejoined(store: &Store, direction: Direction) -> Result<Vec<FollowRecord>> {
    let mut records = store.read(|txn| {
        let mut out = Vec::new();
        txn.edges(direction).for_each(|edge| {
            if edge.rejoined_after.is_some() {
                out.push(record(
                    lookup_profile(txn, &edge.peer_id)?,
                    &edge.peer_id,
                    Some(edge.observed_at),
                    edge.rejoined_after,
                ));
            }
            Ok(())
        })?;
        Ok(out)
    })?;

    sort_by_followed(&mut records);
    Ok(records)
}

/// Accounts we follow that do not follow back
pub fn not_following_back(store: &Store) -> Result<Vec<FollowRecord>> {
    let mut records = store.read(|txn| {
        let followers = txn.edges(Direction::Followers).keys()?;
        let mut out = Vec::new();
        txn.edges(Direction::Following).for_each(|edge| {
            if !followers.contains(&edge.peer_id) {
                out.push(edge_record(txn, &edge)?);
            }
            Ok(())
        })?;
        Ok(out)
    })?;

    sort_by_followed(&mut records);
    Ok(records)
}

/// Numeric ids of the current edges, ascending.
/// Non-numeric keys are skipped with a warning instead of failing the listing.
pub fn edge_ids(store: &Store, direction: Direction) -> Result<Vec<u64>> {
    let keys: HashSet<String> = store.read(|txn| txn.edges(direction).keys())?;

    let mut ids: Vec<u64> = keys
        .iter()
        .filter_map(|k| match k.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(key = %k, %direction, "skipping non-numeric edge key");
                None
            }
        })
        .collect();
    ids.sort_unstable();

    Ok(ids)
}

/// Single profile lookup. `None` when the id was never cached.
pub fn user(store: &Store, id: &str) -> Result<Option<FollowRecord>> {
    store.read(|txn| {
        Ok(txn
            .profiles()
            .get(id)?
            .map(|cached| record(cached.profile_or_unknown(), id, None, None)))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChurnEvent, UNKNOWN};
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn put_edge(store: &Store, direction: Direction, id: &str, at: DateTime<Utc>, rejoined: Option<DateTime<Utc>>) {
        store
            .write(|txn| {
                txn.edges(direction).put(&FollowEdge {
                    peer_id: id.to_string(),
                    observed_at: at,
                    followed_at: None,
                    rejoined_after: rejoined,
                })
            })
            .unwrap();
    }

    fn put_churn(store: &Store, direction: Direction, id: &str, at: DateTime<Utc>) {
        store
            .write(|txn| {
                txn.churn(direction).put(&ChurnEvent {
                    peer_id: id.to_string(),
                    changed_at: at,
                })
            })
            .unwrap();
    }

    #[test]
    fn test_churn_listing_sorts_newest_first() {
        let store = Store::open_in_memory().unwrap();
        put_churn(&store, Direction::Followers, "A", day(2024, 1, 1));
        put_churn(&store, Direction::Followers, "B", day(2024, 3, 1));

        let ids: Vec<String> = churn(&store, Direction::Followers)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();

        assert_eq!(ids, vec!["B", "A"]);
    }

    #[test]
    fn test_missing_profile_yields_empty_fields() {
        let store = Store::open_in_memory().unwrap();
        put_edge(&store, Direction::Followers, "5", day(2024, 1, 1), None);

        let records = edges(&store, Direction::Followers).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "5");
        assert_eq!(records[0].login, "");
        assert_eq!(records[0].display_name, "");
        assert_eq!(records[0].profile_image_url, "");
        assert_eq!(records[0].followed_at, Some(day(2024, 1, 1)));
    }

    #[test]
    fn test_malformed_profile_yields_unknown() {
        let store = Store::open_in_memory().unwrap();
        put_edge(&store, Direction::Following, "6", day(2024, 1, 1), None);
        store
            .write(|txn| txn.profiles().put_raw("6", r#"{"id":"6"}"#, day(2024, 1, 1)))
            .unwrap();

        let records = edges(&store, Direction::Following).unwrap();
        assert_eq!(records[0].login, UNKNOWN);

        let single = user(&store, "6").unwrap().unwrap();
        assert_eq!(single.display_name, UNKNOWN);
    }

    #[test]
    fn test_user_lookup() {
        let store = Store::open_in_memory().unwrap();
        store
            .write(|txn| txn.profiles().put(&Profile::new("9", "nine", "Nine", "https://img/9"), day(2024, 1, 1)))
            .unwrap();

        let found = user(&store, "9").unwrap().unwrap();
        assert_eq!(found.login, "nine");
        assert!(user(&store, "10").unwrap().is_none());

        let json = serde_json::to_value(&found).unwrap();
        assert_eq!(json["displayName"], "Nine");
        assert_eq!(json["profileImageURL"], "https://img/9");
        assert!(json.get("followedAt").is_none());
    }

    #[test]
    fn test_rejoined_and_not_following_back() {
        let store = Store::open_in_memory().unwrap();
        put_edge(&store, Direction::Followers, "1", day(2024, 2, 1), Some(day(2024, 1, 1)));
        put_edge(&store, Direction::Followers, "2", day(2024, 2, 2), None);
        put_edge(&store, Direction::Following, "2", day(2024, 2, 3), None);
        put_edge(&store, Direction::Following, "3", day(2024, 2, 4), None);

        let back = rejoined(&store, Direction::Followers).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].id, "1");
        assert_eq!(back[0].unfollowed_at, Some(day(2024, 1, 1)));

        let lonely: Vec<String> = not_following_back(&store).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(lonely, vec!["3"]);

        let views = [View::Refollowing, View::Unfollowing];
        for view in views {
            assert!(view.load(&store).unwrap().is_empty());
        }
    }

    #[test]
    fn test_edge_ids_are_numeric_and_sorted() {
        let store = Store::open_in_memory().unwrap();
        for id in ["30", "4", "bogus", "200"] {
            put_edge(&store, Direction::Followers, id, day(2024, 1, 1), None);
        }

        assert_eq!(edge_ids(&store, Direction::Followers).unwrap(), vec![4, 30, 200]);
        assert!(edge_ids(&store, Direction::Following).unwrap().is_empty());
    }
}
