// Follow Tracker - Core Library
// Snapshot sync + diff engine for follower / following churn, shared by the CLI and tests

pub mod model;    // Profiles, edges, churn events, quota
pub mod db;       // Store handle, schema, key-value views, account binding, pass audit log
pub mod client;   // Remote follow API (trait + Helix client)
pub mod sync;     // Synchronization engine
pub mod queries;  // Read layer: joined, sorted listings
pub mod config;   // Environment configuration

// Re-export commonly used types
pub use model::{
    Direction, Profile, ProfileError, CachedProfile,
    FollowEdge, ChurnEvent, PeerEntry, RateLimit,
};
pub use db::{
    Store, Txn, TrackedAccount, EdgeStore, ChurnStore, ProfileCache,
    PassLog, PassRecord, PassStatus, setup_database,
};
pub use client::{
    FollowApi, TwitchClient, FetchError, Page, Fetched,
    parse_follows_page, parse_users,
};
pub use sync::{
    SyncEngine, SyncOptions, SyncError, PassReport, PassLocks, PassGuard,
    Diff, pacing_delay, retry_delay,
};
pub use queries::{FollowRecord, View};
pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
