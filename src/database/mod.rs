use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

pub mod channel;
pub mod error_rule;
pub mod log;
pub mod memory;
pub mod redemption;
pub mod sql;
pub mod stat;
pub mod subscription;
pub mod task;
pub mod token;
pub mod user;

use self::{
    channel::ChannelStore, error_rule::ErrorRuleStore, log::LogStore, redemption::RedemptionStore,
    stat::StatStore, subscription::SubscriptionStore, task::TaskStore, token::TokenStore,
    user::UserStore,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Query(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Admin-side writes used by the bootstrap loader and tests.
pub trait SeedStore {
    fn upsert_channel(&self, channel: &channel::Channel) -> DbResult<()>;
    fn upsert_user(&self, user: &user::User) -> DbResult<()>;
    fn upsert_token(&self, token: &token::Token) -> DbResult<()>;
    fn upsert_error_rule(&self, rule: &error_rule::CustomErrorRule) -> DbResult<()>;
    fn upsert_redemption(&self, redemption: &redemption::Redemption) -> DbResult<()>;
}

pub trait Store:
    UserStore
    + TokenStore
    + ChannelStore
    + LogStore
    + TaskStore
    + StatStore
    + SubscriptionStore
    + RedemptionStore
    + ErrorRuleStore
    + SeedStore
    + Send
    + Sync
{
}

impl<T> Store for T where
    T: UserStore
        + TokenStore
        + ChannelStore
        + LogStore
        + TaskStore
        + StatStore
        + SubscriptionStore
        + RedemptionStore
        + ErrorRuleStore
        + SeedStore
        + Send
        + Sync
{
}

pub type SharedStore = Arc<dyn Store>;

/// Opens the backend named by `db_url`: `memory`, a sqlite path, or a postgres url.
pub fn open_store(db_url: &str) -> DbResult<SharedStore> {
    if db_url == "memory" {
        return Ok(Arc::new(memory::MemoryStore::new()));
    }
    Ok(Arc::new(sql::SqlStore::open(db_url)?))
}

#[derive(Serialize, Debug)]
pub struct ListResult<T> {
    pub total: i64,
    pub list: Vec<T>,
}

/// Decodes a JSON text column, falling back to the type's default on garbage.
pub(crate) fn json_column<T: serde::de::DeserializeOwned + Default>(raw: &str) -> T {
    if raw.is_empty() {
        return T::default();
    }
    serde_json::from_str(raw).unwrap_or_default()
}
