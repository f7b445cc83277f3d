use std::fs::File;
use std::path::Path;
use std::str::FromStr;

use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sql_types::{BigInt, Bool, Nullable, Text};
use diesel::{sql_query, Connection, PgConnection, QueryableByName, RunQueryDsl, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use super::channel::{Channel, ChannelStore};
use super::error_rule::{CustomErrorRule, ErrorRuleStore};
use super::json_column;
use super::log::{is_valid_log_table, ConsumptionLog, LogStore};
use super::redemption::{RedeemError, RedeemOutcome, Redemption, RedemptionStore};
use super::stat::{HourFilter, ModelHealthHourly, ModelHealthRank, StatStore, UserCallRank};
use super::subscription::{SubscriptionItem, SubscriptionPlan, SubscriptionStore};
use super::task::{Task, TaskStore};
use super::token::{Token, TokenStore};
use super::user::{User, UserStore};
use super::{DbError, DbResult, SeedStore};
use crate::schema::enum_def::{
    ChannelStatus, ChannelType, LogType, QuotaType, RedemptionStatus, TaskStatus, TokenStatus,
};
use crate::utils::ID_GENERATOR;

const SQLITE_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");
const POSTGRES_MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/postgres");

pub enum DbPool {
    Postgres(Pool<ConnectionManager<PgConnection>>),
    Sqlite(Pool<ConnectionManager<SqliteConnection>>),
}

pub enum DbConnection {
    Postgres(PooledConnection<ConnectionManager<PgConnection>>),
    Sqlite(PooledConnection<ConnectionManager<SqliteConnection>>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    /// Statements are written with `?` placeholders; postgres wants `$n`.
    fn q(self, sql: &str) -> String {
        match self {
            Dialect::Sqlite => sql.to_string(),
            Dialect::Postgres => pg_placeholders(sql),
        }
    }
}

fn pg_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

macro_rules! with_conn {
    ($store:expr, |$conn:ident, $d:ident| $body:block) => {
        match $store.connection()? {
            DbConnection::Sqlite(mut pooled) => {
                let $conn: &mut SqliteConnection = &mut pooled;
                #[allow(unused_variables)]
                let $d = Dialect::Sqlite;
                $body
            }
            DbConnection::Postgres(mut pooled) => {
                let $conn: &mut PgConnection = &mut pooled;
                #[allow(unused_variables)]
                let $d = Dialect::Postgres;
                $body
            }
        }
    };
}

macro_rules! exec {
    ($conn:expr, $sql:expr $(, $ty:ty => $val:expr)* $(,)?) => {
        sql_query($sql) $(.bind::<$ty, _>($val))* .execute($conn)
    };
}

macro_rules! load {
    ($conn:expr, $row:ty, $sql:expr $(, $ty:ty => $val:expr)* $(,)?) => {
        sql_query($sql) $(.bind::<$ty, _>($val))* .load::<$row>($conn)
    };
}

macro_rules! insert_subscription {
    ($conn:expr, $d:expr, $user_id:expr, $plan:expr, $now:expr) => {{
        let subscription_id = ID_GENERATOR.generate_id();
        exec!(
            $conn,
            $d.q("INSERT INTO subscriptions (id, user_id, plan_id, start_time, end_time, status) VALUES (?, ?, ?, ?, ?, 'active')"),
            BigInt => subscription_id,
            BigInt => $user_id,
            Text => $plan.plan_id.clone(),
            BigInt => $now,
            BigInt => $now + $plan.duration_secs,
        )?;
        for item in &$plan.items {
            exec!(
                $conn,
                $d.q("INSERT INTO subscription_items (id, subscription_id, user_id, model_name, quota_type, amount_total, amount_used) VALUES (?, ?, ?, ?, ?, ?, 0)"),
                BigInt => ID_GENERATOR.generate_id(),
                BigInt => subscription_id,
                BigInt => $user_id,
                Text => item.model_name.clone(),
                Text => item.quota_type.to_string(),
                BigInt => item.amount,
            )?;
        }
        subscription_id
    }};
}

macro_rules! insert_log_row {
    ($conn:expr, $d:expr, $table:expr, $log:expr) => {
        exec!(
            $conn,
            $d.q(&format!(
                "INSERT INTO {} (id, user_id, created_at, log_type, content, username, token_id, token_name, channel_id, model_name, upstream_model, quota, prompt_tokens, completion_tokens, thinking_tokens, use_time_ms, is_stream, log_group, request_id, other) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                $table
            )),
            BigInt => $log.id,
            BigInt => $log.user_id,
            BigInt => $log.created_at,
            BigInt => $log.log_type.as_i32() as i64,
            Text => $log.content.clone(),
            Text => $log.username.clone(),
            BigInt => $log.token_id,
            Text => $log.token_name.clone(),
            BigInt => $log.channel_id,
            Text => $log.model_name.clone(),
            Text => $log.upstream_model.clone(),
            BigInt => $log.quota,
            BigInt => $log.prompt_tokens,
            BigInt => $log.completion_tokens,
            BigInt => $log.thinking_tokens,
            BigInt => $log.use_time_ms,
            Bool => $log.is_stream,
            Text => $log.group.clone(),
            Text => $log.request_id.clone(),
            Text => $log.other.to_string(),
        )
    };
}

#[derive(Debug)]
struct SqlitePragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for SqlitePragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute("PRAGMA busy_timeout = 5000; PRAGMA journal_mode = WAL;")
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

pub struct SqlStore {
    pool: DbPool,
}

impl SqlStore {
    pub fn open(db_url: &str) -> DbResult<Self> {
        let pool = if db_url.starts_with("postgres") {
            DbPool::Postgres(init_pg_pool(db_url)?)
        } else {
            DbPool::Sqlite(init_sqlite_pool(db_url)?)
        };
        Ok(Self { pool })
    }

    fn connection(&self) -> DbResult<DbConnection> {
        Ok(match &self.pool {
            DbPool::Postgres(pool) => DbConnection::Postgres(pool.get()?),
            DbPool::Sqlite(pool) => DbConnection::Sqlite(pool.get()?),
        })
    }
}

fn init_sqlite_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<SqliteConnection>>> {
    let db_path = Path::new(db_url);
    if !db_path.exists() {
        if let Some(parent_dir) = db_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                std::fs::create_dir_all(parent_dir)
                    .map_err(|e| DbError::Invalid(format!("failed to create database directory: {}", e)))?;
            }
        }
        File::create(db_path).map_err(|e| DbError::Invalid(format!("failed to create database file: {}", e)))?;
    }

    let mut connection = SqliteConnection::establish(db_url)?;
    connection
        .run_pending_migrations(SQLITE_MIGRATIONS)
        .map_err(|e| DbError::Invalid(format!("failed to run migrations: {}", e)))?;

    let manager = ConnectionManager::<SqliteConnection>::new(db_url);
    Ok(Pool::builder()
        .test_on_check_out(true)
        .connection_customizer(Box::new(SqlitePragmas))
        .max_size(5)
        .build(manager)?)
}

fn init_pg_pool(db_url: &str) -> DbResult<Pool<ConnectionManager<PgConnection>>> {
    let mut connection = PgConnection::establish(db_url)?;
    connection
        .run_pending_migrations(POSTGRES_MIGRATIONS)
        .map_err(|e| DbError::Invalid(format!("failed to run migrations: {}", e)))?;

    let manager = ConnectionManager::<PgConnection>::new(db_url);
    Ok(Pool::builder().max_size(10).build(manager)?)
}

// --- rows ---

#[derive(QueryableByName)]
struct UserRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    username: String,
    #[diesel(sql_type = Text)]
    user_group: String,
    #[diesel(sql_type = BigInt)]
    quota: i64,
    #[diesel(sql_type = BigInt)]
    used_quota: i64,
    #[diesel(sql_type = BigInt)]
    request_count: i64,
    #[diesel(sql_type = Bool)]
    enabled: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            group: row.user_group,
            quota: row.quota,
            used_quota: row.used_quota,
            request_count: row.request_count,
            enabled: row.enabled,
        }
    }
}

#[derive(QueryableByName)]
struct TokenRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = Text)]
    token_key: String,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = BigInt)]
    status: i64,
    #[diesel(sql_type = BigInt)]
    remain_quota: i64,
    #[diesel(sql_type = Bool)]
    unlimited_quota: bool,
    #[diesel(sql_type = BigInt)]
    used_quota: i64,
    #[diesel(sql_type = BigInt)]
    expired_time: i64,
    #[diesel(sql_type = Text)]
    allowed_models: String,
    #[diesel(sql_type = Nullable<Text>)]
    token_group: Option<String>,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            id: row.id,
            user_id: row.user_id,
            key: row.token_key,
            name: row.name,
            status: TokenStatus::from_i32(row.status as i32),
            remain_quota: row.remain_quota,
            unlimited_quota: row.unlimited_quota,
            used_quota: row.used_quota,
            expired_time: row.expired_time,
            allowed_models: json_column(&row.allowed_models),
            group: row.token_group,
        }
    }
}

const TOKEN_COLUMNS: &str = "id, user_id, token_key, name, status, remain_quota, unlimited_quota, used_quota, expired_time, allowed_models, token_group";

#[derive(QueryableByName)]
struct ChannelRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Text)]
    channel_type: String,
    #[diesel(sql_type = Text)]
    base_url: String,
    #[diesel(sql_type = Text)]
    channel_key: String,
    #[diesel(sql_type = BigInt)]
    status: i64,
    #[diesel(sql_type = BigInt)]
    priority: i64,
    #[diesel(sql_type = BigInt)]
    weight: i64,
    #[diesel(sql_type = Text)]
    models: String,
    #[diesel(sql_type = Text)]
    groups_json: String,
    #[diesel(sql_type = Text)]
    model_mapping: String,
    #[diesel(sql_type = Text)]
    settings: String,
    #[diesel(sql_type = Text)]
    param_override: String,
    #[diesel(sql_type = BigInt)]
    used_quota: i64,
}

impl TryFrom<ChannelRow> for Channel {
    type Error = DbError;

    fn try_from(row: ChannelRow) -> Result<Self, Self::Error> {
        let channel_type = ChannelType::from_str(&row.channel_type)
            .map_err(|_| DbError::Invalid(format!("unknown channel type {}", row.channel_type)))?;
        Ok(Channel {
            id: row.id,
            name: row.name,
            channel_type,
            base_url: row.base_url,
            key: row.channel_key,
            status: ChannelStatus::from_i32(row.status as i32),
            priority: row.priority,
            weight: row.weight.max(0) as u32,
            models: json_column(&row.models),
            groups: json_column(&row.groups_json),
            model_mapping: json_column(&row.model_mapping),
            settings: json_column(&row.settings),
            param_override: json_column(&row.param_override),
            used_quota: row.used_quota,
        })
    }
}

#[derive(QueryableByName)]
struct LogRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = BigInt)]
    created_at: i64,
    #[diesel(sql_type = BigInt)]
    log_type: i64,
    #[diesel(sql_type = Text)]
    content: String,
    #[diesel(sql_type = Text)]
    username: String,
    #[diesel(sql_type = BigInt)]
    token_id: i64,
    #[diesel(sql_type = Text)]
    token_name: String,
    #[diesel(sql_type = BigInt)]
    channel_id: i64,
    #[diesel(sql_type = Text)]
    model_name: String,
    #[diesel(sql_type = Text)]
    upstream_model: String,
    #[diesel(sql_type = BigInt)]
    quota: i64,
    #[diesel(sql_type = BigInt)]
    prompt_tokens: i64,
    #[diesel(sql_type = BigInt)]
    completion_tokens: i64,
    #[diesel(sql_type = BigInt)]
    thinking_tokens: i64,
    #[diesel(sql_type = BigInt)]
    use_time_ms: i64,
    #[diesel(sql_type = Bool)]
    is_stream: bool,
    #[diesel(sql_type = Text)]
    log_group: String,
    #[diesel(sql_type = Text)]
    request_id: String,
    #[diesel(sql_type = Text)]
    other: String,
}

impl From<LogRow> for ConsumptionLog {
    fn from(row: LogRow) -> Self {
        ConsumptionLog {
            id: row.id,
            user_id: row.user_id,
            created_at: row.created_at,
            log_type: LogType::from_i32(row.log_type as i32),
            content: row.content,
            username: row.username,
            token_id: row.token_id,
            token_name: row.token_name,
            channel_id: row.channel_id,
            model_name: row.model_name,
            upstream_model: row.upstream_model,
            quota: row.quota,
            prompt_tokens: row.prompt_tokens,
            completion_tokens: row.completion_tokens,
            thinking_tokens: row.thinking_tokens,
            use_time_ms: row.use_time_ms,
            is_stream: row.is_stream,
            group: row.log_group,
            request_id: row.request_id,
            other: serde_json::from_str(&row.other).unwrap_or_default(),
        }
    }
}

#[derive(QueryableByName)]
struct TaskRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    task_id: String,
    #[diesel(sql_type = Text)]
    platform: String,
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = BigInt)]
    token_id: i64,
    #[diesel(sql_type = Text)]
    task_group: String,
    #[diesel(sql_type = BigInt)]
    channel_id: i64,
    #[diesel(sql_type = Text)]
    model: String,
    #[diesel(sql_type = Text)]
    upstream_model: String,
    #[diesel(sql_type = Text)]
    upstream_task_id: String,
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = Text)]
    progress: String,
    #[diesel(sql_type = BigInt)]
    quota: i64,
    #[diesel(sql_type = BigInt)]
    submit_time: i64,
    #[diesel(sql_type = BigInt)]
    start_time: i64,
    #[diesel(sql_type = BigInt)]
    finish_time: i64,
    #[diesel(sql_type = Text)]
    fail_reason: String,
    #[diesel(sql_type = Text)]
    result_url: String,
    #[diesel(sql_type = Text)]
    data: String,
    #[diesel(sql_type = Text)]
    properties: String,
}

impl TryFrom<TaskRow> for Task {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            task_id: row.task_id,
            platform: ChannelType::from_str(&row.platform)
                .map_err(|_| DbError::Invalid(format!("unknown platform {}", row.platform)))?,
            user_id: row.user_id,
            token_id: row.token_id,
            group: row.task_group,
            channel_id: row.channel_id,
            model: row.model,
            upstream_model: row.upstream_model,
            upstream_task_id: row.upstream_task_id,
            status: TaskStatus::from_str(&row.status)
                .map_err(|_| DbError::Invalid(format!("unknown task status {}", row.status)))?,
            progress: row.progress,
            quota: row.quota,
            submit_time: row.submit_time,
            start_time: row.start_time,
            finish_time: row.finish_time,
            fail_reason: row.fail_reason,
            result_url: row.result_url,
            data: serde_json::from_str(&row.data).unwrap_or_default(),
            properties: json_column(&row.properties),
        })
    }
}

const TASK_COLUMNS: &str = "id, task_id, platform, user_id, token_id, task_group, channel_id, model, upstream_model, upstream_task_id, status, progress, quota, submit_time, start_time, finish_time, fail_reason, result_url, data, properties";

#[derive(QueryableByName)]
struct UserCallRow {
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = BigInt)]
    total_calls: i64,
    #[diesel(sql_type = BigInt)]
    success_calls: i64,
}

#[derive(QueryableByName)]
struct ModelHealthRow {
    #[diesel(sql_type = Text)]
    model_name: String,
    #[diesel(sql_type = BigInt)]
    total_calls: i64,
    #[diesel(sql_type = BigInt)]
    success_calls: i64,
    #[diesel(sql_type = BigInt)]
    total_latency_ms: i64,
}

#[derive(QueryableByName)]
struct ModelHealthHourRow {
    #[diesel(sql_type = BigInt)]
    hour_start_ts: i64,
    #[diesel(sql_type = Text)]
    model_name: String,
    #[diesel(sql_type = BigInt)]
    total_calls: i64,
    #[diesel(sql_type = BigInt)]
    success_calls: i64,
}

#[derive(QueryableByName)]
struct ItemRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = BigInt)]
    subscription_id: i64,
    #[diesel(sql_type = BigInt)]
    user_id: i64,
    #[diesel(sql_type = Text)]
    model_name: String,
    #[diesel(sql_type = Text)]
    quota_type: String,
    #[diesel(sql_type = BigInt)]
    amount_total: i64,
    #[diesel(sql_type = BigInt)]
    amount_used: i64,
}

impl From<ItemRow> for SubscriptionItem {
    fn from(row: ItemRow) -> Self {
        SubscriptionItem {
            id: row.id,
            subscription_id: row.subscription_id,
            user_id: row.user_id,
            model_name: row.model_name,
            quota_type: QuotaType::from_str(&row.quota_type).unwrap_or_default(),
            amount_total: row.amount_total,
            amount_used: row.amount_used,
        }
    }
}

#[derive(QueryableByName)]
struct RedemptionRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    redemption_key: String,
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = BigInt)]
    quota: i64,
    #[diesel(sql_type = Nullable<Text>)]
    plan: Option<String>,
    #[diesel(sql_type = BigInt)]
    status: i64,
    #[diesel(sql_type = BigInt)]
    created_at: i64,
    #[diesel(sql_type = BigInt)]
    expired_at: i64,
    #[diesel(sql_type = BigInt)]
    redeemed_at: i64,
    #[diesel(sql_type = BigInt)]
    used_user_id: i64,
}

impl From<RedemptionRow> for Redemption {
    fn from(row: RedemptionRow) -> Self {
        Redemption {
            id: row.id,
            key: row.redemption_key,
            name: row.name,
            quota: row.quota,
            plan: row.plan.as_deref().and_then(|raw| serde_json::from_str(raw).ok()),
            status: RedemptionStatus::from_i32(row.status as i32),
            created_at: row.created_at,
            expired_at: row.expired_at,
            redeemed_at: row.redeemed_at,
            used_user_id: row.used_user_id,
        }
    }
}

#[derive(QueryableByName)]
struct ErrorRuleRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = BigInt)]
    priority: i64,
    #[diesel(sql_type = Text)]
    contains_text: String,
    #[diesel(sql_type = BigInt)]
    status_code: i64,
    #[diesel(sql_type = Text)]
    new_message: String,
    #[diesel(sql_type = Bool)]
    enabled: bool,
}

// --- stores ---

impl UserStore for SqlStore {
    fn get_user(&self, user_id: i64) -> DbResult<Option<User>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                UserRow,
                d.q("SELECT id, username, user_group, quota, used_quota, request_count, enabled FROM users WHERE id = ?"),
                BigInt => user_id,
            )?;
            Ok(rows.into_iter().next().map(User::from))
        })
    }

    fn decrease_user_quota_bounded(&self, user_id: i64, amount: i64) -> DbResult<bool> {
        with_conn!(self, |conn, d| {
            let affected = exec!(
                conn,
                d.q("UPDATE users SET quota = quota - ? WHERE id = ? AND quota >= ?"),
                BigInt => amount,
                BigInt => user_id,
                BigInt => amount,
            )?;
            Ok(affected == 1)
        })
    }

    fn change_user_quota(&self, user_id: i64, delta: i64) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(conn, d.q("UPDATE users SET quota = quota + ? WHERE id = ?"), BigInt => delta, BigInt => user_id)?;
            Ok(())
        })
    }

    fn add_user_usage(&self, user_id: i64, used_quota: i64, request_count: i64) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("UPDATE users SET used_quota = used_quota + ?, request_count = request_count + ? WHERE id = ?"),
                BigInt => used_quota,
                BigInt => request_count,
                BigInt => user_id,
            )?;
            Ok(())
        })
    }
}

impl TokenStore for SqlStore {
    fn get_token_by_key(&self, key: &str) -> DbResult<Option<Token>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                TokenRow,
                d.q(&format!("SELECT {} FROM tokens WHERE token_key = ?", TOKEN_COLUMNS)),
                Text => key.to_string(),
            )?;
            Ok(rows.into_iter().next().map(Token::from))
        })
    }

    fn get_token(&self, token_id: i64) -> DbResult<Option<Token>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                TokenRow,
                d.q(&format!("SELECT {} FROM tokens WHERE id = ?", TOKEN_COLUMNS)),
                BigInt => token_id,
            )?;
            Ok(rows.into_iter().next().map(Token::from))
        })
    }

    fn consume_token_quota_bounded(&self, token_id: i64, amount: i64) -> DbResult<bool> {
        with_conn!(self, |conn, d| {
            let affected = exec!(
                conn,
                d.q("UPDATE tokens SET remain_quota = remain_quota - ?, used_quota = used_quota + ? WHERE id = ? AND remain_quota >= ?"),
                BigInt => amount,
                BigInt => amount,
                BigInt => token_id,
                BigInt => amount,
            )?;
            Ok(affected == 1)
        })
    }

    fn consume_token_quota(&self, token_id: i64, amount: i64) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("UPDATE tokens SET remain_quota = remain_quota - ?, used_quota = used_quota + ? WHERE id = ?"),
                BigInt => amount,
                BigInt => amount,
                BigInt => token_id,
            )?;
            Ok(())
        })
    }
}

impl ChannelStore for SqlStore {
    fn list_channels(&self) -> DbResult<Vec<Channel>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                ChannelRow,
                d.q("SELECT id, name, channel_type, base_url, channel_key, status, priority, weight, models, groups_json, model_mapping, settings, param_override, used_quota FROM channels ORDER BY id"),
            )?;
            rows.into_iter().map(Channel::try_from).collect()
        })
    }

    fn update_channel_status(&self, channel_id: i64, status: ChannelStatus) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("UPDATE channels SET status = ? WHERE id = ?"),
                BigInt => status.as_i32() as i64,
                BigInt => channel_id,
            )?;
            Ok(())
        })
    }

    fn add_channel_used_quota(&self, channel_id: i64, quota: i64) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("UPDATE channels SET used_quota = used_quota + ? WHERE id = ?"),
                BigInt => quota,
                BigInt => channel_id,
            )?;
            Ok(())
        })
    }
}

const SQLITE_LOG_TABLE: &str = "CREATE TABLE IF NOT EXISTS {table} (
    id BIGINT PRIMARY KEY NOT NULL,
    user_id BIGINT NOT NULL,
    created_at BIGINT NOT NULL,
    log_type INTEGER NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    username TEXT NOT NULL DEFAULT '',
    token_id BIGINT NOT NULL DEFAULT 0,
    token_name TEXT NOT NULL DEFAULT '',
    channel_id BIGINT NOT NULL DEFAULT 0,
    model_name TEXT NOT NULL DEFAULT '',
    upstream_model TEXT NOT NULL DEFAULT '',
    quota BIGINT NOT NULL DEFAULT 0,
    prompt_tokens BIGINT NOT NULL DEFAULT 0,
    completion_tokens BIGINT NOT NULL DEFAULT 0,
    thinking_tokens BIGINT NOT NULL DEFAULT 0,
    use_time_ms BIGINT NOT NULL DEFAULT 0,
    is_stream BOOLEAN NOT NULL DEFAULT 0,
    log_group TEXT NOT NULL DEFAULT '',
    request_id TEXT NOT NULL DEFAULT '',
    other TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_{table}_created_id ON {table} (created_at, id);
CREATE INDEX IF NOT EXISTS idx_{table}_created_type ON {table} (created_at, log_type);";

impl LogStore for SqlStore {
    fn ensure_log_table(&self, table: &str) -> DbResult<()> {
        if !is_valid_log_table(table) {
            return Err(DbError::Invalid(format!("invalid log table name: {}", table)));
        }
        match self.connection()? {
            DbConnection::Sqlite(mut conn) => {
                conn.batch_execute(&SQLITE_LOG_TABLE.replace("{table}", table))?;
            }
            DbConnection::Postgres(mut conn) => {
                conn.batch_execute(&format!(
                    "CREATE TABLE IF NOT EXISTS {} (LIKE logs INCLUDING ALL)",
                    table
                ))?;
            }
        }
        Ok(())
    }

    fn insert_logs(&self, table: &str, logs: &[ConsumptionLog]) -> DbResult<()> {
        if !is_valid_log_table(table) {
            return Err(DbError::Invalid(format!("invalid log table name: {}", table)));
        }
        with_conn!(self, |conn, d| {
            conn.transaction::<_, DbError, _>(|tx| {
                for log in logs {
                    insert_log_row!(&mut *tx, d, table, log)?;
                }
                Ok(())
            })
        })
    }

    fn insert_log(&self, table: &str, log: &ConsumptionLog) -> DbResult<()> {
        if !is_valid_log_table(table) {
            return Err(DbError::Invalid(format!("invalid log table name: {}", table)));
        }
        with_conn!(self, |conn, d| {
            insert_log_row!(conn, d, table, log)?;
            Ok(())
        })
    }

    fn list_logs(&self, table: &str, user_id: Option<i64>) -> DbResult<Vec<ConsumptionLog>> {
        if !is_valid_log_table(table) {
            return Err(DbError::Invalid(format!("invalid log table name: {}", table)));
        }
        let base = format!(
            "SELECT id, user_id, created_at, log_type, content, username, token_id, token_name, channel_id, model_name, upstream_model, quota, prompt_tokens, completion_tokens, thinking_tokens, use_time_ms, is_stream, log_group, request_id, other FROM {}",
            table
        );
        with_conn!(self, |conn, d| {
            let rows = match user_id {
                Some(user_id) => load!(
                    conn,
                    LogRow,
                    d.q(&format!("{} WHERE user_id = ? ORDER BY created_at, id", base)),
                    BigInt => user_id,
                )?,
                None => load!(conn, LogRow, format!("{} ORDER BY created_at, id", base))?,
            };
            Ok(rows.into_iter().map(ConsumptionLog::from).collect())
        })
    }
}

impl TaskStore for SqlStore {
    fn insert_task(&self, task: &Task) -> DbResult<()> {
        let data = task.data.to_string();
        let properties = serde_json::to_string(&task.properties)?;
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q(&format!(
                    "INSERT INTO tasks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    TASK_COLUMNS
                )),
                BigInt => task.id,
                Text => task.task_id.clone(),
                Text => task.platform.to_string(),
                BigInt => task.user_id,
                BigInt => task.token_id,
                Text => task.group.clone(),
                BigInt => task.channel_id,
                Text => task.model.clone(),
                Text => task.upstream_model.clone(),
                Text => task.upstream_task_id.clone(),
                Text => task.status.to_string(),
                Text => task.progress.clone(),
                BigInt => task.quota,
                BigInt => task.submit_time,
                BigInt => task.start_time,
                BigInt => task.finish_time,
                Text => task.fail_reason.clone(),
                Text => task.result_url.clone(),
                Text => data.clone(),
                Text => properties.clone(),
            )?;
            Ok(())
        })
    }

    fn get_task(&self, user_id: i64, task_id: &str) -> DbResult<Option<Task>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                TaskRow,
                d.q(&format!("SELECT {} FROM tasks WHERE user_id = ? AND task_id = ?", TASK_COLUMNS)),
                BigInt => user_id,
                Text => task_id.to_string(),
            )?;
            rows.into_iter().next().map(Task::try_from).transpose()
        })
    }

    fn list_tasks(&self, user_id: i64, task_ids: &[String]) -> DbResult<Vec<Task>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            if let Some(task) = self.get_task(user_id, task_id)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    fn list_unfinished_tasks(&self) -> DbResult<Vec<Task>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                TaskRow,
                d.q(&format!(
                    "SELECT {} FROM tasks WHERE status NOT IN ('SUCCESS', 'FAILURE') ORDER BY submit_time",
                    TASK_COLUMNS
                )),
            )?;
            rows.into_iter().map(Task::try_from).collect()
        })
    }

    fn compare_and_update_task(&self, task: &Task, expected: TaskStatus) -> DbResult<bool> {
        let data = task.data.to_string();
        let properties = serde_json::to_string(&task.properties)?;
        with_conn!(self, |conn, d| {
            let affected = exec!(
                conn,
                d.q("UPDATE tasks SET status = ?, progress = ?, quota = ?, start_time = ?, finish_time = ?, fail_reason = ?, result_url = ?, data = ?, properties = ?, upstream_task_id = ? WHERE id = ? AND status = ?"),
                Text => task.status.to_string(),
                Text => task.progress.clone(),
                BigInt => task.quota,
                BigInt => task.start_time,
                BigInt => task.finish_time,
                Text => task.fail_reason.clone(),
                Text => task.result_url.clone(),
                Text => data.clone(),
                Text => properties.clone(),
                Text => task.upstream_task_id.clone(),
                BigInt => task.id,
                Text => expected.to_string(),
            )?;
            Ok(affected == 1)
        })
    }
}

impl StatStore for SqlStore {
    fn record_user_call(&self, hour_start_ts: i64, user_id: i64, success: bool) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("INSERT INTO user_call_hourly (hour_start_ts, user_id, total_calls, success_calls) VALUES (?, ?, 1, ?) ON CONFLICT (hour_start_ts, user_id) DO UPDATE SET total_calls = user_call_hourly.total_calls + 1, success_calls = user_call_hourly.success_calls + excluded.success_calls"),
                BigInt => hour_start_ts,
                BigInt => user_id,
                BigInt => success as i64,
            )?;
            Ok(())
        })
    }

    fn record_model_health(
        &self,
        slice_start_ts: i64,
        model_name: &str,
        success: bool,
        latency_ms: i64,
    ) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("INSERT INTO model_health_slice_5m (model_name, slice_start_ts, total_calls, success_calls, total_latency_ms) VALUES (?, ?, 1, ?, ?) ON CONFLICT (model_name, slice_start_ts) DO UPDATE SET total_calls = model_health_slice_5m.total_calls + 1, success_calls = model_health_slice_5m.success_calls + excluded.success_calls, total_latency_ms = model_health_slice_5m.total_latency_ms + excluded.total_latency_ms"),
                Text => model_name.to_string(),
                BigInt => slice_start_ts,
                BigInt => success as i64,
                BigInt => latency_ms,
            )?;
            Ok(())
        })
    }

    fn query_user_calls(&self, filter: &HourFilter, limit: usize) -> DbResult<Vec<UserCallRank>> {
        let condition = match filter {
            HourFilter::Range { start, end } => format!("hour_start_ts >= {} AND hour_start_ts < {}", start, end),
            HourFilter::List(hours) if hours.is_empty() => return Ok(Vec::new()),
            HourFilter::List(hours) => format!("hour_start_ts IN ({})", HourFilter::hour_list_sql(hours)),
        };
        let sql = format!(
            "SELECT user_id, CAST(SUM(total_calls) AS BIGINT) AS total_calls, CAST(SUM(success_calls) AS BIGINT) AS success_calls FROM user_call_hourly WHERE {} GROUP BY user_id ORDER BY total_calls DESC, user_id ASC LIMIT {}",
            condition, limit
        );
        with_conn!(self, |conn, d| {
            let rows = load!(conn, UserCallRow, sql.clone())?;
            Ok(rows
                .into_iter()
                .map(|row| UserCallRank {
                    user_id: row.user_id,
                    total_calls: row.total_calls,
                    success_calls: row.success_calls,
                })
                .collect())
        })
    }

    fn query_model_health(&self, filter: &HourFilter, limit: usize) -> DbResult<Vec<ModelHealthRank>> {
        let condition = match filter {
            HourFilter::Range { start, end } => format!("slice_start_ts >= {} AND slice_start_ts < {}", start, end),
            HourFilter::List(hours) if hours.is_empty() => return Ok(Vec::new()),
            HourFilter::List(hours) => format!(
                "(slice_start_ts / 3600) * 3600 IN ({})",
                HourFilter::hour_list_sql(hours)
            ),
        };
        let sql = format!(
            "SELECT model_name, CAST(SUM(total_calls) AS BIGINT) AS total_calls, CAST(SUM(success_calls) AS BIGINT) AS success_calls, CAST(SUM(total_latency_ms) AS BIGINT) AS total_latency_ms FROM model_health_slice_5m WHERE {} GROUP BY model_name ORDER BY total_calls DESC, model_name ASC LIMIT {}",
            condition, limit
        );
        with_conn!(self, |conn, d| {
            let rows = load!(conn, ModelHealthRow, sql.clone())?;
            Ok(rows
                .into_iter()
                .map(|row| ModelHealthRank {
                    avg_latency_ms: if row.total_calls > 0 { row.total_latency_ms / row.total_calls } else { 0 },
                    model_name: row.model_name,
                    total_calls: row.total_calls,
                    success_calls: row.success_calls,
                })
                .collect())
        })
    }

    fn query_model_health_hourly(
        &self,
        filter: &HourFilter,
        model_name: Option<&str>,
    ) -> DbResult<Vec<ModelHealthHourly>> {
        let mut condition = match filter {
            HourFilter::Range { start, end } => format!("slice_start_ts >= {} AND slice_start_ts < {}", start, end),
            HourFilter::List(hours) if hours.is_empty() => return Ok(Vec::new()),
            HourFilter::List(hours) => format!(
                "(slice_start_ts / 3600) * 3600 IN ({})",
                HourFilter::hour_list_sql(hours)
            ),
        };
        if model_name.is_some() {
            condition.push_str(" AND model_name = ?");
        }
        let sql = format!(
            "SELECT (slice_start_ts / 3600) * 3600 AS hour_start_ts, model_name, CAST(SUM(total_calls) AS BIGINT) AS total_calls, CAST(SUM(success_calls) AS BIGINT) AS success_calls FROM model_health_slice_5m WHERE {} GROUP BY (slice_start_ts / 3600) * 3600, model_name ORDER BY hour_start_ts, model_name",
            condition
        );
        with_conn!(self, |conn, d| {
            let rows = match model_name {
                Some(model) => load!(conn, ModelHealthHourRow, d.q(&sql), Text => model.to_string())?,
                None => load!(conn, ModelHealthHourRow, sql.clone())?,
            };
            Ok(rows
                .into_iter()
                .map(|row| ModelHealthHourly {
                    hour_start_ts: row.hour_start_ts,
                    model_name: row.model_name,
                    total_calls: row.total_calls,
                    success_calls: row.success_calls,
                })
                .collect())
        })
    }
}

impl SubscriptionStore for SqlStore {
    fn try_consume_subscription(
        &self,
        user_id: i64,
        model_name: &str,
        quota_type: QuotaType,
        amount: i64,
        now: i64,
    ) -> DbResult<Option<i64>> {
        with_conn!(self, |conn, d| {
            let lock = if d == Dialect::Postgres { " FOR UPDATE OF i" } else { "" };
            let select = d.q(&format!(
                "SELECT i.id, i.subscription_id, i.user_id, i.model_name, i.quota_type, i.amount_total, i.amount_used FROM subscription_items i JOIN subscriptions s ON s.id = i.subscription_id WHERE i.user_id = ? AND i.model_name = ? AND i.quota_type = ? AND s.status = 'active' AND s.start_time <= ? AND s.end_time > ? AND i.amount_used + ? <= i.amount_total ORDER BY s.end_time ASC, i.id ASC LIMIT 1{}",
                lock
            ));
            conn.transaction::<_, DbError, _>(|tx| {
                let rows = load!(
                    &mut *tx,
                    ItemRow,
                    select.clone(),
                    BigInt => user_id,
                    Text => model_name.to_string(),
                    Text => quota_type.to_string(),
                    BigInt => now,
                    BigInt => now,
                    BigInt => amount,
                )?;
                let Some(item) = rows.into_iter().next() else {
                    return Ok(None);
                };
                let affected = exec!(
                    &mut *tx,
                    d.q("UPDATE subscription_items SET amount_used = amount_used + ? WHERE id = ? AND amount_used + ? <= amount_total"),
                    BigInt => amount,
                    BigInt => item.id,
                    BigInt => amount,
                )?;
                Ok((affected == 1).then_some(item.id))
            })
        })
    }

    fn adjust_subscription_item(&self, item_id: i64, delta: i64) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("UPDATE subscription_items SET amount_used = amount_used + ? WHERE id = ?"),
                BigInt => delta,
                BigInt => item_id,
            )?;
            Ok(())
        })
    }

    fn create_subscription(&self, user_id: i64, plan: &SubscriptionPlan, now: i64) -> DbResult<i64> {
        with_conn!(self, |conn, d| {
            conn.transaction::<_, DbError, _>(|tx| Ok(insert_subscription!(&mut *tx, d, user_id, plan, now)))
        })
    }

    fn list_subscription_items(&self, user_id: i64) -> DbResult<Vec<SubscriptionItem>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                ItemRow,
                d.q("SELECT id, subscription_id, user_id, model_name, quota_type, amount_total, amount_used FROM subscription_items WHERE user_id = ? ORDER BY id"),
                BigInt => user_id,
            )?;
            Ok(rows.into_iter().map(SubscriptionItem::from).collect())
        })
    }
}

const REDEMPTION_COLUMNS: &str =
    "id, redemption_key, name, quota, plan, status, created_at, expired_at, redeemed_at, used_user_id";

impl RedemptionStore for SqlStore {
    fn redeem(&self, key: &str, user_id: i64, now: i64) -> Result<RedeemOutcome, RedeemError> {
        with_conn!(self, |conn, d| {
            conn.transaction::<_, RedeemError, _>(|tx| {
                let rows = load!(
                    &mut *tx,
                    RedemptionRow,
                    d.q(&format!("SELECT {} FROM redemptions WHERE redemption_key = ?", REDEMPTION_COLUMNS)),
                    Text => key.to_string(),
                )?;
                let redemption = rows.into_iter().next().map(Redemption::from).ok_or(RedeemError::NotFound)?;
                match redemption.status {
                    RedemptionStatus::Used => return Err(RedeemError::Used),
                    RedemptionStatus::Disabled => return Err(RedeemError::Disabled),
                    RedemptionStatus::Enabled => {}
                }
                if redemption.expired_at != 0 && redemption.expired_at < now {
                    return Err(RedeemError::Expired);
                }
                let affected = exec!(
                    &mut *tx,
                    d.q("UPDATE redemptions SET status = ?, redeemed_at = ?, used_user_id = ? WHERE id = ? AND status = ?"),
                    BigInt => RedemptionStatus::Used.as_i32() as i64,
                    BigInt => now,
                    BigInt => user_id,
                    BigInt => redemption.id,
                    BigInt => RedemptionStatus::Enabled.as_i32() as i64,
                )?;
                if affected != 1 {
                    return Err(RedeemError::Used);
                }
                if redemption.quota > 0 {
                    exec!(
                        &mut *tx,
                        d.q("UPDATE users SET quota = quota + ? WHERE id = ?"),
                        BigInt => redemption.quota,
                        BigInt => user_id,
                    )?;
                }
                let subscription_id = match &redemption.plan {
                    Some(plan) => Some(insert_subscription!(&mut *tx, d, user_id, plan, now)),
                    None => None,
                };
                Ok(RedeemOutcome {
                    quota: redemption.quota,
                    subscription_id,
                })
            })
        })
    }

    fn get_redemption(&self, key: &str) -> Result<Option<Redemption>, DbError> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                RedemptionRow,
                d.q(&format!("SELECT {} FROM redemptions WHERE redemption_key = ?", REDEMPTION_COLUMNS)),
                Text => key.to_string(),
            )?;
            Ok(rows.into_iter().next().map(Redemption::from))
        })
    }
}

impl ErrorRuleStore for SqlStore {
    fn list_error_rules(&self) -> DbResult<Vec<CustomErrorRule>> {
        with_conn!(self, |conn, d| {
            let rows = load!(
                conn,
                ErrorRuleRow,
                d.q("SELECT id, priority, contains_text, status_code, new_message, enabled FROM custom_error_rules ORDER BY priority, id"),
            )?;
            Ok(rows
                .into_iter()
                .map(|row| CustomErrorRule {
                    id: row.id,
                    priority: row.priority,
                    contains: row.contains_text,
                    status_code: row.status_code.clamp(0, u16::MAX as i64) as u16,
                    new_message: row.new_message,
                    enabled: row.enabled,
                })
                .collect())
        })
    }
}

impl SeedStore for SqlStore {
    fn upsert_channel(&self, channel: &Channel) -> DbResult<()> {
        let models = serde_json::to_string(&channel.models)?;
        let groups = serde_json::to_string(&channel.groups)?;
        let mapping = serde_json::to_string(&channel.model_mapping)?;
        let settings = serde_json::to_string(&channel.settings)?;
        let param_override = serde_json::to_string(&channel.param_override)?;
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("INSERT INTO channels (id, name, channel_type, base_url, channel_key, status, priority, weight, models, groups_json, model_mapping, settings, param_override, used_quota) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO UPDATE SET name = excluded.name, channel_type = excluded.channel_type, base_url = excluded.base_url, channel_key = excluded.channel_key, status = excluded.status, priority = excluded.priority, weight = excluded.weight, models = excluded.models, groups_json = excluded.groups_json, model_mapping = excluded.model_mapping, settings = excluded.settings, param_override = excluded.param_override"),
                BigInt => channel.id,
                Text => channel.name.clone(),
                Text => channel.channel_type.to_string(),
                Text => channel.base_url.clone(),
                Text => channel.key.clone(),
                BigInt => channel.status.as_i32() as i64,
                BigInt => channel.priority,
                BigInt => channel.weight as i64,
                Text => models.clone(),
                Text => groups.clone(),
                Text => mapping.clone(),
                Text => settings.clone(),
                Text => param_override.clone(),
                BigInt => channel.used_quota,
            )?;
            Ok(())
        })
    }

    fn upsert_user(&self, user: &User) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("INSERT INTO users (id, username, user_group, quota, used_quota, request_count, enabled) VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO UPDATE SET username = excluded.username, user_group = excluded.user_group, quota = excluded.quota, enabled = excluded.enabled"),
                BigInt => user.id,
                Text => user.username.clone(),
                Text => user.group.clone(),
                BigInt => user.quota,
                BigInt => user.used_quota,
                BigInt => user.request_count,
                Bool => user.enabled,
            )?;
            Ok(())
        })
    }

    fn upsert_token(&self, token: &Token) -> DbResult<()> {
        let allowed_models = serde_json::to_string(&token.allowed_models)?;
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q(&format!("INSERT INTO tokens ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO UPDATE SET user_id = excluded.user_id, token_key = excluded.token_key, name = excluded.name, status = excluded.status, remain_quota = excluded.remain_quota, unlimited_quota = excluded.unlimited_quota, expired_time = excluded.expired_time, allowed_models = excluded.allowed_models, token_group = excluded.token_group", TOKEN_COLUMNS)),
                BigInt => token.id,
                BigInt => token.user_id,
                Text => token.key.clone(),
                Text => token.name.clone(),
                BigInt => token.status.as_i32() as i64,
                BigInt => token.remain_quota,
                Bool => token.unlimited_quota,
                BigInt => token.used_quota,
                BigInt => token.expired_time,
                Text => allowed_models.clone(),
                Nullable<Text> => token.group.clone(),
            )?;
            Ok(())
        })
    }

    fn upsert_error_rule(&self, rule: &CustomErrorRule) -> DbResult<()> {
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q("INSERT INTO custom_error_rules (id, priority, contains_text, status_code, new_message, enabled) VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO UPDATE SET priority = excluded.priority, contains_text = excluded.contains_text, status_code = excluded.status_code, new_message = excluded.new_message, enabled = excluded.enabled"),
                BigInt => rule.id,
                BigInt => rule.priority,
                Text => rule.contains.clone(),
                BigInt => rule.status_code as i64,
                Text => rule.new_message.clone(),
                Bool => rule.enabled,
            )?;
            Ok(())
        })
    }

    fn upsert_redemption(&self, redemption: &Redemption) -> DbResult<()> {
        let plan = redemption.plan.as_ref().map(serde_json::to_string).transpose()?;
        with_conn!(self, |conn, d| {
            exec!(
                conn,
                d.q(&format!("INSERT INTO redemptions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (id) DO UPDATE SET name = excluded.name, quota = excluded.quota, plan = excluded.plan, status = excluded.status, expired_at = excluded.expired_at", REDEMPTION_COLUMNS)),
                BigInt => redemption.id,
                Text => redemption.key.clone(),
                Text => redemption.name.clone(),
                BigInt => redemption.quota,
                Nullable<Text> => plan.clone(),
                BigInt => redemption.status.as_i32() as i64,
                BigInt => redemption.created_at,
                BigInt => redemption.expired_at,
                BigInt => redemption.redeemed_at,
                BigInt => redemption.used_user_id,
            )?;
            Ok(())
        })
    }
}
