use crate::api::*;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use log::debug;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{query, Executor, Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

/// Reads and writes of accounts, markets and predictions. Nothing here touches
/// `accounts.score`; see [`ResolutionStore`].
#[async_trait]
pub trait DB {
    async fn create_account(&self, account: NewAccount) -> Result<RowId>;
    async fn get_account(&self, account: RowId) -> Result<Option<Account>>;
    async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>>;
    async fn get_account_by_username(&self, username: &str) -> Result<Option<Account>>;
    async fn update_profile(
        &self,
        account: RowId,
        username: Option<String>,
        bio: Option<String>,
    ) -> Result<()>;
    async fn get_leaderboard(&self, pagination: Pagination) -> Result<(Vec<Account>, i64)>;

    async fn add_market(&self, market: NewMarket) -> Result<RowId>;
    async fn get_market(&self, market: RowId) -> Result<Option<Market>>;
    async fn get_markets(
        &self,
        status: Option<MarketStatus>,
        pagination: Pagination,
    ) -> Result<(Vec<Market>, i64)>;
    /// Returns false if the market is resolved or missing.
    async fn update_market(&self, market: RowId, changes: MarketChanges) -> Result<bool>;
    /// Returns false unless the market was Open.
    async fn close_market(&self, market: RowId) -> Result<bool>;

    async fn get_prediction(&self, prediction: RowId) -> Result<Option<Prediction>>;
    async fn get_user_prediction(&self, user: RowId, market: RowId)
        -> Result<Option<Prediction>>;
    /// Inserts or overwrites the prediction of `user` on `market`, returning it
    /// with whether this call inserted the row. Returns `None` without writing
    /// anything if the market is not Open.
    async fn upsert_prediction(
        &self,
        user: RowId,
        market: RowId,
        forecast: Forecast,
    ) -> Result<Option<(Prediction, bool)>>;
    /// Returns `None` without writing anything if the market is not Open.
    async fn update_prediction(
        &self,
        prediction: RowId,
        forecast: Forecast,
    ) -> Result<Option<Prediction>>;
    async fn get_market_predictions(
        &self,
        market: RowId,
        pagination: Pagination,
    ) -> Result<(Vec<Prediction>, i64)>;
    async fn get_prediction_counts(&self, user: RowId) -> Result<PredictionCounts>;
    async fn get_recent_predictions(&self, user: RowId, limit: i64) -> Result<Vec<Prediction>>;
}

/// Storage seam of the resolution engine and the only way to change a score.
#[async_trait]
pub trait ResolutionStore {
    async fn load_market(&self, market: RowId) -> Result<Option<Market>>;
    async fn begin_resolution(&self) -> Result<Box<dyn ResolutionTx + Send>>;
}

/// Unit of work of a single resolution. Dropping it without `commit` rolls back.
#[async_trait]
pub trait ResolutionTx {
    /// Marks the market resolved unless it already is. `None` means nothing was
    /// changed because the market is missing or was resolved first by someone else.
    async fn claim_market(
        &mut self,
        market: RowId,
        outcome: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Market>>;
    async fn market_predictions(&mut self, market: RowId) -> Result<Vec<Prediction>>;
    async fn add_to_score(&mut self, user: RowId, delta: Score, at: DateTime<Utc>) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

const ACCOUNT_COLUMNS: &str =
    "id, username, email, password_hash, bio, score, created_at, updated_at";
const MARKET_COLUMNS: &str = "id, title, description, creator_id, close_date, resolve_date, \
    status, outcome, created_at, updated_at";
const PREDICTION_COLUMNS: &str =
    "id, user_id, market_id, forecast, confidence, created_at, updated_at";

#[derive(Clone)]
pub struct SQLite {
    connection: SqlitePool,
}
impl SQLite {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid database url {}", url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }
        // An in-memory database lives only as long as its connection.
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };
        let connection = pool
            .connect_with(options)
            .await
            .with_context(|| format!("couldn't connect to {}", url))?;
        let db = Self { connection };
        db.migrate().await?;
        debug!("Connected to database {}", url);
        Ok(db)
    }
    async fn migrate(&self) -> Result<()> {
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS accounts (\
                id INTEGER PRIMARY KEY,\
                username TEXT NOT NULL UNIQUE,\
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,\
                password_hash TEXT NOT NULL,\
                bio TEXT NOT NULL DEFAULT '',\
                score REAL NOT NULL DEFAULT 0,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL\
                )",
            )
            .await
            .context("couldn't create accounts table")?;
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS markets (\
                id INTEGER PRIMARY KEY,\
                title TEXT NOT NULL,\
                description TEXT NOT NULL,\
                creator_id INTEGER NOT NULL REFERENCES accounts(id),\
                close_date INTEGER NOT NULL,\
                resolve_date INTEGER NOT NULL,\
                status TEXT NOT NULL DEFAULT 'Open',\
                outcome INTEGER,\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL,\
                CHECK ((status = 'Resolved') = (outcome IS NOT NULL))\
                )",
            )
            .await
            .context("couldn't create markets table")?;
        self.connection
            .execute(
                "CREATE TABLE IF NOT EXISTS predictions (\
                id INTEGER PRIMARY KEY,\
                user_id INTEGER NOT NULL REFERENCES accounts(id),\
                market_id INTEGER NOT NULL REFERENCES markets(id),\
                forecast INTEGER NOT NULL,\
                confidence REAL NOT NULL CHECK (confidence BETWEEN 0 AND 100),\
                created_at INTEGER NOT NULL,\
                updated_at INTEGER NOT NULL,\
                revision INTEGER NOT NULL DEFAULT 0,\
                UNIQUE (user_id, market_id)\
                )",
            )
            .await
            .context("couldn't create predictions table")?;
        self.connection
            .execute("CREATE INDEX IF NOT EXISTS predictions_market ON predictions (market_id)")
            .await
            .context("couldn't create predictions index")?;
        Ok(())
    }
}
#[async_trait]
impl DB for SQLite {
    async fn create_account(&self, account: NewAccount) -> Result<RowId> {
        let now = Utc::now().timestamp();
        let id = self
            .connection
            .execute(
                query(
                    "INSERT INTO accounts (\
                    username,\
                    email,\
                    password_hash,\
                    created_at,\
                    updated_at)\
                    VALUES (?,?,?,?,?)",
                )
                .bind(account.username.clone())
                .bind(account.email.clone())
                .bind(account.password_hash)
                .bind(now)
                .bind(now),
            )
            .await
            .with_context(|| format!("couldn't create account {}", account.username))?
            .last_insert_rowid();
        Ok(id)
    }
    async fn get_account(&self, account: RowId) -> Result<Option<Account>> {
        let stmt = format!("SELECT {} FROM accounts WHERE id = ?", ACCOUNT_COLUMNS);
        self.connection
            .fetch_optional(query(&stmt).bind(account))
            .await
            .with_context(|| format!("couldn't get account {}", account))?
            .map(|row| account_from_row(&row))
            .transpose()
    }
    async fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let stmt = format!("SELECT {} FROM accounts WHERE email = ?", ACCOUNT_COLUMNS);
        self.connection
            .fetch_optional(query(&stmt).bind(email))
            .await
            .context("couldn't look up account by email")?
            .map(|row| account_from_row(&row))
            .transpose()
    }
    async fn get_account_by_username(&self, username: &str) -> Result<Option<Account>> {
        let stmt = format!("SELECT {} FROM accounts WHERE username = ?", ACCOUNT_COLUMNS);
        self.connection
            .fetch_optional(query(&stmt).bind(username))
            .await
            .with_context(|| format!("couldn't look up account {}", username))?
            .map(|row| account_from_row(&row))
            .transpose()
    }
    async fn update_profile(
        &self,
        account: RowId,
        username: Option<String>,
        bio: Option<String>,
    ) -> Result<()> {
        let stmt = query(
            "UPDATE accounts SET \
            username = COALESCE(?, username), \
            bio = COALESCE(?, bio), \
            updated_at = ? \
            WHERE id = ?",
        );
        self.connection
            .execute(
                stmt.bind(username)
                    .bind(bio)
                    .bind(Utc::now().timestamp())
                    .bind(account),
            )
            .await
            .with_context(|| format!("couldn't update profile of account {}", account))?;
        Ok(())
    }
    async fn get_leaderboard(&self, pagination: Pagination) -> Result<(Vec<Account>, i64)> {
        let total: i64 = self
            .connection
            .fetch_one(query("SELECT COUNT(*) FROM accounts"))
            .await?
            .try_get(0)?;
        let stmt = format!(
            "SELECT {} FROM accounts ORDER BY score DESC, id ASC LIMIT ? OFFSET ?",
            ACCOUNT_COLUMNS
        );
        let rows = self
            .connection
            .fetch_all(
                query(&stmt)
                    .bind(pagination.limit)
                    .bind(pagination.offset()),
            )
            .await
            .context("couldn't get leaderboard")?;
        let accounts = rows
            .iter()
            .map(account_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((accounts, total))
    }
    async fn add_market(&self, market: NewMarket) -> Result<RowId> {
        let now = Utc::now().timestamp();
        let id = self
            .connection
            .execute(
                query(
                    "INSERT INTO markets (\
                    title,\
                    description,\
                    creator_id,\
                    close_date,\
                    resolve_date,\
                    status,\
                    created_at,\
                    updated_at)\
                    VALUES (?,?,?,?,?,?,?,?)",
                )
                .bind(market.title)
                .bind(market.description)
                .bind(market.creator)
                .bind(market.close_date.timestamp())
                .bind(market.resolve_date.timestamp())
                .bind(MarketStatus::Open.to_string())
                .bind(now)
                .bind(now),
            )
            .await
            .context("couldn't add market")?
            .last_insert_rowid();
        Ok(id)
    }
    async fn get_market(&self, market: RowId) -> Result<Option<Market>> {
        let stmt = format!("SELECT {} FROM markets WHERE id = ?", MARKET_COLUMNS);
        self.connection
            .fetch_optional(query(&stmt).bind(market))
            .await
            .with_context(|| format!("couldn't get market {}", market))?
            .map(|row| market_from_row(&row))
            .transpose()
    }
    async fn get_markets(
        &self,
        status: Option<MarketStatus>,
        pagination: Pagination,
    ) -> Result<(Vec<Market>, i64)> {
        let status = status.map(|status| status.to_string());
        let total: i64 = self
            .connection
            .fetch_one(
                query("SELECT COUNT(*) FROM markets WHERE (? IS NULL OR status = ?)")
                    .bind(status.clone())
                    .bind(status.clone()),
            )
            .await?
            .try_get(0)?;
        let stmt = format!(
            "SELECT {} FROM markets \
            WHERE (? IS NULL OR status = ?) \
            ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            MARKET_COLUMNS
        );
        let rows = self
            .connection
            .fetch_all(
                query(&stmt)
                    .bind(status.clone())
                    .bind(status)
                    .bind(pagination.limit)
                    .bind(pagination.offset()),
            )
            .await
            .context("couldn't list markets")?;
        let markets = rows
            .iter()
            .map(market_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((markets, total))
    }
    async fn update_market(&self, market: RowId, changes: MarketChanges) -> Result<bool> {
        let stmt = query(
            "UPDATE markets SET \
            title = COALESCE(?, title), \
            description = COALESCE(?, description), \
            close_date = COALESCE(?, close_date), \
            resolve_date = COALESCE(?, resolve_date), \
            updated_at = ? \
            WHERE id = ? AND status != 'Resolved'",
        );
        let result = self
            .connection
            .execute(
                stmt.bind(changes.title)
                    .bind(changes.description)
                    .bind(changes.close_date.map(|date| date.timestamp()))
                    .bind(changes.resolve_date.map(|date| date.timestamp()))
                    .bind(Utc::now().timestamp())
                    .bind(market),
            )
            .await
            .with_context(|| format!("couldn't update market {}", market))?;
        Ok(result.rows_affected() == 1)
    }
    async fn close_market(&self, market: RowId) -> Result<bool> {
        let result = self
            .connection
            .execute(
                query(
                    "UPDATE markets SET \
                    status = 'Closed', \
                    updated_at = ? \
                    WHERE id = ? AND status = 'Open'",
                )
                .bind(Utc::now().timestamp())
                .bind(market),
            )
            .await
            .with_context(|| format!("couldn't close market {}", market))?;
        Ok(result.rows_affected() == 1)
    }
    async fn get_prediction(&self, prediction: RowId) -> Result<Option<Prediction>> {
        let stmt = format!("SELECT {} FROM predictions WHERE id = ?", PREDICTION_COLUMNS);
        self.connection
            .fetch_optional(query(&stmt).bind(prediction))
            .await
            .with_context(|| format!("couldn't get prediction {}", prediction))?
            .map(|row| prediction_from_row(&row))
            .transpose()
    }
    async fn get_user_prediction(
        &self,
        user: RowId,
        market: RowId,
    ) -> Result<Option<Prediction>> {
        let stmt = format!(
            "SELECT {} FROM predictions WHERE user_id = ? AND market_id = ?",
            PREDICTION_COLUMNS
        );
        self.connection
            .fetch_optional(query(&stmt).bind(user).bind(market))
            .await
            .with_context(|| {
                format!(
                    "couldn't get prediction of user {} on market {}",
                    user, market
                )
            })?
            .map(|row| prediction_from_row(&row))
            .transpose()
    }
    async fn upsert_prediction(
        &self,
        user: RowId,
        market: RowId,
        forecast: Forecast,
    ) -> Result<Option<(Prediction, bool)>> {
        let now = Utc::now().timestamp();
        // The WHERE clause also disambiguates the upsert's ON from a join constraint.
        let stmt = format!(
            "INSERT INTO predictions (\
            user_id,\
            market_id,\
            forecast,\
            confidence,\
            created_at,\
            updated_at) \
            SELECT ?,?,?,?,?,? \
            WHERE EXISTS (SELECT 1 FROM markets WHERE id = ? AND status = 'Open') \
            ON CONFLICT (user_id, market_id) DO UPDATE SET \
            forecast = excluded.forecast, \
            confidence = excluded.confidence, \
            updated_at = excluded.updated_at, \
            revision = revision + 1 \
            RETURNING {}, revision",
            PREDICTION_COLUMNS
        );
        self.connection
            .fetch_optional(
                query(&stmt)
                    .bind(user)
                    .bind(market)
                    .bind(forecast.forecast)
                    .bind(forecast.confidence)
                    .bind(now)
                    .bind(now)
                    .bind(market),
            )
            .await
            .with_context(|| {
                format!(
                    "couldn't store prediction of user {} on market {}",
                    user, market
                )
            })?
            .map(|row| -> Result<(Prediction, bool)> {
                let revision: i64 = row.try_get("revision")?;
                Ok((prediction_from_row(&row)?, revision == 0))
            })
            .transpose()
    }
    async fn update_prediction(
        &self,
        prediction: RowId,
        forecast: Forecast,
    ) -> Result<Option<Prediction>> {
        let stmt = format!(
            "UPDATE predictions SET \
            forecast = ?, \
            confidence = ?, \
            updated_at = ?, \
            revision = revision + 1 \
            WHERE id = ? AND EXISTS (\
            SELECT 1 FROM markets \
            WHERE markets.id = predictions.market_id AND markets.status = 'Open') \
            RETURNING {}",
            PREDICTION_COLUMNS
        );
        self.connection
            .fetch_optional(
                query(&stmt)
                    .bind(forecast.forecast)
                    .bind(forecast.confidence)
                    .bind(Utc::now().timestamp())
                    .bind(prediction),
            )
            .await
            .with_context(|| format!("couldn't update prediction {}", prediction))?
            .map(|row| prediction_from_row(&row))
            .transpose()
    }
    async fn get_market_predictions(
        &self,
        market: RowId,
        pagination: Pagination,
    ) -> Result<(Vec<Prediction>, i64)> {
        let total: i64 = self
            .connection
            .fetch_one(query("SELECT COUNT(*) FROM predictions WHERE market_id = ?").bind(market))
            .await?
            .try_get(0)?;
        let stmt = format!(
            "SELECT {} FROM predictions WHERE market_id = ? \
            ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
            PREDICTION_COLUMNS
        );
        let rows = self
            .connection
            .fetch_all(
                query(&stmt)
                    .bind(market)
                    .bind(pagination.limit)
                    .bind(pagination.offset()),
            )
            .await
            .with_context(|| format!("couldn't list predictions of market {}", market))?;
        let predictions = rows
            .iter()
            .map(prediction_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((predictions, total))
    }
    async fn get_prediction_counts(&self, user: RowId) -> Result<PredictionCounts> {
        let stmt = query(
            "SELECT COUNT(*) AS total, \
            COALESCE(SUM(CASE WHEN m.status = 'Resolved' THEN 1 ELSE 0 END), 0) AS resolved, \
            COALESCE(SUM(CASE WHEN m.status = 'Resolved' AND m.outcome = p.forecast \
            THEN 1 ELSE 0 END), 0) AS correct \
            FROM predictions p \
            JOIN markets m ON m.id = p.market_id \
            WHERE p.user_id = ?",
        );
        let row = self
            .connection
            .fetch_one(stmt.bind(user))
            .await
            .with_context(|| format!("couldn't count predictions of user {}", user))?;
        Ok(PredictionCounts {
            total: row.try_get("total")?,
            resolved: row.try_get("resolved")?,
            correct: row.try_get("correct")?,
        })
    }
    async fn get_recent_predictions(&self, user: RowId, limit: i64) -> Result<Vec<Prediction>> {
        let stmt = format!(
            "SELECT {} FROM predictions WHERE user_id = ? \
            ORDER BY created_at DESC, id DESC LIMIT ?",
            PREDICTION_COLUMNS
        );
        let rows = self
            .connection
            .fetch_all(query(&stmt).bind(user).bind(limit))
            .await
            .with_context(|| format!("couldn't get recent predictions of user {}", user))?;
        rows.iter().map(prediction_from_row).collect()
    }
}

#[async_trait]
impl ResolutionStore for SQLite {
    async fn load_market(&self, market: RowId) -> Result<Option<Market>> {
        DB::get_market(self, market).await
    }
    async fn begin_resolution(&self) -> Result<Box<dyn ResolutionTx + Send>> {
        let tx = self
            .connection
            .begin()
            .await
            .context("couldn't begin resolution transaction")?;
        Ok(Box::new(SQLiteResolution { tx }))
    }
}

pub struct SQLiteResolution {
    tx: Transaction<'static, Sqlite>,
}
#[async_trait]
impl ResolutionTx for SQLiteResolution {
    async fn claim_market(
        &mut self,
        market: RowId,
        outcome: bool,
        at: DateTime<Utc>,
    ) -> Result<Option<Market>> {
        // First statement of the transaction: takes the write lock and checks the
        // status in one step, so two resolutions of one market cannot both pass.
        let stmt = format!(
            "UPDATE markets SET \
            status = 'Resolved', \
            outcome = ?, \
            updated_at = ? \
            WHERE id = ? AND status != 'Resolved' \
            RETURNING {}",
            MARKET_COLUMNS
        );
        query(&stmt)
            .bind(outcome)
            .bind(at.timestamp())
            .bind(market)
            .fetch_optional(&mut *self.tx)
            .await
            .with_context(|| format!("couldn't claim market {} for resolution", market))?
            .map(|row| market_from_row(&row))
            .transpose()
    }
    async fn market_predictions(&mut self, market: RowId) -> Result<Vec<Prediction>> {
        let stmt = format!(
            "SELECT {} FROM predictions WHERE market_id = ? ORDER BY id",
            PREDICTION_COLUMNS
        );
        let rows = query(&stmt)
            .bind(market)
            .fetch_all(&mut *self.tx)
            .await
            .with_context(|| format!("couldn't load predictions of market {}", market))?;
        rows.iter().map(prediction_from_row).collect()
    }
    async fn add_to_score(&mut self, user: RowId, delta: Score, at: DateTime<Utc>) -> Result<()> {
        let result = query(
            "UPDATE accounts SET \
            score = score + ?, \
            updated_at = ? \
            WHERE id = ?",
        )
        .bind(delta)
        .bind(at.timestamp())
        .bind(user)
        .execute(&mut *self.tx)
        .await
        .with_context(|| format!("couldn't update score of account {}", user))?;
        if result.rows_affected() != 1 {
            bail!("Account {} of a scored prediction doesn't exist", user);
        }
        Ok(())
    }
    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .context("couldn't commit resolution")
    }
    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .context("couldn't roll back resolution")
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .with_context(|| format!("invalid timestamp {} in database", secs))
}
fn account_from_row(row: &SqliteRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        bio: row.try_get("bio")?,
        score: row.try_get("score")?,
        created_at: timestamp(row.try_get("created_at")?)?,
        updated_at: timestamp(row.try_get("updated_at")?)?,
    })
}
fn market_from_row(row: &SqliteRow) -> Result<Market> {
    let status: String = row.try_get("status")?;
    let outcome: Option<bool> = row.try_get("outcome")?;
    Ok(Market {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        creator: row.try_get("creator_id")?,
        close_date: timestamp(row.try_get("close_date")?)?,
        resolve_date: timestamp(row.try_get("resolve_date")?)?,
        state: MarketState::from_columns(&status, outcome)?,
        created_at: timestamp(row.try_get("created_at")?)?,
        updated_at: timestamp(row.try_get("updated_at")?)?,
    })
}
fn prediction_from_row(row: &SqliteRow) -> Result<Prediction> {
    Ok(Prediction {
        id: row.try_get("id")?,
        user: row.try_get("user_id")?,
        market: row.try_get("market_id")?,
        forecast: row.try_get("forecast")?,
        confidence: row.try_get("confidence")?,
        created_at: timestamp(row.try_get("created_at")?)?,
        updated_at: timestamp(row.try_get("updated_at")?)?,
    })
}
