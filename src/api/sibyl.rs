use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type RowId = i64;
pub type Score = f64;
pub type Confidence = f64;

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: RowId,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub bio: String,
    pub score: Score,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Market {
    pub id: RowId,
    pub title: String,
    pub description: String,
    pub creator: RowId,
    pub close_date: DateTime<Utc>,
    pub resolve_date: DateTime<Utc>,
    pub state: MarketState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
#[derive(Debug, Clone, PartialEq)]
pub struct NewMarket {
    pub title: String,
    pub description: String,
    pub creator: RowId,
    pub close_date: DateTime<Utc>,
    pub resolve_date: DateTime<Utc>,
}
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub resolve_date: Option<DateTime<Utc>>,
}
/// Lifecycle of a market. The outcome only exists once the market is resolved.
#[derive(PartialEq, Debug, Clone, Copy, Serialize, Deserialize)]
pub enum MarketState {
    Open,
    Closed,
    Resolved(bool),
}
/// Discriminant of [`MarketState`] as stored in the `status` column.
#[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Open,
    Closed,
    Resolved,
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub id: RowId,
    pub user: RowId,
    pub market: RowId,
    pub forecast: bool,
    pub confidence: Confidence,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Forecast {
    pub forecast: bool,
    pub confidence: Confidence,
}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
}
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PredictionCounts {
    pub total: i64,
    pub resolved: i64,
    pub correct: i64,
}
