use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::*;

#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct UserResponse {
    pub id: RowId,
    pub username: String,
    pub email: String,
    pub bio: String,
    pub score: Score,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct UserSummary {
    pub id: RowId,
    pub username: String,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct AuthResponse {
    pub user: UserResponse,
    pub token: String,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct MarketResponse {
    pub id: RowId,
    pub title: String,
    pub description: String,
    pub creator: UserSummary,
    pub close_date: DateTime<Utc>,
    pub resolve_date: DateTime<Utc>,
    pub status: MarketStatus,
    pub outcome: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct ResolveResponse {
    pub market: MarketResponse,
    pub scored: u32,
    pub correct: u32,
}
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone, Copy)]
pub struct PageMeta {
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct MarketsResponse {
    pub markets: Vec<MarketResponse>,
    pub meta: PageMeta,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct PredictionsResponse {
    pub predictions: Vec<Prediction>,
    pub meta: PageMeta,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub id: RowId,
    pub username: String,
    pub bio: String,
    pub score: Score,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct LeaderboardResponse {
    pub leaderboard: Vec<LeaderboardEntry>,
    pub meta: PageMeta,
}
#[derive(PartialEq, Debug, Serialize, Deserialize, Clone)]
pub struct UserStatsResponse {
    pub total_predictions: i64,
    pub resolved_predictions: i64,
    pub correct_predictions: i64,
    pub accuracy: f64,
    pub prediction_score: Score,
    pub recent_predictions: Vec<Prediction>,
}
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub field: Option<String>,
}
