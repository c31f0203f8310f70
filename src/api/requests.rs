use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::*;

// Required fields are optional here so that a missing value is reported as a
// validation error instead of silently becoming `false` or `0`.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct LoginRequest {
    pub email: Option<String>,
    pub password: Option<String>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct UpdateUserRequest {
    pub username: Option<String>,
    pub bio: Option<String>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct NewMarketRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub resolve_date: Option<DateTime<Utc>>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct UpdateMarketRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub close_date: Option<DateTime<Utc>>,
    pub resolve_date: Option<DateTime<Utc>>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct ResolveMarketRequest {
    pub outcome: Option<bool>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct PredictRequest {
    #[serde(alias = "prediction")]
    pub forecast: Option<bool>,
    pub confidence: Option<Confidence>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct MarketsQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub status: Option<MarketStatus>,
}
impl MarketsQuery {
    pub fn page(&self) -> PageQuery {
        PageQuery {
            page: self.page,
            limit: self.limit,
        }
    }
}
