use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use anyhow::bail;

use super::*;

impl MarketState {
    pub fn status(&self) -> MarketStatus {
        match self {
            Self::Open => MarketStatus::Open,
            Self::Closed => MarketStatus::Closed,
            Self::Resolved(_) => MarketStatus::Resolved,
        }
    }
    pub fn outcome(&self) -> Option<bool> {
        match self {
            Self::Resolved(outcome) => Some(*outcome),
            _ => None,
        }
    }
    /// Rebuilds the state from the `status` and `outcome` columns.
    pub fn from_columns(status: &str, outcome: Option<bool>) -> anyhow::Result<Self> {
        match (MarketStatus::from_str(status)?, outcome) {
            (MarketStatus::Open, None) => Ok(Self::Open),
            (MarketStatus::Closed, None) => Ok(Self::Closed),
            (MarketStatus::Resolved, Some(outcome)) => Ok(Self::Resolved(outcome)),
            (status, outcome) => bail!(
                "Inconsistent market row: status {} with outcome {:?}",
                status,
                outcome
            ),
        }
    }
}
impl Display for MarketState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Open => "Open".into(),
            Self::Closed => "Closed".into(),
            Self::Resolved(outcome) => format!("Resolved({})", outcome),
        };
        write!(f, "{}", output)
    }
}
impl Display for MarketStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let output = match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Resolved => "Resolved",
        };
        write!(f, "{}", output)
    }
}
impl FromStr for MarketStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "resolved" => Ok(Self::Resolved),
            e => bail!("Couldn't deserialize to MarketStatus: {}", e),
        }
    }
}
impl Account {
    pub fn response(&self) -> UserResponse {
        UserResponse {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            bio: self.bio.clone(),
            score: self.score,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
        }
    }
}
impl Market {
    pub fn response(&self, creator: UserSummary) -> MarketResponse {
        MarketResponse {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            creator,
            close_date: self.close_date,
            resolve_date: self.resolve_date,
            status: self.state.status(),
            outcome: self.state.outcome(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}
impl Forecast {
    pub fn is_correct(&self, outcome: bool) -> bool {
        self.forecast == outcome
    }
}
impl From<&Prediction> for Forecast {
    fn from(prediction: &Prediction) -> Self {
        Self {
            forecast: prediction.forecast,
            confidence: prediction.confidence,
        }
    }
}
