use crate::api::*;
use crate::auth::{hash_password, verify_password, Principal, TokenKeys};
use crate::db::{ResolutionStore, DB};
use crate::error::{Result, SibylError};
use crate::resolution::ResolutionEngine;
use crate::settings::Settings;
use anyhow::anyhow;
use chrono::Duration;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;

const USERNAME_LEN: std::ops::RangeInclusive<usize> = 3..=30;
const MIN_PASSWORD_LEN: usize = 6;
const MAX_TITLE_LEN: usize = 200;
const MAX_BIO_LEN: usize = 500;
const RECENT_PREDICTIONS: i64 = 5;

/// Result of submitting a prediction: the stored row and whether it is new.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub prediction: Prediction,
    pub created: bool,
}

pub struct Sibyl {
    db: Arc<Box<dyn DB + Send + Sync>>,
    engine: ResolutionEngine,
    keys: Arc<TokenKeys>,
    hash_rounds: u32,
}

impl Sibyl {
    pub fn new(
        db: Box<dyn DB + Send + Sync>,
        store: Box<dyn ResolutionStore + Send + Sync>,
        settings: &Settings,
    ) -> Self {
        Self {
            db: Arc::new(db),
            engine: ResolutionEngine::new(store, &settings.resolution),
            keys: Arc::new(TokenKeys::new(
                &settings.jwt.secret,
                Duration::hours(settings.jwt.ttl_hours),
            )),
            hash_rounds: settings.auth.hash_rounds,
        }
    }
    pub fn keys(&self) -> Arc<TokenKeys> {
        self.keys.clone()
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<AuthResponse> {
        let username = validate_username(request.username)?;
        let email = request
            .email
            .map(|email| email.trim().to_lowercase())
            .ok_or_else(|| SibylError::missing("email"))?;
        if !valid_email(&email) {
            return Err(SibylError::validation("email", "must be a valid email address"));
        }
        let password = request.password.ok_or_else(|| SibylError::missing("password"))?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(SibylError::validation(
                "password",
                format!("must be at least {} characters", MIN_PASSWORD_LEN),
            ));
        }
        if self.db.get_account_by_email(&email).await?.is_some() {
            return Err(SibylError::Conflict(
                "User with this email already exists".to_string(),
            ));
        }
        if self.db.get_account_by_username(&username).await?.is_some() {
            return Err(SibylError::Conflict("Username is already taken".to_string()));
        }
        let rounds = self.hash_rounds;
        let password_hash =
            tokio::task::spawn_blocking(move || hash_password(&password, rounds))
                .await
                .map_err(|e| SibylError::Internal(e.into()))?;
        let id = self
            .db
            .create_account(NewAccount {
                username,
                email,
                password_hash,
            })
            .await?;
        let account = self.account(id).await?;
        debug!("Registered account {} ({})", account.id, account.username);
        Ok(AuthResponse {
            token: self.keys.issue(account.id)?,
            user: account.response(),
        })
    }
    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse> {
        let email = request
            .email
            .map(|email| email.trim().to_lowercase())
            .ok_or_else(|| SibylError::missing("email"))?;
        let password = request.password.ok_or_else(|| SibylError::missing("password"))?;
        let rejected = || SibylError::Unauthorized("invalid email or password".to_string());
        let account = self
            .db
            .get_account_by_email(&email)
            .await?
            .ok_or_else(rejected)?;
        let stored = account.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || verify_password(&password, &stored))
            .await
            .map_err(|e| SibylError::Internal(e.into()))?;
        if !valid {
            return Err(rejected());
        }
        debug!("Account {} logged in", account.id);
        Ok(AuthResponse {
            token: self.keys.issue(account.id)?,
            user: account.response(),
        })
    }

    pub async fn get_current_user(&self, principal: &Principal) -> Result<UserResponse> {
        Ok(self.account(principal.id).await?.response())
    }
    pub async fn get_user(&self, id: RowId) -> Result<UserResponse> {
        Ok(self.account(id).await?.response())
    }
    pub async fn update_current_user(
        &self,
        principal: &Principal,
        request: UpdateUserRequest,
    ) -> Result<UserResponse> {
        let current = self.account(principal.id).await?;
        let username = match request.username {
            Some(username) => {
                let username = validate_username(Some(username))?;
                if username != current.username {
                    if let Some(other) = self.db.get_account_by_username(&username).await? {
                        if other.id != current.id {
                            return Err(SibylError::Conflict(
                                "Username is already taken".to_string(),
                            ));
                        }
                    }
                }
                Some(username)
            }
            None => None,
        };
        if let Some(bio) = &request.bio {
            if bio.chars().count() > MAX_BIO_LEN {
                return Err(SibylError::validation(
                    "bio",
                    format!("must be at most {} characters", MAX_BIO_LEN),
                ));
            }
        }
        self.db
            .update_profile(principal.id, username, request.bio)
            .await?;
        debug!("Updated profile of account {}", principal.id);
        Ok(self.account(principal.id).await?.response())
    }

    pub async fn create_market(
        &self,
        principal: &Principal,
        request: NewMarketRequest,
    ) -> Result<MarketResponse> {
        let title = validate_title(request.title.ok_or_else(|| SibylError::missing("title"))?)?;
        let description = validate_description(
            request
                .description
                .ok_or_else(|| SibylError::missing("description"))?,
        )?;
        let close_date = request
            .close_date
            .ok_or_else(|| SibylError::missing("close_date"))?;
        let resolve_date = request
            .resolve_date
            .ok_or_else(|| SibylError::missing("resolve_date"))?;
        let creator = self.account(principal.id).await?;
        let id = self
            .db
            .add_market(NewMarket {
                title,
                description,
                creator: creator.id,
                close_date,
                resolve_date,
            })
            .await?;
        debug!("Account {} created market {}", creator.id, id);
        let market = self.market(id).await?;
        Ok(market.response(creator.summary()))
    }
    pub async fn get_market(&self, id: RowId) -> Result<MarketResponse> {
        let market = self.market(id).await?;
        self.market_response(market).await
    }
    pub async fn list_markets(&self, query: MarketsQuery) -> Result<MarketsResponse> {
        let pagination = query.page().resolve();
        let (markets, total) = self.db.get_markets(query.status, pagination).await?;
        let mut creators: HashMap<RowId, UserSummary> = HashMap::new();
        let mut responses = Vec::with_capacity(markets.len());
        for market in markets {
            let creator = match creators.get(&market.creator) {
                Some(creator) => creator.clone(),
                None => {
                    let creator = self.creator(&market).await?;
                    creators.insert(market.creator, creator.clone());
                    creator
                }
            };
            responses.push(market.response(creator));
        }
        Ok(MarketsResponse {
            markets: responses,
            meta: pagination.meta(total),
        })
    }
    pub async fn update_market(
        &self,
        principal: &Principal,
        id: RowId,
        request: UpdateMarketRequest,
    ) -> Result<MarketResponse> {
        let market = self.market(id).await?;
        if market.creator != principal.id {
            return Err(SibylError::Forbidden(
                "You can only update markets you created".to_string(),
            ));
        }
        if let MarketState::Resolved(_) = market.state {
            return Err(SibylError::InvalidState(
                "Cannot update a resolved market".to_string(),
            ));
        }
        let changes = MarketChanges {
            title: request.title.map(validate_title).transpose()?,
            description: request.description.map(validate_description).transpose()?,
            close_date: request.close_date,
            resolve_date: request.resolve_date,
        };
        if !self.db.update_market(id, changes).await? {
            return Err(SibylError::InvalidState(
                "Cannot update a resolved market".to_string(),
            ));
        }
        debug!("Updated market {}", id);
        self.get_market(id).await
    }
    pub async fn close_market(&self, principal: &Principal, id: RowId) -> Result<MarketResponse> {
        let market = self.market(id).await?;
        if market.creator != principal.id {
            return Err(SibylError::Forbidden(
                "Only the market creator can close the market".to_string(),
            ));
        }
        let not_open = || SibylError::InvalidState("Only open markets can be closed".to_string());
        if market.state != MarketState::Open || !self.db.close_market(id).await? {
            return Err(not_open());
        }
        debug!("Closed market {}", id);
        self.get_market(id).await
    }
    pub async fn resolve_market(
        &self,
        principal: &Principal,
        id: RowId,
        request: ResolveMarketRequest,
    ) -> Result<ResolveResponse> {
        let (market, report) = self.engine.resolve(id, principal, request.outcome).await?;
        Ok(ResolveResponse {
            market: self.market_response(market).await?,
            scored: report.scored,
            correct: report.correct,
        })
    }

    pub async fn submit_prediction(
        &self,
        principal: &Principal,
        market: RowId,
        request: PredictRequest,
    ) -> Result<Submission> {
        let forecast = Forecast {
            forecast: request
                .forecast
                .ok_or_else(|| SibylError::missing("prediction"))?,
            confidence: validate_confidence(
                request
                    .confidence
                    .ok_or_else(|| SibylError::missing("confidence"))?,
            )?,
        };
        let target = self.market(market).await?;
        if target.state != MarketState::Open {
            return Err(not_open_for_predictions());
        }
        let (prediction, created) = self
            .db
            .upsert_prediction(principal.id, market, forecast)
            .await?
            .ok_or_else(not_open_for_predictions)?;
        debug!(
            "Account {} predicted {} ({}%) on market {}",
            principal.id, forecast.forecast, forecast.confidence, market
        );
        Ok(Submission { prediction, created })
    }
    pub async fn update_prediction(
        &self,
        principal: &Principal,
        id: RowId,
        request: PredictRequest,
    ) -> Result<Prediction> {
        let prediction = self
            .db
            .get_prediction(id)
            .await?
            .ok_or_else(|| SibylError::NotFound("Prediction not found".to_string()))?;
        if prediction.user != principal.id {
            return Err(SibylError::Forbidden(
                "You can only update your own predictions".to_string(),
            ));
        }
        let forecast = Forecast {
            forecast: request.forecast.unwrap_or(prediction.forecast),
            confidence: match request.confidence {
                Some(confidence) => validate_confidence(confidence)?,
                None => prediction.confidence,
            },
        };
        let target = self.market(prediction.market).await?;
        if target.state != MarketState::Open {
            return Err(not_open_for_predictions());
        }
        let updated = self
            .db
            .update_prediction(id, forecast)
            .await?
            .ok_or_else(not_open_for_predictions)?;
        debug!("Updated prediction {}", id);
        Ok(updated)
    }
    pub async fn list_market_predictions(
        &self,
        market: RowId,
        query: PageQuery,
    ) -> Result<PredictionsResponse> {
        self.market(market).await?;
        let pagination = query.resolve();
        let (predictions, total) = self.db.get_market_predictions(market, pagination).await?;
        Ok(PredictionsResponse {
            predictions,
            meta: pagination.meta(total),
        })
    }

    pub async fn leaderboard(&self, query: PageQuery) -> Result<LeaderboardResponse> {
        let pagination = query.resolve();
        let (accounts, total) = self.db.get_leaderboard(pagination).await?;
        let leaderboard = accounts
            .into_iter()
            .enumerate()
            .map(|(i, account)| LeaderboardEntry {
                rank: pagination.offset().saturating_add(i as i64 + 1),
                id: account.id,
                username: account.username,
                bio: account.bio,
                score: account.score,
            })
            .collect();
        Ok(LeaderboardResponse {
            leaderboard,
            meta: pagination.meta(total),
        })
    }
    pub async fn user_stats(&self, id: RowId) -> Result<UserStatsResponse> {
        let account = self.account(id).await?;
        let counts = self.db.get_prediction_counts(id).await?;
        let accuracy = if counts.resolved > 0 {
            counts.correct as f64 / counts.resolved as f64 * 100.0
        } else {
            0.0
        };
        Ok(UserStatsResponse {
            total_predictions: counts.total,
            resolved_predictions: counts.resolved,
            correct_predictions: counts.correct,
            accuracy,
            prediction_score: account.score,
            recent_predictions: self
                .db
                .get_recent_predictions(id, RECENT_PREDICTIONS)
                .await?,
        })
    }

    async fn account(&self, id: RowId) -> Result<Account> {
        self.db
            .get_account(id)
            .await?
            .ok_or_else(|| SibylError::NotFound("User not found".to_string()))
    }
    async fn market(&self, id: RowId) -> Result<Market> {
        self.db
            .get_market(id)
            .await?
            .ok_or_else(|| SibylError::NotFound("Market not found".to_string()))
    }
    async fn creator(&self, market: &Market) -> Result<UserSummary> {
        let creator = self.db.get_account(market.creator).await?.ok_or_else(|| {
            anyhow!(
                "Creator {} of market {} doesn't exist",
                market.creator,
                market.id
            )
        })?;
        Ok(creator.summary())
    }
    async fn market_response(&self, market: Market) -> Result<MarketResponse> {
        let creator = self.creator(&market).await?;
        Ok(market.response(creator))
    }
}

fn not_open_for_predictions() -> SibylError {
    SibylError::InvalidState("Market is not open for predictions".to_string())
}

fn validate_username(username: Option<String>) -> Result<String> {
    let username = username
        .map(|username| username.trim().to_string())
        .ok_or_else(|| SibylError::missing("username"))?;
    if !USERNAME_LEN.contains(&username.chars().count()) {
        return Err(SibylError::validation(
            "username",
            format!(
                "must be between {} and {} characters",
                USERNAME_LEN.start(),
                USERNAME_LEN.end()
            ),
        ));
    }
    Ok(username)
}

fn validate_title(title: String) -> Result<String> {
    let title = title.trim().to_string();
    if title.is_empty() {
        return Err(SibylError::missing("title"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(SibylError::validation(
            "title",
            format!("must be at most {} characters", MAX_TITLE_LEN),
        ));
    }
    Ok(title)
}

fn validate_description(description: String) -> Result<String> {
    let description = description.trim().to_string();
    if description.is_empty() {
        return Err(SibylError::missing("description"));
    }
    Ok(description)
}

fn validate_confidence(confidence: Confidence) -> Result<Confidence> {
    if !confidence.is_finite() || !(0.0..=100.0).contains(&confidence) {
        return Err(SibylError::validation(
            "confidence",
            "must be between 0 and 100",
        ));
    }
    Ok(confidence)
}

// local@domain.tld with the characters a mail address commonly uses
fn valid_email(email: &str) -> bool {
    let (local, domain) = match email.split_once('@') {
        Some(parts) => parts,
        None => return false,
    };
    let (host, tld) = match domain.rsplit_once('.') {
        Some(parts) => parts,
        None => return false,
    };
    !local.is_empty()
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
        && !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ".-".contains(c))
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}
