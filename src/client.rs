use anyhow::Result;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::api::*;

/// Non-success answer of the server.
#[derive(Error, Debug)]
#[error("{status}: {error}")]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
}

pub struct Client {
    url: String,
    client: reqwest::Client,
    token: Option<String>,
}
impl Client {
    pub fn new(url: String) -> Self {
        let client = reqwest::Client::new();
        Self {
            url,
            client,
            token: None,
        }
    }
    pub fn with_token(mut self, token: String) -> Self {
        self.token = Some(token);
        self
    }
    pub fn set_token(&mut self, token: String) {
        self.token = Some(token);
    }
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.client.request(method, self.url.clone() + "/api" + path);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
    /// Sends `body` (if any) and returns the raw response, whatever its status.
    pub async fn raw<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response> {
        let request = self.request(method, path);
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };
        Ok(request.send().await?)
    }
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<(StatusCode, T)> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            let error = serde_json::from_str::<ErrorResponse>(&text)
                .map(|e| e.error)
                .unwrap_or(text);
            return Err(ApiError { status, error }.into());
        }
        Ok((status, response.json::<T>().await?))
    }
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(self.send(self.request(Method::GET, path)).await?.1)
    }
    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        Ok(self.send(self.request(Method::POST, path).json(body)).await?.1)
    }
    async fn put<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        Ok(self.send(self.request(Method::PUT, path).json(body)).await?.1)
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<AuthResponse> {
        self.post("/auth/register", &request).await
    }
    pub async fn login(&self, request: LoginRequest) -> Result<AuthResponse> {
        self.post("/auth/login", &request).await
    }
    pub async fn me(&self) -> Result<UserResponse> {
        self.get("/users/me").await
    }
    pub async fn update_me(&self, request: UpdateUserRequest) -> Result<UserResponse> {
        self.put("/users/me", &request).await
    }
    pub async fn get_user(&self, user: RowId) -> Result<UserResponse> {
        self.get(&format!("/users/{}", user)).await
    }
    pub async fn user_stats(&self, user: RowId) -> Result<UserStatsResponse> {
        self.get(&format!("/users/{}/stats", user)).await
    }
    pub async fn leaderboard(&self, query: PageQuery) -> Result<LeaderboardResponse> {
        let request = self.request(Method::GET, "/leaderboard").query(&query);
        Ok(self.send(request).await?.1)
    }
    pub async fn create_market(&self, request: NewMarketRequest) -> Result<MarketResponse> {
        self.post("/markets", &request).await
    }
    pub async fn get_markets(&self, query: MarketsQuery) -> Result<MarketsResponse> {
        let request = self.request(Method::GET, "/markets").query(&query);
        Ok(self.send(request).await?.1)
    }
    pub async fn get_market(&self, market: RowId) -> Result<MarketResponse> {
        self.get(&format!("/markets/{}", market)).await
    }
    pub async fn update_market(
        &self,
        market: RowId,
        request: UpdateMarketRequest,
    ) -> Result<MarketResponse> {
        self.put(&format!("/markets/{}", market), &request).await
    }
    pub async fn close_market(&self, market: RowId) -> Result<MarketResponse> {
        self.post(&format!("/markets/{}/close", market), &()).await
    }
    pub async fn resolve_market(&self, market: RowId, outcome: bool) -> Result<ResolveResponse> {
        let request = ResolveMarketRequest {
            outcome: Some(outcome),
        };
        self.post(&format!("/markets/{}/resolve", market), &request)
            .await
    }
    pub async fn get_market_predictions(
        &self,
        market: RowId,
        query: PageQuery,
    ) -> Result<PredictionsResponse> {
        let request = self
            .request(Method::GET, &format!("/markets/{}/predictions", market))
            .query(&query);
        Ok(self.send(request).await?.1)
    }
    /// Returns the stored prediction and whether it was newly created.
    pub async fn predict(
        &self,
        market: RowId,
        forecast: bool,
        confidence: Confidence,
    ) -> Result<(Prediction, bool)> {
        let request = PredictRequest {
            forecast: Some(forecast),
            confidence: Some(confidence),
        };
        let (status, prediction) = self
            .send(
                self.request(Method::POST, &format!("/markets/{}/predict", market))
                    .json(&request),
            )
            .await?;
        Ok((prediction, status == StatusCode::CREATED))
    }
    pub async fn update_prediction(
        &self,
        prediction: RowId,
        request: PredictRequest,
    ) -> Result<Prediction> {
        self.put(&format!("/predictions/{}", prediction), &request)
            .await
    }
}
