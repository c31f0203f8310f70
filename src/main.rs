use crate::api::*;
use crate::auth::{Principal, TokenKeys};
use crate::db::SQLite;
use crate::error::Result as ApiResult;
use crate::middleware::{log_requests, rate_limit, RateLimiter};
use crate::settings::Settings;
use crate::sibyl::Sibyl;
use anyhow::Result;
use axum::extract::{FromRef, Json, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::Router;
use axum_macros::debug_handler;
use clap::Parser;
use env_logger::{Builder, Env, WriteStyle};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

mod api;
mod auth;
mod client;
mod db;
mod error;
mod middleware;
mod resolution;
mod settings;
mod sibyl;

#[derive(Clone)]
struct AppState {
    sibyl: Arc<Sibyl>,
    keys: Arc<TokenKeys>,
    limiter: Arc<RateLimiter>,
}
impl FromRef<AppState> for Arc<TokenKeys> {
    fn from_ref(state: &AppState) -> Self {
        state.keys.clone()
    }
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<AuthResponse>)> {
    let auth = state.sibyl.register(request).await?;
    Ok((StatusCode::CREATED, Json(auth)))
}
async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<AuthResponse>> {
    Ok(Json(state.sibyl.login(request).await?))
}
async fn get_me(
    State(state): State<AppState>,
    principal: Principal,
) -> ApiResult<Json<UserResponse>> {
    Ok(Json(state.sibyl.get_current_user(&principal).await?))
}
async fn update_me(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<UpdateUserRequest>,
) -> ApiResult<Json<UserResponse>> {
    Ok(Json(
        state.sibyl.update_current_user(&principal, request).await?,
    ))
}
async fn get_user(
    State(state): State<AppState>,
    _: Principal,
    Path(user): Path<RowId>,
) -> ApiResult<Json<UserResponse>> {
    Ok(Json(state.sibyl.get_user(user).await?))
}
async fn get_user_stats(
    State(state): State<AppState>,
    _: Principal,
    Path(user): Path<RowId>,
) -> ApiResult<Json<UserStatsResponse>> {
    Ok(Json(state.sibyl.user_stats(user).await?))
}
async fn get_leaderboard(
    State(state): State<AppState>,
    _: Principal,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<LeaderboardResponse>> {
    Ok(Json(state.sibyl.leaderboard(query).await?))
}
async fn get_markets(
    State(state): State<AppState>,
    _: Principal,
    Query(query): Query<MarketsQuery>,
) -> ApiResult<Json<MarketsResponse>> {
    Ok(Json(state.sibyl.list_markets(query).await?))
}
#[debug_handler]
async fn create_market(
    State(state): State<AppState>,
    principal: Principal,
    Json(request): Json<NewMarketRequest>,
) -> ApiResult<(StatusCode, Json<MarketResponse>)> {
    let market = state.sibyl.create_market(&principal, request).await?;
    Ok((StatusCode::CREATED, Json(market)))
}
async fn get_market(
    State(state): State<AppState>,
    _: Principal,
    Path(market): Path<RowId>,
) -> ApiResult<Json<MarketResponse>> {
    Ok(Json(state.sibyl.get_market(market).await?))
}
async fn update_market(
    State(state): State<AppState>,
    principal: Principal,
    Path(market): Path<RowId>,
    Json(request): Json<UpdateMarketRequest>,
) -> ApiResult<Json<MarketResponse>> {
    Ok(Json(
        state
            .sibyl
            .update_market(&principal, market, request)
            .await?,
    ))
}
async fn close_market(
    State(state): State<AppState>,
    principal: Principal,
    Path(market): Path<RowId>,
) -> ApiResult<Json<MarketResponse>> {
    Ok(Json(state.sibyl.close_market(&principal, market).await?))
}
#[debug_handler]
async fn resolve_market(
    State(state): State<AppState>,
    principal: Principal,
    Path(market): Path<RowId>,
    Json(request): Json<ResolveMarketRequest>,
) -> ApiResult<Json<ResolveResponse>> {
    let resolved = state
        .sibyl
        .resolve_market(&principal, market, request)
        .await?;
    info!(
        "Market {} resolved by {}: {} predictions scored",
        market, principal.id, resolved.scored
    );
    Ok(Json(resolved))
}
async fn get_market_predictions(
    State(state): State<AppState>,
    _: Principal,
    Path(market): Path<RowId>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<PredictionsResponse>> {
    Ok(Json(
        state.sibyl.list_market_predictions(market, query).await?,
    ))
}
async fn predict(
    State(state): State<AppState>,
    principal: Principal,
    Path(market): Path<RowId>,
    Json(request): Json<PredictRequest>,
) -> ApiResult<(StatusCode, Json<Prediction>)> {
    let submission = state
        .sibyl
        .submit_prediction(&principal, market, request)
        .await?;
    let status = if submission.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(submission.prediction)))
}
async fn update_prediction(
    State(state): State<AppState>,
    principal: Principal,
    Path(prediction): Path<RowId>,
    Json(request): Json<PredictRequest>,
) -> ApiResult<Json<Prediction>> {
    Ok(Json(
        state
            .sibyl
            .update_prediction(&principal, prediction, request)
            .await?,
    ))
}

#[derive(Parser)]
struct Args {
    #[arg(short, long)]
    port: Option<u16>,
    /// Database url, e.g. sqlite://sibyl.db
    #[arg(short, long)]
    db: Option<String>,
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(db) = args.db {
        settings.database.url = db;
    }
    Builder::from_env(Env::default().default_filter_or(settings.log_level.as_str()))
        .write_style(WriteStyle::Always)
        .init();
    if settings.uses_default_secret() {
        warn!("Using the built-in JWT secret, set SIBYL_JWT__SECRET for any real deployment");
    }
    let (_port, handle) = run_server(settings).await?;
    handle.await?;
    Ok(())
}

fn router(state: AppState, cors: bool) -> Router {
    let api = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/users/me", get(get_me).put(update_me))
        .route("/users/:id", get(get_user))
        .route("/users/:id/stats", get(get_user_stats))
        .route("/leaderboard", get(get_leaderboard))
        .route("/markets", get(get_markets).post(create_market))
        .route("/markets/:id", get(get_market).put(update_market))
        .route("/markets/:id/close", post(close_market))
        .route("/markets/:id/resolve", post(resolve_market))
        .route("/markets/:id/predictions", get(get_market_predictions))
        .route("/markets/:id/predict", post(predict))
        .route("/predictions/:id", put(update_prediction));
    let app = Router::new()
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(log_requests))
                .layer(axum::middleware::from_fn_with_state(
                    state.limiter.clone(),
                    rate_limit,
                )),
        )
        .with_state(state);
    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn run_server(settings: Settings) -> Result<(u16, JoinHandle<()>)> {
    let db = SQLite::new(&settings.database.url, settings.database.max_connections).await?;
    let sibyl = Sibyl::new(Box::new(db.clone()), Box::new(db), &settings);
    let state = AppState {
        keys: sibyl.keys(),
        sibyl: Arc::new(sibyl),
        limiter: Arc::new(RateLimiter::new(
            settings.rate_limit.max_requests,
            settings.rate_limit.window(),
        )),
    };
    let app = router(state, settings.server.cors_enabled);

    let addr: SocketAddr = settings.bind_address().parse()?;
    let server = axum::Server::try_bind(&addr)?
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());
    let port = server.local_addr().port();
    info!("Listening on {}", server.local_addr());
    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Server stopped: {}", e);
        }
    });
    Ok((port, handle))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{ApiError, Client};
    use axum::http::Method;
    use chrono::{Duration, Utc};

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.server.port = 0;
        settings.auth.hash_rounds = 1000;
        settings.rate_limit.max_requests = 10_000;
        settings
    }
    async fn start(settings: Settings) -> String {
        let (port, _) = run_server(settings).await.unwrap();
        format!("http://127.0.0.1:{}", port)
    }
    async fn signed_up(url: &str, name: &str) -> (Client, RowId) {
        let auth = Client::new(url.to_string())
            .register(RegisterRequest {
                username: Some(name.to_string()),
                email: Some(format!("{}@example.com", name)),
                password: Some("password".to_string()),
            })
            .await
            .unwrap();
        (Client::new(url.to_string()).with_token(auth.token), auth.user.id)
    }
    fn status(e: anyhow::Error) -> StatusCode {
        e.downcast_ref::<ApiError>().unwrap().status
    }
    fn new_market() -> NewMarketRequest {
        NewMarketRequest {
            title: Some("Will the council approve the budget?".to_string()),
            description: Some("Resolves true on a passing vote".to_string()),
            close_date: Some(Utc::now() + Duration::days(7)),
            resolve_date: Some(Utc::now() + Duration::days(14)),
        }
    }

    #[tokio::test]
    async fn prediction_market_round() {
        let url = start(test_settings()).await;
        let (alice, alice_id) = signed_up(&url, "alice").await;
        let (bob, bob_id) = signed_up(&url, "bob").await;
        let (carol, _) = signed_up(&url, "carol").await;

        let market = alice.create_market(new_market()).await.unwrap();
        assert_eq!(market.status, MarketStatus::Open);
        assert_eq!(market.creator.id, alice_id);

        let (first, created) = bob.predict(market.id, true, 40.0).await.unwrap();
        assert!(created);
        let (second, created) = bob.predict(market.id, true, 100.0).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        carol.predict(market.id, true, 100.0).await.unwrap();
        let foreign = carol
            .update_prediction(
                second.id,
                PredictRequest {
                    forecast: Some(false),
                    confidence: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(status(foreign), StatusCode::FORBIDDEN);

        assert_eq!(
            status(bob.resolve_market(market.id, true).await.unwrap_err()),
            StatusCode::FORBIDDEN
        );
        let resolved = alice.resolve_market(market.id, false).await.unwrap();
        assert_eq!(resolved.market.status, MarketStatus::Resolved);
        assert_eq!(resolved.market.outcome, Some(false));
        assert_eq!(resolved.scored, 2);
        assert_eq!(resolved.correct, 0);
        assert_eq!(
            status(alice.resolve_market(market.id, true).await.unwrap_err()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(bob.predict(market.id, false, 10.0).await.unwrap_err()),
            StatusCode::BAD_REQUEST
        );

        assert_eq!(bob.me().await.unwrap().score, -1.0);
        let board = carol.leaderboard(PageQuery::default()).await.unwrap();
        assert_eq!(board.leaderboard[0].id, alice_id);
        assert_eq!(board.meta.total, 3);
        let stats = alice.user_stats(bob_id).await.unwrap();
        assert_eq!(stats.resolved_predictions, 1);
        assert_eq!(stats.correct_predictions, 0);
        assert_eq!(stats.prediction_score, -1.0);

        let resolved_markets = bob
            .get_markets(MarketsQuery {
                status: Some(MarketStatus::Resolved),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resolved_markets.meta.total, 1);
        let predictions = bob
            .get_market_predictions(market.id, PageQuery::default())
            .await
            .unwrap();
        assert_eq!(predictions.meta.total, 2);
    }

    #[tokio::test]
    async fn authentication_is_required() {
        let url = start(test_settings()).await;
        let anonymous = Client::new(url.clone());
        assert_eq!(
            status(anonymous.me().await.unwrap_err()),
            StatusCode::UNAUTHORIZED
        );
        let forged = Client::new(url.clone()).with_token("a.b.c".to_string());
        assert_eq!(
            status(forged.get_markets(MarketsQuery::default()).await.unwrap_err()),
            StatusCode::UNAUTHORIZED
        );

        let (alice, _) = signed_up(&url, "alice").await;
        let login = anonymous
            .login(LoginRequest {
                email: Some("alice@example.com".to_string()),
                password: Some("password".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(login.user, alice.me().await.unwrap());
        let bad_login = anonymous
            .login(LoginRequest {
                email: Some("alice@example.com".to_string()),
                password: Some("passw0rd".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(status(bad_login), StatusCode::UNAUTHORIZED);

        let duplicate = anonymous
            .register(RegisterRequest {
                username: Some("alice".to_string()),
                email: Some("new@example.com".to_string()),
                password: Some("password".to_string()),
            })
            .await
            .unwrap_err();
        assert_eq!(status(duplicate), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn error_bodies() {
        let url = start(test_settings()).await;
        let (alice, _) = signed_up(&url, "alice").await;
        let market = alice.create_market(new_market()).await.unwrap();

        let response = alice
            .raw(
                Method::POST,
                &format!("/markets/{}/resolve", market.id),
                Some(&serde_json::json!({})),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.json::<ErrorResponse>().await.unwrap();
        assert_eq!(body.field.as_deref(), Some("outcome"));

        let response = alice
            .raw(Method::GET, "/markets/4242", None::<&()>)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.json::<ErrorResponse>().await.unwrap().error,
            "Market not found"
        );

        let response = alice
            .raw(
                Method::POST,
                &format!("/markets/{}/predict", market.id),
                Some(&serde_json::json!({"prediction": true, "confidence": 101})),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // false is a real outcome, not a missing one
        let response = alice
            .raw(
                Method::POST,
                &format!("/markets/{}/resolve", market.id),
                Some(&serde_json::json!({"outcome": false})),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn profile_updates() {
        let url = start(test_settings()).await;
        let (alice, alice_id) = signed_up(&url, "alice").await;
        let (bob, _) = signed_up(&url, "bob").await;
        let updated = alice
            .update_me(UpdateUserRequest {
                username: Some("alice_w".to_string()),
                bio: Some("Superforecaster".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(updated.username, "alice_w");
        let seen = bob.get_user(alice_id).await.unwrap();
        assert_eq!(seen.bio, "Superforecaster");
        let taken = bob
            .update_me(UpdateUserRequest {
                username: Some("alice_w".to_string()),
                bio: None,
            })
            .await
            .unwrap_err();
        assert_eq!(status(taken), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn market_updates_and_closing() {
        let url = start(test_settings()).await;
        let (alice, _) = signed_up(&url, "alice").await;
        let (bob, _) = signed_up(&url, "bob").await;
        let market = alice.create_market(new_market()).await.unwrap();
        let updated = alice
            .update_market(
                market.id,
                UpdateMarketRequest {
                    description: Some("Resolves true on a passing council vote".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, market.title);
        assert_eq!(
            status(
                bob.update_market(market.id, UpdateMarketRequest::default())
                    .await
                    .unwrap_err()
            ),
            StatusCode::FORBIDDEN
        );
        let closed = alice.close_market(market.id).await.unwrap();
        assert_eq!(closed.status, MarketStatus::Closed);
        assert_eq!(
            status(bob.predict(market.id, true, 50.0).await.unwrap_err()),
            StatusCode::BAD_REQUEST
        );
        let fetched = bob.get_market(market.id).await.unwrap();
        assert_eq!(fetched.status, MarketStatus::Closed);
    }

    #[tokio::test]
    async fn rate_limited() {
        let mut settings = test_settings();
        settings.rate_limit.max_requests = 3;
        let url = start(settings).await;
        let client = Client::new(url);
        let mut statuses = vec![];
        for _ in 0..4 {
            let response = client
                .raw(Method::GET, "/leaderboard", None::<&()>)
                .await
                .unwrap();
            statuses.push(response.status());
        }
        assert_eq!(
            statuses,
            vec![
                StatusCode::UNAUTHORIZED,
                StatusCode::UNAUTHORIZED,
                StatusCode::UNAUTHORIZED,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );
    }
}
