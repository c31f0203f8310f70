use crate::api::*;
use crate::auth::Principal;
use crate::db::{ResolutionStore, ResolutionTx};
use crate::error::{Result, SibylError};
use crate::settings::ResolutionSettings;
use anyhow::anyhow;
use chrono::Utc;
use log::{debug, error, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// Score change of one prediction once its market resolves: a correct
/// forecast earns `confidence / 50`, a wrong one costs `confidence / 100`.
pub fn score_delta(forecast: bool, confidence: Confidence, outcome: bool) -> Score {
    if forecast == outcome {
        confidence / 50.0
    } else {
        -confidence / 100.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionReport {
    pub scored: u32,
    pub correct: u32,
}

pub struct ResolutionEngine {
    store: Arc<Box<dyn ResolutionStore + Send + Sync>>,
    timeout: Duration,
    max_retries: u32,
}
impl ResolutionEngine {
    pub fn new(store: Box<dyn ResolutionStore + Send + Sync>, settings: &ResolutionSettings) -> Self {
        Self {
            store: Arc::new(store),
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
        }
    }
    /// Resolves `market` to `outcome` and applies the score of every prediction
    /// on it, all in one transaction. Nothing is changed unless everything is.
    pub async fn resolve(
        &self,
        market: RowId,
        principal: &Principal,
        outcome: Option<bool>,
    ) -> Result<(Market, ResolutionReport)> {
        let outcome = outcome.ok_or_else(|| SibylError::missing("outcome"))?;
        let mut retries = 0;
        loop {
            self.precheck(market, principal).await?;
            match self.attempt(market, outcome).await {
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;
                    warn!(
                        "Resolution of market {} failed, retrying ({}/{}): {}",
                        market, retries, self.max_retries, e
                    );
                }
                Ok((resolved, report)) => {
                    debug!(
                        "Resolved market {} as {}, scored {} predictions ({} correct)",
                        market, outcome, report.scored, report.correct
                    );
                    return Ok((resolved, report));
                }
                Err(e) => return Err(e),
            }
        }
    }
    async fn precheck(&self, market: RowId, principal: &Principal) -> Result<()> {
        let current = self
            .store
            .load_market(market)
            .await?
            .ok_or_else(|| SibylError::NotFound(format!("Market {} not found", market)))?;
        if current.creator != principal.id {
            return Err(SibylError::Forbidden(
                "Only the market creator can resolve the market".to_string(),
            ));
        }
        if let MarketState::Resolved(_) = current.state {
            return Err(already_resolved());
        }
        Ok(())
    }
    /// Begin, scoring and commit all share one deadline.
    async fn attempt(&self, market: RowId, outcome: bool) -> Result<(Market, ResolutionReport)> {
        let deadline = Instant::now() + self.timeout;
        let mut tx = timeout_at(deadline, self.store.begin_resolution())
            .await
            .map_err(|_| self.timed_out(market))??;
        let result = match timeout_at(deadline, apply(tx.as_mut(), market, outcome)).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out(market)),
        };
        match result {
            Ok(resolved) => {
                // A commit cut off by the deadline drops the transaction, which rolls it back.
                timeout_at(deadline, tx.commit())
                    .await
                    .map_err(|_| self.timed_out(market))??;
                Ok(resolved)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    error!("Rollback of market {} failed: {:#}", market, rollback);
                } else {
                    error!("Rolled back resolution of market {}: {}", market, e);
                }
                Err(e)
            }
        }
    }
    fn timed_out(&self, market: RowId) -> SibylError {
        SibylError::Transient(anyhow!(
            "resolution of market {} timed out after {:?}",
            market,
            self.timeout
        ))
    }
}

async fn apply(
    tx: &mut (dyn ResolutionTx + Send),
    market: RowId,
    outcome: bool,
) -> Result<(Market, ResolutionReport)> {
    let now = Utc::now();
    let resolved = tx
        .claim_market(market, outcome, now)
        .await?
        .ok_or_else(already_resolved)?;
    let mut report = ResolutionReport::default();
    for prediction in tx.market_predictions(market).await? {
        let delta = score_delta(prediction.forecast, prediction.confidence, outcome);
        tx.add_to_score(prediction.user, delta, now).await?;
        report.scored += 1;
        if Forecast::from(&prediction).is_correct(outcome) {
            report.correct += 1;
        }
    }
    Ok((resolved, report))
}

fn already_resolved() -> SibylError {
    SibylError::InvalidState("Market is already resolved".to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::{SQLite, DB};
    use anyhow::bail;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use futures_util::future::join_all;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, Debug)]
    enum Fault {
        Claim,
        Load,
        /// Fails the n-th score update (0-based).
        Score(usize),
        Commit,
        Hang,
        HangCommit,
        /// A score update hits a row that breaks an invariant.
        Corrupt,
    }

    struct FaultyStore {
        inner: SQLite,
        fault: Fault,
        failures_left: Arc<AtomicUsize>,
    }
    struct FaultyTx {
        inner: Box<dyn ResolutionTx + Send>,
        fault: Fault,
        failures_left: Arc<AtomicUsize>,
        scored: usize,
    }
    impl FaultyTx {
        fn trip(&self, at: Fault) -> bool {
            let hit = matches!(
                (self.fault, at),
                (Fault::Claim, Fault::Claim)
                    | (Fault::Load, Fault::Load)
                    | (Fault::Commit, Fault::Commit)
                    | (Fault::Hang, Fault::Hang)
                    | (Fault::HangCommit, Fault::HangCommit)
                    | (Fault::Corrupt, Fault::Corrupt)
            ) || matches!((self.fault, at), (Fault::Score(n), Fault::Score(m)) if n == m);
            hit && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
        }
    }
    #[async_trait]
    impl ResolutionStore for FaultyStore {
        async fn load_market(&self, market: RowId) -> anyhow::Result<Option<Market>> {
            self.inner.load_market(market).await
        }
        async fn begin_resolution(&self) -> anyhow::Result<Box<dyn ResolutionTx + Send>> {
            Ok(Box::new(FaultyTx {
                inner: self.inner.begin_resolution().await?,
                fault: self.fault,
                failures_left: self.failures_left.clone(),
                scored: 0,
            }))
        }
    }
    #[async_trait]
    impl ResolutionTx for FaultyTx {
        async fn claim_market(
            &mut self,
            market: RowId,
            outcome: bool,
            at: DateTime<Utc>,
        ) -> anyhow::Result<Option<Market>> {
            let claimed = self.inner.claim_market(market, outcome, at).await?;
            if self.trip(Fault::Claim) {
                return Err(io_error());
            }
            Ok(claimed)
        }
        async fn market_predictions(&mut self, market: RowId) -> anyhow::Result<Vec<Prediction>> {
            if self.trip(Fault::Load) {
                return Err(sqlx::Error::PoolTimedOut.into());
            }
            self.inner.market_predictions(market).await
        }
        async fn add_to_score(
            &mut self,
            user: RowId,
            delta: Score,
            at: DateTime<Utc>,
        ) -> anyhow::Result<()> {
            let step = self.scored;
            self.scored += 1;
            if self.trip(Fault::Hang) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.trip(Fault::Corrupt) {
                bail!("Account {} of a scored prediction doesn't exist", user);
            }
            self.inner.add_to_score(user, delta, at).await?;
            if self.trip(Fault::Score(step)) {
                return Err(io_error());
            }
            Ok(())
        }
        async fn commit(self: Box<Self>) -> anyhow::Result<()> {
            if self.trip(Fault::Commit) {
                self.inner.rollback().await?;
                return Err(io_error());
            }
            if self.trip(Fault::HangCommit) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.commit().await
        }
        async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
            self.inner.rollback().await
        }
    }

    fn io_error() -> anyhow::Error {
        sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk I/O error")).into()
    }

    struct Fixture {
        db: SQLite,
        creator: RowId,
        market: RowId,
        users: Vec<RowId>,
    }
    /// A market with one prediction per entry of `forecasts`, each by a new user.
    async fn fixture(db: SQLite, forecasts: &[(bool, Confidence)]) -> Fixture {
        let creator = new_account(&db, "creator").await;
        let market = db
            .add_market(NewMarket {
                title: "Will the launch happen on time?".to_string(),
                description: "Resolves true if the launch is on schedule".to_string(),
                creator,
                close_date: Utc::now() + ChronoDuration::days(1),
                resolve_date: Utc::now() + ChronoDuration::days(2),
            })
            .await
            .unwrap();
        let mut users = vec![];
        for (i, (forecast, confidence)) in forecasts.iter().enumerate() {
            let user = new_account(&db, &format!("user{}", i)).await;
            db.upsert_prediction(
                user,
                market,
                Forecast {
                    forecast: *forecast,
                    confidence: *confidence,
                },
            )
            .await
            .unwrap()
            .unwrap();
            users.push(user);
        }
        Fixture {
            db,
            creator,
            market,
            users,
        }
    }
    async fn new_account(db: &SQLite, name: &str) -> RowId {
        db.create_account(NewAccount {
            username: name.to_string(),
            email: format!("{}@example.com", name),
            password_hash: "hash".to_string(),
        })
        .await
        .unwrap()
    }
    async fn memory_db() -> SQLite {
        SQLite::new("sqlite::memory:", 1).await.unwrap()
    }
    fn settings(timeout_ms: u64, max_retries: u32) -> ResolutionSettings {
        ResolutionSettings {
            timeout_ms,
            max_retries,
        }
    }
    fn engine(db: &SQLite) -> ResolutionEngine {
        ResolutionEngine::new(Box::new(db.clone()), &settings(5000, 3))
    }
    fn faulty_engine(db: &SQLite, fault: Fault, failures: usize, retries: u32) -> ResolutionEngine {
        ResolutionEngine::new(
            Box::new(FaultyStore {
                inner: db.clone(),
                fault,
                failures_left: Arc::new(AtomicUsize::new(failures)),
            }),
            &settings(200, retries),
        )
    }
    async fn scores(fixture: &Fixture) -> Vec<Score> {
        let mut scores = vec![];
        for user in &fixture.users {
            scores.push(fixture.db.get_account(*user).await.unwrap().unwrap().score);
        }
        scores
    }
    async fn state(fixture: &Fixture) -> MarketState {
        fixture
            .db
            .get_market(fixture.market)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[test]
    fn delta_scenarios() {
        assert_eq!(score_delta(true, 100.0, true), 2.0);
        assert_eq!(score_delta(true, 100.0, false), -1.0);
        assert_eq!(score_delta(false, 50.0, false), 1.0);
        assert_eq!(score_delta(false, 0.0, true), 0.0);
    }

    proptest! {
        #[test]
        fn delta_bounds(confidence in 0.0f64..=100.0, forecast: bool, outcome: bool) {
            let delta = score_delta(forecast, confidence, outcome);
            if forecast == outcome {
                prop_assert!((0.0..=2.0).contains(&delta));
                prop_assert_eq!(delta, confidence / 50.0);
            } else {
                prop_assert!((-1.0..=0.0).contains(&delta));
                prop_assert_eq!(delta, -confidence / 100.0);
            }
        }
    }

    #[tokio::test]
    async fn resolve_scores_every_prediction() {
        let fixture = fixture(
            memory_db().await,
            &[(true, 100.0), (true, 100.0), (false, 40.0), (false, 0.0)],
        )
        .await;
        let (market, report) = engine(&fixture.db)
            .resolve(fixture.market, &Principal { id: fixture.creator }, Some(false))
            .await
            .unwrap();
        assert_eq!(market.state, MarketState::Resolved(false));
        assert_eq!(report, ResolutionReport { scored: 4, correct: 2 });
        assert_eq!(scores(&fixture).await, vec![-1.0, -1.0, 0.8, 0.0]);
        // the creator did not predict
        let creator = fixture.db.get_account(fixture.creator).await.unwrap().unwrap();
        assert_eq!(creator.score, 0.0);
    }

    #[tokio::test]
    async fn resolve_without_predictions() {
        let fixture = fixture(memory_db().await, &[]).await;
        let (market, report) = engine(&fixture.db)
            .resolve(fixture.market, &Principal { id: fixture.creator }, Some(true))
            .await
            .unwrap();
        assert_eq!(market.state, MarketState::Resolved(true));
        assert_eq!(report, ResolutionReport::default());
    }

    #[tokio::test]
    async fn second_resolution_is_rejected() {
        let fixture = fixture(memory_db().await, &[(true, 100.0)]).await;
        let engine = engine(&fixture.db);
        let creator = Principal { id: fixture.creator };
        engine
            .resolve(fixture.market, &creator, Some(true))
            .await
            .unwrap();
        assert_eq!(scores(&fixture).await, vec![2.0]);
        for outcome in [true, false] {
            assert!(matches!(
                engine.resolve(fixture.market, &creator, Some(outcome)).await,
                Err(SibylError::InvalidState(_))
            ));
        }
        assert_eq!(scores(&fixture).await, vec![2.0]);
        assert_eq!(state(&fixture).await, MarketState::Resolved(true));
    }

    #[tokio::test]
    async fn prechecks() {
        let fixture = fixture(memory_db().await, &[(true, 70.0)]).await;
        let engine = engine(&fixture.db);
        let other = Principal { id: fixture.users[0] };
        assert!(matches!(
            engine.resolve(fixture.market, &other, Some(true)).await,
            Err(SibylError::Forbidden(_))
        ));
        assert!(matches!(
            engine
                .resolve(fixture.market + 100, &Principal { id: fixture.creator }, Some(true))
                .await,
            Err(SibylError::NotFound(_))
        ));
        assert!(matches!(
            engine
                .resolve(fixture.market, &Principal { id: fixture.creator }, None)
                .await,
            Err(SibylError::Validation { field, .. }) if field == "outcome"
        ));
        assert_eq!(state(&fixture).await, MarketState::Open);
        assert_eq!(scores(&fixture).await, vec![0.0]);
    }

    #[tokio::test]
    async fn closed_market_can_be_resolved() {
        let fixture = fixture(memory_db().await, &[(false, 20.0)]).await;
        assert!(fixture.db.close_market(fixture.market).await.unwrap());
        engine(&fixture.db)
            .resolve(fixture.market, &Principal { id: fixture.creator }, Some(false))
            .await
            .unwrap();
        assert_eq!(scores(&fixture).await, vec![0.4]);
    }

    #[tokio::test]
    async fn failed_resolution_changes_nothing() {
        let forecasts = [(true, 100.0), (false, 30.0), (true, 55.0)];
        let faults = [
            Fault::Claim,
            Fault::Load,
            Fault::Score(0),
            Fault::Score(2),
            Fault::Commit,
        ];
        for fault in faults {
            let fixture = fixture(memory_db().await, &forecasts).await;
            let creator = Principal { id: fixture.creator };
            let result = faulty_engine(&fixture.db, fault, usize::MAX, 2)
                .resolve(fixture.market, &creator, Some(true))
                .await;
            assert!(
                matches!(result, Err(SibylError::Transient(_))),
                "{:?}",
                fault
            );
            assert_eq!(state(&fixture).await, MarketState::Open, "{:?}", fault);
            assert_eq!(scores(&fixture).await, vec![0.0, 0.0, 0.0], "{:?}", fault);

            // the market is still resolvable afterwards
            engine(&fixture.db)
                .resolve(fixture.market, &creator, Some(true))
                .await
                .unwrap();
            assert_eq!(scores(&fixture).await, vec![2.0, -0.3, 1.1]);
        }
    }

    #[tokio::test]
    async fn timeout_rolls_back() {
        let fixture = fixture(memory_db().await, &[(true, 100.0), (true, 10.0)]).await;
        let result = faulty_engine(&fixture.db, Fault::Hang, usize::MAX, 1)
            .resolve(fixture.market, &Principal { id: fixture.creator }, Some(true))
            .await;
        assert!(matches!(result, Err(SibylError::Transient(_))));
        assert_eq!(state(&fixture).await, MarketState::Open);
        assert_eq!(scores(&fixture).await, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn commit_is_bounded_by_timeout() {
        let fixture = fixture(memory_db().await, &[(false, 60.0)]).await;
        let result = faulty_engine(&fixture.db, Fault::HangCommit, usize::MAX, 0)
            .resolve(fixture.market, &Principal { id: fixture.creator }, Some(false))
            .await;
        assert!(matches!(result, Err(SibylError::Transient(_))));
        assert_eq!(state(&fixture).await, MarketState::Open);
        assert_eq!(scores(&fixture).await, vec![0.0]);
    }

    #[tokio::test]
    async fn integrity_failure_is_not_retried() {
        let fixture = fixture(memory_db().await, &[(true, 90.0)]).await;
        // a single retry would succeed, so an Open market means none happened
        let result = faulty_engine(&fixture.db, Fault::Corrupt, 1, 3)
            .resolve(fixture.market, &Principal { id: fixture.creator }, Some(true))
            .await;
        let e = result.unwrap_err();
        assert!(matches!(e, SibylError::Internal(_)), "{:?}", e);
        assert!(!e.is_retryable());
        assert_eq!(state(&fixture).await, MarketState::Open);
        assert_eq!(scores(&fixture).await, vec![0.0]);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let fixture = fixture(memory_db().await, &[(true, 100.0), (false, 100.0)]).await;
        let (_, report) = faulty_engine(&fixture.db, Fault::Score(1), 1, 3)
            .resolve(fixture.market, &Principal { id: fixture.creator }, Some(true))
            .await
            .unwrap();
        assert_eq!(report, ResolutionReport { scored: 2, correct: 1 });
        assert_eq!(scores(&fixture).await, vec![2.0, -1.0]);
    }

    #[tokio::test]
    async fn concurrent_resolutions_apply_once() {
        let path = std::env::temp_dir().join(format!(
            "sibyl-resolution-{}-{}.db",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let url = format!("sqlite://{}", path.display());
        let fixture = fixture(
            SQLite::new(&url, 8).await.unwrap(),
            &[(true, 100.0), (false, 50.0), (true, 25.0)],
        )
        .await;
        let engine = engine(&fixture.db);
        let creator = Principal { id: fixture.creator };
        let attempts = (0..8).map(|i| engine.resolve(fixture.market, &creator, Some(i % 2 == 0)));
        let results = join_all(attempts).await;

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(SibylError::InvalidState(_)))));
        let outcome = winners[0].0.state.outcome().unwrap();
        let expected: Vec<Score> = [(true, 100.0), (false, 50.0), (true, 25.0)]
            .iter()
            .map(|(forecast, confidence)| score_delta(*forecast, *confidence, outcome))
            .collect();
        assert_eq!(scores(&fixture).await, expected);

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }
}
