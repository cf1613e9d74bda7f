//! Batched phone lookups with all-or-nothing session refresh.
//!
//! A batch is only persisted when no member came back unauthorized. One 401
//! discards the whole batch, refreshes the session and retries it, so a
//! stale token never leaks NULL rows into the store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::api::{PhoneApi, PhoneLookup};
use crate::error::Result;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::repository::PhoneRepository;
use crate::session::{AuthError, SessionHandle};

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_PARALLELISM: usize = 10;
pub const DEFAULT_MAX_REFRESHES_PER_BATCH: u32 = 3;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub parallelism: usize,
    pub max_refreshes_per_batch: u32,
    /// Look up again ads whose stored result is NULL.
    pub rescrape_nulls: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            max_refreshes_per_batch: DEFAULT_MAX_REFRESHES_PER_BATCH,
            rescrape_nulls: false,
        }
    }
}

/// Stored outcome of one ad.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Numbers(Vec<String>),
    NoNumbers,
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: BTreeMap<String, ItemOutcome>,
    /// Ads dropped before lookup because the store already has them.
    pub skipped: usize,
    pub refreshes: u32,
    /// Ads whose outcome could not be written.
    pub persist_failures: Vec<(String, String)>,
}

impl BatchReport {
    pub fn found(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, ItemOutcome::Numbers(_)))
            .count()
    }

    pub fn failed(&self) -> Vec<(&str, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| match o {
                ItemOutcome::Failed(reason) => Some((id.as_str(), reason.as_str())),
                _ => None,
            })
            .collect()
    }
}

/// Progress of a phone run.
#[derive(Debug, Clone)]
pub enum PhoneEvent {
    Started { total: usize, skipped: usize },
    ItemStored { ad_id: String, found: bool },
    BatchRetried { first_id: String, generation: u64 },
}

pub struct BatchAuthFetcher {
    api: Arc<dyn PhoneApi>,
    session: Arc<SessionHandle>,
    repo: PhoneRepository,
    metrics: Arc<dyn MetricsSink>,
    config: BatchConfig,
}

impl BatchAuthFetcher {
    pub fn new(api: Arc<dyn PhoneApi>, session: Arc<SessionHandle>, repo: PhoneRepository) -> Self {
        Self {
            api,
            session,
            repo,
            metrics: Arc::new(NoopMetrics),
            config: BatchConfig::default(),
        }
    }

    pub fn with_config(mut self, config: BatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Drop ids the store already answers, and duplicates. Order is kept.
    pub async fn pending_ids(
        &self,
        ids: impl IntoIterator<Item = String>,
    ) -> Result<(Vec<String>, usize)> {
        let ids: Vec<String> = ids.into_iter().collect();
        let rescrape_nulls = self.config.rescrape_nulls;
        let filtered = self
            .repo
            .run_blocking(move |repo| {
                let retry: HashSet<String> = if rescrape_nulls {
                    repo.null_ids()?.into_iter().collect()
                } else {
                    HashSet::new()
                };
                let mut seen = HashSet::new();
                let mut pending = Vec::new();
                let mut skipped = 0;
                for id in ids {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if repo.contains(&id)? && !retry.contains(&id) {
                        skipped += 1;
                        continue;
                    }
                    pending.push(id);
                }
                Ok((pending, skipped))
            })
            .await?;
        Ok(filtered)
    }

    /// Look up and store the phone numbers of every pending id.
    pub async fn process_all(
        &self,
        ids: impl IntoIterator<Item = String>,
        events: Option<mpsc::Sender<PhoneEvent>>,
    ) -> Result<BatchReport> {
        let emit = |event: PhoneEvent| {
            if let Some(tx) = &events {
                let _ = tx.try_send(event);
            }
        };

        let (pending, skipped) = self.pending_ids(ids).await?;
        info!(
            "Phone lookup: {} ads pending, {} already stored",
            pending.len(),
            skipped
        );
        emit(PhoneEvent::Started {
            total: pending.len(),
            skipped,
        });

        let mut report = BatchReport {
            skipped,
            ..BatchReport::default()
        };
        for batch in pending.chunks(self.config.batch_size.max(1)) {
            let results = self.run_batch(batch, &mut report, &emit).await?;
            let stored = self
                .repo
                .run_blocking(move |repo| {
                    Ok(results
                        .into_iter()
                        .map(|(ad_id, outcome)| {
                            let numbers = match &outcome {
                                ItemOutcome::Numbers(numbers) => Some(numbers.as_slice()),
                                ItemOutcome::NoNumbers | ItemOutcome::Failed(_) => None,
                            };
                            let saved = repo.upsert(&ad_id, numbers).map_err(|e| e.to_string());
                            (ad_id, outcome, saved)
                        })
                        .collect::<Vec<_>>())
                })
                .await?;
            for (ad_id, outcome, saved) in stored {
                match saved {
                    Err(e) => {
                        warn!("Could not store phones for ad {}: {}", ad_id, e);
                        report.persist_failures.push((ad_id.clone(), e));
                    }
                    Ok(()) => {
                        self.metrics.increment("phones.stored", 1);
                        emit(PhoneEvent::ItemStored {
                            ad_id: ad_id.clone(),
                            found: matches!(outcome, ItemOutcome::Numbers(_)),
                        });
                    }
                }
                report.outcomes.insert(ad_id, outcome);
            }
        }

        info!(
            "Phone lookup finished: {} with numbers, {} without, {} refreshes",
            report.found(),
            report.outcomes.len() - report.found(),
            report.refreshes
        );
        Ok(report)
    }

    /// Look up one batch until no member is unauthorized.
    async fn run_batch(
        &self,
        batch: &[String],
        report: &mut BatchReport,
        emit: &(impl Fn(PhoneEvent) + Sync),
    ) -> Result<Vec<(String, ItemOutcome)>> {
        let mut refreshes = 0;
        loop {
            let snapshot = self.session.current().await?;
            let session = snapshot.session.as_ref();
            let results: Vec<(String, PhoneLookup)> = stream::iter(batch)
                .map(|ad_id| async move { (ad_id.clone(), self.api.lookup(ad_id, session).await) })
                .buffer_unordered(self.config.parallelism.max(1))
                .collect()
                .await;
            self.metrics.increment("phones.requests", results.len() as u64);

            let mut unauthorized = 0;
            let mut outcomes = Vec::with_capacity(results.len());
            for (ad_id, lookup) in results {
                let outcome = match lookup {
                    PhoneLookup::Unauthorized => {
                        unauthorized += 1;
                        continue;
                    }
                    PhoneLookup::Numbers(numbers) if !numbers.is_empty() => {
                        ItemOutcome::Numbers(numbers)
                    }
                    PhoneLookup::Numbers(_) => ItemOutcome::NoNumbers,
                    PhoneLookup::Failed(reason) => ItemOutcome::Failed(reason),
                };
                outcomes.push((ad_id, outcome));
            }
            if unauthorized == 0 {
                return Ok(outcomes);
            }

            if refreshes >= self.config.max_refreshes_per_batch {
                return Err(AuthError::Exhausted(refreshes).into());
            }
            refreshes += 1;
            report.refreshes += 1;
            self.metrics.increment("phones.unauthorized", unauthorized as u64);
            warn!(
                "{} of {} lookups unauthorized, refreshing session and retrying the batch",
                unauthorized,
                batch.len()
            );
            let fresh = self.session.refresh(snapshot.generation).await?;
            emit(PhoneEvent::BatchRetried {
                first_id: batch.first().cloned().unwrap_or_default(),
                generation: fresh.generation,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrawlError;
    use crate::session::tests::CountingProvider;
    use crate::session::Session;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Numbers carry the token they were fetched with.
    struct FakeApi {
        unauthorized: HashSet<(String, String)>,
        always_unauthorized: bool,
        timed_out: HashSet<String>,
        calls: AtomicUsize,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                unauthorized: HashSet::new(),
                always_unauthorized: false,
                timed_out: HashSet::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PhoneApi for FakeApi {
        async fn lookup(&self, ad_id: &str, session: &Session) -> PhoneLookup {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = (ad_id.to_string(), session.bearer_token.clone());
            if self.always_unauthorized || self.unauthorized.contains(&key) {
                return PhoneLookup::Unauthorized;
            }
            if self.timed_out.contains(ad_id) {
                return PhoneLookup::Failed("request timed out after 30s".to_string());
            }
            if ad_id.ends_with('0') {
                return PhoneLookup::Numbers(Vec::new());
            }
            PhoneLookup::Numbers(vec![format!("+385 {} {}", ad_id, session.bearer_token)])
        }
    }

    fn setup(api: FakeApi) -> (tempfile::TempDir, Arc<FakeApi>, Arc<CountingProvider>, BatchAuthFetcher) {
        let dir = tempfile::tempdir().unwrap();
        let repo = PhoneRepository::new(&dir.path().join("phones.db")).unwrap();
        let api = Arc::new(api);
        let provider = Arc::new(CountingProvider::default());
        let session = Arc::new(SessionHandle::new(provider.clone()));
        let fetcher = BatchAuthFetcher::new(api.clone(), session, repo);
        (dir, api, provider, fetcher)
    }

    fn ids(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
        range.map(|n| format!("{}", 1000 + n)).collect()
    }

    #[tokio::test]
    async fn test_one_unauthorized_member_retries_whole_batch() {
        let mut api = FakeApi::new();
        // Item #27 of the batch fails with the first token only.
        api.unauthorized
            .insert(("1027".to_string(), "token-1".to_string()));
        let (_dir, api, provider, fetcher) = setup(api);

        let report = fetcher.process_all(ids(1..=50), None).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(api.calls.load(Ordering::SeqCst), 100);
        assert_eq!(report.refreshes, 1);
        assert_eq!(report.outcomes.len(), 50);
        assert_eq!(fetcher.repo.count().unwrap(), 50);
        for id in ids(1..=50) {
            if let Some(phones) = fetcher.repo.get(&id).unwrap().unwrap().phones {
                assert!(phones.iter().all(|p| p.ends_with("token-2")), "{:?}", phones);
            }
        }
        assert_eq!(fetcher.repo.null_ids().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_refresh_exhaustion_aborts_without_persisting() {
        let mut api = FakeApi::new();
        api.always_unauthorized = true;
        let (_dir, _api, provider, fetcher) = setup(api);

        let err = fetcher.process_all(ids(1..=3), None).await.unwrap_err();
        assert!(matches!(err, CrawlError::Auth(AuthError::Exhausted(3))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert_eq!(fetcher.repo.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_member_is_stored_null_without_refresh() {
        let mut api = FakeApi::new();
        api.timed_out.insert("1002".to_string());
        let (_dir, api, provider, fetcher) = setup(api);

        let report = fetcher.process_all(ids(1..=3), None).await.unwrap();

        assert_eq!(report.refreshes, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            report.failed(),
            vec![("1002", "request timed out after 30s")]
        );
        assert_eq!(fetcher.repo.null_ids().unwrap(), vec!["1002".to_string()]);
        assert_eq!(report.found(), 2);
    }

    #[tokio::test]
    async fn test_filters_stored_and_duplicate_ids() {
        let (_dir, api, _provider, fetcher) = setup(FakeApi::new());
        fetcher
            .repo
            .upsert("1", Some(&["+385 1".to_string()]))
            .unwrap();
        fetcher.repo.upsert("2", None).unwrap();

        let input = || ["1", "2", "3", "3"].map(String::from);
        let report = fetcher.process_all(input(), None).await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.outcomes.keys().collect::<Vec<_>>(), vec!["3"]);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        let fetcher = fetcher.with_config(BatchConfig {
            rescrape_nulls: true,
            ..BatchConfig::default()
        });
        let (pending, skipped) = fetcher.pending_ids(input()).await.unwrap();
        assert_eq!(pending, vec!["2".to_string(), "3".to_string()]);
        assert_eq!(skipped, 1);
    }

    #[tokio::test]
    async fn test_batches_and_events() {
        let (_dir, _api, _provider, fetcher) = setup(FakeApi::new());
        let fetcher = fetcher.with_config(BatchConfig {
            batch_size: 4,
            parallelism: 2,
            ..BatchConfig::default()
        });
        let (tx, mut rx) = mpsc::channel(64);
        let report = fetcher.process_all(ids(1..=10), Some(tx)).await.unwrap();
        assert_eq!(report.outcomes.len(), 10);
        assert_eq!(report.found(), 9);
        assert_eq!(report.outcomes.get("1010"), Some(&ItemOutcome::NoNumbers));

        let mut stored = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PhoneEvent::ItemStored { .. }) {
                stored += 1;
            }
        }
        assert_eq!(stored, 10);
    }
}
