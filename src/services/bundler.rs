//! src/services/bundler.rs
//!
//! The lifecycle loops that move bundles from Bundling to SealedOnChain.
//!
//! * finalize scan (one instance): closes Bundling bundles whose size,
//!   count or age threshold is reached.
//! * submit loop (one per bundler account): packs Finalized bundles and
//!   pushes them on chain.
//! * seal-check loop (one per bundler account): promotes sealed bundles and
//!   cancels those that never seal.
//!
//! Loops share nothing but the database. Every transition is a conditional
//! update, so a loop that lost a race simply observes a conflict and moves
//! on. A failing bundle records the failure on its own row and never stops
//! the loop from handling its siblings.

use crate::{
    models::bundle::{Bundle, BundleStatus},
    services::{
        bundle_repo::{BundleRepository, RepoError, RepoResult},
        chain::{BUNDLE_CONTENT_TYPE, ChainClient, ChainError, CreateObjectOptions, ObjectStatus, Visibility},
        object_repo::ObjectRepository,
        packer::{BundlePacker, PackError, PackedBundle},
        retry::RetryPolicy,
        staging::StagingStorage,
    },
};
use chrono::Utc;
use std::{future::Future, io, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug)]
pub struct BundlerSettings {
    pub finalize_interval: Duration,
    pub submit_interval: Duration,
    pub seal_interval: Duration,
    /// How long a created object may stay unsealed before it is cancelled.
    pub max_seal_time: Duration,
    pub retry: RetryPolicy,
}

impl Default for BundlerSettings {
    fn default() -> Self {
        Self {
            finalize_interval: Duration::from_secs(1),
            submit_interval: Duration::from_secs(1),
            seal_interval: Duration::from_secs(30),
            max_seal_time: Duration::from_secs(24 * 60 * 60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Why a submit or cancel attempt failed. Only its message is kept, in the
/// bundle's `err_message`.
#[derive(Debug, Error)]
enum StepError {
    #[error("pack failed: {0}")]
    Pack(#[from] PackError),
    #[error("chain call failed: {0}")]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone)]
pub struct Bundler {
    bundles: BundleRepository,
    objects: ObjectRepository,
    packer: BundlePacker,
    staging: Arc<dyn StagingStorage>,
    settings: BundlerSettings,
}

impl Bundler {
    pub fn new(
        bundles: BundleRepository,
        objects: ObjectRepository,
        packer: BundlePacker,
        staging: Arc<dyn StagingStorage>,
        settings: BundlerSettings,
    ) -> Self {
        Self {
            bundles,
            objects,
            packer,
            staging,
            settings,
        }
    }

    /// One finalize scan. Returns how many bundles were closed.
    pub async fn finalize_tick(&self) -> RepoResult<usize> {
        let now = Utc::now();
        let mut closed = 0;
        for bundle in self.bundles.get_bundling_bundles().await? {
            if !bundle.thresholds_met(now) {
                continue;
            }
            match self.bundles.close_bundling(&bundle).await {
                Ok(status) => {
                    closed += 1;
                    info!(
                        bucket = %bundle.bucket,
                        bundle = %bundle.name,
                        files = bundle.files,
                        size = bundle.size,
                        ?status,
                        "closed bundle"
                    );
                }
                Err(RepoError::TransitionConflict { .. }) => {
                    debug!(bucket = %bundle.bucket, bundle = %bundle.name, "bundle changed during finalize scan");
                }
                Err(err) => {
                    error!(bucket = %bundle.bucket, bundle = %bundle.name, "failed to close bundle: {}", err);
                }
            }
        }
        Ok(closed)
    }

    /// One submit pass for `chain`'s account. Returns how many bundles
    /// reached CreatedOnChain.
    pub async fn submit_tick(&self, chain: &dyn ChainClient) -> RepoResult<usize> {
        let now = Utc::now();
        let mut submitted = 0;
        for bundle in self.bundles.get_finalized_bundles_by_account(chain.account()).await? {
            if !self
                .settings
                .retry
                .is_time_to_retry(bundle.retry_counter, bundle.updated_at, now)
            {
                continue;
            }

            match self.submit_bundle(&bundle, chain).await {
                Ok((tx_hash, object_id)) => {
                    match self.bundles.mark_created_on_chain(bundle.id, &tx_hash, object_id).await {
                        Ok(()) => {
                            submitted += 1;
                            info!(
                                bucket = %bundle.bucket,
                                bundle = %bundle.name,
                                object_id,
                                tx_hash = %tx_hash,
                                "bundle created on chain"
                            );
                        }
                        Err(err) => {
                            warn!(bucket = %bundle.bucket, bundle = %bundle.name, "bundle submitted but not recorded: {}", err);
                        }
                    }
                }
                Err(err) => {
                    error!(
                        bucket = %bundle.bucket,
                        bundle = %bundle.name,
                        retry_counter = bundle.retry_counter,
                        "failed to submit bundle: {}",
                        err
                    );
                    self.record_failure(&bundle, BundleStatus::Finalized, &err).await;
                }
            }
        }
        Ok(submitted)
    }

    async fn submit_bundle(&self, bundle: &Bundle, chain: &dyn ChainClient) -> Result<(String, i64), StepError> {
        let packed = self.packer.pack(bundle).await?;
        let result = self.push_to_chain(bundle, &packed, chain).await;
        packed.discard().await;
        result
    }

    /// Create the chain object unless an earlier attempt already did, then
    /// upload the container unless it is already sealed.
    async fn push_to_chain(
        &self,
        bundle: &Bundle,
        packed: &PackedBundle,
        chain: &dyn ChainClient,
    ) -> Result<(String, i64), StepError> {
        let tx_hash = match chain.head_object(&bundle.bucket, &bundle.name).await? {
            Some(existing) => {
                debug!(bucket = %bundle.bucket, bundle = %bundle.name, "chain object already exists");
                existing.create_tx_hash
            }
            None => {
                let opts = CreateObjectOptions {
                    visibility: Visibility::PublicRead,
                    content_type: BUNDLE_CONTENT_TYPE.to_string(),
                    fee_granter: Some(bundle.owner.clone()),
                };
                chain
                    .create_object(&bundle.bucket, &bundle.name, packed.open().await?, &opts)
                    .await?
            }
        };

        let detail = chain
            .head_object(&bundle.bucket, &bundle.name)
            .await?
            .ok_or_else(|| ChainError::ObjectNotFound {
                bucket: bundle.bucket.clone(),
                name: bundle.name.clone(),
            })?;

        if detail.status != ObjectStatus::Sealed {
            chain
                .put_object(
                    &bundle.bucket,
                    &bundle.name,
                    packed.size,
                    packed.open().await?,
                    BUNDLE_CONTENT_TYPE,
                )
                .await?;
        }
        Ok((tx_hash, detail.id))
    }

    /// One seal-check pass for `chain`'s account. Returns how many bundles
    /// were sealed.
    pub async fn seal_tick(&self, chain: &dyn ChainClient) -> RepoResult<usize> {
        let mut sealed = 0;
        for bundle in self
            .bundles
            .get_created_on_chain_bundles_by_account(chain.account())
            .await?
        {
            if self.is_sealed(&bundle, chain).await {
                match self.bundles.mark_sealed(bundle.id).await {
                    Ok(()) => {
                        sealed += 1;
                        info!(bucket = %bundle.bucket, bundle = %bundle.name, "bundle sealed on chain");
                        self.purge_staged_objects(&bundle).await;
                    }
                    Err(err) => {
                        warn!(bucket = %bundle.bucket, bundle = %bundle.name, "failed to mark bundle sealed: {}", err);
                    }
                }
                continue;
            }

            let now = Utc::now();
            let waited = (now - bundle.updated_at).to_std().unwrap_or(Duration::ZERO);
            if bundle.retry_counter == 0 && waited < self.settings.max_seal_time {
                continue;
            }
            if !self
                .settings
                .retry
                .is_time_to_retry(bundle.retry_counter, bundle.updated_at, now)
            {
                continue;
            }

            match chain.cancel_create_object(&bundle.bucket, &bundle.name).await {
                Ok(()) => match self.bundles.reopen_for_resubmission(bundle.id).await {
                    Ok(()) => {
                        warn!(
                            bucket = %bundle.bucket,
                            bundle = %bundle.name,
                            "bundle not sealed in time, cancelled for resubmission"
                        );
                    }
                    Err(err) => {
                        warn!(bucket = %bundle.bucket, bundle = %bundle.name, "cancelled but not reopened: {}", err);
                    }
                },
                Err(err) => {
                    error!(bucket = %bundle.bucket, bundle = %bundle.name, "failed to cancel bundle: {}", err);
                    self.record_failure(&bundle, BundleStatus::CreatedOnChain, &StepError::Chain(err))
                        .await;
                }
            }
        }
        Ok(sealed)
    }

    /// A lookup failure counts as not sealed yet.
    async fn is_sealed(&self, bundle: &Bundle, chain: &dyn ChainClient) -> bool {
        let Some(object_id) = bundle.object_id else {
            return false;
        };
        match chain.head_object_by_id(object_id).await {
            Ok(detail) => detail.status == ObjectStatus::Sealed,
            Err(err) => {
                debug!(bucket = %bundle.bucket, bundle = %bundle.name, "seal lookup failed: {}", err);
                false
            }
        }
    }

    async fn record_failure(&self, bundle: &Bundle, status: BundleStatus, err: &StepError) {
        if let Err(db_err) = self
            .bundles
            .record_failure(bundle.id, status, &err.to_string())
            .await
        {
            warn!(bucket = %bundle.bucket, bundle = %bundle.name, "failed to record bundle failure: {}", db_err);
        }
    }

    /// Staged copies are no longer needed once the chain holds the bundle.
    async fn purge_staged_objects(&self, bundle: &Bundle) {
        let objects = match self.objects.get_bundle_objects(&bundle.bucket, &bundle.name).await {
            Ok(objects) => objects,
            Err(err) => {
                warn!(bucket = %bundle.bucket, bundle = %bundle.name, "failed to list objects for purge: {}", err);
                return;
            }
        };
        for object in objects {
            if let Err(err) = self
                .staging
                .delete(&bundle.bucket, &bundle.name, &object.object_name)
                .await
            {
                warn!(
                    bucket = %bundle.bucket,
                    bundle = %bundle.name,
                    object = %object.object_name,
                    "failed to purge staged object: {}",
                    err
                );
            }
        }
    }

    /// Start the finalize scan plus a submit and a seal-check loop for each
    /// chain client. All loops stop between ticks once `shutdown` fires.
    pub fn spawn(&self, chains: Vec<Arc<dyn ChainClient>>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(1 + chains.len() * 2);

        let bundler = self.clone();
        handles.push(tokio::spawn(every(
            self.settings.finalize_interval,
            shutdown.clone(),
            move || {
                let bundler = bundler.clone();
                async move {
                    if let Err(err) = bundler.finalize_tick().await {
                        error!("finalize scan failed: {}", err);
                    }
                }
            },
        )));

        for chain in chains {
            info!(account = %chain.account(), "starting bundler loops");

            let bundler = self.clone();
            let submit_chain = chain.clone();
            handles.push(tokio::spawn(every(
                self.settings.submit_interval,
                shutdown.clone(),
                move || {
                    let bundler = bundler.clone();
                    let chain = submit_chain.clone();
                    async move {
                        if let Err(err) = bundler.submit_tick(chain.as_ref()).await {
                            error!(account = %chain.account(), "submit pass failed: {}", err);
                        }
                    }
                },
            )));

            let bundler = self.clone();
            handles.push(tokio::spawn(every(
                self.settings.seal_interval,
                shutdown.clone(),
                move || {
                    let bundler = bundler.clone();
                    let chain = chain.clone();
                    async move {
                        if let Err(err) = bundler.seal_tick(chain.as_ref()).await {
                            error!(account = %chain.account(), "seal-check pass failed: {}", err);
                        }
                    }
                },
            )));
        }

        handles
    }
}

/// Run `tick` every `period` until `shutdown` fires. A tick in progress is
/// always allowed to finish.
async fn every<F, Fut>(period: Duration, shutdown: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::testing::temp_db,
        services::{
            bundle_repo::new_bundle,
            chain::{ChainOp, MemoryLedger},
            object_repo::new_object,
            staging::{LocalStaging, stream_from_bytes},
        },
    };

    struct Fixture {
        _db_dir: tempfile::TempDir,
        _dir: tempfile::TempDir,
        db: Arc<sqlx::SqlitePool>,
        bundles: BundleRepository,
        objects: ObjectRepository,
        staging: Arc<LocalStaging>,
        bundler: Bundler,
        ledger: MemoryLedger,
    }

    async fn fixture() -> Fixture {
        let (db_dir, db) = temp_db().await;
        let db = Arc::new(db);
        let dir = tempfile::tempdir().unwrap();
        let staging = Arc::new(LocalStaging::new(dir.path().join("staging")));
        let bundles = BundleRepository::new(db.clone());
        let objects = ObjectRepository::new(db.clone());
        let packer = BundlePacker::new(objects.clone(), staging.clone(), dir.path().join("work"));
        let bundler = Bundler::new(
            bundles.clone(),
            objects.clone(),
            packer,
            staging.clone(),
            BundlerSettings::default(),
        );
        Fixture {
            _db_dir: db_dir,
            _dir: dir,
            db,
            bundles,
            objects,
            staging,
            bundler,
            ledger: MemoryLedger::new(),
        }
    }

    /// A Finalized bundle holding one staged 4-byte object.
    async fn finalized(f: &Fixture) -> Bundle {
        let bundle = f
            .bundles
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        f.staging
            .put("b1", "bundle-0", "a", stream_from_bytes("abcd"))
            .await
            .unwrap();
        f.objects
            .append_object(&new_object("b1", "bundle-0", "a", 4))
            .await
            .unwrap();
        let bundle = f.bundles.query_bundle("b1", &bundle.name).await.unwrap().unwrap();
        f.bundles.close_bundling(&bundle).await.unwrap();
        f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap()
    }

    async fn age(f: &Fixture, bundle: &Bundle, secs: i64) {
        sqlx::query("UPDATE bundles SET updated_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::seconds(secs))
            .bind(bundle.id)
            .execute(&*f.db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finalize_leaves_bundles_under_threshold() {
        let f = fixture().await;
        f.bundles
            .create_bundling_bundle_if_absent(&new_bundle("b1", "bundle-0"))
            .await
            .unwrap();
        assert_eq!(f.bundler.finalize_tick().await.unwrap(), 0);
        let bundle = f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(bundle.status, BundleStatus::Bundling);
    }

    #[tokio::test]
    async fn submit_only_touches_the_loops_own_account() {
        let f = fixture().await;
        finalized(&f).await;
        let other = f.ledger.client("0xsomeone-else");
        assert_eq!(f.bundler.submit_tick(&other).await.unwrap(), 0);
        assert!(f.ledger.object("b1", "bundle-0").is_none());
    }

    #[tokio::test]
    async fn submit_reuses_an_object_created_by_an_earlier_attempt() {
        let f = fixture().await;
        let bundle = finalized(&f).await;
        let chain = f.ledger.client("0xbundler");

        // The create lands but the upload fails.
        f.ledger.fail_next(ChainOp::PutObject, 1);
        assert_eq!(f.bundler.submit_tick(&chain).await.unwrap(), 0);
        let created = f.ledger.object("b1", "bundle-0").unwrap();
        let failed = f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(failed.retry_counter, 1);
        assert!(failed.err_message.contains("injected"));

        age(&f, &bundle, 61).await;
        assert_eq!(f.bundler.submit_tick(&chain).await.unwrap(), 1);
        let done = f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(done.status, BundleStatus::CreatedOnChain);
        assert_eq!(done.tx_hash.as_deref(), Some(created.create_tx_hash.as_str()));
        assert_eq!(done.object_id, Some(created.id));
        assert_eq!(f.ledger.content("b1", "bundle-0").unwrap(), "abcd");
    }

    #[tokio::test]
    async fn failed_bundle_waits_for_its_retry_interval() {
        let f = fixture().await;
        finalized(&f).await;
        let chain = f.ledger.client("0xbundler");

        f.ledger.fail_next(ChainOp::CreateObject, 1);
        f.bundler.submit_tick(&chain).await.unwrap();
        // Not yet due: the next pass leaves the bundle alone.
        assert_eq!(f.bundler.submit_tick(&chain).await.unwrap(), 0);
        let bundle = f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(bundle.status, BundleStatus::Finalized);
        assert_eq!(bundle.retry_counter, 1);
    }

    #[tokio::test]
    async fn sealed_bundle_is_promoted_and_purged() {
        let f = fixture().await;
        finalized(&f).await;
        let chain = f.ledger.client("0xbundler");
        f.bundler.submit_tick(&chain).await.unwrap();

        assert_eq!(f.bundler.seal_tick(&chain).await.unwrap(), 0);
        f.ledger.seal("b1", "bundle-0").unwrap();
        assert_eq!(f.bundler.seal_tick(&chain).await.unwrap(), 1);

        let bundle = f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(bundle.status, BundleStatus::SealedOnChain);
        assert!(matches!(
            f.staging.get("b1", "bundle-0", "a").await,
            Err(crate::services::staging::StagingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_cancel_is_counted_and_retried() {
        let f = fixture().await;
        let bundle = finalized(&f).await;
        let chain = f.ledger.client("0xbundler");
        f.bundler.submit_tick(&chain).await.unwrap();

        age(&f, &bundle, 25 * 60 * 60).await;
        f.ledger.fail_next(ChainOp::CancelCreateObject, 1);
        f.bundler.seal_tick(&chain).await.unwrap();
        let failed = f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(failed.status, BundleStatus::CreatedOnChain);
        assert_eq!(failed.retry_counter, 1);

        // Too soon for the next cancel attempt.
        f.bundler.seal_tick(&chain).await.unwrap();
        assert!(f.ledger.object("b1", "bundle-0").is_some());

        age(&f, &bundle, 61).await;
        f.bundler.seal_tick(&chain).await.unwrap();
        let reopened = f.bundles.query_bundle("b1", "bundle-0").await.unwrap().unwrap();
        assert_eq!(reopened.status, BundleStatus::Finalized);
        assert_eq!(reopened.retry_counter, 0);
        assert!(f.ledger.object("b1", "bundle-0").is_none());
    }

    #[tokio::test]
    async fn spawned_loops_stop_on_shutdown() {
        let f = fixture().await;
        let shutdown = CancellationToken::new();
        let chain: Arc<dyn ChainClient> = Arc::new(f.ledger.client("0xbundler"));
        let handles = f.bundler.spawn(vec![chain], shutdown.clone());
        assert_eq!(handles.len(), 3);

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
