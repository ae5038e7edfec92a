//! End-to-end bundle lifecycle against a temporary database, local staging
//! and the in-process chain ledger.

use bundle_service::{
    db,
    models::{bundle::BundleStatus, bundle_rule::BundlePolicy},
    services::{
        bundle_repo::BundleRepository,
        bundle_service::{BundleService, UploadObject},
        bundler::{Bundler, BundlerSettings},
        chain::{ChainClient, ChainOp, MemoryChainClient, MemoryLedger},
        object_repo::ObjectRepository,
        packer::BundlePacker,
        staging::{LocalStaging, stream_from_bytes},
    },
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

const OWNER: &str = "0xowner";
const BUNDLER: &str = "0xbundler";

struct Harness {
    _dir: TempDir,
    db: Arc<SqlitePool>,
    ledger: MemoryLedger,
    chain: MemoryChainClient,
    bundles: BundleRepository,
    objects: ObjectRepository,
    service: BundleService,
    bundler: Bundler,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("bundle.db").display());
        let db = Arc::new(db::connect(&url, 8).await.unwrap());
        db::run_migrations(&db).await.unwrap();

        let staging = Arc::new(LocalStaging::new(dir.path().join("staging")));
        let ledger = MemoryLedger::new();
        let chain = ledger.client(BUNDLER);
        let chains: Vec<Arc<dyn ChainClient>> = vec![Arc::new(chain.clone())];

        let service = BundleService::new(
            db.clone(),
            staging.clone(),
            &chains,
            BundlePolicy::default(),
            10 * 1024 * 1024,
        );
        service.accounts().register(BUNDLER).await.unwrap();

        let bundles = BundleRepository::new(db.clone());
        let objects = ObjectRepository::new(db.clone());
        let packer = BundlePacker::new(objects.clone(), staging.clone(), dir.path().join("work"));
        let bundler = Bundler::new(
            bundles.clone(),
            objects.clone(),
            packer,
            staging,
            BundlerSettings::default(),
        );

        Self {
            _dir: dir,
            db,
            ledger,
            chain,
            bundles,
            objects,
            service,
            bundler,
        }
    }

    async fn upload(&self, bucket: &str, name: &str, body: &'static [u8]) -> String {
        let req = UploadObject {
            owner: OWNER.into(),
            bucket: bucket.into(),
            object_name: name.into(),
            content_type: "application/octet-stream".into(),
            sha256: hex::encode(Sha256::digest(body)),
            tags: BTreeMap::new(),
        };
        self.service
            .upload_object(req, stream_from_bytes(body))
            .await
            .unwrap()
            .bundle_name
    }

    /// Pretend the bundle's last update happened `secs` seconds ago.
    async fn backdate(&self, bucket: &str, name: &str, secs: i64) {
        sqlx::query("UPDATE bundles SET updated_at = ? WHERE bucket = ? AND name = ?")
            .bind(Utc::now() - chrono::Duration::seconds(secs))
            .bind(bucket)
            .bind(name)
            .execute(&*self.db)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn full_bundle_is_packed_submitted_and_sealed() {
    let h = Harness::new().await;
    h.service
        .set_bundle_rule(
            OWNER,
            "b1",
            BundlePolicy {
                max_files: 2,
                ..BundlePolicy::default()
            },
        )
        .await
        .unwrap();

    let name = h.upload("b1", "first", b"0123456789").await;
    assert_eq!(h.upload("b1", "second", b"abcdefghij").await, name);

    assert_eq!(h.bundler.finalize_tick().await.unwrap(), 1);
    let bundle = h.service.query_bundle("b1", &name).await.unwrap();
    assert_eq!(bundle.status, BundleStatus::Finalized);

    assert_eq!(h.bundler.submit_tick(&h.chain).await.unwrap(), 1);
    let bundle = h.service.query_bundle("b1", &name).await.unwrap();
    assert_eq!(bundle.status, BundleStatus::CreatedOnChain);
    assert!(bundle.tx_hash.as_deref().is_some_and(|tx| !tx.is_empty()));
    assert_eq!(bundle.retry_counter, 0);

    let container = h.ledger.content("b1", &name).unwrap();
    assert_eq!(container.len(), 20);
    assert_eq!(h.ledger.creator("b1", &name).as_deref(), Some(BUNDLER));
    let offsets: Vec<i64> = h
        .objects
        .get_bundle_objects("b1", &name)
        .await
        .unwrap()
        .iter()
        .map(|o| o.offset_in_bundle)
        .collect();
    assert_eq!(offsets, vec![0, 10]);

    h.ledger.seal("b1", &name).unwrap();
    assert_eq!(h.bundler.seal_tick(&h.chain).await.unwrap(), 1);
    let bundle = h.service.query_bundle("b1", &name).await.unwrap();
    assert_eq!(bundle.status, BundleStatus::SealedOnChain);

    // Staged copies are gone; reads are served from the chain object.
    let mut content = h.service.get_object("b1", &name, "second").await.unwrap();
    let mut bytes = Vec::new();
    content.body.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes, b"abcdefghij");
}

#[tokio::test]
async fn empty_bundle_expires_and_is_never_submitted() {
    let h = Harness::new().await;
    h.service
        .set_bundle_rule(
            OWNER,
            "b2",
            BundlePolicy {
                max_finalize_time: 1,
                ..BundlePolicy::default()
            },
        )
        .await
        .unwrap();
    let bundle = h.service.create_bundle(OWNER, "b2", None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(h.bundler.finalize_tick().await.unwrap(), 1);
    let expired = h.service.query_bundle("b2", &bundle.name).await.unwrap();
    assert_eq!(expired.status, BundleStatus::Expired);

    assert_eq!(h.bundler.submit_tick(&h.chain).await.unwrap(), 0);
    assert!(h.ledger.object("b2", &bundle.name).is_none());
}

#[tokio::test]
async fn failed_create_is_retried_after_its_interval() {
    let h = Harness::new().await;
    let name = h.upload("b3", "only", b"payload").await;
    h.service.finalize_bundle(OWNER, "b3", &name).await.unwrap();

    h.ledger.fail_next(ChainOp::CreateObject, 1);
    assert_eq!(h.bundler.submit_tick(&h.chain).await.unwrap(), 0);
    let failed = h.bundles.query_bundle("b3", &name).await.unwrap().unwrap();
    assert_eq!(failed.status, BundleStatus::Finalized);
    assert_eq!(failed.retry_counter, 1);
    assert!(!failed.err_message.is_empty());

    h.backdate("b3", &name, 60).await;
    assert_eq!(h.bundler.submit_tick(&h.chain).await.unwrap(), 1);
    let created = h.bundles.query_bundle("b3", &name).await.unwrap().unwrap();
    assert_eq!(created.status, BundleStatus::CreatedOnChain);
    assert_eq!(created.retry_counter, 0);
    assert_eq!(created.err_message, "");
}

#[tokio::test]
async fn unsealed_bundle_is_cancelled_and_resubmitted() {
    let h = Harness::new().await;
    let name = h.upload("b4", "only", b"payload").await;
    h.service.finalize_bundle(OWNER, "b4", &name).await.unwrap();
    h.bundler.submit_tick(&h.chain).await.unwrap();

    // Within the seal window nothing happens.
    h.bundler.seal_tick(&h.chain).await.unwrap();
    let waiting = h.bundles.query_bundle("b4", &name).await.unwrap().unwrap();
    assert_eq!(waiting.status, BundleStatus::CreatedOnChain);

    h.backdate("b4", &name, 25 * 60 * 60).await;
    h.bundler.seal_tick(&h.chain).await.unwrap();
    let reopened = h.bundles.query_bundle("b4", &name).await.unwrap().unwrap();
    assert_eq!(reopened.status, BundleStatus::Finalized);
    assert_eq!(reopened.retry_counter, 0);
    assert!(reopened.tx_hash.is_none());
    assert!(h.ledger.object("b4", &name).is_none());

    // Objects and staged bytes were kept, so the bundle goes out again.
    assert_eq!(h.bundler.submit_tick(&h.chain).await.unwrap(), 1);
    assert_eq!(h.ledger.content("b4", &name).unwrap(), "payload");
}

#[tokio::test]
async fn explicit_name_does_not_block_generated_names() {
    let h = Harness::new().await;
    let explicit = h
        .service
        .create_bundle(OWNER, "b5", Some("bundle-1".into()))
        .await
        .unwrap();
    assert_eq!(explicit.nonce, 0);
    assert_eq!(h.upload("b5", "first", b"one").await, "bundle-1");
    h.service.finalize_bundle(OWNER, "b5", "bundle-1").await.unwrap();

    // Nonce 1 would generate `bundle-1` again, so the next bundle skips it.
    assert_eq!(h.upload("b5", "second", b"two").await, "bundle-2");
    assert_eq!(h.upload("b5", "third", b"three").await, "bundle-2");
    assert_eq!(h.upload("b5", "fourth", b"four").await, "bundle-2");

    let generated = h.service.query_bundle("b5", "bundle-2").await.unwrap();
    assert_eq!(generated.status, BundleStatus::Bundling);
    assert_eq!(generated.nonce, 2);
    assert_eq!(generated.files, 3);
}
