//! src/services/bundle_service.rs
//!
//! BundleService: the operations clients call: uploading objects into the
//! bucket's Bundling bundle, explicit bundle management, object reads and
//! bundle rules. The lifecycle loops in `bundler.rs` take over once a
//! bundle is closed.

use crate::{
    models::{
        bundle::{Bundle, BundleStatus, NewBundle},
        bundle_rule::{BundlePolicy, BundleRule},
        bundler_account::UserBundlerAccount,
        object::{NewObject, Object},
    },
    services::{
        bundle_repo::{BundleRepository, RepoError},
        bundler_accounts::{AccountError, BundlerAccountPool},
        chain::{ChainClient, ChainError},
        object_repo::ObjectRepository,
        rule_store::{BundleRuleStore, RuleError},
        staging::{ByteReader, ByteStream, StagingError, StagingStorage, ensure_key_safe, stream_from_bytes},
    },
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Cursor},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attempts at landing an upload when the Bundling bundle closes between
/// lookup and append.
const UPLOAD_ATTEMPTS: usize = 3;

/// Generated names tried before giving up on creating a bundle.
const NAME_ATTEMPTS: usize = 16;

const MAX_ADDRESS_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },
    #[error("object exceeds the {limit} byte upload limit")]
    ObjectTooLarge { limit: u64 },
    #[error("declared sha256 does not match the uploaded content")]
    ChecksumMismatch,
    #[error("`{caller}` does not own bundle `{bucket}/{name}`")]
    PermissionDenied {
        caller: String,
        bucket: String,
        name: String,
    },
    #[error("object `{object}` not found in bundle `{bucket}/{bundle}`")]
    ObjectNotFound {
        bucket: String,
        bundle: String,
        object: String,
    },
    #[error("object `{object}` is neither staged nor readable from chain (bundle is {status:?})")]
    ObjectUnavailable { object: String, status: BundleStatus },
    #[error("no chain client for bundler account `{0}`")]
    NoChainClient(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error(transparent)]
    Account(#[from] AccountError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Metadata of an upload; the bytes travel separately.
#[derive(Clone, Debug)]
pub struct UploadObject {
    pub owner: String,
    pub bucket: String,
    pub object_name: String,
    pub content_type: String,
    /// Hex-encoded SHA-256 of the content, as declared by the client.
    pub sha256: String,
    pub tags: BTreeMap<String, String>,
}

/// An object's metadata plus a reader over its bytes.
pub struct ObjectContent {
    pub object: Object,
    pub body: ByteReader,
}

#[derive(Clone)]
pub struct BundleService {
    bundles: BundleRepository,
    objects: ObjectRepository,
    rules: BundleRuleStore,
    accounts: BundlerAccountPool,
    staging: Arc<dyn StagingStorage>,
    chains: Arc<HashMap<String, Arc<dyn ChainClient>>>,
    max_object_size: u64,
}

impl BundleService {
    pub fn new(
        db: Arc<SqlitePool>,
        staging: Arc<dyn StagingStorage>,
        chains: &[Arc<dyn ChainClient>],
        default_policy: BundlePolicy,
        max_object_size: u64,
    ) -> Self {
        let chains = chains
            .iter()
            .map(|chain| (chain.account().to_string(), chain.clone()))
            .collect();
        Self {
            bundles: BundleRepository::new(db.clone()),
            objects: ObjectRepository::new(db.clone()),
            rules: BundleRuleStore::new(db.clone(), default_policy),
            accounts: BundlerAccountPool::new(db),
            staging,
            chains: Arc::new(chains),
            max_object_size,
        }
    }

    pub fn accounts(&self) -> &BundlerAccountPool {
        &self.accounts
    }

    /// Store an object in the bucket's Bundling bundle, creating the bundle
    /// when there is none. Returns the stored object; its `bundle_name` is
    /// the bundle it landed in.
    pub async fn upload_object(&self, req: UploadObject, body: ByteStream) -> ServiceResult<Object> {
        validate_address("owner", &req.owner)?;
        check_name("bucket name", &req.bucket)?;
        check_name("object name", &req.object_name)?;
        if req.content_type.trim().is_empty() {
            return Err(invalid("content type", "must not be empty"));
        }
        let declared = decode_sha256(&req.sha256)?;

        let payload = collect_limited(body, self.max_object_size).await?;
        let digest: [u8; 32] = Sha256::digest(&payload).into();
        if digest != declared {
            return Err(ServiceError::ChecksumMismatch);
        }
        let hash = hex::encode(digest);

        let mut attempt = 1;
        loop {
            let bundle = self.get_or_create_bundling_bundle(&req.owner, &req.bucket).await?;
            match self.stage_and_append(&bundle, &req, payload.clone(), &hash).await {
                Err(ServiceError::Repo(
                    RepoError::NoBundlingBundle(_) | RepoError::BundleNameMismatch { .. },
                )) if attempt < UPLOAD_ATTEMPTS => {
                    debug!(bucket = %req.bucket, bundle = %bundle.name, "bundle closed during upload, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn stage_and_append(
        &self,
        bundle: &Bundle,
        req: &UploadObject,
        payload: Bytes,
        hash: &str,
    ) -> ServiceResult<Object> {
        // Checked before staging so a duplicate never overwrites the
        // first upload's staged bytes.
        if self
            .objects
            .get_object(&req.bucket, &bundle.name, &req.object_name)
            .await?
            .is_some()
        {
            return Err(RepoError::ObjectAlreadyExists {
                bucket: req.bucket.clone(),
                bundle: bundle.name.clone(),
                object: req.object_name.clone(),
            }
            .into());
        }
        if !bundle.has_capacity() {
            return Err(RepoError::BundleFull {
                bucket: bundle.bucket.clone(),
                name: bundle.name.clone(),
            }
            .into());
        }

        let size = self
            .staging
            .put(&req.bucket, &bundle.name, &req.object_name, stream_from_bytes(payload))
            .await?;

        let new_object = NewObject {
            bucket: req.bucket.clone(),
            bundle_name: bundle.name.clone(),
            object_name: req.object_name.clone(),
            owner: req.owner.clone(),
            content_type: req.content_type.clone(),
            size: size as i64,
            hash_algo: "sha256".to_string(),
            hash: hash.to_string(),
            tags: req.tags.clone(),
        };
        match self.objects.append_object(&new_object).await {
            Ok(object) => {
                debug!(bucket = %object.bucket, bundle = %object.bundle_name, object = %object.object_name, size, "object appended");
                Ok(object)
            }
            Err(err) => {
                // A concurrent upload of the same name owns the staged file.
                if !matches!(err, RepoError::ObjectAlreadyExists { .. }) {
                    if let Err(cleanup) = self
                        .staging
                        .delete(&req.bucket, &bundle.name, &req.object_name)
                        .await
                    {
                        warn!(bucket = %req.bucket, object = %req.object_name, "failed to remove staged object: {}", cleanup);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// The bucket's Bundling bundle, or a new one named `bundle-<nonce>`
    /// with the owner's bundler account and the current rule.
    async fn get_or_create_bundling_bundle(&self, owner: &str, bucket: &str) -> ServiceResult<Bundle> {
        if let Some(bundle) = self.bundles.get_bundling_bundle(bucket).await? {
            return Ok(bundle);
        }

        let mut candidate = self.new_bundle(owner, bucket, None).await?;
        for _ in 0..NAME_ATTEMPTS {
            match self.bundles.create_bundling_bundle_if_absent(&candidate).await {
                Ok(bundle) => {
                    info!(bucket, bundle = %bundle.name, bundler = %bundle.bundler_account, "bundle created");
                    return Ok(bundle);
                }
                Err(RepoError::BundlingBundleExists(_)) => {
                    return self
                        .bundles
                        .get_bundling_bundle(bucket)
                        .await?
                        .ok_or_else(|| RepoError::NoBundlingBundle(bucket.to_string()).into());
                }
                // An explicitly named bundle already holds this generated name.
                Err(RepoError::BundleAlreadyExists { name, .. }) => {
                    debug!(bucket, bundle = %name, "generated bundle name taken, moving to the next nonce");
                    candidate.nonce += 1;
                    candidate.name = generated_name(candidate.nonce);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(RepoError::BundleAlreadyExists {
            bucket: bucket.to_string(),
            name: candidate.name,
        }
        .into())
    }

    async fn new_bundle(&self, owner: &str, bucket: &str, name: Option<String>) -> ServiceResult<NewBundle> {
        let account = self.accounts.get_or_create_user_bundler_account(owner).await?;
        let policy = self.rules.resolve(owner, bucket).await?;
        let nonce = self.bundles.next_nonce(bucket).await?;
        Ok(NewBundle {
            owner: owner.to_string(),
            bucket: bucket.to_string(),
            name: name.unwrap_or_else(|| generated_name(nonce)),
            bundler_account: account.bundler_address,
            max_files: policy.max_files,
            max_size: policy.max_size,
            max_finalize_time: policy.max_finalize_time,
            nonce,
        })
    }

    /// Explicitly open a Bundling bundle. Fails when the bucket already has
    /// one.
    pub async fn create_bundle(&self, owner: &str, bucket: &str, name: Option<String>) -> ServiceResult<Bundle> {
        validate_address("owner", owner)?;
        check_name("bucket name", bucket)?;
        if let Some(name) = &name {
            check_name("bundle name", name)?;
        }
        let candidate = self.new_bundle(owner, bucket, name).await?;
        let bundle = self.bundles.create_bundling_bundle_if_absent(&candidate).await?;
        info!(bucket, bundle = %bundle.name, "bundle created on request");
        Ok(bundle)
    }

    /// Close a Bundling bundle ahead of its thresholds.
    pub async fn finalize_bundle(&self, owner: &str, bucket: &str, name: &str) -> ServiceResult<Bundle> {
        let bundle = self.owned_bundle(owner, bucket, name).await?;
        if bundle.status != BundleStatus::Bundling {
            return Err(RepoError::InvalidStatus {
                bucket: bucket.to_string(),
                name: name.to_string(),
                status: bundle.status,
            }
            .into());
        }
        let status = self.bundles.close_bundling(&bundle).await?;
        info!(bucket, bundle = name, ?status, "bundle finalized on request");
        self.require_bundle(bucket, name).await
    }

    /// Delete a bundle that has not been sealed, with its objects.
    pub async fn delete_bundle(&self, owner: &str, bucket: &str, name: &str) -> ServiceResult<Bundle> {
        self.owned_bundle(owner, bucket, name).await?;
        let objects = self.objects.get_bundle_objects(bucket, name).await?;
        self.bundles.delete_bundle(bucket, name).await?;
        info!(bucket, bundle = name, files = objects.len(), "bundle deleted");

        for object in &objects {
            if let Err(err) = self.staging.delete(bucket, name, &object.object_name).await {
                warn!(bucket, bundle = name, object = %object.object_name, "failed to remove staged object: {}", err);
            }
        }
        self.require_bundle(bucket, name).await
    }

    pub async fn query_bundle(&self, bucket: &str, name: &str) -> ServiceResult<Bundle> {
        self.require_bundle(bucket, name).await
    }

    pub async fn query_bundling_bundle(&self, bucket: &str) -> ServiceResult<Bundle> {
        self.bundles
            .get_bundling_bundle(bucket)
            .await?
            .ok_or_else(|| RepoError::NoBundlingBundle(bucket.to_string()).into())
    }

    /// An object's bytes: from staging while present, otherwise as a range
    /// of the bundle's chain object.
    pub async fn get_object(&self, bucket: &str, bundle: &str, object: &str) -> ServiceResult<ObjectContent> {
        let row = self
            .objects
            .get_object(bucket, bundle, object)
            .await?
            .ok_or_else(|| ServiceError::ObjectNotFound {
                bucket: bucket.to_string(),
                bundle: bundle.to_string(),
                object: object.to_string(),
            })?;

        match self.staging.get(bucket, bundle, object).await {
            Ok(body) => return Ok(ObjectContent { object: row, body }),
            Err(StagingError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let parent = self.require_bundle(bucket, bundle).await?;
        if !matches!(
            parent.status,
            BundleStatus::CreatedOnChain | BundleStatus::SealedOnChain
        ) {
            return Err(ServiceError::ObjectUnavailable {
                object: object.to_string(),
                status: parent.status,
            });
        }
        let chain = self
            .chains
            .get(&parent.bundler_account)
            .ok_or_else(|| ServiceError::NoChainClient(parent.bundler_account.clone()))?;
        let bytes = chain
            .get_object_range(bucket, bundle, row.offset_in_bundle as u64, row.size as u64)
            .await?;
        Ok(ObjectContent {
            object: row,
            body: Box::pin(Cursor::new(bytes)),
        })
    }

    pub async fn set_bundle_rule(&self, owner: &str, bucket: &str, policy: BundlePolicy) -> ServiceResult<BundleRule> {
        validate_address("owner", owner)?;
        check_name("bucket name", bucket)?;
        let rule = self.rules.set(owner, bucket, policy).await?;
        info!(owner, bucket, ?policy, "bundle rule set");
        Ok(rule)
    }

    /// The thresholds new bundles of `(owner, bucket)` get.
    pub async fn query_bundle_rule(&self, owner: &str, bucket: &str) -> ServiceResult<BundlePolicy> {
        Ok(self.rules.resolve(owner, bucket).await?)
    }

    pub async fn get_or_create_user_bundler_account(&self, user: &str) -> ServiceResult<UserBundlerAccount> {
        validate_address("user", user)?;
        Ok(self.accounts.get_or_create_user_bundler_account(user).await?)
    }

    async fn require_bundle(&self, bucket: &str, name: &str) -> ServiceResult<Bundle> {
        self.bundles
            .query_bundle(bucket, name)
            .await?
            .ok_or_else(|| {
                RepoError::BundleNotFound {
                    bucket: bucket.to_string(),
                    name: name.to_string(),
                }
                .into()
            })
    }

    async fn owned_bundle(&self, caller: &str, bucket: &str, name: &str) -> ServiceResult<Bundle> {
        let bundle = self.require_bundle(bucket, name).await?;
        if bundle.owner != caller {
            return Err(ServiceError::PermissionDenied {
                caller: caller.to_string(),
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }
        Ok(bundle)
    }
}

/// Parse the JSON object of string tags sent with an upload. An empty
/// value means no tags.
pub fn parse_tags(raw: &str) -> ServiceResult<BTreeMap<String, String>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(raw).map_err(|err| invalid("tags", err.to_string()))
}

fn generated_name(nonce: i64) -> String {
    format!("bundle-{}", nonce)
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ServiceError {
    ServiceError::InvalidArgument {
        field,
        reason: reason.into(),
    }
}

fn check_name(kind: &'static str, value: &str) -> ServiceResult<()> {
    ensure_key_safe(kind, value).map_err(|_| invalid(kind, format!("`{}` is not allowed", value)))
}

fn validate_address(field: &'static str, value: &str) -> ServiceResult<()> {
    if value.is_empty() || value.len() > MAX_ADDRESS_LEN || value.chars().any(char::is_whitespace) {
        return Err(invalid(field, format!("`{}` is not a valid address", value)));
    }
    Ok(())
}

fn decode_sha256(value: &str) -> ServiceResult<[u8; 32]> {
    let bytes = hex::decode(value.trim()).map_err(|err| invalid("sha256", err.to_string()))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| invalid("sha256", "expected 32 bytes"))
}

async fn collect_limited(mut body: ByteStream, limit: u64) -> ServiceResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(ServiceError::ObjectTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}
