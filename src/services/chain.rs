//! src/services/chain.rs
//!
//! The storage chain as seen by the orchestrator: a handful of object
//! primitives behind [`ChainClient`], one client per bundler account.
//!
//! [`MemoryLedger`] is an in-process chain. It keeps objects, ids and
//! create transactions in memory, verifies uploaded content against the
//! checksum committed at create time, and can be told to seal objects,
//! auto-seal on upload, or fail the next N calls of a given operation.

use crate::services::staging::ByteReader;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Content type bundles are created with on chain.
pub const BUNDLE_CONTENT_TYPE: &str = "bundle";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    /// Created, waiting for content and storage-provider seal.
    Created,
    Sealed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    PublicRead,
    Private,
}

#[derive(Clone, Debug, Serialize)]
pub struct ObjectDetail {
    pub id: i64,
    pub bucket: String,
    pub name: String,
    pub status: ObjectStatus,
    pub payload_size: u64,
    pub create_tx_hash: String,
}

#[derive(Clone, Debug)]
pub struct CreateObjectOptions {
    pub visibility: Visibility,
    pub content_type: String,
    /// Account paying the object's storage fee, when not the signer.
    pub fee_granter: Option<String>,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("object `{bucket}/{name}` not found on chain")]
    ObjectNotFound { bucket: String, name: String },
    #[error("object id {0} not found on chain")]
    ObjectIdNotFound(i64),
    #[error("object `{bucket}/{name}` already exists on chain")]
    ObjectAlreadyExists { bucket: String, name: String },
    #[error("object `{bucket}/{name}` is {status:?}")]
    InvalidObjectStatus {
        bucket: String,
        name: String,
        status: ObjectStatus,
    },
    #[error("payload of `{bucket}/{name}` does not match the checksum committed at create")]
    ChecksumMismatch { bucket: String, name: String },
    #[error("range {offset}+{len} is outside object `{name}` of {size} bytes")]
    RangeOutOfBounds {
        name: String,
        offset: u64,
        len: u64,
        size: u64,
    },
    #[error("chain rpc failed: {0}")]
    Rpc(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;

/// Object primitives used to push bundles on chain, signed by one
/// bundler account.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Address of the signing account.
    fn account(&self) -> &str;

    async fn head_object(&self, bucket: &str, name: &str) -> ChainResult<Option<ObjectDetail>>;

    /// Commit to an object's content; returns the create tx hash.
    async fn create_object(
        &self,
        bucket: &str,
        name: &str,
        payload: ByteReader,
        opts: &CreateObjectOptions,
    ) -> ChainResult<String>;

    /// Upload the content of a created object.
    async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        size: u64,
        payload: ByteReader,
        content_type: &str,
    ) -> ChainResult<()>;

    async fn head_object_by_id(&self, id: i64) -> ChainResult<ObjectDetail>;

    /// Withdraw an object that was created but never sealed.
    async fn cancel_create_object(&self, bucket: &str, name: &str) -> ChainResult<()>;

    async fn get_object_range(&self, bucket: &str, name: &str, offset: u64, len: u64) -> ChainResult<Bytes>;
}

/// Operations of [`ChainClient`], for failure injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainOp {
    HeadObject,
    CreateObject,
    PutObject,
    HeadObjectById,
    CancelCreateObject,
    GetObjectRange,
}

struct LedgerObject {
    id: i64,
    creator: String,
    status: ObjectStatus,
    checksum: [u8; 32],
    payload_size: u64,
    content: Option<Bytes>,
    create_tx_hash: String,
}

#[derive(Default)]
struct LedgerState {
    next_id: i64,
    tx_seq: u64,
    objects: HashMap<(String, String), LedgerObject>,
    ids: HashMap<i64, (String, String)>,
    failures: HashMap<ChainOp, u32>,
    auto_seal: bool,
}

impl LedgerState {
    fn take_failure(&mut self, op: ChainOp) -> ChainResult<()> {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(ChainError::Rpc(format!("injected {:?} failure", op)))
            }
            _ => Ok(()),
        }
    }

    fn tx_hash(&mut self, op: &str, account: &str, bucket: &str, name: &str) -> String {
        self.tx_seq += 1;
        let digest = Sha256::digest(format!("{}:{}:{}/{}:{}", op, account, bucket, name, self.tx_seq));
        format!("0x{}", hex::encode(digest))
    }

    fn detail(&self, bucket: &str, name: &str) -> Option<ObjectDetail> {
        self.objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|obj| ObjectDetail {
                id: obj.id,
                bucket: bucket.to_string(),
                name: name.to_string(),
                status: obj.status,
                payload_size: obj.payload_size,
                create_tx_hash: obj.create_tx_hash.clone(),
            })
    }
}

/// Shared in-process chain state. Cloning shares the ledger.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A client signing as `account`.
    pub fn client(&self, account: impl Into<String>) -> MemoryChainClient {
        MemoryChainClient {
            ledger: self.clone(),
            account: account.into(),
        }
    }

    /// Seal objects as soon as their content is uploaded.
    pub fn set_auto_seal(&self, enabled: bool) {
        self.lock().auto_seal = enabled;
    }

    /// Make the next `times` calls of `op` fail with an rpc error.
    pub fn fail_next(&self, op: ChainOp, times: u32) {
        self.lock().failures.insert(op, times);
    }

    /// Seal an uploaded object, as a storage provider would.
    pub fn seal(&self, bucket: &str, name: &str) -> ChainResult<()> {
        let mut state = self.lock();
        let obj = state
            .objects
            .get_mut(&(bucket.to_string(), name.to_string()))
            .ok_or_else(|| ChainError::ObjectNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            })?;
        if obj.content.is_none() {
            return Err(ChainError::InvalidObjectStatus {
                bucket: bucket.to_string(),
                name: name.to_string(),
                status: obj.status,
            });
        }
        obj.status = ObjectStatus::Sealed;
        Ok(())
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<ObjectDetail> {
        self.lock().detail(bucket, name)
    }

    /// Uploaded content of an object, if any.
    pub fn content(&self, bucket: &str, name: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .and_then(|obj| obj.content.clone())
    }

    /// Account that created an object.
    pub fn creator(&self, bucket: &str, name: &str) -> Option<String> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .map(|obj| obj.creator.clone())
    }
}

#[derive(Clone)]
pub struct MemoryChainClient {
    ledger: MemoryLedger,
    account: String,
}

async fn read_payload(mut payload: ByteReader) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    payload.read_to_end(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl ChainClient for MemoryChainClient {
    fn account(&self) -> &str {
        &self.account
    }

    async fn head_object(&self, bucket: &str, name: &str) -> ChainResult<Option<ObjectDetail>> {
        let mut state = self.ledger.lock();
        state.take_failure(ChainOp::HeadObject)?;
        Ok(state.detail(bucket, name))
    }

    async fn create_object(
        &self,
        bucket: &str,
        name: &str,
        payload: ByteReader,
        opts: &CreateObjectOptions,
    ) -> ChainResult<String> {
        // Checksums are computed client-side before the tx is signed.
        let body = read_payload(payload).await?;

        let mut state = self.ledger.lock();
        state.take_failure(ChainOp::CreateObject)?;
        let key = (bucket.to_string(), name.to_string());
        if state.objects.contains_key(&key) {
            return Err(ChainError::ObjectAlreadyExists {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        let tx_hash = state.tx_hash("create", &self.account, bucket, name);
        state.objects.insert(
            key.clone(),
            LedgerObject {
                id,
                creator: self.account.clone(),
                status: ObjectStatus::Created,
                checksum: Sha256::digest(&body).into(),
                payload_size: body.len() as u64,
                content: None,
                create_tx_hash: tx_hash.clone(),
            },
        );
        state.ids.insert(id, key);
        debug!(
            bucket,
            name,
            id,
            visibility = ?opts.visibility,
            content_type = %opts.content_type,
            fee_granter = ?opts.fee_granter,
            "ledger: object created"
        );
        Ok(tx_hash)
    }

    async fn put_object(
        &self,
        bucket: &str,
        name: &str,
        size: u64,
        payload: ByteReader,
        _content_type: &str,
    ) -> ChainResult<()> {
        let body = read_payload(payload).await?;

        let mut state = self.ledger.lock();
        state.take_failure(ChainOp::PutObject)?;
        let auto_seal = state.auto_seal;
        let obj = state
            .objects
            .get_mut(&(bucket.to_string(), name.to_string()))
            .ok_or_else(|| ChainError::ObjectNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            })?;
        if obj.status != ObjectStatus::Created {
            return Err(ChainError::InvalidObjectStatus {
                bucket: bucket.to_string(),
                name: name.to_string(),
                status: obj.status,
            });
        }
        let digest: [u8; 32] = Sha256::digest(&body).into();
        if body.len() as u64 != size || size != obj.payload_size || digest != obj.checksum {
            return Err(ChainError::ChecksumMismatch {
                bucket: bucket.to_string(),
                name: name.to_string(),
            });
        }
        obj.content = Some(Bytes::from(body));
        if auto_seal {
            obj.status = ObjectStatus::Sealed;
        }
        Ok(())
    }

    async fn head_object_by_id(&self, id: i64) -> ChainResult<ObjectDetail> {
        let mut state = self.ledger.lock();
        state.take_failure(ChainOp::HeadObjectById)?;
        let (bucket, name) = state.ids.get(&id).cloned().ok_or(ChainError::ObjectIdNotFound(id))?;
        state.detail(&bucket, &name).ok_or(ChainError::ObjectIdNotFound(id))
    }

    async fn cancel_create_object(&self, bucket: &str, name: &str) -> ChainResult<()> {
        let mut state = self.ledger.lock();
        state.take_failure(ChainOp::CancelCreateObject)?;
        let key = (bucket.to_string(), name.to_string());
        let obj = state.objects.get(&key).ok_or_else(|| ChainError::ObjectNotFound {
            bucket: bucket.to_string(),
            name: name.to_string(),
        })?;
        if obj.status == ObjectStatus::Sealed {
            return Err(ChainError::InvalidObjectStatus {
                bucket: bucket.to_string(),
                name: name.to_string(),
                status: obj.status,
            });
        }
        let id = obj.id;
        state.objects.remove(&key);
        state.ids.remove(&id);
        Ok(())
    }

    async fn get_object_range(&self, bucket: &str, name: &str, offset: u64, len: u64) -> ChainResult<Bytes> {
        let mut state = self.ledger.lock();
        state.take_failure(ChainOp::GetObjectRange)?;
        let obj = state
            .objects
            .get(&(bucket.to_string(), name.to_string()))
            .ok_or_else(|| ChainError::ObjectNotFound {
                bucket: bucket.to_string(),
                name: name.to_string(),
            })?;
        let content = obj.content.as_ref().ok_or_else(|| ChainError::InvalidObjectStatus {
            bucket: bucket.to_string(),
            name: name.to_string(),
            status: obj.status,
        })?;
        let size = content.len() as u64;
        let end = offset.checked_add(len).filter(|end| *end <= size);
        match end {
            Some(end) => Ok(content.slice(offset as usize..end as usize)),
            None => Err(ChainError::RangeOutOfBounds {
                name: name.to_string(),
                offset,
                len,
                size,
            }),
        }
    }
}
