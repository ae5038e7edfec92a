//! src/services/bundler_accounts.rs
//!
//! The bundler pool and the user → bundler assignment. A user is hashed
//! onto one pool member the first time they upload; the result is stored so
//! that later pool changes never move them to another submission loop.

use crate::models::bundler_account::{BundlerAccount, UserBundlerAccount};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("no bundler account is registered")]
    EmptyPool,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Deterministically map `user` onto `[0, pool_size)`: the SHA-256 digest of
/// the address, read as a big-endian unsigned integer, modulo the pool size.
pub fn pick_bundler_index(pool_size: usize, user: &str) -> Result<usize, AccountError> {
    if pool_size == 0 {
        return Err(AccountError::EmptyPool);
    }
    let digest = Sha256::digest(user.as_bytes());
    let modulus = pool_size as u128;
    let index = digest
        .iter()
        .fold(0u128, |acc, byte| (acc * 256 + u128::from(*byte)) % modulus);
    Ok(index as usize)
}

#[derive(Clone)]
pub struct BundlerAccountPool {
    db: Arc<SqlitePool>,
}

impl BundlerAccountPool {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Register a signer; a no-op when it is already known.
    pub async fn register(&self, account_address: &str) -> Result<(), AccountError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO bundler_accounts (account_address, status, created_at, updated_at)
             VALUES (?, 0, ?, ?)
             ON CONFLICT(account_address) DO NOTHING",
        )
        .bind(account_address)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    /// Registered accounts in registration order. The order is part of the
    /// assignment function, so it must stay stable.
    pub async fn list(&self) -> Result<Vec<BundlerAccount>, AccountError> {
        Ok(sqlx::query_as::<_, BundlerAccount>(
            "SELECT id, account_address, status, created_at, updated_at
             FROM bundler_accounts WHERE status = 0 ORDER BY id",
        )
        .fetch_all(&*self.db)
        .await?)
    }

    pub async fn get_user_bundler_account(
        &self,
        user: &str,
    ) -> Result<Option<UserBundlerAccount>, AccountError> {
        Ok(sqlx::query_as::<_, UserBundlerAccount>(
            "SELECT id, user_address, bundler_address, created_at, updated_at
             FROM user_bundler_accounts WHERE user_address = ?",
        )
        .bind(user)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// The user's bundler account, assigning one on first use. Two racing
    /// first uses both compute the same index; whichever insert lands
    /// first wins and both return the stored row.
    pub async fn get_or_create_user_bundler_account(
        &self,
        user: &str,
    ) -> Result<UserBundlerAccount, AccountError> {
        if let Some(existing) = self.get_user_bundler_account(user).await? {
            return Ok(existing);
        }

        let pool = self.list().await?;
        let index = pick_bundler_index(pool.len(), user)?;
        let bundler = &pool[index];

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO user_bundler_accounts (user_address, bundler_address, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(user_address) DO NOTHING",
        )
        .bind(user)
        .bind(&bundler.account_address)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;
        tracing::info!(user, bundler = %bundler.account_address, "assigned bundler account");

        self.get_user_bundler_account(user)
            .await?
            .ok_or(AccountError::EmptyPool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::temp_db;

    #[test]
    fn index_is_deterministic_and_in_range() {
        for size in 1..10 {
            let first = pick_bundler_index(size, "0x1234").unwrap();
            assert!(first < size);
            assert_eq!(first, pick_bundler_index(size, "0x1234").unwrap());
        }
        assert_eq!(pick_bundler_index(1, "anyone").unwrap(), 0);
        assert!(matches!(pick_bundler_index(0, "0x1"), Err(AccountError::EmptyPool)));
    }

    #[test]
    fn index_matches_big_integer_modulo() {
        // 256 == 1 (mod 3), so the digest mod 3 is its byte sum mod 3.
        let digest = Sha256::digest(b"0xabc");
        let expected = digest.iter().map(|b| u64::from(*b)).sum::<u64>() % 3;
        assert_eq!(pick_bundler_index(3, "0xabc").unwrap() as u64, expected);
    }

    #[tokio::test]
    async fn assignment_survives_pool_growth() {
        let (_dir, db) = temp_db().await;
        let pool = BundlerAccountPool::new(Arc::new(db));
        pool.register("0xbundler-a").await.unwrap();
        pool.register("0xbundler-a").await.unwrap();
        assert_eq!(pool.list().await.unwrap().len(), 1);

        let first = pool.get_or_create_user_bundler_account("0xuser").await.unwrap();
        assert_eq!(first.bundler_address, "0xbundler-a");

        for extra in ["0xbundler-b", "0xbundler-c", "0xbundler-d"] {
            pool.register(extra).await.unwrap();
        }
        let again = pool.get_or_create_user_bundler_account("0xuser").await.unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.bundler_address, "0xbundler-a");
    }

    #[tokio::test]
    async fn empty_pool_cannot_assign() {
        let (_dir, db) = temp_db().await;
        let pool = BundlerAccountPool::new(Arc::new(db));
        let err = pool.get_or_create_user_bundler_account("0xuser").await.unwrap_err();
        assert!(matches!(err, AccountError::EmptyPool));
    }
}
