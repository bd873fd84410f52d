//! Secret repository
//!
//! Stores org scoped secrets encrypted with the service crypto key. Values are
//! bound to their `(org_id, key)` through the AEAD additional data.

use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use std::sync::Arc;

use crate::crypto::{CryptoError, CryptoKey, decrypt_secret, encrypt_secret};
use crate::db::db_now;
use crate::models::secret::{self, Entity as Secret};
use zeroize::Zeroizing;

/// Errors raised while storing or reading secrets.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error(transparent)]
    Db(#[from] DbErr),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Repository for secret database operations
#[derive(Debug, Clone)]
pub struct SecretRepository {
    pub db: Arc<DatabaseConnection>,
}

impl SecretRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Encrypt `value` and insert or replace the secret.
    pub async fn put(
        &self,
        crypto_key: &CryptoKey,
        org_id: i32,
        key: &str,
        value: &str,
    ) -> Result<(), SecretError> {
        let encrypted = encrypt_secret(crypto_key, org_id, key, value)?;

        let model = secret::ActiveModel {
            org_id: Set(org_id),
            key: Set(key.to_string()),
            encrypted_value: Set(encrypted),
            created_at: Set(db_now()),
        };

        Secret::insert(model)
            .on_conflict(
                OnConflict::columns([secret::Column::OrgId, secret::Column::Key])
                    .update_column(secret::Column::EncryptedValue)
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;

        Ok(())
    }

    pub async fn find(&self, org_id: i32, key: &str) -> Result<Option<secret::Model>, DbErr> {
        Secret::find()
            .filter(secret::Column::OrgId.eq(org_id))
            .filter(secret::Column::Key.eq(key))
            .one(&*self.db)
            .await
    }

    /// Decrypt a secret, returning `None` when it does not exist.
    pub async fn reveal(
        &self,
        crypto_key: &CryptoKey,
        org_id: i32,
        key: &str,
    ) -> Result<Option<Zeroizing<String>>, SecretError> {
        let Some(row) = self.find(org_id, key).await? else {
            return Ok(None);
        };
        Ok(Some(decrypt_secret(
            crypto_key,
            org_id,
            key,
            &row.encrypted_value,
        )?))
    }

    pub async fn delete(&self, org_id: i32, key: &str) -> Result<bool, DbErr> {
        let result = Secret::delete_many()
            .filter(secret::Column::OrgId.eq(org_id))
            .filter(secret::Column::Key.eq(key))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }
}
