//! Secret entity model

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// An org scoped, AES-GCM encrypted secret referenced by connection configs
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "secrets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub org_id: i32,

    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// Versioned ciphertext produced by [`crate::crypto::encrypt_bytes`]
    pub encrypted_value: Vec<u8>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
