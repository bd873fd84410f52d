//! Database migrations for the repository sync service.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000100_create_connections;
mod m2025_12_01_000200_create_repos;
mod m2025_12_01_000300_create_repo_to_connections;
mod m2025_12_01_000400_create_repo_jobs;
mod m2025_12_01_000500_create_secrets;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000100_create_connections::Migration),
            Box::new(m2025_12_01_000200_create_repos::Migration),
            Box::new(m2025_12_01_000300_create_repo_to_connections::Migration),
            Box::new(m2025_12_01_000400_create_repo_jobs::Migration),
            Box::new(m2025_12_01_000500_create_secrets::Migration),
        ]
    }
}
