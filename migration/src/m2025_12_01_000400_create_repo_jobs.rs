//! Migration to create the repo_jobs table.
//!
//! Job rows are append-only history and outlive the repo they point at, so
//! `repo_id` carries no foreign key. The partial unique index keeps at most one
//! PENDING or IN_PROGRESS job per repo.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{DatabaseBackend, Statement};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RepoJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(RepoJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(RepoJobs::JobType).text().not_null())
                    .col(
                        ColumnDef::new(RepoJobs::Status)
                            .text()
                            .not_null()
                            .default("PENDING"),
                    )
                    .col(ColumnDef::new(RepoJobs::RepoId).uuid().not_null())
                    .col(ColumnDef::new(RepoJobs::Metadata).json_binary().null())
                    .col(ColumnDef::new(RepoJobs::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(RepoJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(RepoJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(RepoJobs::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repo_jobs_repo_type_status")
                    .table(RepoJobs::Table)
                    .col(RepoJobs::RepoId)
                    .col(RepoJobs::JobType)
                    .col(RepoJobs::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repo_jobs_status_created")
                    .table(RepoJobs::Table)
                    .col(RepoJobs::Status)
                    .col(RepoJobs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        let backend = manager.get_database_backend();
        let sql = match backend {
            DatabaseBackend::Postgres => {
                "DO $$\nBEGIN\n    IF NOT EXISTS (\n        SELECT 1 FROM pg_indexes\n        WHERE schemaname = current_schema()\n          AND indexname = 'idx_repo_jobs_active_per_repo'\n    ) THEN\n        CREATE UNIQUE INDEX idx_repo_jobs_active_per_repo\n            ON repo_jobs (repo_id)\n            WHERE status IN ('PENDING','IN_PROGRESS');\n    END IF;\nEND\n$$;"
            }
            _ => {
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_repo_jobs_active_per_repo \
                 ON repo_jobs (repo_id) \
                 WHERE status IN ('PENDING','IN_PROGRESS')"
            }
        };
        manager
            .get_connection()
            .execute(Statement::from_string(backend, sql.to_string()))
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "DROP INDEX IF EXISTS idx_repo_jobs_active_per_repo".to_string(),
            ))
            .await?;
        manager
            .drop_index(Index::drop().name("idx_repo_jobs_status_created").to_owned())
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repo_jobs_repo_type_status")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(RepoJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepoJobs {
    Table,
    Id,
    JobType,
    Status,
    RepoId,
    Metadata,
    ErrorMessage,
    CreatedAt,
    StartedAt,
    CompletedAt,
}
