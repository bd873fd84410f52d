//! Migration to create the repos catalog table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Repos::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Repos::Id).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(Repos::OrgId)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(Repos::Name).text().not_null())
                    .col(ColumnDef::new(Repos::CloneUrl).text().not_null())
                    .col(ColumnDef::new(Repos::WebUrl).text().null())
                    .col(ColumnDef::new(Repos::ImageUrl).text().null())
                    .col(
                        ColumnDef::new(Repos::IsFork)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Repos::IsArchived)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Repos::Metadata).json_binary().not_null())
                    .col(ColumnDef::new(Repos::ExternalId).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalCodeHostType).text().not_null())
                    .col(ColumnDef::new(Repos::ExternalCodeHostUrl).text().not_null())
                    .col(
                        ColumnDef::new(Repos::IndexedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(Repos::IndexedCommitHash).text().null())
                    .col(
                        ColumnDef::new(Repos::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Repos::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // One catalog row per remote repository
        manager
            .create_index(
                Index::create()
                    .name("idx_repos_external_identity")
                    .table(Repos::Table)
                    .col(Repos::ExternalId)
                    .col(Repos::ExternalCodeHostUrl)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repos_indexed_at")
                    .table(Repos::Table)
                    .col(Repos::IndexedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_repos_indexed_at").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_repos_external_identity").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Repos::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
    OrgId,
    Name,
    CloneUrl,
    WebUrl,
    ImageUrl,
    IsFork,
    IsArchived,
    Metadata,
    ExternalId,
    ExternalCodeHostType,
    ExternalCodeHostUrl,
    IndexedAt,
    IndexedCommitHash,
    CreatedAt,
    UpdatedAt,
}
