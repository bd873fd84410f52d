//! Migration to create the connections table.
//!
//! A connection is one configured link to a code host account or instance. Its
//! `sync_status` column is the durable state of the connection-sync queue.
//! `is_declarative` marks rows owned by the connections file.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Connections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Connections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Connections::OrgId)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(Connections::Name).text().not_null())
                    .col(ColumnDef::new(Connections::ConnectionType).text().not_null())
                    .col(ColumnDef::new(Connections::Config).json_binary().not_null())
                    .col(
                        ColumnDef::new(Connections::SyncStatus)
                            .text()
                            .not_null()
                            .default("SYNC_NEEDED"),
                    )
                    .col(
                        ColumnDef::new(Connections::SyncStatusMetadata)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::IsDeclarative)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Connections::SyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Connections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Connections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_org_name")
                    .table(Connections::Table)
                    .col(Connections::OrgId)
                    .col(Connections::Name)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_connections_sync_status")
                    .table(Connections::Table)
                    .col(Connections::SyncStatus)
                    .col(Connections::SyncedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_connections_sync_status").to_owned())
            .await?;
        manager
            .drop_index(Index::drop().name("idx_connections_org_name").to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Connections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
    OrgId,
    Name,
    ConnectionType,
    Config,
    SyncStatus,
    SyncStatusMetadata,
    IsDeclarative,
    SyncedAt,
    CreatedAt,
    UpdatedAt,
}
