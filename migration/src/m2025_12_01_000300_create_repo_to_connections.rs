//! Migration to create the repo_to_connections join table.
//!
//! Edges are rewritten on every sync of a connection, so a repo that stops being
//! discovered ends up with no edges at all.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(RepoToConnections::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(RepoToConnections::RepoId).uuid().not_null())
                    .col(
                        ColumnDef::new(RepoToConnections::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(RepoToConnections::AddedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .col(RepoToConnections::RepoId)
                            .col(RepoToConnections::ConnectionId),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repo_to_connections_repo_id")
                            .from(RepoToConnections::Table, RepoToConnections::RepoId)
                            .to(Repos::Table, Repos::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_repo_to_connections_connection_id")
                            .from(RepoToConnections::Table, RepoToConnections::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_repo_to_connections_connection_id")
                    .table(RepoToConnections::Table)
                    .col(RepoToConnections::ConnectionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_repo_to_connections_connection_id")
                    .to_owned(),
            )
            .await?;
        manager
            .drop_table(Table::drop().table(RepoToConnections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum RepoToConnections {
    Table,
    RepoId,
    ConnectionId,
    AddedAt,
}

#[derive(DeriveIden)]
enum Repos {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
