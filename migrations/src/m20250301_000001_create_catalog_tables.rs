use sea_orm_migration::prelude::*;

use crate::money_column;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000001_create_catalog_tables"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Products::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Products::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Products::Name).string_len(255).not_null())
                    .col(
                        ColumnDef::new(Products::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Variants::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Variants::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Variants::ProductId).uuid().not_null())
                    .col(
                        ColumnDef::new(Variants::Sku)
                            .string_len(100)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Variants::Name).string_len(255).not_null())
                    .col(ColumnDef::new(Variants::ImageUrl).string_len(1024).null())
                    .col(
                        ColumnDef::new(Variants::UnitType)
                            .string_len(32)
                            .not_null()
                            .default("unit"),
                    )
                    .col(money_column(manager, Variants::Price))
                    // Authoritative inventory count; deductions are conditional on stock >= quantity.
                    .col(
                        ColumnDef::new(Variants::Stock)
                            .integer()
                            .not_null()
                            .default(0)
                            .check(Expr::col(Variants::Stock).gte(0)),
                    )
                    .col(
                        ColumnDef::new(Variants::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Variants::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_variants_product_id")
                            .from(Variants::Table, Variants::ProductId)
                            .to(Products::Table, Products::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_variants_product_id")
                    .table(Variants::Table)
                    .col(Variants::ProductId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Variants::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Products::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Products {
    Table,
    Id,
    Name,
    CreatedAt,
}

#[derive(DeriveIden)]
pub enum Variants {
    Table,
    Id,
    ProductId,
    Sku,
    Name,
    ImageUrl,
    UnitType,
    Price,
    Stock,
    CreatedAt,
    UpdatedAt,
}
