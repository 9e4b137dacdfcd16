use sea_orm_migration::prelude::*;

use crate::money_column;

use super::m20250301_000001_create_catalog_tables::Variants;
use super::m20250301_000002_create_addresses_table::Addresses;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000003_create_checkout_session_tables"
    }
}

fn money(manager: &SchemaManager, col: CheckoutSessions) -> ColumnDef {
    money_column(manager, col).default(0).to_owned()
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CheckoutSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CheckoutSessions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::ExternalId)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::Status)
                            .string_len(32)
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(CheckoutSessions::UserId).uuid().null())
                    .col(
                        ColumnDef::new(CheckoutSessions::GuestId)
                            .string_len(128)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::ShippingAddressId)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::Currency)
                            .string_len(3)
                            .not_null(),
                    )
                    .col(&mut money(manager, CheckoutSessions::Subtotal))
                    .col(&mut money(manager, CheckoutSessions::Tax))
                    .col(&mut money(manager, CheckoutSessions::ShippingFee))
                    .col(&mut money(manager, CheckoutSessions::Discount))
                    .col(&mut money(manager, CheckoutSessions::Total))
                    .col(
                        ColumnDef::new(CheckoutSessions::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::ConfirmedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_checkout_sessions_shipping_address_id")
                            .from(CheckoutSessions::Table, CheckoutSessions::ShippingAddressId)
                            .to(Addresses::Table, Addresses::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Expiry sweeps scan pending sessions ordered by expiry.
        manager
            .create_index(
                Index::create()
                    .name("idx_checkout_sessions_status_expires_at")
                    .table(CheckoutSessions::Table)
                    .col(CheckoutSessions::Status)
                    .col(CheckoutSessions::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_checkout_sessions_confirmed_at")
                    .table(CheckoutSessions::Table)
                    .col(CheckoutSessions::ConfirmedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(CheckoutSessionItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CheckoutSessionItems::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::CheckoutSessionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::Position)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::VariantId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::VariantName)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::ProductName)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::ImageUrl)
                            .string_len(1024)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::Quantity)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessionItems::UnitType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(money_column(manager, CheckoutSessionItems::UnitPrice))
                    .col(money_column(manager, CheckoutSessionItems::Subtotal))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_checkout_session_items_session_id")
                            .from(
                                CheckoutSessionItems::Table,
                                CheckoutSessionItems::CheckoutSessionId,
                            )
                            .to(CheckoutSessions::Table, CheckoutSessions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_checkout_session_items_variant_id")
                            .from(CheckoutSessionItems::Table, CheckoutSessionItems::VariantId)
                            .to(Variants::Table, Variants::Id)
                            .on_delete(ForeignKeyAction::Restrict),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_checkout_session_items_session_id")
                    .table(CheckoutSessionItems::Table)
                    .col(CheckoutSessionItems::CheckoutSessionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(CheckoutSessionItems::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CheckoutSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden, Clone, Copy)]
pub enum CheckoutSessions {
    Table,
    Id,
    ExternalId,
    Status,
    UserId,
    GuestId,
    ShippingAddressId,
    Currency,
    Subtotal,
    Tax,
    ShippingFee,
    Discount,
    Total,
    ExpiresAt,
    ConfirmedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
pub enum CheckoutSessionItems {
    Table,
    Id,
    CheckoutSessionId,
    Position,
    VariantId,
    VariantName,
    ProductName,
    ImageUrl,
    Quantity,
    UnitType,
    UnitPrice,
    Subtotal,
}
