use sea_orm_migration::prelude::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000002_create_addresses_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Addresses::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Addresses::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Addresses::UserId).uuid().null())
                    .col(ColumnDef::new(Addresses::GuestId).string_len(128).null())
                    .col(
                        ColumnDef::new(Addresses::RecipientName)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(Addresses::Line1).string_len(255).not_null())
                    .col(ColumnDef::new(Addresses::Line2).string_len(255).null())
                    .col(ColumnDef::new(Addresses::City).string_len(128).not_null())
                    .col(ColumnDef::new(Addresses::Region).string_len(128).null())
                    .col(
                        ColumnDef::new(Addresses::PostalCode)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Addresses::CountryCode)
                            .string_len(2)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Addresses::CreatedAt)
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
                    .name("idx_addresses_user_id")
                    .table(Addresses::Table)
                    .col(Addresses::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_addresses_guest_id")
                    .table(Addresses::Table)
                    .col(Addresses::GuestId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Addresses::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub enum Addresses {
    Table,
    Id,
    UserId,
    GuestId,
    RecipientName,
    Line1,
    Line2,
    City,
    Region,
    PostalCode,
    CountryCode,
    CreatedAt,
}
