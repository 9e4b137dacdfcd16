pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_catalog_tables;
mod m20250301_000002_create_addresses_table;
mod m20250301_000003_create_checkout_session_tables;
mod m20250301_000004_create_order_tables;
mod m20250301_000005_create_payments_table;

/// Fixed-point money column, 19 digits with 4 decimals. SQLite caps the
/// declared precision at 16.
pub(crate) fn money_column<T: IntoIden>(manager: &SchemaManager, name: T) -> ColumnDef {
    let mut def = ColumnDef::new(name);
    match manager.get_database_backend() {
        sea_orm_migration::sea_orm::DatabaseBackend::Sqlite => def.decimal_len(16, 4),
        _ => def.decimal_len(19, 4),
    };
    def.not_null().to_owned()
}

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_catalog_tables::Migration),
            Box::new(m20250301_000002_create_addresses_table::Migration),
            Box::new(m20250301_000003_create_checkout_session_tables::Migration),
            Box::new(m20250301_000004_create_order_tables::Migration),
            Box::new(m20250301_000005_create_payments_table::Migration),
        ]
    }
}
