//! Database migrations for chatlink.

pub use sea_orm_migration::prelude::*;

mod m2025_11_15_000001_create_connections;
mod m2025_11_15_000002_create_chats;
mod m2025_11_15_000003_create_messages;
mod m2025_11_15_000004_create_streams;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_15_000001_create_connections::Migration),
            Box::new(m2025_11_15_000002_create_chats::Migration),
            Box::new(m2025_11_15_000003_create_messages::Migration),
            Box::new(m2025_11_15_000004_create_streams::Migration),
        ]
    }
}
