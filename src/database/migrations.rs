pub use sea_orm_migration::prelude::*;

mod m20261019_090000_create_job_definition;
mod m20261019_090100_create_job_execution;
mod m20261019_090200_create_job_execution_history;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20261019_090000_create_job_definition::Migration),
            Box::new(m20261019_090100_create_job_execution::Migration),
            Box::new(m20261019_090200_create_job_execution_history::Migration),
        ]
    }
}

pub struct Migrator;
