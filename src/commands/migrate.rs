use sea_orm::{DatabaseConnection, DbErr};
use sea_orm_migration::{Migration, MigratorTrait};

use crate::{
    cli::MigrateAction,
    config::Config,
    database::{migrations::Migrator, setup_database_connection},
    error::SchedulerError,
};

pub async fn handle_migrate_command(
    config: &Config,
    action: MigrateAction,
) -> Result<(), SchedulerError> {
    let db = setup_database_connection(&config.database).await?;
    run_migration_action(&db, action).await?;
    Ok(())
}

fn print_migrations<'a>(header: &str, migrations: impl IntoIterator<Item = &'a Migration>) {
    println!("{header}");
    for migration in migrations {
        println!("  📄 {}", migration.name());
    }
}

/// Applied migrations that `steps` rollbacks would revert, newest first.
fn last_applied(applied: &[Migration], steps: u32) -> &[Migration] {
    let count = applied.len().min(steps as usize);
    &applied[applied.len() - count..]
}

async fn run_migration_action(db: &DatabaseConnection, action: MigrateAction) -> Result<(), DbErr> {
    match action {
        MigrateAction::Up { steps } => {
            let pending = Migrator::get_pending_migrations(db).await?;
            if pending.is_empty() {
                println!("✅ All migrations are already up to date");
                return Ok(());
            }

            let count = steps.map_or(pending.len(), |steps| pending.len().min(steps as usize));
            print_migrations(&format!("Applying {count} migration(s):"), &pending[..count]);
            Migrator::up(db, steps).await?;
            println!("✅ Migrations completed successfully");
        }
        MigrateAction::Down { steps } => {
            let applied = Migrator::get_applied_migrations(db).await?;
            if applied.is_empty() {
                println!("❌ No migrations to roll back");
                return Ok(());
            }

            print_migrations(
                "Rolling back:",
                last_applied(&applied, steps).iter().rev(),
            );
            Migrator::down(db, Some(steps)).await?;
            println!("✅ Rollback completed successfully");
        }
        MigrateAction::Status => {
            let applied = Migrator::get_applied_migrations(db).await?;
            let pending = Migrator::get_pending_migrations(db).await?;

            print_migrations("📋 Applied migrations:", &applied);
            if pending.is_empty() {
                println!("✅ All migrations are up to date");
            } else {
                print_migrations("📋 Pending migrations:", &pending);
            }
        }
        MigrateAction::Reset => {
            println!("🔄 Resetting the scheduler schema (this drops all job data!)");
            Migrator::fresh(db).await?;
            println!("✅ Schema recreated");
        }
        MigrateAction::Reapply { steps } => {
            let applied = Migrator::get_applied_migrations(db).await?;
            if applied.is_empty() {
                println!("❌ No migrations to reapply");
                return Ok(());
            }

            print_migrations(
                "🔄 Reapplying:",
                last_applied(&applied, steps).iter().rev(),
            );
            Migrator::down(db, Some(steps)).await?;
            Migrator::up(db, Some(steps)).await?;
            println!("✅ Reapply completed successfully");
        }
    }

    Ok(())
}
