use std::env;

use crate::app_info::AppInfo;

pub fn print_version_info(app: AppInfo) {
    let core = AppInfo::scheduler_core();

    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_timestamp = option_env!("BUILD_TIMESTAMP").unwrap_or("unknown");

    println!("📦 {} v{}", app.name, app.version);

    if !app.description.is_empty() {
        println!("📝 {}", app.description);
    }

    if app.name != core.name {
        println!("🧱 Scheduler: {} v{}", core.name, core.version);
    }

    println!();
    println!("🔨 Build: {git_hash} ({build_timestamp})");
    println!("💻 Platform: {}/{}", env::consts::OS, env::consts::ARCH);
}
