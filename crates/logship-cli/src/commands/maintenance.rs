//! Maintenance commands operating on a stopped store.

use anyhow::Result;
use logship_core::store;
use logship_core::Config;

/// Print per-table message counts.
pub fn stats(config: &Config) -> Result<()> {
    let counts = store::table_stats(&config.store.directory)?;
    println!("queued: {}", counts.queued);
    println!("sent:   {}", counts.sent);
    println!("failed: {}", counts.failed);
    Ok(())
}

/// Delete all permanently failed messages.
pub fn purge_failed(config: &Config) -> Result<()> {
    let purged = store::purge_failed(&config.store.directory)?;
    println!("Purged {} failed message(s)", purged);
    Ok(())
}
