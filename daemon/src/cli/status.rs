//! Show ingestion status.

use std::path::Path;

use crate::db::{Database, DatabaseStats};
use crate::error::Error;

/// Run `status`.
pub fn run(db_path: &Path) -> Result<(), Error> {
    if !db_path.exists() {
        println!("No database at {}", db_path.display());
        println!("Run 'chatlog-ingest scan' or 'chatlog-ingest watch' first.");
        return Ok(());
    }

    let db = Database::open(db_path)?;
    print!("{}", render(db_path, &db.stats()?));
    Ok(())
}

fn render(db_path: &Path, stats: &DatabaseStats) -> String {
    format!(
        "Database: {}\n\
         \x20 Projects:       {}\n\
         \x20 Sessions:       {}\n\
         \x20 Messages:       {}\n\
         \x20 Tracked files:  {} ({} retired)\n",
        db_path.display(),
        stats.projects,
        stats.sessions,
        stats.messages,
        stats.tracked_files,
        stats.tombstoned_files,
    )
}
