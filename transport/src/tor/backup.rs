use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Copies `dir/file_name` to `dir/backup/file_name/file_name_<millis>`, keeping at most
///  `max_backups` copies (the oldest are deleted). A missing source file is not an error.
pub async fn rolling_backup(dir: &Path, file_name: &str, max_backups: usize) -> std::io::Result<Option<PathBuf>> {
    let source = dir.join(file_name);
    if !tokio::fs::try_exists(&source).await? {
        debug!("nothing to back up at {:?}", source);
        return Ok(None);
    }

    let backup_dir = dir.join("backup").join(file_name);
    tokio::fs::create_dir_all(&backup_dir).await?;

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut target = backup_dir.join(format!("{}_{}", file_name, millis));
    let mut suffix = 0;
    while tokio::fs::try_exists(&target).await? {
        suffix += 1;
        target = backup_dir.join(format!("{}_{}_{}", file_name, millis, suffix));
    }
    tokio::fs::copy(&source, &target).await?;
    debug!("backed up {:?} to {:?}", source, target);

    prune_backups(&backup_dir, max_backups).await?;
    Ok(Some(target))
}

async fn prune_backups(backup_dir: &Path, max_backups: usize) -> std::io::Result<()> {
    let mut backups = Vec::new();
    let mut entries = tokio::fs::read_dir(backup_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let modified = entry.metadata().await?.modified()?;
        backups.push((modified, entry.file_name(), entry.path()));
    }

    if backups.len() <= max_backups {
        return Ok(());
    }

    // oldest first; names carry the creation time, so they break ties in modification time
    backups.sort();
    let num_to_delete = backups.len() - max_backups;
    for (_, _, path) in backups.into_iter().take(num_to_delete) {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!("could not delete old backup {:?}: {}", path, e);
        }
    }
    Ok(())
}
