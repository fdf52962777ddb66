//! Per-scenario account file. One JSON file per scenario; writes go through
//! a temp-file-then-rename so no partial file is ever observed by a reader.

use crate::domain::account::Account;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub fn account_path(logs_dir: &Path, scenario: &str) -> PathBuf {
    logs_dir.join(format!("{scenario}.account.json"))
}

/// Loads the account for `scenario`. A missing file is not an error: it
/// yields a fresh account seeded with `initial_cash`.
pub async fn load(logs_dir: &Path, scenario: &str, initial_cash: Decimal, now: i64) -> Result<Account> {
    let path = account_path(logs_dir, scenario);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => {
            serde_json::from_str(&contents).with_context(|| format!("invalid account file at {}", path.display()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Account::new(scenario, initial_cash, now)),
        Err(e) => Err(e).with_context(|| format!("failed to read account file at {}", path.display())),
    }
}

/// Saves `account` atomically: writes to a unique temp file in the same
/// directory, then renames over the destination. The rename is atomic on
/// any filesystem the destination and temp file share.
pub async fn save(logs_dir: &Path, scenario: &str, account: &Account) -> Result<()> {
    tokio::fs::create_dir_all(logs_dir)
        .await
        .context("failed to create logs directory")?;

    let path = account_path(logs_dir, scenario);
    let tmp_path = logs_dir.join(format!(".{scenario}.account.{}.tmp", Uuid::new_v4()));

    let serialized = serde_json::to_string_pretty(account).context("failed to serialize account")?;
    tokio::fs::write(&tmp_path, serialized)
        .await
        .context("failed to write temp account file")?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .context("failed to rename temp account file into place")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cryptara-account-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn load_seeds_initial_account_when_file_absent() {
        let dir = temp_dir();
        let account = load(&dir, "scenario-a", dec!(5000), 0).await.unwrap();
        assert_eq!(account.cash, dec!(5000));
        assert_eq!(account.scenario, "scenario-a");
    }

    #[tokio::test]
    async fn save_then_load_roundtrips() {
        let dir = temp_dir();
        let account = Account::new("scenario-b", dec!(1000), 0);
        save(&dir, "scenario-b", &account).await.unwrap();

        let loaded = load(&dir, "scenario-b", dec!(999), 0).await.unwrap();
        assert_eq!(loaded.cash, dec!(1000));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file_behind() {
        let dir = temp_dir();
        let account = Account::new("scenario-c", dec!(2000), 0);
        save(&dir, "scenario-c", &account).await.unwrap();

        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert!(names.iter().all(|n| !n.ends_with(".tmp")));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
