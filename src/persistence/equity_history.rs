//! Equity history: append-only JSONL, at most one sample per scenario per
//! hour. A caller attempting to append a second sample inside the same
//! hour window is silently ignored, not an error.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const HOUR_MS: i64 = 3_600_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySample {
    pub timestamp: i64,
    pub equity: Decimal,
    pub positions: usize,
}

fn history_path(logs_dir: &Path, scenario: &str) -> PathBuf {
    logs_dir.join(format!("{scenario}.equity.jsonl"))
}

async fn last_sample_timestamp(path: &Path) -> Result<Option<i64>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let last_line = contents.lines().filter(|l| !l.trim().is_empty()).last();
            match last_line {
                Some(line) => {
                    let sample: EquitySample = serde_json::from_str(line).context("corrupt equity history line")?;
                    Ok(Some(sample.timestamp))
                }
                None => Ok(None),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context("failed to read equity history"),
    }
}

/// Appends `sample` unless the last recorded sample for this scenario is
/// less than an hour old, in which case the call is a no-op. Returns
/// whether the sample was actually written.
pub async fn append_if_due(logs_dir: &Path, scenario: &str, sample: EquitySample) -> Result<bool> {
    tokio::fs::create_dir_all(logs_dir).await.context("failed to create logs directory")?;
    let path = history_path(logs_dir, scenario);

    if let Some(last_ts) = last_sample_timestamp(&path).await? {
        if sample.timestamp - last_ts < HOUR_MS {
            return Ok(false);
        }
    }

    let mut line = serde_json::to_string(&sample).context("failed to serialize equity sample")?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open equity history at {}", path.display()))?;
    file.write_all(line.as_bytes()).await.context("failed to append equity sample")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cryptara-equity-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn first_sample_is_always_written() {
        let dir = temp_dir();
        let wrote = append_if_due(
            &dir,
            "s1",
            EquitySample { timestamp: 0, equity: dec!(10000), positions: 0 },
        )
        .await
        .unwrap();
        assert!(wrote);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn second_sample_within_the_hour_is_dropped() {
        let dir = temp_dir();
        append_if_due(&dir, "s1", EquitySample { timestamp: 0, equity: dec!(10000), positions: 0 })
            .await
            .unwrap();
        let wrote = append_if_due(
            &dir,
            "s1",
            EquitySample { timestamp: 30 * 60 * 1000, equity: dec!(10100), positions: 1 },
        )
        .await
        .unwrap();
        assert!(!wrote);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn sample_an_hour_later_is_written() {
        let dir = temp_dir();
        append_if_due(&dir, "s1", EquitySample { timestamp: 0, equity: dec!(10000), positions: 0 })
            .await
            .unwrap();
        let wrote = append_if_due(
            &dir,
            "s1",
            EquitySample { timestamp: HOUR_MS, equity: dec!(10100), positions: 1 },
        )
        .await
        .unwrap();
        assert!(wrote);

        let path = history_path(&dir, "s1");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
