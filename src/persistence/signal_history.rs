//! Signal history: one line-delimited JSON record per signal emission.
//! A record is appended when a signal opens a position and, on close, the
//! matching line is located by id and rewritten in place rather than
//! appended again.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRecordStatus {
    Open,
    Closed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub scenario: String,
    pub symbol: String,
    pub signal_type: String,
    pub entry_price: Decimal,
    pub entry_time: i64,
    pub triggered_rules: Vec<String>,
    pub status: SignalRecordStatus,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<i64>,
    pub exit_reason: Option<String>,
    pub pnl: Option<Decimal>,
    pub pnl_fraction: Option<Decimal>,
    pub holding_hours: Option<Decimal>,
}

fn history_path(logs_dir: &Path, scenario: &str) -> PathBuf {
    logs_dir.join(format!("{scenario}.signals.jsonl"))
}

pub async fn append_open(logs_dir: &Path, record: &SignalRecord) -> Result<()> {
    tokio::fs::create_dir_all(logs_dir).await.context("failed to create logs directory")?;
    let path = history_path(logs_dir, &record.scenario);
    let mut line = serde_json::to_string(record).context("failed to serialize signal record")?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open signal history at {}", path.display()))?;
    file.write_all(line.as_bytes()).await.context("failed to append signal record")?;
    Ok(())
}

/// Reads every record, replaces the one matching `id` with `updated`, and
/// rewrites the whole file. Acceptable at this volume: signal history is
/// bounded by trade count, not tick count.
pub async fn close(logs_dir: &Path, scenario: &str, id: &str, updated: &SignalRecord) -> Result<()> {
    let path = history_path(logs_dir, scenario);
    let contents = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read signal history at {}", path.display()))?;

    let mut lines: Vec<String> = Vec::new();
    let mut found = false;
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record: SignalRecord = serde_json::from_str(line).context("corrupt signal history line")?;
        if record.id == id {
            lines.push(serde_json::to_string(updated)?);
            found = true;
        } else {
            lines.push(line.to_string());
        }
    }

    if !found {
        anyhow::bail!("signal record {id} not found in history for scenario {scenario}");
    }

    let mut rewritten = lines.join("\n");
    rewritten.push('\n');
    tokio::fs::write(&path, rewritten)
        .await
        .with_context(|| format!("failed to rewrite signal history at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("cryptara-signal-test-{}", Uuid::new_v4()))
    }

    fn open_record(id: &str) -> SignalRecord {
        SignalRecord {
            id: id.to_string(),
            scenario: "s1".to_string(),
            symbol: "BTCUSDT".to_string(),
            signal_type: "buy".to_string(),
            entry_price: dec!(100),
            entry_time: 1000,
            triggered_rules: vec!["ma_bullish".to_string()],
            status: SignalRecordStatus::Open,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            pnl: None,
            pnl_fraction: None,
            holding_hours: None,
        }
    }

    #[tokio::test]
    async fn append_then_close_rewrites_matched_line() {
        let dir = temp_dir();
        let record = open_record("sig-1");
        append_open(&dir, &record).await.unwrap();

        let mut closed = record.clone();
        closed.status = SignalRecordStatus::Closed;
        closed.exit_price = Some(dec!(110));
        closed.exit_time = Some(2000);
        closed.exit_reason = Some("signal".to_string());
        closed.pnl = Some(dec!(10));
        closed.pnl_fraction = Some(dec!(0.1));
        closed.holding_hours = Some(dec!(0.28));

        close(&dir, "s1", "sig-1", &closed).await.unwrap();

        let path = history_path(&dir, "s1");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        let parsed: SignalRecord = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.status, SignalRecordStatus::Closed);
        assert_eq!(parsed.pnl, Some(dec!(10)));
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn closing_unknown_id_errors() {
        let dir = temp_dir();
        append_open(&dir, &open_record("sig-1")).await.unwrap();
        let result = close(&dir, "s1", "does-not-exist", &open_record("sig-1")).await;
        assert!(result.is_err());
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn other_records_are_preserved_when_closing_one() {
        let dir = temp_dir();
        append_open(&dir, &open_record("sig-1")).await.unwrap();
        append_open(&dir, &open_record("sig-2")).await.unwrap();

        let mut closed = open_record("sig-1");
        closed.status = SignalRecordStatus::Closed;
        close(&dir, "s1", "sig-1", &closed).await.unwrap();

        let path = history_path(&dir, "s1");
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
