//! Dump and restore statistics
//!
//! The dump engine leaves binary `stats-dump` and `stats-restore` files in
//! its work directory. A decoder tool turns them into JSON of the form
//! `{"entries": [{"dump": {...}}]}`, which is parsed here.

use crate::error::{EngineError, Result};
use crate::util::command;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const STATS_DUMP_FILE: &str = "stats-dump";
pub const STATS_RESTORE_FILE: &str = "stats-restore";

/// Timings in microseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpStatistics {
    #[serde(default)]
    pub freezing_time: u64,
    #[serde(default)]
    pub frozen_time: u64,
    #[serde(default)]
    pub memdump_time: u64,
    #[serde(default)]
    pub memwrite_time: u64,
    #[serde(default)]
    pub pages_scanned: u64,
    #[serde(default)]
    pub pages_written: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreStatistics {
    #[serde(default)]
    pub pages_compared: u64,
    #[serde(default)]
    pub pages_skipped_cow: u64,
    #[serde(default)]
    pub forking_time: u64,
    #[serde(default)]
    pub restore_time: u64,
    #[serde(default)]
    pub pages_restored: u64,
}

#[derive(Deserialize)]
struct StatsEntry {
    dump: Option<DumpStatistics>,
    restore: Option<RestoreStatistics>,
}

#[derive(Deserialize)]
struct StatsFile {
    entries: Vec<StatsEntry>,
}

fn parse_entry(json: &str) -> Result<StatsEntry> {
    let file: StatsFile =
        serde_json::from_str(json).map_err(|e| EngineError::Statistics(format!("parsing statistics: {}", e)))?;
    file.entries
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::Statistics("statistics file has no entries".to_string()))
}

/// Parse decoded `stats-dump` content
pub fn parse_dump_statistics(json: &str) -> Result<DumpStatistics> {
    parse_entry(json)?
        .dump
        .ok_or_else(|| EngineError::Statistics("no dump statistics found".to_string()))
}

/// Parse decoded `stats-restore` content
pub fn parse_restore_statistics(json: &str) -> Result<RestoreStatistics> {
    parse_entry(json)?
        .restore
        .ok_or_else(|| EngineError::Statistics("no restore statistics found".to_string()))
}

/// Statistics file decoder (`crit`-style `show <file>` command)
#[derive(Debug, Clone)]
pub struct StatsDecoder {
    path: PathBuf,
}

impl StatsDecoder {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn decode(&self, file: &Path) -> Result<String> {
        if !file.exists() {
            return Err(EngineError::Statistics(format!("{} does not exist", file.display())));
        }
        let args = vec!["show".to_string(), file.display().to_string()];
        let output = command::run(&self.path, &args, None, None)
            .await
            .map_err(|e| EngineError::Statistics(format!("running {}: {}", self.path.display(), e)))?;
        if !output.success {
            return Err(EngineError::Statistics(format!(
                "decoding {}: {}",
                file.display(),
                output.stderr
            )));
        }
        Ok(output.stdout_str())
    }

    /// Statistics of the dump whose work directory is `dir`
    pub async fn dump_statistics(&self, dir: &Path) -> Result<DumpStatistics> {
        parse_dump_statistics(&self.decode(&dir.join(STATS_DUMP_FILE)).await?)
    }

    /// Statistics of the restore whose work directory is `dir`
    pub async fn restore_statistics(&self, dir: &Path) -> Result<RestoreStatistics> {
        parse_restore_statistics(&self.decode(&dir.join(STATS_RESTORE_FILE)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const DUMP: &str = r#"{"magic": "STATS", "entries": [{"dump": {"freezing_time": 1200, "frozen_time": 34000, "memdump_time": 900, "memwrite_time": 1500, "pages_scanned": 4096, "pages_written": 812}}]}"#;

    #[test]
    fn test_parse_dump() {
        let stats = parse_dump_statistics(DUMP).unwrap();
        assert_eq!(stats.frozen_time, 34000);
        assert_eq!(stats.pages_written, 812);
    }

    #[test]
    fn test_parse_restore() {
        let stats = parse_restore_statistics(
            r#"{"entries": [{"restore": {"pages_compared": 10, "forking_time": 7, "restore_time": 88}}]}"#,
        )
        .unwrap();
        assert_eq!(stats.restore_time, 88);
        assert_eq!(stats.pages_restored, 0);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_dump_statistics("not json"), Err(EngineError::Statistics(_))));
        assert!(matches!(parse_dump_statistics(r#"{"entries": []}"#), Err(EngineError::Statistics(_))));
        assert!(matches!(parse_restore_statistics(DUMP), Err(EngineError::Statistics(_))));
    }

    #[tokio::test]
    async fn test_decoder() {
        let dir = tempdir().unwrap();
        let decoder = dir.path().join("crit");
        std::fs::write(&decoder, format!("#!/bin/sh\n[ \"$1\" = show ] || exit 2\necho '{}'\n", DUMP)).unwrap();
        std::fs::set_permissions(&decoder, std::fs::Permissions::from_mode(0o755)).unwrap();
        let decoder = StatsDecoder::new(decoder);

        let err = decoder.dump_statistics(dir.path()).await.unwrap_err();
        assert!(matches!(err, EngineError::Statistics(_)));

        std::fs::write(dir.path().join(STATS_DUMP_FILE), b"\x01binary").unwrap();
        assert_eq!(decoder.dump_statistics(dir.path()).await.unwrap().pages_scanned, 4096);
    }
}
