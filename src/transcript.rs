//! Persisted conversation transcripts.
//!
//! One append-only JSONL file per local day, rolled at midnight on the next
//! append. Records are line-delimited `{ts, session_id, role, content}`.
//! An optional CSV export of the day's log runs on clean shutdown.

use crate::error::Result;
use crate::messages::Role;
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// One persisted transcript line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptRecord {
    pub ts: DateTime<Utc>,
    pub session_id: String,
    pub role: Role,
    pub content: String,
}

/// Appends conversation records to daily JSONL files.
pub struct TranscriptLog {
    dir: PathBuf,
    session_id: String,
    current: Option<(NaiveDate, BufWriter<File>)>,
}

impl TranscriptLog {
    /// Open a log rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>, session_id: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            session_id: session_id.into(),
            current: None,
        })
    }

    /// Append one record to today's file, rolling at a date change.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or written.
    pub fn append(&mut self, role: Role, content: &str) -> Result<()> {
        let today = Local::now().date_naive();
        let session_id = self.session_id.clone();
        let writer = self.writer_for(today)?;

        let record = TranscriptRecord {
            ts: Utc::now(),
            session_id,
            role,
            content: content.to_owned(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| std::io::Error::other(format!("transcript encode: {e}")))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Path of the JSONL file for a given day.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("conversation-{date}.jsonl"))
    }

    /// Export one day's log as CSV next to the JSONL file. Returns the CSV
    /// path, or `None` when there is no log for that day.
    ///
    /// # Errors
    ///
    /// Returns an error on read or write failure.
    pub fn export_csv(&self, date: NaiveDate) -> Result<Option<PathBuf>> {
        let source = self.path_for(date);
        if !source.exists() {
            return Ok(None);
        }

        let csv_path = self.dir.join(format!("conversation-{date}.csv"));
        let mut out = BufWriter::new(File::create(&csv_path)?);
        writeln!(out, "ts,session_id,role,content")?;

        let reader = BufReader::new(File::open(&source)?);
        for line in reader.lines() {
            let line = line?;
            let Ok(record) = serde_json::from_str::<TranscriptRecord>(&line) else {
                continue;
            };
            let role = match record.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::ToolResult => "tool_result",
            };
            writeln!(
                out,
                "{},{},{},{}",
                record.ts.to_rfc3339(),
                csv_escape(&record.session_id),
                role,
                csv_escape(&record.content),
            )?;
        }
        out.flush()?;
        info!("exported transcript CSV: {}", csv_path.display());
        Ok(Some(csv_path))
    }

    fn writer_for(&mut self, date: NaiveDate) -> Result<&mut BufWriter<File>> {
        let needs_roll = match &self.current {
            Some((open_date, _)) => *open_date != date,
            None => true,
        };
        if needs_roll {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path_for(date))?;
            self.current = Some((date, BufWriter::new(file)));
        }
        match &mut self.current {
            Some((_, writer)) => Ok(writer),
            None => unreachable!("writer installed above"),
        }
    }
}

/// Quote a CSV field when it contains a delimiter, quote, or newline.
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

/// Read back every record of one day, oldest first. Unparseable lines are
/// skipped.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read.
pub fn read_day(path: &Path) -> Result<Vec<TranscriptRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if let Ok(record) = serde_json::from_str(&line) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn appends_jsonl_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TranscriptLog::open(dir.path(), "sess-1").unwrap();
        log.append(Role::User, "안녕").unwrap();
        log.append(Role::Assistant, "반가워.").unwrap();

        let path = log.path_for(Local::now().date_naive());
        let records = read_day(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].content, "안녕");
        assert_eq!(records[0].session_id, "sess-1");
        assert_eq!(records[1].role, Role::Assistant);
    }

    #[test]
    fn appends_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = TranscriptLog::open(dir.path(), "sess-1").unwrap();
            log.append(Role::User, "first").unwrap();
        }
        {
            let mut log = TranscriptLog::open(dir.path(), "sess-2").unwrap();
            log.append(Role::User, "second").unwrap();
        }
        let log = TranscriptLog::open(dir.path(), "probe").unwrap();
        let records = read_day(&log.path_for(Local::now().date_naive())).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].session_id, "sess-2");
    }

    #[test]
    fn csv_export_escapes_fields() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TranscriptLog::open(dir.path(), "sess-1").unwrap();
        log.append(Role::User, "hello, \"world\"").unwrap();

        let today = Local::now().date_naive();
        let csv_path = log.export_csv(today).unwrap().unwrap();
        let csv = std::fs::read_to_string(csv_path).unwrap();
        assert!(csv.starts_with("ts,session_id,role,content"));
        assert!(csv.contains("\"hello, \"\"world\"\"\""));
    }

    #[test]
    fn csv_export_missing_day_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let log = TranscriptLog::open(dir.path(), "sess-1").unwrap();
        let missing = NaiveDate::from_ymd_opt(2001, 1, 1).unwrap();
        assert!(log.export_csv(missing).unwrap().is_none());
    }

    #[test]
    fn read_day_skips_garbage_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TranscriptLog::open(dir.path(), "sess-1").unwrap();
        log.append(Role::User, "ok").unwrap();

        let path = log.path_for(Local::now().date_naive());
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json at all").unwrap();
        log.append(Role::Assistant, "still ok").unwrap();

        let records = read_day(&path).unwrap();
        assert_eq!(records.len(), 2);
    }
}
