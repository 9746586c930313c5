//! Daily-rotating JSONL writer with background gzip of closed files.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::models::TickRecord;

struct WriterInner {
    file: Option<File>,
    /// "YYYY-MM-DD" of the open file.
    file_date: String,
}

/// Thread-safe append to `<dir>/<prefix>-<YYYY-MM-DD>.jsonl`, rotating at
/// UTC midnight. The closed file is handed to a detached compressor thread;
/// compressors never touch the live file.
pub struct Writer {
    dir: PathBuf,
    prefix: String,
    inner: Mutex<WriterInner>,
}

impl Writer {
    pub fn new(dir: &str, prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).context("creating output dir")?;
        Ok(Self {
            dir: PathBuf::from(dir),
            prefix: prefix.to_string(),
            inner: Mutex::new(WriterInner {
                file: None,
                file_date: String::new(),
            }),
        })
    }

    pub fn write(&self, record: &TickRecord) -> Result<()> {
        self.write_for_date(record, &today_utc())
    }

    fn write_for_date(&self, record: &TickRecord, date: &str) -> Result<()> {
        let mut line = serde_json::to_vec(record).context("marshaling record")?;
        line.push(b'\n');

        let mut inner = self.inner.lock();
        self.ensure_file(&mut inner, date)?;
        inner
            .file
            .as_mut()
            .expect("ensure_file leaves a file open")
            .write_all(&line)
            .context("appending record")?;
        Ok(())
    }

    fn ensure_file(&self, inner: &mut WriterInner, date: &str) -> Result<()> {
        if inner.file.is_some() && inner.file_date == date {
            return Ok(());
        }

        // Closing the previous file (drop) before compressing it.
        let prev_path = inner
            .file
            .take()
            .map(|_| self.path_for(&inner.file_date));

        let path = self.path_for(date);
        let file = open_append(&path)
            .with_context(|| format!("opening output file {}", path.display()))?;
        inner.file = Some(file);
        inner.file_date = date.to_string();

        if let Some(prev) = prev_path {
            std::thread::spawn(move || compress_file(&prev));
        }

        Ok(())
    }

    fn path_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}-{}.jsonl", self.prefix, date))
    }
}

fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

#[cfg(unix)]
fn open_append(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
}

#[cfg(not(unix))]
fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Gzip a JSONL file and remove the original. Writes to `.gz.tmp` first,
/// fsyncs, then renames atomically so a crash never leaves a truncated `.gz`.
pub fn compress_file(src: &Path) {
    let dst = PathBuf::from(format!("{}.gz", src.display()));
    let tmp = PathBuf::from(format!("{}.tmp", dst.display()));

    // If the .gz already exists, just clean up the original.
    if dst.exists() {
        if src.exists() {
            info!(path = %src.display(), "gzip exists, removing original");
            let _ = std::fs::remove_file(src);
        }
        return;
    }
    if !src.exists() {
        return;
    }

    info!(src = %src.display(), "compressing");

    let mut source = match File::open(src) {
        Ok(f) => f,
        Err(e) => {
            error!(err = %e, path = %src.display(), "compress: open source");
            return;
        }
    };
    let tmp_file = match File::create(&tmp) {
        Ok(f) => f,
        Err(e) => {
            error!(err = %e, path = %tmp.display(), "compress: create tmp");
            return;
        }
    };

    let mut encoder = GzEncoder::new(tmp_file, Compression::best());
    if let Err(e) = std::io::copy(&mut source, &mut encoder) {
        let _ = std::fs::remove_file(&tmp);
        error!(err = %e, path = %src.display(), "compress: copy");
        return;
    }
    let tmp_file = match encoder.finish() {
        Ok(f) => f,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            error!(err = %e, path = %src.display(), "compress: gzip close");
            return;
        }
    };
    if let Err(e) = tmp_file.sync_all() {
        let _ = std::fs::remove_file(&tmp);
        error!(err = %e, path = %tmp.display(), "compress: fsync");
        return;
    }
    drop(tmp_file);

    if let Err(e) = std::fs::rename(&tmp, &dst) {
        let _ = std::fs::remove_file(&tmp);
        error!(err = %e, path = %src.display(), "compress: rename");
        return;
    }

    if let Err(e) = std::fs::remove_file(src) {
        warn!(err = %e, path = %src.display(), "compress: remove original");
        return;
    }

    info!(dst = %dst.display(), "compressed");
}

/// Startup sweep: drop orphaned `.gz.tmp` files and compress any JSONL file
/// from a previous UTC day left behind by a crash.
pub fn compress_stale_files(dir: &str, prefix: &str) {
    sweep(dir, prefix, &today_utc());
}

fn sweep(dir: &str, prefix: &str, today: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let name_prefix = format!("{}-", prefix);
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&name_prefix) {
            continue;
        }

        if name.ends_with(".jsonl.gz.tmp") {
            warn!(path = %path.display(), "removing stale tmp");
            let _ = std::fs::remove_file(&path);
            continue;
        }

        if let Some(date) = name
            .strip_prefix(&name_prefix)
            .and_then(|rest| rest.strip_suffix(".jsonl"))
        {
            if date != today {
                let path = path.clone();
                std::thread::spawn(move || compress_file(&path));
            }
        }
    }
}
