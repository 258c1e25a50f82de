//! 按大小切分的日志文件
//!
//! 当前文件写满后重命名为 `<name>.<时间戳>`，重新打开同名文件继续写入；
//! 历史文件超过保留数量时删除最旧的。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

const MB: u64 = 1024 * 1024;

/// 历史文件时间戳格式，字典序即时间序
const BACKUP_FORMAT: &str = "%Y%m%d-%H%M%S%.3f";

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    file: File,
    size: u64,
    max_bytes: u64,
    max_backups: usize,
}

/// 按大小切分的日志文件
#[derive(Debug, Clone)]
pub struct RollingFile {
    inner: Arc<Mutex<Inner>>,
}

impl RollingFile {
    /// 打开日志文件
    ///
    /// `max_size_mb` 为 0 时不切分，`max_backups` 为 0 时保留全部历史文件。
    pub fn open(path: impl AsRef<Path>, max_size_mb: u64, max_backups: usize) -> io::Result<Self> {
        Self::with_limit(path, max_size_mb.saturating_mul(MB), max_backups)
    }

    /// 以字节为单位指定切分大小
    pub fn with_limit(
        path: impl AsRef<Path>,
        max_bytes: u64,
        max_backups: usize,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = open_append(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                path,
                file,
                size,
                max_bytes,
                max_backups,
            })),
        })
    }

    /// 日志文件路径
    pub fn path(&self) -> PathBuf {
        match self.inner.lock() {
            Ok(inner) => inner.path.clone(),
            Err(poisoned) => poisoned.into_inner().path.clone(),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Inner {
    fn should_rotate(&self, incoming: usize) -> bool {
        self.max_bytes > 0 && self.size > 0 && self.size + incoming as u64 > self.max_bytes
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let stamp = chrono::Local::now().format(BACKUP_FORMAT).to_string();
        let mut backup = backup_path(&self.path, &stamp, 0);
        let mut seq = 1;
        while backup.exists() {
            backup = backup_path(&self.path, &stamp, seq);
            seq += 1;
        }

        fs::rename(&self.path, &backup)?;
        self.file = open_append(&self.path)?;
        self.size = 0;
        self.prune()
    }

    fn prune(&self) -> io::Result<()> {
        if self.max_backups == 0 {
            return Ok(());
        }

        let mut backups = list_backups(&self.path)?;
        if backups.len() <= self.max_backups {
            return Ok(());
        }
        backups.sort();
        let excess = backups.len() - self.max_backups;
        for old in backups.into_iter().take(excess) {
            fs::remove_file(old)?;
        }
        Ok(())
    }
}

fn backup_path(path: &Path, stamp: &str, seq: usize) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(stamp);
    if seq > 0 {
        name.push(format!("-{}", seq));
    }
    path.with_file_name(name)
}

/// 列出某个日志文件的历史文件
pub fn list_backups(path: &Path) -> io::Result<Vec<PathBuf>> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{}.", name);
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let matched = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.starts_with(&prefix));
        if matched {
            out.push(entry.path());
        }
    }
    Ok(out)
}

impl Write for RollingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("rolling file poisoned"))?;
        if inner.should_rotate(buf.len()) {
            inner.rotate()?;
        }
        let written = inner.file.write(buf)?;
        inner.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("rolling file poisoned"))?;
        inner.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RollingFile {
    type Writer = RollingFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
