//! FileBoardStore - one directory, a handful of files per board.
//!
//! Layout for board `ready`:
//! - `ready.json`        the board (JSON array)
//! - `ready.json.bak`    last checkpoint
//! - `ready.journal`     JSON lines since that checkpoint
//! - `ready.lock`        advisory lock file (`fs2`), never deleted
//! - `ready.quarantine`  present while quarantined; holds the reason
//!
//! Board and backup writes go through a temp file, `fsync` and `rename`, so a
//! reader sees either the old or the new content.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::ports::{BoardLockGuard, BoardStore};

#[derive(Debug, Clone)]
pub struct FileBoardStore {
    root: PathBuf,
}

impl FileBoardStore {
    /// Open (creating if needed) a board directory.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, board: &str, suffix: &str) -> PathBuf {
        self.root.join(format!("{board}{suffix}"))
    }

    fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn remove_optional(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> io::Result<()> {
        let mut tmp_name = target.as_os_str().to_owned();
        tmp_name.push(format!(".tmp.{}", std::process::id()));
        let tmp = PathBuf::from(tmp_name);

        let result = (|| {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, target)?;
            File::open(&self.root)?.sync_all()
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

impl BoardStore for FileBoardStore {
    fn read(&self, board: &str) -> io::Result<Option<Vec<u8>>> {
        Self::read_optional(&self.path(board, ".json"))
    }

    fn write(&self, board: &str, bytes: &[u8]) -> io::Result<()> {
        self.write_atomic(&self.path(board, ".json"), bytes)
    }

    fn try_lock(&self, board: &str) -> io::Result<Option<BoardLockGuard>> {
        let path = self.path(board, ".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(BoardLockGuard::file(file))),
            Err(e) if is_contended(&e) => {
                debug!(board, "board lock held elsewhere");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn read_backup(&self, board: &str) -> io::Result<Option<Vec<u8>>> {
        Self::read_optional(&self.path(board, ".json.bak"))
    }

    fn write_backup(&self, board: &str, bytes: &[u8]) -> io::Result<()> {
        self.write_atomic(&self.path(board, ".json.bak"), bytes)
    }

    fn append_journal(&self, board: &str, line: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(board, ".journal"))?;
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        file.write_all(&buf)?;
        file.sync_data()
    }

    fn read_journal(&self, board: &str) -> io::Result<Option<Vec<u8>>> {
        Self::read_optional(&self.path(board, ".journal"))
    }

    fn clear_journal(&self, board: &str) -> io::Result<()> {
        Self::remove_optional(&self.path(board, ".journal"))
    }

    fn quarantine_reason(&self, board: &str) -> io::Result<Option<String>> {
        Ok(Self::read_optional(&self.path(board, ".quarantine"))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn set_quarantine(&self, board: &str, reason: &str) -> io::Result<()> {
        self.write_atomic(&self.path(board, ".quarantine"), reason.as_bytes())
    }

    fn clear_quarantine(&self, board: &str) -> io::Result<()> {
        Self::remove_optional(&self.path(board, ".quarantine"))
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
