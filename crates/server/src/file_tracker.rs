//! Byte cursor for incremental reads of an append-only log.
//!
//! Each call to [`LineCursor::read_new_lines`] returns the complete lines
//! written since the previous call. A trailing line without its `\n` is left
//! for the next call, and the offset only moves past consumed separators.

use std::path::{Path, PathBuf};
use tokio::io::{self, AsyncReadExt, AsyncSeekExt};

pub struct LineCursor {
    /// Byte offset just past the last consumed `\n`.
    offset: u64,
    path: PathBuf,
}

impl LineCursor {
    /// Cursor at offset 0, so the first read replays the whole file.
    pub fn new(path: PathBuf) -> Self {
        Self { offset: 0, path }
    }

    /// Read complete lines appended since the last read.
    ///
    /// A file that does not exist yet reads as empty. If the file shrank
    /// below the offset it was replaced or truncated, and reading restarts
    /// from the beginning. On error the offset is left untouched.
    pub async fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();

        if len < self.offset {
            tracing::debug!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "Log shrank below cursor; rereading from start"
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(std::io::SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf).await?;

        Ok(self.consume(&buf))
    }

    /// Split off complete lines from `bytes` and advance past them.
    fn consume(&mut self, bytes: &[u8]) -> Vec<String> {
        let Some(last_newline) = memchr::memrchr(b'\n', bytes) else {
            return Vec::new();
        };
        let complete = &bytes[..=last_newline];
        self.offset += complete.len() as u64;

        complete
            .split(|&b| b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
