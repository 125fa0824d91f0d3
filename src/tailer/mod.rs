//! Append-only file tailing.
//!
//! A [`TailedFile`] remembers the byte offset just past the last complete
//! line it handed out. Growth checks never move that offset, so a caller can
//! poll cheaply and only read when there is something new.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

/// Header lines the upstream tracing tools print before any event.
pub const DEFAULT_HEADER_LINES: usize = 2;

/// Reader over a growing text file.
#[derive(Debug)]
pub struct TailedFile {
    path: PathBuf,
    reader: BufReader<File>,
    /// Start of the first byte not yet handed out as part of a line.
    offset: u64,
    /// Header lines still to be discarded before lines are delivered.
    pending_header: usize,
    line: Vec<u8>,
}

impl TailedFile {
    /// Opens `path` positioned at its start.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;

        Ok(Self {
            path,
            reader: BufReader::new(file),
            offset: 0,
            pending_header: 0,
            line: Vec::with_capacity(256),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset of the next unread byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Discards the next `n` complete lines. Header lines that have not been
    /// written yet are discarded as soon as they appear.
    pub async fn skip_header(&mut self, n: usize) -> io::Result<()> {
        self.pending_header += n;
        while self.pending_header > 0 && self.next_line().await? {
            self.pending_header -= 1;
        }
        Ok(())
    }

    /// Seeks to end of file, records that position as the read offset and
    /// returns it. Anything before it will never be delivered.
    pub async fn end_offset(&mut self) -> io::Result<u64> {
        let end = self.reader.seek(SeekFrom::End(0)).await?;
        self.offset = end;
        Ok(end)
    }

    /// Returns the number of bytes appended past the read offset. The read
    /// position is restored, so a following [`read_lines`](Self::read_lines)
    /// resumes exactly where the last one stopped.
    pub async fn has_grown(&mut self) -> io::Result<u64> {
        let end = self.reader.seek(SeekFrom::End(0)).await?;
        self.reader.seek(SeekFrom::Start(self.offset)).await?;
        Ok(end.saturating_sub(self.offset))
    }

    /// Delivers every complete line currently available, without its line
    /// terminator, and returns how many were delivered.
    ///
    /// A trailing line with no newline yet is left unread: the reader is
    /// moved back to its first byte and it is delivered whole once the
    /// writer finishes it.
    pub async fn read_lines<F>(&mut self, mut on_line: F) -> io::Result<usize>
    where
        F: FnMut(&str),
    {
        let mut delivered = 0;

        while self.next_line().await? {
            if self.pending_header > 0 {
                self.pending_header -= 1;
                continue;
            }

            let mut end = self.line.len() - 1;
            if end > 0 && self.line.get(end - 1) == Some(&b'\r') {
                end -= 1;
            }
            let text = String::from_utf8_lossy(self.line.get(..end).unwrap_or_default());
            on_line(text.as_ref());
            delivered += 1;
        }

        Ok(delivered)
    }

    /// Reads the next complete line, terminator included, into `self.line`
    /// and advances the offset past it. Returns false at end of data.
    async fn next_line(&mut self) -> io::Result<bool> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line).await?;
        if n == 0 {
            return Ok(false);
        }

        if self.line.last() != Some(&b'\n') {
            self.reader.seek(SeekFrom::Start(self.offset)).await?;
            return Ok(false);
        }

        self.offset += n as u64;
        Ok(true)
    }
}
