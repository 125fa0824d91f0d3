//! Text output of merged summaries.
//!
//! Each emitted summary is an eight line block:
//!
//! ```text
//! Summary of network traffic on rank 0, process 55:
//! pid           = 55
//! name          = nginx
//! tx_kb         = 120
//! rx_kb         = 340
//! n_event       = 1
//! avg_latency   = NaN
//! avg_lifetime  = 15.25
//! fraction_ipv6 = 0
//! ```

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::stats::ProcessSummary;

/// Where summaries are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Stdout,
    Stderr,
    File(PathBuf),
}

impl SinkTarget {
    /// `stdout` and `stderr` are reserved names; anything else is a path.
    pub fn parse(s: &str) -> Self {
        match s {
            "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            path => Self::File(PathBuf::from(path)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(p) => Some(p),
            Self::Stdout | Self::Stderr => None,
        }
    }
}

impl std::fmt::Display for SinkTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
            Self::File(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Writes one snapshot of summaries per cycle.
///
/// A file target is replaced whole on every emit: the snapshot goes to a
/// hidden sibling file first and is renamed over the target, so readers see
/// either the previous snapshot or the new one.
#[derive(Debug)]
pub struct TextSink {
    target: SinkTarget,
    buf: String,
}

impl TextSink {
    pub fn new(target: SinkTarget) -> Self {
        Self {
            target,
            buf: String::new(),
        }
    }

    pub fn target(&self) -> &SinkTarget {
        &self.target
    }

    /// Writes `summaries` in order as one snapshot.
    pub async fn emit<'a, I>(&mut self, summaries: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a ProcessSummary>,
    {
        self.buf.clear();
        let mut n = 0;
        for s in summaries {
            format_summary(&mut self.buf, s);
            n += 1;
        }

        match &self.target {
            SinkTarget::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(self.buf.as_bytes()).await?;
                out.flush().await?;
            }
            SinkTarget::Stderr => {
                let mut out = tokio::io::stderr();
                out.write_all(self.buf.as_bytes()).await?;
                out.flush().await?;
            }
            SinkTarget::File(path) => replace_file(path, self.buf.as_bytes()).await?,
        }

        Ok(n)
    }
}

async fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path);

    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;

    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "summary".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Appends the text block for one summary.
pub fn format_summary(out: &mut String, s: &ProcessSummary) {
    // Writing to a String cannot fail.
    let _ = writeln!(
        out,
        "Summary of network traffic on rank {}, process {}:",
        s.rank, s.pid
    );
    let _ = writeln!(out, "pid           = {}", s.pid);
    let _ = writeln!(out, "name          = {}", s.comm);
    let _ = writeln!(out, "tx_kb         = {}", s.tx_kb);
    let _ = writeln!(out, "rx_kb         = {}", s.rx_kb);
    let _ = writeln!(out, "n_event       = {}", s.n_event);
    let _ = writeln!(out, "avg_latency   = {}", s.avg_latency_ms);
    let _ = writeln!(out, "avg_lifetime  = {}", s.avg_lifetime_ms);
    let _ = writeln!(
        out,
        "fraction_ipv6 = {}",
        format_significant(s.fraction_ipv6, 3)
    );
}

/// Formats `v` with at most `digits` significant digits in the manner of
/// C's `%g`: trailing zeros dropped, exponent form for very large or small
/// magnitudes.
pub fn format_significant(v: f64, digits: usize) -> String {
    if !v.is_finite() {
        return v.to_string();
    }
    if v == 0.0 {
        return "0".to_string();
    }

    let digits = digits.max(1);
    // Round first so 0.9996 becomes 1 and picks the right exponent.
    let sci = format!("{:.*e}", digits - 1, v);
    let exp: i32 = sci
        .split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0);

    if exp < -4 || exp >= digits as i32 {
        let (mantissa, _) = sci.split_once('e').unwrap_or((sci.as_str(), ""));
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{}e{sign}{:02}", trim_zeros(mantissa), exp.abs());
    }

    let decimals = (digits as i32 - 1 - exp).max(0) as usize;
    trim_zeros(&format!("{v:.decimals$}")).to_string()
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}
