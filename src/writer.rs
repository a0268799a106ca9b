//! Saving attachments to disk
//!
//! Filenames come from the remote sender, so only their last path
//! component is ever used. Files with the same name are overwritten:
//! the newest attachment wins.

use crate::error::Result;
use crate::parser::Attachment;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Why an attachment was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The part carried no filename.
    NoFilename,
    /// Nothing usable was left after stripping directories and
    /// control characters (e.g. `".."` or `"dir/"`).
    UnsafeFilename,
}

/// Outcome of [`AttachmentWriter::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Saved {
    Written(PathBuf),
    Skipped(SkipReason),
}

/// Writes attachments into a single directory.
#[derive(Debug, Clone)]
pub struct AttachmentWriter {
    dir: PathBuf,
}

impl AttachmentWriter {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one attachment, replacing any file of the same name.
    ///
    /// The directory is created on first use. Content goes to a
    /// temporary sibling first and is renamed into place, so the
    /// destination is either the previous version or complete.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if the directory cannot be created
    /// or the file cannot be written.
    pub async fn save(&self, attachment: &Attachment) -> Result<Saved> {
        let Some(name) = attachment.filename.as_deref() else {
            return Ok(Saved::Skipped(SkipReason::NoFilename));
        };
        let Some(name) = sanitize_filename(name) else {
            return Ok(Saved::Skipped(SkipReason::UnsafeFilename));
        };

        fs::create_dir_all(&self.dir).await?;

        let path = self.dir.join(&name);
        // Independent of `name`, which may already be at the length limit.
        let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
        let partial = self
            .dir
            .join(format!(".{}.{seq}.part", std::process::id()));

        if let Err(e) = write_then_rename(&partial, &path, &attachment.content).await {
            fs::remove_file(&partial).await.ok();
            return Err(e.into());
        }
        Ok(Saved::Written(path))
    }
}

async fn write_then_rename(partial: &Path, path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(partial).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(partial, path).await
}

/// Reduce an untrusted filename to a bare file name.
///
/// Both `/` and `\` count as separators regardless of platform.
/// Returns `None` when nothing safe remains.
///
/// # Examples
///
/// ```
/// use mail_attachment_fetcher::sanitize_filename;
///
/// assert_eq!(sanitize_filename("../../evil.txt").as_deref(), Some("evil.txt"));
/// assert_eq!(sanitize_filename("C:\\Users\\me\\a.pdf").as_deref(), Some("a.pdf"));
/// assert_eq!(sanitize_filename(".."), None);
/// ```
#[must_use]
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    match cleaned {
        "" | "." | ".." => None,
        name => Some(name.to_string()),
    }
}
