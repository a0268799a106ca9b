//! Mail attachment fetcher
//!
//! Polls an IMAP inbox on a fixed interval and saves the attachments
//! of newly arrived messages into a local directory. Every poll opens
//! its own TLS session, fetches unseen mail with `RFC822` (which marks
//! it `\Seen`), walks the MIME tree for parts disposed as
//! `attachment`, and writes them under their sanitized base name.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mail_attachment_fetcher::{Config, Fetcher};
//!
//! # async fn demo() -> mail_attachment_fetcher::Result<()> {
//! let fetcher = Arc::new(Fetcher::new(Config::from_env()?)?);
//! let handle = fetcher.start()?;
//! // ... later, from any task or thread:
//! fetcher.stop();
//! handle.await.ok();
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod fetcher;
mod parser;
mod policy;
mod session;
mod writer;

pub use config::Config;
pub use error::{Error, Result};
pub use fetcher::{Fetcher, LoopState, TickReport};
pub use parser::{
    Attachment, Attachments, Decoded, ParsedMessage, decode_with_fallback, parse_sender,
};
pub use policy::{SelectionPolicy, TlsMode};
pub use session::{MailSession, RawMessage};
pub use writer::{AttachmentWriter, Saved, SkipReason, sanitize_filename};
