//! SEARCH command handler.
//!
//! Plain (non-UID) SEARCH, so results are message sequence numbers.
//! Only the flag criteria the fetcher uses are understood:
//!
//! - `All`
//! - `Unseen` / `Seen`
//!
//! The response format (RFC 3501 Section 7.2.5):
//!
//! ```text
//! * SEARCH 1 3
//! A0003 OK SEARCH completed
//! ```

use crate::fake_imap::io::write_line;
use crate::fake_imap::mailbox::{Mailbox, TestEmail};
use imap_codec::imap_types::search::SearchKey;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Handle the SEARCH command against the selected inbox.
pub async fn handle_search<S: AsyncRead + AsyncWrite + Unpin>(
    tag: &str,
    criteria: &[SearchKey<'_>],
    mailbox: &Mailbox,
    selected: bool,
    stream: &mut BufReader<S>,
) {
    if !selected {
        let resp = format!("{tag} BAD No folder selected\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }
    if mailbox.stall_search {
        std::future::pending::<()>().await;
    }
    if mailbox.reject_search {
        let resp = format!("{tag} NO SEARCH unavailable\r\n");
        let _ = write_line(stream, &resp).await;
        return;
    }

    let hits: Vec<String> = mailbox
        .emails
        .iter()
        .zip(1u32..)
        .filter(|(email, _)| criteria.iter().all(|key| matches_key(email, key)))
        .map(|(_, seq)| seq.to_string())
        .collect();

    let search_line = if hits.is_empty() {
        "* SEARCH\r\n".to_string()
    } else {
        format!("* SEARCH {}\r\n", hits.join(" "))
    };
    let _ = write_line(stream, &search_line).await;
    let resp = format!("{tag} OK SEARCH completed\r\n");
    let _ = write_line(stream, &resp).await;
}

#[allow(clippy::match_same_arms)]
fn matches_key(email: &TestEmail, key: &SearchKey<'_>) -> bool {
    match key {
        SearchKey::All => true,
        SearchKey::Unseen => !email.seen,
        SearchKey::Seen => email.seen,
        SearchKey::And(keys) => keys.as_ref().iter().all(|k| matches_key(email, k)),
        SearchKey::Not(k) => !matches_key(email, k),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_imap::io::capture;
    use crate::fake_imap::mailbox::MailboxBuilder;

    const RAW: &[u8] = b"From: a@b.com\r\nSubject: Test\r\n\r\nBody";

    async fn run(criteria: &[SearchKey<'_>], mailbox: &Mailbox, selected: bool) -> String {
        capture(|mut stream| async move {
            handle_search("A1", criteria, mailbox, selected, &mut stream).await;
            (stream, ())
        })
        .await
        .0
    }

    #[tokio::test]
    async fn unseen_returns_sequence_numbers() {
        let mailbox = MailboxBuilder::new()
            .email(false, RAW)
            .email(true, RAW)
            .email(false, RAW)
            .build();

        let output = run(&[SearchKey::Unseen], &mailbox, true).await;

        assert!(output.contains("* SEARCH 1 3\r\n"));
        assert!(output.contains("A1 OK SEARCH completed"));
    }

    #[tokio::test]
    async fn all_returns_every_message() {
        let mailbox = MailboxBuilder::new().email(true, RAW).email(false, RAW).build();
        let output = run(&[SearchKey::All], &mailbox, true).await;
        assert!(output.contains("* SEARCH 1 2\r\n"));
    }

    #[tokio::test]
    async fn empty_result_is_bare_search() {
        let mailbox = MailboxBuilder::new().email(true, RAW).build();
        let output = run(&[SearchKey::Unseen], &mailbox, true).await;
        assert!(output.starts_with("* SEARCH\r\n"));
    }

    #[tokio::test]
    async fn requires_selected_folder() {
        let mailbox = MailboxBuilder::new().build();
        let output = run(&[SearchKey::All], &mailbox, false).await;
        assert!(output.contains("A1 BAD No folder selected"));
    }

    #[tokio::test]
    async fn rejected_search_is_no() {
        let mailbox = MailboxBuilder::new().email(false, RAW).reject_search().build();
        let output = run(&[SearchKey::Unseen], &mailbox, true).await;
        assert!(output.contains("A1 NO"));
        assert!(!output.contains("* SEARCH"));
    }
}
