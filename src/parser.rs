//! Message parsing
//!
//! Decodes the sender and walks the MIME part tree of a raw message,
//! yielding the parts whose `Content-Disposition` is `attachment`.
//! Header decoding never fails: undecodable bytes are replaced with
//! U+FFFD and the result is flagged as lossy.

use crate::error::{Error, Result};
use mailparse::{DispositionType, MailAddr, MailHeader, MailHeaderMap, ParsedMail};
use std::borrow::Cow;
use std::iter::FusedIterator;

const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// A decoded header value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// Set when bytes could not be decoded and were replaced.
    pub lossy: bool,
}

/// Decode a raw header value (RFC 2047 encoded words included).
///
/// Bytes that are not valid in their declared charset are replaced
/// with U+FFFD instead of failing, and `lossy` is set.
///
/// # Examples
///
/// ```
/// use mail_attachment_fetcher::decode_with_fallback;
///
/// let ok = decode_with_fallback(b"=?utf-8?B?UmVwb3J0LnBkZg==?=");
/// assert_eq!(ok.text, "Report.pdf");
/// assert!(!ok.lossy);
///
/// let bad = decode_with_fallback(b"caf\xe9.txt");
/// assert_eq!(bad.text, "caf\u{fffd}.txt");
/// assert!(bad.lossy);
/// ```
#[must_use]
pub fn decode_with_fallback(raw: &[u8]) -> Decoded {
    match std::str::from_utf8(raw) {
        Ok(text) => {
            let decoded = decode_encoded_words(text);
            let lossy = replacements(&decoded) > replacements(text);
            Decoded {
                text: decoded,
                lossy,
            }
        }
        Err(_) => Decoded {
            text: decode_encoded_words(&String::from_utf8_lossy(raw)),
            lossy: true,
        },
    }
}

/// Decode the display name of the `From` header of a raw message.
///
/// Falls back to the address, then to the whole decoded header. A
/// message without a `From` header yields an empty string.
#[must_use]
pub fn parse_sender(raw: &[u8]) -> Decoded {
    mailparse::parse_headers(raw)
        .map(|(headers, _)| sender_from_headers(&headers))
        .unwrap_or_default()
}

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Decoded filename as sent by the remote party. Untrusted: only
    /// use it as a path after sanitizing.
    pub filename: Option<String>,
    /// Set when the filename needed replacement characters.
    pub lossy_filename: bool,
    pub content_type: String,
    /// Transfer-decoded content.
    pub content: Vec<u8>,
}

/// A parsed message borrowing its raw bytes.
pub struct ParsedMessage<'a> {
    mail: ParsedMail<'a>,
    sender: Decoded,
}

impl<'a> ParsedMessage<'a> {
    /// Parse the envelope and part structure of a raw message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Parse`] if the message structure cannot be
    /// parsed at all. Problems inside individual parts surface later,
    /// as items of [`ParsedMessage::attachments`].
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let mail = mailparse::parse_mail(raw).map_err(|e| Error::Parse(e.to_string()))?;
        let sender = sender_from_headers(&mail.headers);
        Ok(Self { mail, sender })
    }

    #[must_use]
    pub const fn sender(&self) -> &Decoded {
        &self.sender
    }

    /// Lazily walk the part tree in document order.
    ///
    /// Each item is decoded only when requested. A part whose body
    /// cannot be decoded yields an `Err` and the walk continues.
    #[must_use]
    pub fn attachments(&self) -> Attachments<'_, 'a> {
        Attachments {
            stack: vec![&self.mail],
            forwarded: Vec::new().into_iter(),
        }
    }
}

/// Depth-first iterator over the attachment parts of a message.
///
/// Forwarded messages (`message/rfc822` parts not themselves disposed
/// as attachments) are opened and their attachments are yielded in
/// place. Those are decoded together when the forwarded part is
/// reached, since they borrow from its decoded body.
pub struct Attachments<'m, 'a> {
    stack: Vec<&'m ParsedMail<'a>>,
    forwarded: std::vec::IntoIter<Result<Attachment>>,
}

impl Iterator for Attachments<'_, '_> {
    type Item = Result<Attachment>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.forwarded.next() {
            return Some(item);
        }
        while let Some(part) = self.stack.pop() {
            self.stack.extend(part.subparts.iter().rev());
            if let Some(item) = attachment_of(part) {
                return Some(item);
            }
            if part.ctype.mimetype.eq_ignore_ascii_case("message/rfc822") {
                self.forwarded = forwarded_attachments(part).into_iter();
                if let Some(item) = self.forwarded.next() {
                    return Some(item);
                }
            }
        }
        None
    }
}

impl FusedIterator for Attachments<'_, '_> {}

/// `None` unless the part is explicitly disposed as an attachment.
fn attachment_of(part: &ParsedMail<'_>) -> Option<Result<Attachment>> {
    let header = part.headers.get_first_header("Content-Disposition")?;
    let (value, lossy) = unfolded_value(header);
    let disposition = mailparse::parse_content_disposition(&value);
    if disposition.disposition != DispositionType::Attachment {
        return None;
    }

    let (filename, lossy_filename) = match disposition.params.get("filename") {
        Some(name) => (Some(name.clone()), lossy),
        None => content_type_name(part),
    };
    let filename = filename
        .map(|name| decode_encoded_words(&name))
        .filter(|name| !name.trim().is_empty());
    let lossy_filename =
        lossy_filename || filename.as_deref().is_some_and(|n| n.contains(REPLACEMENT));

    let content = match part.get_body_raw() {
        Ok(content) => content,
        Err(e) => {
            let name = filename.as_deref().unwrap_or("<unnamed>");
            return Some(Err(Error::Parse(format!(
                "Cannot decode attachment {name}: {e}"
            ))));
        }
    };

    Some(Ok(Attachment {
        filename,
        lossy_filename,
        content_type: part.ctype.mimetype.clone(),
        content,
    }))
}

/// The legacy `name` parameter of `Content-Type`.
fn content_type_name(part: &ParsedMail<'_>) -> (Option<String>, bool) {
    part.headers
        .get_first_header("Content-Type")
        .map_or((None, false), |header| {
            let (value, lossy) = unfolded_value(header);
            let name = mailparse::parse_content_type(&value)
                .params
                .get("name")
                .cloned();
            (name, lossy)
        })
}

/// Header value with folding removed but encoded words left intact,
/// so a decoded `"` or `;` cannot split parameters. The flag is set
/// when invalid UTF-8 was replaced.
fn unfolded_value(header: &MailHeader<'_>) -> (String, bool) {
    let text = String::from_utf8_lossy(header.get_value_raw());
    let lossy = matches!(text, Cow::Owned(_));
    (text.replace(['\r', '\n'], ""), lossy)
}

/// Attachments of a forwarded message, walked like the outer one.
fn forwarded_attachments(part: &ParsedMail<'_>) -> Vec<Result<Attachment>> {
    let body = match part.get_body_raw() {
        Ok(body) => body,
        Err(e) => {
            return vec![Err(Error::Parse(format!(
                "Cannot decode forwarded message: {e}"
            )))];
        }
    };
    match ParsedMessage::parse(&body) {
        Ok(inner) => inner.attachments().collect(),
        Err(e) => vec![Err(e)],
    }
}

fn sender_from_headers(headers: &[MailHeader<'_>]) -> Decoded {
    let Some(header) = headers.get_first_header("From") else {
        return Decoded::default();
    };

    let decoded = decode_with_fallback(header.get_value_raw());
    let addresses = if decoded.lossy {
        mailparse::addrparse(&decoded.text)
    } else {
        mailparse::addrparse_header(header)
    };

    let name = addresses
        .ok()
        .and_then(|list| list.iter().find_map(display_name));

    Decoded {
        text: name.unwrap_or_else(|| decoded.text.trim().to_string()),
        lossy: decoded.lossy,
    }
}

fn display_name(addr: &MailAddr) -> Option<String> {
    match addr {
        MailAddr::Single(info) => Some(
            info.display_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| info.addr.clone()),
        ),
        MailAddr::Group(group) => Some(group.group_name.clone()),
    }
}

/// Run RFC 2047 decoding over free text.
///
/// Parameter values such as `filename="=?utf-8?B?...?="` are often
/// encoded even though RFC 2047 does not allow it inside quotes.
fn decode_encoded_words(text: &str) -> String {
    if !text.contains("=?") {
        return text.to_string();
    }
    let line = format!("X: {text}");
    mailparse::parse_header(line.as_bytes())
        .map_or_else(|_| text.to_string(), |(header, _)| header.get_value())
}

fn replacements(text: &str) -> usize {
    text.chars().filter(|c| *c == REPLACEMENT).count()
}
