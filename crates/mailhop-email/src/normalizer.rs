use crate::{EmailError, HtmlSanitizer};
use chrono::{DateTime, TimeZone, Utc};
use mailhop_core::{AttachmentRecord, MailAddress};
use mailparse::{addrparse_header, parse_mail, MailAddr, MailHeaderMap, ParsedMail, SingleInfo};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Provider-neutral view of one parsed RFC 822 message.
#[derive(Debug, Clone)]
pub struct CanonicalMessage {
    pub message_id_header: Option<String>,
    pub from: MailAddress,
    pub to: Vec<MailAddress>,
    pub subject: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub sanitized_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub attachments: Vec<AttachmentRecord>,
}

/// Parses raw messages and writes their attachments under
/// `<attachments_root>/<message id>/`.
pub struct Normalizer {
    attachments_root: PathBuf,
    sanitizer: HtmlSanitizer,
}

impl Normalizer {
    pub fn new(attachments_root: impl Into<PathBuf>) -> Self {
        Self {
            attachments_root: attachments_root.into(),
            sanitizer: HtmlSanitizer::new(),
        }
    }

    pub fn attachments_root(&self) -> &Path {
        &self.attachments_root
    }

    pub fn message_dir(&self, message_id: Uuid) -> PathBuf {
        self.attachments_root.join(message_id.to_string())
    }

    /// Blocking: touches the filesystem for attachments.
    pub fn parse(&self, message_id: Uuid, raw: &[u8]) -> Result<CanonicalMessage, EmailError> {
        let parsed = parse_mail(raw)?;

        let from = parse_address_list(&parsed, "From")
            .into_iter()
            .next()
            .unwrap_or_else(|| MailAddress {
                name: None,
                address: String::new(),
            });
        let body_html = extract_html_body(&parsed);
        let sanitized_html = body_html.as_deref().map(|html| self.sanitizer.clean(html));
        let attachments = self.store_attachments(message_id, &parsed);

        Ok(CanonicalMessage {
            message_id_header: header_value(&parsed, "Message-ID").and_then(non_empty),
            from,
            to: parse_address_list(&parsed, "To"),
            subject: header_value(&parsed, "Subject").and_then(non_empty),
            sent_at: parsed_message_date(&parsed),
            body_text: extract_text_body(&parsed),
            body_html,
            sanitized_html,
            in_reply_to: header_value(&parsed, "In-Reply-To").and_then(non_empty),
            references: header_value(&parsed, "References").and_then(non_empty),
            attachments,
        })
    }

    /// Best-effort removal of a message's attachment directory.
    pub fn discard_attachments(&self, message_id: Uuid) {
        let dir = self.message_dir(message_id);
        if dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(path = %dir.display(), "failed to remove attachments: {err}");
            }
        }
    }

    fn store_attachments(&self, message_id: Uuid, parsed: &ParsedMail<'_>) -> Vec<AttachmentRecord> {
        let mut parts = Vec::new();
        collect_attachments(parsed, &mut parts);
        if parts.is_empty() {
            return Vec::new();
        }

        let dir = self.message_dir(message_id);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            tracing::warn!(path = %dir.display(), "cannot create attachment directory: {err}");
            return Vec::new();
        }

        let mut used = HashSet::new();
        let mut records = Vec::new();
        for (index, part) in parts.into_iter().enumerate() {
            let mut filename = part
                .filename
                .as_deref()
                .and_then(safe_filename)
                .unwrap_or_else(|| format!("attachment_{}", index + 1));
            if !used.insert(filename.clone()) {
                filename = format!("{}_{filename}", index + 1);
                used.insert(filename.clone());
            }

            let path = dir.join(&filename);
            if let Err(err) = std::fs::write(&path, &part.content) {
                tracing::warn!(path = %path.display(), "skipping attachment: {err}");
                continue;
            }

            records.push(AttachmentRecord {
                filename,
                content_type: part.content_type,
                size: part.content.len() as u64,
                path: path.to_string_lossy().into_owned(),
            });
        }

        records
    }
}

/// `Message-ID` of a raw message without parsing the body.
pub fn message_id_from_raw(raw: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    headers.get_first_value("Message-ID").and_then(non_empty)
}

struct AttachmentPart {
    filename: Option<String>,
    content_type: String,
    content: Vec<u8>,
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Reduces an attacker-supplied name to a single path component.
fn safe_filename(raw: &str) -> Option<String> {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|ch| !ch.is_control()).collect();
    let cleaned = cleaned.trim().trim_start_matches('.').trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn header_value(mail: &ParsedMail<'_>, key: &str) -> Option<String> {
    for header in mail.get_headers() {
        if header.get_key_ref().eq_ignore_ascii_case(key) {
            return Some(header.get_value());
        }
    }

    None
}

/// Addresses of the first `key` header. Quoted display names may contain
/// commas; group members are flattened. An unparseable header is kept
/// whole as a bare address.
fn parse_address_list(mail: &ParsedMail<'_>, key: &str) -> Vec<MailAddress> {
    let Some(header) = mail.headers.get_first_header(key) else {
        return Vec::new();
    };

    match addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(info) => vec![info],
                MailAddr::Group(group) => group.addrs.iter().collect(),
            })
            .filter_map(to_mail_address)
            .collect(),
        Err(err) => {
            let raw = header.get_value();
            tracing::debug!(header = key, "unparseable address header: {err}");
            non_empty(raw)
                .map(|address| {
                    vec![MailAddress {
                        name: None,
                        address,
                    }]
                })
                .unwrap_or_default()
        }
    }
}

fn to_mail_address(info: &SingleInfo) -> Option<MailAddress> {
    let address = info.addr.trim();
    if address.is_empty() {
        return None;
    }

    Some(MailAddress {
        name: info
            .display_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string),
        address: address.to_string(),
    })
}

fn is_attachment_part(mail: &ParsedMail<'_>) -> bool {
    header_value(mail, "Content-Disposition")
        .map(|value| value.to_ascii_lowercase().trim_start().starts_with("attachment"))
        .unwrap_or(false)
}

fn extract_text_body(mail: &ParsedMail<'_>) -> Option<String> {
    extract_body(mail, "text/plain")
}

fn extract_html_body(mail: &ParsedMail<'_>) -> Option<String> {
    extract_body(mail, "text/html")
}

fn extract_body(mail: &ParsedMail<'_>, mimetype: &str) -> Option<String> {
    if mail.subparts.is_empty() {
        if is_attachment_part(mail) || !mail.ctype.mimetype.eq_ignore_ascii_case(mimetype) {
            return None;
        }
        return mail.get_body().ok();
    }

    mail.subparts
        .iter()
        .find_map(|part| extract_body(part, mimetype))
}

fn collect_attachments(mail: &ParsedMail<'_>, parts: &mut Vec<AttachmentPart>) {
    if !mail.subparts.is_empty() {
        for part in &mail.subparts {
            collect_attachments(part, parts);
        }
        return;
    }

    let disposition = header_value(mail, "Content-Disposition").unwrap_or_default();
    let lowered = disposition.to_ascii_lowercase();
    let filename = header_filename(&disposition).or_else(|| mail.ctype.params.get("name").cloned());
    let is_attachment =
        lowered.contains("attachment") || (lowered.contains("inline") && filename.is_some());
    if !is_attachment {
        return;
    }

    parts.push(AttachmentPart {
        filename,
        content_type: mail.ctype.mimetype.clone(),
        content: mail.get_body_raw().unwrap_or_default(),
    });
}

fn header_filename(disposition: &str) -> Option<String> {
    let idx = disposition.to_ascii_lowercase().find("filename=")?;
    let raw = disposition[idx + "filename=".len()..].trim();

    if let Some(stripped) = raw.strip_prefix('"') {
        let end = stripped.find('"')?;
        return Some(stripped[..end].to_string());
    }

    raw.split(';')
        .next()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parsed_message_date(parsed: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let raw = header_value(parsed, "Date")?;
    let timestamp = mailparse::dateparse(&raw).ok()?;
    Utc.timestamp_opt(timestamp, 0).single()
}
