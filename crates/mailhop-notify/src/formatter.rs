use crate::{ChatMessage, InlineButton, InlineKeyboard};
use html_escape::{decode_html_entities, encode_text};
use mailhop_core::MailMessage;
use regex::Regex;
use std::fmt::Write;
use std::sync::OnceLock;

pub const PREVIEW_CHARS: usize = 200;

/// Renders stored messages into HTML chat notifications.
#[derive(Debug, Clone, Default)]
pub struct NotificationFormatter;

impl NotificationFormatter {
    pub fn new() -> Self {
        Self
    }

    pub fn format(&self, message: &MailMessage) -> ChatMessage {
        let mut text = String::from("<b>📧 New Email</b>\n\n");

        match message.from.name.as_deref().filter(|name| !name.is_empty()) {
            Some(name) => {
                let _ = writeln!(
                    text,
                    "<b>From:</b> {} &lt;{}&gt;",
                    encode_text(name),
                    encode_text(&message.from.address)
                );
            }
            None => {
                let _ = writeln!(text, "<b>From:</b> {}", encode_text(&message.from.address));
            }
        }

        let subject = message
            .subject
            .as_deref()
            .filter(|subject| !subject.is_empty())
            .unwrap_or("No subject");
        let _ = write!(text, "<b>Subject:</b> {}\n\n", encode_text(subject));

        match message.summary.summary.as_deref().filter(|_| message.summary.has_summary()) {
            Some(summary) => {
                text.push_str("<b>🤖 Summary:</b>\n");
                text.push_str(&encode_text(summary));
                text.push_str("\n\n");
                if let Some(extracted) = &message.summary.extracted {
                    push_extracted(&mut text, extracted);
                }
            }
            None => {
                text.push_str("<b>Preview:</b>\n");
                let preview = preview(message);
                if !preview.is_empty() {
                    text.push_str(&preview);
                    text.push_str("\n\n");
                }
            }
        }

        if !message.attachments.is_empty() {
            text.push_str("📎 Has attachments\n");
        }

        let id = message.id;
        let keyboard = InlineKeyboard::default()
            .row(vec![
                InlineButton::callback("🌐 View Full", format!("view_{id}")),
                InlineButton::callback("↩️ Reply", format!("reply_{id}")),
            ])
            .row(vec![InlineButton::callback("✅ Mark Read", format!("mark_read_{id}"))]);

        ChatMessage::html(text).with_keyboard(keyboard)
    }
}

/// First entry of each highlighted category.
fn push_extracted(text: &mut String, extracted: &mailhop_core::ExtractedData) {
    let first = |items: &[String]| items.first().map(|item| encode_text(item).into_owned());
    let mut shown = false;

    if let Some(code) = first(&extracted.verification_codes) {
        let _ = write!(text, "<b>🔑 Code:</b> <code>{code}</code>\n\n");
        shown = true;
    }
    if let Some(amount) = first(&extracted.amounts) {
        let _ = writeln!(text, "<b>💰 Amount:</b> {amount}");
        shown = true;
    }
    if let Some(due) = first(&extracted.due_dates) {
        let _ = writeln!(text, "<b>📅 Due:</b> {due}");
        shown = true;
    }
    if let Some(tracking) = first(&extracted.tracking_numbers) {
        let _ = writeln!(text, "<b>📦 Tracking:</b> <code>{tracking}</code>");
        shown = true;
    }
    if shown {
        text.push('\n');
    }
}

/// Escaped body preview of at most [`PREVIEW_CHARS`] characters, joined
/// from non-empty lines. A line that does not fit is cut and followed by
/// `...`.
fn preview(message: &MailMessage) -> String {
    let source = match message.body_text.as_deref().filter(|text| !text.is_empty()) {
        Some(text) => text.to_string(),
        None => match message.sanitized_html.as_deref().filter(|html| !html.is_empty()) {
            Some(html) => strip_html(html),
            None => return String::new(),
        },
    };

    let mut preview = String::new();
    let mut count = 0;
    for line in source.trim().lines().map(str::trim).filter(|line| !line.is_empty()) {
        let length = line.chars().count();
        if count + length > PREVIEW_CHARS {
            let remaining = PREVIEW_CHARS - count;
            if !preview.is_empty() && remaining > 0 {
                preview.push(' ');
            }
            preview.extend(line.chars().take(remaining));
            preview.push_str("...");
            break;
        }

        if !preview.is_empty() {
            preview.push(' ');
        }
        preview.push_str(line);
        count += length;
    }

    encode_text(&preview).into_owned()
}

/// Plain text of an HTML fragment: line breaks for `<br>`, `</p>` and
/// `</div>`, other tags removed, entities decoded.
pub fn strip_html(html: &str) -> String {
    static BREAKS: OnceLock<Regex> = OnceLock::new();
    static TAGS: OnceLock<Regex> = OnceLock::new();

    let breaks = BREAKS.get_or_init(|| {
        Regex::new(r"(?i)<br\s*/?>|</p\s*>|</div\s*>").expect("valid line-break regex")
    });
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

    let text = breaks.replace_all(html, "\n");
    let text = tags.replace_all(&text, "");
    decode_html_entities(&text).into_owned()
}
