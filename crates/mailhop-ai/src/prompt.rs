use mailhop_core::MailMessage;

pub const MAX_BODY_CHARS: usize = 4000;

pub const SYSTEM_PROMPT: &str = "You are a helpful AI assistant that summarizes emails and extracts structured information. Always respond with valid JSON.";

const INSTRUCTIONS: &str = r#"Provide JSON with:
{
  "summary": "2-3 sentence summary focusing on most important info",
  "extracted_data": {
    "verification_codes": ["123456"],
    "amounts": ["$49.99"],
    "due_dates": ["2024-02-15"],
    "action_items": ["Click verification link"],
    "tracking_numbers": ["1Z999AA10123456784"]
  }
}

Focus on actionable information. Use empty arrays if nothing to extract.
Be concise and highlight the most important information.
For verification codes, extract any numeric or alphanumeric codes.
For amounts, include currency symbols.
For dates, use ISO format (YYYY-MM-DD) when possible.
For action items, be specific about what the user needs to do."#;

/// User prompt for one message. Prefers the text body, falls back to raw
/// HTML, and caps the body at [`MAX_BODY_CHARS`] characters.
pub fn build_prompt(message: &MailMessage) -> String {
    let subject = message
        .subject
        .as_deref()
        .filter(|subject| !subject.is_empty())
        .unwrap_or("No subject");

    let body = message
        .body_text
        .as_deref()
        .filter(|body| !body.is_empty())
        .or_else(|| message.body_html.as_deref().filter(|body| !body.is_empty()))
        .unwrap_or_default();
    let body = match body.char_indices().nth(MAX_BODY_CHARS) {
        Some((cut, _)) => format!("{}... (truncated)", &body[..cut]),
        None => body.to_string(),
    };

    let from = match message.from.name.as_deref().filter(|name| !name.is_empty()) {
        Some(name) => format!("{} ({name})", message.from.address),
        None => message.from.address.clone(),
    };

    format!(
        "You are an AI that summarizes emails and extracts key information.\n\n\
         Email:\nFrom: {from}\nSubject: {subject}\nContent:\n{body}\n\n{INSTRUCTIONS}"
    )
}
