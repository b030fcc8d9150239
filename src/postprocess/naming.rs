use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::anthropic::{
    AnthropicError, ContentPart, Message, MessageSender, MessagesRequest,
};

const MAX_NAME_LEN: usize = 120;

const NAMING_PROMPT: &str = "\
You receive a utility bill. Reply with ONLY a file name in the format
<HOLDER>_<BLOCK>_<MM-YYYY>

Rules:
1. HOLDER is the condominium, building or customer name, prefixed with
   CONDOMINIO or EDIFICIO when the property is one.
2. Include BLOCK (e.g. BLOCOA) only when the bill identifies one.
3. MM-YYYY is the reference month of the bill.
4. Use only letters, digits, '-' and '_'; no accents, no spaces, no extension.
5. No explanations.

Examples:
CONDOMINIO_SOL_BLOCOA_01-2024
EDIFICIO_CENTRAL_07-2023";

/// Whether `name` already carries the handled-document marker.
pub fn is_handled(name: &str, marker: &str) -> bool {
    name.starts_with(marker)
}

/// Reduces free text to `[A-Za-z0-9_-]`, folding common accents and
/// dropping a trailing `.pdf`.
pub fn sanitize(raw: &str) -> String {
    let first_line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let trimmed = first_line.trim().trim_matches(|c| c == '`' || c == '"' || c == '\'');
    let stem = match trimmed.len().checked_sub(4) {
        Some(cut) if trimmed.is_char_boundary(cut) && trimmed[cut..].eq_ignore_ascii_case(".pdf") => {
            &trimmed[..cut]
        }
        _ => trimmed,
    };

    let mut out = String::with_capacity(stem.len());
    for c in stem.chars() {
        let c = fold_accent(c);
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else if (c == '_' || c.is_whitespace() || c == '.') && !out.ends_with('_') {
            out.push('_');
        }
    }
    let out = out.trim_matches(|c| c == '_' || c == '-');
    out.chars().take(MAX_NAME_LEN).collect()
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
        'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'A',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'í' | 'ì' | 'î' | 'ï' => 'i',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
        'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'O',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'ç' => 'c',
        'Ç' => 'C',
        'ñ' => 'n',
        'Ñ' => 'N',
        other => other,
    }
}

/// Name used without a model: original stem plus the processing date.
pub fn fallback_name(stem: &str, today: NaiveDate) -> String {
    let base = sanitize(stem);
    let base = if base.is_empty() { "document".to_string() } else { base };
    format!("{base}_{}", today.format("%Y-%m-%d"))
}

/// First free `<dir>/<marker><name>.pdf`, adding `_2`, `_3`... on collision.
pub fn free_target(dir: &Path, marker: &str, name: &str) -> Option<PathBuf> {
    let first = dir.join(format!("{marker}{name}.pdf"));
    if !first.exists() {
        return Some(first);
    }
    (2..100)
        .map(|n| dir.join(format!("{marker}{name}_{n}.pdf")))
        .find(|candidate| !candidate.exists())
}

/// Asks the model for a file name for the PDF in `bytes`.
pub async fn propose_name<M: MessageSender>(
    sender: &M,
    model: &str,
    max_tokens: u32,
    bytes: &[u8],
) -> Result<String, AnthropicError> {
    let req = MessagesRequest {
        model: model.to_string(),
        max_tokens: max_tokens.min(256),
        system: None,
        messages: vec![Message::user(vec![
            ContentPart::pdf(bytes),
            ContentPart::text(NAMING_PROMPT),
        ])],
    };
    let name = sanitize(&sender.send_message(&req).await?.text());
    if name.is_empty() {
        return Err(AnthropicError::EmptyResponse);
    }
    Ok(name)
}
