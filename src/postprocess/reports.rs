use std::path::{Path, PathBuf};

use crate::anthropic::{
    AnthropicError, ContentPart, Message, MessageSender, MessagesRequest,
};

const REPORT_SYSTEM: &str = "You are an analyst specialised in water utility bills.";

const REPORT_PROMPT: &str = "\
Extract and organise the following information from the attached bill.
Leave a field blank when the bill does not show it.

IDENTIFICATION:
- Property / building:
- Address:
- Customer code:

CURRENT BILL:
- Issue date:
- Reference period:
- Due date:

CONSUMPTION:
- Previous reading:
- Current reading:
- Total consumption:
- Average daily consumption:

AMOUNTS:
- Water:
- Sewage:
- TOTAL:

NOTES:
- Consumption analysis and alerts, if any.";

/// `<reports_dir>/<stem>_report.txt`
pub fn report_path(reports_dir: &Path, document: &Path) -> PathBuf {
    let stem = document
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    reports_dir.join(format!("{stem}_report.txt"))
}

/// Asks the summarizer for a structured report of the PDF in `bytes`.
pub async fn summarize<M: MessageSender>(
    sender: &M,
    model: &str,
    max_tokens: u32,
    bytes: &[u8],
) -> Result<String, AnthropicError> {
    let req = MessagesRequest {
        model: model.to_string(),
        max_tokens,
        system: Some(REPORT_SYSTEM.to_string()),
        messages: vec![Message::user(vec![
            ContentPart::pdf(bytes),
            ContentPart::text(REPORT_PROMPT),
        ])],
    };
    let text = sender.send_message(&req).await?.text();
    if text.trim().is_empty() {
        return Err(AnthropicError::EmptyResponse);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_path_uses_document_stem() {
        let path = report_path(
            Path::new("/data/reports"),
            Path::new("/data/downloads/ACQ_EDIFICIO_CENTRAL_07-2023.pdf"),
        );
        assert_eq!(
            path,
            PathBuf::from("/data/reports/ACQ_EDIFICIO_CENTRAL_07-2023_report.txt")
        );
    }
}
