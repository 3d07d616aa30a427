use dom_smoothie::{Readability, TextMode};
use mime::Mime;
use tracing::debug;

use common::{error::AppError, utils::text::normalize_text};

/// One page of normalized extracted text. Single-page formats report page 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedPage {
    pub page: u32,
    pub text: String,
}

/// Decodes an uploaded binary into page-tagged, normalized text.
///
/// Dispatch is on the declared MIME type, falling back to a guess from the
/// file name. Extraction never makes external calls. Producing no text at
/// all is a `CorruptInput` failure.
pub fn extract(blob: &[u8], declared_type: &str, name: &str) -> Result<Vec<ExtractedPage>, AppError> {
    let mime = resolve_mime(declared_type, name)?;

    let pages = match (mime.type_(), mime.subtype().as_str()) {
        (mime::TEXT, "plain") | (mime::TEXT, "markdown") => vec![ExtractedPage {
            page: 1,
            text: decode_utf8(blob)?,
        }],
        (mime::TEXT, "html") => vec![ExtractedPage {
            page: 1,
            text: extract_html(blob)?,
        }],
        (mime::APPLICATION, "pdf") => extract_pdf(blob)?,
        _ => {
            return Err(AppError::UnsupportedFormat(mime.essence_str().to_owned()));
        }
    };

    let normalized: Vec<ExtractedPage> = pages
        .into_iter()
        .map(|page| ExtractedPage {
            page: page.page,
            text: normalize_text(&page.text),
        })
        .filter(|page| !page.text.is_empty())
        .collect();

    if normalized.is_empty() {
        return Err(AppError::CorruptInput("document contains no text".into()));
    }

    debug!(pages = normalized.len(), mime = %mime, "extracted document");
    Ok(normalized)
}

fn resolve_mime(declared_type: &str, name: &str) -> Result<Mime, AppError> {
    if let Ok(mime) = declared_type.parse::<Mime>() {
        return Ok(mime);
    }
    mime_guess::from_path(name)
        .first()
        .ok_or_else(|| AppError::UnsupportedFormat(format!("undeclared type for '{name}'")))
}

fn decode_utf8(blob: &[u8]) -> Result<String, AppError> {
    String::from_utf8(blob.to_vec())
        .map_err(|_| AppError::CorruptInput("text is not valid UTF-8".into()))
}

fn extract_html(blob: &[u8]) -> Result<String, AppError> {
    let html = decode_utf8(blob)?;
    let config = dom_smoothie::Config {
        text_mode: TextMode::Markdown,
        ..Default::default()
    };
    let mut readability = Readability::new(html, None, Some(config))
        .map_err(|e| AppError::CorruptInput(format!("unreadable html: {e}")))?;
    let article = readability
        .parse()
        .map_err(|e| AppError::CorruptInput(format!("unreadable html: {e}")))?;
    Ok(article.text_content.to_string())
}

fn extract_pdf(blob: &[u8]) -> Result<Vec<ExtractedPage>, AppError> {
    let document = lopdf::Document::load_mem(blob)
        .map_err(|e| AppError::CorruptInput(format!("unreadable pdf: {e}")))?;

    let mut pages = Vec::new();
    for (page_number, _object_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_number])
            .map_err(|e| AppError::CorruptInput(format!("pdf page {page_number}: {e}")))?;
        pages.push(ExtractedPage {
            page: page_number,
            text,
        });
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_a_single_page() {
        let pages = extract(b"hello  world", "text/plain", "note.txt").expect("extract");
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page, 1);
        assert_eq!(pages[0].text, "hello world");
    }

    #[test]
    fn markdown_passes_through_normalized() {
        let pages = extract(b"# Title\n\nBody   text", "text/markdown", "doc.md").expect("extract");
        assert_eq!(pages[0].text, "# Title\nBody text");
    }

    #[test]
    fn empty_document_is_corrupt_input() {
        let result = extract(b"   \n\t  ", "text/plain", "blank.txt");
        assert!(matches!(result, Err(AppError::CorruptInput(_))));
    }

    #[test]
    fn invalid_utf8_is_corrupt_input() {
        let result = extract(&[0xff, 0xfe, 0x41], "text/plain", "bad.txt");
        assert!(matches!(result, Err(AppError::CorruptInput(_))));
    }

    #[test]
    fn unknown_mime_is_unsupported() {
        let result = extract(b"data", "application/octet-stream", "blob.bin");
        assert!(matches!(result, Err(AppError::UnsupportedFormat(_))));
    }

    #[test]
    fn extension_fallback_kicks_in_for_blank_declared_type() {
        let pages = extract(b"from extension", "", "readme.txt").expect("extract");
        assert_eq!(pages[0].text, "from extension");
    }

    #[test]
    fn garbage_pdf_is_corrupt_input() {
        let result = extract(b"not a pdf at all", "application/pdf", "fake.pdf");
        assert!(matches!(result, Err(AppError::CorruptInput(_))));
    }

    #[test]
    fn html_is_reduced_to_readable_text() {
        let paragraph = "This paragraph carries enough plain prose for the \
            readability pass to treat it as real article content. It keeps \
            going with several sentences describing schedulers, queues and \
            fairness budgets in unremarkable detail. ";
        let body = paragraph.repeat(6);
        let html = format!(
            "<html><head><title>T</title></head><body><article>\
             <h1>Heading</h1><p>First paragraph marker. {body}</p>\
             <p>{body}</p></article></body></html>"
        );

        let pages = extract(html.as_bytes(), "text/html", "page.html").expect("extract");
        assert_eq!(pages.len(), 1);
        assert!(pages[0].text.contains("First paragraph marker"));
    }
}
