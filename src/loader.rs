//! Document loaders: turn a file on disk into text pages.
//!
//! The loader is chosen from the file extension by [`FileKind::from_path`];
//! unsupported extensions are rejected before any bytes are read.
//!
//! | extension | loader | pages |
//! |---|---|---|
//! | `pdf` | pdf-extract | split on form feed |
//! | `txt`, `md` | UTF-8 (lossy) | one |
//! | `docx` | `word/document.xml` `w:t` runs | one |
//! | `csv` | one `header: value` block per record | one per record |
//! | `html`, `htm` | body text, scripts and styles skipped | one |
//!
//! All loaders are synchronous; the pipeline runs them on the blocking pool.

use std::io::Read;
use std::path::Path;

use crate::error::LoadError;
use crate::models::Page;

/// Maximum decompressed bytes read from `word/document.xml` (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Text,
    Docx,
    Csv,
    Html,
}

impl FileKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileKind::Pdf),
            "txt" | "md" => Some(FileKind::Text),
            "docx" => Some(FileKind::Docx),
            "csv" => Some(FileKind::Csv),
            "html" | "htm" => Some(FileKind::Html),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, LoadError> {
        let ext = file_extension(path);
        Self::from_extension(&ext).ok_or(LoadError::Unsupported(ext))
    }

    pub fn label(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Text => "text",
            FileKind::Docx => "docx",
            FileKind::Csv => "csv",
            FileKind::Html => "html",
        }
    }
}

/// Lower-cased extension without the dot; empty when there is none.
pub fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn load_document(path: &Path) -> Result<Vec<Page>, LoadError> {
    let kind = FileKind::from_path(path)?;
    let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    load_bytes(kind, &bytes)
}

pub fn load_bytes(kind: FileKind, bytes: &[u8]) -> Result<Vec<Page>, LoadError> {
    match kind {
        FileKind::Pdf => load_pdf(bytes),
        FileKind::Text => Ok(single_page(String::from_utf8_lossy(bytes).into_owned())),
        FileKind::Docx => load_docx(bytes).map(single_page),
        FileKind::Csv => load_csv(bytes),
        FileKind::Html => Ok(single_page(html_body_text(&String::from_utf8_lossy(bytes)))),
    }
}

fn single_page(text: String) -> Vec<Page> {
    vec![Page { number: 0, text }]
}

fn parse_error(kind: FileKind, message: impl ToString) -> LoadError {
    LoadError::Parse {
        kind: kind.label(),
        message: message.to_string(),
    }
}

fn load_pdf(bytes: &[u8]) -> Result<Vec<Page>, LoadError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| parse_error(FileKind::Pdf, e))?;
    Ok(text
        .split('\u{000C}')
        .enumerate()
        .map(|(i, page)| Page {
            number: i as i64,
            text: page.to_string(),
        })
        .filter(|p| !p.text.trim().is_empty())
        .collect())
}

fn load_docx(bytes: &[u8]) -> Result<String, LoadError> {
    let err = |e: &dyn std::fmt::Display| parse_error(FileKind::Docx, e);

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| err(&e))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| err(&"word/document.xml not found"))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| err(&e))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(err(&"word/document.xml exceeds size limit"));
    }
    docx_paragraphs(&xml)
}

/// Collect `w:t` runs, one paragraph per `w:p`, separated by blank lines.
fn docx_paragraphs(xml: &[u8]) -> Result<String, LoadError> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut paragraph = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = paragraph.trim();
                    if !text.is_empty() {
                        if !out.is_empty() {
                            out.push_str("\n\n");
                        }
                        out.push_str(text);
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => paragraph.push('\t'),
                b"br" => paragraph.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| parse_error(FileKind::Docx, e))?;
                paragraph.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(parse_error(FileKind::Docx, e)),
            _ => {}
        }
        buf.clear();
    }

    if !paragraph.trim().is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(paragraph.trim());
    }
    Ok(out)
}

fn load_csv(bytes: &[u8]) -> Result<Vec<Page>, LoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|e| parse_error(FileKind::Csv, e))?
        .clone();

    let mut pages = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| parse_error(FileKind::Csv, e))?;
        let lines: Vec<String> = record
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let header = headers.get(i).unwrap_or("");
                format!("{}: {}", header.trim(), value.trim())
            })
            .collect();
        pages.push(Page {
            number: row as i64,
            text: lines.join("\n"),
        });
    }
    Ok(pages)
}

/// Visible text of the document body, one line per text node.
fn html_body_text(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let root = match scraper::Selector::parse("body") {
        Ok(selector) => document.select(&selector).next(),
        Err(_) => None,
    };
    let root = root.unwrap_or_else(|| document.root_element());

    let mut lines = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style" | "noscript"))
        });
        let text = text.trim();
        if !hidden && !text.is_empty() {
            lines.push(text.to_string());
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_paragraphs(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t xml:space=\"preserve\">{}</w:t></w:r></w:p>", p))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body>{}</w:body></w:document>",
            body
        );
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(FileKind::from_path(Path::new("a/b.PDF")).unwrap(), FileKind::Pdf);
        assert_eq!(FileKind::from_path(Path::new("notes.md")).unwrap(), FileKind::Text);
        assert_eq!(FileKind::from_path(Path::new("page.htm")).unwrap(), FileKind::Html);
        assert!(matches!(
            FileKind::from_path(Path::new("slides.pptx")),
            Err(LoadError::Unsupported(ext)) if ext == "pptx"
        ));
        assert!(matches!(
            FileKind::from_path(Path::new("Makefile")),
            Err(LoadError::Unsupported(ext)) if ext.is_empty()
        ));
    }

    #[test]
    fn test_unsupported_file_is_rejected_before_reading() {
        // The file does not exist: rejection must come from the extension alone.
        let err = load_document(Path::new("/nonexistent/archive.tar")).unwrap_err();
        assert!(matches!(err, LoadError::Unsupported(_)));
    }

    #[test]
    fn test_text_file_is_one_page() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, "first line\n\nsecond").unwrap();
        let pages = load_document(&path).unwrap();
        assert_eq!(pages, vec![Page { number: 0, text: "first line\n\nsecond".into() }]);
    }

    #[test]
    fn test_docx_paragraphs_become_blank_line_separated() {
        let bytes = docx_with_paragraphs(&["Hello world", " second &amp; last"]);
        let pages = load_bytes(FileKind::Docx, &bytes).unwrap();
        assert_eq!(pages[0].text, "Hello world\n\nsecond & last");
    }

    #[test]
    fn test_invalid_docx_is_parse_error() {
        let err = load_bytes(FileKind::Docx, b"not a zip").unwrap_err();
        assert!(matches!(err, LoadError::Parse { kind: "docx", .. }));
    }

    #[test]
    fn test_invalid_pdf_is_parse_error() {
        let err = load_bytes(FileKind::Pdf, b"not a pdf").unwrap_err();
        assert!(matches!(err, LoadError::Parse { kind: "pdf", .. }));
    }

    #[test]
    fn test_csv_one_page_per_record() {
        let pages = load_bytes(FileKind::Csv, b"name,role\nAda,engineer\nGrace,admiral\n").unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].text, "name: Ada\nrole: engineer");
        assert_eq!(pages[1].number, 1);
        assert_eq!(pages[1].text, "name: Grace\nrole: admiral");
    }

    #[test]
    fn test_html_body_text_skips_scripts() {
        let html = "<html><head><title>T</title><style>p{}</style></head>\
                    <body><h1>Title</h1><script>var x = 1;</script><p>Body text</p></body></html>";
        let pages = load_bytes(FileKind::Html, html.as_bytes()).unwrap();
        assert_eq!(pages[0].text, "Title\nBody text");
    }
}
