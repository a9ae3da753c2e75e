//! Structure-aware text splitter.
//!
//! [`ChunkSplitter::split`] tries a sequence of rules and keeps the first one
//! that produces at least two chunks:
//!
//! 1. Markdown headings (`# Title`).
//! 2. Numeric outlines (`1.`, `2.3`, `1.2.3 Title`).
//! 3. Localized section markers (`第一章`, `第3節`, `Chapter 4`, `Part II`).
//! 4. Paragraph accumulation under the `chunk_size` budget, accepted only
//!    when every chunk is at least [`MIN_PARAGRAPH_CHUNK`] characters.
//! 5. Recursive fixed-window splitting with overlap.
//!
//! With intelligent splitting off only rule 5 runs. All lengths are counted
//! in characters, not bytes.

use anyhow::Result;
use regex::Regex;
use std::collections::VecDeque;

use crate::models::Page;
use crate::settings::Settings;

/// Floor for every chunk produced by paragraph accumulation.
pub const MIN_PARAGRAPH_CHUNK: usize = 100;

/// Break points for the fixed-window splitter, most preferred first. Each
/// separator stays at the end of the piece it terminates.
const SEPARATORS: &[&str] = &[
    "\n\n", "\n", "。", "！", "？", "；", ". ", "! ", "? ", "，", " ", "",
];

const HEADING_PATTERN: &str = r"(?m)^[ \t]*#+[ \t]+\S";
const OUTLINE_PATTERN: &str = r"(?m)^[ \t]*(?:\d+\.)+\d*[ \t]+\S";
const LOCALIZED_PATTERN: &str = r"(?m)^[ \t]*(?:第[0-9一二三四五六七八九十百千零〇两]+(?:章|節|节|部分|篇)|(?:Chapter|CHAPTER|Part|PART|Section|SECTION)[ \t]+(?:\d+|[IVXLC]+)\b)";

pub struct ChunkSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    intelligent: bool,
    markers: Vec<Regex>,
    paragraph_break: Regex,
}

impl ChunkSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize, intelligent: bool) -> Result<Self> {
        anyhow::ensure!(chunk_size > 0, "chunk_size must be > 0");
        anyhow::ensure!(chunk_overlap < chunk_size, "chunk_overlap must be < chunk_size");
        Ok(Self {
            chunk_size,
            chunk_overlap,
            intelligent,
            markers: vec![
                Regex::new(HEADING_PATTERN)?,
                Regex::new(OUTLINE_PATTERN)?,
                Regex::new(LOCALIZED_PATTERN)?,
            ],
            paragraph_break: Regex::new(r"\n[ \t]*\n")?,
        })
    }

    /// Splitter for one processing run, built from the current snapshot.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(
            settings.chunk_size,
            settings.chunk_overlap,
            settings.use_intelligent_splitting,
        )
    }

    pub fn is_intelligent(&self) -> bool {
        self.intelligent
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        if !self.intelligent {
            return self.split_fixed(text);
        }

        for marker in &self.markers {
            let sections = split_at_markers(text, marker);
            if sections.len() >= 2 {
                return sections;
            }
        }

        let paragraphs = self.accumulate(text);
        if paragraphs.len() >= 2
            && paragraphs
                .iter()
                .all(|c| char_len(c) >= MIN_PARAGRAPH_CHUNK)
        {
            return paragraphs;
        }

        self.split_fixed(text)
    }

    /// Rule 4 on its own: greedy paragraph accumulation under `chunk_size`.
    pub fn accumulate(&self, text: &str) -> Vec<String> {
        accumulate_paragraphs(&self.paragraph_break, text, self.chunk_size)
    }

    /// Rule 5 on its own: recursive fixed-window split with overlap.
    pub fn split_fixed(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        self.split_recursive(text, SEPARATORS, &mut chunks);
        chunks
    }

    fn split_recursive(&self, text: &str, separators: &[&str], out: &mut Vec<String>) {
        let (position, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(**s))
            .map(|(i, s)| (i, *s))
            .unwrap_or((separators.len(), ""));
        let finer = separators.get(position + 1..).unwrap_or(&[]);

        let mut small: Vec<&str> = Vec::new();
        for piece in split_keep_separator(text, separator) {
            if char_len(piece) < self.chunk_size {
                small.push(piece);
                continue;
            }
            if !small.is_empty() {
                self.merge(&small, out);
                small.clear();
            }
            if finer.is_empty() {
                push_trimmed(out, piece);
            } else {
                self.split_recursive(piece, finer, out);
            }
        }
        if !small.is_empty() {
            self.merge(&small, out);
        }
    }

    /// Pack small pieces into windows of at most `chunk_size`, carrying up to
    /// `chunk_overlap` characters of trailing pieces into the next window.
    fn merge(&self, pieces: &[&str], out: &mut Vec<String>) {
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);
            if total + len > self.chunk_size && !window.is_empty() {
                push_trimmed(out, &join_window(&window));
                while total > self.chunk_overlap
                    || (total + len > self.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }
            window.push_back((piece, len));
            total += len;
        }
        push_trimmed(out, &join_window(&window));
    }
}

/// Cut `text` at every line matched by `marker`. A non-blank preamble
/// before the first marker becomes its own section.
pub fn split_at_markers(text: &str, marker: &Regex) -> Vec<String> {
    let mut starts: Vec<usize> = marker.find_iter(text).map(|m| m.start()).collect();
    if starts.is_empty() {
        return Vec::new();
    }
    if starts[0] != 0 {
        starts.insert(0, 0);
    }
    starts.push(text.len());

    starts
        .windows(2)
        .map(|w| text[w[0]..w[1]].trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Greedily join blank-line separated paragraphs while
/// `current + next < chunk_size`.
pub fn accumulate_paragraphs(paragraph_break: &Regex, text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for para in paragraph_break.split(text) {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        let para_len = char_len(para);
        if current_len + para_len < chunk_size {
            if !current.is_empty() {
                current.push_str("\n\n");
                current_len += 2;
            }
            current.push_str(para);
            current_len += para_len;
        } else {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            current.push_str(para);
            current_len = para_len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Normalize loader output while keeping line structure: runs of spaces and
/// tabs collapse to one space, lines are trimmed, and consecutive blank
/// lines collapse to one.
pub fn clean_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut blank_pending = false;

    for line in raw.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            blank_pending = !out.is_empty();
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_pending { "\n\n" } else { "\n" });
        }
        out.push_str(&line);
        blank_pending = false;
    }
    out
}

/// Concatenated page text with the offset at which each page begins.
pub struct PageMap {
    text: String,
    starts: Vec<(usize, i64)>,
}

impl PageMap {
    /// Join non-empty pages with blank lines.
    pub fn new(pages: &[Page]) -> Self {
        let mut text = String::new();
        let mut starts = Vec::new();
        for page in pages.iter().filter(|p| !p.text.is_empty()) {
            if !text.is_empty() {
                text.push_str("\n\n");
            }
            starts.push((text.len(), page.number));
            text.push_str(&page.text);
        }
        Self { text, starts }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn page_at(&self, offset: usize) -> i64 {
        let idx = self.starts.partition_point(|(start, _)| *start <= offset);
        idx.checked_sub(1)
            .and_then(|i| self.starts.get(i))
            .map(|(_, page)| *page)
            .unwrap_or(0)
    }

    /// Page for each chunk, found by locating chunks in order. Chunks that
    /// cannot be located inherit the previous chunk's page.
    pub fn pages_for(&self, chunks: &[String]) -> Vec<i64> {
        let mut cursor = 0usize;
        let mut last = self.starts.first().map(|(_, p)| *p).unwrap_or(0);
        let mut pages = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let found = self.text[cursor..]
                .find(chunk.as_str())
                .map(|pos| cursor + pos)
                .or_else(|| self.text.find(chunk.as_str()));
            if let Some(offset) = found {
                last = self.page_at(offset);
                // step one character so overlapping windows are still found
                cursor = offset
                    + self.text[offset..]
                        .chars()
                        .next()
                        .map(char::len_utf8)
                        .unwrap_or(0);
            }
            pages.push(last);
        }
        pages
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn split_keep_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }
    text.split_inclusive(separator)
        .filter(|s| !s.is_empty())
        .collect()
}

fn join_window(window: &VecDeque<(&str, usize)>) -> String {
    window.iter().map(|(piece, _)| *piece).collect()
}

fn push_trimmed(out: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter(size: usize, overlap: usize) -> ChunkSplitter {
        ChunkSplitter::new(size, overlap, true).unwrap()
    }

    fn para(c: char, n: usize) -> String {
        std::iter::repeat(c).take(n).collect()
    }

    fn squash(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(splitter(1000, 200).split("").is_empty());
        assert!(splitter(1000, 200).split("  \n\n ").is_empty());
    }

    #[test]
    fn test_short_unstructured_text_is_one_chunk() {
        let chunks = splitter(1000, 200).split("Just a short note without structure.");
        assert_eq!(chunks, vec!["Just a short note without structure."]);
    }

    #[test]
    fn test_markdown_headings_keep_body_with_heading() {
        let text = "Intro line\n# One\nalpha\n## Two\nbeta\n# Three\ngamma";
        let chunks = splitter(1000, 200).split(text);
        assert_eq!(
            chunks,
            vec!["Intro line", "# One\nalpha", "## Two\nbeta", "# Three\ngamma"]
        );
    }

    #[test]
    fn test_single_heading_falls_through() {
        // one heading and no preamble gives one section, so rule 1 does not win
        let text = "# Only\nbody";
        assert_eq!(splitter(1000, 200).split(text), vec!["# Only\nbody"]);
    }

    #[test]
    fn test_numeric_outline_sections() {
        let text = "1. Scope\nwhat we do\n1.1 Detail\nmore\n2. Usage\nhow";
        let chunks = splitter(1000, 200).split(text);
        assert_eq!(
            chunks,
            vec!["1. Scope\nwhat we do", "1.1 Detail\nmore", "2. Usage\nhow"]
        );
    }

    #[test]
    fn test_localized_markers() {
        let text = "第一章 總則\n內容一\n第二章 細則\n內容二";
        let chunks = splitter(1000, 200).split(text);
        assert_eq!(chunks, vec!["第一章 總則\n內容一", "第二章 細則\n內容二"]);

        let text = "Chapter 1\nIt begins.\nChapter 2\nIt ends.";
        assert_eq!(splitter(1000, 200).split(text).len(), 2);
    }

    #[test]
    fn test_paragraph_accumulation_40_40_40() {
        let text = format!("{}\n\n{}\n\n{}", para('a', 40), para('b', 40), para('c', 40));
        let s = splitter(100, 20);
        let chunks = s.accumulate(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n\n{}", para('a', 40), para('b', 40)));
        assert_eq!(chunks[1], para('c', 40));
    }

    #[test]
    fn test_paragraph_accumulation_accepted_when_above_floor() {
        let text = format!("{}\n\n{}\n\n{}", para('a', 150), para('b', 150), para('c', 150));
        let chunks = splitter(400, 50).split(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], para('c', 150));
    }

    #[test]
    fn test_short_paragraphs_fall_back_to_fixed_window() {
        // rule 4 would give chunks under the floor, so rule 5 decides
        let text = format!("{}\n\n{}\n\n{}", para('a', 40), para('b', 40), para('c', 40));
        let chunks = splitter(100, 20).split(&text);
        assert_eq!(chunks, splitter(100, 20).split_fixed(&text));
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
    }

    #[test]
    fn test_fixed_window_respects_size_and_overlap() {
        let words: Vec<String> = (0..200).map(|i| format!("w{:03}", i)).collect();
        let text = words.join(" ");
        let chunks = ChunkSplitter::new(50, 10, false).unwrap().split(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        // the second window opens with words carried over from the first
        assert!(chunks[0].ends_with("w008 w009"));
        assert!(chunks[1].starts_with("w008 w009 w010"));
    }

    #[test]
    fn test_fixed_window_prefers_cjk_sentence_ends() {
        let text = "第一句話。第二句話。第三句話。";
        let chunks = ChunkSplitter::new(6, 0, false).unwrap().split(text);
        assert_eq!(chunks, vec!["第一句話。", "第二句話。", "第三句話。"]);
    }

    #[test]
    fn test_split_is_measured_in_characters() {
        let text = para('字', 30);
        let chunks = ChunkSplitter::new(10, 0, false).unwrap().split(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() == 10));
    }

    #[test]
    fn test_structural_rules_cover_all_content() {
        let text = "Preface\n\n# A\nalpha beta\n\n# B\ngamma\n\n## C\ndelta epsilon";
        let chunks = splitter(1000, 200).split(text);
        assert_eq!(squash(&chunks.concat()), squash(text));
    }

    #[test]
    fn test_fixed_window_covers_all_content() {
        let text = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
                    Sed do eiusmod tempor incididunt ut labore et dolore magna aliqua.\n\
                    Ut enim ad minim veniam, quis nostrud exercitation ullamco.";
        let chunks = ChunkSplitter::new(40, 0, false).unwrap().split(text);
        assert_eq!(squash(&chunks.concat()), squash(text));
    }

    #[test]
    fn test_clean_text_keeps_structure() {
        let raw = "  # Title  \n\n\n\tsome   spaced\ttext \n\n\n\nnext   para  ";
        assert_eq!(clean_text(raw), "# Title\n\nsome spaced text\n\nnext para");
        assert_eq!(clean_text(" \n \t \n"), "");
    }

    #[test]
    fn test_page_map_locates_chunks() {
        let pages = vec![
            Page { number: 0, text: "first page text".into() },
            Page { number: 1, text: "second page text".into() },
            Page { number: 2, text: String::new() },
            Page { number: 3, text: "fourth page".into() },
        ];
        let map = PageMap::new(&pages);
        assert_eq!(map.text(), "first page text\n\nsecond page text\n\nfourth page");
        let chunks = vec![
            "first page".to_string(),
            "text\n\nsecond".to_string(),
            "page text".to_string(),
            "unlocatable".to_string(),
            "fourth".to_string(),
        ];
        assert_eq!(map.pages_for(&chunks), vec![0, 0, 1, 1, 3]);
    }
}
