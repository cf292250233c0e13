//! Deterministic section parsing and text chunking.
//!
//! Splits a raw document into a section tree and a flat chunk sequence.
//! Three header forms are recognized:
//!
//! 1. ATX: a leading run of 1–6 `#` plus a space plus non-empty text;
//!    nesting depth is the `#` count.
//! 2. Setext: a non-blank line immediately followed by a line of 3+ `=`
//!    (depth 1) or `-` (depth 2) characters.
//! 3. Standalone title: a trimmed line of ≤80 chars in title case,
//!    followed by a blank line; depth 1.
//!
//! Chunks target 700–1200 characters, split on paragraph boundaries where
//! possible and never inside a sentence when avoidable. Chunk indices are
//! zero-based and strictly monotonic across the whole document, so a
//! chunk's identity `(doc_id, chunk_index)` is stable for identical input.

/// Lower bound before a chunk is considered full enough to flush early.
pub const CHUNK_TARGET_MIN: usize = 700;
/// Hard ceiling; longer paragraphs are split at sentence boundaries.
pub const CHUNK_TARGET_MAX: usize = 1200;

/// One section of the parsed document.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionOutline {
    /// Slash-joined slug path, unique within the document.
    pub path: String,
    pub depth: usize,
    pub title: String,
    /// First chunk index belonging to this section.
    pub chunk_start: usize,
    /// One past the last chunk index (exclusive).
    pub chunk_end: usize,
}

/// One chunk of section body text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub index: usize,
    pub text: String,
    pub section_path: String,
}

/// Full parse result: section list plus the document-ordered chunk list.
#[derive(Debug, Clone, Default)]
pub struct DocumentOutline {
    pub sections: Vec<SectionOutline>,
    pub chunks: Vec<ChunkPiece>,
}

struct RawSection {
    title: String,
    depth: usize,
    body: Vec<String>,
}

/// Parse a document into sections and chunks. Pure and deterministic:
/// identical input always yields identical output.
pub fn parse_document(text: &str) -> DocumentOutline {
    let raw_sections = split_sections(text);

    let mut outline = DocumentOutline::default();
    let mut path_stack: Vec<(usize, String)> = Vec::new();
    let mut used_paths: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut next_index = 0usize;

    for section in raw_sections {
        while path_stack
            .last()
            .map(|(d, _)| *d >= section.depth)
            .unwrap_or(false)
        {
            path_stack.pop();
        }
        let slug = slugify(&section.title);
        let base_path = if path_stack.is_empty() {
            slug
        } else {
            let parents: Vec<&str> = path_stack.iter().map(|(_, s)| s.as_str()).collect();
            format!("{}/{}", parents.join("/"), slug)
        };
        let mut path = base_path.clone();
        let mut n = 2;
        while !used_paths.insert(path.clone()) {
            path = format!("{}-{}", base_path, n);
            n += 1;
        }
        path_stack.push((section.depth, path.rsplit('/').next().unwrap_or(&path).to_string()));

        let body = section.body.join("\n");
        let chunk_start = next_index;
        for piece in chunk_section(&body) {
            outline.chunks.push(ChunkPiece {
                index: next_index,
                text: piece,
                section_path: path.clone(),
            });
            next_index += 1;
        }
        outline.sections.push(SectionOutline {
            path,
            depth: section.depth,
            title: section.title,
            chunk_start,
            chunk_end: next_index,
        });
    }

    // Drop sections that produced no chunks and no children (pure header
    // noise), but keep parents of chunked subsections.
    let non_empty: Vec<SectionOutline> = outline
        .sections
        .iter()
        .filter(|s| {
            s.chunk_end > s.chunk_start
                || outline
                    .sections
                    .iter()
                    .any(|o| o.depth > s.depth && o.path.starts_with(&format!("{}/", s.path)))
        })
        .cloned()
        .collect();
    outline.sections = non_empty;

    outline
}

fn split_sections(text: &str) -> Vec<RawSection> {
    let lines: Vec<&str> = text.lines().collect();
    let mut sections: Vec<RawSection> = Vec::new();
    let mut current = RawSection {
        title: "Root".to_string(),
        depth: 1,
        body: Vec::new(),
    };

    let flush = |sections: &mut Vec<RawSection>, current: &mut RawSection| {
        let has_body = current.body.iter().any(|l| !l.trim().is_empty());
        if has_body || current.title != "Root" {
            sections.push(RawSection {
                title: std::mem::take(&mut current.title),
                depth: current.depth,
                body: std::mem::take(&mut current.body),
            });
        } else {
            current.body.clear();
        }
    };

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if let Some((depth, title)) = atx_header(line) {
            flush(&mut sections, &mut current);
            current = RawSection {
                title,
                depth,
                body: Vec::new(),
            };
            i += 1;
            continue;
        }
        if i + 1 < lines.len() {
            if let Some(depth) = setext_underline(lines[i + 1]) {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    flush(&mut sections, &mut current);
                    current = RawSection {
                        title: trimmed.to_string(),
                        depth,
                        body: Vec::new(),
                    };
                    i += 2;
                    continue;
                }
            }
        }
        if is_title_case_header(line)
            && lines.get(i + 1).map(|l| l.trim().is_empty()).unwrap_or(true)
        {
            flush(&mut sections, &mut current);
            current = RawSection {
                title: line.trim().to_string(),
                depth: 1,
                body: Vec::new(),
            };
            i += 1;
            continue;
        }
        current.body.push(line.to_string());
        i += 1;
    }
    flush(&mut sections, &mut current);

    if sections.is_empty() && !text.trim().is_empty() {
        sections.push(RawSection {
            title: "Root".to_string(),
            depth: 1,
            body: text.lines().map(|l| l.to_string()).collect(),
        });
    }
    sections
}

fn atx_header(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        return None;
    }
    Some((hashes, title.to_string()))
}

fn setext_underline(line: &str) -> Option<usize> {
    let trimmed = line.trim();
    if trimmed.len() < 3 {
        return None;
    }
    if trimmed.chars().all(|c| c == '=') {
        return Some(1);
    }
    if trimmed.chars().all(|c| c == '-') {
        return Some(2);
    }
    None
}

/// Small connective words allowed in lowercase within a title.
const TITLE_STOPWORDS: &[&str] = &[
    "a", "an", "and", "as", "at", "by", "for", "in", "of", "on", "or", "the", "to", "with",
];

fn is_title_case_header(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.len() > 80 {
        return false;
    }
    if trimmed.ends_with(['.', ':', ';', ',', '!', '?']) {
        return false;
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.is_empty() || words.len() > 8 {
        return false;
    }
    let mut capitalized = 0;
    for (i, word) in words.iter().enumerate() {
        let first = match word.chars().next() {
            Some(c) => c,
            None => return false,
        };
        if first.is_uppercase() {
            capitalized += 1;
        } else if i == 0 || !TITLE_STOPWORDS.contains(&word.to_lowercase().as_str()) {
            return false;
        }
    }
    capitalized >= 1
}

fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        "section".to_string()
    } else {
        out
    }
}

/// Split one section body into chunks of `CHUNK_TARGET_MIN..=CHUNK_TARGET_MAX`
/// characters, preferring paragraph boundaries and never breaking inside a
/// sentence when avoidable.
fn chunk_section(body: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for para in body.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len()
        };

        if would_be > CHUNK_TARGET_MAX && !buf.is_empty() {
            chunks.push(std::mem::take(&mut buf));
        }

        if para.len() > CHUNK_TARGET_MAX {
            if !buf.is_empty() {
                chunks.push(std::mem::take(&mut buf));
            }
            pack_sentences(para, &mut chunks, &mut buf);
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(para);
            if buf.len() >= CHUNK_TARGET_MIN && buf.len() <= CHUNK_TARGET_MAX {
                // Full enough; flushing here keeps chunks near the target
                // instead of always riding the ceiling.
                chunks.push(std::mem::take(&mut buf));
            }
        }
    }

    if !buf.trim().is_empty() {
        chunks.push(buf);
    }
    chunks
}

/// Pack an oversized paragraph sentence-by-sentence; a single sentence
/// longer than the ceiling is hard-split at a space boundary.
fn pack_sentences(para: &str, chunks: &mut Vec<String>, buf: &mut String) {
    for sentence in split_sentences(para) {
        if sentence.len() > CHUNK_TARGET_MAX {
            if !buf.is_empty() {
                chunks.push(std::mem::take(buf));
            }
            let mut rest = sentence;
            while rest.len() > CHUNK_TARGET_MAX {
                let cut = rest[..CHUNK_TARGET_MAX]
                    .rfind(' ')
                    .map(|p| p + 1)
                    .unwrap_or(CHUNK_TARGET_MAX);
                chunks.push(rest[..cut].trim().to_string());
                rest = &rest[cut..];
            }
            if !rest.trim().is_empty() {
                buf.push_str(rest.trim());
            }
            continue;
        }
        let would_be = if buf.is_empty() {
            sentence.len()
        } else {
            buf.len() + 1 + sentence.len()
        };
        if would_be > CHUNK_TARGET_MAX && !buf.is_empty() {
            chunks.push(std::mem::take(buf));
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(sentence);
    }
}

/// Split text into sentences at `. `, `! `, `? ` boundaries, keeping the
/// terminator with the sentence.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if (c == b'.' || c == b'!' || c == b'?')
            && bytes.get(i + 1).map(|b| b.is_ascii_whitespace()).unwrap_or(true)
        {
            let sentence = text[start..=i].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = i + 1;
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn para(n: usize, word: &str) -> String {
        std::iter::repeat(word).take(n).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_empty_text() {
        let outline = parse_document("");
        assert!(outline.chunks.is_empty());
        assert!(outline.sections.is_empty());
    }

    #[test]
    fn test_small_text_single_chunk_under_root() {
        let outline = parse_document("Hello, world. Short note.");
        assert_eq!(outline.chunks.len(), 1);
        assert_eq!(outline.chunks[0].index, 0);
        assert_eq!(outline.sections.len(), 1);
        assert_eq!(outline.sections[0].title, "Root");
        assert_eq!(outline.sections[0].chunk_start, 0);
        assert_eq!(outline.sections[0].chunk_end, 1);
    }

    #[test]
    fn test_atx_headers_nest_by_hash_count() {
        let text = "# Top\n\nIntro paragraph.\n\n## Child\n\nChild body.\n\n# Second\n\nMore.";
        let outline = parse_document(text);
        let paths: Vec<&str> = outline.sections.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["top", "top/child", "second"]);
        assert_eq!(outline.sections[0].depth, 1);
        assert_eq!(outline.sections[1].depth, 2);
    }

    #[test]
    fn test_setext_headers() {
        let text = "Overview\n========\n\nBody one.\n\nDetails\n-------\n\nBody two.";
        let outline = parse_document(text);
        assert_eq!(outline.sections.len(), 2);
        assert_eq!(outline.sections[0].title, "Overview");
        assert_eq!(outline.sections[0].depth, 1);
        assert_eq!(outline.sections[1].title, "Details");
        assert_eq!(outline.sections[1].depth, 2);
    }

    #[test]
    fn test_title_case_header_requires_blank_line() {
        let text = "Work Experience\n\nBuilt systems at scale.\n\nNot A Header because this line continues\nright here without a blank.";
        let outline = parse_document(text);
        assert_eq!(outline.sections[0].title, "Work Experience");
        // The second candidate is followed by a non-blank line, so it stays
        // body text.
        assert_eq!(outline.sections.len(), 1);
    }

    #[test]
    fn test_plain_sentence_is_not_a_header() {
        let text = "OpenAI collaborates with Microsoft and Google on AI safety.";
        let outline = parse_document(text);
        assert_eq!(outline.sections.len(), 1);
        assert_eq!(outline.sections[0].title, "Root");
    }

    #[test]
    fn test_chunk_sizes_within_bounds() {
        let body = (0..30).map(|i| para(40, &format!("word{}", i))).collect::<Vec<_>>().join("\n\n");
        let outline = parse_document(&body);
        assert!(outline.chunks.len() > 1);
        for chunk in &outline.chunks {
            assert!(
                chunk.text.len() <= CHUNK_TARGET_MAX,
                "chunk of {} chars exceeds ceiling",
                chunk.text.len()
            );
        }
    }

    #[test]
    fn test_chunk_indices_monotonic_and_contiguous() {
        let text = format!(
            "# A\n\n{}\n\n# B\n\n{}",
            para(300, "alpha"),
            para(300, "beta")
        );
        let outline = parse_document(&text);
        for (i, c) in outline.chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
        // Section ranges tile the chunk sequence without gaps.
        let mut expected = 0;
        for s in &outline.sections {
            assert_eq!(s.chunk_start, expected);
            assert!(s.chunk_end >= s.chunk_start);
            expected = s.chunk_end;
        }
        assert_eq!(expected, outline.chunks.len());
    }

    #[test]
    fn test_oversized_paragraph_splits_on_sentences() {
        let long = (0..80)
            .map(|i| format!("Sentence number {} has a handful of words.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let outline = parse_document(&long);
        assert!(outline.chunks.len() > 1);
        for chunk in &outline.chunks {
            assert!(chunk.text.len() <= CHUNK_TARGET_MAX);
            // No chunk should end mid-sentence.
            assert!(
                chunk.text.ends_with('.'),
                "chunk broke inside a sentence: {:?}",
                &chunk.text[chunk.text.len().saturating_sub(40)..]
            );
        }
    }

    #[test]
    fn test_deterministic() {
        let text = format!("# One\n\n{}\n\n## Two\n\n{}", para(200, "x"), para(200, "y"));
        let a = parse_document(&text);
        let b = parse_document(&text);
        assert_eq!(a.chunks, b.chunks);
        assert_eq!(a.sections, b.sections);
    }

    #[test]
    fn test_duplicate_titles_get_unique_paths() {
        let text = "# Notes\n\nFirst.\n\n# Notes\n\nSecond.";
        let outline = parse_document(&text);
        assert_eq!(outline.sections[0].path, "notes");
        assert_eq!(outline.sections[1].path, "notes-2");
    }

    #[test]
    fn test_split_sentences() {
        let s = split_sentences("One. Two! Three? Four");
        assert_eq!(s, vec!["One.", "Two!", "Three?", "Four"]);
    }
}
