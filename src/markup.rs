//! Markdown → chat markup conversion and message chunking.
//!
//! Converts common markdown into Telegram's MarkdownV2 dialect. The
//! conversion is total: any input produces markup the Bot API accepts,
//! with unrecognized syntax escaped rather than dropped.

/// Characters MarkdownV2 requires escaping outside entities.
const SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!', '\\',
];

const FENCE: &str = "```";
/// Room reserved at the end of a chunk to close an open fence.
const FENCE_CLOSE: &str = "\n```";
/// Chunks are never split below this many characters.
const MIN_CHUNK_LEN: usize = 64;
/// Longest language tag carried over when a fence is reopened.
const MAX_LANG_LEN: usize = 20;

/// One message worth of text: the converted markup and the source it came
/// from, for plain-text fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub markup: String,
    pub plain: String,
}

/// Convert markdown text to MarkdownV2.
pub fn to_channel_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 4);
    let mut in_fence = false;

    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let trimmed = line.trim_start();
        if let Some(lang) = trimmed.strip_prefix(FENCE) {
            out.push_str(FENCE);
            if !in_fence {
                out.extend(lang.trim().chars().filter(char::is_ascii_alphanumeric));
            }
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push_str(&escape_code(line));
        } else {
            convert_line(line, &mut out);
        }
    }

    if in_fence {
        out.push_str(FENCE_CLOSE);
    }
    out
}

fn convert_line(line: &str, out: &mut String) {
    let trimmed = line.trim_start();
    out.push_str(&line[..line.len() - trimmed.len()]);

    if let Some(heading) = strip_heading(trimmed) {
        out.push('*');
        out.push_str(&escape_text(heading));
        out.push('*');
    } else if let Some(item) = ["- ", "* ", "+ "]
        .iter()
        .find_map(|bullet| trimmed.strip_prefix(bullet))
    {
        out.push_str("• ");
        out.push_str(&convert_inline(item));
    } else if let Some((number, item)) = strip_numbered(trimmed) {
        out.push_str(number);
        out.push_str("\\. ");
        out.push_str(&convert_inline(item));
    } else if let Some(quote) = trimmed.strip_prefix('>') {
        out.push('>');
        out.push_str(&convert_inline(quote));
    } else {
        out.push_str(&convert_inline(trimmed));
    }
}

fn strip_heading(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) {
        line[hashes..].strip_prefix(' ').map(str::trim)
    } else {
        None
    }
}

fn strip_numbered(line: &str) -> Option<(&str, &str)> {
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    line[digits..]
        .strip_prefix(". ")
        .map(|rest| (&line[..digits], rest))
}

/// Convert inline markdown (code spans, emphasis, links) in one line.
fn convert_inline(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            '\\' if next.is_some_and(|n| n.is_ascii_punctuation()) => {
                push_escaped(&mut out, chars[i + 1]);
                i += 2;
                continue;
            }
            '`' => {
                if let Some(end) = find(&chars, i + 1, &['`']) {
                    out.push('`');
                    out.push_str(&escape_code(&collect(&chars[i + 1..end])));
                    out.push('`');
                    i = end + 1;
                    continue;
                }
            }
            '*' | '_' if next == Some(c) => {
                let delim = [c, c];
                if let Some(end) = find(&chars, i + 2, &delim).filter(|&end| end > i + 2) {
                    out.push('*');
                    out.push_str(&convert_inline(&collect(&chars[i + 2..end])));
                    out.push('*');
                    i = end + 2;
                    continue;
                }
            }
            '~' if next == Some('~') => {
                if let Some(end) = find(&chars, i + 2, &['~', '~']).filter(|&end| end > i + 2) {
                    out.push('~');
                    out.push_str(&convert_inline(&collect(&chars[i + 2..end])));
                    out.push('~');
                    i = end + 2;
                    continue;
                }
            }
            '*' | '_' if opens_emphasis(&chars, i) => {
                if let Some(end) = closing_emphasis(&chars, i) {
                    out.push('_');
                    out.push_str(&convert_inline(&collect(&chars[i + 1..end])));
                    out.push('_');
                    i = end + 1;
                    continue;
                }
            }
            '[' => {
                if let Some((label_end, url_end)) = find_link(&chars, i) {
                    out.push('[');
                    out.push_str(&convert_inline(&collect(&chars[i + 1..label_end])));
                    out.push_str("](");
                    out.push_str(&escape_url(&collect(&chars[label_end + 2..url_end])));
                    out.push(')');
                    i = url_end + 1;
                    continue;
                }
            }
            _ => {}
        }

        push_escaped(&mut out, c);
        i += 1;
    }
    out
}

fn opens_emphasis(chars: &[char], i: usize) -> bool {
    let prev_ok = i == 0 || !chars[i - 1].is_alphanumeric();
    let next_ok = chars.get(i + 1).is_some_and(|n| !n.is_whitespace());
    prev_ok && next_ok
}

fn closing_emphasis(chars: &[char], open: usize) -> Option<usize> {
    let delim = chars[open];
    (open + 2..chars.len()).find(|&j| {
        chars[j] == delim
            && !chars[j - 1].is_whitespace()
            && chars.get(j + 1).is_none_or(|n| !n.is_alphanumeric())
    })
}

fn find_link(chars: &[char], open: usize) -> Option<(usize, usize)> {
    let label_end = find(chars, open + 1, &[']'])?;
    if chars.get(label_end + 1) != Some(&'(') {
        return None;
    }
    let url_end = find(chars, label_end + 2, &[')'])?;
    (url_end > label_end + 2).then_some((label_end, url_end))
}

/// Index of the first occurrence of `pat` at or after `from`.
fn find(chars: &[char], from: usize, pat: &[char]) -> Option<usize> {
    if from > chars.len() {
        return None;
    }
    chars[from..]
        .windows(pat.len())
        .position(|w| w == pat)
        .map(|p| p + from)
}

fn collect(chars: &[char]) -> String {
    chars.iter().collect()
}

fn push_escaped(out: &mut String, c: char) {
    if SPECIAL.contains(&c) {
        out.push('\\');
    }
    out.push(c);
}

/// Escape plain text so it renders verbatim.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        push_escaped(&mut out, c);
    }
    out
}

fn escape_code(text: &str) -> String {
    text.replace('\\', "\\\\").replace('`', "\\`")
}

fn escape_url(url: &str) -> String {
    url.replace('\\', "\\\\").replace(')', "\\)")
}

/// Split a message into chunks of at most `max_len` characters.
///
/// Splits on newlines, then spaces, then hard-cuts. Exactly one separator
/// is dropped at each split, so leading indentation survives. A fenced
/// block that spans a split is closed and reopened.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(MIN_CHUNK_LEN);
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let budget = max_len - FENCE_CLOSE.len();
    let mut chunks = Vec::new();
    let mut remaining = text.to_string();

    while remaining.chars().count() > max_len {
        let cut = remaining
            .char_indices()
            .nth(budget)
            .map_or(remaining.len(), |(i, _)| i);
        let window = &remaining[..cut];
        let mut split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(cut);

        // Reopening a fence must not eat the progress made by this split.
        if let Some(opener) = open_fence(&remaining[..split_at]) {
            if remaining[..split_at].chars().count() <= opener.chars().count() + 1 {
                split_at = cut;
            }
        }

        let mut head = remaining[..split_at].to_string();
        let rest = &remaining[split_at..];
        let rest = rest
            .strip_prefix('\n')
            .or_else(|| rest.strip_prefix(' '))
            .unwrap_or(rest);

        let rest = match open_fence(&head) {
            Some(opener) => {
                head.push_str(FENCE_CLOSE);
                format!("{opener}\n{rest}")
            }
            None => rest.to_string(),
        };
        chunks.push(head);
        remaining = rest;
    }

    if !remaining.is_empty() {
        chunks.push(remaining);
    }
    chunks
}

/// The opening fence line if `text` ends inside a fenced block.
fn open_fence(text: &str) -> Option<String> {
    let mut open: Option<String> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(lang) = trimmed.strip_prefix(FENCE) {
            open = match open {
                Some(_) => None,
                None => Some(format!(
                    "{FENCE}{}",
                    lang.trim().chars().take(MAX_LANG_LEN).collect::<String>()
                )),
            };
        }
    }
    open
}

/// Split `text` and convert each piece, keeping every converted chunk
/// within `max_len`. Whitespace-only text yields no chunks.
pub fn chunk_for_channel(text: &str, max_len: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if text.trim().is_empty() {
        return chunks;
    }
    for piece in split_message(text, max_len) {
        push_fitting(&piece, max_len, &mut chunks);
    }
    chunks
}

/// Escaping grows text; re-split any piece whose markup overflows.
fn push_fitting(piece: &str, max_len: usize, out: &mut Vec<Chunk>) {
    let markup = to_channel_markup(piece);
    let len = piece.chars().count();
    if markup.chars().count() <= max_len || len <= MIN_CHUNK_LEN {
        out.push(Chunk {
            markup,
            plain: piece.to_string(),
        });
        return;
    }
    for sub in split_message(piece, len / 2) {
        push_fitting(&sub, max_len, out);
    }
}
