//! The fault-tolerant token source.
//!
//! Tokenization is line-based. Anything the scanner cannot classify becomes a
//! one-character [`TokenKind::ErrorToken`] and scanning resumes immediately
//! after it, so broken input never aborts the stream. Indentation handling,
//! implicit line joining inside brackets, backslash continuations and
//! multi-line strings are all resolved here; the parser downstream only ever
//! sees a flat token sequence ending in a single `EndMarker`.

use crate::{
    position::Position,
    token::{Token, TokenKind},
};

/// A finite token stream over one source buffer, with single-token push-back.
///
/// The parser pushes a token back whenever a construct parser consumed the
/// token that should terminate it and the main loop needs to see it again.
#[derive(Debug)]
pub struct TokenSource {
    tokens: std::vec::IntoIter<Token>,
    pending: Option<Token>,
}

impl TokenSource {
    /// Tokenizes `source` eagerly. `line_offset` is added to every emitted
    /// line number, so a source slice reports positions of the file it was
    /// cut from. With `stop_on_scope`, the stream ends as soon as a dedent
    /// returns to the leftmost column after having been indented; incremental
    /// wrappers use this to parse one top-level scope at a time.
    pub fn new(source: &str, line_offset: u32, stop_on_scope: bool) -> Self {
        let tokens = Scanner::new(line_offset, stop_on_scope).scan(source);
        Self {
            tokens: tokens.into_iter(),
            pending: None,
        }
    }

    /// Makes `token` the next token returned by the iterator.
    ///
    /// Only one token can be pending; pushing a second replaces the first,
    /// which matches the single-item lookahead the parser needs.
    pub fn push_back(&mut self, token: Token) {
        self.pending = Some(token);
    }
}

impl Iterator for TokenSource {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        if let Some(token) = self.pending.take() {
            return Some(token);
        }
        self.tokens.next()
    }
}

/// Per-scan state: indent stack, bracket depth, and any string literal still
/// open from a previous line.
struct Scanner {
    line_offset: u32,
    stop_on_scope: bool,
    tokens: Vec<Token>,
    indent_stack: Vec<usize>,
    paren_level: usize,
    continuation: bool,
    open_string: Option<OpenString>,
    stopped: bool,
}

/// A triple-quoted string that did not close on the line it started on.
struct OpenString {
    start: Position,
    marker: &'static str,
    text: String,
}

impl Scanner {
    fn new(line_offset: u32, stop_on_scope: bool) -> Self {
        Self {
            line_offset,
            stop_on_scope,
            tokens: Vec::new(),
            indent_stack: vec![0],
            paren_level: 0,
            continuation: false,
            open_string: None,
            stopped: false,
        }
    }

    fn scan(mut self, source: &str) -> Vec<Token> {
        let lines = split_lines_with_endings(source);
        let mut last_row = 1;

        for (idx, line) in lines.iter().enumerate() {
            if self.stopped {
                break;
            }
            let row = idx as u32 + 1 + self.line_offset;
            last_row = row + 1;
            self.scan_line(row, line);
        }

        if let Some(open) = self.open_string.take() {
            // Unterminated multi-line string: editors query mid-keystroke, so
            // the accumulated text still goes out as a string token.
            let end = Position::new(last_row.saturating_sub(1), 0);
            self.tokens
                .push(Token::new(TokenKind::String, open.text, open.start, end, ""));
        }

        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.tokens.push(Token::new(
                TokenKind::Dedent,
                "",
                Position::new(last_row, 0),
                Position::new(last_row, 0),
                "",
            ));
        }
        self.tokens.push(Token::new(
            TokenKind::EndMarker,
            "",
            Position::new(last_row, 0),
            Position::new(last_row, 0),
            "",
        ));
        self.tokens
    }

    fn scan_line(&mut self, row: u32, line: &str) {
        let (content, has_newline) = match line.strip_suffix('\n') {
            Some(without) => (without, true),
            None => (line, false),
        };

        let mut scan_from = 0usize;
        let mut closed_string = false;
        if let Some(open) = self.open_string.take() {
            match close_multiline(content, open.marker) {
                Some(end_byte) => {
                    let mut text = open.text;
                    text.push_str(&content[..end_byte]);
                    let end_col = content[..end_byte].chars().count() as u32;
                    self.tokens.push(Token::new(
                        TokenKind::String,
                        text,
                        open.start,
                        Position::new(row, end_col),
                        line,
                    ));
                    scan_from = end_byte;
                    closed_string = true;
                }
                None => {
                    let mut open = open;
                    open.text.push_str(line);
                    self.open_string = Some(open);
                    return;
                }
            }
        } else {
            let trimmed = content.trim_start_matches([' ', '\t', '\x0c']);
            let is_blank_or_comment = trimmed.is_empty() || trimmed.starts_with('#');

            let mut indent_col = 0usize;
            let mut non_ws_byte = 0usize;
            for (byte_idx, ch) in content.char_indices() {
                if matches!(ch, ' ' | '\t' | '\x0c') {
                    indent_col += 1;
                    non_ws_byte = byte_idx + ch.len_utf8();
                } else {
                    break;
                }
            }

            // Indentation is only structure on code lines at bracket depth 0
            // that do not continue a previous line.
            if !is_blank_or_comment && self.paren_level == 0 && !self.continuation {
                self.handle_indent(row, line, content, indent_col, non_ws_byte);
                if self.stopped {
                    return;
                }
            }
            scan_from = non_ws_byte;
        }

        self.continuation = false;
        let saw_code = self.scan_tokens(row, line, content, scan_from) || closed_string;

        if self.open_string.is_some() || self.continuation {
            return;
        }
        if has_newline {
            let kind = if saw_code && self.paren_level == 0 {
                TokenKind::Newline
            } else {
                TokenKind::Nl
            };
            let col = content.chars().count() as u32;
            self.tokens.push(Token::new(
                kind,
                "\n",
                Position::new(row, col),
                Position::new(row, col + 1),
                line,
            ));
        } else if saw_code && self.paren_level == 0 {
            let col = content.chars().count() as u32;
            self.tokens.push(Token::new(
                TokenKind::Newline,
                "",
                Position::new(row, col),
                Position::new(row, col),
                line,
            ));
        }
    }

    fn handle_indent(&mut self, row: u32, line: &str, content: &str, indent_col: usize, non_ws_byte: usize) {
        let current_indent = *self.indent_stack.last().unwrap_or(&0);
        if indent_col > current_indent {
            self.indent_stack.push(indent_col);
            self.tokens.push(Token::new(
                TokenKind::Indent,
                &content[..non_ws_byte],
                Position::new(row, 0),
                Position::new(row, indent_col as u32),
                line,
            ));
        } else if indent_col < current_indent {
            while self.indent_stack.len() > 1 && indent_col < *self.indent_stack.last().unwrap_or(&0) {
                self.indent_stack.pop();
                self.tokens.push(Token::new(
                    TokenKind::Dedent,
                    "",
                    Position::new(row, indent_col as u32),
                    Position::new(row, indent_col as u32),
                    line,
                ));
            }
            if self.stop_on_scope && self.indent_stack.len() == 1 {
                self.stopped = true;
            }
        }
    }

    /// Scans the code tokens of one line, starting at byte `from`.
    /// Returns true if any non-comment token was produced.
    fn scan_tokens(&mut self, row: u32, line: &str, content: &str, from: usize) -> bool {
        let mut i = from;
        let mut saw_code = false;

        while i < content.len() {
            let Some(ch) = content[i..].chars().next() else {
                break;
            };

            if matches!(ch, ' ' | '\t' | '\x0c' | '\r') {
                i += ch.len_utf8();
                continue;
            }

            let start_col = content[..i].chars().count() as u32;

            if ch == '#' {
                let end_col = content.chars().count() as u32;
                self.tokens.push(Token::new(
                    TokenKind::Comment,
                    &content[i..],
                    Position::new(row, start_col),
                    Position::new(row, end_col),
                    line,
                ));
                break;
            }

            if ch == '\\' && content[i + 1..].trim_end_matches('\r').is_empty() {
                self.continuation = true;
                break;
            }

            if is_ident_start(ch) {
                let mut j = i + ch.len_utf8();
                while j < content.len() {
                    let Some(next_ch) = content[j..].chars().next() else {
                        break;
                    };
                    if is_ident_continue(next_ch) {
                        j += next_ch.len_utf8();
                    } else {
                        break;
                    }
                }
                let text = &content[i..j];
                // A string prefix glues onto the quote that follows it.
                if is_string_prefix(text) && matches!(content[j..].chars().next(), Some('\'' | '"')) {
                    let quote = content[j..].chars().next().unwrap_or('"');
                    i = self.scan_string_token(row, line, content, i, j, quote, start_col);
                    saw_code = true;
                    continue;
                }
                let end_col = content[..j].chars().count() as u32;
                self.tokens.push(Token::new(
                    TokenKind::Name,
                    text,
                    Position::new(row, start_col),
                    Position::new(row, end_col),
                    line,
                ));
                saw_code = true;
                i = j;
                continue;
            }

            if ch.is_ascii_digit() || (ch == '.' && content[i + 1..].starts_with(|c: char| c.is_ascii_digit())) {
                let j = scan_number(content, i);
                let end_col = content[..j].chars().count() as u32;
                self.tokens.push(Token::new(
                    TokenKind::Number,
                    &content[i..j],
                    Position::new(row, start_col),
                    Position::new(row, end_col),
                    line,
                ));
                saw_code = true;
                i = j;
                continue;
            }

            if ch == '\'' || ch == '"' {
                i = self.scan_string_token(row, line, content, i, i, ch, start_col);
                saw_code = true;
                continue;
            }

            if let Some(op_len) = match_operator(&content[i..]) {
                let j = i + op_len;
                let text = &content[i..j];
                match text {
                    "(" | "[" | "{" => self.paren_level += 1,
                    ")" | "]" | "}" => self.paren_level = self.paren_level.saturating_sub(1),
                    _ => {}
                }
                let end_col = content[..j].chars().count() as u32;
                self.tokens.push(Token::new(
                    TokenKind::Op,
                    text,
                    Position::new(row, start_col),
                    Position::new(row, end_col),
                    line,
                ));
                saw_code = true;
                i = j;
                continue;
            }

            let j = i + ch.len_utf8();
            let end_col = content[..j].chars().count() as u32;
            self.tokens.push(Token::new(
                TokenKind::ErrorToken,
                ch.to_string(),
                Position::new(row, start_col),
                Position::new(row, end_col),
                line,
            ));
            saw_code = true;
            i = j;
        }

        saw_code
    }

    /// Scans a string whose opening quote sits at byte `quote_at` (the token
    /// itself starts at `token_at`, which differs when a prefix like `r` or
    /// `b` precedes the quote). Returns the byte index scanning resumes at.
    fn scan_string_token(
        &mut self,
        row: u32,
        line: &str,
        content: &str,
        token_at: usize,
        quote_at: usize,
        quote: char,
        start_col: u32,
    ) -> usize {
        match scan_string(content, quote_at, quote) {
            StringScan::Closed(j) => {
                let end_col = content[..j].chars().count() as u32;
                self.tokens.push(Token::new(
                    TokenKind::String,
                    &content[token_at..j],
                    Position::new(row, start_col),
                    Position::new(row, end_col),
                    line,
                ));
                j
            }
            StringScan::OpenMultiline(marker) => {
                let mut text = content[token_at..].to_owned();
                text.push('\n');
                self.open_string = Some(OpenString {
                    start: Position::new(row, start_col),
                    marker,
                    text,
                });
                content.len()
            }
            StringScan::Unterminated => {
                // A single-quoted string that never closes poisons the rest
                // of the line; emit it as recovery residue and move on.
                let end_col = content.chars().count() as u32;
                self.tokens.push(Token::new(
                    TokenKind::ErrorToken,
                    &content[token_at..],
                    Position::new(row, start_col),
                    Position::new(row, end_col),
                    line,
                ));
                content.len()
            }
        }
    }
}

enum StringScan {
    /// Terminated on this line; the value is the byte index just past the
    /// closing quote.
    Closed(usize),
    /// A triple-quoted string that continues on the next line.
    OpenMultiline(&'static str),
    /// A single-quoted string with no closing quote on its line.
    Unterminated,
}

/// Scans a string literal starting at the quote character.
fn scan_string(content: &str, start: usize, quote: char) -> StringScan {
    let marker: &'static str = if quote == '\'' { "'''" } else { "\"\"\"" };
    let triple = content[start..].starts_with(marker);
    let mut i = start + if triple { 3 } else { 1 };

    let mut escaped = false;
    while i < content.len() {
        let Some(ch) = content[i..].chars().next() else {
            break;
        };

        if escaped {
            escaped = false;
            i += ch.len_utf8();
            continue;
        }
        if ch == '\\' {
            escaped = true;
            i += ch.len_utf8();
            continue;
        }
        if ch == quote {
            if triple {
                if content[i..].starts_with(marker) {
                    return StringScan::Closed(i + marker.len());
                }
            } else {
                return StringScan::Closed(i + ch.len_utf8());
            }
        }
        i += ch.len_utf8();
    }

    if triple {
        StringScan::OpenMultiline(marker)
    } else {
        StringScan::Unterminated
    }
}

/// Looks for the closing marker of a multi-line string on a continuation
/// line. Returns the byte index just past the marker.
fn close_multiline(content: &str, marker: &str) -> Option<usize> {
    let mut i = 0usize;
    let mut escaped = false;
    while i < content.len() {
        let Some(ch) = content[i..].chars().next() else {
            break;
        };
        if escaped {
            escaped = false;
            i += ch.len_utf8();
            continue;
        }
        if ch == '\\' {
            escaped = true;
            i += ch.len_utf8();
            continue;
        }
        if content[i..].starts_with(marker) {
            return Some(i + marker.len());
        }
        i += ch.len_utf8();
    }
    None
}

/// Splits source into lines, each keeping its trailing newline.
fn split_lines_with_endings(source: &str) -> Vec<&str> {
    let mut lines = Vec::new();
    let mut start = 0usize;
    for (idx, byte) in source.bytes().enumerate() {
        if byte == b'\n' {
            lines.push(&source[start..=idx]);
            start = idx + 1;
        }
    }
    if start < source.len() {
        lines.push(&source[start..]);
    }
    lines
}

/// Returns true if a character can start an identifier.
fn is_ident_start(ch: char) -> bool {
    ch == '_' || ch.is_alphabetic()
}

/// Returns true if a character can continue an identifier.
fn is_ident_continue(ch: char) -> bool {
    ch == '_' || ch.is_alphanumeric()
}

/// Returns true for the prefix letters Python allows in front of a string
/// literal.
fn is_string_prefix(text: &str) -> bool {
    text.len() <= 2 && !text.is_empty() && text.chars().all(|c| matches!(c, 'r' | 'R' | 'b' | 'B' | 'u' | 'U' | 'f' | 'F'))
}

/// Scans a numeric token starting at `start`.
fn scan_number(content: &str, start: usize) -> usize {
    let bytes = content.as_bytes();
    let mut i = start;

    if bytes[i] == b'0' && i + 1 < bytes.len() && matches!(bytes[i + 1], b'x' | b'X' | b'o' | b'O' | b'b' | b'B') {
        i += 2;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
        return i;
    }

    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
        i += 1;
    }

    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
            i += 1;
        }
    }

    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'_') {
            i += 1;
        }
    }

    if i < bytes.len() && (bytes[i] == b'j' || bytes[i] == b'J') {
        i += 1;
    }

    i
}

/// Matches the longest exact operator token at the current byte offset.
fn match_operator(slice: &str) -> Option<usize> {
    const MATCH_ORDER: &[&str] = &[
        "**=", "//=", "<<=", ">>=", "...", "==", "!=", "<=", ">=", "**", "//", "<<", ">>", "+=", "-=", "*=", "/=",
        "%=", "&=", "|=", "^=", "@=", "->", ":=", "!", "(", ")", "[", "]", ":", ",", ";", "+", "-", "*", "/", "|",
        "&", "<", ">", "=", ".", "%", "{", "}", "~", "^", "@", "`",
    ];

    MATCH_ORDER.iter().find(|op| slice.starts_with(**op)).map(|op| op.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<(TokenKind, String)> {
        TokenSource::new(source, 0, false)
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn simple_assignment() {
        let toks = kinds("x = 1\n");
        assert_eq!(
            toks,
            vec![
                (TokenKind::Name, "x".to_owned()),
                (TokenKind::Op, "=".to_owned()),
                (TokenKind::Number, "1".to_owned()),
                (TokenKind::Newline, "\n".to_owned()),
                (TokenKind::EndMarker, String::new()),
            ]
        );
    }

    #[test]
    fn indent_and_dedent_pair_up() {
        let toks = kinds("if x:\n    pass\ny\n");
        let indents = toks.iter().filter(|(k, _)| *k == TokenKind::Indent).count();
        let dedents = toks.iter().filter(|(k, _)| *k == TokenKind::Dedent).count();
        assert_eq!(indents, 1);
        assert_eq!(dedents, 1);
    }

    #[test]
    fn newlines_inside_brackets_are_nl() {
        let toks = kinds("x = (1,\n     2)\n");
        let newline_count = toks.iter().filter(|(k, _)| *k == TokenKind::Newline).count();
        assert_eq!(newline_count, 1, "only the logical line end is NEWLINE");
        assert!(toks.iter().any(|(k, _)| *k == TokenKind::Nl));
        assert!(!toks.iter().any(|(k, _)| *k == TokenKind::Indent));
    }

    #[test]
    fn multiline_string_is_one_token() {
        let toks = kinds("s = \"\"\"one\ntwo\"\"\"\n");
        let strings: Vec<_> = toks.iter().filter(|(k, _)| *k == TokenKind::String).collect();
        assert_eq!(strings.len(), 1);
        assert_eq!(strings[0].1, "\"\"\"one\ntwo\"\"\"");
    }

    #[test]
    fn unterminated_multiline_string_still_emitted() {
        let toks = kinds("s = '''open\nnever closed\n");
        assert!(toks.iter().any(|(k, _)| *k == TokenKind::String));
        assert!(matches!(toks.last(), Some((TokenKind::EndMarker, _))));
    }

    #[test]
    fn unterminated_single_quote_becomes_error_token() {
        let toks = kinds("x = 'oops\ny = 1\n");
        assert!(toks.iter().any(|(k, _)| *k == TokenKind::ErrorToken));
        assert!(toks.iter().any(|(k, t)| *k == TokenKind::Name && t == "y"));
    }

    #[test]
    fn backslash_joins_lines() {
        let toks = kinds("x = 1 + \\\n    2\n");
        let newline_count = toks.iter().filter(|(k, _)| *k == TokenKind::Newline).count();
        assert_eq!(newline_count, 1);
        assert!(!toks.iter().any(|(k, _)| *k == TokenKind::Indent));
    }

    #[test]
    fn string_prefix_glues_to_literal() {
        let toks = kinds("p = r'raw\\d'\n");
        assert!(toks.iter().any(|(k, t)| *k == TokenKind::String && t == "r'raw\\d'"));
    }

    #[test]
    fn push_back_returns_token_once() {
        let mut source = TokenSource::new("a b\n", 0, false);
        let first = source.next().unwrap();
        assert_eq!(first.text, "a");
        source.push_back(first.clone());
        assert_eq!(source.next().unwrap().text, "a");
        assert_eq!(source.next().unwrap().text, "b");
    }

    #[test]
    fn line_offset_shifts_positions() {
        let token = TokenSource::new("x\n", 10, false).next().unwrap();
        assert_eq!(token.start, Position::new(11, 0));
    }

    #[test]
    fn stop_on_scope_ends_after_first_dedent_to_top() {
        let toks: Vec<_> = TokenSource::new("def f():\n    pass\nx = 1\n", 0, true).collect();
        assert!(matches!(toks.last().map(|t| t.kind), Some(TokenKind::EndMarker)));
        assert!(
            !toks.iter().any(|t| t.text == "x"),
            "tokens after the scope must not be yielded"
        );
    }
}
