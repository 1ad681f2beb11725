//! Recovery records and cursor helpers for the completion layers.
//!
//! When an import breaks mid-parse, the parser keeps what it consumed on the
//! module as an [`ErrorStatementStack`]. Completion uses those records to
//! keep offering module names on lines like `from os.pa` even though no
//! healthy Import node exists there.

use std::sync::LazyLock;

use crate::{
    position::Position,
    tree::{Module, NameId, NamePart},
};

/// Which import form a recovery record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum ImportErrorKind {
    ImportName,
    ImportFrom,
}

/// One element the parser consumed before the import broke.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum ErrorNode {
    /// A keyword, practically always `import`.
    Keyword {
        text: String,
        start: Position,
        end: Position,
    },
    /// A run of leading dots of a relative import.
    Dots { count: u32, start: Position },
    /// A dotted name, with a marker for a dangling trailing dot
    /// (`import os.`).
    DottedName { name: NameId, trailing_dot: bool },
}

/// A partially parsed import, retained for completion.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ErrorStatementStack {
    pub kind: ImportErrorKind,
    /// Where the broken construct started.
    pub first_pos: Position,
    /// Where parsing picked up again.
    pub next_start_pos: Position,
    pub stack: Vec<ErrorNode>,
}

/// What import completion needs to know at a cursor inside a broken import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportContext {
    /// The name parts left of the cursor, outermost first.
    pub names: Vec<NamePart>,
    /// Relative level: the number of leading dots.
    pub level: u32,
    /// False once the `import` keyword was passed, because anything after it
    /// may be a non-module attribute.
    pub only_modules: bool,
    /// True when the dotted name ends in a dot, waiting for its next part.
    pub unfinished_dotted: bool,
}

/// Finds the broken import under the cursor, if there is one, and extracts
/// the context completion needs. Returns `None` when the cursor is not
/// inside any recorded recovery range, or sits on the `import` keyword
/// itself.
pub fn check_error_statements(module: &Module, pos: Position) -> Option<ImportContext> {
    let offset = module.line_offset;
    for stack in &module.error_statement_stacks {
        let first = stack.first_pos.with_line_offset(offset);
        let next = stack.next_start_pos.with_line_offset(offset);
        if first < pos && pos <= next {
            return importer_from_error_statement(module, stack, pos);
        }
    }
    None
}

fn importer_from_error_statement(module: &Module, stack: &ErrorStatementStack, pos: Position) -> Option<ImportContext> {
    let offset = module.line_offset;
    let mut names: Vec<NamePart> = Vec::new();
    let mut level = 0u32;
    let mut only_modules = true;
    let mut unfinished_dotted = false;

    for node in &stack.stack {
        match node {
            ErrorNode::Keyword { text, start, end } => {
                let on_keyword =
                    start.with_line_offset(offset) <= pos && pos <= end.with_line_offset(offset);
                if stack.kind == ImportErrorKind::ImportName && on_keyword {
                    // the cursor is on `import` itself; nothing to complete
                    return None;
                }
                if stack.kind == ImportErrorKind::ImportFrom
                    && text == "import"
                    && start.with_line_offset(offset) < pos
                {
                    // past `import`, completion may offer attributes too
                    only_modules = false;
                }
            }
            ErrorNode::Dots { count, start } => {
                if start.with_line_offset(offset) < pos {
                    level += count;
                }
            }
            ErrorNode::DottedName { name, trailing_dot } => {
                let name = module.name(*name);
                if name.start.with_line_offset(offset) >= pos {
                    break;
                }
                for part in &name.parts {
                    if part.start.with_line_offset(offset) <= pos {
                        names.push(part.clone());
                    }
                }
                if *trailing_dot {
                    unfinished_dotted = true;
                }
            }
        }
    }

    Some(ImportContext {
        names,
        level,
        only_modules,
        unfinished_dotted,
    })
}

/// The split of the text left of the cursor that completion matches
/// against: everything before the final dotted segment, whether a dot is
/// there, and the unfinished word being typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionParts {
    pub path: String,
    pub has_dot: bool,
    pub like: String,
}

/// Splits the line up to the cursor into `(path, dot, like)`.
pub fn completion_parts(path_until_cursor: &str) -> CompletionParts {
    static PARTS: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?s)^(.*?)(\.|)(\w?[\w\d]*)$").expect("valid completion pattern"));
    let captures = PARTS
        .captures(path_until_cursor)
        .expect("the pattern matches any input");
    CompletionParts {
        path: captures.get(1).map_or("", |m| m.as_str()).to_owned(),
        has_dot: captures.get(2).is_some_and(|m| !m.as_str().is_empty()),
        like: captures.get(3).map_or("", |m| m.as_str()).to_owned(),
    }
}

/// Case-aware prefix match used to filter completion candidates.
pub fn name_like(name: &str, like: &str, case_insensitive: bool) -> bool {
    if case_insensitive {
        name.to_lowercase().starts_with(&like.to_lowercase())
    } else {
        name.starts_with(like)
    }
}

#[cfg(test)]
mod tests {
    use super::{completion_parts, name_like};

    #[test]
    fn completion_parts_splits_dotted_path() {
        let parts = completion_parts("os.pa");
        assert_eq!(parts.path, "os");
        assert!(parts.has_dot);
        assert_eq!(parts.like, "pa");
    }

    #[test]
    fn completion_parts_without_dot() {
        let parts = completion_parts("datet");
        assert_eq!(parts.path, "");
        assert!(!parts.has_dot);
        assert_eq!(parts.like, "datet");
    }

    #[test]
    fn completion_parts_trailing_dot() {
        let parts = completion_parts("os.path.");
        assert_eq!(parts.path, "os.path");
        assert!(parts.has_dot);
        assert_eq!(parts.like, "");
    }

    #[test]
    fn name_like_matches_prefixes() {
        assert!(name_like("listdir", "list", false));
        assert!(!name_like("listdir", "List", false));
        assert!(name_like("listdir", "List", true));
    }
}
