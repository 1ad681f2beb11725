//! The top-level parser.
//!
//! One pass over the token stream builds the scope tree. Compound headers
//! (`def`, `class`, `if`, `for`, imports) are recognized here; everything
//! else is collected into statements whose expression structure stays lazy.
//! Malformed constructs are logged and discarded without abandoning the
//! parse, which is the whole point: the input is usually mid-edit.

use std::{cell::OnceCell, str::FromStr};

use crate::{
    helpers::{ErrorNode, ErrorStatementStack, ImportErrorKind},
    position::Position,
    token::{Token, TokenKind, is_keyword},
    tokenize::TokenSource,
    tree::{
        ClassData, FlowData, FlowKind, ForFlowData, FunctionData, ImportData, ListComprehension, Module, Name, NameId,
        NamePart, Node, NodeId, NodeKind, ParamData, ScopeData, StatementData, StmtToken,
    },
};

/// Keywords that terminate a statement wherever they appear.
const ALWAYS_BREAK: &[&str] = &[
    ";", "import", "from", "class", "def", "try", "except", "finally", "while", "return", "yield",
];

/// Keywords that terminate a statement only when they would start it.
const NOT_FIRST_BREAK: &[&str] = &["del", "raise"];

/// Constructor inputs beyond the source text. All fields have inert
/// defaults.
#[derive(Debug, Default)]
pub struct ParseOptions {
    /// Filesystem path backing the module; drives `module_name` and
    /// `is_builtin`.
    pub module_path: Option<String>,
    /// The cursor. When present, `user_scope` and `user_stmt` are tracked.
    pub user_position: Option<Position>,
    /// When true, a leading string is a plain statement, not a docstring.
    pub no_docstr: bool,
    /// Added to every reported line, for parsing a slice of a larger file.
    pub line_offset: u32,
    /// Stop when a dedent returns to the top level; used by incremental
    /// wrappers that parse one scope at a time.
    pub stop_on_scope: bool,
    /// Parse into this module's arena and parent top-level children to its
    /// root (stitched multi-chunk parsing).
    pub top_module: Option<Module>,
}

/// A completed parse: the module tree plus the cursor-resolved context.
///
/// Parsing never fails; broken input yields a partial (but well-formed)
/// tree.
#[derive(Debug)]
pub struct Parser {
    pub module: Module,
    /// The scope enclosing the cursor, when a cursor was given and matched.
    pub user_scope: Option<NodeId>,
    /// The smallest statement enclosing the cursor.
    pub user_stmt: Option<NodeId>,
}

impl Parser {
    pub fn new(source: &str, options: ParseOptions) -> Self {
        let mut driver = Driver::new(source, options);
        driver.parse();
        driver.finish()
    }
}

/// Mutable driver state while one parse runs.
struct Driver {
    module: Module,
    source: TokenSource,
    scope: NodeId,
    current: Option<Token>,
    start_pos: Position,
    end_pos: Position,
    user_position: Option<Position>,
    user_scope: Option<NodeId>,
    user_stmt: Option<NodeId>,
    no_docstr: bool,
    /// True right after entering a scope; governs the docstring rule.
    freshscope: bool,
    /// Decorator statements waiting for the next `def`/`class`.
    decorators: Vec<NodeId>,
    /// Identifier texts seen since the last statement was finished; flushed
    /// into `used_names` per statement.
    temp_used_names: Vec<String>,
    /// Whether the last dotted name ended on a dot (`import os.`).
    trailing_dot: bool,
}

impl Driver {
    fn new(source: &str, options: ParseOptions) -> Self {
        let mut text = source.to_owned();
        if !text.ends_with('\n') {
            text.push('\n');
        }

        let start = Position::new(options.line_offset + 1, 0);
        let module = match options.top_module {
            Some(top) => Module::stitch(top, options.module_path, start),
            None => Module::new(options.module_path, start),
        };
        let scope = module.root();

        Self {
            module,
            source: TokenSource::new(&text, options.line_offset, options.stop_on_scope),
            scope,
            current: None,
            start_pos: start,
            end_pos: start,
            user_position: options.user_position,
            user_scope: None,
            user_stmt: None,
            no_docstr: options.no_docstr,
            freshscope: true,
            decorators: Vec::new(),
            temp_used_names: Vec::new(),
            trailing_dot: false,
        }
    }

    fn finish(mut self) -> Parser {
        // Unconsumed decorators get the module as parent so traversal stays
        // safe.
        let root = self.module.root();
        for decorator in std::mem::take(&mut self.decorators) {
            self.module.set_parent(decorator, root);
        }
        self.module.node_mut(root).end = self.end_pos;
        Parser {
            module: self.module,
            user_scope: self.user_scope,
            user_stmt: self.user_stmt,
        }
    }

    // --- token plumbing ---------------------------------------------------

    /// Pulls the next token, updating positions, cursor tracking and the
    /// one-token history. `None` means the stream is exhausted; every open
    /// scope gets its end position fixed up before that is reported.
    fn advance(&mut self) -> Option<(TokenKind, String)> {
        let Some(token) = self.source.next() else {
            let mut cursor = Some(self.scope);
            while let Some(id) = cursor {
                self.module.node_mut(id).end = self.end_pos;
                cursor = self.module.node(id).parent;
            }
            return None;
        };

        self.start_pos = token.start;
        self.end_pos = token.end;
        if let Some(user_pos) = self.user_position
            && (token.start.line == user_pos.line
                || self.user_scope.is_none() && token.start.line >= user_pos.line)
        {
            log::debug!("user scope found [{}]", token.raw_line.trim_end());
            self.user_scope = Some(self.scope);
        }
        let result = (token.kind, token.text.clone());
        self.current = Some(token);
        Some(result)
    }

    /// Re-yields the current token on the next `advance`.
    fn push_back_current(&mut self) {
        if let Some(token) = self.current.clone() {
            self.source.push_back(token);
        }
    }

    // --- names ------------------------------------------------------------

    fn make_name(&mut self, parts: Vec<(String, Position)>, start: Position, end: Position) -> NameId {
        let name = Name {
            parts: parts
                .into_iter()
                .map(|(text, start)| NamePart { text, start })
                .collect(),
            start,
            end,
            parent: None,
        };
        self.module.add_name(name)
    }

    fn single_name(&mut self, text: &str, start: Position, end: Position) -> NameId {
        self.make_name(vec![(text.to_owned(), start)], start, end)
    }

    /// Parses a dotted name (`a.b.c`, or `*` in import lists). Returns the
    /// name (when one was there), plus the first token after it. `None`
    /// propagates stream exhaustion.
    fn parse_dot_name(
        &mut self,
        pre: Option<(TokenKind, String)>,
    ) -> Option<(Option<NameId>, TokenKind, String)> {
        self.trailing_dot = false;
        let (mut kind, mut tok) = match pre {
            Some(pre) => pre,
            None => self.advance()?,
        };
        if kind != TokenKind::Name && tok != "*" {
            return Some((None, kind, tok));
        }

        let mut parts = vec![(tok.clone(), self.start_pos)];
        self.temp_used_names.push(tok.clone());
        let first_pos = self.start_pos;
        loop {
            let (next_kind, next_tok) = self.advance()?;
            kind = next_kind;
            tok = next_tok;
            if tok != "." {
                break;
            }
            let (next_kind, next_tok) = self.advance()?;
            kind = next_kind;
            tok = next_tok;
            if kind != TokenKind::Name {
                self.trailing_dot = true;
                break;
            }
            parts.push((tok.clone(), self.start_pos));
            self.temp_used_names.push(tok.clone());
        }

        let name = self.make_name(parts, first_pos, self.end_pos);
        Some((Some(name), kind, tok))
    }

    // --- bookkeeping shared by statements and imports ----------------------

    /// Flushes `used_texts` into `used_names` and runs the cursor check: the
    /// statement wins when the cursor is inside it, and a later candidate
    /// replaces an earlier one only when the cursor sits on one of its
    /// defined names (imports are split into several nodes).
    fn check_user_stmt(&mut self, simple: NodeId, used_texts: Vec<String>) {
        for text in used_texts {
            self.module.used_names.entry(text).or_default().insert(simple);
        }

        let Some(user_pos) = self.user_position else {
            return;
        };
        if !(self.module.start_pos(simple) <= user_pos && user_pos <= self.module.end_pos(simple)) {
            return;
        }
        if self.user_stmt.is_some() {
            for name in self.defined_names_of(simple) {
                if self.module.name_start_pos(name) < user_pos && user_pos <= self.module.name_end_pos(name) {
                    self.user_stmt = Some(simple);
                }
            }
        } else {
            self.user_stmt = Some(simple);
        }
    }

    fn defined_names_of(&self, id: NodeId) -> Vec<NameId> {
        match &self.module.node(id).kind {
            NodeKind::Import(_) => self.module.import_defined_names(id),
            _ => self
                .module
                .node(id)
                .statement_data()
                .map(|data| data.set_vars.clone())
                .unwrap_or_default(),
        }
    }

    // --- statement collection ----------------------------------------------

    /// Collects one statement. Returns the statement (or `None` when the
    /// tokens amounted to nothing) and the terminating token text; the outer
    /// `None` propagates stream exhaustion at statement start.
    fn parse_statement(
        &mut self,
        pre: Option<(TokenKind, String)>,
        added_breaks: &[&str],
        as_param: bool,
    ) -> Option<(Option<NodeId>, String)> {
        let mut code = String::new();
        let mut set_vars: Vec<NameId> = Vec::new();
        let mut used_funcs: Vec<NameId> = Vec::new();
        let mut used_vars: Vec<NameId> = Vec::new();
        let mut level: i32 = 0;

        let (mut kind, mut tok) = match pre {
            Some(pre) => pre,
            None => self.advance()?,
        };
        while kind == TokenKind::Comment {
            // drop the comment and the line end after it
            self.advance()?;
            let (next_kind, next_tok) = self.advance()?;
            kind = next_kind;
            tok = next_tok;
        }

        let first_pos = self.start_pos;
        let mut breaks: Vec<&str> = vec!["\n", ":", ")"];
        breaks.extend_from_slice(added_breaks);

        let mut tok_list: Vec<StmtToken> = Vec::new();
        let mut advanced = false;
        // identifier texts collected by nested statement parses are drained
        // by those parses; only this statement's own names stay past the mark
        let temp_mark = self.temp_used_names.len();

        'collect: loop {
            if ALWAYS_BREAK.contains(&tok.as_str())
                || NOT_FIRST_BREAK.contains(&tok.as_str()) && tok_list.is_empty()
                || breaks.contains(&tok.as_str()) && level <= 0
            {
                break;
            }

            tok_list.push(StmtToken::Tok {
                kind,
                text: tok.clone(),
                start: self.start_pos,
            });

            if tok == "as" {
                code.push_str(" as ");
                let Some((next_kind, next_tok)) = self.advance() else { break };
                advanced = true;
                kind = next_kind;
                tok = next_tok;
                if kind == TokenKind::Name && !is_keyword(&tok) {
                    let Some((name, next_kind, next_tok)) = self.parse_dot_name(Some((kind, tok.clone()))) else {
                        break;
                    };
                    kind = next_kind;
                    tok = next_tok;
                    if let Some(name) = name {
                        set_vars.push(name);
                        tok_list.push(StmtToken::Name(name));
                        push_spaced(&mut code, &self.module.name(name).get_code());
                    }
                }
                continue;
            }

            if tok == "lambda" {
                let lambda_start = self.start_pos;
                let mut params: Vec<NodeId> = Vec::new();
                let mut lambda_tok = tok.clone();
                while lambda_tok != ":" {
                    let Some((param, next_tok)) = self.parse_statement(None, &[":", ","], true) else {
                        break 'collect;
                    };
                    advanced = true;
                    lambda_tok = next_tok;
                    match param {
                        Some(param) => params.push(param),
                        None => break,
                    }
                }
                if lambda_tok != ":" {
                    tok = lambda_tok;
                    kind = TokenKind::Op;
                    continue;
                }

                let lambda = self.alloc_lambda(lambda_start, params);
                let Some((ret, next_tok)) = self.parse_statement(None, &[","], false) else {
                    break 'collect;
                };
                tok = next_tok;
                kind = TokenKind::Op;
                if let Some(ret) = ret {
                    self.module.set_parent(ret, lambda);
                    if let Some(func) = self.module.node_mut(lambda).function_data_mut() {
                        func.returns.push(ret);
                    }
                }
                self.module.node_mut(lambda).parent = Some(self.scope);
                self.module.node_mut(lambda).end = self.end_pos;
                *tok_list.last_mut().expect("lambda token pushed above") = StmtToken::Lambda(lambda);
                let rendered = self.module.get_code(lambda);
                push_spaced(&mut code, rendered.trim_end_matches('\n'));
                continue;
            }

            if kind == TokenKind::Name && !is_keyword(&tok) {
                let Some((name, next_kind, next_tok)) = self.parse_dot_name(Some((kind, tok.clone()))) else {
                    break;
                };
                advanced = true;
                kind = next_kind;
                tok = next_tok;
                tok_list.pop();
                if let Some(name) = name {
                    tok_list.push(StmtToken::Name(name));
                    if tok == "(" {
                        used_funcs.push(name);
                    } else {
                        used_vars.push(name);
                    }
                    push_spaced(&mut code, &self.module.name(name).get_code());
                }
                continue;
            }

            if tok == "for" && kind == TokenKind::Name {
                // A comprehension: parse the middle and the in-clause, then
                // splice everything since the opening bracket into one token.
                let Some((middle, next_tok)) = self.parse_statement(None, &["in"], false) else {
                    break 'collect;
                };
                advanced = true;
                if next_tok != "in" || middle.is_none() {
                    match middle {
                        None => level -= 1,
                        Some(middle) => self.module.node_mut(middle).parent = Some(self.scope),
                    }
                    log::warn!("list comprehension formatting @{}", self.start_pos.line);
                    tok = next_tok;
                    kind = TokenKind::Op;
                    continue;
                }
                let middle = middle.expect("checked above");

                let closers = [")", "]"];
                let Some((in_clause, next_tok)) = self.parse_statement(None, &closers, false) else {
                    break 'collect;
                };
                if !closers.contains(&next_tok.as_str()) || in_clause.is_none() {
                    self.module.node_mut(middle).parent = Some(self.scope);
                    match in_clause {
                        None => self.push_back_current(),
                        Some(in_clause) => self.module.node_mut(in_clause).parent = Some(self.scope),
                    }
                    log::warn!("list comprehension in_clause {next_tok:?}@{}", self.start_pos.line);
                    tok = next_tok;
                    kind = TokenKind::Op;
                    continue;
                }
                let in_clause = in_clause.expect("checked above");

                let (kept, moved) = split_comprehension(tok_list);
                tok_list = kept;
                let src = self.render_tokens(&moved);
                // the moved names were collected for this statement; they now
                // belong to the comprehension's result statement
                let moved_name_count = moved
                    .iter()
                    .filter(|t| matches!(t, StmtToken::Name(_)))
                    .count();
                let split_at = self.temp_used_names.len().saturating_sub(moved_name_count);
                let moved_texts = self.temp_used_names.split_off(split_at);
                let result_stmt = self.alloc_statement(
                    StatementData {
                        code: src,
                        token_list: moved,
                        set_vars: Vec::new(),
                        used_vars: Vec::new(),
                        used_funcs: Vec::new(),
                        calls: OnceCell::new(),
                    },
                    first_pos,
                    self.end_pos,
                    false,
                );
                for stmt in [result_stmt, middle, in_clause] {
                    self.module.node_mut(stmt).parent = Some(self.scope);
                }
                for text in moved_texts {
                    self.module.used_names.entry(text).or_default().insert(result_stmt);
                }
                let comp = self.module.add_comp(ListComprehension {
                    stmt: result_stmt,
                    middle,
                    input: in_clause,
                });
                tok_list.push(StmtToken::ListComp(comp));
                code = self.render_tokens(&tok_list);
                // the closer that ended the in-clause still belongs to this
                // statement; reprocess it normally
                tok = next_tok;
                kind = TokenKind::Op;
                continue;
            }

            if is_assignment_token(&tok) {
                if level == 0 {
                    set_vars.append(&mut used_vars);
                }
            } else if matches!(tok.as_str(), "{" | "(" | "[") {
                level += 1;
            } else if matches!(tok.as_str(), "}" | ")" | "]") {
                level -= 1;
            }

            match kind {
                // only keywords reach this point as names
                TokenKind::Name => push_keyword(&mut code, &tok),
                TokenKind::Number | TokenKind::String => push_spaced(&mut code, &tok),
                _ => code.push_str(&tok),
            }

            let Some((next_kind, next_tok)) = self.advance() else { break };
            advanced = true;
            kind = next_kind;
            tok = next_tok;
        }

        if code.is_empty() {
            return Some((None, tok));
        }

        if self.freshscope
            && !self.no_docstr
            && !as_param
            && tok_list.len() == 1
            && matches!(tok_list.first(), Some(StmtToken::Tok { kind: TokenKind::String, .. }))
        {
            if let Some(StmtToken::Tok { text, .. }) = tok_list.first() {
                let text = text.clone();
                self.module.add_docstr(self.scope, &text);
            }
            return Some((None, tok));
        }

        let data = StatementData {
            code,
            token_list: tok_list,
            set_vars,
            used_vars,
            used_funcs,
            calls: OnceCell::new(),
        };
        let stmt = self.alloc_statement(data, first_pos, self.end_pos, as_param);
        let used_texts = self.temp_used_names.split_off(temp_mark.min(self.temp_used_names.len()));
        self.check_user_stmt(stmt, used_texts);

        if (ALWAYS_BREAK.contains(&tok.as_str()) || NOT_FIRST_BREAK.contains(&tok.as_str())) && advanced {
            self.push_back_current();
        }
        Some((Some(stmt), tok))
    }

    /// Materializes a statement (or param) node, parents its names, and
    /// removes execution-only names from the set vars.
    fn alloc_statement(&mut self, mut data: StatementData, start: Position, end: Position, as_param: bool) -> NodeId {
        data.set_vars = remove_executions_from_set_vars(std::mem::take(&mut data.set_vars), &data.token_list);
        let names: Vec<NameId> = data
            .set_vars
            .iter()
            .chain(data.used_funcs.iter())
            .chain(data.used_vars.iter())
            .copied()
            .collect();
        let kind = if as_param {
            NodeKind::Param(ParamData {
                stmt: data,
                position_nr: 0,
                annotation_stmt: None,
                parent_function: None,
                is_generated: false,
            })
        } else {
            NodeKind::Statement(data)
        };
        let id = self.module.alloc(Node {
            start,
            end,
            parent: None,
            kind,
        });
        for name in names {
            self.module.name_mut(name).parent = Some(id);
        }
        id
    }

    fn alloc_lambda(&mut self, start: Position, params: Vec<NodeId>) -> NodeId {
        let lambda = self.module.alloc(Node {
            start,
            end: start,
            parent: None,
            kind: NodeKind::Lambda(FunctionData {
                name: None,
                params: params.clone(),
                returns: Vec::new(),
                decorators: Vec::new(),
                annotation: None,
                is_generator: false,
                scope: ScopeData::default(),
            }),
        });
        for (nr, param) in params.into_iter().enumerate() {
            self.module.set_parent(param, lambda);
            if let NodeKind::Param(param_data) = &mut self.module.node_mut(param).kind {
                param_data.position_nr = nr as u32;
                param_data.parent_function = Some(lambda);
            }
        }
        lambda
    }

    fn render_tokens(&self, tokens: &[StmtToken]) -> String {
        let mut out = String::new();
        for token in tokens {
            match token {
                StmtToken::Tok { text, .. } => out.push_str(text),
                StmtToken::Name(name) => out.push_str(&self.module.name(*name).get_code()),
                StmtToken::ListComp(comp) => out.push_str(&self.module.comp_code(*comp)),
                StmtToken::Lambda(lambda) => out.push_str(&self.module.get_code(*lambda)),
            }
        }
        out
    }

    // --- headers ------------------------------------------------------------

    /// Parses a parenthesized definition list: function params or class
    /// supers. Params without any name are usually syntax errors and get
    /// dropped.
    fn parse_parentheses(&mut self) -> Option<Vec<NodeId>> {
        let mut named: Vec<NodeId> = Vec::new();
        let mut position = 0u32;
        let mut tok = String::new();
        while tok != ")" && tok != ":" {
            let (param, next_tok) = self.parse_statement(None, &[",", ":"], true)?;
            tok = next_tok;
            if let Some(param) = param
                && tok == ":"
            {
                let (annotation, next_tok) = self.parse_statement(None, &[",", ":"], false)?;
                tok = next_tok;
                if let Some(annotation) = annotation {
                    self.module.set_parent(annotation, param);
                    if let NodeKind::Param(param_data) = &mut self.module.node_mut(param).kind {
                        param_data.annotation_stmt = Some(annotation);
                    }
                }
            }
            if let Some(param) = param {
                let has_names = self
                    .module
                    .node(param)
                    .statement_data()
                    .is_some_and(|data| !data.set_vars.is_empty() || !data.used_vars.is_empty());
                if has_names {
                    if let NodeKind::Param(param_data) = &mut self.module.node_mut(param).kind {
                        param_data.position_nr = position;
                    }
                    named.push(param);
                    position += 1;
                }
            }
        }
        Some(named)
    }

    /// Parses the header after `def`. `Some(None)` is a syntax error; the
    /// outer `None` propagates exhaustion.
    fn parse_function(&mut self) -> Option<Option<NodeId>> {
        let first_pos = self.start_pos;
        let (kind, fname) = self.advance()?;
        if kind != TokenKind::Name {
            return Some(None);
        }
        let name = self.single_name(&fname, self.start_pos, self.end_pos);

        let (_, open) = self.advance()?;
        if open != "(" {
            return Some(None);
        }
        let params = self.parse_parentheses()?;

        let (_, mut colon) = self.advance()?;
        let mut annotation = None;
        if colon == "-" || colon == "->" {
            if colon == "-" {
                // a tokenizer that split the arrow
                let (_, gt) = self.advance()?;
                if gt != ">" {
                    return Some(None);
                }
            }
            let (ann, next_tok) = self.parse_statement(None, &[":"], false)?;
            annotation = ann;
            colon = next_tok;
        }
        if colon != ":" {
            return Some(None);
        }

        let func = self.module.alloc(Node {
            start: first_pos,
            end: first_pos,
            parent: None,
            kind: NodeKind::Function(FunctionData {
                name: Some(name),
                params: params.clone(),
                returns: Vec::new(),
                decorators: Vec::new(),
                annotation,
                is_generator: false,
                scope: ScopeData::default(),
            }),
        });
        self.module.name_mut(name).parent = Some(func);
        for param in params {
            self.module.set_parent(param, func);
            if let NodeKind::Param(param_data) = &mut self.module.node_mut(param).kind {
                param_data.parent_function = Some(func);
            }
        }
        if let Some(annotation) = annotation {
            self.module.set_parent(annotation, func);
        }

        // two-line headers: the cursor may sit between `def` and the colon
        if self.user_scope.is_some() && self.user_position.is_some_and(|pos| pos > first_pos) {
            self.user_scope = Some(func);
        }
        Some(Some(func))
    }

    /// Parses the header after `class`.
    fn parse_class(&mut self) -> Option<Option<NodeId>> {
        let first_pos = self.start_pos;
        let (kind, cname) = self.advance()?;
        if kind != TokenKind::Name {
            log::warn!("class: syntax err, token is not a name@{} ({kind}: {cname})", self.start_pos.line);
            return Some(None);
        }
        let name = self.single_name(&cname, self.start_pos, self.end_pos);

        let mut supers = Vec::new();
        let (_, mut next) = self.advance()?;
        if next == "(" {
            supers = self.parse_parentheses()?;
            let (_, after) = self.advance()?;
            next = after;
        }
        if next != ":" {
            log::warn!("class syntax: {cname}@{}", self.start_pos.line);
            return Some(None);
        }

        let class = self.module.alloc(Node {
            start: first_pos,
            end: first_pos,
            parent: None,
            kind: NodeKind::Class(ClassData {
                name,
                supers: supers.clone(),
                decorators: Vec::new(),
                scope: ScopeData::default(),
            }),
        });
        self.module.name_mut(name).parent = Some(class);
        for super_stmt in supers {
            self.module.set_parent(super_stmt, class);
        }

        if self.user_scope.is_some() && self.user_position.is_some_and(|pos| pos > first_pos) {
            self.user_scope = Some(class);
        }
        Some(Some(class))
    }

    // --- imports ------------------------------------------------------------

    /// Parses the name list of an import statement: dotted names with
    /// optional aliases across commas, tolerating one pair of parentheses.
    fn parse_import_list(&mut self) -> Option<Vec<ImportListEntry>> {
        let mut entries = Vec::new();
        let mut brackets = false;
        loop {
            let mut defunct = false;
            let (mut kind, mut tok) = self.advance()?;
            if kind == TokenKind::EndMarker {
                break;
            }
            if brackets && tok == "\n" {
                let (next_kind, next_tok) = self.advance()?;
                kind = next_kind;
                tok = next_tok;
            }
            if tok == "(" {
                brackets = true;
                let (next_kind, next_tok) = self.advance()?;
                kind = next_kind;
                tok = next_tok;
            }
            let (name, next_kind, next_tok) = self.parse_dot_name(Some((kind, tok)))?;
            let trailing_dot = self.trailing_dot;
            kind = next_kind;
            tok = next_tok;
            if name.is_none() {
                defunct = true;
            }
            let mut alias = None;
            if tok == "as" {
                let (alias_name, next_kind, next_tok) = self.parse_dot_name(None)?;
                alias = alias_name;
                kind = next_kind;
                tok = next_tok;
            }
            entries.push(ImportListEntry {
                name,
                alias,
                defunct,
                trailing_dot,
            });

            while !is_import_list_boundary(&tok) {
                if kind == TokenKind::EndMarker {
                    break;
                }
                let (next_kind, next_tok) = self.advance()?;
                kind = next_kind;
                tok = next_tok;
            }
            if !(tok == "," || brackets && tok == "\n") {
                break;
            }
        }
        Some(entries)
    }

    /// Emits one Import node.
    #[expect(clippy::too_many_arguments, reason = "one emission point for both import forms")]
    fn emit_import(
        &mut self,
        first_pos: Position,
        namespace: Option<NameId>,
        alias: Option<NameId>,
        from_ns: Option<NameId>,
        star: bool,
        relative_count: u32,
        defunct: bool,
    ) -> NodeId {
        let import = self.module.alloc(Node {
            start: first_pos,
            end: self.end_pos,
            parent: None,
            kind: NodeKind::Import(ImportData {
                namespace,
                alias,
                from_ns,
                star,
                relative_count,
                defunct,
                defined_name: None,
            }),
        });
        for name in [namespace, alias, from_ns].into_iter().flatten() {
            self.module.name_mut(name).parent = Some(import);
        }
        // `import a.b.c` binds `a`; materialize that name once, here
        if alias.is_none()
            && let Some(namespace) = namespace
            && self.module.name(namespace).parts.len() > 1
        {
            let first_part = self.module.name(namespace).parts[0].clone();
            let start = first_part.start;
            let end = first_part.end();
            let defined = self.make_name(vec![(first_part.text, start)], start, end);
            self.module.name_mut(defined).parent = Some(import);
            if let NodeKind::Import(data) = &mut self.module.node_mut(import).kind {
                data.defined_name = Some(defined);
            }
        }
        import
    }

    fn parse_import(&mut self) -> Option<()> {
        let first_pos = self.start_pos;
        let import_kw = ErrorNode::Keyword {
            text: "import".to_owned(),
            start: self.start_pos,
            end: self.end_pos,
        };
        let entries = self.parse_import_list()?;
        let mut stack_nodes = vec![import_kw];
        let mut any_broken = false;
        if entries.is_empty() {
            // nothing after `import`: keep a defunct node for cursor lookups,
            // but out of the scope's import list
            let import = self.emit_import(first_pos, None, None, None, false, 0, true);
            let root = self.module.root();
            self.module.set_parent(import, root);
            let used_texts = std::mem::take(&mut self.temp_used_names);
            self.check_user_stmt(import, used_texts);
            any_broken = true;
        }
        for entry in entries {
            let import = self.emit_import(first_pos, entry.name, entry.alias, None, false, 0, entry.defunct);
            let used_texts = std::mem::take(&mut self.temp_used_names);
            self.check_user_stmt(import, used_texts);
            self.module.add_import(self.scope, import);
            if let Some(name) = entry.name {
                stack_nodes.push(ErrorNode::DottedName {
                    name,
                    trailing_dot: entry.trailing_dot,
                });
            }
            any_broken |= entry.defunct || entry.trailing_dot;
        }
        if any_broken {
            self.module.error_statement_stacks.push(ErrorStatementStack {
                kind: ImportErrorKind::ImportName,
                first_pos,
                next_start_pos: self.end_pos,
                stack: stack_nodes,
            });
        }
        self.freshscope = false;
        Some(())
    }

    fn parse_from_import(&mut self) -> Option<()> {
        let first_pos = self.start_pos;
        let mut defunct = false;
        let mut relative_count = 0u32;
        let mut stack_nodes: Vec<ErrorNode> = Vec::new();

        let (mut kind, mut tok);
        loop {
            let (next_kind, next_tok) = self.advance()?;
            kind = next_kind;
            tok = next_tok;
            let dots = match tok.as_str() {
                "." => 1,
                "..." => 3,
                _ => break,
            };
            relative_count += dots;
            stack_nodes.push(ErrorNode::Dots {
                count: dots,
                start: self.start_pos,
            });
        }

        let (mut from_ns, _, mut tok) = self.parse_dot_name(Some((kind, tok)))?;
        let from_trailing = self.trailing_dot;
        if relative_count > 0
            && let Some(name) = from_ns
            && self.module.name(name).get_code() == "import"
        {
            // `from .. import x`: the keyword was swallowed as a name
            self.push_back_current();
            tok = "import".to_owned();
            from_ns = None;
        }
        if let Some(name) = from_ns {
            stack_nodes.push(ErrorNode::DottedName {
                name,
                trailing_dot: from_trailing,
            });
        }
        if from_ns.is_none() && relative_count == 0 || tok != "import" {
            log::warn!("from: syntax error@{}", self.start_pos.line);
            defunct = true;
            if tok != "import" {
                self.push_back_current();
            }
        }
        if tok == "import" {
            stack_nodes.push(ErrorNode::Keyword {
                text: "import".to_owned(),
                start: self.start_pos,
                end: self.end_pos,
            });
        }

        let entries = self.parse_import_list()?;
        let mut any_broken = defunct || entries.is_empty() || from_trailing;
        for entry in entries {
            let star = entry
                .name
                .is_some_and(|n| self.module.name(n).parts.first().is_some_and(|p| p.text == "*"));
            let namespace = if star { None } else { entry.name };
            let import = self.emit_import(
                first_pos,
                namespace,
                entry.alias,
                from_ns,
                star,
                relative_count,
                defunct || entry.defunct,
            );
            let used_texts = std::mem::take(&mut self.temp_used_names);
            self.check_user_stmt(import, used_texts);
            self.module.add_import(self.scope, import);
            if let Some(name) = namespace {
                stack_nodes.push(ErrorNode::DottedName {
                    name,
                    trailing_dot: entry.trailing_dot,
                });
            }
            any_broken |= entry.defunct || entry.trailing_dot;
        }
        if any_broken {
            self.module.error_statement_stacks.push(ErrorStatementStack {
                kind: ImportErrorKind::ImportFrom,
                first_pos,
                next_start_pos: self.end_pos,
                stack: stack_nodes,
            });
        }
        self.freshscope = false;
        Some(())
    }

    // --- flows --------------------------------------------------------------

    fn parse_for_flow(&mut self) -> Option<()> {
        let first_pos = self.start_pos;
        let use_parent = self.module.effective_parent(self.scope);
        let (set_stmt, tok) = self.parse_statement(None, &["in"], false)?;
        if tok != "in" {
            log::warn!("syntax err, for flow incomplete @{}", self.start_pos.line);
            if let Some(set_stmt) = set_stmt {
                self.module.set_parent(set_stmt, use_parent);
            }
            return Some(());
        }

        let (iterable, tok) = self.parse_statement(None, &[], false)?;
        if tok != ":" || set_stmt.is_none() {
            log::warn!("syntax err, for flow started @{}", self.start_pos.line);
            for orphan in [iterable, set_stmt].into_iter().flatten() {
                self.module.set_parent(orphan, use_parent);
            }
            return Some(());
        }
        let set_stmt = set_stmt.expect("checked above");

        let set_vars = self
            .module
            .node(set_stmt)
            .statement_data()
            .map(|data| data.used_vars.clone())
            .unwrap_or_default();
        let flow = self.module.alloc(Node {
            start: first_pos,
            end: first_pos,
            parent: None,
            kind: NodeKind::ForFlow(ForFlowData {
                flow: FlowData {
                    command: FlowKind::For,
                    inits: iterable.into_iter().collect(),
                    next: None,
                    scope: ScopeData::default(),
                },
                set_stmt,
                set_vars: set_vars.clone(),
                is_list_comp: false,
            }),
        });
        self.module.set_parent(set_stmt, flow);
        for name in set_vars {
            self.module.name_mut(name).parent = Some(flow);
        }
        if let Some(iterable) = iterable {
            self.module.set_parent(iterable, flow);
        }
        self.module.add_statement(self.scope, flow);
        self.scope = flow;
        Some(())
    }

    fn parse_flow(&mut self, command: FlowKind) -> Option<()> {
        let first_pos = self.start_pos;
        let use_parent = self.module.effective_parent(self.scope);
        let added: &[&str] = if matches!(command, FlowKind::Except | FlowKind::With) {
            &[","]
        } else {
            &[]
        };

        let mut inits: Vec<NodeId> = Vec::new();
        let mut first = true;
        let mut tok = String::new();
        while first || command == FlowKind::With && tok != ":" && tok != "\n" {
            let (stmt, next_tok) = self.parse_statement(None, added, false)?;
            tok = next_tok;
            if let Some(stmt) = stmt {
                inits.push(stmt);
            }
            first = false;
        }

        if tok != ":" {
            log::warn!("syntax err, flow started @{}", self.start_pos.line);
            for init in inits {
                self.module.set_parent(init, use_parent);
            }
            return Some(());
        }

        let flow = self.module.alloc(Node {
            start: first_pos,
            end: first_pos,
            parent: None,
            kind: NodeKind::Flow(FlowData {
                command,
                inits: inits.clone(),
                next: None,
                scope: ScopeData::default(),
            }),
        });
        for init in inits {
            self.module.set_parent(init, flow);
        }

        if command.is_extension() {
            // attach to the latest sibling that can chain; otherwise the tail
            // becomes a statement of its own
            let last = self.module.statements(self.scope).last().copied();
            match last {
                Some(head) if self.module.node(head).is_flow() => {
                    self.module.set_next_flow(head, flow);
                }
                _ => {
                    self.module.add_statement(self.scope, flow);
                }
            }
        } else {
            self.module.add_statement(self.scope, flow);
        }
        self.scope = flow;
        Some(())
    }

    // --- the main loop ------------------------------------------------------

    fn pop_scope(&mut self) {
        let root = self.module.root();
        let parent = self.module.node(self.scope).parent;
        self.scope = match parent {
            Some(parent) if self.module.is_stitched_top(parent) => root,
            Some(parent) => parent,
            None => root,
        };
    }

    fn parse(&mut self) {
        loop {
            let Some((mut kind, mut tok)) = self.advance() else { return };
            self.temp_used_names.clear();

            // dedents close scopes
            while kind == TokenKind::Dedent && self.scope != self.module.root() {
                let Some((next_kind, next_tok)) = self.advance() else { return };
                kind = next_kind;
                tok = next_tok;
                if self.start_pos.column <= self.module.node(self.scope).start.column {
                    self.module.node_mut(self.scope).end = self.start_pos;
                    self.pop_scope();
                }
            }

            // unindented code without a dedent token happens on syntax
            // errors; only names and opening brackets are worth it
            while self.start_pos.column <= self.module.node(self.scope).start.column
                && (kind == TokenKind::Name || tok == "(" || tok == "[")
                && self.scope != self.module.root()
            {
                self.module.node_mut(self.scope).end = self.start_pos;
                self.pop_scope();
            }

            let use_parent = self.module.effective_parent(self.scope);

            match tok.as_str() {
                "def" => {
                    let Some(func) = self.parse_function() else { return };
                    let Some(func) = func else {
                        log::warn!("function: syntax error@{}", self.start_pos.line);
                        continue;
                    };
                    self.freshscope = true;
                    let decorators = std::mem::take(&mut self.decorators);
                    self.scope = self.module.add_scope(self.scope, func, decorators);
                }
                "class" => {
                    let Some(class) = self.parse_class() else { return };
                    let Some(class) = class else {
                        log::warn!("class: syntax error@{}", self.start_pos.line);
                        continue;
                    };
                    self.freshscope = true;
                    let decorators = std::mem::take(&mut self.decorators);
                    self.scope = self.module.add_scope(self.scope, class, decorators);
                }
                "import" => {
                    let Some(()) = self.parse_import() else { return };
                }
                "from" => {
                    let Some(()) = self.parse_from_import() else { return };
                }
                "for" => {
                    let Some(()) = self.parse_for_flow() else { return };
                }
                "if" | "while" | "try" | "with" | "else" | "elif" | "except" | "finally" => {
                    let command = FlowKind::from_str(&tok).expect("token text matches a flow kind");
                    let Some(()) = self.parse_flow(command) else { return };
                }
                "return" | "yield" => {
                    let keyword_pos = self.start_pos;
                    self.freshscope = false;
                    let func = self.module.enclosing_function(self.scope);
                    if tok == "yield"
                        && let Some(func) = func
                        && let Some(data) = self.module.node_mut(func).function_data_mut()
                    {
                        data.is_generator = true;
                    }
                    let Some((stmt, _)) = self.parse_statement(None, &[], false) else { return };
                    if let Some(stmt) = stmt {
                        self.module.set_parent(stmt, use_parent);
                        match func {
                            Some(func) => {
                                self.module.node_mut(stmt).start = keyword_pos;
                                if let Some(data) = self.module.node_mut(func).function_data_mut() {
                                    data.returns.push(stmt);
                                }
                            }
                            None => log::warn!("return in non-function"),
                        }
                    }
                }
                "global" => {
                    let Some((stmt, _)) = self.parse_statement(Some((kind, tok.clone())), &[], false) else {
                        return;
                    };
                    if let Some(stmt) = stmt {
                        self.module.add_statement(self.scope, stmt);
                        let used = self
                            .module
                            .node(stmt)
                            .statement_data()
                            .map(|data| data.used_vars.clone())
                            .unwrap_or_default();
                        for name in used {
                            // globals matter at the top; no parent is set
                            self.module.add_global(name);
                        }
                    }
                }
                "@" => {
                    let Some((stmt, _)) = self.parse_statement(None, &[], false) else { return };
                    if let Some(stmt) = stmt {
                        self.decorators.push(stmt);
                    }
                }
                "pass" => {}
                "assert" => {
                    let Some((stmt, _)) = self.parse_statement(None, &[], false) else { return };
                    if let Some(stmt) = stmt {
                        self.module.set_parent(stmt, use_parent);
                        if let Some(scope_data) = self.module.node_mut(self.scope).scope_data_mut() {
                            scope_data.asserts.push(stmt);
                        }
                    }
                }
                _ if matches!(kind, TokenKind::Name | TokenKind::String | TokenKind::Number)
                    || matches!(tok.as_str(), "{" | "[" | "(" | "`") =>
                {
                    let Some((stmt, _)) = self.parse_statement(Some((kind, tok.clone())), &[], false) else {
                        return;
                    };
                    if let Some(stmt) = stmt {
                        self.module.add_statement(self.scope, stmt);
                    }
                    self.freshscope = false;
                }
                _ => {
                    if !matches!(
                        kind,
                        TokenKind::Comment
                            | TokenKind::Indent
                            | TokenKind::Dedent
                            | TokenKind::Newline
                            | TokenKind::Nl
                            | TokenKind::EndMarker
                    ) {
                        log::debug!("token not classified: {tok:?} {kind} @{}", self.start_pos.line);
                    }
                }
            }
        }
    }
}

/// One entry of an import list: `name [as alias]`.
struct ImportListEntry {
    name: Option<NameId>,
    alias: Option<NameId>,
    defunct: bool,
    trailing_dot: bool,
}

/// Tokens that end one entry of an import list.
fn is_import_list_boundary(tok: &str) -> bool {
    matches!(tok, "," | ";" | "\n" | ")") || is_keyword(tok) && tok != "as"
}

/// An assignment operator: ends with `=` but is not a comparison.
fn is_assignment_token(tok: &str) -> bool {
    tok.ends_with('=') && !matches!(tok, ">=" | "<=" | "==" | "!=")
}

/// Appends a token with a separating space when the code so far ends in a
/// word, digit or quote character.
fn push_spaced(code: &mut String, tok: &str) {
    if let Some(last) = code.chars().last()
        && (last.is_alphanumeric() || matches!(last, '_' | '\'' | '"'))
    {
        code.push(' ');
    }
    code.push_str(tok);
}

/// Keywords always separate from what precedes them, even after a bracket.
fn push_keyword(code: &mut String, tok: &str) {
    if !code.is_empty() && !code.ends_with(' ') {
        code.push(' ');
    }
    code.push_str(tok);
}

/// Removes names that are only used to index into an execution from the set
/// vars: in `b[a] = 3`, `a` indexes the dict and is not assigned.
fn remove_executions_from_set_vars(set_vars: Vec<NameId>, token_list: &[StmtToken]) -> Vec<NameId> {
    if set_vars.is_empty() {
        return set_vars;
    }
    let mut removed: Vec<NameId> = Vec::new();
    let mut last_was_name = false;
    let mut in_execution = 0u32;
    for token in token_list {
        match token {
            StmtToken::Name(name) => {
                if !set_vars.contains(name) || removed.contains(name) {
                    break;
                }
                if in_execution > 0 {
                    removed.push(*name);
                }
                last_was_name = true;
            }
            StmtToken::Tok { text, .. } => {
                if matches!(text.as_str(), "(" | "[") && last_was_name {
                    in_execution += 1;
                } else if matches!(text.as_str(), ")" | "]") && in_execution > 0 {
                    in_execution -= 1;
                }
                last_was_name = false;
            }
            _ => last_was_name = false,
        }
    }
    set_vars.into_iter().filter(|name| !removed.contains(name)).collect()
}

/// Splits a token list at the bracket that opened the comprehension:
/// everything after it (except the trailing `for`) becomes the result
/// statement's tokens.
fn split_comprehension(tok_list: Vec<StmtToken>) -> (Vec<StmtToken>, Vec<StmtToken>) {
    let mut depth: i32 = 0;
    let mut from_end = 0usize;
    let mut found = false;
    for token in tok_list.iter().rev() {
        if let StmtToken::Tok { text, .. } = token {
            if matches!(text.as_str(), ")" | "]" | "}") {
                depth -= 1;
            } else if matches!(text.as_str(), "(" | "[" | "{") {
                depth += 1;
            }
        }
        from_end += 1;
        if depth > 0 {
            found = true;
            break;
        }
    }

    let mut kept = tok_list;
    if !found {
        // no bracket in sight: a nested comprehension owns everything
        let mut moved = std::mem::take(&mut kept);
        moved.pop();
        return (kept, moved);
    }
    let split_at = kept.len() - from_end + 1;
    let mut moved = kept.split_off(split_at);
    moved.pop();
    (kept, moved)
}

#[cfg(test)]
mod tests {
    use super::split_comprehension;
    use crate::{position::Position, token::TokenKind, tree::StmtToken};

    fn tok(text: &str) -> StmtToken {
        StmtToken::Tok {
            kind: TokenKind::Op,
            text: text.to_owned(),
            start: Position::new(1, 0),
        }
    }

    #[test]
    fn splits_at_opening_bracket() {
        // in `x = [ i for`, the `i` moves and the bracket stays
        let list = vec![tok("x"), tok("="), tok("["), tok("i"), tok("for")];
        let (kept, moved) = split_comprehension(list);
        assert_eq!(kept.len(), 3);
        assert_eq!(moved.len(), 1);
    }

    #[test]
    fn without_bracket_everything_moves() {
        let list = vec![tok("i"), tok("for")];
        let (kept, moved) = split_comprehension(list);
        assert!(kept.is_empty());
        assert_eq!(moved.len(), 1);
    }
}
