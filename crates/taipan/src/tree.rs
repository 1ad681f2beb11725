//! The parse tree.
//!
//! All nodes live in one arena owned by [`Module`]; a [`NodeId`] indexes it.
//! Ownership is strictly the arena's, so the mutable `parent` back-links can
//! never form an ownership cycle. The `effective_parent` redirect lets the
//! module node hand out a different id (the top module of a stitched parse)
//! when it parents children.
//!
//! Scopes are the backbone: Module, Class, Function, Lambda and the flow
//! constructs all carry a [`ScopeData`] with subscopes, imports, statements
//! and asserts in source order. Plain statements retain their token list and
//! convert it to a call tree lazily, see [`crate::calls`].

use std::cell::OnceCell;

use indexmap::{IndexMap, IndexSet};
use smallvec::SmallVec;

use crate::{
    calls::AssignmentCalls,
    helpers::ErrorStatementStack,
    position::Position,
    token::TokenKind,
};

/// Index of a node in a module's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a [`Name`] in a module's name table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct NameId(u32);

impl NameId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of a [`ListComprehension`] in a module's comprehension table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ListCompId(u32);

impl ListCompId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// One dotted segment of a [`Name`], with its own start position.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NamePart {
    pub text: String,
    pub start: Position,
}

impl NamePart {
    /// End position: start shifted right by the part's character length.
    pub fn end(&self) -> Position {
        self.start.shifted(self.text.chars().count() as u32)
    }
}

/// A possibly dotted name such as `os.path.join`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Name {
    pub parts: SmallVec<[NamePart; 2]>,
    pub start: Position,
    pub end: Position,
    pub parent: Option<NodeId>,
}

impl Name {
    /// The parts joined with `.`.
    pub fn get_code(&self) -> String {
        let mut out = String::new();
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            out.push_str(&part.text);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// The flow commands that open (or extend) a flow scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum FlowKind {
    If,
    While,
    Try,
    With,
    For,
    Else,
    Elif,
    Except,
    Finally,
}

impl FlowKind {
    /// The commands that extend an existing flow chain instead of opening a
    /// new one.
    pub fn is_extension(self) -> bool {
        matches!(self, Self::Else | Self::Elif | Self::Except | Self::Finally)
    }
}

/// Containers every scope node shares: subscopes, imports, statements and
/// asserts in source order, plus the docstring.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ScopeData {
    pub subscopes: Vec<NodeId>,
    pub imports: Vec<NodeId>,
    pub statements: Vec<NodeId>,
    pub asserts: Vec<NodeId>,
    pub docstring: String,
}

impl ScopeData {
    pub fn is_empty(&self) -> bool {
        self.subscopes.is_empty() && self.imports.is_empty() && self.statements.is_empty()
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ClassData {
    pub name: NameId,
    /// Base-class expressions, one statement each.
    pub supers: Vec<NodeId>,
    pub decorators: Vec<NodeId>,
    pub scope: ScopeData,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FunctionData {
    /// Absent for lambdas.
    pub name: Option<NameId>,
    pub params: Vec<NodeId>,
    /// Return/yield expressions, appended in source order.
    pub returns: Vec<NodeId>,
    pub decorators: Vec<NodeId>,
    /// The `-> …` annotation, when present.
    pub annotation: Option<NodeId>,
    /// True once a `yield` was seen anywhere in the body.
    pub is_generator: bool,
    pub scope: ScopeData,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct FlowData {
    pub command: FlowKind,
    /// Conditions, context managers or exception expressions. `with` is the
    /// only command with more than one.
    pub inits: Vec<NodeId>,
    /// The chained tail: `else`, `elif`, `except` or `finally`.
    pub next: Option<NodeId>,
    pub scope: ScopeData,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ForFlowData {
    pub flow: FlowData,
    /// The statement left of `in`; its used variables become the loop's
    /// `set_vars`.
    pub set_stmt: NodeId,
    pub set_vars: Vec<NameId>,
    pub is_list_comp: bool,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ImportData {
    /// The imported dotted name; absent for `from x import *` and for
    /// defunct imports that broke before a name was read.
    pub namespace: Option<NameId>,
    pub alias: Option<NameId>,
    pub from_ns: Option<NameId>,
    pub star: bool,
    /// Number of leading dots in a `from … import`.
    pub relative_count: u32,
    /// True iff the import was syntactically broken.
    pub defunct: bool,
    /// For a dotted `import a.b.c` without alias, the name the import binds
    /// (`a`), materialized at parse time.
    pub defined_name: Option<NameId>,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct StatementData {
    /// Whitespace-normalized reproduction of the statement's source.
    pub code: String,
    pub token_list: Vec<StmtToken>,
    /// Names bound by assignment.
    pub set_vars: Vec<NameId>,
    /// Names read.
    pub used_vars: Vec<NameId>,
    /// Names immediately followed by `(`.
    pub used_funcs: Vec<NameId>,
    /// Lazily computed call/assignment tree; see [`Module::assignment_calls`].
    #[serde(skip)]
    pub(crate) calls: OnceCell<AssignmentCalls>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ParamData {
    pub stmt: StatementData,
    /// Ordinal in the parameter list.
    pub position_nr: u32,
    pub annotation_stmt: Option<NodeId>,
    pub parent_function: Option<NodeId>,
    /// Set by downstream tooling only; always false at parse time.
    pub is_generated: bool,
}

/// One retained token of a statement. Token lists are heterogeneous: plain
/// tokens, parsed names, spliced list comprehensions and inline lambdas.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum StmtToken {
    Tok {
        kind: TokenKind,
        text: String,
        start: Position,
    },
    Name(NameId),
    ListComp(ListCompId),
    Lambda(NodeId),
}

/// A list comprehension, carried as a single token inside the enclosing
/// statement: `result for iteration_var in iterable`.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ListComprehension {
    pub stmt: NodeId,
    pub middle: NodeId,
    pub input: NodeId,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    /// The root scope.
    Module(ScopeData),
    Class(ClassData),
    Function(FunctionData),
    Lambda(FunctionData),
    Flow(FlowData),
    ForFlow(ForFlowData),
    Import(ImportData),
    Statement(StatementData),
    Param(ParamData),
}

/// One arena slot: positions, the upward link and the kind payload.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Node {
    /// Raw start position; read through [`Module::start_pos`] to apply the
    /// line offset.
    pub start: Position,
    pub end: Position,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn is_scope(&self) -> bool {
        self.scope_data().is_some()
    }

    pub fn is_flow(&self) -> bool {
        matches!(self.kind, NodeKind::Flow(_) | NodeKind::ForFlow(_))
    }

    pub fn scope_data(&self) -> Option<&ScopeData> {
        match &self.kind {
            NodeKind::Module(scope) => Some(scope),
            NodeKind::Class(class) => Some(&class.scope),
            NodeKind::Function(func) | NodeKind::Lambda(func) => Some(&func.scope),
            NodeKind::Flow(flow) => Some(&flow.scope),
            NodeKind::ForFlow(for_flow) => Some(&for_flow.flow.scope),
            _ => None,
        }
    }

    pub(crate) fn scope_data_mut(&mut self) -> Option<&mut ScopeData> {
        match &mut self.kind {
            NodeKind::Module(scope) => Some(scope),
            NodeKind::Class(class) => Some(&mut class.scope),
            NodeKind::Function(func) | NodeKind::Lambda(func) => Some(&mut func.scope),
            NodeKind::Flow(flow) => Some(&mut flow.scope),
            NodeKind::ForFlow(for_flow) => Some(&mut for_flow.flow.scope),
            _ => None,
        }
    }

    pub fn flow_data(&self) -> Option<&FlowData> {
        match &self.kind {
            NodeKind::Flow(flow) => Some(flow),
            NodeKind::ForFlow(for_flow) => Some(&for_flow.flow),
            _ => None,
        }
    }

    pub(crate) fn flow_data_mut(&mut self) -> Option<&mut FlowData> {
        match &mut self.kind {
            NodeKind::Flow(flow) => Some(flow),
            NodeKind::ForFlow(for_flow) => Some(&mut for_flow.flow),
            _ => None,
        }
    }

    pub fn statement_data(&self) -> Option<&StatementData> {
        match &self.kind {
            NodeKind::Statement(stmt) => Some(stmt),
            NodeKind::Param(param) => Some(&param.stmt),
            _ => None,
        }
    }

    pub(crate) fn statement_data_mut(&mut self) -> Option<&mut StatementData> {
        match &mut self.kind {
            NodeKind::Statement(stmt) => Some(stmt),
            NodeKind::Param(param) => Some(&mut param.stmt),
            _ => None,
        }
    }

    pub fn function_data(&self) -> Option<&FunctionData> {
        match &self.kind {
            NodeKind::Function(func) | NodeKind::Lambda(func) => Some(func),
            _ => None,
        }
    }

    pub(crate) fn function_data_mut(&mut self) -> Option<&mut FunctionData> {
        match &mut self.kind {
            NodeKind::Function(func) | NodeKind::Lambda(func) => Some(func),
            _ => None,
        }
    }

    pub fn import_data(&self) -> Option<&ImportData> {
        match &self.kind {
            NodeKind::Import(import) => Some(import),
            _ => None,
        }
    }
}

/// The root of one parse: the node arena, the name and comprehension tables,
/// and the module-level accumulators.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct Module {
    nodes: Vec<Node>,
    names: Vec<Name>,
    comps: Vec<ListComprehension>,
    root: NodeId,
    /// Effective parent handed out for the root's children; differs from
    /// `root` only in stitched multi-chunk parses.
    top_root: NodeId,
    pub path: Option<String>,
    /// Added to every reported line; mutable so a wrapper can re-position a
    /// cached tree without reparsing.
    pub line_offset: u32,
    /// Names introduced by `global`, in source order.
    pub global_vars: Vec<NameId>,
    /// Identifier text to the statements that reference it, in first-use
    /// order.
    pub used_names: IndexMap<String, IndexSet<NodeId>>,
    /// Recovery records for imports abandoned mid-parse.
    pub error_statement_stacks: Vec<ErrorStatementStack>,
}

impl Module {
    /// Creates an empty module whose root scope starts at `start`.
    pub(crate) fn new(path: Option<String>, start: Position) -> Self {
        let root_node = Node {
            start,
            end: start,
            parent: None,
            kind: NodeKind::Module(ScopeData::default()),
        };
        Self {
            nodes: vec![root_node],
            names: Vec::new(),
            comps: Vec::new(),
            root: NodeId(0),
            top_root: NodeId(0),
            path,
            line_offset: 0,
            global_vars: Vec::new(),
            used_names: IndexMap::new(),
            error_statement_stacks: Vec::new(),
        }
    }

    /// Continues the arena of `top` with a fresh root scope. The new chunk's
    /// top-level children are parented to the old root, which stitches
    /// multi-chunk parses into one tree.
    pub(crate) fn stitch(top: Self, path: Option<String>, start: Position) -> Self {
        let mut module = top;
        let old_root = module.root;
        let new_root = module.alloc(Node {
            start,
            end: start,
            parent: None,
            kind: NodeKind::Module(ScopeData::default()),
        });
        module.root = new_root;
        module.top_root = old_root;
        module.path = path;
        module
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// True when `id` is the top module of a stitched parse, i.e. a node the
    /// scope cursor must never climb into.
    pub(crate) fn is_stitched_top(&self, id: NodeId) -> bool {
        id == self.top_root && self.top_root != self.root
    }

    // --- arena access -----------------------------------------------------

    pub(crate) fn alloc(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// All nodes of the arena with their ids, in allocation order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, node)| (NodeId(i as u32), node))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub(crate) fn add_name(&mut self, name: Name) -> NameId {
        let id = NameId(self.names.len() as u32);
        self.names.push(name);
        id
    }

    pub fn name(&self, id: NameId) -> &Name {
        &self.names[id.index()]
    }

    pub(crate) fn name_mut(&mut self, id: NameId) -> &mut Name {
        &mut self.names[id.index()]
    }

    pub(crate) fn add_comp(&mut self, comp: ListComprehension) -> ListCompId {
        let id = ListCompId(self.comps.len() as u32);
        self.comps.push(comp);
        id
    }

    pub fn comp(&self, id: ListCompId) -> &ListComprehension {
        &self.comps[id.index()]
    }

    // --- positions --------------------------------------------------------

    /// Start position with the module's line offset applied.
    pub fn start_pos(&self, id: NodeId) -> Position {
        self.node(id).start.with_line_offset(self.line_offset)
    }

    /// End position with the module's line offset applied.
    pub fn end_pos(&self, id: NodeId) -> Position {
        self.node(id).end.with_line_offset(self.line_offset)
    }

    pub fn name_start_pos(&self, id: NameId) -> Position {
        self.name(id).start.with_line_offset(self.line_offset)
    }

    pub fn name_end_pos(&self, id: NameId) -> Position {
        self.name(id).end.with_line_offset(self.line_offset)
    }

    // --- parent links -----------------------------------------------------

    /// Sets a node's parent. For flows the new parent propagates along the
    /// whole `next` chain, so tails always share the head's parent.
    pub(crate) fn set_parent(&mut self, id: NodeId, parent: NodeId) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            self.node_mut(current).parent = Some(parent);
            cursor = self.node(current).flow_data().and_then(|flow| flow.next);
        }
    }

    /// The id this node hands out when it parents children. Only the root
    /// redirects (to the top module of a stitched parse).
    pub(crate) fn effective_parent(&self, id: NodeId) -> NodeId {
        if id == self.root { self.top_root } else { id }
    }

    /// Walks `parent` links from `start` until `pred` matches; returns the
    /// last node visited when nothing matches (the root, usually).
    pub fn parent_until(&self, start: NodeId, include_current: bool, pred: impl Fn(&Node) -> bool) -> NodeId {
        let mut current = if include_current {
            start
        } else {
            match self.node(start).parent {
                Some(parent) => parent,
                None => return start,
            }
        };
        loop {
            if pred(self.node(current)) {
                return current;
            }
            match self.node(current).parent {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    /// The nearest enclosing function or lambda, if any.
    pub fn enclosing_function(&self, start: NodeId) -> Option<NodeId> {
        let found = self.parent_until(start, true, |node| {
            matches!(node.kind, NodeKind::Function(_) | NodeKind::Lambda(_))
        });
        match self.node(found).kind {
            NodeKind::Function(_) | NodeKind::Lambda(_) => Some(found),
            _ => None,
        }
    }

    // --- module-level queries ---------------------------------------------

    /// The module name derived from the path basename: `pkg/mod.py` → `mod`,
    /// `pkg/__init__.py` → `pkg`.
    pub fn module_name(&self) -> Option<String> {
        use std::sync::LazyLock;
        static BASENAME: LazyLock<regex::Regex> = LazyLock::new(|| {
            regex::Regex::new(r"([^/\\]*?)([/\\]__init__)?(\.py|\.so)?$").expect("valid module-name pattern")
        });
        let path = self.path.as_ref()?;
        let captures = BASENAME.captures(path)?;
        Some(captures.get(1).map_or_else(String::new, |m| m.as_str().to_owned()))
    }

    /// A module is builtin when it has no path or the path is not a `.py`
    /// source file.
    pub fn is_builtin(&self) -> bool {
        !self.path.as_ref().is_some_and(|p| p.ends_with(".py"))
    }

    /// Registers a name from a `global` statement. No parent is assigned:
    /// globals are not defined in the scope that declares them.
    pub(crate) fn add_global(&mut self, name: NameId) {
        self.global_vars.push(name);
    }

    // --- scope mutation (parse time only) ---------------------------------

    /// Adds `sub` as a subscope of `scope` and attaches the pending
    /// decorators. Decorators keep the enclosing scope as parent; they do not
    /// live inside the new scope.
    pub(crate) fn add_scope(&mut self, scope: NodeId, sub: NodeId, decorators: Vec<NodeId>) -> NodeId {
        let parent = self.effective_parent(scope);
        self.set_parent(sub, parent);
        for &decorator in &decorators {
            self.set_parent(decorator, parent);
        }
        match &mut self.node_mut(sub).kind {
            NodeKind::Class(class) => class.decorators = decorators,
            NodeKind::Function(func) | NodeKind::Lambda(func) => func.decorators = decorators,
            _ => {}
        }
        if let Some(scope_data) = self.node_mut(scope).scope_data_mut() {
            scope_data.subscopes.push(sub);
        }
        sub
    }

    /// Adds a statement or a flow to `scope`.
    pub(crate) fn add_statement(&mut self, scope: NodeId, stmt: NodeId) -> NodeId {
        let parent = self.effective_parent(scope);
        self.set_parent(stmt, parent);
        if let Some(scope_data) = self.node_mut(scope).scope_data_mut() {
            scope_data.statements.push(stmt);
        }
        stmt
    }

    pub(crate) fn add_import(&mut self, scope: NodeId, import: NodeId) {
        let parent = self.effective_parent(scope);
        self.set_parent(import, parent);
        if let Some(scope_data) = self.node_mut(scope).scope_data_mut() {
            scope_data.imports.push(import);
        }
    }

    /// Stores a docstring: the string literal is evaluated, then cleaned the
    /// way `inspect.cleandoc` does.
    pub(crate) fn add_docstr(&mut self, scope: NodeId, raw: &str) {
        let text = cleandoc(&eval_string_literal(raw));
        if let Some(scope_data) = self.node_mut(scope).scope_data_mut() {
            scope_data.docstring = text;
        }
    }

    /// Appends `tail` to the end of the flow chain starting at `head`. The
    /// tail adopts the head's parent.
    pub(crate) fn set_next_flow(&mut self, head: NodeId, tail: NodeId) -> NodeId {
        let mut end = head;
        while let Some(next) = self.node(end).flow_data().and_then(|flow| flow.next) {
            end = next;
        }
        if let Some(flow) = self.node_mut(end).flow_data_mut() {
            flow.next = Some(tail);
        }
        if let Some(parent) = self.node(head).parent {
            self.set_parent(tail, parent);
        }
        tail
    }

    // --- scope queries ----------------------------------------------------

    pub fn subscopes(&self, scope: NodeId) -> &[NodeId] {
        self.node(scope).scope_data().map_or(&[], |s| &s.subscopes)
    }

    pub fn statements(&self, scope: NodeId) -> &[NodeId] {
        self.node(scope).scope_data().map_or(&[], |s| &s.statements)
    }

    pub fn imports(&self, scope: NodeId) -> &[NodeId] {
        self.node(scope).scope_data().map_or(&[], |s| &s.imports)
    }

    pub fn docstring(&self, scope: NodeId) -> &str {
        self.node(scope).scope_data().map_or("", |s| &s.docstring)
    }

    /// The display name of a class or function scope.
    pub fn scope_name(&self, scope: NodeId) -> Option<String> {
        match &self.node(scope).kind {
            NodeKind::Class(class) => Some(self.name(class.name).get_code()),
            NodeKind::Function(func) | NodeKind::Lambda(func) => func.name.map(|n| self.name(n).get_code()),
            _ => None,
        }
    }

    /// All imports of a scope, including those nested in flow statements.
    pub fn get_imports(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_imports(scope, &mut out);
        out
    }

    fn collect_imports(&self, scope: NodeId, out: &mut Vec<NodeId>) {
        let Some(scope_data) = self.node(scope).scope_data() else {
            return;
        };
        out.extend_from_slice(&scope_data.imports);
        for &stmt in &scope_data.statements {
            if self.node(stmt).is_flow() {
                let mut flow = Some(stmt);
                while let Some(current) = flow {
                    self.collect_imports(current, out);
                    flow = self.node(current).flow_data().and_then(|data| data.next);
                }
            }
        }
    }

    /// The names a scope makes visible: assigned names, subscope names,
    /// param names (for functions) and non-star import bindings. Asking a
    /// flow redirects to the nearest class, function or module, the way
    /// name lookup does.
    pub fn get_set_vars(&self, scope: NodeId) -> Vec<NameId> {
        if self.node(scope).is_flow() {
            let target = self.parent_until(scope, true, |node| {
                matches!(node.kind, NodeKind::Class(_) | NodeKind::Function(_) | NodeKind::Lambda(_) | NodeKind::Module(_))
            });
            return self.get_set_vars(target);
        }

        let mut out = Vec::new();
        self.scope_set_vars(scope, &mut out);

        if let Some(func) = self.node(scope).function_data() {
            for &param in &func.params {
                if let Some(name) = self.param_name(param) {
                    out.push(name);
                }
            }
        }
        if matches!(self.node(scope).kind, NodeKind::Module(_)) {
            out.extend_from_slice(&self.global_vars);
        }
        out
    }

    fn scope_set_vars(&self, scope: NodeId, out: &mut Vec<NameId>) {
        let Some(scope_data) = self.node(scope).scope_data() else {
            return;
        };
        for &stmt in &scope_data.statements {
            if self.node(stmt).is_flow() {
                self.flow_set_vars(stmt, out);
            } else if let Some(data) = self.node(stmt).statement_data() {
                out.extend_from_slice(&data.set_vars);
            }
        }
        for &sub in &scope_data.subscopes {
            match &self.node(sub).kind {
                NodeKind::Class(class) => out.push(class.name),
                NodeKind::Function(func) | NodeKind::Lambda(func) => {
                    if let Some(name) = func.name {
                        out.push(name);
                    }
                }
                _ => {}
            }
        }
        for &import in &scope_data.imports {
            if let Some(data) = self.node(import).import_data()
                && !data.star
            {
                out.extend(self.import_defined_names(import));
            }
        }
    }

    fn flow_set_vars(&self, flow: NodeId, out: &mut Vec<NameId>) {
        if let NodeKind::ForFlow(for_flow) = &self.node(flow).kind {
            out.extend_from_slice(&for_flow.set_vars);
        }
        if let Some(data) = self.node(flow).flow_data() {
            for &init in &data.inits {
                if let Some(stmt) = self.node(init).statement_data() {
                    out.extend_from_slice(&stmt.set_vars);
                }
            }
            if let Some(next) = data.next {
                self.flow_set_vars(next, out);
            }
        }
        self.scope_set_vars(flow, out);
    }

    /// The subset of [`Module::get_set_vars`] visible to outer scopes:
    /// single-part names only.
    pub fn defined_names(&self, scope: NodeId) -> Vec<NameId> {
        self.get_set_vars(scope)
            .into_iter()
            .filter(|&n| self.name(n).len() == 1)
            .collect()
    }

    /// The names an import binds in its scope. Empty for defunct and star
    /// imports; the alias when one is given; the first dotted segment for a
    /// plain `import a.b.c`.
    pub fn import_defined_names(&self, import: NodeId) -> Vec<NameId> {
        let Some(data) = self.node(import).import_data() else {
            return Vec::new();
        };
        if data.defunct || data.star {
            return Vec::new();
        }
        if let Some(alias) = data.alias {
            return vec![alias];
        }
        if let Some(defined) = data.defined_name {
            return vec![defined];
        }
        data.namespace.into_iter().collect()
    }

    /// Every name an import statement mentions: `from_ns`, `namespace` and
    /// `alias`, in that order.
    pub fn import_all_names(&self, import: NodeId) -> Vec<NameId> {
        let Some(data) = self.node(import).import_data() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        out.extend(data.from_ns);
        out.extend(data.namespace);
        out.extend(data.alias);
        out
    }

    /// The single name a param defines. Falls back to its used vars, which
    /// happens for syntactically odd headers.
    pub fn param_name(&self, param: NodeId) -> Option<NameId> {
        let data = self.node(param).statement_data()?;
        let candidates = if data.set_vars.is_empty() { &data.used_vars } else { &data.set_vars };
        if candidates.len() > 1 {
            log::warn!("multiple names in param at {}", self.start_pos(param));
        }
        candidates.first().copied()
    }

    /// True when the first retained token of a statement is the `global`
    /// keyword.
    pub fn is_global_stmt(&self, stmt: NodeId) -> bool {
        let Some(data) = self.node(stmt).statement_data() else {
            return false;
        };
        matches!(data.token_list.first(), Some(StmtToken::Tok { text, .. }) if text == "global")
    }

    // --- lazy call trees ---------------------------------------------------

    /// The lazily computed call/assignment tree of a statement. Computed on
    /// first access and memoized; repeated calls return the identical tree.
    pub fn assignment_calls(&self, stmt: NodeId) -> &crate::calls::Call {
        &self.assignment_data(stmt).top
    }

    /// The `(operator, target)` pairs of chained or augmented assignments.
    pub fn assignment_details(&self, stmt: NodeId) -> &[(String, crate::calls::Call)] {
        &self.assignment_data(stmt).details
    }

    fn assignment_data(&self, stmt: NodeId) -> &AssignmentCalls {
        let data = self
            .node(stmt)
            .statement_data()
            .expect("assignment calls requested for a non-statement node");
        data.calls.get_or_init(|| crate::calls::compute_assignment_calls(self, stmt))
    }

    // --- position lookups --------------------------------------------------

    /// The innermost statement, param, decorator or return expression whose
    /// range contains `pos`, searching this scope and everything below it.
    pub fn statement_for_position(&self, scope: NodeId, pos: Position, include_imports: bool) -> Option<NodeId> {
        let Some(scope_data) = self.node(scope).scope_data() else {
            return None;
        };

        let mut checks: Vec<NodeId> = Vec::new();
        checks.extend_from_slice(&scope_data.statements);
        checks.extend_from_slice(&scope_data.asserts);
        if include_imports {
            checks.extend_from_slice(&scope_data.imports);
        }
        match &self.node(scope).kind {
            NodeKind::Function(func) | NodeKind::Lambda(func) => {
                checks.extend_from_slice(&func.params);
                checks.extend_from_slice(&func.decorators);
                checks.extend_from_slice(&func.returns);
            }
            NodeKind::Class(class) => {
                checks.extend_from_slice(&class.decorators);
                checks.extend_from_slice(&class.supers);
            }
            NodeKind::ForFlow(for_flow) => {
                checks.push(for_flow.set_stmt);
            }
            _ => {}
        }
        if let Some(flow) = self.node(scope).flow_data() {
            checks.extend_from_slice(&flow.inits);
        }

        for &candidate in &checks {
            if self.node(candidate).is_flow() {
                let mut flow = candidate;
                loop {
                    if let Some(found) = self.statement_for_position(flow, pos, include_imports) {
                        return Some(found);
                    }
                    match self.node(flow).flow_data().and_then(|f| f.next) {
                        Some(next) => flow = next,
                        None => break,
                    }
                }
            } else if self.start_pos(candidate) <= pos && pos < self.end_pos(candidate) {
                return Some(candidate);
            }
        }

        for &sub in &scope_data.subscopes {
            if self.start_pos(sub) <= pos
                && pos <= self.end_pos(sub)
                && let Some(found) = self.statement_for_position(sub, pos, include_imports)
            {
                return Some(found);
            }
        }
        None
    }

    /// The name whose range contains `pos`, anywhere under `scope`.
    pub fn name_at(&self, scope: NodeId, pos: Position) -> Option<NameId> {
        let Some(scope_data) = self.node(scope).scope_data() else {
            return None;
        };

        for &import in &scope_data.imports {
            for name in self.import_all_names(import) {
                if self.name_contains(name, pos) {
                    return Some(name);
                }
            }
        }
        for &stmt in &scope_data.statements {
            if self.node(stmt).is_flow() {
                let mut flow = Some(stmt);
                while let Some(current) = flow {
                    if let Some(data) = self.node(current).flow_data() {
                        for &init in &data.inits {
                            if let Some(found) = self.statement_name_at(init, pos) {
                                return Some(found);
                            }
                        }
                    }
                    if let Some(found) = self.name_at(current, pos) {
                        return Some(found);
                    }
                    flow = self.node(current).flow_data().and_then(|f| f.next);
                }
            } else if let Some(found) = self.statement_name_at(stmt, pos) {
                return Some(found);
            }
        }
        for &sub in &scope_data.subscopes {
            let own_name = match &self.node(sub).kind {
                NodeKind::Class(class) => Some(class.name),
                NodeKind::Function(func) | NodeKind::Lambda(func) => func.name,
                _ => None,
            };
            if let Some(name) = own_name
                && self.name_contains(name, pos)
            {
                return Some(name);
            }
            if let Some(func) = self.node(sub).function_data() {
                for &param in &func.params {
                    if let Some(found) = self.statement_name_at(param, pos) {
                        return Some(found);
                    }
                }
                for &ret in &func.returns {
                    if let Some(found) = self.statement_name_at(ret, pos) {
                        return Some(found);
                    }
                }
            }
            if let Some(found) = self.name_at(sub, pos) {
                return Some(found);
            }
        }
        None
    }

    fn statement_name_at(&self, stmt: NodeId, pos: Position) -> Option<NameId> {
        let data = self.node(stmt).statement_data()?;
        for token in &data.token_list {
            match token {
                StmtToken::Name(name) => {
                    if self.name_contains(*name, pos) {
                        return Some(*name);
                    }
                }
                StmtToken::ListComp(comp) => {
                    let comp = *self.comp(*comp);
                    for sub in [comp.stmt, comp.middle, comp.input] {
                        if let Some(found) = self.statement_name_at(sub, pos) {
                            return Some(found);
                        }
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// True when any part of the name contains `pos`.
    fn name_contains(&self, name: NameId, pos: Position) -> bool {
        let offset = self.line_offset;
        self.name(name)
            .parts
            .iter()
            .any(|part| part.start.with_line_offset(offset) <= pos && pos <= part.end().with_line_offset(offset))
    }

    // --- code regeneration -------------------------------------------------

    /// Regenerates display text for any node. Not byte-identical to the
    /// source, but structurally faithful.
    pub fn get_code(&self, id: NodeId) -> String {
        match &self.node(id).kind {
            NodeKind::Module(_) => self.scope_code(id, false),
            NodeKind::Class(_) => self.class_code(id),
            NodeKind::Function(_) => self.function_code(id),
            NodeKind::Lambda(_) => self.lambda_code(id),
            NodeKind::Flow(_) => self.flow_code(id),
            NodeKind::ForFlow(_) => self.for_flow_code(id),
            NodeKind::Import(_) => self.import_code(id, true),
            NodeKind::Statement(_) | NodeKind::Param(_) => self.statement_code(id, true),
        }
    }

    fn scope_code(&self, scope: NodeId, first_indent: bool) -> String {
        let Some(scope_data) = self.node(scope).scope_data() else {
            return String::new();
        };
        let mut out = String::new();
        if !scope_data.docstring.is_empty() {
            out.push_str("\"\"\"");
            out.push_str(&scope_data.docstring);
            out.push_str("\"\"\"\n");
        }
        for &import in &scope_data.imports {
            out.push_str(&self.import_code(import, true));
        }
        for &sub in &scope_data.subscopes {
            let sub_code = self.get_code(sub);
            out.push_str(&indent_block(&sub_code));
        }
        for &stmt in &scope_data.statements {
            out.push_str(&self.get_code(stmt));
        }
        let is_lambda = matches!(self.node(scope).kind, NodeKind::Lambda(_));
        if let Some(func) = self.node(scope).function_data() {
            for &ret in &func.returns {
                if !is_lambda {
                    out.push_str("return ");
                }
                out.push_str(&self.statement_code(ret, true));
            }
        }
        if first_indent {
            out = indent_block(&out);
        }
        out
    }

    fn class_code(&self, class_id: NodeId) -> String {
        let NodeKind::Class(class) = &self.node(class_id).kind else {
            return String::new();
        };
        let mut out = String::new();
        for &decorator in &class.decorators {
            out.push('@');
            out.push_str(&self.statement_code(decorator, true));
        }
        out.push_str("class ");
        out.push_str(&self.name(class.name).get_code());
        if !class.supers.is_empty() {
            let supers: Vec<String> = class
                .supers
                .iter()
                .map(|&s| self.statement_code(s, false))
                .collect();
            out.push('(');
            out.push_str(&supers.join(","));
            out.push(')');
        }
        out.push_str(":\n");
        out.push_str(&self.scope_code(class_id, true));
        if class.scope.is_empty() {
            out.push_str(&indent_block("pass\n"));
        }
        out
    }

    fn function_code(&self, func_id: NodeId) -> String {
        let Some(func) = self.node(func_id).function_data() else {
            return String::new();
        };
        let mut out = String::new();
        for &decorator in &func.decorators {
            out.push('@');
            out.push_str(&self.statement_code(decorator, true));
        }
        let name = func.name.map(|n| self.name(n).get_code()).unwrap_or_default();
        let params: Vec<&str> = func
            .params
            .iter()
            .filter_map(|&p| self.node(p).statement_data().map(|d| d.code.as_str()))
            .collect();
        out.push_str("def ");
        out.push_str(&name);
        out.push('(');
        out.push_str(&params.join(","));
        out.push_str("):\n");
        out.push_str(&self.scope_code(func_id, true));
        if func.scope.is_empty() && func.returns.is_empty() {
            out.push_str(&indent_block("pass\n"));
        }
        out
    }

    fn lambda_code(&self, lambda_id: NodeId) -> String {
        let Some(func) = self.node(lambda_id).function_data() else {
            return String::new();
        };
        let params: Vec<&str> = func
            .params
            .iter()
            .filter_map(|&p| self.node(p).statement_data().map(|d| d.code.as_str()))
            .collect();
        format!("lambda {}:{}", params.join(","), self.scope_code(lambda_id, false))
    }

    fn flow_code(&self, flow_id: NodeId) -> String {
        let Some(flow) = self.node(flow_id).flow_data() else {
            return String::new();
        };
        let inits: Vec<String> = flow.inits.iter().map(|&i| self.statement_code(i, false)).collect();
        let mut out = format!("{} {}:\n", flow.command, inits.join(", "));
        out.push_str(&self.scope_code(flow_id, true));
        if let Some(next) = flow.next {
            out.push_str(&self.get_code(next));
        }
        out
    }

    fn for_flow_code(&self, flow_id: NodeId) -> String {
        let NodeKind::ForFlow(for_flow) = &self.node(flow_id).kind else {
            return String::new();
        };
        let vars: Vec<String> = for_flow.set_vars.iter().map(|&n| self.name(n).get_code()).collect();
        let inits: Vec<String> = for_flow
            .flow
            .inits
            .iter()
            .map(|&i| self.statement_code(i, false))
            .collect();
        let mut out = format!("for {} in {}:\n", vars.join(","), inits.join(", "));
        out.push_str(&self.scope_code(flow_id, true));
        out
    }

    fn import_code(&self, import_id: NodeId, new_line: bool) -> String {
        let Some(data) = self.node(import_id).import_data() else {
            return String::new();
        };
        let namespace = data.namespace.map(|n| self.name(n).get_code()).unwrap_or_default();
        let ns_str = match data.alias {
            Some(alias) => format!("{namespace} as {}", self.name(alias).get_code()),
            None => namespace,
        };
        let nl = if new_line { "\n" } else { "" };
        if data.from_ns.is_some() || data.relative_count > 0 {
            let ns_str = if data.star { "*".to_owned() } else { ns_str };
            let from_ns = data.from_ns.map(|n| self.name(n).get_code()).unwrap_or_default();
            let dots = ".".repeat(data.relative_count as usize);
            format!("from {dots}{from_ns} import {ns_str}{nl}")
        } else {
            format!("import {ns_str}{nl}")
        }
    }

    fn statement_code(&self, stmt_id: NodeId, new_line: bool) -> String {
        let code = self
            .node(stmt_id)
            .statement_data()
            .map_or_else(String::new, |data| data.code.clone());
        if new_line { format!("{code}\n") } else { code }
    }

    /// Renders a list comprehension the way it appeared: `X for Y in Z`.
    pub fn comp_code(&self, comp: ListCompId) -> String {
        let comp = *self.comp(comp);
        let parts: Vec<String> = [comp.stmt, comp.middle, comp.input]
            .iter()
            .map(|&s| self.statement_code(s, false).replace('\n', ""))
            .collect();
        format!("{} for {} in {}", parts[0], parts[1], parts[2])
    }

    // --- call-signature help -----------------------------------------------

    /// A display call signature for a function scope, folded to `width`
    /// characters per line.
    pub fn get_call_signature(&self, func_id: NodeId, width: usize) -> Option<String> {
        let func = self.node(func_id).function_data()?;
        let last_part = func
            .name
            .map(|n| self.name(n).parts.last().map(|p| p.text.clone()).unwrap_or_default())
            .unwrap_or_default();
        let mut line = format!("{last_part}(");
        let mut lines: Vec<String> = Vec::new();
        let count = func.params.len();
        for (i, &param) in func.params.iter().enumerate() {
            let mut code = self.statement_code(param, false);
            if i != count - 1 {
                code.push_str(", ");
            }
            if line.chars().count() + code.chars().count() > width {
                lines.push(line.trim_end().to_owned());
                line = code;
            } else {
                line.push_str(&code);
            }
        }
        if !line.is_empty() {
            lines.push(line);
        }
        if let Some(last) = lines.last_mut() {
            last.push(')');
        }
        Some(lines.join("\n"))
    }

    /// Call signature plus docstring, the payload of signature help.
    pub fn doc(&self, func_id: NodeId) -> Option<String> {
        let signature = self.get_call_signature(func_id, 72)?;
        Some(format!("{signature}\n\n{}", self.docstring(func_id)))
    }
}

/// Indents a block of text by four spaces, leaving trailing newlines where
/// they were.
pub(crate) fn indent_block(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut trailing = 0usize;
    let mut body = text;
    while let Some(stripped) = body.strip_suffix('\n') {
        trailing += 1;
        body = stripped;
    }
    let indented: Vec<String> = body.split('\n').map(|line| format!("    {line}")).collect();
    let mut out = indented.join("\n");
    out.push_str(&"\n".repeat(trailing));
    out
}

/// Evaluates a string literal: strips prefix letters and quotes, and
/// processes the common escapes unless the literal is raw.
pub(crate) fn eval_string_literal(raw: &str) -> String {
    let mut rest = raw;
    let mut is_raw = false;
    while let Some(ch) = rest.chars().next() {
        if matches!(ch, 'r' | 'R') {
            is_raw = true;
            rest = &rest[ch.len_utf8()..];
        } else if matches!(ch, 'b' | 'B' | 'u' | 'U' | 'f' | 'F') {
            rest = &rest[ch.len_utf8()..];
        } else {
            break;
        }
    }

    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(stripped) = rest.strip_prefix(quote) {
            rest = stripped.strip_suffix(quote).unwrap_or(stripped);
            break;
        }
    }

    if is_raw {
        return rest.to_owned();
    }

    let mut out = String::with_capacity(rest.len());
    let mut chars = rest.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('\n') => {}
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// A port of `inspect.cleandoc`: dedents every line after the first by the
/// common margin and trims blank lines at both ends.
pub(crate) fn cleandoc(text: &str) -> String {
    let expanded = text.replace('\t', "        ");
    let mut lines: Vec<String> = expanded.split('\n').map(str::to_owned).collect();

    let mut margin = usize::MAX;
    for line in lines.iter().skip(1) {
        let content = line.trim_start().len();
        if content > 0 {
            margin = margin.min(line.len() - content);
        }
    }
    if let Some(first) = lines.first_mut() {
        *first = first.trim_start().to_owned();
    }
    if margin < usize::MAX {
        for line in lines.iter_mut().skip(1) {
            *line = line.get(margin.min(line.len())..).unwrap_or("").to_owned();
        }
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    while lines.first().is_some_and(|l| l.is_empty()) {
        lines.remove(0);
    }
    lines.join("\n")
}
