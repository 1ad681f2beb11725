//! The lazy statement sub-parser.
//!
//! Statements keep their token list at parse time; only when somebody asks
//! for the call/assignment structure is the list folded into a tree of
//! [`Call`] nodes. A `Call` names something (a dotted name, a literal, or a
//! bracketed [`ArrayData`] group); chained attribute access hangs off `next`
//! and a directly applied `(…)`/`[…]` hangs off `execution`. The result is
//! memoized on the statement, so repeated reads return the identical tree.

use crate::{
    position::Position,
    token::TokenKind,
    tree::{ListCompId, Module, NameId, NamePart, NodeId, StmtToken},
};

/// What a [`Call`] names.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum CallKind {
    /// A (possibly dotted) name.
    Name(NameId),
    /// A numeric literal, kept as source text.
    Number(String),
    /// A string literal, evaluated to its value.
    Str(String),
    /// A bracketed group, or the whole statement (`NoArray`).
    Array(ArrayData),
}

/// One node of the lazy expression tree.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Call {
    pub kind: CallKind,
    /// Raw (unoffset) start position.
    pub start: Position,
    /// Set for arrays when their closing bracket is seen.
    pub end: Option<Position>,
    /// Chained attribute access: the call after a `.`. When the dot follows
    /// a bracket group, the chain hangs off the call that owns the
    /// execution, with the execution staying a sibling field.
    pub next: Option<Box<Call>>,
    /// Brackets applied immediately after this call: `f(…)`, `x[…]`.
    /// Always [`CallKind::Array`].
    pub execution: Option<Box<Call>>,
}

impl Call {
    fn leaf(kind: CallKind, start: Position) -> Self {
        Self {
            kind,
            start,
            end: None,
            next: None,
            execution: None,
        }
    }

    pub fn array(&self) -> Option<&ArrayData> {
        match &self.kind {
            CallKind::Array(array) => Some(array),
            _ => None,
        }
    }

    /// The deepest call along the `next`/`execution` chain, which is where
    /// a further bracket execution attaches: `a()[0]` stacks the subscript
    /// onto the call group.
    fn tail_mut(&mut self) -> &mut Self {
        let mut cur = self;
        loop {
            if cur.next.is_some() {
                cur = cur.next.as_mut().expect("checked above");
            } else if cur.execution.is_some() {
                cur = cur.execution.as_mut().expect("checked above");
            } else {
                return cur;
            }
        }
    }

    /// The deepest call following only `next` links. A `.` chain never
    /// descends into an execution: in `a().b`, the attribute chains onto
    /// `a` itself and the bracket group stays a sibling.
    fn chain_tail_mut(&mut self) -> &mut Self {
        let mut cur = self;
        while cur.next.is_some() {
            cur = cur.next.as_mut().expect("checked above");
        }
        cur
    }
}

/// The bracket kinds an [`ArrayData`] can have. `NoArray` is the bare
/// statement wrapper and the grouping paren `(x)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum ArrayType {
    NoArray,
    Tuple,
    List,
    Dict,
    Set,
}

/// A two-dimensional array: each field is itself a sequence of tokens and
/// sub-calls, because a field can be an expression (`[1, 2+3]`).
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ArrayData {
    pub array_type: ArrayType,
    pub values: Vec<Vec<ExprToken>>,
    /// Positionally paired with `values`; non-empty only for dicts.
    pub keys: Vec<Vec<ExprToken>>,
    /// Start positions of the fields opened by commas.
    pub arr_el_pos: Vec<Position>,
}

impl ArrayData {
    fn new(array_type: ArrayType) -> Self {
        Self {
            array_type,
            values: Vec::new(),
            keys: Vec::new(),
            arr_el_pos: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The only element the array contains, if it holds exactly one.
    pub fn only_subelement(&self) -> Option<&ExprToken> {
        if self.values.len() == 1 && self.values[0].len() == 1 {
            self.values[0].first()
        } else {
            None
        }
    }

    fn add_to_current_field(&mut self, token: ExprToken) {
        if self.values.is_empty() {
            // An empty round brace is a tuple; a filled one is just grouping.
            if self.array_type == ArrayType::Tuple {
                self.array_type = ArrayType::NoArray;
            }
            self.values.push(Vec::new());
        }
        self.values.last_mut().expect("field added above").push(token);
    }

    fn add_field(&mut self, start: Position) {
        self.arr_el_pos.push(start);
        self.values.push(Vec::new());
    }

    fn add_dictionary_key(&mut self) {
        if matches!(self.array_type, ArrayType::List | ArrayType::Tuple) {
            return;
        }
        let last = self.values.pop().unwrap_or_default();
        self.keys.push(last);
        if self.array_type == ArrayType::Set {
            self.array_type = ArrayType::Dict;
        }
        self.values.push(Vec::new());
    }
}

/// One entry of an array field.
#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ExprToken {
    Call(Call),
    /// An operator or keyword kept as plain text.
    Op(String),
    ListComp(ListCompId),
    Lambda(NodeId),
}

impl ExprToken {
    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Self::Call(call) => Some(call),
            _ => None,
        }
    }
}

/// The memoized result: the top-level tree plus one `(operator, target)`
/// entry per assignment operator found at bracket level 0.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct AssignmentCalls {
    pub top: Call,
    pub details: Vec<(String, Call)>,
}

impl Default for Call {
    fn default() -> Self {
        Self::leaf(CallKind::Array(ArrayData::new(ArrayType::NoArray)), Position::new(1, 0))
    }
}

/// One element of a call path, in execution order.
#[derive(Debug, Clone, Copy)]
pub enum CallPathSegment<'a> {
    /// One dotted segment of a name.
    NamePart(&'a NamePart),
    /// A literal or array that has no name parts.
    Call(&'a Call),
}

/// Where a finished bracket group lands in its parent.
#[derive(Clone, Copy, PartialEq)]
enum Dest {
    /// Appended to the parent's current field.
    Field,
    /// Attached as execution of the last call in the parent's current field.
    Execution,
}

/// One open bracket group while folding.
struct Frame {
    array: Call,
    dest: Dest,
    /// True when the last item added to the current field can take an
    /// execution or chain link: a call, or a bracket group that just closed.
    active: bool,
}

impl Frame {
    fn new(array_type: ArrayType, start: Position, dest: Dest) -> Self {
        Self {
            array: Call::leaf(CallKind::Array(ArrayData::new(array_type)), start),
            dest,
            active: false,
        }
    }

    fn data_mut(&mut self) -> &mut ArrayData {
        match &mut self.array.kind {
            CallKind::Array(array) => array,
            _ => unreachable!("frames always hold arrays"),
        }
    }

    /// The call a finished bracket group attaches to as an execution.
    fn attach_target(&mut self) -> Option<&mut Call> {
        self.last_call(Call::tail_mut)
    }

    /// The call a `.` chain link attaches to.
    fn chain_target(&mut self) -> Option<&mut Call> {
        self.last_call(Call::chain_tail_mut)
    }

    /// The last call of the current field, narrowed by `walk`.
    fn last_call(&mut self, walk: impl FnOnce(&mut Call) -> &mut Call) -> Option<&mut Call> {
        self.data_mut()
            .values
            .last_mut()
            .and_then(|field| field.last_mut())
            .and_then(|token| match token {
                ExprToken::Call(call) => Some(walk(call)),
                _ => None,
            })
    }
}

/// Folds a statement's retained token list into its call tree. Called once
/// per statement through the memoizing accessors on [`Module`].
pub(crate) fn compute_assignment_calls(module: &Module, stmt: NodeId) -> AssignmentCalls {
    let node = module.node(stmt);
    let data = node
        .statement_data()
        .expect("call tree computed for a statement node");

    let mut details: Vec<(String, Call)> = Vec::new();
    let mut frames = vec![Frame::new(ArrayType::NoArray, node.start, Dest::Field)];
    let mut chain = false;
    let mut level: i32 = 0;
    let mut last_end = node.end;
    let mut skip_next = false;

    for token in &data.token_list {
        if skip_next {
            skip_next = false;
            continue;
        }
        match token {
            StmtToken::ListComp(comp) => {
                let frame = frames.last_mut().expect("top frame always present");
                frame.data_mut().add_to_current_field(ExprToken::ListComp(*comp));
                frame.active = false;
                last_end = module.node(module.comp(*comp).input).end;
            }
            StmtToken::Lambda(lambda) => {
                let frame = frames.last_mut().expect("top frame always present");
                frame.data_mut().add_to_current_field(ExprToken::Lambda(*lambda));
                frame.active = false;
                last_end = module.node(*lambda).end;
            }
            StmtToken::Name(name) => {
                let start = module.name(*name).start;
                add_call(&mut frames, &mut chain, Call::leaf(CallKind::Name(*name), start));
                last_end = module.name(*name).end;
            }
            StmtToken::Tok { kind, text, start } => {
                last_end = start.shifted(text.chars().count() as u32);
                match kind {
                    TokenKind::Number => {
                        add_call(&mut frames, &mut chain, Call::leaf(CallKind::Number(text.clone()), *start));
                    }
                    TokenKind::String => {
                        let value = crate::tree::eval_string_literal(text);
                        add_call(&mut frames, &mut chain, Call::leaf(CallKind::Str(value), *start));
                    }
                    TokenKind::Newline | TokenKind::Nl | TokenKind::Indent | TokenKind::Dedent | TokenKind::Comment => {}
                    _ => {
                        if level == 0 && is_assignment_operator(text) {
                            // Everything so far becomes one assignment target;
                            // the tree restarts just past the operator.
                            while frames.len() > 1 {
                                let mut open = frames.pop().expect("length checked");
                                open.array.end = Some(*start);
                                place_closed(&mut frames, open);
                            }
                            let finished = frames.pop().expect("top frame always present");
                            details.push((text.clone(), finished.array));
                            let restart = start.shifted(text.chars().count() as u32);
                            frames.push(Frame::new(ArrayType::NoArray, restart, Dest::Field));
                            chain = false;
                            level = 0;
                        } else if text == "as" {
                            skip_next = true;
                        } else if let Some(array_type) = bracket_type(text) {
                            level += 1;
                            let dest = if frames.last().is_some_and(|f| f.active) {
                                Dest::Execution
                            } else {
                                Dest::Field
                            };
                            frames.push(Frame::new(array_type, *start, dest));
                        } else if text == ":" {
                            let frame = frames.last_mut().expect("top frame always present");
                            frame.active = false;
                            if frame.data_mut().array_type == ArrayType::List {
                                // Slicing: the colon is content, not a key marker.
                                frame.data_mut().add_to_current_field(ExprToken::Op(text.clone()));
                            } else {
                                frame.data_mut().add_dictionary_key();
                            }
                        } else if text == "." {
                            chain = true;
                        } else if text == "," {
                            let frame = frames.last_mut().expect("top frame always present");
                            frame.active = false;
                            frame.data_mut().add_field(start.shifted(1));
                            if frame.data_mut().array_type == ArrayType::NoArray {
                                frame.data_mut().array_type = ArrayType::Tuple;
                            }
                        } else if matches!(text.as_str(), ")" | "}" | "]") {
                            level -= 1;
                            close_bracket(&mut frames, text, *start);
                        } else if text != "\n" && !text.is_empty() {
                            let frame = frames.last_mut().expect("top frame always present");
                            frame.active = false;
                            frame.data_mut().add_to_current_field(ExprToken::Op(text.clone()));
                        }
                    }
                }
            }
        }
    }

    if level != 0 {
        log::warn!("brackets don't match in statement at {}: level {level}", node.start);
    }

    // Close every group still open at the best estimate of its end.
    while frames.len() > 1 {
        let mut frame = frames.pop().expect("length checked");
        frame.array.end = Some(last_end);
        place_closed(&mut frames, frame);
    }
    let mut top_frame = frames.pop().expect("top frame always present");
    top_frame.array.end = Some(if data.token_list.is_empty() { node.end } else { last_end });

    AssignmentCalls {
        top: top_frame.array,
        details,
    }
}

/// Adds a name or literal call: chained onto the previous call after a `.`,
/// as a fresh field entry otherwise.
fn add_call(frames: &mut [Frame], chain: &mut bool, call: Call) {
    let frame = frames.last_mut().expect("top frame always present");
    if *chain
        && let Some(target) = frame.chain_target()
    {
        target.next = Some(Box::new(call));
    } else {
        frame.data_mut().add_to_current_field(ExprToken::Call(call));
    }
    *chain = false;
    frame.active = true;
}

fn close_bracket(frames: &mut Vec<Frame>, text: &str, start: Position) {
    if frames.len() <= 1 {
        // Unmatched closer; leave the tree as it is.
        return;
    }
    let mut frame = frames.pop().expect("length checked");
    if text == "}" && frame.data_mut().values.is_empty() {
        // Empty braces are always a dictionary, never a set.
        frame.data_mut().array_type = ArrayType::Dict;
    }
    frame.array.end = Some(start.shifted(1));
    place_closed(frames, frame);
}

/// Places a finished bracket group into the frame below it.
fn place_closed(frames: &mut [Frame], frame: Frame) {
    let parent = frames.last_mut().expect("caller keeps the top frame");
    match frame.dest {
        Dest::Execution => {
            if let Some(target) = parent.attach_target() {
                target.execution = Some(Box::new(frame.array));
            } else {
                parent.data_mut().add_to_current_field(ExprToken::Call(frame.array));
            }
        }
        Dest::Field => {
            parent.data_mut().add_to_current_field(ExprToken::Call(frame.array));
        }
    }
    parent.active = true;
}

fn is_assignment_operator(text: &str) -> bool {
    text.ends_with('=') && !matches!(text, ">=" | "<=" | "==" | "!=")
}

fn bracket_type(text: &str) -> Option<ArrayType> {
    match text {
        "(" => Some(ArrayType::Tuple),
        "[" => Some(ArrayType::List),
        "{" => Some(ArrayType::Set),
        _ => None,
    }
}

impl Module {
    /// The call path of a call chain in execution order: name parts first,
    /// then the execution contents, then the chained tail.
    pub fn call_path<'a>(&'a self, call: &'a Call) -> Vec<CallPathSegment<'a>> {
        let mut out = Vec::new();
        self.collect_call_path(call, &mut out);
        out
    }

    fn collect_call_path<'a>(&'a self, call: &'a Call, out: &mut Vec<CallPathSegment<'a>>) {
        match &call.kind {
            CallKind::Name(name) => {
                for part in &self.name(*name).parts {
                    out.push(CallPathSegment::NamePart(part));
                }
            }
            _ => out.push(CallPathSegment::Call(call)),
        }
        if let Some(execution) = &call.execution {
            self.collect_call_path(execution, out);
        }
        if let Some(next) = &call.next {
            self.collect_call_path(next, out);
        }
    }

    /// Regenerates display text for a call chain.
    pub fn call_code(&self, call: &Call) -> String {
        let mut out = match &call.kind {
            CallKind::Name(name) => self.name(*name).get_code(),
            CallKind::Number(text) => text.clone(),
            CallKind::Str(text) => format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'")),
            CallKind::Array(array) => self.array_code(array),
        };
        if let Some(execution) = &call.execution {
            out.push_str(&self.call_code(execution));
        }
        if let Some(next) = &call.next {
            out.push('.');
            out.push_str(&self.call_code(next));
        }
        out
    }

    fn array_code(&self, array: &ArrayData) -> String {
        let mut fields = Vec::with_capacity(array.values.len());
        for (i, value) in array.values.iter().enumerate() {
            let mut text = String::new();
            if let Some(key) = array.keys.get(i) {
                for token in key {
                    text.push_str(&self.expr_token_code(token));
                }
                text.push_str(": ");
            }
            for token in value {
                text.push_str(&self.expr_token_code(token));
            }
            fields.push(text);
        }
        let inner = fields.join(", ");
        match array.array_type {
            ArrayType::NoArray => inner,
            ArrayType::Tuple => format!("({inner})"),
            ArrayType::List => format!("[{inner}]"),
            ArrayType::Dict | ArrayType::Set => format!("{{{inner}}}"),
        }
    }

    fn expr_token_code(&self, token: &ExprToken) -> String {
        match token {
            ExprToken::Call(call) => self.call_code(call),
            ExprToken::Op(text) => text.clone(),
            ExprToken::ListComp(comp) => self.comp_code(*comp),
            ExprToken::Lambda(lambda) => self.get_code(*lambda),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_parens_demote_to_grouping() {
        let mut array = ArrayData::new(ArrayType::Tuple);
        array.add_to_current_field(ExprToken::Op("1".to_owned()));
        assert_eq!(array.array_type, ArrayType::NoArray);
    }

    #[test]
    fn dictionary_keys_promote_sets() {
        let mut array = ArrayData::new(ArrayType::Set);
        array.add_to_current_field(ExprToken::Op("k".to_owned()));
        array.add_dictionary_key();
        assert_eq!(array.array_type, ArrayType::Dict);
        assert_eq!(array.keys.len(), 1);
        assert_eq!(array.values.len(), 1);
    }

    #[test]
    fn dictionary_key_is_ignored_inside_lists() {
        let mut array = ArrayData::new(ArrayType::List);
        array.add_to_current_field(ExprToken::Op("1".to_owned()));
        array.add_dictionary_key();
        assert_eq!(array.array_type, ArrayType::List);
        assert!(array.keys.is_empty());
    }

    #[test]
    fn assignment_operators_exclude_comparisons() {
        assert!(is_assignment_operator("="));
        assert!(is_assignment_operator("+="));
        assert!(is_assignment_operator("//="));
        assert!(!is_assignment_operator("=="));
        assert!(!is_assignment_operator("<="));
    }
}
