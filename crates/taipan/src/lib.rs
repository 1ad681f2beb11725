#![doc = include_str!("../../../README.md")]

mod calls;
mod helpers;
mod parser;
mod position;
mod token;
mod tokenize;
mod tree;

pub use crate::{
    calls::{ArrayData, ArrayType, AssignmentCalls, Call, CallKind, CallPathSegment, ExprToken},
    helpers::{
        CompletionParts, ErrorNode, ErrorStatementStack, ImportContext, ImportErrorKind, check_error_statements,
        completion_parts, name_like,
    },
    parser::{ParseOptions, Parser},
    position::Position,
    token::{Token, TokenKind},
    tokenize::TokenSource,
    tree::{
        ClassData, FlowData, FlowKind, ForFlowData, FunctionData, ImportData, ListCompId, ListComprehension, Module,
        Name, NameId, NamePart, Node, NodeId, NodeKind, ParamData, ScopeData, StatementData, StmtToken,
    },
};
