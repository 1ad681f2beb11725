//! Cursor tracking: the parser resolves the enclosing scope and statement
//! while it parses, so lookups afterwards are O(1).

use taipan::{ParseOptions, Parser, Position};

fn parse_at(source: &str, position: Position) -> Parser {
    Parser::new(
        source,
        ParseOptions {
            user_position: Some(position),
            ..ParseOptions::default()
        },
    )
}

const SOURCE: &str = "\
import os

def walk(path):
    return os.listdir(path)

class Walker:
    def __init__(self, top):
        self.top = top
";

#[test]
fn cursor_in_function_body_resolves_scope_and_statement() {
    let parsed = parse_at(SOURCE, Position::new(4, 14));
    let module = &parsed.module;

    let scope = parsed.user_scope.expect("scope at cursor");
    assert_eq!(module.scope_name(scope), Some("walk".to_owned()));

    let stmt = parsed.user_stmt.expect("statement at cursor");
    let code = &module.node(stmt).statement_data().unwrap().code;
    assert!(code.contains("os.listdir"), "found {code:?}");
}

#[test]
fn cursor_in_method_resolves_the_inner_scope() {
    let parsed = parse_at(SOURCE, Position::new(8, 12));
    let module = &parsed.module;
    let scope = parsed.user_scope.expect("scope at cursor");
    assert_eq!(module.scope_name(scope), Some("__init__".to_owned()));
}

#[test]
fn cursor_without_match_stays_empty() {
    let parsed = parse_at("x = 1\n", Position::new(50, 0));
    assert!(parsed.user_stmt.is_none());
}

#[test]
fn split_imports_resolve_to_the_name_under_the_cursor() {
    let parsed = parse_at("import json, sys\n", Position::new(1, 15));
    let module = &parsed.module;
    let stmt = parsed.user_stmt.expect("cursor is on sys");
    let data = module.node(stmt).import_data().expect("an import");
    assert_eq!(module.name(data.namespace.unwrap()).get_code(), "sys");
}

#[test]
fn statement_for_position_descends_flows_and_scopes() {
    let parsed = parse_at(SOURCE, Position::new(4, 14));
    let module = &parsed.module;
    let stmt = module
        .statement_for_position(module.root(), Position::new(4, 14), false)
        .expect("the return expression");
    assert!(module.node(stmt).statement_data().unwrap().code.contains("os.listdir"));
}

#[test]
fn statement_for_position_finds_imports_when_asked() {
    let parsed = parse_at(SOURCE, Position::new(1, 8));
    let module = &parsed.module;
    assert!(
        module
            .statement_for_position(module.root(), Position::new(1, 8), false)
            .is_none()
    );
    let found = module
        .statement_for_position(module.root(), Position::new(1, 8), true)
        .expect("the import");
    assert!(module.node(found).import_data().is_some());
}

#[test]
fn name_at_returns_the_dotted_name() {
    let parsed = parse_at(SOURCE, Position::new(4, 14));
    let module = &parsed.module;
    let name = module.name_at(module.root(), Position::new(4, 14)).expect("os.listdir");
    assert_eq!(module.name(name).get_code(), "os.listdir");
}

#[test]
fn name_at_misses_whitespace() {
    let parsed = parse_at(SOURCE, Position::new(2, 0));
    let module = &parsed.module;
    assert!(module.name_at(module.root(), Position::new(2, 0)).is_none());
}

#[test]
fn name_at_finds_params() {
    let parsed = parse_at(SOURCE, Position::new(3, 10));
    let module = &parsed.module;
    let name = module.name_at(module.root(), Position::new(3, 10)).expect("the param");
    assert_eq!(module.name(name).get_code(), "path");
}
