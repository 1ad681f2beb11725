//! The fault-tolerance contract: broken input never aborts a parse, and
//! whatever was readable is still in the tree.

use taipan::{ImportErrorKind, ParseOptions, Parser, Position, check_error_statements};

fn parse(source: &str) -> Parser {
    Parser::new(source, ParseOptions::default())
}

#[test]
fn broken_def_is_skipped_and_parsing_continues() {
    let parsed = parse("def f(:\n  pass\nx = 1\n");
    let module = &parsed.module;
    assert!(module.subscopes(module.root()).is_empty(), "no function is emitted");
    let stmts = module.statements(module.root());
    assert_eq!(stmts.len(), 1);
    assert_eq!(module.node(stmts[0]).statement_data().unwrap().code, "x=1");
    assert_eq!(module.start_pos(stmts[0]).column, 0);
}

#[test]
fn broken_class_is_skipped() {
    let parsed = parse("class 123:\n    pass\ny = 2\n");
    let module = &parsed.module;
    assert!(module.subscopes(module.root()).is_empty());
    assert_eq!(module.statements(module.root()).len(), 1);
}

#[test]
fn from_without_module_emits_defunct_import() {
    let parsed = parse("from import x\n");
    let module = &parsed.module;
    let imports = module.imports(module.root());
    assert_eq!(imports.len(), 1);
    let data = module.node(imports[0]).import_data().unwrap();
    assert!(data.defunct);
    assert!(module.import_defined_names(imports[0]).is_empty());
}

#[test]
fn bare_import_keeps_a_defunct_node() {
    let parsed = parse("import\n");
    let module = &parsed.module;
    let imports = module.imports(module.root());
    assert_eq!(imports.len(), 1);
    assert!(module.node(imports[0]).import_data().unwrap().defunct);
    assert!(!parsed.module.error_statement_stacks.is_empty());
}

#[test]
fn unfinished_dotted_import_records_an_error_stack() {
    let parsed = parse("import os.\n");
    let module = &parsed.module;
    assert_eq!(module.imports(module.root()).len(), 1);

    let stack = &module.error_statement_stacks[0];
    assert_eq!(stack.kind, ImportErrorKind::ImportName);

    let context = check_error_statements(module, Position::new(1, 10)).expect("cursor is inside the break");
    assert_eq!(context.names.len(), 1);
    assert_eq!(context.names[0].text, "os");
    assert!(context.unfinished_dotted);
    assert!(context.only_modules);
    assert_eq!(context.level, 0);
}

#[test]
fn half_typed_from_import_supports_completion() {
    let parsed = parse("from os.pa\n");
    let module = &parsed.module;
    let imports = module.imports(module.root());
    assert_eq!(imports.len(), 1);
    assert!(module.node(imports[0]).import_data().unwrap().defunct);

    let context = check_error_statements(module, Position::new(1, 10)).expect("broken from-import is recorded");
    let parts: Vec<&str> = context.names.iter().map(|p| p.text.as_str()).collect();
    assert_eq!(parts, vec!["os", "pa"]);
    assert!(context.only_modules, "import keyword was never reached");
}

#[test]
fn relative_from_records_level() {
    let parsed = parse("from ..pkg\n");
    let module = &parsed.module;
    let context = check_error_statements(module, Position::new(1, 10)).expect("recorded");
    assert_eq!(context.level, 2);
    assert_eq!(context.names.len(), 1);
    assert_eq!(context.names[0].text, "pkg");
}

#[test]
fn cursor_outside_error_ranges_finds_nothing() {
    let parsed = parse("import os.\nx = 1\n");
    assert!(check_error_statements(&parsed.module, Position::new(2, 3)).is_none());
}

#[test]
fn unbalanced_brackets_still_build_a_tree() {
    let parsed = parse("x = (1, 2\n");
    let module = &parsed.module;
    let stmt = module.statements(module.root())[0];
    let details = module.assignment_details(stmt);
    assert_eq!(details.len(), 1);
    let value = module.assignment_calls(stmt);
    let tuple = value.array().unwrap().values[0][0].as_call().unwrap();
    let tuple_data = tuple.array().expect("open bracket closed at best estimate");
    assert_eq!(tuple_data.values.len(), 2);
}

#[test]
fn return_outside_function_is_dropped() {
    let parsed = parse("return 5\nx = 1\n");
    let module = &parsed.module;
    assert_eq!(module.statements(module.root()).len(), 1);
}

#[test]
fn incomplete_for_orphans_its_pieces() {
    let parsed = parse("for x:\n    pass\ny = 1\n");
    let module = &parsed.module;
    let stmts = module.statements(module.root());
    assert_eq!(stmts.len(), 1, "no for flow is emitted");
    assert_eq!(module.node(stmts[0]).statement_data().unwrap().code, "y=1");
}

#[test]
fn flow_without_colon_orphans_inits() {
    let parsed = parse("if x\n    pass\nz = 1\n");
    let module = &parsed.module;
    let stmts = module.statements(module.root());
    assert_eq!(stmts.len(), 1);
    assert_eq!(module.node(stmts[0]).statement_data().unwrap().code, "z=1");
}

#[test]
fn dangling_decorator_is_parented_to_the_module() {
    let parsed = parse("@deco\n");
    let module = &parsed.module;
    let deco = *module.used_names["deco"].iter().next().expect("decorator was parsed");
    assert_eq!(module.node(deco).parent, Some(module.root()));
}

#[test]
fn unterminated_string_does_not_kill_the_parse() {
    let parsed = parse("x = 'oops\ny = 1\n");
    let module = &parsed.module;
    let codes: Vec<String> = module
        .statements(module.root())
        .iter()
        .map(|&s| module.node(s).statement_data().unwrap().code.clone())
        .collect();
    assert!(codes.iter().any(|c| c == "y=1"));
}

#[test]
fn stray_operators_are_ignored() {
    let parsed = parse("= = =\nvalid = 1\n");
    let module = &parsed.module;
    assert_eq!(module.statements(module.root()).len(), 1);
}

#[test]
fn deep_nesting_with_bad_dedent() {
    let parsed = parse("if a:\n    if b:\n        x = 1\n  y = 2\nz = 3\n");
    let module = &parsed.module;
    // y's odd indentation closes the inner flow; z returns to the module
    let root_stmts = module.statements(module.root());
    assert!(!root_stmts.is_empty());
    let last = *root_stmts.last().unwrap();
    assert_eq!(module.node(last).statement_data().unwrap().code, "z=3");
}
