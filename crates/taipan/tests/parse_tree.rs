use pretty_assertions::assert_eq;
use taipan::{Module, NodeId, NodeKind, ParseOptions, Parser};

fn parse(source: &str) -> Parser {
    Parser::new(source, ParseOptions::default())
}

fn set_var_texts(module: &Module, stmt: NodeId) -> Vec<String> {
    module
        .node(stmt)
        .statement_data()
        .expect("statement node")
        .set_vars
        .iter()
        .map(|&n| module.name(n).get_code())
        .collect()
}

#[test]
fn simple_assignment_binds_one_name() {
    let parsed = parse("x = 1\n");
    let module = &parsed.module;
    let stmts = module.statements(module.root());
    assert_eq!(stmts.len(), 1);
    assert_eq!(set_var_texts(module, stmts[0]), vec!["x".to_owned()]);
    let data = module.node(stmts[0]).statement_data().unwrap();
    assert_eq!(data.code, "x=1");
}

#[test]
fn function_with_default_param() {
    let parsed = parse("def f(a, b=2):\n    return a+b\n");
    let module = &parsed.module;
    let subscopes = module.subscopes(module.root());
    assert_eq!(subscopes.len(), 1);
    let func_id = subscopes[0];
    assert_eq!(module.scope_name(func_id), Some("f".to_owned()));

    let func = module.node(func_id).function_data().unwrap();
    assert_eq!(func.params.len(), 2);
    assert!(!func.is_generator);
    assert_eq!(func.returns.len(), 1);

    // second param carries the default assignment
    let second = func.params[1];
    assert_eq!(set_var_texts(module, second), vec!["b".to_owned()]);
    let NodeKind::Param(param) = &module.node(second).kind else {
        panic!("params are Param nodes");
    };
    assert_eq!(param.position_nr, 1);
    assert_eq!(param.parent_function, Some(func_id));

    let details = module.assignment_details(second);
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].0, "=");
    let value = module.assignment_calls(second);
    let fields = &value.array().unwrap().values;
    assert_eq!(fields.len(), 1);
    let call = fields[0][0].as_call().unwrap();
    assert!(matches!(&call.kind, taipan::CallKind::Number(n) if n == "2"));
}

#[test]
fn relative_import_with_alias() {
    let parsed = parse("from .. import x, y as z\n");
    let module = &parsed.module;
    let imports = module.imports(module.root());
    assert_eq!(imports.len(), 2);

    for &import in imports {
        let data = module.node(import).import_data().unwrap();
        assert_eq!(data.relative_count, 2);
        assert!(data.from_ns.is_none());
        assert!(!data.star);
        assert!(!data.defunct);
    }
    let second = module.node(imports[1]).import_data().unwrap();
    let alias = second.alias.expect("y as z");
    assert_eq!(module.name(alias).get_code(), "z");
}

#[test]
fn class_with_generator_method() {
    let parsed = parse("class C(Base):\n    def m(self): yield self\n");
    let module = &parsed.module;
    let class_id = module.subscopes(module.root())[0];
    assert_eq!(module.scope_name(class_id), Some("C".to_owned()));

    let NodeKind::Class(class) = &module.node(class_id).kind else {
        panic!("class node");
    };
    assert_eq!(class.supers.len(), 1);
    assert_eq!(module.node(class.supers[0]).statement_data().unwrap().code, "Base");

    let methods = module.subscopes(class_id);
    assert_eq!(methods.len(), 1);
    assert_eq!(module.scope_name(methods[0]), Some("m".to_owned()));
    assert!(module.node(methods[0]).function_data().unwrap().is_generator);
}

#[test]
fn module_docstring_is_consumed() {
    let parsed = parse("\"\"\"The docs.\"\"\"\nx = 1\n");
    let module = &parsed.module;
    assert_eq!(module.docstring(module.root()), "The docs.");
    // the docstring is not a statement
    assert_eq!(module.statements(module.root()).len(), 1);
}

#[test]
fn no_docstr_option_keeps_leading_string() {
    let parsed = Parser::new(
        "\"\"\"The docs.\"\"\"\n",
        ParseOptions {
            no_docstr: true,
            ..ParseOptions::default()
        },
    );
    let module = &parsed.module;
    assert_eq!(module.docstring(module.root()), "");
    assert_eq!(module.statements(module.root()).len(), 1);
}

#[test]
fn function_docstring_and_signature() {
    let parsed = parse("def add(a, b=1):\n    \"Adds things.\"\n    return a\n");
    let module = &parsed.module;
    let func = module.subscopes(module.root())[0];
    assert_eq!(module.docstring(func), "Adds things.");
    assert_eq!(module.get_call_signature(func, 72), Some("add(a, b=1)".to_owned()));
    let doc = module.doc(func).unwrap();
    assert!(doc.starts_with("add(a, b=1)\n\n"));
    assert!(doc.ends_with("Adds things."));
}

#[test]
fn defined_names_cover_scopes_imports_and_assignments() {
    let source = "\
import os
import os.path
from sys import argv
from x import *
def f():
    pass
class C:
    pass
x = 1
y.z = 2
";
    let parsed = parse(source);
    let module = &parsed.module;
    let mut names: Vec<String> = module
        .defined_names(module.root())
        .into_iter()
        .map(|n| module.name(n).get_code())
        .collect();
    names.sort();
    // `os` twice: once per import; dotted `y.z` is not visible outside
    assert_eq!(names, vec!["C", "argv", "f", "os", "os", "x"]);
}

#[test]
fn star_import_defines_nothing_but_is_kept() {
    let parsed = parse("from os import *\n");
    let module = &parsed.module;
    let imports = module.imports(module.root());
    assert_eq!(imports.len(), 1);
    let data = module.node(imports[0]).import_data().unwrap();
    assert!(data.star);
    assert!(data.namespace.is_none());
    assert!(module.import_defined_names(imports[0]).is_empty());
}

#[test]
fn imports_inside_flows_are_found() {
    let parsed = parse("try:\n    import json\nexcept ImportError:\n    import simplejson\n");
    let module = &parsed.module;
    assert!(module.imports(module.root()).is_empty());
    let all = module.get_imports(module.root());
    assert_eq!(all.len(), 2);
}

#[test]
fn flow_chain_shares_parent() {
    let source = "\
try:
    pass
except ValueError:
    pass
else:
    pass
finally:
    pass
";
    let parsed = parse(source);
    let module = &parsed.module;
    let stmts = module.statements(module.root());
    assert_eq!(stmts.len(), 1);

    let mut commands = Vec::new();
    let mut cursor = Some(stmts[0]);
    while let Some(flow) = cursor {
        let data = module.node(flow).flow_data().unwrap();
        commands.push(data.command.to_string());
        assert_eq!(module.node(flow).parent, Some(module.root()));
        cursor = data.next;
    }
    assert_eq!(commands, vec!["try", "except", "else", "finally"]);
}

#[test]
fn for_flow_promotes_loop_variables() {
    let parsed = parse("for i in range(10):\n    pass\n");
    let module = &parsed.module;
    let flow = module.statements(module.root())[0];
    let NodeKind::ForFlow(for_flow) = &module.node(flow).kind else {
        panic!("for flow");
    };
    assert!(!for_flow.is_list_comp);
    let vars: Vec<String> = for_flow.set_vars.iter().map(|&n| module.name(n).get_code()).collect();
    assert_eq!(vars, vec!["i".to_owned()]);
    assert_eq!(for_flow.flow.inits.len(), 1);
}

#[test]
fn global_names_reach_the_module() {
    let parsed = parse("def f():\n    global counter\n    counter = 1\n");
    let module = &parsed.module;
    let globals: Vec<String> = module.global_vars.iter().map(|&n| module.name(n).get_code()).collect();
    assert_eq!(globals, vec!["counter".to_owned()]);
}

#[test]
fn assert_statements_are_tracked_separately() {
    let parsed = parse("assert x > 0\ny = 1\n");
    let module = &parsed.module;
    assert_eq!(module.statements(module.root()).len(), 1);
    let found = module.statement_for_position(module.root(), taipan::Position::new(1, 8), false);
    assert!(found.is_some(), "asserts are searched by position");
}

#[test]
fn used_names_maps_text_to_statements() {
    let parsed = parse("x = y\ny = x\n");
    let module = &parsed.module;
    assert_eq!(module.used_names["x"].len(), 2);
    assert_eq!(module.used_names["y"].len(), 2);
}

#[test]
fn every_node_reaches_the_root() {
    let source = "\
import os
def outer(a):
    if a:
        x = [i for i in a]
        return x
class C(object):
    def m(self):
        with open('f') as f:
            pass
";
    let parsed = parse(source);
    let module = &parsed.module;
    let count = module.nodes().count();
    for (id, _) in module.nodes() {
        let mut steps = 0;
        let mut cursor = id;
        while let Some(parent) = module.node(cursor).parent {
            cursor = parent;
            steps += 1;
            assert!(steps <= count, "parent chain of {id:?} does not terminate");
        }
        assert_eq!(cursor, module.root(), "node {id:?} is disconnected");
    }
}

#[test]
fn module_name_comes_from_the_path() {
    let named = |path: &str| {
        Parser::new(
            "x = 1\n",
            ParseOptions {
                module_path: Some(path.to_owned()),
                ..ParseOptions::default()
            },
        )
        .module
        .module_name()
    };
    assert_eq!(named("pkg/walk.py"), Some("walk".to_owned()));
    assert_eq!(named("pkg/__init__.py"), Some("pkg".to_owned()));
    assert_eq!(named("ext.so"), Some("ext".to_owned()));
}

#[test]
fn builtin_modules_have_no_py_path() {
    let with_path = |path: Option<&str>| {
        Parser::new(
            "x = 1\n",
            ParseOptions {
                module_path: path.map(str::to_owned),
                ..ParseOptions::default()
            },
        )
        .module
        .is_builtin()
    };
    assert!(!with_path(Some("mod.py")));
    assert!(with_path(Some("mod.so")));
    assert!(with_path(None));
}

#[test]
fn line_offset_shifts_reported_positions() {
    let parsed = Parser::new(
        "x = 1\n",
        ParseOptions {
            line_offset: 10,
            ..ParseOptions::default()
        },
    );
    let module = &parsed.module;
    let stmt = module.statements(module.root())[0];
    assert_eq!(module.start_pos(stmt).line, 11);
}

#[test]
fn lambda_becomes_a_scope_in_the_token_list() {
    let parsed = parse("add = lambda a, b: a + b\n");
    let module = &parsed.module;
    let stmt = module.statements(module.root())[0];
    let data = module.node(stmt).statement_data().unwrap();
    assert_eq!(set_var_texts(module, stmt), vec!["add".to_owned()]);

    let lambda = data
        .token_list
        .iter()
        .find_map(|t| match t {
            taipan::StmtToken::Lambda(id) => Some(*id),
            _ => None,
        })
        .expect("token list holds the lambda");
    let func = module.node(lambda).function_data().unwrap();
    assert!(func.name.is_none());
    assert_eq!(func.params.len(), 2);
    assert_eq!(func.returns.len(), 1);
    assert!(module.get_code(lambda).starts_with("lambda a,b:"));
}

#[test]
fn get_code_is_structurally_idempotent() {
    let source = "\
import os
from sys import argv
class C(Base):
    def m(self):
        return 1
def f(a, b=2):
    return a
x = 1
";
    let first = parse(source);
    let rendered = first.module.get_code(first.module.root());
    let second = parse(&rendered);

    let shape = |module: &Module| -> (Vec<String>, usize, usize) {
        let subs = module
            .subscopes(module.root())
            .iter()
            .filter_map(|&s| module.scope_name(s))
            .collect();
        (
            subs,
            module.imports(module.root()).len(),
            module.statements(module.root()).len(),
        )
    };
    assert_eq!(shape(&first.module), shape(&second.module));
}

#[test]
fn serialized_modules_round_trip() {
    let parsed = parse("def f(a):\n    return a\n");
    let json = serde_json::to_string(&parsed.module).expect("tree serializes");
    let restored: Module = serde_json::from_str(&json).expect("tree deserializes");
    assert_eq!(restored.subscopes(restored.root()).len(), 1);
    let func = restored.subscopes(restored.root())[0];
    assert_eq!(restored.scope_name(func), Some("f".to_owned()));
    // the lazy call tree was skipped and is recomputed on demand
    let ret = restored.node(func).function_data().unwrap().returns[0];
    assert!(restored.assignment_calls(ret).array().is_some());
}
