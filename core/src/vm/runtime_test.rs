//! Tests for the dispatch loop.

use std::sync::Arc;

use hashbrown::HashMap;
use indoc::indoc;
use pretty_assertions::assert_eq;

use crate::{
    Error,
    api::{CompilationOptions, ExecutionOptions},
    compiler::{BytecodeCompiler, Compiler},
    loader::ByteCodeLoader,
    parser::{self, BinaryOp, Literal},
    test_utils::init_test_logging,
    values::{Value, Vars},
    vm::{
        ExecutionState, Instruction, OutputMode, Program, ResourceExceededError, RuntimeError, VM,
    },
};

fn compile(name: &str, source: &str) -> Program {
    let template = parser::parse(name, source).unwrap();
    BytecodeCompiler::new(CompilationOptions::default())
        .compile(&template, source)
        .unwrap()
}

fn vars<const N: usize>(bindings: [(&str, Value); N]) -> Vars {
    bindings
        .into_iter()
        .map(|(name, value)| (name.into(), value))
        .collect()
}

fn render_with(vm: &VM, source: &str, vars: &Vars) -> Result<String, RuntimeError> {
    let program = compile("test.tx", source);
    let mut out = Vec::new();
    let written = vm.run(&program, vars, &mut out)?;
    assert_eq!(written, out.len());
    Ok(String::from_utf8(out).unwrap())
}

fn render(source: &str, vars: &Vars) -> String {
    render_with(&VM::default(), source, vars)
        .unwrap_or_else(|e| panic!("render failed for {:?}: {}", source, e))
}

fn render_err(source: &str, vars: &Vars) -> RuntimeError {
    match render_with(&VM::default(), source, vars) {
        Ok(out) => panic!("expected an error for {:?}, got {:?}", source, out),
        Err(e) => e,
    }
}

fn program(constants: Vec<Literal>, instructions: Vec<Instruction>) -> Program {
    let program = Program::new("hand.tx", constants, vec![], vec![], instructions);
    program.validate().unwrap();
    program
}

fn run_program(program: &Program, vars: &Vars) -> String {
    let mut out = Vec::new();
    VM::default().run(program, vars, &mut out).unwrap();
    String::from_utf8(out).unwrap()
}

// ============================================================================
// Hand-assembled programs
// ============================================================================

#[test]
fn test_literal_writes_concatenate_in_order() {
    use Instruction::*;
    let p = program(
        vec![Literal::Str("a".into()), Literal::Str("b".into())],
        vec![
            ConstLoad(0),
            Print(OutputMode::Raw),
            ConstLoad(1),
            Print(OutputMode::Raw),
            End,
        ],
    );
    assert_eq!(run_program(&p, &Vars::new()), "ab");
}

#[test]
fn test_conditional_jump() {
    use Instruction::*;
    for (cond, expected) in [
        (Literal::Bool(true), "T"),
        (Literal::Bool(false), "F"),
        (Literal::Int(0), "F"),
        (Literal::Str("0".into()), "F"),
        (Literal::Str("yes".into()), "T"),
        (Literal::Undef, "F"),
    ] {
        let p = program(
            vec![cond, Literal::Str("T".into()), Literal::Str("F".into())],
            vec![
                ConstLoad(0),           // 0
                PopJumpIfFalse(5),      // 1
                ConstLoad(1),           // 2
                Print(OutputMode::Raw), // 3
                Jump(7),                // 4
                ConstLoad(2),           // 5
                Print(OutputMode::Raw), // 6
                End,                    // 7
            ],
        );
        assert_eq!(run_program(&p, &Vars::new()), expected);
    }
}

#[test]
fn test_instructions_after_end_are_never_examined() {
    use Instruction::*;
    // The trailing End is required by validation; the first one halts.
    let p = Program::new(
        "hand.tx",
        vec![Literal::Str("x".into())],
        vec![],
        vec![],
        vec![End, ConstLoad(7), Pop, End],
    );
    let mut out = Vec::new();
    assert_eq!(VM::default().run(&p, &Vars::new(), &mut out).unwrap(), 0);
}

#[test]
fn test_loop_pops_its_frame_on_exhaustion() {
    for n in [0usize, 1, 5] {
        let items: Vec<Value> = (0..n).map(|i| Value::Int(i as i64)).collect();
        let program = compile("loop.tx", "[% FOREACH x IN xs %][% x %],[% END %]");
        let root = vars([("xs", Value::list(items))]);

        let mut out = Vec::new();
        let mut state = ExecutionState::new(&program, root, &mut out);
        VM::default().execute(&mut state).unwrap();

        assert_eq!(state.scope_depth(), 1);
        assert_eq!(state.stack_len(), 0);
        drop(state);

        let expected: String = (0..n).map(|i| format!("{},", i)).collect();
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }
}

// ============================================================================
// Expressions
// ============================================================================

#[test]
fn test_arithmetic_and_concat() {
    let v = vars([("n", Value::Int(4))]);
    assert_eq!(render("[% n * 2 + 1 %]", &v), "9");
    assert_eq!(render("[% n / 8 %]", &v), "0.5");
    assert_eq!(render("[% 'n=' ~ n %]", &v), "n=4");
    assert_eq!(render("[% -n %]", &v), "-4");
}

#[test]
fn test_short_circuit_keeps_deciding_value() {
    let v = vars([("empty", Value::str("")), ("name", Value::str("Ann"))]);
    assert_eq!(render("[% empty || name %]", &v), "Ann");
    assert_eq!(render("[% name && 'ok' %]", &v), "ok");
    assert_eq!(render("[% empty && missing %]", &v), "");
    assert_eq!(render("[% not empty %]", &v), "true");
}

#[test]
fn test_field_and_index_access() {
    let user = Value::map([
        ("name", Value::str("Ann")),
        ("tags", Value::list(["a", "b", "c"])),
    ]);
    let v = vars([("user", user), ("k", Value::str("name"))]);

    assert_eq!(render("[% user.name %]", &v), "Ann");
    assert_eq!(render("[% user[k] %]", &v), "Ann");
    assert_eq!(render("[% user.tags.1 %]", &v), "b");
    assert_eq!(render("[% user.tags[-1] %]", &v), "c");
    assert_eq!(render("[% user.tags[9] %]|[% user.missing %]|[% user.missing.deeper %]", &v), "||");
    assert_eq!(render("[% user.tags | length %]", &v), "3");
}

#[test]
fn test_field_of_scalar_is_type_error() {
    let v = vars([("n", Value::Int(1))]);
    assert!(matches!(render_err("[% n.x %]", &v), RuntimeError::Type { .. }));
}

#[test]
fn test_list_and_map_literals() {
    assert_eq!(render("[% [1, 'two', 3.5] %]", &Vars::new()), "[1, two, 3.5]");
    assert_eq!(render("[% [1, 2] | length %]", &Vars::new()), "2");
}

#[test]
fn test_output_is_html_escaped() {
    let v = vars([("html", Value::str("<b>&</b>"))]);
    assert_eq!(render("[% html %]", &v), "&lt;b&gt;&amp;&lt;/b&gt;");
    assert_eq!(render("[% html | raw %]", &v), "<b>&</b>");
    assert_eq!(render("<p>[% html | html %]</p>", &v), "<p>&lt;b&gt;&amp;&lt;/b&gt;</p>");
    assert_eq!(render("[% html | uc %]", &v), "&lt;B&gt;&amp;&lt;/B&gt;");
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn test_unbound_name() {
    match render_err("[% nope %]", &Vars::new()) {
        RuntimeError::UnboundName { name, .. } => assert_eq!(name.as_str(), "nope"),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_lenient_variables() {
    let vm = VM::new(ExecutionOptions {
        strict_variables: false,
        ..ExecutionOptions::default()
    });
    assert_eq!(render_with(&vm, "[[% nope %]]", &Vars::new()).unwrap(), "[]");
}

#[test]
fn test_type_errors() {
    let v = vars([("s", Value::str("x")), ("l", Value::list([1]))]);
    assert!(matches!(render_err("[% s + 1 %]", &v), RuntimeError::Type { .. }));
    assert!(matches!(render_err("[% 1 / 0 %]", &v), RuntimeError::Type { .. }));
    assert!(matches!(render_err("[% l < 1 %]", &v), RuntimeError::Type { .. }));
    assert!(matches!(render_err("[% s() %]", &v), RuntimeError::Type { .. }));
}

#[test]
fn test_partial_output_is_not_rolled_back() {
    let program = compile("test.tx", "before[% nope %]after");
    let mut out = Vec::new();
    let result = VM::default().run(&program, &Vars::new(), &mut out);
    assert!(result.is_err());
    assert_eq!(String::from_utf8(out).unwrap(), "before");
}

#[test]
fn test_iterating_a_scalar_is_iterator_protocol_error() {
    let v = vars([("n", Value::Int(3))]);
    assert!(matches!(
        render_err("[% FOREACH x IN n %][% END %]", &v),
        RuntimeError::IteratorProtocol { .. }
    ));
}

#[test]
fn test_loop_iteration_outside_loop_frame() {
    use Instruction::*;
    let p = Program::new(
        "hand.tx",
        vec![],
        vec!["x".into()],
        vec![],
        vec![ForIter { var: 0, exit: 1 }, End],
    );
    let mut out = Vec::new();
    assert!(matches!(
        VM::default().run(&p, &Vars::new(), &mut out),
        Err(RuntimeError::IteratorProtocol { .. })
    ));
}

#[test]
fn test_stack_underflow_is_malformed_program() {
    use Instruction::*;
    let p = program(vec![], vec![BinOp(BinaryOp::Add), End]);
    let mut out = Vec::new();
    assert!(matches!(
        VM::default().run(&p, &Vars::new(), &mut out),
        Err(RuntimeError::MalformedProgram { ip: 0, .. })
    ));
}

#[test]
fn test_max_steps() {
    let vm = VM::new(ExecutionOptions {
        max_steps: Some(100),
        ..ExecutionOptions::default()
    });
    let err = render_with(&vm, "[% WHILE 1 %]x[% END %]", &Vars::new()).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ResourceExceeded(ResourceExceededError::Steps { max_steps: 100 })
    ));
}

// ============================================================================
// Loops and scopes
// ============================================================================

#[test]
fn test_loop_metadata() {
    let v = vars([("xs", Value::list(["a", "b", "c"]))]);
    let source = "[% FOREACH x IN xs %][% loop.count %]/[% loop.size %]:[% x %][% IF loop.first %](first)[% END %][% IF loop.last %](last)[% END %];[% END %]";
    assert_eq!(render(source, &v), "1/3:a(first);2/3:b;3/3:c(last);");
}

#[test]
fn test_multiline_template_keeps_text_verbatim() {
    let v = vars([("items", Value::list(["a", "b"]))]);
    let source = indoc! {"
        <ul>
        [% FOREACH item IN items %]  <li>[% item %]</li>
        [% END %]</ul>
    "};
    assert_eq!(
        render(source, &v),
        indoc! {"
            <ul>
              <li>a</li>
              <li>b</li>
            </ul>
        "}
    );
}

#[test]
fn test_loop_over_map_keys_and_undef() {
    let v = vars([("m", Value::map([("b", 2), ("a", 1)]))]);
    assert_eq!(
        render("[% FOREACH k IN m %][% k %]=[% m[k] %];[% END %]", &v),
        "a=1;b=2;"
    );
    assert_eq!(
        render("[% FOREACH k IN undef %]x[% END %]done", &Vars::new()),
        "done"
    );
}

#[test]
fn test_loop_variable_does_not_leak() {
    let v = vars([("x", Value::str("outer")), ("xs", Value::list([1, 2]))]);
    assert_eq!(
        render("[% FOREACH x IN xs %][% x %][% SET tmp = 1 %][% END %][% x %]", &v),
        "12outer"
    );

    let err = render_err(
        "[% FOREACH x IN xs %][% SET tmp = 1 %][% END %][% tmp %]",
        &v,
    );
    assert!(matches!(err, RuntimeError::UnboundName { .. }));
}

#[test]
fn test_set_inside_loop_shadows_outer_name() {
    let v = vars([("xs", Value::list([1, 2]))]);
    assert_eq!(
        render(
            "[% SET total = 0 %][% FOREACH x IN xs %][% SET total = x %][% total %],[% END %][% total %]",
            &v
        ),
        "1,2,0"
    );
}

#[test]
fn test_while_loop() {
    assert_eq!(
        render(
            "[% SET i = 0 %][% WHILE i < 3 %][% i %][% SET i = i + 1 %][% END %]",
            &Vars::new()
        ),
        "012"
    );
}

#[test]
fn test_nested_loops() {
    let v = vars([("rows", Value::list([Value::list([1, 2]), Value::list([3])]))]);
    assert_eq!(
        render(
            "[% FOREACH row IN rows %]<[% FOREACH c IN row %][% c %][% END %]>[% END %]",
            &v
        ),
        "<12><3>"
    );
}

#[test]
fn test_caller_vars_are_not_mutated() {
    let v = vars([("a", Value::Int(1))]);
    assert_eq!(render("[% SET a = 2 %][% a %]", &v), "2");
    assert_eq!(v.get("a"), Some(&Value::Int(1)));
}

// ============================================================================
// Macros
// ============================================================================

#[test]
fn test_macro_call() {
    let source = "[% MACRO greet(who, punct) BLOCK %]Hi [% who %][% punct %][% END %][% greet('Ann', '!') %] [% greet('<Bob>', '?') %]";
    assert_eq!(render(source, &Vars::new()), "Hi Ann! Hi &lt;Bob&gt;?");
}

#[test]
fn test_macro_output_is_not_escaped_twice() {
    let source = "[% MACRO b(x) BLOCK %]<b>[% x %]</b>[% END %][% b('&') %]";
    assert_eq!(render(source, &Vars::new()), "<b>&amp;</b>");
}

#[test]
fn test_macro_scope_is_closure_not_caller() {
    let v = vars([("name", Value::str("global")), ("names", Value::list(["loop"]))]);
    let source = "[% MACRO show BLOCK %][% name %][% END %][% FOREACH name IN names %][% show() %][% END %]";
    assert_eq!(render(source, &v), "global");
}

#[test]
fn test_macro_locals_do_not_leak() {
    let source = "[% MACRO m(x) BLOCK %][% SET inner = x %][% END %][% m(1) %][% inner %]";
    assert!(matches!(
        render_err(source, &Vars::new()),
        RuntimeError::UnboundName { .. }
    ));
}

#[test]
fn test_macro_arity() {
    let source = "[% MACRO m(a, b) BLOCK %][% END %][% m(1) %]";
    match render_err(source, &Vars::new()) {
        RuntimeError::Arity {
            name,
            expected,
            got,
            ..
        } => {
            assert_eq!(name.as_str(), "m");
            assert_eq!((expected, got), (2, 1));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_recursive_macro_depth_is_bounded() {
    let vm = VM::new(ExecutionOptions {
        max_depth: 10,
        ..ExecutionOptions::default()
    });
    let source = "[% MACRO r(n) BLOCK %][% n %][% IF n < 5 %][% r(n + 1) %][% END %][% END %][% r(1) %]";
    assert_eq!(render_with(&vm, source, &Vars::new()).unwrap(), "12345");

    let source = "[% MACRO r BLOCK %][% r() %][% END %][% r() %]";
    assert!(matches!(
        render_with(&vm, source, &Vars::new()).unwrap_err(),
        RuntimeError::ResourceExceeded(ResourceExceededError::CallDepth { max_depth: 10, .. })
    ));
}

#[test]
fn test_macro_from_another_program_is_rejected() {
    init_test_logging();
    let first = compile("a.tx", "[% MACRO m BLOCK %]x[% END %]");
    let mut state_out = Vec::new();
    let mut state = ExecutionState::new(&first, Vars::new(), &mut state_out);
    VM::default().execute(&mut state).unwrap();
    let macro_value = state.scopes.lookup("m").cloned().unwrap();
    drop(state);

    let err = render_err("[% m() %]", &vars([("m", macro_value)]));
    assert!(matches!(err, RuntimeError::Type { .. }));
}

// ============================================================================
// Includes
// ============================================================================

/// A loader over pre-compiled programs.
struct StaticLoader(HashMap<String, Arc<Program>>);

impl StaticLoader {
    fn new(templates: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self(
            templates
                .iter()
                .map(|(name, source)| (name.to_string(), Arc::new(compile(name, source))))
                .collect(),
        ))
    }
}

impl ByteCodeLoader for StaticLoader {
    fn load(&self, name: &str) -> Result<Arc<Program>, Error> {
        self.0.get(name).cloned().ok_or_else(|| Error::TemplateNotFound {
            name: name.into(),
            paths: vec![],
        })
    }

    fn load_string(&self, name: &str, source: &str) -> Result<Arc<Program>, Error> {
        Ok(Arc::new(compile(name, source)))
    }
}

#[test]
fn test_include_shares_sink_and_sees_caller_scope() {
    let loader = StaticLoader::new(&[("row.tx", "<[% label %]:[% x %]>")]);
    let vm = VM::default().with_loader(loader);
    let v = vars([("label", Value::str("n")), ("xs", Value::list([1, 2]))]);
    let out = render_with(
        &vm,
        "[[% FOREACH x IN xs %][% INCLUDE 'row.tx' %][% END %]]",
        &v,
    )
    .unwrap();
    assert_eq!(out, "[<n:1><n:2>]");
}

#[test]
fn test_include_with_args_does_not_leak_back() {
    let loader = StaticLoader::new(&[("set.tx", "[% SET leaked = 1 %][% who %]")]);
    let vm = VM::default().with_loader(loader);
    let out = render_with(&vm, "[% INCLUDE 'set.tx' WITH who = 'Ann' %]", &Vars::new()).unwrap();
    assert_eq!(out, "Ann");

    let err = render_with(
        &vm,
        "[% INCLUDE 'set.tx' WITH who = 1 %][% leaked %]",
        &Vars::new(),
    )
    .unwrap_err();
    assert!(matches!(err, RuntimeError::UnboundName { .. }));
}

#[test]
fn test_include_inside_macro_is_captured() {
    let loader = StaticLoader::new(&[("inner.tx", "<i>")]);
    let vm = VM::default().with_loader(loader);
    let out = render_with(
        &vm,
        "[% MACRO wrap BLOCK %][[% INCLUDE 'inner.tx' %]][% END %]{[% wrap() %]}",
        &Vars::new(),
    )
    .unwrap();
    assert_eq!(out, "{[<i>]}");
}

#[test]
fn test_include_errors() {
    let err = render_with(&VM::default(), "[% INCLUDE 'x.tx' %]", &Vars::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::NoLoader { .. }));

    let loader = StaticLoader::new(&[("bad.tx", "[% nope %]")]);
    let vm = VM::default().with_loader(loader);
    match render_with(&vm, "[% INCLUDE 'missing.tx' %]", &Vars::new()).unwrap_err() {
        RuntimeError::Include { name, source } => {
            assert_eq!(name.as_str(), "missing.tx");
            assert!(matches!(*source, Error::TemplateNotFound { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    match render_with(&vm, "[% INCLUDE 'bad.tx' %]", &Vars::new()).unwrap_err() {
        RuntimeError::Include { source, .. } => {
            assert!(matches!(
                *source,
                Error::Runtime(RuntimeError::UnboundName { .. })
            ));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_recursive_include_is_bounded() {
    let loader = StaticLoader::new(&[("loop.tx", "[% INCLUDE 'loop.tx' %]")]);
    let vm = VM::new(ExecutionOptions {
        max_depth: 8,
        ..ExecutionOptions::default()
    })
    .with_loader(loader);
    assert!(matches!(
        render_with(&vm, "[% INCLUDE 'loop.tx' %]", &Vars::new()).unwrap_err(),
        RuntimeError::ResourceExceeded(ResourceExceededError::CallDepth { .. })
    ));
}

#[test]
fn test_self_include_stops_at_default_include_depth() {
    let loader = StaticLoader::new(&[("loop.tx", "x[% INCLUDE 'loop.tx' %]")]);
    let vm = VM::default().with_loader(loader);
    let program = compile("page.tx", "[% INCLUDE 'loop.tx' %]");
    let mut out = Vec::new();

    let err = vm.run(&program, &Vars::new(), &mut out).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::ResourceExceeded(ResourceExceededError::IncludeDepth {
            depth: 65,
            max_include_depth: 64,
        })
    ));
    // Every level that ran wrote its output before the limit was hit.
    assert_eq!(out, "x".repeat(64).into_bytes());
}

#[test]
fn test_depth_counts_macros_enclosing_an_include() {
    let loader = StaticLoader::new(&[
        (
            "inner.tx",
            "[% MACRO n BLOCK %][% INCLUDE 'leaf.tx' %][% END %][% n() %]",
        ),
        ("leaf.tx", "x"),
    ]);
    let source = "[% MACRO m BLOCK %][% INCLUDE 'inner.tx' %][% END %][% m() %]";
    let with_depth = |max_depth| {
        VM::new(ExecutionOptions {
            max_depth,
            ..ExecutionOptions::default()
        })
        .with_loader(loader.clone())
    };

    // m -> inner.tx -> n -> leaf.tx
    assert_eq!(render_with(&with_depth(4), source, &Vars::new()).unwrap(), "x");
    assert!(matches!(
        render_with(&with_depth(3), source, &Vars::new()).unwrap_err(),
        RuntimeError::ResourceExceeded(ResourceExceededError::CallDepth {
            depth: 4,
            max_depth: 3,
        })
    ));
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_runs_share_one_program() {
    let program = compile(
        "shared.tx",
        "[% FOREACH i IN items %][% name %]-[% i %];[% END %]",
    );
    let vm = VM::default();

    let outputs: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let (program, vm) = (&program, &vm);
                scope.spawn(move || {
                    let v = vars([
                        ("name", Value::str(format!("t{}", n))),
                        ("items", Value::list((0..50).map(|i| Value::Int(i + n)))),
                    ]);
                    let mut out = Vec::new();
                    vm.run(program, &v, &mut out).unwrap();
                    String::from_utf8(out).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (n, output) in outputs.iter().enumerate() {
        let expected: String = (0..50)
            .map(|i| format!("t{}-{};", n, i + n as i64))
            .collect();
        assert_eq!(output, &expected);
    }
}
