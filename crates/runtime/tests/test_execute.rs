//! End-to-end execution tests
//!
//! Full pipeline: source in, value out. Each test drives a fresh
//! context the way an embedding host would.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use brio_runtime::{Config, Context, ErrorKind, Value, ValueKind};

fn repl_context() -> Context {
    Context::new(Config::new().with_repl_mode(true))
}

fn eval(ctx: &mut Context, source: &str) -> Value {
    let value = ctx.execute(source);
    assert!(
        !ctx.has_errors(),
        "unexpected errors for {:?}: {:?}",
        source,
        ctx.errors().map(|e| e.to_string()).collect::<Vec<_>>()
    );
    value
}

fn eval_number(source: &str) -> f64 {
    let mut ctx = repl_context();
    let value = eval(&mut ctx, source);
    value
        .as_number()
        .unwrap_or_else(|| panic!("expected number from {:?}, got {:?}", source, value))
}

fn eval_string(source: &str) -> String {
    let mut ctx = repl_context();
    let value = eval(&mut ctx, source);
    ctx.string_of(value)
        .unwrap_or_else(|| panic!("expected string from {:?}, got {:?}", source, value))
}

fn eval_bool(source: &str) -> bool {
    let mut ctx = repl_context();
    let value = eval(&mut ctx, source);
    value
        .as_bool()
        .unwrap_or_else(|| panic!("expected bool from {:?}, got {:?}", source, value))
}

// ----------------------------------------------------------------------
// The canonical scenarios
// ----------------------------------------------------------------------

#[test]
fn test_constant_folded_arithmetic() {
    assert_eq!(eval_number("var x = 1 + 2 * 3; x"), 7.0);
}

#[test]
fn test_template_string() {
    assert_eq!(
        eval_string("const greet = fn(n) { return `hello ${n}` }; greet(\"world\")"),
        "hello world"
    );
}

#[test]
fn test_negative_index_wraps_once() {
    assert_eq!(eval_number("var a = [1,2,3]; a[-1]"), 3.0);
    let mut ctx = repl_context();
    assert!(eval(&mut ctx, "var a = [1,2,3]; a[-4]").is_null());
    assert!(eval(&mut ctx, "a[3]").is_null());
}

#[test]
fn test_dot_is_index_sugar() {
    assert_eq!(
        eval_number("var m = {\"k\": 1}; m.k = m.k + 10; m[\"k\"]"),
        11.0
    );
}

#[test]
fn test_closure_counter() {
    assert_eq!(
        eval_number(
            "fn counter() { var i = 0; return fn() { i = i + 1; return i } }\n\
             var c = counter(); c(); c(); c()"
        ),
        3.0
    );
}

#[test]
fn test_recover_catches_crash() {
    assert_eq!(
        eval_string(
            "fn f() { recover (e) { return \"caught:\" + e.message } crash(\"boom\") }\nf()"
        ),
        "caught:boom"
    );
}

// ----------------------------------------------------------------------
// Language semantics
// ----------------------------------------------------------------------

#[test]
fn test_loops() {
    assert_eq!(
        eval_number("var sum = 0; for (var i = 0; i < 5; i++) { sum += i } sum"),
        10.0
    );
    assert_eq!(
        eval_number("var sum = 0; for (x in [1, 2, 3]) { sum += x } sum"),
        6.0
    );
    assert_eq!(
        eval_number("var n = 0; while (n < 10) { n = n + 1; if (n == 5) { break } } n"),
        5.0
    );
    assert_eq!(
        eval_number(
            "var s = 0; for (var i = 0; i < 5; i++) { if (i == 2) { continue } s += i } s"
        ),
        8.0
    );
}

#[test]
fn test_foreach_over_map_yields_keys() {
    assert_eq!(
        eval_string("var acc = \"\"; for (k in {\"x\": 1, \"y\": 2}) { acc += k } acc"),
        "xy"
    );
}

#[test]
fn test_foreach_over_string() {
    assert_eq!(
        eval_string("var acc = \"\"; for (c in \"abc\") { acc = c + acc } acc"),
        "cba"
    );
}

#[test]
fn test_string_indexing() {
    assert_eq!(eval_string("\"abc\"[1]"), "b");
    assert_eq!(eval_string("\"abc\"[-1]"), "c");
    let mut ctx = repl_context();
    assert!(eval(&mut ctx, "\"abc\"[7]").is_null());
}

#[test]
fn test_equality_semantics() {
    assert!(eval_bool("1 == true"));
    assert!(eval_bool("null == null"));
    assert!(!eval_bool("null == 0"));
    assert!(!eval_bool("\"a\" == 1"));
    assert!(eval_bool("\"abc\" == \"abc\""));
    assert!(eval_bool("\"abc\" != \"abd\""));
    assert!(eval_bool("\"a\" < \"ab\""));
}

#[test]
fn test_ordering_mixed_types_is_error() {
    let mut ctx = repl_context();
    ctx.execute("var r = \"a\" < 1;");
    assert!(ctx.has_errors());
    assert_eq!(ctx.error(0).map(|e| e.kind), Some(ErrorKind::Runtime));
}

#[test]
fn test_string_concat_and_array_append_add() {
    assert_eq!(eval_string("\"foo\" + \"bar\""), "foobar");
    assert_eq!(eval_number("var a = [1]; a + 2; len(a)"), 2.0);
    assert_eq!(eval_number("var a = [1]; a + 2; a[-1]"), 2.0);
}

#[test]
fn test_bitwise_and_shift() {
    assert_eq!(eval_number("6 & 3"), 2.0);
    assert_eq!(eval_number("6 | 3"), 7.0);
    assert_eq!(eval_number("6 ^ 3"), 5.0);
    assert_eq!(eval_number("1 << 4"), 16.0);
    assert_eq!(eval_number("16 >> 2"), 4.0);
    assert_eq!(eval_number("7 % 4"), 3.0);
}

#[test]
fn test_logical_short_circuit() {
    let mut ctx = repl_context();
    let v = eval(&mut ctx, "false && crash(\"never\")");
    assert_eq!(v.as_bool(), Some(false));
    let v = eval(&mut ctx, "true || crash(\"never\")");
    assert_eq!(v.as_bool(), Some(true));
}

#[test]
fn test_ternary() {
    assert_eq!(eval_number("1 > 0 ? 10 : 20"), 10.0);
    assert_eq!(eval_number("1 < 0 ? 10 : 20"), 20.0);
}

#[test]
fn test_bang_matches_conditional_truthiness() {
    // !x and `if (x)` must agree on what is falsy.
    assert!(eval_bool("!0"));
    assert!(!eval_bool("!1"));
    assert!(eval_bool("!null"));
    assert!(!eval_bool("!\"s\""));
    assert!(!eval_bool("![]"));
    assert_eq!(
        eval_number("fn pick(c) { if (!c) { return 1 } return 2 } pick(0)"),
        1.0
    );
    assert_eq!(
        eval_number("fn pick(c) { if (!c) { return 1 } return 2 } pick(3)"),
        2.0
    );
}

#[test]
fn test_incdec_pre_and_post() {
    assert_eq!(eval_number("var x = 5; var y = x++; y"), 5.0);
    assert_eq!(eval_number("var x = 5; x++; x"), 6.0);
    assert_eq!(eval_number("var x = 5; var y = ++x; y"), 6.0);
    assert_eq!(eval_number("var m = {n: 1}; m.n++; m.n"), 2.0);
}

#[test]
fn test_chained_assignment() {
    assert_eq!(eval_number("var x = 0; var y = 0; x = y = 3; x"), 3.0);
}

#[test]
fn test_implicit_declaration_on_assignment() {
    assert_eq!(eval_number("q = 41; q + 1"), 42.0);
}

#[test]
fn test_compound_assignments() {
    assert_eq!(eval_number("var x = 8; x -= 2; x *= 3; x /= 2; x"), 9.0);
    assert_eq!(eval_number("var x = 6; x &= 3; x |= 8; x ^= 1; x"), 11.0);
    assert_eq!(eval_number("var x = 1; x <<= 3; x >>= 1; x"), 4.0);
}

#[test]
fn test_recursion() {
    assert_eq!(
        eval_number("fn fact(n) { if (n == 0) { return 1 } return n * fact(n - 1) } fact(6)"),
        720.0
    );
}

#[test]
fn test_anonymous_recursion_via_const_name() {
    assert_eq!(
        eval_number("const fib = fn(n) { if (n < 2) { return n } return fib(n-1) + fib(n-2) }; fib(10)"),
        55.0
    );
}

#[test]
fn test_higher_order_functions() {
    assert_eq!(
        eval_number(
            "fn apply_twice(f, x) { return f(f(x)) }\n\
             apply_twice(fn(n) { return n * 3 }, 2)"
        ),
        18.0
    );
}

#[test]
fn test_nested_template_segments() {
    assert_eq!(
        eval_string("var x = 1; var y = 2; `a${x}b${y}c`"),
        "a1b2c"
    );
}

#[test]
fn test_map_literal_order_preserved() {
    assert_eq!(
        eval_string("var ks = keys({\"b\": 1, \"a\": 2, \"c\": 3}); ks[0] + ks[1] + ks[2]"),
        "bac"
    );
}

#[test]
fn test_cyclic_map_stringifies() {
    assert_eq!(
        eval_string("var m = {}; m.self = m; to_str(m)"),
        "{\"self\": ...}"
    );
}

// ----------------------------------------------------------------------
// Operator overloading
// ----------------------------------------------------------------------

#[test]
fn test_operator_overloading_left_operand_wins() {
    assert_eq!(
        eval_number(
            "var a = {\"__operator_add__\": fn(x, y) { return 42 }}\n\
             var r = a + 1; r"
        ),
        42.0
    );
}

#[test]
fn test_operator_overloading_right_fallback() {
    assert_eq!(
        eval_number(
            "var a = {\"__operator_add__\": fn(x, y) { return 42 }}\n\
             var b = {}\n\
             var r = b + a; r"
        ),
        42.0
    );
}

#[test]
fn test_operator_overloading_receives_operands() {
    assert_eq!(
        eval_number(
            "var v = {\"__operator_mul__\": fn(l, r) { return l.n * r }, n: 6}\n\
             var r = v * 7; r"
        ),
        42.0
    );
}

#[test]
fn test_unary_overloading() {
    assert_eq!(
        eval_number("var m = {\"__operator_minus__\": fn(x) { return 7 }}; var r = -m; r"),
        7.0
    );
}

#[test]
fn test_cmp_overloading() {
    assert!(eval_bool(
        "var c = {\"__cmp__\": fn(l, r) { return 1 }}; var r = c < 1; is_bool(r)"
    ));
}

// ----------------------------------------------------------------------
// Errors, recover, tracebacks
// ----------------------------------------------------------------------

#[test]
fn test_uncaught_crash_surfaces_user_error() {
    let mut ctx = repl_context();
    ctx.execute("crash(\"boom\")");
    assert!(ctx.has_errors());
    let err = ctx.error(0).expect("error");
    assert_eq!(err.kind, ErrorKind::User);
    assert_eq!(err.message, "boom");
}

#[test]
fn test_runtime_error_positions() {
    let mut ctx = repl_context();
    ctx.execute("var a = 1;\nvar b = a + \"s\";");
    assert!(ctx.has_errors());
    let err = ctx.error(0).expect("error");
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.pos.line, 1);
}

#[test]
fn test_recover_locality_and_traceback() {
    let mut ctx = repl_context();
    let v = eval(
        &mut ctx,
        "fn inner() { crash(\"deep\") }\n\
         fn outer() { recover (e) { return e } inner() }\n\
         var e = outer(); e",
    );
    assert_eq!(ctx.kind_of(v), ValueKind::Error);
    let message = eval(&mut ctx, "e.message");
    assert_eq!(ctx.string_of(message).as_deref(), Some("deep"));
    let tb = eval(&mut ctx, "e.traceback");
    let tb_text = ctx.string_of(tb).expect("traceback text");
    assert!(tb_text.contains("inner"), "traceback: {}", tb_text);
}

#[test]
fn test_inner_recover_takes_precedence() {
    assert_eq!(
        eval_string(
            "fn inner() { recover (e) { return \"inner:\" + e.message } crash(\"x\") }\n\
             fn outer() { recover (e) { return \"outer:\" + e.message } return inner() }\n\
             outer()"
        ),
        "inner:x"
    );
}

#[test]
fn test_error_propagates_through_recovering_frame() {
    // A crash inside the handler itself is not caught again by the
    // same frame.
    assert_eq!(
        eval_string(
            "fn inner() { recover (e) { crash(\"second:\" + e.message) } crash(\"first\") }\n\
             fn outer() { recover (e) { return e.message } return inner() }\n\
             outer()"
        ),
        "second:first"
    );
}

#[test]
fn test_error_value_from_error_builtin() {
    let mut ctx = repl_context();
    let v = eval(&mut ctx, "var e = error(\"made\"); e");
    assert_eq!(ctx.kind_of(v), ValueKind::Error);
    assert!(eval(&mut ctx, "is_error(e)").as_bool().unwrap());
}

#[test]
fn test_parse_errors_halt_before_execution() {
    let captured: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&captured);
    let hook: brio_runtime::StdoutHook = Rc::new(RefCell::new(move |bytes: &[u8]| {
        sink.borrow_mut().extend_from_slice(bytes);
        bytes.len()
    }));
    let mut ctx = Context::new(
        Config::new()
            .with_repl_mode(true)
            .with_stdout_write(hook),
    );
    ctx.execute("println(\"should not run\"); var = 2;");
    assert!(ctx.has_errors());
    assert_eq!(ctx.error(0).map(|e| e.kind), Some(ErrorKind::Parsing));
    assert!(captured.borrow().is_empty());
}

// ----------------------------------------------------------------------
// Timeout
// ----------------------------------------------------------------------

#[test]
fn test_timeout_fires() {
    let mut ctx = Context::new(
        Config::new()
            .with_repl_mode(true)
            .with_max_execution_time(Duration::from_millis(10)),
    );
    ctx.execute("while (true) {}");
    assert!(ctx.has_errors());
    assert_eq!(ctx.error(0).map(|e| e.kind), Some(ErrorKind::Timeout));
}

#[test]
fn test_timeout_not_recoverable() {
    let mut ctx = Context::new(
        Config::new()
            .with_repl_mode(true)
            .with_max_execution_time(Duration::from_millis(10)),
    );
    ctx.execute("fn f() { recover (e) { return 1 } while (true) {} } f()");
    assert!(ctx.has_errors());
    assert_eq!(ctx.error(0).map(|e| e.kind), Some(ErrorKind::Timeout));
}

// ----------------------------------------------------------------------
// VM state invariants
// ----------------------------------------------------------------------

#[test]
fn test_frame_balance_after_success() {
    let mut ctx = repl_context();
    eval(&mut ctx, "fn f(a) { return a * 2 } f(21)");
    assert_eq!(ctx.stack_pointer(), 0);
    assert_eq!(ctx.frame_count(), 0);
}

#[test]
fn test_frame_balance_after_failure() {
    let mut ctx = repl_context();
    ctx.execute("fn f() { crash(\"x\") } fn g() { return f() } g()");
    assert!(ctx.has_errors());
    assert_eq!(ctx.stack_pointer(), 0);
    assert_eq!(ctx.frame_count(), 0);
}

#[test]
fn test_gc_reclaims_garbage() {
    let mut ctx = repl_context();
    eval(
        &mut ctx,
        "for (i in range(2000)) { var s = \"garbage \" + to_str(i) }",
    );
    assert!(
        ctx.live_objects() < 500,
        "live objects: {}",
        ctx.live_objects()
    );
}

#[test]
fn test_globals_survive_collection() {
    let mut ctx = repl_context();
    eval(
        &mut ctx,
        "var keep = \"important\"\n\
         for (i in range(2000)) { var s = \"garbage \" + to_str(i) }",
    );
    let keep_val = eval(&mut ctx, "keep");
    assert_eq!(ctx.string_of(keep_val).as_deref(), Some("important"));
}

// ----------------------------------------------------------------------
// REPL continuity
// ----------------------------------------------------------------------

#[test]
fn test_repl_state_persists_across_executes() {
    let mut ctx = repl_context();
    eval(&mut ctx, "var x = 40");
    eval(&mut ctx, "var y = 2");
    assert_eq!(eval(&mut ctx, "x + y").as_number(), Some(42.0));
}

#[test]
fn test_repl_map_expression_at_top_level() {
    let mut ctx = repl_context();
    let v = eval(&mut ctx, "{a: 1}");
    assert_eq!(ctx.kind_of(v), ValueKind::Map);
}

// ----------------------------------------------------------------------
// Host embedding
// ----------------------------------------------------------------------

#[test]
fn test_stdout_hook_captures_println() {
    let captured: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&captured);
    let hook: brio_runtime::StdoutHook = Rc::new(RefCell::new(move |bytes: &[u8]| {
        sink.borrow_mut().extend_from_slice(bytes);
        bytes.len()
    }));
    let mut ctx = Context::new(Config::new().with_repl_mode(true).with_stdout_write(hook));
    eval(&mut ctx, "println(\"a\", 1, [2, \"x\"])");
    assert_eq!(
        String::from_utf8_lossy(&captured.borrow()),
        "a 1 [2, \"x\"]\n"
    );
}

#[test]
fn test_set_native_function() {
    let mut ctx = repl_context();
    ctx.set_native_function("add2", |_api, args| {
        let (Some(a), Some(b)) = (args[0].as_number(), args[1].as_number()) else {
            return Err("add2: expected numbers".to_string());
        };
        Ok(Value::number(a + b))
    });
    assert_eq!(eval(&mut ctx, "add2(40, 2)").as_number(), Some(42.0));
}

#[test]
fn test_native_error_is_recoverable() {
    let mut ctx = repl_context();
    ctx.set_native_function("always_fails", |_api, _args| Err("nope".to_string()));
    let result = eval(
        &mut ctx,
        "fn f() { recover (e) { return e.message } always_fails() } f()",
    );
    assert_eq!(ctx.string_of(result).as_deref(), Some("nope"));
}

#[test]
fn test_native_reenters_vm_via_call_value() {
    let mut ctx = repl_context();
    ctx.set_native_function("apply", |api, args| {
        api.call_value(args[0], &args[1..])
    });
    assert_eq!(
        eval(&mut ctx, "fn inc(x) { return x + 1 } apply(inc, 41)").as_number(),
        Some(42.0)
    );
}

#[test]
fn test_host_call_value() {
    let mut ctx = repl_context();
    eval(&mut ctx, "fn triple(x) { return x * 3 }");
    let f = ctx.get_object("triple");
    assert_eq!(ctx.kind_of(f), ValueKind::Function);
    let result = ctx.call_value(f, &[Value::number(14.0)]).expect("call");
    assert_eq!(result.as_number(), Some(42.0));
}

#[test]
fn test_global_constant_and_shadow_rejection() {
    let mut ctx = repl_context();
    ctx.set_global_constant("answer", Value::number(42.0));
    assert_eq!(eval(&mut ctx, "answer").as_number(), Some(42.0));
    ctx.execute("var answer = 1;");
    assert!(ctx.has_errors());
}

#[test]
fn test_get_object_finds_script_globals() {
    let mut ctx = repl_context();
    eval(&mut ctx, "var answer = 42");
    assert_eq!(ctx.get_object("answer").as_number(), Some(42.0));
    assert_eq!(ctx.kind_of(ctx.get_object("len")), ValueKind::Native);
    assert!(ctx.get_object("missing").is_null());
}

#[test]
fn test_pinned_value_survives_runs() {
    let mut ctx = repl_context();
    let s = ctx.make_string("pinned across runs");
    ctx.pin(s);
    eval(&mut ctx, "for (i in range(2000)) { var g = \"garbage\" + to_str(i) }");
    assert_eq!(ctx.string_of(s).as_deref(), Some("pinned across runs"));
    ctx.unpin(s);
}

#[test]
fn test_external_values_round_trip() {
    let mut ctx = repl_context();
    let payload: Rc<dyn std::any::Any> = Rc::new(1234u32);
    let external = ctx.make_external(payload, None);
    assert_eq!(ctx.kind_of(external), ValueKind::External);
    ctx.set_global_constant("handle", external);
    // Scripts can carry the value around but not look inside it.
    let v = eval(&mut ctx, "fn id(x) { return x } id(handle)");
    let data = ctx.external_of(v).expect("external data");
    assert_eq!(data.downcast_ref::<u32>(), Some(&1234));
}

#[test]
fn test_error_json_serialization() {
    let mut ctx = repl_context();
    ctx.execute("crash(\"boom\")");
    let err = ctx.error(0).expect("error");
    let json = Context::error_to_json(err);
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    assert_eq!(parsed["kind"], "USER");
    assert_eq!(parsed["message"], "boom");
    assert_eq!(parsed["line"], 1);
}

#[test]
fn test_serialize_error_shows_source_line() {
    let mut ctx = repl_context();
    ctx.execute("var x = missing_name;");
    let err = ctx.error(0).expect("error");
    let text = Context::serialize_error(err);
    assert!(text.contains("missing_name"), "got: {}", text);
    assert!(text.contains('^'), "got: {}", text);
}

// ----------------------------------------------------------------------
// Modules
// ----------------------------------------------------------------------

fn module_hook(
    modules: &'static [(&'static str, &'static str)],
) -> brio_runtime::FileReadHook {
    Rc::new(RefCell::new(move |path: &str| {
        modules
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(_, src)| src.to_string())
            .ok_or_else(|| format!("{}: not found", path))
    }))
}

#[test]
fn test_import_end_to_end() {
    let mut ctx = Context::new(
        Config::new()
            .with_repl_mode(true)
            .with_file_read(module_hook(&[(
                "mod.brio",
                "var value = 10\nfn double(x) { return x * 2 }",
            )])),
    );
    assert_eq!(
        eval(&mut ctx, "import \"mod\"; mod::double(mod::value) + 1").as_number(),
        Some(21.0)
    );
}

#[test]
fn test_import_shared_module_once() {
    let mut ctx = Context::new(
        Config::new()
            .with_repl_mode(true)
            .with_file_read(module_hook(&[
                ("shared.brio", "var hits = 0\nfn bump() { hits = hits + 1; return hits }"),
                ("a.brio", "import \"shared\"\nvar from_a = shared::bump()"),
                ("b.brio", "import \"shared\"\nvar from_b = shared::bump()"),
            ])),
    );
    // shared's top level runs once; both a and b bump the same global.
    assert_eq!(
        eval(&mut ctx, "import \"a\"\nimport \"b\"\nb::from_b").as_number(),
        Some(2.0)
    );
}

#[test]
fn test_import_missing_module_errors() {
    let mut ctx = Context::new(
        Config::new()
            .with_repl_mode(true)
            .with_file_read(module_hook(&[])),
    );
    ctx.execute("import \"nope\"");
    assert!(ctx.has_errors());
    assert_eq!(ctx.error(0).map(|e| e.kind), Some(ErrorKind::Compilation));
}

#[test]
fn test_execute_file_with_tempdir() {
    use std::io::Write;

    let dir = tempfile::tempdir().expect("tempdir");
    let module_path = dir.path().join("util.brio");
    let mut module = std::fs::File::create(&module_path).expect("create module");
    module
        .write_all(b"fn add(a, b) { return a + b }\n")
        .expect("write module");
    let main_path = dir.path().join("main.brio");
    let mut main = std::fs::File::create(&main_path).expect("create main");
    main.write_all(b"import \"util\"\nvar result = util::add(40, 2)\n")
        .expect("write main");

    let mut ctx = Context::new(Config::new());
    ctx.execute_file(main_path.to_str().expect("utf8 path"));
    assert!(
        !ctx.has_errors(),
        "{:?}",
        ctx.errors().map(|e| e.to_string()).collect::<Vec<_>>()
    );
    assert_eq!(ctx.get_object("result").as_number(), Some(42.0));
}

// ----------------------------------------------------------------------
// Builtins
// ----------------------------------------------------------------------

#[test]
fn test_builtin_basics() {
    assert_eq!(eval_number("len(\"abc\")"), 3.0);
    assert_eq!(eval_number("len([1,2])"), 2.0);
    assert_eq!(eval_number("len({a: 1})"), 1.0);
    assert_eq!(eval_string("to_str(1.5)"), "1.5");
    assert_eq!(eval_string("to_str(null)"), "null");
    assert_eq!(eval_number("to_num(\" 42 \")"), 42.0);
    assert_eq!(eval_number("len(range(5))"), 5.0);
    assert_eq!(eval_number("range(1, 10, 3)[2]"), 7.0);
    assert_eq!(eval_number("var a = [1]; append(a, 9); a[1]"), 9.0);
    assert!(eval_bool("remove([1,2,3], 2)"));
    assert_eq!(eval_number("var a = [1,2,3]; remove(a, 2); len(a)"), 2.0);
    assert_eq!(eval_number("first([7, 8])"), 7.0);
    assert_eq!(eval_number("last([7, 8])"), 8.0);
    assert_eq!(eval_number("len(rest([7, 8, 9]))"), 2.0);
    assert_eq!(eval_string("reverse(\"abc\")"), "cba");
    assert_eq!(eval_number("len(slice([1,2,3,4], 1, 3))"), 2.0);
    assert_eq!(eval_string("slice(\"hello\", -3)"), "llo");
    assert_eq!(eval_number("len(concat([1], [2, 3]))"), 3.0);
    assert_eq!(eval_number("sqrt(81)"), 9.0);
    assert_eq!(eval_number("pow(2, 10)"), 1024.0);
    assert_eq!(eval_number("abs(0 - 5)"), 5.0);
    assert_eq!(eval_number("floor(1.9) + ceil(0.1)"), 2.0);
}

#[test]
fn test_builtin_copy_semantics() {
    // Shallow copy shares nested objects; deep copy does not.
    assert_eq!(
        eval_number("var a = [[1]]; var b = copy(a); b[0][0] = 9; a[0][0]"),
        9.0
    );
    assert_eq!(
        eval_number("var a = [[1]]; var b = deep_copy(a); b[0][0] = 9; a[0][0]"),
        1.0
    );
}

#[test]
fn test_deep_copy_handles_cycles() {
    assert!(eval_bool(
        "var m = {}; m.self = m; var c = deep_copy(m); c.self.self == c.self"
    ));
}

#[test]
fn test_to_json() {
    assert_eq!(
        eval_string("to_json({\"a\": [1, true, null, \"s\"]})"),
        "{\"a\":[1,true,null,\"s\"]}"
    );
}

#[test]
fn test_to_json_rejects_cycles() {
    assert_eq!(
        eval_string(
            "fn f() { recover (e) { return e.message } var m = {}; m.self = m; return to_json(m) } f()"
        ),
        "to_json: value contains a cycle"
    );
}

#[test]
fn test_assert_builtin() {
    let mut ctx = repl_context();
    ctx.execute("assert(1 == 2)");
    assert!(ctx.has_errors());
    assert_eq!(ctx.error(0).map(|e| e.kind), Some(ErrorKind::User));
}

#[test]
fn test_file_builtins_through_hooks() {
    let store: Rc<RefCell<Vec<(String, String)>>> = Rc::new(RefCell::new(Vec::new()));
    let writes = Rc::clone(&store);
    let write_hook: brio_runtime::FileWriteHook =
        Rc::new(RefCell::new(move |path: &str, data: &[u8]| {
            writes
                .borrow_mut()
                .push((path.to_string(), String::from_utf8_lossy(data).into_owned()));
            Ok(data.len())
        }));
    let reads = Rc::clone(&store);
    let read_hook: brio_runtime::FileReadHook = Rc::new(RefCell::new(move |path: &str| {
        reads
            .borrow()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| format!("{}: not found", path))
    }));
    let mut ctx = Context::new(
        Config::new()
            .with_repl_mode(true)
            .with_file_read(read_hook)
            .with_file_write(write_hook),
    );
    assert_eq!(
        eval(&mut ctx, "write_file(\"out.txt\", \"payload\")").as_number(),
        Some(7.0)
    );
    assert_eq!(eval_string_in(&mut ctx, "read_file(\"out.txt\")"), "payload");
}

fn eval_string_in(ctx: &mut Context, source: &str) -> String {
    let v = eval(ctx, source);
    ctx.string_of(v).expect("string result")
}
