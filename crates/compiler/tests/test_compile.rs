//! Compiler integration tests
//!
//! Compile small programs and assert on the emitted instruction
//! stream via the disassembler, which keeps the expectations readable.

use std::rc::Rc;

use brio_compiler::{Compiler, CompilerState};
use brio_core::{CompiledFile, Config, ErrorList, GlobalStore, Heap, ScriptFunction, Value};

struct Fixture {
    config: Config,
    heap: Heap,
    store: GlobalStore,
    errors: ErrorList,
    state: CompilerState,
}

impl Fixture {
    fn new() -> Fixture {
        Fixture {
            config: Config::new().with_repl_mode(true),
            heap: Heap::new(),
            store: GlobalStore::new(),
            errors: ErrorList::new(),
            state: CompilerState::new(),
        }
    }

    fn with_global(name: &str) -> Fixture {
        let mut fx = Fixture::new();
        fx.store.set(name, Value::NULL);
        fx
    }

    fn compile(&mut self, source: &str) -> Option<ScriptFunction> {
        let mut compiler = Compiler::new(
            &self.config,
            &mut self.heap,
            &self.store,
            &mut self.errors,
            &mut self.state,
        );
        compiler.compile(CompiledFile::new("test.brio"), source)
    }

    fn disassemble(&mut self, source: &str) -> String {
        let main = self.compile(source).unwrap_or_else(|| {
            panic!(
                "compile failed: {:?}",
                self.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>()
            )
        });
        main.block.disassemble()
    }
}

#[test]
fn test_optimizer_folds_at_compile_time() {
    let mut fx = Fixture::new();
    let text = fx.disassemble("var x = 1 + 2 * 3;");
    // The whole right-hand side collapses to one NUMBER push.
    assert!(text.contains("NUMBER 7"), "got:\n{}", text);
    assert!(!text.contains("MUL"), "got:\n{}", text);
}

#[test]
fn test_define_and_read_module_global() {
    let mut fx = Fixture::new();
    let text = fx.disassemble("var x = 1; x");
    assert!(text.contains("DEFINE_MODULE_GLOBAL 0"), "got:\n{}", text);
    assert!(text.contains("GET_MODULE_GLOBAL 0"), "got:\n{}", text);
}

#[test]
fn test_lt_swaps_operands() {
    let mut fx = Fixture::new();
    let text = fx.disassemble("var a = 1; var b = 2; var c = a < b;");
    // a < b compiles as: push b, push a, COMPARE, GREATER_THAN
    let push_b = text.find("GET_MODULE_GLOBAL 1").expect("read of b");
    let push_a = text.rfind("GET_MODULE_GLOBAL 0").expect("read of a");
    assert!(push_b < push_a, "operands not swapped:\n{}", text);
    assert!(text.contains("COMPARE\n"), "got:\n{}", text);
    assert!(text.contains("GREATER_THAN\n"), "got:\n{}", text);
}

#[test]
fn test_equality_uses_compare_eq() {
    let mut fx = Fixture::new();
    let text = fx.disassemble("var a = 1; var r = a == null;");
    assert!(text.contains("COMPARE_EQ"), "got:\n{}", text);
    assert!(text.contains("EQUAL"), "got:\n{}", text);
}

#[test]
fn test_string_constants_deduplicated() {
    let mut fx = Fixture::new();
    let text = fx.disassemble(r#"var a = "hi"; var b = "hi"; var c = "other";"#);
    assert_eq!(text.matches("CONSTANT 0").count(), 2, "got:\n{}", text);
    assert!(text.contains("CONSTANT 1"), "got:\n{}", text);
}

#[test]
fn test_function_literal_and_closure_capture() {
    let mut fx = Fixture::new();
    let main = fx
        .compile("fn counter() { var i = 0; return fn() { i = i + 1; return i } }")
        .expect("compile");
    let text = main.block.disassemble();
    // Outer function is a constant; FUNCTION with zero captures.
    assert!(text.contains("FUNCTION"), "got:\n{}", text);

    // The outer function body captures nothing; the inner closure is
    // built inside it with one free value.
    let outer = fx
        .state
        .constants
        .iter()
        .rev()
        .find_map(|v| match fx.heap.get(v.as_handle()?) {
            brio_core::ObjData::Function(f) if f.name.as_deref() == Some("counter") => {
                Some(f.block.disassemble())
            }
            _ => None,
        })
        .expect("counter prototype in constants");
    assert!(outer.contains("GET_LOCAL 0"), "got:\n{}", outer);
    assert!(outer.contains("FUNCTION"), "got:\n{}", outer);
    // FUNCTION <ix> 1 -> one captured free variable.
    let capture_line = outer
        .lines()
        .find(|l| l.contains("FUNCTION"))
        .expect("function op");
    assert!(capture_line.trim_end().ends_with(" 1"), "got: {}", capture_line);
}

#[test]
fn test_inner_function_uses_free_opcodes() {
    let mut fx = Fixture::new();
    fx.compile("fn outer() { var i = 0; return fn() { i = i + 1; return i } }")
        .expect("compile");
    let inner = fx
        .state
        .constants
        .iter()
        .find_map(|v| match fx.heap.get(v.as_handle()?) {
            brio_core::ObjData::Function(f) if f.name.is_none() => Some(f.block.disassemble()),
            _ => None,
        })
        .expect("inner prototype");
    assert!(inner.contains("GET_FREE 0"), "got:\n{}", inner);
    assert!(inner.contains("SET_FREE 0"), "got:\n{}", inner);
}

#[test]
fn test_recursion_via_current_function() {
    let mut fx = Fixture::new();
    fx.compile("fn fact(n) { if (n == 0) { return 1 } return n * fact(n - 1) }")
        .expect("compile");
    let body = fx
        .state
        .constants
        .iter()
        .find_map(|v| match fx.heap.get(v.as_handle()?) {
            brio_core::ObjData::Function(f) if f.name.as_deref() == Some("fact") => {
                Some(f.block.disassemble())
            }
            _ => None,
        })
        .expect("fact prototype");
    assert!(body.contains("CURRENT_FUNCTION"), "got:\n{}", body);
}

#[test]
fn test_break_outside_loop_is_error() {
    let mut fx = Fixture::new();
    assert!(fx.compile("break").is_none());
    assert!(fx.errors.has_errors());
}

#[test]
fn test_return_at_module_scope_is_error() {
    let mut fx = Fixture::new();
    assert!(fx.compile("return 1").is_none());
    assert!(fx.errors.has_errors());
}

#[test]
fn test_recover_outside_function_is_error() {
    let mut fx = Fixture::new();
    assert!(fx.compile("recover (e) { return e }").is_none());
    assert!(fx.errors.has_errors());
}

#[test]
fn test_recover_body_must_return() {
    let mut fx = Fixture::with_global("f");
    assert!(fx.compile("fn g() { recover (e) { f(e) } f() }").is_none());
    assert!(fx.errors.has_errors());
}

#[test]
fn test_recover_emits_set_recover() {
    let mut fx = Fixture::new();
    fx.compile("fn f() { recover (e) { return e } return 1 }")
        .expect("compile");
    let body = fx
        .state
        .constants
        .iter()
        .find_map(|v| match fx.heap.get(v.as_handle()?) {
            brio_core::ObjData::Function(f) if f.name.as_deref() == Some("f") => {
                Some(f.block.disassemble())
            }
            _ => None,
        })
        .expect("f prototype");
    assert!(body.contains("SET_RECOVER"), "got:\n{}", body);
}

#[test]
fn test_shadowing_host_global_rejected() {
    let mut fx = Fixture::with_global("len");
    assert!(fx.compile("var len = 1;").is_none());
    assert!(fx.errors.has_errors());
}

#[test]
fn test_const_not_assignable() {
    let mut fx = Fixture::new();
    assert!(fx.compile("const c = 1; c = 2;").is_none());
    assert!(fx.errors.has_errors());
}

#[test]
fn test_implicit_declaration_on_assignment() {
    let mut fx = Fixture::new();
    let text = fx.disassemble("q = 41; q");
    assert!(text.contains("SET_MODULE_GLOBAL 0"), "got:\n{}", text);
    assert!(text.contains("GET_MODULE_GLOBAL 0"), "got:\n{}", text);
}

#[test]
fn test_foreach_hidden_locals() {
    let mut fx = Fixture::new();
    let text = fx.disassemble("for (x in [1, 2]) { x = x }");
    assert!(text.contains("GET_VALUE_AT"), "got:\n{}", text);
    assert!(text.contains("LEN"), "got:\n{}", text);
    assert!(text.contains("COMPARE_EQ"), "got:\n{}", text);
}

#[test]
fn test_repl_keeps_globals_across_compiles() {
    let mut fx = Fixture::new();
    fx.compile("var x = 1;").expect("first compile");
    let text = fx.disassemble("x");
    assert!(text.contains("GET_MODULE_GLOBAL 0"), "got:\n{}", text);
}

#[test]
fn test_import_via_file_read_hook() {
    use std::cell::RefCell;
    use std::rc::Rc as StdRc;

    let reads: StdRc<RefCell<Vec<String>>> = StdRc::new(RefCell::new(Vec::new()));
    let log = StdRc::clone(&reads);
    let hook: brio_core::FileReadHook = StdRc::new(RefCell::new(move |path: &str| {
        log.borrow_mut().push(path.to_string());
        if path == "lib/util.brio" {
            Ok("var answer = 42".to_string())
        } else {
            Err(format!("{}: not found", path))
        }
    }));

    let mut fx = Fixture::new();
    fx.config = Config::new().with_repl_mode(true).with_file_read(hook);

    let mut compiler = Compiler::new(
        &fx.config,
        &mut fx.heap,
        &fx.store,
        &mut fx.errors,
        &mut fx.state,
    );
    let main = compiler
        .compile(
            CompiledFile::new("lib/main.brio"),
            "import \"util\"; var x = util::answer;",
        )
        .expect("compile");
    assert_eq!(&*reads.borrow(), &["lib/util.brio".to_string()]);

    let text = main.block.disassemble();
    // Module global 0 belongs to util::answer, main's x gets 1.
    assert!(text.contains("DEFINE_MODULE_GLOBAL 0"), "got:\n{}", text);
    assert!(text.contains("DEFINE_MODULE_GLOBAL 1"), "got:\n{}", text);
}

#[test]
fn test_duplicate_import_rejected() {
    use std::cell::RefCell;
    use std::rc::Rc as StdRc;

    let hook: brio_core::FileReadHook =
        StdRc::new(RefCell::new(|_: &str| Ok("var a = 1".to_string())));
    let mut fx = Fixture::new();
    fx.config = Config::new().with_file_read(hook);

    let mut compiler = Compiler::new(
        &fx.config,
        &mut fx.heap,
        &fx.store,
        &mut fx.errors,
        &mut fx.state,
    );
    let result = compiler.compile(
        CompiledFile::new("main.brio"),
        "import \"util\"\nimport \"util\"\n",
    );
    assert!(result.is_none());
    assert!(fx.errors.iter().any(|e| e.message.contains("already imported")));
}

#[test]
fn test_import_idempotent_indices() {
    use std::cell::RefCell;
    use std::rc::Rc as StdRc;

    let hook: brio_core::FileReadHook = StdRc::new(RefCell::new(|path: &str| match path {
        "shared.brio" => Ok("var s = 1".to_string()),
        "a.brio" => Ok("import \"shared\"\nvar a = shared::s".to_string()),
        "b.brio" => Ok("import \"shared\"\nvar b = shared::s".to_string()),
        other => Err(format!("{}: not found", other)),
    }));
    let mut fx = Fixture::new();
    fx.config = Config::new().with_file_read(hook);

    let mut compiler = Compiler::new(
        &fx.config,
        &mut fx.heap,
        &fx.store,
        &mut fx.errors,
        &mut fx.state,
    );
    // Both a and b import shared; its global must keep index 0 and be
    // compiled only once.
    let main = compiler
        .compile(CompiledFile::new("main.brio"), "import \"a\"\nimport \"b\"\n")
        .unwrap_or_else(|| panic!("{:?}", fx.errors.iter().collect::<Vec<_>>()));
    let text = main.block.disassemble();
    assert_eq!(
        text.matches("DEFINE_MODULE_GLOBAL 0").count(),
        1,
        "shared module compiled twice:\n{}",
        text
    );
}

#[test]
fn test_cyclic_import_rejected() {
    use std::cell::RefCell;
    use std::rc::Rc as StdRc;

    let hook: brio_core::FileReadHook = StdRc::new(RefCell::new(|path: &str| match path {
        "a.brio" => Ok("import \"b\"".to_string()),
        "b.brio" => Ok("import \"a\"".to_string()),
        other => Err(format!("{}: not found", other)),
    }));
    let mut fx = Fixture::new();
    fx.config = Config::new().with_file_read(hook);

    let mut compiler = Compiler::new(
        &fx.config,
        &mut fx.heap,
        &fx.store,
        &mut fx.errors,
        &mut fx.state,
    );
    assert!(compiler
        .compile(CompiledFile::new("main.brio"), "import \"a\"")
        .is_none());
    assert!(fx.errors.iter().any(|e| e.message.contains("cyclic")));
}

#[test]
fn test_bytecode_positions_parallel() {
    let mut fx = Fixture::new();
    let main = fx
        .compile("var x = 1;\nvar y = x + 2;\n")
        .expect("compile");
    assert_eq!(main.block.bytecode.len(), main.block.src_positions.len());
    // The second statement's instructions carry line 1.
    assert!(main.block.src_positions.iter().any(|p| p.line == 1));
}
