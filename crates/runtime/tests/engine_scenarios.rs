//! End-to-end scenarios and VM-level properties driven entirely through the
//! public `Engine` API, rather than `loom_core`/`loom_compiler` internals.

use loom_core::{HeapObject, Value};
use loom_runtime::{Engine, EngineConfig, EngineError};

/// Most scenarios below end in a bare expression (not a call or assignment),
/// which only parses as a top-level statement in REPL mode — see
/// `Parser::parse_expression_statement`'s gate.
fn repl_engine() -> Engine {
    Engine::new(EngineConfig::default().with_repl_mode(true))
}

fn eval(source: &str) -> Value {
    repl_engine().eval(source).unwrap_or_else(|e| panic!("eval failed: {e}"))
}

#[test]
fn call_a_function_value() {
    assert_eq!(eval("const add = fn(a,b){ return a+b }; add(2,3)"), Value::Number(5.0));
}

#[test]
fn array_index_assignment_and_len() {
    let mut engine = repl_engine();
    let count = engine.eval("var a = [1,2,3]; a[0] = 10; len(a)").unwrap();
    assert_eq!(count, Value::Number(3.0));

    let sum = engine
        .eval("var a = [1,2,3]; a[0] = 10; a[0] + a[1] + a[2]")
        .unwrap();
    assert_eq!(sum, Value::Number(15.0));
}

#[test]
fn map_index_assignment_and_lookup() {
    assert_eq!(
        eval(r#"var m = {"x":1}; m["y"] = 2; m["x"] + m["y"]"#),
        Value::Number(3.0)
    );
}

#[test]
fn template_string_interpolation() {
    let mut engine = repl_engine();
    let result = engine.eval(r#"`hello ${"wor" + "ld"}`"#).unwrap();
    let Value::Heap(r) = result else { panic!("expected a heap string, got {result:?}") };
    let HeapObject::String(s) = engine.heap().get(r).expect("live heap object") else {
        panic!("expected a heap string object")
    };
    assert_eq!(s.as_str(), "hello world");
}

#[test]
fn recursive_factorial() {
    assert_eq!(
        eval("fn fact(n){ if (n < 2) { return 1 } return n * fact(n-1) }; fact(5)"),
        Value::Number(120.0)
    );
}

#[test]
fn crash_is_caught_by_recover() {
    let mut engine = Engine::default();
    let result = engine
        .eval(r#"fn f(){ recover(e){ return "caught: " + e }; crash("bang") }; f()"#)
        .unwrap();
    let Value::Heap(r) = result else { panic!("expected a string result, got {result:?}") };
    let HeapObject::String(s) = engine.heap().get(r).expect("live heap object") else {
        panic!("expected a heap string object")
    };
    assert_eq!(s.as_str(), "caught: bang");
}

#[test]
fn arithmetic_properties() {
    assert_eq!(eval("1+2*3==7"), Value::Boolean(true));
    assert_eq!(eval("10%3==1"), Value::Boolean(true));
    let Value::Number(inf) = eval("1/0") else { panic!("expected a number") };
    assert!(inf.is_infinite() && inf > 0.0);
    let Value::Number(nan) = eval("0/0") else { panic!("expected a number") };
    assert!(nan.is_nan());
}

#[test]
fn reassigning_a_different_type_is_a_runtime_error() {
    let err = Engine::default().eval(r#"var a = 1; a = "b";"#).unwrap_err();
    assert!(matches!(err, EngineError::Runtime(_)));
}

#[test]
fn closures_share_mutable_captured_state() {
    let mut engine = Engine::default();
    let program = engine
        .compile(
            "fn make() { var c = 0; return fn() { c = c + 1; return c } }; const counter = make();",
            None,
        )
        .unwrap();
    engine.execute(&program).unwrap();
    let a = engine.call_function(&program, "counter", &[]).unwrap();
    let b = engine.call_function(&program, "counter", &[]).unwrap();
    let c = engine.call_function(&program, "counter", &[]).unwrap();
    assert_eq!(a, Value::Number(1.0));
    assert_eq!(b, Value::Number(2.0));
    assert_eq!(c, Value::Number(3.0));
}

#[test]
fn timeout_bounds_an_infinite_loop() {
    let config = EngineConfig::default().with_max_execution_time_ms(Some(10));
    let mut engine = Engine::new(config);
    let start = std::time::Instant::now();
    let err = engine.eval("while(true){}").unwrap_err();
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
    match err {
        EngineError::Runtime(lang_err) => assert_eq!(lang_err.kind, loom_core::ErrorKind::Timeout),
        other => panic!("expected a runtime timeout error, got {other:?}"),
    }
}

#[test]
fn break_outside_a_loop_is_a_compile_error() {
    let err = Engine::default().compile("break;", None).unwrap_err();
    assert!(matches!(err, EngineError::Compile(_)));
}

#[test]
fn many_transient_allocations_stay_bounded_and_complete() {
    // Exercises the heap's sweep path under sustained allocation pressure
    // rather than asserting an exact GcStats count, since `Engine` doesn't
    // expose sweep counters across its public surface.
    let result = eval(
        r#"
        var total = 0;
        var i = 0;
        while (i < 10000) {
            var s = "x" + to_str(i);
            total = total + len(s);
            i = i + 1;
        }
        total;
        "#,
    );
    match result {
        Value::Number(n) => assert!(n > 0.0),
        other => panic!("expected a number, got {other:?}"),
    }
}
