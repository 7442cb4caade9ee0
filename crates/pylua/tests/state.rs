use std::sync::Arc;

use pretty_assertions::assert_eq;
use pyo3::{
    prelude::*,
    types::{PyBytes, PyDict},
};
use pylua::{
    BridgeError, LuaCompileError, LuaError, LuaObject, LuaRuntimeError, LuaSetupError, LuaStaleReferenceError, LuaState,
    RecordingTracer, RunMode, StateOptions, TraceEvent,
};

fn open<'py>(py: Python<'py>, options: &StateOptions) -> Bound<'py, LuaState> {
    Bound::new(py, LuaState::open(py, options).unwrap()).unwrap()
}

fn new_state(py: Python<'_>) -> Bound<'_, LuaState> {
    open(py, &StateOptions::new())
}

fn error_message(py: Python<'_>, err: &PyErr) -> String {
    err.value(py).str().unwrap().to_string()
}

#[test]
fn execute_returns_chunk_result() {
    Python::attach(|py| {
        let state = new_state(py);
        let value = state.call_method1("execute", ("return 1 + 1",)).unwrap();
        assert_eq!(value.extract::<i64>().unwrap(), 2);

        let value = state.call_method1("execute", ("x = 1",)).unwrap();
        assert!(value.is_none());
    });
}

#[test]
fn eval_evaluates_an_expression() {
    Python::attach(|py| {
        let state = new_state(py);
        state.call_method1("execute", ("x = 20",)).unwrap();
        let value = state.call_method1("eval", ("x * 2 + 2",)).unwrap();
        assert_eq!(value.extract::<i64>().unwrap(), 42);
    });
}

#[test]
fn source_may_be_bytes() {
    Python::attach(|py| {
        let state = new_state(py);
        let source = PyBytes::new(py, b"return 'from bytes'");
        let value = state.call_method1("execute", (source,)).unwrap();
        assert_eq!(value.extract::<String>().unwrap(), "from bytes");
    });
}

#[test]
fn source_of_other_types_is_a_type_error() {
    Python::attach(|py| {
        let state = new_state(py);
        let err = state.call_method1("execute", (42,)).unwrap_err();
        assert!(err.is_instance_of::<pyo3::exceptions::PyTypeError>(py));
    });
}

#[test]
fn compile_error_leaves_instance_usable() {
    Python::attach(|py| {
        let state = new_state(py);
        let err = state.call_method1("execute", ("this is not valid syntax",)).unwrap_err();
        assert!(err.is_instance_of::<LuaCompileError>(py));
        assert!(err.is_instance_of::<LuaError>(py));
        assert!(error_message(py, &err).starts_with("error loading code: "));

        let value = state.call_method1("eval", ("1+1",)).unwrap();
        assert_eq!(value.extract::<i64>().unwrap(), 2);
    });
}

#[test]
fn runtime_error_carries_lua_message() {
    Python::attach(|py| {
        let state = new_state(py);
        let err = state.call_method1("execute", ("error('boom')",)).unwrap_err();
        assert!(err.is_instance_of::<LuaRuntimeError>(py));
        let message = error_message(py, &err);
        assert!(message.starts_with("error executing code: "), "{message}");
        assert!(message.contains("boom"), "{message}");

        // non-string error values are described by type
        let err = state.call_method1("execute", ("error({})",)).unwrap_err();
        assert!(error_message(py, &err).contains("(error object is a table value)"));

        let value = state.call_method1("eval", ("'still alive'",)).unwrap();
        assert_eq!(value.extract::<String>().unwrap(), "still alive");
    });
}

#[test]
fn error_message_attribute() {
    Python::attach(|py| {
        let state = new_state(py);
        let err = state.call_method1("eval", ("1 +",)).unwrap_err();
        let message: String = err.value(py).getattr("message").unwrap().extract().unwrap();
        assert_eq!(message, error_message(py, &err));
        let repr = err.value(py).repr().unwrap().to_string();
        assert!(repr.starts_with("LuaCompileError("), "{repr}");
    });
}

#[test]
fn instances_are_isolated() {
    Python::attach(|py| {
        let first = new_state(py);
        let second = new_state(py);
        first.call_method1("execute", ("x = 1",)).unwrap();
        second.call_method1("execute", ("x = 2",)).unwrap();

        let x1 = first.call_method0("globals").unwrap().getattr("x").unwrap();
        let x2 = second.call_method0("globals").unwrap().getattr("x").unwrap();
        assert_eq!(x1.extract::<i64>().unwrap(), 1);
        assert_eq!(x2.extract::<i64>().unwrap(), 2);
    });
}

#[test]
fn globals_writes_are_live() {
    Python::attach(|py| {
        let state = new_state(py);
        let globals = state.call_method0("globals").unwrap();
        assert!(globals.is_instance_of::<LuaObject>());
        globals.set_item("greeting", "hello").unwrap();
        let value = state.call_method1("eval", ("greeting .. ' world'",)).unwrap();
        assert_eq!(value.extract::<String>().unwrap(), "hello world");
    });
}

#[test]
fn require_returns_library() {
    Python::attach(|py| {
        let state = new_state(py);
        let string = state.call_method1("require", ("string",)).unwrap();
        assert!(string.is_instance_of::<LuaObject>());
        let upper = string.getattr("upper").unwrap();
        let value = upper.call1(("abc",)).unwrap();
        assert_eq!(value.extract::<String>().unwrap(), "ABC");
    });
}

#[test]
fn require_passes_extra_arguments() {
    Python::attach(|py| {
        let state = new_state(py);
        state
            .call_method1("execute", ("function require(name, extra) return name .. ':' .. extra end",))
            .unwrap();
        let value = state.call_method1("require", ("mod", "arg")).unwrap();
        assert_eq!(value.extract::<String>().unwrap(), "mod:arg");
    });
}

#[test]
fn require_without_libraries() {
    Python::attach(|py| {
        let state = open(py, &StateOptions::new().open_libs(false));
        let err = state.call_method1("require", ("string",)).unwrap_err();
        assert!(err.is_instance_of::<LuaRuntimeError>(py));
        assert_eq!(error_message(py, &err), "require is not defined");

        // the bridge itself is still there
        let bridge = state.call_method1("eval", ("python",)).unwrap();
        assert!(bridge.is_instance_of::<LuaObject>());
        assert!(bridge.getattr("eval").unwrap().is_instance_of::<LuaObject>());
    });
}

#[test]
fn too_small_a_budget_fails_setup() {
    Python::attach(|py| {
        let opened = LuaState::open(py, &StateOptions::new().max_memory(Some(4_096)));
        assert!(matches!(opened, Err(BridgeError::Setup(_))), "{opened:?}");

        let kwargs = PyDict::new(py);
        kwargs.set_item("max_memory", 4_096).unwrap();
        let err = py.get_type::<LuaState>().call((), Some(&kwargs)).unwrap_err();
        assert!(err.is_instance_of::<LuaSetupError>(py));
        assert!(err.is_instance_of::<LuaError>(py));
    });
}

#[test]
fn running_out_of_memory_while_loading_is_a_runtime_error() {
    Python::attach(|py| {
        let state = open(py, &StateOptions::new().max_memory(Some(256 * 1024)));
        // every distinct constant is interned while parsing
        let constants: Vec<String> = (0..20_000).map(|i| format!("'constant{i}'")).collect();
        let source = format!("return {{{}}}", constants.join(","));

        let err = state.call_method1("execute", (source,)).unwrap_err();
        assert!(err.is_instance_of::<LuaRuntimeError>(py));
        assert!(!err.is_instance_of::<LuaCompileError>(py));
        let message = error_message(py, &err);
        assert!(message.starts_with("error loading code:"), "{message}");
        assert!(message.contains("not enough memory"), "{message}");

        // the half-built chunk is garbage and the interpreter carries on
        let value = state.call_method1("eval", ("1 + 1",)).unwrap();
        assert_eq!(value.extract::<i64>().unwrap(), 2);
    });
}

#[test]
fn memory_limit_turns_exhaustion_into_error() {
    Python::attach(|py| {
        let limit = 1 << 20;
        let state = open(py, &StateOptions::new().max_memory(Some(limit)));
        assert_eq!(state.getattr("memory_limit").unwrap().extract::<usize>().unwrap(), limit);

        let err = state
            .call_method1("execute", ("local t = {} for i = 1, 1e7 do t[i] = i end",))
            .unwrap_err();
        assert!(err.is_instance_of::<LuaRuntimeError>(py));
        assert!(error_message(py, &err).contains("not enough memory"));

        let used: usize = state.getattr("memory_used").unwrap().extract().unwrap();
        assert!(used > 0 && used <= limit, "{used}");
        let value = state.call_method1("eval", ("1+1",)).unwrap();
        assert_eq!(value.extract::<i64>().unwrap(), 2);
    });
}

#[test]
fn unlimited_memory_limit_is_none() {
    Python::attach(|py| {
        let state = new_state(py);
        assert!(state.getattr("memory_limit").unwrap().is_none());
        assert!(state.getattr("memory_used").unwrap().extract::<usize>().unwrap() > 0);
    });
}

#[test]
fn close_makes_proxies_stale() {
    Python::attach(|py| {
        let state = new_state(py);
        let table = state.call_method1("eval", ("{a = 1}",)).unwrap();
        let function = state.call_method1("eval", ("function() return 1 end",)).unwrap();
        assert!(!state.getattr("closed").unwrap().extract::<bool>().unwrap());

        state.call_method0("close").unwrap();
        assert!(state.getattr("closed").unwrap().extract::<bool>().unwrap());

        let err = table.getattr("a").unwrap_err();
        assert!(err.is_instance_of::<LuaStaleReferenceError>(py));
        assert_eq!(error_message(py, &err), "lost reference");
        assert!(function.call0().unwrap_err().is_instance_of::<LuaStaleReferenceError>(py));
        assert!(table.len().unwrap_err().is_instance_of::<LuaStaleReferenceError>(py));
        assert!(table.str().unwrap_err().is_instance_of::<LuaStaleReferenceError>(py));

        let err = state.call_method1("eval", ("1",)).unwrap_err();
        assert!(err.is_instance_of::<LuaStaleReferenceError>(py));

        // closing again is a no-op, and dropping stale proxies is fine
        state.call_method0("close").unwrap();
        drop(table);
        drop(function);
    });
}

#[test]
fn proxies_keep_runtime_alive() {
    Python::attach(|py| {
        let state = new_state(py);
        let table = state.call_method1("eval", ("{answer = 42}",)).unwrap();
        drop(state);
        let value = table.getattr("answer").unwrap();
        assert_eq!(value.extract::<i64>().unwrap(), 42);
    });
}

#[test]
fn repr_shows_pointers() {
    Python::attach(|py| {
        let state = new_state(py);
        let repr = state.repr().unwrap().to_string();
        assert!(repr.starts_with("<LuaState 0x"), "{repr}");
        assert!(repr.contains(" at 0x"), "{repr}");
    });
}

#[test]
fn stack_is_restored_after_every_operation() {
    Python::attach(|py| {
        let tracer = Arc::new(RecordingTracer::new());
        let state = open(py, &StateOptions::new().tracer(tracer.clone()));
        let runtime = Arc::clone(state.get().runtime());

        state.call_method1("eval", ("1, 2, 3",)).unwrap();
        assert!(state.call_method1("execute", ("error('x')",)).is_err());
        assert!(state.call_method1("execute", ("not lua",)).is_err());
        let table = state.call_method1("eval", ("{1, 2, {}}",)).unwrap();
        let _ = table.get_item(3).unwrap();
        let _: Vec<_> = table.try_iter().unwrap().collect();
        let f = state
            .call_method1("eval", ("function(...) return ... end",))
            .unwrap();
        f.call1((1, "two", 3.0)).unwrap();
        assert!(f.call1((py.None(),)).is_err());
        assert_eq!(runtime.stack_depth(), 0);

        let restores: Vec<(usize, usize)> = tracer
            .events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::StackRestore { observed, restored } => Some((observed, restored)),
                _ => None,
            })
            .collect();
        assert!(!restores.is_empty());
        assert!(restores.iter().all(|&(_, restored)| restored == 0), "{restores:?}");
        // results were left behind and cleared by the guard
        assert!(restores.iter().any(|&(observed, _)| observed > 0), "{restores:?}");
    });
}

#[test]
fn tracer_sees_lifecycle_and_errors() {
    Python::attach(|py| {
        let tracer = Arc::new(RecordingTracer::new());
        let state = open(py, &StateOptions::new().max_memory(Some(1 << 22)).tracer(tracer.clone()));
        assert_eq!(tracer.take().first(), Some(&TraceEvent::Open { memory_limit: Some(1 << 22) }));

        assert!(state.call_method1("execute", ("error('traced')",)).is_err());
        let events = tracer.take();
        assert_eq!(
            events.first(),
            Some(&TraceEvent::Run {
                mode: RunMode::Execute,
                len: "error('traced')".len(),
            })
        );
        assert!(events.iter().any(|event| matches!(
            event,
            TraceEvent::GuestError { message } if message.contains("traced")
        )));

        state.call_method0("close").unwrap();
        assert!(tracer.take().contains(&TraceEvent::Close));
    });
}

#[test]
fn anchors_are_released_when_proxies_drop() {
    Python::attach(|py| {
        let tracer = Arc::new(RecordingTracer::new());
        let state = open(py, &StateOptions::new().tracer(tracer.clone()));
        let table = state.call_method1("eval", ("{}",)).unwrap();
        let key = table.cast::<LuaObject>().unwrap().get().key();
        assert!(tracer.events().contains(&TraceEvent::Anchor { key }));

        drop(table);
        assert!(tracer.events().contains(&TraceEvent::Release { key }));
    });
}

#[test]
fn rust_api_runs_source() {
    Python::attach(|py| {
        let state = LuaState::open(py, &StateOptions::new()).unwrap();
        let value = state.runtime().run(py, b"40 + 2", RunMode::Evaluate).unwrap();
        assert_eq!(value.extract::<i64>(py).unwrap(), 42);
        assert!(matches!(
            state.runtime().run(py, b"(", RunMode::Execute),
            Err(pylua::BridgeError::Compile(_))
        ));
    });
}
