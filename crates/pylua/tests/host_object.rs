//! Python objects seen from Lua, and the `python` table.

use pretty_assertions::assert_eq;
use pyo3::{
    prelude::*,
    types::{PyDict, PyList},
};
use pylua::{HOST_OBJECT_TYPE_NAME, LuaRuntimeError, LuaState, StateOptions};

fn new_state(py: Python<'_>) -> Bound<'_, LuaState> {
    Bound::new(py, LuaState::open(py, &StateOptions::new()).unwrap()).unwrap()
}

fn eval<'py>(state: &Bound<'py, LuaState>, source: &str) -> Bound<'py, PyAny> {
    state.call_method1("eval", (source,)).unwrap()
}

fn set_global<'py>(state: &Bound<'py, LuaState>, name: &str, value: impl IntoPyObject<'py>) {
    state.call_method0("globals").unwrap().set_item(name, value).unwrap();
}

fn error_message(py: Python<'_>, err: &PyErr) -> String {
    err.value(py).str().unwrap().to_string()
}

#[test]
fn host_objects_are_tagged_userdata() {
    Python::attach(|py| {
        let state = new_state(py);
        set_global(&state, "d", PyDict::new(py));
        assert_eq!(eval(&state, "type(d)").extract::<String>().unwrap(), "userdata");
        // the metatable is hidden behind its name
        assert_eq!(
            eval(&state, "getmetatable(d)").extract::<String>().unwrap(),
            HOST_OBJECT_TYPE_NAME
        );
    });
}

#[test]
fn oversized_callback_errors_still_unwind_cleanly() {
    Python::attach(|py| {
        let state = Bound::new(
            py,
            LuaState::open(py, &StateOptions::new().max_memory(Some(256 * 1024))).unwrap(),
        )
        .unwrap();
        let locals = PyDict::new(py);
        py.run(c"def fail():\n    raise ValueError('x' * 1000000)\n", None, Some(&locals))
            .unwrap();
        set_global(&state, "fail", locals.get_item("fail").unwrap().unwrap());

        // the message does not fit, so the allocation error is raised instead
        let err = state.call_method1("execute", ("fail()",)).unwrap_err();
        assert!(err.is_instance_of::<LuaRuntimeError>(py));
        let message = error_message(py, &err);
        assert!(message.contains("not enough memory"), "{}", &message[..message.len().min(200)]);
        assert_eq!(state.get().runtime().stack_depth(), 0);

        let value = eval(&state, "1 + 1");
        assert_eq!(value.extract::<i64>().unwrap(), 2);
    });
}

#[test]
fn dicts_are_indexed_by_item() {
    Python::attach(|py| {
        let state = new_state(py);
        let dict = PyDict::new(py);
        dict.set_item("present", 1).unwrap();
        set_global(&state, "d", &dict);

        assert_eq!(eval(&state, "d.present").extract::<i64>().unwrap(), 1);
        assert!(eval(&state, "d.absent == nil").extract::<bool>().unwrap());

        state.call_method1("execute", ("d.added = 'yes'; d[1] = 2",)).unwrap();
        assert_eq!(dict.get_item("added").unwrap().unwrap().extract::<String>().unwrap(), "yes");
        assert_eq!(dict.get_item(1).unwrap().unwrap().extract::<i64>().unwrap(), 2);

        // nil removes, and removing what is not there is quiet
        state.call_method1("execute", ("d.present = nil; d.never = nil",)).unwrap();
        assert!(!dict.contains("present").unwrap());
    });
}

#[test]
fn lists_are_indexed_by_position() {
    Python::attach(|py| {
        let state = new_state(py);
        let list = PyList::new(py, ["a", "b"]).unwrap();
        set_global(&state, "l", &list);
        assert_eq!(eval(&state, "l[0]").extract::<String>().unwrap(), "a");
        assert!(eval(&state, "l[10] == nil").extract::<bool>().unwrap());

        state.call_method1("execute", ("l[1] = 'B'",)).unwrap();
        assert_eq!(list.get_item(1).unwrap().extract::<String>().unwrap(), "B");
    });
}

#[test]
fn modules_are_indexed_by_attribute_and_callable() {
    Python::attach(|py| {
        let state = new_state(py);
        let value = eval(&state, "python.import('math').floor(2.75)");
        assert_eq!(value.extract::<i64>().unwrap(), 2);
        assert!(eval(&state, "python.import('math').no_such_name == nil").extract::<bool>().unwrap());
    });
}

#[test]
fn tostring_uses_python_str() {
    Python::attach(|py| {
        let state = new_state(py);
        set_global(&state, "l", PyList::new(py, [1, 2]).unwrap());
        assert_eq!(eval(&state, "tostring(l)").extract::<String>().unwrap(), "[1, 2]");
    });
}

#[test]
fn python_exceptions_become_lua_errors() {
    Python::attach(|py| {
        let state = new_state(py);
        let err = state
            .call_method1("eval", ("python.eval('1 / 0')",))
            .unwrap_err();
        assert!(err.is_instance_of::<LuaRuntimeError>(py));
        assert!(error_message(py, &err).contains("ZeroDivisionError"), "{}", error_message(py, &err));

        // the instance survives
        assert_eq!(eval(&state, "1 + 1").extract::<i64>().unwrap(), 2);
    });
}

#[test]
fn lua_can_catch_python_exceptions() {
    Python::attach(|py| {
        let state = new_state(py);
        let caught = eval(
            &state,
            "(function() local ok, err = pcall(python.eval, '1 / 0') return tostring(ok) .. ' ' .. err end)()",
        );
        let caught = caught.extract::<String>().unwrap();
        assert!(caught.starts_with("false "), "{caught}");
        assert!(caught.contains("ZeroDivisionError"), "{caught}");
    });
}

#[test]
fn python_table_reaches_python() {
    Python::attach(|py| {
        let state = new_state(py);
        assert_eq!(eval(&state, "python.eval('6 * 7')").extract::<i64>().unwrap(), 42);

        let builtin_len = py.import("builtins").unwrap().getattr("len").unwrap();
        assert!(eval(&state, "python.builtins().len").is(&builtin_len));
        assert_eq!(eval(&state, "python.builtins().len('four')").extract::<i64>().unwrap(), 4);

        let main = py.import("__main__").unwrap().dict();
        assert!(eval(&state, "python.globals()").is(&main));

        let err = state.call_method1("eval", ("python.import(1)",)).unwrap_err();
        assert!(error_message(py, &err).contains("string expected"));
    });
}

#[test]
fn python_callbacks_may_reenter_the_interpreter() {
    Python::attach(|py| {
        let state = new_state(py);
        set_global(&state, "inner", state.getattr("eval").unwrap());
        assert_eq!(eval(&state, "inner('20 + 22')").extract::<i64>().unwrap(), 42);
        assert_eq!(eval(&state, "inner('inner(\"1\")') + 1").extract::<i64>().unwrap(), 2);
        assert_eq!(state.get().runtime().stack_depth(), 0);
        state.call_method0("close").unwrap();
    });
}

#[test]
fn closing_from_a_callback_is_refused() {
    Python::attach(|py| {
        let state = new_state(py);
        set_global(&state, "close", state.getattr("close").unwrap());
        let err = state.call_method1("execute", ("close()",)).unwrap_err();
        assert!(err.is_instance_of::<LuaRuntimeError>(py));
        assert!(error_message(py, &err).contains("cannot close a Lua state while it is running"));
        assert!(!state.getattr("closed").unwrap().extract::<bool>().unwrap());

        state.call_method1("execute", ("close = nil",)).unwrap();
        state.call_method0("close").unwrap();
        assert!(state.getattr("closed").unwrap().extract::<bool>().unwrap());
    });
}

#[test]
fn collected_userdata_release_their_object() {
    Python::attach(|py| {
        let state = new_state(py);
        let list = PyList::empty(py);
        let before = list.get_refcnt();

        set_global(&state, "o", &list);
        assert!(list.get_refcnt() > before);

        state
            .call_method1("execute", ("o = nil; collectgarbage(); collectgarbage()",))
            .unwrap();
        assert_eq!(list.get_refcnt(), before);
    });
}

#[test]
fn closing_releases_every_object() {
    Python::attach(|py| {
        let state = new_state(py);
        let list = PyList::empty(py);
        let before = list.get_refcnt();
        set_global(&state, "a", &list);
        set_global(&state, "b", &list);
        state.call_method0("close").unwrap();
        assert_eq!(list.get_refcnt(), before);
    });
}
