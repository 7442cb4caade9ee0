//! The `lua` extension module as Python sees it.
//!
//! This is the only test touching the default interpreter, which lives for
//! the whole process.

use pretty_assertions::assert_eq;
use pyo3::{prelude::*, types::PyDict, wrap_pymodule};

#[test]
fn module_surface() {
    Python::attach(|py| {
        let module = wrap_pymodule!(pylua::lua)(py);
        let locals = PyDict::new(py);
        locals.set_item("lua", module.bind(py)).unwrap();

        let run = |code: &std::ffi::CStr| py.run(code, None, Some(&locals)).unwrap();

        run(c"
assert lua.execute('x = 40') is None
assert lua.eval('x + 2') == 42
assert lua.execute('return x') == 40
assert lua.globals().x == 40
lua.globals().y = 'from python'
assert lua.eval('y') == 'from python'
assert lua.require('string').upper('abc') == 'ABC'
");

        run(c"
for name in ('LuaCompileError', 'LuaRuntimeError', 'LuaConversionError', 'LuaSetupError', 'LuaStaleReferenceError'):
    assert issubclass(getattr(lua, name), lua.LuaError), name
assert issubclass(lua.LuaError, Exception)
try:
    lua.eval('nil + 1')
except lua.LuaRuntimeError as e:
    assert 'error executing code' in str(e)
else:
    raise AssertionError('expected LuaRuntimeError')
");

        run(c"
a = lua.new_instance()
b = lua.new_state(max_memory=1 << 22)
assert isinstance(a, lua.LuaState) and isinstance(b, lua.LuaState)
assert a.eval('x') is None
assert b.memory_limit == 1 << 22
a.close()
assert a.closed
assert not b.closed
b.close()
");

        let version = module.bind(py).getattr("__version__").unwrap();
        assert_eq!(version.extract::<String>().unwrap(), env!("CARGO_PKG_VERSION"));

        let first = pylua::default_state(py).unwrap().clone();
        let second = pylua::default_state(py).unwrap();
        assert!(first.is(second));
        assert_eq!(second.call_method1("eval", ("x",)).unwrap().extract::<i64>().unwrap(), 40);
    });
}
