//! Methods served by `tagrpc serve`.

use std::time::Duration;

use tagrpc_common::{RemoteError, Value, ValueType};
use tagrpc_server::MethodTable;

/// A small provider for trying out clients against a running server.
///
/// - `ping()` returns `"pong"`
/// - `echo(any)` returns its argument
/// - `add(long, long)` returns the sum, failing on overflow
/// - `sleep(long)` blocks for that many milliseconds and returns them
pub fn builtin_methods(name: &str) -> MethodTable {
    MethodTable::new(name)
        .method("ping", &[], |_| Ok(Value::from("pong")))
        .method("echo", &[ValueType::Any], |mut args| Ok(args.pop().unwrap_or_default()))
        .method("add", &[ValueType::Long, ValueType::Long], |args| {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            a.checked_add(b)
                .map(Value::Long)
                .ok_or_else(|| RemoteError::new("ArithmeticException", format!("{a} + {b} overflows")))
        })
        .method("sleep", &[ValueType::Long], |args| {
            let ms = args[0].as_i64().unwrap_or_default().max(0);
            std::thread::sleep(Duration::from_millis(ms as u64));
            Ok(Value::Long(ms))
        })
}
