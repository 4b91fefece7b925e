//! Built-in native functions registered into every [`crate::vm::Vm`] by
//! default: the handful the language itself depends on (`len`, `to_str`,
//! `crash`) rather than anything an embedder would supply.

use loom_core::{Heap, HeapObject, HeapString, NativeFunctionObject, Value};

/// Shared by the `len` native and the VM's `LEN` opcode (the foreach
/// desugaring's fast path), so the two never drift on what "length" means
/// for a given type.
pub fn len_of(heap: &Heap, value: &Value) -> Result<f64, String> {
    match value {
        Value::Heap(r) => match heap.get(*r) {
            Some(HeapObject::Array(items)) => Ok(items.len() as f64),
            Some(HeapObject::Map(map)) => Ok(map.len() as f64),
            Some(HeapObject::String(s)) => Ok(s.len() as f64),
            Some(other) => Err(format!("{} has no length", other.type_name())),
            None => Err("FREED has no length".to_string()),
        },
        other => Err(format!("{} has no length", other.type_name())),
    }
}

fn native_len(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let [value] = args else {
        return Err(format!("len expects 1 argument, got {}", args.len()));
    };
    len_of(heap, value).map(Value::Number)
}

/// String form of any value, used by the `to_str` native, the `crash`
/// native's message extraction, and the VM's `+` operator when one side is
/// already a string. An `Error` value stringifies to its bare message (not a
/// debug wrapper), so `"caught: " + e` reads naturally for a caller that
/// just wants the error text.
pub fn to_str_of(heap: &Heap, value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Heap(r) => match heap.get(*r) {
            Some(HeapObject::String(s)) => s.as_str().to_string(),
            Some(HeapObject::Array(items)) => {
                let parts: Vec<String> = items.iter().map(|v| to_str_of(heap, v)).collect();
                format!("[{}]", parts.join(", "))
            }
            Some(HeapObject::Map(map)) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{:?}: {}", k, to_str_of(heap, v)))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Some(HeapObject::Function(_)) => "<function>".to_string(),
            Some(HeapObject::NativeFunction(n)) => format!("<native {}>", n.name),
            Some(HeapObject::Error(e)) => e.message.as_str().to_string(),
            Some(HeapObject::External(_)) => "<external>".to_string(),
            Some(HeapObject::Freed) | None => "<freed>".to_string(),
        },
    }
}

fn native_to_str(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let [value] = args else {
        return Err(format!("to_str expects 1 argument, got {}", args.len()));
    };
    let s = to_str_of(heap, value);
    Ok(Value::Heap(heap.alloc_string(s)))
}

/// The language's raise-an-error primitive. Its native `Err` is recognized
/// by name in `Vm::invoke_native` and tagged `ErrorKind::User` rather than
/// `ErrorKind::Runtime`, so `recover` sees it as a catchable user error.
fn native_crash(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let [value] = args else {
        return Err(format!("crash expects 1 argument, got {}", args.len()));
    };
    Err(to_str_of(heap, value))
}

pub const CRASH_NAME: &str = "crash";

/// Every native function this implementation defines, paired with the name
/// an embedder's `GlobalStore` binds it under.
pub fn builtins() -> Vec<(&'static str, NativeFunctionObject)> {
    vec![
        (
            "len",
            NativeFunctionObject {
                name: HeapString::new("len"),
                func: native_len,
            },
        ),
        (
            "to_str",
            NativeFunctionObject {
                name: HeapString::new("to_str"),
                func: native_to_str,
            },
        ),
        (
            CRASH_NAME,
            NativeFunctionObject {
                name: HeapString::new(CRASH_NAME),
                func: native_crash,
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_of_array_and_string() {
        let mut heap = Heap::new();
        let arr = heap.alloc_array(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert_eq!(len_of(&heap, &Value::Heap(arr)), Ok(2.0));
        let s = heap.alloc_string("hello");
        assert_eq!(len_of(&heap, &Value::Heap(s)), Ok(5.0));
    }

    #[test]
    fn crash_carries_message_through_err() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("bang");
        let result = native_crash(&mut heap, &[Value::Heap(s)]);
        assert_eq!(result, Err("bang".to_string()));
    }

    #[test]
    fn to_str_formats_number_and_array() {
        let mut heap = Heap::new();
        let r = native_to_str(&mut heap, &[Value::Number(3.0)]).unwrap();
        if let Value::Heap(hr) = r {
            assert_eq!(heap.get(hr).unwrap().type_name(), "STRING");
        } else {
            panic!("expected heap string");
        }
    }
}
