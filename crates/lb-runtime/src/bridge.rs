use std::collections::BTreeMap;

use lb_core::HostValue;
use mlua::{Lua, Table, Value};

/// Converts an engine value into its host rendering.
///
/// Total over every engine kind: nil and unrepresentable kinds (functions,
/// threads, userdata) degrade to [`HostValue::Absent`] instead of failing.
/// Strings are copied out of interpreter memory, invalid UTF-8 replaced.
/// No cycle detection is performed; a self-referential table recurses
/// without bound and must not be handed across the boundary.
pub fn lua_to_host(value: &Value) -> HostValue {
    match value {
        Value::Nil => HostValue::Absent,
        Value::Boolean(flag) => HostValue::Bool(*flag),
        Value::Integer(number) => HostValue::Number(*number as f64),
        Value::Number(number) => HostValue::Number(*number),
        Value::String(text) => HostValue::String(text.to_string_lossy()),
        Value::Table(table) => table_to_host(table),
        _ => HostValue::Absent,
    }
}

/// Pushes the engine equivalent of a host value.
///
/// Inverse of [`lua_to_host`]; `Absent` becomes nil. The mapping itself is
/// total, the `mlua::Result` carries only interpreter allocation failures.
pub fn host_to_lua(lua: &Lua, value: &HostValue) -> mlua::Result<Value> {
    match value {
        HostValue::Absent => Ok(Value::Nil),
        HostValue::Bool(flag) => Ok(Value::Boolean(*flag)),
        HostValue::Number(number) => Ok(Value::Number(*number)),
        HostValue::String(text) => Ok(Value::String(lua.create_string(text)?)),
        HostValue::Sequence(items) => {
            let table = lua.create_table_with_capacity(items.len(), 0)?;
            for (index, item) in items.iter().enumerate() {
                table.raw_set(index + 1, host_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
        HostValue::Mapping(entries) => {
            let table = lua.create_table_with_capacity(0, entries.len())?;
            for (key, item) in entries {
                table.raw_set(key.as_str(), host_to_lua(lua, item)?)?;
            }
            Ok(Value::Table(table))
        }
    }
}

/// A table whose entries are exactly the contiguous run `1..=raw_len` is an
/// ordered sequence; every other table is a string-keyed mapping. An empty
/// table has no run and therefore renders as an empty mapping.
fn table_to_host(table: &Table) -> HostValue {
    let len = table.raw_len();
    let mut entries = Vec::new();
    for pair in table.clone().pairs::<Value, Value>() {
        let Ok(pair) = pair else { continue };
        entries.push(pair);
    }

    if len > 0 && entries.len() == len {
        let mut sequence = Vec::with_capacity(len);
        let mut contiguous = true;
        for index in 1..=len {
            match table.raw_get::<Value>(index) {
                Ok(Value::Nil) | Err(_) => {
                    contiguous = false;
                    break;
                }
                Ok(item) => sequence.push(lua_to_host(&item)),
            }
        }
        if contiguous {
            return HostValue::Sequence(sequence);
        }
    }

    let mut mapping = BTreeMap::new();
    for (key, value) in entries {
        let Some(key) = mapping_key(&key) else {
            continue;
        };
        mapping.insert(key, lua_to_host(&value));
    }
    HostValue::Mapping(mapping)
}

fn mapping_key(key: &Value) -> Option<String> {
    match key {
        Value::String(text) => Some(text.to_string_lossy()),
        Value::Integer(number) => Some(number.to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
