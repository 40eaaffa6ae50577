// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! JSON module registration for generated code.
//!
//! Provides `json.encode`, `json.decode`, `json.encode_pretty`, and
//! `json.null` to templates and snippets, both as a global and through
//! `require("json")` (so engines configured with the `json` module import
//! get a working prelude).

use mlua::{Lua, LuaSerdeExt, Result as LuaResult, Table, Value};

fn build_json_table(lua: &Lua) -> LuaResult<Table> {
    let module = lua.create_table()?;

    let encode = lua.create_function(|lua, value: Value| {
        let json = lua.from_value::<serde_json::Value>(value)?;
        serde_json::to_string(&json)
            .map_err(|e| mlua::Error::external(format!("json encode error: {}", e)))
    })?;
    module.set("encode", encode)?;

    let encode_pretty = lua.create_function(|lua, value: Value| {
        let json = lua.from_value::<serde_json::Value>(value)?;
        serde_json::to_string_pretty(&json)
            .map_err(|e| mlua::Error::external(format!("json encode error: {}", e)))
    })?;
    module.set("encode_pretty", encode_pretty)?;

    let decode = lua.create_function(|lua, text: String| {
        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| mlua::Error::external(format!("json decode error: {}", e)))?;
        lua.to_value(&json)
    })?;
    module.set("decode", decode)?;

    // Lua has no native null; a sentinel table stands in.
    let null = lua.create_table()?;
    null.set("__jsontype", "null")?;
    module.set("null", null)?;

    Ok(module)
}

/// Registers the json module as a global and in `package.preload`.
pub fn register_json_module(lua: &Lua) -> LuaResult<()> {
    let module = build_json_table(lua)?;

    let globals = lua.globals();
    globals.set("json", &module)?;

    let package: Table = globals.get("package")?;
    let preload: Table = package.get("preload")?;
    let loader = lua.create_function(|lua, _: ()| build_json_table(lua))?;
    preload.set("json", loader)?;

    Ok(())
}
