// Copyright 2019-2026 Maravilla Labs, operated by SOLUTAS GmbH, Switzerland
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

//! The per-render execution context.
//!
//! Every generated function receives one `script` table as its sole
//! parameter; there are no hidden globals. The table is created fresh per
//! top-level execution call and carries:
//!
//! - `Model` — the caller's data, converted once and held by reference
//! - `title` — ambient string, settable by content code, readable by layout
//!   code that is spliced after it
//! - `out` — the output buffer the generated writes append to
//! - `write(value)` — verbatim write for code blocks
//! - `raw(value)` — wraps a value so it is never HTML-escaped
//! - `partial(path, model)` — renders an independent sub-template and
//!   returns its text
//!
//! Because instances are never shared across renders, nothing here can
//! leak from one call into the next.

use mlua::{Function, Lua, Table, Value};

use crate::error::Result;

const CONTEXT_BUILDER: &str = r#"
local function new_script(model, partial)
  local script = { Model = model, title = "", out = {} }

  function script.raw(value)
    return { __handlua_raw = true, value = value }
  end

  function script.write(value)
    if value ~= nil then
      script.out[#script.out + 1] = tostring(value)
    end
  end

  function script.partial(path, model_value)
    if partial == nil then
      error("partial rendering is not available in this context", 2)
    end
    return partial(path, model_value)
  end

  return script
end
return new_script
"#;

/// Builds a fresh `script` context table.
///
/// `partial` is the engine's partial-render callback; without one,
/// `script.partial` raises a runtime error.
pub fn new_script_context(
    lua: &Lua,
    model: Value,
    partial: Option<Function>,
) -> Result<Table> {
    let builder: Function = lua
        .load(CONTEXT_BUILDER)
        .set_name("@handlua/context")
        .eval()?;
    let partial_value = match partial {
        Some(f) => Value::Function(f),
        None => Value::Nil,
    };
    let script: Table = builder.call((model, partial_value))?;
    Ok(script)
}
