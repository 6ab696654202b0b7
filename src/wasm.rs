use wasm_bindgen::prelude::*;

/// Compiles a workspace JSON document against an API JSON document and
/// returns the generated source.
#[wasm_bindgen]
pub fn compile_workspace_json(workspace: &str, api: &str) -> Result<String, JsValue> {
    crate::compile_json_sources(workspace, api)
        .map(|output| output.source)
        .map_err(|e| JsValue::from_str(&e.to_string()))
}
