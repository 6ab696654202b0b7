//! JSON input for the command line: a block workspace and an API surface,
//! decoded by walking `serde_json::Value`.

use crate::api::{ApiInfo, EnumInfo, KindInfo, ParameterDesc, SymbolInfo};
use crate::blocks::{BlockSpec, InputKind, Workspace, WorkspaceBuilder};
use crate::mutation::Mutator;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

pub fn load_api_file(path: &Path) -> Result<ApiInfo> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read '{}'.", path.display()))?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("Invalid API JSON in '{}'.", path.display()))?;
    parse_api(&value)
}

pub fn load_workspace_file(path: &Path, api: &ApiInfo) -> Result<Workspace> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read '{}'.", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid workspace JSON in '{}'.", path.display()))?;
    parse_workspace(&value, api)
}

pub fn parse_workspace(value: &Value, api: &ApiInfo) -> Result<Workspace> {
    let mut builder = WorkspaceBuilder::new();
    let blocks = value
        .get("blocks")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("Workspace JSON must contain a 'blocks' array."))?;
    for block in blocks {
        builder.add(parse_block(block)?);
    }
    for variable in value.get("variables").and_then(Value::as_array).into_iter().flatten() {
        let name = str_of(variable, "name").ok_or_else(|| anyhow!("Variable is missing 'name'."))?;
        builder.add_variable(name, str_of(variable, "type"));
    }
    builder.build(api)
}

fn parse_block(block: &Value) -> Result<BlockSpec> {
    let id = str_of(block, "id").ok_or_else(|| anyhow!("Block is missing 'id'."))?;
    let tag = str_of(block, "type").ok_or_else(|| anyhow!("Block '{}' is missing 'type'.", id))?;
    let mut spec = BlockSpec::new(id, tag)
        .enabled(bool_of(block, "enabled").unwrap_or(true));
    if bool_of(block, "shadow").unwrap_or(false) {
        spec = spec.shadow();
    }

    for field in array_of(block, "fields") {
        let name = str_of(field, "name").ok_or_else(|| anyhow!("Field of block '{}' has no 'name'.", id))?;
        let value = match field.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        spec = spec.field(name, &value);
    }

    for input in array_of(block, "inputs") {
        let name = str_of(input, "name").ok_or_else(|| anyhow!("Input of block '{}' has no 'name'.", id))?;
        let kind = match str_of(input, "kind").unwrap_or("value") {
            "value" => InputKind::Value,
            "statement" => InputKind::Statement,
            other => bail!("Input '{}' of block '{}' has unknown kind '{}'.", name, id, other),
        };
        spec = spec.input(name, kind, str_of(input, "block"));
    }

    if let Some(next) = str_of(block, "next") {
        spec = spec.next(next);
    }
    if let Some(output) = block.get("output").and_then(Value::as_array) {
        let check = output.iter().filter_map(Value::as_str).collect::<Vec<_>>();
        spec = spec.output(&check);
    }
    for arg in array_of(block, "arguments") {
        let arg_id = str_of(arg, "id").ok_or_else(|| anyhow!("Argument of block '{}' has no 'id'.", id))?;
        let name = str_of(arg, "name").unwrap_or(arg_id);
        spec = spec.argument(arg_id, name, str_of(arg, "type").unwrap_or(""));
    }
    if let Some(mutation) = block.get("mutation") {
        let mutation = Mutator::deserialize(mutation).with_context(|| format!("Bad mutation on block '{}'.", id))?;
        spec = spec.mutation(mutation);
    }
    Ok(spec)
}

pub fn parse_api(value: &Value) -> Result<ApiInfo> {
    let mut api = ApiInfo::new();
    for symbol in array_of(value, "symbols") {
        api.add_symbol(parse_symbol(symbol)?);
    }
    if let Some(table) = value.get("supertypes").and_then(Value::as_object) {
        for (type_name, parents) in table {
            let parents = parents
                .as_array()
                .map(|items| items.iter().filter_map(Value::as_str).collect::<Vec<_>>())
                .unwrap_or_default();
            api.add_supertypes(type_name, &parents);
        }
    }
    for info in array_of(value, "enums") {
        api.enums.push(EnumInfo {
            name: str_of(info, "name").ok_or_else(|| anyhow!("Enum is missing 'name'."))?.to_string(),
            is_bitmask: bool_of(info, "isBitmask").unwrap_or(false),
            is_hash: bool_of(info, "isHash").unwrap_or(false),
        });
    }
    for info in array_of(value, "kinds") {
        let name = str_of(info, "name").ok_or_else(|| anyhow!("Kind is missing 'name'."))?;
        api.kinds.push(KindInfo {
            name: name.to_string(),
            create_function_name: str_of(info, "createFunctionName")
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("{}.create", name)),
            initial_members: array_of(info, "initialMembers")
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect(),
        });
    }
    Ok(api)
}

fn parse_symbol(symbol: &Value) -> Result<SymbolInfo> {
    let name = str_of(symbol, "name").ok_or_else(|| anyhow!("Symbol is missing 'name'."))?;
    let namespace = str_of(symbol, "namespace").unwrap_or("");
    let mut info = SymbolInfo::new(namespace, name, str_of(symbol, "retType").unwrap_or("void"));
    if let Some(block_id) = str_of(symbol, "blockId") {
        info = info.block(block_id);
    }

    for param in array_of(symbol, "parameters") {
        let param_name = str_of(param, "name")
            .ok_or_else(|| anyhow!("Parameter of '{}' has no 'name'.", info.qualified_name()))?;
        let mut desc = ParameterDesc::new(param_name, str_of(param, "type").unwrap_or("any"));
        if bool_of(param, "optional").unwrap_or(false) {
            desc = desc.optional();
        }
        if bool_of(param, "isReceiver").unwrap_or(false) {
            desc = desc.receiver();
        }
        let check = array_of(param, "check").filter_map(Value::as_str).collect::<Vec<_>>();
        if !check.is_empty() {
            desc = desc.with_check(&check);
        }
        info = info.param(desc);
    }

    if let Some(handler) = symbol.get("handler").and_then(Value::as_array) {
        let params = handler
            .iter()
            .map(|p| (str_of(p, "name").unwrap_or("arg"), str_of(p, "type").unwrap_or("any")))
            .collect::<Vec<_>>();
        info = info.handler(&params);
    }

    if let Some(attrs) = symbol.get("attributes").and_then(Value::as_object) {
        let flag = |key: &str| attrs.get(key).and_then(Value::as_bool).unwrap_or(false);
        let text = |key: &str| attrs.get(key).and_then(Value::as_str).map(ToString::to_string);
        info.attributes.is_extension_method = flag("isExtensionMethod");
        info.attributes.image_literal = flag("imageLiteral");
        info.attributes.after_on_start = flag("afterOnStart");
        info.attributes.allow_multiple = flag("allowMultiple");
        info.attributes.handler_statement = flag("handlerStatement");
        info.attributes.alias_for = text("alias");
        info.attributes.default_instance = text("defaultInstance");
    }
    Ok(info)
}

fn str_of<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
    value.get(key).and_then(Value::as_str)
}

fn bool_of(value: &Value, key: &str) -> Option<bool> {
    value.get(key).and_then(Value::as_bool)
}

fn array_of<'v>(value: &'v Value, key: &str) -> impl Iterator<Item = &'v Value> {
    value.get(key).and_then(Value::as_array).into_iter().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockKind;
    use serde_json::json;

    #[test]
    fn reads_api_surface() {
        let api = parse_api(&json!({
            "symbols": [{
                "namespace": "sprites",
                "name": "create",
                "retType": "Sprite",
                "blockId": "spritescreate",
                "parameters": [{ "name": "img", "type": "Image" }, { "name": "kind", "type": "number", "optional": true }],
                "attributes": { "defaultInstance": "game" }
            }],
            "supertypes": { "Sprite": ["Entity"] },
            "enums": [{ "name": "Direction", "isBitmask": false }],
            "kinds": [{ "name": "SpriteKind", "initialMembers": ["Player"] }]
        }))
        .unwrap();
        let symbol = api.symbol_for_block("spritescreate").unwrap();
        assert_eq!(symbol.qualified_name(), "sprites.create");
        assert!(symbol.parameters[1].optional);
        assert_eq!(symbol.attributes.default_instance.as_deref(), Some("game"));
        assert_eq!(api.supertypes_of("Sprite"), vec!["Entity".to_string()]);
        assert_eq!(api.kinds[0].create_function_name, "SpriteKind.create");
        assert!(api.enum_info("Direction").is_some());
    }

    #[test]
    fn reads_blocks_and_variables() {
        let ws = parse_workspace(
            &json!({
                "blocks": [
                    { "id": "s", "type": "variables_set",
                      "fields": [{ "name": "VAR", "value": "x" }],
                      "inputs": [{ "name": "VALUE", "kind": "value", "block": "n" }] },
                    { "id": "n", "type": "math_number", "fields": [{ "name": "NUM", "value": 5 }] }
                ],
                "variables": [{ "name": "x" }]
            }),
            &ApiInfo::new(),
        )
        .unwrap();
        assert_eq!(ws.len(), 2);
        assert_eq!(ws.block(0).kind, BlockKind::VariableSet);
        assert_eq!(ws.block(1).field("NUM"), Some("5"));
        assert_eq!(ws.variables[0].name, "x");
    }

    #[test]
    fn rejects_unknown_input_kinds() {
        let err = parse_workspace(
            &json!({ "blocks": [{ "id": "a", "type": "controls_if",
                                  "inputs": [{ "name": "IF0", "kind": "sideways" }] }] }),
            &ApiInfo::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown kind"));
    }
}
