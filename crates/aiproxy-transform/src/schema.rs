//! Downconverts arbitrary JSON Schema tool definitions into the restricted
//! dialect accepted by the Gemini and Antigravity function-calling
//! validators. Runs as a sequenced pipeline of normalization steps; every
//! step is idempotent on already-normalized input, so schemas may pass
//! through more than once.

use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Gemini,
    Antigravity,
}

const REASON_DESCRIPTION: &str = "Brief explanation of why you are calling this tool";

/// Constraint keywords the target dialects reject; their values survive as
/// description hints.
const UNSUPPORTED_CONSTRAINTS: [&str; 10] = [
    "minLength",
    "maxLength",
    "pattern",
    "minItems",
    "maxItems",
    "format",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "default",
    "examples",
];

/// Schema metadata keywords dropped outright.
const DROPPED_KEYWORDS: [&str; 7] = [
    "$schema",
    "$id",
    "$defs",
    "definitions",
    "additionalProperties",
    "propertyNames",
    "patternProperties",
];

pub fn clean(schema: Value, dialect: Dialect) -> Value {
    let mut root = schema;
    clean_node(&mut root, dialect, true);
    root
}

/// Normalize one schema node and recurse into its children. Returns whether
/// the node declared itself nullable via a `[T, null]` type array, so the
/// enclosing object can strip it from `required`.
///
/// Keys inside a `properties` map are property names, never keywords; the
/// walk only interprets keywords at schema positions, which is what keeps a
/// property literally called `pattern` (or `.`/`*`/`?` names) intact.
fn clean_node(node: &mut Value, dialect: Dialect, top_level: bool) -> bool {
    let Some(obj) = node.as_object_mut() else {
        return false;
    };

    inline_ref(obj);
    const_to_enum(obj);
    merge_all_of(obj, dialect);
    collapse_any_of(obj, dialect);
    let nullable = flatten_type_array(obj);
    stringify_enum(obj);
    hint_enum(obj);
    hint_closed_object(obj);
    hint_constraints(obj);
    drop_metadata_keywords(obj);

    recurse_children(obj, dialect);

    if dialect == Dialect::Antigravity && !top_level {
        inject_placeholders(obj);
    }
    if dialect == Dialect::Gemini {
        obj.remove("nullable");
        obj.remove("title");
        remove_placeholders(obj);
    }
    prune_required(obj);

    nullable
}

/// Step 1: `$ref` becomes an object placeholder naming the referent.
fn inline_ref(obj: &mut Map<String, Value>) {
    let Some(reference) = obj.remove("$ref") else {
        return;
    };
    let Some(reference) = reference.as_str() else {
        return;
    };
    let name = reference.rsplit('/').next().unwrap_or(reference);
    let hint = format!("See: {name}");
    let description = match obj.get("description").and_then(Value::as_str) {
        Some(existing) if !existing.is_empty() => format!("{existing} {hint}"),
        _ => hint,
    };
    obj.insert("type".to_string(), json!("object"));
    obj.insert("description".to_string(), Value::String(description));
}

/// Step 2: `const: v` → `enum: [v]`.
fn const_to_enum(obj: &mut Map<String, Value>) {
    if let Some(value) = obj.remove("const") {
        obj.insert("enum".to_string(), Value::Array(vec![value]));
    }
}

/// Step 7: fold every `allOf` child's properties and required into the
/// parent.
fn merge_all_of(obj: &mut Map<String, Value>, dialect: Dialect) {
    let Some(Value::Array(children)) = obj.remove("allOf") else {
        return;
    };
    for mut child in children {
        clean_node(&mut child, dialect, false);
        let Some(child) = child.as_object_mut() else {
            continue;
        };
        if let Some(Value::Object(child_props)) = child.remove("properties") {
            let props = obj
                .entry("properties")
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(props) = props.as_object_mut() {
                for (name, schema) in child_props {
                    props.entry(name).or_insert(schema);
                }
            }
        }
        if let Some(Value::Array(child_required)) = child.remove("required") {
            let required = obj
                .entry("required")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(required) = required.as_array_mut() {
                for entry in child_required {
                    if !required.contains(&entry) {
                        required.push(entry);
                    }
                }
            }
        }
    }
    if !obj.contains_key("type") && obj.contains_key("properties") {
        obj.insert("type".to_string(), json!("object"));
    }
}

/// Step 8: collapse `anyOf`/`oneOf` to the single highest-scoring
/// alternative, keeping a hint listing what was accepted.
fn collapse_any_of(obj: &mut Map<String, Value>, dialect: Dialect) {
    for keyword in ["anyOf", "oneOf"] {
        let Some(Value::Array(alternatives)) = obj.remove(keyword) else {
            continue;
        };
        if alternatives.is_empty() {
            continue;
        }

        let accepted: Vec<String> = alternatives
            .iter()
            .map(|alt| type_label(alt).to_string())
            .collect();
        let mut best = alternatives
            .into_iter()
            .max_by_key(score_alternative)
            .unwrap_or(Value::Null);
        clean_node(&mut best, dialect, false);

        let parent_description = obj.get("description").and_then(Value::as_str).map(str::to_string);
        if let Some(best) = best.as_object_mut() {
            let mut description = match (
                parent_description,
                best.get("description").and_then(Value::as_str),
            ) {
                (Some(parent), _) => parent,
                (None, Some(own)) => own.to_string(),
                (None, None) => String::new(),
            };
            if accepted.len() > 1 && !description.contains("Accepts:") {
                let hint = format!("Accepts: {}", accepted.join(" | "));
                if description.is_empty() {
                    description = hint;
                } else {
                    description = format!("{description} {hint}");
                }
            }
            if !description.is_empty() {
                best.insert("description".to_string(), Value::String(description));
            }
            let merged = std::mem::take(best);
            for (key, value) in merged {
                obj.insert(key, value);
            }
        }
    }
}

fn score_alternative(alt: &Value) -> u8 {
    match type_label(alt) {
        "object" => 4,
        "array" => 3,
        "null" => 1,
        _ => 2,
    }
}

fn type_label(alt: &Value) -> &str {
    alt.get("type").and_then(Value::as_str).unwrap_or("any")
}

/// Step 9: `type: [T, null]` flattens to scalar `T` with a `(nullable)`
/// hint; a bare `[null]` degrades to string.
fn flatten_type_array(obj: &mut Map<String, Value>) -> bool {
    let Some(Value::Array(types)) = obj.get("type") else {
        return false;
    };
    let names: Vec<String> = types
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    let nullable = names.iter().any(|name| name == "null");
    let concrete = names
        .iter()
        .find(|name| *name != "null")
        .cloned()
        .unwrap_or_else(|| "string".to_string());
    obj.insert("type".to_string(), Value::String(concrete));
    if nullable {
        append_hint(obj, "(nullable)");
    }
    nullable
}

/// Step 3: Gemini rejects non-string enum members; coerce and retype.
fn stringify_enum(obj: &mut Map<String, Value>) {
    let Some(Value::Array(members)) = obj.get_mut("enum") else {
        return;
    };
    let mut changed = false;
    for member in members.iter_mut() {
        if !member.is_string() {
            *member = Value::String(scalar_to_string(member));
            changed = true;
        }
    }
    if changed || !obj.get("type").and_then(Value::as_str).is_some_and(|t| t == "string") {
        obj.insert("type".to_string(), json!("string"));
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Step 4: small enums get listed in the description.
fn hint_enum(obj: &mut Map<String, Value>) {
    let Some(Value::Array(members)) = obj.get("enum") else {
        return;
    };
    if !(2..=10).contains(&members.len()) {
        return;
    }
    if description(obj).contains("Allowed:") {
        return;
    }
    let listed: Vec<String> = members.iter().map(scalar_to_string).collect();
    let hint = format!("Allowed: {}", listed.join(", "));
    append_hint(obj, &hint);
}

/// Step 5: `additionalProperties: false` survives only as prose.
fn hint_closed_object(obj: &mut Map<String, Value>) {
    if obj.get("additionalProperties") != Some(&Value::Bool(false)) {
        return;
    }
    if !description(obj).contains("No extra properties allowed") {
        append_hint(obj, "No extra properties allowed");
    }
}

/// Step 6: unsupported constraints become `kw: value` hints, then vanish.
fn hint_constraints(obj: &mut Map<String, Value>) {
    for keyword in UNSUPPORTED_CONSTRAINTS {
        let Some(value) = obj.remove(keyword) else {
            continue;
        };
        let rendered = match &value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        append_hint(obj, &format!("{keyword}: {rendered}"));
    }
}

/// Step 10: schema metadata and `x-*` extensions are dropped outright.
fn drop_metadata_keywords(obj: &mut Map<String, Value>) {
    for keyword in DROPPED_KEYWORDS {
        obj.remove(keyword);
    }
    obj.retain(|key, _| !key.starts_with("x-"));
}

fn recurse_children(obj: &mut Map<String, Value>, dialect: Dialect) {
    let mut no_longer_required: Vec<Value> = Vec::new();
    if let Some(Value::Object(properties)) = obj.get_mut("properties") {
        for (name, child) in properties.iter_mut() {
            if clean_node(child, dialect, false) {
                no_longer_required.push(Value::String(name.clone()));
            }
        }
    }
    if !no_longer_required.is_empty()
        && let Some(Value::Array(required)) = obj.get_mut("required")
    {
        required.retain(|entry| !no_longer_required.contains(entry));
    }

    if let Some(items) = obj.get_mut("items") {
        match items {
            Value::Array(members) => {
                for member in members {
                    clean_node(member, dialect, false);
                }
            }
            other => {
                clean_node(other, dialect, false);
            }
        }
    }
    if let Some(Value::Array(members)) = obj.get_mut("prefixItems") {
        for member in members {
            clean_node(member, dialect, false);
        }
    }
}

/// Step 12 (Antigravity): the validator refuses empty parameter objects and
/// objects with nothing required; give it something to hold on to.
fn inject_placeholders(obj: &mut Map<String, Value>) {
    if obj.get("type").and_then(Value::as_str) != Some("object") {
        return;
    }
    let properties_empty = match obj.get("properties") {
        None => true,
        Some(Value::Object(properties)) => properties.is_empty(),
        Some(_) => true,
    };
    if properties_empty {
        obj.insert(
            "properties".to_string(),
            json!({
                "reason": {
                    "type": "string",
                    "description": REASON_DESCRIPTION,
                }
            }),
        );
        obj.insert("required".to_string(), json!(["reason"]));
        return;
    }

    let nothing_required = match obj.get("required") {
        None => true,
        Some(Value::Array(required)) => required.is_empty(),
        Some(_) => true,
    };
    if nothing_required && !has_placeholder(obj) {
        if let Some(Value::Object(properties)) = obj.get_mut("properties") {
            properties.insert("_".to_string(), json!({"type": "boolean"}));
        }
        obj.insert("required".to_string(), json!(["_"]));
    }
}

fn has_placeholder(obj: &Map<String, Value>) -> bool {
    matches!(obj.get("properties"), Some(Value::Object(properties)) if properties.contains_key("_"))
}

/// Step 13 (Gemini): undo Antigravity placeholders for schemas that pass
/// through both dialects.
fn remove_placeholders(obj: &mut Map<String, Value>) {
    let mut removed: Vec<Value> = Vec::new();
    if let Some(Value::Object(properties)) = obj.get_mut("properties") {
        if properties
            .get("_")
            .is_some_and(|schema| schema.get("type") == Some(&json!("boolean")))
        {
            properties.remove("_");
            removed.push(json!("_"));
        }
        if properties
            .get("reason")
            .and_then(|schema| schema.get("description"))
            .and_then(Value::as_str)
            == Some(REASON_DESCRIPTION)
        {
            properties.remove("reason");
            removed.push(json!("reason"));
        }
    }
    if !removed.is_empty()
        && let Some(Value::Array(required)) = obj.get_mut("required")
    {
        required.retain(|entry| !removed.contains(entry));
    }
}

/// Step 11: `required` entries must reference live properties.
fn prune_required(obj: &mut Map<String, Value>) {
    let Some(Value::Array(required)) = obj.get("required") else {
        return;
    };
    let live: Vec<Value> = match obj.get("properties") {
        Some(Value::Object(properties)) => required
            .iter()
            .filter(|entry| {
                entry
                    .as_str()
                    .is_some_and(|name| properties.contains_key(name))
            })
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    if live.is_empty() {
        obj.remove("required");
    } else {
        obj.insert("required".to_string(), Value::Array(live));
    }
}

fn description(obj: &Map<String, Value>) -> String {
    obj.get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn append_hint(obj: &mut Map<String, Value>, hint: &str) {
    let current = description(obj);
    let next = if current.is_empty() {
        hint.to_string()
    } else {
        format!("{current} {hint}")
    };
    obj.insert("description".to_string(), Value::String(next));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refs_become_placeholders() {
        let cleaned = clean(
            json!({"$ref": "#/$defs/Location", "description": "Where"}),
            Dialect::Gemini,
        );
        assert_eq!(cleaned["type"], "object");
        assert_eq!(cleaned["description"], "Where See: Location");
    }

    #[test]
    fn const_becomes_string_enum() {
        let cleaned = clean(json!({"const": 5}), Dialect::Gemini);
        assert_eq!(cleaned["type"], "string");
        assert_eq!(cleaned["enum"], json!(["5"]));
    }

    #[test]
    fn numeric_enums_coerce_and_hint() {
        let cleaned = clean(
            json!({"type": "integer", "enum": [1, 2, 3]}),
            Dialect::Gemini,
        );
        assert_eq!(cleaned["type"], "string");
        assert_eq!(cleaned["enum"], json!(["1", "2", "3"]));
        assert_eq!(cleaned["description"], "Allowed: 1, 2, 3");
    }

    #[test]
    fn closed_object_survives_as_prose() {
        let cleaned = clean(
            json!({"type": "object", "properties": {"a": {"type": "string"}}, "additionalProperties": false}),
            Dialect::Gemini,
        );
        assert!(cleaned.get("additionalProperties").is_none());
        assert_eq!(cleaned["description"], "No extra properties allowed");
    }

    #[test]
    fn constraints_move_to_description() {
        let cleaned = clean(
            json!({"type": "string", "minLength": 2, "pattern": "^a"}),
            Dialect::Gemini,
        );
        assert!(cleaned.get("minLength").is_none());
        assert!(cleaned.get("pattern").is_none());
        let description = cleaned["description"].as_str().unwrap();
        assert!(description.contains("minLength: 2"));
        assert!(description.contains("pattern: ^a"));
    }

    #[test]
    fn property_named_pattern_is_not_a_constraint() {
        let cleaned = clean(
            json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "weird.*?name": {"type": "string"}
                },
                "required": ["pattern"]
            }),
            Dialect::Gemini,
        );
        assert!(cleaned["properties"].get("pattern").is_some());
        assert!(cleaned["properties"].get("weird.*?name").is_some());
        assert_eq!(cleaned["required"], json!(["pattern"]));
    }

    #[test]
    fn all_of_merges_into_parent() {
        let cleaned = clean(
            json!({
                "allOf": [
                    {"properties": {"a": {"type": "string"}}, "required": ["a"]},
                    {"properties": {"b": {"type": "integer"}}, "required": ["b"]}
                ]
            }),
            Dialect::Gemini,
        );
        assert_eq!(cleaned["type"], "object");
        assert!(cleaned["properties"].get("a").is_some());
        assert!(cleaned["properties"].get("b").is_some());
        assert_eq!(cleaned["required"], json!(["a", "b"]));
    }

    #[test]
    fn any_of_prefers_objects_and_records_alternatives() {
        let cleaned = clean(
            json!({
                "anyOf": [
                    {"type": "string"},
                    {"type": "object", "properties": {"x": {"type": "string"}}}
                ]
            }),
            Dialect::Gemini,
        );
        assert_eq!(cleaned["type"], "object");
        assert!(
            cleaned["description"]
                .as_str()
                .unwrap()
                .contains("Accepts: string | object")
        );
    }

    #[test]
    fn nullable_type_arrays_flatten_and_leave_required() {
        let cleaned = clean(
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": ["string", "null"]},
                    "age": {"type": "integer"}
                },
                "required": ["name", "age"]
            }),
            Dialect::Gemini,
        );
        assert_eq!(cleaned["properties"]["name"]["type"], "string");
        assert_eq!(
            cleaned["properties"]["name"]["description"],
            "(nullable)"
        );
        assert_eq!(cleaned["required"], json!(["age"]));
    }

    #[test]
    fn null_only_type_degrades_to_string() {
        let cleaned = clean(json!({"type": ["null"]}), Dialect::Gemini);
        assert_eq!(cleaned["type"], "string");
    }

    #[test]
    fn metadata_keywords_are_dropped() {
        let cleaned = clean(
            json!({
                "$schema": "https://json-schema.org/draft/2020-12/schema",
                "$id": "tool",
                "type": "object",
                "properties": {"a": {"type": "string", "x-order": 1}},
                "patternProperties": {"^s_": {"type": "string"}},
                "x-internal": true
            }),
            Dialect::Gemini,
        );
        for key in ["$schema", "$id", "patternProperties", "x-internal"] {
            assert!(cleaned.get(key).is_none(), "{key} should be gone");
        }
        assert!(cleaned["properties"]["a"].get("x-order").is_none());
    }

    #[test]
    fn stale_required_entries_are_pruned() {
        let cleaned = clean(
            json!({
                "type": "object",
                "properties": {"kept": {"type": "string"}},
                "required": ["kept", "ghost"]
            }),
            Dialect::Gemini,
        );
        assert_eq!(cleaned["required"], json!(["kept"]));
    }

    #[test]
    fn antigravity_fills_empty_objects() {
        let cleaned = clean(
            json!({
                "type": "object",
                "properties": {
                    "opts": {"type": "object"}
                },
                "required": ["opts"]
            }),
            Dialect::Antigravity,
        );
        let opts = &cleaned["properties"]["opts"];
        assert_eq!(
            opts["properties"]["reason"]["description"],
            REASON_DESCRIPTION
        );
        assert_eq!(opts["required"], json!(["reason"]));
        // Top level keeps its shape.
        assert!(cleaned["properties"].get("reason").is_none());
    }

    #[test]
    fn antigravity_requires_something() {
        let cleaned = clean(
            json!({
                "type": "object",
                "properties": {
                    "inner": {
                        "type": "object",
                        "properties": {"a": {"type": "string"}}
                    }
                },
                "required": ["inner"]
            }),
            Dialect::Antigravity,
        );
        let inner = &cleaned["properties"]["inner"];
        assert_eq!(inner["properties"]["_"], json!({"type": "boolean"}));
        assert_eq!(inner["required"], json!(["_"]));
    }

    #[test]
    fn gemini_strips_antigravity_placeholders() {
        let once = clean(
            json!({
                "type": "object",
                "properties": {
                    "inner": {"type": "object", "properties": {"a": {"type": "string"}}}
                },
                "required": ["inner"]
            }),
            Dialect::Antigravity,
        );
        let again = clean(once, Dialect::Gemini);
        let inner = &again["properties"]["inner"];
        assert!(inner["properties"].get("_").is_none());
        assert!(inner.get("required").is_none());
    }

    #[test]
    fn clean_is_idempotent() {
        let source = json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "mode": {"type": "integer", "enum": [1, 2]},
                "name": {"type": ["string", "null"], "minLength": 1},
                "query": {
                    "anyOf": [
                        {"type": "string"},
                        {"type": "object", "properties": {"q": {"type": "string"}}}
                    ]
                },
                "nested": {"$ref": "#/$defs/Nested"}
            },
            "required": ["mode", "name"]
        });
        for dialect in [Dialect::Gemini, Dialect::Antigravity] {
            let once = clean(source.clone(), dialect);
            let twice = clean(once.clone(), dialect);
            assert_eq!(once, twice, "dialect {dialect:?}");
        }
    }

    #[test]
    fn top_level_object_type_is_preserved() {
        let cleaned = clean(
            json!({"type": "object", "properties": {"a": {"type": "string"}}}),
            Dialect::Gemini,
        );
        assert_eq!(cleaned["type"], "object");
    }
}
