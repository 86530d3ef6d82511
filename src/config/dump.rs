//! Deterministic YAML-like rendering of the store.
//!
//! Keys sort alphabetically, nesting indents by four spaces, list items get
//! a `  - ` marker, and a nested value that renders to a single line
//! collapses onto its key's line.

use super::Value;
use std::collections::BTreeMap;

type Line = (Vec<String>, String);

pub(crate) fn dump_values(values: &BTreeMap<String, Value>) -> String {
    dump_map(values, 0)
        .into_iter()
        .map(|(indent, text)| format!("{}{}", indent.concat(), text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn dump_value(value: &Value, indent: usize) -> Vec<Line> {
    match value {
        Value::Map(map) => dump_map(map, indent),
        Value::List(items) => {
            let mut out = Vec::new();
            for item in items {
                for (index, (item_indent, text)) in dump_value(item, 0).into_iter().enumerate() {
                    out.push((get_indent(indent, index == 0, &item_indent), text));
                }
            }
            out
        }
        scalar => vec![(
            get_indent(indent, false, &[]),
            scalar.render().unwrap_or_default(),
        )],
    }
}

fn dump_map(map: &BTreeMap<String, Value>, indent: usize) -> Vec<Line> {
    let mut out = Vec::new();
    for (key, value) in map {
        let key_indent = get_indent(indent, false, &[]);
        let mut value_lines = dump_value(value, indent + 1);

        if value_lines.len() == 1 {
            let (_, text) = value_lines.remove(0);
            out.push((key_indent, format!("{key}: {text}")));
        } else {
            out.push((key_indent, format!("{key}:")));
            out.extend(value_lines);
        }
    }
    out
}

fn get_indent(indent: usize, is_list: bool, extend_with: &[String]) -> Vec<String> {
    let mut indent_list = if is_list {
        let count = indent.saturating_sub(1);
        let mut list = vec!["    ".to_string(); count];
        list.push("  - ".to_string());
        list
    } else {
        vec!["    ".to_string(); indent]
    };

    indent_list.extend(extend_with.iter().cloned());
    indent_list
}
