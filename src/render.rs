use clap::ValueEnum;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};

/// How a cleaned notebook is written back out.
#[derive(
    ValueEnum, Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, Default, PartialEq, Eq,
)]
#[serde(rename_all = "kebab-case")]
pub enum OutputStyle {
    /// One-space indent with sorted keys, as Jupyter and nbconvert write notebooks
    #[default]
    Nbformat,
    /// Two-space indent with the original key order, as jq prints documents
    Jq,
}

impl OutputStyle {
    fn indent(self) -> &'static [u8] {
        match self {
            OutputStyle::Nbformat => b" ",
            OutputStyle::Jq => b"  ",
        }
    }

    fn sorts_keys(self) -> bool {
        matches!(self, OutputStyle::Nbformat)
    }
}

/// Serialize `doc` in the given style, always ending with a newline.
#[tracing::instrument(level = "trace", skip(doc))]
pub fn render(doc: &Value, style: OutputStyle) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = PrettyFormatter::with_indent(style.indent());
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    if style.sorts_keys() {
        sorted(doc).serialize(&mut ser)?;
    } else {
        doc.serialize(&mut ser)?;
    }
    out.push(b'\n');
    Ok(out)
}

/// Deep copy of `value` with every object's keys in code point order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::with_capacity(entries.len());
            for (key, val) in entries {
                out.insert(key.clone(), sorted(val));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn nbformat_style_sorts_and_uses_single_space() {
        let doc = parse(r#"{"b": {"z": 1, "a": []}, "a": "ü"}"#);
        let out = String::from_utf8(render(&doc, OutputStyle::Nbformat).unwrap()).unwrap();
        assert_eq!(out, "{\n \"a\": \"ü\",\n \"b\": {\n  \"a\": [],\n  \"z\": 1\n }\n}\n");
    }

    #[test]
    fn jq_style_keeps_order_and_uses_two_spaces() {
        let doc = parse(r#"{"b": {"z": 1, "a": null}, "a": 2}"#);
        let out = String::from_utf8(render(&doc, OutputStyle::Jq).unwrap()).unwrap();
        assert_eq!(out, "{\n  \"b\": {\n    \"z\": 1,\n    \"a\": null\n  },\n  \"a\": 2\n}\n");
    }

    #[test]
    fn number_digits_survive_and_exponents_normalize() {
        let doc = parse(
            r#"{"x": 1.50, "n": -0.0, "z": 12345678901234567890123, "y": 1e3, "v": 1E+2}"#,
        );
        let out = String::from_utf8(render(&doc, OutputStyle::Jq).unwrap()).unwrap();
        assert!(out.contains("\"x\": 1.50,"), "{out}");
        assert!(out.contains("\"n\": -0.0,"), "{out}");
        assert!(out.contains("\"z\": 12345678901234567890123,"), "{out}");
        assert!(out.contains("\"y\": 1e+3,"), "{out}");
        assert!(out.contains("\"v\": 1e+2\n"), "{out}");
    }
}
