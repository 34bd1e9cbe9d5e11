//! YAML handling for manifest documents
//!
//! Parsing goes through yaml-rust2 into `serde_json::Value` so documents can
//! be merged and inspected as plain JSON trees. Emission goes through
//! serde_yaml, as do typed reads that must keep scalar text verbatim. Key order is deterministic, so emitted documents are stable
//! for identical input.

use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

/// Separator written between documents of a multi-document stream
pub const DOCUMENT_SEPARATOR: &str = "---\n";

/// Error type for YAML parsing
#[derive(Debug, Clone)]
pub struct YamlError(String);

impl std::fmt::Display for YamlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for YamlError {}

/// Convert CRLF and lone CR line endings to LF.
///
/// Overlay inputs may be authored on different platforms and the block
/// structure of YAML depends on exact line boundaries.
pub fn normalize_line_endings(input: &str) -> String {
    if !input.contains('\r') {
        return input.to_string();
    }
    input.replace("\r\n", "\n").replace('\r', "\n")
}

/// Parse a YAML string into a serde_json::Value.
///
/// For multi-document YAML, returns only the first document.
/// Returns `Value::Null` for empty input.
pub fn parse_yaml(input: &str) -> Result<Value, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    match docs.into_iter().next() {
        Some(doc) => yaml_to_json(doc),
        None => Ok(Value::Null),
    }
}

/// Parse a multi-document YAML stream, dropping empty documents.
pub fn parse_documents(input: &str) -> Result<Vec<Value>, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    docs.into_iter()
        .map(yaml_to_json)
        .filter(|doc| !matches!(doc, Ok(Value::Null)))
        .collect()
}

/// Deserialize the first document into a typed value.
///
/// String fields receive the scalar exactly as written, so an unquoted tag
/// like `1.10` or `010` is not reinterpreted as a number.
pub fn from_yaml_str<T: DeserializeOwned>(input: &str) -> Result<T, YamlError> {
    serde_yaml::from_str(input).map_err(|e| YamlError(e.to_string()))
}

/// Emit a single document as YAML text (always newline-terminated).
pub fn to_yaml(value: &Value) -> Result<String, YamlError> {
    let mut out = serde_yaml::to_string(value).map_err(|e| YamlError(e.to_string()))?;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    Ok(out)
}

/// Emit documents as one `---`-separated stream.
pub fn to_yaml_stream(values: &[Value]) -> Result<String, YamlError> {
    let mut out = String::new();
    for value in values {
        out.push_str(DOCUMENT_SEPARATOR);
        out.push_str(&to_yaml(value)?);
    }
    Ok(out)
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(e.to_string()))?;
            Ok(Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(YamlError("unsupported YAML key type".to_string())),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("YAML aliases not supported".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}
