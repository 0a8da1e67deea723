//! Input References, Command Templates and Output Expressions
//!
//! Inputs are literals or `${...}` references resolved by the supervisor once
//! upstream calls are done. Commands are templates with `{name}`
//! placeholders. Outputs are small expressions evaluated against a finished
//! job's execution directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Number, Value};

use super::model::Fqn;

/// A resolved call input.
#[derive(Debug, Clone, PartialEq)]
pub enum InputExpr {
    Literal(Value),
    WorkflowInput(String),
    /// Current element of the call's own scatter
    ScatterItem(String),
    CallOutput { call: Fqn, output: String },
}

impl InputExpr {
    /// Upstream call this input depends on, if any.
    pub fn upstream(&self) -> Option<&Fqn> {
        match self {
            Self::CallOutput { call, .. } => Some(call),
            _ => None,
        }
    }
}

/// Splits a `${a}` or `${a.b}` reference into its segments.
///
/// Returns `None` for anything that is not exactly one reference, so strings
/// that merely contain `${` stay literals.
pub fn parse_reference(value: &Value) -> Option<Vec<&str>> {
    let text = value.as_str()?.trim();
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains('{') || inner.contains('}') {
        return None;
    }
    Some(inner.split('.').map(str::trim).collect())
}

/// Renders a value the way it appears on a command line.
pub fn value_to_arg(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(items) => items
            .iter()
            .map(value_to_arg)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(_) => value.to_string(),
    }
}

/// Replaces `{name}` placeholders with the matching bindings.
///
/// Unknown placeholders are left untouched.
pub fn render_template(template: &str, bindings: &BTreeMap<String, Value>) -> String {
    let mut text = template.to_string();
    for (name, value) in bindings {
        let placeholder = format!("{{{}}}", name);
        if text.contains(&placeholder) {
            text = text.replace(&placeholder, &value_to_arg(value));
        }
    }
    text
}

/// An output expression.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputExpr {
    Stdout,
    Stderr,
    ReadString(String),
    ReadInt(String),
    ReadFloat(String),
    ReadBoolean(String),
    ReadLines(String),
    ReadJson(String),
    /// Absolute path of a file that must exist
    File(String),
    Literal(String),
}

/// Where output expressions look for their files.
#[derive(Debug, Clone, Copy)]
pub struct OutputContext<'a> {
    pub call_root: &'a Path,
    pub stdout: &'a Path,
    pub stderr: &'a Path,
    pub bindings: &'a BTreeMap<String, Value>,
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    for quote in ['"', '\''] {
        if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
            return &text[1..text.len() - 1];
        }
    }
    text
}

impl OutputExpr {
    /// Parses an output expression.
    ///
    /// # Example
    ///
    /// ```
    /// use pipewright::workflow::OutputExpr;
    ///
    /// assert_eq!(OutputExpr::parse("stdout()").unwrap(), OutputExpr::Stdout);
    /// assert_eq!(
    ///     OutputExpr::parse("read_int(\"count.txt\")").unwrap(),
    ///     OutputExpr::ReadInt("count.txt".to_string())
    /// );
    /// assert!(OutputExpr::parse("read_xml(\"a\")").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("expression is empty".to_string());
        }

        let call = text
            .strip_suffix(')')
            .and_then(|rest| rest.split_once('('))
            .filter(|(name, _)| is_function_name(name));

        let Some((name, argument)) = call else {
            return Ok(Self::Literal(unquote(text).to_string()));
        };
        let argument = unquote(argument).to_string();

        match name {
            "stdout" | "stderr" if !argument.is_empty() => {
                Err(format!("{}() takes no arguments", name))
            }
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ if argument.is_empty() => Err(format!("{}() needs a path argument", name)),
            "read_string" => Ok(Self::ReadString(argument)),
            "read_int" => Ok(Self::ReadInt(argument)),
            "read_float" => Ok(Self::ReadFloat(argument)),
            "read_boolean" => Ok(Self::ReadBoolean(argument)),
            "read_lines" => Ok(Self::ReadLines(argument)),
            "read_json" => Ok(Self::ReadJson(argument)),
            "file" => Ok(Self::File(argument)),
            other => Err(format!("unknown function '{}'", other)),
        }
    }

    /// Evaluates the expression for a finished job.
    pub fn evaluate(&self, ctx: &OutputContext<'_>) -> Result<Value, String> {
        match self {
            Self::Stdout => read_text(ctx.stdout).map(|s| Value::String(trim_newline(&s))),
            Self::Stderr => read_text(ctx.stderr).map(|s| Value::String(trim_newline(&s))),
            Self::ReadString(path) => {
                let text = read_text(&resolve_path(ctx, path))?;
                Ok(Value::String(trim_newline(&text)))
            }
            Self::ReadInt(path) => {
                let text = read_text(&resolve_path(ctx, path))?;
                text.trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| format!("'{}' is not an integer: {}", text.trim(), e))
            }
            Self::ReadFloat(path) => {
                let text = read_text(&resolve_path(ctx, path))?;
                text.trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| format!("'{}' is not a finite number", text.trim()))
            }
            Self::ReadBoolean(path) => {
                let text = read_text(&resolve_path(ctx, path))?;
                match text.trim().to_ascii_lowercase().as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    other => Err(format!("'{}' is not a boolean", other)),
                }
            }
            Self::ReadLines(path) => {
                let text = read_text(&resolve_path(ctx, path))?;
                Ok(Value::Array(
                    text.lines().map(|l| Value::String(l.to_string())).collect(),
                ))
            }
            Self::ReadJson(path) => {
                let text = read_text(&resolve_path(ctx, path))?;
                serde_json::from_str(&text).map_err(|e| format!("invalid JSON: {}", e))
            }
            Self::File(path) => {
                let resolved = resolve_path(ctx, path);
                if resolved.is_file() {
                    Ok(Value::String(resolved.display().to_string()))
                } else {
                    Err(format!("file {} does not exist", resolved.display()))
                }
            }
            Self::Literal(text) => Ok(Value::String(render_template(text, ctx.bindings))),
        }
    }
}

fn is_function_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_lowercase() || c == '_')
}

fn resolve_path(ctx: &OutputContext<'_>, template: &str) -> PathBuf {
    let rendered = PathBuf::from(render_template(template, ctx.bindings));
    if rendered.is_absolute() {
        rendered
    } else {
        ctx.call_root.join(rendered)
    }
}

fn read_text(path: &Path) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))
}

fn trim_newline(text: &str) -> String {
    text.trim_end_matches(['\n', '\r']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_reference() {
        assert_eq!(parse_reference(&json!("${names}")), Some(vec!["names"]));
        assert_eq!(parse_reference(&json!("${a.out}")), Some(vec!["a", "out"]));
        assert_eq!(parse_reference(&json!("prefix ${a}")), None);
        assert_eq!(parse_reference(&json!("${a}-${b}")), None);
        assert_eq!(parse_reference(&json!(42)), None);
    }

    #[test]
    fn test_render_template() {
        let mut bindings = BTreeMap::new();
        bindings.insert("name".to_string(), json!("world"));
        bindings.insert("count".to_string(), json!(3));
        bindings.insert("files".to_string(), json!(["a.txt", "b.txt"]));

        let command = render_template("echo {name} {count} {files} {missing}", &bindings);
        assert_eq!(command, "echo world 3 a.txt b.txt {missing}");
    }

    #[test]
    fn test_value_to_arg_objects_are_json() {
        assert_eq!(value_to_arg(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(value_to_arg(&Value::Null), "");
        assert_eq!(value_to_arg(&json!(true)), "true");
    }

    #[test]
    fn test_parse_output_expressions() {
        assert_eq!(OutputExpr::parse("stderr()").unwrap(), OutputExpr::Stderr);
        assert_eq!(
            OutputExpr::parse("read_lines('out.txt')").unwrap(),
            OutputExpr::ReadLines("out.txt".to_string())
        );
        assert_eq!(
            OutputExpr::parse("file(result.bam)").unwrap(),
            OutputExpr::File("result.bam".to_string())
        );
        assert_eq!(
            OutputExpr::parse("\"constant\"").unwrap(),
            OutputExpr::Literal("constant".to_string())
        );

        assert!(OutputExpr::parse("").is_err());
        assert!(OutputExpr::parse("stdout(x)").is_err());
        assert!(OutputExpr::parse("read_int()").is_err());
        assert!(OutputExpr::parse("glob(\"*.txt\")").is_err());
    }

    #[test]
    fn test_evaluate_reads_files() {
        let dir = TempDir::new().unwrap();
        let stdout = dir.path().join("stdout");
        let stderr = dir.path().join("stderr");
        fs::write(&stdout, "hello\n").unwrap();
        fs::write(&stderr, "").unwrap();
        fs::write(dir.path().join("n.txt"), " 42\n").unwrap();
        fs::write(dir.path().join("f.txt"), "2.5").unwrap();
        fs::write(dir.path().join("b.txt"), "TRUE\n").unwrap();
        fs::write(dir.path().join("l.txt"), "x\ny\n").unwrap();
        fs::write(dir.path().join("j.json"), r#"{"k": [1, 2]}"#).unwrap();
        fs::write(dir.path().join("sample-1.txt"), "s").unwrap();

        let mut bindings = BTreeMap::new();
        bindings.insert("sample".to_string(), json!("sample-1"));
        let ctx = OutputContext {
            call_root: dir.path(),
            stdout: &stdout,
            stderr: &stderr,
            bindings: &bindings,
        };

        let eval = |text: &str| OutputExpr::parse(text).unwrap().evaluate(&ctx);

        assert_eq!(eval("stdout()").unwrap(), json!("hello"));
        assert_eq!(eval("stderr()").unwrap(), json!(""));
        assert_eq!(eval("read_int(\"n.txt\")").unwrap(), json!(42));
        assert_eq!(eval("read_float(\"f.txt\")").unwrap(), json!(2.5));
        assert_eq!(eval("read_boolean(\"b.txt\")").unwrap(), json!(true));
        assert_eq!(eval("read_lines(\"l.txt\")").unwrap(), json!(["x", "y"]));
        assert_eq!(eval("read_json(\"j.json\")").unwrap(), json!({"k": [1, 2]}));
        assert_eq!(eval("literal-{sample}").unwrap(), json!("literal-sample-1"));

        let file = eval("file(\"{sample}.txt\")").unwrap();
        assert!(file.as_str().unwrap().ends_with("sample-1.txt"));
    }

    #[test]
    fn test_evaluate_errors() {
        let dir = TempDir::new().unwrap();
        let stdout = dir.path().join("stdout");
        fs::write(&stdout, "not a number").unwrap();
        let bindings = BTreeMap::new();
        let ctx = OutputContext {
            call_root: dir.path(),
            stdout: &stdout,
            stderr: &stdout,
            bindings: &bindings,
        };

        assert!(OutputExpr::ReadInt("stdout".to_string()).evaluate(&ctx).is_err());
        assert!(OutputExpr::ReadString("missing.txt".to_string())
            .evaluate(&ctx)
            .is_err());
        assert!(OutputExpr::File("missing.txt".to_string()).evaluate(&ctx).is_err());
    }
}
