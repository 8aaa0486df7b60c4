//! Prompt, message and stop templates, and their binding into requests.
//!
//! A template is either a format string with named `{field}` placeholders
//! resolved against a data instance, or a function from the instance to a
//! string. Binding materialises the per-instance request inputs: chat models
//! receive `messages`, everything else receives `prompt`, never both.

use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};

use crate::error::{Result, TuneError};
use crate::{DataInstance, JsonMap};

/// Function form of a template.
pub type TemplateFn = dyn Fn(&DataInstance) -> String + Send + Sync;

/// A prompt (or message content) template.
#[derive(Clone)]
pub enum Template {
    /// Format string with named `{field}` placeholders.
    Format(String),
    /// Arbitrary function of the data instance.
    Fn(Arc<TemplateFn>),
}

impl Template {
    pub fn format(text: impl Into<String>) -> Self {
        Self::Format(text.into())
    }

    pub fn func(f: impl Fn(&DataInstance) -> String + Send + Sync + 'static) -> Self {
        Self::Fn(Arc::new(f))
    }

    /// Render the template against one data instance.
    pub fn render(&self, instance: &DataInstance) -> Result<String> {
        match self {
            Self::Format(text) => substitute(text, instance),
            Self::Fn(f) => Ok(f(instance)),
        }
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(text) => f.debug_tuple("Format").field(text).finish(),
            Self::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// One message of a chat prefix template.
#[derive(Debug, Clone)]
pub struct MessageTemplate {
    pub role: String,
    pub content: Template,
}

impl MessageTemplate {
    pub fn new(role: impl Into<String>, content: Template) -> Self {
        Self { role: role.into(), content }
    }

    /// A user-role message with a format-string content.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", Template::format(content))
    }

    /// A system-role message with a format-string content.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", Template::format(content))
    }
}

/// The resolved input templates for one trial.
#[derive(Debug, Clone)]
pub enum InputTemplates<'a> {
    Prompt(&'a Template),
    Messages(&'a [MessageTemplate]),
}

/// Materialise the request inputs for one data instance.
///
/// Writes `messages` or `prompt` into `params` and removes the other key. A
/// bare prompt template for a chat model is lifted into a single user-role
/// message.
pub fn bind_input(
    params: &mut JsonMap,
    input: &InputTemplates<'_>,
    chat: bool,
    instance: &DataInstance,
) -> Result<()> {
    match input {
        InputTemplates::Messages(messages) => {
            let rendered: Vec<Value> = messages
                .iter()
                .map(|m| {
                    Ok(json!({
                        "role": m.role,
                        "content": m.content.render(instance)?,
                    }))
                })
                .collect::<Result<_>>()?;
            params.insert("messages".to_string(), Value::Array(rendered));
            params.remove("prompt");
        }
        InputTemplates::Prompt(prompt) if chat => {
            let content = prompt.render(instance)?;
            params.insert(
                "messages".to_string(),
                json!([{"role": "user", "content": content}]),
            );
            params.remove("prompt");
        }
        InputTemplates::Prompt(prompt) => {
            params.insert("prompt".to_string(), Value::String(prompt.render(instance)?));
            params.remove("messages");
        }
    }
    Ok(())
}

/// Named placeholder substitution: `{field}` is replaced by the instance
/// field of that name; `{{` and `}}` escape literal braces.
fn substitute(text: &str, instance: &DataInstance) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(TuneError::Template(format!(
                                "unterminated placeholder in template: {text:?}"
                            )));
                        }
                    }
                }
                let value = instance.get(&name).ok_or_else(|| {
                    TuneError::Template(format!("missing template field: {name}"))
                })?;
                out.push_str(&value_text(value));
            }
            '}' => {
                return Err(TuneError::Template(format!(
                    "unmatched '}}' in template: {text:?}"
                )));
            }
            c => out.push(c),
        }
    }
    Ok(out)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(value: Value) -> DataInstance {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_format_substitution() {
        let t = Template::format("Q: {question}\nA:");
        let data = instance(json!({"question": "why?"}));
        assert_eq!(t.render(&data).unwrap(), "Q: why?\nA:");
    }

    #[test]
    fn test_numeric_field_substitution() {
        let t = Template::format("count={count}");
        let data = instance(json!({"count": 7}));
        assert_eq!(t.render(&data).unwrap(), "count=7");
    }

    #[test]
    fn test_brace_escapes() {
        let t = Template::format("{{literal}} {value}");
        let data = instance(json!({"value": "x"}));
        assert_eq!(t.render(&data).unwrap(), "{literal} x");
    }

    #[test]
    fn test_missing_field_errors() {
        let t = Template::format("{missing}");
        let data = instance(json!({}));
        assert!(matches!(t.render(&data), Err(TuneError::Template(_))));
    }

    #[test]
    fn test_unterminated_placeholder_errors() {
        let t = Template::format("{oops");
        let data = instance(json!({"oops": 1}));
        assert!(t.render(&data).is_err());
    }

    #[test]
    fn test_function_template() {
        let t = Template::func(|data| {
            format!("fn:{}", data.get("x").and_then(Value::as_str).unwrap_or(""))
        });
        let data = instance(json!({"x": "y"}));
        assert_eq!(t.render(&data).unwrap(), "fn:y");
    }

    #[test]
    fn test_bind_prompt_plain_model() {
        let mut params = JsonMap::new();
        let t = Template::format("{prompt}");
        let data = instance(json!({"prompt": "hello"}));
        bind_input(&mut params, &InputTemplates::Prompt(&t), false, &data).unwrap();
        assert_eq!(params.get("prompt"), Some(&json!("hello")));
        assert!(!params.contains_key("messages"));
    }

    #[test]
    fn test_bind_prompt_lifted_for_chat() {
        let mut params = JsonMap::new();
        params.insert("prompt".to_string(), json!(0));
        let t = Template::format("{prompt}");
        let data = instance(json!({"prompt": "hello"}));
        bind_input(&mut params, &InputTemplates::Prompt(&t), true, &data).unwrap();
        assert!(!params.contains_key("prompt"));
        assert_eq!(
            params.get("messages"),
            Some(&json!([{"role": "user", "content": "hello"}]))
        );
    }

    #[test]
    fn test_bind_messages() {
        let mut params = JsonMap::new();
        params.insert("prompt".to_string(), json!(0));
        let messages = vec![
            MessageTemplate::system("You answer {topic} questions."),
            MessageTemplate::user("{question}"),
        ];
        let data = instance(json!({"topic": "math", "question": "1+1?"}));
        bind_input(&mut params, &InputTemplates::Messages(&messages), true, &data).unwrap();
        assert!(!params.contains_key("prompt"));
        assert_eq!(
            params.get("messages"),
            Some(&json!([
                {"role": "system", "content": "You answer math questions."},
                {"role": "user", "content": "1+1?"},
            ]))
        );
    }

    #[test]
    fn test_bind_never_leaves_both_inputs() {
        let mut params = JsonMap::new();
        params.insert("messages".to_string(), json!(1));
        let t = Template::format("x");
        let data = instance(json!({}));
        bind_input(&mut params, &InputTemplates::Prompt(&t), false, &data).unwrap();
        assert!(params.contains_key("prompt"));
        assert!(!params.contains_key("messages"));
    }
}
