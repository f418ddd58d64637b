//! Message templates with `{{name}}` placeholders.

use crate::error::PromptError;
use crate::{Message, MessageRole};
use serde_json::{Map, Value};

/// A message whose content may reference input variables as `{{name}}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub role: MessageRole,
    pub template: String,
}

impl MessageTemplate {
    pub fn new(role: MessageRole, template: impl Into<String>) -> Self {
        Self {
            role,
            template: template.into(),
        }
    }

    pub fn system(template: impl Into<String>) -> Self {
        Self::new(MessageRole::System, template)
    }

    pub fn user(template: impl Into<String>) -> Self {
        Self::new(MessageRole::User, template)
    }

    pub fn assistant(template: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, template)
    }

    /// Substitute every placeholder; a missing variable is an error.
    pub fn render(&self, vars: &Map<String, Value>) -> Result<Message, PromptError> {
        let content = substitute(&self.template, |key| vars.get(key).map(value_text))
            .map_err(|variable| PromptError::Render {
                role: self.role.to_string(),
                variable,
            })?;
        Ok(Message::new(self.role, content))
    }

    /// Substitute placeholders, using `filler` for anything missing.
    pub fn render_with_filler(&self, vars: &Map<String, Value>, filler: &str) -> Message {
        let content = substitute(&self.template, |key| {
            Some(vars.get(key).map_or_else(|| filler.to_string(), value_text))
        })
        .unwrap_or_else(|_| self.template.clone());
        Message::new(self.role, content)
    }

    /// Names of the placeholders in this template, in order of appearance.
    pub fn variables(&self) -> Vec<String> {
        let mut names = Vec::new();
        let _ = substitute(&self.template, |key| {
            if !names.iter().any(|n| n == key) {
                names.push(key.to_string());
            }
            Some(String::new())
        });
        names
    }
}

/// Render a JSON value as placeholder text: strings verbatim, null empty,
/// everything else as compact JSON.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `{{key}}` occurrences via `lookup`. Returns the first key that
/// `lookup` could not resolve as the error. Text that is not a well-formed
/// placeholder (unclosed braces, non-identifier keys) is copied through.
fn substitute(
    template: &str,
    mut lookup: impl FnMut(&str) -> Option<String>,
) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let (before, after_open) = rest.split_at(open);
        out.push_str(before);
        let inner_start = after_open.strip_prefix("{{").unwrap_or(after_open);
        let Some((inner, tail)) = inner_start.split_once("}}") else {
            out.push_str(after_open);
            return Ok(out);
        };
        let key = inner.trim();
        if is_placeholder_key(key) {
            out.push_str(&lookup(key).ok_or_else(|| key.to_string())?);
            rest = tail;
        } else {
            out.push_str("{{");
            rest = inner_start;
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn is_placeholder_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn renders_named_placeholders() {
        let t = MessageTemplate::user("Hello {{name}}, you are {{ age }}.");
        let msg = t.render(&vars(json!({"name": "Ada", "age": 36}))).unwrap();
        assert_eq!(msg.content, "Hello Ada, you are 36.");
        assert_eq!(msg.role, MessageRole::User);
    }

    #[test]
    fn missing_variable_is_an_error() {
        let t = MessageTemplate::system("Use {{style}} style");
        let err = t.render(&Map::new()).unwrap_err();
        assert!(matches!(err, PromptError::Render { ref variable, .. } if variable == "style"));
    }

    #[test]
    fn filler_covers_missing_variables() {
        let t = MessageTemplate::user("{{a}} and {{b}}");
        let msg = t.render_with_filler(&vars(json!({"a": "x"})), "...");
        assert_eq!(msg.content, "x and ...");
    }

    #[test]
    fn json_braces_are_left_alone() {
        let t = MessageTemplate::system(r#"Reply as {"ok": true} or {{ not a key }} {{open"#);
        let msg = t.render(&Map::new()).unwrap();
        assert_eq!(msg.content, r#"Reply as {"ok": true} or {{ not a key }} {{open"#);
    }

    #[test]
    fn null_and_structured_values() {
        let t = MessageTemplate::user("[{{n}}] {{obj}}");
        let msg = t.render(&vars(json!({"n": null, "obj": {"k": 1}}))).unwrap();
        assert_eq!(msg.content, r#"[] {"k":1}"#);
    }

    #[test]
    fn variables_listed_once_in_order() {
        let t = MessageTemplate::user("{{b}} {{a}} {{b}}");
        assert_eq!(t.variables(), vec!["b".to_string(), "a".to_string()]);
    }
}
