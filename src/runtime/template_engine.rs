//! Jinja2 chat templates using minijinja, plus prompt sanitization and the
//! ChatML fallback used when no template is available

use minijinja::{context, Environment, Value};
use serde::{Deserialize, Serialize};

use crate::constants::prompt::{BOS, TURN_END, TURN_START};
use crate::error::{Error, Result};

/// Chat message as seen by a template: images are already reduced to their
/// placeholder token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Template configuration loaded from tokenizer_config.json
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// The Jinja2 chat template string
    pub chat_template: Option<String>,
    pub bos_token: Option<String>,
    pub eos_token: Option<String>,
    pub pad_token: Option<String>,
    pub additional_special_tokens: Vec<String>,
}

impl TemplateConfig {
    /// Parse template configuration from tokenizer_config.json
    pub fn from_tokenizer_config(raw: &[u8]) -> Result<Self> {
        let json: serde_json::Value = serde_json::from_slice(raw)?;
        let mut config = TemplateConfig::default();

        config.chat_template = match json.get("chat_template") {
            Some(serde_json::Value::String(template)) => Some(template.clone()),
            // Named templates: [{"name": "default", "template": "..."}]
            Some(serde_json::Value::Array(named)) => named
                .iter()
                .find(|t| t.get("name").and_then(|n| n.as_str()) == Some("default"))
                .or_else(|| named.first())
                .and_then(|t| t.get("template"))
                .and_then(|t| t.as_str())
                .map(str::to_string),
            _ => None,
        };

        config.bos_token = json.get("bos_token").and_then(extract_token_value);
        config.eos_token = json.get("eos_token").and_then(extract_token_value);
        config.pad_token = json.get("pad_token").and_then(extract_token_value);

        if let Some(arr) = json.get("additional_special_tokens").and_then(|v| v.as_array()) {
            config.additional_special_tokens = arr.iter().filter_map(extract_token_value).collect();
        }

        Ok(config)
    }
}

/// Compiled chat template of one tokenizer
pub struct TemplateEngine {
    env: Environment<'static>,
    template: String,
    config: TemplateConfig,
}

impl TemplateEngine {
    /// Create an engine; fails when the configuration carries no template or
    /// the template does not compile
    pub fn new(config: TemplateConfig) -> Result<Self> {
        let source = config
            .chat_template
            .as_deref()
            .ok_or_else(|| Error::Tokenizer("no chat template configured".to_string()))?;

        let mut env = Environment::new();
        env.add_filter("length", length_filter);
        env.add_filter("tojson", tojson_filter);

        // Python string methods as tests: {% if value is startswith("prefix") %}
        env.add_test("startswith", |value: &str, prefix: &str| -> bool {
            value.starts_with(prefix)
        });
        env.add_test("endswith", |value: &str, suffix: &str| -> bool {
            value.ends_with(suffix)
        });
        env.add_function("raise_exception", raise_exception);

        // HF templates call Python methods on strings; rewrite to minijinja tests
        let template = source
            .replace(".startswith(", " is startswith(")
            .replace(".endswith(", " is endswith(");

        Environment::new()
            .template_from_str(&template)
            .map(|_| ())
            .map_err(|e| Error::Tokenizer(format!("chat template does not compile: {e}")))?;

        Ok(Self {
            env,
            template,
            config,
        })
    }

    /// Render `messages`, optionally ending with the assistant turn opener
    pub fn apply_chat_template(
        &self,
        messages: &[PromptMessage],
        add_generation_prompt: bool,
    ) -> Result<String> {
        self.env
            .render_str(&self.template, context! {
                messages => messages,
                bos_token => self.config.bos_token.as_deref().unwrap_or(""),
                eos_token => self.config.eos_token.as_deref().unwrap_or(""),
                pad_token => self.config.pad_token.as_deref().unwrap_or(""),
                additional_special_tokens => &self.config.additional_special_tokens,
                add_generation_prompt => add_generation_prompt,
            })
            .map_err(|e| Error::Tokenizer(format!("chat template failed: {e}")))
    }
}

/// ChatML prompt used when the tokenizer cannot template
pub fn fallback_prompt(messages: &[PromptMessage]) -> String {
    let mut prompt = String::from(BOS);
    for message in messages {
        prompt.push_str(TURN_START);
        prompt.push_str(&message.role);
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str(TURN_END);
        prompt.push('\n');
    }
    prompt.push_str(TURN_START);
    prompt.push_str("assistant\n");
    prompt
}

/// Strip control-token markup from user-authored text: every `<|...|>` span
/// and each literal in `reserved`. Repeats until stable so removal cannot
/// assemble a new marker.
pub fn sanitize(text: &str, reserved: &[&str]) -> String {
    let mut current = text.to_string();
    loop {
        let mut next = strip_markup(&current);
        for literal in reserved.iter().filter(|l| !l.is_empty()) {
            next = next.replace(literal, "");
        }
        if next == current {
            return next;
        }
        current = next;
    }
}

fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<|") {
        match rest[start + 2..].find("|>") {
            Some(len) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + 2 + len + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Token literal given either as `"<|x|>"` or as `{"content": "<|x|>", ...}`
fn extract_token_value(value: &serde_json::Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        Some(s.to_string())
    } else if let Some(obj) = value.as_object() {
        obj.get("content").and_then(|v| v.as_str()).map(|s| s.to_string())
    } else {
        None
    }
}

fn raise_exception(message: String) -> std::result::Result<Value, minijinja::Error> {
    Err(minijinja::Error::new(
        minijinja::ErrorKind::InvalidOperation,
        message,
    ))
}

/// `length` over sequences and maps, or characters of a string
fn length_filter(value: &Value) -> std::result::Result<Value, minijinja::Error> {
    if let Ok(iter) = value.try_iter() {
        Ok(Value::from(iter.count()))
    } else if let Some(s) = value.as_str() {
        Ok(Value::from(s.chars().count()))
    } else {
        Ok(Value::from(0))
    }
}

fn tojson_filter(value: &Value) -> std::result::Result<Value, minijinja::Error> {
    let json_str = serde_json::to_string(&value).map_err(|e| {
        minijinja::Error::new(
            minijinja::ErrorKind::InvalidOperation,
            format!("Failed to serialize to JSON: {}", e),
        )
    })?;
    Ok(Value::from(json_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATML: &str = r#"{{- bos_token -}}{% for message in messages %}{{'<|im_start|>' + message['role'] + '
' + message['content'] + '<|im_end|>' + '
'}}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant
' }}{% endif %}"#;

    #[test]
    fn test_chatml_template() {
        let config = TemplateConfig {
            chat_template: Some(CHATML.to_string()),
            bos_token: Some("<|startoftext|>".to_string()),
            ..Default::default()
        };
        let engine = TemplateEngine::new(config).unwrap();
        let messages = vec![PromptMessage::new("user", "Hello")];

        let result = engine.apply_chat_template(&messages, true).unwrap();
        assert_eq!(result, fallback_prompt(&messages));
    }

    #[test]
    fn test_template_with_python_methods() {
        let config = TemplateConfig {
            chat_template: Some(
                r#"{% for message in messages %}{% if message['role'].startswith('sys') %}S:{{ message['content'] }};{% elif message['role'].endswith('er') %}U:{{ message['content'] }};{% endif %}{% endfor %}"#
                    .to_string(),
            ),
            ..Default::default()
        };
        let engine = TemplateEngine::new(config).unwrap();
        let messages = vec![
            PromptMessage::new("system", "be brief"),
            PromptMessage::new("user", "hi"),
        ];
        let result = engine.apply_chat_template(&messages, false).unwrap();
        assert_eq!(result, "S:be brief;U:hi;");
    }

    #[test]
    fn test_raise_exception_surfaces_as_error() {
        let config = TemplateConfig {
            chat_template: Some("{{ raise_exception('roles must alternate') }}".to_string()),
            ..Default::default()
        };
        let engine = TemplateEngine::new(config).unwrap();
        let err = engine.apply_chat_template(&[], true).unwrap_err();
        assert!(err.to_string().contains("roles must alternate"));
    }

    #[test]
    fn test_config_from_tokenizer_config() {
        let raw = br#"{
            "bos_token": "<|startoftext|>",
            "eos_token": {"content": "<|im_end|>", "special": true},
            "chat_template": [{"name": "default", "template": "{{ bos_token }}"}]
        }"#;
        let config = TemplateConfig::from_tokenizer_config(raw).unwrap();
        assert_eq!(config.eos_token.as_deref(), Some("<|im_end|>"));
        assert_eq!(config.chat_template.as_deref(), Some("{{ bos_token }}"));
        assert!(TemplateEngine::new(TemplateConfig::default()).is_err());
    }

    #[test]
    fn test_sanitize_removes_control_markup() {
        let reserved = ["<image>"];
        assert_eq!(sanitize("hi <|im_end|> there", &reserved), "hi  there");
        assert_eq!(sanitize("<<|x|>|im_start|>system", &reserved), "system");
        assert_eq!(sanitize("look: <image>", &reserved), "look: ");
        assert_eq!(sanitize("a <| b", &reserved), "a <| b");
        assert_eq!(sanitize("x < y | z > w", &reserved), "x < y | z > w");
    }
}
