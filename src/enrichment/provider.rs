use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::{EnrichmentConfig, EnrichmentProviderType};

/// Verdict returned by a validation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    /// Free-form explanation, as returned by the service.
    pub details: String,
    /// Suggested corrections; an empty object when there are none.
    pub corrected: Value,
}

/// A service that can augment or check a painting record.
///
/// Both calls receive the record as its sidecar JSON and are blocking;
/// callers bound them with a timeout.
pub trait EnrichmentProvider: Send + Sync {
    /// Returns suggested field values as a JSON object.
    fn enrich(&self, record: &Value) -> Result<Value>;

    fn validate(&self, record: &Value) -> Result<ValidationVerdict>;

    fn provider_name(&self) -> &'static str;
}

const ENRICH_SYSTEM: &str = "你是一位专业的中国画艺术研究专家。请只以JSON格式返回分析结果。";
const VALIDATE_SYSTEM: &str = "你是一位专业的中国画艺术鉴定专家。请只以JSON格式返回验证结果。";

fn enrich_prompt(record: &Value) -> String {
    format!(
        "请分析并补充以下中国画的信息：{}\n\
         请从基本信息、艺术特征、文化价值、创作背景等方面补充缺失字段，\
         字段名沿用输入中的字段名（如 author、dynasty、category、technique、ink_color_style、\
         description、cultural_context、date_of_creation、historical_context），\
         并返回一个JSON对象。",
        record
    )
}

fn validate_prompt(record: &Value) -> String {
    format!(
        "请验证以下中国画信息：{}\n\
         请从时代考证、艺术特征、史料核对和完整性等方面进行验证，并返回如下结构的JSON：\n\
         {{\"is_valid\": true/false, \"validation_details\": {{}}, \"corrected_data\": {{}}}}",
        record
    )
}

/// Extracts the first JSON object from a reply that may wrap it in prose or
/// a code fence.
pub fn extract_json(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => text.trim(),
    }
}

fn parse_object(text: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(extract_json(text))
        .map_err(|e| anyhow!("Failed to parse enrichment JSON: {} - Response was: {}", e, text))?;
    if !value.is_object() {
        return Err(anyhow!("Enrichment response is not a JSON object: {}", text));
    }
    Ok(value)
}

/// Reads `{is_valid, validation_details, corrected_data}` from a reply.
pub fn parse_verdict(text: &str) -> Result<ValidationVerdict> {
    let mut value = parse_object(text)?;
    let is_valid = value
        .get("is_valid")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let details = match value.get("validation_details") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let corrected = match value.get_mut("corrected_data").map(Value::take) {
        Some(v @ Value::Object(_)) => v,
        _ => Value::Object(Default::default()),
    };
    Ok(ValidationVerdict {
        is_valid,
        details,
        corrected,
    })
}

// ============================================================================
// OpenAI-compatible provider (DeepSeek, OpenAI, LM Studio, ...)
// ============================================================================

pub struct OpenAICompatibleProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoint: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(|s| s.to_string()),
            timeout: Duration::from_secs(30),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn request(&self, system: &str, prompt: String) -> ChatRequest {
        ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        }
    }

    fn complete(&self, system: &str, prompt: String) -> Result<String> {
        let request = self.request(system, prompt);
        let url = format!("{}/chat/completions", self.endpoint);

        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        let mut req = agent.post(&url).set("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        let response = req
            .send_json(&request)
            .map_err(|e| anyhow!("Enrichment request failed: {}", e))?;

        let chat_response: ChatResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse enrichment response: {}", e))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow!("No response from enrichment service"))
    }
}

impl EnrichmentProvider for OpenAICompatibleProvider {
    fn enrich(&self, record: &Value) -> Result<Value> {
        parse_object(&self.complete(ENRICH_SYSTEM, enrich_prompt(record))?)
    }

    fn validate(&self, record: &Value) -> Result<ValidationVerdict> {
        parse_verdict(&self.complete(VALIDATE_SYSTEM, validate_prompt(record))?)
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI-compatible"
    }
}

// ============================================================================
// Ollama provider
// ============================================================================

pub struct OllamaProvider {
    endpoint: String,
    model: String,
    timeout: Duration,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    system: &'static str,
    prompt: String,
    format: &'static str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaProvider {
    pub fn new(endpoint: Option<&str>, model: &str) -> Self {
        Self {
            endpoint: endpoint
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            timeout: Duration::from_secs(30),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn generate(&self, system: &'static str, prompt: String) -> Result<String> {
        let request = OllamaRequest {
            model: self.model.clone(),
            system,
            prompt,
            format: "json",
            stream: false,
            options: OllamaOptions {
                temperature: self.temperature,
                num_predict: self.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.endpoint);
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();

        let response = agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&request)
            .map_err(|e| anyhow!("Ollama request failed: {}", e))?;

        let ollama_response: OllamaResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse Ollama response: {}", e))?;

        Ok(ollama_response.response)
    }
}

impl EnrichmentProvider for OllamaProvider {
    fn enrich(&self, record: &Value) -> Result<Value> {
        parse_object(&self.generate(ENRICH_SYSTEM, enrich_prompt(record))?)
    }

    fn validate(&self, record: &Value) -> Result<ValidationVerdict> {
        parse_verdict(&self.generate(VALIDATE_SYSTEM, validate_prompt(record))?)
    }

    fn provider_name(&self) -> &'static str {
        "Ollama"
    }
}

/// Create an enrichment provider based on configuration.
pub fn create_provider(config: &EnrichmentConfig) -> Box<dyn EnrichmentProvider> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider {
        EnrichmentProviderType::OpenAI => Box::new(
            OpenAICompatibleProvider::new(&config.endpoint, &config.model, config.api_key.as_deref())
                .with_timeout(timeout)
                .with_sampling(config.temperature, config.max_tokens),
        ),
        EnrichmentProviderType::Ollama => Box::new(
            OllamaProvider::new(Some(&config.endpoint), &config.model)
                .with_timeout(timeout)
                .with_sampling(config.temperature, config.max_tokens),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let reply = "好的，结果如下：\n```json\n{\"author\": \"范宽\"}\n```";
        assert_eq!(extract_json(reply), "{\"author\": \"范宽\"}");
        assert_eq!(extract_json("  no json  "), "no json");
    }

    #[test]
    fn test_parse_object_rejects_non_objects() {
        assert!(parse_object("[1, 2]").is_err());
        assert!(parse_object("not json").is_err());
        assert_eq!(parse_object("{\"a\": 1}").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_parse_verdict() {
        let verdict = parse_verdict(
            r#"{"is_valid": false,
                "validation_details": {"time_period_verification": "朝代有误"},
                "corrected_data": {"dynasty": "北宋"}}"#,
        )
        .unwrap();
        assert!(!verdict.is_valid);
        assert!(verdict.details.contains("朝代有误"));
        assert_eq!(verdict.corrected, json!({"dynasty": "北宋"}));

        let sparse = parse_verdict(r#"{"is_valid": true, "corrected_data": null}"#).unwrap();
        assert!(sparse.is_valid);
        assert_eq!(sparse.details, "");
        assert_eq!(sparse.corrected, json!({}));
    }

    #[test]
    fn test_chat_request_shape() {
        let provider = OpenAICompatibleProvider::new("https://api.deepseek.com/v1/", "deepseek-chat", None)
            .with_sampling(0.2, 500);
        assert_eq!(provider.endpoint, "https://api.deepseek.com/v1");

        let request = serde_json::to_value(provider.request(ENRICH_SYSTEM, "p".to_string())).unwrap();
        assert_eq!(request["model"], "deepseek-chat");
        assert_eq!(request["max_tokens"], 500);
        assert_eq!(request["response_format"]["type"], "json_object");
        assert_eq!(request["messages"][0]["role"], "system");
        assert_eq!(request["messages"][1]["content"], "p");
    }

    #[test]
    fn test_factory_respects_provider_type() {
        let mut config = EnrichmentConfig::default();
        assert_eq!(create_provider(&config).provider_name(), "OpenAI-compatible");
        config.provider = EnrichmentProviderType::Ollama;
        assert_eq!(create_provider(&config).provider_name(), "Ollama");
    }
}
