use crate::config::Config;
use crate::error::{ConfigError, ProviderError};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs,
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolChoiceOption,
        ChatCompletionToolType, CompletionUsage, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, CreateCompletionRequest,
        CreateCompletionRequestArgs, CreateCompletionResponse, FunctionCall, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Dialect-neutral chat message
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System(String),
    User(String),
    Assistant(String),
    /// Assistant message carrying a structured function call
    ToolCall(ToolCallPayload),
    /// Result of a structured function call
    ToolResult { call_id: String, content: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallPayload {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments, exactly as the model produced them
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionRequest {
    /// Chat endpoint; `tools` are OpenAI function schemas
    Chat {
        messages: Vec<ChatMessage>,
        tools: Vec<Value>,
    },
    /// Legacy completions endpoint with a fully rendered prompt
    Raw { prompt: String },
}

/// What came back from one model call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: Option<String>,
    /// First structured tool call, if any
    pub tool_call: Option<ToolCallPayload>,
    /// Token usage and similar diagnostics
    pub metadata: Map<String, Value>,
}

/// One blocking model call per invocation
#[async_trait]
pub trait CompletionClient: Send {
    async fn complete(
        &mut self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError>;
}

/// OpenAI-compatible endpoint with request spacing
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    rate_limit_rps: f64,
    /// Last request time for the endpoint
    last_request: Option<Instant>,
}

impl OpenAiClient {
    pub fn new(
        api_endpoint: &str,
        api_key: String,
        model: impl Into<String>,
        temperature: f64,
        max_tokens: u32,
        rate_limit_rps: f64,
    ) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(api_endpoint);

        Self {
            client: Client::with_config(openai_config),
            model: model.into(),
            temperature,
            max_tokens,
            rate_limit_rps,
            last_request: None,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            &config.api_endpoint,
            config.api_key()?,
            &config.model,
            config.temperature,
            config.max_tokens,
            config.rate_limit_rps,
        ))
    }

    /// Enforce rate limiting for API requests
    async fn enforce_rate_limit(last_request: &mut Option<Instant>, rate_limit_rps: f64) {
        if rate_limit_rps <= 0.0 {
            return;
        }

        let min_interval = Duration::from_secs_f64(1.0 / rate_limit_rps);

        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    fn max_tokens(&self) -> u16 {
        self.max_tokens.min(u16::MAX as u32) as u16
    }

    /// Build the chat completion request; tools are omitted when empty
    fn build_chat_request(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        let messages = messages
            .iter()
            .map(to_request_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .messages(messages)
            .temperature(self.temperature as f32)
            .max_tokens(self.max_tokens());

        if !tools.is_empty() {
            let tools = tools.iter().map(to_tool).collect::<Result<Vec<_>, _>>()?;
            builder.tools(tools).tool_choice(ChatCompletionToolChoiceOption::Auto);
        }

        builder.build()
    }

    fn build_raw_request(&self, prompt: &str) -> Result<CreateCompletionRequest, OpenAIError> {
        CreateCompletionRequestArgs::default()
            .model(&self.model)
            .prompt(prompt.to_string())
            .temperature(self.temperature as f32)
            .max_tokens(self.max_tokens())
            .build()
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn complete(
        &mut self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        Self::enforce_rate_limit(&mut self.last_request, self.rate_limit_rps).await;

        match request {
            CompletionRequest::Chat { messages, tools } => {
                let request = self.build_chat_request(messages, tools).map_err(classify)?;
                let response = self.client.chat().create(request).await.map_err(classify)?;
                debug!("Chat completion response: {:?}", response);
                Ok(extract_chat_response(response))
            }
            CompletionRequest::Raw { prompt } => {
                let request = self.build_raw_request(prompt).map_err(classify)?;
                let response = self.client.completions().create(request).await.map_err(classify)?;
                debug!("Completion response: {:?}", response);
                Ok(extract_raw_response(response))
            }
        }
    }
}

fn to_request_message(message: &ChatMessage) -> Result<ChatCompletionRequestMessage, OpenAIError> {
    let message = match message {
        ChatMessage::System(content) => ChatCompletionRequestSystemMessageArgs::default()
            .content(content.clone())
            .build()?
            .into(),
        ChatMessage::User(content) => ChatCompletionRequestUserMessageArgs::default()
            .content(content.clone())
            .build()?
            .into(),
        ChatMessage::Assistant(content) => ChatCompletionRequestAssistantMessageArgs::default()
            .content(content.clone())
            .build()?
            .into(),
        ChatMessage::ToolCall(call) => ChatCompletionRequestAssistantMessageArgs::default()
            .tool_calls(vec![ChatCompletionMessageToolCall {
                id: call.id.clone(),
                r#type: ChatCompletionToolType::Function,
                function: FunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                },
            }])
            .build()?
            .into(),
        ChatMessage::ToolResult { call_id, content } => ChatCompletionRequestToolMessageArgs::default()
            .tool_call_id(call_id.clone())
            .content(content.clone())
            .build()?
            .into(),
    };
    Ok(message)
}

fn to_tool(doc: &Value) -> Result<ChatCompletionTool, OpenAIError> {
    let function = FunctionObjectArgs::default()
        .name(doc["name"].as_str().unwrap_or_default())
        .description(doc["description"].as_str().unwrap_or_default())
        .parameters(doc["parameters"].clone())
        .build()?;

    ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(function)
        .build()
}

fn usage_metadata(usage: Option<&CompletionUsage>) -> Map<String, Value> {
    let mut metadata = Map::new();
    if let Some(usage) = usage {
        metadata.insert("prompt_tokens".to_string(), json!(usage.prompt_tokens));
        metadata.insert("completion_tokens".to_string(), json!(usage.completion_tokens));
        metadata.insert("total_tokens".to_string(), json!(usage.total_tokens));
    }
    metadata
}

fn extract_chat_response(response: CreateChatCompletionResponse) -> CompletionResponse {
    let metadata = usage_metadata(response.usage.as_ref());

    let Some(choice) = response.choices.into_iter().next() else {
        return CompletionResponse {
            metadata,
            ..CompletionResponse::default()
        };
    };

    let tool_call = choice
        .message
        .tool_calls
        .and_then(|calls| calls.into_iter().next())
        .map(|call| ToolCallPayload {
            id: call.id,
            name: call.function.name,
            arguments: call.function.arguments,
        });

    CompletionResponse {
        content: choice.message.content,
        tool_call,
        metadata,
    }
}

fn extract_raw_response(response: CreateCompletionResponse) -> CompletionResponse {
    let metadata = usage_metadata(response.usage.as_ref());
    let content = response.choices.into_iter().next().map(|choice| choice.text);

    CompletionResponse {
        content,
        tool_call: None,
        metadata,
    }
}

fn classify(err: OpenAIError) -> ProviderError {
    match &err {
        OpenAIError::ApiError(api) if is_rate_limit(api.r#type.as_deref(), &api.message) => {
            ProviderError::RateLimited(api.message.clone())
        }
        _ => ProviderError::Provider(err.to_string()),
    }
}

fn is_rate_limit(kind: Option<&str>, message: &str) -> bool {
    kind.is_some_and(|kind| kind.contains("rate_limit"))
        || message.to_lowercase().contains("rate limit")
}

/// Retries rate-limited calls with a fixed wait; other errors pass through.
/// The request is resent unchanged, so the caller sees one logical call.
pub struct Retrying<C> {
    inner: C,
    attempts: u32,
    wait: Duration,
}

impl<C> Retrying<C> {
    pub fn new(inner: C, attempts: u32, wait: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            wait,
        }
    }
}

#[async_trait]
impl<C: CompletionClient> CompletionClient for Retrying<C> {
    async fn complete(
        &mut self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut last = String::new();

        for attempt in 1..=self.attempts {
            match self.inner.complete(request).await {
                Err(ProviderError::RateLimited(message)) => {
                    warn!("Rate limited (attempt {}/{}): {}", attempt, self.attempts, message);
                    last = message;
                    if attempt < self.attempts {
                        sleep(self.wait).await;
                    }
                }
                other => return other,
            }
        }

        Err(ProviderError::RetriesExhausted {
            attempts: self.attempts,
            last,
        })
    }
}
