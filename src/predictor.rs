use crate::catalog::ApiDoc;
use crate::client::{ChatMessage, CompletionClient, CompletionRequest, ToolCallPayload};
use crate::config::{CompletionStyle, Config, Dialect};
use crate::error::ProviderError;
use crate::models::{ApiTurn, Prediction, Turn, TurnMetadata};
use crate::normalizer::{
    TOOL_RESPONSE_CLOSE, TOOL_RESPONSE_OPEN, normalize, render_bracket_call, render_tagged_call,
};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

const CHAT_PREAMBLE: &str = "You are a helpful assistant.";

const TAGGED_PREAMBLE: &str = "You are a function calling AI model. Answer the user's questions, \
calling one or more of the functions below when they help.

Only call functions listed between the <tools></tools> tags. Do not guess parameter values; \
if one is missing, ask the user for it. To call a function, write a JSON object with its name \
and arguments between <tool_call> and </tool_call> tags, for example:
<tool_call>
{\"name\": \"function_name\", \"arguments\": {\"argument_name\": \"value\"}}
</tool_call>
Write nothing but JSON between the tags. Function results are returned to you between \
<tool_response> and </tool_response> tags.";

const BRACKET_PREAMBLE: &str = "You are an expert in composing functions. You are given a question \
and a set of possible functions. Make one or more function calls to achieve the purpose. If none \
of the functions can be used, or the question lacks required parameters, point it out.

To call a function, write FUNCTION_CALL followed by the call in the format \
[func_name(param_name=param_value, param_name2=param_value2)]. Do not include any other text \
in a response that calls a function.";

/// Next-action capability driven by the executor
#[async_trait]
pub trait Predict: Send {
    /// Set the API documentation shown to the model for the next conversation
    fn expose_apis(&mut self, apis: &[&ApiDoc]);

    /// Propose the next action given the history so far
    async fn predict(
        &mut self,
        metadata: &TurnMetadata,
        history: &[Turn],
    ) -> Result<Prediction, ProviderError>;
}

/// Model-backed predictor; the dialect and completion style pick the
/// prompt, the history serialization and the endpoint shape
pub struct Predictor<C> {
    client: C,
    dialect: Dialect,
    style: CompletionStyle,
    disable_docs: bool,
    /// OpenAI function schemas of the exposed APIs
    api_docs: Vec<Value>,
}

impl<C: CompletionClient> Predictor<C> {
    pub fn new(client: C, dialect: Dialect, style: CompletionStyle, disable_docs: bool) -> Self {
        Self {
            client,
            dialect,
            style,
            disable_docs,
            api_docs: Vec::new(),
        }
    }

    pub fn from_config(client: C, config: &Config) -> Self {
        Self::new(
            client,
            config.dialect,
            config.completion_style,
            config.disable_documentation,
        )
    }

    fn system_prompt(&self, metadata: &TurnMetadata) -> String {
        let user_data = format!(
            "Here is some user data:\nlocation: {}\ntimestamp: {}\nusername (if logged in): {}",
            metadata.location,
            metadata.timestamp,
            metadata.username.as_deref().unwrap_or("none"),
        );

        match self.dialect {
            Dialect::FunctionCall => format!("{} {}", CHAT_PREAMBLE, user_data),
            Dialect::ToolCallTags => format!(
                "{}\n\nHere are the tools available to you:\n<tools>\n{}\n</tools>\n\n{}",
                TAGGED_PREAMBLE,
                self.docs_listing(),
                user_data
            ),
            Dialect::BracketCall => format!(
                "{}\n\nHere is a list of functions in JSON format that you can invoke:\n{}\n\n{}",
                BRACKET_PREAMBLE,
                self.docs_listing(),
                user_data
            ),
        }
    }

    fn docs_listing(&self) -> String {
        self.api_docs
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replay the history into the dialect's message format
    fn render_messages(&self, metadata: &TurnMetadata, history: &[Turn]) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::System(self.system_prompt(metadata))];

        for (index, turn) in history.iter().enumerate() {
            match turn {
                Turn::User(turn) => messages.push(ChatMessage::User(turn.text.clone())),
                Turn::Assistant(turn) => messages.push(ChatMessage::Assistant(turn.text.clone())),
                Turn::Api(api) => messages.extend(self.render_api_turn(index, api)),
            }
        }
        messages
    }

    fn render_api_turn(&self, index: usize, api: &ApiTurn) -> [ChatMessage; 2] {
        let name = &api.request.api_name;
        let parameters = &api.request.parameters;
        let result = json!({"response": api.response, "exception": api.exception}).to_string();

        match self.dialect {
            Dialect::FunctionCall => {
                let call_id = format!("call_{}", index);
                [
                    ChatMessage::ToolCall(ToolCallPayload {
                        id: call_id.clone(),
                        name: name.clone(),
                        arguments: Value::Object(parameters.clone()).to_string(),
                    }),
                    ChatMessage::ToolResult {
                        call_id,
                        content: result,
                    },
                ]
            }
            Dialect::ToolCallTags => [
                ChatMessage::Assistant(render_tagged_call(name, parameters)),
                ChatMessage::User(format!("{}\n{}\n{}", TOOL_RESPONSE_OPEN, result, TOOL_RESPONSE_CLOSE)),
            ],
            Dialect::BracketCall => [
                ChatMessage::Assistant(render_bracket_call(name, parameters)),
                ChatMessage::User(result),
            ],
        }
    }

    fn build_request(&self, messages: Vec<ChatMessage>) -> CompletionRequest {
        match self.style {
            CompletionStyle::Chat => {
                let tools = match self.dialect {
                    Dialect::FunctionCall => self.api_docs.clone(),
                    _ => Vec::new(),
                };
                CompletionRequest::Chat { messages, tools }
            }
            CompletionStyle::Raw => CompletionRequest::Raw {
                prompt: render_chatml(&messages),
            },
        }
    }
}

#[async_trait]
impl<C: CompletionClient> Predict for Predictor<C> {
    fn expose_apis(&mut self, apis: &[&ApiDoc]) {
        self.api_docs = apis
            .iter()
            .map(|api| api.to_function_doc(self.disable_docs))
            .collect();
    }

    async fn predict(
        &mut self,
        metadata: &TurnMetadata,
        history: &[Turn],
    ) -> Result<Prediction, ProviderError> {
        let request = self.build_request(self.render_messages(metadata, history));
        let response = self.client.complete(&request).await?;
        debug!("Model response: {:?}", response);

        Ok(normalize(self.dialect, &response))
    }
}

/// Render messages as a ChatML prompt ending in an open assistant turn
pub fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let (role, content) = match message {
            ChatMessage::System(content) => ("system", content.clone()),
            ChatMessage::User(content) => ("user", content.clone()),
            ChatMessage::Assistant(content) => ("assistant", content.clone()),
            ChatMessage::ToolCall(call) => {
                let arguments: Value =
                    serde_json::from_str(&call.arguments).unwrap_or_else(|_| Value::String(call.arguments.clone()));
                ("assistant", json!({"name": call.name, "arguments": arguments}).to_string())
            }
            ChatMessage::ToolResult { content, .. } => ("tool", content.clone()),
        };
        prompt.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", role, content));
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}
