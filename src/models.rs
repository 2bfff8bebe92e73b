use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameters of an API call, keyed by parameter name
pub type Parameters = Map<String, Value>;

/// One conversation file: the scripted ground truth plus, once processed,
/// the predictions and metrics attached to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// APIs the scripted conversation calls
    #[serde(default)]
    pub apis_used: Vec<String>,
    /// Suites those APIs belong to
    #[serde(default)]
    pub suites_used: Vec<String>,
    /// User data injected into every system prompt
    #[serde(default)]
    pub metadata: TurnMetadata,
    /// Ordered scripted turns
    pub conversation: Vec<Turn>,
    /// Per-conversation metrics, present after evaluation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    /// Dataset fields this harness does not interpret, kept on persist
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Conversation {
    /// Ground-truth api turns in script order
    pub fn api_turns(&self) -> impl Iterator<Item = &ApiTurn> {
        self.conversation.iter().filter_map(|turn| match turn {
            Turn::Api(api) => Some(api),
            _ => None,
        })
    }

    /// True when every ground-truth api turn carries at least one prediction
    pub fn is_predicted(&self) -> bool {
        self.api_turns().all(|turn| !turn.predictions.is_empty())
    }
}

/// User data for the system prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One scripted step of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Turn {
    User(TextTurn),
    Assistant(TextTurn),
    Api(ApiTurn),
}

#[cfg(test)]
impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Turn::User(TextTurn::new(text))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Turn::Assistant(TextTurn::new(text))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextTurn {
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
impl TextTurn {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            extra: Map::new(),
        }
    }
}

/// A fully named API request, as scripted in the ground truth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub api_name: String,
    #[serde(default)]
    pub parameters: Parameters,
}

/// Ground-truth api turn, or an executed call replayed as history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTurn {
    pub request: ApiRequest,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub exception: Option<Value>,
    /// Everything the model produced while this slot was open
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub predictions: Vec<Prediction>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bad_action: Option<bool>,
    /// Set when the chained-call bound cut the prediction loop short
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub chain_overflow: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ApiTurn {
    pub fn new(request: ApiRequest, response: Option<Value>, exception: Option<Value>) -> Self {
        Self {
            request,
            response,
            exception,
            predictions: Vec::new(),
            matched: None,
            bad_action: None,
            chain_overflow: false,
            extra: Map::new(),
        }
    }
}

/// Normalized output of one predictor invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Prediction {
    Assistant(AssistantPrediction),
    Api(PredictedCall),
}

impl Prediction {
    pub fn text(text: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Prediction::Assistant(AssistantPrediction {
            text: text.into(),
            metadata,
        })
    }

    pub fn call(
        api_name: Option<String>,
        parameters: Option<Parameters>,
        metadata: Map<String, Value>,
    ) -> Self {
        Prediction::Api(PredictedCall {
            request: PredictedRequest {
                api_name,
                parameters,
            },
            response: None,
            exception: None,
            metadata,
            matched: None,
            bad_action: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantPrediction {
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A request as recovered from model output; either half may be unparsable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedRequest {
    pub api_name: Option<String>,
    pub parameters: Option<Parameters>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedCall {
    pub request: PredictedRequest,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub exception: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bad_action: Option<bool>,
}

impl PredictedCall {
    /// History entry the model sees for this call on its next turn
    pub fn to_history_turn(&self) -> Turn {
        let request = ApiRequest {
            api_name: self.request.api_name.clone().unwrap_or_default(),
            parameters: self.request.parameters.clone().unwrap_or_default(),
        };
        Turn::Api(ApiTurn::new(
            request,
            self.response.clone(),
            self.exception.clone(),
        ))
    }
}
