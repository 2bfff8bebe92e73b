use crate::catalog::{ApiCatalog, ApiDoc};
use crate::error::{SimulatorError, SimulatorErrorKind};
use crate::evaluation::parameters_match;
use crate::models::{ApiRequest, Conversation, Parameters, Turn};
use serde_json::Value;
use tracing::debug;

/// Backend the predicted API calls run against
pub trait ApiSimulator {
    fn execute(&mut self, api_name: &str, parameters: &Parameters) -> Result<Value, SimulatorError>;
}

struct RecordedCall {
    request: ApiRequest,
    response: Option<Value>,
    exception: Option<Value>,
    consumed: bool,
}

/// Checks calls against the catalog schema, then answers from the outcomes
/// recorded in the conversation's ground truth.
///
/// Each recorded outcome is handed out once in script order; when every
/// matching record has been used the last one is repeated.
pub struct ReplaySimulator<'a> {
    catalog: &'a ApiCatalog,
    recorded: Vec<RecordedCall>,
}

impl<'a> ReplaySimulator<'a> {
    pub fn new(catalog: &'a ApiCatalog, conversation: &Conversation) -> Self {
        let recorded = conversation
            .conversation
            .iter()
            .filter_map(|turn| match turn {
                Turn::Api(api) => Some(RecordedCall {
                    request: api.request.clone(),
                    response: api.response.clone(),
                    exception: api.exception.clone(),
                    consumed: false,
                }),
                _ => None,
            })
            .collect();

        Self { catalog, recorded }
    }

    fn check_schema(&self, api_name: &str, parameters: &Parameters) -> Result<&ApiDoc, SimulatorError> {
        let api = self.catalog.get(api_name).ok_or_else(|| {
            SimulatorError::new(SimulatorErrorKind::UnknownApi, format!("API {} not found", api_name))
        })?;

        for required in api.required_parameters() {
            if parameters.get(required).is_none_or(Value::is_null) {
                return Err(SimulatorError::new(
                    SimulatorErrorKind::MissingRequiredParameter,
                    format!("{} requires parameter {}", api_name, required),
                ));
            }
        }

        for (name, value) in parameters {
            let Some(declared) = api.parameters.get(name) else {
                return Err(SimulatorError::new(
                    SimulatorErrorKind::InvalidParameterType,
                    format!("{} has no parameter {}", api_name, name),
                ));
            };
            if !value.is_null() && !type_matches(&declared.kind, value) {
                return Err(SimulatorError::new(
                    SimulatorErrorKind::InvalidParameterType,
                    format!("parameter {} of {} must be {}, got {}", name, api_name, declared.kind, value),
                ));
            }
        }

        Ok(api)
    }
}

impl ApiSimulator for ReplaySimulator<'_> {
    fn execute(&mut self, api_name: &str, parameters: &Parameters) -> Result<Value, SimulatorError> {
        self.check_schema(api_name, parameters)?;

        let candidates: Vec<usize> = self
            .recorded
            .iter()
            .enumerate()
            .filter(|(_, call)| {
                call.request.api_name == api_name && parameters_match(parameters, &call.request.parameters)
            })
            .map(|(index, _)| index)
            .collect();

        let index = candidates
            .iter()
            .copied()
            .find(|&index| !self.recorded[index].consumed)
            .or_else(|| candidates.last().copied())
            .ok_or_else(|| {
                SimulatorError::new(
                    SimulatorErrorKind::PreconditionViolation,
                    format!("no recorded outcome for {} with these parameters", api_name),
                )
            })?;

        let call = &mut self.recorded[index];
        call.consumed = true;
        debug!("Replaying recorded outcome #{} for {}", index, api_name);

        match &call.exception {
            Some(exception) => Err(SimulatorError::new(
                SimulatorErrorKind::PreconditionViolation,
                match exception {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                },
            )),
            None => Ok(call.response.clone().unwrap_or(Value::Null)),
        }
    }
}

fn type_matches(kind: &str, value: &Value) -> bool {
    match kind {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" | "float" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}
