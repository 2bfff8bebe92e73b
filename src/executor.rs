use crate::error::ProviderError;
use crate::evaluation::request_matches;
use crate::models::{ApiTurn, Conversation, Parameters, PredictedCall, Prediction, Turn, TurnMetadata};
use crate::predictor::Predict;
use crate::simulator::ApiSimulator;
use serde_json::Value;
use tracing::{debug, warn};

const UNPARSABLE_CALL: &str = "API call could not be parsed";

/// Replays a scripted conversation against a predictor, executing every
/// predicted API call on the simulator
pub struct Executor<S> {
    simulator: S,
    max_chained_calls: usize,
}

impl<S: ApiSimulator> Executor<S> {
    pub fn new(simulator: S, max_chained_calls: usize) -> Self {
        Self {
            simulator,
            max_chained_calls: max_chained_calls.max(1),
        }
    }

    /// Fill `predictions` on every ground-truth api turn.
    ///
    /// User and assistant turns go into the history unchanged. Each api turn
    /// opens a slot where the predictor runs until it replies in text, makes
    /// a call satisfying the slot, or reaches the chained-call bound. Earlier
    /// predictions and scores are discarded first.
    pub async fn run_conversation<P: Predict>(
        &mut self,
        conversation: &mut Conversation,
        predictor: &mut P,
    ) -> Result<(), ProviderError> {
        let metadata = conversation.metadata.clone();
        let mut history: Vec<Turn> = Vec::new();

        for turn in conversation.conversation.iter_mut() {
            match turn {
                Turn::Api(slot) => {
                    reset_slot(slot);
                    self.fill_slot(&metadata, &mut history, slot, predictor).await?;
                }
                scripted => history.push(scripted.clone()),
            }
        }

        conversation.metrics = None;
        Ok(())
    }

    async fn fill_slot<P: Predict>(
        &mut self,
        metadata: &TurnMetadata,
        history: &mut Vec<Turn>,
        slot: &mut ApiTurn,
        predictor: &mut P,
    ) -> Result<(), ProviderError> {
        let mut calls = 0;

        loop {
            let mut call = match predictor.predict(metadata, history).await? {
                Prediction::Api(call) => call,
                reply => {
                    debug!("Model replied in text for {} slot", slot.request.api_name);
                    slot.predictions.push(reply);
                    history.push(scripted_outcome(slot));
                    return Ok(());
                }
            };

            calls += 1;
            self.dispatch(&mut call);
            let matched = request_matches(&call.request, &slot.request);
            history.push(call.to_history_turn());
            slot.predictions.push(Prediction::Api(call));

            if matched {
                return Ok(());
            }
            if calls >= self.max_chained_calls {
                warn!(
                    "Stopped after {} chained calls without satisfying {}",
                    calls, slot.request.api_name
                );
                slot.chain_overflow = true;
                history.push(scripted_outcome(slot));
                return Ok(());
            }
        }
    }

    /// Run one predicted call, storing the response or the simulator error
    fn dispatch(&mut self, call: &mut PredictedCall) {
        let Some(api_name) = call.request.api_name.as_deref() else {
            warn!("Not dispatching call without a parsable API name");
            call.exception = Some(Value::String(UNPARSABLE_CALL.to_string()));
            return;
        };

        let empty = Parameters::new();
        let parameters = call.request.parameters.as_ref().unwrap_or(&empty);

        match self.simulator.execute(api_name, parameters) {
            Ok(response) => {
                call.response = Some(response);
                call.exception = None;
            }
            Err(err) => {
                debug!("Simulated {} failed: {}", api_name, err);
                call.response = None;
                call.exception = Some(Value::String(err.to_string()));
            }
        }
    }
}

fn reset_slot(slot: &mut ApiTurn) {
    slot.predictions.clear();
    slot.matched = None;
    slot.bad_action = None;
    slot.chain_overflow = false;
}

/// The ground-truth call and outcome, as later turns expect to see it
fn scripted_outcome(slot: &ApiTurn) -> Turn {
    Turn::Api(ApiTurn::new(
        slot.request.clone(),
        slot.response.clone(),
        slot.exception.clone(),
    ))
}
