use crate::catalog::ApiCatalog;
use crate::error::ValidationError;
use crate::metrics::Metrics;
use crate::models::{ApiRequest, Conversation, Parameters, PredictedRequest, Prediction, Turn};
use anyhow::{Result, bail};
use serde_json::Value;
use tracing::debug;

/// Scores predicted calls against the ground truth
pub struct Evaluator<'a> {
    catalog: &'a ApiCatalog,
}

impl<'a> Evaluator<'a> {
    pub fn new(catalog: &'a ApiCatalog) -> Self {
        Self { catalog }
    }

    /// Attach `match`/`bad_action` to every api prediction and ground-truth
    /// api turn, store the conversation's metrics and return them.
    ///
    /// A turn is flagged bad only when none of its predictions matched; a
    /// wasted call before a match still shows on the prediction itself and
    /// still costs the conversation its success.
    ///
    /// Scores are recomputed from scratch, so evaluating twice gives the
    /// same result.
    pub fn evaluate_predictions(&self, conversation: &mut Conversation) -> Result<Metrics> {
        let mut metrics = Metrics {
            num_conversations: 1,
            ..Metrics::default()
        };
        let mut all_matched = true;
        let mut any_bad = false;

        for (index, turn) in conversation.conversation.iter_mut().enumerate() {
            let Turn::Api(turn) = turn else {
                continue;
            };
            if turn.predictions.is_empty() {
                bail!("Turn {} has no predictions; run the predict phase first", index);
            }

            let mut matched = false;
            let mut bad = false;
            for prediction in &mut turn.predictions {
                let Prediction::Api(call) = prediction else {
                    continue;
                };
                let (call_matched, call_bad) = self.score_call(&call.request, &turn.request);
                call.matched = Some(call_matched);
                call.bad_action = Some(call_bad);

                metrics.predictions += 1;
                metrics.actions += 1;
                if call_bad {
                    metrics.bad_actions += 1;
                } else {
                    metrics.valid_actions += 1;
                }
                matched |= call_matched;
                bad |= call_bad;
            }

            debug!(
                "Turn {} ({}): match={} bad_action={}",
                index, turn.request.api_name, matched, bad
            );
            turn.matched = Some(matched);
            turn.bad_action = Some(bad && !matched);

            metrics.ground_truths += 1;
            if matched {
                metrics.matches += 1;
            }
            all_matched &= matched;
            any_bad |= bad;
        }

        metrics.success = u64::from(all_matched && !any_bad);
        conversation.metrics = Some(metrics);
        Ok(metrics)
    }

    /// `(match, bad_action)` for one predicted call
    fn score_call(&self, predicted: &PredictedRequest, expected: &ApiRequest) -> (bool, bool) {
        let known_api = predicted
            .api_name
            .as_deref()
            .is_some_and(|name| self.catalog.get(name).is_some());

        let matched = request_matches(predicted, expected);
        let bad = !known_api || predicted.parameters.is_none() || !matched;
        (matched, bad)
    }
}

/// Same API and compatible parameters; an unparsed half never matches
pub fn request_matches(predicted: &PredictedRequest, expected: &ApiRequest) -> bool {
    match (&predicted.api_name, &predicted.parameters) {
        (Some(name), Some(parameters)) => {
            *name == expected.api_name && parameters_match(parameters, &expected.parameters)
        }
        _ => false,
    }
}

/// Parameter compatibility used for grading and for replaying outcomes.
///
/// `null` values count as absent. The remaining keys must be the same on
/// both sides and their values equal, with strings compared after trimming
/// and numbers compared by value.
pub fn parameters_match(predicted: &Parameters, expected: &Parameters) -> bool {
    let present = |parameters: &Parameters| parameters.values().filter(|value| !value.is_null()).count();

    present(predicted) == present(expected)
        && expected
            .iter()
            .filter(|(_, value)| !value.is_null())
            .all(|(key, value)| predicted.get(key).is_some_and(|candidate| values_match(candidate, value)))
}

fn values_match(predicted: &Value, expected: &Value) -> bool {
    match (predicted, expected) {
        (Value::String(a), Value::String(b)) => a.trim() == b.trim(),
        (Value::Number(a), Value::Number(b)) => a == b || a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_match(a, b))
        }
        (Value::Object(a), Value::Object(b)) => parameters_match(a, b),
        _ => predicted == expected,
    }
}

/// Harness self-check run after evaluation
pub fn validate(conversation: &Conversation) -> Result<(), ValidationError> {
    for (index, turn) in conversation.conversation.iter().enumerate() {
        let Turn::Api(turn) = turn else {
            continue;
        };
        if turn.predictions.is_empty() {
            return Err(ValidationError::NoPredictions { turn: index });
        }
        if turn.matched.is_none() {
            return Err(ValidationError::UnscoredTurn { turn: index, field: "match" });
        }
        if turn.bad_action.is_none() {
            return Err(ValidationError::UnscoredTurn { turn: index, field: "bad_action" });
        }

        for (position, prediction) in turn.predictions.iter().enumerate() {
            let Prediction::Api(call) = prediction else {
                continue;
            };
            if call.matched.is_none() {
                return Err(ValidationError::UnscoredPrediction {
                    turn: index,
                    prediction: position,
                    field: "match",
                });
            }
            if call.bad_action.is_none() {
                return Err(ValidationError::UnscoredPrediction {
                    turn: index,
                    prediction: position,
                    field: "bad_action",
                });
            }
        }
    }

    if conversation.metrics.is_none() {
        return Err(ValidationError::MissingMetrics);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::tests::test_catalog;
    use crate::models::{ApiTurn, TurnMetadata};
    use serde_json::{Map, json};

    pub(crate) fn params(value: Value) -> Parameters {
        value.as_object().unwrap().clone()
    }

    pub(crate) fn api_turn(name: &str, parameters: Value, response: Value) -> Turn {
        Turn::Api(ApiTurn::new(
            ApiRequest {
                api_name: name.to_string(),
                parameters: params(parameters),
            },
            Some(response),
            None,
        ))
    }

    pub(crate) fn conversation(turns: Vec<Turn>) -> Conversation {
        Conversation {
            apis_used: vec!["SendMessage".to_string()],
            suites_used: vec!["Message".to_string()],
            metadata: TurnMetadata {
                location: "Seattle".to_string(),
                timestamp: "2023-09-11 09:00:00".to_string(),
                username: Some("alice".to_string()),
                extra: Map::new(),
            },
            conversation: turns,
            metrics: None,
            extra: Map::new(),
        }
    }

    pub(crate) fn send_message_conversation() -> Conversation {
        conversation(vec![
            Turn::user("Tell bob hi"),
            api_turn(
                "SendMessage",
                json!({"receiver": "bob", "message": "hi"}),
                json!({"message_id": "m1"}),
            ),
            Turn::assistant("Message sent."),
        ])
    }

    fn call(name: &str, parameters: Option<Value>) -> Prediction {
        Prediction::call(Some(name.to_string()), parameters.map(params), Map::new())
    }

    fn attach(conversation: &mut Conversation, turn: usize, predictions: Vec<Prediction>) {
        match &mut conversation.conversation[turn] {
            Turn::Api(api) => api.predictions = predictions,
            other => panic!("turn {} is not an api turn: {:?}", turn, other),
        }
    }

    fn api(conversation: &Conversation, turn: usize) -> &ApiTurn {
        match &conversation.conversation[turn] {
            Turn::Api(api) => api,
            other => panic!("turn {} is not an api turn: {:?}", turn, other),
        }
    }

    #[test]
    fn test_exact_call_matches() {
        let catalog = test_catalog();
        let mut conv = send_message_conversation();
        attach(
            &mut conv,
            1,
            vec![
                call("SendMessage", Some(json!({"receiver": "bob", "message": "hi"}))),
                Prediction::text("Sent!", Map::new()),
            ],
        );

        let metrics = Evaluator::new(&catalog).evaluate_predictions(&mut conv).unwrap();

        let turn = api(&conv, 1);
        assert_eq!(turn.matched, Some(true));
        assert_eq!(turn.bad_action, Some(false));
        assert_eq!(metrics.success, 1);
        assert_eq!(metrics.matches, 1);
        assert_eq!(metrics.predictions, 1);
        assert_eq!(metrics.actions, 1);
        assert_eq!(metrics.valid_actions, 1);
        assert_eq!(metrics.bad_actions, 0);
        assert_eq!(metrics.ground_truths, 1);
        assert_eq!(metrics.num_conversations, 1);
        assert_eq!(conv.metrics, Some(metrics));
        assert!(validate(&conv).is_ok());
    }

    #[test]
    fn test_misspelled_api_is_bad_action() {
        let catalog = test_catalog();
        let mut conv = send_message_conversation();
        attach(
            &mut conv,
            1,
            vec![call("SendMesage", Some(json!({"receiver": "bob", "message": "hi"})))],
        );

        let metrics = Evaluator::new(&catalog).evaluate_predictions(&mut conv).unwrap();

        let turn = api(&conv, 1);
        assert_eq!(turn.matched, Some(false));
        assert_eq!(turn.bad_action, Some(true));
        assert_eq!(metrics.success, 0);
        assert_eq!(metrics.bad_actions, 1);
        assert_eq!(metrics.valid_actions, 0);
    }

    #[test]
    fn test_unparsed_parameters_are_bad_action() {
        let catalog = test_catalog();
        let mut conv = send_message_conversation();
        attach(&mut conv, 1, vec![call("SendMessage", None)]);

        let metrics = Evaluator::new(&catalog).evaluate_predictions(&mut conv).unwrap();
        assert_eq!(api(&conv, 1).bad_action, Some(true));
        assert_eq!(metrics.matches, 0);
    }

    #[test]
    fn test_text_only_is_neither_match_nor_bad() {
        let catalog = test_catalog();
        let mut conv = send_message_conversation();
        attach(&mut conv, 1, vec![Prediction::text("Who is bob?", Map::new())]);

        let metrics = Evaluator::new(&catalog).evaluate_predictions(&mut conv).unwrap();
        let turn = api(&conv, 1);
        assert_eq!(turn.matched, Some(false));
        assert_eq!(turn.bad_action, Some(false));
        assert_eq!(metrics.predictions, 0);
        assert_eq!(metrics.success, 0);
    }

    #[test]
    fn test_one_matched_one_mismatched_turn_fails() {
        let catalog = test_catalog();
        let mut conv = conversation(vec![
            Turn::user("Weather in Oslo, then tell bob"),
            api_turn("CurrentWeather", json!({"city": "Oslo"}), json!("rain")),
            api_turn("SendMessage", json!({"receiver": "bob", "message": "rain"}), json!({})),
            Turn::assistant("Done."),
        ]);
        attach(&mut conv, 1, vec![call("CurrentWeather", Some(json!({"city": "Oslo"})))]);
        attach(
            &mut conv,
            2,
            vec![call("SendMessage", Some(json!({"receiver": "bob", "message": "sunny"})))],
        );

        let metrics = Evaluator::new(&catalog).evaluate_predictions(&mut conv).unwrap();
        assert_eq!(metrics.matches, 1);
        assert_eq!(metrics.ground_truths, 2);
        assert_eq!(metrics.success, 0);
    }

    #[test]
    fn test_recovered_turn_keeps_wasted_call_on_prediction() {
        let catalog = test_catalog();
        let mut conv = send_message_conversation();
        attach(
            &mut conv,
            1,
            vec![
                call("SendMessage", Some(json!({"receiver": "bobby", "message": "hi"}))),
                call("SendMessage", Some(json!({"receiver": "bob", "message": "hi"}))),
            ],
        );

        let metrics = Evaluator::new(&catalog).evaluate_predictions(&mut conv).unwrap();
        let turn = api(&conv, 1);
        assert_eq!(turn.matched, Some(true));
        assert_eq!(turn.bad_action, Some(false));
        match &turn.predictions[0] {
            Prediction::Api(call) => assert_eq!(call.bad_action, Some(true)),
            other => panic!("expected api prediction, got {:?}", other),
        }
        assert_eq!(metrics.bad_actions, 1);
        assert_eq!(metrics.valid_actions, 1);
        assert_eq!(metrics.success, 0);
    }

    #[test]
    fn test_re_evaluation_is_idempotent() {
        let catalog = test_catalog();
        let evaluator = Evaluator::new(&catalog);
        let mut conv = send_message_conversation();
        attach(
            &mut conv,
            1,
            vec![call("SendMessage", Some(json!({"receiver": "bob", "message": "hi"})))],
        );

        let first = evaluator.evaluate_predictions(&mut conv).unwrap();
        let snapshot = conv.clone();
        let second = evaluator.evaluate_predictions(&mut conv).unwrap();
        assert_eq!(first, second);
        assert_eq!(conv, snapshot);
    }

    #[test]
    fn test_unpredicted_conversation_rejected() {
        let catalog = test_catalog();
        let mut conv = send_message_conversation();
        assert!(Evaluator::new(&catalog).evaluate_predictions(&mut conv).is_err());
    }

    #[test]
    fn test_parameters_match_policy() {
        let expected = params(json!({"receiver": "bob", "count": 2, "note": null}));

        assert!(parameters_match(&params(json!({"receiver": " bob", "count": 2.0})), &expected));
        assert!(parameters_match(&params(json!({"receiver": "bob", "count": 2, "extra": null})), &expected));
        assert!(!parameters_match(&params(json!({"receiver": "bob"})), &expected));
        assert!(!parameters_match(&params(json!({"receiver": "bob", "count": 2, "cc": "eve"})), &expected));
        assert!(!parameters_match(&params(json!({"receiver": "Bob", "count": 2})), &expected));
        assert!(!parameters_match(&params(json!({"receiver": "bob", "count": "2"})), &expected));
    }

    #[test]
    fn test_validate_flags_unscored_prediction() {
        let mut conv = send_message_conversation();
        attach(
            &mut conv,
            1,
            vec![call("SendMessage", Some(json!({"receiver": "bob", "message": "hi"})))],
        );
        if let Turn::Api(turn) = &mut conv.conversation[1] {
            turn.matched = Some(true);
            turn.bad_action = Some(false);
        }
        conv.metrics = Some(Metrics::default());

        assert!(matches!(
            validate(&conv),
            Err(ValidationError::UnscoredPrediction { turn: 1, prediction: 0, field: "match" })
        ));
    }

    #[test]
    fn test_validate_flags_missing_predictions() {
        let conv = send_message_conversation();
        assert!(matches!(validate(&conv), Err(ValidationError::NoPredictions { turn: 1 })));
    }
}
