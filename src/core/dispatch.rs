//! Command dispatch for the advisory layer.
//!
//! A query string is classified once into one of three modes: compare both
//! strategies, simulate a single named strategy, or pass the query through
//! untouched. Simulation results are packaged as [`NarrationInput`] for the
//! external narrator, and are kept even when narration fails.

use std::future::Future;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;

use super::engine::Simulator;
use super::returns::{MarketReturns, ReturnSource, derive_seed};
use super::types::{
    ComparisonResult, FinancialProfile, SimulationConfig, SimulationParams, SimulationResult,
    ValidationError, WithdrawalStrategy,
};

pub const COMPARE_TOKEN: &str = "compare_strategies";
pub const SIMULATE_PREFIX: &str = "simulate_strategy:";

const COMPARE_QUERY: &str =
    "Please compare the fixed and dynamic withdrawal strategies based on the provided results.";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Compare,
    Simulate(WithdrawalStrategy),
    PassThrough,
}

/// Case-insensitive. The comparison token wins anywhere in the text; the
/// single-strategy form must prefix it and name a known strategy.
pub fn classify(command: &str) -> Command {
    let lowered = command.to_lowercase();
    if lowered.contains(COMPARE_TOKEN) {
        return Command::Compare;
    }

    lowered
        .strip_prefix(SIMULATE_PREFIX)
        .and_then(|rest| rest.split(':').next())
        .and_then(WithdrawalStrategy::parse)
        .map(Command::Simulate)
        .unwrap_or(Command::PassThrough)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum DispatchOutcome {
    Comparison {
        comparison: ComparisonResult,
    },
    Single {
        strategy: WithdrawalStrategy,
        label: &'static str,
        result: SimulationResult,
    },
    PassThrough {
        command: String,
    },
}

impl DispatchOutcome {
    pub fn is_simulated(&self) -> bool {
        !matches!(self, DispatchOutcome::PassThrough { .. })
    }

    /// Builds the narrator's input, rewriting the query when results are attached.
    pub fn narration_input(
        &self,
        query: &str,
        user_profile: &str,
    ) -> serde_json::Result<NarrationInput> {
        let mut input = NarrationInput {
            query: query.to_string(),
            user_profile: user_profile.to_string(),
            fixed_strategy_result: None,
            dynamic_strategy_result: None,
            single_strategy_result: None,
            strategy_type: None,
        };

        match self {
            DispatchOutcome::Comparison { comparison } => {
                input.query = COMPARE_QUERY.to_string();
                input.fixed_strategy_result = Some(serde_json::to_string_pretty(&comparison.fixed)?);
                input.dynamic_strategy_result =
                    Some(serde_json::to_string_pretty(&comparison.dynamic)?);
            }
            DispatchOutcome::Single {
                strategy,
                label,
                result,
            } => {
                input.query = format!(
                    "Please explain the results of the {} withdrawal strategy.",
                    strategy.as_str()
                );
                input.single_strategy_result = Some(serde_json::to_string_pretty(result)?);
                input.strategy_type = Some(label.to_string());
            }
            DispatchOutcome::PassThrough { .. } => {}
        }

        Ok(input)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrationInput {
    pub query: String,
    pub user_profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_strategy_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic_strategy_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_strategy_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("simulation task failed: {0}")]
    TaskFailed(String),
    #[error("failed to encode simulation result: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Error)]
#[error("narration failed: {0}")]
pub struct NarrationError(pub String);

/// The external collaborator that turns structured results into prose.
pub trait Narrator {
    fn narrate(
        &self,
        input: &NarrationInput,
    ) -> impl Future<Output = Result<String, NarrationError>> + Send;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Advice {
    pub outcome: DispatchOutcome,
    pub narration_input: NarrationInput,
    pub narration: Option<String>,
    pub narration_error: Option<String>,
}

/// Return sources for both branches drawn from one seed, so a comparison
/// sees the same market path under each strategy.
pub fn seeded_market(seed: u64, growth_rate: f64) -> impl Fn(WithdrawalStrategy) -> MarketReturns {
    move |_| MarketReturns::new(seed, growth_rate)
}

/// Return sources with one derived seed per strategy, for uncorrelated paths.
pub fn independent_market(
    seed: u64,
    growth_rate: f64,
) -> impl Fn(WithdrawalStrategy) -> MarketReturns {
    move |strategy| {
        let stream = match strategy {
            WithdrawalStrategy::Fixed => 0,
            WithdrawalStrategy::Dynamic => 1,
        };
        MarketReturns::new(derive_seed(seed, stream), growth_rate)
    }
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    simulator: Arc<Simulator>,
    params: SimulationParams,
}

impl Dispatcher {
    pub fn new(profile: FinancialProfile, config: SimulationConfig) -> Self {
        Self {
            simulator: Arc::new(Simulator::new(profile, config)),
            params: SimulationParams::default(),
        }
    }

    /// Replaces the default retirement age and withdrawal rate together.
    pub fn with_params(mut self, params: SimulationParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> SimulationParams {
        self.params
    }

    pub fn simulator(&self) -> &Simulator {
        &self.simulator
    }

    pub async fn dispatch<F, S>(
        &self,
        command: &str,
        sources: F,
    ) -> Result<DispatchOutcome, DispatchError>
    where
        F: Fn(WithdrawalStrategy) -> S,
        S: ReturnSource + Send + 'static,
    {
        match classify(command) {
            Command::Compare => {
                info!("dispatching strategy comparison");
                let comparison = self.compare(sources).await?;
                Ok(DispatchOutcome::Comparison { comparison })
            }
            Command::Simulate(strategy) => {
                info!("dispatching {} strategy simulation", strategy.as_str());
                let result = self.simulate(strategy, sources(strategy))?;
                Ok(DispatchOutcome::Single {
                    strategy,
                    label: strategy.label(),
                    result,
                })
            }
            Command::PassThrough => Ok(DispatchOutcome::PassThrough {
                command: command.to_string(),
            }),
        }
    }

    pub fn simulate<S: ReturnSource>(
        &self,
        strategy: WithdrawalStrategy,
        returns: S,
    ) -> Result<SimulationResult, ValidationError> {
        self.simulator.simulate(&self.params.request(strategy), returns)
    }

    /// Runs Fixed and Dynamic as independent blocking tasks and joins both.
    /// Dropping the returned future cancels branches that have not started;
    /// a branch already running finishes and its result is discarded.
    pub async fn compare<F, S>(&self, sources: F) -> Result<ComparisonResult, DispatchError>
    where
        F: Fn(WithdrawalStrategy) -> S,
        S: ReturnSource + Send + 'static,
    {
        let strategies = [WithdrawalStrategy::Fixed, WithdrawalStrategy::Dynamic];
        for strategy in strategies {
            self.simulator.validate(&self.params.request(strategy))?;
        }

        let mut tasks = JoinSet::new();
        for strategy in strategies {
            let simulator = Arc::clone(&self.simulator);
            let request = self.params.request(strategy);
            let returns = sources(strategy);
            tasks.spawn_blocking(move || (strategy, simulator.simulate(&request, returns)));
        }

        let mut fixed = None;
        let mut dynamic = None;
        while let Some(joined) = tasks.join_next().await {
            let (strategy, result) = joined.map_err(|e| DispatchError::TaskFailed(e.to_string()))?;
            match strategy {
                WithdrawalStrategy::Fixed => fixed = Some(result?),
                WithdrawalStrategy::Dynamic => dynamic = Some(result?),
            }
        }

        match (fixed, dynamic) {
            (Some(fixed), Some(dynamic)) => Ok(ComparisonResult { fixed, dynamic }),
            _ => Err(DispatchError::TaskFailed(
                "comparison finished without both strategy results".to_string(),
            )),
        }
    }
}

/// Dispatches the query, then hands the outcome to the narrator. Narration
/// failures are recorded on the returned [`Advice`]; the numbers survive.
pub async fn advise<F, S, N>(
    dispatcher: &Dispatcher,
    query: &str,
    user_profile: &str,
    sources: F,
    narrator: &N,
) -> Result<Advice, DispatchError>
where
    F: Fn(WithdrawalStrategy) -> S,
    S: ReturnSource + Send + 'static,
    N: Narrator,
{
    let outcome = dispatcher.dispatch(query, sources).await?;
    let narration_input = outcome.narration_input(query, user_profile)?;

    let (narration, narration_error) = match narrator.narrate(&narration_input).await {
        Ok(text) => (Some(text), None),
        Err(err) => {
            warn!("{err}; returning simulation results without narration");
            (None, Some(err.to_string()))
        }
    };

    Ok(Advice {
        outcome,
        narration_input,
        narration,
        narration_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::returns::ReturnSequence;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(FinancialProfile::default(), SimulationConfig::default())
    }

    fn mixed_path(_: WithdrawalStrategy) -> ReturnSequence {
        ReturnSequence::new(vec![0.01, 0.12, 0.05, -0.03, 0.09])
    }

    fn never_called(_: WithdrawalStrategy) -> ReturnSequence {
        panic!("no return source should be built");
    }

    struct CannedNarrator;

    impl Narrator for CannedNarrator {
        async fn narrate(&self, input: &NarrationInput) -> Result<String, NarrationError> {
            Ok(format!("narrated: {}", input.query))
        }
    }

    struct FailingNarrator;

    impl Narrator for FailingNarrator {
        async fn narrate(&self, _input: &NarrationInput) -> Result<String, NarrationError> {
            Err(NarrationError("model returned no output".to_string()))
        }
    }

    #[test]
    fn classify_recognises_the_command_vocabulary() {
        assert_eq!(classify("compare_strategies"), Command::Compare);
        assert_eq!(classify("Please COMPARE_STRATEGIES for me"), Command::Compare);
        assert_eq!(
            classify("simulate_strategy:fixed"),
            Command::Simulate(WithdrawalStrategy::Fixed)
        );
        assert_eq!(
            classify("SIMULATE_STRATEGY: Dynamic "),
            Command::Simulate(WithdrawalStrategy::Dynamic)
        );
        assert_eq!(
            classify("simulate_strategy:fixed:extra"),
            Command::Simulate(WithdrawalStrategy::Fixed)
        );
    }

    #[test]
    fn classify_passes_everything_else_through() {
        assert_eq!(classify("How much super do I need?"), Command::PassThrough);
        assert_eq!(classify("simulate_strategy:balanced"), Command::PassThrough);
        assert_eq!(classify("run simulate_strategy:fixed"), Command::PassThrough);
        assert_eq!(classify(""), Command::PassThrough);
    }

    #[test]
    fn comparison_token_takes_precedence() {
        assert_eq!(
            classify("simulate_strategy:fixed then compare_strategies"),
            Command::Compare
        );
    }

    #[tokio::test]
    async fn compare_yields_comparison_matching_independent_runs() {
        let dispatcher = dispatcher();
        let outcome = dispatcher
            .dispatch("compare_strategies", mixed_path)
            .await
            .unwrap();

        let fixed = dispatcher
            .simulate(WithdrawalStrategy::Fixed, mixed_path(WithdrawalStrategy::Fixed))
            .unwrap();
        let dynamic = dispatcher
            .simulate(WithdrawalStrategy::Dynamic, mixed_path(WithdrawalStrategy::Dynamic))
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Comparison {
                comparison: ComparisonResult { fixed, dynamic }
            }
        );
        assert_ne!(fixed.annual_payout, dynamic.annual_payout);
    }

    #[tokio::test]
    async fn seeded_comparison_is_reproducible() {
        let dispatcher = dispatcher();
        let first = dispatcher.compare(seeded_market(99, 0.07)).await.unwrap();
        let second = dispatcher.compare(seeded_market(99, 0.07)).await.unwrap();
        assert_eq!(first, second);

        let fixed = dispatcher
            .simulate(WithdrawalStrategy::Fixed, MarketReturns::new(99, 0.07))
            .unwrap();
        assert_eq!(first.fixed, fixed);
    }

    #[tokio::test]
    async fn independent_paths_draw_different_markets_per_branch() {
        let sources = independent_market(99, 0.07);
        let mut fixed = sources(WithdrawalStrategy::Fixed);
        let mut dynamic = sources(WithdrawalStrategy::Dynamic);
        let fixed_path: Vec<f64> = (0..5).map(|_| fixed.next_return()).collect();
        let dynamic_path: Vec<f64> = (0..5).map(|_| dynamic.next_return()).collect();
        assert_ne!(fixed_path, dynamic_path);

        let comparison = dispatcher()
            .compare(independent_market(99, 0.07))
            .await
            .unwrap();
        assert_eq!(comparison.fixed.years_of_payout, 20);
    }

    #[tokio::test]
    async fn single_strategy_is_tagged_with_display_label() {
        let dispatcher = dispatcher();
        let outcome = dispatcher
            .dispatch("simulate_strategy:fixed", mixed_path)
            .await
            .unwrap();

        let expected = dispatcher
            .simulate(WithdrawalStrategy::Fixed, mixed_path(WithdrawalStrategy::Fixed))
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Single {
                strategy: WithdrawalStrategy::Fixed,
                label: "Fixed",
                result: expected,
            }
        );
    }

    #[tokio::test]
    async fn other_text_runs_no_simulation() {
        let outcome = dispatcher()
            .dispatch("What is a transition to retirement pension?", never_called)
            .await
            .unwrap();
        assert!(!outcome.is_simulated());
        assert_eq!(
            outcome,
            DispatchOutcome::PassThrough {
                command: "What is a transition to retirement pension?".to_string()
            }
        );
    }

    #[tokio::test]
    async fn invalid_params_fail_before_any_task_runs() {
        let dispatcher = dispatcher().with_params(SimulationParams {
            retirement_age: 40,
            initial_withdrawal_rate: 4.0,
        });
        let err = dispatcher
            .dispatch("compare_strategies", mixed_path)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Validation(ValidationError::RetirementAgeNotAfterCurrentAge { .. })
        ));
    }

    #[tokio::test]
    async fn overridden_params_flow_into_both_branches() {
        let params = SimulationParams {
            retirement_age: 60,
            initial_withdrawal_rate: 5.0,
        };
        let dispatcher = dispatcher().with_params(params);
        let comparison = dispatcher.compare(mixed_path).await.unwrap();
        assert_eq!(comparison.fixed.years_of_payout, 25);
        assert_eq!(comparison.dynamic.years_of_payout, 25);
    }

    #[test]
    fn narration_input_rewrites_query_per_mode() {
        let result = SimulationResult {
            years_of_payout: 20,
            final_balance: 1_000.0,
            annual_payout: 50.0,
        };

        let comparison = DispatchOutcome::Comparison {
            comparison: ComparisonResult {
                fixed: result,
                dynamic: result,
            },
        }
        .narration_input("compare_strategies", "{}")
        .unwrap();
        assert_eq!(comparison.query, COMPARE_QUERY);
        assert!(comparison
            .fixed_strategy_result
            .as_deref()
            .is_some_and(|json| json.contains("\"yearsOfPayout\": 20")));
        assert!(comparison.dynamic_strategy_result.is_some());
        assert!(comparison.single_strategy_result.is_none());

        let single = DispatchOutcome::Single {
            strategy: WithdrawalStrategy::Dynamic,
            label: "Dynamic",
            result,
        }
        .narration_input("simulate_strategy:dynamic", "{}")
        .unwrap();
        assert_eq!(
            single.query,
            "Please explain the results of the dynamic withdrawal strategy."
        );
        assert_eq!(single.strategy_type.as_deref(), Some("Dynamic"));
        assert!(single.fixed_strategy_result.is_none());

        let passthrough = DispatchOutcome::PassThrough {
            command: "hello".to_string(),
        }
        .narration_input("hello", "{\"age\":46}")
        .unwrap();
        assert_eq!(passthrough.query, "hello");
        assert_eq!(passthrough.user_profile, "{\"age\":46}");
        assert!(passthrough.single_strategy_result.is_none());
    }

    #[test]
    fn outcome_serializes_with_mode_tag_and_result_field_names() {
        let outcome = DispatchOutcome::Single {
            strategy: WithdrawalStrategy::Fixed,
            label: "Fixed",
            result: SimulationResult {
                years_of_payout: 3,
                final_balance: 10.0,
                annual_payout: 2.5,
            },
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["mode"], "single");
        assert_eq!(value["strategy"], "fixed");
        assert_eq!(value["label"], "Fixed");
        assert_eq!(value["result"]["yearsOfPayout"], 3);
        assert_eq!(value["result"]["finalBalance"], 10.0);
        assert_eq!(value["result"]["annualPayout"], 2.5);
    }

    #[tokio::test]
    async fn narration_failure_keeps_simulation_results() {
        let dispatcher = dispatcher();
        let advice = advise(
            &dispatcher,
            "compare_strategies",
            "{}",
            mixed_path,
            &FailingNarrator,
        )
        .await
        .unwrap();

        assert!(advice.outcome.is_simulated());
        assert!(advice.narration.is_none());
        assert_eq!(
            advice.narration_error.as_deref(),
            Some("narration failed: model returned no output")
        );
        assert!(advice.narration_input.fixed_strategy_result.is_some());
    }

    #[tokio::test]
    async fn successful_narration_is_attached() {
        let dispatcher = dispatcher();
        let advice = advise(
            &dispatcher,
            "simulate_strategy:dynamic",
            "{}",
            mixed_path,
            &CannedNarrator,
        )
        .await
        .unwrap();

        assert_eq!(
            advice.narration.as_deref(),
            Some("narrated: Please explain the results of the dynamic withdrawal strategy.")
        );
        assert!(advice.narration_error.is_none());
    }
}
