use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::core::{
    DispatchOutcome, Dispatcher, FinancialProfile, MarketReturns, NarrationInput, PayoutYear,
    SimulationConfig, SimulationParams, SimulationRequest, SimulationResult, Simulator,
    WithdrawalStrategy, independent_market, seeded_market,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliStrategy {
    Fixed,
    Dynamic,
}

impl From<CliStrategy> for WithdrawalStrategy {
    fn from(value: CliStrategy) -> Self {
        match value {
            CliStrategy::Fixed => WithdrawalStrategy::Fixed,
            CliStrategy::Dynamic => WithdrawalStrategy::Dynamic,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "drawdown",
    about = "Retirement withdrawal projection engine (fixed vs dynamic withdrawal strategies)"
)]
pub struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Start the HTTP API
    Serve {
        #[arg(default_value_t = 8080)]
        port: u16,
    },
    /// Run one strategy and print the result as JSON
    Simulate {
        #[arg(long, value_enum)]
        strategy: CliStrategy,
        #[arg(long, help = "Include one row per payout year")]
        trace: bool,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Classify a command the way the advisory layer does and print the outcome
    Dispatch {
        command: String,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct EngineArgs {
    #[arg(long, default_value_t = 284_127.0)]
    current_savings: f64,
    #[arg(long, default_value_t = 46)]
    current_age: u32,
    #[arg(
        long,
        default_value_t = 1_500_000.0,
        help = "Retirement savings target, passed through to narration only"
    )]
    retirement_goal: f64,
    #[arg(long, help = "Retirement age; defaults to 65")]
    retirement_age: Option<u32>,
    #[arg(
        long,
        help = "Initial withdrawal rate in percent, e.g. 4; defaults to 4"
    )]
    withdrawal_rate: Option<f64>,
    #[arg(long, default_value_t = 85, help = "Age the payout horizon ends")]
    life_expectancy: u32,
    #[arg(
        long,
        default_value_t = 7.0,
        help = "Long-run annual growth assumption in percent"
    )]
    growth_rate: f64,
    #[arg(
        long,
        default_value_t = 2.0,
        help = "Dynamic strategy: returns below this percent cut the withdrawal"
    )]
    bad_year_threshold: f64,
    #[arg(
        long,
        default_value_t = 8.0,
        help = "Dynamic strategy: returns above this percent raise the withdrawal"
    )]
    good_year_threshold: f64,
    #[arg(
        long,
        default_value_t = 10.0,
        help = "Dynamic strategy: bad-year withdrawal cut in percent"
    )]
    bad_year_cut: f64,
    #[arg(
        long,
        default_value_t = 10.0,
        help = "Dynamic strategy: good-year withdrawal raise in percent"
    )]
    good_year_raise: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(
        long,
        help = "Draw a separate market path for each strategy instead of a shared one"
    )]
    independent_paths: bool,
}

#[derive(Debug, Clone)]
struct Engine {
    profile: FinancialProfile,
    config: SimulationConfig,
    retirement_age: Option<u32>,
    withdrawal_rate: Option<f64>,
    seed: u64,
    independent_paths: bool,
}

impl Engine {
    fn simulator(&self) -> Simulator {
        Simulator::new(self.profile.clone(), self.config)
    }

    fn request(&self, strategy: WithdrawalStrategy) -> SimulationRequest {
        let defaults = SimulationParams::default();
        SimulationRequest {
            retirement_age: self.retirement_age.unwrap_or(defaults.retirement_age),
            initial_withdrawal_rate: self
                .withdrawal_rate
                .unwrap_or(defaults.initial_withdrawal_rate),
            strategy,
        }
    }

    /// Dispatch defaults are only replaced when both are given.
    fn dispatch_params(&self) -> Result<SimulationParams, String> {
        match (self.retirement_age, self.withdrawal_rate) {
            (None, None) => Ok(SimulationParams::default()),
            (Some(retirement_age), Some(initial_withdrawal_rate)) => Ok(SimulationParams {
                retirement_age,
                initial_withdrawal_rate,
            }),
            _ => Err(
                "retirement age and withdrawal rate must be overridden together".to_string(),
            ),
        }
    }

    fn market(&self) -> MarketReturns {
        MarketReturns::new(self.seed, self.config.growth_rate)
    }

    async fn dispatch(&self, command: &str) -> Result<DispatchOutcome, String> {
        let dispatcher = Dispatcher::new(self.profile.clone(), self.config)
            .with_params(self.dispatch_params()?);
        let growth = self.config.growth_rate;
        let outcome = if self.independent_paths {
            dispatcher
                .dispatch(command, independent_market(self.seed, growth))
                .await
        } else {
            dispatcher
                .dispatch(command, seeded_market(self.seed, growth))
                .await
        };
        outcome.map_err(|e| e.to_string())
    }
}

fn build_engine(args: EngineArgs) -> Result<Engine, String> {
    if !args.current_savings.is_finite() || args.current_savings < 0.0 {
        return Err("--current-savings must be >= 0".to_string());
    }
    if let Some(age) = args.retirement_age {
        if age <= args.current_age {
            return Err("--retirement-age must be > --current-age".to_string());
        }
    }
    if let Some(rate) = args.withdrawal_rate {
        if !rate.is_finite() || rate <= 0.0 {
            return Err("--withdrawal-rate must be > 0".to_string());
        }
    }
    if args.growth_rate <= -100.0 {
        return Err("--growth-rate must be > -100".to_string());
    }
    if args.bad_year_threshold > args.good_year_threshold {
        return Err("--bad-year-threshold must be <= --good-year-threshold".to_string());
    }
    if !(0.0..100.0).contains(&args.bad_year_cut) {
        return Err("--bad-year-cut must be between 0 and 100".to_string());
    }
    if args.good_year_raise < 0.0 {
        return Err("--good-year-raise must be >= 0".to_string());
    }

    let engine = Engine {
        profile: FinancialProfile {
            current_savings: args.current_savings,
            current_age: args.current_age,
            retirement_goal: args.retirement_goal,
        },
        config: SimulationConfig {
            life_expectancy: args.life_expectancy,
            growth_rate: args.growth_rate / 100.0,
            bad_year_threshold: args.bad_year_threshold / 100.0,
            good_year_threshold: args.good_year_threshold / 100.0,
            bad_year_multiplier: 1.0 - args.bad_year_cut / 100.0,
            good_year_multiplier: 1.0 + args.good_year_raise / 100.0,
        },
        retirement_age: args.retirement_age,
        withdrawal_rate: args.withdrawal_rate,
        seed: args.seed,
        independent_paths: args.independent_paths,
    };
    engine.config.validate().map_err(|e| e.to_string())?;
    Ok(engine)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    strategy: WithdrawalStrategy,
    label: &'static str,
    request: SimulationRequest,
    result: SimulationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    payout_years: Option<Vec<PayoutYear>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DispatchResponse {
    outcome: DispatchOutcome,
    narration_input: NarrationInput,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn run_simulation(
    engine: &Engine,
    strategy: WithdrawalStrategy,
    trace: bool,
) -> Result<SimulateResponse, String> {
    let simulator = engine.simulator();
    let request = engine.request(strategy);
    let (result, payout_years) = if trace {
        let (result, rows) = simulator
            .simulate_with_trace(&request, engine.market())
            .map_err(|e| e.to_string())?;
        (result, Some(rows))
    } else {
        let result = simulator
            .simulate(&request, engine.market())
            .map_err(|e| e.to_string())?;
        (result, None)
    };

    Ok(SimulateResponse {
        strategy,
        label: strategy.label(),
        request,
        result,
        payout_years,
    })
}

async fn run_dispatch(
    engine: &Engine,
    command: &str,
    user_profile: Option<String>,
) -> Result<DispatchResponse, String> {
    let outcome = engine.dispatch(command).await?;
    let user_profile = match user_profile {
        Some(profile) => profile,
        None => serde_json::to_string(&engine.profile).map_err(|e| e.to_string())?,
    };
    let narration_input = outcome
        .narration_input(command, &user_profile)
        .map_err(|e| e.to_string())?;
    Ok(DispatchResponse {
        outcome,
        narration_input,
    })
}

/// Runs a parsed command line. JSON output goes to stdout.
pub async fn run_cli(cli: Cli) -> Result<(), String> {
    match cli.command {
        CliCommand::Serve { port } => run_http_server(port).await.map_err(|e| e.to_string()),
        CliCommand::Simulate {
            strategy,
            trace,
            engine,
        } => {
            let engine = build_engine(engine)?;
            let response = run_simulation(&engine, strategy.into(), trace)?;
            print_json(&response)
        }
        CliCommand::Dispatch { command, engine } => {
            let engine = build_engine(engine)?;
            let response = run_dispatch(&engine, &command, None).await?;
            print_json(&response)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{rendered}");
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SimulatePayload {
    strategy: Option<WithdrawalStrategy>,
    trace: Option<bool>,

    current_savings: Option<f64>,
    current_age: Option<u32>,
    retirement_goal: Option<f64>,
    retirement_age: Option<u32>,
    withdrawal_rate: Option<f64>,

    life_expectancy: Option<u32>,
    growth_rate: Option<f64>,
    bad_threshold: Option<f64>,
    good_threshold: Option<f64>,
    bad_cut: Option<f64>,
    good_raise: Option<f64>,
    seed: Option<u64>,
    independent_paths: Option<bool>,
}

/// Profile and assumption overrides layered over the API defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
struct EngineOverrides {
    current_savings: Option<f64>,
    current_age: Option<u32>,
    retirement_goal: Option<f64>,
    retirement_age: Option<u32>,
    withdrawal_rate: Option<f64>,

    life_expectancy: Option<u32>,
    growth_rate: Option<f64>,
    bad_threshold: Option<f64>,
    good_threshold: Option<f64>,
    bad_cut: Option<f64>,
    good_raise: Option<f64>,
    seed: Option<u64>,
    independent_paths: Option<bool>,
}

impl From<SimulatePayload> for EngineOverrides {
    fn from(payload: SimulatePayload) -> Self {
        Self {
            current_savings: payload.current_savings,
            current_age: payload.current_age,
            retirement_goal: payload.retirement_goal,
            retirement_age: payload.retirement_age,
            withdrawal_rate: payload.withdrawal_rate,
            life_expectancy: payload.life_expectancy,
            growth_rate: payload.growth_rate,
            bad_threshold: payload.bad_threshold,
            good_threshold: payload.good_threshold,
            bad_cut: payload.bad_cut,
            good_raise: payload.good_raise,
            seed: payload.seed,
            independent_paths: payload.independent_paths,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct DispatchPayload {
    command: String,
    #[serde(default)]
    user_profile: Option<serde_json::Value>,
    #[serde(default)]
    overrides: EngineOverrides,
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/health", get(health_handler))
        .route(
            "/api/simulate",
            get(simulate_get_handler).post(simulate_post_handler),
        )
        .route("/api/dispatch", post(dispatch_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!("drawdown HTTP API listening on http://{addr}");

    axum::serve(listener, app).await
}

async fn health_handler() -> Response {
    json_response(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_get_handler(Query(payload): Query<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_post_handler(Json(payload): Json<SimulatePayload>) -> Response {
    simulate_handler_impl(payload).await
}

async fn simulate_handler_impl(payload: SimulatePayload) -> Response {
    let strategy = payload.strategy.unwrap_or(WithdrawalStrategy::Fixed);
    let trace = payload.trace.unwrap_or(true);

    let engine = match engine_from_payload(payload.into()) {
        Ok(engine) => engine,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match run_simulation(&engine, strategy, trace) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

async fn dispatch_handler(Json(payload): Json<DispatchPayload>) -> Response {
    dispatch_handler_impl(payload).await
}

async fn dispatch_handler_impl(payload: DispatchPayload) -> Response {
    let user_profile = payload.user_profile.as_ref().map(|value| match value {
        serde_json::Value::String(raw) => raw.clone(),
        other => other.to_string(),
    });
    let engine = match engine_from_payload(payload.overrides) {
        Ok(engine) => engine,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    match run_dispatch(&engine, &payload.command, user_profile).await {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn engine_from_payload(payload: EngineOverrides) -> Result<Engine, String> {
    let mut args = default_args_for_api();

    if let Some(v) = payload.current_savings {
        args.current_savings = v;
    }
    if let Some(v) = payload.current_age {
        args.current_age = v;
    }
    if let Some(v) = payload.retirement_goal {
        args.retirement_goal = v;
    }
    if let Some(v) = payload.retirement_age {
        args.retirement_age = Some(v);
    }
    if let Some(v) = payload.withdrawal_rate {
        args.withdrawal_rate = Some(v);
    }

    if let Some(v) = payload.life_expectancy {
        args.life_expectancy = v;
    }
    if let Some(v) = payload.growth_rate {
        args.growth_rate = v;
    }
    if let Some(v) = payload.bad_threshold {
        args.bad_year_threshold = v;
    }
    if let Some(v) = payload.good_threshold {
        args.good_year_threshold = v;
    }
    if let Some(v) = payload.bad_cut {
        args.bad_year_cut = v;
    }
    if let Some(v) = payload.good_raise {
        args.good_year_raise = v;
    }
    if let Some(v) = payload.seed {
        args.seed = v;
    }
    if let Some(v) = payload.independent_paths {
        args.independent_paths = v;
    }

    build_engine(args)
}

fn default_args_for_api() -> EngineArgs {
    let profile = FinancialProfile::default();
    EngineArgs {
        current_savings: profile.current_savings,
        current_age: profile.current_age,
        retirement_goal: profile.retirement_goal,
        retirement_age: None,
        withdrawal_rate: None,
        life_expectancy: 85,
        growth_rate: 7.0,
        bad_year_threshold: 2.0,
        good_year_threshold: 8.0,
        bad_year_cut: 10.0,
        good_year_raise: 10.0,
        seed: 42,
        independent_paths: false,
    }
}
