mod dispatch;
mod engine;
mod returns;
mod types;

pub use dispatch::{
    Advice, COMPARE_TOKEN, Command, DispatchError, DispatchOutcome, Dispatcher, NarrationError,
    NarrationInput, Narrator, SIMULATE_PREFIX, advise, classify, independent_market, seeded_market,
};
pub use engine::{
    Simulator, YearStep, advance_year, effective_withdrawal_rate, payout_years,
    project_retirement_balance,
};
pub use returns::{ConstantReturn, MarketReturns, ReturnSequence, ReturnSource, derive_seed};
pub use types::{
    ComparisonResult, FinancialProfile, MAX_AGE, PayoutYear, SimulationConfig, SimulationParams,
    SimulationRequest, SimulationResult, ValidationError, WithdrawalStrategy,
};
