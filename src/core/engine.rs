use log::debug;

use super::returns::ReturnSource;
use super::types::{
    FinancialProfile, PayoutYear, SimulationConfig, SimulationRequest, SimulationResult,
    ValidationError, WithdrawalStrategy,
};

/// Portfolio state after one payout year.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YearStep {
    pub balance: f64,
    pub withdrawn: f64,
    pub depleted: bool,
}

/// Withdraws `balance * withdrawal_rate`, then grows what is left by
/// `1 + market_return`. A withdrawal that meets or exceeds the balance takes
/// everything and ends the run.
pub fn advance_year(balance: f64, withdrawal_rate: f64, market_return: f64) -> YearStep {
    let balance = balance.max(0.0);
    let requested = balance * withdrawal_rate;

    if requested >= balance {
        return YearStep {
            balance: 0.0,
            withdrawn: balance,
            depleted: true,
        };
    }

    let grown = (balance - requested) * (1.0 + market_return);
    if grown <= 0.0 {
        return YearStep {
            balance: 0.0,
            withdrawn: requested,
            depleted: true,
        };
    }

    YearStep {
        balance: grown,
        withdrawn: requested,
        depleted: false,
    }
}

/// Compounds current savings at the long-run growth rate up to retirement.
/// No contributions or withdrawals happen before retirement.
pub fn project_retirement_balance(
    profile: &FinancialProfile,
    config: &SimulationConfig,
    retirement_age: u32,
) -> f64 {
    let years = retirement_age.saturating_sub(profile.current_age);
    profile.current_savings * (1.0 + config.growth_rate).powi(years as i32)
}

/// Years between retirement and life expectancy. Zero or negative means there
/// is nothing to pay out.
pub fn payout_years(config: &SimulationConfig, retirement_age: u32) -> i64 {
    config.life_expectancy as i64 - retirement_age as i64
}

/// Withdrawal rate for one year. Dynamic adjustments always start from the
/// base rate; they never compound across years.
pub fn effective_withdrawal_rate(
    strategy: WithdrawalStrategy,
    base_rate: f64,
    market_return: f64,
    config: &SimulationConfig,
) -> f64 {
    match strategy {
        WithdrawalStrategy::Fixed => base_rate,
        WithdrawalStrategy::Dynamic => {
            if market_return < config.bad_year_threshold {
                base_rate * config.bad_year_multiplier
            } else if market_return > config.good_year_threshold {
                base_rate * config.good_year_multiplier
            } else {
                base_rate
            }
        }
    }
}

/// Runs payout horizons for one financial profile under fixed assumptions.
#[derive(Debug, Clone)]
pub struct Simulator {
    profile: FinancialProfile,
    config: SimulationConfig,
}

impl Simulator {
    pub fn new(profile: FinancialProfile, config: SimulationConfig) -> Self {
        Self { profile, config }
    }

    pub fn profile(&self) -> &FinancialProfile {
        &self.profile
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn validate(&self, request: &SimulationRequest) -> Result<(), ValidationError> {
        self.profile.validate()?;
        self.config.validate()?;
        request.validate(&self.profile)?;
        let projected =
            project_retirement_balance(&self.profile, &self.config, request.retirement_age);
        if !projected.is_finite() {
            return Err(ValidationError::BalanceOverflow {
                age: request.retirement_age,
            });
        }
        Ok(())
    }

    pub fn simulate<S: ReturnSource>(
        &self,
        request: &SimulationRequest,
        returns: S,
    ) -> Result<SimulationResult, ValidationError> {
        self.validate(request)?;
        self.run_payout(request, returns, None)
    }

    /// Same as [`Simulator::simulate`], also returning one row per completed year.
    pub fn simulate_with_trace<S: ReturnSource>(
        &self,
        request: &SimulationRequest,
        returns: S,
    ) -> Result<(SimulationResult, Vec<PayoutYear>), ValidationError> {
        self.validate(request)?;
        let mut trace = Vec::new();
        let result = self.run_payout(request, returns, Some(&mut trace))?;
        Ok((result, trace))
    }

    fn run_payout<S: ReturnSource>(
        &self,
        request: &SimulationRequest,
        mut returns: S,
        mut trace: Option<&mut Vec<PayoutYear>>,
    ) -> Result<SimulationResult, ValidationError> {
        let retirement_balance =
            project_retirement_balance(&self.profile, &self.config, request.retirement_age);
        let horizon = payout_years(&self.config, request.retirement_age);
        if horizon <= 0 {
            debug!(
                "retirement age {} is at or past life expectancy {}; no payout years",
                request.retirement_age, self.config.life_expectancy
            );
            return Ok(SimulationResult {
                years_of_payout: 0,
                final_balance: retirement_balance,
                annual_payout: 0.0,
            });
        }
        let horizon = horizon as u32;

        let base_rate = request.initial_withdrawal_rate / 100.0;
        let mut balance = retirement_balance;
        let mut total_withdrawn = 0.0;
        let mut years_completed = 0_u32;

        for year in 1..=horizon {
            let market_return = returns.next_return();
            let rate =
                effective_withdrawal_rate(request.strategy, base_rate, market_return, &self.config);
            let step = advance_year(balance, rate, market_return);
            if !step.balance.is_finite() || !(total_withdrawn + step.withdrawn).is_finite() {
                return Err(ValidationError::BalanceOverflow {
                    age: request.retirement_age + year - 1,
                });
            }

            balance = step.balance;
            total_withdrawn += step.withdrawn;
            years_completed = year;

            if let Some(rows) = trace.as_deref_mut() {
                rows.push(PayoutYear {
                    year,
                    age: request.retirement_age + year - 1,
                    market_return,
                    withdrawal_rate: rate,
                    withdrawn: step.withdrawn,
                    end_balance: step.balance,
                });
            }

            if step.depleted {
                break;
            }
        }

        let annual_payout = if years_completed == 0 {
            0.0
        } else {
            total_withdrawn / years_completed as f64
        };

        debug!(
            "{} strategy: {years_completed}/{horizon} payout years, final balance {balance:.2}",
            request.strategy.as_str()
        );

        Ok(SimulationResult {
            years_of_payout: years_completed,
            final_balance: balance.max(0.0),
            annual_payout,
        })
    }
}
