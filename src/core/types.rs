use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Oldest age the simulator models, for both retirement and life expectancy.
pub const MAX_AGE: u32 = 150;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStrategy {
    #[serde(alias = "Fixed")]
    Fixed,
    #[serde(alias = "Dynamic")]
    Dynamic,
}

impl WithdrawalStrategy {
    /// Display label handed to the narration layer.
    pub fn label(self) -> &'static str {
        match self {
            WithdrawalStrategy::Fixed => "Fixed",
            WithdrawalStrategy::Dynamic => "Dynamic",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WithdrawalStrategy::Fixed => "fixed",
            WithdrawalStrategy::Dynamic => "dynamic",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "fixed" => Some(WithdrawalStrategy::Fixed),
            "dynamic" => Some(WithdrawalStrategy::Dynamic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialProfile {
    pub current_savings: f64,
    pub current_age: u32,
    /// Informational only; the engine never reads it.
    pub retirement_goal: f64,
}

impl FinancialProfile {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.current_savings.is_finite() || self.current_savings < 0.0 {
            return Err(ValidationError::InvalidSavings(self.current_savings));
        }
        Ok(())
    }
}

impl Default for FinancialProfile {
    fn default() -> Self {
        Self {
            current_savings: 284_127.0,
            current_age: 46,
            retirement_goal: 1_500_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationRequest {
    pub retirement_age: u32,
    /// Percentage, e.g. 4.0 for 4%.
    pub initial_withdrawal_rate: f64,
    pub strategy: WithdrawalStrategy,
}

impl SimulationRequest {
    pub fn validate(&self, profile: &FinancialProfile) -> Result<(), ValidationError> {
        if self.retirement_age <= profile.current_age {
            return Err(ValidationError::RetirementAgeNotAfterCurrentAge {
                retirement_age: self.retirement_age,
                current_age: profile.current_age,
            });
        }
        if self.retirement_age > MAX_AGE {
            return Err(ValidationError::AgeOutOfRange {
                field: "retirement age",
                age: self.retirement_age,
            });
        }
        if !self.initial_withdrawal_rate.is_finite() || self.initial_withdrawal_rate <= 0.0 {
            return Err(ValidationError::NonPositiveWithdrawalRate(
                self.initial_withdrawal_rate,
            ));
        }
        Ok(())
    }
}

/// Retirement age and withdrawal rate shared by every strategy run of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationParams {
    pub retirement_age: u32,
    pub initial_withdrawal_rate: f64,
}

impl SimulationParams {
    pub fn request(self, strategy: WithdrawalStrategy) -> SimulationRequest {
        SimulationRequest {
            retirement_age: self.retirement_age,
            initial_withdrawal_rate: self.initial_withdrawal_rate,
            strategy,
        }
    }
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            retirement_age: 65,
            initial_withdrawal_rate: 4.0,
        }
    }
}

/// Named assumptions for the simulator. Rates and thresholds are fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub life_expectancy: u32,
    pub growth_rate: f64,
    pub bad_year_threshold: f64,
    pub good_year_threshold: f64,
    pub bad_year_multiplier: f64,
    pub good_year_multiplier: f64,
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.life_expectancy > MAX_AGE {
            return Err(ValidationError::AgeOutOfRange {
                field: "life expectancy",
                age: self.life_expectancy,
            });
        }
        let values = [
            self.growth_rate,
            self.bad_year_threshold,
            self.good_year_threshold,
            self.bad_year_multiplier,
            self.good_year_multiplier,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::InvalidConfig(
                "assumptions must be finite".to_string(),
            ));
        }
        if self.growth_rate <= -1.0 {
            return Err(ValidationError::InvalidConfig(
                "growth rate must be > -100%".to_string(),
            ));
        }
        if self.bad_year_threshold > self.good_year_threshold {
            return Err(ValidationError::InvalidConfig(
                "bad-year threshold must be <= good-year threshold".to_string(),
            ));
        }
        if self.bad_year_multiplier <= 0.0 || self.good_year_multiplier <= 0.0 {
            return Err(ValidationError::InvalidConfig(
                "withdrawal multipliers must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            life_expectancy: 85,
            growth_rate: 0.07,
            bad_year_threshold: 0.02,
            good_year_threshold: 0.08,
            bad_year_multiplier: 0.9,
            good_year_multiplier: 1.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub years_of_payout: u32,
    pub final_balance: f64,
    pub annual_payout: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    pub fixed: SimulationResult,
    pub dynamic: SimulationResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutYear {
    pub year: u32,
    pub age: u32,
    pub market_return: f64,
    pub withdrawal_rate: f64,
    pub withdrawn: f64,
    pub end_balance: f64,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("retirement age {retirement_age} must be greater than current age {current_age}")]
    RetirementAgeNotAfterCurrentAge { retirement_age: u32, current_age: u32 },
    #[error("initial withdrawal rate must be > 0, got {0}")]
    NonPositiveWithdrawalRate(f64),
    #[error("current savings must be a non-negative amount, got {0}")]
    InvalidSavings(f64),
    #[error("invalid simulation config: {0}")]
    InvalidConfig(String),
    #[error("{field} must be at most {max}, got {age}", max = MAX_AGE)]
    AgeOutOfRange { field: &'static str, age: u32 },
    #[error("portfolio balance overflows at age {age}")]
    BalanceOverflow { age: u32 },
}
