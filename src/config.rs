use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::models::Side;

pub const DEFAULT_FACTOR: f64 = 2.5;
pub const DEFAULT_TAKE_PROFIT_PERCENT: f64 = 10.0;
pub const DEFAULT_STOP_LOSS_PERCENT: f64 = 5.0;
pub const DEFAULT_POSITION_SIZE: f64 = 1.0;

/// How many recent bars a live instance retains for inspection. Band state
/// is advanced incrementally, so this buffer never feeds recomputation.
pub const DEFAULT_LIVE_BUFFER_BARS: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Both,
    Long,
    Short,
}

impl TradeDirection {
    pub fn allows(self, side: Side) -> bool {
        match self {
            TradeDirection::Both => true,
            TradeDirection::Long => side == Side::Long,
            TradeDirection::Short => side == Side::Short,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TradeDirection::Both => "both",
            TradeDirection::Long => "long",
            TradeDirection::Short => "short",
        }
    }
}

impl FromStr for TradeDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "both" => Ok(TradeDirection::Both),
            "long" => Ok(TradeDirection::Long),
            "short" => Ok(TradeDirection::Short),
            other => Err(anyhow!("Unknown trade direction '{}'", other)),
        }
    }
}

/// Which exit wins when a bar's range touches both thresholds. Stop-loss
/// first is the conservative default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SameBarTieBreak {
    StopLossFirst,
    TakeProfitFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestConfig {
    pub take_profit_percent: f64,
    pub stop_loss_percent: f64,
    pub trade_direction: TradeDirection,
    pub position_size: f64,
    pub tie_break: SameBarTieBreak,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            take_profit_percent: DEFAULT_TAKE_PROFIT_PERCENT,
            stop_loss_percent: DEFAULT_STOP_LOSS_PERCENT,
            trade_direction: TradeDirection::Both,
            position_size: DEFAULT_POSITION_SIZE,
            tie_break: SameBarTieBreak::StopLossFirst,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        ensure_positive("takeProfitPercent", self.take_profit_percent)?;
        ensure_positive("stopLossPercent", self.stop_loss_percent)?;
        ensure_positive("positionSize", self.position_size)?;
        Ok(())
    }
}

/// Parameters for one strategy run: the indicator multiplier plus the
/// position rules applied against its signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyParams {
    pub factor: f64,
    pub backtest: BacktestConfig,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            factor: DEFAULT_FACTOR,
            backtest: BacktestConfig::default(),
        }
    }
}

impl StrategyParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        ensure_positive("factor", self.factor)?;
        self.backtest.validate()
    }
}

/// Configuration of a live strategy instance.
///
/// `close_on_stop` decides whether stopping the instance force-closes an
/// open position (reason `manual`). The default leaves the position
/// untouched, matching the backtest-observed behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveParams {
    pub strategy: StrategyParams,
    pub close_on_stop: bool,
    pub buffer_bars: usize,
}

impl Default for LiveParams {
    fn default() -> Self {
        Self {
            strategy: StrategyParams::default(),
            close_on_stop: false,
            buffer_bars: DEFAULT_LIVE_BUFFER_BARS,
        }
    }
}

impl LiveParams {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.strategy.validate()?;
        if self.buffer_bars == 0 {
            return Err(EngineError::InvalidConfig(
                "bufferBars must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn ensure_positive(name: &str, value: f64) -> Result<(), EngineError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidConfig(format!(
            "{} must be a positive number, got {}",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_validate() {
        assert!(StrategyParams::default().validate().is_ok());
        assert!(LiveParams::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_thresholds() {
        let mut params = StrategyParams::default();
        params.backtest.stop_loss_percent = 0.0;
        assert!(matches!(
            params.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        params = StrategyParams::default();
        params.factor = -1.0;
        assert!(matches!(
            params.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        params = StrategyParams::default();
        params.backtest.take_profit_percent = f64::NAN;
        assert!(matches!(
            params.validate(),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn direction_filter_parsing_and_matching() {
        assert_eq!(
            "Long".parse::<TradeDirection>().unwrap(),
            TradeDirection::Long
        );
        assert!("sideways".parse::<TradeDirection>().is_err());
        assert!(TradeDirection::Both.allows(Side::Short));
        assert!(!TradeDirection::Long.allows(Side::Short));
        assert!(TradeDirection::Short.allows(Side::Short));
    }
}
