//! Instrument contract model.
//!
//! Pure conversions between USD notional, instrument size and price. Linear
//! (base-asset sized) instruments use `contract_value = 1` and
//! `contract_multiplier = 1`; contract-sized swaps carry the exchange's
//! per-contract value and multiplier.

use crate::domain::error::LedgerError;
use crate::domain::order::Direction;

const STEP_EPSILON: f64 = 1e-9;
const SIZE_DECIMALS: f64 = 1e12;

#[derive(Debug, Clone, PartialEq)]
pub struct ContractSpec {
    pub min_size: f64,
    pub size_step: f64,
    pub contract_value: f64,
    pub contract_multiplier: f64,
    pub max_leverage: f64,
    /// Taker fee charged on notional, e.g. `0.0005` for 5 bps.
    pub fee_rate: f64,
}

impl ContractSpec {
    /// Spec for an instrument sized in the base asset.
    pub fn linear(min_size: f64, size_step: f64, max_leverage: f64, fee_rate: f64) -> Self {
        ContractSpec {
            min_size,
            size_step,
            contract_value: 1.0,
            contract_multiplier: 1.0,
            max_leverage,
            fee_rate,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        let positive = [
            ("min_size", self.min_size),
            ("size_step", self.size_step),
            ("contract_value", self.contract_value),
            ("contract_multiplier", self.contract_multiplier),
            ("max_leverage", self.max_leverage),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(LedgerError::Configuration {
                    reason: format!("{name} must be positive, got {value}"),
                });
            }
        }
        if self.max_leverage < 1.0 {
            return Err(LedgerError::Configuration {
                reason: format!("max_leverage must be at least 1, got {}", self.max_leverage),
            });
        }
        if !self.fee_rate.is_finite() || self.fee_rate < 0.0 {
            return Err(LedgerError::Configuration {
                reason: format!("fee_rate must be non-negative, got {}", self.fee_rate),
            });
        }
        Ok(())
    }

    /// USD value of one unit of size at `price`.
    pub fn unit_value(&self, price: f64) -> f64 {
        price * self.contract_value * self.contract_multiplier
    }

    pub fn notional(&self, size: f64, price: f64) -> f64 {
        size * self.unit_value(price)
    }

    /// Unrounded size worth `usd` at `price`.
    pub fn size_for_usd(&self, usd: f64, price: f64) -> f64 {
        let unit = self.unit_value(price);
        if unit <= 0.0 {
            return 0.0;
        }
        usd / unit
    }

    pub fn round_down_to_step(&self, size: f64) -> f64 {
        if size <= 0.0 {
            return 0.0;
        }
        let steps = (size / self.size_step + STEP_EPSILON).floor();
        (steps * self.size_step * SIZE_DECIMALS).round() / SIZE_DECIMALS
    }

    /// Size an order worth `usd` would have, rounded down to the size step.
    /// `None` when the result is below the instrument minimum.
    pub fn tradeable_size(&self, usd: f64, price: f64) -> Option<f64> {
        let size = self.round_down_to_step(self.size_for_usd(usd, price));
        if size + STEP_EPSILON < self.min_size {
            None
        } else {
            Some(size)
        }
    }

    /// Signed fee (negative is a cost) for trading `notional` USD.
    pub fn fee(&self, notional: f64) -> f64 {
        -(notional.abs() * self.fee_rate)
    }

    pub fn gross_pnl(&self, direction: Direction, entry: f64, exit: f64, size: f64) -> f64 {
        let entry_value = self.notional(size, entry);
        let exit_value = self.notional(size, exit);
        match direction {
            Direction::Long => exit_value - entry_value,
            Direction::Short => entry_value - exit_value,
        }
    }

    /// Exit price at which `size` entered at `entry` yields a gross `pnl`.
    pub fn price_for_pnl(&self, direction: Direction, entry: f64, pnl: f64, size: f64) -> f64 {
        let per_price = size * self.contract_value * self.contract_multiplier;
        if per_price <= 0.0 {
            return entry;
        }
        let entry_value = entry * per_price;
        let exit_value = match direction {
            Direction::Long => entry_value + pnl,
            Direction::Short => entry_value - pnl,
        };
        exit_value / per_price
    }

    pub fn clamp_leverage(&self, leverage: f64) -> f64 {
        leverage.min(self.max_leverage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn xrp_swap() -> ContractSpec {
        ContractSpec {
            min_size: 1.0,
            size_step: 1.0,
            contract_value: 100.0,
            contract_multiplier: 1.0,
            max_leverage: 75.0,
            fee_rate: 0.0005,
        }
    }

    #[test]
    fn validate_accepts_sane_spec() {
        assert!(xrp_swap().validate().is_ok());
        assert!(ContractSpec::linear(0.001, 0.001, 100.0, 0.00055).validate().is_ok());
    }

    #[test]
    fn validate_rejects_non_positive_fields() {
        let spec = ContractSpec {
            size_step: 0.0,
            ..xrp_swap()
        };
        assert!(matches!(
            spec.validate(),
            Err(LedgerError::Configuration { .. })
        ));

        let spec = ContractSpec {
            contract_value: -1.0,
            ..xrp_swap()
        };
        assert!(spec.validate().is_err());

        let spec = ContractSpec {
            fee_rate: -0.1,
            ..xrp_swap()
        };
        assert!(spec.validate().is_err());

        let spec = ContractSpec {
            max_leverage: 0.5,
            ..xrp_swap()
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn unit_value_includes_contract_value_and_multiplier() {
        let spec = ContractSpec {
            contract_multiplier: 2.0,
            ..xrp_swap()
        };
        assert_relative_eq!(spec.unit_value(0.5), 100.0);
    }

    #[test]
    fn tradeable_size_rounds_down_to_whole_contracts() {
        // 45 USD at 5x on XRP-USDT-SWAP is 4.48 contracts
        let size = xrp_swap().tradeable_size(45.0 * 5.0, 0.50172);
        assert_eq!(size, Some(4.0));
    }

    #[test]
    fn tradeable_size_below_minimum_is_none() {
        assert_eq!(xrp_swap().tradeable_size(10.0, 0.50172), None);
    }

    #[test]
    fn fractional_step_rounding() {
        let spec = ContractSpec::linear(0.01, 0.01, 50.0, 0.00055);
        assert_relative_eq!(spec.round_down_to_step(1.23999), 1.23);
        assert_relative_eq!(spec.round_down_to_step(0.3), 0.3);
        assert_relative_eq!(spec.round_down_to_step(-1.0), 0.0);
    }

    #[test]
    fn step_rounding_tolerates_float_noise() {
        let spec = ContractSpec::linear(0.1, 0.1, 50.0, 0.0);
        // 0.7 / 0.1 is 6.999999999999999 in binary
        assert_relative_eq!(spec.round_down_to_step(0.7), 0.7);
    }

    #[test]
    fn fee_is_negative_cost() {
        assert_relative_eq!(xrp_swap().fee(200.688), -0.100344, epsilon = 1e-12);
    }

    #[test]
    fn gross_pnl_long_and_short() {
        let spec = xrp_swap();
        assert_relative_eq!(
            spec.gross_pnl(Direction::Long, 0.501738, 0.50174, 6.0),
            0.0012,
            epsilon = 1e-9
        );
        assert_relative_eq!(
            spec.gross_pnl(Direction::Short, 0.501738, 0.50174, 6.0),
            -0.0012,
            epsilon = 1e-9
        );
    }

    #[test]
    fn price_for_pnl_inverts_gross_pnl() {
        let spec = xrp_swap();
        let price = spec.price_for_pnl(Direction::Long, 0.5, 10.0, 4.0);
        assert_relative_eq!(spec.gross_pnl(Direction::Long, 0.5, price, 4.0), 10.0, epsilon = 1e-9);
        let price = spec.price_for_pnl(Direction::Short, 0.5, 10.0, 4.0);
        assert_relative_eq!(price, 0.475, epsilon = 1e-12);
    }

    #[test]
    fn clamp_leverage_to_instrument_max() {
        assert_relative_eq!(xrp_swap().clamp_leverage(120.0), 75.0);
        assert_relative_eq!(xrp_swap().clamp_leverage(10.0), 10.0);
    }
}
