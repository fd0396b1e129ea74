//! Fixed-point decimal arithmetic for derived gauges.
//!
//! Derived values are computed on integers and only converted to `f64` when
//! handed to the metrics backend, so repeated polls of the same inputs
//! always produce bit-identical gauge values.

use std::fmt;

/// Gas consumed by a plain value transfer.
pub const STANDARD_TRANSFER_GAS: u128 = 21_000;

/// Decimal digits kept for the transfer fee, in ETH.
pub const FEE_DECIMALS: u32 = 8;

const WEI_DECIMALS: u32 = 18;

/// A non-negative decimal with a fixed number of fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fixed {
    units: u128,
    decimals: u32,
}

impl Fixed {
    pub const fn new(units: u128, decimals: u32) -> Self {
        Self { units, decimals }
    }

    pub const fn zero(decimals: u32) -> Self {
        Self::new(0, decimals)
    }

    /// Integer count of `10^-decimals` units.
    pub fn units(&self) -> u128 {
        self.units
    }

    pub fn decimals(&self) -> u32 {
        self.decimals
    }

    /// Lossy conversion for publishing.
    pub fn to_f64(&self) -> f64 {
        self.units as f64 / 10f64.powi(self.decimals as i32)
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.decimals == 0 {
            return write!(f, "{}", self.units);
        }
        let scale = 10u128.pow(self.decimals);
        write!(
            f,
            "{}.{:0width$}",
            self.units / scale,
            self.units % scale,
            width = self.decimals as usize
        )
    }
}

/// `numerator / denominator`, rounded half up. `denominator` must be > 0.
fn div_round_half_up(numerator: u128, denominator: u128) -> u128 {
    let quotient = numerator / denominator;
    let remainder = numerator % denominator;
    if remainder >= denominator - remainder {
        quotient + 1
    } else {
        quotient
    }
}

/// Approximate cost of a standard transfer in ETH at `gas_price_wei`.
pub fn transfer_fee(gas_price_wei: u128) -> Fixed {
    let total_wei = gas_price_wei.saturating_mul(STANDARD_TRANSFER_GAS);
    let divisor = 10u128.pow(WEI_DECIMALS - FEE_DECIMALS);
    Fixed::new(div_round_half_up(total_wei, divisor), FEE_DECIMALS)
}

/// Sync progress `current / highest`, multiplied by `full` (1 for a
/// fraction, 100 for a percentage) and rounded to `precision` digits.
///
/// A node at or past its highest known block, or one that knows no blocks
/// at all, is fully synced.
pub fn sync_progress(current: u64, highest: u64, full: u64, precision: u32) -> Fixed {
    let scale = 10u128.pow(precision);
    if highest == 0 || current >= highest {
        return Fixed::new(u128::from(full) * scale, precision);
    }

    let numerator = u128::from(current) * u128::from(full) * scale;
    Fixed::new(div_round_half_up(numerator, u128::from(highest)), precision)
}
