//! Exact decimal-to-atomic-unit conversion.
//!
//! Legacy records store output values as decimal coin amounts ("12.345").
//! Rescaling them through floating point would corrupt balances, so the
//! conversion is integer-only and refuses inputs that do not land on a
//! whole number of atomic units.

/// Parse a non-negative decimal coin amount into atomic units.
///
/// Returns `None` for malformed input, for amounts with more fractional
/// precision than `sat_per_coin` can represent, and on overflow.
pub fn parse_decimal_amount(amount: &str, sat_per_coin: u64) -> Option<i64> {
    if sat_per_coin == 0 {
        return None;
    }

    let amount = amount.trim();
    let (integral, fraction) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };

    if integral.is_empty() && fraction.is_empty() {
        return None;
    }
    if !integral.chars().all(|c| c.is_ascii_digit())
        || !fraction.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let whole: u128 = if integral.is_empty() {
        0
    } else {
        integral.parse().ok()?
    };
    let mut sats = whole.checked_mul(u128::from(sat_per_coin))?;

    if !fraction.is_empty() {
        // frac / 10^len scaled by sat_per_coin, exact or bust.
        let frac: u128 = fraction.parse().ok()?;
        let scale = 10u128.checked_pow(u32::try_from(fraction.len()).ok()?)?;
        let scaled = frac.checked_mul(u128::from(sat_per_coin))?;
        if scaled % scale != 0 {
            return None;
        }
        sats = sats.checked_add(scaled / scale)?;
    }

    i64::try_from(sats).ok()
}
