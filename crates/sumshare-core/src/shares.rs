//! Additive share generation and summation
//!
//! Shares are plain integers rather than elements of a finite field: all but
//! the last share are uniform in `[0, bound)` and the last one corrects the
//! sum back to the secret.

use crate::{Error, Result};
use rand::Rng;

/// Draw a secret value uniformly from `[0, bound / n)`
pub fn draw_secret<R: Rng + ?Sized>(rng: &mut R, bound: i64, n: usize) -> Result<i64> {
    let n = usize_to_i64(n)?;
    let limit = bound / n.max(1);
    if limit < 1 {
        return Err(Error::InvalidConfig(format!(
            "Bound {} leaves no room for a secret with {} participants",
            bound, n
        )));
    }
    Ok(rng.gen_range(0..limit))
}

/// Split `secret` into `n` shares whose sum is exactly `secret`
///
/// The first `n - 1` shares are independent draws from `[0, bound)`; the
/// final share is `secret - Σ previous` and may be negative.
pub fn generate_shares<R: Rng + ?Sized>(
    rng: &mut R,
    bound: i64,
    secret: i64,
    n: usize,
) -> Result<Vec<i64>> {
    if n == 0 {
        return Err(Error::InvalidConfig("Cannot split into zero shares".into()));
    }
    if bound <= 0 {
        return Err(Error::InvalidConfig(format!("Share bound {} must be positive", bound)));
    }

    let mut shares = Vec::with_capacity(n);
    let mut total: i64 = 0;

    for _ in 0..n - 1 {
        let share = rng.gen_range(0..bound);
        total = total.checked_add(share).ok_or(Error::Overflow)?;
        shares.push(share);
    }

    shares.push(secret.checked_sub(total).ok_or(Error::Overflow)?);

    Ok(shares)
}

/// Sum shares without wrapping
pub fn sum_shares<'a, I>(shares: I) -> Result<i64>
where
    I: IntoIterator<Item = &'a i64>,
{
    shares
        .into_iter()
        .try_fold(0i64, |acc, share| acc.checked_add(*share))
        .ok_or(Error::Overflow)
}

fn usize_to_i64(n: usize) -> Result<i64> {
    i64::try_from(n).map_err(|_| Error::InvalidConfig(format!("Share count {} is too large", n)))
}
