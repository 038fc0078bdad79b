//! Per-bucket parameter optimization
//!
//! Derives the optimal bucket capacity `k`, lookup parallelism `alpha`,
//! and response quorum `beta` for each bucket from the globally observed
//! STORE arrival rate and entry-exchange probability. The closed forms
//! come out of the KadRTT cost model and are evaluated with the Lambert W
//! principal branch.
//!
//! All results are clamped to their contractual ranges before use:
//! `k >= max(bucket_size, 2)`, `beta in [1, k]`, `alpha in [2, pool_size]`
//! (with `alpha = 2` winning when the pool is smaller than 2). A
//! non-finite intermediate, which the Lambert W evaluation signals with
//! NaN, falls to the same clamps.

use crate::bucket::Bucket;
use crate::lambertw::lambert_w;
use std::f64::consts::E;

/// Optimal capacity for the bucket at `bucket_index`
///
/// `v = prob_exchange * arv_rate_store` feeds
/// `k_opt = floor(-W0(-2^(r+1) * e^(-v) * ln v) / ln v)` with `r` the
/// 0-based bucket index, floored at 2 and at the configured bucket size.
pub(crate) fn k_opt(
    bucket_index: usize,
    arv_rate_store: f64,
    prob_exchange: f64,
    bucket_size: usize,
) -> usize {
    let r = bucket_index + 1;
    let v = prob_exchange * arv_rate_store;
    let w1 = -2f64.powi(r as i32) * E.powf(-v);
    let numerator = lambert_w(0, w1 * v.ln());
    let denominator = v.ln();

    let raw = (-numerator / denominator).floor();
    let k = if raw.is_finite() { raw.max(1.0) as usize } else { 1 };
    // A table configured with single-entry buckets keeps them single-entry;
    // the usual floor of 2 would make the direct RTT swap unreachable.
    let floor = if bucket_size <= 1 { 1 } else { bucket_size.max(2) };
    k.max(floor)
}

/// Optimal response quorum given the bucket capacity
pub(crate) fn beta_opt(k: usize, pool_size: usize) -> usize {
    let beta = k.min(pool_size);
    if beta < 1 { k } else { beta }
}

/// Optimal lookup parallelism for `bucket`
///
/// Chains the query probability through the bucket sequence: a lookup
/// reaches bucket `r` only if every earlier bucket failed to answer, so
/// `pro = p_not_prev * (1 - 1/k_prev)` (1 for the first bucket), and the
/// per-lookup hit probability is `p_query = pro / k`. Stores the updated
/// `p_query` / `p_not` on the bucket as a side effect.
///
/// `prev` carries `(p_not, k)` of the preceding bucket; `None` for bucket 0.
pub(crate) fn alpha_opt(bucket: &mut Bucket, prev: Option<(f64, usize)>, pool_size: usize) -> usize {
    let k = bucket.k as f64;
    let pro = match prev {
        Some((p_not_prev, k_prev)) => p_not_prev * (1.0 - 1.0 / k_prev as f64),
        None => 1.0,
    };
    let p_query = pro / k;
    let p_not = 1.0 - p_query;
    bucket.p_query = p_query;
    bucket.p_not = p_not;

    let beta = bucket.beta as f64;
    let pool = pool_size as f64;
    let ln_p = p_not.ln();
    let kb = pool * beta;

    let numer = beta * k * pool * ln_p;
    let w1 = lambert_w(
        0,
        -pool * p_not.powf(kb + kb / (1.0 - p_not.powf(kb))) * beta * ln_p / (p_not.powf(kb) - 1.0),
    );
    let w2 = beta * pool * ln_p / (1.0 - p_not.powf(kb));
    let alpha = (numer / (w1 - w2)).abs().ceil();

    clamp_alpha(alpha, pool_size)
}

/// Clamp a derived parallelism into `[2, pool_size]`
///
/// The upper bound is applied first, so a degenerate pool (< 2) still
/// yields the hard floor of 2 concurrent queries. Non-finite values fall
/// straight to the floor.
fn clamp_alpha(alpha: f64, pool_size: usize) -> usize {
    if !alpha.is_finite() {
        return 2;
    }
    let capped = (alpha as usize).min(pool_size);
    capped.max(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k_opt_respects_floors() {
        // Degenerate rates push the formula to NaN territory; the clamps
        // must still produce a usable capacity.
        assert!(k_opt(0, 0.0, 0.0, 20) >= 20);
        assert!(k_opt(0, 0.01, 1.0, 20) >= 20);
        assert!(k_opt(3, 0.01, 1.0, 2) >= 2);
    }

    #[test]
    fn test_k_opt_grows_with_bucket_index() {
        // Deeper buckets see exponentially more of the keyspace; the
        // derived capacity is non-decreasing in the bucket index.
        let k_shallow = k_opt(0, 0.5, 0.5, 2);
        let k_deep = k_opt(8, 0.5, 0.5, 2);
        assert!(k_deep >= k_shallow);
    }

    #[test]
    fn test_beta_opt_bounds() {
        assert_eq!(beta_opt(20, 10), 10);
        assert_eq!(beta_opt(5, 20), 5);
        assert_eq!(beta_opt(5, 0), 5);
    }

    #[test]
    fn test_alpha_opt_within_contract() {
        let mut bucket = Bucket::new(20);
        bucket.beta = 20;
        let alpha = alpha_opt(&mut bucket, None, 20);
        assert!((2..=20).contains(&alpha));
        assert!(bucket.p_not > 0.0 && bucket.p_not < 1.0);
        assert!((bucket.p_query - 1.0 / 20.0).abs() < 1e-12);
    }

    #[test]
    fn test_alpha_opt_chains_previous_bucket() {
        let mut b0 = Bucket::new(16);
        b0.beta = 16;
        alpha_opt(&mut b0, None, 16);

        let mut b1 = Bucket::new(16);
        b1.beta = 16;
        alpha_opt(&mut b1, Some((b0.p_not, b0.k)), 16);

        // The chained bucket is queried less often than the first.
        assert!(b1.p_query < b0.p_query);
        assert!(b1.p_not > 0.0 && b1.p_not < 1.0);
    }

    #[test]
    fn test_alpha_clamp_handles_tiny_pool() {
        let mut bucket = Bucket::new(2);
        bucket.beta = 2;
        let alpha = alpha_opt(&mut bucket, None, 1);
        assert_eq!(alpha, 2);
    }
}
