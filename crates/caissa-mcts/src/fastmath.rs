// ---------------------------------------------------------------------------
// Fast transcendental approximations
// ---------------------------------------------------------------------------
//
// The beta re-backup and RENTS paths call these once per child per update,
// so the cheap exponent-field approximations are used instead of libm. All
// of them trade roughly two decimal digits of precision for a handful of
// integer ops.

const EXP2_SCALE: f32 = (1u32 << 23) as f32;
const EXP2_BIAS: f32 = 127.0;

/// Base-2 exponential via direct construction of the IEEE-754 exponent
/// field, with the fraction linearly interpolating the mantissa.
pub fn fast_exp2(x: f32) -> f32 {
    let x = x.clamp(-126.0, 126.0);
    f32::from_bits(((x + EXP2_BIAS) * EXP2_SCALE) as u32)
}

pub fn fast_exp(x: f32) -> f32 {
    fast_exp2(x * std::f32::consts::LOG2_E)
}

/// Base-2 logarithm, inverse construction of `fast_exp2`. Requires a
/// finite positive input.
pub fn fast_log2(x: f32) -> f32 {
    debug_assert!(x > 0.0, "fast_log2 needs a positive input, got {x}");
    x.to_bits() as f32 / EXP2_SCALE - EXP2_BIAS
}

/// `base.powf(exp)` for positive bases.
pub fn fast_pow(base: f32, exp: f32) -> f32 {
    fast_exp2(exp * fast_log2(base))
}

/// Logistic approximation of the error function. The slope constant
/// matches erf at the origin through the classic sigmoid fit of the
/// normal CDF.
pub fn erf_logistic(x: f32) -> f32 {
    const K: f32 = 2.4069519;
    2.0 / (1.0 + fast_exp(-K * x)) - 1.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
