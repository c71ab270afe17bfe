//! Integer-only decimal to `f32` conversion for the point-cloud input format.
//!
//! Every coordinate in the input has exactly one integer digit, so its
//! magnitude is below 10 and its binary exponent is fixed by that digit alone
//! (`[1,2)`, `[2,4)`, `[4,8)` or `[8,10)`). The parser exploits this: the
//! digits are accumulated into a `u64`, the powers of ten are removed by
//! dividing by five (the powers of two are free, they only move the exponent)
//! and the top 24 bits of the renormalized accumulator become the mantissa.
//!
//! The last mantissa bit may be one below what `str::parse::<f32>` returns,
//! because every division truncates instead of rounding.
//!
//! ```text
//!   "-7.25e-2"
//!    │ │  │ └── exponent, must be <= 0
//!    │ │  └──── up to 17 fractional digits are kept, the rest are skipped
//!    │ └─────── mandatory decimal point
//!    └───────── optional sign, then exactly one digit
//! ```

use crate::cell::Point;
use crate::error::{ParseError, ParseErrorKind};

/// Fractional digits folded into the accumulator. 1 + 17 digits fit in 60 bits.
const MAX_DECIMALS: u32 = 17;

/// Renormalize the accumulator every this many divisions by five.
const RENORMALIZE_EVERY: u32 = 16;

/// Below this decimal exponent every literal underflows `f32`.
const MIN_EXP10: i32 = -64;

/// Binary exponent of a value in `[d, d + 1)` indexed by its first digit `d`.
/// Index 0 is never used: zero is handled before the lookup.
const FIRST_DIGIT_EXP2: [i32; 10] = [0, 0, 1, 1, 2, 2, 2, 2, 3, 3];

const F32_EXP_BIAS: i32 = 127;
const F32_MANTISSA_MASK: u32 = 0x7F_FFFF;

#[inline(always)]
fn peek(input: &[u8], pos: usize) -> u8 {
    // Past the end reads as NUL, which is never a digit, sign or separator.
    input.get(pos).copied().unwrap_or(0)
}

#[inline(always)]
fn signed_zero(negative: bool) -> f32 {
    if negative { -0.0 } else { 0.0 }
}

/// Number of decimal digits in `n` (at least 1).
#[inline]
fn decimal_len(mut n: u64) -> u32 {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

/// Divide `mantissa` by `5^count`, shifting left every [`RENORMALIZE_EVERY`]
/// steps so the quotient keeps at least 26 significant bits.
///
/// Returns the quotient and the sum of the shifts applied *after* the first
/// one. The first shift only normalizes the input and carries no exponent
/// information.
#[inline]
fn divide_by_pow5(mut mantissa: u64, count: u32) -> (u64, u32) {
    let mut shifted = 0;
    for step in 0..count {
        if step % RENORMALIZE_EVERY == 0 {
            let lz = mantissa.leading_zeros();
            mantissa <<= lz;
            if step != 0 {
                shifted += lz;
            }
        }
        mantissa /= 5;
    }
    (mantissa, shifted)
}

/// Parse the exponent digits starting at `pos` (just after `e`/`E`).
fn parse_exponent(input: &[u8], mut pos: usize) -> Result<(i32, usize), ParseError> {
    let marker = pos - 1;
    let negative = match peek(input, pos) {
        b'-' => {
            pos += 1;
            true
        }
        b'+' => {
            pos += 1;
            false
        }
        _ => false,
    };
    if !peek(input, pos).is_ascii_digit() {
        return Err(ParseError::new(marker, ParseErrorKind::BadExponent));
    }
    let mut value: i32 = 0;
    while peek(input, pos).is_ascii_digit() {
        // Saturate; anything past a few dozen underflows anyway.
        value = value
            .saturating_mul(10)
            .saturating_add((peek(input, pos) - b'0') as i32);
        pos += 1;
    }
    Ok((if negative { -value } else { value }, pos))
}

/// Parse one literal `[-]D.DDD[(e|E)[+|-]X]` starting at `pos`.
///
/// Returns the value and the position of the first byte after the literal.
/// Error offsets are relative to `input`.
pub fn parse_f32(input: &[u8], pos: usize) -> Result<(f32, usize), ParseError> {
    let start = pos;
    let mut pos = pos;

    let negative = peek(input, pos) == b'-';
    if negative {
        pos += 1;
    }

    let lead = peek(input, pos);
    if !lead.is_ascii_digit() {
        return Err(ParseError::new(pos, ParseErrorKind::MissingDigit));
    }
    let mut num = (lead - b'0') as u64;
    pos += 1;

    if peek(input, pos) != b'.' {
        return Err(ParseError::new(pos, ParseErrorKind::MissingDecimalPoint));
    }
    pos += 1;

    let mut decimals = 0;
    while decimals < MAX_DECIMALS && peek(input, pos).is_ascii_digit() {
        num = num * 10 + (peek(input, pos) - b'0') as u64;
        decimals += 1;
        pos += 1;
    }
    while peek(input, pos).is_ascii_digit() {
        pos += 1;
    }

    let mut exp10 = 0;
    if matches!(peek(input, pos), b'e' | b'E') {
        let (exp, next) = parse_exponent(input, pos + 1)?;
        exp10 = exp;
        pos = next;
    }

    if num == 0 {
        return Ok((signed_zero(negative), pos));
    }
    if exp10 > 0 {
        return Err(ParseError::new(start, ParseErrorKind::PositiveExponent));
    }

    // "0.00123" is 1.23e-3: leading zeros only move the decimal exponent.
    let digits = decimal_len(num);
    let leading_zeros = decimals + 1 - digits;
    exp10 = exp10.saturating_sub(leading_zeros as i32);
    let fraction_digits = decimals - leading_zeros;
    if exp10 < MIN_EXP10 {
        return Ok((signed_zero(negative), pos));
    }

    let first_digit = (num / 10u64.pow(digits - 1)) as usize;
    let mut exp2 = FIRST_DIGIT_EXP2[first_digit];

    // num / 10^k has the mantissa bits of num / 5^k.
    let (mut mantissa, _) = divide_by_pow5(num, fraction_digits);

    if exp10 < 0 {
        // Reference point: the normalized accumulator has exponent `exp2`.
        // Dividing by 5^k drops the exponent by the total shift needed to
        // renormalize, and the matching 2^k comes straight off the exponent.
        let (quotient, shifted) = divide_by_pow5(mantissa, exp10.unsigned_abs());
        mantissa = quotient;
        exp2 += exp10 - shifted as i32 - mantissa.leading_zeros() as i32;
    }

    mantissa <<= mantissa.leading_zeros();
    let fraction = (mantissa >> 40) as u32 & F32_MANTISSA_MASK;

    let biased = exp2 + F32_EXP_BIAS;
    if biased <= 0 {
        // Subnormal range; coordinates that small are zero for our purposes.
        return Ok((signed_zero(negative), pos));
    }

    let bits = ((negative as u32) << 31) | ((biased as u32) << 23) | fraction;
    Ok((f32::from_bits(bits), pos))
}

/// Parse one `x y z` record starting at `pos`.
///
/// Returns the point and the position after the record's newline (or the end
/// of input for a final record without one).
pub fn parse_record(input: &[u8], pos: usize) -> Result<(Point, usize), ParseError> {
    let (x, pos) = parse_f32(input, pos)?;
    let pos = expect_space(input, pos)?;
    let (y, pos) = parse_f32(input, pos)?;
    let pos = expect_space(input, pos)?;
    let (z, mut pos) = parse_f32(input, pos)?;

    if peek(input, pos) == b'\r' {
        pos += 1;
    }
    match input.get(pos) {
        None => {}
        Some(b'\n') => pos += 1,
        Some(_) => return Err(ParseError::new(pos, ParseErrorKind::TrailingInput)),
    }
    Ok((Point::new(x, y, z), pos))
}

#[inline(always)]
fn expect_space(input: &[u8], pos: usize) -> Result<usize, ParseError> {
    if peek(input, pos) == b' ' {
        Ok(pos + 1)
    } else {
        Err(ParseError::new(pos, ParseErrorKind::MissingSeparator))
    }
}

/// Iterator over the records of a newline-aligned byte range.
///
/// Stops after the first error. Error offsets are relative to the slice.
pub struct Records<'a> {
    input: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Records<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            failed: false,
        }
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Point, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.input.len() {
            return None;
        }
        match parse_record(self.input, self.pos) {
            Ok((point, next)) => {
                self.pos = next;
                Some(Ok(point))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse a whole buffer into a flat point list.
pub fn parse_points(input: &[u8]) -> Result<Vec<Point>, ParseError> {
    Records::new(input).collect()
}
