use chrono::Duration;
use thiserror::Error;

/// Failure to interpret a TTL annotation value.
///
/// The message is the bare detail; callers prepend their own context
/// (e.g. the `lease-status` annotation says `Invalid TTL: <detail>`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvalidDuration(pub String);

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Largest denominator we track for fractional digits. Anything past this
/// is below nanosecond resolution for every supported unit.
const MAX_FRACTION_DENOMINATOR: u128 = 1_000_000_000_000_000_000;

fn unit_nanos(unit: &str) -> Option<u128> {
    Some(match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => NANOS_PER_SEC,
        "m" => 60 * NANOS_PER_SEC,
        "h" => 3_600 * NANOS_PER_SEC,
        "d" => 24 * 3_600 * NANOS_PER_SEC,
        "w" => 7 * 24 * 3_600 * NANOS_PER_SEC,
        "mo" | "mth" | "month" => 30 * 24 * 3_600 * NANOS_PER_SEC,
        "y" => 365 * 24 * 3_600 * NANOS_PER_SEC,
        _ => return None,
    })
}

/// Parses a TTL string like `1h30m`, `2d`, `0.5h` or `-10m` into a signed
/// duration.
///
/// The grammar is an optional leading `-` followed by one or more
/// `<number><unit>` terms. Numbers may be fractional; units are matched
/// case-insensitively. `m` is always minutes, the month tokens are the
/// two-letter-and-up `mo`/`mth`/`month`. Whitespace between terms (or
/// between a number and its unit) is tolerated.
pub fn parse_ttl(input: &str) -> Result<Duration, InvalidDuration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(InvalidDuration("empty duration".to_string()));
    }
    let (negative, mut rest) = match trimmed.strip_prefix('-') {
        Some(tail) => (true, tail.trim_start()),
        None => (false, trimmed),
    };
    if rest.is_empty() {
        return Err(InvalidDuration("missing duration after sign".to_string()));
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (nanos, tail) = parse_term(rest)?;
        total = total
            .checked_add(nanos)
            .ok_or_else(|| overflow(trimmed))?;
        rest = tail.trim_start();
    }
    if total > i64::MAX as u128 {
        return Err(overflow(trimmed));
    }

    let nanos = total as i64;
    Ok(Duration::nanoseconds(if negative { -nanos } else { nanos }))
}

/// Consumes one `<number><unit>` term off the front of `input` and returns
/// its length in nanoseconds plus the unconsumed remainder.
fn parse_term(input: &str) -> Result<(u128, &str), InvalidDuration> {
    let digits_end = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let whole = &input[..digits_end];
    let mut rest = &input[digits_end..];

    let mut fraction = "";
    if let Some(tail) = rest.strip_prefix('.') {
        let fraction_end = tail
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(tail.len());
        fraction = &tail[..fraction_end];
        rest = &tail[fraction_end..];
    }
    if whole.is_empty() && fraction.is_empty() {
        return Err(InvalidDuration(format!("expected a number at {input:?}")));
    }

    let rest = rest.trim_start();
    let unit_end = rest
        .find(|c: char| !c.is_alphabetic())
        .unwrap_or(rest.len());
    let unit_raw = &rest[..unit_end];
    if unit_raw.is_empty() {
        return Err(InvalidDuration(
            "missing unit (expected ns, us, ms, s, m, h, d, w, mo or y)".to_string(),
        ));
    }
    let Some(scale) = unit_nanos(&unit_raw.to_lowercase()) else {
        return Err(InvalidDuration(format!("unknown unit {unit_raw:?}")));
    };

    let mut nanos: u128 = 0;
    if !whole.is_empty() {
        let whole_val: u128 = whole.parse().map_err(|_| overflow(whole))?;
        nanos = whole_val.checked_mul(scale).ok_or_else(|| overflow(whole))?;
    }
    if !fraction.is_empty() {
        // Fractions multiply by the unit length, truncating toward zero at
        // nanosecond resolution.
        let mut numerator: u128 = 0;
        let mut denominator: u128 = 1;
        for digit in fraction.bytes() {
            if denominator >= MAX_FRACTION_DENOMINATOR {
                break;
            }
            numerator = numerator * 10 + u128::from(digit - b'0');
            denominator *= 10;
        }
        nanos = nanos
            .checked_add(numerator * scale / denominator)
            .ok_or_else(|| overflow(fraction))?;
    }
    Ok((nanos, &rest[unit_end..]))
}

fn overflow(part: &str) -> InvalidDuration {
    InvalidDuration(format!("duration overflows at {part:?}"))
}
