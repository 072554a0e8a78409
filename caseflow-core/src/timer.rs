//! ISO 8601 timer expressions.
//!
//! Supported forms:
//! - durations: `PT30S`, `PT1H30M`, `P2D`, `P1W`, `P1DT12H`
//! - cycles: `R3/PT10S` (three fires, ten seconds apart), `R/PT1M` (unbounded)

use crate::types::TimerCycle;
use nom::{
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt},
    sequence::{preceded, terminated, tuple},
    Finish, IResult,
};

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

/// A parsed timer: when it first fires and whether it repeats.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSpec {
    pub first_due_in_ms: u64,
    /// Repetitions left after the first fire.
    pub cycle: Option<TimerCycle>,
}

/// Parse a timer expression. Surrounding whitespace is ignored.
pub fn parse_timer(input: &str) -> Result<TimerSpec, String> {
    let text = input.trim();
    let parsed = all_consuming(timer_expr)(text)
        .finish()
        .map_err(|e| format!("unexpected input at '{}'", e.input))?;
    let (_, (repeat, interval_ms)) = parsed;

    if interval_ms == 0 {
        return Err("duration must be greater than zero".to_string());
    }

    let cycle = match repeat {
        None => None,
        Some(None) => Some(TimerCycle {
            interval_ms,
            remaining: None,
        }),
        Some(Some(0)) => return Err("cycle repeat count must be at least 1".to_string()),
        Some(Some(1)) => None,
        Some(Some(n)) => Some(TimerCycle {
            interval_ms,
            remaining: Some(n - 1),
        }),
    };

    Ok(TimerSpec {
        first_due_in_ms: interval_ms,
        cycle,
    })
}

/// Parse a bare duration into milliseconds.
pub fn parse_duration_ms(input: &str) -> Result<u64, String> {
    all_consuming(duration)(input.trim())
        .finish()
        .map(|(_, ms)| ms)
        .map_err(|e| format!("unexpected input at '{}'", e.input))
}

/// `R<n>/` prefix: `None` when absent, `Some(None)` for an unbounded `R/`.
type Repeat = Option<Option<u32>>;

fn timer_expr(input: &str) -> IResult<&str, (Repeat, u64)> {
    let (input, repeat) = opt(terminated(
        preceded(char('R'), opt(map_res(digit1, str::parse::<u32>))),
        char('/'),
    ))(input)?;
    let (input, ms) = duration(input)?;
    Ok((input, (repeat, ms)))
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(input)
}

fn component<'a>(unit: char) -> impl FnMut(&'a str) -> IResult<&'a str, Option<u64>> {
    opt(terminated(number, char(unit)))
}

fn duration(input: &str) -> IResult<&str, u64> {
    let start = input;
    let (input, _) = char('P')(input)?;
    let (input, (weeks, days)) = tuple((component('W'), component('D')))(input)?;
    let (input, time) = opt(preceded(
        char('T'),
        tuple((component('H'), component('M'), component('S'))),
    ))(input)?;

    let (hours, minutes, seconds) = time.unwrap_or((None, None, None));
    let parts = [
        (weeks, WEEK_MS),
        (days, DAY_MS),
        (hours, HOUR_MS),
        (minutes, MINUTE_MS),
        (seconds, SECOND_MS),
    ];
    if parts.iter().all(|(v, _)| v.is_none()) {
        return Err(nom::Err::Error(nom::error::Error::new(
            start,
            nom::error::ErrorKind::Verify,
        )));
    }

    let mut total: u64 = 0;
    for (value, unit) in parts {
        let ms = value.unwrap_or(0).checked_mul(unit).and_then(|ms| total.checked_add(ms));
        total = ms.ok_or_else(|| {
            nom::Err::Failure(nom::error::Error::new(start, nom::error::ErrorKind::TooLarge))
        })?;
    }
    Ok((input, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durations() {
        assert_eq!(parse_duration_ms("PT30S"), Ok(30_000));
        assert_eq!(parse_duration_ms("PT1H30M"), Ok(90 * MINUTE_MS));
        assert_eq!(parse_duration_ms("P2D"), Ok(2 * DAY_MS));
        assert_eq!(parse_duration_ms("P1DT12H"), Ok(DAY_MS + 12 * HOUR_MS));
        assert_eq!(parse_duration_ms(" P1W "), Ok(WEEK_MS));
    }

    #[test]
    fn test_invalid_durations() {
        assert!(parse_duration_ms("P").is_err());
        assert!(parse_duration_ms("PT").is_err());
        assert!(parse_duration_ms("30S").is_err());
        assert!(parse_duration_ms("PT5X").is_err());
        assert!(parse_timer("PT0S").is_err());
    }

    #[test]
    fn test_single_fire_timer() {
        let parsed = parse_timer("PT5M").unwrap();
        assert_eq!(parsed.first_due_in_ms, 5 * MINUTE_MS);
        assert_eq!(parsed.cycle, None);

        // R1 fires exactly once, same as a plain duration.
        assert_eq!(parse_timer("R1/PT5M").unwrap().cycle, None);
    }

    #[test]
    fn test_cycles() {
        let parsed = parse_timer("R3/PT10S").unwrap();
        assert_eq!(parsed.first_due_in_ms, 10_000);
        assert_eq!(
            parsed.cycle,
            Some(TimerCycle {
                interval_ms: 10_000,
                remaining: Some(2)
            })
        );

        let unbounded = parse_timer("R/PT1M").unwrap();
        assert_eq!(unbounded.cycle.map(|c| c.remaining), Some(None));

        assert!(parse_timer("R0/PT1M").is_err());
    }
}
