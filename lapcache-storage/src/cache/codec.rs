//! Delta codec for delimited telemetry tables.
//!
//! A trace is a comma-separated table: one header row of channel names and
//! one row per sample. Channels listed in [`NUMERIC_COLUMNS`] vary slowly
//! from sample to sample, so each value after the first is replaced by its
//! difference from the previous value in the same column. Every other column
//! passes through untouched.
//!
//! # Exactness
//!
//! Values are handled as fixed-point decimals (`-?digits[.digits]`), never as
//! floats, so decoding reproduces the original text byte for byte. A delta
//! is written with the same number of fraction digits as the value it
//! replaces. When that is impossible (`10.25` followed by `10.5`), the delta
//! is written at the wider scale and tagged with the target scale:
//! `0.25#1`.
//!
//! Cells that are not canonical decimals (`N/A`, `1e5`, `-0`, `007`) are
//! literals: they pass through and do not move the column's running value.
//!
//! # Row skipping
//!
//! Rows with fewer fields than the widest row are copied verbatim in both
//! directions. Field counts never change under encoding, so encoder and
//! decoder always agree on which rows are skipped.

use lapcache_core::{CodecError, EncodingMeta};

/// Telemetry channels that carry deltas. Matched case-sensitively against the header.
pub const NUMERIC_COLUMNS: &[&str] = &[
    "LapDistPct",
    "LapDist",
    "LapCurrentLapTime",
    "SessionTime",
    "Lat",
    "Lon",
    "Alt",
    "Speed",
    "RPM",
    "Gear",
    "Throttle",
    "Brake",
    "Clutch",
    "SteeringWheelAngle",
    "Yaw",
    "YawRate",
    "Pitch",
    "Roll",
    "VelocityX",
    "VelocityY",
    "VelocityZ",
    "LatAccel",
    "LongAccel",
    "VertAccel",
    "FuelLevel",
    "ShiftIndicatorPct",
];

const FIELD_SEPARATOR: char = ',';
const ROW_SEPARATOR: char = '\n';
const SCALE_MARKER: char = '#';

/// Source values wider than this are literals, which keeps delta arithmetic
/// far from i128 overflow.
const MAX_VALUE_DIGITS: usize = 18;
/// Widest token the decoder accepts.
const MAX_TOKEN_DIGITS: usize = 38;

/// Result of [`encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    /// Bytes to store. Equal to the input when `meta.encoded` is false.
    pub payload: String,
    pub meta: EncodingMeta,
}

/// Whether a header name is a delta-encoded channel.
pub fn is_numeric_column(name: &str) -> bool {
    NUMERIC_COLUMNS.contains(&name)
}

/// Delta-encode a delimited table.
///
/// Never fails: tables that are too short, have no numeric channels, are
/// ambiguous, or do not shrink come back unmodified with `encoded = false`.
pub fn encode(table: &str) -> Encoded {
    let passthrough = || Encoded {
        payload: table.to_string(),
        meta: EncodingMeta::passthrough(table.len()),
    };

    let lines: Vec<&str> = table.split(ROW_SEPARATOR).collect();
    if lines.iter().filter(|l| !l.is_empty()).count() < 2 {
        return passthrough();
    }

    let delta_columns: Vec<usize> = lines[0]
        .split(FIELD_SEPARATOR)
        .enumerate()
        .filter(|(_, name)| is_numeric_column(name))
        .map(|(idx, _)| idx)
        .collect();
    if delta_columns.is_empty() {
        return passthrough();
    }

    let Some(payload) = encode_rows(&lines, &delta_columns) else {
        return passthrough();
    };
    if payload.len() >= table.len() {
        return passthrough();
    }

    let meta = EncodingMeta {
        encoded: true,
        original_len: table.len() as u64,
        encoded_len: payload.len() as u64,
        ratio: payload.len() as f64 / table.len() as f64,
        delta_columns,
    };
    Encoded { payload, meta }
}

/// Reverse [`encode`].
pub fn decode(payload: &str, meta: &EncodingMeta) -> Result<String, CodecError> {
    if !meta.encoded {
        return Ok(payload.to_string());
    }

    let lines: Vec<&str> = payload.split(ROW_SEPARATOR).collect();
    let width = max_width(&lines);
    if let Some(&column) = meta.delta_columns.iter().find(|&&c| c >= width) {
        return Err(CodecError::ColumnOutOfRange { column, width });
    }

    let mut running: Vec<Option<Decimal>> = vec![None; width];
    let mut out = Vec::with_capacity(lines.len());
    out.push(lines[0].to_string());

    for (row, line) in lines.iter().enumerate().skip(1) {
        let mut fields: Vec<String> = line.split(FIELD_SEPARATOR).map(str::to_string).collect();
        if fields.len() < width {
            out.push((*line).to_string());
            continue;
        }
        for &column in &meta.delta_columns {
            let cell = &fields[column];
            let Some(token) = Token::parse(cell) else {
                continue;
            };
            let value = match running[column] {
                None => {
                    if token.target_scale.is_some() {
                        return Err(CodecError::MalformedToken {
                            row,
                            column,
                            cell: cell.clone(),
                        });
                    }
                    token.value
                }
                Some(previous) => apply_delta(previous, token, row, column)?,
            };
            fields[column] = value.to_string();
            running[column] = Some(value);
        }
        out.push(fields.join(","));
    }

    Ok(out.join("\n"))
}

fn encode_rows(lines: &[&str], delta_columns: &[usize]) -> Option<String> {
    let width = max_width(lines);
    let mut running: Vec<Option<Decimal>> = vec![None; width];
    let mut out = Vec::with_capacity(lines.len());
    out.push(lines[0].to_string());

    for line in &lines[1..] {
        let mut fields: Vec<String> = line.split(FIELD_SEPARATOR).map(str::to_string).collect();
        if fields.len() < width {
            out.push((*line).to_string());
            continue;
        }
        for &column in delta_columns {
            let cell = &fields[column];
            match Decimal::parse(cell, MAX_VALUE_DIGITS) {
                None => {
                    // The decoder would read this literal as a delta.
                    if Token::parse(cell).is_some() {
                        return None;
                    }
                }
                Some(current) => {
                    if let Some(previous) = running[column] {
                        fields[column] = delta_token(previous, current)?;
                    }
                    running[column] = Some(current);
                }
            }
        }
        out.push(fields.join(","));
    }

    Some(out.join("\n"))
}

fn max_width(lines: &[&str]) -> usize {
    lines
        .iter()
        .map(|l| l.split(FIELD_SEPARATOR).count())
        .max()
        .unwrap_or(0)
}

/// Text replacing `current` given the column's previous value.
fn delta_token(previous: Decimal, current: Decimal) -> Option<String> {
    let wide = previous.scale.max(current.scale);
    let delta = current
        .mantissa_at(wide)?
        .checked_sub(previous.mantissa_at(wide)?)?;

    let token = if previous.representable_at(current.scale) {
        let narrowed = delta / pow10(wide - current.scale)?;
        Decimal::new(narrowed, current.scale).to_string()
    } else {
        format!("{}{}{}", Decimal::new(delta, wide), SCALE_MARKER, current.scale)
    };

    // The decoder caps token width; refuse to emit anything it would reject.
    Token::parse(&token).map(|_| token)
}

fn apply_delta(
    previous: Decimal,
    token: Token,
    row: usize,
    column: usize,
) -> Result<Decimal, CodecError> {
    let overflow = || CodecError::Overflow { row, column };
    let wide = previous.scale.max(token.value.scale);
    let sum = previous
        .mantissa_at(wide)
        .ok_or_else(overflow)?
        .checked_add(token.value.mantissa_at(wide).ok_or_else(overflow)?)
        .ok_or_else(overflow)?;

    let target = token.target_scale.unwrap_or(token.value.scale);
    Decimal::new(sum, wide)
        .narrow_to(target)
        .ok_or(CodecError::InexactScale {
            row,
            column,
            scale: target,
        })
}

fn pow10(exp: u32) -> Option<i128> {
    10i128.checked_pow(exp)
}

/// Exact fixed-point decimal: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Decimal {
    mantissa: i128,
    scale: u32,
}

impl Decimal {
    fn new(mantissa: i128, scale: u32) -> Self {
        Self { mantissa, scale }
    }

    /// Parse a canonical decimal: the text must be exactly what `to_string` prints.
    fn parse(cell: &str, max_digits: usize) -> Option<Self> {
        let body = cell.strip_prefix('-').unwrap_or(cell);
        let (int, frac) = match body.split_once('.') {
            Some((int, frac)) if !frac.is_empty() => (int, frac),
            Some(_) => return None,
            None => (body, ""),
        };
        if int.is_empty()
            || !int.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
            || int.len() + frac.len() > max_digits
        {
            return None;
        }

        let magnitude: i128 = format!("{int}{frac}").parse().ok()?;
        let mantissa = if cell.starts_with('-') {
            -magnitude
        } else {
            magnitude
        };
        let value = Self::new(mantissa, frac.len() as u32);
        (value.to_string() == cell).then_some(value)
    }

    fn mantissa_at(self, scale: u32) -> Option<i128> {
        self.mantissa.checked_mul(pow10(scale.checked_sub(self.scale)?)?)
    }

    fn representable_at(self, scale: u32) -> bool {
        scale >= self.scale || self.narrow_to(scale).is_some()
    }

    /// Drop fraction digits, only if they are all zero.
    fn narrow_to(self, scale: u32) -> Option<Self> {
        if scale >= self.scale {
            return self.mantissa_at(scale).map(|m| Self::new(m, scale));
        }
        let divisor = pow10(self.scale - scale)?;
        (self.mantissa % divisor == 0).then(|| Self::new(self.mantissa / divisor, scale))
    }
}

impl std::fmt::Display for Decimal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = self.scale as usize;
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale + 1 - digits.len()), digits)
        } else {
            digits
        };
        let (int, frac) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int}.{frac}")
    }
}

/// A numeric cell as the decoder sees it: a decimal, optionally tagged `#scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token {
    value: Decimal,
    target_scale: Option<u32>,
}

impl Token {
    fn parse(cell: &str) -> Option<Self> {
        match cell.split_once(SCALE_MARKER) {
            None => Decimal::parse(cell, MAX_TOKEN_DIGITS).map(|value| Self {
                value,
                target_scale: None,
            }),
            Some((number, scale)) => {
                let value = Decimal::parse(number, MAX_TOKEN_DIGITS)?;
                let target: u32 = scale.parse().ok()?;
                (target.to_string() == scale && target < value.scale).then_some(Self {
                    value,
                    target_scale: Some(target),
                })
            }
        }
    }
}
