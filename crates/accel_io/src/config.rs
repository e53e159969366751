//! Platform configuration file parser.
//!
//! The format is one `key = value` entry per line. `#` starts a comment,
//! blank lines are ignored, values are decimal or `0x` hex integers, quoted
//! strings, or bare words (`true`, `word`, `/dev/mem`).
//!
//! ```text
//! manual_cache_flush = true
//! transfer_mode = word
//! bus_attributes = 0x0A
//! register_base = 0xFF419000
//! ```

use accel_core::{PlatformConfig, RegisterWindow, TransferMode};
use anyhow::{Context, Result, anyhow, bail};
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag_no_case, take_while1};
use nom::character::complete::{char, digit1, hex_digit1, space0};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::sequence::{delimited, preceded, separated_pair, terminated, tuple};
use std::fs;
use std::path::Path;

/// Environment variable overriding `manual_cache_flush`.
pub const ENV_MANUAL_CACHE_FLUSH: &str = "ACCEL_MANUAL_CACHE_FLUSH";
/// Environment variable overriding `transfer_mode`.
pub const ENV_TRANSFER_MODE: &str = "ACCEL_TRANSFER_MODE";
/// Environment variable overriding `bus_attributes`.
pub const ENV_BUS_ATTRIBUTES: &str = "ACCEL_BUS_ATTRIBUTES";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Int(u64),
    Str(String),
}

impl Value {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Int(0) => Some(false),
            Value::Int(1) => Some(true),
            Value::Str(s) if s.eq_ignore_ascii_case("true") => Some(true),
            Value::Str(s) if s.eq_ignore_ascii_case("false") => Some(false),
            _ => None,
        }
    }

    fn as_int(&self) -> Option<u64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Str(_) => None,
        }
    }

    fn as_str(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Str(s) => s.clone(),
        }
    }
}

fn key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn hex(input: &str) -> IResult<&str, u64> {
    map_res(preceded(tag_no_case("0x"), hex_digit1), |h| {
        u64::from_str_radix(h, 16)
    })(input)
}

fn decimal(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse)(input)
}

fn quoted(input: &str) -> IResult<&str, String> {
    map(delimited(char('"'), opt(is_not("\"")), char('"')), |s: Option<&str>| {
        s.unwrap_or_default().to_string()
    })(input)
}

fn bare(input: &str) -> IResult<&str, String> {
    map(
        take_while1(|c: char| c.is_ascii_alphanumeric() || "_-./".contains(c)),
        str::to_string,
    )(input)
}

fn value(input: &str) -> IResult<&str, Value> {
    alt((
        map(hex, Value::Int),
        map(decimal, Value::Int),
        map(quoted, Value::Str),
        map(bare, Value::Str),
    ))(input)
}

fn comment(input: &str) -> IResult<&str, Option<&str>> {
    opt(preceded(char('#'), nom::combinator::rest))(input)
}

fn entry(input: &str) -> IResult<&str, (&str, Value)> {
    terminated(
        separated_pair(
            preceded(space0, key),
            tuple((space0, char('='), space0)),
            value,
        ),
        tuple((space0, comment)),
    )(input)
}

fn parse_value(text: &str) -> Option<Value> {
    all_consuming(delimited(space0, value, space0))(text)
        .ok()
        .map(|(_, v)| v)
}

fn window(config: &mut PlatformConfig) -> &mut RegisterWindow {
    config
        .register_window
        .get_or_insert_with(RegisterWindow::default)
}

fn apply(config: &mut PlatformConfig, key: &str, value: &Value) -> Result<()> {
    let int = || value.as_int().ok_or_else(|| anyhow!("expected an integer"));
    match key {
        "manual_cache_flush" => {
            config.manual_cache_flush = value
                .as_bool()
                .ok_or_else(|| anyhow!("expected true, false, 1 or 0"))?;
        }
        "cache_line_size" => config.cache_line_size = usize::try_from(int()?)?,
        "transfer_mode" => config.transfer_mode = value.as_str().parse::<TransferMode>()?,
        "bus_attributes" => {
            let raw = int()?;
            config.bus_attributes =
                Some(u8::try_from(raw).map_err(|_| anyhow!("{raw:#x} exceeds 8 bits"))?);
        }
        "register_path" => window(config).path = value.as_str().into(),
        "register_base" => window(config).base = int()?,
        "register_len" => window(config).len = usize::try_from(int()?)?,
        "bus_attr_offset" => window(config).bus_attr_offset = usize::try_from(int()?)?,
        other => bail!("unknown key `{other}`"),
    }
    Ok(())
}

/// Parses configuration text on top of the default configuration.
///
/// Later entries override earlier ones. The result is not validated.
pub fn parse_config(text: &str) -> Result<PlatformConfig> {
    let mut config = PlatformConfig::default();

    for (index, line) in text.lines().enumerate() {
        let lineno = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (_, (key, value)) = all_consuming(entry)(trimmed)
            .map_err(|_| anyhow!("line {lineno}: malformed entry `{trimmed}`"))?;
        apply(&mut config, key, &value).with_context(|| format!("line {lineno}: `{key}`"))?;
    }

    Ok(config)
}

/// Applies `ACCEL_*` overrides read through `lookup`.
pub fn apply_env_with<F>(config: &mut PlatformConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let overrides = [
        (ENV_MANUAL_CACHE_FLUSH, "manual_cache_flush"),
        (ENV_TRANSFER_MODE, "transfer_mode"),
        (ENV_BUS_ATTRIBUTES, "bus_attributes"),
    ];
    for (var, key) in overrides {
        let Some(raw) = lookup(var) else { continue };
        let value = parse_value(&raw).ok_or_else(|| anyhow!("{var}: malformed value `{raw}`"))?;
        apply(config, key, &value).with_context(|| format!("{var}={raw}"))?;
    }
    Ok(())
}

/// Applies overrides from the process environment.
pub fn apply_env(config: &mut PlatformConfig) -> Result<()> {
    apply_env_with(config, |var| std::env::var(var).ok())
}

/// Loads, overrides and validates a configuration.
///
/// With no file the defaults are used; environment overrides apply either
/// way.
pub fn load_config(path: Option<&Path>) -> Result<PlatformConfig> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            parse_config(&text).with_context(|| format!("in {}", path.display()))?
        }
        None => PlatformConfig::default(),
    };
    apply_env(&mut config)?;
    config.validate()?;
    Ok(config)
}
