//! Parsers for the driver's command-line specifications.
//!
//! ```text
//! --func 0x40=helper     ADDR[=NAME]
//! --want r0:0xffff       REG[:MASK]
//! --base 0x8000          number
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, hex_digit1},
    combinator::{all_consuming, map, map_res, opt, recognize},
    sequence::{pair, preceded},
    IResult,
};

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.'),
    ))(input)
}

fn unsigned(input: &str) -> IResult<&str, i64> {
    alt((
        map_res(preceded(alt((tag("0x"), tag("0X"))), hex_digit1), |h: &str| i64::from_str_radix(h, 16)),
        map_res(digit1, |d: &str| d.parse::<i64>()),
    ))(input)
}

/// Decimal or `0x` hex, optionally negative.
pub fn number(input: &str) -> IResult<&str, i64> {
    map(pair(opt(char('-')), unsigned), |(neg, v)| if neg.is_some() { -v } else { v })(input)
}

pub fn parse_number(s: &str) -> Option<i64> {
    all_consuming(number)(s.trim()).ok().map(|(_, v)| v)
}

/// `ADDR` or `ADDR=NAME`.
pub fn parse_func_spec(spec: &str) -> Option<(u64, Option<String>)> {
    let name = preceded(char('='), ident);
    all_consuming(pair(unsigned, opt(name)))(spec.trim())
        .ok()
        .map(|(_, (addr, name))| (addr as u64, name.map(str::to_string)))
}

/// `REG` or `REG:MASK`.
pub fn parse_want_spec(spec: &str) -> Option<(String, Option<i64>)> {
    let mask = preceded(char(':'), number);
    all_consuming(pair(ident, opt(mask)))(spec.trim())
        .ok()
        .map(|(_, (reg, mask))| (reg.to_string(), mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numbers() {
        assert_eq!(parse_number("0x1f"), Some(0x1f));
        assert_eq!(parse_number(" -12 "), Some(-12));
        assert_eq!(parse_number("0xg"), None);
        assert_eq!(parse_number("12ab"), None);
    }

    #[test]
    fn func_specs() {
        assert_eq!(parse_func_spec("0x40=helper"), Some((0x40, Some("helper".to_string()))));
        assert_eq!(parse_func_spec("16"), Some((16, None)));
        assert_eq!(parse_func_spec("-16"), None);
        assert_eq!(parse_func_spec("x"), None);
        assert_eq!(parse_func_spec("0x40="), None);
    }

    #[test]
    fn want_specs() {
        assert_eq!(parse_want_spec("r0:0xff"), Some(("r0".to_string(), Some(0xff))));
        assert_eq!(parse_want_spec("sp"), Some(("sp".to_string(), None)));
        assert_eq!(parse_want_spec("r0:"), None);
    }
}
