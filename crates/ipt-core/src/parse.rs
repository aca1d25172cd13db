//! Numeric and service-name parsing shared by the extension grammars.
//!
//! Numbers follow `strtoul(..., 0)`: decimal, `0x` hexadecimal, and octal
//! when the literal starts with `0`.

/// Well-known services accepted wherever a port is expected
const SERVICES: &[(&str, u16)] = &[
    ("ftp-data", 20),
    ("ftp", 21),
    ("ssh", 22),
    ("telnet", 23),
    ("smtp", 25),
    ("domain", 53),
    ("tftp", 69),
    ("http", 80),
    ("pop3", 110),
    ("ntp", 123),
    ("imap", 143),
    ("snmp", 161),
    ("ldap", 389),
    ("https", 443),
    ("submission", 587),
    ("imaps", 993),
    ("pop3s", 995),
    ("mysql", 3306),
    ("postgresql", 5432),
];

/// Parse a whole string as an unsigned number no larger than `max`
pub fn parse_uint(input: &str, max: u64) -> Option<u64> {
    match parse_uint_prefix(input, max) {
        Some((value, "")) => Some(value),
        _ => None,
    }
}

/// Parse the longest numeric prefix of `input`, returning the value and the
/// unparsed remainder. At least one digit must be consumed.
pub fn parse_uint_prefix(input: &str, max: u64) -> Option<(u64, &str)> {
    let (radix, digits) = if let Some(rest) = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        (16, rest)
    } else if input.len() > 1 && input.starts_with('0') {
        (8, &input[1..])
    } else {
        (10, input)
    };

    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_digit(radix))
        .map(|(idx, _)| idx)
        .unwrap_or(digits.len());

    if end == 0 {
        // "0" followed by a non-octal character still parses as zero
        return if radix == 8 {
            Some((0, digits))
        } else {
            None
        };
    }

    let value = u64::from_str_radix(&digits[..end], radix).ok()?;
    if value > max {
        return None;
    }
    Some((value, &digits[end..]))
}

/// C `atoi`: optional leading whitespace and sign, then decimal digits until
/// the first non-digit. Returns 0 when nothing parses. Saturates instead of
/// overflowing.
pub fn atoi(input: &str) -> i64 {
    let trimmed = input.trim_start();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let mut value: i64 = 0;
    for byte in digits.bytes().take_while(u8::is_ascii_digit) {
        value = value
            .saturating_mul(10)
            .saturating_add(i64::from(byte - b'0'));
    }

    if negative { -value } else { value }
}

/// Look up a service name in the well-known table
pub fn service_to_port(name: &str) -> Option<u16> {
    SERVICES
        .iter()
        .find(|(service, _)| service.eq_ignore_ascii_case(name))
        .map(|(_, port)| *port)
}

/// Parse a port number or service name
pub fn parse_port(input: &str) -> Option<u16> {
    parse_uint(input, u64::from(u16::MAX))
        .map(|port| port as u16)
        .or_else(|| service_to_port(input))
}

/// Split a leading `!` (optionally followed by whitespace) off a value
pub fn split_invert(input: &str) -> (bool, &str) {
    match input.trim_start().strip_prefix('!') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, input.trim()),
    }
}
