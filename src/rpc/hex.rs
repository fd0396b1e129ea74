use thiserror::Error;

/// Errors produced while decoding a JSON-RPC hex quantity.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HexError {
    #[error("quantity {0:?} is missing the 0x prefix")]
    MissingPrefix(String),
    #[error("quantity {0:?} has no digits")]
    Empty(String),
    #[error("quantity {0:?} contains a non-hex digit")]
    InvalidDigit(String),
    #[error("quantity {0:?} does not fit in {1} bits")]
    Overflow(String, u32),
}

/// Decodes a `0x`-prefixed hex quantity into a `u64`.
pub fn parse_u64(raw: &str) -> Result<u64, HexError> {
    let value = parse_u128(raw)?;
    u64::try_from(value).map_err(|_| HexError::Overflow(raw.to_string(), 64))
}

/// Decodes a `0x`-prefixed hex quantity into a `u128`.
///
/// Wei amounts (gas price, balances) routinely exceed `u64`, so this is the
/// widest width the exporter decodes.
pub fn parse_u128(raw: &str) -> Result<u128, HexError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| HexError::MissingPrefix(raw.to_string()))?;

    if digits.is_empty() {
        return Err(HexError::Empty(raw.to_string()));
    }

    let mut value: u128 = 0;
    for c in digits.chars() {
        let digit = c
            .to_digit(16)
            .ok_or_else(|| HexError::InvalidDigit(raw.to_string()))?;
        value = value
            .checked_mul(16)
            .and_then(|v| v.checked_add(u128::from(digit)))
            .ok_or_else(|| HexError::Overflow(raw.to_string(), 128))?;
    }

    Ok(value)
}

/// Number of bytes encoded by a `0x`-prefixed hex data string.
pub fn data_len(raw: &str) -> usize {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    digits.len() / 2
}
