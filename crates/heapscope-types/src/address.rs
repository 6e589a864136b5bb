use facet::Facet;
use std::fmt;
use std::num::IntErrorKind;

use crate::InvariantError;

const REFERENCE_TAG_PREFIX: &str = "objref@0x";

/// Raw heap address of a live script object, as reported by the census.
///
/// Serializes as a bare number and displays as lowercase `0x<hex>` without
/// padding. [`ObjectAddress::parse`] also accepts the host's reference tag
/// spelling, `objref@0x<hex>`.
///
/// [`Display`]: fmt::Display
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[facet(transparent)]
pub struct ObjectAddress(u64);

impl ObjectAddress {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Parses user input: `0x1f`, `objref@0x1f` or `31`.
    pub fn parse(text: &str) -> Result<Self, InvariantError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(InvariantError::EmptyField("address"));
        }
        let (digits, radix) = if let Some(hex) = trimmed.strip_prefix(REFERENCE_TAG_PREFIX) {
            (hex, 16)
        } else if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            (hex, 16)
        } else {
            (trimmed, 10)
        };
        u64::from_str_radix(digits, radix)
            .map(Self)
            .map_err(|error| match error.kind() {
                IntErrorKind::PosOverflow => InvariantError::AddressOverflow(trimmed.to_string()),
                _ => InvariantError::MalformedAddress(trimmed.to_string()),
            })
    }
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<u64> for ObjectAddress {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_every_textual_form() {
        let expected = ObjectAddress::new(0x7f3a_10c0);
        assert_eq!(ObjectAddress::parse("0x7f3a10c0").expect("hex"), expected);
        assert_eq!(ObjectAddress::parse("0X7F3A10C0").expect("upper hex"), expected);
        assert_eq!(
            ObjectAddress::parse("objref@0x7f3a10c0").expect("tag"),
            expected
        );
        assert_eq!(
            ObjectAddress::parse(" 2134511808 ").expect("decimal"),
            expected
        );
    }

    #[test]
    fn parse_rejects_garbage_and_overflow() {
        assert_eq!(
            ObjectAddress::parse(""),
            Err(InvariantError::EmptyField("address"))
        );
        assert!(matches!(
            ObjectAddress::parse("0xzz"),
            Err(InvariantError::MalformedAddress(_))
        ));
        assert!(matches!(
            ObjectAddress::parse("0x1ffffffffffffffff"),
            Err(InvariantError::AddressOverflow(_))
        ));
    }

    #[test]
    fn display_is_lowercase_hex_and_parses_back() {
        let address = ObjectAddress::new(255);
        assert_eq!(address.to_string(), "0xff");
        assert_eq!(ObjectAddress::parse(&address.to_string()), Ok(address));
    }
}
