/// Borrowed BACnet bit string: the raw bytes plus the count of unused
/// trailing bits in the final byte (0-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitString<'a> {
    pub unused_bits: u8,
    pub data: &'a [u8],
}

impl<'a> BitString<'a> {
    pub const fn new(unused_bits: u8, data: &'a [u8]) -> Self {
        Self { unused_bits, data }
    }
}
