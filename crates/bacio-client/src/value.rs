use bacio_core::types::{BitString, DataValue, Date, ObjectId, Time};

/// An owned BACnet application value, mirroring the zero-copy
/// [`DataValue`] for results that outlive the receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Unsigned(u32),
    Signed(i32),
    Real(f32),
    Double(f64),
    OctetString(Vec<u8>),
    CharacterString(String),
    /// Character string in a character set other than UTF-8, preserved
    /// opaquely with its character-set indicator.
    RawCharacterString { charset: u8, bytes: Vec<u8> },
    BitString { unused_bits: u8, data: Vec<u8> },
    Enumerated(u32),
    Date(Date),
    Time(Time),
    ObjectId(ObjectId),
    /// A list of values between opening and closing tags.
    Constructed { tag_num: u8, values: Vec<Value> },
}

impl Value {
    pub fn from_wire(value: &DataValue<'_>) -> Self {
        match value {
            DataValue::Null => Self::Null,
            DataValue::Boolean(v) => Self::Boolean(*v),
            DataValue::Unsigned(v) => Self::Unsigned(*v),
            DataValue::Signed(v) => Self::Signed(*v),
            DataValue::Real(v) => Self::Real(*v),
            DataValue::Double(v) => Self::Double(*v),
            DataValue::OctetString(v) => Self::OctetString(v.to_vec()),
            DataValue::CharacterString(v) => Self::CharacterString((*v).to_string()),
            DataValue::RawCharacterString { charset, bytes } => Self::RawCharacterString {
                charset: *charset,
                bytes: bytes.to_vec(),
            },
            DataValue::BitString(v) => Self::BitString {
                unused_bits: v.unused_bits,
                data: v.data.to_vec(),
            },
            DataValue::Enumerated(v) => Self::Enumerated(*v),
            DataValue::Date(v) => Self::Date(*v),
            DataValue::Time(v) => Self::Time(*v),
            DataValue::ObjectId(v) => Self::ObjectId(*v),
            DataValue::Constructed { tag_num, values } => Self::Constructed {
                tag_num: *tag_num,
                values: values.iter().map(Self::from_wire).collect(),
            },
        }
    }

    /// Borrowed wire view for encoding.
    pub fn to_wire(&self) -> DataValue<'_> {
        match self {
            Self::Null => DataValue::Null,
            Self::Boolean(v) => DataValue::Boolean(*v),
            Self::Unsigned(v) => DataValue::Unsigned(*v),
            Self::Signed(v) => DataValue::Signed(*v),
            Self::Real(v) => DataValue::Real(*v),
            Self::Double(v) => DataValue::Double(*v),
            Self::OctetString(v) => DataValue::OctetString(v),
            Self::CharacterString(v) => DataValue::CharacterString(v),
            Self::RawCharacterString { charset, bytes } => DataValue::RawCharacterString {
                charset: *charset,
                bytes,
            },
            Self::BitString { unused_bits, data } => {
                DataValue::BitString(BitString::new(*unused_bits, data))
            }
            Self::Enumerated(v) => DataValue::Enumerated(*v),
            Self::Date(v) => DataValue::Date(*v),
            Self::Time(v) => DataValue::Time(*v),
            Self::ObjectId(v) => DataValue::ObjectId(*v),
            Self::Constructed { tag_num, values } => DataValue::Constructed {
                tag_num: *tag_num,
                values: values.iter().map(Value::to_wire).collect(),
            },
        }
    }
}
