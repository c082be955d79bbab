/// Segmentation capability advertised during device discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Segmentation {
    SegmentedBoth = 0,
    SegmentedTransmit = 1,
    SegmentedReceive = 2,
    NoSegmentation = 3,
}

impl Segmentation {
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::SegmentedBoth),
            1 => Some(Self::SegmentedTransmit),
            2 => Some(Self::SegmentedReceive),
            3 => Some(Self::NoSegmentation),
            _ => None,
        }
    }

    /// Whether this capability allows the peer to segment its response.
    pub const fn accepts_segmented_responses(self) -> bool {
        matches!(self, Self::SegmentedBoth | Self::SegmentedReceive)
    }
}

/// Maximum APDU length codes carried in the confirmed-request header nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MaxApdu {
    UpTo50 = 0,
    UpTo128 = 1,
    UpTo206 = 2,
    UpTo480 = 3,
    UpTo1024 = 4,
    UpTo1476 = 5,
}

impl MaxApdu {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn octets(self) -> u16 {
        match self {
            Self::UpTo50 => 50,
            Self::UpTo128 => 128,
            Self::UpTo206 => 206,
            Self::UpTo480 => 480,
            Self::UpTo1024 => 1024,
            Self::UpTo1476 => 1476,
        }
    }

    /// The largest code whose capacity does not exceed `octets`.
    pub const fn fitting(octets: u16) -> Self {
        match octets {
            0..=127 => Self::UpTo50,
            128..=205 => Self::UpTo128,
            206..=479 => Self::UpTo206,
            480..=1023 => Self::UpTo480,
            1024..=1475 => Self::UpTo1024,
            _ => Self::UpTo1476,
        }
    }
}

/// BACnet error class reported in Error PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorClass {
    Device = 0,
    Object = 1,
    Property = 2,
    Resources = 3,
    Security = 4,
    Services = 5,
    Vt = 6,
    Communication = 7,
}

impl ErrorClass {
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Device),
            1 => Some(Self::Object),
            2 => Some(Self::Property),
            3 => Some(Self::Resources),
            4 => Some(Self::Security),
            5 => Some(Self::Services),
            6 => Some(Self::Vt),
            7 => Some(Self::Communication),
            _ => None,
        }
    }
}

/// BACnet error codes reported in Error PDUs (the subset a client needs to
/// classify; everything else is carried as its raw value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Other = 0,
    ConfigurationInProgress = 2,
    DeviceBusy = 3,
    ReadAccessDenied = 27,
    UnknownObject = 31,
    UnknownProperty = 32,
    UnknownSubscription = 33,
    ValueOutOfRange = 37,
    WriteAccessDenied = 40,
    NotCovProperty = 44,
    CovSubscriptionFailed = 43,
    UnknownDevice = 70,
}

impl ErrorCode {
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Other),
            2 => Some(Self::ConfigurationInProgress),
            3 => Some(Self::DeviceBusy),
            27 => Some(Self::ReadAccessDenied),
            31 => Some(Self::UnknownObject),
            32 => Some(Self::UnknownProperty),
            33 => Some(Self::UnknownSubscription),
            37 => Some(Self::ValueOutOfRange),
            40 => Some(Self::WriteAccessDenied),
            43 => Some(Self::CovSubscriptionFailed),
            44 => Some(Self::NotCovProperty),
            70 => Some(Self::UnknownDevice),
            _ => None,
        }
    }
}

/// Reasons carried by a Reject PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Other = 0,
    BufferOverflow = 1,
    InconsistentParameters = 2,
    InvalidParameterDataType = 3,
    InvalidTag = 4,
    MissingRequiredParameter = 5,
    ParameterOutOfRange = 6,
    TooManyArguments = 7,
    UndefinedEnumeration = 8,
    UnrecognizedService = 9,
}

impl RejectReason {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Other),
            1 => Some(Self::BufferOverflow),
            2 => Some(Self::InconsistentParameters),
            3 => Some(Self::InvalidParameterDataType),
            4 => Some(Self::InvalidTag),
            5 => Some(Self::MissingRequiredParameter),
            6 => Some(Self::ParameterOutOfRange),
            7 => Some(Self::TooManyArguments),
            8 => Some(Self::UndefinedEnumeration),
            9 => Some(Self::UnrecognizedService),
            _ => None,
        }
    }
}

/// Reasons carried by an Abort PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    Other = 0,
    BufferOverflow = 1,
    InvalidApduInThisState = 2,
    PreemptedByHigherPriorityTask = 3,
    SegmentationNotSupported = 4,
    SecurityError = 5,
    InsufficientSecurity = 6,
    WindowSizeOutOfRange = 7,
    ApplicationExceededReplyTime = 8,
    OutOfResources = 9,
    TsmTimeout = 10,
    ApduTooLong = 11,
}

impl AbortReason {
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Other),
            1 => Some(Self::BufferOverflow),
            2 => Some(Self::InvalidApduInThisState),
            3 => Some(Self::PreemptedByHigherPriorityTask),
            4 => Some(Self::SegmentationNotSupported),
            5 => Some(Self::SecurityError),
            6 => Some(Self::InsufficientSecurity),
            7 => Some(Self::WindowSizeOutOfRange),
            8 => Some(Self::ApplicationExceededReplyTime),
            9 => Some(Self::OutOfResources),
            10 => Some(Self::TsmTimeout),
            11 => Some(Self::ApduTooLong),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MaxApdu;

    #[test]
    fn max_apdu_fitting_picks_largest_code_that_fits() {
        assert_eq!(MaxApdu::fitting(1476), MaxApdu::UpTo1476);
        assert_eq!(MaxApdu::fitting(1475), MaxApdu::UpTo1024);
        assert_eq!(MaxApdu::fitting(480), MaxApdu::UpTo480);
        assert_eq!(MaxApdu::fitting(0), MaxApdu::UpTo50);
    }
}
