use core::fmt::{self, Display, Formatter};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    AuthSucceeded = 235,
    Ok = 250,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    TemporaryFailure = 454,
    SyntaxError = 501,
    InvalidCommandSequence = 503,
    ParameterNotImplemented = 504,
    AuthFailed = 535,
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }
}

impl TryFrom<u32> for Status {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        Ok(match value {
            220 => Self::ServiceReady,
            221 => Self::GoodBye,
            235 => Self::AuthSucceeded,
            250 => Self::Ok,
            334 => Self::AuthContinue,
            354 => Self::StartMailInput,
            421 => Self::Unavailable,
            454 => Self::TemporaryFailure,
            501 => Self::SyntaxError,
            503 => Self::InvalidCommandSequence,
            504 => Self::ParameterNotImplemented,
            535 => Self::AuthFailed,
            _ => return Err(value),
        })
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        value as Self
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}
