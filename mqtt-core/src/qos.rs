use crate::err::{DecodeError, DecodeErrorKind};

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub enum QosLevel {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QosLevel {
    type Error = DecodeError;

    /// Takes a byte with the non-QoS bits already masked off and right-shifted to bit 0.
    fn try_from(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            _ => Err(DecodeError::new(
                DecodeErrorKind::QoS,
                format!("invalid QoS: {value}, only values 0-2 are valid"),
            )),
        }
    }
}

impl PartialEq<SubAckQoS> for QosLevel {
    fn eq(&self, other: &SubAckQoS) -> bool {
        other == self
    }
}

/// Granted QoS as reported in a SUBACK: either an accepted level, or 0x80 for failure.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug)]
pub enum SubAckQoS {
    Qos(QosLevel),
    Failure,
}

impl SubAckQoS {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure)
    }
}

impl PartialEq<QosLevel> for SubAckQoS {
    fn eq(&self, other: &QosLevel) -> bool {
        match self {
            Self::Failure => false,
            Self::Qos(qos) => qos == other,
        }
    }
}

impl From<QosLevel> for SubAckQoS {
    fn from(value: QosLevel) -> Self {
        Self::Qos(value)
    }
}

impl From<SubAckQoS> for u8 {
    fn from(value: SubAckQoS) -> Self {
        match value {
            SubAckQoS::Failure => 0x80,
            SubAckQoS::Qos(qos) => qos as u8,
        }
    }
}

impl TryFrom<u8> for SubAckQoS {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if value == 0x80 {
            Ok(Self::Failure)
        } else {
            Ok(Self::Qos(QosLevel::try_from(value)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suback_failure_round_trips() {
        let raw: u8 = 0x80;
        let decoded = SubAckQoS::try_from(raw).unwrap();
        assert!(decoded.is_failure());
        assert_eq!(u8::from(decoded), raw);
    }

    #[test]
    fn rejects_out_of_range_qos() {
        assert!(QosLevel::try_from(3).is_err());
    }
}
