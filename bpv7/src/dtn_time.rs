/*!
DTN time: milliseconds since the DTN epoch (2000-01-01 00:00:00 UTC).
*/

const DTN_EPOCH: time::OffsetDateTime = time::macros::datetime!(2000-01-01 00:00:00 UTC);

/// A point in DTN time.
#[derive(Debug, Default, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct DtnTime(u64);

impl DtnTime {
    /// The sentinel used for "never" when scheduling.
    pub const INFINITE: DtnTime = DtnTime(u64::MAX);

    /// Current wall-clock time expressed as DTN time.
    pub fn now() -> Self {
        Self::saturating_from(time::OffsetDateTime::now_utc())
    }

    pub fn new(millisecs: u64) -> Self {
        Self(millisecs)
    }

    pub fn millisecs(&self) -> u64 {
        self.0
    }

    pub fn saturating_from(t: time::OffsetDateTime) -> Self {
        let millisecs = (t - DTN_EPOCH).whole_milliseconds();
        if millisecs < 0 {
            Self(0)
        } else if millisecs > u64::MAX as i128 {
            Self(u64::MAX)
        } else {
            Self(millisecs as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_is_zero() {
        assert_eq!(DtnTime::saturating_from(DTN_EPOCH).millisecs(), 0);
    }

    #[test]
    fn pre_epoch_saturates() {
        let before = time::macros::datetime!(1999-12-31 23:59:59 UTC);
        assert_eq!(DtnTime::saturating_from(before).millisecs(), 0);
    }
}
