use super::*;

/// The BPv7 creation timestamp, a 2-tuple of DTN time and sequence number.
///
/// The sequence number disambiguates bundles created by the same source in
/// the same millisecond; the sending side allocates it monotonically.
#[derive(Default, Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct CreationTimestamp {
    pub time: DtnTime,
    pub sequence_number: u64,
}

impl CreationTimestamp {
    pub fn emit<S: tern_cbor::encode::Sink>(&self, encoder: &mut tern_cbor::encode::Encoder<S>) {
        encoder.emit_array(Some(2), |a| {
            a.emit_uint(self.time.millisecs());
            a.emit_uint(self.sequence_number);
        });
    }

    pub fn parse(decoder: &mut tern_cbor::decode::Decoder) -> Result<Self, Error> {
        match decoder.parse_array_header()? {
            tern_cbor::decode::ArrayLength::Definite(2) => {}
            _ => return Err(Error::MalformedExtension("creation timestamp")),
        }
        let time = DtnTime::new(decoder.parse_uint()?);
        let sequence_number = decoder.parse_uint()?;
        Ok(Self {
            time,
            sequence_number,
        })
    }
}
