/*!
Administrative records.

The only record type implemented is the custody acknowledgement (DACS): a
2-tuple of the acknowledged flow's source EID and the list of creation
sequence numbers being acknowledged. The sequence list is emitted as an
indefinite-length array because the sender appends to it until the
collection window closes.
*/

use super::*;
use smallvec::SmallVec;

/// Administrative record type number for a custody acknowledgement.
pub const ADMIN_RECORD_TYPE_CUSTODY_ACK: u64 = 4;

/// Upper bound on sequence numbers carried by one DACS payload.
pub const DACS_MAX_SEQ_PER_PAYLOAD: usize = 64;

/// The payload of a custody-acknowledgement admin record.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct CustodyAcceptPayload {
    pub flow_source_eid: Eid,
    pub sequence_nums: SmallVec<[u64; 8]>,
}

impl CustodyAcceptPayload {
    pub fn is_full(&self) -> bool {
        self.sequence_nums.len() >= DACS_MAX_SEQ_PER_PAYLOAD
    }

    /// Emits the full admin record: `[record-type, [source, [seq...]]]`.
    pub fn emit<S: tern_cbor::encode::Sink>(&self, encoder: &mut tern_cbor::encode::Encoder<S>) {
        encoder.emit_array(Some(2), |rec| {
            rec.emit_uint(ADMIN_RECORD_TYPE_CUSTODY_ACK);
            rec.emit_array(Some(2), |body| {
                self.flow_source_eid.emit(body);
                body.emit_array(None, |seqs| {
                    for seq in &self.sequence_nums {
                        seqs.emit_uint(*seq);
                    }
                });
            });
        });
    }

    /// Parses a full admin record, rejecting unimplemented record types.
    pub fn parse(decoder: &mut tern_cbor::decode::Decoder) -> Result<Self, Error> {
        match decoder.parse_array_header()? {
            tern_cbor::decode::ArrayLength::Definite(2) => {}
            _ => return Err(Error::MalformedExtension("administrative record")),
        }
        let record_type = decoder.parse_uint()?;
        if record_type != ADMIN_RECORD_TYPE_CUSTODY_ACK {
            return Err(Error::UnsupportedAdminRecord(record_type));
        }

        match decoder.parse_array_header()? {
            tern_cbor::decode::ArrayLength::Definite(2) => {}
            _ => return Err(Error::MalformedExtension("custody acknowledgement")),
        }
        let flow_source_eid = Eid::parse(decoder)?;

        let mut payload = Self {
            flow_source_eid,
            sequence_nums: SmallVec::new(),
        };
        match decoder.parse_array_header()? {
            tern_cbor::decode::ArrayLength::Indefinite => {
                while !decoder.at_break() {
                    if payload.sequence_nums.len() >= DACS_MAX_SEQ_PER_PAYLOAD {
                        return Err(Error::MalformedExtension("custody acknowledgement"));
                    }
                    payload.sequence_nums.push(decoder.parse_uint()?);
                }
                decoder.parse_break()?;
            }
            tern_cbor::decode::ArrayLength::Definite(n) => {
                if n > DACS_MAX_SEQ_PER_PAYLOAD {
                    return Err(Error::MalformedExtension("custody acknowledgement"));
                }
                for _ in 0..n {
                    payload.sequence_nums.push(decoder.parse_uint()?);
                }
            }
        }
        Ok(payload)
    }
}
