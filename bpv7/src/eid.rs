use super::*;

/// An endpoint identifier.
///
/// Only the `ipn` numeric scheme is implemented at the byte level; the
/// `dtn:none` null endpoint is accepted because RFC 9171 requires it as a
/// report-to value.
#[derive(Default, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Eid {
    /// `dtn:none`, the null endpoint.
    #[default]
    Null,
    /// `ipn:<node>.<service>`.
    Ipn { node: u64, service: u64 },
}

const SCHEME_DTN: u64 = 1;
const SCHEME_IPN: u64 = 2;

impl Eid {
    /// Node number, zero for the null endpoint.
    pub fn node_number(&self) -> u64 {
        match self {
            Eid::Null => 0,
            Eid::Ipn { node, .. } => *node,
        }
    }

    pub fn service_number(&self) -> u64 {
        match self {
            Eid::Null => 0,
            Eid::Ipn { service, .. } => *service,
        }
    }

    pub fn emit<S: tern_cbor::encode::Sink>(&self, encoder: &mut tern_cbor::encode::Encoder<S>) {
        encoder.emit_array(Some(2), |a| match self {
            Eid::Null => {
                a.emit_uint(SCHEME_DTN);
                a.emit_uint(0);
            }
            Eid::Ipn { node, service } => {
                a.emit_uint(SCHEME_IPN);
                a.emit_array(Some(2), |ssp| {
                    ssp.emit_uint(*node);
                    ssp.emit_uint(*service);
                });
            }
        });
    }

    pub fn parse(decoder: &mut tern_cbor::decode::Decoder) -> Result<Self, Error> {
        match decoder.parse_array_header()? {
            tern_cbor::decode::ArrayLength::Definite(2) => {}
            _ => return Err(Error::MalformedSsp),
        }
        match decoder.parse_uint()? {
            SCHEME_DTN => {
                // the only dtn-scheme value carried is `none`, encoded as 0
                if decoder.parse_uint()? != 0 {
                    return Err(Error::MalformedSsp);
                }
                Ok(Eid::Null)
            }
            SCHEME_IPN => {
                match decoder.parse_array_header()? {
                    tern_cbor::decode::ArrayLength::Definite(2) => {}
                    _ => return Err(Error::MalformedSsp),
                }
                let node = decoder.parse_uint()?;
                let service = decoder.parse_uint()?;
                Ok(Eid::Ipn { node, service })
            }
            scheme => Err(Error::UnsupportedScheme(scheme)),
        }
    }
}

impl core::fmt::Display for Eid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Eid::Null => write!(f, "dtn:none"),
            Eid::Ipn { node, service } => write!(f, "ipn:{node}.{service}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn round_trip(eid: Eid, expected: &[u8]) {
        let bytes = tern_cbor::encode::emit(|e| eid.emit(e));
        assert_eq!(bytes, expected);
        let mut d = tern_cbor::decode::Decoder::new(&bytes);
        assert_eq!(Eid::parse(&mut d).unwrap(), eid);
        assert!(d.at_end());
    }

    #[test]
    fn ipn_round_trip() {
        round_trip(
            Eid::Ipn {
                node: 200,
                service: 1,
            },
            &hex!("82 02 82 18c8 01"),
        );
    }

    #[test]
    fn dtn_none_round_trip() {
        round_trip(Eid::Null, &hex!("82 01 00"));
    }

    #[test]
    fn unknown_scheme_rejected() {
        let mut d = tern_cbor::decode::Decoder::new(&hex!("82 03 00"));
        assert!(matches!(
            Eid::parse(&mut d),
            Err(Error::UnsupportedScheme(3))
        ));
    }
}
