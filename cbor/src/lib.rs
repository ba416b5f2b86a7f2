/*!
A small RFC 8949 CBOR encoder/decoder covering the subset of the format used
by the Bundle Protocol: unsigned integers, byte strings, text strings,
definite- and indefinite-length arrays, and the break code.

The encoder writes through a pluggable [`encode::Sink`] so callers can stream
directly into non-contiguous buffers; the decoder parses from a contiguous
byte slice and reports how many bytes each item consumed.
*/

pub mod decode;
pub mod encode;
