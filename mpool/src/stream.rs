/*!
Chunked byte streams over pool CBOR-data blocks.

A writer appends bytes into fixed-capacity chunk blocks allocated on demand,
optionally feeding an online CRC digest as it goes. Forward seeks zero-fill
(and the fill is digested like ordinary data); backward seeks trim and
discard chunks. Patching rewrites bytes already emitted *without* touching
the digest - that asymmetry is what makes the circular block CRC possible:
the encoder streams a zero placeholder through the digest, then patches the
finalized value over it.

Closing a writer that has not been handed off recycles every pending chunk,
so a failed encode unwinds without leaking pool blocks.
*/

use crate::pool::{AllocPriority, BlockId, Pool};
use tern_bpv7::CrcType;
use tern_bpv7::crc::{CASTAGNOLI, X25};
use thiserror::Error;

/// Usable bytes per CBOR-data chunk block.
pub const CHUNK_CAPACITY: usize = 256;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StreamError {
    /// Chunk allocation was refused; recoverable back-pressure.
    #[error("Pool exhausted while extending stream")]
    OutOfMemory,

    /// Seek or patch addressed bytes outside the stream.
    #[error("Stream position out of range")]
    OutOfRange,
}

enum StreamDigest {
    None,
    Crc16(::crc::Digest<'static, u16>),
    Crc32(::crc::Digest<'static, u32>),
}

impl StreamDigest {
    fn new(crc_type: CrcType) -> Self {
        match crc_type {
            CrcType::None => Self::None,
            CrcType::Crc16X25 => Self::Crc16(X25.digest()),
            CrcType::Crc32Castagnoli => Self::Crc32(CASTAGNOLI.digest()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::None => {}
            Self::Crc16(d) => d.update(bytes),
            Self::Crc32(d) => d.update(bytes),
        }
    }

    fn finalize(self) -> u64 {
        match self {
            Self::None => 0,
            Self::Crc16(d) => d.finalize() as u64,
            Self::Crc32(d) => d.finalize() as u64,
        }
    }
}

/// A write-direction stream building a chunk list in the pool.
pub struct StreamWriter {
    chunks: Vec<BlockId>,
    len: usize,
    digest: StreamDigest,
}

impl StreamWriter {
    pub fn new(crc_type: CrcType) -> Self {
        Self {
            chunks: Vec::new(),
            len: 0,
            digest: StreamDigest::new(crc_type),
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends bytes, allocating chunk blocks on demand and feeding the
    /// digest. On allocation failure the bytes written so far remain
    /// intact.
    pub fn write(&mut self, pool: &mut Pool, mut bytes: &[u8]) -> Result<(), StreamError> {
        while !bytes.is_empty() {
            let space = match self.chunks.last() {
                Some(&last) => {
                    let chunk = pool.cbor_chunk(last).expect("chunk list corrupt");
                    CHUNK_CAPACITY - chunk.data.len()
                }
                None => 0,
            };
            if space == 0 {
                let blk = pool
                    .alloc_cbor(AllocPriority::Medium)
                    .ok_or(StreamError::OutOfMemory)?;
                self.chunks.push(blk);
                continue;
            }
            let take = space.min(bytes.len());
            let last = *self.chunks.last().unwrap();
            let chunk = pool.cbor_chunk_mut(last).expect("chunk list corrupt");
            chunk.data.extend_from_slice(&bytes[..take]);
            self.digest.update(&bytes[..take]);
            self.len += take;
            bytes = &bytes[take..];
        }
        Ok(())
    }

    /// Seeks to an absolute position: forward fills with zeros (digested
    /// like written data), backward trims and discards chunks.
    pub fn seek(&mut self, pool: &mut Pool, to: usize) -> Result<(), StreamError> {
        use core::cmp::Ordering;
        match to.cmp(&self.len) {
            Ordering::Equal => Ok(()),
            Ordering::Greater => {
                const ZEROS: [u8; 32] = [0; 32];
                let mut remaining = to - self.len;
                while remaining > 0 {
                    let n = remaining.min(ZEROS.len());
                    self.write(pool, &ZEROS[..n])?;
                    remaining -= n;
                }
                Ok(())
            }
            Ordering::Less => {
                let mut keep = to;
                let mut retained = Vec::new();
                for &blk in &self.chunks {
                    let chunk_len = pool.cbor_chunk(blk).expect("chunk list corrupt").data.len();
                    if keep == 0 {
                        pool.recycle_block(blk);
                    } else if keep >= chunk_len {
                        retained.push(blk);
                        keep -= chunk_len;
                    } else {
                        pool.cbor_chunk_mut(blk)
                            .expect("chunk list corrupt")
                            .data
                            .truncate(keep);
                        retained.push(blk);
                        keep = 0;
                    }
                }
                self.chunks = retained;
                self.len = to;
                Ok(())
            }
        }
    }

    /// Overwrites previously written bytes in place. The digest is not
    /// updated; the circular CRC of a block covers the placeholder zeros,
    /// not the patched value.
    pub fn patch(
        &mut self,
        pool: &mut Pool,
        mut offset: usize,
        mut bytes: &[u8],
    ) -> Result<(), StreamError> {
        if offset + bytes.len() > self.len {
            return Err(StreamError::OutOfRange);
        }
        for &blk in &self.chunks {
            if bytes.is_empty() {
                break;
            }
            let chunk = pool.cbor_chunk_mut(blk).expect("chunk list corrupt");
            let chunk_len = chunk.data.len();
            if offset >= chunk_len {
                offset -= chunk_len;
                continue;
            }
            let n = (chunk_len - offset).min(bytes.len());
            chunk.data[offset..offset + n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            offset = 0;
        }
        Ok(())
    }

    /// Finalizes and returns the running CRC; subsequent writes no longer
    /// feed a digest.
    pub fn finalize_crc(&mut self) -> u64 {
        core::mem::replace(&mut self.digest, StreamDigest::None).finalize()
    }

    /// Hands the chunk list off to the caller; the stream is complete.
    pub fn finish(mut self) -> Vec<BlockId> {
        core::mem::take(&mut self.chunks)
    }

    /// Abandons an unfinished write, recycling all pending chunks.
    pub fn abort(mut self, pool: &mut Pool) {
        for blk in core::mem::take(&mut self.chunks) {
            pool.recycle_block(blk);
        }
    }
}

/// A read-direction stream iterating an existing chunk list.
pub struct StreamReader<'a> {
    chunks: &'a [BlockId],
    chunk_index: usize,
    chunk_offset: usize,
    digest: StreamDigest,
}

impl<'a> StreamReader<'a> {
    pub fn new(chunks: &'a [BlockId]) -> Self {
        Self::with_crc(chunks, CrcType::None)
    }

    /// A reader that digests everything it reads, for end-of-stream
    /// validation against a stored CRC.
    pub fn with_crc(chunks: &'a [BlockId], crc_type: CrcType) -> Self {
        Self {
            chunks,
            chunk_index: 0,
            chunk_offset: 0,
            digest: StreamDigest::new(crc_type),
        }
    }

    /// Reads up to `buf.len()` bytes; returns the number read, zero at the
    /// end of the stream.
    pub fn read(&mut self, pool: &Pool, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < buf.len() && self.chunk_index < self.chunks.len() {
            let chunk = pool
                .cbor_chunk(self.chunks[self.chunk_index])
                .expect("chunk list corrupt");
            let avail = &chunk.data[self.chunk_offset..];
            if avail.is_empty() {
                self.chunk_index += 1;
                self.chunk_offset = 0;
                continue;
            }
            let n = avail.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&avail[..n]);
            self.digest.update(&avail[..n]);
            copied += n;
            self.chunk_offset += n;
        }
        copied
    }

    pub fn finalize_crc(&mut self) -> u64 {
        core::mem::replace(&mut self.digest, StreamDigest::None).finalize()
    }
}

/// Copies a sub-range of an encoded chunk list into a contiguous buffer;
/// returns the number of bytes copied.
pub fn export(
    pool: &Pool,
    chunks: &[BlockId],
    out: &mut [u8],
    skip: usize,
    max_bytes: usize,
) -> usize {
    let mut remaining_skip = skip;
    let mut copied = 0;
    let want = max_bytes.min(out.len());
    for &blk in chunks {
        if copied >= want {
            break;
        }
        let Some(chunk) = pool.cbor_chunk(blk) else {
            break;
        };
        let data = &chunk.data;
        if remaining_skip >= data.len() {
            remaining_skip -= data.len();
            continue;
        }
        let data = &data[remaining_skip..];
        remaining_skip = 0;
        let n = data.len().min(want - copied);
        out[copied..copied + n].copy_from_slice(&data[..n]);
        copied += n;
    }
    copied
}

/// Total byte length of a chunk list.
pub fn chunk_list_len(pool: &Pool, chunks: &[BlockId]) -> usize {
    chunks
        .iter()
        .filter_map(|&b| pool.cbor_chunk(b))
        .map(|c| c.data.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_bpv7::crc;

    #[test]
    fn write_read_round_trip_across_chunks() {
        let mut pool = Pool::new(32);
        let mut w = StreamWriter::new(CrcType::None);
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        w.write(&mut pool, &data).unwrap();
        assert_eq!(w.len(), 1000);
        let chunks = w.finish();
        assert!(chunks.len() > 1);

        let mut r = StreamReader::new(&chunks);
        let mut out = vec![0u8; 1000];
        assert_eq!(r.read(&pool, &mut out), 1000);
        assert_eq!(out, data);
        assert_eq!(r.read(&pool, &mut out), 0);
    }

    #[test]
    fn online_crc_matches_one_shot() {
        let mut pool = Pool::new(32);
        let mut w = StreamWriter::new(CrcType::Crc32Castagnoli);
        w.write(&mut pool, b"123456789").unwrap();
        assert_eq!(w.finalize_crc(), 0xE3069283);
        w.finish();
    }

    #[test]
    fn patch_does_not_disturb_digest() {
        let mut pool = Pool::new(32);

        // digest the placeholder zeros, then patch real bytes over them
        let mut w = StreamWriter::new(CrcType::Crc16X25);
        w.write(&mut pool, b"12345").unwrap();
        w.write(&mut pool, &[0, 0]).unwrap();
        let crc = w.finalize_crc();
        w.patch(&mut pool, 5, &[0xAB, 0xCD]).unwrap();
        let chunks = w.finish();

        let expected = crc::compute(CrcType::Crc16X25, b"12345\0\0");
        assert_eq!(crc, expected);

        let mut out = [0u8; 7];
        let mut r = StreamReader::new(&chunks);
        assert_eq!(r.read(&pool, &mut out), 7);
        assert_eq!(&out[5..], &[0xAB, 0xCD]);
    }

    #[test]
    fn forward_seek_zero_fills() {
        let mut pool = Pool::new(32);
        let mut w = StreamWriter::new(CrcType::None);
        w.write(&mut pool, b"ab").unwrap();
        w.seek(&mut pool, 6).unwrap();
        w.write(&mut pool, b"cd").unwrap();
        let chunks = w.finish();

        let mut out = [0xFFu8; 8];
        let mut r = StreamReader::new(&chunks);
        assert_eq!(r.read(&pool, &mut out), 8);
        assert_eq!(&out, b"ab\0\0\0\0cd");
    }

    #[test]
    fn backward_seek_trims_and_recycles() {
        let mut pool = Pool::new(32);
        let mut w = StreamWriter::new(CrcType::None);
        w.write(&mut pool, &[0x55u8; 600]).unwrap();
        let before = pool.counts().alloced;
        w.seek(&mut pool, 100).unwrap();
        assert_eq!(w.len(), 100);
        // chunks past the cut point went to the recycle list
        assert!(pool.counts().alloced < before);
        let chunks = w.finish();
        assert_eq!(chunk_list_len(&pool, &chunks), 100);
    }

    #[test]
    fn abort_recycles_everything() {
        let mut pool = Pool::new(32);
        let mut w = StreamWriter::new(CrcType::None);
        w.write(&mut pool, &[1u8; 300]).unwrap();
        assert!(pool.counts().alloced > 0);
        w.abort(&mut pool);
        pool.maintain_to_empty();
        assert_eq!(pool.counts().free, 32);
    }

    #[test]
    fn export_subrange() {
        let mut pool = Pool::new(32);
        let mut w = StreamWriter::new(CrcType::None);
        let data: Vec<u8> = (0..512u32).map(|i| i as u8).collect();
        w.write(&mut pool, &data).unwrap();
        let chunks = w.finish();

        let mut out = [0u8; 64];
        let n = export(&pool, &chunks, &mut out, 250, 64);
        assert_eq!(n, 64);
        assert_eq!(&out[..], &data[250..314]);

        // short tail
        let n = export(&pool, &chunks, &mut out, 500, 64);
        assert_eq!(n, 12);
    }
}
