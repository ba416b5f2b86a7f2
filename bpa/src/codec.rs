/*!
Pool-level bundle assembly.

The per-block codecs in `tern-bpv7` produce and consume contiguous byte
vectors; this module moves those bytes in and out of pool chunk lists and
maintains the encode-size caches. A bundle on the wire is an
indefinite-length CBOR array: opener, primary block, canonical blocks,
break code.
*/

use crate::status::Status;
use tern_bpv7::{CanonicalBlock, PrimaryBlock};
use tern_mpool::{AllocPriority, BlockId, Pool, stream};

const BUNDLE_OPEN: u8 = 0x9F;
const BUNDLE_CLOSE: u8 = 0xFF;

fn write_to_chunks(pool: &mut Pool, bytes: &[u8]) -> Result<Vec<BlockId>, Status> {
    let mut w = stream::StreamWriter::new(tern_bpv7::CrcType::None);
    match w.write(pool, bytes) {
        Ok(()) => Ok(w.finish()),
        Err(_) => {
            w.abort(pool);
            Err(Status::ResourceExhausted)
        }
    }
}

/// Encodes a primary block's logical data into its chunk list, refreshing
/// the size cache. No-op when already encoded.
pub fn encode_primary(pool: &mut Pool, pblk: BlockId) -> Result<(), Status> {
    let p = pool.primary(pblk).ok_or(Status::InvalidArgument)?;
    if !p.chunks.is_empty() {
        return Ok(());
    }
    let (bytes, crc_value) = p.logical.emit();
    let chunks = write_to_chunks(pool, &bytes)?;
    let p = pool.primary_mut(pblk).ok_or(Status::InvalidArgument)?;
    p.logical.crc_value = crc_value;
    p.block_encode_size = Some(bytes.len());
    p.chunks = chunks;
    Ok(())
}

/// Encodes a canonical block into its chunk list. Structured extension
/// content is (re)generated from the typed data; opaque content must be
/// supplied by the caller on first encode.
pub fn encode_canonical(
    pool: &mut Pool,
    cblk: BlockId,
    opaque_content: Option<&[u8]>,
) -> Result<(), Status> {
    let c = pool.canonical(cblk).ok_or(Status::InvalidArgument)?;
    if !c.chunks.is_empty() {
        return Ok(());
    }
    let structured = c.extension.emit_content();
    let content = match (&structured, opaque_content) {
        (Some(bytes), _) => bytes.as_slice(),
        (None, Some(bytes)) => bytes,
        (None, None) => return Err(Status::InvalidArgument),
    };
    let (bytes, content_range, crc_value) = c.logical.emit_with_content(content);
    let chunks = write_to_chunks(pool, &bytes)?;
    let c = pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?;
    c.logical.crc_value = crc_value;
    c.encoded_content_offset = content_range.start;
    c.encoded_content_length = content_range.len();
    c.block_encode_size = Some(bytes.len());
    c.chunks = chunks;
    Ok(())
}

/// Drops a canonical block's encoded form so the next encode regenerates
/// it; used after mutating structured content (e.g. rewriting the
/// custodian).
pub fn invalidate_canonical(pool: &mut Pool, cblk: BlockId) {
    let Some(c) = pool.canonical_mut(cblk) else {
        return;
    };
    let chunks = core::mem::take(&mut c.chunks);
    c.block_encode_size = None;
    c.encoded_content_offset = 0;
    c.encoded_content_length = 0;
    for chunk in chunks {
        pool.recycle_block(chunk);
    }
    if let Some(parent) = pool.canonical(cblk).and_then(|c| c.parent) {
        if let Some(p) = pool.primary_mut(parent) {
            p.bundle_encode_size = None;
        }
    }
}

/// Encodes any not-yet-encoded blocks and returns the full wire size of
/// the bundle, caching the result.
pub fn compute_full_bundle_size(pool: &mut Pool, pblk: BlockId) -> Result<usize, Status> {
    if let Some(p) = pool.primary(pblk) {
        if let Some(size) = p.bundle_encode_size {
            return Ok(size);
        }
    } else {
        return Err(Status::InvalidArgument);
    }

    encode_primary(pool, pblk)?;
    let cblocks = pool
        .primary(pblk)
        .map(|p| p.cblocks.clone())
        .ok_or(Status::InvalidArgument)?;
    // opener + primary + canonical blocks + break code
    let mut total = 2 + pool
        .primary(pblk)
        .and_then(|p| p.block_encode_size)
        .ok_or(Status::InvalidArgument)?;
    for cblk in cblocks {
        encode_canonical(pool, cblk, None)?;
        total += pool
            .canonical(cblk)
            .and_then(|c| c.block_encode_size)
            .ok_or(Status::InvalidArgument)?;
    }
    pool.primary_mut(pblk)
        .ok_or(Status::InvalidArgument)?
        .bundle_encode_size = Some(total);
    Ok(total)
}

/// Concatenates the bundle's per-block chunk lists into `out` with the
/// indefinite-array wrapper added; returns the number of bytes written.
pub fn copy_full_bundle_out(pool: &mut Pool, pblk: BlockId, out: &mut [u8]) -> Result<usize, Status> {
    let total = compute_full_bundle_size(pool, pblk)?;
    if out.len() < total {
        return Err(Status::ResourceExhausted);
    }

    let mut pos = 0;
    out[pos] = BUNDLE_OPEN;
    pos += 1;

    let p = pool.primary(pblk).ok_or(Status::InvalidArgument)?;
    let primary_chunks = p.chunks.clone();
    let cblocks = p.cblocks.clone();
    pos += stream::export(pool, &primary_chunks, &mut out[pos..], 0, usize::MAX);
    for cblk in cblocks {
        let chunks = pool
            .canonical(cblk)
            .map(|c| c.chunks.clone())
            .ok_or(Status::InvalidArgument)?;
        pos += stream::export(pool, &chunks, &mut out[pos..], 0, usize::MAX);
    }

    out[pos] = BUNDLE_CLOSE;
    pos += 1;
    if pos != total {
        return Err(Status::FormatError);
    }
    Ok(pos)
}

/// Decodes a full bundle from wire bytes into pool blocks, returning the
/// primary block and the number of bytes consumed. Any decode error
/// discards every block allocated during this call.
pub fn copy_full_bundle_in(pool: &mut Pool, data: &[u8]) -> Result<(BlockId, usize), Status> {
    if data.first() != Some(&BUNDLE_OPEN) {
        return Err(Status::FormatError);
    }

    let pblk = pool
        .alloc_primary(AllocPriority::Low)
        .ok_or(Status::ResourceExhausted)?;

    match copy_bundle_blocks_in(pool, pblk, &data[1..]) {
        Ok(consumed) => Ok((pblk, 1 + consumed)),
        Err(status) => {
            // unwind everything allocated during this call
            pool.recycle_block(pblk);
            Err(status)
        }
    }
}

fn copy_bundle_blocks_in(pool: &mut Pool, pblk: BlockId, data: &[u8]) -> Result<usize, Status> {
    let (primary, primary_len) =
        PrimaryBlock::parse(data).map_err(|_| Status::FormatError)?;
    let is_admin_record = primary.flags.is_admin_record;
    let chunks = write_to_chunks(pool, &data[..primary_len])?;
    {
        let p = pool.primary_mut(pblk).ok_or(Status::InvalidArgument)?;
        p.logical = primary;
        p.block_encode_size = Some(primary_len);
        p.chunks = chunks;
    }

    let mut pos = primary_len;
    loop {
        match data.get(pos) {
            None => return Err(Status::FormatError),
            Some(&BUNDLE_CLOSE) => {
                pos += 1;
                break;
            }
            Some(_) => {}
        }

        let (logical, extension, content_range, block_len) =
            CanonicalBlock::parse(&data[pos..], is_admin_record)
                .map_err(|_| Status::FormatError)?;

        let cblk = pool
            .alloc_canonical(AllocPriority::Low)
            .ok_or(Status::ResourceExhausted)?;
        // attach before filling in, so an unwind of the primary collects it
        pool.primary_mut(pblk)
            .ok_or(Status::InvalidArgument)?
            .cblocks
            .push(cblk);

        let chunks = write_to_chunks(pool, &data[pos..pos + block_len])?;
        let c = pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?;
        c.logical = logical;
        c.extension = extension;
        c.encoded_content_offset = content_range.start;
        c.encoded_content_length = content_range.len();
        c.block_encode_size = Some(block_len);
        c.chunks = chunks;
        c.parent = Some(pblk);

        pos += block_len;
    }

    Ok(pos)
}

/// Finds the first attached canonical block of the given type.
pub fn locate_canonical(
    pool: &Pool,
    pblk: BlockId,
    block_type: tern_bpv7::BlockType,
) -> Option<BlockId> {
    pool.primary(pblk)?
        .cblocks
        .iter()
        .copied()
        .find(|&cblk| {
            pool.canonical(cblk)
                .is_some_and(|c| c.logical.block_type == block_type)
        })
}

/// Copies a canonical block's content bytes (e.g. the payload ADU) into
/// `out`, returning the number of bytes copied.
pub fn export_content(pool: &Pool, cblk: BlockId, out: &mut [u8]) -> Result<usize, Status> {
    let c = pool.canonical(cblk).ok_or(Status::InvalidArgument)?;
    let (offset, length) = (c.encoded_content_offset, c.encoded_content_length);
    if out.len() < length {
        return Err(Status::ResourceExhausted);
    }
    let chunks = c.chunks.clone();
    Ok(stream::export(pool, &chunks, out, offset, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use tern_bpv7::{
        BlockFlags, BundleFlags, CanonicalBlock, CreationTimestamp, CrcType, DtnTime, Eid,
        PrimaryBlock,
    };

    fn build_sample_bundle(pool: &mut Pool) -> BlockId {
        let pblk = pool.alloc_primary(AllocPriority::High).unwrap();
        let p = pool.primary_mut(pblk).unwrap();
        p.logical = PrimaryBlock {
            flags: BundleFlags {
                must_not_fragment: true,
                ..Default::default()
            },
            crc_type: CrcType::Crc16X25,
            destination: Eid::Ipn {
                node: 200,
                service: 1,
            },
            source: Eid::Ipn {
                node: 100,
                service: 1,
            },
            report_to: Eid::Ipn {
                node: 100,
                service: 1,
            },
            timestamp: CreationTimestamp {
                time: DtnTime::new(755533838904),
                sequence_number: 0,
            },
            lifetime: 3600000,
            fragment_info: None,
            crc_value: 0,
        };

        let cblk = pool.alloc_canonical(AllocPriority::High).unwrap();
        let c = pool.canonical_mut(cblk).unwrap();
        c.logical = CanonicalBlock {
            block_type: tern_bpv7::BlockType::Payload,
            block_num: 1,
            flags: BlockFlags::default(),
            crc_type: CrcType::Crc16X25,
            crc_value: 0,
        };
        c.parent = Some(pblk);
        encode_canonical(pool, cblk, Some(&[0xAA; 20])).unwrap();

        pool.primary_mut(pblk).unwrap().cblocks.push(cblk);
        pblk
    }

    /// The encode + CRC round-trip of the primary-and-payload reference
    /// bundle: exact wire prefix, CRCs, length and trailer.
    #[test]
    fn full_bundle_known_vector() {
        let mut pool = Pool::new(64);
        let pblk = build_sample_bundle(&mut pool);

        let size = compute_full_bundle_size(&mut pool, pblk).unwrap();
        assert_eq!(size, 72);

        let mut out = vec![0u8; size];
        let n = copy_full_bundle_out(&mut pool, pblk, &mut out).unwrap();
        assert_eq!(n, 72);

        assert_eq!(
            &out[..24],
            &hex!("9f 89 07 04 01 82 02 82 18 c8 01 82 02 82 18 64 01 82 02 82 18 64 01 82")
        );
        assert_eq!(out[71], 0xFF);
        assert_eq!(pool.primary(pblk).unwrap().logical.crc_value, 0x0B19);
        let payload = pool.primary(pblk).unwrap().cblocks[0];
        assert_eq!(pool.canonical(payload).unwrap().logical.crc_value, 0xC68F);
    }

    /// copy-out of copy-in reproduces the input byte-for-byte.
    #[test]
    fn wire_round_trip_identity() {
        let mut pool = Pool::new(64);
        let pblk = build_sample_bundle(&mut pool);
        let mut wire = vec![0u8; 72];
        copy_full_bundle_out(&mut pool, pblk, &mut wire).unwrap();

        let (reparsed, consumed) = copy_full_bundle_in(&mut pool, &wire).unwrap();
        assert_eq!(consumed, wire.len());

        let mut wire2 = vec![0u8; 72];
        let n = copy_full_bundle_out(&mut pool, reparsed, &mut wire2).unwrap();
        assert_eq!(n, wire.len());
        assert_eq!(wire, wire2);
    }

    #[test]
    fn decode_error_unwinds_all_allocations() {
        let mut pool = Pool::new(64);
        let pblk = build_sample_bundle(&mut pool);
        let mut wire = vec![0u8; 72];
        copy_full_bundle_out(&mut pool, pblk, &mut wire).unwrap();
        let baseline = pool.counts();

        // corrupt the payload block CRC
        let len = wire.len();
        wire[len - 2] ^= 0xFF;
        assert_eq!(
            copy_full_bundle_in(&mut pool, &wire).unwrap_err(),
            Status::FormatError
        );
        pool.maintain_to_empty();
        assert_eq!(pool.counts(), baseline);
    }

    #[test]
    fn truncated_bundle_rejected() {
        let mut pool = Pool::new(64);
        assert_eq!(
            copy_full_bundle_in(&mut pool, &[0x9F, 0x89, 0x07]).unwrap_err(),
            Status::FormatError
        );
        assert_eq!(
            copy_full_bundle_in(&mut pool, &[0x82]).unwrap_err(),
            Status::FormatError
        );
    }

    #[test]
    fn payload_content_export() {
        let mut pool = Pool::new(64);
        let pblk = build_sample_bundle(&mut pool);
        let payload = locate_canonical(&pool, pblk, tern_bpv7::BlockType::Payload).unwrap();
        let mut buf = [0u8; 32];
        let n = export_content(&pool, payload, &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xAA; 20]);
    }
}
