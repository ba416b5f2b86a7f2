/*!
Filesystem offload backend.

Persists a bundle's decoded-and-re-encoded form to a file keyed by a
monotonically increasing storage id, and reconstructs pool blocks from it
on restore. The record is a little-endian header
`{magic, num_blocks, num_bytes, crc32c}` followed by each block's native
fields; blocks with chunked (already encoded) content carry their content
offset/length and the raw chunk bytes, while typed extension content is
written field by field and re-encoded on the way back out.

Records live under the configured base directory as
`<base>/<sid[7:0]>/<sid[15:8]>/<sid[31:16]>.dat`, two hex digits for each
directory level.
*/

use std::path::PathBuf;
use tern_bpa::{OffloadBackend, Status};
use tern_bpv7::crc::CASTAGNOLI;
use tern_bpv7::{
    BlockFlags, BundleFlags, CanonicalBlock, CreationTimestamp, CrcType, CustodyAcceptPayload,
    DtnTime, Eid, ExtensionData, FragmentInfo, PrimaryBlock,
};
use tern_mpool::{AllocPriority, BlockId, DeliveryPolicy, Pool, stream};
use tracing::{debug, warn};

const RECORD_MAGIC: u32 = 0xDB5E_774E;
const HEADER_LEN: usize = 16;

/// Content written as raw encoded chunks (payload and unknown blocks).
const CONTENT_CHUNKED: u8 = 0;
const CONTENT_PREVIOUS_NODE: u8 = 1;
const CONTENT_BUNDLE_AGE: u8 = 2;
const CONTENT_HOP_COUNT: u8 = 3;
const CONTENT_CUSTODY_TRACKING: u8 = 4;
const CONTENT_CUSTODY_ACCEPT: u8 = 5;

pub struct FileOffload {
    base_dir: Option<PathBuf>,
    last_sid: u64,
    started: bool,
}

impl Default for FileOffload {
    fn default() -> Self {
        Self::new()
    }
}

impl FileOffload {
    pub fn new() -> Self {
        Self {
            base_dir: None,
            last_sid: 0,
            started: false,
        }
    }

    fn sid_path(&self, sid: u64) -> Result<PathBuf, Status> {
        let base = self.base_dir.as_ref().ok_or(Status::InvalidArgument)?;
        Ok(base
            .join(format!("{:02x}", sid & 0xFF))
            .join(format!("{:02x}", (sid >> 8) & 0xFF))
            .join(format!("{:08x}.dat", (sid >> 16) & 0xFFFF_FFFF)))
    }
}

struct RecordWriter {
    buf: Vec<u8>,
    num_blocks: u32,
}

impl RecordWriter {
    fn new() -> Self {
        Self {
            buf: vec![0; HEADER_LEN],
            num_blocks: 0,
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn put_u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    fn put_eid(&mut self, eid: &Eid) {
        match eid {
            Eid::Null => {
                self.put_u8(0);
                self.put_u64(0);
                self.put_u64(0);
            }
            Eid::Ipn { node, service } => {
                self.put_u8(1);
                self.put_u64(*node);
                self.put_u64(*service);
            }
        }
    }

    /// Seals the record: fills in the header and returns the bytes.
    fn seal(mut self) -> Vec<u8> {
        let num_bytes = (self.buf.len() - HEADER_LEN) as u32;
        let crc = CASTAGNOLI.checksum(&self.buf[HEADER_LEN..]);
        self.buf[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
        self.buf[4..8].copy_from_slice(&self.num_blocks.to_le_bytes());
        self.buf[8..12].copy_from_slice(&num_bytes.to_le_bytes());
        self.buf[12..16].copy_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

struct RecordReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Status> {
        let end = self.pos.checked_add(n).ok_or(Status::FormatError)?;
        if end > self.data.len() {
            return Err(Status::FormatError);
        }
        let s = &self.data[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, Status> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, Status> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, Status> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn eid(&mut self) -> Result<Eid, Status> {
        let marker = self.u8()?;
        let node = self.u64()?;
        let service = self.u64()?;
        match marker {
            0 => Ok(Eid::Null),
            1 => Ok(Eid::Ipn { node, service }),
            _ => Err(Status::FormatError),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn write_primary(w: &mut RecordWriter, pool: &Pool, pblk: BlockId) -> Result<(), Status> {
    let p = pool.primary(pblk).ok_or(Status::InvalidArgument)?;
    w.num_blocks += 1;
    w.put_u64(u64::from(p.logical.flags));
    w.put_u64(u64::from(p.logical.crc_type));
    w.put_eid(&p.logical.destination);
    w.put_eid(&p.logical.source);
    w.put_eid(&p.logical.report_to);
    w.put_u64(p.logical.timestamp.time.millisecs());
    w.put_u64(p.logical.timestamp.sequence_number);
    w.put_u64(p.logical.lifetime);
    match &p.logical.fragment_info {
        Some(f) => {
            w.put_u8(1);
            w.put_u64(f.offset);
            w.put_u64(f.total_adu_length);
        }
        None => {
            w.put_u8(0);
            w.put_u64(0);
            w.put_u64(0);
        }
    }
    w.put_u64(match p.delivery.delivery_policy {
        DeliveryPolicy::None => 0,
        DeliveryPolicy::LocalAck => 1,
        DeliveryPolicy::CustodyTracking => 2,
    });
    w.put_u64(p.delivery.local_retx_interval);
    Ok(())
}

fn write_canonical(w: &mut RecordWriter, pool: &Pool, cblk: BlockId) -> Result<(), Status> {
    let c = pool.canonical(cblk).ok_or(Status::InvalidArgument)?;
    w.num_blocks += 1;
    w.put_u64(u64::from(c.logical.block_type));
    w.put_u64(c.logical.block_num);
    w.put_u64(u64::from(c.logical.flags));
    w.put_u64(u64::from(c.logical.crc_type));

    match &c.extension {
        ExtensionData::Opaque => {
            w.put_u8(CONTENT_CHUNKED);
            let total = stream::chunk_list_len(pool, &c.chunks);
            w.put_u32(c.encoded_content_offset as u32);
            w.put_u32(c.encoded_content_length as u32);
            w.put_u32(total as u32);
            let start = w.buf.len();
            w.buf.resize(start + total, 0);
            let copied = stream::export(pool, &c.chunks, &mut w.buf[start..], 0, total);
            if copied != total {
                return Err(Status::InvalidArgument);
            }
        }
        ExtensionData::PreviousNode(eid) => {
            w.put_u8(CONTENT_PREVIOUS_NODE);
            w.put_eid(eid);
        }
        ExtensionData::BundleAge(age) => {
            w.put_u8(CONTENT_BUNDLE_AGE);
            w.put_u64(*age);
        }
        ExtensionData::HopCount { limit, count } => {
            w.put_u8(CONTENT_HOP_COUNT);
            w.put_u64(*limit);
            w.put_u64(*count);
        }
        ExtensionData::CustodyTracking(custodian) => {
            w.put_u8(CONTENT_CUSTODY_TRACKING);
            w.put_eid(custodian);
        }
        ExtensionData::CustodyAccept(payload) => {
            w.put_u8(CONTENT_CUSTODY_ACCEPT);
            w.put_eid(&payload.flow_source_eid);
            w.put_u32(payload.sequence_nums.len() as u32);
            for seq in &payload.sequence_nums {
                w.put_u64(*seq);
            }
        }
    }
    Ok(())
}

fn read_primary(r: &mut RecordReader, pool: &mut Pool) -> Result<BlockId, Status> {
    let pblk = pool
        .alloc_primary(AllocPriority::Medium)
        .ok_or(Status::ResourceExhausted)?;

    let result = (|| -> Result<(), Status> {
        let flags = BundleFlags::from(r.u64()?);
        let crc_type = CrcType::try_from(r.u64()?).map_err(|_| Status::FormatError)?;
        let destination = r.eid()?;
        let source = r.eid()?;
        let report_to = r.eid()?;
        let time = r.u64()?;
        let sequence_number = r.u64()?;
        let lifetime = r.u64()?;
        let frag_marker = r.u8()?;
        let frag_offset = r.u64()?;
        let frag_total = r.u64()?;
        let policy = r.u64()?;
        let retx = r.u64()?;

        let p = pool.primary_mut(pblk).ok_or(Status::InvalidArgument)?;
        p.logical = PrimaryBlock {
            flags,
            crc_type,
            destination,
            source,
            report_to,
            timestamp: CreationTimestamp {
                time: DtnTime::new(time),
                sequence_number,
            },
            lifetime,
            fragment_info: (frag_marker != 0).then_some(FragmentInfo {
                offset: frag_offset,
                total_adu_length: frag_total,
            }),
            crc_value: 0,
        };
        p.delivery.delivery_policy = match policy {
            0 => DeliveryPolicy::None,
            1 => DeliveryPolicy::LocalAck,
            2 => DeliveryPolicy::CustodyTracking,
            _ => return Err(Status::FormatError),
        };
        p.delivery.local_retx_interval = retx;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(pblk),
        Err(e) => {
            pool.recycle_block(pblk);
            Err(e)
        }
    }
}

fn read_canonical(r: &mut RecordReader, pool: &mut Pool, pblk: BlockId) -> Result<(), Status> {
    let block_type = tern_bpv7::BlockType::from(r.u64()?);
    let block_num = r.u64()?;
    let flags = BlockFlags::from(r.u64()?);
    let crc_type = CrcType::try_from(r.u64()?).map_err(|_| Status::FormatError)?;

    let cblk = pool
        .alloc_canonical(AllocPriority::Medium)
        .ok_or(Status::ResourceExhausted)?;
    // attach immediately so an unwind of the primary collects it
    pool.primary_mut(pblk)
        .ok_or(Status::InvalidArgument)?
        .cblocks
        .push(cblk);

    {
        let c = pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?;
        c.logical = CanonicalBlock {
            block_type,
            block_num,
            flags,
            crc_type,
            crc_value: 0,
        };
        c.parent = Some(pblk);
    }

    match r.u8()? {
        CONTENT_CHUNKED => {
            let offset = r.u32()? as usize;
            let length = r.u32()? as usize;
            let total = r.u32()? as usize;
            let bytes = r.take(total)?.to_vec();
            let mut w = stream::StreamWriter::new(CrcType::None);
            if w.write(pool, &bytes).is_err() {
                w.abort(pool);
                return Err(Status::ResourceExhausted);
            }
            let chunks = w.finish();
            let c = pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?;
            c.chunks = chunks;
            c.encoded_content_offset = offset;
            c.encoded_content_length = length;
            c.block_encode_size = Some(total);
        }
        CONTENT_PREVIOUS_NODE => {
            pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?.extension =
                ExtensionData::PreviousNode(r.eid()?);
        }
        CONTENT_BUNDLE_AGE => {
            pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?.extension =
                ExtensionData::BundleAge(r.u64()?);
        }
        CONTENT_HOP_COUNT => {
            let limit = r.u64()?;
            let count = r.u64()?;
            pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?.extension =
                ExtensionData::HopCount { limit, count };
        }
        CONTENT_CUSTODY_TRACKING => {
            pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?.extension =
                ExtensionData::CustodyTracking(r.eid()?);
        }
        CONTENT_CUSTODY_ACCEPT => {
            let flow_source_eid = r.eid()?;
            let count = r.u32()? as usize;
            if count > tern_bpv7::DACS_MAX_SEQ_PER_PAYLOAD {
                return Err(Status::FormatError);
            }
            let mut payload = CustodyAcceptPayload {
                flow_source_eid,
                sequence_nums: Default::default(),
            };
            for _ in 0..count {
                payload.sequence_nums.push(r.u64()?);
            }
            let c = pool.canonical_mut(cblk).ok_or(Status::InvalidArgument)?;
            c.extension = ExtensionData::CustodyAccept(payload);
            // the wire form demotes this to a type-1 payload; the content
            // tag is what identifies it across the record format
            c.logical.block_type = tern_bpv7::BlockType::CustodyAcceptPayload;
        }
        _ => return Err(Status::FormatError),
    }
    Ok(())
}

impl OffloadBackend for FileOffload {
    fn configure(&mut self, key: &str, value: &str) -> Result<(), Status> {
        match key {
            "base-dir" => {
                self.base_dir = Some(PathBuf::from(value));
                Ok(())
            }
            _ => Err(Status::InvalidArgument),
        }
    }

    fn start(&mut self) -> Result<(), Status> {
        let base = self.base_dir.as_ref().ok_or(Status::InvalidArgument)?;
        std::fs::create_dir_all(base).map_err(|_| Status::InvalidArgument)?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Status> {
        self.started = false;
        Ok(())
    }

    fn offload(&mut self, pool: &mut Pool, bundle: BlockId) -> Result<u64, Status> {
        if !self.started {
            return Err(Status::InvalidArgument);
        }

        // make sure every block has an encoded form worth persisting
        tern_bpa::compute_full_bundle_size(pool, bundle)?;

        let mut w = RecordWriter::new();
        write_primary(&mut w, pool, bundle)?;
        let cblocks = pool
            .primary(bundle)
            .ok_or(Status::InvalidArgument)?
            .cblocks
            .clone();
        for cblk in cblocks {
            write_canonical(&mut w, pool, cblk)?;
        }
        let record = w.seal();

        let sid = self.last_sid + 1;
        let path = self.sid_path(sid)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                warn!("mkdir {}: {e}", parent.display());
                Status::ResourceExhausted
            })?;
        }
        std::fs::write(&path, &record).map_err(|e| {
            warn!("write {}: {e}", path.display());
            Status::ResourceExhausted
        })?;

        self.last_sid = sid;
        debug!("offloaded bundle to {}", path.display());
        Ok(sid)
    }

    fn restore(&mut self, pool: &mut Pool, sid: u64) -> Result<BlockId, Status> {
        if !self.started {
            return Err(Status::InvalidArgument);
        }
        let path = self.sid_path(sid)?;
        let data = std::fs::read(&path).map_err(|_| Status::NotFound)?;
        if data.len() < HEADER_LEN {
            return Err(Status::FormatError);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let num_blocks = u32::from_le_bytes(data[4..8].try_into().unwrap());
        let num_bytes = u32::from_le_bytes(data[8..12].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(data[12..16].try_into().unwrap());
        if magic != RECORD_MAGIC || data.len() - HEADER_LEN != num_bytes {
            return Err(Status::FormatError);
        }
        if CASTAGNOLI.checksum(&data[HEADER_LEN..]) != crc {
            return Err(Status::FormatError);
        }

        let mut r = RecordReader {
            data: &data[HEADER_LEN..],
            pos: 0,
        };
        if num_blocks == 0 {
            return Err(Status::FormatError);
        }
        let pblk = read_primary(&mut r, pool)?;

        let result = (|| -> Result<(), Status> {
            for _ in 1..num_blocks {
                read_canonical(&mut r, pool, pblk)?;
            }
            if !r.at_end() {
                return Err(Status::FormatError);
            }
            Ok(())
        })();

        match result {
            Ok(()) => Ok(pblk),
            Err(e) => {
                // discard every block reconstructed during this call
                pool.recycle_block(pblk);
                Err(e)
            }
        }
    }

    fn release(&mut self, sid: u64) -> Result<(), Status> {
        let path = self.sid_path(sid)?;
        std::fs::remove_file(&path).map_err(|_| Status::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_bpv7::{BlockType, BundleFlags};

    fn build_reference_bundle(pool: &mut Pool) -> BlockId {
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
            lifetime: 3_600_000,
            fragment_info: None,
            crc_value: 0,
        };

        let cblk = pool.alloc_canonical(AllocPriority::High).unwrap();
        let c = pool.canonical_mut(cblk).unwrap();
        c.logical = CanonicalBlock {
            block_type: BlockType::Payload,
            block_num: 1,
            crc_type: CrcType::Crc16X25,
            ..Default::default()
        };
        c.parent = Some(pblk);
        tern_bpa::encode_canonical(pool, cblk, Some(&[0xAA; 20])).unwrap();
        pool.primary_mut(pblk).unwrap().cblocks.push(cblk);
        pblk
    }

    fn started_backend(dir: &std::path::Path) -> FileOffload {
        let mut backend = FileOffload::new();
        backend
            .configure("base-dir", dir.to_str().unwrap())
            .unwrap();
        backend.start().unwrap();
        backend
    }

    #[test]
    fn offload_restore_is_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = started_backend(tmp.path());
        let mut pool = Pool::new(128);

        let pblk = build_reference_bundle(&mut pool);
        let mut original = vec![0u8; 128];
        let n = tern_bpa::copy_full_bundle_out(&mut pool, pblk, &mut original).unwrap();
        original.truncate(n);
        assert_eq!(n, 72);

        let sid = backend.offload(&mut pool, pblk).unwrap();
        let restored = backend.restore(&mut pool, sid).unwrap();

        let mut round = vec![0u8; 128];
        let n2 = tern_bpa::copy_full_bundle_out(&mut pool, restored, &mut round).unwrap();
        round.truncate(n2);
        assert_eq!(original, round);
    }

    #[test]
    fn record_file_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = started_backend(tmp.path());
        let mut pool = Pool::new(128);
        let pblk = build_reference_bundle(&mut pool);

        let sid = backend.offload(&mut pool, pblk).unwrap();
        assert_eq!(sid, 1);
        let path = tmp.path().join("01").join("00").join("00000000.dat");
        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[0..4], &RECORD_MAGIC.to_le_bytes());
        // primary + payload
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 2);
    }

    #[test]
    fn corrupt_record_detected_and_unwound() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = started_backend(tmp.path());
        let mut pool = Pool::new(128);
        let pblk = build_reference_bundle(&mut pool);
        let sid = backend.offload(&mut pool, pblk).unwrap();

        let path = backend.sid_path(sid).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let baseline = pool.counts();
        assert_eq!(backend.restore(&mut pool, sid).unwrap_err(), Status::FormatError);
        pool.maintain_to_empty();
        assert_eq!(pool.counts(), baseline);
    }

    #[test]
    fn release_removes_the_record() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = started_backend(tmp.path());
        let mut pool = Pool::new(128);
        let pblk = build_reference_bundle(&mut pool);
        let sid = backend.offload(&mut pool, pblk).unwrap();

        backend.release(sid).unwrap();
        assert_eq!(backend.restore(&mut pool, sid).unwrap_err(), Status::NotFound);
        assert_eq!(backend.release(sid).unwrap_err(), Status::NotFound);
    }

    #[test]
    fn unknown_configure_key_rejected() {
        let mut backend = FileOffload::new();
        assert_eq!(
            backend.configure("cache-size", "12").unwrap_err(),
            Status::InvalidArgument
        );
    }
}
