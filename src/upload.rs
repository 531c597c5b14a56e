//! Chunked transfer of a single blob via START_DATA / MID_DATA / END_DATA

use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use embedded_hal::blocking::delay::DelayMs;

use crate::codec::Codec;
use crate::partition::PartitionName;
use crate::protocol::{Command, CRC_LEN};
use crate::{wire_len, ConfigError, Error, SerialPort};

/// CRC-32 as computed by zlib and the device
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Destination of an upload
#[derive(Copy, Clone, Debug)]
pub enum Target<'a> {
    /// Bootloader stage, loaded to a fixed address without a name
    Stage { label: &'a str, addr: u32 },
    /// Named flash partition
    Partition { name: &'a PartitionName, addr: u32 },
}

impl<'a> Target<'a> {
    pub fn label(&self) -> &'a str {
        match *self {
            Target::Stage { label, .. } => label,
            Target::Partition { name, .. } => name.as_str(),
        }
    }

    pub fn addr(&self) -> u32 {
        match *self {
            Target::Stage { addr, .. } | Target::Partition { addr, .. } => addr,
        }
    }
}

/// Reported after each chunk is acknowledged
#[derive(Clone, Debug, PartialEq)]
pub struct Progress<'a> {
    pub label: &'a str,
    /// Sequence number of the chunk just sent
    pub chunk: u32,
    /// Bytes sent so far
    pub sent: usize,
    pub total: usize,
}

/// State of a single transfer
pub struct UploadSession {
    total: u32,
    chunk_size: usize,
    digest: Digest<'static, u32>,
    next_seq: u32,
}

impl UploadSession {
    pub fn new(total: usize, chunk_size: usize) -> Result<Self, ConfigError> {
        if chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }

        Ok(Self {
            total: wire_len(total)?,
            chunk_size,
            digest: CRC32.digest(),
            next_seq: 0,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks the transfer will be split into
    pub fn chunk_count(&self) -> usize {
        let total = self.total as usize;
        total / self.chunk_size + (total % self.chunk_size != 0) as usize
    }

    /// START_DATA payload: `addr || total [|| name]`
    pub fn start_payload(&self, target: &Target) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + crate::protocol::MAX_PART_NAME);
        buf.extend_from_slice(&target.addr().to_le_bytes());
        buf.extend_from_slice(&self.total.to_le_bytes());

        if let Target::Partition { name, .. } = target {
            buf.extend_from_slice(&name.to_field());
        }

        buf
    }

    /// MID_DATA payload for the next chunk: `seq || len || bytes`
    pub fn chunk_payload(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + chunk.len());
        buf.extend_from_slice(&self.next_seq.to_le_bytes());
        buf.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
        buf.extend_from_slice(chunk);

        self.digest.update(chunk);
        self.next_seq += 1;

        buf
    }

    /// END_DATA payload: `0 || 4 || crc32`, with the checksum
    pub fn finish(self) -> (Vec<u8>, u32) {
        let crc = self.digest.finalize();

        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&CRC_LEN.to_le_bytes());
        buf.extend_from_slice(&crc.to_le_bytes());

        (buf, crc)
    }
}

pub struct ChunkedUploader<'a, P, D, E> {
    codec: &'a mut Codec<P, D, E>,
    chunk_size: usize,
}

impl<'a, P, D, E> ChunkedUploader<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(codec: &'a mut Codec<P, D, E>, chunk_size: usize) -> Self {
        Self { codec, chunk_size }
    }

    /// Transfer `data` to `target`, returning the CRC-32 the device verified
    pub fn upload(
        &mut self,
        data: &[u8],
        target: &Target,
        progress: &mut dyn FnMut(&Progress),
    ) -> Result<u32, Error<E>> {
        let mut session =
            UploadSession::new(data.len(), self.chunk_size).map_err(Error::Config)?;
        let label = target.label();

        debug!(
            "Starting upload of {} ({} bytes, {} chunks)",
            label,
            data.len(),
            session.chunk_count()
        );
        self.codec
            .request(Command::StartData, &session.start_payload(target))?;

        let mut sent = 0;
        for (i, chunk) in data.chunks(session.chunk_size()).enumerate() {
            self.codec
                .request(Command::MidData, &session.chunk_payload(chunk))?;
            sent += chunk.len();

            if self.codec.verbose() >= 1 {
                info!(
                    "Sent chunk {}, size {}, total {} (0x{:x})",
                    i,
                    chunk.len(),
                    sent,
                    sent
                );
            }

            progress(&Progress {
                label,
                chunk: i as u32,
                sent,
                total: data.len(),
            });
        }

        let (trailer, crc) = session.finish();
        self.codec.request(Command::EndData, &trailer)?;

        debug!("Upload of {} complete, crc32 0x{:08x}", label, crc);
        Ok(crc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockDevice, NoDelay};
    use crate::protocol::Response;
    use crate::transport::Transport;
    use crate::Options;

    type Outcome = (Result<u32, Error<std::io::ErrorKind>>, MockDevice);

    fn upload(dev: MockDevice, data: &[u8], target: &Target, chunk: usize) -> Outcome {
        let mut codec = Codec::new(Transport::new(dev, NoDelay, 10, 1), &Options::default());
        let res = ChunkedUploader::new(&mut codec, chunk).upload(data, target, &mut |_: &Progress| {});
        let (dev, _) = codec.release().release();
        (res, dev)
    }

    fn header(p: &[u8]) -> (u32, u32) {
        (
            u32::from_le_bytes([p[0], p[1], p[2], p[3]]),
            u32::from_le_bytes([p[4], p[5], p[6], p[7]]),
        )
    }

    #[test]
    fn crc32_vectors() {
        assert_eq!(crc32(b""), 0x0000_0000);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn streamed_crc_matches_whole_blob() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();

        let mut s = UploadSession::new(data.len(), 333).unwrap();
        for c in data.chunks(333) {
            s.chunk_payload(c);
        }
        let (trailer, crc) = s.finish();

        assert_eq!(crc, crc32(&data));
        assert_eq!(&trailer[..8], &[0u8, 0, 0, 0, 4, 0, 0, 0]);
        assert_eq!(&trailer[8..], &crc.to_le_bytes());
    }

    #[test]
    fn chunk_splitting() {
        for &(len, size) in &[(0usize, 4usize), (1, 4), (4, 4), (5, 4), (4096, 1000), (9, 1)] {
            let data = vec![0x5a; len];
            let target = Target::Stage { label: "t", addr: 0 };
            let (res, dev) = upload(MockDevice::new(), &data, &target, size);
            res.unwrap();

            let mids = dev.payloads(Command::MidData);
            assert_eq!(mids.len(), (len + size - 1) / size, "len {} size {}", len, size);

            let mut total = 0;
            for (i, m) in mids.iter().enumerate() {
                let (seq, l) = header(m);
                assert_eq!(seq, i as u32);
                assert_eq!(l as usize, m.len() - 8);
                if i + 1 < mids.len() {
                    assert_eq!(l as usize, size);
                }
                total += l as usize;
            }
            assert_eq!(total, len);
        }
    }

    #[test]
    fn empty_blob_sends_no_chunks() {
        let target = Target::Stage { label: "empty", addr: 0x10 };
        let (res, dev) = upload(MockDevice::new(), &[], &target, 4096);
        assert_eq!(res, Ok(0));
        assert_eq!(
            dev.commands(),
            vec![Command::StartData, Command::EndData]
        );
    }

    #[test]
    fn stage_start_has_no_name() {
        let target = Target::Stage { label: "pdl1", addr: 0x0010_0100 };
        let (_, dev) = upload(MockDevice::new(), &[1, 2, 3], &target, 4096);

        let start = dev.payloads(Command::StartData)[0];
        assert_eq!(header(start), (0x0010_0100, 3));
        assert_eq!(start.len(), 8);
    }

    #[test]
    fn partition_start_has_padded_name() {
        let name: PartitionName = "nandroot".parse().unwrap();
        let target = Target::Partition { name: &name, addr: 0 };
        let (_, dev) = upload(MockDevice::new(), &[1, 2, 3], &target, 4096);

        let start = dev.payloads(Command::StartData)[0];
        assert_eq!(header(start), (0, 3));
        assert_eq!(start.len(), 8 + 30);
        assert_eq!(&start[8..16], b"nandroot");
        assert!(start[16..].iter().all(|b| *b == 0));
    }

    #[test]
    fn failed_chunk_aborts_upload() {
        let mut dev = MockDevice::new();
        // START_DATA, MID_DATA 0, then MID_DATA 1 fails
        dev.on(2, mock::error(Response::OperationFailed.code()));

        let target = Target::Stage { label: "t", addr: 0 };
        let (res, dev) = upload(dev, &[0; 20], &target, 4);
        assert_eq!(res, Err(Error::Device(Response::OperationFailed)));
        assert_eq!(dev.sent.len(), 3);
        assert!(!dev.commands().contains(&Command::EndData));
    }

    #[test]
    fn chunk_count_with_huge_chunk_size() {
        assert_eq!(UploadSession::new(10, usize::MAX).unwrap().chunk_count(), 1);
        assert_eq!(UploadSession::new(0, usize::MAX).unwrap().chunk_count(), 0);
        assert_eq!(UploadSession::new(9, 4).unwrap().chunk_count(), 3);
        assert_eq!(UploadSession::new(8, 4).unwrap().chunk_count(), 2);

        let target = Target::Stage { label: "t", addr: 0 };
        let (res, dev) = upload(MockDevice::new(), &[7; 10], &target, usize::MAX);
        assert_eq!(res, Ok(crc32(&[7; 10])));
        assert_eq!(dev.payloads(Command::MidData).len(), 1);
    }

    #[test]
    fn zero_chunk_size_is_rejected_before_sending() {
        let target = Target::Stage { label: "t", addr: 0 };
        let (res, dev) = upload(MockDevice::new(), &[0; 4], &target, 0);
        assert_eq!(res, Err(Error::Config(ConfigError::ZeroChunkSize)));
        assert!(dev.sent.is_empty());
    }
}
