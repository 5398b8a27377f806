use binrw::{BinResult, BinWrite};
use std::io::{self, Seek};

/// CRC-32 over `data`, continuing from `seed`.
///
/// The on-disk format threads the raw shift-register state from commit to
/// commit: the first commit of a block seeds with `0xffffffff` and every
/// later one with the running value, with no final xor. `crc32fast` bakes
/// the zlib pre/post inversions into its state, so the seed goes in
/// complemented and the result comes back out complemented.
pub fn crc32(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!seed);
    hasher.update(data);
    !hasher.finalize()
}

/// Initial CRC state at the start of a metadata block.
pub const CRC_SEED: u32 = 0xffff_ffff;

pub struct Crc32Writer<W: io::Write> {
    inner: W,
    crc: u32,
}
impl<W: io::Write> io::Write for Crc32Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32(self.crc, &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
impl<W: io::Write + io::Seek> Seek for Crc32Writer<W> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        if let io::SeekFrom::Current(0) = pos {
            self.inner.seek(pos)
        } else {
            panic!("Seek other than Current(0) is not supported on Crc32Writer.");
        }
    }
}
impl<W: io::Write> Crc32Writer<W> {
    pub fn new(writer: W) -> Self {
        Crc32Writer {
            inner: writer,
            crc: CRC_SEED,
        }
    }
    pub fn crc(&self) -> u32 {
        self.crc
    }
    pub fn into_inner(self) -> W {
        self.inner
    }
}

pub struct Crc32Reader<R: io::Read> {
    inner: R,
    crc: u32,
}
impl<R: io::Read> io::Read for Crc32Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc = crc32(self.crc, &buf[..n]);
        Ok(n)
    }
}
impl<R: io::Read + io::Seek> Seek for Crc32Reader<R> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        if let io::SeekFrom::Current(0) = pos {
            self.inner.seek(pos)
        } else {
            panic!("Seek other than Current(0) is not supported on Crc32Reader.");
        }
    }
}
impl<R: io::Read> Crc32Reader<R> {
    pub fn new(reader: R) -> Self {
        Crc32Reader {
            inner: reader,
            crc: CRC_SEED,
        }
    }
    pub fn crc(&self) -> u32 {
        self.crc
    }
}

pub fn binwrite_as_buf<T: BinWrite>(value: &T) -> BinResult<Vec<u8>>
where
    for<'a> <T as BinWrite>::Args<'a>: Default,
{
    let mut buf = io::Cursor::new(Vec::new());
    value.write_le(&mut buf)?;
    Ok(buf.into_inner())
}
