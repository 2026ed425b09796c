//! Stream layer over the backing image: plain or gzip, restart-based seeking.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

enum Inner {
    Plain(File),
    Gzip {
        decoder: MultiGzDecoder<io::BufReader<File>>,
        /// Decompressed bytes consumed so far.
        pos: u64,
    },
}

/// A byte stream over the backing image.
///
/// Gzip images are read through [`MultiGzDecoder`]; anything without the
/// gzip magic is read directly, mirroring zlib's transparent `gzopen`
/// behavior. A gzip stream only moves forward: seeking backward reopens the
/// file and re-decompresses from the start, and seeking forward discards the
/// intervening bytes. That cost model is what the block cache above this
/// layer exists to amortize.
pub struct ImageStream {
    path: PathBuf,
    inner: Inner,
}

impl ImageStream {
    /// Open `path`, sniffing whether it is gzip-compressed.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 2];
        let is_gzip = match file.read_exact(&mut magic) {
            Ok(()) => magic == GZIP_MAGIC,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(e) => return Err(e),
        };
        file.rewind()?;

        let inner = if is_gzip {
            Inner::Gzip {
                decoder: MultiGzDecoder::new(io::BufReader::new(file)),
                pos: 0,
            }
        } else {
            Inner::Plain(file)
        };
        Ok(Self {
            path: path.to_owned(),
            inner,
        })
    }

    /// Position the stream at `target`, a decompressed byte offset.
    ///
    /// Plain files seek natively. For gzip, a target behind the current
    /// position restarts decompression from the beginning; the stream is
    /// then advanced by discarding bytes. A target past the end of the
    /// stream is not an error here — the next [`read_full`](Self::read_full)
    /// simply returns zero bytes.
    pub fn seek_to(&mut self, target: u64) -> io::Result<()> {
        match &mut self.inner {
            Inner::Plain(file) => {
                file.seek(SeekFrom::Start(target))?;
                Ok(())
            }
            Inner::Gzip { decoder, pos } => {
                if target < *pos {
                    debug!(
                        target,
                        pos = *pos,
                        "seek behind stream position, restarting decompression"
                    );
                    let file = File::open(&self.path)?;
                    *decoder = MultiGzDecoder::new(io::BufReader::new(file));
                    *pos = 0;
                }
                let wanted = target - *pos;
                let skipped = io::copy(&mut decoder.by_ref().take(wanted), &mut io::sink())?;
                *pos += skipped;
                Ok(())
            }
        }
    }

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// The count is short only at end-of-stream; a decoder failure
    /// (truncated or corrupt gzip data) surfaces as an error.
    pub fn read_full(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = match &mut self.inner {
                Inner::Plain(file) => file.read(&mut buf[filled..])?,
                Inner::Gzip { decoder, pos } => {
                    let n = decoder.read(&mut buf[filled..])?;
                    *pos += n as u64;
                    n
                }
            };
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
