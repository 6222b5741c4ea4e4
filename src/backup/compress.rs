// backuptool/src/backup/compress.rs
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use tracing::debug;

use crate::errors::{IoResultExt, Result};
use crate::utils::{FileFormat, sniff_format};

/// Copy granularity for every streamed transfer; bounds memory regardless of input size.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Copies `reader` into `writer` one fixed-size chunk at a time.
pub fn copy_in_chunks<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Gzips `source` into `dest` at maximum compression. Returns the number of
/// uncompressed bytes read. A partial `dest` left by a failure is the
/// caller's to discard.
pub fn gzip_file(source: &Path, dest: &Path) -> Result<u64> {
    let mut input = File::open(source).at(source)?;
    let output = File::create(dest).at(dest)?;

    let mut encoder = GzEncoder::new(output, Compression::best());
    let copied = copy_in_chunks(&mut input, &mut encoder).at(dest)?;
    let output = encoder.finish().at(dest)?;
    output.sync_all().at(dest)?;

    debug!(source = %source.display(), dest = %dest.display(), bytes = copied, "compressed file");
    Ok(copied)
}

/// Inverse of [`gzip_file`]. Returns the number of decompressed bytes written.
pub fn gunzip_file(source: &Path, dest: &Path) -> Result<u64> {
    let input = File::open(source).at(source)?;
    let mut output = File::create(dest).at(dest)?;

    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let copied = copy_in_chunks(&mut decoder, &mut output).at(source)?;
    output.sync_all().at(dest)?;
    Ok(copied)
}

/// Opens a dump for streaming, decompressing on the fly when it is gzip.
pub fn open_maybe_gzip(path: &Path) -> Result<Box<dyn Read + Send>> {
    let format = sniff_format(path)?;
    let file = File::open(path).at(path)?;
    let reader = BufReader::with_capacity(CHUNK_SIZE, file);
    Ok(match format {
        FileFormat::Gzip => Box::new(MultiGzDecoder::new(reader)),
        _ => Box::new(reader),
    })
}
