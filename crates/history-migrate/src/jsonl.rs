//! Gzip-compressed JSON Lines files, used for dumps and load scripts.

use crate::error::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

pub type GzFileWriter = GzEncoder<BufWriter<File>>;
pub type GzFileReader = BufReader<GzDecoder<File>>;

/// Create (truncate) a gzip file for writing.
pub fn create_gz<P: AsRef<Path>>(path: P) -> Result<GzFileWriter> {
    let file = File::create(path)?;
    Ok(GzEncoder::new(BufWriter::new(file), Compression::default()))
}

/// Open a gzip file for line-wise reading.
pub fn open_gz<P: AsRef<Path>>(path: P) -> Result<GzFileReader> {
    let file = File::open(path)?;
    Ok(BufReader::new(GzDecoder::new(file)))
}

/// Write the gzip trailer and flush to disk.
pub fn finish_gz(writer: GzFileWriter) -> Result<()> {
    let mut inner = writer.finish()?;
    inner.flush()?;
    Ok(())
}

/// Serialize one value as a line.
pub fn write_line<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Read the next non-blank line and parse it. `Ok(None)` at end of input.
pub fn read_line<R: BufRead, T: DeserializeOwned>(
    input: &mut R,
    buf: &mut String,
) -> Result<Option<T>> {
    loop {
        buf.clear();
        if input.read_line(buf)? == 0 {
            return Ok(None);
        }
        let line = buf.trim();
        if line.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_str(line)?));
    }
}
