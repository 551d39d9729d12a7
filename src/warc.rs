//! Streaming WARC record reader.
//!
//! Records are produced lazily in file order and the stream cannot be rewound.
//! Gzip input (multi-member, one member per record) is detected by its magic bytes.

use crate::WarcannonError;
use flate2::read::MultiGzDecoder;
use std::io::{BufRead, BufReader, Read};

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip(header: &[u8]) -> bool {
    header.len() >= 2 && header[..2] == GZIP_MAGIC
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub record_type: String,
    pub payload_type: Option<String>,
    pub target_uri: Option<String>,
    pub content: Vec<u8>,
}

impl ArchiveRecord {
    pub fn is_response(&self) -> bool {
        self.record_type.eq_ignore_ascii_case("response")
    }
}

pub struct WarcReader<R: BufRead> {
    inner: R,
    line: Vec<u8>,
    done: bool,
}

impl<R: BufRead> WarcReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::with_capacity(256),
            done: false,
        }
    }

    /// Read one line without its terminator. `None` at end of stream.
    fn read_line(&mut self) -> Result<Option<&[u8]>, WarcannonError> {
        self.line.clear();
        if self.inner.read_until(b'\n', &mut self.line)? == 0 {
            return Ok(None);
        }
        let mut end = self.line.len();
        while end > 0 && matches!(self.line[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        Ok(Some(&self.line[..end]))
    }

    fn read_record(&mut self) -> Result<Option<ArchiveRecord>, WarcannonError> {
        // Skip the blank separator lines left after the previous block.
        loop {
            match self.read_line()? {
                None => return Ok(None),
                Some(l) if l.is_empty() => continue,
                Some(l) if l.starts_with(b"WARC/") => break,
                Some(l) => {
                    return Err(WarcannonError::Decode(format!(
                        "expected WARC version line, found {:?}",
                        String::from_utf8_lossy(&l[..l.len().min(40)])
                    )));
                }
            }
        }

        let mut record = ArchiveRecord::default();
        let mut content_length: Option<usize> = None;
        loop {
            let Some(line) = self.read_line()? else {
                return Err(WarcannonError::Decode("stream ended inside record header".to_string()));
            };
            if line.is_empty() {
                break;
            }
            let text = String::from_utf8_lossy(line);
            let Some((name, value)) = text.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "warc-type" => record.record_type = value.to_string(),
                "warc-target-uri" => record.target_uri = Some(value.to_string()),
                "warc-identified-payload-type" => record.payload_type = Some(value.to_string()),
                "content-length" => {
                    content_length = Some(value.parse().map_err(|_| {
                        WarcannonError::Decode(format!("bad Content-Length '{}'", value))
                    })?);
                }
                _ => {}
            }
        }

        let length = content_length
            .ok_or_else(|| WarcannonError::Decode("record without Content-Length".to_string()))?;
        let mut content = Vec::with_capacity(length.min(1 << 24));
        (&mut self.inner).take(length as u64).read_to_end(&mut content)?;
        if content.len() != length {
            return Err(WarcannonError::Decode(format!(
                "truncated record block: {} of {} bytes",
                content.len(),
                length
            )));
        }
        record.content = content;
        Ok(Some(record))
    }
}

impl<R: BufRead> Iterator for WarcReader<R> {
    type Item = Result<ArchiveRecord, WarcannonError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Open plain or gzip-compressed WARC bytes as a record stream.
pub fn open_archive<'a, R: Read + 'a>(inner: R) -> Result<WarcReader<Box<dyn BufRead + 'a>>, WarcannonError> {
    let mut buffered = BufReader::with_capacity(64 * 1024, inner);
    let gzip = is_gzip(buffered.fill_buf()?);
    let stream: Box<dyn BufRead + 'a> = if gzip {
        Box::new(BufReader::with_capacity(256 * 1024, MultiGzDecoder::new(buffered)))
    } else {
        Box::new(buffered)
    };
    Ok(WarcReader::new(stream))
}
