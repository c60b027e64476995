//! Archive input helpers (gzip aware).

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB

/// Open an archive as a buffered line reader. `-` reads stdin, a `.gz`
/// extension streams through a gzip decoder, anything else is read as-is.
/// The whole file is never materialized; callers consume line by line.
pub fn open_reader<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead + Send>> {
    let p = path.as_ref();
    if p.to_string_lossy() == "-" {
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, io::stdin())));
    }
    let f = File::open(p)?;
    let ext = p.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();

    if ext == "gz" {
        let dec = flate2::read::GzDecoder::new(f);
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, dec)));
    }
    Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, f)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_plain_and_gzip_identically() {
        let dir = tempfile::tempdir().expect("tempdir");
        let text = "[Event \"x\"]\n\n1. e2e4 e7e5\n";

        let plain = dir.path().join("games.pgn");
        std::fs::write(&plain, text).expect("write plain");

        let gz = dir.path().join("games.pgn.gz");
        let f = File::create(&gz).expect("create gz");
        let mut enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        enc.write_all(text.as_bytes()).expect("write gz");
        enc.finish().expect("finish gz");

        for path in [plain, gz] {
            let mut lines = Vec::new();
            for line in open_reader(&path).expect("open").lines() {
                lines.push(line.expect("line"));
            }
            assert_eq!(lines, vec!["[Event \"x\"]", "", "1. e2e4 e7e5"]);
        }
    }
}
