//! Splitting a sealed batch into `slices` roughly-equal pieces for
//! parallel `COPY` (§4.5, `load`: "optionally splitting into N equal
//! byte-range slices"). A literal byte-range split would cut CSV rows
//! in half, so this splits on row (`\n`) boundaries into N chunks of
//! as-equal-as-possible row count instead, then re-compresses each
//! chunk independently. Each slice has to be its own complete
//! compressed stream for Redshift to decode it while reading in
//! parallel.

use std::io::{Read, Write};

use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use bzip2::Compression as BzLevel;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;

use redshift_core::config::Compression;
use redshift_core::error::{Result, TargetError};

/// Decompress a sealed batch's bytes back to raw CSV rows.
pub fn decompress(bytes: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(bytes.to_vec()),
        Compression::Gzip => {
            let mut out = Vec::new();
            GzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| TargetError::Fatal(e.into()))?;
            Ok(out)
        }
        Compression::Bzip2 => {
            let mut out = Vec::new();
            BzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| TargetError::Fatal(e.into()))?;
            Ok(out)
        }
    }
}

/// Split raw (uncompressed) CSV bytes into `slice_count` chunks,
/// never splitting a row, then compress each chunk independently.
/// Returns at most `slice_count` chunks, fewer if there are too few
/// rows to distribute evenly.
pub fn split_and_compress(raw: &[u8], slice_count: usize, compression: Compression) -> Result<Vec<Vec<u8>>> {
    let slice_count = slice_count.max(1);
    let rows = split_rows(raw, slice_count);
    rows.into_iter()
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| compress(&chunk, compression))
        .collect()
}

fn split_rows(raw: &[u8], slice_count: usize) -> Vec<Vec<u8>> {
    if slice_count <= 1 {
        return vec![raw.to_vec()];
    }

    let mut rows: Vec<&[u8]> = Vec::new();
    let mut start = 0;
    for (i, &b) in raw.iter().enumerate() {
        if b == b'\n' {
            rows.push(&raw[start..=i]);
            start = i + 1;
        }
    }
    if start < raw.len() {
        rows.push(&raw[start..]);
    }

    if rows.is_empty() {
        return vec![];
    }

    let chunk_count = slice_count.min(rows.len());
    let base = rows.len() / chunk_count;
    let extra = rows.len() % chunk_count;

    let mut chunks = Vec::with_capacity(chunk_count);
    let mut idx = 0;
    for i in 0..chunk_count {
        let take = base + if i < extra { 1 } else { 0 };
        let mut chunk = Vec::new();
        for row in &rows[idx..idx + take] {
            chunk.extend_from_slice(row);
        }
        chunks.push(chunk);
        idx += take;
    }
    chunks
}

fn compress(chunk: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(chunk.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
            encoder.write_all(chunk).map_err(|e| TargetError::Fatal(e.into()))?;
            encoder.finish().map_err(|e| TargetError::Fatal(e.into()))
        }
        Compression::Bzip2 => {
            let mut encoder = BzEncoder::new(Vec::new(), BzLevel::default());
            encoder.write_all(chunk).map_err(|e| TargetError::Fatal(e.into()))?;
            encoder.finish().map_err(|e| TargetError::Fatal(e.into()))
        }
    }
}
