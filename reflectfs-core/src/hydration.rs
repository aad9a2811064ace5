//! Chunked streaming of layer file contents.
//!
//! Bytes are read sequentially from the layer and handed to a writer callback
//! in chunks no larger than [`MAX_CHUNK_SIZE`], so memory use per request is
//! bounded regardless of file size.

use std::io::{self, Read, Seek, SeekFrom};
use crate::layer::LayerAccessor;
use crate::status::HResult;
use crate::types::config::MAX_CHUNK_SIZE;

/// Streams a whole layer file to `write_chunk`.
///
/// Returns `FileNotFound` if the file is absent, `InternalError` on a short
/// read or when `write_chunk` returns false.
pub fn hydrate<F>(layer: &LayerAccessor, relative_path: &str, chunk_size: usize, write_chunk: F) -> HResult
where
    F: FnMut(&[u8]) -> bool,
{
    hydrate_range(layer, relative_path, 0, chunk_size, write_chunk)
}

/// Streams a layer file from `start_offset` to its end.
pub fn hydrate_range<F>(
    layer: &LayerAccessor,
    relative_path: &str,
    start_offset: u64,
    chunk_size: usize,
    write_chunk: F,
) -> HResult
where
    F: FnMut(&[u8]) -> bool,
{
    if !layer.file_exists(relative_path) {
        return HResult::FileNotFound;
    }

    let mut file = match layer.open_for_read(relative_path) {
        Ok(file) => file,
        Err(e) => {
            tracing::error!("Failed to open {} in layer: {}", relative_path, e);
            return e.status();
        }
    };

    // Length is fixed at open time.
    let length = match file.metadata() {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            tracing::error!("Failed to stat {} in layer: {}", relative_path, e);
            return HResult::InternalError;
        }
    };

    if start_offset > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(start_offset)) {
            tracing::error!("Failed to seek {} to {}: {}", relative_path, start_offset, e);
            return HResult::InternalError;
        }
    }

    hydrate_from(&mut file, length.saturating_sub(start_offset), chunk_size, write_chunk)
}

/// Streams exactly `length` bytes from `reader` to `write_chunk`.
pub fn hydrate_from<R, F>(reader: &mut R, length: u64, chunk_size: usize, mut write_chunk: F) -> HResult
where
    R: Read,
    F: FnMut(&[u8]) -> bool,
{
    let chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
    let buffer_size = usize::try_from(length).map_or(chunk_size, |len| len.min(chunk_size));

    let mut buffer = Vec::new();
    if buffer.try_reserve_exact(buffer_size).is_err() {
        tracing::error!("Out of memory allocating {} byte read buffer", buffer_size);
        return HResult::OutOfMemory;
    }
    buffer.resize(buffer_size, 0);

    let mut remaining = length;
    while remaining > 0 {
        let to_copy = usize::try_from(remaining).map_or(buffer.len(), |r| r.min(buffer.len()));

        match read_full(reader, &mut buffer[..to_copy]) {
            Ok(read) if read == to_copy => {}
            Ok(read) => {
                tracing::error!("Short read from layer: expected {} bytes, got {}", to_copy, read);
                return HResult::InternalError;
            }
            Err(e) => {
                tracing::error!("Read from layer failed: {}", e);
                return HResult::InternalError;
            }
        }

        if !write_chunk(&buffer[..to_copy]) {
            return HResult::InternalError;
        }
        remaining -= to_copy as u64;
    }

    HResult::Ok
}

// Reads until `buf` is full or the reader hits end of file.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
