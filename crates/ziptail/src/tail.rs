//! Suffix computation: add stored entries to an archive without rewriting
//! existing data.

use crate::error::{ZipError, ZipResult};
use crate::parse::{find_eocd, local_data_len, parse_central_directory, CdEntry, Eocd};
use crate::{
    push_u16, push_u32, CD_ENTRY_MIN_SIZE, CD_ENTRY_SIGNATURE, EOCD_MIN_SIZE, EOCD_SIGNATURE,
    LOCAL_HEADER_SIGNATURE, LOCAL_HEADER_SIZE,
};
use std::io::Read;

/// Version-needed-to-extract for the stored entries we emit.
const VERSION_NEEDED: u16 = 20;

/// A file to append. Always written with method 0 (stored).
#[derive(Clone, Debug)]
pub struct NewFile {
    /// Full path inside the archive.
    pub name: String,
    pub data: Vec<u8>,
}

/// Result of [`append_suffix`]: the rewritten archive is
/// `original[0..split_offset] ++ tail`.
#[derive(Clone, Debug)]
pub struct AppendResult {
    /// Offset at which the original archive is cut (start of the old
    /// central directory).
    pub split_offset: u64,
    /// New local entries, the old central directory verbatim, the new
    /// central-directory entries, and a fresh EOCD.
    pub tail: Vec<u8>,
}

/// Decode an entry's raw (possibly compressed) data bytes.
///
/// Method 0 passes through; method 8 is inflated; anything else fails with
/// [`ZipError::UnsupportedCompression`].
pub fn decode_entry_data(entry: &CdEntry, raw: &[u8]) -> ZipResult<Vec<u8>> {
    match entry.method {
        0 => Ok(raw.to_vec()),
        8 => {
            let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
            flate2::read::DeflateDecoder::new(raw).read_to_end(&mut out)?;
            Ok(out)
        }
        other => Err(ZipError::UnsupportedCompression(other)),
    }
}

/// Compute the suffix that appends `files` as stored entries.
///
/// Existing central-directory records are reused byte-for-byte; their local
/// headers and data live in the preserved prefix `[0, split_offset)` and are
/// never touched.
pub fn append_suffix(
    archive_size: u64,
    entries: &[CdEntry],
    eocd: &Eocd,
    files: &[NewFile],
) -> ZipResult<AppendResult> {
    let total_entries = entries.len() + files.len();
    if total_entries >= u16::MAX as usize {
        return Err(ZipError::Unsupported(
            "entry count would require zip64".to_string(),
        ));
    }

    let split_offset = eocd.cd_offset as u64;
    if split_offset > archive_size {
        return Err(ZipError::Truncated(
            "central directory offset beyond archive".to_string(),
        ));
    }

    // New local entries take the place of the old central directory and
    // onward, so the first one lands exactly at the split point.
    let mut locals = Vec::new();
    let mut new_cd = Vec::new();
    let mut next_local_offset = split_offset;

    for file in files {
        if file.data.len() as u64 > u32::MAX as u64 {
            return Err(ZipError::Unsupported(format!(
                "appended file {} would require zip64",
                file.name
            )));
        }
        if file.name.len() > u16::MAX as usize {
            return Err(ZipError::Unsupported(format!(
                "appended file name too long ({} bytes)",
                file.name.len()
            )));
        }
        let local_offset = u32::try_from(next_local_offset).map_err(|_| {
            ZipError::Unsupported("local header offset would require zip64".to_string())
        })?;

        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&file.data);
            hasher.finalize()
        };
        let size = file.data.len() as u32;
        let name = file.name.as_bytes();

        // Local file header + data.
        push_u32(&mut locals, LOCAL_HEADER_SIGNATURE);
        push_u16(&mut locals, VERSION_NEEDED);
        push_u16(&mut locals, 0); // flags
        push_u16(&mut locals, 0); // method: stored
        push_u16(&mut locals, 0); // mod time
        push_u16(&mut locals, 0); // mod date
        push_u32(&mut locals, crc);
        push_u32(&mut locals, size);
        push_u32(&mut locals, size);
        push_u16(&mut locals, name.len() as u16);
        push_u16(&mut locals, 0); // extra len
        locals.extend_from_slice(name);
        locals.extend_from_slice(&file.data);

        // Matching central-directory record.
        push_u32(&mut new_cd, CD_ENTRY_SIGNATURE);
        push_u16(&mut new_cd, VERSION_NEEDED); // version made by
        push_u16(&mut new_cd, VERSION_NEEDED);
        push_u16(&mut new_cd, 0); // flags
        push_u16(&mut new_cd, 0); // method
        push_u16(&mut new_cd, 0); // mod time
        push_u16(&mut new_cd, 0); // mod date
        push_u32(&mut new_cd, crc);
        push_u32(&mut new_cd, size);
        push_u32(&mut new_cd, size);
        push_u16(&mut new_cd, name.len() as u16);
        push_u16(&mut new_cd, 0); // extra len
        push_u16(&mut new_cd, 0); // comment len
        push_u16(&mut new_cd, 0); // disk start
        push_u16(&mut new_cd, 0); // internal attrs
        push_u32(&mut new_cd, 0); // external attrs
        push_u32(&mut new_cd, local_offset);
        new_cd.extend_from_slice(name);

        next_local_offset += (LOCAL_HEADER_SIZE + name.len() + file.data.len()) as u64;
    }

    let new_cd_offset = u32::try_from(split_offset + locals.len() as u64).map_err(|_| {
        ZipError::Unsupported("central directory offset would require zip64".to_string())
    })?;

    let old_cd_len: usize = entries.iter().map(|e| e.raw.len()).sum();
    let cd_size = u32::try_from(old_cd_len + new_cd.len()).map_err(|_| {
        ZipError::Unsupported("central directory size would require zip64".to_string())
    })?;

    let mut tail = locals;
    tail.reserve(old_cd_len + new_cd.len() + EOCD_MIN_SIZE);
    for entry in entries {
        tail.extend_from_slice(&entry.raw);
    }
    tail.extend_from_slice(&new_cd);

    push_u32(&mut tail, EOCD_SIGNATURE);
    push_u16(&mut tail, 0); // this disk
    push_u16(&mut tail, 0); // cd disk
    push_u16(&mut tail, total_entries as u16);
    push_u16(&mut tail, total_entries as u16);
    push_u32(&mut tail, cd_size);
    push_u32(&mut tail, new_cd_offset);
    push_u16(&mut tail, 0); // comment len

    Ok(AppendResult { split_offset, tail })
}

/// Build a complete archive of stored entries from scratch.
///
/// Appending to an empty archive produces a valid one; used for fixtures and
/// small generated archives.
pub fn build_archive(files: &[NewFile]) -> ZipResult<Vec<u8>> {
    let eocd = Eocd {
        offset: 0,
        entry_count: 0,
        cd_size: 0,
        cd_offset: 0,
    };
    Ok(append_suffix(0, &[], &eocd, files)?.tail)
}

/// Rewrite a whole in-memory archive by appending `files`.
///
/// Convenience wrapper over [`find_eocd`] / [`parse_central_directory`] /
/// [`append_suffix`] for callers that hold the full archive.
pub fn rewrite_archive(original: &[u8], files: &[NewFile]) -> ZipResult<Vec<u8>> {
    let size = original.len() as u64;
    let tail_start = original.len().saturating_sub(crate::TAIL_VIEW_SIZE as usize);
    let eocd = find_eocd(&original[tail_start..], size)?;
    let cd = original
        .get(eocd.cd_offset as usize..(eocd.cd_offset as u64 + eocd.cd_size as u64) as usize)
        .ok_or_else(|| ZipError::Truncated("central directory range".to_string()))?;
    let entries = parse_central_directory(cd)?;
    let appended = append_suffix(size, &entries, &eocd, files)?;

    let mut out = original[..appended.split_offset as usize].to_vec();
    out.extend_from_slice(&appended.tail);
    Ok(out)
}

/// Read one entry's decoded data out of a full in-memory archive.
///
/// The ranged equivalent (two range reads against a blob store) lives in the
/// pipeline; this form backs tests and small archives.
pub fn read_entry(archive: &[u8], entry: &CdEntry) -> ZipResult<Vec<u8>> {
    let header_start = entry.local_offset as usize;
    let header = archive
        .get(header_start..header_start + LOCAL_HEADER_SIZE)
        .ok_or_else(|| ZipError::Truncated("local header range".to_string()))?;
    let header_len = local_data_len(header)? as usize;
    let data_start = header_start + header_len;
    let raw = archive
        .get(data_start..data_start + entry.compressed_size as usize)
        .ok_or_else(|| ZipError::Truncated("entry data range".to_string()))?;
    decode_entry_data(entry, raw)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a minimal valid archive of stored entries, in-memory.
    pub fn build_stored_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let new_files: Vec<NewFile> = files
            .iter()
            .map(|(name, data)| NewFile {
                name: name.to_string(),
                data: data.to_vec(),
            })
            .collect();
        build_archive(&new_files).unwrap()
    }

    /// Build an archive containing one deflate-compressed entry.
    pub fn build_deflate_archive(name: &str, data: &[u8]) -> Vec<u8> {
        use flate2::write::DeflateEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        let compressed = encoder.finish().unwrap();

        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(data);
            hasher.finalize()
        };

        let mut out = Vec::new();
        push_u32(&mut out, LOCAL_HEADER_SIGNATURE);
        push_u16(&mut out, VERSION_NEEDED);
        push_u16(&mut out, 0);
        push_u16(&mut out, 8); // deflate
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u32(&mut out, crc);
        push_u32(&mut out, compressed.len() as u32);
        push_u32(&mut out, data.len() as u32);
        push_u16(&mut out, name.len() as u16);
        push_u16(&mut out, 0);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&compressed);

        let cd_offset = out.len() as u32;
        push_u32(&mut out, CD_ENTRY_SIGNATURE);
        push_u16(&mut out, VERSION_NEEDED);
        push_u16(&mut out, VERSION_NEEDED);
        push_u16(&mut out, 0);
        push_u16(&mut out, 8);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u32(&mut out, crc);
        push_u32(&mut out, compressed.len() as u32);
        push_u32(&mut out, data.len() as u32);
        push_u16(&mut out, name.len() as u16);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u32(&mut out, 0);
        push_u32(&mut out, 0); // local offset
        out.extend_from_slice(name.as_bytes());
        let cd_size = out.len() as u32 - cd_offset;

        push_u32(&mut out, EOCD_SIGNATURE);
        push_u16(&mut out, 0);
        push_u16(&mut out, 0);
        push_u16(&mut out, 1);
        push_u16(&mut out, 1);
        push_u32(&mut out, cd_size);
        push_u32(&mut out, cd_offset);
        push_u16(&mut out, 0);
        out
    }
}
