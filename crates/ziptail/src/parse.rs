//! EOCD discovery and central-directory parsing.

use crate::error::{ZipError, ZipResult};
use crate::{
    le_u16, le_u32, CD_ENTRY_MIN_SIZE, CD_ENTRY_SIGNATURE, EOCD_MIN_SIZE, EOCD_SIGNATURE,
    LOCAL_HEADER_SIGNATURE, LOCAL_HEADER_SIZE, MAX_EOCD_SCAN,
};

/// Parsed end-of-central-directory record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eocd {
    /// Absolute offset of the EOCD record in the archive.
    pub offset: u64,
    /// Total number of central-directory entries.
    pub entry_count: u16,
    /// Central directory size in bytes.
    pub cd_size: u32,
    /// Absolute offset where the central directory begins.
    pub cd_offset: u32,
}

/// One central-directory entry, with its raw bytes preserved so they can be
/// copied verbatim into a rewritten directory.
#[derive(Clone, Debug)]
pub struct CdEntry {
    pub name: String,
    /// Compression method: 0 = stored, 8 = deflate.
    pub method: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    /// Absolute offset of the entry's local file header.
    pub local_offset: u32,
    /// The full raw central-directory record (header + name + extra + comment).
    pub raw: Vec<u8>,
}

/// Locate the EOCD record by scanning `tail` backwards.
///
/// `tail` must be the trailing view of the archive (the last
/// `min(archive_size, TAIL_VIEW_SIZE)` bytes). Fails with [`ZipError::NotAZip`]
/// when no signature is present, and with [`ZipError::Unsupported`] for ZIP64
/// sentinels or multi-disk archives.
pub fn find_eocd(tail: &[u8], archive_size: u64) -> ZipResult<Eocd> {
    if tail.len() < EOCD_MIN_SIZE || (tail.len() as u64) > archive_size {
        return Err(ZipError::NotAZip);
    }

    let scan_floor = tail.len().saturating_sub(MAX_EOCD_SCAN);
    let mut pos = tail.len() - EOCD_MIN_SIZE;
    loop {
        if le_u32(tail, pos) == EOCD_SIGNATURE {
            return parse_eocd_at(tail, pos, archive_size);
        }
        if pos == scan_floor {
            return Err(ZipError::NotAZip);
        }
        pos -= 1;
    }
}

fn parse_eocd_at(tail: &[u8], pos: usize, archive_size: u64) -> ZipResult<Eocd> {
    let disk_number = le_u16(tail, pos + 4);
    let cd_disk = le_u16(tail, pos + 6);
    let disk_entries = le_u16(tail, pos + 8);
    let entry_count = le_u16(tail, pos + 10);
    let cd_size = le_u32(tail, pos + 12);
    let cd_offset = le_u32(tail, pos + 16);

    if entry_count == u16::MAX
        || disk_entries == u16::MAX
        || cd_size == u32::MAX
        || cd_offset == u32::MAX
    {
        return Err(ZipError::Unsupported("zip64 archive".to_string()));
    }
    if disk_number != 0 || cd_disk != 0 || disk_entries != entry_count {
        return Err(ZipError::Unsupported("multi-disk archive".to_string()));
    }

    let offset = archive_size - (tail.len() - pos) as u64;
    if (cd_offset as u64) + (cd_size as u64) > offset {
        return Err(ZipError::Truncated(
            "central directory extends past its EOCD record".to_string(),
        ));
    }

    Ok(Eocd {
        offset,
        entry_count,
        cd_size,
        cd_offset,
    })
}

/// Walk the raw central directory and return its entries in order.
pub fn parse_central_directory(cd: &[u8]) -> ZipResult<Vec<CdEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;

    while pos < cd.len() {
        if pos + CD_ENTRY_MIN_SIZE > cd.len() {
            return Err(ZipError::Truncated(
                "central directory entry header".to_string(),
            ));
        }
        if le_u32(cd, pos) != CD_ENTRY_SIGNATURE {
            return Err(ZipError::Truncated(format!(
                "bad central directory signature at offset {pos}"
            )));
        }

        let method = le_u16(cd, pos + 10);
        let crc32 = le_u32(cd, pos + 16);
        let compressed_size = le_u32(cd, pos + 20);
        let uncompressed_size = le_u32(cd, pos + 24);
        let name_len = le_u16(cd, pos + 28) as usize;
        let extra_len = le_u16(cd, pos + 30) as usize;
        let comment_len = le_u16(cd, pos + 32) as usize;
        let local_offset = le_u32(cd, pos + 42);

        let record_len = CD_ENTRY_MIN_SIZE + name_len + extra_len + comment_len;
        if pos + record_len > cd.len() {
            return Err(ZipError::Truncated(
                "central directory entry body".to_string(),
            ));
        }

        let name_bytes = &cd[pos + CD_ENTRY_MIN_SIZE..pos + CD_ENTRY_MIN_SIZE + name_len];
        entries.push(CdEntry {
            name: String::from_utf8_lossy(name_bytes).into_owned(),
            method,
            crc32,
            compressed_size,
            uncompressed_size,
            local_offset,
            raw: cd[pos..pos + record_len].to_vec(),
        });

        pos += record_len;
    }

    Ok(entries)
}

/// Given the 30-byte fixed local header of an entry, return how many bytes
/// the full header occupies (fixed part + name + extra). The entry's data
/// begins that many bytes after `local_offset`.
pub fn local_data_len(header: &[u8]) -> ZipResult<u64> {
    if header.len() < LOCAL_HEADER_SIZE {
        return Err(ZipError::Truncated("local file header".to_string()));
    }
    if le_u32(header, 0) != LOCAL_HEADER_SIGNATURE {
        return Err(ZipError::Truncated(
            "bad local file header signature".to_string(),
        ));
    }
    let name_len = le_u16(header, 26) as u64;
    let extra_len = le_u16(header, 28) as u64;
    Ok(LOCAL_HEADER_SIZE as u64 + name_len + extra_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tail::test_support::build_stored_archive;

    #[test]
    fn find_eocd_rejects_garbage() {
        let data = vec![0u8; 1024];
        assert!(matches!(
            find_eocd(&data, 1024),
            Err(ZipError::NotAZip)
        ));
    }

    #[test]
    fn find_eocd_locates_record_with_comment() {
        let mut archive = build_stored_archive(&[("a.txt", b"hello")]);
        // Append a comment by patching the EOCD comment length.
        let comment = b"trailing comment";
        let eocd_pos = archive.len() - EOCD_MIN_SIZE;
        archive[eocd_pos + 20..eocd_pos + 22]
            .copy_from_slice(&(comment.len() as u16).to_le_bytes());
        archive.extend_from_slice(comment);

        let eocd = find_eocd(&archive, archive.len() as u64).unwrap();
        assert_eq!(eocd.entry_count, 1);
        assert_eq!(eocd.offset, eocd_pos as u64);
    }

    #[test]
    fn find_eocd_rejects_zip64_sentinels() {
        let mut archive = build_stored_archive(&[("a.txt", b"hello")]);
        let eocd_pos = archive.len() - EOCD_MIN_SIZE;
        // cd_offset = 0xFFFFFFFF marks a ZIP64 archive.
        archive[eocd_pos + 16..eocd_pos + 20].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            find_eocd(&archive, archive.len() as u64),
            Err(ZipError::Unsupported(_))
        ));
    }

    #[test]
    fn find_eocd_rejects_multi_disk() {
        let mut archive = build_stored_archive(&[("a.txt", b"hello"), ("b.txt", b"world")]);
        let eocd_pos = archive.len() - EOCD_MIN_SIZE;
        // disk-entries (2) != total-entries after patching total to 1... patch
        // the disk-entry count instead so the totals disagree.
        archive[eocd_pos + 8..eocd_pos + 10].copy_from_slice(&1u16.to_le_bytes());
        assert!(matches!(
            find_eocd(&archive, archive.len() as u64),
            Err(ZipError::Unsupported(_))
        ));
    }

    #[test]
    fn parse_central_directory_roundtrip() {
        let archive = build_stored_archive(&[("a.txt", b"hello"), ("dir/b.bin", &[0u8; 64])]);
        let eocd = find_eocd(&archive, archive.len() as u64).unwrap();
        let cd = &archive[eocd.cd_offset as usize..(eocd.cd_offset + eocd.cd_size) as usize];
        let entries = parse_central_directory(cd).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.txt");
        assert_eq!(entries[0].method, 0);
        assert_eq!(entries[0].uncompressed_size, 5);
        assert_eq!(entries[1].name, "dir/b.bin");
        assert_eq!(entries[1].uncompressed_size, 64);

        // Raw bytes reassemble into the original directory.
        let reassembled: Vec<u8> = entries.iter().flat_map(|e| e.raw.clone()).collect();
        assert_eq!(reassembled, cd);
    }

    #[test]
    fn local_data_len_accounts_for_name_and_extra() {
        let archive = build_stored_archive(&[("abc.txt", b"x")]);
        let len = local_data_len(&archive[..LOCAL_HEADER_SIZE]).unwrap();
        assert_eq!(len, (LOCAL_HEADER_SIZE + "abc.txt".len()) as u64);
    }

    #[test]
    fn truncated_central_directory_fails() {
        let archive = build_stored_archive(&[("a.txt", b"hello")]);
        let eocd = find_eocd(&archive, archive.len() as u64).unwrap();
        let cd = &archive[eocd.cd_offset as usize..(eocd.cd_offset + eocd.cd_size) as usize];
        assert!(parse_central_directory(&cd[..cd.len() - 4]).is_err());
    }
}
