//! In-place ownership rewrite for squashfs shard images.
//!
//! Unprivileged user-namespace backends map the invoking user to root inside
//! the sandbox, so every file in a mounted shard must appear to be owned by
//! that user. Rather than re-packing the image, we rewrite the uid/gid table
//! embedded in it: squashfs stores all ownership ids in one deduplicated
//! table, so patching a handful of u32 slots re-owns the entire tree.
//!
//! The rewrite is only possible when the id table's metadata blocks are
//! stored uncompressed (`mksquashfs -noI -no-compression-id-table` style
//! images, which the shard mirror publishes). A compressed table is a hard
//! error, never a silent skip — mounting such an image would produce a
//! sandbox owned by the wrong user and fail in confusing ways later.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::ShardError;

const SQUASHFS_MAGIC: u32 = 0x7371_7368;
/// Metadata block header flag: payload is stored uncompressed.
const UNCOMPRESSED_BLOCK: u16 = 0x8000;
/// Ids per metadata block (8 KiB of u32 entries).
const IDS_PER_BLOCK: u64 = 2048;

const ID_COUNT_OFFSET: u64 = 26;
const ID_TABLE_START_OFFSET: u64 = 48;

/// Rewrite every ownership id in a squashfs image to `id`.
///
/// Fails with [`ShardError::CompressedIdTable`] when any id-table block is
/// compressed. The image is modified in place; callers re-verify ownership by
/// content only before the rewrite, never after (the hash necessarily
/// changes).
pub fn rewrite_squashfs_uids(image: &Path, id: u32) -> Result<(), ShardError> {
    let mut file = OpenOptions::new().read(true).write(true).open(image)?;

    let magic = read_u32(&mut file, 0)?;
    if magic != SQUASHFS_MAGIC {
        return Err(ShardError::Other(anyhow::anyhow!(
            "{} is not a squashfs image (bad magic {:#x})",
            image.display(),
            magic
        )));
    }

    let id_count = read_u16(&mut file, ID_COUNT_OFFSET)? as u64;
    let id_table_start = read_u64(&mut file, ID_TABLE_START_OFFSET)?;

    // The id table is an array of u64 pointers to metadata blocks, one per
    // IDS_PER_BLOCK ids.
    let block_count = id_count.div_ceil(IDS_PER_BLOCK);

    // Validate every block header before the first write; a partially
    // rewritten image must not be possible.
    let mut pointers = Vec::with_capacity(block_count as usize);
    for block_idx in 0..block_count {
        let ptr = read_u64(&mut file, id_table_start + block_idx * 8)?;
        let header = read_u16(&mut file, ptr)?;
        if header & UNCOMPRESSED_BLOCK == 0 {
            return Err(ShardError::CompressedIdTable(image.to_path_buf()));
        }
        pointers.push(ptr);
    }

    let mut remaining = id_count;
    for ptr in pointers {
        let ids_here = remaining.min(IDS_PER_BLOCK);
        let mut payload = vec![0u8; (ids_here * 4) as usize];
        for chunk in payload.chunks_exact_mut(4) {
            chunk.copy_from_slice(&id.to_le_bytes());
        }
        file.seek(SeekFrom::Start(ptr + 2))?;
        file.write_all(&payload)?;
        remaining -= ids_here;
    }

    file.sync_all()?;
    Ok(())
}

fn read_u16(file: &mut std::fs::File, offset: u64) -> std::io::Result<u16> {
    let mut buf = [0u8; 2];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(file: &mut std::fs::File, offset: u64) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(file: &mut std::fs::File, offset: u64) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    /// Build a minimal image: superblock + id-table metadata block + pointer
    /// array. Only the fields the rewrite reads are populated.
    fn fake_image(dir: &Path, ids: &[u32], compressed: bool) -> PathBuf {
        let path = dir.join("shard.squashfs");
        let mut data = vec![0u8; 96];
        data[0..4].copy_from_slice(&SQUASHFS_MAGIC.to_le_bytes());
        data[26..28].copy_from_slice(&(ids.len() as u16).to_le_bytes());

        // Metadata block at offset 96.
        let block_offset = data.len() as u64;
        let mut header = (ids.len() * 4) as u16;
        if !compressed {
            header |= UNCOMPRESSED_BLOCK;
        }
        data.extend_from_slice(&header.to_le_bytes());
        for id in ids {
            data.extend_from_slice(&id.to_le_bytes());
        }

        // Pointer array follows the block; superblock points at it.
        let table_offset = data.len() as u64;
        data.extend_from_slice(&block_offset.to_le_bytes());
        data[48..56].copy_from_slice(&table_offset.to_le_bytes());

        fs::write(&path, data).unwrap();
        path
    }

    fn read_ids(path: &Path, count: usize) -> Vec<u32> {
        let data = fs::read(path).unwrap();
        (0..count)
            .map(|i| {
                let off = 96 + 2 + i * 4;
                u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
            })
            .collect()
    }

    #[test]
    fn rewrites_all_ids_in_uncompressed_table() {
        let tmp = tempfile::tempdir().unwrap();
        let image = fake_image(tmp.path(), &[0, 1000, 65534], false);

        rewrite_squashfs_uids(&image, 1234).unwrap();
        assert_eq!(read_ids(&image, 3), vec![1234, 1234, 1234]);
    }

    #[test]
    fn compressed_table_is_a_hard_error() {
        let tmp = tempfile::tempdir().unwrap();
        let image = fake_image(tmp.path(), &[0, 1000], true);

        let before = fs::read(&image).unwrap();
        let err = rewrite_squashfs_uids(&image, 1234).unwrap_err();
        assert!(matches!(err, ShardError::CompressedIdTable(_)));
        // Nothing may have been modified.
        assert_eq!(fs::read(&image).unwrap(), before);
    }

    #[test]
    fn non_squashfs_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("not-an-image");
        fs::write(&path, b"definitely not squashfs").unwrap();
        assert!(rewrite_squashfs_uids(&path, 1234).is_err());
    }

    #[test]
    fn rewrite_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let image = fake_image(tmp.path(), &[0, 1000], false);
        rewrite_squashfs_uids(&image, 1234).unwrap();
        let first = fs::read(&image).unwrap();
        rewrite_squashfs_uids(&image, 1234).unwrap();
        assert_eq!(fs::read(&image).unwrap(), first);
    }
}
