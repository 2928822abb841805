//! Synchronous disk persistence for evicted blocks.
//!
//! A narrow, swappable collaborator: the eviction manager calls
//! [`write_block_atomic`] before dropping a block from the arena, and a
//! caller recovering from a [`crate::error::CoreError::KvMiss`] could call
//! [`read_block`] to re-materialize one instead of re-prefilling — though
//! the scheduler's default recovery path is re-prefill (§7).
//!
//! Layout: a fixed little-endian header identifying the block, followed by
//! the raw K tensor bytes, then the raw V tensor bytes. Writes go through a
//! temp file and an atomic rename so a crash mid-write never leaves a
//! corrupt block file at its final path.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::cache::block::{BlockId, KvTensor};
use crate::error::CoreResult;

const HEADER_LEN: usize = 24; // seq_id: u64, block_index: u64, block_id: u64

fn block_path(dir: &Path, seq_id: u64, block_index: usize) -> PathBuf {
    dir.join(format!("kv_{seq_id}_{block_index}.bin"))
}

fn encode_header(seq_id: u64, block_index: usize, block_id: BlockId) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..8].copy_from_slice(&seq_id.to_le_bytes());
    buf[8..16].copy_from_slice(&(block_index as u64).to_le_bytes());
    buf[16..24].copy_from_slice(&block_id.to_le_bytes());
    buf
}

fn decode_header(buf: &[u8]) -> (u64, usize, BlockId) {
    let seq_id = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let block_index = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
    let block_id = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    (seq_id, block_index, block_id)
}

fn tensor_meta(t: &KvTensor) -> [u8; 32] {
    let mut buf = [0u8; 32];
    buf[0..8].copy_from_slice(&(t.num_layers as u64).to_le_bytes());
    buf[8..16].copy_from_slice(&(t.tokens_per_block as u64).to_le_bytes());
    buf[16..24].copy_from_slice(&(t.num_kv_heads as u64).to_le_bytes());
    buf[24..32].copy_from_slice(&(t.head_dim as u64).to_le_bytes());
    buf
}

fn tensor_shape(buf: &[u8]) -> (usize, usize, usize, usize) {
    let num_layers = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
    let tokens_per_block = u64::from_le_bytes(buf[8..16].try_into().unwrap()) as usize;
    let num_kv_heads = u64::from_le_bytes(buf[16..24].try_into().unwrap()) as usize;
    let head_dim = u64::from_le_bytes(buf[24..32].try_into().unwrap()) as usize;
    (num_layers, tokens_per_block, num_kv_heads, head_dim)
}

fn tensor_bytes(t: &KvTensor) -> &[u8] {
    bytemuck::cast_slice(t.raw())
}

/// Write a block's K and V tensors to `dir/kv_<seq_id>_<block_index>.bin`,
/// replacing any existing file atomically.
pub fn write_block_atomic(
    dir: &Path,
    seq_id: u64,
    block_index: usize,
    block_id: BlockId,
    k: &KvTensor,
    v: &KvTensor,
) -> CoreResult<()> {
    fs::create_dir_all(dir)?;
    let final_path = block_path(dir, seq_id, block_index);
    let tmp_path = final_path.with_extension("bin.tmp");

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(&encode_header(seq_id, block_index, block_id))?;
    file.write_all(&tensor_meta(k))?;
    file.write_all(tensor_bytes(k))?;
    file.write_all(tensor_bytes(v))?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Read back a previously persisted block, verifying its header matches the
/// requested `(seq_id, block_index)` before returning the tensors.
pub fn read_block(
    dir: &Path,
    seq_id: u64,
    block_index: usize,
) -> CoreResult<(BlockId, KvTensor, KvTensor)> {
    let path = block_path(dir, seq_id, block_index);
    let bytes = fs::read(&path)?;

    let (got_seq, got_index, block_id) = decode_header(&bytes[0..HEADER_LEN]);
    if got_seq != seq_id || got_index != block_index {
        return Err(crate::error::CoreError::ShapeMismatch(format!(
            "persisted block header ({got_seq},{got_index}) does not match requested ({seq_id},{block_index})"
        )));
    }

    let meta_start = HEADER_LEN;
    let meta_end = meta_start + 32;
    let (num_layers, tokens_per_block, num_kv_heads, head_dim) =
        tensor_shape(&bytes[meta_start..meta_end]);
    let elems = num_layers * tokens_per_block * num_kv_heads * head_dim;
    let tensor_bytes_len = elems * std::mem::size_of::<half::f16>();

    let k_start = meta_end;
    let k_end = k_start + tensor_bytes_len;
    let v_end = k_end + tensor_bytes_len;

    let mut k = KvTensor::zeros(num_layers, tokens_per_block, num_kv_heads, head_dim);
    let mut v = KvTensor::zeros(num_layers, tokens_per_block, num_kv_heads, head_dim);
    k.raw_mut()
        .copy_from_slice(bytemuck::cast_slice(&bytes[k_start..k_end]));
    v.raw_mut()
        .copy_from_slice(bytemuck::cast_slice(&bytes[k_end..v_end]));

    Ok((block_id, k, v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_block_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut k = KvTensor::zeros(1, 2, 2, 4);
        k.write_slot(0, 0, 0, &[1.0, 2.0, 3.0, 4.0]);
        let v = KvTensor::zeros(1, 2, 2, 4);

        write_block_atomic(dir.path(), 7, 3, 42, &k, &v).unwrap();
        let (block_id, k2, _v2) = read_block(dir.path(), 7, 3).unwrap();

        assert_eq!(block_id, 42);
        let slot = k2.slot(0, 0, 0);
        assert!((slot[0].to_f32() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_read_missing_block_errs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_block(dir.path(), 1, 0).is_err());
    }

    #[test]
    fn test_header_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let k = KvTensor::zeros(1, 1, 1, 1);
        let v = KvTensor::zeros(1, 1, 1, 1);
        write_block_atomic(dir.path(), 1, 0, 99, &k, &v).unwrap();
        // rename the file under a different logical index so the header no
        // longer matches the path we read it back from
        fs::rename(
            block_path(dir.path(), 1, 0),
            block_path(dir.path(), 1, 1),
        )
        .unwrap();
        assert!(read_block(dir.path(), 1, 1).is_err());
    }
}
