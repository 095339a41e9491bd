use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use dmf_common::error::{MfError, Result};

use crate::dense::{Dense, Order};
use crate::sparse::SparseCoo;

/// The two shapes `readMatrix`/`writeMatrix` must understand (spec §6):
/// a `MatrixMarket` coordinate or array dialect on disk, or an in-memory
/// value once parsed.
pub enum AnyMatrix {
    Sparse(SparseCoo),
    Dense(Dense),
}

const BINARY_MAGIC: &[u8; 4] = b"DMF1";

/// Reads a matrix-market coordinate or array file, or this crate's own
/// versioned binary serialisation (spec §6 `readMatrix`). Dialect is
/// sniffed from the first line.
pub fn read_matrix(path: impl AsRef<Path>) -> Result<AnyMatrix> {
    let path = path.as_ref();
    let mut reader = BufReader::new(File::open(path)?);
    let mut magic = [0u8; 4];
    use std::io::Read;
    let n = reader.read(&mut magic)?;
    if n == 4 && &magic == BINARY_MAGIC {
        return read_binary(reader);
    }
    // Not our binary format: re-open as text and parse matrix-market.
    let reader = BufReader::new(File::open(path)?);
    read_matrix_market(reader)
}

fn read_matrix_market(reader: impl BufRead) -> Result<AnyMatrix> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .ok_or_else(|| MfError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "empty matrix file")))??;
    if !header.starts_with("%%MatrixMarket") {
        return Err(MfError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "missing %%MatrixMarket header",
        )));
    }
    let is_coordinate = header.contains("coordinate");

    let mut dims_line = None;
    for line in lines.by_ref() {
        let line = line?;
        if line.starts_with('%') {
            continue;
        }
        dims_line = Some(line);
        break;
    }
    let dims_line = dims_line.ok_or_else(|| {
        MfError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "missing dimension line",
        ))
    })?;
    let dims: Vec<usize> = dims_line
        .split_whitespace()
        .map(|s| s.parse().unwrap_or(0))
        .collect();

    if is_coordinate {
        let (rows, cols, _nnz) = (dims[0], dims[1], dims.get(2).copied().unwrap_or(0));
        let mut triples = Vec::new();
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let r: usize = parts[0].parse().unwrap_or(1);
            let c: usize = parts[1].parse().unwrap_or(1);
            let v: f64 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(1.0);
            triples.push((r as u32 - 1, c as u32 - 1, v));
        }
        Ok(AnyMatrix::Sparse(SparseCoo::from_triples_unsorted(
            rows, cols, triples, true,
        )))
    } else {
        let (rows, cols) = (dims[0], dims[1]);
        let mut data = Vec::with_capacity(rows * cols);
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            data.push(line.trim().parse::<f64>().unwrap_or(0.0));
        }
        // MatrixMarket array dialect is column-major on disk.
        Ok(AnyMatrix::Dense(Dense::from_data(
            rows,
            cols,
            Order::ColMajor,
            data,
        )))
    }
}

fn read_binary(mut reader: BufReader<File>) -> Result<AnyMatrix> {
    use std::io::Read;
    let mut buf8 = [0u8; 8];
    let mut read_u64 = |r: &mut BufReader<File>| -> Result<u64> {
        r.read_exact(&mut buf8)?;
        Ok(u64::from_le_bytes(buf8))
    };
    let rows = read_u64(&mut reader)? as usize;
    let cols = read_u64(&mut reader)? as usize;
    let kind = read_u64(&mut reader)?;
    if kind == 0 {
        let nnz = read_u64(&mut reader)? as usize;
        let mut triples = Vec::with_capacity(nnz);
        for _ in 0..nnz {
            let r = read_u64(&mut reader)? as u32;
            let c = read_u64(&mut reader)? as u32;
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            triples.push((r, c, f64::from_le_bytes(buf)));
        }
        Ok(AnyMatrix::Sparse(SparseCoo::from_triples_unsorted(
            rows, cols, triples, true,
        )))
    } else {
        let mut data = Vec::with_capacity(rows * cols);
        for _ in 0..rows * cols {
            let mut buf = [0u8; 8];
            reader.read_exact(&mut buf)?;
            data.push(f64::from_le_bytes(buf));
        }
        let order = if kind == 1 { Order::RowMajor } else { Order::ColMajor };
        Ok(AnyMatrix::Dense(Dense::from_data(rows, cols, order, data)))
    }
}

/// Writes the canonical binary serialisation (spec §6 `writeMatrix`).
/// Matrix-market text output is supported for sparse matrices only, since
/// that is the dialect the CLI's `--output-row-file`/`--output-col-file`
/// actually consume downstream.
pub fn write_matrix_binary(path: impl AsRef<Path>, m: &AnyMatrix) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(BINARY_MAGIC)?;
    match m {
        AnyMatrix::Sparse(s) => {
            w.write_all(&(s.rows() as u64).to_le_bytes())?;
            w.write_all(&(s.cols() as u64).to_le_bytes())?;
            w.write_all(&0u64.to_le_bytes())?;
            w.write_all(&(s.nnz() as u64).to_le_bytes())?;
            for (r, c, v) in s.triples() {
                w.write_all(&(r as u64).to_le_bytes())?;
                w.write_all(&(c as u64).to_le_bytes())?;
                w.write_all(&v.to_le_bytes())?;
            }
        }
        AnyMatrix::Dense(d) => {
            w.write_all(&(d.rows() as u64).to_le_bytes())?;
            w.write_all(&(d.cols() as u64).to_le_bytes())?;
            let kind = if d.order() == Order::RowMajor { 1u64 } else { 2u64 };
            w.write_all(&kind.to_le_bytes())?;
            for v in d.data() {
                w.write_all(&v.to_le_bytes())?;
            }
        }
    }
    Ok(())
}

/// Block-wise read: partitions `V` by `(blocks1, blocks2)` offsets and
/// returns only the blocks in `sorted_block_list`, in that order (spec §6
/// `readMatrixBlocks`). Used when a node only needs the blocks it owns.
pub fn read_matrix_blocks(
    path: impl AsRef<Path>,
    offsets1: &[usize],
    offsets2: &[usize],
    sorted_block_list: &[(usize, usize)],
) -> Result<(usize, usize, Vec<SparseCoo>)> {
    let whole = match read_matrix(path)? {
        AnyMatrix::Sparse(s) => s,
        AnyMatrix::Dense(_) => {
            return Err(MfError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "read_matrix_blocks only supports sparse matrices",
            )))
        }
    };
    let size1 = whole.rows();
    let size2 = whole.cols();

    let mut by_block: std::collections::HashMap<(usize, usize), Vec<(u32, u32, f64)>> =
        sorted_block_list.iter().map(|&k| (k, Vec::new())).collect();
    for (r, c, v) in whole.triples() {
        let b1 = offsets1.partition_point(|&o| o <= r as usize) - 1;
        let b2 = offsets2.partition_point(|&o| o <= c as usize) - 1;
        if let Some(bucket) = by_block.get_mut(&(b1, b2)) {
            bucket.push((r - offsets1[b1] as u32, c - offsets2[b2] as u32, v));
        }
    }

    let mut blocks = Vec::with_capacity(sorted_block_list.len());
    for &(b1, b2) in sorted_block_list {
        let rows = offsets1[b1 + 1] - offsets1[b1];
        let cols = offsets2[b2 + 1] - offsets2[b2];
        let triples = by_block.remove(&(b1, b2)).unwrap_or_default();
        blocks.push(SparseCoo::from_triples_unsorted(rows, cols, triples, true));
    }
    Ok((size1, size2, blocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn matrix_market_coordinate_round_trips_through_binary() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "%%MatrixMarket matrix coordinate real general\n2 2 2\n1 1 1.0\n2 2 1.0\n",
        )
        .unwrap();
        let parsed = read_matrix(tmp.path()).unwrap();
        let AnyMatrix::Sparse(s) = parsed else { panic!("expected sparse") };
        assert_eq!(s.nnz(), 2);

        let bin = NamedTempFile::new().unwrap();
        write_matrix_binary(bin.path(), &AnyMatrix::Sparse(s)).unwrap();
        let reparsed = read_matrix(bin.path()).unwrap();
        let AnyMatrix::Sparse(s2) = reparsed else { panic!("expected sparse") };
        assert_eq!(s2.nnz(), 2);
        assert_eq!(s2.triples().collect::<Vec<_>>(), vec![(0, 0, 1.0), (1, 1, 1.0)]);
    }

    #[test]
    fn block_read_partitions_by_offsets() {
        let tmp = NamedTempFile::new().unwrap();
        std::fs::write(
            tmp.path(),
            "%%MatrixMarket matrix coordinate real general\n4 4 4\n1 1 1.0\n1 3 2.0\n3 1 3.0\n3 3 4.0\n",
        )
        .unwrap();
        let (size1, size2, blocks) =
            read_matrix_blocks(tmp.path(), &[0, 2, 4], &[0, 2, 4], &[(0, 0), (1, 1)]).unwrap();
        assert_eq!((size1, size2), (4, 4));
        assert_eq!(blocks[0].nnz(), 1);
        assert_eq!(blocks[1].nnz(), 1);
    }
}
