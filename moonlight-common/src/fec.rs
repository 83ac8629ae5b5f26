//! Reed-Solomon forward error correction over GF(2^8).
//!
//! Video frames are sharded into `data_shards` payload slices plus
//! `parity_shards` recovery slices; any `data_shards` of the total suffice to
//! reconstruct the originals. The encoding matrix is an identity block on top
//! of Cauchy parity rows, matching the construction the host uses.

use std::sync::OnceLock;

use crate::error::{MoonlightError, Result};

const GF_BITS: usize = 8;
/// Primitive polynomial for GF(2^8), bit string of x^8 + x^6 + x^5 + x^4 + 1.
const GF_PP: &[u8] = b"101110001";
const GF_SIZE: usize = (1 << GF_BITS) - 1;
/// Data plus parity may not exceed the field size.
pub const MAX_TOTAL_SHARDS: usize = 255;

struct GfTables {
    exp: [u8; 2 * GF_SIZE],
    log: [usize; GF_SIZE + 1],
    inverse: [u8; GF_SIZE + 1],
    mul: Vec<u8>,
}

static TABLES: OnceLock<GfTables> = OnceLock::new();

fn tables() -> &'static GfTables {
    TABLES.get_or_init(|| {
        let mut exp = [0u8; 2 * GF_SIZE];
        let mut log = [0usize; GF_SIZE + 1];
        let mut inverse = [0u8; GF_SIZE + 1];

        let mut mask: u8 = 1;
        exp[GF_BITS] = 0;
        for i in 0..GF_BITS {
            exp[i] = mask;
            log[exp[i] as usize] = i;
            if GF_PP[i] == b'1' {
                exp[GF_BITS] ^= mask;
            }
            mask <<= 1;
        }
        log[exp[GF_BITS] as usize] = GF_BITS;

        let mask = 1u8 << (GF_BITS - 1);
        for i in (GF_BITS + 1)..GF_SIZE {
            if exp[i - 1] >= mask {
                exp[i] = exp[GF_BITS] ^ ((exp[i - 1] ^ mask) << 1);
            } else {
                exp[i] = exp[i - 1] << 1;
            }
            log[exp[i] as usize] = i;
        }
        log[0] = GF_SIZE;

        for i in 0..GF_SIZE {
            exp[i + GF_SIZE] = exp[i];
        }

        inverse[0] = 0;
        inverse[1] = 1;
        for i in 2..=GF_SIZE {
            inverse[i] = exp[GF_SIZE - log[i]];
        }

        let mut mul = vec![0u8; (GF_SIZE + 1) * (GF_SIZE + 1)];
        for i in 0..=GF_SIZE {
            for j in 0..=GF_SIZE {
                mul[(i << 8) + j] = exp[modnn(log[i] + log[j]) as usize];
            }
        }
        for j in 0..=GF_SIZE {
            mul[j] = 0;
            mul[j << 8] = 0;
        }

        GfTables {
            exp,
            log,
            inverse,
            mul,
        }
    })
}

fn modnn(mut x: usize) -> u8 {
    while x >= GF_SIZE {
        x -= GF_SIZE;
        x = (x >> GF_BITS) + (x & GF_SIZE);
    }
    x as u8
}

fn gf_mul(x: u8, y: u8) -> u8 {
    tables().mul[((x as usize) << 8) + y as usize]
}

/// `dst[i] ^= c * src[i]`
fn addmul(dst: &mut [u8], src: &[u8], c: u8) {
    if c == 0 {
        return;
    }
    let row = &tables().mul[(c as usize) << 8..((c as usize) << 8) + 256];
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= row[*s as usize];
    }
}

/// `dst[i] = c * src[i]`
fn mul_row(dst: &mut [u8], src: &[u8], c: u8) {
    if c == 0 {
        dst.fill(0);
        return;
    }
    let row = &tables().mul[(c as usize) << 8..((c as usize) << 8) + 256];
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = row[*s as usize];
    }
}

/// Gauss-Jordan inversion of a k x k matrix in place.
fn invert_matrix(src: &mut [u8], k: usize) -> Result<()> {
    let mut indxc = vec![0usize; k];
    let mut indxr = vec![0usize; k];
    let mut ipiv = vec![0u8; k];

    for col in 0..k {
        let mut irow = usize::MAX;
        let mut icol = usize::MAX;

        if ipiv[col] != 1 && src[col * k + col] != 0 {
            irow = col;
            icol = col;
        } else {
            'search: for row in 0..k {
                if ipiv[row] != 1 {
                    for ix in 0..k {
                        if ipiv[ix] == 0 && src[row * k + ix] != 0 {
                            irow = row;
                            icol = ix;
                            break 'search;
                        }
                    }
                }
            }
        }

        if icol == usize::MAX {
            return Err(MoonlightError::FecSingularMatrix);
        }
        ipiv[icol] += 1;

        if irow != icol {
            for ix in 0..k {
                src.swap(irow * k + ix, icol * k + ix);
            }
        }
        indxr[col] = irow;
        indxc[col] = icol;

        let c = src[icol * k + icol];
        if c == 0 {
            return Err(MoonlightError::FecSingularMatrix);
        }
        if c != 1 {
            let inv = tables().inverse[c as usize];
            src[icol * k + icol] = 1;
            for ix in 0..k {
                src[icol * k + ix] = gf_mul(inv, src[icol * k + ix]);
            }
        }

        let pivot_row: Vec<u8> = src[icol * k..(icol + 1) * k].to_vec();
        let pivot_is_identity =
            pivot_row.iter().enumerate().all(|(ix, &v)| v == u8::from(ix == icol));
        if !pivot_is_identity {
            for ix in 0..k {
                if ix != icol {
                    let c = src[ix * k + icol];
                    src[ix * k + icol] = 0;
                    addmul(&mut src[ix * k..(ix + 1) * k], &pivot_row, c);
                }
            }
        }
    }

    for col in (0..k).rev() {
        if indxr[col] != indxc[col] {
            for row in 0..k {
                src.swap(row * k + indxr[col], row * k + indxc[col]);
            }
        }
    }
    Ok(())
}

fn code_some_shards(
    matrix_rows: &[u8],
    inputs: &[&[u8]],
    outputs: &mut [Vec<u8>],
    data_shards: usize,
) {
    for (c, input) in inputs.iter().enumerate().take(data_shards) {
        for (row, out) in outputs.iter_mut().enumerate() {
            let coeff = matrix_rows[row * data_shards + c];
            if c == 0 {
                mul_row(out, input, coeff);
            } else {
                addmul(out, input, coeff);
            }
        }
    }
}

/// Reed-Solomon codec for a fixed shard geometry.
pub struct ReedSolomon {
    data_shards: usize,
    parity_shards: usize,
    total_shards: usize,
    /// `total_shards x data_shards` encoding matrix; identity on top.
    matrix: Vec<u8>,
}

impl ReedSolomon {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        let total_shards = data_shards + parity_shards;
        if total_shards > MAX_TOTAL_SHARDS || data_shards == 0 || parity_shards == 0 {
            return Err(MoonlightError::FecTooManyShards);
        }

        let mut matrix = vec![0u8; total_shards * data_shards];
        for row in 0..data_shards {
            matrix[row * data_shards + row] = 1;
        }
        // Cauchy construction for the parity rows.
        for j in 0..parity_shards {
            for i in 0..data_shards {
                matrix[(data_shards + j) * data_shards + i] =
                    tables().inverse[(parity_shards + i) ^ j];
            }
        }

        Ok(Self {
            data_shards,
            parity_shards,
            total_shards,
            matrix,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.total_shards
    }

    /// Fill the parity shards from the data shards. `shards` must hold
    /// `total_shards` equally sized buffers.
    pub fn encode(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        if shards.len() != self.total_shards {
            return Err(MoonlightError::FecInvalidShardSize);
        }
        let block_size = shards[0].len();
        if shards.iter().any(|s| s.len() != block_size) {
            return Err(MoonlightError::FecInvalidShardSize);
        }

        let (data, parity) = shards.split_at_mut(self.data_shards);
        let inputs: Vec<&[u8]> = data.iter().map(|s| s.as_slice()).collect();
        let parity_matrix = &self.matrix[self.data_shards * self.data_shards..];
        code_some_shards(parity_matrix, &inputs, parity, self.data_shards);
        Ok(())
    }

    /// Recover the missing data shards. `present[i]` marks shard `i` as
    /// received; missing entries of `shards` are overwritten with the
    /// reconstructed bytes. Parity shards are not rebuilt.
    pub fn reconstruct(&self, shards: &mut [Vec<u8>], present: &[bool]) -> Result<()> {
        if shards.len() != self.total_shards || present.len() != self.total_shards {
            return Err(MoonlightError::FecInvalidShardSize);
        }

        let mut block_size = 0usize;
        for (shard, &ok) in shards.iter().zip(present.iter()) {
            if ok {
                if block_size == 0 {
                    block_size = shard.len();
                } else if shard.len() != block_size {
                    return Err(MoonlightError::FecInvalidShardSize);
                }
            }
        }
        if block_size == 0 {
            return Err(MoonlightError::FecNotEnoughShards);
        }

        let missing_data: Vec<usize> = (0..self.data_shards).filter(|&i| !present[i]).collect();
        if missing_data.is_empty() {
            return Ok(());
        }

        // Build the decode matrix from the present data rows plus enough
        // present parity rows to square it out.
        let k = self.data_shards;
        let mut decode_matrix = vec![0u8; k * k];
        let mut sub_shards: Vec<Vec<u8>> = Vec::with_capacity(k);
        let mut sub_row = 0usize;

        for i in 0..k {
            if present[i] {
                decode_matrix[sub_row * k..(sub_row + 1) * k]
                    .copy_from_slice(&self.matrix[i * k..(i + 1) * k]);
                sub_shards.push(shards[i].clone());
                sub_row += 1;
            }
        }
        for i in self.data_shards..self.total_shards {
            if sub_row == k {
                break;
            }
            if present[i] {
                decode_matrix[sub_row * k..(sub_row + 1) * k]
                    .copy_from_slice(&self.matrix[i * k..(i + 1) * k]);
                sub_shards.push(shards[i].clone());
                sub_row += 1;
            }
        }
        if sub_row < k {
            return Err(MoonlightError::FecNotEnoughShards);
        }

        invert_matrix(&mut decode_matrix, k)?;

        // Row `idx` of the inverse reconstructs data shard `idx`.
        let mut recovery_rows = vec![0u8; missing_data.len() * k];
        for (out, &idx) in missing_data.iter().enumerate() {
            recovery_rows[out * k..(out + 1) * k]
                .copy_from_slice(&decode_matrix[idx * k..(idx + 1) * k]);
        }

        let inputs: Vec<&[u8]> = sub_shards.iter().map(|s| s.as_slice()).collect();
        let mut outputs: Vec<Vec<u8>> = missing_data.iter().map(|_| vec![0u8; block_size]).collect();
        code_some_shards(&recovery_rows, &inputs, &mut outputs, k);

        for (&idx, recovered) in missing_data.iter().zip(outputs.into_iter()) {
            shards[idx] = recovered;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_shards(rs: &ReedSolomon, block_size: usize) -> Vec<Vec<u8>> {
        let mut shards: Vec<Vec<u8>> = (0..rs.total_shards())
            .map(|i| {
                if i < rs.data_shards() {
                    (0..block_size).map(|b| ((i * 31 + b * 7) % 251) as u8).collect()
                } else {
                    vec![0u8; block_size]
                }
            })
            .collect();
        rs.encode(&mut shards).unwrap();
        shards
    }

    #[test]
    fn recovers_three_erased_data_shards() {
        let rs = ReedSolomon::new(10, 4).unwrap();
        let shards = make_shards(&rs, 256);
        let original = shards.clone();

        let mut damaged = shards;
        let mut present = vec![true; rs.total_shards()];
        for &lost in &[2usize, 5, 9] {
            damaged[lost] = Vec::new();
            present[lost] = false;
        }

        rs.reconstruct(&mut damaged, &present).unwrap();
        for i in 0..rs.data_shards() {
            assert_eq!(damaged[i], original[i], "data shard {i} mismatch");
        }
    }

    #[test]
    fn recovers_from_any_k_of_n() {
        let rs = ReedSolomon::new(4, 3).unwrap();
        let shards = make_shards(&rs, 64);
        let original = shards.clone();

        // Erase every 3-subset including mixes of data and parity losses.
        for a in 0..rs.total_shards() {
            for b in (a + 1)..rs.total_shards() {
                for c in (b + 1)..rs.total_shards() {
                    let mut damaged = original.clone();
                    let mut present = vec![true; rs.total_shards()];
                    for &lost in &[a, b, c] {
                        damaged[lost] = Vec::new();
                        present[lost] = false;
                    }
                    rs.reconstruct(&mut damaged, &present).unwrap();
                    for i in 0..rs.data_shards() {
                        assert_eq!(damaged[i], original[i], "erasures {a},{b},{c}");
                    }
                }
            }
        }
    }

    #[test]
    fn too_many_erasures_is_an_error() {
        let rs = ReedSolomon::new(4, 2).unwrap();
        let shards = make_shards(&rs, 32);

        let mut damaged = shards;
        let mut present = vec![true; rs.total_shards()];
        for &lost in &[0usize, 1, 2] {
            damaged[lost] = Vec::new();
            present[lost] = false;
        }
        assert!(matches!(
            rs.reconstruct(&mut damaged, &present),
            Err(MoonlightError::FecNotEnoughShards)
        ));
    }

    #[test]
    fn rejects_oversized_geometry() {
        assert!(ReedSolomon::new(200, 100).is_err());
        assert!(ReedSolomon::new(0, 4).is_err());
    }

    #[test]
    fn parity_only_geometry_round_trips() {
        let rs = ReedSolomon::new(1, 1).unwrap();
        let mut shards = vec![vec![0xAB; 16], vec![0u8; 16]];
        rs.encode(&mut shards).unwrap();

        let present = vec![false, true];
        let original = shards[0].clone();
        shards[0] = Vec::new();
        rs.reconstruct(&mut shards, &present).unwrap();
        assert_eq!(shards[0], original);
    }
}
