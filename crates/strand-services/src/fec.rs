//! XOR parity over sample slices.
//!
//! With `p` parity segments, data slice `i` belongs to group `i % p` and
//! parity segment `j` is the XOR of group `j`, each slice zero-padded to
//! the longest one. One missing slice per group can be rebuilt.
//!
//! Parity payload: `[sample_len:4 LE][xor bytes]`.

use std::collections::{BTreeMap, HashSet};

use bytes::{Bytes, BytesMut};

const LEN_PREFIX: usize = 4;

/// Parity segments for `data_slices` slices at `ratio` (0 disables parity).
pub fn parity_count(data_slices: usize, ratio: f64) -> usize {
    if ratio <= 0.0 || data_slices == 0 {
        return 0;
    }
    ((data_slices as f64 * ratio).ceil() as usize).clamp(1, data_slices)
}

/// Build `parity` parity payloads over `slices`.
pub fn encode(slices: &[&[u8]], parity: usize) -> Vec<Vec<u8>> {
    if parity == 0 {
        return Vec::new();
    }
    let stride = slices.iter().map(|s| s.len()).max().unwrap_or(0);
    let sample_len: usize = slices.iter().map(|s| s.len()).sum();

    (0..parity)
        .map(|group| {
            let mut out = Vec::with_capacity(LEN_PREFIX + stride);
            out.extend_from_slice(&(sample_len as u32).to_le_bytes());
            out.resize(LEN_PREFIX + stride, 0);
            for slice in slices.iter().skip(group).step_by(parity) {
                xor_into(&mut out[LEN_PREFIX..], slice);
            }
            out
        })
        .collect()
}

fn xor_into(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

/// Outcome of putting a sample back together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub payload: Bytes,
    /// Data slices rebuilt from parity.
    pub rebuilt: usize,
}

/// Could `recover` rebuild every missing data slice from what is held?
/// Each missing slice needs its group's parity and no other gap in the
/// same group.
pub fn recoverable(
    data: &BTreeMap<u64, Bytes>,
    parity: &BTreeMap<u64, Bytes>,
    total_data: u32,
    total_parity: u32,
) -> bool {
    let mut short_groups = HashSet::new();
    for i in (0..u64::from(total_data)).filter(|i| !data.contains_key(i)) {
        if total_parity == 0 {
            return false;
        }
        let group = i % u64::from(total_parity);
        if !parity.contains_key(&group) || !short_groups.insert(group) {
            return false;
        }
    }
    true
}

/// Concatenate `total_data` slices, rebuilding missing ones from parity.
pub fn recover(
    data: &BTreeMap<u64, Bytes>,
    parity: &BTreeMap<u64, Bytes>,
    total_data: u32,
    total_parity: u32,
) -> Result<Recovered, FecError> {
    let missing: Vec<u64> = (0..total_data as u64)
        .filter(|i| !data.contains_key(i))
        .collect();

    if missing.is_empty() {
        let mut out = BytesMut::new();
        for i in 0..total_data as u64 {
            if let Some(slice) = data.get(&i) {
                out.extend_from_slice(slice);
            }
        }
        return Ok(Recovered {
            payload: out.freeze(),
            rebuilt: 0,
        });
    }

    if total_parity == 0 {
        return Err(FecError::NoParity(missing.len()));
    }

    let mut rebuilt: BTreeMap<u64, Bytes> = BTreeMap::new();
    for &i in &missing {
        let group = i % total_parity as u64;
        let parity_slice = parity
            .get(&group)
            .ok_or(FecError::Unrecoverable { slice: i })?;
        if parity_slice.len() < LEN_PREFIX {
            return Err(FecError::Malformed);
        }

        let siblings_missing = missing
            .iter()
            .any(|&m| m != i && m % total_parity as u64 == group);
        if siblings_missing {
            return Err(FecError::Unrecoverable { slice: i });
        }

        let (prefix, xor) = parity_slice.split_at(LEN_PREFIX);
        let sample_len =
            u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let stride = xor.len();

        let mut acc = xor.to_vec();
        for sibling in (group..total_data as u64).step_by(total_parity as usize) {
            if sibling == i {
                continue;
            }
            if let Some(slice) = data.get(&sibling) {
                xor_into(&mut acc, slice);
            }
        }

        let start = i as usize * stride;
        let len = sample_len.saturating_sub(start).min(stride);
        acc.truncate(len);
        rebuilt.insert(i, Bytes::from(acc));
    }

    let mut out = BytesMut::new();
    for i in 0..total_data as u64 {
        match data.get(&i).or_else(|| rebuilt.get(&i)) {
            Some(slice) => out.extend_from_slice(slice),
            None => return Err(FecError::Unrecoverable { slice: i }),
        }
    }

    Ok(Recovered {
        payload: out.freeze(),
        rebuilt: rebuilt.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FecError {
    #[error("{0} data slices missing and no parity published")]
    NoParity(usize),

    #[error("slice {slice} cannot be rebuilt")]
    Unrecoverable { slice: u64 },

    #[error("parity payload is malformed")]
    Malformed,
}
