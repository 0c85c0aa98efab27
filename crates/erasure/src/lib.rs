//! Reed-Solomon erasure coding of video chunks.
//!
//! A chunk is encoded into `data_shards + parity_shards` equal-sized
//! fragments over GF(2^8) such that any `data_shards` of them reconstruct
//! the original payload. With the default (3, 2) configuration a 2 MiB
//! chunk becomes five ~700 KiB fragments, and the chunk survives the loss
//! of any two of them.

use reed_solomon_erasure::galois_8::ReedSolomon;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("chunk payload is empty")]
    EmptyChunk,
    #[error("insufficient fragments: need at least {needed}, got {got}")]
    InsufficientFragments { needed: usize, got: usize },
    #[error("fragment index {index} is out of range for a {total}-fragment encoding")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("fragment {index} is {got} bytes but fragments of this chunk are {expected}")]
    MismatchedFragmentSize {
        index: usize,
        got: usize,
        expected: usize,
    },
    #[error("codec failure")]
    Codec(#[source] reed_solomon_erasure::Error),
}

/// Shard counts of a Reed-Solomon encoding.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct CodecConfig {
    pub data_shards: usize,
    pub parity_shards: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            data_shards: 3,
            parity_shards: 2,
        }
    }
}

/// Metadata describing one fragment of an encoded chunk, before it has
/// been assigned to a storage node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FragmentMeta {
    pub fragment_id: String,
    pub chunk_id: String,
    pub fragment_index: u32,
    pub size_bytes: u64,
    pub checksum: String,
}

impl FragmentMeta {
    /// Bind this fragment to the node that stores it, yielding the wire
    /// placement record.
    pub fn with_node(self, node_url: &str) -> models::FragmentSpec {
        models::FragmentSpec {
            fragment_id: self.fragment_id,
            chunk_id: self.chunk_id,
            fragment_index: self.fragment_index,
            node_url: node_url.to_string(),
            size_bytes: self.size_bytes,
            checksum: self.checksum,
        }
    }
}

/// A (K, M) Reed-Solomon codec for chunk payloads.
pub struct Codec {
    cfg: CodecConfig,
    rs: ReedSolomon,
}

impl Codec {
    pub fn new(cfg: CodecConfig) -> Result<Self> {
        let rs = ReedSolomon::new(cfg.data_shards, cfg.parity_shards).map_err(Error::Codec)?;
        Ok(Self { cfg, rs })
    }

    pub fn data_shards(&self) -> usize {
        self.cfg.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.cfg.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.cfg.data_shards + self.cfg.parity_shards
    }

    /// Encode `chunk` into `total_shards()` equal-sized fragments: the K
    /// data fragments in payload order followed by the M parity fragments.
    ///
    /// The payload is right-padded with zeroes to a length divisible by K;
    /// callers must retain the original length to truncate after decode.
    pub fn encode(&self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        if chunk.is_empty() {
            return Err(Error::EmptyChunk);
        }
        let k = self.cfg.data_shards;
        let fragment_size = chunk.len().div_ceil(k);

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total_shards());
        for i in 0..k {
            let start = i * fragment_size;
            let end = (start + fragment_size).min(chunk.len());
            let mut shard = if start < chunk.len() {
                chunk[start..end].to_vec()
            } else {
                Vec::new()
            };
            shard.resize(fragment_size, 0);
            shards.push(shard);
        }
        for _ in 0..self.cfg.parity_shards {
            shards.push(vec![0u8; fragment_size]);
        }

        self.rs.encode(&mut shards).map_err(Error::Codec)?;
        Ok(shards)
    }

    /// Reconstruct the original payload from any K fragments, each tagged
    /// with its index in `[0, K+M)`. `original_len` truncates the encode-
    /// time padding.
    pub fn decode(
        &self,
        available: Vec<(usize, Vec<u8>)>,
        original_len: usize,
    ) -> Result<Vec<u8>> {
        let k = self.cfg.data_shards;
        let total = self.total_shards();

        if available.len() < k {
            return Err(Error::InsufficientFragments {
                needed: k,
                got: available.len(),
            });
        }

        let mut shards: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut fragment_size = None;
        for (index, fragment) in available {
            if index >= total {
                return Err(Error::IndexOutOfRange { index, total });
            }
            match fragment_size {
                None => fragment_size = Some(fragment.len()),
                Some(expected) if fragment.len() != expected => {
                    return Err(Error::MismatchedFragmentSize {
                        index,
                        got: fragment.len(),
                        expected,
                    });
                }
                Some(_) => {}
            }
            shards[index] = Some(fragment);
        }

        // Fast path: all data fragments present, no codec work needed.
        if shards[..k].iter().all(Option::is_some) {
            return Ok(concat_data(&mut shards, k, original_len));
        }

        self.rs.reconstruct(&mut shards).map_err(Error::Codec)?;
        Ok(concat_data(&mut shards, k, original_len))
    }

    /// Describe `fragments` (as produced by [`Codec::encode`]) for the
    /// placement commit: id, index, length and checksum of each.
    pub fn fragment_metadata(&self, chunk_id: &str, fragments: &[Vec<u8>]) -> Vec<FragmentMeta> {
        fragments
            .iter()
            .enumerate()
            .map(|(index, fragment)| FragmentMeta {
                fragment_id: models::fragment_id(chunk_id, index as u32),
                chunk_id: chunk_id.to_string(),
                fragment_index: index as u32,
                size_bytes: fragment.len() as u64,
                checksum: models::content_checksum(fragment),
            })
            .collect()
    }

    /// Fraction of storage saved relative to `replication_factor` full
    /// copies: `(R - (K+M)/K) / R`.
    pub fn storage_efficiency(&self, replication_factor: u32) -> f64 {
        let r = replication_factor as f64;
        let overhead = self.total_shards() as f64 / self.cfg.data_shards as f64;
        (r - overhead) / r
    }
}

fn concat_data(shards: &mut [Option<Vec<u8>>], k: usize, original_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(original_len);
    for shard in shards[..k].iter_mut() {
        out.extend_from_slice(shard.as_ref().expect("data shard reconstructed"));
    }
    out.truncate(original_len);
    out
}
