//! k-of-n splitting of disk keys (Shamir over GF(256)).

use rand::rngs::OsRng;
use sharks::{Share, Sharks};
use zeroize::Zeroizing;

use crate::error::{TrustError, TrustResult};

/// A storage encryption key. Only ever held in memory.
pub type DiskKey = Zeroizing<Vec<u8>>;

/// One serialized Shamir share. The first byte is the x-coordinate,
/// which doubles as the share id.
pub struct ShareMaterial {
    bytes: Zeroizing<Vec<u8>>,
}

impl ShareMaterial {
    pub fn from_bytes(bytes: Zeroizing<Vec<u8>>) -> TrustResult<Self> {
        Share::try_from(bytes.as_slice())
            .map_err(|e| TrustError::invalid_request(format!("malformed key share: {}", e)))?;
        if bytes.first().copied().unwrap_or(0) == 0 {
            return Err(TrustError::invalid_request("key share has no id"));
        }
        Ok(Self { bytes })
    }

    pub fn share_id(&self) -> u8 {
        self.bytes[0]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for ShareMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareMaterial")
            .field("share_id", &self.share_id())
            .finish_non_exhaustive()
    }
}

/// Check a k-of-n policy: `2 <= k < n <= 255`.
pub fn validate_policy(threshold: u8, total: u8) -> TrustResult<()> {
    if threshold < 2 || threshold >= total {
        return Err(TrustError::invalid_request(format!(
            "threshold must satisfy 2 <= k < n, got {}-of-{}",
            threshold, total
        )));
    }
    Ok(())
}

/// Split `key` into `total` shares, any `threshold` of which recover it.
pub fn split(key: &[u8], threshold: u8, total: u8) -> TrustResult<Vec<ShareMaterial>> {
    validate_policy(threshold, total)?;
    if key.is_empty() {
        return Err(TrustError::invalid_request("disk key is empty"));
    }

    let dealer = Sharks(threshold).dealer_rng(key, &mut OsRng);
    Ok(dealer
        .take(total as usize)
        .map(|share| ShareMaterial {
            bytes: Zeroizing::new(Vec::from(&share)),
        })
        .collect())
}

/// Reconstruct the key from at least `threshold` distinct shares.
pub fn combine<'a>(
    threshold: u8,
    shares: impl IntoIterator<Item = &'a ShareMaterial>,
) -> TrustResult<DiskKey> {
    let parsed: Vec<Share> = shares
        .into_iter()
        .map(|s| Share::try_from(s.as_bytes()))
        .collect::<Result<_, _>>()
        .map_err(|e| TrustError::internal(format!("malformed key share: {}", e)))?;

    let mut ids: Vec<u8> = parsed.iter().map(|s| Vec::from(s)[0]).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() < threshold as usize {
        return Err(TrustError::InsufficientShares {
            needed: threshold as usize,
            retrieved: ids.len(),
        });
    }

    Sharks(threshold)
        .recover(parsed.iter())
        .map(Zeroizing::new)
        .map_err(|e| TrustError::internal(format!("share recovery failed: {}", e)))
}
