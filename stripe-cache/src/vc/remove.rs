//! `remove` (`SPEC_FULL.md` §6, §8 scenario 2): deletes every fragment of
//! an object starting at `key`, following the fragment-chain until a miss.

use stripe_cache_common::CacheKey;
use tracing::instrument;

use crate::error::{CacheError, CacheResult};
use crate::stripe::Stripe;

#[instrument(skip(stripe), fields(?key))]
pub async fn remove(stripe: &Stripe, key: CacheKey) -> CacheResult<()> {
    if !stripe.remove(key) {
        return Err(CacheError::RemoveFailed);
    }

    let mut frag_key = key.next_fragment_key();
    while stripe.remove(frag_key) {
        frag_key = frag_key.next_fragment_key();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StripeConfig;
    use crate::doc::DocType;
    use bytes::Bytes;

    #[tokio::test]
    async fn remove_unknown_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = StripeConfig::builder(dir.path().join("s"), 0, 16 * 1024 * 1024)
            .min_average_object_size(4096)
            .build();
        let stripe = Stripe::open(config).await.unwrap();

        let err = remove(&stripe, CacheKey::from_words([1, 1, 1, 1])).await.unwrap_err();
        assert!(matches!(err, CacheError::RemoveFailed));
    }

    #[tokio::test]
    async fn remove_known_key_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let config = StripeConfig::builder(dir.path().join("s"), 0, 16 * 1024 * 1024)
            .min_average_object_size(4096)
            .build();
        let stripe = Stripe::open(config).await.unwrap();
        let key = CacheKey::from_words([2, 2, 2, 2]);
        stripe
            .write_doc(key, key, DocType::Raw, 0, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert!(remove(&stripe, key).await.is_ok());
        assert!(!stripe.lookup(key));
    }
}
