//! `link`/`deref` (`SPEC_FULL.md` §6): aliasing one key to another without
//! copying bytes.

use stripe_cache_common::CacheKey;
use tracing::instrument;

use crate::error::CacheResult;
use crate::stripe::Stripe;

#[instrument(skip(stripe), fields(?from_key, ?to_key))]
pub async fn link(stripe: &Stripe, from_key: CacheKey, to_key: CacheKey) -> CacheResult<()> {
    stripe.link(from_key, to_key);
    Ok(())
}

#[instrument(skip(stripe), fields(?key))]
pub async fn deref(stripe: &Stripe, key: CacheKey) -> CacheResult<CacheKey> {
    Ok(stripe.deref(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StripeConfig;

    #[tokio::test]
    async fn link_then_deref_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let config = StripeConfig::builder(dir.path().join("s"), 0, 16 * 1024 * 1024)
            .min_average_object_size(4096)
            .build();
        let stripe = Stripe::open(config).await.unwrap();
        let a = CacheKey::from_words([1, 0, 0, 0]);
        let b = CacheKey::from_words([2, 0, 0, 0]);

        link(&stripe, a, b).await.unwrap();
        assert_eq!(deref(&stripe, a).await.unwrap(), b);
    }
}
