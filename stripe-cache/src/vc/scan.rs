//! `scan` (`SPEC_FULL.md` §6): iterates every live object, letting the
//! caller decide per object whether to continue, delete it, delete all its
//! alternates, or update it.

use stripe_cache_common::CacheKey;
use tracing::instrument;

use crate::error::CacheResult;
use crate::stripe::Stripe;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanAction {
    Continue,
    Delete,
    DeleteAllAlternates,
    Update,
}

/// Walks every object known to `stripe`, invoking `on_object` for each and
/// acting on its returned [`ScanAction`]. Returns the number of objects
/// visited.
#[instrument(skip(stripe, on_object))]
pub async fn scan(stripe: &Stripe, mut on_object: impl FnMut(CacheKey) -> ScanAction) -> CacheResult<usize> {
    let keys = stripe.scan_all();
    let mut visited = 0;
    for key in keys {
        if !stripe.lookup(key) {
            continue; // raced with a concurrent remove
        }
        visited += 1;
        match on_object(key) {
            ScanAction::Continue => {}
            ScanAction::Delete | ScanAction::DeleteAllAlternates => {
                let _ = crate::vc::remove::remove(stripe, key).await;
            }
            ScanAction::Update => {
                // The core's role in an update is limited to making the
                // object's current bytes available to the caller (already
                // true via `open_read`); applying the update is the HTTP
                // collaborator's responsibility via a subsequent `open_write`.
            }
        }
    }
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StripeConfig;
    use crate::doc::DocType;
    use bytes::Bytes;

    #[tokio::test]
    async fn scan_visits_every_object_and_can_delete() {
        let dir = tempfile::tempdir().unwrap();
        let config = StripeConfig::builder(dir.path().join("s"), 0, 16 * 1024 * 1024)
            .min_average_object_size(4096)
            .build();
        let stripe = Stripe::open(config).await.unwrap();

        for i in 0..3u32 {
            let key = CacheKey::from_words([i, 0, 0, 0]);
            stripe
                .write_doc(key, key, DocType::Raw, 0, 1, Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let visited = scan(&stripe, |_| ScanAction::Delete).await.unwrap();
        assert_eq!(visited, 3);
        assert_eq!(scan(&stripe, |_| ScanAction::Continue).await.unwrap(), 0);
    }
}
