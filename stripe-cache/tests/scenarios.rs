//! End-to-end scenarios exercising the public `Stripe`/`vc` surface together
//! (`SPEC_FULL.md` §8): write/read, lookup/remove, overwrite, large-object
//! `pread`, and crash recovery of a torn write.

use bytes::Bytes;
use stripe_cache::config::StripeConfig;
use stripe_cache::doc::DocType;
use stripe_cache::stripe::recovery::recover;
use stripe_cache::stripe::Stripe;
use stripe_cache::vc::{self, WriteOptions};
use stripe_cache_common::CacheKey;

async fn open_stripe(dir: &std::path::Path, name: &str) -> Stripe {
    let config = StripeConfig::builder(dir.join(name), 0, 16 * 1024 * 1024)
        .min_average_object_size(4096)
        .build();
    Stripe::open(config).await.unwrap()
}

#[tokio::test]
async fn write_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let stripe = open_stripe(dir.path(), "s0").await;
    let key = CacheKey::from_words([1, 2, 3, 4]);

    vc::open_write(&stripe, key, Bytes::from_static(b"hello, cache"), WriteOptions::default())
        .await
        .unwrap();

    let body = vc::open_read(&stripe, key).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"hello, cache"));
}

#[tokio::test]
async fn lookup_then_remove_makes_it_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let stripe = open_stripe(dir.path(), "s0").await;
    let key = CacheKey::from_words([9, 9, 9, 9]);

    vc::open_write(&stripe, key, Bytes::from_static(b"x"), WriteOptions::default())
        .await
        .unwrap();
    assert!(stripe.lookup(key));

    vc::remove(&stripe, key).await.unwrap();
    assert!(!stripe.lookup(key));
    assert!(vc::open_read(&stripe, key).await.is_err());
}

#[tokio::test]
async fn overwrite_replaces_prior_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let stripe = open_stripe(dir.path(), "s0").await;
    let key = CacheKey::from_words([4, 4, 4, 4]);

    vc::open_write(&stripe, key, Bytes::from_static(b"version one"), WriteOptions::default())
        .await
        .unwrap();

    let overwrite_opts = WriteOptions {
        overwrite: true,
        ..WriteOptions::default()
    };
    vc::open_write(&stripe, key, Bytes::from_static(b"version two, longer body"), overwrite_opts)
        .await
        .unwrap();

    let body = vc::open_read(&stripe, key).await.unwrap();
    assert_eq!(body, Bytes::from_static(b"version two, longer body"));
}

#[tokio::test]
async fn large_object_pread_spans_fragments() {
    let dir = tempfile::tempdir().unwrap();
    let stripe = open_stripe(dir.path(), "s0").await;
    let key = CacheKey::from_words([7, 7, 7, 7]);

    // Exceed the default target fragment size (1 MiB) so the write path
    // must split into multiple chained fragments.
    let body: Vec<u8> = (0u32..3_000_000).map(|i| (i % 251) as u8).collect();
    vc::open_write(&stripe, key, Bytes::from(body.clone()), WriteOptions::default())
        .await
        .unwrap();

    let whole = vc::open_read(&stripe, key).await.unwrap();
    assert_eq!(whole.len(), body.len());
    assert_eq!(whole.as_ref(), body.as_slice());

    let slice = vc::open_io_pread(&stripe, key, 1_500_000, 4096).await.unwrap();
    assert_eq!(slice.as_ref(), &body[1_500_000..1_504_096]);
}

/// Simulates a crash mid-write: a Doc is appended, then a second, shorter
/// write is truncated partway through encoding to model a torn record left
/// by a process that died during an `fwrite`. Recovery must stop before the
/// torn bytes and report a clear_range covering them, the same outcome the
/// stripe's own re-open path would feed back into the directory.
#[tokio::test]
async fn crash_recovery_stops_before_a_torn_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crashed_stripe");

    let good = stripe_cache::doc::Doc {
        len: 0,
        total_len: 5,
        first_key: CacheKey::from_words([1, 1, 1, 1]),
        key: CacheKey::from_words([1, 1, 1, 1]),
        doc_type: DocType::Raw,
        sync_serial: 3,
        write_serial: 0,
        pinned_until: 0,
        fragment_offsets: vec![],
        alt_vector: Bytes::new(),
        body: Bytes::from_static(b"hello"),
    }
    .encode(true);

    let torn = stripe_cache::doc::Doc {
        len: 0,
        total_len: 9000,
        first_key: CacheKey::from_words([2, 2, 2, 2]),
        key: CacheKey::from_words([2, 2, 2, 2]),
        doc_type: DocType::Raw,
        sync_serial: 4,
        write_serial: 1,
        pinned_until: 0,
        fragment_offsets: vec![],
        alt_vector: Bytes::new(),
        body: Bytes::from(vec![0xABu8; 9000]),
    }
    .encode(true);

    let mut on_disk = good.to_vec();
    on_disk.extend_from_slice(&torn[..torn.len() / 3]); // crash mid-write

    tokio::fs::write(&path, &on_disk).await.unwrap();
    let region = tokio::fs::read(&path).await.unwrap();

    let outcome = recover(&region, 0, /* header_sync_serial */ 3, 0, 1_000_000, 4096, false);

    // The good record (sync_serial 3) is inside the window and consumed;
    // the torn record stops the scan before any of its bytes are trusted.
    assert!(outcome.new_write_pos > 0);
    assert!(outcome.new_write_pos < on_disk.len() as u64);
    assert!(outcome.clear_range.is_some());
    let (lo, hi) = outcome.clear_range.unwrap();
    assert!(lo as u64 == outcome.new_write_pos);
    assert!(hi > lo);
}

/// RAM cache hit rate under a skewed (80/20) access pattern should comfortably
/// clear a low floor once the working set has been touched once each.
#[tokio::test]
async fn ram_cache_hit_rate_floor_under_skewed_access() {
    use stripe_cache::ram_cache::clfus::ClfusCache;
    use stripe_cache::ram_cache::RamCache;

    let hot_keys: Vec<CacheKey> = (0..20u32).map(|i| CacheKey::from_words([i, 0, 0, 0])).collect();
    let body = Bytes::from(vec![0u8; 256]);
    let mut cache = ClfusCache::new(64 * 1024, false);

    for (i, key) in hot_keys.iter().enumerate() {
        cache.put(*key, body.clone(), (false, i as u32), true);
    }

    let mut hits = 0usize;
    let mut total = 0usize;
    for round in 0..500u32 {
        // 80% of accesses land on the first 4 (of 20) keys.
        let key = if round % 5 != 0 {
            hot_keys[(round % 4) as usize]
        } else {
            hot_keys[(round % hot_keys.len() as u32) as usize]
        };
        total += 1;
        let aux = (false, hot_keys.iter().position(|k| *k == key).unwrap() as u32);
        if cache.get(key, aux).is_some() {
            hits += 1;
        }
    }

    let hit_rate = hits as f64 / total as f64;
    assert!(hit_rate > 0.5, "hit rate too low under a skewed access pattern: {hit_rate}");
}
