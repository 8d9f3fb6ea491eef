//! Cache key and store behavior through the public API.

use std::sync::Arc;

use mesh_cache::{
    CacheConfig, CacheStore, Cacher, Format, HasherPool, KeyDeriver, PacketCodec, PacketStore,
    DIGEST_LENGTH,
};
use mesh_events::Matcher;
use serde_json::json;

fn deriver(max_key_length: usize) -> KeyDeriver {
    KeyDeriver::new(max_key_length, Arc::new(HasherPool::default()))
}

#[test]
fn eighty_character_key_collapses_to_fifty() {
    // "orders.search:" is 14 characters, "q|" two more, so 64 of payload
    // makes the raw key exactly 80 characters long.
    let params = json!({ "q": "z".repeat(64) });
    let raw = deriver(0).derive_key("orders.search", Some(&params), None);
    assert_eq!(raw.len(), 80);

    let key = deriver(50).derive_key("orders.search", Some(&params), None);
    assert_eq!(key.len(), 50);
    assert_eq!(&key[..6], "orders");
    assert_eq!(key[6..].len(), DIGEST_LENGTH);
}

#[test]
fn key_length_is_bounded() {
    let actions = ["a", "svc.get", "very.long.action.name.for.testing"];
    for max in [44usize, 45, 50, 64, 100] {
        let d = deriver(max);
        for action in actions {
            for n in [0usize, 1, 10, 50, 200, 1000] {
                let params = json!({ "p": "x".repeat(n), "list": [1, 2, 3] });
                let key = d.derive_key(action, Some(&params), None);
                assert!(
                    key.chars().count() <= max.max(action.len() + 1),
                    "max={max} action={action} n={n} len={}",
                    key.len()
                );
            }
        }
    }
}

#[test]
fn equal_params_always_agree_across_derivers() {
    let a = deriver(60);
    let b = deriver(60);
    let params = json!({ "filter": { "status": "open", "owner": "ada" }, "page": 3, "q": "x".repeat(90) });
    assert_eq!(
        a.derive_key("tickets.list", Some(&params), None),
        b.derive_key("tickets.list", Some(&params), None)
    );
}

#[test]
fn codec_round_trips_in_both_formats() {
    let values = [
        json!(null),
        json!({}),
        json!({ "name": "ada", "langs": ["en", "fr"], "age": 36 }),
        json!({ "blob": "y".repeat(5_000) }),
    ];
    for format in [Format::Json, Format::MsgPack] {
        let codec = PacketCodec::new(format, 256);
        for value in &values {
            let packet = codec.encode_value(value).unwrap();
            assert_eq!(&codec.decode_value(&packet).unwrap(), value);
        }
    }
}

#[tokio::test]
async fn json_store_behaves_like_msgpack_store() {
    let matcher = Arc::new(Matcher::default());
    for format in ["json", "msgpack", "unknown-format"] {
        let config = CacheConfig {
            format: Some(format.to_string()),
            segment_count: 2,
            ..CacheConfig::default()
        };
        let store = PacketStore::new(&config, matcher.clone());
        store.start().await.unwrap();
        store.set("users.get:id|1", Some(&json!({ "id": 1 }))).await.unwrap();
        assert_eq!(store.get("users.get:id|1").await.unwrap(), Some(json!({ "id": 1 })));
    }
}

#[tokio::test]
async fn cacher_shares_one_store_between_clones() {
    let cacher = Cacher::in_memory(
        &CacheConfig::default(),
        Arc::new(Matcher::default()),
        Arc::new(HasherPool::default()),
    );
    let other = cacher.clone();
    cacher.set("posts.get:id|9", &json!("hello")).await;
    assert_eq!(other.get("posts.get:id|9").await, Some(json!("hello")));
    other.del("posts.get:id|9").await;
    assert_eq!(cacher.get("posts.get:id|9").await, None);
}
