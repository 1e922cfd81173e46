use cachekeeper::cache::{CacheCategory, TtlPolicyManager, build_key};
use proptest::prelude::*;
use serde_json::{Map, Value, json};

fn params_from(pairs: &[(String, i64)]) -> Value {
    let mut map = Map::new();
    for (name, value) in pairs {
        map.insert(name.clone(), json!(value));
    }
    Value::Object(map)
}

proptest! {
    #[test]
    fn keys_ignore_parameter_order(
        pairs in prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8),
        principal in prop::option::of("[a-z0-9]{1,12}"),
    ) {
        let forward: Vec<(String, i64)> = pairs.clone().into_iter().collect();
        let mut backward = forward.clone();
        backward.reverse();

        let first = build_key("query", "patients", &params_from(&forward), principal.as_deref());
        let second = build_key("query", "patients", &params_from(&backward), principal.as_deref());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn different_parameters_give_different_keys(a in any::<i64>(), b in any::<i64>()) {
        prop_assume!(a != b);
        let left = build_key("query", "patients", &json!({"page": a}), None);
        let right = build_key("query", "patients", &json!({"page": b}), None);
        prop_assert_ne!(left, right);
    }

    #[test]
    fn jitter_never_leaves_the_band(percent in 0u8..=100, category in 0usize..8) {
        let manager = TtlPolicyManager::default();
        let category = CacheCategory::known()[category].clone();
        let base = manager.ttl(&category);
        let clamped = u64::from(percent.min(50));
        let spread = base * clamped / 100;

        let ttl = manager.ttl_with_jitter(&category, percent);
        prop_assert!(ttl >= base - spread && ttl <= base + spread + 1, "ttl {} base {} percent {}", ttl, base, percent);
        prop_assert!(ttl >= 1);
    }
}
