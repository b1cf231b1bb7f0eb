//! Property tests for option canonicalization and reply decoding.
//!
//! Uses proptest to verify:
//! 1. Keyword order never changes the partition or the canonical form
//! 2. Alias and canonical spellings canonicalize identically
//! 3. Reserved keywords never leak into overrides
//! 4. Reference decoding yields one record per scalar field

use proptest::prelude::*;
use quotegate_core::decode::{Decode, Decoder};
use quotegate_core::options::{OptionKey, RequestOptions, RESERVED_KEYWORDS};
use quotegate_core::protocol::Message;
use serde_json::{json, Map, Value};

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_override() -> impl Strategy<Value = (String, String)> {
    ("[A-Z][A-Z_]{2,12}", "[A-Za-z0-9]{1,6}")
}

fn arb_named_option() -> impl Strategy<Value = (String, String)> {
    prop_oneof![
        Just(("Per".to_string(), "W".to_string())),
        Just(("Currency".to_string(), "EUR".to_string())),
        Just(("Days".to_string(), "T".to_string())),
        Just(("Fill".to_string(), "P".to_string())),
        Just(("Points".to_string(), "100".to_string())),
        Just(("Quote".to_string(), "C".to_string())),
        Just(("CapChg".to_string(), "true".to_string())),
    ]
}

fn arb_keywords() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec(prop_oneof![arb_override(), arb_named_option()], 0..10).prop_map(
        |mut kws| {
            // Last value wins for duplicates; keep one value per key so
            // permutations are comparable
            kws.sort_by(|a, b| a.0.cmp(&b.0));
            kws.dedup_by(|a, b| a.0 == b.0);
            kws
        },
    )
}

// ── 1. Order invariance ──────────────────────────────────────────────

proptest! {
    #[test]
    fn keyword_order_is_irrelevant(
        kws in arb_keywords(),
        seed in any::<u64>(),
    ) {
        let mut shuffled = kws.clone();
        // Deterministic rotation + reversal stands in for a shuffle
        if !shuffled.is_empty() {
            let k = (seed as usize) % shuffled.len();
            shuffled.rotate_left(k);
            if seed % 2 == 0 {
                shuffled.reverse();
            }
        }
        let a = RequestOptions::from_keywords(kws.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let b = RequestOptions::from_keywords(shuffled.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        prop_assert_eq!(a.canonical_pairs(), b.canonical_pairs());
        prop_assert_eq!(&a, &b);
    }
}

// ── 2. Alias equivalence ─────────────────────────────────────────────

proptest! {
    #[test]
    fn alias_equals_canonical(value in "[A-Z]{1,3}") {
        for key in OptionKey::ALL {
            let via_canonical = RequestOptions::new().with_keyword(key.canonical_name(), &value);
            let via_enum = RequestOptions::new().with_option(key, &value);
            prop_assert_eq!(via_canonical.canonical_pairs(), via_enum.canonical_pairs());
        }
    }
}

// ── 3. Reserved keywords ─────────────────────────────────────────────

proptest! {
    #[test]
    fn reserved_keywords_never_forwarded(value in "[a-z0-9]{1,5}", idx in 0..RESERVED_KEYWORDS.len()) {
        let kw = RESERVED_KEYWORDS[idx];
        let opts = RequestOptions::from_keywords([(kw, value.as_str())]);
        prop_assert!(opts.is_empty());
    }
}

// ── 4. Reference decoding ────────────────────────────────────────────

proptest! {
    #[test]
    fn reference_decode_one_record_per_scalar(
        fields in prop::collection::btree_map("[A-Z_]{2,10}", -1.0e6..1.0e6_f64, 0..8),
    ) {
        let mut field_data = Map::new();
        for (name, value) in &fields {
            field_data.insert(name.clone(), json!(value));
        }
        let msg = Message::new(
            "ReferenceDataResponse",
            json!({"securityData": [{"security": "T1", "fieldData": Value::Object(field_data)}]}),
        );
        let mut out = Vec::new();
        Decoder::Reference.decode(&msg, &mut out);
        prop_assert_eq!(out.len(), fields.len());
        for record in &out {
            prop_assert_eq!(record.ticker.as_str(), "T1");
            prop_assert!(record.position.is_none());
        }
    }
}
