use hybrid_retrieval_engine::engine::value::{blob_to_vector, vector_to_blob, vector_to_query_text};
use hybrid_retrieval_engine::engine::{schema, Engine, Value};
use proptest::prelude::*;

proptest! {
    /// The blob wire form round-trips exactly: every float32 vector
    /// encodes to a byte image and decodes back to the same values (§6).
    #[test]
    fn vector_blob_round_trips(values in proptest::collection::vec(-1000.0f32..1000.0, 0..64)) {
        let blob = vector_to_blob(&values);
        let decoded = blob_to_vector(&blob).unwrap();
        prop_assert_eq!(decoded, values);
    }

    /// The query-side JSON text form always parses back to the same
    /// vector it was built from.
    #[test]
    fn vector_query_text_round_trips(values in proptest::collection::vec(-1000.0f32..1000.0, 0..64)) {
        let text = vector_to_query_text(&values);
        let parsed: Vec<f32> = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(parsed, values);
    }

    /// `Value::from_json` never panics on an arbitrary JSON number and
    /// always classifies exact integers as `Value::Integer`.
    #[test]
    fn integer_json_numbers_classify_as_integer(n in any::<i64>()) {
        let value = Value::from_json(&serde_json::json!(n));
        prop_assert_eq!(value, Value::Integer(n));
    }

    /// A collection name matching the documented alphabet is always
    /// accepted; one containing a character outside it is always
    /// rejected, regardless of length within bounds (§4.3).
    #[test]
    fn collection_name_validation_matches_the_alphabet(
        name in "[A-Za-z0-9_]{1,64}",
        bad_char in prop_oneof![Just('-'), Just(' '), Just('.'), Just('/')],
    ) {
        prop_assert!(schema::validate_collection_name(&name).is_ok());
        let mut tainted = name.clone();
        tainted.push(bad_char);
        prop_assert!(schema::validate_collection_name(&tainted).is_err());
    }

    /// Opening and closing an engine any number of times never panics and
    /// always leaves `ping()` reporting `not_initialized` afterward.
    #[test]
    fn open_close_cycles_always_end_not_initialized(cycles in 1usize..8) {
        let mut engine = Engine::new("./target/proptest-blobs");
        for _ in 0..cycles {
            engine.open(":memory:").unwrap();
            engine.close();
        }
        prop_assert_eq!(engine.ping().as_str(), "not_initialized");
    }
}
