// Property-based invariants across random inputs.

use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use agenttrace::api::{decode_cursor, encode_cursor};
use agenttrace::cost::canonical_model;
use agenttrace::domain::ModelPrice;
use agenttrace::evals::{sample_fraction, should_sample};
use agenttrace::storage::CursorPosition;

fn decimal_rate() -> impl Strategy<Value = Decimal> {
    // rates in cents-per-million up to $1000/1M
    (0u64..100_000_000).prop_map(|cents| Decimal::new(cents as i64, 5))
}

proptest! {
    // Cursor(Decode(Encode(c))) = c
    #[test]
    fn cursor_round_trips(
        id in "[a-z0-9-]{1,32}",
        secs in 0i64..4_000_000_000,
        nanos in 0u32..1_000_000_000,
    ) {
        let ts = chrono::DateTime::from_timestamp(secs, nanos).unwrap();
        let position = CursorPosition { id: id.clone(), ts };
        let decoded = decode_cursor(&encode_cursor(&position)).unwrap();
        prop_assert_eq!(decoded.id, id);
        prop_assert_eq!(decoded.ts, ts);
    }
}

proptest! {
    // cost is never negative and scales monotonically with tokens
    #[test]
    fn cost_never_negative(
        input_tokens in 0u64..10_000_000,
        output_tokens in 0u64..10_000_000,
        cache_tokens in 0u64..10_000_000,
        input_rate in decimal_rate(),
        output_rate in decimal_rate(),
    ) {
        let price = ModelPrice::new("openai", "model-x", input_rate, output_rate)
            .with_cache_read_price(input_rate);
        let cost = price.cost_for(input_tokens, output_tokens, cache_tokens);
        prop_assert!(cost >= Decimal::ZERO);

        let more = price.cost_for(input_tokens + 1000, output_tokens, cache_tokens);
        prop_assert!(more >= cost);
    }
}

proptest! {
    // zero tokens cost exactly zero under any pricing
    #[test]
    fn zero_tokens_zero_cost(
        input_rate in decimal_rate(),
        output_rate in decimal_rate(),
    ) {
        let price = ModelPrice::new("openai", "model-x", input_rate, output_rate);
        prop_assert_eq!(price.cost_for(0, 0, 0), Decimal::ZERO);
    }
}

proptest! {
    // sampling is a pure function of (evaluator, trace) and honors the
    // boundary rates
    #[test]
    fn sampling_deterministic_and_bounded(trace_id in "[a-z0-9-]{1,32}") {
        let evaluator = Uuid::from_u128(0x1234_5678_9abc_def0);
        let fraction = sample_fraction(evaluator, &trace_id);
        prop_assert!((0.0..1.0).contains(&fraction));
        prop_assert_eq!(fraction, sample_fraction(evaluator, &trace_id));

        prop_assert!(!should_sample(evaluator, &trace_id, 0.0));
        prop_assert!(should_sample(evaluator, &trace_id, 1.0));

        // monotone in the rate
        for rate in [0.1, 0.5, 0.9] {
            if should_sample(evaluator, &trace_id, rate) {
                prop_assert!(should_sample(evaluator, &trace_id, rate + 0.05));
            }
        }
    }
}

proptest! {
    // canonicalization only ever strips a suffix
    #[test]
    fn canonical_model_is_prefix(model in "[a-z0-9@.-]{1,40}") {
        let canonical = canonical_model(&model);
        prop_assert!(model.starts_with(&canonical));
        prop_assert!(canonical.len() <= model.len());
    }
}
