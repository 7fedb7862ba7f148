//! Property-based tests using proptest.
//!
//! Exercises the invariants called out for the core crate:
//! - `formatter::format` is idempotent
//! - `sampling::sample_script` is the identity rewrite at `retry_k == 0`
//! - `TempTablePool` never holds more entries than its count cap once every
//!   planned eviction has been confirmed

use proptest::prelude::*;

use speql::formatter;
use speql::pool::{CreateMetrics, TempTablePool};
use speql::sampling::{sample_script, SampleDialect};

const CURSOR: &str = "/*CURSOR_IDENTIFIER*/";

/// A small vocabulary of SQL-ish tokens rather than fully arbitrary bytes —
/// `format` is a textual pass over SQL, not a parser, so feeding it
/// structurally SQL-shaped noise exercises it far more usefully than random
/// Unicode would.
fn arb_sql_token() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("select"),
        Just("SELECT"),
        Just("a.x"),
        Just("from"),
        Just("t"),
        Just("as"),
        Just("b"),
        Just("where"),
        Just("a.x"),
        Just(">"),
        Just("0"),
        Just("and"),
        Just("'2024-1-5'"),
        Just("double"),
        Just("precision"),
        Just(";"),
    ]
}

fn arb_sql() -> impl Strategy<Value = String> {
    prop::collection::vec(arb_sql_token(), 1..12).prop_map(|tokens| tokens.join(" "))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_format_is_idempotent(sql in arb_sql()) {
        let once = formatter::format(&sql, CURSOR);
        let twice = formatter::format(&once, CURSOR);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_sample_script_is_identity_at_retry_zero(
        sql in arb_sql(),
        dialect in prop_oneof![
            Just(None),
            Just(Some(SampleDialect::Redshift)),
            Just(Some(SampleDialect::Snowflake)),
        ],
    ) {
        prop_assert_eq!(sample_script(&sql, 0, dialect, CURSOR), sql);
    }

    #[test]
    fn prop_pool_never_exceeds_count_cap_after_eviction(
        count_cap in 1usize..6,
        script_count in 1usize..12,
    ) {
        let mut pool = TempTablePool::new("speql", count_cap, u64::MAX);
        for i in 0..script_count {
            pool.update(&format!("script_{i}"), false, CreateMetrics::default());
            let plan = pool.plan_eviction();
            for name in &plan.to_drop {
                pool.confirm_dropped(name);
            }
        }
        prop_assert!(pool.len() <= count_cap);
    }
}
