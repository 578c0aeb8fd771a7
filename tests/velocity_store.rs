use std::sync::Arc;
use std::thread;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use fraud_features::{batch_window_counts, FeatureStore, VelocityConfig};
use proptest::prelude::*;

fn day(d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2023, 1, d)
        .expect("valid date")
        .and_hms_opt(h, 0, 0)
        .expect("valid time")
}

fn base() -> NaiveDateTime {
    day(1, 0)
}

fn store(window_hours: i64) -> FeatureStore<i64> {
    FeatureStore::new(VelocityConfig::hours(window_hours)).expect("config should be valid")
}

/// Events of `key` already seen (by arrival position) inside `[t - window, t]`.
fn brute_force_count(events: &[(i64, NaiveDateTime)], upto: usize, window: Duration) -> usize {
    let (key, t) = events[upto];
    events[..=upto]
        .iter()
        .filter(|(k, ts)| *k == key && *ts >= t - window && *ts <= t)
        .count()
}

#[test]
fn prior_events_expire_after_window() {
    let store = store(24);
    assert_eq!(store.record_and_count(&1, day(1, 10)), 1);
    assert_eq!(store.record_and_count(&1, day(1, 11)), 2);
    assert_eq!(store.record_and_count(&1, day(3, 10)), 1);
}

#[test]
fn keys_are_counted_independently() {
    let store = store(24);
    assert_eq!(store.record_and_count(&1, day(1, 10)), 1);
    assert_eq!(store.record_and_count(&2, day(1, 10)), 1);
    assert_eq!(store.record_and_count(&1, day(1, 12)), 2);
    assert_eq!(store.current_count(&2, day(1, 12)), 1);
    assert_eq!(store.current_count(&3, day(1, 12)), 0);
    assert_eq!(store.tracked_keys(), 2);
}

#[test]
fn event_exactly_one_window_back_is_counted() {
    let store = store(24);
    store.record_and_count(&9, day(1, 10));
    assert_eq!(store.record_and_count(&9, day(2, 10)), 2);
    assert_eq!(
        store.record_and_count(&9, day(2, 10) + Duration::seconds(1)),
        2
    );
}

#[test]
fn reset_clears_state_and_is_idempotent() {
    let store = store(24);
    store.record_and_count(&1, day(1, 10));
    store.record_and_count(&1, day(1, 11));
    store.reset();
    store.reset();
    assert_eq!(store.tracked_keys(), 0);
    assert_eq!(store.record_and_count(&1, day(1, 12)), 1);
}

#[test]
fn late_event_within_allowed_lateness_counts_exactly() {
    let store = FeatureStore::new(VelocityConfig {
        window_seconds: 86_400,
        allowed_lateness_seconds: 6 * 3_600,
    })
    .expect("config should be valid");

    assert_eq!(store.record_and_count(&5, day(1, 8)), 1);
    assert_eq!(store.record_and_count(&5, day(2, 10)), 1);
    // Four hours late relative to the newest event; D1 08:00 is still retained.
    assert_eq!(store.record_and_count(&5, day(2, 6)), 2);
    assert_eq!(store.current_count(&5, day(2, 10)), 2);
}

#[test]
fn event_later_than_allowed_lateness_counts_only_what_is_retained() {
    let store = store(24);
    assert_eq!(store.config().allowed_lateness_seconds, 0);

    assert_eq!(store.record_and_count(&6, day(1, 10)), 1);
    assert_eq!(store.record_and_count(&6, day(3, 10)), 1);
    // D1 10:00 lies inside [D1 09:00, D2 09:00] but expired when D3 10:00
    // arrived; the late event still counts itself.
    assert_eq!(store.record_and_count(&6, day(2, 9)), 1);

    // Beyond the retention horizon, so it is not kept.
    assert_eq!(store.current_count(&6, day(2, 9)), 0);
    assert_eq!(store.current_count(&6, day(3, 10)), 1);
    assert_eq!(store.record_and_count(&6, day(3, 11)), 2);
}

#[test]
fn concurrent_calls_on_one_key_lose_no_updates() {
    let store = Arc::new(store(24));
    let at = day(4, 12);
    let threads = 8;
    let per_thread = 250;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                (0..per_thread)
                    .map(|_| store.record_and_count(&42, at))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut counts: Vec<usize> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("worker should not panic"))
        .collect();
    counts.sort_unstable();

    let total = threads * per_thread;
    assert_eq!(counts, (1..=total).collect::<Vec<_>>());
    assert_eq!(store.current_count(&42, at), total);
}

#[test]
fn concurrent_calls_on_distinct_keys_do_not_interfere() {
    let store = Arc::new(store(24));
    let handles: Vec<_> = (0..6i64)
        .map(|key| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for minute in 0..100 {
                    store.record_and_count(&key, base() + Duration::minutes(minute));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker should not panic");
    }

    assert_eq!(store.tracked_keys(), 6);
    for key in 0..6i64 {
        assert_eq!(store.current_count(&key, base() + Duration::minutes(99)), 100);
    }
}

fn sorted_events() -> impl Strategy<Value = Vec<(i64, NaiveDateTime)>> {
    prop::collection::vec((0i64..4, 0i64..(5 * 24 * 60)), 1..80).prop_map(|raw| {
        let mut events: Vec<(i64, NaiveDateTime)> = raw
            .into_iter()
            .map(|(key, minutes)| (key, base() + Duration::minutes(minutes)))
            .collect();
        events.sort_by_key(|(_, t)| *t);
        events
    })
}

proptest! {
    #[test]
    fn live_counts_match_batch_counts_for_ordered_events(
        events in sorted_events(),
        window_hours in 1i64..48,
    ) {
        let store = store(window_hours);
        let live: Vec<usize> = events
            .iter()
            .map(|(key, t)| store.record_and_count(key, *t))
            .collect();

        let keys: Vec<i64> = events.iter().map(|(k, _)| *k).collect();
        let times: Vec<NaiveDateTime> = events.iter().map(|(_, t)| *t).collect();
        let batch = batch_window_counts(&keys, &times, Duration::hours(window_hours));

        prop_assert_eq!(&live, &batch);
        for idx in 0..events.len() {
            prop_assert_eq!(
                live[idx],
                brute_force_count(&events, idx, Duration::hours(window_hours))
            );
        }
    }

    #[test]
    fn shuffled_arrival_within_lateness_counts_exactly(
        events in sorted_events(),
        seed in any::<u64>(),
    ) {
        let mut arrival = events;
        // Deterministic shuffle from the seed.
        let mut state = seed | 1;
        for idx in (1..arrival.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            arrival.swap(idx, (state % (idx as u64 + 1)) as usize);
        }

        let store = FeatureStore::new(VelocityConfig {
            window_seconds: 86_400,
            allowed_lateness_seconds: 6 * 86_400,
        })
        .expect("config should be valid");

        for idx in 0..arrival.len() {
            let (key, t) = arrival[idx];
            let live = store.record_and_count(&key, t);
            prop_assert_eq!(live, brute_force_count(&arrival, idx, Duration::hours(24)));
        }
    }
}
