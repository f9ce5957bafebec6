//! Property-based tests for delivery invariants.
//!
//! Claim exclusivity and fan-out run against the in-memory store; attempt
//! accounting runs against the retry policy directly. No network involved.

#![allow(clippy::unwrap_used)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use herald_core::{
    Delivery, DeliveryStatus, Endpoint, EndpointId, Event, NewDelivery, SigningSecret, TenantId,
    TestClock,
};
use herald_delivery::{
    AttemptOutcome, DeliveryError, MemoryWebhookStore, RetryPolicy, SubscriptionMatcher,
    WebhookStore,
};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use tokio::{runtime::Runtime, task::JoinSet};
use uuid::Uuid;

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 50, failure_persistence: None, ..ProptestConfig::default() }
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread().worker_threads(4).enable_all().build().unwrap()
}

fn endpoint(tenant_id: TenantId, events: Vec<String>, enabled: bool) -> Endpoint {
    let now = Utc::now();
    Endpoint {
        id: EndpointId::new(),
        tenant_id,
        url: "https://example.com/hook".into(),
        secret: SigningSecret::new("whsec_test"),
        pending_secret: None,
        enabled,
        subscribed_events: events,
        created_at: now,
        updated_at: now,
    }
}

/// Per-attempt outcome: `None` is a network failure, otherwise a status.
fn outcome_strategy() -> impl Strategy<Value = Option<u16>> {
    prop_oneof![
        Just(None),
        (200u16..300).prop_map(Some),
        (300u16..600).prop_map(Some),
    ]
}

fn outcome(observed: Option<u16>) -> AttemptOutcome {
    match observed {
        Some(code) if (200..300).contains(&code) => {
            AttemptOutcome::Delivered { status_code: code, duration: Duration::from_millis(1) }
        },
        Some(code) => AttemptOutcome::failed(DeliveryError::http_status(code, "")),
        None => AttemptOutcome::failed(DeliveryError::network("connection refused")),
    }
}

fn claimed_delivery(max_attempts: i32) -> Delivery {
    let event = Event::new(TenantId::new(), "a.created", b"{}".to_vec());
    let target = endpoint(event.tenant_id, vec!["a.created".into()], true);
    let mut delivery =
        NewDelivery::for_endpoint(&target, &event, b"{}".to_vec(), max_attempts, Utc::now())
            .into_delivery(Utc::now());
    delivery.status = DeliveryStatus::Processing;
    delivery
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Overlapping claimers never receive the same delivery twice.
    #[test]
    fn concurrent_claims_are_exclusive(
        rows in 1usize..30,
        limits in prop::collection::vec(1usize..10, 2..6),
    ) {
        let rt = runtime();
        let (claimed, total) = rt.block_on(async {
            let store = Arc::new(MemoryWebhookStore::new());
            let tenant = TenantId::new();
            let now = Utc::now();
            for _ in 0..rows {
                let target = endpoint(tenant, vec!["a.created".into()], true);
                store.insert_endpoint(target.clone()).await.unwrap();
                let event = Event::new(tenant, "a.created", b"{}".to_vec());
                let new = NewDelivery::for_endpoint(&target, &event, b"{}".to_vec(), 3, now);
                store.create_delivery(new, now).await.unwrap();
            }

            let mut claimers = JoinSet::new();
            for limit in limits {
                let store = store.clone();
                claimers.spawn(async move {
                    store.claim_due(now, limit, Uuid::new_v4()).await.unwrap()
                });
            }

            let mut claimed = Vec::new();
            while let Some(batch) = claimers.join_next().await {
                claimed.extend(batch.unwrap().into_iter().map(|d| d.id));
            }
            let total = store.deliveries().await.len();
            (claimed, total)
        });

        let unique: HashSet<_> = claimed.iter().copied().collect();
        prop_assert_eq!(unique.len(), claimed.len(), "a delivery was claimed twice");
        prop_assert!(claimed.len() <= total);
    }

    /// `attempt_count` only grows, stays within budget, and every delivery
    /// reaches a terminal state within `max_attempts` attempts.
    #[test]
    fn attempt_count_is_monotonic_and_bounded(
        max_attempts in 1i32..8,
        outcomes in prop::collection::vec(outcome_strategy(), 1..12),
    ) {
        let policy = RetryPolicy::default();
        let mut delivery = claimed_delivery(max_attempts);
        let mut attempts = 0;

        for observed in outcomes {
            if delivery.is_terminal() {
                break;
            }
            let before = delivery.attempt_count;
            delivery = policy.on_outcome(delivery, &outcome(observed), Utc::now());
            attempts += 1;

            prop_assert!(delivery.attempt_count >= before);
            prop_assert!(delivery.attempt_count <= delivery.max_attempts);
            if delivery.is_terminal() {
                prop_assert!(delivery.next_attempt_at.is_none());
            } else {
                prop_assert_eq!(delivery.status, DeliveryStatus::Pending);
                prop_assert!(delivery.next_attempt_at.is_some());
                delivery.status = DeliveryStatus::Processing;
            }
        }

        prop_assert!(attempts <= max_attempts);
        if attempts == max_attempts {
            prop_assert!(delivery.is_terminal());
        }
    }

    /// Fan-out creates one delivery per enabled subscriber of the tenant and
    /// nothing more, even when dispatched repeatedly.
    #[test]
    fn fan_out_matches_subscriptions(
        subscriptions in prop::collection::vec(
            (prop::sample::subsequence(vec!["a", "b", "c"], 0..=3), any::<bool>(), any::<bool>()),
            0..12,
        ),
        repeats in 1usize..4,
    ) {
        let rt = runtime();
        let tenant = TenantId::new();
        let expected = subscriptions
            .iter()
            .filter(|(events, enabled, same_tenant)| {
                *enabled && *same_tenant && events.contains(&"a")
            })
            .count();

        let (first, later, stored) = rt.block_on(async {
            let store = Arc::new(MemoryWebhookStore::new());
            for (events, enabled, same_tenant) in &subscriptions {
                let owner = if *same_tenant { tenant } else { TenantId::new() };
                let events = if events.is_empty() { vec!["z"] } else { events.clone() };
                let events = events.into_iter().map(String::from).collect();
                store.insert_endpoint(endpoint(owner, events, *enabled)).await.unwrap();
            }

            let matcher = SubscriptionMatcher::new(store.clone(), Arc::new(TestClock::new()), 3);
            let event = Event::new(tenant, "a", b"{}".to_vec());
            let first = matcher.dispatch_event(&event).await.unwrap();
            let mut later = 0;
            for _ in 1..repeats {
                later += matcher.dispatch_event(&event).await.unwrap();
            }
            (first, later, store.deliveries().await.len())
        });

        prop_assert_eq!(first, expected);
        prop_assert_eq!(later, 0);
        prop_assert_eq!(stored, expected);
    }
}
