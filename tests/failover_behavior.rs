//! Behavior-driven tests for source selection and failover.

use std::sync::Arc;
use std::time::Duration;

use ashare_core::{
    Cache, DataFetchService, DataSourceManager, ErrorClass, FetchOptions, ManagerError,
    SourceKind,
};
use ashare_tests::{as_sources, StubSource};

struct Harness {
    sse: Arc<StubSource>,
    szse: Arc<StubSource>,
    eastmoney: Arc<StubSource>,
    manager: Arc<DataSourceManager>,
}

fn harness() -> Harness {
    let sse = StubSource::new(SourceKind::Sse, 1);
    let szse = StubSource::new(SourceKind::Szse, 2);
    let eastmoney = StubSource::new(SourceKind::Eastmoney, 3);
    let manager = Arc::new(DataSourceManager::with_sources(as_sources(&[
        &sse, &szse, &eastmoney,
    ])));
    Harness {
        sse,
        szse,
        eastmoney,
        manager,
    }
}

fn selected(manager: &DataSourceManager) -> Option<SourceKind> {
    manager.select_best_data_source().map(|source| source.kind())
}

// =============================================================================
// Failover: selection
// =============================================================================

#[tokio::test]
async fn when_primary_fails_its_probe_the_next_priority_is_promoted() {
    // Given: three healthy sources with SSE as primary
    let h = harness();
    assert_eq!(h.manager.primary(), Some(SourceKind::Sse));

    // When: SSE fails a health probe
    h.sse.set_healthy(false);
    let results = h.manager.check_all_data_sources_health().await;

    // Then: SZSE is promoted and visible to selection immediately
    assert_eq!(results.get(&SourceKind::Sse), Some(&false));
    assert_eq!(h.manager.primary(), Some(SourceKind::Szse));
    assert_eq!(selected(&h.manager), Some(SourceKind::Szse));

    // And: SSE keeps its registry entry for later recovery
    assert!(h.manager.get(SourceKind::Sse).is_some());
    assert!(!h.manager.health(SourceKind::Sse).expect("record").is_healthy);
}

#[tokio::test]
async fn when_every_source_is_unhealthy_selection_returns_none() {
    let h = harness();
    for stub in [&h.sse, &h.szse, &h.eastmoney] {
        stub.set_healthy(false);
    }

    h.manager.check_all_data_sources_health().await;

    assert_eq!(selected(&h.manager), None);
    assert_eq!(h.manager.primary(), None);
}

#[tokio::test]
async fn recovered_source_becomes_selectable_again_without_reclaiming_primary() {
    let h = harness();
    h.sse.set_healthy(false);
    h.manager.check_all_data_sources_health().await;
    assert_eq!(h.manager.primary(), Some(SourceKind::Szse));

    h.sse.set_healthy(true);
    h.manager.check_all_data_sources_health().await;

    assert!(h.manager.health(SourceKind::Sse).expect("record").is_healthy);
    assert_eq!(h.manager.primary(), Some(SourceKind::Szse));
    h.manager
        .set_primary_source(SourceKind::Sse)
        .expect("healthy source can be primary");
    assert_eq!(selected(&h.manager), Some(SourceKind::Sse));
}

#[test]
fn primary_can_only_be_set_to_a_registered_healthy_source() {
    let manager = DataSourceManager::with_sources(as_sources(&[&StubSource::new(
        SourceKind::Sse,
        1,
    )]));

    assert_eq!(
        manager.set_primary_source(SourceKind::Eastmoney),
        Err(ManagerError::NotRegistered {
            kind: SourceKind::Eastmoney
        })
    );

    for _ in 0..3 {
        manager.record_request(SourceKind::Sse, Duration::from_millis(10), false);
    }
    assert_eq!(
        manager.set_primary_source(SourceKind::Sse),
        Err(ManagerError::Unhealthy {
            kind: SourceKind::Sse
        })
    );
}

#[test]
fn disabling_leaves_fallback_and_reenabling_never_reclaims_primary() {
    let h = harness();

    h.manager
        .set_source_enabled(SourceKind::Sse, false)
        .expect("registered");
    assert_eq!(h.manager.primary(), Some(SourceKind::Szse));
    assert_eq!(
        h.manager.fallback(),
        vec![SourceKind::Szse, SourceKind::Eastmoney]
    );

    h.manager
        .set_source_enabled(SourceKind::Sse, true)
        .expect("registered");
    assert_eq!(h.manager.primary(), Some(SourceKind::Szse));
    assert_eq!(
        h.manager.fallback(),
        vec![SourceKind::Sse, SourceKind::Szse, SourceKind::Eastmoney]
    );
}

#[test]
fn priority_changes_reorder_fallback() {
    let h = harness();
    h.manager
        .set_source_priority(SourceKind::Eastmoney, 0)
        .expect("registered");

    assert_eq!(h.manager.fallback()[0], SourceKind::Eastmoney);
    // Primary is still healthy, so selection keeps it.
    assert_eq!(selected(&h.manager), Some(SourceKind::Sse));
}

// =============================================================================
// Failover: through the fetch service
// =============================================================================

#[tokio::test]
async fn repeated_request_failures_shift_traffic_to_the_next_source() {
    // Given: a service whose primary source starts failing
    let h = harness();
    h.sse.set_failing(true);
    let service = DataFetchService::new(Arc::clone(&h.manager), Arc::new(Cache::in_memory()));
    let options = FetchOptions::without_cache();

    // When: three consecutive requests fail on SSE
    for _ in 0..3 {
        let failure = service
            .get_index_data("2024-01-05", &options)
            .await
            .expect_err("sse is failing");
        assert_eq!(failure.classification, ErrorClass::Network);
    }

    // Then: the next request is served by SZSE
    let success = service
        .get_index_data("2024-01-05", &options)
        .await
        .expect("fallback source");
    assert_eq!(success.source, Some(SourceKind::Szse));
    assert_eq!(h.sse.calls(), 3);
    assert_eq!(h.szse.calls(), 1);

    let record = h.manager.health(SourceKind::Sse).expect("record");
    assert_eq!(record.error_count, 3);
    assert_eq!(record.consecutive_failures, 3);
    assert!(record.average_response_time_ms >= 0.0);
}

#[tokio::test]
async fn pinned_source_bypasses_selection() {
    let h = harness();
    let service = DataFetchService::new(Arc::clone(&h.manager), Arc::new(Cache::in_memory()));

    let success = service
        .get_szse_data(
            "2024-01-05",
            &FetchOptions::without_cache().with_source(SourceKind::Eastmoney),
        )
        .await
        .expect("pinned fetch");

    assert_eq!(success.source, Some(SourceKind::Eastmoney));
    assert_eq!(h.eastmoney.calls(), 1);
    assert_eq!(h.sse.calls(), 0);
}

#[tokio::test]
async fn pinning_a_missing_or_disabled_source_reports_no_source_available() {
    let sse = StubSource::new(SourceKind::Sse, 1);
    let szse = StubSource::new(SourceKind::Szse, 2);
    let manager = Arc::new(DataSourceManager::with_sources(as_sources(&[&sse, &szse])));
    manager
        .set_source_enabled(SourceKind::Szse, false)
        .expect("registered");
    let service = DataFetchService::new(manager, Arc::new(Cache::in_memory()));

    for pinned in [SourceKind::Eastmoney, SourceKind::Szse] {
        let failure = service
            .get_index_data(
                "2024-01-05",
                &FetchOptions::without_cache().with_source(pinned),
            )
            .await
            .expect_err("unusable pin");
        assert_eq!(failure.classification, ErrorClass::NoSourceAvailable);
    }
    assert_eq!(szse.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn health_monitor_promotes_a_new_primary_in_the_background() {
    let h = harness();
    let _monitor = h
        .manager
        .spawn_health_monitor(Duration::from_secs(30))
        .expect("monitor");

    h.sse.set_healthy(false);
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(h.manager.primary(), Some(SourceKind::Szse));
}
