//! Contract tests shared by every upstream adapter.
//!
//! Each adapter is driven through a canned HTTP client, so these tests pin
//! down behavior every data source must honor regardless of its wire format.

use std::sync::Arc;

use ashare_core::{
    DataSource, EastmoneyAdapter, ErrorClass, ProviderPolicy, RetryConfig, SourceKind,
    SseAdapter, SzseAdapter,
};
use ashare_tests::CannedHttpClient;

const SSE_EQUITY: &str = r#"jsonpCallback1({"date":20240105,"time":150003,"list":[
["600100","涨停A",10.0,11.02,10.0,11.02,10.0,10.2,100000,1102000,"E111",1.02,10.2,"ASH",""],
["600200","九八B",10.0,10.98,10.0,10.98,10.0,9.8,100000,1098000,"E111",0.98,9.8,"ASH",""],
["600300","跌停C",10.0,10.0,8.98,8.98,10.0,-10.2,100000,898000,"E111",-1.02,10.2,"ASH",""]]})"#;

const SZSE_PAGE: &str = r#"[{"metadata":{"pagecount":1,"recordcount":1,"pageno":1},
"data":[{"zqdm":"<u>000001</u>","zqjc":"平安银行","qss":"10.00","ks":"10.00","zg":"10.50","zd":"9.90","ss":"10.20","sdf":"2.00","cjgs":"1.00","cjje":"10.20"}]}]"#;

const EASTMONEY_LIST: &str = r#"jQuery1({"rc":0,"data":{"total":1,"diff":[
{"f2":11.0,"f3":10.0,"f4":1.0,"f5":5000,"f6":5500000.0,"f7":8.0,"f12":"600100","f14":"涨停A","f15":11.0,"f16":10.2,"f17":10.3,"f18":10.0}]}})"#;

fn policy(kind: SourceKind) -> ProviderPolicy {
    ProviderPolicy::default_for(kind).with_retry(RetryConfig::no_retry())
}

fn adapter(kind: SourceKind, client: Arc<CannedHttpClient>) -> Arc<dyn DataSource> {
    match kind {
        SourceKind::Sse => Arc::new(SseAdapter::new(policy(kind), client)),
        SourceKind::Szse => Arc::new(SzseAdapter::new(policy(kind), client)),
        SourceKind::Eastmoney => Arc::new(EastmoneyAdapter::new(policy(kind), client)),
    }
}

fn healthy_client() -> Arc<CannedHttpClient> {
    Arc::new(
        CannedHttpClient::new()
            .body("exchange/equity", SSE_EQUITY)
            .body("exchange/index", SSE_EQUITY)
            .body("ShowReport", SZSE_PAGE)
            .body("clist/get", EASTMONEY_LIST),
    )
}

// =============================================================================
// Contract: input validation
// =============================================================================

#[tokio::test]
async fn when_date_is_malformed_every_adapter_rejects_it_without_network_calls() {
    for kind in SourceKind::ALL {
        // Given: an adapter whose transport records every request
        let client = healthy_client();
        let source = adapter(kind, Arc::clone(&client));

        // When: every operation is called with a malformed date
        for date in ["not-a-date", "2024-13-01", "20240105", ""] {
            let outcomes = [
                source.get_sse_data(date).await.err(),
                source.get_szse_data(date).await.err(),
                source.get_limit_up_data(date).await.err(),
                source.get_limit_down_data(date).await.err(),
            ];

            // Then: each fails as a validation error
            for error in outcomes {
                let error = error.expect("malformed date must fail");
                assert_eq!(error.class(), ErrorClass::Validation, "{kind} {date}");
            }
            let index = source.get_index_data(date).await.expect_err("index must fail");
            assert_eq!(index.class(), ErrorClass::Validation);
        }

        // And: nothing reached the network
        assert!(client.requests().is_empty(), "{kind} issued requests");
    }
}

// =============================================================================
// Contract: identity and runtime settings
// =============================================================================

#[test]
fn descriptors_identify_their_source_and_default_priorities_are_ordered() {
    let client = healthy_client();
    let descriptors: Vec<_> = SourceKind::ALL
        .into_iter()
        .map(|kind| adapter(kind, Arc::clone(&client)).descriptor())
        .collect();

    for (kind, descriptor) in SourceKind::ALL.into_iter().zip(&descriptors) {
        assert_eq!(descriptor.kind, kind);
        assert!(descriptor.enabled);
        assert!(descriptor.base_url.starts_with("https://"));
        assert!(descriptor
            .request_config
            .headers
            .keys()
            .any(|name| name.eq_ignore_ascii_case("referer")));
    }

    let priorities: Vec<_> = descriptors.iter().map(|d| d.priority).collect();
    assert_eq!(priorities, vec![1, 2, 3]);

    let slowest = descriptors
        .iter()
        .max_by_key(|d| d.request_config.timeout)
        .expect("three descriptors");
    assert_eq!(slowest.kind, SourceKind::Szse);
}

#[test]
fn enabled_flag_and_priority_are_mutable_through_the_trait() {
    let source = adapter(SourceKind::Eastmoney, healthy_client());

    source.set_enabled(false);
    source.set_priority(0);

    let descriptor = source.descriptor();
    assert!(!descriptor.enabled);
    assert_eq!(descriptor.priority, 0);
}

// =============================================================================
// Contract: board coverage
// =============================================================================

#[tokio::test]
async fn exchange_adapters_answer_not_applicable_for_the_other_board() {
    let client = healthy_client();

    let sse = adapter(SourceKind::Sse, Arc::clone(&client));
    let response = sse.get_szse_data("2024-01-05").await.expect("not applicable");
    assert!(response.not_applicable);
    assert_eq!(response.classification(), Some(ErrorClass::NotApplicable));
    assert!(response.data.is_empty());

    let szse = adapter(SourceKind::Szse, Arc::clone(&client));
    let response = szse.get_sse_data("2024-01-05").await.expect("not applicable");
    assert!(response.not_applicable);

    assert!(client.requests().is_empty());
}

#[tokio::test]
async fn aggregator_serves_both_boards_and_indices() {
    let client = healthy_client();
    let source = adapter(SourceKind::Eastmoney, Arc::clone(&client));

    let sse = source.get_sse_data("2024-01-05").await.expect("sse board");
    let szse = source.get_szse_data("2024-01-05").await.expect("szse board");
    let index = source.get_index_data("2024-01-05").await.expect("indices");

    assert!(!sse.not_applicable && !szse.not_applicable);
    assert_eq!(sse.data.len(), 1);
    assert_eq!(index.data.len(), 1);
    assert_eq!(client.requests().len(), 3);
}

// =============================================================================
// Contract: limit filters
// =============================================================================

#[tokio::test]
async fn limit_filters_use_the_nine_point_nine_percent_threshold() {
    let source = adapter(SourceKind::Sse, healthy_client());

    let up = source.get_limit_up_data("2024-01-05").await.expect("limit up");
    let codes: Vec<_> = up.data.iter().map(|r| r.code.as_str()).collect();
    assert_eq!(codes, vec!["600100"]);

    let down = source.get_limit_down_data("2024-01-05").await.expect("limit down");
    let codes: Vec<_> = down.data.iter().map(|r| r.code.as_str()).collect();
    assert_eq!(codes, vec!["600300"]);
}

#[tokio::test]
async fn normalized_records_are_stable_under_a_second_cleaning_pass() {
    for kind in SourceKind::ALL {
        let source = adapter(kind, healthy_client());
        let board = match kind {
            SourceKind::Szse => source.get_szse_data("2024-01-05").await,
            _ => source.get_sse_data("2024-01-05").await,
        }
        .expect("board");

        for record in board.data {
            assert_eq!(record.clone().clean(), record, "{kind} {}", record.code);
            assert!(record.low <= record.high || record.low == 0.0 || record.high == 0.0);
        }
    }
}

// =============================================================================
// Contract: failure classification
// =============================================================================

#[tokio::test]
async fn upstream_statuses_are_classified_and_carry_the_status() {
    let cases = [
        (429, ErrorClass::RateLimit),
        (403, ErrorClass::Authentication),
        (500, ErrorClass::Network),
    ];

    for kind in SourceKind::ALL {
        for (status, class) in cases {
            let client = Arc::new(
                CannedHttpClient::new()
                    .status("exchange", status)
                    .status("ShowReport", status)
                    .status("clist/get", status),
            );
            let source = adapter(kind, client);

            let error = source
                .get_index_data("2024-01-05")
                .await
                .expect_err("status failure");
            assert_eq!(error.class(), class, "{kind} status {status}");
            assert_eq!(error.http_status(), Some(status));
        }
    }
}

#[tokio::test]
async fn transport_failures_are_network_errors_not_panics() {
    for kind in SourceKind::ALL {
        let source = adapter(kind, Arc::new(CannedHttpClient::new()));
        let error = source
            .get_index_data("2024-01-05")
            .await
            .expect_err("connect failure");
        assert_eq!(error.class(), ErrorClass::Network, "{kind}");
    }
}

#[tokio::test]
async fn health_check_reflects_whether_a_real_fetch_would_succeed() {
    for kind in SourceKind::ALL {
        assert!(adapter(kind, healthy_client()).health_check().await, "{kind} healthy");

        let broken = Arc::new(CannedHttpClient::new().status("https://", 503));
        assert!(!adapter(kind, broken).health_check().await, "{kind} broken");
    }
}
