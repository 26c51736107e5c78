mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::http::StatusCode;
use common::factory;
use common::MockInflux;
use execflux::error::PublishError;
use execflux::point::Point;
use execflux::publisher::DryRunSink;
use execflux::publisher::Endpoint;
use execflux::publisher::Publisher;
use execflux::publisher::PublisherConfig;
use similar_asserts::assert_eq;

fn points(n: usize) -> Vec<Point> {
    let factory = factory();
    (0..n)
        .map(|i| factory.metric(1.0, 1024, i as i64).unwrap())
        .collect()
}

fn config(batch_size: usize, retries: u32) -> PublisherConfig {
    PublisherConfig {
        batch_size,
        retries,
        request_timeout: Duration::from_secs(2),
        dry_run: false,
    }
}

#[test_log::test(tokio::test)]
async fn small_batch_is_one_request() {
    let server = MockInflux::start(StatusCode::NO_CONTENT).await;
    let publisher = Publisher::new(server.endpoint(), config(500, 3)).unwrap();

    let batches = publisher.publish(&points(3)).await.unwrap();

    assert_eq!(batches, 1);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].uri, "/write?db=test");
    assert_eq!(
        requests[0].content_type.as_deref(),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(
        requests[0].body,
        "events,host=test-host,env=ci,etype=metric cpu=1,mem=1024 0\n\
         events,host=test-host,env=ci,etype=metric cpu=1,mem=1024 1\n\
         events,host=test-host,env=ci,etype=metric cpu=1,mem=1024 2\n"
    );
}

#[test_log::test(tokio::test)]
async fn large_input_is_split_in_order() {
    let server = MockInflux::start(StatusCode::NO_CONTENT).await;
    let publisher = Publisher::new(server.endpoint(), config(3, 3)).unwrap();

    let batches = publisher.publish(&points(7)).await.unwrap();

    assert_eq!(batches, 3);
    let timestamps: Vec<String> = server
        .requests()
        .iter()
        .map(|r| {
            r.body
                .lines()
                .filter_map(|line| line.rsplit(' ').next())
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect();
    assert_eq!(timestamps, vec!["0,1,2", "3,4,5", "6"]);
}

#[tokio::test]
async fn nothing_to_publish_sends_nothing() {
    let server = MockInflux::start(StatusCode::NO_CONTENT).await;
    let publisher = Publisher::new(server.endpoint(), config(500, 3)).unwrap();

    assert_eq!(publisher.publish(&[]).await.unwrap(), 0);
    assert!(server.requests().is_empty());
}

#[test_log::test(tokio::test)]
async fn single_attempt_against_failing_server() {
    let server = MockInflux::start(StatusCode::INTERNAL_SERVER_ERROR).await;
    let publisher = Publisher::new(server.endpoint(), config(500, 1)).unwrap();

    let err = publisher.publish(&points(2)).await.unwrap_err();

    assert_eq!(server.requests().len(), 1);
    assert!(matches!(
        err.current_context(),
        PublishError::Exhausted {
            batch: 0,
            attempts: 1
        }
    ));
    assert!(format!("{err:?}").contains("unexpected response 500"));
}

#[test_log::test(tokio::test)]
async fn retries_until_no_content() {
    let server = MockInflux::with_script(vec![
        StatusCode::INTERNAL_SERVER_ERROR,
        StatusCode::OK,
        StatusCode::NO_CONTENT,
    ])
    .await;
    let publisher = Publisher::new(server.endpoint(), config(500, 3)).unwrap();

    publisher.publish(&points(1)).await.unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|r| r.body == requests[0].body));
}

#[test_log::test(tokio::test)]
async fn exhausted_batch_stops_later_batches() {
    let server = MockInflux::start(StatusCode::SERVICE_UNAVAILABLE).await;
    let publisher = Publisher::new(server.endpoint(), config(2, 2)).unwrap();

    let err = publisher.publish(&points(5)).await.unwrap_err();

    // two attempts for the first batch, nothing for the other two
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.body.lines().count() == 2));
    assert!(matches!(
        err.current_context(),
        PublishError::Exhausted {
            batch: 0,
            attempts: 2
        }
    ));
}

#[test_log::test(tokio::test)]
async fn transport_errors_are_retried() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let url = format!("http://{addr}");
    let endpoint = Endpoint::from_parts(Some(url.as_str()), Some("test"), None, None).unwrap();
    let publisher = Publisher::new(endpoint, config(500, 2)).unwrap();

    let err = publisher.publish(&points(1)).await.unwrap_err();

    assert!(matches!(
        err.current_context(),
        PublishError::Exhausted { attempts: 2, .. }
    ));
    assert!(format!("{err:?}").contains("transport error"));
}

#[tokio::test]
async fn credentials_go_in_query() {
    let server = MockInflux::start(StatusCode::NO_CONTENT).await;
    let endpoint = Endpoint::from_parts(
        Some(server.url().as_str()),
        Some("test"),
        Some("admin"),
        Some("secret"),
    )
    .unwrap();
    let publisher = Publisher::new(endpoint, config(500, 1)).unwrap();

    publisher.publish(&points(1)).await.unwrap();

    assert_eq!(server.requests()[0].uri, "/write?db=test&u=admin&p=secret");
}

#[tokio::test]
async fn dry_run_never_touches_network() {
    let server = MockInflux::start(StatusCode::NO_CONTENT).await;
    let output = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink: DryRunSink = output.clone();
    let publisher = Publisher::dry_run(server.endpoint(), config(2, 1), sink);

    let batches = publisher.publish(&points(3)).await.unwrap();

    assert_eq!(batches, 2);
    assert!(server.requests().is_empty());

    let printed = String::from_utf8(output.lock().unwrap().clone()).unwrap();
    let url = format!("POST http://{}/write?db=test", server.addr);
    assert_eq!(printed.matches(&url).count(), 2);
    assert_eq!(printed.matches("etype=metric").count(), 3);
}

#[tokio::test]
async fn dry_run_succeeds_with_unreachable_endpoint() {
    let endpoint =
        Endpoint::from_parts(Some("http://invalid.invalid:1"), Some("db"), None, None).unwrap();
    let sink: DryRunSink = Arc::new(Mutex::new(Vec::<u8>::new()));
    let publisher = Publisher::dry_run(endpoint, config(500, 1), sink);

    assert_eq!(publisher.publish(&points(1)).await.unwrap(), 1);
}
