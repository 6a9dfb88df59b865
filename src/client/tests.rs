use std::time::{Duration, Instant};

use serde_json::json;

use super::*;
use crate::config::Settings;
use crate::connection::IdentifiedBy;
use crate::test_support::start_chat_server;
use crate::transport::message::{Broadcast, Frame, ServerMessage};

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn started_monitor(now: Instant) -> ConnectionMonitor {
    let mut monitor = ConnectionMonitor::new(MonitorConfig::default());
    monitor.start(now);
    monitor.record_connect(now);
    monitor
}

#[test]
fn poll_interval_backs_off_monotonically_up_to_the_ceiling() {
    let monitor = ConnectionMonitor::new(MonitorConfig::default());
    assert_eq!(monitor.poll_interval_for(0), secs(3));
    for attempts in 0..50 {
        assert!(monitor.poll_interval_for(attempts + 1) >= monitor.poll_interval_for(attempts));
    }
    assert_eq!(monitor.poll_interval_for(50), secs(30));
    assert_eq!(monitor.poll_interval_for(u32::MAX), secs(30));
}

#[test]
fn stale_threshold_is_clamped() {
    let t0 = Instant::now();
    let mut monitor = started_monitor(t0);
    assert_eq!(monitor.stale_threshold(), secs(6));

    // drive attempts up while the socket stays silent
    for step in 1..=60 {
        monitor.check(t0 + secs(3 * step), true);
    }
    assert_eq!(monitor.stale_threshold(), secs(60));
}

#[test]
fn silent_open_connections_are_reopened() {
    let t0 = Instant::now();
    let mut monitor = started_monitor(t0);

    assert_eq!(monitor.check(t0 + secs(5), true), MonitorAction::Idle);
    monitor.record_ping(t0 + secs(5));
    assert_eq!(monitor.check(t0 + secs(10), true), MonitorAction::Idle);
    assert_eq!(monitor.check(t0 + secs(12), true), MonitorAction::Reopen);
    assert_eq!(monitor.reconnect_attempts(), 1);
}

#[test]
fn connecting_resets_the_backoff() {
    let t0 = Instant::now();
    let mut monitor = started_monitor(t0);
    for step in 1..=10 {
        monitor.check(t0 + secs(3 * step), false);
    }
    assert!(monitor.reconnect_attempts() > 0);
    assert!(monitor.poll_interval() > secs(3));

    monitor.record_connect(t0 + secs(31));
    assert_eq!(monitor.reconnect_attempts(), 0);
    assert_eq!(monitor.poll_interval(), secs(3));
    assert_eq!(monitor.check(t0 + secs(33), true), MonitorAction::Idle);
}

#[test]
fn closed_connections_wait_before_reopening() {
    let t0 = Instant::now();
    let mut monitor = started_monitor(t0);
    let dropped = t0 + secs(5);
    monitor.record_disconnect(dropped);

    let mut reopened = None;
    for step in 1..=40 {
        let now = t0 + secs(3 * step);
        if monitor.check(now, false) == MonitorAction::Reopen {
            reopened = Some(now);
            break;
        }
    }
    let reopened = reopened.expect("monitor eventually reopens");
    assert!(reopened.duration_since(dropped) >= secs(3));

    // a failed reopen pushes the next one further out
    monitor.record_disconnect(reopened);
    let mut next = None;
    for step in 1..=40 {
        let now = reopened + secs(3 * step);
        if monitor.check(now, false) == MonitorAction::Reopen {
            next = Some(now);
            break;
        }
    }
    let next = next.expect("monitor reopens again");
    assert!(next.duration_since(reopened) >= reopened.duration_since(dropped));
}

#[test]
fn stopped_monitors_and_hidden_clients_do_nothing() {
    let t0 = Instant::now();
    let mut monitor = started_monitor(t0);

    assert_eq!(monitor.visibility_changed(false, t0 + secs(30), true), MonitorAction::Idle);
    assert_eq!(monitor.visibility_changed(true, t0 + secs(30), true), MonitorAction::Reopen);

    monitor.stop(t0 + secs(31));
    assert!(!monitor.is_running());
    assert_eq!(monitor.check(t0 + secs(90), true), MonitorAction::Idle);
}

async fn expect_frame(consumer: &mut Consumer) -> Frame {
    tokio::time::timeout(Duration::from_secs(6), consumer.next_frame())
        .await
        .expect("frame in time")
        .expect("consumer running")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_resubscribes_after_a_remote_disconnect() {
    let mut settings = Settings::default();
    settings.heartbeat.interval_secs = 1;
    let (server, url) = start_chat_server(settings).await;

    let config = MonitorConfig {
        check_interval: Duration::from_millis(50),
        min_poll_interval: Duration::from_millis(500),
        max_poll_interval: Duration::from_secs(1),
        backoff_rate: 0.5,
        min_stale_threshold: Duration::from_millis(2_500),
        max_stale_threshold: Duration::from_secs(3),
    };
    let mut consumer = Consumer::connect(format!("{url}?user=zoe"), config);
    assert_eq!(expect_frame(&mut consumer).await, Frame::Control(ServerMessage::Welcome));

    let identifier = json!({ "channel": "ChatChannel", "room": "9" }).to_string();
    let confirmed = Frame::Control(ServerMessage::ConfirmSubscription {
        identifier: identifier.clone(),
    });
    consumer.subscribe(identifier.clone());
    assert_eq!(expect_frame(&mut consumer).await, confirmed);

    consumer.perform(identifier.clone(), "speak", json!({ "text": "hi" }));
    assert_eq!(
        expect_frame(&mut consumer).await,
        Frame::Broadcast(Broadcast {
            identifier: identifier.clone(),
            message: json!({ "text": "hi", "from": "zoe" }),
        })
    );

    server
        .remote_connections()
        .where_identified_by(IdentifiedBy::new().with("current_user", "zoe"))
        .disconnect(true)
        .unwrap();
    assert_eq!(
        expect_frame(&mut consumer).await,
        Frame::Control(ServerMessage::Disconnect {
            reason: "remote".to_string(),
            reconnect: true,
        })
    );

    assert_eq!(expect_frame(&mut consumer).await, Frame::Control(ServerMessage::Welcome));
    assert_eq!(expect_frame(&mut consumer).await, confirmed);
    consumer.close().await;
}
