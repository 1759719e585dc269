// Licensed under the Apache-2.0 license

use crate::common::{enrolled_device, DEVICE_ID};
use sdcle_runtime::{dispatch, process_pending, SubscriberCommand, SubscriberMessage};

#[test]
fn test_router_feeds_subscriber() {
    let mut device = enrolled_device();
    let router = device.drivers.router.clone();

    router.route(
        &format!("device/{DEVICE_ID}/commands/check_certificate_response"),
        br#"{"has_certificate":false}"#,
    );
    router.route(&format!("device/{DEVICE_ID}/telemetry/system"), b"{}");
    router.route(
        &format!("device/{DEVICE_ID}/commands/upload_certificate_response"),
        br#"{"status":"success"}"#,
    );

    assert_eq!(process_pending(&mut device.drivers), 2);
    assert!(device.drivers.platform.check_received);
    assert!(!device.drivers.platform.has_certificate);
    assert!(device.drivers.platform.upload_ok);

    let counters = router.stats().snapshot();
    assert_eq!(counters.total, 3);
    assert_eq!(counters.unknown_topic, 1);
    assert_eq!(counters.check_response, 1);
    assert_eq!(counters.upload_response, 1);
    assert_eq!(counters.dropped, 0);
}

#[test]
fn test_full_queue_drops_newest() {
    let mut device = enrolled_device();
    let router = device.drivers.router.clone();
    let topic = format!("device/{DEVICE_ID}/commands/sync_certificate_response");

    for _ in 0..device.drivers.config.queue_depth + 5 {
        router.route(&topic, br#"{"status":"success"}"#);
    }
    assert_eq!(router.stats().snapshot().dropped, 5);
    assert_eq!(
        process_pending(&mut device.drivers),
        device.drivers.config.queue_depth
    );
}

#[test]
fn test_subscription_commands() {
    let mut device = enrolled_device();
    let commands = device.drivers.topics.commands.clone();

    dispatch(
        &mut device.drivers,
        SubscriberMessage::new(SubscriberCommand::SubscribeToTopic, &[]),
    );
    dispatch(
        &mut device.drivers,
        SubscriberMessage::new(SubscriberCommand::UnsubscribeFromTopic, &[]),
    );
    assert_eq!(device.mqtt().subscribed, [commands.clone()]);
    assert_eq!(device.mqtt().unsubscribed, [commands]);
}

#[test]
fn test_failed_command_does_not_stop_processing() {
    let mut device = enrolled_device();
    let router = device.drivers.router.clone();

    router.route(
        &format!("device/{DEVICE_ID}/commands/certificate"),
        b"not a certificate",
    );
    router.route(
        &format!("device/{DEVICE_ID}/commands/check_certificate_response"),
        br#"{"has_certificate":true}"#,
    );
    assert_eq!(process_pending(&mut device.drivers), 2);
    assert!(device.drivers.platform.has_certificate);
}
