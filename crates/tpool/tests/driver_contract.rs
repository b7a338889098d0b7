// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 tensor-pool developers

//! Driver contract over the fabric: exclusive producer, lease expiry
//! with revocation, and async attach plumbing. The driver service runs
//! on the same thread and is stepped explicitly between client polls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tpool::client::{Agent, ClientContext, Consumer, ConsumerOptions, Producer, ProducerOptions};
use tpool::clock;
use tpool::driver::{AsyncPoll, DriverClient, DriverConfig, DriverService, PoolPlan};
use tpool::fabric::MemFabric;
use tpool::shm::AllowedPaths;
use tpool::types::{PublishMode, ResponseCode, Role};
use tpool::wire::driver::{ShmAttachRequest, ShmAttachResponse};

const STREAM_ID: u32 = 10_000;

fn test_context(dir: &std::path::Path, fabric: Arc<MemFabric>) -> ClientContext {
    let mut context = ClientContext::new(fabric);
    context
        .set_shm_base_path(dir)
        .set_allowed_paths(AllowedPaths::new([dir]));
    context
}

fn driver_config(dir: &std::path::Path) -> DriverConfig {
    let mut config = DriverConfig::new(dir);
    config.header_nslots = 4;
    config.pool_plans = vec![PoolPlan {
        pool_id: 1,
        stride_bytes: 64,
    }];
    config
}

/// Drive an async attach to completion, stepping the driver in between.
fn attach_stepped(
    client: &mut DriverClient,
    service: &mut DriverService,
    request: ShmAttachRequest,
    role: Role,
) -> ShmAttachResponse {
    let token = client.attach_async(request).expect("attach request");
    for _ in 0..100 {
        service.do_work(clock::now_monotonic_ns()).expect("driver step");
        match client.attach_poll(token).expect("attach poll") {
            AsyncPoll::Ready(response) => {
                client.set_lease_role(role);
                return response;
            }
            AsyncPoll::NotReady => {}
        }
    }
    panic!("attach never completed");
}

#[test]
fn exclusive_producer_second_attach_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fabric = MemFabric::new();
    let context = test_context(dir.path(), Arc::clone(&fabric));
    let mut service = DriverService::new(&context, driver_config(dir.path()));

    let mut first = DriverClient::new(&context);
    let request = ShmAttachRequest {
        stream_id: STREAM_ID,
        role: Role::Producer,
        publish_mode: PublishMode::ExistingOrCreate,
        ..ShmAttachRequest::default()
    };
    let response = attach_stepped(&mut first, &mut service, request, Role::Producer);
    assert_eq!(response.code, ResponseCode::Ok);
    assert!(first.lease().is_some());

    // Second producer against the live lease: REJECTED, first unharmed.
    let mut second = DriverClient::new(&context);
    let rejected = attach_stepped(&mut second, &mut service, request, Role::Producer);
    assert_eq!(rejected.code, ResponseCode::Rejected);
    assert!(second.lease().is_none());
    assert!(first.lease().is_some());
    assert_eq!(service.core().live_lease_count(), 1);

    // The winner's regions map and frames keep flowing.
    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.set_driver(first);
    producer.finish_driver_attach(response).unwrap();
    assert!(producer.is_attached());
}

#[test]
fn lease_expiry_revokes_producer_and_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let fabric = MemFabric::new();

    let mut context = test_context(dir.path(), Arc::clone(&fabric));
    context
        .set_keepalive_interval_ns(5_000_000)
        .set_lease_expiry_grace_intervals(1);

    let mut config = driver_config(dir.path());
    config.keepalive_interval_ns = 5_000_000;
    config.lease_expiry_grace_intervals = 1;
    let mut service = DriverService::new(&context, config);

    let revocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&revocations);
    context.set_error_handler(Arc::new(move |_error, _reason| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));

    // Producer attaches and maps.
    let mut producer_client = DriverClient::new(&context);
    let request = ShmAttachRequest {
        stream_id: STREAM_ID,
        role: Role::Producer,
        publish_mode: PublishMode::ExistingOrCreate,
        ..ShmAttachRequest::default()
    };
    let response = attach_stepped(&mut producer_client, &mut service, request, Role::Producer);
    assert_eq!(response.code, ResponseCode::Ok);

    let mut producer = Producer::new(&context, ProducerOptions::new(STREAM_ID, 1)).unwrap();
    producer.set_driver(producer_client);
    producer.finish_driver_attach(response).unwrap();
    assert!(producer.is_attached());

    // Consumer attaches to the created stream.
    let mut consumer_client = DriverClient::new(&context);
    let consumer_request = ShmAttachRequest {
        stream_id: STREAM_ID,
        role: Role::Consumer,
        publish_mode: PublishMode::RequireExisting,
        ..ShmAttachRequest::default()
    };
    let consumer_response =
        attach_stepped(&mut consumer_client, &mut service, consumer_request, Role::Consumer);
    assert_eq!(consumer_response.code, ResponseCode::Ok);

    let mut consumer = Consumer::new(&context, ConsumerOptions::new(STREAM_ID, 7)).unwrap();
    consumer.set_driver(consumer_client);
    consumer.finish_driver_attach(consumer_response).unwrap();
    assert!(consumer.uses_shm());
    assert!(!consumer.lease_expired());

    // 500 ms of silence: far past interval * grace = 5 ms.
    std::thread::sleep(std::time::Duration::from_millis(500));
    service.do_work(clock::now_monotonic_ns()).unwrap();
    assert_eq!(service.core().live_lease_count(), 0);

    // Drain the revocations: the driver's poll path surfaces them, but
    // keepalive sending would race, so step the agents once each.
    let now = clock::now_monotonic_ns();
    // Suppress keepalives by expiring first: the leases are already gone
    // server-side, so any keepalive is ignored.
    producer.do_work(now).unwrap();
    consumer.do_work(now).unwrap();

    assert!(!producer.is_attached());
    assert!(consumer.lease_expired());
    assert!(!consumer.uses_shm());
    assert_eq!(revocations.load(Ordering::Relaxed), 2);

    // Both sides scheduled backoff-driven reattach.
    assert!(producer.reattach_due(now + 400_000_000));
    assert!(consumer.reattach_due(now + 400_000_000));
}

#[test]
fn attach_timeout_without_driver() {
    let dir = tempfile::tempdir().unwrap();
    let fabric = MemFabric::new();
    let mut context = test_context(dir.path(), Arc::clone(&fabric));
    context.set_message_timeout_ns(20_000_000);

    // A subscription must exist or the request offer fails outright, so
    // park one on the request stream that nothing ever services.
    let _black_hole = fabric.add_subscription(context.driver_request_addr());

    let mut client = DriverClient::new(&context);
    let token = client
        .attach_async(ShmAttachRequest {
            stream_id: STREAM_ID,
            role: Role::Consumer,
            ..ShmAttachRequest::default()
        })
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(40));
    assert!(matches!(
        client.attach_poll(token),
        Err(tpool::TpError::Timeout)
    ));
}

#[test]
fn detach_releases_stream_for_next_producer() {
    let dir = tempfile::tempdir().unwrap();
    let fabric = MemFabric::new();
    let context = test_context(dir.path(), Arc::clone(&fabric));
    let mut service = DriverService::new(&context, driver_config(dir.path()));

    let request = ShmAttachRequest {
        stream_id: STREAM_ID,
        role: Role::Producer,
        publish_mode: PublishMode::ExistingOrCreate,
        ..ShmAttachRequest::default()
    };

    let mut first = DriverClient::new(&context);
    let response = attach_stepped(&mut first, &mut service, request, Role::Producer);
    assert_eq!(response.code, ResponseCode::Ok);
    assert_eq!(response.epoch, 1);

    // Async detach, stepping the driver.
    let token = first.detach_async().unwrap();
    let mut detached = false;
    for _ in 0..100 {
        service.do_work(clock::now_monotonic_ns()).unwrap();
        if let AsyncPoll::Ready(response) = first.detach_poll(token).unwrap() {
            assert_eq!(response.code, ResponseCode::Ok);
            detached = true;
            break;
        }
    }
    assert!(detached);
    assert!(first.lease().is_none());

    // Stream is free; next producer gets the next epoch.
    let mut second = DriverClient::new(&context);
    let response = attach_stepped(&mut second, &mut service, request, Role::Producer);
    assert_eq!(response.code, ResponseCode::Ok);
    assert_eq!(response.epoch, 2);
}
