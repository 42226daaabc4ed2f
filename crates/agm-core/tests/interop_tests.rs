//! Integration tests for the Interop public interface.
//!
//! Each test wires two or more facades over one shared gateway and
//! exercises registration, invocation fan-out, streams, waiting for
//! methods and the telemetry recorded along the way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agm_core::monitoring::PerfManager;
use agm_core::{
    AgmError, ConnectionConfig, Gateway, Interop, InteropConfig, InvokeTarget, PerfStatus,
    StreamOptions, SubscriptionParams, SubscriptionVerdict, MONITORING_GET_EVENTS,
};
use serde_json::json;

/// Connect one named participant to `gateway` and await readiness.
async fn connect(gateway: &Gateway, application: &str) -> Interop {
    let config = InteropConfig::new(application, ConnectionConfig::new(gateway.clone()));
    let interop = Interop::new(config).expect("valid configuration");
    interop.ready().await.expect("resolution succeeds");
    interop
}

async fn register_sum(interop: &Interop) {
    interop
        .register("sum".into(), |args, _caller| {
            let a = args["a"].as_i64().unwrap_or(0);
            let b = args["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_register_and_invoke_end_to_end() {
    let gateway = Gateway::new();
    let provider = connect(&gateway, "calculator").await;
    register_sum(&provider).await;

    let caller = connect(&gateway, "dashboard").await;
    let result = caller
        .invoke("sum".into(), json!({"a": 1, "b": 2}), InvokeTarget::Best, None)
        .await
        .unwrap();

    assert_eq!(result.returned(), Some(&json!(3)));
    assert_eq!(result.succeeded(), 1);

    // The caller recorded the invocation as completed with a measured
    // duration.
    let events = caller.perf_logger().collection().get_events();
    let invoke_event = events
        .iter()
        .find(|e| e.metadata.as_deref().is_some_and(|m| m.contains("invoke")))
        .expect("invoke event recorded");
    assert_eq!(invoke_event.status, PerfStatus::Completed);
    assert!(invoke_event.elapsed.unwrap() >= 0.0);
    assert!(invoke_event.params_size.unwrap() > 0);
}

#[tokio::test]
async fn test_async_registration_and_all_target() {
    let gateway = Gateway::new();
    let a = connect(&gateway, "a").await;
    let b = connect(&gateway, "b").await;
    for provider in [&a, &b] {
        provider
            .register_async("whoami".into(), |_args, caller| async move {
                Ok(json!({"caller": caller.application}))
            })
            .await
            .unwrap();
    }

    let caller = connect(&gateway, "caller").await;
    let result = caller
        .invoke("whoami".into(), json!({}), InvokeTarget::All, None)
        .await
        .unwrap();
    assert_eq!(result.results.len(), 2);
    assert_eq!(result.succeeded(), 2);
    assert_eq!(result.returned(), Some(&json!({"caller": "caller"})));
}

#[tokio::test]
async fn test_partial_failure_does_not_reject_the_call() {
    let gateway = Gateway::new();
    let good_one = connect(&gateway, "good-1").await;
    let good_two = connect(&gateway, "good-2").await;
    let bad = connect(&gateway, "bad").await;

    for provider in [&good_one, &good_two] {
        provider
            .register("work".into(), |_args, _caller| Ok(json!("done")))
            .await
            .unwrap();
    }
    bad.register("work".into(), |_args, _caller| {
        Err(AgmError::Other("deliberate failure".into()))
    })
    .await
    .unwrap();

    let caller = connect(&gateway, "caller").await;
    let result = caller
        .invoke("work".into(), json!({}), InvokeTarget::All, None)
        .await
        .unwrap();

    assert_eq!(result.results.len(), 3);
    assert_eq!(result.succeeded(), 2);
    assert_eq!(result.failed(), 1);
    let failure = result
        .results
        .iter()
        .find(|e| e.message.is_some())
        .unwrap();
    assert!(failure.message.as_deref().unwrap().contains("deliberate"));
}

#[tokio::test]
async fn test_all_targets_failing_fails_the_call() {
    let gateway = Gateway::new();
    let bad = connect(&gateway, "bad").await;
    bad.register("work".into(), |_args, _caller| {
        Err(AgmError::Other("boom".into()))
    })
    .await
    .unwrap();

    let caller = connect(&gateway, "caller").await;
    let err = caller
        .invoke("work".into(), json!({}), InvokeTarget::All, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgmError::InvocationFailed { .. }));
}

#[tokio::test]
async fn test_unknown_method_finds_no_server_and_records_failure() {
    let gateway = Gateway::new();
    let caller = connect(&gateway, "caller").await;

    let err = caller
        .invoke("missing".into(), json!({}), InvokeTarget::Best, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgmError::NoServerFound { .. }));

    let events = caller.perf_logger().collection().get_events();
    let failed = events
        .iter()
        .find(|e| e.status == PerfStatus::Failed)
        .expect("failure recorded");
    assert!(!failed.error.as_deref().unwrap().is_empty());
}

#[tokio::test]
async fn test_discovery_queries_and_events() {
    let gateway = Gateway::new();
    let provider = connect(&gateway, "provider").await;
    let observer = connect(&gateway, "observer").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _handle = observer.on_method_added(move |method| {
        sink.lock().unwrap().push(method.name().to_string());
    });

    register_sum(&provider).await;

    assert_eq!(*seen.lock().unwrap(), vec!["sum".to_string()]);
    assert_eq!(observer.methods(Some(&"sum".into())).unwrap().len(), 1);
    assert_eq!(observer.servers(Some(&"sum".into())).unwrap().len(), 1);
    let provider_instance = &observer.servers(Some(&"sum".into())).unwrap()[0];
    assert_eq!(
        observer
            .methods_for_instance(provider_instance)
            .unwrap()
            .len(),
        1
    );

    provider.unregister("sum".into()).await.unwrap();
    assert!(observer.methods(Some(&"sum".into())).unwrap().is_empty());
}

#[tokio::test]
async fn test_operations_before_ready_fail_fast() {
    // On a current-thread runtime the resolution task cannot run before
    // the first await, so the facade is deterministically not ready here.
    let gateway = Gateway::new();
    let config = InteropConfig::new("eager", ConnectionConfig::new(gateway));
    let interop = Interop::new(config).unwrap();

    assert!(matches!(interop.methods(None), Err(AgmError::NotReady)));
    assert!(matches!(
        interop.invoke("m".into(), json!({}), InvokeTarget::Best, None).await,
        Err(AgmError::NotReady)
    ));

    // The rejected read still left a failed telemetry record behind.
    let events = interop.perf_logger().collection().get_events();
    assert!(events.iter().any(|e| {
        e.status == PerfStatus::Failed
            && e.metadata.as_deref().is_some_and(|m| m.contains("\"methods\""))
    }));

    interop.ready().await.unwrap();
    assert!(interop.methods(None).is_ok());
}

#[tokio::test]
async fn test_configuration_is_validated_synchronously() {
    let err = Interop::new(InteropConfig::default()).unwrap_err();
    assert!(matches!(err, AgmError::Config { .. }));

    let mut config = InteropConfig::new("app", ConnectionConfig::new(Gateway::new()));
    config.connection.as_mut().unwrap().protocol_version = 7;
    let err = Interop::new(config).unwrap_err();
    assert!(matches!(
        err,
        AgmError::UnsupportedProtocolVersion { version: 7 }
    ));
}

#[tokio::test]
async fn test_stream_delivery_and_terminal_close() {
    let gateway = Gateway::new();
    let provider = connect(&gateway, "provider").await;
    let stream = provider
        .create_stream("prices".into(), StreamOptions::default())
        .await
        .unwrap();

    let consumer = connect(&gateway, "consumer").await;
    let subscription = consumer
        .subscribe("prices".into(), SubscriptionParams::default())
        .await
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _data = subscription.on_data(move |data| sink.lock().unwrap().push(data.data.clone()));
    let closed = Arc::new(AtomicBool::new(false));
    let closed_flag = closed.clone();
    let _closed = subscription.on_closed(move |_| closed_flag.store(true, Ordering::SeqCst));

    stream.push(json!({"px": 42}), None).unwrap();
    assert_eq!(received.lock().unwrap().as_slice(), &[json!({"px": 42})]);

    stream.close().unwrap();
    assert!(closed.load(Ordering::SeqCst));
    assert!(subscription.is_closed());

    // Pushing after close fails and nothing more is delivered.
    let err = stream.push(json!({"px": 43}), None).unwrap_err();
    assert!(matches!(err, AgmError::StreamClosed { .. }));
    assert_eq!(received.lock().unwrap().len(), 1);

    // The failed push went into the provider's telemetry.
    let events = provider.perf_logger().collection().get_events();
    assert!(events
        .iter()
        .any(|e| e.status == PerfStatus::Failed
            && e.metadata.as_deref().is_some_and(|m| m.contains("push"))));
}

#[tokio::test]
async fn test_stream_branches_scope_delivery() {
    let gateway = Gateway::new();
    let provider = connect(&gateway, "provider").await;
    let options = StreamOptions {
        on_subscription_request: Some(Arc::new(|request| match request.branch.as_deref() {
            Some("denied") => SubscriptionVerdict::Reject("no access".into()),
            _ => SubscriptionVerdict::Accept,
        })),
        ..Default::default()
    };
    let stream = provider.create_stream("quotes".into(), options).await.unwrap();

    let fast_consumer = connect(&gateway, "fast").await;
    let fast = fast_consumer
        .subscribe(
            "quotes".into(),
            SubscriptionParams {
                branch: Some("fast".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let slow_consumer = connect(&gateway, "slow").await;
    let slow = slow_consumer
        .subscribe(
            "quotes".into(),
            SubscriptionParams {
                branch: Some("slow".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let fast_seen = Arc::new(Mutex::new(0u32));
    let fast_sink = fast_seen.clone();
    let _f = fast.on_data(move |_| *fast_sink.lock().unwrap() += 1);
    let slow_seen = Arc::new(Mutex::new(0u32));
    let slow_sink = slow_seen.clone();
    let _s = slow.on_data(move |_| *slow_sink.lock().unwrap() += 1);

    stream.push(json!(1), Some(&["fast".to_string()])).unwrap();
    stream.push(json!(2), None).unwrap();

    assert_eq!(*fast_seen.lock().unwrap(), 2);
    assert_eq!(*slow_seen.lock().unwrap(), 1);

    // A rejected branch surfaces as a subscribe failure.
    let denied = connect(&gateway, "denied").await;
    let err = denied
        .subscribe(
            "quotes".into(),
            SubscriptionParams {
                branch: Some("denied".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AgmError::SubscribeFailed { .. }));
}

#[tokio::test]
async fn test_wait_for_method_fires_once_on_the_first_match() {
    let gateway = Gateway::new();
    let waiter = Arc::new(connect(&gateway, "waiter").await);
    let provider = connect(&gateway, "provider").await;

    let task = {
        let waiter = waiter.clone();
        tokio::spawn(async move { waiter.wait_for_method("x".into()).await })
    };
    // Let the waiter install its listener before anything is announced.
    tokio::time::sleep(Duration::from_millis(10)).await;

    provider
        .register("y".into(), |_a, _c| Ok(json!(null)))
        .await
        .unwrap();
    provider
        .register("x".into(), |_a, _c| Ok(json!(1)))
        .await
        .unwrap();
    // A second announcement of the same name must not disturb the settled
    // wait.
    let other = connect(&gateway, "other").await;
    other
        .register("x".into(), |_a, _c| Ok(json!(2)))
        .await
        .unwrap();

    let method = task.await.unwrap().unwrap();
    assert_eq!(method.name(), "x");
    assert_eq!(method.server.application, "provider");
}

#[tokio::test]
async fn test_wait_for_method_times_out() {
    let gateway = Gateway::new();
    let config = InteropConfig::new("waiter", ConnectionConfig::new(gateway))
        .with_wait_timeout(Duration::from_millis(30));
    let interop = Interop::new(config).unwrap();
    interop.ready().await.unwrap();

    let err = interop.wait_for_method("never".into()).await.unwrap_err();
    assert!(matches!(err, AgmError::Timeout { .. }));
}

#[tokio::test]
async fn test_monitoring_retrieval_excludes_itself() {
    let gateway = Gateway::new();
    let manager = PerfManager::new();
    let config = InteropConfig::new("monitored", ConnectionConfig::new(gateway.clone()))
        .with_perf_logger(manager.logger());
    let provider = Interop::new(config).unwrap();
    provider.ready().await.unwrap();
    manager.register_methods(&provider).await.unwrap();
    register_sum(&provider).await;

    let before = manager.default_client().get_events().len();

    let caller = connect(&gateway, "auditor").await;
    let result = caller
        .invoke(
            MONITORING_GET_EVENTS.into(),
            json!({}),
            InvokeTarget::All,
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.succeeded(), 1);

    // Neither side recorded the retrieval: the provider's collection is
    // unchanged and the caller's has no event naming the method.
    assert_eq!(manager.default_client().get_events().len(), before);
    let caller_events = caller.perf_logger().collection().get_events();
    assert!(caller_events.iter().all(|e| {
        e.metadata
            .as_deref()
            .map_or(true, |m| !m.contains(MONITORING_GET_EVENTS))
    }));
}

#[tokio::test]
async fn test_perf_manager_aggregates_all_participants() {
    let gateway = Gateway::new();

    let manager_a = PerfManager::new();
    let a = Interop::new(
        InteropConfig::new("app-a", ConnectionConfig::new(gateway.clone()))
            .with_perf_logger(manager_a.logger()),
    )
    .unwrap();
    a.ready().await.unwrap();
    manager_a.register_methods(&a).await.unwrap();

    let manager_b = PerfManager::new();
    let b = Interop::new(
        InteropConfig::new("app-b", ConnectionConfig::new(gateway.clone()))
            .with_perf_logger(manager_b.logger()),
    )
    .unwrap();
    b.ready().await.unwrap();
    manager_b.register_methods(&b).await.unwrap();

    // Generate some instrumented traffic on both sides.
    register_sum(&a).await;
    b.invoke("sum".into(), json!({"a": 2, "b": 3}), InvokeTarget::Best, None)
        .await
        .unwrap();

    let all = manager_a.get_all(&a).await.unwrap();
    assert_eq!(all.len(), 2);
    let applications: Vec<&str> = all.iter().map(|e| e.instance.application.as_str()).collect();
    assert!(applications.contains(&"app-a"));
    assert!(applications.contains(&"app-b"));
    for instance_events in &all {
        assert!(!instance_events.events.is_empty());
        assert!(instance_events
            .events
            .iter()
            .all(|e| e.status != PerfStatus::Pending));
    }
}

#[tokio::test]
async fn test_event_ids_are_unique_and_increasing() {
    let gateway = Gateway::new();
    let interop = connect(&gateway, "busy").await;
    register_sum(&interop).await;
    for i in 0..5 {
        interop
            .invoke("sum".into(), json!({"a": i, "b": i}), InvokeTarget::Best, None)
            .await
            .unwrap();
    }
    let _ = interop.methods(None).unwrap();

    let events = interop.perf_logger().collection().get_events();
    assert!(events.len() >= 7);
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));
}

#[tokio::test]
async fn test_dropping_the_facade_disconnects() {
    let gateway = Gateway::new();
    let transient = connect(&gateway, "transient").await;
    register_sum(&transient).await;

    let observer = connect(&gateway, "observer").await;
    assert_eq!(observer.methods(Some(&"sum".into())).unwrap().len(), 1);

    drop(transient);
    assert!(observer.methods(Some(&"sum".into())).unwrap().is_empty());
    assert_eq!(observer.servers(None).unwrap().len(), 1);
}
