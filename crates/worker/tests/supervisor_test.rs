use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cuniculus_core::{
    AppConfig, CuniculusError, HealthCheckConfig, JobEnvelope, JobRegistry, QueueSpec,
    CUNICULUS_EXCHANGE, DEAD_QUEUE_NAME, DEFAULT_QUEUE_NAME,
};
use cuniculus_infrastructure::topology;
use cuniculus_testing_utils::{wait_until, FailingHandler, MockBroker, RecordingHandler, TestEnv};
use cuniculus_worker::{ErrorContext, LoggingErrorReporter, Supervisor};

const WAIT: Duration = Duration::from_secs(5);

fn config(queues: Vec<QueueSpec>, default_queue: bool) -> AppConfig {
    AppConfig {
        queues,
        default_queue,
        ..AppConfig::default()
    }
}

fn recording_registry(handler: &RecordingHandler) -> Arc<JobRegistry> {
    let mut registry = JobRegistry::new();
    registry.register("Record", Arc::new(handler.clone()));
    Arc::new(registry)
}

async fn supervisor(
    broker: &MockBroker,
    config: AppConfig,
    registry: Arc<JobRegistry>,
) -> Supervisor {
    Supervisor::new(
        config,
        broker.connector(),
        registry,
        Arc::new(LoggingErrorReporter),
    )
    .await
    .unwrap()
}

fn job(class: &str) -> Vec<u8> {
    JobEnvelope::new(class, vec![json!("payload")])
        .to_bytes()
        .unwrap()
}

#[tokio::test]
async fn test_new_declares_every_configured_queue() {
    let broker = MockBroker::new();
    let config = config(
        vec![QueueSpec::new("mail").with_max_retry(2).with_prefetch_count(3)],
        true,
    );
    let supervisor = supervisor(&broker, config, Arc::new(JobRegistry::new())).await;

    assert_eq!(supervisor.queues().await, vec![DEFAULT_QUEUE_NAME, "mail"]);

    let names = broker.queue_names();
    for name in ["mail", "mail_1", "mail_2", DEFAULT_QUEUE_NAME, DEAD_QUEUE_NAME] {
        assert!(names.iter().any(|n| n == name), "missing queue {name}");
    }
    assert!(!names.iter().any(|n| n == "mail_3"));

    // 每个队列一个通道，prefetch按队列配置设置
    assert_eq!(broker.channels_created(), 2);
    let prefetches: Vec<Option<u16>> = (1..=2).map(|id| broker.prefetch(id)).collect();
    assert!(prefetches.contains(&Some(3)));
    assert!(prefetches.contains(&Some(QueueSpec::default().prefetch_count)));

    assert_eq!(supervisor.alive_consumers().await, 0);
}

#[tokio::test]
async fn test_start_consumes_jobs() {
    let broker = MockBroker::new();
    let handler = RecordingHandler::new();
    let supervisor = supervisor(
        &broker,
        config(vec![QueueSpec::new("mail")], false),
        recording_registry(&handler),
    )
    .await;

    supervisor.start().await.unwrap();
    assert_eq!(supervisor.alive_consumers().await, 1);

    broker.publish_direct(CUNICULUS_EXCHANGE, "mail", &job("Record"));
    assert!(wait_until(WAIT, || handler.call_count() == 1).await);
    assert_eq!(handler.calls(), vec![vec![json!("payload")]]);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_dead_consumer_is_replaced_on_the_same_channel() {
    let broker = MockBroker::new();
    let handler = RecordingHandler::new();
    let supervisor = supervisor(
        &broker,
        config(vec![QueueSpec::new("mail"), QueueSpec::new("sms")], false),
        recording_registry(&handler),
    )
    .await;
    supervisor.start().await.unwrap();

    let old_tag = supervisor.consumer_tag("mail").await.unwrap();
    let channels = broker.channels_created();

    assert_eq!(broker.fail_subscription("mail"), 1);
    assert!(wait_until(WAIT, || supervisor.replacements() == 1).await);
    assert!(
        TestEnv::wait_for(
            || {
                let supervisor = supervisor.clone();
                async move { supervisor.alive_consumers().await == 2 }
            },
            WAIT
        )
        .await
    );

    let new_tag = supervisor.consumer_tag("mail").await.unwrap();
    assert_ne!(old_tag, new_tag);
    assert_eq!(broker.channels_created(), channels);
    assert_eq!(broker.subscriber_count("mail"), 1);

    broker.publish_direct(CUNICULUS_EXCHANGE, "mail", &job("Record"));
    assert!(wait_until(WAIT, || handler.call_count() == 1).await);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_no_replacement_after_stop() {
    let broker = MockBroker::new();
    let supervisor = supervisor(
        &broker,
        config(vec![QueueSpec::new("mail")], false),
        Arc::new(JobRegistry::new()),
    )
    .await;
    supervisor.start().await.unwrap();
    supervisor.stop().await;

    assert!(supervisor.is_done());
    supervisor
        .consumer_exception("mail", &CuniculusError::broker_error("consumer cancelled"))
        .await
        .unwrap();

    assert_eq!(supervisor.replacements(), 0);
    assert!(supervisor.queues().await.is_empty());
    assert_eq!(broker.subscriber_count("mail"), 0);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_stop_after_processing_leaves_nothing_unacked() {
    let broker = MockBroker::new();
    let handler = RecordingHandler::new();
    let supervisor = supervisor(
        &broker,
        config(vec![QueueSpec::new("mail")], false),
        recording_registry(&handler),
    )
    .await;
    supervisor.start().await.unwrap();

    for _ in 0..3 {
        broker.publish_direct(CUNICULUS_EXCHANGE, "mail", &job("Record"));
    }
    assert!(wait_until(WAIT, || broker.acks().len() == 3).await);

    supervisor.stop().await;
    assert_eq!(broker.queue_len("mail"), 0);
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(supervisor.alive_consumers().await, 0);
}

#[tokio::test]
async fn test_queue_conflict_is_fatal() {
    let broker = MockBroker::new();
    let connection = broker.open_connection().await;
    let channel = connection.create_channel().await.unwrap();
    topology::declare(channel, &QueueSpec::new("mail").with_durable(false), 60_000)
        .await
        .unwrap();

    let result = Supervisor::new(
        config(vec![QueueSpec::new("mail")], false),
        broker.connector(),
        Arc::new(JobRegistry::new()),
        Arc::new(LoggingErrorReporter),
    )
    .await;

    match result {
        Err(CuniculusError::QueueConflict { queue, .. }) => assert_eq!(queue, "mail"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("conflicting declaration accepted"),
    }
}

#[tokio::test]
async fn test_unreachable_broker_fails_startup() {
    let broker = MockBroker::new();
    broker.set_online(false);

    let result = Supervisor::with_default_reporter(
        config(vec![], true),
        broker.connector(),
        Arc::new(JobRegistry::new()),
    )
    .await;

    assert!(matches!(result, Err(CuniculusError::BrokerConnection(_))));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let broker = MockBroker::new();
    let result = Supervisor::with_default_reporter(
        config(vec![QueueSpec::new("mail").with_concurrency(0)], false),
        broker.connector(),
        Arc::new(JobRegistry::new()),
    )
    .await;

    assert!(matches!(result, Err(CuniculusError::Configuration(_))));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test]
async fn test_custom_reporter_sees_job_failures() {
    let broker = MockBroker::new();
    let mut registry = JobRegistry::new();
    registry.register("Fail", Arc::new(FailingHandler::new()));

    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = reported.clone();
    let supervisor = Supervisor::new(
        config(vec![QueueSpec::new("mail").with_max_retry(1)], false),
        broker.connector(),
        Arc::new(registry),
        Arc::new(move |e: &CuniculusError, ctx: &ErrorContext<'_>| {
            sink.lock()
                .unwrap()
                .push(format!("{}:{}:{}", ctx.queue, e.kind(), ctx.retries));
        }),
    )
    .await
    .unwrap();
    supervisor.start().await.unwrap();

    broker.publish_direct(CUNICULUS_EXCHANGE, "mail", &job("Fail"));
    assert!(wait_until(WAIT, || broker.queue_len("mail_1") == 1).await);
    assert_eq!(*reported.lock().unwrap(), vec!["mail:ExecutionError:0"]);

    supervisor.stop().await;
}

#[tokio::test]
async fn test_health_check_runs_with_supervisor() {
    let broker = MockBroker::new();
    let config = AppConfig {
        health_check: HealthCheckConfig {
            enabled: true,
            bind_to: "127.0.0.1".to_string(),
            port: 0,
        },
        ..config(vec![], true)
    };
    let supervisor = supervisor(&broker, config, Arc::new(JobRegistry::new())).await;
    assert!(supervisor.health_check_addr().await.is_none());

    supervisor.start().await.unwrap();
    let addr = supervisor.health_check_addr().await.unwrap();
    assert_ne!(addr.port(), 0);

    let response = reqwest::get(format!("http://{addr}/status")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");

    supervisor.stop().await;
    assert!(supervisor.health_check_addr().await.is_none());
}
