use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::any;
use modelgate::config::Config;
use modelgate::probe::{self, Detection, TriggerError};
use modelgate::storage::{self, EndpointKind};
use modelgate::transport::Transport;

async fn spawn_upstream(status: StatusCode, body: &'static str) -> String {
    let app = Router::new().route(
        "/{*path}",
        any(move || async move {
            (
                status,
                [(axum::http::header::CONTENT_TYPE, "application/json")],
                body,
            )
        }),
    );

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    format!("http://127.0.0.1:{}", addr.port())
}

fn temp_db_path() -> std::path::PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("modelgate-test-{}.sqlite", uuid::Uuid::new_v4()));
    p
}

fn test_config(min_delay_ms: u64, max_delay_ms: u64) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        database_path: None,
        admin_password: None,
        cron_schedule: "0 3 * * *".to_string(),
        cron_timezone: "UTC".to_string(),
        channel_concurrency: 5,
        max_global_concurrency: 10,
        detection_min_delay_ms: min_delay_ms,
        detection_max_delay_ms: max_delay_ms,
        global_proxy: None,
        log_retention_days: 7,
        auto_detect_enabled: false,
        detect_prompt: "1+1=2? yes or no".to_string(),
    }
}

async fn create_channel_with_model(
    db_path: &std::path::Path,
    name: &str,
    base_url: String,
    model_name: &str,
) -> (storage::Channel, storage::Model) {
    let channel = storage::create_channel(
        db_path.to_path_buf(),
        storage::CreateChannel {
            name: name.to_string(),
            base_url,
            api_key: "K".to_string(),
            proxy_url: None,
            model_filter: None,
            sort_order: 0,
            enabled: true,
        },
    )
    .await
    .expect("create channel");

    storage::insert_missing_models(
        db_path.to_path_buf(),
        channel.id.clone(),
        vec![model_name.to_string()],
    )
    .await
    .expect("insert model");

    let model = storage::list_models(db_path.to_path_buf(), Some(channel.id.clone()))
        .await
        .expect("list models")
        .into_iter()
        .find(|m| m.name == model_name)
        .expect("model row");

    (channel, model)
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn probe_success_records_log_and_endpoint() {
    let base = spawn_upstream(
        StatusCode::OK,
        r#"{"choices":[{"message":{"content":"yes"}}]}"#,
    )
    .await;

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let (_channel, model) = create_channel_with_model(&db_path, "c1", base, "gpt-4o").await;

    let config = test_config(0, 0);
    let transport = Arc::new(Transport::new(None));
    let detection = Arc::new(Detection::new(&config));
    let mut events_rx = modelgate::events::subscribe();

    for _ in 0..2 {
        tokio::spawn(probe::run_worker(
            db_path.clone(),
            transport.clone(),
            detection.clone(),
        ));
    }

    let summary = probe::trigger_full_detection(
        db_path.clone(),
        &transport,
        &detection,
        config.scheduler_defaults(),
        false,
    )
    .await
    .expect("trigger");
    assert_eq!(summary.channel_count, 1);
    assert_eq!(summary.model_count, 1);
    // gpt-4o probes CHAT and CODEX.
    assert_eq!(summary.job_count, 2);

    let model_id = model.id.clone();
    wait_until("chat probe log", || {
        let db_path = db_path.clone();
        let model_id = model_id.clone();
        async move {
            storage::list_probe_logs_for_model(db_path, model_id, 10)
                .await
                .expect("list logs")
                .iter()
                .any(|l| l.endpoint == EndpointKind::Chat && l.success)
        }
    })
    .await;

    let logs = storage::list_probe_logs_for_model(db_path.clone(), model.id.clone(), 10)
        .await
        .expect("list logs");
    let chat_log = logs
        .iter()
        .find(|l| l.endpoint == EndpointKind::Chat)
        .expect("chat log");
    assert!(chat_log.success);
    assert!(chat_log.latency_ms >= 0);
    assert_eq!(chat_log.upstream_status, Some(200));
    assert_eq!(chat_log.response_preview.as_deref(), Some("yes"));

    let refreshed = storage::get_model(db_path.clone(), model.id.clone())
        .await
        .expect("get model")
        .expect("model exists");
    assert_eq!(refreshed.last_status, Some(true));
    assert!(refreshed.detected_endpoints.contains(&EndpointKind::Chat));
    assert!(refreshed.last_checked_at_ms.is_some());

    // A SUCCESS progress event for this model came over the bus.
    let mut saw_success = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !saw_success && tokio::time::Instant::now() < deadline {
        let received =
            tokio::time::timeout(Duration::from_millis(200), events_rx.recv()).await;
        match received {
            Ok(Ok(modelgate::events::AppEvent::Progress(p))) => {
                if p.model_id == model.id
                    && p.status == modelgate::events::ProbeStatus::Success
                    && p.endpoint_type == EndpointKind::Chat
                {
                    saw_success = true;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(_)) => break,
            Err(_) => {}
        }
    }
    assert!(saw_success, "expected a SUCCESS progress event");
}

#[tokio::test]
async fn http_200_with_error_body_fails_the_probe() {
    let base = spawn_upstream(StatusCode::OK, r#"{"error":{"message":"quota exceeded"}}"#).await;

    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    // Plain model name probes CHAT only.
    let (_channel, model) = create_channel_with_model(&db_path, "c1", base, "deepseek-chat").await;

    let config = test_config(0, 0);
    let transport = Arc::new(Transport::new(None));
    let detection = Arc::new(Detection::new(&config));
    tokio::spawn(probe::run_worker(
        db_path.clone(),
        transport.clone(),
        detection.clone(),
    ));

    let summary = probe::trigger_full_detection(
        db_path.clone(),
        &transport,
        &detection,
        config.scheduler_defaults(),
        false,
    )
    .await
    .expect("trigger");
    assert_eq!(summary.job_count, 1);

    let model_id = model.id.clone();
    wait_until("failed probe log", || {
        let db_path = db_path.clone();
        let model_id = model_id.clone();
        async move {
            !storage::list_probe_logs_for_model(db_path, model_id, 10)
                .await
                .expect("list logs")
                .is_empty()
        }
    })
    .await;

    let logs = storage::list_probe_logs_for_model(db_path.clone(), model.id.clone(), 10)
        .await
        .expect("list logs");
    assert!(!logs[0].success);
    assert_eq!(logs[0].upstream_status, Some(200));
    assert_eq!(logs[0].error_message.as_deref(), Some("quota exceeded"));

    let refreshed = storage::get_model(db_path.clone(), model.id)
        .await
        .expect("get model")
        .expect("model exists");
    assert_eq!(refreshed.last_status, Some(false));
    assert!(refreshed.detected_endpoints.is_empty());
}

#[tokio::test]
async fn second_trigger_conflicts_while_queue_busy() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let base = spawn_upstream(StatusCode::OK, r#"{"choices":[]}"#).await;
    create_channel_with_model(&db_path, "c1", base, "deepseek-chat").await;

    let config = test_config(0, 0);
    let transport = Arc::new(Transport::new(None));
    let detection = Arc::new(Detection::new(&config));
    // No workers: jobs stay queued.

    probe::trigger_full_detection(
        db_path.clone(),
        &transport,
        &detection,
        config.scheduler_defaults(),
        false,
    )
    .await
    .expect("first trigger");

    let second = probe::trigger_full_detection(
        db_path.clone(),
        &transport,
        &detection,
        config.scheduler_defaults(),
        false,
    )
    .await;
    assert!(matches!(second, Err(TriggerError::Busy)));

    // The queue is untouched by the refused trigger.
    assert_eq!(detection.queue.snapshot().waiting, 1);
}

#[tokio::test]
async fn stop_drains_queue_and_cancels_in_flight_probes() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let base = spawn_upstream(StatusCode::OK, r#"{"choices":[]}"#).await;

    for i in 0..6 {
        create_channel_with_model(&db_path, &format!("c{i}"), base.clone(), "deepseek-chat").await;
    }

    // Long jitter keeps the leased job in flight while we stop.
    let config = test_config(5_000, 5_000);
    let transport = Arc::new(Transport::new(None));
    let detection = Arc::new(Detection::new(&config));
    tokio::spawn(probe::run_worker(
        db_path.clone(),
        transport.clone(),
        detection.clone(),
    ));

    let summary = probe::trigger_full_detection(
        db_path.clone(),
        &transport,
        &detection,
        config.scheduler_defaults(),
        false,
    )
    .await
    .expect("trigger");
    assert_eq!(summary.job_count, 6);

    // Let the single worker lease one job and start its jitter sleep.
    let detection_wait = detection.clone();
    wait_until("one active job", || {
        let detection = detection_wait.clone();
        async move { detection.queue.snapshot().active == 1 }
    })
    .await;

    let cleared = probe::pause_and_drain(&detection);
    assert_eq!(cleared, 5);

    // The cancelled in-flight probe records the stop message.
    let db_for_wait = db_path.clone();
    wait_until("cancelled probe log", || {
        let db_path = db_for_wait.clone();
        async move {
            let models = storage::list_models(db_path.clone(), None).await.expect("models");
            for model in models {
                let logs = storage::list_probe_logs_for_model(db_path.clone(), model.id, 10)
                    .await
                    .expect("logs");
                if logs.iter().any(|l| {
                    !l.success
                        && l.error_message.as_deref() == Some("Detection stopped by user")
                }) {
                    return true;
                }
            }
            false
        }
    })
    .await;

    let detection_idle = detection.clone();
    wait_until("queue idle", || {
        let detection = detection_idle.clone();
        async move {
            let s = detection.queue.snapshot();
            s.active == 0 && s.waiting == 0 && s.delayed == 0
        }
    })
    .await;

    // Idempotent: a second stop clears nothing.
    assert_eq!(probe::pause_and_drain(&detection), 0);
}

#[tokio::test]
async fn scheduler_config_updates_commute_on_disjoint_fields() {
    let defaults = test_config(0, 0).scheduler_defaults();

    let patch_a = || storage::SchedulerConfigPatch {
        cron: Some("30 4 * * *".to_string()),
        timezone: Some("Asia/Shanghai".to_string()),
        ..Default::default()
    };
    let patch_b = || storage::SchedulerConfigPatch {
        channel_concurrency: Some(9),
        min_delay_ms: Some(100),
        max_delay_ms: Some(200),
        ..Default::default()
    };

    let db_ab = temp_db_path();
    storage::init_db(&db_ab).expect("init_db");
    storage::update_scheduler_config(db_ab.clone(), defaults.clone(), patch_a())
        .await
        .expect("apply a");
    let ab = storage::update_scheduler_config(db_ab.clone(), defaults.clone(), patch_b())
        .await
        .expect("apply b");

    let db_ba = temp_db_path();
    storage::init_db(&db_ba).expect("init_db");
    storage::update_scheduler_config(db_ba.clone(), defaults.clone(), patch_b())
        .await
        .expect("apply b");
    let ba = storage::update_scheduler_config(db_ba.clone(), defaults.clone(), patch_a())
        .await
        .expect("apply a");

    assert_eq!(ab, ba);
}

#[tokio::test]
async fn model_sync_registers_new_models() {
    let db_path = temp_db_path();
    storage::init_db(&db_path).expect("init_db");
    let base = spawn_upstream(
        StatusCode::OK,
        r#"{"object":"list","data":[{"id":"gpt-4o"},{"id":"gemini-2.0-flash"},{"id":"text-embedding-3"}]}"#,
    )
    .await;

    let channel = storage::create_channel(
        db_path.clone(),
        storage::CreateChannel {
            name: "c1".to_string(),
            base_url: base,
            api_key: "K".to_string(),
            proxy_url: None,
            model_filter: Some("gpt,gemini".to_string()),
            sort_order: 0,
            enabled: true,
        },
    )
    .await
    .expect("create channel");

    let transport = Transport::new(None);
    let result = probe::sync_channel_models(db_path.clone(), &transport, &channel).await;
    assert!(result.error.is_none());
    assert_eq!(result.added, 2, "embedding model filtered out");

    // Idempotent: a second sync adds nothing.
    let again = probe::sync_channel_models(db_path.clone(), &transport, &channel).await;
    assert_eq!(again.added, 0);
}
