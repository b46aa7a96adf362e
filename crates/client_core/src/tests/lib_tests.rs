use super::*;
use axum::{
    extract::Multipart,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use shared::{
    domain::LogKind,
    protocol::{
        DatasetUploadResponse, ProcessingResponse, SessionSnapshot, UploadResponse,
        ValidationResponse,
    },
};
use std::time::Duration;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{ApiRequest, ByteStream, Transport, FALLBACK_FAILURE_MESSAGE};

type ChunkSender = mpsc::UnboundedSender<Result<Bytes, TransportError>>;

struct ScriptedBackend {
    snapshot: std::sync::Mutex<SessionSnapshot>,
    probe_delay: Option<Duration>,
    upload_success: bool,
    validation_info: std::sync::Mutex<ValidationInfo>,
    stream: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes, TransportError>>>>,
    calls: std::sync::Mutex<Vec<&'static str>>,
}

impl ScriptedBackend {
    fn ready() -> Self {
        Self {
            snapshot: std::sync::Mutex::new(SessionSnapshot {
                client_id: Some("client-1".into()),
                has_data_set: true,
                has_labels: true,
                has_model: true,
                has_params: true,
                session_keys: vec!["data_set".into(), "model".into()],
            }),
            probe_delay: None,
            upload_success: true,
            validation_info: std::sync::Mutex::new(ValidationInfo {
                trim_seconds: 0.0,
                y_segments: 3,
                total_samples: 10.0,
                after_trim_samples: 10.0,
                available_segments: 3,
                final_segments: 3,
                will_use_all_segments: true,
            }),
            stream: std::sync::Mutex::new(None),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn without_model(self) -> Self {
        self.snapshot.lock().expect("snapshot").has_model = false;
        self
    }

    fn with_probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    fn rejecting_uploads(mut self) -> Self {
        self.upload_success = false;
        self
    }

    /// Arms the next `open_run_stream` call and returns the sender that feeds it.
    fn arm_stream(&self) -> ChunkSender {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.stream.lock().expect("stream") = Some(rx);
        tx
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().expect("calls").push(call);
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls").clone()
    }
}

#[async_trait]
impl WizardBackend for ScriptedBackend {
    async fn upload_csv(
        &self,
        filename: &str,
        _bytes: Vec<u8>,
    ) -> Result<UploadResponse, TransportError> {
        self.record("upload_csv");
        if !self.upload_success {
            return Ok(UploadResponse {
                success: false,
                message: Some("not a valid CSV file".into()),
                file_info: None,
            });
        }
        Ok(UploadResponse {
            success: true,
            message: None,
            file_info: Some(FileInfo {
                filename: filename.to_string(),
                data_shape: vec![1000, 4],
                total_samples: 10.0,
                duration_seconds: 10.0,
                max_possible_segments: 3,
            }),
        })
    }

    async fn upload_dataset(
        &self,
        _filename: &str,
        _bytes: Vec<u8>,
    ) -> Result<DatasetUploadResponse, TransportError> {
        self.record("upload_dataset");
        Ok(DatasetUploadResponse {
            success: true,
            message: None,
            total_count: Some(64),
        })
    }

    async fn validate_parameters(
        &self,
        _request: &ValidateParametersRequest,
    ) -> Result<ValidationResponse, TransportError> {
        self.record("validate_parameters");
        Ok(ValidationResponse {
            success: true,
            message: None,
            validation_info: Some(self.validation_info.lock().expect("validation").clone()),
        })
    }

    async fn process_and_save(
        &self,
        request: &ProcessRequest,
    ) -> Result<ProcessingResponse, TransportError> {
        self.record("process_and_save");
        Ok(ProcessingResponse {
            success: true,
            message: None,
            processing_info: Some(ProcessingInfo {
                segments_created: u64::from(request.y_segments),
                save_path: Some(format!("/data/{}.npy", request.save_filename)),
                file_size: Some(2048),
                processing_time: Some(0.2),
                original_shape: None,
                final_shape: None,
            }),
        })
    }

    async fn debug_session(&self) -> Result<SessionSnapshot, TransportError> {
        self.record("debug_session");
        if let Some(delay) = self.probe_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.snapshot.lock().expect("snapshot").clone())
    }

    async fn open_run_stream(&self, _kind: RunKind) -> Result<ByteStream, TransportError> {
        self.record("open_run_stream");
        match self.stream.lock().expect("stream").take() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(TransportError::RequestFailed {
                status: Some(503),
                message: "stream unavailable".into(),
            }),
        }
    }
}

fn send_chunk(tx: &ChunkSender, text: &str) {
    tx.send(Ok(Bytes::from(text.to_string())))
        .expect("run reader is alive");
}

async fn wait_for_log_len(controller: &WizardController, len: usize) {
    for _ in 0..100 {
        if controller.snapshot().await.log().len() >= len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("log never reached {len} entries");
}

async fn ready_to_run(backend: Arc<ScriptedBackend>) -> Arc<WizardController> {
    let controller = WizardController::new(backend);
    controller
        .upload_csv("walk.csv", b"t,x\n0,1\n".to_vec())
        .await
        .expect("upload");
    controller.validate().await.expect("validate");
    controller.process().await.expect("process");
    assert_eq!(controller.snapshot().await.stage(), WizardStage::ReadyToRun);
    controller
}

#[tokio::test]
async fn csv_workflow_runs_test_to_completion() {
    let backend = Arc::new(ScriptedBackend::ready());
    let controller = WizardController::new(backend.clone());
    let mut events = controller.subscribe_events();

    assert!(controller.mount().await.is_ready());
    let file = controller
        .upload_csv("walk.csv", b"t,x\n0,1\n".to_vec())
        .await
        .expect("upload");
    assert_eq!(file.max_possible_segments, 3);
    assert_eq!(controller.snapshot().await.parameters().y_segments, 3);

    controller.validate().await.expect("validate");
    controller
        .set_save_filename("  walk_segments ")
        .await
        .expect("save filename");
    let processed = controller.process().await.expect("process");
    assert_eq!(
        processed.save_path.as_deref(),
        Some("/data/walk_segments.npy")
    );

    let tx = backend.arm_stream();
    controller.start_run().await.expect("start run");
    send_chunk(&tx, "data: segment 1 ok\n\n");
    send_chunk(&tx, "data: 총 결과는 이렇답니다~ 3/3\n\n");

    assert_eq!(controller.wait_for_run().await, RunStatus::Completed);
    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::Finished);
    let texts: Vec<&str> = state.log().iter().map(|entry| entry.text.as_str()).collect();
    assert_eq!(texts, vec!["segment 1 ok", "총 결과는 이렇답니다~ 3/3"]);
    assert_eq!(state.log()[1].kind, LogKind::Completed);

    let mut saw_finished = false;
    let mut saw_session = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WizardEvent::StageChanged { to, .. } if to == WizardStage::Finished => {
                saw_finished = true
            }
            WizardEvent::SessionChecked(readiness) => saw_session = readiness.is_ready(),
            _ => {}
        }
    }
    assert!(saw_finished);
    assert!(saw_session);
}

#[tokio::test]
async fn trimmed_csv_scenario_creates_the_validated_segment_count() {
    let backend = Arc::new(ScriptedBackend::ready());
    {
        let mut info = backend.validation_info.lock().expect("validation");
        info.trim_seconds = 1.0;
        info.after_trim_samples = 9.0;
    }
    let controller = WizardController::new(backend);
    controller
        .upload_csv("walk.csv", b"t,x\n0,1\n".to_vec())
        .await
        .expect("upload");
    controller
        .set_parameters(SegmentParameters {
            trim_seconds: 1.0,
            y_segments: 3,
        })
        .await
        .expect("parameters");
    let validation = controller.validate().await.expect("validate");
    controller.set_save_filename("run1").await.expect("save filename");
    let processed = controller.process().await.expect("process");

    assert_eq!(processed.segments_created, validation.final_segments);
    assert_eq!(processed.save_path.as_deref(), Some("/data/run1.npy"));
    assert_eq!(controller.snapshot().await.stage(), WizardStage::ReadyToRun);
}

#[tokio::test]
async fn run_is_blocked_until_session_is_ready() {
    let backend = Arc::new(ScriptedBackend::ready().without_model());
    let controller = ready_to_run(backend.clone()).await;
    let _tx = backend.arm_stream();

    let err = controller.start_run().await.expect_err("session not ready");

    match err {
        ControllerError::SessionNotReady(SessionReadiness::NotReady { reason }) => {
            assert!(reason.contains("no selected model"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!backend.calls().contains(&"open_run_stream"));
    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::ReadyToRun);
    assert!(matches!(
        state.session(),
        Some(SessionReadiness::NotReady { .. })
    ));
}

#[tokio::test]
async fn commands_outside_their_stage_are_rejected() {
    let controller = WizardController::new(Arc::new(ScriptedBackend::ready()));

    let err = controller.process().await.expect_err("not validated");
    assert!(matches!(
        err,
        ControllerError::NotAllowed {
            command: Command::Process,
            stage: WizardStage::Upload
        }
    ));
    assert!(matches!(
        controller.start_run().await,
        Err(ControllerError::NotAllowed { .. })
    ));
    assert!(!controller.stop_run().await);
}

#[tokio::test]
async fn second_start_is_rejected_while_the_first_is_probing() {
    let backend =
        Arc::new(ScriptedBackend::ready().with_probe_delay(Duration::from_millis(50)));
    let controller = ready_to_run(backend.clone()).await;
    let _tx = backend.arm_stream();

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.start_run().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = controller.start_run().await;

    first.await.expect("join").expect("first run starts");
    assert!(matches!(second, Err(ControllerError::RunInProgress)));
    assert_eq!(
        backend
            .calls()
            .iter()
            .filter(|call| **call == "open_run_stream")
            .count(),
        1
    );
}

#[tokio::test]
async fn stop_cancels_the_run_and_ignores_later_chunks() {
    let backend = Arc::new(ScriptedBackend::ready());
    let controller = ready_to_run(backend.clone()).await;
    let tx = backend.arm_stream();

    controller.start_run().await.expect("start run");
    send_chunk(&tx, "data: segment 1 ok\n\n");
    wait_for_log_len(&controller, 1).await;

    assert!(controller.stop_run().await);
    assert!(!controller.stop_run().await);
    let _ = tx.send(Ok(Bytes::from_static(b"data: late line\n\n")));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(controller.wait_for_run().await, RunStatus::Stopped);
    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::ReadyToRun);
    let kinds: Vec<LogKind> = state.log().iter().map(|entry| entry.kind).collect();
    assert_eq!(kinds, vec![LogKind::Line, LogKind::Stopped]);
}

#[tokio::test]
async fn stream_failure_returns_to_ready() {
    let backend = Arc::new(ScriptedBackend::ready());
    let controller = ready_to_run(backend.clone()).await;

    let err = controller.start_run().await.expect_err("no stream armed");

    assert!(matches!(err, ControllerError::Failed(message) if message == "stream unavailable"));
    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::ReadyToRun);
    assert_eq!(state.run_status(), RunStatus::Failed);
    assert_eq!(state.log()[0].kind, LogKind::Error);

    let tx = backend.arm_stream();
    controller.start_run().await.expect("retry");
    drop(tx);
    assert_eq!(controller.wait_for_run().await, RunStatus::Completed);
}

#[tokio::test]
async fn reset_during_run_discards_the_run() {
    let backend = Arc::new(ScriptedBackend::ready());
    let controller = ready_to_run(backend.clone()).await;
    let tx = backend.arm_stream();
    controller.start_run().await.expect("start run");
    send_chunk(&tx, "data: segment 1 ok\n\n");
    wait_for_log_len(&controller, 1).await;

    controller.reset().await;
    let _ = tx.send(Ok(Bytes::from_static(b"data: late line\n\n")));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::Upload);
    assert!(state.log().is_empty());
    assert!(state.file().is_none());
}

#[tokio::test]
async fn rejected_upload_reports_server_message() {
    let controller = WizardController::new(Arc::new(ScriptedBackend::ready().rejecting_uploads()));

    let err = controller
        .upload_csv("walk.csv", Vec::new())
        .await
        .expect_err("rejected");

    assert!(matches!(err, ControllerError::Failed(message) if message == "not a valid CSV file"));
    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::Upload);
    assert_eq!(state.status(), Some("upload failed: not a valid CSV file"));
}

#[tokio::test]
async fn inconsistent_validation_is_rejected() {
    let backend = Arc::new(ScriptedBackend::ready());
    {
        let mut info = backend.validation_info.lock().expect("validation");
        info.final_segments = 4;
    }
    let controller = WizardController::new(backend);
    controller
        .upload_csv("walk.csv", Vec::new())
        .await
        .expect("upload");

    let err = controller.validate().await.expect_err("inconsistent");

    assert!(matches!(
        err,
        ControllerError::Failed(message) if message.contains("exceeds available_segments")
    ));
    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::ParametersPending);
    assert!(state.validation().is_none());
}

#[tokio::test]
async fn empty_save_filename_is_rejected() {
    let controller = WizardController::new(Arc::new(ScriptedBackend::ready()));
    assert!(controller.set_save_filename("   ").await.is_err());
    assert_eq!(
        controller.snapshot().await.save_filename(),
        shared::domain::DEFAULT_SAVE_FILENAME
    );
}

#[tokio::test]
async fn repeated_failure_reports_status_each_time() {
    let backend = Arc::new(ScriptedBackend::ready());
    backend.validation_info.lock().expect("validation").final_segments = 4;
    let controller = WizardController::new(backend);
    controller
        .upload_csv("walk.csv", Vec::new())
        .await
        .expect("upload");
    let mut events = controller.subscribe_events();

    controller.validate().await.expect_err("first attempt");
    controller.validate().await.expect_err("second attempt");

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let WizardEvent::Status(status) = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0], statuses[1]);
    assert!(statuses[0].starts_with("validation failed"));
}

#[tokio::test]
async fn dropping_the_controller_releases_a_hanging_stream() {
    let backend = Arc::new(ScriptedBackend::ready());
    let controller = ready_to_run(backend.clone()).await;
    let tx = backend.arm_stream();
    controller.start_run().await.expect("start run");
    send_chunk(&tx, "data: segment 1 ok\n\n");
    wait_for_log_len(&controller, 1).await;

    drop(controller);

    tokio::time::timeout(Duration::from_secs(1), tx.closed())
        .await
        .expect("reader task dropped the stream");
}

#[tokio::test]
async fn save_filename_waits_for_validation() {
    let controller = WizardController::new(Arc::new(ScriptedBackend::ready()));
    controller
        .upload_csv("walk.csv", b"t,x\n0,1\n".to_vec())
        .await
        .expect("upload");

    let err = controller
        .set_save_filename("run1")
        .await
        .expect_err("not validated yet");
    assert!(matches!(
        err,
        ControllerError::NotAllowed {
            command: Command::EditSaveFilename,
            stage: WizardStage::ParametersPending,
        }
    ));

    controller.validate().await.expect("validate");
    controller.set_save_filename("run1").await.expect("save filename");
    assert_eq!(controller.snapshot().await.save_filename(), "run1");
}

#[tokio::test]
async fn dataset_upload_enables_run_directly() {
    let backend = Arc::new(ScriptedBackend::ready());
    let controller = WizardController::new(backend.clone());

    let count = controller
        .upload_dataset("segments.npy", vec![0u8; 16])
        .await
        .expect("dataset upload");

    assert_eq!(count, 64);
    assert_eq!(controller.snapshot().await.stage(), WizardStage::ReadyToRun);
    assert!(!backend.calls().contains(&"validate_parameters"));
}

async fn spawn_backend(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api")
}

#[tokio::test]
async fn unreachable_service_is_reported_apart_from_incomplete_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    let backend = Arc::new(HttpBackend::connect(&format!("http://{addr}/api")).expect("backend"));

    let readiness = WizardController::new(backend).mount().await;

    let SessionReadiness::Unreachable { reason } = &readiness else {
        panic!("expected unreachable, got {readiness:?}");
    };
    assert!(reason.starts_with("could not check the session"));
    assert!(!reason.contains("incomplete"));
}

#[tokio::test]
async fn transport_surfaces_error_body_text() {
    let app = Router::new()
        .route(
            "/api/validate_parameters",
            post(|| async { (StatusCode::BAD_REQUEST, "  y_segments must be positive \n") }),
        )
        .route(
            "/api/process_and_save",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
    let backend = HttpBackend::connect(&spawn_backend(app).await).expect("backend");

    let err = backend
        .validate_parameters(&ValidateParametersRequest {
            trim_seconds: 0.0,
            y_segments: 0,
        })
        .await
        .expect_err("bad request");
    assert_eq!(err.status(), Some(400));
    assert!(matches!(
        &err,
        TransportError::RequestFailed { message, .. } if message == "y_segments must be positive"
    ));

    let err = backend
        .process_and_save(&ProcessRequest {
            trim_seconds: 0.0,
            y_segments: 1,
            save_filename: "x".into(),
        })
        .await
        .expect_err("server error");
    assert!(matches!(
        &err,
        TransportError::RequestFailed { message, .. } if message == FALLBACK_FAILURE_MESSAGE
    ));
    assert_eq!(describe_transport_error(&err), FALLBACK_FAILURE_MESSAGE);
}

#[test]
fn transport_rejects_non_http_base_url() {
    assert!(matches!(
        Transport::new("ftp://127.0.0.1/api"),
        Err(TransportError::InvalidUrl { .. })
    ));
    let transport = Transport::new("http://127.0.0.1:5000/api/").expect("transport");
    assert_eq!(
        transport.endpoint("/debug_session").expect("endpoint").as_str(),
        "http://127.0.0.1:5000/api/debug_session"
    );
}

async fn upload_csv_handler(mut multipart: Multipart) -> impl IntoResponse {
    let field = multipart
        .next_field()
        .await
        .expect("multipart")
        .expect("file field");
    assert_eq!(field.name(), Some("file"));
    let filename = field.file_name().unwrap_or_default().to_string();
    let bytes = field.bytes().await.expect("file bytes");
    assert!(!bytes.is_empty());
    (
        [(header::SET_COOKIE, "session=abc123; Path=/")],
        Json(json!({
            "success": true,
            "file_info": {
                "filename": filename,
                "data_shape": [1000.0, 4.0],
                "total_samples": 10.0,
                "duration_seconds": 10.0,
                "max_possible_segments": 2.0
            }
        })),
    )
}

async fn debug_session_handler(headers: HeaderMap) -> Json<serde_json::Value> {
    let has_cookie = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|cookie| cookie.contains("session=abc123"));
    let client_id = has_cookie.then_some("client-7");
    Json(json!({
        "client_id": client_id,
        "has_data_set": has_cookie,
        "has_labels": has_cookie,
        "has_model": has_cookie,
        "has_params": has_cookie,
        "session_keys": []
    }))
}

#[tokio::test]
async fn http_backend_keeps_session_cookie_between_calls() {
    let app = Router::new()
        .route("/api/input_csv_data_test", post(upload_csv_handler))
        .route("/api/debug_session", get(debug_session_handler));
    let backend = Arc::new(HttpBackend::connect(&spawn_backend(app).await).expect("backend"));
    let controller = WizardController::new(backend);

    let file = controller
        .upload_csv("walk.csv", b"t,x\n0,1\n".to_vec())
        .await
        .expect("upload");
    assert_eq!(file.filename, "walk.csv");
    assert_eq!(file.max_possible_segments, 2);

    assert_eq!(
        controller.mount().await,
        SessionReadiness::Ready {
            client_id: "client-7".into()
        }
    );
}

#[tokio::test]
async fn anonymous_requests_do_not_carry_the_session_cookie() {
    let app = Router::new()
        .route("/api/input_csv_data_test", post(upload_csv_handler))
        .route("/api/debug_session", get(debug_session_handler));
    let transport = Transport::new(&spawn_backend(app).await).expect("transport");

    let _: UploadResponse = transport
        .call(ApiRequest::post_file(
            "/input_csv_data_test",
            "file",
            "walk.csv",
            b"t,x\n0,1\n".to_vec(),
        ))
        .await
        .expect("upload");

    let with_cookie: SessionSnapshot = transport
        .call(ApiRequest::get("/debug_session"))
        .await
        .expect("session");
    let anonymous: SessionSnapshot = transport
        .call(ApiRequest::get("/debug_session").without_credentials())
        .await
        .expect("session");

    assert_eq!(with_cookie.client_id.as_deref(), Some("client-7"));
    assert_eq!(anonymous.client_id, None);
}

#[tokio::test]
async fn http_backend_streams_test_output_to_the_log() {
    let app = Router::new()
        .route(
            "/api/input_npy_data_test",
            post(|| async { Json(json!({ "success": true, "total_count": 12.0 })) }),
        )
        .route(
            "/api/debug_session",
            get(|| async {
                Json(json!({
                    "client_id": "client-7",
                    "has_data_set": true,
                    "has_model": true
                }))
            }),
        )
        .route(
            "/api/test",
            get(|headers: HeaderMap| async move {
                assert_eq!(
                    headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()),
                    Some("text/event-stream")
                );
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    "data: segment 1: walking\n\ndata: segment 2: running\n\ndata: 테스트가 완료되었습니다.\n\n",
                )
            }),
        );
    let backend = Arc::new(HttpBackend::connect(&spawn_backend(app).await).expect("backend"));
    let controller = WizardController::new(backend);

    assert_eq!(
        controller
            .upload_dataset("segments.npy", vec![1, 2, 3])
            .await
            .expect("dataset"),
        12
    );
    controller.start_run().await.expect("start run");

    assert_eq!(controller.wait_for_run().await, RunStatus::Completed);
    let state = controller.snapshot().await;
    let texts: Vec<&str> = state.log().iter().map(|entry| entry.text.as_str()).collect();
    assert_eq!(
        texts,
        vec!["segment 1: walking", "segment 2: running", "테스트가 완료되었습니다."]
    );
    assert_eq!(state.stage(), WizardStage::Finished);
}

#[tokio::test]
async fn broken_stream_over_http_returns_to_ready() {
    let app = Router::new()
        .route(
            "/api/input_npy_data_test",
            post(|| async { Json(json!({ "success": true, "total_count": 4 })) }),
        )
        .route(
            "/api/debug_session",
            get(|| async {
                Json(json!({
                    "client_id": "client-7",
                    "has_data_set": true,
                    "has_model": true
                }))
            }),
        )
        .route(
            "/api/test",
            get(|| async {
                let chunks = futures::stream::once(async {
                    Ok::<_, std::io::Error>(Bytes::from_static(
                        b"data: an error occurred during the test\n\n",
                    ))
                })
                .chain(futures::stream::once(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(std::io::Error::other("upstream broke"))
                }));
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    axum::body::Body::from_stream(chunks),
                )
            }),
        );
    let backend = Arc::new(HttpBackend::connect(&spawn_backend(app).await).expect("backend"));
    let controller = WizardController::new(backend);
    controller
        .upload_dataset("segments.npy", vec![1, 2, 3])
        .await
        .expect("dataset");

    controller.start_run().await.expect("start run");

    assert_eq!(controller.wait_for_run().await, RunStatus::Failed);
    let state = controller.snapshot().await;
    assert_eq!(state.stage(), WizardStage::ReadyToRun);
    let kinds: Vec<LogKind> = state.log().iter().map(|entry| entry.kind).collect();
    assert_eq!(kinds, vec![LogKind::Line, LogKind::Error]);
    assert_eq!(state.log()[0].text, "an error occurred during the test");
    assert!(state.allows(Command::Run));
}
