use async_trait::async_trait;
use shared::{
    domain::RunKind,
    protocol::{
        DatasetUploadResponse, ProcessRequest, ProcessingResponse, SessionSnapshot,
        UploadResponse, ValidateParametersRequest, ValidationResponse,
    },
};

use crate::transport::{ApiRequest, ByteStream, Transport, TransportError};

/// Remote calls the controllers depend on.
#[async_trait]
pub trait WizardBackend: Send + Sync {
    async fn upload_csv(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, TransportError>;
    async fn upload_dataset(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<DatasetUploadResponse, TransportError>;
    async fn validate_parameters(
        &self,
        request: &ValidateParametersRequest,
    ) -> Result<ValidationResponse, TransportError>;
    async fn process_and_save(
        &self,
        request: &ProcessRequest,
    ) -> Result<ProcessingResponse, TransportError>;
    async fn debug_session(&self) -> Result<SessionSnapshot, TransportError>;
    async fn open_run_stream(&self, kind: RunKind) -> Result<ByteStream, TransportError>;
}

/// Endpoint paths, relative to the transport's base url.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRoutes {
    pub upload_csv: String,
    pub upload_dataset: String,
    pub validate: String,
    pub process: String,
    pub debug_session: String,
    pub test_stream: String,
    pub train_stream: String,
}

impl BackendRoutes {
    /// Paths exposed by the ML backend itself.
    pub fn direct() -> Self {
        Self {
            upload_csv: "/input_csv_data_test".into(),
            upload_dataset: "/input_npy_data_test".into(),
            validate: "/validate_parameters".into(),
            process: "/process_and_save".into(),
            debug_session: "/debug_session".into(),
            test_stream: "/test".into(),
            train_stream: "/train_data".into(),
        }
    }

    /// Paths exposed by the request proxy's `test_csv` group.
    pub fn proxied() -> Self {
        Self {
            upload_csv: "/test_csv/upload".into(),
            validate: "/test_csv/validate".into(),
            process: "/test_csv/process".into(),
            ..Self::direct()
        }
    }

    pub fn stream(&self, kind: RunKind) -> &str {
        match kind {
            RunKind::Testing => &self.test_stream,
            RunKind::Training => &self.train_stream,
        }
    }
}

impl Default for BackendRoutes {
    fn default() -> Self {
        Self::direct()
    }
}

pub struct HttpBackend {
    transport: Transport,
    routes: BackendRoutes,
}

impl HttpBackend {
    pub fn new(transport: Transport, routes: BackendRoutes) -> Self {
        Self { transport, routes }
    }

    pub fn connect(base_url: &str) -> Result<Self, TransportError> {
        Ok(Self::new(Transport::new(base_url)?, BackendRoutes::direct()))
    }
}

#[async_trait]
impl WizardBackend for HttpBackend {
    async fn upload_csv(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, TransportError> {
        self.transport
            .call(ApiRequest::post_file(
                &self.routes.upload_csv,
                "file",
                filename,
                bytes,
            ))
            .await
    }

    async fn upload_dataset(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<DatasetUploadResponse, TransportError> {
        self.transport
            .call(ApiRequest::post_file(
                &self.routes.upload_dataset,
                "file",
                filename,
                bytes,
            ))
            .await
    }

    async fn validate_parameters(
        &self,
        request: &ValidateParametersRequest,
    ) -> Result<ValidationResponse, TransportError> {
        self.transport
            .call(ApiRequest::post_json(&self.routes.validate, request)?)
            .await
    }

    async fn process_and_save(
        &self,
        request: &ProcessRequest,
    ) -> Result<ProcessingResponse, TransportError> {
        self.transport
            .call(ApiRequest::post_json(&self.routes.process, request)?)
            .await
    }

    async fn debug_session(&self) -> Result<SessionSnapshot, TransportError> {
        self.transport
            .call(ApiRequest::get(&self.routes.debug_session))
            .await
    }

    async fn open_run_stream(&self, kind: RunKind) -> Result<ByteStream, TransportError> {
        self.transport
            .open_stream(self.routes.stream(kind), true)
            .await
    }
}
