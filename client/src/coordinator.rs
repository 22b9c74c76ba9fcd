use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use std::env;

use common::{
    FileMeta, InitWorkerRequest, InitWorkerResponse, PoolResponse, ResolveRequest,
    ResolveResponse, Result, SessionId, ShufflerRequest, ShufflerResponse, SphereError,
    WorkerEntry, WorkerMetrics,
};

/// Lo que el scheduler le pide al coordinador (request/response).
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Metadatos (tamaño, registros, ubicaciones) de cada archivo de entrada.
    async fn resolve_inputs(&self, paths: &[String]) -> Result<Vec<FileMeta>>;

    /// Workers disponibles para este job.
    async fn allocate_workers(&self) -> Result<Vec<WorkerEntry>>;

    /// Prepara un worker para el job y devuelve la sesión del canal de datos.
    async fn init_worker(&self, req: &InitWorkerRequest) -> Result<SessionId>;

    /// Reserva un shuffler en el worker indicado.
    async fn allocate_shuffler(&self, req: &ShufflerRequest) -> Result<ShufflerResponse>;
}

/// URL base del master.
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
pub fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

/// Cliente HTTP/JSON contra el master.
#[derive(Clone)]
pub struct HttpCoordinator {
    client: Client,
    base_url: String,
}

impl HttpCoordinator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(master_base_url())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SphereError::Coordinator(format!("POST {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(SphereError::Coordinator(format!(
                "POST {url} devolvió status {}",
                resp.status()
            )));
        }

        resp.json::<Resp>()
            .await
            .map_err(|e| SphereError::Coordinator(format!("respuesta inválida de {url}: {e}")))
    }

    /// Métricas de los workers registrados (para la CLI).
    pub async fn list_workers(&self) -> Result<Vec<WorkerMetrics>> {
        let url = format!("{}/api/v1/workers", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SphereError::Coordinator(format!("GET {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(SphereError::Coordinator(format!(
                "GET {url} devolvió status {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| SphereError::Coordinator(format!("respuesta inválida de {url}: {e}")))
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn resolve_inputs(&self, paths: &[String]) -> Result<Vec<FileMeta>> {
        let req = ResolveRequest {
            paths: paths.to_vec(),
        };
        let resp: ResolveResponse = self.post("/api/v1/files/resolve", &req).await?;
        Ok(resp.files)
    }

    async fn allocate_workers(&self) -> Result<Vec<WorkerEntry>> {
        let resp: PoolResponse = self.post("/api/v1/pool", &serde_json::json!({})).await?;
        Ok(resp.workers)
    }

    async fn init_worker(&self, req: &InitWorkerRequest) -> Result<SessionId> {
        let resp: InitWorkerResponse = self.post("/api/v1/pool/init", req).await?;
        Ok(resp.session)
    }

    async fn allocate_shuffler(&self, req: &ShufflerRequest) -> Result<ShufflerResponse> {
        self.post("/api/v1/shufflers", req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_sin_barra_final() {
        let c = HttpCoordinator::new("http://master:8080/");
        assert_eq!(c.base_url(), "http://master:8080");
    }

    #[tokio::test]
    async fn master_caido_es_error_de_coordinador() {
        // puerto 1: nadie escucha
        let c = HttpCoordinator::new("http://127.0.0.1:1");
        let err = c.allocate_workers().await.unwrap_err();
        assert!(matches!(err, SphereError::Coordinator(_)));
    }
}
