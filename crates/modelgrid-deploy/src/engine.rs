//! Local inference engine seam.
//!
//! The engine is what actually loads a model payload on a node. ModelGrid
//! only needs to ask it to materialize or drop an artifact; both calls may
//! be slow and may fail.

use std::path::PathBuf;

use tracing::{debug, info};

use modelgrid_cluster::BoxFuture;
use modelgrid_core::fingerprint;

use crate::error::EngineError;

pub type EngineResult<T> = Result<T, EngineError>;

pub trait InferenceEngine: Send + Sync {
    /// Load `artifact_id` locally and verify it against `fingerprint`.
    fn materialize(&self, artifact_id: &str, fingerprint: &str) -> BoxFuture<'static, EngineResult<()>>;

    /// Drop a previously materialized artifact.
    fn unload(&self, artifact_id: &str) -> BoxFuture<'static, EngineResult<()>>;
}

/// Engine that loads `<model_dir>/<artifact_id>.bin` from disk.
///
/// Materializing reads the payload on the blocking pool and checks its
/// SHA-256 against the expected fingerprint.
#[derive(Debug, Clone)]
pub struct FsEngine {
    model_dir: PathBuf,
}

impl FsEngine {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn payload_path(&self, artifact_id: &str) -> PathBuf {
        self.model_dir.join(format!("{artifact_id}.bin"))
    }
}

impl InferenceEngine for FsEngine {
    fn materialize(&self, artifact_id: &str, expected: &str) -> BoxFuture<'static, EngineResult<()>> {
        let path = self.payload_path(artifact_id);
        let artifact_id = artifact_id.to_string();
        let expected = expected.to_string();

        Box::pin(async move {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(EngineError::Missing(path.display().to_string()));
            }
            let hash_path = path.clone();
            let actual = tokio::task::spawn_blocking(move || fingerprint::fingerprint_file(&hash_path))
                .await
                .map_err(|e| EngineError::Failed(e.to_string()))?
                .map_err(|e| EngineError::Io(e.to_string()))?;

            if !fingerprint::matches(&expected, &actual) {
                return Err(EngineError::FingerprintMismatch { expected, actual });
            }
            info!(%artifact_id, path = %path.display(), "artifact materialized");
            Ok(())
        })
    }

    fn unload(&self, artifact_id: &str) -> BoxFuture<'static, EngineResult<()>> {
        let artifact_id = artifact_id.to_string();
        Box::pin(async move {
            debug!(%artifact_id, "artifact unloaded");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(artifact_id: &str, payload: &[u8]) -> (tempfile::TempDir, FsEngine) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(format!("{artifact_id}.bin")), payload).unwrap();
        let engine = FsEngine::new(dir.path());
        (dir, engine)
    }

    #[tokio::test]
    async fn materialize_verifies_fingerprint() {
        let (_dir, engine) = engine_with("m1", b"weights");
        let fp = fingerprint::fingerprint(b"weights");

        engine.materialize("m1", &fp).await.unwrap();
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let (_dir, engine) = engine_with("m1", b"tampered");
        let fp = fingerprint::fingerprint(b"weights");

        let err = engine.materialize("m1", &fp).await.unwrap_err();
        assert!(matches!(err, EngineError::FingerprintMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_payload_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = FsEngine::new(dir.path());

        let err = engine.materialize("ghost", "ff").await.unwrap_err();
        assert!(matches!(err, EngineError::Missing(path) if path.ends_with("ghost.bin")));
    }

    #[tokio::test]
    async fn unload_always_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        FsEngine::new(dir.path()).unload("m1").await.unwrap();
    }
}
