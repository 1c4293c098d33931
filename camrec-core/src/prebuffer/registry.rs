//! Per-camera pre-record buffers

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::service::PreBuffer;
use crate::config::{CameraConfig, CamrecConfig};
use crate::transcoder::TranscoderLauncher;

/// Process-wide map of camera name to its pre-record buffer
pub struct PreBufferRegistry {
    config: CamrecConfig,
    launcher: Arc<dyn TranscoderLauncher>,
    buffers: parking_lot::Mutex<HashMap<String, Arc<PreBuffer>>>,
}

impl PreBufferRegistry {
    pub fn new(config: CamrecConfig, launcher: Arc<dyn TranscoderLauncher>) -> Self {
        Self {
            config,
            launcher,
            buffers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the camera's buffer, creating an idle one on first use.
    pub fn get_or_create(&self, camera: &CameraConfig) -> Arc<PreBuffer> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.entry(camera.name.clone()).or_insert_with(|| {
            debug!("Creating pre-record buffer for {}", camera.name);
            Arc::new(PreBuffer::new(
                camera.clone(),
                &self.config,
                Arc::clone(&self.launcher),
            ))
        });
        Arc::clone(buffer)
    }

    /// Buffer for `camera`, if one exists.
    pub fn get(&self, camera: &str) -> Option<Arc<PreBuffer>> {
        self.buffers.lock().get(camera).cloned()
    }

    /// Names of cameras with a buffer.
    pub fn cameras(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shuts down and forgets every buffer.
    pub async fn shutdown_all(&self) {
        let buffers: Vec<Arc<PreBuffer>> = self.buffers.lock().drain().map(|(_, b)| b).collect();
        for buffer in buffers {
            buffer.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcoder::scripted::ScriptedLauncher;

    #[tokio::test]
    async fn test_one_buffer_per_camera() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = PreBufferRegistry::new(CamrecConfig::for_testing(), launcher.clone());

        let porch = CameraConfig::new("Porch", "-i rtsp://porch");
        let first = registry.get_or_create(&porch);
        let second = registry.get_or_create(&porch);
        registry.get_or_create(&CameraConfig::new("Yard", "-i rtsp://yard"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.cameras(), vec!["Porch", "Yard"]);
        assert!(registry.get("Attic").is_none());
        assert_eq!(launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_running_buffers() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = PreBufferRegistry::new(CamrecConfig::for_testing(), launcher.clone());

        let buffer = registry.get_or_create(&CameraConfig::new("Porch", "-i rtsp://porch"));
        buffer.ensure_started().await.unwrap();
        let feed = launcher.next_feed().await.unwrap();

        registry.shutdown_all().await;

        assert!(feed.is_stopped());
        assert!(registry.cameras().is_empty());
    }
}
