//! Native camera backend (nokhwa)
//!
//! nokhwa's `Camera` is not `Send`, so each opened device owns a dedicated OS
//! thread that holds the camera and serves grab/stop requests over a channel.

use super::{select_device, CaptureConstraints, CaptureDevice, DeviceFactory, DeviceInfo};
use crate::error::{MediaError, MediaResult};
use crate::frame::{RawFrame, VideoResolution};
use async_trait::async_trait;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraIndex, CameraInfo, RequestedFormat, RequestedFormatType, Resolution,
};
use nokhwa::Camera;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

enum Command {
    Grab(oneshot::Sender<MediaResult<RawFrame>>),
    Stop(oneshot::Sender<MediaResult<()>>),
}

/// Opens platform cameras through nokhwa
#[derive(Debug, Default)]
pub struct NativeDeviceFactory;

impl NativeDeviceFactory {
    pub fn new() -> Self {
        Self
    }
}

fn query_cameras() -> MediaResult<Vec<CameraInfo>> {
    nokhwa::query(ApiBackend::Auto).map_err(|e| MediaError::DeviceEnumerationFailed {
        reason: e.to_string(),
    })
}

fn describe(camera: &CameraInfo) -> DeviceInfo {
    DeviceInfo::new(camera.index().to_string(), camera.human_name())
}

/// Map backend failures that mean "the user said no" onto the permission error
fn open_error(device_id: &str, reason: String) -> MediaError {
    let lowered = reason.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("authoriz") {
        MediaError::PermissionDenied {
            operation: format!("open camera {}", device_id),
        }
    } else {
        MediaError::DeviceUnavailable {
            device_id: device_id.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl DeviceFactory for NativeDeviceFactory {
    async fn enumerate(&self) -> MediaResult<Vec<DeviceInfo>> {
        let cameras = tokio::task::spawn_blocking(query_cameras)
            .await
            .map_err(|e| MediaError::DeviceEnumerationFailed {
                reason: e.to_string(),
            })??;
        Ok(cameras.iter().map(describe).collect())
    }

    async fn open(&self, constraints: &CaptureConstraints) -> MediaResult<Arc<dyn CaptureDevice>> {
        let cameras = tokio::task::spawn_blocking(query_cameras)
            .await
            .map_err(|e| MediaError::DeviceEnumerationFailed {
                reason: e.to_string(),
            })??;

        let infos: Vec<DeviceInfo> = cameras.iter().map(describe).collect();
        let selected = select_device(&infos, constraints).ok_or_else(|| MediaError::DeviceNotFound {
            device_id: constraints
                .device_id
                .clone()
                .unwrap_or_else(|| "any".to_string()),
        })?;
        let index = cameras
            .iter()
            .find(|c| c.index().to_string() == selected.id)
            .map(|c| c.index().clone())
            .ok_or_else(|| MediaError::DeviceNotFound {
                device_id: selected.id.clone(),
            })?;

        let device = NativeDevice::spawn(selected.clone(), index, constraints.ideal_resolution).await?;
        info!(device = %device.info.name, resolution = %device.resolution, "camera opened");
        Ok(Arc::new(device))
    }
}

/// An open platform camera
#[derive(Debug)]
pub struct NativeDevice {
    info: DeviceInfo,
    resolution: VideoResolution,
    commands: mpsc::UnboundedSender<Command>,
    active: Arc<AtomicBool>,
}

impl NativeDevice {
    async fn spawn(
        info: DeviceInfo,
        index: CameraIndex,
        ideal: VideoResolution,
    ) -> MediaResult<Self> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(false));

        let thread_active = active.clone();
        let device_id = info.id.clone();
        std::thread::Builder::new()
            .name(format!("framelink-camera-{}", device_id))
            .spawn(move || camera_thread(device_id, index, ideal, ready_tx, command_rx, thread_active))
            .map_err(|e| MediaError::DeviceUnavailable {
                device_id: info.id.clone(),
                reason: format!("failed to spawn capture thread: {}", e),
            })?;

        let resolution = ready_rx.await.map_err(|_| MediaError::DeviceUnavailable {
            device_id: info.id.clone(),
            reason: "capture thread exited during open".to_string(),
        })??;

        Ok(Self {
            info,
            resolution,
            commands,
            active,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<MediaResult<T>>) -> Command,
    ) -> MediaResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| MediaError::CaptureNotActive)?;
        rx.await.map_err(|_| MediaError::CaptureNotActive)?
    }
}

#[async_trait]
impl CaptureDevice for NativeDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn resolution(&self) -> VideoResolution {
        self.resolution
    }

    async fn grab_frame(&self) -> MediaResult<RawFrame> {
        if !self.is_active() {
            return Err(MediaError::CaptureNotActive);
        }
        self.request(Command::Grab).await
    }

    async fn stop(&self) -> MediaResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        match self.request(Command::Stop).await {
            // Thread already gone means the camera is already released
            Err(MediaError::CaptureNotActive) => Ok(()),
            other => other,
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

fn camera_thread(
    device_id: String,
    index: CameraIndex,
    ideal: VideoResolution,
    ready: oneshot::Sender<MediaResult<VideoResolution>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    active: Arc<AtomicBool>,
) {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::HighestResolution(
        Resolution::new(ideal.width, ideal.height),
    ));

    let mut camera = match Camera::new(index, requested).and_then(|mut camera| {
        camera.open_stream()?;
        Ok(camera)
    }) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(open_error(&device_id, e.to_string())));
            return;
        }
    };

    let actual = camera.resolution();
    let resolution = VideoResolution::new(actual.width(), actual.height());
    if resolution != ideal {
        debug!(device = %device_id, %ideal, %resolution, "camera negotiated a different resolution");
    }

    active.store(true, Ordering::SeqCst);
    if ready.send(Ok(resolution)).is_err() {
        // Opener went away before we were ready
        active.store(false, Ordering::SeqCst);
        let _ = camera.stop_stream();
        return;
    }

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Grab(reply) => {
                let frame = grab(&mut camera, &device_id);
                if let Err(e) = &frame {
                    warn!(device = %device_id, error = %e, "frame capture failed");
                }
                let _ = reply.send(frame);
            }
            Command::Stop(reply) => {
                let _ = reply.send(release(&mut camera, &device_id, &active));
                return;
            }
        }
    }

    // Every handle dropped without an explicit stop
    let _ = release(&mut camera, &device_id, &active);
}

fn grab(camera: &mut Camera, device_id: &str) -> MediaResult<RawFrame> {
    let buffer = camera.frame().map_err(|e| MediaError::DeviceUnavailable {
        device_id: device_id.to_string(),
        reason: e.to_string(),
    })?;
    let decoded = buffer
        .decode_image::<RgbFormat>()
        .map_err(|e| MediaError::DecodingFailed {
            codec: format!("{:?}", buffer.source_frame_format()),
            reason: e.to_string(),
        })?;
    let resolution = VideoResolution::new(decoded.width(), decoded.height());
    RawFrame::rgb(resolution, decoded.into_raw())
}

fn release(camera: &mut Camera, device_id: &str, active: &AtomicBool) -> MediaResult<()> {
    active.store(false, Ordering::SeqCst);
    camera.stop_stream().map_err(|e| {
        error!(device = %device_id, error = %e, "failed to release camera");
        MediaError::DeviceUnavailable {
            device_id: device_id.to_string(),
            reason: e.to_string(),
        }
    })?;
    debug!(device = %device_id, "camera released");
    Ok(())
}
