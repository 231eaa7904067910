//! Local capture device management
//!
//! A [`MediaResourceManager`] turns a [`CallType`] into an owned
//! [`MediaHandle`] by opening the required devices through a
//! [`CaptureBackend`].
//!
//! # Ownership
//!
//! The handle is the only owner of its devices. It is released exactly once:
//! either explicitly through [`MediaHandle::release`] (idempotent) or, as a
//! backstop, when it is dropped. An acquisition future that is aborted half
//! way therefore cannot leave a device open.

use crate::types::{CallType, FailureReason, MediaFlags, MediaKind, MediaKinds};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or platform refused access
    #[error("Permission denied for {0} capture")]
    PermissionDenied(MediaKind),

    /// No device of this kind
    #[error("Device not found: {0}")]
    DeviceNotFound(MediaKind),

    /// Device held elsewhere
    #[error("Device busy: {0}")]
    DeviceBusy(MediaKind),

    /// Handle does not carry this track
    #[error("Track not present: {0}")]
    TrackNotPresent(MediaKind),

    /// Handle was already released
    #[error("Media handle already released")]
    Released,
}

impl MediaError {
    /// Session failure reason for an acquisition error
    ///
    /// Returns `None` for errors that cannot come out of acquisition.
    #[must_use]
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::PermissionDenied(_) => Some(FailureReason::PermissionDenied),
            Self::DeviceNotFound(_) => Some(FailureReason::DeviceNotFound),
            Self::DeviceBusy(_) => Some(FailureReason::DeviceBusy),
            Self::TrackNotPresent(_) | Self::Released => None,
        }
    }
}

/// An open capture device
pub trait CaptureDevice: Send + Sync {
    /// Kind of device
    fn kind(&self) -> MediaKind;

    /// Human readable device label
    fn label(&self) -> &str;

    /// Mute or unmute capture without closing the device
    fn set_enabled(&mut self, enabled: bool);

    /// Stop capture and release the device
    ///
    /// Called at most once per device by [`MediaHandle`].
    fn stop(&mut self);
}

/// Source of capture devices
///
/// `open` may suspend for a long time, e.g. while the platform shows a
/// permission prompt.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open the default device of `kind`
    async fn open(&self, kind: MediaKind) -> Result<Box<dyn CaptureDevice>, MediaError>;
}

/// One local track inside a handle
struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: bool,
    device: Box<dyn CaptureDevice>,
}

/// Owned local capture stream
pub struct MediaHandle {
    kinds: MediaKinds,
    tracks: Vec<LocalTrack>,
    released: bool,
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("kinds", &self.kinds)
            .field("tracks", &self.track_ids())
            .field("released", &self.released)
            .finish()
    }
}

impl MediaHandle {
    fn empty() -> Self {
        Self {
            kinds: MediaKinds::default(),
            tracks: Vec::new(),
            released: false,
        }
    }

    fn push(&mut self, device: Box<dyn CaptureDevice>) {
        let kind = device.kind();
        match kind {
            MediaKind::Audio => self.kinds.audio = true,
            MediaKind::Video => self.kinds.video = true,
        }
        self.tracks.push(LocalTrack {
            id: format!("{}-{}", kind, device.label()),
            kind,
            enabled: true,
            device,
        });
    }

    /// Kinds carried by this handle
    #[must_use]
    pub fn kinds(&self) -> MediaKinds {
        self.kinds
    }

    /// Track identifiers, one per kind
    #[must_use]
    pub fn track_ids(&self) -> Vec<(MediaKind, String)> {
        self.tracks.iter().map(|t| (t.kind, t.id.clone())).collect()
    }

    /// Enabled state of a track, `None` if the handle has no such track
    #[must_use]
    pub fn is_enabled(&self, kind: MediaKind) -> Option<bool> {
        self.tracks
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.enabled)
    }

    /// Enabled flags for the session snapshot
    #[must_use]
    pub fn flags(&self) -> MediaFlags {
        MediaFlags {
            audio_enabled: self.is_enabled(MediaKind::Audio).unwrap_or(false),
            video_enabled: self.is_enabled(MediaKind::Video),
        }
    }

    /// Enable or disable one track, returning the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error if the handle was released or carries no such track
    pub fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> Result<bool, MediaError> {
        if self.released {
            return Err(MediaError::Released);
        }
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.kind == kind)
            .ok_or(MediaError::TrackNotPresent(kind))?;
        if track.enabled != enabled {
            track.device.set_enabled(enabled);
            track.enabled = enabled;
        }
        Ok(track.enabled)
    }

    /// Whether the devices have been released
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop every device
    ///
    /// Returns `true` if this call released the devices, `false` if they had
    /// already been released.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        for track in &mut self.tracks {
            track.device.stop();
            tracing::debug!(track_id = %track.id, "Capture track stopped");
        }
        true
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(
                tracks = self.tracks.len(),
                "Media handle dropped before release, stopping devices"
            );
            self.release();
        }
    }
}

/// Acquires and releases local capture devices
#[derive(Clone)]
pub struct MediaResourceManager {
    backend: Arc<dyn CaptureBackend>,
}

impl MediaResourceManager {
    /// Create a manager over a capture backend
    #[must_use]
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self { backend }
    }

    /// Open exactly the devices `call_type` needs
    ///
    /// Audio is opened first. If a later device fails, everything opened so
    /// far is released before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied`, `DeviceNotFound` or `DeviceBusy`
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, call_type: CallType) -> Result<MediaHandle, MediaError> {
        let mut handle = MediaHandle::empty();
        for kind in call_type.required_kinds().iter() {
            match self.backend.open(kind).await {
                Ok(device) => {
                    tracing::debug!(kind = %kind, label = device.label(), "Capture device opened");
                    handle.push(device);
                }
                Err(e) => {
                    tracing::warn!(kind = %kind, error = %e, "Capture device acquisition failed");
                    handle.release();
                    return Err(e);
                }
            }
        }
        tracing::info!(kinds = ?handle.kinds(), "Media acquired");
        Ok(handle)
    }

    /// Release a handle; a second call is a no-op
    pub fn release(&self, handle: &mut MediaHandle) -> bool {
        let released = handle.release();
        if released {
            tracing::info!(kinds = ?handle.kinds(), "Media released");
        }
        released
    }

    /// Mute/unmute a track without releasing the device
    ///
    /// # Errors
    ///
    /// Returns error if the handle was released or has no such track
    pub fn set_track_enabled(
        &self,
        handle: &mut MediaHandle,
        kind: MediaKind,
        enabled: bool,
    ) -> Result<bool, MediaError> {
        let now = handle.set_enabled(kind, enabled)?;
        tracing::debug!(kind = %kind, enabled = now, "Track enabled state changed");
        Ok(now)
    }
}

// ============================================================================
// Virtual capture backend
// ============================================================================

/// Platform permission answer simulated by [`VirtualCaptureBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Access allowed
    Granted,
    /// Access refused
    Denied,
}

/// Observable state of one virtual device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualDeviceState {
    /// Device exists
    pub present: bool,
    /// Device held by "another application"
    pub busy: bool,
    /// Currently opened by a handle
    pub open: bool,
    /// Capture enabled (unmuted)
    pub enabled: bool,
    /// Number of successful opens
    pub opens: u32,
    /// Number of stops
    pub releases: u32,
}

struct VirtualState {
    permission: Permission,
    open_delay: Duration,
    devices: HashMap<MediaKind, VirtualDeviceState>,
}

/// In-memory capture backend
///
/// Every knob can be changed between calls, e.g. to grant permission
/// before a retry.
#[derive(Clone)]
pub struct VirtualCaptureBackend {
    state: Arc<Mutex<VirtualState>>,
}

impl Default for VirtualCaptureBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualCaptureBackend {
    /// Microphone and camera present, permission granted
    #[must_use]
    pub fn new() -> Self {
        let present = VirtualDeviceState {
            present: true,
            ..VirtualDeviceState::default()
        };
        let mut devices = HashMap::new();
        devices.insert(MediaKind::Audio, present.clone());
        devices.insert(MediaKind::Video, present);
        Self {
            state: Arc::new(Mutex::new(VirtualState {
                permission: Permission::Granted,
                open_delay: Duration::ZERO,
                devices,
            })),
        }
    }

    /// No devices at all
    #[must_use]
    pub fn without_devices() -> Self {
        let backend = Self::new();
        backend.set_present(MediaKind::Audio, false);
        backend.set_present(MediaKind::Video, false);
        backend
    }

    /// Change the permission answer
    pub fn set_permission(&self, permission: Permission) {
        self.state.lock().permission = permission;
    }

    /// Add or remove a device
    pub fn set_present(&self, kind: MediaKind, present: bool) {
        self.state.lock().devices.entry(kind).or_default().present = present;
    }

    /// Mark a device as held elsewhere
    pub fn set_busy(&self, kind: MediaKind, busy: bool) {
        self.state.lock().devices.entry(kind).or_default().busy = busy;
    }

    /// Delay every open, standing in for a permission prompt
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// Current state of a device
    #[must_use]
    pub fn device(&self, kind: MediaKind) -> VirtualDeviceState {
        self.state
            .lock()
            .devices
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any device is currently open
    #[must_use]
    pub fn any_open(&self) -> bool {
        self.state.lock().devices.values().any(|d| d.open)
    }
}

#[async_trait]
impl CaptureBackend for VirtualCaptureBackend {
    async fn open(&self, kind: MediaKind) -> Result<Box<dyn CaptureDevice>, MediaError> {
        let delay = self.state.lock().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.permission == Permission::Denied {
            return Err(MediaError::PermissionDenied(kind));
        }
        let device = state.devices.entry(kind).or_default();
        if !device.present {
            return Err(MediaError::DeviceNotFound(kind));
        }
        if device.busy || device.open {
            return Err(MediaError::DeviceBusy(kind));
        }
        device.open = true;
        device.enabled = true;
        device.opens += 1;

        Ok(Box::new(VirtualDevice {
            kind,
            label: format!("virtual-{}", kind),
            state: Arc::clone(&self.state),
            stopped: false,
        }))
    }
}

struct VirtualDevice {
    kind: MediaKind,
    label: String,
    state: Arc<Mutex<VirtualState>>,
    stopped: bool,
}

impl CaptureDevice for VirtualDevice {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn set_enabled(&mut self, enabled: bool) {
        if let Some(device) = self.state.lock().devices.get_mut(&self.kind) {
            device.enabled = enabled;
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(device) = self.state.lock().devices.get_mut(&self.kind) {
            device.open = false;
            device.enabled = false;
            device.releases += 1;
        }
    }
}
