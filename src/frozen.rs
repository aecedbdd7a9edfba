use tracing::info;

use crate::camera::Camera;

/// A still-image run that never saw a second distinct frame watched a stalled
/// feed. Returns the abort reason in that case.
pub fn check(camera: &Camera, unique_frames: usize) -> Option<String> {
    if unique_frames != 1 {
        return None;
    }
    let reason = format!("Camera {}: {} is frozen", camera.id, camera.name);
    info!("{}. Exiting", reason);
    Some(reason)
}
