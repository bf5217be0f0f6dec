//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Common camera code.
//!
//! The low-level driver is an external collaborator; these traits describe what the
//! hosts need from it: a stream of frames (camera 1) and a frame captured on the
//! hardware external trigger (camera 2).
//!

pub mod simulator;

use image::RgbImage;

#[derive(Debug)]
pub enum CameraError {
    /// No frame ready yet; not an error, poll again.
    FrameUnavailable,
    /// The external trigger never arrived.
    TriggerTimeout,
    Disconnected(String),
    SimulatorError(String)
}

/// Continuous frame supply for the camera-1 host (teed-ball watching).
pub trait FrameSource: Send {
    /// Captures the next frame; blocks for at most roughly a frame period.
    fn capture_frame(&mut self) -> Result<RgbImage, CameraError>;

    fn resolution(&self) -> (u32, u32);
}

/// Externally-triggered capture for the camera-2 host. The camera must have been set
/// up to honour the hardware trigger line.
pub trait TriggeredFrameSource: Send {
    /// Blocks until the hardware trigger fires and a frame is out, or `timeout` passes.
    fn wait_for_triggered_frame(&mut self, timeout: std::time::Duration)
        -> Result<RgbImage, CameraError>;

    fn resolution(&self) -> (u32, u32);
}
