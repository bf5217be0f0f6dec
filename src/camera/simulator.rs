//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Camera simulator.
//!
//! Renders synthetic teed-ball and strobed scenes; the shared knobs let a test (or the
//! standalone mode) move the ball, trigger a hit and plant the strobed exposures.
//!

use crate::camera::{CameraError, FrameSource, TriggeredFrameSource};
use atomic_float::AtomicF32;
use image::{Rgb, RgbImage};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Data shared between the simulated cameras and whoever drives the scenario.
#[derive(Clone)]
pub struct CameraSimulatorData {
    pub ball_placed: Arc<AtomicBool>,
    pub ball_x: Arc<AtomicF32>,
    pub ball_y: Arc<AtomicF32>,
    pub ball_radius: Arc<AtomicF32>,
    /// When set, frames show movement downrange of the ball (a "club head").
    pub motion_in_progress: Arc<AtomicBool>,
    /// Ball exposures (x, y, radius) the triggered camera renders.
    pub exposures: Arc<Mutex<Vec<(f32, f32, f32)>>>,
    /// Per-pixel noise amplitude.
    pub noise_level: Arc<AtomicF32>
}

impl Default for CameraSimulatorData {
    fn default() -> CameraSimulatorData {
        CameraSimulatorData{
            ball_placed: Arc::new(AtomicBool::new(false)),
            ball_x: Arc::new(AtomicF32::new(728.0)),
            ball_y: Arc::new(AtomicF32::new(544.0)),
            ball_radius: Arc::new(AtomicF32::new(50.0)),
            motion_in_progress: Arc::new(AtomicBool::new(false)),
            exposures: Arc::new(Mutex::new(vec![])),
            noise_level: Arc::new(AtomicF32::new(0.0))
        }
    }
}

/// Renders bright, radially-shaded balls on a dark background.
pub fn render_ball_scene(
    width: u32,
    height: u32,
    balls: &[(f32, f32, f32)],
    noise_level: f32
) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, Rgb([12, 12, 16]));

    if noise_level > 0.0 {
        let mut rng = rand::thread_rng();
        for pixel in image.pixels_mut() {
            let n = rng.gen_range(0.0..noise_level) as i16;
            for i in 0..3 {
                pixel[i] = (pixel[i] as i16 + n).clamp(0, 255) as u8;
            }
        }
    }

    for &(cx, cy, r) in balls {
        let r_i = r.ceil() as i32;
        for dy in -r_i..=r_i {
            for dx in -r_i..=r_i {
                let x = cx as i32 + dx;
                let y = cy as i32 + dy;
                if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 { continue; }
                let dist_sq = (dx * dx + dy * dy) as f32;
                if dist_sq <= r * r {
                    let shade = (230.0 - 30.0 * (dist_sq.sqrt() / r)) as u8;
                    image.put_pixel(x as u32, y as u32, Rgb([shade, shade, shade]));
                }
            }
        }
    }
    image
}

pub struct SimCamera {
    data: CameraSimulatorData,
    width: u32,
    height: u32
}

impl SimCamera {
    pub fn new(data: CameraSimulatorData, width: u32, height: u32) -> SimCamera {
        SimCamera{ data, width, height }
    }
}

impl FrameSource for SimCamera {
    fn capture_frame(&mut self) -> Result<RgbImage, CameraError> {
        // roughly a fast camera's frame period
        std::thread::sleep(std::time::Duration::from_millis(5));

        let mut balls = vec![];
        if self.data.ball_placed.load(Ordering::Relaxed) {
            balls.push((
                self.data.ball_x.load(Ordering::Relaxed),
                self.data.ball_y.load(Ordering::Relaxed),
                self.data.ball_radius.load(Ordering::Relaxed)
            ));
        }

        if self.data.motion_in_progress.load(Ordering::Relaxed) {
            // something club-head-sized moving just downrange of the ball
            let x = self.data.ball_x.load(Ordering::Relaxed)
                + 3.0 * self.data.ball_radius.load(Ordering::Relaxed);
            let y = self.data.ball_y.load(Ordering::Relaxed);
            balls.push((x, y, self.data.ball_radius.load(Ordering::Relaxed) * 1.2));
        }

        Ok(render_ball_scene(
            self.width, self.height, &balls,
            self.data.noise_level.load(Ordering::Relaxed)
        ))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

pub struct TriggeredSimCamera {
    data: CameraSimulatorData,
    width: u32,
    height: u32,
    /// Raised by the simulated trigger line.
    pub trigger_fired: Arc<AtomicBool>
}

impl TriggeredSimCamera {
    pub fn new(data: CameraSimulatorData, width: u32, height: u32) -> TriggeredSimCamera {
        TriggeredSimCamera{ data, width, height, trigger_fired: Arc::new(AtomicBool::new(false)) }
    }
}

impl TriggeredFrameSource for TriggeredSimCamera {
    fn wait_for_triggered_frame(&mut self, timeout: std::time::Duration)
        -> Result<RgbImage, CameraError>
    {
        let deadline = std::time::Instant::now() + timeout;
        while !self.trigger_fired.load(Ordering::Relaxed) {
            if std::time::Instant::now() >= deadline {
                return Err(CameraError::TriggerTimeout);
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        self.trigger_fired.store(false, Ordering::Relaxed);

        let exposures = self.data.exposures.lock().unwrap().clone();
        Ok(render_ball_scene(
            self.width, self.height, &exposures,
            self.data.noise_level.load(Ordering::Relaxed)
        ))
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Simulated shutter/trigger wire: the camera sees the falling edge of the pin (the
/// real hardware inverts the signal on the way to the trigger input). Only a shutter
/// window at least a millisecond wide counts; the camera discards the microsecond-long
/// priming pulses during its startup-frame walk.
pub struct SimTriggerLine {
    fired_flag: Arc<AtomicBool>,
    raised_at: Option<std::time::Instant>
}

const MIN_SHUTTER_WINDOW: std::time::Duration = std::time::Duration::from_millis(1);

impl SimTriggerLine {
    pub fn new(fired_flag: Arc<AtomicBool>) -> SimTriggerLine {
        SimTriggerLine{ fired_flag, raised_at: None }
    }
}

impl crate::strobe::TriggerPin for SimTriggerLine {
    fn set(&mut self, high: bool) -> Result<(), crate::strobe::StrobeError> {
        if high {
            self.raised_at = Some(std::time::Instant::now());
        } else if let Some(raised_at) = self.raised_at.take() {
            if raised_at.elapsed() >= MIN_SHUTTER_WINDOW {
                self.fired_flag.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Places exposures the way a real shot would: a constant pixel speed scaled by the
/// strobe off-intervals, starting at `(start_x, start_y)` and climbing at
/// `launch_angle_deg`.
pub fn exposures_for_shot(
    start_x: f32,
    start_y: f32,
    radius: f32,
    pixels_per_ms: f32,
    launch_angle_deg: f32,
    intervals_ms: &[f64],
    count: usize
) -> Vec<(f32, f32, f32)> {
    let angle = launch_angle_deg.to_radians();
    let mut x = start_x;
    let mut y = start_y;

    let mut exposures = vec![(x, y, radius)];
    for &interval in intervals_ms.iter().take(count.saturating_sub(1)) {
        let step = pixels_per_ms * interval as f32;
        x += step * angle.cos();
        y -= step * angle.sin();
        exposures.push((x, y, radius));
    }
    exposures
}
