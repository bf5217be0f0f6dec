//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Result packaging and golf-simulator adapters.
//!

pub mod shot_log;

use crate::ball::{Ball, ClubType};
use enum_dispatch::enum_dispatch;

pub const MPS_TO_MPH: f64 = 2.2369362920544;

#[derive(Debug)]
pub enum AdapterError {
    Send(String)
}

/// Everything a connected simulator needs to animate the shot.
#[derive(Clone, Debug)]
pub struct ShotResult {
    pub ball_speed_mps: f64,
    pub hla_deg: f64,
    pub vla_deg: f64,
    pub back_spin_rpm: f64,
    /// Positive side spin = cut/fade (ball surface moving left-to-right at the top).
    pub side_spin_rpm: f64,
    pub carry_m: Option<f64>,
    pub club: ClubType,
    /// 0..1; lowered when parts of the analysis fell back or failed.
    pub confidence: f64,
    pub message: String
}

impl ShotResult {
    pub fn from_ball(ball: &Ball, club: ClubType) -> ShotResult {
        ShotResult{
            ball_speed_mps: ball.velocity_mps,
            hla_deg: ball.angles_ball.x,
            vla_deg: ball.angles_ball.y,
            back_spin_rpm: ball.rotation_rpm.z,
            side_spin_rpm: ball.rotation_rpm.x,
            carry_m: None,
            club,
            confidence: 1.0,
            message: String::new()
        }
    }

    pub fn ball_speed_mph(&self) -> f64 {
        self.ball_speed_mps * MPS_TO_MPH
    }
}

/// Writes an adapter's payload to its destination; the network plumbing behind it is
/// an external collaborator.
pub trait PayloadSink: Send {
    fn deliver(&mut self, adapter_name: &str, payload: &str) -> Result<(), AdapterError>;
}

/// Discards payloads (no simulator configured).
pub struct NullSink;

impl PayloadSink for NullSink {
    fn deliver(&mut self, _adapter_name: &str, _payload: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[enum_dispatch]
pub trait SimAdapterProperties {
    fn name(&self) -> &'static str;

    /// Serialized result, value ranges clamped to what the receiver enforces.
    fn format_payload(&self, result: &ShotResult, shot_number: u64) -> String;

    fn set_armed(&mut self, armed: bool);

    fn is_armed(&self) -> bool;
}

#[enum_dispatch(SimAdapterProperties)]
pub enum SimAdapter {
    E6(E6Adapter),
    GsPro(GsProAdapter)
}

impl std::fmt::Display for SimAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ---------------------------------------------------------------------------- E6

pub struct E6Adapter {
    armed: bool
}

impl E6Adapter {
    pub fn new() -> E6Adapter {
        E6Adapter{ armed: false }
    }
}

impl SimAdapterProperties for E6Adapter {
    fn name(&self) -> &'static str { "E6" }

    fn format_payload(&self, result: &ShotResult, _shot_number: u64) -> String {
        // receiver-enforced ranges
        let back_spin = result.back_spin_rpm.clamp(-999.0, 19999.0);
        let speed_mph = result.ball_speed_mph().clamp(0.09, 249.9);
        let side_spin = result.side_spin_rpm.clamp(-5999.0, 5999.0);

        serde_json::json!({
            "Type": "SetBallData",
            "BallData": {
                "BackSpin": format!("{:.1}", back_spin),
                "BallSpeed": format!("{:.1}", speed_mph),
                "LaunchAngle": format!("{:.1}", result.vla_deg),
                "LaunchDirection": format!("{:.1}", result.hla_deg),
                "SideSpin": format!("{:.1}", side_spin)
            }
        }).to_string()
    }

    fn set_armed(&mut self, armed: bool) { self.armed = armed; }

    fn is_armed(&self) -> bool { self.armed }
}

// ---------------------------------------------------------------------------- GSPro

pub struct GsProAdapter {
    armed: bool
}

impl GsProAdapter {
    pub fn new() -> GsProAdapter {
        GsProAdapter{ armed: false }
    }
}

impl SimAdapterProperties for GsProAdapter {
    fn name(&self) -> &'static str { "GSPro" }

    fn format_payload(&self, result: &ShotResult, shot_number: u64) -> String {
        let total_spin =
            (result.back_spin_rpm.powi(2) + result.side_spin_rpm.powi(2)).sqrt();
        let spin_axis = if result.back_spin_rpm.abs() < 1.0 {
            0.0
        } else {
            (result.side_spin_rpm / result.back_spin_rpm).atan().to_degrees()
        };

        serde_json::json!({
            "DeviceID": "Stroboxide",
            "Units": "Yards",
            "ShotNumber": shot_number,
            "APIversion": "1",
            "BallData": {
                "Speed": round1(result.ball_speed_mph()),
                "SpinAxis": round1(spin_axis),
                "TotalSpin": round1(total_spin),
                "BackSpin": round1(result.back_spin_rpm),
                "SideSpin": round1(result.side_spin_rpm),
                "HLA": round1(result.hla_deg),
                "VLA": round1(result.vla_deg)
            },
            "ShotDataOptions": {
                "ContainsBallData": true,
                "ContainsClubData": false,
                "LaunchMonitorIsReady": true
            }
        }).to_string()
    }

    fn set_armed(&mut self, armed: bool) { self.armed = armed; }

    fn is_armed(&self) -> bool { self.armed }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------- registry

/// The connected adapters plus the sink carrying their payloads out.
pub struct AdapterRegistry {
    adapters: Vec<SimAdapter>,
    sink: Box<dyn PayloadSink>
}

impl AdapterRegistry {
    pub fn new(adapters: Vec<SimAdapter>, sink: Box<dyn PayloadSink>) -> AdapterRegistry {
        AdapterRegistry{ adapters, sink }
    }

    /// With no adapter configured there is nothing to wait for.
    pub fn all_armed(&self) -> bool {
        self.adapters.iter().all(|a| a.is_armed())
    }

    pub fn arm_all(&mut self) {
        for adapter in &mut self.adapters {
            adapter.set_armed(true);
        }
    }

    /// Delivers the result to every adapter; a failed delivery is logged and the shot
    /// is otherwise unaffected (the adapter gets its next chance on the next shot).
    pub fn send_results(&mut self, result: &ShotResult, shot_number: u64) -> bool {
        let mut all_ok = true;
        for adapter in &self.adapters {
            let payload = adapter.format_payload(result, shot_number);
            if let Err(AdapterError::Send(e)) = self.sink.deliver(adapter.name(), &payload) {
                log::error!("failed to send results to {}: {}", adapter.name(), e);
                all_ok = false;
            }
        }
        all_ok
    }
}
