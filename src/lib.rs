//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Two-camera optical golf launch monitor: from a still image of the teed ball and a
//! single strobed in-flight frame, recovers ball speed, launch angles and the 3-axis
//! spin rate.
//!

pub mod args;
pub mod ball;
pub mod camera;
pub mod config;
pub mod detector;
pub mod exposure;
pub mod fsm;
pub mod geometry;
pub mod imgproc;
pub mod ipc;
pub mod logging;
pub mod output;
pub mod shot;
pub mod spin;
pub mod strobe;
pub mod timer;
