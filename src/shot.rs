//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Post-hit shot analysis: turns the teed-ball image and the strobed camera-2 frame
//! into a shot result.
//!

use crate::ball::{Ball, ClubType, GolferOrientation};
use crate::config::Configuration;
use crate::detector::{BallDetector, DetectionError, SearchMode};
use crate::exposure::{ExposureSelector, SelectionError};
use crate::geometry::{self, CameraSpec};
use crate::imgproc::{self, Rect};
use crate::spin::{SpinAnalyzer, SpinError};
use cgmath::{Vector3, Zero};
use image::RgbImage;

/// Failure taxonomy; the state machine decides the response to each.
#[derive(Debug)]
pub enum ShotError {
    Config(String),
    Hardware(String),
    /// No ball candidates; expected while idle, fatal to the shot after a hit.
    DetectionMiss,
    /// Fewer than two exposures survived the selector.
    FilteringCollapse(usize),
    /// The rotation search failed; velocity and angles still stand.
    SpinFailure,
    Timeout,
    Ipc(String),
    Simulator(String)
}

pub struct ShotOutcome {
    /// Carries velocity, angles and spin of the shot.
    pub result_ball: Ball,
    /// The retained exposures, for diagnostics and artifact sinks.
    pub exposures: Vec<Ball>,
    pub rotation_degrees: Vector3<f64>,
    /// Lowered when parts of the analysis fell back.
    pub confidence: f64,
    pub message: String
}

pub struct ShotAnalyzer<'a> {
    config: &'a Configuration,
    pub camera1: CameraSpec,
    pub camera2: CameraSpec,
    pub club: ClubType,
    pub orientation: GolferOrientation,
    pub practice_ball: bool,
    /// Analysis of frames lit by a foreign launch monitor's strobe.
    pub external_strobe: bool
}

impl<'a> ShotAnalyzer<'a> {
    pub fn new(config: &'a Configuration) -> ShotAnalyzer<'a> {
        ShotAnalyzer{
            config,
            camera1: CameraSpec::from(&config.cameras.cam1),
            camera2: CameraSpec::from(&config.cameras.cam2),
            club: ClubType::Driver,
            orientation: GolferOrientation::RightHanded,
            practice_ball: false,
            external_strobe: false
        }
    }

    fn slowdown_pct(&self) -> f64 {
        if self.practice_ball {
            self.config.strobing.practice_slowdown_pct
        } else if self.club == ClubType::Putter {
            self.config.strobing.putting_slowdown_pct
        } else {
            self.config.strobing.standard_slowdown_pct
        }
    }

    /// Locates the teed ball around the expected rest position and calibrates it at
    /// the camera's reference distance.
    pub fn find_and_calibrate_teed_ball(&self, image: &RgbImage) -> Result<Ball, ShotError> {
        let expected_radius = self.camera1.expected_ball_radius_px(self.camera1.calibration_distance_m);
        let center = self.camera1.expected_ball_center;

        // search a window of a few ball diameters around the expected spot
        let span = (expected_radius * 6.0) as i32;
        let roi = Rect::new(center.x - span / 2, center.y - span / 2, span as u32, span as u32);

        let mut detector = BallDetector::new(&self.config.ball_identification);
        detector.min_ball_radius = Some((expected_radius * 0.6) as u32);
        detector.max_ball_radius = Some((expected_radius * 1.5) as u32);

        let mut reference = Ball::default();
        reference.search_area = Some((center, span / 2));

        let balls = detector.find_balls(image, &reference, roi, SearchMode::PlacedBall)
            .map_err(|e| match e {
                DetectionError::NoBallFound{ .. } => ShotError::DetectionMiss,
                DetectionError::EmptyImage => ShotError::Config("empty frame".to_string())
            })?;

        let mut ball = balls[0].clone();
        let stats = imgproc::color_stats_in_circle(image, &ball.circle);
        ball.average_color = stats.average;
        ball.median_color = stats.median;
        ball.std_color = stats.std_dev;

        geometry::calibrate_at_reference(&mut ball, &self.camera1);
        ball.distance_to_lens = Some(
            self.camera1.distance_from_radius(&ball)
                .map_err(|_| ShotError::DetectionMiss)?
        );
        self.camera1.solve_world_position(&mut ball)
            .map_err(|e| ShotError::Config(format!("{:?}", e)))?;

        Ok(ball)
    }

    /// Quick re-detection during the stabilization wait; same regime, same window.
    pub fn redetect_teed_ball(&self, image: &RgbImage) -> Result<Ball, ShotError> {
        self.find_and_calibrate_teed_ball(image)
    }

    /// The full post-hit pipeline over the received camera-2 frame.
    pub fn analyze_cam2_image(
        &self,
        teed_ball: &Ball,
        strobed_image: &RgbImage
    ) -> Result<ShotOutcome, ShotError> {
        log::trace!("analyze_cam2_image called");

        let calibration = teed_ball.calibration
            .ok_or_else(|| ShotError::Config("teed ball is not calibrated".to_string()))?;

        // expected strobed-ball size from the teed ball's geometry, assuming a roughly
        // straight shot across camera 2's plane
        let expected_z = teed_ball.world_position.z;
        if expected_z < 0.0001 {
            return Err(ShotError::Config("teed ball has no solved z distance".to_string()));
        }
        let expected_radius = calibration.radius_px * (calibration.distance_m / expected_z);

        let mut detector = BallDetector::new(&self.config.ball_identification);
        detector.min_ball_radius = Some(
            (expected_radius * self.config.ball_identification.min_moved_radius_ratio) as u32
        );
        detector.max_ball_radius = Some(
            (expected_radius * self.config.ball_identification.max_moved_radius_ratio) as u32
        );

        log::trace!(
            "searching for strobed balls with radius {}..{} px",
            detector.min_ball_radius.unwrap(), detector.max_ball_radius.unwrap()
        );

        let (mode, roi) = if self.club == ClubType::Putter {
            // a putt stays in the lower half of the frame
            let roi = Rect::new(
                0,
                (strobed_image.height() / 2) as i32,
                strobed_image.width(),
                strobed_image.height() * 49 / 100
            );
            (SearchMode::Putting, roi)
        } else if self.external_strobe {
            (SearchMode::ExternalStrobe, Rect::default())
        } else {
            (SearchMode::Strobed, Rect::default())
        };

        // don't search on colour; the strobed exposures can differ a lot
        let mut search_reference = teed_ball.clone();
        search_reference.average_color = imgproc::ColorTriplet::zero();

        let candidates = detector.find_balls(strobed_image, &search_reference, roi, mode)
            .map_err(|_| ShotError::DetectionMiss)?;

        let selector = ExposureSelector::new(
            &self.config.ball_exposure_selection,
            self.club,
            self.orientation,
            (strobed_image.width(), strobed_image.height()),
            self.slowdown_pct()
        );

        let pulse_intervals = match self.club {
            ClubType::Putter => &self.config.strobing.pulse_vector_putter,
            _ => &self.config.strobing.pulse_vector_driver
        };

        let selection = selector.select(strobed_image, candidates, pulse_intervals)
            .map_err(|e| match e {
                SelectionError::TooFewCandidates(n) => ShotError::FilteringCollapse(n),
                SelectionError::FilteringCollapse(n) => ShotError::FilteringCollapse(n),
                SelectionError::NoAlignment => ShotError::FilteringCollapse(0)
            })?;

        log::trace!(
            "selection: {} exposures, alignment score {:.2} (collapsed {})",
            selection.balls_and_timing.len(),
            selection.alignment.score,
            selection.alignment.collapsed_pulses
        );

        // velocity from the two most-centered exposures, left-to-right order
        let (mut left_ball, mut right_ball) = if selection.face_ball.x() > selection.second_ball.x() {
            (selection.second_ball.clone(), selection.face_ball.clone())
        } else {
            (selection.face_ball.clone(), selection.second_ball.clone())
        };

        geometry::compute_ball_deltas(&mut left_ball, &mut right_ball, &self.camera2, &self.camera2, None)
            .map_err(|e| ShotError::Config(format!("{:?}", e)))?;

        let mut result_ball = right_ball;

        // Launch angles between the stationary ball and each in-flight exposure are
        // long-baseline and therefore robust against noisy exposure radii; average
        // them and let them overrule the two-exposure angles.
        let camera_offset = Vector3::new(
            self.config.cameras.cam2_offset_from_cam1[0],
            self.config.cameras.cam2_offset_from_cam1[1],
            self.config.cameras.cam2_offset_from_cam1[2]
        );

        let mut teed_to_exposure_balls: Vec<Ball> = vec![];
        for entry in &selection.balls_and_timing {
            let mut from_ball = teed_ball.clone();
            let mut to_ball = entry.ball.clone();
            geometry::compute_ball_deltas(
                &mut from_ball, &mut to_ball, &self.camera1, &self.camera2, Some(camera_offset)
            ).map_err(|e| ShotError::Config(format!("{:?}", e)))?;
            teed_to_exposure_balls.push(to_ball);
        }

        let averaged = Ball::average(&teed_to_exposure_balls);
        result_ball.angles_ball = averaged.angles_ball;
        result_ball.angles_camera = averaged.angles_camera;

        // with a trustworthy side angle in hand, re-derive the across component before
        // computing speed
        result_ball.position_deltas_ball.x =
            result_ball.world_position.x * result_ball.angles_ball.x.to_radians().sin();

        geometry::calculate_velocity(&mut result_ball, selection.time_between_face_and_second_us);

        let mut confidence = 1.0;
        let mut message = String::new();
        let mut rotation = Vector3::new(0.0, 0.0, 0.0);

        if self.config.spin_analysis.skip_spin || self.club == ClubType::Putter {
            log::trace!("skipping spin analysis");
            message = "spin analysis skipped".to_string();
        } else if selection.non_overlapping.len() < 2 {
            log::error!("could not find two non-overlapping balls to analyze for spin");
            confidence = 0.7;
            message = "no non-overlapping exposure pair; spin not available".to_string();
        } else {
            match self.process_spin(&selection, strobed_image, &mut result_ball) {
                Ok(r) => rotation = r,
                Err(e) => {
                    log::warn!("unable to compute spin: {:?}", e);
                    confidence = 0.7;
                    message = "spin analysis failed; returning zero spin".to_string();
                }
            }
        }

        let exposures: Vec<Ball> = selection.balls_and_timing.iter()
            .map(|entry| entry.ball.clone())
            .collect();

        Ok(ShotOutcome{
            result_ball,
            exposures,
            rotation_degrees: rotation,
            confidence,
            message
        })
    }

    fn process_spin(
        &self,
        selection: &crate::exposure::ExposureSelection,
        strobed_image: &RgbImage,
        result_ball: &mut Ball
    ) -> Result<Vector3<f64>, ShotError> {
        let selector = ExposureSelector::new(
            &self.config.ball_exposure_selection,
            self.club,
            self.orientation,
            (strobed_image.width(), strobed_image.height()),
            self.slowdown_pct()
        );

        let (mut spin_ball1, mut spin_ball2, interval_us) =
            selector.closest_spin_pair(&selection.non_overlapping)
                .ok_or(ShotError::SpinFailure)?;

        if interval_us <= 0 {
            return Err(ShotError::SpinFailure);
        }

        // the camera-perspective angles of both balls feed the de-rotation step
        geometry::compute_ball_deltas(&mut spin_ball1, &mut spin_ball2, &self.camera2, &self.camera2, None)
            .map_err(|_| ShotError::SpinFailure)?;

        let gray = imgproc::to_gray(strobed_image);
        let analyzer = SpinAnalyzer::new(&self.config.spin_analysis);
        let rotation = analyzer.ball_rotation(&gray, &spin_ball1, &gray, &spin_ball2)
            .map_err(|e| match e {
                SpinError::BallTooSmall | SpinError::NoCandidate => ShotError::SpinFailure
            })?;

        geometry::calculate_spin_rates(result_ball, rotation, interval_us);
        Ok(rotation)
    }
}

/// Side angles are taken between the teed ball and each exposure; a convenience for
/// status reporting.
pub fn format_velocity_interval(result_ball: &Ball) -> String {
    format!(
        " Time between chosen images for velocity calculation: {:<6.2} ms.",
        result_ball.time_between_positions_us as f64 / 1000.0
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::simulator::{exposures_for_shot, render_ball_scene};
    use crate::config::{CameraConfig, Configuration};

    /// Half-resolution cameras keep the synthetic pipeline fast.
    fn test_config() -> Configuration {
        let mut config = Configuration::default();
        let camera = CameraConfig{
            resolution_x: 728,
            resolution_y: 544,
            expected_ball_center: [364, 272],
            ..CameraConfig::default()
        };
        config.cameras.cam1 = camera.clone();
        config.cameras.cam2 = camera;
        config.cameras.cam2_offset_from_cam1 = [0.0, 0.0, 0.0];
        config.spin_analysis.skip_spin = true;
        config
    }

    #[test]
    fn teed_ball_detection_and_calibration() {
        let config = test_config();
        let analyzer = ShotAnalyzer::new(&config);

        let expected_radius = analyzer.camera1.expected_ball_radius_px(0.5);
        let image = render_ball_scene(728, 544, &[(364.0, 272.0, expected_radius as f32)], 0.0);

        let ball = analyzer.find_and_calibrate_teed_ball(&image).unwrap();

        assert!((ball.x() - 364.0).abs() <= 2.0);
        assert!((ball.y() - 272.0).abs() <= 2.0);
        assert!((ball.radius() - expected_radius).abs() <= 3.0);
        assert!(ball.is_calibrated());

        // geometry closes the loop: a 1-px radius error already moves the distance by
        // ~3 percent, so allow a small band around the truth
        let distance = ball.distance_to_lens.unwrap();
        assert!((distance - 0.5).abs() / 0.5 < 0.04, "distance {}", distance);
    }

    #[test]
    fn five_exposure_shot_velocity() {
        let config = test_config();
        let analyzer = ShotAnalyzer::new(&config);

        let radius = analyzer.camera1.expected_ball_radius_px(0.5);

        // the teed ball, calibrated
        let teed_image = render_ball_scene(728, 544, &[(364.0, 272.0, radius as f32)], 0.0);
        let teed_ball = analyzer.find_and_calibrate_teed_ball(&teed_image).unwrap();

        // five exposures spaced by the driver train at constant pixel speed, placed
        // down-range (to the right) of the teed position
        let pixels_per_ms = 25.0f32;
        let exposures = exposures_for_shot(
            380.0, 300.0, radius as f32, pixels_per_ms, 0.0,
            &config.strobing.pulse_vector_driver, 5
        );
        let strobed_image = render_ball_scene(728, 544, &exposures, 0.0);

        let outcome = analyzer.analyze_cam2_image(&teed_ball, &strobed_image).unwrap();
        assert!(outcome.exposures.len() >= 4, "kept {} exposures", outcome.exposures.len());

        // truth: pixel speed at the ball plane converted to meters
        let meters_per_ms = analyzer.camera2.x_distance_to_meters(0.5, pixels_per_ms as f64);
        let truth_mps = meters_per_ms * 1000.0;
        let measured = outcome.result_ball.velocity_mps;
        assert!(
            (measured - truth_mps).abs() / truth_mps < 0.08,
            "velocity {} vs truth {}", measured, truth_mps
        );
    }

    #[test]
    fn empty_strobed_frame_is_a_detection_miss() {
        let config = test_config();
        let analyzer = ShotAnalyzer::new(&config);

        let radius = analyzer.camera1.expected_ball_radius_px(0.5);
        let teed_image = render_ball_scene(728, 544, &[(364.0, 272.0, radius as f32)], 0.0);
        let teed_ball = analyzer.find_and_calibrate_teed_ball(&teed_image).unwrap();

        let empty = render_ball_scene(728, 544, &[], 0.0);
        assert!(matches!(
            analyzer.analyze_cam2_image(&teed_ball, &empty),
            Err(ShotError::DetectionMiss)
        ));
    }

    #[test]
    fn uncalibrated_ball_is_a_config_error() {
        let config = test_config();
        let analyzer = ShotAnalyzer::new(&config);

        let strobed = render_ball_scene(728, 544, &[(100.0, 100.0, 30.0)], 0.0);
        assert!(matches!(
            analyzer.analyze_cam2_image(&Ball::default(), &strobed),
            Err(ShotError::Config(_))
        ));
    }
}
