//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! The golf-ball value type and its relations to other balls.
//!

use crate::imgproc::{Circle, ColorTriplet, Ellipse};
use cgmath::{Vector2, Vector3, Zero};

#[derive(Clone, Copy, Debug, PartialEq, strum_macros::Display)]
pub enum ClubType {
    Driver,
    Iron,
    Putter
}

#[derive(Clone, Copy, Debug, PartialEq, strum_macros::Display)]
pub enum GolferOrientation {
    RightHanded,
    LeftHanded
}

/// Values captured when the teed ball is measured at a known distance.
#[derive(Clone, Copy, Debug)]
pub struct BallCalibration {
    pub distance_m: f64,
    pub radius_px: f64,
    /// Focal length back-computed from the known distance, if it was.
    pub focal_length_mm: Option<f64>
}

/// A detected or known golf-ball instance.
///
/// Most fields describe the relation of this ball to an earlier observation of the same
/// physical ball (deltas, angles, rotation); detectors fill in only the image-plane and
/// colour fields.
#[derive(Clone, Debug)]
pub struct Ball {
    /// Image-plane circle, pixels.
    pub circle: Circle,
    /// Elliptical fit; rarely available. Width >= height when present.
    pub ellipse: Option<Ellipse>,

    pub average_color: ColorTriplet,
    pub median_color: ColorTriplet,
    pub std_color: ColorTriplet,

    /// 0 is best; assigned by the detector.
    pub quality_rank: u32,

    pub calibration: Option<BallCalibration>,
    /// Distance from the lens to the ball's z-plane, meters; set once solved.
    pub distance_to_lens: Option<f64>,

    /// Solved position in the camera-aligned world frame, meters.
    pub world_position: Vector3<f64>,

    /// Real-world position deltas versus an earlier ball, camera-aligned frame (x right,
    /// y up, z out of the lens).
    pub distance_deltas_camera: Vector3<f64>,
    /// The same deltas in the ball-flight frame (z down-range, y up, x across).
    pub position_deltas_ball: Vector3<f64>,

    /// (x, y) angles from the camera axis to this ball, degrees.
    pub angles_camera: Vector2<f64>,
    /// (horizontal, vertical) launch angles between two balls, flight frame, degrees.
    pub angles_ball: Vector2<f64>,

    /// Rotation versus the paired ball, degrees per axis.
    pub rotation_degrees: Vector3<f64>,
    pub rotation_rpm: Vector3<f64>,

    pub velocity_mps: f64,
    pub time_between_positions_us: i64,
    pub time_between_angles_us: i64,

    /// Center and radius of the search region used when the ball was looked for but not
    /// found; lets the operator see where the system was looking.
    pub search_area: Option<(Vector2<i32>, i32)>
}

impl Default for Ball {
    fn default() -> Ball {
        Ball{
            circle: Circle::default(),
            ellipse: None,
            average_color: ColorTriplet::zero(),
            median_color: ColorTriplet::zero(),
            std_color: ColorTriplet::zero(),
            quality_rank: 0,
            calibration: None,
            distance_to_lens: None,
            world_position: Vector3::zero(),
            distance_deltas_camera: Vector3::zero(),
            position_deltas_ball: Vector3::zero(),
            angles_camera: Vector2::zero(),
            angles_ball: Vector2::zero(),
            rotation_degrees: Vector3::zero(),
            rotation_rpm: Vector3::zero(),
            velocity_mps: 0.0,
            time_between_positions_us: 0,
            time_between_angles_us: 0,
            search_area: None
        }
    }
}

impl Ball {
    pub fn from_circle(circle: Circle) -> Ball {
        Ball{ circle, ..Ball::default() }
    }

    pub fn x(&self) -> f64 { self.circle.x as f64 }

    pub fn y(&self) -> f64 { self.circle.y as f64 }

    pub fn radius(&self) -> f64 { self.circle.radius as f64 }

    pub fn is_calibrated(&self) -> bool { self.calibration.is_some() }

    pub fn pixel_distance_from(&self, other: &Ball) -> f64 {
        self.circle.center_distance(&other.circle)
    }

    /// True if this ball moved relative to `reference`: center moved more than
    /// `max_center_move_px` or the radius changed more than `max_radius_change_pct`.
    pub fn moved_relative_to(
        &self,
        reference: &Ball,
        max_center_move_px: f64,
        max_radius_change_pct: f64
    ) -> bool {
        if self.pixel_distance_from(reference) > max_center_move_px {
            return true;
        }

        let reference_radius = reference.radius();
        if reference_radius <= 0.0 {
            return true;
        }
        let radius_change_pct = 100.0 * (self.radius() - reference_radius).abs() / reference_radius;
        radius_change_pct > max_radius_change_pct
    }

    pub fn point_is_inside(&self, x: f64, y: f64) -> bool {
        self.circle.contains_point(x, y)
    }

    /// The solved position re-expressed in the ball-flight frame (z down-range, y up,
    /// x across): flight-x = -camera-z, flight-y = camera-y, flight-z = camera-x.
    pub fn flight_position(&self) -> Vector3<f64> {
        Vector3::new(-self.world_position.z, self.world_position.y, self.world_position.x)
    }

    /// Averages positions and angle measurements over `balls`. Velocities, spins and
    /// distances are intentionally left alone; averaging them across different ball
    /// pairs would be meaningless.
    pub fn average(balls: &[Ball]) -> Ball {
        let mut result = Ball::default();
        if balls.is_empty() { return result; }

        let n = balls.len() as f64;
        let mut x = 0.0;
        let mut y = 0.0;
        let mut radius = 0.0;

        for ball in balls {
            x += ball.x();
            y += ball.y();
            radius += ball.radius();
            result.angles_ball += ball.angles_ball;
            result.angles_camera += ball.angles_camera;
        }

        result.circle = Circle::new((x / n) as f32, (y / n) as f32, (radius / n) as f32);
        result.angles_ball /= n;
        result.angles_camera /= n;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ball_at(x: f32, y: f32, radius: f32) -> Ball {
        Ball::from_circle(Circle::new(x, y, radius))
    }

    #[test]
    fn movement_gates() {
        let reference = ball_at(100.0, 100.0, 20.0);

        assert!(!ball_at(102.0, 101.0, 20.5).moved_relative_to(&reference, 10.0, 6.0));
        // center moved too far
        assert!(ball_at(120.0, 100.0, 20.0).moved_relative_to(&reference, 10.0, 6.0));
        // radius grew too much
        assert!(ball_at(100.0, 100.0, 23.0).moved_relative_to(&reference, 10.0, 6.0));
    }

    #[test]
    fn averaging_angles_and_position() {
        let mut a = ball_at(10.0, 20.0, 5.0);
        a.angles_ball = Vector2::new(2.0, 4.0);
        let mut b = ball_at(30.0, 40.0, 7.0);
        b.angles_ball = Vector2::new(4.0, 8.0);

        let averaged = Ball::average(&[a, b]);
        assert!((averaged.x() - 20.0).abs() < 1.0e-9);
        assert!((averaged.y() - 30.0).abs() < 1.0e-9);
        assert!((averaged.radius() - 6.0).abs() < 1.0e-9);
        assert!((averaged.angles_ball.x - 3.0).abs() < 1.0e-9);
        assert!((averaged.angles_ball.y - 6.0).abs() < 1.0e-9);
    }
}
