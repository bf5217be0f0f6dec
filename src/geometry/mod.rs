//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Geometry solver: pixel positions and radii to world positions, angles and velocity.
//!

use crate::ball::{Ball, BallCalibration};
use crate::config::{self, CameraConfig};
use cgmath::{InnerSpace, Vector2, Vector3};

#[derive(Debug)]
pub enum GeometryError {
    /// The ball's line-of-sight distance was not solved before use.
    DistanceNotSet,
    /// A z-distance of (near) zero makes angles meaningless.
    DegenerateDistance,
    ZeroRadius
}

/// Camera intrinsics plus pose relative to the ball-plane origin.
///
/// Origin is the expected ball rest position; +x down-range, +y up, +z across. Pan (x
/// angle) is positive counter-clockwise seen from above, tilt (y angle) positive upward.
#[derive(Clone, Debug)]
pub struct CameraSpec {
    pub focal_length_mm: f64,
    pub sensor_width_mm: f64,
    pub sensor_height_mm: f64,
    pub resolution_x: u32,
    pub resolution_y: u32,
    pub position_from_origin: Vector3<f64>,
    /// (pan, tilt), degrees.
    pub angles_deg: Vector2<f64>,
    pub x_offset_for_tilt: f64,
    pub y_offset_for_tilt: f64,
    pub calibration_distance_m: f64,
    pub expected_ball_center: Vector2<i32>
}

impl From<&CameraConfig> for CameraSpec {
    fn from(config: &CameraConfig) -> CameraSpec {
        CameraSpec{
            focal_length_mm: config.focal_length_mm,
            sensor_width_mm: config.sensor_width_mm,
            sensor_height_mm: config.sensor_height_mm,
            resolution_x: config.resolution_x,
            resolution_y: config.resolution_y,
            position_from_origin: Vector3::new(
                config.position_from_origin[0],
                config.position_from_origin[1],
                config.position_from_origin[2]
            ),
            angles_deg: Vector2::new(config.angles_deg[0], config.angles_deg[1]),
            x_offset_for_tilt: config.x_offset_for_tilt,
            y_offset_for_tilt: config.y_offset_for_tilt,
            calibration_distance_m: config.calibration_distance_m,
            expected_ball_center: Vector2::new(
                config.expected_ball_center[0],
                config.expected_ball_center[1]
            )
        }
    }
}

impl CameraSpec {
    /// Ball radius (px) a regulation ball presents at the given distance.
    pub fn expected_ball_radius_px(&self, distance_m: f64) -> f64 {
        self.resolution_x as f64 * config::BALL_RADIUS_METERS * self.focal_length_mm
            / (self.sensor_width_mm * distance_m)
    }

    /// Distance (m) from the measured image radius, by triangle similarity. When an
    /// ellipse is present, its smaller axis and an effective sensor width along the
    /// ellipse angle are used instead.
    pub fn distance_from_radius(&self, ball: &Ball) -> Result<f64, GeometryError> {
        let (radius_px, effective_sensor_width, effective_resolution) = match &ball.ellipse {
            Some(ellipse) if ellipse.width > 0.0 && ellipse.height > 0.0 => {
                let radius = ellipse.width.min(ellipse.height) as f64 / 2.0;

                let corner_angle = (self.sensor_height_mm / self.sensor_width_mm).atan().to_degrees();
                let angle = ellipse.angle_deg as f64;

                // whichever sensor dimension the ellipse's long axis leans toward acts
                // as the measuring stick
                if (angle > corner_angle && angle < 180.0 - corner_angle)
                    || (angle > 180.0 + corner_angle && angle < 360.0 - corner_angle)
                {
                    let cos = (90.0 - angle).to_radians().cos();
                    (radius, (self.sensor_width_mm / cos).abs(), (self.resolution_x as f64 / cos).abs())
                } else {
                    let cos = angle.to_radians().cos();
                    (radius, (self.sensor_height_mm / cos).abs(), (self.resolution_y as f64 / cos).abs())
                }
            },
            _ => (ball.radius(), self.sensor_width_mm, self.resolution_x as f64)
        };

        if radius_px < 0.001 {
            return Err(GeometryError::ZeroRadius);
        }

        Ok((effective_resolution / (2.0 * radius_px))
            * (2.0 * config::BALL_RADIUS_METERS)
            * (self.focal_length_mm / effective_sensor_width))
    }

    /// Focal length (mm) back-computed from a radius observed at a known distance.
    pub fn focal_length_from(&self, radius_px: f64, distance_m: f64) -> f64 {
        distance_m * self.sensor_width_mm * (2.0 * radius_px / self.resolution_x as f64)
            / (2.0 * config::BALL_RADIUS_METERS)
    }

    /// Image-plane x offset (px from center) to meters at the given z distance.
    pub fn x_distance_to_meters(&self, z_m: f64, x_px: f64) -> f64 {
        let half_width_m = (z_m / self.focal_length_mm) * (self.sensor_width_mm / 2.0);
        half_width_m * (x_px / (self.resolution_x as f64 / 2.0))
    }

    pub fn y_distance_to_meters(&self, z_m: f64, y_px: f64) -> f64 {
        let half_height_m = (z_m / self.focal_length_mm) * (self.sensor_height_mm / 2.0);
        half_height_m * (y_px / (self.resolution_y as f64 / 2.0))
    }

    /// Inverse of `x_distance_to_meters`; used to render synthetic scenes.
    pub fn x_meters_to_pixels(&self, z_m: f64, x_m: f64) -> f64 {
        let half_width_m = (z_m / self.focal_length_mm) * (self.sensor_width_mm / 2.0);
        x_m / half_width_m * (self.resolution_x as f64 / 2.0)
    }

    pub fn y_meters_to_pixels(&self, z_m: f64, y_m: f64) -> f64 {
        let half_height_m = (z_m / self.focal_length_mm) * (self.sensor_height_mm / 2.0);
        y_m / half_height_m * (self.resolution_y as f64 / 2.0)
    }

    /// The twist of the image plane that pan and tilt jointly impose, degrees.
    fn twist_deg(&self) -> f64 {
        let mut tilt = self.angles_deg.y;
        if tilt.abs() < 0.0001 {
            tilt = 0.0001;
        }
        self.angles_deg.x.to_radians().sin() * tilt
    }

    /// Solves the ball's world position and its camera-axis angles from the image-plane
    /// position and the already-known z-plane distance.
    ///
    /// Sets `world_position`, `angles_camera` and leaves `distance_to_lens` untouched.
    pub fn solve_world_position(&self, ball: &mut Ball) -> Result<(), GeometryError> {
        let z_distance = match ball.distance_to_lens {
            Some(d) if d > 0.0001 => d,
            _ => return Err(GeometryError::DistanceNotSet)
        };

        let x_from_center = ball.x() - (self.resolution_x as f64 / 2.0).round();
        let y_from_center = ball.y() - (self.resolution_y as f64 / 2.0).round();

        // distances as if the camera pointed straight at the ball plane;
        // y grows downward on the sensor, upward in the world
        let x_m = self.x_distance_to_meters(z_distance, x_from_center);
        let y_m = -self.y_distance_to_meters(z_distance, y_from_center);

        // undo the image-plane twist caused by pan-with-tilt
        let twist_rad = self.twist_deg().to_radians();
        let rotated_x = x_m * twist_rad.cos() - y_m * twist_rad.sin();
        let rotated_y = x_m * twist_rad.sin() + y_m * twist_rad.cos();

        // angles of the ball from the camera's perspective; positive x to the left
        // looking out of the lens
        let angle_x = -(rotated_x / z_distance).atan().to_degrees();
        let angle_y = (rotated_y / z_distance).atan().to_degrees();

        // add the camera pose to reach launch-monitor-perspective polar coordinates
        let lm_angle_x = self.angles_deg.x + angle_x;
        let lm_angle_y = self.angles_deg.y + angle_y;

        // polar to Cartesian (spherical convention: phi from the pole)
        let phi = (90.0 + lm_angle_y).to_radians();
        let theta = lm_angle_x.to_radians();
        let rho = z_distance;
        let cartesian_x = rho * phi.sin() * theta.cos();
        let cartesian_y = rho * phi.sin() * theta.sin();
        let cartesian_z = rho * phi.cos();

        ball.world_position = Vector3::new(
            -cartesian_y + self.x_offset_for_tilt,
            -cartesian_z + self.y_offset_for_tilt,
            cartesian_x
        );
        ball.angles_camera = camera_axis_angles(&ball.world_position)?;

        Ok(())
    }
}

/// Angles of a point from the camera axis: positive x counter-clockwise seen from
/// above, positive y looking up. Degrees.
pub fn camera_axis_angles(position: &Vector3<f64>) -> Result<Vector2<f64>, GeometryError> {
    if position.z < 0.0001 {
        return Err(GeometryError::DegenerateDistance);
    }
    Ok(Vector2::new(
        (position.x / position.z).atan().to_degrees(),
        -(-position.y / position.z).atan().to_degrees()
    ))
}

/// Per-axis world deltas between two solved balls: camera frame and the ball-flight
/// frame (z down-range, y up, x across; flight-x = -camera-z, flight-y = camera-y,
/// flight-z = camera-x).
pub fn position_deltas(b1: &Ball, b2: &Ball) -> (Vector3<f64>, Vector3<f64>) {
    let camera = b2.world_position - b1.world_position;
    let flight = Vector3::new(-camera.z, camera.y, camera.x);
    (camera, flight)
}

/// Launch angles of the line from `deltas` (flight frame), degrees:
/// x = horizontal launch angle, y = vertical.
pub fn launch_angles(deltas: &Vector3<f64>) -> Vector2<f64> {
    if deltas.z <= 0.001 {
        // the ball may simply not have moved; report level flight rather than failing
        log::error!("launch_angles: down-range delta was ~0");
        return Vector2::new(0.0, 0.0);
    }
    Vector2::new(
        (deltas.x / deltas.z).atan().to_degrees(),
        (deltas.y / deltas.z).atan().to_degrees()
    )
}

/// Fills in the delta information of `b2` versus `b1`.
///
/// Both balls get their distances (from radius) and world positions solved against
/// their own camera; when the two balls come from different cameras, `camera_offset`
/// (position of the second camera relative to the first) is added to the second ball's
/// world position first.
pub fn compute_ball_deltas(
    b1: &mut Ball,
    b2: &mut Ball,
    first_camera: &CameraSpec,
    second_camera: &CameraSpec,
    camera_offset: Option<Vector3<f64>>
) -> Result<(), GeometryError> {
    if b1.distance_to_lens.is_none() {
        b1.distance_to_lens = Some(first_camera.distance_from_radius(b1)?);
    }
    if b2.distance_to_lens.is_none() {
        b2.distance_to_lens = Some(second_camera.distance_from_radius(b2)?);
    }

    first_camera.solve_world_position(b1)?;
    second_camera.solve_world_position(b2)?;

    if let Some(offset) = camera_offset {
        b2.world_position += offset;
    }

    let (camera_deltas, flight_deltas) = position_deltas(b1, b2);
    b2.distance_deltas_camera = camera_deltas;
    b2.position_deltas_ball = flight_deltas;
    b2.angles_ball = launch_angles(&flight_deltas);

    Ok(())
}

/// Velocity from the flight-frame deltas and the strobe interval between the two
/// chosen exposures.
pub fn calculate_velocity(ball: &mut Ball, time_delay_us: i64) {
    if time_delay_us <= 0 {
        ball.velocity_mps = 0.0;
        return;
    }
    ball.velocity_mps = ball.position_deltas_ball.magnitude() / time_delay_us as f64 * 1.0e6;
    ball.time_between_positions_us = time_delay_us;
}

/// Converts a rotation delta (degrees per axis) into RPM over the given interval.
pub fn calculate_spin_rates(ball: &mut Ball, rotation_degrees: Vector3<f64>, time_delay_us: i64) {
    ball.rotation_degrees = rotation_degrees;
    if time_delay_us <= 0 {
        ball.rotation_rpm = Vector3::new(0.0, 0.0, 0.0);
        return;
    }
    for i in 0..3 {
        ball.rotation_rpm[i] = 60.0 * (rotation_degrees[i] / 360.0) / time_delay_us as f64 * 1.0e6;
    }
    ball.time_between_angles_us = time_delay_us;
}

/// Marks the ball as calibrated at the camera's reference distance.
pub fn calibrate_at_reference(ball: &mut Ball, camera: &CameraSpec) {
    let focal_length = camera.focal_length_from(ball.radius(), camera.calibration_distance_m);
    ball.calibration = Some(BallCalibration{
        distance_m: camera.calibration_distance_m,
        radius_px: ball.radius(),
        focal_length_mm: Some(focal_length)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgproc::Circle;

    fn test_camera() -> CameraSpec {
        CameraSpec::from(&CameraConfig::default())
    }

    fn ball_at(x: f32, y: f32, radius: f32) -> Ball {
        Ball::from_circle(Circle::new(x, y, radius))
    }

    #[test]
    fn distance_radius_roundtrip() {
        let camera = test_camera();

        for &distance in &[0.3, 0.5, 0.8, 1.5] {
            let radius = camera.expected_ball_radius_px(distance);
            let ball = ball_at(100.0, 100.0, radius as f32);
            let recovered = camera.distance_from_radius(&ball).unwrap();
            assert!(
                (recovered - distance).abs() / distance < 0.005,
                "distance {} recovered as {}", distance, recovered
            );
        }
    }

    #[test]
    fn pixel_world_roundtrip_at_center() {
        let camera = test_camera();
        let distance = 0.5;

        let mut ball = ball_at(
            camera.resolution_x as f32 / 2.0,
            camera.resolution_y as f32 / 2.0,
            camera.expected_ball_radius_px(distance) as f32
        );
        ball.distance_to_lens = Some(distance);
        camera.solve_world_position(&mut ball).unwrap();

        // a centered ball with a straight camera sits on the axis
        assert!(ball.world_position.x.abs() < 1.0e-6);
        assert!(ball.world_position.y.abs() < 1.0e-6);
        assert!((ball.world_position.z - distance).abs() < 1.0e-6);

        // and back: the world offsets project to the center pixel
        let px = camera.x_meters_to_pixels(distance, ball.world_position.x);
        let py = camera.y_meters_to_pixels(distance, ball.world_position.y);
        assert!(px.abs() < 0.5 && py.abs() < 0.5);
    }

    #[test]
    fn off_center_ball_has_offset_world_position() {
        let camera = test_camera();
        let distance = 0.5;

        let mut ball = ball_at(
            camera.resolution_x as f32 / 2.0 + 100.0,
            camera.resolution_y as f32 / 2.0,
            50.0
        );
        ball.distance_to_lens = Some(distance);
        camera.solve_world_position(&mut ball).unwrap();

        let expected_x = camera.x_distance_to_meters(distance, 100.0);
        assert!((ball.world_position.x - expected_x).abs() < 0.002,
            "world x {} vs expected {}", ball.world_position.x, expected_x);
        assert!(ball.angles_camera.x > 0.0);
    }

    #[test]
    fn deltas_and_launch_angles_between_two_balls() {
        let camera = test_camera();
        let distance = 0.5;
        let radius = camera.expected_ball_radius_px(distance) as f32;
        let center_x = camera.resolution_x as f32 / 2.0;
        let center_y = camera.resolution_y as f32 / 2.0;

        let mut b1 = ball_at(center_x - 150.0, center_y, radius);
        // second exposure: further right and a little up (image y decreases)
        let mut b2 = ball_at(center_x + 150.0, center_y - 40.0, radius);

        compute_ball_deltas(&mut b1, &mut b2, &camera, &camera, None).unwrap();

        // flight-frame: down-range (z) motion positive, upward positive, nothing across
        assert!(b2.position_deltas_ball.z > 0.0);
        assert!(b2.position_deltas_ball.x.abs() < 0.01);
        assert!(b2.position_deltas_ball.y > 0.0);
        // vertical launch angle is positive and modest
        assert!(b2.angles_ball.y > 0.0 && b2.angles_ball.y < 45.0);
    }

    #[test]
    fn velocity_from_deltas() {
        let mut ball = Ball::default();
        ball.position_deltas_ball = Vector3::new(0.3, 0.04, 0.0);

        calculate_velocity(&mut ball, 10_000); // 10 ms
        let expected = (0.3f64.powi(2) + 0.04f64.powi(2)).sqrt() / 0.01;
        assert!((ball.velocity_mps - expected).abs() < 1.0e-9);
    }

    #[test]
    fn spin_rates_from_rotation() {
        let mut ball = Ball::default();
        calculate_spin_rates(&mut ball, Vector3::new(0.0, 0.0, 30.0), 1000);

        // 30 degrees in 1 ms -> (30/360) rev / 0.001 s * 60 s = 5000 rpm
        assert!((ball.rotation_rpm.z - 5000.0).abs() < 1.0e-6);
    }

    #[test]
    fn solve_requires_distance() {
        let camera = test_camera();
        let mut ball = ball_at(10.0, 10.0, 20.0);
        assert!(matches!(
            camera.solve_world_position(&mut ball),
            Err(GeometryError::DistanceNotSet)
        ));
    }
}
