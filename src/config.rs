//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Program configuration.
//!
//! The whole tree is deserialized once at startup and is read-only afterwards;
//! components receive the sub-struct they need at construction time.
//!

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error)
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> ConfigError { ConfigError::Io(e) }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> ConfigError { ConfigError::Parse(e) }
}

/// Golf ball radius in meters (regulation minimum diameter 42.67 mm).
pub const BALL_RADIUS_METERS: f64 = 0.021335;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub strobing: StrobingConfig,
    pub ball_identification: DetectionConfig,
    pub ball_exposure_selection: ExposureSelectionConfig,
    pub spin_analysis: SpinConfig,
    pub cameras: CamerasConfig,
    pub ipc: IpcConfig,
    pub simulators: SimulatorsConfig
}

impl Configuration {
    /// Loads the configuration from `path`, or from the default location if `path` is `None`.
    ///
    /// A missing file yields the built-in defaults; a present but malformed file is an error
    /// (fatal at startup).
    pub fn load(path: Option<&Path>) -> Result<Configuration, ConfigError> {
        let file_path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()
        };

        if !file_path.exists() {
            log::warn!("configuration file {} not found; using defaults", file_path.to_string_lossy());
            return Ok(Configuration::default());
        }

        let contents = std::fs::read_to_string(&file_path)?;
        let config: Configuration = serde_json::from_str(&contents)?;
        Ok(config)
    }
}

fn default_config_path() -> PathBuf {
    Path::new(
        &dirs::config_dir().or(Some(Path::new("").to_path_buf())).unwrap()
    ).join("stroboxide.json")
}

// ---------------------------------------------------------------------------- strobing

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StrobingConfig {
    /// Strobe off-durations (ms) used for full shots; roughly geometric growth.
    pub pulse_vector_driver: Vec<f64>,
    /// Strobe off-durations (ms) used for putting; longer, near-constant intervals.
    pub pulse_vector_putter: Vec<f64>,
    /// Width of each on-pulse in bitstream bits at the fast baud rate.
    pub on_pulse_bits_fast: u32,
    /// Width of each on-pulse in bitstream bits at the slow baud rate.
    pub on_pulse_bits_slow: u32,
    pub baud_fast: u32,
    pub baud_slow: u32,
    /// Expected per-interval ball slowdown, full shots (percent).
    pub standard_slowdown_pct: f64,
    /// Expected per-interval slowdown for lightweight practice balls (percent).
    pub practice_slowdown_pct: f64,
    /// Expected per-interval slowdown when putting (percent).
    pub putting_slowdown_pct: f64,
    /// Wait before the trigger in putting mode so the ball is inside the frame (ms).
    pub putting_strobe_delay_ms: u64,
    pub num_priming_pulses: u32,
    pub pause_before_priming_pulses_ms: u64,
    pub pause_before_last_priming_pulse_ms: u64
}

impl Default for StrobingConfig {
    fn default() -> StrobingConfig {
        StrobingConfig{
            pulse_vector_driver: vec![2.0, 2.5, 3.2, 4.0, 5.0, 6.3, 7.9, 10.0, 12.6, 15.8],
            pulse_vector_putter: vec![12.0, 12.0, 14.0, 14.0, 16.0, 16.0, 18.0],
            on_pulse_bits_fast: 4,
            on_pulse_bits_slow: 6,
            baud_fast: 1_000_000,
            baud_slow: 200_000,
            standard_slowdown_pct: 0.5,
            practice_slowdown_pct: 2.0,
            putting_slowdown_pct: 5.0,
            putting_strobe_delay_ms: 0,
            num_priming_pulses: 10,
            pause_before_priming_pulses_ms: 0,
            pause_before_last_priming_pulse_ms: 0
        }
    }
}

// ---------------------------------------------------------------------------- detection

/// Hough parameters for one imaging regime.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HoughParams {
    pub canny_lower: f64,
    pub canny_upper: f64,
    /// Gaussian blur kernel size applied before edge detection; forced odd.
    pub pre_canny_blur: u32,
    /// Blur applied to the edge image before the Hough transform; forced odd.
    pub pre_hough_blur: u32,
    pub starting_param2: f64,
    pub min_param2: f64,
    pub max_param2: f64,
    pub param1: f64,
    pub param2_increment: f64,
    pub min_circles: usize,
    pub max_circles: usize,
    /// Accumulator downscaling; must be in (0, 2].
    pub dp: f64
}

impl Default for HoughParams {
    fn default() -> HoughParams {
        HoughParams{
            canny_lower: 50.0,
            canny_upper: 110.0,
            pre_canny_blur: 5,
            pre_hough_blur: 13,
            starting_param2: 40.0,
            min_param2: 30.0,
            max_param2: 60.0,
            param1: 120.0,
            param2_increment: 4.0,
            min_circles: 1,
            max_circles: 12,
            dp: 1.5
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NarrowingParams {
    pub enabled: bool,
    /// How many of the top detections to average when narrowing the radius band.
    pub radii_to_average: usize,
    pub min_ratio: f64,
    pub max_ratio: f64,
    pub param1: f64,
    pub param2: f64,
    pub dp: f64
}

impl Default for NarrowingParams {
    fn default() -> NarrowingParams {
        NarrowingParams{
            enabled: true,
            radii_to_average: 3,
            min_ratio: 0.8,
            max_ratio: 1.2,
            param1: 130.0,
            param2: 100.0,
            dp: 1.8
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BestCircleParams {
    pub enabled: bool,
    /// If set, the largest refined sub-candidate replaces the circle; otherwise the best-scored.
    pub choose_largest: bool,
    pub canny_lower: f64,
    pub canny_upper: f64,
    pub pre_canny_blur: u32,
    pub pre_hough_blur: u32,
    pub param1: f64,
    pub param2: f64,
    pub dp: f64,
    pub min_radius_ratio: f64,
    pub max_radius_ratio: f64
}

impl Default for BestCircleParams {
    fn default() -> BestCircleParams {
        BestCircleParams{
            enabled: false,
            choose_largest: false,
            canny_lower: 55.0,
            canny_upper: 110.0,
            pre_canny_blur: 5,
            pre_hough_blur: 13,
            param1: 120.0,
            param2: 35.0,
            dp: 1.5,
            min_radius_ratio: 0.85,
            max_radius_ratio: 1.10
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub placed: HoughParams,
    pub strobed: HoughParams,
    pub putting: HoughParams,
    pub external_strobe: HoughParams,
    pub placed_narrowing: NarrowingParams,
    pub strobed_narrowing: NarrowingParams,
    pub best_circle: BestCircleParams,
    /// Additive widening (all three HSV channels) applied to the colour-mask range.
    pub color_mask_widening: f64,
    /// Use the colour mask at all (off for monochrome-ish IR imagery).
    pub use_color_mask: bool,
    /// Prefer the largest plausible final ball over the best-scored one.
    pub use_largest_ball: bool,
    pub min_candidate_radius: u32,
    /// Radius band, relative to the expected radius, for a ball that has moved down-range.
    pub min_moved_radius_ratio: f64,
    pub max_moved_radius_ratio: f64,
    /// Line-suppression parameters for the externally-strobed regime.
    pub external_min_line_length: u32,
    pub external_max_line_gap: u32,
    pub external_line_angle_lower_deg: f64,
    pub external_line_angle_upper_deg: f64
}

impl Default for DetectionConfig {
    fn default() -> DetectionConfig {
        DetectionConfig{
            placed: HoughParams{
                canny_lower: 33.0,
                canny_upper: 66.0,
                pre_canny_blur: 5,
                pre_hough_blur: 11,
                starting_param2: 40.0,
                min_param2: 30.0,
                max_param2: 60.0,
                param1: 120.0,
                param2_increment: 4.0,
                min_circles: 1,
                max_circles: 4,
                dp: 1.5
            },
            strobed: HoughParams{
                canny_lower: 35.0,
                canny_upper: 70.0,
                pre_canny_blur: 11,
                pre_hough_blur: 17,
                starting_param2: 0.95,
                min_param2: 0.6,
                max_param2: 1.0,
                param1: 130.0,
                param2_increment: 0.05,
                min_circles: 1,
                max_circles: 12,
                dp: 1.5
            },
            putting: HoughParams{
                canny_lower: 50.0,
                canny_upper: 110.0,
                pre_canny_blur: 9,
                pre_hough_blur: 5,
                starting_param2: 40.0,
                min_param2: 30.0,
                max_param2: 60.0,
                param1: 120.0,
                param2_increment: 4.0,
                min_circles: 1,
                max_circles: 12,
                dp: 1.5
            },
            external_strobe: HoughParams{
                canny_lower: 156.0,
                canny_upper: 337.0,
                pre_canny_blur: 3,
                pre_hough_blur: 13,
                starting_param2: 65.0,
                min_param2: 28.0,
                max_param2: 100.0,
                param1: 130.0,
                param2_increment: 4.0,
                min_circles: 3,
                max_circles: 20,
                dp: 1.0
            },
            placed_narrowing: NarrowingParams{
                enabled: true,
                radii_to_average: 3,
                min_ratio: 0.9,
                max_ratio: 1.1,
                param1: 130.0,
                param2: 80.0,
                dp: 2.0
            },
            strobed_narrowing: NarrowingParams::default(),
            best_circle: BestCircleParams::default(),
            color_mask_widening: 10.0,
            use_color_mask: false,
            use_largest_ball: true,
            min_candidate_radius: 4,
            min_moved_radius_ratio: 0.7,
            max_moved_radius_ratio: 1.2,
            external_min_line_length: 23,
            external_max_line_gap: 7,
            external_line_angle_lower_deg: 140.0,
            external_line_angle_upper_deg: 180.0
        }
    }
}

// ---------------------------------------------------------------------------- exposure selection

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ExposureSelectionConfig {
    pub max_color_diff_relaxed: f64,
    pub max_color_diff_putting: f64,
    pub max_color_diff_strict: f64,
    /// Allowed overlap margin (percent of summed radii) for the relaxed overlap pass.
    pub proximity_margin_relaxed_pct: f64,
    /// Margin for the strict pass feeding spin analysis.
    pub proximity_margin_strict_pct: f64,
    /// Maximum perpendicular distance (px) from the anchor trajectory.
    pub max_off_trajectory: f64,
    /// Tighter limit used when deciding the fate of an overlapping pair.
    pub max_off_trajectory_overlap: f64,
    pub max_off_trajectory_overlap_putting: f64,
    pub max_radius_change_pct: f64,
    pub max_radius_change_pct_putting: f64,
    /// Overlapped-artefact gate: ratio between near-pair and far-pair radius change.
    pub max_overlapped_radius_change_ratio: f64,
    pub max_radius_diff_from_best_pct: f64,
    pub min_launch_angle_deg: f64,
    pub max_launch_angle_deg: f64,
    pub min_putting_launch_angle_deg: f64,
    pub max_putting_launch_angle_deg: f64,
    /// Candidates closer than this (px) take part in the unlikely-angle check.
    pub unlikely_angle_min_distance_px: f64,
    pub max_balls_to_retain: usize,
    /// Penalty multiplier applied to alignment scores that collapse pulses.
    pub lost_pulse_penalty_pct: f64,
    /// Keep spin-ball pairs away from the frame edges by this much when possible.
    pub edge_backoff_px: i32,
    pub weight_rgb_darker: f64,
    pub weight_rgb_lighter: f64,
    pub weight_std_darker: f64,
    pub weight_std_lighter: f64
}

impl Default for ExposureSelectionConfig {
    fn default() -> ExposureSelectionConfig {
        ExposureSelectionConfig{
            max_color_diff_relaxed: 35000.0,
            max_color_diff_putting: 35000.0,
            max_color_diff_strict: 15000.0,
            proximity_margin_relaxed_pct: 50.0,
            proximity_margin_strict_pct: 5.0,
            max_off_trajectory: 20.0,
            max_off_trajectory_overlap: 8.0,
            max_off_trajectory_overlap_putting: 23.0,
            max_radius_change_pct: 10.0,
            max_radius_change_pct_putting: 10.0,
            max_overlapped_radius_change_ratio: 1.3,
            max_radius_diff_from_best_pct: 20.0,
            min_launch_angle_deg: -5.0,
            max_launch_angle_deg: 45.0,
            min_putting_launch_angle_deg: -10.0,
            max_putting_launch_angle_deg: 10.0,
            unlikely_angle_min_distance_px: 40.0,
            max_balls_to_retain: 18,
            lost_pulse_penalty_pct: 70.0,
            edge_backoff_px: 200,
            weight_rgb_darker: 5.0,
            weight_rgb_lighter: 10.0,
            weight_std_darker: 3.0,
            weight_std_lighter: 2.0
        }
    }
}

// ---------------------------------------------------------------------------- spin analysis

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SpinConfig {
    pub coarse_x_start: i32,
    pub coarse_x_end: i32,
    pub coarse_x_increment: i32,
    pub coarse_y_start: i32,
    pub coarse_y_end: i32,
    pub coarse_y_increment: i32,
    pub coarse_z_start: i32,
    pub coarse_z_end: i32,
    pub coarse_z_increment: i32,
    pub gabor_min_white_pct: u32,
    pub gabor_max_white_pct: u32,
    /// Penalty shaping for candidates that examined far fewer pixels than the best.
    pub low_count_weighting: f64,
    pub low_count_power: f64,
    pub low_count_scaling: f64,
    /// Skip the (lengthy) spin computation entirely.
    pub skip_spin: bool,
    /// Run the rotation grid on a single thread; results are identical.
    pub serialize_for_debug: bool
}

impl Default for SpinConfig {
    fn default() -> SpinConfig {
        SpinConfig{
            coarse_x_start: -42,
            coarse_x_end: 42,
            coarse_x_increment: 6,
            coarse_y_start: -30,
            coarse_y_end: 30,
            coarse_y_increment: 5,
            coarse_z_start: -50,
            coarse_z_end: 60,
            coarse_z_increment: 6,
            gabor_min_white_pct: 38,
            gabor_max_white_pct: 44,
            low_count_weighting: 500.0,
            low_count_power: 2.0,
            low_count_scaling: 1000.0,
            skip_spin: false,
            serialize_for_debug: false
        }
    }
}

// ---------------------------------------------------------------------------- cameras

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub focal_length_mm: f64,
    pub sensor_width_mm: f64,
    pub sensor_height_mm: f64,
    pub resolution_x: u32,
    pub resolution_y: u32,
    /// Camera position relative to the expected ball rest position (meters).
    pub position_from_origin: [f64; 3],
    /// Pan (x) and tilt (y) in degrees.
    pub angles_deg: [f64; 2],
    pub x_offset_for_tilt: f64,
    pub y_offset_for_tilt: f64,
    pub calibration_distance_m: f64,
    /// Image point where the teed ball is expected; the detector searches around it.
    pub expected_ball_center: [i32; 2]
}

impl Default for CameraConfig {
    fn default() -> CameraConfig {
        CameraConfig{
            focal_length_mm: 6.0,
            sensor_width_mm: 6.45,
            sensor_height_mm: 4.83,
            resolution_x: 1456,
            resolution_y: 1088,
            position_from_origin: [0.0, 0.0, 0.5],
            angles_deg: [0.0, 0.0],
            x_offset_for_tilt: 0.0,
            y_offset_for_tilt: 0.0,
            calibration_distance_m: 0.5,
            expected_ball_center: [728, 544]
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CamerasConfig {
    pub cam1: CameraConfig,
    pub cam2: CameraConfig,
    /// Offset of camera 2 from camera 1 (meters), added when two balls come from different cameras.
    pub cam2_offset_from_cam1: [f64; 3],
    /// The sensor needs one extra short pulse after the real trigger to push the frame out.
    pub requires_flush_pulse: bool,
    pub pause_before_flush_ms: u64,
    /// Request a pre-image from camera 2 before the shot and wait for it.
    pub use_pre_image: bool
}

impl Default for CamerasConfig {
    fn default() -> CamerasConfig {
        CamerasConfig{
            cam1: CameraConfig::default(),
            cam2: CameraConfig{
                position_from_origin: [0.0, 0.13, 0.5],
                angles_deg: [0.0, -12.0],
                ..CameraConfig::default()
            },
            cam2_offset_from_cam1: [0.0, 0.13, 0.0],
            requires_flush_pulse: true,
            pause_before_flush_ms: 10,
            use_pre_image: false
        }
    }
}

// ---------------------------------------------------------------------------- ipc & simulators

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub cam2_image_timeout_ms: u64,
    pub ball_stabilization_time_ms: u64,
    pub event_loop_pause_ms: u64,
    /// Settle time between arming camera 2 and watching for the hit.
    pub pre_hit_settle_ms: u64
}

impl Default for IpcConfig {
    fn default() -> IpcConfig {
        IpcConfig{
            cam2_image_timeout_ms: 4000,
            ball_stabilization_time_ms: 1000,
            event_loop_pause_ms: 5000,
            pre_hit_settle_ms: 1000
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SimulatorsConfig {
    pub e6_host_address: String,
    pub e6_port: u16,
    pub gspro_host_address: String,
    pub gspro_port: u16,
    pub shot_log_path: String
}

impl Default for SimulatorsConfig {
    fn default() -> SimulatorsConfig {
        SimulatorsConfig{
            e6_host_address: String::new(),
            e6_port: 2483,
            gspro_host_address: String::new(),
            gspro_port: 921,
            shot_log_path: "shot_log.csv".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_basic_invariants() {
        let config = Configuration::default();

        assert!(config.strobing.pulse_vector_driver.len() >= 3);
        assert!(config.strobing.pulse_vector_putter.len() >= 3);
        assert!(config.strobing.on_pulse_bits_fast >= 3 && config.strobing.on_pulse_bits_fast <= 8);
        assert!(config.ball_identification.strobed.min_param2 < config.ball_identification.strobed.max_param2);
        assert!(config.spin_analysis.gabor_min_white_pct < config.spin_analysis.gabor_max_white_pct);
        assert!(config.cameras.cam1.calibration_distance_m > 0.0);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let json = r#"{ "ipc": { "cam2_image_timeout_ms": 2500 } }"#;
        let config: Configuration = serde_json::from_str(json).unwrap();

        assert_eq!(config.ipc.cam2_image_timeout_ms, 2500);
        // untouched sections keep their defaults
        assert_eq!(config.ipc.ball_stabilization_time_ms, 1000);
        assert_eq!(config.ball_exposure_selection.max_balls_to_retain, 18);
    }

    #[test]
    fn driver_pulse_vector_grows_roughly_geometrically() {
        let strobing = StrobingConfig::default();
        for pair in strobing.pulse_vector_driver.windows(2) {
            let ratio = pair[1] / pair[0];
            assert!(ratio > 1.0 && ratio < 1.6, "unexpected ratio {}", ratio);
        }
    }
}
