//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Ball detection: finds circular ball images in a frame under the different imaging
//! regimes (placed/still, strobed, externally-strobed, putting).
//!

pub mod motion;

use crate::ball::Ball;
use crate::config::{BestCircleParams, DetectionConfig, HoughParams, NarrowingParams};
use crate::imgproc::{
    self, Circle, ColorTriplet, Rect,
    edges::{canny, suppress_lines},
    hough::{collapse_concentric, hough_circles, HoughCircleParams, HoughMode}
};
use cgmath::{Vector2, Zero};
use image::{GrayImage, RgbImage};

#[derive(Clone, Copy, Debug, PartialEq, strum_macros::Display, strum_macros::EnumIter)]
pub enum SearchMode {
    PlacedBall,
    Strobed,
    ExternalStrobe,
    Putting
}

#[derive(Debug)]
pub enum DetectionError {
    EmptyImage,
    /// No plausible ball circle anywhere in the (masked) search region.
    NoBallFound{ search_center: Vector2<i32>, search_radius: i32 }
}

const MIN_DIST_FACTOR_PLACED: f64 = 0.5;
const MIN_DIST_FACTOR_STROBED: f64 = 0.18;
const MIN_DIST_FACTOR_EXTERNAL: f64 = 0.4;
const MIN_DIST_FACTOR_NARROWING: f64 = 0.7;

/// Extra colour distance allowed past the best candidate when pruning by colour in
/// strobed mode.
const CANDIDATE_BALL_COLOR_TOLERANCE: f64 = 60.0;

/// Rank-cubed weight of the colour-difference score; late Hough ranks pay dearly.
fn color_difference_score(avg_diff: f64, std_diff: f64, rank: usize) -> f64 {
    avg_diff.powi(2) + 20.0 * std_diff.powi(2) + 200.0 * (10.0 * rank as f64).powi(3)
}

pub struct BallDetector<'a> {
    config: &'a DetectionConfig,
    /// Radius search band; `None` leaves the resolution-scaled defaults in force.
    pub min_ball_radius: Option<u32>,
    pub max_ball_radius: Option<u32>
}

struct CircleCandidate {
    circle: Circle,
    color_difference: f64,
    average: ColorTriplet,
    median: ColorTriplet,
    std_dev: ColorTriplet
}

impl<'a> BallDetector<'a> {
    pub fn new(config: &'a DetectionConfig) -> BallDetector<'a> {
        BallDetector{ config, min_ball_radius: None, max_ball_radius: None }
    }

    fn regime_params(&self, mode: SearchMode) -> &HoughParams {
        match mode {
            SearchMode::PlacedBall => &self.config.placed,
            SearchMode::Strobed => &self.config.strobed,
            SearchMode::ExternalStrobe => &self.config.external_strobe,
            SearchMode::Putting => &self.config.putting
        }
    }

    /// Regime-specific edge preparation: blur, Canny, post-Canny blur, and (for the
    /// externally-strobed regime) golf-shaft line suppression.
    fn prepare_search_image(&self, gray: &GrayImage, mode: SearchMode) -> GrayImage {
        let params = self.regime_params(mode);

        let pre_blurred = match mode {
            SearchMode::Putting => imgproc::median_blur(gray, params.pre_canny_blur),
            _ => imgproc::gaussian_blur(gray, params.pre_canny_blur)
        };

        let mut edge_image = canny(&pre_blurred, params.canny_lower, params.canny_upper);

        if mode == SearchMode::ExternalStrobe {
            let removed = suppress_lines(
                &mut edge_image,
                self.config.external_min_line_length,
                self.config.external_max_line_gap,
                self.config.external_line_angle_lower_deg,
                self.config.external_line_angle_upper_deg
            );
            if removed > 0 {
                log::trace!("suppressed {} shaft-like line segments", removed);
            }
        }

        imgproc::gaussian_blur(&edge_image, params.pre_hough_blur)
    }

    fn default_radius_band(&self, image_height: u32) -> (u32, u32) {
        let min = self.min_ball_radius.unwrap_or(image_height / 15).max(2);
        let max = self.max_ball_radius.unwrap_or(image_height / 6).max(min + 2);
        (min, max)
    }

    fn narrowing_params(&self, mode: SearchMode) -> Option<&NarrowingParams> {
        match mode {
            SearchMode::PlacedBall => Some(&self.config.placed_narrowing),
            SearchMode::Strobed | SearchMode::ExternalStrobe => Some(&self.config.strobed_narrowing),
            SearchMode::Putting => None
        }
    }

    /// Preliminary broad-band pass: averages the radii of the top detections and
    /// narrows the search band around them. Concentric duplicates of the alt-mode
    /// transform are collapsed first, keeping the larger circle.
    fn narrow_radius_band(
        &self,
        search_image: &GrayImage,
        mode: SearchMode,
        min_radius: u32,
        max_radius: u32
    ) -> Option<(u32, u32)> {
        let narrowing = match self.narrowing_params(mode) {
            Some(n) if n.enabled => n,
            _ => return None
        };

        let (min_radius, max_radius) = if mode == SearchMode::ExternalStrobe {
            // the foreign-strobe test rig has a known, fixed geometry
            (min_radius, max_radius)
        } else {
            (round_even(min_radius), round_even(max_radius).max(round_even(min_radius) + 2))
        };

        let params = HoughCircleParams{
            mode: HoughMode::GradientAlt,
            dp: narrowing.dp,
            min_dist: min_radius as f64 * MIN_DIST_FACTOR_NARROWING,
            param1: narrowing.param1,
            // the narrowing pass interprets its own param2 as a vote threshold when
            // large, a support fraction when <= 1
            param2: if narrowing.param2 <= 1.0 { narrowing.param2 } else { 0.4 },
            min_radius,
            max_radius
        };

        log::trace!(
            "narrowing pass: dp = {}, radius band {}..{}",
            params.dp, params.min_radius, params.max_radius
        );

        let mut circles = hough_circles(search_image, &params);
        collapse_concentric(&mut circles);

        if circles.is_empty() {
            return None;
        }

        let count = narrowing.radii_to_average.min(circles.len());
        let average: f64 = circles[..count].iter().map(|c| c.radius as f64).sum::<f64>() / count as f64;

        let narrowed_min = round_even((average * narrowing.min_ratio) as u32);
        let narrowed_max = round_even((average * narrowing.max_ratio) as u32).max(narrowed_min + 2);

        log::trace!("dynamically narrowed search radii to {}..{} px", narrowed_min, narrowed_max);
        Some((narrowed_min, narrowed_max))
    }

    /// The adaptive Hough loop: starts at the regime's midpoint `param2`, tightens
    /// while too many circles come back, loosens while too few, and keeps the last
    /// non-empty result when the final step overshoots.
    fn adaptive_hough(
        &self,
        search_image: &GrayImage,
        mode: SearchMode,
        min_radius: u32,
        max_radius: u32,
        min_dist: f64
    ) -> Vec<Circle> {
        let regime = self.regime_params(mode);
        let hough_mode = if regime.max_param2 <= 1.0 { HoughMode::GradientAlt } else { HoughMode::Gradient };

        let mut current_param2 = regime.starting_param2;
        let mut kept: Vec<Circle> = vec![];
        let mut prior_count = 0usize;
        let mut loosening = false;

        // the monotonic walk terminates within the parameter span; the cap is a guard
        let max_iterations =
            ((regime.max_param2 - regime.min_param2) / regime.param2_increment).ceil() as usize + 2;

        for _ in 0..max_iterations {
            let params = HoughCircleParams{
                mode: hough_mode,
                dp: regime.dp,
                min_dist,
                param1: regime.param1,
                param2: current_param2,
                min_radius: round_even(min_radius),
                max_radius: round_even(max_radius).max(round_even(min_radius) + 2)
            };

            log::trace!(
                "hough pass: dp = {}, min_dist = {:.1}, param2 = {:.3}, radii {}..{}",
                params.dp, params.min_dist, params.param2, params.min_radius, params.max_radius
            );

            let mut test_circles = hough_circles(search_image, &params);
            if hough_mode == HoughMode::GradientAlt {
                collapse_concentric(&mut test_circles);
            }

            let count = test_circles.len();
            log::trace!("hough found {} circles", count);

            if count >= regime.min_circles && count <= regime.max_circles {
                return test_circles;
            }

            if count > regime.max_circles {
                if prior_count == 0 && (current_param2 - regime.starting_param2).abs() > 1.0e-9 {
                    // broadened from nothing straight past the band; as good as it gets
                    return test_circles;
                }
                if current_param2 >= regime.max_param2 {
                    // tightened as far as allowed and still too many; sort out later
                    return test_circles;
                }
                kept = test_circles;
                prior_count = count;
                current_param2 += regime.param2_increment;
                loosening = false;
            } else {
                // too few (possibly zero)
                if count == 0 && prior_count == 0 {
                    if current_param2 <= regime.min_param2 {
                        return kept;
                    }
                    current_param2 -= regime.param2_increment;
                    loosening = true;
                } else if (count > 0 && count < regime.min_circles && prior_count == 0) || loosening {
                    if current_param2 <= regime.min_param2 {
                        return test_circles;
                    }
                    kept = test_circles;
                    prior_count = count;
                    current_param2 -= regime.param2_increment;
                    loosening = true;
                } else {
                    // had circles before, overshot into nothing: return the prior set
                    return kept;
                }
            }
        }

        kept
    }

    /// Finds candidate balls in `image`, ranked most-plausible first.
    ///
    /// `reference` supplies the expected colour (zero = unknown) and calibration data;
    /// `roi`, when non-empty, limits the search and the returned circles are mapped
    /// back to full-image coordinates.
    pub fn find_balls(
        &self,
        image: &RgbImage,
        reference: &Ball,
        roi: Rect,
        mode: SearchMode
    ) -> Result<Vec<Ball>, DetectionError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(DetectionError::EmptyImage);
        }

        log::trace!("find_balls: mode = {}, roi = {:?}", mode, roi);

        let expected_color_exists = reference.average_color != ColorTriplet::zero();

        let mut gray = imgproc::to_gray(image);

        // under-mask if anything: only discard what is clearly not the ball
        if self.config.use_color_mask && expected_color_exists {
            let hsv = imgproc::rgb_to_hsv(image::Rgb([
                reference.average_color.x.round().clamp(0.0, 255.0) as u8,
                reference.average_color.y.round().clamp(0.0, 255.0) as u8,
                reference.average_color.z.round().clamp(0.0, 255.0) as u8
            ]));
            let w = self.config.color_mask_widening;
            let mask = imgproc::hsv_range_mask(
                image,
                [hsv[0] - w, hsv[1] - w, hsv[2] - w],
                [hsv[0] + w, hsv[1] + w, hsv[2] + w]
            );
            gray = imgproc::apply_mask(&gray, &mask);
        }

        let search_image = self.prepare_search_image(&gray, mode);

        let (cropped, offset) = if roi.is_empty() {
            (search_image, (0, 0))
        } else {
            imgproc::sub_image(&search_image, roi)
        };

        let (mut min_radius, mut max_radius) = self.default_radius_band(image.height());
        if let Some((narrowed_min, narrowed_max)) =
            self.narrow_radius_band(&cropped, mode, min_radius, max_radius)
        {
            min_radius = narrowed_min;
            max_radius = narrowed_max;
        }

        let min_dist_factor = match mode {
            SearchMode::PlacedBall | SearchMode::Putting => MIN_DIST_FACTOR_PLACED,
            SearchMode::Strobed => MIN_DIST_FACTOR_STROBED,
            SearchMode::ExternalStrobe => MIN_DIST_FACTOR_EXTERNAL
        };

        let mut circles = self.adaptive_hough(
            &cropped, mode, min_radius, max_radius,
            (min_radius as f64 * min_dist_factor).max(1.0)
        );

        // back to full-image coordinates
        for circle in &mut circles {
            circle.x += offset.0 as f32;
            circle.y += offset.1 as f32;
        }

        if circles.is_empty() {
            return Err(self.no_ball_error(reference, &roi));
        }

        // score the candidates; colour only matters when there is something to compare to
        let score_colors = expected_color_exists || mode == SearchMode::Putting;
        let mut candidates: Vec<CircleCandidate> = vec![];
        for (rank, circle) in circles.iter().enumerate() {
            if circle.radius < self.config.min_candidate_radius as f32 {
                log::trace!("skipping too-small circle of radius {}", circle.radius);
                continue;
            }

            let mut candidate = CircleCandidate{
                circle: *circle,
                color_difference: 0.0,
                average: ColorTriplet::zero(),
                median: ColorTriplet::zero(),
                std_dev: ColorTriplet::zero()
            };

            if score_colors {
                let stats = imgproc::color_stats_in_circle(image, circle);
                let avg_diff = imgproc::color_distance(&stats.average, &reference.average_color);
                let std_diff = imgproc::color_distance(&stats.std_dev, &reference.std_color);
                candidate.color_difference = color_difference_score(avg_diff, std_diff, rank);
                candidate.average = stats.average;
                candidate.median = stats.median;
                candidate.std_dev = stats.std_dev;
            }

            candidates.push(candidate);
        }

        if candidates.is_empty() {
            return Err(self.no_ball_error(reference, &roi));
        }

        // strobed mode defers colour scoring to the exposure selector; other modes with
        // a known colour rank by colour likeness
        if mode != SearchMode::Strobed && score_colors {
            candidates.sort_by(|a, b| {
                a.color_difference.partial_cmp(&b.color_difference).unwrap_or(std::cmp::Ordering::Equal)
            });
        } else if mode == SearchMode::Strobed && expected_color_exists {
            let max_difference = candidates[0].color_difference + CANDIDATE_BALL_COLOR_TOLERANCE;
            candidates.retain(|c| c.color_difference <= max_difference);
            candidates.sort_by(|a, b| {
                b.circle.radius.partial_cmp(&a.circle.radius).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        if self.config.use_largest_ball && mode == SearchMode::PlacedBall {
            // a poorer-matching larger candidate wins over a smaller better-scored one
            candidates.sort_by(|a, b| {
                b.circle.radius.partial_cmp(&a.circle.radius).unwrap_or(std::cmp::Ordering::Equal)
            });
        }

        let gray_for_refinement = if self.config.best_circle.enabled { Some(&gray) } else { None };

        let mut balls: Vec<Ball> = vec![];
        for (rank, candidate) in candidates.iter().enumerate() {
            let mut ball = Ball::from_circle(candidate.circle);
            ball.quality_rank = rank as u32;
            ball.average_color = candidate.average;
            ball.median_color = candidate.median;
            ball.std_color = candidate.std_dev;
            if let Some(calibration) = reference.calibration {
                ball.calibration = Some(calibration);
            }

            if let Some(gray) = gray_for_refinement {
                if let Some(better) = determine_best_circle(
                    gray, &ball, &self.config.best_circle, self.config.best_circle.choose_largest
                ) {
                    ball.circle = better;
                }
            }

            balls.push(ball);
        }

        if balls[0].circle.radius < 0.001 {
            return Err(self.no_ball_error(reference, &roi));
        }

        Ok(balls)
    }

    fn no_ball_error(&self, reference: &Ball, roi: &Rect) -> DetectionError {
        let (center, radius) = match reference.search_area {
            Some((center, radius)) => (center, radius),
            None if !roi.is_empty() => (
                Vector2::new(roi.x + roi.width as i32 / 2, roi.y + roi.height as i32 / 2),
                (roi.width.max(roi.height) / 2) as i32
            ),
            None => (Vector2::new(0, 0), 0)
        };
        DetectionError::NoBallFound{ search_center: center, search_radius: radius }
    }
}

fn round_even(value: u32) -> u32 {
    // odd search radii were yielding poor circle fits
    if value % 2 == 1 { value + 1 } else { value }
}

/// Iterative refinement of a single candidate: crop a 1.5x-radius window, re-run edge
/// extraction and a tightly-banded Hough pass, and take either the best-scored or the
/// largest sub-candidate.
pub fn determine_best_circle(
    gray: &GrayImage,
    reference_ball: &Ball,
    params: &BestCircleParams,
    choose_largest: bool
) -> Option<Circle> {
    let radius = reference_ball.radius();
    if radius < 1.0 { return None; }

    let window = (radius * 1.5).ceil() as i32;
    let area = Rect::new(
        reference_ball.x() as i32 - window,
        reference_ball.y() as i32 - window,
        (2 * window) as u32,
        (2 * window) as u32
    );
    let (cropped, offset) = imgproc::sub_image(gray, area);

    let blurred = imgproc::gaussian_blur(&cropped, params.pre_canny_blur);
    let edges = canny(&blurred, params.canny_lower, params.canny_upper);
    let prepared = imgproc::gaussian_blur(&edges, params.pre_hough_blur);

    let min_radius = (radius * params.min_radius_ratio).floor() as u32;
    let max_radius = (radius * params.max_radius_ratio).ceil() as u32;

    let hough_params = HoughCircleParams{
        mode: if params.param2 <= 1.0 { HoughMode::GradientAlt } else { HoughMode::Gradient },
        dp: params.dp,
        min_dist: radius,
        param1: params.param1,
        param2: params.param2,
        min_radius: min_radius.max(2),
        max_radius: max_radius.max(min_radius + 2)
    };

    let mut circles = hough_circles(&prepared, &hough_params);
    if circles.is_empty() { return None; }

    if choose_largest {
        circles.sort_by(|a, b| b.radius.partial_cmp(&a.radius).unwrap_or(std::cmp::Ordering::Equal));
    }

    let mut best = circles[0];
    best.x += offset.0 as f32;
    best.y += offset.1 as f32;
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Renders filled balls (bright on dark) into an RGB image.
    pub fn render_scene(width: u32, height: u32, balls: &[(f32, f32, f32)]) -> RgbImage {
        let mut image = RgbImage::from_pixel(width, height, Rgb([12, 12, 16]));
        for &(cx, cy, r) in balls {
            let r_i = r.ceil() as i32;
            for dy in -r_i..=r_i {
                for dx in -r_i..=r_i {
                    let x = cx as i32 + dx;
                    let y = cy as i32 + dy;
                    if x < 0 || y < 0 || x >= width as i32 || y >= height as i32 { continue; }
                    let dist_sq = (dx * dx + dy * dy) as f32;
                    if dist_sq <= r * r {
                        // slight radial shading so the ball has interior texture
                        let shade = 230.0 - 30.0 * (dist_sq.sqrt() / r);
                        image.put_pixel(x as u32, y as u32, Rgb([shade as u8, shade as u8, shade as u8]));
                    }
                }
            }
        }
        image
    }

    #[test]
    fn placed_ball_is_found_near_truth() {
        let image = render_scene(400, 300, &[(200.0, 150.0, 50.0)]);
        let config = DetectionConfig::default();
        let detector = BallDetector::new(&config);

        let balls = detector
            .find_balls(&image, &Ball::default(), Rect::default(), SearchMode::PlacedBall)
            .unwrap();

        assert!(!balls.is_empty());
        let best = &balls[0];
        assert!((best.x() - 200.0).abs() <= 2.0, "x = {}", best.x());
        assert!((best.y() - 150.0).abs() <= 2.0, "y = {}", best.y());
        assert!((best.radius() - 50.0).abs() <= 3.0, "radius = {}", best.radius());
        assert_eq!(best.quality_rank, 0);
    }

    #[test]
    fn strobed_scene_yields_multiple_candidates() {
        let exposures: Vec<(f32, f32, f32)> = (0..5)
            .map(|i| (80.0 + i as f32 * 150.0, 200.0 - i as f32 * 12.0, 40.0))
            .collect();
        let image = render_scene(800, 400, &exposures);

        let config = DetectionConfig::default();
        let mut detector = BallDetector::new(&config);
        detector.min_ball_radius = Some(28);
        detector.max_ball_radius = Some(52);

        let balls = detector
            .find_balls(&image, &Ball::default(), Rect::default(), SearchMode::Strobed)
            .unwrap();

        assert!(balls.len() >= 4, "found only {} candidates", balls.len());
        for truth in &exposures {
            let hit = balls.iter().any(|b|
                (b.x() - truth.0 as f64).abs() <= 4.0 && (b.y() - truth.1 as f64).abs() <= 4.0
            );
            assert!(hit, "no candidate near ({}, {})", truth.0, truth.1);
        }
    }

    #[test]
    fn roi_restricts_search_and_offsets_results() {
        let image = render_scene(600, 300, &[(100.0, 150.0, 40.0), (450.0, 150.0, 40.0)]);
        let config = DetectionConfig::default();
        let mut detector = BallDetector::new(&config);
        detector.min_ball_radius = Some(28);
        detector.max_ball_radius = Some(52);

        let roi = Rect::new(300, 0, 300, 300);
        let balls = detector
            .find_balls(&image, &Ball::default(), roi, SearchMode::PlacedBall)
            .unwrap();

        // only the right-hand ball is inside the ROI, and its coordinates are global
        assert!(balls.iter().all(|b| b.x() > 300.0));
        assert!(balls.iter().any(|b| (b.x() - 450.0).abs() <= 3.0));
    }

    #[test]
    fn empty_scene_reports_no_ball() {
        let image = render_scene(300, 200, &[]);
        let config = DetectionConfig::default();
        let detector = BallDetector::new(&config);

        match detector.find_balls(&image, &Ball::default(), Rect::default(), SearchMode::PlacedBall) {
            Err(DetectionError::NoBallFound{ .. }) => (),
            other => panic!("expected NoBallFound, got {:?}", other.map(|b| b.len()))
        }
    }

    #[test]
    fn adaptive_loop_iteration_bound() {
        // with min_circles == max_circles == 1 the loop must terminate within the
        // parameter span regardless of what the transform returns
        let mut config = DetectionConfig::default();
        config.placed.min_circles = 1;
        config.placed.max_circles = 1;

        let image = render_scene(300, 200, &[(150.0, 100.0, 40.0), (60.0, 100.0, 38.0)]);
        let detector = BallDetector::new(&config);

        // must return (not hang), whatever the count
        let _ = detector.find_balls(&image, &Ball::default(), Rect::default(), SearchMode::PlacedBall);
    }

    #[test]
    fn every_regime_produces_an_edge_image() {
        use strum::IntoEnumIterator;

        let image = render_scene(120, 90, &[(60.0, 45.0, 20.0)]);
        let gray = imgproc::to_gray(&image);
        let config = DetectionConfig::default();
        let detector = BallDetector::new(&config);

        for mode in SearchMode::iter() {
            let prepared = detector.prepare_search_image(&gray, mode);
            assert_eq!(prepared.dimensions(), gray.dimensions(), "mode {}", mode);
        }
    }

    #[test]
    fn mask_widening_is_additive() {
        // a colour 8 hue-units away from the reference must survive a widening of 10
        // (additive) but would not survive a multiplicative widening of ~5%
        let ball_color = Rgb([200u8, 200, 120]);
        let mut image = RgbImage::from_pixel(64, 64, Rgb([5, 5, 5]));
        for y in 20..44 {
            for x in 20..44 {
                image.put_pixel(x, y, ball_color);
            }
        }

        let hsv = imgproc::rgb_to_hsv(ball_color);
        let w = DetectionConfig::default().color_mask_widening;
        assert!(w >= 8.0);

        let mask = imgproc::hsv_range_mask(
            &image,
            [hsv[0] - w + 8.0, hsv[1] - w, hsv[2] - w],
            [hsv[0] + w - 8.0, hsv[1] + w, hsv[2] + w]
        );
        assert!(mask.get_pixel(32, 32)[0] != 0);
    }

    #[test]
    fn largest_ball_strategy_prefers_bigger_candidate() {
        let image = render_scene(500, 250, &[(120.0, 125.0, 30.0), (350.0, 125.0, 48.0)]);

        let mut config = DetectionConfig::default();
        config.use_largest_ball = true;
        {
            let mut detector = BallDetector::new(&config);
            detector.min_ball_radius = Some(20);
            detector.max_ball_radius = Some(60);

            if let Ok(balls) = detector.find_balls(&image, &Ball::default(), Rect::default(), SearchMode::PlacedBall) {
                if balls.len() >= 2 {
                    assert!(balls[0].radius() >= balls[1].radius());
                }
            }
        }

        config.use_largest_ball = false;
        // quality order need not put the largest first; just verify both strategies run
        let mut detector = BallDetector::new(&config);
        detector.min_ball_radius = Some(20);
        detector.max_ball_radius = Some(60);
        let _ = detector.find_balls(&image, &Ball::default(), Rect::default(), SearchMode::PlacedBall);
    }
}
