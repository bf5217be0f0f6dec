//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Gradient-based Hough circle transform.
//!
//! The input is an (already blurred) edge image; gradient directions come from a Sobel
//! pass over it. Centers are voted along the gradient rays, radii estimated from the
//! edge-distance histogram of each center.
//!

use super::Circle;
use super::edges::sobel;
use image::GrayImage;

/// Interpretation of `param2`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HoughMode {
    /// `param2` is an absolute accumulator-vote threshold.
    Gradient,
    /// `param2` is the required arc-support fraction in (0, 1] ("circle perfectness").
    GradientAlt
}

#[derive(Clone, Copy, Debug)]
pub struct HoughCircleParams {
    pub mode: HoughMode,
    /// Accumulator downscaling, (0, 2].
    pub dp: f64,
    pub min_dist: f64,
    /// Edge-strength gate; pixels with a weaker gradient magnitude do not vote.
    pub param1: f64,
    pub param2: f64,
    pub min_radius: u32,
    pub max_radius: u32
}

struct EdgePoint {
    x: f32,
    y: f32,
    dir_x: f32,
    dir_y: f32
}

/// Detected circles ordered best first; the vector index is the quality rank.
pub fn hough_circles(image: &GrayImage, params: &HoughCircleParams) -> Vec<Circle> {
    let (width, height) = image.dimensions();
    if width < 8 || height < 8 || params.min_radius == 0 || params.max_radius <= params.min_radius {
        return vec![];
    }

    let field = sobel(image);
    let edge_gate = (params.param1 / 2.0).max(16.0) as f32;

    let mut edge_points = vec![];
    for y in 0..height {
        for x in 0..width {
            let idx = field.index(x, y);
            let magnitude = field.magnitude[idx];
            if magnitude > edge_gate {
                edge_points.push(EdgePoint{
                    x: x as f32,
                    y: y as f32,
                    dir_x: field.dx[idx] / magnitude,
                    dir_y: field.dy[idx] / magnitude
                });
            }
        }
    }
    if edge_points.is_empty() { return vec![]; }

    // center voting along both gradient directions
    let dp = params.dp.clamp(1.0, 2.0);
    let acc_width = (width as f64 / dp).ceil() as usize;
    let acc_height = (height as f64 / dp).ceil() as usize;
    let mut accumulator = vec![0u32; acc_width * acc_height];

    for point in &edge_points {
        for sign in &[-1.0f32, 1.0f32] {
            let mut r = params.min_radius as f32;
            while r <= params.max_radius as f32 {
                let cx = point.x + sign * point.dir_x * r;
                let cy = point.y + sign * point.dir_y * r;
                if cx >= 0.0 && cy >= 0.0 && cx < width as f32 && cy < height as f32 {
                    let ax = (cx as f64 / dp) as usize;
                    let ay = (cy as f64 / dp) as usize;
                    accumulator[ay * acc_width + ax] += 1;
                }
                r += 1.0;
            }
        }
    }

    // local maxima above the vote gate, best first
    let vote_gate = match params.mode {
        HoughMode::Gradient => params.param2.max(1.0) as u32,
        // the Alt mode gates on arc support later; here just prune noise
        HoughMode::GradientAlt => (params.min_radius / 2).max(10)
    };

    let mut peaks: Vec<(usize, usize, u32)> = vec![];
    for ay in 1..acc_height.saturating_sub(1) {
        for ax in 1..acc_width.saturating_sub(1) {
            let votes = accumulator[ay * acc_width + ax];
            if votes < vote_gate { continue; }

            let mut is_max = true;
            'neighbours: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 { continue; }
                    let n = accumulator[(ay as i32 + dy) as usize * acc_width + (ax as i32 + dx) as usize];
                    if n > votes {
                        is_max = false;
                        break 'neighbours;
                    }
                }
            }
            if is_max {
                peaks.push((ax, ay, votes));
            }
        }
    }
    peaks.sort_by(|a, b| b.2.cmp(&a.2));

    // enforce the minimum center distance while walking down the peak list
    let min_dist_sq = params.min_dist.max(1.0).powi(2);
    let mut centers: Vec<(f64, f64, u32)> = vec![];
    for &(ax, ay, votes) in &peaks {
        let cx = (ax as f64 + 0.5) * dp;
        let cy = (ay as f64 + 0.5) * dp;
        if centers.iter().all(|&(ox, oy, _)| (cx - ox).powi(2) + (cy - oy).powi(2) >= min_dist_sq) {
            centers.push((cx, cy, votes));
        }
    }

    // radius estimation + support scoring per center
    let mut scored: Vec<(Circle, f64, u32)> = vec![];
    for &(cx, cy, votes) in &centers {
        let span = (params.max_radius - params.min_radius + 1) as usize;
        let mut histogram = vec![0u32; span];

        for point in &edge_points {
            let distance = ((point.x as f64 - cx).powi(2) + (point.y as f64 - cy).powi(2)).sqrt();
            let bin = distance.round() as i64 - params.min_radius as i64;
            if bin >= 0 && (bin as usize) < span {
                histogram[bin as usize] += 1;
            }
        }

        let (best_bin, _) = match histogram.iter().enumerate().max_by_key(|&(_, count)| count) {
            Some(best) => best,
            None => continue
        };

        let radius = (params.min_radius as usize + best_bin) as f64;
        // support over a +/-1 px annulus compared with the full circumference
        let mut supporting = histogram[best_bin];
        if best_bin > 0 { supporting += histogram[best_bin - 1]; }
        if best_bin + 1 < span { supporting += histogram[best_bin + 1]; }
        let support_fraction = supporting as f64 / (2.0 * std::f64::consts::PI * radius);

        let keep = match params.mode {
            HoughMode::Gradient => true,
            HoughMode::GradientAlt => support_fraction >= params.param2
        };
        if keep {
            scored.push((
                Circle::new(cx as f32, cy as f32, radius as f32),
                support_fraction.min(1.0),
                votes
            ));
        }
    }

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            .then(b.2.cmp(&a.2))
    });

    scored.into_iter().map(|(circle, _, _)| circle).collect()
}

/// The Alt mode occasionally reports concentric detections despite the minimum-distance
/// setting; collapse each concentric group to its largest member.
pub fn collapse_concentric(circles: &mut Vec<Circle>) {
    let mut i = 0;
    while i < circles.len() {
        let mut j = circles.len() - 1;
        while j > i {
            let same_center = circles[i].center_distance(&circles[j]) < 2.0;
            if same_center {
                if circles[j].radius <= circles[i].radius {
                    circles.remove(j);
                } else {
                    circles.remove(i);
                    // the element now at `i` is a different circle; restart its scan
                    j = circles.len() - 1;
                    continue;
                }
            }
            if j == 0 { break; }
            j -= 1;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgproc::gaussian_blur;
    use image::Luma;

    /// Renders circle outlines and blurs them a little, approximating a post-Canny image.
    fn edge_image_with_circles(width: u32, height: u32, circles: &[(f32, f32, f32)]) -> GrayImage {
        let mut image = GrayImage::new(width, height);
        for &(cx, cy, r) in circles {
            let steps = (2.0 * std::f64::consts::PI * r as f64).ceil() as u32 * 2;
            for i in 0..steps {
                let a = i as f64 / steps as f64 * 2.0 * std::f64::consts::PI;
                let x = (cx as f64 + r as f64 * a.cos()).round();
                let y = (cy as f64 + r as f64 * a.sin()).round();
                if x >= 0.0 && y >= 0.0 && x < width as f64 && y < height as f64 {
                    image.put_pixel(x as u32, y as u32, Luma([255]));
                }
            }
        }
        gaussian_blur(&image, 3)
    }

    fn default_params() -> HoughCircleParams {
        HoughCircleParams{
            mode: HoughMode::GradientAlt,
            dp: 1.5,
            min_dist: 20.0,
            param1: 100.0,
            param2: 0.3,
            min_radius: 10,
            max_radius: 40
        }
    }

    #[test]
    fn single_circle_is_found() {
        let image = edge_image_with_circles(128, 128, &[(64.0, 64.0, 25.0)]);
        let circles = hough_circles(&image, &default_params());

        assert!(!circles.is_empty());
        let best = &circles[0];
        assert!((best.x - 64.0).abs() <= 3.0, "center x = {}", best.x);
        assert!((best.y - 64.0).abs() <= 3.0, "center y = {}", best.y);
        assert!((best.radius - 25.0).abs() <= 3.0, "radius = {}", best.radius);
    }

    #[test]
    fn two_separated_circles_are_found() {
        let image = edge_image_with_circles(256, 128, &[(60.0, 64.0, 20.0), (190.0, 64.0, 22.0)]);
        let circles = hough_circles(&image, &default_params());

        assert!(circles.len() >= 2, "found {} circles", circles.len());
        let found_left = circles.iter().any(|c| (c.x - 60.0).abs() <= 4.0 && (c.y - 64.0).abs() <= 4.0);
        let found_right = circles.iter().any(|c| (c.x - 190.0).abs() <= 4.0 && (c.y - 64.0).abs() <= 4.0);
        assert!(found_left && found_right);
    }

    #[test]
    fn empty_image_yields_no_circles() {
        let image = GrayImage::new(64, 64);
        assert!(hough_circles(&image, &default_params()).is_empty());
    }

    #[test]
    fn concentric_detections_collapse_to_largest() {
        let mut circles = vec![
            Circle::new(50.0, 50.0, 20.0),
            Circle::new(50.5, 50.0, 24.0),
            Circle::new(100.0, 50.0, 18.0)
        ];
        collapse_concentric(&mut circles);

        assert_eq!(circles.len(), 2);
        assert!(circles.iter().any(|c| (c.radius - 24.0).abs() < 0.01));
        assert!(circles.iter().any(|c| (c.radius - 18.0).abs() < 0.01));
        assert!(!circles.iter().any(|c| (c.radius - 20.0).abs() < 0.01));
    }
}
