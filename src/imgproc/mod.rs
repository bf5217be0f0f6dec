//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Image primitives used by the detection pipeline.
//!

pub mod edges;
pub mod hough;

use cgmath::Vector3;
use image::{GrayImage, Luma, Rgb, RgbImage};

/// Colour triplet in RGB order, one value per channel.
pub type ColorTriplet = Vector3<f64>;

/// Hue in the half-degree convention (0..180), S and V in 0..255.
pub const HUE_MAX: f64 = 180.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Circle {
    pub x: f32,
    pub y: f32,
    pub radius: f32
}

impl Circle {
    pub fn new(x: f32, y: f32, radius: f32) -> Circle {
        Circle{ x, y, radius }
    }

    pub fn center_distance(&self, other: &Circle) -> f64 {
        ((self.x as f64 - other.x as f64).powi(2) + (self.y as f64 - other.y as f64).powi(2)).sqrt()
    }

    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        (x - self.x as f64).powi(2) + (y - self.y as f64).powi(2) <= (self.radius as f64).powi(2)
    }
}

/// Rarely used; kept for the few cases where an elliptical fit is clearly better.
///
/// Invariant: `width >= height`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipse {
    pub width: f32,
    pub height: f32,
    /// Rotation to the right from vertical, degrees.
    pub angle_deg: f32
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Rect {
        Rect{ x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns the intersection with an image of the given dimensions.
    pub fn clamped_to(&self, img_width: u32, img_height: u32) -> Rect {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = (self.x + self.width as i32).min(img_width as i32);
        let y1 = (self.y + self.height as i32).min(img_height as i32);

        if x1 <= x0 || y1 <= y0 {
            Rect::default()
        } else {
            Rect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32)
        }
    }
}

#[derive(Clone, Debug)]
pub struct ColorStats {
    pub average: ColorTriplet,
    pub median: ColorTriplet,
    pub std_dev: ColorTriplet
}

impl Default for ColorStats {
    fn default() -> ColorStats {
        ColorStats{
            average: ColorTriplet::new(0.0, 0.0, 0.0),
            median: ColorTriplet::new(0.0, 0.0, 0.0),
            std_dev: ColorTriplet::new(0.0, 0.0, 0.0)
        }
    }
}

pub fn to_gray(image: &RgbImage) -> GrayImage {
    let mut result = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let Rgb([r, g, b]) = *pixel;
        // ITU-R BT.601 luma
        let luma = 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
        result.put_pixel(x, y, Luma([num_traits::clamp(luma.round(), 0.0, 255.0) as u8]));
    }
    result
}

/// Converts an RGB pixel to HSV with H in 0..180 and S, V in 0..255.
pub fn rgb_to_hsv(pixel: Rgb<u8>) -> [f64; 3] {
    let r = pixel[0] as f64 / 255.0;
    let g = pixel[1] as f64 / 255.0;
    let b = pixel[2] as f64 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let hue_deg = if delta < 1.0e-9 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let hue_deg = if hue_deg < 0.0 { hue_deg + 360.0 } else { hue_deg };

    let saturation = if max < 1.0e-9 { 0.0 } else { delta / max };

    [hue_deg / 2.0, saturation * 255.0, max * 255.0]
}

fn in_range_mask(image: &RgbImage, lower: [f64; 3], upper: [f64; 3]) -> GrayImage {
    let mut mask = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let hsv = rgb_to_hsv(*pixel);
        let inside = (0..3).all(|i| hsv[i] >= lower[i] && hsv[i] <= upper[i]);
        mask.put_pixel(x, y, Luma([if inside { 255 } else { 0 }]));
    }
    mask
}

/// Builds a binary mask of pixels whose HSV value falls in `[lower, upper]`.
///
/// A hue bound below 0 or above 180 wraps around the red end of the scale; the result is
/// then the union of the two sub-range masks.
pub fn hsv_range_mask(image: &RgbImage, lower: [f64; 3], upper: [f64; 3]) -> GrayImage {
    let mut upper = upper;
    upper[1] = upper[1].min(255.0);
    upper[2] = upper[2].min(255.0);

    if lower[0] >= 0.0 && upper[0] <= HUE_MAX {
        return in_range_mask(image, lower, upper);
    }

    let (left_lower, left_upper, right_lower, right_upper) = if lower[0] < 0.0 {
        (
            [0.0, lower[1], lower[2]],
            upper,
            [HUE_MAX + lower[0], lower[1], lower[2]],
            [HUE_MAX, upper[1], upper[2]]
        )
    } else {
        (
            [0.0, lower[1], lower[2]],
            [upper[0] - HUE_MAX, upper[1], upper[2]],
            lower,
            [HUE_MAX, upper[1], upper[2]]
        )
    };

    let first = in_range_mask(image, left_lower, left_upper);
    let second = in_range_mask(image, right_lower, right_upper);

    let mut mask = first;
    for (x, y, pixel) in second.enumerate_pixels() {
        if pixel[0] != 0 { mask.put_pixel(x, y, Luma([255])); }
    }
    mask
}

pub fn apply_mask(image: &GrayImage, mask: &GrayImage) -> GrayImage {
    assert!(image.dimensions() == mask.dimensions());
    let mut result = image.clone();
    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel[0] == 0 { result.put_pixel(x, y, Luma([0])); }
    }
    result
}

fn gaussian_kernel(ksize: u32) -> Vec<f64> {
    let ksize = if ksize % 2 == 0 { ksize + 1 } else { ksize };
    // same sigma-from-kernel-size relation OpenCV uses
    let sigma = 0.3 * ((ksize as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = (ksize / 2) as i32;

    let mut kernel = Vec::with_capacity(ksize as usize);
    let mut sum = 0.0;
    for i in -half..=half {
        let v = (-(i as f64 * i as f64) / (2.0 * sigma * sigma)).exp();
        kernel.push(v);
        sum += v;
    }
    for v in &mut kernel { *v /= sum; }
    kernel
}

/// Gaussian blur with an OpenCV-style odd kernel size (even sizes are bumped up by one).
pub fn gaussian_blur(image: &GrayImage, ksize: u32) -> GrayImage {
    if ksize <= 1 { return image.clone(); }

    let kernel = gaussian_kernel(ksize);
    let half = (kernel.len() / 2) as i32;
    let (width, height) = image.dimensions();

    // horizontal pass
    let mut temp = vec![0.0f64; (width * height) as usize];
    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let mut accum = 0.0;
            for (i, k) in kernel.iter().enumerate() {
                let sx = (x + i as i32 - half).clamp(0, width as i32 - 1);
                accum += *k * image.get_pixel(sx as u32, y as u32)[0] as f64;
            }
            temp[(y as u32 * width + x as u32) as usize] = accum;
        }
    }

    // vertical pass
    let mut result = GrayImage::new(width, height);
    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let mut accum = 0.0;
            for (i, k) in kernel.iter().enumerate() {
                let sy = (y + i as i32 - half).clamp(0, height as i32 - 1);
                accum += *k * temp[(sy as u32 * width + x as u32) as usize];
            }
            result.put_pixel(x as u32, y as u32, Luma([num_traits::clamp(accum.round(), 0.0, 255.0) as u8]));
        }
    }
    result
}

pub fn median_blur(image: &GrayImage, ksize: u32) -> GrayImage {
    if ksize <= 1 { return image.clone(); }
    let ksize = if ksize % 2 == 0 { ksize + 1 } else { ksize };
    let half = (ksize / 2) as i32;
    let (width, height) = image.dimensions();

    let mut result = GrayImage::new(width, height);
    let mut window = Vec::with_capacity((ksize * ksize) as usize);
    for y in 0..height as i32 {
        for x in 0..width as i32 {
            window.clear();
            for dy in -half..=half {
                for dx in -half..=half {
                    let sx = (x + dx).clamp(0, width as i32 - 1);
                    let sy = (y + dy).clamp(0, height as i32 - 1);
                    window.push(image.get_pixel(sx as u32, sy as u32)[0]);
                }
            }
            window.sort_unstable();
            result.put_pixel(x as u32, y as u32, Luma([window[window.len() / 2]]));
        }
    }
    result
}

pub fn equalize_histogram(image: &GrayImage) -> GrayImage {
    let mut histogram = [0u32; 256];
    for pixel in image.pixels() {
        histogram[pixel[0] as usize] += 1;
    }

    let total = (image.width() * image.height()) as f64;
    let mut lut = [0u8; 256];
    let mut cumulative = 0u32;
    for (i, count) in histogram.iter().enumerate() {
        cumulative += count;
        lut[i] = (255.0 * cumulative as f64 / total).round().min(255.0) as u8;
    }

    let mut result = GrayImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        result.put_pixel(x, y, Luma([lut[pixel[0] as usize]]));
    }
    result
}

/// Returns the grayscale value below which `100 - top_percent` percent of the pixels fall,
/// together with the brightest populated value.
pub fn brightness_cutoff(image: &GrayImage, top_percent: u32) -> (u8, u8) {
    let mut histogram = [0u32; 256];
    for pixel in image.pixels() {
        histogram[pixel[0] as usize] += 1;
    }

    let total = (image.width() * image.height()) as u64;
    let target = total * top_percent as u64 / 100;

    let mut highest = 0u8;
    for i in (0..256).rev() {
        if histogram[i] > 0 { highest = i as u8; break; }
    }

    let mut accum = 0u64;
    let mut i = 255i32;
    while i >= 0 {
        accum += histogram[i as usize] as u64;
        if accum >= target { break; }
        i -= 1;
    }

    (i.max(0) as u8, highest)
}

fn ellipse_kernel(ksize: u32) -> Vec<(i32, i32)> {
    let ksize = if ksize % 2 == 0 { ksize + 1 } else { ksize };
    let half = (ksize / 2) as i32;
    let r = half as f64 + 0.5;

    let mut offsets = vec![];
    for dy in -half..=half {
        for dx in -half..=half {
            if ((dx * dx + dy * dy) as f64) <= r * r {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

pub fn dilate(image: &GrayImage, ksize: u32) -> GrayImage {
    let offsets = ellipse_kernel(ksize);
    let (width, height) = image.dimensions();
    let mut result = GrayImage::new(width, height);

    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let mut max = 0u8;
            for &(dx, dy) in &offsets {
                let sx = x + dx;
                let sy = y + dy;
                if sx >= 0 && sy >= 0 && sx < width as i32 && sy < height as i32 {
                    max = max.max(image.get_pixel(sx as u32, sy as u32)[0]);
                }
            }
            result.put_pixel(x as u32, y as u32, Luma([max]));
        }
    }
    result
}

pub fn erode(image: &GrayImage, ksize: u32) -> GrayImage {
    let offsets = ellipse_kernel(ksize);
    let (width, height) = image.dimensions();
    let mut result = GrayImage::new(width, height);

    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let mut min = 255u8;
            for &(dx, dy) in &offsets {
                let sx = x + dx;
                let sy = y + dy;
                if sx >= 0 && sy >= 0 && sx < width as i32 && sy < height as i32 {
                    min = min.min(image.get_pixel(sx as u32, sy as u32)[0]);
                }
            }
            result.put_pixel(x as u32, y as u32, Luma([min]));
        }
    }
    result
}

pub fn morph_close(image: &GrayImage, ksize: u32) -> GrayImage {
    erode(&dilate(image, ksize), ksize)
}

/// Extracts `area` (clamped to the image) as a new image; `offset_sub_to_full` maps
/// sub-image coordinates back to the full image.
pub fn sub_image(image: &GrayImage, area: Rect) -> (GrayImage, (i32, i32)) {
    let clamped = area.clamped_to(image.width(), image.height());
    if clamped.is_empty() {
        return (image.clone(), (0, 0));
    }

    let mut result = GrayImage::new(clamped.width, clamped.height);
    for y in 0..clamped.height {
        for x in 0..clamped.width {
            result.put_pixel(x, y, *image.get_pixel(clamped.x as u32 + x, clamped.y as u32 + y));
        }
    }
    (result, (clamped.x, clamped.y))
}

/// Average, median and standard deviation of the colour inside a circle, sampled over the
/// inscribed square for speed (matches what the candidate scoring expects).
pub fn color_stats_in_circle(image: &RgbImage, circle: &Circle) -> ColorStats {
    // inscribed square half-side
    let half = (circle.radius as f64 / std::f64::consts::SQRT_2).floor().max(1.0) as i32;
    let cx = circle.x.round() as i32;
    let cy = circle.y.round() as i32;

    let mut channels: [Vec<u8>; 3] = [vec![], vec![], vec![]];

    for dy in -half..=half {
        for dx in -half..=half {
            let x = cx + dx;
            let y = cy + dy;
            if x < 0 || y < 0 || x >= image.width() as i32 || y >= image.height() as i32 {
                continue;
            }
            let pixel = image.get_pixel(x as u32, y as u32);
            for i in 0..3 {
                channels[i].push(pixel[i]);
            }
        }
    }

    if channels[0].is_empty() {
        return ColorStats::default();
    }

    let mut stats = ColorStats::default();
    for i in 0..3 {
        let n = channels[i].len() as f64;
        let sum: f64 = channels[i].iter().map(|&v| v as f64).sum();
        let mean = sum / n;
        let variance: f64 = channels[i].iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;

        channels[i].sort_unstable();
        let median = channels[i][channels[i].len() / 2] as f64;

        stats.average[i] = mean;
        stats.median[i] = median;
        stats.std_dev[i] = variance.sqrt();
    }
    stats
}

pub fn color_distance(a: &ColorTriplet, b: &ColorTriplet) -> f64 {
    ((a.x - b.x).powi(2) + (a.y - b.y).powi(2) + (a.z - b.z).powi(2)).sqrt()
}

/// A colour is "darker" than another when its channel sum is smaller.
pub fn is_darker(a: &ColorTriplet, b: &ColorTriplet) -> bool {
    (a.x + a.y + a.z) < (b.x + b.y + b.z)
}

/// Fills everything outside `reduction_factor * radius` of the circle with `fill`.
pub fn mask_outside_circle(image: &GrayImage, circle: &Circle, reduction_factor: f32, fill: u8) -> GrayImage {
    let mask_radius = (circle.radius * reduction_factor) as f64;
    let mut result = image.clone();
    for (x, y, pixel) in result.enumerate_pixels_mut() {
        let dx = x as f64 - circle.x as f64;
        let dy = y as f64 - circle.y as f64;
        if dx * dx + dy * dy > mask_radius * mask_radius {
            *pixel = Luma([fill]);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_rgb(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(color))
    }

    #[test]
    fn hsv_of_primary_colors() {
        let red = rgb_to_hsv(Rgb([255, 0, 0]));
        assert!((red[0] - 0.0).abs() < 0.5 && red[1] > 250.0 && red[2] > 250.0);

        let green = rgb_to_hsv(Rgb([0, 255, 0]));
        assert!((green[0] - 60.0).abs() < 0.5);

        let blue = rgb_to_hsv(Rgb([0, 0, 255]));
        assert!((blue[0] - 120.0).abs() < 0.5);
    }

    #[test]
    fn wrapped_hue_mask_is_union_of_subranges() {
        // a red-ish image: hue near 0
        let image = uniform_rgb(8, 8, [250, 10, 20]);

        // negative lower bound must still catch hue ~0
        let wrapped = hsv_range_mask(&image, [-10.0, 50.0, 50.0], [10.0, 255.0, 255.0]);
        assert!(wrapped.pixels().all(|p| p[0] == 255));

        // the equivalent pair of plain ranges
        let left = hsv_range_mask(&image, [0.0, 50.0, 50.0], [10.0, 255.0, 255.0]);
        let right = hsv_range_mask(&image, [170.0, 50.0, 50.0], [180.0, 255.0, 255.0]);
        for ((w, l), r) in wrapped.pixels().zip(left.pixels()).zip(right.pixels()) {
            assert_eq!(w[0] != 0, l[0] != 0 || r[0] != 0);
        }
    }

    #[test]
    fn color_stats_of_uniform_circle() {
        let image = uniform_rgb(64, 64, [200, 180, 160]);
        let stats = color_stats_in_circle(&image, &Circle::new(32.0, 32.0, 10.0));

        assert!((stats.average.x - 200.0).abs() < 0.01);
        assert!((stats.median.y - 180.0).abs() < 0.01);
        assert!(stats.std_dev.z < 0.01);
    }

    #[test]
    fn brightness_cutoff_finds_top_percentile() {
        let mut image = GrayImage::from_pixel(10, 10, Luma([50]));
        // two out of a hundred pixels are bright
        image.put_pixel(0, 0, Luma([250]));
        image.put_pixel(1, 0, Luma([251]));

        let (cutoff, highest) = brightness_cutoff(&image, 2);
        assert!(cutoff >= 250 - 1);
        assert_eq!(highest, 251);
    }

    #[test]
    fn mask_outside_circle_leaves_interior() {
        let image = GrayImage::from_pixel(21, 21, Luma([100]));
        let masked = mask_outside_circle(&image, &Circle::new(10.0, 10.0, 8.0), 1.0, 7);

        assert_eq!(masked.get_pixel(10, 10)[0], 100);
        assert_eq!(masked.get_pixel(0, 0)[0], 7);
    }

    #[test]
    fn sub_image_reports_offset() {
        let mut image = GrayImage::new(30, 20);
        image.put_pixel(12, 7, Luma([99]));

        let (sub, offset) = sub_image(&image, Rect::new(10, 5, 10, 10));
        assert_eq!(offset, (10, 5));
        assert_eq!(sub.get_pixel(2, 2)[0], 99);
    }

    #[test]
    fn sub_image_clamps_out_of_bounds_area() {
        let image = GrayImage::new(30, 20);
        let (sub, offset) = sub_image(&image, Rect::new(-5, -5, 20, 50));
        assert_eq!(offset, (0, 0));
        assert_eq!(sub.dimensions(), (15, 20));
    }
}
