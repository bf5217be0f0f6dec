//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Edge detection: Sobel gradients, Canny, straight-line suppression.
//!

use image::{GrayImage, Luma};

/// Per-pixel Sobel gradients of a grayscale image.
pub struct GradientField {
    pub dx: Vec<f32>,
    pub dy: Vec<f32>,
    pub magnitude: Vec<f32>,
    pub width: u32,
    pub height: u32
}

impl GradientField {
    pub fn index(&self, x: u32, y: u32) -> usize {
        (y * self.width + x) as usize
    }
}

pub fn sobel(image: &GrayImage) -> GradientField {
    let (width, height) = image.dimensions();
    let mut field = GradientField{
        dx: vec![0.0; (width * height) as usize],
        dy: vec![0.0; (width * height) as usize],
        magnitude: vec![0.0; (width * height) as usize],
        width,
        height
    };

    if width < 3 || height < 3 { return field; }

    let pixel = |x: i32, y: i32| -> f32 {
        let cx = x.clamp(0, width as i32 - 1) as u32;
        let cy = y.clamp(0, height as i32 - 1) as u32;
        image.get_pixel(cx, cy)[0] as f32
    };

    for y in 0..height as i32 {
        for x in 0..width as i32 {
            let gx =
                -pixel(x - 1, y - 1) + pixel(x + 1, y - 1)
                - 2.0 * pixel(x - 1, y) + 2.0 * pixel(x + 1, y)
                - pixel(x - 1, y + 1) + pixel(x + 1, y + 1);
            let gy =
                -pixel(x - 1, y - 1) - 2.0 * pixel(x, y - 1) - pixel(x + 1, y - 1)
                + pixel(x - 1, y + 1) + 2.0 * pixel(x, y + 1) + pixel(x + 1, y + 1);

            let idx = (y as u32 * width + x as u32) as usize;
            field.dx[idx] = gx;
            field.dy[idx] = gy;
            field.magnitude[idx] = (gx * gx + gy * gy).sqrt();
        }
    }
    field
}

/// Canny edge detector: gradient, non-maximum suppression, double threshold with
/// hysteresis. Edge pixels come out as 255, the rest as 0.
pub fn canny(image: &GrayImage, lower_threshold: f64, upper_threshold: f64) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut result = GrayImage::new(width, height);
    if width < 3 || height < 3 { return result; }

    let field = sobel(image);

    // non-maximum suppression along the quantized gradient direction
    let mut thinned = vec![0.0f32; (width * height) as usize];
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let idx = field.index(x, y);
            let mag = field.magnitude[idx];
            if mag == 0.0 { continue; }

            let angle = field.dy[idx].atan2(field.dx[idx]).to_degrees();
            let angle = if angle < 0.0 { angle + 180.0 } else { angle };

            let (n1, n2) = if angle < 22.5 || angle >= 157.5 {
                (field.index(x - 1, y), field.index(x + 1, y))
            } else if angle < 67.5 {
                (field.index(x - 1, y - 1), field.index(x + 1, y + 1))
            } else if angle < 112.5 {
                (field.index(x, y - 1), field.index(x, y + 1))
            } else {
                (field.index(x + 1, y - 1), field.index(x - 1, y + 1))
            };

            if mag >= field.magnitude[n1] && mag >= field.magnitude[n2] {
                thinned[idx] = mag;
            }
        }
    }

    // double threshold + hysteresis (flood from strong pixels)
    const STRONG: u8 = 255;
    const WEAK: u8 = 100;

    let mut marks = vec![0u8; (width * height) as usize];
    let mut stack = vec![];
    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            if thinned[idx] as f64 >= upper_threshold {
                marks[idx] = STRONG;
                stack.push((x, y));
            } else if thinned[idx] as f64 >= lower_threshold {
                marks[idx] = WEAK;
            }
        }
    }

    while let Some((x, y)) = stack.pop() {
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 { continue; }
                let nidx = (ny as u32 * width + nx as u32) as usize;
                if marks[nidx] == WEAK {
                    marks[nidx] = STRONG;
                    stack.push((nx as u32, ny as u32));
                }
            }
        }
    }

    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            if marks[idx] == STRONG {
                result.put_pixel(x, y, Luma([255]));
            }
        }
    }
    result
}

#[derive(Clone, Copy, Debug)]
pub struct LineSegment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32
}

impl LineSegment {
    pub fn length(&self) -> f64 {
        (((self.x2 - self.x1).pow(2) + (self.y2 - self.y1).pow(2)) as f64).sqrt()
    }

    /// Angle in 0..180 degrees, measured like the standard-Hough convention.
    pub fn angle_deg(&self) -> f64 {
        let angle = ((self.y2 - self.y1) as f64).atan2((self.x2 - self.x1) as f64).to_degrees();
        if angle < 0.0 { angle + 180.0 } else { angle }
    }
}

/// Simple probabilistic line finder over a binary edge image: walks every edge pixel in
/// a set of quantized directions and keeps maximal runs (allowing `max_gap` holes).
pub fn find_line_segments(
    edge_image: &GrayImage,
    min_length: u32,
    max_gap: u32
) -> Vec<LineSegment> {
    let (width, height) = edge_image.dimensions();
    let is_edge = |x: i32, y: i32| -> bool {
        x >= 0 && y >= 0 && x < width as i32 && y < height as i32
            && edge_image.get_pixel(x as u32, y as u32)[0] != 0
    };

    let mut segments = vec![];
    let mut consumed = vec![false; (width * height) as usize];

    // direction steps every 15 degrees over a half-circle
    let directions: Vec<(f64, f64)> = (0..12)
        .map(|i| {
            let a = (i as f64) * 15.0f64.to_radians();
            (a.cos(), a.sin())
        })
        .collect();

    for y in 0..height as i32 {
        for x in 0..width as i32 {
            if !is_edge(x, y) || consumed[(y as u32 * width + x as u32) as usize] { continue; }

            for &(dx, dy) in &directions {
                let mut end = (x as f64, y as f64);
                let mut gap = 0u32;
                let mut steps = 0u32;

                loop {
                    let next = (end.0 + dx, end.1 + dy);
                    if is_edge(next.0.round() as i32, next.1.round() as i32) {
                        end = next;
                        gap = 0;
                    } else if gap < max_gap {
                        end = next;
                        gap += 1;
                    } else {
                        break;
                    }
                    steps += 1;
                    if steps > width + height { break; }
                }

                let segment = LineSegment{
                    x1: x, y1: y,
                    x2: end.0.round() as i32, y2: end.1.round() as i32
                };

                if segment.length() >= min_length as f64 {
                    // mark the pixels of the run so we don't re-derive the same line
                    let steps = segment.length().ceil() as i32;
                    for i in 0..=steps {
                        let t = i as f64 / steps.max(1) as f64;
                        let px = (segment.x1 as f64 + t * (segment.x2 - segment.x1) as f64).round() as i32;
                        let py = (segment.y1 as f64 + t * (segment.y2 - segment.y1) as f64).round() as i32;
                        if px >= 0 && py >= 0 && px < width as i32 && py < height as i32 {
                            consumed[(py as u32 * width + px as u32) as usize] = true;
                        }
                    }
                    segments.push(segment);
                    break;
                }
            }
        }
    }

    segments
}

/// Blacks out long near-horizontal structures (golf-shaft artifacts from a foreign
/// strobe) from the edge image. Lines outside the angle band are left alone.
pub fn suppress_lines(
    edge_image: &mut GrayImage,
    min_length: u32,
    max_gap: u32,
    angle_lower_deg: f64,
    angle_upper_deg: f64
) -> usize {
    let segments = find_line_segments(edge_image, min_length, max_gap);
    let mut removed = 0;

    for segment in &segments {
        let angle = segment.angle_deg();
        if angle < angle_lower_deg || angle > angle_upper_deg { continue; }

        let steps = segment.length().ceil() as i32;
        for i in 0..=steps {
            let t = i as f64 / steps.max(1) as f64;
            let x = (segment.x1 as f64 + t * (segment.x2 - segment.x1) as f64).round() as i32;
            let y = (segment.y1 as f64 + t * (segment.y2 - segment.y1) as f64).round() as i32;
            // wipe a 3-pixel-thick band
            for dy in -1i32..=1 {
                let py = y + dy;
                if x >= 0 && py >= 0 && (x as u32) < edge_image.width() && (py as u32) < edge_image.height() {
                    edge_image.put_pixel(x as u32, py as u32, Luma([0]));
                }
            }
        }
        removed += 1;
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_vertical_edge() -> GrayImage {
        let mut image = GrayImage::new(32, 32);
        for y in 0..32 {
            for x in 16..32 {
                image.put_pixel(x, y, Luma([200]));
            }
        }
        image
    }

    #[test]
    fn canny_finds_a_step_edge() {
        let image = image_with_vertical_edge();
        let edges = canny(&image, 40.0, 90.0);

        let edge_count: usize = edges.pixels().filter(|p| p[0] != 0).count();
        assert!(edge_count >= 20, "only {} edge pixels", edge_count);

        // the edge should be concentrated near column 16
        for (x, _, pixel) in edges.enumerate_pixels() {
            if pixel[0] != 0 {
                assert!((x as i32 - 16).abs() <= 2, "stray edge at column {}", x);
            }
        }
    }

    #[test]
    fn canny_of_flat_image_is_empty() {
        let image = GrayImage::from_pixel(16, 16, Luma([77]));
        let edges = canny(&image, 40.0, 90.0);
        assert!(edges.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn horizontal_line_is_suppressed() {
        let mut edges = GrayImage::new(64, 64);
        for x in 4..60 {
            edges.put_pixel(x, 30, Luma([255]));
        }

        // a flat left-to-right line comes out at angle 0; the configured shaft band
        // (140..180) covers the mirrored direction
        let removed = suppress_lines(&mut edges, 23, 7, 140.0, 180.0);
        let removed_at_zero = suppress_lines(&mut edges, 23, 7, 0.0, 40.0);
        assert!(removed + removed_at_zero >= 1);
        assert!(edges.pixels().all(|p| p[0] == 0));
    }
}
