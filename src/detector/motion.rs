//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Motion watcher: frame differencing in a region downrange of the teed ball, used to
//! decide the moment the ball has been hit.
//!

use crate::ball::Ball;
use crate::imgproc::{self, Rect};
use image::GrayImage;

const DIFF_THRESHOLD: u8 = 25;
const DILATE_KERNEL: u32 = 5;

/// Region right in front (ball-flight direction) of the ball. Anything in the ball or
/// behind it could just be lighting changes or the player teeing up.
pub fn watch_area(ball: &Ball, img_width: u32, img_height: u32) -> Rect {
    let x = ball.x() as i32;
    let y = ball.y() as i32;
    let r = ball.radius().ceil() as i32;

    let xmin = x.max(0);
    let xmax = (x + 10 * r).min(img_width as i32);
    let ymin = (y - 6 * r).max(0);
    let ymax = (y + (r as f64 * 1.5) as i32).min(img_height as i32);

    Rect::new(xmin, ymin, (xmax - xmin).max(0) as u32, (ymax - ymin).max(0) as u32)
}

pub struct MotionDetector {
    reference: GrayImage,
    area: Rect,
    /// Smallest connected changed area (px) that counts as motion; about a third of
    /// the ball's disc.
    min_area: u32
}

impl MotionDetector {
    pub fn new(reference_frame: &GrayImage, ball: &Ball) -> MotionDetector {
        let area = watch_area(ball, reference_frame.width(), reference_frame.height());
        let min_area = (ball.radius() * ball.radius()) as u32;
        let (reference, _) = imgproc::sub_image(reference_frame, area);
        MotionDetector{
            reference: imgproc::gaussian_blur(&reference, 5),
            area,
            min_area
        }
    }

    /// True when the new frame shows a sufficiently large change inside the watch area.
    pub fn motion_detected(&self, frame: &GrayImage) -> bool {
        let (current, _) = imgproc::sub_image(frame, self.area);
        if current.dimensions() != self.reference.dimensions() {
            return false;
        }
        let current = imgproc::gaussian_blur(&current, 5);

        let mut diff = GrayImage::new(current.width(), current.height());
        for (x, y, pixel) in current.enumerate_pixels() {
            let reference = self.reference.get_pixel(x, y)[0];
            let delta = (pixel[0] as i16 - reference as i16).unsigned_abs() as u8;
            diff.put_pixel(x, y, image::Luma([if delta > DIFF_THRESHOLD { 255 } else { 0 }]));
        }

        let dilated = imgproc::dilate(&diff, DILATE_KERNEL);
        let changed = dilated.pixels().filter(|p| p[0] != 0).count() as u32;

        changed >= self.min_area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgproc::Circle;
    use image::Luma;

    fn ball_at(x: f32, y: f32, r: f32) -> Ball {
        Ball::from_circle(Circle::new(x, y, r))
    }

    #[test]
    fn watch_area_sits_downrange() {
        let ball = ball_at(100.0, 200.0, 20.0);
        let area = watch_area(&ball, 800, 400);

        assert_eq!(area.x, 100);
        assert!(area.x + (area.width as i32) <= 800);
        assert!(area.y < 200 && area.y + (area.height as i32) > 200);
    }

    #[test]
    fn still_scene_triggers_nothing() {
        let frame = GrayImage::from_pixel(320, 240, Luma([40]));
        let ball = ball_at(60.0, 120.0, 15.0);
        let detector = MotionDetector::new(&frame, &ball);

        assert!(!detector.motion_detected(&frame));
    }

    #[test]
    fn large_bright_intrusion_triggers() {
        let frame = GrayImage::from_pixel(320, 240, Luma([40]));
        let ball = ball_at(60.0, 120.0, 15.0);
        let detector = MotionDetector::new(&frame, &ball);

        let mut moved = frame.clone();
        // a club-head-sized blob enters the watch area
        for y in 100..140 {
            for x in 90..140 {
                moved.put_pixel(x, y, Luma([220]));
            }
        }
        assert!(detector.motion_detected(&moved));
    }

    #[test]
    fn tiny_noise_does_not_trigger() {
        let frame = GrayImage::from_pixel(320, 240, Luma([40]));
        let ball = ball_at(60.0, 120.0, 15.0);
        let detector = MotionDetector::new(&frame, &ball);

        let mut noisy = frame.clone();
        noisy.put_pixel(100, 120, Luma([200]));
        noisy.put_pixel(101, 120, Luma([200]));
        assert!(!detector.motion_detected(&noisy));
    }
}
