//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Exposure selection: picks the true ball exposures out of the strobed-frame
//! candidates and associates each retained exposure with a strobe interval.
//!

use crate::ball::{Ball, ClubType, GolferOrientation};
use crate::config::ExposureSelectionConfig;
use crate::imgproc;
use image::RgbImage;

#[derive(Debug)]
pub enum SelectionError {
    /// Fewer than two exposures anywhere in the frame.
    TooFewCandidates(usize),
    /// The filter cascade left fewer than two survivors.
    FilteringCollapse(usize),
    /// No (collapse, offset) alignment fit the observed distances.
    NoAlignment
}

/// A ball plus the strobe interval (us) separating it from its left neighbour; the
/// first ball of a sequence has no interval.
#[derive(Clone, Debug)]
pub struct BallAndTiming {
    pub ball: Ball,
    pub interval_before_us: i64
}

/// The winning alignment between observed distances and the pulse train.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlignmentChoice {
    /// Number of adjacent pulses treated as one (missed exposures).
    pub collapsed_pulses: usize,
    pub collapse_offset: usize,
    /// Where the distance-ratio pattern starts inside the (collapsed) pulse ratios.
    pub pattern_offset: usize,
    /// Final error score, collapse penalty included.
    pub score: f64,
    pub penalty_applied: bool
}

#[derive(Debug)]
pub struct ExposureSelection {
    /// All retained exposures, x-sorted, with their intervals.
    pub balls_and_timing: Vec<BallAndTiming>,
    /// The stricter subset suitable for spin analysis.
    pub non_overlapping: Vec<BallAndTiming>,
    /// Exposure closest to image center; its view best matches the teed ball's.
    pub face_ball: Ball,
    /// Next-closest-to-center exposure, paired with the face ball for velocity.
    pub second_ball: Ball,
    pub time_between_face_and_second_us: i64,
    pub alignment: AlignmentChoice
}

pub struct ExposureSelector<'a> {
    config: &'a ExposureSelectionConfig,
    club: ClubType,
    orientation: GolferOrientation,
    resolution: (u32, u32),
    /// Expected per-interval slowdown, percent; regime- and ball-dependent.
    slowdown_pct: f64
}

impl<'a> ExposureSelector<'a> {
    pub fn new(
        config: &'a ExposureSelectionConfig,
        club: ClubType,
        orientation: GolferOrientation,
        resolution: (u32, u32),
        slowdown_pct: f64
    ) -> ExposureSelector<'a> {
        ExposureSelector{ config, club, orientation, resolution, slowdown_pct }
    }

    fn sort_by_x(&self, balls: &mut Vec<Ball>) {
        match self.orientation {
            GolferOrientation::RightHanded =>
                balls.sort_by(|a, b| a.x().partial_cmp(&b.x()).unwrap_or(std::cmp::Ordering::Equal)),
            GolferOrientation::LeftHanded =>
                balls.sort_by(|a, b| b.x().partial_cmp(&a.x()).unwrap_or(std::cmp::Ordering::Equal))
        }
    }

    fn sort_by_quality(&self, balls: &mut Vec<Ball>) {
        balls.sort_by_key(|b| b.quality_rank);
    }

    fn max_color_difference_relaxed(&self) -> f64 {
        match self.club {
            ClubType::Putter => self.config.max_color_diff_putting,
            _ => self.config.max_color_diff_relaxed
        }
    }

    fn max_radius_change_pct(&self) -> f64 {
        match self.club {
            ClubType::Putter => self.config.max_radius_change_pct_putting,
            _ => self.config.max_radius_change_pct
        }
    }

    fn launch_angle_gates(&self) -> (f64, f64) {
        match self.club {
            ClubType::Putter => (
                self.config.min_putting_launch_angle_deg,
                self.config.max_putting_launch_angle_deg
            ),
            _ => (self.config.min_launch_angle_deg, self.config.max_launch_angle_deg)
        }
    }

    fn overlap_trajectory_gate(&self) -> f64 {
        match self.club {
            ClubType::Putter => self.config.max_off_trajectory_overlap_putting,
            _ => self.config.max_off_trajectory_overlap
        }
    }

    // -------------------------------------------------------------------- filter cascade

    /// Weighted colour difference of a candidate against the top-quality ball; the
    /// weights differ depending on whether the candidate is darker or lighter (balls
    /// that overlap other exposures usually come out brighter).
    fn weighted_color_difference(&self, candidate_stats: &imgproc::ColorStats, expected: &imgproc::ColorStats) -> f64 {
        let avg_diff = imgproc::color_distance(&candidate_stats.average, &expected.average);
        let std_diff = imgproc::color_distance(&candidate_stats.std_dev, &expected.std_dev);

        if imgproc::is_darker(&candidate_stats.average, &expected.median) {
            self.config.weight_rgb_darker * (1.0 * avg_diff).powi(2)
                + self.config.weight_std_darker * (2.3 * std_diff).powi(2)
        } else {
            self.config.weight_rgb_lighter * (1.0 * avg_diff).powi(2)
                + self.config.weight_std_lighter * (2.0 * std_diff).powi(2)
        }
    }

    fn remove_wrong_color(
        &self,
        image: &RgbImage,
        balls: &mut Vec<Ball>,
        expected_best: &Ball,
        max_difference: f64
    ) {
        let expected = imgproc::color_stats_in_circle(image, &expected_best.circle);

        let mut i = balls.len();
        while i > 0 {
            i -= 1;
            let stats = imgproc::color_stats_in_circle(image, &balls[i].circle);
            balls[i].average_color = stats.average;
            balls[i].median_color = stats.median;
            balls[i].std_color = stats.std_dev;

            let difference = self.weighted_color_difference(&stats, &expected);
            if difference > max_difference {
                log::trace!(
                    "dropping candidate {} for colour difference {:.0} (max {:.0})",
                    i, difference, max_difference
                );
                balls.remove(i);
            }
        }
    }

    fn remove_wrong_radius(&self, balls: &mut Vec<Ball>, expected_best: &Ball) {
        let nominal = expected_best.radius();
        let max_difference = nominal * self.config.max_radius_diff_from_best_pct / 100.0;

        let mut i = balls.len();
        while i > 1 {
            i -= 1;
            if (balls[i].radius() - nominal).abs() > max_difference {
                log::trace!("dropping candidate {} for radius {:.1} vs nominal {:.1}", i, balls[i].radius(), nominal);
                balls.remove(i);
            }
        }
    }

    /// For each candidate close (in x) to a higher-quality one, drop it when the angle
    /// between their centers falls outside the launch-angle band. Requires the vector
    /// to be quality-ordered.
    fn remove_unlikely_angle(&self, balls: &mut Vec<Ball>) {
        let (min_angle, max_angle) = self.launch_angle_gates();

        let mut outer = 0usize;
        while outer + 1 < balls.len() {
            let mut i = balls.len();
            while i > outer + 1 {
                i -= 1;

                let x_distance = (balls[i].x() - balls[outer].x()).abs();
                if x_distance > self.config.unlikely_angle_min_distance_px {
                    continue;
                }

                let angle_deg = if x_distance < 0.001 {
                    // stacked vertically; a huge angle guarantees removal
                    89.0
                } else {
                    let raw = ((balls[i].y() - balls[outer].y()) / x_distance).atan().to_degrees();
                    if balls[i].x() > balls[outer].x() { -raw } else { raw }
                };

                if angle_deg < min_angle || angle_deg > max_angle {
                    log::trace!(
                        "dropping candidate {} at unlikely angle {:.1} deg vs candidate {}",
                        i, angle_deg, outer
                    );
                    balls.remove(i);
                }
            }
            outer += 1;
        }
    }

    fn remove_low_scoring(&self, balls: &mut Vec<Ball>) {
        if balls.len() > self.config.max_balls_to_retain {
            balls.truncate(self.config.max_balls_to_retain);
        }
    }

    fn remove_off_trajectory(&self, balls: &mut Vec<Ball>, best: &Ball, second_best: &Ball) {
        let mut i = balls.len();
        while i > 0 {
            i -= 1;
            let b = &balls[i];
            if b.quality_rank == best.quality_rank || b.quality_rank == second_best.quality_rank {
                continue;
            }

            let distance = perpendicular_distance(
                b.x(), b.y(), best.x(), best.y(), second_best.x(), second_best.y()
            );
            if distance > self.config.max_off_trajectory {
                log::trace!("dropping candidate {} at {:.1} px off-trajectory", i, distance);
                balls.remove(i);
            }
        }
    }

    fn remove_nearby_poor_quality(&self, balls: &mut Vec<Ball>, max_proximity: f64, max_quality_difference: i64) {
        let snapshot = balls.clone();
        for (outer_index, current) in snapshot.iter().enumerate() {
            let mut i = balls.len();
            while i > outer_index + 1 {
                i -= 1;
                if i >= balls.len() { continue; }

                let distance = current.pixel_distance_from(&balls[i]);
                let quality_difference = balls[i].quality_rank as i64 - current.quality_rank as i64;
                if distance < max_proximity && quality_difference > max_quality_difference {
                    log::trace!(
                        "dropping candidate {} (quality {}) near candidate of quality {}",
                        i, balls[i].quality_rank, current.quality_rank
                    );
                    balls.remove(i);
                }
            }
        }
    }

    /// Triple-window pass over x-sorted candidates: a middle ball whose radius differs
    /// from both neighbours by too much goes, as does the larger of a close adjacent
    /// pair whose radii diverge (an overlapped-ball artefact).
    fn remove_unlikely_radius_change(&self, balls: &mut Vec<Ball>, preserve_high_quality: bool) {
        if balls.len() < 3 {
            return;
        }

        const HIGH_QUALITY_RANKS: u32 = 2;
        let max_change = self.max_radius_change_pct();
        let overlap_ratio = self.config.max_overlapped_radius_change_ratio;

        let mut i = balls.len() as i64 - 3;
        while i >= 0 {
            let idx = i as usize;
            if idx + 2 >= balls.len() { i -= 1; continue; }

            let r1 = balls[idx].radius();
            let r2 = balls[idx + 1].radius();
            let r3 = balls[idx + 2].radius();

            let left_proximity = balls[idx].pixel_distance_from(&balls[idx + 1]);
            let right_proximity = balls[idx + 1].pixel_distance_from(&balls[idx + 2]);

            // near-overlapping pairs are allowed a bit more radius drift
            let left_allowance = max_change / 100.0 + (left_proximity / 150.0) / 100.0;
            let right_allowance = max_change / 100.0 + (right_proximity / 150.0) / 100.0;

            let middle_sticks_out =
                (r2 > r1 * (1.0 + left_allowance) && r2 > r3 * (1.0 + right_allowance))
                || (r2 < r1 * (1.0 - left_allowance) && r2 < r3 * (1.0 - right_allowance));

            if middle_sticks_out {
                if balls[idx + 1].quality_rank >= HIGH_QUALITY_RANKS || !preserve_high_quality {
                    log::trace!("dropping middle candidate {} for radius step", idx + 1);
                    balls.remove(idx + 1);
                }
            } else {
                let left_change = (r2 - r1).abs();
                let right_change = (r3 - r2).abs();

                // rightmost two very close while the left pair is not: likely an overlap
                if right_proximity < r3 && right_proximity < left_proximity / 2.0
                    && right_change > overlap_ratio * left_change
                {
                    if balls[idx + 2].quality_rank >= HIGH_QUALITY_RANKS || !preserve_high_quality {
                        log::trace!("dropping candidate {} overlapping its neighbour", idx + 2);
                        balls.remove(idx + 2);
                    }
                } else if left_proximity < r1 && left_proximity < right_proximity / 2.0
                    && left_change > overlap_ratio * right_change
                {
                    if balls[idx].quality_rank >= HIGH_QUALITY_RANKS || !preserve_high_quality {
                        log::trace!("dropping candidate {} overlapping its neighbour", idx);
                        balls.remove(idx);
                    }
                }
            }

            i -= 1;
        }
    }

    /// Right-to-left overlap sweep. Returns the surviving balls and how many real
    /// exposures are believed lost to overlap (that count feeds the interval collapse).
    fn remove_overlapping(
        &self,
        balls: &[Ball],
        margin_pct: f64,
        attempt_trajectory_rescue: bool,
        best: &Ball,
        second_best: &Ball,
        preserve_high_quality: bool
    ) -> (Vec<Ball>, usize) {
        const HIGH_QUALITY_RANKS: u32 = 2;

        let mut survivors: Vec<Ball> = vec![];
        let mut removed = 0usize;

        let mut i = balls.len() as i64 - 1;
        while i >= 0 {
            let idx = i as usize;
            let ball = &balls[idx];

            if idx == 0 {
                // closest to the tee; nothing further left overlapped it
                survivors.push(ball.clone());
                break;
            }

            let next_closer = &balls[idx - 1];
            let proximity = ball.pixel_distance_from(next_closer);
            let limit = (1.0 - margin_pct / 100.0) * (next_closer.radius() + ball.radius());

            if proximity >= limit {
                survivors.push(ball.clone());
                i -= 1;
                continue;
            }

            if attempt_trajectory_rescue {
                let gate = self.overlap_trajectory_gate();
                let d_left = perpendicular_distance(
                    next_closer.x(), next_closer.y(), best.x(), best.y(), second_best.x(), second_best.y()
                );
                let d_right = perpendicular_distance(
                    ball.x(), ball.y(), best.x(), best.y(), second_best.x(), second_best.y()
                );

                if d_left < gate && d_right < gate {
                    // two real exposures overlapped; both are position- and
                    // spin-unreliable, unless one is a protected high-quality ball
                    if preserve_high_quality && ball.quality_rank < HIGH_QUALITY_RANKS {
                        survivors.push(ball.clone());
                        removed += 1;
                        i -= 2;
                        continue;
                    } else if preserve_high_quality && next_closer.quality_rank < HIGH_QUALITY_RANKS {
                        // keep the left one by skipping only the right
                        i -= 1;
                        continue;
                    } else {
                        removed += 2;
                        i -= 2;
                        if i == 0 {
                            // the lone leftover to the left is almost certainly
                            // overlapped too; spacing only shrinks toward the tee
                            break;
                        }
                        continue;
                    }
                } else {
                    // one is a misidentification; drop whichever sits further off the line
                    if d_left > d_right {
                        survivors.push(ball.clone());
                        removed += 1;
                        i -= 2;
                        continue;
                    } else {
                        i -= 1;
                        continue;
                    }
                }
            } else {
                removed += 2;
                i -= 2;
                if i == 0 {
                    break;
                }
                continue;
            }
        }

        let mut survivors = survivors;
        self.sort_by_x(&mut survivors);
        (survivors, removed)
    }

    // -------------------------------------------------------------------- interval correlation

    /// Inter-ball pixel distances and their slowdown-adjusted ratios.
    fn distances_and_ratios(&self, balls: &[Ball]) -> Option<(Vec<f64>, Vec<f64>)> {
        let mut distances = vec![];
        for pair in balls.windows(2) {
            distances.push(pair[0].pixel_distance_from(&pair[1]));
        }

        let mut ratios = vec![];
        for pair in distances.windows(2) {
            let left = pair[0];
            // friction robs the right-hand gap of some distance; compensate
            let right = pair[1] * (1.0 + self.slowdown_pct / 100.0);
            if left <= 1.0 {
                log::warn!("invalid (<1 px) inter-ball distance");
                return None;
            }
            ratios.push(right / left);
        }

        Some((distances, ratios))
    }

    /// The chosen interval alignment's error score is the minimum across all
    /// (collapse, offset) trials, with the collapse penalty applied.
    fn find_best_alignment(
        &self,
        distance_ratios: &[f64],
        pulse_intervals_ms: &[f64]
    ) -> Option<AlignmentChoice> {
        let mut best: Option<AlignmentChoice> = None;

        let max_collapse = pulse_intervals_ms.len() / 2;
        for collapsed_pulses in 0..max_collapse.max(1) {
            let max_offset = pulse_intervals_ms.len().saturating_sub(collapsed_pulses + 1);
            for collapse_offset in 0..max_offset.max(1) {
                if collapsed_pulses == 0 && collapse_offset > 0 {
                    break;
                }

                let (_, pulse_ratios) =
                    collapse_pulse_intervals(pulse_intervals_ms, collapsed_pulses, collapse_offset);

                let mut local_best: Option<(usize, f64)> = None;
                if pulse_ratios.len() >= distance_ratios.len() {
                    for pattern_offset in 0..=(pulse_ratios.len() - distance_ratios.len()) {
                        let score = ratio_distance(distance_ratios, &pulse_ratios, pattern_offset);
                        if local_best.map_or(true, |(_, s)| score < s) {
                            local_best = Some((pattern_offset, score));
                        }
                    }
                }

                if let Some((pattern_offset, mut score)) = local_best {
                    let penalty_applied = collapsed_pulses > 0;
                    if penalty_applied {
                        score *= 1.0 + self.config.lost_pulse_penalty_pct / 100.0;
                    }

                    if best.map_or(true, |b| score < b.score) {
                        log::trace!(
                            "best alignment so far: score {:.2}, collapse {} at {}, pattern offset {}",
                            score, collapsed_pulses, collapse_offset, pattern_offset
                        );
                        best = Some(AlignmentChoice{
                            collapsed_pulses,
                            collapse_offset,
                            pattern_offset,
                            score,
                            penalty_applied
                        });
                    }
                }
            }
        }

        best
    }

    fn most_centered_index(&self, balls: &[Ball], ignore: Option<usize>) -> Option<usize> {
        let center_x = self.resolution.0 as f64 / 2.0;
        let center_y = self.resolution.1 as f64 / 2.0;

        let mut best: Option<(usize, f64)> = None;
        for (i, ball) in balls.iter().enumerate() {
            if Some(i) == ignore { continue; }
            let distance = ((ball.x() - center_x).powi(2) + (ball.y() - center_y).powi(2)).sqrt();
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }
        best.map(|(i, _)| i)
    }

    /// Runs the full cascade and interval correlation over the detector's candidates.
    pub fn select(
        &self,
        image: &RgbImage,
        candidates: Vec<Ball>,
        pulse_intervals_ms: &[f64]
    ) -> Result<ExposureSelection, SelectionError> {
        if candidates.len() < 2 {
            return Err(SelectionError::TooFewCandidates(candidates.len()));
        }

        let mut working = candidates;
        self.sort_by_quality(&mut working);

        // the top two by quality anchor the trajectory and are never dropped
        let mut best = working[0].clone();
        let mut second_best = working[1].clone();

        {
            let anchor = best.clone();
            self.remove_wrong_color(image, &mut working, &anchor, self.max_color_difference_relaxed());
            self.remove_wrong_radius(&mut working, &anchor);
        }
        self.remove_unlikely_angle(&mut working);

        if working.len() >= 2 {
            best = working[0].clone();
            second_best = working[1].clone();
        }

        self.remove_low_scoring(&mut working);
        self.remove_unlikely_angle(&mut working);
        {
            let anchor = best.clone();
            self.remove_wrong_radius(&mut working, &anchor);
        }

        if working.len() >= 2 {
            best = working[0].clone();
            second_best = working[1].clone();
        }

        let initial_count = working.len();
        self.sort_by_x(&mut working);
        self.remove_off_trajectory(&mut working, &best, &second_best);

        if initial_count > 20 {
            let min_radius = working.iter().map(|b| b.radius()).fold(f64::MAX, f64::min);
            self.remove_nearby_poor_quality(&mut working, min_radius, initial_count as i64 / 2);
        }

        self.sort_by_quality(&mut working);
        self.remove_low_scoring(&mut working);

        if working.len() < 2 {
            log::warn!("only {} candidate(s) after initial filtering; ball speed may be out of range", working.len());
            return Err(SelectionError::FilteringCollapse(working.len()));
        }

        self.sort_by_x(&mut working);
        self.remove_unlikely_radius_change(&mut working, true);
        self.sort_by_x(&mut working);
        self.remove_unlikely_radius_change(&mut working, true);
        self.sort_by_x(&mut working);
        self.remove_unlikely_radius_change(&mut working, true);

        self.sort_by_x(&mut working);
        self.remove_off_trajectory(&mut working, &best, &second_best);
        self.sort_by_x(&mut working);

        // Bright overlap artefacts would be culled by a colour filter; keep this copy
        // so the strictly-non-overlapping analysis still sees them as overlaps.
        let pre_strict_copy = working.clone();

        let (mut first_pass, mut removed_overlapping) = self.remove_overlapping(
            &working, self.config.proximity_margin_relaxed_pct, true, &best, &second_best, true
        );

        self.remove_unlikely_radius_change(&mut first_pass, false);
        self.sort_by_x(&mut first_pass);

        let (mut retained, removed_second_pass) = self.remove_overlapping(
            &first_pass, self.config.proximity_margin_relaxed_pct, true, &best, &second_best, false
        );
        removed_overlapping += removed_second_pass;

        if retained.len() < 2 {
            log::error!("fewer than two exposures after overlap removal; ball may have been too slow");
            return Err(SelectionError::FilteringCollapse(retained.len()));
        }

        self.sort_by_x(&mut retained);

        let face_index = self.most_centered_index(&retained, None)
            .ok_or(SelectionError::FilteringCollapse(0))?;
        // the second ball: most centered apart from the face ball (face-on views
        // compare best, and close pairs limit the spin the search must recover)
        let second_index = self.most_centered_index(&retained, Some(face_index))
            .ok_or(SelectionError::FilteringCollapse(1))?;

        let (balls_and_timing, face_interval_us, alignment) =
            self.correlate_intervals(&retained, face_index, second_index, pulse_intervals_ms)?;

        // strict non-overlap set for spin, grown from the pre-colour copy
        let mut strict = pre_strict_copy;
        self.remove_unlikely_radius_change(&mut strict, false);
        self.sort_by_quality(&mut strict);
        self.remove_unlikely_angle(&mut strict);
        self.sort_by_x(&mut strict);
        let (mut strict, _) = self.remove_overlapping(
            &strict, self.config.proximity_margin_strict_pct, false, &best, &second_best, false
        );
        self.remove_wrong_color(image, &mut strict, &best, self.config.max_color_diff_strict);

        let non_overlapping = sync_timing(&balls_and_timing, &strict);

        Ok(ExposureSelection{
            face_ball: retained[face_index].clone(),
            second_ball: retained[second_index].clone(),
            time_between_face_and_second_us: face_interval_us,
            balls_and_timing,
            non_overlapping,
            alignment
        })
    }

    fn correlate_intervals(
        &self,
        retained: &[Ball],
        face_index: usize,
        second_index: usize,
        pulse_intervals_ms: &[f64]
    ) -> Result<(Vec<BallAndTiming>, i64, AlignmentChoice), SelectionError> {
        if pulse_intervals_ms.len() < 3 {
            log::error!("strobe pulse sequence too short to compute ratios");
            return Err(SelectionError::NoAlignment);
        }

        let (_, distance_ratios) = self.distances_and_ratios(retained)
            .ok_or(SelectionError::NoAlignment)?;

        if !distance_ratios.is_empty() {
            let alignment = self.find_best_alignment(&distance_ratios, pulse_intervals_ms)
                .ok_or(SelectionError::NoAlignment)?;

            let (intervals, _) = collapse_pulse_intervals(
                pulse_intervals_ms, alignment.collapsed_pulses, alignment.collapse_offset
            );

            let mut balls_and_timing = vec![];
            for (i, ball) in retained.iter().enumerate() {
                let interval_before_us = if i == 0 {
                    0
                } else {
                    let idx = alignment.pattern_offset + i - 1;
                    (1000.0 * intervals.get(idx).copied().unwrap_or(0.0)) as i64
                };
                balls_and_timing.push(BallAndTiming{ ball: ball.clone(), interval_before_us });
            }

            let face_interval_us = if second_index > face_index {
                (1000.0 * intervals.get(face_index + alignment.pattern_offset).copied().unwrap_or(0.0)) as i64
            } else {
                let idx = (face_index + alignment.pattern_offset).saturating_sub(1);
                (1000.0 * intervals.get(idx).copied().unwrap_or(0.0)) as i64
            };

            Ok((balls_and_timing, face_interval_us, alignment))
        } else {
            // exactly two survivors: no ratios to correlate, fall back to the
            // configured assumption about which exposures they were
            if retained.len() != 2 {
                return Err(SelectionError::NoAlignment);
            }

            let (interval_ms, pattern_offset) = match self.club {
                ClubType::Putter => {
                    log::warn!("two exposures only; assuming they were the last two");
                    (
                        pulse_intervals_ms[pulse_intervals_ms.len() - 2],
                        pulse_intervals_ms.len() - 2
                    )
                },
                _ => {
                    log::warn!("two exposures only; assuming they were the first two");
                    (pulse_intervals_ms[0], 0)
                }
            };

            let interval_us = (1000.0 * interval_ms) as i64;
            let balls_and_timing = vec![
                BallAndTiming{ ball: retained[0].clone(), interval_before_us: 0 },
                BallAndTiming{ ball: retained[1].clone(), interval_before_us: interval_us }
            ];

            Ok((
                balls_and_timing,
                interval_us,
                AlignmentChoice{ pattern_offset, ..AlignmentChoice::default() }
            ))
        }
    }

    /// Picks the two closest balls of the strict set for spin analysis, preferring
    /// pairs away from the frame edges; a touching pair short-circuits the search
    /// (anything further left only gets more overlapped).
    pub fn closest_spin_pair(&self, balls: &[BallAndTiming]) -> Option<(Ball, Ball, i64)> {
        let with_backoff = self.find_closest_pair(balls, true);
        let chosen = match with_backoff {
            Some(pair) => Some(pair),
            None => self.find_closest_pair(balls, false)
        };

        chosen.map(|(left, right)| {
            let interval = balls[right].interval_before_us;
            (balls[left].ball.clone(), balls[right].ball.clone(), interval)
        })
    }

    fn find_closest_pair(&self, balls: &[BallAndTiming], use_edge_backoffs: bool) -> Option<(usize, usize)> {
        if balls.len() < 2 { return None; }

        let mut min_x = self.config.edge_backoff_px as f64;
        let mut min_y = self.config.edge_backoff_px as f64;
        let mut max_x = self.resolution.0 as f64 - self.config.edge_backoff_px as f64;
        let mut max_y = self.resolution.1 as f64 - self.config.edge_backoff_px as f64;

        // if the group as a whole hugs a border, move the limits out of its way
        let all: Vec<Ball> = balls.iter().map(|b| b.ball.clone()).collect();
        let averaged = Ball::average(&all);
        if averaged.x() < min_x * 1.5 { min_x = (averaged.x() / 2.0).round(); }
        if averaged.y() < min_y * 1.5 { min_y = (averaged.y() / 2.0).round(); }
        if averaged.x() > max_x * 0.8 { max_x = self.resolution.0 as f64; }
        if averaged.y() > max_y * 0.8 { max_y = self.resolution.1 as f64; }

        let inside = |b: &Ball| -> bool {
            !use_edge_backoffs || (
                b.x() - b.radius() >= min_x && b.x() + b.radius() <= max_x
                && b.y() - b.radius() >= min_y && b.y() + b.radius() <= max_y
            )
        };

        let mut closest: Option<(usize, usize, f64)> = None;
        'outer: for first in (1..balls.len()).rev() {
            for second in (0..first).rev() {
                let b1 = &balls[first].ball;
                let b2 = &balls[second].ball;
                if !inside(b1) || !inside(b2) { continue; }

                let distance = b1.pixel_distance_from(b2);
                if closest.map_or(true, |(_, _, d)| distance < d) {
                    closest = Some((second, first, distance));
                    if distance <= b1.radius() + b2.radius() {
                        break 'outer;
                    }
                }
            }
        }

        closest.map(|(left, right, _)| (left, right))
    }
}

/// Distance from point (xc, yc) to the infinite line through (xa, ya)-(xb, yb).
pub fn perpendicular_distance(xc: f64, yc: f64, xa: f64, ya: f64, xb: f64, yb: f64) -> f64 {
    if (xb - xa).abs() < 0.0001 {
        return (xc - xb).abs();
    }
    if (yb - ya).abs() < 0.0001 {
        return (yc - yb).abs();
    }

    let numerator = ((xb - xa) * (yc - ya) - (yb - ya) * (xc - xa)).abs();
    let denominator = ((xb - xa).powi(2) + (yb - ya).powi(2)).sqrt();
    numerator / denominator
}

/// Sums `count` adjacent intervals starting at `offset` into one (as if that many
/// exposures were missed), then recomputes the ratios.
pub fn collapse_pulse_intervals(
    intervals_ms: &[f64],
    count: usize,
    offset: usize
) -> (Vec<f64>, Vec<f64>) {
    let mut working: Vec<f64> = intervals_ms.to_vec();

    if count > 0 && offset + count < working.len() {
        for _ in 0..count {
            working[offset] += working[offset + 1];
            working.remove(offset + 1);
        }
    }

    let ratios = working.windows(2).map(|pair| pair[1] / pair[0]).collect();
    (working, ratios)
}

const MAX_RATIO_DISTANCE: f64 = 1000.0;

/// Score of the distance-ratio pattern against the pulse ratios at the given offset;
/// each term is scaled, capped, and squared so large errors dominate.
pub fn ratio_distance(distance_ratios: &[f64], pulse_ratios: &[f64], offset: usize) -> f64 {
    let mut total = 0.0;
    for (i, &distance_ratio) in distance_ratios.iter().enumerate() {
        let pulse_ratio = match pulse_ratios.get(i + offset) {
            Some(&p) => p,
            None => {
                log::warn!("ratio pattern ran past the pulse ratios");
                return MAX_RATIO_DISTANCE;
            }
        };

        let mut difference = 100.0 * (distance_ratio - pulse_ratio).abs();
        if difference > MAX_RATIO_DISTANCE {
            difference = MAX_RATIO_DISTANCE;
        }
        total += difference * difference;
    }
    total
}

/// Keeps `timed` and a filtered ball set in sync: a ball missing from `kept` is
/// removed, and its left interval is folded into its right neighbour.
fn sync_timing(timed: &[BallAndTiming], kept: &[Ball]) -> Vec<BallAndTiming> {
    let mut result: Vec<BallAndTiming> = timed.to_vec();

    let mut i = result.len() as i64 - 1;
    while i >= 0 {
        let idx = i as usize;
        let present = kept.iter().any(|k|
            (k.x() - result[idx].ball.x()).abs() < 0.5 && (k.y() - result[idx].ball.y()).abs() < 0.5
        );
        if !present {
            if idx + 1 < result.len() {
                result[idx + 1].interval_before_us += result[idx].interval_before_us;
            }
            result.remove(idx);
        }
        i -= 1;
    }

    if let Some(first) = result.first_mut() {
        first.interval_before_us = 0;
    }
    result
}
