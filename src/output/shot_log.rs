//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Shot log: one CSV line per shot.
//!

use crate::output::ShotResult;
use chrono::Local;
use std::io::Write;

/// Columns the log carries; values the core does not compute are written as "NA".
const HEADER: &str = "time,shot,carry,total,side_dest,smash,club_speed,\
ball_speed_mph,back_spin_rpm,side_spin_rpm,vla,hla,descent,apex,flight_time,type";

pub struct ShotLog {
    path: std::path::PathBuf
}

impl ShotLog {
    pub fn new<P: Into<std::path::PathBuf>>(path: P) -> ShotLog {
        ShotLog{ path: path.into() }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let new_file = !self.path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if new_file {
            writeln!(file, "{}", HEADER)?;
        }
        writeln!(file, "{}", line)
    }

    pub fn log_shot(&self, shot_number: u64, result: &ShotResult) {
        let carry = match result.carry_m {
            Some(c) => format!("{:.1}", c),
            None => "NA".to_string()
        };

        let line = format!(
            "{},{},{},NA,NA,NA,NA,{:.1},{:.0},{:.0},{:.1},{:.1},NA,NA,NA,{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            shot_number,
            carry,
            result.ball_speed_mph(),
            result.back_spin_rpm,
            result.side_spin_rpm,
            result.vla_deg,
            result.hla_deg,
            result.club
        );

        if let Err(e) = self.append_line(&line) {
            log::error!("failed to append to shot log {}: {}", self.path.to_string_lossy(), e);
        }
    }

    /// Errors get a counted line too, so the CSV history shows what happened when.
    pub fn log_error(&self, shot_number: u64, message: &str) {
        let line = format!(
            "{},{},Error,Error,Error,Error,Error,0,0,0,0,0,Error,Error,Error,{}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            shot_number,
            message.replace(',', ";")
        );
        if let Err(e) = self.append_line(&line) {
            log::error!("failed to append to shot log {}: {}", self.path.to_string_lossy(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ball::ClubType;

    fn temp_log_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("stroboxide_shot_log_test_{}_{}.csv", tag, std::process::id()))
    }

    #[test]
    fn shots_append_with_header_once() {
        let path = temp_log_path("append");
        let _ = std::fs::remove_file(&path);

        let log = ShotLog::new(&path);
        let result = ShotResult{
            ball_speed_mps: 60.0,
            hla_deg: 1.0,
            vla_deg: 12.0,
            back_spin_rpm: 2800.0,
            side_spin_rpm: 150.0,
            carry_m: None,
            club: ClubType::Driver,
            confidence: 1.0,
            message: String::new()
        };

        log.log_shot(1, &result);
        log.log_shot(2, &result);
        log.log_error(3, "timed out, restarting");

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("time,shot"));
        assert!(lines[1].contains(",1,NA,"));
        assert!(lines[2].contains(",2,NA,"));
        assert!(lines[3].contains("Error"));
        // commas inside the error message must not add columns
        assert_eq!(lines[3].matches(',').count(), lines[0].matches(',').count());

        let _ = std::fs::remove_file(&path);
    }
}
