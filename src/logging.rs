//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Logger setup and the recent-messages ring.
//!

use std::collections::VecDeque;
use std::sync::Mutex;

const RECENT_CAPACITY: usize = 50;

/// Last few log messages; embedded in error results sent upstream so the operator can
/// see the cause without shell access.
pub struct RecentMessages {
    buffer: Mutex<VecDeque<String>>
}

impl RecentMessages {
    pub fn new() -> RecentMessages {
        RecentMessages{ buffer: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)) }
    }

    pub fn push(&self, message: String) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.len() == RECENT_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(message);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.buffer.lock().unwrap().iter().cloned().collect()
    }
}

pub fn init(enable_file_log: bool) {
    let config = simplelog::ConfigBuilder::new()
        .set_time_format_custom(simplelog::format_description!(
            "[hour]:[minute]:[second].[subsecond digits:3]"
        ))
        .build();

    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![
        simplelog::TermLogger::new(
            simplelog::LevelFilter::Info,
            config.clone(),
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto
        )
    ];

    if enable_file_log {
        match std::fs::File::create("stroboxide.log") {
            Ok(file) => loggers.push(simplelog::WriteLogger::new(
                simplelog::LevelFilter::Trace,
                config,
                file
            )),
            Err(e) => eprintln!("WARNING: could not create log file: {}", e)
        }
    }

    if simplelog::CombinedLogger::init(loggers).is_err() {
        eprintln!("WARNING: logger already initialized.");
    }
}
