//
// Stroboxide - DIY optical golf launch monitor
// Copyright (c) Filip Szczerek <ga.software@yahoo.com>
//
// This project is licensed under the terms of the MIT license
// (see the LICENSE file for details).
//

//!
//! Command-line argument parsing.
//!

mod cmdline {
    pub const ENABLE_LOGGING: &str = "log";
    pub const ROLE: &str = "role";
    pub const CONFIG: &str = "config";
    pub const STANDALONE: &str = "standalone";
    pub const PUTTING: &str = "putting";
    pub const LEFT_HANDED: &str = "left-handed";
    pub const PRACTICE_BALL: &str = "practice-ball";
    pub const EXTERNAL_STROBE: &str = "external-strobe";
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Role {
    Cam1,
    Cam2,
    /// Both hosts in one process against the simulated cameras.
    Standalone
}

pub struct Args {
    pub logging: bool,
    pub role: Role,
    pub config_path: Option<String>,
    pub start_in_putting_mode: bool,
    pub left_handed: bool,
    pub practice_ball: bool,
    pub external_strobe: bool
}

impl Default for Args {
    fn default() -> Args {
        Args{
            logging: false,
            role: Role::Standalone,
            config_path: None,
            start_in_putting_mode: false,
            left_handed: false,
            practice_ball: false,
            external_strobe: false
        }
    }
}

pub fn parse_command_line<I: Iterator<Item=String>>(stream: I) -> Args {
    let allowed_options = vec![
        cmdline::ENABLE_LOGGING,
        cmdline::ROLE,
        cmdline::CONFIG,
        cmdline::STANDALONE,
        cmdline::PUTTING,
        cmdline::LEFT_HANDED,
        cmdline::PRACTICE_BALL,
        cmdline::EXTERNAL_STROBE
    ];

    // key: option name
    let mut option_values = std::collections::HashMap::<String, Vec<String>>::new();

    let mut current: Option<&mut Vec<String>> = None;

    for arg in stream.skip(1) /*skip the binary name*/ {
        if arg.starts_with("--") {
            match &arg[2..] {
                x if !allowed_options.contains(&x) => {
                    eprintln!("Unknown command-line option: {}.", x);
                    return Args::default();
                },

                opt => current = Some(option_values.entry(opt.to_string()).or_insert(vec![])),
            }
        } else {
            if current.is_none() {
                eprintln!("Unexpected value: {}.", arg);
                return Args::default();
            } else {
                (*(*current.as_mut().unwrap())).push(arg);
            }
        }
    }

    let role = match option_values.get(cmdline::ROLE).and_then(|v| v.first()) {
        Some(value) if value == "cam1" => Role::Cam1,
        Some(value) if value == "cam2" => Role::Cam2,
        Some(other) => {
            eprintln!("Unknown role: {} (expected cam1 or cam2).", other);
            Role::Standalone
        },
        None => Role::Standalone
    };

    let role = if option_values.contains_key(cmdline::STANDALONE) { Role::Standalone } else { role };

    Args{
        logging: option_values.contains_key(cmdline::ENABLE_LOGGING),
        role,
        config_path: option_values.get(cmdline::CONFIG).and_then(|v| v.first().cloned()),
        start_in_putting_mode: option_values.contains_key(cmdline::PUTTING),
        left_handed: option_values.contains_key(cmdline::LEFT_HANDED),
        practice_ball: option_values.contains_key(cmdline::PRACTICE_BALL),
        external_strobe: option_values.contains_key(cmdline::EXTERNAL_STROBE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        let stream = std::iter::once("stroboxide".to_string())
            .chain(args.iter().map(|s| s.to_string()));
        parse_command_line(stream)
    }

    #[test]
    fn defaults_without_options() {
        let args = parse(&[]);
        assert_eq!(args.role, Role::Standalone);
        assert!(!args.logging);
        assert!(args.config_path.is_none());
    }

    #[test]
    fn role_and_config_are_parsed() {
        let args = parse(&["--role", "cam1", "--config", "/tmp/test.json", "--log"]);
        assert_eq!(args.role, Role::Cam1);
        assert_eq!(args.config_path.as_deref(), Some("/tmp/test.json"));
        assert!(args.logging);
    }

    #[test]
    fn unknown_option_falls_back_to_defaults() {
        let args = parse(&["--no-such-option"]);
        assert_eq!(args.role, Role::Standalone);
    }

    #[test]
    fn flags_are_recognized() {
        let args = parse(&["--putting", "--left-handed", "--practice-ball"]);
        assert!(args.start_in_putting_mode);
        assert!(args.left_handed);
        assert!(args.practice_ball);
        assert!(!args.external_strobe);
    }
}
