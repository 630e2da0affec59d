use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ArgAction, ColorChoice, Command,
};

pub const ARG_VERBOSITY: &str = "verbosity";

pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            // Successfully parsed as a number
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

fn instance_arg() -> Arg {
    Arg::new("instance")
        .short('i')
        .long("instance")
        .help("Instance id, name or URL (default: the active instance)")
        .env("HOLEGUARD_INSTANCE")
}

fn remember_arg() -> Arg {
    Arg::new("remember")
        .long("remember")
        .help("Store the password so later runs can reconnect without asking (reduced security)")
        .action(ArgAction::SetTrue)
}

fn instance_command() -> Command {
    Command::new("instance")
        .about("Manage configured Pi-hole instances")
        .subcommand_required(true)
        .subcommand(
            Command::new("add")
                .about("Add an instance")
                .arg(
                    Arg::new("url")
                        .help("Server address, e.g. http://pi.hole or https://10.0.0.2/admin")
                        .required(true),
                )
                .arg(Arg::new("name").short('n').long("name").help("Display name"))
                .arg(
                    Arg::new("passwordless")
                        .long("passwordless")
                        .help("The server has no password set")
                        .action(ArgAction::SetTrue),
                )
                .arg(remember_arg()),
        )
        .subcommand(Command::new("list").about("List instances"))
        .subcommand(
            Command::new("rename")
                .about("Rename an instance; omit the name to clear it")
                .arg(Arg::new("instance").required(true))
                .arg(Arg::new("name")),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove an instance and its stored credentials")
                .arg(Arg::new("instance").required(true)),
        )
        .subcommand(
            Command::new("activate")
                .about("Make an instance the default target")
                .arg(Arg::new("instance").required(true)),
        )
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("holeguard")
        .about("Session and credential manager for Pi-hole v6 instances")
        .version(env!("CARGO_PKG_VERSION"))
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("data-dir")
                .long("data-dir")
                .help("Directory holding instances.json (default: platform data dir)")
                .env("HOLEGUARD_DATA_DIR")
                .global(true),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .help("Request timeout in seconds")
                .default_value("10")
                .env("HOLEGUARD_TIMEOUT")
                .global(true)
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("keepalive-interval")
                .long("keepalive-interval")
                .help("Seconds between keepalive passes")
                .default_value("120")
                .env("HOLEGUARD_KEEPALIVE_INTERVAL")
                .global(true)
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("safe-threshold")
                .long("safe-threshold")
                .help("Remaining session seconds considered safe; renewal starts at twice this")
                .default_value("60")
                .env("HOLEGUARD_SAFE_THRESHOLD")
                .global(true)
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("breaker-threshold")
                .long("breaker-threshold")
                .help("Consecutive authentication failures before automatic re-authentication stops")
                .default_value("3")
                .env("HOLEGUARD_BREAKER_THRESHOLD")
                .global(true)
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("accept-invalid-certs")
                .long("accept-invalid-certs")
                .help("Accept self-signed or otherwise invalid TLS certificates")
                .env("HOLEGUARD_ACCEPT_INVALID_CERTS")
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("HOLEGUARD_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .subcommand(instance_command())
        .subcommand(
            Command::new("connect")
                .about("Log in, verifying and optionally storing the password")
                .arg(instance_arg())
                .arg(
                    Arg::new("totp")
                        .long("totp")
                        .help("Six-digit second factor code"),
                )
                .arg(remember_arg()),
        )
        .subcommand(
            Command::new("disconnect")
                .about("Log out and forget the stored password of an instance")
                .arg(instance_arg()),
        )
        .subcommand(Command::new("status").about("Show instances and their connection state"))
        .subcommand(
            Command::new("stats")
                .about("Print the stats summary of an instance")
                .arg(instance_arg()),
        )
        .subcommand(
            Command::new("blocking")
                .about("Show or change DNS blocking")
                .arg(instance_arg())
                .arg(
                    Arg::new("state")
                        .help("on or off; omit to show the current state")
                        .value_parser(["on", "off"]),
                )
                .arg(
                    Arg::new("for")
                        .long("for")
                        .help("Revert after this many seconds")
                        .requires("state")
                        .value_parser(clap::value_parser!(u64).range(1..)),
                ),
        )
        .subcommand(
            Command::new("watch")
                .about("Keep sessions alive and log state changes until interrupted"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "holeguard");
        assert_eq!(
            command.get_about().map(ToString::to_string),
            Some("Session and credential manager for Pi-hole v6 instances".to_string())
        );
        assert_eq!(
            command.get_version().map(ToString::to_string),
            Some(env!("CARGO_PKG_VERSION").to_string())
        );
    }

    #[test]
    fn test_defaults() {
        temp_env::with_vars(
            [
                ("HOLEGUARD_TIMEOUT", None::<&str>),
                ("HOLEGUARD_SAFE_THRESHOLD", None),
                ("HOLEGUARD_BREAKER_THRESHOLD", None),
                ("HOLEGUARD_ACCEPT_INVALID_CERTS", None),
            ],
            || {
                let matches = new().get_matches_from(vec!["holeguard", "status"]);
                assert_eq!(matches.get_one::<u64>("timeout").copied(), Some(10));
                assert_eq!(matches.get_one::<u64>("safe-threshold").copied(), Some(60));
                assert_eq!(matches.get_one::<u32>("breaker-threshold").copied(), Some(3));
                assert!(!matches.get_flag("accept-invalid-certs"));
            },
        );
    }

    #[test]
    fn test_check_env() {
        temp_env::with_vars(
            [
                ("HOLEGUARD_DATA_DIR", Some("/tmp/holeguard")),
                ("HOLEGUARD_TIMEOUT", Some("3")),
                ("HOLEGUARD_INSTANCE", Some("kitchen")),
                ("HOLEGUARD_LOG_LEVEL", Some("info")),
            ],
            || {
                let matches = new().get_matches_from(vec!["holeguard", "stats"]);
                assert_eq!(
                    matches.get_one::<String>("data-dir").cloned(),
                    Some("/tmp/holeguard".to_string())
                );
                assert_eq!(matches.get_one::<u64>("timeout").copied(), Some(3));
                assert_eq!(matches.get_one::<u8>(ARG_VERBOSITY).copied(), Some(2));

                let stats = matches.subcommand_matches("stats");
                assert_eq!(
                    stats.and_then(|m| m.get_one::<String>("instance").cloned()),
                    Some("kitchen".to_string())
                );
            },
        );
    }

    #[test]
    fn test_check_log_level_env() {
        // loop cover all possible value_parse
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars([("HOLEGUARD_LOG_LEVEL", Some(level))], || {
                let matches = new().get_matches_from(vec!["holeguard", "status"]);
                assert_eq!(
                    matches.get_one::<u8>(ARG_VERBOSITY).copied(),
                    Some(index as u8)
                );
            });
        }
    }

    #[test]
    fn test_check_log_level_verbosity() {
        let levels = vec!["error", "warn", "info", "debug", "trace"];
        for (index, _) in levels.iter().enumerate() {
            temp_env::with_vars([("HOLEGUARD_LOG_LEVEL", None::<String>)], || {
                let mut args = vec!["holeguard".to_string(), "status".to_string()];

                // Add the appropriate number of "-v" flags based on the index
                if index > 0 {
                    args.push(format!("-{}", "v".repeat(index)));
                }

                let matches = new().get_matches_from(args);
                assert_eq!(
                    matches.get_one::<u8>(ARG_VERBOSITY).copied(),
                    Some(index as u8)
                );
            });
        }
    }

    #[test]
    fn test_blocking_args() {
        let matches = new().get_matches_from(vec![
            "holeguard", "blocking", "off", "--for", "300", "-i", "lab",
        ]);
        let blocking = matches.subcommand_matches("blocking");
        assert_eq!(
            blocking.and_then(|m| m.get_one::<String>("state").cloned()),
            Some("off".to_string())
        );
        assert_eq!(
            blocking.and_then(|m| m.get_one::<u64>("for").copied()),
            Some(300)
        );

        // a timer without a state is rejected
        assert!(new()
            .try_get_matches_from(vec!["holeguard", "blocking", "--for", "60"])
            .is_err());
    }

    #[test]
    fn test_instance_add_args() {
        let matches = new().get_matches_from(vec![
            "holeguard",
            "instance",
            "add",
            "http://pi.hole",
            "--name",
            "home",
            "--remember",
        ]);
        let add = matches
            .subcommand_matches("instance")
            .and_then(|m| m.subcommand_matches("add"));
        assert_eq!(
            add.and_then(|m| m.get_one::<String>("url").cloned()),
            Some("http://pi.hole".to_string())
        );
        assert!(add.is_some_and(|m| m.get_flag("remember")));
        assert!(add.is_some_and(|m| !m.get_flag("passwordless")));
    }
}
