use crate::cli::{
    actions::{Action, BlockingChange},
    globals::{default_data_dir, GlobalArgs},
};
use anyhow::{anyhow, Result};
use std::{path::PathBuf, time::Duration};

fn globals(matches: &clap::ArgMatches) -> GlobalArgs {
    let data_dir = matches
        .get_one::<String>("data-dir")
        .map_or_else(default_data_dir, PathBuf::from);

    let seconds = |name: &str, fallback: Duration| {
        matches
            .get_one::<u64>(name)
            .map_or(fallback, |s| Duration::from_secs(*s))
    };

    let mut args = GlobalArgs::new(data_dir);
    args.timeout = seconds("timeout", args.timeout);
    args.keepalive_interval = seconds("keepalive-interval", args.keepalive_interval);
    args.safe_threshold = seconds("safe-threshold", args.safe_threshold);
    args.breaker_threshold = matches
        .get_one::<u32>("breaker-threshold")
        .copied()
        .unwrap_or(args.breaker_threshold);
    args.accept_invalid_certs = matches.get_flag("accept-invalid-certs");
    args
}

fn string(matches: &clap::ArgMatches, name: &str) -> Option<String> {
    matches.get_one::<String>(name).cloned()
}

fn required(matches: &clap::ArgMatches, name: &str) -> Result<String> {
    string(matches, name).ok_or_else(|| anyhow!("missing required argument: {name}"))
}

fn instance_action(matches: &clap::ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some(("add", m)) => Ok(Action::InstanceAdd {
            url: required(m, "url")?,
            name: string(m, "name"),
            passwordless: m.get_flag("passwordless"),
            remember: m.get_flag("remember"),
        }),
        Some(("list", _)) => Ok(Action::InstanceList),
        Some(("rename", m)) => Ok(Action::InstanceRename {
            instance: required(m, "instance")?,
            name: string(m, "name"),
        }),
        Some(("remove", m)) => Ok(Action::InstanceRemove {
            instance: required(m, "instance")?,
        }),
        Some(("activate", m)) => Ok(Action::InstanceActivate {
            instance: required(m, "instance")?,
        }),
        _ => Err(anyhow!("unknown instance subcommand")),
    }
}

/// Maps the parsed command line to the global settings and the action to run.
///
/// # Errors
/// Returns an error for an unknown subcommand or a missing argument.
pub fn handler(matches: &clap::ArgMatches) -> Result<(GlobalArgs, Action)> {
    let globals = globals(matches);

    let action = match matches.subcommand() {
        Some(("instance", m)) => instance_action(m)?,
        Some(("connect", m)) => Action::Connect {
            instance: string(m, "instance"),
            totp: string(m, "totp"),
            remember: m.get_flag("remember"),
        },
        Some(("disconnect", m)) => Action::Disconnect {
            instance: string(m, "instance"),
        },
        Some(("status", _)) => Action::Status,
        Some(("stats", m)) => Action::Stats {
            instance: string(m, "instance"),
        },
        Some(("blocking", m)) => Action::Blocking {
            instance: string(m, "instance"),
            change: string(m, "state").map(|state| BlockingChange {
                enabled: state == "on",
                timer: m.get_one::<u64>("for").copied(),
            }),
        },
        Some(("watch", _)) => Action::Watch,
        _ => return Err(anyhow!("no subcommand given, see --help")),
    };

    Ok((globals, action))
}
