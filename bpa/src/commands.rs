//! The `link` command surface: a thin parser mapping operator commands
//! onto contact-manager operations.
//!
//! Exit codes follow convention: 0 success, 1 usage error, 2 runtime
//! failure.

use super::*;
use link::LinkError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Usage(_) => 1,
            CommandError::Link(_) => 2,
        }
    }
}

const USAGE: &str = "link add|open|close|delete|set_available|reconfigure|set_cl_defaults|names|dump|state|stats ...";

fn parse_options(args: &[&str]) -> Result<Vec<(String, String)>, CommandError> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or(CommandError::Usage("options take the form opt=val"))
        })
        .collect()
}

/// Executes one `link` subcommand against the manager, returning its
/// output text.
pub fn link_command(
    manager: &Arc<ContactManager>,
    args: &[&str],
) -> Result<String, CommandError> {
    match args {
        ["add", name, nexthop, link_type, cl, opts @ ..] => {
            let link_type: LinkType = link_type.parse()?;
            let mut link = Link::new(name, nexthop, link_type, cl);
            for (option, value) in parse_options(opts)? {
                link.params.set(&option, &value)?;
            }
            manager.add_new_link(link)?;
            Ok(format!("link {name} added"))
        }
        ["open", name] => {
            manager.reopen_link(name)?;
            Ok(format!("link {name} opening"))
        }
        ["close", name] => {
            manager.with_link_mut(name, |link| {
                link.state = LinkState::Closed;
                link.contact = None;
            })?;
            Ok(format!("link {name} closed"))
        }
        ["delete", name] => {
            manager.del_link(name)?;
            Ok(format!("link {name} deleted"))
        }
        ["set_available", name, value] => {
            let available: bool = value
                .parse()
                .map_err(|_| CommandError::Usage("link set_available <name> true|false"))?;
            manager.with_link_mut(name, |link| {
                link.state = if available {
                    LinkState::Available
                } else {
                    LinkState::Unavailable
                };
            })?;
            Ok(String::new())
        }
        ["reconfigure", name, opts @ ..] => {
            let options = parse_options(opts)?;
            manager.with_link_mut(name, |link| {
                for (option, value) in options {
                    link.params.set(&option, &value)?;
                }
                Ok::<_, LinkError>(())
            })??;
            Ok(format!("link {name} reconfigured"))
        }
        ["set_cl_defaults", cl, opts @ ..] => {
            manager.set_cl_defaults(cl, parse_options(opts)?);
            Ok(String::new())
        }
        ["names"] => Ok(manager.link_names().join("\n")),
        ["dump"] => {
            let mut out = Vec::new();
            for name in manager.link_names() {
                out.push(manager.find_link(&name, |link| link.dump())?);
            }
            Ok(out.join("\n"))
        }
        ["dump", name] => Ok(manager.find_link(name, |link| link.dump())?),
        ["state", name] => Ok(manager.find_link(name, |link| format!("{:?}", link.state))?),
        ["stats", name] => Ok(manager.find_link(name, |link| {
            let s = &link.stats;
            format!(
                "contacts={} attempts={} bundles_tx={} bytes_tx={} cancelled={}",
                s.contacts,
                s.contact_attempts,
                s.bundles_transmitted,
                s.bytes_transmitted,
                s.bundles_cancelled,
            )
        })?),
        _ => Err(CommandError::Usage(USAGE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ContactManager> {
        let (tx, rx) = event::channel();
        // Commands are synchronous; nobody drains the queue in these tests
        drop(rx);
        ContactManager::new(tx)
    }

    #[test]
    fn add_dump_state_delete() {
        let mgr = manager();
        link_command(
            &mgr,
            &["add", "l1", "10.0.0.2:4556", "ondemand", "stream", "mtu=1400"],
        )
        .unwrap();

        assert_eq!(link_command(&mgr, &["names"]).unwrap(), "l1");
        assert!(link_command(&mgr, &["dump", "l1"]).unwrap().contains("ONDEMAND"));
        assert_eq!(link_command(&mgr, &["state", "l1"]).unwrap(), "Unavailable");

        link_command(&mgr, &["set_available", "l1", "true"]).unwrap();
        assert_eq!(link_command(&mgr, &["state", "l1"]).unwrap(), "Available");

        link_command(&mgr, &["delete", "l1"]).unwrap();
        assert!(matches!(
            link_command(&mgr, &["state", "l1"]),
            Err(CommandError::Link(_))
        ));
    }

    #[test]
    fn cl_defaults_apply_to_new_links() {
        let mgr = manager();
        link_command(&mgr, &["set_cl_defaults", "stream", "min_retry_interval=2"]).unwrap();
        link_command(&mgr, &["add", "l1", "peer:4556", "alwayson", "stream"]).unwrap();
        mgr.find_link("l1", |l| assert_eq!(l.params.min_retry_interval, 2))
            .unwrap();
    }

    #[test]
    fn usage_and_runtime_exit_codes() {
        let mgr = manager();
        let usage = link_command(&mgr, &["frobnicate"]).unwrap_err();
        assert_eq!(usage.exit_code(), 1);

        let runtime = link_command(&mgr, &["open", "nonexistent"]).unwrap_err();
        assert_eq!(runtime.exit_code(), 2);

        let bad_opts = link_command(
            &mgr,
            &["add", "l1", "peer:4556", "alwayson", "stream", "mtu"],
        )
        .unwrap_err();
        assert_eq!(bad_opts.exit_code(), 1);
    }

    #[test]
    fn reconfigure_changes_params() {
        let mgr = manager();
        link_command(&mgr, &["add", "l1", "peer:4556", "alwayson", "stream"]).unwrap();
        link_command(&mgr, &["reconfigure", "l1", "idle_close_time=9"]).unwrap();
        mgr.find_link("l1", |l| assert_eq!(l.params.idle_close_time, 9))
            .unwrap();
    }
}
