//! Built-in `/hyscript` command for operators.
//!
//! ```text
//! /hyscript reload          config.json, then scripts
//! /hyscript reloadconfig    config.json only
//! /hyscript reloadscripts   scripts only
//! ```
//!
//! Every report line is logged and echoed to the sender.

use crate::diagnostics::{self, Feedback};
use crate::host::{CommandInvocation, CommandKind, CommandOutcome, CommandSpec, HostCommand};
use crate::runtime::manager::{ReloadTrigger, WeakScriptHost};

/// Root name of the admin command.
pub const ADMIN_COMMAND: &str = "hyscript";

/// Permission required to run it.
pub const ADMIN_PERMISSION: &str = "hyscript.self";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Reload,
    ReloadConfig,
    ReloadScripts,
}

impl Action {
    const ALL: [Action; 3] = [Action::Reload, Action::ReloadConfig, Action::ReloadScripts];

    fn name(self) -> &'static str {
        match self {
            Action::Reload => "reload",
            Action::ReloadConfig => "reloadconfig",
            Action::ReloadScripts => "reloadscripts",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Action::Reload => "Reload config.json and every script",
            Action::ReloadConfig => "Reload config.json",
            Action::ReloadScripts => "Reload every script",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name().eq_ignore_ascii_case(name))
    }
}

/// The `/hyscript` collection.
#[derive(Debug)]
pub struct AdminCommand {
    host: WeakScriptHost,
}

impl AdminCommand {
    pub(crate) fn new(host: WeakScriptHost) -> Self {
        Self { host }
    }

    fn run(&self, action: Action, feedback: Option<&dyn Feedback>) {
        let Some(host) = self.host.upgrade() else {
            diagnostics::report(log::Level::Warn, "Script host is gone", feedback);
            return;
        };

        if matches!(action, Action::Reload | Action::ReloadConfig) {
            match host.reload_config() {
                Ok(config) => diagnostics::report(
                    log::Level::Info,
                    &format!(
                        "Configuration reloaded (hot reload {}, TypeScript {})",
                        on_off(config.is_hot_reload_enabled),
                        on_off(config.enable_typescript)
                    ),
                    feedback,
                ),
                Err(e) => diagnostics::report(log::Level::Error, &format!("Config reload failed: {e:#}"), feedback),
            }
        }

        if matches!(action, Action::Reload | Action::ReloadScripts) {
            match host.reload_with(ReloadTrigger::Command) {
                Ok(report) => {
                    for (level, line) in report.messages() {
                        if let Some(feedback) = feedback {
                            feedback.send(level, &line);
                        }
                    }
                }
                Err(e) => diagnostics::report(log::Level::Error, &format!("Reload failed: {e:#}"), feedback),
            }
        }
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

impl HostCommand for AdminCommand {
    fn spec(&self) -> CommandSpec {
        CommandSpec {
            name: ADMIN_COMMAND.to_string(),
            description: "Manage the scripting runtime".to_string(),
            kind: CommandKind::Collection,
            aliases: vec!["hs".to_string()],
            permission: Some(ADMIN_PERMISSION.to_string()),
            requires_confirmation: false,
            args: Vec::new(),
            subcommands: Action::ALL
                .into_iter()
                .map(|action| CommandSpec {
                    name: action.name().to_string(),
                    description: action.description().to_string(),
                    kind: CommandKind::Plain,
                    aliases: Vec::new(),
                    permission: None,
                    requires_confirmation: false,
                    args: Vec::new(),
                    subcommands: Vec::new(),
                })
                .collect(),
        }
    }

    fn execute(&self, path: &[String], invocation: CommandInvocation) -> CommandOutcome {
        let [sub] = path else {
            return CommandOutcome::NoHandler;
        };
        let Some(action) = Action::parse(sub) else {
            return CommandOutcome::NoHandler;
        };
        self.run(action, invocation.feedback.as_deref());
        CommandOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_shape() {
        let spec = AdminCommand::new(WeakScriptHost::dangling()).spec();
        assert_eq!(spec.kind, CommandKind::Collection);
        assert_eq!(spec.aliases, ["hs"]);
        let names: Vec<&str> = spec.subcommands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["reload", "reloadconfig", "reloadscripts"]);
        assert!(spec.subcommands.iter().all(|c| c.permission.is_none()));
    }

    #[test]
    fn test_unknown_path_has_no_handler() {
        let admin = AdminCommand::new(WeakScriptHost::dangling());
        assert!(matches!(
            admin.execute(&["nope".to_string()], CommandInvocation::default()),
            CommandOutcome::NoHandler
        ));
        assert!(matches!(admin.execute(&[], CommandInvocation::default()), CommandOutcome::NoHandler));
    }
}
