//! Guest commands.
//!
//! One [`CommandStub`] per root command name is registered with the host.
//! Each `addCommand*` call parses its descriptor tree into a [`CommandSpec`]
//! (what the host builds usage and argument parsing from) plus a parallel
//! tree of parked guest descriptors used at execution time. Re-registering a
//! name after a reload replaces the spec on the existing stub.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rquickjs::{Ctx, Object, Value};
use tokio::sync::oneshot;

use super::ActiveRegistrations;
use crate::host::{
    ArgMode, ArgSpec, ArgType, CommandInvocation, CommandKind, CommandOutcome, CommandSpec, ExtensionHost,
    HostCommand, PlayerContext,
};
use crate::runtime::invoke::{BindScope, GuestRef, Invocation, Invoker};
use crate::value::HostValue;

// ── Deferred execution ───────────────────────────────────────────────

/// Runs plain command bodies off the calling thread.
///
/// Uses the host's tokio runtime when one was supplied, otherwise a named
/// OS thread per job.
#[derive(Debug, Clone, Default)]
pub struct DeferredExecutor {
    handle: Option<tokio::runtime::Handle>,
}

impl DeferredExecutor {
    /// Executor backed by `handle`, or by plain threads when `None`.
    pub fn new(handle: Option<tokio::runtime::Handle>) -> Self {
        Self { handle }
    }

    /// Schedule `job`; the receiver fires once it has run.
    ///
    /// If the job cannot be scheduled the sender is dropped and the
    /// receiver resolves to an error.
    pub fn spawn(&self, label: &str, job: impl FnOnce() + Send + 'static) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let run = move || {
            job();
            let _ = tx.send(());
        };
        match &self.handle {
            Some(handle) => {
                handle.spawn_blocking(run);
            }
            None => {
                if let Err(e) = std::thread::Builder::new()
                    .name(format!("hyscript-cmd-{label}"))
                    .spawn(run)
                {
                    log::error!("Failed to spawn thread for command '{label}': {e}");
                }
            }
        }
        rx
    }
}

// ── Descriptor tree ──────────────────────────────────────────────────

/// Executable side of one command node.
#[derive(Debug, Clone)]
struct CommandNode {
    name: String,
    aliases: Vec<String>,
    kind: CommandKind,
    descriptor: GuestRef,
    has_execute: bool,
    children: Vec<CommandNode>,
}

impl CommandNode {
    fn find(&self, path: &[String]) -> Option<&CommandNode> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self
                .children
                .iter()
                .find(|c| &c.name == head || c.aliases.iter().any(|a| a == head))
                .and_then(|c| c.find(rest)),
        }
    }
}

fn text<'js>(object: &Object<'js>, key: &str) -> rquickjs::Result<Option<String>> {
    let value: Value = object.get(key)?;
    match value.as_string() {
        Some(s) => Ok(Some(s.to_string()?)),
        None => Ok(None),
    }
}

fn flag<'js>(object: &Object<'js>, key: &str) -> rquickjs::Result<Option<bool>> {
    let value: Value = object.get(key)?;
    Ok(value.as_bool())
}

fn kind_of_tag(tag: Option<&str>) -> CommandKind {
    match tag {
        Some("player") => CommandKind::Player,
        Some("collection") => CommandKind::Collection,
        _ => CommandKind::Plain,
    }
}

/// Parse one argument declaration.
///
/// `required: true` wins; otherwise `default: true` makes it a defaulted
/// argument. Everything else, including a missing `required`, is optional.
fn parse_arg<'js>(object: &Object<'js>) -> rquickjs::Result<Option<ArgSpec>> {
    let Some(name) = text(object, "name")? else {
        return Ok(None);
    };
    let description = text(object, "description")?.unwrap_or_default();
    let mode = if flag(object, "required")? == Some(true) {
        ArgMode::Required
    } else if flag(object, "default")? == Some(true) {
        ArgMode::Default {
            value: default_text(object)?,
            description: text(object, "defaultValueDescription")?.unwrap_or_else(|| description.clone()),
        }
    } else {
        ArgMode::Optional
    };
    Ok(Some(ArgSpec {
        name,
        description,
        arg_type: ArgType::parse(text(object, "type")?.as_deref().unwrap_or("string")),
        mode,
    }))
}

/// `defaultValue` in textual form; numbers and booleans are stringified.
fn default_text<'js>(object: &Object<'js>) -> rquickjs::Result<String> {
    let value: Value = object.get("defaultValue")?;
    if let Some(s) = value.as_string() {
        return s.to_string();
    }
    if let Some(b) = value.as_bool() {
        return Ok(b.to_string());
    }
    if let Some(n) = value.as_number() {
        return Ok(if n.fract() == 0.0 { format!("{}", n as i64) } else { n.to_string() });
    }
    Ok(String::new())
}

/// Parse a descriptor and its `subCommands`, parking every node.
fn parse_node<'js>(
    ctx: &Ctx<'js>,
    scope: &BindScope,
    descriptor: Object<'js>,
    kind: CommandKind,
    fallback_name: Option<&str>,
) -> rquickjs::Result<Option<(CommandSpec, CommandNode)>> {
    let Some(name) = text(&descriptor, "name")?.or_else(|| fallback_name.map(str::to_string)) else {
        return Ok(None);
    };

    let aliases: Vec<String> = match descriptor.get::<_, Value>("aliases")?.as_array() {
        Some(list) => list
            .iter::<Value>()
            .filter_map(|v| v.ok().and_then(|v| v.as_string().and_then(|s| s.to_string().ok())))
            .collect(),
        None => Vec::new(),
    };

    let mut args = Vec::new();
    if let Some(list) = descriptor.get::<_, Value>("args")?.as_array() {
        for item in list.iter::<Value>() {
            let item = item?;
            match item.as_object().map(parse_arg).transpose()?.flatten() {
                Some(arg) => args.push(arg),
                None => log::warn!("[{}] command '{name}': argument without a name ignored", scope.origin()),
            }
        }
    }

    let mut subcommands = Vec::new();
    let mut children = Vec::new();
    if let Some(map) = descriptor.get::<_, Value>("subCommands")?.as_object() {
        for key in map.keys::<String>() {
            let key = key?;
            let Some(child) = map.get::<_, Value>(key.as_str())?.into_object() else {
                continue;
            };
            let child_kind = kind_of_tag(text(&child, "type")?.as_deref());
            if let Some((spec, node)) = parse_node(ctx, scope, child, child_kind, Some(&key))? {
                subcommands.push(spec);
                children.push(node);
            }
        }
    }

    let has_execute = descriptor.get::<_, Value>("execute")?.is_function();
    if kind == CommandKind::Collection && has_execute {
        log::debug!("[{}] collection '{name}' has an execute body; ignored", scope.origin());
    }

    let spec = CommandSpec {
        name: name.clone(),
        description: text(&descriptor, "description")?.unwrap_or_default(),
        kind,
        aliases: aliases.clone(),
        permission: text(&descriptor, "permission")?,
        requires_confirmation: flag(&descriptor, "requiresConfirmation")?.unwrap_or(false),
        args,
        subcommands,
    };
    let node = CommandNode {
        name,
        aliases,
        kind,
        descriptor: scope.park(ctx, descriptor.into_value())?,
        has_execute: has_execute && kind != CommandKind::Collection,
        children,
    };
    Ok(Some((spec, node)))
}

// ── Stub ─────────────────────────────────────────────────────────────

/// Durable host command for one root name.
pub struct CommandStub {
    spec: RwLock<CommandSpec>,
    active: ActiveRegistrations<Arc<CommandNode>>,
    invoker: Arc<Invoker>,
    deferred: DeferredExecutor,
}

impl std::fmt::Debug for CommandStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStub")
            .field("name", &self.spec().name)
            .finish_non_exhaustive()
    }
}

impl CommandStub {
    /// Latest live registration; stale ones are pruned on the way.
    fn current(&self) -> Option<Arc<CommandNode>> {
        let mut latest = None;
        self.active.for_each_live(&self.invoker, |r| {
            latest = Some(Arc::clone(&r.payload));
            Invocation::Returned(HostValue::Null)
        });
        latest
    }
}

impl HostCommand for CommandStub {
    fn spec(&self) -> CommandSpec {
        self.spec.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn execute(&self, path: &[String], invocation: CommandInvocation) -> CommandOutcome {
        let Some(root) = self.current() else {
            return CommandOutcome::NoHandler;
        };
        let Some(node) = root.find(path) else {
            return CommandOutcome::NoHandler;
        };
        if !node.has_execute {
            return CommandOutcome::NoHandler;
        }

        let CommandInvocation {
            context,
            args,
            player,
            feedback,
        } = invocation;
        let args = HostValue::Map(args);

        match node.kind {
            CommandKind::Collection => CommandOutcome::NoHandler,
            CommandKind::Player => {
                let PlayerContext {
                    store,
                    entity_ref,
                    player_ref,
                    world,
                } = player.unwrap_or_default();
                let outcome = self.invoker.invoke(
                    &node.descriptor,
                    Some("execute"),
                    &[context, args, store, entity_ref, player_ref, world],
                );
                if let (Invocation::Failed(failure), Some(feedback)) = (&outcome, &feedback) {
                    feedback.send(log::Level::Error, &failure.to_string());
                }
                CommandOutcome::Completed
            }
            CommandKind::Plain => {
                let invoker = Arc::clone(&self.invoker);
                let descriptor = node.descriptor.clone();
                let rx = self.deferred.spawn(&node.name, move || {
                    let outcome = invoker.invoke(&descriptor, Some("execute"), &[context, args]);
                    if let (Invocation::Failed(failure), Some(feedback)) = (&outcome, &feedback) {
                        feedback.send(log::Level::Error, &failure.to_string());
                    }
                });
                CommandOutcome::Deferred(rx)
            }
        }
    }
}

// ── Proxy ────────────────────────────────────────────────────────────

/// Proxy for `addCommand`, `addPlayerCommand` and `addCommandCollection`.
pub(crate) struct CommandProxy {
    host: Arc<dyn ExtensionHost>,
    invoker: Arc<Invoker>,
    deferred: DeferredExecutor,
    stubs: Mutex<HashMap<String, Arc<CommandStub>>>,
}

impl std::fmt::Debug for CommandProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandProxy").finish_non_exhaustive()
    }
}

impl CommandProxy {
    pub(crate) fn new(host: Arc<dyn ExtensionHost>, invoker: Arc<Invoker>, deferred: DeferredExecutor) -> Self {
        Self {
            host,
            invoker,
            deferred,
            stubs: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add<'js>(
        &self,
        ctx: &Ctx<'js>,
        scope: &BindScope,
        kind: CommandKind,
        descriptor: Object<'js>,
    ) -> rquickjs::Result<bool> {
        let Some((spec, node)) = parse_node(ctx, scope, descriptor, kind, None)? else {
            log::warn!("[{}] command descriptor without a name ignored", scope.origin());
            return Ok(false);
        };
        let name = spec.name.clone();

        let (stub, created) = {
            let mut stubs = self.stubs.lock().unwrap_or_else(PoisonError::into_inner);
            match stubs.get(&name) {
                Some(stub) => (Arc::clone(stub), false),
                None => {
                    let stub = Arc::new(CommandStub {
                        spec: RwLock::new(spec.clone()),
                        active: ActiveRegistrations::default(),
                        invoker: Arc::clone(&self.invoker),
                        deferred: self.deferred.clone(),
                    });
                    stubs.insert(name.clone(), Arc::clone(&stub));
                    (stub, true)
                }
            }
        };

        *stub.spec.write().unwrap_or_else(PoisonError::into_inner) = spec;
        stub.active.push(node.descriptor.clone(), Arc::new(node));

        if created {
            log::debug!("Registering command /{name}");
            self.host.register_command(stub);
        }
        Ok(true)
    }

    pub(crate) fn stub(&self, name: &str) -> Option<Arc<CommandStub>> {
        self.stubs.lock().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    pub(crate) fn reload(&self) {
        for stub in self.stubs.lock().unwrap_or_else(PoisonError::into_inner).values() {
            stub.active.clear();
        }
    }

    pub(crate) fn shutdown(&self) {
        self.reload();
        self.stubs.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::engine::GuestEngine;

    fn parse(source: &str, kind: CommandKind) -> CommandSpec {
        let engine = GuestEngine::new().unwrap();
        let runtime = engine.create_runtime(1).unwrap();
        let scope = BindScope::new(1);
        runtime.with(|ctx| {
            scope.install(&ctx).unwrap();
            let descriptor: Object = ctx.eval(source).unwrap();
            parse_node(&ctx, &scope, descriptor, kind, None).unwrap().unwrap().0
        })
    }

    #[test]
    fn test_args_keep_declaration_order() {
        let spec = parse(
            r#"({
                name: 'give',
                args: [
                    { name: 'note', required: false },
                    { name: 'amount', type: 'integer', default: true, defaultValue: 1, description: 'how many' },
                    { name: 'target', type: 'playerRef', required: true },
                    { name: 'item', required: true, default: true },
                ],
                execute() {},
            })"#,
            CommandKind::Plain,
        );
        let names: Vec<_> = spec.args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["note", "amount", "target", "item"]);
        assert_eq!(spec.args[0].mode, ArgMode::Optional);
        assert_eq!(
            spec.args[1].mode,
            ArgMode::Default {
                value: "1".to_string(),
                description: "how many".to_string()
            }
        );
        assert_eq!(spec.args[2].arg_type, ArgType::PlayerRef);
        assert_eq!(spec.args[2].mode, ArgMode::Required);
        assert_eq!(spec.args[3].mode, ArgMode::Required);
    }

    #[test]
    fn test_arg_without_required_is_optional() {
        let spec = parse(
            r#"({ name: 'warp', args: [{ name: 'where', type: 'string' }], execute() {} })"#,
            CommandKind::Plain,
        );
        assert_eq!(spec.args.len(), 1);
        assert_eq!(spec.args[0].mode, ArgMode::Optional);
    }

    #[test]
    fn test_subcommands_use_key_when_unnamed() {
        let spec = parse(
            r#"({
                name: 'zone',
                permission: 'zone.admin',
                subCommands: {
                    add: { type: 'player', execute() {} },
                    list: { name: 'ls', aliases: ['l'], execute() {} },
                },
            })"#,
            CommandKind::Collection,
        );
        assert_eq!(spec.kind, CommandKind::Collection);
        assert_eq!(spec.subcommands.len(), 2);
        assert_eq!(spec.subcommands[0].name, "add");
        assert_eq!(spec.subcommands[0].kind, CommandKind::Player);
        assert_eq!(spec.subcommands[0].permission, None);
        assert!(spec.find(&["l".to_string()]).is_some());
    }

    #[test]
    fn test_deferred_executor_signals_completion() {
        let executor = DeferredExecutor::default();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let rx = executor.spawn("test", move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
        rx.blocking_recv().unwrap();
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
