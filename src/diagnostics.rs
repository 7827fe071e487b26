//! Guest failure reporting.
//!
//! Every guest throw, whether during script evaluation or inside a
//! registered callback, is turned into a [`GuestFailure`] here. When the
//! engine reports a source position the failure renders as
//! `[<file>:<line>:<col>] <message>` followed by the guest frames of the
//! call stack; otherwise it renders as an unattributed internal failure.
//!
//! Reports go to the `log` facade and, for interactively triggered
//! operations, to a [`Feedback`] sink as well.

use std::fmt;

use rquickjs::convert::Coerced;
use rquickjs::{Ctx, Value};

/// File name QuickJS assigns to sources passed through `Ctx::eval`.
const ENGINE_SCRIPT_NAME: &str = "eval_script";

/// A line/column pair reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
    /// 1-based line.
    pub line: u32,
    /// 1-based column, when the engine provides one.
    pub column: Option<u32>,
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.column {
            Some(column) => write!(f, "{}:{}", self.line, column),
            None => write!(f, "{}", self.line),
        }
    }
}

/// A structured guest failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestFailure {
    /// Script file the failing code belongs to, if known.
    pub origin: Option<String>,
    /// The thrown message.
    pub message: String,
    /// Position of the innermost guest frame.
    pub position: Option<SourcePosition>,
    /// Guest-only stack frames, innermost first. Native frames are elided.
    pub frames: Vec<String>,
}

impl GuestFailure {
    /// A failure with no guest position, such as a conversion error raised
    /// by the bridge itself.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            origin: None,
            message: message.into(),
            position: None,
            frames: Vec::new(),
        }
    }

    /// Whether this failure carries a guest source position.
    pub fn is_attributed(&self) -> bool {
        self.position.is_some()
    }

    fn with_origin(mut self, origin: Option<&str>) -> Self {
        if let Some(origin) = origin {
            self.frames = self
                .frames
                .into_iter()
                .map(|frame| frame.replace(ENGINE_SCRIPT_NAME, origin))
                .collect();
            self.origin = Some(origin.to_string());
        }
        self
    }
}

impl fmt::Display for GuestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.position {
            Some(position) => {
                let origin = self.origin.as_deref().unwrap_or("<unknown>");
                write!(f, "[{origin}:{position}] {}", self.message)?;
                for frame in &self.frames {
                    write!(f, "\n    at {frame}")?;
                }
                Ok(())
            }
            None => write!(f, "internal failure: {}", self.message),
        }
    }
}

impl std::error::Error for GuestFailure {}

/// Capture the failure behind an rquickjs error.
///
/// For `Error::Exception` the pending exception is taken from the context;
/// any other error variant is a host-side problem and becomes an internal
/// failure.
pub(crate) fn capture(ctx: &Ctx<'_>, error: &rquickjs::Error, origin: Option<&str>) -> GuestFailure {
    if !error.is_exception() {
        return GuestFailure::internal(error.to_string());
    }
    from_thrown(&ctx.catch(), origin)
}

/// Describe a thrown guest value.
pub(crate) fn from_thrown(thrown: &Value<'_>, origin: Option<&str>) -> GuestFailure {
    let Some(object) = thrown.as_object() else {
        return GuestFailure::internal(describe(thrown));
    };

    let message = object
        .get::<_, Value>("message")
        .ok()
        .filter(|v| !v.is_undefined())
        .map_or_else(|| describe(thrown), |v| describe(&v));
    let stack = object
        .get::<_, Option<String>>("stack")
        .ok()
        .flatten()
        .unwrap_or_default();
    let frames = guest_frames(&stack);

    // Syntax errors carry their position as properties; runtime errors only
    // through the stack.
    let position = object
        .get::<_, Option<u32>>("lineNumber")
        .ok()
        .flatten()
        .map(|line| SourcePosition {
            line,
            column: object.get::<_, Option<u32>>("columnNumber").ok().flatten(),
        })
        .or_else(|| frames.iter().find_map(|frame| parse_location(frame)));

    GuestFailure {
        origin: None,
        message,
        position,
        frames,
    }
    .with_origin(origin)
}

pub(crate) fn describe(value: &Value<'_>) -> String {
    value
        .get::<Coerced<String>>()
        .map_or_else(|_| format!("<{}>", value.type_name()), |s| s.0)
}

/// Extract guest frames from an engine stack trace.
///
/// Accepts both `at fn (file:line:col)` and `at file:line` shapes and drops
/// frames whose location is native code.
pub(crate) fn guest_frames(stack: &str) -> Vec<String> {
    stack
        .lines()
        .filter_map(|line| line.trim().strip_prefix("at "))
        .filter(|frame| {
            let location = frame_location(frame);
            location != "native" && !location.starts_with("<native>")
        })
        .map(str::to_string)
        .collect()
}

fn frame_location(frame: &str) -> &str {
    match (frame.rfind('('), frame.ends_with(')')) {
        (Some(open), true) => &frame[open + 1..frame.len() - 1],
        _ => frame,
    }
}

/// Parse the `line[:col]` suffix of a frame location.
pub(crate) fn parse_location(frame: &str) -> Option<SourcePosition> {
    let location = frame_location(frame);
    let mut parts = location.rsplit(':');
    let last = parts.next()?.parse::<u32>().ok()?;
    match parts.next().and_then(|p| p.parse::<u32>().ok()) {
        Some(line) => Some(SourcePosition {
            line,
            column: Some(last),
        }),
        None => Some(SourcePosition {
            line: last,
            column: None,
        }),
    }
}

/// Receives report lines for an interactively triggered operation, such as
/// the sender of a manual reload command.
pub trait Feedback: Send + Sync {
    /// Deliver one report line.
    fn send(&self, level: log::Level, message: &str);
}

/// Log a report and echo it to `feedback` when one is attached.
pub fn report(level: log::Level, message: &str, feedback: Option<&dyn Feedback>) {
    log::log!(level, "{message}");
    if let Some(feedback) = feedback {
        feedback.send(level, message);
    }
}
