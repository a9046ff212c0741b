use serde::{Deserialize, Serialize};
use std::any::type_name;
use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

/// The single pattern recognized by the trace parser: `at METHOD` optionally
/// followed by `in FILE:line LINE`. Lines that do not match are dropped.
static FRAME_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^at\s+(?P<method>.+?)(?:\s+in\s+(?P<file>.+):line\s+(?P<line>\d+))?$")
        .expect("the frame pattern is a valid regular expression")
});

/// Captures the cause of a rejected delivery: the failure type, its message,
/// the chain of underlying causes, and a parsed stack trace.
///
/// A reason is built either from a plain message
/// ([`from_message`](RejectionReason::from_message)), from any value
/// implementing [`std::error::Error`] (via [`From`], which also powers the
/// `?` operator inside message handlers), or through the
/// [`of`](RejectionReason::of) factory when the failure type is known but no
/// value is at hand.
///
/// This type deliberately does not implement [`std::error::Error`] itself;
/// that is what makes the blanket [`From`] conversion possible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionReason {
    #[serde(default)]
    type_name: Option<String>,
    message: String,
    #[serde(default)]
    inner: Option<Box<RejectionReason>>,
    #[serde(default)]
    trace: Vec<TraceFrame>,
}

/// A single parsed stack frame of a [`RejectionReason`] trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFrame {
    /// The full trimmed line the frame was parsed from.
    pub source: String,
    /// The unqualified name of the containing type or module, if the method
    /// path had one.
    #[serde(default)]
    pub class: Option<String>,
    /// The remaining leading path of the method, if any.
    #[serde(default)]
    pub namespace: Option<String>,
    /// The method name. Never empty; lines without a method are dropped.
    pub method: String,
    /// The source file, when the line carried location information.
    #[serde(default)]
    pub file: Option<String>,
    /// The line number, when the line carried location information.
    #[serde(default)]
    pub line: Option<u32>,
}

impl RejectionReason {
    /// Creates a reason that carries a message and nothing else.
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            type_name: None,
            message: message.into(),
            inner: None,
            trace: Vec::new(),
        }
    }

    /// Creates a reason attributed to the failure type `E`, without requiring
    /// a value of that type.
    pub fn of<E>(message: impl Into<String>) -> Self
    where
        E: Error,
    {
        Self {
            type_name: Some(type_name::<E>().to_string()),
            message: message.into(),
            inner: None,
            trace: Vec::new(),
        }
    }

    /// Parses the given multi-line trace text and replaces the trace of this
    /// reason with the result.
    pub fn with_trace(mut self, trace: impl AsRef<str>) -> Self {
        self.trace = parse_trace(trace.as_ref());

        self
    }

    /// Recursively clears the trace of this reason and of all inner reasons.
    /// Useful before transporting the reason through a constrained medium.
    pub fn clear_trace(&mut self) {
        self.trace.clear();

        if let Some(inner) = self.inner.as_mut() {
            inner.clear_trace();
        }
    }
}

impl RejectionReason {
    /// Reports the recorded failure type, if one was captured.
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    /// Reports the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Exposes the underlying cause, if one was captured.
    pub fn inner(&self) -> Option<&RejectionReason> {
        self.inner.as_deref()
    }

    /// Exposes the parsed stack frames of this reason.
    pub fn trace(&self) -> &[TraceFrame] {
        &self.trace
    }
}

/// Builds a reason from any failure value: records the concrete type name and
/// message, converts the [`source`](Error::source) chain into nested inner
/// reasons, and captures the current stack.
impl<E> From<E> for RejectionReason
where
    E: Error,
{
    fn from(error: E) -> Self {
        let inner = error.source().map(|source| Box::new(reason_from_dyn(source)));
        let trace = capture_trace(type_name::<E>());

        Self {
            type_name: Some(type_name::<E>().to_string()),
            message: error.to_string(),
            inner,
            trace,
        }
    }
}

impl Display for RejectionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.type_name {
            Some(type_name) => write!(f, "{}: {}", type_name, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Walks one step of a `dyn Error` source chain. Concrete type names are not
/// recoverable behind the trait object.
fn reason_from_dyn(error: &(dyn Error + 'static)) -> RejectionReason {
    RejectionReason {
        type_name: None,
        message: error.to_string(),
        inner: error.source().map(|source| Box::new(reason_from_dyn(source))),
        trace: Vec::new(),
    }
}

/// Captures the current stack, normalizes it into `at METHOD in FILE:line N`
/// lines, and runs it through the one trace parser. When symbolication yields
/// nothing usable, the failure origin is recorded as a single frame.
fn capture_trace(origin: &str) -> Vec<TraceFrame> {
    let normalized = normalize_backtrace(&Backtrace::force_capture().to_string());
    let mut frames = parse_trace(&normalized);

    if frames.is_empty() {
        frames = parse_trace(&format!("at {}", origin));
    }

    frames
}

/// Rewrites the standard library backtrace rendering (`N: symbol` lines, each
/// optionally followed by an indented `at FILE:LINE:COL` line) into the
/// canonical `at METHOD in FILE:line N` shape.
fn normalize_backtrace(rendered: &str) -> String {
    let mut lines = Vec::new();

    for line in rendered.lines().map(str::trim) {
        if let Some((index, symbol)) = line.split_once(": ") {
            if index.chars().all(|character| character.is_ascii_digit()) {
                let symbol = symbol.trim();
                if !symbol.is_empty() {
                    lines.push(format!("at {}", symbol));
                }
                continue;
            }
        }

        if let Some(location) = line.strip_prefix("at ") {
            let location = location.trim();

            // Attach the location to the preceding symbol line, stripping the
            // trailing column number.
            if let Some(last) = lines.last_mut() {
                if !last.contains(" in ") {
                    if let Some((file, line_number)) = split_location(location) {
                        last.push_str(&format!(" in {}:line {}", file, line_number));
                    }
                }
            }
        }
    }

    lines.join("\n")
}

/// Splits a `FILE:LINE:COL` or `FILE:LINE` location into a file and a line
/// number.
fn split_location(location: &str) -> Option<(&str, u32)> {
    let (head, tail) = location.rsplit_once(':')?;
    let last_number = tail.parse::<u32>().ok()?;

    // The trailing number may be a column; when the preceding segment is also
    // numeric, that one is the line.
    if let Some((file, line)) = head.rsplit_once(':') {
        if let Ok(line_number) = line.parse::<u32>() {
            return Some((file, line_number));
        }
    }

    Some((head, last_number))
}

/// Parses trace text into frames, one line at a time, with the single frame
/// pattern. Entries without a parsed method are dropped.
pub(crate) fn parse_trace(trace: &str) -> Vec<TraceFrame> {
    trace
        .lines()
        .map(str::trim)
        .filter_map(parse_frame)
        .collect()
}

/// Parses a single trimmed line into a frame, if it matches the pattern.
fn parse_frame(line: &str) -> Option<TraceFrame> {
    let captures = FRAME_PATTERN.captures(line)?;

    let full_method = captures.name("method")?.as_str().trim();
    if full_method.is_empty() {
        return None;
    }

    let file = captures.name("file").map(|capture| capture.as_str().to_string());
    let line_number = captures
        .name("line")
        .and_then(|capture| capture.as_str().parse::<u32>().ok());

    let (namespace, class, method) = split_method(full_method);

    Some(TraceFrame {
        source: line.to_string(),
        class,
        namespace,
        method,
        file,
        line: line_number,
    })
}

/// Splits a fully qualified method path into its namespace, containing type
/// and method name. Understands both `::`-separated and `.`-separated paths;
/// a call-argument suffix is not considered part of the path.
fn split_method(full_method: &str) -> (Option<String>, Option<String>, String) {
    let path_end = full_method.find('(').unwrap_or(full_method.len());
    let (path, suffix) = full_method.split_at(path_end);

    let separator = if path.contains("::") { "::" } else { "." };
    let mut segments: Vec<&str> = path.split(separator).filter(|s| !s.is_empty()).collect();

    let method = match segments.pop() {
        Some(last) => format!("{}{}", last, suffix),
        None => full_method.to_string(),
    };
    let class = segments.pop().map(str::to_string);
    let namespace = if segments.is_empty() {
        None
    } else {
        Some(segments.join(separator))
    };

    (namespace, class, method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("outer failure")]
    struct OuterError {
        #[source]
        cause: InnerError,
    }

    #[derive(Error, Debug)]
    #[error("inner failure")]
    struct InnerError;

    #[test]
    fn builds_from_message() {
        // Given
        let reason = RejectionReason::from_message("went sideways");

        // Then
        assert_eq!("went sideways", reason.message());
        assert_eq!(None, reason.type_name());
        assert!(reason.trace().is_empty());
    }

    #[test]
    fn builds_from_failure_value() {
        // Given
        let error = OuterError { cause: InnerError };

        // When
        let reason = RejectionReason::from(error);

        // Then
        assert_eq!("outer failure", reason.message());
        assert!(reason.type_name().unwrap().contains("OuterError"));
        assert_eq!("inner failure", reason.inner().unwrap().message());
        assert!(!reason.trace().is_empty());
        assert!(!reason.trace()[0].method.is_empty());
    }

    #[test]
    fn parses_frames_with_and_without_location() {
        // Given
        let trace = concat!(
            "at service::queue::dispatch in /src/queue.rs:line 42\n",
            "at service::queue::poll\n",
            "this line is noise\n",
            "at \n",
        );

        // When
        let frames = parse_trace(trace);

        // Then
        assert_eq!(2, frames.len());
        assert_eq!("dispatch", frames[0].method);
        assert_eq!(Some("queue".to_string()), frames[0].class);
        assert_eq!(Some("service".to_string()), frames[0].namespace);
        assert_eq!(Some("/src/queue.rs".to_string()), frames[0].file);
        assert_eq!(Some(42), frames[0].line);
        assert_eq!("poll", frames[1].method);
        assert_eq!(None, frames[1].file);
    }

    #[test]
    fn parses_dot_separated_methods() {
        // Given
        let trace = "at Some.Namespace.Type.Method(String arg) in /app/File.cs:line 7";

        // When
        let frames = parse_trace(trace);

        // Then
        assert_eq!(1, frames.len());
        assert_eq!("Method(String arg)", frames[0].method);
        assert_eq!(Some("Type".to_string()), frames[0].class);
        assert_eq!(Some("Some.Namespace".to_string()), frames[0].namespace);
        assert_eq!(Some(7), frames[0].line);
    }

    #[test]
    fn normalizes_standard_backtrace_rendering() {
        // Given
        let rendered = concat!(
            "   0: courier::rejection::capture\n",
            "             at ./src/rejection.rs:101:20\n",
            "   1: tokio::runtime::task::poll\n",
        );

        // When
        let frames = parse_trace(&normalize_backtrace(rendered));

        // Then
        assert_eq!(2, frames.len());
        assert_eq!("capture", frames[0].method);
        assert_eq!(Some("./src/rejection.rs".to_string()), frames[0].file);
        assert_eq!(Some(101), frames[0].line);
        assert_eq!("poll", frames[1].method);
    }

    #[test]
    fn clears_traces_recursively() {
        // Given
        let error = OuterError { cause: InnerError };
        let mut reason = RejectionReason::from(error);
        reason.inner = Some(Box::new(
            RejectionReason::from_message("inner").with_trace("at some::frame"),
        ));

        // When
        reason.clear_trace();

        // Then
        assert!(reason.trace().is_empty());
        assert!(reason.inner().unwrap().trace().is_empty());
    }

    #[test]
    fn round_trips_through_json() {
        // Given
        let reason = RejectionReason::of::<InnerError>("inner failure")
            .with_trace("at service::queue::dispatch in /src/queue.rs:line 42");

        // When
        let json = serde_json::to_string(&reason).unwrap();
        let back: RejectionReason = serde_json::from_str(&json).unwrap();

        // Then
        assert_eq!(reason, back);
        assert!(json.contains("typeName"));
    }
}
