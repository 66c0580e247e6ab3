use std::fmt::Display;

use thiserror::Error;

/// Errors surfaced by the sandbox, fabric, launcher and cluster.
#[derive(Debug, Error)]
pub enum Error {
    /// Namespace, bridge, tap or process creation failed. Usually privilege
    /// or host capability related.
    #[error("resource error: {0}")]
    Resource(String),

    /// Invalid disk spec, unsupported architecture pair, bad config file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An external helper exited non-zero.
    #[error("{step} failed: {stderr}")]
    ToolFailure { step: String, stderr: String },

    #[error("not found: {0}")]
    NotFound(String),

    /// A long-running process exited without being signaled.
    #[error("anomaly: {0}")]
    Anomaly(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Aggregate of every failure observed during a best-effort teardown.
    #[error("teardown finished with {} error(s): {}", .0.len(), .0.join("; "))]
    Teardown(Vec<String>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn resource(what: impl Display, err: impl Display) -> Self {
        Error::Resource(format!("{}: {}", what, err))
    }

    pub fn tool(step: impl Into<String>, stderr: impl AsRef<str>) -> Self {
        Error::ToolFailure {
            step: step.into(),
            stderr: stderr.as_ref().trim().to_string(),
        }
    }

    /// Prefix a tool failure's step with an outer step name. Other variants
    /// are wrapped into a tool failure carrying their message.
    pub fn in_step(self, step: &str) -> Self {
        match self {
            Error::ToolFailure { step: inner, stderr } => Error::ToolFailure {
                step: format!("{}: {}", step, inner),
                stderr,
            },
            other => Error::ToolFailure {
                step: step.to_string(),
                stderr: other.to_string(),
            },
        }
    }
}

/// `anyhow::Context`-style helpers that map foreign errors onto the typed
/// variants.
pub trait ResultExt<T> {
    fn resource(self, what: impl Display) -> Result<T>;
    fn configuration(self, what: impl Display) -> Result<T>;
}

impl<T, E: Display> ResultExt<T> for std::result::Result<T, E> {
    fn resource(self, what: impl Display) -> Result<T> {
        self.map_err(|e| Error::resource(what, e))
    }

    fn configuration(self, what: impl Display) -> Result<T> {
        self.map_err(|e| Error::Configuration(format!("{}: {}", what, e)))
    }
}

/// Collects failures from independent cleanup steps.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<String>);

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: impl Display, err: impl Display) {
        self.0.push(format!("{}: {}", step, err));
    }

    /// Record the error of `res`, if any.
    pub fn check<T, E: Display>(&mut self, step: impl Display, res: std::result::Result<T, E>) {
        if let Err(e) = res {
            self.push(step, e);
        }
    }

    /// Absorb the entries of a nested aggregate without double wrapping.
    pub fn extend_from(&mut self, step: impl Display, err: Error) {
        match err {
            Error::Teardown(inner) => self
                .0
                .extend(inner.into_iter().map(|e| format!("{}: {}", step, e))),
            other => self.push(step, other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(self.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_display_includes_step() {
        let err = Error::tool("qemu-img create", "  Could not open backing file\n");
        assert_eq!(
            err.to_string(),
            "qemu-img create failed: Could not open backing file"
        );
    }

    #[test]
    fn test_in_step_nests_step_names() {
        let err = Error::tool("findfs-label boot", "no such label").in_step("inject");
        match err {
            Error::ToolFailure { step, stderr } => {
                assert_eq!(step, "inject: findfs-label boot");
                assert_eq!(stderr, "no such label");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_error_list_aggregates() {
        let mut errs = ErrorList::new();
        assert!(errs.is_empty());
        errs.check("stop ntp", Ok::<(), String>(()));
        errs.check("stop discovery", Err::<(), _>("listener gone"));
        errs.extend_from(
            "machine abc",
            Error::Teardown(vec!["kill: no such process".into(), "tap: busy".into()]),
        );
        assert_eq!(errs.len(), 3);

        let err = errs.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("teardown finished with 3 error(s)"));
        assert!(msg.contains("stop discovery: listener gone"));
        assert!(msg.contains("machine abc: tap: busy"));
    }

    #[test]
    fn test_result_ext_maps_variants() {
        let res: std::result::Result<(), &str> = Err("EPERM");
        let err = res.resource("creating namespace").unwrap_err();
        assert!(matches!(err, Error::Resource(ref m) if m == "creating namespace: EPERM"));

        let res: std::result::Result<(), &str> = Err("bad size");
        assert!(matches!(
            res.configuration("disk").unwrap_err(),
            Error::Configuration(_)
        ));
    }
}
