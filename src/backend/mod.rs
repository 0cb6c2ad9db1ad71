//! Backend modules and the registry that resolves a server type to one.

pub mod check;
mod lpar;
mod vm;
mod vm5;

use std::io::{self, BufRead, Write};

use crate::error::{ClassifiedError, ErrorKind, Report, ReturnCode};
use crate::types::{Image, ImageOp, Server};

pub(crate) use lpar::event_failure;
pub use lpar::{ChannelConnector, LparBackend};
pub use vm::{StubConnector, VmBackend};
pub use vm5::{TransportConnector, Vm5Backend};

/// Result of an interactive certificate confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The operator accepted the certificate.
    Accepted,
    /// The operator declined the certificate.
    Rejected,
    /// The backend has nothing to confirm; callers treat this as trusted.
    Unsupported,
}

/// Asks an operator whether a presented certificate is trusted.
pub trait Prompt {
    /// Show `fingerprint` for `server` and return whether it was accepted.
    fn confirm_fingerprint(&mut self, server: &str, fingerprint: &str) -> io::Result<bool>;
}

impl<F> Prompt for F
where
    F: FnMut(&str, &str) -> io::Result<bool>,
{
    fn confirm_fingerprint(&mut self, server: &str, fingerprint: &str) -> io::Result<bool> {
        self(server, fingerprint)
    }
}

/// Prompt on standard error, answer read from standard input.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompt;

impl Prompt for ConsolePrompt {
    fn confirm_fingerprint(&mut self, _server: &str, fingerprint: &str) -> io::Result<bool> {
        let mut err = io::stderr().lock();
        writeln!(err, "sslfingerprint = {fingerprint}")?;
        writeln!(err, "Do you accept the server certificate? (type yes)")?;
        writeln!(
            err,
            "(sslfingerprints can be added to snipl config file to prevent this question)"
        )?;
        err.flush()?;

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer)? == 0 {
            return Ok(false);
        }
        Ok(answer.trim().eq_ignore_ascii_case("yes"))
    }
}

/// The capability set every backend module provides.
///
/// The session manager calls these in lifecycle order: `prepare`, `check`,
/// `login` (then `confirm` when the certificate is untrusted), `operate` or
/// `list`, and finally `logout`, which must tolerate every earlier failure.
pub trait Backend: Send {
    /// Module name, used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Operations this module implements.
    fn operations(&self) -> &'static [ImageOp];

    /// Whether `op` is one of [`Backend::operations`].
    fn supports(&self, op: ImageOp) -> bool {
        self.operations().contains(&op)
    }

    /// Backend-specific setup before validation.
    fn prepare(&mut self, _server: &Server) -> Result<(), ClassifiedError> {
        Ok(())
    }

    /// Structural validation; no I/O.
    fn check(&self, server: &Server) -> Result<(), ClassifiedError>;

    /// Open the session.
    fn login(&mut self, server: &Server) -> Result<Report, ClassifiedError>;

    /// Ask the operator to accept an untrusted certificate.
    fn confirm(
        &mut self,
        _server: &Server,
        _prompt: &mut dyn Prompt,
    ) -> Result<Confirmation, ClassifiedError> {
        Ok(Confirmation::Unsupported)
    }

    /// Run one image operation.
    fn operate(
        &mut self,
        server: &Server,
        image: &Image,
        op: ImageOp,
    ) -> Result<Report, ClassifiedError>;

    /// Names of every image the server manages.
    fn list(&mut self, _server: &Server) -> Result<Vec<String>, ClassifiedError> {
        Err(unsupported(self.name(), ImageOp::List))
    }

    /// Tear the session down. Must be safe to call when nothing is open.
    fn logout(&mut self, server: &Server) -> Result<Report, ClassifiedError>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name()).finish()
    }
}

pub(crate) fn unsupported(backend: &str, op: ImageOp) -> ClassifiedError {
    ClassifiedError::new(
        ErrorKind::Unsupported,
        ReturnCode::ConflictingOptions,
        format!("operation {op} is not provided by the {backend} module"),
    )
}

/// Builds a fresh backend instance.
pub type Factory = Box<dyn Fn() -> Box<dyn Backend> + Send + Sync>;

/// Maps server type tags (case-insensitive) to backend factories.
pub struct Registry {
    entries: Vec<(String, Factory)>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// A registry with the LPAR, VM and VM5 modules.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("LPAR", || Box::new(LparBackend::new()));
        registry.register("VM", || Box::new(VmBackend::new()));
        registry.register("VM5", || Box::new(Vm5Backend::new()));
        registry
    }

    /// Register (or replace) the factory for `tag`.
    pub fn register<F>(&mut self, tag: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Backend> + Send + Sync + 'static,
    {
        let tag = tag.into();
        match self
            .entries
            .iter_mut()
            .find(|(t, _)| t.eq_ignore_ascii_case(&tag))
        {
            Some(entry) => entry.1 = Box::new(factory),
            None => self.entries.push((tag, Box::new(factory))),
        }
    }

    /// Whether a factory is registered for `tag`.
    pub fn contains(&self, tag: &str) -> bool {
        self.entries.iter().any(|(t, _)| t.eq_ignore_ascii_case(tag))
    }

    /// Instantiate the backend for `tag`.
    pub fn create(&self, tag: &str) -> Result<Box<dyn Backend>, ClassifiedError> {
        self.entries
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(tag))
            .map(|(_, factory)| factory())
            .ok_or_else(|| {
                ClassifiedError::new(
                    ErrorKind::ModuleLoad,
                    ReturnCode::LibLoadProblem,
                    format!("Modulename for type {tag} not found"),
                )
            })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(t, _)| t))
            .finish()
    }
}
