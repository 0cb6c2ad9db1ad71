use std::time::Instant;

use crate::backend::{Backend, Confirmation, ConsolePrompt, Prompt, Registry};
use crate::error::{ClassifiedError, ErrorKind, Report, ReturnCode};
use crate::observe;
use crate::types::{Image, ImageOp, Server, ServerType};

/// Lifecycle position of a [`SessionManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No module resolved yet.
    New,
    /// A backend module has been instantiated.
    ModuleLoaded,
    /// The module accepted the server.
    Prepared,
    /// A session is open.
    LoggedIn,
    /// The session has been torn down.
    LoggedOut,
}

/// Resolves a server to its backend module and drives the session lifecycle.
///
/// A manager handles one server at a time. [`SessionManager::run`] performs the
/// whole sequence; the individual steps are public for callers that need to
/// interleave their own work.
pub struct SessionManager {
    registry: Registry,
    prompt: Box<dyn Prompt + Send>,
    backend: Option<Box<dyn Backend>>,
    state: State,
    confirmed: bool,
}

impl SessionManager {
    /// Manager with the built-in modules and a console prompt.
    pub fn new() -> Self {
        Self::with_registry(Registry::with_defaults())
    }

    /// Manager resolving types through `registry`.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            prompt: Box::new(ConsolePrompt),
            backend: None,
            state: State::New,
            confirmed: false,
        }
    }

    /// Replace the certificate confirmation prompt.
    pub fn prompt(mut self, prompt: impl Prompt + Send + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Name of the loaded backend module.
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(|b| b.name())
    }

    /// Resolve and prepare the module for the server's declared type.
    ///
    /// A module loaded earlier is logged out and dropped first.
    pub fn prepare(&mut self, server: &Server) -> Result<(), ClassifiedError> {
        self.load(server, server.declared_type())
    }

    fn load(&mut self, server: &Server, tag: &str) -> Result<(), ClassifiedError> {
        if let Some(mut old) = self.backend.take() {
            if let Err(err) = old.logout(server) {
                let _ = &err;
                #[cfg(feature = "tracing")]
                tracing::debug!(backend = old.name(), error = %err, "logout of replaced backend failed");
            }
        }
        self.state = State::New;
        self.confirmed = false;

        let mut backend = self.registry.create(tag)?;
        self.state = State::ModuleLoaded;
        backend.prepare(server)?;
        self.backend = Some(backend);
        self.state = State::Prepared;
        Ok(())
    }

    /// Validate the server's parameter set without any I/O.
    pub fn check(&self, server: &Server) -> Result<(), ClassifiedError> {
        let backend = self.loaded()?;
        let op = requested_op(server)?;
        if op != ImageOp::List && server.images().is_empty() {
            return Err(ClassifiedError::new(
                ErrorKind::Validation,
                ReturnCode::MissingImageName,
                format!("Error: no image name specified for {op} operation"),
            ));
        }
        if op == ImageOp::Dialog && server.images().len() > 1 {
            return Err(ClassifiedError::new(
                ErrorKind::Validation,
                ReturnCode::MoreThanOneImage,
                "More than one image name specified for dialog operation.",
            ));
        }
        backend.check(server)?;
        if !backend.supports(op) {
            return Err(crate::backend::unsupported(backend.name(), op));
        }
        Ok(())
    }

    /// Open the session.
    ///
    /// An untrusted certificate is offered to the prompt once per session. For
    /// declared type VM any other login failure is retried once with the VM5
    /// module before it is reported.
    pub fn login(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        let first = self.login_confirmed(server);
        let err = match first {
            Ok(report) => {
                self.state = State::LoggedIn;
                return Ok(report);
            }
            Err(err) => err,
        };

        let fallback = server
            .declared_type()
            .eq_ignore_ascii_case(ServerType::Vm.as_str())
            && self.backend_name() == Some("VM")
            && !err.kind().is_certificate();
        if !fallback {
            return Err(err);
        }

        observe::record_fallback(server.address(), "VM", "VM5");
        let earlier = err.messages().to_vec();
        self.load(server, ServerType::Vm5.as_str())
            .map_err(|e| e.preceded_by(earlier.clone()))?;
        self.loaded()?
            .check(server)
            .map_err(|e| e.preceded_by(earlier.clone()))?;
        let report = self
            .login_confirmed(server)
            .map_err(|e| e.preceded_by(earlier))?;
        self.state = State::LoggedIn;
        Ok(report)
    }

    fn login_confirmed(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        let backend = self.loaded_mut()?;
        let err = match backend.login(server) {
            Ok(report) => return Ok(report),
            Err(err) => err,
        };
        if err.kind() != ErrorKind::CertificateUntrusted || self.confirmed {
            return Err(err);
        }

        self.confirmed = true;
        let mut report = Report::new();
        for message in err.messages() {
            report.push(message.clone());
        }
        let backend = self.backend.as_mut().ok_or_else(not_prepared)?;
        match backend.confirm(server, self.prompt.as_mut())? {
            Confirmation::Accepted | Confirmation::Unsupported => Ok(report),
            Confirmation::Rejected => Err(ClassifiedError::new(
                ErrorKind::CertificateRejected,
                ReturnCode::ConnectionError,
                "Certificate was not accepted",
            )
            .preceded_by(report.into_messages())),
        }
    }

    /// Run the requested operation on one image.
    pub fn operate(&mut self, server: &Server, image: &Image) -> Result<Report, ClassifiedError> {
        let op = requested_op(server)?;
        self.logged_in()?;
        let backend = self.loaded_mut()?;
        if !backend.supports(op) {
            return Err(crate::backend::unsupported(backend.name(), op));
        }

        let started = Instant::now();
        let name = backend.name();
        let result = backend.operate(server, image, op);
        match &result {
            Ok(_) => observe::record_ok(name, op.as_str(), started.elapsed()),
            Err(err) => observe::record_err(name, op.as_str(), started.elapsed(), err),
        }
        result
    }

    /// Names of every image the server manages.
    pub fn list(&mut self, server: &Server) -> Result<Vec<String>, ClassifiedError> {
        self.logged_in()?;
        let backend = self.loaded_mut()?;
        let started = Instant::now();
        let name = backend.name();
        let result = backend.list(server);
        match &result {
            Ok(_) => observe::record_ok(name, ImageOp::List.as_str(), started.elapsed()),
            Err(err) => observe::record_err(name, ImageOp::List.as_str(), started.elapsed(), err),
        }
        result
    }

    /// Tear the session down. Safe to call in any state and more than once.
    pub fn logout(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        if self.state == State::LoggedOut {
            return Ok(Report::new());
        }
        self.state = State::LoggedOut;
        match self.backend.as_mut() {
            Some(backend) => backend.logout(server),
            None => Ok(Report::new()),
        }
    }

    /// Prepare, check, log in, operate on every image (or list them) and log out.
    ///
    /// Logout always runs and its messages are merged into the outcome. Every
    /// image is attempted; when several fail, the last failure is returned with
    /// the messages of all earlier steps in front of its own.
    pub fn run(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        let op = requested_op(server)?;
        self.prepare(server)?;
        self.check(server)?;

        let outcome = self.login(server).and_then(|report| {
            if op == ImageOp::List {
                self.list_into(server, report)
            } else {
                self.operate_all(server, report)
            }
        });

        let logout = self.logout(server);
        match (outcome, logout) {
            (Ok(mut report), Ok(closing)) => {
                report.merge(closing);
                Ok(report)
            }
            (Ok(report), Err(err)) => Err(err.preceded_by(report.into_messages())),
            (Err(mut err), Ok(closing)) => {
                for message in closing.into_messages() {
                    err.push(message);
                }
                Err(err)
            }
            (Err(err), Err(_)) => Err(err),
        }
    }

    fn list_into(&mut self, server: &Server, mut report: Report) -> Result<Report, ClassifiedError> {
        for name in self.list(server)? {
            report.push(name);
        }
        Ok(report)
    }

    fn operate_all(&mut self, server: &Server, mut report: Report) -> Result<Report, ClassifiedError> {
        // Each RPC session only serves a single image call.
        let relogin = self.backend_name() == Some("VM");
        let mut failure: Option<ClassifiedError> = None;

        for (i, image) in server.images().iter().enumerate() {
            if i > 0 && relogin {
                if let Err(err) = self.login_confirmed(server) {
                    failure = Some(chain(failure, &mut report, err));
                    break;
                }
            }
            match self.operate(server, image) {
                Ok(done) => report.merge(done),
                Err(err) => failure = Some(chain(failure, &mut report, err)),
            }
        }

        match failure {
            None => Ok(report),
            Some(mut err) => {
                for message in report.into_messages() {
                    err.push(message);
                }
                Err(err)
            }
        }
    }

    fn loaded(&self) -> Result<&dyn Backend, ClassifiedError> {
        self.backend.as_deref().ok_or_else(not_prepared)
    }

    fn loaded_mut(&mut self) -> Result<&mut Box<dyn Backend>, ClassifiedError> {
        self.backend.as_mut().ok_or_else(not_prepared)
    }

    fn logged_in(&self) -> Result<(), ClassifiedError> {
        if self.state == State::LoggedIn {
            return Ok(());
        }
        Err(ClassifiedError::new(
            ErrorKind::Command,
            ReturnCode::InternalError,
            format!("no open session (state {:?})", self.state),
        ))
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.registry)
            .field("backend", &self.backend_name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn requested_op(server: &Server) -> Result<ImageOp, ClassifiedError> {
    server.parms().op.ok_or_else(|| {
        ClassifiedError::new(
            ErrorKind::Validation,
            ReturnCode::NoCommand,
            "No command specified",
        )
    })
}

// The newest failure wins; everything reported before it is kept in front.
fn chain(
    previous: Option<ClassifiedError>,
    report: &mut Report,
    err: ClassifiedError,
) -> ClassifiedError {
    let mut messages = previous
        .map(|p| p.messages().to_vec())
        .unwrap_or_default();
    messages.extend(std::mem::take(report).into_messages());
    err.preceded_by(messages)
}

fn not_prepared() -> ClassifiedError {
    ClassifiedError::new(
        ErrorKind::Command,
        ReturnCode::InternalError,
        "no backend module loaded",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Parms;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls(Vec<String>);

    struct Scripted {
        name: &'static str,
        calls: Arc<Mutex<Calls>>,
        login: fn() -> Result<Report, ClassifiedError>,
    }

    impl Backend for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn operations(&self) -> &'static [ImageOp] {
            &[ImageOp::Activate, ImageOp::List]
        }

        fn check(&self, _: &Server) -> Result<(), ClassifiedError> {
            Ok(())
        }

        fn login(&mut self, _: &Server) -> Result<Report, ClassifiedError> {
            self.calls.lock().expect("lock").0.push(format!("{} login", self.name));
            (self.login)()
        }

        fn operate(
            &mut self,
            _: &Server,
            image: &Image,
            op: ImageOp,
        ) -> Result<Report, ClassifiedError> {
            self.calls
                .lock()
                .expect("lock")
                .0
                .push(format!("{} {op} {}", self.name, image.name));
            if image.name == "BAD" {
                return Err(ClassifiedError::new(
                    ErrorKind::Command,
                    ReturnCode::HwmcaProblem,
                    "BAD failed",
                ));
            }
            Ok(Report::ok(format!("{} done", image.name)))
        }

        fn list(&mut self, _: &Server) -> Result<Vec<String>, ClassifiedError> {
            Ok(vec!["A".into(), "B".into()])
        }

        fn logout(&mut self, _: &Server) -> Result<Report, ClassifiedError> {
            self.calls.lock().expect("lock").0.push(format!("{} logout", self.name));
            Ok(Report::new())
        }
    }

    fn refused() -> Result<Report, ClassifiedError> {
        Err(ClassifiedError::new(
            ErrorKind::Connection,
            ReturnCode::ConnectionError,
            "connection error",
        ))
    }

    fn accepted() -> Result<Report, ClassifiedError> {
        Ok(Report::new())
    }

    fn manager(
        calls: &Arc<Mutex<Calls>>,
        vm_login: fn() -> Result<Report, ClassifiedError>,
    ) -> SessionManager {
        let mut registry = Registry::new();
        let c = Arc::clone(calls);
        registry.register("VM", move || {
            Box::new(Scripted {
                name: "VM",
                calls: Arc::clone(&c),
                login: vm_login,
            })
        });
        let c = Arc::clone(calls);
        registry.register("VM5", move || {
            Box::new(Scripted {
                name: "VM5",
                calls: Arc::clone(&c),
                login: accepted,
            })
        });
        SessionManager::with_registry(registry)
    }

    fn server(op: Option<ImageOp>, images: &[&str]) -> Server {
        server_of("VM", op, images)
    }

    fn server_of(kind: &str, op: Option<ImageOp>, images: &[&str]) -> Server {
        let mut builder = Server::builder("zvm", kind).user("MAINT").password("pw");
        builder = builder.parms(Parms {
            op,
            ..Parms::default()
        });
        for image in images {
            builder = builder.image(*image);
        }
        builder.build().expect("server")
    }

    #[test]
    fn vm_login_failure_falls_back_once() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut manager = manager(&calls, refused);
        let report = manager
            .run(&server(Some(ImageOp::Activate), &["LINUX1"]))
            .expect("run");
        assert_eq!(report.messages(), ["LINUX1 done"]);
        assert_eq!(manager.backend_name(), Some("VM5"));
        assert_eq!(
            calls.lock().expect("lock").0,
            ["VM login", "VM logout", "VM5 login", "VM5 activate LINUX1", "VM5 logout"]
        );
    }

    #[test]
    fn rpc_backend_logs_in_again_between_images() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut manager = manager(&calls, accepted);
        manager
            .run(&server(Some(ImageOp::Activate), &["A", "B"]))
            .expect("run");
        assert_eq!(
            calls.lock().expect("lock").0,
            ["VM login", "VM activate A", "VM login", "VM activate B", "VM logout"]
        );
    }

    #[test]
    fn failing_image_does_not_stop_the_run() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut manager = manager(&calls, accepted);
        let server = server_of("VM5", Some(ImageOp::Activate), &["BAD", "GOOD"]);
        let err = manager.run(&server).expect_err("one image failed");
        assert_eq!(err.code(), ReturnCode::HwmcaProblem);
        assert_eq!(err.messages(), ["BAD failed", "GOOD done"]);
        assert_eq!(manager.state(), State::LoggedOut);
    }

    #[test]
    fn missing_op_and_list() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut manager = manager(&calls, accepted);
        let err = manager.run(&server(None, &["A"])).expect_err("no op");
        assert_eq!(err.code(), ReturnCode::NoCommand);
        assert_eq!(manager.state(), State::New);

        let report = manager.run(&server(Some(ImageOp::List), &[])).expect("list");
        assert_eq!(report.messages(), ["A", "B"]);
    }

    #[test]
    fn unsupported_operation_is_rejected_before_login() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut manager = manager(&calls, accepted);
        let err = manager
            .run(&server(Some(ImageOp::Stop), &["A"]))
            .expect_err("stop");
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert!(calls.lock().expect("lock").0.is_empty());
    }

    #[test]
    fn logout_is_idempotent() {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let mut manager = manager(&calls, accepted);
        let server = server(Some(ImageOp::Activate), &["A"]);
        manager.logout(&server).expect("nothing loaded");
        manager.prepare(&server).expect("prepare");
        manager.login(&server).expect("login");
        manager.logout(&server).expect("logout");
        manager.logout(&server).expect("again");
        assert_eq!(calls.lock().expect("lock").0, ["VM login", "VM logout"]);
    }
}
