use crate::backend::{Backend, check, unsupported};
use crate::error::{ClassifiedError, Error, ErrorKind, Report, ReturnCode};
use crate::framed::{ForceTime, Function};
use crate::rpc::{CallResult, OncRpcStub, RC_LIST_PARTIAL, SmapiStub, Token};
use crate::types::{Image, ImageOp, Server};

/// Opens an RPC stub to a server.
pub type StubConnector =
    Box<dyn Fn(&Server) -> crate::error::Result<Box<dyn SmapiStub + Send>> + Send + Sync>;

const OPERATIONS: &[ImageOp] = &[
    ImageOp::Reset,
    ImageOp::Activate,
    ImageOp::Deactivate,
    ImageOp::GetStatus,
];

// Return codes of the SMAPI RPC service.
const RC_OK: i32 = 0;
const RCERR_TOKEN: i32 = 8;
const RCERR_SYNTAX: i32 = 24;
const RCERR_AUTH: i32 = 100;
const RCERR_USER_PW_BAD: i32 = 120;
const RCERR_PW_EXPIRED: i32 = 128;
const RCERR_IMAGEOP: i32 = 200;
const RCERR_INTERNAL: i32 = 396;
const RCERR_CONNECT: i32 = 2000;
const RS_ANY: i32 = -1;

const DESCRIPTIONS: &[(i32, i32, &str)] = &[
    (RC_OK, 0, "Request Successful"),
    (RC_OK, 12, "Image Not Active"),
    (RCERR_TOKEN, 0, "Session Token Not Valid"),
    (RCERR_SYNTAX, RS_ANY, "Syntax Error in Function Parameter"),
    (RCERR_AUTH, 8, "Request Not Authorized by External Security Manager"),
    (RCERR_AUTH, 16, "Request Not Authorized by Server"),
    (RCERR_USER_PW_BAD, 0, "Authentication Error; Userid or Password not valid"),
    (RCERR_PW_EXPIRED, 0, "Authentication Error; Password expired"),
    (RCERR_INTERNAL, RS_ANY, "Internal Server Error"),
    (RCERR_IMAGEOP, 4, "Image Not Found"),
    (RCERR_IMAGEOP, 8, "Image Already Active"),
    (RCERR_IMAGEOP, 12, "Image Not Active"),
    (RCERR_IMAGEOP, 16, "Image Being Deactivated"),
    (RCERR_IMAGEOP, 24, "List Not Found"),
    (RCERR_IMAGEOP, 28, "Some Images In List Not Activated"),
    (RCERR_IMAGEOP, 32, "Some Images In List Not Deactivated"),
    (RCERR_IMAGEOP, 36, "Some Images In List Not Recycled"),
    (RCERR_CONNECT, RS_ANY, "Connection Error"),
];

/// Description of an RPC return and reason code pair.
fn describe(rc: i32, rs: i32) -> String {
    DESCRIPTIONS
        .iter()
        .find(|(r, s, _)| *r == rc && (*s == rs || *s == RS_ANY))
        .map(|(_, _, d)| (*d).to_owned())
        .unwrap_or_else(|| format!("VM rc/rs = {rc}/{rs}"))
}

struct Session {
    stub: Box<dyn SmapiStub + Send>,
    token: Token,
}

/// z/VM backend over the RPC service.
pub struct VmBackend {
    connector: StubConnector,
    session: Option<Session>,
}

impl VmBackend {
    /// Backend connecting through the portmapper (or the configured port).
    pub fn new() -> Self {
        Self::with_connector(Box::new(|server: &Server| {
            let stub: Box<dyn SmapiStub + Send> = Box::new(OncRpcStub::connect(
                server.address(),
                server.port(),
                server.timeout(),
            )?);
            Ok(stub)
        }))
    }

    /// Backend using `connector` to open its stub.
    pub fn with_connector(connector: StubConnector) -> Self {
        Self {
            connector,
            session: None,
        }
    }

    fn close(&mut self) -> crate::error::Result<()> {
        match self.session.take() {
            Some(mut session) => session.stub.close(),
            None => Ok(()),
        }
    }
}

impl Default for VmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmBackend")
            .field("logged_in", &self.session.is_some())
            .finish()
    }
}

impl Backend for VmBackend {
    fn name(&self) -> &'static str {
        "VM"
    }

    fn operations(&self) -> &'static [ImageOp] {
        OPERATIONS
    }

    fn check(&self, server: &Server) -> Result<(), ClassifiedError> {
        check::check_vm(server)
    }

    fn login(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        // A second login replaces the previous connection.
        if let Err(err) = self.close() {
            let _ = &err;
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %err, "closing previous connection failed");
        }

        let mut stub = (self.connector)(server).map_err(|e| {
            ClassifiedError::new(
                ErrorKind::Connection,
                ReturnCode::ConnectionError,
                "connection error",
            )
            .context(format!("{}: {e}", server.address()))
        })?;

        let user = server.user().unwrap_or_default();
        let password = server.password().map(|p| p.expose()).unwrap_or_default();
        let result = match stub.login(user, password) {
            Ok(result) => result,
            Err(e) => {
                close_quietly(stub);
                return Err(rpc_error("LOGIN", &e));
            }
        };
        if result.rc != RC_OK {
            close_quietly(stub);
            return Err(ClassifiedError::new(
                ErrorKind::Authentication,
                ReturnCode::ConnectionError,
                format!(
                    "* login error({}/{}) : {}",
                    result.rc,
                    result.rs,
                    describe(result.rc, result.rs)
                ),
            ));
        }

        self.session = Some(Session {
            stub,
            token: result.token,
        });
        Ok(Report::new())
    }

    fn operate(
        &mut self,
        server: &Server,
        image: &Image,
        op: ImageOp,
    ) -> Result<Report, ClassifiedError> {
        let function = match op {
            ImageOp::Activate => Function::ImageActivate,
            ImageOp::Deactivate => Function::ImageDeactivate,
            ImageOp::Reset => Function::ImageRecycle,
            ImageOp::GetStatus => Function::ImageStatusQuery,
            _ => return Err(unsupported(self.name(), op)),
        };
        let force_time = (function == Function::ImageDeactivate).then(|| {
            if server.parms().force.is_on() {
                ForceTime::Immediate
            } else {
                ForceTime::Within(server.parms().shutdown_time_or_default())
            }
        });

        let session = self.session.as_mut().ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::Connection,
                ReturnCode::InternalError,
                format!("{}: not logged in", server.address()),
            )
        })?;
        let result = session
            .stub
            .image_call(function, &session.token, &image.name, force_time)
            .map_err(|e| rpc_error(rpc_name(function), &e))?;
        session.token = result.token;

        classify(function, image, &result)
    }

    fn logout(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        if let Some(session) = self.session.as_mut() {
            // The server drops the session with the connection anyway.
            if let Err(e) = session.stub.logout(&session.token) {
                let _ = &e;
                #[cfg(feature = "tracing")]
                tracing::debug!(server = server.address(), error = %e, "smapi logout failed");
            }
        }
        self.close().map_err(|e| {
            ClassifiedError::from_error(&e, ReturnCode::ConnectionError)
                .context(format!("{}: close failed", server.address()))
        })?;
        Ok(Report::new())
    }
}

fn classify(
    function: Function,
    image: &Image,
    result: &CallResult,
) -> Result<Report, ClassifiedError> {
    let name = function.printable();

    if result.rc == RC_LIST_PARTIAL {
        if let Some(list) = &result.failing {
            let verb = match function {
                Function::ImageActivate => "Activated",
                Function::ImageDeactivate => "Deactivated",
                _ => "Recycled",
            };
            let mut report = Report::warning(format!(
                "* NumImages{verb}={} NumImagesNot{verb}={}",
                list.processed, list.not_processed
            ));
            for failed in &list.images {
                report.push(format!(
                    "* {} rc={} reason={}",
                    failed.name, failed.rc, failed.rs
                ));
            }
            return Ok(report);
        }
    }

    if result.rc != RC_OK {
        return Err(ClassifiedError::new(
            ErrorKind::Command,
            ReturnCode::ConnectionError,
            format!(
                "* {name} : Image {} {}",
                image.name,
                describe(result.rc, result.rs)
            ),
        ));
    }

    let description = match function {
        // The reason code of a successful deactivate is the force time.
        Function::ImageDeactivate => describe(RC_OK, 0),
        Function::ImageStatusQuery if result.rs == 0 => "Image Active".to_owned(),
        _ => describe(result.rc, result.rs),
    };
    Ok(Report::ok(format!("* {name} : Image {} {description}", image.name)))
}

fn close_quietly(mut stub: Box<dyn SmapiStub + Send>) {
    if let Err(err) = stub.close() {
        let _ = &err;
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %err, "closing rejected connection failed");
    }
}

fn rpc_name(function: Function) -> &'static str {
    match function {
        Function::ImageActivate => "IMAGE_ACTIVATE",
        Function::ImageDeactivate => "IMAGE_DEACTIVATE",
        Function::ImageRecycle => "IMAGE_RECYCLE",
        Function::ImageStatusQuery => "IMAGE_STATUS_QUERY",
    }
}

fn rpc_error(function: &str, err: &Error) -> ClassifiedError {
    let kind = match err {
        Error::Timeout => ErrorKind::Timeout,
        Error::Protocol(_) | Error::ProtocolOwned(_) => ErrorKind::Protocol,
        _ => ErrorKind::Connection,
    };
    ClassifiedError::new(
        kind,
        ReturnCode::ConnectionError,
        format!("* Error calling {function} : {RCERR_INTERNAL} {err}"),
    )
}
