use crate::backend::{Backend, Confirmation, Prompt, check, unsupported};
use crate::crypto;
use crate::error::{ClassifiedError, ErrorKind, Report, ReturnCode};
use crate::framed::{ForceTime, FramedClient, Function, Request};
use crate::transport::{TcpTransport, Transport};
use crate::types::{Image, ImageOp, Server};

/// Opens the stream to a server on the given port.
pub type TransportConnector = Box<
    dyn Fn(&Server, u16) -> crate::error::Result<Box<dyn Transport + Send>> + Send + Sync,
>;

const OPERATIONS: &[ImageOp] = &[
    ImageOp::Reset,
    ImageOp::Activate,
    ImageOp::Deactivate,
    ImageOp::GetStatus,
];

const RS_ANY: i32 = -1;

const DESCRIPTIONS: &[(i32, i32, &str)] = &[
    (0, 0, "Request Successful"),
    (0, 300, "Request Successful"),
    (0, 12, "Image Not Active"),
    (24, RS_ANY, "Syntax Error in Function Parameter"),
    (100, 8, "Request Not Authorized by External Security Manager"),
    (100, 16, "Request Not Authorized by Server"),
    (120, 0, "Authentication Error; Userid or Password not valid"),
    (128, 0, "Authentication Error; Password expired"),
    (200, 4, "Image Not Found"),
    (200, 8, "Image Already Active"),
    (200, 12, "Image Not Active"),
    (200, 16, "Image Being Deactivated"),
    (200, 24, "List Not Found"),
    (200, 28, "Some Images In List Not Activated"),
    (200, 32, "Some Images In List Not Deactivated"),
    (200, 36, "Some Images In List Not Recycled"),
    (900, RS_ANY, "server error"),
];

fn describe(rc: i32, rs: i32) -> String {
    DESCRIPTIONS
        .iter()
        .find(|(r, s, _)| *r == rc && (*s == rs || *s == RS_ANY))
        .map(|(_, _, d)| (*d).to_owned())
        .unwrap_or_else(|| format!("VM rc/rs = {rc}/{rs}"))
}

/// z/VM backend over the socket-based service, optionally TLS-wrapped.
///
/// The service is stateless: every request carries the credentials, so
/// "login" only opens the stream and settles certificate trust.
pub struct Vm5Backend {
    connector: TransportConnector,
    client: Option<FramedClient<Box<dyn Transport + Send>>>,
    trusted: bool,
}

impl Vm5Backend {
    /// Backend connecting over TCP.
    pub fn new() -> Self {
        Self::with_connector(Box::new(|server: &Server, port: u16| {
            let transport: Box<dyn Transport + Send> = Box::new(TcpTransport::connect(
                server.address(),
                port,
                server.encryption(),
                server.timeout(),
            )?);
            Ok(transport)
        }))
    }

    /// Backend using `connector` to open its stream.
    pub fn with_connector(connector: TransportConnector) -> Self {
        Self {
            connector,
            client: None,
            trusted: false,
        }
    }

    fn presented_fingerprint(&self) -> Option<String> {
        self.client
            .as_ref()
            .and_then(|c| c.transport().peer_fingerprint())
            .map(str::to_owned)
    }
}

impl Default for Vm5Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Vm5Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm5Backend")
            .field("connected", &self.client.is_some())
            .field("trusted", &self.trusted)
            .finish()
    }
}

impl Backend for Vm5Backend {
    fn name(&self) -> &'static str {
        "VM5"
    }

    fn operations(&self) -> &'static [ImageOp] {
        OPERATIONS
    }

    fn check(&self, server: &Server) -> Result<(), ClassifiedError> {
        check::check_vm(server)
    }

    fn login(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        let port = server.port().ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::Validation,
                ReturnCode::InvalidParameterValue,
                format!("Error: missing Port for VM server {}", server.address()),
            )
        })?;

        if let Some(old) = self.client.take() {
            shutdown_quietly(old, "previous connection");
        }
        self.trusted = false;

        let transport = (self.connector)(server, port).map_err(|e| {
            ClassifiedError::from(e).context(format!("{}: connection error", server.address()))
        })?;
        self.client = Some(FramedClient::new(transport));

        if !server.encryption() {
            self.trusted = true;
            return Ok(Report::new());
        }

        let Some(presented) = self.presented_fingerprint() else {
            self.client = None;
            return Err(ClassifiedError::new(
                ErrorKind::Connection,
                ReturnCode::ConnectionError,
                format!("{}: no peer certificate presented", server.address()),
            ));
        };

        match server.fingerprint() {
            Some(pinned) if crypto::fingerprints_match(pinned, &presented) => {
                self.trusted = true;
                Ok(Report::new())
            }
            Some(_) => {
                if let Some(client) = self.client.take() {
                    shutdown_quietly(client, "mismatched peer");
                }
                Err(ClassifiedError::new(
                    ErrorKind::CertificateMismatch,
                    ReturnCode::ConnectionError,
                    format!("{}: security issue: fingerprints do not match!", server.address()),
                ))
            }
            // The stream stays open for the confirmation step.
            None => Err(ClassifiedError::new(
                ErrorKind::CertificateUntrusted,
                ReturnCode::ConnectionError,
                format!(
                    "{}: Undefined local fingerprint of certificate.",
                    server.address()
                ),
            )),
        }
    }

    fn confirm(
        &mut self,
        server: &Server,
        prompt: &mut dyn Prompt,
    ) -> Result<Confirmation, ClassifiedError> {
        if !server.encryption() {
            return Ok(Confirmation::Unsupported);
        }
        let presented = self.presented_fingerprint().ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::Connection,
                ReturnCode::ConnectionError,
                format!("{}: not connected", server.address()),
            )
        })?;
        let accepted = prompt
            .confirm_fingerprint(server.address(), &presented)
            .map_err(|e| {
                ClassifiedError::new(
                    ErrorKind::Connection,
                    ReturnCode::StdinProblem,
                    format!("cannot read confirmation: {e}"),
                )
            })?;
        if accepted {
            self.trusted = true;
            Ok(Confirmation::Accepted)
        } else {
            Ok(Confirmation::Rejected)
        }
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
        if !self.trusted {
            return Err(ClassifiedError::new(
                ErrorKind::CertificateUntrusted,
                ReturnCode::ConnectionError,
                format!("{}: certificate has not been accepted", server.address()),
            ));
        }
        let client = self.client.as_mut().ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::Connection,
                ReturnCode::InternalError,
                format!("{}: not logged in", server.address()),
            )
        })?;

        let force_time = (function == Function::ImageDeactivate).then(|| {
            if server.parms().force.is_on() {
                ForceTime::Immediate
            } else {
                ForceTime::Within(server.parms().shutdown_time_or_default())
            }
        });
        let request = Request {
            function,
            user: server.user().unwrap_or_default(),
            password: server.password().map(|p| p.expose()).unwrap_or_default(),
            target: &image.name,
            force_time,
        };
        let header = client
            .call(&request)
            .map_err(|e| {
                ClassifiedError::from(e)
                    .context(format!("* Error calling {}", function.as_str()))
            })?
            .header;

        let description = if function == Function::ImageStatusQuery && header.rc == 0 && header.rs == 0
        {
            "Image Active".to_owned()
        } else {
            describe(header.rc, header.rs)
        };
        let message = format!("* {} : Image {} {description}", function.printable(), image.name);
        if header.rc != 0 {
            return Err(ClassifiedError::new(
                ErrorKind::Command,
                ReturnCode::ConnectionError,
                message,
            ));
        }
        Ok(Report::ok(message))
    }

    fn logout(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        self.trusted = false;
        match self.client.take() {
            Some(mut client) => client.shutdown().map(|()| Report::new()).map_err(|e| {
                ClassifiedError::from(e).context(format!("{}: close failed", server.address()))
            }),
            None => Ok(Report::new()),
        }
    }
}

fn shutdown_quietly(mut client: FramedClient<Box<dyn Transport + Send>>, which: &str) {
    if let Err(err) = client.shutdown() {
        let _ = (&err, which);
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %err, which, "framed connection shutdown failed");
    }
}
