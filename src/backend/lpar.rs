use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;

use crate::backend::{Backend, check, unsupported};
use crate::dialog::{self, Dialog};
use crate::error::{ClassifiedError, Error, ErrorKind, Report, ReturnCode};
use crate::event::{
    API_CODE_OFFSET, API_TIMEOUT, Ack, EventChannel, EventMask, EventSession, SnmpChannel,
    api_error_description, is_benign, oid,
};
use crate::observe;
use crate::record::{Cell, Record};
use crate::types::{Force, Image, ImageOp, ImageStatus, Parms, Server};

/// Opens an event channel to a server.
///
/// Shared with the dialog poller, which opens its own channel.
pub type ChannelConnector =
    Arc<dyn Fn(&Server) -> crate::error::Result<Box<dyn EventChannel + Send>> + Send + Sync>;

const OPERATIONS: &[ImageOp] = &[
    ImageOp::Reset,
    ImageOp::Activate,
    ImageOp::Deactivate,
    ImageOp::Stop,
    ImageOp::Load,
    ImageOp::ScsiLoad,
    ImageOp::ScsiDump,
    ImageOp::Dialog,
    ImageOp::List,
    ImageOp::GetStatus,
];

const DEFAULT_LOAD_TIMEOUT: u32 = 60;

#[derive(Debug)]
struct Handle {
    name: String,
    object: String,
    status: ImageStatus,
}

/// LPAR backend over the correlated event API.
pub struct LparBackend {
    connector: ChannelConnector,
    console: Option<Box<dyn BufRead + Send>>,
    output: Box<dyn Write + Send>,
    session: Option<EventSession>,
    handles: Vec<Handle>,
    cpc_images: Vec<String>,
}

impl LparBackend {
    /// Backend using the bundled SNMP channel, standard input and standard output.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(|server: &Server| {
            let channel: Box<dyn EventChannel + Send> = Box::new(SnmpChannel::connect(server)?);
            Ok(channel)
        }))
    }

    /// Backend using `connector` for every event channel it opens.
    pub fn with_connector(connector: ChannelConnector) -> Self {
        Self {
            connector,
            console: Some(Box::new(BufReader::new(io::stdin()))),
            output: Box::new(io::stdout()),
            session: None,
            handles: Vec::new(),
            cpc_images: Vec::new(),
        }
    }

    /// Read dialog commands from `console`.
    pub fn console(mut self, console: impl BufRead + Send + 'static) -> Self {
        self.console = Some(Box::new(console));
        self
    }

    /// Write dialog output to `output`.
    pub fn output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Box::new(output);
        self
    }

    fn session(&mut self) -> Result<&mut EventSession, ClassifiedError> {
        self.session.as_mut().ok_or_else(|| {
            ClassifiedError::new(
                ErrorKind::Connection,
                ReturnCode::InternalError,
                "event session is not open",
            )
        })
    }

    fn handle(&self, server: &Server, image: &Image) -> Result<&Handle, ClassifiedError> {
        self.handles
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(&image.name))
            .ok_or_else(|| mismatch(&image.name, server.address()))
    }

    fn submit(
        &mut self,
        image: &Image,
        op: ImageOp,
        target: &str,
        command: &str,
        params: &Record,
    ) -> Result<Report, ClassifiedError> {
        let ack = self
            .session()?
            .submit(target, command, params)
            .map_err(|e| event_failure(&format!("{}: {op}", image.name), e))?;

        match ack {
            Ack::Acknowledged => Ok(Report::ok(format!("{}: acknowledged.", image.name))),
            Ack::Failed { rc, text } => {
                let mut message = format!(
                    "{}: not acknowledged - command was not successful - rc is {rc}",
                    image.name
                );
                if let Some(text) = text {
                    message.push_str(" - ");
                    message.push_str(&text);
                }
                if is_benign(&message) {
                    observe::record_downgrade(&image.name, &message);
                    return Ok(Report::warning(message));
                }
                Err(ClassifiedError::new(
                    ErrorKind::Command,
                    ReturnCode::HwmcaProblem,
                    message,
                ))
            }
        }
    }
}

impl Default for LparBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LparBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LparBackend")
            .field("session", &self.session)
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

impl Backend for LparBackend {
    fn name(&self) -> &'static str {
        "LPAR"
    }

    fn operations(&self) -> &'static [ImageOp] {
        OPERATIONS
    }

    fn check(&self, server: &Server) -> Result<(), ClassifiedError> {
        check::check_lpar(server)
    }

    fn login(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        self.handles.clear();
        self.cpc_images.clear();

        let channel = (self.connector)(server)
            .map_err(|e| event_failure(&format!("{}: initialize", server.address()), e))?;
        let session = EventSession::open(channel, EventMask::CommandResponse, server.timeout())
            .map_err(|e| event_failure(&format!("{}: initialize", server.address()), e))?;
        // Stored first so logout terminates it even if discovery fails.
        self.session = Some(session);
        let listing = server.parms().op == Some(ImageOp::List);

        let group = format!("{}.{}", oid::CPC_IMAGE_GROUP, oid::GROUP_CONTENTS_SUFFIX);
        let contents = read_text(self.session()?, &group)?;

        for object in contents.split_whitespace() {
            let Some(name_id) = oid::image_attribute(object, oid::NAME_SUFFIX) else {
                continue;
            };
            let name = read_text(self.session()?, &name_id)?;
            self.cpc_images.push(name.clone());
            if listing {
                continue;
            }
            for image in server.images() {
                if !image.name.eq_ignore_ascii_case(&name) {
                    continue;
                }
                let status = read_status(self.session()?, object)?;
                #[cfg(feature = "tracing")]
                tracing::debug!(image = %image.name, object, ?status, "lpar identified");
                self.handles.push(Handle {
                    name: image.name.clone(),
                    object: object.to_owned(),
                    status,
                });
            }
        }

        if listing {
            return Ok(Report::new());
        }
        let missing: Vec<String> = server
            .images()
            .iter()
            .filter(|i| !self.handles.iter().any(|h| h.name == i.name))
            .map(|i| mismatch_message(&i.name, server.address()))
            .collect();
        if let Some((first, rest)) = missing.split_first() {
            let mut err = ClassifiedError::new(
                ErrorKind::Validation,
                ReturnCode::ServerImageMismatch,
                first.clone(),
            );
            for message in rest {
                err.push(message.clone());
            }
            return Err(err);
        }
        Ok(Report::new())
    }

    fn operate(
        &mut self,
        server: &Server,
        image: &Image,
        op: ImageOp,
    ) -> Result<Report, ClassifiedError> {
        let handle = self.handle(server, image)?;
        let target = handle.object.clone();
        let status = handle.status;
        let parms = server.parms();

        let (command, params) = match op {
            ImageOp::GetStatus => {
                return Ok(Report::ok(format!(
                    "status of {}: {}",
                    image.name,
                    status.flags().join(", ")
                )));
            }
            ImageOp::Dialog => {
                let console = self.console.take().ok_or_else(|| {
                    ClassifiedError::new(
                        ErrorKind::Connection,
                        ReturnCode::StdinProblem,
                        "console input is not available",
                    )
                })?;
                let dialog = Dialog {
                    server,
                    image,
                    target: &target,
                    connector: Arc::clone(&self.connector),
                };
                let session = self.session.as_mut().ok_or_else(|| {
                    ClassifiedError::new(
                        ErrorKind::Connection,
                        ReturnCode::InternalError,
                        "event session is not open",
                    )
                })?;
                return dialog::run(session, dialog, console, &mut *self.output);
            }
            ImageOp::List => return Err(unsupported(self.name(), op)),
            _ => command_params(op, parms),
        };
        self.submit(image, op, &target, command, &params)
    }

    fn list(&mut self, _server: &Server) -> Result<Vec<String>, ClassifiedError> {
        self.session()?;
        Ok(self.cpc_images.clone())
    }

    fn logout(&mut self, server: &Server) -> Result<Report, ClassifiedError> {
        self.handles.clear();
        let Some(mut session) = self.session.take() else {
            return Ok(Report::new());
        };
        session.close().map_err(|e| {
            ClassifiedError::from_error(&e, ReturnCode::HwmcaProblem).context(format!(
                "{}: shutdown of command snmp connection failed",
                server.address()
            ))
        })?;
        Ok(Report::new())
    }
}

/// Command object and parameter list of an image operation.
fn command_params(op: ImageOp, parms: &Parms) -> (&'static str, Record) {
    let force = Cell::Integer(i64::from(parms.force == Force::On));
    let text = |v: &Option<String>| Cell::text_or_null(v.as_deref());

    match op {
        ImageOp::Activate => (oid::ACTIVATE, Record::new(vec![text(&parms.profile), force])),
        ImageOp::Deactivate => (oid::DEACTIVATE, Record::new(vec![force])),
        ImageOp::Reset => (oid::RESET_CLEAR, Record::new(vec![force])),
        ImageOp::Stop => (oid::STOP, Record::default()),
        ImageOp::Load => {
            let store_status = parms.store_status.unwrap_or(false);
            let clear = parms.clear.unwrap_or(!store_status);
            (
                oid::LOAD,
                Record::new(vec![
                    text(&parms.load_address),
                    text(&parms.load_parms),
                    Cell::Integer(i64::from(clear)),
                    Cell::Integer(i64::from(
                        parms.load_timeout.unwrap_or(DEFAULT_LOAD_TIMEOUT),
                    )),
                    Cell::Integer(i64::from(store_status)),
                    force,
                ]),
            )
        }
        _ => {
            let command = if op == ImageOp::ScsiDump {
                oid::SCSI_DUMP
            } else {
                oid::SCSI_LOAD
            };
            (
                command,
                Record::new(vec![
                    text(&parms.load_address),
                    text(&parms.load_parms),
                    text(&parms.scsi_wwpn),
                    text(&parms.scsi_lun),
                    parms
                        .scsi_bps
                        .map_or(Cell::Null, |bps| Cell::Integer(i64::from(bps))),
                    text(&parms.scsi_ossparms),
                    text(&parms.scsi_bootrec),
                    force,
                ]),
            )
        }
    }
}

fn read_text(session: &mut EventSession, object: &str) -> Result<String, ClassifiedError> {
    let record = session
        .get(object)
        .map_err(|e| event_failure(&format!("read of {object}"), e))?;
    let text = record
        .text(1)
        .map_err(|e| protocol_failure(object, &e.to_string()))?;
    Ok(text.trim_end_matches('\0').to_owned())
}

fn read_status(session: &mut EventSession, object: &str) -> Result<ImageStatus, ClassifiedError> {
    let id = oid::image_attribute(object, oid::STATUS_SUFFIX)
        .ok_or_else(|| protocol_failure(object, "not an image object"))?;
    let record = session
        .get(&id)
        .map_err(|e| event_failure(&format!("read of {id}"), e))?;
    match record.get(1) {
        Ok(Cell::Integer(v)) => Ok(ImageStatus(*v as u32)),
        Ok(Cell::OctetString(b)) if b.len() == 4 => {
            Ok(ImageStatus(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
        }
        Ok(other) => Err(protocol_failure(
            &id,
            &format!("status has type {}", other.type_name()),
        )),
        Err(e) => Err(protocol_failure(&id, &e.to_string())),
    }
}

fn mismatch_message(image: &str, server: &str) -> String {
    format!("Given LPAR name {image} does not exist on {server}")
}

fn mismatch(image: &str, server: &str) -> ClassifiedError {
    ClassifiedError::new(
        ErrorKind::Validation,
        ReturnCode::ServerImageMismatch,
        mismatch_message(image, server),
    )
}

fn protocol_failure(object: &str, detail: &str) -> ClassifiedError {
    ClassifiedError::new(
        ErrorKind::Protocol,
        ReturnCode::InternalError,
        format!("unexpected response for {object}: {detail}"),
    )
}

/// Classify an event-channel error, keeping the offset API code in the message.
pub(crate) fn event_failure(context: &str, err: Error) -> ClassifiedError {
    match err {
        Error::Api(code) => {
            let kind = if code == API_TIMEOUT {
                ErrorKind::Timeout
            } else {
                ErrorKind::Command
            };
            ClassifiedError::new(
                kind,
                ReturnCode::HwmcaProblem,
                format!(
                    "{context} failed, return code is {} ({})",
                    api_error_description(code),
                    API_CODE_OFFSET + code
                ),
            )
        }
        Error::Timeout => ClassifiedError::new(
            ErrorKind::Timeout,
            ReturnCode::HwmcaProblem,
            format!("{context} failed, no response event received in time"),
        ),
        other => {
            let classified = ClassifiedError::from(other);
            ClassifiedError::new(
                classified.kind(),
                classified.code(),
                format!("{context} failed: {classified}"),
            )
        }
    }
}
