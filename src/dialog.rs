//! Interactive operating-system console of an LPAR image.
//!
//! A poller thread waits for console message events on its own event
//! channel and forwards the ones addressed to the image. A reader thread
//! turns console lines into commands. Both feed one `mpsc` channel that the
//! calling thread drains; it owns the command session and the output.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::backend::ChannelConnector;
use crate::error::{ClassifiedError, Error, ErrorKind, Report, ReturnCode};
use crate::event::{Ack, EventMask, EventSession, OpsysMessage, oid};
use crate::record::{Cell, Record};
use crate::types::{DEFAULT_MSG_TIMEOUT, Image, Server};

pub(crate) const RECONNECT_NOTICE: &str = "snipl reconnect necessary, possible data loss!";

const OPSYS_PRIORITY: i64 = 0;

pub(crate) struct Dialog<'a> {
    pub(crate) server: &'a Server,
    pub(crate) image: &'a Image,
    pub(crate) target: &'a str,
    pub(crate) connector: ChannelConnector,
}

#[derive(Debug)]
enum Inbound {
    Message(String),
    Notice(&'static str),
    Line(String),
    Eof,
    Lost(ClassifiedError),
}

pub(crate) fn run(
    commands: &mut EventSession,
    dialog: Dialog<'_>,
    console: Box<dyn BufRead + Send>,
    out: &mut dyn Write,
) -> Result<Report, ClassifiedError> {
    let Dialog {
        server,
        image,
        target,
        connector,
    } = dialog;
    let msg_timeout = server.parms().msg_timeout.unwrap_or(DEFAULT_MSG_TIMEOUT);
    let mut msg_file = match &server.parms().msg_file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ClassifiedError::new(
                        ErrorKind::Validation,
                        ReturnCode::InvalidParameterValue,
                        format!("cannot open message file {}: {e}", path.display()),
                    )
                })?,
        ),
        None => None,
    };

    write!(
        out,
        "\nStarting operating system messages interaction for\npartition {} (Ctrl-D to abort):\n",
        image.name
    )
    .map_err(output_failure)?;

    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));

    let poller = {
        let server = server.clone();
        let target = target.to_owned();
        let tx = tx.clone();
        let cancel = Arc::clone(&cancel);
        thread::Builder::new()
            .name("snipl-opsys-poller".into())
            .spawn(move || poll(&server, &connector, &target, msg_timeout, &tx, &cancel))
            .map_err(spawn_failure)?
    };

    // Detached: it ends on its next line or EOF once the receiver is gone.
    let reader = thread::Builder::new()
        .name("snipl-console".into())
        .spawn(move || read_console(console, tx));
    if let Err(e) = reader {
        cancel.store(true, Ordering::Relaxed);
        let _ = poller.join();
        return Err(spawn_failure(e));
    }

    let mut report = Report::new();
    let outcome = loop {
        let Ok(inbound) = rx.recv() else {
            break Ok(());
        };
        match inbound {
            Inbound::Message(text) => {
                if let Err(e) = emit(out, msg_file.as_mut(), &text) {
                    break Err(output_failure(e));
                }
            }
            Inbound::Notice(text) => {
                report.warn(text);
                if let Err(e) = emit(out, msg_file.as_mut(), text) {
                    break Err(output_failure(e));
                }
            }
            Inbound::Line(line) => {
                let command = line.trim_end_matches(['\r', '\n']);
                if command.is_empty() {
                    continue;
                }
                if let Err(err) = send_command(commands, image, target, command) {
                    break Err(err);
                }
            }
            Inbound::Eof => break Ok(()),
            Inbound::Lost(err) => break Err(err),
        }
    };

    cancel.store(true, Ordering::Relaxed);
    if poller.join().is_err() {
        return Err(ClassifiedError::new(
            ErrorKind::Connection,
            ReturnCode::InternalError,
            "operating system message poller panicked",
        ));
    }
    if let Some(file) = msg_file.as_mut() {
        let _ = file.sync_all();
    }
    write!(
        out,
        "\nAborting operating system messages interaction for partition {}.\n",
        image.name
    )
    .map_err(output_failure)?;

    outcome.map(|()| report)
}

fn send_command(
    commands: &mut EventSession,
    image: &Image,
    target: &str,
    command: &str,
) -> Result<(), ClassifiedError> {
    #[cfg(feature = "tracing")]
    tracing::debug!(image = %image.name, command, "sending operating system command");

    let params = Record::new(vec![Cell::Integer(OPSYS_PRIORITY), Cell::text(command)]);
    match commands.submit(target, oid::SEND_OPSYS_COMMAND, &params) {
        Ok(Ack::Acknowledged) => Ok(()),
        Ok(Ack::Failed { rc, .. }) => Err(ClassifiedError::new(
            ErrorKind::Command,
            ReturnCode::HwmcaProblem,
            format!("{}: operating system command not acknowledged - rc is {rc}", image.name),
        )),
        Err(e) => Err(crate::backend::event_failure(
            &format!("{}: send operating system command", image.name),
            e,
        )),
    }
}

fn poll(
    server: &Server,
    connector: &ChannelConnector,
    target: &str,
    msg_timeout: Duration,
    tx: &Sender<Inbound>,
    cancel: &AtomicBool,
) {
    let mut session = match open(server, connector) {
        Ok(s) => s,
        Err(e) => {
            let _ = tx.send(Inbound::Lost(e));
            return;
        }
    };

    while !cancel.load(Ordering::Relaxed) {
        match session.next_event(msg_timeout) {
            Ok(record) => {
                let Some(message) = OpsysMessage::from_record(&record) else {
                    continue;
                };
                if message.target != target {
                    continue;
                }
                if tx.send(Inbound::Message(message.text)).is_err() {
                    break;
                }
            }
            Err(Error::Timeout) => {}
            Err(err) => {
                let _ = &err;
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %err, "message channel receive failed, reconnecting");
                let _ = tx.send(Inbound::Notice(RECONNECT_NOTICE));
                close_quietly(&mut session);
                match open(server, connector) {
                    Ok(s) => session = s,
                    Err(e) => {
                        let _ = tx.send(Inbound::Lost(e));
                        return;
                    }
                }
            }
        }
    }
    close_quietly(&mut session);
}

fn close_quietly(session: &mut EventSession) {
    if let Err(err) = session.close() {
        let _ = &err;
        #[cfg(feature = "tracing")]
        tracing::debug!(error = %err, "message channel close failed");
    }
}

fn open(server: &Server, connector: &ChannelConnector) -> Result<EventSession, ClassifiedError> {
    let context = format!("{}: initialize message channel", server.address());
    let channel =
        connector(server).map_err(|e| crate::backend::event_failure(&context, e))?;
    EventSession::open(channel, EventMask::OpsysMessage, server.timeout())
        .map_err(|e| crate::backend::event_failure(&context, e))
}

fn read_console(console: Box<dyn BufRead + Send>, tx: Sender<Inbound>) {
    for line in console.lines() {
        let sent = match line {
            Ok(line) => tx.send(Inbound::Line(line)),
            Err(e) => {
                let _ = tx.send(Inbound::Lost(ClassifiedError::new(
                    ErrorKind::Connection,
                    ReturnCode::StdinProblem,
                    format!("cannot read console input: {e}"),
                )));
                return;
            }
        };
        if sent.is_err() {
            return;
        }
    }
    let _ = tx.send(Inbound::Eof);
}

fn emit(out: &mut dyn Write, file: Option<&mut File>, text: &str) -> std::io::Result<()> {
    writeln!(out, "{text}")?;
    out.flush()?;
    if let Some(file) = file {
        writeln!(file, "{text}")?;
    }
    Ok(())
}

fn output_failure(e: std::io::Error) -> ClassifiedError {
    ClassifiedError::new(
        ErrorKind::Connection,
        ReturnCode::InternalError,
        format!("cannot write dialog output: {e}"),
    )
}

fn spawn_failure(e: std::io::Error) -> ClassifiedError {
    ClassifiedError::new(
        ErrorKind::Connection,
        ReturnCode::ForkProblem,
        format!("problem starting message poller: {e}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        CommandRequest, EVENT_COMMAND_RESPONSE, EVENT_OPSYS_MESSAGE, EventChannel, Fetch,
    };
    use crate::types::{ImageOp, Parms};
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;

    const TARGET: &str = "1.3.6.1.4.1.2.6.42.0.2.2.3";

    fn opsys(target: &str, text: &str) -> Record {
        Record::new(vec![
            Cell::ObjectId(target.to_owned()),
            Cell::Integer(EVENT_OPSYS_MESSAGE),
            Cell::ObjectId(oid::EVENT_TYPE.to_owned()),
            Cell::Null,
            Cell::ObjectId(oid::EVENT_MESSAGE.to_owned()),
            Cell::text(text),
        ])
    }

    #[derive(Default)]
    struct Console {
        waits: VecDeque<crate::error::Result<Fetch>>,
        opened: usize,
        sent: Vec<Record>,
        pending: VecDeque<Record>,
    }

    #[derive(Clone)]
    struct Channel {
        state: Arc<Mutex<Console>>,
        cancel: Option<Arc<AtomicBool>>,
    }

    impl EventChannel for Channel {
        fn initialize(&mut self, _: EventMask, _: Duration) -> crate::error::Result<()> {
            Ok(())
        }

        fn get(&mut self, _: &str, _: &mut [u8], _: Duration) -> crate::error::Result<Fetch> {
            Err(Error::Api(1))
        }

        fn command(
            &mut self,
            request: &CommandRequest<'_>,
            _: Duration,
        ) -> crate::error::Result<()> {
            let mut s = self.state.lock().expect("lock");
            s.sent.push(request.params.clone());
            s.pending.push_back(Record::new(vec![
                Cell::ObjectId(request.target.to_owned()),
                Cell::Integer(EVENT_COMMAND_RESPONSE),
                Cell::ObjectId(
                    oid::image_attribute(request.target, oid::COMMAND_OBJECT_SUFFIX).expect("attribute"),
                ),
                Cell::ObjectId(request.command.to_owned()),
                Cell::ObjectId(
                    oid::image_attribute(request.target, oid::CONDITION_CODE_SUFFIX).expect("attribute"),
                ),
                Cell::Integer(0),
                Cell::ObjectId(
                    oid::image_attribute(request.target, oid::LAST_INDICATOR_SUFFIX).expect("attribute"),
                ),
                Cell::Integer(1),
                Cell::ObjectId(oid::EVENT_MESSAGE.to_owned()),
                Cell::Null,
                Cell::ObjectId(oid::EVENT_CORRELATOR.to_owned()),
                Cell::OctetString(request.correlator.as_bytes().to_vec()),
            ]));
            Ok(())
        }

        fn wait(&mut self, _: &mut [u8], _: Duration) -> crate::error::Result<Fetch> {
            let mut s = self.state.lock().expect("lock");
            if let Some(record) = s.pending.pop_front() {
                return Ok(Fetch::Ready(record));
            }
            match s.waits.pop_front() {
                Some(next) => next,
                None => {
                    if let Some(cancel) = &self.cancel {
                        cancel.store(true, Ordering::Relaxed);
                    }
                    drop(s);
                    thread::sleep(Duration::from_millis(1));
                    Err(Error::Timeout)
                }
            }
        }

        fn terminate(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn connector(
        state: &Arc<Mutex<Console>>,
        cancel: Option<Arc<AtomicBool>>,
    ) -> ChannelConnector {
        let state = Arc::clone(state);
        Arc::new(move |_: &Server| {
            state.lock().expect("lock").opened += 1;
            let channel: Box<dyn EventChannel + Send> = Box::new(Channel {
                state: Arc::clone(&state),
                cancel: cancel.clone(),
            });
            Ok(channel)
        })
    }

    fn server() -> Server {
        Server::builder("hmc01", "LPAR")
            .encryption(false)
            .password("public")
            .parms(Parms::for_op(ImageOp::Dialog))
            .image("LINUX03")
            .build()
            .expect("server")
    }

    #[test]
    fn poller_reconnects_once_and_filters_by_image() {
        let state = Arc::new(Mutex::new(Console::default()));
        {
            let mut s = state.lock().expect("lock");
            s.waits.push_back(Err(Error::ConnectionLost));
            s.waits.push_back(Ok(Fetch::Ready(opsys("1.3.6.1.4.1.2.6.42.0.2.2.9", "other"))));
            s.waits.push_back(Ok(Fetch::Ready(opsys(TARGET, "IPL complete"))));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        let connector = connector(&state, Some(Arc::clone(&cancel)));
        let (tx, rx) = mpsc::channel();

        poll(&server(), &connector, TARGET, Duration::from_millis(10), &tx, &cancel);
        drop(tx);

        let got: Vec<String> = rx
            .iter()
            .map(|inbound| match inbound {
                Inbound::Message(text) => text,
                Inbound::Notice(text) => text.to_owned(),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(got, [RECONNECT_NOTICE, "IPL complete"]);
        assert_eq!(state.lock().expect("lock").opened, 2);
    }

    #[test]
    fn console_lines_become_opsys_commands() {
        let state = Arc::new(Mutex::new(Console::default()));
        let messages = Arc::new(Mutex::new(Console::default()));
        let server = server();
        let mut commands = EventSession::open(
            connector(&state, None)(&server).expect("channel"),
            EventMask::CommandResponse,
            Duration::from_secs(1),
        )
        .expect("session");

        let mut out = Vec::new();
        let report = run(
            &mut commands,
            Dialog {
                server: &server,
                image: &server.images()[0],
                target: TARGET,
                connector: connector(&messages, None),
            },
            Box::new(Cursor::new(b"d date\n\nv os\n".to_vec())),
            &mut out,
        )
        .expect("dialog");
        assert!(report.messages().is_empty());

        let sent = state.lock().expect("lock").sent.clone();
        assert_eq!(
            sent,
            [
                Record::new(vec![Cell::Integer(0), Cell::text("d date")]),
                Record::new(vec![Cell::Integer(0), Cell::text("v os")]),
            ]
        );
        let out = String::from_utf8(out).expect("utf8");
        assert!(out.contains("partition LINUX03 (Ctrl-D to abort):"));
        assert!(out.contains("interaction for partition LINUX03."));
    }
}
