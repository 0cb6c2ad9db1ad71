use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snipl::Error;
use snipl::event::{
    Ack, CommandRequest, EVENT_COMMAND_RESPONSE, EVENT_OPSYS_MESSAGE, EventChannel, EventMask,
    EventSession, Fetch, OpsysMessage, oid,
};
use snipl::record::{Cell, Record};

const TARGET: &str = "1.3.6.1.4.1.2.6.42.0.2.2.3";

#[derive(Clone, Copy)]
enum Reply {
    // A response carrying a correlator that cannot match.
    Foreign,
    // A console message for the same target.
    Console,
    // The correlated response with this condition code.
    Matching(i64),
}

#[derive(Default)]
struct Script {
    replies: Vec<Reply>,
    pending: VecDeque<Record>,
    terminated: usize,
}

struct Channel(Arc<Mutex<Script>>);

fn response(command: &str, rc: i64, correlator: Vec<u8>) -> Record {
    Record::new(vec![
        Cell::ObjectId(TARGET.to_owned()),
        Cell::Integer(EVENT_COMMAND_RESPONSE),
        Cell::ObjectId(
            oid::image_attribute(TARGET, oid::COMMAND_OBJECT_SUFFIX).expect("attribute"),
        ),
        Cell::ObjectId(command.to_owned()),
        Cell::ObjectId(
            oid::image_attribute(TARGET, oid::CONDITION_CODE_SUFFIX).expect("attribute"),
        ),
        Cell::Integer(rc),
        Cell::ObjectId(
            oid::image_attribute(TARGET, oid::LAST_INDICATOR_SUFFIX).expect("attribute"),
        ),
        Cell::Integer(1),
        Cell::ObjectId(oid::EVENT_MESSAGE.to_owned()),
        Cell::text("Image Not Active"),
        Cell::ObjectId(oid::EVENT_CORRELATOR.to_owned()),
        Cell::OctetString(correlator),
    ])
}

impl EventChannel for Channel {
    fn initialize(&mut self, _: EventMask, _: Duration) -> snipl::Result<()> {
        Ok(())
    }

    fn get(&mut self, _: &str, _: &mut [u8], _: Duration) -> snipl::Result<Fetch> {
        Err(Error::Api(1))
    }

    fn command(&mut self, request: &CommandRequest<'_>, _: Duration) -> snipl::Result<()> {
        let mut script = self.0.lock().expect("lock");
        let own = request.correlator.as_bytes().to_vec();
        let foreign: Vec<u8> = own.iter().map(|b| !b).collect();
        let replies = script.replies.clone();
        for reply in replies {
            let event = match reply {
                Reply::Foreign => response(request.command, 0, foreign.clone()),
                Reply::Console => Record::new(vec![
                    Cell::ObjectId(TARGET.to_owned()),
                    Cell::Integer(EVENT_OPSYS_MESSAGE),
                    Cell::Null,
                    Cell::Null,
                    Cell::Null,
                    Cell::text("IPL in progress"),
                    Cell::Null,
                    Cell::Null,
                    Cell::Null,
                    Cell::Null,
                    Cell::Null,
                    Cell::OctetString(own.clone()),
                ]),
                Reply::Matching(rc) => response(request.command, rc, own.clone()),
            };
            script.pending.push_back(event);
        }
        Ok(())
    }

    fn wait(&mut self, _: &mut [u8], _: Duration) -> snipl::Result<Fetch> {
        let mut script = self.0.lock().expect("lock");
        script.pending.pop_front().map(Fetch::Ready).ok_or(Error::Timeout)
    }

    fn terminate(&mut self) -> snipl::Result<()> {
        self.0.lock().expect("lock").terminated += 1;
        Ok(())
    }
}

fn open(replies: Vec<Reply>) -> (EventSession, Arc<Mutex<Script>>) {
    let script = Arc::new(Mutex::new(Script {
        replies,
        ..Script::default()
    }));
    let session = EventSession::open(
        Box::new(Channel(Arc::clone(&script))),
        EventMask::CommandResponse,
        Duration::from_millis(50),
    )
    .expect("open");
    (session, script)
}

#[test]
fn foreign_and_console_events_do_not_complete_a_command() {
    let (mut session, script) = open(vec![Reply::Foreign, Reply::Console, Reply::Matching(0)]);
    let ack = session
        .submit(TARGET, oid::ACTIVATE, &Record::default())
        .expect("submit");
    assert_eq!(ack, Ack::Acknowledged);
    assert!(script.lock().expect("lock").pending.is_empty());
}

#[test]
fn only_non_matching_events_end_in_timeout() {
    let (mut session, _) = open(vec![Reply::Foreign, Reply::Foreign]);
    let err = session
        .submit(TARGET, oid::STOP, &Record::default())
        .expect_err("no matching response");
    assert!(matches!(err, Error::Timeout));
}

#[test]
fn failed_condition_is_reported_with_text() {
    let (mut session, _) = open(vec![Reply::Matching(135_921_664)]);
    let ack = session
        .submit(TARGET, oid::DEACTIVATE, &Record::default())
        .expect("submit");
    assert_eq!(
        ack,
        Ack::Failed {
            rc: 135_921_664,
            text: Some("Image Not Active".to_owned()),
        }
    );
}

#[test]
fn close_terminates_once() {
    let (mut session, script) = open(Vec::new());
    session.close().expect("close");
    session.close().expect("close again");
    assert_eq!(script.lock().expect("lock").terminated, 1);
    assert!(session.submit(TARGET, oid::STOP, &Record::default()).is_err());
}

#[test]
fn console_message_decoding() {
    let record = Record::new(vec![
        Cell::ObjectId(TARGET.to_owned()),
        Cell::Integer(EVENT_OPSYS_MESSAGE),
        Cell::Null,
        Cell::Null,
        Cell::Null,
        Cell::text("login:"),
    ]);
    let message = OpsysMessage::from_record(&record).expect("message");
    assert_eq!(message.target, TARGET);
    assert_eq!(message.text, "login:");
    assert!(OpsysMessage::from_record(&response(oid::STOP, 0, vec![0; 4])).is_none());
}
