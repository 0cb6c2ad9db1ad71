use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use crate::debug;
use crate::error::{Error, Result};
use crate::event::ber::{self, Message, Pdu, PduKind};
use crate::event::{API_TIMEOUT, CommandRequest, EventChannel, EventMask, Fetch, oid};
use crate::record::{Cell, Record};
use crate::types::Server;

/// Default SNMP agent port.
pub const DEFAULT_PORT: u16 = 161;

const SYS_UP_TIME: &str = "1.3.6.1.2.1.1.3.0";
const SNMP_TRAP_OID: &str = "1.3.6.1.6.3.1.1.4.1.0";

// Enough to read the outer SEQUENCE header of any datagram.
const HEADER_PEEK: usize = 6;

/// SNMPv2c event channel over UDP.
///
/// The server password is the community string. Object reads are
/// `GetRequest`s, commands are `SetRequest`s and events are received
/// `SNMPv2-Trap` PDUs. Each PDU's variable bindings are flattened into the
/// record as name/value cell pairs.
pub struct SnmpChannel {
    socket: UdpSocket,
    community: Vec<u8>,
    next_request_id: i32,
    // Datagrams that arrived while waiting for a response.
    backlog: VecDeque<Vec<u8>>,
    mask: Option<EventMask>,
}

impl SnmpChannel {
    /// Bind a socket and connect it to the server's agent.
    pub fn connect(server: &Server) -> Result<Self> {
        if server.encryption() {
            return Err(Error::InvalidArgument(
                "snmp v2c event channel does not support encryption",
            ));
        }
        let community = server
            .password()
            .map(|p| p.expose().to_vec())
            .ok_or(Error::InvalidArgument("community (password) is required"))?;
        let target = resolve(server.address(), server.port().unwrap_or(DEFAULT_PORT))?;

        let bind_addr = match target {
            SocketAddr::V4(_) => "0.0.0.0:0",
            SocketAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(target)?;

        Ok(Self {
            socket,
            community,
            next_request_id: rand::random::<i32>() & 0x3fff_ffff,
            backlog: VecDeque::new(),
            mask: None,
        })
    }

    fn allocate_request_id(&mut self) -> i32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1) & 0x3fff_ffff;
        id
    }

    fn send(&mut self, pdu: Pdu) -> Result<()> {
        let wire = ber::encode_message(&Message {
            community: self.community.clone(),
            pdu,
        })?;
        debug::dump_hex("snmp send", &wire);
        self.socket.send(&wire)?;
        Ok(())
    }

    /// Peek at the next datagram; `Ok(Err(n))` when it needs `n` bytes.
    fn receive(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<std::result::Result<usize, usize>> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
            .ok_or(Error::Timeout)?;
        self.socket.set_read_timeout(Some(remaining))?;

        let mut head = [0u8; HEADER_PEEK];
        let n = match self.socket.peek(&mut head) {
            Ok(n) => n,
            Err(e) if is_timeout(&e) => return Err(Error::Timeout),
            Err(e) => return Err(Error::Io(e)),
        };
        let Some(needed) = ber::message_len(&head[..n]) else {
            // Drop the datagram so it does not block the queue.
            let _ = self.socket.recv(&mut head);
            return Err(Error::Protocol("malformed snmp datagram"));
        };
        if needed > buf.len() {
            return Ok(Err(needed));
        }
        let n = self.socket.recv(buf)?;
        debug::dump_hex("snmp recv", &buf[..n]);
        Ok(Ok(n))
    }

    /// Wait for the response to `request_id`, keeping traps for later.
    fn await_response(&mut self, request_id: i32, timeout: Duration) -> Result<Pdu> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            let n = match self.receive(&mut buf, deadline) {
                Ok(Ok(n)) => n,
                Ok(Err(needed)) => {
                    return Err(Error::protocol_owned(format!(
                        "snmp datagram of {needed} bytes exceeds receive buffer"
                    )));
                }
                Err(Error::Timeout) => return Err(Error::Api(API_TIMEOUT)),
                Err(e) => return Err(e),
            };
            let msg = ber::decode_message(&buf[..n])?;
            match msg.pdu.kind {
                PduKind::Response if msg.pdu.request_id == request_id => {
                    if msg.pdu.error_status != 0 {
                        return Err(Error::Api(api_code(msg.pdu.error_status)));
                    }
                    return Ok(msg.pdu);
                }
                PduKind::Trap => self.backlog.push_back(buf[..n].to_vec()),
                _ => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(request_id = msg.pdu.request_id, "dropping stale snmp pdu");
                }
            }
        }
    }
}

impl EventChannel for SnmpChannel {
    fn initialize(&mut self, mask: EventMask, _timeout: Duration) -> Result<()> {
        self.mask = Some(mask);
        Ok(())
    }

    fn get(&mut self, object: &str, buf: &mut [u8], timeout: Duration) -> Result<Fetch> {
        let request_id = self.allocate_request_id();
        self.send(Pdu::new(
            PduKind::GetRequest,
            request_id,
            vec![(object.to_owned(), Cell::Null)],
        ))?;
        let pdu = self.await_response(request_id, timeout)?;
        let record = flatten(pdu.varbinds);
        let size = encoded_size(&record);
        if size > buf.len() {
            // The agent answers again on the re-issued request.
            return Ok(Fetch::NeedMore(size));
        }
        Ok(Fetch::Ready(record))
    }

    fn command(&mut self, request: &CommandRequest<'_>, timeout: Duration) -> Result<()> {
        let mut varbinds = Vec::with_capacity(request.params.len() + 2);
        varbinds.push((
            request.target.to_owned(),
            Cell::ObjectId(request.command.to_owned()),
        ));
        for (i, cell) in request.params.cells().iter().enumerate() {
            varbinds.push((format!("{}.{}", oid::COMMAND_PARAMETER, i + 1), cell.clone()));
        }
        varbinds.push((
            oid::EVENT_CORRELATOR.to_owned(),
            Cell::OctetString(request.correlator.as_bytes().to_vec()),
        ));

        let request_id = self.allocate_request_id();
        self.send(Pdu::new(PduKind::SetRequest, request_id, varbinds))?;
        self.await_response(request_id, timeout).map(|_| ())
    }

    fn wait(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Fetch> {
        if self.mask.is_none() {
            return Err(Error::Protocol("event channel not initialized"));
        }
        if let Some(raw) = self.backlog.front() {
            if raw.len() > buf.len() {
                return Ok(Fetch::NeedMore(raw.len()));
            }
            let raw = self.backlog.pop_front().unwrap_or_default();
            return trap_record(&raw).map(Fetch::Ready);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let n = match self.receive(buf, deadline)? {
                Ok(n) => n,
                Err(needed) => return Ok(Fetch::NeedMore(needed)),
            };
            match trap_record(&buf[..n]) {
                Ok(record) => return Ok(Fetch::Ready(record)),
                Err(Error::Protocol("not a trap")) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        self.mask = None;
        self.backlog.clear();
        Ok(())
    }
}

fn trap_record(raw: &[u8]) -> Result<Record> {
    let msg = ber::decode_message(raw)?;
    if msg.pdu.kind != PduKind::Trap {
        return Err(Error::Protocol("not a trap"));
    }
    let varbinds = msg
        .pdu
        .varbinds
        .into_iter()
        .skip_while(|(name, _)| name == SYS_UP_TIME || name == SNMP_TRAP_OID)
        .collect();
    Ok(flatten(varbinds))
}

fn flatten(varbinds: Vec<(String, Cell)>) -> Record {
    let mut record = Record::new(Vec::with_capacity(varbinds.len() * 2));
    for (name, value) in varbinds {
        record.push(Cell::ObjectId(name));
        record.push(value);
    }
    record
}

/// Buffer size a record occupies: a 12-byte cell header plus its payload.
fn encoded_size(record: &Record) -> usize {
    record.cells().iter().map(|c| 12 + c.len()).sum()
}

fn api_code(error_status: i64) -> u32 {
    match error_status {
        // noSuchName
        2 => 1,
        // badValue, wrongValue
        3 | 10 => 5,
        // readOnly, notWritable
        4 | 17 => 14,
        // authorizationError
        16 => 29,
        _ => 21,
    }
}

fn resolve(address: &str, port: u16) -> Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or(Error::InvalidArgument("host name cannot be resolved"))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_record_skips_standard_header_bindings() {
        let wire = ber::encode_message(&Message {
            community: b"pw".to_vec(),
            pdu: Pdu::new(
                PduKind::Trap,
                1,
                vec![
                    (SYS_UP_TIME.to_owned(), Cell::Integer(1234)),
                    (
                        SNMP_TRAP_OID.to_owned(),
                        Cell::ObjectId(oid::EVENT_TYPE.to_owned()),
                    ),
                    (oid::CPC_IMAGE.to_owned() + ".3", Cell::Integer(0)),
                ],
            ),
        })
        .expect("encode");

        let record = trap_record(&wire).expect("decode");
        assert_eq!(record.len(), 2);
        assert_eq!(
            record.object_id(0).expect("name"),
            "1.3.6.1.4.1.2.6.42.0.2.2.3"
        );
        assert_eq!(record.integer(1).expect("value"), 0);
    }

    #[test]
    fn non_trap_pdus_are_not_events() {
        let wire = ber::encode_message(&Message {
            community: b"pw".to_vec(),
            pdu: Pdu::new(PduKind::Response, 1, Vec::new()),
        })
        .expect("encode");
        assert!(matches!(trap_record(&wire), Err(Error::Protocol("not a trap"))));
    }

    #[test]
    fn error_status_maps_to_api_codes() {
        assert_eq!(api_code(2), 1);
        assert_eq!(api_code(16), 29);
        assert_eq!(api_code(5), 21);
    }

    #[test]
    fn get_and_command_round_trip_against_local_agent() {
        let agent = UdpSocket::bind("127.0.0.1:0").expect("bind");
        let port = agent.local_addr().expect("addr").port();
        let server = Server::builder("127.0.0.1", "LPAR")
            .password("pw")
            .encryption(false)
            .port(port)
            .build()
            .expect("server");
        let mut channel = SnmpChannel::connect(&server).expect("connect");
        channel
            .initialize(EventMask::CommandResponse, Duration::from_secs(1))
            .expect("init");

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let (n, peer) = agent.recv_from(&mut buf).expect("recv");
            let req = ber::decode_message(&buf[..n]).expect("decode");
            assert_eq!(req.pdu.kind, PduKind::GetRequest);
            assert_eq!(req.community, b"pw");
            let reply = Message {
                community: req.community,
                pdu: Pdu::new(
                    PduKind::Response,
                    req.pdu.request_id,
                    vec![(req.pdu.varbinds[0].0.clone(), Cell::text("LPAR1 LPAR2"))],
                ),
            };
            let wire = ber::encode_message(&reply).expect("encode");
            agent.send_to(&wire, peer).expect("send");
        });

        let mut buf = vec![0u8; 10_000];
        let fetch = channel
            .get("1.3.6.1.4.1.2.6.42.0.2.1.2.22", &mut buf, Duration::from_secs(2))
            .expect("get");
        handle.join().expect("agent");
        let Fetch::Ready(record) = fetch else {
            panic!("expected ready record");
        };
        assert_eq!(record.text(1).expect("text"), "LPAR1 LPAR2");
    }
}
