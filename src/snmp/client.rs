//! SNMP v1/v2c/v3 sessions over UDP or TCP.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::ber::{self, Message, Pdu, PduType};
use super::usm::{Reply, Report, Usm};
use super::{compare_oids, oid_suffix, parse_oid, Connector, Session, SnmpValue, VarBind};
use crate::config::{AgentEndpoint, Credentials, SnmpVersion, Transport};
use crate::error::TransportError;

/// v1 `noSuchName`, returned by GETNEXT past the end of the MIB.
const NO_SUCH_NAME: i64 = 2;

const MAX_DATAGRAM: usize = 65_535;

/// Largest message accepted from a stream.
const MAX_STREAM_FRAME: usize = 1 << 20;

/// Opens [`ClientSession`]s for any configured transport and version.
#[derive(Debug, Default, Clone)]
pub struct SnmpConnector;

#[async_trait]
impl Connector for SnmpConnector {
    async fn connect(&self, endpoint: &AgentEndpoint) -> Result<Arc<dyn Session>, TransportError> {
        let security = Security::for_endpoint(endpoint)?;
        let remote = resolve(endpoint).await?;
        let address = endpoint.address();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let channel = if endpoint.transport.is_udp() {
            let local: SocketAddr = if remote.is_ipv4() {
                ([0, 0, 0, 0], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(remote).await?;
            let socket = Arc::new(socket);
            tokio::spawn(receive_datagrams(
                socket.clone(),
                pending.clone(),
                cancel.clone(),
                address.clone(),
            ));
            Channel::Udp(socket)
        } else {
            let stream = tokio::time::timeout(endpoint.timeout, TcpStream::connect(remote))
                .await
                .map_err(|_| TransportError::Timeout(endpoint.timeout))??;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            tokio::spawn(receive_stream(reader, pending.clone(), cancel.clone(), address.clone()));
            Channel::Tcp(tokio::sync::Mutex::new(writer))
        };

        tracing::debug!(agent = %address, remote = %remote, "Opened SNMP session");

        Ok(Arc::new(ClientSession {
            channel,
            security,
            address,
            timeout: endpoint.timeout,
            retries: endpoint.retries,
            max_repetitions: endpoint.max_repetitions,
            pending,
            next_id: AtomicI32::new(rand::random::<i32>() & 0x3fff_ffff),
            cancel,
        }))
    }
}

async fn resolve(endpoint: &AgentEndpoint) -> Result<SocketAddr, TransportError> {
    let addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| TransportError::Resolve(format!("{}: {}", endpoint.host, e)))?;

    let mut addrs = addrs.filter(|a| match endpoint.transport {
        Transport::Udp4 | Transport::Tcp4 => a.is_ipv4(),
        Transport::Udp6 | Transport::Tcp6 => a.is_ipv6(),
        Transport::Udp | Transport::Tcp => true,
    });
    addrs
        .next()
        .ok_or_else(|| TransportError::Resolve(endpoint.host.clone()))
}

enum Security {
    Community { version: i64, community: Vec<u8> },
    Usm(Usm),
}

impl Security {
    fn for_endpoint(endpoint: &AgentEndpoint) -> Result<Self, TransportError> {
        match (endpoint.version, endpoint.credentials.as_ref()) {
            (SnmpVersion::V1, Credentials::Community(c)) => Ok(Security::Community {
                version: 0,
                community: c.as_bytes().to_vec(),
            }),
            (SnmpVersion::V2c, Credentials::Community(c)) => Ok(Security::Community {
                version: 1,
                community: c.as_bytes().to_vec(),
            }),
            (
                SnmpVersion::V3,
                Credentials::Usm {
                    username,
                    level,
                    auth,
                    privacy,
                    context_name,
                },
            ) => Ok(Security::Usm(Usm::new(
                username,
                *level,
                auth.clone(),
                privacy.clone(),
                context_name,
            ))),
            (SnmpVersion::V3, Credentials::Community(_)) => {
                Err(TransportError::Unsupported("SNMPv3 needs USM credentials".into()))
            }
            (_, Credentials::Usm { .. }) => Err(TransportError::Unsupported("USM credentials need SNMPv3".into())),
        }
    }

    fn is_v1(&self) -> bool {
        matches!(self, Security::Community { version: 0, .. })
    }
}

enum Channel {
    Udp(Arc<UdpSocket>),
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
}

impl Channel {
    async fn send(&self, packet: &[u8]) -> std::io::Result<()> {
        match self {
            Channel::Udp(socket) => socket.send(packet).await.map(|_| ()),
            Channel::Tcp(writer) => writer.lock().await.write_all(packet).await,
        }
    }
}

type Pending = Arc<Mutex<HashMap<i32, oneshot::Sender<Vec<u8>>>>>;

/// One connected agent. Responses are routed to callers by request id (the
/// msgID for v3), so concurrent calls interleave safely.
pub struct ClientSession {
    channel: Channel,
    security: Security,
    address: String,
    timeout: Duration,
    retries: u32,
    max_repetitions: u32,
    pending: Pending,
    next_id: AtomicI32,
    cancel: CancellationToken,
}

impl ClientSession {
    fn request_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff
    }

    /// Send `packet` and wait one timeout for the frame answering `id`.
    async fn exchange(&self, id: i32, packet: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if let Err(e) = self.channel.send(packet).await {
            self.pending.lock().remove(&id);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(frame)) => Ok(Some(frame)),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Ok(None)
            }
        }
    }

    fn encode(&self, pdu: Pdu) -> Result<Vec<u8>, TransportError> {
        match &self.security {
            Security::Community { version, community } => Message {
                version: *version,
                community: community.clone(),
                pdu,
            }
            .encode(),
            Security::Usm(usm) => usm.seal(pdu),
        }
    }

    fn decode(&self, frame: &[u8]) -> Result<Reply, TransportError> {
        match &self.security {
            Security::Community { .. } => Ok(Reply::Pdu(Message::decode(frame)?.pdu)),
            Security::Usm(usm) => usm.open(frame),
        }
    }

    /// Learn the agent's engine id, boots and time from its report.
    async fn discover_engine(&self, usm: &Usm) -> Result<(), TransportError> {
        for attempt in 0..=self.retries {
            let id = self.request_id();
            let packet = usm.discovery_request(id)?;
            match self.exchange(id, &packet).await? {
                Some(frame) => {
                    return match usm.open(&frame)? {
                        Reply::Report(Report::UnknownEngineId) => {
                            tracing::debug!(agent = %self.address, "Discovered SNMP engine");
                            Ok(())
                        }
                        Reply::Report(report) => Err(TransportError::Security(report.to_string())),
                        Reply::Pdu(_) => Err(TransportError::Security(
                            "agent answered engine discovery without a report".into(),
                        )),
                    };
                }
                None => tracing::trace!(agent = %self.address, attempt, "Engine discovery timed out"),
            }
        }
        Err(TransportError::Timeout(self.timeout))
    }

    async fn request(
        &self,
        kind: PduType,
        oids: &[String],
        non_repeaters: i64,
        max_repetitions: i64,
    ) -> Result<Pdu, TransportError> {
        let mut attempt = 0;
        let mut resynced = false;
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Closed);
            }
            if let Security::Usm(usm) = &self.security {
                if usm.engine_id().is_none() {
                    self.discover_engine(usm).await?;
                }
            }

            let id = self.request_id();
            let mut pdu = Pdu::request(kind, id, oids);
            pdu.error_status = non_repeaters;
            pdu.error_index = max_repetitions;
            let packet = self.encode(pdu)?;

            let Some(frame) = self.exchange(id, &packet).await? else {
                tracing::trace!(agent = %self.address, attempt, "SNMP request timed out");
                if attempt >= self.retries {
                    return Err(TransportError::Timeout(self.timeout));
                }
                attempt += 1;
                continue;
            };

            match self.decode(&frame)? {
                Reply::Pdu(response) => {
                    if response.error_status != 0 {
                        return Err(TransportError::ErrorStatus {
                            status: response.error_status,
                            index: response.error_index,
                        });
                    }
                    return Ok(response);
                }
                Reply::Report(report @ (Report::NotInTimeWindow | Report::UnknownEngineId)) if !resynced => {
                    tracing::debug!(agent = %self.address, %report, "Resynchronizing with SNMP engine");
                    resynced = true;
                }
                Reply::Report(report) => return Err(TransportError::Security(report.to_string())),
            }
        }
    }

    async fn next_batch(&self, from: &str) -> Result<Vec<VarBind>, TransportError> {
        let oids = [from.to_string()];
        let v1 = self.security.is_v1();
        let response = if v1 {
            self.request(PduType::GetNext, &oids, 0, 0).await
        } else {
            self.request(PduType::GetBulk, &oids, 0, self.max_repetitions as i64)
                .await
        };
        match response {
            Ok(pdu) => Ok(pdu.varbinds),
            Err(TransportError::ErrorStatus { status: NO_SUCH_NAME, .. }) if v1 => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Session for ClientSession {
    async fn get(&self, oids: &[String]) -> Result<Vec<VarBind>, TransportError> {
        if oids.is_empty() {
            return Ok(Vec::new());
        }
        for oid in oids {
            parse_oid(oid)?;
        }
        Ok(self.request(PduType::Get, oids, 0, 0).await?.varbinds)
    }

    async fn walk(&self, root: &str) -> Result<Vec<VarBind>, TransportError> {
        parse_oid(root)?;
        let mut out: Vec<VarBind> = Vec::new();
        let mut current = root.to_string();

        'walk: loop {
            let batch = self.next_batch(&current).await?;
            if batch.is_empty() {
                break;
            }
            for vb in batch {
                if vb.value == SnmpValue::EndOfMibView || oid_suffix(&vb.oid, root).is_none() {
                    break 'walk;
                }
                if compare_oids(&vb.oid, &current) != std::cmp::Ordering::Greater {
                    tracing::debug!(agent = %self.address, oid = %vb.oid, "OID not increasing, stopping walk");
                    break 'walk;
                }
                current = vb.oid.clone();
                out.push(vb);
            }
        }

        // A walk rooted at a leaf returns the leaf itself.
        if out.is_empty() {
            if let Ok(mut leaf) = self.get(&[root.to_string()]).await {
                if let Some(vb) = leaf.pop() {
                    if !vb.value.is_exception() && vb.value != SnmpValue::Null {
                        out.push(vb);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.pending.lock().clear();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn deliver(pending: &Pending, frame: Vec<u8>, address: &str) {
    match ber::response_id(&frame) {
        Ok(id) => {
            let waiter = pending.lock().remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => tracing::trace!(agent = %address, id, "Late or unknown response"),
            }
        }
        Err(e) => tracing::debug!(agent = %address, error = %e, "Dropping malformed response"),
    }
}

async fn receive_datagrams(socket: Arc<UdpSocket>, pending: Pending, cancel: CancellationToken, address: String) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv(&mut buf) => r,
        };
        match received {
            Ok(len) => deliver(&pending, buf[..len].to_vec(), &address),
            // ICMP errors surface here on connected sockets; callers time out.
            Err(e) => tracing::trace!(agent = %address, error = %e, "SNMP receive error"),
        }
    }
}

async fn receive_stream(reader: OwnedReadHalf, pending: Pending, cancel: CancellationToken, address: String) {
    let mut reader = BufReader::new(reader);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            r = read_frame(&mut reader) => r,
        };
        match frame {
            Ok(frame) => deliver(&pending, frame, &address),
            Err(e) => {
                tracing::debug!(agent = %address, error = %e, "SNMP stream closed");
                cancel.cancel();
                pending.lock().clear();
                break;
            }
        }
    }
}

/// Read one BER-framed message from a stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, TransportError> {
    let mut frame = vec![0u8; 2];
    reader.read_exact(&mut frame).await?;
    loop {
        match ber::frame_len(&frame)? {
            Some(total) if total > MAX_STREAM_FRAME => {
                return Err(TransportError::Decode(format!("{} byte message exceeds the stream limit", total)))
            }
            Some(total) => {
                let have = frame.len();
                frame.resize(total, 0);
                reader.read_exact(&mut frame[have..]).await?;
                return Ok(frame);
            }
            None => {
                let mut byte = [0u8; 1];
                reader.read_exact(&mut byte).await?;
                frame.push(byte[0]);
            }
        }
    }
}
