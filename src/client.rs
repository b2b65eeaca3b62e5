//! The FINS protocol engine.
//!
//! [`FinsClient`] multiplexes up to 254 concurrent transactions over one
//! UDP or TCP transport, correlating replies to requests by service ID.
//! Submission is synchronous - validate, mint a header, register the
//! sequence - while the transport write happens on its own task, so a
//! reply can never arrive before its SID is registered.
//!
//! Completion is a two-tier affair: every submission returns a
//! [`Transaction`] whose [`wait`](Transaction::wait) resolves with the
//! finished [`SequenceReport`] or the error that terminated it. Callers
//! that drop the transaction instead receive the outcome on the broadcast
//! [`FinsEvent`] stream, which also carries connection lifecycle events.
//!
//! # Example
//!
//! ```no_run
//! use fins_client::{FinsClient, Options, ResponseBody, ResponseValues};
//!
//! #[tokio::main]
//! async fn main() -> fins_client::Result<()> {
//!     let client = FinsClient::connect("192.168.1.250", 9600, Options::default()).await?;
//!
//!     // Read 10 words from DM100 and wait for the reply.
//!     let report = client.read("D100", 10, None, None)?.wait().await?;
//!     let response = report.response.expect("reply carries a response");
//!     if let ResponseBody::Values(ResponseValues::Words(words)) = &response.body {
//!         println!("D100..D109 = {:?}", words);
//!     }
//!
//!     // Fire-and-forget: outcomes arrive on the event stream instead.
//!     let mut events = client.subscribe();
//!     client.write("D200", fins_client::WriteData::Words(vec![1, 2, 3]), None, None)?;
//!     println!("event: {:?}", events.recv().await);
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::address::{MemoryAddress, PlcFamily};
use crate::command::{
    self, CommandKind, Param, Request, RunMode, WriteData, MAX_ITEMS_PER_COMMAND,
};
use crate::error::{FinsError, Result};
use crate::header::{FinsHeader, Routing};
use crate::response::{parse_response, MIN_RESPONSE_SIZE};
use crate::sequence::{Completed, SequenceManager, SequenceReport, StatsSnapshot};
use crate::transport::{self, Handshake, Link, Protocol, ReaderHalf};

/// Fallback request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Fallback cap on concurrent in-flight transactions.
pub const DEFAULT_MAX_QUEUE: usize = 100;

/// Service IDs cycle through 1..=254; 0 and 255 are never allocated.
const SID_RANGE: u8 = 254;

/// Client construction options.
///
/// # Example
///
/// ```
/// use fins_client::{Options, Protocol};
/// use std::time::Duration;
///
/// let options = Options::default()
///     .with_protocol(Protocol::Tcp)
///     .with_timeout(Duration::from_secs(5))
///     .with_max_queue(32)
///     .with_mode("CV")
///     .unwrap();
/// assert_eq!(options.max_queue, 32);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Wire transport (default UDP).
    pub protocol: Protocol,
    /// Default per-request timeout (default 2000 ms).
    pub timeout: Duration,
    /// Maximum concurrent in-flight transactions (default 100, capped at
    /// the 254-wide SID space).
    pub max_queue: usize,
    /// PLC family selecting the memory area tables (default CS).
    pub family: PlcFamily,
    /// Initial ICF header field.
    pub icf: u8,
    /// Initial destination network address.
    pub dna: u8,
    /// Initial destination node address.
    pub da1: u8,
    /// Initial destination unit address.
    pub da2: u8,
    /// Initial source network address.
    pub sna: u8,
    /// Initial source node address.
    pub sa1: u8,
    /// Initial source unit address.
    pub sa2: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            timeout: DEFAULT_TIMEOUT,
            max_queue: DEFAULT_MAX_QUEUE,
            family: PlcFamily::CS,
            icf: 0x80,
            dna: 0x00,
            da1: 0x00,
            da2: 0x00,
            sna: 0x00,
            sa1: 0x00,
            sa2: 0x00,
        }
    }
}

impl Options {
    /// Selects the wire transport.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the default request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Caps the number of concurrent in-flight transactions.
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue;
        self
    }

    /// Selects the PLC family.
    pub fn with_family(mut self, family: PlcFamily) -> Self {
        self.family = family;
        self
    }

    /// Selects the PLC family from a `MODE` string (`"CS"`, `"CSCJ"`,
    /// `"CJ"`, `"CV"`, `"NJ"`, `"NJNX"`, `"NX"`).
    ///
    /// # Errors
    ///
    /// Returns [`FinsError::InvalidParameter`] for unknown modes.
    pub fn with_mode(mut self, mode: &str) -> Result<Self> {
        self.family = PlcFamily::from_mode(mode).ok_or_else(|| {
            FinsError::invalid_parameter("MODE", format!("unknown PLC mode '{mode}'"))
        })?;
        Ok(self)
    }

    /// Sets the source address header fields (`SNA`/`SA1`/`SA2`).
    pub fn with_source(mut self, sna: u8, sa1: u8, sa2: u8) -> Self {
        self.sna = sna;
        self.sa1 = sa1;
        self.sa2 = sa2;
        self
    }

    /// Sets the destination address header fields (`DNA`/`DA1`/`DA2`).
    pub fn with_destination(mut self, dna: u8, da1: u8, da2: u8) -> Self {
        self.dna = dna;
        self.da1 = da1;
        self.da2 = da2;
        self
    }

    /// Overrides the ICF header field.
    pub fn with_icf(mut self, icf: u8) -> Self {
        self.icf = icf;
        self
    }

    fn header_template(&self) -> FinsHeader {
        FinsHeader {
            icf: self.icf,
            dna: self.dna,
            da1: self.da1,
            da2: self.da2,
            sna: self.sna,
            sa1: self.sa1,
            sa2: self.sa2,
            ..FinsHeader::default()
        }
    }

    fn effective_max_queue(&self) -> usize {
        self.max_queue.clamp(1, usize::from(SID_RANGE))
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Timeout override for this request.
    pub timeout: Option<Duration>,
    /// Routing override for this request (`DNA`/`DA1`/`DA2`).
    pub routing: Option<Routing>,
}

/// Broadcast events for callers that do not wait on individual
/// transactions.
#[derive(Debug, Clone)]
pub enum FinsEvent {
    /// The client finished constructing, with the options that shaped it.
    Initialised {
        /// Construction options, after defaulting.
        options: Options,
    },
    /// The transport is open (and, over TCP, the handshake completed).
    Open {
        /// Remote endpoint.
        remote: SocketAddr,
    },
    /// The client or the peer closed the connection.
    Closed,
    /// A reply completed a transaction whose caller is not waiting.
    Reply(SequenceReport),
    /// A transaction timed out and its caller is not waiting.
    TimedOut {
        /// Configured PLC host.
        host: String,
        /// The expired transaction.
        seq: SequenceReport,
    },
    /// An error occurred, with the terminated transaction when one was
    /// involved.
    Error {
        /// What went wrong.
        error: Arc<FinsError>,
        /// The transaction the error terminated, if any.
        seq: Option<SequenceReport>,
    },
    /// A submission was refused because the queue is at capacity.
    Full,
}

/// Handle to one in-flight transaction.
///
/// The SID is available immediately for correlation; [`wait`]
/// (Transaction::wait) resolves when the transaction terminates. Dropping
/// the handle is allowed - the outcome is then broadcast as a
/// [`FinsEvent`] instead.
#[derive(Debug)]
pub struct Transaction {
    sid: u8,
    receiver: oneshot::Receiver<std::result::Result<SequenceReport, FinsError>>,
}

impl Transaction {
    /// The service ID allocated to this transaction.
    pub fn sid(&self) -> u8 {
        self.sid
    }

    /// Waits for the transaction to terminate.
    ///
    /// # Errors
    ///
    /// Resolves with [`FinsError::Timeout`], a transport error, or a
    /// protocol error when the transaction failed, and with
    /// [`FinsError::Closed`] when the client was closed before delivery.
    pub async fn wait(self) -> Result<SequenceReport> {
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(FinsError::Closed),
        }
    }
}

struct Shared {
    host: String,
    port: u16,
    protocol: Protocol,
    family: PlcFamily,
    default_timeout: Duration,
    header: Mutex<FinsHeader>,
    sid: AtomicU8,
    sequences: Mutex<SequenceManager>,
    link: Mutex<Link>,
    handshake: Mutex<Option<Handshake>>,
    events: broadcast::Sender<FinsEvent>,
    closed: AtomicBool,
}

/// Asynchronous FINS client.
///
/// One client owns one transport. Command methods validate, register the
/// transaction and hand the frame to a background write; they must be
/// called from within the Tokio runtime driving the client.
pub struct FinsClient {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

/// Locks with poison recovery: a panicked holder cannot leave the client
/// permanently wedged.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Advances the SID counter: 1..=254, wrapping.
fn advance_sid(counter: &AtomicU8) -> u8 {
    let previous = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current % SID_RANGE + 1)
        })
        .unwrap_or(0);
    previous % SID_RANGE + 1
}

impl FinsClient {
    /// Connects to a PLC and starts the receive loop.
    ///
    /// Over TCP this performs the node-assignment handshake and patches
    /// the assigned client/server nodes into the header template
    /// (`SA1`/`DA1`).
    pub async fn connect(host: impl Into<String>, port: u16, options: Options) -> Result<Self> {
        let host = host.into();
        let transport = transport::open(options.protocol, &host, port).await?;
        let remote = transport.link.remote();

        let mut header = options.header_template();
        if let Some(handshake) = transport.handshake {
            header.sa1 = handshake.client_node;
            header.da1 = handshake.server_node;
        }

        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            host,
            port,
            protocol: options.protocol,
            family: options.family,
            default_timeout: options.timeout,
            header: Mutex::new(header),
            sid: AtomicU8::new(0),
            sequences: Mutex::new(SequenceManager::new(options.effective_max_queue())),
            link: Mutex::new(transport.link),
            handshake: Mutex::new(transport.handshake),
            events,
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(run_reader(Arc::clone(&shared), transport.reader));
        let ticker = tokio::spawn(run_ticker(Arc::downgrade(&shared)));

        let _ = shared.events.send(FinsEvent::Initialised { options });
        let _ = shared.events.send(FinsEvent::Open { remote });

        Ok(Self {
            shared,
            reader,
            ticker,
        })
    }

    /// Subscribes to the broadcast event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<FinsEvent> {
        self.shared.events.subscribe()
    }

    /// Number of transactions currently in flight.
    pub fn queue_count(&self) -> usize {
        lock(&self.shared.sequences).active_count()
    }

    /// Remaining admission capacity.
    pub fn queue_space(&self) -> usize {
        lock(&self.shared.sequences).free_space()
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        lock(&self.shared.sequences).snapshot()
    }

    /// Remote endpoint of the transport.
    pub fn remote_addr(&self) -> SocketAddr {
        lock(&self.shared.link).remote()
    }

    /// Node numbers assigned by the TCP handshake, if any.
    pub fn node_assignment(&self) -> Option<Handshake> {
        *lock(&self.shared.handshake)
    }

    /// Parses a symbolic address against the client's PLC family.
    pub fn string_to_address(&self, address: &str) -> Result<MemoryAddress> {
        MemoryAddress::parse(address, self.shared.family)
    }

    /// Renders an address back to its string form, displaced by the given
    /// word and bit offsets.
    pub fn address_to_string(
        &self,
        address: &MemoryAddress,
        offset_wd: u32,
        offset_bit: u8,
    ) -> String {
        address.render(offset_wd, offset_bit)
    }

    /// Memory Area Read (0101): reads `count` words, or `count` bits when
    /// `address` carries a bit index.
    pub fn read(
        &self,
        address: &str,
        count: u16,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        let address = self.string_to_address(address)?;
        check_count(count)?;
        let body = command::read_body(address.encode(self.shared.family)?, count);
        self.dispatch(
            CommandKind::Read,
            Some(address),
            Vec::new(),
            Some(count),
            body,
            opts,
            tag,
        )
    }

    /// Memory Area Write (0102): writes words to a word address or bit
    /// flags to a bit address.
    pub fn write(
        &self,
        address: &str,
        data: WriteData,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        let address = self.string_to_address(address)?;
        if data.is_empty() {
            return Err(FinsError::invalid_parameter("data", "must not be empty"));
        }
        if data.len() > usize::from(MAX_ITEMS_PER_COMMAND) {
            return Err(FinsError::invalid_parameter(
                "data",
                format!("must not exceed {MAX_ITEMS_PER_COMMAND} items"),
            ));
        }
        if address.is_bit_address() != data.is_bits() {
            return Err(FinsError::invalid_parameter(
                "data",
                if data.is_bits() {
                    "bit payload requires a bit address"
                } else {
                    "word payload requires a word address"
                },
            ));
        }
        let count = data.len() as u16;
        let body = command::write_body(address.encode(self.shared.family)?, &data);
        self.dispatch(
            CommandKind::Write,
            Some(address),
            Vec::new(),
            Some(count),
            body,
            opts,
            tag,
        )
    }

    /// Memory Area Fill (0103): writes `value` into `count` consecutive
    /// words.
    pub fn fill(
        &self,
        address: &str,
        value: u16,
        count: u16,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        let address = self.string_to_address(address)?;
        if address.is_bit_address() {
            return Err(FinsError::invalid_parameter(
                "address",
                "fill requires a word address",
            ));
        }
        check_count(count)?;
        let body = command::fill_body(address.encode(self.shared.family)?, count, value);
        self.dispatch(
            CommandKind::Fill,
            Some(address),
            Vec::new(),
            Some(count),
            body,
            opts,
            tag,
        )
    }

    /// Multiple Memory Area Read (0104): reads a heterogeneous set of
    /// word and bit addresses in one round-trip.
    pub fn read_multiple(
        &self,
        addresses: &[&str],
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        if addresses.is_empty() {
            return Err(FinsError::invalid_parameter(
                "addresses",
                "must not be empty",
            ));
        }
        let mut parsed = Vec::with_capacity(addresses.len());
        let mut encoded = Vec::with_capacity(addresses.len());
        for address in addresses {
            let address = self.string_to_address(address)?;
            encoded.push(address.encode(self.shared.family)?);
            parsed.push(address);
        }
        let body = command::multi_read_body(&encoded);
        self.dispatch(
            CommandKind::ReadMultiple,
            None,
            parsed,
            None,
            body,
            opts,
            tag,
        )
    }

    /// Memory Area Transfer (0105): copies `count` words from `src` to
    /// `dst` inside the PLC.
    pub fn transfer(
        &self,
        src: &str,
        dst: &str,
        count: u16,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        let src = self.string_to_address(src)?;
        let dst = self.string_to_address(dst)?;
        if src.is_bit_address() || dst.is_bit_address() {
            return Err(FinsError::invalid_parameter(
                "address",
                "transfer requires word addresses",
            ));
        }
        check_count(count)?;
        let body = command::transfer_body(
            src.encode(self.shared.family)?,
            dst.encode(self.shared.family)?,
            count,
        );
        self.dispatch(
            CommandKind::Transfer,
            Some(src),
            vec![dst],
            Some(count),
            body,
            opts,
            tag,
        )
    }

    /// Run (0401): puts the PLC in the given mode, or the controller's
    /// default mode when `mode` is `None`.
    pub fn run(
        &self,
        mode: Option<RunMode>,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        let body = command::run_body(mode);
        self.dispatch(CommandKind::Run, None, Vec::new(), None, body, opts, tag)
    }

    /// Stop (0402): puts the PLC in PROGRAM mode.
    pub fn stop(&self, opts: Option<RequestOptions>, tag: Option<String>) -> Result<Transaction> {
        self.admit()?;
        self.dispatch(
            CommandKind::Stop,
            None,
            Vec::new(),
            None,
            Vec::new(),
            opts,
            tag,
        )
    }

    /// CPU Unit Data Read (0501): reads the controller model, version and
    /// configuration.
    pub fn cpu_unit_data_read(
        &self,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        self.dispatch(
            CommandKind::CpuUnitData,
            None,
            Vec::new(),
            None,
            Vec::new(),
            opts,
            tag,
        )
    }

    /// Controller Status Read (0601).
    pub fn status(&self, opts: Option<RequestOptions>, tag: Option<String>) -> Result<Transaction> {
        self.admit()?;
        self.dispatch(
            CommandKind::Status,
            None,
            Vec::new(),
            None,
            Vec::new(),
            opts,
            tag,
        )
    }

    /// Clock Read (0701): reads the PLC wall clock.
    pub fn clock_read(
        &self,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        self.admit()?;
        self.dispatch(
            CommandKind::ClockRead,
            None,
            Vec::new(),
            None,
            Vec::new(),
            opts,
            tag,
        )
    }

    /// Generic dispatch: runs the command named by a 4-hex-digit code
    /// string with positional [`Param`]s, e.g.
    /// `command("0101", &[Param::Text("D0".into()), Param::Number(10)], ..)`.
    ///
    /// # Errors
    ///
    /// Unknown codes and parameter arity/type mismatches return
    /// [`FinsError::InvalidParameter`].
    pub fn command(
        &self,
        code: &str,
        params: &[Param],
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        let descriptor = command::descriptor(code).ok_or_else(|| {
            FinsError::invalid_parameter("code", format!("unknown command code '{code}'"))
        })?;
        command::check_params(&descriptor, params)?;

        let arity_error = || {
            FinsError::invalid_parameter(
                "params",
                format!("parameters do not fit '{}'", descriptor.kind.name()),
            )
        };
        match descriptor.kind {
            CommandKind::Read => match params {
                [Param::Text(address), Param::Number(count)] => {
                    self.read(address, to_u16(*count, "count")?, opts, tag)
                }
                _ => Err(arity_error()),
            },
            CommandKind::Write => match params {
                [Param::Text(address), Param::Words(words)] => {
                    self.write(address, WriteData::Words(words.clone()), opts, tag)
                }
                [Param::Text(address), Param::Bits(bits)] => {
                    self.write(address, WriteData::Bits(bits.clone()), opts, tag)
                }
                _ => Err(arity_error()),
            },
            CommandKind::Fill => match params {
                [Param::Text(address), Param::Number(value), Param::Number(count)] => self.fill(
                    address,
                    to_u16(*value, "value")?,
                    to_u16(*count, "count")?,
                    opts,
                    tag,
                ),
                _ => Err(arity_error()),
            },
            CommandKind::ReadMultiple => match params {
                [Param::TextList(addresses)] => {
                    let refs: Vec<&str> = addresses.iter().map(String::as_str).collect();
                    self.read_multiple(&refs, opts, tag)
                }
                _ => Err(arity_error()),
            },
            CommandKind::Transfer => match params {
                [Param::Text(src), Param::Text(dst), Param::Number(count)] => {
                    self.transfer(src, dst, to_u16(*count, "count")?, opts, tag)
                }
                _ => Err(arity_error()),
            },
            CommandKind::Run => match params {
                [] => self.run(None, opts, tag),
                [Param::Number(mode)] => {
                    let mode = u8::try_from(*mode)
                        .ok()
                        .and_then(RunMode::from_u8)
                        .ok_or_else(|| {
                            FinsError::invalid_parameter("mode", format!("invalid run mode {mode}"))
                        })?;
                    self.run(Some(mode), opts, tag)
                }
                _ => Err(arity_error()),
            },
            CommandKind::Stop => self.stop(opts, tag),
            CommandKind::CpuUnitData => self.cpu_unit_data_read(opts, tag),
            CommandKind::Status => self.status(opts, tag),
            CommandKind::ClockRead => self.clock_read(opts, tag),
        }
    }

    /// Tears down the transport and rebuilds it, re-running the TCP
    /// handshake. Pending transactions are dropped without delivery.
    pub async fn reconnect(&mut self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(FinsError::Closed);
        }

        self.reader.abort();
        lock(&self.shared.sequences).close();
        lock(&self.shared.link).shutdown().await;

        let transport =
            transport::open(self.shared.protocol, &self.shared.host, self.shared.port).await?;
        let remote = transport.link.remote();
        if let Some(handshake) = transport.handshake {
            let mut header = lock(&self.shared.header);
            header.sa1 = handshake.client_node;
            header.da1 = handshake.server_node;
        }
        *lock(&self.shared.handshake) = transport.handshake;
        *lock(&self.shared.link) = transport.link;
        self.reader = tokio::spawn(run_reader(Arc::clone(&self.shared), transport.reader));

        debug!(host = %self.shared.host, port = self.shared.port, "reconnected");
        let _ = self.shared.events.send(FinsEvent::Open { remote });
        Ok(())
    }

    /// Closes the client: cancels every pending transaction and timer,
    /// stops the receive loop and shuts the transport down. Undelivered
    /// completions are never delivered.
    pub async fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reader.abort();
        self.ticker.abort();
        lock(&self.shared.sequences).close();
        lock(&self.shared.link).shutdown().await;
        let _ = self.shared.events.send(FinsEvent::Closed);
    }

    /// Admission control: refuses submissions on a closed client or a
    /// full queue.
    fn admit(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(FinsError::Closed);
        }
        let (active, capacity) = {
            let sequences = lock(&self.shared.sequences);
            (sequences.active_count(), sequences.capacity())
        };
        if active >= capacity {
            let _ = self.shared.events.send(FinsEvent::Full);
            return Err(FinsError::QueueFull { active, capacity });
        }
        Ok(())
    }

    /// Shared tail of every command method: mint the header, register the
    /// sequence, arm its timer, then hand the frame to a write task.
    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        kind: CommandKind,
        address: Option<MemoryAddress>,
        addresses: Vec<MemoryAddress>,
        count: Option<u16>,
        body: Vec<u8>,
        opts: Option<RequestOptions>,
        tag: Option<String>,
    ) -> Result<Transaction> {
        let shared = &self.shared;
        let opts = opts.unwrap_or_default();
        let timeout = opts.timeout.unwrap_or(shared.default_timeout);

        let sid = advance_sid(&shared.sid);
        let mut header = lock(&shared.header).with_sid(sid);
        if let Some(routing) = &opts.routing {
            header = header.with_routing(routing);
        }
        let frame = command::assemble_frame(header, kind, &body);

        let request = Request {
            sid,
            kind,
            address,
            addresses,
            count,
            tag,
            timeout,
        };
        let (sender, receiver) = oneshot::channel();
        lock(&shared.sequences).add(request, sender)?;

        let weak = Arc::downgrade(shared);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                expire(&shared, sid, timeout);
            }
        });
        lock(&shared.sequences).set_timer(sid, timer);

        // The write runs on its own task: registration already happened,
        // so even a loopback reply finds the SID in flight.
        let link = lock(&shared.link).clone();
        let write_shared = Arc::clone(shared);
        let frame_len = frame.len();
        tokio::spawn(async move {
            match link.send(&frame).await {
                Ok(()) => lock(&write_shared.sequences).confirm_sent(sid),
                Err(error) => {
                    warn!(sid, %error, "transport write failed");
                    let completed = lock(&write_shared.sequences).fail(sid);
                    if let Some(completed) = completed {
                        let error = FinsError::transport(format!("send failed: {error}"));
                        deliver_failure(&write_shared, completed, error, false);
                        lock(&write_shared.sequences).remove(sid);
                    }
                }
            }
        });

        debug!(sid, command = kind.name(), bytes = frame_len, "submitted");
        Ok(Transaction { sid, receiver })
    }
}

impl Drop for FinsClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.ticker.abort();
    }
}

impl std::fmt::Debug for FinsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinsClient")
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("protocol", &self.shared.protocol)
            .field("family", &self.shared.family)
            .field("queue", &self.queue_count())
            .finish()
    }
}

fn check_count(count: u16) -> Result<()> {
    if count == 0 {
        return Err(FinsError::invalid_parameter(
            "count",
            "must be greater than 0",
        ));
    }
    if count > MAX_ITEMS_PER_COMMAND {
        return Err(FinsError::invalid_parameter(
            "count",
            format!("must not exceed {MAX_ITEMS_PER_COMMAND}"),
        ));
    }
    Ok(())
}

fn to_u16(value: u32, parameter: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| FinsError::invalid_parameter(parameter, format!("{value} exceeds 65535")))
}

/// Receive loop: demultiplexes inbound frames to their sequences until
/// the transport closes or fails.
async fn run_reader(shared: Arc<Shared>, mut reader: ReaderHalf) {
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => handle_frame(&shared, &frame),
            Ok(None) => {
                debug!("connection closed by peer");
                let _ = shared.events.send(FinsEvent::Closed);
                return;
            }
            Err(error) => {
                warn!(%error, "receive loop terminated");
                let _ = shared.events.send(FinsEvent::Error {
                    error: Arc::new(error),
                    seq: None,
                });
                return;
            }
        }
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
    }
}

/// Resamples the messages-per-second gauge once per second.
async fn run_ticker(shared: Weak<Shared>) {
    let mut interval = tokio::time::interval(Duration::from_millis(1000));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match shared.upgrade() {
            Some(shared) => lock(&shared.sequences).tick(),
            None => return,
        }
    }
}

/// Routes one inbound frame to its in-flight sequence.
fn handle_frame(shared: &Arc<Shared>, frame: &[u8]) {
    let remote = lock(&shared.link).remote();
    trace!(packet = %crate::utils::format_packet(frame), "inbound frame");

    if frame.len() < MIN_RESPONSE_SIZE {
        emit_protocol_error(
            shared,
            format!("inbound frame of {} bytes is too short", frame.len()),
        );
        return;
    }
    let sid = frame[9];
    if sid == 0 || sid == 0xFF {
        emit_protocol_error(shared, format!("inbound SID {sid} out of range 1..254"));
        return;
    }
    let Some(request) = lock(&shared.sequences).request_for(sid) else {
        emit_protocol_error(shared, format!("no in-flight transaction for SID {sid}"));
        return;
    };

    match parse_response(frame, &request, shared.family, remote) {
        Ok(response) => {
            if response.end_code.is_normal() {
                debug!(sid, command = request.kind.name(), "reply");
            } else {
                warn!(
                    sid,
                    command = request.kind.name(),
                    end_code = %response.end_code,
                    "reply with abnormal end code"
                );
            }
            if let Some(completed) = lock(&shared.sequences).done(sid, response) {
                deliver_reply(shared, completed);
                lock(&shared.sequences).remove(sid);
            }
        }
        Err(error) => {
            warn!(sid, %error, "failed to decode reply");
            if let Some(completed) = lock(&shared.sequences).fail(sid) {
                deliver_failure(shared, completed, error, false);
                lock(&shared.sequences).remove(sid);
            } else {
                emit_protocol_error(shared, error.to_string());
            }
        }
    }
}

/// Timeout path, entered from a sequence's timer task.
fn expire(shared: &Arc<Shared>, sid: u8, timeout: Duration) {
    if let Some(completed) = lock(&shared.sequences).expire(sid) {
        debug!(sid, timeout_ms = timeout.as_millis() as u64, "request timed out");
        let error = FinsError::Timeout {
            sid,
            elapsed_ms: timeout.as_millis() as u64,
        };
        deliver_failure(shared, completed, error, true);
        lock(&shared.sequences).remove(sid);
    }
}

/// Delivers a completed reply: the per-call channel first, the broadcast
/// stream when the caller dropped its receiver.
fn deliver_reply(shared: &Shared, completed: Completed) {
    let Completed { report, completion } = completed;
    match completion {
        Some(sender) => {
            if let Err(Ok(report)) = sender.send(Ok(report)) {
                let _ = shared.events.send(FinsEvent::Reply(report));
            }
        }
        None => {
            let _ = shared.events.send(FinsEvent::Reply(report));
        }
    }
}

/// Delivers a terminal failure through the same two-tier channel.
fn deliver_failure(shared: &Shared, completed: Completed, error: FinsError, timed_out: bool) {
    let Completed { report, completion } = completed;
    let broadcast = |report: SequenceReport, error: FinsError| {
        if timed_out {
            let _ = shared.events.send(FinsEvent::TimedOut {
                host: shared.host.clone(),
                seq: report,
            });
        } else {
            let _ = shared.events.send(FinsEvent::Error {
                error: Arc::new(error),
                seq: Some(report),
            });
        }
    };
    match completion {
        Some(sender) => {
            if let Err(Err(error)) = sender.send(Err(error)) {
                broadcast(report, error);
            }
        }
        None => broadcast(report, error),
    }
}

fn emit_protocol_error(shared: &Shared, reason: String) {
    warn!(%reason, "protocol error");
    let _ = shared.events.send(FinsEvent::Error {
        error: Arc::new(FinsError::protocol(reason)),
        seq: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = Options::default();
        assert_eq!(options.protocol, Protocol::Udp);
        assert_eq!(options.timeout, Duration::from_millis(2000));
        assert_eq!(options.max_queue, 100);
        assert_eq!(options.family, PlcFamily::CS);
        assert_eq!(options.icf, 0x80);
    }

    #[test]
    fn test_options_header_template() {
        let header = Options::default()
            .with_source(0, 11, 0)
            .with_destination(0, 1, 0)
            .header_template();
        assert_eq!(header.sa1, 11);
        assert_eq!(header.da1, 1);
        assert_eq!(header.gct, 0x02);
        assert_eq!(header.sid, 0);
    }

    #[test]
    fn test_options_mode() {
        assert_eq!(
            Options::default().with_mode("NJNX").unwrap().family,
            PlcFamily::NX
        );
        assert!(Options::default().with_mode("Q").is_err());
    }

    #[test]
    fn test_options_max_queue_clamped_to_sid_space() {
        assert_eq!(
            Options::default().with_max_queue(4000).effective_max_queue(),
            254
        );
        assert_eq!(Options::default().with_max_queue(0).effective_max_queue(), 1);
    }

    #[test]
    fn test_advance_sid_wraps_at_254() {
        let counter = AtomicU8::new(0);
        assert_eq!(advance_sid(&counter), 1);
        assert_eq!(advance_sid(&counter), 2);
        for _ in 0..251 {
            advance_sid(&counter);
        }
        assert_eq!(advance_sid(&counter), 254);
        // SID 255 and 0 are never produced.
        assert_eq!(advance_sid(&counter), 1);
    }

    #[test]
    fn test_check_count_bounds() {
        assert!(check_count(1).is_ok());
        assert!(check_count(999).is_ok());
        assert!(check_count(0).is_err());
        assert!(check_count(1000).is_err());
    }

    #[test]
    fn test_to_u16_guards_range() {
        assert_eq!(to_u16(65535, "count").unwrap(), 65535);
        assert!(to_u16(65536, "count").is_err());
    }
}
