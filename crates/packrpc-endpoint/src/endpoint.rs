use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use packrpc_codec::Value;
use packrpc_frame::{
    pack, pack_content, Deframer, DeframerStats, FrameConfig, FrameError, Packet, PacketWriter,
    MAX_REQUEST_TYPE_ID,
};
use packrpc_transport::RpcStream;
use tracing::{debug, warn};

use crate::correlator::Correlator;
use crate::error::{Result, RpcError};
use crate::registry::{HandlerTable, MethodTable};

const DEFAULT_READ_CHUNK_SIZE: usize = 8 * 1024;
const DEFAULT_NON_BLOCKING_EXPIRY: Duration = Duration::from_secs(60);

/// Outbound half of a connection. Each call writes exactly one frame.
pub trait Transport: Send {
    fn send_frame(&mut self, frame: &[u8]) -> packrpc_frame::Result<()>;
}

impl<W: Write + Send> Transport for PacketWriter<W> {
    fn send_frame(&mut self, frame: &[u8]) -> packrpc_frame::Result<()> {
        PacketWriter::send_frame(self, frame)
    }
}

/// Per-call behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Suspend the caller until the response arrives.
    pub blocking: bool,
    /// Allocate a request id so the peer answers.
    pub expects_response: bool,
    /// Intended for many endpoints; never expects a response.
    pub broadcast: bool,
    /// Give up waiting after this long. Falls back to
    /// [`EndpointConfig::default_expiry`].
    pub expiry: Option<Duration>,
}

impl CallOptions {
    pub const fn blocking() -> Self {
        Self {
            blocking: true,
            expects_response: true,
            broadcast: false,
            expiry: None,
        }
    }

    /// Send with a request id but return without waiting. The response
    /// still clears the pending record when it arrives.
    pub const fn non_blocking() -> Self {
        Self {
            blocking: false,
            expects_response: true,
            broadcast: false,
            expiry: None,
        }
    }

    pub const fn fire_and_forget() -> Self {
        Self {
            blocking: false,
            expects_response: false,
            broadcast: false,
            expiry: None,
        }
    }

    pub const fn broadcast() -> Self {
        Self {
            blocking: false,
            expects_response: false,
            broadcast: true,
            expiry: None,
        }
    }

    pub const fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.broadcast && self.expects_response {
            return Err(RpcError::InvalidOptions(
                "broadcast calls cannot expect a response",
            ));
        }
        if self.blocking && !self.expects_response {
            return Err(RpcError::InvalidOptions(
                "blocking calls must expect a response",
            ));
        }
        Ok(())
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self::blocking()
    }
}

/// Endpoint behavior config.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Limits and timeouts for the frame layer.
    pub frame: FrameConfig,
    /// Expiry for calls that do not set their own.
    pub default_expiry: Option<Duration>,
    /// Expiry for non-blocking calls when neither the call nor
    /// `default_expiry` sets one. Nobody waits on these records, so without
    /// a deadline an unanswered call would stay pending forever.
    pub non_blocking_expiry: Duration,
    /// Read buffer size of the reader thread.
    pub read_chunk_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            default_expiry: None,
            non_blocking_expiry: DEFAULT_NON_BLOCKING_EXPIRY,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }
}

/// Handle returned by [`Endpoint::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Packet) + Send + Sync>;

struct Inner {
    config: EndpointConfig,
    transport: Mutex<Option<Box<dyn Transport>>>,
    // Bumped on every attach; guarded by the transport lock.
    generation: AtomicU64,
    correlator: Correlator,
    handlers: RwLock<Option<Arc<HandlerTable>>>,
    methods: RwLock<Arc<MethodTable>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener_id: AtomicU64,
    deframer: Mutex<Deframer>,
    stream: Mutex<Option<RpcStream>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One side of an RPC connection.
///
/// Inbound bytes go through [`feed`](Self::feed): responses wake the
/// matching caller, requests run the registered handler. Outbound calls may
/// come from any thread. Clones share the same connection.
///
/// Handlers run on the thread that feeds bytes, normally the reader thread.
/// A handler that makes a blocking call over the same endpoint waits for a
/// response only that thread could deliver.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<Inner>,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        let deframer = Deframer::with_config(&config.frame);
        Self {
            inner: Arc::new(Inner {
                config,
                transport: Mutex::new(None),
                generation: AtomicU64::new(0),
                correlator: Correlator::new(),
                handlers: RwLock::new(None),
                methods: RwLock::new(Arc::new(MethodTable::new())),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                deframer: Mutex::new(deframer),
                stream: Mutex::new(None),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    /// Install the handler table used for inbound requests.
    pub fn bind_handlers(&self, handlers: impl Into<Arc<HandlerTable>>) {
        *self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handlers.into());
    }

    /// Remove the handler table. Inbound requests are dropped until a new
    /// one is bound.
    pub fn unbind_handlers(&self) -> Option<Arc<HandlerTable>> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Install the method table used by [`invoke`](Self::invoke).
    pub fn set_methods(&self, methods: impl Into<Arc<MethodTable>>) {
        *self
            .inner
            .methods
            .write()
            .unwrap_or_else(|e| e.into_inner()) = methods.into();
    }

    pub fn methods(&self) -> Arc<MethodTable> {
        Arc::clone(&self.inner.methods.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Attach the outbound transport, replacing any previous one.
    pub fn attach(&self, transport: impl Transport + 'static) {
        let mut slot = lock(&self.inner.transport);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        *slot = Some(Box::new(transport));
    }

    /// Drop the outbound transport and interrupt every blocked call.
    pub fn detach(&self) -> Option<Box<dyn Transport>> {
        let transport = lock(&self.inner.transport).take();
        self.inner.correlator.interrupt_all();
        transport
    }

    /// Detach only if no newer transport was attached since `generation`.
    fn detach_if_current(&self, generation: u64) {
        let transport = {
            let mut slot = lock(&self.inner.transport);
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                debug!("reader of a replaced stream exited");
                return;
            }
            slot.take()
        };
        drop(transport);
        self.inner.correlator.interrupt_all();
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.transport).is_some()
    }

    /// Attach both halves of `stream`: writes go through a
    /// [`PacketWriter`], reads are fed by a new reader thread.
    ///
    /// A previously attached stream is shut down and its reader joined
    /// first; calls pending on it are interrupted.
    pub fn attach_stream(&self, stream: RpcStream) -> Result<()> {
        let reader = stream.try_clone()?;
        let shutdown = stream.try_clone()?;
        let writer = PacketWriter::with_config_stream(stream, self.inner.config.frame.clone())?;
        reader.set_read_timeout(self.inner.config.frame.read_timeout)?;

        self.release_stream();
        self.detach();
        lock(&self.inner.deframer).reset();
        self.attach(writer);
        *lock(&self.inner.stream) = Some(shutdown);
        let handle = self.spawn_reader(reader)?;
        *lock(&self.inner.reader) = Some(handle);
        Ok(())
    }

    /// Feed everything read from `reader` into this endpoint on a new
    /// thread. On EOF or a read error the endpoint is detached.
    ///
    /// Read timeouts are not errors: they give the thread a chance to
    /// expire overdue calls.
    pub fn spawn_reader<R>(&self, mut reader: R) -> Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
    {
        let endpoint = self.clone();
        let chunk_size = self.inner.config.read_chunk_size.max(1);
        let generation = self.inner.generation.load(Ordering::SeqCst);

        let handle = std::thread::Builder::new()
            .name("packrpc-reader".to_string())
            .spawn(move || {
                let mut chunk = vec![0u8; chunk_size];
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) => {
                            debug!("peer closed the stream");
                            break;
                        }
                        Ok(n) => endpoint.feed(&chunk[..n]),
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err)
                            if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                        Err(err) => {
                            debug!(error = %err, "reader stopped");
                            break;
                        }
                    }
                    endpoint.inner.correlator.sweep_expired();
                }
                endpoint.detach_if_current(generation);
            })?;
        Ok(handle)
    }

    /// Shut the connection down: close the stream, interrupt blocked calls
    /// and wait for the reader thread.
    pub fn close(&self) {
        self.detach();
        self.release_stream();
    }

    /// Shut down the attached stream and join its reader thread, unless
    /// called from that thread.
    fn release_stream(&self) {
        if let Some(stream) = lock(&self.inner.stream).take() {
            if let Err(err) = stream.shutdown() {
                debug!(error = %err, "stream shutdown failed");
            }
        }

        let reader = lock(&self.inner.reader).take();
        if let Some(handle) = reader {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("reader thread panicked");
            }
        }
    }

    /// Feed inbound bytes. Packets are delivered in arrival order after the
    /// deframer lock is released, so handlers may call back into the
    /// endpoint.
    pub fn feed(&self, data: &[u8]) {
        let packets = lock(&self.inner.deframer).feed(data);
        for packet in packets {
            self.deliver(packet);
        }
    }

    /// Counters from the inbound deframer.
    pub fn stats(&self) -> DeframerStats {
        lock(&self.inner.deframer).stats()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Wake every blocked call with [`RpcError::Interrupted`].
    pub fn interrupt_pending(&self) -> usize {
        self.inner.correlator.interrupt_all()
    }

    /// Observe every inbound packet, before it is resolved or dispatched.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.inner.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn deliver(&self, packet: Packet) {
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &listeners {
            listener(&packet);
        }

        if packet.is_response {
            self.inner
                .correlator
                .resolve(packet.request_id, packet.content);
        } else {
            self.dispatch(packet);
        }
    }

    fn dispatch(&self, packet: Packet) {
        let Packet {
            request_type_id: type_id,
            request_id,
            content,
            ..
        } = packet;

        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(handler) = handlers.as_deref().and_then(|table| table.lookup(type_id)) else {
            warn!(type_id, request_id, "no handler registered; dropping request");
            return;
        };

        let reply = match handler.invoke(type_id, content) {
            Ok(value) => value,
            Err(err) => {
                warn!(type_id, request_id, error = %err, "handler failed");
                Value::Null
            }
        };

        if handler.no_respond() || request_id == 0 {
            return;
        }
        if let Err(err) = self.respond(type_id, request_id, &reply) {
            warn!(type_id, request_id, error = %err, "failed to send response");
        }
    }

    fn respond(&self, type_id: u16, request_id: u32, reply: &Value) -> Result<()> {
        let frame = match self.encode_frame(true, type_id, request_id, reply) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(type_id, request_id, error = %err, "unencodable handler result; responding with null");
                pack(true, type_id, request_id, &Value::Null)?
            }
        };
        self.send_frame(&frame)
    }

    fn encode_frame(
        &self,
        is_response: bool,
        type_id: u16,
        request_id: u32,
        content: &Value,
    ) -> Result<Bytes> {
        let body = self.encode_content(content)?;
        let mut frame = BytesMut::new();
        pack_content(is_response, type_id, request_id, &body, &mut frame)?;
        Ok(frame.freeze())
    }

    fn encode_content(&self, content: &Value) -> Result<BytesMut> {
        let mut body = BytesMut::new();
        if !content.is_null() {
            packrpc_codec::generate_into(content, &mut body)?;
        }
        let max = self.inner.config.frame.max_content_size;
        if body.len() > max {
            return Err(FrameError::ContentTooLarge {
                size: body.len(),
                max,
            }
            .into());
        }
        Ok(body)
    }

    fn send_frame(&self, frame: &[u8]) -> Result<()> {
        let mut transport = lock(&self.inner.transport);
        let transport = transport.as_mut().ok_or(RpcError::NotConnected)?;
        transport.send_frame(frame).map_err(|err| {
            warn!(error = %err, "transport write failed");
            RpcError::from(err)
        })
    }

    /// Issue a call.
    ///
    /// Returns `Some(response)` for blocking calls and `None` otherwise.
    /// `NotConnected`, encoding and option errors are reported before a
    /// request id is consumed.
    pub fn call(&self, type_id: u16, args: Value, options: &CallOptions) -> Result<Option<Value>> {
        options.validate()?;
        if type_id > MAX_REQUEST_TYPE_ID {
            return Err(FrameError::FieldOutOfRange {
                field: "request_type_id",
                value: u64::from(type_id),
                max: u64::from(MAX_REQUEST_TYPE_ID),
            }
            .into());
        }
        let body = self.encode_content(&args)?;

        if !options.expects_response {
            let mut frame = BytesMut::new();
            pack_content(false, type_id, 0, &body, &mut frame)?;
            self.send_frame(&frame)?;
            return Ok(None);
        }

        let mut expiry = options.expiry.or(self.inner.config.default_expiry);
        if !options.blocking {
            expiry = expiry.or(Some(self.inner.config.non_blocking_expiry));
        }
        let pending = {
            let mut transport = lock(&self.inner.transport);
            let transport = transport.as_mut().ok_or(RpcError::NotConnected)?;

            let pending = self.inner.correlator.register(expiry);
            let mut frame = BytesMut::new();
            let sent = pack_content(false, type_id, pending.request_id(), &body, &mut frame)
                .and_then(|()| transport.send_frame(&frame));
            if let Err(err) = sent {
                self.inner.correlator.cancel(pending.request_id());
                warn!(type_id, error = %err, "failed to send request");
                return Err(err.into());
            }
            pending
        };

        if !options.blocking {
            return Ok(None);
        }
        self.inner.correlator.wait(&pending).map(Some)
    }

    /// Blocking call that waits for the peer's response.
    pub fn send_request(&self, type_id: u16, args: Value) -> Result<Value> {
        let value = self.call(type_id, args, &CallOptions::blocking())?;
        Ok(value.unwrap_or_default())
    }

    /// One-way call with request id 0.
    pub fn send_fire_and_forget(&self, type_id: u16, args: Value) -> Result<()> {
        self.call(type_id, args, &CallOptions::fire_and_forget())
            .map(|_| ())
    }

    /// Call a method by name through the method table.
    pub fn invoke(
        &self,
        interface: &str,
        method: &str,
        args: Value,
        options: &CallOptions,
    ) -> Result<Option<Value>> {
        let type_id = self.methods().resolve(interface, method)?;
        self.call(type_id, args, options)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(EndpointConfig::default())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("connected", &self.is_connected())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Send one fire-and-forget frame to every connected endpoint.
///
/// The frame is packed once. Endpoints without a transport, or whose write
/// fails, are skipped. Returns how many endpoints the frame reached.
pub fn broadcast(endpoints: &[Endpoint], type_id: u16, args: &Value) -> Result<usize> {
    let frame = pack(false, type_id, 0, args)?;

    let mut delivered = 0;
    for endpoint in endpoints {
        match endpoint.send_frame(&frame) {
            Ok(()) => delivered += 1,
            Err(RpcError::NotConnected) => debug!("skipping disconnected endpoint"),
            Err(err) => warn!(error = %err, "broadcast to endpoint failed"),
        }
    }
    Ok(delivered)
}
