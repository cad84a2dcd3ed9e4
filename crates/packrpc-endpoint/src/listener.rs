use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use packrpc_transport::UnixDomainSocket;
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointConfig};
use crate::error::Result;
use crate::registry::{HandlerTable, MethodTable};

/// Listens for and accepts endpoint connections.
///
/// Every accepted endpoint shares the listener's handler and method tables
/// and gets its own reader thread.
pub struct EndpointListener {
    socket: UnixDomainSocket,
    config: EndpointConfig,
    handlers: Option<Arc<HandlerTable>>,
    methods: Arc<MethodTable>,
    accepted: AtomicU64,
}

impl EndpointListener {
    /// Bind to a Unix domain socket path.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let socket = UnixDomainSocket::bind(path)?;
        Ok(Self {
            socket,
            config: EndpointConfig::default(),
            handlers: None,
            methods: Arc::new(MethodTable::new()),
            accepted: AtomicU64::new(0),
        })
    }

    /// Override endpoint config for accepted connections.
    pub fn with_config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve inbound requests with `handlers`.
    pub fn with_handlers(mut self, handlers: impl Into<Arc<HandlerTable>>) -> Self {
        self.handlers = Some(handlers.into());
        self
    }

    /// Method names available to [`Endpoint::invoke`] on accepted endpoints.
    pub fn with_methods(mut self, methods: impl Into<Arc<MethodTable>>) -> Self {
        self.methods = methods.into();
        self
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<Endpoint> {
        let stream = self.socket.accept()?;
        let endpoint = Endpoint::new(self.config.clone());
        if let Some(handlers) = &self.handlers {
            endpoint.bind_handlers(Arc::clone(handlers));
        }
        endpoint.set_methods(Arc::clone(&self.methods));
        endpoint.attach_stream(stream)?;

        let count = self.accepted.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(path = ?self.socket.path(), count, "endpoint connected");
        Ok(endpoint)
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Bound socket path.
    pub fn path(&self) -> &Path {
        self.socket.path()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;
    use std::time::Duration;

    use packrpc_codec::Value;

    use super::*;
    use crate::connector::connect_with;
    use crate::endpoint::CallOptions;

    fn make_sock_path(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!(
            "/tmp/packrpc-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir.join("listener.sock")
    }

    fn wait_until_disconnected(endpoint: &Endpoint) {
        while endpoint.is_connected() {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn accept_serves_several_clients() {
        let sock_path = make_sock_path("accept");
        let mut handlers = HandlerTable::new();
        handlers
            .register(1, |args| {
                let count = args.as_list().map_or(0, <[Value]>::len);
                Ok(vec![Value::Long(count as i64)].into())
            })
            .expect("handler should register");

        let listener = EndpointListener::bind(&sock_path)
            .expect("listener should bind")
            .with_handlers(handlers);
        assert_eq!(listener.path(), sock_path.as_path());

        let server = thread::spawn(move || {
            let served: Vec<Endpoint> = (0..2)
                .map(|_| listener.accept().expect("listener should accept"))
                .collect();
            for endpoint in &served {
                wait_until_disconnected(endpoint);
                endpoint.close();
            }
            listener.accepted()
        });

        for size in [1usize, 3] {
            let client = connect_with(&sock_path, Endpoint::default()).expect("connect");
            let args: Value = (0..size).map(|i| Value::Int(i as i32)).collect();
            let reply = client.send_request(1, args).expect("call should succeed");
            assert_eq!(reply, Value::List(vec![Value::Long(size as i64)]));
            client.close();
        }

        assert_eq!(server.join().expect("server thread"), 2);
        let _ = std::fs::remove_dir_all(sock_path.parent().expect("socket has a parent"));
    }

    #[test]
    fn accepted_endpoint_can_call_the_client() {
        let sock_path = make_sock_path("reverse");
        let listener = EndpointListener::bind(&sock_path).expect("listener should bind");

        let mut methods = MethodTable::new();
        methods.insert("Client", "hello", 2).expect("method");
        let listener = listener.with_methods(methods);

        let server = thread::spawn(move || {
            let endpoint = listener.accept().expect("listener should accept");
            let reply = endpoint
                .invoke(
                    "Client",
                    "hello",
                    vec![Value::from("server")].into(),
                    &CallOptions::blocking(),
                )
                .expect("reverse call should succeed");
            endpoint.close();
            reply
        });

        let mut client_handlers = HandlerTable::new();
        client_handlers
            .register(2, |_| Ok(vec![Value::from("client")].into()))
            .expect("handler should register");
        let client = Endpoint::default();
        client.bind_handlers(client_handlers);
        let client = connect_with(&sock_path, client).expect("connect");

        let reply = server.join().expect("server thread");
        assert_eq!(reply, Some(Value::List(vec![Value::from("client")])));

        wait_until_disconnected(&client);
        client.close();
        let _ = std::fs::remove_dir_all(sock_path.parent().expect("socket has a parent"));
    }
}
