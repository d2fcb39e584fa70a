//! Fake instrumentation server for integration tests

#![allow(dead_code)]

use hookwire::proto::{
    Codec, ErrorReply, Message, MethodCall, MethodReturn, MsgPackCodec, Signal, Value, VariantDict,
};
use hookwire::transport::{MemoryListener, MemoryTransport};
use hookwire::{Client, ClientBuilder};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const TOKEN: &str = "secret";
pub const SESSION_ID: &str = "session-1";

/// What the server answers to a call
pub enum Reply {
    Return(Vec<Value>),
    Error(&'static str, String),
    Silent,
}

enum Command {
    Signal(Signal),
    Close,
}

type Handler = Arc<dyn Fn(&MethodCall) -> Reply + Send + Sync>;

/// Accepts client connections and answers their calls
#[derive(Clone)]
pub struct FakeServer {
    pub calls: Arc<Mutex<Vec<MethodCall>>>,
    pub connections: Arc<AtomicUsize>,
    peers: Arc<Mutex<Vec<mpsc::UnboundedSender<Command>>>>,
}

impl FakeServer {
    /// Start a server answering with [`standard_reply`] and a client pointed at it
    pub fn start(builder: ClientBuilder) -> (Client, FakeServer) {
        Self::start_with(builder, standard_reply)
    }

    pub fn start_with<F>(builder: ClientBuilder, handler: F) -> (Client, FakeServer)
    where
        F: Fn(&MethodCall) -> Reply + Send + Sync + 'static,
    {
        let (transport, listener) = MemoryTransport::new();
        let server = FakeServer {
            calls: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            peers: Arc::new(Mutex::new(Vec::new())),
        };
        tokio::spawn(server.clone().accept_loop(listener, Arc::new(handler)));

        let client = builder.build(Arc::new(transport));
        (client, server)
    }

    async fn accept_loop(self, mut listener: MemoryListener, handler: Handler) {
        while let Some(mut peer) = listener.accept().await {
            self.connections.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.peers.lock().push(tx);

            let calls = self.calls.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let codec = MsgPackCodec::new();
                let next_serial = AtomicU32::new(1);
                let serial = || next_serial.fetch_add(1, Ordering::SeqCst);
                let mut close = false;

                loop {
                    tokio::select! {
                        frame = peer.recv() => {
                            let Some(frame) = frame else { break };
                            for message in codec.decode(&frame) {
                                let Ok(Message::MethodCall(call)) = message else { continue };
                                calls.lock().push(call.clone());

                                let reply = match handler(&call) {
                                    Reply::Return(body) => Message::MethodReturn(MethodReturn {
                                        serial: serial(),
                                        reply_serial: call.serial,
                                        body,
                                    }),
                                    Reply::Error(name, message) => Message::Error(ErrorReply {
                                        serial: serial(),
                                        reply_serial: call.serial,
                                        name: name.to_string(),
                                        message,
                                    }),
                                    Reply::Silent => continue,
                                };
                                let _ = peer.send(codec.encode(&reply).unwrap());
                            }
                        }

                        command = rx.recv() => {
                            match command {
                                Some(Command::Signal(mut signal)) => {
                                    signal.serial = serial();
                                    let _ = peer.send(codec.encode(&Message::Signal(signal)).unwrap());
                                }
                                Some(Command::Close) | None => {
                                    close = true;
                                    break;
                                }
                            }
                        }
                    }
                }

                if close {
                    peer.close();
                }
            });
        }
    }

    /// Emit a signal on the most recent connection
    pub fn emit(&self, signal: Signal) {
        if let Some(peer) = self.peers.lock().last() {
            let _ = peer.send(Command::Signal(signal));
        }
    }

    /// Close every connection from the server side
    pub fn close_all(&self) {
        for peer in self.peers.lock().drain(..) {
            let _ = peer.send(Command::Close);
        }
    }

    pub fn calls_to(&self, member: &str) -> Vec<MethodCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.member == member)
            .cloned()
            .collect()
    }

    /// Wait until the server has seen `count` calls to `member`
    pub async fn wait_for_calls(&self, member: &str, count: usize) -> Vec<MethodCall> {
        wait_until(|| self.calls_to(member).len() >= count).await;
        self.calls_to(member)
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Answers of a well-behaved server with one attachable process
pub fn standard_reply(call: &MethodCall) -> Reply {
    match call.member.as_str() {
        "Authenticate" => match call.body.first().and_then(Value::as_str) {
            Some(TOKEN) => Reply::Return(vec![Value::Str("{}".to_string())]),
            _ => Reply::Error("io.hookwire.Error.InvalidArgument", "Incorrect token".to_string()),
        },
        "EnumerateProcesses" => Reply::Return(vec![Value::Array(vec![
            process(1, "init"),
            process(1234, "target"),
        ])]),
        "QuerySystemParameters" => Reply::Return(vec![VariantDict::new()
            .with("os", "linux")
            .with("arch", "x64")
            .into_value()]),
        "Attach" => match call.body.first().and_then(Value::as_u32) {
            Some(0) => Reply::Error(
                "io.hookwire.Error.ProcessNotFound",
                "Unable to find process with pid 0".to_string(),
            ),
            _ => Reply::Return(vec![Value::Struct(vec![Value::Str(SESSION_ID.to_string())])]),
        },
        "CreateScript" => Reply::Return(vec![Value::Struct(vec![Value::U32(1)])]),
        "Resume" => Reply::Return(vec![Value::U32(0)]),
        "LoadScript" | "DestroyScript" | "Close" | "PostMessages" => Reply::Return(Vec::new()),
        other => Reply::Error(
            "org.freedesktop.DBus.Error.UnknownMethod",
            format!("Unknown method {}", other),
        ),
    }
}

fn process(pid: u32, name: &str) -> Value {
    Value::Struct(vec![
        Value::U32(pid),
        Value::Str(name.to_string()),
        VariantDict::new().into_value(),
    ])
}
