//! Multithreaded echo server.
//!
//! This example demonstrates:
//! - Redirecting every method of a table to a worker thread
//! - Running the dispatch loop on the main thread
//! - Emitting a signal from the worker (`Echo` -> `Echoed`)
//! - Application errors crossing threads as error answers (`Cat`)
//!
//! ```text
//! RUST_LOG=request_piper=debug cargo run --example echo_mt
//! ```

use std::io::Read;
use std::sync::Arc;
use std::thread;

use request_piper::bus::{BusClient, Connection, Dispatcher};
use request_piper::handler::{MethodTable, Outcome};
use request_piper::protocol::{MethodError, ReturnMessage, SignalMessage};
use request_piper::{PiperContext, RequestPiper};
use tracing_subscriber::EnvFilter;

/// Error name answered by `Cat` when the file cannot be opened.
const FILE_NOT_FOUND: &str = "org.freedesktop.DBus.EchoDemo.ErrorFileNotFound";

const ECHO_PATH: &str = "/org/freedesktop/DBus/Examples/Echo";

/// Calls per client thread.
const CALLS: usize = 30;

fn echo_methods() -> MethodTable {
    let mut table = MethodTable::new();

    table.register("Hello", |(name,): (String,), _ctx| Ok(format!("Hello {}!", name)));

    table.register("Sum", |(ints,): (Vec<i32>,), _ctx| {
        Ok(ints.iter().fold(0i32, |sum, n| sum.wrapping_add(*n)))
    });

    table.register("Cat", |(path,): (String,), _ctx| {
        let mut file = std::fs::File::open(&path)
            .map_err(|_| MethodError::new(FILE_NOT_FOUND, "file not found"))?;
        let mut buf = vec![0u8; 1024];
        let n = file
            .read(&mut buf)
            .map_err(|e| MethodError::failed(e.to_string()))?;
        buf.truncate(n);
        Ok(buf)
    });

    // Echo answers with its own body and emits the same body as a signal.
    table.register_raw("Echo", |call, ctx| {
        let signal = SignalMessage::new("Echoed", call.body().clone()).path(ECHO_PATH);
        ctx.emit_signal(signal)
            .map_err(|e| MethodError::failed(e.to_string()))?;
        Ok(Outcome::Complete(
            ReturnMessage::new(call, call.body().clone()).into(),
        ))
    });

    table
}

fn spin(client: BusClient, name: &'static str) -> request_piper::Result<()> {
    for _ in 0..CALLS {
        let reply = client.call("Hello", &(name,))?;
        match reply.into_result::<String>() {
            Ok(greeting) => println!("{}: {}", name, greeting),
            Err(e) => eprintln!("{}: {}", name, e),
        }
    }
    println!("All {} calls done", name);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let dispatcher = Dispatcher::new();
    let (connection, client) = Connection::open(&dispatcher);

    let methods = echo_methods();
    let context = PiperContext::new(
        Arc::new(methods.clone()),
        connection.clone(),
        connection.clone(),
    );
    let piper = RequestPiper::new(context)?;
    connection.export(piper.redirect(&methods));
    piper.start_pipe(&dispatcher);

    let worker = {
        let piper = piper.clone();
        thread::spawn(move || piper.worker_thread())
    };

    let callers: Vec<_> = ["call1", "call2", "call3"]
        .into_iter()
        .map(|name| {
            let client = client.clone();
            thread::spawn(move || spin(client, name))
        })
        .collect();

    let leave = dispatcher.clone();
    let supervisor = thread::spawn(move || {
        let mut signals = client.subscribe();
        match client.call("Echo", &("ping",)) {
            Ok(reply) => println!("echo: {:?}", reply.into_result::<(String,)>()),
            Err(e) => eprintln!("echo failed: {}", e),
        }
        if let Ok(signal) = signals.blocking_recv() {
            println!("signal {}: {:?}", signal.member(), signal.args::<(String,)>());
        }

        match client.call("Sum", &(vec![1, 2, 3, 4],)) {
            Ok(reply) => println!("sum: {:?}", reply.into_result::<i32>()),
            Err(e) => eprintln!("sum failed: {}", e),
        }
        match client.call("Cat", &("/nonexistent",)) {
            Ok(reply) => println!("cat: {:?}", reply.into_result::<Vec<u8>>()),
            Err(e) => eprintln!("cat failed: {}", e),
        }

        for caller in callers {
            match caller.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => eprintln!("caller failed: {}", e),
                Err(_) => eprintln!("caller panicked"),
            }
        }
        leave.leave();
    });

    dispatcher.enter()?;
    piper.stop_pipe(&dispatcher);

    if supervisor.join().is_err() {
        eprintln!("supervisor panicked");
    }
    match worker.join() {
        Ok(result) => result?,
        Err(_) => eprintln!("worker panicked"),
    }
    Ok(())
}
