//! List processes on a server, optionally injecting a script into one
//!
//! Usage: `cargo run --example ps -- [host[:port]] [process-name]`
//!
//! Set `HOOKWIRE_TOKEN` to authenticate.

use hookwire::{AttachOptions, ClientBuilder, ScriptOptions};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const AGENT: &str = r#"
send({ type: "hello", pid: Process.id });
rpc.exports = { ping: () => "pong" };
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let target = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let process_name = args.next();

    let mut builder = ClientBuilder::new(&target).with_call_timeout(Duration::from_secs(10));
    if let Ok(token) = std::env::var("HOOKWIRE_TOKEN") {
        builder = builder.with_token(token);
    }
    let client = builder.connect_tcp().await?;

    let system = client.query_system_parameters().await?;
    println!("System: {}", system);

    let mut processes = client.enumerate_processes().await?;
    processes.sort_by_key(|p| p.pid);
    println!("{:>7}  NAME", "PID");
    for process in &processes {
        println!("{:>7}  {}", process.pid, process.name);
    }

    let Some(name) = process_name else {
        return Ok(());
    };
    let Some(process) = client.find_process(&name).await? else {
        anyhow::bail!("No process named {}", name);
    };

    let session = client.attach(process.pid, AttachOptions::new()).await?;
    let _detached = session.on_detached(|event| println!("Detached: {}", event.reason));

    let script = session
        .create_script(AGENT, &ScriptOptions::new().with_name("ps"))
        .await?;
    let _messages = script.on_message(|m| println!("Message: {}", m.message));
    script.load().await?;

    let reply: String = script.exports().call_as("ping", Vec::new()).await?;
    println!("ping -> {}", reply);

    script.unload().await?;
    session.detach().await;
    Ok(())
}
